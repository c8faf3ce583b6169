//! # canet-core — image math and the two-stage network
//!
//! Everything that touches pixels lives in this crate:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`color`] | RGB ↔ YCbCr (BT.601) with an exact inverse |
//! | [`resample`] | bicubic resize / rescale as separable matmuls |
//! | [`quality`] | MSE, PSNR, SSIM |
//! | [`loss`] | L1 and the MS-SSIM + Gaussian-L1 reconstruction loss |
//! | [`checkpoint`] | safetensors save, strict name/shape-checked load |
//! | [`model`] | `ModelRegistry`, `Network`, reference architectures |
//! | [`pipeline`] | `ForwardPipeline`: illumination compensation → chroma prediction |
//!
//! ## Design principles
//!
//! 1. **Pure Rust hot path.** Everything goes through `candle-core`/`candle-nn`.
//! 2. **Explicit mode.** Training vs. evaluation is an argument, not hidden state.
//! 3. **Strict weights.** A checkpoint either matches a network exactly or is rejected.

pub mod checkpoint;
pub mod color;
pub mod loss;
pub mod model;
pub mod pipeline;
pub mod quality;
pub mod resample;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use checkpoint::{LoadError, WeightMismatch};
pub use color::{rgb_to_ycbcr, ycbcr_to_rgb};
pub use loss::{l1_loss, MsSsimL1Loss};
pub use model::{ModelRegistry, Network, ParameterInfo, RegistryError};
pub use pipeline::{
    ForwardOutput, ForwardPipeline, Mode, PipelineConfig, PipelineError, COLOR_CHANNELS,
    ILLUMINATION_CHANNELS,
};
pub use quality::{psnr, psnr_from_mse, ssim};
pub use resample::{rescale_bicubic, resize_bicubic};
