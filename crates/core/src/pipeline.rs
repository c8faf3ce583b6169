//! The two-stage forward pass: illumination compensation → chroma prediction.
//!
//! ```text
//! image ──ycbcr──► Y_in, Cb_in, Cr_in
//!   Y_in ──↓½ bicubic──► illumination net ──↑ bicubic──► L (frozen, detached)
//!   image / max(L, eps) ──ycbcr──► Cb_en, Cr_en
//! target ──ycbcr──► Y_gt, Cb_gt, Cr_gt
//! [Y_in, Cb_in, Cr_in, Y_gt, Cb_en, Cr_en] ──colour net──► Cb, Cr
//! output = rgb(Y_gt, Cb, Cr)
//! ```
//!
//! Losses: `L1(Cb, Cb_gt)`, `L1(Cr, Cr_gt)` and the MS-SSIM/L1 mix between
//! `output` and `target`. PSNR and SSIM are reported on detached tensors.
//!
//! The pass is a pure function of its arguments and the current network
//! parameters; training vs. evaluation behaviour is selected by [`Mode`].

use candle_core::{Device, Tensor};

use canet_common::RunConfig;

use crate::color::{rgb_to_ycbcr, split_channels, ycbcr_to_rgb};
use crate::loss::{l1_loss, MsSsimL1Loss, DEFAULT_MS_SSIM_ALPHA};
use crate::model::Network;
use crate::quality::{mse, psnr_from_mse, ssim};
use crate::resample::{rescale_bicubic, resize_bicubic};

/// Channel contract of the illumination network.
pub const ILLUMINATION_CHANNELS: (usize, usize) = (1, 1);
/// Channel contract of the colour-adjustment network.
pub const COLOR_CHANNELS: (usize, usize) = (6, 2);

/// How a batch is interpreted and whether the colour net is differentiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Input is crop-grouped `[B, K, 3, h, w]`; outputs keep the graph.
    Train,
    /// Input is `[B, 3, H, W]`; every output is detached.
    Eval,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Floor applied to the illumination map before division.
    pub eps: f64,
    /// Weight of the reconstruction loss in the total.
    pub reconstruction_weight: f64,
    /// MS-SSIM share of the reconstruction loss.
    pub ms_ssim_alpha: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            eps: 1e-2,
            reconstruction_weight: 1.0,
            ms_ssim_alpha: DEFAULT_MS_SSIM_ALPHA,
        }
    }
}

impl PipelineConfig {
    pub fn from_run_config(config: &RunConfig) -> Self {
        Self {
            eps: config.illumination_eps,
            ..Default::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("training input must be crop-grouped [B, K, 3, H, W], got {0:?}")]
    MissingCropGroup(Vec<usize>),
    #[error("input {input:?} does not match target {target:?}")]
    ShapeMismatch {
        input: Vec<usize>,
        target: Vec<usize>,
    },
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

/// Everything one forward pass produces.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Reconstructed RGB image `[N, 3, H, W]`.
    pub image: Tensor,
    pub chroma_loss_1: Tensor,
    pub chroma_loss_2: Tensor,
    pub reconstruction_loss: Tensor,
    pub psnr: f64,
    pub ssim: f64,
    /// Mean squared error behind `psnr`; lets shard results be merged exactly.
    pub mse: f64,
}

impl ForwardOutput {
    /// `chroma_loss_1 + chroma_loss_2 + reconstruction_loss`.
    pub fn total_loss(&self) -> candle_core::Result<Tensor> {
        ((&self.chroma_loss_1 + &self.chroma_loss_2)? + &self.reconstruction_loss)
    }
}

/// Clamp an illumination map from below so it is always a safe divisor.
pub fn clamp_illumination(illumination: &Tensor, eps: f64) -> candle_core::Result<Tensor> {
    illumination.maximum(eps)
}

/// `image / max(illumination, eps)`, broadcasting the single-channel map.
pub fn compensate(image: &Tensor, illumination: &Tensor, eps: f64) -> candle_core::Result<Tensor> {
    image.broadcast_div(&clamp_illumination(illumination, eps)?)
}

/// Owns both networks and the reconstruction loss.
pub struct ForwardPipeline {
    illumination: Network,
    color: Network,
    reconstruction: MsSsimL1Loss,
    config: PipelineConfig,
}

impl ForwardPipeline {
    /// `illumination` is treated as frozen: its output is always detached and
    /// its variables are never exposed for optimisation.
    pub fn new(
        illumination: Network,
        color: Network,
        config: PipelineConfig,
        device: &Device,
    ) -> candle_core::Result<Self> {
        let reconstruction = MsSsimL1Loss::new(config.ms_ssim_alpha, device)?;
        Ok(Self {
            illumination,
            color,
            reconstruction,
            config,
        })
    }

    pub fn illumination(&self) -> &Network {
        &self.illumination
    }

    pub fn color(&self) -> &Network {
        &self.color
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Unwrap the crop group and replicate the target per crop (training),
    /// or check that input and target already line up (evaluation).
    pub fn align(
        image: &Tensor,
        image_gt: &Tensor,
        mode: Mode,
    ) -> Result<(Tensor, Tensor), PipelineError> {
        let (image, image_gt) = match mode {
            Mode::Train => {
                let (b, k, c, h, w) = image
                    .dims5()
                    .map_err(|_| PipelineError::MissingCropGroup(image.dims().to_vec()))?;
                let image = image.reshape((b * k, c, h, w))?;
                let image_gt = replicate_target(image_gt, k)?;
                (image, image_gt)
            }
            Mode::Eval => {
                let image = if image.rank() == 5 && image.dim(0)? == 1 {
                    image.squeeze(0)?
                } else {
                    image.clone()
                };
                (image, image_gt.clone())
            }
        };
        if image.dims() != image_gt.dims() || image.rank() != 4 {
            return Err(PipelineError::ShapeMismatch {
                input: image.dims().to_vec(),
                target: image_gt.dims().to_vec(),
            });
        }
        Ok((image, image_gt))
    }

    /// Full-resolution illumination map for a luma plane `[N, 1, H, W]`.
    ///
    /// The network runs at half resolution; the result is resized back to
    /// exactly `H × W` and detached.
    pub fn estimate_illumination(&self, luma: &Tensor) -> candle_core::Result<Tensor> {
        let (_, _, h, w) = luma.dims4()?;
        let low = rescale_bicubic(luma, 0.5)?;
        let illumination = self.illumination.forward(&low)?;
        Ok(resize_bicubic(&illumination, h, w)?.detach())
    }

    /// [`align`](Self::align) followed by [`forward_aligned`](Self::forward_aligned).
    pub fn forward(
        &self,
        image: &Tensor,
        image_gt: &Tensor,
        mode: Mode,
    ) -> Result<ForwardOutput, PipelineError> {
        let (image, image_gt) = Self::align(image, image_gt, mode)?;
        self.forward_aligned(&image, &image_gt, mode)
    }

    /// Forward pass on inputs that already have matching `[N, 3, H, W]` shapes.
    pub fn forward_aligned(
        &self,
        image: &Tensor,
        image_gt: &Tensor,
        mode: Mode,
    ) -> Result<ForwardOutput, PipelineError> {
        let (y_in, cb_in, cr_in) = split_channels(&rgb_to_ycbcr(image)?)?;

        let illumination = self.estimate_illumination(&y_in)?;
        let enhanced = compensate(image, &illumination, self.config.eps)?;
        let (_, cb_en, cr_en) = split_channels(&rgb_to_ycbcr(&enhanced)?)?;

        let (y_gt, cb_gt, cr_gt) = split_channels(&rgb_to_ycbcr(image_gt)?)?;

        let features = Tensor::cat(&[&y_in, &cb_in, &cr_in, &y_gt, &cb_en, &cr_en], 1)?;
        let colors = self.color.forward(&features)?;
        let colors = match mode {
            Mode::Train => colors,
            Mode::Eval => colors.detach(),
        };
        if colors.dim(1)? != COLOR_CHANNELS.1 {
            return Err(PipelineError::ShapeMismatch {
                input: colors.dims().to_vec(),
                target: cb_gt.dims().to_vec(),
            });
        }
        let cb = colors.narrow(1, 0, 1)?;
        let cr = colors.narrow(1, 1, 1)?;

        let chroma_loss_1 = l1_loss(&cb, &cb_gt)?;
        let chroma_loss_2 = l1_loss(&cr, &cr_gt)?;

        let output = ycbcr_to_rgb(&Tensor::cat(&[&y_gt, &cb, &cr], 1)?)?;
        let reconstruction_loss = self
            .reconstruction
            .forward(&output, image_gt)?
            .affine(self.config.reconstruction_weight, 0.0)?;

        let mse = mse(&output, image_gt)?;
        let ssim = ssim(&output, image_gt)?;
        Ok(ForwardOutput {
            image: output,
            chroma_loss_1,
            chroma_loss_2,
            reconstruction_loss,
            psnr: psnr_from_mse(mse),
            ssim,
            mse,
        })
    }
}

/// `[B, 3, H, W]` → `[B·K, 3, H, W]`, each target repeated `k` times in a row.
pub fn replicate_target(image_gt: &Tensor, k: usize) -> Result<Tensor, PipelineError> {
    let (b, c, h, w) = image_gt.dims4().map_err(|_| PipelineError::ShapeMismatch {
        input: vec![k],
        target: image_gt.dims().to_vec(),
    })?;
    Ok(image_gt
        .unsqueeze(1)?
        .repeat((1, k, 1, 1, 1))?
        .reshape((b * k, c, h, w))?)
}
