//! RGB ↔ YCbCr (BT.601, full range, chroma centred on 0.5).
//!
//! ```text
//! Y  = Kr·R + Kg·G + Kb·B
//! Cb = (B − Y) / (2·(1 − Kb)) + 0.5
//! Cr = (R − Y) / (2·(1 − Kr)) + 0.5
//! ```
//!
//! The inverse is derived from the same coefficients, so
//! `ycbcr_to_rgb(rgb_to_ycbcr(x)) == x` up to f32 rounding.

use candle_core::{Result, Tensor};

const KR: f64 = 0.299;
const KG: f64 = 0.587;
const KB: f64 = 0.114;
const CHROMA_OFFSET: f64 = 0.5;

/// `2·(1 − Kb)`: Cb span.
const CB_SPAN: f64 = 2.0 * (1.0 - KB);
/// `2·(1 − Kr)`: Cr span.
const CR_SPAN: f64 = 2.0 * (1.0 - KR);

/// Split a `[B, 3, H, W]` tensor into three `[B, 1, H, W]` planes.
pub fn split_channels(image: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
    let c = image.dim(1)?;
    if c != 3 {
        candle_core::bail!("expected 3 channels, got {c} (shape {:?})", image.dims());
    }
    Ok((
        image.narrow(1, 0, 1)?,
        image.narrow(1, 1, 1)?,
        image.narrow(1, 2, 1)?,
    ))
}

/// `[B, 3, H, W]` RGB → `[B, 3, H, W]` YCbCr.
pub fn rgb_to_ycbcr(image: &Tensor) -> Result<Tensor> {
    let (r, g, b) = split_channels(image)?;
    let y = ((r.affine(KR, 0.0)? + g.affine(KG, 0.0)?)? + b.affine(KB, 0.0)?)?;
    let cb = (b - &y)?.affine(1.0 / CB_SPAN, CHROMA_OFFSET)?;
    let cr = (r - &y)?.affine(1.0 / CR_SPAN, CHROMA_OFFSET)?;
    Tensor::cat(&[y, cb, cr], 1)
}

/// `[B, 3, H, W]` YCbCr → `[B, 3, H, W]` RGB.
pub fn ycbcr_to_rgb(image: &Tensor) -> Result<Tensor> {
    let (y, cb, cr) = split_channels(image)?;
    let r = (&y + cr.affine(CR_SPAN, -CHROMA_OFFSET * CR_SPAN)?)?;
    let b = (&y + cb.affine(CB_SPAN, -CHROMA_OFFSET * CB_SPAN)?)?;
    let g = ((y - r.affine(KR, 0.0)?)? - b.affine(KB, 0.0)?)?.affine(1.0 / KG, 0.0)?;
    Tensor::cat(&[r, g, b], 1)
}
