//! Bicubic resampling expressed as two matrix products.
//!
//! Resizing `[N, C, H, W]` → `[N, C, H', W']` is `Rh · X · Rwᵀ` per plane,
//! where `Rh: [H', H]` and `Rw: [W', W]` hold the cubic-convolution weights
//! (Keys kernel, `a = −0.75`, align-corners sampling, clamped borders).
//! Everything is built from `matmul`, so gradients flow through both
//! directions of the resize.

use candle_core::{Device, Result, Tensor};

/// Keys cubic-convolution parameter.
const CUBIC_A: f64 = -0.75;

fn cubic_near(x: f64) -> f64 {
    ((CUBIC_A + 2.0) * x - (CUBIC_A + 3.0)) * x * x + 1.0
}

fn cubic_far(x: f64) -> f64 {
    ((CUBIC_A * x - 5.0 * CUBIC_A) * x + 8.0 * CUBIC_A) * x - 4.0 * CUBIC_A
}

/// `[out_len, in_len]` interpolation matrix. Every row sums to 1.
fn cubic_matrix(in_len: usize, out_len: usize, device: &Device) -> Result<Tensor> {
    let scale = if out_len > 1 {
        (in_len as f64 - 1.0) / (out_len as f64 - 1.0)
    } else {
        0.0
    };
    let last = in_len as isize - 1;
    let mut weights = vec![0f32; out_len * in_len];
    for o in 0..out_len {
        let src = o as f64 * scale;
        let base = src.floor();
        let t = src - base;
        let taps = [
            cubic_far(t + 1.0),
            cubic_near(t),
            cubic_near(1.0 - t),
            cubic_far(2.0 - t),
        ];
        for (k, w) in taps.iter().enumerate() {
            let i = (base as isize - 1 + k as isize).clamp(0, last) as usize;
            weights[o * in_len + i] += *w as f32;
        }
    }
    Tensor::from_vec(weights, (out_len, in_len), device)
}

/// Resize `[N, C, H, W]` to `[N, C, out_h, out_w]` with bicubic weights.
pub fn resize_bicubic(x: &Tensor, out_h: usize, out_w: usize) -> Result<Tensor> {
    let (n, c, h, w) = x.dims4()?;
    if (h, w) == (out_h, out_w) {
        return Ok(x.clone());
    }
    if out_h == 0 || out_w == 0 || h == 0 || w == 0 {
        candle_core::bail!("cannot resize {:?} to {out_h}x{out_w}", x.dims());
    }
    let rh = cubic_matrix(h, out_h, x.device())?.to_dtype(x.dtype())?;
    let rw = cubic_matrix(w, out_w, x.device())?.to_dtype(x.dtype())?;

    // Width pass: [N·C·H, W] · Rwᵀ → [N·C·H, W'].
    let rows = x.contiguous()?.reshape((n * c * h, w))?.matmul(&rw.t()?)?;
    // Height pass on the transposed planes: [N·C·W', H] · Rhᵀ → [N·C·W', H'].
    let cols = rows
        .reshape((n * c, h, out_w))?
        .transpose(1, 2)?
        .contiguous()?
        .reshape((n * c * out_w, h))?
        .matmul(&rh.t()?)?;
    cols.reshape((n * c, out_w, out_h))?
        .transpose(1, 2)?
        .contiguous()?
        .reshape((n, c, out_h, out_w))
}

/// Resize by a scale factor; output size is `floor(len · factor)`, at least 1.
pub fn rescale_bicubic(x: &Tensor, factor: f64) -> Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    let out_h = ((h as f64 * factor).floor() as usize).max(1);
    let out_w = ((w as f64 * factor).floor() as usize).max(1);
    resize_bicubic(x, out_h, out_w)
}
