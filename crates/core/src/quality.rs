//! Image quality metrics: MSE, PSNR, SSIM.
//!
//! Images are expected in `[0, 1]` (data range 1). Metrics return plain
//! `f64`s and never take part in gradient computation.

use candle_core::{DType, Device, Result, Tensor};

/// SSIM stabilisers for data range 1: `(0.01)²`, `(0.03)²`.
pub(crate) const SSIM_C1: f64 = 1e-4;
pub(crate) const SSIM_C2: f64 = 9e-4;

/// Window used by [`ssim`].
const SSIM_SIGMA: f64 = 1.5;
const SSIM_RADIUS: usize = 5;

/// PSNR of identical images is reported as 100 dB instead of infinity.
const MSE_FLOOR: f64 = 1e-10;

/// Normalised 2-D Gaussian `[1, 1, 2r+1, 2r+1]`.
pub(crate) fn gaussian_window(sigma: f64, radius: usize, device: &Device) -> Result<Tensor> {
    let size = 2 * radius + 1;
    let taps: Vec<f64> = (0..size)
        .map(|i| {
            let d = i as f64 - radius as f64;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let total: f64 = taps.iter().sum();
    let mut window = Vec::with_capacity(size * size);
    for a in &taps {
        for b in &taps {
            window.push((a * b / (total * total)) as f32);
        }
    }
    Tensor::from_vec(window, (1, 1, size, size), device)
}

/// Gaussian-filter every channel independently (zero padding, same size).
pub(crate) fn filter_planes(x: &Tensor, window: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = x.dims4()?;
    let radius = window.dim(3)? / 2;
    x.contiguous()?
        .reshape((b * c, 1, h, w))?
        .conv2d(window, radius, 1, 1, 1)?
        .reshape((b, c, h, w))
}

/// Per-pixel SSIM factors of one Gaussian scale.
pub(crate) struct LocalSimilarity {
    /// `(2·μx·μy + C1) / (μx² + μy² + C1)`
    pub luminance: Tensor,
    /// `(2·σxy + C2) / (σx² + σy² + C2)`
    pub contrast_structure: Tensor,
}

pub(crate) fn local_similarity(x: &Tensor, y: &Tensor, window: &Tensor) -> Result<LocalSimilarity> {
    let mu_x = filter_planes(x, window)?;
    let mu_y = filter_planes(y, window)?;
    let mu_xx = mu_x.sqr()?;
    let mu_yy = mu_y.sqr()?;
    let mu_xy = (&mu_x * &mu_y)?;

    let sigma_xx = (filter_planes(&x.sqr()?, window)? - &mu_xx)?;
    let sigma_yy = (filter_planes(&y.sqr()?, window)? - &mu_yy)?;
    let sigma_xy = (filter_planes(&(x * y)?, window)? - &mu_xy)?;

    let luminance = mu_xy
        .affine(2.0, SSIM_C1)?
        .div(&(mu_xx + mu_yy)?.affine(1.0, SSIM_C1)?)?;
    let contrast_structure = sigma_xy
        .affine(2.0, SSIM_C2)?
        .div(&(sigma_xx + sigma_yy)?.affine(1.0, SSIM_C2)?)?;
    Ok(LocalSimilarity {
        luminance,
        contrast_structure,
    })
}

/// Mean squared error over all elements.
pub fn mse(x: &Tensor, y: &Tensor) -> Result<f64> {
    let v = (x.detach() - y.detach())?
        .sqr()?
        .mean_all()?
        .to_dtype(DType::F64)?
        .to_scalar::<f64>()?;
    Ok(v)
}

/// `10·log10(1 / mse)` for data range 1. NaN stays NaN.
pub fn psnr_from_mse(mse: f64) -> f64 {
    if mse.is_nan() {
        return f64::NAN;
    }
    10.0 * (1.0 / mse.max(MSE_FLOOR)).log10()
}

/// Peak signal-to-noise ratio in dB.
pub fn psnr(x: &Tensor, y: &Tensor) -> Result<f64> {
    Ok(psnr_from_mse(mse(x, y)?))
}

/// Mean structural similarity (Gaussian window σ = 1.5, 11×11).
pub fn ssim(x: &Tensor, y: &Tensor) -> Result<f64> {
    let x = x.detach().to_dtype(DType::F32)?;
    let y = y.detach().to_dtype(DType::F32)?;
    let window = gaussian_window(SSIM_SIGMA, SSIM_RADIUS, x.device())?;
    let local = local_similarity(&x, &y, &window)?;
    let map = (local.luminance * local.contrast_structure)?;
    map.mean_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_normalised() {
        let w = gaussian_window(1.5, 5, &Device::Cpu).unwrap();
        assert_eq!(w.dims(), &[1, 1, 11, 11]);
        let total = w.sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[test]
    fn identical_images_score_perfectly() {
        let dev = Device::Cpu;
        let x = Tensor::rand(0f32, 1f32, (2, 3, 24, 24), &dev).unwrap();
        assert!((ssim(&x, &x).unwrap() - 1.0).abs() < 1e-4);
        assert!((psnr(&x, &x).unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn psnr_of_known_error() {
        let dev = Device::Cpu;
        let a = Tensor::zeros((1, 3, 4, 4), DType::F32, &dev).unwrap();
        let b = Tensor::full(0.1f32, (1, 3, 4, 4), &dev).unwrap();
        // mse = 0.01 → 20 dB
        assert!((psnr(&a, &b).unwrap() - 20.0).abs() < 1e-4);
    }

    #[test]
    fn psnr_of_nan_reconstruction_is_nan() {
        assert!(psnr_from_mse(f64::NAN).is_nan());
        assert!((psnr_from_mse(0.0) - 100.0).abs() < 1e-9);

        let dev = Device::Cpu;
        let a = Tensor::zeros((1, 3, 4, 4), DType::F32, &dev).unwrap();
        let b = Tensor::full(f32::NAN, (1, 3, 4, 4), &dev).unwrap();
        assert!(psnr(&a, &b).unwrap().is_nan());
    }

    #[test]
    fn noise_lowers_ssim() {
        let dev = Device::Cpu;
        let x = Tensor::rand(0f32, 1f32, (1, 3, 32, 32), &dev).unwrap();
        let noise = Tensor::randn(0f32, 0.2, (1, 3, 32, 32), &dev).unwrap();
        let y = (&x + noise).unwrap();
        let score = ssim(&x, &y).unwrap();
        assert!(score < 0.95);
        assert!(score > -1.0);
    }
}
