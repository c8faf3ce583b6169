//! Training losses: L1 and the mixed MS-SSIM + Gaussian-L1 reconstruction loss.
//!
//! MS-SSIM here is the single-resolution variant built from a bank of
//! Gaussian windows of growing σ (Zhao et al., "Loss Functions for Image
//! Restoration with Neural Networks"):
//!
//! ```text
//! ms_ssim = Π_c l_c(σ_max) · Π_{σ,c} cs_c(σ)
//! loss    = α · (1 − ms_ssim) + (1 − α) · G_σmax ∗ |x − y|
//! ```

use candle_core::{Device, Result, Tensor};

use crate::quality::{filter_planes, gaussian_window, local_similarity};

/// Gaussian scales of the MS-SSIM window bank.
const MS_SSIM_SIGMAS: [f64; 5] = [0.5, 1.0, 2.0, 4.0, 8.0];
/// Windows are truncated at 3σ but never wider than 33 taps.
const MAX_RADIUS: usize = 16;
/// Weight of the MS-SSIM term.
pub const DEFAULT_MS_SSIM_ALPHA: f64 = 0.84;

/// Mean absolute error over all elements.
pub fn l1_loss(prediction: &Tensor, target: &Tensor) -> Result<Tensor> {
    (prediction - target)?.abs()?.mean_all()
}

/// Product over the channel dimension: `[B, C, H, W]` → `[B, 1, H, W]`.
fn channel_product(x: &Tensor) -> Result<Tensor> {
    let c = x.dim(1)?;
    let mut acc = x.narrow(1, 0, 1)?;
    for i in 1..c {
        acc = (acc * x.narrow(1, i, 1)?)?;
    }
    Ok(acc)
}

/// α·(1 − MS-SSIM) + (1 − α)·Gaussian-weighted L1, averaged over pixels.
pub struct MsSsimL1Loss {
    windows: Vec<Tensor>,
    alpha: f64,
}

impl MsSsimL1Loss {
    pub fn new(alpha: f64, device: &Device) -> Result<Self> {
        let windows = MS_SSIM_SIGMAS
            .iter()
            .map(|&sigma| {
                let radius = ((3.0 * sigma).ceil() as usize).min(MAX_RADIUS);
                gaussian_window(sigma, radius, device)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { windows, alpha })
    }

    pub fn forward(&self, prediction: &Tensor, target: &Tensor) -> Result<Tensor> {
        let mut cs_product: Option<Tensor> = None;
        let mut luminance: Option<Tensor> = None;
        let last = self.windows.len() - 1;
        for (i, window) in self.windows.iter().enumerate() {
            let local = local_similarity(prediction, target, window)?;
            let cs = channel_product(&local.contrast_structure)?;
            cs_product = Some(match cs_product {
                None => cs,
                Some(prev) => (prev * cs)?,
            });
            if i == last {
                luminance = Some(channel_product(&local.luminance)?);
            }
        }
        let (Some(cs_product), Some(luminance)) = (cs_product, luminance) else {
            candle_core::bail!("MS-SSIM window bank is empty");
        };
        let ms_ssim = (luminance * cs_product)?;

        let abs_err = (prediction - target)?.abs()?;
        let gaussian_l1 = filter_planes(&abs_err, &self.windows[last])?.mean_keepdim(1)?;

        let mixed = (ms_ssim.affine(-self.alpha, self.alpha)?
            + gaussian_l1.affine(1.0 - self.alpha, 0.0)?)?;
        mixed.mean_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l1_of_constant_offset() {
        let dev = Device::Cpu;
        let a = Tensor::full(0.2f32, (2, 1, 3, 3), &dev).unwrap();
        let b = Tensor::full(0.5f32, (2, 1, 3, 3), &dev).unwrap();
        let l = l1_loss(&a, &b).unwrap().to_scalar::<f32>().unwrap();
        assert!((l - 0.3).abs() < 1e-6);
    }

    #[test]
    fn identical_images_have_near_zero_loss() {
        let dev = Device::Cpu;
        let loss = MsSsimL1Loss::new(DEFAULT_MS_SSIM_ALPHA, &dev).unwrap();
        let x = Tensor::rand(0f32, 1f32, (2, 3, 20, 20), &dev).unwrap();
        let l = loss.forward(&x, &x).unwrap().to_scalar::<f32>().unwrap();
        assert!(l.abs() < 1e-4, "loss {l}");
    }

    #[test]
    fn loss_grows_with_distortion() {
        let dev = Device::Cpu;
        let loss = MsSsimL1Loss::new(DEFAULT_MS_SSIM_ALPHA, &dev).unwrap();
        let x = Tensor::rand(0f32, 1f32, (1, 3, 20, 20), &dev).unwrap();
        let small = (&x + Tensor::randn(0f32, 0.02, (1, 3, 20, 20), &dev).unwrap()).unwrap();
        let large = (&x + Tensor::randn(0f32, 0.3, (1, 3, 20, 20), &dev).unwrap()).unwrap();
        let ls = loss.forward(&small, &x).unwrap().to_scalar::<f32>().unwrap();
        let ll = loss.forward(&large, &x).unwrap().to_scalar::<f32>().unwrap();
        assert!(ls < ll);
    }

    #[test]
    fn gradient_reaches_prediction() {
        let dev = Device::Cpu;
        let loss = MsSsimL1Loss::new(DEFAULT_MS_SSIM_ALPHA, &dev).unwrap();
        let target = Tensor::rand(0f32, 1f32, (1, 3, 12, 12), &dev).unwrap();
        let pred = candle_core::Var::rand(0f32, 1f32, (1, 3, 12, 12), &dev).unwrap();
        let grads = loss
            .forward(pred.as_tensor(), &target)
            .unwrap()
            .backward()
            .unwrap();
        assert!(grads.get(pred.as_tensor()).is_some());
    }
}
