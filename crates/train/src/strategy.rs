//! Execution strategies: how one aligned batch becomes gradients.
//!
//! [`SingleDevice`] runs the whole batch at once. [`Replicated`] splits it
//! into shards, runs forward/backward per shard with the loss scaled by the
//! shard's share of the batch, and sums the gradients. Because every loss
//! term is a mean over equally sized samples, the summed gradients, the
//! merged loss values and the merged metrics match the single-device run.
//!
//! candle variables are bound to one device, so replicas evaluate on the
//! pipeline's device; sharding bounds peak activation memory per pass.

use candle_core::{backprop::GradStore, Tensor};

use canet_core::{ForwardOutput, ForwardPipeline, Mode};

/// Scalar summary of one batch (or shard).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchMetrics {
    pub chroma_loss_1: f64,
    pub chroma_loss_2: f64,
    pub reconstruction_loss: f64,
    pub psnr: f64,
    pub ssim: f64,
    pub mse: f64,
    pub samples: usize,
}

fn to_f64(t: &Tensor) -> candle_core::Result<f64> {
    t.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()
}

impl BatchMetrics {
    pub fn from_output(output: &ForwardOutput) -> candle_core::Result<Self> {
        Ok(Self {
            chroma_loss_1: to_f64(&output.chroma_loss_1)?,
            chroma_loss_2: to_f64(&output.chroma_loss_2)?,
            reconstruction_loss: to_f64(&output.reconstruction_loss)?,
            psnr: output.psnr,
            ssim: output.ssim,
            mse: output.mse,
            samples: output.image.dim(0)?,
        })
    }

    /// Sum of the three loss terms.
    pub fn loss(&self) -> f64 {
        self.chroma_loss_1 + self.chroma_loss_2 + self.reconstruction_loss
    }

    /// Sample-weighted merge; PSNR is recomputed from the merged MSE.
    pub fn merge(parts: &[BatchMetrics]) -> Option<Self> {
        let total: usize = parts.iter().map(|p| p.samples).sum();
        if total == 0 {
            return None;
        }
        let weighted = |f: fn(&BatchMetrics) -> f64| -> f64 {
            parts
                .iter()
                .map(|p| f(p) * p.samples as f64 / total as f64)
                .sum()
        };
        let mse = weighted(|p| p.mse);
        Some(Self {
            chroma_loss_1: weighted(|p| p.chroma_loss_1),
            chroma_loss_2: weighted(|p| p.chroma_loss_2),
            reconstruction_loss: weighted(|p| p.reconstruction_loss),
            psnr: canet_core::psnr_from_mse(mse),
            ssim: weighted(|p| p.ssim),
            mse,
            samples: total,
        })
    }
}

/// Turns an aligned `[N, 3, H, W]` batch into gradients for the colour net.
pub trait ExecutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn forward_backward(
        &self,
        pipeline: &ForwardPipeline,
        image: &Tensor,
        target: &Tensor,
    ) -> anyhow::Result<(GradStore, BatchMetrics)>;
}

// ── Single device ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct SingleDevice;

impl ExecutionStrategy for SingleDevice {
    fn name(&self) -> &'static str {
        "single-device"
    }

    fn forward_backward(
        &self,
        pipeline: &ForwardPipeline,
        image: &Tensor,
        target: &Tensor,
    ) -> anyhow::Result<(GradStore, BatchMetrics)> {
        let output = pipeline.forward_aligned(image, target, Mode::Train)?;
        let grads = output.total_loss()?.backward()?;
        Ok((grads, BatchMetrics::from_output(&output)?))
    }
}

// ── Replicated ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct Replicated {
    pub replicas: usize,
}

impl ExecutionStrategy for Replicated {
    fn name(&self) -> &'static str {
        "replicated"
    }

    fn forward_backward(
        &self,
        pipeline: &ForwardPipeline,
        image: &Tensor,
        target: &Tensor,
    ) -> anyhow::Result<(GradStore, BatchMetrics)> {
        let n = image.dim(0)?;
        let shards = self.replicas.clamp(1, n.max(1));
        let images = image.chunk(shards, 0)?;
        let targets = target.chunk(shards, 0)?;
        let vars = pipeline.color().vars();

        let mut merged: Option<GradStore> = None;
        let mut parts = Vec::with_capacity(shards);
        for (img, tgt) in images.iter().zip(&targets) {
            let output = pipeline.forward_aligned(img, tgt, Mode::Train)?;
            let share = img.dim(0)? as f64 / n as f64;
            let grads = output.total_loss()?.affine(share, 0.0)?.backward()?;
            parts.push(BatchMetrics::from_output(&output)?);

            merged = Some(match merged {
                None => grads,
                Some(mut acc) => {
                    for var in &vars {
                        let t = var.as_tensor();
                        let Some(g) = grads.get(t) else { continue };
                        let sum = match acc.remove(t) {
                            Some(prev) => (prev + g)?,
                            None => g.clone(),
                        };
                        acc.insert(t, sum);
                    }
                    acc
                }
            });
        }
        let grads = merged.ok_or_else(|| anyhow::anyhow!("empty batch"))?;
        let metrics = BatchMetrics::merge(&parts).ok_or_else(|| anyhow::anyhow!("empty batch"))?;
        Ok((grads, metrics))
    }
}

/// `SingleDevice` for ≤ 1 device, `Replicated` otherwise.
pub fn select_strategy(num_devices: usize) -> Box<dyn ExecutionStrategy> {
    if num_devices > 1 {
        Box::new(Replicated {
            replicas: num_devices,
        })
    } else {
        Box::new(SingleDevice)
    }
}
