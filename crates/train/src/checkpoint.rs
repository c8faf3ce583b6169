//! Checkpoint file naming and the training-state sidecar.
//!
//! Every weight file `x.pth` (safetensors content) gets a `x.json` next to
//! it recording where in the run it was written, so `--resume x.pth` can
//! restore both the weights and the step counter.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use canet_core::Network;

/// `{model}_{epoch:03}_{psnr}_{ssim}_{step}.pth`, written after validation.
pub fn validation_name(model: &str, epoch: usize, psnr: f64, ssim: f64, step: usize) -> String {
    format!("{model}_{epoch:03}_{psnr}_{ssim}_{step}.pth")
}

/// `{model}_{epoch}_{step}_keyboardInterrupt.pth`.
pub fn interrupt_name(model: &str, epoch: usize, step: usize) -> String {
    format!("{model}_{epoch}_{step}_keyboardInterrupt.pth")
}

/// `{model}_{epoch:03}_step_{step}.pth`, written every `save_interval` steps.
pub fn periodic_name(model: &str, epoch: usize, step: usize) -> String {
    format!("{model}_{epoch:03}_step_{step}.pth")
}

/// Position of a run at the moment a checkpoint was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingState {
    pub epoch: usize,
    pub step: usize,
    pub model_name: String,
}

impl TrainingState {
    pub fn sidecar_path(checkpoint: &Path) -> PathBuf {
        checkpoint.with_extension("json")
    }

    pub fn save(&self, checkpoint: &Path) -> anyhow::Result<()> {
        let path = Self::sidecar_path(checkpoint);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn load(checkpoint: &Path) -> anyhow::Result<Self> {
        let path = Self::sidecar_path(checkpoint);
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("read training state {}", path.display()))?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Save `network` as `dir/name` and its sidecar; returns the weight path.
pub fn save_checkpoint(
    network: &Network,
    dir: &Path,
    name: &str,
    epoch: usize,
    step: usize,
) -> anyhow::Result<PathBuf> {
    let path = dir.join(name);
    network
        .save(&path)
        .with_context(|| format!("save checkpoint {}", path.display()))?;
    TrainingState {
        epoch,
        step,
        model_name: network.name().to_string(),
    }
    .save(&path)?;
    tracing::info!(path = %path.display(), epoch, step, "Saved checkpoint");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use canet_core::ModelRegistry;

    #[test]
    fn checkpoint_names() {
        assert_eq!(
            validation_name("INet", 7, 21.5, 0.75, 1200),
            "INet_007_21.5_0.75_1200.pth"
        );
        assert_eq!(interrupt_name("INet", 7, 1200), "INet_7_1200_keyboardInterrupt.pth");
        assert_eq!(periodic_name("INet", 12, 500), "INet_012_step_500.pth");
    }

    #[test]
    fn sidecar_sits_next_to_weights() {
        let p = Path::new("/runs/a/INet_007_21.5_0.75_1200.pth");
        assert_eq!(
            TrainingState::sidecar_path(p),
            Path::new("/runs/a/INet_007_21.5_0.75_1200.json")
        );
    }

    #[test]
    fn save_writes_weights_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let net = ModelRegistry::with_defaults()
            .build("PointNet", 6, 2, &Device::Cpu)
            .unwrap();
        let path = save_checkpoint(&net, dir.path(), &periodic_name("PointNet", 1, 40), 1, 40).unwrap();
        assert!(path.exists());
        let state = TrainingState::load(&path).unwrap();
        assert_eq!(
            state,
            TrainingState {
                epoch: 1,
                step: 40,
                model_name: "PointNet".into()
            }
        );

        let fresh = ModelRegistry::with_defaults()
            .build("PointNet", 6, 2, &Device::Cpu)
            .unwrap();
        fresh.load(&path).unwrap();
    }

    #[test]
    fn missing_state_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(TrainingState::load(&dir.path().join("nope.pth")).is_err());
    }
}
