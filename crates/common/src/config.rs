//! Run configuration for canet.
//!
//! Serialised as JSON next to every run. Every field has a default so a
//! minimal `{}` JSON produces a working configuration; CLI flags override
//! individual fields on top of the file.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Optimiser used for the colour-adjustment network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    /// Adam (no weight decay).
    Adam,
    /// SGD with Nesterov momentum 0.9.
    Sgd,
}

impl FromStr for OptimizerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "adam" => Ok(Self::Adam),
            "sgd" => Ok(Self::Sgd),
            other => anyhow::bail!("unknown optimizer '{other}' (expected adam | sgd)"),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Adam => f.write_str("adam"),
            Self::Sgd => f.write_str("sgd"),
        }
    }
}

/// Everything a training run needs, passed explicitly to each component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    // ── Hardware / loading ──────────────────────────────────────────────────
    /// Number of accelerators. `0` runs on the CPU. `> 1` splits each batch
    /// into that many shards, evaluated in turn on the first device.
    #[serde(default = "default_num_gpus")]
    pub num_gpus: usize,
    /// Prefetch worker threads (0 = load on the training thread).
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Samples per training batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    // ── Models ──────────────────────────────────────────────────────────────
    /// Registry name of the illumination-estimation network.
    #[serde(default = "default_model_name")]
    pub model1: String,
    /// Registry name of the colour-adjustment network.
    #[serde(default = "default_model_name")]
    pub model3: String,
    /// Pretrained weights for the illumination network (required to train).
    #[serde(default)]
    pub model1_weight: Option<PathBuf>,
    /// Pretrained weights for the colour network.
    #[serde(default)]
    pub model3_weight: Option<PathBuf>,
    /// Divisor floor applied to the illumination map.
    #[serde(default = "default_illumination_eps")]
    pub illumination_eps: f64,

    // ── Data ────────────────────────────────────────────────────────────────
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    /// Directory (under `train/`) holding the ground-truth images.
    #[serde(default = "default_targets_split")]
    pub targets_split: String,
    /// Crop variants per training sample (K).
    #[serde(default = "default_crops")]
    pub crops: usize,
    /// Side length of training crops, in pixels.
    #[serde(default = "default_crop_size")]
    pub crop_size: usize,
    /// Seed for shuffling and augmentation.
    #[serde(default = "default_seed")]
    pub seed: u64,

    // ── Output ──────────────────────────────────────────────────────────────
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    #[serde(default = "default_log_path")]
    pub saved_path: PathBuf,
    /// Run tag; becomes a directory level under `log_path` / `saved_path`.
    #[serde(default = "default_comment")]
    pub comment: String,

    // ── Schedule ────────────────────────────────────────────────────────────
    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,
    /// Epochs between validation passes.
    #[serde(default = "default_val_interval")]
    pub val_interval: usize,
    /// Steps between mid-epoch checkpoints (0 = disabled).
    #[serde(default = "default_save_interval")]
    pub save_interval: usize,
    #[serde(default = "default_lr")]
    pub lr: f64,
    /// Floor of the cosine schedule.
    #[serde(default = "default_lr_min")]
    pub lr_min: f64,
    #[serde(default = "default_optim")]
    pub optim: OptimizerKind,

    // ── Flags ───────────────────────────────────────────────────────────────
    /// Log the parameter table of both networks before training.
    #[serde(default)]
    pub graph: bool,
    /// Ignore `model3_weight` and train the colour network from init.
    #[serde(default)]
    pub scratch: bool,
    /// Run one validation pass and exit.
    #[serde(default)]
    pub sampling: bool,
    /// Validate before the first training epoch.
    #[serde(default)]
    pub test_on_start: bool,
    /// Keep the learning rate constant.
    #[serde(default)]
    pub no_sche: bool,
    /// Checkpoint to resume from (weights + neighbouring training state).
    #[serde(default)]
    pub resume: Option<PathBuf>,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_num_gpus() -> usize {
    1
}
fn default_num_workers() -> usize {
    12
}
fn default_batch_size() -> usize {
    1
}
fn default_model_name() -> String {
    "INet".to_string()
}
fn default_illumination_eps() -> f64 {
    1e-2
}
fn default_data_path() -> PathBuf {
    PathBuf::from("./data/LOL")
}
fn default_targets_split() -> String {
    "targets".to_string()
}
fn default_crops() -> usize {
    8
}
fn default_crop_size() -> usize {
    256
}
fn default_seed() -> u64 {
    42
}
fn default_log_path() -> PathBuf {
    PathBuf::from("logs/")
}
fn default_comment() -> String {
    "default".to_string()
}
fn default_num_epochs() -> usize {
    500
}
fn default_val_interval() -> usize {
    1
}
fn default_save_interval() -> usize {
    500
}
fn default_lr() -> f64 {
    0.01
}
fn default_lr_min() -> f64 {
    1e-6
}
fn default_optim() -> OptimizerKind {
    OptimizerKind::Adam
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            num_gpus: default_num_gpus(),
            num_workers: default_num_workers(),
            batch_size: default_batch_size(),
            model1: default_model_name(),
            model3: default_model_name(),
            model1_weight: None,
            model3_weight: None,
            illumination_eps: default_illumination_eps(),
            data_path: default_data_path(),
            targets_split: default_targets_split(),
            crops: default_crops(),
            crop_size: default_crop_size(),
            seed: default_seed(),
            log_path: default_log_path(),
            saved_path: default_log_path(),
            comment: default_comment(),
            num_epochs: default_num_epochs(),
            val_interval: default_val_interval(),
            save_interval: default_save_interval(),
            lr: default_lr(),
            lr_min: default_lr_min(),
            optim: default_optim(),
            graph: false,
            scratch: false,
            sampling: false,
            test_on_start: false,
            no_sche: false,
            resume: None,
        }
    }
}

impl RunConfig {
    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }

    /// Reject configurations the training loop cannot run.
    ///
    /// `known_models` is the list of registry names; both model names must
    /// resolve before any tensor is allocated.
    pub fn validate(&self, known_models: &[&str]) -> anyhow::Result<()> {
        for (role, name) in [("model1", &self.model1), ("model3", &self.model3)] {
            if !known_models.contains(&name.as_str()) {
                anyhow::bail!(
                    "{role}: unknown model '{name}' (known: {})",
                    known_models.join(", ")
                );
            }
        }
        if self.num_epochs == 0 {
            anyhow::bail!("num_epochs must be > 0");
        }
        if self.val_interval == 0 {
            anyhow::bail!("val_interval must be > 0");
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be > 0");
        }
        if self.crops == 0 || self.crop_size < 4 {
            anyhow::bail!(
                "crops ({}) must be > 0 and crop_size ({}) >= 4",
                self.crops,
                self.crop_size
            );
        }
        if self.illumination_eps <= 0.0 {
            anyhow::bail!("illumination_eps must be positive");
        }
        if self.lr_min > self.lr {
            anyhow::bail!("lr_min ({}) exceeds lr ({})", self.lr_min, self.lr);
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const MODELS: &[&str] = &["INet", "PointNet"];

    #[test]
    fn empty_json_uses_defaults() {
        let loaded: RunConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(loaded.num_epochs, 500);
        assert_eq!(loaded.crops, 8);
        assert_eq!(loaded.targets_split, "targets");
        assert_eq!(loaded.optim, OptimizerKind::Adam);
        assert_eq!(loaded.illumination_eps, 1e-2);
        assert!(loaded.model1_weight.is_none());
        assert!(!loaded.no_sche);
    }

    #[test]
    fn config_json_round_trip() {
        let config = RunConfig {
            optim: OptimizerKind::Sgd,
            model3: "PointNet".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"optim\":\"sgd\""));
        let loaded: RunConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.optim, OptimizerKind::Sgd);
        assert_eq!(loaded.model3, "PointNet");
    }

    #[test]
    fn save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = RunConfig {
            comment: "night".to_string(),
            ..Default::default()
        };
        config.save(&path).unwrap();
        let loaded = RunConfig::load(&path).unwrap();
        assert_eq!(loaded.comment, "night");
    }

    #[test]
    fn validate_rejects_unknown_model() {
        let config = RunConfig {
            model3: "ResNet".to_string(),
            ..Default::default()
        };
        let err = config.validate(MODELS).unwrap_err().to_string();
        assert!(err.contains("ResNet"));
        assert!(err.contains("PointNet"));
    }

    #[test]
    fn validate_rejects_zero_interval() {
        let config = RunConfig {
            val_interval: 0,
            ..Default::default()
        };
        assert!(config.validate(MODELS).is_err());
        assert!(RunConfig::default().validate(MODELS).is_ok());
    }

    #[test]
    fn optimizer_kind_parsing() {
        assert_eq!("adam".parse::<OptimizerKind>().unwrap(), OptimizerKind::Adam);
        assert_eq!("sgd".parse::<OptimizerKind>().unwrap(), OptimizerKind::Sgd);
        assert!("adamw".parse::<OptimizerKind>().is_err());
    }
}
