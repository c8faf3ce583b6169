//! Networks and the name → constructor registry.
//!
//! A [`Network`] owns its [`VarMap`], so the parameters of one network can be
//! handed to an optimiser, saved, or strictly reloaded without touching the
//! other. Constructors follow the `(in_channels, out_channels, vb)` contract
//! and are looked up by name through [`ModelRegistry`].
//!
//! Reference architectures shipped with the registry:
//!
//! | Name | Layers |
//! |------|--------|
//! | `INet` | 3×3 conv (32, ReLU) ×3 → 3×3 conv → sigmoid |
//! | `PointNet` | single 1×1 conv (per-pixel linear mix) |

use std::collections::BTreeMap;
use std::path::Path;

use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, Module, VarBuilder, VarMap};

use crate::checkpoint::{self, LoadError};

/// Any image-to-image layer stack.
pub type BoxedModule = Box<dyn Module + Send + Sync>;

/// `(in_channels, out_channels, vb)` → module.
pub type ModelConstructor = fn(usize, usize, VarBuilder) -> Result<BoxedModule>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown model '{name}' (known: {})", .known.join(", "))]
    Unknown { name: String, known: Vec<String> },
    #[error("build model '{name}': {source}")]
    Build {
        name: String,
        #[source]
        source: candle_core::Error,
    },
}

// ── Reference architectures ─────────────────────────────────────────────────

const INET_WIDTH: usize = 32;
const INET_DEPTH: usize = 3;

/// Small fully-convolutional estimator with a sigmoid head.
struct INet {
    body: Vec<Conv2d>,
    head: Conv2d,
}

impl INet {
    fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let mut body = Vec::with_capacity(INET_DEPTH);
        let mut channels = in_channels;
        for i in 0..INET_DEPTH {
            body.push(conv2d(channels, INET_WIDTH, 3, cfg, vb.pp(format!("body.{i}")))?);
            channels = INET_WIDTH;
        }
        let head = conv2d(channels, out_channels, 3, cfg, vb.pp("head"))?;
        Ok(Self { body, head })
    }
}

impl Module for INet {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut x = xs.clone();
        for conv in &self.body {
            x = conv.forward(&x)?.relu()?;
        }
        candle_nn::ops::sigmoid(&self.head.forward(&x)?)
    }
}

fn build_inet(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<BoxedModule> {
    Ok(Box::new(INet::new(in_channels, out_channels, vb)?))
}

fn build_pointnet(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<BoxedModule> {
    Ok(Box::new(conv2d(
        in_channels,
        out_channels,
        1,
        Conv2dConfig::default(),
        vb.pp("mix"),
    )?))
}

// ── Registry ────────────────────────────────────────────────────────────────

/// Explicit name → constructor table, validated before anything is built.
#[derive(Clone)]
pub struct ModelRegistry {
    entries: BTreeMap<String, ModelConstructor>,
}

impl ModelRegistry {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Registry with the reference architectures.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("INet", build_inet);
        registry.register("PointNet", build_pointnet);
        registry
    }

    pub fn register(&mut self, name: &str, constructor: ModelConstructor) {
        self.entries.insert(name.to_string(), constructor);
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Construct `name` with freshly initialised parameters on `device`.
    pub fn build(
        &self,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        device: &Device,
    ) -> std::result::Result<Network, RegistryError> {
        let constructor = self.entries.get(name).ok_or_else(|| RegistryError::Unknown {
            name: name.to_string(),
            known: self.entries.keys().cloned().collect(),
        })?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let module = constructor(in_channels, out_channels, vb).map_err(|source| {
            RegistryError::Build {
                name: name.to_string(),
                source,
            }
        })?;
        Ok(Network {
            name: name.to_string(),
            module,
            varmap,
        })
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ── Network ─────────────────────────────────────────────────────────────────

/// A constructed module together with the variables it owns.
pub struct Network {
    name: String,
    module: BoxedModule,
    varmap: VarMap,
}

/// Row of [`Network::parameter_table`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterInfo {
    pub name: String,
    pub shape: Vec<usize>,
    pub elements: usize,
}

impl Network {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.module.forward(x)
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Trainable variables, in a stable (name-sorted) order.
    pub fn vars(&self) -> Vec<Var> {
        let data = match self.varmap.data().lock() {
            Ok(data) => data,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut named: Vec<(&String, &Var)> = data.iter().collect();
        named.sort_by(|a, b| a.0.cmp(b.0));
        named.into_iter().map(|(_, v)| v.clone()).collect()
    }

    /// Name, shape and element count of every parameter, sorted by name.
    pub fn parameter_table(&self) -> Vec<ParameterInfo> {
        let data = match self.varmap.data().lock() {
            Ok(data) => data,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut rows: Vec<ParameterInfo> = data
            .iter()
            .map(|(name, var)| ParameterInfo {
                name: name.clone(),
                shape: var.dims().to_vec(),
                elements: var.elem_count(),
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    pub fn num_parameters(&self) -> usize {
        self.parameter_table().iter().map(|p| p.elements).sum()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        checkpoint::save(&self.varmap, path)
    }

    /// Strict load: any missing, unexpected or mis-shaped tensor is an error.
    pub fn load(&self, path: &Path) -> std::result::Result<(), LoadError> {
        checkpoint::load_strict(&self.varmap, path)?;
        tracing::info!(model = %self.name, path = %path.display(), "Loaded weights");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lists_reference_models() {
        let registry = ModelRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["INet", "PointNet"]);
        assert!(registry.contains("INet"));
    }

    #[test]
    fn unknown_name_is_rejected() {
        let registry = ModelRegistry::with_defaults();
        let err = registry.build("UNet", 1, 1, &Device::Cpu).err().unwrap();
        assert!(matches!(err, RegistryError::Unknown { .. }));
        assert!(err.to_string().contains("INet, PointNet"));
    }

    #[test]
    fn inet_preserves_spatial_size() {
        let registry = ModelRegistry::with_defaults();
        let net = registry.build("INet", 1, 1, &Device::Cpu).unwrap();
        let x = Tensor::rand(0f32, 1f32, (2, 1, 9, 7), &Device::Cpu).unwrap();
        let y = net.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 1, 9, 7]);
        let min = y.min_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(min >= 0.0);
    }

    #[test]
    fn pointnet_parameter_table() {
        let registry = ModelRegistry::with_defaults();
        let net = registry.build("PointNet", 6, 2, &Device::Cpu).unwrap();
        let table = net.parameter_table();
        assert_eq!(table.len(), 2);
        assert_eq!(table[0].name, "mix.bias");
        assert_eq!(table[1].shape, vec![2, 6, 1, 1]);
        assert_eq!(net.num_parameters(), 14);
        assert_eq!(net.vars().len(), 2);
    }

    #[test]
    fn custom_constructor_can_be_registered() {
        let mut registry = ModelRegistry::empty();
        registry.register("Tiny", build_pointnet);
        assert_eq!(registry.names(), vec!["Tiny"]);
        assert!(registry.build("Tiny", 3, 3, &Device::Cpu).is_ok());
    }
}
