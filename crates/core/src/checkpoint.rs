//! Weight (de)serialisation with strict name/shape matching.
//!
//! Weights are stored as safetensors. [`load_strict`] validates the whole
//! file against the target [`VarMap`] before touching a single variable, so
//! a mismatched file never results in a partially loaded network.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use candle_core::Tensor;
use candle_nn::VarMap;

/// One parameter whose stored shape differs from the network's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeMismatch {
    pub name: String,
    pub expected: Vec<usize>,
    pub found: Vec<usize>,
}

/// Name/shape differences between a checkpoint and a network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WeightMismatch {
    /// In the network, absent from the file.
    pub missing: Vec<String>,
    /// In the file, absent from the network.
    pub unexpected: Vec<String>,
    pub shape: Vec<ShapeMismatch>,
}

impl WeightMismatch {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.shape.is_empty()
    }
}

impl fmt::Display for WeightMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.missing.is_empty() {
            parts.push(format!("missing [{}]", self.missing.join(", ")));
        }
        if !self.unexpected.is_empty() {
            parts.push(format!("unexpected [{}]", self.unexpected.join(", ")));
        }
        for s in &self.shape {
            parts.push(format!(
                "{}: expected {:?}, found {:?}",
                s.name, s.expected, s.found
            ));
        }
        f.write_str(&parts.join("; "))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("read weights {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: candle_core::Error,
    },
    #[error("weights {path} do not match the network: {mismatch}")]
    Mismatch {
        path: PathBuf,
        mismatch: WeightMismatch,
    },
    #[error("apply weights: {0}")]
    Apply(#[from] candle_core::Error),
    #[error("variable map lock poisoned")]
    Poisoned,
}

/// Write every variable of `varmap` to `path`, replacing any existing file.
pub fn save(varmap: &VarMap, path: &Path) -> candle_core::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    varmap.save(path)
}

/// Compare stored tensors with the network's variables.
pub fn diff(varmap: &VarMap, stored: &HashMap<String, Tensor>) -> Result<WeightMismatch, LoadError> {
    let data = varmap.data().lock().map_err(|_| LoadError::Poisoned)?;
    let mut mismatch = WeightMismatch::default();
    for (name, var) in data.iter() {
        match stored.get(name) {
            None => mismatch.missing.push(name.clone()),
            Some(t) if t.dims() != var.dims() => mismatch.shape.push(ShapeMismatch {
                name: name.clone(),
                expected: var.dims().to_vec(),
                found: t.dims().to_vec(),
            }),
            Some(_) => {}
        }
    }
    for name in stored.keys() {
        if !data.contains_key(name) {
            mismatch.unexpected.push(name.clone());
        }
    }
    mismatch.missing.sort();
    mismatch.unexpected.sort();
    mismatch.shape.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(mismatch)
}

/// Load `path` into `varmap`; every name and shape must match exactly.
pub fn load_strict(varmap: &VarMap, path: &Path) -> Result<(), LoadError> {
    let read_err = |source| LoadError::Read {
        path: path.to_path_buf(),
        source,
    };
    let device = {
        let data = varmap.data().lock().map_err(|_| LoadError::Poisoned)?;
        data.values()
            .next()
            .map(|v| v.device().clone())
            .unwrap_or(candle_core::Device::Cpu)
    };
    let stored = candle_core::safetensors::load(path, &device).map_err(read_err)?;

    let mismatch = diff(varmap, &stored)?;
    if !mismatch.is_empty() {
        return Err(LoadError::Mismatch {
            path: path.to_path_buf(),
            mismatch,
        });
    }

    let data = varmap.data().lock().map_err(|_| LoadError::Poisoned)?;
    for (name, var) in data.iter() {
        if let Some(tensor) = stored.get(name) {
            var.set(&tensor.to_dtype(var.dtype())?)?;
        }
    }
    tracing::debug!(path = %path.display(), tensors = stored.len(), "Loaded weights");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    fn varmap_with(shapes: &[(&str, (usize, usize))]) -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        for (name, shape) in shapes {
            vb.get_with_hints(*shape, name, Init::Randn { mean: 0., stdev: 1. })
                .unwrap();
        }
        varmap
    }

    #[test]
    fn save_then_load_is_bit_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.safetensors");
        let src = varmap_with(&[("a", (2, 3)), ("b", (4, 1))]);
        save(&src, &path).unwrap();

        let dst = varmap_with(&[("a", (2, 3)), ("b", (4, 1))]);
        load_strict(&dst, &path).unwrap();

        let src_data = src.data().lock().unwrap();
        let dst_data = dst.data().lock().unwrap();
        for (name, var) in src_data.iter() {
            let a: Vec<f32> = var.flatten_all().unwrap().to_vec1().unwrap();
            let b: Vec<f32> = dst_data[name].flatten_all().unwrap().to_vec1().unwrap();
            assert_eq!(a, b, "{name}");
        }
    }

    #[test]
    fn missing_name_is_fatal_and_nothing_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.safetensors");
        save(&varmap_with(&[("a", (2, 3))]), &path).unwrap();

        let dst = varmap_with(&[("a", (2, 3)), ("b", (4, 1))]);
        let before: Vec<f32> = dst.data().lock().unwrap()["a"]
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        match load_strict(&dst, &path) {
            Err(LoadError::Mismatch { mismatch, .. }) => {
                assert_eq!(mismatch.missing, vec!["b".to_string()]);
                assert!(mismatch.unexpected.is_empty());
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
        let after: Vec<f32> = dst.data().lock().unwrap()["a"]
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn unexpected_and_shape_mismatches_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.safetensors");
        save(&varmap_with(&[("a", (3, 2)), ("extra", (1, 1))]), &path).unwrap();

        let dst = varmap_with(&[("a", (2, 3))]);
        let err = load_strict(&dst, &path).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("unexpected [extra]"), "{msg}");
        assert!(msg.contains("a: expected [2, 3], found [3, 2]"), "{msg}");
    }

    #[test]
    fn unreadable_file_is_a_read_error() {
        let dst = varmap_with(&[("a", (2, 3))]);
        let err = load_strict(&dst, Path::new("/nonexistent/w.safetensors")).unwrap_err();
        assert!(matches!(err, LoadError::Read { .. }));
    }
}
