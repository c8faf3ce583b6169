//! Scalar metric sinks: `(name, value, step)` records.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;

pub trait MetricWriter: Send {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> anyhow::Result<()>;

    fn flush(&mut self) -> anyhow::Result<()>;
}

// ── CSV ─────────────────────────────────────────────────────────────────────

/// Appends rows to `scalars.csv` with header `name,value,step`.
pub struct CsvMetricWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl CsvMetricWriter {
    pub const FILE_NAME: &'static str = "scalars.csv";

    /// Create `dir/scalars.csv`, creating `dir` if needed.
    pub fn create(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        let path = dir.join(Self::FILE_NAME);
        let file = File::create(&path).with_context(|| format!("create {}", path.display()))?;
        let mut out = BufWriter::new(file);
        writeln!(out, "name,value,step")?;
        Ok(Self { path, out })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricWriter for CsvMetricWriter {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> anyhow::Result<()> {
        writeln!(self.out, "{name},{value},{step}")?;
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

// ── In memory ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ScalarRecord {
    pub name: String,
    pub value: f64,
    pub step: usize,
}

/// Keeps every record; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetricWriter {
    records: Arc<Mutex<Vec<ScalarRecord>>>,
}

impl MemoryMetricWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ScalarRecord> {
        match self.records.lock() {
            Ok(r) => r.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Records named `name`, in write order.
    pub fn series(&self, name: &str) -> Vec<(usize, f64)> {
        self.records()
            .into_iter()
            .filter(|r| r.name == name)
            .map(|r| (r.step, r.value))
            .collect()
    }
}

impl MetricWriter for MemoryMetricWriter {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> anyhow::Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("metric buffer lock poisoned"))?;
        records.push(ScalarRecord {
            name: name.to_string(),
            value,
            step,
        });
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}
