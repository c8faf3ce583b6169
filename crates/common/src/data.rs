//! Data pipeline: paired low-light / ground-truth images, batching, prefetch.
//!
//! A dataset yields [`Sample`]s; the [`DataLoader`] orders them per epoch,
//! collates them into [`Batch`]es and (optionally) decodes ahead of the
//! training thread on a pool of worker threads.
//!
//! Sample shapes:
//!
//! | variant | `input` | `target` |
//! |---------|---------|----------|
//! | training | `[K, 3, h, w]` (K crop variants) | `[3, h, w]` |
//! | evaluation | `[3, H, W]` | `[3, H, W]` |
//!
//! Collation adds the leading batch dimension, so a training batch of one
//! sample is `input[1, K, 3, h, w]`, `target[1, 3, h, w]`.
//!
//! * **[`ImageFolderDataset`]** — `low/` + targets directory on disk, matched by file name.
//! * **[`InMemoryDataset`]** — pre-built samples (tests, synthetic runs).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, Rgb32FImage};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// Batches decoded ahead of the consumer before workers block.
const PREFETCH_BUFFER: usize = 8;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Exposure jitter applied to each training crop variant.
const GAIN_RANGE: std::ops::Range<f64> = 0.6..1.4;

// ── Samples & datasets ──────────────────────────────────────────────────────

/// One `(input, target, name)` triple.
#[derive(Debug, Clone)]
pub struct Sample {
    pub input: Tensor,
    pub target: Tensor,
    pub name: String,
}

/// Indexable source of paired samples.
///
/// `rng` is seeded per `(epoch, index)` by the loader, so random crops are
/// reproducible no matter which worker decodes the sample.
pub trait PairedDataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize, rng: &mut StdRng) -> Result<Sample>;
}

/// Dataset over samples already resident in memory.
pub struct InMemoryDataset {
    samples: Vec<Sample>,
}

impl InMemoryDataset {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }
}

impl PairedDataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize, _rng: &mut StdRng) -> Result<Sample> {
        self.samples
            .get(index)
            .cloned()
            .with_context(|| format!("sample {index} out of range ({})", self.samples.len()))
    }
}

#[derive(Debug, Clone)]
struct ImagePair {
    input: PathBuf,
    target: PathBuf,
    name: String,
}

#[derive(Debug, Clone, Copy)]
enum FolderVariant {
    Training { crops: usize, crop_size: usize },
    Evaluation,
}

/// Paired image folders: `{root}/low/x.png` ↔ `{root}/{targets}/x.png`.
pub struct ImageFolderDataset {
    pairs: Vec<ImagePair>,
    variant: FolderVariant,
}

impl ImageFolderDataset {
    /// Training split: one random window per sample, `crops` exposure variants.
    pub fn training(
        root: &Path,
        targets_split: &str,
        crops: usize,
        crop_size: usize,
    ) -> Result<Self> {
        let pairs = collect_pairs(&root.join("low"), &root.join(targets_split))?;
        tracing::info!(root = %root.display(), pairs = pairs.len(), crops, crop_size, "Training split");
        Ok(Self {
            pairs,
            variant: FolderVariant::Training { crops, crop_size },
        })
    }

    /// Evaluation split: full images from `low/` and `high/`.
    pub fn evaluation(root: &Path) -> Result<Self> {
        let pairs = collect_pairs(&root.join("low"), &root.join("high"))?;
        tracing::info!(root = %root.display(), pairs = pairs.len(), "Evaluation split");
        Ok(Self {
            pairs,
            variant: FolderVariant::Evaluation,
        })
    }
}

impl PairedDataset for ImageFolderDataset {
    fn len(&self) -> usize {
        self.pairs.len()
    }

    fn get(&self, index: usize, rng: &mut StdRng) -> Result<Sample> {
        let pair = self
            .pairs
            .get(index)
            .with_context(|| format!("sample {index} out of range ({})", self.pairs.len()))?;
        let input = load_rgb(&pair.input)?;
        let target = load_rgb(&pair.target)?;
        if input.dims() != target.dims() {
            anyhow::bail!(
                "{}: input {:?} and target {:?} differ in size",
                pair.name,
                input.dims(),
                target.dims()
            );
        }
        let (input, target) = match self.variant {
            FolderVariant::Evaluation => (input, target),
            FolderVariant::Training { crops, crop_size } => {
                crop_variants(&input, &target, crops, crop_size, rng)?
            }
        };
        Ok(Sample {
            input,
            target,
            name: pair.name.clone(),
        })
    }
}

/// Cut one aligned window from both images and jitter the input's exposure
/// `crops` times. Returns `([crops, 3, h, w], [3, h, w])`.
fn crop_variants(
    input: &Tensor,
    target: &Tensor,
    crops: usize,
    crop_size: usize,
    rng: &mut StdRng,
) -> Result<(Tensor, Tensor)> {
    let (_, h, w) = input.dims3()?;
    let ch = crop_size.min(h);
    let cw = crop_size.min(w);
    let top = rng.gen_range(0..=h - ch);
    let left = rng.gen_range(0..=w - cw);

    let mut input = input.narrow(1, top, ch)?.narrow(2, left, cw)?.contiguous()?;
    let mut target = target.narrow(1, top, ch)?.narrow(2, left, cw)?.contiguous()?;
    if rng.gen_bool(0.5) {
        input = flip_horizontal(&input)?;
        target = flip_horizontal(&target)?;
    }

    let mut variants = Vec::with_capacity(crops);
    for _ in 0..crops {
        let gain = rng.gen_range(GAIN_RANGE);
        variants.push(input.affine(gain, 0.0)?.clamp(0f32, 1f32)?);
    }
    Ok((Tensor::stack(&variants, 0)?, target.contiguous()?))
}

fn flip_horizontal(image: &Tensor) -> Result<Tensor> {
    let w = image.dim(2)?;
    let reversed: Vec<u32> = (0..w as u32).rev().collect();
    let index = Tensor::from_vec(reversed, w, image.device())?;
    // index_select requires a contiguous source.
    Ok(image.contiguous()?.index_select(&index, 2)?)
}

fn collect_pairs(inputs: &Path, targets: &Path) -> Result<Vec<ImagePair>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(inputs)
        .with_context(|| format!("read input directory {}", inputs.display()))?
    {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if path.is_file() && is_image {
            files.push(path);
        }
    }
    files.sort();

    let mut pairs = Vec::with_capacity(files.len());
    for input in files {
        let Some(file_name) = input.file_name() else {
            continue;
        };
        let target = targets.join(file_name);
        if !target.is_file() {
            tracing::warn!(input = %input.display(), "No matching target, skipping");
            continue;
        }
        pairs.push(ImagePair {
            name: file_name.to_string_lossy().into_owned(),
            input,
            target,
        });
    }
    if pairs.is_empty() {
        anyhow::bail!(
            "no image pairs found in {} / {}",
            inputs.display(),
            targets.display()
        );
    }
    Ok(pairs)
}

// ── Image I/O ───────────────────────────────────────────────────────────────

/// Decode an image file into a `[3, H, W]` f32 tensor in `[0, 1]`.
pub fn load_rgb(path: &Path) -> Result<Tensor> {
    let img = image::open(path)
        .with_context(|| format!("decode {}", path.display()))?
        .to_rgb32f();
    let (w, h) = img.dimensions();
    let hwc = Tensor::from_vec(img.into_raw(), (h as usize, w as usize, 3), &Device::Cpu)?;
    Ok(hwc.permute((2, 0, 1))?.contiguous()?)
}

/// Write a `[1, 3, H, W]` or `[3, H, W]` tensor as an 8-bit image.
///
/// Values are clamped to `[0, 1]`; the format follows the file extension.
pub fn save_image(image: &Tensor, path: &Path) -> Result<()> {
    let chw = match image.rank() {
        4 => image.get(0)?,
        3 => image.clone(),
        r => anyhow::bail!("save_image expects rank 3 or 4, got rank {r}"),
    };
    let hwc = chw
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .clamp(0f32, 1f32)?
        .permute((1, 2, 0))?
        .contiguous()?;
    let (h, w, c) = hwc.dims3()?;
    if c != 3 {
        anyhow::bail!("save_image expects 3 channels, got {c}");
    }
    let data = hwc.flatten_all()?.to_vec1::<f32>()?;
    let buffer = Rgb32FImage::from_raw(w as u32, h as u32, data)
        .context("pixel buffer does not match image size")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    DynamicImage::ImageRgb32F(buffer)
        .to_rgb8()
        .save(path)
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

// ── Batches ─────────────────────────────────────────────────────────────────

/// Collated samples: `input[B, ...]`, `target[B, 3, H, W]`, one name per sample.
#[derive(Debug, Clone)]
pub struct Batch {
    pub input: Tensor,
    pub target: Tensor,
    pub names: Vec<String>,
}

impl Batch {
    /// Stack samples along a new leading dimension.
    pub fn collate(samples: Vec<Sample>) -> Result<Self> {
        if samples.is_empty() {
            anyhow::bail!("cannot collate an empty batch");
        }
        let inputs: Vec<Tensor> = samples.iter().map(|s| s.input.clone()).collect();
        let targets: Vec<Tensor> = samples.iter().map(|s| s.target.clone()).collect();
        Ok(Self {
            input: Tensor::stack(&inputs, 0)?,
            target: Tensor::stack(&targets, 0)?,
            names: samples.into_iter().map(|s| s.name).collect(),
        })
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            input: self.input.to_device(device)?,
            target: self.target.to_device(device)?,
            names: self.names.clone(),
        })
    }
}

// ── DataLoader ──────────────────────────────────────────────────────────────

/// Batching policy.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    pub drop_last: bool,
    /// Prefetch threads; 0 decodes on the consumer thread.
    pub num_workers: usize,
    pub seed: u64,
}

impl LoaderConfig {
    /// Shuffled, incomplete trailing batch dropped.
    pub fn training(batch_size: usize, num_workers: usize, seed: u64) -> Self {
        Self {
            batch_size,
            shuffle: true,
            drop_last: true,
            num_workers,
            seed,
        }
    }

    /// One image per batch in dataset order.
    pub fn evaluation(num_workers: usize) -> Self {
        Self {
            batch_size: 1,
            shuffle: false,
            drop_last: false,
            num_workers,
            seed: 0,
        }
    }
}

/// Orders, collates and prefetches batches from a [`PairedDataset`].
pub struct DataLoader {
    dataset: Arc<dyn PairedDataset>,
    config: LoaderConfig,
}

impl DataLoader {
    pub fn new(dataset: Arc<dyn PairedDataset>, config: LoaderConfig) -> Self {
        Self { dataset, config }
    }

    /// Batches per epoch (iterations per epoch for the training loop).
    pub fn num_batches(&self) -> usize {
        let n = self.dataset.len();
        let bs = self.config.batch_size.max(1);
        if self.config.drop_last {
            n / bs
        } else {
            n.div_ceil(bs)
        }
    }

    /// Sample indices of every batch in `epoch`.
    fn batch_plan(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);
        }
        let bs = self.config.batch_size.max(1);
        indices
            .chunks(bs)
            .filter(|c| !self.config.drop_last || c.len() == bs)
            .map(|c| c.to_vec())
            .collect()
    }

    /// Iterate `epoch`, starting at batch `skip`.
    ///
    /// Skipped batches are never decoded. Items are `(iteration, batch)`
    /// with `iteration` counted from the start of the epoch.
    pub fn iter_epoch(&self, epoch: usize, skip: usize) -> EpochIter {
        let plan = Arc::new(self.batch_plan(epoch));
        let seed = self.config.seed;
        let source = if self.config.num_workers == 0 {
            BatchSource::Inline {
                dataset: Arc::clone(&self.dataset),
            }
        } else {
            spawn_prefetch(
                Arc::clone(&self.dataset),
                Arc::clone(&plan),
                skip,
                self.config.num_workers,
                seed,
                epoch,
            )
        };
        EpochIter {
            plan,
            next: skip,
            seed,
            epoch,
            source,
        }
    }
}

type Prefetched = (usize, Result<Batch>);

enum BatchSource {
    Inline {
        dataset: Arc<dyn PairedDataset>,
    },
    Prefetch {
        rx: Option<Receiver<Prefetched>>,
        pending: BTreeMap<usize, Result<Batch>>,
        workers: Vec<JoinHandle<()>>,
    },
}

/// Producer threads own a dataset handle and stride over the batch plan so
/// the training thread only blocks on `recv`.
fn spawn_prefetch(
    dataset: Arc<dyn PairedDataset>,
    plan: Arc<Vec<Vec<usize>>>,
    skip: usize,
    num_workers: usize,
    seed: u64,
    epoch: usize,
) -> BatchSource {
    let (tx, rx) = mpsc::sync_channel::<Prefetched>(PREFETCH_BUFFER);
    let workers = (0..num_workers)
        .map(|w| {
            let tx = tx.clone();
            let dataset = Arc::clone(&dataset);
            let plan = Arc::clone(&plan);
            thread::spawn(move || {
                for b in (skip + w..plan.len()).step_by(num_workers) {
                    let batch = load_batch(dataset.as_ref(), &plan[b], seed, epoch);
                    if tx.send((b, batch)).is_err() {
                        return;
                    }
                }
            })
        })
        .collect();
    BatchSource::Prefetch {
        rx: Some(rx),
        pending: BTreeMap::new(),
        workers,
    }
}

fn sample_rng(seed: u64, epoch: usize, index: usize) -> StdRng {
    let mixed = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ ((epoch as u64) << 32) ^ index as u64;
    StdRng::seed_from_u64(mixed)
}

fn load_batch(
    dataset: &dyn PairedDataset,
    indices: &[usize],
    seed: u64,
    epoch: usize,
) -> Result<Batch> {
    let samples = indices
        .iter()
        .map(|&i| dataset.get(i, &mut sample_rng(seed, epoch, i)))
        .collect::<Result<Vec<_>>>()?;
    Batch::collate(samples)
}

/// Batches of one epoch in plan order.
pub struct EpochIter {
    plan: Arc<Vec<Vec<usize>>>,
    next: usize,
    seed: u64,
    epoch: usize,
    source: BatchSource,
}

impl Iterator for EpochIter {
    type Item = (usize, Result<Batch>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.plan.len() {
            return None;
        }
        let b = self.next;
        self.next += 1;
        match &mut self.source {
            BatchSource::Inline { dataset } => Some((
                b,
                load_batch(dataset.as_ref(), &self.plan[b], self.seed, self.epoch),
            )),
            BatchSource::Prefetch { rx, pending, .. } => loop {
                if let Some(batch) = pending.remove(&b) {
                    return Some((b, batch));
                }
                let received = rx.as_ref().map(|rx| rx.recv());
                match received {
                    Some(Ok((idx, batch))) => {
                        pending.insert(idx, batch);
                    }
                    _ => {
                        return Some((
                            b,
                            Err(anyhow::anyhow!("prefetch workers exited before batch {b}")),
                        ))
                    }
                }
            },
        }
    }
}

impl Drop for EpochIter {
    fn drop(&mut self) {
        if let BatchSource::Prefetch { rx, workers, .. } = &mut self.source {
            // Closing the channel unblocks any worker waiting on `send`.
            drop(rx.take());
            for handle in workers.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_sample(value: f32, name: &str) -> Sample {
        let dev = Device::Cpu;
        Sample {
            input: Tensor::full(value, (2, 3, 4, 4), &dev).unwrap(),
            target: Tensor::full(value, (3, 4, 4), &dev).unwrap(),
            name: name.to_string(),
        }
    }

    fn dataset(n: usize) -> Arc<dyn PairedDataset> {
        let samples = (0..n)
            .map(|i| gray_sample(i as f32 / n as f32, &format!("{i}.png")))
            .collect();
        Arc::new(InMemoryDataset::new(samples))
    }

    #[test]
    fn collate_adds_leading_dimension() {
        let batch = Batch::collate(vec![gray_sample(0.5, "a.png")]).unwrap();
        assert_eq!(batch.input.dims(), &[1, 2, 3, 4, 4]);
        assert_eq!(batch.target.dims(), &[1, 3, 4, 4]);
        assert_eq!(batch.names, vec!["a.png".to_string()]);
    }

    #[test]
    fn num_batches_respects_drop_last() {
        let ds = dataset(10);
        let train = DataLoader::new(Arc::clone(&ds), LoaderConfig::training(3, 0, 1));
        assert_eq!(train.num_batches(), 3);
        let eval = DataLoader::new(
            ds,
            LoaderConfig {
                batch_size: 3,
                ..LoaderConfig::evaluation(0)
            },
        );
        assert_eq!(eval.num_batches(), 4);
    }

    #[test]
    fn shuffle_is_deterministic_per_epoch() {
        let loader = DataLoader::new(dataset(16), LoaderConfig::training(1, 0, 7));
        assert_eq!(loader.batch_plan(3), loader.batch_plan(3));
        assert_ne!(loader.batch_plan(0), loader.batch_plan(1));
    }

    #[test]
    fn skip_starts_mid_epoch() {
        let loader = DataLoader::new(dataset(6), LoaderConfig::evaluation(0));
        let iterations: Vec<usize> = loader.iter_epoch(0, 4).map(|(i, _)| i).collect();
        assert_eq!(iterations, vec![4, 5]);
    }

    #[test]
    fn prefetch_matches_inline_order() {
        let ds = dataset(9);
        let inline = DataLoader::new(Arc::clone(&ds), LoaderConfig::training(2, 0, 5));
        let prefetch = DataLoader::new(ds, LoaderConfig::training(2, 3, 5));
        let a: Vec<Vec<String>> = inline
            .iter_epoch(2, 1)
            .map(|(_, b)| b.unwrap().names)
            .collect();
        let b: Vec<Vec<String>> = prefetch
            .iter_epoch(2, 1)
            .map(|(_, b)| b.unwrap().names)
            .collect();
        assert_eq!(a.len(), 3);
        assert_eq!(a, b);
    }

    #[test]
    fn dropping_iterator_early_stops_workers() {
        let loader = DataLoader::new(dataset(64), LoaderConfig::training(1, 4, 0));
        let mut iter = loader.iter_epoch(0, 0);
        assert!(iter.next().is_some());
        drop(iter);
    }

    #[test]
    fn crop_variants_shapes() {
        let dev = Device::Cpu;
        let input = Tensor::rand(0f32, 1f32, (3, 12, 10), &dev).unwrap();
        let target = Tensor::rand(0f32, 1f32, (3, 12, 10), &dev).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let (inputs, target) = crop_variants(&input, &target, 8, 6, &mut rng).unwrap();
        assert_eq!(inputs.dims(), &[8, 3, 6, 6]);
        assert_eq!(target.dims(), &[3, 6, 6]);
        let max = inputs.max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(max <= 1.0);
    }

    #[test]
    fn flipped_crops_mirror_the_window() {
        let dev = Device::Cpu;
        let input = Tensor::rand(0f32, 1f32, (3, 5, 4), &dev).unwrap();
        let original: Vec<f32> = input.flatten_all().unwrap().to_vec1().unwrap();
        let mirrored: Vec<f32> = flip_horizontal(&input)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for c in 0..3 {
            for y in 0..5 {
                for x in 0..4 {
                    let at = |xx: usize| (c * 5 + y) * 4 + xx;
                    assert_eq!(mirrored[at(x)], original[at(3 - x)]);
                }
            }
        }

        // Full-size window: the target is either untouched or mirrored.
        let mut flips = 0;
        for seed in 0..16 {
            let mut rng = StdRng::seed_from_u64(seed);
            let (_, target) = crop_variants(&input, &input, 2, 8, &mut rng).unwrap();
            let target: Vec<f32> = target.flatten_all().unwrap().to_vec1().unwrap();
            if target == mirrored {
                flips += 1;
            } else {
                assert_eq!(target, original);
            }
        }
        assert!(flips > 0 && flips < 16);
    }

    #[test]
    fn training_folder_yields_every_crop() {
        let dir = tempfile::tempdir().unwrap();
        let dev = Device::Cpu;
        let image = Tensor::rand(0f32, 1f32, (1, 3, 40, 40), &dev).unwrap();
        save_image(&image, &dir.path().join("low").join("a.png")).unwrap();
        save_image(&image, &dir.path().join("high").join("a.png")).unwrap();

        let ds = ImageFolderDataset::training(dir.path(), "high", 8, 16).unwrap();
        for seed in 0..40 {
            let sample = ds
                .get(0, &mut StdRng::seed_from_u64(seed))
                .unwrap_or_else(|e| panic!("seed {seed}: {e:#}"));
            assert_eq!(sample.input.dims(), &[8, 3, 16, 16]);
            assert_eq!(sample.target.dims(), &[3, 16, 16]);
        }
    }

    #[test]
    fn image_files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let low = dir.path().join("low");
        let high = dir.path().join("high");
        let dev = Device::Cpu;
        let image = Tensor::rand(0f32, 1f32, (1, 3, 8, 6), &dev).unwrap();
        save_image(&image, &low.join("a.png")).unwrap();
        save_image(&image, &high.join("a.png")).unwrap();
        save_image(&image, &low.join("orphan.png")).unwrap();

        let ds = ImageFolderDataset::evaluation(dir.path()).unwrap();
        assert_eq!(ds.len(), 1);
        let sample = ds.get(0, &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(sample.input.dims(), &[3, 8, 6]);
        assert_eq!(sample.name, "a.png");

        // 8-bit quantisation error is at most half a level.
        let diff = (sample.input - image.get(0).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff <= 0.5 / 255.0 + 1e-4);
    }
}
