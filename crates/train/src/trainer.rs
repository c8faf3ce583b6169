//! Trainer: the epoch/iteration state machine around [`ForwardPipeline`].
//!
//! Per iteration: fetch → forward (training) → backward → optimiser step →
//! record scalars → `step += 1`. A failing iteration yields
//! [`StepOutcome::Skipped`] and the loop moves on without advancing the
//! step counter. Validation, checkpointing, sampling, test-on-start,
//! resumption and interrupts are handled in [`Trainer::run`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use candle_core::Device;
use indicatif::{ProgressBar, ProgressStyle};

use canet_common::{save_image, Batch, DataLoader, OptimizerKind, RunConfig};
use canet_core::{ForwardPipeline, Mode};

use crate::checkpoint::{interrupt_name, periodic_name, save_checkpoint, validation_name};
use crate::metrics::MetricWriter;
use crate::optimizer::TrainOptimizer;
use crate::scheduler::CosineLr;
use crate::strategy::{BatchMetrics, ExecutionStrategy};

// ── Config ──────────────────────────────────────────────────────────────────

/// Loop-level knobs, usually derived from [`RunConfig`].
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub num_epochs: usize,
    pub val_interval: usize,
    /// Steps between mid-epoch checkpoints; 0 disables them.
    pub save_interval: usize,
    pub lr: f64,
    pub lr_min: f64,
    pub optim: OptimizerKind,
    pub sampling: bool,
    pub test_on_start: bool,
    pub no_scheduler: bool,
    /// Checkpoints land here; validation images under `results/{epoch:03}`.
    pub checkpoint_dir: PathBuf,
    pub save_images: bool,
}

impl TrainerConfig {
    pub fn from_run_config(config: &RunConfig, checkpoint_dir: PathBuf) -> Self {
        Self {
            num_epochs: config.num_epochs,
            val_interval: config.val_interval,
            save_interval: config.save_interval,
            lr: config.lr,
            lr_min: config.lr_min,
            optim: config.optim,
            sampling: config.sampling,
            test_on_start: config.test_on_start,
            no_scheduler: config.no_sche,
            checkpoint_dir,
            save_images: true,
        }
    }
}

// ── Outcomes ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub step: usize,
    pub epoch: usize,
    pub iteration: usize,
    pub loss: f64,
    pub chroma_loss_1: f64,
    pub chroma_loss_2: f64,
    pub reconstruction_loss: f64,
    pub psnr: f64,
    pub ssim: f64,
    pub lr: f64,
}

/// Result of one training iteration.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Completed(StepMetrics),
    Skipped { reason: String },
}

#[derive(Debug, Clone)]
pub struct ValidationSummary {
    pub epoch: usize,
    pub step: usize,
    pub loss: f64,
    pub psnr: f64,
    pub ssim: f64,
    pub checkpoint: PathBuf,
}

/// How [`Trainer::run`] ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Finished {
        step: usize,
        last_validation: Option<ValidationSummary>,
    },
    /// `sampling` was set: one validation pass, no training.
    Sampled(Option<ValidationSummary>),
    Interrupted {
        checkpoint: PathBuf,
        step: usize,
    },
}

/// Where a resumed run picks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    /// Epochs before this one are skipped entirely.
    pub last_epoch: usize,
    /// Iterations of `last_epoch` already done.
    pub skip: usize,
}

impl ResumePoint {
    pub fn from_step(step: usize, iterations_per_epoch: usize) -> Self {
        if iterations_per_epoch == 0 {
            return Self {
                last_epoch: 0,
                skip: 0,
            };
        }
        let last_epoch = step / iterations_per_epoch;
        Self {
            last_epoch,
            skip: step - last_epoch * iterations_per_epoch,
        }
    }
}

// ── Trainer ─────────────────────────────────────────────────────────────────

pub struct Trainer {
    pipeline: ForwardPipeline,
    optimizer: TrainOptimizer,
    scheduler: CosineLr,
    strategy: Box<dyn ExecutionStrategy>,
    writer: Box<dyn MetricWriter>,
    interrupt: Arc<AtomicBool>,
    config: TrainerConfig,
    device: Device,
    pub global_step: usize,
}

impl Trainer {
    /// Only the colour network's variables are handed to the optimiser.
    pub fn new(
        pipeline: ForwardPipeline,
        config: TrainerConfig,
        strategy: Box<dyn ExecutionStrategy>,
        writer: Box<dyn MetricWriter>,
        device: Device,
    ) -> anyhow::Result<Self> {
        let optimizer = TrainOptimizer::new(config.optim, pipeline.color().vars(), config.lr)?;
        let scheduler = CosineLr::new(config.lr, config.lr_min, config.num_epochs);
        tracing::info!(
            illumination = pipeline.illumination().name(),
            color = pipeline.color().name(),
            trainable_params = pipeline.color().num_parameters(),
            optimizer = %config.optim,
            strategy = strategy.name(),
            "Trainer ready"
        );
        Ok(Self {
            pipeline,
            optimizer,
            scheduler,
            strategy,
            writer,
            interrupt: Arc::new(AtomicBool::new(false)),
            config,
            device,
            global_step: 0,
        })
    }

    /// Continue counting from `step` (resumed run).
    pub fn with_start_step(mut self, step: usize) -> Self {
        self.global_step = step;
        self
    }

    /// Share an externally owned interrupt flag (e.g. set by a signal handler).
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = flag;
        self
    }

    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn pipeline(&self) -> &ForwardPipeline {
        &self.pipeline
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    fn model_name(&self) -> &str {
        self.pipeline.color().name()
    }

    // ── Main loop ───────────────────────────────────────────────────────────

    pub fn run(&mut self, train: &DataLoader, val: &DataLoader) -> anyhow::Result<RunOutcome> {
        let ipe = train.num_batches();
        if ipe == 0 && !self.config.sampling {
            anyhow::bail!("training set yields no batches (fewer samples than batch_size?)");
        }
        let resume = ResumePoint::from_step(self.global_step, ipe);
        if resume.last_epoch > 0 && !self.config.no_scheduler {
            self.scheduler.set_epoch(resume.last_epoch);
        }
        self.optimizer.set_learning_rate(self.scheduler.current_lr());
        if self.global_step > 0 {
            tracing::info!(
                step = self.global_step,
                epoch = resume.last_epoch,
                skip = resume.skip,
                "Resuming"
            );
        }

        let mut skip_training = self.config.sampling || self.config.test_on_start;
        let mut last_validation = None;
        for epoch in 0..self.config.num_epochs {
            if epoch < resume.last_epoch {
                continue;
            }
            if self.interrupted() {
                return self.on_interrupt(epoch);
            }

            if !skip_training {
                let skip = if epoch == resume.last_epoch {
                    resume.skip
                } else {
                    0
                };
                if let Some(outcome) = self.train_epoch(train, epoch, skip)? {
                    return Ok(outcome);
                }
            }

            if !self.config.no_scheduler {
                self.scheduler.advance();
                self.optimizer.set_learning_rate(self.scheduler.current_lr());
            }

            if epoch % self.config.val_interval.max(1) == 0 {
                last_validation = Some(self.validate(val, epoch)?);
            }

            if self.config.sampling {
                self.writer.flush()?;
                return Ok(RunOutcome::Sampled(last_validation));
            }
            skip_training = false;
        }

        self.writer.flush()?;
        Ok(RunOutcome::Finished {
            step: self.global_step,
            last_validation,
        })
    }

    /// Returns `Some` when the epoch was cut short by an interrupt.
    fn train_epoch(
        &mut self,
        loader: &DataLoader,
        epoch: usize,
        skip: usize,
    ) -> anyhow::Result<Option<RunOutcome>> {
        let ipe = loader.num_batches();
        let pb = ProgressBar::new(ipe as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        pb.set_position(skip as u64);

        for (iteration, batch) in loader.iter_epoch(epoch, skip) {
            if self.interrupted() {
                pb.abandon();
                return self.on_interrupt(epoch).map(Some);
            }
            let outcome = match batch {
                Ok(batch) => self.train_step(&batch, epoch, iteration)?,
                Err(e) => StepOutcome::Skipped {
                    reason: format!("load batch: {e:#}"),
                },
            };
            match &outcome {
                StepOutcome::Completed(m) => {
                    pb.set_message(format!(
                        "Step: {}. Epoch: {}/{}. Iteration: {}/{}. chroma_loss_1: {:.5}, chroma_loss_2: {:.5}, reconstruction_loss: {:.5}, psnr: {:.5}, ssim: {:.5}",
                        m.step,
                        epoch,
                        self.config.num_epochs,
                        iteration + 1,
                        ipe,
                        m.chroma_loss_1,
                        m.chroma_loss_2,
                        m.reconstruction_loss,
                        m.psnr,
                        m.ssim,
                    ));
                    if self.config.save_interval > 0
                        && self.global_step % self.config.save_interval == 0
                    {
                        let name = periodic_name(self.model_name(), epoch, self.global_step);
                        save_checkpoint(
                            self.pipeline.color(),
                            &self.config.checkpoint_dir,
                            &name,
                            epoch,
                            self.global_step,
                        )?;
                    }
                }
                StepOutcome::Skipped { reason } => {
                    tracing::warn!(epoch, iteration, step = self.global_step, %reason, "Skipped iteration");
                }
            }
            pb.inc(1);
        }
        pb.finish_and_clear();
        Ok(None)
    }

    /// One training iteration. Compute failures become `Skipped`; only
    /// metric-writer failures propagate.
    pub fn train_step(
        &mut self,
        batch: &Batch,
        epoch: usize,
        iteration: usize,
    ) -> anyhow::Result<StepOutcome> {
        let metrics = match self.compute_step(batch) {
            Ok(m) => m,
            Err(e) => {
                return Ok(StepOutcome::Skipped {
                    reason: format!("{e:#}"),
                })
            }
        };
        let step = self.global_step;
        let lr = self.optimizer.learning_rate();
        let loss = metrics.loss();
        self.writer.add_scalar("Loss/train", loss, step)?;
        self.writer.add_scalar("PSNR/train", metrics.psnr, step)?;
        self.writer.add_scalar("SSIM/train", metrics.ssim, step)?;
        self.writer.add_scalar("learning_rate", lr, step)?;
        tracing::debug!(step, epoch, iteration, loss, psnr = metrics.psnr, ssim = metrics.ssim, "Train step");
        self.global_step += 1;

        Ok(StepOutcome::Completed(StepMetrics {
            step,
            epoch,
            iteration,
            loss,
            chroma_loss_1: metrics.chroma_loss_1,
            chroma_loss_2: metrics.chroma_loss_2,
            reconstruction_loss: metrics.reconstruction_loss,
            psnr: metrics.psnr,
            ssim: metrics.ssim,
            lr,
        }))
    }

    fn compute_step(&mut self, batch: &Batch) -> anyhow::Result<BatchMetrics> {
        let batch = batch.to_device(&self.device)?;
        let (image, target) = ForwardPipeline::align(&batch.input, &batch.target, Mode::Train)?;
        let (grads, metrics) = self
            .strategy
            .forward_backward(&self.pipeline, &image, &target)?;
        if !metrics.loss().is_finite() {
            anyhow::bail!("non-finite loss {}", metrics.loss());
        }
        self.optimizer.step(&grads)?;
        Ok(metrics)
    }

    // ── Validation ──────────────────────────────────────────────────────────

    /// Evaluation pass: mean loss/psnr/ssim, images, scalars, checkpoint.
    pub fn validate(&mut self, loader: &DataLoader, epoch: usize) -> anyhow::Result<ValidationSummary> {
        let results_dir = self
            .config
            .checkpoint_dir
            .join("results")
            .join(format!("{epoch:03}"));
        let (mut loss, mut psnr, mut ssim) = (0.0, 0.0, 0.0);
        let mut count = 0usize;

        for (_, batch) in loader.iter_epoch(0, 0) {
            let batch = batch.context("load evaluation batch")?.to_device(&self.device)?;
            let (image, target) = ForwardPipeline::align(&batch.input, &batch.target, Mode::Eval)?;
            let output = self.pipeline.forward_aligned(&image, &target, Mode::Eval)?;
            let metrics = BatchMetrics::from_output(&output)?;
            if self.config.save_images {
                save_triplets(&results_dir, &batch.names, &output.image, &image, &target)?;
            }
            loss += metrics.loss();
            psnr += metrics.psnr;
            ssim += metrics.ssim;
            count += 1;
        }
        if count == 0 {
            anyhow::bail!("evaluation set is empty");
        }
        let n = count as f64;
        let (loss, psnr, ssim) = (loss / n, psnr / n, ssim / n);
        let step = self.global_step;
        tracing::info!(epoch, num_epochs = self.config.num_epochs, loss, psnr, ssim, "Validation");
        self.writer.add_scalar("Loss/val", loss, step)?;
        self.writer.add_scalar("PSNR/val", psnr, step)?;
        self.writer.add_scalar("SSIM/val", ssim, step)?;

        let name = validation_name(self.model_name(), epoch, psnr, ssim, step);
        let checkpoint = save_checkpoint(
            self.pipeline.color(),
            &self.config.checkpoint_dir,
            &name,
            epoch,
            step,
        )?;
        Ok(ValidationSummary {
            epoch,
            step,
            loss,
            psnr,
            ssim,
            checkpoint,
        })
    }

    fn on_interrupt(&mut self, epoch: usize) -> anyhow::Result<RunOutcome> {
        let step = self.global_step;
        let name = interrupt_name(self.model_name(), epoch, step);
        let checkpoint = save_checkpoint(
            self.pipeline.color(),
            &self.config.checkpoint_dir,
            &name,
            epoch,
            step,
        )?;
        self.writer.flush()?;
        tracing::warn!(epoch, step, path = %checkpoint.display(), "Interrupted");
        Ok(RunOutcome::Interrupted { checkpoint, step })
    }
}

/// `{stem}_out.png`, `{stem}_in.png`, `{stem}_gt.png` per sample.
fn save_triplets(
    dir: &Path,
    names: &[String],
    output: &candle_core::Tensor,
    input: &candle_core::Tensor,
    target: &candle_core::Tensor,
) -> anyhow::Result<()> {
    for (i, name) in names.iter().enumerate() {
        let stem = Path::new(name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{i}"));
        save_image(&output.get(i)?, &dir.join(format!("{stem}_out.png")))?;
        save_image(&input.get(i)?, &dir.join(format!("{stem}_in.png")))?;
        save_image(&target.get(i)?, &dir.join(format!("{stem}_gt.png")))?;
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_point_arithmetic() {
        assert_eq!(
            ResumePoint::from_step(250, 100),
            ResumePoint {
                last_epoch: 2,
                skip: 50
            }
        );
        assert_eq!(
            ResumePoint::from_step(0, 100),
            ResumePoint {
                last_epoch: 0,
                skip: 0
            }
        );
        assert_eq!(
            ResumePoint::from_step(300, 100),
            ResumePoint {
                last_epoch: 3,
                skip: 0
            }
        );
        assert_eq!(ResumePoint::from_step(7, 0).last_epoch, 0);
    }

    #[test]
    fn trainer_config_from_run_config() {
        let run = RunConfig {
            num_epochs: 3,
            no_sche: true,
            sampling: true,
            ..Default::default()
        };
        let cfg = TrainerConfig::from_run_config(&run, PathBuf::from("/tmp/x"));
        assert_eq!(cfg.num_epochs, 3);
        assert!(cfg.no_scheduler);
        assert!(cfg.sampling);
        assert_eq!(cfg.checkpoint_dir, PathBuf::from("/tmp/x"));
    }
}
