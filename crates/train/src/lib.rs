//! # canet-train — the optimisation loop
//!
//! * **[`Trainer`]** — owns the pipeline, optimiser, schedule and metric
//!   sink; [`Trainer::run`] drives epochs, validation, checkpoints,
//!   resumption and interrupts.
//! * **[`CosineLr`]** — per-epoch cosine decay to `lr_min`.
//! * **[`TrainOptimizer`]** — Adam or SGD with Nesterov momentum.
//! * **[`ExecutionStrategy`]** — `SingleDevice` or sharded `Replicated`.
//! * **[`MetricWriter`]** — `(name, value, step)` scalar sinks.

pub mod checkpoint;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod strategy;
pub mod trainer;

pub use checkpoint::{interrupt_name, periodic_name, validation_name, TrainingState};
pub use metrics::{CsvMetricWriter, MemoryMetricWriter, MetricWriter, ScalarRecord};
pub use optimizer::{ParamsSgd, SgdNesterov, TrainOptimizer};
pub use scheduler::CosineLr;
pub use strategy::{select_strategy, BatchMetrics, ExecutionStrategy, Replicated, SingleDevice};
pub use trainer::{
    ResumePoint, RunOutcome, StepMetrics, StepOutcome, Trainer, TrainerConfig, ValidationSummary,
};
