//! # canet-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`RunConfig`]** — run hyper-parameters and paths (serialised as JSON).
//! * **[`OptimizerKind`]** — optimiser choice for the colour network.
//! * **[`PairedDataset`]** / **[`DataLoader`]** — paired image loading, batching & prefetch.
//! * **[`save_image`]** — tensor → image file.

pub mod config;
pub mod data;

pub use config::{OptimizerKind, RunConfig};
pub use data::{
    load_rgb, save_image, Batch, DataLoader, EpochIter, ImageFolderDataset, InMemoryDataset,
    LoaderConfig, PairedDataset, Sample,
};
