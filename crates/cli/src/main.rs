use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Args, Parser, Subcommand};

use canet_common::{
    DataLoader, ImageFolderDataset, InMemoryDataset, LoaderConfig, OptimizerKind, PairedDataset,
    RunConfig,
};
use canet_core::{
    ForwardPipeline, ModelRegistry, Network, PipelineConfig, COLOR_CHANNELS,
    ILLUMINATION_CHANNELS,
};
use canet_train::{
    select_strategy, CsvMetricWriter, RunOutcome, Trainer, TrainerConfig, TrainingState,
};

#[derive(Parser, Debug)]
#[command(name = "canet", about = "Train the low-light colour-adjustment network")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train the colour network behind a frozen illumination network.
    Train(RunArgs),
    /// Run one validation pass with the given weights and exit.
    Sample(RunArgs),
    /// List registered model names.
    Models,
}

// ── Run arguments ──────────────────────────────────────────────────────────────

/// Every option overrides the same field of the JSON config.
#[derive(Args, Debug, Default)]
struct RunArgs {
    /// JSON run configuration; missing fields take defaults.
    #[arg(long)]
    config: Option<PathBuf>,
    /// `0` runs on the CPU. `> 1` only shards each batch on the first
    /// device; no second accelerator is used.
    #[arg(long)]
    num_gpus: Option<usize>,
    #[arg(long)]
    num_workers: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    /// Illumination network.
    #[arg(long)]
    model1: Option<String>,
    /// Colour-adjustment network.
    #[arg(long)]
    model3: Option<String>,
    #[arg(long)]
    model1_weight: Option<PathBuf>,
    #[arg(long)]
    model3_weight: Option<PathBuf>,
    #[arg(long)]
    data_path: Option<PathBuf>,
    /// Ground-truth directory under `train/` (default `targets`).
    #[arg(long)]
    targets_split: Option<String>,
    #[arg(long)]
    crops: Option<usize>,
    #[arg(long)]
    crop_size: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    log_path: Option<PathBuf>,
    #[arg(long)]
    saved_path: Option<PathBuf>,
    #[arg(long)]
    comment: Option<String>,
    #[arg(long)]
    num_epochs: Option<usize>,
    #[arg(long)]
    val_interval: Option<usize>,
    /// Steps between mid-epoch checkpoints (0 disables).
    #[arg(long)]
    save_interval: Option<usize>,
    #[arg(long)]
    lr: Option<f64>,
    #[arg(long)]
    lr_min: Option<f64>,
    /// `adam` or `sgd`.
    #[arg(long)]
    optim: Option<OptimizerKind>,
    /// Log the parameter table of both networks.
    #[arg(long)]
    graph: bool,
    /// Ignore `model3_weight` and start the colour network from init.
    #[arg(long)]
    scratch: bool,
    #[arg(long)]
    sampling: bool,
    /// Validate before the first training epoch.
    #[arg(long)]
    test_on_start: bool,
    /// Keep the learning rate constant.
    #[arg(long)]
    no_sche: bool,
    /// Checkpoint to resume from; its `.json` sidecar supplies the step.
    #[arg(long)]
    resume: Option<PathBuf>,
}

impl RunArgs {
    fn into_config(self) -> Result<RunConfig> {
        let mut cfg = match &self.config {
            Some(path) => RunConfig::load(path)
                .with_context(|| format!("load config {}", path.display()))?,
            None => RunConfig::default(),
        };
        macro_rules! apply {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = self.$field { cfg.$field = v; })*
            };
        }
        apply!(
            num_gpus,
            num_workers,
            batch_size,
            model1,
            model3,
            data_path,
            targets_split,
            crops,
            crop_size,
            seed,
            log_path,
            saved_path,
            comment,
            num_epochs,
            val_interval,
            save_interval,
            lr,
            lr_min,
            optim,
        );
        if self.model1_weight.is_some() {
            cfg.model1_weight = self.model1_weight;
        }
        if self.model3_weight.is_some() {
            cfg.model3_weight = self.model3_weight;
        }
        if self.resume.is_some() {
            cfg.resume = self.resume;
        }
        cfg.graph |= self.graph;
        cfg.scratch |= self.scratch;
        cfg.sampling |= self.sampling;
        cfg.test_on_start |= self.test_on_start;
        cfg.no_sche |= self.no_sche;
        Ok(cfg)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => cmd_run(args.into_config()?),
        Command::Sample(args) => {
            let mut cfg = args.into_config()?;
            cfg.sampling = true;
            cmd_run(cfg)
        }
        Command::Models => {
            for name in ModelRegistry::with_defaults().names() {
                println!("{name}");
            }
            Ok(())
        }
    }
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_run(cfg: RunConfig) -> Result<()> {
    let registry = ModelRegistry::with_defaults();
    cfg.validate(&registry.names())?;

    let device = if cfg.num_gpus > 0 {
        Device::cuda_if_available(0)?
    } else {
        Device::Cpu
    };

    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();
    let run_dir = cfg.saved_path.join(&cfg.comment).join(&timestamp);
    let log_dir = cfg
        .log_path
        .join(&cfg.comment)
        .join(&timestamp)
        .join("tensorboard");
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("create {}", run_dir.display()))?;
    cfg.save(&run_dir.join("config.json"))?;
    tracing::info!(run_dir = %run_dir.display(), log_dir = %log_dir.display(), "Run directories");

    // Illumination network: frozen, pretrained weights are mandatory.
    let (in_c, out_c) = ILLUMINATION_CHANNELS;
    let illumination = registry.build(&cfg.model1, in_c, out_c, &device)?;
    let weights = cfg
        .model1_weight
        .as_deref()
        .context("model1_weight is required: the illumination network is never trained")?;
    illumination.load(weights)?;

    let (in_c, out_c) = COLOR_CHANNELS;
    let color = registry.build(&cfg.model3, in_c, out_c, &device)?;
    let start_step = load_color_weights(&color, &cfg)?;

    if cfg.graph {
        log_parameters(&illumination);
        log_parameters(&color);
    }

    let pipeline = ForwardPipeline::new(
        illumination,
        color,
        PipelineConfig::from_run_config(&cfg),
        &device,
    )?;

    let train_set: Arc<dyn PairedDataset> = if cfg.sampling {
        Arc::new(InMemoryDataset::new(Vec::new()))
    } else {
        Arc::new(ImageFolderDataset::training(
            &cfg.data_path.join("train"),
            &cfg.targets_split,
            cfg.crops,
            cfg.crop_size,
        )?)
    };
    let val_set = Arc::new(ImageFolderDataset::evaluation(&cfg.data_path.join("eval"))?);
    let train = DataLoader::new(
        train_set,
        LoaderConfig::training(cfg.batch_size, cfg.num_workers, cfg.seed),
    );
    let val = DataLoader::new(val_set, LoaderConfig::evaluation(cfg.num_workers));

    let interrupt = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&interrupt);
        ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
            .context("install interrupt handler")?;
    }

    let writer = CsvMetricWriter::create(&log_dir)?;
    let mut trainer = Trainer::new(
        pipeline,
        TrainerConfig::from_run_config(&cfg, run_dir.clone()),
        select_strategy(cfg.num_gpus),
        Box::new(writer),
        device,
    )?
    .with_start_step(start_step)
    .with_interrupt(interrupt);

    match trainer.run(&train, &val)? {
        RunOutcome::Finished {
            step,
            last_validation,
        } => {
            let best = last_validation.map(|v| v.checkpoint.display().to_string());
            tracing::info!(step, last_checkpoint = ?best, "Training done");
        }
        RunOutcome::Sampled(summary) => {
            if let Some(v) = summary {
                tracing::info!(psnr = v.psnr, ssim = v.ssim, loss = v.loss, "Sampling done");
            }
        }
        RunOutcome::Interrupted { checkpoint, step } => {
            tracing::info!(step, path = %checkpoint.display(), "Stopped by interrupt");
        }
    }
    Ok(())
}

/// Apply `--resume` or `model3_weight`; returns the step to continue from.
fn load_color_weights(color: &Network, cfg: &RunConfig) -> Result<usize> {
    if let Some(resume) = &cfg.resume {
        color.load(resume)?;
        let state = TrainingState::load(resume)?;
        if state.model_name != color.name() {
            anyhow::bail!(
                "checkpoint {} was written by '{}', not '{}'",
                resume.display(),
                state.model_name,
                color.name()
            );
        }
        return Ok(state.step);
    }
    match (&cfg.model3_weight, cfg.scratch) {
        (Some(path), false) => color.load(path)?,
        (Some(_), true) => tracing::info!("scratch: ignoring model3_weight"),
        (None, _) => {}
    }
    Ok(0)
}

fn log_parameters(network: &Network) {
    for p in network.parameter_table() {
        tracing::info!(model = network.name(), name = %p.name, shape = ?p.shape, elements = p.elements, "Parameter");
    }
    tracing::info!(model = network.name(), total = network.num_parameters(), "Parameters");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, r#"{"num_epochs": 7, "lr": 0.5, "comment": "file"}"#).unwrap();

        let args = RunArgs {
            config: Some(path),
            lr: Some(0.1),
            optim: Some(OptimizerKind::Sgd),
            no_sche: true,
            ..Default::default()
        };
        let cfg = args.into_config().unwrap();
        assert_eq!(cfg.num_epochs, 7);
        assert_eq!(cfg.lr, 0.1);
        assert_eq!(cfg.comment, "file");
        assert_eq!(cfg.optim, OptimizerKind::Sgd);
        assert!(cfg.no_sche);
        assert!(!cfg.scratch);
    }

    #[test]
    fn cli_parses_train_subcommand() {
        let cli = Cli::try_parse_from([
            "canet",
            "train",
            "--model1-weight",
            "illum.pth",
            "--optim",
            "sgd",
            "--test-on-start",
        ])
        .unwrap();
        match cli.command {
            Command::Train(args) => {
                assert_eq!(args.model1_weight, Some(PathBuf::from("illum.pth")));
                assert_eq!(args.optim, Some(OptimizerKind::Sgd));
                assert!(args.test_on_start);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn num_gpus_flag_shards_the_batch() {
        let cli = Cli::try_parse_from(["canet", "train", "--num-gpus", "2"]).unwrap();
        let Command::Train(args) = cli.command else {
            panic!("expected train");
        };
        let cfg = args.into_config().unwrap();
        assert_eq!(cfg.num_gpus, 2);
        assert_eq!(cfg.targets_split, "targets");
        assert_eq!(select_strategy(cfg.num_gpus).name(), "replicated");
    }

    #[test]
    fn unknown_optimizer_is_rejected() {
        assert!(Cli::try_parse_from(["canet", "train", "--optim", "rmsprop"]).is_err());
    }
}
