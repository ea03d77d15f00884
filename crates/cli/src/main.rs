//! CLI for training the region animator.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use animator_common::{AnimatorConfig, FramesDataset};
use animator_train::{ExecutionStrategy, Logger, Trainer};

#[derive(Parser, Debug)]
#[command(name = "animator-train", about = "Train the region-based image animator")]
struct Args {
    /// YAML run configuration.
    #[arg(long)]
    config: PathBuf,
    /// Checkpoint to resume from; its epoch tag becomes the start epoch.
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    /// CUDA devices to replicate the step over.
    #[arg(long = "device-ids", value_delimiter = ',', default_value = "0")]
    device_ids: Vec<usize>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = AnimatorConfig::load(&args.config)?;
    let (device, strategy) =
        ExecutionStrategy::select(&args.device_ids, config.train_params.use_sync_bn)?;

    let mut trainer = Trainer::new(config.clone(), device, strategy, args.checkpoint.as_deref())?;
    let dataset = FramesDataset::new(&config.dataset_params)?;

    let mut logger = Logger::new(&config.log_dir, &config.visualizer_params)?;
    config.save(&config.log_dir.join("config.yaml"))?;
    tracing::info!(log_dir = %config.log_dir.display(), "starting run");

    trainer.train(Arc::new(dataset), &mut logger)?;
    Ok(())
}
