use anyhow::Context;
use burn::backend::{Autodiff, NdArray};
use clap::Parser;
use std::path::PathBuf;
use yolov5_detection::data::SyntheticBatches;
use yolov5_detection::training::{Trainer, TrainingConfig};

type MyBackend = NdArray;
type MyAutodiffBackend = Autodiff<MyBackend>;

/// Train the anchor-based detector on synthetic batches.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// YAML training config; written with defaults if it does not exist.
    #[arg(long, default_value = "configs/train_config.yaml")]
    config: PathBuf,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batches_per_epoch: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    save_dir: Option<String>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = if args.config.exists() {
        log::info!("loading config from {}", args.config.display());
        TrainingConfig::from_yaml(&args.config)?
    } else {
        let config = TrainingConfig::default();
        config
            .save(&args.config)
            .context("writing default config")?;
        log::info!("created default config at {}", args.config.display());
        config
    };

    if let Some(epochs) = args.epochs {
        config.epochs = epochs;
    }
    if let Some(batches) = args.batches_per_epoch {
        config.batches_per_epoch = batches;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(save_dir) = args.save_dir {
        config.save_dir = save_dir;
    }

    log::info!("training configuration:");
    log::info!("  epochs: {}", config.epochs);
    log::info!("  batches per epoch: {}", config.batches_per_epoch);
    log::info!("  batch size: {}", config.yolo.batch_size);
    log::info!("  learning rate: {}", config.learning_rate);
    log::info!(
        "  image size: {}x{}",
        config.yolo.image_size[0],
        config.yolo.image_size[1]
    );
    log::info!("  save dir: {}", config.save_dir);

    let device = Default::default();
    let batches = SyntheticBatches::<MyAutodiffBackend>::new(
        &config.yolo,
        config.max_instances,
        config.seed,
        device,
    );
    let mut trainer = Trainer::<MyAutodiffBackend>::new(config, Default::default())?;
    trainer.train(batches)?;

    Ok(())
}
