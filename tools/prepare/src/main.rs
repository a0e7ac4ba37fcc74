//! Dataset preparation tool.
//!
//! Flattens the downloaded chest X-ray archive, sorts every image into a
//! class directory by its filename token and splits each class into train
//! and test sets:
//!
//! ```text
//! prepare --image-dir chest_xray --output-dir artifacts --ratio 0.8 --seed 42
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use xray_core::{setup_cli_logging, SorterConfig};
use xray_dataset::ImageSorter;

/// Chest X-ray dataset preparation
#[derive(Parser, Debug)]
#[command(
    name = "prepare",
    about = "Sort chest X-ray images by class and split them into train/test sets"
)]
struct Args {
    /// Directory holding the raw images (sorted in place)
    #[arg(short, long, value_name = "DIR", default_value = "chest_xray")]
    image_dir: PathBuf,

    /// Directory receiving the train/ and test/ trees
    #[arg(short, long, value_name = "DIR", default_value = "artifacts")]
    output_dir: PathBuf,

    /// Fraction of each class assigned to the training set
    #[arg(short, long, default_value = "0.8")]
    ratio: f64,

    /// Seed of the split shuffle
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn sorter_config(&self) -> SorterConfig {
        SorterConfig {
            image_dir: self.image_dir.clone(),
            output_dir: self.output_dir.clone(),
            train_ratio: self.ratio,
            seed: self.seed,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_cli_logging(args.verbose).context("Failed to initialize logging")?;

    let config = args.sorter_config();
    config.validate().context("Invalid sorter configuration")?;

    info!("Chest X-ray dataset preparation");
    info!("  Image dir:  {}", config.image_dir.display());
    info!("  Output dir: {}", config.output_dir.display());
    info!("  Ratio:      {}", config.train_ratio);
    info!("  Seed:       {}", config.seed);

    let split = ImageSorter::new(config)
        .initiate_image_sorting()
        .context("Failed to prepare the dataset")?;

    for class in &split.classes {
        info!("  {:<10} {:>5} train {:>5} test", class.class.token(), class.train, class.test);
    }
    info!(
        "Split complete: {} train / {} test",
        split.total_train(),
        split.total_test()
    );

    Ok(())
}
