//! CLI entry point for world-model-trainer-rs.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use world_model_trainer_rs::config::TrainerConfig;
use world_model_trainer_rs::error::Result;
use world_model_trainer_rs::trainer::run_training;

#[derive(Parser)]
#[command(name = "world-model")]
#[command(about = "Truncated-BPTT training of LSTM latent-dynamics models")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: PathBuf,
    },
    /// Start training
    Train {
        /// Path to configuration file
        config: PathBuf,
        /// Checkpoint slot directory to restore model and optimizer from
        #[arg(long)]
        resume: Option<PathBuf>,
    },
    /// Generate a configuration file with default values
    Init {
        /// Output path for config file
        #[arg(default_value = "config.toml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config.display());
            let config = TrainerConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Model: {}", config.model.name);
            println!("  Data: {}", config.experiment.data_path.display());
            println!("  TBPTT stride: {}", config.trainer.tbptt_stride);
        }
        Commands::Train { config, resume } => {
            tracing::info!("Starting training with config: {}", config.display());
            let config = TrainerConfig::from_file(&config)?;
            let summary = run_training(&config, resume.as_deref())?;
            println!("✓ Trained {} epochs", summary.epochs_completed);
            if let Some(best) = summary.best_val_loss {
                println!("  Best validation loss: {best:.6}");
            }
        }
        Commands::Init { output } => {
            TrainerConfig::default().to_file(&output)?;
            println!("✓ Configuration written to: {}", output.display());
        }
    }

    Ok(())
}
