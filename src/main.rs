pub mod attention;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod decoder;
pub mod embeddings;
pub mod encoder;
pub mod error;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod recurrent;
pub mod train;
pub mod utils;
pub mod vocab;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::{Config, Mode};
use train::Trainer;

#[derive(Parser, Debug)]
#[command(
    name = "attention-seq2seq",
    version,
    about = "Train and run an attention-based LSTM sequence-to-sequence model."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train on the configured corpus, validating after every epoch.
    Train {
        #[command(flatten)]
        config: Config,
        #[arg(long)]
        valid_source_data_path: PathBuf,
        #[arg(long)]
        valid_target_data_path: PathBuf,
    },
    /// Restore the latest checkpoint and report loss on held-out data.
    Test {
        #[command(flatten)]
        config: Config,
        #[arg(long)]
        test_source_data_path: PathBuf,
        #[arg(long)]
        test_target_data_path: PathBuf,
    },
    /// Restore the latest checkpoint and greedily decode each source line.
    Sample {
        #[command(flatten)]
        config: Config,
        #[arg(long)]
        sample_source_data_path: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("attention_seq2seq=info".parse()?),
        )
        .init();

    match Cli::parse().command {
        Command::Train {
            config,
            valid_source_data_path,
            valid_target_data_path,
        } => {
            let mut trainer = Trainer::new(Config {
                mode: Mode::Train,
                ..config
            })?;
            let best = trainer.run(&valid_source_data_path, &valid_target_data_path)?;
            tracing::info!("best validation loss: {best:.4}");
        }
        Command::Test {
            config,
            test_source_data_path,
            test_target_data_path,
        } => {
            let mut trainer = Trainer::new(config)?;
            trainer.load()?;
            let loss = trainer.evaluate(&test_source_data_path, &test_target_data_path)?;
            tracing::info!(
                "[Test] [Loss: {:.4}] [Perplexity: {:.4}]",
                loss,
                metrics::perplexity(loss)
            );
        }
        Command::Sample {
            config,
            sample_source_data_path,
        } => {
            let mut trainer = Trainer::new(Config {
                mode: Mode::Inference,
                ..config
            })?;
            trainer.load()?;
            for line in trainer.sample(&sample_source_data_path)? {
                println!("{line}");
            }
        }
    }

    Ok(())
}
