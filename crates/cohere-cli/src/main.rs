//! Cohere command-line interface.
//!
//! Simulate a ptychography scan and reconstruct it from a TOML job file:
//! ```sh
//! cohere run job.toml
//! cohere validate job.toml
//! ```

mod config;
mod runner;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cohere")]
#[command(about = "Cohere: differentiable coherent diffraction imaging")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate and reconstruct the scan described by a TOML job file.
    Run {
        /// Path to the job configuration file.
        config: PathBuf,
        /// Output directory (overrides config file setting).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate a configuration file without running anything.
    Validate {
        /// Path to the job configuration file.
        config: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, output } => {
            println!("Cohere Reconstruction");
            println!("=====================");
            let job = config::load_config(&config)?;
            println!("Configuration: {}", config.display());

            let simulation = runner::simulate(&job.simulation)?;
            let rec = runner::reconstruct(&job, &simulation)?;

            let out_dir = output.unwrap_or_else(|| PathBuf::from(&job.output.directory));
            if job.output.save_loss {
                runner::write_loss_csv(rec.loss_history(), &out_dir.join("loss.csv"))?;
            }
            if job.output.save_results {
                runner::write_results_json(&rec.save_results(), &out_dir.join("results.json"))?;
            }

            println!("Reconstruction complete.");
            Ok(())
        }
        Commands::Validate { config } => {
            let job = config::load_config(&config)?;
            job.optimizer.build()?;
            job.reconstruction.validate()?;
            if let Some(scheduler) = &job.reconstruction.scheduler {
                scheduler.build(job.optimizer.learning_rate())?;
            }
            println!("Configuration is valid: {}", config.display());
            Ok(())
        }
    }
}
