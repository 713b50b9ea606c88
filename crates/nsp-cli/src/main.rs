use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use nsp_db::MetricsStore;
use nsp_pipeline::{Pipeline, PipelineConfig, PipelineStatus};

#[derive(Debug, Parser)]
#[command(name = "nsp-cli")]
#[command(about = "Neuroimaging structural pipeline CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the full pipeline for one subject.
    Run {
        #[arg(long)]
        dicom_dir: PathBuf,
        #[arg(long)]
        subject_id: String,
        #[arg(long)]
        database_url: Option<String>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Create the database schema.
    InitDb {
        #[arg(long)]
        database_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            dicom_dir,
            subject_id,
            database_url,
            output_dir,
        } => {
            let mut config = PipelineConfig::from_env();
            if let Some(url) = database_url {
                config.database_url = url;
            }
            if let Some(dir) = output_dir {
                config.nifti_output_dir = dir;
            }

            let pipeline = Pipeline::new(config)?;
            let result = pipeline.run(&dicom_dir, &subject_id).await;

            match result.status {
                PipelineStatus::Completed => {
                    println!(
                        "pipeline complete: run_id={} subject={} volumetric_id={}",
                        result.run_id,
                        result.subject_id,
                        result
                            .volumetric_id
                            .map(|id| id.to_string())
                            .unwrap_or_else(|| "?".to_string())
                    );
                }
                PipelineStatus::Failed => {
                    for error in &result.errors {
                        eprintln!("error: {error}");
                    }
                    bail!("pipeline failed for {}", result.subject_id);
                }
            }
        }
        Commands::InitDb { database_url } => {
            let url = database_url
                .unwrap_or_else(|| PipelineConfig::from_env().database_url);
            let store = MetricsStore::connect_lazy(&url)?;
            store.init_schema().await?;
            println!("database schema initialized");
        }
    }

    Ok(())
}
