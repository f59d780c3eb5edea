//! featforge command line: run the batch pipeline over every source table, or reuse a
//! fitted preprocessor on new rows.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use featforge::artifacts::{read_csv, write_csv};
use featforge::error::is_logged;
use featforge::logging::{init_logging, log_event};
use featforge::{PipelineConfig, RunContext, SqliteSource, run, transform_new_rows};
use polars::prelude::{CsvWriter, SerWriter};

#[derive(Parser)]
#[command(name = "featforge")]
#[command(about = "Feature-engineering pipeline for relational price tables")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Artifact root directory (overrides the config file)
    #[arg(long, global = true)]
    artifacts: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every table: split, persist, derive features and fit preprocessors
    Run {
        /// Database url (overrides DATABASE_URL)
        #[arg(long)]
        database_url: Option<String>,
    },
    /// Transform new rows with a previously fitted preprocessor
    Transform {
        /// Table whose fitted preprocessor is reused
        #[arg(long)]
        table: String,
        /// CSV file with the new rows
        #[arg(long)]
        input: PathBuf,
        /// Where to write the transformed rows; defaults to stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    if let Some(root) = cli.artifacts {
        config.artifact_root = root;
    }
    init_logging(&config.logging)?;

    if let Err(error) = execute(cli.command, config) {
        if !is_logged(&error) {
            log_event(
                file!(),
                "main",
                "main",
                "cli",
                line!(),
                "Run terminated",
                Some(&format!("{error:?}")),
                None,
            );
        }
        return Err(error);
    }

    Ok(())
}

fn execute(command: Commands, mut config: PipelineConfig) -> anyhow::Result<()> {
    match command {
        Commands::Run { database_url } => {
            if let Some(url) = database_url {
                config.database_url = Some(url);
            }
            config.validate()?;

            let mut source = SqliteSource::open(config.database_url()?, config.source_options())?;
            let context = RunContext::new(config);
            let outcomes = run(&context, &mut source)?;

            for outcome in &outcomes {
                println!(
                    "{}: train {:?}, test {:?} -> {}",
                    outcome.table,
                    outcome.train.shape(),
                    outcome.test.shape(),
                    outcome.artifacts.preprocessor.display()
                );
            }
        }
        Commands::Transform {
            table,
            input,
            output,
        } => {
            config.validate()?;
            let context = RunContext::new(config);
            let frame = read_csv(&input)?;
            let mut transformed = transform_new_rows(&context, &table, &frame)?;

            match output {
                Some(path) => write_csv(&transformed, &path)?,
                None => {
                    let stdout = std::io::stdout();
                    CsvWriter::new(stdout.lock())
                        .finish(&mut transformed)
                        .context("failed to write transformed rows")?;
                }
            }
        }
    }

    Ok(())
}
