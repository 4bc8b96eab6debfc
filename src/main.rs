use std::path::PathBuf;

use nbkit::checkpoint;
use nbkit::columns::{self, ColumnMap};
use nbkit::jsonl;
use nbkit::params;
use nbkit::sources::{DEFAULT_EMBEDDING, ParamTable};
use nbkit::utils;

use anyhow::{Context, Result, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "nbkit",
    about = "Parameter breakdowns, checkpoint cleanup and dataset helpers for training notebooks",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Commands,
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(ClapArgs, Debug)]
#[group(required = true, multiple = false)]
struct ModelInput {
    /// JSON parameter manifest
    #[arg(long)]
    manifest: Option<PathBuf>,
    /// Safetensors checkpoint; only the header is read
    #[arg(long)]
    safetensors: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print a per-category parameter breakdown
    Count {
        #[command(flatten)]
        input: ModelInput,
        /// Name of the input embedding parameter, used to detect a tied head
        #[arg(long)]
        embedding: Option<String>,
        /// Output head that is tied to the embedding and so not stored in the file
        #[arg(long, requires = "safetensors")]
        tied_head: Option<String>,
    },
    /// Remove the torch.compile key prefix from a safetensors checkpoint
    StripPrefix {
        /// Checkpoint to read
        #[arg(long)]
        input: PathBuf,
        /// Where to write the cleaned checkpoint
        #[arg(long)]
        output: PathBuf,
        /// Prefix to strip from tensor names
        #[arg(long, default_value = checkpoint::COMPILE_PREFIX)]
        prefix: String,
    },
    /// Merge JSONL datasets under normalized column names
    Normalize {
        /// JSONL files to read, in order
        #[arg(long = "input", required = true, num_args = 1..)]
        inputs: Vec<PathBuf>,
        /// JSONL file to write
        #[arg(long)]
        output: PathBuf,
        /// JSON file of `{ "canonical": ["alias", ...] }`, replacing the built-in aliases
        #[arg(long)]
        aliases: Option<PathBuf>,
        /// Drop columns that do not map to a canonical name
        #[arg(long, default_value_t = false)]
        drop_unmapped: bool,
    },
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(level)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    match args.command {
        Commands::Count {
            input,
            embedding,
            tied_head,
        } => {
            let table = match (input.manifest, input.safetensors) {
                (Some(path), None) => {
                    let mut table = ParamTable::from_manifest_file(&path)?;
                    if let Some(name) = embedding {
                        table.set_embedding(name);
                    }
                    table
                }
                (None, Some(path)) => ParamTable::from_safetensors(
                    &path,
                    embedding.as_deref().unwrap_or(DEFAULT_EMBEDDING),
                    tied_head.as_deref(),
                )?,
                _ => bail!("pass exactly one of --manifest or --safetensors"),
            };

            let count = params::count_parameters(&table);
            print!("{count}");
            info!(
                total = count.total,
                human = %utils::format_params(count.total),
                tied = count.tied,
                "parameter count completed"
            );
        }
        Commands::StripPrefix {
            input,
            output,
            prefix,
        } => {
            let summary = checkpoint::strip_safetensors_prefix(&input, &output, &prefix)?;
            if summary.renamed == 0 {
                warn!(prefix = %prefix, input = %input.display(), "no tensor names carried the prefix");
            }
            println!(
                "renamed {} of {} tensors -> {}",
                summary.renamed,
                summary.tensors,
                output.display()
            );
        }
        Commands::Normalize {
            inputs,
            output,
            aliases,
            drop_unmapped,
        } => {
            let map = match aliases {
                Some(path) => ColumnMap::from_json_file(&path)?,
                None => ColumnMap::default(),
            };

            let mut merged = Vec::new();
            for path in &inputs {
                let records = jsonl::load_jsonl(path)?;
                let records = columns::normalize_records(records, &map, !drop_unmapped)
                    .with_context(|| format!("while normalizing {}", path.display()))?;
                merged.extend(records);
            }
            jsonl::write_jsonl(&output, &merged)?;
            info!(
                sources = inputs.len(),
                records = merged.len(),
                output = %output.display(),
                "normalize completed"
            );
        }
    }

    Ok(())
}
