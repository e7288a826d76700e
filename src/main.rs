use clap::{CommandFactory, Parser};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod benchmark;
mod config;
mod dataset;
mod device;
mod download;
mod estimator;
mod models;
mod output;
mod runner;
mod scorer;
mod settings;

use crate::config::Config;
use crate::runner::Runner;
use crate::settings::Settings;

/// Score machine translations with a pretrained quality estimation model
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub(crate) struct Args {
    /// Source segments, one per line
    #[arg(short, long)]
    sources: Option<PathBuf>,

    /// Machine translations to score, one per line
    #[arg(short, long)]
    translations: PathBuf,

    /// Reference translations, one per line
    #[arg(short, long)]
    references: Option<PathBuf>,

    /// Benchmark test set as TESTSET:LANGPAIR, e.g. wmt20:de-en
    #[arg(short = 'd', long = "sacrebleu_dataset", alias = "sacrebleu-dataset")]
    sacrebleu_dataset: Option<String>,

    /// Registry model name or local checkpoint directory [default: wmt20-comet-da]
    #[arg(long)]
    model: Option<String>,

    /// Directory where models and benchmark files are cached
    #[arg(long = "model_storage_path", alias = "model-storage-path")]
    model_storage_path: Option<PathBuf>,

    /// Segments per batch [default: 8]
    #[arg(long = "batch_size", alias = "batch-size")]
    batch_size: Option<usize>,

    /// Number of GPUs; 0 runs on the CPU [default: 1]
    #[arg(long)]
    gpus: Option<usize>,

    /// Write scored segments to a JSON file
    #[arg(long = "to_json", alias = "to-json")]
    to_json: Option<PathBuf>,

    /// Number of MC dropout runs; reports a variance per segment
    #[arg(long = "mc_dropout", alias = "mc-dropout")]
    mc_dropout: Option<usize>,

    /// Seed for MC dropout [default: 12]
    #[arg(long = "seed_everything", alias = "seed-everything")]
    seed_everything: Option<u64>,

    /// Threads used to prepare batches [default: number of CPUs]
    #[arg(long = "num_workers", alias = "num-workers")]
    num_workers: Option<usize>,

    /// Do not memoize sentence embeddings
    #[arg(long = "disable_cache", alias = "disable-cache")]
    disable_cache: bool,

    /// Batch segments in input order instead of by length
    #[arg(long = "disable_length_batching", alias = "disable-length-batching")]
    disable_length_batching: bool,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output - log debug diagnostics
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let settings = match Settings::resolve(&args, &config) {
        Ok(settings) => settings,
        Err(e) => Args::command().error(e.kind(), e.to_string()).exit(),
    };

    let runner = Runner::new(settings, config);
    runner.run().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_args_accept_dash_spellings() {
        let args = Args::try_parse_from([
            "mt-score",
            "-t",
            "mt.txt",
            "--sacrebleu-dataset",
            "wmt20:de-en",
            "--batch-size",
            "16",
            "--seed-everything",
            "3",
        ])
        .unwrap();
        assert_eq!(args.sacrebleu_dataset.as_deref(), Some("wmt20:de-en"));
        assert_eq!(args.batch_size, Some(16));
        assert_eq!(args.seed_everything, Some(3));
        assert!(!args.disable_cache);
    }

    #[test]
    fn test_args_require_translations() {
        assert!(Args::try_parse_from(["mt-score", "-s", "src.txt"]).is_err());
    }
}
