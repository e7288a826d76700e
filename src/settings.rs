use crate::Args;
use crate::config::Config;
use crate::dataset::{DataSource, parse_benchmark_id};
use clap::error::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Model used when neither the CLI nor the config file names one
pub const DEFAULT_MODEL: &str = "wmt20-comet-da";
pub const DEFAULT_BATCH_SIZE: usize = 8;
pub const DEFAULT_GPUS: usize = 1;
pub const DEFAULT_SEED: u64 = 12;

/// Model identifiers containing one of these never need references
const REFERENCE_FREE_MARKERS: &[&str] = &["comet-qe"];

/// Argument combinations rejected before any work starts
#[derive(Debug, Error, PartialEq)]
pub enum UsageError {
    #[error("You must specify a source (-s) or a sacrebleu dataset (-d)")]
    MissingSource,
    #[error("Cannot use sacrebleu datasets (-d) with manually-specified datasets (-s and -r)")]
    DatasetConflict,
    #[error("SacreBLEU testset format must be TESTSET:LANGPAIR, e.g., wmt20:de-en")]
    MalformedDataset,
    #[error("{0} requires -r/--references or -d/--sacrebleu_dataset.")]
    MissingReferences(String),
    #[error("File does not exist or is not a regular file: {}", .0.display())]
    UnreadableFile(PathBuf),
    #[error("--batch_size must be at least 1")]
    InvalidBatchSize,
}

impl UsageError {
    /// The clap error kind used when reporting this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingSource | Self::MissingReferences(_) => ErrorKind::MissingRequiredArgument,
            Self::DatasetConflict => ErrorKind::ArgumentConflict,
            Self::MalformedDataset | Self::InvalidBatchSize => ErrorKind::ValueValidation,
            Self::UnreadableFile(_) => ErrorKind::InvalidValue,
        }
    }
}

/// Fully resolved options for one scoring run
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub data_source: DataSource,
    pub translations: PathBuf,
    /// Registry name or checkpoint path
    pub model: String,
    /// Whether the model is scored without references
    pub reference_free: bool,
    /// Cache root for downloaded models and benchmark files
    pub storage_dir: PathBuf,
    pub batch_size: usize,
    pub gpus: usize,
    pub num_workers: usize,
    pub seed: u64,
    /// Number of MC dropout runs, `None` when disabled
    pub mc_dropout: Option<usize>,
    pub embedding_cache: bool,
    pub length_batching: bool,
    pub to_json: Option<PathBuf>,
}

impl Settings {
    /// Merge CLI arguments over the config file and validate the result
    pub(crate) fn resolve(args: &Args, config: &Config) -> Result<Self, UsageError> {
        for path in [Some(&args.translations), args.sources.as_ref(), args.references.as_ref()]
            .into_iter()
            .flatten()
        {
            ensure_file(path)?;
        }

        let model = args
            .model
            .clone()
            .or_else(|| config.model.clone())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let reference_free = is_reference_free(&model, config);

        let data_source = resolve_data_source(args, &model, reference_free)?;

        let batch_size = args
            .batch_size
            .or(config.batch_size)
            .unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            return Err(UsageError::InvalidBatchSize);
        }

        Ok(Self {
            data_source,
            translations: args.translations.clone(),
            model,
            reference_free,
            storage_dir: args
                .model_storage_path
                .clone()
                .or_else(|| config.model_storage_path.clone())
                .unwrap_or_else(default_storage_dir),
            batch_size,
            gpus: args.gpus.or(config.gpus).unwrap_or(DEFAULT_GPUS),
            num_workers: args
                .num_workers
                .or(config.num_workers)
                .unwrap_or_else(default_num_workers)
                .max(1),
            seed: args.seed_everything.or(config.seed).unwrap_or(DEFAULT_SEED),
            mc_dropout: args.mc_dropout.filter(|&runs| runs > 0),
            embedding_cache: !args.disable_cache,
            length_batching: !args.disable_length_batching,
            to_json: args.to_json.clone(),
        })
    }
}

/// Decide where segments come from, enforcing the dataset flag rules
fn resolve_data_source(
    args: &Args,
    model: &str,
    reference_free: bool,
) -> Result<DataSource, UsageError> {
    if args.sources.is_none() && args.sacrebleu_dataset.is_none() {
        return Err(UsageError::MissingSource);
    }

    if let Some(dataset) = &args.sacrebleu_dataset {
        if args.references.is_some() || args.sources.is_some() {
            return Err(UsageError::DatasetConflict);
        }
        let (testset, langpair) = parse_benchmark_id(dataset).ok_or(UsageError::MalformedDataset)?;
        return Ok(DataSource::Benchmark { testset, langpair });
    }

    if args.references.is_none() && !reference_free {
        return Err(UsageError::MissingReferences(model.to_string()));
    }

    match &args.sources {
        Some(sources) => Ok(DataSource::Files {
            sources: sources.clone(),
            references: args.references.clone(),
        }),
        None => Err(UsageError::MissingSource),
    }
}

/// Whether a model scores translations without references
pub fn is_reference_free(model: &str, config: &Config) -> bool {
    config.models.get(model).is_some_and(|entry| entry.reference_free)
        || REFERENCE_FREE_MARKERS
            .iter()
            .any(|marker| model.contains(marker))
}

fn ensure_file(path: &Path) -> Result<(), UsageError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(UsageError::UnreadableFile(path.to_path_buf()))
    }
}

fn default_storage_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".cache").join("mt-score"),
        None => PathBuf::from(".mt-score"),
    }
}

fn default_num_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
