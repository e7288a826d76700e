use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A model entry that extends or overrides the built-in registry
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ModelEntry {
    /// Base URL the checkpoint files are fetched from
    pub url: String,
    /// Whether the model scores without references
    #[serde(default)]
    pub reference_free: bool,
}

/// A benchmark test set definition
///
/// URLs are templates: `{src}` and `{tgt}` are replaced with the two
/// language codes of the requested pair.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BenchmarkEntry {
    pub source_url: String,
    pub reference_url: String,
    /// Language pairs the test set provides; empty accepts any pair
    #[serde(default)]
    pub langpairs: Vec<String>,
}

/// Optional configuration file; every key falls back to the CLI default
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Default model identifier
    #[serde(default)]
    pub model: Option<String>,
    /// Directory where models and benchmark files are cached
    #[serde(default)]
    pub model_storage_path: Option<PathBuf>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub gpus: Option<usize>,
    #[serde(default)]
    pub num_workers: Option<usize>,
    /// Prediction seed
    #[serde(default)]
    pub seed: Option<u64>,
    /// Base URL for the built-in model registry
    #[serde(default)]
    pub registry_url: Option<String>,
    /// Additional models by name
    #[serde(default)]
    pub models: HashMap<String, ModelEntry>,
    /// Additional benchmark test sets by name
    #[serde(default)]
    pub benchmarks: HashMap<String, BenchmarkEntry>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config: {}", path.display()))
    }
}
