use crate::config::Config;
use crate::estimator::CHECKPOINT_FILES;
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Released model names; they download only once a mirror is configured
pub const AVAILABLE_MODELS: &[&str] = &[
    "emnlp20-comet-rank",
    "wmt20-comet-da",
    "wmt20-comet-qe-da",
    "wmt21-comet-da",
    "wmt21-comet-mqm",
    "wmt21-comet-qe-da",
    "wmt21-comet-qe-mqm",
    "wmt21-cometinho-da",
    "eamt22-cometinho-da",
];

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Known model names mapped to the base URL of their checkpoint files, if any
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    entries: BTreeMap<String, Option<String>>,
}

impl ModelRegistry {
    /// Built-in names served from `registry_url` when set, plus config entries
    pub fn from_config(config: &Config) -> Self {
        let base = config
            .registry_url
            .as_deref()
            .map(|url| url.trim_end_matches('/'));

        let mut entries: BTreeMap<String, Option<String>> = AVAILABLE_MODELS
            .iter()
            .map(|name| (name.to_string(), base.map(|base| format!("{base}/{name}"))))
            .collect();
        for (name, entry) in &config.models {
            entries.insert(
                name.clone(),
                Some(entry.url.trim_end_matches('/').to_string()),
            );
        }

        Self { entries }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn url(&self, name: &str) -> Option<&str> {
        self.entries.get(name).and_then(|url| url.as_deref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

/// Checkpoint files absent from a directory
pub fn missing_files(dir: &Path) -> Vec<&'static str> {
    CHECKPOINT_FILES
        .iter()
        .copied()
        .filter(|file| !dir.join(file).is_file())
        .collect()
}

/// Downloads checkpoints into a storage directory
pub struct Downloader {
    client: reqwest::Client,
    registry: ModelRegistry,
    storage_dir: PathBuf,
}

impl Downloader {
    pub fn new(registry: ModelRegistry, storage_dir: PathBuf) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            registry,
            storage_dir,
        })
    }

    /// Resolve a model identifier to a local checkpoint directory
    pub async fn resolve_model(&self, model: &str) -> Result<PathBuf> {
        if self.registry.contains(model) {
            let dir = self.storage_dir.join(model);
            if missing_files(&dir).is_empty() {
                debug!("Using cached checkpoint {}", dir.display());
                return Ok(dir);
            }
            let url = self.registry.url(model).with_context(|| {
                format!(
                    "Model '{model}' is not in {} and has no download source. \
                     Set registry_url or add a [models.{model}] entry in the config file \
                     pointing at a mirror of converted checkpoints, or pass a checkpoint directory",
                    dir.display()
                )
            })?;
            self.download_checkpoint(url, &dir).await?;
            return Ok(dir);
        }

        let path = PathBuf::from(model);
        if path.is_dir() {
            let missing = missing_files(&path);
            if !missing.is_empty() {
                anyhow::bail!(
                    "Checkpoint {} is missing: {}",
                    path.display(),
                    missing.join(", ")
                );
            }
            return Ok(path);
        }

        anyhow::bail!(
            "Unknown model '{}'. Use a checkpoint directory or one of: {}",
            model,
            self.registry.names().join(", ")
        )
    }

    /// Fetch every checkpoint file missing from `dir`
    async fn download_checkpoint(&self, base_url: &str, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        info!("Downloading checkpoint to {}", dir.display());
        for file in missing_files(dir) {
            download_file(&self.client, &format!("{base_url}/{file}"), &dir.join(file)).await?;
        }
        Ok(())
    }
}

/// Stream a URL into `dest` through a `.part` file, renamed into place on success
pub async fn download_file(client: &reqwest::Client, url: &str, dest: &Path) -> Result<()> {
    let temp_path = dest.with_extension("part");
    let result = stream_to_file(client, url, &temp_path).await;
    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e);
    }

    tokio::fs::rename(&temp_path, dest).await.with_context(|| {
        format!("Failed to move downloaded file to {}", dest.display())
    })
}

async fn stream_to_file(client: &reqwest::Client, url: &str, path: &Path) -> Result<()> {
    let mut response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to download {url}"))?
        .error_for_status()
        .with_context(|| format!("Failed to download {url}"))?;

    let progress = match response.content_length() {
        Some(total) => {
            let bar = ProgressBar::new(total);
            bar.set_style(
                ProgressStyle::with_template(
                    "{msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
                )?
                .progress_chars("━╸─"),
            );
            bar
        }
        None => ProgressBar::new_spinner(),
    };
    progress.set_message(
        url.rsplit('/')
            .next()
            .unwrap_or(url)
            .to_string(),
    );

    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("Failed to create file: {}", path.display()))?;
    while let Some(chunk) = response
        .chunk()
        .await
        .with_context(|| format!("Failed to read from {url}"))?
    {
        file.write_all(&chunk)
            .await
            .with_context(|| format!("Failed to write to {}", path.display()))?;
        progress.inc(chunk.len() as u64);
    }
    file.flush().await?;
    progress.finish_and_clear();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelEntry;
    use tempfile::tempdir;

    fn registry_for(server_url: &str) -> ModelRegistry {
        let config = Config {
            registry_url: Some(server_url.to_string()),
            ..Config::default()
        };
        ModelRegistry::from_config(&config)
    }

    #[test]
    fn test_registry_builtin_names_need_a_mirror() {
        let registry = ModelRegistry::from_config(&Config::default());
        assert!(registry.contains("wmt20-comet-da"));
        assert!(registry.url("wmt20-comet-da").is_none());
        assert!(!registry.contains("not-a-model"));
    }

    #[test]
    fn test_registry_url_serves_builtin_names() {
        let registry = registry_for("https://models.example.org/");
        assert_eq!(
            registry.url("wmt20-comet-da"),
            Some("https://models.example.org/wmt20-comet-da")
        );
    }

    #[test]
    fn test_registry_config_entries_override() {
        let mut config = Config::default();
        config.models.insert(
            "wmt20-comet-da".to_string(),
            ModelEntry {
                url: "https://mirror.example.org/da/".to_string(),
                reference_free: false,
            },
        );
        let registry = ModelRegistry::from_config(&config);
        assert_eq!(registry.url("wmt20-comet-da"), Some("https://mirror.example.org/da"));
    }

    #[test]
    fn test_missing_files() {
        let dir = tempdir().unwrap();
        assert_eq!(missing_files(dir.path()).len(), 4);

        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        let missing = missing_files(dir.path());
        assert_eq!(missing.len(), 3);
        assert!(!missing.contains(&"config.json"));
    }

    #[tokio::test]
    async fn test_resolve_model_downloads_registry_checkpoint() {
        let mut server = mockito::Server::new_async().await;
        let mut mocks = Vec::new();
        for file in CHECKPOINT_FILES {
            mocks.push(
                server
                    .mock("GET", format!("/wmt20-comet-da/{file}").as_str())
                    .with_status(200)
                    .with_body(format!("contents of {file}"))
                    .expect(1)
                    .create_async()
                    .await,
            );
        }

        let storage = tempdir().unwrap();
        let downloader =
            Downloader::new(registry_for(&server.url()), storage.path().to_path_buf()).unwrap();

        let dir = downloader.resolve_model("wmt20-comet-da").await.unwrap();
        assert_eq!(dir, storage.path().join("wmt20-comet-da"));
        assert_eq!(
            std::fs::read_to_string(dir.join("hparams.json")).unwrap(),
            "contents of hparams.json"
        );
        assert!(!dir.join("hparams.part").exists());

        // A complete checkpoint is not fetched again.
        downloader.resolve_model("wmt20-comet-da").await.unwrap();
        for mock in mocks {
            mock.assert_async().await;
        }
    }

    #[tokio::test]
    async fn test_resolve_model_without_mirror() {
        let storage = tempdir().unwrap();
        let downloader = Downloader::new(
            ModelRegistry::from_config(&Config::default()),
            storage.path().to_path_buf(),
        )
        .unwrap();

        let message = downloader
            .resolve_model("wmt20-comet-da")
            .await
            .unwrap_err()
            .to_string();
        assert!(message.contains("has no download source"));
        assert!(message.contains("registry_url"));
        assert!(message.contains("[models.wmt20-comet-da]"));
    }

    #[tokio::test]
    async fn test_resolve_model_uses_checkpoint_in_storage_without_mirror() {
        let storage = tempdir().unwrap();
        let dir = storage.path().join("wmt20-comet-da");
        std::fs::create_dir_all(&dir).unwrap();
        for file in CHECKPOINT_FILES {
            std::fs::write(dir.join(file), "x").unwrap();
        }
        let downloader = Downloader::new(
            ModelRegistry::from_config(&Config::default()),
            storage.path().to_path_buf(),
        )
        .unwrap();

        assert_eq!(downloader.resolve_model("wmt20-comet-da").await.unwrap(), dir);
    }

    #[tokio::test]
    async fn test_download_failure_removes_partial_file() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/missing.bin")
            .with_status(404)
            .create_async()
            .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("missing.bin");
        let client = reqwest::Client::new();
        let result = download_file(&client, &format!("{}/missing.bin", server.url()), &dest).await;

        assert!(result.is_err());
        assert!(!dest.exists());
        assert!(!dir.path().join("missing.part").exists());
    }

    #[tokio::test]
    async fn test_resolve_model_local_directory() {
        let dir = tempdir().unwrap();
        for file in CHECKPOINT_FILES {
            std::fs::write(dir.path().join(file), "x").unwrap();
        }
        let downloader =
            Downloader::new(ModelRegistry::from_config(&Config::default()), dir.path().to_path_buf())
                .unwrap();

        let model = dir.path().to_string_lossy().to_string();
        assert_eq!(downloader.resolve_model(&model).await.unwrap(), dir.path());
    }

    #[tokio::test]
    async fn test_resolve_model_incomplete_local_directory() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        let downloader =
            Downloader::new(ModelRegistry::from_config(&Config::default()), dir.path().to_path_buf())
                .unwrap();

        let model = dir.path().to_string_lossy().to_string();
        let message = downloader.resolve_model(&model).await.unwrap_err().to_string();
        assert!(message.contains("is missing"));
        assert!(message.contains("model.safetensors"));
    }

    #[tokio::test]
    async fn test_resolve_model_unknown() {
        let storage = tempdir().unwrap();
        let downloader = Downloader::new(
            ModelRegistry::from_config(&Config::default()),
            storage.path().to_path_buf(),
        )
        .unwrap();

        let message = downloader
            .resolve_model("no-such-model")
            .await
            .unwrap_err()
            .to_string();
        assert!(message.contains("Unknown model 'no-such-model'"));
        assert!(message.contains("wmt20-comet-da"));
    }
}
