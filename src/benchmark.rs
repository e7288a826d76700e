use crate::config::{BenchmarkEntry, Config};
use crate::download::download_file;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const WMT20_BASE_URL: &str =
    "https://raw.githubusercontent.com/wmt-conference/wmt20-news-systems/main/txt";

const WMT20_LANGPAIRS: &[&str] = &[
    "cs-en", "de-en", "de-fr", "en-cs", "en-de", "en-iu", "en-ja", "en-km", "en-pl", "en-ps",
    "en-ru", "en-ta", "en-zh", "fr-de", "iu-en", "ja-en", "km-en", "pl-en", "ps-en", "ru-en",
    "ta-en", "zh-en",
];

/// Built-in test sets, before config entries are merged in
fn builtin_catalog() -> BTreeMap<String, BenchmarkEntry> {
    let mut catalog = BTreeMap::new();
    catalog.insert(
        "wmt20".to_string(),
        BenchmarkEntry {
            source_url: format!("{WMT20_BASE_URL}/sources/newstest2020-{{src}}{{tgt}}-src.{{src}}.txt"),
            reference_url: format!(
                "{WMT20_BASE_URL}/references/newstest2020-{{src}}{{tgt}}-ref.{{tgt}}.txt"
            ),
            langpairs: WMT20_LANGPAIRS.iter().map(|pair| pair.to_string()).collect(),
        },
    );
    catalog
}

/// Substitute the language codes of a pair into a URL template
fn expand_url(template: &str, src: &str, tgt: &str) -> String {
    template.replace("{src}", src).replace("{tgt}", tgt)
}

/// Local source and reference files of one benchmark language pair
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkFiles {
    pub sources: PathBuf,
    pub references: PathBuf,
}

/// Resolves test sets to cached files, downloading them on first use
pub struct BenchmarkFetcher {
    client: reqwest::Client,
    catalog: BTreeMap<String, BenchmarkEntry>,
    cache_dir: PathBuf,
}

impl BenchmarkFetcher {
    pub fn new(config: &Config, storage_dir: &Path) -> Self {
        let mut catalog = builtin_catalog();
        catalog.extend(
            config
                .benchmarks
                .iter()
                .map(|(name, entry)| (name.clone(), entry.clone())),
        );

        Self {
            client: reqwest::Client::new(),
            catalog,
            cache_dir: storage_dir.join("sacrebleu"),
        }
    }

    /// Local paths for a test set and language pair
    pub async fn fetch(&self, testset: &str, langpair: &str) -> Result<BenchmarkFiles> {
        let entry = self.catalog.get(testset).with_context(|| {
            format!(
                "Unknown test set '{}'. Available: {}",
                testset,
                self.catalog
                    .keys()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        })?;

        if !entry.langpairs.is_empty() && !entry.langpairs.iter().any(|pair| pair == langpair) {
            anyhow::bail!(
                "Test set '{}' has no language pair '{}'. Available: {}",
                testset,
                langpair,
                entry.langpairs.join(", ")
            );
        }
        let (src, tgt) = langpair
            .split_once('-')
            .filter(|(src, tgt)| !src.is_empty() && !tgt.is_empty())
            .with_context(|| format!("Invalid language pair '{langpair}', expected SRC-TGT"))?;

        let dir = self.cache_dir.join(testset);
        let files = BenchmarkFiles {
            sources: dir.join(format!("{langpair}.src")),
            references: dir.join(format!("{langpair}.ref")),
        };

        let downloads = [
            (&files.sources, &entry.source_url),
            (&files.references, &entry.reference_url),
        ];
        if downloads.iter().all(|(path, _)| path.is_file()) {
            debug!("Using cached {testset}:{langpair} in {}", dir.display());
            return Ok(files);
        }

        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        info!("Downloading {testset}:{langpair}");
        for (path, template) in downloads {
            if !path.is_file() {
                download_file(&self.client, &expand_url(template, src, tgt), path).await?;
            }
        }

        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config_for(server_url: &str) -> Config {
        let mut config = Config::default();
        config.benchmarks.insert(
            "newstest".to_string(),
            BenchmarkEntry {
                source_url: format!("{server_url}/newstest-{{src}}{{tgt}}.{{src}}"),
                reference_url: format!("{server_url}/newstest-{{src}}{{tgt}}.{{tgt}}"),
                langpairs: vec!["de-en".to_string()],
            },
        );
        config
    }

    #[test]
    fn test_expand_url() {
        assert_eq!(
            expand_url("https://x/{src}{tgt}-src.{src}.txt", "de", "en"),
            "https://x/deen-src.de.txt"
        );
    }

    #[test]
    fn test_builtin_wmt20_urls() {
        let catalog = builtin_catalog();
        let wmt20 = &catalog["wmt20"];
        assert_eq!(
            expand_url(&wmt20.source_url, "de", "en"),
            format!("{WMT20_BASE_URL}/sources/newstest2020-deen-src.de.txt")
        );
        assert_eq!(
            expand_url(&wmt20.reference_url, "de", "en"),
            format!("{WMT20_BASE_URL}/references/newstest2020-deen-ref.en.txt")
        );
        assert!(wmt20.langpairs.contains(&"en-de".to_string()));
    }

    #[tokio::test]
    async fn test_fetch_downloads_once() {
        let mut server = mockito::Server::new_async().await;
        let src_mock = server
            .mock("GET", "/newstest-deen.de")
            .with_status(200)
            .with_body("Hallo Welt\nGuten Morgen\n")
            .expect(1)
            .create_async()
            .await;
        let ref_mock = server
            .mock("GET", "/newstest-deen.en")
            .with_status(200)
            .with_body("Hello world\nGood morning\n")
            .expect(1)
            .create_async()
            .await;

        let storage = tempdir().unwrap();
        let fetcher = BenchmarkFetcher::new(&config_for(&server.url()), storage.path());

        let files = fetcher.fetch("newstest", "de-en").await.unwrap();
        assert_eq!(
            files.sources,
            storage.path().join("sacrebleu").join("newstest").join("de-en.src")
        );
        assert_eq!(
            std::fs::read_to_string(&files.references).unwrap(),
            "Hello world\nGood morning\n"
        );

        let cached = fetcher.fetch("newstest", "de-en").await.unwrap();
        assert_eq!(cached, files);
        src_mock.assert_async().await;
        ref_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_unknown_testset() {
        let storage = tempdir().unwrap();
        let fetcher = BenchmarkFetcher::new(&Config::default(), storage.path());

        let message = fetcher.fetch("wmt99", "de-en").await.unwrap_err().to_string();
        assert!(message.contains("Unknown test set 'wmt99'"));
        assert!(message.contains("wmt20"));
    }

    #[tokio::test]
    async fn test_fetch_unknown_langpair() {
        let storage = tempdir().unwrap();
        let fetcher = BenchmarkFetcher::new(&Config::default(), storage.path());

        let message = fetcher.fetch("wmt20", "xx-yy").await.unwrap_err().to_string();
        assert!(message.contains("no language pair 'xx-yy'"));
    }

    #[tokio::test]
    async fn test_fetch_failure_leaves_no_cache() {
        let mut server = mockito::Server::new_async().await;
        let _src = server
            .mock("GET", "/newstest-deen.de")
            .with_status(500)
            .create_async()
            .await;

        let storage = tempdir().unwrap();
        let fetcher = BenchmarkFetcher::new(&config_for(&server.url()), storage.path());

        assert!(fetcher.fetch("newstest", "de-en").await.is_err());
        let dir = storage.path().join("sacrebleu").join("newstest");
        assert!(!dir.join("de-en.src").exists());
    }
}
