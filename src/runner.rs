use crate::benchmark::BenchmarkFetcher;
use crate::config::Config;
use crate::dataset::{DataSource, build_segments, read_lines};
use crate::device::{device_name, select_device};
use crate::download::{Downloader, ModelRegistry};
use crate::estimator::{Estimator, load_from_checkpoint};
use crate::models::{ScoreReport, ScoredSegment, Segment};
use crate::output;
use crate::scorer::{PredictOptions, QualityModel};
use crate::settings::Settings;
use anyhow::{Context, Result};
use tracing::{debug, info, warn};

/// Orchestrates one scoring run: data, model, inference and output
pub struct Runner {
    settings: Settings,
    config: Config,
}

impl Runner {
    /// Create a new runner from resolved settings
    pub fn new(settings: Settings, config: Config) -> Self {
        Self { settings, config }
    }

    /// Load the data and the model, score every segment and report
    pub async fn run(&self) -> Result<ScoreReport> {
        let segments = self.load_segments().await?;
        let mut model = self.load_model().await?;
        if model.reference_free() != self.settings.reference_free {
            warn!(
                "Checkpoint of {} is {}reference-free despite its name",
                self.settings.model,
                if model.reference_free() { "" } else { "not " }
            );
        }
        self.score_and_report(&mut model, segments)
    }

    /// Read the translations together with their sources and references
    pub async fn load_segments(&self) -> Result<Vec<Segment>> {
        let (sources, references) = match &self.settings.data_source {
            DataSource::Files {
                sources,
                references,
            } => (sources.clone(), references.clone()),
            DataSource::Benchmark { testset, langpair } => {
                let fetcher = BenchmarkFetcher::new(&self.config, &self.settings.storage_dir);
                let files = fetcher
                    .fetch(testset, langpair)
                    .await
                    .context("SacreBLEU error")?;
                (files.sources, Some(files.references))
            }
        };

        let sources = read_lines(&sources)?;
        let translations = read_lines(&self.settings.translations)?;
        let references = if self.settings.reference_free {
            None
        } else {
            references.as_deref().map(read_lines).transpose()?
        };

        let segments = build_segments(sources, translations, references)?;
        debug!("Loaded {} segments", segments.len());
        Ok(segments)
    }

    /// Resolve the configured model and load it onto the selected device
    async fn load_model(&self) -> Result<Estimator> {
        let registry = ModelRegistry::from_config(&self.config);
        let downloader = Downloader::new(registry, self.settings.storage_dir.clone())?;
        let checkpoint = downloader
            .resolve_model(&self.settings.model)
            .await
            .with_context(|| format!("Failed to resolve model: {}", self.settings.model))?;

        let device = select_device(self.settings.gpus);
        info!(
            "Loading {} from {} on {}",
            self.settings.model,
            checkpoint.display(),
            device_name(&device)
        );
        load_from_checkpoint(&checkpoint, &device)
            .with_context(|| format!("Failed to load model from {}", checkpoint.display()))
    }

    fn predict_options(&self) -> PredictOptions {
        PredictOptions {
            batch_size: self.settings.batch_size,
            num_workers: self.settings.num_workers,
            mc_dropout: self.settings.mc_dropout,
            length_batching: self.settings.length_batching,
            seed: self.settings.seed,
        }
    }

    /// Score segments with a model, print the results and write JSON if requested
    pub fn score_and_report<M: QualityModel>(
        &self,
        model: &mut M,
        segments: Vec<Segment>,
    ) -> Result<ScoreReport> {
        let report = self.score(model, segments)?;
        output::print_report(&report);
        if let Some(path) = &self.settings.to_json {
            output::write_json(&report.segments, path)?;
        }
        Ok(report)
    }

    /// Run batched inference and pair every score with its segment
    pub fn score<M: QualityModel>(&self, model: &mut M, segments: Vec<Segment>) -> Result<ScoreReport> {
        if !model.reference_free() && segments.iter().any(|s| s.reference.is_none()) {
            anyhow::bail!("{} requires a reference for every segment", self.settings.model);
        }
        if self.settings.embedding_cache {
            model.set_embedding_cache();
        }

        info!("Scoring {} segments", segments.len());
        let prediction = model
            .predict(&segments, &self.predict_options())
            .context("Prediction failed")?;

        if prediction.scores.len() != segments.len() {
            anyhow::bail!(
                "Model returned {} scores for {} segments",
                prediction.scores.len(),
                segments.len()
            );
        }

        let variances = prediction.variances.unwrap_or_default();
        let segments = segments
            .into_iter()
            .zip(prediction.scores)
            .enumerate()
            .map(|(i, (segment, score))| ScoredSegment {
                segment,
                score,
                variance: variances.get(i).copied(),
            })
            .collect();

        Ok(ScoreReport {
            segments,
            system_score: prediction.system_score,
        })
    }
}
