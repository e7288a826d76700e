//! Checkpoint-backed quality estimator.
//!
//! A checkpoint is a directory holding a BERT-family encoder and a
//! feed-forward regression head:
//!
//! - `config.json`: encoder configuration
//! - `tokenizer.json`: Hugging Face tokenizer
//! - `hparams.json`: head configuration ([`HParams`])
//! - `model.safetensors`: encoder weights under `encoder.*`, head weights
//!   under `estimator.*`
//!
//! Sentences are encoded and pooled independently; the pooled source,
//! translation and reference embeddings are combined into a feature vector
//! that the head maps to a single score.

use crate::models::Segment;
use crate::scorer::{PredictOptions, Prediction, QualityModel, batch_order, mean, std_dev};
use anyhow::{Context, Result, anyhow};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Linear, VarBuilder, linear};
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tokenizers::{Encoding, PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};
use tracing::debug;

pub const CONFIG_FILE: &str = "config.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const HPARAMS_FILE: &str = "hparams.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Every file a checkpoint directory must contain
pub const CHECKPOINT_FILES: [&str; 4] = [CONFIG_FILE, TOKENIZER_FILE, HPARAMS_FILE, WEIGHTS_FILE];

/// Which kind of metric the head was trained as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassIdentifier {
    /// Scores a translation against a source and a reference
    RegressionMetric,
    /// Scores a translation against its source only
    ReferencelessRegressionMetric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pooling {
    /// Masked mean over tokens
    #[default]
    Avg,
    /// First token
    Cls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum Activation {
    #[default]
    #[serde(alias = "tanh")]
    Tanh,
    #[serde(alias = "sigmoid")]
    Sigmoid,
    #[serde(rename = "ReLU", alias = "relu")]
    Relu,
    #[serde(rename = "GELU", alias = "gelu")]
    Gelu,
}

impl Activation {
    fn apply(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Tanh => xs.tanh(),
            Self::Sigmoid => candle_nn::ops::sigmoid(xs),
            Self::Relu => xs.relu(),
            Self::Gelu => xs.gelu(),
        }
    }
}

/// Head hyper-parameters stored next to the weights
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HParams {
    pub class_identifier: ClassIdentifier,
    #[serde(default)]
    pub pool: Pooling,
    #[serde(default = "default_hidden_sizes")]
    pub hidden_sizes: Vec<usize>,
    #[serde(default)]
    pub activations: Activation,
    #[serde(default)]
    pub final_activation: Option<Activation>,
    /// Dropout probability, only applied during MC dropout
    #[serde(default = "default_dropout")]
    pub dropout: f64,
    /// Token limit per sentence
    #[serde(default = "default_max_length")]
    pub max_length: usize,
}

fn default_hidden_sizes() -> Vec<usize> {
    vec![3072, 1024]
}

fn default_dropout() -> f64 {
    0.1
}

fn default_max_length() -> usize {
    512
}

/// Feed-forward regression head
struct FeedForward {
    layers: Vec<Linear>,
    activation: Activation,
    final_activation: Option<Activation>,
    dropout: f64,
}

impl FeedForward {
    fn load(vb: VarBuilder, in_dim: usize, hparams: &HParams) -> Result<Self> {
        let mut layers = Vec::with_capacity(hparams.hidden_sizes.len() + 1);
        let mut dim = in_dim;
        for (i, &size) in hparams.hidden_sizes.iter().enumerate() {
            layers.push(linear(dim, size, vb.pp(format!("ff.{i}")))?);
            dim = size;
        }
        layers.push(linear(dim, 1, vb.pp(format!("ff.{}", hparams.hidden_sizes.len())))?);

        Ok(Self {
            layers,
            activation: hparams.activations,
            final_activation: hparams.final_activation,
            dropout: hparams.dropout,
        })
    }

    /// Score a `(batch, features)` tensor; dropout is applied only when an rng is given
    fn forward(&self, features: &Tensor, mut rng: Option<&mut StdRng>) -> Result<Vec<f64>> {
        let mut xs = features.clone();
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(&xs)?;
            if i < last {
                xs = self.activation.apply(&xs)?;
                if let Some(rng) = rng.as_deref_mut() {
                    xs = self.apply_dropout(&xs, rng)?;
                }
            }
        }
        if let Some(activation) = &self.final_activation {
            xs = activation.apply(&xs)?;
        }

        let scores = xs.squeeze(1)?.to_vec1::<f32>()?;
        Ok(scores.into_iter().map(f64::from).collect())
    }

    fn apply_dropout(&self, xs: &Tensor, rng: &mut StdRng) -> Result<Tensor> {
        if self.dropout <= 0.0 {
            return Ok(xs.clone());
        }
        let (rows, cols) = xs.dims2()?;
        let keep = 1.0 - self.dropout;
        let scale = (1.0 / keep) as f32;
        let mask: Vec<f32> = (0..rows * cols)
            .map(|_| if rng.gen_bool(keep) { scale } else { 0.0 })
            .collect();
        let mask = Tensor::from_vec(mask, (rows, cols), xs.device())?;
        Ok(xs.mul(&mask)?)
    }
}

/// Pool token states `(batch, seq, hidden)` into sentence embeddings `(batch, hidden)`
fn pool(hidden: &Tensor, attention_mask: &Tensor, pooling: Pooling) -> Result<Tensor> {
    match pooling {
        Pooling::Cls => Ok(hidden.narrow(1, 0, 1)?.squeeze(1)?),
        Pooling::Avg => {
            let mask = attention_mask.to_dtype(hidden.dtype())?.unsqueeze(2)?;
            let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
            let counts = mask.sum(1)?.maximum(1f32)?;
            Ok(summed.broadcast_div(&counts)?)
        }
    }
}

/// Combine sentence embeddings into the head's input features
fn build_features(src: &Tensor, mt: &Tensor, reference: Option<&Tensor>) -> Result<Tensor> {
    let prod_src = (mt * src)?;
    let diff_src = (mt - src)?.abs()?;
    let parts = match reference {
        Some(reference) => vec![
            mt.clone(),
            reference.clone(),
            (mt * reference)?,
            (mt - reference)?.abs()?,
            prod_src,
            diff_src,
        ],
        None => vec![mt.clone(), src.clone(), prod_src, diff_src],
    };
    Ok(Tensor::cat(&parts, 1)?)
}

fn field_text(segment: &Segment, field: usize) -> &str {
    match field {
        0 => &segment.src,
        1 => &segment.mt,
        _ => segment.reference.as_deref().unwrap_or(""),
    }
}

/// Tokenize jobs across up to `num_workers` threads, keeping job order
fn tokenize_jobs(
    tokenizer: &Tokenizer,
    jobs: &[Vec<String>],
    num_workers: usize,
) -> Result<Vec<Vec<Encoding>>> {
    if jobs.is_empty() {
        return Ok(Vec::new());
    }
    let workers = num_workers.clamp(1, jobs.len());
    let per_worker = jobs.len().div_ceil(workers);

    std::thread::scope(|scope| {
        let handles: Vec<_> = jobs
            .chunks(per_worker)
            .map(|group| {
                scope.spawn(move || {
                    group
                        .iter()
                        .map(|texts| {
                            if texts.is_empty() {
                                return Ok(Vec::new());
                            }
                            tokenizer
                                .encode_batch(texts.clone(), true)
                                .map_err(|e| anyhow!("Failed to tokenize batch: {e}"))
                        })
                        .collect::<Result<Vec<_>>>()
                })
            })
            .collect();

        let mut encoded = Vec::with_capacity(jobs.len());
        for handle in handles {
            let group = handle
                .join()
                .map_err(|_| anyhow!("Tokenizer worker panicked"))??;
            encoded.extend(group);
        }
        Ok(encoded)
    })
}

/// A loaded checkpoint ready for inference
pub struct Estimator {
    encoder: BertModel,
    head: FeedForward,
    tokenizer: Tokenizer,
    hparams: HParams,
    device: Device,
    cache: Option<HashMap<String, Tensor>>,
}

/// Load a checkpoint directory onto a device
pub fn load_from_checkpoint(dir: &Path, device: &Device) -> Result<Estimator> {
    let weights = dir.join(WEIGHTS_FILE);
    if !weights.is_file() {
        anyhow::bail!("Checkpoint weights not found: {}", weights.display());
    }
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[&weights], DType::F32, device) }
        .with_context(|| format!("Failed to map weights: {}", weights.display()))?;
    Estimator::build(dir, vb, device)
}

impl Estimator {
    fn build(dir: &Path, vb: VarBuilder, device: &Device) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        let config_text = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read encoder config: {}", config_path.display()))?;
        let bert_config: BertConfig = serde_json::from_str(&config_text)
            .with_context(|| format!("Failed to parse encoder config: {}", config_path.display()))?;
        let raw_config: serde_json::Value = serde_json::from_str(&config_text)?;
        let hidden_size = raw_config
            .get("hidden_size")
            .and_then(|v| v.as_u64())
            .context("Encoder config is missing hidden_size")? as usize;
        let pad_id = raw_config
            .get("pad_token_id")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;

        let hparams_path = dir.join(HPARAMS_FILE);
        let hparams_text = std::fs::read_to_string(&hparams_path)
            .with_context(|| format!("Failed to read hparams: {}", hparams_path.display()))?;
        let hparams: HParams = serde_json::from_str(&hparams_text)
            .with_context(|| format!("Failed to parse hparams: {}", hparams_path.display()))?;
        if !(0.0..1.0).contains(&hparams.dropout) {
            anyhow::bail!("Dropout must be in [0, 1), got {}", hparams.dropout);
        }

        let tokenizer_path = dir.join(TOKENIZER_FILE);
        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer {}: {e}", tokenizer_path.display()))?;
        tokenizer
            .with_padding(Some(PaddingParams {
                strategy: PaddingStrategy::BatchLongest,
                pad_id,
                ..Default::default()
            }))
            .with_truncation(Some(TruncationParams {
                max_length: hparams.max_length,
                ..Default::default()
            }))
            .map_err(|e| anyhow!("Failed to configure tokenizer: {e}"))?;

        let encoder = BertModel::load(vb.pp("encoder"), &bert_config)
            .context("Failed to load encoder weights")?;
        let n_parts = match hparams.class_identifier {
            ClassIdentifier::RegressionMetric => 6,
            ClassIdentifier::ReferencelessRegressionMetric => 4,
        };
        let head = FeedForward::load(vb.pp("estimator"), hidden_size * n_parts, &hparams)
            .context("Failed to load estimator weights")?;

        debug!(
            "Loaded {:?} checkpoint from {} (hidden size {hidden_size})",
            hparams.class_identifier,
            dir.display()
        );

        Ok(Self {
            encoder,
            head,
            tokenizer,
            hparams,
            device: device.clone(),
            cache: None,
        })
    }

    /// Run the encoder over one tokenized batch and pool the result
    fn encode(&self, encodings: &[Encoding]) -> Result<Tensor> {
        let mut input_ids = Vec::with_capacity(encodings.len());
        let mut attention_mask = Vec::with_capacity(encodings.len());
        for encoding in encodings {
            input_ids.push(Tensor::new(encoding.get_ids(), &self.device)?);
            attention_mask.push(Tensor::new(encoding.get_attention_mask(), &self.device)?);
        }
        let input_ids = Tensor::stack(&input_ids, 0)?;
        let attention_mask = Tensor::stack(&attention_mask, 0)?;
        let token_type_ids = input_ids.zeros_like()?;

        let hidden = self
            .encoder
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;
        pool(&hidden, &attention_mask, self.hparams.pool)
    }
}

impl QualityModel for Estimator {
    fn reference_free(&self) -> bool {
        self.hparams.class_identifier == ClassIdentifier::ReferencelessRegressionMetric
    }

    fn set_embedding_cache(&mut self) {
        if self.cache.is_none() {
            self.cache = Some(HashMap::new());
        }
    }

    fn predict(&mut self, segments: &[Segment], options: &PredictOptions) -> Result<Prediction> {
        let reference_free = self.reference_free();
        if !reference_free && segments.iter().any(|s| s.reference.is_none()) {
            anyhow::bail!("This model requires a reference for every segment");
        }

        let n_fields = if reference_free { 2 } else { 3 };
        let batch_size = options.batch_size.max(1);
        let order = batch_order(segments, options.length_batching);
        let batches: Vec<&[usize]> = order.chunks(batch_size).collect();

        // Texts each (batch, field) pair must run through the encoder.
        let mut jobs: Vec<Vec<String>> = Vec::with_capacity(batches.len() * n_fields);
        let mut planned: HashSet<&str> = HashSet::new();
        for batch in &batches {
            for field in 0..n_fields {
                let texts = batch.iter().map(|&i| field_text(&segments[i], field));
                let job = match &self.cache {
                    Some(cache) => texts
                        .filter(|t| !cache.contains_key(*t) && planned.insert(*t))
                        .map(str::to_string)
                        .collect(),
                    None => texts.map(str::to_string).collect(),
                };
                jobs.push(job);
            }
        }

        let encoded = tokenize_jobs(&self.tokenizer, &jobs, options.num_workers)?;
        debug!(
            "Scoring {} segments in {} batches ({} workers)",
            segments.len(),
            batches.len(),
            options.num_workers
        );

        let mut rng = StdRng::seed_from_u64(options.seed);
        let mut scores = vec![0.0; segments.len()];
        let mut variances = options.mc_dropout.map(|_| vec![0.0; segments.len()]);
        let mut encoded = encoded.into_iter();

        for (batch_idx, batch) in batches.iter().enumerate() {
            let mut fields = Vec::with_capacity(n_fields);
            for field in 0..n_fields {
                let encodings = encoded.next().unwrap_or_default();
                let pooled = if encodings.is_empty() {
                    None
                } else {
                    Some(self.encode(&encodings)?)
                };

                let embeddings = match self.cache.as_mut() {
                    Some(cache) => {
                        if let Some(pooled) = pooled {
                            for (row, text) in jobs[batch_idx * n_fields + field].iter().enumerate() {
                                cache.insert(text.clone(), pooled.get(row)?);
                            }
                        }
                        let rows = batch
                            .iter()
                            .map(|&i| {
                                cache
                                    .get(field_text(&segments[i], field))
                                    .cloned()
                                    .context("Sentence embedding missing from cache")
                            })
                            .collect::<Result<Vec<_>>>()?;
                        Tensor::stack(&rows, 0)?
                    }
                    None => pooled.context("Empty batch")?,
                };
                fields.push(embeddings);
            }

            let features = build_features(&fields[0], &fields[1], fields.get(2))?;
            match options.mc_dropout {
                None => {
                    let batch_scores = self.head.forward(&features, None)?;
                    for (&i, score) in batch.iter().zip(batch_scores) {
                        scores[i] = score;
                    }
                }
                Some(runs) => {
                    let mut samples = vec![Vec::with_capacity(runs); batch.len()];
                    for _ in 0..runs {
                        let run_scores = self.head.forward(&features, Some(&mut rng))?;
                        for (sample, score) in samples.iter_mut().zip(run_scores) {
                            sample.push(score);
                        }
                    }
                    for (&i, sample) in batch.iter().zip(&samples) {
                        scores[i] = mean(sample);
                        if let Some(variances) = variances.as_mut() {
                            variances[i] = std_dev(sample);
                        }
                    }
                }
            }
        }

        Ok(Prediction::from_scores(scores, variances))
    }
}
