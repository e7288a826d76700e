use crate::models::Segment;
use anyhow::Result;

/// Options forwarded to a model's batched inference
#[derive(Debug, Clone, PartialEq)]
pub struct PredictOptions {
    pub batch_size: usize,
    /// Threads used to prepare batches
    pub num_workers: usize,
    /// Number of MC dropout runs, `None` for a single deterministic pass
    pub mc_dropout: Option<usize>,
    /// Group segments of similar length into the same batch
    pub length_batching: bool,
    /// Seed for stochastic inference
    pub seed: u64,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            batch_size: 8,
            num_workers: 1,
            mc_dropout: None,
            length_batching: true,
            seed: 12,
        }
    }
}

/// Output of a model over a list of segments, in input order
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub scores: Vec<f64>,
    /// Per-segment standard deviation across MC dropout runs
    pub variances: Option<Vec<f64>>,
    pub system_score: f64,
}

impl Prediction {
    /// Build a prediction whose system score is the mean segment score
    pub fn from_scores(scores: Vec<f64>, variances: Option<Vec<f64>>) -> Self {
        let system_score = mean(&scores);
        Self {
            scores,
            variances,
            system_score,
        }
    }
}

/// A segment-level translation quality model
pub trait QualityModel {
    /// Whether the model scores translations without references
    fn reference_free(&self) -> bool;

    /// Memoize sentence embeddings across batches
    fn set_embedding_cache(&mut self);

    /// Score every segment
    fn predict(&mut self, segments: &[Segment], options: &PredictOptions) -> Result<Prediction>;
}

/// Order in which segments are fed to the model
///
/// With length batching, indices are sorted by descending length so each
/// batch holds segments of similar size; otherwise input order is kept.
pub fn batch_order(segments: &[Segment], length_batching: bool) -> Vec<usize> {
    let mut order: Vec<usize> = (0..segments.len()).collect();
    if length_batching {
        order.sort_by_key(|&i| std::cmp::Reverse(segments[i].char_len()));
    }
    order
}

/// Mean of a list of values, zero when empty
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation, zero when empty
pub fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(mt: &str) -> Segment {
        Segment {
            src: String::new(),
            mt: mt.to_string(),
            reference: None,
        }
    }

    #[test]
    fn test_batch_order_keeps_input_order_without_length_batching() {
        let segments = vec![segment("a"), segment("abc"), segment("ab")];
        assert_eq!(batch_order(&segments, false), vec![0, 1, 2]);
    }

    #[test]
    fn test_batch_order_sorts_longest_first() {
        let segments = vec![segment("a"), segment("abc"), segment("ab")];
        assert_eq!(batch_order(&segments, true), vec![1, 2, 0]);
    }

    #[test]
    fn test_batch_order_is_stable_for_equal_lengths() {
        let segments = vec![segment("aa"), segment("bb"), segment("c")];
        assert_eq!(batch_order(&segments, true), vec![0, 1, 2]);
    }

    #[test]
    fn test_mean_and_std_dev() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((mean(&values) - 5.0).abs() < 1e-12);
        assert!((std_dev(&values) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_mean_of_empty_is_zero() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(std_dev(&[]), 0.0);
    }

    #[test]
    fn test_prediction_system_score_is_mean() {
        let prediction = Prediction::from_scores(vec![0.2, 0.4, 0.9], None);
        assert!((prediction.system_score - 0.5).abs() < 1e-12);
    }
}
