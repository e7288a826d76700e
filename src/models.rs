use serde::{Deserialize, Serialize};

/// One segment to score: a source sentence, its machine translation and,
/// for reference-based models, a human reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Source sentence
    pub src: String,
    /// Machine translation of the source
    pub mt: String,
    /// Human reference translation
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl Segment {
    /// Total character length of all fields, used to group similar lengths
    pub fn char_len(&self) -> usize {
        self.src.chars().count()
            + self.mt.chars().count()
            + self.reference.as_ref().map_or(0, |r| r.chars().count())
    }
}

/// A segment augmented with the model's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredSegment {
    #[serde(flatten)]
    pub segment: Segment,
    /// Segment-level quality score
    #[serde(rename = "COMET")]
    pub score: f64,
    /// Spread of the score across MC dropout runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variance: Option<f64>,
}

/// Scored segments plus the aggregate system score
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreReport {
    pub segments: Vec<ScoredSegment>,
    pub system_score: f64,
}

impl ScoreReport {
    /// Whether the scores came from MC dropout and carry a variance
    pub fn has_variance(&self) -> bool {
        self.segments.iter().any(|s| s.variance.is_some())
    }
}
