use crate::models::Segment;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Where the segments to score come from
#[derive(Debug, Clone, PartialEq)]
pub enum DataSource {
    /// Explicit source file, with an optional reference file
    Files {
        sources: PathBuf,
        references: Option<PathBuf>,
    },
    /// A named benchmark test set for one language pair
    Benchmark { testset: String, langpair: String },
}

/// Split a `TESTSET:LANGPAIR` specifier at its last colon
///
/// Returns `None` when there is no colon or either side is empty.
pub fn parse_benchmark_id(value: &str) -> Option<(String, String)> {
    let (testset, langpair) = value.rsplit_once(':')?;
    if testset.is_empty() || langpair.is_empty() {
        return None;
    }
    Some((testset.to_string(), langpair.to_string()))
}

/// Read a text file as one stripped entry per line
pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path.display()))?;
    Ok(content.lines().map(|line| line.trim().to_string()).collect())
}

/// Pair up sources, translations and optional references into segments
pub fn build_segments(
    sources: Vec<String>,
    translations: Vec<String>,
    references: Option<Vec<String>>,
) -> Result<Vec<Segment>> {
    if sources.len() != translations.len() {
        anyhow::bail!(
            "Line count mismatch: {} sources but {} translations",
            sources.len(),
            translations.len()
        );
    }

    match references {
        Some(references) => {
            if references.len() != sources.len() {
                anyhow::bail!(
                    "Line count mismatch: {} sources but {} references",
                    sources.len(),
                    references.len()
                );
            }
            Ok(sources
                .into_iter()
                .zip(translations)
                .zip(references)
                .map(|((src, mt), reference)| Segment {
                    src,
                    mt,
                    reference: Some(reference),
                })
                .collect())
        }
        None => Ok(sources
            .into_iter()
            .zip(translations)
            .map(|(src, mt)| Segment {
                src,
                mt,
                reference: None,
            })
            .collect()),
    }
}
