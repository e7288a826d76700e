use crate::models::{ScoreReport, ScoredSegment};
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use std::io::Write;
use std::path::Path;

/// Per-segment lines followed by the system score line
pub fn format_report(report: &ScoreReport) -> String {
    let with_variance = report.has_variance();
    let mut out = String::new();
    for (i, scored) in report.segments.iter().enumerate() {
        if with_variance {
            out.push_str(&format!(
                "Segment {}\tscore: {:.4}\tvariance: {:.4}\n",
                i,
                scored.score,
                scored.variance.unwrap_or_default()
            ));
        } else {
            out.push_str(&format!("Segment {}\tscore: {:.4}\n", i, scored.score));
        }
    }
    out.push_str(&format!("System score: {:.4}\n", report.system_score));
    out
}

/// Print a report to stdout
pub fn print_report(report: &ScoreReport) {
    print!("{}", format_report(report));
}

/// Serialize scored segments as a 4-space indented JSON array
pub fn to_json(segments: &[ScoredSegment]) -> Result<String> {
    let mut buf = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"    "));
    segments
        .serialize(&mut serializer)
        .context("Failed to serialize predictions to JSON")?;
    String::from_utf8(buf).context("Serialized JSON is not valid UTF-8")
}

/// Write scored segments to a JSON file, creating parent directories
pub fn write_json(segments: &[ScoredSegment], path: &Path) -> Result<()> {
    let content = to_json(segments)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let mut file = std::fs::File::create(path)
        .with_context(|| format!("Failed to write predictions to: {}", path.display()))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("Failed to write predictions to: {}", path.display()))?;

    println!("Predictions saved in: {}.", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Segment;
    use tempfile::tempdir;

    fn scored(src: &str, mt: &str, reference: Option<&str>, score: f64, variance: Option<f64>) -> ScoredSegment {
        ScoredSegment {
            segment: Segment {
                src: src.to_string(),
                mt: mt.to_string(),
                reference: reference.map(str::to_string),
            },
            score,
            variance,
        }
    }

    fn create_test_report() -> ScoreReport {
        ScoreReport {
            segments: vec![
                scored("Hallo Welt", "Hello world", Some("Hello world"), 0.81234, None),
                scored("Guten Morgen", "Good day", Some("Good morning"), 0.4, None),
            ],
            system_score: 0.60617,
        }
    }

    #[test]
    fn test_format_report_plain() {
        let report = create_test_report();
        assert_eq!(
            format_report(&report),
            "Segment 0\tscore: 0.8123\nSegment 1\tscore: 0.4000\nSystem score: 0.6062\n"
        );
    }

    #[test]
    fn test_format_report_with_variance() {
        let report = ScoreReport {
            segments: vec![scored("a", "b", None, 0.5, Some(0.01234))],
            system_score: 0.5,
        };
        assert_eq!(
            format_report(&report),
            "Segment 0\tscore: 0.5000\tvariance: 0.0123\nSystem score: 0.5000\n"
        );
    }

    #[test]
    fn test_format_empty_report() {
        let report = ScoreReport {
            segments: Vec::new(),
            system_score: 0.0,
        };
        assert_eq!(format_report(&report), "System score: 0.0000\n");
    }

    #[test]
    fn test_to_json_layout() {
        let json = to_json(&[scored("a", "b", Some("c"), 0.5, None)]).unwrap();
        assert_eq!(
            json,
            "[\n    {\n        \"src\": \"a\",\n        \"mt\": \"b\",\n        \"ref\": \"c\",\n        \"COMET\": 0.5\n    }\n]"
        );
    }

    #[test]
    fn test_to_json_keeps_non_ascii() {
        let json = to_json(&[scored("Größe", "サイズ", None, 0.1, Some(0.2))]).unwrap();
        assert!(json.contains("Größe"));
        assert!(json.contains("サイズ"));
        assert!(json.contains("\"variance\": 0.2"));
        assert!(!json.contains("\"ref\""));
    }

    #[test]
    fn test_write_json_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("scores.json");
        let report = create_test_report();

        write_json(&report.segments, &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: Vec<ScoredSegment> = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed, report.segments);
    }

    #[test]
    fn test_write_json_to_unwritable_path() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();

        let result = write_json(&[], &blocker.join("scores.json"));
        assert!(result.is_err());
    }
}
