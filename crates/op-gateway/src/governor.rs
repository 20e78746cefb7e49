//! Response Governor
//!
//! Bounds the size of every text field in an upstream result.
//!
//! Per field, in order:
//!
//! 1. length <= `truncate_at`: unchanged
//! 2. output dir configured: saved to a file, replaced by a reference
//!    (a failed write falls through to 3)
//! 3. length > `hard_max`: cut to `truncate_at` plus an explanatory suffix
//! 4. otherwise: unchanged
//!
//! Lengths are counted in chars. Without an output dir, text between the two
//! thresholds is tolerated unmodified.

use crate::config::LimitsConfig;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const MAX_LABEL_CHARS: usize = 64;

/// Stands in for a text field that was saved to disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedReference {
    pub message: String,
    pub filepath: String,
    pub size: usize,
    pub hint: String,
}

/// Outcome for a single text field
#[derive(Debug, Clone, PartialEq)]
pub enum GovernedText {
    Unchanged(String),
    Saved(SavedReference),
    Truncated(String),
}

pub struct ResponseGovernor {
    truncate_at: usize,
    hard_max: usize,
    output_dir: Option<PathBuf>,
}

impl ResponseGovernor {
    pub fn new(truncate_at: usize, hard_max: usize, output_dir: Option<PathBuf>) -> Self {
        Self {
            truncate_at,
            hard_max,
            output_dir,
        }
    }

    pub fn from_limits(limits: &LimitsConfig) -> Self {
        Self::new(limits.truncate_at, limits.hard_max, limits.output_dir.clone())
    }

    /// Apply the policy to every string reachable in `result`
    pub fn govern(&self, result: Value, label: &str) -> Value {
        match result {
            Value::String(text) => match self.govern_text(text, label) {
                GovernedText::Unchanged(text) | GovernedText::Truncated(text) => Value::String(text),
                GovernedText::Saved(reference) => serde_json::to_value(reference).unwrap_or(Value::Null),
            },
            Value::Array(items) => Value::Array(items.into_iter().map(|v| self.govern(v, label)).collect()),
            Value::Object(map) => Value::Object(self.govern_object(map, label)),
            other => other,
        }
    }

    fn govern_object(&self, map: Map<String, Value>, label: &str) -> Map<String, Value> {
        let text_item = map.get("type").and_then(Value::as_str) == Some("text");

        map.into_iter()
            .map(|(key, value)| {
                let value = match value {
                    // Keep MCP text content items valid: the reference goes in as text.
                    Value::String(text) if text_item && key == "text" => {
                        match self.govern_text(text, label) {
                            GovernedText::Unchanged(text) | GovernedText::Truncated(text) => Value::String(text),
                            GovernedText::Saved(reference) => Value::String(
                                serde_json::to_string_pretty(&reference).unwrap_or_else(|_| reference.message.clone()),
                            ),
                        }
                    }
                    other => self.govern(other, label),
                };
                (key, value)
            })
            .collect()
    }

    /// Apply the policy to one text field
    pub fn govern_text(&self, text: String, label: &str) -> GovernedText {
        let size = text.chars().count();
        if size <= self.truncate_at {
            return GovernedText::Unchanged(text);
        }

        if let Some(dir) = &self.output_dir {
            match save_to_file(dir, label, &text) {
                Ok(path) => {
                    info!(path = %path.display(), size, "Saved oversized response field");
                    return GovernedText::Saved(SavedReference {
                        message: format!(
                            "Response too large to return inline ({} characters); saved to file.",
                            size
                        ),
                        filepath: path.display().to_string(),
                        size,
                        hint: "Read the file in parts, or narrow the query to get a smaller inline result."
                            .to_string(),
                    });
                }
                Err(e) => warn!(dir = %dir.display(), "Failed to save oversized response, truncating instead: {}", e),
            }
        }

        if size > self.hard_max {
            let kept: String = text.chars().take(self.truncate_at).collect();
            let omitted = size - self.truncate_at;
            return GovernedText::Truncated(format!(
                "{}\n\n[Truncated: {} of {} characters omitted. Narrow the query, or set an output \
                 directory (OP_GATEWAY_OUTPUT_DIR) to receive the full content as a file.]",
                kept, omitted, size
            ));
        }

        GovernedText::Unchanged(text)
    }
}

/// Strip everything but `[A-Za-z0-9_-]` from a label
fn sanitize_label(label: &str) -> String {
    let clean: String = label
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(MAX_LABEL_CHARS)
        .collect();
    if clean.is_empty() {
        "response".to_string()
    } else {
        clean
    }
}

fn save_to_file(dir: &Path, label: &str, text: &str) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let unique = uuid::Uuid::new_v4().simple().to_string();
    let name = format!(
        "{}_{}_{}.txt",
        sanitize_label(label),
        Utc::now().format("%Y%m%dT%H%M%S%3f"),
        &unique[..8]
    );
    let path = dir.join(name);
    std::fs::write(&path, text)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("crm_search"), "crm_search");
        assert_eq!(sanitize_label("../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize_label("///"), "response");
    }

    #[test]
    fn test_exact_threshold_unchanged() {
        let governor = ResponseGovernor::new(10, 20, None);
        let text = "a".repeat(10);
        assert_eq!(governor.govern_text(text.clone(), "t"), GovernedText::Unchanged(text));
    }

    #[test]
    fn test_between_thresholds_unchanged_without_dir() {
        let governor = ResponseGovernor::new(10, 20, None);
        for len in [11, 20] {
            let text = "a".repeat(len);
            assert_eq!(governor.govern_text(text.clone(), "t"), GovernedText::Unchanged(text));
        }
    }

    #[test]
    fn test_above_hard_max_truncates() {
        let governor = ResponseGovernor::new(10, 20, None);
        let text = "b".repeat(21);
        match governor.govern_text(text, "t") {
            GovernedText::Truncated(out) => {
                assert!(out.starts_with(&"b".repeat(10)));
                let suffix = &out[10..];
                assert!(!suffix.is_empty());
                assert!(suffix.contains("11 of 21"));
            }
            other => panic!("expected truncation, got {other:?}"),
        }
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let governor = ResponseGovernor::new(3, 4, None);
        match governor.govern_text("ééééé".to_string(), "t") {
            GovernedText::Truncated(out) => assert!(out.starts_with("ééé\n")),
            other => panic!("expected truncation, got {other:?}"),
        }
    }

    #[test]
    fn test_saves_when_dir_configured() {
        let dir = tempfile::tempdir().unwrap();
        let governor = ResponseGovernor::new(10, 1000, Some(dir.path().to_path_buf()));
        let text = "c".repeat(11);

        match governor.govern_text(text.clone(), "crm/search") {
            GovernedText::Saved(reference) => {
                assert_eq!(reference.size, 11);
                let saved = std::fs::read_to_string(&reference.filepath).unwrap();
                assert_eq!(saved, text);
                let name = Path::new(&reference.filepath).file_name().unwrap().to_string_lossy().to_string();
                assert!(name.starts_with("crmsearch_"));
                assert!(name.ends_with(".txt"));
            }
            other => panic!("expected saved reference, got {other:?}"),
        }
    }

    #[test]
    fn test_failed_save_falls_through_to_truncation() {
        let dir = tempfile::tempdir().unwrap();
        // A file where the output directory should be makes create_dir_all fail.
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, "x").unwrap();
        let governor = ResponseGovernor::new(5, 8, Some(blocker));

        assert!(matches!(governor.govern_text("d".repeat(9), "t"), GovernedText::Truncated(_)));
        assert!(matches!(governor.govern_text("d".repeat(7), "t"), GovernedText::Unchanged(_)));
    }

    #[test]
    fn test_govern_walks_every_text_field() {
        let governor = ResponseGovernor::new(5, 6, None);
        let long = "x".repeat(50);
        let result = json!({
            "content": [{"type": "text", "text": long}],
            "message": long,
            "nested": {"response": [long]},
            "count": 3
        });

        let governed = governor.govern(result, "t");
        for field in [
            &governed["content"][0]["text"],
            &governed["message"],
            &governed["nested"]["response"][0],
        ] {
            assert!(field.as_str().unwrap().starts_with("xxxxx\n\n[Truncated"));
        }
        assert_eq!(governed["count"], 3);
        assert_eq!(governed["content"][0]["type"], "text");
    }

    #[test]
    fn test_govern_reference_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let governor = ResponseGovernor::new(5, 100, Some(dir.path().to_path_buf()));
        let long = "y".repeat(30);
        let result = json!({
            "content": [{"type": "text", "text": long}],
            "message": long
        });

        let governed = governor.govern(result, "t");

        // Plain field: replaced by the reference object.
        assert_eq!(governed["message"]["size"], 30);
        assert!(governed["message"]["filepath"].is_string());

        // Content item: still a text item, reference serialized into it.
        let text = governed["content"][0]["text"].as_str().unwrap();
        let reference: SavedReference = serde_json::from_str(text).unwrap();
        assert_eq!(reference.size, 30);
    }
}
