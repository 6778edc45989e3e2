//! Extraction of structured analyses from free-form provider text.
//!
//! Providers are asked for a JSON object but routinely wrap it in markdown
//! fences or surround it with prose. Parsing tries, in order: the fenced
//! body, a strict parse of the whole text, then the first balanced JSON
//! object or array found by scanning.

use serde::Deserialize;
use serde_json::Value;

use crate::model::{Analysis, RecommendedAction};

const DEFAULT_CONFIDENCE: f64 = 0.7;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("no JSON object found in response")]
    NoJson,
    #[error("response JSON is missing a strategic summary")]
    MissingSummary,
}

/// Parse provider text into an [`Analysis`].
pub fn parse_analysis(text: &str) -> Result<Analysis, ParseError> {
    let unfenced = strip_code_fence(text);

    let value = serde_json::from_str::<Value>(unfenced)
        .ok()
        .filter(|v| v.is_object() || v.is_array())
        .or_else(|| first_balanced_json(unfenced))
        .or_else(|| first_balanced_json(text))
        .ok_or(ParseError::NoJson)?;

    let object = match value {
        Value::Array(items) => items
            .into_iter()
            .find(Value::is_object)
            .ok_or(ParseError::NoJson)?,
        other => other,
    };

    let raw: RawAnalysis = serde_json::from_value(object).map_err(|_| ParseError::NoJson)?;
    raw.into_analysis()
}

/// Return the body of the first markdown code fence, or the trimmed input.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };
    let after = &trimmed[start + 3..];
    let Some(end) = after.find("```") else {
        return trimmed;
    };
    let inner = &after[..end];

    // Skip a language tag such as `json` on the opening line.
    match inner.find('\n') {
        Some(nl) if !inner[..nl].trim_start().starts_with(['{', '[']) => inner[nl + 1..].trim(),
        _ => inner.trim(),
    }
}

/// Scan for the first syntactically balanced `{..}` or `[..]` that parses.
pub fn first_balanced_json(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut search_from = 0;

    while let Some(offset) = bytes[search_from..]
        .iter()
        .position(|b| *b == b'{' || *b == b'[')
    {
        let start = search_from + offset;
        if let Some(end) = balanced_end(&bytes[start..]) {
            let candidate = &text[start..start + end];
            if let Ok(value) = serde_json::from_str::<Value>(candidate) {
                return Some(value);
            }
        }
        search_from = start + 1;
    }

    None
}

/// Length of the balanced bracket run starting at `bytes[0]`, string-aware.
fn balanced_end(bytes: &[u8]) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, b) in bytes.iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }

    None
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    #[serde(default, alias = "summary", alias = "briefing")]
    strategic_summary: Option<String>,
    #[serde(default, alias = "findings")]
    key_findings: Vec<Value>,
    #[serde(default)]
    opportunities: Vec<Value>,
    #[serde(default)]
    threats: Vec<Value>,
    #[serde(default, alias = "actions", alias = "recommendations")]
    recommended_actions: Vec<Value>,
    #[serde(default, alias = "confidence_score")]
    confidence: Option<f64>,
}

impl RawAnalysis {
    fn into_analysis(self) -> Result<Analysis, ParseError> {
        let summary = self
            .strategic_summary
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(ParseError::MissingSummary)?;

        Ok(Analysis {
            strategic_summary: summary,
            key_findings: text_items(self.key_findings),
            opportunities: text_items(self.opportunities),
            threats: text_items(self.threats),
            recommended_actions: self
                .recommended_actions
                .into_iter()
                .filter_map(action_item)
                .collect(),
            confidence: normalize_confidence(self.confidence),
        })
    }
}

fn text_items(values: Vec<Value>) -> Vec<String> {
    values
        .into_iter()
        .filter_map(|value| match value {
            Value::String(s) => Some(s),
            Value::Object(map) => ["text", "title", "description", "finding"]
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_str).map(str::to_string)),
            _ => None,
        })
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn action_item(value: Value) -> Option<RecommendedAction> {
    match value {
        Value::String(action) if !action.trim().is_empty() => Some(RecommendedAction {
            action: action.trim().to_string(),
            rationale: String::new(),
        }),
        Value::Object(map) => {
            let action = map
                .get("action")
                .or_else(|| map.get("title"))
                .and_then(Value::as_str)?
                .trim()
                .to_string();
            if action.is_empty() {
                return None;
            }
            let rationale = map
                .get("rationale")
                .or_else(|| map.get("reason"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string();
            Some(RecommendedAction { action, rationale })
        }
        _ => None,
    }
}

/// Providers report either 0..1 or 0..100.
fn normalize_confidence(raw: Option<f64>) -> f64 {
    match raw {
        Some(c) if c.is_finite() && c > 1.0 && c <= 100.0 => c / 100.0,
        Some(c) if c.is_finite() && (0.0..=1.0).contains(&c) => c,
        _ => DEFAULT_CONFIDENCE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json() {
        let text = r#"{"strategic_summary": "Hold the centre", "key_findings": ["a", "b"], "confidence": 0.8}"#;
        let analysis = parse_analysis(text).unwrap();
        assert_eq!(analysis.strategic_summary, "Hold the centre");
        assert_eq!(analysis.key_findings, vec!["a", "b"]);
        assert!((analysis.confidence - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn strips_markdown_fence_with_language_tag() {
        let text = "Here you go:\n```json\n{\"summary\": \"Fenced\", \"threats\": [\"t\"]}\n```\nThanks";
        let analysis = parse_analysis(text).unwrap();
        assert_eq!(analysis.strategic_summary, "Fenced");
        assert_eq!(analysis.threats, vec!["t"]);
    }

    #[test]
    fn finds_object_embedded_in_prose() {
        let text = r#"Sure! The analysis {"strategic_summary": "Braces } in \"strings\" {", "opportunities": ["x"]} hope it helps"#;
        let analysis = parse_analysis(text).unwrap();
        assert_eq!(analysis.strategic_summary, "Braces } in \"strings\" {");
        assert_eq!(analysis.opportunities, vec!["x"]);
    }

    #[test]
    fn takes_first_object_from_array() {
        let text = r#"[{"strategic_summary": "first"}, {"strategic_summary": "second"}]"#;
        assert_eq!(parse_analysis(text).unwrap().strategic_summary, "first");
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert_eq!(parse_analysis("I cannot help with that."), Err(ParseError::NoJson));
        assert_eq!(parse_analysis("{ not json at all"), Err(ParseError::NoJson));
    }

    #[test]
    fn missing_summary_is_rejected() {
        assert_eq!(
            parse_analysis(r#"{"key_findings": ["x"]}"#),
            Err(ParseError::MissingSummary)
        );
    }

    #[test]
    fn actions_accept_strings_and_objects() {
        let text = r#"{"summary": "s", "recommended_actions": ["Door knock", {"action": "Rally", "rationale": "turnout"}, {"nope": 1}]}"#;
        let analysis = parse_analysis(text).unwrap();
        assert_eq!(analysis.recommended_actions.len(), 2);
        assert_eq!(analysis.recommended_actions[1].rationale, "turnout");
    }

    #[test]
    fn confidence_is_normalized() {
        let pct = parse_analysis(r#"{"summary": "s", "confidence": 85}"#).unwrap();
        assert!((pct.confidence - 0.85).abs() < 1e-9);
        let missing = parse_analysis(r#"{"summary": "s"}"#).unwrap();
        assert!((missing.confidence - DEFAULT_CONFIDENCE).abs() < 1e-9);
    }
}
