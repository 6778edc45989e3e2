//! Reconciliation of successful model results into one briefing.
//!
//! Output depends only on the set of results and their priorities, never on
//! the order they arrived in.

use std::collections::HashSet;

use chrono::Utc;

use crate::model::{AnalysisRequest, CoordinatedResult, ModelResult, RecommendedAction};

const CONSENSUS_WEIGHT: f64 = 0.4;
const FAILURE_PENALTY: f64 = 0.1;
const MIN_CONFIDENCE: f64 = 0.05;
const MAX_CONFIDENCE: f64 = 0.95;
/// Entries shorter than this many tokens only dedupe on exact normalized match.
const MIN_OVERLAP_TOKENS: usize = 3;

#[derive(Debug, Clone, Copy)]
pub struct MergeConfig {
    pub max_items: usize,
    /// Token-set Jaccard similarity at or above which two entries are duplicates.
    pub similarity: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_items: 5,
            similarity: 0.8,
        }
    }
}

/// Merge every dispatched result. Returns `None` when nothing succeeded.
pub fn merge(
    request: &AnalysisRequest,
    results: &[ModelResult],
    config: MergeConfig,
) -> Option<CoordinatedResult> {
    let mut successes: Vec<&ModelResult> = results.iter().filter(|r| r.is_success()).collect();
    if successes.is_empty() {
        return None;
    }
    successes.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.model.cmp(&b.model)));

    let analyses: Vec<_> = successes.iter().filter_map(|r| r.analysis.as_ref()).collect();
    let canonical = analyses.first()?;

    let key_findings = union_text(analyses.iter().map(|a| &a.key_findings), config);
    let opportunities = union_text(analyses.iter().map(|a| &a.opportunities), config);
    let threats = union_text(analyses.iter().map(|a| &a.threats), config);
    let recommended_actions = union_actions(analyses.iter().map(|a| &a.recommended_actions), config);

    let dispatched = results.len().max(successes.len());
    let failed = dispatched - successes.len();
    let consensus_score = successes.len() as f64 / dispatched as f64;
    let mean_confidence =
        analyses.iter().map(|a| a.confidence.clamp(0.0, 1.0)).sum::<f64>() / analyses.len() as f64;

    Some(CoordinatedResult {
        ward: request.ward().to_string(),
        depth: request.depth(),
        context: request.context(),
        strategic_summary: canonical.strategic_summary.clone(),
        key_findings,
        opportunities,
        threats,
        recommended_actions,
        confidence_score: confidence_score(consensus_score, mean_confidence, failed),
        consensus_score,
        models_consulted: successes.iter().map(|r| r.model.clone()).collect(),
        ai_powered: true,
        fallback_mode: false,
        generated_at: Utc::now(),
    })
}

/// Weighted blend of consensus and self-reported confidence, minus a fixed
/// penalty per failed model, kept strictly inside (0, 1).
pub fn confidence_score(consensus: f64, mean_confidence: f64, failed: usize) -> f64 {
    let blended = CONSENSUS_WEIGHT * consensus + (1.0 - CONSENSUS_WEIGHT) * mean_confidence;
    (blended - FAILURE_PENALTY * failed as f64).clamp(MIN_CONFIDENCE, MAX_CONFIDENCE)
}

/// Interleave lists by position, tie-broken by model priority (the order of
/// `lists`), dropping near-duplicates and stopping at the cap.
fn union_text<'a>(lists: impl Iterator<Item = &'a Vec<String>>, config: MergeConfig) -> Vec<String> {
    let lists: Vec<&Vec<String>> = lists.collect();
    let mut seen = Deduper::new(config.similarity);
    let mut merged = Vec::new();

    for entry in interleave(&lists) {
        if merged.len() >= config.max_items {
            break;
        }
        if seen.insert(entry) {
            merged.push(entry.trim().to_string());
        }
    }
    merged
}

fn union_actions<'a>(
    lists: impl Iterator<Item = &'a Vec<RecommendedAction>>,
    config: MergeConfig,
) -> Vec<RecommendedAction> {
    let lists: Vec<&Vec<RecommendedAction>> = lists.collect();
    let mut seen = Deduper::new(config.similarity);
    let mut merged = Vec::new();

    for action in interleave(&lists) {
        if merged.len() >= config.max_items {
            break;
        }
        if seen.insert(&action.action) {
            merged.push(action.clone());
        }
    }
    merged
}

fn interleave<'a, T>(lists: &[&'a Vec<T>]) -> Vec<&'a T> {
    let longest = lists.iter().map(|l| l.len()).max().unwrap_or(0);
    let mut ordered = Vec::new();
    for i in 0..longest {
        for &list in lists {
            if let Some(item) = list.get(i) {
                ordered.push(item);
            }
        }
    }
    ordered
}

/// Remembers normalized entries and rejects near-identical ones.
struct Deduper {
    threshold: f64,
    exact: HashSet<String>,
    token_sets: Vec<HashSet<String>>,
}

impl Deduper {
    fn new(threshold: f64) -> Self {
        Self {
            threshold,
            exact: HashSet::new(),
            token_sets: Vec::new(),
        }
    }

    /// Returns true when `entry` is new.
    fn insert(&mut self, entry: &str) -> bool {
        let normalized = normalize(entry);
        if normalized.is_empty() || self.exact.contains(&normalized) {
            return false;
        }

        let tokens: HashSet<String> = normalized.split(' ').map(str::to_string).collect();
        if tokens.len() >= MIN_OVERLAP_TOKENS
            && self
                .token_sets
                .iter()
                .filter(|other| other.len() >= MIN_OVERLAP_TOKENS)
                .any(|other| jaccard(&tokens, other) >= self.threshold)
        {
            return false;
        }

        self.exact.insert(normalized);
        self.token_sets.push(tokens);
        true
    }
}

/// Lowercase, punctuation to spaces, whitespace collapsed.
pub fn normalize(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { ' ' })
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Analysis, ContextMode, Depth, ModelDescriptor, Outcome};

    fn descriptor(name: &str, priority: u32) -> ModelDescriptor {
        ModelDescriptor::new(name, "https://x", Some("k".into()), priority)
    }

    fn success(name: &str, priority: u32, summary: &str, findings: &[&str], confidence: f64) -> ModelResult {
        ModelResult::success(
            &descriptor(name, priority),
            100,
            Analysis {
                strategic_summary: summary.to_string(),
                key_findings: findings.iter().map(|s| s.to_string()).collect(),
                confidence,
                ..Analysis::default()
            },
        )
    }

    fn failure(name: &str, priority: u32, outcome: Outcome) -> ModelResult {
        ModelResult::failure(&descriptor(name, priority), 100, outcome, "failed")
    }

    fn request() -> AnalysisRequest {
        AnalysisRequest::new("w1", Depth::Deep, ContextMode::Neutral)
    }

    #[test]
    fn nothing_to_merge_without_successes() {
        let results = vec![failure("a", 1, Outcome::Timeout), failure("b", 2, Outcome::ParseError)];
        assert!(merge(&request(), &results, MergeConfig::default()).is_none());
    }

    #[test]
    fn summary_comes_from_highest_priority_regardless_of_order() {
        let forward = vec![
            success("a", 1, "from a", &[], 0.8),
            success("b", 2, "from b", &[], 0.9),
        ];
        let reversed: Vec<_> = forward.iter().rev().cloned().collect();

        let one = merge(&request(), &forward, MergeConfig::default()).unwrap();
        let two = merge(&request(), &reversed, MergeConfig::default()).unwrap();
        assert_eq!(one.strategic_summary, "from a");
        assert_eq!(two.strategic_summary, "from a");
        assert_eq!(one.models_consulted, vec!["a", "b"]);
        assert_eq!(one.models_consulted, two.models_consulted);
        assert_eq!(one.key_findings, two.key_findings);
    }

    #[test]
    fn case_and_whitespace_variants_collapse() {
        let results = vec![
            success("a", 1, "s", &["water shortage", "road repairs"], 0.8),
            success("b", 2, "s", &["Water  Shortage", "youth unemployment"], 0.8),
            failure("c", 3, Outcome::Timeout),
        ];
        let merged = merge(&request(), &results, MergeConfig::default()).unwrap();
        assert_eq!(
            merged.key_findings,
            vec!["water shortage", "road repairs", "youth unemployment"]
        );
    }

    #[test]
    fn high_overlap_entries_are_deduplicated() {
        let results = vec![
            success("a", 1, "s", &["Rising anger over water supply cuts in the east"], 0.8),
            success("b", 2, "s", &["rising anger over water supply cuts in east"], 0.8),
        ];
        let merged = merge(&request(), &results, MergeConfig::default()).unwrap();
        assert_eq!(merged.key_findings.len(), 1);
    }

    #[test]
    fn lists_interleave_by_priority_and_respect_cap() {
        let results = vec![
            success("b", 2, "s", &["b1", "b2", "b3"], 0.8),
            success("a", 1, "s", &["a1", "a2", "a3"], 0.8),
        ];
        let config = MergeConfig {
            max_items: 4,
            ..MergeConfig::default()
        };
        let merged = merge(&request(), &results, config).unwrap();
        assert_eq!(merged.key_findings, vec!["a1", "b1", "a2", "b2"]);
    }

    #[test]
    fn scores_reflect_consensus_and_failures() {
        let results = vec![
            success("a", 1, "s", &[], 0.9),
            success("b", 2, "s", &[], 0.7),
            failure("c", 3, Outcome::AuthError),
        ];
        let merged = merge(&request(), &results, MergeConfig::default()).unwrap();
        assert!((merged.consensus_score - 2.0 / 3.0).abs() < 1e-9);
        let expected = 0.4 * (2.0 / 3.0) + 0.6 * 0.8 - 0.1;
        assert!((merged.confidence_score - expected).abs() < 1e-9);
        assert!(merged.ai_powered);
        assert!(!merged.fallback_mode);
    }

    #[test]
    fn confidence_stays_strictly_inside_unit_interval() {
        assert!(confidence_score(1.0, 1.0, 0) < 1.0);
        assert!(confidence_score(0.1, 0.0, 9) > 0.0);
    }

    #[test]
    fn normalize_strips_punctuation() {
        assert_eq!(normalize("  Water-Shortage!! "), "water shortage");
    }
}
