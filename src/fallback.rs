//! Deterministic, non-AI briefings built from local aggregate signals.
//!
//! Everything produced here is flagged `fallback_mode = true` and
//! `ai_powered = false` with zero confidence, and never mixes in model output.

use chrono::Utc;

use crate::model::{AnalysisRequest, CoordinatedResult, RecommendedAction, WardSnapshot};

pub const FALLBACK_LABEL: &str = "[Automated fallback: no AI analysis available]";

const NEGATIVE_SENTIMENTS: &[&str] = &["anger", "frustration", "fear", "sadness", "negative", "disgust"];
const POSITIVE_SENTIMENTS: &[&str] = &["hope", "pride", "joy", "positive", "trust", "gratitude"];

/// Build the templated briefing. `snapshot` is `None` when local signals
/// could not be read either.
pub fn fallback_briefing(
    request: &AnalysisRequest,
    snapshot: Option<&WardSnapshot>,
    max_items: usize,
) -> CoordinatedResult {
    let sentiments = snapshot.map(|s| ranked(&s.sentiment_counts)).unwrap_or_default();
    let topics = snapshot.map(|s| ranked(&s.topic_counts)).unwrap_or_default();
    let post_count = snapshot.map(|s| s.post_count).unwrap_or(0);

    let mut summary = format!("{FALLBACK_LABEL} Ward {}: ", request.ward());
    if post_count == 0 {
        summary.push_str("no recent local signals are available.");
    } else {
        summary.push_str(&format!("{post_count} recent posts analysed"));
        if let Some((sentiment, count)) = sentiments.first() {
            summary.push_str(&format!("; dominant sentiment {sentiment} ({count})"));
        }
        if !topics.is_empty() {
            let leading: Vec<String> = topics
                .iter()
                .take(3)
                .map(|(topic, count)| format!("{topic} ({count})"))
                .collect();
            summary.push_str(&format!("; leading topics {}", leading.join(", ")));
        }
        summary.push('.');
    }

    let key_findings = topics
        .iter()
        .take(max_items)
        .map(|(topic, count)| format!("Topic '{topic}' appears in {count} of {post_count} posts"))
        .collect();

    let opportunities = sentiments
        .iter()
        .filter(|(s, _)| POSITIVE_SENTIMENTS.contains(&s.as_str()))
        .take(max_items)
        .map(|(s, count)| format!("Build on {s} sentiment expressed in {count} posts"))
        .collect();

    let threats = sentiments
        .iter()
        .filter(|(s, _)| NEGATIVE_SENTIMENTS.contains(&s.as_str()))
        .take(max_items)
        .map(|(s, count)| format!("Address {s} sentiment expressed in {count} posts"))
        .collect();

    let recommended_actions = topics
        .iter()
        .take(max_items)
        .map(|(topic, count)| RecommendedAction {
            action: format!("Monitor discussion of {topic}"),
            rationale: format!("{count} recent posts; rerun when AI analysis is available"),
        })
        .collect();

    CoordinatedResult {
        ward: request.ward().to_string(),
        depth: request.depth(),
        context: request.context(),
        strategic_summary: summary,
        key_findings,
        opportunities,
        threats,
        recommended_actions,
        confidence_score: 0.0,
        consensus_score: 0.0,
        models_consulted: Vec::new(),
        ai_powered: false,
        fallback_mode: true,
        generated_at: Utc::now(),
    }
}

/// Count descending, then name ascending.
fn ranked(counts: &[(String, u64)]) -> Vec<(String, u64)> {
    let mut ranked: Vec<(String, u64)> = counts
        .iter()
        .filter(|(_, count)| *count > 0)
        .map(|(name, count)| (name.to_lowercase(), *count))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}
