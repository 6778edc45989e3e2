// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Data models for strategic briefings, model dispatch and stream events.
//!
//! Requests are immutable once built; results flow through the coordinator and
//! are serialized verbatim into the cache.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Analysis depth tier. Controls fan-out breadth, timeouts and cache TTL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Depth {
    Quick,
    #[default]
    Standard,
    Deep,
}

impl Depth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Depth::Quick => "quick",
            Depth::Standard => "standard",
            Depth::Deep => "deep",
        }
    }

    /// Maximum number of backends consulted at this tier. `None` means all.
    pub fn fan_out(&self) -> Option<usize> {
        match self {
            Depth::Quick => Some(1),
            Depth::Standard => Some(2),
            Depth::Deep => None,
        }
    }
}

impl fmt::Display for Depth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Depth {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "quick" => Ok(Depth::Quick),
            "standard" => Ok(Depth::Standard),
            "deep" => Ok(Depth::Deep),
            other => Err(format!("invalid depth '{other}', expected quick|standard|deep")),
        }
    }
}

/// Strategic posture the briefing is written from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextMode {
    #[default]
    Neutral,
    Offensive,
    Defensive,
}

impl ContextMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextMode::Neutral => "neutral",
            ContextMode::Offensive => "offensive",
            ContextMode::Defensive => "defensive",
        }
    }
}

impl fmt::Display for ContextMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "neutral" => Ok(ContextMode::Neutral),
            "offensive" => Ok(ContextMode::Offensive),
            "defensive" => Ok(ContextMode::Defensive),
            other => Err(format!(
                "invalid context '{other}', expected neutral|offensive|defensive"
            )),
        }
    }
}

/// A single briefing request. Fields are private so a request cannot change
/// after its cache key has been derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    ward: String,
    depth: Depth,
    context: ContextMode,
    filters: Vec<String>,
}

impl AnalysisRequest {
    pub fn new(ward: impl Into<String>, depth: Depth, context: ContextMode) -> Self {
        Self {
            ward: ward.into().trim().to_string(),
            depth,
            context,
            filters: Vec::new(),
        }
    }

    /// Attach free-text filters. Blank entries are dropped.
    pub fn with_filters<I, S>(mut self, filters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filters = filters
            .into_iter()
            .map(Into::into)
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();
        self
    }

    pub fn ward(&self) -> &str {
        &self.ward
    }

    pub fn depth(&self) -> Depth {
        self.depth
    }

    pub fn context(&self) -> ContextMode {
        self.context
    }

    pub fn filters(&self) -> &[String] {
        &self.filters
    }

    /// Query text handed to every provider for this request.
    pub fn query_text(&self) -> String {
        let mut query = format!(
            "Produce a {} strategic briefing for ward '{}' from a {} posture.",
            self.depth, self.ward, self.context
        );
        if !self.filters.is_empty() {
            query.push_str(" Focus on: ");
            query.push_str(&self.filters.join(", "));
            query.push('.');
        }
        query
    }
}

/// Per-dispatch outcome of one backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    AuthError,
    RateLimited,
    Timeout,
    ParseError,
    UnknownError,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::AuthError => "auth_error",
            Outcome::RateLimited => "rate_limited",
            Outcome::Timeout => "timeout",
            Outcome::ParseError => "parse_error",
            Outcome::UnknownError => "unknown_error",
        }
    }
}

/// Registry-owned description of one AI backend.
#[derive(Debug, Clone, Serialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub endpoint: String,
    #[serde(skip_serializing)]
    pub credential: Option<String>,
    /// Lower is preferred.
    pub priority: u32,
    pub available: Option<bool>,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Cooldowns applied since the last success; drives the backoff step.
    pub cooldowns: u32,
}

impl ModelDescriptor {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        credential: Option<String>,
        priority: u32,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            credential,
            priority,
            available: None,
            last_probe_at: None,
            cooldown_until: None,
            consecutive_failures: 0,
            cooldowns: 0,
        }
    }

    pub fn has_credential(&self) -> bool {
        self.credential
            .as_deref()
            .map(|c| !c.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.map(|until| until > now).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecommendedAction {
    pub action: String,
    #[serde(default)]
    pub rationale: String,
}

/// Structured content of a successful backend answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub strategic_summary: String,
    #[serde(default)]
    pub key_findings: Vec<String>,
    #[serde(default)]
    pub opportunities: Vec<String>,
    #[serde(default)]
    pub threats: Vec<String>,
    #[serde(default)]
    pub recommended_actions: Vec<RecommendedAction>,
    pub confidence: f64,
}

/// Result of one dispatch attempt; discarded after merge.
#[derive(Debug, Clone)]
pub struct ModelResult {
    pub model: String,
    pub priority: u32,
    pub latency_ms: u64,
    pub outcome: Outcome,
    pub analysis: Option<Analysis>,
    pub detail: Option<String>,
}

impl ModelResult {
    pub fn success(model: &ModelDescriptor, latency_ms: u64, analysis: Analysis) -> Self {
        Self {
            model: model.name.clone(),
            priority: model.priority,
            latency_ms,
            outcome: Outcome::Success,
            analysis: Some(analysis),
            detail: None,
        }
    }

    pub fn failure(
        model: &ModelDescriptor,
        latency_ms: u64,
        outcome: Outcome,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            model: model.name.clone(),
            priority: model.priority,
            latency_ms,
            outcome,
            analysis: None,
            detail: Some(detail.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success && self.analysis.is_some()
    }
}

/// The merged briefing returned to callers and persisted in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatedResult {
    pub ward: String,
    pub depth: Depth,
    pub context: ContextMode,
    #[serde(alias = "briefing")]
    pub strategic_summary: String,
    pub key_findings: Vec<String>,
    pub opportunities: Vec<String>,
    pub threats: Vec<String>,
    pub recommended_actions: Vec<RecommendedAction>,
    pub confidence_score: f64,
    pub consensus_score: f64,
    pub models_consulted: Vec<String>,
    pub ai_powered: bool,
    pub fallback_mode: bool,
    pub generated_at: DateTime<Utc>,
}

/// A serialized briefing as held by a cache store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub payload: String,
    pub etag: String,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn ttl_remaining_seconds(&self, now: DateTime<Utc>) -> u64 {
        let remaining = (self.expires_at - now).num_seconds();
        if remaining <= 0 {
            0
        } else {
            remaining as u64
        }
    }

    /// Rough in-memory footprint, for monitoring only.
    pub fn approx_size(&self) -> usize {
        self.key.len() + self.payload.len() + self.etag.len() + 2 * std::mem::size_of::<DateTime<Utc>>()
    }
}

/// Alert severity as recorded by the data store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Stream subscriber priority filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityFilter {
    #[default]
    All,
    High,
    Critical,
}

impl PriorityFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityFilter::All => "all",
            PriorityFilter::High => "high",
            PriorityFilter::Critical => "critical",
        }
    }

    pub fn admits(&self, severity: Severity) -> bool {
        match self {
            PriorityFilter::All => true,
            PriorityFilter::High => severity >= Severity::High,
            PriorityFilter::Critical => severity == Severity::Critical,
        }
    }
}

impl FromStr for PriorityFilter {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(PriorityFilter::All),
            "high" => Ok(PriorityFilter::High),
            "critical" => Ok(PriorityFilter::Critical),
            other => Err(format!("invalid priority '{other}', expected all|high|critical")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub ward: String,
    pub severity: Severity,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub ward: String,
    pub text: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub sentiment: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Locally available aggregate signals for a ward, used by fallback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WardSnapshot {
    pub ward: String,
    pub post_count: u64,
    #[serde(default)]
    pub sentiment_counts: Vec<(String, u64)>,
    #[serde(default)]
    pub topic_counts: Vec<(String, u64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    Connection,
    Alert,
    Intelligence,
    Heartbeat,
    Error,
    FatalError,
}

/// In-flight stream frame. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: StreamEventKind,
    pub ward: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StreamEvent {
    pub fn data(kind: StreamEventKind, ward: &str, data: serde_json::Value) -> Self {
        Self {
            kind,
            ward: ward.to_string(),
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(kind: StreamEventKind, ward: &str, error: impl Into<String>) -> Self {
        Self {
            kind,
            ward: ward.to_string(),
            data: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    /// One NDJSON frame, newline terminated.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut line = serde_json::to_vec(self).unwrap_or_else(|_| b"{}".to_vec());
        line.push(b'\n');
        line
    }
}
