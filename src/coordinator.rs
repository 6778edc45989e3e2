// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Multi-model coordinator.
//!
//! Per request: check the cache, and on a miss fan out to the active models
//! under a per-model timeout and a hard overall deadline, merge whatever
//! succeeded, and store the result. When nothing succeeds the answer is a
//! templated fallback that is returned but not cached.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::time::Instant;

use crate::cache::{Briefing, BriefingCache, CacheStatus, Computed};
use crate::config::{DepthPolicy, TierPolicy};
use crate::fallback::fallback_briefing;
use crate::merge::{merge, MergeConfig};
use crate::metrics::Metrics;
use crate::model::{AnalysisRequest, CoordinatedResult, ModelResult, Outcome};
use crate::parse::parse_analysis;
use crate::registry::{ActiveModel, ModelRegistry};
use crate::signals::SignalStore;

const TRACE_CAPACITY: usize = 128;

#[derive(Debug, Clone, Serialize)]
pub struct AttemptTrace {
    pub model: String,
    pub outcome: Outcome,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Post-hoc record of one computation: which models were tried and why it
/// did or did not fall back.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchTrace {
    pub key: String,
    pub ward: String,
    pub depth: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub attempts: Vec<AttemptTrace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

#[derive(Clone)]
pub struct Coordinator {
    registry: ModelRegistry,
    cache: BriefingCache,
    signals: Arc<dyn SignalStore>,
    metrics: Metrics,
    policy: Arc<DepthPolicy>,
    merge_config: MergeConfig,
    traces: Arc<Mutex<VecDeque<DispatchTrace>>>,
}

impl Coordinator {
    pub fn new(
        registry: ModelRegistry,
        cache: BriefingCache,
        signals: Arc<dyn SignalStore>,
        metrics: Metrics,
        policy: DepthPolicy,
        merge_config: MergeConfig,
    ) -> Self {
        Self {
            registry,
            cache,
            signals,
            metrics,
            policy: Arc::new(policy),
            merge_config,
            traces: Arc::new(Mutex::new(VecDeque::with_capacity(TRACE_CAPACITY))),
        }
    }

    /// Produce a briefing. Never fails; degradation shows up as
    /// `fallback_mode`.
    pub async fn analyze(&self, request: &AnalysisRequest) -> CoordinatedResult {
        self.briefing(request).await.result.as_ref().clone()
    }

    /// Like [`analyze`](Self::analyze) but also returns the serialized
    /// payload, its ETag and how it was obtained.
    pub async fn briefing(&self, request: &AnalysisRequest) -> Briefing {
        let key = BriefingCache::key_for(request);
        let coordinator = self.clone();
        let owned = request.clone();

        match self
            .cache
            .get_or_compute(&key, move || async move { coordinator.compute(owned).await })
            .await
        {
            Ok(briefing) => briefing,
            Err(error) => {
                tracing::error!(%key, %error, "shared computation lost; answering with fallback");
                let deadline = Instant::now() + self.policy.tier(request.depth()).deadline;
                let result = self.fallback(request, deadline).await;
                let payload = serde_json::to_string(&result).unwrap_or_default();
                Briefing {
                    etag: crate::cache::content_hash(&payload),
                    payload: Arc::from(payload),
                    result: Arc::new(result),
                    status: CacheStatus::Fallback,
                }
            }
        }
    }

    /// Most recent traces, newest first.
    pub fn recent_traces(&self) -> Vec<DispatchTrace> {
        let traces = self.traces.lock().unwrap_or_else(|p| p.into_inner());
        traces.iter().rev().cloned().collect()
    }

    /// Everything from model selection to fallback runs against one deadline.
    async fn compute(&self, request: AnalysisRequest) -> Computed {
        let started = Instant::now();
        let started_at = Utc::now();
        let tier = self.policy.tier(request.depth());
        let deadline = started + tier.deadline;
        let models = self.registry.active_models_by(request.depth(), deadline).await;

        let (computed, attempts, fallback_reason) = if models.is_empty() {
            tracing::warn!(ward = request.ward(), depth = %request.depth(), "no active models; using fallback");
            let result = self.fallback(&request, deadline).await;
            (
                Computed { result, ttl: None },
                Vec::new(),
                Some("no active models".to_string()),
            )
        } else {
            let results = self.dispatch(&request, &models, tier, deadline).await;
            self.record_outcomes(&results).await;

            let attempts = results.iter().map(attempt_trace).collect();
            match merge(&request, &results, self.merge_config) {
                Some(result) => (
                    Computed {
                        result,
                        ttl: Some(tier.cache_ttl),
                    },
                    attempts,
                    None,
                ),
                None => {
                    tracing::warn!(ward = request.ward(), "all models failed; using fallback");
                    let result = self.fallback(&request, deadline).await;
                    (
                        Computed { result, ttl: None },
                        attempts,
                        Some("all models failed".to_string()),
                    )
                }
            }
        };

        let elapsed = started.elapsed();
        self.metrics.record_briefing(
            request.depth().as_str(),
            computed.result.fallback_mode,
            elapsed.as_secs_f64(),
        );
        self.push_trace(DispatchTrace {
            key: BriefingCache::key_for(&request),
            ward: request.ward().to_string(),
            depth: request.depth().to_string(),
            started_at,
            elapsed_ms: elapsed.as_millis() as u64,
            attempts,
            fallback_reason,
        });

        computed
    }

    /// Call every model concurrently. Results come back in `models` order.
    async fn dispatch(
        &self,
        request: &AnalysisRequest,
        models: &[ActiveModel],
        tier: TierPolicy,
        deadline: Instant,
    ) -> Vec<ModelResult> {
        let started = Instant::now();
        let query = request.query_text();

        let mut pending: FuturesUnordered<_> = models
            .iter()
            .enumerate()
            .map(|(slot, model)| {
                let query = query.as_str();
                async move { (slot, call_model(model, query, request, tier).await) }
            })
            .collect();

        let mut slots: Vec<Option<ModelResult>> = vec![None; models.len()];
        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some((slot, result))) => slots[slot] = Some(result),
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        ward = request.ward(),
                        outstanding = pending.len(),
                        "request deadline elapsed; abandoning outstanding models"
                    );
                    break;
                }
            }
        }
        drop(pending);

        let waited = started.elapsed().as_millis() as u64;
        slots
            .into_iter()
            .zip(models)
            .map(|(slot, model)| {
                slot.unwrap_or_else(|| {
                    ModelResult::failure(
                        &model.descriptor,
                        waited,
                        Outcome::Timeout,
                        "request deadline elapsed",
                    )
                })
            })
            .collect()
    }

    async fn record_outcomes(&self, results: &[ModelResult]) {
        for result in results {
            self.metrics.record_dispatch(
                &result.model,
                result.outcome.as_str(),
                result.latency_ms as f64 / 1000.0,
            );
            if result.is_success() {
                self.registry.mark_success(&result.model).await;
            } else {
                tracing::info!(
                    model = %result.model,
                    outcome = result.outcome.as_str(),
                    latency_ms = result.latency_ms,
                    detail = result.detail.as_deref().unwrap_or(""),
                    "model excluded from merge"
                );
                self.registry.mark_failure(&result.model, result.outcome).await;
            }
        }
    }

    /// Template briefing from local signals, read within what is left of `deadline`.
    async fn fallback(&self, request: &AnalysisRequest, deadline: Instant) -> CoordinatedResult {
        let read = self.signals.ward_snapshot(request.ward());
        let snapshot = match tokio::time::timeout_at(deadline, read).await {
            Ok(Ok(snapshot)) => Some(snapshot),
            Ok(Err(error)) => {
                tracing::warn!(ward = request.ward(), %error, "local signals unavailable for fallback");
                None
            }
            Err(_) => {
                tracing::warn!(ward = request.ward(), "request deadline elapsed before local signals were read");
                None
            }
        };
        fallback_briefing(request, snapshot.as_ref(), self.merge_config.max_items)
    }

    fn push_trace(&self, trace: DispatchTrace) {
        let mut traces = self.traces.lock().unwrap_or_else(|p| p.into_inner());
        if traces.len() >= TRACE_CAPACITY {
            traces.pop_front();
        }
        traces.push_back(trace);
    }
}

async fn call_model(
    model: &ActiveModel,
    query: &str,
    request: &AnalysisRequest,
    tier: TierPolicy,
) -> ModelResult {
    let started = Instant::now();
    let call = model
        .provider
        .generate(query, request.ward(), request.context());
    let response = tokio::time::timeout(tier.model_timeout, call).await;
    let latency_ms = started.elapsed().as_millis() as u64;
    let descriptor = &model.descriptor;

    match response {
        Err(_) => ModelResult::failure(descriptor, latency_ms, Outcome::Timeout, "model timeout elapsed"),
        Ok(Err(error)) => ModelResult::failure(descriptor, latency_ms, error.outcome(), error.to_string()),
        Ok(Ok(text)) => match parse_analysis(&text) {
            Ok(analysis) => ModelResult::success(descriptor, latency_ms, analysis),
            Err(error) => ModelResult::failure(descriptor, latency_ms, Outcome::ParseError, error.to_string()),
        },
    }
}

fn attempt_trace(result: &ModelResult) -> AttemptTrace {
    AttemptTrace {
        model: result.model.clone(),
        outcome: result.outcome,
        latency_ms: result.latency_ms,
        detail: result.detail.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::error::{ProviderError, SignalError, StoreError};
    use crate::model::CacheEntry;
    use crate::model::{ContextMode, Depth, ModelDescriptor, WardSnapshot};
    use crate::provider::fake::FakeProvider;
    use crate::signals::{MemorySignalStore, MockSignalStore};
    use crate::state::MemoryStore;
    use std::time::Duration;

    const VALID: &str = r#"```json
{"strategic_summary": "Consolidate the base", "key_findings": ["water shortage", "road repairs"],
 "opportunities": ["youth outreach"], "threats": ["rival rally"],
 "recommended_actions": [{"action": "Door-to-door campaign", "rationale": "low turnout"}],
 "confidence": 0.8}
```"#;

    const OTHER: &str = r#"{"strategic_summary": "Secondary view", "key_findings": ["Water Shortage", "power cuts"], "confidence": 0.6}"#;

    struct Harness {
        coordinator: Coordinator,
        registry: ModelRegistry,
        store: MemoryStore,
        metrics: Metrics,
    }

    fn policy(model_timeout: u64, deadline: u64) -> DepthPolicy {
        let tier = TierPolicy {
            cache_ttl: Duration::from_secs(300),
            model_timeout: Duration::from_secs(model_timeout),
            deadline: Duration::from_secs(deadline),
        };
        DepthPolicy {
            quick: tier,
            standard: TierPolicy {
                cache_ttl: Duration::from_secs(900),
                ..tier
            },
            deep: TierPolicy {
                cache_ttl: Duration::from_secs(3600),
                ..tier
            },
        }
    }

    async fn harness(models: Vec<(&str, u32, FakeProvider)>, policy: DepthPolicy) -> Harness {
        harness_with_signals(models, policy, Arc::new(MemorySignalStore::new())).await
    }

    async fn harness_with_signals(
        models: Vec<(&str, u32, FakeProvider)>,
        policy: DepthPolicy,
        signals: Arc<dyn SignalStore>,
    ) -> Harness {
        let metrics = Metrics::new().unwrap();
        let store = MemoryStore::new();
        let cache = BriefingCache::new(Arc::new(store.clone()), metrics.clone());
        let registry = ModelRegistry::new(Duration::from_secs(300));
        for (name, priority, provider) in models {
            registry
                .register(
                    ModelDescriptor::new(name, "https://example.invalid", Some("key".into()), priority),
                    Arc::new(provider),
                )
                .await
                .unwrap();
        }
        let coordinator = Coordinator::new(
            registry.clone(),
            cache,
            signals,
            metrics.clone(),
            policy,
            MergeConfig::default(),
        );
        Harness {
            coordinator,
            registry,
            store,
            metrics,
        }
    }

    #[tokio::test]
    async fn quick_single_healthy_model_is_ai_powered_and_cached() {
        let provider = FakeProvider::replying(VALID);
        let h = harness(vec![("alpha", 1, provider.clone())], policy(10, 15)).await;
        let request = AnalysisRequest::new("w1", Depth::Quick, ContextMode::Neutral);

        let briefing = h.coordinator.briefing(&request).await;
        assert_eq!(briefing.status, CacheStatus::Miss);
        assert!(briefing.result.ai_powered);
        assert!(!briefing.result.fallback_mode);
        assert_eq!(briefing.result.models_consulted, vec!["alpha"]);
        assert_eq!(briefing.result.strategic_summary, "Consolidate the base");
        assert!(briefing.result.confidence_score > 0.0 && briefing.result.confidence_score < 1.0);

        let entry = h
            .store
            .get(&BriefingCache::key_for(&request))
            .await
            .unwrap()
            .expect("briefing cached");
        let ttl = (entry.expires_at - entry.stored_at).num_seconds();
        assert_eq!(ttl, 300);
        assert_eq!(entry.etag, briefing.etag);

        let again = h.coordinator.briefing(&request).await;
        assert_eq!(again.status, CacheStatus::Hit);
        assert_eq!(again.payload, briefing.payload);
        assert_eq!(again.etag, briefing.etag);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn deep_merge_dedupes_case_variants_and_tolerates_failure() {
        let h = harness(
            vec![
                ("alpha", 1, FakeProvider::replying(VALID)),
                ("beta", 2, FakeProvider::replying(OTHER)),
                ("gamma", 3, FakeProvider::replying("sorry, no json today")),
            ],
            policy(10, 15),
        )
        .await;
        let request = AnalysisRequest::new("w1", Depth::Deep, ContextMode::Offensive);

        let result = h.coordinator.analyze(&request).await;
        assert!(result.ai_powered);
        assert_eq!(result.models_consulted, vec!["alpha", "beta"]);
        let water = result
            .key_findings
            .iter()
            .filter(|f| f.to_lowercase() == "water shortage")
            .count();
        assert_eq!(water, 1);
        assert!((result.consensus_score - 2.0 / 3.0).abs() < 1e-9);

        let trace = &h.coordinator.recent_traces()[0];
        assert_eq!(trace.attempts.len(), 3);
        assert_eq!(trace.attempts[2].outcome, Outcome::ParseError);
        assert!(trace.fallback_reason.is_none());
    }

    #[tokio::test]
    async fn empty_registry_falls_back_without_caching() {
        let h = harness(vec![], policy(10, 15)).await;
        let request = AnalysisRequest::new("w1", Depth::Standard, ContextMode::Neutral);

        let briefing = h.coordinator.briefing(&request).await;
        assert_eq!(briefing.status, CacheStatus::Fallback);
        assert!(briefing.result.fallback_mode);
        assert!(!briefing.result.ai_powered);
        assert_eq!(briefing.result.confidence_score, 0.0);
        assert!(h
            .store
            .get(&BriefingCache::key_for(&request))
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            h.coordinator.recent_traces()[0].fallback_reason.as_deref(),
            Some("no active models")
        );
    }

    #[tokio::test]
    async fn all_failures_fall_back_from_local_signals() {
        let mut signals = MockSignalStore::new();
        signals.expect_ward_snapshot().returning(|ward| {
            Ok(WardSnapshot {
                ward: ward.to_string(),
                post_count: 4,
                sentiment_counts: vec![("anger".to_string(), 3)],
                topic_counts: vec![("water".to_string(), 4)],
            })
        });
        let h = harness_with_signals(
            vec![
                ("alpha", 1, FakeProvider::failing(ProviderError::Unknown("500".into()))),
                ("beta", 2, FakeProvider::replying("not json")),
            ],
            policy(10, 15),
            Arc::new(signals),
        )
        .await;
        let request = AnalysisRequest::new("w1", Depth::Standard, ContextMode::Neutral);

        let result = h.coordinator.analyze(&request).await;
        assert!(result.fallback_mode);
        assert!(!result.ai_powered);
        assert_eq!(result.confidence_score, 0.0);
        assert!(result.strategic_summary.contains("dominant sentiment anger"));
        let trace = &h.coordinator.recent_traces()[0];
        assert_eq!(trace.fallback_reason.as_deref(), Some("all models failed"));
    }

    #[tokio::test]
    async fn fallback_survives_unreadable_signals() {
        let mut signals = MockSignalStore::new();
        signals
            .expect_ward_snapshot()
            .returning(|_| Err(SignalError::Unavailable("db down".into())));
        let h = harness_with_signals(vec![], policy(10, 15), Arc::new(signals)).await;

        let result = h
            .coordinator
            .analyze(&AnalysisRequest::new("w1", Depth::Quick, ContextMode::Neutral))
            .await;
        assert!(result.fallback_mode);
        assert!(result.strategic_summary.contains("no recent local signals"));
    }

    #[tokio::test(start_paused = true)]
    async fn straggler_never_delays_past_deadline() {
        let h = harness(
            vec![
                ("alpha", 1, FakeProvider::hanging()),
                ("beta", 2, FakeProvider::replying(OTHER).with_delay(Duration::from_secs(2))),
            ],
            // Model timeout above the deadline so only the deadline can cut alpha off.
            policy(60, 5),
        )
        .await;
        let request = AnalysisRequest::new("w1", Depth::Deep, ContextMode::Neutral);

        let started = Instant::now();
        let result = h.coordinator.analyze(&request).await;
        let elapsed = started.elapsed();

        assert!(elapsed <= Duration::from_secs(5) + Duration::from_millis(100));
        assert!(result.ai_powered);
        assert_eq!(result.models_consulted, vec!["beta"]);
        assert_eq!(result.strategic_summary, "Secondary view");
        let trace = &h.coordinator.recent_traces()[0];
        assert_eq!(trace.attempts[0].outcome, Outcome::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn availability_probes_count_against_the_deadline() {
        let slow_probe = |reply: &str| FakeProvider::replying(reply).with_probe_delay(Duration::from_secs(4));
        let h = harness(
            vec![
                ("alpha", 1, slow_probe(VALID)),
                ("beta", 2, slow_probe(OTHER)),
                ("gamma", 3, slow_probe(OTHER)),
            ],
            policy(3, 5),
        )
        .await;
        let request = AnalysisRequest::new("w1", Depth::Deep, ContextMode::Neutral);

        let started = Instant::now();
        let result = h.coordinator.analyze(&request).await;

        assert!(started.elapsed() <= Duration::from_secs(5) + Duration::from_millis(100));
        assert!(result.ai_powered);
        assert_eq!(result.models_consulted, vec!["alpha", "beta", "gamma"]);
    }

    struct StalledSignals;

    #[async_trait::async_trait]
    impl SignalStore for StalledSignals {
        async fn ward_exists(&self, _ward: &str) -> Result<bool, SignalError> {
            Ok(true)
        }
        async fn alerts_since(
            &self,
            _ward: &str,
            _since: Option<DateTime<Utc>>,
            _priority: crate::model::PriorityFilter,
        ) -> Result<Vec<crate::model::Alert>, SignalError> {
            Ok(vec![])
        }
        async fn posts_since(
            &self,
            _ward: &str,
            _since: Option<DateTime<Utc>>,
        ) -> Result<Vec<crate::model::Post>, SignalError> {
            Ok(vec![])
        }
        async fn ward_snapshot(&self, _ward: &str) -> Result<WardSnapshot, SignalError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn probes_and_signals_past_deadline_still_answer_on_time() {
        let h = harness_with_signals(
            vec![("alpha", 1, FakeProvider::replying(VALID).with_probe_delay(Duration::from_secs(4)))],
            policy(3, 2),
            Arc::new(StalledSignals),
        )
        .await;
        let request = AnalysisRequest::new("w1", Depth::Quick, ContextMode::Neutral);

        let started = Instant::now();
        let result = h.coordinator.analyze(&request).await;

        assert!(started.elapsed() <= Duration::from_secs(2) + Duration::from_millis(100));
        assert!(result.fallback_mode);
        assert!(result.strategic_summary.contains("no recent local signals"));
        assert_eq!(
            h.coordinator.recent_traces()[0].fallback_reason.as_deref(),
            Some("no active models")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn per_model_timeout_is_recorded_as_timeout() {
        let h = harness(
            vec![("alpha", 1, FakeProvider::replying(VALID).with_delay(Duration::from_secs(20)))],
            policy(3, 10),
        )
        .await;
        let request = AnalysisRequest::new("w1", Depth::Quick, ContextMode::Neutral);

        let started = Instant::now();
        let result = h.coordinator.analyze(&request).await;
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(result.fallback_mode);
        assert_eq!(h.coordinator.recent_traces()[0].attempts[0].outcome, Outcome::Timeout);
    }

    #[tokio::test]
    async fn concurrent_identical_requests_dispatch_once() {
        let provider = FakeProvider::replying(VALID).with_delay(Duration::from_millis(100));
        let h = harness(vec![("alpha", 1, provider.clone())], policy(10, 15)).await;
        let request = AnalysisRequest::new("w1", Depth::Quick, ContextMode::Neutral);

        let mut joins = Vec::new();
        for _ in 0..12 {
            let coordinator = h.coordinator.clone();
            let request = request.clone();
            joins.push(tokio::spawn(async move { coordinator.analyze(&request).await }));
        }

        let mut results = Vec::new();
        for join in joins {
            results.push(join.await.unwrap());
        }

        assert_eq!(provider.call_count(), 1);
        assert_eq!(provider.probe_count(), 1);
        assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(h.metrics.briefings.with_label_values(&["quick", "ai"]).get(), 1);
    }

    struct DownStore;

    #[async_trait::async_trait]
    impl CacheStore for DownStore {
        async fn get(&self, _key: &str) -> Result<Option<CacheEntry>, StoreError> {
            Err(StoreError::new("connection refused"))
        }
        async fn set(&self, _entry: CacheEntry) -> Result<(), StoreError> {
            Err(StoreError::new("connection refused"))
        }
        async fn delete_pattern(&self, _pattern: &str) -> Result<usize, StoreError> {
            Err(StoreError::new("connection refused"))
        }
        async fn memory_usage(&self) -> Result<u64, StoreError> {
            Err(StoreError::new("connection refused"))
        }
    }

    #[tokio::test]
    async fn unavailable_cache_still_answers() {
        let metrics = Metrics::new().unwrap();
        let provider = FakeProvider::replying(VALID);
        let registry = ModelRegistry::new(Duration::from_secs(300));
        registry
            .register(
                ModelDescriptor::new("alpha", "https://example.invalid", Some("key".into()), 1),
                Arc::new(provider.clone()),
            )
            .await
            .unwrap();
        let coordinator = Coordinator::new(
            registry,
            BriefingCache::new(Arc::new(DownStore), metrics.clone()),
            Arc::new(MemorySignalStore::new()),
            metrics.clone(),
            policy(10, 15),
            MergeConfig::default(),
        );
        let request = AnalysisRequest::new("w1", Depth::Quick, ContextMode::Neutral);

        let first = coordinator.analyze(&request).await;
        let second = coordinator.analyze(&request).await;
        assert!(first.ai_powered && second.ai_powered);
        assert_eq!(provider.call_count(), 2);
        assert!(metrics.cache_degraded.get() >= 2);
    }

    #[tokio::test]
    async fn auth_failure_during_dispatch_cools_model_down() {
        let h = harness(
            vec![
                ("alpha", 1, FakeProvider::failing(ProviderError::Auth("revoked".into()))),
                ("beta", 2, FakeProvider::replying(OTHER)),
            ],
            policy(10, 15),
        )
        .await;

        let first = h
            .coordinator
            .analyze(&AnalysisRequest::new("w1", Depth::Quick, ContextMode::Neutral))
            .await;
        // alpha was chosen for quick and failed: fallback this time.
        assert!(first.fallback_mode);

        let second = h
            .coordinator
            .analyze(&AnalysisRequest::new("w2", Depth::Quick, ContextMode::Neutral))
            .await;
        assert_eq!(second.models_consulted, vec!["beta"]);
        let alpha = h
            .registry
            .descriptors()
            .await
            .into_iter()
            .find(|d| d.name == "alpha")
            .unwrap();
        assert!(alpha.cooldown_until.is_some());
    }
}
