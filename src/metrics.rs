// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Prometheus metrics collection for the strategist.
//!
//! Tracks cache effectiveness, model dispatch outcomes and stream subscribers.
//! All counters are process-local and reset on restart.

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::Arc;

use crate::error::AppError;

/// Metrics collector for the strategist
#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,

    // Cache metrics
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    pub cache_stores: IntCounter,
    pub cache_invalidations: IntCounter,
    pub cache_degraded: IntCounter,
    pub cache_memory_bytes: IntGauge,
    pub coalesced_waiters: IntCounter,

    // Dispatch metrics
    pub model_dispatches: IntCounterVec,
    pub model_latency: HistogramVec,
    pub briefings: IntCounterVec,
    pub briefing_duration: Histogram,

    // Stream metrics
    pub stream_subscribers: IntGauge,
}

fn metric_error(e: prometheus::Error) -> AppError {
    AppError::Internal(anyhow::anyhow!("Failed to create metric: {}", e))
}

impl Metrics {
    pub fn new() -> Result<Self, AppError> {
        let registry = Registry::new();

        let cache_hits = IntCounter::with_opts(Opts::new(
            "strategist_cache_hits_total",
            "Total number of briefing cache hits",
        ))
        .map_err(metric_error)?;

        let cache_misses = IntCounter::with_opts(Opts::new(
            "strategist_cache_misses_total",
            "Total number of briefing cache misses",
        ))
        .map_err(metric_error)?;

        let cache_stores = IntCounter::with_opts(Opts::new(
            "strategist_cache_stores_total",
            "Total number of briefings written to the cache",
        ))
        .map_err(metric_error)?;

        let cache_invalidations = IntCounter::with_opts(Opts::new(
            "strategist_cache_invalidations_total",
            "Total number of cache entries removed by pattern invalidation",
        ))
        .map_err(metric_error)?;

        let cache_degraded = IntCounter::with_opts(Opts::new(
            "strategist_cache_degraded_total",
            "Total number of cache operations that failed and degraded to pass-through",
        ))
        .map_err(metric_error)?;

        let cache_memory_bytes = IntGauge::with_opts(Opts::new(
            "strategist_cache_memory_bytes",
            "Approximate memory used by the briefing cache",
        ))
        .map_err(metric_error)?;

        let coalesced_waiters = IntCounter::with_opts(Opts::new(
            "strategist_coalesced_waiters_total",
            "Requests that joined an in-flight computation instead of dispatching",
        ))
        .map_err(metric_error)?;

        let model_dispatches = IntCounterVec::new(
            Opts::new(
                "strategist_model_dispatches_total",
                "Model calls by model and outcome",
            ),
            &["model", "outcome"],
        )
        .map_err(metric_error)?;

        let model_latency = HistogramVec::new(
            HistogramOpts::new(
                "strategist_model_latency_seconds",
                "Latency of individual model calls in seconds",
            )
            .buckets(vec![0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 45.0]),
            &["model"],
        )
        .map_err(metric_error)?;

        let briefings = IntCounterVec::new(
            Opts::new(
                "strategist_briefings_total",
                "Computed briefings by depth and mode (ai or fallback)",
            ),
            &["depth", "mode"],
        )
        .map_err(metric_error)?;

        let briefing_duration = Histogram::with_opts(
            HistogramOpts::new(
                "strategist_briefing_duration_seconds",
                "End-to-end duration of briefing computations in seconds",
            )
            .buckets(vec![0.01, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 45.0]),
        )
        .map_err(metric_error)?;

        let stream_subscribers = IntGauge::with_opts(Opts::new(
            "strategist_stream_subscribers",
            "Currently connected intelligence stream subscribers",
        ))
        .map_err(metric_error)?;

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(cache_hits.clone()),
            Box::new(cache_misses.clone()),
            Box::new(cache_stores.clone()),
            Box::new(cache_invalidations.clone()),
            Box::new(cache_degraded.clone()),
            Box::new(cache_memory_bytes.clone()),
            Box::new(coalesced_waiters.clone()),
            Box::new(model_dispatches.clone()),
            Box::new(model_latency.clone()),
            Box::new(briefings.clone()),
            Box::new(briefing_duration.clone()),
            Box::new(stream_subscribers.clone()),
        ];
        for collector in collectors {
            registry.register(collector).map_err(|e| {
                AppError::Internal(anyhow::anyhow!("Failed to register metric: {}", e))
            })?;
        }

        Ok(Self {
            registry: Arc::new(registry),
            cache_hits,
            cache_misses,
            cache_stores,
            cache_invalidations,
            cache_degraded,
            cache_memory_bytes,
            coalesced_waiters,
            model_dispatches,
            model_latency,
            briefings,
            briefing_duration,
            stream_subscribers,
        })
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.inc();
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.inc();
    }

    pub fn record_cache_store(&self) {
        self.cache_stores.inc();
    }

    pub fn record_invalidation(&self, count: usize) {
        self.cache_invalidations.inc_by(count as u64);
    }

    pub fn record_cache_degraded(&self) {
        self.cache_degraded.inc();
    }

    pub fn update_cache_memory(&self, bytes: u64) {
        self.cache_memory_bytes.set(bytes.min(i64::MAX as u64) as i64);
    }

    pub fn record_coalesced(&self) {
        self.coalesced_waiters.inc();
    }

    /// Record one model call with its outcome label and latency.
    pub fn record_dispatch(&self, model: &str, outcome: &str, seconds: f64) {
        self.model_dispatches.with_label_values(&[model, outcome]).inc();
        self.model_latency.with_label_values(&[model]).observe(seconds);
    }

    pub fn record_briefing(&self, depth: &str, fallback: bool, seconds: f64) {
        let mode = if fallback { "fallback" } else { "ai" };
        self.briefings.with_label_values(&[depth, mode]).inc();
        self.briefing_duration.observe(seconds);
    }

    pub fn stream_opened(&self) {
        self.stream_subscribers.inc();
    }

    pub fn stream_closed(&self) {
        self.stream_subscribers.dec();
    }

    /// Export metrics in Prometheus format
    pub fn export(&self) -> Result<String, AppError> {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode metrics: {}", e)))?;

        String::from_utf8(buffer).map_err(|e| {
            AppError::Internal(anyhow::anyhow!(
                "Failed to convert metrics to string: {}",
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_includes_labelled_dispatches() {
        let metrics = Metrics::new().unwrap();
        metrics.record_dispatch("gpt", "timeout", 1.5);
        metrics.record_cache_hit();

        let text = metrics.export().unwrap();
        assert!(text.contains("strategist_model_dispatches_total{model=\"gpt\",outcome=\"timeout\"} 1"));
        assert!(text.contains("strategist_cache_hits_total 1"));
    }
}
