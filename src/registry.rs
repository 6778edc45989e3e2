// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Model registry: configured AI backends, their availability and cooldowns.
//!
//! Availability probes are cached for a short window so they are not repeated
//! on every request. Auth failures and repeated rate limiting put a backend
//! into cooldown with exponential backoff; a success clears it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::{ConfigError, ProviderError};
use crate::model::{Depth, ModelDescriptor, Outcome};
use crate::provider::ModelProvider;

const BASE_COOLDOWN_SECS: i64 = 30;
const MAX_COOLDOWN_SECS: i64 = 30 * 60;
const RATE_LIMIT_STRIKES: u32 = 2;
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

struct Entry {
    descriptor: ModelDescriptor,
    provider: Arc<dyn ModelProvider>,
}

/// A backend selected for dispatch.
#[derive(Clone)]
pub struct ActiveModel {
    pub descriptor: ModelDescriptor,
    pub provider: Arc<dyn ModelProvider>,
}

#[derive(Clone)]
pub struct ModelRegistry {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    probe_window: ChronoDuration,
}

impl ModelRegistry {
    pub fn new(probe_window: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            probe_window: ChronoDuration::from_std(probe_window)
                .unwrap_or_else(|_| ChronoDuration::minutes(5)),
        }
    }

    /// Add or replace a backend.
    pub async fn register(
        &self,
        descriptor: ModelDescriptor,
        provider: Arc<dyn ModelProvider>,
    ) -> Result<(), ConfigError> {
        if descriptor.name.trim().is_empty() {
            return Err(ConfigError::MissingName);
        }
        if descriptor.endpoint.trim().is_empty() {
            return Err(ConfigError::EmptyEndpoint(descriptor.name));
        }
        if matches!(descriptor.credential.as_deref(), Some(c) if c.trim().is_empty()) {
            return Err(ConfigError::EmptyCredential(descriptor.name));
        }

        let mut entries = self.entries.write().await;
        tracing::info!(
            model = %descriptor.name,
            priority = descriptor.priority,
            credential = descriptor.has_credential(),
            "registered model"
        );
        entries.insert(
            descriptor.name.clone(),
            Entry {
                descriptor,
                provider,
            },
        );
        Ok(())
    }

    /// Snapshot of every registered descriptor, priority ordered.
    pub async fn descriptors(&self) -> Vec<ModelDescriptor> {
        let entries = self.entries.read().await;
        let mut descriptors: Vec<_> = entries.values().map(|e| e.descriptor.clone()).collect();
        descriptors.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        descriptors
    }

    /// Backends usable right now, priority ordered and capped by depth.
    /// An empty list means the caller must fall back.
    pub async fn active_models(&self, depth: Depth) -> Vec<ActiveModel> {
        self.active_models_by(depth, Instant::now() + PROBE_TIMEOUT).await
    }

    /// Like [`active_models`](Self::active_models), but stale probes run
    /// concurrently and must finish before `deadline`. A probe still running
    /// at the deadline leaves its backend out of this selection unrecorded.
    pub async fn active_models_by(&self, depth: Depth, deadline: Instant) -> Vec<ActiveModel> {
        self.select(depth, Utc::now(), deadline).await
    }

    pub(crate) async fn active_models_at(&self, depth: Depth, now: DateTime<Utc>) -> Vec<ActiveModel> {
        self.select(depth, now, Instant::now() + PROBE_TIMEOUT).await
    }

    async fn select(&self, depth: Depth, now: DateTime<Utc>, deadline: Instant) -> Vec<ActiveModel> {
        let mut candidates: Vec<(ActiveModel, Option<bool>)> = {
            let entries = self.entries.read().await;
            entries
                .values()
                .filter(|e| e.descriptor.has_credential() && !e.descriptor.in_cooldown(now))
                .map(|e| {
                    let known = self
                        .probe_is_fresh(&e.descriptor, now)
                        .then(|| e.descriptor.available.unwrap_or(false));
                    (
                        ActiveModel {
                            descriptor: e.descriptor.clone(),
                            provider: Arc::clone(&e.provider),
                        },
                        known,
                    )
                })
                .collect()
        };
        candidates.sort_by(|(a, _), (b, _)| {
            a.descriptor
                .priority
                .cmp(&b.descriptor.priority)
                .then_with(|| a.descriptor.name.cmp(&b.descriptor.name))
        });

        let mut probes: FuturesUnordered<_> = candidates
            .iter()
            .enumerate()
            .filter(|(_, (_, known))| known.is_none())
            .map(|(slot, (candidate, _))| {
                let provider = Arc::clone(&candidate.provider);
                async move {
                    let result = match tokio::time::timeout(PROBE_TIMEOUT, provider.probe()).await {
                        Ok(result) => result,
                        Err(_) => Err(ProviderError::Timeout),
                    };
                    (slot, result)
                }
            })
            .collect();

        while !probes.is_empty() {
            match tokio::time::timeout_at(deadline, probes.next()).await {
                Ok(Some((slot, result))) => {
                    let name = candidates[slot].0.descriptor.name.clone();
                    self.record_probe(&name, &result, now).await;
                    candidates[slot].1 = Some(result.is_ok());
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        outstanding = probes.len(),
                        "request deadline elapsed during availability probes"
                    );
                    break;
                }
            }
        }

        let limit = depth.fan_out().unwrap_or(usize::MAX);
        candidates
            .into_iter()
            .filter(|(_, available)| available.unwrap_or(false))
            .map(|(candidate, _)| candidate)
            .take(limit)
            .collect()
    }

    /// Record a failed call. Auth failures and repeated rate limiting trigger cooldown.
    pub async fn mark_failure(&self, name: &str, outcome: Outcome) {
        self.mark_failure_at(name, outcome, Utc::now()).await;
    }

    pub(crate) async fn mark_failure_at(&self, name: &str, outcome: Outcome, now: DateTime<Utc>) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(name) {
            apply_failure(&mut entry.descriptor, outcome, now);
        }
    }

    /// Record a successful call, clearing any backoff.
    pub async fn mark_success(&self, name: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(name) {
            reset(&mut entry.descriptor);
        }
    }

    fn probe_is_fresh(&self, descriptor: &ModelDescriptor, now: DateTime<Utc>) -> bool {
        let Some(probed) = descriptor.last_probe_at else {
            return false;
        };
        // An expired cooldown invalidates the probe that caused it.
        if descriptor.cooldown_until.map(|until| probed < until).unwrap_or(false) {
            return false;
        }
        now - probed < self.probe_window
    }

    async fn record_probe(&self, name: &str, result: &Result<(), ProviderError>, now: DateTime<Utc>) {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(name) else {
            return;
        };

        entry.descriptor.last_probe_at = Some(now);
        match result {
            Ok(()) => {
                entry.descriptor.available = Some(true);
                reset(&mut entry.descriptor);
            }
            Err(error) => {
                tracing::warn!(model = %name, %error, "availability probe failed");
                entry.descriptor.available = Some(false);
                apply_failure(&mut entry.descriptor, error.outcome(), now);
            }
        }
    }
}

fn apply_failure(descriptor: &mut ModelDescriptor, outcome: Outcome, now: DateTime<Utc>) {
    match outcome {
        Outcome::AuthError | Outcome::RateLimited => {
            descriptor.consecutive_failures = descriptor.consecutive_failures.saturating_add(1);
        }
        Outcome::Success => {
            reset(descriptor);
            return;
        }
        _ => return,
    }

    let triggers = outcome == Outcome::AuthError
        || descriptor.consecutive_failures >= RATE_LIMIT_STRIKES;
    if !triggers {
        return;
    }

    descriptor.cooldowns = descriptor.cooldowns.saturating_add(1);
    let backoff = cooldown_for(descriptor.cooldowns);
    descriptor.cooldown_until = Some(now + backoff);
    tracing::warn!(
        model = %descriptor.name,
        outcome = outcome.as_str(),
        failures = descriptor.consecutive_failures,
        cooldowns = descriptor.cooldowns,
        cooldown_secs = backoff.num_seconds(),
        "model placed in cooldown"
    );
}

fn reset(descriptor: &mut ModelDescriptor) {
    descriptor.consecutive_failures = 0;
    descriptor.cooldowns = 0;
    descriptor.cooldown_until = None;
}

/// Length of the `nth` consecutive cooldown: 30s, 60s, 120s, ... capped at 30 minutes.
pub fn cooldown_for(nth: u32) -> ChronoDuration {
    let exponent = nth.saturating_sub(1).min(16);
    let secs = BASE_COOLDOWN_SECS
        .saturating_mul(1i64 << exponent)
        .min(MAX_COOLDOWN_SECS);
    ChronoDuration::seconds(secs)
}
