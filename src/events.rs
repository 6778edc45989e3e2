// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Event bus integration for data-driven cache invalidation.
//!
//! Listens on a Redis Pub/Sub channel fed by the ingestion side:
//! - POSTS_INGESTED: new posts landed for a ward
//! - ALERT_RAISED: a new alert was raised for a ward
//! - INVALIDATE_ALL: drop every cached briefing

use futures_util::stream::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::cache::BriefingCache;
use crate::error::AppError;

/// Events published by the ingestion pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategistEvent {
    PostsIngested { ward: String },
    AlertRaised { ward: String },
    InvalidateAll,
}

#[derive(Clone)]
pub struct EventBusConfig {
    pub redis_url: String,
    pub channel: String,
}

/// Background subscriber that invalidates briefings when ward data changes.
pub struct EventBus {
    config: EventBusConfig,
    cache: BriefingCache,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl EventBus {
    pub fn new(config: EventBusConfig, cache: BriefingCache) -> Self {
        Self {
            config,
            cache,
            shutdown_tx: None,
        }
    }

    /// Start listening for events
    pub async fn start(&mut self) -> Result<(), AppError> {
        let client = redis::Client::open(self.config.redis_url.as_str())
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to create Redis client: {}", e)))?;

        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to connect to Redis: {}", e)))?;

        pubsub
            .subscribe(&self.config.channel)
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to subscribe: {}", e)))?;

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        let cache = self.cache.clone();
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            loop {
                tokio::select! {
                    msg = messages.next() => {
                        let Some(msg) = msg else {
                            tracing::warn!("Event bus connection closed");
                            break;
                        };
                        let payload: String = match msg.get_payload() {
                            Ok(payload) => payload,
                            Err(e) => {
                                tracing::error!(error = %e, "Failed to read event payload");
                                continue;
                            }
                        };
                        if let Err(e) = handle_event(&payload, &cache).await {
                            tracing::error!(error = %e, payload, "Failed to handle event");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Event bus shutting down");
                        break;
                    }
                }
            }
        });

        tracing::info!(channel = %self.config.channel, "Event bus started");
        Ok(())
    }

    /// Stop the event bus
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
    }
}

/// Apply one event to the cache. Returns how many briefings were purged.
pub async fn handle_event(payload: &str, cache: &BriefingCache) -> Result<usize, AppError> {
    let event: StrategistEvent = serde_json::from_str(payload)
        .map_err(|e| AppError::bad_request(format!("Failed to parse event: {}", e)))?;

    let purged = match &event {
        StrategistEvent::PostsIngested { ward } | StrategistEvent::AlertRaised { ward } => {
            cache.invalidate_pattern(&BriefingCache::ward_pattern(ward)).await
        }
        StrategistEvent::InvalidateAll => cache.invalidate_pattern("ward:*").await,
    };

    tracing::info!(?event, purged, "Handled invalidation event");
    Ok(purged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::model::{AnalysisRequest, ContextMode, Depth};
    use crate::state::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    async fn seeded_cache() -> BriefingCache {
        let cache = BriefingCache::new(Arc::new(MemoryStore::new()), Metrics::new().unwrap());
        for ward in ["w1", "w2"] {
            for depth in [Depth::Quick, Depth::Deep] {
                let key = BriefingCache::key_for(&AnalysisRequest::new(ward, depth, ContextMode::Neutral));
                cache.set(&key, "{}".to_string(), Duration::from_secs(60)).await;
            }
        }
        cache
    }

    #[test]
    fn events_use_screaming_snake_tags() {
        let event: StrategistEvent =
            serde_json::from_str(r#"{"type":"POSTS_INGESTED","ward":"w1"}"#).unwrap();
        assert_eq!(event, StrategistEvent::PostsIngested { ward: "w1".into() });
        assert_eq!(
            serde_json::to_string(&StrategistEvent::InvalidateAll).unwrap(),
            r#"{"type":"INVALIDATE_ALL"}"#
        );
    }

    #[tokio::test]
    async fn ward_events_purge_only_that_ward() {
        let cache = seeded_cache().await;
        let purged = handle_event(r#"{"type":"ALERT_RAISED","ward":"w1"}"#, &cache)
            .await
            .unwrap();
        assert_eq!(purged, 2);
        assert_eq!(handle_event(r#"{"type":"INVALIDATE_ALL"}"#, &cache).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn malformed_events_are_rejected() {
        let cache = seeded_cache().await;
        assert!(handle_event(r#"{"type":"SOMETHING_ELSE"}"#, &cache).await.is_err());
        assert!(handle_event("not json", &cache).await.is_err());
    }
}
