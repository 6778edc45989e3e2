// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Read-only access to the posts/alerts store.
//!
//! The store itself belongs to the CRUD service; this module only queries it
//! by ward and timestamp. [`HttpSignalStore`] talks to that service over REST,
//! [`MemorySignalStore`] keeps everything in process for development.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;

use crate::error::SignalError;
use crate::model::{Alert, Post, PriorityFilter, WardSnapshot};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SignalStore: Send + Sync {
    async fn ward_exists(&self, ward: &str) -> Result<bool, SignalError>;

    /// Alerts strictly newer than `since`, oldest first.
    async fn alerts_since(
        &self,
        ward: &str,
        since: Option<DateTime<Utc>>,
        priority: PriorityFilter,
    ) -> Result<Vec<Alert>, SignalError>;

    /// Posts strictly newer than `since`, oldest first.
    async fn posts_since(
        &self,
        ward: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Post>, SignalError>;

    async fn ward_snapshot(&self, ward: &str) -> Result<WardSnapshot, SignalError>;
}

/// HTTP client for the posts/alerts service.
#[derive(Clone)]
pub struct HttpSignalStore {
    base_url: String,
    client: Client,
}

impl HttpSignalStore {
    pub fn try_new(base_url: &str, timeout: Duration) -> Result<Self, SignalError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SignalError::Unavailable(format!("failed to build client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>, SignalError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| SignalError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(SignalError::Unavailable(format!(
                "{path} returned unexpected status {status}"
            )));
        }

        response
            .json::<T>()
            .await
            .map(Some)
            .map_err(|e| SignalError::Malformed(e.to_string()))
    }
}

fn since_param(since: Option<DateTime<Utc>>) -> Option<(&'static str, String)> {
    since.map(|ts| ("since", ts.to_rfc3339_opts(SecondsFormat::Millis, true)))
}

#[async_trait]
impl SignalStore for HttpSignalStore {
    async fn ward_exists(&self, ward: &str) -> Result<bool, SignalError> {
        let snapshot: Option<WardSnapshot> = self
            .fetch("/wards/snapshot", &[("ward", ward.to_string())])
            .await?;
        Ok(snapshot.is_some())
    }

    async fn alerts_since(
        &self,
        ward: &str,
        since: Option<DateTime<Utc>>,
        priority: PriorityFilter,
    ) -> Result<Vec<Alert>, SignalError> {
        let mut query = vec![
            ("ward", ward.to_string()),
            ("priority", priority.as_str().to_string()),
        ];
        query.extend(since_param(since));

        let mut alerts: Vec<Alert> = self.fetch("/alerts", &query).await?.unwrap_or_default();
        // The service filters too; re-apply so the contract holds regardless.
        alerts.retain(|a| priority.admits(a.severity) && since.map(|s| a.created_at > s).unwrap_or(true));
        alerts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(alerts)
    }

    async fn posts_since(
        &self,
        ward: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Post>, SignalError> {
        let mut query = vec![("ward", ward.to_string())];
        query.extend(since_param(since));

        let mut posts: Vec<Post> = self.fetch("/posts", &query).await?.unwrap_or_default();
        posts.retain(|p| since.map(|s| p.created_at > s).unwrap_or(true));
        posts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(posts)
    }

    async fn ward_snapshot(&self, ward: &str) -> Result<WardSnapshot, SignalError> {
        self.fetch("/wards/snapshot", &[("ward", ward.to_string())])
            .await?
            .ok_or_else(|| SignalError::Unavailable(format!("unknown ward {ward}")))
    }
}

#[derive(Default)]
struct MemoryInner {
    wards: HashSet<String>,
    alerts: Vec<Alert>,
    posts: Vec<Post>,
}

/// In-process store for development and tests.
#[derive(Clone, Default)]
pub struct MemorySignalStore {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemorySignalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_ward(&self, ward: &str) {
        self.inner.write().await.wards.insert(ward.to_string());
    }

    pub async fn add_alert(&self, alert: Alert) {
        let mut inner = self.inner.write().await;
        inner.wards.insert(alert.ward.clone());
        inner.alerts.push(alert);
    }

    pub async fn add_post(&self, post: Post) {
        let mut inner = self.inner.write().await;
        inner.wards.insert(post.ward.clone());
        inner.posts.push(post);
    }
}

#[async_trait]
impl SignalStore for MemorySignalStore {
    async fn ward_exists(&self, ward: &str) -> Result<bool, SignalError> {
        Ok(self.inner.read().await.wards.contains(ward))
    }

    async fn alerts_since(
        &self,
        ward: &str,
        since: Option<DateTime<Utc>>,
        priority: PriorityFilter,
    ) -> Result<Vec<Alert>, SignalError> {
        let inner = self.inner.read().await;
        let mut alerts: Vec<Alert> = inner
            .alerts
            .iter()
            .filter(|a| a.ward == ward && priority.admits(a.severity))
            .filter(|a| since.map(|s| a.created_at > s).unwrap_or(true))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(alerts)
    }

    async fn posts_since(
        &self,
        ward: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Post>, SignalError> {
        let inner = self.inner.read().await;
        let mut posts: Vec<Post> = inner
            .posts
            .iter()
            .filter(|p| p.ward == ward)
            .filter(|p| since.map(|s| p.created_at > s).unwrap_or(true))
            .cloned()
            .collect();
        posts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(posts)
    }

    async fn ward_snapshot(&self, ward: &str) -> Result<WardSnapshot, SignalError> {
        let inner = self.inner.read().await;
        let mut sentiments: BTreeMap<String, u64> = BTreeMap::new();
        let mut topics: BTreeMap<String, u64> = BTreeMap::new();
        let mut post_count = 0;

        for post in inner.posts.iter().filter(|p| p.ward == ward) {
            post_count += 1;
            if let Some(sentiment) = &post.sentiment {
                *sentiments.entry(sentiment.to_lowercase()).or_default() += 1;
            }
            for topic in &post.topics {
                *topics.entry(topic.to_lowercase()).or_default() += 1;
            }
        }

        Ok(WardSnapshot {
            ward: ward.to_string(),
            post_count,
            sentiment_counts: sentiments.into_iter().collect(),
            topic_counts: topics.into_iter().collect(),
        })
    }
}
