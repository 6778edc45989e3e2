//! Per-subscriber intelligence feed.
//!
//! Each subscriber gets its own poller task bound to a ward. Every interval it
//! reads alerts and posts newer than its checkpoint, emits them oldest first,
//! advances the checkpoint and sends a heartbeat. The poller stops when the
//! receiver is dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use tokio::sync::mpsc;

use crate::error::SignalError;
use crate::model::{PriorityFilter, StreamEvent, StreamEventKind};
use crate::signals::SignalStore;

const CHANNEL_CAPACITY: usize = 64;
const DEFAULT_LOOKBACK_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    pub interval: Duration,
    /// Base delay after a failed iteration, multiplied by the error streak.
    pub error_backoff: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            error_backoff: Duration::from_secs(5),
        }
    }
}

pub struct IntelligenceStream {
    store: Arc<dyn SignalStore>,
    ward: String,
    since: DateTime<Utc>,
    priority: PriorityFilter,
    config: StreamConfig,
}

impl IntelligenceStream {
    /// Without `since` the feed starts one hour back.
    pub fn new(
        store: Arc<dyn SignalStore>,
        ward: impl Into<String>,
        since: Option<DateTime<Utc>>,
        priority: PriorityFilter,
        config: StreamConfig,
    ) -> Self {
        Self {
            store,
            ward: ward.into(),
            since: since.unwrap_or_else(|| Utc::now() - ChronoDuration::minutes(DEFAULT_LOOKBACK_MINUTES)),
            priority,
            config,
        }
    }

    /// Start polling in the background and return the event receiver.
    pub fn spawn(self) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(self.run(tx));
        rx
    }

    pub(crate) async fn run(self, tx: mpsc::Sender<StreamEvent>) {
        let ward = self.ward.clone();

        match self.store.ward_exists(&ward).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(%ward, "stream rejected: unknown ward");
                let _ = tx
                    .send(StreamEvent::error(StreamEventKind::FatalError, &ward, format!("unknown ward {ward}")))
                    .await;
                return;
            }
            Err(error) => {
                tracing::warn!(%ward, %error, "stream setup failed");
                let _ = tx
                    .send(StreamEvent::error(StreamEventKind::FatalError, &ward, error.to_string()))
                    .await;
                return;
            }
        }

        let connected = StreamEvent::data(
            StreamEventKind::Connection,
            &ward,
            json!({
                "since": self.since,
                "priority": self.priority.as_str(),
                "interval_seconds": self.config.interval.as_secs(),
            }),
        );
        if tx.send(connected).await.is_err() {
            return;
        }
        tracing::debug!(%ward, priority = self.priority.as_str(), "stream connected");

        let mut checkpoint = self.since;
        let mut errors: u32 = 0;

        loop {
            let wait = match self.poll(&tx, &mut checkpoint).await {
                Ok(true) => {
                    errors = 0;
                    self.config.interval
                }
                Ok(false) => break,
                Err(error) => {
                    errors = errors.saturating_add(1);
                    tracing::warn!(%ward, %error, errors, "stream iteration failed");
                    let event = StreamEvent::error(StreamEventKind::Error, &ward, error.to_string());
                    if tx.send(event).await.is_err() {
                        break;
                    }
                    self.backoff(errors)
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = tx.closed() => break,
            }
        }

        tracing::debug!(%ward, "stream closed");
    }

    /// One iteration. `Ok(false)` means the subscriber has gone.
    async fn poll(
        &self,
        tx: &mpsc::Sender<StreamEvent>,
        checkpoint: &mut DateTime<Utc>,
    ) -> Result<bool, SignalError> {
        let alerts = self
            .store
            .alerts_since(&self.ward, Some(*checkpoint), self.priority)
            .await?;
        let posts = self.store.posts_since(&self.ward, Some(*checkpoint)).await?;
        let (alert_count, post_count) = (alerts.len(), posts.len());

        // Alerts before posts on equal timestamps.
        let mut pending: Vec<(DateTime<Utc>, u8, StreamEvent)> = Vec::with_capacity(alert_count + post_count);
        for alert in alerts {
            let at = alert.created_at;
            pending.push((at, 0, event_for(StreamEventKind::Alert, &self.ward, &alert)));
        }
        for post in posts {
            let at = post.created_at;
            pending.push((at, 1, event_for(StreamEventKind::Intelligence, &self.ward, &post)));
        }
        pending.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        for (at, _, event) in pending {
            if tx.send(event).await.is_err() {
                return Ok(false);
            }
            if at > *checkpoint {
                *checkpoint = at;
            }
        }

        let heartbeat = StreamEvent::data(
            StreamEventKind::Heartbeat,
            &self.ward,
            json!({
                "checkpoint": *checkpoint,
                "alerts": alert_count,
                "posts": post_count,
            }),
        );
        Ok(tx.send(heartbeat).await.is_ok())
    }

    fn backoff(&self, errors: u32) -> Duration {
        self.config
            .error_backoff
            .saturating_mul(errors)
            .min(self.config.interval)
    }
}

fn event_for<T: serde::Serialize>(kind: StreamEventKind, ward: &str, item: &T) -> StreamEvent {
    match serde_json::to_value(item) {
        Ok(value) => StreamEvent::data(kind, ward, value),
        Err(error) => StreamEvent::error(StreamEventKind::Error, ward, error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Alert, Post, Severity};
    use crate::signals::MockSignalStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn base() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn alert(id: &str, offset: i64) -> Alert {
        Alert {
            id: id.to_string(),
            ward: "w1".to_string(),
            severity: Severity::High,
            title: id.to_string(),
            description: None,
            created_at: base() + ChronoDuration::seconds(offset),
        }
    }

    fn post(id: &str, offset: i64) -> Post {
        Post {
            id: id.to_string(),
            ward: "w1".to_string(),
            text: id.to_string(),
            author: None,
            sentiment: None,
            topics: vec![],
            created_at: base() + ChronoDuration::seconds(offset),
        }
    }

    fn config() -> StreamConfig {
        StreamConfig {
            interval: Duration::from_secs(30),
            error_backoff: Duration::from_secs(5),
        }
    }

    /// A mock that serves fixed alerts and posts, honouring `since`.
    fn serving(alerts: Vec<Alert>, posts: Vec<Post>) -> MockSignalStore {
        let mut store = MockSignalStore::new();
        store.expect_ward_exists().returning(|_| Ok(true));
        store.expect_alerts_since().returning(move |_, since, priority| {
            Ok(alerts
                .iter()
                .filter(|a| priority.admits(a.severity) && since.map_or(true, |s| a.created_at > s))
                .cloned()
                .collect())
        });
        store.expect_posts_since().returning(move |_, since| {
            Ok(posts
                .iter()
                .filter(|p| since.map_or(true, |s| p.created_at > s))
                .cloned()
                .collect())
        });
        store
    }

    fn id_of(event: &StreamEvent) -> String {
        event.data.as_ref().unwrap()["id"].as_str().unwrap().to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn events_arrive_in_time_order_then_heartbeat() {
        let store = serving(
            vec![alert("a2", 2), alert("a5", 5)],
            vec![post("p1", 1), post("p2", 2)],
        );
        let stream = IntelligenceStream::new(Arc::new(store), "w1", Some(base()), PriorityFilter::All, config());
        let mut rx = stream.spawn();

        assert_eq!(rx.recv().await.unwrap().kind, StreamEventKind::Connection);
        let mut order = Vec::new();
        for _ in 0..4 {
            let event = rx.recv().await.unwrap();
            order.push((event.kind, id_of(&event)));
        }
        assert_eq!(
            order,
            vec![
                (StreamEventKind::Intelligence, "p1".to_string()),
                (StreamEventKind::Alert, "a2".to_string()),
                (StreamEventKind::Intelligence, "p2".to_string()),
                (StreamEventKind::Alert, "a5".to_string()),
            ]
        );

        let heartbeat = rx.recv().await.unwrap();
        assert_eq!(heartbeat.kind, StreamEventKind::Heartbeat);
        assert_eq!(heartbeat.data.as_ref().unwrap()["alerts"], 2);

        // Checkpoint advanced: the next iteration re-emits nothing.
        let next = rx.recv().await.unwrap();
        assert_eq!(next.kind, StreamEventKind::Heartbeat);
        assert_eq!(next.data.as_ref().unwrap()["posts"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn priority_filter_reaches_the_store() {
        let mut low = alert("low", 1);
        low.severity = Severity::Low;
        let store = serving(vec![low, alert("high", 2)], vec![]);
        let stream = IntelligenceStream::new(Arc::new(store), "w1", Some(base()), PriorityFilter::High, config());
        let mut rx = stream.spawn();

        rx.recv().await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(id_of(&event), "high");
        assert_eq!(rx.recv().await.unwrap().kind, StreamEventKind::Heartbeat);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_ward_is_fatal() {
        let mut store = MockSignalStore::new();
        store.expect_ward_exists().returning(|_| Ok(false));
        store.expect_alerts_since().never();

        let stream = IntelligenceStream::new(Arc::new(store), "nowhere", None, PriorityFilter::All, config());
        let mut rx = stream.spawn();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, StreamEventKind::FatalError);
        assert!(event.error.unwrap().contains("nowhere"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn setup_store_failure_is_fatal() {
        let mut store = MockSignalStore::new();
        store
            .expect_ward_exists()
            .returning(|_| Err(SignalError::Unavailable("connection refused".into())));

        let mut rx = IntelligenceStream::new(Arc::new(store), "w1", None, PriorityFilter::All, config()).spawn();
        assert_eq!(rx.recv().await.unwrap().kind, StreamEventKind::FatalError);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn iteration_errors_back_off_and_recover() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut store = MockSignalStore::new();
        store.expect_ward_exists().returning(|_| Ok(true));
        let counter = Arc::clone(&calls);
        store.expect_alerts_since().returning(move |_, _, _| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SignalError::Unavailable("timeout".into()))
            } else {
                Ok(vec![])
            }
        });
        store.expect_posts_since().returning(|_, _| Ok(vec![]));

        let mut rx = IntelligenceStream::new(Arc::new(store), "w1", None, PriorityFilter::All, config()).spawn();
        assert_eq!(rx.recv().await.unwrap().kind, StreamEventKind::Connection);

        let started = tokio::time::Instant::now();
        assert_eq!(rx.recv().await.unwrap().kind, StreamEventKind::Error);
        assert_eq!(rx.recv().await.unwrap().kind, StreamEventKind::Error);
        assert_eq!(rx.recv().await.unwrap().kind, StreamEventKind::Heartbeat);
        // 5s after the first error, 10s after the second.
        assert_eq!(started.elapsed(), Duration::from_secs(15));
    }

    #[test]
    fn backoff_is_capped_by_interval() {
        let stream = IntelligenceStream::new(
            Arc::new(MockSignalStore::new()),
            "w1",
            None,
            PriorityFilter::All,
            StreamConfig {
                interval: Duration::from_secs(12),
                error_backoff: Duration::from_secs(5),
            },
        );
        assert_eq!(stream.backoff(1), Duration::from_secs(5));
        assert_eq!(stream.backoff(2), Duration::from_secs(10));
        assert_eq!(stream.backoff(3), Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn poller_stops_when_subscriber_leaves() {
        let store = serving(vec![], vec![]);
        let stream = IntelligenceStream::new(Arc::new(store), "w1", None, PriorityFilter::All, config());
        let (tx, mut rx) = mpsc::channel(4);
        let handle = tokio::spawn(stream.run(tx));

        assert_eq!(rx.recv().await.unwrap().kind, StreamEventKind::Connection);
        drop(rx);
        let joined = tokio_test::assert_ok!(tokio::time::timeout(Duration::from_secs(60), handle).await);
        assert!(joined.is_ok());
    }
}
