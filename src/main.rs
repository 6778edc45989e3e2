use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use ward_strategist::api::{self, AppState};
use ward_strategist::cache::{BriefingCache, CacheStore, RedisStore};
use ward_strategist::config::AppConfig;
use ward_strategist::coordinator::Coordinator;
use ward_strategist::events::{EventBus, EventBusConfig};
use ward_strategist::merge::MergeConfig;
use ward_strategist::metrics::Metrics;
use ward_strategist::model::ModelDescriptor;
use ward_strategist::provider::HttpProvider;
use ward_strategist::registry::ModelRegistry;
use ward_strategist::signals::{HttpSignalStore, MemorySignalStore, SignalStore};
use ward_strategist::state::MemoryStore;
use ward_strategist::stream::StreamConfig;

const SIGNALS_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cfg = AppConfig::from_env()?;
    let metrics = Metrics::new()?;

    let store: Arc<dyn CacheStore> = match &cfg.redis_url {
        Some(url) => {
            let redis = RedisStore::new(url).context("invalid STRATEGIST_REDIS_URL")?;
            if let Err(error) = redis.ping().await {
                tracing::warn!(event = "cache_degraded", %error, "redis unreachable at startup; serving uncached");
            }
            Arc::new(redis)
        }
        None => {
            let memory = MemoryStore::new();
            spawn_janitor(memory.clone(), cfg.janitor_interval());
            tracing::info!("no redis configured; using in-memory briefing cache");
            Arc::new(memory)
        }
    };
    let cache = BriefingCache::new(store, metrics.clone());

    let registry = ModelRegistry::new(cfg.probe_window);
    let transport_timeout = cfg.depth_policy.deep.model_timeout;
    for provider in &cfg.providers {
        let client = HttpProvider::try_new(provider, transport_timeout)
            .with_context(|| format!("failed to build provider {}", provider.name))?;
        let descriptor = ModelDescriptor::new(
            provider.name.clone(),
            provider.endpoint.clone(),
            provider.api_key.clone(),
            provider.priority,
        );
        registry
            .register(descriptor, Arc::new(client))
            .await
            .with_context(|| format!("invalid provider {}", provider.name))?;
        tracing::info!(model = %provider.name, priority = provider.priority, "registered model");
    }
    if cfg.providers.is_empty() {
        tracing::warn!("no providers configured; every briefing will be a fallback");
    }

    let signals: Arc<dyn SignalStore> = match &cfg.signals_url {
        Some(url) => Arc::new(
            HttpSignalStore::try_new(url, SIGNALS_TIMEOUT).context("failed to build signals client")?,
        ),
        None => {
            tracing::warn!("STRATEGIST_SIGNALS_URL unset; streams and fallbacks see an empty store");
            Arc::new(MemorySignalStore::new())
        }
    };

    let coordinator = Coordinator::new(
        registry,
        cache.clone(),
        Arc::clone(&signals),
        metrics.clone(),
        cfg.depth_policy.clone(),
        MergeConfig {
            max_items: cfg.max_items,
            ..MergeConfig::default()
        },
    );

    let mut event_bus = match &cfg.redis_url {
        Some(url) => {
            let mut bus = EventBus::new(
                EventBusConfig {
                    redis_url: url.clone(),
                    channel: cfg.events_channel.clone(),
                },
                cache.clone(),
            );
            match bus.start().await {
                Ok(()) => Some(bus),
                Err(error) => {
                    tracing::warn!(%error, "event bus unavailable; relying on TTL expiry");
                    None
                }
            }
        }
        None => None,
    };

    let state = AppState {
        coordinator,
        cache,
        signals,
        metrics,
        stream_config: StreamConfig {
            interval: cfg.stream_interval,
            ..StreamConfig::default()
        },
    };

    let app = api::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listen_addr = cfg.listen_addr();
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;

    tracing::info!(%listen_addr, models = cfg.providers.len(), "starting ward strategist");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(bus) = event_bus.as_mut() {
        bus.stop().await;
    }

    tracing::info!("ward strategist exited cleanly");

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("STRATEGIST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn spawn_janitor(store: MemoryStore, interval: Duration) {
    if interval.is_zero() {
        tracing::warn!("janitor interval disabled; expired briefings will linger until read");
        return;
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let purged = store.purge_expired().await;
            if purged > 0 {
                let remaining = store.len().await;
                tracing::debug!(purged, remaining, "purged expired briefings");
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term_signal) => term_signal.recv().await,
            Err(error) => {
                tracing::warn!(%error, "failed to install SIGTERM handler");
                None
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
