use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::model::Depth;

/// Timeouts and TTL for one depth tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPolicy {
    pub cache_ttl: Duration,
    pub model_timeout: Duration,
    pub deadline: Duration,
}

#[derive(Debug, Clone)]
pub struct DepthPolicy {
    pub quick: TierPolicy,
    pub standard: TierPolicy,
    pub deep: TierPolicy,
}

impl DepthPolicy {
    pub fn tier(&self, depth: Depth) -> TierPolicy {
        match depth {
            Depth::Quick => self.quick,
            Depth::Standard => self.standard,
            Depth::Deep => self.deep,
        }
    }
}

impl Default for DepthPolicy {
    fn default() -> Self {
        Self {
            quick: TierPolicy {
                cache_ttl: Duration::from_secs(300),
                model_timeout: Duration::from_secs(10),
                deadline: Duration::from_secs(15),
            },
            standard: TierPolicy {
                cache_ttl: Duration::from_secs(900),
                model_timeout: Duration::from_secs(20),
                deadline: Duration::from_secs(30),
            },
            deep: TierPolicy {
                cache_ttl: Duration::from_secs(3600),
                model_timeout: Duration::from_secs(35),
                deadline: Duration::from_secs(45),
            },
        }
    }
}

/// One configured AI backend.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub priority: u32,
}

pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub redis_url: Option<String>,
    pub events_channel: String,
    pub signals_url: Option<String>,
    pub depth_policy: DepthPolicy,
    pub max_items: usize,
    pub probe_window: Duration,
    pub stream_interval: Duration,
    pub janitor_interval: Duration,
    pub providers: Vec<ProviderConfig>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let listen_addr: SocketAddr = env::var("STRATEGIST_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .context("invalid STRATEGIST_ADDR")?;

        let defaults = DepthPolicy::default();
        let depth_policy = DepthPolicy {
            quick: parse_tier("QUICK", defaults.quick)?,
            standard: parse_tier("STANDARD", defaults.standard)?,
            deep: parse_tier("DEEP", defaults.deep)?,
        };

        let max_items: usize = env::var("STRATEGIST_MAX_ITEMS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .context("STRATEGIST_MAX_ITEMS must be a positive integer")?;

        Ok(Self {
            listen_addr,
            redis_url: non_empty_var("STRATEGIST_REDIS_URL"),
            events_channel: env::var("STRATEGIST_EVENTS_CHANNEL")
                .unwrap_or_else(|_| "strategist:events".to_string()),
            signals_url: non_empty_var("STRATEGIST_SIGNALS_URL"),
            depth_policy,
            max_items: max_items.max(1),
            probe_window: parse_duration("STRATEGIST_PROBE_WINDOW", 300)?,
            stream_interval: parse_duration("STRATEGIST_STREAM_INTERVAL", 30)?,
            janitor_interval: parse_duration("STRATEGIST_JANITOR_SECONDS", 30)?,
            providers: parse_providers()?,
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn janitor_interval(&self) -> Duration {
        self.janitor_interval
    }
}

fn parse_tier(tier: &str, defaults: TierPolicy) -> Result<TierPolicy> {
    Ok(TierPolicy {
        cache_ttl: parse_duration(
            &format!("STRATEGIST_{tier}_TTL"),
            defaults.cache_ttl.as_secs(),
        )?,
        model_timeout: parse_duration(
            &format!("STRATEGIST_{tier}_MODEL_TIMEOUT"),
            defaults.model_timeout.as_secs(),
        )?,
        deadline: parse_duration(
            &format!("STRATEGIST_{tier}_DEADLINE"),
            defaults.deadline.as_secs(),
        )?,
    })
}

fn parse_providers() -> Result<Vec<ProviderConfig>> {
    let Some(names) = non_empty_var("STRATEGIST_PROVIDERS") else {
        return Ok(Vec::new());
    };

    names
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .enumerate()
        .map(|(index, name)| {
            let prefix = format!("STRATEGIST_PROVIDER_{}", name.to_ascii_uppercase());
            let endpoint = env::var(format!("{prefix}_ENDPOINT"))
                .with_context(|| format!("{prefix}_ENDPOINT is required"))?;
            let priority = match env::var(format!("{prefix}_PRIORITY")) {
                Ok(raw) => raw
                    .parse()
                    .with_context(|| format!("{prefix}_PRIORITY must be an integer"))?,
                Err(_) => index as u32,
            };

            Ok(ProviderConfig {
                name: name.to_string(),
                endpoint,
                // Present-but-empty is kept so registration can reject it.
                api_key: env::var(format!("{prefix}_API_KEY")).ok(),
                model: env::var(format!("{prefix}_MODEL")).unwrap_or_else(|_| name.to_string()),
                priority,
            })
        })
        .collect()
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_duration(env_key: &str, default_secs: u64) -> Result<Duration> {
    let raw = env::var(env_key).unwrap_or_else(|_| default_secs.to_string());
    let secs: u64 = raw
        .parse()
        .with_context(|| format!("{env_key} must be an integer number of seconds"))?;

    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tiers_scale_with_depth() {
        let policy = DepthPolicy::default();
        let quick = policy.tier(Depth::Quick);
        let deep = policy.tier(Depth::Deep);
        assert!(quick.cache_ttl < deep.cache_ttl);
        assert!(quick.model_timeout < deep.model_timeout);
        for tier in [policy.quick, policy.standard, policy.deep] {
            assert!(tier.model_timeout <= tier.deadline);
        }
    }
}
