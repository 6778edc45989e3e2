//! Ward Strategist: multi-model briefings with cached fan-out and live
//! per-ward intelligence streams.
//!
//! Services are built once at startup and shared as cheap `Clone` handles.

pub mod api;
pub mod cache;
pub mod coalesce;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod fallback;
pub mod merge;
pub mod metrics;
pub mod model;
pub mod parse;
pub mod provider;
pub mod registry;
pub mod signals;
pub mod state;
pub mod stream;

pub use cache::{BriefingCache, CacheStore};
pub use coordinator::Coordinator;
pub use registry::ModelRegistry;
