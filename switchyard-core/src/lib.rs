//! # Switchyard Core
//!
//! The routing and failover engine behind the Switchyard inference gateway.
//! Given an OpenAI-shaped chat request and a model selector, the engine picks
//! an ordered list of provider candidates, tries them one at a time under a
//! tiered fallback policy, and records health and quota outcomes so the next
//! request routes around whatever just went wrong.
//!
//! ## Architecture
//!
//! One request flows through a fixed chain:
//!
//! ```text
//! Dispatcher → FailoverEngine → Router ─┬─ Catalog      (what exists)
//!                   │                   ├─ HealthStore  (what is up)
//!                   │                   └─ QuotaTracker (what has budget)
//!                   └→ AttemptPipeline → ProviderDriver → upstream
//! ```
//!
//! - [`catalog`]: immutable registry of providers, canonical models and
//!   aliases, rebuilt wholesale on reconfiguration.
//! - [`health`]: shared per-provider health with per-error-class cooldowns;
//!   in-process or Redis-backed.
//! - [`quota`]: atomic requests/tokens-per-minute windows; in-process or
//!   Redis-backed.
//! - [`routing`]: tiered candidate production: preferred, free, paid,
//!   emergency.
//! - [`attempt`]: one provider attempt: reservation, deadline, single
//!   transient retry, token accounting.
//! - [`failover`]: the tier walk that turns many flaky providers into one
//!   answer.
//! - [`dispatch`]: the entry point the HTTP adapter calls.
//! - [`providers`]: the driver trait plus reference drivers for
//!   OpenAI-compatible and Cohere upstreams.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use switchyard_core::attempt::{AttemptConfig, AttemptPipeline};
//! use switchyard_core::catalog::{Catalog, CatalogConfig};
//! use switchyard_core::dispatch::Dispatcher;
//! use switchyard_core::failover::FailoverEngine;
//! use switchyard_core::health::MemoryHealthStore;
//! use switchyard_core::models::{ChatRequest, Message};
//! use switchyard_core::providers::DriverRegistry;
//! use switchyard_core::quota::{limits_from_catalog, MemoryQuotaTracker};
//! use switchyard_core::routing::{Router, RouterWeights, StatsRegistry};
//!
//! # async fn run(config: CatalogConfig) -> switchyard_core::Result<()> {
//! let catalog = Arc::new(Catalog::new(config)?);
//! let health = Arc::new(MemoryHealthStore::new());
//! let quota = Arc::new(MemoryQuotaTracker::new(limits_from_catalog(&catalog)));
//! let stats = Arc::new(StatsRegistry::new());
//! let drivers = Arc::new(DriverRegistry::from_catalog(&catalog));
//!
//! let router = Router::new(catalog.clone(), health.clone(), quota.clone(),
//!                          stats.clone(), RouterWeights::default());
//! let pipeline = AttemptPipeline::new(drivers, quota, health.clone(),
//!                                     AttemptConfig::default());
//! let engine = FailoverEngine::new(router, pipeline, health, stats);
//! let dispatcher = Dispatcher::new(catalog, engine);
//!
//! let request = ChatRequest {
//!     model: "llama-3.3-70b".to_string(),
//!     messages: vec![Message::user("hello")],
//!     ..Default::default()
//! };
//! let completion = dispatcher.run(request).await?;
//! # let _ = completion;
//! # Ok(())
//! # }
//! ```

pub mod attempt;
pub mod catalog;
pub mod common;
pub mod dispatch;
pub mod error;
pub mod failover;
pub mod health;
pub mod models;
pub mod providers;
pub mod quota;
pub mod routing;

#[cfg(test)]
pub(crate) mod testing;

pub use attempt::{AttemptConfig, AttemptOutput, AttemptPipeline, Outcome};
pub use catalog::{
    CanonicalModel, Capabilities, Capability, Catalog, CatalogConfig, Provider, ProviderKind,
};
pub use dispatch::{Completion, Dispatcher};
pub use error::{AttemptRecord, ErrorClass, ProviderError, RouteError};
pub use failover::FailoverEngine;
pub use health::{HealthEntry, HealthState, HealthStore, MemoryHealthStore, RedisHealthStore};
pub use models::{ChatRequest, ChatResponse, Message, Role, RouteReceipt, StreamChunk, Usage};
pub use providers::{ChatStream, DriverRegistry, ProviderDriver};
pub use quota::{
    limits_from_catalog, MemoryQuotaTracker, QuotaEntry, QuotaTracker, RedisQuotaTracker,
};
pub use routing::{Candidate, Router, RouterWeights, StatsRegistry, Tier, TieredCandidates};

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, RouteError>;
