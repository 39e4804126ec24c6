//! # HTTP Server Module
//!
//! Wires the engine together from configuration and exposes it as an axum
//! router: the OpenAI-compatible endpoints, a health probe, and an admin view
//! of provider state, behind CORS, trace-logging, body-limit and timeout
//! layers.

use crate::config::{Config, CorsConfig, StoreBackend};
use crate::handlers;
use axum::extract::DefaultBodyLimit;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use switchyard_core::attempt::AttemptPipeline;
use switchyard_core::catalog::Catalog;
use switchyard_core::dispatch::Dispatcher;
use switchyard_core::failover::FailoverEngine;
use switchyard_core::health::{HealthStore, MemoryHealthStore, RedisHealthStore};
use switchyard_core::providers::DriverRegistry;
use switchyard_core::quota::{
    limits_from_catalog, MemoryQuotaTracker, QuotaTracker, RedisQuotaTracker,
};
use switchyard_core::routing::{Router as CandidateRouter, StatsRegistry};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Application state shared across all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub catalog: Arc<Catalog>,
    pub dispatcher: Arc<Dispatcher>,
    pub health: Arc<dyn HealthStore>,
    pub quota: Arc<dyn QuotaTracker>,
}

/// Build the axum application from configuration.
///
/// Store construction fails open: if Redis is configured but unreachable at
/// startup, the gateway logs the problem and runs on in-process stores rather
/// than refusing to serve.
pub async fn create_server(config: Config) -> anyhow::Result<Router> {
    let catalog = Arc::new(Catalog::new(config.catalog.clone())?);
    let limits = limits_from_catalog(&catalog);

    let (health, quota): (Arc<dyn HealthStore>, Arc<dyn QuotaTracker>) =
        match &config.store.backend {
            StoreBackend::Memory => (
                Arc::new(MemoryHealthStore::new()),
                Arc::new(MemoryQuotaTracker::new(limits)),
            ),
            StoreBackend::Redis { url } => {
                let health = RedisHealthStore::connect(url).await;
                let quota = RedisQuotaTracker::connect(url, limits.clone()).await;
                match (health, quota) {
                    (Ok(health), Ok(quota)) => {
                        tracing::info!(url = %url, "sharing health and quota state via redis");
                        (Arc::new(health), Arc::new(quota))
                    }
                    (health, quota) => {
                        if let Err(e) = &health {
                            tracing::warn!(url = %url, error = %e, "redis health store unavailable");
                        }
                        if let Err(e) = &quota {
                            tracing::warn!(url = %url, error = %e, "redis quota tracker unavailable");
                        }
                        tracing::warn!("falling back to in-process stores");
                        (
                            Arc::new(MemoryHealthStore::new()),
                            Arc::new(MemoryQuotaTracker::new(limits)),
                        )
                    }
                }
            }
        };

    let stats = Arc::new(StatsRegistry::new());
    let drivers = Arc::new(DriverRegistry::from_catalog(&catalog));

    let router = CandidateRouter::new(
        catalog.clone(),
        health.clone(),
        quota.clone(),
        stats.clone(),
        config.routing.weights,
    );
    let pipeline = AttemptPipeline::new(
        drivers,
        quota.clone(),
        health.clone(),
        config.attempt.clone(),
    );
    let engine = FailoverEngine::new(router, pipeline, health.clone(), stats);
    let dispatcher = Arc::new(Dispatcher::new(catalog.clone(), engine));

    let state = AppState {
        config: Arc::new(config.clone()),
        catalog,
        dispatcher,
        health,
        quota,
    };

    let app = Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/models", get(handlers::list_models))
        .route("/health", get(handlers::health_check))
        .route("/admin/providers", get(handlers::provider_status))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(DefaultBodyLimit::max(config.server.max_body_size))
                .layer(TimeoutLayer::new(config.server.timeout))
                .layer(cors_layer(&config.server.cors)),
        )
        .with_state(state);

    Ok(app)
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
    if !config.enabled {
        return CorsLayer::new();
    }
    if config.allowed_origins.iter().any(|o| o == "*") {
        tracing::warn!("CORS allows any origin; configure explicit allowed_origins for production");
        return CorsLayer::new().allow_origin(Any).allow_headers(Any).allow_methods(Any);
    }

    let origins: Vec<_> = config
        .allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_headers(Any)
        .allow_methods(Any)
}
