//! # Configuration Management Module
//!
//! Loads, validates and applies environment overrides for the gateway's TOML
//! configuration. The catalog sections (`providers`, `canonical_models`,
//! `aliases`) are the exact tree the engine consumes; everything else tunes
//! the HTTP surface, the shared stores and the attempt policy.
//!
//! ## Configuration File Example
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3000
//! timeout = "120s"
//!
//! [server.cors]
//! enabled = true
//! allowed_origins = ["*"]
//!
//! [routing.weights]
//! cost = 1.0
//! latency = 0.25
//! reliability = 0.5
//!
//! [attempt]
//! attempt_timeout = "30s"
//! first_byte_timeout = "10s"
//!
//! [store]
//! backend = "memory"          # or { redis = { url = "redis://..." } }
//!
//! [providers.groq]
//! kind = "openai-compatible"
//! endpoint = "https://api.groq.com/openai/v1"
//! credential_ref = "GROQ_API_KEY"
//! free = true
//! rpm_limit = 30
//! tpm_limit = 6000
//! models = ["llama-3.3-70b-versatile"]
//!
//! [[canonical_models]]
//! id = "groq/llama-3.3-70b"
//! provider_id = "groq"
//! model_path = "llama-3.3-70b-versatile"
//! capabilities = { streaming = true, tools = true }
//!
//! [aliases]
//! "llama-3.3-70b" = ["groq/llama-3.3-70b"]
//! ```
//!
//! ## Environment Variables
//!
//! - `SWITCHYARD_HOST` / `SWITCHYARD_PORT`: override the bind address
//! - `SWITCHYARD_LOG_LEVEL`: override the log filter
//! - `SWITCHYARD_REDIS_URL`: switch the shared stores to Redis

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;
use switchyard_core::attempt::AttemptConfig;
use switchyard_core::catalog::{Catalog, CatalogConfig};
use switchyard_core::common::duration_serde;
use switchyard_core::routing::RouterWeights;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Candidate scoring weights.
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Per-attempt deadlines and retry policy.
    #[serde(default)]
    pub attempt: AttemptConfig,
    /// Backing store for shared health and quota state.
    #[serde(default)]
    pub store: StoreConfig,
    /// Log level and format.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Providers, canonical models and aliases, flattened so the TOML file
    /// carries them as top-level sections.
    #[serde(flatten)]
    pub catalog: CatalogConfig,
}

/// HTTP server configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address to bind the server to.
    pub host: String,
    /// Port number to listen on.
    pub port: u16,
    /// Outer request timeout.
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    /// Maximum request body size in bytes.
    pub max_body_size: usize,
    /// CORS settings.
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            timeout: Duration::from_secs(120),
            max_body_size: 2 * 1024 * 1024,
            cors: CorsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: vec!["*".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub weights: RouterWeights,
}

/// Backing store for health and quota state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process state; fine for a single instance.
    #[default]
    Memory,
    /// Redis; shares health and quota across replicas.
    Redis { url: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log filter (tracing env-filter syntax).
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Validate the configuration by building the catalog it describes.
    pub fn validate(&self) -> anyhow::Result<()> {
        Catalog::new(self.catalog.clone()).context("invalid catalog configuration")?;

        if self.catalog.providers.values().all(|p| !p.enabled) {
            tracing::warn!("no enabled providers configured; every request will exhaust");
        }
        if self.server.port == 0 {
            anyhow::bail!("server.port must be non-zero");
        }
        Ok(())
    }

    /// Apply environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = env::var("SWITCHYARD_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = env::var("SWITCHYARD_PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %port, "ignoring unparsable SWITCHYARD_PORT"),
            }
        }
        if let Ok(level) = env::var("SWITCHYARD_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(url) = env::var("SWITCHYARD_REDIS_URL") {
            self.store.backend = StoreBackend::Redis { url };
        }
    }

    /// Zero-configuration development setup: a single keyless provider so
    /// the gateway answers requests out of the box.
    pub fn development() -> Self {
        let raw = r#"
            [providers.pollinations]
            kind = "pollinations"
            free = true
            models = ["openai"]

            [[canonical_models]]
            id = "pollinations/openai"
            provider_id = "pollinations"
            model_path = "openai"
            capabilities = { streaming = true }

            [aliases]
            default = ["pollinations/openai"]
        "#;
        toml::from_str(raw).expect("development config is well-formed")
    }
}
