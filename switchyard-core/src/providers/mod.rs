//! # Provider Driver Module
//!
//! Uniform surface over one upstream LLM endpoint. The engine only ever talks
//! to [`ProviderDriver`]: one non-streaming call, one streaming call, both
//! returning classified errors. Everything provider-specific (wire formats,
//! auth schemes, endpoint quirks) stays inside a driver implementation.
//!
//! Two reference drivers ship in this crate:
//!
//! - [`openai_compat`] covers every provider speaking the OpenAI
//!   chat-completions dialect (Groq, OpenRouter, NVIDIA NIM, HuggingFace,
//!   Cloudflare Workers AI, Pollinations, and custom-auth variants);
//! - [`cohere`] translates to and from Cohere's native chat API.
//!
//! Anything else (AI Horde's asynchronous job queue, bespoke internal
//! endpoints) is registered from outside through [`DriverRegistry::register`].
//! A provider without a registered driver fails its attempts as a server
//! error instead of disappearing silently from routing.

use crate::catalog::{Catalog, CanonicalModel, ProviderKind};
use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse, StreamChunk};
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub mod cohere;
pub mod http_client;
pub mod openai_compat;

/// A lazy, finite, non-restartable stream of completion chunks.
///
/// Dropping the stream cancels the upstream call.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// Uniform interface to one upstream provider.
#[async_trait::async_trait]
pub trait ProviderDriver: Send + Sync {
    /// Provider id this driver serves.
    fn name(&self) -> &str;

    /// Non-streaming completion. The response carries usage.
    async fn call(
        &self,
        request: &ChatRequest,
        model: &CanonicalModel,
    ) -> Result<ChatResponse, ProviderError>;

    /// Streaming completion. The final chunk of a well-behaved stream carries
    /// usage; the stream is finite and cancelled by dropping.
    async fn stream(
        &self,
        request: &ChatRequest,
        model: &CanonicalModel,
    ) -> Result<ChatStream, ProviderError>;
}

/// Transport ceiling for driver HTTP clients. The attempt pipeline applies
/// the per-attempt deadline on top of this.
const DRIVER_HTTP_TIMEOUT: Duration = Duration::from_secs(120);

/// Maps provider ids to their drivers.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn ProviderDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the driver for a provider. This is the seam for
    /// drivers that live outside this crate.
    pub fn register(&mut self, provider_id: impl Into<String>, driver: Arc<dyn ProviderDriver>) {
        self.drivers.insert(provider_id.into(), driver);
    }

    pub fn driver(&self, provider_id: &str) -> Option<Arc<dyn ProviderDriver>> {
        self.drivers.get(provider_id).cloned()
    }

    /// Build the registry for a catalog using the built-in drivers.
    ///
    /// A provider whose `credential_ref` names an unset environment variable
    /// is skipped with a warning; failing here is cheaper than burning the
    /// one-hour auth cooldown on its first dispatch.
    pub fn from_catalog(catalog: &Catalog) -> Self {
        let mut registry = Self::new();

        for provider in catalog.providers() {
            if !provider.enabled {
                continue;
            }

            let credential = match &provider.credential_ref {
                Some(var) => match std::env::var(var) {
                    Ok(value) => Some(value),
                    Err(_) => {
                        tracing::warn!(
                            provider = %provider.id,
                            credential_ref = %var,
                            "credential variable not set; provider left without a driver"
                        );
                        continue;
                    }
                },
                None => None,
            };

            let driver: Result<Arc<dyn ProviderDriver>, ProviderError> = match provider.kind {
                ProviderKind::OpenaiCompatible
                | ProviderKind::Cloudflare
                | ProviderKind::Pollinations
                | ProviderKind::CustomAuth => {
                    openai_compat::OpenAiCompatDriver::new(provider, credential, DRIVER_HTTP_TIMEOUT)
                        .map(|d| Arc::new(d) as Arc<dyn ProviderDriver>)
                }
                ProviderKind::Cohere => {
                    cohere::CohereDriver::new(provider, credential, DRIVER_HTTP_TIMEOUT)
                        .map(|d| Arc::new(d) as Arc<dyn ProviderDriver>)
                }
                ProviderKind::Aihorde => {
                    tracing::warn!(
                        provider = %provider.id,
                        "aihorde needs an externally registered driver"
                    );
                    continue;
                }
            };

            match driver {
                Ok(driver) => registry.register(provider.id.clone(), driver),
                Err(e) => {
                    tracing::warn!(provider = %provider.id, error = %e, "driver construction failed");
                }
            }
        }

        registry
    }
}
