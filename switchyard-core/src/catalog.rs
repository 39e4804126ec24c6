//! # Catalog Module
//!
//! Static registry derived from configuration: providers, canonical models
//! and aliases. The catalog is built once per configuration generation and
//! answers synchronous lookups only: no I/O, no interior mutability.
//! Reconfiguration swaps the whole `Arc<Catalog>`; requests already in flight
//! keep the snapshot they started with.
//!
//! ## Naming
//!
//! - A **canonical model** id (e.g. `groq/llama-3.3-70b`) pins a provider,
//!   that provider's native model path, and a capability set.
//! - An **alias** (e.g. `llama-3.3-70b`) is a user-facing name expanding to an
//!   ordered list of canonical models, the failover template.

use crate::error::RouteError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Closed set of upstream API families a provider can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// Any endpoint speaking the OpenAI chat-completions dialect
    /// (Groq, OpenRouter, NVIDIA NIM, HuggingFace router, ...).
    OpenaiCompatible,
    /// Cohere's native chat API.
    Cohere,
    /// Cloudflare Workers AI (OpenAI-compatible surface).
    Cloudflare,
    /// Pollinations text endpoints (OpenAI-compatible surface).
    Pollinations,
    /// AI Horde's asynchronous job API (driver supplied externally).
    Aihorde,
    /// OpenAI-compatible endpoint with non-standard auth headers.
    CustomAuth,
}

/// One upstream LLM endpoint, immutable for a configuration generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    /// Opaque identifier; filled from the configuration map key.
    #[serde(default)]
    pub id: String,
    /// Human-facing name; defaults to the id.
    #[serde(default)]
    pub display_name: String,
    /// API family this provider speaks.
    pub kind: ProviderKind,
    /// Disabled providers stay in the catalog but never produce candidates.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Base endpoint override; drivers fall back to their kind's default.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Name of the environment variable holding this provider's credential.
    #[serde(default)]
    pub credential_ref: Option<String>,
    /// Operator-declared cost rank; lower ranks are preferred within a band.
    #[serde(default)]
    pub tier: u8,
    /// Free-tier providers are tried before paid ones.
    #[serde(default)]
    pub free: bool,
    /// Declared requests-per-minute budget; `None` means unlimited.
    #[serde(default)]
    pub rpm_limit: Option<u32>,
    /// Declared tokens-per-minute budget; `None` means unlimited.
    #[serde(default)]
    pub tpm_limit: Option<u64>,
    /// Provider-native model ids this endpoint serves.
    #[serde(default)]
    pub models: Vec<String>,
    /// Opaque driver configuration (custom headers, account ids, ...).
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_enabled() -> bool {
    true
}

/// Feature flags a canonical model is known to support.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub streaming: bool,
    pub tools: bool,
    pub vision: bool,
    pub structured_output: bool,
    pub log_probs: bool,
}

/// A single capability, for lookup-style queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Streaming,
    Tools,
    Vision,
    StructuredOutput,
    LogProbs,
}

impl Capabilities {
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Streaming => self.streaming,
            Capability::Tools => self.tools,
            Capability::Vision => self.vision,
            Capability::StructuredOutput => self.structured_output,
            Capability::LogProbs => self.log_probs,
        }
    }
}

/// Internal identifier pinning a (provider, model path, capabilities) triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalModel {
    /// Canonical id, e.g. `groq/llama-3.3-70b`.
    pub id: String,
    /// Owning provider id.
    pub provider_id: String,
    /// Provider-native model path sent on the wire.
    pub model_path: String,
    /// Declared capability flags.
    #[serde(default)]
    pub capabilities: Capabilities,
}

/// Configuration tree the catalog is built from.
///
/// This is the typed value handed to the engine; loading it from TOML and
/// the environment is the HTTP adapter's concern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub providers: BTreeMap<String, Provider>,
    #[serde(default)]
    pub canonical_models: Vec<CanonicalModel>,
    #[serde(default)]
    pub aliases: BTreeMap<String, Vec<String>>,
}

/// Immutable lookup registry for one configuration generation.
#[derive(Debug)]
pub struct Catalog {
    providers: BTreeMap<String, Arc<Provider>>,
    models: BTreeMap<String, Arc<CanonicalModel>>,
    aliases: BTreeMap<String, Vec<String>>,
}

impl Catalog {
    /// Build a catalog, validating referential integrity: every model must
    /// name a configured provider and every alias entry a configured model.
    pub fn new(config: CatalogConfig) -> Result<Self, RouteError> {
        let mut providers = BTreeMap::new();
        for (id, mut provider) in config.providers {
            provider.id = id.clone();
            if provider.display_name.is_empty() {
                provider.display_name = id.clone();
            }
            providers.insert(id, Arc::new(provider));
        }

        let mut models = BTreeMap::new();
        for model in config.canonical_models {
            if !providers.contains_key(&model.provider_id) {
                return Err(RouteError::UnknownProvider {
                    provider: model.provider_id,
                });
            }
            models.insert(model.id.clone(), Arc::new(model));
        }

        for (alias, template) in &config.aliases {
            for model_id in template {
                if !models.contains_key(model_id) {
                    tracing::error!(alias = %alias, model = %model_id, "alias references unknown model");
                    return Err(RouteError::UnknownModel {
                        model: model_id.clone(),
                    });
                }
            }
        }

        Ok(Self {
            providers,
            models,
            aliases: config.aliases,
        })
    }

    /// Resolve a model selector into its ordered candidate template.
    ///
    /// Aliases expand in template order with disabled providers' models
    /// dropped; a bare canonical id yields a single-element list. An alias
    /// whose template is empty, or a selector matching nothing, fails with
    /// `unknown_model`. A non-empty template whose providers are all disabled
    /// resolves to an empty list; that is an availability problem, not a
    /// naming one, and the failover engine reports it as exhaustion.
    pub fn resolve(&self, selector: &str) -> Result<Vec<Arc<CanonicalModel>>, RouteError> {
        if let Some(template) = self.aliases.get(selector) {
            if template.is_empty() {
                return Err(RouteError::UnknownModel {
                    model: selector.to_string(),
                });
            }
            let expanded = template
                .iter()
                .filter_map(|id| self.models.get(id))
                .filter(|m| self.provider_enabled(&m.provider_id))
                .cloned()
                .collect();
            return Ok(expanded);
        }

        if let Some(model) = self.models.get(selector) {
            if self.provider_enabled(&model.provider_id) {
                return Ok(vec![model.clone()]);
            }
            return Ok(Vec::new());
        }

        Err(RouteError::UnknownModel {
            model: selector.to_string(),
        })
    }

    /// Look up a provider by id.
    pub fn provider(&self, id: &str) -> Result<Arc<Provider>, RouteError> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| RouteError::UnknownProvider {
                provider: id.to_string(),
            })
    }

    /// Whether the given canonical model declares a capability.
    pub fn supports(&self, model_id: &str, capability: Capability) -> bool {
        self.models
            .get(model_id)
            .map(|m| m.capabilities.supports(capability))
            .unwrap_or(false)
    }

    /// All configured providers, in id order.
    pub fn providers(&self) -> impl Iterator<Item = &Arc<Provider>> {
        self.providers.values()
    }

    /// All canonical model ids, in lexicographic order.
    pub fn model_ids(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    /// All alias names, in lexicographic order.
    pub fn alias_names(&self) -> impl Iterator<Item = &str> {
        self.aliases.keys().map(String::as_str)
    }

    fn provider_enabled(&self, id: &str) -> bool {
        self.providers.get(id).map(|p| p.enabled).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(id: &str, enabled: bool) -> Provider {
        Provider {
            id: id.to_string(),
            display_name: String::new(),
            kind: ProviderKind::OpenaiCompatible,
            enabled,
            endpoint: None,
            credential_ref: None,
            tier: 0,
            free: true,
            rpm_limit: None,
            tpm_limit: None,
            models: vec![],
            extra: HashMap::new(),
        }
    }

    fn model(id: &str, provider_id: &str) -> CanonicalModel {
        CanonicalModel {
            id: id.to_string(),
            provider_id: provider_id.to_string(),
            model_path: "m".to_string(),
            capabilities: Capabilities {
                streaming: true,
                ..Default::default()
            },
        }
    }

    fn catalog() -> Catalog {
        let mut providers = BTreeMap::new();
        providers.insert("groq".to_string(), provider("groq", true));
        providers.insert("cohere".to_string(), provider("cohere", true));
        providers.insert("idle".to_string(), provider("idle", false));

        let mut aliases = BTreeMap::new();
        aliases.insert(
            "fast".to_string(),
            vec!["groq/m".to_string(), "cohere/m".to_string(), "idle/m".to_string()],
        );
        aliases.insert("empty".to_string(), vec![]);

        Catalog::new(CatalogConfig {
            providers,
            canonical_models: vec![
                model("groq/m", "groq"),
                model("cohere/m", "cohere"),
                model("idle/m", "idle"),
            ],
            aliases,
        })
        .unwrap()
    }

    #[test]
    fn alias_expands_in_template_order_without_disabled_providers() {
        let catalog = catalog();
        let resolved = catalog.resolve("fast").unwrap();
        let ids: Vec<&str> = resolved.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["groq/m", "cohere/m"]);
    }

    #[test]
    fn canonical_id_resolves_to_single_entry() {
        let catalog = catalog();
        let resolved = catalog.resolve("cohere/m").unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].provider_id, "cohere");
    }

    #[test]
    fn disabled_provider_model_resolves_empty() {
        let catalog = catalog();
        assert!(catalog.resolve("idle/m").unwrap().is_empty());
    }

    #[test]
    fn empty_alias_is_unknown_model() {
        let catalog = catalog();
        assert!(matches!(
            catalog.resolve("empty"),
            Err(RouteError::UnknownModel { .. })
        ));
    }

    #[test]
    fn unmatched_selector_is_unknown_model() {
        let catalog = catalog();
        assert!(matches!(
            catalog.resolve("gpt-17"),
            Err(RouteError::UnknownModel { .. })
        ));
    }

    #[test]
    fn capability_lookup() {
        let catalog = catalog();
        assert!(catalog.supports("groq/m", Capability::Streaming));
        assert!(!catalog.supports("groq/m", Capability::Vision));
        assert!(!catalog.supports("missing", Capability::Streaming));
    }

    #[test]
    fn build_rejects_model_with_unknown_provider() {
        let err = Catalog::new(CatalogConfig {
            providers: BTreeMap::new(),
            canonical_models: vec![model("x/m", "x")],
            aliases: BTreeMap::new(),
        });
        assert!(matches!(err, Err(RouteError::UnknownProvider { .. })));
    }

    #[test]
    fn build_rejects_alias_with_unknown_model() {
        let mut providers = BTreeMap::new();
        providers.insert("groq".to_string(), provider("groq", true));
        let mut aliases = BTreeMap::new();
        aliases.insert("fast".to_string(), vec!["missing/m".to_string()]);
        let err = Catalog::new(CatalogConfig {
            providers,
            canonical_models: vec![],
            aliases,
        });
        assert!(matches!(err, Err(RouteError::UnknownModel { .. })));
    }
}
