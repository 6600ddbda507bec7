//! Provider and model registry.
//!
//! Maps public model ids and aliases to capability descriptors and the
//! adapter that serves them. Provider enablement can be flipped at runtime
//! (configuration reload) without rebuilding the registry.

use crate::providers::{ImagenAdapter, OpenAiAdapter, ProviderAdapter, ProviderKind};
use imagegen_mcp_common::config::Config;
use imagegen_mcp_common::error::Error;
use imagegen_mcp_common::models::{GEMINI_PROVIDER, ModelCapabilityDescriptor, OPENAI_PROVIDER};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

struct ProviderEntry {
    adapter: Arc<dyn ProviderAdapter>,
    enabled: AtomicBool,
}

struct ModelEntry {
    descriptor: Arc<ModelCapabilityDescriptor>,
    provider_id: String,
}

/// A model resolved for one request.
#[derive(Clone)]
pub struct ResolvedModel {
    pub descriptor: Arc<ModelCapabilityDescriptor>,
    pub adapter: Arc<dyn ProviderAdapter>,
}

impl std::fmt::Debug for ResolvedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedModel")
            .field("model_id", &self.descriptor.model_id)
            .field("provider", &self.adapter.id())
            .finish()
    }
}

/// One model in a listing.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    /// Whether the owning provider is enabled
    pub available: bool,
    pub is_default: bool,
    #[serde(flatten)]
    pub descriptor: ModelCapabilityDescriptor,
}

/// One provider in a listing.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSummary {
    pub id: String,
    pub kind: ProviderKind,
    pub enabled: bool,
    pub models: Vec<String>,
}

/// Everything the registry knows, for `list_available_models`.
#[derive(Debug, Clone, Serialize)]
pub struct ModelListing {
    pub default_model: String,
    pub models: Vec<ModelSummary>,
    pub providers: Vec<ProviderSummary>,
}

/// Registry of providers and the models they serve.
pub struct ProviderRegistry {
    providers: BTreeMap<String, ProviderEntry>,
    models: BTreeMap<String, ModelEntry>,
    /// Model id or alias to model id
    names: HashMap<String, String>,
    default_model: String,
}

impl ProviderRegistry {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            providers: BTreeMap::new(),
            models: BTreeMap::new(),
            names: HashMap::new(),
            default_model: default_model.into(),
        }
    }

    /// Register a provider with the models it serves.
    ///
    /// Registration is all-or-nothing: if any model id or alias is already
    /// owned by a different provider nothing is registered.
    ///
    /// # Errors
    ///
    /// Returns `Error::DuplicateModel` on a cross-provider collision, or
    /// `Error::Internal` if a descriptor names another provider.
    pub fn register(
        &mut self,
        adapter: Arc<dyn ProviderAdapter>,
        descriptors: Vec<ModelCapabilityDescriptor>,
        enabled: bool,
    ) -> Result<(), Error> {
        let provider_id = adapter.id().to_string();

        for descriptor in &descriptors {
            if descriptor.provider_id != provider_id {
                return Err(Error::internal(format!(
                    "model '{}' belongs to provider '{}', not '{}'",
                    descriptor.model_id, descriptor.provider_id, provider_id
                )));
            }
            for name in std::iter::once(&descriptor.model_id).chain(descriptor.aliases.iter()) {
                if let Some(owner) = self.names.get(name).and_then(|id| self.models.get(id)) {
                    if owner.provider_id != provider_id {
                        return Err(Error::DuplicateModel {
                            model_id: name.clone(),
                            existing_provider: owner.provider_id.clone(),
                            provider: provider_id,
                        });
                    }
                }
            }
        }

        for descriptor in descriptors {
            let model_id = descriptor.model_id.clone();
            for name in std::iter::once(&descriptor.model_id).chain(descriptor.aliases.iter()) {
                self.names.insert(name.clone(), model_id.clone());
            }
            self.models.insert(
                model_id,
                ModelEntry {
                    descriptor: Arc::new(descriptor),
                    provider_id: provider_id.clone(),
                },
            );
        }

        info!(provider = %provider_id, enabled, "Registered provider");
        self.providers.insert(
            provider_id,
            ProviderEntry {
                adapter,
                enabled: AtomicBool::new(enabled),
            },
        );
        Ok(())
    }

    fn available(&self, entry: &ModelEntry) -> Option<&ProviderEntry> {
        self.providers
            .get(&entry.provider_id)
            .filter(|p| p.enabled.load(Ordering::Acquire))
    }

    /// Model ids whose providers are currently enabled.
    pub fn available_model_ids(&self) -> Vec<String> {
        self.models
            .iter()
            .filter(|(_, entry)| self.available(entry).is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Resolve a requested model name, or the default when `None`.
    ///
    /// # Errors
    ///
    /// - `Error::UnknownModel` if the name is unknown or its provider is disabled
    /// - `Error::NoDefaultAvailable` if no name was given and the default is unavailable
    pub fn resolve(&self, requested: Option<&str>) -> Result<ResolvedModel, Error> {
        let requested = requested.map(str::trim).filter(|n| !n.is_empty());
        let name = requested.unwrap_or(self.default_model.as_str());

        let found = self
            .names
            .get(name)
            .and_then(|id| self.models.get(id))
            .and_then(|entry| self.available(entry).map(|provider| (entry, provider)));

        match found {
            Some((entry, provider)) => Ok(ResolvedModel {
                descriptor: entry.descriptor.clone(),
                adapter: provider.adapter.clone(),
            }),
            None if requested.is_none() => Err(Error::NoDefaultAvailable {
                model: self.default_model.clone(),
            }),
            None => Err(Error::UnknownModel {
                model: name.to_string(),
                available: self.available_model_ids(),
            }),
        }
    }

    /// Look up a descriptor regardless of provider state.
    pub fn descriptor(&self, name: &str) -> Option<(Arc<ModelCapabilityDescriptor>, bool)> {
        let entry = self.names.get(name).and_then(|id| self.models.get(id))?;
        Some((entry.descriptor.clone(), self.available(entry).is_some()))
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn is_provider_enabled(&self, provider_id: &str) -> bool {
        self.providers
            .get(provider_id)
            .is_some_and(|p| p.enabled.load(Ordering::Acquire))
    }

    /// Enable or disable a provider. Returns `false` for unknown providers.
    pub fn set_provider_enabled(&self, provider_id: &str, enabled: bool) -> bool {
        match self.providers.get(provider_id) {
            Some(entry) => {
                let previous = entry.enabled.swap(enabled, Ordering::AcqRel);
                if previous != enabled {
                    info!(provider = %provider_id, enabled, "Provider availability changed");
                }
                true
            }
            None => false,
        }
    }

    /// Apply provider enable flags from a reloaded configuration.
    pub fn apply_config(&self, config: &Config) {
        for provider_id in self.providers.keys() {
            self.set_provider_enabled(provider_id, config.provider_enabled(provider_id));
        }
    }

    pub fn list_models(&self) -> ModelListing {
        let models = self
            .models
            .iter()
            .map(|(id, entry)| ModelSummary {
                available: self.available(entry).is_some(),
                is_default: *id == self.default_model,
                descriptor: (*entry.descriptor).clone(),
            })
            .collect();

        let providers = self
            .providers
            .iter()
            .map(|(id, entry)| ProviderSummary {
                id: id.clone(),
                kind: entry.adapter.kind(),
                enabled: entry.enabled.load(Ordering::Acquire),
                models: self
                    .models
                    .iter()
                    .filter(|(_, m)| m.provider_id == *id)
                    .map(|(model_id, _)| model_id.clone())
                    .collect(),
            })
            .collect();

        ModelListing {
            default_model: self.default_model.clone(),
            models,
            providers,
        }
    }

    /// Build the registry from configuration and a model catalog.
    ///
    /// Providers without credentials are skipped. A provider that fails to
    /// initialize is logged and skipped, so one bad credential does not take
    /// the whole server down.
    ///
    /// # Errors
    ///
    /// Returns `Error::DuplicateModel` if the catalog assigns one model name
    /// to two providers.
    pub async fn from_config(
        config: &Config,
        catalog: Vec<ModelCapabilityDescriptor>,
    ) -> Result<Self, Error> {
        let mut registry = Self::new(config.images.default_model.clone());
        let mut by_provider: BTreeMap<String, Vec<ModelCapabilityDescriptor>> = BTreeMap::new();
        for descriptor in catalog {
            by_provider
                .entry(descriptor.provider_id.clone())
                .or_default()
                .push(descriptor);
        }

        let openai = &config.providers.openai;
        if openai.api_key.is_some() {
            match OpenAiAdapter::from_settings(openai) {
                Ok(adapter) => registry.register(
                    Arc::new(adapter),
                    by_provider.remove(OPENAI_PROVIDER).unwrap_or_default(),
                    openai.enabled,
                )?,
                Err(e) => {
                    warn!(provider = OPENAI_PROVIDER, error = %e, "Provider initialization failed")
                }
            }
        } else {
            info!(provider = OPENAI_PROVIDER, "No API key configured, provider not registered");
        }

        let gemini = &config.providers.gemini;
        if gemini.enabled || gemini.credentials.is_some() {
            match ImagenAdapter::from_settings(gemini).await {
                Ok(adapter) => registry.register(
                    Arc::new(adapter),
                    by_provider.remove(GEMINI_PROVIDER).unwrap_or_default(),
                    gemini.enabled,
                )?,
                Err(e) => {
                    warn!(provider = GEMINI_PROVIDER, error = %e, "Provider initialization failed")
                }
            }
        } else {
            info!(provider = GEMINI_PROVIDER, "Provider disabled and no credentials configured");
        }

        for (provider, models) in &by_provider {
            let ids: Vec<&str> = models.iter().map(|m| m.model_id.as_str()).collect();
            warn!(provider = %provider, models = ?ids, "Models skipped: provider not registered");
        }

        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{RawResult, RetryPolicy};
    use crate::request::CanonicalRequest;
    use async_trait::async_trait;
    use imagegen_mcp_common::error::ProviderError;
    use imagegen_mcp_common::models::builtin_models;

    struct NullAdapter {
        id: &'static str,
        kind: ProviderKind,
        retry: RetryPolicy,
    }

    #[async_trait]
    impl ProviderAdapter for NullAdapter {
        fn id(&self) -> &str {
            self.id
        }
        fn kind(&self) -> ProviderKind {
            self.kind
        }
        fn retry_policy(&self) -> &RetryPolicy {
            &self.retry
        }
        async fn generate(
            &self,
            _request: &CanonicalRequest,
            _model: &ModelCapabilityDescriptor,
        ) -> Result<RawResult, ProviderError> {
            Ok(RawResult::default())
        }
        async fn edit(
            &self,
            _request: &CanonicalRequest,
            _model: &ModelCapabilityDescriptor,
        ) -> Result<RawResult, ProviderError> {
            Ok(RawResult::default())
        }
    }

    fn adapter(id: &'static str, kind: ProviderKind) -> Arc<dyn ProviderAdapter> {
        Arc::new(NullAdapter {
            id,
            kind,
            retry: RetryPolicy::none(),
        })
    }

    fn models_for(provider: &str) -> Vec<ModelCapabilityDescriptor> {
        builtin_models()
            .into_iter()
            .filter(|m| m.provider_id == provider)
            .collect()
    }

    fn registry() -> ProviderRegistry {
        let mut registry = ProviderRegistry::new("gpt-image-1");
        registry
            .register(adapter("openai", ProviderKind::OpenAi), models_for("openai"), true)
            .unwrap();
        registry
            .register(adapter("gemini", ProviderKind::Imagen), models_for("gemini"), true)
            .unwrap();
        registry
    }

    #[test]
    fn test_resolve_by_id_and_alias() {
        let registry = registry();
        assert_eq!(registry.resolve(Some("imagen-4")).unwrap().descriptor.model_id, "imagen-4");
        assert_eq!(registry.resolve(Some("imagen4")).unwrap().descriptor.model_id, "imagen-4");
        assert_eq!(registry.resolve(None).unwrap().descriptor.model_id, "gpt-image-1");
        assert_eq!(registry.resolve(Some("  ")).unwrap().descriptor.model_id, "gpt-image-1");
    }

    #[test]
    fn test_unknown_model_lists_available() {
        let err = registry().resolve(Some("dall-e-9")).unwrap_err();
        match err {
            Error::UnknownModel { model, available } => {
                assert_eq!(model, "dall-e-9");
                assert!(available.contains(&"gpt-image-1".to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_disabled_provider_hides_its_models() {
        let registry = registry();
        assert!(registry.set_provider_enabled("gemini", false));
        assert!(matches!(
            registry.resolve(Some("imagen-4")),
            Err(Error::UnknownModel { .. })
        ));
        assert!(!registry.available_model_ids().contains(&"imagen-4".to_string()));

        let (descriptor, available) = registry.descriptor("imagen-4").unwrap();
        assert_eq!(descriptor.model_id, "imagen-4");
        assert!(!available);

        assert!(registry.set_provider_enabled("gemini", true));
        assert!(registry.resolve(Some("imagen-4")).is_ok());
        assert!(!registry.set_provider_enabled("stability", true));
    }

    #[test]
    fn test_disabled_default_is_no_default_available() {
        let registry = registry();
        registry.set_provider_enabled("openai", false);
        assert!(matches!(registry.resolve(None), Err(Error::NoDefaultAvailable { .. })));
    }

    #[test]
    fn test_cross_provider_collision_is_rejected_atomically() {
        let mut registry = registry();
        let mut stolen = models_for("gemini");
        for m in &mut stolen {
            m.provider_id = "rogue".to_string();
        }
        let mut fresh = stolen[0].clone();
        fresh.model_id = "rogue-1".to_string();
        fresh.aliases.clear();
        stolen.insert(0, fresh);

        let err = registry
            .register(adapter("rogue", ProviderKind::Imagen), stolen, true)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::DuplicateModel { ref existing_provider, .. } if existing_provider == "gemini"
        ));
        assert!(registry.descriptor("rogue-1").is_none());
        assert!(!registry.is_provider_enabled("rogue"));
    }

    #[test]
    fn test_same_provider_reregistration_replaces() {
        let mut registry = registry();
        let mut models = models_for("gemini");
        models[0].description = "updated".to_string();
        let id = models[0].model_id.clone();
        registry
            .register(adapter("gemini", ProviderKind::Imagen), models, true)
            .unwrap();
        assert_eq!(registry.descriptor(&id).unwrap().0.description, "updated");
    }

    #[test]
    fn test_listing_reports_availability() {
        let registry = registry();
        registry.set_provider_enabled("gemini", false);
        let listing = registry.list_models();
        assert_eq!(listing.default_model, "gpt-image-1");
        let imagen = listing.models.iter().find(|m| m.descriptor.model_id == "imagen-4").unwrap();
        assert!(!imagen.available);
        let gpt = listing.models.iter().find(|m| m.descriptor.model_id == "gpt-image-1").unwrap();
        assert!(gpt.available && gpt.is_default);
        let gemini = listing.providers.iter().find(|p| p.id == "gemini").unwrap();
        assert!(!gemini.enabled);
        assert_eq!(gemini.models.len(), 2);

        let json = serde_json::to_value(&listing).unwrap();
        assert!(json["models"][0].get("model_id").is_some());
    }

    #[test]
    fn test_apply_config_follows_flags() {
        let registry = registry();
        let config = Config::from_lookup(|key| match key {
            "PROVIDERS__OPENAI__ENABLED" => Some("false".to_string()),
            "PROVIDERS__GEMINI__ENABLED" => Some("true".to_string()),
            _ => None,
        })
        .unwrap();
        registry.apply_config(&config);
        assert!(!registry.is_provider_enabled("openai"));
        assert!(registry.is_provider_enabled("gemini"));
    }

    #[tokio::test]
    async fn test_from_config_skips_unconfigured_providers() {
        let config = Config::from_lookup(|_| None).unwrap();
        let registry = ProviderRegistry::from_config(&config, builtin_models()).await.unwrap();
        assert!(registry.list_models().providers.is_empty());
        assert!(matches!(registry.resolve(None), Err(Error::NoDefaultAvailable { .. })));
    }

    #[tokio::test]
    async fn test_from_config_registers_openai_with_key() {
        let config = Config::from_lookup(|key| {
            (key == "PROVIDERS__OPENAI__API_KEY").then(|| "sk-test".to_string())
        })
        .unwrap();
        let registry = ProviderRegistry::from_config(&config, builtin_models()).await.unwrap();
        let resolved = registry.resolve(Some("gpt-image")).unwrap();
        assert_eq!(resolved.descriptor.model_id, "gpt-image-1");
        assert_eq!(resolved.adapter.kind(), ProviderKind::OpenAi);
    }
}
