//! Request orchestration for the imagegen MCP server.
//!
//! `ImageHandler` drives one request through
//! `received → fingerprinted → cache_check → {cache_hit | calling_provider →
//! persisting → caching} → done`. Model resolution and validation happen
//! before fingerprinting and never touch a provider.

use crate::cache::{ArtifactRef, CacheEntry, CacheableOutput, RequestCache, Resolution};
use crate::fingerprint::Fingerprint;
use crate::providers::{ProviderAdapter, dispatch};
use crate::registry::{ModelListing, ProviderRegistry};
use crate::request::{CanonicalRequest, ImageRequest, validation_failure};
use crate::storage::{ArtifactMetadata, ArtifactStore, FileInfo, GenerationDetails, StorageStats};
use crate::translate::resolve_parameters;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use imagegen_mcp_common::config::Config;
use imagegen_mcp_common::error::{Error, StorageError};
use imagegen_mcp_common::models::{ModelCapabilityDescriptor, builtin_models, load_model_dir};
use imagegen_mcp_common::params::OutputFormat;
use serde::Serialize;
use std::sync::Arc;
use tracing::{Span, debug, error, info, instrument, warn};

/// URI scheme of stored images.
pub const IMAGE_RESOURCE_SCHEME: &str = "generated-images://";

/// Maximum `days` accepted for history queries.
pub const MAX_HISTORY_DAYS: u32 = 365;

/// Produced image, shared between every request that resolves to it.
#[derive(Debug)]
pub struct ImageOutcome {
    pub bytes: Vec<u8>,
    pub format: OutputFormat,
    pub details: GenerationDetails,
    /// `None` when the image could not be stored
    pub artifact: Option<ArtifactMetadata>,
    pub storage_error: Option<String>,
}

impl CacheableOutput for Arc<ImageOutcome> {
    fn artifact_ref(&self) -> Option<ArtifactRef> {
        self.artifact.as_ref().map(|meta| ArtifactRef {
            image_id: meta.image_id.clone(),
            format: meta.file_info.format,
        })
    }
}

/// Whether the image survived to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    Persisted,
    NotPersisted,
}

/// Metadata block of a response.
#[derive(Debug, Clone, Serialize)]
pub struct ResultMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_info: Option<FileInfo>,
    #[serde(flatten)]
    pub details: GenerationDetails,
}

/// Response of `generate_image` and `edit_image`.
#[derive(Debug, Clone, Serialize)]
pub struct ImageResult {
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    /// Base64 image bytes. Sent as an image content block, not in the JSON.
    #[serde(skip)]
    pub image_data: String,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_reference: Option<String>,
    pub metadata: ResultMetadata,
    pub cache_hit: bool,
    /// Served by a concurrent identical request's provider call
    pub deduplicated: bool,
    pub durability: Durability,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_error: Option<String>,
}

/// Orchestrates generation and edit requests.
#[derive(Clone)]
pub struct ImageHandler {
    config: Arc<Config>,
    registry: Arc<ProviderRegistry>,
    cache: Arc<RequestCache<Arc<ImageOutcome>>>,
    store: Arc<ArtifactStore>,
}

impl ImageHandler {
    /// Assemble a handler from already-built parts.
    pub fn new(
        config: Arc<Config>,
        registry: Arc<ProviderRegistry>,
        cache: Arc<RequestCache<Arc<ImageOutcome>>>,
        store: Arc<ArtifactStore>,
    ) -> Self {
        Self {
            config,
            registry,
            cache,
            store,
        }
    }

    /// Build providers, storage and cache from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the model catalog is invalid, the store directory
    /// cannot be created, or the cache backend cannot be reached.
    #[instrument(level = "debug", name = "image_handler_new", skip_all)]
    pub async fn from_config(config: Config) -> Result<Self, Error> {
        debug!("Initializing ImageHandler");
        let catalog = load_catalog(&config)?;
        let registry = ProviderRegistry::from_config(&config, catalog).await?;
        let store = ArtifactStore::open(&config.storage).await?;
        let cache = RequestCache::from_config(&config.cache).await?;
        info!(
            models = registry.available_model_ids().len(),
            cache = cache.backend_name().unwrap_or("disabled"),
            "ImageHandler ready"
        );
        Ok(Self::new(
            Arc::new(config),
            Arc::new(registry),
            Arc::new(cache),
            Arc::new(store),
        ))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<RequestCache<Arc<ImageOutcome>>> {
        &self.cache
    }

    /// Generate an image from a text prompt.
    pub async fn generate_image(&self, request: ImageRequest) -> Result<ImageResult, Error> {
        self.execute(uuid::Uuid::new_v4().to_string(), request).await
    }

    /// Edit a source image according to a prompt.
    pub async fn edit_image(&self, request: ImageRequest) -> Result<ImageResult, Error> {
        self.execute(uuid::Uuid::new_v4().to_string(), request).await
    }

    #[instrument(
        level = "info",
        name = "image_request",
        skip(self, request),
        fields(
            task_id = %task_id,
            operation = request.operation.as_str(),
            model = tracing::field::Empty,
            fingerprint = tracing::field::Empty
        )
    )]
    async fn execute(&self, task_id: String, request: ImageRequest) -> Result<ImageResult, Error> {
        debug!(state = "received", "Request received");
        let result = self.run(&task_id, request).await;
        match &result {
            Ok(response) => info!(
                state = "done",
                image_id = response.image_id.as_deref().unwrap_or("-"),
                cache_hit = response.cache_hit,
                deduplicated = response.deduplicated,
                "Request completed"
            ),
            Err(e) if e.is_client_error() => {
                info!(state = e.terminal_state(), error = %e, "Request rejected")
            }
            Err(e) => warn!(state = e.terminal_state(), error = %e, "Request failed"),
        }
        result
    }

    async fn run(&self, task_id: &str, request: ImageRequest) -> Result<ImageResult, Error> {
        let resolved = self.registry.resolve(request.model.as_deref())?;
        let model = resolved.descriptor;
        Span::current().record("model", model.model_id.as_str());

        if !model.supports_operation(request.operation) {
            return Err(Error::unsupported(&model.model_id, request.operation.as_str()));
        }
        let canonical = CanonicalRequest::build(&request, &model, &self.config.images)
            .map_err(validation_failure)?;

        let fingerprint = Fingerprint::of(&canonical);
        Span::current().record("fingerprint", fingerprint.short().as_str());
        debug!(state = "fingerprinted", "Request fingerprinted");

        let store = self.store.clone();
        let load = move |entry: CacheEntry| async move { load_cached(&store, entry).await };

        let job = BuildJob {
            adapter: resolved.adapter,
            model,
            request: canonical,
            store: self.store.clone(),
            task_id: task_id.to_string(),
            fingerprint,
        };
        let build = move || job.run();

        debug!(state = "cache_check", "Checking cache");
        let (outcome, resolution) = self.cache.get_or_build(fingerprint, load, build).await?;
        Ok(self.respond(task_id, &outcome, resolution))
    }

    fn respond(
        &self,
        task_id: &str,
        outcome: &ImageOutcome,
        resolution: Resolution,
    ) -> ImageResult {
        let (image_id, image_url, resource_reference, durability) = match &outcome.artifact {
            Some(meta) => {
                let url = self.config.public_image_url(&meta.image_id).unwrap_or_else(|| {
                    let path = self.store.base_path().join(&meta.file_info.relative_path);
                    format!("file://{}", path.display())
                });
                (
                    Some(meta.image_id.clone()),
                    Some(url),
                    Some(format!("{IMAGE_RESOURCE_SCHEME}{}", meta.image_id)),
                    Durability::Persisted,
                )
            }
            None => (None, None, None, Durability::NotPersisted),
        };

        ImageResult {
            task_id: task_id.to_string(),
            image_id,
            image_data: BASE64.encode(&outcome.bytes),
            mime_type: outcome.format.mime_type().to_string(),
            image_url,
            resource_reference,
            metadata: ResultMetadata {
                created_at: outcome.artifact.as_ref().map(|m| m.created_at),
                file_info: outcome.artifact.as_ref().map(|m| m.file_info.clone()),
                details: outcome.details.clone(),
            },
            cache_hit: resolution == Resolution::CacheHit,
            deduplicated: resolution == Resolution::Joined,
            durability,
            storage_error: outcome.storage_error.clone(),
        }
    }

    /// Registry listing with live availability.
    pub fn list_available_models(&self) -> ModelListing {
        self.registry.list_models()
    }

    /// One descriptor and whether its provider is currently enabled.
    pub fn model_info(&self, name: &str) -> Option<(Arc<ModelCapabilityDescriptor>, bool)> {
        self.registry.descriptor(name)
    }

    /// A stored image and its metadata.
    pub async fn get_image(&self, image_id: &str) -> Result<(Vec<u8>, ArtifactMetadata), Error> {
        Ok(self.store.get(image_id).await?)
    }

    /// Newest-first metadata from the last `days` days.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` when `limit` is outside `1..=100` or
    /// `days` outside `1..=365`.
    pub async fn recent_images(
        &self,
        limit: usize,
        days: u32,
    ) -> Result<Vec<ArtifactMetadata>, Error> {
        if !(1..=100).contains(&limit) {
            return Err(Error::validation(
                "limit",
                format!("limit {limit} must be between 1 and 100"),
            ));
        }
        if !(1..=MAX_HISTORY_DAYS).contains(&days) {
            return Err(Error::validation(
                "days",
                format!("days {days} must be between 1 and {MAX_HISTORY_DAYS}"),
            ));
        }
        let since = Utc::now() - chrono::Duration::days(i64::from(days));
        Ok(self.store.list_recent(limit, Some(since)).await?)
    }

    pub async fn storage_stats(&self) -> Result<StorageStats, Error> {
        Ok(self.store.stats().await?)
    }
}

/// Everything a cache miss needs, moved into the build task.
struct BuildJob {
    adapter: Arc<dyn ProviderAdapter>,
    model: Arc<ModelCapabilityDescriptor>,
    request: CanonicalRequest,
    store: Arc<ArtifactStore>,
    task_id: String,
    fingerprint: Fingerprint,
}

impl BuildJob {
    async fn run(self) -> Result<Arc<ImageOutcome>, Error> {
        debug!(state = "calling_provider", provider = self.adapter.id(), "Calling provider");
        let raw = dispatch(self.adapter.as_ref(), &self.request, &self.model).await?;

        debug!(state = "persisting", bytes = raw.bytes.len(), "Persisting image");
        let parameters = resolve_parameters(self.adapter.kind(), &self.request, &raw.reported);
        let format = raw
            .mime_type
            .as_deref()
            .and_then(OutputFormat::from_mime)
            .unwrap_or(parameters.output_format);
        let images = 1;
        let cost = self.model.pricing.estimate(&self.request.prompt, images, raw.usage.as_ref());
        let details = GenerationDetails {
            operation: self.request.operation,
            prompt: self.request.prompt.clone(),
            model: self.model.model_id.clone(),
            provider: self.adapter.id().to_string(),
            parameters,
            cost: Some(cost),
            usage: raw.usage,
            provider_request_id: raw.request_id,
            revised_prompt: raw.revised_prompt,
            has_mask: self.request.mask.is_some(),
            fingerprint: self.fingerprint.to_hex(),
        };

        let stored = self
            .store
            .put(&raw.bytes, format, &self.task_id, details.clone())
            .await;
        let outcome = match stored {
            Ok(meta) => {
                debug!(state = "caching", image_id = %meta.image_id, "Recording result");
                ImageOutcome {
                    bytes: raw.bytes,
                    format,
                    details,
                    artifact: Some(meta),
                    storage_error: None,
                }
            }
            Err(e) => {
                error!(
                    task_id = %self.task_id,
                    durability = "not_persisted",
                    error = %e,
                    "Generated image could not be stored; returning it unpersisted"
                );
                ImageOutcome {
                    bytes: raw.bytes,
                    format,
                    details,
                    artifact: None,
                    storage_error: Some(e.to_string()),
                }
            }
        };
        Ok(Arc::new(outcome))
    }
}

/// Turn a cache entry back into an outcome. `None` when the artifact is gone.
async fn load_cached(store: &ArtifactStore, entry: CacheEntry) -> Option<Arc<ImageOutcome>> {
    match store.get(&entry.artifact.image_id).await {
        Ok((bytes, meta)) => Some(Arc::new(ImageOutcome {
            bytes,
            format: meta.file_info.format,
            details: meta.details.clone(),
            artifact: Some(meta),
            storage_error: None,
        })),
        Err(StorageError::NotFound(_)) => None,
        Err(e) => {
            warn!(
                image_id = %entry.artifact.image_id,
                error = %e,
                "Cached artifact unreadable, rebuilding"
            );
            None
        }
    }
}

/// The model catalog: descriptor files when `MODELS_DIR` is set, otherwise
/// the built-in models.
pub fn load_catalog(config: &Config) -> Result<Vec<ModelCapabilityDescriptor>, Error> {
    match &config.models_dir {
        Some(dir) => {
            let models = load_model_dir(dir)?;
            info!(dir = %dir.display(), count = models.len(), "Loaded model descriptors");
            Ok(models)
        }
        None => Ok(builtin_models()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ProviderKind, RawResult, ReportedParameters, RetryPolicy};
    use async_trait::async_trait;
    use imagegen_mcp_common::error::ProviderError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    struct CountingAdapter {
        calls: AtomicUsize,
        retry: RetryPolicy,
    }

    #[async_trait]
    impl ProviderAdapter for CountingAdapter {
        fn id(&self) -> &str {
            "openai"
        }
        fn kind(&self) -> ProviderKind {
            ProviderKind::OpenAi
        }
        fn retry_policy(&self) -> &RetryPolicy {
            &self.retry
        }
        async fn generate(
            &self,
            request: &CanonicalRequest,
            _model: &ModelCapabilityDescriptor,
        ) -> Result<RawResult, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RawResult {
                bytes: request.prompt.as_bytes().to_vec(),
                mime_type: Some("image/png".to_string()),
                request_id: Some("req_123".to_string()),
                reported: ReportedParameters {
                    size: Some("1024x1024".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            })
        }
        async fn edit(
            &self,
            request: &CanonicalRequest,
            model: &ModelCapabilityDescriptor,
        ) -> Result<RawResult, ProviderError> {
            self.generate(request, model).await
        }
    }

    fn config(dir: &TempDir, base_host: Option<&str>) -> Config {
        let mut vars: HashMap<&str, String> = HashMap::new();
        vars.insert("STORAGE__BASE_PATH", dir.path().display().to_string());
        if let Some(host) = base_host {
            vars.insert("IMAGES__BASE_HOST", host.to_string());
        }
        Config::from_lookup(|key| vars.get(key).cloned()).unwrap()
    }

    async fn handler(
        dir: &TempDir,
        base_host: Option<&str>,
    ) -> (ImageHandler, Arc<CountingAdapter>) {
        let config = config(dir, base_host);
        let adapter = Arc::new(CountingAdapter {
            calls: AtomicUsize::new(0),
            retry: RetryPolicy::none(),
        });
        let mut registry = ProviderRegistry::new(config.images.default_model.clone());
        let models = builtin_models()
            .into_iter()
            .filter(|m| m.provider_id == "openai")
            .collect();
        registry.register(adapter.clone(), models, true).unwrap();
        let store = ArtifactStore::open(&config.storage).await.unwrap();
        let cache = RequestCache::new(
            Some(Arc::new(crate::cache::MemoryBackend::new(1024 * 1024))),
            Duration::from_secs(60),
        );
        let handler = ImageHandler::new(
            Arc::new(config),
            Arc::new(registry),
            Arc::new(cache),
            Arc::new(store),
        );
        (handler, adapter)
    }

    #[tokio::test]
    async fn test_generate_persists_and_describes_the_artifact() {
        let dir = TempDir::new().unwrap();
        let (handler, adapter) = handler(&dir, None).await;

        let result = handler.generate_image(ImageRequest::generate("a lighthouse")).await.unwrap();
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.durability, Durability::Persisted);
        assert!(!result.cache_hit);
        let image_id = result.image_id.clone().unwrap();
        assert_eq!(
            result.resource_reference.as_deref(),
            Some(format!("generated-images://{image_id}").as_str())
        );
        assert!(result.image_url.as_deref().unwrap().starts_with("file://"));
        assert_eq!(BASE64.decode(&result.image_data).unwrap(), b"a lighthouse");
        assert_eq!(result.metadata.details.provider_request_id.as_deref(), Some("req_123"));
        assert_eq!(result.metadata.details.model, "gpt-image-1");

        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("image_data").is_none());
        assert_eq!(json["durability"], "persisted");
        assert_eq!(json["metadata"]["prompt"], "a lighthouse");
    }

    #[tokio::test]
    async fn test_base_host_sets_public_url() {
        let dir = TempDir::new().unwrap();
        let (handler, _) = handler(&dir, Some("https://img.example.com")).await;
        let result = handler.generate_image(ImageRequest::generate("a boat")).await.unwrap();
        let image_id = result.image_id.unwrap();
        assert_eq!(
            result.image_url.as_deref(),
            Some(format!("https://img.example.com/images/{image_id}").as_str())
        );
    }

    #[tokio::test]
    async fn test_second_identical_request_is_a_cache_hit() {
        let dir = TempDir::new().unwrap();
        let (handler, adapter) = handler(&dir, None).await;

        let first = handler.generate_image(ImageRequest::generate("same prompt")).await.unwrap();
        let second = handler.generate_image(ImageRequest::generate("same prompt")).await.unwrap();
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
        assert!(second.cache_hit);
        assert_eq!(first.image_id, second.image_id);
        assert_ne!(first.task_id, second.task_id);
    }

    #[tokio::test]
    async fn test_swept_artifact_is_rebuilt() {
        let dir = TempDir::new().unwrap();
        let (handler, adapter) = handler(&dir, None).await;

        let first = handler.generate_image(ImageRequest::generate("ephemeral")).await.unwrap();
        let report = handler.store().enforce_size_limit(0).await.unwrap();
        assert_eq!(report.deleted, 1);

        let second = handler.generate_image(ImageRequest::generate("ephemeral")).await.unwrap();
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
        assert!(!second.cache_hit);
        assert_ne!(first.image_id, second.image_id);
    }

    #[tokio::test]
    async fn test_history_bounds_are_validated() {
        let dir = TempDir::new().unwrap();
        let (handler, _) = handler(&dir, None).await;
        assert!(handler.recent_images(0, 7).await.unwrap_err().is_client_error());
        assert!(handler.recent_images(10, 366).await.unwrap_err().is_client_error());
        assert!(handler.recent_images(10, 7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_image_is_not_found() {
        let dir = TempDir::new().unwrap();
        let (handler, _) = handler(&dir, None).await;
        let err = handler.get_image("img_20250101000000000_0123456789ab").await.unwrap_err();
        assert!(err.is_not_found());
        let err = handler.get_image("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
