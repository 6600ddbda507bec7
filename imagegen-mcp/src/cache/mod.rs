//! Request cache with in-flight deduplication.
//!
//! Completed results are remembered by fingerprint as references to stored
//! artifacts (never image bytes). While a result is being produced, every
//! other request with the same fingerprint joins the same build instead of
//! calling the provider again.
//!
//! Backend failures are logged and treated as misses; they never fail a
//! request.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use imagegen_mcp_common::config::{CacheBackendKind, CacheConfig};
use imagegen_mcp_common::error::{CacheError, Error};
use imagegen_mcp_common::params::OutputFormat;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

pub use memory::MemoryBackend;

/// Reference to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub image_id: String,
    pub format: OutputFormat,
}

/// A remembered result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub artifact: ArtifactRef,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(artifact: ArtifactRef, created_at: DateTime<Utc>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            artifact,
            created_at,
            expires_at: created_at.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Storage for cache entries.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Backend name for logs ("memory", "redis").
    fn name(&self) -> &'static str;

    /// Fetch an entry. Expired entries are never returned.
    async fn get(&self, key: &Fingerprint) -> Result<Option<CacheEntry>, CacheError>;

    async fn put(&self, key: &Fingerprint, entry: &CacheEntry) -> Result<(), CacheError>;

    async fn remove(&self, key: &Fingerprint) -> Result<(), CacheError>;

    /// Drop every entry expired at `now`, returning how many were removed.
    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize, CacheError>;
}

/// Build output that may reference a stored artifact.
pub trait CacheableOutput: Clone + Send + Sync + 'static {
    /// The artifact to remember, or `None` if the result was not persisted.
    fn artifact_ref(&self) -> Option<ArtifactRef>;
}

/// How a result was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Loaded from a remembered artifact
    CacheHit,
    /// Produced by this request
    Built,
    /// Produced by a concurrent request with the same fingerprint
    Joined,
}

type SharedBuild<T> = Shared<BoxFuture<'static, Result<(T, bool), Arc<Error>>>>;

/// Fingerprint-keyed cache with in-flight coalescing.
pub struct RequestCache<T: CacheableOutput> {
    backend: Option<Arc<dyn CacheBackend>>,
    ttl: Duration,
    inflight: Arc<Mutex<HashMap<Fingerprint, SharedBuild<T>>>>,
}

impl<T: CacheableOutput> RequestCache<T> {
    /// Create a cache over `backend`. `None` disables remembering results;
    /// in-flight coalescing still applies.
    pub fn new(backend: Option<Arc<dyn CacheBackend>>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, Duration::ZERO)
    }

    /// Build the cache described by configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cache` if the redis backend is selected but cannot
    /// be reached, or was not compiled in.
    pub async fn from_config(config: &CacheConfig) -> Result<Self, Error> {
        if !config.enabled {
            return Ok(Self::disabled());
        }
        let backend: Arc<dyn CacheBackend> = match config.backend {
            CacheBackendKind::Memory => {
                Arc::new(MemoryBackend::new(config.max_size_mb * 1024 * 1024))
            }
            #[cfg(feature = "redis")]
            CacheBackendKind::Redis => {
                let url = config
                    .redis_url
                    .as_ref()
                    .ok_or_else(|| CacheError::backend("redis", "CACHE__REDIS_URL is not set"))?;
                Arc::new(self::redis::RedisBackend::connect(url.expose()).await?)
            }
            #[cfg(not(feature = "redis"))]
            CacheBackendKind::Redis => {
                return Err(
                    CacheError::backend("redis", "built without the `redis` feature").into(),
                );
            }
        };
        Ok(Self::new(Some(backend), config.ttl))
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn backend_name(&self) -> Option<&'static str> {
        self.backend.as_ref().map(|b| b.name())
    }

    /// Number of builds currently in flight.
    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Look up a remembered result. Backend errors are reported as misses.
    pub async fn lookup(&self, key: &Fingerprint) -> Option<CacheEntry> {
        lookup(self.backend.as_deref(), key).await
    }

    /// Remember `artifact` under `key`. Call only once the artifact is
    /// durably stored.
    pub async fn record(&self, key: &Fingerprint, artifact: ArtifactRef) {
        record(self.backend.as_deref(), key, artifact, self.ttl).await;
    }

    /// Forget a remembered result.
    pub async fn invalidate(&self, key: &Fingerprint) {
        invalidate(self.backend.as_deref(), key).await;
    }

    /// Drop expired entries from the backend.
    pub async fn evict_expired(&self) -> usize {
        let Some(backend) = &self.backend else {
            return 0;
        };
        match backend.evict_expired(Utc::now()).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(backend = backend.name(), error = %e, "Cache eviction failed");
                0
            }
        }
    }

    /// Return the remembered result for `key`, or build it exactly once.
    ///
    /// The lookup and the build run in one spawned task registered under
    /// `key` before either starts, so concurrent callers with the same key
    /// share a single provider call. The task finishes (and records the
    /// result) even if every caller goes away. `load` turns a remembered
    /// entry back into output, returning `None` when the artifact is gone.
    ///
    /// # Errors
    ///
    /// Returns the build error. Joined callers receive the same error.
    pub async fn get_or_build<L, LFut, B, BFut>(
        &self,
        key: Fingerprint,
        load: L,
        build: B,
    ) -> Result<(T, Resolution), Error>
    where
        L: FnOnce(CacheEntry) -> LFut + Send + 'static,
        LFut: Future<Output = Option<T>> + Send + 'static,
        B: FnOnce() -> BFut + Send + 'static,
        BFut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let (shared, joined) = {
            let mut inflight = self
                .inflight
                .lock()
                .map_err(|_| Error::internal("in-flight map poisoned"))?;
            match inflight.get(&key) {
                Some(existing) => (existing.clone(), true),
                None => {
                    let shared = self.spawn_build(key, load, build);
                    inflight.insert(key, shared.clone());
                    (shared, false)
                }
            }
        };

        if joined {
            debug!(fingerprint = %key.short(), "Joining in-flight build");
        }

        match shared.await {
            Ok((value, true)) => Ok((value, Resolution::CacheHit)),
            Ok((value, false)) if joined => Ok((value, Resolution::Joined)),
            Ok((value, false)) => Ok((value, Resolution::Built)),
            Err(e) => Err(Error::from_shared(e)),
        }
    }

    fn spawn_build<L, LFut, B, BFut>(&self, key: Fingerprint, load: L, build: B) -> SharedBuild<T>
    where
        L: FnOnce(CacheEntry) -> LFut + Send + 'static,
        LFut: Future<Output = Option<T>> + Send + 'static,
        B: FnOnce() -> BFut + Send + 'static,
        BFut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let backend = self.backend.clone();
        let inflight = self.inflight.clone();
        let ttl = self.ttl;

        let task = tokio::spawn(async move {
            let outcome: Result<(T, bool), Error> = async {
                if let Some(entry) = lookup(backend.as_deref(), &key).await {
                    if let Some(value) = load(entry).await {
                        debug!(fingerprint = %key.short(), "Cache hit");
                        return Ok((value, true));
                    }
                    debug!(fingerprint = %key.short(), "Cached artifact is gone, rebuilding");
                    invalidate(backend.as_deref(), &key).await;
                }

                let value = build().await?;
                if let Some(artifact) = value.artifact_ref() {
                    record(backend.as_deref(), &key, artifact, ttl).await;
                }
                Ok((value, false))
            }
            .await;

            if let Ok(mut map) = inflight.lock() {
                map.remove(&key);
            }
            outcome.map_err(Arc::new)
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(Arc::new(Error::internal(format!("build task failed: {e}")))),
            }
        }
        .boxed()
        .shared()
    }
}

async fn lookup(backend: Option<&dyn CacheBackend>, key: &Fingerprint) -> Option<CacheEntry> {
    let backend = backend?;
    match backend.get(key).await {
        Ok(entry) => entry.filter(|e| !e.is_expired_at(Utc::now())),
        Err(e) => {
            warn!(backend = backend.name(), error = %e, "Cache lookup failed, treating as miss");
            None
        }
    }
}

async fn record(
    backend: Option<&dyn CacheBackend>,
    key: &Fingerprint,
    artifact: ArtifactRef,
    ttl: Duration,
) {
    let Some(backend) = backend else { return };
    let entry = CacheEntry::new(artifact, Utc::now(), ttl);
    if let Err(e) = backend.put(key, &entry).await {
        warn!(backend = backend.name(), error = %e, "Failed to record cache entry");
    }
}

async fn invalidate(backend: Option<&dyn CacheBackend>, key: &Fingerprint) {
    if let Some(backend) = backend {
        if let Err(e) = backend.remove(key).await {
            warn!(backend = backend.name(), error = %e, "Cache invalidation failed");
        }
    }
}
