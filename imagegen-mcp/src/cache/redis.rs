//! Redis cache backend. Entries are JSON values with a server-side TTL.

use super::{CacheBackend, CacheEntry};
use crate::fingerprint::Fingerprint;
use ::redis::aio::ConnectionManager;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imagegen_mcp_common::error::CacheError;
use tracing::info;

const KEY_PREFIX: &str = "imagegen:cache:";

fn backend_error(e: ::redis::RedisError) -> CacheError {
    CacheError::backend("redis", e.to_string())
}

pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    /// Connect to the redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = ::redis::Client::open(url).map_err(backend_error)?;
        let conn = ConnectionManager::new(client).await.map_err(backend_error)?;
        info!("Connected to redis cache backend");
        Ok(Self { conn })
    }

    fn key(fingerprint: &Fingerprint) -> String {
        format!("{KEY_PREFIX}{fingerprint}")
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = ::redis::cmd("GET")
            .arg(Self::key(key))
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let entry: CacheEntry =
            serde_json::from_str(&raw).map_err(|e| CacheError::Decode(e.to_string()))?;
        Ok((!entry.is_expired_at(Utc::now())).then_some(entry))
    }

    async fn put(&self, key: &Fingerprint, entry: &CacheEntry) -> Result<(), CacheError> {
        let ttl_secs = (entry.expires_at - Utc::now()).num_seconds();
        if ttl_secs <= 0 {
            return Ok(());
        }
        let value = serde_json::to_string(entry).map_err(|e| CacheError::Decode(e.to_string()))?;
        let mut conn = self.conn.clone();
        ::redis::cmd("SET")
            .arg(Self::key(key))
            .arg(value)
            .arg("EX")
            .arg(ttl_secs)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(backend_error)
    }

    async fn remove(&self, key: &Fingerprint) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        ::redis::cmd("DEL")
            .arg(Self::key(key))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(backend_error)
    }

    async fn evict_expired(&self, _now: DateTime<Utc>) -> Result<usize, CacheError> {
        // Redis expires keys on its own.
        Ok(0)
    }
}
