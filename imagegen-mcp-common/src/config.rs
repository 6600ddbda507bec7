//! Configuration module for loading environment variables and settings.
//!
//! Keys are nested with a double underscore (`PROVIDERS__OPENAI__API_KEY`,
//! `STORAGE__RETENTION_DAYS`). The loaded [`Config`] is immutable and shared
//! behind an `Arc`; a reload builds a fresh value.

use crate::error::ConfigError;
use crate::models::{GEMINI_PROVIDER, GPT_IMAGE_1, OPENAI_PROVIDER};
use crate::params::{Background, ImageSize, Moderation, OutputFormat, Quality, Style};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// A credential that never shows up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// OpenAI-style provider settings.
#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub api_key: Option<Secret>,
    pub organization: Option<String>,
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub enabled: bool,
}

/// Imagen-style (Vertex AI) provider settings.
#[derive(Debug, Clone)]
pub struct GeminiSettings {
    /// Path to a service account JSON file, or `adc` for Application Default Credentials
    pub credentials: Option<String>,
    pub project_id: Option<String>,
    pub location: String,
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct ProvidersConfig {
    pub openai: OpenAiSettings,
    pub gemini: GeminiSettings,
}

/// Defaults applied to requests that leave a parameter unset.
#[derive(Debug, Clone)]
pub struct ImageDefaults {
    pub default_model: String,
    pub quality: Quality,
    pub size: ImageSize,
    pub style: Style,
    pub moderation: Moderation,
    pub output_format: OutputFormat,
    pub background: Background,
    /// Public base URL that serves the storage directory, if any
    pub base_host: Option<String>,
}

/// Artifact store settings.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub base_path: PathBuf,
    pub retention_days: u32,
    pub max_size_gb: f64,
    pub cleanup_interval_hours: u64,
}

impl StorageConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_hours * 60 * 60)
    }

    pub fn max_size_bytes(&self) -> u64 {
        (self.max_size_gb * 1024.0 * 1024.0 * 1024.0) as u64
    }
}

/// Cache backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackendKind {
    Memory,
    Redis,
}

impl FromStr for CacheBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(CacheBackendKind::Memory),
            "redis" => Ok(CacheBackendKind::Redis),
            other => Err(format!("unknown cache backend '{other}'. Valid options: memory, redis")),
        }
    }
}

impl fmt::Display for CacheBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheBackendKind::Memory => write!(f, "memory"),
            CacheBackendKind::Redis => write!(f, "redis"),
        }
    }
}

/// Request cache settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl: Duration,
    pub backend: CacheBackendKind,
    pub max_size_mb: u64,
    pub redis_url: Option<Secret>,
}

/// Server identity and network settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub providers: ProvidersConfig,
    pub images: ImageDefaults,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub server: ServerConfig,
    /// Directory of model definition files; the built-in catalog is used when unset
    pub models_dir: Option<PathBuf>,
}

/// Reads `__`-nested keys through a lookup function.
struct Source<F> {
    lookup: F,
}

impl<F> Source<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.string(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|e: T::Err| ConfigError::invalid_value(key, e.to_string())),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.string(key).map(|v| v.to_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::invalid_value(key, format!("'{v}' is not a boolean"))),
            },
        }
    }

    fn seconds(&self, key: &str, default: u64) -> Result<Duration, ConfigError> {
        let secs: f64 = self.parse(key, default as f64)?;
        if !(secs > 0.0 && secs.is_finite()) {
            return Err(ConfigError::invalid_value(key, "must be greater than zero"));
        }
        Ok(Duration::from_secs_f64(secs))
    }

    fn url(&self, key: &str, default: &str) -> Result<String, ConfigError> {
        let url = self.string_or(key, default);
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::invalid_value(key, "must start with http:// or https://"));
        }
        Ok(url.trim_end_matches('/').to_string())
    }
}

impl Config {
    /// Load configuration from environment variables and .env file.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidValue` if any variable fails to parse or validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Re-read configuration after startup.
    ///
    /// Values in `.env` take precedence over the process environment, so an
    /// edited file is picked up even though the first load already exported
    /// its old values. The process environment itself is left untouched.
    pub fn reload_from_env() -> Result<Self, ConfigError> {
        match dotenvy::dotenv_iter() {
            Ok(entries) => Self::overlay(entries, ".env"),
            Err(e) if e.not_found() => Self::from_lookup(|key| std::env::var(key).ok()),
            Err(e) => Err(ConfigError::invalid_value(".env", e.to_string())),
        }
    }

    /// [`Config::reload_from_env`] reading an explicit env file.
    pub fn reload_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let origin = path.display().to_string();
        let entries = dotenvy::from_path_iter(path)
            .map_err(|e| ConfigError::invalid_value(origin.clone(), e.to_string()))?;
        Self::overlay(entries, &origin)
    }

    fn overlay<R: std::io::Read>(
        entries: dotenvy::Iter<R>,
        origin: &str,
    ) -> Result<Self, ConfigError> {
        let file: HashMap<String, String> = entries
            .collect::<Result<_, _>>()
            .map_err(|e| ConfigError::invalid_value(origin, e.to_string()))?;
        Self::from_lookup(move |key| file.get(key).cloned().or_else(|| std::env::var(key).ok()))
    }

    /// Build configuration from an arbitrary key lookup.
    ///
    /// # Example
    ///
    /// ```
    /// use imagegen_mcp_common::config::Config;
    ///
    /// let config = Config::from_lookup(|key| match key {
    ///     "PROVIDERS__OPENAI__API_KEY" => Some("sk-test".to_string()),
    ///     "STORAGE__RETENTION_DAYS" => Some("7".to_string()),
    ///     _ => None,
    /// })
    /// .unwrap();
    /// assert_eq!(config.storage.retention_days, 7);
    /// assert!(config.providers.openai.api_key.is_some());
    /// ```
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let src = Source { lookup };

        let openai = OpenAiSettings {
            api_key: src.string("PROVIDERS__OPENAI__API_KEY").map(Secret::new),
            organization: src.string("PROVIDERS__OPENAI__ORGANIZATION"),
            base_url: src.url("PROVIDERS__OPENAI__BASE_URL", "https://api.openai.com/v1")?,
            timeout: src.seconds("PROVIDERS__OPENAI__TIMEOUT", 120)?,
            max_retries: src.parse("PROVIDERS__OPENAI__MAX_RETRIES", 3)?,
            enabled: src.flag("PROVIDERS__OPENAI__ENABLED", true)?,
        };

        let location = src.string_or("PROVIDERS__GEMINI__LOCATION", "us-central1");
        let gemini = GeminiSettings {
            credentials: src.string("PROVIDERS__GEMINI__API_KEY"),
            project_id: src.string("PROVIDERS__GEMINI__PROJECT_ID"),
            base_url: src.url(
                "PROVIDERS__GEMINI__BASE_URL",
                &format!("https://{location}-aiplatform.googleapis.com/v1"),
            )?,
            location,
            timeout: src.seconds("PROVIDERS__GEMINI__TIMEOUT", 300)?,
            max_retries: src.parse("PROVIDERS__GEMINI__MAX_RETRIES", 3)?,
            enabled: src.flag("PROVIDERS__GEMINI__ENABLED", false)?,
        };

        let images = ImageDefaults {
            default_model: src.string_or("IMAGES__DEFAULT_MODEL", GPT_IMAGE_1),
            quality: src.parse("IMAGES__DEFAULT_QUALITY", Quality::Auto)?,
            size: src.parse("IMAGES__DEFAULT_SIZE", ImageSize::Landscape)?,
            style: src.parse("IMAGES__DEFAULT_STYLE", Style::Vivid)?,
            moderation: src.parse("IMAGES__DEFAULT_MODERATION", Moderation::Auto)?,
            output_format: src.parse("IMAGES__DEFAULT_OUTPUT_FORMAT", OutputFormat::Png)?,
            background: src.parse("IMAGES__DEFAULT_BACKGROUND", Background::Auto)?,
            base_host: src
                .string("IMAGES__BASE_HOST")
                .map(|h| h.trim_end_matches('/').to_string()),
        };

        let storage = StorageConfig {
            base_path: PathBuf::from(src.string_or("STORAGE__BASE_PATH", "./storage")),
            retention_days: src.parse("STORAGE__RETENTION_DAYS", 30)?,
            max_size_gb: src.parse("STORAGE__MAX_SIZE_GB", 10.0)?,
            cleanup_interval_hours: src.parse("STORAGE__CLEANUP_INTERVAL_HOURS", 24)?,
        };
        if storage.retention_days == 0 {
            return Err(ConfigError::invalid_value("STORAGE__RETENTION_DAYS", "must be at least 1"));
        }
        if !(storage.max_size_gb > 0.0) {
            return Err(ConfigError::invalid_value(
                "STORAGE__MAX_SIZE_GB",
                "must be greater than zero",
            ));
        }
        if storage.cleanup_interval_hours == 0 {
            return Err(ConfigError::invalid_value(
                "STORAGE__CLEANUP_INTERVAL_HOURS",
                "must be at least 1",
            ));
        }

        let ttl_hours: f64 = src.parse("CACHE__TTL_HOURS", 24.0)?;
        if !(ttl_hours > 0.0 && ttl_hours.is_finite()) {
            return Err(ConfigError::invalid_value("CACHE__TTL_HOURS", "must be greater than zero"));
        }
        let cache = CacheConfig {
            enabled: src.flag("CACHE__ENABLED", true)?,
            ttl: Duration::from_secs_f64(ttl_hours * 3600.0),
            backend: src.parse("CACHE__BACKEND", CacheBackendKind::Memory)?,
            max_size_mb: src.parse("CACHE__MAX_SIZE_MB", 500)?,
            redis_url: src.string("CACHE__REDIS_URL").map(Secret::new),
        };
        if cache.enabled && cache.backend == CacheBackendKind::Redis && cache.redis_url.is_none() {
            return Err(ConfigError::missing_env_var("CACHE__REDIS_URL"));
        }

        let server = ServerConfig {
            name: src.string_or("SERVER__NAME", "imagegen-mcp"),
            version: src.string_or("SERVER__VERSION", env!("CARGO_PKG_VERSION")),
            host: src.string_or("SERVER__HOST", "127.0.0.1"),
            port: src.parse("SERVER__PORT", 3001)?,
            log_level: src.string_or("SERVER__LOG_LEVEL", "info"),
        };

        Ok(Self {
            providers: ProvidersConfig { openai, gemini },
            images,
            storage,
            cache,
            server,
            models_dir: src.string("MODELS_DIR").map(PathBuf::from),
        })
    }

    /// Whether a provider is switched on in this configuration.
    pub fn provider_enabled(&self, provider_id: &str) -> bool {
        match provider_id {
            OPENAI_PROVIDER => self.providers.openai.enabled,
            GEMINI_PROVIDER => self.providers.gemini.enabled,
            _ => false,
        }
    }

    /// Public URL for a stored image, when a base host is configured.
    ///
    /// The URL points at the `/images/{image_id}` route of the HTTP transport.
    pub fn public_image_url(&self, image_id: &str) -> Option<String> {
        self.images
            .base_host
            .as_ref()
            .map(|host| format!("{host}/images/{image_id}"))
    }
}
