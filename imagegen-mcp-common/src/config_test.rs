//! Tests for the configuration module.
//!
//! Configuration is built through `Config::from_lookup` or from a temporary
//! env file so no test has to touch the process environment.

use crate::config::{CacheBackendKind, Config};
use crate::error::ConfigError;
use crate::params::{ImageSize, OutputFormat, Quality};
use proptest::prelude::*;
use std::collections::HashMap;
use std::time::Duration;

fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Config::from_lookup(move |key| map.get(key).cloned())
}

#[test]
fn defaults_apply_when_nothing_is_set() {
    let config = config_from(&[]).unwrap();

    assert!(config.providers.openai.api_key.is_none());
    assert!(config.providers.openai.enabled);
    assert_eq!(config.providers.openai.base_url, "https://api.openai.com/v1");
    assert_eq!(config.providers.openai.max_retries, 3);
    assert!(!config.providers.gemini.enabled);
    assert_eq!(config.providers.gemini.location, "us-central1");
    assert_eq!(
        config.providers.gemini.base_url,
        "https://us-central1-aiplatform.googleapis.com/v1"
    );
    assert_eq!(config.providers.gemini.timeout, Duration::from_secs(300));

    assert_eq!(config.images.default_model, "gpt-image-1");
    assert_eq!(config.images.size, ImageSize::Landscape);
    assert_eq!(config.images.quality, Quality::Auto);
    assert_eq!(config.images.output_format, OutputFormat::Png);

    assert_eq!(config.storage.retention_days, 30);
    assert_eq!(config.storage.cleanup_interval_hours, 24);
    assert_eq!(config.cache.backend, CacheBackendKind::Memory);
    assert_eq!(config.cache.ttl, Duration::from_secs(24 * 3600));
    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.server.port, 3001);
    assert!(config.models_dir.is_none());
}

#[test]
fn nested_keys_override_defaults() {
    let config = config_from(&[
        ("PROVIDERS__OPENAI__API_KEY", "sk-abc"),
        ("PROVIDERS__OPENAI__BASE_URL", "http://localhost:9000/v1/"),
        ("PROVIDERS__GEMINI__ENABLED", "true"),
        ("PROVIDERS__GEMINI__LOCATION", "europe-west4"),
        ("PROVIDERS__GEMINI__PROJECT_ID", "my-project"),
        ("IMAGES__DEFAULT_MODEL", "imagen-4"),
        ("IMAGES__DEFAULT_SIZE", "square"),
        ("IMAGES__DEFAULT_OUTPUT_FORMAT", "jpg"),
        ("STORAGE__BASE_PATH", "/data/images"),
        ("CACHE__TTL_HOURS", "0.5"),
        ("SERVER__PORT", "8080"),
    ])
    .unwrap();

    assert_eq!(config.providers.openai.api_key.as_ref().unwrap().expose(), "sk-abc");
    assert_eq!(config.providers.openai.base_url, "http://localhost:9000/v1");
    assert!(config.providers.gemini.enabled);
    assert_eq!(
        config.providers.gemini.base_url,
        "https://europe-west4-aiplatform.googleapis.com/v1"
    );
    assert_eq!(config.providers.gemini.project_id.as_deref(), Some("my-project"));
    assert_eq!(config.images.default_model, "imagen-4");
    assert_eq!(config.images.size, ImageSize::Square);
    assert_eq!(config.images.output_format, OutputFormat::Jpeg);
    assert_eq!(config.storage.base_path.to_str(), Some("/data/images"));
    assert_eq!(config.cache.ttl, Duration::from_secs(1800));
    assert_eq!(config.server.port, 8080);
}

#[test]
fn reload_sees_edited_env_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".env");

    std::fs::write(
        &path,
        "PROVIDERS__OPENAI__API_KEY=sk-test\nPROVIDERS__OPENAI__ENABLED=true\n",
    )
    .unwrap();
    let first = Config::reload_from_path(&path).unwrap();
    assert!(first.providers.openai.enabled);

    std::fs::write(
        &path,
        "PROVIDERS__OPENAI__API_KEY=sk-test\nPROVIDERS__OPENAI__ENABLED=false\n",
    )
    .unwrap();
    let second = Config::reload_from_path(&path).unwrap();
    assert!(!second.providers.openai.enabled);
    assert!(!second.provider_enabled("openai"));
}

#[test]
fn reload_reports_unreadable_env_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::reload_from_path(dir.path().join("missing.env")).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue(..)));
}

#[test]
fn api_key_is_redacted_in_debug_output() {
    let config = config_from(&[("PROVIDERS__OPENAI__API_KEY", "sk-very-secret")]).unwrap();
    let debug = format!("{:?}", config);
    assert!(!debug.contains("sk-very-secret"));
    assert!(debug.contains("***"));
}

#[test]
fn invalid_values_name_the_key() {
    let cases = [
        ("STORAGE__RETENTION_DAYS", "0"),
        ("STORAGE__RETENTION_DAYS", "thirty"),
        ("PROVIDERS__OPENAI__TIMEOUT", "0"),
        ("PROVIDERS__OPENAI__BASE_URL", "ftp://example.com"),
        ("PROVIDERS__GEMINI__ENABLED", "maybe"),
        ("IMAGES__DEFAULT_QUALITY", "ultra"),
        ("CACHE__BACKEND", "memcached"),
        ("SERVER__PORT", "70000"),
    ];
    for (key, value) in cases {
        let err = config_from(&[(key, value)]).unwrap_err();
        assert!(err.to_string().contains(key), "{key}={value} gave {err}");
    }
}

#[test]
fn redis_backend_requires_url() {
    let err = config_from(&[("CACHE__BACKEND", "redis")]).unwrap_err();
    assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "CACHE__REDIS_URL"));

    let config = config_from(&[
        ("CACHE__BACKEND", "redis"),
        ("CACHE__REDIS_URL", "redis://localhost:6379"),
    ])
    .unwrap();
    assert_eq!(config.cache.backend, CacheBackendKind::Redis);

    // A disabled cache never connects, so the URL is not needed.
    assert!(config_from(&[("CACHE__BACKEND", "redis"), ("CACHE__ENABLED", "false")]).is_ok());
}

#[test]
fn provider_enabled_follows_flags() {
    let config = config_from(&[
        ("PROVIDERS__OPENAI__ENABLED", "off"),
        ("PROVIDERS__GEMINI__ENABLED", "1"),
    ])
    .unwrap();
    assert!(!config.provider_enabled("openai"));
    assert!(config.provider_enabled("gemini"));
    assert!(!config.provider_enabled("stability"));
}

#[test]
fn public_image_url_uses_base_host() {
    let config = config_from(&[("IMAGES__BASE_HOST", "https://cdn.example.com/")]).unwrap();
    assert_eq!(
        config.public_image_url("img_20250102030405006_0123456789ab").as_deref(),
        Some("https://cdn.example.com/images/img_20250102030405006_0123456789ab")
    );
    assert!(config_from(&[]).unwrap().public_image_url("img_x").is_none());
}

#[test]
fn storage_helpers() {
    let config = config_from(&[
        ("STORAGE__RETENTION_DAYS", "2"),
        ("STORAGE__MAX_SIZE_GB", "0.5"),
        ("STORAGE__CLEANUP_INTERVAL_HOURS", "6"),
    ])
    .unwrap();
    assert_eq!(config.storage.retention(), Duration::from_secs(2 * 86400));
    assert_eq!(config.storage.max_size_bytes(), 512 * 1024 * 1024);
    assert_eq!(config.storage.cleanup_interval(), Duration::from_secs(6 * 3600));
}

proptest! {
    /// Any valid port round-trips through configuration.
    #[test]
    fn port_round_trips(port in 1u16..=u16::MAX) {
        let port_str = port.to_string();
        let config = config_from(&[("SERVER__PORT", port_str.as_str())]).unwrap();
        prop_assert_eq!(config.server.port, port);
    }

    /// Any positive retention window is accepted and used verbatim.
    #[test]
    fn retention_days_round_trip(days in 1u32..3650) {
        let days_str = days.to_string();
        let config = config_from(&[("STORAGE__RETENTION_DAYS", days_str.as_str())]).unwrap();
        prop_assert_eq!(config.storage.retention_days, days);
    }

    /// Surrounding whitespace and empty values never change the outcome.
    #[test]
    fn blank_values_fall_back_to_defaults(spaces in " {0,5}") {
        let config = config_from(&[("SERVER__HOST", spaces.as_str())]).unwrap();
        prop_assert_eq!(config.server.host, "127.0.0.1");
    }
}
