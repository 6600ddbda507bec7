//! MCP resources for the imagegen server.
//!
//! - `generated-images://{image_id}` - a stored image as a data URL plus metadata
//! - `image-history://recent[/{limit}/{days}]` - newest-first metadata
//! - `storage-stats://overview` - counters, retention policy and health
//! - `models://list` - registry listing
//! - `model-info://{model_id}` - one model descriptor

use crate::handler::{IMAGE_RESOURCE_SCHEME, ImageHandler, MAX_HISTORY_DAYS};
use crate::storage::{ArtifactMetadata, StorageStats};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use imagegen_mcp_common::error::{Error, StorageError};
use imagegen_mcp_common::models::ModelCapabilityDescriptor;
use serde::Serialize;

pub const HISTORY_URI: &str = "image-history://recent";
pub const STATS_URI: &str = "storage-stats://overview";
pub const MODELS_URI: &str = "models://list";
const HISTORY_PREFIX: &str = "image-history://recent/";
const MODEL_INFO_SCHEME: &str = "model-info://";

pub const DEFAULT_HISTORY_LIMIT: usize = 10;
pub const DEFAULT_HISTORY_DAYS: u32 = 7;

/// A parsed resource URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceUri {
    Image(String),
    History { limit: usize, days: u32 },
    Stats,
    Models,
    ModelInfo(String),
}

impl ResourceUri {
    /// Parse a resource URI.
    ///
    /// # Errors
    ///
    /// `Error::Validation` for a history URI with bad bounds,
    /// `Error::Storage(NotFound)` for anything unrecognized.
    pub fn parse(uri: &str) -> Result<Self, Error> {
        if let Some(id) = uri.strip_prefix(IMAGE_RESOURCE_SCHEME) {
            return Ok(ResourceUri::Image(id.to_string()));
        }
        if let Some(id) = uri.strip_prefix(MODEL_INFO_SCHEME) {
            return Ok(ResourceUri::ModelInfo(id.to_string()));
        }
        match uri {
            HISTORY_URI => {
                return Ok(ResourceUri::History {
                    limit: DEFAULT_HISTORY_LIMIT,
                    days: DEFAULT_HISTORY_DAYS,
                });
            }
            STATS_URI => return Ok(ResourceUri::Stats),
            MODELS_URI => return Ok(ResourceUri::Models),
            _ => {}
        }
        if let Some(rest) = uri.strip_prefix(HISTORY_PREFIX) {
            let (limit, days) = rest.split_once('/').ok_or_else(|| {
                Error::validation(
                    "uri",
                    format!("expected {HISTORY_PREFIX}{{limit}}/{{days}}, got '{uri}'"),
                )
            })?;
            let limit: usize = limit
                .parse()
                .map_err(|_| Error::validation("limit", format!("'{limit}' is not a number")))?;
            let days: u32 = days
                .parse()
                .map_err(|_| Error::validation("days", format!("'{days}' is not a number")))?;
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
            return Ok(ResourceUri::History { limit, days });
        }
        Err(StorageError::NotFound(uri.to_string()).into())
    }
}

/// Storage health by usage of the configured size limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Warning,
    Critical,
}

impl Health {
    pub fn from_usage(percent: f64) -> Self {
        if percent < 80.0 {
            Health::Healthy
        } else if percent < 95.0 {
            Health::Warning
        } else {
            Health::Critical
        }
    }
}

#[derive(Debug, Serialize)]
struct ImageResource<'a> {
    image_id: &'a str,
    data_url: String,
    metadata: &'a ArtifactMetadata,
}

#[derive(Debug, Serialize)]
struct StorageSummary {
    total_images: usize,
    total_bytes: u64,
    usage_percent: f64,
}

#[derive(Debug, Serialize)]
struct HistoryResource<'a> {
    limit: usize,
    days: u32,
    count: usize,
    images: Vec<HistoryItem<'a>>,
    storage: StorageSummary,
}

#[derive(Debug, Serialize)]
struct HistoryItem<'a> {
    resource_reference: String,
    #[serde(flatten)]
    metadata: &'a ArtifactMetadata,
}

#[derive(Debug, Serialize)]
struct RetentionPolicy {
    retention_days: u32,
    max_size_bytes: u64,
    cleanup_interval_hours: u64,
}

#[derive(Debug, Serialize)]
struct StatsResource<'a> {
    #[serde(flatten)]
    stats: &'a StorageStats,
    retention_policy: RetentionPolicy,
    health: Health,
}

fn to_json<T: Serialize>(value: &T) -> Result<String, Error> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// `generated-images://{image_id}`.
pub async fn image_resource_json(handler: &ImageHandler, image_id: &str) -> Result<String, Error> {
    let (bytes, metadata) = handler.get_image(image_id).await?;
    let data_url = format!(
        "data:{};base64,{}",
        metadata.file_info.mime_type,
        BASE64.encode(&bytes)
    );
    to_json(&ImageResource {
        image_id,
        data_url,
        metadata: &metadata,
    })
}

/// `image-history://recent[/{limit}/{days}]`.
pub async fn history_resource_json(
    handler: &ImageHandler,
    limit: usize,
    days: u32,
) -> Result<String, Error> {
    let images = handler.recent_images(limit, days).await?;
    let stats = handler.storage_stats().await?;
    to_json(&HistoryResource {
        limit,
        days,
        count: images.len(),
        images: images
            .iter()
            .map(|metadata| HistoryItem {
                resource_reference: format!("{IMAGE_RESOURCE_SCHEME}{}", metadata.image_id),
                metadata,
            })
            .collect(),
        storage: StorageSummary {
            total_images: stats.total_images,
            total_bytes: stats.total_bytes,
            usage_percent: stats.usage_percent,
        },
    })
}

/// `storage-stats://overview`.
pub async fn stats_resource_json(handler: &ImageHandler) -> Result<String, Error> {
    let stats = handler.storage_stats().await?;
    let storage = &handler.config().storage;
    to_json(&StatsResource {
        retention_policy: RetentionPolicy {
            retention_days: storage.retention_days,
            max_size_bytes: stats.max_size_bytes,
            cleanup_interval_hours: storage.cleanup_interval_hours,
        },
        health: Health::from_usage(stats.usage_percent),
        stats: &stats,
    })
}

/// `models://list`.
pub fn models_resource_json(handler: &ImageHandler) -> Result<String, Error> {
    to_json(&handler.list_available_models())
}

/// `model-info://{model_id}`.
pub fn model_info_resource_json(handler: &ImageHandler, model: &str) -> Result<String, Error> {
    #[derive(Serialize)]
    struct ModelInfo<'a> {
        available: bool,
        is_default: bool,
        #[serde(flatten)]
        descriptor: &'a ModelCapabilityDescriptor,
    }

    let (descriptor, available) = handler
        .model_info(model)
        .ok_or_else(|| StorageError::NotFound(format!("{MODEL_INFO_SCHEME}{model}")))?;
    to_json(&ModelInfo {
        available,
        is_default: handler.registry().default_model() == descriptor.model_id,
        descriptor: &descriptor,
    })
}

/// Read any resource by URI.
pub async fn read(handler: &ImageHandler, uri: &str) -> Result<String, Error> {
    match ResourceUri::parse(uri)? {
        ResourceUri::Image(id) => image_resource_json(handler, &id).await,
        ResourceUri::History { limit, days } => history_resource_json(handler, limit, days).await,
        ResourceUri::Stats => stats_resource_json(handler).await,
        ResourceUri::Models => models_resource_json(handler),
        ResourceUri::ModelInfo(model) => model_info_resource_json(handler, &model),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_static_uris() {
        assert_eq!(ResourceUri::parse(STATS_URI).unwrap(), ResourceUri::Stats);
        assert_eq!(ResourceUri::parse(MODELS_URI).unwrap(), ResourceUri::Models);
        assert_eq!(
            ResourceUri::parse(HISTORY_URI).unwrap(),
            ResourceUri::History { limit: 10, days: 7 }
        );
    }

    #[test]
    fn test_parse_parameterized_uris() {
        assert_eq!(
            ResourceUri::parse("generated-images://img_20250101000000000_0123456789ab").unwrap(),
            ResourceUri::Image("img_20250101000000000_0123456789ab".to_string())
        );
        assert_eq!(
            ResourceUri::parse("model-info://imagen-4").unwrap(),
            ResourceUri::ModelInfo("imagen-4".to_string())
        );
        assert_eq!(
            ResourceUri::parse("image-history://recent/25/30").unwrap(),
            ResourceUri::History {
                limit: 25,
                days: 30,
            }
        );
    }

    #[test]
    fn test_history_bounds() {
        for bad in [
            "image-history://recent/0/7",
            "image-history://recent/101/7",
            "image-history://recent/10/0",
            "image-history://recent/10/366",
            "image-history://recent/ten/7",
            "image-history://recent/10",
        ] {
            let err = ResourceUri::parse(bad).unwrap_err();
            assert!(err.is_client_error(), "{bad}: {err}");
        }
        assert!(ResourceUri::parse("image-history://recent/100/365").is_ok());
        assert!(ResourceUri::parse("image-history://recent/1/1").is_ok());
    }

    #[test]
    fn test_unknown_uri_is_not_found() {
        assert!(ResourceUri::parse("image://models").unwrap_err().is_not_found());
    }

    #[test]
    fn test_health_thresholds() {
        assert_eq!(Health::from_usage(0.0), Health::Healthy);
        assert_eq!(Health::from_usage(79.9), Health::Healthy);
        assert_eq!(Health::from_usage(80.0), Health::Warning);
        assert_eq!(Health::from_usage(94.9), Health::Warning);
        assert_eq!(Health::from_usage(95.0), Health::Critical);
    }
}
