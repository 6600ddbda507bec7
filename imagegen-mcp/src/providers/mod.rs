//! Provider adapters.
//!
//! An adapter makes exactly one provider call per `generate`/`edit`
//! invocation and classifies failures into [`ProviderError`] kinds. Retries
//! are applied around the adapter by [`dispatch`] using the adapter's
//! [`RetryPolicy`].

pub mod imagen;
pub mod openai;
pub mod retry;

use crate::request::CanonicalRequest;
use async_trait::async_trait;
use imagegen_mcp_common::error::{Error, ProviderError};
use imagegen_mcp_common::models::{ModelCapabilityDescriptor, TokenUsage};
use imagegen_mcp_common::params::Operation;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

pub use imagen::ImagenAdapter;
pub use openai::OpenAiAdapter;
pub use retry::RetryPolicy;

/// Wire protocol family an adapter speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Imagen,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::OpenAi => write!(f, "openai"),
            ProviderKind::Imagen => write!(f, "imagen"),
        }
    }
}

/// Provider-reported generation parameters, in the provider's own terms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportedParameters {
    pub size: Option<String>,
    pub aspect_ratio: Option<String>,
    pub quality: Option<String>,
    pub output_format: Option<String>,
    pub mime_type: Option<String>,
    pub background: Option<String>,
}

/// One successful provider call.
#[derive(Debug, Clone, Default)]
pub struct RawResult {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
    pub usage: Option<TokenUsage>,
    pub request_id: Option<String>,
    pub revised_prompt: Option<String>,
    pub reported: ReportedParameters,
}

/// A provider that can produce images.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider id, matching descriptors' `provider_id`.
    fn id(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    /// Retry policy applied around this adapter's calls.
    fn retry_policy(&self) -> &RetryPolicy;

    /// Generate one image. Makes a single provider call.
    async fn generate(
        &self,
        request: &CanonicalRequest,
        model: &ModelCapabilityDescriptor,
    ) -> Result<RawResult, ProviderError>;

    /// Edit the request's source image. Makes a single provider call.
    async fn edit(
        &self,
        request: &CanonicalRequest,
        model: &ModelCapabilityDescriptor,
    ) -> Result<RawResult, ProviderError>;
}

/// Run the request's operation on `adapter` under its retry policy.
///
/// # Errors
///
/// Returns `Error::ProviderFailed` with the attempt count once the error is
/// permanent or retries are exhausted.
pub async fn dispatch(
    adapter: &dyn ProviderAdapter,
    request: &CanonicalRequest,
    model: &ModelCapabilityDescriptor,
) -> Result<RawResult, Error> {
    adapter
        .retry_policy()
        .run(adapter.id(), || async {
            match request.operation {
                Operation::Generate => adapter.generate(request, model).await,
                Operation::Edit => adapter.edit(request, model).await,
            }
        })
        .await
}

/// Classify a transport-level reqwest failure.
pub(crate) fn transport_error(provider: &str, err: &reqwest::Error) -> ProviderError {
    use imagegen_mcp_common::error::ProviderErrorKind;

    let kind = if err.is_timeout() {
        ProviderErrorKind::Timeout
    } else if err.is_decode() {
        ProviderErrorKind::InvalidResponse
    } else {
        ProviderErrorKind::Network
    };
    ProviderError::new(provider, kind, err.to_string())
}

/// Parse a `Retry-After` header given in seconds.
pub(crate) fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Turn a non-success response into a classified error.
pub(crate) async fn status_error(provider: &str, response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let delay = retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    ProviderError::from_status(provider, status, body).with_retry_after(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};

    #[test]
    fn test_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_retry_after_ignores_dates_and_garbage() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
        assert_eq!(retry_after(&HeaderMap::new()), None);
    }

    #[test]
    fn test_provider_kind_display() {
        assert_eq!(ProviderKind::OpenAi.to_string(), "openai");
        assert_eq!(ProviderKind::Imagen.to_string(), "imagen");
    }
}
