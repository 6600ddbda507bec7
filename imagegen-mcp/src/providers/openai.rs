//! OpenAI-style image provider.
//!
//! Generation posts JSON to `{base_url}/images/generations`; edits post a
//! multipart form to `{base_url}/images/edits`. Images come back as
//! `b64_json` or, from some compatible servers, as a URL to download.

use super::{
    ProviderAdapter, ProviderKind, RawResult, ReportedParameters, RetryPolicy, status_error,
    transport_error,
};
use crate::request::CanonicalRequest;
use crate::translate::{OpenAiParams, to_openai};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use imagegen_mcp_common::config::{OpenAiSettings, Secret};
use imagegen_mcp_common::error::{ConfigError, Error, ProviderError, ProviderErrorKind};
use imagegen_mcp_common::models::{ModelCapabilityDescriptor, OPENAI_PROVIDER, TokenUsage};
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Header carrying the provider's request id.
const REQUEST_ID_HEADER: &str = "x-request-id";

/// OpenAI images API adapter.
pub struct OpenAiAdapter {
    id: String,
    http: reqwest::Client,
    base_url: String,
    api_key: Secret,
    organization: Option<String>,
    retry: RetryPolicy,
}

impl OpenAiAdapter {
    /// Build the adapter from configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` when no API key is configured.
    pub fn from_settings(settings: &OpenAiSettings) -> Result<Self, Error> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| ConfigError::missing_env_var("PROVIDERS__OPENAI__API_KEY"))?;
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| Error::internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(
            OPENAI_PROVIDER,
            &settings.base_url,
            api_key,
            http,
            RetryPolicy::new(settings.max_retries),
        )
        .with_organization(settings.organization.clone()))
    }

    /// Create an adapter with explicit dependencies (for testing).
    pub fn with_client(
        id: impl Into<String>,
        base_url: &str,
        api_key: Secret,
        http: reqwest::Client,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            id: id.into(),
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            organization: None,
            retry,
        }
    }

    pub fn with_organization(mut self, organization: Option<String>) -> Self {
        self.organization = organization;
        self
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.bearer_auth(self.api_key.expose());
        match &self.organization {
            Some(org) => builder.header("OpenAI-Organization", org),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<RawResult, ProviderError> {
        let response = self
            .authorized(builder)
            .send()
            .await
            .map_err(|e| transport_error(&self.id, &e))?;

        if !response.status().is_success() {
            return Err(status_error(&self.id, response).await);
        }

        let request_id = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body: ImagesResponse = response.json().await.map_err(|e| {
            ProviderError::new(
                &self.id,
                ProviderErrorKind::InvalidResponse,
                format!("Failed to parse response: {e}"),
            )
        })?;

        let datum = body.data.into_iter().next().ok_or_else(|| {
            ProviderError::new(
                &self.id,
                ProviderErrorKind::InvalidResponse,
                "No image returned from API",
            )
        })?;

        let bytes = match (datum.b64_json, datum.url) {
            (Some(b64), _) => BASE64.decode(b64.as_bytes()).map_err(|e| {
                ProviderError::new(
                    &self.id,
                    ProviderErrorKind::InvalidResponse,
                    format!("Invalid base64 image: {e}"),
                )
            })?,
            (None, Some(url)) => self.download(&url).await?,
            (None, None) => {
                return Err(ProviderError::new(
                    &self.id,
                    ProviderErrorKind::InvalidResponse,
                    "Response carried neither b64_json nor url",
                ));
            }
        };

        let mime_type = body
            .output_format
            .as_deref()
            .and_then(|f| f.parse::<imagegen_mcp_common::params::OutputFormat>().ok())
            .map(|f| f.mime_type().to_string());

        Ok(RawResult {
            bytes,
            mime_type,
            usage: body.usage.map(TokenUsage::from),
            request_id,
            revised_prompt: datum.revised_prompt,
            reported: ReportedParameters {
                size: body.size,
                quality: body.quality,
                output_format: body.output_format,
                background: body.background,
                ..Default::default()
            },
        })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ProviderError> {
        debug!(url = %url, "Downloading generated image");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error(&self.id, &e))?;
        if !response.status().is_success() {
            return Err(status_error(&self.id, response).await);
        }
        let bytes = response.bytes().await.map_err(|e| transport_error(&self.id, &e))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    #[instrument(
        level = "debug",
        name = "openai_generate",
        skip_all,
        fields(model = %model.model_id)
    )]
    async fn generate(
        &self,
        request: &CanonicalRequest,
        model: &ModelCapabilityDescriptor,
    ) -> Result<RawResult, ProviderError> {
        let params = to_openai(request, model);
        let body = GenerationRequest::new(&request.prompt, &params);
        let url = format!("{}/images/generations", self.base_url);
        debug!(url = %url, size = %params.size, quality = params.quality, "Calling images API");
        self.send(self.http.post(&url).json(&body)).await
    }

    #[instrument(level = "debug", name = "openai_edit", skip_all, fields(model = %model.model_id))]
    async fn edit(
        &self,
        request: &CanonicalRequest,
        model: &ModelCapabilityDescriptor,
    ) -> Result<RawResult, ProviderError> {
        let source = request.source_image.as_deref().ok_or_else(|| {
            ProviderError::new(
                &self.id,
                ProviderErrorKind::BadRequest,
                "Edit request has no source image",
            )
        })?;
        let params = to_openai(request, model);
        let mut form = Form::new()
            .text("model", params.model.clone())
            .text("prompt", request.prompt.clone())
            .text("n", "1")
            .text("size", params.size.clone())
            .text("quality", params.quality)
            .text("output_format", params.output_format)
            .part("image", image_part(&self.id, "image", source)?);
        if let Some(background) = params.background {
            form = form.text("background", background);
        }
        if let Some(mask) = request.mask.as_deref() {
            form = form.part("mask", image_part(&self.id, "mask", mask)?);
        }

        let url = format!("{}/images/edits", self.base_url);
        debug!(url = %url, has_mask = request.mask.is_some(), "Calling image edit API");
        self.send(self.http.post(&url).multipart(form)).await
    }
}

/// Build a multipart file part, sniffing the image type.
fn image_part(provider: &str, name: &str, bytes: &[u8]) -> Result<Part, ProviderError> {
    let (mime, extension) = match image::guess_format(bytes) {
        Ok(image::ImageFormat::Jpeg) => ("image/jpeg", "jpg"),
        Ok(image::ImageFormat::WebP) => ("image/webp", "webp"),
        _ => ("image/png", "png"),
    };
    Part::bytes(bytes.to_vec())
        .file_name(format!("{name}.{extension}"))
        .mime_str(mime)
        .map_err(|e| ProviderError::new(provider, ProviderErrorKind::BadRequest, e.to_string()))
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Serialize)]
struct GenerationRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u32,
    size: &'a str,
    quality: &'a str,
    output_format: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    style: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    background: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    moderation: Option<&'a str>,
}

impl<'a> GenerationRequest<'a> {
    fn new(prompt: &'a str, params: &'a OpenAiParams) -> Self {
        Self {
            model: &params.model,
            prompt,
            n: 1,
            size: &params.size,
            quality: params.quality,
            output_format: params.output_format,
            style: params.style,
            background: params.background,
            moderation: params.moderation,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
    #[serde(default)]
    usage: Option<ImagesUsage>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    quality: Option<String>,
    #[serde(default)]
    output_format: Option<String>,
    #[serde(default)]
    background: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImageDatum {
    #[serde(default)]
    b64_json: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    revised_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImagesUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
    #[serde(default)]
    total_tokens: Option<u64>,
}

impl From<ImagesUsage> for TokenUsage {
    fn from(usage: ImagesUsage) -> Self {
        TokenUsage {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::dispatch;
    use imagegen_mcp_common::models::builtin_models;
    use imagegen_mcp_common::params::{ImageSize, Operation, OutputFormat, Quality};
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gpt_image_1() -> ModelCapabilityDescriptor {
        builtin_models().into_iter().find(|m| m.model_id == "gpt-image-1").unwrap()
    }

    fn adapter(server: &MockServer, max_retries: u32) -> OpenAiAdapter {
        OpenAiAdapter::with_client(
            "openai",
            &format!("{}/v1", server.uri()),
            Secret::new("sk-test"),
            reqwest::Client::new(),
            RetryPolicy::new(max_retries).with_delays(Duration::ZERO, Duration::ZERO),
        )
    }

    fn request() -> CanonicalRequest {
        CanonicalRequest {
            operation: Operation::Generate,
            prompt: "a red fox in snow".to_string(),
            model_id: "gpt-image-1".to_string(),
            size: ImageSize::Landscape,
            quality: Quality::High,
            style: None,
            output_format: OutputFormat::Png,
            background: None,
            moderation: None,
            source_image: None,
            mask: None,
        }
    }

    fn image_body() -> serde_json::Value {
        json!({
            "created": 1_700_000_000,
            "data": [{ "b64_json": BASE64.encode(b"fake-png-bytes") }],
            "size": "1536x1024",
            "quality": "high",
            "output_format": "png",
            "usage": { "input_tokens": 12, "output_tokens": 4160, "total_tokens": 4172 }
        })
    }

    #[tokio::test]
    async fn test_generate_sends_canonical_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "gpt-image-1",
                "size": "1536x1024",
                "quality": "high",
                "output_format": "png",
                "n": 1
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-request-id", "req_123")
                    .set_body_json(image_body()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let raw = adapter(&server, 0).generate(&request(), &gpt_image_1()).await.unwrap();
        assert_eq!(raw.bytes, b"fake-png-bytes");
        assert_eq!(raw.request_id.as_deref(), Some("req_123"));
        assert_eq!(raw.mime_type.as_deref(), Some("image/png"));
        assert_eq!(raw.reported.size.as_deref(), Some("1536x1024"));
        assert_eq!(raw.usage.unwrap().output_tokens, Some(4160));
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(image_body()))
            .expect(1)
            .mount(&server)
            .await;

        let raw = dispatch(&adapter(&server, 2), &request(), &gpt_image_1()).await.unwrap();
        assert_eq!(raw.bytes, b"fake-png-bytes");
    }

    #[tokio::test]
    async fn test_bad_request_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .respond_with(ResponseTemplate::new(400).set_body_string("Invalid value for size"))
            .expect(1)
            .mount(&server)
            .await;

        let err = dispatch(&adapter(&server, 3), &request(), &gpt_image_1()).await.unwrap_err();
        match err {
            Error::ProviderFailed { attempts, source, .. } => {
                assert_eq!(attempts, 1);
                assert_eq!(source.kind, ProviderErrorKind::BadRequest);
                assert_eq!(source.status, Some(400));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_content_policy_refusal_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {
                    "code": "moderation_blocked",
                    "message": "Your request was rejected by the safety system."
                }
            })))
            .mount(&server)
            .await;

        let err = adapter(&server, 0).generate(&request(), &gpt_image_1()).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::ContentPolicy);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
            .mount(&server)
            .await;

        let err = adapter(&server, 0).generate(&request(), &gpt_image_1()).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::RateLimited);
        assert_eq!(err.retry_after, Some(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn test_url_responses_are_downloaded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{
                    "url": format!("{}/files/out.png", server.uri()),
                    "revised_prompt": "a fox"
                }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/out.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"downloaded".to_vec()))
            .mount(&server)
            .await;

        let raw = adapter(&server, 0).generate(&request(), &gpt_image_1()).await.unwrap();
        assert_eq!(raw.bytes, b"downloaded");
        assert_eq!(raw.revised_prompt.as_deref(), Some("a fox"));
    }

    #[tokio::test]
    async fn test_empty_data_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
            .mount(&server)
            .await;

        let err = adapter(&server, 0).generate(&request(), &gpt_image_1()).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::InvalidResponse);
    }

    #[tokio::test]
    async fn test_edit_posts_multipart() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images/edits"))
            .respond_with(ResponseTemplate::new(200).set_body_json(image_body()))
            .expect(1)
            .mount(&server)
            .await;

        let mut req = request();
        req.operation = Operation::Edit;
        req.source_image = Some(vec![0x89, b'P', b'N', b'G']);
        let raw = adapter(&server, 0).edit(&req, &gpt_image_1()).await.unwrap();
        assert_eq!(raw.bytes, b"fake-png-bytes");
    }

    #[test]
    fn test_missing_api_key_is_a_config_error() {
        let settings = imagegen_mcp_common::Config::from_lookup(|_| None).unwrap().providers.openai;
        let err = OpenAiAdapter::from_settings(&settings).err().unwrap();
        assert!(matches!(err, Error::Config(ConfigError::MissingEnvVar(_))));
    }
}
