//! Imagen-style provider on Vertex AI.
//!
//! Calls the `predict` endpoint of the native model selected by the quality
//! tier. Editing is not offered by this adapter.

use super::{
    ProviderAdapter, ProviderKind, RawResult, ReportedParameters, RetryPolicy, status_error,
    transport_error,
};
use crate::request::CanonicalRequest;
use crate::translate::to_imagen;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use imagegen_mcp_common::auth::{AuthProvider, scopes};
use imagegen_mcp_common::config::GeminiSettings;
use imagegen_mcp_common::error::{Error, ProviderError, ProviderErrorKind};
use imagegen_mcp_common::models::{GEMINI_PROVIDER, ModelCapabilityDescriptor};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Vertex AI Imagen adapter.
pub struct ImagenAdapter {
    id: String,
    http: reqwest::Client,
    base_url: String,
    project_id: String,
    location: String,
    auth: Arc<AuthProvider>,
    retry: RetryPolicy,
}

impl ImagenAdapter {
    /// Build the adapter from configuration, loading Google credentials.
    ///
    /// # Errors
    ///
    /// Returns `Error::Auth` if credentials or the project id cannot be resolved.
    pub async fn from_settings(settings: &GeminiSettings) -> Result<Self, Error> {
        let auth = AuthProvider::from_credentials(settings.credentials.as_deref())
            .await?
            .with_project_id(settings.project_id.clone());
        let project_id = auth.project_id().await?;
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| Error::internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self::with_client(
            GEMINI_PROVIDER,
            &settings.base_url,
            project_id,
            &settings.location,
            Arc::new(auth),
            http,
            RetryPolicy::new(settings.max_retries),
        ))
    }

    /// Create an adapter with explicit dependencies (for testing).
    pub fn with_client(
        id: impl Into<String>,
        base_url: &str,
        project_id: impl Into<String>,
        location: &str,
        auth: Arc<AuthProvider>,
        http: reqwest::Client,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            id: id.into(),
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            project_id: project_id.into(),
            location: location.to_string(),
            auth,
            retry,
        }
    }

    /// Get the Vertex AI prediction endpoint for a native model.
    pub fn endpoint(&self, native_model: &str) -> String {
        format!(
            "{}/projects/{}/locations/{}/publishers/google/models/{}:predict",
            self.base_url, self.project_id, self.location, native_model
        )
    }
}

#[async_trait]
impl ProviderAdapter for ImagenAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Imagen
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    #[instrument(
        level = "debug",
        name = "imagen_generate",
        skip_all,
        fields(model = %model.model_id)
    )]
    async fn generate(
        &self,
        request: &CanonicalRequest,
        model: &ModelCapabilityDescriptor,
    ) -> Result<RawResult, ProviderError> {
        let params = to_imagen(request, model);
        let body = ImagenRequest {
            instances: vec![ImagenInstance {
                prompt: request.prompt.clone(),
            }],
            parameters: ImagenParameters {
                sample_count: 1,
                aspect_ratio: params.aspect_ratio.map(str::to_string),
                output_options: OutputOptions {
                    mime_type: params.mime_type.to_string(),
                },
            },
        };

        let token = self.auth.get_token(&[scopes::CLOUD_PLATFORM]).await.map_err(|e| {
            ProviderError::new(&self.id, ProviderErrorKind::Authentication, e.to_string())
        })?;

        let endpoint = self.endpoint(&params.model);
        debug!(
            endpoint = %endpoint,
            aspect_ratio = ?params.aspect_ratio,
            tier = ?params.quality_tier,
            "Calling Imagen API"
        );

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(&self.id, &e))?;

        if !response.status().is_success() {
            return Err(status_error(&self.id, response).await);
        }

        let api_response: ImagenResponse = response.json().await.map_err(|e| {
            ProviderError::new(
                &self.id,
                ProviderErrorKind::InvalidResponse,
                format!("Failed to parse response: {e}"),
            )
        })?;

        let prediction = api_response.predictions.into_iter().next().ok_or_else(|| {
            ProviderError::new(
                &self.id,
                ProviderErrorKind::ContentPolicy,
                "No image returned; the prompt may have been filtered",
            )
        })?;

        let encoded = match (prediction.bytes_base64_encoded, prediction.rai_filtered_reason) {
            (Some(data), _) => data,
            (None, Some(reason)) => {
                return Err(ProviderError::new(&self.id, ProviderErrorKind::ContentPolicy, reason));
            }
            (None, None) => {
                return Err(ProviderError::new(
                    &self.id,
                    ProviderErrorKind::InvalidResponse,
                    "Prediction carried no image data",
                ));
            }
        };
        let bytes = BASE64.decode(encoded.as_bytes()).map_err(|e| {
            ProviderError::new(
                &self.id,
                ProviderErrorKind::InvalidResponse,
                format!("Invalid base64 image: {e}"),
            )
        })?;

        Ok(RawResult {
            bytes,
            mime_type: prediction.mime_type.clone(),
            usage: None,
            request_id: None,
            revised_prompt: prediction.prompt,
            reported: ReportedParameters {
                aspect_ratio: params.aspect_ratio.map(str::to_string),
                quality: params.quality_tier.map(str::to_string),
                mime_type: prediction.mime_type,
                ..Default::default()
            },
        })
    }

    async fn edit(
        &self,
        _request: &CanonicalRequest,
        model: &ModelCapabilityDescriptor,
    ) -> Result<RawResult, ProviderError> {
        Err(ProviderError::new(
            &self.id,
            ProviderErrorKind::Unsupported,
            format!("{} does not support image editing", model.model_id),
        ))
    }
}

// =============================================================================
// Wire types
// =============================================================================

/// Imagen API request body.
#[derive(Debug, Serialize)]
struct ImagenRequest {
    instances: Vec<ImagenInstance>,
    parameters: ImagenParameters,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImagenInstance {
    prompt: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImagenParameters {
    sample_count: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    aspect_ratio: Option<String>,
    output_options: OutputOptions,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutputOptions {
    mime_type: String,
}

/// Imagen API response body.
#[derive(Debug, Deserialize)]
struct ImagenResponse {
    #[serde(default)]
    predictions: Vec<ImagenPrediction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImagenPrediction {
    #[serde(default)]
    bytes_base64_encoded: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    rai_filtered_reason: Option<String>,
    /// Enhanced prompt, when prompt rewriting is on
    #[serde(default)]
    prompt: Option<String>,
}
