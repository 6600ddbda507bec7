//! Google Cloud credentials for Imagen-style providers.
//!
//! Credentials come from one of:
//! - a service account JSON file (`PROVIDERS__GEMINI__API_KEY=/path/to/key.json`)
//! - Application Default Credentials (`PROVIDERS__GEMINI__API_KEY=adc`, or unset)
//! - a fixed bearer token, for local gateways and tests

use std::sync::Arc;

use gcp_auth::TokenProvider;
use tracing::{debug, instrument};

use crate::error::AuthError;

/// Internal token source abstraction.
enum TokenSource {
    /// Token provider from gcp_auth (ADC or a service account)
    Provider(Arc<dyn TokenProvider>),
    /// Fixed token, never refreshed
    Static(String),
}

/// Authentication provider for Vertex AI calls.
///
/// Wraps the `gcp_auth` crate to provide credential discovery and token refresh.
/// Tokens are cached internally and refreshed automatically when they expire.
pub struct AuthProvider {
    source: TokenSource,
    /// Explicit project id, takes precedence over the one in the credentials
    project_id: Option<String>,
}

impl AuthProvider {
    /// Create a new auth provider using Application Default Credentials.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::NotConfigured` if no valid credentials can be found.
    #[instrument(level = "debug", name = "auth_provider_new")]
    pub async fn new() -> Result<Self, AuthError> {
        debug!("Initializing AuthProvider with ADC");

        let provider = gcp_auth::provider().await.map_err(|e| {
            debug!("Failed to initialize ADC: {}", e);
            AuthError::NotConfigured
        })?;

        Ok(Self {
            source: TokenSource::Provider(provider),
            project_id: None,
        })
    }

    /// Create an auth provider from a service account key file.
    #[instrument(level = "debug", name = "auth_provider_from_file")]
    pub fn from_service_account_file(path: &str) -> Result<Self, AuthError> {
        let account = gcp_auth::CustomServiceAccount::from_file(path).map_err(|e| {
            AuthError::CredentialsFile {
                path: path.to_string(),
                message: e.to_string(),
            }
        })?;
        let project_id = account.project_id().map(str::to_string);
        debug!(project_id = ?project_id, "Loaded service account");

        Ok(Self {
            source: TokenSource::Provider(Arc::new(account)),
            project_id,
        })
    }

    /// Create an auth provider from the configured credentials setting.
    ///
    /// `None` or `"adc"` selects Application Default Credentials; anything
    /// else is treated as a service account file path.
    pub async fn from_credentials(credentials: Option<&str>) -> Result<Self, AuthError> {
        match credentials.map(str::trim) {
            None | Some("") => Self::new().await,
            Some(value) if value.eq_ignore_ascii_case("adc") => Self::new().await,
            Some(path) => Self::from_service_account_file(path),
        }
    }

    /// Create a provider that always returns the given token.
    ///
    /// No network calls are made. Useful behind an authenticating proxy and in tests.
    pub fn static_token(token: impl Into<String>) -> Self {
        Self {
            source: TokenSource::Static(token.into()),
            project_id: None,
        }
    }

    /// Override the project id.
    pub fn with_project_id(mut self, project_id: Option<String>) -> Self {
        if project_id.is_some() {
            self.project_id = project_id;
        }
        self
    }

    /// Resolve the Google Cloud project id for API paths.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::MissingProjectId` if neither configuration nor the
    /// credentials name a project.
    pub async fn project_id(&self) -> Result<String, AuthError> {
        if let Some(id) = &self.project_id {
            return Ok(id.clone());
        }
        match &self.source {
            TokenSource::Provider(provider) => provider
                .project_id()
                .await
                .map(|id| id.to_string())
                .map_err(|e| {
                    debug!("No project id in credentials: {}", e);
                    AuthError::MissingProjectId
                }),
            TokenSource::Static(_) => Err(AuthError::MissingProjectId),
        }
    }

    /// Get a valid access token for the specified scopes.
    ///
    /// Tokens are cached internally and will be refreshed automatically when they expire.
    /// The caller should not cache tokens themselves.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::RefreshFailed` if the token cannot be obtained or refreshed.
    #[instrument(level = "debug", name = "get_token", skip(self))]
    pub async fn get_token(&self, scopes: &[&str]) -> Result<String, AuthError> {
        match &self.source {
            TokenSource::Provider(provider) => {
                let token = provider.token(scopes).await.map_err(|e| {
                    debug!("Token refresh failed: {}", e);
                    AuthError::RefreshFailed(e.to_string())
                })?;
                Ok(token.as_str().to_string())
            }
            TokenSource::Static(token) => Ok(token.clone()),
        }
    }
}

impl std::fmt::Debug for AuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match self.source {
            TokenSource::Provider(_) => "provider",
            TokenSource::Static(_) => "static",
        };
        f.debug_struct("AuthProvider")
            .field("source", &source)
            .field("project_id", &self.project_id)
            .finish()
    }
}

/// OAuth2 scopes for Google Cloud APIs.
pub mod scopes {
    /// Full access to Google Cloud Platform APIs.
    pub const CLOUD_PLATFORM: &str = "https://www.googleapis.com/auth/cloud-platform";
}
