//! MCP server for the imagegen handler.
//!
//! Tools:
//! - `generate_image` - text-to-image
//! - `edit_image` - edit a source image, optionally with a mask
//! - `list_available_models` - registry listing
//!
//! Resources are described in [`crate::resources`].

use crate::handler::{ImageHandler, ImageResult};
use crate::request::ImageRequest;
use crate::resources::{self, HISTORY_URI, MODELS_URI, STATS_URI};
use imagegen_mcp_common::error::Error;
use rmcp::{
    ErrorData as McpError, ServerHandler,
    model::{
        CallToolResult, Content, ListResourcesResult, ReadResourceResult, ResourceContents,
        ServerCapabilities, ServerInfo, Tool,
    },
};
use schemars::JsonSchema;
use serde::Deserialize;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Recent images listed alongside the static resources.
const LISTED_RECENT_IMAGES: usize = 20;

/// MCP server for image generation.
#[derive(Clone)]
pub struct ImageServer {
    handler: ImageHandler,
}

/// Tool parameters for `generate_image`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct GenerateImageToolParams {
    /// Text prompt describing the image to generate
    pub prompt: String,
    /// Model id or alias (default: server's configured default)
    #[serde(default)]
    pub model: Option<String>,
    /// auto, low, medium or high
    #[serde(default)]
    pub quality: Option<String>,
    /// auto, 1024x1024, 1536x1024, 1024x1536 or WIDTHxHEIGHT
    #[serde(default)]
    pub size: Option<String>,
    /// vivid or natural (models with style control only)
    #[serde(default)]
    pub style: Option<String>,
    /// png, jpeg or webp
    #[serde(default)]
    pub output_format: Option<String>,
    /// auto, transparent or opaque
    #[serde(default)]
    pub background: Option<String>,
    /// auto or low
    #[serde(default)]
    pub moderation: Option<String>,
}

impl From<GenerateImageToolParams> for ImageRequest {
    fn from(params: GenerateImageToolParams) -> Self {
        Self {
            model: params.model,
            quality: params.quality,
            size: params.size,
            style: params.style,
            output_format: params.output_format,
            background: params.background,
            moderation: params.moderation,
            ..ImageRequest::generate(params.prompt)
        }
    }
}

/// Tool parameters for `edit_image`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct EditImageToolParams {
    /// Source image as base64 or a data URL
    pub image_data: String,
    /// Description of the edit
    pub prompt: String,
    /// Optional mask as base64 or a data URL; transparent pixels mark the area to edit
    #[serde(default)]
    pub mask_data: Option<String>,
    /// auto, 1024x1024, 1536x1024, 1024x1536 or WIDTHxHEIGHT
    #[serde(default)]
    pub size: Option<String>,
    /// auto, low, medium or high
    #[serde(default)]
    pub quality: Option<String>,
    /// png, jpeg or webp
    #[serde(default)]
    pub output_format: Option<String>,
    /// auto, transparent or opaque
    #[serde(default)]
    pub background: Option<String>,
    /// Model id or alias; must support editing
    #[serde(default)]
    pub model: Option<String>,
}

impl From<EditImageToolParams> for ImageRequest {
    fn from(params: EditImageToolParams) -> Self {
        Self {
            model: params.model,
            quality: params.quality,
            size: params.size,
            output_format: params.output_format,
            background: params.background,
            mask_data: params.mask_data,
            ..ImageRequest::edit(params.prompt, params.image_data)
        }
    }
}

/// Tool parameters for `list_available_models`.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct ListModelsToolParams {}

/// Map a handler error to the MCP error space.
pub fn to_mcp_error(err: Error) -> McpError {
    if err.is_client_error() {
        McpError::invalid_params(err.to_string(), None)
    } else if err.is_not_found() {
        McpError::resource_not_found(err.to_string(), None)
    } else {
        McpError::internal_error(err.to_string(), None)
    }
}

fn input_schema<T: JsonSchema>() -> Arc<serde_json::Map<String, serde_json::Value>> {
    let schema = schemars::schema_for!(T);
    match serde_json::to_value(&schema).unwrap_or_default() {
        serde_json::Value::Object(map) => Arc::new(map),
        _ => Arc::new(serde_json::Map::new()),
    }
}

fn tool<T: JsonSchema>(name: &'static str, description: &'static str) -> Tool {
    Tool {
        name: Cow::Borrowed(name),
        description: Some(Cow::Borrowed(description)),
        input_schema: input_schema::<T>(),
        annotations: None,
        icons: None,
        meta: None,
        output_schema: None,
        title: None,
    }
}

/// Every tool this server exposes.
pub fn tools() -> Vec<Tool> {
    vec![
        tool::<GenerateImageToolParams>(
            "generate_image",
            "Generate an image from a text prompt. Identical requests are served from the \
             cache. Returns the image plus a JSON block with the image id, resource \
             reference, resolved parameters and cost estimate.",
        ),
        tool::<EditImageToolParams>(
            "edit_image",
            "Edit an image according to a prompt, optionally restricted by a mask. \
             Only models that support editing accept this tool.",
        ),
        tool::<ListModelsToolParams>(
            "list_available_models",
            "List registered image models with their capabilities, availability and \
             the default model.",
        ),
    ]
}

fn resource(uri: String, name: String, description: &str) -> rmcp::model::Resource {
    rmcp::model::Resource {
        raw: rmcp::model::RawResource {
            uri,
            name,
            title: None,
            description: Some(description.to_string()),
            mime_type: Some("application/json".to_string()),
            size: None,
            icons: None,
            meta: None,
        },
        annotations: None,
    }
}

fn parse_args<T: for<'de> Deserialize<'de>>(
    arguments: Option<serde_json::Map<String, serde_json::Value>>,
) -> Result<T, McpError> {
    arguments
        .map(|args| serde_json::from_value(serde_json::Value::Object(args)))
        .transpose()
        .map_err(|e| McpError::invalid_params(format!("Invalid parameters: {}", e), None))?
        .ok_or_else(|| McpError::invalid_params("Missing parameters", None))
}

fn image_result(result: ImageResult) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(&result)
        .map_err(|e| McpError::internal_error(format!("Failed to encode result: {}", e), None))?;
    Ok(CallToolResult::success(vec![
        Content::image(result.image_data, result.mime_type),
        Content::text(json),
    ]))
}

impl ImageServer {
    pub fn new(handler: ImageHandler) -> Self {
        Self { handler }
    }

    pub fn handler(&self) -> &ImageHandler {
        &self.handler
    }

    /// Generate an image from a text prompt.
    pub async fn generate_image(
        &self,
        params: GenerateImageToolParams,
    ) -> Result<CallToolResult, McpError> {
        info!(model = ?params.model, "Generating image");
        let result = self
            .handler
            .generate_image(params.into())
            .await
            .map_err(to_mcp_error)?;
        image_result(result)
    }

    /// Edit an image.
    pub async fn edit_image(
        &self,
        params: EditImageToolParams,
    ) -> Result<CallToolResult, McpError> {
        info!(model = ?params.model, has_mask = params.mask_data.is_some(), "Editing image");
        let result = self
            .handler
            .edit_image(params.into())
            .await
            .map_err(to_mcp_error)?;
        image_result(result)
    }

    /// List registered models.
    pub fn list_available_models(&self) -> Result<CallToolResult, McpError> {
        let json = resources::models_resource_json(&self.handler).map_err(to_mcp_error)?;
        Ok(CallToolResult::success(vec![Content::text(json)]))
    }
}

impl ServerHandler for ImageServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Multi-provider image generation server. Use generate_image to create images \
                 from text prompts, edit_image to modify an existing image, and \
                 list_available_models to see which models are available. Generated images \
                 are stored locally and exposed as generated-images:// resources."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .build(),
            ..Default::default()
        }
    }

    fn list_tools(
        &self,
        _params: Option<rmcp::model::PaginatedRequestParam>,
        _context: rmcp::service::RequestContext<rmcp::service::RoleServer>,
    ) -> impl std::future::Future<Output = Result<rmcp::model::ListToolsResult, McpError>> + Send + '_ {
        async move {
            Ok(rmcp::model::ListToolsResult {
                tools: tools(),
                next_cursor: None,
                meta: None,
            })
        }
    }

    fn call_tool(
        &self,
        params: rmcp::model::CallToolRequestParam,
        _context: rmcp::service::RequestContext<rmcp::service::RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        async move {
            match params.name.as_ref() {
                "generate_image" => self.generate_image(parse_args(params.arguments)?).await,
                "edit_image" => self.edit_image(parse_args(params.arguments)?).await,
                "list_available_models" => self.list_available_models(),
                _ => Err(McpError::invalid_params(format!("Unknown tool: {}", params.name), None)),
            }
        }
    }

    fn list_resources(
        &self,
        _params: Option<rmcp::model::PaginatedRequestParam>,
        _context: rmcp::service::RequestContext<rmcp::service::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListResourcesResult, McpError>> + Send + '_ {
        async move {
            debug!("Listing resources");

            let mut resources = vec![
                resource(
                    HISTORY_URI.to_string(),
                    "Recent Images".to_string(),
                    "Recently generated images, newest first. \
                     Use image-history://recent/{limit}/{days} to narrow.",
                ),
                resource(
                    STATS_URI.to_string(),
                    "Storage Statistics".to_string(),
                    "Image count, disk usage, retention policy and storage health",
                ),
                resource(
                    MODELS_URI.to_string(),
                    "Available Models".to_string(),
                    "Registered image models with capabilities and availability",
                ),
            ];

            for model in self.handler.list_available_models().models {
                let id = &model.descriptor.model_id;
                resources.push(resource(
                    format!("model-info://{id}"),
                    format!("Model {id}"),
                    "Capabilities of one image model",
                ));
            }

            match self.handler.store().list_recent(LISTED_RECENT_IMAGES, None).await {
                Ok(recent) => {
                    for meta in recent {
                        let mut prompt: String = meta.details.prompt.chars().take(60).collect();
                        if prompt.len() < meta.details.prompt.len() {
                            prompt.push('…');
                        }
                        resources.push(resource(
                            format!("generated-images://{}", meta.image_id),
                            meta.image_id.clone(),
                            &format!("{} image: {prompt}", meta.details.model),
                        ));
                    }
                }
                Err(e) => warn!(error = %e, "Could not list recent images"),
            }

            Ok(ListResourcesResult {
                resources,
                next_cursor: None,
                meta: None,
            })
        }
    }

    fn read_resource(
        &self,
        params: rmcp::model::ReadResourceRequestParam,
        _context: rmcp::service::RequestContext<rmcp::service::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ReadResourceResult, McpError>> + Send + '_ {
        async move {
            let uri = &params.uri;
            debug!(uri = %uri, "Reading resource");

            let content = resources::read(&self.handler, uri).await.map_err(to_mcp_error)?;
            Ok(ReadResourceResult {
                contents: vec![ResourceContents::text(content, uri.clone())],
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imagegen_mcp_common::error::{ProviderError, ProviderErrorKind, StorageError};
    use imagegen_mcp_common::params::Operation;

    #[test]
    fn test_tools_have_object_schemas() {
        let tools = tools();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_ref()).collect();
        assert_eq!(names, ["generate_image", "edit_image", "list_available_models"]);
        let generate = &tools[0].input_schema;
        let required = generate["required"].as_array().unwrap();
        assert_eq!(required.len(), 1);
        assert_eq!(required[0], "prompt");
        assert!(generate["properties"].get("background").is_some());
    }

    #[test]
    fn test_generate_params_conversion() {
        let params: GenerateImageToolParams = serde_json::from_value(serde_json::json!({
            "prompt": "A cat",
            "model": "imagen-4",
            "size": "1536x1024",
            "quality": "high"
        }))
        .unwrap();
        let request: ImageRequest = params.into();
        assert_eq!(request.operation, Operation::Generate);
        assert_eq!(request.prompt, "A cat");
        assert_eq!(request.model.as_deref(), Some("imagen-4"));
        assert_eq!(request.size.as_deref(), Some("1536x1024"));
        assert_eq!(request.quality.as_deref(), Some("high"));
        assert_eq!(request.style, None);
        assert_eq!(request.image_data, None);
    }

    #[test]
    fn test_edit_params_conversion() {
        let params: EditImageToolParams = serde_json::from_value(serde_json::json!({
            "image_data": "aGVsbG8=",
            "prompt": "add a hat",
            "mask_data": "bWFzaw=="
        }))
        .unwrap();
        let request: ImageRequest = params.into();
        assert_eq!(request.operation, Operation::Edit);
        assert_eq!(request.image_data.as_deref(), Some("aGVsbG8="));
        assert_eq!(request.mask_data.as_deref(), Some("bWFzaw=="));
        assert_eq!(request.model, None);
    }

    #[test]
    fn test_missing_prompt_is_rejected() {
        let err = parse_args::<GenerateImageToolParams>(Some(serde_json::Map::new())).unwrap_err();
        assert_eq!(err.code, rmcp::model::ErrorCode::INVALID_PARAMS);
        let err = parse_args::<GenerateImageToolParams>(None).unwrap_err();
        assert_eq!(err.code, rmcp::model::ErrorCode::INVALID_PARAMS);
    }

    #[test]
    fn test_error_mapping() {
        let invalid = to_mcp_error(Error::validation("size", "bad"));
        assert_eq!(invalid.code, rmcp::model::ErrorCode::INVALID_PARAMS);

        let unsupported = to_mcp_error(Error::unsupported("imagen-4", "edit"));
        assert_eq!(unsupported.code, rmcp::model::ErrorCode::INVALID_PARAMS);

        let missing = to_mcp_error(StorageError::NotFound("img".to_string()).into());
        assert_eq!(missing.code, rmcp::model::ErrorCode::RESOURCE_NOT_FOUND);

        let provider = to_mcp_error(Error::ProviderFailed {
            provider: "openai".to_string(),
            attempts: 4,
            source: ProviderError::new("openai", ProviderErrorKind::Server, "boom"),
        });
        assert_eq!(provider.code, rmcp::model::ErrorCode::INTERNAL_ERROR);
    }
}
