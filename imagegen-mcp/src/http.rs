//! Raw image download route for the HTTP transport.

use crate::storage::ArtifactStore;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use imagegen_mcp_common::error::StorageError;
use std::sync::Arc;
use tracing::{debug, error};

/// Stored images never change, so clients may cache them for a day.
const CACHE_CONTROL: &str = "public, max-age=86400, immutable";

/// `GET /images/{image_id}` serving raw image bytes.
pub fn image_routes(store: Arc<ArtifactStore>) -> Router {
    Router::new()
        .route("/images/{image_id}", get(serve_image))
        .with_state(store)
}

pub async fn serve_image(
    State(store): State<Arc<ArtifactStore>>,
    Path(image_id): Path<String>,
) -> Response {
    match store.get(&image_id).await {
        Ok((bytes, metadata)) => {
            debug!(image_id = %image_id, size_bytes = bytes.len(), "Serving image");
            let etag = format!("\"{}\"", metadata.image_id);
            let mut response = (StatusCode::OK, bytes).into_response();
            let headers = response.headers_mut();
            if let Ok(v) = HeaderValue::from_str(&metadata.file_info.mime_type) {
                headers.insert(header::CONTENT_TYPE, v);
            }
            if let Ok(v) = HeaderValue::from_str(&etag) {
                headers.insert(header::ETAG, v);
            }
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL));
            response
        }
        Err(StorageError::NotFound(_) | StorageError::InvalidId(_)) => {
            (StatusCode::NOT_FOUND, "image not found").into_response()
        }
        Err(e) => {
            error!(image_id = %image_id, error = %e, "Failed to read image");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to read image").into_response()
        }
    }
}
