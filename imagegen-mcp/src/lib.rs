//! imagegen MCP server library
//!
//! Normalizes image requests into a canonical form, routes them to one of
//! several provider adapters, deduplicates identical requests through a
//! fingerprint-keyed cache and persists every result to a local artifact
//! store exposed as MCP resources.

pub mod cache;
pub mod fingerprint;
pub mod handler;
pub mod http;
pub mod maintenance;
pub mod providers;
pub mod registry;
pub mod request;
pub mod resources;
pub mod server;
pub mod storage;
pub mod translate;

pub use fingerprint::Fingerprint;
pub use handler::{Durability, ImageHandler, ImageOutcome, ImageResult};
pub use providers::{ProviderAdapter, ProviderKind, RawResult};
pub use registry::ProviderRegistry;
pub use request::{CanonicalRequest, ImageRequest};
pub use server::ImageServer;
pub use storage::{ArtifactMetadata, ArtifactStore};
