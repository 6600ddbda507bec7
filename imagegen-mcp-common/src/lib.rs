//! imagegen MCP common library
//!
//! Shared configuration, canonical request vocabulary, model capability
//! catalog, Google credentials, error handling, tracing and server/transport
//! utilities for the imagegen MCP server.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod auth;
pub mod config;
pub mod error;
pub mod models;
pub mod params;
pub mod server;
pub mod tracing;
pub mod transport;

#[cfg(test)]
mod config_test;
#[cfg(test)]
mod server_test;

pub use config::Config;
pub use error::{
    AuthError, CacheError, ConfigError, Error, ProviderError, ProviderErrorKind, Result,
    StorageError, StorageOperation,
};
pub use models::ModelCapabilityDescriptor;
pub use server::{McpServerBuilder, ServerError, shutdown_channel};
pub use transport::{Transport, TransportArgs, TransportMode};
