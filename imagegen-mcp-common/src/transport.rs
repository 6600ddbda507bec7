//! MCP transport selection.
//!
//! Two transport modes are supported:
//!
//! - **Stdio**: Default mode for local subprocess communication
//! - **HTTP**: Streamable HTTP transport mounted at `/mcp`, plus any extra
//!   routes the server contributes (the image download route)
//!
//! # Example
//!
//! ```ignore
//! use imagegen_mcp_common::transport::TransportArgs;
//! use clap::Parser;
//!
//! #[derive(Parser)]
//! struct Args {
//!     #[command(flatten)]
//!     transport: TransportArgs,
//! }
//!
//! let args = Args::parse();
//! let transport = args.transport.into_transport(&config.server);
//! ```

use crate::config::ServerConfig;
use clap::Args;
use std::fmt;

/// Transport mode for MCP server communication.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Transport {
    /// Standard input/output transport (default).
    #[default]
    Stdio,
    /// Streamable HTTP transport bound to `host:port`.
    Http {
        /// Address to bind
        host: String,
        /// Port to listen on
        port: u16,
    },
}

impl Transport {
    /// Create a new stdio transport.
    pub fn stdio() -> Self {
        Transport::Stdio
    }

    /// Create a new HTTP transport.
    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Transport::Http {
            host: host.into(),
            port,
        }
    }

    /// Check if this is a stdio transport.
    pub fn is_stdio(&self) -> bool {
        matches!(self, Transport::Stdio)
    }

    /// Check if this is an HTTP transport.
    pub fn is_http(&self) -> bool {
        matches!(self, Transport::Http { .. })
    }

    /// Get the port if this is a network transport.
    pub fn port(&self) -> Option<u16> {
        match self {
            Transport::Stdio => None,
            Transport::Http { port, .. } => Some(*port),
        }
    }

    /// `host:port` to bind, if this is a network transport.
    pub fn bind_addr(&self) -> Option<String> {
        match self {
            Transport::Stdio => None,
            Transport::Http { host, port } => Some(format!("{host}:{port}")),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Stdio => write!(f, "stdio"),
            Transport::Http { host, port } => write!(f, "http ({host}:{port})"),
        }
    }
}

/// Command-line arguments for transport configuration.
#[derive(Args, Debug, Clone, Default)]
pub struct TransportArgs {
    /// Transport mode: stdio or http (alias: streamable-http)
    #[arg(long, default_value = "stdio", value_parser = parse_transport_mode)]
    pub transport: TransportMode,

    /// Port for HTTP transport (default: SERVER__PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Bind address for HTTP transport (default: SERVER__HOST)
    #[arg(long)]
    pub host: Option<String>,
}

/// Transport mode parsed from command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    #[default]
    Stdio,
    Http,
}

pub(crate) fn parse_transport_mode(s: &str) -> Result<TransportMode, String> {
    match s.to_lowercase().as_str() {
        "stdio" => Ok(TransportMode::Stdio),
        "http" | "streamable-http" => Ok(TransportMode::Http),
        _ => Err(format!(
            "Invalid transport mode '{}'. Valid options: stdio, http, streamable-http",
            s
        )),
    }
}

impl TransportArgs {
    /// Convert command-line arguments into a Transport, filling the network
    /// address from the server configuration when not given on the command line.
    pub fn into_transport(self, server: &ServerConfig) -> Transport {
        match self.transport {
            TransportMode::Stdio => Transport::Stdio,
            TransportMode::Http => Transport::Http {
                host: self.host.unwrap_or_else(|| server.host.clone()),
                port: self.port.unwrap_or(server.port),
            },
        }
    }
}
