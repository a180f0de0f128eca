//! HTTP server configuration settings.

use std::{net::SocketAddr, path::PathBuf};

use serde::Deserialize;

/// HTTP server configuration settings.
#[derive(Default, Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// The socket address the server should listen on.
    pub listen_address: Option<SocketAddr>,
    /// TLS configuration for secure connections.
    pub tls: Option<TlsServerConfig>,
}

/// Certificate and key used to terminate TLS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsServerConfig {
    pub certificate: PathBuf,
    pub key: PathBuf,
}
