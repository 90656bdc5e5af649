//! Client configuration
//!
//! Settings come from a TOML file, from CLI flags, or both. The rendezvous
//! server is given by its *base* port; the service ports are derived from
//! it:
//!
//! - signaling: `base + 2`
//! - default relay: `base + 3`
//! - explicit relay `host:port` handed out by the server: `port + 2`

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::tungstenite::http::Uri;

use crate::network::{decode_verifying_key, ConnectionContext, CryptoError, NetworkError};
use crate::protocol::ConnType;

/// Base port of a rendezvous server when none is given
pub const DEFAULT_BASE_PORT: u16 = 21116;

/// Stated port of a relay address without one
pub const DEFAULT_RELAY_PORT: u16 = 21117;

const SIGNALING_PORT_OFFSET: u16 = 2;
const DEFAULT_RELAY_PORT_OFFSET: u16 = 3;
const RELAY_PORT_OFFSET: u16 = 2;

/// Default outbound queue drain tick in milliseconds
const DEFAULT_SEND_INTERVAL_MS: u64 = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid root key: {0}")]
    RootKey(#[from] CryptoError),
}

/// Settings for outgoing connections
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientConfig {
    /// `host`, `host:port` or `ws[s]://host:port`
    pub rendezvous_server: String,

    #[serde(default)]
    pub licence_key: String,

    #[serde(default)]
    pub conn_type: ConnType,

    /// Tick of the outbound queue drain
    #[serde(default = "default_send_interval_ms")]
    pub send_interval_ms: u64,

    /// Base64 Ed25519 key that overrides the built-in root key
    #[serde(default)]
    pub root_key: Option<String>,
}

fn default_send_interval_ms() -> u64 {
    DEFAULT_SEND_INTERVAL_MS
}

impl ClientConfig {
    pub fn new(rendezvous_server: impl Into<String>) -> Self {
        Self {
            rendezvous_server: rendezvous_server.into(),
            licence_key: String::new(),
            conn_type: ConnType::default(),
            send_interval_ms: DEFAULT_SEND_INTERVAL_MS,
            root_key: None,
        }
    }

    /// Load and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rendezvous_server.trim().is_empty() {
            return Err(ConfigError::Invalid("rendezvous_server is empty".into()));
        }
        ServerEndpoint::parse(&self.rendezvous_server)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.send_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "send_interval_ms must be greater than zero".into(),
            ));
        }
        self.trusted_root_key()?;
        Ok(())
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn endpoint(&self) -> Result<ServerEndpoint, NetworkError> {
        ServerEndpoint::parse(&self.rendezvous_server)
    }

    /// The configured root key override, if any
    pub fn trusted_root_key(&self) -> Result<Option<VerifyingKey>, ConfigError> {
        match &self.root_key {
            Some(encoded) => Ok(Some(decode_verifying_key(encoded)?)),
            None => Ok(None),
        }
    }

    /// Connection context trusting the override or the built-in root key
    pub fn context(&self) -> Result<ConnectionContext, ConfigError> {
        match self.trusted_root_key()? {
            Some(key) => Ok(ConnectionContext::new(key)),
            None => Ok(ConnectionContext::builtin()?),
        }
    }
}

/// Rendezvous server address with the derived service URIs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    scheme: String,
    host: String,
    base_port: u16,
}

impl ServerEndpoint {
    pub fn parse(server: &str) -> Result<Self, NetworkError> {
        let (scheme, host, port) = split_address(server, "ws")?;
        Ok(Self {
            scheme,
            host,
            base_port: port.unwrap_or(DEFAULT_BASE_PORT),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    pub fn signaling_uri(&self) -> Result<String, NetworkError> {
        self.uri_with_offset(&self.host, self.base_port, SIGNALING_PORT_OFFSET)
    }

    /// Relay on the rendezvous host, used when the server names none
    pub fn default_relay_uri(&self) -> Result<String, NetworkError> {
        self.uri_with_offset(&self.host, self.base_port, DEFAULT_RELAY_PORT_OFFSET)
    }

    /// Relay URI for an explicit `host[:port]` handed out by the server
    pub fn relay_uri(&self, relay_server: &str) -> Result<String, NetworkError> {
        let (_, host, port) = split_address(relay_server, &self.scheme)?;
        self.uri_with_offset(&host, port.unwrap_or(DEFAULT_RELAY_PORT), RELAY_PORT_OFFSET)
    }

    /// URI for a peer address returned by a successful punch hole
    pub fn direct_uri(&self, addr: SocketAddr) -> String {
        format!("{}://{}", self.scheme, addr)
    }

    fn uri_with_offset(&self, host: &str, port: u16, offset: u16) -> Result<String, NetworkError> {
        let port = port.checked_add(offset).ok_or_else(|| {
            NetworkError::InvalidEndpoint(format!("port {} + {} overflows", port, offset))
        })?;
        Ok(format!("{}://{}:{}", self.scheme, host, port))
    }
}

/// Split `[scheme://]host[:port]`, defaulting the scheme
fn split_address(address: &str, default_scheme: &str) -> Result<(String, String, Option<u16>), NetworkError> {
    let address = address.trim();
    let full = if address.contains("://") {
        address.to_string()
    } else {
        format!("{}://{}", default_scheme, address)
    };

    let uri: Uri = full
        .parse()
        .map_err(|e| NetworkError::InvalidEndpoint(format!("{}: {}", address, e)))?;

    let scheme = match uri.scheme_str() {
        Some(scheme @ ("ws" | "wss")) => scheme.to_string(),
        other => {
            return Err(NetworkError::InvalidEndpoint(format!(
                "{}: unsupported scheme {:?}",
                address, other
            )))
        }
    };
    let host = match uri.host() {
        Some(host) if !host.is_empty() => host.to_string(),
        _ => {
            return Err(NetworkError::InvalidEndpoint(format!(
                "{}: missing host",
                address
            )))
        }
    };

    Ok((scheme, host, uri.port_u16()))
}
