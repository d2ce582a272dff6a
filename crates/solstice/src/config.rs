//! Broker configuration
//!
//! A [`BrokerConfig`] can be built in code, deserialised from a TOML file,
//! or assembled from both with CLI flags taking precedence (the binary does
//! the merging).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{BrokerError, Result};

fn default_bind_address() -> SocketAddr {
    "0.0.0.0:1883".parse().unwrap()
}

fn default_allow_anonymous() -> bool {
    true
}

fn default_max_packet_size() -> usize {
    268_435_455
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_channel_capacity() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    /// TCP listener address.
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    /// Accept CONNECT packets that carry no credentials. When false every
    /// connection must present a username/password pair found in
    /// `password_file`.
    #[serde(default = "default_allow_anonymous")]
    pub allow_anonymous: bool,

    /// Credential file with one `username:argon2-hash` entry per line.
    #[serde(default)]
    pub password_file: Option<PathBuf>,

    /// Inbound packets larger than this are treated as a protocol error.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,

    /// Grace period for the first CONNECT after the TCP accept.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Capacity of the per-connection outbound frame channel used by the
    /// publish fan-out.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            allow_anonymous: default_allow_anonymous(),
            password_file: None,
            max_packet_size: default_max_packet_size(),
            connect_timeout_secs: default_connect_timeout_secs(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl BrokerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BrokerError::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        toml::from_str(&content).map_err(|e| {
            BrokerError::Configuration(format!("failed to parse {}: {e}", path.display()))
        })
    }

    #[must_use]
    pub fn with_bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = addr;
        self
    }

    #[must_use]
    pub fn with_allow_anonymous(mut self, allow: bool) -> Self {
        self.allow_anonymous = allow;
        self
    }

    #[must_use]
    pub fn with_password_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.password_file = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }
}
