//! # Client Configuration

use serde::{Deserialize, Serialize};

/// Configuration for the multi-server client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server addresses in routing order, e.g. "127.0.0.1:11211".
    pub servers: Vec<String>,
    /// Disable Nagle on every dialed socket.
    pub nodelay: bool,
}

impl ClientConfig {
    /// Creates a configuration for the given servers with default options.
    pub fn new<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ClientConfig {
            servers: servers.into_iter().map(Into::into).collect(),
            ..ClientConfig::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            servers: vec!["127.0.0.1:11211".to_string()],
            nodelay: true,
        }
    }
}
