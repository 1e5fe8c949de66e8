//! # Client Errors
//!
//! Purpose: A closed set of failure reasons shared by every layer of the
//! client. I/O failures keep their underlying cause as the error source.

use std::io;

use thiserror::Error;

/// Result type for the memcached client.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the memcached client.
#[derive(Debug, Error)]
pub enum Error {
    /// The client was constructed without any server address.
    #[error("no addresses provided")]
    EmptyAddresses,
    /// The initial dial to a server failed.
    #[error("failed to connect to {addr}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    /// The server did not acknowledge a storage or admin command.
    #[error("store command failed: {0}")]
    StoreFailed(String),
    /// Writing the command failed, including the one reconnect attempt.
    /// Admin and raw commands also report any session failure here.
    #[error("write command failed")]
    WriteFailed(#[source] io::Error),
    /// Reading the reply failed, including the one reconnect attempt.
    #[error("read failed")]
    ReadFailed(#[source] io::Error),
    /// Key miss, `NOT_FOUND` reply, or an address the client does not know.
    #[error("not found")]
    NotFound,
    /// The reply did not match the expected frame.
    #[error("unexpected response from server: {0:?}")]
    UnexpectedResponse(String),
    /// A numeric field inside a frame could not be parsed.
    #[error("internal error: {0}")]
    Internal(String),
    /// Every server has been removed from the client.
    #[error("no servers available")]
    NoServers,
    /// The key cannot be sent over the text protocol.
    #[error("malformed key: {0:?}")]
    MalformedKey(String),
}

impl Error {
    /// True for failures that leave the session's stream in an unknown state.
    pub(crate) fn desyncs_stream(&self) -> bool {
        matches!(
            self,
            Error::WriteFailed(_)
                | Error::ReadFailed(_)
                | Error::UnexpectedResponse(_)
                | Error::Internal(_)
        )
    }
}
