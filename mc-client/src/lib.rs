//! # Memcached Text-Protocol Client
//!
//! Purpose: A blocking client for one or more memcached servers speaking the
//! text protocol over TCP.
//!
//! ## Design Principles
//! 1. **Layered**: `Connection` survives one dropped socket, `Session` frames
//!    the protocol, `Client` routes keys and fans out admin commands.
//! 2. **One Connection per Server**: Exchanges on a server are serialized by
//!    its session lock; servers proceed independently.
//! 3. **Binary-Safe Values**: Payload lengths come from headers, never from
//!    scanning the bytes.
//! 4. **Fail Fast**: Nothing is retried beyond the single reconnect inside
//!    the connection.
//!
//! ```no_run
//! use mc_client::Client;
//!
//! let client = Client::new(["127.0.0.1:11211", "127.0.0.1:11212"])?;
//! client.set("greeting", "hello", 0)?;
//! assert_eq!(client.get("greeting")?, b"hello");
//! # Ok::<(), mc_client::Error>(())
//! ```

mod client;
mod config;
mod connection;
mod error;
mod session;

pub use client::{server_index, Client, MAX_KEY_LEN};
pub use config::ClientConfig;
pub use connection::{Dialer, TcpDialer, Transport};
pub use error::{Error, Result};
