//! # Multi-Server Client
//!
//! Purpose: Route memcached commands to one of several servers by key hash and
//! fan administrative commands out to all of them.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides sessions; callers name servers by
//!    address only.
//! 2. **Snapshot Routing**: The session list is copy-on-write. A command clones
//!    the current `Arc` and routes against it, so `quit` never pulls a session
//!    out from under a routing decision.
//! 3. **Hash-Mod-N**: `crc32(key) % n` picks the server. Removing a server
//!    changes `n` and moves most keys; there is no rebalancing.
//! 4. **Borrow-Friendly API**: Values are taken as `AsRef<[u8]>` and sent
//!    verbatim.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use crc::{Crc, CRC_32_ISO_HDLC};
use parking_lot::RwLock;
use tracing::debug;

use crate::config::ClientConfig;
use crate::connection::{Dialer, TcpDialer};
use crate::error::{Error, Result};
use crate::session::{Session, CRLF};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Longest key the text protocol accepts.
pub const MAX_KEY_LEN: usize = 250;

const STORED: &str = "STORED";
const DELETED: &str = "DELETED";
const NOT_FOUND: &str = "NOT_FOUND";
const OK: &str = "OK";
const TOUCHED: &str = "TOUCHED";

type Sessions = Arc<Vec<Arc<Session>>>;

/// Memcached client spread over one or more servers.
///
/// Each server gets exactly one connection. Commands to the same server run
/// one at a time; commands to different servers run in parallel.
#[derive(Debug)]
pub struct Client {
    sessions: RwLock<Sessions>,
}

impl Client {
    /// Connects to every address with default options.
    pub fn new<I, S>(addrs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_config(ClientConfig::new(addrs))
    }

    /// Connects to every configured server over TCP.
    pub fn with_config(config: ClientConfig) -> Result<Self> {
        let dialer = Arc::new(TcpDialer::new(config.nodelay));
        Self::with_dialer(config, dialer)
    }

    /// Connects to every configured server through `dialer`.
    ///
    /// Fails with [`Error::EmptyAddresses`] for an empty list, or with the
    /// first dial error.
    pub fn with_dialer(config: ClientConfig, dialer: Arc<dyn Dialer>) -> Result<Self> {
        if config.servers.is_empty() {
            return Err(Error::EmptyAddresses);
        }
        let sessions = config
            .servers
            .iter()
            .map(|addr| Session::open(addr, dialer.clone()).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        debug!(servers = sessions.len(), "client connected");
        Ok(Client {
            sessions: RwLock::new(Arc::new(sessions)),
        })
    }

    /// Addresses of the live servers in routing order.
    pub fn servers(&self) -> Vec<String> {
        self.snapshot().iter().map(|s| s.addr().to_string()).collect()
    }

    /// Address of the server `key` routes to right now.
    pub fn server_for(&self, key: &str) -> Result<String> {
        Ok(self.route(key)?.addr().to_string())
    }

    /// Stores `value` unconditionally.
    ///
    /// `exptime` is seconds from now, a Unix timestamp past 30 days, `0` for
    /// no expiry, or negative to expire at once.
    pub fn set(&self, key: &str, value: impl AsRef<[u8]>, exptime: i64) -> Result<()> {
        self.store("set", key, value.as_ref(), exptime, None)
    }

    /// Stores `value` only if `key` does not exist yet.
    pub fn add(&self, key: &str, value: impl AsRef<[u8]>, exptime: i64) -> Result<()> {
        self.store("add", key, value.as_ref(), exptime, None)
    }

    /// Stores `value` only if `key` already exists.
    pub fn replace(&self, key: &str, value: impl AsRef<[u8]>, exptime: i64) -> Result<()> {
        self.store("replace", key, value.as_ref(), exptime, None)
    }

    pub fn append(&self, key: &str, value: impl AsRef<[u8]>) -> Result<()> {
        self.store("append", key, value.as_ref(), 0, None)
    }

    pub fn prepend(&self, key: &str, value: impl AsRef<[u8]>) -> Result<()> {
        self.store("prepend", key, value.as_ref(), 0, None)
    }

    /// Stores `value` only if the item still carries the `cas` token from a
    /// previous [`Client::gets`].
    ///
    /// A mismatch fails with `StoreFailed("EXISTS")`, a missing key with
    /// `StoreFailed("NOT_FOUND")`.
    pub fn cas(&self, key: &str, value: impl AsRef<[u8]>, exptime: i64, cas: u64) -> Result<()> {
        self.store("cas", key, value.as_ref(), exptime, Some(cas))
    }

    /// Fetches the value stored at `key`.
    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        let (value, _) = self.route(key)?.get_value(key, false)?;
        Ok(value)
    }

    /// Fetches the value stored at `key` with its CAS token.
    pub fn gets(&self, key: &str) -> Result<(Vec<u8>, u64)> {
        let (value, cas) = self.route(key)?.get_value(key, true)?;
        let cas = cas.ok_or_else(|| Error::Internal("gets reply carried no cas token".to_string()))?;
        Ok((value, cas))
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let session = self.route(key)?;
        let reply = session.write_command(format!("delete {key}\r\n").as_bytes())?;
        expect_reply(reply, &[DELETED])
    }

    /// Adds `delta` to a numeric value and returns the new value.
    pub fn increment(&self, key: &str, delta: u64) -> Result<u64> {
        self.arith("incr", key, delta)
    }

    /// Subtracts `delta` from a numeric value and returns the new value.
    ///
    /// The server clamps at zero.
    pub fn decrement(&self, key: &str, delta: u64) -> Result<u64> {
        self.arith("decr", key, delta)
    }

    /// Updates the expiration of `key` without touching its value.
    ///
    /// A negative `exptime` expires the item immediately.
    pub fn touch(&self, key: &str, exptime: i64) -> Result<()> {
        let session = self.route(key)?;
        let reply = session.write_command(format!("touch {key} {exptime}\r\n").as_bytes())?;
        expect_reply(reply, &[OK, TOUCHED])
    }

    /// Invalidates every item on every server after `delay` seconds.
    ///
    /// Stops at the first server that fails; earlier servers stay flushed.
    pub fn flush_all(&self, delay: u32) -> Result<()> {
        self.broadcast(&format!("flush_all {delay}\r\n"))
    }

    /// Sets the logging verbosity on every server.
    pub fn verbosity(&self, level: u32) -> Result<()> {
        self.broadcast(&format!("verbosity {level}\r\n"))
    }

    /// Version string reported by the server at `addr`.
    ///
    /// # Errors
    /// `NotFound` for an unknown address. Any session failure is reported as
    /// `WriteFailed` with the session error as its source.
    pub fn version(&self, addr: &str) -> Result<String> {
        self.session_by_addr(addr)?
            .write_command(b"version\r\n")
            .map_err(write_failed)
    }

    /// Version strings of every server, keyed by address.
    ///
    /// # Errors
    /// The first failing server ends the walk with `WriteFailed`.
    pub fn versions(&self) -> Result<HashMap<String, String>> {
        let mut versions = HashMap::new();
        for session in self.snapshot().iter() {
            let version = session.write_command(b"version\r\n").map_err(write_failed)?;
            versions.insert(session.addr().to_string(), version);
        }
        Ok(versions)
    }

    /// General statistics of the server at `addr`.
    ///
    /// # Errors
    /// `NotFound` for an unknown address, otherwise `WriteFailed` wrapping
    /// the session error.
    pub fn stats(&self, addr: &str) -> Result<HashMap<String, String>> {
        self.session_by_addr(addr)?.get_stats().map_err(write_failed)
    }

    /// Statistics of every server merged into one map.
    ///
    /// When servers report the same name, the first server in routing order
    /// wins.
    ///
    /// # Errors
    /// The first failing server ends the walk with `WriteFailed`.
    pub fn stats_all(&self) -> Result<HashMap<String, String>> {
        let mut merged = HashMap::new();
        for session in self.snapshot().iter() {
            for (name, value) in session.get_stats().map_err(write_failed)? {
                merged.entry(name).or_insert(value);
            }
        }
        Ok(merged)
    }

    /// Closes the connection to `addr` and removes it from routing.
    ///
    /// Keys hashed over the old server count may now land elsewhere.
    pub fn quit(&self, addr: &str) -> Result<()> {
        let removed = {
            let mut sessions = self.sessions.write();
            let idx = sessions
                .iter()
                .position(|s| s.addr() == addr)
                .ok_or(Error::NotFound)?;
            let mut next = (**sessions).clone();
            let removed = next.remove(idx);
            *sessions = Arc::new(next);
            removed
        };
        removed.close();
        debug!(addr, "server removed");
        Ok(())
    }

    /// Closes every connection and empties the server list.
    pub fn quit_all(&self) {
        let sessions = std::mem::replace(&mut *self.sessions.write(), Arc::new(Vec::new()));
        for session in sessions.iter() {
            session.close();
        }
        debug!(servers = sessions.len(), "all servers removed");
    }

    /// Sends a pre-formatted command to `addr` and returns the lines before
    /// `END`, each terminated by `\n`.
    ///
    /// `cmd` must carry its own CRLF terminators.
    ///
    /// # Errors
    /// `NotFound` for an unknown address, otherwise `WriteFailed` wrapping
    /// the session error.
    pub fn extra(&self, addr: &str, cmd: &str) -> Result<String> {
        self.session_by_addr(addr)?
            .extra(cmd.as_bytes())
            .map_err(write_failed)
    }

    fn snapshot(&self) -> Sessions {
        self.sessions.read().clone()
    }

    fn route(&self, key: &str) -> Result<Arc<Session>> {
        validate_key(key)?;
        self.pick_server(key)
    }

    fn pick_server(&self, key: &str) -> Result<Arc<Session>> {
        let sessions = self.snapshot();
        let idx = server_index(key.as_bytes(), sessions.len()).ok_or(Error::NoServers)?;
        Ok(sessions[idx].clone())
    }

    fn session_by_addr(&self, addr: &str) -> Result<Arc<Session>> {
        self.snapshot()
            .iter()
            .find(|s| s.addr() == addr)
            .cloned()
            .ok_or(Error::NotFound)
    }

    fn store(&self, verb: &str, key: &str, value: &[u8], exptime: i64, cas: Option<u64>) -> Result<()> {
        let session = self.route(key)?;
        // <verb> <key> <flags> <exptime> <bytes> [<cas unique>]\r\n<data>\r\n
        let header = match cas {
            Some(cas) => format!("{verb} {key} 0 {exptime} {} {cas}\r\n", value.len()),
            None => format!("{verb} {key} 0 {exptime} {}\r\n", value.len()),
        };
        let mut cmd = Vec::with_capacity(header.len() + value.len() + CRLF.len());
        cmd.extend_from_slice(header.as_bytes());
        cmd.extend_from_slice(value);
        cmd.extend_from_slice(CRLF);

        let reply = session.write_command(&cmd)?;
        expect_reply(reply, &[STORED])
    }

    fn arith(&self, verb: &str, key: &str, delta: u64) -> Result<u64> {
        let session = self.route(key)?;
        let reply = session.write_command(format!("{verb} {key} {delta}\r\n").as_bytes())?;
        if reply == NOT_FOUND {
            return Err(Error::NotFound);
        }
        reply.parse().map_err(|_| Error::UnexpectedResponse(reply))
    }

    fn broadcast(&self, cmd: &str) -> Result<()> {
        let sessions = self.snapshot();
        debug!(command = cmd.trim_end(), servers = sessions.len(), "fan-out");
        for session in sessions.iter() {
            let reply = session.write_command(cmd.as_bytes())?;
            expect_reply(reply, &[OK])?;
        }
        Ok(())
    }
}

/// Index of the server owning `key` among `servers`, or `None` when empty.
pub fn server_index(key: &[u8], servers: usize) -> Option<usize> {
    if servers == 0 {
        return None;
    }
    Some(CRC32.checksum(key) as usize % servers)
}

fn expect_reply(reply: String, accepted: &[&str]) -> Result<()> {
    if accepted.contains(&reply.as_str()) {
        Ok(())
    } else {
        Err(Error::StoreFailed(reply))
    }
}

/// Folds a session error into `WriteFailed`, keeping it as the source.
fn write_failed(err: Error) -> Error {
    match err {
        Error::WriteFailed(_) => err,
        other => Error::WriteFailed(io::Error::new(io::ErrorKind::Other, other)),
    }
}

/// Rejects keys the text protocol cannot carry before anything hits the wire.
fn validate_key(key: &str) -> Result<()> {
    let bytes = key.as_bytes();
    if bytes.is_empty()
        || bytes.len() > MAX_KEY_LEN
        || bytes.iter().any(|b| b.is_ascii_whitespace() || b.is_ascii_control())
    {
        return Err(Error::MalformedKey(key.to_string()));
    }
    Ok(())
}
