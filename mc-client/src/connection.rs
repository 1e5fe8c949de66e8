//! # Resilient Connection
//!
//! Purpose: Own exactly one stream to one memcached server and hide a single
//! dropped socket from the protocol layer.
//!
//! ## Design Principles
//! 1. **Two-State Machine**: A connection is `Connected` or `Disconnected`; an
//!    I/O error moves it to `Disconnected` and a successful redial moves it
//!    back. `Closed` is terminal and never redials.
//! 2. **One Retry**: Every operation goes through `with_retry`, which redials
//!    once, replays the request bytes of the current exchange, and repeats the
//!    operation once. The second failure is returned as is.
//! 3. **Buffers Follow Streams**: Read buffering lives next to the stream so
//!    bytes from a dead socket are dropped together with it.
//! 4. **Injectable Transport**: Dialing goes through [`Dialer`] so tests can
//!    script failures without a network.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use tracing::{debug, warn};

/// Byte stream the connection speaks the protocol over.
pub trait Transport: Read + Write + Send {}

impl<T: Read + Write + Send> Transport for T {}

/// Opens transports to server addresses.
pub trait Dialer: Send + Sync {
    /// Dials `addr` and returns a ready-to-use transport.
    fn dial(&self, addr: &str) -> io::Result<Box<dyn Transport>>;
}

/// Plain TCP dialer used by default.
#[derive(Debug, Clone, Copy)]
pub struct TcpDialer {
    nodelay: bool,
}

impl TcpDialer {
    /// Creates a dialer; `nodelay` disables Nagle on every new socket.
    pub fn new(nodelay: bool) -> Self {
        TcpDialer { nodelay }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        TcpDialer::new(true)
    }
}

impl Dialer for TcpDialer {
    fn dial(&self, addr: &str) -> io::Result<Box<dyn Transport>> {
        let stream = TcpStream::connect(addr)?;
        if self.nodelay {
            // Commands are small; waiting to coalesce them only adds latency.
            stream.set_nodelay(true)?;
        }
        Ok(Box::new(stream))
    }
}

/// Observable state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// A stream is open and ready for the next exchange.
    Connected,
    /// The stream was dropped; the next operation redials.
    Disconnected,
    /// Closed by the owner; never redials.
    Closed,
}

type Stream = BufReader<Box<dyn Transport>>;

/// Single server connection with reconnect-on-failure.
///
/// The connection remembers the request bytes of the current exchange so a
/// redial can replay them before the failed operation is repeated.
pub struct Connection {
    addr: String,
    dialer: Arc<dyn Dialer>,
    stream: Option<Stream>,
    closed: bool,
    request: Vec<u8>,
    reply_started: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Dials `addr` once; fails if the server cannot be reached.
    pub fn open(addr: &str, dialer: Arc<dyn Dialer>) -> io::Result<Self> {
        let transport = dialer.dial(addr)?;
        debug!(addr, "connected");
        Ok(Connection {
            addr: addr.to_string(),
            dialer,
            stream: Some(BufReader::new(transport)),
            closed: false,
            request: Vec::new(),
            reply_started: false,
        })
    }

    /// Current state, derived from the stream slot and the closed flag.
    pub fn state(&self) -> ConnState {
        match (&self.stream, self.closed) {
            (_, true) => ConnState::Closed,
            (Some(_), false) => ConnState::Connected,
            (None, false) => ConnState::Disconnected,
        }
    }

    /// Marks the start of a new request/reply exchange.
    pub fn begin_exchange(&mut self) {
        self.request.clear();
        self.reply_started = false;
    }

    /// Writes the whole buffer and flushes it.
    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.with_retry(|stream| send(stream, buf))?;
        self.request.extend_from_slice(buf);
        Ok(())
    }

    /// Reads one `\n`-terminated line into `buf`, terminator included.
    ///
    /// A peer that closes the stream before sending anything is reported as
    /// `UnexpectedEof` so it takes the reconnect path like any other failure.
    pub fn read_line(&mut self, buf: &mut Vec<u8>) -> io::Result<()> {
        self.with_retry(|stream| {
            buf.clear();
            if stream.read_until(b'\n', buf)? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                ));
            }
            Ok(())
        })?;
        self.reply_started = true;
        Ok(())
    }

    /// Fills `buf` completely.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.with_retry(|stream| stream.read_exact(buf))?;
        self.reply_started = true;
        Ok(())
    }

    /// Drops the current stream; the next operation redials.
    pub fn reset(&mut self) {
        if self.stream.take().is_some() {
            debug!(addr = %self.addr, "connection reset");
        }
    }

    /// Closes the stream for good. No protocol `quit` is sent.
    pub fn close(&mut self) {
        self.stream = None;
        self.closed = true;
        debug!(addr = %self.addr, "connection closed");
    }

    /// Runs `op`, and on failure redials, replays this exchange's request and
    /// runs `op` once more.
    ///
    /// Once part of the reply has been consumed a replay would misframe it, so
    /// the stream is dropped and the first error returned instead.
    fn with_retry<T, F>(&mut self, mut op: F) -> io::Result<T>
    where
        F: FnMut(&mut Stream) -> io::Result<T>,
    {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed",
            ));
        }
        if let Some(stream) = self.stream.as_mut() {
            match op(stream) {
                Ok(value) => return Ok(value),
                Err(err) if self.reply_started => {
                    self.stream = None;
                    return Err(err);
                }
                Err(err) => warn!(addr = %self.addr, error = %err, "i/o failed, reconnecting"),
            }
        }
        let stream = redial(&self.addr, &*self.dialer, &mut self.stream)?;
        if !self.request.is_empty() {
            send(stream, &self.request)?;
        }
        op(stream)
    }
}

fn send(stream: &mut Stream, bytes: &[u8]) -> io::Result<()> {
    let inner = stream.get_mut();
    inner.write_all(bytes)?;
    inner.flush()
}

fn redial<'a>(
    addr: &str,
    dialer: &dyn Dialer,
    slot: &'a mut Option<Stream>,
) -> io::Result<&'a mut Stream> {
    *slot = None;
    match dialer.dial(addr) {
        Ok(transport) => {
            debug!(addr, "reconnected");
            Ok(slot.insert(BufReader::new(transport)))
        }
        Err(err) => {
            warn!(addr, error = %err, "reconnect failed");
            Err(err)
        }
    }
}
