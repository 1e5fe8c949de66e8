//! # Server Session
//!
//! Purpose: Frame memcached text-protocol exchanges over one [`Connection`].
//!
//! ## Design Principles
//! 1. **One Exchange at a Time**: The session mutex is held from the first
//!    written byte until the last reply line is read.
//! 2. **Length Is Truth**: Value blocks are read by the byte count in the
//!    `VALUE` header and never scanned for terminators.
//! 3. **Fail Clean**: Any transport or framing error drops the stream so the
//!    next exchange starts on a fresh socket.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::{Connection, Dialer};
use crate::error::{Error, Result};

pub(crate) const CRLF: &[u8] = b"\r\n";
pub(crate) const END: &str = "END";
/// Largest value block accepted from a `VALUE` header (memcached's `-I` ceiling).
pub(crate) const MAX_VALUE_LEN: usize = 1 << 30;

/// Protocol session to a single memcached server.
#[derive(Debug)]
pub struct Session {
    addr: String,
    conn: Mutex<Connection>,
}

impl Session {
    /// Dials `addr` eagerly.
    pub fn open(addr: &str, dialer: Arc<dyn Dialer>) -> Result<Self> {
        let conn = Connection::open(addr, dialer).map_err(|source| Error::Connect {
            addr: addr.to_string(),
            source,
        })?;
        Ok(Session {
            addr: addr.to_string(),
            conn: Mutex::new(conn),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Sends a complete command and returns the single reply line, trimmed.
    pub fn write_command(&self, cmd: &[u8]) -> Result<String> {
        self.exchange(|conn, line| {
            send(conn, cmd)?;
            read_text_line(conn, line)
        })
    }

    /// Issues `get` (or `gets` when `with_cas`) for one key.
    ///
    /// Returns the value bytes and, for `gets`, the CAS token.
    pub fn get_value(&self, key: &str, with_cas: bool) -> Result<(Vec<u8>, Option<u64>)> {
        let verb = if with_cas { "gets" } else { "get" };
        let cmd = format!("{verb} {key}\r\n");
        self.exchange(|conn, line| {
            send(conn, cmd.as_bytes())?;
            let header = read_text_line(conn, line)?;
            if header == END {
                return Err(Error::NotFound);
            }

            // VALUE <key> <flags> <bytes> [<cas unique>]
            let parts: Vec<&str> = header.split(' ').collect();
            if parts.len() < 4 || parts[0] != "VALUE" {
                return Err(Error::UnexpectedResponse(header.clone()));
            }
            let cas = if with_cas {
                let raw = parts
                    .get(4)
                    .ok_or_else(|| Error::UnexpectedResponse(header.clone()))?;
                Some(parse_number::<u64>(raw, "cas token")?)
            } else {
                None
            };
            let len = parse_number::<usize>(parts[3], "value length")?;
            let block = match len.checked_add(CRLF.len()) {
                Some(block) if len <= MAX_VALUE_LEN => block,
                _ => return Err(Error::Internal(format!("value length {len} exceeds limit"))),
            };

            let mut data = vec![0u8; block];
            conn.read_exact(&mut data).map_err(Error::ReadFailed)?;
            if &data[len..] != CRLF {
                return Err(Error::UnexpectedResponse(
                    "value block is not terminated by CRLF".to_string(),
                ));
            }
            data.truncate(len);

            let trailer = read_text_line(conn, line)?;
            if trailer != END {
                return Err(Error::UnexpectedResponse(trailer));
            }
            Ok((data, cas))
        })
    }

    /// Issues `stats` and collects every `STAT <name> <value>` line.
    pub fn get_stats(&self) -> Result<HashMap<String, String>> {
        self.exchange(|conn, line| {
            send(conn, b"stats\r\n")?;
            let mut stats = HashMap::new();
            loop {
                let text = read_text_line(conn, line)?;
                if text == END {
                    break;
                }
                let Some((name, value)) = parse_stat(&text) else {
                    return Err(Error::UnexpectedResponse(text.clone()));
                };
                stats.insert(name.to_string(), value.to_string());
            }
            Ok(stats)
        })
    }

    /// Sends caller-formatted bytes and gathers reply lines up to `END`.
    ///
    /// Each collected line is followed by `\n`; the `END` line is not included.
    pub fn extra(&self, raw: &[u8]) -> Result<String> {
        self.exchange(|conn, line| {
            send(conn, raw)?;
            let mut out = String::new();
            loop {
                let text = read_text_line(conn, line)?;
                if text == END {
                    break;
                }
                out.push_str(&text);
                out.push('\n');
            }
            Ok(out)
        })
    }

    /// Closes the socket without sending `quit`.
    pub fn close(&self) {
        self.conn.lock().close();
    }

    fn exchange<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection, &mut Vec<u8>) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        conn.begin_exchange();
        let mut line = Vec::with_capacity(128);
        let result = f(&mut conn, &mut line);
        if let Err(err) = &result {
            if err.desyncs_stream() {
                conn.reset();
            }
        }
        result
    }
}

fn send(conn: &mut Connection, bytes: &[u8]) -> Result<()> {
    conn.write_all(bytes).map_err(Error::WriteFailed)
}

fn read_text_line(conn: &mut Connection, buf: &mut Vec<u8>) -> Result<String> {
    conn.read_line(buf).map_err(Error::ReadFailed)?;
    Ok(String::from_utf8_lossy(buf).trim().to_string())
}

/// Splits `STAT <name> <value...>`; the value keeps its inner spaces.
fn parse_stat(line: &str) -> Option<(&str, &str)> {
    let mut parts = line.splitn(3, ' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("STAT"), Some(name), Some(value)) => Some((name, value)),
        _ => None,
    }
}

fn parse_number<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|err| Error::Internal(format!("invalid {what} {raw:?}: {err}")))
}
