//! In-process memcached stand-in speaking the text protocol over loopback.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Clone)]
struct Item {
    value: Vec<u8>,
    cas: u64,
}

#[derive(Default)]
pub struct Options {
    /// Pause before every reply.
    pub delay: Duration,
    /// Extra `STAT` lines appended after the built-in ones.
    pub stats: Vec<(String, String)>,
    pub version: Option<String>,
}

struct State {
    items: Mutex<HashMap<String, Item>>,
    next_cas: AtomicU64,
    accepted: AtomicUsize,
    commands: Mutex<Vec<String>>,
    live: Mutex<Vec<TcpStream>>,
    options: Options,
}

pub struct FakeServer {
    pub addr: String,
    state: Arc<State>,
}

impl FakeServer {
    pub fn spawn() -> FakeServer {
        FakeServer::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> FakeServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let state = Arc::new(State {
            items: Mutex::new(HashMap::new()),
            next_cas: AtomicU64::new(1),
            accepted: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
            live: Mutex::new(Vec::new()),
            options,
        });

        let accept_state = state.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { return };
                accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                if let Ok(clone) = stream.try_clone() {
                    accept_state.live.lock().unwrap().push(clone);
                }
                let conn_state = accept_state.clone();
                thread::spawn(move || serve(stream, conn_state));
            }
        });

        FakeServer { addr, state }
    }

    /// Number of TCP connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Command lines received so far, payloads excluded.
    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().unwrap().clone()
    }

    /// Shuts down every accepted connection, as a server restart would.
    pub fn drop_connections(&self) {
        for stream in self.state.live.lock().unwrap().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.items.lock().unwrap().contains_key(key)
    }
}

fn serve(stream: TcpStream, state: Arc<State>) {
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(_) => return,
    };
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let command = line.trim_end().to_string();
        state.commands.lock().unwrap().push(command.clone());
        let reply = match handle(&command, &mut reader, &state) {
            Some(reply) => reply,
            None => return,
        };
        if !state.options.delay.is_zero() {
            thread::sleep(state.options.delay);
        }
        if writer.write_all(&reply).is_err() {
            return;
        }
    }
}

fn handle(command: &str, reader: &mut BufReader<TcpStream>, state: &State) -> Option<Vec<u8>> {
    let tokens: Vec<&str> = command.split(' ').collect();
    let reply = match tokens.as_slice() {
        [verb @ ("set" | "add" | "replace" | "append" | "prepend"), key, _flags, _exp, len] => {
            let data = read_block(reader, len.parse().ok()?)?;
            store(state, verb, key, data, None)
        }
        ["cas", key, _flags, _exp, len, cas] => {
            let data = read_block(reader, len.parse().ok()?)?;
            store(state, "cas", key, data, Some(cas.parse().ok()?))
        }
        [verb @ ("get" | "gets"), key] => {
            let items = state.items.lock().unwrap();
            let mut out = Vec::new();
            if let Some(item) = items.get(*key) {
                if *verb == "gets" {
                    out.extend(format!("VALUE {key} 0 {} {}\r\n", item.value.len(), item.cas).bytes());
                } else {
                    out.extend(format!("VALUE {key} 0 {}\r\n", item.value.len()).bytes());
                }
                out.extend_from_slice(&item.value);
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(b"END\r\n");
            out
        }
        ["delete", key] => match state.items.lock().unwrap().remove(*key) {
            Some(_) => b"DELETED\r\n".to_vec(),
            None => b"NOT_FOUND\r\n".to_vec(),
        },
        [verb @ ("incr" | "decr"), key, delta] => arith(state, verb, key, delta.parse().ok()?),
        ["touch", key, _exp] => match state.items.lock().unwrap().contains_key(*key) {
            true => b"TOUCHED\r\n".to_vec(),
            false => b"NOT_FOUND\r\n".to_vec(),
        },
        ["flush_all", _delay] => {
            state.items.lock().unwrap().clear();
            b"OK\r\n".to_vec()
        }
        ["verbosity", _level] => b"OK\r\n".to_vec(),
        ["version"] => {
            let version = state.options.version.as_deref().unwrap_or("1.6.21");
            format!("VERSION {version}\r\n").into_bytes()
        }
        ["stats"] => {
            let items = state.items.lock().unwrap();
            let mut out = format!("STAT curr_items {}\r\n", items.len());
            for (name, value) in &state.options.stats {
                out.push_str(&format!("STAT {name} {value}\r\n"));
            }
            out.push_str("END\r\n");
            out.into_bytes()
        }
        ["stats", "items"] => {
            let count = state.items.lock().unwrap().len();
            format!("STAT items:1:number {count}\r\nSTAT items:1:age 0\r\nEND\r\n").into_bytes()
        }
        _ => b"ERROR\r\n".to_vec(),
    };
    Some(reply)
}

fn read_block(reader: &mut BufReader<TcpStream>, len: usize) -> Option<Vec<u8>> {
    let mut data = vec![0u8; len + 2];
    reader.read_exact(&mut data).ok()?;
    if &data[len..] != b"\r\n" {
        return None;
    }
    data.truncate(len);
    Some(data)
}

fn store(state: &State, verb: &str, key: &str, data: Vec<u8>, cas: Option<u64>) -> Vec<u8> {
    let mut items = state.items.lock().unwrap();
    let next_cas = state.next_cas.fetch_add(1, Ordering::SeqCst);
    let existing = items.get(key).cloned();
    let value = match (verb, existing) {
        ("set", _) => data,
        ("add", None) | ("replace", Some(_)) => data,
        ("append", Some(item)) => [item.value, data].concat(),
        ("prepend", Some(item)) => [data, item.value].concat(),
        ("cas", None) => return b"NOT_FOUND\r\n".to_vec(),
        ("cas", Some(item)) if Some(item.cas) == cas => data,
        ("cas", Some(_)) => return b"EXISTS\r\n".to_vec(),
        _ => return b"NOT_STORED\r\n".to_vec(),
    };
    items.insert(key.to_string(), Item { value, cas: next_cas });
    b"STORED\r\n".to_vec()
}

fn arith(state: &State, verb: &str, key: &str, delta: u64) -> Vec<u8> {
    let mut items = state.items.lock().unwrap();
    let Some(item) = items.get_mut(key) else {
        return b"NOT_FOUND\r\n".to_vec();
    };
    let current = std::str::from_utf8(&item.value)
        .ok()
        .and_then(|text| text.parse::<u64>().ok());
    let Some(current) = current else {
        return b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n".to_vec();
    };
    let next = if verb == "incr" {
        current.wrapping_add(delta)
    } else {
        current.saturating_sub(delta)
    };
    item.value = next.to_string().into_bytes();
    item.cas = state.next_cas.fetch_add(1, Ordering::SeqCst);
    format!("{next}\r\n").into_bytes()
}
