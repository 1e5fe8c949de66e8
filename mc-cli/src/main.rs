//! # mc-cli
//!
//! Poke one or more memcached servers from the shell. Logging goes to stderr
//! and is controlled by `RUST_LOG`.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mc_client::{Client, ClientConfig};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mc-cli", about = "memcached text-protocol client")]
struct Cli {
    /// Server address; repeat for several servers
    #[arg(short = 's', long = "server")]
    servers: Vec<String>,
    /// JSON file holding a client configuration
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the value stored at a key
    Get { key: String },
    /// Print the value and CAS token stored at a key
    Gets { key: String },
    /// Store a value
    Set {
        key: String,
        value: String,
        /// Expiration in seconds, 0 for never, negative to expire at once
        #[arg(short = 'e', long, default_value_t = 0, allow_negative_numbers = true)]
        exptime: i64,
    },
    Delete { key: String },
    Incr { key: String, delta: u64 },
    Decr { key: String, delta: u64 },
    Touch {
        key: String,
        #[arg(allow_negative_numbers = true)]
        exptime: i64,
    },
    /// Invalidate all items on every server
    FlushAll {
        #[arg(default_value_t = 0)]
        delay: u32,
    },
    /// Print the version of every server
    Version,
    /// Print statistics as JSON, merged over all servers unless one is named
    Stats { addr: Option<String> },
    /// Send a raw command line to one server and print the reply up to END
    Raw { addr: String, line: String },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    debug!(servers = ?config.servers, "connecting");
    let client = Client::with_config(config).context("connecting to servers")?;

    let mut out = io::stdout().lock();
    match cli.command {
        Command::Get { key } => {
            let value = client.get(&key)?;
            out.write_all(&value)?;
            writeln!(out)?;
        }
        Command::Gets { key } => {
            let (value, cas) = client.gets(&key)?;
            writeln!(out, "cas {cas}")?;
            out.write_all(&value)?;
            writeln!(out)?;
        }
        Command::Set { key, value, exptime } => {
            client.set(&key, value, exptime)?;
            writeln!(out, "STORED")?;
        }
        Command::Delete { key } => {
            client.delete(&key)?;
            writeln!(out, "DELETED")?;
        }
        Command::Incr { key, delta } => writeln!(out, "{}", client.increment(&key, delta)?)?,
        Command::Decr { key, delta } => writeln!(out, "{}", client.decrement(&key, delta)?)?,
        Command::Touch { key, exptime } => {
            client.touch(&key, exptime)?;
            writeln!(out, "TOUCHED")?;
        }
        Command::FlushAll { delay } => {
            client.flush_all(delay)?;
            writeln!(out, "OK")?;
        }
        Command::Version => {
            let versions: BTreeMap<_, _> = client.versions()?.into_iter().collect();
            for (addr, version) in versions {
                writeln!(out, "{addr}\t{version}")?;
            }
        }
        Command::Stats { addr } => {
            let stats = match addr {
                Some(addr) => client.stats(&addr)?,
                None => client.stats_all()?,
            };
            let sorted: BTreeMap<_, _> = stats.into_iter().collect();
            serde_json::to_writer_pretty(&mut out, &sorted)?;
            writeln!(out)?;
        }
        Command::Raw { addr, line } => {
            let reply = client.extra(&addr, &format!("{line}\r\n"))?;
            out.write_all(reply.as_bytes())?;
        }
    }

    client.quit_all();
    Ok(())
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => ClientConfig::default(),
    };
    if !cli.servers.is_empty() {
        config.servers = cli.servers.clone();
    }
    if config.servers.is_empty() {
        bail!("no servers configured");
    }
    Ok(config)
}
