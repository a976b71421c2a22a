//! # Command-line interface
//!
//! Three subcommands: `send` a file to a peer and block until custody
//! or delivery confirmation (whichever the transfer reaches first) or
//! a timeout; `recv` run a node in the foreground, accepting inbound
//! bundles until interrupted; `status` print the current send/receive
//! state of a bundle id as JSON. Exit code is `0` on success, `1` on
//! any failure — no partial-success codes.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rand::Rng;
use tracing::info;

use courier_store::{SqliteStore, Store};

use crate::config::{CourierConfig, CourierConfigInput};
use crate::dispatcher::Node;
use crate::net::datagram::parse_destination;

#[derive(Parser)]
#[command(name = "courier", about = "Delay-tolerant reliable file transfer over UDP")]
pub struct Cli {
    /// Path to a YAML config file. Missing file falls back to defaults.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Send a file to a remote node and wait for it to complete.
    Send {
        /// Destination as host:port.
        dest: String,
        /// Path to the file to send.
        file: PathBuf,
        /// Bundle id; a random one is generated if omitted.
        #[arg(long)]
        bundle_id: Option<String>,
        /// Seconds to wait for completion before giving up.
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
    /// Run a node that accepts inbound bundles until interrupted.
    Recv,
    /// Print the status of a bundle id as JSON.
    Status {
        bundle_id: String,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<CourierConfig> {
    match path {
        Some(p) if p.exists() => Ok(CourierConfigInput::load(p)?.resolve()),
        _ => Ok(CourierConfig::defaults()),
    }
}

fn open_store(config: &CourierConfig) -> anyhow::Result<Arc<dyn Store>> {
    Ok(Arc::new(SqliteStore::open(&config.db_path)?))
}

fn random_bundle_id() -> String {
    let suffix: u64 = rand::rng().random();
    format!("bundle-{suffix:016x}")
}

/// Runs the parsed CLI to completion and returns the process exit code.
pub fn run(cli: Cli) -> i32 {
    match run_inner(cli) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {err:#}");
            1
        }
    }
}

fn run_inner(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_ref())?;
    let store = open_store(&config)?;

    match cli.command {
        Command::Send {
            dest,
            file,
            bundle_id,
            timeout,
        } => cmd_send(config, store, &dest, &file, bundle_id, timeout),
        Command::Recv => cmd_recv(config, store),
        Command::Status { bundle_id } => cmd_status(config, store, &bundle_id),
    }
}

fn cmd_send(
    config: CourierConfig,
    store: Arc<dyn Store>,
    dest: &str,
    file: &PathBuf,
    bundle_id: Option<String>,
    timeout_sec: u64,
) -> anyhow::Result<()> {
    let dest_addr = parse_destination(dest)?;
    let data = fs::read(file)?;
    let bundle_id = bundle_id.unwrap_or_else(random_bundle_id);

    let node = Node::new(config, store)?;
    node.start();
    node.send_file(&bundle_id, dest_addr, &data)?;
    info!(bundle_id = %bundle_id, bytes = data.len(), dest = %dest_addr, "transfer started");

    let completed = node.wait_for_completion(&bundle_id, Duration::from_secs(timeout_sec));
    node.stop();

    if !completed {
        anyhow::bail!("transfer of bundle {bundle_id} did not complete within {timeout_sec}s");
    }
    println!("{bundle_id}: delivered");
    Ok(())
}

fn cmd_recv(config: CourierConfig, store: Arc<dyn Store>) -> anyhow::Result<()> {
    let node = Node::new(config, store)?;
    node.start();
    let addr = node.local_addr()?;
    info!(addr = %addr, "node listening");
    println!("listening on {addr}, press Ctrl+C to stop");

    // Reception, tick, and send-worker threads run detached; this
    // process relies on the default SIGINT termination to exit rather
    // than tearing the node down gracefully.
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}

/// Status is read from the durable store rather than a live [`Node`] —
/// `status` typically runs as its own short-lived process, so there is
/// no in-memory engine state to query.
fn cmd_status(_config: CourierConfig, store: Arc<dyn Store>, bundle_id: &str) -> anyhow::Result<()> {
    match store.load_bundle(bundle_id)? {
        Some(bundle) => {
            println!("{}", serde_json::to_string_pretty(&bundle)?);
            Ok(())
        }
        None => anyhow::bail!("no record for bundle {bundle_id}"),
    }
}
