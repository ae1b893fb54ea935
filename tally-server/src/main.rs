//! Standalone interaction sync server.
//!
//! Usage:
//!   # In-memory store, seeded from a JSON array of documents
//!   tally-server --seed records.json
//!
//!   # Persistent store
//!   tally-server --bind 0.0.0.0:9090 --storage ./tally_data
//!
//! Log level follows `RUST_LOG` (default `info`).

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use log::{error, info};
use serde_json::Value;
use tally_collab::server::{ServerConfig, SyncServer};
use tally_collab::storage::{ingest_documents, IngestReport, MemoryStore, RecordStore, RocksRecordStore, StoreConfig};

type BoxError = Box<dyn Error + Send + Sync>;

/// WebSocket server for per-user interaction state.
#[derive(Parser, Debug)]
#[command(name = "tally-server")]
#[command(about = "Sync seen/saved/archived/pursued state across clients")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory; in-memory when omitted
    #[arg(long)]
    storage: Option<PathBuf>,

    /// JSON file holding an array of documents to ingest at startup
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Compare-and-swap attempts per toggle
    #[arg(long, default_value_t = 4)]
    max_attempts: u32,

    /// Frames buffered per connection before a slow client drops
    #[arg(long, default_value_t = 256, value_parser = clap::value_parser!(u32).range(1..))]
    broadcast_capacity: u32,

    /// Seconds between WebSocket heartbeats
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            broadcast_capacity: self.broadcast_capacity as usize,
            max_toggle_attempts: self.max_attempts,
            heartbeat_interval_secs: self.heartbeat_secs,
            storage_path: self.storage.clone(),
        }
    }
}

fn open_store(path: Option<&Path>) -> Result<Arc<dyn RecordStore>, BoxError> {
    Ok(match path {
        Some(path) => {
            info!("Opening RocksDB store at {}", path.display());
            Arc::new(RocksRecordStore::open(StoreConfig {
                path: path.to_path_buf(),
                ..StoreConfig::default()
            })?)
        }
        None => {
            info!("Using in-memory store");
            Arc::new(MemoryStore::new())
        }
    })
}

fn seed(store: &dyn RecordStore, path: &Path) -> Result<IngestReport, BoxError> {
    let text = fs::read_to_string(path)?;
    let documents = match serde_json::from_str::<Value>(&text)? {
        Value::Array(docs) => docs,
        single @ Value::Object(_) => vec![single],
        _ => return Err(format!("{}: expected a JSON array of documents", path.display()).into()),
    };
    Ok(ingest_documents(store, &documents, Utc::now())?)
}

async fn run(args: Args) -> Result<(), BoxError> {
    let store = open_store(args.storage.as_deref())?;
    if let Some(path) = &args.seed {
        let report = seed(store.as_ref(), path)?;
        info!(
            "Seeded {} records from {} ({} already present, {} invalid)",
            report.inserted,
            path.display(),
            report.skipped,
            report.invalid
        );
    }

    let server = SyncServer::with_store(args.server_config(), store);
    server.run().await
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    info!("Starting tally-server on {}", args.bind);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("tally-server failed: {e}");
            ExitCode::FAILURE
        }
    }
}
