//! # tally-collab: Interaction sync for shared records
//!
//! Keeps per-user interaction fields (`seenBy`, `savedBy`, `archivedBy`,
//! `pursuedBy`) consistent across concurrent writers and live clients.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     JSON frames     │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────────┐               ┌───────────────┐
//! │ ClientReconciler │               │ ToggleService │──► RecordStore
//! │ (optimistic +    │               │ (CAS retry)   │    (memory / RocksDB)
//! │  confirmed)      │               └──────┬────────┘
//! └──────────────────┘                      │
//!                                   ┌───────┴────────────┐
//!                                   │ ConnectionRegistry │
//!                                   │ (fan-out, no echo) │
//!                                   └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages
//! - [`storage`]: Record store trait, in-memory and RocksDB backends, ingest
//! - [`toggle`]: Compare-and-swap toggle service
//! - [`broadcast`]: Connection registry with echo suppression
//! - [`api`]: Request/response entry points with HTTP-style status codes
//! - [`reconciler`]: Client-side merge of optimistic, confirmed and remote state
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client with reconnect and resync

pub mod api;
pub mod broadcast;
pub mod client;
pub mod protocol;
pub mod reconciler;
pub mod server;
pub mod storage;
pub mod toggle;

// Re-exports for convenience
pub use api::{BulkPursueResponse, ErrorResponse, InteractionApi, ToggleRequest, ToggleResponse};
pub use broadcast::{BroadcastStats, ConnectionHandle, ConnectionInfo, ConnectionRegistry, EventSink};
pub use client::{ClientConfig, ClientError, ConnectionState, SyncClient, SyncEvent};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use reconciler::{ClientReconciler, ReconcileError, RemoteOutcome, SlotView};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{
    ingest_documents, IngestReport, MemoryStore, RecordStore, RocksRecordStore, StoreConfig, StoreError,
};
pub use toggle::{ToggleOutcome, ToggleService, ToggleStats, DEFAULT_MAX_ATTEMPTS};
