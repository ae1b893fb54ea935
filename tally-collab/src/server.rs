//! WebSocket sync server: toggle requests in, confirmed changes fanned out.
//!
//! Architecture:
//! ```text
//! Client A ──┐  TOGGLE / MARK_SEEN / FETCH
//!             ├──────────────────────────► ToggleService ──► RecordStore
//! Client B ──┘                                  │              (CAS loop)
//!                                               ▼
//!                                      ConnectionRegistry
//!                                   (skips the acting user)
//!                          ┌──────────┼───────────┐
//!                          ▼          ▼           ▼
//!                       Client A   Client B    Client C
//! ```
//!
//! A connection must send `HELLO` before any mutation. Store access is
//! synchronous and runs on the blocking pool.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tally_core::{InteractionField, RecordKey, ToggleError, UserId};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastStats, ConnectionHandle, ConnectionRegistry};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::storage::{MemoryStore, RecordStore, RocksRecordStore, StoreConfig, StoreError};
use crate::toggle::{ToggleOutcome, ToggleService, ToggleStats, DEFAULT_MAX_ATTEMPTS};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before a slow connection drops
    pub broadcast_capacity: usize,
    /// Compare-and-swap attempts per toggle
    pub max_toggle_attempts: u32,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            max_toggle_attempts: DEFAULT_MAX_ATTEMPTS,
            heartbeat_interval_secs: 30,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub toggles_applied: u64,
    pub toggles_rejected: u64,
}

/// State shared by all connection tasks.
struct Shared {
    config: ServerConfig,
    service: Arc<ToggleService>,
    registry: Arc<ConnectionRegistry>,
    stats: RwLock<ServerStats>,
}

/// The sync server.
pub struct SyncServer {
    shared: Arc<Shared>,
}

impl SyncServer {
    /// Create a server, opening RocksDB at `storage_path` when set.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn RecordStore> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Arc::new(RocksRecordStore::open(store_config)?)
            }
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn RecordStore>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.broadcast_capacity));
        let service = ToggleService::new(store)
            .with_sink(registry.clone())
            .with_max_attempts(config.max_toggle_attempts);
        Self {
            shared: Arc::new(Shared {
                config,
                service: Arc::new(service),
                registry,
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept WebSocket connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Arc<Shared>) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Set by HELLO
        let mut handle: Option<ConnectionHandle> = None;
        let result = Self::connection_loop(ws_stream, addr, &mut handle, &shared).await;

        // Cleanup runs on clean close and on send failure alike
        if let Some(h) = handle {
            shared.registry.deregister(&h.connection_id()).await;
        }
        {
            let mut s = shared.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        result
    }

    /// Pump one connection until it closes or a send fails.
    async fn connection_loop(
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        handle: &mut Option<ConnectionHandle>,
        shared: &Arc<Shared>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let period = Duration::from_secs(shared.config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = shared.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            let reply = match ClientMessage::decode(text.as_str()) {
                                Ok(client_msg) => Self::dispatch(client_msg, handle, shared).await,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    Some(ServerMessage::error(None, e.to_string(), 400))
                                }
                            };
                            if let Some(reply) = reply {
                                ws_sender.send(Message::Text(reply.encode()?.into())).await?;
                            }
                        }

                        Some(Ok(Message::Binary(_))) => {
                            let reply = ServerMessage::error(None, "binary frames are not supported", 400);
                            ws_sender.send(Message::Text(reply.encode()?.into())).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            return Ok(());
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            return Ok(());
                        }

                        _ => {}
                    }
                }

                // Outgoing broadcast frame
                frame = async {
                    match handle.as_mut() {
                        Some(h) => h.recv().await,
                        // Not identified yet, wait forever
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Ok(outbound) => {
                            ws_sender.send(Message::Text(outbound.frame.clone().into())).await?;
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Connection from {addr} lagged by {n} messages");
                            shared.registry.record_dropped(n);
                        }
                        Err(RecvError::Closed) => return Ok(()),
                    }
                }

                _ = heartbeat.tick() => {
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }
    }

    /// Handle one decoded client message; returns the direct reply, if any.
    async fn dispatch(msg: ClientMessage, handle: &mut Option<ConnectionHandle>, shared: &Arc<Shared>) -> Option<ServerMessage> {
        match msg {
            ClientMessage::Hello { user_id } => {
                if let Some(h) = handle.as_ref() {
                    return Some(ServerMessage::error(
                        None,
                        format!("connection already identified as {}", h.user_id()),
                        400,
                    ));
                }
                let user_id = UserId::or_anonymous(user_id.as_deref());
                let h = shared.registry.register(user_id.clone()).await;
                let connection_id = h.connection_id();
                log::info!("Connection {connection_id} identified as {user_id}");
                *handle = Some(h);
                Some(ServerMessage::Welcome { connection_id, user_id })
            }

            ClientMessage::Ping => Some(ServerMessage::pong()),

            ClientMessage::Toggle { request_id, record_id, partition_key, field } => {
                let key = RecordKey::new(record_id, partition_key);
                let user = match Self::identified(handle, "TOGGLE") {
                    Ok(user) => user,
                    Err(e) => return Some(ServerMessage::toggle_failed(request_id, key.id, field, &e)),
                };
                let service = shared.service.clone();
                let k = key.clone();
                let result = Self::blocking(move || service.toggle(&k, &user, field)).await;
                Some(Self::toggle_reply(shared, request_id, key, field, result).await)
            }

            ClientMessage::MarkSeen { request_id, record_id, partition_key } => {
                let key = RecordKey::new(record_id, partition_key);
                let field = InteractionField::Seen;
                let user = match Self::identified(handle, "MARK_SEEN") {
                    Ok(user) => user,
                    Err(e) => return Some(ServerMessage::toggle_failed(request_id, key.id, field, &e)),
                };
                let service = shared.service.clone();
                let k = key.clone();
                let result = Self::blocking(move || service.mark_seen(&k, &user)).await;
                Some(Self::toggle_reply(shared, request_id, key, field, result).await)
            }

            ClientMessage::Fetch { request_id, record_id, partition_key } => {
                let key = RecordKey::new(record_id, partition_key);
                let store = shared.service.store().clone();
                let result = Self::blocking(move || store.read(&key).map_err(ToggleError::from)).await;
                Some(ServerMessage::snapshot(request_id, result))
            }
        }
    }

    fn identified(handle: &Option<ConnectionHandle>, op: &str) -> Result<UserId, ToggleError> {
        handle
            .as_ref()
            .map(|h| h.user_id().clone())
            .ok_or_else(|| ToggleError::Validation(format!("HELLO required before {op}")))
    }

    async fn blocking<T, F>(f: F) -> Result<T, ToggleError>
    where
        F: FnOnce() -> Result<T, ToggleError> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .unwrap_or_else(|e| Err(ToggleError::Store(format!("store task failed: {e}"))))
    }

    async fn toggle_reply(
        shared: &Shared,
        request_id: Uuid,
        key: RecordKey,
        field: InteractionField,
        result: Result<ToggleOutcome, ToggleError>,
    ) -> ServerMessage {
        let mut s = shared.stats.write().await;
        match result {
            Ok(outcome) => {
                s.toggles_applied += 1;
                ServerMessage::toggle_ok(request_id, key.id, field, outcome.active, outcome.timestamp)
            }
            Err(e) => {
                s.toggles_rejected += 1;
                log::debug!("{field} on {key} rejected: {e}");
                ServerMessage::toggle_failed(request_id, key.id, field, &e)
            }
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    pub async fn broadcast_stats(&self) -> BroadcastStats {
        self.shared.registry.stats().await
    }

    pub fn toggle_stats(&self) -> ToggleStats {
        self.shared.service.stats()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.shared.registry
    }

    pub fn service(&self) -> &Arc<ToggleService> {
        &self.shared.service
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        self.shared.service.store()
    }
}
