//! WebSocket sync client for connecting to the sync server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with backoff)
//! - Optimistic toggles confirmed or rolled back by the server reply
//! - Merging of remote broadcasts through [`ClientReconciler`]
//! - Re-fetch of tracked records after reconnect and on an optional timer

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tally_core::{InteractionField, InteractionRecord, RecordKey, ToggleEvent, UserId};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::reconciler::{ClientReconciler, ReconcileError, RemoteOutcome, SlotView};

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsReader = futures_util::stream::SplitStream<WsStream>;
type WsWriter = futures_util::stream::SplitSink<WsStream, Message>;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub user_id: UserId,
    /// Reconnect attempts after an unexpected disconnect (0 disables).
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect; doubles per attempt.
    pub reconnect_base_delay: Duration,
    /// Re-fetch all tracked records on this period while connected.
    pub refresh_interval: Option<Duration>,
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            user_id: UserId::anonymous(),
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(1),
            refresh_interval: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, user_id: UserId) -> Self {
        Self {
            server_url: server_url.into(),
            user_id,
            ..Self::default()
        }
    }

    /// Delay before reconnect `attempt` (1-based): base × 2^(attempt-1).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.reconnect_base_delay.saturating_mul(factor)
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established and identified
    Connected { connection_id: Uuid },
    /// Connection lost
    Disconnected,
    /// About to retry the connection
    Reconnecting { attempt: u32 },
    /// Broadcasts may have been missed; tracked records are being re-fetched
    ResyncRequired,
    /// A broadcast from another user was merged
    RemoteUpdate { event: ToggleEvent, outcome: RemoteOutcome },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("not connected")]
    NotConnected,
    #[error("request timed out")]
    Timeout,
}

impl ClientError {
    /// Server status code for rejected requests.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The request reached the server but its answer was lost, so the
    /// server may or may not have applied it.
    pub fn is_uncertain(&self) -> bool {
        matches!(self, Self::Timeout | Self::Protocol(ProtocolError::ConnectionClosed))
    }
}

struct ClientShared {
    config: ClientConfig,
    state: RwLock<ConnectionState>,
    connection_id: RwLock<Option<Uuid>>,
    reconciler: Mutex<ClientReconciler>,
    /// Channel to the WebSocket writer task
    outgoing_tx: RwLock<Option<mpsc::Sender<String>>>,
    /// Replies awaited by request id
    requests: Mutex<HashMap<Uuid, oneshot::Sender<ServerMessage>>>,
    event_tx: mpsc::Sender<SyncEvent>,
    closing: AtomicBool,
    refresh_started: AtomicBool,
}

impl ClientShared {
    fn emit(&self, event: SyncEvent) {
        if self.event_tx.try_send(event).is_err() {
            log::debug!("Event channel full or closed, dropping event");
        }
    }
}

/// The sync client.
///
/// Keeps a local mirror of tracked records, applies the user's own toggles
/// optimistically and merges broadcasts from other users.
pub struct SyncClient {
    shared: Arc<ClientShared>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let reconciler = ClientReconciler::new(config.user_id.clone());
        Self {
            shared: Arc::new(ClientShared {
                config,
                state: RwLock::new(ConnectionState::Disconnected),
                connection_id: RwLock::new(None),
                reconciler: Mutex::new(reconciler),
                outgoing_tx: RwLock::new(None),
                requests: Mutex::new(HashMap::new()),
                event_tx,
                closing: AtomicBool::new(false),
                refresh_started: AtomicBool::new(false),
            }),
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and identify to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&self) -> Result<Uuid, ClientError> {
        self.shared.closing.store(false, Ordering::SeqCst);
        let connection_id = establish(self.shared.clone()).await?;

        if let Some(period) = self.shared.config.refresh_interval {
            if !self.shared.refresh_started.swap(true, Ordering::SeqCst) {
                tokio::spawn(refresh_loop(self.shared.clone(), period));
            }
        }
        Ok(connection_id)
    }

    /// Close the connection without reconnecting.
    pub async fn disconnect(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        *self.shared.state.write().await = ConnectionState::Closing;
        // Dropping the sender makes the writer send Close
        self.shared.outgoing_tx.write().await.take();
    }

    /// Start mirroring a record the application already holds.
    pub async fn track(&self, record: InteractionRecord) {
        self.shared.reconciler.lock().await.resync(record);
    }

    /// Fetch a record from the server and replace the local confirmed copy.
    pub async fn fetch(&self, key: &RecordKey) -> Result<InteractionRecord, ClientError> {
        fetch_record(&self.shared, key).await
    }

    /// Re-fetch every tracked record. Returns how many were refreshed.
    pub async fn refresh_all(&self) -> usize {
        refresh_tracked(&self.shared).await
    }

    /// Flip `field` for the local user.
    ///
    /// The change shows immediately through [`SyncClient::view`] and is
    /// replaced by the server's answer, or rolled back if the server rejects
    /// it. When the answer is lost ([`ClientError::is_uncertain`]) the overlay
    /// is dropped and the record is re-fetched, so the view follows whatever
    /// the server actually holds.
    pub async fn toggle(&self, key: &RecordKey, field: InteractionField) -> Result<bool, ClientError> {
        let optimistic = self.shared.reconciler.lock().await.begin_toggle(&key.id, field)?;
        log::debug!("Optimistic {field} = {optimistic} on {key}");

        let reply = request(&self.shared, |id| ClientMessage::toggle(id, key, field)).await;

        let result = {
            let mut reconciler = self.shared.reconciler.lock().await;
            match reply {
                Ok(ServerMessage::ToggleResult {
                    success: true,
                    active: Some(active),
                    timestamp: Some(timestamp),
                    ..
                }) => {
                    reconciler.confirm(&key.id, field, active, timestamp)?;
                    Ok(active)
                }
                Ok(other) => {
                    reconciler.fail(&key.id, field)?;
                    Err(rejection(other))
                }
                Err(e) => {
                    reconciler.fail(&key.id, field)?;
                    Err(e)
                }
            }
        };

        if let Err(e) = &result {
            if e.is_uncertain() {
                log::warn!("Outcome of {field} on {key} unknown ({e}), re-fetching");
                // A late reply is still merged by the reader; reconnect refreshes otherwise.
                if let Err(refetch) = fetch_record(&self.shared, key).await {
                    log::debug!("Re-fetch of {key} failed: {refetch}");
                }
            }
        }
        result
    }

    pub async fn toggle_seen(&self, key: &RecordKey) -> Result<bool, ClientError> {
        self.toggle(key, InteractionField::Seen).await
    }

    pub async fn toggle_saved(&self, key: &RecordKey) -> Result<bool, ClientError> {
        self.toggle(key, InteractionField::Saved).await
    }

    pub async fn toggle_archived(&self, key: &RecordKey) -> Result<bool, ClientError> {
        self.toggle(key, InteractionField::Archived).await
    }

    pub async fn toggle_pursued(&self, key: &RecordKey) -> Result<bool, ClientError> {
        self.toggle(key, InteractionField::Pursued).await
    }

    /// Set `seenBy` for the local user. Not optimistic and never unsets.
    pub async fn mark_seen(&self, key: &RecordKey) -> Result<(), ClientError> {
        let reply = request(&self.shared, |id| ClientMessage::mark_seen(id, key)).await?;
        match reply {
            ServerMessage::ToggleResult {
                success: true,
                timestamp: Some(timestamp),
                ..
            } => {
                let mut reconciler = self.shared.reconciler.lock().await;
                if let Err(e) = reconciler.record_confirmed(&key.id, InteractionField::Seen, true, timestamp) {
                    log::debug!("Seen on {key} not mirrored locally: {e}");
                }
                Ok(())
            }
            other => Err(rejection(other)),
        }
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ClientError> {
        send(&self.shared, &ClientMessage::Ping).await
    }

    /// Merged view of a tracked record.
    pub async fn view(&self, record_id: &str) -> Option<InteractionRecord> {
        self.shared.reconciler.lock().await.view(record_id)
    }

    pub async fn slot(&self, record_id: &str, field: InteractionField, user: &UserId) -> Option<SlotView> {
        self.shared.reconciler.lock().await.slot(record_id, field, user)
    }

    pub async fn is_active(&self, record_id: &str, field: InteractionField, user: &UserId) -> bool {
        self.shared.reconciler.lock().await.is_active(record_id, field, user)
    }

    pub async fn pending_count(&self) -> usize {
        self.shared.reconciler.lock().await.pending_count()
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Server-assigned id of the current connection.
    pub async fn connection_id(&self) -> Option<Uuid> {
        *self.shared.connection_id.read().await
    }

    pub fn user_id(&self) -> &UserId {
        &self.shared.config.user_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.shared.config.server_url
    }
}

/// Open the socket, exchange HELLO/WELCOME and start the I/O tasks.
async fn establish(shared: Arc<ClientShared>) -> Result<Uuid, ClientError> {
    *shared.state.write().await = ConnectionState::Connecting;

    let connected = tokio_tungstenite::connect_async(shared.config.server_url.as_str()).await;
    let (ws_stream, _) = match connected {
        Ok(pair) => pair,
        Err(e) => {
            log::debug!("Connect to {} failed: {e}", shared.config.server_url);
            *shared.state.write().await = ConnectionState::Disconnected;
            return Err(ProtocolError::ConnectionClosed.into());
        }
    };
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    let identified = tokio::time::timeout(
        shared.config.request_timeout,
        handshake(&mut ws_writer, &mut ws_reader, &shared.config.user_id),
    )
    .await;
    let connection_id = match identified {
        Ok(Ok(id)) => id,
        Ok(Err(e)) => {
            *shared.state.write().await = ConnectionState::Disconnected;
            return Err(e.into());
        }
        Err(_) => {
            *shared.state.write().await = ConnectionState::Disconnected;
            return Err(ClientError::Timeout);
        }
    };

    // Writer task: forward outgoing channel to WebSocket
    let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
    tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if ws_writer.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
        let _ = ws_writer.send(Message::Close(None)).await;
    });

    *shared.outgoing_tx.write().await = Some(out_tx);
    *shared.connection_id.write().await = Some(connection_id);
    *shared.state.write().await = ConnectionState::Connected;
    log::info!("Connected to {} as {} ({connection_id})", shared.config.server_url, shared.config.user_id);
    shared.emit(SyncEvent::Connected { connection_id });

    tokio::spawn(read_loop(shared.clone(), ws_reader));
    Ok(connection_id)
}

/// Send HELLO and wait for WELCOME.
async fn handshake(writer: &mut WsWriter, reader: &mut WsReader, user_id: &UserId) -> Result<Uuid, ProtocolError> {
    let hello = ClientMessage::hello(user_id).encode()?;
    writer
        .send(Message::Text(hello.into()))
        .await
        .map_err(|_| ProtocolError::ConnectionClosed)?;
    loop {
        match reader.next().await {
            Some(Ok(Message::Text(text))) => {
                return match ServerMessage::decode(text.as_str())? {
                    ServerMessage::Welcome { connection_id, .. } => Ok(connection_id),
                    other => Err(ProtocolError::UnexpectedMessage(format!("{other:?}"))),
                };
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return Err(ProtocolError::ConnectionClosed),
            _ => {}
        }
    }
}

/// Reader task: route replies to waiting requests and merge broadcasts.
async fn read_loop(shared: Arc<ClientShared>, mut ws_reader: WsReader) {
    while let Some(msg) = ws_reader.next().await {
        match msg {
            Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                Ok(server_msg) => handle_server_message(&shared, server_msg).await,
                Err(e) => log::warn!("Ignoring undecodable frame: {e}"),
            },
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    // Connection lost
    shared.outgoing_tx.write().await.take();
    *shared.connection_id.write().await = None;
    // Dropping the senders fails every in-flight request
    shared.requests.lock().await.clear();
    *shared.state.write().await = ConnectionState::Disconnected;
    shared.emit(SyncEvent::Disconnected);

    if shared.closing.load(Ordering::SeqCst) {
        log::info!("Disconnected from {}", shared.config.server_url);
    } else if shared.config.max_reconnect_attempts > 0 {
        log::warn!("Connection to {} lost, reconnecting", shared.config.server_url);
        tokio::spawn(reconnect(shared));
    }
}

async fn handle_server_message(shared: &ClientShared, msg: ServerMessage) {
    match msg {
        ServerMessage::InteractionUpdate(event) => {
            let outcome = shared.reconciler.lock().await.apply_remote(&event);
            log::debug!("Remote {} on {} by {}: {outcome:?}", event.field, event.record_id, event.user_id);
            shared.emit(SyncEvent::RemoteUpdate { event, outcome });
        }
        ServerMessage::Pong { .. } => log::trace!("Pong"),
        msg => {
            // Snapshots land in socket order, ahead of any later broadcast.
            if let ServerMessage::Snapshot { record: Some(record), .. } = &msg {
                shared.reconciler.lock().await.resync(record.clone());
            }
            let Some(id) = msg.request_id() else {
                log::warn!("Unsolicited message: {msg:?}");
                return;
            };
            let waiter = shared.requests.lock().await.remove(&id);
            match waiter {
                Some(reply_tx) => {
                    let _ = reply_tx.send(msg);
                }
                None => apply_late_reply(shared, id, msg).await,
            }
        }
    }
}

/// Merge a reply whose requester already gave up waiting.
async fn apply_late_reply(shared: &ClientShared, id: Uuid, msg: ServerMessage) {
    match msg {
        ServerMessage::ToggleResult {
            record_id,
            field,
            success: true,
            active: Some(active),
            timestamp: Some(timestamp),
            ..
        } => {
            log::debug!("Late {field} result on {record_id}: {active}");
            let mut reconciler = shared.reconciler.lock().await;
            if let Err(e) = reconciler.record_confirmed(&record_id, field, active, timestamp) {
                log::debug!("Late result for request {id} not mirrored: {e}");
            }
        }
        _ => log::debug!("Reply for unknown request {id}"),
    }
}

fn reconnect(shared: Arc<ClientShared>) -> BoxFuture<'static, ()> {
    async move {
        for attempt in 1..=shared.config.max_reconnect_attempts {
            if shared.closing.load(Ordering::SeqCst) {
                return;
            }
            *shared.state.write().await = ConnectionState::Reconnecting;
            shared.emit(SyncEvent::Reconnecting { attempt });
            tokio::time::sleep(shared.config.backoff_delay(attempt)).await;

            match establish(shared.clone()).await {
                Ok(_) => {
                    shared.emit(SyncEvent::ResyncRequired);
                    let refreshed = refresh_tracked(&shared).await;
                    log::info!("Reconnected after {attempt} attempts, refreshed {refreshed} records");
                    return;
                }
                Err(e) => log::warn!("Reconnect attempt {attempt} failed: {e}"),
            }
        }
        *shared.state.write().await = ConnectionState::Disconnected;
        log::error!(
            "Giving up on {} after {} attempts",
            shared.config.server_url,
            shared.config.max_reconnect_attempts
        );
    }
    .boxed()
}

async fn refresh_loop(shared: Arc<ClientShared>, period: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        ticker.tick().await;
        if shared.closing.load(Ordering::SeqCst) {
            return;
        }
        if *shared.state.read().await == ConnectionState::Connected {
            refresh_tracked(&shared).await;
        }
    }
}

async fn refresh_tracked(shared: &ClientShared) -> usize {
    let keys: Vec<RecordKey> = shared.reconciler.lock().await.records().map(InteractionRecord::key).collect();
    let mut refreshed = 0;
    for key in &keys {
        match fetch_record(shared, key).await {
            Ok(_) => refreshed += 1,
            Err(e) => log::warn!("Refresh of {key} failed: {e}"),
        }
    }
    refreshed
}

async fn fetch_record(shared: &ClientShared, key: &RecordKey) -> Result<InteractionRecord, ClientError> {
    match request(shared, |id| ClientMessage::fetch(id, key)).await? {
        // Already merged by the reader.
        ServerMessage::Snapshot { record: Some(record), .. } => Ok(record),
        other => Err(rejection(other)),
    }
}

async fn send(shared: &ClientShared, msg: &ClientMessage) -> Result<(), ClientError> {
    let encoded = msg.encode()?;
    let tx = shared.outgoing_tx.read().await.clone().ok_or(ClientError::NotConnected)?;
    tx.send(encoded).await.map_err(|_| ClientError::NotConnected)
}

/// Send a request and wait for the reply with the same request id.
async fn request(
    shared: &ClientShared,
    build: impl FnOnce(Uuid) -> ClientMessage,
) -> Result<ServerMessage, ClientError> {
    let request_id = Uuid::new_v4();
    let (reply_tx, reply_rx) = oneshot::channel();
    shared.requests.lock().await.insert(request_id, reply_tx);

    if let Err(e) = send(shared, &build(request_id)).await {
        shared.requests.lock().await.remove(&request_id);
        return Err(e);
    }

    match tokio::time::timeout(shared.config.request_timeout, reply_rx).await {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(_)) => Err(ProtocolError::ConnectionClosed.into()),
        Err(_) => {
            shared.requests.lock().await.remove(&request_id);
            Err(ClientError::Timeout)
        }
    }
}

/// Map a non-success reply to an error.
fn rejection(msg: ServerMessage) -> ClientError {
    match msg {
        ServerMessage::ToggleResult { status, error, .. } | ServerMessage::Snapshot { status, error, .. } => {
            ClientError::Rejected {
                status,
                message: error.unwrap_or_default(),
            }
        }
        ServerMessage::Error { status, message, .. } => ClientError::Rejected { status, message },
        other => ProtocolError::UnexpectedMessage(format!("{other:?}")).into(),
    }
}
