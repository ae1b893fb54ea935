//! Connection registry and best-effort fan-out of confirmed changes.
//!
//! Uses one tokio broadcast channel for O(1) send to all connections. Each
//! frame carries the user it must skip, and [`ConnectionHandle::recv`]
//! filters it out, so the acting user's own connections never see their echo.
//!
//! Delivery is at-most-once and non-durable: a lagging receiver drops frames
//! and a disconnected one receives nothing until it re-fetches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tally_core::{ToggleEvent, UserId};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_connections: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// A registered connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub connection_id: Uuid,
    pub user_id: UserId,
    pub connected_at: DateTime<Utc>,
}

/// A pre-encoded frame on the fan-out channel.
#[derive(Debug)]
pub struct Outbound {
    /// Connections of this user skip the frame.
    pub exclude: Option<UserId>,
    pub frame: String,
}

impl Outbound {
    pub fn is_for(&self, user: &UserId) -> bool {
        self.exclude.as_ref() != Some(user)
    }
}

/// Receiving side of one registered connection.
pub struct ConnectionHandle {
    pub info: ConnectionInfo,
    receiver: broadcast::Receiver<Arc<Outbound>>,
}

impl ConnectionHandle {
    pub fn connection_id(&self) -> Uuid {
        self.info.connection_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.info.user_id
    }

    /// Next frame addressed to this connection's user.
    pub async fn recv(&mut self) -> Result<Arc<Outbound>, RecvError> {
        loop {
            let outbound = self.receiver.recv().await?;
            if outbound.is_for(&self.info.user_id) {
                return Ok(outbound);
            }
        }
    }
}

/// Sink for confirmed toggles. Implementations must not block or fail the caller.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &ToggleEvent);
}

/// Registry of live connections plus the shared fan-out channel.
pub struct ConnectionRegistry {
    sender: broadcast::Sender<Arc<Outbound>>,
    connections: Arc<RwLock<HashMap<Uuid, ConnectionInfo>>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl ConnectionRegistry {
    /// `capacity` is the number of frames buffered per connection before a
    /// slow connection starts dropping. Clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            connections: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Register a connection for `user_id` on connect.
    pub async fn register(&self, user_id: UserId) -> ConnectionHandle {
        let info = ConnectionInfo {
            connection_id: Uuid::new_v4(),
            user_id,
            connected_at: Utc::now(),
        };
        let receiver = self.sender.subscribe();
        self.connections
            .write()
            .await
            .insert(info.connection_id, info.clone());
        log::debug!("Registered connection {} for {}", info.connection_id, info.user_id);
        ConnectionHandle { info, receiver }
    }

    /// Deregister on disconnect or send failure.
    pub async fn deregister(&self, connection_id: &Uuid) -> Option<ConnectionInfo> {
        let removed = self.connections.write().await.remove(connection_id);
        if let Some(ref info) = removed {
            log::debug!("Deregistered connection {} for {}", info.connection_id, info.user_id);
        }
        removed
    }

    /// Fan a message out to every connection not owned by `excluded`.
    ///
    /// Returns the number of channel receivers the frame reached before
    /// per-connection filtering. Zero receivers is not an error.
    pub fn send_to_all_except(&self, excluded: &UserId, msg: &ServerMessage) -> Result<usize, ProtocolError> {
        self.send(Some(excluded.clone()), msg)
    }

    /// Fan a message out to every connection.
    pub fn send_to_all(&self, msg: &ServerMessage) -> Result<usize, ProtocolError> {
        self.send(None, msg)
    }

    fn send(&self, exclude: Option<UserId>, msg: &ServerMessage) -> Result<usize, ProtocolError> {
        let frame = msg.encode()?;
        let count = self
            .sender
            .send(Arc::new(Outbound { exclude, frame }))
            .unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(count)
    }

    /// Account for frames a lagging connection skipped.
    pub fn record_dropped(&self, n: u64) {
        self.atomic_stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Live connections belonging to `user`.
    pub async fn connections_for(&self, user: &UserId) -> Vec<ConnectionInfo> {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| &c.user_id == user)
            .cloned()
            .collect()
    }

    pub async fn is_registered(&self, connection_id: &Uuid) -> bool {
        self.connections.read().await.contains_key(connection_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_connections: self.connections.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl EventSink for ConnectionRegistry {
    fn publish(&self, event: &ToggleEvent) {
        let msg = ServerMessage::InteractionUpdate(event.clone());
        match self.send_to_all_except(&event.user_id, &msg) {
            Ok(n) => log::debug!(
                "Broadcast {} {} on {} by {} to {n} receivers",
                event.field,
                if event.action.is_activate() { "activate" } else { "deactivate" },
                event.record_id,
                event.user_id
            ),
            Err(e) => log::error!("Failed to broadcast update for {}: {e}", event.record_id),
        }
    }
}
