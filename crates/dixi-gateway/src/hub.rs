//! Broadcast hub for connected viewers
//!
//! Every viewer owns a bounded outbound queue drained by its socket writer
//! task, so a slow or dead viewer can only fail its own sends. Broadcasts
//! iterate a snapshot of the registry; a connection is removed eagerly the
//! first time a send to it fails or it misses a liveness round.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dixi_core::{Envelope, Error, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Frame queued for a viewer's socket writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close,
}

/// Transport state. Only `Open` connections receive broadcasts; `Closed` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl TransportState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TransportState::Connecting,
            1 => TransportState::Open,
            2 => TransportState::Closing,
            _ => TransportState::Closed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Result of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastOutcome {
    pub success: usize,
    pub errors: usize,
}

pub struct ClientConnection {
    id: String,
    connected_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    last_pong_at: Mutex<Option<DateTime<Utc>>>,
    alive: AtomicBool,
    state: AtomicU8,
    outbound: mpsc::Sender<Outbound>,
    shutdown: CancellationToken,
}

impl ClientConnection {
    /// New connection in `Connecting` state plus the receiving end of its
    /// outbound queue.
    pub fn open(buffer: usize) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let now = Utc::now();
        let conn = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            connected_at: now,
            last_activity: Mutex::new(now),
            last_pong_at: Mutex::new(None),
            alive: AtomicBool::new(true),
            state: AtomicU8::new(TransportState::Connecting as u8),
            outbound: tx,
            shutdown: CancellationToken::new(),
        });
        (conn, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_open(&self) -> bool {
        self.state() == TransportState::Open
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn last_pong_at(&self) -> Option<DateTime<Utc>> {
        *self.last_pong_at.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Cancelled when the connection is deregistered or closed.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            id: self.id.clone(),
            connected_at: self.connected_at,
            last_activity: *self.last_activity.lock().unwrap_or_else(|p| p.into_inner()),
        }
    }

    /// Queue a text frame. Never blocks; a full queue counts as a failure.
    pub fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed(self.id.clone()));
        }
        self.outbound.try_send(Outbound::Text(text)).map_err(|e| match e {
            TrySendError::Full(_) => Error::send_failed(&self.id, "outbound queue full"),
            TrySendError::Closed(_) => Error::send_failed(&self.id, "socket writer gone"),
        })?;
        self.touch();
        Ok(())
    }

    fn send_ping(&self) -> bool {
        self.outbound.try_send(Outbound::Ping).is_ok()
    }

    /// Best-effort close. Queues a close frame if the connection was still
    /// usable, then stops its tasks.
    pub fn close(&self) {
        let previous = self.transition(TransportState::Closing);
        if matches!(previous, TransportState::Connecting | TransportState::Open) {
            let _ = self.outbound.try_send(Outbound::Close);
        }
        self.shutdown.cancel();
    }

    /// Called by the socket writer once the transport is gone.
    pub fn mark_closed(&self) {
        self.state.store(TransportState::Closed as u8, Ordering::SeqCst);
        self.shutdown.cancel();
    }

    fn mark_open(&self) {
        let _ = self.state.compare_exchange(
            TransportState::Connecting as u8,
            TransportState::Open as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Move forward to `next` unless already past it. Returns the prior state.
    fn transition(&self, next: TransportState) -> TransportState {
        let prev = self.state.fetch_max(next as u8, Ordering::SeqCst);
        TransportState::from_u8(prev)
    }

    fn record_pong(&self) {
        self.alive.store(true, Ordering::SeqCst);
        let now = Utc::now();
        *self.last_pong_at.lock().unwrap_or_else(|p| p.into_inner()) = Some(now);
        *self.last_activity.lock().unwrap_or_else(|p| p.into_inner()) = now;
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|p| p.into_inner()) = Utc::now();
    }
}

pub struct BroadcastHub {
    clients: DashMap<String, Arc<ClientConnection>>,
    ping_interval: Duration,
}

impl BroadcastHub {
    pub fn new(ping_interval: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            ping_interval,
        }
    }

    /// Add a connection, greet it, and start its liveness cycle. Returns false
    /// for a connection that is already closing or closed; it is not added.
    pub fn register(self: &Arc<Self>, conn: Arc<ClientConnection>) -> bool {
        conn.mark_open();
        if !conn.is_open() {
            warn!(client = %conn.id(), state = ?conn.state(), "Refusing to register a closed viewer");
            return false;
        }
        self.clients.insert(conn.id().to_string(), conn.clone());

        let greeting = Envelope::connected(conn.id()).to_json();
        if let Err(e) = greeting.and_then(|json| conn.send_text(json)) {
            warn!(client = %conn.id(), "Failed to greet viewer: {}", e);
        }

        self.spawn_liveness(conn.clone());
        info!(client = %conn.id(), clients = self.clients.len(), "Viewer connected");
        true
    }

    /// Remove a connection and stop its liveness timer. Does not send a close
    /// frame.
    pub fn deregister(&self, id: &str) -> Option<Arc<ClientConnection>> {
        let (_, conn) = self.clients.remove(id)?;
        conn.shutdown.cancel();
        info!(client = %id, clients = self.clients.len(), "Viewer removed");
        Some(conn)
    }

    /// Send `{type: channel, data: payload}` to every open connection.
    /// Never fails; per-connection failures are counted and the offending
    /// connections dropped.
    pub fn broadcast<T: Serialize + ?Sized>(&self, channel: &str, payload: &T) -> BroadcastOutcome {
        let message = match Envelope::encode(channel, payload) {
            Ok(m) => m,
            Err(e) => {
                error!(channel, "Failed to encode broadcast: {}", e);
                return BroadcastOutcome::default();
            }
        };

        let snapshot: Vec<Arc<ClientConnection>> =
            self.clients.iter().map(|entry| entry.value().clone()).collect();

        let mut outcome = BroadcastOutcome::default();
        for conn in snapshot {
            if !conn.is_open() {
                self.deregister(conn.id());
                continue;
            }
            match conn.send_text(message.clone()) {
                Ok(()) => outcome.success += 1,
                Err(e) => {
                    outcome.errors += 1;
                    warn!(client = %conn.id(), channel, "Broadcast send failed: {}", e);
                    self.deregister(conn.id());
                    conn.close();
                }
            }
        }

        debug!(
            channel,
            success = outcome.success,
            errors = outcome.errors,
            "Broadcast delivered"
        );
        outcome
    }

    /// Inbound text from a viewer. Malformed messages are dropped; valid ones
    /// are acknowledged with their original type.
    pub fn on_message(&self, conn: &ClientConnection, raw: &str) {
        conn.touch();
        let envelope = match Envelope::parse(raw) {
            Ok(e) => e,
            Err(e) => {
                warn!(client = %conn.id(), "Dropping message: {}", e);
                return;
            }
        };
        debug!(client = %conn.id(), kind = %envelope.kind, "Viewer message");

        let ack = Envelope::ack(&envelope.kind).to_json();
        if let Err(e) = ack.and_then(|json| conn.send_text(json)) {
            warn!(client = %conn.id(), "Failed to acknowledge: {}", e);
            self.deregister(conn.id());
            conn.close();
        }
    }

    pub fn on_pong(&self, conn: &ClientConnection) {
        conn.record_pong();
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.clients.iter().map(|entry| entry.value().info()).collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<ClientConnection>> {
        self.clients.get(id).map(|entry| entry.value().clone())
    }

    /// Close every connection.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.clients.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some(conn) = self.deregister(&id) {
                conn.close();
            }
        }
    }

    fn spawn_liveness(self: &Arc<Self>, conn: Arc<ClientConnection>) {
        let period = self.ping_interval;
        if period.is_zero() {
            return;
        }
        let hub: Weak<Self> = Arc::downgrade(self);
        let token = conn.shutdown_token();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(hub) = hub.upgrade() else { break };
                        if !hub.check_liveness(&conn) {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// One liveness round. Returns false once the connection was dropped.
    fn check_liveness(&self, conn: &ClientConnection) -> bool {
        if !conn.alive.swap(false, Ordering::SeqCst) {
            warn!(client = %conn.id(), "No pong since last ping, terminating");
            self.deregister(conn.id());
            conn.close();
            return false;
        }
        if !conn.send_ping() {
            warn!(client = %conn.id(), "Ping could not be queued, terminating");
            self.deregister(conn.id());
            conn.close();
            return false;
        }
        true
    }
}
