//! Per-socket connection handle and per-feeder session state

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{FeedSrvError, Result};
use crate::protocol::DeviceIdentifier;

/// Acknowledgement a caller of `send_and_wait` is suspended on
#[derive(Debug)]
pub(crate) struct PendingExpectation {
    ticket: u64,
    expected: Bytes,
    tx: oneshot::Sender<()>,
}

/// One accepted TCP socket
///
/// Frames are written by queueing them for the socket's writer task.
/// Closing cancels the connection token, which stops both socket tasks and
/// drops any pending expectation.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    peer: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
    token: CancellationToken,
    expectation: Mutex<Option<PendingExpectation>>,
    next_ticket: AtomicU64,
}

impl Connection {
    pub fn new(
        id: u64,
        peer: SocketAddr,
        outbound: mpsc::Sender<Bytes>,
        token: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer,
            outbound,
            token,
            expectation: Mutex::new(None),
            next_ticket: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the connection has been closed
    pub async fn closed(&self) {
        self.token.cancelled().await
    }

    /// Close the socket; idempotent
    pub fn close(&self) {
        self.token.cancel();
        self.expectation.lock().take();
    }

    /// Queue a frame for the writer task
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(FeedSrvError::not_connected(self.peer));
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| FeedSrvError::not_connected(self.peer))
    }

    /// Install the single expectation slot
    ///
    /// Returns `None` if another expectation is still pending.
    pub(crate) fn expect(&self, expected: Bytes) -> Option<(u64, oneshot::Receiver<()>)> {
        let mut slot = self.expectation.lock();
        if slot.is_some() || self.is_closed() {
            return None;
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        *slot = Some(PendingExpectation {
            ticket,
            expected,
            tx,
        });
        Some((ticket, rx))
    }

    /// Remove the expectation installed under `ticket`, if still there
    pub(crate) fn clear_expectation(&self, ticket: u64) {
        let mut slot = self.expectation.lock();
        if slot.as_ref().is_some_and(|pending| pending.ticket == ticket) {
            slot.take();
        }
    }

    pub fn has_pending_expectation(&self) -> bool {
        self.expectation.lock().is_some()
    }

    /// Compare an inbound frame against the pending expectation
    ///
    /// On a byte-exact match the waiter is woken and the slot emptied.
    pub fn offer(&self, frame: &[u8]) -> bool {
        let pending = {
            let mut slot = self.expectation.lock();
            match slot.as_ref() {
                Some(pending) if pending.expected.as_ref() == frame => slot.take(),
                _ => None,
            }
        };
        match pending {
            Some(pending) => {
                let _ = pending.tx.send(());
                true
            },
            None => false,
        }
    }
}

/// Lifecycle of a registered feeder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Identified,
    Disconnected,
}

/// Registry entry for one identified feeder
#[derive(Debug, Clone)]
pub struct FeederSession {
    identifier: DeviceIdentifier,
    connection: Option<Arc<Connection>>,
    last_responded: DateTime<Utc>,
    state: SessionState,
}

impl FeederSession {
    pub fn new(identifier: DeviceIdentifier, connection: Arc<Connection>) -> Self {
        Self {
            identifier,
            connection: Some(connection),
            last_responded: Utc::now(),
            state: SessionState::Identified,
        }
    }

    pub fn identifier(&self) -> &DeviceIdentifier {
        &self.identifier
    }

    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.connection.as_ref()
    }

    pub fn last_responded(&self) -> DateTime<Utc> {
        self.last_responded
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Identified with an open socket
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Identified
            && self.connection.as_ref().is_some_and(|conn| !conn.is_closed())
    }

    pub fn touch(&mut self) {
        self.last_responded = Utc::now();
    }

    pub(crate) fn set_last_responded(&mut self, at: DateTime<Utc>) {
        self.last_responded = at;
    }

    /// Swap in a new socket, handing back the superseded one
    pub fn replace_connection(&mut self, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        self.state = SessionState::Identified;
        self.touch();
        self.connection.replace(connection)
    }

    /// Drop the socket and keep the session for status queries
    pub fn mark_disconnected(&mut self) -> Option<Arc<Connection>> {
        self.state = SessionState::Disconnected;
        self.connection.take()
    }

    pub fn status(&self, availability_window: Duration) -> FeederStatus {
        let window = chrono::Duration::from_std(availability_window)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let recent = Utc::now().signed_duration_since(self.last_responded) <= window;
        FeederStatus {
            identifier: self.identifier.clone(),
            last_responded: Some(self.last_responded),
            is_available: self.is_connected() && recent,
        }
    }
}

/// Reachability report handed to the external API layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeederStatus {
    pub identifier: DeviceIdentifier,
    pub last_responded: Option<DateTime<Utc>>,
    pub is_available: bool,
}
