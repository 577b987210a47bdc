//! Connection registry
//!
//! Maps feeder identifiers to their sessions and correlates commands with
//! acknowledgements. Owned by the engine and shared through `Arc`.
//!
//! Uses `DashMap` for per-bucket locking: connection tasks and API callers
//! touch different feeders concurrently.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::{FeedSrvError, Result};
use crate::protocol::DeviceIdentifier;
use crate::session::{Connection, FeederSession, FeederStatus};

/// Result of an identification handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifyOutcome {
    /// First time this identifier is seen
    Registered,
    /// Known feeder on a new socket; the previous socket was closed
    Reconnected,
    /// Same socket identified again
    Refreshed,
}

/// Clears the expectation slot when `send_and_wait` returns or is dropped
struct ExpectationGuard<'a> {
    connection: &'a Connection,
    ticket: u64,
}

impl Drop for ExpectationGuard<'_> {
    fn drop(&mut self) {
        self.connection.clear_expectation(self.ticket);
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: DashMap<DeviceIdentifier, FeederSession>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `identifier` to `connection`
    ///
    /// A different socket already bound to the identifier is closed.
    pub fn identify(
        &self,
        identifier: DeviceIdentifier,
        connection: Arc<Connection>,
    ) -> IdentifyOutcome {
        let (outcome, superseded) = match self.sessions.entry(identifier.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(FeederSession::new(identifier.clone(), connection));
                (IdentifyOutcome::Registered, None)
            },
            Entry::Occupied(mut entry) => {
                let session = entry.get_mut();
                let same_socket = session.is_connected()
                    && session.connection().is_some_and(|c| c.id() == connection.id());
                if same_socket {
                    session.touch();
                    (IdentifyOutcome::Refreshed, None)
                } else {
                    let old = session.replace_connection(connection);
                    (IdentifyOutcome::Reconnected, old)
                }
            },
        };

        if let Some(old) = superseded {
            debug!(
                "Closing superseded connection #{} ({}) for {}",
                old.id(),
                old.peer(),
                identifier
            );
            old.close();
        }
        outcome
    }

    /// Refresh `last_responded` if `connection_id` is the feeder's current socket
    pub fn touch(&self, identifier: &DeviceIdentifier, connection_id: u64) {
        if let Some(mut session) = self.sessions.get_mut(identifier) {
            if session.connection().is_some_and(|c| c.id() == connection_id) {
                session.touch();
            }
        }
    }

    /// Live session for `identifier`, if it is connected
    pub fn lookup(&self, identifier: &DeviceIdentifier) -> Option<FeederSession> {
        self.sessions
            .get(identifier)
            .filter(|session| session.is_connected())
            .map(|session| session.value().clone())
    }

    /// Status of any known session, connected or not
    pub fn status(
        &self,
        identifier: &DeviceIdentifier,
        availability_window: Duration,
    ) -> Option<FeederStatus> {
        self.sessions
            .get(identifier)
            .map(|session| session.status(availability_window))
    }

    fn live_connection(&self, identifier: &DeviceIdentifier) -> Result<Arc<Connection>> {
        self.lookup(identifier)
            .and_then(|session| session.connection().cloned())
            .ok_or_else(|| FeedSrvError::not_connected(identifier))
    }

    /// Write a frame without waiting for a reply
    pub async fn send(&self, identifier: &DeviceIdentifier, frame: Bytes) -> Result<()> {
        let connection = self.live_connection(identifier)?;
        connection
            .send(frame)
            .await
            .map_err(|_| FeedSrvError::not_connected(identifier))
    }

    /// Write a frame and wait for `expected` on the same socket
    ///
    /// The expectation is installed before the write. At most one command
    /// may be in flight per feeder; an overlapping call fails with
    /// `ConcurrentCommand`.
    pub async fn send_and_wait(
        &self,
        identifier: &DeviceIdentifier,
        frame: Bytes,
        expected: Bytes,
        timeout: Duration,
    ) -> Result<()> {
        let connection = self.live_connection(identifier)?;
        let (ticket, acknowledged) = connection
            .expect(expected)
            .ok_or_else(|| FeedSrvError::ConcurrentCommand(identifier.to_string()))?;
        let _guard = ExpectationGuard {
            connection: &connection,
            ticket,
        };

        connection
            .send(frame)
            .await
            .map_err(|_| FeedSrvError::not_connected(identifier))?;

        tokio::select! {
            biased;
            result = acknowledged => {
                result.map_err(|_| FeedSrvError::not_connected(identifier))
            }
            _ = connection.closed() => Err(FeedSrvError::not_connected(identifier)),
            _ = tokio::time::sleep(timeout) => Err(FeedSrvError::Timeout {
                identifier: identifier.to_string(),
                after: timeout,
            }),
        }
    }

    /// Mark the feeder disconnected if `connection_id` is still its socket
    pub fn disconnect(&self, identifier: &DeviceIdentifier, connection_id: u64) -> bool {
        let Some(mut session) = self.sessions.get_mut(identifier) else {
            return false;
        };
        if !session.connection().is_some_and(|c| c.id() == connection_id) {
            return false;
        }
        if let Some(connection) = session.mark_disconnected() {
            connection.close();
        }
        true
    }

    /// Remove sessions that have not responded for `max_idle`
    pub fn evict_idle(&self, max_idle: Duration) -> Vec<DeviceIdentifier> {
        match chrono::Duration::from_std(max_idle) {
            Ok(max_idle) => self.evict_idle_before(Utc::now() - max_idle),
            Err(_) => Vec::new(),
        }
    }

    /// Remove sessions whose last response is older than `cutoff`
    pub fn evict_idle_before(&self, cutoff: DateTime<Utc>) -> Vec<DeviceIdentifier> {
        let mut evicted = Vec::new();
        self.sessions.retain(|identifier, session| {
            if session.last_responded() >= cutoff {
                return true;
            }
            if let Some(connection) = session.mark_disconnected() {
                connection.close();
            }
            evicted.push(identifier.clone());
            false
        });

        if !evicted.is_empty() {
            info!("Evicted {} idle feeder session(s)", evicted.len());
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Status of every known feeder
    pub fn snapshot(&self, availability_window: Duration) -> Vec<FeederStatus> {
        self.sessions
            .iter()
            .map(|entry| entry.value().status(availability_window))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::protocol::codec::{acknowledgement_frame, Action};
    use std::net::SocketAddr;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn connection(id: u64) -> (Arc<Connection>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(8);
        let peer: SocketAddr = format!("127.0.0.1:{}", 40000 + id).parse().unwrap();
        (
            Arc::new(Connection::new(id, peer, tx, CancellationToken::new())),
            rx,
        )
    }

    fn feeder() -> DeviceIdentifier {
        DeviceIdentifier::new("ABC123456789").unwrap()
    }

    fn feed_now_frame() -> Bytes {
        Bytes::from_static(&[0x9D, 0xA1, 0x06, 0xA2, 0x00, 0x32])
    }

    #[test]
    fn test_identify_outcomes() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = connection(1);
        let (second, _rx2) = connection(2);

        assert_eq!(
            registry.identify(feeder(), first.clone()),
            IdentifyOutcome::Registered
        );
        assert_eq!(
            registry.identify(feeder(), first.clone()),
            IdentifyOutcome::Refreshed
        );
        assert!(!first.is_closed());

        assert_eq!(
            registry.identify(feeder(), second.clone()),
            IdentifyOutcome::Reconnected
        );
        assert!(first.is_closed(), "superseded socket must be closed");
        assert!(!second.is_closed());
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.lookup(&feeder()).unwrap().connection().unwrap().id(),
            2
        );
    }

    #[tokio::test]
    async fn test_send_unknown_feeder() {
        let registry = ConnectionRegistry::new();
        let result = registry.send(&feeder(), feed_now_frame()).await;
        assert!(matches!(result, Err(FeedSrvError::NotConnected(_))));
    }

    #[tokio::test]
    async fn test_send_writes_to_current_socket() {
        let registry = ConnectionRegistry::new();
        let (conn, mut rx) = connection(1);
        registry.identify(feeder(), conn);

        registry.send(&feeder(), feed_now_frame()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), feed_now_frame());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_and_wait_acknowledged_at_five_seconds() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, mut rx) = connection(1);
        registry.identify(feeder(), conn.clone());
        let ack = acknowledgement_frame(&feeder(), Action::FeedNow);

        let start = tokio::time::Instant::now();
        let waiter = {
            let registry = registry.clone();
            let ack = ack.clone();
            tokio::spawn(async move {
                registry
                    .send_and_wait(&feeder(), feed_now_frame(), ack, TIMEOUT)
                    .await
            })
        };

        assert_eq!(rx.recv().await.unwrap(), feed_now_frame());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(conn.offer(&ack));

        waiter.await.unwrap().unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < TIMEOUT);
        assert!(!conn.has_pending_expectation());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_and_wait_times_out_at_thirty_seconds() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = connection(1);
        registry.identify(feeder(), conn.clone());
        let ack = acknowledgement_frame(&feeder(), Action::FeedNow);

        let start = tokio::time::Instant::now();
        let result = registry
            .send_and_wait(&feeder(), feed_now_frame(), ack.clone(), TIMEOUT)
            .await;

        assert!(matches!(result, Err(FeedSrvError::Timeout { .. })));
        assert!(start.elapsed() >= TIMEOUT);
        assert!(!conn.has_pending_expectation());
        // A late acknowledgement finds nobody waiting
        assert!(!conn.offer(&ack));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_command_rejected() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, mut rx) = connection(1);
        registry.identify(feeder(), conn.clone());
        let ack = acknowledgement_frame(&feeder(), Action::FeedNow);

        let first = {
            let registry = registry.clone();
            let ack = ack.clone();
            tokio::spawn(async move {
                registry
                    .send_and_wait(&feeder(), feed_now_frame(), ack, TIMEOUT)
                    .await
            })
        };
        rx.recv().await.unwrap();

        let second = registry
            .send_and_wait(&feeder(), feed_now_frame(), ack.clone(), TIMEOUT)
            .await;
        assert!(matches!(second, Err(FeedSrvError::ConcurrentCommand(_))));

        assert!(conn.offer(&ack));
        first.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_closed_while_waiting() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, mut rx) = connection(1);
        registry.identify(feeder(), conn.clone());
        let ack = acknowledgement_frame(&feeder(), Action::ChangePlanning);

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .send_and_wait(&feeder(), feed_now_frame(), ack, TIMEOUT)
                    .await
            })
        };
        rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(registry.disconnect(&feeder(), 1));

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(FeedSrvError::NotConnected(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait_clears_expectation() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = connection(1);
        registry.identify(feeder(), conn.clone());
        let ack = acknowledgement_frame(&feeder(), Action::FeedNow);

        let feeder_id = feeder();
        let wait = registry.send_and_wait(&feeder_id, feed_now_frame(), ack, TIMEOUT);
        let cancelled = tokio::time::timeout(Duration::from_secs(1), wait).await;
        assert!(cancelled.is_err());
        assert!(!conn.has_pending_expectation());
    }

    #[test]
    fn test_disconnect_ignores_stale_connection() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = connection(1);
        let (second, _rx2) = connection(2);
        registry.identify(feeder(), first);
        registry.identify(feeder(), second.clone());

        assert!(!registry.disconnect(&feeder(), 1));
        assert!(registry.lookup(&feeder()).is_some());

        assert!(registry.disconnect(&feeder(), 2));
        assert!(second.is_closed());
        assert!(registry.lookup(&feeder()).is_none());

        let status = registry.status(&feeder(), TIMEOUT).unwrap();
        assert!(!status.is_available);
    }

    #[test]
    fn test_evict_idle_sessions() {
        let registry = ConnectionRegistry::new();
        let (stale, _rx1) = connection(1);
        let (fresh, _rx2) = connection(2);
        let stale_id = DeviceIdentifier::new("STALE1").unwrap();
        registry.identify(stale_id.clone(), stale.clone());
        registry.identify(feeder(), fresh.clone());

        registry
            .sessions
            .get_mut(&stale_id)
            .unwrap()
            .set_last_responded(Utc::now() - chrono::Duration::minutes(20));

        let evicted = registry.evict_idle(Duration::from_secs(600));
        assert_eq!(evicted, vec![stale_id]);
        assert!(stale.is_closed());
        assert!(!fresh.is_closed());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot(TIMEOUT).len(), 1);
    }
}
