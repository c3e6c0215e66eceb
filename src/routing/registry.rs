//! # Connection Registry
//!
//! Relay-side table of authenticated peers.
//!
//! ## Concurrency
//! The table is a registration-ordered `Vec` behind a `parking_lot::RwLock`.
//! Writers (handshake and disconnect paths) hold the write lock only long
//! enough to push or remove one record. Readers take a [`snapshot`] (a cloned
//! `Vec` of `Arc`s) and iterate it without holding any lock, so routing never
//! observes a half-mutated peer set and never blocks a handshake for longer
//! than a copy.
//!
//! Freshness (`last_write`) lives in an atomic on each record, so `touch`
//! needs no lock at all.
//!
//! ## Invariant
//! At most one record per `unique_id`. A second registration for an id that
//! is already present is rejected, never replaced.
//!
//! [`snapshot`]: ConnectionRegistry::snapshot

use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::core::codec::Frame;
use crate::error::{constants, ProtocolError, Result};
use crate::transport::tcp::Outbound;
use crate::utils::time::WriteClock;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Write side of one peer connection
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    /// Handle plus the receiver a writer task drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn send(&self, command: Outbound) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub fn send_frame(&self, frame: Frame) -> Result<()> {
        self.send(Outbound::Frame(frame))
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One authenticated peer as seen by the relay
pub struct PeerRecord {
    unique_id: String,
    group: String,
    authenticated: bool,
    last_write: AtomicU64,
    connection: ConnectionHandle,
}

impl fmt::Debug for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRecord")
            .field("unique_id", &self.unique_id)
            .field("group", &self.group)
            .field("authenticated", &self.authenticated)
            .field("last_write", &self.last_write())
            .field("connection", &self.connection)
            .finish()
    }
}

impl PeerRecord {
    /// Record for a peer whose handshake succeeded
    pub fn new(
        unique_id: impl Into<String>,
        group: impl Into<String>,
        connection: ConnectionHandle,
    ) -> Self {
        Self {
            unique_id: unique_id.into(),
            group: group.into(),
            authenticated: true,
            last_write: AtomicU64::new(0),
            connection,
        }
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn last_write(&self) -> u64 {
        self.last_write.load(Ordering::Acquire)
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }
}

/// Table of authenticated peers, in registration order
#[derive(Default)]
pub struct ConnectionRegistry {
    peers: RwLock<Vec<Arc<PeerRecord>>>,
    clock: WriteClock,
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("peers", &self.len())
            .finish()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer, rejecting an id that is already registered
    pub fn add(&self, record: PeerRecord) -> Result<Arc<PeerRecord>> {
        self.add_and_announce(record, |_| {})
    }

    /// Add a peer and run `announce` before any other task can observe it.
    ///
    /// `announce` runs under the write lock, so frames it queues on the
    /// peer's connection precede anything routed to the peer afterwards.
    /// It must not block.
    pub fn add_and_announce<F>(&self, record: PeerRecord, announce: F) -> Result<Arc<PeerRecord>>
    where
        F: FnOnce(&PeerRecord),
    {
        let mut peers = self.peers.write();
        if peers.iter().any(|p| p.unique_id == record.unique_id) {
            return Err(ProtocolError::AuthenticationFailure(
                constants::ERR_DUPLICATE_PEER.to_string(),
            ));
        }
        announce(&record);
        let record = Arc::new(record);
        peers.push(Arc::clone(&record));
        debug!(peer = %record.unique_id, group = %record.group, total = peers.len(), "Peer registered");
        Ok(record)
    }

    /// Remove exactly this record; a newer record under the same id is untouched
    pub fn remove(&self, record: &PeerRecord) -> bool {
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|p| p.connection.id != record.connection.id);
        let removed = peers.len() != before;
        if removed {
            debug!(peer = %record.unique_id, total = peers.len(), "Peer removed");
        }
        removed
    }

    pub fn exists(&self, unique_id: &str) -> bool {
        self.peers.read().iter().any(|p| p.unique_id == unique_id)
    }

    pub fn get(&self, unique_id: &str) -> Option<Arc<PeerRecord>> {
        self.peers
            .read()
            .iter()
            .find(|p| p.unique_id == unique_id)
            .cloned()
    }

    /// Consistent copy of the current peer set, in registration order
    pub fn snapshot(&self) -> Vec<Arc<PeerRecord>> {
        self.peers.read().clone()
    }

    /// Mark a write to this peer just now
    pub fn touch(&self, record: &PeerRecord) {
        let stamp = self.clock.tick();
        record.last_write.store(stamp, Ordering::Release);
        trace!(peer = %record.unique_id, stamp, "Peer touched");
    }

    /// Queue a frame on the peer's connection and refresh its freshness
    pub fn deliver(&self, record: &PeerRecord, frame: Frame) -> Result<()> {
        record.connection.send_frame(frame)?;
        self.touch(record);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every registered connection
    pub fn close_all(&self) {
        for peer in self.snapshot() {
            peer.connection.close();
        }
    }
}
