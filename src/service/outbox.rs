//! Outbound queue used while a client is disconnected.
//!
//! Every queued envelope carries its own expiry. Expired entries are never
//! sent: if the envelope started a conversation that is still pending, that
//! conversation is failed with [`ErrorKind::QueueExpired`] so the caller
//! hears about it; otherwise the drop is logged. Entries still queued when
//! the client gives up for good are failed with [`ErrorKind::NotConnected`].
//!
//! Expiry does not wait for a reconnect attempt: every push first pops the
//! expired head of the queue, and the client purges on a timer.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::constants;
use crate::protocol::conversation::ConversationManager;
use crate::protocol::envelope::{Envelope, ErrorKind, ErrorPacket};

#[derive(Debug)]
struct QueuedEnvelope {
    envelope: Envelope,
    expires_at: Instant,
}

/// FIFO of envelopes waiting for a connection
#[derive(Debug)]
pub struct Outbox {
    entries: Mutex<VecDeque<QueuedEnvelope>>,
    lifetime: Duration,
}

impl Outbox {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            lifetime,
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Queue `envelope`, returning the expired entries it displaced.
    ///
    /// The caller reports those with [`notify_expired`] once its own locks
    /// are released.
    pub fn push(&self, envelope: Envelope) -> Vec<Envelope> {
        let mut entries = self.entries.lock();
        let expired = pop_expired(&mut entries, Instant::now());
        debug!(
            to = %envelope.target,
            conversation_id = %envelope.conversation_id,
            queued = entries.len() + 1,
            "Envelope queued until reconnect"
        );
        entries.push_back(QueuedEnvelope {
            envelope,
            expires_at: Instant::now() + self.lifetime,
        });
        expired
    }

    /// Take every entry, split into `(live, expired)`, both in queue order.
    ///
    /// Expired envelopes are returned rather than reported so the caller can
    /// run [`notify_expired`] after releasing its own locks.
    pub fn take(&self) -> (Vec<Envelope>, Vec<Envelope>) {
        let now = Instant::now();
        let mut live = Vec::new();
        let mut expired = Vec::new();
        for entry in self.entries.lock().drain(..) {
            if entry.expires_at > now {
                live.push(entry.envelope);
            } else {
                expired.push(entry.envelope);
            }
        }
        (live, expired)
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self, conversations: &ConversationManager) -> usize {
        let expired = pop_expired(&mut self.entries.lock(), Instant::now());
        let count = expired.len();
        notify_expired(expired, conversations);
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Entries are pushed in expiry order, so expired ones sit at the front
fn pop_expired(entries: &mut VecDeque<QueuedEnvelope>, now: Instant) -> Vec<Envelope> {
    let mut expired = Vec::new();
    while entries.front().is_some_and(|entry| entry.expires_at <= now) {
        if let Some(entry) = entries.pop_front() {
            expired.push(entry.envelope);
        }
    }
    expired
}

/// Report expired envelopes: fail their conversation, or log the drop
pub fn notify_expired(expired: Vec<Envelope>, conversations: &ConversationManager) {
    for envelope in expired {
        let error = ErrorPacket::new(
            ErrorKind::QueueExpired,
            format!("queued envelope for '{}' expired", envelope.target),
        );
        if !conversations.fail(envelope.conversation_id, &error) {
            warn!(
                to = %envelope.target,
                conversation_id = %envelope.conversation_id,
                "Queued envelope expired before reconnect"
            );
        }
    }
}

/// Report envelopes that will never be sent because the client is finished
pub fn notify_abandoned(abandoned: Vec<Envelope>, conversations: &ConversationManager) {
    for envelope in abandoned {
        let error = ErrorPacket::new(ErrorKind::NotConnected, constants::ERR_NOT_CONNECTED);
        if !conversations.fail(envelope.conversation_id, &error) {
            warn!(
                to = %envelope.target,
                conversation_id = %envelope.conversation_id,
                "Queued envelope dropped, client is closed"
            );
        }
    }
}
