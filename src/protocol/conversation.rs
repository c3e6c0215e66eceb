//! # Conversation Manager
//!
//! Correlates outbound requests with inbound responses by conversation id.
//!
//! A conversation is registered by the peer that starts it and is never
//! visible to anyone else. Responses are matched purely by
//! [`ConversationId`]; the payload tag only decides whether a matched
//! envelope counts as the expected response.
//!
//! ## Retirement
//! A conversation is retired by exactly one of: the first expected response
//! (single mode), an error response (single mode), an explicit
//! [`ConversationManager::cancel`], a local failure, or its timer firing.
//! Every path goes through one atomic `DashMap::remove`, so whichever path
//! wins is the only one that runs callbacks; the losers see nothing to
//! remove and do nothing. The winner also aborts the timer task.
//!
//! ## Concurrency
//! The table is a sharded `DashMap` touched from connection tasks and timer
//! tasks. Callbacks always run after the shard guard is released, so a
//! callback may register or cancel conversations itself.
//!
//! A concurrent conversation can receive a response while its timer fires.
//! Retirement marks the collected list closed, and response delivery holds
//! the conversation's callback gate, which the timeout path also takes
//! before it collects. A response is therefore either part of the list
//! handed to `on_timeout` (with its `on_response` already finished) or
//! rejected as late.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, error, trace, warn};

use crate::core::packet::{Packet, PacketType};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::envelope::{ConversationId, Envelope, ErrorPacket};

/// How many responses a conversation accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseMode {
    /// Retire on the first matching response
    #[default]
    Single,
    /// Stay open until timeout or cancellation, collecting every response
    Concurrent,
}

type ResponseCallback = Box<dyn Fn(&Envelope, &dyn Packet) + Send + Sync>;
type TimeoutCallback = Box<dyn FnOnce(Vec<Envelope>) + Send>;
type ErrorCallback = Box<dyn Fn(&ErrorPacket) + Send + Sync>;

/// Expectations and callbacks for a new conversation
pub struct ConversationOptions {
    expected_tag: &'static str,
    mode: ResponseMode,
    timeout: Option<Duration>,
    override_default_handlers: bool,
    always_notify_on_timeout: bool,
    on_response: Option<ResponseCallback>,
    on_timeout: Option<TimeoutCallback>,
    on_error: Option<ErrorCallback>,
}

impl fmt::Debug for ConversationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationOptions")
            .field("expected_tag", &self.expected_tag)
            .field("mode", &self.mode)
            .field("timeout", &self.timeout)
            .field("override_default_handlers", &self.override_default_handlers)
            .field("always_notify_on_timeout", &self.always_notify_on_timeout)
            .finish_non_exhaustive()
    }
}

impl ConversationOptions {
    /// Expect responses of packet type `T`
    pub fn expecting<T: PacketType>() -> Self {
        Self::expecting_tag(T::TAG)
    }

    /// Expect responses carrying `tag`
    pub fn expecting_tag(tag: &'static str) -> Self {
        Self {
            expected_tag: tag,
            mode: ResponseMode::Single,
            timeout: None,
            override_default_handlers: false,
            always_notify_on_timeout: false,
            on_response: None,
            on_timeout: None,
            on_error: None,
        }
    }

    pub fn mode(mut self, mode: ResponseMode) -> Self {
        self.mode = mode;
        self
    }

    /// Deadline for this conversation; the manager default applies otherwise
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Keep claimed envelopes away from the general handler chain
    pub fn override_default_handlers(mut self, value: bool) -> Self {
        self.override_default_handlers = value;
        self
    }

    /// Run `on_timeout` even when nothing was collected
    pub fn always_notify_on_timeout(mut self, value: bool) -> Self {
        self.always_notify_on_timeout = value;
        self
    }

    pub fn on_response<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Envelope, &dyn Packet) + Send + Sync + 'static,
    {
        self.on_response = Some(Box::new(callback));
        self
    }

    pub fn on_timeout<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Vec<Envelope>) + Send + 'static,
    {
        self.on_timeout = Some(Box::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ErrorPacket) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(callback));
        self
    }

    pub fn expected_tag(&self) -> &'static str {
        self.expected_tag
    }
}

/// One outstanding request owned by this peer
pub struct Conversation {
    id: ConversationId,
    original_request: Envelope,
    expected_tag: &'static str,
    mode: ResponseMode,
    override_default_handlers: bool,
    always_notify_on_timeout: bool,
    deadline: Instant,
    on_response: Option<ResponseCallback>,
    on_timeout: Mutex<Option<TimeoutCallback>>,
    on_error: Option<ErrorCallback>,
    collected: Mutex<Collected>,
    callbacks: Mutex<()>,
    timer: Mutex<Option<AbortHandle>>,
}

#[derive(Default)]
struct Collected {
    envelopes: Vec<Envelope>,
    retired: bool,
}

impl fmt::Debug for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conversation")
            .field("id", &self.id)
            .field("expected_tag", &self.expected_tag)
            .field("mode", &self.mode)
            .field("deadline", &self.deadline)
            .field("collected", &self.collected.lock().envelopes.len())
            .finish_non_exhaustive()
    }
}

impl Conversation {
    pub fn id(&self) -> ConversationId {
        self.id
    }

    pub fn original_request(&self) -> &Envelope {
        &self.original_request
    }

    pub fn expected_tag(&self) -> &'static str {
        self.expected_tag
    }

    pub fn mode(&self) -> ResponseMode {
        self.mode
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }
}

/// What the manager did with an inbound envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// No live conversation took the envelope
    Unclaimed,
    /// A conversation consumed the envelope
    Claimed { override_default_handlers: bool },
}

impl Claim {
    pub fn is_claimed(&self) -> bool {
        matches!(self, Claim::Claimed { .. })
    }

    /// Whether the general handler chain must be skipped
    pub fn suppresses_handlers(&self) -> bool {
        matches!(
            self,
            Claim::Claimed {
                override_default_handlers: true
            }
        )
    }
}

struct ManagerInner {
    conversations: DashMap<ConversationId, Arc<Conversation>>,
    default_timeout: Duration,
}

/// Per-peer table of outstanding conversations
#[derive(Clone)]
pub struct ConversationManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for ConversationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationManager")
            .field("pending", &self.pending())
            .field("default_timeout", &self.inner.default_timeout)
            .finish()
    }
}

impl ConversationManager {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                conversations: DashMap::new(),
                default_timeout,
            }),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    /// Register a conversation for `request` and start its timer.
    ///
    /// A fresh id is allocated and written into `request.conversation_id`.
    /// Must be called from within a Tokio runtime.
    pub fn register(
        &self,
        request: &mut Envelope,
        options: ConversationOptions,
    ) -> Result<ConversationId> {
        let runtime = Handle::try_current()
            .map_err(|_| ProtocolError::Custom(constants::ERR_NO_RUNTIME.into()))?;
        let timeout = options.timeout.unwrap_or(self.inner.default_timeout);

        let conversation = loop {
            let id = ConversationId::random();
            match self.inner.conversations.entry(id) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    request.conversation_id = id;
                    let conversation = Arc::new(Conversation {
                        id,
                        original_request: request.clone(),
                        expected_tag: options.expected_tag,
                        mode: options.mode,
                        override_default_handlers: options.override_default_handlers,
                        always_notify_on_timeout: options.always_notify_on_timeout,
                        deadline: Instant::now() + timeout,
                        on_response: options.on_response,
                        on_timeout: Mutex::new(options.on_timeout),
                        on_error: options.on_error,
                        collected: Mutex::new(Collected::default()),
                        callbacks: Mutex::new(()),
                        timer: Mutex::new(None),
                    });
                    slot.insert(Arc::clone(&conversation));
                    break conversation;
                }
            }
        };

        let id = conversation.id;
        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let timer = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                ConversationManager { inner }.expire(id);
            }
        });
        *conversation.timer.lock() = Some(timer.abort_handle());
        // Retired before the timer handle was stored
        if !self.inner.conversations.contains_key(&id) {
            conversation.cancel_timer();
        }

        debug!(conversation_id = %id, expected = conversation.expected_tag, ?timeout, "Conversation registered");
        Ok(id)
    }

    /// Offer an inbound envelope and its decoded payload to the conversations.
    pub fn on_envelope_received(&self, envelope: &Envelope, packet: &dyn Packet) -> Claim {
        let id = envelope.conversation_id;
        let Some(conversation) = self
            .inner
            .conversations
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return Claim::Unclaimed;
        };

        if let Some(error) = packet.downcast_ref::<ErrorPacket>() {
            let _gate = conversation.callbacks.lock();
            let live = match conversation.mode {
                ResponseMode::Single => self.retire(id).is_some(),
                ResponseMode::Concurrent => !conversation.collected.lock().retired,
            };
            if !live {
                return Claim::Unclaimed;
            }
            debug!(conversation_id = %id, kind = ?error.kind, "Conversation received error");
            if let Some(on_error) = &conversation.on_error {
                guarded("on_error", || on_error(error));
            }
            return Claim::Claimed {
                override_default_handlers: conversation.override_default_handlers,
            };
        }

        if packet.tag() != conversation.expected_tag {
            warn!(
                conversation_id = %id,
                expected = conversation.expected_tag,
                actual = packet.tag(),
                "Response tag mismatch, leaving conversation open"
            );
            return Claim::Unclaimed;
        }

        let _gate = conversation.callbacks.lock();
        let accepted = match conversation.mode {
            ResponseMode::Single => {
                let retired = self.retire(id).is_some();
                if retired {
                    conversation.collected.lock().envelopes.push(envelope.clone());
                }
                retired
            }
            ResponseMode::Concurrent => {
                let mut collected = conversation.collected.lock();
                if !collected.retired {
                    collected.envelopes.push(envelope.clone());
                }
                !collected.retired
            }
        };
        if !accepted {
            trace!(conversation_id = %id, "Late response for retired conversation");
            return Claim::Unclaimed;
        }

        if let Some(on_response) = &conversation.on_response {
            guarded("on_response", || on_response(envelope, packet));
        }

        Claim::Claimed {
            override_default_handlers: conversation.override_default_handlers,
        }
    }

    /// Retire a conversation early without running any callback
    pub fn cancel(&self, id: ConversationId) -> bool {
        let cancelled = self.retire(id).is_some();
        if cancelled {
            debug!(conversation_id = %id, "Conversation cancelled");
        }
        cancelled
    }

    /// Retire a conversation with a locally produced error
    pub fn fail(&self, id: ConversationId, error: &ErrorPacket) -> bool {
        let Some(conversation) = self.retire(id) else {
            return false;
        };
        debug!(conversation_id = %id, kind = ?error.kind, "Conversation failed locally");
        if let Some(on_error) = &conversation.on_error {
            guarded("on_error", || on_error(error));
        }
        true
    }

    /// Timer path: retire and notify, if still present
    fn expire(&self, id: ConversationId) {
        let Some(conversation) = self.retire(id) else {
            return;
        };
        // Waits for an in-flight on_response to finish
        let _gate = conversation.callbacks.lock();
        let collected = std::mem::take(&mut conversation.collected.lock().envelopes);
        let notify = conversation.always_notify_on_timeout || !collected.is_empty();
        debug!(conversation_id = %id, collected = collected.len(), notify, "Conversation timed out");
        if !notify {
            return;
        }
        let callback = conversation.on_timeout.lock().take();
        if let Some(on_timeout) = callback {
            guarded("on_timeout", move || on_timeout(collected));
        }
    }

    /// The single removal point for every retirement path
    fn retire(&self, id: ConversationId) -> Option<Arc<Conversation>> {
        let (_, conversation) = self.inner.conversations.remove(&id)?;
        conversation.cancel_timer();
        conversation.collected.lock().retired = true;
        Some(conversation)
    }

    pub fn contains(&self, id: ConversationId) -> bool {
        self.inner.conversations.contains_key(&id)
    }

    pub fn get(&self, id: ConversationId) -> Option<Arc<Conversation>> {
        self.inner
            .conversations
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Number of live conversations
    pub fn pending(&self) -> usize {
        self.inner.conversations.len()
    }

    /// Handle for a registered conversation
    pub fn handle(&self, id: ConversationId) -> ConversationHandle {
        ConversationHandle {
            id,
            manager: self.clone(),
        }
    }
}

/// Caller-side view of a registered conversation
#[derive(Debug, Clone)]
pub struct ConversationHandle {
    id: ConversationId,
    manager: ConversationManager,
}

impl ConversationHandle {
    pub fn id(&self) -> ConversationId {
        self.id
    }

    /// Whether the conversation is still waiting for responses
    pub fn is_active(&self) -> bool {
        self.manager.contains(self.id)
    }

    pub fn cancel(&self) -> bool {
        self.manager.cancel(self.id)
    }
}

fn guarded<F: FnOnce()>(callback: &'static str, f: F) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        error!(callback, reason = %panic_message(&panic), "Conversation callback panicked");
    }
}

pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use crate::protocol::envelope::{ErrorKind, TargetType};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pong(u32);
    impl PacketType for Pong {
        const TAG: &'static str = "test.pong";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Other;
    impl PacketType for Other {
        const TAG: &'static str = "test.other";
    }

    fn request() -> Envelope {
        Envelope::new("alpha", "beta", TargetType::Direct, ConversationId(0), &Other).unwrap()
    }

    fn response(id: ConversationId, packet: &dyn Packet) -> Envelope {
        Envelope::new("beta", "alpha", TargetType::Direct, id, packet).unwrap()
    }

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let c = Arc::new(AtomicUsize::new(0));
        (Arc::clone(&c), c)
    }

    #[tokio::test]
    async fn test_register_assigns_id_to_request() {
        let manager = ConversationManager::new(Duration::from_secs(5));
        let mut req = request();
        let id = manager
            .register(&mut req, ConversationOptions::expecting::<Pong>())
            .unwrap();
        assert_eq!(req.conversation_id, id);
        assert!(manager.contains(id));
        assert_eq!(manager.get(id).unwrap().original_request(), &req);
    }

    #[test]
    fn test_register_without_runtime_fails() {
        let manager = ConversationManager::new(Duration::from_secs(5));
        let result = manager.register(&mut request(), ConversationOptions::expecting::<Pong>());
        assert!(matches!(result, Err(ProtocolError::Custom(_))));
        assert_eq!(manager.pending(), 0);
    }

    #[tokio::test]
    async fn test_single_mode_only_first_response_counts() {
        let manager = ConversationManager::new(Duration::from_secs(5));
        let (responses, seen) = counter();
        let (timeouts, timed_out) = counter();
        let mut req = request();
        let id = manager
            .register(
                &mut req,
                ConversationOptions::expecting::<Pong>()
                    .timeout(Duration::from_millis(1000))
                    .always_notify_on_timeout(true)
                    .on_response(move |_, _| {
                        seen.fetch_add(1, Ordering::SeqCst);
                    })
                    .on_timeout(move |_| {
                        timed_out.fetch_add(1, Ordering::SeqCst);
                    }),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let first = manager.on_envelope_received(&response(id, &Pong(1)), &Pong(1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = manager.on_envelope_received(&response(id, &Pong(2)), &Pong(2));

        assert!(first.is_claimed());
        assert_eq!(second, Claim::Unclaimed);
        assert_eq!(responses.load(Ordering::SeqCst), 1);
        assert!(!manager.contains(id));

        // The cancelled timer must never fire
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(timeouts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_mode_collects_until_timeout() {
        let manager = ConversationManager::new(Duration::from_secs(5));
        let (responses, seen) = counter();
        let collected = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&collected);
        let mut req = request();
        let id = manager
            .register(
                &mut req,
                ConversationOptions::expecting::<Pong>()
                    .mode(ResponseMode::Concurrent)
                    .timeout(Duration::from_millis(100))
                    .on_response(move |_, _| {
                        seen.fetch_add(1, Ordering::SeqCst);
                    })
                    .on_timeout(move |envelopes| {
                        *sink.lock() = Some(envelopes.len());
                    }),
            )
            .unwrap();

        for n in 0..3 {
            let claim = manager.on_envelope_received(&response(id, &Pong(n)), &Pong(n));
            assert!(claim.is_claimed());
        }
        assert!(manager.contains(id));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(responses.load(Ordering::SeqCst), 3);
        assert_eq!(*collected.lock(), Some(3));
        assert!(!manager.contains(id));
    }

    #[tokio::test]
    async fn test_timeout_without_responses_is_silent_unless_forced() {
        let manager = ConversationManager::new(Duration::from_millis(30));
        let (quiet, quiet_hits) = counter();
        let (loud, loud_hits) = counter();

        manager
            .register(
                &mut request(),
                ConversationOptions::expecting::<Pong>().on_timeout(move |_| {
                    quiet_hits.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        manager
            .register(
                &mut request(),
                ConversationOptions::expecting::<Pong>()
                    .always_notify_on_timeout(true)
                    .on_timeout(move |collected| {
                        assert!(collected.is_empty());
                        loud_hits.fetch_add(1, Ordering::SeqCst);
                    }),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(quiet.load(Ordering::SeqCst), 0);
        assert_eq!(loud.load(Ordering::SeqCst), 1);
        assert_eq!(manager.pending(), 0);
    }

    #[tokio::test]
    async fn test_mismatched_tag_does_not_retire() {
        let manager = ConversationManager::new(Duration::from_secs(5));
        let mut req = request();
        let id = manager
            .register(&mut req, ConversationOptions::expecting::<Pong>())
            .unwrap();

        let claim = manager.on_envelope_received(&response(id, &Other), &Other);
        assert_eq!(claim, Claim::Unclaimed);
        assert!(manager.contains(id));

        let claim = manager.on_envelope_received(&response(id, &Pong(0)), &Pong(0));
        assert!(claim.is_claimed());
        assert!(!manager.contains(id));
    }

    #[tokio::test]
    async fn test_unknown_conversation_is_unclaimed() {
        let manager = ConversationManager::new(Duration::from_secs(5));
        let claim = manager.on_envelope_received(&response(ConversationId(42), &Pong(0)), &Pong(0));
        assert_eq!(claim, Claim::Unclaimed);
    }

    #[tokio::test]
    async fn test_error_packet_single_mode_retires() {
        let manager = ConversationManager::new(Duration::from_secs(5));
        let (errors, hits) = counter();
        let (responses, seen) = counter();
        let mut req = request();
        let id = manager
            .register(
                &mut req,
                ConversationOptions::expecting::<Pong>()
                    .on_error(move |e| {
                        assert_eq!(e.kind, ErrorKind::NoTargetFound);
                        hits.fetch_add(1, Ordering::SeqCst);
                    })
                    .on_response(move |_, _| {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }),
            )
            .unwrap();

        let error = ErrorPacket::new(ErrorKind::NoTargetFound, "gone");
        assert!(manager
            .on_envelope_received(&response(id, &error), &error)
            .is_claimed());
        assert!(!manager.contains(id));
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        manager.on_envelope_received(&response(id, &Pong(0)), &Pong(0));
        assert_eq!(responses.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_error_packet_concurrent_mode_stays_open() {
        let manager = ConversationManager::new(Duration::from_secs(5));
        let (errors, hits) = counter();
        let mut req = request();
        let id = manager
            .register(
                &mut req,
                ConversationOptions::expecting::<Pong>()
                    .mode(ResponseMode::Concurrent)
                    .on_error(move |_| {
                        hits.fetch_add(1, Ordering::SeqCst);
                    }),
            )
            .unwrap();

        let error = ErrorPacket::remote("one worker failed");
        manager.on_envelope_received(&response(id, &error), &error);
        assert!(manager.contains(id));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_silences_timeout() {
        let manager = ConversationManager::new(Duration::from_secs(5));
        let (timeouts, hits) = counter();
        let mut req = request();
        let id = manager
            .register(
                &mut req,
                ConversationOptions::expecting::<Pong>()
                    .timeout(Duration::from_millis(30))
                    .always_notify_on_timeout(true)
                    .on_timeout(move |_| {
                        hits.fetch_add(1, Ordering::SeqCst);
                    }),
            )
            .unwrap();

        let handle = manager.handle(id);
        assert!(handle.is_active());
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(!manager.fail(id, &ErrorPacket::remote("late")));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(timeouts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fail_delivers_local_error_once() {
        let manager = ConversationManager::new(Duration::from_secs(5));
        let (errors, hits) = counter();
        let mut req = request();
        let id = manager
            .register(
                &mut req,
                ConversationOptions::expecting::<Pong>().on_error(move |e| {
                    assert_eq!(e.kind, ErrorKind::QueueExpired);
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let error = ErrorPacket::new(ErrorKind::QueueExpired, "expired");
        assert!(manager.fail(id, &error));
        assert!(!manager.fail(id, &error));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_callback_is_contained() {
        let manager = ConversationManager::new(Duration::from_secs(5));
        let mut req = request();
        let id = manager
            .register(
                &mut req,
                ConversationOptions::expecting::<Pong>().on_response(|_, _| panic!("boom")),
            )
            .unwrap();

        let claim = manager.on_envelope_received(&response(id, &Pong(1)), &Pong(1));
        assert!(claim.is_claimed());
        assert!(!manager.contains(id));
    }

    #[tokio::test]
    async fn test_override_flag_is_reported() {
        let manager = ConversationManager::new(Duration::from_secs(5));
        let mut req = request();
        let id = manager
            .register(
                &mut req,
                ConversationOptions::expecting::<Pong>().override_default_handlers(true),
            )
            .unwrap();
        let claim = manager.on_envelope_received(&response(id, &Pong(1)), &Pong(1));
        assert!(claim.suppresses_handlers());
    }

    #[tokio::test]
    async fn test_racing_responses_fire_once() {
        let manager = ConversationManager::new(Duration::from_secs(5));
        let (responses, seen) = counter();
        let mut req = request();
        let id = manager
            .register(
                &mut req,
                ConversationOptions::expecting::<Pong>().on_response(move |_, _| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let mut threads = Vec::new();
        for n in 0..8 {
            let manager = manager.clone();
            threads.push(std::thread::spawn(move || {
                manager
                    .on_envelope_received(&response(id, &Pong(n)), &Pong(n))
                    .is_claimed()
            }));
        }
        let claimed = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|c| *c)
            .count();
        assert_eq!(claimed, 1);
        assert_eq!(responses.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_responses_racing_expiry_are_never_lost() {
        for _ in 0..20 {
            let manager = ConversationManager::new(Duration::from_secs(5));
            let (responses, seen) = counter();
            let timed_out = Arc::new(std::sync::atomic::AtomicBool::new(false));
            let (late, late_hits) = counter();
            let collected = Arc::new(Mutex::new(None));

            let flag = Arc::clone(&timed_out);
            let sink = Arc::clone(&collected);
            let done = Arc::clone(&timed_out);
            let id = manager
                .register(
                    &mut request(),
                    ConversationOptions::expecting::<Pong>()
                        .mode(ResponseMode::Concurrent)
                        .timeout(Duration::from_millis(20))
                        .always_notify_on_timeout(true)
                        .on_response(move |_, _| {
                            if flag.load(Ordering::SeqCst) {
                                late_hits.fetch_add(1, Ordering::SeqCst);
                            }
                            seen.fetch_add(1, Ordering::SeqCst);
                        })
                        .on_timeout(move |envelopes| {
                            done.store(true, Ordering::SeqCst);
                            *sink.lock() = Some(envelopes.len());
                        }),
                )
                .unwrap();

            let senders: Vec<_> = (0..4)
                .map(|_| {
                    let manager = manager.clone();
                    tokio::task::spawn_blocking(move || {
                        let reply = response(id, &Pong(1));
                        while manager.contains(id) {
                            manager.on_envelope_received(&reply, &Pong(1));
                        }
                        // A few more after retirement
                        for _ in 0..10 {
                            assert_eq!(
                                manager.on_envelope_received(&reply, &Pong(1)),
                                Claim::Unclaimed
                            );
                        }
                    })
                })
                .collect();
            for sender in senders {
                sender.await.unwrap();
            }

            // The timer task may still be inside on_timeout
            for _ in 0..100 {
                if collected.lock().is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert!(timed_out.load(Ordering::SeqCst));
            assert_eq!(late.load(Ordering::SeqCst), 0);
            assert_eq!(*collected.lock(), Some(responses.load(Ordering::SeqCst)));
        }
    }
}
