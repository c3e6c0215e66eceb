//! # Dispatch Core
//!
//! Turns a received envelope into handler invocations.
//!
//! For each envelope the dispatcher decodes the payload through the
//! [`PacketRegistry`], offers it to the peer's [`ConversationManager`], and
//! unless a conversation claimed it with `override_default_handlers`, runs
//! every registered [`MessageHandler`] that accepts the packet.
//!
//! Handlers run inline on the connection task and must not block. Each one
//! is isolated: an `Err` or a panic is reported to the error hook and the
//! remaining handlers still run.
//!
//! Handlers never hold a pointer back to the client or relay that owns them.
//! Replies go through the [`ReplySender`] capability carried in the
//! [`MessageContext`], which keeps dispatch testable without a socket.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, trace, warn};

use crate::core::packet::{Packet, PacketRegistry, PacketType};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::conversation::{
    panic_message, ConversationHandle, ConversationManager, ConversationOptions,
};
use crate::protocol::envelope::{ConversationId, Envelope, TargetType};

/// Outbound capability handed to handlers
pub trait ReplySender: Send + Sync {
    /// Identity stamped as the source of outgoing envelopes
    fn local_id(&self) -> &str;

    /// Queue an envelope for delivery; never blocks
    fn send_envelope(&self, envelope: Envelope) -> Result<()>;

    /// Conversations owned by this peer
    fn conversations(&self) -> &ConversationManager;
}

impl<'a> dyn ReplySender + 'a {
    /// Send `packet` back to the source of `inbound` on the same conversation
    pub fn respond(&self, inbound: &Envelope, packet: &dyn Packet) -> Result<()> {
        let envelope = Envelope::new(
            self.local_id(),
            inbound.source.clone(),
            TargetType::Direct,
            inbound.conversation_id,
            packet,
        )?;
        self.send_envelope(envelope)
    }

    /// Start a new conversation by sending `packet`
    pub fn request(
        &self,
        target_type: TargetType,
        target: &str,
        packet: &dyn Packet,
        options: ConversationOptions,
    ) -> Result<ConversationHandle> {
        let mut envelope = Envelope::new(
            self.local_id(),
            target,
            target_type,
            ConversationId(0),
            packet,
        )?;
        let manager = self.conversations();
        let id = manager.register(&mut envelope, options)?;
        if let Err(e) = self.send_envelope(envelope) {
            manager.cancel(id);
            return Err(e);
        }
        Ok(manager.handle(id))
    }
}

/// Everything a handler sees about one inbound envelope
pub struct MessageContext<'a> {
    envelope: &'a Envelope,
    packet: &'a dyn Packet,
    link: &'a Arc<dyn ReplySender>,
}

impl<'a> MessageContext<'a> {
    pub fn new(envelope: &'a Envelope, packet: &'a dyn Packet, link: &'a Arc<dyn ReplySender>) -> Self {
        Self {
            envelope,
            packet,
            link,
        }
    }

    pub fn packet(&self) -> &dyn Packet {
        self.packet
    }

    /// The payload as a concrete type, if it is one
    pub fn packet_as<T: PacketType>(&self) -> Option<&T> {
        self.packet.downcast_ref::<T>()
    }

    pub fn envelope(&self) -> &Envelope {
        self.envelope
    }

    pub fn source(&self) -> &str {
        &self.envelope.source
    }

    pub fn target(&self) -> &str {
        &self.envelope.target
    }

    pub fn target_type(&self) -> TargetType {
        self.envelope.target_type
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.envelope.conversation_id
    }

    /// Owned reply capability, for work that finishes after the handler returns
    pub fn sender(&self) -> Arc<dyn ReplySender> {
        Arc::clone(self.link)
    }

    /// Answer the source on the inbound conversation
    pub fn reply_directly(&self, packet: &dyn Packet) -> Result<()> {
        self.link.respond(self.envelope, packet)
    }

    /// Answer the source and wait for a follow-up on a new conversation
    pub fn reply(
        &self,
        packet: &dyn Packet,
        options: ConversationOptions,
    ) -> Result<ConversationHandle> {
        self.link
            .request(TargetType::Direct, &self.envelope.source, packet, options)
    }
}

/// Handler contract for inbound packets
pub trait MessageHandler: Send + Sync {
    /// Identity reported to the error hook
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn accepts(&self, packet: &dyn Packet) -> bool;

    fn on_receive(&self, ctx: &MessageContext<'_>) -> Result<()>;
}

/// Handler built from a closure over one packet type
pub struct FnHandler<T, F> {
    name: String,
    callback: F,
    _packet: std::marker::PhantomData<fn(&T)>,
}

impl<T, F> MessageHandler for FnHandler<T, F>
where
    T: PacketType,
    F: Fn(&T, &MessageContext<'_>) -> Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, packet: &dyn Packet) -> bool {
        packet.is::<T>()
    }

    fn on_receive(&self, ctx: &MessageContext<'_>) -> Result<()> {
        match ctx.packet_as::<T>() {
            Some(packet) => (self.callback)(packet, ctx),
            None => Err(ProtocolError::UnexpectedMessage),
        }
    }
}

/// A handler that failed while processing one envelope
#[derive(Debug)]
pub struct HandlerFailure {
    pub handler: String,
    pub tag: &'static str,
    pub source: String,
    pub conversation_id: ConversationId,
    pub error: ProtocolError,
}

type ErrorHook = dyn Fn(&HandlerFailure) + Send + Sync;

/// What happened to one dispatched envelope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// The payload decoded against the registry
    pub decoded: bool,
    /// A conversation consumed the envelope
    pub claimed: bool,
    /// Handlers that accepted the packet and were invoked
    pub handled: usize,
    /// Handlers that returned an error or panicked
    pub failed: usize,
}

/// Handler chain for one peer
pub struct Dispatcher {
    packets: Arc<PacketRegistry>,
    handlers: RwLock<Vec<Arc<dyn MessageHandler>>>,
    error_hook: RwLock<Arc<ErrorHook>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("packets", &self.packets)
            .field("handlers", &self.handler_names())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(packets: Arc<PacketRegistry>) -> Self {
        Self {
            packets,
            handlers: RwLock::new(Vec::new()),
            error_hook: RwLock::new(Arc::new(log_failure) as Arc<ErrorHook>),
        }
    }

    pub fn packets(&self) -> &Arc<PacketRegistry> {
        &self.packets
    }

    /// Append a handler; handlers run in registration order
    pub fn register(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string()))?;
        debug!(handler = handler.name(), "Handler registered");
        handlers.push(handler);
        Ok(())
    }

    /// Register a closure for packets of type `T`
    pub fn register_fn<T, F>(&self, name: impl Into<String>, callback: F) -> Result<()>
    where
        T: PacketType,
        F: Fn(&T, &MessageContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnHandler {
            name: name.into(),
            callback,
            _packet: std::marker::PhantomData,
        }))
    }

    /// Replace the hook that receives handler failures
    pub fn set_error_hook<F>(&self, hook: F) -> Result<()>
    where
        F: Fn(&HandlerFailure) + Send + Sync + 'static,
    {
        let mut slot = self
            .error_hook
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string()))?;
        *slot = Arc::new(hook);
        Ok(())
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.handlers
            .read()
            .map(|handlers| handlers.iter().map(|h| h.name().to_string()).collect())
            .unwrap_or_default()
    }

    /// Decode an envelope and run it through conversations and handlers.
    ///
    /// Never fails: undecodable payloads are logged and dropped, handler
    /// failures go to the error hook.
    pub fn dispatch(&self, envelope: &Envelope, link: &Arc<dyn ReplySender>) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();

        let packet = match self.packets.deserialize(&envelope.payload) {
            Ok(packet) => packet,
            Err(ProtocolError::UnknownPacketType(tag)) => {
                warn!(
                    peer = %envelope.source,
                    conversation_id = %envelope.conversation_id,
                    %tag,
                    "Dropping envelope with unknown packet tag"
                );
                return outcome;
            }
            Err(e) => {
                warn!(
                    peer = %envelope.source,
                    conversation_id = %envelope.conversation_id,
                    error = %e,
                    "Failed to deserialize envelope payload"
                );
                return outcome;
            }
        };
        outcome.decoded = true;

        let claim = link
            .conversations()
            .on_envelope_received(envelope, packet.as_ref());
        outcome.claimed = claim.is_claimed();
        if claim.suppresses_handlers() {
            trace!(conversation_id = %envelope.conversation_id, "Conversation consumed envelope");
            return outcome;
        }

        let handlers = match self.handlers.read() {
            Ok(handlers) => handlers.clone(),
            Err(_) => {
                error!("{}", constants::ERR_DISPATCHER_READ_LOCK);
                return outcome;
            }
        };
        let hook: Arc<ErrorHook> = match self.error_hook.read() {
            Ok(hook) => Arc::clone(&hook),
            Err(_) => Arc::new(log_failure) as Arc<ErrorHook>,
        };

        let ctx = MessageContext::new(envelope, packet.as_ref(), link);
        for handler in handlers.iter().filter(|h| h.accepts(packet.as_ref())) {
            outcome.handled += 1;
            let error = match catch_unwind(AssertUnwindSafe(|| handler.on_receive(&ctx))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(panic) => ProtocolError::HandlerFailure {
                    handler: handler.name().to_string(),
                    message: panic_message(&panic),
                },
            };
            outcome.failed += 1;
            let failure = HandlerFailure {
                handler: handler.name().to_string(),
                tag: packet.tag(),
                source: envelope.source.clone(),
                conversation_id: envelope.conversation_id,
                error,
            };
            if catch_unwind(AssertUnwindSafe(|| hook(&failure))).is_err() {
                error!(handler = %failure.handler, "Error hook panicked");
            }
        }

        if outcome.handled == 0 && !outcome.claimed {
            debug!(tag = packet.tag(), peer = %envelope.source, "No handler accepted packet");
        }
        outcome
    }
}

fn log_failure(failure: &HandlerFailure) {
    error!(
        handler = %failure.handler,
        tag = failure.tag,
        peer = %failure.source,
        conversation_id = %failure.conversation_id,
        error = %failure.error,
        "Handler failed"
    );
}


#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::testing::RecordingLink;
    use super::*;
    use crate::protocol::envelope::ErrorPacket;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping(u32);
    impl PacketType for Ping {
        const TAG: &'static str = "test.ping";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pong(u32);
    impl PacketType for Pong {
        const TAG: &'static str = "test.pong";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Stranger;
    impl PacketType for Stranger {
        const TAG: &'static str = "test.stranger";
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            PacketRegistry::builder()
                .register::<Ping>()
                .register::<Pong>()
                .build(),
        )
    }

    fn inbound(packet: &dyn Packet, id: u64) -> Envelope {
        Envelope::new("alpha", "beta", TargetType::Direct, ConversationId(id), packet).unwrap()
    }

    struct Throwing;
    impl MessageHandler for Throwing {
        fn accepts(&self, packet: &dyn Packet) -> bool {
            packet.is::<Ping>()
        }

        fn on_receive(&self, _ctx: &MessageContext<'_>) -> Result<()> {
            Err(ProtocolError::Custom("nope".into()))
        }
    }

    #[test]
    fn test_failing_handler_does_not_stop_others() {
        let dispatcher = dispatcher();
        let runs = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(Mutex::new(Vec::new()));

        let counted = Arc::clone(&runs);
        dispatcher
            .register_fn::<Ping, _>("first", move |_, _| {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        dispatcher.register(Arc::new(Throwing)).unwrap();
        let counted = Arc::clone(&runs);
        dispatcher
            .register_fn::<Ping, _>("third", move |_, _| {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        let sink = Arc::clone(&failures);
        dispatcher
            .set_error_hook(move |failure| sink.lock().push(failure.handler.clone()))
            .unwrap();

        let link: Arc<dyn ReplySender> = RecordingLink::new("beta");
        let outcome = dispatcher.dispatch(&inbound(&Ping(1), 1), &link);

        assert_eq!(outcome.handled, 3);
        assert_eq!(outcome.failed, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        let failures = failures.lock();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].ends_with("Throwing"));
    }

    #[test]
    fn test_panicking_handler_reported_with_name() {
        let dispatcher = dispatcher();
        let failures = Arc::new(Mutex::new(Vec::new()));
        dispatcher
            .register_fn::<Ping, _>("explodes", |_, _| panic!("kaboom"))
            .unwrap();
        let sink = Arc::clone(&failures);
        dispatcher
            .set_error_hook(move |failure| {
                sink.lock().push((failure.handler.clone(), failure.error.to_string()))
            })
            .unwrap();

        let link: Arc<dyn ReplySender> = RecordingLink::new("beta");
        let outcome = dispatcher.dispatch(&inbound(&Ping(1), 1), &link);
        assert_eq!(outcome.failed, 1);

        let failures = failures.lock();
        assert_eq!(failures[0].0, "explodes");
        assert!(failures[0].1.contains("kaboom"));
    }

    #[test]
    fn test_only_accepting_handlers_run() {
        let dispatcher = dispatcher();
        let pongs = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&pongs);
        dispatcher
            .register_fn::<Pong, _>("pong", move |_, _| {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let link: Arc<dyn ReplySender> = RecordingLink::new("beta");
        let outcome = dispatcher.dispatch(&inbound(&Ping(1), 1), &link);
        assert!(outcome.decoded);
        assert_eq!(outcome.handled, 0);
        assert_eq!(pongs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unknown_tag_is_dropped() {
        let dispatcher = dispatcher();
        let link: Arc<dyn ReplySender> = RecordingLink::new("beta");
        let outcome = dispatcher.dispatch(&inbound(&Stranger, 1), &link);
        assert_eq!(outcome, DispatchOutcome::default());
    }

    #[test]
    fn test_garbage_payload_is_dropped() {
        let dispatcher = dispatcher();
        let link: Arc<dyn ReplySender> = RecordingLink::new("beta");
        let mut envelope = inbound(&Ping(1), 1);
        envelope.payload = vec![0xFF; 3];
        assert!(!dispatcher.dispatch(&envelope, &link).decoded);
    }

    #[test]
    fn test_reply_directly_targets_source_on_same_conversation() {
        let dispatcher = dispatcher();
        dispatcher
            .register_fn::<Ping, _>("echo", |ping, ctx| ctx.reply_directly(&Pong(ping.0)))
            .unwrap();

        let link = RecordingLink::new("beta");
        let dyn_link: Arc<dyn ReplySender> = link.clone();
        dispatcher.dispatch(&inbound(&Ping(7), 99), &dyn_link);

        let sent = link.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].source, "beta");
        assert_eq!(sent[0].target, "alpha");
        assert_eq!(sent[0].target_type, TargetType::Direct);
        assert_eq!(sent[0].conversation_id, ConversationId(99));
        let reply = dispatcher.packets().deserialize_as::<Pong>(&sent[0].payload).unwrap();
        assert_eq!(reply, Pong(7));
    }

    #[tokio::test]
    async fn test_reply_opens_new_conversation() {
        let dispatcher = dispatcher();
        let handles = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&handles);
        dispatcher
            .register_fn::<Ping, _>("asker", move |_, ctx| {
                let handle = ctx.reply(&Ping(0), ConversationOptions::expecting::<Pong>())?;
                sink.lock().push(handle);
                Ok(())
            })
            .unwrap();

        let link = RecordingLink::new("beta");
        let dyn_link: Arc<dyn ReplySender> = link.clone();
        dispatcher.dispatch(&inbound(&Ping(1), 5), &dyn_link);

        let handle = handles.lock().pop().unwrap();
        assert!(handle.is_active());
        let sent = link.sent.lock();
        assert_eq!(sent[0].conversation_id, handle.id());
        assert_ne!(handle.id(), ConversationId(5));
    }

    #[tokio::test]
    async fn test_override_suppresses_handlers() {
        let dispatcher = dispatcher();
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&runs);
        dispatcher
            .register_fn::<Pong, _>("general", move |_, _| {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let link = RecordingLink::new("alpha");
        let dyn_link: Arc<dyn ReplySender> = link.clone();
        let quiet = dyn_link
            .request(
                TargetType::Direct,
                "beta",
                &Ping(1),
                ConversationOptions::expecting::<Pong>().override_default_handlers(true),
            )
            .unwrap();
        let loud = dyn_link
            .request(
                TargetType::Direct,
                "beta",
                &Ping(2),
                ConversationOptions::expecting::<Pong>(),
            )
            .unwrap();

        let outcome = dispatcher.dispatch(&inbound(&Pong(1), quiet.id().0), &dyn_link);
        assert!(outcome.claimed);
        assert_eq!(outcome.handled, 0);

        let outcome = dispatcher.dispatch(&inbound(&Pong(2), loud.id().0), &dyn_link);
        assert!(outcome.claimed);
        assert_eq!(outcome.handled, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_packet_reaches_conversation() {
        let dispatcher = dispatcher();
        let errors = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&errors);
        let link = RecordingLink::new("alpha");
        let dyn_link: Arc<dyn ReplySender> = link.clone();
        let handle = dyn_link
            .request(
                TargetType::Direct,
                "ghost",
                &Ping(1),
                ConversationOptions::expecting::<Pong>().on_error(move |_| {
                    counted.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let error = ErrorPacket::remote("no such peer");
        let outcome = dispatcher.dispatch(&inbound(&error, handle.id().0), &dyn_link);
        assert!(outcome.claimed);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(!handle.is_active());
    }
}
