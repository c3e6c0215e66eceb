//! # Peer Client
//!
//! A peer's connection to the relay.
//!
//! [`Client::connect`] dials the relay, sends the `HandshakeRequest` and waits
//! for the `HandshakeResult`. Frames that arrive before the result are logged
//! and dropped. A rejected handshake is returned as `AuthenticationFailure`
//! and is final: the client never retries an identity the relay refused.
//!
//! Once connected, a background task reads envelopes and hands them to the
//! [`Dispatcher`]. If the connection drops and `auto_reconnect` is set, the
//! task redials every `reconnect_interval`. While disconnected, sends are
//! parked in an [`Outbox`] (when `queue_messages` is set) and flushed in
//! order after the next successful handshake; entries that outlive
//! `queued_message_timeout` fail their conversation instead of being sent.
//!
//! A client whose connection is gone with no reconnect coming (closed,
//! rejected, or `auto_reconnect` off) is finished: queued entries fail with
//! `NotConnected` and later sends are refused.

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ClientConfig, TransportConfig};
use crate::core::codec::{Frame, FrameCodec};
use crate::core::packet::{Packet, PacketType};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::conversation::{ConversationHandle, ConversationManager, ConversationOptions};
use crate::protocol::dispatcher::{Dispatcher, ReplySender};
use crate::protocol::envelope::{ConversationId, Envelope, ErrorPacket, TargetType};
use crate::protocol::handshake::{HandshakeRequest, HandshakeResult};
use crate::routing::registry::ConnectionHandle;
use crate::service::outbox::{self, Outbox};
use crate::transport::tcp::{self, FrameReader, Outbound};
use crate::utils::metrics::Metrics;
use crate::utils::timeout::with_timeout;

const MIN_PURGE_PERIOD: Duration = Duration::from_millis(10);
const MAX_PURGE_PERIOD: Duration = Duration::from_secs(1);

/// One live, authenticated connection
struct Session {
    reader: FrameReader,
    writer: JoinHandle<()>,
}

struct ClientInner {
    config: ClientConfig,
    transport: TransportConfig,
    dispatcher: Arc<Dispatcher>,
    conversations: ConversationManager,
    outbox: Outbox,
    connection: RwLock<Option<ConnectionHandle>>,
    metrics: Metrics,
    closed: CancellationToken,
}

impl ReplySender for ClientInner {
    fn local_id(&self) -> &str {
        &self.config.unique_id
    }

    fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        let bytes = envelope.to_bytes()?;
        let expired = {
            // Held across the outbox push so a concurrent flush or retire cannot miss it
            let connection = self.connection.read();
            if self.closed.is_cancelled() {
                return Err(ProtocolError::NotConnected);
            }
            if let Some(handle) = connection.as_ref() {
                if handle.send_frame(Frame::message(bytes)).is_ok() {
                    return Ok(());
                }
            }
            if !self.config.queue_messages {
                return Err(ProtocolError::NotConnected);
            }
            self.outbox.push(envelope)
        };
        outbox::notify_expired(expired, &self.conversations);
        Ok(())
    }

    fn conversations(&self) -> &ConversationManager {
        &self.conversations
    }
}

impl ClientInner {
    fn codec(&self) -> FrameCodec {
        FrameCodec::new()
            .with_version_mismatch(self.config.allow_version_mismatch)
            .with_max_payload_size(self.transport.max_payload_size)
    }

    /// Dial, authenticate and publish a new connection
    #[instrument(skip(self), fields(peer = %self.config.unique_id, relay = %self.config.relay_address()))]
    async fn establish(&self) -> Result<Session> {
        let timeout = self.config.handshake_timeout;
        let (mut reader, writer) =
            with_timeout(timeout, tcp::connect(&self.config.relay_address(), self.codec())).await?;
        let (handle, commands) = ConnectionHandle::channel();
        let writer = tcp::spawn_writer(writer, commands);

        let request = HandshakeRequest::new(
            self.config.authentication_token.clone(),
            self.config.unique_id.clone(),
            self.config.group.clone(),
        );
        self.metrics.handshake_attempt();
        let outcome = match request.to_bytes() {
            Ok(bytes) => match handle.send_frame(Frame::handshake(bytes)) {
                Ok(()) => with_timeout(timeout, self.await_handshake(&mut reader)).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            self.metrics.handshake_failed();
            handle.close();
            let _ = writer.await;
            return Err(e);
        }

        reader.decoder_mut().mark_authenticated();
        handle.send(Outbound::Authenticated)?;
        self.metrics.handshake_success();
        self.metrics.connection_established();

        let expired = {
            let mut connection = self.connection.write();
            let (queued, expired) = self.outbox.take();
            for envelope in queued {
                match envelope.to_bytes() {
                    Ok(bytes) => {
                        let _ = handle.send_frame(Frame::message(bytes));
                    }
                    Err(e) => warn!(error = %e, "Failed to encode queued envelope"),
                }
            }
            *connection = Some(handle);
            expired
        };
        // Conversation callbacks may send, so they run after the lock is released
        outbox::notify_expired(expired, &self.conversations);

        info!("Connected to relay");
        Ok(Session { reader, writer })
    }

    /// Wait for the relay's handshake result, dropping anything else
    async fn await_handshake(&self, reader: &mut FrameReader) -> Result<()> {
        loop {
            match reader.next().await {
                Some(Ok(Frame::Handshake { payload, .. })) => {
                    return HandshakeResult::from_bytes(&payload)?.into_result();
                }
                Some(Ok(Frame::Message { .. })) => {
                    self.metrics.unauthenticated_frame();
                    warn!("Envelope received before authentication, dropping");
                }
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(ProtocolError::Custom(
                        constants::ERR_HANDSHAKE_CLOSED.to_string(),
                    ))
                }
            }
        }
    }

    /// Receive loop plus reconnects; ends when the client is done for good
    async fn run(self: Arc<Self>, mut session: Session) {
        let link: Arc<dyn ReplySender> = self.clone();
        loop {
            self.receive(&mut session.reader, &link).await;

            if let Some(handle) = self.connection.write().take() {
                handle.close();
            }
            let _ = (&mut session.writer).await;
            self.metrics.connection_closed();

            if self.closed.is_cancelled() || !self.config.auto_reconnect {
                break;
            }
            match self.reconnect().await {
                Some(next) => session = next,
                None => break,
            }
        }
        self.retire();
        debug!(peer = %self.config.unique_id, "Client task finished");
    }

    /// Finish the client for good, failing whatever is still queued
    fn retire(&self) {
        let (abandoned, expired) = {
            let mut connection = self.connection.write();
            self.closed.cancel();
            if let Some(handle) = connection.take() {
                handle.close();
            }
            self.outbox.take()
        };
        outbox::notify_expired(expired, &self.conversations);
        outbox::notify_abandoned(abandoned, &self.conversations);
    }

    /// Purge expired queue entries until the client is finished
    async fn expire_queued(self: Arc<Self>) {
        let period = (self.outbox.lifetime() / 4).clamp(MIN_PURGE_PERIOD, MAX_PURGE_PERIOD);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.closed.cancelled() => return,
                _ = ticker.tick() => {
                    self.outbox.purge_expired(&self.conversations);
                }
            }
        }
    }

    async fn receive(&self, reader: &mut FrameReader, link: &Arc<dyn ReplySender>) {
        loop {
            let frame = tokio::select! {
                _ = self.closed.cancelled() => return,
                frame = reader.next() => frame,
            };
            match frame {
                Some(Ok(frame)) => self.on_frame(frame, link),
                Some(Err(e)) => {
                    warn!(error = %e, "Connection to relay failed");
                    return;
                }
                None => {
                    info!("Relay closed the connection");
                    return;
                }
            }
        }
    }

    fn on_frame(&self, frame: Frame, link: &Arc<dyn ReplySender>) {
        self.metrics.envelope_received(frame.payload().len() as u64);
        let envelope = match Envelope::from_bytes(frame.payload()) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.metrics.decode_failure();
                warn!(error = %e, "Failed to decode envelope");
                return;
            }
        };
        let outcome = self.dispatcher.dispatch(&envelope, link);
        if !outcome.decoded {
            self.metrics.decode_failure();
        }
        for _ in 0..outcome.failed {
            self.metrics.handler_failure();
        }
    }

    async fn reconnect(&self) -> Option<Session> {
        let mut attempt: u32 = 0;
        loop {
            tokio::select! {
                _ = self.closed.cancelled() => return None,
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
            }
            attempt += 1;
            match self.establish().await {
                Ok(session) => {
                    info!(attempt, "Reconnected to relay");
                    return Some(session);
                }
                Err(ProtocolError::AuthenticationFailure(reason)) => {
                    error!(%reason, "Relay rejected handshake, giving up");
                    self.closed.cancel();
                    return None;
                }
                Err(e) => debug!(attempt, error = %e, "Reconnect attempt failed"),
            }
        }
    }

    fn shutdown(&self) {
        self.closed.cancel();
        if let Some(handle) = self.connection.write().take() {
            handle.close();
        }
    }
}

/// A connected peer
pub struct Client {
    inner: Arc<ClientInner>,
    task: JoinHandle<()>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("unique_id", &self.inner.config.unique_id)
            .field("group", &self.inner.config.group)
            .field("connected", &self.is_connected())
            .field("queued", &self.inner.outbox.len())
            .finish()
    }
}

impl Client {
    /// Connect and authenticate to the relay in `config`.
    ///
    /// Fails with `AuthenticationFailure` if the relay rejects the handshake.
    pub async fn connect(
        config: ClientConfig,
        transport: TransportConfig,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self> {
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(ProtocolError::ConfigError(errors.join("; ")));
        }

        let inner = Arc::new(ClientInner {
            conversations: ConversationManager::new(config.conversation_timeout),
            outbox: Outbox::new(config.queued_message_timeout),
            connection: RwLock::new(None),
            metrics: Metrics::new(),
            closed: CancellationToken::new(),
            config,
            transport,
            dispatcher,
        });

        let session = inner.establish().await?;
        if inner.config.queue_messages {
            tokio::spawn(Arc::clone(&inner).expire_queued());
        }
        let task = tokio::spawn(Arc::clone(&inner).run(session));
        Ok(Self { inner, task })
    }

    pub fn unique_id(&self) -> &str {
        &self.inner.config.unique_id
    }

    pub fn group(&self) -> &str {
        &self.inner.config.group
    }

    /// Whether an authenticated connection is currently up
    pub fn is_connected(&self) -> bool {
        self.inner.connection.read().is_some()
    }

    /// Whether the client is finished: closed, rejected, or disconnected with no reconnect coming
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    pub fn conversations(&self) -> &ConversationManager {
        &self.inner.conversations
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Envelopes waiting for a reconnect
    pub fn queued(&self) -> usize {
        self.inner.outbox.len()
    }

    /// Reply capability usable outside handlers
    pub fn sender(&self) -> Arc<dyn ReplySender> {
        self.inner.clone()
    }

    /// Fire-and-forget send
    pub fn send(&self, target_type: TargetType, target: &str, packet: &dyn Packet) -> Result<()> {
        let envelope = Envelope::new(
            self.unique_id(),
            target,
            target_type,
            ConversationId::random(),
            packet,
        )?;
        self.inner.send_envelope(envelope)
    }

    /// Send and track responses through a conversation
    pub fn request(
        &self,
        target_type: TargetType,
        target: &str,
        packet: &dyn Packet,
        options: ConversationOptions,
    ) -> Result<ConversationHandle> {
        let link: &dyn ReplySender = self.inner.as_ref();
        link.request(target_type, target, packet, options)
    }

    /// Send a request and wait for its single response of type `R`.
    ///
    /// Routing and remote failures come back as the matching
    /// `ProtocolError`; no answer within `timeout` is `ProtocolError::Timeout`.
    pub async fn call<R>(
        &self,
        target_type: TargetType,
        target: &str,
        packet: &dyn Packet,
        timeout: Duration,
    ) -> Result<R>
    where
        R: PacketType + Clone,
    {
        let (tx, rx) = oneshot::channel::<Result<R>>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let complete = move |slot: &Mutex<Option<oneshot::Sender<Result<R>>>>, value: Result<R>| {
            if let Some(tx) = slot.lock().take() {
                let _ = tx.send(value);
            }
        };

        let options = ConversationOptions::expecting::<R>()
            .timeout(timeout)
            .override_default_handlers(true)
            .always_notify_on_timeout(true)
            .on_response({
                let slot = Arc::clone(&slot);
                move |_: &Envelope, packet: &dyn Packet| {
                    if let Some(response) = packet.downcast_ref::<R>() {
                        complete(&*slot, Ok(response.clone()));
                    }
                }
            })
            .on_error({
                let slot = Arc::clone(&slot);
                move |error: &ErrorPacket| complete(&*slot, Err(ProtocolError::from(error)))
            })
            .on_timeout({
                let slot = Arc::clone(&slot);
                move |_| complete(&*slot, Err(ProtocolError::Timeout))
            });

        let handle = self.request(target_type, target, packet, options)?;
        match rx.await {
            Ok(result) => result,
            Err(_) => {
                handle.cancel();
                Err(ProtocolError::ConnectionClosed)
            }
        }
    }

    /// Close the connection and stop reconnecting
    pub async fn close(mut self) {
        self.inner.shutdown();
        let task = &mut self.task;
        if let Err(e) = task.await {
            debug!(error = %e, "Client task ended abnormally");
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}
