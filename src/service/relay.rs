//! # Relay
//!
//! The central process peers connect to.
//!
//! Each accepted connection gets a writer task (see [`tcp::spawn_writer`])
//! and a receive loop that runs in two phases:
//!
//! 1. **Handshake gate**: only a `HandshakeRequest` frame is acted on.
//!    Ordinary frames are logged and dropped, including any the peer
//!    pipelined behind its handshake. A valid request registers the peer and
//!    switches both codec halves to the authenticated layout; an invalid one
//!    is answered with a failed `HandshakeResult` and the connection is
//!    closed.
//! 2. **Authenticated loop**: every frame is an envelope. Its `source` is
//!    overwritten with the connection's identity, then it is either handled
//!    locally (`SERVER`, or `DIRECT` to the relay's own id) or forwarded to
//!    the peers the router resolves. An envelope that matches nobody is
//!    answered with an [`ErrorPacket`] on the sender's conversation.
//!
//! ## Shutdown
//! [`Relay::serve`] stops accepting when its shutdown channel fires (or its
//! sender is dropped), closes every connection, and waits up to
//! `shutdown_timeout` for connection tasks to finish.

use futures::StreamExt;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{RelayConfig, TransportConfig};
use crate::core::codec::{Frame, FrameCodec};
use crate::error::{ProtocolError, Result};
use crate::protocol::conversation::ConversationManager;
use crate::protocol::dispatcher::{Dispatcher, ReplySender};
use crate::protocol::envelope::{Envelope, TargetType};
use crate::protocol::handshake::{Authenticator, HandshakeRequest, HandshakeResult, HandshakeState};
use crate::routing::registry::{ConnectionHandle, ConnectionRegistry, PeerRecord};
use crate::routing::router::{self, RouteError};
use crate::transport::tcp::{self, FrameReader, Outbound};
use crate::utils::activity::ActivityGate;
use crate::utils::metrics::Metrics;

struct RelayCore {
    config: RelayConfig,
    transport: TransportConfig,
    registry: ConnectionRegistry,
    authenticator: Authenticator,
    dispatcher: Arc<Dispatcher>,
    conversations: ConversationManager,
    metrics: Metrics,
    connections: ActivityGate,
}

impl RelayCore {
    /// Envelopes the relay consumes instead of forwarding
    fn is_local(&self, envelope: &Envelope) -> bool {
        match envelope.target_type {
            TargetType::Server => true,
            TargetType::Direct => envelope.target == self.config.unique_id,
            _ => false,
        }
    }

    /// Forward an envelope to every resolved peer, returning how many got it
    fn route(&self, envelope: &Envelope, sender: &str) -> std::result::Result<usize, RouteError> {
        let snapshot = self.registry.snapshot();
        let targets = router::resolve(
            envelope.target_type,
            &envelope.target,
            sender,
            self.config.allow_self_forward,
            &snapshot,
        )?;

        let bytes = match envelope.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "Failed to encode envelope for forwarding");
                return Ok(0);
            }
        };

        let mut delivered = 0;
        for peer in &targets {
            match self.registry.deliver(peer, Frame::message(bytes.clone())) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(peer = %peer.unique_id(), error = %e, "Peer went away during forwarding"),
            }
        }
        trace!(
            from = %sender,
            target_type = ?envelope.target_type,
            resolved = targets.len(),
            delivered,
            "Envelope forwarded"
        );
        self.metrics.envelopes_forwarded(delivered as u64);
        Ok(delivered)
    }
}

/// Reply capability for handlers running inside the relay
struct RelayLink {
    core: Arc<RelayCore>,
}

impl ReplySender for RelayLink {
    fn local_id(&self) -> &str {
        &self.core.config.unique_id
    }

    fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        match self.core.route(&envelope, &self.core.config.unique_id) {
            Ok(_) => Ok(()),
            Err(route_error) => {
                self.core.metrics.routing_failure();
                // Failures for the relay's own requests come back through the conversation
                if self
                    .core
                    .conversations
                    .fail(envelope.conversation_id, &route_error.to_packet())
                {
                    Ok(())
                } else {
                    Err(route_error.into())
                }
            }
        }
    }

    fn conversations(&self) -> &ConversationManager {
        &self.core.conversations
    }
}

/// Authenticating, forwarding relay
#[derive(Clone)]
pub struct Relay {
    core: Arc<RelayCore>,
    link: Arc<dyn ReplySender>,
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("unique_id", &self.core.config.unique_id)
            .field("listen", &self.core.config.listen_address())
            .field("peers", &self.core.registry.len())
            .finish()
    }
}

impl Relay {
    /// Relay whose local handlers live in `dispatcher`
    pub fn new(config: RelayConfig, transport: TransportConfig, dispatcher: Arc<Dispatcher>) -> Self {
        let core = Arc::new(RelayCore {
            authenticator: Authenticator::new(config.authentication_token.clone()),
            conversations: ConversationManager::new(config.conversation_timeout),
            registry: ConnectionRegistry::new(),
            metrics: Metrics::new(),
            connections: ActivityGate::new(),
            config,
            transport,
            dispatcher,
        });
        let link: Arc<dyn ReplySender> = Arc::new(RelayLink {
            core: Arc::clone(&core),
        });
        Self { core, link }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.core.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.core.registry
    }

    pub fn metrics(&self) -> &Metrics {
        &self.core.metrics
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.core.dispatcher
    }

    pub fn conversations(&self) -> &ConversationManager {
        &self.core.conversations
    }

    /// Capability for messages the relay itself originates
    pub fn sender(&self) -> Arc<dyn ReplySender> {
        Arc::clone(&self.link)
    }

    /// Number of connection tasks still running
    pub fn active_connections(&self) -> usize {
        self.core.connections.active()
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<TcpListener> {
        tcp::bind(&self.core.config.listen_address()).await
    }

    /// Bind and serve until Ctrl-C
    pub async fn start(&self) -> Result<()> {
        let listener = self.bind().await?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received CTRL+C signal, shutting down");
                let _ = shutdown_tx.send(()).await;
            }
        });
        self.serve(listener, shutdown_rx).await
    }

    /// Accept connections on `listener` until `shutdown_rx` fires
    #[instrument(skip_all, fields(relay = %self.core.config.unique_id))]
    pub async fn serve(&self, listener: TcpListener, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        let shutdown = CancellationToken::new();
        if let Ok(address) = listener.local_addr() {
            info!(%address, "Relay listening");
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, address)) => self.accept(stream, address, &shutdown),
                    Err(e) => error!(error = %e, "Error accepting connection"),
                }
            }
        }

        info!(
            connections = self.core.connections.active(),
            "Shutting down relay. Waiting for connections to close..."
        );
        shutdown.cancel();
        self.core.registry.close_all();
        let drained = tokio::time::timeout(
            self.core.config.shutdown_timeout,
            self.core.connections.wait_inactive(),
        )
        .await;
        if drained.is_err() {
            warn!(
                remaining = self.core.connections.active(),
                "Shutdown timeout reached, forcing exit"
            );
        }
        self.core.metrics.log_metrics();
        Ok(())
    }

    fn accept(&self, stream: TcpStream, address: SocketAddr, shutdown: &CancellationToken) {
        if self.core.connections.active() >= self.core.config.max_connections {
            warn!(%address, limit = self.core.config.max_connections, "Connection limit reached, refusing");
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%address, error = %e, "Failed to set TCP_NODELAY");
        }
        let guard = self.core.connections.enter();
        let relay = self.clone();
        let shutdown = shutdown.child_token();
        tokio::spawn(async move {
            relay.handle_connection(stream, address, shutdown).await;
            drop(guard);
        });
    }

    #[instrument(skip(self, stream, shutdown))]
    async fn handle_connection(&self, stream: TcpStream, address: SocketAddr, shutdown: CancellationToken) {
        self.core.metrics.connection_established();
        let codec = FrameCodec::new()
            .with_version_mismatch(self.core.config.allow_version_mismatch)
            .with_max_payload_size(self.core.transport.max_payload_size);
        let (mut reader, writer) = tcp::split(stream, codec);
        let (handle, commands) = ConnectionHandle::channel();
        let writer_task = tcp::spawn_writer(writer, commands);

        if let Some(record) = self.authenticate(&mut reader, &handle, &shutdown).await {
            self.receive_loop(&mut reader, &record, &shutdown).await;
            self.core.registry.remove(&record);
            info!(peer = %record.unique_id(), "Peer disconnected");
        }

        handle.close();
        if let Err(e) = writer_task.await {
            debug!(error = %e, "Writer task ended abnormally");
        }
        self.core.metrics.connection_closed();
    }

    /// Run the handshake gate; `Some` once the peer is registered
    async fn authenticate(
        &self,
        reader: &mut FrameReader,
        handle: &ConnectionHandle,
        shutdown: &CancellationToken,
    ) -> Option<Arc<PeerRecord>> {
        let mut state = HandshakeState::default();
        let mut admitted = None;
        while !state.is_finished() {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => return None,
                frame = reader.next() => frame,
            };
            let payload = match frame {
                Some(Ok(Frame::Handshake { payload, .. })) => payload,
                Some(Ok(Frame::Message { .. })) => {
                    warn!("Envelope received before authentication, dropping");
                    self.core.metrics.unauthenticated_frame();
                    continue;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Transport error before handshake");
                    return None;
                }
                None => {
                    debug!("Connection closed before handshake completed");
                    return None;
                }
            };

            self.core.metrics.handshake_attempt();
            let outcome = HandshakeRequest::from_bytes(&payload)
                .map_err(|e| ProtocolError::AuthenticationFailure(e.to_string()))
                .and_then(|request| self.admit(request, handle));
            if let Err(e) = state.complete(&outcome) {
                error!(error = %e, "Handshake state already settled");
                return None;
            }
            match outcome {
                Ok(record) => admitted = Some(record),
                Err(e) => self.reject(handle, e),
            }
        }
        trace!(?state, "Handshake finished");

        let record = admitted.filter(|_| state.admits_envelopes())?;
        if let Err(e) = self.drop_stale_frames(reader) {
            warn!(peer = %record.unique_id(), error = %e, "Transport error at authentication");
            self.core.registry.remove(&record);
            return None;
        }
        self.core.metrics.handshake_success();
        info!(peer = %record.unique_id(), group = %record.group(), "Peer authenticated");
        Some(record)
    }

    /// Validate a request and register the peer
    fn admit(&self, request: HandshakeRequest, handle: &ConnectionHandle) -> Result<Arc<PeerRecord>> {
        self.core.authenticator.validate(&request, &self.core.registry)?;
        let accepted = HandshakeResult::accepted().to_bytes()?;

        let record = PeerRecord::new(request.unique_id, request.group, handle.clone());
        self.core.registry.add_and_announce(record, |peer| {
            let connection = peer.connection();
            let _ = connection.send_frame(Frame::handshake(accepted));
            let _ = connection.send(Outbound::Authenticated);
        })
    }

    /// Answer a failed handshake and close the connection
    fn reject(&self, handle: &ConnectionHandle, error: ProtocolError) {
        self.core.metrics.handshake_failed();
        warn!(error = %error, "Handshake rejected");
        let message = match error {
            ProtocolError::AuthenticationFailure(message) => message,
            other => other.to_string(),
        };
        match HandshakeResult::rejected(message).to_bytes() {
            Ok(bytes) => {
                let _ = handle.send_frame(Frame::handshake(bytes));
            }
            Err(e) => error!(error = %e, "Failed to encode handshake result"),
        }
        handle.close();
    }

    /// Switch the reader to the authenticated layout, dropping frames the
    /// peer pipelined behind its handshake
    fn drop_stale_frames(&self, reader: &mut FrameReader) -> Result<()> {
        let mut codec = reader.decoder().clone();
        let stale = codec.authenticate_buffered(reader.read_buffer_mut())?;
        *reader.decoder_mut() = codec;
        for frame in stale {
            warn!(
                handshake = frame.is_handshake(),
                bytes = frame.payload().len(),
                "Frame received before authentication, dropping"
            );
            self.core.metrics.unauthenticated_frame();
        }
        Ok(())
    }

    async fn receive_loop(
        &self,
        reader: &mut FrameReader,
        record: &Arc<PeerRecord>,
        shutdown: &CancellationToken,
    ) {
        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = reader.next() => frame,
            };
            match frame {
                Some(Ok(frame)) => self.on_frame(record, frame),
                Some(Err(e)) => {
                    warn!(peer = %record.unique_id(), error = %e, "Connection error, closing");
                    break;
                }
                None => break,
            }
        }
    }

    fn on_frame(&self, record: &Arc<PeerRecord>, frame: Frame) {
        let core = &self.core;
        core.metrics.envelope_received(frame.payload().len() as u64);

        let mut envelope = match Envelope::from_bytes(frame.payload()) {
            Ok(envelope) => envelope,
            Err(e) => {
                core.metrics.decode_failure();
                warn!(peer = %record.unique_id(), error = %e, "Failed to decode envelope");
                return;
            }
        };

        if envelope.source != record.unique_id() {
            trace!(claimed = %envelope.source, peer = %record.unique_id(), "Restamping envelope source");
            envelope.source = record.unique_id().to_string();
        }

        if core.is_local(&envelope) {
            let outcome = core.dispatcher.dispatch(&envelope, &self.link);
            if !outcome.decoded {
                core.metrics.decode_failure();
            }
            for _ in 0..outcome.failed {
                core.metrics.handler_failure();
            }
            return;
        }

        if let Err(route_error) = core.route(&envelope, record.unique_id()) {
            core.metrics.routing_failure();
            debug!(
                peer = %record.unique_id(),
                to = %envelope.target,
                target_type = ?envelope.target_type,
                reason = ?route_error,
                "Routing failed, notifying sender"
            );
            self.notify_sender(record, &envelope, &route_error);
        }
    }

    fn notify_sender(&self, record: &PeerRecord, envelope: &Envelope, route_error: &RouteError) {
        let reply = Envelope::error_reply(
            self.core.config.unique_id.clone(),
            record.unique_id(),
            envelope.conversation_id,
            &route_error.to_packet(),
        )
        .and_then(|reply| reply.to_bytes());
        match reply {
            Ok(bytes) => {
                if let Err(e) = self.core.registry.deliver(record, Frame::message(bytes)) {
                    debug!(peer = %record.unique_id(), error = %e, "Could not return routing error");
                }
            }
            Err(e) => error!(error = %e, "Failed to encode routing error"),
        }
    }
}
