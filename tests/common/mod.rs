//! Shared fixtures for the networked integration tests

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use peer_relay::config::{ClientConfig, LoggingConfig, RelayConfig, TransportConfig};
use peer_relay::core::packet::{PacketRegistry, PacketType};
use peer_relay::error::Result;
use peer_relay::protocol::{Dispatcher, ProcedureMode, Procedures};
use peer_relay::service::{Client, Relay};
use peer_relay::utils::logging::init_logging;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Level;

pub const TOKEN: &str = "integration-secret";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping(pub u64);
impl PacketType for Ping {
    const TAG: &'static str = "it.ping";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong(pub u64);
impl PacketType for Pong {
    const TAG: &'static str = "it.pong";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note(pub String);
impl PacketType for Note {
    const TAG: &'static str = "it.note";
}

pub fn packets() -> Arc<PacketRegistry> {
    PacketRegistry::builder()
        .register::<Ping>()
        .register::<Pong>()
        .register::<Note>()
        .build()
}

pub fn dispatcher() -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(packets()))
}

/// Dispatcher answering `Ping(n)` with `Pong(n + offset)`
pub fn echo_dispatcher(offset: u64) -> Arc<Dispatcher> {
    let dispatcher = Dispatcher::new(packets());
    Procedures::new(&dispatcher)
        .register::<Ping, Pong, _>(move |_, Ping(n)| Ok(Pong(n + offset)), ProcedureMode::Inline)
        .unwrap();
    Arc::new(dispatcher)
}

/// Dispatcher forwarding every `Note` (with its source) into a channel
pub fn note_sink() -> (Arc<Dispatcher>, mpsc::UnboundedReceiver<(String, Note)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let dispatcher = Dispatcher::new(packets());
    dispatcher
        .register_fn::<Note, _>("note-sink", move |note, ctx| {
            let _ = tx.send((ctx.source().to_string(), note.clone()));
            Ok(())
        })
        .unwrap();
    (Arc::new(dispatcher), rx)
}

pub fn relay_config(port: u16) -> RelayConfig {
    RelayConfig {
        bind_address: "127.0.0.1".into(),
        port,
        authentication_token: TOKEN.into(),
        shutdown_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

/// A relay serving on a loopback port in the background
pub struct RelayHarness {
    pub relay: Relay,
    pub port: u16,
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl RelayHarness {
    pub async fn start(dispatcher: Arc<Dispatcher>) -> Self {
        Self::start_with(relay_config(0), dispatcher).await
    }

    pub async fn start_with(config: RelayConfig, dispatcher: Arc<Dispatcher>) -> Self {
        init_logging(&LoggingConfig {
            log_level: Level::WARN,
            ..Default::default()
        });
        let relay = Relay::new(config, TransportConfig::default(), dispatcher);
        let listener = relay.bind().await.expect("relay should bind");
        let port = listener.local_addr().unwrap().port();
        let (shutdown, shutdown_rx) = mpsc::channel(1);
        let server = relay.clone();
        let task = tokio::spawn(async move { server.serve(listener, shutdown_rx).await });
        Self {
            relay,
            port,
            shutdown,
            task,
        }
    }

    /// Signal shutdown and wait for `serve` to return
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(()).await;
        self.task.await.expect("relay task panicked")
    }
}

pub fn client_config(port: u16, unique_id: &str, group: &str) -> ClientConfig {
    ClientConfig {
        server_address: "127.0.0.1".into(),
        server_port: port,
        unique_id: unique_id.into(),
        group: group.into(),
        authentication_token: TOKEN.into(),
        reconnect_interval: Duration::from_millis(50),
        handshake_timeout: Duration::from_secs(1),
        conversation_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

pub async fn connect(port: u16, unique_id: &str, group: &str, dispatcher: Arc<Dispatcher>) -> Client {
    Client::connect(
        client_config(port, unique_id, group),
        TransportConfig::default(),
        dispatcher,
    )
    .await
    .expect("client should connect")
}

/// Poll `condition` for up to two seconds
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Receive one item or fail after two seconds
pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed")
}
