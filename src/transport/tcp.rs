//! TCP plumbing shared by the relay and its clients.
//!
//! A connection is split into a [`FrameReader`] owned by the receive loop and
//! a [`FrameWriter`] owned by a writer task. Everything else talks to the
//! writer through an unbounded channel of [`Outbound`] commands, which keeps
//! outbound writes fire-and-forget and strictly ordered per connection.

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, instrument, warn};

use crate::core::codec::{Frame, FrameCodec};
use crate::error::Result;

pub type FrameReader = FramedRead<OwnedReadHalf, FrameCodec>;
pub type FrameWriter = FramedWrite<OwnedWriteHalf, FrameCodec>;

/// Command for a connection's writer task
#[derive(Debug)]
pub enum Outbound {
    /// Write one frame
    Frame(Frame),
    /// Stop prefixing frames with a kind tag; sent right after the handshake result
    Authenticated,
    /// Flush and shut down the write half
    Close,
}

/// Split a stream into framed halves sharing the same codec settings
pub fn split(stream: TcpStream, codec: FrameCodec) -> (FrameReader, FrameWriter) {
    let (read_half, write_half) = stream.into_split();
    (
        FramedRead::new(read_half, codec.clone()),
        FramedWrite::new(write_half, codec),
    )
}

/// Dial a relay
#[instrument(skip(codec))]
pub async fn connect(address: &str, codec: FrameCodec) -> Result<(FrameReader, FrameWriter)> {
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    Ok(split(stream, codec))
}

/// Bind the relay listener
#[instrument]
pub async fn bind(address: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(address).await?;
    Ok(listener)
}

/// Drain `commands` into `writer` until closed, then shut the write half down
pub fn spawn_writer(
    mut writer: FrameWriter,
    commands: mpsc::UnboundedReceiver<Outbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut commands = UnboundedReceiverStream::new(commands);
        while let Some(command) = commands.next().await {
            match command {
                Outbound::Frame(frame) => {
                    if let Err(e) = writer.send(frame).await {
                        warn!(error = %e, "Write failed, closing connection");
                        break;
                    }
                }
                Outbound::Authenticated => writer.encoder_mut().mark_authenticated(),
                Outbound::Close => break,
            }
        }
        if let Err(e) = writer.close().await {
            debug!(error = %e, "Error while closing write half");
        }
    })
}
