//! # Frame Codec
//!
//! Tokio codec that splits a byte stream into discrete frames.
//!
//! ## Wire Format
//! ```text
//! pre-authentication:  [Kind(4)] [Version(4)] [Length(4)] [Payload(N)]
//! authenticated:                 [Version(4)] [Length(4)] [Payload(N)]
//! ```
//! All integers are big-endian `i32`. `Kind` is [`KIND_HANDSHAKE`] or
//! [`KIND_MESSAGE`] and lets handshake and ordinary frames share the
//! connection until authentication completes. Once the handshake succeeds,
//! both ends call [`FrameCodec::mark_authenticated`] and the kind prefix is
//! dropped for good.
//!
//! Decoding is resumable: a partial header or payload leaves the buffer
//! untouched and reports that more data is needed.
//!
//! Frames whose version differs from [`PROTOCOL_VERSION`] are consumed and
//! dropped unless the codec allows version mismatch. Oversized or negative
//! lengths are fatal to the stream.
//!
//! A peer may pipeline frames behind its handshake before it learns the
//! outcome. Those bytes still use the pre-authentication layout, so the
//! receiving side switches with [`FrameCodec::authenticate_buffered`], which
//! hands back the complete stale frames and skips a trailing partial one.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::config::{MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use crate::error::{ProtocolError, Result};

/// Kind tag for handshake frames
pub const KIND_HANDSHAKE: i32 = 0;
/// Kind tag for ordinary message frames sent before authentication
pub const KIND_MESSAGE: i32 = 1;

const KIND_LEN: usize = 4;
const VERSION_LEN: usize = 4;
const LENGTH_LEN: usize = 4;

/// One decoded unit of the wire protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Carries an encoded handshake request or result
    Handshake { version: i32, payload: Vec<u8> },
    /// Carries an encoded envelope
    Message { version: i32, payload: Vec<u8> },
}

impl Frame {
    /// Handshake frame tagged with the local protocol version
    pub fn handshake(payload: Vec<u8>) -> Self {
        Frame::Handshake {
            version: PROTOCOL_VERSION,
            payload,
        }
    }

    /// Message frame tagged with the local protocol version
    pub fn message(payload: Vec<u8>) -> Self {
        Frame::Message {
            version: PROTOCOL_VERSION,
            payload,
        }
    }

    pub fn version(&self) -> i32 {
        match self {
            Frame::Handshake { version, .. } | Frame::Message { version, .. } => *version,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Frame::Handshake { payload, .. } | Frame::Message { payload, .. } => payload,
        }
    }

    pub fn is_handshake(&self) -> bool {
        matches!(self, Frame::Handshake { .. })
    }
}

/// Check a decoded frame version against the local protocol version.
///
/// Returns `ProtocolVersionMismatch` if they differ and mismatch is not allowed.
pub fn check_version(actual: i32, allow_mismatch: bool) -> Result<()> {
    if actual == PROTOCOL_VERSION || allow_mismatch {
        return Ok(());
    }
    Err(ProtocolError::ProtocolVersionMismatch {
        expected: PROTOCOL_VERSION,
        actual,
    })
}

/// Stateful frame codec shared by relay and client connections
#[derive(Debug, Clone)]
pub struct FrameCodec {
    authenticated: bool,
    /// A pre-authentication frame was cut off at the layout switch
    discard_partial: bool,
    allow_version_mismatch: bool,
    max_payload_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Codec in the pre-authentication state with default limits
    pub fn new() -> Self {
        Self {
            authenticated: false,
            discard_partial: false,
            allow_version_mismatch: false,
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }

    pub fn with_version_mismatch(mut self, allow: bool) -> Self {
        self.allow_version_mismatch = allow;
        self
    }

    pub fn with_max_payload_size(mut self, max_payload_size: usize) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    /// Drop the handshake stage. Irreversible for the lifetime of the codec.
    pub fn mark_authenticated(&mut self) {
        self.authenticated = true;
    }

    /// Switch to the authenticated layout while `src` may still hold bytes
    /// received before it.
    ///
    /// Complete pre-authentication frames are decoded and returned for the
    /// caller to drop. A trailing partial one is skipped by later decodes
    /// once the rest of it arrives.
    pub fn authenticate_buffered(&mut self, src: &mut BytesMut) -> Result<Vec<Frame>> {
        let mut stale = Vec::new();
        if !self.authenticated {
            while let Some(frame) = self.decode(src)? {
                stale.push(frame);
            }
        }
        self.authenticated = true;
        self.discard_partial = !src.is_empty();
        Ok(stale)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    fn header_len(authenticated: bool) -> usize {
        if authenticated {
            VERSION_LEN + LENGTH_LEN
        } else {
            KIND_LEN + VERSION_LEN + LENGTH_LEN
        }
    }

    /// Decode one frame in the given layout regardless of its version
    fn decode_raw(&self, src: &mut BytesMut, authenticated: bool) -> Result<Option<Frame>> {
        let header_len = Self::header_len(authenticated);
        if src.len() < header_len {
            return Ok(None);
        }

        let mut header = &src[..header_len];
        let kind = if authenticated {
            KIND_MESSAGE
        } else {
            header.get_i32()
        };
        let version = header.get_i32();
        let length = header.get_i32();

        if kind != KIND_HANDSHAKE && kind != KIND_MESSAGE {
            return Err(ProtocolError::InvalidHeader);
        }
        if length < 0 {
            return Err(ProtocolError::InvalidHeader);
        }
        let length = length as usize;
        if length > self.max_payload_size {
            return Err(ProtocolError::OversizedPacket(length));
        }

        if src.len() < header_len + length {
            src.reserve(header_len + length - src.len());
            return Ok(None);
        }

        src.advance(header_len);
        let payload = src.split_to(length).to_vec();

        Ok(Some(if kind == KIND_HANDSHAKE {
            Frame::Handshake { version, payload }
        } else {
            Frame::Message { version, payload }
        }))
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if self.discard_partial {
            let Some(frame) = self.decode_raw(src, false)? else {
                return Ok(None);
            };
            self.discard_partial = false;
            warn!(bytes = frame.payload().len(), "Dropping frame sent before authentication");
        }

        loop {
            let Some(frame) = self.decode_raw(src, self.authenticated)? else {
                return Ok(None);
            };

            match check_version(frame.version(), self.allow_version_mismatch) {
                Ok(()) => {
                    if frame.version() != PROTOCOL_VERSION {
                        debug!(
                            expected = PROTOCOL_VERSION,
                            actual = frame.version(),
                            "Accepting frame with mismatched protocol version"
                        );
                    }
                    return Ok(Some(frame));
                }
                Err(e) => {
                    warn!(error = %e, bytes = frame.payload().len(), "Dropping frame");
                }
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        let payload_len = item.payload().len();
        if payload_len > self.max_payload_size || payload_len > i32::MAX as usize {
            return Err(ProtocolError::OversizedPacket(payload_len));
        }

        let kind = match (&item, self.authenticated) {
            (Frame::Handshake { .. }, true) => return Err(ProtocolError::UnexpectedMessage),
            (Frame::Handshake { .. }, false) => Some(KIND_HANDSHAKE),
            (Frame::Message { .. }, false) => Some(KIND_MESSAGE),
            (Frame::Message { .. }, true) => None,
        };

        dst.reserve(Self::header_len(self.authenticated) + payload_len);
        if let Some(kind) = kind {
            dst.put_i32(kind);
        }
        dst.put_i32(item.version());
        dst.put_i32(payload_len as i32);
        dst.put_slice(item.payload());
        Ok(())
    }
}
