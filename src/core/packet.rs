//! # Packet Codec
//!
//! Polymorphic payload (de)serialization keyed by a stable type tag.
//!
//! Every payload type implements [`PacketType`] and declares a `TAG` that is
//! part of the wire format. Encoding wraps the bincode body in a
//! [`TaggedPayload`]; decoding reads the tag first and resolves it through a
//! [`PacketRegistry`] that maps tags to decode functions.
//!
//! The registry is assembled once at startup with [`PacketRegistryBuilder`]
//! and is immutable afterwards. It is shared as `Arc<PacketRegistry>`.
//!
//! A tag missing from the registry is a hard `UnknownPacketType` failure:
//! no partially populated packet is ever produced.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{ProtocolError, Result};

/// A decoded payload of any registered type
pub trait Packet: Any + Send + Sync + fmt::Debug {
    /// Stable wire tag of the concrete type
    fn tag(&self) -> &'static str;

    /// Encode the type-specific body (without the tag)
    fn encode_body(&self) -> Result<Vec<u8>>;

    fn as_any(&self) -> &dyn Any;
}

/// Concrete payload type with a stable wire tag
pub trait PacketType: Serialize + DeserializeOwned + Send + Sync + fmt::Debug + 'static {
    const TAG: &'static str;
}

impl<T: PacketType> Packet for T {
    fn tag(&self) -> &'static str {
        T::TAG
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ProtocolError::SerializeError(e.to_string()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn Packet {
    /// Borrow the payload as a concrete type
    pub fn downcast_ref<T: PacketType>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn is<T: PacketType>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// Self-describing encoded form of a packet
#[derive(Debug, Serialize, Deserialize)]
pub struct TaggedPayload {
    pub tag: String,
    pub body: Vec<u8>,
}

/// Encode any packet, embedding its tag
pub fn serialize(packet: &dyn Packet) -> Result<Vec<u8>> {
    let tagged = TaggedPayload {
        tag: packet.tag().to_string(),
        body: packet.encode_body()?,
    };
    bincode::serialize(&tagged).map_err(|e| ProtocolError::SerializeError(e.to_string()))
}

/// Read only the tag of an encoded packet
pub fn peek_tag(bytes: &[u8]) -> Result<String> {
    let tagged: TaggedPayload =
        bincode::deserialize(bytes).map_err(|e| ProtocolError::DeserializeError(e.to_string()))?;
    Ok(tagged.tag)
}

type DecodeFn = fn(&[u8]) -> Result<Box<dyn Packet>>;

fn decode_as<T: PacketType>(body: &[u8]) -> Result<Box<dyn Packet>> {
    let value: T = bincode::deserialize(body)
        .map_err(|e| ProtocolError::DeserializeError(format!("{}: {e}", T::TAG)))?;
    Ok(Box::new(value))
}

/// Immutable tag → decoder table
pub struct PacketRegistry {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl fmt::Debug for PacketRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.decoders.keys().collect();
        tags.sort();
        f.debug_struct("PacketRegistry").field("tags", &tags).finish()
    }
}

impl PacketRegistry {
    /// Start a registry that already knows the built-in packets
    pub fn builder() -> PacketRegistryBuilder {
        PacketRegistryBuilder::new()
    }

    /// Registry holding only the built-in packets
    pub fn with_builtins() -> Arc<Self> {
        Self::builder().build()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.decoders.contains_key(tag)
    }

    /// Decode an encoded packet, resolving its concrete type by tag
    pub fn deserialize(&self, bytes: &[u8]) -> Result<Box<dyn Packet>> {
        let tagged: TaggedPayload = bincode::deserialize(bytes)
            .map_err(|e| ProtocolError::DeserializeError(e.to_string()))?;
        let decode = self
            .decoders
            .get(tagged.tag.as_str())
            .ok_or_else(|| ProtocolError::UnknownPacketType(tagged.tag.clone()))?;
        decode(&tagged.body)
    }

    /// Decode an encoded packet straight into a known type
    pub fn deserialize_as<T: PacketType>(&self, bytes: &[u8]) -> Result<T> {
        let tagged: TaggedPayload = bincode::deserialize(bytes)
            .map_err(|e| ProtocolError::DeserializeError(e.to_string()))?;
        if !self.contains(&tagged.tag) {
            return Err(ProtocolError::UnknownPacketType(tagged.tag));
        }
        if tagged.tag != T::TAG {
            return Err(ProtocolError::DeserializeError(format!(
                "expected {}, found {}",
                T::TAG,
                tagged.tag
            )));
        }
        bincode::deserialize(&tagged.body)
            .map_err(|e| ProtocolError::DeserializeError(format!("{}: {e}", T::TAG)))
    }
}

/// Collects packet types before freezing them into a [`PacketRegistry`]
pub struct PacketRegistryBuilder {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl Default for PacketRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketRegistryBuilder {
    pub fn new() -> Self {
        let mut builder = Self {
            decoders: HashMap::new(),
        };
        builder.insert::<crate::protocol::envelope::ErrorPacket>();
        builder
    }

    fn insert<T: PacketType>(&mut self) {
        self.decoders.insert(T::TAG, decode_as::<T> as DecodeFn);
    }

    /// Register a packet type. Registering the same tag twice replaces the decoder.
    pub fn register<T: PacketType>(mut self) -> Self {
        self.insert::<T>();
        self
    }

    pub fn build(self) -> Arc<PacketRegistry> {
        Arc::new(PacketRegistry {
            decoders: self.decoders,
        })
    }
}
