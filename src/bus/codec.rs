//! Payload codecs.
//!
//! Cluster messages and responses travel as opaque binary bodies. The default
//! codec is MessagePack with named fields, so any nested map/array/scalar
//! payload survives the trip.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{BusError, Result};

/// Serializes values to and from message bodies.
pub trait Codec: Send + Sync + 'static {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// MessagePack codec backed by `rmp-serde`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(value).map_err(|e| BusError::Codec(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        rmp_serde::from_slice(bytes).map_err(|e| BusError::Codec(e.to_string()))
    }
}
