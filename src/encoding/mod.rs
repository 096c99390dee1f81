//! Binary data encodings.
//!
//! Values and wire frames use Bincode. Storage keys are hand-encoded by the
//! log store (tag byte plus big-endian index) so that the physical key order
//! matches the logical entry order.

pub mod bincode;

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Adds automatic Bincode encode/decode methods to value types. These are
/// used for values in key/value storage engines as well as network protocol
/// frames.
pub trait Value: Serialize + DeserializeOwned {
    /// Decodes a value from a byte slice.
    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
    }

    /// Decodes a value from a reader.
    fn decode_from<R: Read>(reader: R) -> Result<Self> {
        bincode::deserialize_from(reader)
    }

    /// Decodes a value from a reader, or returns None if the reader is
    /// closed.
    fn maybe_decode_from<R: Read>(reader: R) -> Result<Option<Self>> {
        bincode::maybe_deserialize_from(reader)
    }

    /// Encodes a value to a byte vector.
    fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
    }

    /// Encodes a value into a writer.
    fn encode_into<W: Write>(&self, writer: W) -> Result<()> {
        bincode::serialize_into(writer, self)
    }
}

/// Blanket implementations for common wrappers of value types.
impl<V: Value> Value for Option<V> {}
impl<V: Value> Value for Vec<V> {}
impl<V1: Value, V2: Value> Value for (V1, V2) {}
