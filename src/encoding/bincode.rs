//! Bincode encoding for stored values and the peer-to-peer wire protocol.
//!
//! This module wraps the bincode crate to pin the options used everywhere,
//! in particular variable-length rather than fixed-length integers. The
//! top-level bincode::(de)serialize functions use different options (fixed)
//! than DefaultOptions (variable), so all access goes through here.

use bincode::Options;

use crate::error::{Error, Result};

/// Returns the pinned Bincode options, initialized on first use.
fn bincode() -> &'static bincode::DefaultOptions {
    static BINCODE: std::sync::OnceLock<bincode::DefaultOptions> = std::sync::OnceLock::new();
    BINCODE.get_or_init(bincode::DefaultOptions::new)
}

/// Deserializes a value using Bincode.
pub fn deserialize<'de, T: serde::Deserialize<'de>>(bytes: &'de [u8]) -> Result<T> {
    Ok(bincode().deserialize(bytes)?)
}

/// Deserializes a value from a reader using Bincode.
pub fn deserialize_from<R: std::io::Read, T: serde::de::DeserializeOwned>(reader: R) -> Result<T> {
    Ok(bincode().deserialize_from(reader)?)
}

/// Deserializes a value from a reader using Bincode, or returns None if the
/// reader is closed.
pub fn maybe_deserialize_from<R: std::io::Read, T: serde::de::DeserializeOwned>(
    reader: R,
) -> Result<Option<T>> {
    match bincode().deserialize_from(reader) {
        Ok(t) => Ok(Some(t)),
        Err(e) => match *e {
            bincode::ErrorKind::Io(e) => match e.kind() {
                std::io::ErrorKind::UnexpectedEof => Ok(None),
                std::io::ErrorKind::ConnectionReset => Ok(None),
                _ => Err(Error::from(e)),
            },
            _ => Err(Error::from(e)),
        },
    }
}

/// Serializes a value using Bincode.
pub fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode().serialize(value)?)
}

/// Serializes a value into a writer using Bincode.
pub fn serialize_into<W: std::io::Write, T: serde::Serialize>(writer: W, value: &T) -> Result<()> {
    Ok(bincode().serialize_into(writer, value)?)
}
