//! Typed payload codec using `rmp-serde` and `rmpv`.
//!
//! The wire is self-describing: every payload travels as a MessagePack
//! value, and typed decoding is driven by the descriptor types supplied at
//! handler registration. Structs are always encoded as maps
//! (`to_vec_named`), never as positional arrays, so peers in other
//! languages can decode by field name.

use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, SwillError};

/// MessagePack codec for typed payloads.
///
/// Uses `rmp_serde::to_vec_named` so structs serialize as maps (with field
/// names) rather than arrays (positional).
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MessagePack bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MessagePack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Convert a typed value into a dynamic [`Value`] for the `data` slot of
    /// an envelope.
    #[inline]
    pub fn to_value<T: Serialize>(value: &T) -> Result<Value> {
        rmpv::ext::to_value(value).map_err(SwillError::encode_err)
    }

    /// Convert a dynamic [`Value`] from the `data` slot into the type the
    /// handler declared at registration.
    #[inline]
    pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T> {
        rmpv::ext::from_value(value).map_err(SwillError::decode_err)
    }
}
