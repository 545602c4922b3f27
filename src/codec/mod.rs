//! Codec module - serialization/deserialization for envelopes and payloads.
//!
//! Two layers:
//!
//! - [`envelope`] - encodes/decodes whole request and response envelopes
//!   (MessagePack arrays with minimal-tail truncation)
//! - [`MsgPackCodec`] - typed payload codec for the `data` slot
//!   (`to_vec_named` for struct-as-map format)
//!
//! # Example
//!
//! ```
//! use swill::codec::{decode_request, encode_request, MsgPackCodec};
//! use swill::protocol::RequestFrame;
//!
//! let args = MsgPackCodec::to_value(&(1u32, 2u32)).unwrap();
//! let frame = RequestFrame::message(1, "add", args);
//!
//! let bytes = encode_request(&frame).unwrap();
//! assert_eq!(decode_request(&bytes).unwrap(), frame);
//! ```

mod envelope;
mod msgpack;

pub use envelope::{
    decode_request, decode_response, encode_request, encode_response, FrameDecodeError,
};
pub use msgpack::MsgPackCodec;
