//! Envelope codec.
//!
//! Each WebSocket binary message is exactly one envelope: a MessagePack
//! array of 3-5 slots for requests, 2-5 slots for responses. Encoding emits
//! the shortest array that preserves semantics: trailing optional slots are
//! omitted when at their defaults, and when a later slot is set the
//! intervening slots are filled with their defaults (nil metadata, MESSAGE
//! type).

use rmpv::Value;

use crate::error::SwillError;
use crate::protocol::{Metadata, RequestFrame, RequestKind, ResponseFrame, ResponseKind};

/// A frame-level decode failure.
///
/// When the sequence slot was readable the error is attributable and the
/// dispatcher answers on that sequence; otherwise the connection is torn
/// down.
#[derive(Debug)]
pub struct FrameDecodeError {
    /// Sequence number, when it could be extracted from the broken frame.
    pub seq: Option<u64>,
    /// What went wrong.
    pub reason: String,
}

impl FrameDecodeError {
    fn new(seq: Option<u64>, reason: impl Into<String>) -> Self {
        Self {
            seq,
            reason: reason.into(),
        }
    }
}

impl From<FrameDecodeError> for SwillError {
    fn from(e: FrameDecodeError) -> Self {
        SwillError::Decode(e.reason)
    }
}

/// Decode a single binary message into a request envelope.
pub fn decode_request(bytes: &[u8]) -> Result<RequestFrame, FrameDecodeError> {
    let mut slots = decode_array(bytes)?;
    let seq = read_seq(&slots)?;

    if slots.len() < 3 || slots.len() > 5 {
        return Err(FrameDecodeError::new(
            Some(seq),
            format!("request envelope must have 3-5 slots, got {}", slots.len()),
        ));
    }

    let metadata = match slots.pop_if_index(4) {
        Some(value) => read_metadata(seq, value)?,
        None => None,
    };
    let kind = match slots.pop_if_index(3) {
        Some(value) => read_kind(seq, value, RequestKind::from_u64, RequestKind::Message)?,
        None => RequestKind::Message,
    };
    let method = match slots.pop() {
        Some(Value::String(s)) => s
            .into_str()
            .ok_or_else(|| FrameDecodeError::new(Some(seq), "method must be valid utf-8"))?,
        _ => return Err(FrameDecodeError::new(Some(seq), "method must be a string")),
    };
    let data = slots.pop().expect("length checked above");

    Ok(RequestFrame {
        seq,
        data,
        method,
        kind,
        metadata,
    })
}

/// Decode a single binary message into a response envelope.
pub fn decode_response(bytes: &[u8]) -> Result<ResponseFrame, FrameDecodeError> {
    let mut slots = decode_array(bytes)?;
    let seq = read_seq(&slots)?;

    if slots.len() < 2 || slots.len() > 5 {
        return Err(FrameDecodeError::new(
            Some(seq),
            format!("response envelope must have 2-5 slots, got {}", slots.len()),
        ));
    }

    let trailing_metadata = match slots.pop_if_index(4) {
        Some(value) => read_metadata(seq, value)?,
        None => None,
    };
    let leading_metadata = match slots.pop_if_index(3) {
        Some(value) => read_metadata(seq, value)?,
        None => None,
    };
    let kind = match slots.pop_if_index(2) {
        Some(value) => read_kind(seq, value, ResponseKind::from_u64, ResponseKind::Message)?,
        None => ResponseKind::Message,
    };
    let data = slots.pop().expect("length checked above");

    Ok(ResponseFrame {
        seq,
        data,
        kind,
        leading_metadata,
        trailing_metadata,
    })
}

/// Encode a request envelope as the minimal MessagePack array.
pub fn encode_request(frame: &RequestFrame) -> Result<Vec<u8>, SwillError> {
    let mut slots = vec![
        Value::from(frame.seq),
        frame.data.clone(),
        Value::from(frame.method.as_str()),
    ];

    if let Some(metadata) = &frame.metadata {
        slots.push(Value::from(frame.kind.as_u64()));
        slots.push(metadata_value(metadata));
    } else if frame.kind != RequestKind::Message {
        slots.push(Value::from(frame.kind.as_u64()));
    }

    write_array(slots)
}

/// Encode a response envelope as the minimal MessagePack array.
pub fn encode_response(frame: &ResponseFrame) -> Result<Vec<u8>, SwillError> {
    let mut slots = vec![Value::from(frame.seq), frame.data.clone()];

    let last_set = if frame.trailing_metadata.is_some() {
        4
    } else if frame.leading_metadata.is_some() {
        3
    } else if frame.kind != ResponseKind::Message {
        2
    } else {
        1
    };

    if last_set >= 2 {
        slots.push(Value::from(frame.kind.as_u64()));
    }
    if last_set >= 3 {
        slots.push(match &frame.leading_metadata {
            Some(metadata) => metadata_value(metadata),
            None => Value::Nil,
        });
    }
    if last_set >= 4 {
        slots.push(match &frame.trailing_metadata {
            Some(metadata) => metadata_value(metadata),
            None => Value::Nil,
        });
    }

    write_array(slots)
}

fn decode_array(bytes: &[u8]) -> Result<Vec<Value>, FrameDecodeError> {
    let mut reader = bytes;
    let value = rmpv::decode::read_value(&mut reader)
        .map_err(|e| FrameDecodeError::new(None, format!("invalid msgpack: {e}")))?;
    match value {
        Value::Array(slots) => Ok(slots),
        other => Err(FrameDecodeError::new(
            None,
            format!("envelope must be an array, got {other}"),
        )),
    }
}

fn read_seq(slots: &[Value]) -> Result<u64, FrameDecodeError> {
    slots
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| FrameDecodeError::new(None, "sequence must be an unsigned integer"))
}

fn read_kind<K>(
    seq: u64,
    value: Value,
    from_u64: fn(u64) -> Option<K>,
    default: K,
) -> Result<K, FrameDecodeError> {
    match value {
        Value::Nil => Ok(default),
        other => {
            let raw = other.as_u64().ok_or_else(|| {
                FrameDecodeError::new(Some(seq), "frame type must be an unsigned integer")
            })?;
            from_u64(raw)
                .ok_or_else(|| FrameDecodeError::new(Some(seq), format!("unknown frame type {raw}")))
        }
    }
}

fn read_metadata(seq: u64, value: Value) -> Result<Option<Metadata>, FrameDecodeError> {
    match value {
        Value::Nil => Ok(None),
        Value::Map(entries) => {
            // Duplicate keys collapse last-write-wins.
            let mut metadata = Metadata::new();
            for (key, item) in entries {
                let key = match key {
                    Value::String(s) => s.into_str().ok_or_else(|| {
                        FrameDecodeError::new(Some(seq), "metadata keys must be valid utf-8")
                    })?,
                    _ => {
                        return Err(FrameDecodeError::new(
                            Some(seq),
                            "metadata keys must be strings",
                        ))
                    }
                };
                metadata.insert(key, item);
            }
            Ok(Some(metadata))
        }
        _ => Err(FrameDecodeError::new(Some(seq), "metadata must be a map")),
    }
}

fn metadata_value(metadata: &Metadata) -> Value {
    Value::Map(
        metadata
            .iter()
            .map(|(key, value)| (Value::from(key.as_str()), value.clone()))
            .collect(),
    )
}

fn write_array(slots: Vec<Value>) -> Result<Vec<u8>, SwillError> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &Value::Array(slots)).map_err(SwillError::encode_err)?;
    Ok(buf)
}

/// Pop-the-tail helper: removes and returns the element at `index` only when
/// it is the current last element.
trait PopIfIndex {
    fn pop_if_index(&mut self, index: usize) -> Option<Value>;
}

impl PopIfIndex for Vec<Value> {
    fn pop_if_index(&mut self, index: usize) -> Option<Value> {
        if self.len() == index + 1 {
            self.pop()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorCode, ErrorMessage};

    fn metadata(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(*v)))
            .collect()
    }

    #[test]
    fn test_request_minimal_message() {
        let frame = RequestFrame::message(1, "add", Value::Array(vec![1.into(), 2.into()]));
        let bytes = encode_request(&frame).unwrap();

        // fixarray with exactly three slots: type and metadata elided
        assert_eq!(bytes[0], 0x93);

        let decoded = decode_request(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_request_control_frame_has_four_slots() {
        let frame = RequestFrame::end_of_stream(3, "sum");
        let bytes = encode_request(&frame).unwrap();
        assert_eq!(bytes[0], 0x94);

        let decoded = decode_request(&bytes).unwrap();
        assert_eq!(decoded.kind, RequestKind::EndOfStream);
        assert_eq!(decoded.data, Value::Nil);
    }

    #[test]
    fn test_request_with_metadata_fills_type_slot() {
        let frame = RequestFrame::message(2, "echo", Value::from("hi"))
            .with_metadata(metadata(&[("trace", "abc")]));
        let bytes = encode_request(&frame).unwrap();
        assert_eq!(bytes[0], 0x95);

        let decoded = decode_request(&bytes).unwrap();
        assert_eq!(decoded.kind, RequestKind::Message);
        assert_eq!(decoded.metadata, frame.metadata);
    }

    #[test]
    fn test_request_type_defaults_to_message() {
        // Hand-built three-slot envelope: [5, nil, "ping"]
        let mut buf = Vec::new();
        rmpv::encode::write_value(
            &mut buf,
            &Value::Array(vec![5.into(), Value::Nil, "ping".into()]),
        )
        .unwrap();

        let decoded = decode_request(&buf).unwrap();
        assert_eq!(decoded.kind, RequestKind::Message);
        assert!(decoded.metadata.is_none());
    }

    #[test]
    fn test_request_reencode_is_minimal_tail() {
        // Wasteful peer encoding: explicit default type and nil metadata.
        let mut buf = Vec::new();
        rmpv::encode::write_value(
            &mut buf,
            &Value::Array(vec![
                9.into(),
                "x".into(),
                "echo".into(),
                0.into(),
                Value::Nil,
            ]),
        )
        .unwrap();

        let decoded = decode_request(&buf).unwrap();
        let reencoded = encode_request(&decoded).unwrap();
        assert_eq!(reencoded[0], 0x93);
        assert_eq!(decode_request(&reencoded).unwrap(), decoded);
    }

    #[test]
    fn test_response_minimal_message() {
        let frame = ResponseFrame::message(1, Value::from(3u64));
        let bytes = encode_response(&frame).unwrap();
        assert_eq!(bytes[0], 0x92);

        let decoded = decode_response(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_response_trailing_fills_intervening_slots() {
        let frame = ResponseFrame::end_of_stream(4)
            .with_trailing_metadata(Some(metadata(&[("elapsed", "12ms")])));
        let bytes = encode_response(&frame).unwrap();

        // All five slots present: trailing metadata forces a nil leading slot.
        assert_eq!(bytes[0], 0x95);

        let decoded = decode_response(&bytes).unwrap();
        assert_eq!(decoded.kind, ResponseKind::EndOfStream);
        assert!(decoded.leading_metadata.is_none());
        assert_eq!(decoded.trailing_metadata, frame.trailing_metadata);
    }

    #[test]
    fn test_response_leading_only_truncates_trailing() {
        let frame =
            ResponseFrame::message(4, Value::from(1u64)).with_leading_metadata(metadata(&[("a", "b")]));
        let bytes = encode_response(&frame).unwrap();
        assert_eq!(bytes[0], 0x94);

        let decoded = decode_response(&bytes).unwrap();
        assert_eq!(decoded.leading_metadata, frame.leading_metadata);
        assert!(decoded.trailing_metadata.is_none());
    }

    #[test]
    fn test_response_error_round_trip() {
        let frame = ResponseFrame::error(5, ErrorMessage::reserved(ErrorCode::MethodNotFound, "nope"));
        let bytes = encode_response(&frame).unwrap();
        assert_eq!(bytes[0], 0x93);

        let decoded = decode_response(&bytes).unwrap();
        assert_eq!(decoded.kind, ResponseKind::Error);
        let error = decoded.error_message().unwrap();
        assert_eq!(error.code, 404);
    }

    #[test]
    fn test_decode_rejects_non_array() {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &Value::from("nope")).unwrap();

        let err = decode_request(&buf).unwrap_err();
        assert!(err.seq.is_none());
    }

    #[test]
    fn test_decode_rejects_short_request() {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &Value::Array(vec![1.into(), Value::Nil])).unwrap();

        let err = decode_request(&buf).unwrap_err();
        assert_eq!(err.seq, Some(1));
    }

    #[test]
    fn test_decode_rejects_unknown_frame_type() {
        let mut buf = Vec::new();
        rmpv::encode::write_value(
            &mut buf,
            &Value::Array(vec![1.into(), Value::Nil, "m".into(), 9.into()]),
        )
        .unwrap();

        let err = decode_request(&buf).unwrap_err();
        assert_eq!(err.seq, Some(1));
        assert!(err.reason.contains("unknown frame type"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode_response(b"\xc1not msgpack").unwrap_err();
        assert!(err.seq.is_none());
    }

    #[test]
    fn test_metadata_duplicate_keys_last_write_wins() {
        let entries = vec![
            (Value::from("k"), Value::from("first")),
            (Value::from("k"), Value::from("second")),
        ];
        let mut buf = Vec::new();
        rmpv::encode::write_value(
            &mut buf,
            &Value::Array(vec![
                1.into(),
                Value::Nil,
                "m".into(),
                2.into(),
                Value::Map(entries),
            ]),
        )
        .unwrap();

        let decoded = decode_request(&buf).unwrap();
        let metadata = decoded.metadata.unwrap();
        assert_eq!(metadata.get("k"), Some(&Value::from("second")));
    }
}
