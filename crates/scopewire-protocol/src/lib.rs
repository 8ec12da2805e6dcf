// scopewire-protocol: wire types for the device's two TCP protocols.
//
// This crate has no socket I/O. It describes the shapes and framing rules
// that the transport layer in the `scopewire` crate reads and writes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Text protocol: outgoing envelope
// ---------------------------------------------------------------------------

/// Outgoing command envelope on the text protocol.
///
/// Serializes to `{"id":N,"method":"X","params":{...}}`. The LF terminator
/// is appended by the transport, not by this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl Envelope {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Envelope { id, method: method.into(), params }
    }

    /// Encode to a single line, LF-terminated, suitable for writing directly
    /// to the socket.
    pub fn encode_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

// ---------------------------------------------------------------------------
// Text protocol: incoming classification
// ---------------------------------------------------------------------------

/// A device-reported error, carried inside a [`ResponseMessage`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: i64,
    pub message: String,
}

/// A parsed response, keyed by the request id it answers.
#[derive(Debug, Clone)]
pub struct ResponseMessage {
    pub id: u64,
    pub result: Option<Value>,
    pub error: Option<ErrorPayload>,
}

/// A parsed unsolicited device event.
#[derive(Debug, Clone)]
pub struct EventMessage {
    pub kind: String,
    pub payload: Value,
}

/// Classification of one incoming JSON line, per the text protocol rules:
///
/// - `id` present AND (`result` or `error` present) -> [`Response`]
/// - `Event` field present, OR `method` present without `id` -> [`Event`]
/// - anything else -> [`Notification`] (logged and dropped by the caller)
///
/// [`Response`]: IncomingMessage::Response
/// [`Event`]: IncomingMessage::Event
/// [`Notification`]: IncomingMessage::Notification
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    Response(ResponseMessage),
    Event(EventMessage),
    Notification(Value),
}

impl IncomingMessage {
    pub fn classify(value: Value) -> IncomingMessage {
        let Some(obj) = value.as_object() else {
            return IncomingMessage::Notification(value);
        };

        let has_id = obj.contains_key("id");
        let has_result_or_error = obj.contains_key("result") || obj.contains_key("error");

        if has_id && has_result_or_error {
            if let Some(id) = obj.get("id").and_then(Value::as_u64) {
                let result = obj.get("result").cloned();
                let error = obj
                    .get("error")
                    .and_then(|e| serde_json::from_value::<ErrorPayload>(e.clone()).ok());
                return IncomingMessage::Response(ResponseMessage { id, result, error });
            }
        }

        if let Some(kind) = obj.get("Event").and_then(Value::as_str) {
            let payload = obj.get("payload").cloned().unwrap_or(Value::Null);
            return IncomingMessage::Event(EventMessage { kind: kind.to_owned(), payload });
        }

        if !has_id {
            if let Some(method) = obj.get("method").and_then(Value::as_str) {
                let payload = obj.get("params").cloned().unwrap_or(Value::Null);
                return IncomingMessage::Event(EventMessage { kind: method.to_owned(), payload });
            }
        }

        IncomingMessage::Notification(value)
    }
}

// ---------------------------------------------------------------------------
// Binary protocol
// ---------------------------------------------------------------------------

/// Total size of the fixed binary header, in bytes.
pub const BINARY_HEADER_LEN: usize = 80;

/// Default cap on a single binary frame's total size (header + payload).
pub const DEFAULT_MAX_FRAME: u32 = 32 * 1024 * 1024;

/// Leading magic value a valid header starts with.
///
/// The device's actual magic constant is undocumented beyond its leading
/// nibble (`0x80`); this value is this crate's placeholder and is what
/// [`BinaryHeader::decode`] checks against. See DESIGN.md for the rationale.
pub const BINARY_MAGIC: u32 = 0x8000_0001;

/// The kind of payload carried by a [`BinaryHeader`]/frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BinaryFrameKind {
    Preview = 0,
    Stacked = 1,
    Raw = 2,
    Thumbnail = 3,
}

impl TryFrom<u32> for BinaryFrameKind {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BinaryFrameKind::Preview),
            1 => Ok(BinaryFrameKind::Stacked),
            2 => Ok(BinaryFrameKind::Raw),
            3 => Ok(BinaryFrameKind::Thumbnail),
            other => Err(other),
        }
    }
}

/// Errors decoding a fixed binary header.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BinaryHeaderError {
    #[error("header too short: got {0} bytes, need {BINARY_HEADER_LEN}")]
    TooShort(usize),
    #[error("bad magic: 0x{0:08x}")]
    BadMagic(u32),
    #[error("length {length} below header size {BINARY_HEADER_LEN}")]
    LengthBelowHeader { length: u32 },
    #[error("length {length} exceeds max frame size {max_frame}")]
    LengthExceedsMax { length: u32, max_frame: u32 },
    #[error("unknown frame kind {0}")]
    UnknownKind(u32),
}

/// The fixed 80-byte little-endian header preceding every binary payload.
///
/// Layout: `magic(4)`, `reserved(4)`, `length(4)`, `id(8)`, `kind(4)`,
/// `timestamp(8)`, filler to 80 bytes. `length` covers header + payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryHeader {
    pub length: u32,
    pub id: u64,
    pub kind: u32,
    pub timestamp: u64,
}

impl BinaryHeader {
    /// Decode and validate a header from exactly [`BINARY_HEADER_LEN`] bytes.
    ///
    /// Does not validate `length` against a max frame size -- callers check
    /// that separately once they know the configured limit, so the codec
    /// never allocates before the caller has had a chance to reject an
    /// oversized frame.
    pub fn decode(bytes: &[u8]) -> Result<BinaryHeader, BinaryHeaderError> {
        if bytes.len() < BINARY_HEADER_LEN {
            return Err(BinaryHeaderError::TooShort(bytes.len()));
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if magic != BINARY_MAGIC {
            return Err(BinaryHeaderError::BadMagic(magic));
        }
        let length = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        if (length as usize) < BINARY_HEADER_LEN {
            return Err(BinaryHeaderError::LengthBelowHeader { length });
        }
        let id = u64::from_le_bytes(bytes[12..20].try_into().unwrap());
        let kind = u32::from_le_bytes(bytes[20..24].try_into().unwrap());
        let timestamp = u64::from_le_bytes(bytes[24..32].try_into().unwrap());
        Ok(BinaryHeader { length, id, kind, timestamp })
    }

    /// Encode into a fresh [`BINARY_HEADER_LEN`]-byte buffer. `reserved` and
    /// the filler bytes are zeroed.
    pub fn encode(&self) -> [u8; BINARY_HEADER_LEN] {
        let mut buf = [0u8; BINARY_HEADER_LEN];
        buf[0..4].copy_from_slice(&BINARY_MAGIC.to_le_bytes());
        // bytes[4..8] reserved, left zero.
        buf[8..12].copy_from_slice(&self.length.to_le_bytes());
        buf[12..20].copy_from_slice(&self.id.to_le_bytes());
        buf[20..24].copy_from_slice(&self.kind.to_le_bytes());
        buf[24..32].copy_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    /// Size of the payload this header describes.
    pub fn payload_len(&self) -> usize {
        self.length as usize - BINARY_HEADER_LEN
    }
}

/// A fully decoded binary frame: header fields plus the opaque payload.
///
/// `width`/`height` are part of the data model but the fixed 80-byte header
/// has no fields for them -- the device may encode them inside the payload
/// itself depending on `kind`, which this crate does not parse. Always
/// `None` until that payload layout is documented.
#[derive(Debug, Clone)]
pub struct BinaryFrame {
    pub id: u64,
    pub kind: BinaryFrameKind,
    pub timestamp: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_header_round_trips() {
        let header = BinaryHeader { length: 80 + 42, id: 7, kind: 1, timestamp: 123_456 };
        let encoded = header.encode();
        let decoded = BinaryHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.payload_len(), 42);
    }

    #[test]
    fn binary_header_rejects_bad_magic() {
        let mut buf = [0u8; BINARY_HEADER_LEN];
        buf[0..4].copy_from_slice(&0xdead_beefu32.to_le_bytes());
        assert_eq!(BinaryHeader::decode(&buf), Err(BinaryHeaderError::BadMagic(0xdead_beef)));
    }

    #[test]
    fn binary_header_rejects_short_buffer() {
        let buf = [0u8; 10];
        assert_eq!(BinaryHeader::decode(&buf), Err(BinaryHeaderError::TooShort(10)));
    }

    #[test]
    fn binary_header_rejects_length_below_header_size() {
        let header = BinaryHeader { length: 10, id: 1, kind: 0, timestamp: 0 };
        let encoded = header.encode();
        assert_eq!(
            BinaryHeader::decode(&encoded),
            Err(BinaryHeaderError::LengthBelowHeader { length: 10 })
        );
    }

    #[test]
    fn envelope_encode_line_appends_lf() {
        let env = Envelope::new(1, "GetTime", serde_json::json!({}));
        let line = env.encode_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line, "{\"id\":1,\"method\":\"GetTime\",\"params\":{}}\n");
    }

    #[test]
    fn classify_response_with_result() {
        let v = serde_json::json!({"id": 1, "result": {"time": "x"}});
        match IncomingMessage::classify(v) {
            IncomingMessage::Response(r) => {
                assert_eq!(r.id, 1);
                assert!(r.result.is_some());
                assert!(r.error.is_none());
            }
            other => panic!("expected Response, got {:?}", other),
        }
    }

    #[test]
    fn classify_response_with_error() {
        let v = serde_json::json!({"id": 2, "error": {"code": 5, "message": "nope"}});
        match IncomingMessage::classify(v) {
            IncomingMessage::Response(r) => {
                assert_eq!(r.id, 2);
                assert_eq!(r.error.unwrap().code, 5);
            }
            other => panic!("expected Response, got {:?}", other),
        }
    }

    #[test]
    fn classify_event_field() {
        let v = serde_json::json!({"Event": "PiStatus", "payload": {"battery": 80}});
        match IncomingMessage::classify(v) {
            IncomingMessage::Event(e) => assert_eq!(e.kind, "PiStatus"),
            other => panic!("expected Event, got {:?}", other),
        }
    }

    #[test]
    fn classify_method_without_id_is_event() {
        let v = serde_json::json!({"method": "FocuserMove", "params": {"position": 10}});
        match IncomingMessage::classify(v) {
            IncomingMessage::Event(e) => assert_eq!(e.kind, "FocuserMove"),
            other => panic!("expected Event, got {:?}", other),
        }
    }

    #[test]
    fn classify_unrecognized_object_is_notification() {
        let v = serde_json::json!({"ping": true});
        assert!(matches!(IncomingMessage::classify(v), IncomingMessage::Notification(_)));
    }
}
