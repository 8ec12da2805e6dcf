//! The client-visible event type and the well-known kinds the device and
//! the transport emit.

use std::time::SystemTime;

use serde_json::Value;

/// An asynchronous event: either relayed from the device or synthesized
/// internally (the `Internal*` kinds).
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: String,
    pub timestamp: SystemTime,
    pub payload: Value,
}

impl Event {
    pub fn new(kind: impl Into<String>, payload: Value) -> Event {
        Event { kind: kind.into(), timestamp: SystemTime::now(), payload }
    }
}

/// Kind string emitted when the framed transport drops its connection.
pub const KIND_INTERNAL_DISCONNECTED: &str = "InternalDisconnected";
/// Kind string emitted when the framed transport re-establishes its connection.
pub const KIND_INTERNAL_RECONNECTED: &str = "InternalReconnected";
pub const KIND_PI_STATUS: &str = "PiStatus";
pub const KIND_VIEW_STATE_CHANGED: &str = "ViewStateChanged";
pub const KIND_STACKING_STATUS: &str = "StackingStatus";
pub const KIND_FOCUSER_MOVE: &str = "FocuserMove";
pub const KIND_ANNOTATE_RESULT: &str = "AnnotateResult";
