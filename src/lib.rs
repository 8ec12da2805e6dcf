//! Client library for a networked consumer telescope's control and imaging
//! protocols: a reconnecting line-JSON control channel and a parallel
//! binary imaging channel.
//!
//! The library never installs a global `tracing` subscriber or otherwise
//! touches process-wide state -- callers (typically a CLI) own that.

mod backoff;
mod config;
mod control_client;
mod correlator;
mod error;
mod event;
mod event_bus;
mod imaging_client;
mod status;
mod transport;

pub use config::{ClientConfig, Endpoint, ReconnectConfig};
pub use control_client::{with_session, ControlClient, ControlSession, SendOptions};
pub use correlator::Response;
pub use error::ClientError;
pub use event::{
    Event, KIND_ANNOTATE_RESULT, KIND_FOCUSER_MOVE, KIND_INTERNAL_DISCONNECTED, KIND_INTERNAL_RECONNECTED,
    KIND_PI_STATUS, KIND_STACKING_STATUS, KIND_VIEW_STATE_CHANGED,
};
pub use event_bus::{Subscription, SubscriptionKind};
pub use imaging_client::{FrameSource, FrameSubscription, ImagingClient, StreamMode};
pub use status::{ConnectionFlags, PiStatus, Pointing, Snapshot, StackCounters, StatusStore, ViewState};
pub use transport::{ImagingEvent, TransportEvent};

pub use scopewire_protocol::{
    BinaryFrame, BinaryFrameKind, BinaryHeader, BinaryHeaderError, ErrorPayload, BINARY_HEADER_LEN, DEFAULT_MAX_FRAME,
};
