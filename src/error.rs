//! Error taxonomy for the control and imaging clients.
//!
//! Variant names describe the failure by cause, not by the underlying
//! transport library's error type -- callers are expected to match on
//! these, not on the underlying I/O error.

use scopewire_protocol::ErrorPayload;

/// Every way an operation against the device can fail.
#[derive(Debug, thiserror::Error, Clone)]
pub enum ClientError {
    /// Could not establish the transport (timeout, refused, DNS).
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Transport lost mid-operation; pending requests fail with this.
    #[error("disconnected")]
    Disconnected,

    /// Request deadline exceeded while the transport was still up.
    #[error("timed out")]
    Timeout,

    /// Malformed frame or unparseable JSON. Non-fatal for the session.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The device returned an `error` object in response to a command.
    #[error("command rejected: {code} {message}")]
    CommandRejected { code: i64, message: String },

    /// A bounded queue stayed full past its configured timeout.
    #[error("overloaded")]
    Overloaded,

    /// The caller tore down the session while this request was in flight.
    #[error("cancelled")]
    Cancelled,
}

impl ClientError {
    pub(crate) fn from_device_error(err: ErrorPayload) -> ClientError {
        ClientError::CommandRejected { code: err.code, message: err.message }
    }
}
