//! Error type for hub operations.

use armi_protocol::{ProtocolError, WireError};

/// Anything a call, subscribe, or hub-lifecycle operation can fail with.
///
/// Invocation errors always travel back as response values and surface here
/// as [`ArmiError::Invocation`]; they never taint the connection. Timeouts
/// are observed only by the waiting caller.
#[derive(Debug, thiserror::Error)]
pub enum ArmiError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("time-out expired: {0}")]
    Timeout(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("invocation failed: {0}")]
    Invocation(WireError),
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("connection closed: {0}")]
    Closed(String),
}

impl From<WireError> for ArmiError {
    fn from(e: WireError) -> Self {
        ArmiError::Invocation(e)
    }
}
