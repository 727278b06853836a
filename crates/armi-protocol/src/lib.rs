//! ARMI Protocol -- wire types, frame codec, payload bodies.
//!
//! TCP between peers, one long-lived socket per peer pair. Every transmitted
//! unit is one [`Envelope`]: marker-prefixed nullable strings, big-endian
//! integers, raw payload bytes. No stream header, no per-value preamble.

pub mod codec;
pub mod envelope;
pub mod filter;
pub mod payload;

pub use codec::EnvelopeCodec;
pub use envelope::Envelope;
pub use filter::FilterSpec;
pub use payload::{CallOutcome, CallRequest, CallResponse, SubscribeControl, TraceFrame, Value, WireError};

/// Default port for inter-hub ARMI communication.
pub const DEFAULT_PORT: u16 = 1441;

/// Default synchronous-call timeout in milliseconds.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 10_000;

/// Default connect timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Maximum payload size: 16 MB.
pub const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Privileged envelope type: subscription / cancellation control message.
pub const SUBSCRIBER_TYPE: &str = "SubscriberRemote";

/// Privileged envelope type: invocation request bound for the service registry.
pub const CALL_TYPE: &str = "SynchronousCall";

/// Privileged envelope type: the paired reply for a prior call.
pub const RESPONSE_TYPE: &str = "SynchronousResponse";

/// Privileged envelope type: a transportable error value.
pub const ERROR_TYPE: &str = "ArmiException";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("negative payload length: {0}")]
    NegativePayloadLength(i32),
    #[error("unsupported compression: {0:#04x}")]
    UnsupportedCompression(u8),
    #[error("corrupt frame: {0}")]
    Corrupt(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
