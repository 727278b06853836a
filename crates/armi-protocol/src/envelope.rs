//! The envelope -- the single framing unit on the wire.
//!
//! `data_type` is conventionally a fully qualified type name but is opaque to
//! the core; four privileged values are recognised by the dispatch hub (see
//! the crate-root constants). `flavor` is an optional sub-category used as
//! the second half of the subscription routing key.

use bytes::Bytes;

use crate::payload;
use crate::{ProtocolError, CALL_TYPE, ERROR_TYPE, RESPONSE_TYPE, SUBSCRIBER_TYPE};

/// One wire frame: `(data_type, flavor, compression, payload)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Routing type; required. Usually a fully qualified type name.
    pub data_type: String,
    /// Optional sub-category; `None` generalises over all flavors on the
    /// subscription side.
    pub flavor: Option<String>,
    /// Compression algorithm; only `0` (identity) is defined.
    pub compression: u8,
    /// Opaque payload bytes; interpretation depends on `data_type`.
    pub payload: Bytes,
}

impl Envelope {
    /// Wrap raw payload bytes under an application type tag.
    pub fn new(data_type: impl Into<String>, flavor: Option<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            data_type: data_type.into(),
            flavor,
            compression: 0,
            payload: payload.into(),
        }
    }

    /// Build a `SynchronousCall` envelope.
    pub fn call(request: &payload::CallRequest) -> Result<Self, ProtocolError> {
        Ok(Self::new(CALL_TYPE, None, payload::encode(request)?))
    }

    /// Build a `SynchronousResponse` envelope.
    pub fn response(response: &payload::CallResponse) -> Result<Self, ProtocolError> {
        Ok(Self::new(RESPONSE_TYPE, None, payload::encode(response)?))
    }

    /// Build a `SubscriberRemote` control envelope.
    pub fn subscriber(control: &payload::SubscribeControl) -> Result<Self, ProtocolError> {
        Ok(Self::new(SUBSCRIBER_TYPE, None, payload::encode(control)?))
    }

    /// Build a standalone `ArmiException` envelope.
    pub fn error(err: &payload::WireError) -> Result<Self, ProtocolError> {
        Ok(Self::new(ERROR_TYPE, None, payload::encode(err)?))
    }

    /// Whether the hub handles this type specially rather than fanning it out.
    pub fn is_privileged(&self) -> bool {
        matches!(
            self.data_type.as_str(),
            SUBSCRIBER_TYPE | CALL_TYPE | RESPONSE_TYPE | ERROR_TYPE
        )
    }

    /// Decode the payload as one of the privileged bodies.
    pub fn decode_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        payload::decode(&self.payload)
    }
}

impl std::fmt::Display for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}/{}]",
            self.data_type,
            self.flavor.as_deref().unwrap_or("")
        )
    }
}
