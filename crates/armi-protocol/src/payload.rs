//! Payload bodies for the privileged envelope types.
//!
//! The envelope payload is opaque binary to the framing layer; the four
//! privileged types carry serde JSON bodies defined here. Application
//! payloads are free-form bytes. Byte fields travel as base64 strings.

use serde::{Deserialize, Serialize};

use crate::filter::FilterSpec;
use crate::ProtocolError;

/// Closed value grammar for call arguments and results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    List(Vec<Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Body of a `SynchronousCall` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub service: String,
    pub method: String,
    /// Unique within the issuing hub; pairs the response to its caller.
    pub serial: u64,
    pub args: Vec<Value>,
}

/// Body of a `SynchronousResponse` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    pub serial: u64,
    pub outcome: CallOutcome,
}

/// Result of a remote invocation; errors travel as values, never as
/// connection failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Value(Value),
    Error(WireError),
}

/// Body of a `SubscriberRemote` control envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeControl {
    pub data_type: String,
    pub flavor: Option<String>,
    /// Transportable part of the predicate; `None` when the predicate could
    /// not travel and is evaluated only at the subscriber's own hub.
    pub filter: Option<FilterSpec>,
    /// `true` to install, `false` to cancel a matching subscription.
    pub subscribe: bool,
}

/// A transportable structured error; round-trips on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub message: String,
    #[serde(default)]
    pub trace: Vec<TraceFrame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<WireError>>,
}

/// One captured frame of the origin site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceFrame {
    /// Module or type that produced the error.
    pub location: String,
    pub file: String,
    pub method: String,
    pub line: u32,
}

impl WireError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: Vec::new(),
            cause: None,
        }
    }

    /// Create an error recording the caller's source location as its one
    /// trace frame.
    #[track_caller]
    pub fn here(message: impl Into<String>) -> Self {
        let loc = std::panic::Location::caller();
        Self::new(message).with_frame(TraceFrame {
            location: env!("CARGO_PKG_NAME").to_owned(),
            file: loc.file().to_owned(),
            method: String::new(),
            line: loc.line(),
        })
    }

    pub fn with_frame(mut self, frame: TraceFrame) -> Self {
        self.trace.push(frame);
        self
    }

    pub fn with_cause(mut self, cause: WireError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, "; caused by: {cause}")?;
        }
        Ok(())
    }
}

/// Encode a payload body to bytes.
pub fn encode<T: Serialize>(body: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(body)?)
}

/// Decode a payload body from bytes.
pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Serialize/deserialize `Vec<u8>` as a base64 string.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
