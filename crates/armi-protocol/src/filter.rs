//! Transportable subscription predicates.
//!
//! A subscriber may narrow its (type, flavor) key with a predicate. Only
//! predicates expressible in this closed grammar travel to the publishing
//! side; arbitrary callback predicates stay local to the subscribing hub.

use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;

/// Declarative predicate over an envelope, evaluated after the (type,
/// flavor) index lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterSpec {
    /// Accept only envelopes whose flavor is one of the given values.
    /// Useful under a null-flavor (match-all) subscription.
    FlavorIn(Vec<String>),
    /// Accept only payloads starting with the given bytes.
    PayloadPrefix(#[serde(with = "prefix_bytes")] Vec<u8>),
    /// Accept only payloads of at most the given size.
    PayloadMaxBytes(u32),
    Not(Box<FilterSpec>),
    AllOf(Vec<FilterSpec>),
    AnyOf(Vec<FilterSpec>),
}

impl FilterSpec {
    pub fn accepts(&self, env: &Envelope) -> bool {
        match self {
            FilterSpec::FlavorIn(flavors) => match &env.flavor {
                Some(f) => flavors.iter().any(|x| x == f),
                None => false,
            },
            FilterSpec::PayloadPrefix(prefix) => env.payload.starts_with(prefix),
            FilterSpec::PayloadMaxBytes(max) => env.payload.len() <= *max as usize,
            FilterSpec::Not(inner) => !inner.accepts(env),
            FilterSpec::AllOf(all) => all.iter().all(|f| f.accepts(env)),
            FilterSpec::AnyOf(any) => any.iter().any(|f| f.accepts(env)),
        }
    }
}

mod prefix_bytes {
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
