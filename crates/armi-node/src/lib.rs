//! ARMI Node -- symmetric peer-to-peer messaging over one socket per peer.
//!
//! Two idioms share a single persistent TCP connection: synchronous remote
//! method invocation (call a named service, block until the response or a
//! timeout) and asynchronous publish/subscribe routed by a (type, flavor)
//! key. Either side may dial; the connection is symmetric afterwards, so a
//! hub behind NAT can receive server-originated calls and event deliveries
//! on the connection it opened.
//!
//! [`hub::Hub`] is the public API surface.

pub mod config;
pub mod demo;
pub mod error;
pub mod hub;
pub mod service;
pub mod subscription;

mod calls;
mod peer;

pub use config::HubConfig;
pub use error::ArmiError;
pub use hub::{AccessControl, Hub, Subscription, TypedPayload, REASON_SHUTDOWN};
pub use service::{string_arg, MethodFuture, ServiceDescriptor};
pub use subscription::{CallbackDelivery, Delivery, Filter};

pub use armi_protocol as protocol;
