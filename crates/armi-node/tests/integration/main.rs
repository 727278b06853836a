//! Integration test entry point for armi-node.
//!
//! Run with: cargo test --test integration

mod harness;
mod lifecycle;
mod pubsub;
mod rpc;
