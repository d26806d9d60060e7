//! Beacon Test Utils
//!
//! This crate contains code that can be shared across the workspace's tests: a small
//! [`ChainConfig`](beacon_wire::ChainConfig), payload builders, and an in-memory
//! [`MockTransport`] whose peers either serve a [`MockStore`] or act out a script.
pub mod fixtures;
mod store;
mod transport;

pub use store::MockStore;
pub use transport::{Behaviour, MockPeer, MockTransport, ScriptStep};
