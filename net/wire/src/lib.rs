//! # Beacon Wire
//!
//! This crate holds everything needed to put request/response messages on the wire:
//!
//! - [`ChainConfig`], the per-network numeric bounds and fork schedule.
//! - [`ForkSchedule`] and [`ForkContext`], mapping chain time and fork digests to forks.
//! - [`MessageType`] and the [`MessagePolicy`] table describing how each type behaves.
//! - [`SchemaRegistry`], which resolves a message type and fork into a [`TypeDescriptor`](beacon_ssz::TypeDescriptor).
//! - The [`codec`] module, length-prefixed snappy framing for requests and response chunks.
//!
//! The registry is built once from a [`ChainConfig`], no bound is a compile time constant.
pub mod codec;
pub mod config;
pub mod constants;
mod error;
pub mod fork;
pub mod message;
mod peer;
pub mod schema;
pub mod types;

pub use config::{ChainConfig, ForkConfig};
pub use error::{ConfigError, WireError};
pub use fork::{Fork, ForkContext, ForkDigest, ForkName, ForkSchedule};
pub use message::{
    Encoding, MessagePolicy, MessageType, PartialResponsePolicy, PolicyOverride, ProtocolId,
    ResponseCode,
};
pub use peer::PeerId;
pub use schema::SchemaRegistry;
pub use types::{
    BlobIdentifier, ContentKey, RangeRequest, RequestBody, ResponseItem,
    SignedBlsToExecutionChange, VersionedValidatorChange,
};

pub use beacon_ssz::Root;

/// Converts a configured `u64` bound into a `usize`, saturating on 32 bit targets.
pub(crate) fn u64_to_usize(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}
