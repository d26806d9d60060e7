//! # Beacon SSZ
//!
//! A canonical binary encoding where the shape of every type is described at runtime by a
//! [`TypeDescriptor`] instead of at compile time.
//!
//! Descriptors are immutable and built once, usually from a network configuration, which lets the
//! same binary serve networks with different list bounds. Two descriptors built from the same
//! configuration compare equal, descriptors built with different bounds do not.
//!
//! ## Layout
//!
//! Fixed-size fields are written in declared order. Every variable-size field is replaced in the
//! fixed part by a 4 byte little-endian offset pointing at its data, which is appended after the
//! fixed part in the same order.
//!
//! [`decode`] is a verifier as much as a parser, input is rejected if it is truncated, if offsets
//! decrease or point past the end of the input, if bytes are left over, or if a list holds more
//! elements than its descriptor allows.
//!
//! ```rust
//! use beacon_ssz::{decode, encode, ContainerBuilder, TypeDescriptor, Value};
//!
//! let ty = ContainerBuilder::new("Example")
//!     .field("slot", TypeDescriptor::uint64())
//!     .field("roots", TypeDescriptor::list(TypeDescriptor::byte_vector(32), 4))
//!     .build();
//!
//! let value = Value::Container(vec![
//!     Value::Uint(7),
//!     Value::List(vec![Value::Bytes(vec![1; 32])]),
//! ]);
//!
//! let bytes = encode(&value, &ty).unwrap();
//! assert_eq!(decode(&bytes, &ty).unwrap(), value);
//! ```

mod decode;
mod descriptor;
mod encode;
mod error;
mod merkle;
mod value;

pub use decode::decode;
pub use descriptor::{ContainerBuilder, Field, Kind, TypeDescriptor};
pub use encode::encode;
pub use error::{DecodeError, EncodeError};
pub use merkle::{hash_tree_root, Root};
pub use value::Value;

/// The amount of bytes an offset takes in the fixed part of a container or list.
pub const BYTES_PER_OFFSET: usize = 4;

/// The size of a merkle chunk.
pub const BYTES_PER_CHUNK: usize = 32;
