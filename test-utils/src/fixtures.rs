//! Test configs and payloads.
use std::sync::Arc;

use beacon_ssz::{Kind, TypeDescriptor, Value};
use beacon_wire::{
    BlobIdentifier, ChainConfig, ContentKey, ForkConfig, ForkContext, ForkName, MessageType,
    SchemaRegistry,
};

/// A small config with every fork active from genesis.
pub fn test_config() -> ChainConfig {
    let mut config = ChainConfig::minimal();
    config.preset = "test".to_string();
    config.bytes_per_blob = 64;
    config.forks = config
        .forks
        .iter()
        .map(|f| ForkConfig { epoch: 0, ..f.clone() })
        .collect();
    config
}

/// Builds the registry for `config`.
///
/// # Panics
///
/// Panics if the config is invalid.
pub fn registry(config: &ChainConfig) -> Arc<SchemaRegistry> {
    Arc::new(SchemaRegistry::new(config).unwrap())
}

/// A [`ForkContext`] at epoch 0 of `registry`'s schedule.
pub fn fork_context(registry: &SchemaRegistry) -> ForkContext {
    ForkContext::new(Arc::new(registry.fork_schedule().clone()), 0)
}

/// The all-zero value of `ty`, lists are empty.
pub fn zero_value(ty: &TypeDescriptor) -> Value {
    match ty.kind() {
        Kind::Boolean => Value::Bool(false),
        Kind::Uint(_) => Value::Uint(0),
        Kind::ByteVector(len) => Value::Bytes(vec![0; *len]),
        Kind::ByteList { .. } => Value::Bytes(Vec::new()),
        Kind::Vector { elem, len } => Value::List(vec![zero_value(elem); *len]),
        Kind::List { .. } => Value::List(Vec::new()),
        Kind::Container { fields, .. } => {
            Value::Container(fields.iter().map(|f| zero_value(&f.ty)).collect())
        }
        Kind::Versioned { inner } => Value::Versioned {
            legacy: false,
            value: Box::new(zero_value(inner)),
        },
    }
}

fn field_mut(value: &mut Value, index: usize) -> &mut Value {
    let Value::Container(fields) = value else {
        panic!("not a container");
    };
    &mut fields[index]
}

/// A signed block at `slot` for `fork`, `seed` makes blocks at the same slot differ.
///
/// # Panics
///
/// Panics if `fork` has no block type in `registry`.
pub fn signed_block(registry: &SchemaRegistry, fork: ForkName, slot: u64, seed: u8) -> Value {
    let ty = registry
        .resolve_response_for(MessageType::BlocksByRoot, fork)
        .unwrap();
    let mut block = zero_value(&ty);
    let message = field_mut(&mut block, 0);
    *field_mut(message, 0) = Value::Uint(slot);
    *field_mut(message, 2) = Value::Bytes(vec![seed; 32]);
    block
}

/// A blob sidecar of the block at `slot`, `seed` picks the block.
///
/// # Panics
///
/// Panics if `registry` has no blob sidecar type at Deneb.
pub fn blob_sidecar(registry: &SchemaRegistry, slot: u64, index: u64, seed: u8) -> Value {
    let ty = registry
        .resolve_response_for(MessageType::BlobSidecarsByRoot, ForkName::Deneb)
        .unwrap();
    let mut sidecar = zero_value(&ty);
    *field_mut(&mut sidecar, 0) = Value::Uint(index);
    let header = field_mut(field_mut(&mut sidecar, 4), 0);
    *field_mut(header, 0) = Value::Uint(slot);
    *field_mut(header, 2) = Value::Bytes(vec![seed; 32]);
    sidecar
}

/// The root of a block built with [`signed_block`].
///
/// # Panics
///
/// Panics if `block` is not a block of `fork`.
pub fn block_root(registry: &SchemaRegistry, fork: ForkName, block: &Value) -> [u8; 32] {
    match registry
        .item_key(MessageType::BlocksByRoot, fork, block)
        .unwrap()
    {
        ContentKey::Root(root) => root,
        key => panic!("unexpected key {key:?}"),
    }
}

/// The identifier of a sidecar built with [`blob_sidecar`].
///
/// # Panics
///
/// Panics if `sidecar` is not a blob sidecar.
pub fn blob_id(registry: &SchemaRegistry, sidecar: &Value) -> BlobIdentifier {
    match registry
        .item_key(MessageType::BlobSidecarsByRoot, ForkName::Deneb, sidecar)
        .unwrap()
    {
        ContentKey::Blob(id) => id,
        key => panic!("unexpected key {key:?}"),
    }
}
