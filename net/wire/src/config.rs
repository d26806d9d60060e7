//! Chain Config.
//!
//! [`ChainConfig`] holds every bound that differs between networks, the [`SchemaRegistry`](crate::SchemaRegistry)
//! builds its descriptors from it.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    message::{MessageType, PolicyOverride},
    ConfigError, ForkName,
};

/// The activation of a single fork.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ForkConfig {
    /// The fork.
    pub name: ForkName,
    /// The fork version, big-endian, e.g. `0x04000000`.
    pub version: u32,
    /// The epoch the fork activates at.
    pub epoch: u64,
}

/// The per-network configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct ChainConfig {
    /// The name of this configuration.
    pub preset: String,
    /// The amount of slots in an epoch.
    pub slots_per_epoch: u64,
    /// The maximum amount of blocks in a single request.
    pub max_request_blocks: u64,
    /// The maximum amount of blob sidecars in a single request.
    pub max_request_blob_sidecars: u64,
    /// The maximum amount of validator changes in a single broadcast.
    pub max_request_validator_changes: u64,
    /// The maximum amount of blobs in a block.
    pub max_blobs_per_block: u64,
    /// The maximum size of a single uncompressed chunk.
    pub max_chunk_size: u64,
    /// The size of a blob.
    pub bytes_per_blob: u64,
    /// The maximum amount of blob commitments in a block body.
    pub max_blob_commitments_per_block: u64,
    /// The maximum amount of BLS to execution changes in a block body.
    pub max_bls_to_execution_changes: u64,
    /// The maximum amount of transactions in a block body.
    pub max_transactions_per_payload: u64,
    /// The maximum size of a single transaction.
    pub max_bytes_per_transaction: u64,
    /// The genesis validators root, mixed into every fork digest.
    #[serde(with = "hex_root")]
    pub genesis_validators_root: [u8; 32],
    /// The fork schedule, in order of activation.
    pub forks: Vec<ForkConfig>,
    /// Per message type overrides of the default [`MessagePolicy`](crate::MessagePolicy).
    pub policy_overrides: BTreeMap<MessageType, PolicyOverride>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self::mainnet()
    }
}

impl ChainConfig {
    /// The mainnet configuration.
    pub fn mainnet() -> Self {
        Self {
            preset: "mainnet".to_string(),
            slots_per_epoch: 32,
            max_request_blocks: 1024,
            max_request_blob_sidecars: 768,
            max_request_validator_changes: 128,
            max_blobs_per_block: 6,
            max_chunk_size: 10 * 1024 * 1024,
            bytes_per_blob: 131_072,
            max_blob_commitments_per_block: 4096,
            max_bls_to_execution_changes: 16,
            max_transactions_per_payload: 1_048_576,
            max_bytes_per_transaction: 1_073_741_824,
            genesis_validators_root: [
                0x4b, 0x36, 0x3d, 0xb9, 0x4e, 0x28, 0x61, 0x20, 0xd7, 0x6e, 0xb9, 0x05, 0x34, 0x0f,
                0xdd, 0x4e, 0x54, 0xbf, 0xe9, 0xf0, 0x6b, 0xf3, 0x3f, 0xf6, 0xcf, 0x5a, 0xd2, 0x7f,
                0x51, 0x1b, 0xfe, 0x95,
            ],
            forks: vec![
                fork(ForkName::Phase0, 0x0000_0000, 0),
                fork(ForkName::Altair, 0x0100_0000, 74_240),
                fork(ForkName::Bellatrix, 0x0200_0000, 144_896),
                fork(ForkName::Capella, 0x0300_0000, 194_048),
                fork(ForkName::Deneb, 0x0400_0000, 269_568),
            ],
            policy_overrides: BTreeMap::new(),
        }
    }

    /// The minimal configuration, with small bounds and forks one epoch apart.
    pub fn minimal() -> Self {
        Self {
            preset: "minimal".to_string(),
            slots_per_epoch: 8,
            max_request_blocks: 1024,
            max_request_blob_sidecars: 768,
            max_request_validator_changes: 128,
            max_blobs_per_block: 6,
            max_chunk_size: 10 * 1024 * 1024,
            bytes_per_blob: 131_072,
            max_blob_commitments_per_block: 32,
            max_bls_to_execution_changes: 16,
            max_transactions_per_payload: 1_048_576,
            max_bytes_per_transaction: 1_073_741_824,
            genesis_validators_root: [0; 32],
            forks: vec![
                fork(ForkName::Phase0, 0x0000_0001, 0),
                fork(ForkName::Altair, 0x0100_0001, 1),
                fork(ForkName::Bellatrix, 0x0200_0001, 2),
                fork(ForkName::Capella, 0x0300_0001, 3),
                fork(ForkName::Deneb, 0x0400_0001, 4),
            ],
            policy_overrides: BTreeMap::new(),
        }
    }

    /// Parses a [`ChainConfig`] from TOML, missing fields take their mainnet value.
    ///
    /// # Errors
    ///
    /// Returns an error if `s` is not valid TOML or holds unknown fields.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }
}

const fn fork(name: ForkName, version: u32, epoch: u64) -> ForkConfig {
    ForkConfig {
        name,
        version,
        epoch,
    }
}

/// (De)serializes a 32 byte root as a `0x` prefixed hex string.
mod hex_root {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(root: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("0x{}", hex::encode(root)))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let mut root = [0; 32];
        hex::decode_to_slice(s.trim_start_matches("0x"), &mut root).map_err(D::Error::custom)?;
        Ok(root)
    }
}
