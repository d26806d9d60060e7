//! Schema Registry.
//!
//! The [`SchemaRegistry`] builds every [`TypeDescriptor`] once from a [`ChainConfig`] and resolves
//! a message type and fork into the descriptor of its request or response payload.
use std::collections::HashMap;

use beacon_ssz::{hash_tree_root, ContainerBuilder, TypeDescriptor, Value};

use crate::{
    constants::{
        EXECUTION_ADDRESS_LEN, KZG_COMMITMENT_INCLUSION_PROOF_DEPTH, KZG_LEN, PUBKEY_LEN,
        SIGNATURE_LEN,
    },
    types::uint_field,
    u64_to_usize, BlobIdentifier, ChainConfig, ConfigError, ContentKey, ForkDigest, ForkName,
    ForkSchedule, MessagePolicy, MessageType, WireError,
};

/// The descriptors of a single message type.
#[derive(Debug, Clone)]
struct Schema {
    request: TypeDescriptor,
    /// Response variants, sorted by the fork they activate at.
    responses: Vec<(ForkName, TypeDescriptor)>,
    policy: MessagePolicy,
}

/// Resolves message types and forks into [`TypeDescriptor`]s.
///
/// Two registries built from equal configs hold equal descriptors.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    config: ChainConfig,
    forks: ForkSchedule,
    schemas: HashMap<MessageType, Schema>,
    /// Block message variants, used to compute block roots.
    block_messages: Vec<(ForkName, TypeDescriptor)>,
    /// The block header embedded in blob sidecars.
    block_header: TypeDescriptor,
    change_message: TypeDescriptor,
}

impl SchemaRegistry {
    /// Builds the registry for `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the fork schedule is invalid.
    pub fn new(config: &ChainConfig) -> Result<Self, ConfigError> {
        let forks = ForkSchedule::new(config)?;
        let d = Descriptors::new(config);

        let block_messages = [
            ForkName::Phase0,
            ForkName::Capella,
            ForkName::Deneb,
        ]
        .into_iter()
        .map(|fork| (fork, d.block_message(fork)))
        .collect::<Vec<_>>();

        let signed_blocks = block_messages
            .iter()
            .map(|(fork, message)| (*fork, signed(message.clone(), "SignedBeaconBlock")))
            .collect::<Vec<_>>();

        let blob_sidecar = vec![(ForkName::Deneb, d.blob_sidecar())];

        let block_range = ContainerBuilder::new("BeaconBlocksByRangeRequest")
            .field("start_slot", TypeDescriptor::uint64())
            .field("count", TypeDescriptor::uint64())
            .field("step", TypeDescriptor::uint64())
            .build();
        let blob_range = ContainerBuilder::new("BlobSidecarsByRangeRequest")
            .field("start_slot", TypeDescriptor::uint64())
            .field("count", TypeDescriptor::uint64())
            .build();

        let versioned_change = TypeDescriptor::versioned(d.signed_bls_change.clone());

        let mut schemas = HashMap::new();
        let mut register = |mt: MessageType, request, responses| {
            let mut policy = MessagePolicy::default_for(mt);
            if let Some(o) = config.policy_overrides.get(&mt) {
                policy = policy.with_override(o);
            }
            schemas.insert(
                mt,
                Schema {
                    request,
                    responses,
                    policy,
                },
            );
        };

        register(MessageType::BlocksByRange, block_range, signed_blocks.clone());
        register(
            MessageType::BlocksByRoot,
            TypeDescriptor::list(
                TypeDescriptor::byte_vector(32),
                u64_to_usize(config.max_request_blocks),
            ),
            signed_blocks,
        );
        register(MessageType::BlobSidecarsByRange, blob_range, blob_sidecar.clone());
        register(
            MessageType::BlobSidecarsByRoot,
            TypeDescriptor::list(
                blob_identifier(),
                u64_to_usize(config.max_request_blob_sidecars),
            ),
            blob_sidecar,
        );
        register(
            MessageType::ValidatorChangeBroadcast,
            TypeDescriptor::list(
                versioned_change.clone(),
                u64_to_usize(config.max_request_validator_changes),
            ),
            vec![(ForkName::Phase0, versioned_change)],
        );

        Ok(Self {
            config: config.clone(),
            forks,
            schemas,
            block_messages,
            block_header: d.block_header,
            change_message: bls_change_message(),
        })
    }

    fn schema(&self, message_type: MessageType) -> &Schema {
        // Every message type is registered in `new`.
        &self.schemas[&message_type]
    }

    fn fork_for(&self, digest: &ForkDigest) -> Result<ForkName, WireError> {
        self.forks
            .fork_by_digest(digest)
            .map(|f| f.name)
            .ok_or(WireError::UnknownForkDigest(*digest))
    }

    fn check_available(&self, message_type: MessageType, fork: ForkName) -> Result<(), WireError> {
        if fork < self.schema(message_type).policy.available_from {
            return Err(WireError::UnsupportedFork { message_type, fork });
        }
        Ok(())
    }

    /// Resolves the request descriptor of `message_type` at the fork with `digest`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::UnknownForkDigest`] or [`WireError::UnsupportedFork`].
    pub fn resolve_request(
        &self,
        message_type: MessageType,
        digest: &ForkDigest,
    ) -> Result<TypeDescriptor, WireError> {
        self.resolve_request_for(message_type, self.fork_for(digest)?)
    }

    /// Resolves the request descriptor of `message_type` at `fork`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::UnsupportedFork`] if the type does not exist at `fork`.
    pub fn resolve_request_for(
        &self,
        message_type: MessageType,
        fork: ForkName,
    ) -> Result<TypeDescriptor, WireError> {
        self.check_available(message_type, fork)?;
        Ok(self.schema(message_type).request.clone())
    }

    /// Resolves the response descriptor of `message_type` at the fork with `digest`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::UnknownForkDigest`] or [`WireError::UnsupportedFork`].
    pub fn resolve_response(
        &self,
        message_type: MessageType,
        digest: &ForkDigest,
    ) -> Result<TypeDescriptor, WireError> {
        self.resolve_response_for(message_type, self.fork_for(digest)?)
    }

    /// Resolves the response descriptor of `message_type` at `fork`, the latest variant
    /// registered at or before `fork`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::UnsupportedFork`] if the type does not exist at `fork`.
    pub fn resolve_response_for(
        &self,
        message_type: MessageType,
        fork: ForkName,
    ) -> Result<TypeDescriptor, WireError> {
        self.check_available(message_type, fork)?;
        self.schema(message_type)
            .responses
            .iter()
            .rev()
            .find(|(from, _)| *from <= fork)
            .map(|(_, ty)| ty.clone())
            .ok_or(WireError::UnsupportedFork { message_type, fork })
    }

    /// Returns the [`MessagePolicy`] of `message_type`, with config overrides applied.
    pub fn policy(&self, message_type: MessageType) -> &MessagePolicy {
        &self.schema(message_type).policy
    }

    pub const fn fork_schedule(&self) -> &ForkSchedule {
        &self.forks
    }

    pub const fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Computes the [`ContentKey`] of a decoded response payload of `message_type`.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` does not have the shape of the type's response at `fork`.
    pub fn item_key(
        &self,
        message_type: MessageType,
        fork: ForkName,
        value: &Value,
    ) -> Result<ContentKey, WireError> {
        match message_type {
            MessageType::BlocksByRoot => {
                let message = value
                    .field(0)
                    .ok_or(WireError::UnexpectedShape("signed block"))?;
                let ty = self
                    .block_messages
                    .iter()
                    .rev()
                    .find(|(from, _)| *from <= fork)
                    .map(|(_, ty)| ty)
                    .ok_or(WireError::UnsupportedFork { message_type, fork })?;
                Ok(ContentKey::Root(hash_tree_root(message, ty)?))
            }
            MessageType::BlocksByRange => {
                let message = value
                    .field(0)
                    .ok_or(WireError::UnexpectedShape("signed block"))?;
                Ok(ContentKey::Slot(uint_field(message, 0)?))
            }
            MessageType::BlobSidecarsByRoot => {
                let header = blob_header(value)?;
                Ok(ContentKey::Blob(BlobIdentifier {
                    block_root: hash_tree_root(header, &self.block_header)?,
                    index: uint_field(value, 0)?,
                }))
            }
            MessageType::BlobSidecarsByRange => Ok(ContentKey::SlotIndex {
                slot: uint_field(blob_header(value)?, 0)?,
                index: uint_field(value, 0)?,
            }),
            MessageType::ValidatorChangeBroadcast => {
                let Value::Versioned { value, .. } = value else {
                    return Err(WireError::UnexpectedShape("versioned validator change"));
                };
                let message = value
                    .field(0)
                    .ok_or(WireError::UnexpectedShape("validator change"))?;
                Ok(ContentKey::Root(hash_tree_root(message, &self.change_message)?))
            }
        }
    }
}

/// The block header message inside a blob sidecar's signed header.
fn blob_header(sidecar: &Value) -> Result<&Value, WireError> {
    sidecar
        .field(4)
        .and_then(|signed| signed.field(0))
        .ok_or(WireError::UnexpectedShape("blob sidecar"))
}

fn signed(message: TypeDescriptor, name: &str) -> TypeDescriptor {
    ContainerBuilder::new(name)
        .field("message", message)
        .field("signature", TypeDescriptor::byte_vector(SIGNATURE_LEN))
        .build()
}

fn blob_identifier() -> TypeDescriptor {
    ContainerBuilder::new("BlobIdentifier")
        .field("block_root", TypeDescriptor::byte_vector(32))
        .field("index", TypeDescriptor::uint64())
        .build()
}

fn bls_change_message() -> TypeDescriptor {
    ContainerBuilder::new("BLSToExecutionChange")
        .field("validator_index", TypeDescriptor::uint64())
        .field("from_bls_pubkey", TypeDescriptor::byte_vector(PUBKEY_LEN))
        .field(
            "to_execution_address",
            TypeDescriptor::byte_vector(EXECUTION_ADDRESS_LEN),
        )
        .build()
}

/// Config dependent building blocks of the registered types.
struct Descriptors {
    config_bounds: Bounds,
    signed_bls_change: TypeDescriptor,
    block_header: TypeDescriptor,
}

struct Bounds {
    max_transactions: usize,
    max_transaction_bytes: usize,
    max_bls_changes: usize,
    max_commitments: usize,
    bytes_per_blob: usize,
}

impl Descriptors {
    fn new(config: &ChainConfig) -> Self {
        let block_header = ContainerBuilder::new("BeaconBlockHeader")
            .field("slot", TypeDescriptor::uint64())
            .field("proposer_index", TypeDescriptor::uint64())
            .field("parent_root", TypeDescriptor::byte_vector(32))
            .field("state_root", TypeDescriptor::byte_vector(32))
            .field("body_root", TypeDescriptor::byte_vector(32))
            .build();

        Self {
            config_bounds: Bounds {
                max_transactions: u64_to_usize(config.max_transactions_per_payload),
                max_transaction_bytes: u64_to_usize(config.max_bytes_per_transaction),
                max_bls_changes: u64_to_usize(config.max_bls_to_execution_changes),
                max_commitments: u64_to_usize(config.max_blob_commitments_per_block),
                bytes_per_blob: u64_to_usize(config.bytes_per_blob),
            },
            signed_bls_change: signed(bls_change_message(), "SignedBLSToExecutionChange"),
            block_header,
        }
    }

    /// The block body gains BLS changes at Capella and blob commitments at Deneb.
    fn block_body(&self, fork: ForkName) -> TypeDescriptor {
        let b = &self.config_bounds;
        let mut body = ContainerBuilder::new(format!("BeaconBlockBody{fork:?}"))
            .field("graffiti", TypeDescriptor::byte_vector(32))
            .field(
                "transactions",
                TypeDescriptor::list(
                    TypeDescriptor::byte_list(b.max_transaction_bytes),
                    b.max_transactions,
                ),
            );
        if fork >= ForkName::Capella {
            body = body.field(
                "bls_to_execution_changes",
                TypeDescriptor::list(self.signed_bls_change.clone(), b.max_bls_changes),
            );
        }
        if fork >= ForkName::Deneb {
            body = body.field(
                "blob_kzg_commitments",
                TypeDescriptor::list(TypeDescriptor::byte_vector(KZG_LEN), b.max_commitments),
            );
        }
        body.build()
    }

    fn block_message(&self, fork: ForkName) -> TypeDescriptor {
        ContainerBuilder::new(format!("BeaconBlock{fork:?}"))
            .field("slot", TypeDescriptor::uint64())
            .field("proposer_index", TypeDescriptor::uint64())
            .field("parent_root", TypeDescriptor::byte_vector(32))
            .field("state_root", TypeDescriptor::byte_vector(32))
            .field("body", self.block_body(fork))
            .build()
    }

    fn blob_sidecar(&self) -> TypeDescriptor {
        ContainerBuilder::new("BlobSidecar")
            .field("index", TypeDescriptor::uint64())
            .field(
                "blob",
                TypeDescriptor::byte_vector(self.config_bounds.bytes_per_blob),
            )
            .field("kzg_commitment", TypeDescriptor::byte_vector(KZG_LEN))
            .field("kzg_proof", TypeDescriptor::byte_vector(KZG_LEN))
            .field(
                "signed_block_header",
                signed(self.block_header.clone(), "SignedBeaconBlockHeader"),
            )
            .field(
                "kzg_commitment_inclusion_proof",
                TypeDescriptor::vector(
                    TypeDescriptor::byte_vector(32),
                    KZG_COMMITMENT_INCLUSION_PROOF_DEPTH,
                ),
            )
            .build()
    }
}
