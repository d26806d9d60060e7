//! Typed requests and response items.
//!
//! The codec works on untyped [`Value`]s, the types here are what callers build requests from and
//! what the engine uses to check responses against requests.
use beacon_ssz::Value;

use crate::{
    constants::{EXECUTION_ADDRESS_LEN, PUBKEY_LEN, SIGNATURE_LEN},
    ChainConfig, ForkName, MessageType, Root, WireError,
};

/// Identifies a single blob sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobIdentifier {
    pub block_root: Root,
    pub index: u64,
}

impl BlobIdentifier {
    pub fn to_value(&self) -> Value {
        Value::Container(vec![
            Value::Bytes(self.block_root.to_vec()),
            Value::Uint(self.index),
        ])
    }

    pub fn from_value(value: &Value) -> Result<Self, WireError> {
        Ok(Self {
            block_root: bytes_field(value, 0)?,
            index: uint_field(value, 1)?,
        })
    }
}

/// A span of slots.
///
/// Blob sidecar ranges have no step on the wire, theirs is always 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RangeRequest {
    pub start_slot: u64,
    pub count: u64,
    pub step: u64,
}

impl RangeRequest {
    /// A span of `count` consecutive slots.
    pub const fn new(start_slot: u64, count: u64) -> Self {
        Self {
            start_slot,
            count,
            step: 1,
        }
    }

    /// The slot after the last slot of this span.
    pub const fn end_slot(&self) -> u64 {
        self.start_slot
            .saturating_add(self.count.saturating_mul(self.step))
    }

    /// Returns `true` if `slot` is one of the slots in this span.
    pub const fn contains(&self, slot: u64) -> bool {
        slot >= self.start_slot
            && slot < self.end_slot()
            && self.step != 0
            && (slot - self.start_slot) % self.step == 0
    }
}

/// A withdrawal credential change of a validator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignedBlsToExecutionChange {
    pub validator_index: u64,
    pub from_bls_pubkey: [u8; PUBKEY_LEN],
    pub to_execution_address: [u8; EXECUTION_ADDRESS_LEN],
    pub signature: [u8; SIGNATURE_LEN],
}

impl SignedBlsToExecutionChange {
    pub fn to_value(&self) -> Value {
        Value::Container(vec![
            Value::Container(vec![
                Value::Uint(self.validator_index),
                Value::Bytes(self.from_bls_pubkey.to_vec()),
                Value::Bytes(self.to_execution_address.to_vec()),
            ]),
            Value::Bytes(self.signature.to_vec()),
        ])
    }

    pub fn from_value(value: &Value) -> Result<Self, WireError> {
        let message = value
            .field(0)
            .ok_or(WireError::UnexpectedShape("SignedBLSToExecutionChange"))?;
        Ok(Self {
            validator_index: uint_field(message, 0)?,
            from_bls_pubkey: bytes_field(message, 1)?,
            to_execution_address: bytes_field(message, 2)?,
            signature: bytes_field(value, 1)?,
        })
    }
}

/// A validator change together with the layout it was signed under.
///
/// On the wire this is a container with a leading boolean, `true` for changes signed before
/// Capella. The boolean does not change the layout of the rest of the container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionedValidatorChange {
    PreCapella(SignedBlsToExecutionChange),
    Current(SignedBlsToExecutionChange),
}

impl VersionedValidatorChange {
    /// Returns the change, regardless of version.
    pub const fn change(&self) -> &SignedBlsToExecutionChange {
        match self {
            Self::PreCapella(c) | Self::Current(c) => c,
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Versioned {
            legacy: matches!(self, Self::PreCapella(_)),
            value: Box::new(self.change().to_value()),
        }
    }

    pub fn from_value(value: &Value) -> Result<Self, WireError> {
        let Value::Versioned { legacy, value } = value else {
            return Err(WireError::UnexpectedShape("versioned validator change"));
        };
        let change = SignedBlsToExecutionChange::from_value(value)?;
        Ok(if *legacy {
            Self::PreCapella(change)
        } else {
            Self::Current(change)
        })
    }
}

/// The body of an outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    BlocksByRange(RangeRequest),
    BlocksByRoot(Vec<Root>),
    BlobSidecarsByRange(RangeRequest),
    BlobSidecarsByRoot(Vec<BlobIdentifier>),
    ValidatorChangeBroadcast(Vec<VersionedValidatorChange>),
}

impl RequestBody {
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::BlocksByRange(_) => MessageType::BlocksByRange,
            Self::BlocksByRoot(_) => MessageType::BlocksByRoot,
            Self::BlobSidecarsByRange(_) => MessageType::BlobSidecarsByRange,
            Self::BlobSidecarsByRoot(_) => MessageType::BlobSidecarsByRoot,
            Self::ValidatorChangeBroadcast(_) => MessageType::ValidatorChangeBroadcast,
        }
    }

    /// The amount of items this request names, which is also its quota cost.
    pub fn item_count(&self) -> u64 {
        let len = |l: usize| u64::try_from(l).unwrap_or(u64::MAX);
        match self {
            Self::BlocksByRange(r) | Self::BlobSidecarsByRange(r) => r.count,
            Self::BlocksByRoot(roots) => len(roots.len()),
            Self::BlobSidecarsByRoot(ids) => len(ids.len()),
            Self::ValidatorChangeBroadcast(changes) => len(changes.len()),
        }
    }

    /// The most response items a peer may send for this request.
    pub fn max_response_items(&self, config: &ChainConfig) -> u64 {
        match self {
            Self::BlobSidecarsByRange(r) => r.count.saturating_mul(config.max_blobs_per_block),
            Self::ValidatorChangeBroadcast(_) => 0,
            _ => self.item_count(),
        }
    }

    /// The configured maximum of [`Self::item_count`] for this request's type.
    pub const fn max_item_count(message_type: MessageType, config: &ChainConfig) -> u64 {
        match message_type {
            MessageType::BlocksByRange | MessageType::BlocksByRoot => config.max_request_blocks,
            MessageType::BlobSidecarsByRange => config
                .max_request_blob_sidecars
                .saturating_div(if config.max_blobs_per_block == 0 {
                    1
                } else {
                    config.max_blobs_per_block
                }),
            MessageType::BlobSidecarsByRoot => config.max_request_blob_sidecars,
            MessageType::ValidatorChangeBroadcast => config.max_request_validator_changes,
        }
    }

    /// Checks this request is well formed and within the configured bounds.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::InvalidRequest`] or [`WireError::TooManyItems`].
    pub fn validate(&self, config: &ChainConfig) -> Result<(), WireError> {
        match self {
            Self::BlocksByRange(r) | Self::BlobSidecarsByRange(r) if r.step == 0 => {
                return Err(WireError::InvalidRequest("step must be at least 1"))
            }
            Self::BlobSidecarsByRange(r) if r.step != 1 => {
                return Err(WireError::InvalidRequest("blob sidecar ranges have no step"))
            }
            _ => (),
        }

        let count = self.item_count();
        if count == 0 {
            return Err(WireError::InvalidRequest("request names no items"));
        }

        let max = Self::max_item_count(self.message_type(), config);
        if count > max {
            return Err(WireError::TooManyItems { count, max });
        }

        Ok(())
    }

    /// The keys a response must consist of, `None` for range requests.
    pub fn requested_keys(&self) -> Option<Vec<ContentKey>> {
        match self {
            Self::BlocksByRoot(roots) => Some(roots.iter().copied().map(ContentKey::Root).collect()),
            Self::BlobSidecarsByRoot(ids) => Some(ids.iter().copied().map(ContentKey::Blob).collect()),
            _ => None,
        }
    }

    /// The requested span, for range requests.
    pub const fn range(&self) -> Option<&RangeRequest> {
        match self {
            Self::BlocksByRange(r) | Self::BlobSidecarsByRange(r) => Some(r),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::BlocksByRange(r) => Value::Container(vec![
                Value::Uint(r.start_slot),
                Value::Uint(r.count),
                Value::Uint(r.step),
            ]),
            Self::BlobSidecarsByRange(r) => {
                Value::Container(vec![Value::Uint(r.start_slot), Value::Uint(r.count)])
            }
            Self::BlocksByRoot(roots) => Value::List(
                roots
                    .iter()
                    .map(|r| Value::Bytes(r.to_vec()))
                    .collect(),
            ),
            Self::BlobSidecarsByRoot(ids) => {
                Value::List(ids.iter().map(BlobIdentifier::to_value).collect())
            }
            Self::ValidatorChangeBroadcast(changes) => Value::List(
                changes
                    .iter()
                    .map(VersionedValidatorChange::to_value)
                    .collect(),
            ),
        }
    }

    /// Builds a request of `message_type` from a decoded value.
    pub fn from_value(message_type: MessageType, value: &Value) -> Result<Self, WireError> {
        let list = || {
            value
                .as_list()
                .ok_or(WireError::UnexpectedShape("request list"))
        };

        Ok(match message_type {
            MessageType::BlocksByRange => Self::BlocksByRange(RangeRequest {
                start_slot: uint_field(value, 0)?,
                count: uint_field(value, 1)?,
                step: uint_field(value, 2)?,
            }),
            MessageType::BlobSidecarsByRange => Self::BlobSidecarsByRange(RangeRequest::new(
                uint_field(value, 0)?,
                uint_field(value, 1)?,
            )),
            MessageType::BlocksByRoot => Self::BlocksByRoot(
                list()?
                    .iter()
                    .map(|v| v.to_array().ok_or(WireError::UnexpectedShape("root")))
                    .collect::<Result<_, _>>()?,
            ),
            MessageType::BlobSidecarsByRoot => Self::BlobSidecarsByRoot(
                list()?
                    .iter()
                    .map(BlobIdentifier::from_value)
                    .collect::<Result<_, _>>()?,
            ),
            MessageType::ValidatorChangeBroadcast => Self::ValidatorChangeBroadcast(
                list()?
                    .iter()
                    .map(VersionedValidatorChange::from_value)
                    .collect::<Result<_, _>>()?,
            ),
        })
    }
}

/// The identity of a response item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContentKey {
    /// A block, by the root of its message.
    Root(Root),
    /// A blob sidecar, by its block root and index.
    Blob(BlobIdentifier),
    /// A block, by slot.
    Slot(u64),
    /// A blob sidecar, by slot and index.
    SlotIndex { slot: u64, index: u64 },
}

impl ContentKey {
    /// The slot of this key, for keys of range responses.
    pub const fn slot(&self) -> Option<u64> {
        match self {
            Self::Slot(slot) | Self::SlotIndex { slot, .. } => Some(*slot),
            Self::Root(_) | Self::Blob(_) => None,
        }
    }
}

/// A decoded response chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseItem {
    /// The fork the payload was encoded under.
    pub fork: ForkName,
    /// The payload.
    pub value: Value,
    /// The identity of the payload.
    pub key: ContentKey,
}

pub(crate) fn uint_field(value: &Value, index: usize) -> Result<u64, WireError> {
    value
        .field(index)
        .and_then(Value::as_uint)
        .ok_or(WireError::UnexpectedShape("uint field"))
}

pub(crate) fn bytes_field<const N: usize>(value: &Value, index: usize) -> Result<[u8; N], WireError> {
    value
        .field(index)
        .and_then(Value::to_array)
        .ok_or(WireError::UnexpectedShape("byte vector field"))
}
