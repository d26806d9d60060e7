//! Protocol constants.
//!
//! Values here are facts of the wire protocol, anything that can differ between networks lives in
//! [`ChainConfig`](crate::ChainConfig).

/// The maximum length of an error message in an error response chunk.
pub const MAX_ERROR_MESSAGE_LEN: usize = 256;

/// The maximum amount of bytes of an unsigned LEB128 encoded `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// The length of a fork digest, sent as context bytes before a chunk's payload.
pub const FORK_DIGEST_LEN: usize = 4;

/// The depth of the merkle proof of a blob's commitment in its block body.
pub const KZG_COMMITMENT_INCLUSION_PROOF_DEPTH: usize = 17;

/// The prefix of every request/response protocol identifier.
pub const PROTOCOL_PREFIX: &str = "/eth2/beacon_chain/req";

/// The size of a BLS signature.
pub const SIGNATURE_LEN: usize = 96;

/// The size of a BLS public key.
pub const PUBKEY_LEN: usize = 48;

/// The size of a KZG commitment or proof.
pub const KZG_LEN: usize = 48;

/// The size of an execution address.
pub const EXECUTION_ADDRESS_LEN: usize = 20;
