//! Merkleization.
//!
//! [`hash_tree_root`] computes the SHA-256 binary merkle root of a value, padding every tree to
//! the limit declared by its descriptor and mixing in the length of lists.
use sha2::{Digest, Sha256};

use crate::{
    encode::{check_list_len, encode_into},
    EncodeError, Kind, TypeDescriptor, Value, BYTES_PER_CHUNK,
};

/// A 32 byte merkle root.
pub type Root = [u8; 32];

/// Computes the merkle root of `value` as described by `ty`.
///
/// # Errors
///
/// Returns [`EncodeError`] if the value does not match the descriptor or breaks a bound.
pub fn hash_tree_root(value: &Value, ty: &TypeDescriptor) -> Result<Root, EncodeError> {
    match (ty.kind(), value) {
        (Kind::Boolean | Kind::Uint(_), _) => {
            let mut bytes = Vec::with_capacity(BYTES_PER_CHUNK);
            encode_into(value, ty, &mut bytes)?;
            Ok(merkleize(pack(&bytes), None))
        }
        (Kind::ByteVector(len), Value::Bytes(bytes)) => {
            if bytes.len() != *len {
                return Err(EncodeError::LengthMismatch {
                    got: bytes.len(),
                    expected: *len,
                });
            }
            Ok(merkleize(pack(bytes), Some(chunk_count(*len))))
        }
        (Kind::ByteList { max_len }, Value::Bytes(bytes)) => {
            check_list_len(bytes.len(), *max_len)?;
            let root = merkleize(pack(bytes), Some(chunk_count(*max_len)));
            Ok(mix_in_length(&root, bytes.len()))
        }
        (Kind::Vector { elem, len }, Value::List(items)) => {
            if items.len() != *len {
                return Err(EncodeError::LengthMismatch {
                    got: items.len(),
                    expected: *len,
                });
            }
            sequence_root(items, elem, *len)
        }
        (Kind::List { elem, max_len }, Value::List(items)) => {
            check_list_len(items.len(), *max_len)?;
            let root = sequence_root(items, elem, *max_len)?;
            Ok(mix_in_length(&root, items.len()))
        }
        (Kind::Container { name, fields }, Value::Container(values)) => {
            if values.len() != fields.len() {
                return Err(EncodeError::FieldCountMismatch {
                    name: name.clone(),
                    got: values.len(),
                    expected: fields.len(),
                });
            }
            let roots = fields
                .iter()
                .zip(values)
                .map(|(field, value)| hash_tree_root(value, &field.ty))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(merkleize(roots, None))
        }
        (Kind::Versioned { inner }, Value::Versioned { legacy, value }) => {
            let discriminant = merkleize(pack(&[u8::from(*legacy)]), None);
            Ok(merkleize(
                vec![discriminant, hash_tree_root(value, inner)?],
                None,
            ))
        }
        _ => Err(EncodeError::ShapeMismatch {
            expected: ty.kind_name(),
        }),
    }
}

fn sequence_root(
    items: &[Value],
    elem: &TypeDescriptor,
    limit: usize,
) -> Result<Root, EncodeError> {
    if let Kind::Boolean | Kind::Uint(_) = elem.kind() {
        let mut bytes = Vec::new();
        for item in items {
            encode_into(item, elem, &mut bytes)?;
        }
        let size = elem.fixed_part_len();
        return Ok(merkleize(
            pack(&bytes),
            Some(chunk_count(limit.saturating_mul(size))),
        ));
    }

    let roots = items
        .iter()
        .map(|item| hash_tree_root(item, elem))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(merkleize(roots, Some(limit)))
}

const fn chunk_count(bytes: usize) -> usize {
    bytes.div_ceil(BYTES_PER_CHUNK)
}

fn pack(bytes: &[u8]) -> Vec<Root> {
    bytes
        .chunks(BYTES_PER_CHUNK)
        .map(|chunk| {
            let mut root = [0; 32];
            root[..chunk.len()].copy_from_slice(chunk);
            root
        })
        .collect()
}

fn hash_pair(left: &Root, right: &Root) -> Root {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

fn zero_hash(depth: u32) -> Root {
    let mut hash = [0; 32];
    for _ in 0..depth {
        hash = hash_pair(&hash, &hash);
    }
    hash
}

/// Merkleizes `chunks`, padding with zero chunks up to `limit` rounded to a power of two.
fn merkleize(mut chunks: Vec<Root>, limit: Option<usize>) -> Root {
    let width = limit
        .unwrap_or(chunks.len())
        .max(chunks.len())
        .max(1)
        .next_power_of_two();
    let depth = width.trailing_zeros();

    if chunks.is_empty() {
        return zero_hash(depth);
    }

    for level in 0..depth {
        if chunks.len() % 2 == 1 {
            chunks.push(zero_hash(level));
        }
        chunks = chunks
            .chunks_exact(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }

    chunks[0]
}

fn mix_in_length(root: &Root, len: usize) -> Root {
    let mut len_chunk = [0; 32];
    len_chunk[..8].copy_from_slice(&(len as u64).to_le_bytes());
    hash_pair(root, &len_chunk)
}
