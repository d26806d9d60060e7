use crate::{DecodeError, Kind, TypeDescriptor, Value, BYTES_PER_OFFSET};

/// Decodes `bytes` as described by `ty`.
///
/// This is strict, every byte must be accounted for, offsets must be in order and in bounds and
/// no list may be longer than its descriptor allows.
///
/// # Errors
///
/// Returns [`DecodeError`] if `bytes` is not the canonical encoding of a value of `ty`.
pub fn decode(bytes: &[u8], ty: &TypeDescriptor) -> Result<Value, DecodeError> {
    match ty.kind() {
        Kind::Boolean => {
            check_exact_len(bytes, 1)?;
            match bytes[0] {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                b => Err(DecodeError::InvalidBoolean(b)),
            }
        }
        Kind::Uint(width) => {
            check_exact_len(bytes, *width)?;
            let mut buf = [0_u8; 8];
            buf[..*width].copy_from_slice(bytes);
            Ok(Value::Uint(u64::from_le_bytes(buf)))
        }
        Kind::ByteVector(len) => {
            check_exact_len(bytes, *len)?;
            Ok(Value::Bytes(bytes.to_vec()))
        }
        Kind::ByteList { max_len } => {
            check_max_len(bytes.len(), *max_len)?;
            Ok(Value::Bytes(bytes.to_vec()))
        }
        Kind::Vector { elem, len } => {
            let items = decode_sequence(bytes, elem, *len)?;
            if items.len() != *len {
                return Err(DecodeError::LengthMismatch {
                    got: items.len(),
                    expected: *len,
                });
            }
            Ok(Value::List(items))
        }
        Kind::List { elem, max_len } => decode_sequence(bytes, elem, *max_len).map(Value::List),
        Kind::Container { fields, .. } => {
            let types = fields.iter().map(|f| &f.ty).collect::<Vec<_>>();
            decode_fields(bytes, &types).map(Value::Container)
        }
        Kind::Versioned { inner } => decode_versioned(bytes, inner),
    }
}

fn decode_versioned(bytes: &[u8], inner: &TypeDescriptor) -> Result<Value, DecodeError> {
    // The discriminant is read first, the inner layout is the same for both variants.
    let Some((&discriminant, rest)) = bytes.split_first() else {
        return Err(DecodeError::Truncated {
            expected: inner.fixed_part_len() + 1,
            got: 0,
        });
    };

    let legacy = match discriminant {
        0 => false,
        1 => true,
        b => return Err(DecodeError::InvalidBoolean(b)),
    };

    let value = if inner.is_fixed_size() {
        decode(rest, inner)?
    } else {
        let offset = read_offset(rest, 0, bytes.len())?;
        let expected = 1 + BYTES_PER_OFFSET;
        if offset != expected {
            return Err(DecodeError::InvalidFirstOffset { offset, expected });
        }
        decode(&bytes[expected..], inner)?
    };

    Ok(Value::Versioned {
        legacy,
        value: Box::new(value),
    })
}

const fn check_exact_len(bytes: &[u8], expected: usize) -> Result<(), DecodeError> {
    if bytes.len() < expected {
        return Err(DecodeError::Truncated {
            expected,
            got: bytes.len(),
        });
    }
    if bytes.len() > expected {
        return Err(DecodeError::TrailingBytes(bytes.len() - expected));
    }
    Ok(())
}

const fn check_max_len(len: usize, max: usize) -> Result<(), DecodeError> {
    if len > max {
        return Err(DecodeError::ListTooLong { len, max });
    }
    Ok(())
}

/// Reads the offset at `pos` in `bytes`, checking it against `len`, the length of the whole
/// input the offset is relative to.
fn read_offset(bytes: &[u8], pos: usize, len: usize) -> Result<usize, DecodeError> {
    let Some(raw) = bytes.get(pos..pos + BYTES_PER_OFFSET) else {
        return Err(DecodeError::Truncated {
            expected: pos + BYTES_PER_OFFSET,
            got: bytes.len(),
        });
    };

    let mut buf = [0_u8; BYTES_PER_OFFSET];
    buf.copy_from_slice(raw);
    let offset = usize::try_from(u32::from_le_bytes(buf)).unwrap_or(usize::MAX);

    if offset > len {
        return Err(DecodeError::OffsetOutOfBounds { offset, len });
    }

    Ok(offset)
}

/// Decodes the elements of a list or vector holding at most `max` elements.
fn decode_sequence(
    bytes: &[u8],
    elem: &TypeDescriptor,
    max: usize,
) -> Result<Vec<Value>, DecodeError> {
    if let Some(elem_size) = elem.fixed_size() {
        if elem_size == 0 || bytes.len() % elem_size != 0 {
            return Err(DecodeError::InvalidElementBytes {
                len: bytes.len(),
                elem_size,
            });
        }
        check_max_len(bytes.len() / elem_size, max)?;

        return bytes
            .chunks_exact(elem_size)
            .map(|chunk| decode(chunk, elem))
            .collect();
    }

    if bytes.is_empty() {
        return Ok(Vec::new());
    }

    // The first offset points directly after the offset table, so it gives the element count.
    let first = read_offset(bytes, 0, bytes.len())?;
    if first == 0 || first % BYTES_PER_OFFSET != 0 {
        return Err(DecodeError::InvalidFirstOffset {
            offset: first,
            expected: BYTES_PER_OFFSET * (first / BYTES_PER_OFFSET).max(1),
        });
    }
    let count = first / BYTES_PER_OFFSET;
    check_max_len(count, max)?;

    let types = vec![elem; count];
    decode_fields(bytes, &types)
}

/// Decodes a fixed part of fields, with offsets standing in for variable fields, followed by the
/// variable part.
fn decode_fields(bytes: &[u8], types: &[&TypeDescriptor]) -> Result<Vec<Value>, DecodeError> {
    let fixed_len: usize = types.iter().map(|ty| ty.fixed_part_len()).sum();
    if bytes.len() < fixed_len {
        return Err(DecodeError::Truncated {
            expected: fixed_len,
            got: bytes.len(),
        });
    }

    // First pass: slice out fixed fields and collect the offsets of variable ones.
    let mut pos = 0;
    let mut fixed = Vec::with_capacity(types.len());
    let mut offsets = Vec::new();
    for ty in types {
        if let Some(size) = ty.fixed_size() {
            fixed.push(Some(&bytes[pos..pos + size]));
            pos += size;
        } else {
            let offset = read_offset(bytes, pos, bytes.len())?;

            match offsets.last() {
                None if offset != fixed_len => {
                    return Err(DecodeError::InvalidFirstOffset {
                        offset,
                        expected: fixed_len,
                    });
                }
                Some(&previous) if offset < previous => {
                    return Err(DecodeError::OffsetsDecreasing { offset, previous });
                }
                _ => (),
            }

            offsets.push(offset);
            fixed.push(None);
            pos += BYTES_PER_OFFSET;
        }
    }

    if offsets.is_empty() && bytes.len() > fixed_len {
        return Err(DecodeError::TrailingBytes(bytes.len() - fixed_len));
    }

    // Second pass: decode every field, variable ones span up to the next offset.
    let mut values = Vec::with_capacity(types.len());
    let mut next_offset = 0;
    for (ty, fixed_bytes) in types.iter().zip(fixed) {
        let field_bytes = if let Some(field_bytes) = fixed_bytes {
            field_bytes
        } else {
            let start = offsets[next_offset];
            let end = offsets.get(next_offset + 1).copied().unwrap_or(bytes.len());
            next_offset += 1;
            &bytes[start..end]
        };

        values.push(decode(field_bytes, ty)?);
    }

    Ok(values)
}
