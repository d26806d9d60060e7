use crate::{EncodeError, Kind, TypeDescriptor, Value, BYTES_PER_OFFSET};

/// Encodes `value` as described by `ty`.
///
/// # Errors
///
/// Returns [`EncodeError`] if the value does not match the descriptor or any list is longer than its
/// declared maximum.
pub fn encode(value: &Value, ty: &TypeDescriptor) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::with_capacity(ty.min_size());
    encode_into(value, ty, &mut out)?;
    Ok(out)
}

pub(crate) fn encode_into(
    value: &Value,
    ty: &TypeDescriptor,
    out: &mut Vec<u8>,
) -> Result<(), EncodeError> {
    match (ty.kind(), value) {
        (Kind::Boolean, Value::Bool(b)) => out.push(u8::from(*b)),
        (Kind::Uint(width), Value::Uint(v)) => {
            if *width < 8 && v >> (width * 8) != 0 {
                return Err(EncodeError::UintOverflow {
                    value: *v,
                    width: *width,
                });
            }
            out.extend_from_slice(&v.to_le_bytes()[..*width]);
        }
        (Kind::ByteVector(len), Value::Bytes(bytes)) => {
            if bytes.len() != *len {
                return Err(EncodeError::LengthMismatch {
                    got: bytes.len(),
                    expected: *len,
                });
            }
            out.extend_from_slice(bytes);
        }
        (Kind::ByteList { max_len }, Value::Bytes(bytes)) => {
            check_list_len(bytes.len(), *max_len)?;
            out.extend_from_slice(bytes);
        }
        (Kind::Vector { elem, len }, Value::List(items)) => {
            if items.len() != *len {
                return Err(EncodeError::LengthMismatch {
                    got: items.len(),
                    expected: *len,
                });
            }
            encode_sequence(items, elem, out)?;
        }
        (Kind::List { elem, max_len }, Value::List(items)) => {
            check_list_len(items.len(), *max_len)?;
            encode_sequence(items, elem, out)?;
        }
        (Kind::Container { name, fields }, Value::Container(values)) => {
            if values.len() != fields.len() {
                return Err(EncodeError::FieldCountMismatch {
                    name: name.clone(),
                    got: values.len(),
                    expected: fields.len(),
                });
            }
            encode_fields(fields.iter().map(|f| &f.ty).zip(values), out)?;
        }
        (Kind::Versioned { inner }, Value::Versioned { legacy, value }) => {
            out.push(u8::from(*legacy));
            if inner.is_fixed_size() {
                encode_into(value, inner, out)?;
            } else {
                // the inner value always starts right after the discriminant and its offset.
                write_offset(1 + BYTES_PER_OFFSET, out)?;
                encode_into(value, inner, out)?;
            }
        }
        _ => {
            return Err(EncodeError::ShapeMismatch {
                expected: ty.kind_name(),
            })
        }
    }

    Ok(())
}

pub(crate) const fn check_list_len(len: usize, max: usize) -> Result<(), EncodeError> {
    if len > max {
        return Err(EncodeError::ListTooLong { len, max });
    }
    Ok(())
}

fn encode_sequence(
    items: &[Value],
    elem: &TypeDescriptor,
    out: &mut Vec<u8>,
) -> Result<(), EncodeError> {
    if elem.is_fixed_size() {
        for item in items {
            encode_into(item, elem, out)?;
        }
        Ok(())
    } else {
        encode_fields(items.iter().map(|item| (elem, item)), out)
    }
}

/// Writes the fixed part, with offsets standing in for variable fields, followed by the variable
/// part.
fn encode_fields<'a>(
    fields: impl Iterator<Item = (&'a TypeDescriptor, &'a Value)> + Clone,
    out: &mut Vec<u8>,
) -> Result<(), EncodeError> {
    let fixed_len: usize = fields.clone().map(|(ty, _)| ty.fixed_part_len()).sum();
    let mut variable = Vec::new();

    for (ty, value) in fields {
        if ty.is_fixed_size() {
            encode_into(value, ty, out)?;
        } else {
            write_offset(fixed_len + variable.len(), out)?;
            encode_into(value, ty, &mut variable)?;
        }
    }

    out.extend_from_slice(&variable);
    Ok(())
}

fn write_offset(offset: usize, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    let offset = u32::try_from(offset).map_err(|_| EncodeError::OffsetOverflow)?;
    out.extend_from_slice(&offset.to_le_bytes());
    Ok(())
}
