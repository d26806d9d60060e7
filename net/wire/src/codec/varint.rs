//! Unsigned LEB128 varints, used as the length prefix of every frame.
use bytes::BufMut;

use crate::{constants::MAX_VARINT_LEN, WireError};

/// Reads a varint from the start of `buf` without consuming it.
///
/// Returns the value and the amount of bytes it took, or `None` if `buf` ends before the varint.
pub fn peek_varint(buf: &[u8]) -> Result<Option<(u64, usize)>, WireError> {
    let mut value = 0_u64;

    for (i, byte) in buf.iter().copied().enumerate() {
        if i == MAX_VARINT_LEN {
            return Err(WireError::InvalidFrame("varint is too long"));
        }

        let bits = u64::from(byte & 0x7f);
        let shift = 7 * i;
        // The 10th byte may only carry the top bit of a u64.
        if i == MAX_VARINT_LEN - 1 && bits > 1 {
            return Err(WireError::InvalidFrame("varint overflows a u64"));
        }
        value |= bits << shift;

        if byte & 0x80 == 0 {
            if i > 0 && byte == 0 {
                return Err(WireError::InvalidFrame("varint is not minimally encoded"));
            }
            return Ok(Some((value, i + 1)));
        }
    }

    if buf.len() >= MAX_VARINT_LEN {
        return Err(WireError::InvalidFrame("varint is too long"));
    }

    Ok(None)
}

/// Writes `number` as a varint.
pub fn write_varint<B: BufMut>(mut number: u64, w: &mut B) {
    loop {
        // `as` truncates to the low 7 bits we want.
        #[expect(clippy::cast_possible_truncation)]
        let byte = (number & 0x7f) as u8;
        number >>= 7;
        if number == 0 {
            w.put_u8(byte);
            return;
        }
        w.put_u8(byte | 0x80);
    }
}
