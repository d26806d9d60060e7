use thiserror::Error;

/// An error encoding a [`Value`](crate::Value).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// A list has more elements than its descriptor allows.
    #[error("list of {len} elements exceeds the maximum of {max}")]
    ListTooLong { len: usize, max: usize },
    /// A fixed length vector has the wrong amount of elements.
    #[error("vector has {got} elements, expected {expected}")]
    LengthMismatch { got: usize, expected: usize },
    /// An integer does not fit the width of its field.
    #[error("{value} does not fit in a {width} byte integer")]
    UintOverflow { value: u64, width: usize },
    /// A container value has a different amount of fields than its descriptor.
    #[error("container {name} has {expected} fields, value has {got}")]
    FieldCountMismatch {
        name: String,
        got: usize,
        expected: usize,
    },
    /// The value does not have the shape the descriptor expects.
    #[error("value does not match descriptor, expected {expected}")]
    ShapeMismatch { expected: &'static str },
    /// The encoding would need an offset bigger than [`u32::MAX`].
    #[error("encoded size overflows a 4 byte offset")]
    OffsetOverflow,
}

/// An error decoding bytes into a [`Value`](crate::Value).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The input ended before the fixed part was complete.
    #[error("input truncated, needed {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    /// Bytes were left over after the last field.
    #[error("{0} trailing bytes after the last field")]
    TrailingBytes(usize),
    /// An offset was smaller than the one before it.
    #[error("offset {offset} is smaller than the previous offset {previous}")]
    OffsetsDecreasing { offset: usize, previous: usize },
    /// An offset pointed past the end of the input.
    #[error("offset {offset} exceeds the input length {len}")]
    OffsetOutOfBounds { offset: usize, len: usize },
    /// The first offset does not point directly after the fixed part.
    #[error("first offset {offset} does not match the fixed part length {expected}")]
    InvalidFirstOffset { offset: usize, expected: usize },
    /// The input implies a list longer than the descriptor allows.
    #[error("list of {len} elements exceeds the maximum of {max}")]
    ListTooLong { len: usize, max: usize },
    /// A fixed size item had the wrong length.
    #[error("expected {expected} bytes, got {got}")]
    LengthMismatch { got: usize, expected: usize },
    /// The input can not be split into whole elements.
    #[error("{len} bytes is not a multiple of the element size {elem_size}")]
    InvalidElementBytes { len: usize, elem_size: usize },
    /// A boolean byte other than `0` or `1`.
    #[error("invalid boolean byte {0:#04x}")]
    InvalidBoolean(u8),
}
