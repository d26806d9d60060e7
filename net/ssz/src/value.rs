/// A decoded value, shaped by a [`TypeDescriptor`](crate::TypeDescriptor).
///
/// Values do not carry their type, the same descriptor must be used to encode and decode them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    /// A boolean.
    Bool(bool),
    /// An unsigned integer of any supported width.
    Uint(u64),
    /// A byte vector or a byte list.
    Bytes(Vec<u8>),
    /// A vector or a list.
    List(Vec<Value>),
    /// The field values of a container, in declared order.
    Container(Vec<Value>),
    /// A value with a leading boolean discriminant.
    Versioned {
        /// The discriminant.
        legacy: bool,
        /// The inner value.
        value: Box<Value>,
    },
}

impl Value {
    /// Returns the integer if this is a [`Value::Uint`].
    pub const fn as_uint(&self) -> Option<u64> {
        match self {
            Self::Uint(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the boolean if this is a [`Value::Bool`].
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the bytes if this is a [`Value::Bytes`].
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the elements if this is a [`Value::List`].
    pub fn as_list(&self) -> Option<&[Self]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the field at `index` if this is a [`Value::Container`].
    pub fn field(&self, index: usize) -> Option<&Self> {
        match self {
            Self::Container(fields) => fields.get(index),
            _ => None,
        }
    }

    /// Returns the bytes as a fixed size array, if this is [`Value::Bytes`] of length `N`.
    pub fn to_array<const N: usize>(&self) -> Option<[u8; N]> {
        self.as_bytes()?.try_into().ok()
    }
}
