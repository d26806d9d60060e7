//! Type Descriptors.
//!
//! This module contains [`TypeDescriptor`], the runtime description of a type's layout and bounds.
use std::{fmt, sync::Arc};

use crate::BYTES_PER_OFFSET;

/// The kind of a [`TypeDescriptor`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    /// A single byte, `0` or `1`.
    Boolean,
    /// A little-endian unsigned integer of the given width in bytes (1, 2, 4 or 8).
    Uint(usize),
    /// A fixed amount of bytes.
    ByteVector(usize),
    /// Up to `max_len` bytes.
    ByteList { max_len: usize },
    /// Exactly `len` elements.
    Vector { elem: TypeDescriptor, len: usize },
    /// Up to `max_len` elements.
    List { elem: TypeDescriptor, max_len: usize },
    /// Named fields in declared order.
    Container { name: String, fields: Vec<Field> },
    /// A boolean discriminant followed by `inner`.
    ///
    /// The discriminant is part of the payload and does not change the layout of `inner`.
    Versioned { inner: TypeDescriptor },
}

/// A named field of a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    /// The name of this field.
    pub name: String,
    /// The type of this field.
    pub ty: TypeDescriptor,
}

/// An immutable, cheaply clonable description of a type.
///
/// Descriptors are compared structurally, so two descriptors built from the same configuration are
/// equal while ones built with different bounds are not.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TypeDescriptor(Arc<Kind>);

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TypeDescriptor {
    fn new(kind: Kind) -> Self {
        Self(Arc::new(kind))
    }

    /// A boolean.
    pub fn boolean() -> Self {
        Self::new(Kind::Boolean)
    }

    /// A `u8`.
    pub fn uint8() -> Self {
        Self::new(Kind::Uint(1))
    }

    /// A `u16`.
    pub fn uint16() -> Self {
        Self::new(Kind::Uint(2))
    }

    /// A `u32`.
    pub fn uint32() -> Self {
        Self::new(Kind::Uint(4))
    }

    /// A `u64`.
    pub fn uint64() -> Self {
        Self::new(Kind::Uint(8))
    }

    /// Exactly `len` bytes.
    pub fn byte_vector(len: usize) -> Self {
        Self::new(Kind::ByteVector(len))
    }

    /// Up to `max_len` bytes.
    pub fn byte_list(max_len: usize) -> Self {
        Self::new(Kind::ByteList { max_len })
    }

    /// Exactly `len` elements of `elem`.
    pub fn vector(elem: Self, len: usize) -> Self {
        Self::new(Kind::Vector { elem, len })
    }

    /// Up to `max_len` elements of `elem`.
    pub fn list(elem: Self, max_len: usize) -> Self {
        Self::new(Kind::List { elem, max_len })
    }

    /// A boolean discriminant followed by `inner`.
    pub fn versioned(inner: Self) -> Self {
        Self::new(Kind::Versioned { inner })
    }

    /// Returns the [`Kind`] of this descriptor.
    pub fn kind(&self) -> &Kind {
        &self.0
    }

    /// Returns the name of this kind, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self.kind() {
            Kind::Boolean => "boolean",
            Kind::Uint(_) => "uint",
            Kind::ByteVector(_) => "byte vector",
            Kind::ByteList { .. } => "byte list",
            Kind::Vector { .. } => "vector",
            Kind::List { .. } => "list",
            Kind::Container { .. } => "container",
            Kind::Versioned { .. } => "versioned container",
        }
    }

    /// Returns the index of the field called `name` if this is a container.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        match self.kind() {
            Kind::Container { fields, .. } => fields.iter().position(|f| f.name == name),
            _ => None,
        }
    }

    /// Returns the type of the field called `name` if this is a container.
    pub fn field_type(&self, name: &str) -> Option<&Self> {
        match self.kind() {
            Kind::Container { fields, .. } => {
                fields.iter().find(|f| f.name == name).map(|f| &f.ty)
            }
            _ => None,
        }
    }

    /// Returns the maximum element count of this type if it is a list.
    pub fn max_list_len(&self) -> Option<usize> {
        match self.kind() {
            Kind::List { max_len, .. } | Kind::ByteList { max_len } => Some(*max_len),
            _ => None,
        }
    }

    /// Returns the encoded size of this type if it is fixed.
    pub fn fixed_size(&self) -> Option<usize> {
        match self.kind() {
            Kind::Boolean => Some(1),
            Kind::Uint(width) => Some(*width),
            Kind::ByteVector(len) => Some(*len),
            Kind::ByteList { .. } | Kind::List { .. } => None,
            Kind::Vector { elem, len } => elem.fixed_size().map(|s| s.saturating_mul(*len)),
            Kind::Container { fields, .. } => fields
                .iter()
                .try_fold(0_usize, |acc, f| Some(acc.saturating_add(f.ty.fixed_size()?))),
            Kind::Versioned { inner } => inner.fixed_size().map(|s| s.saturating_add(1)),
        }
    }

    /// Returns `true` if this type always encodes to the same amount of bytes.
    pub fn is_fixed_size(&self) -> bool {
        self.fixed_size().is_some()
    }

    /// The amount of bytes this type takes in the fixed part of a parent, either its own size or
    /// an offset.
    pub fn fixed_part_len(&self) -> usize {
        self.fixed_size().unwrap_or(BYTES_PER_OFFSET)
    }

    /// The smallest valid encoding of this type.
    pub fn min_size(&self) -> usize {
        match self.kind() {
            Kind::ByteList { .. } | Kind::List { .. } => 0,
            Kind::Vector { elem, len } if !elem.is_fixed_size() => {
                len.saturating_mul(BYTES_PER_OFFSET.saturating_add(elem.min_size()))
            }
            Kind::Container { fields, .. } => fields.iter().fold(0_usize, |acc, f| {
                let var = if f.ty.is_fixed_size() { 0 } else { f.ty.min_size() };
                acc.saturating_add(f.ty.fixed_part_len()).saturating_add(var)
            }),
            Kind::Versioned { inner } if !inner.is_fixed_size() => {
                (1 + BYTES_PER_OFFSET).saturating_add(inner.min_size())
            }
            _ => self.fixed_size().unwrap_or_default(),
        }
    }

    /// The largest valid encoding of this type.
    ///
    /// Saturates at [`usize::MAX`].
    pub fn max_size(&self) -> usize {
        match self.kind() {
            Kind::ByteList { max_len } => *max_len,
            Kind::List { elem, max_len } => sequence_max_size(elem, *max_len),
            Kind::Vector { elem, len } => sequence_max_size(elem, *len),
            Kind::Container { fields, .. } => fields.iter().fold(0_usize, |acc, f| {
                let var = if f.ty.is_fixed_size() { 0 } else { f.ty.max_size() };
                acc.saturating_add(f.ty.fixed_part_len()).saturating_add(var)
            }),
            Kind::Versioned { inner } => {
                let offset = if inner.is_fixed_size() { 0 } else { BYTES_PER_OFFSET };
                inner.max_size().saturating_add(1 + offset)
            }
            Kind::Boolean | Kind::Uint(_) | Kind::ByteVector(_) => {
                self.fixed_size().unwrap_or_default()
            }
        }
    }
}

fn sequence_max_size(elem: &TypeDescriptor, count: usize) -> usize {
    match elem.fixed_size() {
        Some(size) => size.saturating_mul(count),
        None => BYTES_PER_OFFSET
            .saturating_add(elem.max_size())
            .saturating_mul(count),
    }
}

/// A builder for container [`TypeDescriptor`]s.
///
/// ```rust
/// use beacon_ssz::{ContainerBuilder, TypeDescriptor};
///
/// let header = ContainerBuilder::new("Header")
///     .field("slot", TypeDescriptor::uint64())
///     .field("root", TypeDescriptor::byte_vector(32))
///     .build();
///
/// assert_eq!(header.fixed_size(), Some(40));
/// ```
#[derive(Debug)]
pub struct ContainerBuilder {
    name: String,
    fields: Vec<Field>,
}

impl ContainerBuilder {
    /// Starts a new container called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Appends a field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, ty: TypeDescriptor) -> Self {
        self.fields.push(Field {
            name: name.into(),
            ty,
        });
        self
    }

    /// Builds the container descriptor.
    pub fn build(self) -> TypeDescriptor {
        TypeDescriptor::new(Kind::Container {
            name: self.name,
            fields: self.fields,
        })
    }
}
