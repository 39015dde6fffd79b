//! Ordered key → typed value dictionary stored in the container header.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::types::TypeTag;

/// Well-known key holding the payload alignment (UInt32).
pub const ALIGNMENT_KEY: &str = "general.alignment";

/// Well-known key naming the model architecture (String).
pub const ARCHITECTURE_KEY: &str = "general.architecture";

/// A homogeneous array value. Nested arrays are not representable.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataArray {
    U8(Vec<u8>),
    I8(Vec<i8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    U32(Vec<u32>),
    I32(Vec<i32>),
    F32(Vec<f32>),
    Bool(Vec<bool>),
    String(Vec<String>),
    U64(Vec<u64>),
    I64(Vec<i64>),
    F64(Vec<f64>),
}

/// A typed metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    Array(MetadataArray),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl MetadataArray {
    /// Type tag of the array elements.
    pub fn element_tag(&self) -> TypeTag {
        match self {
            MetadataArray::U8(_) => TypeTag::UInt8,
            MetadataArray::I8(_) => TypeTag::Int8,
            MetadataArray::U16(_) => TypeTag::UInt16,
            MetadataArray::I16(_) => TypeTag::Int16,
            MetadataArray::U32(_) => TypeTag::UInt32,
            MetadataArray::I32(_) => TypeTag::Int32,
            MetadataArray::F32(_) => TypeTag::Float32,
            MetadataArray::Bool(_) => TypeTag::Bool,
            MetadataArray::String(_) => TypeTag::String,
            MetadataArray::U64(_) => TypeTag::UInt64,
            MetadataArray::I64(_) => TypeTag::Int64,
            MetadataArray::F64(_) => TypeTag::Float64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            MetadataArray::U8(v) => v.len(),
            MetadataArray::I8(v) => v.len(),
            MetadataArray::U16(v) => v.len(),
            MetadataArray::I16(v) => v.len(),
            MetadataArray::U32(v) => v.len(),
            MetadataArray::I32(v) => v.len(),
            MetadataArray::F32(v) => v.len(),
            MetadataArray::Bool(v) => v.len(),
            MetadataArray::String(v) => v.len(),
            MetadataArray::U64(v) => v.len(),
            MetadataArray::I64(v) => v.len(),
            MetadataArray::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetadataValue {
    pub fn tag(&self) -> TypeTag {
        match self {
            MetadataValue::U8(_) => TypeTag::UInt8,
            MetadataValue::I8(_) => TypeTag::Int8,
            MetadataValue::U16(_) => TypeTag::UInt16,
            MetadataValue::I16(_) => TypeTag::Int16,
            MetadataValue::U32(_) => TypeTag::UInt32,
            MetadataValue::I32(_) => TypeTag::Int32,
            MetadataValue::F32(_) => TypeTag::Float32,
            MetadataValue::Bool(_) => TypeTag::Bool,
            MetadataValue::String(_) => TypeTag::String,
            MetadataValue::Array(_) => TypeTag::Array,
            MetadataValue::U64(_) => TypeTag::UInt64,
            MetadataValue::I64(_) => TypeTag::Int64,
            MetadataValue::F64(_) => TypeTag::Float64,
        }
    }
}

macro_rules! impl_from_value {
    ($t:ty, $variant:ident) => {
        impl From<$t> for MetadataValue {
            fn from(v: $t) -> Self {
                MetadataValue::$variant(v)
            }
        }

        impl From<Vec<$t>> for MetadataValue {
            fn from(v: Vec<$t>) -> Self {
                MetadataValue::Array(MetadataArray::$variant(v))
            }
        }
    };
}

impl_from_value!(u8, U8);
impl_from_value!(i8, I8);
impl_from_value!(u16, U16);
impl_from_value!(i16, I16);
impl_from_value!(u32, U32);
impl_from_value!(i32, I32);
impl_from_value!(f32, F32);
impl_from_value!(bool, Bool);
impl_from_value!(String, String);
impl_from_value!(u64, U64);
impl_from_value!(i64, I64);
impl_from_value!(f64, F64);

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        MetadataValue::String(v.to_string())
    }
}

impl From<MetadataArray> for MetadataValue {
    fn from(v: MetadataArray) -> Self {
        MetadataValue::Array(v)
    }
}

/// One key/value pair of the dictionary.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataEntry {
    key: String,
    value: MetadataValue,
}

impl MetadataEntry {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &MetadataValue {
        &self.value
    }

    pub fn tag(&self) -> TypeTag {
        self.value.tag()
    }
}

/// Ordered metadata dictionary.
///
/// Entries are kept in insertion order (the order they are serialized in);
/// lookups go through a key → position index.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    entries: Vec<MetadataEntry>,
    index: HashMap<String, usize>,
}

impl PartialEq for Metadata {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

macro_rules! typed_getter {
    ($(#[$doc:meta])* $fn:ident, $variant:ident, $tag:path, $t:ty) => {
        $(#[$doc])*
        pub fn $fn(&self, key: &str) -> Result<Option<$t>> {
            match self.get_typed(key, $tag)? {
                Some(MetadataValue::$variant(v)) => Ok(Some(*v)),
                _ => Ok(None),
            }
        }
    };
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds a new entry; fails if the key is already present.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Result<()> {
        self.insert_at(key.into(), value.into(), None)
    }

    pub(crate) fn insert_at(
        &mut self,
        key: String,
        value: MetadataValue,
        offset: Option<u64>,
    ) -> Result<()> {
        if self.index.contains_key(&key) {
            return Err(Error::DuplicateKey { key, offset });
        }
        self.index.insert(key.clone(), self.entries.len());
        self.entries.push(MetadataEntry { key, value });
        Ok(())
    }

    /// Inserts or replaces a value. A replaced entry keeps its position.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        let key = key.into();
        let value = value.into();
        match self.index.get(&key) {
            Some(&i) => self.entries[i].value = value,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push(MetadataEntry { key, value });
            }
        }
    }

    /// Removes an entry, preserving the order of the remaining ones.
    pub fn remove(&mut self, key: &str) -> Option<MetadataValue> {
        let i = self.index.remove(key)?;
        let entry = self.entries.remove(i);
        for later in &self.entries[i..] {
            if let Some(pos) = self.index.get_mut(&later.key) {
                *pos -= 1;
            }
        }
        Some(entry.value)
    }

    /// Copies every entry of `other`, overwriting values for shared keys.
    pub fn merge_from(&mut self, other: &Metadata) {
        for entry in other.iter() {
            self.set(entry.key.clone(), entry.value.clone());
        }
    }

    pub fn find(&self, key: &str) -> Option<&MetadataEntry> {
        self.index.get(key).map(|&i| &self.entries[i])
    }

    pub fn index_of(&self, key: &str) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub fn at(&self, index: usize) -> Option<&MetadataEntry> {
        self.entries.get(index)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Looks up `key` and checks its stored type against `expected`.
    ///
    /// A missing key is `Ok(None)`; a present key of another type is a
    /// [`Error::TypeMismatch`].
    pub fn get_typed(&self, key: &str, expected: TypeTag) -> Result<Option<&MetadataValue>> {
        let Some(entry) = self.find(key) else {
            return Ok(None);
        };
        let found = entry.tag();
        if found != expected {
            return Err(Error::TypeMismatch {
                key: key.to_string(),
                expected: expected.name(),
                found: found.name(),
            });
        }
        Ok(Some(&entry.value))
    }

    typed_getter!(get_u8, U8, TypeTag::UInt8, u8);
    typed_getter!(get_i8, I8, TypeTag::Int8, i8);
    typed_getter!(get_u16, U16, TypeTag::UInt16, u16);
    typed_getter!(get_i16, I16, TypeTag::Int16, i16);
    typed_getter!(get_u32, U32, TypeTag::UInt32, u32);
    typed_getter!(get_i32, I32, TypeTag::Int32, i32);
    typed_getter!(get_f32, F32, TypeTag::Float32, f32);
    typed_getter!(get_bool, Bool, TypeTag::Bool, bool);
    typed_getter!(get_u64, U64, TypeTag::UInt64, u64);
    typed_getter!(get_i64, I64, TypeTag::Int64, i64);
    typed_getter!(get_f64, F64, TypeTag::Float64, f64);

    pub fn get_str(&self, key: &str) -> Result<Option<&str>> {
        match self.get_typed(key, TypeTag::String)? {
            Some(MetadataValue::String(s)) => Ok(Some(s.as_str())),
            _ => Ok(None),
        }
    }

    pub fn get_array(&self, key: &str) -> Result<Option<&MetadataArray>> {
        match self.get_typed(key, TypeTag::Array)? {
            Some(MetadataValue::Array(a)) => Ok(Some(a)),
            _ => Ok(None),
        }
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, MetadataEntry> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }
}

impl<'a> IntoIterator for &'a Metadata {
    type Item = &'a MetadataEntry;
    type IntoIter = std::slice::Iter<'a, MetadataEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
