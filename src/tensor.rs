//! Tensor descriptors and the ordered tensor table.

use std::collections::HashMap;

use crate::codec::string_size;
use crate::error::{Error, Result};
use crate::types::ElementType;

/// Maximum number of dimensions per tensor.
pub const MAX_DIMS: usize = 4;

/// Maximum tensor name length in bytes.
pub const MAX_NAME_LEN: usize = 63;

/// Describes one named tensor and where its bytes live in the payload region.
///
/// `shape` is in storage order: the first dimension is the innermost
/// (contiguous) one, as written in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDescriptor {
    name: String,
    element_type: ElementType,
    shape: Vec<u64>,
    offset: u64,
    size_bytes: u64,
}

/// Checks name and shape rules and returns the tensor byte size.
pub(crate) fn checked_size(
    name: &str,
    element_type: ElementType,
    shape: &[u64],
) -> std::result::Result<u64, String> {
    if name.len() > MAX_NAME_LEN {
        return Err(format!(
            "name is {} bytes (max {})",
            name.len(),
            MAX_NAME_LEN
        ));
    }
    if shape.len() > MAX_DIMS {
        return Err(format!("{} dimensions (max {})", shape.len(), MAX_DIMS));
    }
    if let Some(d) = shape.iter().position(|&d| d == 0) {
        return Err(format!("dimension {} is zero", d));
    }
    let block = element_type.block_size();
    let innermost = shape.first().copied().unwrap_or(1);
    if innermost % block != 0 {
        return Err(format!(
            "innermost dimension {} is not a multiple of the {} block size {}",
            innermost, element_type, block
        ));
    }
    element_type
        .byte_size(shape)
        .ok_or_else(|| "byte size overflows".to_string())
}

impl TensorDescriptor {
    /// Creates a descriptor, computing its byte size from type and shape.
    pub fn new(
        name: impl Into<String>,
        element_type: ElementType,
        shape: Vec<u64>,
        offset: u64,
    ) -> Result<Self> {
        let name = name.into();
        let size_bytes = checked_size(&name, element_type, &shape)
            .map_err(|reason| Error::invalid_descriptor(&name, reason))?;
        if offset.checked_add(size_bytes).is_none() {
            return Err(Error::invalid_descriptor(&name, "end offset overflows"));
        }
        Ok(Self {
            name,
            element_type,
            shape,
            offset,
            size_bytes,
        })
    }

    /// Builds a descriptor from already validated parts.
    pub(crate) fn from_parts(
        name: String,
        element_type: ElementType,
        shape: Vec<u64>,
        offset: u64,
        size_bytes: u64,
    ) -> Self {
        Self {
            name,
            element_type,
            shape,
            offset,
            size_bytes,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    /// Offset relative to the start of the payload region.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// One past the last payload byte of this tensor.
    ///
    /// Saturates only for descriptors that failed layout validation.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size_bytes)
    }

    /// Number of elements (1 for a scalar).
    pub fn element_count(&self) -> u64 {
        self.shape.iter().product()
    }

    /// Encoded size of this descriptor in the header.
    pub fn encoded_size(&self) -> u64 {
        string_size(&self.name) + 4 + 8 * self.shape.len() as u64 + 4 + 8
    }

    pub(crate) fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub(crate) fn retype(&mut self, element_type: ElementType, size_bytes: u64) {
        self.element_type = element_type;
        self.size_bytes = size_bytes;
    }
}

/// Ordered tensor table with a name index.
#[derive(Debug, Clone, Default)]
pub struct TensorTable {
    tensors: Vec<TensorDescriptor>,
    index: HashMap<String, usize>,
}

impl PartialEq for TensorTable {
    fn eq(&self, other: &Self) -> bool {
        self.tensors == other.tensors
    }
}

impl TensorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            tensors: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Appends a descriptor.
    ///
    /// Fails if the name is taken or the descriptor starts before the end of
    /// the last one.
    pub fn add(&mut self, descriptor: TensorDescriptor) -> Result<()> {
        if self.index.contains_key(descriptor.name()) {
            return Err(Error::DuplicateTensorName {
                name: descriptor.name,
                offset: None,
            });
        }
        if let Some(last) = self.tensors.last() {
            if descriptor.offset < last.end() {
                return Err(Error::NonMonotonicOffset {
                    name: descriptor.name,
                    offset: descriptor.offset,
                    previous_end: last.end(),
                });
            }
        }
        self.push(descriptor);
        Ok(())
    }

    /// Appends a decoded descriptor; layout is validated later as a whole.
    pub(crate) fn push_decoded(&mut self, descriptor: TensorDescriptor, offset: u64) -> Result<()> {
        if self.index.contains_key(descriptor.name()) {
            return Err(Error::DuplicateTensorName {
                name: descriptor.name,
                offset: Some(offset),
            });
        }
        self.push(descriptor);
        Ok(())
    }

    fn push(&mut self, descriptor: TensorDescriptor) {
        self.index
            .insert(descriptor.name.clone(), self.tensors.len());
        self.tensors.push(descriptor);
    }

    pub fn find_by_name(&self, name: &str) -> Option<&TensorDescriptor> {
        self.index.get(name).map(|&i| &self.tensors[i])
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn at(&self, index: usize) -> Option<&TensorDescriptor> {
        self.tensors.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TensorDescriptor> {
        self.tensors.iter()
    }

    /// Offset + size of the last tensor, 0 when empty.
    pub fn total_payload_length(&self) -> u64 {
        self.tensors.last().map_or(0, |t| t.end())
    }

    /// Encoded size of all descriptors.
    pub fn encoded_size(&self) -> u64 {
        self.tensors.iter().map(|t| t.encoded_size()).sum()
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut TensorDescriptor> {
        self.tensors.get_mut(index)
    }

    pub(crate) fn iter_mut(&mut self) -> std::slice::IterMut<'_, TensorDescriptor> {
        self.tensors.iter_mut()
    }
}

impl<'a> IntoIterator for &'a TensorTable {
    type Item = &'a TensorDescriptor;
    type IntoIter = std::slice::Iter<'a, TensorDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
