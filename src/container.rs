//! In-memory container: metadata dictionary, tensor table and payload.
//!
//! A `Container` is produced either by [`ContainerReader`](crate::ContainerReader)
//! (read mode) or built incrementally with [`Container::new`] and the
//! `set_value` / `declare_tensor` / `add_tensor` family (write mode).

use std::ops::Range;

use crate::codec::entry_size;
use crate::error::{Error, Result};
use crate::metadata::{ALIGNMENT_KEY, Metadata, MetadataValue};
use crate::tensor::{TensorDescriptor, TensorTable, checked_size};
use crate::types::{ElementType, TensorElement, TypeTag};
use crate::utils::{align_up, is_valid_alignment};

pub const GGUF_MAGIC: &[u8; 4] = b"GGUF";

/// Version written by this crate.
pub const GGUF_VERSION: u32 = 3;

/// Versions accepted on read.
pub const SUPPORTED_VERSIONS: [u32; 2] = [2, 3];

/// Payload alignment used when `general.alignment` is absent.
pub const DEFAULT_ALIGNMENT: u32 = 32;

/// Magic + version + tensor count + KV count.
pub const HEADER_SIZE: u64 = 4 + 4 + 8 + 8;

/// Where the tensor bytes of a container live.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Payload {
    /// Not materialized (metadata-only read or declared-only build).
    Absent,
    /// One contiguous buffer of `total_payload_length()` bytes.
    Owned(Vec<u8>),
    /// Copied into caller-owned storage of this length.
    External { len: u64 },
}

/// Location and type of one tensor, as handed to the tensor-math layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorView<'a> {
    pub name: &'a str,
    pub element_type: ElementType,
    pub shape: &'a [u64],
    /// Byte range relative to the start of the payload region.
    pub byte_range: Range<u64>,
}

/// A decoded or under-construction GGUF container.
#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    version: u32,
    metadata: Metadata,
    tensors: TensorTable,
    payload: Payload,
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl Container {
    /// Creates an empty container for writing.
    pub fn new() -> Self {
        Self {
            version: GGUF_VERSION,
            metadata: Metadata::new(),
            tensors: TensorTable::new(),
            payload: Payload::Absent,
        }
    }

    /// Creates an empty container with a non-default alignment.
    pub fn with_alignment(alignment: u32) -> Result<Self> {
        let mut container = Self::new();
        container.set_alignment(alignment)?;
        Ok(container)
    }

    pub(crate) fn from_parts(
        version: u32,
        metadata: Metadata,
        tensors: TensorTable,
        payload: Payload,
    ) -> Self {
        Self {
            version,
            metadata,
            tensors,
            payload,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn tensors(&self) -> &TensorTable {
        &self.tensors
    }

    /// Payload alignment from `general.alignment`, or the default.
    pub fn alignment(&self) -> u64 {
        match self.metadata.get_u32(ALIGNMENT_KEY) {
            Ok(Some(a)) => u64::from(a),
            _ => u64::from(DEFAULT_ALIGNMENT),
        }
    }

    /// Encoded size of header, dictionary and tensor table.
    pub fn metadata_size(&self) -> u64 {
        let kv: u64 = self
            .metadata
            .iter()
            .map(|e| entry_size(e.key(), e.value()))
            .sum();
        HEADER_SIZE + kv + self.tensors.encoded_size()
    }

    /// Absolute file offset of the payload region.
    pub fn data_offset(&self) -> u64 {
        // In-memory sizes are far below u64::MAX.
        align_up(self.metadata_size(), self.alignment()).unwrap_or(u64::MAX)
    }

    pub fn total_payload_length(&self) -> u64 {
        self.tensors.total_payload_length()
    }

    /// The owned payload buffer, if materialized.
    pub fn payload(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Owned(buf) => Some(buf),
            _ => None,
        }
    }

    /// Length of the materialized payload, owned or external.
    pub fn payload_len(&self) -> Option<u64> {
        match &self.payload {
            Payload::Absent => None,
            Payload::Owned(buf) => Some(buf.len() as u64),
            Payload::External { len } => Some(*len),
        }
    }

    /// Header region bytes (header, dictionary, tensor table) without the
    /// trailing alignment padding.
    pub fn metadata_bytes(&self) -> Vec<u8> {
        crate::writer::encode_header(self)
    }

    /// True when tensor bytes were routed into caller-owned storage.
    pub fn has_external_payload(&self) -> bool {
        matches!(self.payload, Payload::External { .. })
    }

    // ---- Collaborator queries ----

    /// Looks up a tensor's type, shape and payload byte range.
    pub fn lookup_tensor(&self, name: &str) -> Option<TensorView<'_>> {
        self.tensors.find_by_name(name).map(|t| TensorView {
            name: t.name(),
            element_type: t.element_type(),
            shape: t.shape(),
            byte_range: t.offset()..t.end(),
        })
    }

    /// Typed metadata query; see [`Metadata::get_typed`].
    pub fn get_metadata(&self, key: &str, expected: TypeTag) -> Result<Option<&MetadataValue>> {
        self.metadata.get_typed(key, expected)
    }

    /// Raw bytes of a tensor, or `None` if unknown or not materialized.
    pub fn tensor_data(&self, name: &str) -> Option<&[u8]> {
        let t = self.tensors.find_by_name(name)?;
        let buf = self.payload()?;
        let start = usize::try_from(t.offset()).ok()?;
        let end = usize::try_from(t.end()).ok()?;
        buf.get(start..end)
    }

    /// Copies a tensor's elements out as `T`.
    ///
    /// Returns `Ok(None)` when the payload is not materialized.
    pub fn read_as<T: TensorElement>(&self, name: &str) -> Result<Option<Vec<T>>> {
        let t = self
            .tensors
            .find_by_name(name)
            .ok_or_else(|| Error::TensorNotFound(name.to_string()))?;
        if t.element_type() != T::ELEMENT_TYPE {
            return Err(Error::TypeMismatch {
                key: name.to_string(),
                expected: T::ELEMENT_TYPE.name(),
                found: t.element_type().name(),
            });
        }
        let Some(bytes) = self.tensor_data(name) else {
            return Ok(None);
        };
        let width = std::mem::size_of::<T>();
        Ok(Some(
            bytes
                .chunks_exact(width)
                .map(bytemuck::pod_read_unaligned::<T>)
                .collect(),
        ))
    }

    // ---- Builder ----

    /// Sets a metadata value, replacing any previous value for `key`.
    ///
    /// `general.alignment` must be a power-of-two `u32`; changing it
    /// re-lays out all tensor offsets.
    pub fn set_value(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        if key == ALIGNMENT_KEY {
            let MetadataValue::U32(alignment) = value else {
                return Err(Error::TypeMismatch {
                    key,
                    expected: TypeTag::UInt32.name(),
                    found: value.tag().name(),
                });
            };
            return self.set_alignment(alignment);
        }
        self.metadata.set(key, value);
        Ok(())
    }

    /// Removes a metadata entry. Removing `general.alignment` restores the
    /// default alignment.
    pub fn remove_key(&mut self, key: &str) -> Result<Option<MetadataValue>> {
        let old_alignment = self.alignment();
        let relayout = key == ALIGNMENT_KEY && old_alignment != u64::from(DEFAULT_ALIGNMENT);
        if relayout {
            self.check_layout_mutable(key)?;
        }
        let removed = self.metadata.remove(key);
        if relayout {
            if let Err(e) = self.relayout(None) {
                if let Some(value) = removed {
                    self.metadata.set(key, value);
                }
                return Err(e);
            }
        }
        Ok(removed)
    }

    /// Copies every metadata entry of `other` into this container.
    pub fn merge_metadata(&mut self, other: &Metadata) -> Result<()> {
        for entry in other.iter() {
            self.set_value(entry.key(), entry.value().clone())?;
        }
        Ok(())
    }

    pub fn set_alignment(&mut self, alignment: u32) -> Result<()> {
        if !is_valid_alignment(u64::from(alignment)) {
            return Err(Error::InvalidAlignment {
                alignment: u64::from(alignment),
            });
        }
        let changed = u64::from(alignment) != self.alignment();
        if changed {
            self.check_layout_mutable(ALIGNMENT_KEY)?;
        }
        let previous = self.metadata.find(ALIGNMENT_KEY).map(|e| e.value().clone());
        self.metadata.set(ALIGNMENT_KEY, alignment);
        if changed {
            if let Err(e) = self.relayout(None) {
                match previous {
                    Some(value) => self.metadata.set(ALIGNMENT_KEY, value),
                    None => {
                        self.metadata.remove(ALIGNMENT_KEY);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Tensor bytes routed to caller storage by `read_into` cannot be moved
    /// or replaced, so the layout of such a container is frozen.
    fn check_layout_mutable(&self, name: &str) -> Result<()> {
        if self.has_external_payload() {
            return Err(Error::invalid_descriptor(
                name,
                "tensor bytes live in caller storage; the layout is read-only",
            ));
        }
        Ok(())
    }

    fn next_offset(&self, name: &str) -> Result<u64> {
        align_up(self.tensors.total_payload_length(), self.alignment())
            .ok_or_else(|| Error::invalid_descriptor(name, "offset overflows"))
    }

    /// Declares a tensor without data and returns its assigned offset.
    pub fn declare_tensor(
        &mut self,
        name: impl Into<String>,
        element_type: ElementType,
        shape: &[u64],
    ) -> Result<u64> {
        let name = name.into();
        self.check_layout_mutable(&name)?;
        let offset = self.next_offset(&name)?;
        let descriptor = TensorDescriptor::new(name, element_type, shape.to_vec(), offset)?;
        self.tensors.add(descriptor)?;
        self.resize_owned_payload();
        Ok(offset)
    }

    /// Declares a tensor and stores its bytes; returns its assigned offset.
    pub fn add_tensor(
        &mut self,
        name: impl Into<String>,
        element_type: ElementType,
        shape: &[u64],
        data: &[u8],
    ) -> Result<u64> {
        let name = name.into();
        self.check_layout_mutable(&name)?;
        let size = checked_size(&name, element_type, shape)
            .map_err(|reason| Error::invalid_descriptor(&name, reason))?;
        if data.len() as u64 != size {
            return Err(Error::invalid_descriptor(
                &name,
                format!("data is {} bytes, expected {}", data.len(), size),
            ));
        }
        let offset = self.declare_tensor(name.clone(), element_type, shape)?;
        self.set_tensor_data(&name, data)?;
        Ok(offset)
    }

    /// Stores the bytes of a declared tensor, materializing an owned payload
    /// if needed.
    pub fn set_tensor_data(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.check_layout_mutable(name)?;
        let t = self
            .tensors
            .find_by_name(name)
            .ok_or_else(|| Error::TensorNotFound(name.to_string()))?;
        if data.len() as u64 != t.size_bytes() {
            return Err(Error::invalid_descriptor(
                name,
                format!("data is {} bytes, expected {}", data.len(), t.size_bytes()),
            ));
        }
        let range = to_usize_range(t.offset()..t.end(), name)?;
        if !matches!(self.payload, Payload::Owned(_)) {
            self.payload = Payload::Owned(Vec::new());
        }
        self.resize_owned_payload();
        if let Payload::Owned(buf) = &mut self.payload {
            buf[range].copy_from_slice(data);
        }
        Ok(())
    }

    /// Changes a tensor's element type. Sizes and all offsets are recomputed;
    /// the retyped tensor's bytes are discarded.
    pub fn set_tensor_type(&mut self, name: &str, element_type: ElementType) -> Result<()> {
        self.check_layout_mutable(name)?;
        let index = self
            .tensors
            .index_of(name)
            .ok_or_else(|| Error::TensorNotFound(name.to_string()))?;
        let Some(t) = self.tensors.at(index) else {
            return Err(Error::TensorNotFound(name.to_string()));
        };
        let size = checked_size(name, element_type, t.shape())
            .map_err(|reason| Error::invalid_descriptor(name, reason))?;
        self.relayout(Some((index, element_type, size)))
    }

    fn resize_owned_payload(&mut self) {
        let total = self.tensors.total_payload_length();
        if let Payload::Owned(buf) = &mut self.payload {
            // Builder payloads are host memory; the table bounds them.
            buf.resize(total as usize, 0);
        }
    }

    /// Aligned offsets for every tensor in table order, with tensor `i`
    /// optionally resized, plus the resulting payload end.
    fn plan_layout(&self, resized: Option<(usize, u64)>) -> Result<(Vec<u64>, u64)> {
        let alignment = self.alignment();
        let mut offsets = Vec::with_capacity(self.tensors.len());
        let mut end = 0u64;
        for (i, t) in self.tensors.iter().enumerate() {
            let size = match resized {
                Some((j, size)) if j == i => size,
                _ => t.size_bytes(),
            };
            let offset = align_up(end, alignment)
                .ok_or_else(|| Error::invalid_descriptor(t.name(), "offset overflows"))?;
            end = offset
                .checked_add(size)
                .ok_or_else(|| Error::invalid_descriptor(t.name(), "end offset overflows"))?;
            offsets.push(offset);
        }
        Ok((offsets, end))
    }

    /// Packs tensors at aligned offsets in table order, moving owned bytes.
    /// A retyped tensor takes its new type and size and keeps no data.
    /// Nothing changes unless the whole new layout is valid.
    fn relayout(&mut self, retyped: Option<(usize, ElementType, u64)>) -> Result<()> {
        let resized = retyped.map(|(index, _, size)| (index, size));
        let (offsets, end) = self.plan_layout(resized)?;

        let moved = match &self.payload {
            Payload::Owned(old) => {
                let mut buf = vec![0u8; end as usize];
                for (i, (t, &offset)) in self.tensors.iter().zip(&offsets).enumerate() {
                    if resized.is_some_and(|(index, _)| index == i) {
                        continue;
                    }
                    let src = to_usize_range(t.offset()..t.end(), t.name())?;
                    let dst = to_usize_range(offset..offset + t.size_bytes(), t.name())?;
                    if let Some(bytes) = old.get(src) {
                        buf[dst].copy_from_slice(bytes);
                    }
                }
                Some(buf)
            }
            _ => None,
        };

        if let Some((index, element_type, size)) = retyped {
            if let Some(t) = self.tensors.get_mut(index) {
                t.retype(element_type, size);
            }
        }
        for (t, offset) in self.tensors.iter_mut().zip(offsets) {
            t.set_offset(offset);
        }
        if let Some(buf) = moved {
            self.payload = Payload::Owned(buf);
        }
        Ok(())
    }
}

fn to_usize_range(range: Range<u64>, name: &str) -> Result<Range<usize>> {
    let start = usize::try_from(range.start)
        .map_err(|_| Error::invalid_descriptor(name, "offset exceeds address space"))?;
    let end = usize::try_from(range.end)
        .map_err(|_| Error::invalid_descriptor(name, "offset exceeds address space"))?;
    Ok(start..end)
}
