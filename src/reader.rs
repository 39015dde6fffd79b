//! Hardened container decoder.
//!
//! Decoding runs as a linear state machine over an in-memory buffer:
//! header, dictionary, tensor table, layout validation, then payload. Every
//! declared length is checked against the remaining input and the
//! allocation ceiling before it is used.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use log::{debug, trace};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::codec::Decoder;
use crate::cursor::ByteCursor;
use crate::container::{Container, DEFAULT_ALIGNMENT, GGUF_MAGIC, Payload, SUPPORTED_VERSIONS};
use crate::error::{Error, Result};
use crate::metadata::{ALIGNMENT_KEY, Metadata, MetadataEntry, MetadataValue};
use crate::tensor::{MAX_DIMS, TensorDescriptor, TensorTable, checked_size};
use crate::types::ElementType;
use crate::utils::{align_up, is_valid_alignment};

/// Default allocation ceiling (32 GiB).
pub const DEFAULT_MAX_ALLOC: u64 = 32 * 1024 * 1024 * 1024;

/// Smallest possible encoded KV entry: empty key, tag, one-byte value.
const MIN_KV_SIZE: u64 = 8 + 4 + 1;

/// Smallest possible encoded tensor descriptor: empty name, zero dims.
const MIN_TENSOR_INFO_SIZE: u64 = 8 + 4 + 4 + 8;

/// What a read produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// Dictionary and tensor table; payload skipped.
    MetadataOnly,
    /// Dictionary, tensor table and payload.
    #[default]
    WithPayload,
    /// Dictionary only; the tensor table is validated then discarded.
    DictionaryOnly,
}

/// Decoder configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadOptions {
    pub mode: ReadMode,
    /// Upper bound on any single declared allocation, payload included.
    pub max_alloc: u64,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            mode: ReadMode::default(),
            max_alloc: DEFAULT_MAX_ALLOC,
        }
    }
}

impl ReadOptions {
    pub fn with_mode(mode: ReadMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}

/// Decoder progress. Transitions are strictly forward; any failure moves to
/// `Failed` and the partial container is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    Start,
    HeaderValidated,
    DictionaryDecoded,
    TableDecoded,
    OffsetsValidated,
    PayloadSkipped,
    PayloadMaterialized,
    Done,
    Failed,
}

/// Decodes GGUF containers from buffers, readers or files.
#[derive(Debug, Clone)]
pub struct ContainerReader {
    options: ReadOptions,
    state: ReadState,
}

impl Default for ContainerReader {
    fn default() -> Self {
        Self::new(ReadOptions::default())
    }
}

/// Header fields needed after the header is consumed.
struct Header {
    version: u32,
    n_tensors: u64,
    n_kv: u64,
}

impl ContainerReader {
    pub fn new(options: ReadOptions) -> Self {
        Self {
            options,
            state: ReadState::Start,
        }
    }

    pub fn with_mode(mode: ReadMode) -> Self {
        Self::new(ReadOptions::with_mode(mode))
    }

    pub fn options(&self) -> &ReadOptions {
        &self.options
    }

    /// State reached by the last read (`Done` or `Failed`).
    pub fn state(&self) -> ReadState {
        self.state
    }

    /// Decodes a container from a complete in-memory buffer.
    pub fn read(&mut self, input: &[u8]) -> Result<Container> {
        self.run(input, None)
    }

    /// Decodes a container, copying tensor bytes into `dst` instead of an
    /// owned buffer.
    ///
    /// The mode must be [`ReadMode::WithPayload`]; `dst` must hold at least
    /// the total payload length. Bytes of `dst` outside tensor ranges are
    /// left untouched.
    pub fn read_into(&mut self, input: &[u8], dst: &mut [u8]) -> Result<Container> {
        self.run(input, Some(dst))
    }

    /// Reads a stream to its end (bounded by `max_alloc`) and decodes it.
    pub fn read_from<R: Read>(&mut self, reader: R) -> Result<Container> {
        let limit = self.options.max_alloc;
        let mut buf = Vec::new();
        reader.take(limit.saturating_add(1)).read_to_end(&mut buf)?;
        if buf.len() as u64 > limit {
            return Err(Error::AllocationTooLarge {
                requested: buf.len() as u64,
                limit,
                offset: 0,
            });
        }
        self.read(&buf)
    }

    /// Memory-maps a file and decodes it. Only the pages the selected mode
    /// touches are faulted in.
    pub fn open(&mut self, path: impl AsRef<Path>) -> Result<Container> {
        let path = path.as_ref();
        let file = File::open(path)?;
        // Zero-length files cannot be mapped on every platform.
        if file.metadata()?.len() == 0 {
            return self.read(&[]);
        }
        let mmap = unsafe { Mmap::map(&file)? };
        debug!("decoding {} ({} bytes)", path.display(), mmap.len());
        self.read(&mmap)
    }

    fn transition(&mut self, next: ReadState, offset: u64) {
        trace!("gguf read: {:?} -> {:?} at offset {}", self.state, next, offset);
        self.state = next;
    }

    fn run(&mut self, input: &[u8], dst: Option<&mut [u8]>) -> Result<Container> {
        self.state = ReadState::Start;
        match self.decode(input, dst) {
            Ok(container) => {
                self.transition(ReadState::Done, input.len() as u64);
                Ok(container)
            }
            Err(e) => {
                debug!("gguf read failed in state {:?}: {}", self.state, e);
                self.state = ReadState::Failed;
                Err(e)
            }
        }
    }

    fn decode(&mut self, input: &[u8], dst: Option<&mut [u8]>) -> Result<Container> {
        if dst.is_some() && self.options.mode != ReadMode::WithPayload {
            return Err(Error::InvalidValue {
                offset: 0,
                reason: format!(
                    "caller-supplied payload storage requires WithPayload mode, not {:?}",
                    self.options.mode
                ),
            });
        }
        let mut dec = Decoder::new(input, self.options.max_alloc);

        let header = read_header(&mut dec)?;
        self.transition(ReadState::HeaderValidated, dec.position());

        let (metadata, alignment_offset) = read_dictionary(&mut dec, header.n_kv)?;
        self.transition(ReadState::DictionaryDecoded, dec.position());

        let (tensors, entry_offsets) = read_tensor_table(&mut dec, header.n_tensors)?;
        self.transition(ReadState::TableDecoded, dec.position());

        let alignment = resolve_alignment(&metadata, alignment_offset)?;
        let metadata_size = dec.position();
        let data_offset = align_up(metadata_size, alignment)
            .ok_or_else(|| Error::corrupt(metadata_size, "data offset overflows"))?;
        let input_len = input.len() as u64;
        if data_offset > input_len {
            return Err(Error::Truncated {
                offset: metadata_size,
                needed: data_offset - metadata_size,
                available: input_len - metadata_size,
            });
        }
        validate_offsets(&tensors, &entry_offsets, alignment)?;
        let total = tensors.total_payload_length();
        if self.options.mode == ReadMode::WithPayload && total > input_len - data_offset {
            return Err(Error::corrupt(
                data_offset,
                format!(
                    "payload needs {} bytes, {} available",
                    total,
                    input_len - data_offset
                ),
            ));
        }
        self.transition(ReadState::OffsetsValidated, data_offset);

        match self.options.mode {
            ReadMode::MetadataOnly => {
                self.transition(ReadState::PayloadSkipped, data_offset);
                Ok(Container::from_parts(
                    header.version,
                    metadata,
                    tensors,
                    Payload::Absent,
                ))
            }
            ReadMode::DictionaryOnly => {
                self.transition(ReadState::PayloadSkipped, data_offset);
                Ok(Container::from_parts(
                    header.version,
                    metadata,
                    TensorTable::new(),
                    Payload::Absent,
                ))
            }
            ReadMode::WithPayload => {
                let payload =
                    self.materialize(input, &tensors, data_offset, total, dst)?;
                self.transition(ReadState::PayloadMaterialized, data_offset + total);
                Ok(Container::from_parts(
                    header.version,
                    metadata,
                    tensors,
                    payload,
                ))
            }
        }
    }

    fn materialize(
        &self,
        input: &[u8],
        tensors: &TensorTable,
        data_offset: u64,
        total: u64,
        dst: Option<&mut [u8]>,
    ) -> Result<Payload> {
        if total > self.options.max_alloc {
            return Err(Error::AllocationTooLarge {
                requested: total,
                limit: self.options.max_alloc,
                offset: data_offset,
            });
        }
        match dst {
            Some(dst) => {
                if (dst.len() as u64) < total {
                    return Err(Error::AllocationTooLarge {
                        requested: total,
                        limit: dst.len() as u64,
                        offset: data_offset,
                    });
                }
                copy_tensors(input, tensors, data_offset, dst)?;
                Ok(Payload::External { len: total })
            }
            None => {
                // total <= input.len() - data_offset, so it fits in usize.
                let mut owned = vec![0u8; total as usize];
                copy_tensors(input, tensors, data_offset, &mut owned)?;
                Ok(Payload::Owned(owned))
            }
        }
    }
}

/// Copies each tensor's bytes, in table order, to its offset in `dst`.
fn copy_tensors(input: &[u8], tensors: &TensorTable, data_offset: u64, dst: &mut [u8]) -> Result<()> {
    let mut cursor = ByteCursor::new(input);
    for t in tensors {
        cursor.seek(data_offset + t.offset())?;
        let bytes = cursor.read_exact(t.size_bytes())?;
        let Some(out) = dst.get_mut(t.offset() as usize..t.end() as usize) else {
            return Err(Error::corrupt(
                data_offset + t.offset(),
                format!("tensor '{}' exceeds payload storage", t.name()),
            ));
        };
        out.copy_from_slice(bytes);
    }
    Ok(())
}

/// Bounds a header count by the remaining input. Reservations made from it
/// are further capped by [`Decoder::capacity_for`].
fn check_count(dec: &Decoder<'_>, count: u64, unit: u64, offset: u64) -> Result<()> {
    let needed = count.saturating_mul(unit);
    let available = dec.cursor().remaining();
    if needed > available {
        return Err(Error::Truncated {
            offset,
            needed,
            available,
        });
    }
    Ok(())
}

fn read_header(dec: &mut Decoder<'_>) -> Result<Header> {
    let magic = dec.read_bytes(4)?;
    if magic != GGUF_MAGIC {
        return Err(Error::BadMagic {
            found: magic.to_vec(),
        });
    }
    let version = dec.read_u32()?;
    // A zero low half means the file was written with the wrong endianness.
    if version & 0xFFFF == 0 || !SUPPORTED_VERSIONS.contains(&version) {
        return Err(Error::UnsupportedVersion { version });
    }
    let tensors_at = dec.position();
    let n_tensors = dec.read_u64()?;
    let kv_at = dec.position();
    let n_kv = dec.read_u64()?;

    check_count(dec, n_kv, MIN_KV_SIZE, kv_at)?;
    check_count(dec, n_tensors, MIN_TENSOR_INFO_SIZE, tensors_at)?;
    // Both products are bounded by the remaining input, so the sum fits.
    let both = n_kv * MIN_KV_SIZE + n_tensors * MIN_TENSOR_INFO_SIZE;
    check_count(dec, both, 1, tensors_at)?;

    Ok(Header {
        version,
        n_tensors,
        n_kv,
    })
}

/// Decodes the KV section. Also returns the offset of the alignment entry.
fn read_dictionary(dec: &mut Decoder<'_>, n_kv: u64) -> Result<(Metadata, Option<u64>)> {
    let mut metadata = Metadata::with_capacity(dec.capacity_for::<MetadataEntry>(n_kv));
    let mut alignment_offset = None;
    for _ in 0..n_kv {
        let entry_offset = dec.position();
        let key = dec.read_string()?;
        let tag = dec.read_tag()?;
        let value = dec.read_value(tag)?;
        if key == ALIGNMENT_KEY {
            alignment_offset = Some(entry_offset);
        }
        metadata.insert_at(key, value, Some(entry_offset))?;
    }
    Ok((metadata, alignment_offset))
}

/// Decodes the tensor descriptors, returning each one's header offset.
fn read_tensor_table(dec: &mut Decoder<'_>, n_tensors: u64) -> Result<(TensorTable, Vec<u64>)> {
    check_count(dec, n_tensors, MIN_TENSOR_INFO_SIZE, dec.position())?;
    let mut table = TensorTable::with_capacity(dec.capacity_for::<TensorDescriptor>(n_tensors));
    let mut offsets = Vec::with_capacity(dec.capacity_for::<u64>(n_tensors));
    for _ in 0..n_tensors {
        let entry_offset = dec.position();
        let name = dec.read_string()?;

        let dims_at = dec.position();
        let n_dims = dec.read_u32()?;
        if n_dims as usize > MAX_DIMS {
            return Err(Error::corrupt(
                dims_at,
                format!("tensor '{}' has {} dimensions (max {})", name, n_dims, MAX_DIMS),
            ));
        }
        let mut shape = Vec::with_capacity(n_dims as usize);
        for _ in 0..n_dims {
            shape.push(dec.read_u64()?);
        }

        let type_at = dec.position();
        let element_type = ElementType::from_u32(dec.read_u32()?, type_at)?;
        let offset = dec.read_u64()?;

        let size_bytes = checked_size(&name, element_type, &shape)
            .map_err(|reason| Error::corrupt(entry_offset, format!("tensor '{}': {}", name, reason)))?;
        let desc = TensorDescriptor::from_parts(name, element_type, shape, offset, size_bytes);
        table.push_decoded(desc, entry_offset)?;
        offsets.push(entry_offset);
    }
    Ok((table, offsets))
}

fn resolve_alignment(metadata: &Metadata, entry_offset: Option<u64>) -> Result<u64> {
    let offset = entry_offset.unwrap_or(0);
    match metadata.find(ALIGNMENT_KEY).map(|e| e.value()) {
        None => Ok(u64::from(DEFAULT_ALIGNMENT)),
        Some(MetadataValue::U32(a)) if is_valid_alignment(u64::from(*a)) => Ok(u64::from(*a)),
        Some(MetadataValue::U32(a)) => Err(Error::corrupt(
            offset,
            format!("{} = {} is not a power of two", ALIGNMENT_KEY, a),
        )),
        Some(other) => Err(Error::corrupt(
            offset,
            format!("{} must be u32, found {}", ALIGNMENT_KEY, other.tag().name()),
        )),
    }
}

/// Offsets must be aligned, in table order and non-overlapping.
fn validate_offsets(tensors: &TensorTable, entry_offsets: &[u64], alignment: u64) -> Result<()> {
    let mut previous_end = 0u64;
    for (t, &at) in tensors.iter().zip(entry_offsets) {
        if t.offset() % alignment != 0 {
            return Err(Error::corrupt(
                at,
                format!(
                    "tensor '{}' offset {} is not a multiple of {}",
                    t.name(),
                    t.offset(),
                    alignment
                ),
            ));
        }
        if t.offset() < previous_end {
            return Err(Error::corrupt(
                at,
                format!(
                    "tensor '{}' offset {} overlaps previous tensor ending at {}",
                    t.name(),
                    t.offset(),
                    previous_end
                ),
            ));
        }
        previous_end = t.offset().checked_add(t.size_bytes()).ok_or_else(|| {
            Error::corrupt(at, format!("tensor '{}' end offset overflows", t.name()))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{ContainerWriter, PayloadMode};

    fn sample() -> Container {
        let mut c = Container::new();
        c.set_value("general.architecture", "llama").unwrap();
        c.set_value("llama.block_count", 2u32).unwrap();
        let data: Vec<u8> = (0..16u8).collect();
        c.add_tensor("a", ElementType::F32, &[4], &data).unwrap();
        c.add_tensor("b", ElementType::I8, &[3], &[7, 8, 9]).unwrap();
        c
    }

    #[test]
    fn test_state_after_read() {
        let bytes = ContainerWriter::new(PayloadMode::Full).write(&sample());
        let mut reader = ContainerReader::default();
        let c = reader.read(&bytes).unwrap();
        assert_eq!(reader.state(), ReadState::Done);
        assert_eq!(c.tensor_data("b"), Some(&[7u8, 8, 9][..]));

        assert!(reader.read(&bytes[..10]).is_err());
        assert_eq!(reader.state(), ReadState::Failed);
    }

    #[test]
    fn test_modes() {
        let bytes = ContainerWriter::new(PayloadMode::Full).write(&sample());

        let meta = ContainerReader::with_mode(ReadMode::MetadataOnly)
            .read(&bytes)
            .unwrap();
        assert_eq!(meta.tensors().len(), 2);
        assert!(meta.payload().is_none());

        let dict = ContainerReader::with_mode(ReadMode::DictionaryOnly)
            .read(&bytes)
            .unwrap();
        assert!(dict.tensors().is_empty());
        assert_eq!(dict.metadata().get_u32("llama.block_count").unwrap(), Some(2));
    }

    #[test]
    fn test_read_into_external_storage() {
        let original = sample();
        let bytes = ContainerWriter::new(PayloadMode::Full).write(&original);
        let mut dst = vec![0xAAu8; 64];
        let c = ContainerReader::default().read_into(&bytes, &mut dst).unwrap();
        assert!(c.has_external_payload());
        assert_eq!(c.payload_len(), Some(35));
        let payload = original.payload().unwrap();
        assert_eq!(&dst[..16], &payload[..16]);
        assert_eq!(&dst[32..35], &payload[32..35]);
        // gap between tensors is not written
        assert_eq!(dst[20], 0xAA);
        assert_eq!(dst[40], 0xAA);

        let mut small = vec![0u8; 8];
        assert!(matches!(
            ContainerReader::default().read_into(&bytes, &mut small),
            Err(Error::AllocationTooLarge { requested: 35, limit: 8, .. })
        ));
        assert!(
            ContainerReader::with_mode(ReadMode::MetadataOnly)
                .read_into(&bytes, &mut dst)
                .is_err()
        );
    }

    #[test]
    fn test_payload_ceiling() {
        let bytes = ContainerWriter::new(PayloadMode::Full).write(&sample());
        let mut reader = ContainerReader::new(ReadOptions {
            mode: ReadMode::WithPayload,
            max_alloc: 34,
        });
        assert!(matches!(
            reader.read(&bytes),
            Err(Error::AllocationTooLarge { requested: 35, .. })
        ));
        reader = ContainerReader::new(ReadOptions {
            mode: ReadMode::MetadataOnly,
            max_alloc: 34,
        });
        assert!(reader.read(&bytes).is_ok());
    }

    #[test]
    fn test_header_counts_bounded_by_input() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"GGUF");
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        assert!(matches!(
            ContainerReader::default().read(&bytes),
            Err(Error::Truncated { offset: 8, .. })
        ));
    }

    #[test]
    fn test_read_from_stream() {
        let bytes = ContainerWriter::new(PayloadMode::Full).write(&sample());
        let c = ContainerReader::default()
            .read_from(std::io::Cursor::new(&bytes))
            .unwrap();
        assert_eq!(c, sample());

        let mut tight = ContainerReader::new(ReadOptions {
            mode: ReadMode::WithPayload,
            max_alloc: 32,
        });
        assert!(matches!(
            tight.read_from(std::io::Cursor::new(&bytes)),
            Err(Error::AllocationTooLarge { limit: 32, .. })
        ));
    }

    #[test]
    fn test_options_defaults() {
        let opts = ReadOptions::with_mode(ReadMode::DictionaryOnly);
        assert_eq!(opts.max_alloc, DEFAULT_MAX_ALLOC);
        assert_eq!(ReadOptions::default().mode, ReadMode::WithPayload);
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        use std::collections::BTreeMap;

        let mut partial = BTreeMap::new();
        partial.insert("mode", "metadata_only");
        let bytes = serde_cbor::to_vec(&partial).unwrap();
        let opts: ReadOptions = serde_cbor::from_slice(&bytes).unwrap();
        assert_eq!(opts.mode, ReadMode::MetadataOnly);
        assert_eq!(opts.max_alloc, DEFAULT_MAX_ALLOC);

        let empty: BTreeMap<&str, &str> = BTreeMap::new();
        let opts: ReadOptions =
            serde_cbor::from_slice(&serde_cbor::to_vec(&empty).unwrap()).unwrap();
        assert_eq!(opts, ReadOptions::default());

        let custom = ReadOptions {
            mode: ReadMode::DictionaryOnly,
            max_alloc: 4096,
        };
        let bytes = serde_cbor::to_vec(&custom).unwrap();
        assert_eq!(serde_cbor::from_slice::<ReadOptions>(&bytes).unwrap(), custom);
    }
}
