//! Container encoder.
//!
//! Emission order: header, dictionary in insertion order, tensor table in
//! table order, zero padding to the data offset, then each tensor's bytes at
//! its offset. Padding after every tensor, including the last, keeps the
//! file length a multiple of the alignment.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::codec::{write_entry, write_string};
use crate::container::{Container, GGUF_MAGIC};
use crate::cursor::ByteSink;
use crate::error::Result;
use crate::tensor::TensorDescriptor;
use crate::utils::align_offset_to;

/// What the writer emits after the header region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadMode {
    /// Header region, padding and all tensor bytes.
    #[default]
    Full,
    /// Header region and padding up to the data offset only.
    MetadataOnly,
}

/// Serializes containers to bytes, streams or files.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerWriter {
    mode: PayloadMode,
}

impl ContainerWriter {
    pub fn new(mode: PayloadMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> PayloadMode {
        self.mode
    }

    /// Encodes a container into a new buffer.
    ///
    /// # Panics
    ///
    /// In `Full` mode, if the container's tensor bytes were routed to caller
    /// storage by `read_into`; use [`write_with_payload`](Self::write_with_payload).
    pub fn write(&self, container: &Container) -> Vec<u8> {
        let payload = match self.own_payload(container) {
            Ok(payload) => payload,
            Err(e) => panic!("{}", e),
        };
        let mut sink = ByteSink::new(Vec::new());
        // Writes into a Vec cannot fail.
        if let Err(e) = self.emit(container, payload, &mut sink) {
            debug!("in-memory gguf write failed: {}", e);
        }
        sink.into_inner()
    }

    /// Encodes a container into `writer`; returns the number of bytes written.
    ///
    /// Fails with [`io::ErrorKind::InvalidInput`] in `Full` mode when the
    /// tensor bytes live in caller storage.
    pub fn write_to<W: Write>(&self, container: &Container, writer: W) -> io::Result<u64> {
        let payload = self.own_payload(container)?;
        let mut sink = ByteSink::new(writer);
        self.emit(container, payload, &mut sink)?;
        sink.flush()?;
        Ok(sink.position())
    }

    /// Encodes a container whose tensor bytes live outside it, for example
    /// after [`ContainerReader::read_into`](crate::ContainerReader::read_into).
    ///
    /// `payload` is indexed by tensor offset; tensors it does not cover are
    /// written as zeros.
    pub fn write_with_payload<W: Write>(
        &self,
        container: &Container,
        payload: &[u8],
        writer: W,
    ) -> io::Result<u64> {
        let mut sink = ByteSink::new(writer);
        self.emit(container, Some(payload), &mut sink)?;
        sink.flush()?;
        Ok(sink.position())
    }

    /// Encodes a container to a file, replacing any existing one.
    pub fn write_file(&self, container: &Container, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        self.own_payload(container)?;
        let file = File::create(path)?;
        let written = self.write_to(container, BufWriter::with_capacity(256 * 1024, file))?;
        debug!("wrote {} ({} bytes)", path.display(), written);
        Ok(written)
    }

    /// The container's own tensor bytes, or an error when `Full` output
    /// would need bytes held in caller storage.
    fn own_payload<'a>(&self, container: &'a Container) -> io::Result<Option<&'a [u8]>> {
        if self.mode == PayloadMode::Full && container.has_external_payload() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tensor bytes live in caller storage; use write_with_payload",
            ));
        }
        Ok(container.payload())
    }

    fn emit<W: Write>(
        &self,
        container: &Container,
        payload: Option<&[u8]>,
        sink: &mut ByteSink<W>,
    ) -> io::Result<()> {
        write_header_region(container, sink)?;
        let data_offset = container.data_offset();
        sink.write_zeros(data_offset.saturating_sub(sink.position()))?;
        debug!(
            "gguf v{}: {} kv, {} tensors, data offset {}",
            container.version(),
            container.metadata().len(),
            container.tensors().len(),
            data_offset
        );
        if self.mode == PayloadMode::MetadataOnly {
            return Ok(());
        }

        let alignment = container.alignment();
        for t in container.tensors() {
            let start = data_offset + t.offset();
            // Table offsets are non-decreasing and non-overlapping.
            debug_assert!(sink.position() <= start);
            sink.write_zeros(start.saturating_sub(sink.position()))?;
            match payload.and_then(|p| tensor_bytes(p, t)) {
                Some(bytes) => sink.write_exact(bytes)?,
                None => sink.write_zeros(t.size_bytes())?,
            }
            let (_, padding) = align_offset_to(sink.position(), alignment).unwrap_or((0, 0));
            sink.write_zeros(padding)?;
        }
        Ok(())
    }
}

fn tensor_bytes<'a>(payload: &'a [u8], t: &TensorDescriptor) -> Option<&'a [u8]> {
    let start = usize::try_from(t.offset()).ok()?;
    let end = usize::try_from(t.end()).ok()?;
    payload.get(start..end)
}

/// Header, dictionary and tensor table, without trailing padding.
fn write_header_region<W: Write>(container: &Container, w: &mut W) -> io::Result<()> {
    w.write_all(GGUF_MAGIC)?;
    w.write_u32::<LittleEndian>(container.version())?;
    w.write_u64::<LittleEndian>(container.tensors().len() as u64)?;
    w.write_u64::<LittleEndian>(container.metadata().len() as u64)?;

    for entry in container.metadata() {
        write_entry(w, entry.key(), entry.value())?;
    }

    for t in container.tensors() {
        write_string(w, t.name())?;
        w.write_u32::<LittleEndian>(t.shape().len() as u32)?;
        for &dim in t.shape() {
            w.write_u64::<LittleEndian>(dim)?;
        }
        w.write_u32::<LittleEndian>(t.element_type().as_u32())?;
        w.write_u64::<LittleEndian>(t.offset())?;
    }
    Ok(())
}

pub(crate) fn encode_header(container: &Container) -> Vec<u8> {
    let mut buf = Vec::with_capacity(container.metadata_size() as usize);
    if let Err(e) = write_header_region(container, &mut buf) {
        debug!("in-memory gguf header write failed: {}", e);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{DEFAULT_ALIGNMENT, HEADER_SIZE};
    use crate::types::ElementType;

    #[test]
    fn test_empty_container_bytes() {
        let bytes = ContainerWriter::default().write(&Container::new());
        let mut expected = Vec::new();
        expected.extend_from_slice(b"GGUF");
        expected.extend_from_slice(&3u32.to_le_bytes());
        expected.extend_from_slice(&0u64.to_le_bytes());
        expected.extend_from_slice(&0u64.to_le_bytes());
        expected.resize(DEFAULT_ALIGNMENT as usize, 0);
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_single_kv_layout() {
        let mut c = Container::new();
        c.set_value("a", 7u8).unwrap();
        let bytes = ContainerWriter::default().write(&c);
        let kv = &bytes[HEADER_SIZE as usize..];
        assert_eq!(&kv[..8], &1u64.to_le_bytes());
        assert_eq!(kv[8], b'a');
        assert_eq!(&kv[9..13], &0u32.to_le_bytes());
        assert_eq!(kv[13], 7);
        // 24 + 14 = 38, padded to 64
        assert_eq!(c.metadata_size(), 38);
        assert_eq!(bytes.len(), 64);
        assert_eq!(c.metadata_bytes(), bytes[..38].to_vec());
    }

    #[test]
    fn test_payload_placement_and_tail_padding() {
        let mut c = Container::new();
        c.add_tensor("x", ElementType::I8, &[3], &[1, 2, 3]).unwrap();
        c.add_tensor("y", ElementType::I8, &[2], &[4, 5]).unwrap();
        let bytes = ContainerWriter::new(PayloadMode::Full).write(&c);
        let data_offset = c.data_offset() as usize;
        assert_eq!(data_offset % 32, 0);
        assert_eq!(&bytes[data_offset..data_offset + 3], &[1, 2, 3]);
        assert!(bytes[data_offset + 3..data_offset + 32].iter().all(|&b| b == 0));
        assert_eq!(&bytes[data_offset + 32..data_offset + 34], &[4, 5]);
        assert_eq!(bytes.len(), data_offset + 64);

        let meta = ContainerWriter::new(PayloadMode::MetadataOnly).write(&c);
        assert_eq!(meta, bytes[..data_offset].to_vec());
    }

    #[test]
    fn test_declared_tensors_are_zero_filled() {
        let mut c = Container::new();
        c.declare_tensor("z", ElementType::F32, &[4]).unwrap();
        let bytes = ContainerWriter::default().write(&c);
        let data_offset = c.data_offset() as usize;
        assert_eq!(bytes.len(), data_offset + 32);
        assert!(bytes[data_offset..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_to_and_external_payload() {
        let mut c = Container::new();
        c.declare_tensor("w", ElementType::I8, &[4]).unwrap();
        let mut out = Vec::new();
        let n = ContainerWriter::default()
            .write_with_payload(&c, &[9, 9, 9, 9], &mut out)
            .unwrap();
        assert_eq!(n, out.len() as u64);
        let data_offset = c.data_offset() as usize;
        assert_eq!(&out[data_offset..data_offset + 4], &[9, 9, 9, 9]);

        let mut plain = Vec::new();
        let m = ContainerWriter::default().write_to(&c, &mut plain).unwrap();
        assert_eq!(m, n);
        assert_eq!(&plain[data_offset..data_offset + 4], &[0, 0, 0, 0]);
    }

    fn read_into_external(dst: &mut [u8]) -> Container {
        let mut c = Container::new();
        c.add_tensor("a", ElementType::I8, &[4], &[1, 2, 3, 4]).unwrap();
        c.add_tensor("b", ElementType::I8, &[4], &[5, 6, 7, 8]).unwrap();
        let bytes = ContainerWriter::default().write(&c);
        crate::reader::ContainerReader::default()
            .read_into(&bytes, dst)
            .unwrap()
    }

    #[test]
    fn test_external_payload_needs_caller_bytes() {
        let mut dst = vec![0u8; 64];
        let ext = read_into_external(&mut dst);
        assert!(ext.has_external_payload());

        let err = ContainerWriter::new(PayloadMode::Full)
            .write_to(&ext, Vec::new())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        // metadata-only output does not touch tensor bytes
        let mut meta = Vec::new();
        ContainerWriter::new(PayloadMode::MetadataOnly)
            .write_to(&ext, &mut meta)
            .unwrap();
        assert_eq!(meta.len() as u64, ext.data_offset());

        let mut full = Vec::new();
        ContainerWriter::new(PayloadMode::Full)
            .write_with_payload(&ext, &dst, &mut full)
            .unwrap();
        let data_offset = ext.data_offset() as usize;
        assert_eq!(&full[data_offset..data_offset + 4], &[1, 2, 3, 4]);
        assert_eq!(&full[data_offset + 32..data_offset + 36], &[5, 6, 7, 8]);
    }

    #[test]
    #[should_panic(expected = "write_with_payload")]
    fn test_write_panics_on_external_payload() {
        let mut dst = vec![0u8; 64];
        let ext = read_into_external(&mut dst);
        ContainerWriter::new(PayloadMode::Full).write(&ext);
    }

    #[test]
    fn test_write_file_rejects_external_payload() {
        let mut dst = vec![0u8; 64];
        let ext = read_into_external(&mut dst);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ext.gguf");
        assert!(matches!(
            ContainerWriter::default().write_file(&ext, &path),
            Err(crate::error::Error::Io(_))
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_payload_mode_serde() {
        let encoded = serde_cbor::to_vec(&PayloadMode::MetadataOnly).unwrap();
        assert_eq!(encoded, serde_cbor::to_vec(&"metadata_only").unwrap());
        let decoded: PayloadMode = serde_cbor::from_slice(&encoded).unwrap();
        assert_eq!(decoded, PayloadMode::MetadataOnly);
        let full: PayloadMode =
            serde_cbor::from_slice(&serde_cbor::to_vec(&"full").unwrap()).unwrap();
        assert_eq!(full, PayloadMode::Full);
    }
}
