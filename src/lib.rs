//! Reader and writer for the GGUF model container format.
//!
//! A container holds a typed key/value metadata dictionary, a table of tensor
//! descriptors and an aligned payload region. [`ContainerReader`] decodes
//! untrusted input without ever reading or allocating past what the input
//! and the configured ceiling allow; [`ContainerWriter`] produces files that
//! decode back to an equal container.
//!
//! The wire layout is GGUF's: the tensor count and the KV count both sit in
//! the fixed 24-byte header (`magic, version, n_tensors, n_kv`), ahead of the
//! KV entries and tensor descriptors, so files interoperate with GGML tooling.
//!
//! ```no_run
//! use gguf_container::{Container, ContainerReader, ContainerWriter, ElementType, PayloadMode};
//!
//! let mut c = Container::new();
//! c.set_value("general.architecture", "llama")?;
//! c.add_tensor("token_embd.weight", ElementType::F32, &[2], &[0u8; 8])?;
//! ContainerWriter::new(PayloadMode::Full).write_file(&c, "model.gguf")?;
//!
//! let decoded = ContainerReader::default().open("model.gguf")?;
//! assert_eq!(decoded, c);
//! # Ok::<(), gguf_container::Error>(())
//! ```

pub mod codec;
pub mod container;
pub mod cursor;
pub mod error;
pub mod metadata;
pub mod reader;
pub mod tensor;
pub mod types;
pub mod utils;
pub mod writer;

pub use container::{
    Container, DEFAULT_ALIGNMENT, GGUF_MAGIC, GGUF_VERSION, HEADER_SIZE, TensorView,
};
pub use error::{Error, Result};
pub use metadata::{ALIGNMENT_KEY, ARCHITECTURE_KEY, Metadata, MetadataArray, MetadataEntry, MetadataValue};
pub use reader::{ContainerReader, DEFAULT_MAX_ALLOC, ReadMode, ReadOptions, ReadState};
pub use tensor::{MAX_DIMS, MAX_NAME_LEN, TensorDescriptor, TensorTable};
pub use types::{ElementType, TensorElement, TypeTag};
pub use writer::{ContainerWriter, PayloadMode};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_empty() -> Result<()> {
        let c = Container::new();
        let bytes = ContainerWriter::default().write(&c);
        assert_eq!(bytes.len() as u64, c.data_offset());
        assert_eq!(&bytes[..4], GGUF_MAGIC);

        let decoded = ContainerReader::default().read(&bytes)?;
        assert!(decoded.metadata().is_empty());
        assert!(decoded.tensors().is_empty());
        assert_eq!(decoded.payload(), Some(&[][..]));
        Ok(())
    }

    #[test]
    fn test_counts_share_the_fixed_header() -> Result<()> {
        let mut c = Container::new();
        c.set_value("a", 1u8)?;
        c.set_value("b", 2u8)?;
        c.declare_tensor("t", ElementType::I8, &[1])?;
        let bytes = ContainerWriter::new(PayloadMode::MetadataOnly).write(&c);
        assert_eq!(&bytes[8..16], &1u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &2u64.to_le_bytes());
        // first KV entry follows the header: key "a"
        assert_eq!(&bytes[24..32], &1u64.to_le_bytes());
        assert_eq!(bytes[32], b'a');
        Ok(())
    }

    #[test]
    fn test_write_read_typed_tensor() -> Result<()> {
        let values = [1.0f32, -2.5, 3.25, 4.0];
        let mut c = Container::new();
        c.set_value(ARCHITECTURE_KEY, "llama")?;
        c.add_tensor(
            "blk.0.attn_q.weight",
            ElementType::F32,
            &[2, 2],
            bytemuck::cast_slice(&values),
        )?;

        let bytes = ContainerWriter::default().write(&c);
        let decoded = ContainerReader::default().read(&bytes)?;
        assert_eq!(decoded.metadata().get_str(ARCHITECTURE_KEY)?, Some("llama"));
        let back: Vec<f32> = decoded.read_as("blk.0.attn_q.weight")?.unwrap_or_default();
        assert_eq!(back, values);

        let view = decoded.lookup_tensor("blk.0.attn_q.weight").unwrap();
        assert_eq!(view.shape, &[2, 2]);
        assert_eq!(view.byte_range, 0..16);
        Ok(())
    }

    #[test]
    fn test_f16_tensor() -> Result<()> {
        let values: Vec<half::f16> = [0.5f32, 1.5].iter().map(|&v| half::f16::from_f32(v)).collect();
        let mut c = Container::new();
        c.add_tensor("h", ElementType::F16, &[2], bytemuck::cast_slice(&values))?;
        let decoded = ContainerReader::default().read(&ContainerWriter::default().write(&c))?;
        let back: Vec<half::f16> = decoded.read_as("h")?.unwrap_or_default();
        assert_eq!(back, values);
        assert!(matches!(
            decoded.read_as::<f32>("h"),
            Err(Error::TypeMismatch { .. })
        ));
        Ok(())
    }
}
