//! Error types for GGUF container operations.

use thiserror::Error;

/// All errors that can occur when decoding or building a container.
///
/// Decode errors carry the byte offset at which the problem was detected,
/// available through [`Error::offset`].
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from an underlying reader/writer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Input ended before a complete value could be read.
    #[error("Truncated input at offset {offset}: needed {needed} bytes, {available} available")]
    Truncated {
        offset: u64,
        needed: u64,
        available: u64,
    },

    /// Invalid magic number in the file header.
    #[error("Invalid magic number. Expected 'GGUF', found {found:?}")]
    BadMagic { found: Vec<u8> },

    /// Version is not one this implementation understands.
    #[error("Unsupported GGUF version: {version} (expected 2 or 3)")]
    UnsupportedVersion { version: u32 },

    /// Unrecognized metadata type tag or tensor element type.
    #[error("Unknown type tag {tag} at offset {offset}")]
    UnknownType { tag: u32, offset: u64 },

    /// Metadata key appears more than once. `offset` is set when decoding.
    #[error("Duplicate metadata key '{key}'")]
    DuplicateKey { key: String, offset: Option<u64> },

    /// Tensor name appears more than once. `offset` is set when decoding.
    #[error("Duplicate tensor name '{name}'")]
    DuplicateTensorName { name: String, offset: Option<u64> },

    /// Accessor type does not match the stored value type.
    #[error("Type mismatch for key '{key}': expected '{expected}', found '{found}'")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    /// Tensor offsets are misaligned, overlapping or out of range.
    #[error("Corrupt layout at offset {offset}: {reason}")]
    CorruptLayout { offset: u64, reason: String },

    /// Declared length exceeds the configured allocation ceiling.
    #[error("Declared length {requested} at offset {offset} exceeds limit of {limit} bytes")]
    AllocationTooLarge {
        requested: u64,
        limit: u64,
        offset: u64,
    },

    /// A decoded value is malformed (bad UTF-8, bool outside 0/1).
    #[error("Invalid value at offset {offset}: {reason}")]
    InvalidValue { offset: u64, reason: String },

    /// Builder tensor would start before the end of the previous one.
    #[error("Tensor '{name}' offset {offset} precedes end of previous tensor ({previous_end})")]
    NonMonotonicOffset {
        name: String,
        offset: u64,
        previous_end: u64,
    },

    /// Alignment is not a power of two.
    #[error("Alignment {alignment} is not a power of two")]
    InvalidAlignment { alignment: u64 },

    /// Builder arguments describe an invalid tensor.
    #[error("Invalid tensor '{name}': {reason}")]
    InvalidDescriptor { name: String, reason: String },

    /// Requested tensor not present in the table.
    #[error("Tensor not found: {0}")]
    TensorNotFound(String),
}

impl Error {
    /// Byte offset in the input at which a decode error was detected.
    ///
    /// Returns `None` for builder and I/O errors, which are not tied to a
    /// position in an input buffer.
    pub fn offset(&self) -> Option<u64> {
        match self {
            Error::Truncated { offset, .. }
            | Error::UnknownType { offset, .. }
            | Error::CorruptLayout { offset, .. }
            | Error::AllocationTooLarge { offset, .. }
            | Error::InvalidValue { offset, .. } => Some(*offset),
            Error::DuplicateKey { offset, .. } | Error::DuplicateTensorName { offset, .. } => *offset,
            Error::BadMagic { .. } => Some(0),
            Error::UnsupportedVersion { .. } => Some(4),
            _ => None,
        }
    }

    pub(crate) fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        Error::CorruptLayout {
            offset,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_descriptor(name: &str, reason: impl Into<String>) -> Self {
        Error::InvalidDescriptor {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
