//! Type tables: metadata value tags and tensor element types.
//!
//! Element types mirror the GGML type ids. Block-quantized types store a
//! fixed number of bytes per block of elements, so their byte size is
//! `ceil(count / block_size) * type_size`, not `count * per_element_bytes`.

use half::{bf16, f16};

use crate::error::{Error, Result};

/// Metadata value type tag as stored on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TypeTag {
    UInt8 = 0,
    Int8 = 1,
    UInt16 = 2,
    Int16 = 3,
    UInt32 = 4,
    Int32 = 5,
    Float32 = 6,
    Bool = 7,
    String = 8,
    Array = 9,
    UInt64 = 10,
    Int64 = 11,
    Float64 = 12,
}

impl TypeTag {
    /// Parses a wire tag; `offset` is where the tag was read.
    pub fn from_u32(tag: u32, offset: u64) -> Result<Self> {
        Ok(match tag {
            0 => TypeTag::UInt8,
            1 => TypeTag::Int8,
            2 => TypeTag::UInt16,
            3 => TypeTag::Int16,
            4 => TypeTag::UInt32,
            5 => TypeTag::Int32,
            6 => TypeTag::Float32,
            7 => TypeTag::Bool,
            8 => TypeTag::String,
            9 => TypeTag::Array,
            10 => TypeTag::UInt64,
            11 => TypeTag::Int64,
            12 => TypeTag::Float64,
            _ => return Err(Error::UnknownType { tag, offset }),
        })
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Encoded width of a scalar of this type; `None` for String and Array,
    /// whose width depends on the value.
    pub const fn fixed_width(self) -> Option<u64> {
        match self {
            TypeTag::UInt8 | TypeTag::Int8 | TypeTag::Bool => Some(1),
            TypeTag::UInt16 | TypeTag::Int16 => Some(2),
            TypeTag::UInt32 | TypeTag::Int32 | TypeTag::Float32 => Some(4),
            TypeTag::UInt64 | TypeTag::Int64 | TypeTag::Float64 => Some(8),
            TypeTag::String | TypeTag::Array => None,
        }
    }

    /// Smallest number of bytes one value of this type can occupy.
    pub const fn min_width(self) -> u64 {
        match self.fixed_width() {
            Some(w) => w,
            // u64 string length; u32 tag + u64 count
            None => match self {
                TypeTag::String => 8,
                _ => 12,
            },
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            TypeTag::UInt8 => "u8",
            TypeTag::Int8 => "i8",
            TypeTag::UInt16 => "u16",
            TypeTag::Int16 => "i16",
            TypeTag::UInt32 => "u32",
            TypeTag::Int32 => "i32",
            TypeTag::Float32 => "f32",
            TypeTag::Bool => "bool",
            TypeTag::String => "str",
            TypeTag::Array => "arr",
            TypeTag::UInt64 => "u64",
            TypeTag::Int64 => "i64",
            TypeTag::Float64 => "f64",
        }
    }
}

/// Tensor element type, numbered as in GGML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
#[allow(non_camel_case_types)]
pub enum ElementType {
    F32 = 0,
    F16 = 1,
    Q4_0 = 2,
    Q4_1 = 3,
    Q5_0 = 6,
    Q5_1 = 7,
    Q8_0 = 8,
    Q8_1 = 9,
    Q2_K = 10,
    Q3_K = 11,
    Q4_K = 12,
    Q5_K = 13,
    Q6_K = 14,
    Q8_K = 15,
    IQ2_XXS = 16,
    IQ2_XS = 17,
    IQ3_XXS = 18,
    IQ1_S = 19,
    IQ4_NL = 20,
    IQ3_S = 21,
    IQ2_S = 22,
    IQ4_XS = 23,
    I8 = 24,
    I16 = 25,
    I32 = 26,
    I64 = 27,
    F64 = 28,
    IQ1_M = 29,
    BF16 = 30,
    TQ1_0 = 34,
    TQ2_0 = 35,
}

/// (block_size_elements, bytes_per_block, name)
type TypeInfo = (u64, u64, &'static str);

impl ElementType {
    pub const ALL: [ElementType; 31] = [
        ElementType::F32,
        ElementType::F16,
        ElementType::Q4_0,
        ElementType::Q4_1,
        ElementType::Q5_0,
        ElementType::Q5_1,
        ElementType::Q8_0,
        ElementType::Q8_1,
        ElementType::Q2_K,
        ElementType::Q3_K,
        ElementType::Q4_K,
        ElementType::Q5_K,
        ElementType::Q6_K,
        ElementType::Q8_K,
        ElementType::IQ2_XXS,
        ElementType::IQ2_XS,
        ElementType::IQ3_XXS,
        ElementType::IQ1_S,
        ElementType::IQ4_NL,
        ElementType::IQ3_S,
        ElementType::IQ2_S,
        ElementType::IQ4_XS,
        ElementType::I8,
        ElementType::I16,
        ElementType::I32,
        ElementType::I64,
        ElementType::F64,
        ElementType::IQ1_M,
        ElementType::BF16,
        ElementType::TQ1_0,
        ElementType::TQ2_0,
    ];

    /// Parses a wire element type id; `offset` is where the id was read.
    pub fn from_u32(id: u32, offset: u64) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_u32() == id)
            .ok_or(Error::UnknownType { tag: id, offset })
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    const fn info(self) -> TypeInfo {
        match self {
            // Standard types
            ElementType::F32 => (1, 4, "f32"),
            ElementType::F16 => (1, 2, "f16"),
            ElementType::BF16 => (1, 2, "bf16"),
            ElementType::F64 => (1, 8, "f64"),
            ElementType::I8 => (1, 1, "i8"),
            ElementType::I16 => (1, 2, "i16"),
            ElementType::I32 => (1, 4, "i32"),
            ElementType::I64 => (1, 8, "i64"),
            // Quantized types
            ElementType::Q4_0 => (32, 18, "q4_0"),
            ElementType::Q4_1 => (32, 20, "q4_1"),
            ElementType::Q5_0 => (32, 22, "q5_0"),
            ElementType::Q5_1 => (32, 24, "q5_1"),
            ElementType::Q8_0 => (32, 34, "q8_0"),
            ElementType::Q8_1 => (32, 36, "q8_1"),
            ElementType::Q2_K => (256, 84, "q2_K"),
            ElementType::Q3_K => (256, 110, "q3_K"),
            ElementType::Q4_K => (256, 144, "q4_K"),
            ElementType::Q5_K => (256, 176, "q5_K"),
            ElementType::Q6_K => (256, 210, "q6_K"),
            ElementType::Q8_K => (256, 292, "q8_K"),
            ElementType::IQ2_XXS => (256, 66, "iq2_xxs"),
            ElementType::IQ2_XS => (256, 74, "iq2_xs"),
            ElementType::IQ3_XXS => (256, 98, "iq3_xxs"),
            ElementType::IQ1_S => (256, 50, "iq1_s"),
            ElementType::IQ4_NL => (32, 18, "iq4_nl"),
            ElementType::IQ3_S => (256, 110, "iq3_s"),
            ElementType::IQ2_S => (256, 82, "iq2_s"),
            ElementType::IQ4_XS => (256, 136, "iq4_xs"),
            ElementType::IQ1_M => (256, 56, "iq1_m"),
            ElementType::TQ1_0 => (256, 54, "tq1_0"),
            ElementType::TQ2_0 => (256, 66, "tq2_0"),
        }
    }

    /// Number of elements per storage block (1 for non-quantized types).
    #[inline]
    pub const fn block_size(self) -> u64 {
        self.info().0
    }

    /// Bytes per storage block.
    #[inline]
    pub const fn type_size(self) -> u64 {
        self.info().1
    }

    #[inline]
    pub const fn name(self) -> &'static str {
        self.info().2
    }

    #[inline]
    pub const fn is_quantized(self) -> bool {
        self.block_size() > 1
    }

    /// Byte size of a tensor with `shape`, or `None` on arithmetic overflow.
    ///
    /// An empty shape describes a scalar (one element).
    pub fn byte_size(self, shape: &[u64]) -> Option<u64> {
        let count = shape.iter().try_fold(1u64, |acc, &d| acc.checked_mul(d))?;
        count
            .div_ceil(self.block_size())
            .checked_mul(self.type_size())
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Rust types that can be read out of a tensor payload.
pub trait TensorElement: bytemuck::Pod {
    const ELEMENT_TYPE: ElementType;
}

macro_rules! impl_tensor_element {
    ($t:ty, $e:path) => {
        impl TensorElement for $t {
            const ELEMENT_TYPE: ElementType = $e;
        }
    };
}

impl_tensor_element!(f32, ElementType::F32);
impl_tensor_element!(f64, ElementType::F64);
impl_tensor_element!(f16, ElementType::F16);
impl_tensor_element!(bf16, ElementType::BF16);
impl_tensor_element!(i8, ElementType::I8);
impl_tensor_element!(i16, ElementType::I16);
impl_tensor_element!(i32, ElementType::I32);
impl_tensor_element!(i64, ElementType::I64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_type_info() {
        let t = ElementType::from_u32(0, 0).unwrap();
        assert_eq!((t.block_size(), t.type_size(), t.name()), (1, 4, "f32"));

        let t = ElementType::from_u32(2, 0).unwrap();
        assert_eq!((t.block_size(), t.type_size(), t.name()), (32, 18, "q4_0"));

        // Ids 4 and 5 were retired upstream
        assert!(matches!(
            ElementType::from_u32(4, 12),
            Err(Error::UnknownType { tag: 4, offset: 12 })
        ));
        assert!(ElementType::from_u32(255, 0).is_err());
    }

    #[test]
    fn test_ids_round_trip() {
        for t in ElementType::ALL {
            assert_eq!(ElementType::from_u32(t.as_u32(), 0).unwrap(), t);
        }
    }

    #[test]
    fn test_byte_size() {
        // F32: 1024 elements × 4 bytes
        assert_eq!(ElementType::F32.byte_size(&[1024]), Some(4096));
        assert_eq!(ElementType::F16.byte_size(&[32, 32]), Some(2048));
        // Q4_0: 1024 / 32 blocks × 18 bytes
        assert_eq!(ElementType::Q4_0.byte_size(&[1024]), Some(576));
        assert_eq!(ElementType::Q8_0.byte_size(&[1024]), Some(1088));
        assert_eq!(ElementType::Q4_K.byte_size(&[256, 2]), Some(288));
        // Partial blocks round up
        assert_eq!(ElementType::Q8_0.byte_size(&[33]), Some(68));
        assert_eq!(ElementType::F32.byte_size(&[]), Some(4));
        assert_eq!(ElementType::F64.byte_size(&[u64::MAX, 2]), None);
        assert_eq!(ElementType::F64.byte_size(&[u64::MAX]), None);
    }

    #[test]
    fn test_type_tag() {
        assert_eq!(TypeTag::from_u32(8, 0).unwrap(), TypeTag::String);
        assert_eq!(TypeTag::from_u32(12, 0).unwrap(), TypeTag::Float64);
        assert!(matches!(
            TypeTag::from_u32(13, 40),
            Err(Error::UnknownType { tag: 13, offset: 40 })
        ));
        assert_eq!(TypeTag::Bool.fixed_width(), Some(1));
        assert_eq!(TypeTag::String.fixed_width(), None);
        assert_eq!(TypeTag::Array.min_width(), 12);
    }
}
