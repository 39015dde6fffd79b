//! Primitive encode/decode rules shared by metadata and tensor records.
//!
//! All integers and floats are little-endian. Strings are a `u64` byte length
//! followed by UTF-8 bytes; arrays are a `u32` element tag, a `u64` count and
//! the elements. Declared lengths are checked against the remaining input and
//! the allocation ceiling before anything is allocated.

use std::io::Write;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::cursor::ByteCursor;
use crate::error::{Error, Result};
use crate::metadata::{MetadataArray, MetadataValue};
use crate::types::TypeTag;

/// Upper bound on memory reserved up front for a declared count; anything
/// beyond it grows as items actually decode.
const MAX_PREALLOC_BYTES: u64 = 256 * 1024;

/// Sequential decoder over untrusted input.
pub struct Decoder<'a> {
    cursor: ByteCursor<'a>,
    max_alloc: u64,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8], max_alloc: u64) -> Self {
        Self {
            cursor: ByteCursor::new(data),
            max_alloc,
        }
    }

    #[inline]
    pub fn position(&self) -> u64 {
        self.cursor.position()
    }

    pub fn cursor(&self) -> &ByteCursor<'a> {
        &self.cursor
    }

    pub fn read_bytes(&mut self, n: u64) -> Result<&'a [u8]> {
        self.cursor.read_exact(n)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.cursor.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.cursor.read_exact(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.cursor.read_exact(4)?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.cursor.read_exact(8)?))
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(LittleEndian::read_i16(self.cursor.read_exact(2)?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(LittleEndian::read_i32(self.cursor.read_exact(4)?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(LittleEndian::read_i64(self.cursor.read_exact(8)?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(LittleEndian::read_f32(self.cursor.read_exact(4)?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(LittleEndian::read_f64(self.cursor.read_exact(8)?))
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        let offset = self.position();
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(Error::InvalidValue {
                offset,
                reason: format!("bool byte must be 0 or 1, found {}", b),
            }),
        }
    }

    /// Validates a declared element count before it is used to allocate.
    ///
    /// `unit` is the minimum encoded width of one element. The check against
    /// the remaining input comes first, so a length that cannot possibly be
    /// satisfied is reported as truncation.
    pub fn check_declared(&self, count: u64, unit: u64, offset: u64) -> Result<()> {
        let needed = count.checked_mul(unit).unwrap_or(u64::MAX);
        if needed > self.cursor.remaining() {
            return Err(Error::Truncated {
                offset,
                needed,
                available: self.cursor.remaining(),
            });
        }
        if needed > self.max_alloc {
            return Err(Error::AllocationTooLarge {
                requested: needed,
                limit: self.max_alloc,
                offset,
            });
        }
        Ok(())
    }

    /// Initial capacity for `count` decoded items of `T`, bounded by the
    /// allocation ceiling and a fixed reservation cap.
    pub fn capacity_for<T>(&self, count: u64) -> usize {
        let width = std::mem::size_of::<T>().max(1) as u64;
        let budget = self.max_alloc.min(MAX_PREALLOC_BYTES);
        count.min(budget / width) as usize
    }

    pub fn read_string(&mut self) -> Result<String> {
        let offset = self.position();
        let len = self.read_u64()?;
        self.check_declared(len, 1, offset)?;
        let data_offset = self.position();
        let bytes = self.cursor.read_exact(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::InvalidValue {
            offset: data_offset,
            reason: format!("invalid UTF-8 in string: {}", e),
        })
    }

    pub fn read_tag(&mut self) -> Result<TypeTag> {
        let offset = self.position();
        TypeTag::from_u32(self.read_u32()?, offset)
    }

    /// Reads a value whose tag has already been consumed.
    pub fn read_value(&mut self, tag: TypeTag) -> Result<MetadataValue> {
        Ok(match tag {
            TypeTag::UInt8 => MetadataValue::U8(self.read_u8()?),
            TypeTag::Int8 => MetadataValue::I8(self.read_i8()?),
            TypeTag::UInt16 => MetadataValue::U16(self.read_u16()?),
            TypeTag::Int16 => MetadataValue::I16(self.read_i16()?),
            TypeTag::UInt32 => MetadataValue::U32(self.read_u32()?),
            TypeTag::Int32 => MetadataValue::I32(self.read_i32()?),
            TypeTag::Float32 => MetadataValue::F32(self.read_f32()?),
            TypeTag::Bool => MetadataValue::Bool(self.read_bool()?),
            TypeTag::String => MetadataValue::String(self.read_string()?),
            TypeTag::UInt64 => MetadataValue::U64(self.read_u64()?),
            TypeTag::Int64 => MetadataValue::I64(self.read_i64()?),
            TypeTag::Float64 => MetadataValue::F64(self.read_f64()?),
            TypeTag::Array => MetadataValue::Array(self.read_array()?),
        })
    }

    fn read_n<T>(&mut self, count: u64, mut read: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        let mut out = Vec::with_capacity(self.capacity_for::<T>(count));
        for _ in 0..count {
            out.push(read(self)?);
        }
        Ok(out)
    }

    pub fn read_array(&mut self) -> Result<MetadataArray> {
        let tag_offset = self.position();
        let elem = self.read_tag()?;
        if elem == TypeTag::Array {
            return Err(Error::UnknownType {
                tag: elem.as_u32(),
                offset: tag_offset,
            });
        }
        let count_offset = self.position();
        let count = self.read_u64()?;
        self.check_declared(count, elem.min_width(), count_offset)?;

        Ok(match elem {
            TypeTag::UInt8 => MetadataArray::U8(self.read_n(count, Self::read_u8)?),
            TypeTag::Int8 => MetadataArray::I8(self.read_n(count, Self::read_i8)?),
            TypeTag::UInt16 => MetadataArray::U16(self.read_n(count, Self::read_u16)?),
            TypeTag::Int16 => MetadataArray::I16(self.read_n(count, Self::read_i16)?),
            TypeTag::UInt32 => MetadataArray::U32(self.read_n(count, Self::read_u32)?),
            TypeTag::Int32 => MetadataArray::I32(self.read_n(count, Self::read_i32)?),
            TypeTag::Float32 => MetadataArray::F32(self.read_n(count, Self::read_f32)?),
            TypeTag::Bool => MetadataArray::Bool(self.read_n(count, Self::read_bool)?),
            TypeTag::String => MetadataArray::String(self.read_n(count, Self::read_string)?),
            TypeTag::UInt64 => MetadataArray::U64(self.read_n(count, Self::read_u64)?),
            TypeTag::Int64 => MetadataArray::I64(self.read_n(count, Self::read_i64)?),
            TypeTag::Float64 => MetadataArray::F64(self.read_n(count, Self::read_f64)?),
            TypeTag::Array => unreachable!("nested arrays rejected above"),
        })
    }
}

// ---- Encoding ----

pub fn write_string<W: Write>(w: &mut W, s: &str) -> std::io::Result<()> {
    w.write_u64::<LittleEndian>(s.len() as u64)?;
    w.write_all(s.as_bytes())
}

fn write_array<W: Write>(w: &mut W, array: &MetadataArray) -> std::io::Result<()> {
    w.write_u32::<LittleEndian>(array.element_tag().as_u32())?;
    w.write_u64::<LittleEndian>(array.len() as u64)?;
    match array {
        MetadataArray::U8(v) => w.write_all(v)?,
        MetadataArray::I8(v) => v.iter().try_for_each(|&x| w.write_i8(x))?,
        MetadataArray::U16(v) => v.iter().try_for_each(|&x| w.write_u16::<LittleEndian>(x))?,
        MetadataArray::I16(v) => v.iter().try_for_each(|&x| w.write_i16::<LittleEndian>(x))?,
        MetadataArray::U32(v) => v.iter().try_for_each(|&x| w.write_u32::<LittleEndian>(x))?,
        MetadataArray::I32(v) => v.iter().try_for_each(|&x| w.write_i32::<LittleEndian>(x))?,
        MetadataArray::F32(v) => v.iter().try_for_each(|&x| w.write_f32::<LittleEndian>(x))?,
        MetadataArray::Bool(v) => v.iter().try_for_each(|&x| w.write_u8(x as u8))?,
        MetadataArray::String(v) => v.iter().try_for_each(|s| write_string(w, s))?,
        MetadataArray::U64(v) => v.iter().try_for_each(|&x| w.write_u64::<LittleEndian>(x))?,
        MetadataArray::I64(v) => v.iter().try_for_each(|&x| w.write_i64::<LittleEndian>(x))?,
        MetadataArray::F64(v) => v.iter().try_for_each(|&x| w.write_f64::<LittleEndian>(x))?,
    }
    Ok(())
}

/// Writes a value without its tag.
pub fn write_value<W: Write>(w: &mut W, value: &MetadataValue) -> std::io::Result<()> {
    match value {
        MetadataValue::U8(x) => w.write_u8(*x),
        MetadataValue::I8(x) => w.write_i8(*x),
        MetadataValue::U16(x) => w.write_u16::<LittleEndian>(*x),
        MetadataValue::I16(x) => w.write_i16::<LittleEndian>(*x),
        MetadataValue::U32(x) => w.write_u32::<LittleEndian>(*x),
        MetadataValue::I32(x) => w.write_i32::<LittleEndian>(*x),
        MetadataValue::F32(x) => w.write_f32::<LittleEndian>(*x),
        MetadataValue::Bool(x) => w.write_u8(*x as u8),
        MetadataValue::String(s) => write_string(w, s),
        MetadataValue::Array(a) => write_array(w, a),
        MetadataValue::U64(x) => w.write_u64::<LittleEndian>(*x),
        MetadataValue::I64(x) => w.write_i64::<LittleEndian>(*x),
        MetadataValue::F64(x) => w.write_f64::<LittleEndian>(*x),
    }
}

/// Writes a full key/value record: key, tag, value.
pub fn write_entry<W: Write>(w: &mut W, key: &str, value: &MetadataValue) -> std::io::Result<()> {
    write_string(w, key)?;
    w.write_u32::<LittleEndian>(value.tag().as_u32())?;
    write_value(w, value)
}

// ---- Encoded sizes ----

#[inline]
pub fn string_size(s: &str) -> u64 {
    8 + s.len() as u64
}

fn array_size(array: &MetadataArray) -> u64 {
    let body = match array {
        MetadataArray::String(v) => v.iter().map(|s| string_size(s)).sum::<u64>(),
        other => {
            // Every non-string element type has a fixed width.
            let width = other.element_tag().min_width();
            width * other.len() as u64
        }
    };
    4 + 8 + body
}

/// Encoded size of a value without its tag.
pub fn value_size(value: &MetadataValue) -> u64 {
    match value {
        MetadataValue::String(s) => string_size(s),
        MetadataValue::Array(a) => array_size(a),
        other => other.tag().min_width(),
    }
}

/// Encoded size of a key/value record.
pub fn entry_size(key: &str, value: &MetadataValue) -> u64 {
    string_size(key) + 4 + value_size(value)
}
