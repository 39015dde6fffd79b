//! Bounds-checked cursor over untrusted input.

use std::io::Write;

use crate::error::{Error, Result};

/// Cursor over a byte slice for sequential parsing.
///
/// No read ever advances past the end of the slice; a short read fails with
/// [`Error::Truncated`] and leaves the position unchanged.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current read position.
    #[inline]
    pub fn position(&self) -> u64 {
        self.pos as u64
    }

    /// Total length of the underlying input.
    #[inline]
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes left between the current position and the end of input.
    #[inline]
    pub fn remaining(&self) -> u64 {
        (self.data.len() - self.pos) as u64
    }

    fn truncated(&self, needed: u64) -> Error {
        Error::Truncated {
            offset: self.position(),
            needed,
            available: self.remaining(),
        }
    }

    /// Ensures at least `n` bytes remain without consuming them.
    pub fn require(&self, n: u64) -> Result<()> {
        if n > self.remaining() {
            return Err(self.truncated(n));
        }
        Ok(())
    }

    /// Returns the next `n` bytes without advancing.
    pub fn peek(&self, n: u64) -> Result<&'a [u8]> {
        self.require(n)?;
        // `require` bounds n by remaining(), which fits in usize.
        let end = self.pos + n as usize;
        Ok(&self.data[self.pos..end])
    }

    /// Reads exactly `n` bytes.
    pub fn read_exact(&mut self, n: u64) -> Result<&'a [u8]> {
        let slice = self.peek(n)?;
        self.pos += slice.len();
        Ok(slice)
    }

    /// Reads a fixed-size array.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.read_exact(N as u64)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    /// Moves to an absolute position within `[0, len]`.
    pub fn seek(&mut self, pos: u64) -> Result<()> {
        if pos > self.len() {
            return Err(Error::Truncated {
                offset: pos,
                needed: pos - self.len(),
                available: 0,
            });
        }
        self.pos = pos as usize;
        Ok(())
    }
}

/// Write-side counterpart of [`ByteCursor`]: every write is all-or-error and
/// the number of bytes emitted is tracked for padding computations.
pub struct ByteSink<W: Write> {
    inner: W,
    written: u64,
}

impl<W: Write> ByteSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    /// Bytes emitted so far.
    #[inline]
    pub fn position(&self) -> u64 {
        self.written
    }

    pub fn write_exact(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(bytes)?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    /// Writes `n` zero bytes.
    pub fn write_zeros(&mut self, mut n: u64) -> std::io::Result<()> {
        const ZERO_PAD: [u8; 64] = [0u8; 64];
        while n > 0 {
            let chunk = n.min(ZERO_PAD.len() as u64) as usize;
            self.write_exact(&ZERO_PAD[..chunk])?;
            n -= chunk as u64;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for ByteSink<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_exact(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_exact_does_not_advance_on_failure() {
        let data = [1u8, 2, 3];
        let mut cursor = ByteCursor::new(&data);
        assert_eq!(cursor.read_exact(2).unwrap(), &[1, 2]);
        match cursor.read_exact(2) {
            Err(Error::Truncated {
                offset,
                needed,
                available,
            }) => {
                assert_eq!((offset, needed, available), (2, 2, 1));
            }
            other => panic!("expected Truncated, got {:?}", other),
        }
        assert_eq!(cursor.position(), 2);
        assert_eq!(cursor.read_exact(1).unwrap(), &[3]);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_huge_length_is_truncated() {
        let data = [0u8; 8];
        let mut cursor = ByteCursor::new(&data);
        assert!(matches!(
            cursor.read_exact(u64::MAX),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn test_peek_and_seek() {
        let data = [9u8, 8, 7, 6];
        let mut cursor = ByteCursor::new(&data);
        assert_eq!(cursor.peek(2).unwrap(), &[9, 8]);
        assert_eq!(cursor.position(), 0);
        cursor.seek(4).unwrap();
        assert_eq!(cursor.remaining(), 0);
        assert!(cursor.seek(5).is_err());
        assert_eq!(cursor.position(), 4);
    }

    #[test]
    fn test_sink_counts_and_pads() {
        let mut sink = ByteSink::new(Vec::new());
        sink.write_exact(b"abc").unwrap();
        sink.write_zeros(70).unwrap();
        assert_eq!(sink.position(), 73);
        let out = sink.into_inner();
        assert_eq!(&out[..3], b"abc");
        assert!(out[3..].iter().all(|&b| b == 0));
    }
}
