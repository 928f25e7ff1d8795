//! Append-only image output with a running byte cursor.

use crate::error::{BuildError, Region, Result};
use std::io::{self, Write};

const ZERO_CHUNK: [u8; 4096] = [0u8; 4096];

/// Sequential writer that tracks how many bytes have gone out.
///
/// The layout engine never seeks; every offset check is made against
/// [`ImageWriter::position`].
pub struct ImageWriter<W: Write> {
    inner: W,
    position: u64,
}

impl<W: Write> ImageWriter<W> {
    pub fn new(inner: W) -> Self {
        ImageWriter { inner, position: 0 }
    }

    /// Bytes written so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data)?;
        self.position += data.len() as u64;
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> io::Result<()> {
        self.write_bytes(&[value])
    }

    pub fn write_u32_le(&mut self, value: u32) -> io::Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Write `s` into a `width`-byte field: truncated if longer, zero padded
    /// if shorter.
    pub fn write_fixed_str(&mut self, s: &str, width: usize) -> io::Result<()> {
        let bytes = s.as_bytes();
        let len = bytes.len().min(width);
        self.write_bytes(&bytes[..len])?;
        self.write_zeros((width - len) as u64)
    }

    pub fn write_zeros(&mut self, mut count: u64) -> io::Result<()> {
        while count > 0 {
            let n = count.min(ZERO_CHUNK.len() as u64) as usize;
            self.write_bytes(&ZERO_CHUNK[..n])?;
            count -= n as u64;
        }
        Ok(())
    }

    /// Zero-fill up to `offset` and return the number of padding bytes.
    ///
    /// Fails with `CapacityExceeded` for `region` if the cursor is already
    /// past `offset`.
    pub fn pad_to(&mut self, offset: u64, region: Region) -> Result<u64> {
        let Some(pad) = offset.checked_sub(self.position) else {
            return Err(BuildError::CapacityExceeded {
                region,
                required: self.position,
                available: offset,
            });
        };
        self.write_zeros(pad)?;
        Ok(pad)
    }

    /// Flush and hand back the underlying writer.
    pub fn into_inner(mut self) -> io::Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}
