//! Seekable byte sources the image is read from.

use crate::error::{BootResult, IoError};

/// Minimal file interface the parser and loader drive.
///
/// Firmware errors are returned verbatim; nothing here retries.
pub trait ImageSource {
    fn set_position(&mut self, offset: u64) -> BootResult<()>;

    fn position(&self) -> u64;

    /// Read up to `buf.len()` bytes, returning how many were read.
    /// Zero means end of file.
    fn read(&mut self, buf: &mut [u8]) -> BootResult<usize>;

    /// Fill `buf` completely or fail with [`IoError::ShortRead`].
    fn read_exact(&mut self, buf: &mut [u8]) -> BootResult<()> {
        let offset = self.position();
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..])? {
                0 => {
                    return Err(IoError::ShortRead { offset, expected: buf.len(), read: filled }.into());
                }
                n => filled += n,
            }
        }
        Ok(())
    }
}

/// An image already sitting in memory.
pub struct SliceSource<'a> {
    bytes: &'a [u8],
    position: u64,
}

impl<'a> SliceSource<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }
}

impl ImageSource for SliceSource<'_> {
    fn set_position(&mut self, offset: u64) -> BootResult<()> {
        // Like firmware files, seeking past the end is allowed; reads then hit EOF.
        self.position = offset;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn read(&mut self, buf: &mut [u8]) -> BootResult<usize> {
        let start = usize::try_from(self.position).unwrap_or(usize::MAX).min(self.bytes.len());
        let n = buf.len().min(self.bytes.len() - start);
        buf[..n].copy_from_slice(&self.bytes[start..start + n]);
        self.position += n as u64;
        Ok(n)
    }
}
