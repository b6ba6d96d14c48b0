//! Memory primitives: page allocation and the staged-image arena.
//!
//! The loader never writes through raw addresses. Firmware pages are wrapped
//! in a [`PageRegion`] once, right after allocation, and every later copy,
//! zero-fill or fixup goes through an offset that is checked against the
//! region's extent first.

use core::ops::Range;
use core::ptr::NonNull;

use crate::error::{BootResult, FormatError};

pub const PAGE_SIZE: usize = 4096;

/// Pages needed to hold `bytes`.
#[inline]
pub const fn pages_for(bytes: u64) -> usize {
    bytes.div_ceil(PAGE_SIZE as u64) as usize
}

/// Source of physical pages for the kernel image.
pub trait PageAllocator {
    /// Allocate `count` contiguous pages, at `preferred` if the allocator can
    /// manage it and anywhere otherwise. The region's contents are undefined.
    fn allocate_pages(&mut self, preferred: u64, count: usize) -> BootResult<PageRegion>;
}

/// A run of physical pages addressed by offset from its base.
///
/// The region owns its pages for the loader's lifetime. It is never freed:
/// after the jump the memory belongs to the kernel.
pub struct PageRegion {
    base: u64,
    bytes: &'static mut [u8],
}

impl PageRegion {
    /// Wrap memory the firmware just handed out.
    ///
    /// # Safety
    /// `base` must be the identity-mapped address of `page_count` pages that
    /// nothing else references for the rest of the loader's life.
    pub unsafe fn from_raw(base: u64, page_count: usize) -> Self {
        let bytes = core::slice::from_raw_parts_mut(base as usize as *mut u8, page_count * PAGE_SIZE);
        Self { base, bytes }
    }

    /// Wrap host memory that stands in for physical pages at `base`.
    /// `bytes.len()` must be a whole number of pages.
    pub fn from_static(base: u64, bytes: &'static mut [u8]) -> Self {
        debug_assert_eq!(bytes.len() % PAGE_SIZE, 0);
        Self { base, bytes }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn page_count(&self) -> usize {
        self.bytes.len() / PAGE_SIZE
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn check(&self, offset: usize, len: usize) -> BootResult<Range<usize>> {
        let extent = self.bytes.len();
        match offset.checked_add(len) {
            Some(end) if end <= extent => Ok(offset..end),
            _ => Err(FormatError::OutOfBounds { offset, len, extent }.into()),
        }
    }

    pub fn zero(&mut self) {
        self.bytes.fill(0);
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) -> BootResult<()> {
        let range = self.check(offset, data.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    pub fn bytes(&self, offset: usize, len: usize) -> BootResult<&[u8]> {
        let range = self.check(offset, len)?;
        Ok(&self.bytes[range])
    }

    /// Checked window for reading file bytes straight into place.
    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> BootResult<&mut [u8]> {
        let range = self.check(offset, len)?;
        Ok(&mut self.bytes[range])
    }

    pub fn read_u16(&self, offset: usize) -> BootResult<u16> {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(self.bytes(offset, 2)?);
        Ok(u16::from_le_bytes(raw))
    }

    pub fn read_u32(&self, offset: usize) -> BootResult<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.bytes(offset, 4)?);
        Ok(u32::from_le_bytes(raw))
    }

    pub fn read_u64(&self, offset: usize) -> BootResult<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.bytes(offset, 8)?);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) -> BootResult<()> {
        self.write(offset, &value.to_le_bytes())
    }
}

impl core::fmt::Debug for PageRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageRegion")
            .field("base", &format_args!("{:#x}", self.base))
            .field("pages", &self.page_count())
            .finish()
    }
}

/// Firmware pool allocation that must survive ExitBootServices.
///
/// Pool memory is at least 8-byte aligned, which is what the boot
/// environment and memory descriptors need.
pub struct PoolBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

impl PoolBuffer {
    /// # Safety
    /// `ptr` must point at `len` writable bytes, 8-byte aligned, owned by
    /// this buffer until it is handed back to the pool or to the kernel.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn address(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: exclusive ownership per `from_raw_parts`.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}
