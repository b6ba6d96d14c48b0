//! Host-side fixtures shared by the unit tests.

use alloc::vec;
use alloc::vec::Vec;
use core::ptr::NonNull;

use cobalt_bootinfo::ConfigurationTables;
use zerocopy::{AsBytes, FromZeroes};

use crate::error::{BootError, BootResult, FirmwareStatus, IoError};
use crate::handoff::{BootFirmware, ExitRejection, MapFetch, MapFetchError};
use crate::memory::{PageAllocator, PageRegion, PoolBuffer, PAGE_SIZE};
use crate::pe::{
    ImageCharacteristics, RawDataDirectory, RawFileHeader, RawLegacyHeader, RawOptionalHeader64,
    RawSectionHeader, SectionFlags, DATA_DIRECTORY_COUNT, LEGACY_MAGIC, MACHINE_AMD64, PE32_PLUS_MAGIC,
    PE_SIGNATURE, SUBSYSTEM_EFI_APPLICATION,
};
use crate::source::ImageSource;

/// Page-aligned host memory that lives for the rest of the test binary.
pub fn leak_pages(count: usize, fill: u8) -> &'static mut [u8] {
    #[repr(C, align(4096))]
    struct Page([u8; PAGE_SIZE]);

    let pages = (0..count).map(|_| Page([fill; PAGE_SIZE])).collect::<Vec<_>>().leak();
    // SAFETY: `Page` is plain bytes with no padding.
    unsafe { core::slice::from_raw_parts_mut(pages.as_mut_ptr().cast::<u8>(), count * PAGE_SIZE) }
}

/// One base relocation block: header followed by `entries`.
pub fn reloc_block(page_rva: u32, entries: &[u16]) -> Vec<u8> {
    let size = 8 + 2 * entries.len() as u32;
    let mut block = Vec::with_capacity(size as usize);
    block.extend(page_rva.to_le_bytes());
    block.extend(size.to_le_bytes());
    for entry in entries {
        block.extend(entry.to_le_bytes());
    }
    block
}

/* ---------- synthetic PE32+ images ---------- */

const NEW_HEADER_OFFSET: u32 = 0x80;
const SIZE_OF_HEADERS: u32 = 0x400;
const FILE_ALIGNMENT: u32 = 0x200;
const SECTION_ALIGNMENT: u32 = 0x1000;

struct SectionDraft {
    name: [u8; 8],
    virtual_address: u32,
    virtual_size: u32,
    data: Vec<u8>,
}

/// Builds minimal PE32+ EFI application images.
///
/// Headers occupy the first 0x400 bytes; section data follows, each
/// section starting on a 0x200 file boundary in the order added.
pub struct ImageBuilder {
    image_base: u64,
    entry: u32,
    machine: u16,
    subsystem: u16,
    characteristics: ImageCharacteristics,
    relocations: Option<(u32, u32)>,
    sections: Vec<SectionDraft>,
}

impl ImageBuilder {
    pub fn new(image_base: u64) -> Self {
        Self {
            image_base,
            entry: 0x1000,
            machine: MACHINE_AMD64,
            subsystem: SUBSYSTEM_EFI_APPLICATION,
            characteristics: ImageCharacteristics::EXECUTABLE_IMAGE | ImageCharacteristics::LARGE_ADDRESS_AWARE,
            relocations: None,
            sections: Vec::new(),
        }
    }

    pub fn entry(mut self, rva: u32) -> Self {
        self.entry = rva;
        self
    }

    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    pub fn subsystem(mut self, subsystem: u16) -> Self {
        self.subsystem = subsystem;
        self
    }

    pub fn strip_relocations(mut self) -> Self {
        self.characteristics |= ImageCharacteristics::RELOCS_STRIPPED;
        self
    }

    /// Point the base relocation directory at `rva..rva + size`.
    pub fn relocations(mut self, rva: u32, size: u32) -> Self {
        self.relocations = Some((rva, size));
        self
    }

    /// `data.len()` becomes the raw size.
    pub fn section(mut self, name: &str, virtual_address: u32, virtual_size: u32, data: &[u8]) -> Self {
        let mut raw_name = [0u8; 8];
        let len = name.len().min(8);
        raw_name[..len].copy_from_slice(&name.as_bytes()[..len]);
        self.sections.push(SectionDraft { name: raw_name, virtual_address, virtual_size, data: data.to_vec() });
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut image = vec![0u8; SIZE_OF_HEADERS as usize];

        let mut legacy = RawLegacyHeader::new_zeroed();
        legacy.magic = LEGACY_MAGIC;
        legacy.new_header_offset = NEW_HEADER_OFFSET;

        let mut file = RawFileHeader::new_zeroed();
        file.signature = PE_SIGNATURE;
        file.machine = self.machine;
        file.section_count = self.sections.len() as u16;
        file.optional_header_size = core::mem::size_of::<RawOptionalHeader64>() as u16;
        file.characteristics = self.characteristics.bits();

        let mut table = Vec::new();
        let mut image_end = u64::from(SIZE_OF_HEADERS);
        for section in &self.sections {
            let offset = align_up(image.len() as u32, FILE_ALIGNMENT);
            let raw_len = section.data.len() as u32;
            let mut header = RawSectionHeader::new_zeroed();
            header.name = section.name;
            header.virtual_address = section.virtual_address;
            header.virtual_size = section.virtual_size;
            header.size_of_raw_data = raw_len;
            header.pointer_to_raw_data = if raw_len == 0 { 0 } else { offset };
            header.characteristics = (SectionFlags::READ | SectionFlags::INITIALIZED_DATA).bits();
            table.extend_from_slice(header.as_bytes());

            if raw_len != 0 {
                image.resize(offset as usize, 0);
                image.extend_from_slice(&section.data);
            }
            let span = if section.virtual_size == 0 { raw_len } else { section.virtual_size };
            image_end = image_end.max(u64::from(section.virtual_address) + u64::from(span));
        }

        let mut opt = RawOptionalHeader64::new_zeroed();
        opt.magic = PE32_PLUS_MAGIC;
        opt.entrypoint_rva = self.entry;
        opt.image_base = self.image_base;
        opt.section_alignment = SECTION_ALIGNMENT;
        opt.file_alignment = FILE_ALIGNMENT;
        opt.size_of_image = align_up(image_end as u32, SECTION_ALIGNMENT);
        opt.size_of_headers = SIZE_OF_HEADERS;
        opt.subsystem = self.subsystem;
        opt.number_of_rva_and_sizes = DATA_DIRECTORY_COUNT as u32;
        if let Some((rva, size)) = self.relocations {
            opt.data_directories[5] = RawDataDirectory { virtual_address: rva, size };
        }

        image[..core::mem::size_of::<RawLegacyHeader>()].copy_from_slice(legacy.as_bytes());
        let mut at = NEW_HEADER_OFFSET as usize;
        for bytes in [file.as_bytes(), opt.as_bytes(), &table[..]] {
            image[at..at + bytes.len()].copy_from_slice(bytes);
            at += bytes.len();
        }
        assert!(at <= SIZE_OF_HEADERS as usize, "too many sections for the header area");
        image
    }
}

fn align_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

/* ---------- sources ---------- */

/// Wraps a source and counts calls into it.
pub struct CountingSource<S> {
    inner: S,
    pub seeks: usize,
    pub reads: usize,
}

impl<S> CountingSource<S> {
    pub fn new(inner: S) -> Self {
        Self { inner, seeks: 0, reads: 0 }
    }
}

impl<S: ImageSource> ImageSource for CountingSource<S> {
    fn set_position(&mut self, offset: u64) -> BootResult<()> {
        self.seeks += 1;
        self.inner.set_position(offset)
    }

    fn position(&self) -> u64 {
        self.inner.position()
    }

    fn read(&mut self, buf: &mut [u8]) -> BootResult<usize> {
        self.reads += 1;
        self.inner.read(buf)
    }
}

/// Wraps a source and fails one chosen seek or read (1-based) with a
/// firmware status, the way a flaky block device would.
pub struct FailingSource<S> {
    inner: S,
    status: FirmwareStatus,
    fail_seek: Option<usize>,
    fail_read: Option<usize>,
    seeks: usize,
    reads: usize,
}

impl<S> FailingSource<S> {
    pub fn on_seek(inner: S, nth: usize, status: FirmwareStatus) -> Self {
        Self { inner, status, fail_seek: Some(nth), fail_read: None, seeks: 0, reads: 0 }
    }

    pub fn on_read(inner: S, nth: usize, status: FirmwareStatus) -> Self {
        Self { inner, status, fail_seek: None, fail_read: Some(nth), seeks: 0, reads: 0 }
    }
}

impl<S: ImageSource> ImageSource for FailingSource<S> {
    fn set_position(&mut self, offset: u64) -> BootResult<()> {
        self.seeks += 1;
        if self.fail_seek == Some(self.seeks) {
            return Err(IoError::Firmware(self.status).into());
        }
        self.inner.set_position(offset)
    }

    fn position(&self) -> u64 {
        self.inner.position()
    }

    fn read(&mut self, buf: &mut [u8]) -> BootResult<usize> {
        self.reads += 1;
        if self.fail_read == Some(self.reads) {
            return Err(IoError::Firmware(self.status).into());
        }
        self.inner.read(buf)
    }
}

/* ---------- page allocator ---------- */

/// Host stand-in for firmware page allocation. Pages come back filled with
/// 0xA5 so missing zero-fills show up.
pub struct HostPages {
    fixed_base: Option<u64>,
    failure: Option<FirmwareStatus>,
    pub requests: Vec<(u64, usize)>,
}

impl HostPages {
    /// Always grants the preferred address.
    pub fn honoring_preferred() -> Self {
        Self { fixed_base: None, failure: None, requests: Vec::new() }
    }

    /// Ignores the preferred address and places every request at `base`.
    pub fn at(base: u64) -> Self {
        Self { fixed_base: Some(base), failure: None, requests: Vec::new() }
    }

    pub fn failing(status: FirmwareStatus) -> Self {
        Self { fixed_base: None, failure: Some(status), requests: Vec::new() }
    }
}

impl PageAllocator for HostPages {
    fn allocate_pages(&mut self, preferred: u64, count: usize) -> BootResult<PageRegion> {
        self.requests.push((preferred, count));
        if let Some(status) = self.failure {
            return Err(BootError::Allocation { bytes: count * PAGE_SIZE, status });
        }
        let base = self.fixed_base.unwrap_or(preferred);
        Ok(PageRegion::from_static(base, leak_pages(count, 0xA5)))
    }
}

/* ---------- boot services ---------- */

/// Scripted boot services. Every pool allocation grows the memory map by
/// `growth_per_allocation` descriptors and bumps the map key.
pub struct MockFirmware {
    pub descriptor_size: usize,
    pub descriptors: usize,
    pub growth_per_allocation: usize,
    pub key: usize,
    /// Number of upcoming ExitBootServices calls to reject as stale.
    pub stale_exits: usize,
    pub exit_error: Option<FirmwareStatus>,
    pub tables: ConfigurationTables,
    pub runtime: u64,

    pub map_fetches: usize,
    pub pool_sizes: Vec<usize>,
    pub frees: usize,
    pub exits: usize,
    pub exited: bool,
}

impl MockFirmware {
    pub fn new(descriptor_size: usize, descriptors: usize) -> Self {
        Self {
            descriptor_size,
            descriptors,
            growth_per_allocation: 1,
            key: 0x100,
            stale_exits: 0,
            exit_error: None,
            tables: ConfigurationTables::default(),
            runtime: 0,
            map_fetches: 0,
            pool_sizes: Vec::new(),
            frees: 0,
            exits: 0,
            exited: false,
        }
    }

    fn map_size(&self) -> usize {
        self.descriptors * self.descriptor_size
    }
}

impl BootFirmware for MockFirmware {
    fn get_memory_map(&mut self, buffer: &mut [u8]) -> Result<MapFetch, MapFetchError> {
        self.map_fetches += 1;
        let size = self.map_size();
        if buffer.len() < size {
            return Err(MapFetchError::BufferTooSmall { required: size, descriptor_size: self.descriptor_size });
        }
        for (i, descriptor) in buffer[..size].chunks_exact_mut(self.descriptor_size).enumerate() {
            descriptor.fill(i as u8);
        }
        Ok(MapFetch { size, key: self.key, descriptor_size: self.descriptor_size, descriptor_version: 1 })
    }

    fn allocate_pool(&mut self, size: usize) -> BootResult<PoolBuffer> {
        self.pool_sizes.push(size);
        self.descriptors += self.growth_per_allocation;
        self.key += 1;
        let words = vec![0u64; size.div_ceil(8).max(1)].leak();
        let ptr = NonNull::new(words.as_mut_ptr().cast::<u8>()).ok_or(BootError::Allocation {
            bytes: size,
            status: FirmwareStatus::OUT_OF_RESOURCES,
        })?;
        // SAFETY: leaked, 8-byte aligned and at least `size` bytes.
        Ok(unsafe { PoolBuffer::from_raw_parts(ptr, size) })
    }

    fn free_pool(&mut self, _buffer: PoolBuffer) {
        self.frees += 1;
    }

    fn exit_boot_services(&mut self, map_key: usize) -> Result<(), ExitRejection> {
        self.exits += 1;
        if self.stale_exits > 0 {
            self.stale_exits -= 1;
            self.key += 1;
        }
        if let Some(status) = self.exit_error {
            return Err(ExitRejection::Firmware(status));
        }
        if map_key != self.key {
            return Err(ExitRejection::StaleMapKey);
        }
        self.exited = true;
        Ok(())
    }

    fn configuration_tables(&self) -> ConfigurationTables {
        self.tables
    }

    fn runtime_services(&self) -> u64 {
        self.runtime
    }
}
