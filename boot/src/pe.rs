//! pe.rs: kernel image header parser (legacy header -> PE32+ header -> section table)
//!
//! Layout consumed (little-endian):
//!   +------------------------+ 0
//!   | legacy header  "MZ"    | 64 bytes, new-header offset at 0x3C
//!   +------------------------+ extended_header_offset
//!   | "PE\0\0" + COFF header | 24 bytes
//!   | PE32+ optional header  | 240 bytes (16 data directories)
//!   | section table          | section_count * 40 bytes
//!   +------------------------+
//!
//! The parser does two seeks, three fixed-size reads and one read for the
//! whole section table. Nothing is checksummed or signature-checked.

use alloc::vec;
use alloc::vec::Vec;
use core::mem::size_of;

use bitflags::bitflags;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{BootResult, FormatError};
use crate::source::ImageSource;

pub const LEGACY_MAGIC: u16 = 0x5A4D; // "MZ"
pub const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
pub const PE32_PLUS_MAGIC: u16 = 0x020B;
pub const MACHINE_AMD64: u16 = 0x8664;
pub const SUBSYSTEM_EFI_APPLICATION: u16 = 10;
pub const DATA_DIRECTORY_COUNT: usize = 16;

/* ---------- on-disk records ---------- */

#[repr(C)]
#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub(crate) struct RawLegacyHeader {
    pub magic: u16,
    pub dos_fields: [u16; 29],
    pub new_header_offset: u32,
}

#[repr(C)]
#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub(crate) struct RawFileHeader {
    pub signature: u32,
    pub machine: u16,
    pub section_count: u16,
    pub timestamp: u32,
    pub symbol_table: u32,
    pub symbol_count: u32,
    pub optional_header_size: u16,
    pub characteristics: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Default, FromZeroes, FromBytes, AsBytes)]
pub(crate) struct RawDataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

#[repr(C)]
#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub(crate) struct RawOptionalHeader64 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub entrypoint_rva: u32,
    pub base_of_code: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub os_version: [u16; 2],
    pub image_version: [u16; 2],
    pub subsystem_version: [u16; 2],
    pub win32_version: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub checksum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub stack_reserve: u64,
    pub stack_commit: u64,
    pub heap_reserve: u64,
    pub heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
    pub data_directories: [RawDataDirectory; DATA_DIRECTORY_COUNT],
}

#[repr(C)]
#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub(crate) struct RawSectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_line_numbers: u32,
    pub relocation_count: u16,
    pub line_number_count: u16,
    pub characteristics: u32,
}

pub(crate) const LEGACY_HEADER_SIZE: usize = size_of::<RawLegacyHeader>();
pub(crate) const FILE_HEADER_SIZE: usize = size_of::<RawFileHeader>();
pub(crate) const OPTIONAL_HEADER_SIZE: usize = size_of::<RawOptionalHeader64>();
pub(crate) const SECTION_HEADER_SIZE: usize = size_of::<RawSectionHeader>();

const _: () = assert!(LEGACY_HEADER_SIZE == 64);
const _: () = assert!(FILE_HEADER_SIZE == 24);
const _: () = assert!(OPTIONAL_HEADER_SIZE == 240);
const _: () = assert!(SECTION_HEADER_SIZE == 40);

/* ---------- parsed view ---------- */

bitflags! {
    /// COFF image characteristics.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ImageCharacteristics: u16 {
        const RELOCS_STRIPPED      = 0x0001;
        const EXECUTABLE_IMAGE     = 0x0002;
        const LARGE_ADDRESS_AWARE  = 0x0020;
        const DEBUG_STRIPPED       = 0x0200;
        const SYSTEM               = 0x1000;
        const DLL                  = 0x2000;
    }
}

bitflags! {
    /// Section characteristics the loader reports on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u32 {
        const CODE               = 0x0000_0020;
        const INITIALIZED_DATA   = 0x0000_0040;
        const UNINITIALIZED_DATA = 0x0000_0080;
        const DISCARDABLE        = 0x0200_0000;
        const EXECUTE            = 0x2000_0000;
        const READ               = 0x4000_0000;
        const WRITE              = 0x8000_0000;
    }
}

/// Data directory slots, in on-disk order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum DirectoryEntry {
    Export = 0,
    Import = 1,
    Resource = 2,
    Exception = 3,
    Security = 4,
    BaseRelocation = 5,
    Debug = 6,
    Architecture = 7,
    GlobalPointer = 8,
    Tls = 9,
    LoadConfig = 10,
    BoundImport = 11,
    ImportAddressTable = 12,
    DelayImport = 13,
    ClrRuntime = 14,
    Reserved = 15,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyHeader {
    pub magic: u16,
    pub extended_header_offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionalImageHeader {
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub entrypoint_rva: u32,
    pub subsystem: u16,
    pub directory_count: u32,
    pub data_directories: [DataDirectory; DATA_DIRECTORY_COUNT],
}

impl OptionalImageHeader {
    /// Directory `entry`, or `None` when absent or empty.
    pub fn directory(&self, entry: DirectoryEntry) -> Option<DataDirectory> {
        let index = entry as usize;
        if index as u32 >= self.directory_count {
            return None;
        }
        let dir = self.data_directories[index];
        (dir.size != 0).then_some(dir)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedHeader {
    pub machine: u16,
    pub section_count: u16,
    pub optional_header_size: u16,
    pub characteristics: ImageCharacteristics,
    pub optional: OptionalImageHeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionDescriptor {
    pub name: [u8; 8],
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub characteristics: SectionFlags,
}

impl SectionDescriptor {
    /// Name for log output; names are not interpreted otherwise.
    pub fn name(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..end]).unwrap_or("?")
    }

    /// Bytes this section spans once loaded.
    pub fn memory_size(&self) -> u32 {
        if self.virtual_size == 0 {
            self.size_of_raw_data
        } else {
            self.virtual_size
        }
    }

    /// Bytes taken from the file. Raw data is file-aligned and may run past
    /// the virtual size; that tail is padding and is not copied.
    pub fn file_bytes(&self) -> u32 {
        self.size_of_raw_data.min(self.memory_size())
    }

    pub fn end_rva(&self) -> u64 {
        u64::from(self.virtual_address) + u64::from(self.memory_size())
    }
}

/// Everything the loader needs from the file headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeaders {
    pub legacy: LegacyHeader,
    pub extended: ExtendedHeader,
    pub sections: Vec<SectionDescriptor>,
}

impl ImageHeaders {
    pub fn optional(&self) -> &OptionalImageHeader {
        &self.extended.optional
    }

    pub fn relocation_directory(&self) -> Option<DataDirectory> {
        self.optional().directory(DirectoryEntry::BaseRelocation)
    }

    pub fn is_relocatable(&self) -> bool {
        !self.extended.characteristics.contains(ImageCharacteristics::RELOCS_STRIPPED)
    }
}

/// Decode the header chain from `source`, starting at offset 0.
pub fn parse_headers<S: ImageSource + ?Sized>(source: &mut S) -> BootResult<ImageHeaders> {
    source.set_position(0)?;
    let legacy = read_record::<RawLegacyHeader, S>(source)?;
    if legacy.magic != LEGACY_MAGIC {
        return Err(FormatError::BadLegacyMagic(legacy.magic).into());
    }
    let legacy = LegacyHeader { magic: legacy.magic, extended_header_offset: legacy.new_header_offset };

    source.set_position(u64::from(legacy.extended_header_offset))?;
    let file = read_record::<RawFileHeader, S>(source)?;
    if file.signature != PE_SIGNATURE {
        return Err(FormatError::BadSignature(file.signature).into());
    }
    if file.machine != MACHINE_AMD64 {
        return Err(FormatError::UnsupportedMachine(file.machine).into());
    }
    // The section table is read straight after the optional header, so only
    // the standard PE32+ size is accepted.
    if usize::from(file.optional_header_size) != OPTIONAL_HEADER_SIZE {
        return Err(FormatError::OptionalHeaderSize(file.optional_header_size).into());
    }

    let opt = read_record::<RawOptionalHeader64, S>(source)?;
    if opt.magic != PE32_PLUS_MAGIC {
        return Err(FormatError::UnsupportedOptionalHeader(opt.magic).into());
    }
    if opt.subsystem != SUBSYSTEM_EFI_APPLICATION {
        return Err(FormatError::WrongSubsystem(opt.subsystem).into());
    }
    if file.section_count == 0 {
        return Err(FormatError::NoSections.into());
    }

    let mut table = vec![0u8; usize::from(file.section_count) * SECTION_HEADER_SIZE];
    source.read_exact(&mut table)?;
    let sections = table
        .chunks_exact(SECTION_HEADER_SIZE)
        .filter_map(RawSectionHeader::read_from)
        .map(|raw| SectionDescriptor {
            name: raw.name,
            virtual_address: raw.virtual_address,
            virtual_size: raw.virtual_size,
            size_of_raw_data: raw.size_of_raw_data,
            pointer_to_raw_data: raw.pointer_to_raw_data,
            characteristics: SectionFlags::from_bits_retain(raw.characteristics),
        })
        .collect::<Vec<_>>();

    let mut data_directories = [DataDirectory::default(); DATA_DIRECTORY_COUNT];
    for (dst, src) in data_directories.iter_mut().zip(opt.data_directories.iter()) {
        *dst = DataDirectory { virtual_address: src.virtual_address, size: src.size };
    }

    let extended = ExtendedHeader {
        machine: file.machine,
        section_count: file.section_count,
        optional_header_size: file.optional_header_size,
        characteristics: ImageCharacteristics::from_bits_retain(file.characteristics),
        optional: OptionalImageHeader {
            image_base: opt.image_base,
            section_alignment: opt.section_alignment,
            file_alignment: opt.file_alignment,
            size_of_image: opt.size_of_image,
            size_of_headers: opt.size_of_headers,
            entrypoint_rva: opt.entrypoint_rva,
            subsystem: opt.subsystem,
            directory_count: opt.number_of_rva_and_sizes,
            data_directories,
        },
    };

    log::debug!(
        "image: base={:#x} entry_rva={:#x} sections={} headers={:#x}",
        extended.optional.image_base,
        extended.optional.entrypoint_rva,
        sections.len(),
        extended.optional.size_of_headers
    );

    Ok(ImageHeaders { legacy, extended, sections })
}

fn read_record<T, S>(source: &mut S) -> BootResult<T>
where
    T: FromBytes,
    S: ImageSource + ?Sized,
{
    let mut raw = [0u8; OPTIONAL_HEADER_SIZE];
    let raw = &mut raw[..size_of::<T>()];
    source.read_exact(raw)?;
    // Length matches exactly, so this cannot fail.
    Ok(T::read_from(raw).unwrap_or_else(T::new_zeroed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BootError;
    use crate::source::SliceSource;
    use crate::error::{FirmwareStatus, IoError};
    use crate::testing::{CountingSource, FailingSource, ImageBuilder};

    fn sample() -> ImageBuilder {
        ImageBuilder::new(0x1_4000_0000)
            .entry(0x1000)
            .section(".text", 0x1000, 0x1000, &[0x90; 0x200])
            .section(".data", 0x2000, 0x800, &[0x11; 0x200])
    }

    #[test]
    fn parses_header_chain() {
        let image = sample().build();
        let headers = parse_headers(&mut SliceSource::new(&image)).unwrap();

        assert_eq!(headers.legacy.magic, LEGACY_MAGIC);
        assert_eq!(headers.legacy.extended_header_offset, 0x80);
        assert_eq!(headers.extended.section_count, 2);
        assert_eq!(headers.optional().image_base, 0x1_4000_0000);
        assert_eq!(headers.optional().entrypoint_rva, 0x1000);
        assert_eq!(headers.sections[0].name(), ".text");
        assert_eq!(headers.sections[1].virtual_address, 0x2000);
        assert_eq!(headers.sections[1].virtual_size, 0x800);
        assert!(headers.is_relocatable());
        assert!(headers.relocation_directory().is_none());
    }

    #[test]
    fn uses_two_seeks_and_four_reads() {
        let image = sample().build();
        let mut src = CountingSource::new(SliceSource::new(&image));
        parse_headers(&mut src).unwrap();
        assert_eq!(src.seeks, 2);
        assert_eq!(src.reads, 4);
    }

    #[test]
    fn device_errors_abort_parsing_verbatim() {
        let image = sample().build();
        let status = FirmwareStatus(FirmwareStatus::ERROR_BIT | 7);

        // Second seek is the jump to the extended header.
        let mut src = FailingSource::on_seek(SliceSource::new(&image), 2, status);
        assert_eq!(parse_headers(&mut src).unwrap_err(), BootError::Io(IoError::Firmware(status)));

        // Fourth read is the section table.
        let mut src = FailingSource::on_read(SliceSource::new(&image), 4, status);
        assert_eq!(parse_headers(&mut src).unwrap_err(), BootError::Io(IoError::Firmware(status)));
    }

    #[test]
    fn rejects_bad_legacy_magic() {
        let mut image = sample().build();
        image[0] = b'Z';
        let err = parse_headers(&mut SliceSource::new(&image)).unwrap_err();
        assert!(matches!(err, BootError::Format(FormatError::BadLegacyMagic(_))));
    }

    #[test]
    fn rejects_non_efi_subsystem() {
        let image = sample().subsystem(3).build();
        let err = parse_headers(&mut SliceSource::new(&image)).unwrap_err();
        assert_eq!(err, BootError::Format(FormatError::WrongSubsystem(3)));
    }

    #[test]
    fn rejects_foreign_machine() {
        let image = sample().machine(0xAA64).build();
        let err = parse_headers(&mut SliceSource::new(&image)).unwrap_err();
        assert_eq!(err, BootError::Format(FormatError::UnsupportedMachine(0xAA64)));
    }

    #[test]
    fn truncated_section_table_is_io_error() {
        let image = sample().build();
        // Legacy (0x80) + file header + optional header + half a section entry.
        let cut = 0x80 + FILE_HEADER_SIZE + OPTIONAL_HEADER_SIZE + 20;
        let err = parse_headers(&mut SliceSource::new(&image[..cut])).unwrap_err();
        assert!(matches!(err, BootError::Io(_)));
    }

    #[test]
    fn empty_directory_is_absent() {
        let mut dirs = [DataDirectory::default(); DATA_DIRECTORY_COUNT];
        dirs[5] = DataDirectory { virtual_address: 0x4000, size: 0 };
        let opt = OptionalImageHeader {
            image_base: 0,
            section_alignment: 0x1000,
            file_alignment: 0x200,
            size_of_image: 0,
            size_of_headers: 0x400,
            entrypoint_rva: 0,
            subsystem: SUBSYSTEM_EFI_APPLICATION,
            directory_count: 16,
            data_directories: dirs,
        };
        assert!(opt.directory(DirectoryEntry::BaseRelocation).is_none());
    }

    #[test]
    fn raw_size_beyond_virtual_size_is_padding() {
        let section = SectionDescriptor {
            name: *b".rdata\0\0",
            virtual_address: 0x3000,
            virtual_size: 0x120,
            size_of_raw_data: 0x200,
            pointer_to_raw_data: 0x600,
            characteristics: SectionFlags::READ | SectionFlags::INITIALIZED_DATA,
        };
        assert_eq!(section.file_bytes(), 0x120);
        assert_eq!(section.end_rva(), 0x3120);
        assert_eq!(section.name(), ".rdata");
    }
}
