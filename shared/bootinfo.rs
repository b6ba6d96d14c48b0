#![cfg_attr(not(test), no_std)]

//! Boot environment passed from the loader to the kernel.
//!
//! The loader allocates exactly one [`BootEnvironment`] from firmware pool
//! memory, fills it in while it still owns the machine and hands its physical
//! address to the kernel entrypoint as the only argument. Everything is
//! `repr(C)` with explicit padding, so the layout is the ABI: the size
//! assertions at the bottom of this file must hold on both sides.

use bitflags::bitflags;

/// Passed from loader ➞ kernel (always repr(C) ⇒ stable ABI).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BootEnvironment {
    /// Always [`BootEnvironment::MAGIC`].
    pub magic: u64,
    /// `size_of::<BootEnvironment>()` as seen by the loader.
    pub size: u32,
    /// Layout revision, bumped whenever a field moves.
    pub version: u32,
    /// [`EnvironmentFlags`] bits.
    pub flags: u32,
    pub reserved: u32,

    /// Final firmware memory map, captured right before boot services ended.
    pub memory_map: MemoryMapInfo,
    /// Firmware configuration tables (ACPI, SMBIOS, ...).
    pub configuration_tables: ConfigurationTables,
    /// Runtime services table; the only firmware service set left alive.
    pub runtime_services: u64,

    /// Physical address the kernel image was staged at.
    pub kernel_base: u64,
    /// Number of 4 KiB pages backing the kernel image.
    pub kernel_page_count: u64,

    /// Graphics mode the loader left the display in.
    pub graphics_mode: GraphicsMode,
}

/// Raw firmware memory map. `map` points at `size` bytes of descriptors,
/// each `descriptor_size` bytes long (which may be larger than the
/// descriptor struct the kernel knows about).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryMapInfo {
    pub descriptor_size: u64,
    pub size: u64,
    pub map: u64,
    pub descriptor_version: u32,
    pub reserved: u32,
}

impl MemoryMapInfo {
    pub fn descriptor_count(&self) -> u64 {
        if self.descriptor_size == 0 {
            0
        } else {
            self.size / self.descriptor_size
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigurationTables {
    pub count: u64,
    pub tables: u64,
}

/// Snapshot of the GOP mode. Only meaningful when
/// [`EnvironmentFlags::GRAPHICS`] is set.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphicsMode {
    pub max_mode: u32,
    pub mode: u32,
    pub frame_buffer_base: u64,
    pub frame_buffer_size: u64,
    pub info: GraphicsModeInfo,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphicsModeInfo {
    pub version: u32,
    pub horizontal_resolution: u32,
    pub vertical_resolution: u32,
    /// Firmware pixel format enum (RGB, BGR, bitmask, blt-only).
    pub pixel_format: u32,
    pub red_mask: u32,
    pub green_mask: u32,
    pub blue_mask: u32,
    pub reserved_mask: u32,
    pub pixels_per_scan_line: u32,
    pub reserved: u32,
}

bitflags! {
    /// Which parts of [`BootEnvironment`] were filled in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnvironmentFlags: u32 {
        const MEMORY_MAP = 1 << 0;
        const GRAPHICS   = 1 << 1;
        /// Kernel was not placed at its preferred base and was relocated.
        const RELOCATED  = 1 << 2;
    }
}

impl BootEnvironment {
    pub const MAGIC: u64 = 0x4E45_544C_4142_4F43; // "COBALTEN"
    pub const VERSION: u32 = 1;

    pub const fn new() -> Self {
        Self {
            magic: Self::MAGIC,
            size: core::mem::size_of::<Self>() as u32,
            version: Self::VERSION,
            flags: 0,
            reserved: 0,
            memory_map: MemoryMapInfo {
                descriptor_size: 0,
                size: 0,
                map: 0,
                descriptor_version: 0,
                reserved: 0,
            },
            configuration_tables: ConfigurationTables { count: 0, tables: 0 },
            runtime_services: 0,
            kernel_base: 0,
            kernel_page_count: 0,
            graphics_mode: GraphicsMode {
                max_mode: 0,
                mode: 0,
                frame_buffer_base: 0,
                frame_buffer_size: 0,
                info: GraphicsModeInfo {
                    version: 0,
                    horizontal_resolution: 0,
                    vertical_resolution: 0,
                    pixel_format: 0,
                    red_mask: 0,
                    green_mask: 0,
                    blue_mask: 0,
                    reserved_mask: 0,
                    pixels_per_scan_line: 0,
                    reserved: 0,
                },
            },
        }
    }

    /// Kernel-side sanity check before trusting any other field.
    pub fn is_valid(&self) -> bool {
        self.magic == Self::MAGIC
            && self.version == Self::VERSION
            && self.size as usize == core::mem::size_of::<Self>()
    }

    pub fn flags(&self) -> EnvironmentFlags {
        EnvironmentFlags::from_bits_truncate(self.flags)
    }

    pub fn insert_flags(&mut self, flags: EnvironmentFlags) {
        self.flags |= flags.bits();
    }
}

impl Default for BootEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = assert!(core::mem::size_of::<MemoryMapInfo>() == 32);
const _: () = assert!(core::mem::size_of::<ConfigurationTables>() == 16);
const _: () = assert!(core::mem::size_of::<GraphicsModeInfo>() == 40);
const _: () = assert!(core::mem::size_of::<GraphicsMode>() == 64);
const _: () = assert!(core::mem::size_of::<BootEnvironment>() == 160);
