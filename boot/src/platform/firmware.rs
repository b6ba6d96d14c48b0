//! Boot services through the raw system table.
//!
//! The `uefi` crate's own exit path picks the memory type, sizes the buffer
//! and retries internally. The handoff needs each step separately, so these
//! calls go straight to the r-efi function table.

use core::ffi::c_void;
use core::mem;
use core::ptr::{self, NonNull};

use cobalt_bootinfo::ConfigurationTables;
use r_efi::efi;
use uefi::table::boot::BootServices;
use uefi::table::runtime::RuntimeServices;
use uefi::table::{Boot, SystemTable};
use uefi::Handle;

use crate::config::{self, MemoryKind};
use crate::error::{BootError, BootResult, FirmwareStatus};
use crate::handoff::{BootFirmware, ExitRejection, MapFetch, MapFetchError};
use crate::memory::PoolBuffer;

pub(crate) fn memory_type(kind: MemoryKind) -> efi::MemoryType {
    match kind {
        MemoryKind::LoaderCode => efi::LOADER_CODE,
        MemoryKind::LoaderData => efi::LOADER_DATA,
    }
}

fn status(raw: efi::Status) -> FirmwareStatus {
    FirmwareStatus(raw.as_usize())
}

/// Raw boot-services table behind `st`.
///
/// `BootServices` is the firmware's own table viewed through a reference, so
/// its address is the table r-efi expects.
pub(crate) fn raw_boot_services(st: &SystemTable<Boot>) -> *const efi::BootServices {
    (st.boot_services() as *const BootServices).cast::<efi::BootServices>()
}

/// Raw image handle for calls that take an `EFI_HANDLE`.
pub(crate) fn raw_handle(image: Handle) -> efi::Handle {
    // SAFETY: `Handle` is a `repr(transparent)` non-null pointer.
    unsafe { mem::transmute::<Handle, NonNull<c_void>>(image) }.as_ptr()
}

pub struct UefiFirmware {
    boot_services: *const efi::BootServices,
    image: efi::Handle,
    tables: ConfigurationTables,
    runtime: u64,
}

impl UefiFirmware {
    /// # Safety
    /// `st` must be the live boot-services system table handed to this image.
    /// The caller must not use boot services through `st` once
    /// [`BootFirmware::exit_boot_services`] has succeeded.
    pub unsafe fn new(image: Handle, st: &SystemTable<Boot>) -> Self {
        let entries = st.config_table();
        Self {
            boot_services: raw_boot_services(st),
            image: raw_handle(image),
            tables: ConfigurationTables {
                count: entries.len() as u64,
                tables: entries.as_ptr() as u64,
            },
            runtime: st.runtime_services() as *const RuntimeServices as u64,
        }
    }

    fn boot_services(&self) -> &efi::BootServices {
        // SAFETY: boot services stay mapped until the exit succeeds, after
        // which the handoff makes no further calls.
        unsafe { &*self.boot_services }
    }
}

impl BootFirmware for UefiFirmware {
    fn get_memory_map(&mut self, buffer: &mut [u8]) -> Result<MapFetch, MapFetchError> {
        let mut size = buffer.len();
        let mut key = 0usize;
        let mut descriptor_size = 0usize;
        let mut descriptor_version = 0u32;
        let map = if buffer.is_empty() {
            ptr::null_mut()
        } else {
            buffer.as_mut_ptr().cast::<efi::MemoryDescriptor>()
        };

        let raw = (self.boot_services().get_memory_map)(
            &mut size,
            map,
            &mut key,
            &mut descriptor_size,
            &mut descriptor_version,
        );

        if raw == efi::Status::BUFFER_TOO_SMALL {
            Err(MapFetchError::BufferTooSmall { required: size, descriptor_size })
        } else if raw.is_error() {
            Err(MapFetchError::Firmware(status(raw)))
        } else {
            Ok(MapFetch { size, key, descriptor_size, descriptor_version })
        }
    }

    fn allocate_pool(&mut self, size: usize) -> BootResult<PoolBuffer> {
        let mut out: *mut c_void = ptr::null_mut();
        let raw = (self.boot_services().allocate_pool)(memory_type(config::POOL_MEMORY), size, &mut out);
        if raw.is_error() {
            return Err(BootError::Allocation { bytes: size, status: status(raw) });
        }
        let ptr = NonNull::new(out.cast::<u8>())
            .ok_or(BootError::Allocation { bytes: size, status: FirmwareStatus::OUT_OF_RESOURCES })?;
        // SAFETY: fresh pool allocation of `size` bytes, 8-byte aligned per
        // the UEFI pool contract.
        Ok(unsafe { PoolBuffer::from_raw_parts(ptr, size) })
    }

    fn free_pool(&mut self, buffer: PoolBuffer) {
        // Called between exit attempts: no logging here.
        let _ = (self.boot_services().free_pool)(buffer.as_ptr().as_ptr().cast::<c_void>());
    }

    fn exit_boot_services(&mut self, map_key: usize) -> Result<(), ExitRejection> {
        let raw = (self.boot_services().exit_boot_services)(self.image, map_key);
        if raw == efi::Status::INVALID_PARAMETER {
            Err(ExitRejection::StaleMapKey)
        } else if raw.is_error() {
            Err(ExitRejection::Firmware(status(raw)))
        } else {
            Ok(())
        }
    }

    fn configuration_tables(&self) -> ConfigurationTables {
        self.tables
    }

    fn runtime_services(&self) -> u64 {
        self.runtime
    }
}
