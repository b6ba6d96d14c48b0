//! Kernel image pages from firmware.

use uefi::table::boot::{AllocateType, BootServices, MemoryType};

use crate::config;
use crate::error::{BootError, BootResult, FirmwareStatus};
use crate::memory::{PageAllocator, PageRegion, PAGE_SIZE};
use crate::platform::firmware::memory_type;

pub struct FirmwarePages<'a> {
    boot: &'a BootServices,
}

impl<'a> FirmwarePages<'a> {
    pub fn new(boot: &'a BootServices) -> Self {
        Self { boot }
    }
}

impl PageAllocator for FirmwarePages<'_> {
    fn allocate_pages(&mut self, preferred: u64, count: usize) -> BootResult<PageRegion> {
        let kind = MemoryType(memory_type(config::IMAGE_MEMORY));

        let base = match self.boot.allocate_pages(AllocateType::Address(preferred), kind, count) {
            Ok(base) => base,
            Err(e) => {
                log::debug!("pages: {:#x} unavailable ({:?}), taking any", preferred, e.status());
                self.boot
                    .allocate_pages(AllocateType::AnyPages, kind, count)
                    .map_err(|e| BootError::Allocation {
                        bytes: count * PAGE_SIZE,
                        status: FirmwareStatus(e.status().0),
                    })?
            }
        };

        // SAFETY: freshly allocated, identity mapped while boot services run,
        // and handed to nobody else.
        Ok(unsafe { PageRegion::from_raw(base, count) })
    }
}
