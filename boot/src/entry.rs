//! Kernel entrypoint as a single-use capability.

use core::num::NonZeroU64;

use cobalt_bootinfo::BootEnvironment;

use crate::error::{BootResult, FormatError};

/// Signature the kernel is entered with. The kernel is itself an EFI
/// application image, so it is called with the firmware ABI.
pub type KernelMain = extern "efiapi" fn(*const BootEnvironment) -> !;

/// Validated kernel entry address.
///
/// Not `Copy` or `Clone`: [`KernelEntry::enter`] consumes it, so the jump
/// can happen at most once.
#[derive(Debug, PartialEq, Eq)]
pub struct KernelEntry {
    address: NonZeroU64,
}

impl KernelEntry {
    /// `rva` must land inside the `footprint` bytes loaded at `base`.
    pub(crate) fn new(base: u64, footprint: u64, rva: u32) -> BootResult<Self> {
        let outside = || FormatError::EntrypointOutsideImage { rva, footprint };
        if u64::from(rva) >= footprint {
            return Err(outside().into());
        }
        let address = base.checked_add(u64::from(rva)).and_then(NonZeroU64::new).ok_or_else(outside)?;
        Ok(Self { address })
    }

    pub fn address(&self) -> u64 {
        self.address.get()
    }

    /// Jump into the kernel.
    ///
    /// # Safety
    /// Boot services must already be exited, the image at this address must
    /// be fully loaded and relocated, and `environment` must stay valid for
    /// as long as the kernel uses it.
    pub unsafe fn enter(self, environment: *const BootEnvironment) -> ! {
        let kernel: KernelMain = core::mem::transmute(self.address.get() as usize);
        kernel(environment)
    }
}
