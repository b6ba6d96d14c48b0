//! handoff.rs: boot-services exit and kernel launch
//!
//! The handoff is a typestate chain. Each step consumes the previous one, so
//! the order below is the only order the compiler accepts:
//!
//!   Preparing --capture_memory_map--> MapCaptured
//!             --exit_boot_services--> BootServicesExited
//!             --transfer------------> (kernel, never returns)
//!
//! The [`BootEnvironment`] lives in firmware pool memory allocated in
//! `prepare`. It is never freed; its address is the kernel's only argument.

use core::mem::{align_of, size_of};
use core::ptr::NonNull;

use cobalt_bootinfo::{BootEnvironment, ConfigurationTables, EnvironmentFlags, GraphicsMode, MemoryMapInfo};

use crate::config;
use crate::entry::KernelEntry;
use crate::error::{BootError, BootResult, FirmwareStatus};
use crate::image::LoadedImage;
use crate::memory::PoolBuffer;

/// Result of a successful GetMemoryMap call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapFetch {
    pub size: usize,
    pub key: usize,
    pub descriptor_size: usize,
    pub descriptor_version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapFetchError {
    /// Buffer too small; `required` is what the firmware asked for.
    BufferTooSmall { required: usize, descriptor_size: usize },
    Firmware(FirmwareStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitRejection {
    /// The map key no longer matches the current memory map.
    StaleMapKey,
    Firmware(FirmwareStatus),
}

/// Boot-services calls the handoff needs.
pub trait BootFirmware {
    fn get_memory_map(&mut self, buffer: &mut [u8]) -> Result<MapFetch, MapFetchError>;

    /// Pool memory of the loader-data kind, so it survives the exit.
    fn allocate_pool(&mut self, size: usize) -> BootResult<PoolBuffer>;

    fn free_pool(&mut self, buffer: PoolBuffer);

    fn exit_boot_services(&mut self, map_key: usize) -> Result<(), ExitRejection>;

    fn configuration_tables(&self) -> ConfigurationTables;

    fn runtime_services(&self) -> u64;
}

impl<F: BootFirmware + ?Sized> BootFirmware for &mut F {
    fn get_memory_map(&mut self, buffer: &mut [u8]) -> Result<MapFetch, MapFetchError> {
        (**self).get_memory_map(buffer)
    }

    fn allocate_pool(&mut self, size: usize) -> BootResult<PoolBuffer> {
        (**self).allocate_pool(size)
    }

    fn free_pool(&mut self, buffer: PoolBuffer) {
        (**self).free_pool(buffer)
    }

    fn exit_boot_services(&mut self, map_key: usize) -> Result<(), ExitRejection> {
        (**self).exit_boot_services(map_key)
    }

    fn configuration_tables(&self) -> ConfigurationTables {
        (**self).configuration_tables()
    }

    fn runtime_services(&self) -> u64 {
        (**self).runtime_services()
    }
}

/// Memory map captured into a pool buffer, plus the key that vouches for it.
pub struct MemoryMapSnapshot {
    buffer: PoolBuffer,
    size: usize,
    key: usize,
    descriptor_size: usize,
    descriptor_version: u32,
}

impl MemoryMapSnapshot {
    pub fn key(&self) -> usize {
        self.key
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn descriptor_size(&self) -> usize {
        self.descriptor_size
    }

    pub fn descriptor_count(&self) -> usize {
        self.size.checked_div(self.descriptor_size).unwrap_or(0)
    }

    pub fn info(&self) -> MemoryMapInfo {
        MemoryMapInfo {
            descriptor_size: self.descriptor_size as u64,
            size: self.size as u64,
            map: self.buffer.address(),
            descriptor_version: self.descriptor_version,
            reserved: 0,
        }
    }
}

/// Query the map size, allocate it with one descriptor of slack, fetch again.
fn capture_map<F: BootFirmware + ?Sized>(firmware: &mut F) -> BootResult<MemoryMapSnapshot> {
    let (required, descriptor_size) = match firmware.get_memory_map(&mut []) {
        Err(MapFetchError::BufferTooSmall { required, descriptor_size }) => (required, descriptor_size),
        Ok(fetch) => (fetch.size, fetch.descriptor_size),
        Err(MapFetchError::Firmware(status)) => return Err(BootError::MemoryMap(status)),
    };

    // Allocating the buffer can itself add a descriptor.
    let provided = required + descriptor_size;
    let mut buffer = firmware.allocate_pool(provided)?;

    match firmware.get_memory_map(buffer.as_mut_slice()) {
        Ok(fetch) => Ok(MemoryMapSnapshot {
            buffer,
            size: fetch.size,
            key: fetch.key,
            descriptor_size: fetch.descriptor_size,
            descriptor_version: fetch.descriptor_version,
        }),
        Err(err) => {
            firmware.free_pool(buffer);
            Err(match err {
                MapFetchError::BufferTooSmall { required, .. } => BootError::MapCapture { required, provided },
                MapFetchError::Firmware(status) => BootError::MemoryMap(status),
            })
        }
    }
}

/* ---------- typestate ---------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffPhase {
    Preparing,
    MapCaptured,
    BootServicesExited,
}

pub trait HandoffState {
    const PHASE: HandoffPhase;
}

pub struct Preparing;

pub struct MapCaptured {
    map: MemoryMapSnapshot,
}

pub struct BootServicesExited {
    map: MemoryMapSnapshot,
}

impl HandoffState for Preparing {
    const PHASE: HandoffPhase = HandoffPhase::Preparing;
}

impl HandoffState for MapCaptured {
    const PHASE: HandoffPhase = HandoffPhase::MapCaptured;
}

impl HandoffState for BootServicesExited {
    const PHASE: HandoffPhase = HandoffPhase::BootServicesExited;
}

pub struct Handoff<F, S> {
    firmware: F,
    environment: NonNull<BootEnvironment>,
    state: S,
}

impl<F: BootFirmware, S: HandoffState> Handoff<F, S> {
    pub fn phase(&self) -> HandoffPhase {
        S::PHASE
    }

    pub fn environment(&self) -> &BootEnvironment {
        // SAFETY: allocated and initialised in `prepare`, never freed, and
        // only written through `&mut self`.
        unsafe { self.environment.as_ref() }
    }

    fn environment_mut(&mut self) -> &mut BootEnvironment {
        // SAFETY: see `environment`.
        unsafe { self.environment.as_mut() }
    }
}

impl<F: BootFirmware> Handoff<F, Preparing> {
    /// Allocate the boot environment and record everything that does not
    /// depend on the final memory map.
    pub fn prepare(
        mut firmware: F,
        image: &LoadedImage,
        relocated: bool,
        graphics: Option<GraphicsMode>,
    ) -> BootResult<Self> {
        let bytes = size_of::<BootEnvironment>();
        let pool = firmware.allocate_pool(bytes)?;
        if pool.len() < bytes || pool.address() % align_of::<BootEnvironment>() as u64 != 0 {
            firmware.free_pool(pool);
            return Err(BootError::Allocation { bytes, status: FirmwareStatus::INVALID_PARAMETER });
        }

        let environment = pool.as_ptr().cast::<BootEnvironment>();
        // SAFETY: pool memory is large enough and aligned (checked above) and
        // owned by nobody else.
        unsafe { environment.as_ptr().write(BootEnvironment::new()) };

        let mut handoff = Self { firmware, environment, state: Preparing };
        let configuration_tables = handoff.firmware.configuration_tables();
        let runtime_services = handoff.firmware.runtime_services();

        let env = handoff.environment_mut();
        env.kernel_base = image.base_address;
        env.kernel_page_count = image.page_count as u64;
        env.configuration_tables = configuration_tables;
        env.runtime_services = runtime_services;
        if relocated {
            env.insert_flags(EnvironmentFlags::RELOCATED);
        }
        if let Some(mode) = graphics {
            env.graphics_mode = mode;
            env.insert_flags(EnvironmentFlags::GRAPHICS);
        }

        log::debug!(
            "handoff: environment at {:#x}, {} configuration tables ({:?})",
            environment.as_ptr() as u64,
            configuration_tables.count,
            config::POOL_MEMORY
        );
        Ok(handoff)
    }

    pub fn capture_memory_map(mut self) -> BootResult<Handoff<F, MapCaptured>> {
        let map = capture_map(&mut self.firmware)?;
        // No console output from here on: it can allocate and invalidate the key.
        Ok(Handoff { firmware: self.firmware, environment: self.environment, state: MapCaptured { map } })
    }
}

impl<F: BootFirmware> Handoff<F, MapCaptured> {
    pub fn memory_map(&self) -> &MemoryMapSnapshot {
        &self.state.map
    }

    /// Leave boot services. A stale map key is retried once with a freshly
    /// captured map; anything else is fatal.
    pub fn exit_boot_services(mut self) -> BootResult<Handoff<F, BootServicesExited>> {
        let mut map = self.state.map;
        let mut retried = false;
        loop {
            match self.firmware.exit_boot_services(map.key) {
                Ok(()) => break,
                Err(ExitRejection::StaleMapKey) if !retried => {
                    retried = true;
                    self.firmware.free_pool(map.buffer);
                    map = capture_map(&mut self.firmware)?;
                }
                Err(ExitRejection::StaleMapKey) => {
                    return Err(BootError::ExitBootServices(FirmwareStatus::INVALID_PARAMETER));
                }
                Err(ExitRejection::Firmware(status)) => return Err(BootError::ExitBootServices(status)),
            }
        }

        let mut handoff = Handoff { firmware: self.firmware, environment: self.environment, state: BootServicesExited { map } };
        let info = handoff.state.map.info();
        let env = handoff.environment_mut();
        env.memory_map = info;
        env.insert_flags(EnvironmentFlags::MEMORY_MAP);
        Ok(handoff)
    }
}

impl<F: BootFirmware> Handoff<F, BootServicesExited> {
    pub fn memory_map(&self) -> &MemoryMapSnapshot {
        &self.state.map
    }

    /// Jump to the kernel with the environment's address.
    ///
    /// # Safety
    /// `entry` must belong to the image described by the environment, and
    /// that image must be fully relocated.
    pub unsafe fn transfer(self, entry: KernelEntry) -> ! {
        entry.enter(self.environment.as_ptr())
    }
}
