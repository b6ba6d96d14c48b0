//! Compile-time loader configuration.

use log::LevelFilter;

/// Kernel image location on the volume the loader itself was started from.
pub const KERNEL_PATH: &str = "\\KERNEL.efi";

/// Seconds the firmware-exit prompt waits before continuing on its own.
pub const PROMPT_TIMEOUT_SECS: u32 = 5;

/// Seconds an error message stays on screen before control returns to firmware.
pub const ERROR_PAUSE_SECS: u32 = 10;

/// Keyboard polling granularity while a prompt is up.
pub const PROMPT_POLL_INTERVAL_US: usize = 100_000;

/// Firmware memory kinds used for loader allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    LoaderCode,
    LoaderData,
}

/// Kernel image pages hold code, so the kernel can keep them executable.
pub const IMAGE_MEMORY: MemoryKind = MemoryKind::LoaderCode;

/// Memory map and boot environment must outlive the loader.
pub const POOL_MEMORY: MemoryKind = MemoryKind::LoaderData;

/// Log verbosity selected by Cargo features.
pub const fn log_level() -> LevelFilter {
    if cfg!(feature = "verbose-logging") {
        LevelFilter::Trace
    } else if cfg!(feature = "logging") {
        LevelFilter::Info
    } else {
        LevelFilter::Off
    }
}

pub const fn firmware_prompt_enabled() -> bool {
    cfg!(feature = "firmware-prompt")
}
