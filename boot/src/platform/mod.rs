//! Firmware-backed implementations of the loader's seams.
//!
//! Only built for `target_os = "uefi"`.

pub mod console;
pub mod file;
pub mod firmware;
pub mod graphics;
pub mod pages;

pub use console::Console;
pub use file::KernelFile;
pub use firmware::UefiFirmware;
pub use pages::FirmwarePages;
