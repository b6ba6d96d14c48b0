//! cobalt_boot: CobaltOS second-stage UEFI loader
//!
//! Finds `\KERNEL.efi` on the boot volume, stages it in physical memory,
//! relocates it, leaves boot services and jumps to it with a
//! [`cobalt_bootinfo::BootEnvironment`].
//!
//! Everything outside [`platform`] is firmware-agnostic and runs in host
//! unit tests against the fixtures in `testing`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod entry;
pub mod error;
pub mod handoff;
pub mod image;
pub mod memory;
pub mod pe;
pub mod pipeline;
pub mod prompt;
pub mod reloc;
pub mod source;

#[cfg(target_os = "uefi")]
pub mod platform;

#[cfg(test)]
mod testing;

pub use error::{BootError, BootResult};
