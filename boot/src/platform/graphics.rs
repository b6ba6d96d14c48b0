//! Snapshot of the current GOP mode for the kernel's early console.
//!
//! The protocol is located without opening it, so the firmware console keeps
//! its own handle on the display and the mode is left as the firmware set it.

use core::ffi::c_void;
use core::ptr;

use cobalt_bootinfo::{GraphicsMode, GraphicsModeInfo};
use r_efi::protocols::graphics_output;
use uefi::table::{Boot, SystemTable};

use crate::platform::firmware::raw_boot_services;

/// Current graphics mode, or `None` when no GOP is installed.
pub fn capture_mode(st: &SystemTable<Boot>) -> Option<GraphicsMode> {
    let boot = raw_boot_services(st);
    let mut guid = graphics_output::PROTOCOL_GUID;
    let mut interface: *mut c_void = ptr::null_mut();

    // SAFETY: `st` is the live boot-services table; the returned interface
    // is only read while boot services are still up.
    unsafe {
        let status = ((*boot).locate_protocol)(&mut guid, ptr::null_mut(), &mut interface);
        if status.is_error() || interface.is_null() {
            log::warn!("no graphics output protocol: {:#x}", status.as_usize());
            return None;
        }

        let protocol = &*(interface as *const graphics_output::Protocol);
        let mode = protocol.mode.as_ref()?;
        let info = mode.info.as_ref()?;
        let pixels = &info.pixel_information;

        let snapshot = GraphicsMode {
            max_mode: mode.max_mode,
            mode: mode.mode,
            frame_buffer_base: mode.frame_buffer_base,
            frame_buffer_size: mode.frame_buffer_size as u64,
            info: GraphicsModeInfo {
                version: info.version,
                horizontal_resolution: info.horizontal_resolution,
                vertical_resolution: info.vertical_resolution,
                pixel_format: info.pixel_format,
                red_mask: pixels.red_mask,
                green_mask: pixels.green_mask,
                blue_mask: pixels.blue_mask,
                reserved_mask: pixels.reserved_mask,
                pixels_per_scan_line: info.pixels_per_scan_line,
                reserved: 0,
            },
        };

        log::info!(
            "graphics: mode {}/{} {}x{} stride {} fb {:#x}",
            snapshot.mode,
            snapshot.max_mode,
            snapshot.info.horizontal_resolution,
            snapshot.info.vertical_resolution,
            snapshot.info.pixels_per_scan_line,
            snapshot.frame_buffer_base
        );
        Some(snapshot)
    }
}
