//! Parse, stage and relocate the kernel in one call.

use crate::error::BootResult;
use crate::image::{load_image, RelocatedImage};
use crate::memory::PageAllocator;
use crate::pe::parse_headers;
use crate::source::ImageSource;

pub fn load_kernel<S, A>(source: &mut S, allocator: &mut A) -> BootResult<RelocatedImage>
where
    S: ImageSource + ?Sized,
    A: PageAllocator + ?Sized,
{
    let headers = parse_headers(source)?;
    for section in &headers.sections {
        log::debug!(
            "section {:<8} rva={:#010x} vsize={:#x} raw={:#x} {:?}",
            section.name(),
            section.virtual_address,
            section.virtual_size,
            section.size_of_raw_data,
            section.characteristics
        );
    }

    let staged = load_image(source, &headers, allocator)?;
    let relocated = staged.relocate()?;

    let summary = relocated.summary();
    if relocated.was_moved() {
        log::info!(
            "kernel relocated by {:#x}: {} fixups in {} blocks",
            summary.delta,
            summary.applied,
            summary.blocks
        );
    }
    Ok(relocated)
}
