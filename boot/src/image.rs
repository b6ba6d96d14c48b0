//! image.rs: stage a parsed kernel image in physical memory
//!
//! Sequence:
//!   footprint -> allocate (prefer image_base) -> zero -> headers -> sections
//! then [`StagedImage::relocate`] turns the staged image into something that
//! can be entered.

use crate::config;
use crate::entry::KernelEntry;
use crate::error::{BootResult, FormatError};
use crate::memory::{pages_for, PageAllocator, PageRegion};
use crate::pe::{DataDirectory, ImageHeaders};
use crate::reloc::{apply_relocations, load_delta, RelocationSummary};
use crate::source::ImageSource;

/// Where the kernel ended up. Owned by the loader until handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    pub base_address: u64,
    pub page_count: usize,
    pub entrypoint_address: u64,
}

/// Bytes the image occupies once loaded: the furthest section end, and never
/// less than the headers.
pub fn image_footprint(headers: &ImageHeaders) -> u64 {
    headers
        .sections
        .iter()
        .map(|s| s.end_rva())
        .fold(u64::from(headers.optional().size_of_headers), u64::max)
}

/// Image copied into place but not yet relocated.
#[derive(Debug)]
pub struct StagedImage {
    region: PageRegion,
    loaded: LoadedImage,
    preferred_base: u64,
    relocations: Option<DataDirectory>,
    relocatable: bool,
    entry: KernelEntry,
}

/// Image ready to run at its actual address.
#[derive(Debug)]
pub struct RelocatedImage {
    region: PageRegion,
    loaded: LoadedImage,
    summary: RelocationSummary,
    entry: KernelEntry,
}

/// Allocate, zero and populate memory for the image described by `headers`.
pub fn load_image<S, A>(source: &mut S, headers: &ImageHeaders, allocator: &mut A) -> BootResult<StagedImage>
where
    S: ImageSource + ?Sized,
    A: PageAllocator + ?Sized,
{
    let opt = headers.optional();
    let footprint = image_footprint(headers);
    let page_count = pages_for(footprint);

    log::debug!(
        "load: footprint={:#x} pages={} preferred={:#x} ({:?})",
        footprint,
        page_count,
        opt.image_base,
        config::IMAGE_MEMORY
    );
    let mut region = allocator.allocate_pages(opt.image_base, page_count)?;
    let base = region.base();
    let entry = KernelEntry::new(base, footprint, opt.entrypoint_rva)?;

    region.zero();

    let header_len = opt.size_of_headers as usize;
    source.set_position(0)?;
    source.read_exact(region.bytes_mut(0, header_len)?)?;

    for section in &headers.sections {
        let len = section.file_bytes() as usize;
        if len == 0 {
            log::trace!("load: {} has no file data", section.name());
            continue;
        }
        source.set_position(u64::from(section.pointer_to_raw_data))?;
        source.read_exact(region.bytes_mut(section.virtual_address as usize, len)?)?;
        log::trace!(
            "load: {:<8} rva={:#x} raw={:#x} virt={:#x}",
            section.name(),
            section.virtual_address,
            len,
            section.memory_size()
        );
    }

    let loaded = LoadedImage { base_address: base, page_count, entrypoint_address: entry.address() };
    log::info!("kernel staged at {:#x} ({} pages), entry {:#x}", base, page_count, loaded.entrypoint_address);

    Ok(StagedImage {
        region,
        loaded,
        preferred_base: opt.image_base,
        relocations: headers.relocation_directory(),
        relocatable: headers.is_relocatable(),
        entry,
    })
}

impl StagedImage {
    pub fn loaded(&self) -> &LoadedImage {
        &self.loaded
    }

    pub fn region(&self) -> &PageRegion {
        &self.region
    }

    /// Run the relocation pass. Consumes the staged image so the pass can
    /// only happen once, after every section is in place.
    pub fn relocate(mut self) -> BootResult<RelocatedImage> {
        let actual = self.region.base();
        let summary = if actual == self.preferred_base {
            RelocationSummary::default()
        } else if !self.relocatable {
            return Err(FormatError::NotRelocatable { preferred: self.preferred_base, actual }.into());
        } else if let Some(directory) = self.relocations {
            apply_relocations(&mut self.region, directory, self.preferred_base)?
        } else {
            log::warn!("kernel moved to {:#x} but carries no relocations", actual);
            RelocationSummary { delta: load_delta(actual, self.preferred_base), ..Default::default() }
        };

        Ok(RelocatedImage { region: self.region, loaded: self.loaded, summary, entry: self.entry })
    }
}

impl RelocatedImage {
    pub fn loaded(&self) -> &LoadedImage {
        &self.loaded
    }

    pub fn region(&self) -> &PageRegion {
        &self.region
    }

    pub fn summary(&self) -> &RelocationSummary {
        &self.summary
    }

    /// True when the image runs somewhere other than its preferred base.
    pub fn was_moved(&self) -> bool {
        self.summary.delta != 0
    }

    /// Give up the image for its entrypoint. The pages stay allocated.
    pub fn into_entry(self) -> KernelEntry {
        self.entry
    }
}
