//! reloc.rs: base relocation pass over a staged image
//!
//! Directory layout (inside the staged image, at the directory RVA):
//!   [page_rva: u32][block_size: u32][entry: u16]*   repeated
//! `block_size` counts the 8-byte header. Each entry is `type << 12 | offset`.
//! A zero `block_size` ends the walk early.

use crate::error::{BootResult, FormatError};
use crate::memory::PageRegion;
use crate::pe::DataDirectory;

const BLOCK_HEADER_SIZE: usize = 8;
const ENTRY_SIZE: usize = 2;

/// Relocation entry types the engine distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationKind {
    /// Type 0, alignment filler.
    Absolute,
    /// Type 10, 64-bit absolute address.
    Dir64,
    Other(u8),
}

impl RelocationKind {
    pub fn from_entry(entry: u16) -> Self {
        match (entry >> 12) as u8 {
            0 => Self::Absolute,
            10 => Self::Dir64,
            other => Self::Other(other),
        }
    }
}

/// What one pass did, for the boot log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelocationSummary {
    pub delta: i64,
    pub blocks: usize,
    pub applied: usize,
    pub padding: usize,
    pub ignored: usize,
}

/// Signed distance from the preferred base to where the image actually sits.
#[inline]
pub fn load_delta(actual: u64, preferred: u64) -> i64 {
    actual.wrapping_sub(preferred) as i64
}

/// Patch every DIR64 fixup listed in `directory` so the image runs at
/// `region.base()` instead of `preferred`.
///
/// A zero delta returns immediately and leaves the region untouched.
pub fn apply_relocations(
    region: &mut PageRegion,
    directory: DataDirectory,
    preferred: u64,
) -> BootResult<RelocationSummary> {
    let delta = load_delta(region.base(), preferred);
    let mut summary = RelocationSummary { delta, ..Default::default() };
    if delta == 0 {
        log::debug!("reloc: image at preferred base, nothing to do");
        return Ok(summary);
    }

    let start = directory.virtual_address as usize;
    let end = start.saturating_add(directory.size as usize);
    let mut cursor = start;

    while cursor + BLOCK_HEADER_SIZE <= end {
        let page_rva = region.read_u32(cursor)? as usize;
        let block_size = region.read_u32(cursor + 4)?;
        if block_size == 0 {
            break;
        }
        if (block_size as usize) < BLOCK_HEADER_SIZE {
            return Err(FormatError::MalformedRelocationBlock { offset: cursor, size: block_size }.into());
        }

        let block_end = cursor.saturating_add(block_size as usize).min(end);
        let mut at = cursor + BLOCK_HEADER_SIZE;
        while at + ENTRY_SIZE <= block_end {
            let entry = region.read_u16(at)?;
            match RelocationKind::from_entry(entry) {
                RelocationKind::Absolute => summary.padding += 1,
                RelocationKind::Dir64 => {
                    let target = page_rva + usize::from(entry & 0x0FFF);
                    let value = region.read_u64(target)?;
                    region.write_u64(target, value.wrapping_add(delta as u64))?;
                    summary.applied += 1;
                }
                RelocationKind::Other(kind) => {
                    log::trace!("reloc: ignoring type {} at page {:#x}", kind, page_rva);
                    summary.ignored += 1;
                }
            }
            at += ENTRY_SIZE;
        }

        summary.blocks += 1;
        cursor += block_size as usize;
    }

    log::debug!(
        "reloc: delta={:#x} blocks={} applied={} ignored={}",
        delta,
        summary.blocks,
        summary.applied,
        summary.ignored
    );
    Ok(summary)
}
