// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory-region bookkeeping: validation, unmapping from the root cell, and
//! reassembly of the root cell's map when regions return to it.

use comb_api::{MemFlags, MemRegionRaw, PAGE_SIZE};
use slog::{warn, Logger};

use crate::arch::Arch;
use crate::{Result, ROOT_CELL_ID};

/// A memory-region descriptor with page-aligned bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemRegion {
    pub phys_start: u64,
    pub virt_start: u64,
    pub size: u64,
    pub flags: MemFlags,
}

impl MemRegion {
    /// Whether `addr` falls inside this region's physical range.
    pub fn contains_addr(&self, addr: u64) -> bool {
        addr >= self.phys_start && addr < self.phys_start + self.size
    }
}

impl From<&MemRegionRaw> for MemRegion {
    fn from(raw: &MemRegionRaw) -> Self {
        MemRegion {
            phys_start: raw.phys_start.get(),
            virt_start: raw.virt_start.get(),
            size: raw.size.get(),
            // unknown bits are preserved so validation can reject them
            flags: MemFlags::from_bits_retain(raw.flags.get()),
        }
    }
}

/// What to do when reassembling the root map hits a mapping failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureMode {
    AbortOnError,
    WarnOnError,
}

pub(crate) fn page_count(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

/// Validate a configured region list: all bounds page-aligned, flags within
/// the valid mask.
pub fn check_regions(regions: &[MemRegion]) -> Result<()> {
    for region in regions {
        if region.phys_start % PAGE_SIZE != 0
            || region.virt_start % PAGE_SIZE != 0
            || region.size % PAGE_SIZE != 0
            || region.flags.bits() & !MemFlags::all().bits() != 0
        {
            return Err(crate::Error::Invalid);
        }
    }
    Ok(())
}

/// Compute the fragment of `mem` covered by the root region `root`, in
/// root-cell terms: physical intersection, the root virtual address of that
/// intersection, and the root region's flags.
pub fn overlap(root: &MemRegion, mem: &MemRegion) -> Option<MemRegion> {
    let (phys_start, size) = if root.contains_addr(mem.phys_start) {
        let size = root.size - (mem.phys_start - root.phys_start);
        (mem.phys_start, size.min(mem.size))
    } else if mem.contains_addr(root.phys_start) {
        let size = mem.size - (root.phys_start - mem.phys_start);
        (root.phys_start, size.min(root.size))
    } else {
        return None;
    };

    Some(MemRegion {
        phys_start,
        virt_start: root.virt_start + (phys_start - root.phys_start),
        size,
        flags: root.flags,
    })
}

/// Unmap `region` from the root cell.
///
/// The architecture layer works on virtual addresses, and only the root cell
/// has a guaranteed 1:1 mapping, so a copy with `virt_start = phys_start` is
/// what gets unmapped. Must not be called for `COMM_REGION` regions, which
/// are never backed by root memory.
pub(crate) fn unmap_from_root(
    arch: &dyn Arch,
    region: &MemRegion,
) -> Result<()> {
    debug_assert!(!region.flags.contains(MemFlags::COMM_REGION));
    let identity = MemRegion { virt_start: region.phys_start, ..*region };
    arch.unmap_region(ROOT_CELL_ID, &identity)
}

/// Map every fragment of `region` that the root cell's configuration covers
/// back into the root cell.
///
/// With [`FailureMode::AbortOnError`] the first mapping failure is returned;
/// with [`FailureMode::WarnOnError`] failures are logged and the remaining
/// fragments are still attempted.
pub(crate) fn remap_to_root(
    arch: &dyn Arch,
    root_regions: &[MemRegion],
    region: &MemRegion,
    mode: FailureMode,
    log: &Logger,
) -> Result<()> {
    for root_region in root_regions {
        let Some(fragment) = overlap(root_region, region) else {
            continue;
        };
        if let Err(err) = arch.map_region(ROOT_CELL_ID, &fragment) {
            if mode == FailureMode::AbortOnError {
                return Err(err);
            }
            warn!(
                log,
                "failed to reassign memory region to root cell";
                "phys_start" => fragment.phys_start,
                "size" => fragment.size
            );
        }
    }
    Ok(())
}
