// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! System and cell configuration.
//!
//! The system configuration is fixed at hypervisor entry and describes the
//! root cell. Non-root cell configurations arrive at runtime as guest
//! blobs ([`comb_api::CellDescRaw`] header, CPU bitmap, region table) and
//! are parsed into an owned [`CellConfig`] held by the cell for its
//! lifetime.

use comb_api::{CellDescRaw, CellFlags, MemRegionRaw, CELL_NAME_LEN};
use zerocopy::FromBytes;

use crate::memory::MemRegion;
use crate::{Error, Result};

/// Owned configuration of one cell.
#[derive(Clone, Debug)]
pub struct CellConfig {
    pub name: String,
    pub flags: CellFlags,
    /// Little-endian CPU bitmap; fixes the cell's CPU-set capacity.
    pub cpu_bitmap: Vec<u8>,
    pub regions: Vec<MemRegion>,
}

pub(crate) fn parse_name(raw: &[u8; CELL_NAME_LEN]) -> Result<String> {
    let len = raw.iter().position(|b| *b == 0).unwrap_or(CELL_NAME_LEN);
    let name = std::str::from_utf8(&raw[..len]).map_err(|_| Error::Invalid)?;
    Ok(name.to_owned())
}

impl CellConfig {
    /// Parse a configuration blob. `bytes` must hold at least
    /// [`CellDescRaw::config_size`] bytes.
    pub fn parse(bytes: &[u8]) -> Result<CellConfig> {
        let (desc, _) =
            CellDescRaw::read_from_prefix(bytes).map_err(|_| Error::Invalid)?;
        if (bytes.len() as u64) < desc.config_size() {
            return Err(Error::Invalid);
        }

        let name = parse_name(&desc.name)?;
        let flags = CellFlags::from_bits_retain(desc.flags.get());

        let mut offset = std::mem::size_of::<CellDescRaw>();
        let bitmap_len = desc.cpu_set_size.get() as usize;
        let cpu_bitmap = bytes[offset..offset + bitmap_len].to_vec();
        offset += bitmap_len;

        let mut regions =
            Vec::with_capacity(desc.num_memory_regions.get() as usize);
        for _ in 0..desc.num_memory_regions.get() {
            let (raw, _) = MemRegionRaw::read_from_prefix(&bytes[offset..])
                .map_err(|_| Error::Invalid)?;
            regions.push(MemRegion::from(&raw));
            offset += std::mem::size_of::<MemRegionRaw>();
        }

        Ok(CellConfig { name, flags, cpu_bitmap, regions })
    }
}

/// The immutable boot-time system configuration.
#[derive(Clone, Debug)]
pub struct SystemConfig {
    /// Root cell descriptor; its CPU bitmap defines the set of CPUs the
    /// system runs at all.
    pub root: CellConfig,
    pub mem_pool_pages: u64,
    pub remap_pool_pages: u64,
}

impl SystemConfig {
    /// Whether `cpu` exists in the system configuration, regardless of
    /// which cell currently owns it.
    pub fn cpu_id_valid(&self, cpu: u64) -> bool {
        let bitmap = &self.root.cpu_bitmap;
        cpu < bitmap.len() as u64 * 8
            && bitmap[(cpu / 8) as usize] & (1 << (cpu % 8)) != 0
    }
}
