// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest-visible ABI of the comb hypervisor.
//!
//! Everything a guest cell (or the user-space tooling running in the root
//! cell) needs in order to talk to the hypervisor lives here: hypercall
//! codes, error returns, info-query kinds, the communication-region protocol
//! codes, and the wire layout of the cell configuration blob handed to
//! `CELL_CREATE`.

#[macro_use]
extern crate bitflags;

use strum::FromRepr;
use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const PAGE_SIZE: u64 = 0x1000;

/// Size of the hypervisor's temporary remapping window, in pages. A cell
/// configuration blob must fit into this window (including the sub-page
/// offset of its start address).
pub const NUM_TEMPORARY_PAGES: u64 = 16;

/// Fixed width of the name field in [`CellDescRaw`], NUL-padded.
pub const CELL_NAME_LEN: usize = 32;

/// Hypercall codes, passed in the code register of the hypercall ABI
/// alongside two word-sized arguments.
#[derive(Clone, Copy, Debug, FromRepr, PartialEq, Eq)]
#[repr(u64)]
pub enum Hypercall {
    /// Collective hypervisor shutdown, issued once per root CPU.
    Disable = 0,
    /// `arg1` = guest-physical address of a [`CellDescRaw`] blob.
    CellCreate = 1,
    /// `arg1` = cell id.
    CellStart = 2,
    /// `arg1` = cell id.
    CellSetLoadable = 3,
    /// `arg1` = cell id.
    CellDestroy = 4,
    /// `arg1` = one of the `INFO_*` kinds.
    HypervisorGetInfo = 5,
    /// `arg1` = cell id.
    CellGetState = 6,
    /// `arg1` = CPU id, `arg2` = [`CPU_INFO_STATE`] or `CPU_INFO_STAT_BASE + i`.
    CpuGetInfo = 7,
}

// Negative hypercall returns.
pub const E_PERM: i64 = -1;
pub const E_NOENT: i64 = -2;
pub const E_TOO_BIG: i64 = -7;
pub const E_NOMEM: i64 = -12;
pub const E_BUSY: i64 = -16;
pub const E_EXIST: i64 = -17;
pub const E_INVAL: i64 = -22;
pub const E_NOSYS: i64 = -38;

// `HYPERVISOR_GET_INFO` kinds.
pub const INFO_MEM_POOL_SIZE: u64 = 0;
pub const INFO_MEM_POOL_USED: u64 = 1;
pub const INFO_REMAP_POOL_SIZE: u64 = 2;
pub const INFO_REMAP_POOL_USED: u64 = 3;
pub const INFO_NUM_CELLS: u64 = 4;

// `CPU_GET_INFO` kinds.
pub const CPU_INFO_STATE: u64 = 0;
pub const CPU_INFO_STAT_BASE: u64 = 1000;

// `CPU_GET_INFO(STATE)` results.
pub const CPU_STATE_RUNNING: i64 = 0;
pub const CPU_STATE_FAILED: i64 = 2;

/// Per-CPU statistics counters exposed via `CPU_GET_INFO`.
pub const NUM_CPU_STATS: usize = 32;
pub const CPU_STAT_VMEXITS_TOTAL: usize = 0;
pub const CPU_STAT_VMEXITS_MMIO: usize = 1;
pub const CPU_STAT_VMEXITS_MANAGEMENT: usize = 2;
pub const CPU_STAT_VMEXITS_HYPERCALL: usize = 3;

/// Statistics are reported with 30 significant bits; readers may observe
/// torn increments beyond that width.
pub const CPU_STAT_MASK: u32 = (1 << 30) - 1;

/// Value of the `cell_state` field of the communication region.
///
/// Written by the guest on guest-initiated transitions and by the
/// hypervisor on create/start/set-loadable and collective CPU failure.
#[derive(Clone, Copy, Debug, FromRepr, PartialEq, Eq)]
#[repr(u32)]
pub enum CellState {
    Running = 0,
    ShutDown = 1,
    Failed = 2,
    /// Running, and refusing any reconfiguration that would affect it.
    RunningLocked = 3,
}

// Messages to the cell (`msg_to_cell`).
pub const MSG_NONE: u32 = 0;
pub const MSG_SHUTDOWN_REQUEST: u32 = 1;
pub const MSG_RECONFIG_COMPLETED: u32 = 2;

// Replies from the cell (`reply_from_cell`).
pub const MSG_REQUEST_DENIED: u32 = 1;
pub const MSG_REQUEST_APPROVED: u32 = 2;
pub const MSG_RECEIVED: u32 = 3;

bitflags! {
    /// Attribute bits of a memory-region descriptor.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct MemFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const DMA = 1 << 3;
        /// Hypervisor-provided communication region; never backed by root
        /// cell memory.
        const COMM_REGION = 1 << 4;
        /// The root cell may access this region while the owning cell is
        /// loadable, for image loading.
        const LOADABLE = 1 << 5;
    }
}

bitflags! {
    /// Cell-wide flags in the configuration header.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct CellFlags: u32 {
        /// The cell does not service its communication region; the
        /// hypervisor treats every message as approved.
        const PASSIVE_COMMREG = 1 << 0;
    }
}

/// Header of the cell configuration blob passed to `CELL_CREATE`, followed
/// in memory by `cpu_set_size` bytes of CPU bitmap and `num_memory_regions`
/// [`MemRegionRaw`] descriptors.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CellDescRaw {
    pub name: [u8; CELL_NAME_LEN],
    pub flags: U32,
    pub cpu_set_size: U32,
    pub num_memory_regions: U32,
}

impl CellDescRaw {
    /// Total size of the configuration blob described by this header.
    pub fn config_size(&self) -> u64 {
        core::mem::size_of::<Self>() as u64
            + u64::from(self.cpu_set_size.get())
            + u64::from(self.num_memory_regions.get())
                * core::mem::size_of::<MemRegionRaw>() as u64
    }
}

/// On-wire memory-region descriptor. All fields must be page-aligned and
/// `flags` must be a subset of [`MemFlags`].
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MemRegionRaw {
    pub phys_start: U64,
    pub virt_start: U64,
    pub size: U64,
    pub flags: U64,
}
