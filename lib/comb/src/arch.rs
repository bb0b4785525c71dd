// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The architecture seam.
//!
//! Everything that touches real hardware state — per-CPU virtualization
//! control, guest page tables, the temporary remapping window — sits behind
//! [`Arch`]. The control plane never commits to hardware directly; it
//! drives these primitives and owns the ordering between them.

use crate::cell::Cell;
use crate::memory::MemRegion;
use crate::{CellId, CpuId, Result};

pub trait Arch: Send + Sync {
    /// Synchronously suspend `cpu`: returns only once the target has
    /// entered the suspended state.
    fn suspend_cpu(&self, cpu: CpuId);

    fn resume_cpu(&self, cpu: CpuId);

    /// Put `cpu` into the parked idle loop, detached from any guest.
    fn park_cpu(&self, cpu: CpuId);

    /// Reset `cpu` to its cell's entry state and let it run.
    fn reset_cpu(&self, cpu: CpuId);

    /// Hand `cpu` back to the previous owner during hypervisor shutdown.
    fn shutdown_cpu(&self, cpu: CpuId);

    /// Set up architectural state (address space roots, intercepts) for a
    /// cell about to be populated.
    fn cell_create(&self, cell: &Cell) -> Result<()>;

    fn cell_destroy(&self, cell: CellId);

    fn map_region(&self, cell: CellId, region: &MemRegion) -> Result<()>;

    fn unmap_region(&self, cell: CellId, region: &MemRegion) -> Result<()>;

    /// Make previously staged mapping and cell-state changes visible to the
    /// hardware. `changed` names the cell whose configuration drove the
    /// update, if any single one did.
    fn config_commit(&self, changed: Option<CellId>);

    /// Tear down the hypervisor itself; called once, after every non-root
    /// cell has been shut down.
    fn shutdown(&self);

    /// Halt a CPU that cannot continue; does not mark the cell failed.
    fn panic_stop(&self, cpu: CpuId);

    /// Park a CPU whose guest has faulted irrecoverably.
    fn panic_halt(&self, cpu: CpuId);

    /// Map `num_pages` guest-physical pages starting at the page containing
    /// `gpa` read-only into the temporary window, returning their bytes.
    /// `None` if the pages are not accessible guest memory.
    fn read_guest_pages(&self, gpa: u64, num_pages: u64) -> Option<Vec<u8>>;
}
