// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-CPU bookkeeping.

use comb_api as api;

use crate::{CellId, CpuId, Error};

/// Progress of a collective hypervisor shutdown as seen by one root CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ShutdownState {
    #[default]
    None,
    Started,
    /// The collective decision failed; the error is handed to each root CPU
    /// on its next `DISABLE` call.
    Failed(Error),
}

/// Control-plane state of one physical CPU.
///
/// Mutated only under the reconfiguration lock, except for the statistics
/// counters which are owned by the CPU itself.
#[derive(Debug)]
pub struct PerCpu {
    pub cpu_id: CpuId,
    /// The cell this CPU currently belongs to.
    pub cell: CellId,
    pub failed: bool,
    pub stopped: bool,
    pub shutdown_state: ShutdownState,
    pub stats: [u32; api::NUM_CPU_STATS],
}

impl PerCpu {
    pub fn new(cpu_id: CpuId, cell: CellId) -> Self {
        Self {
            cpu_id,
            cell,
            failed: false,
            stopped: false,
            shutdown_state: ShutdownState::None,
            stats: [0; api::NUM_CPU_STATS],
        }
    }

    /// Bump one statistics counter. Counters wrap; readers see 30 bits.
    pub fn count(&mut self, stat: usize) {
        self.stats[stat] = self.stats[stat].wrapping_add(1);
    }

    /// Read one statistics counter, masked to its significant bits.
    pub fn stat(&self, stat: usize) -> u32 {
        self.stats[stat] & api::CPU_STAT_MASK
    }

    pub fn clear_stats(&mut self) {
        self.stats = [0; api::NUM_CPU_STATS];
    }
}
