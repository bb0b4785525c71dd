// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hypercall dispatch, collective shutdown, info queries, and the panic
//! paths.

use std::sync::atomic::Ordering;

use comb_api as api;
use comb_api::{CellState, Hypercall};
use slog::{error, info};

use crate::control::{Inner, INVALID_CPU};
use crate::percpu::ShutdownState;
use crate::{CpuId, Error, Hypervisor, Result, ROOT_CELL_ID};

fn as_code(result: Result<()>) -> i64 {
    match result {
        Ok(()) => 0,
        Err(err) => err.code(),
    }
}

impl Hypervisor {
    /// Hypercall entry point: `code` plus two word-sized arguments, from
    /// the guest CPU `caller`. Negative returns are error codes.
    pub fn hypercall(
        &self,
        caller: CpuId,
        code: u64,
        arg1: u64,
        arg2: u64,
    ) -> i64 {
        if !self.sys.cpu_id_valid(u64::from(caller)) {
            return Error::Invalid.code();
        }

        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.per_cpu_mut(caller).count(api::CPU_STAT_VMEXITS_HYPERCALL);

        match Hypercall::from_repr(code) {
            Some(Hypercall::Disable) => self.shutdown(inner, caller),
            Some(Hypercall::CellCreate) => {
                match self.cell_create(inner, caller, arg1) {
                    Ok(id) => i64::from(id),
                    Err(err) => err.code(),
                }
            }
            Some(Hypercall::CellStart) => {
                as_code(self.cell_start(inner, caller, arg1))
            }
            Some(Hypercall::CellSetLoadable) => {
                as_code(self.cell_set_loadable(inner, caller, arg1))
            }
            Some(Hypercall::CellDestroy) => {
                as_code(self.cell_destroy(inner, caller, arg1))
            }
            Some(Hypercall::HypervisorGetInfo) => {
                self.hypervisor_get_info(inner, arg1)
            }
            Some(Hypercall::CellGetState) => {
                match self.cell_get_state(inner, caller, arg1) {
                    Ok(state) => i64::from(state),
                    Err(err) => err.code(),
                }
            }
            Some(Hypercall::CpuGetInfo) => {
                self.cpu_get_info(inner, caller, arg1, arg2)
            }
            None => Error::NoSys.code(),
        }
    }

    /// Collective hypervisor shutdown.
    ///
    /// The first root CPU to arrive makes the decision for all of them:
    /// if every non-root cell approves, the cells are torn down and the
    /// architecture layer shuts the hypervisor down; either way the outcome
    /// is recorded in every root CPU's shutdown state, and each CPU
    /// consumes its own copy on its (next) `DISABLE` call.
    fn shutdown(&self, inner: &mut Inner, caller: CpuId) -> i64 {
        // shutdown over non-root cells is not supported
        if inner.per_cpu(caller).cell != ROOT_CELL_ID {
            return Error::Permission.code();
        }

        let _lock = self.shutdown_lock.lock().unwrap();

        if inner.per_cpu(caller).shutdown_state == ShutdownState::None {
            let mut state = ShutdownState::Started;
            for cell in inner.cells.iter_non_root() {
                if !self.cell_shutdown_ok(cell) {
                    state = ShutdownState::Failed(Error::Permission);
                }
            }

            if state == ShutdownState::Started {
                info!(self.log, "shutting down hypervisor");

                for cell in inner.cells.iter_non_root() {
                    self.cell_suspend(cell, caller);
                    info!(self.log, "closing cell \"{}\"", cell.name());
                    for cpu in cell.cpu_set.iter() {
                        info!(self.log, "releasing CPU {}", cpu);
                        self.arch.shutdown_cpu(cpu);
                    }
                }

                info!(
                    self.log,
                    "closing root cell \"{}\"",
                    inner.cells.root().name()
                );
                self.arch.shutdown();
            }

            for cpu in inner.cells.root().cpu_set.iter() {
                inner.per_cpu[cpu as usize].shutdown_state = state;
            }
        }

        let ret = match inner.per_cpu(caller).shutdown_state {
            ShutdownState::Started => {
                info!(self.log, "releasing CPU {}", caller);
                0
            }
            ShutdownState::Failed(err) => err.code(),
            ShutdownState::None => 0,
        };
        inner.per_cpu_mut(caller).shutdown_state = ShutdownState::None;

        ret
    }

    fn hypervisor_get_info(&self, inner: &Inner, kind: u64) -> i64 {
        match kind {
            api::INFO_MEM_POOL_SIZE => inner.mem_pool.pages() as i64,
            api::INFO_MEM_POOL_USED => inner.mem_pool.used_pages() as i64,
            api::INFO_REMAP_POOL_SIZE => inner.remap_pool.pages() as i64,
            api::INFO_REMAP_POOL_USED => inner.remap_pool.used_pages() as i64,
            api::INFO_NUM_CELLS => i64::from(inner.cells.num_cells()),
            _ => Error::Invalid.code(),
        }
    }

    fn cpu_get_info(
        &self,
        inner: &Inner,
        caller: CpuId,
        cpu_id: u64,
        kind: u64,
    ) -> i64 {
        if !self.sys.cpu_id_valid(cpu_id) {
            return Error::Invalid.code();
        }
        let cpu_id = cpu_id as CpuId;

        // Only the root cell may look at foreign CPUs. No quiescence needed
        // here either: a concurrent destroy of the caller's cell cannot get
        // past suspending it while this CPU is still in here.
        let caller_cell = inner.per_cpu(caller).cell;
        if caller_cell != ROOT_CELL_ID
            && !inner
                .cells
                .by_id(caller_cell)
                .expect("per-CPU record homes to a live cell")
                .owns_cpu(cpu_id)
        {
            return Error::Permission.code();
        }

        if kind == api::CPU_INFO_STATE {
            if inner.per_cpu(cpu_id).failed {
                api::CPU_STATE_FAILED
            } else {
                api::CPU_STATE_RUNNING
            }
        } else if kind
            .checked_sub(api::CPU_INFO_STAT_BASE)
            .is_some_and(|stat| stat < api::NUM_CPU_STATS as u64)
        {
            let stat = (kind - api::CPU_INFO_STAT_BASE) as usize;
            i64::from(inner.per_cpu(cpu_id).stat(stat))
        } else {
            Error::Invalid.code()
        }
    }

    /// Record `cpu` as the panicking CPU. Returns false if another CPU's
    /// panic is already in progress; the caller should back off and let
    /// that one finish.
    pub fn panic_begin(&self, cpu: CpuId) -> bool {
        if self
            .panic_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.panic_cpu.store(cpu, Ordering::Release);
        true
    }

    pub fn panic_in_progress(&self) -> bool {
        self.panic_in_progress.load(Ordering::Acquire)
    }

    fn panic_clear(&self, cpu: CpuId) {
        if self.panic_cpu.load(Ordering::Acquire) == cpu {
            self.panic_cpu.store(INVALID_CPU, Ordering::Release);
            self.panic_in_progress.store(false, Ordering::Release);
        }
    }

    /// Stop a CPU that cannot continue. `cpu` must be a configured CPU;
    /// called from its own exception context.
    pub fn panic_stop(&self, cpu: CpuId) {
        error!(self.log, "stopping CPU {}", cpu);

        self.inner.lock().unwrap().per_cpu_mut(cpu).stopped = true;

        self.panic_clear(cpu);
        self.arch.panic_stop(cpu);
    }

    /// Park a CPU whose guest has faulted irrecoverably; once every CPU of
    /// its cell has failed, the cell itself is marked failed.
    pub fn panic_halt(&self, cpu: CpuId) {
        error!(self.log, "parking CPU {}", cpu);

        {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            inner.per_cpu_mut(cpu).failed = true;

            let cell = inner.cell_of(cpu);
            let cell_failed =
                cell.cpu_set.iter().all(|c| inner.per_cpu[c as usize].failed);
            if cell_failed {
                cell.comm().set_cell_state(CellState::Failed);
            }
        }

        self.arch.panic_halt(cpu);
        self.panic_clear(cpu);
    }
}
