// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cell lifecycle and reconfiguration.
//!
//! Every operation that mutates cell state, CPU assignment, or memory maps
//! runs between `cell_suspend(root)` and `cell_resume(root)`: with all other
//! root CPUs frozen, the caller is the only agent that can touch shared
//! state, and the resume is the commit point at which the new configuration
//! becomes observable.

use std::mem::size_of;
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::{Arc, Mutex};

use comb_api as api;
use comb_api::{
    CellDescRaw, CellState, MemFlags, NUM_TEMPORARY_PAGES, PAGE_SIZE,
};
use slog::{debug, info, Logger};
use zerocopy::FromBytes;

use crate::arch::Arch;
use crate::cell::{Cell, Registry};
use crate::comm::{self, MsgKind};
use crate::config::{self, CellConfig, SystemConfig};
use crate::memory::{self, page_count, FailureMode, MemRegion};
use crate::percpu::PerCpu;
use crate::pool::MemPool;
use crate::{CellId, CpuId, Error, Result, ROOT_CELL_ID};

pub(crate) const INVALID_CPU: CpuId = CpuId::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ManagementTask {
    Start,
    SetLoadable,
    Destroy,
}

/// Registry, per-CPU records, and pool accounting: everything the
/// reconfiguration lock protects.
pub(crate) struct Inner {
    pub(crate) cells: Registry,
    pub(crate) per_cpu: Vec<PerCpu>,
    pub(crate) mem_pool: MemPool,
    pub(crate) remap_pool: MemPool,
}

impl Inner {
    pub(crate) fn per_cpu(&self, cpu: CpuId) -> &PerCpu {
        &self.per_cpu[cpu as usize]
    }

    pub(crate) fn per_cpu_mut(&mut self, cpu: CpuId) -> &mut PerCpu {
        &mut self.per_cpu[cpu as usize]
    }

    pub(crate) fn cell_of(&self, cpu: CpuId) -> &Cell {
        let id = self.per_cpu(cpu).cell;
        self.cells.by_id(id).expect("per-CPU record homes to a live cell")
    }

    /// Whether reconfiguration may proceed: no non-root cell other than
    /// `excluded` has locked itself against it.
    pub(crate) fn reconfig_ok(&self, excluded: Option<CellId>) -> bool {
        self.cells.iter_non_root().all(|cell| {
            Some(cell.id()) == excluded
                || cell.comm().cell_state_raw()
                    != CellState::RunningLocked as u32
        })
    }
}

/// The control plane of the hypervisor.
///
/// Owns the cell registry and drives all reconfiguration; architecture
/// specifics stay behind the [`Arch`] handle. One value exists per machine.
pub struct Hypervisor {
    pub(crate) arch: Arc<dyn Arch>,
    pub(crate) log: Logger,
    pub(crate) sys: SystemConfig,
    pub(crate) inner: Mutex<Inner>,
    pub(crate) shutdown_lock: Mutex<()>,
    pub(crate) panic_in_progress: AtomicBool,
    pub(crate) panic_cpu: AtomicU32,
}

impl Hypervisor {
    /// Stand up the control plane over a booted system. The root cell is
    /// built from the system configuration and initially owns every
    /// configured CPU and memory region.
    pub fn new(
        sys: SystemConfig,
        arch: Arc<dyn Arch>,
        log: Logger,
    ) -> Result<Self> {
        memory::check_regions(&sys.root.regions)?;

        let mut mem_pool = MemPool::new(sys.mem_pool_pages);
        let remap_pool = MemPool::new(sys.remap_pool_pages);

        let root =
            Cell::new(ROOT_CELL_ID, sys.root.clone(), 0, &mut mem_pool)?;
        root.comm().set_cell_state(CellState::Running);

        let cpu_slots = sys.root.cpu_bitmap.len() * 8;
        let per_cpu = (0..cpu_slots as CpuId)
            .map(|cpu| PerCpu::new(cpu, ROOT_CELL_ID))
            .collect();

        Ok(Self {
            arch,
            log,
            sys,
            inner: Mutex::new(Inner {
                cells: Registry::new(root),
                per_cpu,
                mem_pool,
                remap_pool,
            }),
            shutdown_lock: Mutex::new(()),
            panic_in_progress: AtomicBool::new(false),
            panic_cpu: AtomicU32::new(INVALID_CPU),
        })
    }

    /// Freeze every CPU of `cell` except `caller`. Only safe from a CPU
    /// that belongs to `cell`.
    pub(crate) fn cell_suspend(&self, cell: &Cell, caller: CpuId) {
        for cpu in cell.cpu_set.iter_except(caller) {
            self.arch.suspend_cpu(cpu);
        }
    }

    /// Release the caller's own cell from suspension.
    pub(crate) fn cell_resume(&self, inner: &Inner, caller: CpuId) {
        for cpu in inner.cell_of(caller).cpu_set.iter_except(caller) {
            self.arch.resume_cpu(cpu);
        }
    }

    pub(crate) fn cell_shutdown_ok(&self, cell: &Cell) -> bool {
        comm::send_and_wait(
            cell,
            api::MSG_SHUTDOWN_REQUEST,
            MsgKind::Request,
            &self.log,
        )
    }

    /// Tell every non-root cell that the cell set changed.
    pub(crate) fn reconfig_completed(&self, inner: &Inner) {
        for cell in inner.cells.iter_non_root() {
            comm::send_and_wait(
                cell,
                api::MSG_RECONFIG_COMPLETED,
                MsgKind::Information,
                &self.log,
            );
        }
    }

    /// Common entry of start/set-loadable/destroy: establish quiescence,
    /// locate and vet the target, obtain its consent, and suspend it.
    /// On success the root cell is left suspended; every error path has
    /// already resumed it.
    fn management_prologue(
        &self,
        inner: &Inner,
        task: ManagementTask,
        caller: CpuId,
        id: u64,
    ) -> Result<CellId> {
        // management over non-root cells is not supported
        if inner.per_cpu(caller).cell != ROOT_CELL_ID {
            return Err(Error::Permission);
        }

        self.cell_suspend(inner.cells.root(), caller);

        let cell = match u32::try_from(id).ok().and_then(|i| inner.cells.by_id(i))
        {
            Some(cell) => cell,
            None => {
                self.cell_resume(inner, caller);
                return Err(Error::NotFound);
            }
        };

        // the root cell cannot be managed
        if cell.id() == ROOT_CELL_ID {
            self.cell_resume(inner, caller);
            return Err(Error::Invalid);
        }

        if (task == ManagementTask::Destroy
            && !inner.reconfig_ok(Some(cell.id())))
            || !self.cell_shutdown_ok(cell)
        {
            self.cell_resume(inner, caller);
            return Err(Error::Permission);
        }

        self.cell_suspend(cell, caller);

        Ok(cell.id())
    }

    pub(crate) fn cell_create(
        &self,
        inner: &mut Inner,
        caller: CpuId,
        config_addr: u64,
    ) -> Result<CellId> {
        // creation over non-root cells is not supported
        if inner.per_cpu(caller).cell != ROOT_CELL_ID {
            return Err(Error::Permission);
        }

        self.cell_suspend(inner.cells.root(), caller);
        let result = self.cell_create_locked(inner, caller, config_addr);
        self.cell_resume(inner, caller);
        result
    }

    fn cell_create_locked(
        &self,
        inner: &mut Inner,
        caller: CpuId,
        config_addr: u64,
    ) -> Result<CellId> {
        if !inner.reconfig_ok(None) {
            return Err(Error::Permission);
        }

        let page_offs = config_addr % PAGE_SIZE;
        let offs = page_offs as usize;

        // map enough of the blob to read the header
        let hdr_pages = page_count(size_of::<CellDescRaw>() as u64 + page_offs);
        let window = self
            .arch
            .read_guest_pages(config_addr, hdr_pages)
            .ok_or(Error::NoMem)?;
        let (desc, _) = CellDescRaw::read_from_prefix(&window[offs..])
            .map_err(|_| Error::Invalid)?;

        let name = config::parse_name(&desc.name)?;
        if inner.cells.by_name(&name).is_some() {
            return Err(Error::Exists);
        }

        // re-map at the full size the header claims
        let total_size = desc.config_size();
        let cfg_pages = page_count(total_size + page_offs);
        if cfg_pages > NUM_TEMPORARY_PAGES {
            return Err(Error::TooBig);
        }
        let window = self
            .arch
            .read_guest_pages(config_addr, cfg_pages)
            .ok_or(Error::NoMem)?;
        let cell_config = CellConfig::parse(&window[offs..])?;

        memory::check_regions(&cell_config.regions)?;

        let data_pages = page_count(size_of::<Cell>() as u64 + total_size);
        let id = inner.cells.free_id();
        let cell =
            Cell::new(id, cell_config, data_pages, &mut inner.mem_pool)?;

        // never assign the CPU this call is running on
        if cell.owns_cpu(caller) {
            cell.release_pool(&mut inner.mem_pool);
            return Err(Error::Busy);
        }
        // the root cell's CPU set must be a super-set of the new cell's
        for cpu in cell.cpu_set.iter() {
            if !inner.cells.root().owns_cpu(cpu) {
                cell.release_pool(&mut inner.mem_pool);
                return Err(Error::Busy);
            }
        }

        if let Err(err) = self.arch.cell_create(&cell) {
            cell.release_pool(&mut inner.mem_pool);
            return Err(err);
        }

        for cpu in cell.cpu_set.iter() {
            self.arch.park_cpu(cpu);

            inner.cells.root_mut().cpu_set.clear(cpu);
            let pc = &mut inner.per_cpu[cpu as usize];
            pc.cell = cell.id();
            pc.clear_stats();
        }

        // Move the cell's memory out of the root cell and into the new one.
        let mut map_result = Ok(());
        for region in cell.config().regions.iter() {
            // the communication region is not backed by root memory
            if !region.flags.contains(MemFlags::COMM_REGION) {
                map_result =
                    memory::unmap_from_root(self.arch.as_ref(), region);
                if map_result.is_err() {
                    break;
                }
            }
            map_result = self.arch.map_region(cell.id(), region);
            if map_result.is_err() {
                break;
            }
        }
        if let Err(err) = map_result {
            self.cell_destroy_internal(inner, &cell);
            cell.release_pool(&mut inner.mem_pool);
            return Err(err);
        }

        self.arch.config_commit(Some(cell.id()));

        cell.comm().set_cell_state(CellState::ShutDown);

        info!(self.log, "created cell \"{}\"", cell.name());
        inner.cells.insert(cell);

        self.reconfig_completed(inner);

        debug!(
            self.log,
            "page pools after cell creation";
            "mem_used" => inner.mem_pool.used_pages(),
            "mem_pages" => inner.mem_pool.pages()
        );

        Ok(id)
    }

    pub(crate) fn cell_start(
        &self,
        inner: &mut Inner,
        caller: CpuId,
        id: u64,
    ) -> Result<()> {
        let cell_id =
            self.management_prologue(inner, ManagementTask::Start, caller, id)?;
        let result = self.cell_start_locked(inner, cell_id);
        self.cell_resume(inner, caller);
        result
    }

    fn cell_start_locked(&self, inner: &mut Inner, id: CellId) -> Result<()> {
        let cell = inner.cells.by_id_mut(id).expect("prologue found the cell");

        if cell.loadable {
            // make the loaded image private to the cell again
            for region in cell.config().regions.iter() {
                if region.flags.contains(MemFlags::LOADABLE) {
                    memory::unmap_from_root(self.arch.as_ref(), region)?;
                }
            }
            self.arch.config_commit(None);
            cell.loadable = false;
        }

        // present a consistent communication region to the starting cell
        cell.comm().set_cell_state(CellState::Running);
        cell.comm().clear_message();

        for cpu in cell.cpu_set.iter() {
            inner.per_cpu[cpu as usize].failed = false;
            self.arch.reset_cpu(cpu);
        }

        info!(self.log, "started cell \"{}\"", cell.name());
        Ok(())
    }

    pub(crate) fn cell_set_loadable(
        &self,
        inner: &mut Inner,
        caller: CpuId,
        id: u64,
    ) -> Result<()> {
        let cell_id = self.management_prologue(
            inner,
            ManagementTask::SetLoadable,
            caller,
            id,
        )?;
        let result = self.cell_set_loadable_locked(inner, cell_id);
        self.cell_resume(inner, caller);
        result
    }

    fn cell_set_loadable_locked(
        &self,
        inner: &mut Inner,
        id: CellId,
    ) -> Result<()> {
        let cell = inner.cells.by_id_mut(id).expect("prologue found the cell");
        for cpu in cell.cpu_set.iter() {
            inner.per_cpu[cpu as usize].failed = false;
            self.arch.park_cpu(cpu);
        }

        if cell.loadable {
            return Ok(());
        }

        cell.comm().set_cell_state(CellState::ShutDown);
        cell.loadable = true;
        let name = cell.name().to_owned();
        let loadable_regions: Vec<MemRegion> = cell
            .config()
            .regions
            .iter()
            .filter(|r| r.flags.contains(MemFlags::LOADABLE))
            .copied()
            .collect();

        // make the image regions reachable from the root cell for loading
        for region in &loadable_regions {
            memory::remap_to_root(
                self.arch.as_ref(),
                &inner.cells.root().config().regions,
                region,
                FailureMode::AbortOnError,
                &self.log,
            )?;
        }
        self.arch.config_commit(None);

        info!(self.log, "cell \"{}\" can be loaded", name);
        Ok(())
    }

    pub(crate) fn cell_destroy(
        &self,
        inner: &mut Inner,
        caller: CpuId,
        id: u64,
    ) -> Result<()> {
        let cell_id = self.management_prologue(
            inner,
            ManagementTask::Destroy,
            caller,
            id,
        )?;

        // Ownership leaves the registry before teardown; with the root cell
        // suspended the intermediate state is unobservable.
        let cell =
            inner.cells.remove(cell_id).expect("prologue found the cell");
        info!(self.log, "closing cell \"{}\"", cell.name());

        self.cell_destroy_internal(inner, &cell);
        cell.release_pool(&mut inner.mem_pool);
        drop(cell);

        debug!(
            self.log,
            "page pools after cell destruction";
            "mem_used" => inner.mem_pool.used_pages(),
            "mem_pages" => inner.mem_pool.pages()
        );

        self.reconfig_completed(inner);
        self.cell_resume(inner, caller);
        Ok(())
    }

    /// Return a cell's CPUs and memory to the root cell and tear down its
    /// architectural state. Used by destroy and by create's rollback; the
    /// cell is already (or still) outside the registry.
    fn cell_destroy_internal(&self, inner: &mut Inner, cell: &Cell) {
        for cpu in cell.cpu_set.iter() {
            self.arch.park_cpu(cpu);

            inner.cells.root_mut().cpu_set.set(cpu);
            let pc = &mut inner.per_cpu[cpu as usize];
            pc.cell = ROOT_CELL_ID;
            pc.failed = false;
            pc.clear_stats();
        }

        for region in cell.config().regions.iter() {
            // The region was mapped as a whole, so no larger block has to
            // be split to unmap it; there is no recovery from failure here.
            let _ = self.arch.unmap_region(cell.id(), region);
            if !region.flags.contains(MemFlags::COMM_REGION) {
                let _ = memory::remap_to_root(
                    self.arch.as_ref(),
                    &inner.cells.root().config().regions,
                    region,
                    FailureMode::WarnOnError,
                    &self.log,
                );
            }
        }

        self.arch.cell_destroy(cell.id());
        self.arch.config_commit(Some(cell.id()));
    }

    pub(crate) fn cell_get_state(
        &self,
        inner: &Inner,
        caller: CpuId,
        id: u64,
    ) -> Result<u32> {
        if inner.per_cpu(caller).cell != ROOT_CELL_ID {
            return Err(Error::Permission);
        }

        // No quiescence needed: a concurrent create/destroy cannot finish
        // its own cell_suspend(root) while this CPU is still in here.
        let cell = u32::try_from(id)
            .ok()
            .and_then(|i| inner.cells.by_id(i))
            .ok_or(Error::NotFound)?;
        match cell.comm().cell_state() {
            Some(state) => Ok(state as u32),
            None => Err(Error::Invalid),
        }
    }
}
