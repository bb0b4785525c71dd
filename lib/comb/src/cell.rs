// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cells and the cell registry.

use std::sync::Arc;

use crate::comm::CommRegion;
use crate::config::CellConfig;
use crate::cpuset::CpuSet;
use crate::pool::MemPool;
use crate::{CellId, CpuId, Result, ROOT_CELL_ID};

/// One partition: a disjoint slice of CPUs and memory.
#[derive(Debug)]
pub struct Cell {
    id: CellId,
    config: CellConfig,
    pub(crate) cpu_set: CpuSet,
    comm: Arc<CommRegion>,
    pub(crate) loadable: bool,
    /// Pages charged to the memory pool for the cell block itself (header
    /// plus the private configuration copy).
    data_pages: u64,
}

impl Cell {
    /// Build a cell from its configuration, charging `pool` for the cell
    /// block and, if needed, the CPU-set page. A failed init leaves the
    /// pool unchanged.
    pub(crate) fn new(
        id: CellId,
        config: CellConfig,
        data_pages: u64,
        pool: &mut MemPool,
    ) -> Result<Cell> {
        pool.alloc(data_pages)?;
        let cpu_set = match CpuSet::new(&config.cpu_bitmap, pool) {
            Ok(set) => set,
            Err(err) => {
                pool.free(data_pages);
                return Err(err);
            }
        };
        Ok(Cell {
            id,
            config,
            cpu_set,
            comm: Arc::new(CommRegion::new()),
            loadable: false,
            data_pages,
        })
    }

    pub fn id(&self) -> CellId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CellConfig {
        &self.config
    }

    pub fn comm(&self) -> &Arc<CommRegion> {
        &self.comm
    }

    pub fn owns_cpu(&self, cpu: CpuId) -> bool {
        self.cpu_set.contains(cpu)
    }

    /// Return every pool page this cell holds. Called exactly once, when
    /// the cell leaves the registry (or its creation is rolled back).
    pub(crate) fn release_pool(&self, pool: &mut MemPool) {
        pool.free(self.data_pages + self.cpu_set.pool_pages());
    }
}

/// The ordered collection of live cells; the root cell sits at the head and
/// is never removed.
#[derive(Debug)]
pub struct Registry {
    cells: Vec<Cell>,
}

impl Registry {
    pub(crate) fn new(root: Cell) -> Self {
        debug_assert_eq!(root.id(), ROOT_CELL_ID);
        Self { cells: vec![root] }
    }

    pub fn num_cells(&self) -> u32 {
        self.cells.len() as u32
    }

    pub fn root(&self) -> &Cell {
        &self.cells[0]
    }

    pub(crate) fn root_mut(&mut self) -> &mut Cell {
        &mut self.cells[0]
    }

    pub fn by_id(&self, id: CellId) -> Option<&Cell> {
        self.cells.iter().find(|c| c.id == id)
    }

    pub(crate) fn by_id_mut(&mut self, id: CellId) -> Option<&mut Cell> {
        self.cells.iter_mut().find(|c| c.id == id)
    }

    pub fn by_name(&self, name: &str) -> Option<&Cell> {
        self.cells.iter().find(|c| c.config.name == name)
    }

    /// Smallest id not currently in use.
    pub fn free_id(&self) -> CellId {
        let mut id = 0;
        'retry: loop {
            for cell in &self.cells {
                if cell.id == id {
                    id += 1;
                    continue 'retry;
                }
            }
            return id;
        }
    }

    /// Append `cell` after all existing cells.
    pub(crate) fn insert(&mut self, cell: Cell) {
        debug_assert!(self.by_id(cell.id()).is_none());
        self.cells.push(cell);
    }

    /// Detach a non-root cell.
    pub(crate) fn remove(&mut self, id: CellId) -> Option<Cell> {
        debug_assert_ne!(id, ROOT_CELL_ID);
        let pos = self.cells.iter().position(|c| c.id == id)?;
        Some(self.cells.remove(pos))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cell> {
        self.cells.iter()
    }

    pub fn iter_non_root(&self) -> impl Iterator<Item = &Cell> {
        self.cells.iter().filter(|c| c.id != ROOT_CELL_ID)
    }
}
