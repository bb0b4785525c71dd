// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test utilities: a recording mock of the architecture layer backed by
//! fake guest memory, guest configuration blob builders, and a pre-wired
//! hypervisor over a small four-CPU system.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use comb_api as api;
use comb_api::{
    CellDescRaw, CellFlags, MemFlags, MemRegionRaw, CELL_NAME_LEN, PAGE_SIZE,
};
use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::IntoBytes;

use crate::arch::Arch;
use crate::cell::Cell;
use crate::comm::CommRegion;
use crate::config::{CellConfig, SystemConfig};
use crate::control::Hypervisor;
use crate::memory::MemRegion;
use crate::pool::MemPool;
use crate::{CellId, CpuId, Error, Result, ROOT_CELL_ID};

pub(crate) fn test_logger() -> slog::Logger {
    use slog::Drain;
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!("component" => "comb-test"))
}

/// One recorded architecture call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Op {
    SuspendCpu(CpuId),
    ResumeCpu(CpuId),
    ParkCpu(CpuId),
    ResetCpu(CpuId),
    ShutdownCpu(CpuId),
    CellCreate(CellId),
    CellDestroy(CellId),
    Map(CellId, MemRegion),
    Unmap(CellId, MemRegion),
    Commit(Option<CellId>),
    Shutdown,
    PanicStop(CpuId),
    PanicHalt(CpuId),
}

pub(crate) const GUEST_MEM_PAGES: u64 = 64;

/// Mock architecture layer: records every call, tracks live mappings per
/// cell, captures each cell's communication region, and serves guest
/// memory reads from a flat buffer.
pub(crate) struct MockArch {
    ops: Mutex<Vec<Op>>,
    maps: Mutex<Vec<(CellId, MemRegion)>>,
    comms: Mutex<HashMap<CellId, Arc<CommRegion>>>,
    guest_mem: Mutex<Vec<u8>>,
    /// One-shot mapping failure, keyed by physical start address.
    fail_map_at: Mutex<Option<u64>>,
}

impl MockArch {
    pub(crate) fn new(root_regions: &[MemRegion]) -> Self {
        Self {
            ops: Mutex::new(Vec::new()),
            maps: Mutex::new(
                root_regions.iter().map(|r| (ROOT_CELL_ID, *r)).collect(),
            ),
            comms: Mutex::new(HashMap::new()),
            guest_mem: Mutex::new(vec![
                0u8;
                (GUEST_MEM_PAGES * PAGE_SIZE) as usize
            ]),
            fail_map_at: Mutex::new(None),
        }
    }

    fn record(&self, op: Op) {
        self.ops.lock().unwrap().push(op);
    }

    pub(crate) fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    pub(crate) fn clear_ops(&self) {
        self.ops.lock().unwrap().clear();
    }

    pub(crate) fn is_mapped(&self, cell: CellId, phys: u64) -> bool {
        self.maps
            .lock()
            .unwrap()
            .iter()
            .any(|(c, r)| *c == cell && r.contains_addr(phys))
    }

    pub(crate) fn mappings(&self, cell: CellId) -> Vec<MemRegion> {
        self.maps
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == cell)
            .map(|(_, r)| *r)
            .collect()
    }

    /// Communication region captured when the cell was created.
    pub(crate) fn comm(&self, cell: CellId) -> Arc<CommRegion> {
        self.comms.lock().unwrap().get(&cell).unwrap().clone()
    }

    pub(crate) fn fail_next_map_at(&self, phys: u64) {
        *self.fail_map_at.lock().unwrap() = Some(phys);
    }

    pub(crate) fn write_guest(&self, gpa: u64, bytes: &[u8]) {
        let mut mem = self.guest_mem.lock().unwrap();
        let start = gpa as usize;
        mem[start..start + bytes.len()].copy_from_slice(bytes);
    }
}

impl Arch for MockArch {
    fn suspend_cpu(&self, cpu: CpuId) {
        self.record(Op::SuspendCpu(cpu));
    }

    fn resume_cpu(&self, cpu: CpuId) {
        self.record(Op::ResumeCpu(cpu));
    }

    fn park_cpu(&self, cpu: CpuId) {
        self.record(Op::ParkCpu(cpu));
    }

    fn reset_cpu(&self, cpu: CpuId) {
        self.record(Op::ResetCpu(cpu));
    }

    fn shutdown_cpu(&self, cpu: CpuId) {
        self.record(Op::ShutdownCpu(cpu));
    }

    fn cell_create(&self, cell: &Cell) -> Result<()> {
        self.comms.lock().unwrap().insert(cell.id(), cell.comm().clone());
        self.record(Op::CellCreate(cell.id()));
        Ok(())
    }

    fn cell_destroy(&self, cell: CellId) {
        self.record(Op::CellDestroy(cell));
    }

    fn map_region(&self, cell: CellId, region: &MemRegion) -> Result<()> {
        self.record(Op::Map(cell, *region));
        let mut fail = self.fail_map_at.lock().unwrap();
        if *fail == Some(region.phys_start) {
            *fail = None;
            return Err(Error::NoMem);
        }
        drop(fail);
        self.maps.lock().unwrap().push((cell, *region));
        Ok(())
    }

    fn unmap_region(&self, cell: CellId, region: &MemRegion) -> Result<()> {
        self.record(Op::Unmap(cell, *region));
        let mut maps = self.maps.lock().unwrap();
        if let Some(pos) = maps.iter().position(|(c, r)| {
            *c == cell
                && r.phys_start == region.phys_start
                && r.size == region.size
        }) {
            maps.remove(pos);
        }
        Ok(())
    }

    fn config_commit(&self, changed: Option<CellId>) {
        self.record(Op::Commit(changed));
    }

    fn shutdown(&self) {
        self.record(Op::Shutdown);
    }

    fn panic_stop(&self, cpu: CpuId) {
        self.record(Op::PanicStop(cpu));
    }

    fn panic_halt(&self, cpu: CpuId) {
        self.record(Op::PanicHalt(cpu));
    }

    fn read_guest_pages(&self, gpa: u64, num_pages: u64) -> Option<Vec<u8>> {
        let mem = self.guest_mem.lock().unwrap();
        let base = (gpa & !(PAGE_SIZE - 1)) as usize;
        let len = usize::try_from(num_pages.checked_mul(PAGE_SIZE)?).ok()?;
        let end = base.checked_add(len)?;
        if end > mem.len() {
            return None;
        }
        Some(mem[base..end].to_vec())
    }
}

pub(crate) fn region(
    phys: u64,
    virt: u64,
    size: u64,
    flags: MemFlags,
) -> MemRegion {
    MemRegion { phys_start: phys, virt_start: virt, size, flags }
}

pub(crate) fn cpu_bitmap(cpus: &[CpuId], len: usize) -> Vec<u8> {
    let mut bitmap = vec![0u8; len];
    for cpu in cpus {
        bitmap[*cpu as usize / 8] |= 1 << (cpu % 8);
    }
    bitmap
}

/// Serialize a cell configuration the way guest tooling lays it out.
pub(crate) fn config_blob(
    name: &str,
    flags: CellFlags,
    cpu_bitmap: &[u8],
    regions: &[MemRegion],
) -> Vec<u8> {
    let mut raw_name = [0u8; CELL_NAME_LEN];
    raw_name[..name.len()].copy_from_slice(name.as_bytes());

    let desc = CellDescRaw {
        name: raw_name,
        flags: U32::new(flags.bits()),
        cpu_set_size: U32::new(cpu_bitmap.len() as u32),
        num_memory_regions: U32::new(regions.len() as u32),
    };

    let mut blob = desc.as_bytes().to_vec();
    blob.extend_from_slice(cpu_bitmap);
    for region in regions {
        let raw = MemRegionRaw {
            phys_start: U64::new(region.phys_start),
            virt_start: U64::new(region.virt_start),
            size: U64::new(region.size),
            flags: U64::new(region.flags.bits()),
        };
        blob.extend_from_slice(raw.as_bytes());
    }
    blob
}

/// Build a standalone cell without going through `CELL_CREATE`, for unit
/// tests below the lifecycle layer.
pub(crate) fn make_cell(
    id: CellId,
    name: &str,
    cpus: &[CpuId],
    regions: &[MemRegion],
    flags: CellFlags,
) -> Cell {
    let mut pool = MemPool::new(8);
    let config = CellConfig {
        name: name.to_owned(),
        flags,
        cpu_bitmap: cpu_bitmap(cpus, 8),
        regions: regions.to_vec(),
    };
    Cell::new(id, config, 1, &mut pool).unwrap()
}

/// Guest-side answering thread: waits for an unanswered message and writes
/// `reply` once.
pub(crate) fn responder(
    comm: Arc<CommRegion>,
    reply: u32,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        if comm.guest_message() != api::MSG_NONE
            && comm.reply_from_cell() == api::MSG_NONE
        {
            comm.guest_reply(reply);
            return;
        }
        thread::yield_now();
    })
}

pub(crate) const ROOT_RAM_0: u64 = 0x0;
pub(crate) const ROOT_RAM_1: u64 = 0x1000;

/// Root cell with CPUs {0,1,2,3} and two single-page RAM regions.
pub(crate) fn test_system() -> SystemConfig {
    let ram = MemFlags::READ | MemFlags::WRITE;
    SystemConfig {
        root: CellConfig {
            name: "root".to_owned(),
            flags: CellFlags::empty(),
            cpu_bitmap: vec![0b0000_1111],
            regions: vec![
                region(ROOT_RAM_0, ROOT_RAM_0, PAGE_SIZE, ram),
                region(ROOT_RAM_1, ROOT_RAM_1, PAGE_SIZE, ram),
            ],
        },
        mem_pool_pages: 64,
        remap_pool_pages: 16,
    }
}

/// Guest-physical address config blobs are staged at; deliberately not
/// page-aligned.
pub(crate) const CONFIG_GPA: u64 = 8 * PAGE_SIZE + 0x20;

pub(crate) struct TestBed {
    pub(crate) hv: Hypervisor,
    pub(crate) arch: Arc<MockArch>,
}

impl TestBed {
    pub(crate) fn new() -> Self {
        let sys = test_system();
        let arch = Arc::new(MockArch::new(&sys.root.regions));
        let hv = Hypervisor::new(sys, arch.clone(), test_logger()).unwrap();
        TestBed { hv, arch }
    }

    /// Stage a config blob and issue `CELL_CREATE` from CPU 0.
    pub(crate) fn create_cell(
        &self,
        name: &str,
        cpus: &[CpuId],
        regions: &[MemRegion],
        flags: CellFlags,
    ) -> i64 {
        let blob = config_blob(name, flags, &cpu_bitmap(cpus, 1), regions);
        self.create_raw(&blob)
    }

    pub(crate) fn create_raw(&self, blob: &[u8]) -> i64 {
        self.arch.write_guest(CONFIG_GPA, blob);
        self.hv.hypercall(
            0,
            api::Hypercall::CellCreate as u64,
            CONFIG_GPA,
            0,
        )
    }

    pub(crate) fn hc(
        &self,
        caller: CpuId,
        code: api::Hypercall,
        arg1: u64,
    ) -> i64 {
        self.hv.hypercall(caller, code as u64, arg1, 0)
    }

    pub(crate) fn hc2(
        &self,
        caller: CpuId,
        code: api::Hypercall,
        arg1: u64,
        arg2: u64,
    ) -> i64 {
        self.hv.hypercall(caller, code as u64, arg1, arg2)
    }
}
