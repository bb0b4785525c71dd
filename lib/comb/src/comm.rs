// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The communication region and the message protocol run over it.
//!
//! Each cell shares one page with the hypervisor carrying its advertised
//! state and a single-slot message/reply channel. The fields follow a
//! single-writer discipline: the hypervisor writes `msg_to_cell` (and
//! `cell_state` on hypervisor-initiated transitions), the guest writes
//! `reply_from_cell` (and `cell_state` on its own transitions).

use std::sync::atomic::{AtomicU32, Ordering};

use comb_api as api;
use comb_api::{CellFlags, CellState};
use slog::{warn, Logger};

use crate::cell::Cell;

/// Spins of the reply loop before a stuck peer is reported once to the log.
/// The wait itself stays unbounded; the owning cell is expected to answer.
const SPIN_WARN_ITERS: u64 = 1 << 24;

/// The shared page. Plain `u32` fields on the wire; accessed with
/// acquire/release ordering from both sides.
#[derive(Debug)]
pub struct CommRegion {
    cell_state: AtomicU32,
    msg_to_cell: AtomicU32,
    reply_from_cell: AtomicU32,
}

impl CommRegion {
    pub(crate) fn new() -> Self {
        Self {
            cell_state: AtomicU32::new(CellState::ShutDown as u32),
            msg_to_cell: AtomicU32::new(api::MSG_NONE),
            reply_from_cell: AtomicU32::new(api::MSG_NONE),
        }
    }

    pub fn cell_state_raw(&self) -> u32 {
        self.cell_state.load(Ordering::Acquire)
    }

    pub fn cell_state(&self) -> Option<CellState> {
        CellState::from_repr(self.cell_state_raw())
    }

    pub(crate) fn set_cell_state(&self, state: CellState) {
        self.cell_state.store(state as u32, Ordering::Release);
    }

    /// Post a message, discarding any stale reply first.
    pub(crate) fn post_message(&self, msg: u32) {
        self.reply_from_cell.store(api::MSG_NONE, Ordering::Release);
        self.msg_to_cell.store(msg, Ordering::Release);
    }

    pub(crate) fn clear_message(&self) {
        self.msg_to_cell.store(api::MSG_NONE, Ordering::Release);
    }

    pub(crate) fn reply_from_cell(&self) -> u32 {
        self.reply_from_cell.load(Ordering::Acquire)
    }

    // Guest-side accessors. A real guest reads and writes the raw words of
    // the shared page; these exist for in-process guests (tests, loaders).

    /// Read the pending message slot, as the guest does.
    pub fn guest_message(&self) -> u32 {
        self.msg_to_cell.load(Ordering::Acquire)
    }

    /// Write a reply, as the guest does.
    pub fn guest_reply(&self, reply: u32) {
        self.reply_from_cell.store(reply, Ordering::Release);
    }

    /// Write the advertised cell state, as the guest does.
    pub fn guest_set_state(&self, raw: u32) {
        self.cell_state.store(raw, Ordering::Release);
    }
}

/// Message kind, defining which replies complete the exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MsgKind {
    /// Expects approval or denial.
    Request,
    /// Expects a reception acknowledgement.
    Information,
}

/// Deliver `msg` to `cell` and wait for the reply.
///
/// Returns true if a request was approved or an information message was
/// acknowledged. A cell without an active communication region, or one that
/// is shut down or failed, approves everything vacuously. Any other reply
/// returns false.
///
/// The wait spins unboundedly; callers run it inside a suspended-root window
/// so the guest's reply is the only concurrent event possible.
pub(crate) fn send_and_wait(
    cell: &Cell,
    msg: u32,
    kind: MsgKind,
    log: &Logger,
) -> bool {
    if cell.config().flags.contains(CellFlags::PASSIVE_COMMREG) {
        return true;
    }

    let comm = cell.comm();
    comm.post_message(msg);

    let mut spins: u64 = 0;
    loop {
        let reply = comm.reply_from_cell();
        let state = comm.cell_state_raw();

        if state == CellState::ShutDown as u32
            || state == CellState::Failed as u32
        {
            return true;
        }

        if (kind == MsgKind::Request && reply == api::MSG_REQUEST_APPROVED)
            || (kind == MsgKind::Information && reply == api::MSG_RECEIVED)
        {
            return true;
        }

        if reply != api::MSG_NONE {
            return false;
        }

        spins += 1;
        if spins == SPIN_WARN_ITERS {
            warn!(
                log,
                "cell \"{}\" is not answering, still waiting", cell.name();
                "msg" => msg
            );
        }
        std::hint::spin_loop();
    }
}
