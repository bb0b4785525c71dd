// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control plane of a static-partitioning hypervisor.
//!
//! The machine is divided into cells: disjoint slices of physical CPUs and
//! memory, each running an isolated guest. One privileged partition (the
//! root cell) creates, loads, starts, and destroys the others through the
//! hypercall interface in [`hypercall`]. Everything architecture-specific
//! sits behind the [`arch::Arch`] trait.

pub extern crate comb_api as api;

pub mod arch;
pub mod cell;
pub mod comm;
pub mod config;
pub mod control;
pub mod cpuset;
pub mod hypercall;
pub mod memory;
pub mod percpu;
pub mod pool;

#[cfg(test)]
pub(crate) mod testutil;

pub use control::Hypervisor;

use thiserror::Error;

/// Physical CPU id.
pub type CpuId = u32;

/// Stable cell identifier; the root cell is always [`ROOT_CELL_ID`].
pub type CellId = u32;

pub const ROOT_CELL_ID: CellId = 0;

/// Failures surfaced to guests as negative hypercall returns.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("operation not permitted")]
    Permission,

    #[error("no cell with the requested id")]
    NotFound,

    #[error("configuration exceeds the temporary mapping window")]
    TooBig,

    #[error("out of memory")]
    NoMem,

    #[error("CPU assignment conflicts with its current owner")]
    Busy,

    #[error("a cell with this name already exists")]
    Exists,

    #[error("invalid argument")]
    Invalid,

    #[error("unknown hypercall code")]
    NoSys,
}

impl Error {
    /// The ABI error code returned to the calling guest.
    pub fn code(self) -> i64 {
        match self {
            Error::Permission => api::E_PERM,
            Error::NotFound => api::E_NOENT,
            Error::TooBig => api::E_TOO_BIG,
            Error::NoMem => api::E_NOMEM,
            Error::Busy => api::E_BUSY,
            Error::Exists => api::E_EXIST,
            Error::Invalid => api::E_INVAL,
            Error::NoSys => api::E_NOSYS,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
