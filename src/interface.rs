/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! This is the top level interface for the lsra library.

use std::fmt;

// Instruction numbers, variables and the things they are made of.

pub use crate::data_structures::{Inst, InstKind, InstNum, Operand, Var, VarIx};

// Types, registers, register sets and weights.

pub use crate::data_structures::{RegNum, RegSet, RegWeight, Ty};

// Live ranges.

pub use crate::data_structures::LiveRange;

// The function container and the real-register universe.

pub use crate::data_structures::{make_universe, Func, RegUniverse};

// The read-only variable metadata consumed by the scan.

pub use crate::metadata::VarMetadata;

// The allocator itself, for callers that want the verbose trace.

pub use crate::linear_scan::LinearScan;

/// The result of register allocation.  Note that allocation can fail!
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegAllocError {
  /// An infinite-weight live range could not be given a register.
  OutOfRegisters(VarIx),
}

impl fmt::Display for RegAllocError {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      RegAllocError::OutOfRegisters(v) => write!(
        fmt,
        "unable to find a physical register for infinite-weight live range {:?}",
        v
      ),
    }
  }
}

/// Allocate registers for `func`, given the universe of real registers and
/// the subset of them, `reg_mask_full`, that we are allowed to use.
///
/// Every considered variable ends up with either a final register number
/// or `None`, meaning it lives in a spill slot; precolored variables keep
/// their input assignment.  On failure the scan still runs to completion,
/// so the function's state is structurally valid for diagnostics, and the
/// recorded error is returned.
pub fn allocate_registers(
  func: &mut Func, universe: &RegUniverse, reg_mask_full: RegSet,
  verbose: bool,
) -> Result<(), RegAllocError> {
  let mut scan = LinearScan::new(func, universe);
  scan.scan(reg_mask_full, verbose);
  drop(scan);
  match func.error() {
    Some(e) => Err(e.clone()),
    None => Ok(()),
  }
}
