/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Read-only per-variable metadata: where each variable is defined.
//! Computed in a single pass over the instruction stream and then only
//! ever queried, so it can be shared with any other read-only observer
//! while a scan runs.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::data_structures::{Func, Inst, InstNum, VarIx};

struct DefInfo {
  /// Index into `Func::insts` of the first defining instruction.
  first: usize,
  /// Instruction numbers of every definition, in instruction order.
  nums: SmallVec<[InstNum; 2]>,
}

/// Definition metadata for the variables of one function.  Variables with
/// no defining instruction (function arguments, for instance) simply have
/// no entry.
pub struct VarMetadata {
  defs: FxHashMap<VarIx, DefInfo>,
}

impl VarMetadata {
  pub fn compute(func: &Func) -> Self {
    let mut defs = FxHashMap::<VarIx, DefInfo>::default();
    for (ix, inst) in func.insts().iter().enumerate() {
      if let Some(dest) = inst.dest() {
        defs
          .entry(dest)
          .or_insert_with(|| DefInfo { first: ix, nums: SmallVec::new() })
          .nums
          .push(inst.num());
      }
    }
    Self { defs }
  }

  /// The instruction numbers of every definition of `v`, in instruction
  /// order.  Empty if `v` has no definition.
  pub fn def_nums(&self, v: VarIx) -> &[InstNum] {
    match self.defs.get(&v) {
      Some(info) => &info.nums,
      None => &[],
    }
  }

  /// The first (in instruction order) defining instruction of `v`.
  pub fn first_def<'f>(&self, func: &'f Func, v: VarIx) -> Option<&'f Inst> {
    self.defs.get(&v).map(|info| &func.insts()[info.first])
  }

  /// Whether `v` has more than one definition in the whole function.
  pub fn is_multi_def(&self, v: VarIx) -> bool {
    self.def_nums(v).len() > 1
  }
}
