/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Implementation of the linear scan allocator.
//!
//! This follows "Linear Scan Register Allocation in the Context of SSA
//! Form and Register Constraints" by Mössenböck and Pfeiffer, modified to
//! take assignment affinity into account: the scan infers a preferred
//! register from the source of a variable's defining copy, and in certain
//! cases allows two interfering live ranges to share that register so the
//! copy becomes a no-op.

use log::debug;
use rustc_hash::FxHashSet;

use crate::data_structures::{
  Func, InstNum, RegNum, RegSet, RegUniverse, RegWeight, VarIx,
};
use crate::interface::RegAllocError;
use crate::metadata::VarMetadata;

/// Holds the work queues for one run of the linear-scan algorithm over one
/// function.  The allocator is the sole writer of the variables' tentative
/// and final register fields while a scan runs.
pub struct LinearScan<'a> {
  func: &'a mut Func,
  universe: &'a RegUniverse,
  metadata: VarMetadata,

  /// Not yet considered; reverse start order, so the earliest start is a
  /// tail pop.
  unhandled: Vec<VarIx>,
  /// The precolored subset of `unhandled`, in the same order, kept
  /// separately for faster conflict checks.
  unhandled_precolored: Vec<VarIx>,
  /// Tentatively holding a register at the current point.
  active: Vec<VarIx>,
  /// Tentatively holding a register, but with a hole at the current point.
  inactive: Vec<VarIx>,
  /// Decision made, one way or the other.
  handled: Vec<VarIx>,

  /// `reg_uses[r]` is the number of Active ranges register `r` is assigned
  /// to.  Overlap sharing can push it above one.
  reg_uses: Vec<i32>,

  considered: usize,
  verbose: bool,
  trace: String,
}

impl<'a> LinearScan<'a> {
  pub fn new(func: &'a mut Func, universe: &'a RegUniverse) -> Self {
    let metadata = VarMetadata::compute(func);
    Self {
      func,
      universe,
      metadata,
      unhandled: Vec::new(),
      unhandled_precolored: Vec::new(),
      active: Vec::new(),
      inactive: Vec::new(),
      handled: Vec::new(),
      reg_uses: Vec::new(),
      considered: 0,
      verbose: false,
      trace: String::new(),
    }
  }

  /// The diagnostic trace accumulated by the last verbose scan.
  pub fn trace(&self) -> &str {
    &self.trace
  }

  fn emit(&mut self, line: String) {
    debug!("{}", line);
    self.trace.push_str(&line);
    self.trace.push('\n');
  }

  fn wrapper_str(&self, v: VarIx) -> String {
    let var = self.func.var(v);
    let tmp = match var.reg_num_tmp() {
      Some(r) => r as i64,
      None => -1,
    };
    format!("R={:>2} V={} Range={}", tmp, var, var.live_range())
  }

  /// The tentative register of a range that must have one.
  fn tmp_reg(&self, v: VarIx) -> RegNum {
    self
      .func
      .var(v)
      .reg_num_tmp()
      .expect("live range without a tentative register")
  }

  /// True if `var` has any definition within `item`'s (trimmed) live
  /// range.
  //
  // TODO: consider trimming the definition lists the way the live ranges
  // are trimmed; every query here is against Cur, so definitions before
  // the scan point can never match.  Initial measurements showed no
  // difference, so the lists stay whole for now.
  fn overlaps_defs(&self, item: VarIx, var: VarIx) -> bool {
    let item_range = self.func.var(item).live_range();
    self
      .metadata
      .def_nums(var)
      .iter()
      .any(|&n| item_range.overlaps_inst(n))
  }

  fn dump_disable_overlap(&mut self, var: VarIx, reason: &str) {
    if !self.verbose {
      return;
    }
    let mut defs = String::new();
    for (i, n) in self.metadata.def_nums(var).iter().enumerate() {
      if i > 0 {
        defs.push(',');
      }
      defs.push_str(&n.to_string());
    }
    let line = format!(
      "Disabling Overlap due to {} {} LIVE={} Defs={}",
      reason,
      self.func.var(var),
      self.func.var(var).live_range(),
      defs
    );
    self.emit(line);
  }

  fn dump_state(&mut self) {
    if !self.verbose {
      return;
    }
    self.emit("**** Current regalloc state:".to_string());
    self.emit("++++++ Handled:".to_string());
    for idx in 0..self.handled.len() {
      let line = self.wrapper_str(self.handled[idx]);
      self.emit(line);
    }
    self.emit("++++++ Unhandled:".to_string());
    for idx in (0..self.unhandled.len()).rev() {
      let line = self.wrapper_str(self.unhandled[idx]);
      self.emit(line);
    }
    self.emit("++++++ Active:".to_string());
    for idx in 0..self.active.len() {
      let line = self.wrapper_str(self.active[idx]);
      self.emit(line);
    }
    self.emit("++++++ Inactive:".to_string());
    for idx in 0..self.inactive.len() {
      let line = self.wrapper_str(self.inactive[idx]);
      self.emit(line);
    }
  }

  /// Check the state machine invariants.  These are programmer errors,
  /// never data errors, so failure aborts.
  fn sanity_check_state(&self, scan_point: InstNum) {
    // The use counters agree with Active.
    for r in 0..self.reg_uses.len() {
      let holders = self
        .active
        .iter()
        .filter(|&&v| self.func.var(v).reg_num_tmp() == Some(r as RegNum))
        .count();
      assert!(
        self.reg_uses[r] == holders as i32,
        "use counter out of sync for r{}",
        r
      );
    }
    // The four sets partition the considered variables.
    let mut seen = FxHashSet::default();
    for &v in self
      .unhandled
      .iter()
      .chain(self.active.iter())
      .chain(self.inactive.iter())
      .chain(self.handled.iter())
    {
      assert!(seen.insert(v), "{:?} is in two scan sets", v);
    }
    assert!(seen.len() == self.considered, "variables lost by the scan");
    // Sharing a register is only legal when at most one of the two ranges
    // is defined inside the other.
    for i in 0..self.active.len() {
      for j in (i + 1)..self.active.len() {
        let a = self.active[i];
        let b = self.active[j];
        if self.func.var(a).reg_num_tmp() == self.func.var(b).reg_num_tmp() {
          assert!(
            !(self.overlaps_defs(a, b) && self.overlaps_defs(b, a)),
            "{:?} and {:?} share a register but clobber each other",
            a,
            b
          );
        }
      }
    }
    // Nothing inactive covers the scan point.  Pure point-valued ranges
    // are exempt: the advance step skips them.
    for &v in &self.inactive {
      let range = self.func.var(v).live_range();
      if range.is_nonpoints() {
        assert!(
          !range.overlaps_inst(scan_point),
          "inactive {:?} covers the scan point",
          v
        );
      }
    }
    // The precolored queue is a subsequence of the unhandled queue.
    let mut unhandled_iter = self.unhandled.iter();
    for &p in &self.unhandled_precolored {
      assert!(
        unhandled_iter.any(|&u| u == p),
        "precolored queue out of sync with unhandled"
      );
    }
  }

  /// Run the scan.  On return every considered variable's final register
  /// field holds either a register number or `None` (left for a spill
  /// slot).  If an infinite-weight range could not be placed, the error is
  /// recorded on the function and the scan still runs to completion, so
  /// the final state is intact for diagnostics.
  pub fn scan(&mut self, reg_mask_full: RegSet, verbose: bool) {
    assert!(reg_mask_full.any(), "empty register mask");
    self.universe.check_is_sane();
    self.verbose = verbose;
    self.trace.clear();
    self.unhandled.clear();
    self.unhandled_precolored.clear();
    self.active.clear();
    self.inactive.clear();
    self.handled.clear();
    self.reg_uses = vec![0; self.universe.num_regs()];

    // Gather the live ranges of all variables into Unhandled.
    for n in 0..self.func.num_vars() {
      let vix = VarIx::new(n as u32);
      let var = self.func.var_mut(vix);
      // Zero-weight variables are meant to be spill slots; never consider
      // them.
      if var.weight().is_zero() {
        continue;
      }
      // An empty live range means the variable was never referenced.
      if var.live_range().is_empty() {
        continue;
      }
      var.live_range_mut().untrim();
      self.unhandled.push(vix);
      if let Some(reg) = var.reg_num() {
        // Precolored: it keeps that register, and nothing may evict it.
        var.set_reg_num_tmp(Some(reg));
        var.live_range_mut().set_weight(RegWeight::INF);
        self.unhandled_precolored.push(vix);
      } else {
        var.set_reg_num_tmp(None);
      }
    }
    self.considered = self.unhandled.len();

    // Reverse sort both queues, so that consumption is an O(1) tail pop.
    {
      let func: &Func = self.func;
      let key = |v: VarIx| (func.var(v).live_range().start(), v.get());
      self.unhandled.sort_unstable_by(|&a, &b| key(b).cmp(&key(a)));
      self
        .unhandled_precolored
        .sort_unstable_by(|&a, &b| key(b).cmp(&key(a)));
    }

    debug!(
      "scan: function {}: {} of {} variables considered",
      self.func.name,
      self.considered,
      self.func.num_vars()
    );

    while let Some(cur) = self.unhandled.pop() {
      if self.verbose {
        self.emit(String::new());
        let line = format!("Considering  {}", self.wrapper_str(cur));
        self.emit(line);
      }
      let cur_start = self.func.var(cur).live_range().start();
      let reg_mask = reg_mask_full
        .intersect(self.universe.reg_set_for_type(self.func.var(cur).ty()));

      // If Cur is precolored, it definitely gets that register.  Earlier
      // ranges avoided it through the precolored-unhandled conflict check,
      // and later ranges cannot evict an infinite-weight range.
      if self.func.var(cur).has_reg() {
        let reg = self.tmp_reg(cur);
        debug_assert!(self.func.var(cur).reg_num() == Some(reg));
        if self.verbose {
          let line = format!("Precoloring  {}", self.wrapper_str(cur));
          self.emit(line);
        }
        self.active.push(cur);
        self.reg_uses[reg as usize] += 1;
        let head = self.unhandled_precolored.pop();
        assert!(head == Some(cur), "precolored queue out of sync");
        self.dump_state();
        if cfg!(debug_assertions) {
          self.sanity_check_state(cur_start);
        }
        continue;
      }

      // Check for active ranges that have expired or become inactive.
      let mut i = 0;
      while i < self.active.len() {
        let item = self.active[i];
        self.func.var_mut(item).live_range_mut().trim(cur_start);
        let (expired, deactivated) = {
          let item_range = self.func.var(item).live_range();
          let cur_range = self.func.var(cur).live_range();
          if item_range.ends_before(cur_range) {
            (true, false)
          } else if !item_range.overlaps_inst(cur_start) {
            (false, true)
          } else {
            (false, false)
          }
        };
        if expired {
          if self.verbose {
            let line = format!("Expiring     {}", self.wrapper_str(item));
            self.emit(line);
          }
          self.active.swap_remove(i);
          self.handled.push(item);
        } else if deactivated {
          if self.verbose {
            let line = format!("Inactivating {}", self.wrapper_str(item));
            self.emit(line);
          }
          self.active.swap_remove(i);
          self.inactive.push(item);
        } else {
          i += 1;
          continue;
        }
        let reg = self.tmp_reg(item);
        self.reg_uses[reg as usize] -= 1;
        assert!(self.reg_uses[reg as usize] >= 0);
      }

      // Check for inactive ranges that have expired or reactivated.
      let mut i = 0;
      while i < self.inactive.len() {
        let item = self.inactive[i];
        self.func.var_mut(item).live_range_mut().trim(cur_start);
        // Don't bother with pure point-valued ranges: the reactivation
        // test can never succeed for them, and the expiry test generally
        // only succeeds after the last call instruction, which is
        // statistically near the end of the function.
        if !self.func.var(item).live_range().is_nonpoints() {
          i += 1;
          continue;
        }
        let (expired, reactivated) = {
          let item_range = self.func.var(item).live_range();
          let cur_range = self.func.var(cur).live_range();
          if item_range.ends_before(cur_range) {
            (true, false)
          } else if item_range.overlaps_inst(cur_start) {
            (false, true)
          } else {
            (false, false)
          }
        };
        if expired {
          if self.verbose {
            let line = format!("Expiring     {}", self.wrapper_str(item));
            self.emit(line);
          }
          self.inactive.swap_remove(i);
          self.handled.push(item);
        } else if reactivated {
          if self.verbose {
            let line = format!("Reactivating {}", self.wrapper_str(item));
            self.emit(line);
          }
          self.inactive.swap_remove(i);
          self.active.push(item);
          let reg = self.tmp_reg(item);
          self.reg_uses[reg as usize] += 1;
        } else {
          i += 1;
        }
      }

      // Calculate the available registers.
      let mut free = reg_mask;
      for r in 0..self.reg_uses.len() {
        if self.reg_uses[r] > 0 {
          free.clear(r as RegNum);
        }
      }

      // Infer register preference and allowable overlap.  Only form a
      // preference when Cur has an unambiguous first definition.  The
      // preference is a source variable of that instruction that is
      // already assigned a register which is free, or not free but
      // sharable.  Sharing requires Cur to be written exactly once, by a
      // simple assignment, and requires that no definition of the source
      // falls within Cur's live range (which would clobber the shared
      // register).
      let mut prefer: Option<VarIx> = None;
      let mut prefer_reg: Option<RegNum> = None;
      let mut allow_overlap = false;
      if let Some(def_inst) = self.metadata.first_def(self.func, cur) {
        debug_assert!(def_inst.dest() == Some(cur));
        let is_assign = def_inst.is_simple_assign();
        let is_single_def = !self.metadata.is_multi_def(cur);
        // TODO: iterate over the variables of the instruction rather than
        // just its source operands, so that memory operands (address-mode
        // registers) can feed the preference too, though never the
        // overlap.
        for &opnd in def_inst.srcs() {
          let src = match opnd.as_var() {
            Some(s) => s,
            None => continue,
          };
          // Only sources that have been given a register so far, and only
          // registers in the mask: don't try to prefer the stack pointer.
          let src_reg = match self.func.var(src).reg_num_tmp() {
            Some(r) => r,
            None => continue,
          };
          if !reg_mask.contains(src_reg) {
            continue;
          }
          if !free.contains(src_reg) {
            allow_overlap =
              is_single_def && is_assign && !self.overlaps_defs(cur, src);
          }
          if allow_overlap || free.contains(src_reg) {
            prefer = Some(src);
            prefer_reg = Some(src_reg);
          }
        }
      }
      if self.verbose {
        if let (Some(p), Some(r)) = (prefer, prefer_reg) {
          let line = format!(
            "Initial Prefer={} R={} LIVE={} Overlap={}",
            self.func.var(p),
            r,
            self.func.var(p).live_range(),
            allow_overlap
          );
          self.emit(line);
        }
      }

      // Registers held by an inactive range that overlaps Cur are not
      // available.  Such a range also revokes the overlap permission if
      // it shares the preferred register and is defined inside Cur.
      for idx in 0..self.inactive.len() {
        let item = self.inactive[idx];
        let overlaps = self
          .func
          .var(item)
          .live_range()
          .overlaps(self.func.var(cur).live_range());
        if !overlaps {
          continue;
        }
        let reg = self.tmp_reg(item);
        // Two inactive ranges that were both granted overlap could share
        // this register, so the bit may already be cleared.
        free.clear(reg);
        if allow_overlap
          && prefer != Some(item)
          && prefer_reg == Some(reg)
          && self.overlaps_defs(cur, item)
        {
          allow_overlap = false;
          self.dump_disable_overlap(item, "Inactive");
        }
      }

      // Same revocation for active ranges.  Free[] already accounts for
      // them through the use counters.
      for idx in 0..self.active.len() {
        let item = self.active[idx];
        let reg = self.tmp_reg(item);
        if prefer != Some(item)
          && prefer_reg == Some(reg)
          && self.overlaps_defs(cur, item)
        {
          allow_overlap = false;
          self.dump_disable_overlap(item, "Active");
        }
      }

      // Remove registers held by overlapping unhandled precolored ranges
      // from Free[], and give them infinite weight so they are never
      // eviction candidates.  The ends_before early exit turns a
      // guaranteed O(N^2) walk into expected linear complexity, since the
      // queue is in start order.
      let mut weights = vec![RegWeight::ZERO; self.universe.num_regs()];
      let mut precolored_mask = RegSet::empty(); // only for dumping
      for idx in (0..self.unhandled_precolored.len()).rev() {
        let item = self.unhandled_precolored[idx];
        debug_assert!(self.func.var(item).has_reg());
        let cur_range = self.func.var(cur).live_range();
        let item_range = self.func.var(item).live_range();
        if cur_range.ends_before(item_range) {
          break;
        }
        if item_range.overlaps(cur_range) {
          // The durable register field, not the tentative one.
          let item_reg = self
            .func
            .var(item)
            .reg_num()
            .expect("precolored range without a register");
          weights[item_reg as usize] = RegWeight::INF;
          free.clear(item_reg);
          precolored_mask.set(item_reg);
          if allow_overlap && prefer_reg == Some(item_reg) {
            allow_overlap = false;
            self.dump_disable_overlap(item, "PrecoloredUnhandled");
          }
        }
      }

      // Print physical register availability.
      if self.verbose {
        let mut line = String::new();
        for r in reg_mask.iter() {
          line.push_str(&format!(
            "{}(U={},F={},P={}) ",
            self.universe.reg_name(r),
            self.reg_uses[r as usize],
            if free.contains(r) { 1 } else { 0 },
            if precolored_mask.contains(r) { 1 } else { 0 }
          ));
        }
        self.emit(line);
      }

      let preferred = match (prefer, prefer_reg) {
        (Some(_), Some(r)) if allow_overlap || free.contains(r) => Some(r),
        _ => None,
      };

      if let Some(reg) = preferred {
        // First choice: a preferred register that is either free or
        // allowed to overlap with its linked variable.
        self.func.var_mut(cur).set_reg_num_tmp(Some(reg));
        if self.verbose {
          let line = format!("Preferring   {}", self.wrapper_str(cur));
          self.emit(line);
        }
        self.reg_uses[reg as usize] += 1;
        self.active.push(cur);
      } else if let Some(reg) = free.find_first() {
        // Second choice: the lowest numbered free register.
        self.func.var_mut(cur).set_reg_num_tmp(Some(reg));
        if self.verbose {
          let line = format!("Allocating   {}", self.wrapper_str(cur));
          self.emit(line);
        }
        self.reg_uses[reg as usize] += 1;
        self.active.push(cur);
      } else {
        // Fallback: nothing is free, so find the lowest-weight register
        // and see whether Cur outweighs everything holding it.  Active
        // ranges always overlap Cur.
        for idx in 0..self.active.len() {
          let item = self.active[idx];
          debug_assert!(self
            .func
            .var(item)
            .live_range()
            .overlaps(self.func.var(cur).live_range()));
          let reg = self.tmp_reg(item);
          let weight = self.func.var(item).live_range().weight();
          weights[reg as usize].add(weight);
        }
        // Same again for inactive ranges, which only count if they
        // overlap Cur.
        for idx in 0..self.inactive.len() {
          let item = self.inactive[idx];
          let reg = self.tmp_reg(item);
          if self
            .func
            .var(item)
            .live_range()
            .overlaps(self.func.var(cur).live_range())
          {
            let weight = self.func.var(item).live_range().weight();
            weights[reg as usize].add(weight);
          }
        }

        // The register with the smallest weight; ties go to the lowest
        // register number.
        let first = reg_mask.find_first().expect("no legal registers for type");
        let mut min_reg = first as usize;
        for r in (min_reg + 1)..weights.len() {
          if reg_mask.contains(r as RegNum) && weights[r] < weights[min_reg] {
            min_reg = r;
          }
        }
        let min_reg = min_reg as RegNum;

        if self.func.var(cur).live_range().weight() <= weights[min_reg as usize]
        {
          // Cur doesn't have priority over anything currently live, so it
          // gets no register.
          self.handled.push(cur);
          if self.func.var(cur).live_range().weight().is_inf() {
            debug!("scan: unplaceable infinite-weight range {:?}", cur);
            self.func.set_error(RegAllocError::OutOfRegisters(cur));
          }
        } else {
          // Evict everything in Active holding the chosen register.
          let mut i = 0;
          while i < self.active.len() {
            let item = self.active[i];
            if self.tmp_reg(item) == min_reg {
              if self.verbose {
                let line = format!("Evicting     {}", self.wrapper_str(item));
                self.emit(line);
              }
              self.reg_uses[min_reg as usize] -= 1;
              assert!(self.reg_uses[min_reg as usize] >= 0);
              self.func.var_mut(item).set_reg_num_tmp(None);
              self.active.swap_remove(i);
              self.handled.push(item);
            } else {
              i += 1;
            }
          }
          // Evict the Inactive holders too, but only those that overlap
          // Cur.  Evicting a non-overlapping inactive range gains
          // nothing, and could throw away an infinite-weight inactive
          // range, most commonly a call-instruction kill set.
          let mut i = 0;
          while i < self.inactive.len() {
            let item = self.inactive[i];
            let evict = self.tmp_reg(item) == min_reg
              && self
                .func
                .var(item)
                .live_range()
                .overlaps(self.func.var(cur).live_range());
            if evict {
              if self.verbose {
                let line = format!("Evicting     {}", self.wrapper_str(item));
                self.emit(line);
              }
              self.func.var_mut(item).set_reg_num_tmp(None);
              self.inactive.swap_remove(i);
              self.handled.push(item);
            } else {
              i += 1;
            }
          }
          // The register is Cur's.
          self.func.var_mut(cur).set_reg_num_tmp(Some(min_reg));
          self.reg_uses[min_reg as usize] += 1;
          self.active.push(cur);
          if self.verbose {
            let line = format!("Allocating   {}", self.wrapper_str(cur));
            self.emit(line);
          }
        }
      }
      self.dump_state();
      if cfg!(debug_assertions) {
        self.sanity_check_state(cur_start);
      }
    }

    // Move anything still Active or Inactive into Handled, for uniform
    // finalization.
    self.handled.extend(self.active.drain(..));
    self.handled.extend(self.inactive.drain(..));
    self.dump_state();

    // Finish up by making the tentative assignments durable.
    for idx in 0..self.handled.len() {
      let item = self.handled[idx];
      let tmp = self.func.var(item).reg_num_tmp();
      if self.verbose {
        let line = match tmp {
          None => format!("Not assigning {}", self.func.var(item)),
          Some(reg) => format!(
            "{} {}(r{}) to {}",
            if self.func.var(item).reg_num() == Some(reg) {
              "Reassigning"
            } else {
              "Assigning"
            },
            self.universe.reg_name(reg),
            reg,
            self.func.var(item)
          ),
        };
        self.emit(line);
      }
      self.func.var_mut(item).set_reg_num(tmp);
    }
  }
}
