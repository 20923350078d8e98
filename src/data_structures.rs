/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Data structures for the whole crate: operand types, register sets and
//! weights, live ranges and their predicates, variables, instructions, the
//! function container and the real-register universe.

use smallvec::SmallVec;
use std::fmt;

use crate::interface::RegAllocError;

//=============================================================================
// Instruction numbers and variable indices

/// A position in the single dense numbering of a function's instructions.
pub type InstNum = u32;

/// Index of a variable in its function's variable list.  Also the total
/// order used as a tie-breaker when live ranges start at the same point.
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct VarIx(u32);

impl VarIx {
  pub fn new(n: u32) -> Self {
    Self(n)
  }
  pub fn get(self) -> u32 {
    self.0
  }
  pub fn get_usize(self) -> usize {
    self.0 as usize
  }
}

impl fmt::Debug for VarIx {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "v{}", self.0)
  }
}

//=============================================================================
// Operand types

/// Operand type of a variable.  Each type maps onto one register class of
/// the universe, which in turn determines the legal register set.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Ty {
  I32,
  F32,
}

pub const N_TY_CLASSES: usize = 2;

impl Ty {
  pub fn class_index(self) -> usize {
    match self {
      Ty::I32 => 0,
      Ty::F32 => 1,
    }
  }
}

//=============================================================================
// Physical registers and register sets

/// A physical register number: an index into the `RegUniverse`'s register
/// list.  "No register" is represented as `Option::<RegNum>::None`
/// throughout, never as a sentinel number.
pub type RegNum = u32;

/// A set of physical register numbers, as a single-word bitset.  The
/// universe sanity check caps the number of registers accordingly.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct RegSet {
  bits: u64,
}

impl RegSet {
  pub fn empty() -> Self {
    Self { bits: 0 }
  }

  pub fn from_regs(regs: &[RegNum]) -> Self {
    let mut set = Self::empty();
    for &r in regs {
      set.set(r);
    }
    set
  }

  /// The set {first, ..., last}, both bounds included.
  pub fn from_range(first: RegNum, last: RegNum) -> Self {
    debug_assert!(first <= last && last < 64);
    let hi = u64::MAX >> (63 - last);
    let lo = (1u64 << first) - 1;
    Self { bits: hi & !lo }
  }

  pub fn contains(self, r: RegNum) -> bool {
    debug_assert!(r < 64);
    self.bits & (1u64 << r) != 0
  }

  pub fn set(&mut self, r: RegNum) {
    debug_assert!(r < 64);
    self.bits |= 1u64 << r;
  }

  pub fn clear(&mut self, r: RegNum) {
    debug_assert!(r < 64);
    self.bits &= !(1u64 << r);
  }

  pub fn intersect(self, other: RegSet) -> RegSet {
    RegSet { bits: self.bits & other.bits }
  }

  pub fn any(self) -> bool {
    self.bits != 0
  }

  pub fn find_first(self) -> Option<RegNum> {
    if self.bits == 0 {
      None
    } else {
      Some(self.bits.trailing_zeros())
    }
  }

  pub fn iter(self) -> RegSetIter {
    RegSetIter { bits: self.bits }
  }
}

pub struct RegSetIter {
  bits: u64,
}

impl Iterator for RegSetIter {
  type Item = RegNum;
  fn next(&mut self) -> Option<RegNum> {
    if self.bits == 0 {
      None
    } else {
      let r = self.bits.trailing_zeros();
      self.bits &= self.bits - 1;
      Some(r)
    }
  }
}

impl fmt::Debug for RegSet {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{{")?;
    let mut first = true;
    for r in self.iter() {
      if !first {
        write!(fmt, ",")?;
      }
      first = false;
      write!(fmt, "r{}", r)?;
    }
    write!(fmt, "}}")
  }
}

//=============================================================================
// Register weights

/// A totally-ordered allocation priority.  `ZERO` marks a variable that must
/// live in a spill slot and is skipped by the scan; `INF` marks a range that
/// must receive a register.  Addition saturates, with `INF` absorbing.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RegWeight(u32);

impl RegWeight {
  pub const ZERO: RegWeight = RegWeight(0);
  pub const INF: RegWeight = RegWeight(u32::MAX);

  pub fn new(w: u32) -> Self {
    Self(w)
  }

  pub fn is_zero(self) -> bool {
    self == Self::ZERO
  }

  pub fn is_inf(self) -> bool {
    self == Self::INF
  }

  pub fn add(&mut self, other: RegWeight) {
    if self.is_inf() || other.is_inf() {
      *self = Self::INF;
    } else {
      *self = Self(self.0.saturating_add(other.0));
    }
  }
}

impl fmt::Display for RegWeight {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    if self.is_inf() {
      write!(fmt, "Inf")
    } else {
      write!(fmt, "{}", self.0)
    }
  }
}

impl fmt::Debug for RegWeight {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    fmt::Display::fmt(self, fmt)
  }
}

//=============================================================================
// Live ranges

/// A live range: a finite union of half-open `[start, end)` instruction
/// intervals, kept sorted and disjoint, plus an allocation weight.
///
/// The range carries a trim index: the *trimmed* form of the range is the
/// suffix of segments not wholly before the current scan point.  Trimming
/// only ever advances, so it is amortised O(1) over a whole scan.  The
/// predicates below operate on the trimmed form except where noted.
#[derive(Clone)]
pub struct LiveRange {
  segments: SmallVec<[(InstNum, InstNum); 4]>,
  trimmed_begin: usize,
  weight: RegWeight,
}

impl LiveRange {
  pub fn new() -> Self {
    Self {
      segments: SmallVec::new(),
      trimmed_begin: 0,
      weight: RegWeight::new(1),
    }
  }

  /// Append `[start, end)`.  Segments must be added left to right; the
  /// builder is expected to present the range the way a liveness pass
  /// produces it.
  pub fn add_segment(&mut self, start: InstNum, end: InstNum) {
    assert!(start < end, "empty or inverted live range segment");
    if let Some(&(_, prev_end)) = self.segments.last() {
      assert!(prev_end <= start, "live range segments out of order");
    }
    self.segments.push((start, end));
  }

  pub fn is_empty(&self) -> bool {
    self.segments.is_empty()
  }

  /// First instruction number of the (untrimmed) range.
  pub fn start(&self) -> InstNum {
    self.segments.first().expect("start of an empty live range").0
  }

  /// One past the last instruction number of the (untrimmed) range.
  pub fn end(&self) -> InstNum {
    self.segments.last().expect("end of an empty live range").1
  }

  pub fn weight(&self) -> RegWeight {
    self.weight
  }

  pub fn set_weight(&mut self, weight: RegWeight) {
    self.weight = weight;
  }

  pub fn untrim(&mut self) {
    self.trimmed_begin = 0;
  }

  /// Advance the trim point: discard segments that end at or before
  /// `lower`.  A segment straddling `lower` is kept whole.
  pub fn trim(&mut self, lower: InstNum) {
    while self.trimmed_begin < self.segments.len()
      && self.segments[self.trimmed_begin].1 <= lower
    {
      self.trimmed_begin += 1;
    }
  }

  /// Does any instruction number lie in both trimmed ranges?  A two-finger
  /// walk over the two sorted segment lists.
  pub fn overlaps(&self, other: &LiveRange) -> bool {
    let mut i = self.trimmed_begin;
    let mut j = other.trimmed_begin;
    while i < self.segments.len() && j < other.segments.len() {
      let (s1, e1) = self.segments[i];
      let (s2, e2) = other.segments[j];
      if e1 <= s2 {
        i += 1;
      } else if e2 <= s1 {
        j += 1;
      } else {
        return true;
      }
    }
    false
  }

  /// Does instruction number `n` lie in the trimmed range?
  pub fn overlaps_inst(&self, n: InstNum) -> bool {
    for &(s, e) in &self.segments[self.trimmed_begin..] {
      if s > n {
        break;
      }
      if n < e {
        return true;
      }
    }
    false
  }

  /// `self.end <= other.start`, on the untrimmed bounds.
  pub fn ends_before(&self, other: &LiveRange) -> bool {
    match (self.segments.last(), other.segments.first()) {
      (Some(&(_, e)), Some(&(s, _))) => e <= s,
      _ => true,
    }
  }

  /// Does the range contain at least one segment longer than a single
  /// instruction?  Pure point-valued ranges (call kill sets, typically)
  /// can be skipped by parts of the scan.  Untrimmed.
  pub fn is_nonpoints(&self) -> bool {
    self.segments.iter().any(|&(s, e)| e - s > 1)
  }
}

impl fmt::Display for LiveRange {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    if self.segments.is_empty() {
      return write!(fmt, "(empty)");
    }
    let mut first = true;
    for &(s, e) in &self.segments {
      if !first {
        write!(fmt, ",")?;
      }
      first = false;
      write!(fmt, "[{},{})", s, e)?;
    }
    Ok(())
  }
}

//=============================================================================
// Variables

/// A virtual value.  `reg_num` is the durable register field: a precolor on
/// input, the final assignment on output.  `reg_num_tmp` is the tentative
/// assignment and is only meaningful while a scan is running.
pub struct Var {
  ix: VarIx,
  name: String,
  ty: Ty,
  weight: RegWeight,
  live_range: LiveRange,
  reg_num: Option<RegNum>,
  reg_num_tmp: Option<RegNum>,
}

impl Var {
  pub fn ix(&self) -> VarIx {
    self.ix
  }
  pub fn name(&self) -> &str {
    &self.name
  }
  pub fn ty(&self) -> Ty {
    self.ty
  }
  pub fn weight(&self) -> RegWeight {
    self.weight
  }
  pub fn set_weight(&mut self, weight: RegWeight) {
    self.weight = weight;
  }

  pub fn live_range(&self) -> &LiveRange {
    &self.live_range
  }
  pub fn live_range_mut(&mut self) -> &mut LiveRange {
    &mut self.live_range
  }

  pub fn has_reg(&self) -> bool {
    self.reg_num.is_some()
  }
  pub fn reg_num(&self) -> Option<RegNum> {
    self.reg_num
  }
  pub fn set_reg_num(&mut self, reg: Option<RegNum>) {
    self.reg_num = reg;
  }

  pub fn has_reg_tmp(&self) -> bool {
    self.reg_num_tmp.is_some()
  }
  pub fn reg_num_tmp(&self) -> Option<RegNum> {
    self.reg_num_tmp
  }
  pub fn set_reg_num_tmp(&mut self, reg: Option<RegNum>) {
    self.reg_num_tmp = reg;
  }
}

impl fmt::Display for Var {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "%{}", self.name)
  }
}

//=============================================================================
// Instructions

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Operand {
  Var(VarIx),
  Imm(u32),
}

impl Operand {
  pub fn as_var(self) -> Option<VarIx> {
    match self {
      Operand::Var(v) => Some(v),
      Operand::Imm(_) => None,
    }
  }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InstKind {
  /// `dst := src`: the destination is a direct copy of a single source,
  /// with no transformation of the value.
  Assign,
  /// Any other computation of the destination.
  Op,
}

/// An instruction, reduced to what allocation needs: its number in the
/// dense ordering, its destination variable and its source operands.
pub struct Inst {
  num: InstNum,
  kind: InstKind,
  dest: Option<VarIx>,
  srcs: SmallVec<[Operand; 2]>,
}

impl Inst {
  pub fn num(&self) -> InstNum {
    self.num
  }
  pub fn dest(&self) -> Option<VarIx> {
    self.dest
  }
  pub fn srcs(&self) -> &[Operand] {
    &self.srcs
  }
  pub fn is_simple_assign(&self) -> bool {
    self.kind == InstKind::Assign
  }
}

//=============================================================================
// Functions

/// A function: the instruction stream, the variable list, and the
/// allocator's error flag.  Liveness is an input: each variable arrives
/// carrying its live range and range weight.
pub struct Func {
  pub name: String,
  insts: Vec<Inst>,
  vars: Vec<Var>,
  error: Option<RegAllocError>,
}

impl Func {
  pub fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      insts: Vec::new(),
      vars: Vec::new(),
      error: None,
    }
  }

  pub fn new_var(&mut self, name: &str, ty: Ty) -> VarIx {
    let ix = VarIx::new(self.vars.len() as u32);
    self.vars.push(Var {
      ix,
      name: name.to_string(),
      ty,
      weight: RegWeight::new(1),
      live_range: LiveRange::new(),
      reg_num: None,
      reg_num_tmp: None,
    });
    ix
  }

  pub fn push_inst(
    &mut self, num: InstNum, kind: InstKind, dest: Option<VarIx>,
    srcs: &[Operand],
  ) {
    if let Some(last) = self.insts.last() {
      assert!(num > last.num(), "instruction numbers must be increasing");
    }
    self.insts.push(Inst { num, kind, dest, srcs: SmallVec::from_slice(srcs) });
  }

  pub fn insts(&self) -> &[Inst] {
    &self.insts
  }

  pub fn num_vars(&self) -> usize {
    self.vars.len()
  }

  pub fn var(&self, ix: VarIx) -> &Var {
    &self.vars[ix.get_usize()]
  }

  pub fn var_mut(&mut self, ix: VarIx) -> &mut Var {
    &mut self.vars[ix.get_usize()]
  }

  pub fn vars(&self) -> &[Var] {
    &self.vars
  }

  pub fn set_error(&mut self, error: RegAllocError) {
    // First error wins; the scan keeps going to leave a complete state
    // behind for diagnostics.
    if self.error.is_none() {
      self.error = Some(error);
    }
  }

  pub fn error(&self) -> Option<&RegAllocError> {
    self.error.as_ref()
  }
}

//=============================================================================
// The real-register universe

/// A read-only description of the physical registers of a target: their
/// printable names, and for each operand-type class the contiguous group of
/// register numbers that may legally hold values of that class.
pub struct RegUniverse {
  /// Register names; a register's number is its index here.
  pub regs: Vec<String>,

  /// Per class, the inclusive `(first, last)` group of registers in `regs`,
  /// or `None` if the target has no registers of that class.
  pub allocable_by_class: [Option<(usize, usize)>; N_TY_CLASSES],
}

impl RegUniverse {
  pub fn num_regs(&self) -> usize {
    self.regs.len()
  }

  pub fn reg_name(&self, r: RegNum) -> &str {
    &self.regs[r as usize]
  }

  /// The legal register set for values of type `ty`.
  pub fn reg_set_for_type(&self, ty: Ty) -> RegSet {
    match self.allocable_by_class[ty.class_index()] {
      None => RegSet::empty(),
      Some((first, last)) => {
        RegSet::from_range(first as RegNum, last as RegNum)
      }
    }
  }

  /// Check that the universe satisfies the representation invariants, and
  /// panic if not.  All of them matter: the allocator indexes its use
  /// counters and weight accumulators by register number.
  pub fn check_is_sane(&self) {
    // The bitset representation caps a universe at 64 registers.  No
    // target we care about gets anywhere near that.
    let mut ok = self.regs.len() <= 64;
    // Class groups must lie inside |regs| and must not overlap each other.
    if ok {
      let mut covered = RegSet::empty();
      for class in 0..N_TY_CLASSES {
        if let Some((first, last)) = self.allocable_by_class[class] {
          if first > last || last >= self.regs.len() {
            ok = false;
            break;
          }
          let group = RegSet::from_range(first as RegNum, last as RegNum);
          if covered.intersect(group).any() {
            ok = false;
            break;
          }
          for r in group.iter() {
            covered.set(r);
          }
        }
      }
    }
    if !ok {
      panic!("RegUniverse::check_is_sane: invalid RegUniverse");
    }
  }
}

/// Create a universe with `num_i32` integer registers named R0..  and
/// `num_f32` float registers named F0.. .
pub fn make_universe(num_i32: usize, num_f32: usize) -> RegUniverse {
  let mut regs = Vec::new();
  let mut allocable_by_class = [None; N_TY_CLASSES];

  if num_i32 > 0 {
    let first = regs.len();
    for i in 0..num_i32 {
      regs.push(format!("R{}", i));
    }
    allocable_by_class[Ty::I32.class_index()] = Some((first, regs.len() - 1));
  }

  if num_f32 > 0 {
    let first = regs.len();
    for i in 0..num_f32 {
      regs.push(format!("F{}", i));
    }
    allocable_by_class[Ty::F32.class_index()] = Some((first, regs.len() - 1));
  }

  let universe = RegUniverse { regs, allocable_by_class };
  universe.check_is_sane();
  universe
}

//=============================================================================
// Tests

#[cfg(test)]
mod tests {
  use super::*;

  fn range(segments: &[(InstNum, InstNum)]) -> LiveRange {
    let mut r = LiveRange::new();
    for &(s, e) in segments {
      r.add_segment(s, e);
    }
    r
  }

  #[test]
  fn reg_set_basics() {
    let mut s = RegSet::from_range(1, 3);
    assert!(!s.contains(0));
    assert!(s.contains(1) && s.contains(2) && s.contains(3));
    assert_eq!(s.find_first(), Some(1));
    s.clear(1);
    assert_eq!(s.find_first(), Some(2));
    assert_eq!(
      s.intersect(RegSet::from_regs(&[0, 3])),
      RegSet::from_regs(&[3])
    );
    assert!(!RegSet::empty().any());
    assert_eq!(RegSet::from_range(0, 63).iter().count(), 64);
  }

  #[test]
  fn reg_weight_saturates() {
    let mut w = RegWeight::new(u32::MAX - 2);
    w.add(RegWeight::new(1));
    assert!(!w.is_inf());
    let mut inf = RegWeight::INF;
    inf.add(RegWeight::new(5));
    assert!(inf.is_inf());
    let mut w2 = RegWeight::new(7);
    w2.add(RegWeight::INF);
    assert!(w2.is_inf());
    assert!(RegWeight::ZERO < RegWeight::new(1));
    assert!(RegWeight::new(1) < RegWeight::INF);
  }

  #[test]
  fn live_range_overlap_predicates() {
    let a = range(&[(0, 10)]);
    let b = range(&[(10, 20)]);
    let c = range(&[(5, 12)]);
    assert!(!a.overlaps(&b));
    assert!(a.overlaps(&c));
    assert!(b.overlaps(&c));
    assert!(a.ends_before(&b));
    assert!(!a.ends_before(&c));

    // Holes are respected.
    let gappy = range(&[(0, 2), (8, 12)]);
    let inside_gap = range(&[(3, 7)]);
    assert!(!gappy.overlaps(&inside_gap));
    assert!(gappy.overlaps_inst(1));
    assert!(!gappy.overlaps_inst(2));
    assert!(!gappy.overlaps_inst(5));
    assert!(gappy.overlaps_inst(8));
    assert!(!gappy.overlaps_inst(12));
  }

  #[test]
  fn live_range_trimming() {
    let mut r = range(&[(0, 4), (6, 8), (10, 14)]);
    assert!(r.overlaps_inst(1));
    r.trim(6);
    // The first segment is gone; later ones remain.
    assert!(!r.overlaps_inst(1));
    assert!(r.overlaps_inst(6));
    assert!(r.overlaps_inst(10));
    // A straddled segment is kept whole.
    r.trim(7);
    assert!(r.overlaps_inst(7));
    r.trim(8);
    assert!(!r.overlaps_inst(7));
    r.untrim();
    assert!(r.overlaps_inst(1));
    // Untrimmed bounds are unaffected by trimming.
    assert_eq!(r.start(), 0);
    assert_eq!(r.end(), 14);
  }

  #[test]
  fn live_range_nonpoints() {
    assert!(!range(&[(3, 4), (7, 8)]).is_nonpoints());
    assert!(range(&[(3, 4), (7, 9)]).is_nonpoints());
  }

  #[test]
  fn universe_type_masks() {
    let universe = make_universe(3, 2);
    assert_eq!(universe.num_regs(), 5);
    assert_eq!(universe.reg_name(0), "R0");
    assert_eq!(universe.reg_name(3), "F0");
    assert_eq!(universe.reg_set_for_type(Ty::I32), RegSet::from_range(0, 2));
    assert_eq!(universe.reg_set_for_type(Ty::F32), RegSet::from_range(3, 4));
    let ints_only = make_universe(2, 0);
    assert!(!ints_only.reg_set_for_type(Ty::F32).any());
  }
}
