use std::fmt;

use tracing::debug;

use crate::domain::Domain;
use crate::error::{Error, Result};
use crate::packing::PackedChildren;
use crate::rules::NtId;

/// How entries are laid out within a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Density {
  /// Entries compacted and sorted by non-terminal, found by binary search.
  #[default]
  Sparse,
  /// Fixed stride of one slot per non-terminal; entries may arrive in any order.
  Dense,
}

/// How competing derivations of one (cell, non-terminal) combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InsidePolicy {
  /// Keep only the best derivation.
  #[default]
  Viterbi,
  /// Sum over derivations, remembering the single best one as the backpointer.
  Sum,
}

/// Midpoint stored for entries that have no split point (lexical entries, or
/// cells filled out of order).
pub const NO_MIDPOINT: u16 = u16::MAX;

/// A triangular chart stored as flat parallel arrays.
///
/// Cell `(start, end)` owns the slots `offset(cell)..offset(cell) + stride`.
/// Besides the usual inside and outside scores, every entry keeps its
/// pre-unary inside score (before unary closure) and its pre-unary outside
/// score (including contributions from unary parents), so that summed charts
/// produce exact expected counts with single-level unary closure.
#[derive(Debug, Clone)]
pub struct Chart<D: Domain> {
  size: usize,
  num_non_terminals: usize,
  density: Density,
  stride: usize,

  pub(crate) num_entries: Vec<u32>,
  pub(crate) non_terminals: Vec<NtId>,
  pub(crate) inside: Vec<D::Value>,
  pub(crate) inside_pre: Vec<D::Value>,
  pub(crate) outside: Vec<D::Value>,
  pub(crate) outside_pre: Vec<D::Value>,
  pub(crate) packed: Vec<PackedChildren>,
  pub(crate) midpoints: Vec<u16>,
  pub(crate) packed_pre: Vec<PackedChildren>,
  pub(crate) midpoints_pre: Vec<u16>,
  pub(crate) inside_steps: Vec<i32>,
  pub(crate) outside_steps: Vec<i32>,
  pub(crate) min_nt: Vec<NtId>,
  pub(crate) max_nt: Vec<NtId>,
  rescaled: usize,
}

fn num_cells(size: usize) -> usize {
  size * (size + 1) / 2
}

impl<D: Domain> Chart<D> {
  /// `cell_capacity` bounds the entries per cell in sparse charts (the beam
  /// width); dense charts always reserve one slot per non-terminal.
  pub fn new(size: usize, num_non_terminals: usize, density: Density, cell_capacity: usize) -> Self {
    let stride = match density {
      Density::Dense => num_non_terminals,
      Density::Sparse => cell_capacity.clamp(1, num_non_terminals.max(1)),
    };
    let mut chart = Self {
      size: 0,
      num_non_terminals,
      density,
      stride,
      num_entries: Vec::new(),
      non_terminals: Vec::new(),
      inside: Vec::new(),
      inside_pre: Vec::new(),
      outside: Vec::new(),
      outside_pre: Vec::new(),
      packed: Vec::new(),
      midpoints: Vec::new(),
      packed_pre: Vec::new(),
      midpoints_pre: Vec::new(),
      inside_steps: Vec::new(),
      outside_steps: Vec::new(),
      min_nt: Vec::new(),
      max_nt: Vec::new(),
      rescaled: 0,
    };
    chart.reset(size);
    chart
  }

  /// Prepares the chart for a sentence of `size` tokens, reusing storage when
  /// it is large enough.
  pub fn reset(&mut self, size: usize) {
    let cells = num_cells(size);
    let slots = cells * self.stride;
    if self.num_entries.len() < cells {
      debug!(size, cells, slots, "growing chart");
      self.num_entries.resize(cells, 0);
      self.inside_steps.resize(cells, 0);
      self.outside_steps.resize(cells, 0);
      self.min_nt.resize(cells, NtId::MAX);
      self.max_nt.resize(cells, 0);
    }
    if self.inside.len() < slots {
      self.non_terminals.resize(slots, 0);
      self.inside.resize(slots, D::ZERO);
      self.inside_pre.resize(slots, D::ZERO);
      self.outside.resize(slots, D::ZERO);
      self.outside_pre.resize(slots, D::ZERO);
      self.packed.resize(slots, PackedChildren::NONE);
      self.midpoints.resize(slots, NO_MIDPOINT);
      self.packed_pre.resize(slots, PackedChildren::NONE);
      self.midpoints_pre.resize(slots, NO_MIDPOINT);
    }

    self.size = size;
    self.rescaled = 0;
    self.num_entries[..cells].fill(0);
    self.inside_steps[..cells].fill(0);
    self.outside_steps[..cells].fill(0);
    self.min_nt[..cells].fill(NtId::MAX);
    self.max_nt[..cells].fill(0);
    if self.density == Density::Dense {
      // dense slots are addressed directly, so absent entries must read as zero
      self.inside[..slots].fill(D::ZERO);
      self.inside_pre[..slots].fill(D::ZERO);
      self.outside[..slots].fill(D::ZERO);
      self.outside_pre[..slots].fill(D::ZERO);
    }
  }

  pub fn size(&self) -> usize {
    self.size
  }

  pub fn num_cells(&self) -> usize {
    num_cells(self.size)
  }

  pub fn num_non_terminals(&self) -> usize {
    self.num_non_terminals
  }

  pub fn density(&self) -> Density {
    self.density
  }

  pub fn cell_capacity(&self) -> usize {
    self.stride
  }

  /// Number of inside or outside cell rescalings since the last reset.
  pub fn rescaled_cells(&self) -> usize {
    self.rescaled
  }

  pub(crate) fn note_rescale(&mut self, start: usize, end: usize, delta: i32, pass: &str) {
    debug!(start, end, delta, pass, "numeric underflow: rescaling cell");
    self.rescaled += 1;
  }

  pub fn try_cell_index(&self, start: usize, end: usize) -> Result<usize> {
    if start >= end || end > self.size {
      return Err(Error::IllegalSpan {
        start,
        end,
        size: self.size,
      });
    }
    Ok(start * self.size - start * start.saturating_sub(1) / 2 + (end - start - 1))
  }

  /// Triangular index of a cell. Panics on spans outside the chart.
  #[inline]
  pub fn cell_index(&self, start: usize, end: usize) -> usize {
    match self.try_cell_index(start, end) {
      Ok(cell) => cell,
      Err(e) => panic!("{}", e),
    }
  }

  #[inline]
  pub fn offset(&self, cell: usize) -> usize {
    cell * self.stride
  }

  pub fn cell_len(&self, start: usize, end: usize) -> usize {
    self.num_entries[self.cell_index(start, end)] as usize
  }

  /// Array index of `nt` in the cell, if present.
  pub fn entry_index(&self, start: usize, end: usize, nt: NtId) -> Option<usize> {
    let cell = self.cell_index(start, end);
    self.entry_index_in_cell(cell, nt)
  }

  #[inline]
  pub(crate) fn entry_index_in_cell(&self, cell: usize, nt: NtId) -> Option<usize> {
    let offset = self.offset(cell);
    match self.density {
      Density::Dense => {
        let i = offset + nt as usize;
        if (nt as usize) < self.stride && !D::is_zero(self.inside[i]) {
          Some(i)
        } else {
          None
        }
      }
      Density::Sparse => {
        let n = self.num_entries[cell] as usize;
        self.non_terminals[offset..offset + n]
          .binary_search(&nt)
          .ok()
          .map(|k| offset + k)
      }
    }
  }

  /// `(non-terminal, array index)` for every entry in the cell. Sparse cells
  /// yield entries in ascending non-terminal order.
  pub fn entries(&self, start: usize, end: usize) -> impl Iterator<Item = (NtId, usize)> + '_ {
    self.cell_entries(self.cell_index(start, end))
  }

  #[inline]
  pub(crate) fn cell_entries(&self, cell: usize) -> impl Iterator<Item = (NtId, usize)> + '_ {
    let offset = self.offset(cell);
    let n = self.num_entries[cell] as usize;
    let dense = self.density == Density::Dense;
    (offset..offset + n).map(move |i| {
      let nt = self.non_terminals[i];
      (nt, if dense { offset + nt as usize } else { i })
    })
  }

  pub fn contains(&self, start: usize, end: usize, nt: NtId) -> bool {
    self.entry_index(start, end, nt).is_some()
  }

  /// Inside score, or the domain zero when `nt` has no derivation over the span.
  pub fn inside(&self, start: usize, end: usize, nt: NtId) -> D::Value {
    self
      .entry_index(start, end, nt)
      .map(|i| self.inside[i])
      .unwrap_or(D::ZERO)
  }

  pub fn outside(&self, start: usize, end: usize, nt: NtId) -> D::Value {
    self
      .entry_index(start, end, nt)
      .map(|i| self.outside[i])
      .unwrap_or(D::ZERO)
  }

  /// Inside log probability with the cell's scaling added back.
  pub fn inside_log_prob(&self, start: usize, end: usize, nt: NtId) -> f64 {
    let cell = self.cell_index(start, end);
    match self.entry_index_in_cell(cell, nt) {
      Some(i) => D::to_log(self.inside[i], self.inside_steps[cell]),
      None => f64::NEG_INFINITY,
    }
  }

  pub fn outside_log_prob(&self, start: usize, end: usize, nt: NtId) -> f64 {
    let cell = self.cell_index(start, end);
    match self.entry_index_in_cell(cell, nt) {
      Some(i) => D::to_log(self.outside[i], self.outside_steps[cell]),
      None => f64::NEG_INFINITY,
    }
  }

  pub fn packed_children(&self, start: usize, end: usize, nt: NtId) -> Option<PackedChildren> {
    self.entry_index(start, end, nt).map(|i| self.packed[i])
  }

  /// Backpointer of the best derivation that does not end in a unary rule.
  pub fn packed_children_pre_unary(&self, start: usize, end: usize, nt: NtId) -> Option<PackedChildren> {
    self.entry_index(start, end, nt).map(|i| self.packed_pre[i])
  }

  pub fn midpoint(&self, start: usize, end: usize, nt: NtId) -> Option<u16> {
    self.entry_index(start, end, nt).map(|i| self.midpoints[i])
  }

  pub fn inside_step(&self, start: usize, end: usize) -> i32 {
    self.inside_steps[self.cell_index(start, end)]
  }

  pub fn outside_step(&self, start: usize, end: usize) -> i32 {
    self.outside_steps[self.cell_index(start, end)]
  }

  /// Smallest and largest populated non-terminal, or None for an empty cell.
  pub fn nt_range(&self, cell: usize) -> Option<(NtId, NtId)> {
    if self.num_entries[cell] == 0 {
      None
    } else {
      Some((self.min_nt[cell], self.max_nt[cell]))
    }
  }

  /// Smallest scaling step summed over the child cells of every midpoint
  /// whose children are both populated. Always 0 in the log domain.
  pub fn min_child_step(&self, start: usize, end: usize) -> i32 {
    (start + 1..end)
      .map(|mid| (self.cell_index(start, mid), self.cell_index(mid, end)))
      .filter(|&(l, r)| self.num_entries[l] > 0 && self.num_entries[r] > 0)
      .map(|(l, r)| self.inside_steps[l] + self.inside_steps[r])
      .min()
      .unwrap_or(0)
  }

  /// Writes the working buffer into the cell, keeping at most `beam` entries.
  /// Must be called exactly once per cell. Returns the number of entries kept.
  pub fn finalize_cell(
    &mut self,
    start: usize,
    end: usize,
    tmp: &mut TemporaryCell<D>,
    base_step: i32,
    beam: usize,
  ) -> usize {
    let cell = self.cell_index(start, end);
    debug_assert_eq!(self.num_entries[cell], 0, "cell {}..{} finalized twice", start, end);

    let mut nts: Vec<NtId> = tmp
      .touched
      .iter()
      .copied()
      .filter(|&nt| !D::is_zero(tmp.inside[nt as usize]))
      .collect();

    let beam = beam.min(self.stride);
    if nts.len() > beam {
      nts.sort_by(|&a, &b| {
        tmp.inside[b as usize]
          .partial_cmp(&tmp.inside[a as usize])
          .unwrap_or(std::cmp::Ordering::Equal)
      });
      nts.truncate(beam);
    }
    nts.sort_unstable();

    let max = nts
      .iter()
      .map(|&nt| tmp.inside[nt as usize])
      .fold(D::ZERO, |m, v| if v > m { v } else { m });
    let delta = D::scaling_delta(max);
    if delta != 0 {
      self.note_rescale(start, end, delta, "inside");
    }
    self.inside_steps[cell] = base_step + delta;

    let offset = self.offset(cell);
    for (k, &nt) in nts.iter().enumerate() {
      let src = nt as usize;
      let dst = match self.density {
        Density::Sparse => {
          self.non_terminals[offset + k] = nt;
          offset + k
        }
        Density::Dense => {
          self.non_terminals[offset + k] = nt;
          offset + src
        }
      };
      self.inside[dst] = D::scale(tmp.inside[src], delta);
      self.inside_pre[dst] = D::scale(tmp.inside_pre[src], delta);
      self.outside[dst] = D::ZERO;
      self.outside_pre[dst] = D::ZERO;
      self.packed[dst] = tmp.packed[src];
      self.midpoints[dst] = tmp.midpoints[src];
      self.packed_pre[dst] = tmp.packed_pre[src];
      self.midpoints_pre[dst] = tmp.midpoints_pre[src];
    }
    self.num_entries[cell] = nts.len() as u32;
    if let (Some(&lo), Some(&hi)) = (nts.first(), nts.last()) {
      self.min_nt[cell] = lo;
      self.max_nt[cell] = hi;
    }

    tmp.clear();
    nts.len()
  }

  /// Adds one entry to a dense cell out of order, filling its post-unary
  /// slot. Returns false, leaving the cell untouched, if the cell already
  /// holds `nt`.
  pub fn insert(
    &mut self,
    start: usize,
    end: usize,
    nt: NtId,
    inside: D::Value,
    packed: PackedChildren,
    midpoint: u16,
  ) -> bool {
    assert_eq!(self.density, Density::Dense, "out-of-order insertion needs a dense chart");
    let cell = self.cell_index(start, end);
    if self.entry_index_in_cell(cell, nt).is_some() {
      return false;
    }
    let offset = self.offset(cell);
    let n = self.num_entries[cell] as usize;
    let i = offset + nt as usize;
    self.non_terminals[offset + n] = nt;
    self.inside[i] = inside;
    self.outside[i] = D::ZERO;
    self.outside_pre[i] = D::ZERO;
    self.packed[i] = packed;
    self.midpoints[i] = midpoint;
    if D::is_zero(self.inside_pre[i]) {
      // only a unary derivation so far
      self.packed_pre[i] = PackedChildren::NONE;
      self.midpoints_pre[i] = NO_MIDPOINT;
    }
    self.num_entries[cell] += 1;
    self.min_nt[cell] = self.min_nt[cell].min(nt);
    self.max_nt[cell] = self.max_nt[cell].max(nt);
    true
  }

  /// Fills the pre-unary slot of `nt` (a lexical or binary derivation) in a
  /// dense cell. Returns false if that slot is already filled. The entry only
  /// becomes visible once its post-unary slot is inserted as well.
  pub fn insert_pre_unary(
    &mut self,
    start: usize,
    end: usize,
    nt: NtId,
    inside: D::Value,
    packed: PackedChildren,
    midpoint: u16,
  ) -> bool {
    assert_eq!(self.density, Density::Dense, "out-of-order insertion needs a dense chart");
    let i = self.offset(self.cell_index(start, end)) + nt as usize;
    if !D::is_zero(self.inside_pre[i]) {
      return false;
    }
    self.inside_pre[i] = inside;
    self.packed_pre[i] = packed;
    self.midpoints_pre[i] = midpoint;
    true
  }

  /// True if `nt` has a derivation over the span that does not end in a unary rule.
  pub fn contains_pre_unary(&self, start: usize, end: usize, nt: NtId) -> bool {
    match self.density {
      Density::Dense => {
        (nt as usize) < self.stride && !D::is_zero(self.inside_pre[self.offset(self.cell_index(start, end)) + nt as usize])
      }
      Density::Sparse => self
        .entry_index(start, end, nt)
        .is_some_and(|i| !D::is_zero(self.inside_pre[i])),
    }
  }

  /// Sets every outside score in the populated cells to zero.
  pub fn clear_outside(&mut self) {
    for cell in 0..self.num_cells() {
      let entries: Vec<usize> = self.cell_entries(cell).map(|(_, i)| i).collect();
      for i in entries {
        self.outside[i] = D::ZERO;
        self.outside_pre[i] = D::ZERO;
      }
      self.outside_steps[cell] = 0;
    }
  }

  pub fn total_entries(&self) -> usize {
    self.num_entries[..self.num_cells()]
      .iter()
      .map(|&n| n as usize)
      .sum()
  }
}

impl<D: Domain> fmt::Display for Chart<D> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for span in 1..=self.size {
      for start in 0..=self.size - span {
        let end = start + span;
        let cell = self.cell_index(start, end);
        write!(f, "{}..{} [{}]:", start, end, self.num_entries[cell])?;
        for (nt, i) in self.cell_entries(cell) {
          write!(f, " {}={:?}", nt, self.inside[i])?;
        }
        writeln!(f)?;
      }
    }
    Ok(())
  }
}

/// Dense per-cell working buffer, indexed by non-terminal. Filled by the
/// intersection engine, then compacted into the chart by `finalize_cell`.
#[derive(Debug, Clone)]
pub struct TemporaryCell<D: Domain> {
  pub(crate) inside: Vec<D::Value>,
  pub(crate) inside_pre: Vec<D::Value>,
  best: Vec<D::Value>,
  pub(crate) packed: Vec<PackedChildren>,
  pub(crate) midpoints: Vec<u16>,
  pub(crate) packed_pre: Vec<PackedChildren>,
  pub(crate) midpoints_pre: Vec<u16>,
  pub(crate) touched: Vec<NtId>,
  policy: InsidePolicy,
}

impl<D: Domain> TemporaryCell<D> {
  pub fn new(num_non_terminals: usize, policy: InsidePolicy) -> Self {
    Self {
      inside: vec![D::ZERO; num_non_terminals],
      inside_pre: vec![D::ZERO; num_non_terminals],
      best: vec![D::ZERO; num_non_terminals],
      packed: vec![PackedChildren::NONE; num_non_terminals],
      midpoints: vec![NO_MIDPOINT; num_non_terminals],
      packed_pre: vec![PackedChildren::NONE; num_non_terminals],
      midpoints_pre: vec![NO_MIDPOINT; num_non_terminals],
      touched: Vec::new(),
      policy,
    }
  }

  pub fn policy(&self) -> InsidePolicy {
    self.policy
  }

  pub fn set_policy(&mut self, policy: InsidePolicy) {
    self.clear();
    self.policy = policy;
  }

  pub fn inside(&self, nt: NtId) -> D::Value {
    self.inside[nt as usize]
  }

  pub fn is_empty(&self) -> bool {
    self.touched.is_empty()
  }

  /// Records one candidate derivation. Under Viterbi the candidate replaces
  /// the stored one only if strictly better; under Sum it is accumulated.
  /// Returns true if the best derivation changed.
  #[inline]
  pub fn update_inside(&mut self, parent: NtId, packed: PackedChildren, midpoint: u16, prob: D::Value) -> bool {
    let p = parent as usize;
    if D::is_zero(self.inside[p]) && D::is_zero(self.best[p]) {
      if D::is_zero(prob) {
        return false;
      }
      self.touched.push(parent);
    }
    match self.policy {
      InsidePolicy::Viterbi => {
        if prob > self.inside[p] {
          self.inside[p] = prob;
          self.best[p] = prob;
          self.packed[p] = packed;
          self.midpoints[p] = midpoint;
          true
        } else {
          false
        }
      }
      InsidePolicy::Sum => {
        self.inside[p] = D::plus(self.inside[p], prob);
        if prob > self.best[p] {
          self.best[p] = prob;
          self.packed[p] = packed;
          self.midpoints[p] = midpoint;
          true
        } else {
          false
        }
      }
    }
  }

  /// Saves the current scores as pre-unary scores. Called between binary
  /// combination and unary closure.
  pub fn snapshot_pre_unary(&mut self) {
    for &nt in &self.touched {
      let i = nt as usize;
      self.inside_pre[i] = self.inside[i];
      self.packed_pre[i] = self.packed[i];
      self.midpoints_pre[i] = self.midpoints[i];
    }
  }

  /// Records a derivation that does not end in a unary rule after unary
  /// closure has started: it sets the pre-unary score and competes for (or,
  /// under Sum, adds to) the overall score. Returns true if `nt` is new.
  pub fn add_pre_unary(&mut self, nt: NtId, packed: PackedChildren, midpoint: u16, prob: D::Value) -> bool {
    let i = nt as usize;
    let new = D::is_zero(self.inside[i]) && D::is_zero(self.best[i]);
    if new {
      self.touched.push(nt);
    }
    self.inside_pre[i] = prob;
    self.packed_pre[i] = packed;
    self.midpoints_pre[i] = midpoint;
    match self.policy {
      InsidePolicy::Viterbi => {
        if prob > self.inside[i] {
          self.inside[i] = prob;
        }
      }
      InsidePolicy::Sum => self.inside[i] = D::plus(self.inside[i], prob),
    }
    if prob > self.best[i] {
      self.best[i] = prob;
      self.packed[i] = packed;
      self.midpoints[i] = midpoint;
    }
    new
  }

  pub fn contains(&self, nt: NtId) -> bool {
    let i = nt as usize;
    !(D::is_zero(self.inside[i]) && D::is_zero(self.best[i]))
  }

  /// Non-terminals populated so far, in insertion order.
  pub fn populated(&self) -> &[NtId] {
    &self.touched
  }

  pub fn clear(&mut self) {
    for &nt in &self.touched {
      let i = nt as usize;
      self.inside[i] = D::ZERO;
      self.inside_pre[i] = D::ZERO;
      self.best[i] = D::ZERO;
      self.packed[i] = PackedChildren::NONE;
      self.midpoints[i] = NO_MIDPOINT;
      self.packed_pre[i] = PackedChildren::NONE;
      self.midpoints_pre[i] = NO_MIDPOINT;
    }
    self.touched.clear();
  }
}
