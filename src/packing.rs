//! Packing functions map a (left child, right child) pair onto a single
//! integer column key, and the chart's packed backpointer encoding.
//!
//! Both packing strategies are order preserving: if `(l1, r1) < (l2, r2)`
//! lexicographically then `pack(l1, r1) < pack(l2, r2)`.

use std::fmt;

use crate::error::{Error, Result};
use crate::rules::{NtId, WordId};
use crate::utils::bits_for;

pub type PackedKey = u32;

pub trait PackingFunction: fmt::Debug + Send + Sync {
  /// Packs a child pair, returning None for pairs the function can't represent.
  fn pack(&self, left: NtId, right: NtId) -> Option<PackedKey>;

  fn unpack_left(&self, key: PackedKey) -> NtId;

  fn unpack_right(&self, key: PackedKey) -> NtId;

  /// One past the largest key `pack` can return.
  fn packed_array_size(&self) -> usize;
}

/// `left << shift | right`. Fast, but the key space grows with the square of
/// the vocabulary.
#[derive(Debug, Clone)]
pub struct ShiftPacking {
  shift: u32,
  mask: u32,
  num_left: usize,
  num_right: usize,
}

impl ShiftPacking {
  /// `num_left` and `num_right` are one past the largest valid left and right child ids.
  pub fn new(num_left: usize, num_right: usize) -> Result<Self> {
    let shift = bits_for(num_right.max(1));
    let size = (num_left.max(1) as u64) << shift;
    if size > i32::MAX as u64 {
      return Err(Error::grammar(
        0,
        format!(
          "vocabulary too large for shift packing ({} x {} children)",
          num_left, num_right
        ),
      ));
    }
    Ok(Self {
      shift,
      mask: (1u32 << shift) - 1,
      num_left,
      num_right,
    })
  }

  pub fn shift(&self) -> u32 {
    self.shift
  }
}

impl PackingFunction for ShiftPacking {
  fn pack(&self, left: NtId, right: NtId) -> Option<PackedKey> {
    if left as usize >= self.num_left || right as usize >= self.num_right {
      return None;
    }
    Some(((left as u32) << self.shift) | right as u32)
  }

  fn unpack_left(&self, key: PackedKey) -> NtId {
    (key >> self.shift) as NtId
  }

  fn unpack_right(&self, key: PackedKey) -> NtId {
    (key & self.mask) as NtId
  }

  fn packed_array_size(&self) -> usize {
    self.num_left.max(1) << self.shift
  }
}

const EMPTY_SLOT: u32 = u32::MAX;

/// Perfect hash over the child pairs observed in the grammar.
///
/// Pairs are segmented by left child. Each segment is a table addressed by
/// `right % modulus`, with the smallest modulus that makes the segment
/// collision free. A pair's key is its rank among all observed pairs, so keys
/// are dense and order preserving.
#[derive(Debug, Clone)]
pub struct PerfectHashPacking {
  segment_offsets: Vec<u32>,
  moduli: Vec<u32>,
  slots: Vec<u32>,
  lefts: Vec<NtId>,
  rights: Vec<NtId>,
}

impl PerfectHashPacking {
  pub fn new(pairs: &[(NtId, NtId)]) -> Self {
    let mut pairs = pairs.to_vec();
    pairs.sort_unstable();
    pairs.dedup();

    let num_left = pairs.last().map(|&(l, _)| l as usize + 1).unwrap_or(0);
    let mut segment_offsets = vec![0u32; num_left];
    let mut moduli = vec![0u32; num_left];
    let mut slots = Vec::new();

    let mut start = 0;
    while start < pairs.len() {
      let left = pairs[start].0;
      let mut end = start;
      while end < pairs.len() && pairs[end].0 == left {
        end += 1;
      }
      let segment = &pairs[start..end];
      let modulus = Self::find_modulus(segment);

      segment_offsets[left as usize] = slots.len() as u32;
      moduli[left as usize] = modulus;
      let base = slots.len();
      slots.resize(base + modulus as usize, EMPTY_SLOT);
      for (i, &(_, right)) in segment.iter().enumerate() {
        slots[base + (right as u32 % modulus) as usize] = (start + i) as u32;
      }
      start = end;
    }

    Self {
      segment_offsets,
      moduli,
      slots,
      lefts: pairs.iter().map(|&(l, _)| l).collect(),
      rights: pairs.iter().map(|&(_, r)| r).collect(),
    }
  }

  /// Smallest modulus that maps every right child in the segment to a distinct slot.
  /// Terminates at `max(right) + 1` at the latest, where the mapping is the identity.
  fn find_modulus(segment: &[(NtId, NtId)]) -> u32 {
    let mut modulus = segment.len() as u32;
    let mut seen = Vec::new();
    loop {
      seen.clear();
      seen.resize(modulus as usize, false);
      let collision = segment.iter().any(|&(_, r)| {
        let slot = (r as u32 % modulus) as usize;
        std::mem::replace(&mut seen[slot], true)
      });
      if !collision {
        return modulus;
      }
      modulus += 1;
    }
  }

  /// Total number of hash slots, a measure of the table's memory footprint.
  pub fn table_size(&self) -> usize {
    self.slots.len()
  }
}

impl PackingFunction for PerfectHashPacking {
  fn pack(&self, left: NtId, right: NtId) -> Option<PackedKey> {
    let modulus = *self.moduli.get(left as usize)?;
    if modulus == 0 {
      return None;
    }
    let slot = self.segment_offsets[left as usize] + right as u32 % modulus;
    let rank = self.slots[slot as usize];
    if rank == EMPTY_SLOT || self.rights[rank as usize] != right {
      return None;
    }
    Some(rank)
  }

  fn unpack_left(&self, key: PackedKey) -> NtId {
    self.lefts[key as usize]
  }

  fn unpack_right(&self, key: PackedKey) -> NtId {
    self.rights[key as usize]
  }

  fn packed_array_size(&self) -> usize {
    self.lefts.len()
  }
}

/// Which packing function a grammar is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackingScheme {
  #[default]
  PerfectHash,
  Shift,
}

#[derive(Debug, Clone)]
pub enum Packing {
  PerfectHash(PerfectHashPacking),
  Shift(ShiftPacking),
}

impl Packing {
  pub fn scheme(&self) -> PackingScheme {
    match self {
      Self::PerfectHash(_) => PackingScheme::PerfectHash,
      Self::Shift(_) => PackingScheme::Shift,
    }
  }
}

impl PackingFunction for Packing {
  #[inline]
  fn pack(&self, left: NtId, right: NtId) -> Option<PackedKey> {
    match self {
      Self::PerfectHash(p) => p.pack(left, right),
      Self::Shift(p) => p.pack(left, right),
    }
  }

  fn unpack_left(&self, key: PackedKey) -> NtId {
    match self {
      Self::PerfectHash(p) => p.unpack_left(key),
      Self::Shift(p) => p.unpack_left(key),
    }
  }

  fn unpack_right(&self, key: PackedKey) -> NtId {
    match self {
      Self::PerfectHash(p) => p.unpack_right(key),
      Self::Shift(p) => p.unpack_right(key),
    }
  }

  fn packed_array_size(&self) -> usize {
    match self {
      Self::PerfectHash(p) => p.packed_array_size(),
      Self::Shift(p) => p.packed_array_size(),
    }
  }
}

/// How a chart entry was derived, at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpointer {
  Binary { left: NtId, right: NtId },
  Unary { child: NtId },
  Lexical { word: WordId },
}

impl Backpointer {
  pub fn pack(&self, packing: &impl PackingFunction) -> Option<PackedChildren> {
    match *self {
      Self::Binary { left, right } => packing.pack(left, right).map(PackedChildren::binary),
      Self::Unary { child } => Some(PackedChildren::unary(child)),
      Self::Lexical { word } => Some(PackedChildren::lexical(word)),
    }
  }
}

const LEXICAL_LIMIT: i32 = 1 << 30;

/// Backpointer packed into one `i32`, as stored in the chart.
///
/// Binary keys are non-negative, unary children are `-1 - child`, lexical
/// entries are `i32::MIN + word`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackedChildren(i32);

impl PackedChildren {
  pub const NONE: Self = Self(-LEXICAL_LIMIT);

  #[inline]
  pub fn binary(key: PackedKey) -> Self {
    debug_assert!(key <= i32::MAX as u32);
    Self(key as i32)
  }

  #[inline]
  pub fn unary(child: NtId) -> Self {
    Self(-1 - child as i32)
  }

  #[inline]
  pub fn lexical(word: WordId) -> Self {
    debug_assert!((word as i64) < LEXICAL_LIMIT as i64);
    Self(i32::MIN + word as i32)
  }

  pub fn raw(&self) -> i32 {
    self.0
  }

  pub fn is_none(&self) -> bool {
    *self == Self::NONE
  }

  pub fn is_binary(&self) -> bool {
    self.0 >= 0
  }

  pub fn is_unary(&self) -> bool {
    self.0 < 0 && self.0 >= -1 - NtId::MAX as i32
  }

  pub fn is_lexical(&self) -> bool {
    self.0 < i32::MIN + LEXICAL_LIMIT
  }

  pub fn key(&self) -> Option<PackedKey> {
    if self.is_binary() {
      Some(self.0 as PackedKey)
    } else {
      None
    }
  }

  pub fn unary_child(&self) -> Option<NtId> {
    if self.is_unary() {
      Some((-1 - self.0) as NtId)
    } else {
      None
    }
  }

  pub fn word(&self) -> Option<WordId> {
    if self.is_lexical() {
      Some((self.0 - i32::MIN) as WordId)
    } else {
      None
    }
  }

  pub fn unpack(&self, packing: &impl PackingFunction) -> Option<Backpointer> {
    if let Some(key) = self.key() {
      Some(Backpointer::Binary {
        left: packing.unpack_left(key),
        right: packing.unpack_right(key),
      })
    } else if let Some(child) = self.unary_child() {
      Some(Backpointer::Unary { child })
    } else {
      self.word().map(|word| Backpointer::Lexical { word })
    }
  }
}

impl Default for PackedChildren {
  fn default() -> Self {
    Self::NONE
  }
}
