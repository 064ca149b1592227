use std::collections::HashSet;
use std::fmt;
use std::ops::Range;

use tracing::debug;

use crate::error::{Error, Result};
use crate::packing::{
  PackedKey, Packing, PackingFunction, PackingScheme, PerfectHashPacking, ShiftPacking,
};
use crate::rules::{Children, NtId, Production, WordId};
use crate::symbols::SymbolTable;
use crate::utils::log_sum;

/// Lexicon entry used for words the grammar has never seen.
pub const UNKNOWN_WORD: &str = "UNK";

/// Log probabilities above this are rejected as not normalizable.
const MAX_LOG_PROB: f32 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinaryRule {
  pub parent: NtId,
  pub left: NtId,
  pub right: NtId,
  pub log_prob: f32,
  pub prob: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnaryRule {
  pub parent: NtId,
  pub child: NtId,
  pub log_prob: f32,
  pub prob: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LexicalRule {
  pub parent: NtId,
  pub word: WordId,
  pub log_prob: f32,
  pub prob: f64,
}

/// One column of the binary rule matrix: every rule sharing a child pair,
/// sorted by parent.
#[derive(Debug, Clone, Copy)]
pub struct Column<'a> {
  pub parents: &'a [NtId],
  pub log_probs: &'a [f32],
  pub probs: &'a [f64],
}

impl Column<'_> {
  pub fn len(&self) -> usize {
    self.parents.len()
  }

  pub fn is_empty(&self) -> bool {
    self.parents.is_empty()
  }

  /// Indices of the rules whose parent lies in `first..=last`.
  pub fn parent_range(&self, first: NtId, last: NtId) -> Range<usize> {
    let lo = self.parents.partition_point(|&p| p < first);
    let hi = lo + self.parents[lo..].partition_point(|&p| p <= last);
    lo..hi
  }
}

/// One row of the parent-indexed (CSR) binary matrix.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
  pub keys: &'a [PackedKey],
  pub rules: &'a [BinaryRule],
}

/// Maps split non-terminals (`NP_0`, `NP_1`, ...) onto their base labels.
///
/// The grammar orders non-terminals so that all splits of a base label are
/// contiguous and ascending, which lets split-aware code scan
/// `first_split(base)..first_split(base) + split_count(base)`.
#[derive(Debug, Clone)]
pub struct SplitVocabulary {
  base: SymbolTable,
  base_of: Vec<NtId>,
  split_of: Vec<u16>,
  first_split: Vec<NtId>,
  split_counts: Vec<u16>,
  max_splits: usize,
}

impl SplitVocabulary {
  pub fn new(non_terminals: &SymbolTable) -> Result<Self> {
    let mut base = SymbolTable::new();
    let mut base_of = Vec::with_capacity(non_terminals.len());
    let mut split_of = Vec::with_capacity(non_terminals.len());
    let mut first_split: Vec<NtId> = Vec::new();
    let mut split_counts: Vec<u16> = Vec::new();

    for (nt, name) in non_terminals.iter() {
      let (base_name, split) = split_label(name);
      let b = base.add(base_name)?;
      if b == first_split.len() {
        first_split.push(nt as NtId);
        split_counts.push(0);
      } else if first_split[b] as usize + split_counts[b] as usize != nt {
        return Err(Error::grammar(
          0,
          format!("splits of '{}' are not contiguous", base_name),
        ));
      }
      split_counts[b] += 1;
      base_of.push(b as NtId);
      split_of.push(split);
    }
    base.finalize();

    let max_splits = split_counts.iter().copied().max().unwrap_or(1) as usize;
    Ok(Self {
      base,
      base_of,
      split_of,
      first_split,
      split_counts,
      max_splits,
    })
  }

  pub fn base_symbols(&self) -> &SymbolTable {
    &self.base
  }

  pub fn num_base(&self) -> usize {
    self.base.len()
  }

  pub fn base_index(&self, nt: NtId) -> NtId {
    self.base_of[nt as usize]
  }

  /// Split number parsed from the label suffix (0 for unsplit labels).
  pub fn split_index(&self, nt: NtId) -> u16 {
    self.split_of[nt as usize]
  }

  pub fn first_split(&self, base: NtId) -> NtId {
    self.first_split[base as usize]
  }

  pub fn split_count(&self, base: NtId) -> usize {
    self.split_counts[base as usize] as usize
  }

  pub fn splits(&self, base: NtId) -> Range<NtId> {
    let first = self.first_split(base);
    first..first + self.split_count(base) as NtId
  }

  pub fn max_splits(&self) -> usize {
    self.max_splits
  }
}

/// `NP_12` -> (`NP`, 12). Labels without a numeric suffix are their own base.
pub fn split_label(name: &str) -> (&str, u16) {
  if let Some(pos) = name.rfind('_') {
    let suffix = &name[pos + 1..];
    if pos > 0 && !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
      if let Ok(split) = suffix.parse::<u16>() {
        return (&name[..pos], split);
      }
    }
  }
  (name, 0)
}

/// Labels introduced by binarization carry no constituent of their own.
pub fn is_factored_label(name: &str) -> bool {
  name.starts_with('@') || name.contains('|')
}

/// Immutable packed representation of a PCFG.
///
/// Binary rules are stored column-compressed by packed child pair (for
/// intersection), row-compressed by parent (for sparse matrix-vector
/// intersection), and in two child-indexed lists (for outside propagation).
#[derive(Debug, Clone)]
pub struct Grammar {
  non_terminals: SymbolTable,
  lexicon: SymbolTable,
  start: NtId,
  packing: Packing,
  vocabulary: SplitVocabulary,
  productions: Vec<Production>,

  column_offsets: Vec<u32>,
  column_parents: Vec<NtId>,
  column_log_probs: Vec<f32>,
  column_probs: Vec<f64>,

  row_offsets: Vec<u32>,
  row_keys: Vec<PackedKey>,
  row_rules: Vec<BinaryRule>,

  left_offsets: Vec<u32>,
  left_rules: Vec<BinaryRule>,
  right_offsets: Vec<u32>,
  right_rules: Vec<BinaryRule>,

  unary_child_offsets: Vec<u32>,
  unary_by_child: Vec<UnaryRule>,
  unary_parent_offsets: Vec<u32>,
  unary_by_parent: Vec<UnaryRule>,

  lexical_offsets: Vec<u32>,
  lexical_rules: Vec<LexicalRule>,

  valid_left: Vec<bool>,
  valid_right: Vec<bool>,
  factored: Vec<bool>,
  pos: Vec<bool>,
  unknown_word: Option<WordId>,
}

/// Offsets for a list sorted by `key`, with `n` buckets.
fn bucket_offsets<T>(items: &[T], n: usize, key: impl Fn(&T) -> usize) -> Vec<u32> {
  let mut offsets = vec![0u32; n + 1];
  for item in items {
    offsets[key(item) + 1] += 1;
  }
  for i in 0..n {
    offsets[i + 1] += offsets[i];
  }
  offsets
}

fn bucket<'a, T>(items: &'a [T], offsets: &[u32], idx: usize) -> &'a [T] {
  match (offsets.get(idx), offsets.get(idx + 1)) {
    (Some(&lo), Some(&hi)) => &items[lo as usize..hi as usize],
    _ => &[],
  }
}

impl Grammar {
  pub fn builder(start: &str) -> GrammarBuilder {
    GrammarBuilder::new(start)
  }

  pub fn non_terminals(&self) -> &SymbolTable {
    &self.non_terminals
  }

  pub fn lexicon(&self) -> &SymbolTable {
    &self.lexicon
  }

  pub fn num_non_terminals(&self) -> usize {
    self.non_terminals.len()
  }

  pub fn num_words(&self) -> usize {
    self.lexicon.len()
  }

  pub fn start_symbol(&self) -> NtId {
    self.start
  }

  pub fn start_symbol_name(&self) -> &str {
    &self.non_terminals[self.start as usize]
  }

  pub fn non_terminal(&self, name: &str) -> Option<NtId> {
    self.non_terminals.index(name).map(|i| i as NtId)
  }

  pub fn label(&self, nt: NtId) -> &str {
    &self.non_terminals[nt as usize]
  }

  pub fn word(&self, word: WordId) -> &str {
    &self.lexicon[word as usize]
  }

  pub fn packing(&self) -> &Packing {
    &self.packing
  }

  /// One past the largest packed column key.
  pub fn packing_size(&self) -> usize {
    self.packing.packed_array_size()
  }

  pub fn vocabulary(&self) -> &SplitVocabulary {
    &self.vocabulary
  }

  pub fn productions(&self) -> &[Production] {
    &self.productions
  }

  pub fn num_binary_rules(&self) -> usize {
    self.column_parents.len()
  }

  pub fn num_unary_rules(&self) -> usize {
    self.unary_by_child.len()
  }

  pub fn num_lexical_rules(&self) -> usize {
    self.lexical_rules.len()
  }

  /// Maps a token to its lexicon index, falling back to the `UNK` entry.
  pub fn map_token(&self, token: &str) -> Option<WordId> {
    self
      .lexicon
      .index(token)
      .map(|w| w as WordId)
      .or(self.unknown_word)
  }

  pub fn map_tokens<S: AsRef<str>>(&self, tokens: &[S]) -> Vec<Option<WordId>> {
    tokens.iter().map(|t| self.map_token(t.as_ref())).collect()
  }

  /// Packs a child pair, returning None unless some binary rule has those children.
  #[inline]
  pub fn intersect(&self, left: NtId, right: NtId) -> Option<PackedKey> {
    let key = self.packing.pack(left, right)?;
    let k = key as usize;
    if self.column_offsets[k] == self.column_offsets[k + 1] {
      None
    } else {
      Some(key)
    }
  }

  #[inline]
  pub fn column(&self, key: PackedKey) -> Column<'_> {
    let lo = self.column_offsets[key as usize] as usize;
    let hi = self.column_offsets[key as usize + 1] as usize;
    Column {
      parents: &self.column_parents[lo..hi],
      log_probs: &self.column_log_probs[lo..hi],
      probs: &self.column_probs[lo..hi],
    }
  }

  pub fn parents_for_column(&self, key: PackedKey) -> impl Iterator<Item = (NtId, f32)> + '_ {
    let column = self.column(key);
    column
      .parents
      .iter()
      .copied()
      .zip(column.log_probs.iter().copied())
  }

  pub fn row(&self, parent: NtId) -> Row<'_> {
    let lo = self.row_offsets[parent as usize] as usize;
    let hi = self.row_offsets[parent as usize + 1] as usize;
    Row {
      keys: &self.row_keys[lo..hi],
      rules: &self.row_rules[lo..hi],
    }
  }

  pub fn rules_for_parent(&self, parent: NtId) -> &[BinaryRule] {
    self.row(parent).rules
  }

  /// Binary rules with `left` as left child, sorted by right child then parent.
  pub fn rules_with_left_child(&self, left: NtId) -> &[BinaryRule] {
    bucket(&self.left_rules, &self.left_offsets, left as usize)
  }

  /// Binary rules with `right` as right child, sorted by left child then parent.
  pub fn rules_with_right_child(&self, right: NtId) -> &[BinaryRule] {
    bucket(&self.right_rules, &self.right_offsets, right as usize)
  }

  /// Unary rules rewriting to `child`, sorted by parent.
  pub fn unary_rules_with_child(&self, child: NtId) -> &[UnaryRule] {
    bucket(&self.unary_by_child, &self.unary_child_offsets, child as usize)
  }

  pub fn parents_for_unary_child(&self, child: NtId) -> impl Iterator<Item = (NtId, f32)> + '_ {
    self
      .unary_rules_with_child(child)
      .iter()
      .map(|r| (r.parent, r.log_prob))
  }

  /// Unary rules expanding `parent`, sorted by child.
  pub fn unary_children(&self, parent: NtId) -> &[UnaryRule] {
    bucket(
      &self.unary_by_parent,
      &self.unary_parent_offsets,
      parent as usize,
    )
  }

  pub fn lexical_rules(&self, word: WordId) -> &[LexicalRule] {
    bucket(&self.lexical_rules, &self.lexical_offsets, word as usize)
  }

  pub fn lexical_parents(&self, word: WordId) -> impl Iterator<Item = (NtId, f32)> + '_ {
    self
      .lexical_rules(word)
      .iter()
      .map(|r| (r.parent, r.log_prob))
  }

  pub fn binary_log_prob(&self, parent: NtId, left: NtId, right: NtId) -> f32 {
    let Some(key) = self.intersect(left, right) else {
      return f32::NEG_INFINITY;
    };
    let column = self.column(key);
    match column.parents.binary_search(&parent) {
      Ok(i) => column.log_probs[i],
      Err(_) => f32::NEG_INFINITY,
    }
  }

  pub fn unary_log_prob(&self, parent: NtId, child: NtId) -> f32 {
    let rules = self.unary_rules_with_child(child);
    match rules.binary_search_by_key(&parent, |r| r.parent) {
      Ok(i) => rules[i].log_prob,
      Err(_) => f32::NEG_INFINITY,
    }
  }

  pub fn lexical_log_prob(&self, parent: NtId, word: WordId) -> f32 {
    let rules = self.lexical_rules(word);
    match rules.binary_search_by_key(&parent, |r| r.parent) {
      Ok(i) => rules[i].log_prob,
      Err(_) => f32::NEG_INFINITY,
    }
  }

  #[inline]
  pub fn is_valid_left_child(&self, nt: NtId) -> bool {
    self.valid_left[nt as usize]
  }

  #[inline]
  pub fn is_valid_right_child(&self, nt: NtId) -> bool {
    self.valid_right[nt as usize]
  }

  pub fn is_factored(&self, nt: NtId) -> bool {
    self.factored[nt as usize]
  }

  /// True if the non-terminal has at least one lexical rule.
  pub fn is_pos(&self, nt: NtId) -> bool {
    self.pos[nt as usize]
  }
}

impl fmt::Display for Grammar {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.to_text())
  }
}

/// Collects symbols and productions, then packs them into a [`Grammar`].
#[derive(Debug, Clone)]
pub struct GrammarBuilder {
  non_terminals: SymbolTable,
  lexicon: SymbolTable,
  productions: Vec<Production>,
  scheme: PackingScheme,
}

impl GrammarBuilder {
  /// The start symbol always receives index 0.
  pub fn new(start: &str) -> Self {
    let non_terminals: SymbolTable = [start].into_iter().collect();
    Self {
      non_terminals,
      lexicon: SymbolTable::new(),
      productions: Vec::new(),
      scheme: PackingScheme::default(),
    }
  }

  pub fn packing(mut self, scheme: PackingScheme) -> Self {
    self.scheme = scheme;
    self
  }

  pub fn set_packing(&mut self, scheme: PackingScheme) {
    self.scheme = scheme;
  }

  pub fn non_terminal(&mut self, name: &str) -> Result<NtId> {
    let idx = self.non_terminals.add(name)?;
    if idx > NtId::MAX as usize {
      return Err(Error::grammar(0, "too many non-terminals"));
    }
    Ok(idx as NtId)
  }

  pub fn word(&mut self, word: &str) -> Result<WordId> {
    Ok(self.lexicon.add(word)? as WordId)
  }

  pub fn add_binary(&mut self, parent: &str, left: &str, right: &str, log_prob: f32) -> Result<()> {
    let p = Production::binary(
      self.non_terminal(parent)?,
      self.non_terminal(left)?,
      self.non_terminal(right)?,
      log_prob,
    );
    self.productions.push(p);
    Ok(())
  }

  pub fn add_unary(&mut self, parent: &str, child: &str, log_prob: f32) -> Result<()> {
    let p = Production::unary(self.non_terminal(parent)?, self.non_terminal(child)?, log_prob);
    self.productions.push(p);
    Ok(())
  }

  pub fn add_lexical(&mut self, parent: &str, word: &str, log_prob: f32) -> Result<()> {
    let p = Production::lexical(self.non_terminal(parent)?, self.word(word)?, log_prob);
    self.productions.push(p);
    Ok(())
  }

  /// Adds a production over ids that were already declared on this builder.
  pub fn add_production(&mut self, p: Production) -> Result<()> {
    let nts = self.non_terminals.len();
    let known = |nt: NtId| (nt as usize) < nts;
    let ok = known(p.parent)
      && match p.children {
        Children::Binary(l, r) => known(l) && known(r),
        Children::Unary(c) => known(c),
        Children::Lexical(w) => (w as usize) < self.lexicon.len(),
      };
    if !ok {
      return Err(Error::grammar(0, format!("production references unknown symbol: {:?}", p)));
    }
    self.productions.push(p);
    Ok(())
  }

  fn label(&self, nt: NtId) -> &str {
    &self.non_terminals[nt as usize]
  }

  fn validate(&self) -> Result<()> {
    let nts = self.non_terminals.len();
    let mut expanded = vec![false; nts];
    let mut referenced = vec![false; nts];

    for p in &self.productions {
      if p.weight.is_nan() || p.weight > MAX_LOG_PROB {
        return Err(Error::grammar(
          0,
          format!(
            "rule {} has weight {}, not a log probability",
            p.display(&self.non_terminals, &self.lexicon),
            p.weight
          ),
        ));
      }
      expanded[p.parent as usize] = true;
      match p.children {
        Children::Binary(l, r) => {
          referenced[l as usize] = true;
          referenced[r as usize] = true;
        }
        Children::Unary(c) => {
          if c == p.parent {
            return Err(Error::grammar(
              0,
              format!("unary self-loop on {}", self.label(c)),
            ));
          }
          referenced[c as usize] = true;
        }
        Children::Lexical(_) => {}
      }
    }

    if !expanded[0] {
      return Err(Error::grammar(
        0,
        format!("no rule expands the start symbol {}", self.label(0)),
      ));
    }
    for nt in 0..nts {
      if referenced[nt] && !expanded[nt] {
        return Err(Error::grammar(
          0,
          format!("unknown non-terminal {} (never expanded)", self.label(nt as NtId)),
        ));
      }
    }
    Ok(())
  }

  /// Orders non-terminals so the start symbol comes first and the splits of
  /// each base label are contiguous and ascending. Returns the new table and
  /// the old-to-new id mapping.
  fn canonical_order(&self) -> Result<(SymbolTable, Vec<NtId>)> {
    let mut bases: Vec<&str> = Vec::new();
    let mut seen = HashSet::new();
    for (_, name) in self.non_terminals.iter() {
      let (base, _) = split_label(name);
      if seen.insert(base) {
        bases.push(base);
      }
    }
    let mut order: Vec<(usize, u16, usize)> = self
      .non_terminals
      .iter()
      .map(|(nt, name)| {
        let (base, split) = split_label(name);
        let rank = bases.iter().position(|b| *b == base).unwrap_or(0);
        (rank, split, nt)
      })
      .collect();
    // the start symbol stays at index 0 even if it shares a base label
    order.sort_by_key(|&(rank, split, nt)| (nt != 0, rank, split));

    let mut table = SymbolTable::new();
    let mut mapping = vec![0 as NtId; order.len()];
    for &(_, _, nt) in &order {
      mapping[nt] = table.add(&self.non_terminals[nt])? as NtId;
    }
    Ok((table, mapping))
  }

  pub fn build(mut self) -> Result<Grammar> {
    self.productions.retain(|p| p.weight > f32::NEG_INFINITY);
    self.validate()?;

    let (mut non_terminals, mapping) = self.canonical_order()?;
    non_terminals.finalize();
    let mut lexicon = self.lexicon;
    lexicon.finalize();
    let vocabulary = SplitVocabulary::new(&non_terminals)?;
    let nts = non_terminals.len();
    let words = lexicon.len();

    let remap = |p: &Production| Production {
      parent: mapping[p.parent as usize],
      children: match p.children {
        Children::Binary(l, r) => Children::Binary(mapping[l as usize], mapping[r as usize]),
        Children::Unary(c) => Children::Unary(mapping[c as usize]),
        Children::Lexical(w) => Children::Lexical(w),
      },
      weight: p.weight,
    };
    let mut productions: Vec<Production> = self.productions.iter().map(remap).collect();

    // duplicate rules are merged by summing their probabilities
    productions.sort_by_key(|p| (p.children, p.parent));
    let mut merged: Vec<Production> = Vec::with_capacity(productions.len());
    for p in productions {
      match merged.last_mut() {
        Some(last) if last.children == p.children && last.parent == p.parent => {
          last.weight = log_sum(last.weight, p.weight).min(0.0);
        }
        _ => merged.push(p),
      }
    }
    let productions = merged;

    let mut binary: Vec<BinaryRule> = Vec::new();
    let mut unary: Vec<UnaryRule> = Vec::new();
    let mut lexical: Vec<LexicalRule> = Vec::new();
    for p in &productions {
      let prob = (p.weight as f64).exp();
      match p.children {
        Children::Binary(left, right) => binary.push(BinaryRule {
          parent: p.parent,
          left,
          right,
          log_prob: p.weight,
          prob,
        }),
        Children::Unary(child) => unary.push(UnaryRule {
          parent: p.parent,
          child,
          log_prob: p.weight,
          prob,
        }),
        Children::Lexical(word) => lexical.push(LexicalRule {
          parent: p.parent,
          word,
          log_prob: p.weight,
          prob,
        }),
      }
    }

    let mut valid_left = vec![false; nts];
    let mut valid_right = vec![false; nts];
    for r in &binary {
      valid_left[r.left as usize] = true;
      valid_right[r.right as usize] = true;
    }

    let packing = match self.scheme {
      PackingScheme::PerfectHash => {
        let pairs: Vec<(NtId, NtId)> = binary.iter().map(|r| (r.left, r.right)).collect();
        Packing::PerfectHash(PerfectHashPacking::new(&pairs))
      }
      PackingScheme::Shift => {
        let num_left = binary.iter().map(|r| r.left as usize + 1).max().unwrap_or(1);
        let num_right = binary.iter().map(|r| r.right as usize + 1).max().unwrap_or(1);
        Packing::Shift(ShiftPacking::new(num_left, num_right)?)
      }
    };

    let key_of = |r: &BinaryRule| -> Result<PackedKey> {
      packing
        .pack(r.left, r.right)
        .ok_or_else(|| Error::grammar(0, "packing function cannot represent a child pair"))
    };
    let mut keyed: Vec<(PackedKey, BinaryRule)> = binary
      .iter()
      .map(|r| key_of(r).map(|k| (k, *r)))
      .collect::<Result<_>>()?;

    // column-compressed: by child pair, parents ascending within a column
    keyed.sort_by_key(|(k, r)| (*k, r.parent));
    let column_offsets = bucket_offsets(&keyed, packing.packed_array_size(), |(k, _)| *k as usize);
    let column_parents = keyed.iter().map(|(_, r)| r.parent).collect();
    let column_log_probs = keyed.iter().map(|(_, r)| r.log_prob).collect();
    let column_probs = keyed.iter().map(|(_, r)| r.prob).collect();

    keyed.sort_by_key(|(k, r)| (r.parent, *k));
    let row_offsets = bucket_offsets(&keyed, nts, |(_, r)| r.parent as usize);
    let row_keys = keyed.iter().map(|(k, _)| *k).collect();
    let row_rules = keyed.iter().map(|(_, r)| *r).collect();

    let mut left_rules = binary.clone();
    left_rules.sort_by_key(|r| (r.left, r.right, r.parent));
    let left_offsets = bucket_offsets(&left_rules, nts, |r| r.left as usize);

    let mut right_rules = binary;
    right_rules.sort_by_key(|r| (r.right, r.left, r.parent));
    let right_offsets = bucket_offsets(&right_rules, nts, |r| r.right as usize);

    let mut unary_by_child = unary.clone();
    unary_by_child.sort_by_key(|r| (r.child, r.parent));
    let unary_child_offsets = bucket_offsets(&unary_by_child, nts, |r| r.child as usize);

    let mut unary_by_parent = unary;
    unary_by_parent.sort_by_key(|r| (r.parent, r.child));
    let unary_parent_offsets = bucket_offsets(&unary_by_parent, nts, |r| r.parent as usize);

    lexical.sort_by_key(|r| (r.word, r.parent));
    let lexical_offsets = bucket_offsets(&lexical, words, |r| r.word as usize);
    let mut pos = vec![false; nts];
    for r in &lexical {
      pos[r.parent as usize] = true;
    }

    let factored = non_terminals
      .iter()
      .map(|(_, name)| is_factored_label(name))
      .collect();
    let unknown_word = lexicon.index(UNKNOWN_WORD).map(|w| w as WordId);

    debug!(
      non_terminals = nts,
      words,
      binary = keyed.len(),
      unary = unary_by_child.len(),
      lexical = lexical.len(),
      packed_keys = packing.packed_array_size(),
      "built grammar"
    );

    Ok(Grammar {
      non_terminals,
      lexicon,
      start: 0,
      packing,
      vocabulary,
      productions,
      column_offsets,
      column_parents,
      column_log_probs,
      column_probs,
      row_offsets,
      row_keys,
      row_rules,
      left_offsets,
      left_rules,
      right_offsets,
      right_rules,
      unary_child_offsets,
      unary_by_child,
      unary_parent_offsets,
      unary_by_parent,
      lexical_offsets,
      lexical_rules: lexical,
      valid_left,
      valid_right,
      factored,
      pos,
      unknown_word,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn toy(scheme: PackingScheme) -> Grammar {
    let mut b = Grammar::builder("S").packing(scheme);
    b.add_binary("S", "NP", "VP", 0.0).unwrap();
    b.add_binary("NP", "DT", "NN", (0.4f32).ln()).unwrap();
    b.add_binary("VP", "VB", "NP", (0.7f32).ln()).unwrap();
    b.add_binary("NP", "NP", "NN", (0.2f32).ln()).unwrap();
    b.add_binary("@NP", "NP", "NN", 0.0).unwrap();
    b.add_unary("VP", "VB", (0.3f32).ln()).unwrap();
    b.add_unary("NP", "NN", (0.4f32).ln()).unwrap();
    b.add_lexical("DT", "the", 0.0).unwrap();
    b.add_lexical("NN", "fish", (0.5f32).ln()).unwrap();
    b.add_lexical("NN", "dog", (0.5f32).ln()).unwrap();
    b.add_lexical("VB", "fish", 0.0).unwrap();
    b.build().unwrap()
  }

  #[test]
  fn test_columns_sorted_and_contiguous() {
    for scheme in [PackingScheme::PerfectHash, PackingScheme::Shift] {
      let g = toy(scheme);
      let np = g.non_terminal("NP").unwrap();
      let nn = g.non_terminal("NN").unwrap();
      let key = g.intersect(np, nn).unwrap();
      let column = g.column(key);
      assert_eq!(column.len(), 2);
      assert!(column.parents.windows(2).all(|w| w[0] < w[1]));
      let parents: Vec<&str> = g.parents_for_column(key).map(|(p, _)| g.label(p)).collect();
      assert!(parents.contains(&"NP") && parents.contains(&"@NP"));
      assert_eq!(g.intersect(nn, np), None);
    }
  }

  #[test]
  fn test_point_lookups() {
    let g = toy(PackingScheme::PerfectHash);
    let id = |s: &str| g.non_terminal(s).unwrap();
    assert!((g.binary_log_prob(id("VP"), id("VB"), id("NP")) - 0.7f32.ln()).abs() < 1e-6);
    assert_eq!(g.binary_log_prob(id("S"), id("VB"), id("NP")), f32::NEG_INFINITY);
    assert!((g.unary_log_prob(id("NP"), id("NN")) - 0.4f32.ln()).abs() < 1e-6);
    let fish = g.map_token("fish").unwrap();
    assert_eq!(g.lexical_log_prob(id("VB"), fish), 0.0);
    assert_eq!(g.lexical_parents(fish).count(), 2);
    assert_eq!(g.map_token("cat"), None);
  }

  #[test]
  fn test_child_indexed_views() {
    let g = toy(PackingScheme::Shift);
    let id = |s: &str| g.non_terminal(s).unwrap();
    let with_left_np = g.rules_with_left_child(id("NP"));
    assert_eq!(with_left_np.len(), 3);
    assert!(with_left_np.iter().all(|r| r.left == id("NP")));
    let with_right_np = g.rules_with_right_child(id("NP"));
    assert_eq!(with_right_np.len(), 1);
    assert_eq!(with_right_np[0].parent, id("VP"));
    assert_eq!(g.rules_for_parent(id("NP")).len(), 2);
    assert_eq!(g.row(id("NP")).keys.len(), 2);
    assert_eq!(g.unary_children(id("VP"))[0].child, id("VB"));
    assert!(g.is_valid_left_child(id("DT")) && !g.is_valid_right_child(id("DT")));
    assert!(g.is_factored(id("@NP")) && !g.is_factored(id("NP")));
    assert!(g.is_pos(id("NN")) && !g.is_pos(id("S")));
  }

  #[test]
  fn test_build_errors() {
    let mut b = Grammar::builder("S");
    b.add_binary("NP", "DT", "NN", 0.0).unwrap();
    b.add_lexical("DT", "the", 0.0).unwrap();
    b.add_lexical("NN", "dog", 0.0).unwrap();
    assert!(matches!(b.build(), Err(Error::GrammarFormat { .. })));

    let mut b = Grammar::builder("S");
    b.add_binary("S", "NP", "VP", 0.0).unwrap();
    b.add_lexical("NP", "dogs", 0.0).unwrap();
    assert!(b.build().is_err(), "VP is never expanded");

    let mut b = Grammar::builder("S");
    b.add_unary("S", "S", 0.0).unwrap();
    assert!(b.build().is_err());

    let mut b = Grammar::builder("S");
    b.add_lexical("S", "x", 0.5).unwrap();
    assert!(b.build().is_err());
  }

  #[test]
  fn test_split_vocabulary_is_contiguous() {
    let mut b = Grammar::builder("ROOT");
    b.add_unary("ROOT", "S_1", 0.5f32.ln()).unwrap();
    b.add_binary("S_1", "NP_1", "VP_0", 0.0).unwrap();
    b.add_unary("ROOT", "S_0", 0.5f32.ln()).unwrap();
    b.add_binary("S_0", "NP_0", "VP_0", 0.0).unwrap();
    b.add_lexical("NP_0", "a", 0.0).unwrap();
    b.add_lexical("NP_1", "a", 0.0).unwrap();
    b.add_lexical("VP_0", "b", 0.0).unwrap();
    let g = b.build().unwrap();
    let v = g.vocabulary();
    assert_eq!(v.num_base(), 4);
    assert_eq!(v.max_splits(), 2);
    let s = v.base_symbols().index("S").unwrap() as NtId;
    let splits = v.splits(s);
    assert_eq!(splits.len(), 2);
    assert_eq!(g.label(splits.start), "S_0");
    assert_eq!(g.label(splits.start + 1), "S_1");
    assert_eq!(g.start_symbol_name(), "ROOT");
    assert_eq!(v.split_index(splits.start + 1), 1);
  }

  #[test]
  fn test_split_label() {
    assert_eq!(split_label("NP_3"), ("NP", 3));
    assert_eq!(split_label("NP"), ("NP", 0));
    assert_eq!(split_label("_1"), ("_1", 0));
    assert_eq!(split_label("PRP_"), ("PRP_", 0));
  }

  #[test]
  fn test_column_parent_range() {
    let g = toy(PackingScheme::PerfectHash);
    let id = |s: &str| g.non_terminal(s).unwrap();
    let column = g.column(g.intersect(id("NP"), id("NN")).unwrap());
    let np = id("NP");
    let r = column.parent_range(np, np);
    assert_eq!(r.len(), 1);
    assert_eq!(column.parents[r.start], np);
  }
}
