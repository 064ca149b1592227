//! Fractional rule counts: accumulation, relative-frequency estimation,
//! grammar induction from trees, and grammar splitting.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{Error, Result};
use crate::grammar::{split_label, Grammar, GrammarBuilder};
use crate::packing::PackingScheme;
use crate::rules::{Children, NtId, WordId};
use crate::symbols::SymbolTable;
use crate::syntree::SynTree;
use crate::utils::log_sum_f64;

/// Relative size of the random perturbation applied when splitting rules.
const SPLIT_NOISE: f64 = 0.01;

/// Log-domain expected (or observed) counts per rule, over the symbol tables
/// of one grammar.
#[derive(Debug, Clone)]
pub struct FractionalCounts {
  non_terminals: SymbolTable,
  lexicon: SymbolTable,
  start: NtId,
  binary: HashMap<(NtId, NtId, NtId), f64>,
  unary: HashMap<(NtId, NtId), f64>,
  lexical: HashMap<(NtId, WordId), f64>,
}

fn accumulate<K: std::hash::Hash + Eq>(map: &mut HashMap<K, f64>, key: K, log_count: f64) {
  if log_count == f64::NEG_INFINITY {
    return;
  }
  let entry = map.entry(key).or_insert(f64::NEG_INFINITY);
  *entry = log_sum_f64(*entry, log_count);
}

fn sorted<K: Ord + Copy>(map: &HashMap<K, f64>) -> Vec<(K, f64)> {
  let mut v: Vec<(K, f64)> = map.iter().map(|(k, c)| (*k, *c)).collect();
  v.sort_by_key(|(k, _)| *k);
  v
}

impl FractionalCounts {
  /// Empty counts over the grammar's symbols.
  pub fn for_grammar(grammar: &Grammar) -> Self {
    Self {
      non_terminals: grammar.non_terminals().clone(),
      lexicon: grammar.lexicon().clone(),
      start: grammar.start_symbol(),
      binary: HashMap::new(),
      unary: HashMap::new(),
      lexical: HashMap::new(),
    }
  }

  pub fn non_terminals(&self) -> &SymbolTable {
    &self.non_terminals
  }

  pub fn add_binary(&mut self, parent: NtId, left: NtId, right: NtId, log_count: f64) {
    accumulate(&mut self.binary, (parent, left, right), log_count);
  }

  pub fn add_unary(&mut self, parent: NtId, child: NtId, log_count: f64) {
    accumulate(&mut self.unary, (parent, child), log_count);
  }

  pub fn add_lexical(&mut self, parent: NtId, word: WordId, log_count: f64) {
    accumulate(&mut self.lexical, (parent, word), log_count);
  }

  pub fn binary_count(&self, parent: NtId, left: NtId, right: NtId) -> f64 {
    self
      .binary
      .get(&(parent, left, right))
      .copied()
      .unwrap_or(f64::NEG_INFINITY)
  }

  pub fn unary_count(&self, parent: NtId, child: NtId) -> f64 {
    self
      .unary
      .get(&(parent, child))
      .copied()
      .unwrap_or(f64::NEG_INFINITY)
  }

  pub fn lexical_count(&self, parent: NtId, word: WordId) -> f64 {
    self
      .lexical
      .get(&(parent, word))
      .copied()
      .unwrap_or(f64::NEG_INFINITY)
  }

  pub fn num_rules(&self) -> usize {
    self.binary.len() + self.unary.len() + self.lexical.len()
  }

  /// Log of the summed counts of every rule expanding each non-terminal.
  pub fn parent_counts(&self) -> Vec<f64> {
    let mut totals = vec![f64::NEG_INFINITY; self.non_terminals.len()];
    for (&(p, _, _), &c) in &self.binary {
      totals[p as usize] = log_sum_f64(totals[p as usize], c);
    }
    for (&(p, _), &c) in &self.unary {
      totals[p as usize] = log_sum_f64(totals[p as usize], c);
    }
    for (&(p, _), &c) in &self.lexical {
      totals[p as usize] = log_sum_f64(totals[p as usize], c);
    }
    totals
  }

  pub fn parent_count(&self, parent: NtId) -> f64 {
    self
      .parent_counts()
      .get(parent as usize)
      .copied()
      .unwrap_or(f64::NEG_INFINITY)
  }

  /// Adds another set of counts over the same symbol tables.
  pub fn merge(&mut self, other: &FractionalCounts) {
    for (&k, &c) in &other.binary {
      accumulate(&mut self.binary, k, c);
    }
    for (&k, &c) in &other.unary {
      accumulate(&mut self.unary, k, c);
    }
    for (&k, &c) in &other.lexical {
      accumulate(&mut self.lexical, k, c);
    }
  }

  /// For every split non-terminal, the log of its share of the counts of
  /// its merge pair (`X_2k`, `X_2k+1`). Unpaired non-terminals get 0.
  pub fn log_split_fractions(&self, grammar: &Grammar) -> Vec<f32> {
    let totals = self.parent_counts();
    let vocabulary = grammar.vocabulary();
    let mut fractions = vec![0.0f32; totals.len()];
    for nt in 0..totals.len() as NtId {
      let base = vocabulary.base_index(nt);
      let split = vocabulary.split_index(nt);
      let sibling_split = split ^ 1;
      let sibling = vocabulary
        .splits(base)
        .find(|&s| vocabulary.split_index(s) == sibling_split);
      if let Some(sibling) = sibling {
        let pair = log_sum_f64(totals[nt as usize], totals[sibling as usize]);
        if pair > f64::NEG_INFINITY {
          fractions[nt as usize] = (totals[nt as usize] - pair) as f32;
        }
      }
    }
    fractions
  }

  /// The M-step: relative-frequency estimate of each rule given its parent.
  pub fn to_grammar(&self) -> Result<Grammar> {
    self.to_grammar_with_packing(PackingScheme::default())
  }

  pub fn to_grammar_with_packing(&self, scheme: PackingScheme) -> Result<Grammar> {
    let totals = self.parent_counts();
    let name = |nt: NtId| &self.non_terminals[nt as usize];
    let weight = |p: NtId, c: f64| ((c - totals[p as usize]).min(0.0)) as f32;

    let mut builder = GrammarBuilder::new(name(self.start)).packing(scheme);
    for ((p, l, r), c) in sorted(&self.binary) {
      builder.add_binary(name(p), name(l), name(r), weight(p, c))?;
    }
    for ((p, c), n) in sorted(&self.unary) {
      builder.add_unary(name(p), name(c), weight(p, n))?;
    }
    for ((p, w), c) in sorted(&self.lexical) {
      builder.add_lexical(name(p), &self.lexicon[w as usize], weight(p, c))?;
    }
    debug!(rules = self.num_rules(), "estimated grammar from counts");
    builder.build()
  }

  /// Observed counts (one per rule occurrence) of binarized bracketed trees.
  /// All trees must share the root label, which becomes the start symbol.
  pub fn induce<'a, I>(trees: I) -> Result<Self>
  where
    I: IntoIterator<Item = &'a SynTree<String, String>>,
  {
    let mut counts: Option<Self> = None;
    for tree in trees {
      let (root, _) = tree
        .get_branch()
        .ok_or_else(|| Error::tree("a tree must be bracketed"))?;
      let counts = counts.get_or_insert_with(|| {
        let non_terminals: SymbolTable = [root.value.as_str()].into_iter().collect();
        Self {
          non_terminals,
          lexicon: SymbolTable::new(),
          start: 0,
          binary: HashMap::new(),
          unary: HashMap::new(),
          lexical: HashMap::new(),
        }
      });
      if root.value != counts.non_terminals[counts.start as usize] {
        return Err(Error::tree(format!(
          "root label '{}' differs from start symbol '{}'",
          root.value, &counts.non_terminals[counts.start as usize]
        )));
      }
      counts.count_tree(tree)?;
    }
    counts.ok_or_else(|| Error::tree("no trees to induce a grammar from"))
  }

  fn nt(&mut self, label: &str) -> Result<NtId> {
    Ok(self.non_terminals.add(label)? as NtId)
  }

  fn count_tree(&mut self, tree: &SynTree<String, String>) -> Result<NtId> {
    let (c, children) = tree
      .get_branch()
      .ok_or_else(|| Error::tree("unexpected leaf"))?;
    let parent = self.nt(&c.value)?;
    match children.as_slice() {
      [SynTree::Leaf(w)] => {
        let word = self.lexicon.add(&w.value)? as WordId;
        self.add_lexical(parent, word, 0.0);
      }
      [child] => {
        let child = self.count_tree(child)?;
        self.add_unary(parent, child, 0.0);
      }
      [left, right] if left.is_branch() && right.is_branch() => {
        let left = self.count_tree(left)?;
        let right = self.count_tree(right)?;
        self.add_binary(parent, left, right, 0.0);
      }
      _ => {
        return Err(Error::tree(format!(
          "constituent '{}' over {:?} is not binarized",
          c.value, c.span
        )))
      }
    }
    Ok(parent)
  }
}

/// Deterministic pseudo-random value in [-1, 1] (splitmix64).
fn jitter(seed: u64) -> f64 {
  let mut z = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
  z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
  z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
  z ^= z >> 31;
  (z >> 11) as f64 / (1u64 << 52) as f64 - 1.0
}

enum SplitRhs<'a> {
  Binary(&'a str, &'a str),
  Unary(&'a str),
  Lexical(&'a str),
}

/// Splits every non-terminal except the start symbol in two: `X_k` becomes
/// `X_2k` and `X_2k+1`. Each split parent receives its original rule mass
/// spread evenly over the split children, with a small deterministic
/// perturbation so that EM can pull the splits apart.
pub fn split_grammar(grammar: &Grammar) -> Result<Grammar> {
  let start = grammar.start_symbol();
  let names: Vec<Vec<String>> = (0..grammar.num_non_terminals() as NtId)
    .map(|nt| {
      let label = grammar.label(nt);
      if nt == start {
        vec![label.to_string()]
      } else {
        let (base, split) = split_label(label);
        (0..2).map(|j| format!("{}_{}", base, 2 * split + j)).collect()
      }
    })
    .collect();

  let mut rules: Vec<(&str, SplitRhs, f64)> = Vec::new();
  let mut seed = 0u64;
  let mut perturbed = |q: f64| {
    seed += 1;
    q * (1.0 + SPLIT_NOISE * jitter(seed))
  };

  for p in grammar.productions() {
    let prob = p.probability();
    for parent in &names[p.parent as usize] {
      match p.children {
        Children::Binary(l, r) => {
          let (ls, rs) = (&names[l as usize], &names[r as usize]);
          let share = prob / (ls.len() * rs.len()) as f64;
          for left in ls {
            for right in rs {
              rules.push((parent.as_str(), SplitRhs::Binary(left, right), perturbed(share)));
            }
          }
        }
        Children::Unary(c) => {
          let cs = &names[c as usize];
          let share = prob / cs.len() as f64;
          for child in cs {
            rules.push((parent.as_str(), SplitRhs::Unary(child), perturbed(share)));
          }
        }
        Children::Lexical(w) => {
          rules.push((parent.as_str(), SplitRhs::Lexical(grammar.word(w)), perturbed(prob)));
        }
      }
    }
  }

  let mut totals: HashMap<&str, f64> = HashMap::new();
  for &(parent, _, q) in &rules {
    *totals.entry(parent).or_insert(0.0) += q;
  }

  let mut builder = GrammarBuilder::new(grammar.start_symbol_name()).packing(grammar.packing().scheme());
  for &(parent, ref rhs, q) in &rules {
    let total = totals.get(parent).copied().unwrap_or(q);
    let weight = (q / total).ln().min(0.0) as f32;
    match *rhs {
      SplitRhs::Binary(l, r) => builder.add_binary(parent, l, r, weight)?,
      SplitRhs::Unary(c) => builder.add_unary(parent, c, weight)?,
      SplitRhs::Lexical(w) => builder.add_lexical(parent, w, weight)?,
    }
  }
  let split = builder.build()?;
  debug!(
    before = grammar.num_non_terminals(),
    after = split.num_non_terminals(),
    "split grammar"
  );
  Ok(split)
}
