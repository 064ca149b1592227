//! Inside-outside restricted to one backbone tree.
//!
//! A [`ConstrainingChart`] records, for every constituent span of a fixed
//! bracketed tree, the chain of base labels over that span (top first) and
//! how the span splits. [`ConstrainedInsideOutside`] then runs inside and
//! outside over a split grammar, considering only the splits of those labels,
//! which keeps each cell to a handful of entries no matter how many times the
//! grammar has been split.

use tracing::{debug, trace};

use crate::cells::CellConstraints;
use crate::counts::FractionalCounts;
use crate::error::{Error, Result};
use crate::grammar::{Grammar, SplitVocabulary};
use crate::rules::{NtId, WordId};
use crate::syntree::SynTree;
use crate::utils::log_sum_f64;

const CLOSED: usize = usize::MAX;

#[derive(Debug, Clone, Default)]
struct ConstrainingCell {
  /// Base labels, top of the unary chain first.
  chain: Vec<NtId>,
  midpoint: Option<usize>,
}

/// The cells, labels and split points of one backbone tree.
#[derive(Debug, Clone)]
pub struct ConstrainingChart {
  size: usize,
  tokens: Vec<String>,
  words: Vec<Option<WordId>>,
  cells: Vec<ConstrainingCell>,
  open: Vec<(usize, usize)>,
}

fn triangular(size: usize, start: usize, end: usize) -> usize {
  start * size - start * start.saturating_sub(1) / 2 + (end - start - 1)
}

impl ConstrainingChart {
  /// Builds the chart from a binarized tree whose labels are base labels of
  /// `grammar` and whose preterminals each cover one word.
  pub fn from_tree(tree: &SynTree<String, String>, grammar: &Grammar) -> Result<Self> {
    let tokens: Vec<String> = tree.leaves().into_iter().cloned().collect();
    let size = tokens.len();
    if size == 0 || tree.is_leaf() {
      return Err(Error::tree("a constraining tree needs a bracketed root over at least one word"));
    }
    let mut chart = Self {
      size,
      words: grammar.map_tokens(&tokens),
      tokens,
      cells: vec![ConstrainingCell::default(); size * (size + 1) / 2],
      open: Vec::new(),
    };
    chart.add_node(tree, grammar.vocabulary())?;

    for span in 1..=size {
      for start in 0..=size - span {
        if !chart.cells[triangular(size, start, start + span)].chain.is_empty() {
          chart.open.push((start, start + span));
        }
      }
    }
    debug!(size, open = chart.open.len(), "built constraining chart");
    Ok(chart)
  }

  fn add_node(&mut self, node: &SynTree<String, String>, vocabulary: &SplitVocabulary) -> Result<()> {
    let (c, children) = node
      .get_branch()
      .ok_or_else(|| Error::tree("unexpected leaf"))?;
    let (start, end) = c.span;
    let base = vocabulary
      .base_symbols()
      .index(&c.value)
      .ok_or_else(|| Error::UnknownLabel {
        label: c.value.clone(),
      })?;
    let cell = triangular(self.size, start, end);
    self.cells[cell].chain.push(base as NtId);

    match children.as_slice() {
      [SynTree::Leaf(_)] if end - start == 1 => Ok(()),
      [child] if child.is_branch() => self.add_node(child, vocabulary),
      [left, right] if left.is_branch() && right.is_branch() => {
        self.cells[cell].midpoint = Some(left.span().1);
        self.add_node(left, vocabulary)?;
        self.add_node(right, vocabulary)
      }
      _ => Err(Error::tree(format!(
        "constituent '{}' over {:?} is not binarized",
        c.value, c.span
      ))),
    }
  }

  pub fn size(&self) -> usize {
    self.size
  }

  pub fn tokens(&self) -> &[String] {
    &self.tokens
  }

  pub fn words(&self) -> &[Option<WordId>] {
    &self.words
  }

  fn cell(&self, start: usize, end: usize) -> Option<&ConstrainingCell> {
    if start < end && end <= self.size {
      self.cells.get(triangular(self.size, start, end))
    } else {
      None
    }
  }

  /// Number of labels stacked over the span; zero for spans that are not
  /// constituents of the tree.
  pub fn unary_chain_length(&self, start: usize, end: usize) -> usize {
    self.cell(start, end).map_or(0, |c| c.chain.len())
  }

  /// Constituent spans, narrowest first and left to right within a width.
  pub fn open_cells(&self) -> &[(usize, usize)] {
    &self.open
  }

  pub fn is_open(&self, start: usize, end: usize) -> bool {
    self.unary_chain_length(start, end) > 0
  }

  pub fn midpoint(&self, start: usize, end: usize) -> Option<usize> {
    self.cell(start, end).and_then(|c| c.midpoint)
  }

  /// Base label at `depth` of the span's unary chain (0 is the top).
  pub fn label(&self, start: usize, end: usize, depth: usize) -> Option<NtId> {
    self.cell(start, end).and_then(|c| c.chain.get(depth).copied())
  }

  /// Log-domain indicator: 0 if `base` labels the span, negative infinity otherwise.
  pub fn inside(&self, start: usize, end: usize, base: NtId) -> f32 {
    match self.cell(start, end) {
      Some(c) if c.chain.contains(&base) => 0.0,
      _ => f32::NEG_INFINITY,
    }
  }

  /// The open cells as a cell mask for constrained parsing.
  pub fn cell_constraints(&self) -> Result<CellConstraints> {
    CellConstraints::from_open_cells(self.size, &self.open)
  }

  /// Rebuilds the backbone tree from the chart.
  pub fn extract_tree(&self, vocabulary: &SplitVocabulary) -> SynTree<String, String> {
    self.extract(vocabulary, 0, self.size, 0)
  }

  fn extract(&self, vocabulary: &SplitVocabulary, start: usize, end: usize, depth: usize) -> SynTree<String, String> {
    let cell = &self.cells[triangular(self.size, start, end)];
    let name = vocabulary.base_symbols()[cell.chain[depth] as usize].to_string();
    let children = if depth + 1 < cell.chain.len() {
      vec![self.extract(vocabulary, start, end, depth + 1)]
    } else if let Some(mid) = cell.midpoint {
      vec![
        self.extract(vocabulary, start, mid, 0),
        self.extract(vocabulary, mid, end, 0),
      ]
    } else {
      vec![SynTree::leaf(self.tokens[start].clone(), start)]
    };
    SynTree::branch(name, (start, end), children)
  }
}

/// Where the scores of one (cell, chain depth) live.
#[derive(Debug, Clone, Copy)]
struct Slot {
  base: NtId,
  first: NtId,
  splits: usize,
  offset: usize,
}

/// Split-aware inside-outside over a constraining chart.
///
/// Scores are `f64` natural logs, one per split of each chain label.
#[derive(Debug)]
pub struct ConstrainedInsideOutside<'a> {
  grammar: &'a Grammar,
  constraining: &'a ConstrainingChart,
  /// Triangular cell index -> index of its first slot, or `CLOSED`.
  first_slot: Vec<usize>,
  slots: Vec<Slot>,
  inside: Vec<f64>,
  outside: Vec<f64>,
  log_z: f64,
}

impl<'a> ConstrainedInsideOutside<'a> {
  pub fn new(grammar: &'a Grammar, constraining: &'a ConstrainingChart) -> Result<Self> {
    let vocabulary = grammar.vocabulary();
    let size = constraining.size();
    let start_base = vocabulary.base_index(grammar.start_symbol());
    if constraining.label(0, size, 0) != Some(start_base) {
      return Err(Error::tree(format!(
        "backbone root is not the start symbol {}",
        grammar.start_symbol_name()
      )));
    }

    let mut first_slot = vec![CLOSED; size * (size + 1) / 2];
    let mut slots = Vec::new();
    let mut len = 0;
    for &(start, end) in constraining.open_cells() {
      first_slot[triangular(size, start, end)] = slots.len();
      for depth in 0..constraining.unary_chain_length(start, end) {
        let base = constraining.label(start, end, depth).unwrap_or(start_base);
        let splits = vocabulary.split_count(base);
        slots.push(Slot {
          base,
          first: vocabulary.first_split(base),
          splits,
          offset: len,
        });
        len += splits;
      }
    }
    trace!(slots = slots.len(), scores = len, "constrained layout");
    Ok(Self {
      grammar,
      constraining,
      first_slot,
      slots,
      inside: vec![f64::NEG_INFINITY; len],
      outside: vec![f64::NEG_INFINITY; len],
      log_z: f64::NEG_INFINITY,
    })
  }

  fn slot(&self, start: usize, end: usize, depth: usize) -> Option<Slot> {
    if start >= end || end > self.constraining.size() {
      return None;
    }
    let first = self.first_slot[triangular(self.constraining.size(), start, end)];
    if first == CLOSED || depth >= self.constraining.unary_chain_length(start, end) {
      return None;
    }
    Some(self.slots[first + depth])
  }

  /// Runs the inside and outside passes. Returns the log probability of the
  /// backbone tree summed over all of its split labelings.
  pub fn parse(&mut self) -> Result<f64> {
    self.inside.fill(f64::NEG_INFINITY);
    self.outside.fill(f64::NEG_INFINITY);
    self.fill_inside();
    let size = self.constraining.size();
    self.log_z = self
      .slot(0, size, 0)
      .map(|s| self.inside[s.offset + (self.grammar.start_symbol() - s.first) as usize])
      .unwrap_or(f64::NEG_INFINITY);
    if !self.log_z.is_finite() {
      return Err(Error::NoParse { length: size });
    }
    self.fill_outside();
    debug!(size, log_z = self.log_z, "constrained inside-outside");
    Ok(self.log_z)
  }

  pub fn sentence_log_prob(&self) -> f64 {
    self.log_z
  }

  /// Inside log score of split non-terminal `nt` at `depth` of the span's chain.
  pub fn inside(&self, start: usize, end: usize, depth: usize, nt: NtId) -> f64 {
    self.score(&self.inside, start, end, depth, nt)
  }

  pub fn outside(&self, start: usize, end: usize, depth: usize, nt: NtId) -> f64 {
    self.score(&self.outside, start, end, depth, nt)
  }

  fn score(&self, scores: &[f64], start: usize, end: usize, depth: usize, nt: NtId) -> f64 {
    match self.slot(start, end, depth) {
      Some(s) if nt >= s.first && ((nt - s.first) as usize) < s.splits => scores[s.offset + (nt - s.first) as usize],
      _ => f64::NEG_INFINITY,
    }
  }

  fn fill_inside(&mut self) {
    let constraining = self.constraining;
    let grammar = self.grammar;
    for &(start, end) in constraining.open_cells() {
      let chain = constraining.unary_chain_length(start, end);
      let Some(bottom) = self.slot(start, end, chain - 1) else {
        continue;
      };

      if end - start == 1 {
        if let Some(word) = constraining.words()[start] {
          for r in grammar.lexical_rules(word) {
            if r.parent >= bottom.first && ((r.parent - bottom.first) as usize) < bottom.splits {
              self.inside[bottom.offset + (r.parent - bottom.first) as usize] = r.log_prob as f64;
            }
          }
        }
      } else if let Some(mid) = constraining.midpoint(start, end) {
        let (Some(left), Some(right)) = (self.slot(start, mid, 0), self.slot(mid, end, 0)) else {
          continue;
        };
        let last = bottom.first + bottom.splits as NtId - 1;
        let mut found = false;
        for l in 0..left.splits {
          let left_inside = self.inside[left.offset + l];
          if left_inside == f64::NEG_INFINITY {
            continue;
          }
          for r in 0..right.splits {
            let right_inside = self.inside[right.offset + r];
            if right_inside == f64::NEG_INFINITY {
              continue;
            }
            let Some(key) = grammar.intersect(left.first + l as NtId, right.first + r as NtId) else {
              continue;
            };
            let column = grammar.column(key);
            for k in column.parent_range(bottom.first, last) {
              found = true;
              let i = bottom.offset + (column.parents[k] - bottom.first) as usize;
              let score = column.log_probs[k] as f64 + left_inside + right_inside;
              self.inside[i] = log_sum_f64(self.inside[i], score);
            }
          }
        }
        debug_assert!(
          found,
          "no {} parent for cell {}..{}",
          &grammar.vocabulary().base_symbols()[bottom.base as usize],
          start,
          end
        );
      }

      for depth in (0..chain - 1).rev() {
        let (Some(parent), Some(child)) = (self.slot(start, end, depth), self.slot(start, end, depth + 1)) else {
          continue;
        };
        for p in 0..parent.splits {
          let mut total = f64::NEG_INFINITY;
          for r in grammar.unary_children(parent.first + p as NtId) {
            if r.child >= child.first && ((r.child - child.first) as usize) < child.splits {
              let c = self.inside[child.offset + (r.child - child.first) as usize];
              total = log_sum_f64(total, r.log_prob as f64 + c);
            }
          }
          self.inside[parent.offset + p] = total;
        }
      }
    }
  }

  fn fill_outside(&mut self) {
    let constraining = self.constraining;
    let grammar = self.grammar;
    let size = constraining.size();
    if let Some(top) = self.slot(0, size, 0) {
      self.outside[top.offset + (grammar.start_symbol() - top.first) as usize] = 0.0;
    }

    for &(start, end) in constraining.open_cells().iter().rev() {
      let chain = constraining.unary_chain_length(start, end);
      for depth in 0..chain - 1 {
        let (Some(parent), Some(child)) = (self.slot(start, end, depth), self.slot(start, end, depth + 1)) else {
          continue;
        };
        for p in 0..parent.splits {
          let outside = self.outside[parent.offset + p];
          if outside == f64::NEG_INFINITY {
            continue;
          }
          for r in grammar.unary_children(parent.first + p as NtId) {
            if r.child >= child.first && ((r.child - child.first) as usize) < child.splits {
              let i = child.offset + (r.child - child.first) as usize;
              self.outside[i] = log_sum_f64(self.outside[i], outside + r.log_prob as f64);
            }
          }
        }
      }

      let Some(mid) = constraining.midpoint(start, end) else {
        continue;
      };
      let (Some(bottom), Some(left), Some(right)) = (
        self.slot(start, end, chain - 1),
        self.slot(start, mid, 0),
        self.slot(mid, end, 0),
      ) else {
        continue;
      };
      let last = bottom.first + bottom.splits as NtId - 1;
      for l in 0..left.splits {
        let left_inside = self.inside[left.offset + l];
        for r in 0..right.splits {
          let right_inside = self.inside[right.offset + r];
          let Some(key) = grammar.intersect(left.first + l as NtId, right.first + r as NtId) else {
            continue;
          };
          let column = grammar.column(key);
          for k in column.parent_range(bottom.first, last) {
            let outside = self.outside[bottom.offset + (column.parents[k] - bottom.first) as usize];
            if outside == f64::NEG_INFINITY {
              continue;
            }
            let w = column.log_probs[k] as f64;
            let li = left.offset + l;
            let ri = right.offset + r;
            self.outside[li] = log_sum_f64(self.outside[li], outside + w + right_inside);
            self.outside[ri] = log_sum_f64(self.outside[ri], outside + w + left_inside);
          }
        }
      }
    }
  }

  /// Adds the expected count of every rule over the backbone to `counts`.
  pub fn count_rules(&self, counts: &mut FractionalCounts) {
    let constraining = self.constraining;
    let grammar = self.grammar;
    let log_z = self.log_z;
    if !log_z.is_finite() {
      return;
    }

    for &(start, end) in constraining.open_cells() {
      let chain = constraining.unary_chain_length(start, end);
      for depth in 0..chain - 1 {
        let (Some(parent), Some(child)) = (self.slot(start, end, depth), self.slot(start, end, depth + 1)) else {
          continue;
        };
        for p in 0..parent.splits {
          let outside = self.outside[parent.offset + p];
          if outside == f64::NEG_INFINITY {
            continue;
          }
          let pnt = parent.first + p as NtId;
          for r in grammar.unary_children(pnt) {
            if r.child >= child.first && ((r.child - child.first) as usize) < child.splits {
              let inside = self.inside[child.offset + (r.child - child.first) as usize];
              counts.add_unary(pnt, r.child, outside + r.log_prob as f64 + inside - log_z);
            }
          }
        }
      }

      let Some(bottom) = self.slot(start, end, chain - 1) else {
        continue;
      };
      if end - start == 1 {
        let Some(word) = constraining.words()[start] else {
          continue;
        };
        for p in 0..bottom.splits {
          let pnt = bottom.first + p as NtId;
          let w = grammar.lexical_log_prob(pnt, word);
          if w > f32::NEG_INFINITY {
            counts.add_lexical(pnt, word, self.outside[bottom.offset + p] + w as f64 - log_z);
          }
        }
        continue;
      }

      let Some(mid) = constraining.midpoint(start, end) else {
        continue;
      };
      let (Some(left), Some(right)) = (self.slot(start, mid, 0), self.slot(mid, end, 0)) else {
        continue;
      };
      let last = bottom.first + bottom.splits as NtId - 1;
      for l in 0..left.splits {
        for r in 0..right.splits {
          let (lnt, rnt) = (left.first + l as NtId, right.first + r as NtId);
          let Some(key) = grammar.intersect(lnt, rnt) else {
            continue;
          };
          let children = self.inside[left.offset + l] + self.inside[right.offset + r];
          let column = grammar.column(key);
          for k in column.parent_range(bottom.first, last) {
            let pnt = column.parents[k];
            let outside = self.outside[bottom.offset + (pnt - bottom.first) as usize];
            counts.add_binary(pnt, lnt, rnt, outside + column.log_probs[k] as f64 + children - log_z);
          }
        }
      }
    }
  }

  /// Estimated log-likelihood change from merging each split pair back
  /// together, summed over every node of the backbone. Indexed by base label,
  /// then by `split_index >> 1`. Negative values are likelihood losses.
  pub fn merge_costs(&self, log_split_fractions: &[f32]) -> Vec<Vec<f32>> {
    let vocabulary = self.grammar.vocabulary();
    let mut costs: Vec<Vec<f32>> = (0..vocabulary.num_base() as NtId)
      .map(|b| vec![0.0; vocabulary.split_count(b).div_ceil(2)])
      .collect();

    for slot in &self.slots {
      for k in (0..slot.splits.saturating_sub(1)).step_by(2) {
        let (x0, x1) = (slot.first + k as NtId, slot.first + k as NtId + 1);
        let (in0, in1) = (self.inside[slot.offset + k], self.inside[slot.offset + k + 1]);
        let (out0, out1) = (self.outside[slot.offset + k], self.outside[slot.offset + k + 1]);
        let separate = log_sum_f64(in0 + out0, in1 + out1);
        if separate == f64::NEG_INFINITY {
          continue;
        }
        let frac = |nt: NtId| log_split_fractions.get(nt as usize).copied().unwrap_or(0.0) as f64;
        let merged = log_sum_f64(frac(x0) + in0, frac(x1) + in1) + log_sum_f64(out0, out1);
        let pair = (vocabulary.split_index(x0) >> 1) as usize;
        if let Some(cost) = costs[slot.base as usize].get_mut(pair) {
          *cost += (merged - separate) as f32;
        }
      }
    }
    costs
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::counts::split_grammar;
  use crate::syntree::parse_bracketed;
  use crate::utils::approx_eq;

  const GRAMMAR: &str = r#"
format=Berkeley start=ROOT
ROOT -> S 0
S -> NP VP 0
NP -> DT NN -0.2231436
NP -> NN -1.6094379
VP -> VB NP -0.6931472
VP -> VB -0.6931472
===== LEXICON =====
DT -> the 0
NN -> dog -0.6931472
NN -> cat -0.6931472
VB -> saw 0
"#;

  const TREE: &str = "(ROOT (S (NP (DT the) (NN dog)) (VP (VB saw) (NP (NN cat)))))";

  #[test]
  fn test_unary_chain_of_covering_cell() {
    let g: Grammar = "format=Berkeley start=TOP\nTOP -> A 0\n===== LEXICON =====\nA -> c 0\n"
      .parse()
      .unwrap();
    let tree = parse_bracketed("(TOP (A c))").unwrap();
    let chart = ConstrainingChart::from_tree(&tree, &g).unwrap();
    assert_eq!(chart.unary_chain_length(0, 1), 2);
    assert_eq!(chart.open_cells(), &[(0, 1)]);
    assert_eq!(chart.midpoint(0, 1), None);
    assert_eq!(chart.extract_tree(g.vocabulary()).to_string(), "(TOP (A c))");
  }

  #[test]
  fn test_constraining_chart_structure() {
    let g: Grammar = GRAMMAR.parse().unwrap();
    let tree = parse_bracketed(TREE).unwrap();
    let chart = ConstrainingChart::from_tree(&tree, &g).unwrap();
    let base = |s: &str| g.vocabulary().base_symbols().index(s).unwrap() as NtId;

    assert_eq!(chart.size(), 4);
    assert_eq!(
      chart.open_cells(),
      &[(0, 1), (1, 2), (2, 3), (3, 4), (0, 2), (2, 4), (0, 4)]
    );
    assert_eq!(chart.unary_chain_length(0, 4), 2);
    assert_eq!(chart.unary_chain_length(3, 4), 2);
    assert_eq!(chart.unary_chain_length(1, 3), 0);
    assert_eq!(chart.midpoint(0, 4), Some(2));
    assert_eq!(chart.label(0, 4, 1), Some(base("S")));
    assert_eq!(chart.label(3, 4, 1), Some(base("NN")));
    assert_eq!(chart.inside(2, 4, base("VP")), 0.0);
    assert_eq!(chart.inside(2, 4, base("NP")), f32::NEG_INFINITY);
    assert_eq!(chart.extract_tree(g.vocabulary()), tree);

    let mask = chart.cell_constraints().unwrap();
    assert!(mask.is_open(2, 4));
    assert!(!mask.is_open(1, 3));
  }

  #[test]
  fn test_bad_backbones() {
    let g: Grammar = GRAMMAR.parse().unwrap();
    let unknown = parse_bracketed("(ROOT (XP the))").unwrap();
    assert!(matches!(
      ConstrainingChart::from_tree(&unknown, &g),
      Err(Error::UnknownLabel { .. })
    ));
    let flat = parse_bracketed("(ROOT (S (DT the) (NN dog) (VB saw)))").unwrap();
    assert!(ConstrainingChart::from_tree(&flat, &g).is_err());

    let rootless = parse_bracketed("(S (NP (NN dog)) (VP (VB saw)))").unwrap();
    let chart = ConstrainingChart::from_tree(&rootless, &g).unwrap();
    assert!(ConstrainedInsideOutside::new(&g, &chart).is_err());
  }

  #[test]
  fn test_unsplit_inside_is_tree_probability() {
    let g: Grammar = GRAMMAR.parse().unwrap();
    let tree = parse_bracketed(TREE).unwrap();
    let chart = ConstrainingChart::from_tree(&tree, &g).unwrap();
    let mut io = ConstrainedInsideOutside::new(&g, &chart).unwrap();
    let log_z = io.parse().unwrap();
    let expected = 0.8f64.ln() + 0.5f64.ln() + 0.5f64.ln() + 0.2f64.ln() + 0.5f64.ln();
    assert!(approx_eq(log_z, expected, 1e-5));

    // every node of the backbone has posterior one
    let mut counts = FractionalCounts::for_grammar(&g);
    io.count_rules(&mut counts);
    let id = |s: &str| g.non_terminal(s).unwrap();
    assert!(approx_eq(counts.binary_count(id("S"), id("NP"), id("VP")).exp(), 1.0, 1e-6));
    assert!(approx_eq(counts.unary_count(id("NP"), id("NN")).exp(), 1.0, 1e-6));
    assert!(approx_eq(counts.parent_count(id("NP")).exp(), 2.0, 1e-6));
  }

  #[test]
  fn test_split_grammar_counts_are_conserved() {
    let g: Grammar = GRAMMAR.parse().unwrap();
    let split = split_grammar(&g).unwrap();
    let tree = parse_bracketed(TREE).unwrap();
    let chart = ConstrainingChart::from_tree(&tree, &split).unwrap();
    let mut io = ConstrainedInsideOutside::new(&split, &chart).unwrap();
    let log_z = io.parse().unwrap();
    assert!(log_z.is_finite());

    let mut counts = FractionalCounts::for_grammar(&split);
    io.count_rules(&mut counts);
    let v = split.vocabulary();
    let base = |s: &str| v.base_symbols().index(s).unwrap() as NtId;
    let total = |b: NtId| -> f64 { v.splits(b).map(|nt| counts.parent_count(nt).exp()).sum() };
    assert!(approx_eq(total(base("ROOT")), 1.0, 1e-6));
    assert!(approx_eq(total(base("NP")), 2.0, 1e-6));
    assert!(approx_eq(total(base("NN")), 2.0, 1e-6));
    assert!(approx_eq(total(base("VB")), 1.0, 1e-6));

    // outside times inside at any backbone node sums to the tree probability
    let mut node = f64::NEG_INFINITY;
    for nt in v.splits(base("VP")) {
      node = log_sum_f64(node, io.inside(2, 4, 0, nt) + io.outside(2, 4, 0, nt));
    }
    assert!(approx_eq(node, log_z, 1e-9));
  }

  #[test]
  fn test_merge_costs() {
    let g: Grammar = GRAMMAR.parse().unwrap();
    let split = split_grammar(&g).unwrap();
    let tree = parse_bracketed(TREE).unwrap();
    let chart = ConstrainingChart::from_tree(&tree, &split).unwrap();
    let mut io = ConstrainedInsideOutside::new(&split, &chart).unwrap();
    io.parse().unwrap();

    let mut counts = FractionalCounts::for_grammar(&split);
    io.count_rules(&mut counts);
    let fractions = counts.log_split_fractions(&split);
    let costs = io.merge_costs(&fractions);
    let v = split.vocabulary();
    assert_eq!(costs.len(), v.num_base());
    let np = v.base_symbols().index("NP").unwrap();
    assert_eq!(costs[np].len(), 1);
    // the root is never split
    let root = v.base_index(split.start_symbol()) as usize;
    assert_eq!(costs[root], vec![0.0]);
    // nearly symmetric splits lose almost nothing when merged
    for cost in costs.iter().flatten() {
      assert!(cost.is_finite());
      assert!(cost.abs() < 0.05, "merge cost {}", cost);
    }
  }
}
