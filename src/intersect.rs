//! Bottom-up inside pass: grammar intersection cell by cell.
//!
//! Each cell is seeded from the lexicon (width 1) or by combining every pair
//! of child entries over every midpoint, then closed under one level of unary
//! rules, optionally pruned to a beam, and finalized into the chart.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use ordered_float::OrderedFloat;
use tracing::trace;

use crate::cells::bottom_up;
use crate::chart::{Chart, InsidePolicy, TemporaryCell, NO_MIDPOINT};
use crate::config::{CellPolicy, Intersection, ParserConfig};
use crate::domain::Domain;
use crate::grammar::Grammar;
use crate::packing::{PackedChildren, PackedKey};
use crate::parser::ParseStats;
use crate::rules::{NtId, WordId};

/// Best (and summed) child product per packed column key, for one cell.
#[derive(Debug, Clone)]
struct CartesianProductVector<D: Domain> {
  sum: Vec<D::Value>,
  best: Vec<D::Value>,
  midpoints: Vec<u16>,
  touched: Vec<PackedKey>,
}

impl<D: Domain> CartesianProductVector<D> {
  fn new(size: usize) -> Self {
    Self {
      sum: vec![D::ZERO; size],
      best: vec![D::ZERO; size],
      midpoints: vec![NO_MIDPOINT; size],
      touched: Vec::new(),
    }
  }

  #[inline]
  fn add(&mut self, key: PackedKey, value: D::Value, midpoint: u16) {
    let k = key as usize;
    if D::is_zero(self.best[k]) {
      self.touched.push(key);
    }
    self.sum[k] = D::plus(self.sum[k], value);
    if value > self.best[k] {
      self.best[k] = value;
      self.midpoints[k] = midpoint;
    }
  }

  fn clear(&mut self) {
    for &key in &self.touched {
      let k = key as usize;
      self.sum[k] = D::ZERO;
      self.best[k] = D::ZERO;
      self.midpoints[k] = NO_MIDPOINT;
    }
    self.touched.clear();
  }
}

/// Cell-local agenda entry for beam pruning.
#[derive(Debug, Clone, Copy)]
struct Candidate<V> {
  fom: OrderedFloat<f64>,
  nt: NtId,
  value: V,
  packed: PackedChildren,
  midpoint: u16,
  unary: bool,
}

impl<V> PartialEq for Candidate<V> {
  fn eq(&self, other: &Self) -> bool {
    self.fom == other.fom && self.nt == other.nt
  }
}

impl<V> Eq for Candidate<V> {}

impl<V> PartialOrd for Candidate<V> {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl<V> Ord for Candidate<V> {
  fn cmp(&self, other: &Self) -> Ordering {
    // lower ids first on ties, for determinism
    self
      .fom
      .cmp(&other.fom)
      .then_with(|| other.nt.cmp(&self.nt))
  }
}

/// Scratch buffers for the inside pass, reused across sentences.
#[derive(Debug, Clone)]
pub struct InsidePass<D: Domain> {
  tmp: TemporaryCell<D>,
  beam_cell: TemporaryCell<D>,
  cpv: CartesianProductVector<D>,
  children: Vec<NtId>,
}

impl<D: Domain> InsidePass<D> {
  pub fn new(grammar: &Grammar) -> Self {
    let nts = grammar.num_non_terminals();
    Self {
      tmp: TemporaryCell::new(nts, InsidePolicy::Viterbi),
      beam_cell: TemporaryCell::new(nts, InsidePolicy::Viterbi),
      cpv: CartesianProductVector::new(grammar.packing_size()),
      children: Vec::new(),
    }
  }

  /// Fills every (open) cell of an already reset chart.
  pub fn fill(
    &mut self,
    chart: &mut Chart<D>,
    grammar: &Grammar,
    words: &[Option<WordId>],
    config: &ParserConfig,
    policy: InsidePolicy,
    stats: &mut ParseStats,
  ) {
    self.tmp.set_policy(policy);
    self.beam_cell.set_policy(policy);

    for (start, end) in bottom_up(words.len()) {
      if let CellPolicy::Constrained(constraints) = &config.cell_policy {
        if !constraints.is_open(start, end) {
          stats.cells_skipped += 1;
          continue;
        }
      }
      stats.cells_visited += 1;

      let base_step = if end - start == 1 {
        if let Some(word) = words[start] {
          self.seed_lexical(word, grammar);
        }
        0
      } else {
        let base_step = chart.min_child_step(start, end);
        match config.intersection {
          Intersection::CartesianProduct => self.cartesian_product(chart, grammar, start, end, base_step),
          Intersection::Spmv => self.spmv(chart, grammar, start, end, base_step),
        }
        base_step
      };

      let kept = if config.cell_policy == CellPolicy::Beam {
        let width = config.beam_width_for(end - start);
        self.select_beam(grammar, width, config.beam_delta);
        chart.finalize_cell(start, end, &mut self.beam_cell, base_step, width)
      } else {
        unary_closure(&mut self.tmp, &mut self.children, grammar);
        chart.finalize_cell(start, end, &mut self.tmp, base_step, usize::MAX)
      };
      trace!(start, end, kept, "finalized cell");
    }
  }

  fn seed_lexical(&mut self, word: WordId, grammar: &Grammar) {
    for r in grammar.lexical_rules(word) {
      self.tmp.update_inside(
        r.parent,
        PackedChildren::lexical(word),
        NO_MIDPOINT,
        D::weight(r.log_prob, r.prob),
      );
    }
  }

  /// Probes the grammar column of every (left, right) entry pair.
  fn cartesian_product(&mut self, chart: &Chart<D>, grammar: &Grammar, start: usize, end: usize, base_step: i32) {
    for mid in start + 1..end {
      let left_cell = chart.cell_index(start, mid);
      let right_cell = chart.cell_index(mid, end);
      if chart.num_entries[left_cell] == 0 || chart.num_entries[right_cell] == 0 {
        continue;
      }
      let shift = base_step - (chart.inside_steps[left_cell] + chart.inside_steps[right_cell]);

      for (left, li) in chart.cell_entries(left_cell) {
        if !grammar.is_valid_left_child(left) {
          continue;
        }
        let left_inside = chart.inside[li];
        for (right, ri) in chart.cell_entries(right_cell) {
          if !grammar.is_valid_right_child(right) {
            continue;
          }
          let Some(key) = grammar.intersect(left, right) else {
            continue;
          };
          let children = D::scale(D::times(left_inside, chart.inside[ri]), shift);
          let packed = PackedChildren::binary(key);
          let column = grammar.column(key);
          for k in 0..column.len() {
            let w = D::weight(column.log_probs[k], column.probs[k]);
            self
              .tmp
              .update_inside(column.parents[k], packed, mid as u16, D::times(children, w));
          }
        }
      }
    }
  }

  /// Builds the cartesian-product vector over all midpoints, then multiplies
  /// it by each parent's row of the grammar.
  fn spmv(&mut self, chart: &Chart<D>, grammar: &Grammar, start: usize, end: usize, base_step: i32) {
    self.cpv.clear();
    for mid in start + 1..end {
      let left_cell = chart.cell_index(start, mid);
      let right_cell = chart.cell_index(mid, end);
      if chart.num_entries[left_cell] == 0 || chart.num_entries[right_cell] == 0 {
        continue;
      }
      let shift = base_step - (chart.inside_steps[left_cell] + chart.inside_steps[right_cell]);

      for (left, li) in chart.cell_entries(left_cell) {
        if !grammar.is_valid_left_child(left) {
          continue;
        }
        for (right, ri) in chart.cell_entries(right_cell) {
          if !grammar.is_valid_right_child(right) {
            continue;
          }
          if let Some(key) = grammar.intersect(left, right) {
            let children = D::scale(D::times(chart.inside[li], chart.inside[ri]), shift);
            self.cpv.add(key, children, mid as u16);
          }
        }
      }
    }
    if self.cpv.touched.is_empty() {
      return;
    }

    let sum = self.tmp.policy() == InsidePolicy::Sum;
    for parent in 0..grammar.num_non_terminals() as NtId {
      let row = grammar.row(parent);
      for (&key, rule) in row.keys.iter().zip(row.rules) {
        let k = key as usize;
        if D::is_zero(self.cpv.best[k]) {
          continue;
        }
        let w = D::weight(rule.log_prob, rule.prob);
        let children = if sum { self.cpv.sum[k] } else { self.cpv.best[k] };
        self.tmp.update_inside(
          parent,
          PackedChildren::binary(key),
          self.cpv.midpoints[k],
          D::times(children, w),
        );
      }
    }
  }

  /// Chooses the cell's entries best first from the candidates in the working
  /// cell. Accepted non-unary entries push their unary parents, so unary and
  /// binary derivations compete for the same `width` slots.
  fn select_beam(&mut self, grammar: &Grammar, width: usize, delta: f64) {
    let mut agenda = BinaryHeap::with_capacity(self.tmp.populated().len());
    for &nt in self.tmp.populated() {
      let value = self.tmp.inside[nt as usize];
      agenda.push(Candidate {
        fom: OrderedFloat(D::to_log(value, 0)),
        nt,
        value,
        packed: self.tmp.packed[nt as usize],
        midpoint: self.tmp.midpoints[nt as usize],
        unary: false,
      });
    }
    self.tmp.clear();

    let out = &mut self.beam_cell;
    let mut accepted = 0;
    let mut best = None;
    while let Some(c) = agenda.pop() {
      let top = *best.get_or_insert(c.fom.0);
      if c.fom.0 < top - delta {
        break;
      }
      let present = out.contains(c.nt);
      if !present && accepted >= width {
        continue;
      }
      if c.unary {
        out.update_inside(c.nt, c.packed, NO_MIDPOINT, c.value);
      } else {
        out.add_pre_unary(c.nt, c.packed, c.midpoint, c.value);
        for r in grammar.unary_rules_with_child(c.nt) {
          let value = D::times(c.value, D::weight(r.log_prob, r.prob));
          agenda.push(Candidate {
            fom: OrderedFloat(D::to_log(value, 0)),
            nt: r.parent,
            value,
            packed: PackedChildren::unary(c.nt),
            midpoint: NO_MIDPOINT,
            unary: true,
          });
        }
      }
      if !present && out.contains(c.nt) {
        accepted += 1;
      }
    }
  }
}

/// Applies unary rules once, reading each child's pre-unary score.
fn unary_closure<D: Domain>(tmp: &mut TemporaryCell<D>, children: &mut Vec<NtId>, grammar: &Grammar) {
  tmp.snapshot_pre_unary();
  children.clear();
  children.extend_from_slice(tmp.populated());
  for &child in children.iter() {
    let pre = tmp.inside_pre[child as usize];
    if D::is_zero(pre) {
      continue;
    }
    for r in grammar.unary_rules_with_child(child) {
      tmp.update_inside(
        r.parent,
        PackedChildren::unary(child),
        NO_MIDPOINT,
        D::times(pre, D::weight(r.log_prob, r.prob)),
      );
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::chart::Density;
  use crate::domain::{LogDomain, RealDomain};

  const GRAMMAR: &str = r#"
format=Berkeley start=ROOT
ROOT -> S 0
S -> NP VP -0.1053605
S -> VP -2.3025851
NP -> DT NN -0.5108256
NP -> NP PP -1.6094379
NP -> NN -1.2039728
VP -> VB NP -0.5108256
VP -> VP PP -1.2039728
VP -> VB -1.6094379
PP -> IN NP 0
===== LEXICON =====
DT -> the 0
NN -> dog -1.2039728
NN -> park -1.2039728
NN -> walks -0.9162907
VB -> walks -0.6931472
VB -> park -0.6931472
IN -> in 0
"#;

  fn fill<D: Domain>(
    grammar: &Grammar,
    sentence: &str,
    config: &ParserConfig,
    policy: InsidePolicy,
  ) -> Chart<D> {
    let tokens: Vec<&str> = sentence.split_whitespace().collect();
    let words = grammar.map_tokens(&tokens);
    let mut chart = Chart::new(tokens.len(), grammar.num_non_terminals(), Density::Sparse, usize::MAX);
    let mut pass = InsidePass::new(grammar);
    let mut stats = ParseStats::default();
    pass.fill(&mut chart, grammar, &words, config, policy, &mut stats);
    chart
  }

  #[test]
  fn test_lexical_and_unary() {
    let g: Grammar = GRAMMAR.parse().unwrap();
    let chart: Chart<LogDomain> = fill(&g, "walks", &ParserConfig::default(), InsidePolicy::Viterbi);
    let id = |s: &str| g.non_terminal(s).unwrap();
    assert!((chart.inside(0, 1, id("VB")) - 0.5f32.ln()).abs() < 1e-5);
    // VP -> VB, one level above the lexical entry
    assert!((chart.inside(0, 1, id("VP")) - (0.5f32 * 0.2).ln()).abs() < 1e-5);
    assert_eq!(chart.packed_children(0, 1, id("VP")), Some(PackedChildren::unary(id("VB"))));
    // S -> VP would need a second unary level
    assert_eq!(chart.inside(0, 1, id("S")), f32::NEG_INFINITY);
    assert_eq!(chart.inside(0, 1, id("DT")), f32::NEG_INFINITY);
  }

  #[test]
  fn test_absent_entries_have_zero_inside() {
    let g: Grammar = GRAMMAR.parse().unwrap();
    let chart: Chart<LogDomain> = fill(&g, "the dog walks in the park", &ParserConfig::default(), InsidePolicy::Viterbi);
    let id = |s: &str| g.non_terminal(s).unwrap();
    for (start, end) in bottom_up(6) {
      let present: Vec<NtId> = chart.entries(start, end).map(|(nt, _)| nt).collect();
      for nt in 0..g.num_non_terminals() as NtId {
        let inside = chart.inside(start, end, nt);
        assert_eq!(present.contains(&nt), inside > f32::NEG_INFINITY, "{} {} {}", start, end, g.label(nt));
      }
    }
    assert!(chart.contains(0, 2, id("NP")));
    assert!(chart.contains(3, 6, id("PP")));
    assert!(!chart.contains(0, 2, id("S")));
    assert!(!chart.contains(1, 3, id("NP")));
  }

  #[test]
  fn test_spmv_matches_cartesian_product() {
    let g: Grammar = GRAMMAR.parse().unwrap();
    let sentence = "the dog walks in the park";
    let cartesian: Chart<LogDomain> = fill(&g, sentence, &ParserConfig::default(), InsidePolicy::Viterbi);
    let config = ParserConfig::default().with_intersection(Intersection::Spmv);
    let spmv: Chart<LogDomain> = fill(&g, sentence, &config, InsidePolicy::Viterbi);
    for (start, end) in bottom_up(6) {
      for nt in 0..g.num_non_terminals() as NtId {
        let (a, b) = (cartesian.inside(start, end, nt), spmv.inside(start, end, nt));
        assert!(a == b || (a - b).abs() < 1e-5, "{}..{} {}: {} vs {}", start, end, g.label(nt), a, b);
      }
    }
    assert!(cartesian.inside(0, 6, g.start_symbol()) > f32::NEG_INFINITY);
  }

  #[test]
  fn test_sum_policy_agrees_across_domains_and_strategies() {
    let g: Grammar = GRAMMAR.parse().unwrap();
    let sentence = "the dog walks in the park";
    let log: Chart<LogDomain> = fill(&g, sentence, &ParserConfig::default(), InsidePolicy::Sum);
    let real: Chart<RealDomain> = fill(&g, sentence, &ParserConfig::default(), InsidePolicy::Sum);
    let config = ParserConfig::default().with_intersection(Intersection::Spmv);
    let spmv: Chart<RealDomain> = fill(&g, sentence, &config, InsidePolicy::Sum);
    let a = log.inside_log_prob(0, 6, 0);
    let b = real.inside_log_prob(0, 6, 0);
    let c = spmv.inside_log_prob(0, 6, 0);
    assert!(a.is_finite());
    assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
    assert!((b - c).abs() < 1e-9, "{} vs {}", b, c);
    // summing can only add probability mass to the best derivation
    let viterbi: Chart<LogDomain> = fill(&g, sentence, &ParserConfig::default(), InsidePolicy::Viterbi);
    assert!(viterbi.inside_log_prob(0, 6, 0) <= a + 1e-6);
  }

  #[test]
  fn test_wide_beam_is_exhaustive() {
    let g: Grammar = GRAMMAR.parse().unwrap();
    let sentence = "the dog walks in the park";
    let exhaustive: Chart<LogDomain> = fill(&g, sentence, &ParserConfig::default(), InsidePolicy::Viterbi);
    let config = ParserConfig::default()
      .with_cell_policy(CellPolicy::Beam)
      .with_beam_width(g.num_non_terminals());
    let beam: Chart<LogDomain> = fill(&g, sentence, &config, InsidePolicy::Viterbi);
    for (start, end) in bottom_up(6) {
      for nt in 0..g.num_non_terminals() as NtId {
        assert_eq!(exhaustive.inside(start, end, nt), beam.inside(start, end, nt));
      }
    }
  }

  #[test]
  fn test_narrow_beam_prunes() {
    let g: Grammar = GRAMMAR.parse().unwrap();
    let config = ParserConfig::default()
      .with_cell_policy(CellPolicy::Beam)
      .with_beam_width(1);
    let chart: Chart<LogDomain> = fill(&g, "walks park", &config, InsidePolicy::Viterbi);
    for (start, end) in bottom_up(2) {
      assert!(chart.cell_len(start, end) <= 1);
    }
    // unary parents only ever point at entries that survived the beam
    for (start, end) in bottom_up(2) {
      for (nt, _) in chart.entries(start, end) {
        if let Some(child) = chart.packed_children(start, end, nt).and_then(|p| p.unary_child()) {
          assert!(chart.contains(start, end, child));
        }
      }
    }
  }

  #[test]
  fn test_closed_cells_stay_empty() {
    let g: Grammar = GRAMMAR.parse().unwrap();
    let constraints = crate::cells::CellConstraints::from_open_cells(3, &[(0, 3)]).unwrap();
    let config = ParserConfig::default().with_cell_constraints(constraints);
    let chart: Chart<LogDomain> = fill(&g, "the dog walks", &config, InsidePolicy::Viterbi);
    assert_eq!(chart.cell_len(0, 2), 0);
    assert_eq!(chart.cell_len(1, 3), 0);
    assert!(chart.cell_len(0, 1) > 0);
    assert_eq!(chart.cell_len(0, 3), 0, "no binary split reaches the top cell");
  }
}
