//! Outside pass over a summed chart, node posteriors, and expected rule counts.

use tracing::trace;

use crate::cells::top_down;
use crate::chart::Chart;
use crate::counts::FractionalCounts;
use crate::domain::Domain;
use crate::error::{Error, Result};
use crate::grammar::Grammar;
use crate::rules::{NtId, WordId};

/// A (parent cell, sibling cell) pair through which outside mass reaches a
/// cell. `left` is true when the cell is the parent's left child.
#[derive(Debug, Clone, Copy)]
struct ParentPair {
  parent: usize,
  sibling: usize,
  left: bool,
}

/// Scratch buffers for the outside pass, reused across sentences.
#[derive(Debug, Clone)]
pub struct OutsidePass<D: Domain> {
  post: Vec<D::Value>,
  pairs: Vec<ParentPair>,
  entries: Vec<(NtId, usize)>,
}

impl<D: Domain> OutsidePass<D> {
  pub fn new(grammar: &Grammar) -> Self {
    Self {
      post: vec![D::ZERO; grammar.num_non_terminals()],
      pairs: Vec::new(),
      entries: Vec::new(),
    }
  }

  /// Computes outside scores for every entry of a chart filled with summed
  /// inside scores. The start symbol over the whole sentence gets outside one.
  pub fn fill(&mut self, chart: &mut Chart<D>, grammar: &Grammar) {
    chart.clear_outside();
    let size = chart.size();
    let goal = grammar.start_symbol();

    for (start, end) in top_down(size) {
      let cell = chart.cell_index(start, end);
      if chart.num_entries[cell] == 0 {
        continue;
      }

      self.pairs.clear();
      for parent_start in 0..start {
        let parent = chart.cell_index(parent_start, end);
        let sibling = chart.cell_index(parent_start, start);
        if chart.num_entries[parent] > 0 && chart.num_entries[sibling] > 0 {
          self.pairs.push(ParentPair { parent, sibling, left: false });
        }
      }
      for parent_end in end + 1..=size {
        let parent = chart.cell_index(start, parent_end);
        let sibling = chart.cell_index(end, parent_end);
        if chart.num_entries[parent] > 0 && chart.num_entries[sibling] > 0 {
          self.pairs.push(ParentPair { parent, sibling, left: true });
        }
      }
      let base_step = self
        .pairs
        .iter()
        .map(|p| chart.outside_steps[p.parent] + chart.inside_steps[p.sibling])
        .min()
        .unwrap_or(0);

      self.entries.clear();
      self.entries.extend(chart.cell_entries(cell));

      for &(nt, _) in &self.entries {
        let mut total = if start == 0 && end == size && nt == goal {
          D::ONE
        } else {
          D::ZERO
        };
        for pair in &self.pairs {
          let mut sum = D::ZERO;
          let rules = if pair.left {
            grammar.rules_with_left_child(nt)
          } else {
            grammar.rules_with_right_child(nt)
          };
          for r in rules {
            let sibling_nt = if pair.left { r.right } else { r.left };
            let (Some(pi), Some(si)) = (
              chart.entry_index_in_cell(pair.parent, r.parent),
              chart.entry_index_in_cell(pair.sibling, sibling_nt),
            ) else {
              continue;
            };
            let outside = chart.outside_pre[pi];
            if D::is_zero(outside) {
              continue;
            }
            let w = D::weight(r.log_prob, r.prob);
            sum = D::plus(sum, D::times(D::times(outside, w), chart.inside[si]));
          }
          let step = chart.outside_steps[pair.parent] + chart.inside_steps[pair.sibling];
          total = D::plus(total, D::scale(sum, base_step - step));
        }
        self.post[nt as usize] = total;
      }

      // outside of the pre-unary entry also collects from unary parents in the cell
      let mut max = D::ZERO;
      for k in 0..self.entries.len() {
        let (nt, i) = self.entries[k];
        let post = self.post[nt as usize];
        let mut pre = post;
        for r in grammar.unary_rules_with_child(nt) {
          let parent = self.post[r.parent as usize];
          if chart.entry_index_in_cell(cell, r.parent).is_some() && !D::is_zero(parent) {
            pre = D::plus(pre, D::times(parent, D::weight(r.log_prob, r.prob)));
          }
        }
        chart.outside[i] = post;
        chart.outside_pre[i] = pre;
        if pre > max {
          max = pre;
        }
      }

      let delta = D::scaling_delta(max);
      if delta != 0 {
        chart.note_rescale(start, end, delta, "outside");
        for &(_, i) in &self.entries {
          chart.outside[i] = D::scale(chart.outside[i], delta);
          chart.outside_pre[i] = D::scale(chart.outside_pre[i], delta);
        }
      }
      chart.outside_steps[cell] = base_step + delta;

      for &(nt, _) in &self.entries {
        self.post[nt as usize] = D::ZERO;
      }
      trace!(start, end, entries = self.entries.len(), "outside cell");
    }
  }
}

/// Log probability of the sentence: the summed inside score of the start
/// symbol over the whole chart.
pub fn sentence_log_prob<D: Domain>(chart: &Chart<D>, grammar: &Grammar) -> Option<f64> {
  let size = chart.size();
  if size == 0 {
    return None;
  }
  let z = chart.inside_log_prob(0, size, grammar.start_symbol());
  if z.is_finite() {
    Some(z)
  } else {
    None
  }
}

/// Posterior probability that the entry at array index `i` of `cell` labels
/// its span, counting it once whether it heads a unary chain or not.
pub(crate) fn posterior<D: Domain>(chart: &Chart<D>, cell: usize, i: usize, log_z: f64) -> f64 {
  let in_step = chart.inside_steps[cell];
  let out_step = chart.outside_steps[cell];
  let in_pre = D::to_log(chart.inside_pre[i], in_step);
  let in_post = D::to_log(chart.inside[i], in_step);
  let out_pre = D::to_log(chart.outside_pre[i], out_step);
  let out_post = D::to_log(chart.outside[i], out_step);
  let p = (in_pre + out_pre - log_z).exp() + (in_post + out_post - log_z).exp()
    - (in_pre + out_post - log_z).exp();
  p.max(0.0)
}

/// Expected number of occurrences of every non-terminal in a parse of the
/// sentence, summed over all spans.
pub fn expected_occurrences<D: Domain>(chart: &Chart<D>, grammar: &Grammar) -> Vec<f64> {
  let mut occurrences = vec![0.0; grammar.num_non_terminals()];
  let Some(log_z) = sentence_log_prob(chart, grammar) else {
    return occurrences;
  };
  for cell in 0..chart.num_cells() {
    for (nt, i) in chart.cell_entries(cell) {
      occurrences[nt as usize] += posterior(chart, cell, i, log_z);
    }
  }
  occurrences
}

/// Adds the expected count of every rule used in some parse of the sentence,
/// in log space, to `counts`. The chart must hold summed inside and outside
/// scores.
pub fn expected_counts<D: Domain>(
  chart: &Chart<D>,
  grammar: &Grammar,
  words: &[Option<WordId>],
  counts: &mut FractionalCounts,
) -> Result<()> {
  let size = chart.size();
  let log_z = sentence_log_prob(chart, grammar).ok_or(Error::NoParse { length: size })?;

  for (start, end) in top_down(size) {
    let cell = chart.cell_index(start, end);
    if chart.num_entries[cell] == 0 {
      continue;
    }
    let in_step = chart.inside_steps[cell];
    let out_step = chart.outside_steps[cell];

    // unary rules: out_post(parent) * w * in_pre(child)
    for (parent, pi) in chart.cell_entries(cell) {
      let outside = D::to_log(chart.outside[pi], out_step);
      if outside == f64::NEG_INFINITY {
        continue;
      }
      for r in grammar.unary_children(parent) {
        if let Some(ci) = chart.entry_index_in_cell(cell, r.child) {
          let inside = D::to_log(chart.inside_pre[ci], in_step);
          counts.add_unary(parent, r.child, outside + r.log_prob as f64 + inside - log_z);
        }
      }
    }

    if end - start == 1 {
      let Some(word) = words.get(start).copied().flatten() else {
        continue;
      };
      for r in grammar.lexical_rules(word) {
        if let Some(pi) = chart.entry_index_in_cell(cell, r.parent) {
          let outside = D::to_log(chart.outside_pre[pi], out_step);
          counts.add_lexical(r.parent, word, outside + r.log_prob as f64 - log_z);
        }
      }
      continue;
    }

    for mid in start + 1..end {
      let left_cell = chart.cell_index(start, mid);
      let right_cell = chart.cell_index(mid, end);
      if chart.num_entries[left_cell] == 0 || chart.num_entries[right_cell] == 0 {
        continue;
      }
      let left_step = chart.inside_steps[left_cell];
      let right_step = chart.inside_steps[right_cell];
      for (left, li) in chart.cell_entries(left_cell) {
        let left_inside = D::to_log(chart.inside[li], left_step);
        for r in grammar.rules_with_left_child(left) {
          let (Some(pi), Some(ri)) = (
            chart.entry_index_in_cell(cell, r.parent),
            chart.entry_index_in_cell(right_cell, r.right),
          ) else {
            continue;
          };
          let outside = D::to_log(chart.outside_pre[pi], out_step);
          if outside == f64::NEG_INFINITY {
            continue;
          }
          let right_inside = D::to_log(chart.inside[ri], right_step);
          counts.add_binary(
            r.parent,
            left,
            r.right,
            outside + r.log_prob as f64 + left_inside + right_inside - log_z,
          );
        }
      }
    }
  }
  Ok(())
}
