//! Best-first agenda parsing.
//!
//! Edges wait on a global priority queue ordered by figure of merit. Like the
//! exhaustive chart, every (cell, non-terminal) has two slots: the pre-unary
//! slot, claimed by the first lexical or binary edge popped for it, and the
//! post-unary slot, claimed by the first edge of any kind. Later edges for a
//! taken slot are dropped. Unary parents grow from pre-unary claims and binary
//! parents from post-unary claims, so unary closure stays one level deep.
//! Parsing stops as soon as the start symbol spans the sentence.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use ordered_float::OrderedFloat;
use tracing::{debug, trace};

use crate::chart::{Chart, Density, NO_MIDPOINT};
use crate::config::Fom;
use crate::domain::LogDomain;
use crate::grammar::Grammar;
use crate::packing::PackedChildren;
use crate::parser::ParseStats;
use crate::rules::{NtId, WordId};

#[derive(Debug, Clone, Copy)]
struct Edge {
  fom: OrderedFloat<f32>,
  start: usize,
  end: usize,
  nt: NtId,
  inside: f32,
  packed: PackedChildren,
  midpoint: u16,
}

impl PartialEq for Edge {
  fn eq(&self, other: &Self) -> bool {
    self.cmp(other) == Ordering::Equal
  }
}

impl Eq for Edge {}

impl PartialOrd for Edge {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for Edge {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .fom
      .cmp(&other.fom)
      .then_with(|| other.start.cmp(&self.start))
      .then_with(|| other.end.cmp(&self.end))
      .then_with(|| other.nt.cmp(&self.nt))
      // a derivation that does not end in a unary rule first, so it can claim both slots
      .then_with(|| other.packed.is_unary().cmp(&self.packed.is_unary()))
  }
}

fn figure_of_merit(fom: Fom, inside: f32, span: usize) -> f32 {
  match fom {
    Fom::Inside => inside,
    Fom::NormalizedInside => inside / span as f32,
  }
}

#[derive(Debug, Default)]
pub struct AgendaParser {
  agenda: BinaryHeap<Edge>,
  fom: Fom,
}

impl AgendaParser {
  pub fn new() -> Self {
    Self::default()
  }

  /// Fills a dense log-domain chart best first. Returns true if the start
  /// symbol reached the top cell.
  pub fn fill(
    &mut self,
    chart: &mut Chart<LogDomain>,
    grammar: &Grammar,
    words: &[Option<WordId>],
    fom: Fom,
    stats: &mut ParseStats,
  ) -> bool {
    debug_assert_eq!(chart.density(), Density::Dense);
    self.agenda.clear();
    self.fom = fom;
    let size = words.len();
    let goal = grammar.start_symbol();

    for (i, word) in words.iter().enumerate() {
      let Some(word) = *word else {
        continue;
      };
      for r in grammar.lexical_rules(word) {
        let e = self.edge(i, i + 1, r.parent, r.log_prob, PackedChildren::lexical(word), NO_MIDPOINT);
        self.push(e, stats);
      }
    }

    while size > 0 && !chart.contains(0, size, goal) {
      let Some(edge) = self.agenda.pop() else {
        debug!(size, "agenda exhausted without a complete parse");
        break;
      };
      stats.agenda_pops += 1;
      let (start, end, nt, inside) = (edge.start, edge.end, edge.nt, edge.inside);

      let pre = !edge.packed.is_unary()
        && chart.insert_pre_unary(start, end, nt, inside, edge.packed, edge.midpoint);
      let post = chart.insert(start, end, nt, inside, edge.packed, edge.midpoint);
      if pre || post {
        trace!(start, end, nt, inside, pre, post, "agenda pop");
      }
      if pre {
        self.push_unary_parents(chart, grammar, start, end, nt, inside, stats);
      }
      if post {
        self.push_binary_parents(chart, grammar, start, end, nt, inside, stats);
      }
    }
    stats.cells_visited = chart.num_cells();
    size > 0 && chart.contains(0, size, goal)
  }

  fn edge(&self, start: usize, end: usize, nt: NtId, inside: f32, packed: PackedChildren, midpoint: u16) -> Edge {
    Edge {
      fom: OrderedFloat(figure_of_merit(self.fom, inside, end - start)),
      start,
      end,
      nt,
      inside,
      packed,
      midpoint,
    }
  }

  fn push(&mut self, edge: Edge, stats: &mut ParseStats) {
    stats.agenda_pushes += 1;
    self.agenda.push(edge);
  }

  /// Unary parents in the same cell of a fresh pre-unary entry.
  #[allow(clippy::too_many_arguments)]
  fn push_unary_parents(
    &mut self,
    chart: &Chart<LogDomain>,
    grammar: &Grammar,
    start: usize,
    end: usize,
    nt: NtId,
    inside: f32,
    stats: &mut ParseStats,
  ) {
    for r in grammar.unary_rules_with_child(nt) {
      if !chart.contains(start, end, r.parent) {
        let e = self.edge(start, end, r.parent, inside + r.log_prob, PackedChildren::unary(nt), NO_MIDPOINT);
        self.push(e, stats);
      }
    }
  }

  /// Binary parents of a fresh post-unary entry with already-claimed
  /// siblings on either side.
  #[allow(clippy::too_many_arguments)]
  fn push_binary_parents(
    &mut self,
    chart: &Chart<LogDomain>,
    grammar: &Grammar,
    start: usize,
    end: usize,
    nt: NtId,
    inside: f32,
    stats: &mut ParseStats,
  ) {
    let size = chart.size();

    if grammar.is_valid_right_child(nt) {
      for begin in 0..start {
        for r in grammar.rules_with_right_child(nt) {
          let left_inside = chart.inside(begin, start, r.left);
          if left_inside == f32::NEG_INFINITY || chart.contains_pre_unary(begin, end, r.parent) {
            continue;
          }
          if let Some(key) = grammar.intersect(r.left, nt) {
            let e = self.edge(
              begin,
              end,
              r.parent,
              r.log_prob + left_inside + inside,
              PackedChildren::binary(key),
              start as u16,
            );
            self.push(e, stats);
          }
        }
      }
    }

    if grammar.is_valid_left_child(nt) {
      for finish in end + 1..=size {
        for r in grammar.rules_with_left_child(nt) {
          let right_inside = chart.inside(end, finish, r.right);
          if right_inside == f32::NEG_INFINITY || chart.contains_pre_unary(start, finish, r.parent) {
            continue;
          }
          if let Some(key) = grammar.intersect(nt, r.right) {
            let e = self.edge(
              start,
              finish,
              r.parent,
              r.log_prob + inside + right_inside,
              PackedChildren::binary(key),
              end as u16,
            );
            self.push(e, stats);
          }
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::chart::InsidePolicy;
  use crate::config::ParserConfig;
  use crate::intersect::InsidePass;

  const GRAMMAR: &str = r#"
format=Berkeley start=S
S -> NP VP 0
NP -> NP PP -1.3862944
NP -> DT NN -0.2876821
VP -> VB NP -0.6931472
VP -> VP PP -0.6931472
PP -> IN NP 0
===== LEXICON =====
DT -> the 0
NN -> man -1.0986123
NN -> telescope -1.0986123
NN -> hill -1.0986123
VB -> saw 0
IN -> with -0.6931472
IN -> on -0.6931472
"#;

  #[test]
  fn test_agenda_finds_viterbi_score() {
    let g: Grammar = GRAMMAR.parse().unwrap();
    let tokens = ["the", "man", "saw", "the", "man", "with", "the", "telescope"];
    let words = g.map_tokens(&tokens);

    let mut exhaustive: Chart<LogDomain> = Chart::new(tokens.len(), g.num_non_terminals(), Density::Sparse, usize::MAX);
    let mut stats = ParseStats::default();
    InsidePass::new(&g).fill(
      &mut exhaustive,
      &g,
      &words,
      &ParserConfig::default(),
      InsidePolicy::Viterbi,
      &mut stats,
    );

    let mut chart: Chart<LogDomain> = Chart::new(tokens.len(), g.num_non_terminals(), Density::Dense, 0);
    let mut stats = ParseStats::default();
    assert!(AgendaParser::new().fill(&mut chart, &g, &words, Fom::Inside, &mut stats));
    let best = exhaustive.inside(0, tokens.len(), 0);
    assert!((chart.inside(0, tokens.len(), 0) - best).abs() < 1e-5);
    assert!(stats.agenda_pops <= stats.agenda_pushes);
    assert!(stats.agenda_pops > 0);
  }

  /// Viterbi tree and score from the exhaustive chart and from the agenda.
  fn exhaustive_and_agenda(grammar: &str, tokens: &[&str]) -> ((String, f32), (String, f32)) {
    let g: Grammar = grammar.parse().unwrap();
    let words = g.map_tokens(tokens);
    let n = tokens.len();

    let mut exhaustive = Chart::new(n, g.num_non_terminals(), Density::Sparse, usize::MAX);
    let mut stats = ParseStats::default();
    InsidePass::new(&g).fill(
      &mut exhaustive,
      &g,
      &words,
      &ParserConfig::default(),
      InsidePolicy::Viterbi,
      &mut stats,
    );
    let mut chart = Chart::new(n, g.num_non_terminals(), Density::Dense, 0);
    assert!(AgendaParser::new().fill(&mut chart, &g, &words, Fom::Inside, &mut stats));

    let best = |c: &Chart<LogDomain>| {
      let tree = crate::decode::viterbi(c, &g, tokens).unwrap().to_bracketed();
      (tree, c.inside(0, n, g.start_symbol()))
    };
    (best(&exhaustive), best(&chart))
  }

  #[test]
  fn test_agenda_keeps_binary_under_unary_claim() {
    // X is first claimed through Y, but Z must still see X's own binary derivation
    let grammar = r#"
format=Berkeley start=Z
Z -> X 0
X -> A B -5
Y -> A B 0
X -> Y 0
===== LEXICON =====
A -> a 0
B -> b 0
"#;
    let (exhaustive, agenda) = exhaustive_and_agenda(grammar, &["a", "b"]);
    assert_eq!(exhaustive, ("(Z (X (A a) (B b)))".to_string(), -5.0));
    assert_eq!(agenda, exhaustive);
  }

  #[test]
  fn test_agenda_prefers_unary_over_lexical() {
    let grammar = r#"
format=Berkeley start=S
S -> P P 0
P -> Q 0
===== LEXICON =====
P -> w -5
Q -> w 0
"#;
    let (exhaustive, agenda) = exhaustive_and_agenda(grammar, &["w", "w"]);
    assert_eq!(exhaustive, ("(S (P (Q w)) (P (Q w)))".to_string(), 0.0));
    assert_eq!(agenda, exhaustive);
  }

  #[test]
  fn test_agenda_without_parse() {
    let g: Grammar = GRAMMAR.parse().unwrap();
    let words = g.map_tokens(&["the", "saw"]);
    let mut chart = Chart::new(2, g.num_non_terminals(), Density::Dense, 0);
    let mut stats = ParseStats::default();
    assert!(!AgendaParser::new().fill(&mut chart, &g, &words, Fom::NormalizedInside, &mut stats));
    assert!(!chart.contains(0, 2, 0));
  }
}
