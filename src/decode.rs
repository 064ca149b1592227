//! Reading a tree back out of a filled chart.

use std::collections::HashMap;

use crate::cells::bottom_up;
use crate::chart::Chart;
use crate::domain::Domain;
use crate::error::{Error, Result};
use crate::grammar::Grammar;
use crate::outside::{posterior, sentence_log_prob};
use crate::packing::Backpointer;
use crate::rules::NtId;
use crate::syntree::SynTree;
use crate::utils::log_sum_f64;

pub type Tree = SynTree<String, String>;

/// Posteriors closer than this are treated as tied.
const TIE: f64 = 1e-9;

fn check_tokens<D: Domain, S: AsRef<str>>(chart: &Chart<D>, tokens: &[S]) -> Result<usize> {
  let size = chart.size();
  if tokens.len() != size {
    return Err(Error::IllegalSpan {
      start: 0,
      end: tokens.len(),
      size,
    });
  }
  if size == 0 {
    return Err(Error::NoParse { length: 0 });
  }
  Ok(size)
}

fn leaf<S: AsRef<str>>(tokens: &[S], position: usize) -> Tree {
  SynTree::leaf(tokens[position].as_ref().to_string(), position)
}

/// Best derivation, following the chart's backpointers from the start symbol.
pub fn viterbi<D: Domain, S: AsRef<str>>(chart: &Chart<D>, grammar: &Grammar, tokens: &[S]) -> Result<Tree> {
  let size = check_tokens(chart, tokens)?;
  let goal = grammar.start_symbol();
  if !chart.contains(0, size, goal) {
    return Err(Error::NoParse { length: size });
  }
  let name = |nt: NtId| grammar.label(nt).to_string();
  follow_backpointers(chart, grammar, tokens, (0, size), goal, false, &name)
}

/// Follows stored backpointers below `nt`. Below a unary rule the child's
/// best derivation that does not itself end in a unary rule is used.
fn follow_backpointers<D: Domain, S: AsRef<str>>(
  chart: &Chart<D>,
  grammar: &Grammar,
  tokens: &[S],
  (start, end): (usize, usize),
  nt: NtId,
  pre_unary: bool,
  name: &dyn Fn(NtId) -> String,
) -> Result<Tree> {
  let no_parse = || Error::NoParse { length: chart.size() };
  let i = chart.entry_index(start, end, nt).ok_or_else(no_parse)?;
  let (packed, midpoint) = if pre_unary {
    (chart.packed_pre[i], chart.midpoints_pre[i])
  } else {
    (chart.packed[i], chart.midpoints[i])
  };
  let children = match packed.unpack(grammar.packing()) {
    Some(Backpointer::Lexical { .. }) => vec![leaf(tokens, start)],
    Some(Backpointer::Unary { child }) => {
      vec![follow_backpointers(chart, grammar, tokens, (start, end), child, true, name)?]
    }
    Some(Backpointer::Binary { left, right }) => {
      let mid = midpoint as usize;
      if mid <= start || mid >= end {
        return Err(no_parse());
      }
      vec![
        follow_backpointers(chart, grammar, tokens, (start, mid), left, false, name)?,
        follow_backpointers(chart, grammar, tokens, (mid, end), right, false, name)?,
      ]
    }
    None => return Err(no_parse()),
  };
  Ok(SynTree::branch(name(nt), (start, end), children))
}

#[derive(Debug, Clone, Copy, Default)]
struct MaxcCell {
  score: f64,
  /// Chosen label with its penalized posterior, and the entry representing it.
  label: Option<(NtId, f64, NtId)>,
  unary_child: Option<NtId>,
  midpoint: usize,
}

/// Goodman's max-constituent parse: the tree maximizing the expected number
/// of correct labeled constituents, less `lambda` per constituent wider than
/// one word. With `sum_splits`, posteriors are summed over the splits of each
/// base label and the tree is labeled with base names.
///
/// The chart must hold summed inside scores and outside scores.
pub fn maxc<D: Domain, S: AsRef<str>>(
  chart: &Chart<D>,
  grammar: &Grammar,
  tokens: &[S],
  lambda: f64,
  sum_splits: bool,
) -> Result<Tree> {
  let size = check_tokens(chart, tokens)?;
  let log_z = sentence_log_prob(chart, grammar).ok_or(Error::NoParse { length: size })?;
  let vocabulary = grammar.vocabulary();
  let label_of = |nt: NtId| if sum_splits { vocabulary.base_index(nt) } else { nt };
  let goal = label_of(grammar.start_symbol());
  let num_labels = if sum_splits {
    vocabulary.num_base()
  } else {
    grammar.num_non_terminals()
  };

  let mut cells = vec![MaxcCell::default(); chart.num_cells()];
  let mut g = vec![0.0f64; num_labels];
  let mut representative: Vec<(f64, NtId)> = vec![(f64::NEG_INFINITY, 0); num_labels];
  let mut labels: Vec<NtId> = Vec::new();

  for (start, end) in bottom_up(size) {
    let cell = chart.cell_index(start, end);
    for (nt, i) in chart.cell_entries(cell) {
      let label = label_of(nt);
      let p = posterior(chart, cell, i, log_z);
      if representative[label as usize].0 == f64::NEG_INFINITY {
        labels.push(label);
      }
      g[label as usize] += p;
      if p > representative[label as usize].0 {
        representative[label as usize] = (p, nt);
      }
    }

    let score_of = |label: NtId| {
      let entry = representative[label as usize].1;
      let mut score = if grammar.is_factored(entry) { 0.0 } else { g[label as usize] };
      if end - start > 1 {
        score -= lambda;
      }
      score
    };
    // the label of the unary child below a label's best entry, if any
    let child_of = |label: NtId| {
      let entry = representative[label as usize].1;
      chart
        .packed_children(start, end, entry)
        .and_then(|p| p.unary_child())
        .map(label_of)
    };

    let mut best: Option<(NtId, f64)> = None;
    if start == 0 && end == size {
      if labels.contains(&goal) {
        best = Some((goal, score_of(goal)));
      }
    } else {
      for &label in &labels {
        let score = score_of(label);
        best = match best {
          Some((_, s)) if score > s + TIE => Some((label, score)),
          Some((b, s)) if score >= s - TIE && child_of(label) == Some(b) => Some((label, score)),
          None => Some((label, score)),
          keep => keep,
        };
      }
    }

    let mut entry = MaxcCell::default();
    if let Some((label, score)) = best {
      entry.label = Some((label, score, representative[label as usize].1));
      entry.score = score;
      if end - start > 1 {
        if let Some(child) = child_of(label) {
          if labels.contains(&child) && (score_of(child) - score).abs() <= TIE {
            entry.unary_child = Some(child);
          }
        }
      }
    }
    if end - start > 1 {
      let mut best_split = f64::NEG_INFINITY;
      for mid in start + 1..end {
        let split = cells[chart.cell_index(start, mid)].score + cells[chart.cell_index(mid, end)].score;
        if split > best_split {
          best_split = split;
          entry.midpoint = mid;
        }
      }
      entry.score += best_split;
    }
    cells[cell] = entry;

    for &label in &labels {
      g[label as usize] = 0.0;
      representative[label as usize] = (f64::NEG_INFINITY, 0);
    }
    labels.clear();
  }

  if cells[chart.cell_index(0, size)].label.is_none() {
    return Err(Error::NoParse { length: size });
  }
  let label_name = |label: NtId| {
    if sum_splits {
      vocabulary.base_symbols()[label as usize].to_string()
    } else {
      grammar.label(label).to_string()
    }
  };
  let entry_name = |nt: NtId| label_name(label_of(nt));
  let decoder = MaxcExtractor {
    chart,
    grammar,
    tokens,
    cells: &cells,
    goal,
    label_name: &label_name,
    entry_name: &entry_name,
  };
  let mut roots = decoder.extract(0, size)?;
  match roots.len() {
    1 => Ok(roots.remove(0)),
    _ => Err(Error::NoParse { length: size }),
  }
}

struct MaxcExtractor<'a, D: Domain, S> {
  chart: &'a Chart<D>,
  grammar: &'a Grammar,
  tokens: &'a [S],
  cells: &'a [MaxcCell],
  goal: NtId,
  label_name: &'a dyn Fn(NtId) -> String,
  entry_name: &'a dyn Fn(NtId) -> String,
}

impl<D: Domain, S: AsRef<str>> MaxcExtractor<'_, D, S> {
  /// Nodes covering the span: one node, or the children of a spliced-out
  /// constituent.
  fn extract(&self, start: usize, end: usize) -> Result<Vec<Tree>> {
    let cell = self.cells[self.chart.cell_index(start, end)];
    if end - start == 1 {
      let (_, _, entry) = cell.label.ok_or(Error::NoParse {
        length: self.chart.size(),
      })?;
      let tree = follow_backpointers(
        self.chart,
        self.grammar,
        self.tokens,
        (start, end),
        entry,
        false,
        self.entry_name,
      )?;
      return Ok(vec![tree]);
    }

    let mut children = self.extract(start, cell.midpoint)?;
    children.extend(self.extract(cell.midpoint, end)?);
    match cell.label {
      Some((label, score, _)) if score > 0.0 || label == self.goal => {
        let span = (start, end);
        let children = match cell.unary_child {
          Some(child) => vec![SynTree::branch((self.label_name)(child), span, children)],
          None => children,
        };
        let node = SynTree::branch((self.label_name)(label), span, children);
        Ok(vec![node])
      }
      _ => Ok(children),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Derivation {
  Lexical,
  Unary(NtId),
  Binary { left: NtId, right: NtId, midpoint: usize },
}

#[derive(Debug, Clone, Copy)]
struct RuleScore {
  score: f64,
  derivation: Derivation,
}

#[derive(Debug, Clone, Default)]
struct RuleCell {
  pre: HashMap<NtId, RuleScore>,
  post: HashMap<NtId, RuleScore>,
}

fn improve(scores: &mut HashMap<NtId, RuleScore>, base: NtId, score: f64, derivation: Derivation) {
  match scores.get(&base) {
    Some(old) if old.score >= score => {}
    _ => {
      scores.insert(base, RuleScore { score, derivation });
    }
  }
}

/// Petrov and Klein's max-rule-product parse over base labels: the tree
/// maximizing the product of its anchored rule posteriors, each summed over
/// the splits of the rule's labels.
///
/// The chart must hold summed inside scores and outside scores.
pub fn max_rule_product<D: Domain, S: AsRef<str>>(chart: &Chart<D>, grammar: &Grammar, tokens: &[S]) -> Result<Tree> {
  let size = check_tokens(chart, tokens)?;
  let log_z = sentence_log_prob(chart, grammar).ok_or(Error::NoParse { length: size })?;
  let vocabulary = grammar.vocabulary();
  let base = |nt: NtId| vocabulary.base_index(nt);
  let mut cells: Vec<RuleCell> = vec![RuleCell::default(); chart.num_cells()];
  let mut binary: HashMap<(NtId, NtId, NtId), f64> = HashMap::new();
  let mut unary: HashMap<(NtId, NtId), f64> = HashMap::new();

  for (start, end) in bottom_up(size) {
    let cell = chart.cell_index(start, end);
    let in_step = chart.inside_steps[cell];
    let out_step = chart.outside_steps[cell];
    let mut scores = RuleCell::default();

    if end - start == 1 {
      if let Some(word) = grammar.map_token(tokens[start].as_ref()) {
        let mut sums: HashMap<NtId, f64> = HashMap::new();
        for (nt, i) in chart.cell_entries(cell) {
          let w = grammar.lexical_log_prob(nt, word);
          let outside = D::to_log(chart.outside_pre[i], out_step);
          if w == f32::NEG_INFINITY || outside == f64::NEG_INFINITY {
            continue;
          }
          let sum = sums.entry(base(nt)).or_insert(f64::NEG_INFINITY);
          *sum = log_sum_f64(*sum, outside + w as f64 - log_z);
        }
        for (b, score) in sums {
          improve(&mut scores.pre, b, score, Derivation::Lexical);
        }
      }
    } else {
      for mid in start + 1..end {
        let left_cell = chart.cell_index(start, mid);
        let right_cell = chart.cell_index(mid, end);
        if cells[left_cell].post.is_empty() || cells[right_cell].post.is_empty() {
          continue;
        }
        let left_step = chart.inside_steps[left_cell];
        let right_step = chart.inside_steps[right_cell];
        binary.clear();
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
            let sum = binary
              .entry((base(r.parent), base(left), base(r.right)))
              .or_insert(f64::NEG_INFINITY);
            *sum = log_sum_f64(*sum, outside + r.log_prob as f64 + left_inside + right_inside - log_z);
          }
        }
        for (&(p, l, r), &rule) in &binary {
          let (Some(left), Some(right)) = (cells[left_cell].post.get(&l), cells[right_cell].post.get(&r)) else {
            continue;
          };
          let derivation = Derivation::Binary {
            left: l,
            right: r,
            midpoint: mid,
          };
          improve(&mut scores.pre, p, rule + left.score + right.score, derivation);
        }
      }
    }

    // unary rules extend the binary and lexical choices only
    scores.post = scores.pre.clone();
    unary.clear();
    for (child, ci) in chart.cell_entries(cell) {
      let inside = D::to_log(chart.inside_pre[ci], in_step);
      if inside == f64::NEG_INFINITY {
        continue;
      }
      for r in grammar.unary_rules_with_child(child) {
        if base(r.parent) == base(child) {
          continue;
        }
        let Some(pi) = chart.entry_index_in_cell(cell, r.parent) else {
          continue;
        };
        let outside = D::to_log(chart.outside[pi], out_step);
        if outside == f64::NEG_INFINITY {
          continue;
        }
        let sum = unary
          .entry((base(r.parent), base(child)))
          .or_insert(f64::NEG_INFINITY);
        *sum = log_sum_f64(*sum, outside + r.log_prob as f64 + inside - log_z);
      }
    }
    for (&(p, c), &rule) in &unary {
      if let Some(child) = scores.pre.get(&c) {
        let score = rule + child.score;
        if scores.post.get(&p).is_none_or(|old| score > old.score) {
          scores.post.insert(
            p,
            RuleScore {
              score,
              derivation: Derivation::Unary(c),
            },
          );
        }
      }
    }
    cells[cell] = scores;
  }

  let goal = base(grammar.start_symbol());
  if !cells[chart.cell_index(0, size)].post.contains_key(&goal) {
    return Err(Error::NoParse { length: size });
  }
  extract_max_rule(chart, grammar, tokens, &cells, (0, size), goal, false)
}

fn extract_max_rule<D: Domain, S: AsRef<str>>(
  chart: &Chart<D>,
  grammar: &Grammar,
  tokens: &[S],
  cells: &[RuleCell],
  (start, end): (usize, usize),
  label: NtId,
  pre_unary: bool,
) -> Result<Tree> {
  let cell = &cells[chart.cell_index(start, end)];
  let scores = if pre_unary { &cell.pre } else { &cell.post };
  let entry = scores.get(&label).ok_or(Error::NoParse { length: chart.size() })?;
  let children = match entry.derivation {
    Derivation::Lexical => vec![leaf(tokens, start)],
    Derivation::Unary(child) => vec![extract_max_rule(chart, grammar, tokens, cells, (start, end), child, true)?],
    Derivation::Binary { left, right, midpoint } => vec![
      extract_max_rule(chart, grammar, tokens, cells, (start, midpoint), left, false)?,
      extract_max_rule(chart, grammar, tokens, cells, (midpoint, end), right, false)?,
    ],
  };
  let name = grammar.vocabulary().base_symbols()[label as usize].to_string();
  Ok(SynTree::branch(name, (start, end), children))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::chart::{Density, InsidePolicy};
  use crate::config::ParserConfig;
  use crate::counts::split_grammar;
  use crate::domain::{LogDomain, RealDomain};
  use crate::intersect::InsidePass;
  use crate::outside::OutsidePass;
  use crate::parser::ParseStats;

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

  const TOKENS: [&str; 5] = ["the", "dog", "saw", "the", "cat"];
  const EXPECTED: &str = "(ROOT (S (NP (DT the) (NN dog)) (VP (VB saw) (NP (DT the) (NN cat)))))";

  fn filled<D: Domain>(grammar: &Grammar, tokens: &[&str], policy: InsidePolicy) -> Chart<D> {
    let words = grammar.map_tokens(tokens);
    let mut chart = Chart::new(tokens.len(), grammar.num_non_terminals(), Density::Sparse, usize::MAX);
    let mut stats = ParseStats::default();
    InsidePass::new(grammar).fill(&mut chart, grammar, &words, &ParserConfig::default(), policy, &mut stats);
    if policy == InsidePolicy::Sum {
      OutsidePass::new(grammar).fill(&mut chart, grammar);
    }
    chart
  }

  #[test]
  fn test_viterbi_tree() {
    let g: Grammar = GRAMMAR.parse().unwrap();
    let chart = filled::<LogDomain>(&g, &TOKENS, InsidePolicy::Viterbi);
    assert_eq!(viterbi(&chart, &g, &TOKENS).unwrap().to_bracketed(), EXPECTED);

    let chart = filled::<LogDomain>(&g, &["saw", "the"], InsidePolicy::Viterbi);
    assert!(matches!(viterbi(&chart, &g, &["saw", "the"]), Err(Error::NoParse { length: 2 })));
    assert!(viterbi(&chart, &g, &["saw"]).is_err());
  }

  #[test]
  fn test_unary_chain_over_one_word() {
    let g: Grammar = "format=Berkeley start=TOP\nTOP -> A 0\n===== LEXICON =====\nA -> c 0\n"
      .parse()
      .unwrap();
    let viterbi_chart = filled::<RealDomain>(&g, &["c"], InsidePolicy::Viterbi);
    assert_eq!(viterbi(&viterbi_chart, &g, &["c"]).unwrap().to_bracketed(), "(TOP (A c))");
    let summed = filled::<RealDomain>(&g, &["c"], InsidePolicy::Sum);
    assert_eq!(maxc(&summed, &g, &["c"], 0.0, false).unwrap().to_bracketed(), "(TOP (A c))");
    assert_eq!(max_rule_product(&summed, &g, &["c"]).unwrap().to_bracketed(), "(TOP (A c))");
  }

  #[test]
  fn test_decoders_agree_on_unambiguous_sentence() {
    let g: Grammar = GRAMMAR.parse().unwrap();
    let chart = filled::<LogDomain>(&g, &TOKENS, InsidePolicy::Sum);
    assert_eq!(viterbi(&chart, &g, &TOKENS).unwrap().to_bracketed(), EXPECTED);
    assert_eq!(maxc(&chart, &g, &TOKENS, 0.0, false).unwrap().to_bracketed(), EXPECTED);
    assert_eq!(maxc(&chart, &g, &TOKENS, 0.0, true).unwrap().to_bracketed(), EXPECTED);
    assert_eq!(max_rule_product(&chart, &g, &TOKENS).unwrap().to_bracketed(), EXPECTED);
  }

  #[test]
  fn test_split_grammar_decodes_to_base_labels() {
    let g: Grammar = GRAMMAR.parse().unwrap();
    let split = split_grammar(&g).unwrap();
    let chart = filled::<RealDomain>(&split, &TOKENS, InsidePolicy::Sum);
    assert_eq!(max_rule_product(&chart, &split, &TOKENS).unwrap().to_bracketed(), EXPECTED);
    assert_eq!(maxc(&chart, &split, &TOKENS, 0.0, true).unwrap().to_bracketed(), EXPECTED);
    // plain maxc keeps the split labels
    let tree = maxc(&chart, &split, &TOKENS, 0.0, false).unwrap().to_bracketed();
    assert!(tree.starts_with("(ROOT (") && tree.contains("(NP_"), "{}", tree);
  }

  #[test]
  fn test_maxc_penalty_splices_constituents() {
    let g: Grammar = GRAMMAR.parse().unwrap();
    let chart = filled::<LogDomain>(&g, &TOKENS, InsidePolicy::Sum);
    let tree = maxc(&chart, &g, &TOKENS, 2.0, false).unwrap();
    assert_eq!(
      tree.to_bracketed(),
      "(ROOT (S (DT the) (NN dog) (VB saw) (DT the) (NN cat)))"
    );
  }

  #[test]
  fn test_summed_decoders_without_parse() {
    let g: Grammar = GRAMMAR.parse().unwrap();
    let tokens = ["the", "the"];
    let chart = filled::<LogDomain>(&g, &tokens, InsidePolicy::Sum);
    assert!(matches!(maxc(&chart, &g, &tokens, 0.0, false), Err(Error::NoParse { .. })));
    assert!(matches!(max_rule_product(&chart, &g, &tokens), Err(Error::NoParse { .. })));
  }
}
