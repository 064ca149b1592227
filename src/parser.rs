//! The parser front end: runs the configured inside pass, the outside pass
//! when the decoder needs one, and the decoder, reusing its charts across
//! sentences.

use std::fmt;
use std::thread;

use tracing::{debug, warn};

use crate::agenda::AgendaParser;
use crate::chart::{Chart, Density, InsidePolicy};
use crate::config::{CellPolicy, DecodeMethod, NumericDomain, ParserConfig};
use crate::counts::FractionalCounts;
use crate::decode::{self, Tree};
use crate::domain::{Domain, LogDomain, RealDomain};
use crate::error::{Error, Result};
use crate::grammar::Grammar;
use crate::intersect::InsidePass;
use crate::outside::{self, OutsidePass};
use crate::rules::WordId;

/// Work done while parsing one sentence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
  pub sentence_length: usize,
  pub cells_visited: usize,
  pub cells_skipped: usize,
  pub total_entries: usize,
  pub agenda_pushes: usize,
  pub agenda_pops: usize,
  pub rescaled_cells: usize,
}

impl fmt::Display for ParseStats {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "length={} cells={} skipped={} entries={} pushes={} pops={} rescaled={}",
      self.sentence_length,
      self.cells_visited,
      self.cells_skipped,
      self.total_entries,
      self.agenda_pushes,
      self.agenda_pops,
      self.rescaled_cells
    )
  }
}

#[derive(Debug, Clone)]
pub struct ParseResult {
  pub tree: Tree,
  /// Log probability of the best derivation (Viterbi) or of the sentence
  /// (summing decoders).
  pub log_prob: f64,
  pub stats: ParseStats,
}

/// Chart and scratch buffers for one numeric domain.
#[derive(Debug)]
struct Workspace<D: Domain> {
  chart: Chart<D>,
  inside: InsidePass<D>,
  outside: OutsidePass<D>,
}

impl<D: Domain> Workspace<D> {
  fn new(grammar: &Grammar, config: &ParserConfig, size: usize) -> Self {
    let (density, capacity) = match config.cell_policy {
      CellPolicy::Agenda => (Density::Dense, grammar.num_non_terminals()),
      CellPolicy::Beam => (Density::Sparse, config.beam_width),
      _ => (Density::Sparse, usize::MAX),
    };
    debug!(domain = D::NAME, ?density, "allocating chart");
    Self {
      chart: Chart::new(size, grammar.num_non_terminals(), density, capacity),
      inside: InsidePass::new(grammar),
      outside: OutsidePass::new(grammar),
    }
  }

  /// Resets the chart and fills it; runs the outside pass for summed charts.
  fn fill(
    &mut self,
    grammar: &Grammar,
    config: &ParserConfig,
    words: &[Option<WordId>],
    policy: InsidePolicy,
    stats: &mut ParseStats,
  ) {
    self.chart.reset(words.len());
    self.inside.fill(&mut self.chart, grammar, words, config, policy, stats);
    if policy == InsidePolicy::Sum {
      self.outside.fill(&mut self.chart, grammar);
    }
    stats.total_entries = self.chart.total_entries();
    stats.rescaled_cells = self.chart.rescaled_cells();
  }

  fn decode<S: AsRef<str>>(&self, grammar: &Grammar, config: &ParserConfig, tokens: &[S]) -> Result<(Tree, f64)> {
    let chart = &self.chart;
    let size = tokens.len();
    let tree = match config.decode {
      DecodeMethod::Viterbi => decode::viterbi(chart, grammar, tokens)?,
      DecodeMethod::Maxc => decode::maxc(chart, grammar, tokens, config.maxc_lambda, false)?,
      DecodeMethod::SumMaxc => decode::maxc(chart, grammar, tokens, config.maxc_lambda, true)?,
      DecodeMethod::MaxRuleProduct => decode::max_rule_product(chart, grammar, tokens)?,
    };
    let log_prob = if config.decode.needs_outside() {
      outside::sentence_log_prob(chart, grammar).unwrap_or(f64::NEG_INFINITY)
    } else {
      chart.inside_log_prob(0, size, grammar.start_symbol())
    };
    Ok((tree, log_prob))
  }
}

/// Parses sentences with one grammar and configuration.
///
/// ```
/// use sparsecky::grammar::Grammar;
/// use sparsecky::config::ParserConfig;
/// use sparsecky::parser::ChartParser;
///
/// let grammar: Grammar = "format=Berkeley start=S\nS -> NP VP 0\n===== LEXICON =====\nNP -> a 0\nVP -> b 0\n"
///   .parse()
///   .unwrap();
/// let config = ParserConfig::default();
/// let mut parser = ChartParser::new(&grammar, &config).unwrap();
/// let result = parser.parse(&["a", "b"]).unwrap();
/// assert_eq!(result.tree.to_bracketed(), "(S (NP a) (VP b))");
/// ```
#[derive(Debug)]
pub struct ChartParser<'a> {
  grammar: &'a Grammar,
  config: &'a ParserConfig,
  log: Option<Workspace<LogDomain>>,
  real: Option<Workspace<RealDomain>>,
  agenda: AgendaParser,
}

impl<'a> ChartParser<'a> {
  pub fn new(grammar: &'a Grammar, config: &'a ParserConfig) -> Result<Self> {
    config.validate()?;
    Ok(Self {
      grammar,
      config,
      log: None,
      real: None,
      agenda: AgendaParser::new(),
    })
  }

  pub fn grammar(&self) -> &Grammar {
    self.grammar
  }

  pub fn config(&self) -> &ParserConfig {
    self.config
  }

  /// Parses a whitespace-tokenized sentence.
  pub fn parse_sentence(&mut self, sentence: &str) -> Result<ParseResult> {
    let tokens: Vec<&str> = sentence.split_whitespace().collect();
    self.parse(&tokens)
  }

  pub fn parse<S: AsRef<str>>(&mut self, tokens: &[S]) -> Result<ParseResult> {
    let size = tokens.len();
    if size == 0 {
      return Err(Error::NoParse { length: 0 });
    }
    if let CellPolicy::Constrained(constraints) = &self.config.cell_policy {
      if constraints.size() != size {
        return Err(Error::config(
          "cells",
          format!("constraints cover {} words, sentence has {}", constraints.size(), size),
        ));
      }
    }
    let (grammar, config) = (self.grammar, self.config);
    let words = grammar.map_tokens(tokens);
    let mut stats = ParseStats {
      sentence_length: size,
      ..ParseStats::default()
    };
    debug!(size, unknown = words.iter().filter(|w| w.is_none()).count(), "parsing");

    let (tree, log_prob) = if config.cell_policy == CellPolicy::Agenda {
      // best-first search is only defined over log scores
      let ws = self.log.get_or_insert_with(|| Workspace::new(grammar, config, size));
      ws.chart.reset(size);
      let found = self.agenda.fill(&mut ws.chart, grammar, &words, config.fom, &mut stats);
      stats.total_entries = ws.chart.total_entries();
      if !found {
        return Err(Error::NoParse { length: size });
      }
      ws.decode(grammar, config, tokens)?
    } else {
      let policy = if config.decode.needs_outside() {
        InsidePolicy::Sum
      } else {
        InsidePolicy::Viterbi
      };
      match config.domain {
        NumericDomain::Log => {
          let ws = self.log.get_or_insert_with(|| Workspace::new(grammar, config, size));
          ws.fill(grammar, config, &words, policy, &mut stats);
          ws.decode(grammar, config, tokens)?
        }
        NumericDomain::Real => {
          let ws = self.real.get_or_insert_with(|| Workspace::new(grammar, config, size));
          ws.fill(grammar, config, &words, policy, &mut stats);
          ws.decode(grammar, config, tokens)?
        }
      }
    };

    if stats.rescaled_cells > 0 {
      warn!(size, cells = stats.rescaled_cells, "numeric underflow: rescaled chart cells");
    }
    Ok(ParseResult { tree, log_prob, stats })
  }

  /// Adds the expected rule counts of one sentence to `counts` and returns
  /// the sentence's log probability.
  pub fn expected_counts<S: AsRef<str>>(&mut self, tokens: &[S], counts: &mut FractionalCounts) -> Result<f64> {
    if self.config.cell_policy == CellPolicy::Agenda {
      return Err(Error::config("cells", "expected counts need a summed chart"));
    }
    let (grammar, config) = (self.grammar, self.config);
    let size = tokens.len();
    let words = grammar.map_tokens(tokens);
    let mut stats = ParseStats::default();
    match config.domain {
      NumericDomain::Log => {
        let ws = self.log.get_or_insert_with(|| Workspace::new(grammar, config, size));
        ws.fill(grammar, config, &words, InsidePolicy::Sum, &mut stats);
        outside::expected_counts(&ws.chart, grammar, &words, counts)?;
        outside::sentence_log_prob(&ws.chart, grammar).ok_or(Error::NoParse { length: size })
      }
      NumericDomain::Real => {
        let ws = self.real.get_or_insert_with(|| Workspace::new(grammar, config, size));
        ws.fill(grammar, config, &words, InsidePolicy::Sum, &mut stats);
        outside::expected_counts(&ws.chart, grammar, &words, counts)?;
        outside::sentence_log_prob(&ws.chart, grammar).ok_or(Error::NoParse { length: size })
      }
    }
  }
}

/// Parses whitespace-tokenized sentences on up to `threads` worker threads,
/// each with its own parser. Results are in input order; a sentence that
/// fails to parse does not affect the others.
pub fn parse_batch<S: AsRef<str> + Sync>(
  grammar: &Grammar,
  config: &ParserConfig,
  sentences: &[S],
  threads: usize,
) -> Result<Vec<Result<ParseResult>>> {
  config.validate()?;
  if sentences.is_empty() {
    return Ok(Vec::new());
  }
  let threads = threads.clamp(1, sentences.len());
  let chunk = sentences.len().div_ceil(threads);
  debug!(sentences = sentences.len(), threads, "parsing batch");

  thread::scope(|scope| {
    let workers: Vec<_> = sentences
      .chunks(chunk)
      .map(|batch| {
        scope.spawn(move || -> Result<Vec<Result<ParseResult>>> {
          let mut parser = ChartParser::new(grammar, config)?;
          Ok(batch.iter().map(|s| parser.parse_sentence(s.as_ref())).collect())
        })
      })
      .collect();

    let mut results = Vec::with_capacity(sentences.len());
    for worker in workers {
      match worker.join() {
        Ok(batch) => results.extend(batch?),
        Err(panic) => std::panic::resume_unwind(panic),
      }
    }
    Ok(results)
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cells::CellConstraints;
  use crate::utils::approx_eq;

  const GRAMMAR: &str = r#"
format=Berkeley start=ROOT
ROOT -> S 0
S -> NP VP 0
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

  // the PP attaches to the verb phrase with probability 0.6
  const SENTENCE: &str = "the dog walks the dog in the park";
  const VP_ATTACHMENT: &str =
    "(ROOT (S (NP (DT the) (NN dog)) (VP (VP (VB walks) (NP (DT the) (NN dog))) (PP (IN in) (NP (DT the) (NN park))))))";
  const NP_ATTACHMENT: &str =
    "(ROOT (S (NP (DT the) (NN dog)) (VP (VB walks) (NP (NP (DT the) (NN dog)) (PP (IN in) (NP (DT the) (NN park)))))))";

  fn parse_with(config: &ParserConfig) -> Result<ParseResult> {
    let g: Grammar = GRAMMAR.parse()?;
    let mut parser = ChartParser::new(&g, config)?;
    parser.parse_sentence(SENTENCE)
  }

  #[test]
  fn test_engines_agree_on_viterbi_tree() {
    let exhaustive = parse_with(&ParserConfig::default()).unwrap();
    assert_eq!(exhaustive.tree.to_bracketed(), VP_ATTACHMENT);
    assert_eq!(exhaustive.stats.sentence_length, 8);
    assert_eq!(exhaustive.stats.cells_visited, 36);
    assert!(approx_eq(exhaustive.log_prob, (0.18f64 * 0.3 * 0.054 * 0.18).ln(), 1e-5));

    for options in ["domain=real", "intersection=spmv", "cells=beam beamWidth=100", "cells=agenda"] {
      let config: ParserConfig = options.parse().unwrap();
      let other = parse_with(&config).unwrap();
      assert_eq!(other.tree, exhaustive.tree, "{}", options);
      assert!(approx_eq(other.log_prob, exhaustive.log_prob, 1e-5), "{}", options);
    }

    let config: ParserConfig = "cells=agenda fom=normalized".parse().unwrap();
    let normalized = parse_with(&config).unwrap();
    assert!(normalized.log_prob <= exhaustive.log_prob + 1e-6);
    assert!(normalized.stats.agenda_pops > 0);
  }

  #[test]
  fn test_summing_decoders() {
    let viterbi = parse_with(&ParserConfig::default()).unwrap();
    for options in ["decode=maxc", "decode=summaxc", "decode=maxrule", "decode=maxrule domain=real"] {
      let config: ParserConfig = options.parse().unwrap();
      let result = parse_with(&config).unwrap();
      assert_eq!(result.tree.to_bracketed(), VP_ATTACHMENT, "{}", options);
      // both attachments contribute to the sentence probability
      assert!(approx_eq(result.log_prob, (0.18f64 * (0.002916 + 0.001944)).ln(), 1e-4), "{}", options);
      assert!(result.log_prob > viterbi.log_prob);
    }
  }

  #[test]
  fn test_constrained_cells() {
    let g: Grammar = GRAMMAR.parse().unwrap();
    let open = [(0, 2), (3, 5), (6, 8), (5, 8), (3, 8), (2, 8), (0, 8)];
    let config = ParserConfig::default().with_cell_constraints(CellConstraints::from_open_cells(8, &open).unwrap());
    let mut parser = ChartParser::new(&g, &config).unwrap();
    let result = parser.parse_sentence(SENTENCE).unwrap();
    assert_eq!(result.tree.to_bracketed(), NP_ATTACHMENT);
    assert_eq!(result.stats.cells_visited, 8 + open.len());
    assert_eq!(result.stats.cells_skipped, 36 - 8 - open.len());
    assert!(matches!(parser.parse_sentence("the dog"), Err(Error::Config { .. })));
  }

  #[test]
  fn test_failures_are_per_sentence() {
    let g: Grammar = GRAMMAR.parse().unwrap();
    let config = ParserConfig::default();
    let sentences = ["the dog walks", "park the", "", "the park walks in the park", "the cat walks"];
    let results = parse_batch(&g, &config, &sentences, 3).unwrap();
    assert_eq!(results.len(), sentences.len());
    assert_eq!(
      results[0].as_ref().unwrap().tree.to_bracketed(),
      "(ROOT (S (NP (DT the) (NN dog)) (VP (VB walks))))"
    );
    assert!(matches!(results[1], Err(Error::NoParse { length: 2 })));
    assert!(matches!(results[2], Err(Error::NoParse { length: 0 })));
    assert!(results[3].is_ok());
    assert!(matches!(results[4], Err(Error::NoParse { length: 3 })));

    let sequential: Vec<_> = sentences
      .iter()
      .map(|s| ChartParser::new(&g, &config).unwrap().parse_sentence(s).ok().map(|r| r.tree))
      .collect();
    let parallel: Vec<_> = results.into_iter().map(|r| r.ok().map(|r| r.tree)).collect();
    assert_eq!(parallel, sequential);
  }

  #[test]
  fn test_batch_rejects_bad_config() {
    let g: Grammar = GRAMMAR.parse().unwrap();
    let config = ParserConfig::default().with_beam_width(0);
    assert!(parse_batch(&g, &config, &["the dog walks"], 2).is_err());
    assert!(parse_batch(&g, &ParserConfig::default(), &[] as &[&str], 2).unwrap().is_empty());
  }

  #[test]
  fn test_expected_counts_through_parser() {
    let g: Grammar = GRAMMAR.parse().unwrap();
    for domain in ["domain=log", "domain=real"] {
      let config: ParserConfig = domain.parse().unwrap();
      let mut parser = ChartParser::new(&g, &config).unwrap();
      let mut counts = FractionalCounts::for_grammar(&g);
      let log_z = parser.expected_counts(&["the", "dog", "walks"], &mut counts).unwrap();
      assert!(log_z < 0.0);
      assert!(approx_eq(counts.parent_count(g.start_symbol()).exp(), 1.0, 1e-4));
    }
    let config: ParserConfig = "cells=agenda".parse().unwrap();
    let mut parser = ChartParser::new(&g, &config).unwrap();
    let mut counts = FractionalCounts::for_grammar(&g);
    assert!(parser.expected_counts(&["walks"], &mut counts).is_err());
  }
}
