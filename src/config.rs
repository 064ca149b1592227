use std::fmt;
use std::str::FromStr;

use crate::cells::CellConstraints;
use crate::error::{Error, Result};

/// How the final tree is read off the chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeMethod {
  /// Best derivation, following backpointers.
  #[default]
  Viterbi,
  /// Goodman's max-constituent parse over (split) non-terminals.
  Maxc,
  /// Max-constituent with posteriors summed over the splits of each base label.
  SumMaxc,
  /// Petrov and Klein's max-rule-product parse over base labels.
  MaxRuleProduct,
}

impl DecodeMethod {
  /// Decoders other than Viterbi need summed inside scores and an outside pass.
  pub fn needs_outside(&self) -> bool {
    !matches!(self, Self::Viterbi)
  }
}

/// Which cells are populated, and how.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CellPolicy {
  #[default]
  Exhaustive,
  Beam,
  Agenda,
  Constrained(CellConstraints),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fom {
  #[default]
  Inside,
  /// Inside log probability divided by span width.
  NormalizedInside,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Intersection {
  /// Probe the grammar column of every pair of child entries.
  #[default]
  CartesianProduct,
  /// Collect the best child pair per column key, then multiply by the
  /// parent-indexed grammar rows.
  Spmv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NumericDomain {
  #[default]
  Log,
  Real,
}

/// Immutable parser settings, built once and shared by reference.
///
/// ```
/// use sparsecky::config::{DecodeMethod, ParserConfig};
///
/// let config: ParserConfig = "beamWidth=20 decode=maxc".parse().unwrap();
/// assert_eq!(config.beam_width, 20);
/// assert_eq!(config.decode, DecodeMethod::Maxc);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ParserConfig {
  pub beam_width: usize,
  pub lexical_row_beam_width: usize,
  /// Log-probability distance below a cell's best entry beyond which entries are pruned.
  pub beam_delta: f64,
  pub decode: DecodeMethod,
  pub cell_policy: CellPolicy,
  pub fom: Fom,
  pub intersection: Intersection,
  pub maxc_lambda: f64,
  pub domain: NumericDomain,
}

impl Default for ParserConfig {
  fn default() -> Self {
    Self {
      beam_width: usize::MAX,
      lexical_row_beam_width: usize::MAX,
      beam_delta: f64::INFINITY,
      decode: DecodeMethod::default(),
      cell_policy: CellPolicy::default(),
      fom: Fom::default(),
      intersection: Intersection::default(),
      maxc_lambda: 0.0,
      domain: NumericDomain::default(),
    }
  }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T>
where
  T::Err: fmt::Display,
{
  value
    .parse()
    .map_err(|e: T::Err| Error::config(key, format!("'{}': {}", value, e)))
}

impl ParserConfig {
  pub fn with_beam_width(mut self, beam_width: usize) -> Self {
    self.beam_width = beam_width;
    self
  }

  pub fn with_lexical_row_beam_width(mut self, width: usize) -> Self {
    self.lexical_row_beam_width = width;
    self
  }

  pub fn with_beam_delta(mut self, delta: f64) -> Self {
    self.beam_delta = delta;
    self
  }

  pub fn with_decode(mut self, decode: DecodeMethod) -> Self {
    self.decode = decode;
    self
  }

  pub fn with_cell_policy(mut self, policy: CellPolicy) -> Self {
    self.cell_policy = policy;
    self
  }

  pub fn with_cell_constraints(self, constraints: CellConstraints) -> Self {
    self.with_cell_policy(CellPolicy::Constrained(constraints))
  }

  pub fn with_fom(mut self, fom: Fom) -> Self {
    self.fom = fom;
    self
  }

  pub fn with_intersection(mut self, intersection: Intersection) -> Self {
    self.intersection = intersection;
    self
  }

  pub fn with_maxc_lambda(mut self, lambda: f64) -> Self {
    self.maxc_lambda = lambda;
    self
  }

  pub fn with_domain(mut self, domain: NumericDomain) -> Self {
    self.domain = domain;
    self
  }

  /// Returns a copy with one `key=value` option applied.
  pub fn with_option(self, key: &str, value: &str) -> Result<Self> {
    Ok(match key {
      "beamWidth" => self.with_beam_width(parse_number(key, value)?),
      "lexicalRowBeamWidth" => self.with_lexical_row_beam_width(parse_number(key, value)?),
      "beamDelta" => self.with_beam_delta(parse_number(key, value)?),
      "maxcLambda" => self.with_maxc_lambda(parse_number(key, value)?),
      "decode" => self.with_decode(match value {
        "viterbi" => DecodeMethod::Viterbi,
        "maxc" => DecodeMethod::Maxc,
        "summaxc" => DecodeMethod::SumMaxc,
        "maxrule" => DecodeMethod::MaxRuleProduct,
        _ => return Err(Error::config(key, format!("unknown decoder '{}'", value))),
      }),
      "cells" => self.with_cell_policy(match value {
        "exhaustive" => CellPolicy::Exhaustive,
        "beam" => CellPolicy::Beam,
        "agenda" => CellPolicy::Agenda,
        _ => return Err(Error::config(key, format!("unknown cell policy '{}'", value))),
      }),
      "fom" => self.with_fom(match value {
        "inside" => Fom::Inside,
        "normalized" => Fom::NormalizedInside,
        _ => return Err(Error::config(key, format!("unknown figure of merit '{}'", value))),
      }),
      "intersection" => self.with_intersection(match value {
        "cartesian" => Intersection::CartesianProduct,
        "spmv" => Intersection::Spmv,
        _ => return Err(Error::config(key, format!("unknown intersection '{}'", value))),
      }),
      "domain" => self.with_domain(match value {
        "log" => NumericDomain::Log,
        "real" => NumericDomain::Real,
        _ => return Err(Error::config(key, format!("unknown domain '{}'", value))),
      }),
      _ => return Err(Error::config(key, "unknown option")),
    })
  }

  /// Beam width for a cell of the given span width.
  pub fn beam_width_for(&self, span: usize) -> usize {
    if span == 1 {
      self.lexical_row_beam_width.min(self.beam_width)
    } else {
      self.beam_width
    }
  }

  /// Rejects combinations no engine implements.
  pub fn validate(&self) -> Result<()> {
    if self.cell_policy == CellPolicy::Agenda && self.decode != DecodeMethod::Viterbi {
      return Err(Error::config(
        "decode",
        "the agenda parser only supports viterbi decoding",
      ));
    }
    if self.beam_width == 0 || self.lexical_row_beam_width == 0 {
      return Err(Error::config("beamWidth", "must be at least 1"));
    }
    if self.beam_delta.is_nan() || self.beam_delta < 0.0 {
      return Err(Error::config("beamDelta", "must be a non-negative number"));
    }
    Ok(())
  }
}

/// Parses whitespace- or comma-separated `key=value` options onto the defaults.
impl FromStr for ParserConfig {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let mut config = Self::default();
    for option in s.split(|c: char| c.is_whitespace() || c == ',') {
      if option.is_empty() {
        continue;
      }
      let (key, value) = option
        .split_once('=')
        .ok_or_else(|| Error::config(option, "expected key=value"))?;
      config = config.with_option(key, value)?;
    }
    config.validate()?;
    Ok(config)
  }
}
