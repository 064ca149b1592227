//! Line-oriented parsing of the textual grammar format:
//!
//! ```text
//! format=Berkeley start=ROOT
//! ROOT -> S 0
//! S -> NP VP 0
//! ===== LEXICON =====
//! NP -> fish -0.693
//! ```

use regex::Regex;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::grammar::{Grammar, GrammarBuilder};
use crate::packing::PackingScheme;
use crate::rules::Children;

pub const LEXICON_DELIMITER: &str = "===== LEXICON =====";

type Infallible<'a, T> = (T, &'a str);
type ParseResult<'a, T> = std::result::Result<(T, &'a str), String>;

/// helper macro for initializing a regex with lazy_static!
macro_rules! regex_static {
  ($name:ident, $pattern:expr) => {
    lazy_static! {
      static ref $name: Regex = Regex::new($pattern).unwrap();
    }
  };
}

/// How rule weights are written in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WeightFormat {
  Log,
  Prob,
}

#[derive(Debug)]
struct Header {
  start: String,
  weights: WeightFormat,
}

impl FromStr for Grammar {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    parse_grammar(s, PackingScheme::default())
  }
}

impl Grammar {
  pub fn read_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
    Self::read_from_file_with_packing(path, PackingScheme::default())
  }

  pub fn read_from_file_with_packing<P: AsRef<Path>>(path: P, scheme: PackingScheme) -> Result<Self> {
    parse_grammar(&fs::read_to_string(path)?, scheme)
  }

  pub fn parse_with_packing(s: &str, scheme: PackingScheme) -> Result<Self> {
    parse_grammar(s, scheme)
  }

  /// Writes the grammar back out in the text format, log-probability weights.
  pub fn to_text(&self) -> String {
    let mut rules = vec![format!("format=Berkeley start={}", self.start_symbol_name())];
    let mut lexicon = vec![LEXICON_DELIMITER.to_string()];
    for p in self.productions() {
      let parent = self.label(p.parent);
      match p.children {
        Children::Binary(l, r) => rules.push(format!("{} -> {} {} {}", parent, self.label(l), self.label(r), p.weight)),
        Children::Unary(c) => rules.push(format!("{} -> {} {}", parent, self.label(c), p.weight)),
        Children::Lexical(w) => lexicon.push(format!("{} -> {} {}", parent, self.word(w), p.weight)),
      }
    }
    rules.extend(lexicon);
    rules.push(String::new());
    rules.join("\n")
  }
}

/// Try to consume a regex at the start of `s`, returning None if it doesn't match
fn optional_re<'a>(re: &'static Regex, s: &'a str) -> Infallible<'a, Option<&'a str>> {
  if let Some(m) = re.find(s) {
    if m.start() > 0 {
      return (None, s);
    }
    let (_, rest) = s.split_at(m.end());
    (Some(m.as_str()), rest)
  } else {
    (None, s)
  }
}

/// Try to consume a regex, failing if it doesn't match
fn needed_re<'a>(re: &'static Regex, s: &'a str) -> ParseResult<'a, &'a str> {
  if let (Some(c), rest) = optional_re(re, s) {
    Ok((c, rest))
  } else {
    Err(format!("couldn't match {} at '{}'", re, s))
  }
}

/// Skips spaces and tabs (lines are already split)
fn skip_whitespace(s: &str) -> &str {
  regex_static!(WHITESPACE, r"[ \t]+");
  optional_re(&*WHITESPACE, s).1
}

fn is_blank_or_comment(line: &str) -> bool {
  let line = line.trim();
  line.is_empty() || line.starts_with("//") || line.starts_with('#')
}

fn is_lexicon_delimiter(line: &str) -> bool {
  regex_static!(DELIMITER, r"^\s*=+\s*LEXICON\s*=+\s*$");
  DELIMITER.is_match(line)
}

/// Any run of non-space characters
fn parse_symbol(s: &str) -> ParseResult<&str> {
  regex_static!(SYMBOL, r"\S+");
  needed_re(&*SYMBOL, s).map_err(|e| format!("symbol: {}", e))
}

fn parse_weight(token: &str) -> std::result::Result<f32, String> {
  regex_static!(
    WEIGHT,
    r"^[-+]?(?:(?:[0-9]+\.?[0-9]*|\.[0-9]+)(?:[eE][-+]?[0-9]+)?|[Ii]nf(?:inity)?)$"
  );
  if !WEIGHT.is_match(token) {
    return Err(format!("expected a weight, got '{}'", token));
  }
  let lower = token.to_ascii_lowercase();
  if lower.trim_start_matches(['-', '+']).starts_with("inf") {
    return Ok(if lower.starts_with('-') {
      f32::NEG_INFINITY
    } else {
      f32::INFINITY
    });
  }
  token
    .parse::<f32>()
    .map_err(|e| format!("bad weight '{}': {}", token, e))
}

fn parse_header(line: &str) -> std::result::Result<Header, String> {
  regex_static!(PAIR, r"([A-Za-z_]+)=(\S+)");
  let mut start = None;
  let mut weights = WeightFormat::Log;

  let mut rem = skip_whitespace(line.trim_end());
  while !rem.is_empty() {
    let (pair, s) = needed_re(&*PAIR, rem).map_err(|e| format!("header: {}", e))?;
    let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
    match key {
      "start" => start = Some(value.to_string()),
      "weights" => {
        weights = match value {
          "log" => WeightFormat::Log,
          "prob" => WeightFormat::Prob,
          other => return Err(format!("header: unknown weight format '{}'", other)),
        }
      }
      // format tags and other metadata are informational
      _ => {}
    }
    rem = skip_whitespace(s);
  }

  match start {
    Some(start) => Ok(Header { start, weights }),
    None => Err("header: missing start symbol".to_string()),
  }
}

/// Parent, arrow, one or two children, weight
fn parse_rule(line: &str) -> std::result::Result<(&str, Vec<&str>, f32), String> {
  regex_static!(ARROW, r"->|=>");

  let s = skip_whitespace(line.trim_end());
  let (parent, s) = parse_symbol(s).map_err(|e| format!("rule parent: {}", e))?;
  let s = skip_whitespace(s);
  let (_, s) = needed_re(&*ARROW, s).map_err(|e| format!("rule arrow: {}", e))?;

  let mut tokens = Vec::new();
  let mut rem = s;
  loop {
    rem = skip_whitespace(rem);
    if rem.is_empty() {
      break;
    }
    let (token, s) = parse_symbol(rem)?;
    tokens.push(token);
    rem = s;
  }

  let weight = match tokens.pop() {
    Some(w) => parse_weight(w)?,
    None => return Err("rule has no children or weight".to_string()),
  };
  if tokens.is_empty() || tokens.len() > 2 {
    return Err(format!("rule must have one or two children, got {}", tokens.len()));
  }
  Ok((parent, tokens, weight))
}

fn add_line(
  builder: &mut GrammarBuilder,
  line: &str,
  in_lexicon: bool,
  weights: WeightFormat,
) -> std::result::Result<(), String> {
  let (parent, children, weight) = parse_rule(line)?;
  let weight = match weights {
    WeightFormat::Log => weight,
    WeightFormat::Prob => weight.ln(),
  };
  let added = match (in_lexicon, children.as_slice()) {
    (true, [word]) => builder.add_lexical(parent, word, weight),
    (true, _) => return Err("lexical rules rewrite to exactly one word".to_string()),
    (false, [child]) => builder.add_unary(parent, child, weight),
    (false, [left, right]) => builder.add_binary(parent, left, right, weight),
    (false, _) => return Err("rule must have one or two children".to_string()),
  };
  added.map_err(|e| e.to_string())
}

pub fn parse_grammar(src: &str, scheme: PackingScheme) -> Result<Grammar> {
  let mut lines = src
    .lines()
    .enumerate()
    .filter(|(_, line)| !is_blank_or_comment(line));

  let (idx, header_line) = lines.next().ok_or_else(|| Error::grammar(0, "empty grammar"))?;
  let header = parse_header(header_line).map_err(|m| Error::grammar(idx + 1, m))?;

  let mut builder = GrammarBuilder::new(&header.start).packing(scheme);
  let mut in_lexicon = false;
  for (idx, line) in lines {
    if is_lexicon_delimiter(line) {
      in_lexicon = true;
      continue;
    }
    add_line(&mut builder, line, in_lexicon, header.weights).map_err(|m| Error::grammar(idx + 1, m))?;
  }

  builder.build()
}

#[cfg(test)]
mod tests {
  use super::*;

  const SRC: &str = r#"
format=Berkeley start=ROOT
// top level
# also a comment
ROOT -> S 0
S -> NP VP 0
NP => DT NP -0.693147
NP -> NN NN -0.693147
VP -> VB RB 0
===== LEXICON =====
DT -> The 0
NN -> fish -0.693147
NN -> market -0.693147
VB -> stands 0
RB -> last 0
"#;

  #[test]
  fn test_parse_berkeley_grammar() {
    let g: Grammar = SRC.parse().unwrap();
    assert_eq!(g.start_symbol_name(), "ROOT");
    assert_eq!(g.num_binary_rules(), 4);
    assert_eq!(g.num_unary_rules(), 1);
    assert_eq!(g.num_lexical_rules(), 5);
    let np = g.non_terminal("NP").unwrap();
    let dt = g.non_terminal("DT").unwrap();
    assert!((g.binary_log_prob(np, dt, np) + 0.693147).abs() < 1e-6);
  }

  #[test]
  fn test_probability_weights() {
    let g: Grammar = "format=Berkeley start=S weights=prob\nS -> NP VP 1.0\n===== LEXICON =====\nNP -> a 1.0\nVP -> b 0.5\n"
      .parse()
      .unwrap();
    let vp = g.non_terminal("VP").unwrap();
    let b = g.map_token("b").unwrap();
    assert!((g.lexical_log_prob(vp, b) - 0.5f32.ln()).abs() < 1e-6);
  }

  #[test]
  fn test_errors_report_line() {
    let err = "format=Berkeley start=S\nS -> NP VP\n".parse::<Grammar>().unwrap_err();
    assert!(matches!(err, Error::GrammarFormat { line: 2, .. }), "{}", err);

    let err = "format=Berkeley\nS -> NP 0\n".parse::<Grammar>().unwrap_err();
    assert!(matches!(err, Error::GrammarFormat { line: 1, .. }));

    let err = "format=Berkeley start=S\nS -> A B C 0\n".parse::<Grammar>().unwrap_err();
    assert!(matches!(err, Error::GrammarFormat { line: 2, .. }));

    let err = "format=Berkeley start=S\n===== LEXICON =====\nS -> a b 0\n"
      .parse::<Grammar>()
      .unwrap_err();
    assert!(matches!(err, Error::GrammarFormat { line: 3, .. }));

    assert!("".parse::<Grammar>().is_err());
  }

  #[test]
  fn test_text_round_trip() {
    let g: Grammar = SRC.parse().unwrap();
    let text = g.to_text();
    let (rules, lexicon) = text.split_once(LEXICON_DELIMITER).unwrap();
    assert!(rules.starts_with("format=Berkeley start="));
    assert!(text.ends_with('\n'));
    assert_eq!(lexicon.trim().lines().count(), g.num_lexical_rules());
    let again: Grammar = text.parse().unwrap();
    let rendered = |g: &Grammar| {
      let mut rules: Vec<String> = g
        .productions()
        .iter()
        .map(|p| p.display(g.non_terminals(), g.lexicon()).to_string())
        .collect();
      rules.sort();
      rules
    };
    assert_eq!(again.num_non_terminals(), g.num_non_terminals());
    assert_eq!(rendered(&again), rendered(&g));
  }

  #[test]
  fn test_weight_tokens() {
    assert_eq!(parse_weight("0").unwrap(), 0.0);
    assert_eq!(parse_weight("-1.5e-2").unwrap(), -0.015);
    assert_eq!(parse_weight("-Infinity").unwrap(), f32::NEG_INFINITY);
    assert!(parse_weight("NP").is_err());
  }
}
