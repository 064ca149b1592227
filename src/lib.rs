#[macro_use]
extern crate lazy_static;

pub mod agenda;
pub mod cells;
pub mod chart;
pub mod config;
pub mod constrained;
pub mod counts;
pub mod decode;
pub mod domain;
pub mod error;
pub mod grammar;
pub mod intersect;
pub mod outside;
pub mod packing;
pub mod parse_grammar;
pub mod parser;
pub mod rules;
pub mod symbols;
pub mod syntree;
pub mod utils;

pub use crate::config::{CellPolicy, DecodeMethod, NumericDomain, ParserConfig};
pub use crate::error::{Error, Result};
pub use crate::grammar::{Grammar, GrammarBuilder};
pub use crate::parser::{parse_batch, ChartParser, ParseResult, ParseStats};
pub use crate::syntree::{parse_bracketed, SynTree};

#[cfg(test)]
mod tests {
  use super::*;
  use crate::constrained::{ConstrainedInsideOutside, ConstrainingChart};
  use crate::counts::{split_grammar, FractionalCounts};
  use crate::rules::Children;
  use crate::utils::approx_eq;

  fn parse(grammar: &Grammar, config: &ParserConfig, sentence: &str) -> Result<ParseResult> {
    ChartParser::new(grammar, config)?.parse_sentence(sentence)
  }

  #[test]
  fn test_two_word_sentence() {
    let g: Grammar = "format=Berkeley start=S\nS -> NP VP 0\n===== LEXICON =====\nNP -> a 0\nVP -> b 0\n"
      .parse()
      .unwrap();
    let config = ParserConfig::default();
    let result = parse(&g, &config, "a b").unwrap();
    assert_eq!(result.tree.to_bracketed(), "(S (NP a) (VP b))");
    assert_eq!(result.log_prob, 0.0);

    assert!(matches!(parse(&g, &config, "a c"), Err(Error::NoParse { length: 2 })));
    assert!(matches!(parse(&g, &config, "b a"), Err(Error::NoParse { length: 2 })));
  }

  #[test]
  fn test_unary_over_lexical() {
    let g: Grammar = "format=Berkeley start=TOP\nTOP -> A 0\n===== LEXICON =====\nA -> c 0\n"
      .parse()
      .unwrap();
    for options in ["decode=viterbi", "decode=maxc", "decode=maxrule", "cells=agenda"] {
      let config: ParserConfig = options.parse().unwrap();
      assert_eq!(parse(&g, &config, "c").unwrap().tree.to_bracketed(), "(TOP (A c))", "{}", options);
    }
  }

  const TREEBANK: [&str; 3] = [
    "(ROOT (S (NP (DT the) (NN dog)) (VP (VB barks))))",
    "(ROOT (S (NP (NN dogs)) (VP (VB bark))))",
    "(ROOT (S (NP (DT the) (NN dog)) (VP (VB chases) (NP (DT the) (NN cat)))))",
  ];

  fn treebank() -> Vec<SynTree<String, String>> {
    TREEBANK.iter().map(|t| parse_bracketed(t).unwrap()).collect()
  }

  fn sentence(tree: &SynTree<String, String>) -> Vec<String> {
    tree.leaves().into_iter().cloned().collect()
  }

  /// Every production of `a` has the same weight in `b`, looked up by name.
  fn assert_same_grammar(a: &Grammar, b: &Grammar) {
    assert_eq!(a.productions().len(), b.productions().len());
    let nt = |name: &str| b.non_terminal(name).unwrap();
    for p in a.productions() {
      let parent = nt(a.label(p.parent));
      let weight = match p.children {
        Children::Binary(l, r) => b.binary_log_prob(parent, nt(a.label(l)), nt(a.label(r))),
        Children::Unary(c) => b.unary_log_prob(parent, nt(a.label(c))),
        Children::Lexical(w) => b.lexical_log_prob(parent, b.map_token(a.word(w)).unwrap()),
      };
      assert!(approx_eq(weight as f64, p.weight as f64, 1e-4), "{:?}", p);
    }
  }

  #[test]
  fn test_em_step_on_unambiguous_treebank() {
    let trees = treebank();
    let induced = FractionalCounts::induce(&trees).unwrap().to_grammar().unwrap();
    assert!(approx_eq(
      induced.binary_log_prob(
        induced.non_terminal("NP").unwrap(),
        induced.non_terminal("DT").unwrap(),
        induced.non_terminal("NN").unwrap()
      ) as f64,
      (2.0f64 / 3.0).ln(),
      1e-5
    ));

    // each sentence has exactly one derivation, so the expected counts are the
    // observed ones and re-estimation reproduces the grammar
    let config = ParserConfig::default().with_decode(DecodeMethod::MaxRuleProduct);
    let mut parser = ChartParser::new(&induced, &config).unwrap();
    let mut counts = FractionalCounts::for_grammar(&induced);
    for tree in &trees {
      parser.expected_counts(&sentence(tree), &mut counts).unwrap();
    }
    assert_same_grammar(&induced, &counts.to_grammar().unwrap());

    for tree in &trees {
      assert_eq!(parser.parse(&sentence(tree)).unwrap().tree, *tree);
    }
  }

  #[test]
  fn test_split_grammar_training_step() {
    let trees = treebank();
    let base = FractionalCounts::induce(&trees).unwrap().to_grammar().unwrap();
    let split = split_grammar(&base).unwrap();
    assert_eq!(split.num_non_terminals(), 2 * base.num_non_terminals() - 1);

    let mut counts = FractionalCounts::for_grammar(&split);
    let mut total = 0.0;
    for tree in &trees {
      let constraining = ConstrainingChart::from_tree(tree, &split).unwrap();
      let mut io = ConstrainedInsideOutside::new(&split, &constraining).unwrap();
      total += io.parse().unwrap();
      io.count_rules(&mut counts);
    }
    assert!(total.is_finite());
    let root = split.start_symbol();
    assert!(approx_eq(counts.parent_count(root).exp(), trees.len() as f64, 1e-4));

    let trained = counts.to_grammar().unwrap();
    assert_eq!(trained.num_non_terminals(), split.num_non_terminals());
    let config = ParserConfig::default().with_decode(DecodeMethod::MaxRuleProduct);
    let mut parser = ChartParser::new(&trained, &config).unwrap();
    for tree in &trees {
      // max-rule decoding reports base labels
      assert_eq!(parser.parse(&sentence(tree)).unwrap().tree, *tree);
    }
  }

  #[test]
  fn test_domains_agree_on_long_sentence() {
    let g: Grammar = r#"
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
"#
    .parse()
    .unwrap();
    let mut words = String::from("the dog walks the dog");
    for _ in 0..8 {
      words.push_str(" in the park");
    }

    let log = parse(&g, &"decode=maxrule".parse().unwrap(), &words).unwrap();
    let real = parse(&g, &"decode=maxrule domain=real".parse().unwrap(), &words).unwrap();
    assert_eq!(log.stats.sentence_length, 29);
    assert!(approx_eq(log.log_prob, real.log_prob, 1e-4));
    assert_eq!(log.tree.leaves(), real.tree.leaves());

    let viterbi = parse(&g, &ParserConfig::default(), &words).unwrap();
    let viterbi_real = parse(&g, &"domain=real".parse().unwrap(), &words).unwrap();
    // stacked attachments tie exactly, so only the scores are compared
    assert!(approx_eq(viterbi.log_prob, viterbi_real.log_prob, 1e-4));
    assert!(viterbi.log_prob < log.log_prob);
  }
}
