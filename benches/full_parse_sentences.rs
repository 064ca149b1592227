use criterion::{black_box, criterion_group, criterion_main, Criterion};

use sparsecky::{ChartParser, Grammar, ParserConfig};

const GRAMMAR_SRC: &str = include_str!("./sentences.grammar");

fn parse(parser: &mut ChartParser<'_>, input: &[&str]) -> f64 {
  parser.parse(input).map(|r| r.log_prob).unwrap_or(f64::NEG_INFINITY)
}

fn criterion_benchmark(c: &mut Criterion) {
  let grammar = GRAMMAR_SRC.parse::<Grammar>().unwrap();
  let simple_input = "the dog walks".split(' ').collect::<Vec<_>>();
  let complex_input = "the man saw a big dog in the park with the old telescope in the park"
    .split(' ')
    .collect::<Vec<_>>();

  for (name, options) in [
    ("viterbi", "decode=viterbi"),
    ("viterbi spmv", "intersection=spmv"),
    ("agenda", "cells=agenda"),
    ("maxrule", "decode=maxrule"),
    ("maxrule real", "decode=maxrule domain=real"),
  ] {
    let config: ParserConfig = options.parse().unwrap();
    let mut parser = ChartParser::new(&grammar, &config).unwrap();

    c.bench_function(&format!("parse simple ({})", name), |b| {
      b.iter(|| parse(&mut parser, black_box(&simple_input)))
    });

    c.bench_function(&format!("parse ambiguous ({})", name), |b| {
      b.iter(|| parse(&mut parser, black_box(&complex_input)))
    });
  }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
