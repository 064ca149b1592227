use std::env;
use std::io;
use std::io::{BufRead, Write};
use std::process;

use sparsecky::{parse_batch, Grammar, ParserConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type Err = Box<dyn std::error::Error + 'static>;

fn usage(prog_name: &str) -> String {
  format!(
    r"Usage: {} GRAMMAR [options] < SENTENCES

Reads one whitespace-tokenized sentence per line and prints one bracketed
tree per line, or () when a sentence has no parse.

Options:
  -h, --help           Print this message
  -O, --option K=V     Set a parser option (repeatable), e.g. -O decode=maxrule
  -c, --stats          Print per-sentence parse statistics to stderr
  -t, --threads N      Parse on N threads (defaults to 1)

Parser options:
  beamWidth, lexicalRowBeamWidth, beamDelta, maxcLambda,
  decode=viterbi|maxc|summaxc|maxrule, cells=exhaustive|beam|agenda,
  fom=inside|normalized, intersection=cartesian|spmv, domain=log|real

Logging is controlled by RUST_LOG (defaults to warn).",
    prog_name
  )
}

struct Args {
  filename: String,
  options: Vec<String>,
  print_stats: bool,
  threads: usize,
}

impl Args {
  fn make_error_message(msg: &str, prog_name: impl AsRef<str>) -> String {
    format!("argument error: {}.\n\n{}", msg, usage(prog_name.as_ref()))
  }

  fn parse(v: Vec<String>) -> Result<Self, String> {
    let mut iter = v.into_iter();
    let Some(prog_name) = iter.next() else {
      return Err(Self::make_error_message("bad argument vector", "sparsecky"));
    };

    let mut filename: Option<String> = None;
    let mut options = Vec::new();
    let mut print_stats = false;
    let mut threads = 1;

    while let Some(o) = iter.next() {
      if o == "-h" || o == "--help" {
        println!("{}", usage(&prog_name));
        process::exit(0);
      } else if o == "-c" || o == "--stats" {
        print_stats = true;
      } else if o == "-O" || o == "--option" {
        match iter.next() {
          Some(option) => options.push(option),
          None => return Err(Self::make_error_message("-O needs a key=value argument", prog_name)),
        }
      } else if o == "-t" || o == "--threads" {
        threads = match iter.next().map(|n| n.parse::<usize>()) {
          Some(Ok(n)) if n > 0 => n,
          _ => return Err(Self::make_error_message("-t needs a positive thread count", prog_name)),
        };
      } else if filename.is_none() && !o.starts_with('-') {
        filename = Some(o);
      } else {
        return Err(Self::make_error_message("invalid arguments", prog_name));
      }
    }

    if let Some(filename) = filename {
      Ok(Self {
        filename,
        options,
        print_stats,
        threads,
      })
    } else {
      Err(Self::make_error_message("missing grammar filename", prog_name))
    }
  }
}

fn main() -> Result<(), Err> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
    .with_writer(io::stderr)
    .init();

  let opts = match Args::parse(env::args().collect()) {
    Ok(opts) => opts,
    Err(msg) => {
      eprintln!("{}", msg);
      process::exit(255);
    }
  };

  let config: ParserConfig = opts.options.join(" ").parse()?;
  let g = Grammar::read_from_file(&opts.filename)?;
  info!(
    non_terminals = g.num_non_terminals(),
    binary = g.num_binary_rules(),
    unary = g.num_unary_rules(),
    lexical = g.num_lexical_rules(),
    "loaded grammar"
  );

  let sentences = io::stdin().lock().lines().collect::<Result<Vec<_>, _>>()?;
  let results = parse_batch(&g, &config, &sentences, opts.threads)?;

  let stdout = io::stdout();
  let mut out = stdout.lock();
  for (i, result) in results.into_iter().enumerate() {
    match result {
      Ok(parse) => {
        writeln!(out, "{}", parse.tree)?;
        if opts.print_stats {
          eprintln!("sentence {}: {} logprob={:.4}", i + 1, parse.stats, parse.log_prob);
        }
      }
      Err(e) if e.is_sentence_local() => {
        warn!(sentence = i + 1, "{}", e);
        writeln!(out, "()")?;
      }
      Err(e) => return Err(e.into()),
    }
  }
  out.flush()?;

  Ok(())
}
