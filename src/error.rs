use thiserror::Error;

/// Errors surfaced by grammar loading, parsing and chart access.
#[derive(Debug, Error)]
pub enum Error {
  /// Malformed or inconsistent grammar. Line 0 means the problem is not tied to one line.
  #[error("grammar format error (line {line}): {message}")]
  GrammarFormat { line: usize, message: String },

  /// The chart was filled but the start symbol does not span the sentence.
  #[error("no parse found for sentence of length {length}")]
  NoParse { length: usize },

  #[error("illegal span {start}..{end} for chart of size {size}")]
  IllegalSpan { start: usize, end: usize, size: usize },

  #[error("symbol table is finalized, cannot add '{symbol}'")]
  FinalizedSymbolTable { symbol: String },

  /// A tree label that the grammar's vocabulary does not know.
  #[error("unknown label '{label}'")]
  UnknownLabel { label: String },

  #[error("malformed tree: {message}")]
  TreeFormat { message: String },

  #[error("bad option '{key}': {message}")]
  Config { key: String, message: String },

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

impl Error {
  pub fn grammar(line: usize, message: impl Into<String>) -> Self {
    Self::GrammarFormat {
      line,
      message: message.into(),
    }
  }

  pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
    Self::Config {
      key: key.into(),
      message: message.into(),
    }
  }

  pub fn tree(message: impl Into<String>) -> Self {
    Self::TreeFormat {
      message: message.into(),
    }
  }

  /// True for errors that only concern one sentence, so batch parsing can carry on.
  pub fn is_sentence_local(&self) -> bool {
    matches!(
      self,
      Self::NoParse { .. } | Self::UnknownLabel { .. } | Self::TreeFormat { .. }
    )
  }
}

pub type Result<T> = std::result::Result<T, Error>;

#[test]
fn test_error_messages() {
  let e = Error::grammar(3, "missing weight");
  assert_eq!(e.to_string(), "grammar format error (line 3): missing weight");
  assert!(!e.is_sentence_local());
  assert!(Error::NoParse { length: 4 }.is_sentence_local());
}
