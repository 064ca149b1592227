use std::fmt;

use crate::symbols::SymbolTable;

/// Index of a non-terminal in the grammar's symbol table.
pub type NtId = u16;
/// Index of a word in the grammar's lexicon.
pub type WordId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Children {
  Binary(NtId, NtId),
  Unary(NtId),
  Lexical(WordId),
}

impl Children {
  pub fn is_binary(&self) -> bool {
    matches!(self, Self::Binary(_, _))
  }

  pub fn is_unary(&self) -> bool {
    matches!(self, Self::Unary(_))
  }

  pub fn is_lexical(&self) -> bool {
    matches!(self, Self::Lexical(_))
  }
}

/// A weighted rule `parent -> children`. The weight is a natural-log probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Production {
  pub parent: NtId,
  pub children: Children,
  pub weight: f32,
}

impl Production {
  pub fn binary(parent: NtId, left: NtId, right: NtId, weight: f32) -> Self {
    Self {
      parent,
      children: Children::Binary(left, right),
      weight,
    }
  }

  pub fn unary(parent: NtId, child: NtId, weight: f32) -> Self {
    Self {
      parent,
      children: Children::Unary(child),
      weight,
    }
  }

  pub fn lexical(parent: NtId, word: WordId, weight: f32) -> Self {
    Self {
      parent,
      children: Children::Lexical(word),
      weight,
    }
  }

  pub fn is_binary(&self) -> bool {
    self.children.is_binary()
  }

  pub fn is_unary(&self) -> bool {
    self.children.is_unary()
  }

  pub fn is_lexical(&self) -> bool {
    self.children.is_lexical()
  }

  pub fn probability(&self) -> f64 {
    (self.weight as f64).exp()
  }

  /// Display adapter resolving indices through the grammar's tables.
  pub fn display<'a>(
    &'a self,
    non_terminals: &'a SymbolTable,
    lexicon: &'a SymbolTable,
  ) -> DisplayProduction<'a> {
    DisplayProduction {
      production: self,
      non_terminals,
      lexicon,
    }
  }
}

pub struct DisplayProduction<'a> {
  production: &'a Production,
  non_terminals: &'a SymbolTable,
  lexicon: &'a SymbolTable,
}

impl fmt::Display for DisplayProduction<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let p = self.production;
    write!(f, "{} ->", &self.non_terminals[p.parent as usize])?;
    match p.children {
      Children::Binary(l, r) => write!(
        f,
        " {} {}",
        &self.non_terminals[l as usize], &self.non_terminals[r as usize]
      )?,
      Children::Unary(c) => write!(f, " {}", &self.non_terminals[c as usize])?,
      Children::Lexical(w) => write!(f, " {}", &self.lexicon[w as usize])?,
    }
    write!(f, " {}", p.weight)
  }
}

#[test]
fn test_production_display() {
  let nts: SymbolTable = ["S", "NP", "VP"].into_iter().collect();
  let lex: SymbolTable = ["fish"].into_iter().collect();
  let p = Production::binary(0, 1, 2, 0.0);
  assert_eq!(p.display(&nts, &lex).to_string(), "S -> NP VP 0");
  let p = Production::lexical(1, 0, -0.5);
  assert_eq!(p.display(&nts, &lex).to_string(), "NP -> fish -0.5");
  assert!(p.is_lexical() && !p.is_unary());
}
