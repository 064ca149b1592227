use std::collections::HashMap;
use std::fmt;
use std::ops::Index;

use crate::error::{Error, Result};

/// Bidirectional mapping between symbol names and dense indices.
///
/// Indices are assigned in insertion order and never change. Once
/// [`SymbolTable::finalize`] has been called, adding a symbol that isn't
/// already present is an error; lookups keep working.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
  symbols: Vec<String>,
  indices: HashMap<String, usize>,
  finalized: bool,
}

impl SymbolTable {
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns the index of `symbol`, inserting it if needed.
  pub fn add(&mut self, symbol: &str) -> Result<usize> {
    if let Some(&idx) = self.indices.get(symbol) {
      return Ok(idx);
    }
    if self.finalized {
      return Err(Error::FinalizedSymbolTable {
        symbol: symbol.to_string(),
      });
    }
    let idx = self.symbols.len();
    self.symbols.push(symbol.to_string());
    self.indices.insert(symbol.to_string(), idx);
    Ok(idx)
  }

  pub fn index(&self, symbol: &str) -> Option<usize> {
    self.indices.get(symbol).copied()
  }

  pub fn symbol(&self, idx: usize) -> Option<&str> {
    self.symbols.get(idx).map(|s| s.as_str())
  }

  pub fn contains(&self, symbol: &str) -> bool {
    self.indices.contains_key(symbol)
  }

  pub fn finalize(&mut self) {
    self.finalized = true;
  }

  pub fn is_finalized(&self) -> bool {
    self.finalized
  }

  pub fn len(&self) -> usize {
    self.symbols.len()
  }

  pub fn is_empty(&self) -> bool {
    self.symbols.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
    self.symbols.iter().enumerate().map(|(i, s)| (i, s.as_str()))
  }
}

impl Index<usize> for SymbolTable {
  type Output = str;

  fn index(&self, idx: usize) -> &str {
    &self.symbols[idx]
  }
}

impl fmt::Display for SymbolTable {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (idx, s) in self.iter() {
      writeln!(f, "{}\t{}", idx, s)?;
    }
    Ok(())
  }
}

impl<'a> FromIterator<&'a str> for SymbolTable {
  fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
    let mut table = Self::new();
    for s in iter {
      if !table.contains(s) {
        let idx = table.symbols.len();
        table.symbols.push(s.to_string());
        table.indices.insert(s.to_string(), idx);
      }
    }
    table
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_indices_are_stable() {
    let mut t = SymbolTable::new();
    assert_eq!(t.add("S").unwrap(), 0);
    assert_eq!(t.add("NP").unwrap(), 1);
    assert_eq!(t.add("S").unwrap(), 0);
    assert_eq!(t.index("NP"), Some(1));
    assert_eq!(t.symbol(1), Some("NP"));
    assert_eq!(&t[0], "S");
    assert_eq!(t.index("VP"), None);
  }

  #[test]
  fn test_finalized_table_rejects_new_symbols() {
    let mut t: SymbolTable = ["S", "NP"].into_iter().collect();
    t.finalize();
    assert_eq!(t.add("NP").unwrap(), 1);
    assert!(matches!(
      t.add("VP"),
      Err(Error::FinalizedSymbolTable { .. })
    ));
    assert_eq!(t.len(), 2);
  }
}
