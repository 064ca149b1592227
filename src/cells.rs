//! Cell visitation orders and externally supplied open/closed cell masks.

use crate::error::{Error, Result};

/// Every span of a sentence of `size` tokens, narrowest first and left to
/// right within a width. Each cell comes after all of its possible children.
pub fn bottom_up(size: usize) -> impl Iterator<Item = (usize, usize)> {
  (1..=size).flat_map(move |span| (0..=size - span).map(move |start| (start, start + span)))
}

/// The reverse of [`bottom_up`]: each cell comes after all of its possible parents.
pub fn top_down(size: usize) -> impl Iterator<Item = (usize, usize)> {
  (1..=size)
    .rev()
    .flat_map(move |span| (0..=size - span).rev().map(move |start| (start, start + span)))
}

/// Open/closed mask over the cells of one sentence, as produced by an
/// external cell classifier. Width-1 cells are always open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellConstraints {
  size: usize,
  open: Vec<bool>,
}

impl CellConstraints {
  /// All cells open.
  pub fn new(size: usize) -> Self {
    Self {
      size,
      open: vec![true; size * (size + 1) / 2],
    }
  }

  /// Only the given spans (plus every width-1 cell) open.
  pub fn from_open_cells(size: usize, spans: &[(usize, usize)]) -> Result<Self> {
    let mut c = Self {
      size,
      open: vec![false; size * (size + 1) / 2],
    };
    for &(start, end) in spans {
      let i = c.index(start, end)?;
      c.open[i] = true;
    }
    Ok(c)
  }

  pub fn size(&self) -> usize {
    self.size
  }

  fn index(&self, start: usize, end: usize) -> Result<usize> {
    if start >= end || end > self.size {
      return Err(Error::IllegalSpan {
        start,
        end,
        size: self.size,
      });
    }
    Ok(start * self.size - start * start.saturating_sub(1) / 2 + (end - start - 1))
  }

  pub fn close(&mut self, start: usize, end: usize) -> Result<()> {
    let i = self.index(start, end)?;
    self.open[i] = false;
    Ok(())
  }

  pub fn open(&mut self, start: usize, end: usize) -> Result<()> {
    let i = self.index(start, end)?;
    self.open[i] = true;
    Ok(())
  }

  pub fn is_open(&self, start: usize, end: usize) -> bool {
    end - start == 1 || self.index(start, end).map(|i| self.open[i]).unwrap_or(false)
  }

  pub fn num_open(&self) -> usize {
    bottom_up(self.size).filter(|&(s, e)| self.is_open(s, e)).count()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_orders() {
    let up: Vec<_> = bottom_up(3).collect();
    assert_eq!(up, vec![(0, 1), (1, 2), (2, 3), (0, 2), (1, 3), (0, 3)]);
    let mut down: Vec<_> = top_down(3).collect();
    down.reverse();
    assert_eq!(down, up);
    assert_eq!(bottom_up(0).count(), 0);
  }

  #[test]
  fn test_constraints() {
    let mut c = CellConstraints::from_open_cells(4, &[(0, 4), (1, 3)]).unwrap();
    assert!(c.is_open(0, 4) && c.is_open(1, 3));
    assert!(!c.is_open(0, 2));
    assert!(c.is_open(2, 3), "width-1 cells are always open");
    assert_eq!(c.num_open(), 6);
    c.close(1, 3).unwrap();
    assert!(!c.is_open(1, 3));
    assert!(c.close(3, 5).is_err());
    assert!(CellConstraints::new(3).is_open(0, 2));
  }
}
