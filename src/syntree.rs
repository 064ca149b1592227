use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, PartialEq, Clone)]
pub struct Constituent<T> {
  pub value: T,
  pub span: (usize, usize),
}

#[derive(Debug, PartialEq, Clone)]
pub struct Word<U> {
  pub value: U,
  pub span: (usize, usize),
}

#[derive(Debug, PartialEq, Clone)]
pub enum SynTree<T, U> {
  Branch(Constituent<T>, Vec<SynTree<T, U>>),
  Leaf(Word<U>),
}

impl<T, U> SynTree<T, U> {
  pub fn branch(value: T, span: (usize, usize), children: Vec<SynTree<T, U>>) -> Self {
    Self::Branch(Constituent { value, span }, children)
  }

  pub fn leaf(value: U, position: usize) -> Self {
    Self::Leaf(Word {
      value,
      span: (position, position + 1),
    })
  }

  pub fn is_leaf(&self) -> bool {
    matches!(self, Self::Leaf(_))
  }

  pub fn is_branch(&self) -> bool {
    matches!(self, Self::Branch(_, _))
  }

  pub fn span(&self) -> (usize, usize) {
    match self {
      Self::Branch(c, _) => c.span,
      Self::Leaf(w) => w.span,
    }
  }

  pub fn get_branch(&self) -> Option<(&Constituent<T>, &Vec<SynTree<T, U>>)> {
    match self {
      Self::Branch(c, cs) => Some((c, cs)),
      _ => None,
    }
  }

  /// A branch whose only child is a leaf.
  pub fn is_preterminal(&self) -> bool {
    match self {
      Self::Branch(_, cs) => cs.len() == 1 && cs[0].is_leaf(),
      _ => false,
    }
  }

  /// Number of single-child branch nodes directly below this one before the
  /// chain reaches a preterminal, a branching node, or a leaf.
  pub fn unary_chain_height(&self) -> usize {
    match self {
      Self::Branch(_, cs) if cs.len() == 1 && cs[0].is_branch() => 1 + cs[0].unary_chain_height(),
      _ => 0,
    }
  }

  pub fn leaves(&self) -> Vec<&U> {
    let mut out = Vec::new();
    self.collect_leaves(&mut out);
    out
  }

  fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a U>) {
    match self {
      Self::Leaf(w) => out.push(&w.value),
      Self::Branch(_, cs) => cs.iter().for_each(|c| c.collect_leaves(out)),
    }
  }

  pub fn map<V, W>(
    &self,
    map_branch: fn(&Constituent<T>) -> V,
    map_leaf: fn(&Word<U>) -> W,
  ) -> SynTree<V, W> {
    match self {
      Self::Branch(t, children) => {
        let children = children
          .iter()
          .map(|c| c.map(map_branch, map_leaf))
          .collect::<Vec<_>>();
        SynTree::Branch(
          Constituent {
            span: t.span,
            value: map_branch(t),
          },
          children,
        )
      }
      Self::Leaf(u) => SynTree::Leaf(Word {
        span: u.span,
        value: map_leaf(u),
      }),
    }
  }
}

impl<T: fmt::Display, U: fmt::Display> SynTree<T, U> {
  /// `(S (NP a) (VP b))`
  pub fn to_bracketed(&self) -> String {
    self.to_string()
  }
}

/// Renders the tree in bracketed form: `(S (NP a) (VP b))`
impl<T, U> fmt::Display for SynTree<T, U>
where
  T: fmt::Display,
  U: fmt::Display,
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Leaf(w) => write!(f, "{}", w.value),
      Self::Branch(c, cs) => {
        write!(f, "({}", c.value)?;
        for child in cs.iter() {
          write!(f, " {}", child)?;
        }
        write!(f, ")")
      }
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token<'a> {
  Open,
  Close,
  Atom(&'a str),
}

fn tokenize(s: &str) -> Vec<Token<'_>> {
  let mut tokens = Vec::new();
  let mut atom_start: Option<usize> = None;
  for (idx, c) in s.char_indices() {
    if c == '(' || c == ')' || c.is_whitespace() {
      if let Some(start) = atom_start.take() {
        tokens.push(Token::Atom(&s[start..idx]));
      }
      match c {
        '(' => tokens.push(Token::Open),
        ')' => tokens.push(Token::Close),
        _ => {}
      }
    } else if atom_start.is_none() {
      atom_start = Some(idx);
    }
  }
  if let Some(start) = atom_start {
    tokens.push(Token::Atom(&s[start..]));
  }
  tokens
}

fn parse_node(tokens: &[Token], pos: &mut usize, words: &mut usize) -> Result<SynTree<String, String>> {
  match tokens.get(*pos) {
    Some(Token::Atom(a)) => {
      *pos += 1;
      *words += 1;
      Ok(SynTree::leaf(a.to_string(), *words - 1))
    }
    Some(Token::Open) => {
      *pos += 1;
      let label = if let Some(Token::Atom(a)) = tokens.get(*pos) {
        *pos += 1;
        a.to_string()
      } else {
        String::new()
      };
      let start = *words;
      let mut children = Vec::new();
      loop {
        match tokens.get(*pos) {
          Some(Token::Close) => {
            *pos += 1;
            break;
          }
          None => return Err(Error::tree("unbalanced parentheses")),
          _ => children.push(parse_node(tokens, pos, words)?),
        }
      }
      if children.is_empty() {
        return Err(Error::tree(format!("constituent '{}' has no children", label)));
      }
      Ok(SynTree::branch(label, (start, *words), children))
    }
    Some(Token::Close) => Err(Error::tree("unexpected ')'")),
    None => Err(Error::tree("empty tree")),
  }
}

/// Reads a bracketed tree such as `(S (NP (DT the) (NN dog)) (VP barks))`.
/// An unlabeled outer bracket around a single tree, as in treebank files, is dropped.
pub fn parse_bracketed(s: &str) -> Result<SynTree<String, String>> {
  let tokens = tokenize(s);
  let mut pos = 0;
  let mut words = 0;
  let tree = parse_node(&tokens, &mut pos, &mut words)?;
  if pos != tokens.len() {
    return Err(Error::tree("trailing input after tree"));
  }
  match tree {
    SynTree::Branch(c, mut cs) if c.value.is_empty() && cs.len() == 1 => Ok(cs.remove(0)),
    SynTree::Branch(c, _) if c.value.is_empty() => Err(Error::tree("unlabeled constituent")),
    SynTree::Leaf(_) => Err(Error::tree("a tree must be bracketed")),
    t => Ok(t),
  }
}
