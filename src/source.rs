//! Types related to source positions.
//!
//! The core never reads source text: positions arrive on terms built by the
//! parser layer and are carried through elaboration and evaluation as debug
//! information. Every binder owns a [`SpannedName`], and a context lookup
//! that disagrees with the binder's recorded name is a fatal bug upstream.

use std::fmt;

/// Identifies a source file in the embedder's file store.
pub type FileId = u32;

/// A position in a source file.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Anchor {
    pub file: FileId,
    pub line: u32,
    pub column: u32,
}

impl Anchor {
    pub const fn new(file: FileId, line: u32, column: u32) -> Anchor {
        Anchor { file, line, column }
    }
}

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// A source span: a start and end anchor, or nothing at all for terms the
/// elaborator invents itself.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Span {
    Range(Anchor, Anchor),
    Empty,
}

impl Span {
    pub fn merge(&self, other: &Span) -> Span {
        match (self, other) {
            (Span::Range(start0, end0), Span::Range(start1, end1))
                if start0.file == start1.file =>
            {
                Span::Range(Ord::min(*start0, *start1), Ord::max(*end0, *end1))
            }
            (_, _) => Span::Empty,
        }
    }

    pub fn start(&self) -> Option<Anchor> {
        match self {
            Span::Range(start, _) => Some(*start),
            Span::Empty => None,
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Span::Range(start, end) => write!(f, "{}-{}:{}", start, end.line, end.column),
            Span::Empty => write!(f, "<no span>"),
        }
    }
}

impl From<(Anchor, Anchor)> for Span {
    fn from((start, end): (Anchor, Anchor)) -> Span {
        Span::Range(start, end)
    }
}

/// Debug information attached to a binder: the surface name together with
/// the span it was written at.
///
/// These are threaded into runtime contexts and compared on every variable
/// lookup. Equality covers both fields: a binder that resolves to an entry
/// recorded under different debug information indicates a de Bruijn error
/// in whatever produced the term.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SpannedName {
    pub name: crate::StringId,
    pub span: Span,
}

impl SpannedName {
    pub const fn new(name: crate::StringId, span: Span) -> SpannedName {
        SpannedName { name, span }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// `Span` is carried on every term variant. Ensure it doesn't grow
    /// accidentally.
    fn span_size() {
        assert_eq!(std::mem::size_of::<Span>(), 28);
    }

    #[test]
    fn merge_spans() {
        let a = Anchor::new(0, 1, 4);
        let b = Anchor::new(0, 2, 1);
        let c = Anchor::new(0, 3, 9);
        let left = Span::Range(a, b);
        let right = Span::Range(b, c);
        assert_eq!(left.merge(&right), Span::Range(a, c));
        assert_eq!(left.merge(&Span::Empty), Span::Empty);
    }

    #[test]
    fn merge_spans_across_files() {
        let left = Span::Range(Anchor::new(0, 1, 1), Anchor::new(0, 1, 5));
        let right = Span::Range(Anchor::new(1, 1, 1), Anchor::new(1, 1, 5));
        assert_eq!(left.merge(&right), Span::Empty);
    }
}
