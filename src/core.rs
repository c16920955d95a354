//! The core language: fully elaborated terms, directly executable by the
//! evaluator.
//!
//! Every variant carries its [`Span`] as the first field, and every binder
//! carries a non-optional [`SpannedName`]: terms invented by the elaborator
//! use [`Span::Empty`], but there is no way to construct a binder without
//! debug information. Kind dispatch is enum-tag dispatch and name equality
//! is interned-symbol equality, so the hot paths never compare strings.

use crate::core::semantics::ArcValue;
use crate::env::Index;
use crate::solver::{ConstraintElem, Metavariable};
use crate::source::{Span, SpannedName};
use crate::StringId;

pub mod prim;
pub mod program;
pub mod semantics;
pub mod subst;

/// The ceiling of the universe level lattice. Level arithmetic that would
/// exceed it is an explicit not-implemented error.
pub const OMEGA: usize = 9;

/// Whether a function parameter is written by the user or inserted by the
/// elaborator.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Plicity {
    Explicit,
    Implicit,
}

/// Whether applying a function can perform effects.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Purity {
    Pure,
    Effectful,
}

/// A fresh token free variable, used as an opaque witness for parametric
/// reasoning.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct UniqueId(pub u64);

/// Identifies a program effect.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EffectId(pub u32);

/// Identifies a host-defined type family.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HostTypeId(pub u32);

/// Core language terms.
#[derive(Debug, Clone)]
pub enum Term<'arena> {
    /// Bound variable occurrences. The debug information must agree with
    /// the context entry the index resolves to.
    Var(Span, Index, SpannedName),
    /// Metavariable references.
    Meta(Span, Metavariable),
    /// Unique token free variables.
    UniqueToken(Span, UniqueId),
    /// A literal, fully evaluated value.
    Literal(Span, ArcValue<'arena>),
    /// Annotated expressions.
    Ann(Span, &'arena Term<'arena>, &'arena Term<'arena>),
    /// Let expressions.
    Let(Span, SpannedName, &'arena Term<'arena>, &'arena Term<'arena>),

    /// Dependent function types. The result field evaluates to a function
    /// from the parameter value to the result type.
    FunType(
        Span,
        Plicity,
        Purity,
        &'arena Term<'arena>,
        &'arena Term<'arena>,
    ),
    /// Function introductions with an explicit capture. The capture term is
    /// evaluated at the definition site; the body is evaluated in a context
    /// of exactly `[capture, argument]`.
    FunLit {
        span: Span,
        param: SpannedName,
        capture_name: SpannedName,
        capture: &'arena Term<'arena>,
        body: &'arena Term<'arena>,
    },
    /// Function eliminations.
    FunApp(Span, &'arena Term<'arena>, &'arena Term<'arena>),
    /// Host function types.
    HostFunType(Span, Purity, &'arena Term<'arena>, &'arena Term<'arena>),

    /// Tuple introductions.
    TupleLit(Span, &'arena [Term<'arena>]),
    /// Host tuple introductions.
    HostTupleLit(Span, &'arena [Term<'arena>]),
    /// Tuple element access.
    TupleProj(Span, &'arena Term<'arena>, usize),
    /// Tuple eliminations, binding every element at once.
    TupleElim {
        span: Span,
        names: &'arena [SpannedName],
        subject: &'arena Term<'arena>,
        body: &'arena Term<'arena>,
    },
    /// Tuple types, from a descriptor.
    TupleType(Span, &'arena Term<'arena>),
    /// Host tuple types, from a descriptor.
    HostTupleType(Span, &'arena Term<'arena>),

    /// Record introductions.
    RecordLit(Span, &'arena [StringId], &'arena [Term<'arena>]),
    /// Record field access.
    RecordProj(Span, &'arena Term<'arena>, StringId),
    /// Record eliminations, binding the requested fields.
    RecordElim {
        span: Span,
        subject: &'arena Term<'arena>,
        fields: &'arena [StringId],
        names: &'arena [SpannedName],
        body: &'arena Term<'arena>,
    },
    /// Record types, from a descriptor.
    RecordType(Span, &'arena Term<'arena>),

    /// Record descriptors: field names with their type functions.
    RecordDescLit(Span, &'arena [StringId], &'arena [Term<'arena>]),

    /// Enum introductions.
    EnumLit(Span, StringId, &'arena Term<'arena>),
    /// Enum descriptors: variant names with their payload types.
    EnumDescLit(Span, &'arena [StringId], &'arena [Term<'arena>]),
    /// Enum eliminations. Each arm evaluates to a function of the variant
    /// payload.
    EnumElim {
        span: Span,
        subject: &'arena Term<'arena>,
        arms: &'arena [(StringId, Term<'arena>)],
    },
    /// Elimination of the empty enum.
    EnumAbsurd(Span, &'arena Term<'arena>),
    /// Enum types, from a descriptor.
    EnumType(Span, &'arena Term<'arena>),

    /// Universes, indexed by level and depth.
    Star(Span, usize, usize),
    /// The universe of propositions.
    Prop(Span),
    /// The type of universe levels.
    LevelType(Span),
    /// Level zero.
    Level0(Span),
    /// Level successor.
    LevelSuc(Span, &'arena Term<'arena>),
    /// Level maximum.
    LevelMax(Span, &'arena Term<'arena>, &'arena Term<'arena>),

    /// Singleton types: the subtype of the supertype containing exactly the
    /// witness.
    Singleton(Span, &'arena Term<'arena>, &'arena Term<'arena>),
    /// Union types.
    UnionType(Span, &'arena Term<'arena>, &'arena Term<'arena>),
    /// Intersection types.
    IntersectionType(Span, &'arena Term<'arena>, &'arena Term<'arena>),
    /// A deferred metavariable carrying its sliced constraints. Evaluation
    /// allocates a fresh metavariable and re-registers every constraint
    /// against it.
    ConstrainedType(Span, &'arena [ConstraintElem<'arena>]),

    /// Wrap a value into the host layer.
    HostWrap(Span, &'arena Term<'arena>),
    /// Unwrap a host-layer value.
    HostUnwrap(Span, &'arena Term<'arena>),
    /// Bounded iteration: apply `fun` from `count` down to 1, threading the
    /// accumulator.
    HostIntFold(
        Span,
        &'arena Term<'arena>,
        &'arena Term<'arena>,
        &'arena Term<'arena>,
    ),
    /// Host booleans eliminator.
    HostIf {
        span: Span,
        subject: &'arena Term<'arena>,
        consequent: &'arena Term<'arena>,
        alternate: &'arena Term<'arena>,
    },
    /// A host function compiled from a source string, at the given type.
    HostIntrinsic {
        span: Span,
        source: &'arena Term<'arena>,
        r#type: &'arena Term<'arena>,
    },

    /// Sequencing of effect programs.
    ProgramSequence(Span, &'arena Term<'arena>, &'arena Term<'arena>),
    /// A finished effect program.
    ProgramEnd(Span, &'arena Term<'arena>),
    /// Invocation of a program effect.
    ProgramInvoke(Span, &'arena Term<'arena>, &'arena Term<'arena>),
    /// The type of effect programs.
    ProgramType(Span, &'arena Term<'arena>, &'arena Term<'arena>),
}

impl<'arena> Term<'arena> {
    pub fn span(&self) -> Span {
        match self {
            Term::Var(span, ..)
            | Term::Meta(span, ..)
            | Term::UniqueToken(span, ..)
            | Term::Literal(span, ..)
            | Term::Ann(span, ..)
            | Term::Let(span, ..)
            | Term::FunType(span, ..)
            | Term::FunLit { span, .. }
            | Term::FunApp(span, ..)
            | Term::HostFunType(span, ..)
            | Term::TupleLit(span, ..)
            | Term::HostTupleLit(span, ..)
            | Term::TupleProj(span, ..)
            | Term::TupleElim { span, .. }
            | Term::TupleType(span, ..)
            | Term::HostTupleType(span, ..)
            | Term::RecordLit(span, ..)
            | Term::RecordProj(span, ..)
            | Term::RecordElim { span, .. }
            | Term::RecordType(span, ..)
            | Term::RecordDescLit(span, ..)
            | Term::EnumLit(span, ..)
            | Term::EnumDescLit(span, ..)
            | Term::EnumElim { span, .. }
            | Term::EnumAbsurd(span, ..)
            | Term::EnumType(span, ..)
            | Term::Star(span, ..)
            | Term::Prop(span)
            | Term::LevelType(span)
            | Term::Level0(span)
            | Term::LevelSuc(span, ..)
            | Term::LevelMax(span, ..)
            | Term::Singleton(span, ..)
            | Term::UnionType(span, ..)
            | Term::IntersectionType(span, ..)
            | Term::ConstrainedType(span, ..)
            | Term::HostWrap(span, ..)
            | Term::HostUnwrap(span, ..)
            | Term::HostIntFold(span, ..)
            | Term::HostIf { span, .. }
            | Term::HostIntrinsic { span, .. }
            | Term::ProgramSequence(span, ..)
            | Term::ProgramEnd(span, ..)
            | Term::ProgramInvoke(span, ..)
            | Term::ProgramType(span, ..) => *span,
        }
    }
}
