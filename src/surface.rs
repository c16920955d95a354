//! The surface language: the boundary with the parser and operative
//! layer.
//!
//! The core receives already-built [inferrable terms][Term] — name
//! resolution has happened upstream, so variables arrive as de Bruijn
//! indices carrying the debug information of their binder. [Checkable
//! terms][Checkable] are consumed against a goal type by
//! [`check`][elaboration::Elaborator::check].

use crate::core::semantics::ArcValue;
use crate::core::subst::Usages;
use crate::core::{Plicity, Purity};
use crate::env::Index;
use crate::source::{Span, SpannedName};
use crate::StringId;

pub mod elaboration;

/// Surface terms whose type can be synthesised.
#[derive(Debug, Clone)]
pub enum Term<'arena> {
    /// Bound variable occurrences.
    Var(Span, Index, SpannedName),
    /// Lambdas with an annotated parameter.
    Lambda {
        span: Span,
        param: SpannedName,
        plicity: Plicity,
        purity: Purity,
        param_type: &'arena Term<'arena>,
        body: &'arena Term<'arena>,
    },
    /// Dependent function types.
    Pi {
        span: Span,
        param: SpannedName,
        plicity: Plicity,
        purity: Purity,
        param_type: &'arena Term<'arena>,
        body_type: &'arena Term<'arena>,
    },
    /// Applications.
    App(Span, &'arena Term<'arena>, &'arena Term<'arena>),

    /// Tuple introductions.
    TupleLit(Span, &'arena [Term<'arena>]),
    /// Tuple eliminations.
    TupleElim {
        span: Span,
        names: &'arena [SpannedName],
        subject: &'arena Term<'arena>,
        body: &'arena Term<'arena>,
    },
    /// Tuple types, from a descriptor expression.
    TupleType(Span, &'arena Term<'arena>),
    /// Host tuple types, from a descriptor expression.
    HostTupleType(Span, &'arena Term<'arena>),

    /// Record introductions.
    RecordLit(Span, &'arena [StringId], &'arena [Term<'arena>]),
    /// Record eliminations, binding the requested fields.
    RecordElim {
        span: Span,
        subject: &'arena Term<'arena>,
        fields: &'arena [StringId],
        names: &'arena [SpannedName],
        body: &'arena Term<'arena>,
    },

    /// Enum introductions.
    EnumLit(Span, StringId, &'arena Term<'arena>),
    /// Enum case analysis. Each arm binds the variant payload.
    EnumCase {
        span: Span,
        subject: &'arena Term<'arena>,
        arms: &'arena [(StringId, SpannedName, Term<'arena>)],
    },
    /// Enum types, from a descriptor expression.
    EnumType(Span, &'arena Term<'arena>),

    /// A host function compiled from a source string, at an annotated
    /// type.
    HostIntrinsic {
        span: Span,
        source: &'arena Term<'arena>,
        r#type: &'arena Term<'arena>,
    },
    /// Host function types.
    HostFunType {
        span: Span,
        purity: Purity,
        param: SpannedName,
        param_type: &'arena Term<'arena>,
        body_type: &'arena Term<'arena>,
    },
    /// Host boolean elimination.
    HostIf {
        span: Span,
        subject: &'arena Term<'arena>,
        consequent: &'arena Term<'arena>,
        alternate: &'arena Term<'arena>,
    },

    /// Universes.
    Star(Span, usize, usize),
    /// The universe of propositions.
    Prop(Span),
    /// The type of levels.
    LevelType(Span),
    /// Level zero.
    Level0(Span),
    /// Level successor.
    LevelSuc(Span, &'arena Term<'arena>),
    /// Level maximum.
    LevelMax(Span, &'arena Term<'arena>, &'arena Term<'arena>),

    /// Let expressions.
    Let {
        span: Span,
        name: SpannedName,
        def: &'arena Term<'arena>,
        body: &'arena Term<'arena>,
    },

    /// Sequencing of effect programs.
    ProgramSequence(Span, &'arena Term<'arena>, &'arena Term<'arena>),
    /// A finished effect program.
    ProgramEnd(Span, &'arena Term<'arena>),
    /// Invocation of a program effect.
    ProgramInvoke(Span, &'arena Term<'arena>, &'arena Term<'arena>),
    /// The type of effect programs.
    ProgramType(Span, &'arena Term<'arena>, &'arena Term<'arena>),

    /// Annotated expressions.
    Ann(Span, &'arena Term<'arena>, &'arena Term<'arena>),
    /// A term that has already been elaborated, with its type, usages and
    /// typed form attached.
    Typed {
        span: Span,
        r#type: ArcValue<'arena>,
        usages: Usages,
        term: &'arena crate::core::Term<'arena>,
    },
}

impl<'arena> Term<'arena> {
    pub fn span(&self) -> Span {
        match self {
            Term::Var(span, ..)
            | Term::Lambda { span, .. }
            | Term::Pi { span, .. }
            | Term::App(span, ..)
            | Term::TupleLit(span, ..)
            | Term::TupleElim { span, .. }
            | Term::TupleType(span, ..)
            | Term::HostTupleType(span, ..)
            | Term::RecordLit(span, ..)
            | Term::RecordElim { span, .. }
            | Term::EnumLit(span, ..)
            | Term::EnumCase { span, .. }
            | Term::EnumType(span, ..)
            | Term::HostIntrinsic { span, .. }
            | Term::HostFunType { span, .. }
            | Term::HostIf { span, .. }
            | Term::Star(span, ..)
            | Term::Prop(span)
            | Term::LevelType(span)
            | Term::Level0(span)
            | Term::LevelSuc(span, ..)
            | Term::LevelMax(span, ..)
            | Term::Let { span, .. }
            | Term::ProgramSequence(span, ..)
            | Term::ProgramEnd(span, ..)
            | Term::ProgramInvoke(span, ..)
            | Term::ProgramType(span, ..)
            | Term::Ann(span, ..)
            | Term::Typed { span, .. } => *span,
        }
    }
}

/// Surface terms that are checked against a goal type.
#[derive(Debug, Clone)]
pub enum Checkable<'arena> {
    /// Synthesise and flow into the goal.
    Infer(&'arena Term<'arena>),
    /// Tuple introductions, elementwise against the goal's positions.
    TupleLit(Span, &'arena [Checkable<'arena>]),
    /// Host tuple introductions.
    HostTupleLit(Span, &'arena [Checkable<'arena>]),
    /// Unannotated lambdas; the goal must be a function type.
    Lambda {
        span: Span,
        param: SpannedName,
        body: &'arena Checkable<'arena>,
    },
}

impl<'arena> Checkable<'arena> {
    pub fn span(&self) -> Span {
        match self {
            Checkable::Infer(term) => term.span(),
            Checkable::TupleLit(span, ..)
            | Checkable::HostTupleLit(span, ..)
            | Checkable::Lambda { span, .. } => *span,
        }
    }
}
