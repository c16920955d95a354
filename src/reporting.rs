//! Diagnostics: cause trees, constraint errors, and the pretty-printing
//! contract consumed by error rendering.
//!
//! Errors are data. Elaboration and solver failures propagate as values
//! and bottom out in a [`ConstraintError`]; rendering walks the cause tree
//! on demand through the [`PrettyPrint`] contract. The solver never
//! inspects causes — they exist for humans only.

use std::fmt;
use std::sync::Arc;

use pretty::{BoxAllocator, DocAllocator, DocBuilder};

use crate::context::TypingContext;
use crate::core::semantics::{ArcValue, FreeVar, Stuck, Value};
use crate::core::EffectId;
use crate::source::Span;
use crate::{StringId, StringInterner};

/// Why an edge exists: a tree of reasons.
///
/// Primitive causes record a reason at a span; nesting marks a constraint
/// discharged on behalf of another; composition records that an edge was
/// derived from two earlier edges. Constraints queued while unpacking a
/// `range` value bypass the normal chain and are tagged [`Cause::Lost`].
#[derive(Debug, Clone)]
pub enum Cause {
    Primitive {
        reason: &'static str,
        span: Span,
    },
    Nested {
        reason: &'static str,
        inner: Arc<Cause>,
    },
    Composed {
        left: Arc<Cause>,
        right: Arc<Cause>,
    },
    Lost,
}

impl Cause {
    pub fn primitive(reason: &'static str, span: Span) -> Arc<Cause> {
        Arc::new(Cause::Primitive { reason, span })
    }

    pub fn nested(reason: &'static str, inner: Arc<Cause>) -> Arc<Cause> {
        Arc::new(Cause::Nested { reason, inner })
    }

    pub fn composed(left: Arc<Cause>, right: Arc<Cause>) -> Arc<Cause> {
        Arc::new(Cause::Composed { left, right })
    }

    pub fn lost() -> Arc<Cause> {
        Arc::new(Cause::Lost)
    }

    fn write(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        for _ in 0..depth {
            write!(f, "  ")?;
        }
        match self {
            Cause::Primitive { reason, span } => writeln!(f, "- {} at {}", reason, span),
            Cause::Nested { reason, inner } => {
                writeln!(f, "- {}, while:", reason)?;
                inner.write(f, depth + 1)
            }
            Cause::Composed { left, right } => {
                writeln!(f, "- composed from:")?;
                left.write(f, depth + 1)?;
                right.write(f, depth + 1)
            }
            Cause::Lost => writeln!(f, "- (cause lost unpacking a range)"),
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write(f, 0)
    }
}

/// A failed subtype obligation. Every error in the crate ultimately
/// bottoms out in one of these.
#[derive(Debug, Clone)]
pub struct ConstraintError<'arena> {
    /// What went wrong, in words.
    pub desc: String,
    pub left: ArcValue<'arena>,
    pub left_ctx: TypingContext<'arena>,
    /// The relation that failed, by name.
    pub op: &'static str,
    pub right: ArcValue<'arena>,
    pub right_ctx: TypingContext<'arena>,
    pub cause: Arc<Cause>,
}

impl<'arena> ConstraintError<'arena> {
    /// Render with names resolved through the interner.
    pub fn render(&self, interner: &StringInterner) -> String {
        let alloc = BoxAllocator;
        let left = self.left.to_doc(interner, &alloc).pretty(80).to_string();
        let right = self.right.to_doc(interner, &alloc).pretty(80).to_string();
        format!(
            "{}: `{}` {} `{}`\n{}",
            self.desc, left, self.op, right, self.cause
        )
    }
}

/// Recoverable errors from elaboration and the solver.
#[derive(Debug, Clone)]
pub enum Error<'arena> {
    /// A subtype obligation failed at a concrete head check.
    Constraint(Box<ConstraintError<'arena>>),
    /// A function type was expected during elaboration.
    NotAFunction {
        span: Span,
        found: ArcValue<'arena>,
    },
    /// A record type was expected during elaboration.
    NotARecord {
        span: Span,
        found: ArcValue<'arena>,
    },
    /// A program type was expected during elaboration.
    NotAProgram {
        span: Span,
        found: ArcValue<'arena>,
    },
    /// An enum elimination is missing a variant its subject can carry.
    MissingVariant {
        variant: StringId,
        suggestion: Option<StringId>,
    },
    /// A record is missing a required field.
    MissingField { field: StringId },
    /// Two tuple descriptors disagree on arity.
    TupleLengthMismatch { found: usize, expected: usize },
    /// A native call failed.
    HostFunction {
        name: &'static str,
        message: String,
    },
    /// No host function is registered for an intrinsic source string.
    UnknownIntrinsic { source: String },
    /// No handler is registered for a program effect.
    UnknownEffectHandler { effect: EffectId },
    /// Level arithmetic climbed past the top of the lattice.
    LevelOverflow { span: Span },
    /// A path the original system leaves unfinished.
    NotImplemented(&'static str),
}

impl<'arena> Error<'arena> {
    pub fn description(&self) -> &'static str {
        match self {
            Error::Constraint(_) => "subtype constraint failed",
            Error::NotAFunction { .. } => "expected a function type",
            Error::NotARecord { .. } => "expected a record type",
            Error::NotAProgram { .. } => "expected a program type",
            Error::MissingVariant { .. } => "missing enum variant",
            Error::MissingField { .. } => "missing record field",
            Error::TupleLengthMismatch { .. } => "tuple length mismatch",
            Error::HostFunction { .. } => "host function failed",
            Error::UnknownIntrinsic { .. } => "unknown intrinsic source",
            Error::UnknownEffectHandler { .. } => "no handler for effect",
            Error::LevelOverflow { .. } => "universe level above omega",
            Error::NotImplemented(_) => "not implemented",
        }
    }

    /// Render with names resolved through the interner.
    pub fn render(&self, interner: &StringInterner) -> String {
        match self {
            Error::Constraint(error) => error.render(interner),
            Error::MissingVariant {
                variant,
                suggestion,
            } => {
                let variant = interner.resolve(*variant).unwrap_or("?");
                match suggestion.and_then(|name| interner.resolve(name)) {
                    Some(suggestion) => {
                        format!("missing enum variant `{variant}` (did you mean `{suggestion}`?)")
                    }
                    None => format!("missing enum variant `{variant}`"),
                }
            }
            Error::MissingField { field } => {
                format!(
                    "missing record field `{}`",
                    interner.resolve(*field).unwrap_or("?")
                )
            }
            _ => format!("{self}"),
        }
    }
}

impl<'arena> fmt::Display for Error<'arena> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Constraint(error) => {
                write!(f, "{}\n{}", error.desc, error.cause)
            }
            Error::NotAFunction { span, .. } => write!(f, "expected a function type at {}", span),
            Error::NotARecord { span, .. } => write!(f, "expected a record type at {}", span),
            Error::NotAProgram { span, .. } => write!(f, "expected a program type at {}", span),
            Error::MissingVariant { .. } => write!(f, "missing enum variant"),
            Error::MissingField { .. } => write!(f, "missing record field"),
            Error::TupleLengthMismatch { found, expected } => {
                write!(f, "tuple has {} elements, expected {}", found, expected)
            }
            Error::HostFunction { name, message } => {
                write!(f, "host function `{}` failed: {}", name, message)
            }
            Error::UnknownIntrinsic { source } => {
                write!(f, "no host function registered for intrinsic `{}`", source)
            }
            Error::UnknownEffectHandler { effect } => {
                write!(f, "no handler registered for effect {}", effect.0)
            }
            Error::LevelOverflow { span } => {
                write!(f, "universe level above omega at {}", span)
            }
            Error::NotImplemented(feature) => write!(f, "not implemented: {}", feature),
        }
    }
}

/// The pretty-printing contract consumed by error rendering. The core does
/// not pretty-print programs; it renders the heads of values well enough
/// for a human to follow a cause chain.
pub trait PrettyPrint {
    fn to_doc<'a>(
        &self,
        interner: &StringInterner,
        alloc: &'a BoxAllocator,
    ) -> DocBuilder<'a, BoxAllocator>;
}

impl<'arena> PrettyPrint for Value<'arena> {
    fn to_doc<'a>(
        &self,
        interner: &StringInterner,
        alloc: &'a BoxAllocator,
    ) -> DocBuilder<'a, BoxAllocator> {
        match self {
            Value::Stuck(stuck) => stuck.to_doc(interner, alloc),
            Value::FunType {
                param_type, result, ..
            } => alloc
                .text("(")
                .append(param_type.to_doc(interner, alloc))
                .append(alloc.text(" -> "))
                .append(result.to_doc(interner, alloc))
                .append(alloc.text(")")),
            Value::HostFunType {
                param_type, result, ..
            } => alloc
                .text("(host ")
                .append(param_type.to_doc(interner, alloc))
                .append(alloc.text(" -> "))
                .append(result.to_doc(interner, alloc))
                .append(alloc.text(")")),
            Value::FunLit(_) => alloc.text("<function>"),
            Value::TupleLit(elems) => alloc
                .text("tuple(")
                .append(alloc.intersperse(
                    elems.iter().map(|elem| elem.to_doc(interner, alloc)),
                    alloc.text(", "),
                ))
                .append(alloc.text(")")),
            Value::HostTupleLit(elems) => alloc.text(format!("host-tuple/{}", elems.len())),
            Value::RecordLit(fields) => alloc
                .text("record{")
                .append(alloc.intersperse(
                    fields
                        .iter()
                        .map(|(label, _)| alloc.text(resolve(interner, *label))),
                    alloc.text(", "),
                ))
                .append(alloc.text("}")),
            Value::EnumLit(variant, payload) => alloc
                .text(resolve(interner, *variant))
                .append(alloc.text("("))
                .append(payload.to_doc(interner, alloc))
                .append(alloc.text(")")),
            Value::OperativeLit { .. } => alloc.text("<operative>"),
            Value::OperativeType { .. } => alloc.text("<operative type>"),
            Value::TupleType(desc) => alloc
                .text("tuple-type ")
                .append(desc.to_doc(interner, alloc)),
            Value::HostTupleType(desc) => alloc
                .text("host-tuple-type ")
                .append(desc.to_doc(interner, alloc)),
            Value::TupleDescType(universe) => alloc
                .text("tuple-desc-type ")
                .append(universe.to_doc(interner, alloc)),
            Value::EnumType(desc) => {
                alloc.text("enum-type ").append(desc.to_doc(interner, alloc))
            }
            Value::EnumDescType(universe) => alloc
                .text("enum-desc-type ")
                .append(universe.to_doc(interner, alloc)),
            Value::EnumDescLit(variants) => alloc
                .text("variants{")
                .append(alloc.intersperse(
                    variants
                        .iter()
                        .map(|(variant, _)| alloc.text(resolve(interner, *variant))),
                    alloc.text(", "),
                ))
                .append(alloc.text("}")),
            Value::RecordType(desc) => alloc
                .text("record-type ")
                .append(desc.to_doc(interner, alloc)),
            Value::RecordDescType(universe) => alloc
                .text("record-desc-type ")
                .append(universe.to_doc(interner, alloc)),
            Value::RecordDescLit(fields) => alloc
                .text("fields{")
                .append(alloc.intersperse(
                    fields
                        .iter()
                        .map(|(field, _)| alloc.text(resolve(interner, *field))),
                    alloc.text(", "),
                ))
                .append(alloc.text("}")),
            Value::HostTypeType => alloc.text("host-type"),
            Value::HostNumberType => alloc.text("host-number"),
            Value::HostStringType => alloc.text("host-string"),
            Value::HostBoolType => alloc.text("host-bool"),
            Value::HostUserDefinedType { id, .. } => alloc.text(format!("host-user-type/{}", id.0)),
            Value::HostWrappedType(inner) => alloc
                .text("host-wrapped ")
                .append(inner.to_doc(interner, alloc)),
            Value::SrelType(target) => {
                alloc.text("srel ").append(target.to_doc(interner, alloc))
            }
            Value::VarianceType(target) => alloc
                .text("variance ")
                .append(target.to_doc(interner, alloc)),
            Value::UnionType(left, right) => alloc
                .text("(")
                .append(left.to_doc(interner, alloc))
                .append(alloc.text(" | "))
                .append(right.to_doc(interner, alloc))
                .append(alloc.text(")")),
            Value::IntersectionType(left, right) => alloc
                .text("(")
                .append(left.to_doc(interner, alloc))
                .append(alloc.text(" & "))
                .append(right.to_doc(interner, alloc))
                .append(alloc.text(")")),
            Value::Singleton { supertype, .. } => alloc
                .text("singleton of ")
                .append(supertype.to_doc(interner, alloc)),
            Value::Star { level, depth } => alloc.text(format!("star({}, {})", level, depth)),
            Value::Prop => alloc.text("prop"),
            Value::LevelType => alloc.text("level-type"),
            Value::Level(level) => alloc.text(format!("level {}", level)),
            Value::ProgramType { result, .. } => alloc
                .text("program ")
                .append(result.to_doc(interner, alloc)),
            Value::EffectRow(row) => alloc.text(format!("effects/{}", row.len())),
            Value::EffectElem(effect) => alloc.text(format!("effect {}", effect.0)),
            Value::Range { lower, upper, .. } => {
                alloc.text(format!("range[{}..{}]", lower.len(), upper.len()))
            }
            Value::Host(host) => alloc.text(format!("{:?}", host)),
            Value::ProgramEnd(_) => alloc.text("<program-end>"),
            Value::ProgramYield { effect, .. } => {
                alloc.text(format!("<program-yield {}>", effect.0))
            }
        }
    }
}

impl<'arena> PrettyPrint for Stuck<'arena> {
    fn to_doc<'a>(
        &self,
        interner: &StringInterner,
        alloc: &'a BoxAllocator,
    ) -> DocBuilder<'a, BoxAllocator> {
        match self {
            Stuck::Free(FreeVar::Placeholder(level, name)) => alloc.text(format!(
                "{}#{}",
                resolve(interner, name.name),
                level.to_usize()
            )),
            Stuck::Free(FreeVar::Unique(id)) => alloc.text(format!("unique#{}", id.0)),
            Stuck::Free(FreeVar::Meta(meta)) => alloc.text(format!(
                "?{}~{}",
                meta.value.to_usize(),
                meta.usage.to_usize()
            )),
            Stuck::FunApp(head, arg) => head
                .to_doc(interner, alloc)
                .append(alloc.text(" "))
                .append(arg.to_doc(interner, alloc)),
            Stuck::TupleProj(head, index) => head
                .to_doc(interner, alloc)
                .append(alloc.text(format!(".{}", index))),
            Stuck::RecordProj(head, label) => head
                .to_doc(interner, alloc)
                .append(alloc.text(format!(".{}", resolve(interner, *label)))),
            Stuck::HostApp(fun, arg) => alloc
                .text(format!("{} ", fun.name()))
                .append(arg.to_doc(interner, alloc)),
            Stuck::HostTuple(prefix, _, trailing) => {
                alloc.text(format!("host-tuple/{}+1+{}", prefix.len(), trailing.len()))
            }
            Stuck::HostWrap(inner) => {
                alloc.text("wrap ").append(inner.to_doc(interner, alloc))
            }
            Stuck::HostUnwrap(inner) => {
                alloc.text("unwrap ").append(inner.to_doc(interner, alloc))
            }
            Stuck::HostIntFold { count, .. } => alloc
                .text("fold ")
                .append(count.to_doc(interner, alloc)),
            Stuck::HostIf { subject, .. } => {
                alloc.text("if ").append(subject.to_doc(interner, alloc))
            }
            Stuck::EnumElim { subject, .. } => {
                alloc.text("case ").append(subject.to_doc(interner, alloc))
            }
            Stuck::EnumAbsurd(subject) => {
                alloc.text("absurd ").append(subject.to_doc(interner, alloc))
            }
            Stuck::HostIntrinsic { source, .. } => alloc
                .text("intrinsic ")
                .append(source.to_doc(interner, alloc)),
            Stuck::ProgramSequence { first, .. } => {
                alloc.text("seq ").append(first.to_doc(interner, alloc))
            }
        }
    }
}

fn resolve(interner: &StringInterner, name: StringId) -> String {
    interner.resolve(name).unwrap_or("?").to_owned()
}
