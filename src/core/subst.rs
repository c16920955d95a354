//! Substitution: rebuilding typed terms from values.
//!
//! [`gather_usages`] walks a value and counts, per context position, how
//! often each placeholder occurs — metavariables contribute the usages of
//! every value reachable through the constraint edges touching them, since
//! their eventual slices will mention those values.
//!
//! [`substitute_inner`] rebuilds a typed term from a value, replacing each
//! placeholder according to a [`Mapping`]. A metavariable that cannot
//! outlive the current scope is replaced by a `constrained-type` term
//! carrying its sliced constraints.
//!
//! [`build_closure`] is the sole mechanism by which closures capture
//! bindings: it gathers the usages of a body value, builds a capture term
//! that tuples exactly the used bindings, and rebuilds the body behind a
//! tuple-elim that names them. The runtime context of the definition site
//! is never retained.

use std::panic::panic_any;
use std::sync::Arc;

use crate::context::TypingContext;
use crate::core::prim::HostValue;
use crate::core::semantics::{
    ArcValue, Closure, EvalContext, Fault, FreeVar, Stuck, Value,
};
use crate::core::Term;
use crate::env::{EnvLen, Index, Level};
use crate::reporting::Error;
use crate::solver::{Metavariable, TypecheckerState};
use crate::source::{Span, SpannedName};

/// Per-binding reference counts, indexed by level.
pub type Usages = Vec<usize>;

pub fn new_usages(len: EnvLen) -> Usages {
    vec![0; len.to_usize()]
}

pub fn add_usages(target: &mut Usages, source: &Usages) {
    for (target, source) in Iterator::zip(target.iter_mut(), source.iter()) {
        *target += source;
    }
}

/// A replacement for each placeholder level encountered during
/// substitution.
pub struct Mapping<'arena> {
    entries: Vec<Option<&'arena Term<'arena>>>,
}

impl<'arena> Mapping<'arena> {
    pub fn new(len: EnvLen) -> Mapping<'arena> {
        Mapping {
            entries: vec![None; len.to_usize()],
        }
    }

    pub fn set(&mut self, level: Level, term: &'arena Term<'arena>) {
        self.entries[level.to_usize()] = Some(term);
    }

    pub fn get(&self, level: Level) -> Option<&'arena Term<'arena>> {
        self.entries.get(level.to_usize()).copied().flatten()
    }

    /// The identity mapping over a context: each placeholder becomes the
    /// variable occurrence that resolves back to its own binding.
    pub fn identity(
        state: &TypecheckerState<'arena>,
        ctx: &TypingContext<'arena>,
    ) -> Mapping<'arena> {
        let len = ctx.len();
        let mut mapping = Mapping::new(len);
        for (position, entry) in ctx.runtime().entries().enumerate() {
            let level = Level::from_usize(position);
            let index = len.level_to_index(level).unwrap();
            let term = state
                .scope()
                .to_scope(Term::Var(Span::Empty, index, entry.name));
            mapping.set(level, term);
        }
        mapping
    }
}

/// Count placeholder occurrences in a value, per level.
pub fn gather_usages<'arena>(
    state: &TypecheckerState<'arena>,
    value: &ArcValue<'arena>,
    usages: &mut Usages,
    ctx_len: EnvLen,
) {
    let mut visited = Vec::new();
    gather(state, value, usages, ctx_len, &mut visited);
}

fn gather<'arena>(
    state: &TypecheckerState<'arena>,
    value: &ArcValue<'arena>,
    usages: &mut Usages,
    ctx_len: EnvLen,
    visited: &mut Vec<Metavariable>,
) {
    match value.as_ref() {
        Value::Stuck(stuck) => gather_stuck(state, stuck, usages, ctx_len, visited),

        Value::FunType {
            param_type, result, ..
        }
        | Value::HostFunType {
            param_type, result, ..
        } => {
            gather(state, param_type, usages, ctx_len, visited);
            gather(state, result, usages, ctx_len, visited);
        }
        Value::FunLit(closure) => gather(state, closure.capture(), usages, ctx_len, visited),

        Value::TupleLit(elems) => {
            for elem in elems {
                gather(state, elem, usages, ctx_len, visited);
            }
        }
        Value::HostTupleLit(elems) => {
            for elem in elems {
                gather_host(state, elem, usages, ctx_len, visited);
            }
        }
        Value::RecordLit(fields)
        | Value::EnumDescLit(fields)
        | Value::RecordDescLit(fields) => {
            for (_, value) in fields {
                gather(state, value, usages, ctx_len, visited);
            }
        }
        Value::EnumLit(_, payload) => gather(state, payload, usages, ctx_len, visited),

        Value::OperativeLit { handler, userdata } => {
            gather(state, handler, usages, ctx_len, visited);
            gather(state, userdata, usages, ctx_len, visited);
        }
        Value::OperativeType {
            handler,
            userdata_type,
        } => {
            gather(state, handler, usages, ctx_len, visited);
            gather(state, userdata_type, usages, ctx_len, visited);
        }

        Value::TupleType(inner)
        | Value::HostTupleType(inner)
        | Value::TupleDescType(inner)
        | Value::EnumType(inner)
        | Value::EnumDescType(inner)
        | Value::RecordType(inner)
        | Value::RecordDescType(inner)
        | Value::HostWrappedType(inner)
        | Value::SrelType(inner)
        | Value::VarianceType(inner)
        | Value::ProgramEnd(inner) => gather(state, inner, usages, ctx_len, visited),

        Value::HostUserDefinedType { args, .. } => {
            for arg in args {
                gather(state, arg, usages, ctx_len, visited);
            }
        }

        Value::UnionType(left, right) | Value::IntersectionType(left, right) => {
            gather(state, left, usages, ctx_len, visited);
            gather(state, right, usages, ctx_len, visited);
        }
        Value::Singleton { supertype, value } => {
            gather(state, supertype, usages, ctx_len, visited);
            gather(state, value, usages, ctx_len, visited);
        }

        Value::ProgramType { effects, result } => {
            gather(state, effects, usages, ctx_len, visited);
            gather(state, result, usages, ctx_len, visited);
        }
        Value::ProgramYield {
            arg, continuation, ..
        } => {
            gather(state, arg, usages, ctx_len, visited);
            for frame in continuation.frames() {
                for entry in frame.context().entries() {
                    gather(state, &entry.expr, usages, ctx_len, visited);
                }
            }
        }

        Value::Range { lower, upper, .. } => {
            for bound in lower.iter().chain(upper.iter()) {
                gather(state, bound, usages, ctx_len, visited);
            }
        }

        Value::Host(host) => gather_host(state, host, usages, ctx_len, visited),

        Value::HostTypeType
        | Value::HostNumberType
        | Value::HostStringType
        | Value::HostBoolType
        | Value::Star { .. }
        | Value::Prop
        | Value::LevelType
        | Value::Level(_)
        | Value::EffectRow(_)
        | Value::EffectElem(_) => {}
    }
}

fn gather_host<'arena>(
    state: &TypecheckerState<'arena>,
    host: &HostValue<'arena>,
    usages: &mut Usages,
    ctx_len: EnvLen,
    visited: &mut Vec<Metavariable>,
) {
    if let HostValue::Boxed(inner) = host {
        gather(state, inner, usages, ctx_len, visited);
    }
}

fn gather_stuck<'arena>(
    state: &TypecheckerState<'arena>,
    stuck: &Stuck<'arena>,
    usages: &mut Usages,
    ctx_len: EnvLen,
    visited: &mut Vec<Metavariable>,
) {
    match stuck {
        Stuck::Free(FreeVar::Placeholder(level, _)) => {
            if level.to_usize() < ctx_len.to_usize() {
                usages[level.to_usize()] += 1;
            }
        }
        Stuck::Free(FreeVar::Unique(_)) => {}
        Stuck::Free(FreeVar::Meta(meta)) => {
            // A metavariable drags along everything the constraint graph
            // ties to it: whatever its slice ends up mentioning must be
            // captured too.
            if !visited.contains(meta) {
                visited.push(*meta);
                for value in state.touching_values(*meta) {
                    gather(state, &value, usages, ctx_len, visited);
                }
            }
        }
        Stuck::FunApp(head, arg) => {
            gather_stuck(state, head, usages, ctx_len, visited);
            gather(state, arg, usages, ctx_len, visited);
        }
        Stuck::TupleProj(head, _) | Stuck::RecordProj(head, _) => {
            gather_stuck(state, head, usages, ctx_len, visited)
        }
        Stuck::HostApp(_, arg) => gather_stuck(state, arg, usages, ctx_len, visited),
        Stuck::HostTuple(prefix, middle, trailing) => {
            for elem in prefix {
                gather_host(state, elem, usages, ctx_len, visited);
            }
            gather_stuck(state, middle, usages, ctx_len, visited);
            for elem in trailing {
                gather(state, elem, usages, ctx_len, visited);
            }
        }
        Stuck::HostWrap(inner) | Stuck::HostUnwrap(inner) | Stuck::EnumAbsurd(inner) => {
            gather_stuck(state, inner, usages, ctx_len, visited)
        }
        Stuck::HostIntFold { count, fun, acc } => {
            gather_stuck(state, count, usages, ctx_len, visited);
            gather(state, fun, usages, ctx_len, visited);
            gather(state, acc, usages, ctx_len, visited);
        }
        Stuck::HostIf {
            subject,
            consequent,
            alternate,
        } => {
            gather_stuck(state, subject, usages, ctx_len, visited);
            gather(state, consequent, usages, ctx_len, visited);
            gather(state, alternate, usages, ctx_len, visited);
        }
        Stuck::EnumElim { subject, arms } => {
            gather_stuck(state, subject, usages, ctx_len, visited);
            for (_, arm) in arms {
                gather(state, arm, usages, ctx_len, visited);
            }
        }
        Stuck::HostIntrinsic { source, r#type } => {
            gather_stuck(state, source, usages, ctx_len, visited);
            gather(state, r#type, usages, ctx_len, visited);
        }
        Stuck::ProgramSequence { first, frame } => {
            gather_stuck(state, first, usages, ctx_len, visited);
            for entry in frame.context().entries() {
                gather(state, &entry.expr, usages, ctx_len, visited);
            }
        }
    }
}

/// Rebuild a typed term from a value, replacing placeholders through the
/// mapping. Metavariables still local to the current scope are sliced out
/// of the constraint graph into `constrained-type` terms.
pub fn substitute_inner<'arena>(
    state: &mut TypecheckerState<'arena>,
    value: &ArcValue<'arena>,
    mapping: &Mapping<'arena>,
    ctx: &TypingContext<'arena>,
) -> Result<&'arena Term<'arena>, Error<'arena>> {
    let term = subst_value(state, value, mapping, ctx)?;
    Ok(state.scope().to_scope(term))
}

fn subst_value<'arena>(
    state: &mut TypecheckerState<'arena>,
    value: &ArcValue<'arena>,
    mapping: &Mapping<'arena>,
    ctx: &TypingContext<'arena>,
) -> Result<Term<'arena>, Error<'arena>> {
    let scope = state.scope();
    match value.as_ref() {
        Value::Stuck(stuck) => subst_stuck(state, stuck, mapping, ctx),

        Value::FunType {
            plicity,
            purity,
            param_type,
            result,
        } => {
            let param_type = substitute_inner(state, param_type, mapping, ctx)?;
            let result = substitute_inner(state, result, mapping, ctx)?;
            Ok(Term::FunType(
                Span::Empty,
                *plicity,
                *purity,
                param_type,
                result,
            ))
        }
        Value::HostFunType {
            purity,
            param_type,
            result,
        } => {
            let param_type = substitute_inner(state, param_type, mapping, ctx)?;
            let result = substitute_inner(state, result, mapping, ctx)?;
            Ok(Term::HostFunType(Span::Empty, *purity, param_type, result))
        }
        Value::FunLit(closure) => {
            let capture = substitute_inner(state, closure.capture(), mapping, ctx)?;
            Ok(Term::FunLit {
                span: Span::Empty,
                param: closure.param_name(),
                capture_name: closure.capture_name(),
                capture,
                body: closure.body(),
            })
        }

        Value::TupleLit(elems) => {
            let elems = elems
                .iter()
                .map(|elem| subst_value(state, elem, mapping, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Term::TupleLit(
                Span::Empty,
                state.scope().to_scope_from_iter(elems),
            ))
        }
        Value::HostTupleLit(elems) => {
            let elems = elems
                .iter()
                .map(|elem| subst_host_value(state, elem, mapping, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Term::HostTupleLit(
                Span::Empty,
                state.scope().to_scope_from_iter(elems),
            ))
        }
        Value::RecordLit(fields) => {
            let labels = scope.to_scope_from_iter(fields.iter().map(|(label, _)| *label));
            let exprs = fields
                .iter()
                .map(|(_, value)| subst_value(state, value, mapping, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Term::RecordLit(
                Span::Empty,
                labels,
                state.scope().to_scope_from_iter(exprs),
            ))
        }
        Value::EnumLit(variant, payload) => {
            let payload = substitute_inner(state, payload, mapping, ctx)?;
            Ok(Term::EnumLit(Span::Empty, *variant, payload))
        }
        Value::EnumDescLit(variants) => {
            let labels = scope.to_scope_from_iter(variants.iter().map(|(label, _)| *label));
            let types = variants
                .iter()
                .map(|(_, value)| subst_value(state, value, mapping, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Term::EnumDescLit(
                Span::Empty,
                labels,
                state.scope().to_scope_from_iter(types),
            ))
        }
        Value::RecordDescLit(fields) => {
            let labels = scope.to_scope_from_iter(fields.iter().map(|(label, _)| *label));
            let types = fields
                .iter()
                .map(|(_, value)| subst_value(state, value, mapping, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Term::RecordDescLit(
                Span::Empty,
                labels,
                state.scope().to_scope_from_iter(types),
            ))
        }

        Value::TupleType(desc) => {
            let desc = substitute_inner(state, desc, mapping, ctx)?;
            Ok(Term::TupleType(Span::Empty, desc))
        }
        Value::HostTupleType(desc) => {
            let desc = substitute_inner(state, desc, mapping, ctx)?;
            Ok(Term::HostTupleType(Span::Empty, desc))
        }
        Value::EnumType(desc) => {
            let desc = substitute_inner(state, desc, mapping, ctx)?;
            Ok(Term::EnumType(Span::Empty, desc))
        }
        Value::RecordType(desc) => {
            let desc = substitute_inner(state, desc, mapping, ctx)?;
            Ok(Term::RecordType(Span::Empty, desc))
        }

        Value::UnionType(left, right) => {
            let left = substitute_inner(state, left, mapping, ctx)?;
            let right = substitute_inner(state, right, mapping, ctx)?;
            Ok(Term::UnionType(Span::Empty, left, right))
        }
        Value::IntersectionType(left, right) => {
            let left = substitute_inner(state, left, mapping, ctx)?;
            let right = substitute_inner(state, right, mapping, ctx)?;
            Ok(Term::IntersectionType(Span::Empty, left, right))
        }
        Value::Singleton { supertype, value } => {
            let supertype = substitute_inner(state, supertype, mapping, ctx)?;
            let value = substitute_inner(state, value, mapping, ctx)?;
            Ok(Term::Singleton(Span::Empty, supertype, value))
        }

        Value::Star { level, depth } => Ok(Term::Star(Span::Empty, *level, *depth)),
        Value::Prop => Ok(Term::Prop(Span::Empty)),
        Value::LevelType => Ok(Term::LevelType(Span::Empty)),

        Value::ProgramType { effects, result } => {
            let effects = substitute_inner(state, effects, mapping, ctx)?;
            let result = substitute_inner(state, result, mapping, ctx)?;
            Ok(Term::ProgramType(Span::Empty, effects, result))
        }
        Value::ProgramEnd(inner) => {
            let inner = substitute_inner(state, inner, mapping, ctx)?;
            Ok(Term::ProgramEnd(Span::Empty, inner))
        }
        Value::ProgramYield {
            effect,
            arg,
            continuation,
        } => {
            let effect_value: ArcValue<'arena> = Arc::new(Value::EffectElem(*effect));
            let effect_term = state
                .scope()
                .to_scope(Term::Literal(Span::Empty, effect_value));
            let arg = substitute_inner(state, arg, mapping, ctx)?;
            let mut program = Term::ProgramInvoke(Span::Empty, effect_term, arg);
            for frame in continuation.frames() {
                let cont_value = EvalContext::with_ambient(state, ctx.clone())
                    .eval(frame.term(), frame.context())?;
                let cont = substitute_inner(state, &cont_value, mapping, ctx)?;
                let first = state.scope().to_scope(program);
                program = Term::ProgramSequence(Span::Empty, first, cont);
            }
            Ok(program)
        }

        Value::Host(host) => subst_host_value(state, host, mapping, ctx),

        // The remaining heads are closed leaves from substitution's point
        // of view; they are embedded back as literals.
        Value::OperativeLit { .. }
        | Value::OperativeType { .. }
        | Value::TupleDescType(_)
        | Value::EnumDescType(_)
        | Value::RecordDescType(_)
        | Value::HostTypeType
        | Value::HostNumberType
        | Value::HostStringType
        | Value::HostBoolType
        | Value::HostUserDefinedType { .. }
        | Value::HostWrappedType(_)
        | Value::SrelType(_)
        | Value::VarianceType(_)
        | Value::Level(_)
        | Value::EffectRow(_)
        | Value::EffectElem(_)
        | Value::Range { .. } => Ok(Term::Literal(Span::Empty, value.clone())),
    }
}

fn subst_host_value<'arena>(
    state: &mut TypecheckerState<'arena>,
    host: &HostValue<'arena>,
    mapping: &Mapping<'arena>,
    ctx: &TypingContext<'arena>,
) -> Result<Term<'arena>, Error<'arena>> {
    match host {
        HostValue::Boxed(inner) => {
            let inner = substitute_inner(state, inner, mapping, ctx)?;
            Ok(Term::HostWrap(Span::Empty, inner))
        }
        _ => Ok(Term::Literal(
            Span::Empty,
            Arc::new(Value::Host(host.clone())),
        )),
    }
}

fn subst_stuck<'arena>(
    state: &mut TypecheckerState<'arena>,
    stuck: &Stuck<'arena>,
    mapping: &Mapping<'arena>,
    ctx: &TypingContext<'arena>,
) -> Result<Term<'arena>, Error<'arena>> {
    match stuck {
        Stuck::Free(FreeVar::Placeholder(level, _)) => match mapping.get(*level) {
            Some(term) => Ok(term.clone()),
            None => panic_any(Fault::UnmappedPlaceholder(*level)),
        },
        Stuck::Free(FreeVar::Unique(id)) => Ok(Term::UniqueToken(Span::Empty, *id)),
        Stuck::Free(FreeVar::Meta(meta)) => {
            if meta.block_level >= state.block_level() {
                let elems = state.slice_constraints_for(*meta, mapping, ctx)?;
                Ok(Term::ConstrainedType(Span::Empty, elems))
            } else {
                Ok(Term::Meta(Span::Empty, *meta))
            }
        }
        Stuck::FunApp(head, arg) => {
            let head = subst_stuck_ref(state, head, mapping, ctx)?;
            let arg = substitute_inner(state, arg, mapping, ctx)?;
            Ok(Term::FunApp(Span::Empty, head, arg))
        }
        Stuck::TupleProj(head, index) => {
            let head = subst_stuck_ref(state, head, mapping, ctx)?;
            Ok(Term::TupleProj(Span::Empty, head, *index))
        }
        Stuck::RecordProj(head, label) => {
            let head = subst_stuck_ref(state, head, mapping, ctx)?;
            Ok(Term::RecordProj(Span::Empty, head, *label))
        }
        Stuck::HostApp(host_fn, arg) => {
            let fun: ArcValue<'arena> =
                Arc::new(Value::Host(HostValue::Fn(host_fn.clone())));
            let fun = state.scope().to_scope(Term::Literal(Span::Empty, fun));
            let arg = subst_stuck_ref(state, arg, mapping, ctx)?;
            Ok(Term::FunApp(Span::Empty, fun, arg))
        }
        Stuck::HostTuple(prefix, middle, trailing) => {
            let mut elems = Vec::with_capacity(prefix.len() + 1 + trailing.len());
            for elem in prefix {
                elems.push(subst_host_value(state, elem, mapping, ctx)?);
            }
            elems.push(subst_stuck(state, middle, mapping, ctx)?);
            for elem in trailing {
                elems.push(subst_value(state, elem, mapping, ctx)?);
            }
            Ok(Term::HostTupleLit(
                Span::Empty,
                state.scope().to_scope_from_iter(elems),
            ))
        }
        Stuck::HostWrap(inner) => {
            let inner = subst_stuck_ref(state, inner, mapping, ctx)?;
            Ok(Term::HostWrap(Span::Empty, inner))
        }
        Stuck::HostUnwrap(inner) => {
            let inner = subst_stuck_ref(state, inner, mapping, ctx)?;
            Ok(Term::HostUnwrap(Span::Empty, inner))
        }
        Stuck::HostIntFold { count, fun, acc } => {
            let count = subst_stuck_ref(state, count, mapping, ctx)?;
            let fun = substitute_inner(state, fun, mapping, ctx)?;
            let acc = substitute_inner(state, acc, mapping, ctx)?;
            Ok(Term::HostIntFold(Span::Empty, count, fun, acc))
        }
        Stuck::HostIf {
            subject,
            consequent,
            alternate,
        } => {
            let subject = subst_stuck_ref(state, subject, mapping, ctx)?;
            let consequent = substitute_inner(state, consequent, mapping, ctx)?;
            let alternate = substitute_inner(state, alternate, mapping, ctx)?;
            Ok(Term::HostIf {
                span: Span::Empty,
                subject,
                consequent,
                alternate,
            })
        }
        Stuck::EnumElim { subject, arms } => {
            let subject = subst_stuck_ref(state, subject, mapping, ctx)?;
            let arms = arms
                .iter()
                .map(|(variant, arm)| Ok((*variant, subst_value(state, arm, mapping, ctx)?)))
                .collect::<Result<Vec<_>, Error<'arena>>>()?;
            Ok(Term::EnumElim {
                span: Span::Empty,
                subject,
                arms: state.scope().to_scope_from_iter(arms),
            })
        }
        Stuck::EnumAbsurd(subject) => {
            let subject = subst_stuck_ref(state, subject, mapping, ctx)?;
            Ok(Term::EnumAbsurd(Span::Empty, subject))
        }
        Stuck::HostIntrinsic { source, r#type } => {
            let source = subst_stuck_ref(state, source, mapping, ctx)?;
            let r#type = substitute_inner(state, r#type, mapping, ctx)?;
            Ok(Term::HostIntrinsic {
                span: Span::Empty,
                source,
                r#type,
            })
        }
        Stuck::ProgramSequence { first, frame } => {
            let first = subst_stuck_ref(state, first, mapping, ctx)?;
            let cont_value = EvalContext::with_ambient(state, ctx.clone())
                .eval(frame.term(), frame.context())?;
            let cont = substitute_inner(state, &cont_value, mapping, ctx)?;
            Ok(Term::ProgramSequence(Span::Empty, first, cont))
        }
    }
}

fn subst_stuck_ref<'arena>(
    state: &mut TypecheckerState<'arena>,
    stuck: &Stuck<'arena>,
    mapping: &Mapping<'arena>,
    ctx: &TypingContext<'arena>,
) -> Result<&'arena Term<'arena>, Error<'arena>> {
    let term = subst_stuck(state, stuck, mapping, ctx)?;
    Ok(state.scope().to_scope(term))
}

/// The result of closure building.
pub struct BuiltClosure<'arena> {
    /// A `FunLit` term that rebuilds the closure wherever it is evaluated.
    pub term: &'arena Term<'arena>,
    /// The closure value at the definition site.
    pub closure: Closure<'arena>,
    /// How often each binding of the outer context is referenced by the
    /// capture (the parameter's entry is dropped).
    pub usages: Usages,
}

/// Build a closure from a body value over `ctx` extended with a parameter
/// placeholder at level `ctx.len()`:
///
/// 1. gather the usages of the body value;
/// 2. collect the used bindings, ascending;
/// 3. produce a capture term that tuples exactly those bindings;
/// 4. rebuild the body behind a tuple-elim naming them, with the parameter
///    mapped to the closure argument.
pub fn build_closure<'arena>(
    state: &mut TypecheckerState<'arena>,
    body_value: &ArcValue<'arena>,
    ctx: &TypingContext<'arena>,
    param_name: SpannedName,
) -> Result<BuiltClosure<'arena>, Error<'arena>> {
    let outer_len = ctx.len();
    let full_len = EnvLen::from_usize(outer_len.to_usize() + 1);
    let capture_name = SpannedName::new(state.symbols().capture, Span::Empty);

    let mut usages = new_usages(full_len);
    gather_usages(state, body_value, &mut usages, full_len);

    let used: Vec<Level> = (0..outer_len.to_usize())
        .filter(|&level| usages[level] > 0)
        .map(Level::from_usize)
        .collect();
    let used_count = used.len();

    let binding_name = |ctx: &TypingContext<'arena>, level: Level| {
        ctx.get(level)
            .unwrap_or_else(|| panic_any(Fault::UnboundVariable))
            .name
    };

    // The capture tuple, evaluated at the definition site.
    let capture_elems: Vec<Term<'arena>> = used
        .iter()
        .map(|&level| {
            let index = outer_len.level_to_index(level).unwrap();
            Term::Var(Span::Empty, index, binding_name(ctx, level))
        })
        .collect();
    let capture_term: &'arena Term<'arena> = state.scope().to_scope(Term::TupleLit(
        Span::Empty,
        state.scope().to_scope_from_iter(capture_elems),
    ));

    // Inside the body the context is `[capture, argument]` extended by the
    // tuple-elim bindings, so a used binding at position `i` sits at level
    // `2 + i` and the argument at level 1.
    let inner_len = 2 + used_count;
    let mut mapping = Mapping::new(full_len);
    for (position, &level) in used.iter().enumerate() {
        let index = Index::from_usize(inner_len - 1 - (2 + position));
        let term = state
            .scope()
            .to_scope(Term::Var(Span::Empty, index, binding_name(ctx, level)));
        mapping.set(level, term);
    }
    let param_term = state.scope().to_scope(Term::Var(
        Span::Empty,
        Index::from_usize(inner_len - 2),
        param_name,
    ));
    mapping.set(outer_len.next_level(), param_term);

    let body_inner = substitute_inner(state, body_value, &mapping, ctx)?;

    let elim_names = state
        .scope()
        .to_scope_from_iter(used.iter().map(|&level| binding_name(ctx, level)));
    let elim_subject = state.scope().to_scope(Term::Var(
        Span::Empty,
        Index::from_usize(1),
        capture_name,
    ));
    let body_term: &'arena Term<'arena> = state.scope().to_scope(Term::TupleElim {
        span: Span::Empty,
        names: elim_names,
        subject: elim_subject,
        body: body_inner,
    });

    let term = state.scope().to_scope(Term::FunLit {
        span: Span::Empty,
        param: param_name,
        capture_name,
        capture: capture_term,
        body: body_term,
    });

    let capture_value =
        EvalContext::with_ambient(state, ctx.clone()).eval(capture_term, ctx.runtime())?;
    let closure = Closure::new(capture_value, capture_name, param_name, body_term);

    usages.truncate(outer_len.to_usize());
    Ok(BuiltClosure {
        term,
        closure,
        usages,
    })
}
