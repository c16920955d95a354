//! The operational semantics of the core language, implemented using
//! [normalisation by evaluation](https://en.wikipedia.org/wiki/Normalisation_by_evaluation).
//!
//! Values are two-level: a [`Value`] is either fully evaluated (strict), or
//! [`Stuck`] on a free variable or metavariable. The sum of the two layers
//! is the *flex value*, the universal currency between the evaluator, the
//! elaborator and the constraint solver; every [`ArcValue`] is a flex value.
//!
//! Closures own their environment: a closure's body is evaluated in a
//! context of exactly `[capture, argument]`, and the capture is a value
//! computed at the definition site by the closure builder in
//! [`subst`](crate::core::subst). The evaluation context at a call site
//! never leaks into a closure body.

use std::collections::BTreeSet;
use std::panic::panic_any;
use std::sync::Arc;

use crate::context::{RuntimeContext, TypingContext};
use crate::core::prim::{HostFn, HostValue};
use crate::core::program::{Continuation, Frame};
use crate::core::{EffectId, HostTypeId, Plicity, Purity, Term, UniqueId, OMEGA};
use crate::env::Level;
use crate::reporting::Error;
use crate::solver::relations::Rel;
use crate::solver::{Metavariable, TypecheckerState};
use crate::source::SpannedName;
use crate::StringId;

/// Atomically reference counted values. Reference counting increases the
/// amount of sharing achieved during evaluation.
pub type ArcValue<'arena> = Arc<Value<'arena>>;

/// Runtime values. Everything except [`Value::Stuck`] is fully evaluated.
#[derive(Debug, Clone)]
pub enum Value<'arena> {
    /// A computation blocked on a free variable or metavariable.
    Stuck(Stuck<'arena>),

    /// Dependent function types. The result is itself a function value,
    /// applied to the argument to give the result type.
    FunType {
        plicity: Plicity,
        purity: Purity,
        param_type: ArcValue<'arena>,
        result: ArcValue<'arena>,
    },
    /// Host function types.
    HostFunType {
        purity: Purity,
        param_type: ArcValue<'arena>,
        result: ArcValue<'arena>,
    },
    /// Function introductions.
    FunLit(Closure<'arena>),

    /// Tuple introductions.
    TupleLit(Vec<ArcValue<'arena>>),
    /// Host tuple introductions.
    HostTupleLit(Vec<HostValue<'arena>>),
    /// Record introductions.
    RecordLit(Vec<(StringId, ArcValue<'arena>)>),
    /// Enum introductions.
    EnumLit(StringId, ArcValue<'arena>),

    /// Operative introductions. Operatives are built by the surface macro
    /// layer; the core carries them opaquely.
    OperativeLit {
        handler: ArcValue<'arena>,
        userdata: ArcValue<'arena>,
    },
    /// Operative types.
    OperativeType {
        handler: ArcValue<'arena>,
        userdata_type: ArcValue<'arena>,
    },

    /// Tuple types, holding their descriptor.
    TupleType(ArcValue<'arena>),
    /// Host tuple types, holding their descriptor.
    HostTupleType(ArcValue<'arena>),
    /// The type of tuple descriptors at a universe.
    TupleDescType(ArcValue<'arena>),
    /// Enum types, holding their descriptor.
    EnumType(ArcValue<'arena>),
    /// The type of enum descriptors at a universe.
    EnumDescType(ArcValue<'arena>),
    /// Enum descriptors: variant names mapped to variant types.
    EnumDescLit(Vec<(StringId, ArcValue<'arena>)>),
    /// Record types, holding their descriptor.
    RecordType(ArcValue<'arena>),
    /// The type of record descriptors at a universe.
    RecordDescType(ArcValue<'arena>),
    /// Record descriptors: field names mapped to field type functions.
    RecordDescLit(Vec<(StringId, ArcValue<'arena>)>),

    /// The type of host types.
    HostTypeType,
    /// The type of host numbers.
    HostNumberType,
    /// The type of host strings.
    HostStringType,
    /// The type of host booleans.
    HostBoolType,
    /// A host-defined type family applied to arguments.
    HostUserDefinedType {
        id: HostTypeId,
        args: Vec<ArcValue<'arena>>,
    },
    /// The type of host-wrapped values.
    HostWrappedType(ArcValue<'arena>),
    /// The type of subtype relation witnesses over a target.
    SrelType(ArcValue<'arena>),
    /// The type of variance declarations over a target.
    VarianceType(ArcValue<'arena>),

    /// Union types.
    UnionType(ArcValue<'arena>, ArcValue<'arena>),
    /// Intersection types.
    IntersectionType(ArcValue<'arena>, ArcValue<'arena>),
    /// The subtype of `supertype` containing exactly `value`.
    Singleton {
        supertype: ArcValue<'arena>,
        value: ArcValue<'arena>,
    },

    /// Universes, indexed by level and depth.
    Star { level: usize, depth: usize },
    /// The universe of propositions.
    Prop,
    /// The type of universe levels.
    LevelType,
    /// A universe level.
    Level(usize),

    /// The type of effect programs.
    ProgramType {
        effects: ArcValue<'arena>,
        result: ArcValue<'arena>,
    },
    /// A row of effects.
    EffectRow(BTreeSet<EffectId>),
    /// A single effect.
    EffectElem(EffectId),

    /// A value known only by bounds, unpacked into constraints by the
    /// solver when it reaches the graph.
    Range {
        lower: Vec<ArcValue<'arena>>,
        upper: Vec<ArcValue<'arena>>,
        rel: Rel<'arena>,
    },

    /// A host-layer value.
    Host(HostValue<'arena>),

    /// A finished effect program.
    ProgramEnd(ArcValue<'arena>),
    /// An effect program suspended at an effect invocation.
    ProgramYield {
        effect: EffectId,
        arg: ArcValue<'arena>,
        continuation: Continuation<'arena>,
    },
}

/// The identity of a free variable.
#[derive(Debug, Clone)]
pub enum FreeVar {
    /// A placeholder: an index into a typechecking context, together with
    /// the debug information of that binding.
    Placeholder(Level, SpannedName),
    /// A fresh opaque token.
    Unique(UniqueId),
    /// An unsolved metavariable.
    Meta(Metavariable),
}

/// A computation blocked on an unknown.
#[derive(Debug, Clone)]
pub enum Stuck<'arena> {
    /// A free variable.
    Free(FreeVar),
    /// A stuck function applied to an argument.
    FunApp(Arc<Stuck<'arena>>, ArcValue<'arena>),
    /// Element access into a stuck tuple.
    TupleProj(Arc<Stuck<'arena>>, usize),
    /// Field access into a stuck record.
    RecordProj(Arc<Stuck<'arena>>, StringId),
    /// A host function applied to a stuck argument.
    HostApp(HostFn<'arena>, Arc<Stuck<'arena>>),
    /// A host tuple with exactly one stuck interior element: everything
    /// before it is host, everything after it is flex.
    HostTuple(
        Vec<HostValue<'arena>>,
        Arc<Stuck<'arena>>,
        Vec<ArcValue<'arena>>,
    ),
    /// A stuck value wrapped into the host layer.
    HostWrap(Arc<Stuck<'arena>>),
    /// A stuck host-layer value unwrapped.
    HostUnwrap(Arc<Stuck<'arena>>),
    /// A bounded fold with a stuck count.
    HostIntFold {
        count: Arc<Stuck<'arena>>,
        fun: ArcValue<'arena>,
        acc: ArcValue<'arena>,
    },
    /// A host conditional with a stuck subject. Both branch values are
    /// evaluated so that the solver can observe the unchosen branch.
    HostIf {
        subject: Arc<Stuck<'arena>>,
        consequent: ArcValue<'arena>,
        alternate: ArcValue<'arena>,
    },
    /// An enum elimination with a stuck subject. Arms are evaluated to
    /// their function values.
    EnumElim {
        subject: Arc<Stuck<'arena>>,
        arms: Vec<(StringId, ArcValue<'arena>)>,
    },
    /// An elimination of the empty enum with a stuck subject.
    EnumAbsurd(Arc<Stuck<'arena>>),
    /// An intrinsic whose source string is stuck.
    HostIntrinsic {
        source: Arc<Stuck<'arena>>,
        r#type: ArcValue<'arena>,
    },
    /// An effect-program sequencing whose first step is stuck.
    ProgramSequence {
        first: Arc<Stuck<'arena>>,
        frame: Frame<'arena>,
    },
}

impl<'arena> Value<'arena> {
    pub fn placeholder(level: Level, name: SpannedName) -> ArcValue<'arena> {
        Arc::new(Value::Stuck(Stuck::Free(FreeVar::Placeholder(level, name))))
    }

    pub fn unique(id: UniqueId) -> ArcValue<'arena> {
        Arc::new(Value::Stuck(Stuck::Free(FreeVar::Unique(id))))
    }

    pub fn meta(meta: Metavariable) -> ArcValue<'arena> {
        Arc::new(Value::Stuck(Stuck::Free(FreeVar::Meta(meta))))
    }

    pub fn host_number(num: f64) -> ArcValue<'arena> {
        Arc::new(Value::Host(HostValue::Num(num)))
    }

    pub fn host_string(s: impl Into<Arc<str>>) -> ArcValue<'arena> {
        Arc::new(Value::Host(HostValue::Str(s.into())))
    }

    pub fn host_bool(b: bool) -> ArcValue<'arena> {
        Arc::new(Value::Host(HostValue::Bool(b)))
    }

    pub fn star(level: usize, depth: usize) -> ArcValue<'arena> {
        Arc::new(Value::Star { level, depth })
    }

    /// The bare metavariable at the head of this value, if that is all
    /// this value is.
    pub fn match_meta(&self) -> Option<Metavariable> {
        match self {
            Value::Stuck(Stuck::Free(FreeVar::Meta(meta))) => Some(*meta),
            _ => None,
        }
    }

    /// Whether this value is a stuck application (ordinary or host).
    pub fn is_stuck_application(&self) -> bool {
        matches!(
            self,
            Value::Stuck(Stuck::FunApp(_, _)) | Value::Stuck(Stuck::HostApp(_, _))
        )
    }
}

/// A function value: a body term closed over an explicitly built capture.
#[derive(Debug, Clone)]
pub struct Closure<'arena> {
    capture: ArcValue<'arena>,
    capture_name: SpannedName,
    param_name: SpannedName,
    body: &'arena Term<'arena>,
}

impl<'arena> Closure<'arena> {
    pub fn new(
        capture: ArcValue<'arena>,
        capture_name: SpannedName,
        param_name: SpannedName,
        body: &'arena Term<'arena>,
    ) -> Closure<'arena> {
        Closure {
            capture,
            capture_name,
            param_name,
            body,
        }
    }

    pub fn capture(&self) -> &ArcValue<'arena> {
        &self.capture
    }

    pub fn capture_name(&self) -> SpannedName {
        self.capture_name
    }

    pub fn param_name(&self) -> SpannedName {
        self.param_name
    }

    pub fn body(&self) -> &'arena Term<'arena> {
        self.body
    }
}

/// Broken-invariant payloads. These unwind with `panic_any`: they are not
/// type errors but bugs in whatever produced the term.
#[derive(Debug, Clone)]
pub enum Fault {
    UnboundVariable,
    DebugMismatch {
        expected: SpannedName,
        found: SpannedName,
    },
    InvalidFunctionElim,
    InvalidTupleElim,
    InvalidRecordElim,
    InvalidEnumElim,
    InvalidHostValue,
    InvalidProgram,
    UnmappedPlaceholder(Level),
}

impl Fault {
    pub fn description(&self) -> &'static str {
        match self {
            Fault::UnboundVariable => "variable index not in context",
            Fault::DebugMismatch { .. } => "binder debug information mismatch",
            Fault::InvalidFunctionElim => "applied a non-function value",
            Fault::InvalidTupleElim => "tuple elimination of a non-tuple",
            Fault::InvalidRecordElim => "record elimination of a non-record",
            Fault::InvalidEnumElim => "enum elimination of a non-enum",
            Fault::InvalidHostValue => "expected a host value",
            Fault::InvalidProgram => "expected an effect program",
            Fault::UnmappedPlaceholder(_) => "substitution hit an unmapped placeholder",
        }
    }
}

/// Evaluation context.
///
/// Borrows the solver state: evaluating a `constrained-type` materialises a
/// metavariable and re-registers its constraints, and memoisation lives in
/// the state so that it participates in shadowing. The ambient typing
/// context is used when those registrations need a context to speak from.
pub struct EvalContext<'arena, 'state> {
    pub(crate) state: &'state mut TypecheckerState<'arena>,
    pub(crate) ambient: TypingContext<'arena>,
}

impl<'arena, 'state> EvalContext<'arena, 'state> {
    pub fn new(state: &'state mut TypecheckerState<'arena>) -> EvalContext<'arena, 'state> {
        EvalContext {
            state,
            ambient: TypingContext::new(),
        }
    }

    pub fn with_ambient(
        state: &'state mut TypecheckerState<'arena>,
        ambient: TypingContext<'arena>,
    ) -> EvalContext<'arena, 'state> {
        EvalContext { state, ambient }
    }

    /// Evaluate a term to a flex value. The term and the context are never
    /// mutated; the only output is the value.
    pub fn eval(
        &mut self,
        term: &'arena Term<'arena>,
        ctx: &RuntimeContext<'arena>,
    ) -> Result<ArcValue<'arena>, Error<'arena>> {
        let memo_key = (term as *const Term<'arena> as usize, ctx.id());
        if let Some(value) = self.state.eval_memo_get(&memo_key) {
            return Ok(value);
        }

        let value = self.eval_uncached(term, ctx)?;
        self.state.eval_memo_insert(memo_key, value.clone());
        Ok(value)
    }

    fn eval_uncached(
        &mut self,
        term: &'arena Term<'arena>,
        ctx: &RuntimeContext<'arena>,
    ) -> Result<ArcValue<'arena>, Error<'arena>> {
        match term {
            Term::Var(_, index, name) => Ok(ctx.lookup(*index, name)),
            Term::Meta(_, meta) => Ok(Value::meta(*meta)),
            Term::UniqueToken(_, id) => Ok(Value::unique(*id)),
            Term::Literal(_, value) => Ok(value.clone()),
            Term::Ann(_, expr, _) => self.eval(expr, ctx),
            Term::Let(_, name, def_expr, body_expr) => {
                let def_expr = self.eval(def_expr, ctx)?;
                self.eval(body_expr, &ctx.push(def_expr, *name))
            }

            Term::FunType(_, plicity, purity, param_type, result) => {
                let param_type = self.eval(param_type, ctx)?;
                let result = self.eval(result, ctx)?;
                Ok(Arc::new(Value::FunType {
                    plicity: *plicity,
                    purity: *purity,
                    param_type,
                    result,
                }))
            }
            Term::FunLit {
                param,
                capture_name,
                capture,
                body,
                ..
            } => {
                let capture = self.eval(capture, ctx)?;
                Ok(Arc::new(Value::FunLit(Closure::new(
                    capture,
                    *capture_name,
                    *param,
                    body,
                ))))
            }
            Term::FunApp(_, head_expr, input_expr) => {
                let head_expr = self.eval(head_expr, ctx)?;
                let input_expr = self.eval(input_expr, ctx)?;
                self.apply(head_expr, input_expr)
            }
            Term::HostFunType(_, purity, param_type, result) => {
                let param_type = self.eval(param_type, ctx)?;
                let result = self.eval(result, ctx)?;
                Ok(Arc::new(Value::HostFunType {
                    purity: *purity,
                    param_type,
                    result,
                }))
            }

            Term::TupleLit(_, elem_exprs) => {
                let elem_exprs = elem_exprs
                    .iter()
                    .map(|elem_expr| self.eval(elem_expr, ctx))
                    .collect::<Result<_, _>>()?;
                Ok(Arc::new(Value::TupleLit(elem_exprs)))
            }
            Term::HostTupleLit(_, elem_exprs) => {
                let mut elems = Vec::with_capacity(elem_exprs.len());
                for elem_expr in elem_exprs.iter() {
                    elems.push(self.eval(elem_expr, ctx)?);
                }
                Ok(host_tuple_of(elems))
            }
            Term::TupleProj(_, head_expr, index) => {
                let head_expr = self.eval(head_expr, ctx)?;
                self.index_tuple(&head_expr, *index)
            }
            Term::TupleElim {
                names,
                subject,
                body,
                ..
            } => {
                let subject = self.eval(subject, ctx)?;
                let mut inner_ctx = ctx.clone();
                for (index, name) in names.iter().enumerate() {
                    let elem = self.index_tuple(&subject, index)?;
                    inner_ctx = inner_ctx.push(elem, *name);
                }
                self.eval(body, &inner_ctx)
            }
            Term::TupleType(_, desc) => {
                let desc = self.eval(desc, ctx)?;
                Ok(Arc::new(Value::TupleType(desc)))
            }
            Term::HostTupleType(_, desc) => {
                let desc = self.eval(desc, ctx)?;
                Ok(Arc::new(Value::HostTupleType(desc)))
            }

            Term::RecordLit(_, labels, exprs) => {
                let fields = Iterator::zip(labels.iter(), exprs.iter())
                    .map(|(label, expr)| Ok((*label, self.eval(expr, ctx)?)))
                    .collect::<Result<_, Error<'arena>>>()?;
                Ok(Arc::new(Value::RecordLit(fields)))
            }
            Term::RecordProj(_, head_expr, label) => {
                let head_expr = self.eval(head_expr, ctx)?;
                self.index_record(&head_expr, *label)
            }
            Term::RecordElim {
                subject,
                fields,
                names,
                body,
                ..
            } => {
                let subject = self.eval(subject, ctx)?;
                let mut inner_ctx = ctx.clone();
                for (field, name) in Iterator::zip(fields.iter(), names.iter()) {
                    let value = self.index_record(&subject, *field)?;
                    inner_ctx = inner_ctx.push(value, *name);
                }
                self.eval(body, &inner_ctx)
            }
            Term::RecordType(_, desc) => {
                let desc = self.eval(desc, ctx)?;
                Ok(Arc::new(Value::RecordType(desc)))
            }

            Term::EnumLit(_, variant, payload) => {
                let payload = self.eval(payload, ctx)?;
                Ok(Arc::new(Value::EnumLit(*variant, payload)))
            }
            Term::EnumDescLit(_, variants, types) => {
                let variants = Iterator::zip(variants.iter(), types.iter())
                    .map(|(variant, r#type)| Ok((*variant, self.eval(r#type, ctx)?)))
                    .collect::<Result<_, Error<'arena>>>()?;
                Ok(Arc::new(Value::EnumDescLit(variants)))
            }
            Term::RecordDescLit(_, fields, types) => {
                let fields = Iterator::zip(fields.iter(), types.iter())
                    .map(|(field, r#type)| Ok((*field, self.eval(r#type, ctx)?)))
                    .collect::<Result<_, Error<'arena>>>()?;
                Ok(Arc::new(Value::RecordDescLit(fields)))
            }
            Term::EnumElim { subject, arms, .. } => {
                let subject = self.eval(subject, ctx)?;
                match subject.as_ref() {
                    Value::EnumLit(variant, payload) => {
                        let arm = arms
                            .iter()
                            .find(|(arm_variant, _)| arm_variant == variant)
                            .unwrap_or_else(|| panic_any(Fault::InvalidEnumElim));
                        let arm_fun = self.eval(&arm.1, ctx)?;
                        self.apply(arm_fun, payload.clone())
                    }
                    Value::Stuck(stuck) => {
                        let arms = arms
                            .iter()
                            .map(|(variant, arm)| Ok((*variant, self.eval(arm, ctx)?)))
                            .collect::<Result<_, Error<'arena>>>()?;
                        Ok(Arc::new(Value::Stuck(Stuck::EnumElim {
                            subject: Arc::new(stuck.clone()),
                            arms,
                        })))
                    }
                    _ => panic_any(Fault::InvalidEnumElim),
                }
            }
            Term::EnumAbsurd(_, subject) => {
                let subject = self.eval(subject, ctx)?;
                match subject.as_ref() {
                    Value::Stuck(stuck) => Ok(Arc::new(Value::Stuck(Stuck::EnumAbsurd(
                        Arc::new(stuck.clone()),
                    )))),
                    _ => panic_any(Fault::InvalidEnumElim),
                }
            }
            Term::EnumType(_, desc) => {
                let desc = self.eval(desc, ctx)?;
                Ok(Arc::new(Value::EnumType(desc)))
            }

            Term::Star(span, level, depth) => {
                if *level > OMEGA {
                    return Err(Error::LevelOverflow { span: *span });
                }
                Ok(Arc::new(Value::Star {
                    level: *level,
                    depth: *depth,
                }))
            }
            Term::Prop(_) => Ok(Arc::new(Value::Prop)),
            Term::LevelType(_) => Ok(Arc::new(Value::LevelType)),
            Term::Level0(_) => Ok(Arc::new(Value::Level(0))),
            Term::LevelSuc(span, inner) => {
                let inner = self.eval(inner, ctx)?;
                match inner.as_ref() {
                    Value::Level(level) if level + 1 <= OMEGA => {
                        Ok(Arc::new(Value::Level(level + 1)))
                    }
                    Value::Level(_) => Err(Error::LevelOverflow { span: *span }),
                    _ => Err(Error::NotImplemented("level arithmetic on stuck levels")),
                }
            }
            Term::LevelMax(span, left, right) => {
                let left = self.eval(left, ctx)?;
                let right = self.eval(right, ctx)?;
                match (left.as_ref(), right.as_ref()) {
                    (Value::Level(left), Value::Level(right)) => {
                        let level = Ord::max(*left, *right);
                        if level > OMEGA {
                            return Err(Error::LevelOverflow { span: *span });
                        }
                        Ok(Arc::new(Value::Level(level)))
                    }
                    (_, _) => Err(Error::NotImplemented("level arithmetic on stuck levels")),
                }
            }

            Term::Singleton(_, supertype, value) => {
                let supertype = self.eval(supertype, ctx)?;
                let value = self.eval(value, ctx)?;
                Ok(Arc::new(Value::Singleton { supertype, value }))
            }
            Term::UnionType(_, left, right) => {
                let left = self.eval(left, ctx)?;
                let right = self.eval(right, ctx)?;
                Ok(Arc::new(Value::UnionType(left, right)))
            }
            Term::IntersectionType(_, left, right) => {
                let left = self.eval(left, ctx)?;
                let right = self.eval(right, ctx)?;
                Ok(Arc::new(Value::IntersectionType(left, right)))
            }
            Term::ConstrainedType(_, elems) => self.eval_constrained_type(elems, ctx),

            Term::HostWrap(_, inner) => {
                let inner = self.eval(inner, ctx)?;
                match inner.as_ref() {
                    Value::Stuck(stuck) => Ok(Arc::new(Value::Stuck(Stuck::HostWrap(Arc::new(
                        stuck.clone(),
                    ))))),
                    _ => Ok(Arc::new(Value::Host(HostValue::Boxed(inner)))),
                }
            }
            Term::HostUnwrap(_, inner) => {
                let inner = self.eval(inner, ctx)?;
                match inner.as_ref() {
                    Value::Host(HostValue::Boxed(value)) => Ok(value.clone()),
                    Value::Stuck(stuck) => Ok(Arc::new(Value::Stuck(Stuck::HostUnwrap(
                        Arc::new(stuck.clone()),
                    )))),
                    _ => panic_any(Fault::InvalidHostValue),
                }
            }
            Term::HostIntFold(_, count, fun, acc) => {
                let count = self.eval(count, ctx)?;
                let fun = self.eval(fun, ctx)?;
                let acc = self.eval(acc, ctx)?;
                match count.as_ref() {
                    Value::Host(HostValue::Num(num)) => {
                        let mut acc = acc;
                        let mut index = num.trunc();
                        while index >= 1.0 {
                            let step = self.apply(fun.clone(), Value::host_number(index))?;
                            acc = self.apply(step, acc)?;
                            index -= 1.0;
                        }
                        Ok(acc)
                    }
                    Value::Stuck(stuck) => Ok(Arc::new(Value::Stuck(Stuck::HostIntFold {
                        count: Arc::new(stuck.clone()),
                        fun,
                        acc,
                    }))),
                    _ => panic_any(Fault::InvalidHostValue),
                }
            }
            Term::HostIf {
                subject,
                consequent,
                alternate,
                ..
            } => {
                let subject = self.eval(subject, ctx)?;
                match subject.as_ref() {
                    Value::Host(HostValue::Bool(true)) => self.eval(consequent, ctx),
                    Value::Host(HostValue::Bool(false)) => self.eval(alternate, ctx),
                    Value::Stuck(stuck) => {
                        // Evaluate both branches so the solver can observe
                        // the unchosen one, refining a bare placeholder
                        // subject in each.
                        let (true_ctx, false_ctx) = match stuck {
                            Stuck::Free(FreeVar::Placeholder(level, _)) => (
                                ctx.refine_level(*level, Value::host_bool(true))
                                    .unwrap_or_else(|| ctx.clone()),
                                ctx.refine_level(*level, Value::host_bool(false))
                                    .unwrap_or_else(|| ctx.clone()),
                            ),
                            _ => (ctx.clone(), ctx.clone()),
                        };
                        let consequent = self.eval(consequent, &true_ctx)?;
                        let alternate = self.eval(alternate, &false_ctx)?;
                        Ok(Arc::new(Value::Stuck(Stuck::HostIf {
                            subject: Arc::new(stuck.clone()),
                            consequent,
                            alternate,
                        })))
                    }
                    _ => panic_any(Fault::InvalidHostValue),
                }
            }
            Term::HostIntrinsic { source, r#type, .. } => {
                let source = self.eval(source, ctx)?;
                let r#type = self.eval(r#type, ctx)?;
                match source.as_ref() {
                    Value::Host(HostValue::Str(text)) => {
                        let host_fn = self.state.resolve_intrinsic(text)?;
                        Ok(Arc::new(Value::Host(HostValue::Fn(host_fn))))
                    }
                    Value::Stuck(stuck) => Ok(Arc::new(Value::Stuck(Stuck::HostIntrinsic {
                        source: Arc::new(stuck.clone()),
                        r#type,
                    }))),
                    _ => panic_any(Fault::InvalidHostValue),
                }
            }

            Term::ProgramSequence(_, first, cont) => {
                let first = self.eval(first, ctx)?;
                match first.as_ref() {
                    Value::ProgramEnd(value) => {
                        let cont_fun = self.eval(cont, ctx)?;
                        self.apply(cont_fun, value.clone())
                    }
                    Value::ProgramYield {
                        effect,
                        arg,
                        continuation,
                    } => Ok(Arc::new(Value::ProgramYield {
                        effect: *effect,
                        arg: arg.clone(),
                        continuation: continuation.pushed(Frame::new(ctx.clone(), cont)),
                    })),
                    Value::Stuck(stuck) => Ok(Arc::new(Value::Stuck(Stuck::ProgramSequence {
                        first: Arc::new(stuck.clone()),
                        frame: Frame::new(ctx.clone(), cont),
                    }))),
                    _ => panic_any(Fault::InvalidProgram),
                }
            }
            Term::ProgramEnd(_, value) => {
                let value = self.eval(value, ctx)?;
                Ok(Arc::new(Value::ProgramEnd(value)))
            }
            Term::ProgramInvoke(_, effect, arg) => {
                let effect = self.eval(effect, ctx)?;
                let arg = self.eval(arg, ctx)?;
                match effect.as_ref() {
                    Value::EffectElem(effect) => Ok(Arc::new(Value::ProgramYield {
                        effect: *effect,
                        arg,
                        continuation: Continuation::empty(),
                    })),
                    _ => panic_any(Fault::InvalidProgram),
                }
            }
            Term::ProgramType(_, effects, result) => {
                let effects = self.eval(effects, ctx)?;
                let result = self.eval(result, ctx)?;
                Ok(Arc::new(Value::ProgramType { effects, result }))
            }
        }
    }

    /// Apply a function value to an argument, performing beta-reduction if
    /// possible.
    pub fn apply(
        &mut self,
        fun: ArcValue<'arena>,
        arg: ArcValue<'arena>,
    ) -> Result<ArcValue<'arena>, Error<'arena>> {
        match fun.as_ref() {
            Value::FunLit(closure) => self.apply_closure(closure, arg),
            Value::Host(HostValue::Fn(host_fn)) => match arg.as_ref() {
                Value::HostTupleLit(inputs) => {
                    let outputs =
                        host_fn
                            .invoke(inputs)
                            .map_err(|message| Error::HostFunction {
                                name: host_fn.name(),
                                message,
                            })?;
                    Ok(Arc::new(Value::HostTupleLit(outputs)))
                }
                Value::Stuck(stuck) => Ok(Arc::new(Value::Stuck(Stuck::HostApp(
                    host_fn.clone(),
                    Arc::new(stuck.clone()),
                )))),
                _ => panic_any(Fault::InvalidFunctionElim),
            },
            Value::Stuck(stuck) => Ok(Arc::new(Value::Stuck(Stuck::FunApp(
                Arc::new(stuck.clone()),
                arg,
            )))),
            _ => panic_any(Fault::InvalidFunctionElim),
        }
    }

    /// Apply a closure to a value. The body sees only the capture and the
    /// argument; the caller's context cannot leak in.
    pub fn apply_closure(
        &mut self,
        closure: &Closure<'arena>,
        arg: ArcValue<'arena>,
    ) -> Result<ArcValue<'arena>, Error<'arena>> {
        let ctx = RuntimeContext::new()
            .push(closure.capture.clone(), closure.capture_name)
            .push(arg, closure.param_name);
        self.eval(closure.body, &ctx)
    }

    /// Project an element out of a tuple value.
    pub fn index_tuple(
        &mut self,
        value: &ArcValue<'arena>,
        index: usize,
    ) -> Result<ArcValue<'arena>, Error<'arena>> {
        match value.as_ref() {
            Value::TupleLit(elems) => match elems.get(index) {
                Some(elem) => Ok(elem.clone()),
                None => panic_any(Fault::InvalidTupleElim),
            },
            Value::HostTupleLit(elems) => match elems.get(index) {
                Some(elem) => Ok(Arc::new(Value::Host(elem.clone()))),
                None => panic_any(Fault::InvalidTupleElim),
            },
            Value::Singleton { value, .. } => self.index_tuple(value, index),
            Value::Stuck(Stuck::HostTuple(prefix, middle, trailing)) => {
                if index < prefix.len() {
                    Ok(Arc::new(Value::Host(prefix[index].clone())))
                } else if index == prefix.len() {
                    Ok(Arc::new(Value::Stuck((**middle).clone())))
                } else {
                    match trailing.get(index - prefix.len() - 1) {
                        Some(elem) => Ok(elem.clone()),
                        None => panic_any(Fault::InvalidTupleElim),
                    }
                }
            }
            Value::Stuck(stuck) => Ok(Arc::new(Value::Stuck(Stuck::TupleProj(
                Arc::new(stuck.clone()),
                index,
            )))),
            _ => panic_any(Fault::InvalidTupleElim),
        }
    }

    /// Project a field out of a record value.
    pub fn index_record(
        &mut self,
        value: &ArcValue<'arena>,
        label: StringId,
    ) -> Result<ArcValue<'arena>, Error<'arena>> {
        match value.as_ref() {
            Value::RecordLit(fields) => {
                match fields.iter().find(|(field, _)| *field == label) {
                    Some((_, value)) => Ok(value.clone()),
                    None => panic_any(Fault::InvalidRecordElim),
                }
            }
            Value::Singleton { value, .. } => self.index_record(value, label),
            Value::Stuck(stuck) => Ok(Arc::new(Value::Stuck(Stuck::RecordProj(
                Arc::new(stuck.clone()),
                label,
            )))),
            _ => panic_any(Fault::InvalidRecordElim),
        }
    }

    /// Materialise a fresh metavariable for a `constrained-type` and
    /// re-register every sliced constraint it carries.
    fn eval_constrained_type(
        &mut self,
        elems: &'arena [crate::solver::ConstraintElem<'arena>],
        ctx: &RuntimeContext<'arena>,
    ) -> Result<ArcValue<'arena>, Error<'arena>> {
        use crate::solver::ConstraintElem;

        let meta = self.state.metavariable(self.ambient.len(), false);
        let meta_value = Value::meta(meta);
        let ambient = self.ambient.clone();

        for elem in elems {
            match elem {
                ConstraintElem::SlicedConstrain { rel, right, cause } => {
                    let right = self.eval(right, ctx)?;
                    self.state.constrain(
                        &meta_value,
                        &ambient,
                        &right,
                        &ambient,
                        rel.clone(),
                        cause.clone(),
                    )?;
                }
                ConstraintElem::ConstrainSliced { left, rel, cause } => {
                    let left = self.eval(left, ctx)?;
                    self.state.constrain(
                        &left,
                        &ambient,
                        &meta_value,
                        &ambient,
                        rel.clone(),
                        cause.clone(),
                    )?;
                }
                ConstraintElem::SlicedLeftCall {
                    arg,
                    rel,
                    right,
                    cause,
                } => {
                    let arg = self.eval(arg, ctx)?;
                    let right = self.eval(right, ctx)?;
                    self.state.constrain_call_left(
                        &meta_value,
                        &ambient,
                        arg,
                        rel.clone(),
                        &right,
                        &ambient,
                        cause.clone(),
                    )?;
                }
                ConstraintElem::LeftCallSliced {
                    left,
                    arg,
                    rel,
                    cause,
                } => {
                    let left = self.eval(left, ctx)?;
                    let arg = self.eval(arg, ctx)?;
                    self.state.constrain_call_left(
                        &left,
                        &ambient,
                        arg,
                        rel.clone(),
                        &meta_value,
                        &ambient,
                        cause.clone(),
                    )?;
                }
                ConstraintElem::SlicedRightCall {
                    rel,
                    right,
                    arg,
                    cause,
                } => {
                    let right = self.eval(right, ctx)?;
                    let arg = self.eval(arg, ctx)?;
                    self.state.constrain_call_right(
                        &meta_value,
                        &ambient,
                        rel.clone(),
                        &right,
                        &ambient,
                        arg,
                        cause.clone(),
                    )?;
                }
                ConstraintElem::RightCallSliced {
                    left,
                    rel,
                    arg,
                    cause,
                } => {
                    let left = self.eval(left, ctx)?;
                    let arg = self.eval(arg, ctx)?;
                    self.state.constrain_call_right(
                        &left,
                        &ambient,
                        rel.clone(),
                        &meta_value,
                        &ambient,
                        arg,
                        cause.clone(),
                    )?;
                }
            }
        }

        Ok(meta_value)
    }
}

/// Assemble a host tuple from evaluated elements. Everything before the
/// first stuck element must be host; the first stuck element becomes the
/// middle, and everything after it stays flex.
pub fn host_tuple_of<'arena>(elems: Vec<ArcValue<'arena>>) -> ArcValue<'arena> {
    let mut prefix = Vec::with_capacity(elems.len());
    let mut elems = elems.into_iter();

    while let Some(elem) = elems.next() {
        match elem.as_ref() {
            Value::Host(host) => prefix.push(host.clone()),
            Value::Stuck(stuck) => {
                let middle = Arc::new(stuck.clone());
                let trailing = elems.collect();
                return Arc::new(Value::Stuck(Stuck::HostTuple(prefix, middle, trailing)));
            }
            _ => panic_any(Fault::InvalidHostValue),
        }
    }

    Arc::new(Value::HostTupleLit(prefix))
}

/// Structural equality of values. Used to compare stuck values during
/// concrete head checks, and as the identity test for singleton witnesses.
pub fn convertible<'arena>(value0: &ArcValue<'arena>, value1: &ArcValue<'arena>) -> bool {
    if Arc::ptr_eq(value0, value1) {
        return true;
    }

    match (value0.as_ref(), value1.as_ref()) {
        (Value::Stuck(stuck0), Value::Stuck(stuck1)) => stuck_convertible(stuck0, stuck1),

        (
            Value::FunType {
                plicity: p0,
                purity: e0,
                param_type: a0,
                result: r0,
            },
            Value::FunType {
                plicity: p1,
                purity: e1,
                param_type: a1,
                result: r1,
            },
        ) => p0 == p1 && e0 == e1 && convertible(a0, a1) && convertible(r0, r1),
        (
            Value::HostFunType {
                purity: e0,
                param_type: a0,
                result: r0,
            },
            Value::HostFunType {
                purity: e1,
                param_type: a1,
                result: r1,
            },
        ) => e0 == e1 && convertible(a0, a1) && convertible(r0, r1),
        (Value::FunLit(closure0), Value::FunLit(closure1)) => {
            std::ptr::eq(closure0.body, closure1.body)
                && convertible(&closure0.capture, &closure1.capture)
        }

        (Value::TupleLit(elems0), Value::TupleLit(elems1)) => {
            elems0.len() == elems1.len()
                && Iterator::zip(elems0.iter(), elems1.iter())
                    .all(|(elem0, elem1)| convertible(elem0, elem1))
        }
        (Value::HostTupleLit(elems0), Value::HostTupleLit(elems1)) => {
            elems0.len() == elems1.len()
                && Iterator::zip(elems0.iter(), elems1.iter())
                    .all(|(elem0, elem1)| host_value_eq(elem0, elem1))
        }
        (Value::RecordLit(fields0), Value::RecordLit(fields1)) => {
            labelled_convertible(fields0, fields1)
        }
        (Value::EnumLit(variant0, payload0), Value::EnumLit(variant1, payload1)) => {
            variant0 == variant1 && convertible(payload0, payload1)
        }

        (
            Value::OperativeLit {
                handler: h0,
                userdata: u0,
            },
            Value::OperativeLit {
                handler: h1,
                userdata: u1,
            },
        ) => convertible(h0, h1) && convertible(u0, u1),
        (
            Value::OperativeType {
                handler: h0,
                userdata_type: u0,
            },
            Value::OperativeType {
                handler: h1,
                userdata_type: u1,
            },
        ) => convertible(h0, h1) && convertible(u0, u1),

        (Value::TupleType(desc0), Value::TupleType(desc1))
        | (Value::HostTupleType(desc0), Value::HostTupleType(desc1))
        | (Value::TupleDescType(desc0), Value::TupleDescType(desc1))
        | (Value::EnumType(desc0), Value::EnumType(desc1))
        | (Value::EnumDescType(desc0), Value::EnumDescType(desc1))
        | (Value::RecordType(desc0), Value::RecordType(desc1))
        | (Value::RecordDescType(desc0), Value::RecordDescType(desc1))
        | (Value::HostWrappedType(desc0), Value::HostWrappedType(desc1))
        | (Value::SrelType(desc0), Value::SrelType(desc1))
        | (Value::VarianceType(desc0), Value::VarianceType(desc1)) => convertible(desc0, desc1),

        (Value::EnumDescLit(variants0), Value::EnumDescLit(variants1))
        | (Value::RecordDescLit(variants0), Value::RecordDescLit(variants1)) => {
            labelled_convertible(variants0, variants1)
        }

        (Value::HostTypeType, Value::HostTypeType)
        | (Value::HostNumberType, Value::HostNumberType)
        | (Value::HostStringType, Value::HostStringType)
        | (Value::HostBoolType, Value::HostBoolType)
        | (Value::Prop, Value::Prop)
        | (Value::LevelType, Value::LevelType) => true,

        (
            Value::HostUserDefinedType { id: id0, args: a0 },
            Value::HostUserDefinedType { id: id1, args: a1 },
        ) => {
            id0 == id1
                && a0.len() == a1.len()
                && Iterator::zip(a0.iter(), a1.iter()).all(|(x, y)| convertible(x, y))
        }

        (Value::UnionType(l0, r0), Value::UnionType(l1, r1))
        | (Value::IntersectionType(l0, r0), Value::IntersectionType(l1, r1)) => {
            convertible(l0, l1) && convertible(r0, r1)
        }
        (
            Value::Singleton {
                supertype: t0,
                value: v0,
            },
            Value::Singleton {
                supertype: t1,
                value: v1,
            },
        ) => convertible(t0, t1) && convertible(v0, v1),

        (
            Value::Star {
                level: l0,
                depth: d0,
            },
            Value::Star {
                level: l1,
                depth: d1,
            },
        ) => l0 == l1 && d0 == d1,
        (Value::Level(l0), Value::Level(l1)) => l0 == l1,

        (
            Value::ProgramType {
                effects: e0,
                result: r0,
            },
            Value::ProgramType {
                effects: e1,
                result: r1,
            },
        ) => convertible(e0, e1) && convertible(r0, r1),
        (Value::EffectRow(row0), Value::EffectRow(row1)) => row0 == row1,
        (Value::EffectElem(e0), Value::EffectElem(e1)) => e0 == e1,

        (
            Value::Range {
                lower: lo0,
                upper: hi0,
                rel: rel0,
            },
            Value::Range {
                lower: lo1,
                upper: hi1,
                rel: rel1,
            },
        ) => {
            Arc::ptr_eq(rel0, rel1)
                && lo0.len() == lo1.len()
                && hi0.len() == hi1.len()
                && Iterator::zip(lo0.iter(), lo1.iter()).all(|(x, y)| convertible(x, y))
                && Iterator::zip(hi0.iter(), hi1.iter()).all(|(x, y)| convertible(x, y))
        }

        (Value::Host(host0), Value::Host(host1)) => host_value_eq(host0, host1),

        (Value::ProgramEnd(v0), Value::ProgramEnd(v1)) => convertible(v0, v1),

        (_, _) => false,
    }
}

fn labelled_convertible<'arena>(
    fields0: &[(StringId, ArcValue<'arena>)],
    fields1: &[(StringId, ArcValue<'arena>)],
) -> bool {
    fields0.len() == fields1.len()
        && fields0.iter().all(|(label, value0)| {
            fields1
                .iter()
                .find(|(other, _)| other == label)
                .map_or(false, |(_, value1)| convertible(value0, value1))
        })
}

pub fn host_value_eq<'arena>(host0: &HostValue<'arena>, host1: &HostValue<'arena>) -> bool {
    match (host0, host1) {
        (HostValue::Num(n0), HostValue::Num(n1)) => n0 == n1,
        (HostValue::Str(s0), HostValue::Str(s1)) => s0 == s1,
        (HostValue::Bool(b0), HostValue::Bool(b1)) => b0 == b1,
        (HostValue::Unit, HostValue::Unit) => true,
        (HostValue::Fn(f0), HostValue::Fn(f1)) => f0.same(f1),
        (HostValue::Boxed(v0), HostValue::Boxed(v1)) => convertible(v0, v1),
        (_, _) => false,
    }
}

pub fn stuck_convertible<'arena>(stuck0: &Stuck<'arena>, stuck1: &Stuck<'arena>) -> bool {
    match (stuck0, stuck1) {
        (Stuck::Free(free0), Stuck::Free(free1)) => match (free0, free1) {
            (FreeVar::Placeholder(level0, name0), FreeVar::Placeholder(level1, name1)) => {
                level0 == level1 && name0 == name1
            }
            (FreeVar::Unique(id0), FreeVar::Unique(id1)) => id0 == id1,
            (FreeVar::Meta(meta0), FreeVar::Meta(meta1)) => meta0 == meta1,
            (_, _) => false,
        },
        (Stuck::FunApp(head0, arg0), Stuck::FunApp(head1, arg1)) => {
            stuck_convertible(head0, head1) && convertible(arg0, arg1)
        }
        (Stuck::TupleProj(head0, index0), Stuck::TupleProj(head1, index1)) => {
            index0 == index1 && stuck_convertible(head0, head1)
        }
        (Stuck::RecordProj(head0, label0), Stuck::RecordProj(head1, label1)) => {
            label0 == label1 && stuck_convertible(head0, head1)
        }
        (Stuck::HostApp(fun0, arg0), Stuck::HostApp(fun1, arg1)) => {
            fun0.same(fun1) && stuck_convertible(arg0, arg1)
        }
        (
            Stuck::HostTuple(prefix0, middle0, trailing0),
            Stuck::HostTuple(prefix1, middle1, trailing1),
        ) => {
            prefix0.len() == prefix1.len()
                && trailing0.len() == trailing1.len()
                && Iterator::zip(prefix0.iter(), prefix1.iter())
                    .all(|(x, y)| host_value_eq(x, y))
                && stuck_convertible(middle0, middle1)
                && Iterator::zip(trailing0.iter(), trailing1.iter())
                    .all(|(x, y)| convertible(x, y))
        }
        (Stuck::HostWrap(inner0), Stuck::HostWrap(inner1))
        | (Stuck::HostUnwrap(inner0), Stuck::HostUnwrap(inner1))
        | (Stuck::EnumAbsurd(inner0), Stuck::EnumAbsurd(inner1)) => {
            stuck_convertible(inner0, inner1)
        }
        (
            Stuck::HostIntFold {
                count: c0,
                fun: f0,
                acc: a0,
            },
            Stuck::HostIntFold {
                count: c1,
                fun: f1,
                acc: a1,
            },
        ) => stuck_convertible(c0, c1) && convertible(f0, f1) && convertible(a0, a1),
        (
            Stuck::HostIf {
                subject: s0,
                consequent: c0,
                alternate: a0,
            },
            Stuck::HostIf {
                subject: s1,
                consequent: c1,
                alternate: a1,
            },
        ) => stuck_convertible(s0, s1) && convertible(c0, c1) && convertible(a0, a1),
        (
            Stuck::EnumElim {
                subject: s0,
                arms: arms0,
            },
            Stuck::EnumElim {
                subject: s1,
                arms: arms1,
            },
        ) => {
            stuck_convertible(s0, s1)
                && arms0.len() == arms1.len()
                && Iterator::zip(arms0.iter(), arms1.iter()).all(
                    |((variant0, arm0), (variant1, arm1))| {
                        variant0 == variant1 && convertible(arm0, arm1)
                    },
                )
        }
        (
            Stuck::HostIntrinsic {
                source: s0,
                r#type: t0,
            },
            Stuck::HostIntrinsic {
                source: s1,
                r#type: t1,
            },
        ) => stuck_convertible(s0, s1) && convertible(t0, t1),
        (
            Stuck::ProgramSequence {
                first: f0,
                frame: fr0,
            },
            Stuck::ProgramSequence {
                first: f1,
                frame: fr1,
            },
        ) => stuck_convertible(f0, f1) && std::ptr::eq(fr0.term(), fr1.term()),
        (_, _) => false,
    }
}
