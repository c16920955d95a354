//! Elaboration of the surface language into the core language.
//!
//! The algorithm is structured bidirectionally: [`Elaborator::infer`]
//! synthesises a type for an inferrable term, and [`Elaborator::check`]
//! consumes a checkable term against a goal. Where bidirectionality is not
//! enough, the elaborator invents metavariables and emits subtype
//! obligations into the constraint graph instead of unifying eagerly; the
//! graph, not the elaborator, decides whether the program hangs together.
//!
//! Inference returns, alongside the type and the elaborated term, a usage
//! vector counting how often each context binding was referenced. Binder
//! cases drop their own binding's entry on the way out.

use std::cell::RefCell;
use std::panic::panic_any;
use std::sync::Arc;

use scoped_arena::Scope;

use crate::context::TypingContext;
use crate::core::program::Continuation;
use crate::core::semantics::{ArcValue, Closure, EvalContext, Fault, Value};
use crate::core::subst::{add_usages, build_closure, new_usages, Usages};
use crate::core::{self, EffectId, Plicity, OMEGA};
use crate::reporting::{Cause, Error};
use crate::solver::relations::tuple_desc_elems;
use crate::solver::TypecheckerState;
use crate::source::{Span, SpannedName};
use crate::surface::{Checkable, Term};
use crate::{StringId, StringInterner};

/// Look up a variant name's closest neighbour among the declared
/// variants, for diagnostics.
fn suggest_variant(
    interner: &StringInterner,
    variant: StringId,
    candidates: impl Iterator<Item = StringId>,
) -> Option<StringId> {
    let variant = interner.resolve(variant)?;
    candidates.min_by_key(|candidate| {
        interner
            .resolve(*candidate)
            .map(|candidate| levenshtein::levenshtein(variant, candidate))
            .unwrap_or(usize::MAX)
    })
}

/// The result of type synthesis: the type, the per-binding usage counts,
/// and the elaborated term.
#[derive(Debug, Clone)]
pub struct Inference<'arena> {
    pub r#type: ArcValue<'arena>,
    pub usages: Usages,
    pub term: &'arena core::Term<'arena>,
}

/// Elaboration context.
pub struct Elaborator<'interner, 'arena> {
    /// Global string interner.
    interner: &'interner RefCell<StringInterner>,
    /// Scoped arena for storing elaborated terms.
    scope: &'arena Scope<'arena>,
    /// The solver state: constraint graph, metavariables, memo tables.
    state: TypecheckerState<'arena>,
}

impl<'interner, 'arena> Elaborator<'interner, 'arena> {
    /// Construct a new elaboration context, backed by the supplied arena.
    pub fn new(
        interner: &'interner RefCell<StringInterner>,
        scope: &'arena Scope<'arena>,
    ) -> Elaborator<'interner, 'arena> {
        let state = TypecheckerState::new(scope, &mut interner.borrow_mut());
        Elaborator {
            interner,
            scope,
            state,
        }
    }

    pub fn state(&mut self) -> &mut TypecheckerState<'arena> {
        &mut self.state
    }

    pub fn state_ref(&self) -> &TypecheckerState<'arena> {
        &self.state
    }

    pub fn interner(&self) -> &'interner RefCell<StringInterner> {
        self.interner
    }

    /// Evaluate an elaborated term.
    pub fn evaluate(
        &mut self,
        term: &'arena core::Term<'arena>,
        ctx: &TypingContext<'arena>,
    ) -> Result<ArcValue<'arena>, Error<'arena>> {
        EvalContext::with_ambient(&mut self.state, ctx.clone()).eval(term, ctx.runtime())
    }

    /// Apply a function value to an argument.
    pub fn apply_value(
        &mut self,
        fun: ArcValue<'arena>,
        arg: ArcValue<'arena>,
    ) -> Result<ArcValue<'arena>, Error<'arena>> {
        EvalContext::new(&mut self.state).apply(fun, arg)
    }

    /// Run a program value to completion through the effect handlers.
    pub fn execute_program(
        &mut self,
        program: &ArcValue<'arena>,
    ) -> Result<ArcValue<'arena>, Error<'arena>> {
        EvalContext::new(&mut self.state).execute_program(program)
    }

    /// Resume a suspended program.
    pub fn invoke_continuation(
        &mut self,
        continuation: &Continuation<'arena>,
        value: ArcValue<'arena>,
    ) -> Result<ArcValue<'arena>, Error<'arena>> {
        EvalContext::new(&mut self.state).invoke_continuation(continuation, value)
    }

    fn fresh_meta(&mut self, ctx: &TypingContext<'arena>) -> ArcValue<'arena> {
        let meta = self.state.metavariable(ctx.len(), false);
        Value::meta(meta)
    }

    fn flow(
        &mut self,
        val: &ArcValue<'arena>,
        val_ctx: &TypingContext<'arena>,
        use_: &ArcValue<'arena>,
        use_ctx: &TypingContext<'arena>,
        reason: &'static str,
        span: Span,
    ) -> Result<(), Error<'arena>> {
        self.state
            .flow(val, val_ctx, use_, use_ctx, Cause::primitive(reason, span))
    }

    /// Run `f` one binder scope deeper: metavariables created inside are
    /// recognisably local and will be sliced when values escape the scope.
    fn in_block<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, Error<'arena>>,
    ) -> Result<T, Error<'arena>> {
        self.state.enter_block();
        let result = f(self);
        self.state.exit_block();
        result
    }

    /// Synthesise the type of the given surface term.
    pub fn infer(
        &mut self,
        term: &'arena Term<'arena>,
        ctx: &TypingContext<'arena>,
    ) -> Result<Inference<'arena>, Error<'arena>> {
        let memo_key = (term as *const Term<'arena> as usize, ctx.id());
        if let Some((r#type, usages, term)) = self.state.infer_memo_get(&memo_key) {
            return Ok(Inference {
                r#type,
                usages,
                term,
            });
        }

        let inference = self.infer_uncached(term, ctx)?;
        self.state.infer_memo_insert(
            memo_key,
            (
                inference.r#type.clone(),
                inference.usages.clone(),
                inference.term,
            ),
        );
        Ok(inference)
    }

    fn infer_uncached(
        &mut self,
        term: &'arena Term<'arena>,
        ctx: &TypingContext<'arena>,
    ) -> Result<Inference<'arena>, Error<'arena>> {
        match term {
            Term::Var(span, index, name) => {
                let level = match ctx.len().index_to_level(*index) {
                    Some(level) => level,
                    None => panic_any(Fault::UnboundVariable),
                };
                let entry = ctx.get(level).unwrap_or_else(|| panic_any(Fault::UnboundVariable));
                if entry.name != *name {
                    panic_any(Fault::DebugMismatch {
                        expected: entry.name,
                        found: *name,
                    });
                }
                let r#type = ctx
                    .get_type(level)
                    .unwrap_or_else(|| panic_any(Fault::UnboundVariable))
                    .clone();
                let mut usages = new_usages(ctx.len());
                usages[level.to_usize()] += 1;
                Ok(Inference {
                    r#type,
                    usages,
                    term: self.scope.to_scope(core::Term::Var(*span, *index, *name)),
                })
            }

            Term::Lambda {
                param,
                plicity,
                purity,
                param_type,
                body,
                ..
            } => {
                let param_inf = self.infer(param_type, ctx)?;
                let param_value = self.evaluate(param_inf.term, ctx)?;
                let (body_ctx, _) = ctx.push_param(param_value.clone(), *param);

                let (lambda, result_closure, body_usages) = self.in_block(|this| {
                    let body_inf = this.infer(body, &body_ctx)?;
                    let body_value = this.evaluate(body_inf.term, &body_ctx)?;
                    let lambda = build_closure(&mut this.state, &body_value, ctx, *param)?;
                    let result = build_closure(&mut this.state, &body_inf.r#type, ctx, *param)?;
                    Ok((lambda, result, body_inf.usages))
                })?;

                let r#type = Arc::new(Value::FunType {
                    plicity: *plicity,
                    purity: *purity,
                    param_type: param_value,
                    result: Arc::new(Value::FunLit(result_closure.closure)),
                });

                let mut usages = param_inf.usages;
                add_usages(&mut usages, &truncated(&body_usages, ctx));
                Ok(Inference {
                    r#type,
                    usages,
                    term: lambda.term,
                })
            }

            Term::Pi {
                span,
                param,
                plicity,
                purity,
                param_type,
                body_type,
            } => {
                let param_inf = self.infer(param_type, ctx)?;
                let param_value = self.evaluate(param_inf.term, ctx)?;
                let (body_ctx, _) = ctx.push_param(param_value, *param);

                let (result, body_type_type, body_usages) = self.in_block(|this| {
                    let body_inf = this.infer(body_type, &body_ctx)?;
                    let body_value = this.evaluate(body_inf.term, &body_ctx)?;
                    let result = build_closure(&mut this.state, &body_value, ctx, *param)?;
                    Ok((result, body_inf.r#type, body_inf.usages))
                })?;

                let universe = self.fresh_meta(ctx);
                self.flow(
                    &param_inf.r#type,
                    ctx,
                    &universe,
                    ctx,
                    "function parameter type must inhabit the universe",
                    *span,
                )?;
                self.flow(
                    &body_type_type,
                    &body_ctx,
                    &universe,
                    ctx,
                    "function result type must inhabit the universe",
                    *span,
                )?;

                let mut usages = param_inf.usages;
                add_usages(&mut usages, &truncated(&body_usages, ctx));
                Ok(Inference {
                    r#type: Arc::new(Value::UnionType(Value::star(0, 0), universe)),
                    usages,
                    term: self.scope.to_scope(core::Term::FunType(
                        *span,
                        *plicity,
                        *purity,
                        param_inf.term,
                        result.term,
                    )),
                })
            }

            Term::App(span, fun, arg) => {
                let fun_inf = self.infer(fun, ctx)?;
                let mut fun_term = fun_inf.term;
                let mut fun_type = fun_inf.r#type.clone();
                let mut usages = fun_inf.usages;

                // Implicit-argument elaboration: while the head's parameter
                // is implicit, invent a metavariable and apply.
                loop {
                    let (param_type, result) = match fun_type.as_ref() {
                        Value::FunType {
                            plicity: Plicity::Implicit,
                            param_type,
                            result,
                            ..
                        } => (param_type.clone(), result.clone()),
                        _ => break,
                    };
                    let meta_value = self.fresh_meta(ctx);
                    self.flow(
                        &meta_value,
                        ctx,
                        &param_type,
                        ctx,
                        "implicit argument",
                        *span,
                    )?;
                    let meta = meta_value.match_meta().unwrap();
                    let meta_term = self.scope.to_scope(core::Term::Meta(*span, meta));
                    fun_term = self
                        .scope
                        .to_scope(core::Term::FunApp(*span, fun_term, meta_term));
                    fun_type = self.apply_value(result, meta_value)?;
                }

                let (param_type, result) = match fun_type.as_ref() {
                    Value::FunType {
                        plicity: Plicity::Explicit,
                        param_type,
                        result,
                        ..
                    } => (param_type.clone(), result.clone()),
                    Value::HostFunType {
                        param_type, result, ..
                    } => (param_type.clone(), result.clone()),
                    _ => {
                        return Err(Error::NotAFunction {
                            span: *span,
                            found: fun_type,
                        })
                    }
                };

                let arg_inf = self.infer(arg, ctx)?;
                self.flow(
                    &arg_inf.r#type,
                    ctx,
                    &param_type,
                    ctx,
                    "argument must fit the parameter type",
                    *span,
                )?;
                let arg_value = self.evaluate(arg_inf.term, ctx)?;
                let result_type = self.apply_value(result, arg_value)?;

                add_usages(&mut usages, &arg_inf.usages);
                Ok(Inference {
                    r#type: result_type,
                    usages,
                    term: self
                        .scope
                        .to_scope(core::Term::FunApp(*span, fun_term, arg_inf.term)),
                })
            }

            Term::TupleLit(span, elems) => {
                let mut usages = new_usages(ctx.len());
                let mut elem_terms = Vec::with_capacity(elems.len());
                let mut desc = desc_empty(&mut self.state);

                // Each position's descriptor entry is the singleton of the
                // inferred type at the inferred value, so later elements
                // may depend on earlier ones.
                for elem in elems.iter() {
                    let elem_inf = self.infer(elem, ctx)?;
                    add_usages(&mut usages, &elem_inf.usages);
                    let elem_value = self.evaluate(elem_inf.term, ctx)?;
                    let singleton = Arc::new(Value::Singleton {
                        supertype: elem_inf.r#type.clone(),
                        value: elem_value,
                    });
                    let type_fn = const_type_fn(&mut self.state, singleton);
                    desc = desc_cons(&mut self.state, desc, type_fn);
                    elem_terms.push((*elem_inf.term).clone());
                }

                Ok(Inference {
                    r#type: Arc::new(Value::TupleType(desc)),
                    usages,
                    term: self.scope.to_scope(core::Term::TupleLit(
                        *span,
                        self.scope.to_scope_from_iter(elem_terms),
                    )),
                })
            }

            Term::TupleElim {
                span,
                names,
                subject,
                body,
            } => {
                let subject_inf = self.infer(subject, ctx)?;
                let subject_value = self.evaluate(subject_inf.term, ctx)?;
                let count = names.len();

                // Try the tuple-type reading first and fall back to the
                // host-tuple-type reading; neither attempt may pollute the
                // graph, and if both fail the primary failure is reported.
                let subject_type = subject_inf.r#type.clone();
                let elem_types = match self.state.speculate(|state| {
                    tuple_elim_element_types(
                        state,
                        ctx,
                        &subject_type,
                        &subject_value,
                        count,
                        false,
                        *span,
                    )
                }) {
                    Ok(types) => types,
                    Err(primary) => match self.state.speculate(|state| {
                        tuple_elim_element_types(
                            state,
                            ctx,
                            &subject_type,
                            &subject_value,
                            count,
                            true,
                            *span,
                        )
                    }) {
                        Ok(types) => types,
                        Err(_) => return Err(primary),
                    },
                };

                let mut inner_ctx = ctx.clone();
                for (position, (name, elem_type)) in
                    Iterator::zip(names.iter(), elem_types.into_iter()).enumerate()
                {
                    let elem_value = EvalContext::with_ambient(&mut self.state, ctx.clone())
                        .index_tuple(&subject_value, position)?;
                    inner_ctx = inner_ctx.push_def(elem_value, elem_type, *name);
                }

                let body_inf = self.infer(body, &inner_ctx)?;
                let mut usages = subject_inf.usages;
                add_usages(&mut usages, &truncated(&body_inf.usages, ctx));
                Ok(Inference {
                    r#type: body_inf.r#type,
                    usages,
                    term: self.scope.to_scope(core::Term::TupleElim {
                        span: *span,
                        names,
                        subject: subject_inf.term,
                        body: body_inf.term,
                    }),
                })
            }

            Term::TupleType(span, desc) => {
                self.infer_type_former(span, desc, ctx, TypeFormer::Tuple)
            }
            Term::HostTupleType(span, desc) => {
                self.infer_type_former(span, desc, ctx, TypeFormer::HostTuple)
            }
            Term::EnumType(span, desc) => {
                self.infer_type_former(span, desc, ctx, TypeFormer::Enum)
            }

            Term::RecordLit(span, labels, exprs) => {
                let mut usages = new_usages(ctx.len());
                let mut fields = Vec::with_capacity(labels.len());
                let mut expr_terms = Vec::with_capacity(exprs.len());
                for (label, expr) in Iterator::zip(labels.iter(), exprs.iter()) {
                    let expr_inf = self.infer(expr, ctx)?;
                    add_usages(&mut usages, &expr_inf.usages);
                    let field_type = const_type_fn(&mut self.state, expr_inf.r#type.clone());
                    fields.push((*label, field_type));
                    expr_terms.push((*expr_inf.term).clone());
                }
                Ok(Inference {
                    r#type: Arc::new(Value::RecordType(Arc::new(Value::RecordDescLit(fields)))),
                    usages,
                    term: self.scope.to_scope(core::Term::RecordLit(
                        *span,
                        labels,
                        self.scope.to_scope_from_iter(expr_terms),
                    )),
                })
            }

            Term::RecordElim {
                span,
                subject,
                fields,
                names,
                body,
            } => {
                let subject_inf = self.infer(subject, ctx)?;
                let subject_value = self.evaluate(subject_inf.term, ctx)?;

                // Records do not get the speculative dual path: the
                // subject's type must be a record type outright.
                let desc_fields = match subject_inf.r#type.as_ref() {
                    Value::RecordType(desc) => match desc.as_ref() {
                        Value::RecordDescLit(desc_fields) => desc_fields.clone(),
                        _ => {
                            return Err(Error::NotARecord {
                                span: *span,
                                found: subject_inf.r#type.clone(),
                            })
                        }
                    },
                    _ => {
                        return Err(Error::NotARecord {
                            span: *span,
                            found: subject_inf.r#type.clone(),
                        })
                    }
                };

                let mut inner_ctx = ctx.clone();
                for (field, name) in Iterator::zip(fields.iter(), names.iter()) {
                    let field_fn = desc_fields
                        .iter()
                        .find(|(label, _)| label == field)
                        .map(|(_, field_fn)| field_fn.clone())
                        .ok_or(Error::MissingField { field: *field })?;
                    let field_type = self.apply_value(field_fn, subject_value.clone())?;
                    let field_value = EvalContext::with_ambient(&mut self.state, ctx.clone())
                        .index_record(&subject_value, *field)?;
                    inner_ctx = inner_ctx.push_def(field_value, field_type, *name);
                }

                let body_inf = self.infer(body, &inner_ctx)?;
                let mut usages = subject_inf.usages;
                add_usages(&mut usages, &truncated(&body_inf.usages, ctx));
                Ok(Inference {
                    r#type: body_inf.r#type,
                    usages,
                    term: self.scope.to_scope(core::Term::RecordElim {
                        span: *span,
                        subject: subject_inf.term,
                        fields,
                        names,
                        body: body_inf.term,
                    }),
                })
            }

            Term::EnumLit(span, variant, payload) => {
                let payload_inf = self.infer(payload, ctx)?;
                let desc = Arc::new(Value::EnumDescLit(vec![(
                    *variant,
                    payload_inf.r#type.clone(),
                )]));
                Ok(Inference {
                    r#type: Arc::new(Value::EnumType(desc)),
                    usages: payload_inf.usages,
                    term: self.scope.to_scope(core::Term::EnumLit(
                        *span,
                        *variant,
                        payload_inf.term,
                    )),
                })
            }

            Term::EnumCase {
                span,
                subject,
                arms,
            } => {
                let subject_inf = self.infer(subject, ctx)?;

                // When the subject's type is already a concrete enum, a
                // missing arm is a better error than a failed descriptor
                // constraint, and we can suggest the closest arm name.
                if let Value::EnumType(desc) = subject_inf.r#type.as_ref() {
                    if let Value::EnumDescLit(variants) = desc.as_ref() {
                        for (variant, _) in variants {
                            if !arms.iter().any(|(arm, _, _)| arm == variant) {
                                let interner = self.interner.borrow();
                                let suggestion = suggest_variant(
                                    &interner,
                                    *variant,
                                    arms.iter().map(|(arm, _, _)| *arm),
                                );
                                return Err(Error::MissingVariant {
                                    variant: *variant,
                                    suggestion,
                                });
                            }
                        }
                    }
                }

                // One metavariable per variant payload; the subject must
                // fit the enum of exactly the case's variants.
                let mut payload_types = Vec::with_capacity(arms.len());
                let mut desc_variants = Vec::with_capacity(arms.len());
                for (variant, _, _) in arms.iter() {
                    let payload_type = self.fresh_meta(ctx);
                    desc_variants.push((*variant, payload_type.clone()));
                    payload_types.push(payload_type);
                }
                let expected: ArcValue<'arena> =
                    Arc::new(Value::EnumType(Arc::new(Value::EnumDescLit(desc_variants))));
                self.flow(
                    &subject_inf.r#type,
                    ctx,
                    &expected,
                    ctx,
                    "case subject must fit the enum of its arms",
                    *span,
                )?;

                let mut usages = subject_inf.usages;
                let mut result_type: Option<ArcValue<'arena>> = None;
                let mut arm_terms = Vec::with_capacity(arms.len());
                for ((variant, payload_name, arm_body), payload_type) in
                    Iterator::zip(arms.iter(), payload_types.into_iter())
                {
                    let (arm_ctx, _) = ctx.push_param(payload_type, *payload_name);
                    let (arm_built, arm_type, arm_usages) = self.in_block(|this| {
                        let arm_inf = this.infer(arm_body, &arm_ctx)?;
                        let arm_value = this.evaluate(arm_inf.term, &arm_ctx)?;
                        let built =
                            build_closure(&mut this.state, &arm_value, ctx, *payload_name)?;
                        Ok((built, arm_inf.r#type, arm_inf.usages))
                    })?;
                    add_usages(&mut usages, &truncated(&arm_usages, ctx));
                    arm_terms.push((*variant, (*arm_built.term).clone()));
                    result_type = Some(match result_type {
                        None => arm_type,
                        Some(previous) => Arc::new(Value::UnionType(previous, arm_type)),
                    });
                }

                let result_type = result_type.unwrap_or_else(|| {
                    // A case with no arms eliminates the empty enum.
                    Arc::new(Value::EnumType(Arc::new(Value::EnumDescLit(Vec::new()))))
                });
                Ok(Inference {
                    r#type: result_type,
                    usages,
                    term: self.scope.to_scope(core::Term::EnumElim {
                        span: *span,
                        subject: subject_inf.term,
                        arms: self.scope.to_scope_from_iter(arm_terms),
                    }),
                })
            }

            Term::HostIntrinsic {
                span,
                source,
                r#type,
            } => {
                let source_inf = self.infer(source, ctx)?;
                let string_type: ArcValue<'arena> = Arc::new(Value::HostStringType);
                self.flow(
                    &source_inf.r#type,
                    ctx,
                    &string_type,
                    ctx,
                    "intrinsic source must be a host string",
                    *span,
                )?;
                let type_inf = self.infer(r#type, ctx)?;
                let type_value = self.evaluate(type_inf.term, ctx)?;
                let mut usages = source_inf.usages;
                add_usages(&mut usages, &type_inf.usages);
                Ok(Inference {
                    r#type: type_value,
                    usages,
                    term: self.scope.to_scope(core::Term::HostIntrinsic {
                        span: *span,
                        source: source_inf.term,
                        r#type: type_inf.term,
                    }),
                })
            }

            Term::HostFunType {
                span,
                purity,
                param,
                param_type,
                body_type,
            } => {
                let param_inf = self.infer(param_type, ctx)?;
                let param_value = self.evaluate(param_inf.term, ctx)?;
                let (body_ctx, _) = ctx.push_param(param_value, *param);

                let (result, body_type_type, body_usages) = self.in_block(|this| {
                    let body_inf = this.infer(body_type, &body_ctx)?;
                    let body_value = this.evaluate(body_inf.term, &body_ctx)?;
                    let result = build_closure(&mut this.state, &body_value, ctx, *param)?;
                    Ok((result, body_inf.r#type, body_inf.usages))
                })?;

                let universe = self.fresh_meta(ctx);
                self.flow(
                    &param_inf.r#type,
                    ctx,
                    &universe,
                    ctx,
                    "host parameter type must inhabit the universe",
                    *span,
                )?;
                self.flow(
                    &body_type_type,
                    &body_ctx,
                    &universe,
                    ctx,
                    "host result type must inhabit the universe",
                    *span,
                )?;

                let mut usages = param_inf.usages;
                add_usages(&mut usages, &truncated(&body_usages, ctx));
                Ok(Inference {
                    r#type: Arc::new(Value::UnionType(Value::star(0, 0), universe)),
                    usages,
                    term: self.scope.to_scope(core::Term::HostFunType(
                        *span,
                        *purity,
                        param_inf.term,
                        result.term,
                    )),
                })
            }

            Term::HostIf {
                span,
                subject,
                consequent,
                alternate,
            } => {
                let subject_inf = self.infer(subject, ctx)?;
                let bool_type: ArcValue<'arena> = Arc::new(Value::HostBoolType);
                self.flow(
                    &subject_inf.r#type,
                    ctx,
                    &bool_type,
                    ctx,
                    "conditional subject must be a host boolean",
                    *span,
                )?;

                // Both branches flow covariantly into one fresh
                // metavariable, which becomes the conditional's type.
                let result_type = self.fresh_meta(ctx);
                let consequent_inf = self.infer(consequent, ctx)?;
                self.flow(
                    &consequent_inf.r#type,
                    ctx,
                    &result_type,
                    ctx,
                    "true branch flows into the conditional type",
                    *span,
                )?;
                let alternate_inf = self.infer(alternate, ctx)?;
                self.flow(
                    &alternate_inf.r#type,
                    ctx,
                    &result_type,
                    ctx,
                    "false branch flows into the conditional type",
                    *span,
                )?;

                let mut usages = subject_inf.usages;
                add_usages(&mut usages, &consequent_inf.usages);
                add_usages(&mut usages, &alternate_inf.usages);
                Ok(Inference {
                    r#type: result_type,
                    usages,
                    term: self.scope.to_scope(core::Term::HostIf {
                        span: *span,
                        subject: subject_inf.term,
                        consequent: consequent_inf.term,
                        alternate: alternate_inf.term,
                    }),
                })
            }

            Term::Star(span, level, depth) => {
                if level + 1 > OMEGA {
                    return Err(Error::LevelOverflow { span: *span });
                }
                Ok(Inference {
                    r#type: Value::star(level + 1, depth + 1),
                    usages: new_usages(ctx.len()),
                    term: self.scope.to_scope(core::Term::Star(*span, *level, *depth)),
                })
            }
            Term::Prop(span) => Ok(Inference {
                r#type: Value::star(1, 1),
                usages: new_usages(ctx.len()),
                term: self.scope.to_scope(core::Term::Prop(*span)),
            }),
            Term::LevelType(span) => Ok(Inference {
                r#type: Value::star(0, 0),
                usages: new_usages(ctx.len()),
                term: self.scope.to_scope(core::Term::LevelType(*span)),
            }),
            Term::Level0(span) => Ok(Inference {
                r#type: Arc::new(Value::LevelType),
                usages: new_usages(ctx.len()),
                term: self.scope.to_scope(core::Term::Level0(*span)),
            }),
            Term::LevelSuc(span, inner) => {
                let inner_inf = self.infer(inner, ctx)?;
                let level_type: ArcValue<'arena> = Arc::new(Value::LevelType);
                self.flow(
                    &inner_inf.r#type,
                    ctx,
                    &level_type,
                    ctx,
                    "successor of a level",
                    *span,
                )?;
                Ok(Inference {
                    r#type: level_type,
                    usages: inner_inf.usages,
                    term: self
                        .scope
                        .to_scope(core::Term::LevelSuc(*span, inner_inf.term)),
                })
            }
            Term::LevelMax(span, left, right) => {
                let left_inf = self.infer(left, ctx)?;
                let right_inf = self.infer(right, ctx)?;
                let level_type: ArcValue<'arena> = Arc::new(Value::LevelType);
                self.flow(
                    &left_inf.r#type,
                    ctx,
                    &level_type,
                    ctx,
                    "maximum of levels",
                    *span,
                )?;
                self.flow(
                    &right_inf.r#type,
                    ctx,
                    &level_type,
                    ctx,
                    "maximum of levels",
                    *span,
                )?;
                let mut usages = left_inf.usages;
                add_usages(&mut usages, &right_inf.usages);
                Ok(Inference {
                    r#type: level_type,
                    usages,
                    term: self.scope.to_scope(core::Term::LevelMax(
                        *span,
                        left_inf.term,
                        right_inf.term,
                    )),
                })
            }

            Term::Let {
                span,
                name,
                def,
                body,
            } => {
                let def_inf = self.infer(def, ctx)?;
                let def_value = self.evaluate(def_inf.term, ctx)?;
                let inner_ctx = ctx.push_def(def_value, def_inf.r#type.clone(), *name);
                let body_inf = self.infer(body, &inner_ctx)?;
                let mut usages = def_inf.usages;
                add_usages(&mut usages, &truncated(&body_inf.usages, ctx));
                Ok(Inference {
                    r#type: body_inf.r#type,
                    usages,
                    term: self.scope.to_scope(core::Term::Let(
                        *span,
                        *name,
                        def_inf.term,
                        body_inf.term,
                    )),
                })
            }

            Term::ProgramSequence(span, first, cont) => {
                let first_inf = self.infer(first, ctx)?;
                let (first_effects, first_result) = match first_inf.r#type.as_ref() {
                    Value::ProgramType { effects, result } => (effects.clone(), result.clone()),
                    _ => {
                        return Err(Error::NotAProgram {
                            span: *span,
                            found: first_inf.r#type.clone(),
                        })
                    }
                };

                let cont_inf = self.infer(cont, ctx)?;
                let (cont_param, cont_result) = match cont_inf.r#type.as_ref() {
                    Value::FunType {
                        param_type, result, ..
                    } => (param_type.clone(), result.clone()),
                    _ => {
                        return Err(Error::NotAFunction {
                            span: *span,
                            found: cont_inf.r#type.clone(),
                        })
                    }
                };
                self.flow(
                    &first_result,
                    ctx,
                    &cont_param,
                    ctx,
                    "first step's result feeds the continuation",
                    *span,
                )?;

                let witness = Value::unique(self.state.fresh_unique());
                let cont_program = self.apply_value(cont_result, witness)?;
                let (cont_effects, cont_result) = match cont_program.as_ref() {
                    Value::ProgramType { effects, result } => (effects.clone(), result.clone()),
                    _ => {
                        return Err(Error::NotAProgram {
                            span: *span,
                            found: cont_program.clone(),
                        })
                    }
                };

                let effects = join_effect_rows(&first_effects, &cont_effects);
                let mut usages = first_inf.usages;
                add_usages(&mut usages, &cont_inf.usages);
                Ok(Inference {
                    r#type: Arc::new(Value::ProgramType {
                        effects,
                        result: cont_result,
                    }),
                    usages,
                    term: self.scope.to_scope(core::Term::ProgramSequence(
                        *span,
                        first_inf.term,
                        cont_inf.term,
                    )),
                })
            }
            Term::ProgramEnd(span, value) => {
                let value_inf = self.infer(value, ctx)?;
                Ok(Inference {
                    r#type: Arc::new(Value::ProgramType {
                        effects: Arc::new(Value::EffectRow(Default::default())),
                        result: value_inf.r#type.clone(),
                    }),
                    usages: value_inf.usages.clone(),
                    term: self
                        .scope
                        .to_scope(core::Term::ProgramEnd(*span, value_inf.term)),
                })
            }
            Term::ProgramInvoke(span, effect, arg) => {
                let effect_inf = self.infer(effect, ctx)?;
                let effect_value = self.evaluate(effect_inf.term, ctx)?;
                let effect_id = match effect_value.as_ref() {
                    Value::EffectElem(effect_id) => *effect_id,
                    _ => return Err(Error::NotImplemented("non-constant effect expressions")),
                };
                let arg_inf = self.infer(arg, ctx)?;
                let result_type = self.fresh_meta(ctx);
                let mut usages = effect_inf.usages;
                add_usages(&mut usages, &arg_inf.usages);
                Ok(Inference {
                    r#type: Arc::new(Value::ProgramType {
                        effects: Arc::new(Value::EffectRow(
                            std::iter::once(effect_id).collect(),
                        )),
                        result: result_type,
                    }),
                    usages,
                    term: self.scope.to_scope(core::Term::ProgramInvoke(
                        *span,
                        effect_inf.term,
                        arg_inf.term,
                    )),
                })
            }
            Term::ProgramType(span, effects, result) => {
                let effects_inf = self.infer(effects, ctx)?;
                let result_inf = self.infer(result, ctx)?;
                let universe = self.fresh_meta(ctx);
                self.flow(
                    &result_inf.r#type,
                    ctx,
                    &universe,
                    ctx,
                    "program result type must inhabit the universe",
                    *span,
                )?;
                let mut usages = effects_inf.usages;
                add_usages(&mut usages, &result_inf.usages);
                Ok(Inference {
                    r#type: Arc::new(Value::UnionType(Value::star(0, 0), universe)),
                    usages,
                    term: self.scope.to_scope(core::Term::ProgramType(
                        *span,
                        effects_inf.term,
                        result_inf.term,
                    )),
                })
            }

            Term::Ann(span, expr, r#type) => {
                let type_inf = self.infer(r#type, ctx)?;
                let type_value = self.evaluate(type_inf.term, ctx)?;
                let expr_inf = self.infer(expr, ctx)?;
                self.flow(
                    &expr_inf.r#type,
                    ctx,
                    &type_value,
                    ctx,
                    "annotated expression",
                    *span,
                )?;
                let mut usages = type_inf.usages;
                add_usages(&mut usages, &expr_inf.usages);
                Ok(Inference {
                    r#type: type_value,
                    usages,
                    term: self.scope.to_scope(core::Term::Ann(
                        *span,
                        expr_inf.term,
                        type_inf.term,
                    )),
                })
            }

            Term::Typed {
                r#type,
                usages,
                term,
                ..
            } => Ok(Inference {
                r#type: r#type.clone(),
                usages: usages.clone(),
                term,
            }),
        }
    }

    /// The shared rule for type formers over descriptors: invent a
    /// universe metavariable, constrain the descriptor's type to the
    /// appropriate descriptor universe, and return the union of the base
    /// universe with it.
    fn infer_type_former(
        &mut self,
        span: &Span,
        desc: &'arena Term<'arena>,
        ctx: &TypingContext<'arena>,
        former: TypeFormer,
    ) -> Result<Inference<'arena>, Error<'arena>> {
        let desc_inf = self.infer(desc, ctx)?;
        let universe = self.fresh_meta(ctx);
        let expected: ArcValue<'arena> = Arc::new(match former {
            TypeFormer::Tuple | TypeFormer::HostTuple => Value::TupleDescType(universe.clone()),
            TypeFormer::Enum => Value::EnumDescType(universe.clone()),
        });
        self.flow(
            &desc_inf.r#type,
            ctx,
            &expected,
            ctx,
            "descriptor must inhabit the descriptor universe",
            *span,
        )?;

        let term = match former {
            TypeFormer::Tuple => core::Term::TupleType(*span, desc_inf.term),
            TypeFormer::HostTuple => core::Term::HostTupleType(*span, desc_inf.term),
            TypeFormer::Enum => core::Term::EnumType(*span, desc_inf.term),
        };
        Ok(Inference {
            r#type: Arc::new(Value::UnionType(Value::star(0, 0), universe)),
            usages: desc_inf.usages,
            term: self.scope.to_scope(term),
        })
    }

    /// Check a checkable term against a goal type.
    pub fn check(
        &mut self,
        term: &'arena Checkable<'arena>,
        ctx: &TypingContext<'arena>,
        goal: &ArcValue<'arena>,
    ) -> Result<(Usages, &'arena core::Term<'arena>), Error<'arena>> {
        match term {
            Checkable::Infer(term) => {
                let inference = self.infer(term, ctx)?;
                self.flow(
                    &inference.r#type,
                    ctx,
                    goal,
                    ctx,
                    "inferred type flows into the goal",
                    term.span(),
                )?;
                Ok((inference.usages, inference.term))
            }

            Checkable::TupleLit(span, elems) => {
                let (usages, terms, desc) = self.check_tuple_elems(elems, ctx)?;
                let tuple_type: ArcValue<'arena> = Arc::new(Value::TupleType(desc));
                self.flow(
                    &tuple_type,
                    ctx,
                    goal,
                    ctx,
                    "tuple type flows into the goal",
                    *span,
                )?;
                Ok((
                    usages,
                    self.scope.to_scope(core::Term::TupleLit(
                        *span,
                        self.scope.to_scope_from_iter(terms),
                    )),
                ))
            }
            Checkable::HostTupleLit(span, elems) => {
                let (usages, terms, desc) = self.check_tuple_elems(elems, ctx)?;
                let tuple_type: ArcValue<'arena> = Arc::new(Value::HostTupleType(desc));
                self.flow(
                    &tuple_type,
                    ctx,
                    goal,
                    ctx,
                    "host tuple type flows into the goal",
                    *span,
                )?;
                Ok((
                    usages,
                    self.scope.to_scope(core::Term::HostTupleLit(
                        *span,
                        self.scope.to_scope_from_iter(terms),
                    )),
                ))
            }

            Checkable::Lambda { span, param, body } => {
                let (param_type, result) = match goal.as_ref() {
                    Value::FunType {
                        param_type, result, ..
                    } => (param_type.clone(), result.clone()),
                    _ => {
                        return Err(Error::NotAFunction {
                            span: *span,
                            found: goal.clone(),
                        })
                    }
                };

                let (body_ctx, placeholder) = ctx.push_param(param_type, *param);
                let body_goal = self.apply_value(result, placeholder)?;
                let (built, body_usages) = self.in_block(|this| {
                    let (body_usages, body_term) = this.check(body, &body_ctx, &body_goal)?;
                    let body_value = this.evaluate(body_term, &body_ctx)?;
                    let built = build_closure(&mut this.state, &body_value, ctx, *param)?;
                    Ok((built, body_usages))
                })?;

                Ok((truncated(&body_usages, ctx), built.term))
            }
        }
    }

    /// Check each tuple element against a fresh positional metavariable
    /// and build the corresponding descriptor.
    fn check_tuple_elems(
        &mut self,
        elems: &'arena [Checkable<'arena>],
        ctx: &TypingContext<'arena>,
    ) -> Result<(Usages, Vec<core::Term<'arena>>, ArcValue<'arena>), Error<'arena>> {
        let mut usages = new_usages(ctx.len());
        let mut terms = Vec::with_capacity(elems.len());
        let mut desc = desc_empty(&mut self.state);
        for elem in elems {
            let elem_type = self.fresh_meta(ctx);
            let (elem_usages, elem_term) = self.check(elem, ctx, &elem_type)?;
            add_usages(&mut usages, &elem_usages);
            terms.push((*elem_term).clone());
            let type_fn = const_type_fn(&mut self.state, elem_type);
            desc = desc_cons(&mut self.state, desc, type_fn);
        }
        Ok((usages, terms, desc))
    }
}

#[derive(Debug, Copy, Clone)]
enum TypeFormer {
    Tuple,
    HostTuple,
    Enum,
}

/// Drop the entries beyond the outer context's length (the binder's own
/// bindings) from a usage vector.
fn truncated<'arena>(usages: &Usages, ctx: &TypingContext<'arena>) -> Usages {
    let mut usages = usages.clone();
    usages.truncate(ctx.len().to_usize());
    usages
}

/// The empty canonical tuple descriptor.
fn desc_empty<'arena>(state: &mut TypecheckerState<'arena>) -> ArcValue<'arena> {
    let symbols = state.symbols();
    Arc::new(Value::EnumLit(
        symbols.empty,
        Arc::new(Value::TupleLit(Vec::new())),
    ))
}

/// Extend a canonical tuple descriptor by one position.
fn desc_cons<'arena>(
    state: &mut TypecheckerState<'arena>,
    prev: ArcValue<'arena>,
    type_fn: ArcValue<'arena>,
) -> ArcValue<'arena> {
    let symbols = state.symbols();
    Arc::new(Value::EnumLit(
        symbols.cons,
        Arc::new(Value::TupleLit(vec![prev, type_fn])),
    ))
}

/// A constant function value, for descriptor positions that do not depend
/// on their prefix.
fn const_type_fn<'arena>(
    state: &mut TypecheckerState<'arena>,
    value: ArcValue<'arena>,
) -> ArcValue<'arena> {
    let name = SpannedName::new(state.symbols().capture, Span::Empty);
    let body = state.scope().to_scope(core::Term::Literal(Span::Empty, value));
    Arc::new(Value::FunLit(Closure::new(
        Arc::new(Value::TupleLit(Vec::new())),
        name,
        name,
        body,
    )))
}

/// The element types a tuple elimination binds, under one of the two
/// speculative readings of the subject's type.
///
/// A concrete (host) tuple type is destructured directly, applying each
/// descriptor position to the actual prefix of the subject. Anything else
/// is constrained against a fresh tuple type whose positions are fresh
/// metavariables.
fn tuple_elim_element_types<'arena>(
    state: &mut TypecheckerState<'arena>,
    ctx: &TypingContext<'arena>,
    subject_type: &ArcValue<'arena>,
    subject: &ArcValue<'arena>,
    count: usize,
    host: bool,
    span: Span,
) -> Result<Vec<ArcValue<'arena>>, Error<'arena>> {
    let concrete_desc = match (subject_type.as_ref(), host) {
        (Value::TupleType(desc), false) => Some(desc.clone()),
        (Value::HostTupleType(desc), true) => Some(desc.clone()),
        _ => None,
    };

    if let Some(desc) = concrete_desc {
        let elems = tuple_desc_elems(state, &desc)
            .ok_or(Error::NotImplemented("destructuring a stuck tuple descriptor"))?;
        if elems.len() != count {
            return Err(Error::TupleLengthMismatch {
                found: count,
                expected: elems.len(),
            });
        }
        let mut types = Vec::with_capacity(count);
        let mut prefix: Vec<ArcValue<'arena>> = Vec::with_capacity(count);
        for (position, type_fn) in elems.into_iter().enumerate() {
            let prefix_value: ArcValue<'arena> = Arc::new(Value::TupleLit(prefix.clone()));
            let elem_type =
                EvalContext::with_ambient(state, ctx.clone()).apply(type_fn, prefix_value)?;
            types.push(elem_type);
            let elem =
                EvalContext::with_ambient(state, ctx.clone()).index_tuple(subject, position)?;
            prefix.push(elem);
        }
        return Ok(types);
    }

    let mut types = Vec::with_capacity(count);
    let mut desc = desc_empty(state);
    for _ in 0..count {
        let meta = state.metavariable(ctx.len(), false);
        let meta_value = Value::meta(meta);
        types.push(meta_value.clone());
        let type_fn = const_type_fn(state, meta_value);
        desc = desc_cons(state, desc, type_fn);
    }
    let expected: ArcValue<'arena> = Arc::new(match host {
        false => Value::TupleType(desc),
        true => Value::HostTupleType(desc),
    });
    state.flow(
        subject_type,
        ctx,
        &expected,
        ctx,
        Cause::primitive(
            match host {
                false => "subject must be a tuple",
                true => "subject must be a host tuple",
            },
            span,
        ),
    )?;
    Ok(types)
}

/// Join two effect rows. Concrete rows union; anything else keeps the
/// continuation's row.
fn join_effect_rows<'arena>(
    first: &ArcValue<'arena>,
    second: &ArcValue<'arena>,
) -> ArcValue<'arena> {
    let elems = |value: &ArcValue<'arena>| -> Option<std::collections::BTreeSet<EffectId>> {
        match value.as_ref() {
            Value::EffectRow(row) => Some(row.clone()),
            Value::EffectElem(effect) => Some(std::iter::once(*effect).collect()),
            _ => None,
        }
    };
    match (elems(first), elems(second)) {
        (Some(mut row0), Some(row1)) => {
            row0.extend(row1);
            Arc::new(Value::EffectRow(row0))
        }
        (_, _) => second.clone(),
    }
}
