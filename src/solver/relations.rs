//! Subtype relations.
//!
//! A relation is a trait object with a single operation used by the
//! solver: `constrain`, the concrete head check. Relations are compared
//! by identity, so combinator construction is interned —
//! [`TypecheckerState::function_relation`] memoises the pointwise lifting
//! by the identity of the lifted relation.
//!
//! [`UniverseOmegaRelation`] is the universal relation: its head check is
//! [`check_concrete`], the dispatcher over pairs of value heads where
//! concrete incompatibilities are detected.

use std::fmt;
use std::sync::Arc;

use crate::context::TypingContext;
use crate::core::semantics::{
    convertible, ArcValue, EvalContext, FreeVar, Stuck, Value,
};
use crate::core::Plicity;
use crate::reporting::{Cause, Error};
use crate::solver::TypecheckerState;

/// A subtype relation, by shared reference. Identity is pointer identity.
pub type Rel<'arena> = Arc<dyn SubtypeRelation<'arena> + 'arena>;

pub trait SubtypeRelation<'arena>: fmt::Debug {
    /// The relation's name, for diagnostics.
    fn name(&self) -> &'static str;

    /// Check one concrete obligation `val ≤ use`, emitting sub-obligations
    /// through the solver as needed.
    fn constrain(
        &self,
        state: &mut TypecheckerState<'arena>,
        left_ctx: &TypingContext<'arena>,
        val: &ArcValue<'arena>,
        right_ctx: &TypingContext<'arena>,
        use_: &ArcValue<'arena>,
        cause: &Arc<Cause>,
    ) -> Result<(), Error<'arena>>;
}

/// Argument variance for [`IndepTupleRelation`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Variance {
    Covariant,
    Contravariant,
}

/// The universal subtype relation.
#[derive(Debug)]
pub struct UniverseOmegaRelation;

impl<'arena> SubtypeRelation<'arena> for UniverseOmegaRelation {
    fn name(&self) -> &'static str {
        "<:"
    }

    fn constrain(
        &self,
        state: &mut TypecheckerState<'arena>,
        left_ctx: &TypingContext<'arena>,
        val: &ArcValue<'arena>,
        right_ctx: &TypingContext<'arena>,
        use_: &ArcValue<'arena>,
        cause: &Arc<Cause>,
    ) -> Result<(), Error<'arena>> {
        check_concrete(state, left_ctx, val, right_ctx, use_, cause)
    }
}

/// The pointwise lifting of a relation to functions: `f ≤ g` iff
/// `f u ≤ g u` at a fresh unique `u`.
#[derive(Debug)]
pub struct FunctionRelation<'arena> {
    inner: Rel<'arena>,
}

impl<'arena> FunctionRelation<'arena> {
    pub fn new(inner: Rel<'arena>) -> FunctionRelation<'arena> {
        FunctionRelation { inner }
    }
}

impl<'arena> SubtypeRelation<'arena> for FunctionRelation<'arena> {
    fn name(&self) -> &'static str {
        "fun"
    }

    fn constrain(
        &self,
        state: &mut TypecheckerState<'arena>,
        left_ctx: &TypingContext<'arena>,
        val: &ArcValue<'arena>,
        right_ctx: &TypingContext<'arena>,
        use_: &ArcValue<'arena>,
        cause: &Arc<Cause>,
    ) -> Result<(), Error<'arena>> {
        let unique = Value::unique(state.fresh_unique());
        let applied_val =
            EvalContext::with_ambient(state, left_ctx.clone()).apply(val.clone(), unique.clone())?;
        let applied_use =
            EvalContext::with_ambient(state, right_ctx.clone()).apply(use_.clone(), unique)?;
        state.constrain(
            &applied_val,
            left_ctx,
            &applied_use,
            right_ctx,
            self.inner.clone(),
            Cause::nested("comparing functions at a fresh unique", cause.clone()),
        )
    }
}

/// Positionwise comparison of non-dependent tuples with a declared
/// variance per position. Installed for host type families via
/// [`TypecheckerState::register_host_srel`].
#[derive(Debug)]
pub struct IndepTupleRelation {
    variances: Vec<Variance>,
}

impl IndepTupleRelation {
    pub fn new(variances: Vec<Variance>) -> IndepTupleRelation {
        IndepTupleRelation { variances }
    }
}

impl<'arena> SubtypeRelation<'arena> for IndepTupleRelation {
    fn name(&self) -> &'static str {
        "indep-tuple"
    }

    fn constrain(
        &self,
        state: &mut TypecheckerState<'arena>,
        left_ctx: &TypingContext<'arena>,
        val: &ArcValue<'arena>,
        right_ctx: &TypingContext<'arena>,
        use_: &ArcValue<'arena>,
        cause: &Arc<Cause>,
    ) -> Result<(), Error<'arena>> {
        let (elems0, elems1) = match (val.as_ref(), use_.as_ref()) {
            (Value::TupleLit(elems0), Value::TupleLit(elems1)) => (elems0.clone(), elems1.clone()),
            (_, _) => {
                return Err(state.constraint_error(
                    "positionwise relation applied to non-tuples",
                    val,
                    left_ctx,
                    self.name(),
                    use_,
                    right_ctx,
                    cause,
                ))
            }
        };
        if elems0.len() != self.variances.len() || elems1.len() != self.variances.len() {
            return Err(Error::TupleLengthMismatch {
                found: elems0.len(),
                expected: self.variances.len(),
            });
        }

        let omega = state.omega();
        for (index, variance) in self.variances.iter().enumerate() {
            let cause = Cause::nested("comparing tuple positions", cause.clone());
            match variance {
                Variance::Covariant => state.constrain(
                    &elems0[index],
                    left_ctx,
                    &elems1[index],
                    right_ctx,
                    omega.clone(),
                    cause,
                )?,
                Variance::Contravariant => state.constrain(
                    &elems1[index],
                    right_ctx,
                    &elems0[index],
                    left_ctx,
                    omega.clone(),
                    cause,
                )?,
            }
        }
        Ok(())
    }
}

/// Unify two dependent tuple descriptors position by position. Each
/// position's type producer is applied to the tuple of shared unique
/// representatives for the preceding positions, and the resulting types
/// are subtyped covariantly.
#[derive(Debug)]
pub struct TupleDescRelation;

impl<'arena> SubtypeRelation<'arena> for TupleDescRelation {
    fn name(&self) -> &'static str {
        "tuple-desc"
    }

    fn constrain(
        &self,
        state: &mut TypecheckerState<'arena>,
        left_ctx: &TypingContext<'arena>,
        val: &ArcValue<'arena>,
        right_ctx: &TypingContext<'arena>,
        use_: &ArcValue<'arena>,
        cause: &Arc<Cause>,
    ) -> Result<(), Error<'arena>> {
        let (elems0, elems1) = match (
            tuple_desc_elems(state, val),
            tuple_desc_elems(state, use_),
        ) {
            (Some(elems0), Some(elems1)) => (elems0, elems1),
            // A stuck or malformed descriptor can still match itself.
            (_, _) if convertible(val, use_) => return Ok(()),
            (_, _) => {
                return Err(state.constraint_error(
                    "cannot destructure tuple descriptors",
                    val,
                    left_ctx,
                    self.name(),
                    use_,
                    right_ctx,
                    cause,
                ))
            }
        };
        if elems0.len() != elems1.len() {
            return Err(Error::TupleLengthMismatch {
                found: elems0.len(),
                expected: elems1.len(),
            });
        }

        let omega = state.omega();
        let mut reps: Vec<ArcValue<'arena>> = Vec::with_capacity(elems0.len());
        for (fun0, fun1) in Iterator::zip(elems0.into_iter(), elems1.into_iter()) {
            let prefix: ArcValue<'arena> = Arc::new(Value::TupleLit(reps.clone()));
            let type0 = EvalContext::with_ambient(state, left_ctx.clone())
                .apply(fun0, prefix.clone())?;
            let type1 =
                EvalContext::with_ambient(state, right_ctx.clone()).apply(fun1, prefix)?;
            state.constrain(
                &type0,
                left_ctx,
                &type1,
                right_ctx,
                omega.clone(),
                Cause::nested("comparing tuple descriptor positions", cause.clone()),
            )?;
            reps.push(Value::unique(state.fresh_unique()));
        }
        Ok(())
    }
}

/// Every variant on the value side must exist on the use side; variant
/// types are compared covariantly.
#[derive(Debug)]
pub struct EnumDescRelation;

impl<'arena> SubtypeRelation<'arena> for EnumDescRelation {
    fn name(&self) -> &'static str {
        "enum-desc"
    }

    fn constrain(
        &self,
        state: &mut TypecheckerState<'arena>,
        left_ctx: &TypingContext<'arena>,
        val: &ArcValue<'arena>,
        right_ctx: &TypingContext<'arena>,
        use_: &ArcValue<'arena>,
        cause: &Arc<Cause>,
    ) -> Result<(), Error<'arena>> {
        let (variants0, variants1) = match (val.as_ref(), use_.as_ref()) {
            (Value::EnumDescLit(variants0), Value::EnumDescLit(variants1)) => {
                (variants0.clone(), variants1.clone())
            }
            (_, _) if convertible(val, use_) => return Ok(()),
            (_, _) => {
                return Err(state.constraint_error(
                    "cannot destructure enum descriptors",
                    val,
                    left_ctx,
                    self.name(),
                    use_,
                    right_ctx,
                    cause,
                ))
            }
        };

        let omega = state.omega();
        for (variant, type0) in &variants0 {
            let type1 = variants1
                .iter()
                .find(|(other, _)| other == variant)
                .map(|(_, type1)| type1)
                .ok_or(Error::MissingVariant {
                    variant: *variant,
                    suggestion: None,
                })?;
            state.constrain(
                type0,
                left_ctx,
                type1,
                right_ctx,
                omega.clone(),
                Cause::nested("comparing enum variant types", cause.clone()),
            )?;
        }
        Ok(())
    }
}

/// Every field on the use side must exist on the value side (width
/// subtyping runs the other way around from enums); field type functions
/// are applied to a shared unique and compared covariantly.
#[derive(Debug)]
pub struct RecordDescRelation;

impl<'arena> SubtypeRelation<'arena> for RecordDescRelation {
    fn name(&self) -> &'static str {
        "record-desc"
    }

    fn constrain(
        &self,
        state: &mut TypecheckerState<'arena>,
        left_ctx: &TypingContext<'arena>,
        val: &ArcValue<'arena>,
        right_ctx: &TypingContext<'arena>,
        use_: &ArcValue<'arena>,
        cause: &Arc<Cause>,
    ) -> Result<(), Error<'arena>> {
        let (fields0, fields1) = match (val.as_ref(), use_.as_ref()) {
            (Value::RecordDescLit(fields0), Value::RecordDescLit(fields1)) => {
                (fields0.clone(), fields1.clone())
            }
            (_, _) if convertible(val, use_) => return Ok(()),
            (_, _) => {
                return Err(state.constraint_error(
                    "cannot destructure record descriptors",
                    val,
                    left_ctx,
                    self.name(),
                    use_,
                    right_ctx,
                    cause,
                ))
            }
        };

        let omega = state.omega();
        let shared = Value::unique(state.fresh_unique());
        for (field, fun1) in &fields1 {
            let fun0 = fields0
                .iter()
                .find(|(other, _)| other == field)
                .map(|(_, fun0)| fun0.clone())
                .ok_or(Error::MissingField { field: *field })?;
            let type0 = EvalContext::with_ambient(state, left_ctx.clone())
                .apply(fun0, shared.clone())?;
            let type1 = EvalContext::with_ambient(state, right_ctx.clone())
                .apply(fun1.clone(), shared.clone())?;
            state.constrain(
                &type0,
                left_ctx,
                &type1,
                right_ctx,
                omega.clone(),
                Cause::nested("comparing record field types", cause.clone()),
            )?;
        }
        Ok(())
    }
}

/// The use side's effect set must be a superset of the value side's.
#[derive(Debug)]
pub struct EffectRowRelation;

impl<'arena> SubtypeRelation<'arena> for EffectRowRelation {
    fn name(&self) -> &'static str {
        "effect-row"
    }

    fn constrain(
        &self,
        state: &mut TypecheckerState<'arena>,
        left_ctx: &TypingContext<'arena>,
        val: &ArcValue<'arena>,
        right_ctx: &TypingContext<'arena>,
        use_: &ArcValue<'arena>,
        cause: &Arc<Cause>,
    ) -> Result<(), Error<'arena>> {
        let row0 = effect_row_elems(val);
        let row1 = effect_row_elems(use_);
        match (row0, row1) {
            (Some(row0), Some(row1)) if row0.iter().all(|effect| row1.contains(effect)) => Ok(()),
            (Some(_), Some(_)) => Err(state.constraint_error(
                "effect row is not included in the expected row",
                val,
                left_ctx,
                self.name(),
                use_,
                right_ctx,
                cause,
            )),
            (_, _) if convertible(val, use_) => Ok(()),
            (_, _) => Err(state.constraint_error(
                "cannot destructure effect rows",
                val,
                left_ctx,
                self.name(),
                use_,
                right_ctx,
                cause,
            )),
        }
    }
}

fn effect_row_elems<'arena>(
    value: &ArcValue<'arena>,
) -> Option<std::collections::BTreeSet<crate::core::EffectId>> {
    match value.as_ref() {
        Value::EffectRow(row) => Some(row.clone()),
        Value::EffectElem(effect) => Some(std::iter::once(*effect).collect()),
        _ => None,
    }
}

/// Walk a tuple descriptor's canonical `cons` chain into the list of its
/// per-position type producers, first position first. Returns `None` for
/// stuck or malformed descriptors.
pub fn tuple_desc_elems<'arena>(
    state: &TypecheckerState<'arena>,
    desc: &ArcValue<'arena>,
) -> Option<Vec<ArcValue<'arena>>> {
    let symbols = state.symbols();
    let mut elems = Vec::new();
    let mut current = desc.clone();
    loop {
        let next = match current.as_ref() {
            Value::EnumLit(variant, _) if *variant == symbols.empty => break,
            Value::EnumLit(variant, payload) if *variant == symbols.cons => {
                match payload.as_ref() {
                    Value::TupleLit(parts) if parts.len() == 2 => {
                        elems.push(parts[1].clone());
                        parts[0].clone()
                    }
                    _ => return None,
                }
            }
            _ => return None,
        };
        current = next;
    }
    elems.reverse();
    Some(elems)
}

/// Reveal a stuck value through its declared type: a placeholder whose
/// declared type is a singleton is that singleton's witness, and an
/// element access into such a placeholder reveals through the
/// corresponding descriptor component.
fn reveal<'arena>(
    state: &mut TypecheckerState<'arena>,
    stuck: &Stuck<'arena>,
    ctx: &TypingContext<'arena>,
) -> Result<Option<ArcValue<'arena>>, Error<'arena>> {
    match stuck {
        Stuck::Free(FreeVar::Placeholder(level, _)) => {
            match ctx.get_type(*level).map(|ty| ty.as_ref()) {
                Some(Value::Singleton { value, .. }) => Ok(Some(value.clone())),
                _ => Ok(None),
            }
        }
        Stuck::TupleProj(head, index) => {
            let (level, name) = match head.as_ref() {
                Stuck::Free(FreeVar::Placeholder(level, name)) => (*level, *name),
                _ => return Ok(None),
            };
            let desc = match ctx.get_type(level).map(|ty| ty.as_ref()) {
                Some(Value::TupleType(desc)) => desc.clone(),
                _ => return Ok(None),
            };
            let elems = match tuple_desc_elems(state, &desc) {
                Some(elems) => elems,
                None => return Ok(None),
            };
            let fun = match elems.get(*index) {
                Some(fun) => fun.clone(),
                None => return Ok(None),
            };
            // The descriptor component sees the projections of the
            // placeholder itself as its prefix.
            let subject = Value::placeholder(level, name);
            let mut eval = EvalContext::with_ambient(state, ctx.clone());
            let prefix = (0..*index)
                .map(|position| eval.index_tuple(&subject, position))
                .collect::<Result<Vec<_>, _>>()?;
            let prefix: ArcValue<'arena> = Arc::new(Value::TupleLit(prefix));
            let component = eval.apply(fun, prefix)?;
            match component.as_ref() {
                Value::Singleton { value, .. } => Ok(Some(value.clone())),
                _ => Ok(None),
            }
        }
        _ => Ok(None),
    }
}

/// The dispatcher for the universal relation: dissolve unions,
/// intersections and singletons, reveal stuck values through their
/// declared types, then compare concrete heads pairwise.
pub(crate) fn check_concrete<'arena>(
    state: &mut TypecheckerState<'arena>,
    left_ctx: &TypingContext<'arena>,
    val: &ArcValue<'arena>,
    right_ctx: &TypingContext<'arena>,
    use_: &ArcValue<'arena>,
    cause: &Arc<Cause>,
) -> Result<(), Error<'arena>> {
    // Structurally equal values are subtypes reflexively; this also
    // settles identical stuck values.
    if convertible(val, use_) {
        return Ok(());
    }

    let omega = state.omega();

    match (val.as_ref(), use_.as_ref()) {
        // Unions dissolve on the value side.
        (Value::UnionType(left, right), _) => {
            state.constrain(
                left,
                left_ctx,
                use_,
                right_ctx,
                omega.clone(),
                Cause::nested("left member of a union", cause.clone()),
            )?;
            state.constrain(
                right,
                left_ctx,
                use_,
                right_ctx,
                omega,
                Cause::nested("right member of a union", cause.clone()),
            )
        }
        // Intersections dissolve on the use side.
        (_, Value::IntersectionType(left, right)) => {
            state.constrain(
                val,
                left_ctx,
                left,
                right_ctx,
                omega.clone(),
                Cause::nested("left member of an intersection", cause.clone()),
            )?;
            state.constrain(
                val,
                left_ctx,
                right,
                right_ctx,
                omega,
                Cause::nested("right member of an intersection", cause.clone()),
            )
        }
        // A union on the use side accepts either member; an intersection
        // on the value side provides either member. Both are tried
        // speculatively so the failed attempt leaves no residue.
        (_, Value::UnionType(left, right)) => {
            let attempt = {
                let val = val.clone();
                let left = left.clone();
                let omega = omega.clone();
                let cause = Cause::nested("left member of the expected union", cause.clone());
                state.speculate(move |state| {
                    state.constrain(&val, left_ctx, &left, right_ctx, omega, cause)
                })
            };
            match attempt {
                Ok(()) => Ok(()),
                Err(_) => state.constrain(
                    val,
                    left_ctx,
                    right,
                    right_ctx,
                    omega,
                    Cause::nested("right member of the expected union", cause.clone()),
                ),
            }
        }
        (Value::IntersectionType(left, right), _) => {
            let attempt = {
                let left = left.clone();
                let use_ = use_.clone();
                let omega = omega.clone();
                let cause = Cause::nested("left member of an intersection", cause.clone());
                state.speculate(move |state| {
                    state.constrain(&left, left_ctx, &use_, right_ctx, omega, cause)
                })
            };
            match attempt {
                Ok(()) => Ok(()),
                Err(_) => state.constrain(
                    right,
                    left_ctx,
                    use_,
                    right_ctx,
                    omega,
                    Cause::nested("right member of an intersection", cause.clone()),
                ),
            }
        }

        // Singletons: pairwise their supertypes must agree and their
        // witnesses must be identical; on the value side alone, a
        // singleton falls through to its supertype.
        (
            Value::Singleton {
                supertype: super0,
                value: value0,
            },
            Value::Singleton {
                supertype: super1,
                value: value1,
            },
        ) => {
            if !convertible(value0, value1) {
                return Err(state.constraint_error(
                    "singleton witnesses differ",
                    val,
                    left_ctx,
                    "<:",
                    use_,
                    right_ctx,
                    cause,
                ));
            }
            state.constrain(
                super0,
                left_ctx,
                super1,
                right_ctx,
                omega,
                Cause::nested("comparing singleton supertypes", cause.clone()),
            )
        }
        (Value::Singleton { supertype, .. }, _) => state.constrain(
            supertype,
            left_ctx,
            use_,
            right_ctx,
            omega,
            Cause::nested("widening a singleton to its supertype", cause.clone()),
        ),

        // Stuck values reveal through their declared types where those
        // pin them down to a witness.
        (Value::Stuck(stuck), _) => {
            if let Some(revealed) = reveal(state, stuck, left_ctx)? {
                return check_concrete(state, left_ctx, &revealed, right_ctx, use_, cause);
            }
            if let Value::Stuck(other) = use_.as_ref() {
                if let Some(revealed) = reveal(state, other, right_ctx)? {
                    return check_concrete(state, left_ctx, val, right_ctx, &revealed, cause);
                }
                // Structural equality was already tried above.
                return Err(state.constraint_error(
                    "stuck values are not structurally equal",
                    val,
                    left_ctx,
                    "<:",
                    use_,
                    right_ctx,
                    cause,
                ));
            }
            Err(state.constraint_error(
                "no subtype comparer for a stuck value",
                val,
                left_ctx,
                "<:",
                use_,
                right_ctx,
                cause,
            ))
        }
        (_, Value::Stuck(stuck)) => {
            if let Some(revealed) = reveal(state, stuck, right_ctx)? {
                return check_concrete(state, left_ctx, val, right_ctx, &revealed, cause);
            }
            Err(state.constraint_error(
                "no subtype comparer for a stuck value",
                val,
                left_ctx,
                "<:",
                use_,
                right_ctx,
                cause,
            ))
        }

        // Functions: visibility must agree (an implicit on the left is
        // permissive), purity must agree, parameters are contravariant,
        // and results are compared pointwise at a fresh unique.
        (
            Value::FunType {
                plicity: plicity0,
                purity: purity0,
                param_type: param0,
                result: result0,
            },
            Value::FunType {
                plicity: plicity1,
                purity: purity1,
                param_type: param1,
                result: result1,
            },
        ) => {
            if plicity0 != plicity1 && *plicity0 != Plicity::Implicit {
                return Err(state.constraint_error(
                    "function visibility mismatch",
                    val,
                    left_ctx,
                    "<:",
                    use_,
                    right_ctx,
                    cause,
                ));
            }
            if purity0 != purity1 {
                return Err(state.constraint_error(
                    "function purity mismatch",
                    val,
                    left_ctx,
                    "<:",
                    use_,
                    right_ctx,
                    cause,
                ));
            }
            state.constrain(
                param1,
                right_ctx,
                param0,
                left_ctx,
                omega.clone(),
                Cause::nested("contravariant function parameter", cause.clone()),
            )?;
            let pointwise = state.function_relation(omega);
            state.constrain(
                result0,
                left_ctx,
                result1,
                right_ctx,
                pointwise,
                Cause::nested("covariant function result", cause.clone()),
            )
        }
        (
            Value::HostFunType {
                purity: purity0,
                param_type: param0,
                result: result0,
            },
            Value::HostFunType {
                purity: purity1,
                param_type: param1,
                result: result1,
            },
        ) => {
            if purity0 != purity1 {
                return Err(state.constraint_error(
                    "host function purity mismatch",
                    val,
                    left_ctx,
                    "<:",
                    use_,
                    right_ctx,
                    cause,
                ));
            }
            state.constrain(
                param1,
                right_ctx,
                param0,
                left_ctx,
                omega.clone(),
                Cause::nested("contravariant host function parameter", cause.clone()),
            )?;
            let pointwise = state.function_relation(omega);
            state.constrain(
                result0,
                left_ctx,
                result1,
                right_ctx,
                pointwise,
                Cause::nested("covariant host function result", cause.clone()),
            )
        }

        // Structured types constrain their descriptors under their
        // descriptor relations.
        (Value::TupleType(desc0), Value::TupleType(desc1))
        | (Value::HostTupleType(desc0), Value::HostTupleType(desc1)) => {
            let rel = state.tuple_desc_rel();
            state.constrain(
                desc0,
                left_ctx,
                desc1,
                right_ctx,
                rel,
                Cause::nested("comparing tuple descriptors", cause.clone()),
            )
        }
        (Value::EnumType(desc0), Value::EnumType(desc1)) => {
            let rel = state.enum_desc_rel();
            state.constrain(
                desc0,
                left_ctx,
                desc1,
                right_ctx,
                rel,
                Cause::nested("comparing enum descriptors", cause.clone()),
            )
        }
        (Value::RecordType(desc0), Value::RecordType(desc1)) => {
            let rel = state.record_desc_rel();
            state.constrain(
                desc0,
                left_ctx,
                desc1,
                right_ctx,
                rel,
                Cause::nested("comparing record descriptors", cause.clone()),
            )
        }

        // An enum type over exactly the canonical descriptor constructors
        // is accepted where a tuple descriptor type is expected.
        (Value::EnumType(desc), Value::TupleDescType(_)) => {
            let symbols = state.symbols();
            match desc.as_ref() {
                Value::EnumDescLit(variants)
                    if variants
                        .iter()
                        .all(|(variant, _)| {
                            *variant == symbols.empty || *variant == symbols.cons
                        }) =>
                {
                    Ok(())
                }
                _ => Err(state.constraint_error(
                    "enum descriptor does not cover the tuple descriptor constructors",
                    val,
                    left_ctx,
                    "<:",
                    use_,
                    right_ctx,
                    cause,
                )),
            }
        }

        // Descriptor values compared directly under the universal
        // relation delegate to their descriptor relations.
        (Value::EnumDescLit(_), Value::EnumDescLit(_)) => {
            let rel = state.enum_desc_rel();
            rel.constrain(state, left_ctx, val, right_ctx, use_, cause)
        }
        (Value::RecordDescLit(_), Value::RecordDescLit(_)) => {
            let rel = state.record_desc_rel();
            rel.constrain(state, left_ctx, val, right_ctx, use_, cause)
        }
        (Value::EnumLit(variant0, payload0), Value::EnumLit(variant1, payload1)) => {
            if variant0 != variant1 {
                return Err(state.constraint_error(
                    "enum constructors differ",
                    val,
                    left_ctx,
                    "<:",
                    use_,
                    right_ctx,
                    cause,
                ));
            }
            state.constrain(
                payload0,
                left_ctx,
                payload1,
                right_ctx,
                omega,
                Cause::nested("comparing enum payloads", cause.clone()),
            )
        }

        // Tuples of values (descriptor payloads among them) compare
        // pointwise covariantly.
        (Value::TupleLit(elems0), Value::TupleLit(elems1)) => {
            if elems0.len() != elems1.len() {
                return Err(Error::TupleLengthMismatch {
                    found: elems0.len(),
                    expected: elems1.len(),
                });
            }
            for (elem0, elem1) in Iterator::zip(elems0.iter(), elems1.iter()) {
                state.constrain(
                    elem0,
                    left_ctx,
                    elem1,
                    right_ctx,
                    omega.clone(),
                    Cause::nested("comparing tuple elements", cause.clone()),
                )?;
            }
            Ok(())
        }

        // Host type families defer to their registered relation.
        (
            Value::HostUserDefinedType { id: id0, args: args0 },
            Value::HostUserDefinedType { id: id1, args: args1 },
        ) if id0 == id1 => {
            let rel = state.host_srel(*id0).ok_or_else(|| {
                state.constraint_error(
                    "no subtype relation registered for host type family",
                    val,
                    left_ctx,
                    "<:",
                    use_,
                    right_ctx,
                    cause,
                )
            })?;
            let args0: ArcValue<'arena> = Arc::new(Value::TupleLit(args0.clone()));
            let args1: ArcValue<'arena> = Arc::new(Value::TupleLit(args1.clone()));
            rel.constrain(state, left_ctx, &args0, right_ctx, &args1, cause)
        }

        // Universe lattice: levels go up, depths go down.
        (
            Value::Star {
                level: level0,
                depth: depth0,
            },
            Value::Star {
                level: level1,
                depth: depth1,
            },
        ) => {
            if level0 <= level1 && depth0 >= depth1 {
                Ok(())
            } else {
                Err(state.constraint_error(
                    "universe levels are not ordered",
                    val,
                    left_ctx,
                    "<:",
                    use_,
                    right_ctx,
                    cause,
                ))
            }
        }
        (Value::HostTypeType, Value::Star { depth: 0, .. }) => Ok(()),

        // Covariant wrappers.
        (Value::HostWrappedType(inner0), Value::HostWrappedType(inner1)) => state.constrain(
            inner0,
            left_ctx,
            inner1,
            right_ctx,
            omega,
            Cause::nested("covariant host wrapper", cause.clone()),
        ),
        (Value::TupleDescType(target0), Value::TupleDescType(target1))
        | (Value::EnumDescType(target0), Value::EnumDescType(target1))
        | (Value::RecordDescType(target0), Value::RecordDescType(target1))
        | (Value::SrelType(target0), Value::SrelType(target1))
        | (Value::VarianceType(target0), Value::VarianceType(target1)) => state.constrain(
            target0,
            left_ctx,
            target1,
            right_ctx,
            omega,
            Cause::nested("covariant in the target universe", cause.clone()),
        ),

        // Programs: covariant result, effect rows under the row relation.
        (
            Value::ProgramType {
                effects: effects0,
                result: result0,
            },
            Value::ProgramType {
                effects: effects1,
                result: result1,
            },
        ) => {
            let row_rel = state.effect_row_rel();
            state.constrain(
                effects0,
                left_ctx,
                effects1,
                right_ctx,
                row_rel,
                Cause::nested("comparing program effect rows", cause.clone()),
            )?;
            state.constrain(
                result0,
                left_ctx,
                result1,
                right_ctx,
                omega,
                Cause::nested("covariant program result", cause.clone()),
            )
        }
        (Value::EffectRow(_), Value::EffectRow(_))
        | (Value::EffectRow(_), Value::EffectElem(_))
        | (Value::EffectElem(_), Value::EffectRow(_)) => {
            let rel = state.effect_row_rel();
            rel.constrain(state, left_ctx, val, right_ctx, use_, cause)
        }

        // A range's real obligations were queued against its bounds when
        // it entered the graph; the head itself constrains nothing.
        (Value::Range { .. }, _) | (_, Value::Range { .. }) => Ok(()),

        // The original leaves operative subtyping unfinished; so do we.
        (Value::OperativeType { .. }, _) | (_, Value::OperativeType { .. }) => {
            Err(Error::NotImplemented("operative subtyping"))
        }

        (_, _) => Err(state.constraint_error(
            "no subtype comparer for these heads",
            val,
            left_ctx,
            "<:",
            use_,
            right_ctx,
            cause,
        )),
    }
}
