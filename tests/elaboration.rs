//! End-to-end elaboration and evaluation scenarios, driven through the
//! public API: build inferrable terms, infer them, run the elaborated
//! terms through the evaluator, and inspect the constraint graph.

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use scoped_arena::Scope;

use alder::context::TypingContext;
use alder::core::prim::{HostFn, HostValue};
use alder::core::program::EffectHandler;
use alder::core::semantics::{convertible, ArcValue, Stuck, Value};
use alder::core::subst::{substitute_inner, Mapping};
use alder::core::{self, EffectId, Plicity, Purity};
use alder::env::{EnvLen, Index};
use alder::reporting::{Cause, Error};
use alder::solver::ConstraintElem;
use alder::source::{Span, SpannedName};
use alder::surface::elaboration::Elaborator;
use alder::surface::{self, Checkable};
use alder::StringInterner;

fn spanned(interner: &RefCell<StringInterner>, text: &str) -> SpannedName {
    SpannedName::new(interner.borrow_mut().get_or_intern(text), Span::Empty)
}

fn number_type<'arena>() -> ArcValue<'arena> {
    Arc::new(Value::HostNumberType)
}

/// An already-elaborated literal at a known type, as the parser layer
/// would hand one over.
fn typed<'arena>(
    scope: &'arena Scope<'arena>,
    value: ArcValue<'arena>,
    r#type: ArcValue<'arena>,
    ctx: &TypingContext<'arena>,
) -> &'arena surface::Term<'arena> {
    scope.to_scope(surface::Term::Typed {
        span: Span::Empty,
        r#type,
        usages: vec![0; ctx.len().to_usize()],
        term: scope.to_scope(core::Term::Literal(Span::Empty, value)),
    })
}

fn star_term<'arena>(scope: &'arena Scope<'arena>) -> &'arena surface::Term<'arena> {
    scope.to_scope(surface::Term::Star(Span::Empty, 0, 0))
}

fn empty_terms<'arena>(scope: &'arena Scope<'arena>) -> &'arena [core::Term<'arena>] {
    scope.to_scope_from_iter(Vec::new())
}

fn var<'arena>(
    scope: &'arena Scope<'arena>,
    index: usize,
    name: SpannedName,
) -> &'arena surface::Term<'arena> {
    scope.to_scope(surface::Term::Var(
        Span::Empty,
        Index::from_usize(index),
        name,
    ))
}

fn lambda<'arena>(
    scope: &'arena Scope<'arena>,
    param: SpannedName,
    plicity: Plicity,
    param_type: &'arena surface::Term<'arena>,
    body: &'arena surface::Term<'arena>,
) -> &'arena surface::Term<'arena> {
    scope.to_scope(surface::Term::Lambda {
        span: Span::Empty,
        param,
        plicity,
        purity: Purity::Pure,
        param_type,
        body,
    })
}

fn app<'arena>(
    scope: &'arena Scope<'arena>,
    fun: &'arena surface::Term<'arena>,
    arg: &'arena surface::Term<'arena>,
) -> &'arena surface::Term<'arena> {
    scope.to_scope(surface::Term::App(Span::Empty, fun, arg))
}

#[test]
fn identity_polymorphism() {
    let interner = RefCell::new(StringInterner::new());
    let scope = Scope::new();
    let mut elab = Elaborator::new(&interner, &scope);
    let ctx = TypingContext::new();

    let a = spanned(&interner, "A");
    let x = spanned(&interner, "x");

    // fun (A : star 0 0) => fun (x : A) => x
    let inner = lambda(&scope, x, Plicity::Explicit, var(&scope, 0, a), var(&scope, 0, x));
    let identity = lambda(&scope, a, Plicity::Explicit, star_term(&scope), inner);

    // ((identity HostNumber) 3.0)
    let number = number_type();
    let number_arg = typed(&scope, number.clone(), Value::star(0, 0), &ctx);
    let three = Value::host_number(3.0);
    let three_singleton = Arc::new(Value::Singleton {
        supertype: number.clone(),
        value: three.clone(),
    });
    let three_arg = typed(&scope, three, three_singleton, &ctx);
    let expr = app(&scope, app(&scope, identity, number_arg), three_arg);

    let inference = elab.infer(expr, &ctx).unwrap();
    assert!(
        matches!(inference.r#type.as_ref(), Value::HostNumberType),
        "expected host-number, got {:?}",
        inference.r#type
    );

    let value = elab.evaluate(inference.term, &ctx).unwrap();
    assert!(matches!(
        value.as_ref(),
        Value::Host(HostValue::Num(num)) if *num == 3.0
    ));

    // Exactly one constrain edge between the argument's singleton and the
    // host number type.
    let state = elab.state_ref();
    let singleton_to_number = state
        .constrain_edges()
        .filter(|edge| {
            let left = state.node_value(edge.left).map(|value| value.as_ref());
            let right = state.node_value(edge.right).map(|value| value.as_ref());
            matches!(left, Some(Value::Singleton { .. }))
                && matches!(right, Some(Value::HostNumberType))
        })
        .count();
    assert_eq!(singleton_to_number, 1);
}

#[test]
fn implicit_argument_insertion() {
    let interner = RefCell::new(StringInterner::new());
    let scope = Scope::new();
    let mut elab = Elaborator::new(&interner, &scope);
    let ctx = TypingContext::new();

    let a = spanned(&interner, "A");
    let x = spanned(&interner, "x");

    // f : forall {A : star 0 0} -> A -> A
    let inner = lambda(&scope, x, Plicity::Explicit, var(&scope, 0, a), var(&scope, 0, x));
    let f = lambda(&scope, a, Plicity::Implicit, star_term(&scope), inner);

    // f 3.0 — the elaborator must insert a metavariable for A.
    let three = Value::host_number(3.0);
    let three_singleton = Arc::new(Value::Singleton {
        supertype: number_type(),
        value: three,
    });
    let three_arg = typed(&scope, Value::host_number(3.0), three_singleton, &ctx);
    let expr = app(&scope, f, three_arg);

    let inference = elab.infer(expr, &ctx).unwrap();
    let meta = inference
        .r#type
        .match_meta()
        .expect("the application's type should be the inserted metavariable");

    // The argument's type flowed into the metavariable's usage node.
    let state = elab.state_ref();
    assert!(state.constrain_edges().any(|edge| {
        edge.right == meta.usage
            && state
                .node_value(edge.left)
                .map_or(false, |value| matches!(value.as_ref(), Value::Singleton { .. }))
    }));

    let value = elab.evaluate(inference.term, &ctx).unwrap();
    assert!(matches!(
        value.as_ref(),
        Value::Host(HostValue::Num(num)) if *num == 3.0
    ));
}

#[test]
fn tuple_elim_dual_path_unknown_subject() {
    let interner = RefCell::new(StringInterner::new());
    let scope = Scope::new();
    let mut elab = Elaborator::new(&interner, &scope);

    let s = spanned(&interner, "s");
    let a = spanned(&interner, "a");
    let b = spanned(&interner, "b");

    // The subject's type is a bare metavariable: the speculative
    // tuple-type reading must succeed by fanning out fresh element types.
    let subject_type = {
        let meta = elab.state().metavariable(EnvLen::new(), false);
        Value::meta(meta)
    };
    let (ctx, _) = TypingContext::new().push_param(subject_type, s);

    let names = scope.to_scope_from_iter([a, b]);
    let term = scope.to_scope(surface::Term::TupleElim {
        span: Span::Empty,
        names,
        subject: var(&scope, 0, s),
        body: var(&scope, 1, a),
    });

    let inference = elab.infer(term, &ctx).unwrap();
    assert!(inference.r#type.match_meta().is_some());
}

#[test]
fn tuple_elim_dual_path_host_subject_leaves_no_residue() {
    let interner = RefCell::new(StringInterner::new());
    let scope = Scope::new();
    let mut elab = Elaborator::new(&interner, &scope);

    let h = spanned(&interner, "h");
    let a = spanned(&interner, "a");
    let b = spanned(&interner, "b");

    // A concrete two-position host tuple type.
    let symbols = elab.state_ref().symbols();
    let capture_name = SpannedName::new(symbols.capture, Span::Empty);
    let const_number_fn = || {
        Arc::new(Value::FunLit(alder::core::semantics::Closure::new(
            Arc::new(Value::TupleLit(Vec::new())),
            capture_name,
            capture_name,
            scope.to_scope(core::Term::Literal(Span::Empty, number_type())),
        )))
    };
    let empty_desc: ArcValue<'_> = Arc::new(Value::EnumLit(
        symbols.empty,
        Arc::new(Value::TupleLit(Vec::new())),
    ));
    let cons = |prev, type_fn| {
        Arc::new(Value::EnumLit(
            symbols.cons,
            Arc::new(Value::TupleLit(vec![prev, type_fn])),
        ))
    };
    let desc = cons(cons(empty_desc, const_number_fn()), const_number_fn());
    let host_tuple_type: ArcValue<'_> = Arc::new(Value::HostTupleType(desc));

    let (ctx, _) = TypingContext::new().push_param(host_tuple_type, h);
    let names = scope.to_scope_from_iter([a, b]);
    let term = scope.to_scope(surface::Term::TupleElim {
        span: Span::Empty,
        names,
        subject: var(&scope, 0, h),
        body: var(&scope, 1, a),
    });

    let before = elab.state_ref().snapshot();
    let inference = elab.infer(term, &ctx).unwrap();
    assert!(matches!(inference.r#type.as_ref(), Value::HostNumberType));

    // The failed tuple-type branch reverted; the successful host branch
    // constrained nothing. The graph is exactly as it was.
    assert_eq!(elab.state_ref().snapshot(), before);
}

#[test]
fn tuple_cons_then_elim() {
    let interner = RefCell::new(StringInterner::new());
    let scope = Scope::new();
    let mut elab = Elaborator::new(&interner, &scope);
    let ctx = TypingContext::new();

    let a = spanned(&interner, "a");
    let b = spanned(&interner, "b");

    let elems = scope.to_scope_from_iter([
        (*typed(&scope, Value::host_number(1.0), number_type(), &ctx)).clone(),
        (*typed(&scope, Value::host_number(2.0), number_type(), &ctx)).clone(),
    ]);
    let subject = scope.to_scope(surface::Term::TupleLit(Span::Empty, elems));
    let names = scope.to_scope_from_iter([a, b]);
    let term = scope.to_scope(surface::Term::TupleElim {
        span: Span::Empty,
        names,
        subject,
        body: var(&scope, 1, a),
    });

    let inference = elab.infer(term, &ctx).unwrap();
    // The element's declared type is the singleton the descriptor
    // recorded for position 0.
    assert!(matches!(
        inference.r#type.as_ref(),
        Value::Singleton { .. }
    ));

    let value = elab.evaluate(inference.term, &ctx).unwrap();
    assert!(matches!(
        value.as_ref(),
        Value::Host(HostValue::Num(num)) if *num == 1.0
    ));
}

#[test]
fn record_cons_then_elim() {
    let interner = RefCell::new(StringInterner::new());
    let scope = Scope::new();
    let mut elab = Elaborator::new(&interner, &scope);
    let ctx = TypingContext::new();

    let x_field = interner.borrow_mut().get_or_intern("x");
    let r = spanned(&interner, "r");

    let labels = scope.to_scope_from_iter([x_field]);
    let exprs = scope.to_scope_from_iter([
        (*typed(&scope, Value::host_number(7.0), number_type(), &ctx)).clone()
    ]);
    let subject = scope.to_scope(surface::Term::RecordLit(Span::Empty, labels, exprs));

    let fields = scope.to_scope_from_iter([x_field]);
    let names = scope.to_scope_from_iter([r]);
    let term = scope.to_scope(surface::Term::RecordElim {
        span: Span::Empty,
        subject,
        fields,
        names,
        body: var(&scope, 0, r),
    });

    let inference = elab.infer(term, &ctx).unwrap();
    let value = elab.evaluate(inference.term, &ctx).unwrap();
    assert!(matches!(
        value.as_ref(),
        Value::Host(HostValue::Num(num)) if *num == 7.0
    ));
}

#[test]
fn enum_case_selects_arm_and_suggests_missing_variants() {
    let interner = RefCell::new(StringInterner::new());
    let scope = Scope::new();
    let mut elab = Elaborator::new(&interner, &scope);
    let ctx = TypingContext::new();

    let some = interner.borrow_mut().get_or_intern("some");
    let payload = spanned(&interner, "payload");

    let enum_type: ArcValue<'_> = Arc::new(Value::EnumType(Arc::new(Value::EnumDescLit(
        vec![(some, number_type())],
    ))));
    let subject_value: ArcValue<'_> =
        Arc::new(Value::EnumLit(some, Value::host_number(5.0)));
    let subject = typed(&scope, subject_value, enum_type.clone(), &ctx);

    // A matching arm elaborates and evaluates.
    let arms = scope.to_scope_from_iter([(
        some,
        payload,
        (*var(&scope, 0, payload)).clone(),
    )]);
    let term = scope.to_scope(surface::Term::EnumCase {
        span: Span::Empty,
        subject,
        arms,
    });
    let inference = elab.infer(term, &ctx).unwrap();
    let value = elab.evaluate(inference.term, &ctx).unwrap();
    assert!(matches!(
        value.as_ref(),
        Value::Host(HostValue::Num(num)) if *num == 5.0
    ));

    // A case that misspells the variant gets a suggestion.
    let sum = interner.borrow_mut().get_or_intern("sum");
    let subject = typed(
        &scope,
        Arc::new(Value::EnumLit(some, Value::host_number(5.0))),
        enum_type,
        &ctx,
    );
    let arms = scope.to_scope_from_iter([(
        sum,
        payload,
        (*var(&scope, 0, payload)).clone(),
    )]);
    let term = scope.to_scope(surface::Term::EnumCase {
        span: Span::Empty,
        subject,
        arms,
    });
    match elab.infer(term, &ctx) {
        Err(Error::MissingVariant {
            variant,
            suggestion,
        }) => {
            assert_eq!(interner.borrow().resolve(variant), Some("some"));
            let suggestion = suggestion.expect("a suggestion");
            assert_eq!(interner.borrow().resolve(suggestion), Some("sum"));
        }
        other => panic!("expected a missing-variant error, got {:?}", other.is_ok()),
    };
}

#[test]
fn enum_desc_is_a_supertype_of_tuple_desc() {
    let interner = RefCell::new(StringInterner::new());
    let scope = Scope::new();
    let mut elab = Elaborator::new(&interner, &scope);
    let ctx = TypingContext::new();

    let symbols = elab.state_ref().symbols();
    let unit: ArcValue<'_> = Arc::new(Value::TupleLit(Vec::new()));
    let empty_payload = Arc::new(Value::TupleType(Arc::new(Value::EnumLit(
        symbols.empty,
        unit.clone(),
    ))));
    let cons_payload = Arc::new(Value::TupleType(Arc::new(Value::EnumLit(
        symbols.cons,
        unit,
    ))));
    let enum_type: ArcValue<'_> = Arc::new(Value::EnumType(Arc::new(Value::EnumDescLit(
        vec![(symbols.empty, empty_payload), (symbols.cons, cons_payload)],
    ))));
    let target: ArcValue<'_> = Arc::new(Value::TupleDescType(Value::star(0, 0)));

    elab.state()
        .flow(
            &enum_type,
            &ctx,
            &target,
            &ctx,
            Cause::primitive("descriptor conversion", Span::Empty),
        )
        .unwrap();

    // An enum over other constructors is not a tuple descriptor.
    let leaf = interner.borrow_mut().get_or_intern("leaf");
    let other: ArcValue<'_> = Arc::new(Value::EnumType(Arc::new(Value::EnumDescLit(
        vec![(leaf, number_type())],
    ))));
    assert!(elab
        .state()
        .flow(
            &other,
            &ctx,
            &target,
            &ctx,
            Cause::primitive("descriptor conversion", Span::Empty),
        )
        .is_err());
}

#[test]
fn scope_escape_slices_the_metavariable() {
    let interner = RefCell::new(StringInterner::new());
    let scope = Scope::new();
    let mut elab = Elaborator::new(&interner, &scope);
    let ctx = TypingContext::new();

    // Open a block, create a metavariable, bound it above, and close the
    // block by substituting it away.
    let state = elab.state();
    state.enter_block();
    let meta = state.metavariable(EnvLen::new(), false);
    let meta_value = Value::meta(meta);
    let number = number_type();
    state
        .flow(
            &meta_value,
            &ctx,
            &number,
            &ctx,
            Cause::primitive("upper bound", Span::Empty),
        )
        .unwrap();

    let mapping = Mapping::new(EnvLen::new());
    let term = substitute_inner(state, &meta_value, &mapping, &ctx).unwrap();
    let elems = match term {
        core::Term::ConstrainedType(_, elems) => elems,
        other => panic!("expected a constrained type, got {:?}", other),
    };
    assert_eq!(elems.len(), 1);
    assert!(matches!(elems[0], ConstraintElem::SlicedConstrain { .. }));
    state.exit_block();

    // Evaluating the sliced term registers a fresh metavariable carrying
    // the same bound.
    let metas_before = elab.state_ref().snapshot().metas;
    let revived = elab.evaluate(term, &ctx).unwrap();
    let fresh = revived.match_meta().expect("a fresh metavariable");
    assert_eq!(elab.state_ref().snapshot().metas, metas_before + 1);
    assert_ne!(fresh.value, meta.value);

    let state = elab.state_ref();
    assert!(state.constrain_edges().any(|edge| {
        edge.left == fresh.value
            && state
                .node_value(edge.right)
                .map_or(false, |value| matches!(value.as_ref(), Value::HostNumberType))
    }));
}

#[test]
fn effect_program_dispatches_through_the_handler() {
    let interner = RefCell::new(StringInterner::new());
    let scope = Scope::new();
    let mut elab = Elaborator::new(&interner, &scope);
    let ctx = TypingContext::new();

    let effect = EffectId(7);
    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = calls.clone();
    let handler: EffectHandler<'_> = Arc::new(move |arg| {
        handler_calls.fetch_add(1, Ordering::SeqCst);
        match arg.as_ref() {
            Value::HostTupleLit(elems) if elems.len() == 2 => Ok(Value::host_number(42.0)),
            other => panic!("handler expected a host pair, got {:?}", other),
        }
    });
    elab.state().register_effect_handler(effect, handler);

    // program_sequence(program_invoke(effect, host_tuple(f, arg)), k)
    let callee = HostFn::new("callee", |_inputs| Ok(vec![HostValue::Unit]));
    let effect_term = scope.to_scope(core::Term::Literal(
        Span::Empty,
        Arc::new(Value::EffectElem(effect)),
    ));
    let payload_elems = scope.to_scope_from_iter([
        core::Term::Literal(Span::Empty, Arc::new(Value::Host(HostValue::Fn(callee)))),
        core::Term::Literal(Span::Empty, Value::host_number(1.0)),
    ]);
    let payload = scope.to_scope(core::Term::HostTupleLit(Span::Empty, payload_elems));
    let invoke = scope.to_scope(core::Term::ProgramInvoke(Span::Empty, effect_term, payload));

    let n = spanned(&interner, "n");
    let k_capture = spanned(&interner, "k_capture");
    let k_body = scope.to_scope(core::Term::ProgramEnd(
        Span::Empty,
        scope.to_scope(core::Term::Var(Span::Empty, Index::last(), n)),
    ));
    let k = scope.to_scope(core::Term::FunLit {
        span: Span::Empty,
        param: n,
        capture_name: k_capture,
        capture: scope.to_scope(core::Term::TupleLit(Span::Empty, empty_terms(&scope))),
        body: k_body,
    });
    let program_term = scope.to_scope(core::Term::ProgramSequence(Span::Empty, invoke, k));

    let program = elab.evaluate(program_term, &ctx).unwrap();
    assert!(matches!(program.as_ref(), Value::ProgramYield { .. }));

    let result = elab.execute_program(&program).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        result.as_ref(),
        Value::Host(HostValue::Num(num)) if *num == 42.0
    ));
}

#[test]
fn evaluate_substitute_round_trip() {
    let interner = RefCell::new(StringInterner::new());
    let scope = Scope::new();
    let mut elab = Elaborator::new(&interner, &scope);

    let y = spanned(&interner, "y");
    let p = spanned(&interner, "p");
    let ctx = TypingContext::new().push_def(Value::host_number(5.0), number_type(), y);
    let (ctx, _) = ctx.push_param(number_type(), p);

    let elems = scope.to_scope_from_iter([
        core::Term::Var(Span::Empty, Index::from_usize(1), y),
        core::Term::Var(Span::Empty, Index::from_usize(0), p),
        core::Term::Literal(Span::Empty, Value::host_bool(true)),
    ]);
    let term = scope.to_scope(core::Term::TupleLit(Span::Empty, elems));

    let value = elab.evaluate(term, &ctx).unwrap();
    let mapping = Mapping::identity(elab.state_ref(), &ctx);
    let rebuilt = substitute_inner(elab.state(), &value, &mapping, &ctx).unwrap();
    let round_tripped = elab.evaluate(rebuilt, &ctx).unwrap();

    assert!(convertible(&value, &round_tripped));
}

#[test]
fn closures_capture_their_definition_site() {
    let interner = RefCell::new(StringInterner::new());
    let scope = Scope::new();
    let mut elab = Elaborator::new(&interner, &scope);
    let ctx = TypingContext::new();

    let y = spanned(&interner, "y");
    let x = spanned(&interner, "x");

    // let y = 5.0; fun (x : HostNumber) => y
    let number_type_term = typed(&scope, number_type(), Value::star(0, 0), &ctx);
    let def = typed(&scope, Value::host_number(5.0), number_type(), &ctx);
    let body = lambda(&scope, x, Plicity::Explicit, number_type_term, var(&scope, 1, y));
    let term = scope.to_scope(surface::Term::Let {
        span: Span::Empty,
        name: y,
        def,
        body,
    });

    let inference = elab.infer(term, &ctx).unwrap();
    let closure = elab.evaluate(inference.term, &ctx).unwrap();

    // The closure's result depends only on its capture and argument: the
    // let binding is gone from every context by the time we apply it.
    let result = elab
        .apply_value(closure, Value::host_number(9.0))
        .unwrap();
    assert!(matches!(
        result.as_ref(),
        Value::Host(HostValue::Num(num)) if *num == 5.0
    ));
}

#[test]
fn checkable_lambda_against_a_function_goal() {
    let interner = RefCell::new(StringInterner::new());
    let scope = Scope::new();
    let mut elab = Elaborator::new(&interner, &scope);
    let ctx = TypingContext::new();

    let x = spanned(&interner, "x");
    let symbols = elab.state_ref().symbols();
    let capture_name = SpannedName::new(symbols.capture, Span::Empty);

    // The goal: HostNumber -> HostNumber, with a constant result closure.
    let result_closure = Value::FunLit(alder::core::semantics::Closure::new(
        Arc::new(Value::TupleLit(Vec::new())),
        capture_name,
        capture_name,
        scope.to_scope(core::Term::Literal(Span::Empty, number_type())),
    ));
    let goal: ArcValue<'_> = Arc::new(Value::FunType {
        plicity: Plicity::Explicit,
        purity: Purity::Pure,
        param_type: number_type(),
        result: Arc::new(result_closure),
    });

    let body = scope.to_scope(Checkable::Infer(var(&scope, 0, x)));
    let term = scope.to_scope(Checkable::Lambda {
        span: Span::Empty,
        param: x,
        body,
    });

    let (_, lambda_term) = elab.check(term, &ctx, &goal).unwrap();
    let closure = elab.evaluate(lambda_term, &ctx).unwrap();
    let result = elab
        .apply_value(closure, Value::host_number(8.0))
        .unwrap();
    assert!(matches!(
        result.as_ref(),
        Value::Host(HostValue::Num(num)) if *num == 8.0
    ));
}

#[test]
fn host_if_refines_a_stuck_subject_in_both_branches() {
    let interner = RefCell::new(StringInterner::new());
    let scope = Scope::new();
    let mut elab = Elaborator::new(&interner, &scope);

    let b = spanned(&interner, "b");
    let (ctx, _) = TypingContext::new().push_param(Arc::new(Value::HostBoolType), b);

    // if b then b else b — the unchosen branch's value is observable, and
    // the subject is refined to the matching constant in each branch.
    let subject = scope.to_scope(core::Term::Var(Span::Empty, Index::last(), b));
    let term = scope.to_scope(core::Term::HostIf {
        span: Span::Empty,
        subject,
        consequent: subject,
        alternate: subject,
    });

    let value = elab.evaluate(term, &ctx).unwrap();
    match value.as_ref() {
        Value::Stuck(Stuck::HostIf {
            consequent,
            alternate,
            ..
        }) => {
            assert!(matches!(
                consequent.as_ref(),
                Value::Host(HostValue::Bool(true))
            ));
            assert!(matches!(
                alternate.as_ref(),
                Value::Host(HostValue::Bool(false))
            ));
        }
        other => panic!("expected a stuck conditional, got {:?}", other),
    }
}

#[test]
fn host_int_fold_iterates_from_count_down_to_one() {
    let interner = RefCell::new(StringInterner::new());
    let scope = Scope::new();
    let mut elab = Elaborator::new(&interner, &scope);
    let ctx = TypingContext::new();

    let i = spanned(&interner, "i");
    let acc = spanned(&interner, "acc");
    let capture = spanned(&interner, "fold_capture");

    let add = HostFn::new("add", |inputs| match inputs {
        [HostValue::Num(x), HostValue::Num(y)] => Ok(vec![HostValue::Num(x + y)]),
        _ => Err("expected two numbers".to_owned()),
    });

    // fun i => fun acc => (add (i, acc)).0
    //
    // Inside the tuple-elim the context is `[capture, acc, i]`, so `i`
    // is the most recent binding and `acc` the one before it.
    let sum_elems = scope.to_scope_from_iter([
        core::Term::Var(Span::Empty, Index::from_usize(0), i),
        core::Term::Var(Span::Empty, Index::from_usize(1), acc),
    ]);
    let call = scope.to_scope(core::Term::FunApp(
        Span::Empty,
        scope.to_scope(core::Term::Literal(
            Span::Empty,
            Arc::new(Value::Host(HostValue::Fn(add))),
        )),
        scope.to_scope(core::Term::HostTupleLit(Span::Empty, sum_elems)),
    ));
    let inner_body = scope.to_scope(core::Term::TupleElim {
        span: Span::Empty,
        names: scope.to_scope_from_iter([i]),
        subject: scope.to_scope(core::Term::Var(Span::Empty, Index::from_usize(1), capture)),
        body: scope.to_scope(core::Term::TupleProj(Span::Empty, call, 0)),
    });
    let inner = scope.to_scope(core::Term::FunLit {
        span: Span::Empty,
        param: acc,
        capture_name: capture,
        capture: scope.to_scope(core::Term::TupleLit(
            Span::Empty,
            scope.to_scope_from_iter([core::Term::Var(Span::Empty, Index::from_usize(0), i)]),
        )),
        body: inner_body,
    });
    let fun = scope.to_scope(core::Term::FunLit {
        span: Span::Empty,
        param: i,
        capture_name: capture,
        capture: scope.to_scope(core::Term::TupleLit(Span::Empty, empty_terms(&scope))),
        body: inner,
    });

    let term = scope.to_scope(core::Term::HostIntFold(
        Span::Empty,
        scope.to_scope(core::Term::Literal(Span::Empty, Value::host_number(3.0))),
        fun,
        scope.to_scope(core::Term::Literal(Span::Empty, Value::host_number(0.0))),
    ));

    let value = elab.evaluate(term, &ctx).unwrap();
    assert!(matches!(
        value.as_ref(),
        Value::Host(HostValue::Num(num)) if *num == 6.0
    ));

    // A stuck count produces a stuck fold.
    let n = spanned(&interner, "n");
    let (stuck_ctx, _) = TypingContext::new().push_param(number_type(), n);
    let stuck_term = scope.to_scope(core::Term::HostIntFold(
        Span::Empty,
        scope.to_scope(core::Term::Var(Span::Empty, Index::last(), n)),
        scope.to_scope(core::Term::Literal(Span::Empty, Value::host_number(0.0))),
        scope.to_scope(core::Term::Literal(Span::Empty, Value::host_number(0.0))),
    ));
    let stuck = elab.evaluate(stuck_term, &stuck_ctx).unwrap();
    assert!(matches!(
        stuck.as_ref(),
        Value::Stuck(Stuck::HostIntFold { .. })
    ));
}

#[test]
fn intrinsics_resolve_once_per_source_text() {
    let interner = RefCell::new(StringInterner::new());
    let scope = Scope::new();
    let mut elab = Elaborator::new(&interner, &scope);
    let ctx = TypingContext::new();

    let double = HostFn::new("double", |inputs| match inputs {
        [HostValue::Num(x)] => Ok(vec![HostValue::Num(x * 2.0)]),
        _ => Err("expected a number".to_owned()),
    });
    elab.state().register_intrinsic("builtin.double", double);

    fn intrinsic<'arena>(scope: &'arena Scope<'arena>) -> core::Term<'arena> {
        core::Term::HostIntrinsic {
            span: Span::Empty,
            source: scope.to_scope(core::Term::Literal(
                Span::Empty,
                Value::host_string("builtin.double"),
            )),
            r#type: scope.to_scope(core::Term::Literal(
                Span::Empty,
                Arc::new(Value::HostTypeType),
            )),
        }
    }
    let first = scope.to_scope(intrinsic(&scope));
    let second = scope.to_scope(intrinsic(&scope));

    let first = elab.evaluate(first, &ctx).unwrap();
    let second = elab.evaluate(second, &ctx).unwrap();
    match (first.as_ref(), second.as_ref()) {
        (Value::Host(HostValue::Fn(f0)), Value::Host(HostValue::Fn(f1))) => {
            assert!(f0.same(f1), "intrinsic compilation was not memoised");
        }
        (_, _) => panic!("intrinsics did not evaluate to host functions"),
    }

    // Applying the compiled intrinsic goes through the host calling
    // convention.
    let arg = scope.to_scope(core::Term::HostTupleLit(
        Span::Empty,
        scope.to_scope_from_iter([core::Term::Literal(
            Span::Empty,
            Value::host_number(21.0),
        )]),
    ));
    let call = scope.to_scope(core::Term::FunApp(
        Span::Empty,
        scope.to_scope(intrinsic(&scope)),
        arg,
    ));
    let value = elab.evaluate(call, &ctx).unwrap();
    assert!(matches!(
        value.as_ref(),
        Value::HostTupleLit(elems)
            if matches!(elems.as_slice(), [HostValue::Num(num)] if *num == 42.0)
    ));

    let unknown = scope.to_scope(core::Term::HostIntrinsic {
        span: Span::Empty,
        source: scope.to_scope(core::Term::Literal(
            Span::Empty,
            Value::host_string("builtin.missing"),
        )),
        r#type: scope.to_scope(core::Term::Literal(
            Span::Empty,
            Arc::new(Value::HostTypeType),
        )),
    });
    assert!(matches!(
        elab.evaluate(unknown, &ctx),
        Err(Error::UnknownIntrinsic { .. })
    ));
}
