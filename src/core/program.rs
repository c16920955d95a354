//! Effect programs.
//!
//! Programs step through [`Value::ProgramEnd`] and [`Value::ProgramYield`]:
//! a yield carries the effect, its argument, and a continuation. The
//! coroutines of the original design become an explicit CPS rendering
//! here: a continuation is a stack of `(runtime context, term)` frames,
//! each of which evaluates to a function of the previous step's result.
//!
//! [`EvalContext::execute_program`] drives a program to completion by
//! dispatching yields through the effect-handler registry; resumption is
//! explicit via [`EvalContext::invoke_continuation`].

use std::panic::panic_any;
use std::sync::Arc;

use crate::context::RuntimeContext;
use crate::core::semantics::{ArcValue, EvalContext, Fault, Value};
use crate::core::Term;
use crate::reporting::Error;

/// A handler for a program effect: receives the invocation argument,
/// returns the value threaded into the continuation.
pub type EffectHandler<'arena> =
    Arc<dyn Fn(&ArcValue<'arena>) -> Result<ArcValue<'arena>, Error<'arena>> + 'arena>;

/// One deferred step of a suspended program.
#[derive(Debug, Clone)]
pub struct Frame<'arena> {
    context: RuntimeContext<'arena>,
    term: &'arena Term<'arena>,
}

impl<'arena> Frame<'arena> {
    pub fn new(context: RuntimeContext<'arena>, term: &'arena Term<'arena>) -> Frame<'arena> {
        Frame { context, term }
    }

    pub fn context(&self) -> &RuntimeContext<'arena> {
        &self.context
    }

    pub fn term(&self) -> &'arena Term<'arena> {
        self.term
    }
}

/// The rest of a suspended program, innermost frame first.
#[derive(Debug, Clone)]
pub struct Continuation<'arena> {
    frames: Vec<Frame<'arena>>,
}

impl<'arena> Continuation<'arena> {
    pub fn empty() -> Continuation<'arena> {
        Continuation { frames: Vec::new() }
    }

    pub fn pushed(&self, frame: Frame<'arena>) -> Continuation<'arena> {
        let mut frames = self.frames.clone();
        frames.push(frame);
        Continuation { frames }
    }

    pub fn frames(&self) -> &[Frame<'arena>] {
        &self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl<'arena, 'state> EvalContext<'arena, 'state> {
    /// Run a program value to completion, dispatching every yield through
    /// the registered effect handlers.
    pub fn execute_program(
        &mut self,
        program: &ArcValue<'arena>,
    ) -> Result<ArcValue<'arena>, Error<'arena>> {
        let mut program = program.clone();
        loop {
            let (effect, arg, continuation) = match program.as_ref() {
                Value::ProgramEnd(value) => return Ok(value.clone()),
                Value::ProgramYield {
                    effect,
                    arg,
                    continuation,
                } => (*effect, arg.clone(), continuation.clone()),
                _ => panic_any(Fault::InvalidProgram),
            };
            let handler = self.state.effect_handler(effect)?;
            let result = handler(&arg)?;
            program = self.invoke_continuation(&continuation, result)?;
        }
    }

    /// Resume a suspended program with a value, returning the next program
    /// value (finished, or suspended at the next effect).
    pub fn invoke_continuation(
        &mut self,
        continuation: &Continuation<'arena>,
        value: ArcValue<'arena>,
    ) -> Result<ArcValue<'arena>, Error<'arena>> {
        let mut value = value;
        for (index, frame) in continuation.frames().iter().enumerate() {
            let fun = self.eval(frame.term(), frame.context())?;
            let step = self.apply(fun, value)?;
            match step.as_ref() {
                Value::ProgramEnd(result) => value = result.clone(),
                Value::ProgramYield {
                    effect,
                    arg,
                    continuation: inner,
                } => {
                    // The resumed step suspended again: the remaining
                    // frames are still owed to it.
                    let mut frames = inner.clone();
                    for rest in &continuation.frames()[index + 1..] {
                        frames = frames.pushed(rest.clone());
                    }
                    return Ok(Arc::new(Value::ProgramYield {
                        effect: *effect,
                        arg: arg.clone(),
                        continuation: frames,
                    }));
                }
                _ => panic_any(Fault::InvalidProgram),
            }
        }
        Ok(Arc::new(Value::ProgramEnd(value)))
    }
}
