//! Runtime and typechecking contexts.
//!
//! A context is an ordered sequence of bindings. Runtime contexts carry the
//! bound value and the binder's debug information; typechecking contexts
//! additionally carry the declared type of each binding. Contexts are
//! *values*: extension returns a new context sharing structure with the
//! old one, so a context extended inside a speculative branch can never be
//! observed by the parent.
//!
//! Every context carries an identity stamp. Stamps are used as memoisation
//! keys for evaluation and inference: two contexts with the same stamp are
//! the same context, and nothing else is assumed of them.

use std::panic::panic_any;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::semantics::{ArcValue, Fault, FreeVar, Stuck, Value};
use crate::env::{EnvLen, Index, Level, SharedEnv};
use crate::source::SpannedName;
use crate::StringInterner;

/// Identity stamp for a context. Fresh on every extension.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CtxId(u64);

fn next_ctx_id() -> CtxId {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    CtxId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// A single runtime binding.
#[derive(Debug, Clone)]
pub struct ContextEntry<'arena> {
    pub expr: ArcValue<'arena>,
    pub name: SpannedName,
}

/// An ordered sequence of runtime bindings.
#[derive(Debug, Clone)]
pub struct RuntimeContext<'arena> {
    id: CtxId,
    entries: SharedEnv<ContextEntry<'arena>>,
}

impl<'arena> RuntimeContext<'arena> {
    pub fn new() -> RuntimeContext<'arena> {
        RuntimeContext {
            id: next_ctx_id(),
            entries: SharedEnv::new(),
        }
    }

    pub fn id(&self) -> CtxId {
        self.id
    }

    pub fn len(&self) -> EnvLen {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A new context extending this one with a binding.
    pub fn push(&self, expr: ArcValue<'arena>, name: SpannedName) -> RuntimeContext<'arena> {
        RuntimeContext {
            id: next_ctx_id(),
            entries: self.entries.pushed(ContextEntry { expr, name }),
        }
    }

    pub fn get_level(&self, level: Level) -> Option<&ContextEntry<'arena>> {
        self.entries.get_level(level)
    }

    pub fn get_index(&self, index: Index) -> Option<&ContextEntry<'arena>> {
        self.entries.get_index(index)
    }

    /// Look up a bound variable, checking that the debug information on the
    /// occurrence agrees with the binder's. Disagreement means the term was
    /// built against a different context, which is a fatal bug upstream.
    pub fn lookup(&self, index: Index, name: &SpannedName) -> ArcValue<'arena> {
        match self.get_index(index) {
            None => panic_any(Fault::UnboundVariable),
            Some(entry) => {
                if entry.name != *name {
                    panic_any(Fault::DebugMismatch {
                        expected: entry.name,
                        found: *name,
                    });
                }
                entry.expr.clone()
            }
        }
    }

    /// A new context with the value at `level` replaced, keeping the
    /// binder's debug information. Used when a stuck `host-if` refines its
    /// subject in each branch.
    pub fn refine_level(
        &self,
        level: Level,
        expr: ArcValue<'arena>,
    ) -> Option<RuntimeContext<'arena>> {
        let name = self.get_level(level)?.name;
        Some(RuntimeContext {
            id: next_ctx_id(),
            entries: self.entries.set_level(level, ContextEntry { expr, name })?,
        })
    }

    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &ContextEntry<'arena>> {
        self.entries.iter()
    }
}

impl<'arena> Default for RuntimeContext<'arena> {
    fn default() -> RuntimeContext<'arena> {
        RuntimeContext::new()
    }
}

/// A runtime context paired with the declared type of every binding.
#[derive(Debug, Clone)]
pub struct TypingContext<'arena> {
    runtime: RuntimeContext<'arena>,
    types: SharedEnv<ArcValue<'arena>>,
}

impl<'arena> TypingContext<'arena> {
    pub fn new() -> TypingContext<'arena> {
        TypingContext {
            runtime: RuntimeContext::new(),
            types: SharedEnv::new(),
        }
    }

    pub fn id(&self) -> CtxId {
        self.runtime.id()
    }

    pub fn len(&self) -> EnvLen {
        self.runtime.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runtime.is_empty()
    }

    pub fn runtime(&self) -> &RuntimeContext<'arena> {
        &self.runtime
    }

    pub fn get(&self, level: Level) -> Option<&ContextEntry<'arena>> {
        self.runtime.get_level(level)
    }

    pub fn get_type(&self, level: Level) -> Option<&ArcValue<'arena>> {
        self.types.get_level(level)
    }

    /// Extend with a definition: a binding whose value is known.
    pub fn push_def(
        &self,
        expr: ArcValue<'arena>,
        r#type: ArcValue<'arena>,
        name: SpannedName,
    ) -> TypingContext<'arena> {
        TypingContext {
            runtime: self.runtime.push(expr, name),
            types: self.types.pushed(r#type),
        }
    }

    /// Extend with a parameter: a binding whose value is an opaque
    /// placeholder referring to its own position. Returns the extended
    /// context together with the placeholder value.
    pub fn push_param(
        &self,
        r#type: ArcValue<'arena>,
        name: SpannedName,
    ) -> (TypingContext<'arena>, ArcValue<'arena>) {
        let level = self.len().next_level();
        let expr: ArcValue<'arena> =
            std::sync::Arc::new(Value::Stuck(Stuck::Free(FreeVar::Placeholder(level, name))));
        let context = TypingContext {
            runtime: self.runtime.push(expr.clone(), name),
            types: self.types.pushed(r#type),
        };
        (context, expr)
    }

    /// The names bound in this context, most recent last. For diagnostics.
    pub fn format_names(&self, interner: &StringInterner) -> String {
        use itertools::Itertools;

        self.runtime
            .entries()
            .map(|entry| interner.resolve(entry.name.name).unwrap_or("?"))
            .join(", ")
    }
}

impl<'arena> Default for TypingContext<'arena> {
    fn default() -> TypingContext<'arena> {
        TypingContext::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::semantics::Value;
    use crate::source::{Anchor, Span};
    use crate::StringInterner;

    fn spanned(interner: &mut StringInterner, name: &str) -> SpannedName {
        SpannedName::new(interner.get_or_intern(name), Span::Empty)
    }

    #[test]
    fn lookup_checks_debug_info() {
        let mut interner = StringInterner::new();
        let name = spanned(&mut interner, "x");
        let ctx = RuntimeContext::new().push(Arc::new(Value::HostNumberType), name);
        assert!(matches!(
            ctx.lookup(Index::last(), &name).as_ref(),
            Value::HostNumberType
        ));
    }

    #[test]
    #[should_panic]
    fn mismatched_debug_info_is_fatal() {
        let mut interner = StringInterner::new();
        let name = spanned(&mut interner, "x");
        let ctx = RuntimeContext::new().push(Arc::new(Value::HostNumberType), name);

        // Same symbol, different span: the occurrence was built against a
        // different binder.
        let impostor = SpannedName::new(
            name.name,
            Span::Range(Anchor::new(0, 1, 1), Anchor::new(0, 1, 2)),
        );
        ctx.lookup(Index::last(), &impostor);
    }

    #[test]
    fn parent_context_is_untouched_by_extension() {
        let mut interner = StringInterner::new();
        let x = spanned(&mut interner, "x");
        let y = spanned(&mut interner, "y");

        let parent = TypingContext::new().push_def(
            Arc::new(Value::HostNumberType),
            Value::star(0, 0),
            x,
        );
        let (child, placeholder) = parent.push_param(Value::star(0, 0), y);

        assert_eq!(parent.len().to_usize(), 1);
        assert_eq!(child.len().to_usize(), 2);
        assert_ne!(parent.id(), child.id());
        assert!(matches!(
            placeholder.as_ref(),
            Value::Stuck(crate::core::semantics::Stuck::Free(
                crate::core::semantics::FreeVar::Placeholder(level, _)
            )) if level.to_usize() == 1
        ));
    }
}
