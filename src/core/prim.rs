//! The host value layer.
//!
//! Host values are the embedder's data: numbers, strings, booleans, native
//! functions, and opaque boxed core values. The evaluator moves between the
//! two layers through host tuples (native calling convention), `host-wrap` /
//! `host-unwrap`, and intrinsics resolved from source strings.

use std::fmt;
use std::sync::Arc;

use crate::core::semantics::ArcValue;

/// A value living in the host layer.
#[derive(Debug, Clone)]
pub enum HostValue<'arena> {
    Num(f64),
    Str(Arc<str>),
    Bool(bool),
    Unit,
    Fn(HostFn<'arena>),
    /// A core value boxed into the host layer by `host-wrap`.
    Boxed(ArcValue<'arena>),
}

impl<'arena> HostValue<'arena> {
    pub fn as_num(&self) -> Option<f64> {
        match self {
            HostValue::Num(num) => Some(*num),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// The result of invoking a native function: a tuple of host values, or a
/// message describing why the call failed.
pub type HostResult<'arena> = Result<Vec<HostValue<'arena>>, String>;

/// A native function. Host functions follow the host calling convention:
/// they consume and produce tuples of host values.
#[derive(Clone)]
pub struct HostFn<'arena> {
    name: &'static str,
    fun: Arc<dyn Fn(&[HostValue<'arena>]) -> HostResult<'arena> + 'arena>,
}

impl<'arena> HostFn<'arena> {
    pub fn new(
        name: &'static str,
        fun: impl Fn(&[HostValue<'arena>]) -> HostResult<'arena> + 'arena,
    ) -> HostFn<'arena> {
        HostFn {
            name,
            fun: Arc::new(fun),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn invoke(&self, inputs: &[HostValue<'arena>]) -> HostResult<'arena> {
        (self.fun)(inputs)
    }

    /// Identity comparison. Two host functions are the same function only
    /// if they are the same registration.
    pub fn same(&self, other: &HostFn<'arena>) -> bool {
        Arc::ptr_eq(&self.fun, &other.fun)
    }
}

impl<'arena> fmt::Debug for HostFn<'arena> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFn({})", self.name)
    }
}
