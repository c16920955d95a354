//! The subtyping constraint solver.
//!
//! Obligations live in a directed graph over *nodes*: values interned by
//! identity, plus two nodes per metavariable. A metavariable is not a
//! mutable slot — it is the pair of its `value` node (what the unknown
//! *is*; edges leaving it are upper bounds) and its `usage` node (what it
//! is *expected to be*; edges arriving at it are lower bounds). Bivariance
//! is encoded on the graph itself, and the two nodes are linked during
//! transitivity so that lower bounds compose with upper bounds.
//!
//! Three edge families connect nodes:
//!
//! - constrain edges: `left ≤_rel right`;
//! - left-call edges: `(left arg) ≤_rel right`;
//! - right-call edges: `left ≤_rel (right arg)`.
//!
//! Work is strictly LIFO so composition-derived sub-obligations discharge
//! next to the edge that created them, keeping error causes close to their
//! roots. Every mutable container participates in the shadow protocol, so
//! [`TypecheckerState::speculate`] can abandon a line of reasoning without
//! residue.

use std::sync::Arc;

use fxhash::FxHashMap;
use scoped_arena::Scope;

use crate::context::{CtxId, TypingContext};
use crate::core::prim::HostFn;
use crate::core::program::EffectHandler;
use crate::core::semantics::{ArcValue, EvalContext, Stuck, Value};
use crate::core::subst::Mapping;
use crate::core::{EffectId, HostTypeId, Term, UniqueId};
use crate::env::EnvLen;
use crate::reporting::{Cause, ConstraintError, Error};
use crate::shadow::{ShadowCell, ShadowMap, ShadowQueue, ShadowVec};
use crate::solver::relations::{
    EffectRowRelation, EnumDescRelation, FunctionRelation, RecordDescRelation, Rel,
    TupleDescRelation, UniverseOmegaRelation,
};
use crate::source::Span;
use crate::{StringId, StringInterner};

pub mod relations;

/// A node in the constraint graph.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub fn to_usize(self) -> usize {
        self.0 as usize
    }
}

/// The depth of nested speculative/binder scopes. Metavariables and edges
/// carry the shallowest block at which they remain valid.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockLevel(u32);

impl BlockLevel {
    pub const fn top() -> BlockLevel {
        BlockLevel(0)
    }

    pub fn to_usize(self) -> usize {
        self.0 as usize
    }
}

/// An unknown value: two graph nodes linked through the constraint graph.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Metavariable {
    /// What this unknown is. Edges from this node are upper bounds.
    pub value: NodeId,
    /// What this unknown is expected to be. Edges into this node are lower
    /// bounds.
    pub usage: NodeId,
    pub is_trait: bool,
    /// The metavariable outlives scopes strictly shallower than this.
    pub block_level: BlockLevel,
}

/// Which endpoint of an obligation a value is being converted for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Side {
    Value,
    Usage,
}

#[derive(Debug, Clone)]
enum NodeEntry<'arena> {
    Value {
        value: ArcValue<'arena>,
        ctx: TypingContext<'arena>,
    },
    MetaValue(usize),
    MetaUsage(usize),
}

#[derive(Debug, Clone)]
struct MetaInfo {
    meta: Metavariable,
    #[allow(dead_code)]
    ctx_len: EnvLen,
}

/// `left ≤_rel right`.
#[derive(Debug, Clone)]
pub struct ConstrainEdge<'arena> {
    pub left: NodeId,
    pub right: NodeId,
    pub rel: Rel<'arena>,
    pub block: BlockLevel,
    pub cause: Arc<Cause>,
}

/// `(left arg) ≤_rel right`.
#[derive(Debug, Clone)]
pub struct LeftCallEdge<'arena> {
    pub left: NodeId,
    pub arg: ArcValue<'arena>,
    pub rel: Rel<'arena>,
    pub right: NodeId,
    pub block: BlockLevel,
    pub cause: Arc<Cause>,
}

/// `left ≤_rel (right arg)`.
#[derive(Debug, Clone)]
pub struct RightCallEdge<'arena> {
    pub left: NodeId,
    pub rel: Rel<'arena>,
    pub right: NodeId,
    pub arg: ArcValue<'arena>,
    pub block: BlockLevel,
    pub cause: Arc<Cause>,
}

fn rel_eq<'arena>(rel0: &Rel<'arena>, rel1: &Rel<'arena>) -> bool {
    Arc::ptr_eq(rel0, rel1)
}

fn arg_eq<'arena>(arg0: &ArcValue<'arena>, arg1: &ArcValue<'arena>) -> bool {
    Arc::ptr_eq(arg0, arg1) || crate::core::semantics::convertible(arg0, arg1)
}

trait GraphEdge {
    fn from_node(&self) -> NodeId;
    fn to_node(&self) -> NodeId;
    fn same_obligation(&self, other: &Self) -> bool;
}

impl<'arena> GraphEdge for ConstrainEdge<'arena> {
    fn from_node(&self) -> NodeId {
        self.left
    }
    fn to_node(&self) -> NodeId {
        self.right
    }
    fn same_obligation(&self, other: &Self) -> bool {
        rel_eq(&self.rel, &other.rel)
    }
}

impl<'arena> GraphEdge for LeftCallEdge<'arena> {
    fn from_node(&self) -> NodeId {
        self.left
    }
    fn to_node(&self) -> NodeId {
        self.right
    }
    fn same_obligation(&self, other: &Self) -> bool {
        rel_eq(&self.rel, &other.rel) && arg_eq(&self.arg, &other.arg)
    }
}

impl<'arena> GraphEdge for RightCallEdge<'arena> {
    fn from_node(&self) -> NodeId {
        self.left
    }
    fn to_node(&self) -> NodeId {
        self.right
    }
    fn same_obligation(&self, other: &Self) -> bool {
        rel_eq(&self.rel, &other.rel) && arg_eq(&self.arg, &other.arg)
    }
}

/// One of the three edge families, indexed by from-endpoint, to-endpoint,
/// and both. Inserting a duplicate obligation is a no-op.
#[derive(Debug, Clone)]
struct EdgeSet<E> {
    edges: Vec<E>,
    from: FxHashMap<NodeId, Vec<usize>>,
    to: FxHashMap<NodeId, Vec<usize>>,
    between: FxHashMap<(NodeId, NodeId), Vec<usize>>,
    marks: Vec<usize>,
}

impl<E: GraphEdge> EdgeSet<E> {
    fn new() -> EdgeSet<E> {
        EdgeSet {
            edges: Vec::new(),
            from: FxHashMap::default(),
            to: FxHashMap::default(),
            between: FxHashMap::default(),
            marks: Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.edges.len()
    }

    /// Insert an edge. Returns `false` (a no-op) when an edge with the
    /// same endpoints and obligation already exists.
    fn insert(&mut self, edge: E) -> bool {
        let key = (edge.from_node(), edge.to_node());
        if let Some(indices) = self.between.get(&key) {
            if indices
                .iter()
                .any(|&index| self.edges[index].same_obligation(&edge))
            {
                return false;
            }
        }

        let index = self.edges.len();
        self.from.entry(edge.from_node()).or_default().push(index);
        self.to.entry(edge.to_node()).or_default().push(index);
        self.between.entry(key).or_default().push(index);
        self.edges.push(edge);
        true
    }

    fn iter(&self) -> std::slice::Iter<'_, E> {
        self.edges.iter()
    }

    fn from_node(&self, node: NodeId) -> impl Iterator<Item = &E> {
        self.from
            .get(&node)
            .into_iter()
            .flatten()
            .map(move |&index| &self.edges[index])
    }

    fn to_node(&self, node: NodeId) -> impl Iterator<Item = &E> {
        self.to
            .get(&node)
            .into_iter()
            .flatten()
            .map(move |&index| &self.edges[index])
    }

    fn between_nodes(&self, left: NodeId, right: NodeId) -> impl Iterator<Item = &E> {
        self.between
            .get(&(left, right))
            .into_iter()
            .flatten()
            .map(move |&index| &self.edges[index])
    }

    fn shadow(&mut self) {
        self.marks.push(self.edges.len());
    }

    fn commit(&mut self) {
        let mark = self.marks.pop();
        assert!(mark.is_some(), "commit without a live shadow");
    }

    fn revert(&mut self) {
        let mark = self.marks.pop().expect("revert without a live shadow");
        for index in (mark..self.edges.len()).rev() {
            let edge = &self.edges[index];
            let key = (edge.from_node(), edge.to_node());
            for indices in [
                self.from.get_mut(&edge.from_node()),
                self.to.get_mut(&edge.to_node()),
                self.between.get_mut(&key),
            ]
            .into_iter()
            .flatten()
            {
                debug_assert_eq!(indices.last(), Some(&index));
                indices.pop();
            }
        }
        self.edges.truncate(mark);
    }
}

/// A sliced constraint carried by a `constrained-type` term. Each variant
/// mirrors one of the three edge families crossed with which endpoint is
/// the escaping metavariable.
#[derive(Debug, Clone)]
pub enum ConstraintElem<'arena> {
    SlicedConstrain {
        rel: Rel<'arena>,
        right: &'arena Term<'arena>,
        cause: Arc<Cause>,
    },
    ConstrainSliced {
        left: &'arena Term<'arena>,
        rel: Rel<'arena>,
        cause: Arc<Cause>,
    },
    SlicedLeftCall {
        arg: &'arena Term<'arena>,
        rel: Rel<'arena>,
        right: &'arena Term<'arena>,
        cause: Arc<Cause>,
    },
    LeftCallSliced {
        left: &'arena Term<'arena>,
        arg: &'arena Term<'arena>,
        rel: Rel<'arena>,
        cause: Arc<Cause>,
    },
    SlicedRightCall {
        rel: Rel<'arena>,
        right: &'arena Term<'arena>,
        arg: &'arena Term<'arena>,
        cause: Arc<Cause>,
    },
    RightCallSliced {
        left: &'arena Term<'arena>,
        rel: Rel<'arena>,
        arg: &'arena Term<'arena>,
        cause: Arc<Cause>,
    },
}

#[derive(Debug, Clone)]
enum WorkItem<'arena> {
    Constrain {
        left: NodeId,
        right: NodeId,
        rel: Rel<'arena>,
        block: BlockLevel,
        cause: Arc<Cause>,
    },
    CallLeft {
        left: NodeId,
        arg: ArcValue<'arena>,
        rel: Rel<'arena>,
        right: NodeId,
        block: BlockLevel,
        cause: Arc<Cause>,
    },
    CallRight {
        left: NodeId,
        rel: Rel<'arena>,
        right: NodeId,
        arg: ArcValue<'arena>,
        block: BlockLevel,
        cause: Arc<Cause>,
    },
}

/// Symbols the core needs to recognise by identity: the canonical tuple
/// descriptor constructors, and the name given to closure captures.
#[derive(Debug, Copy, Clone)]
pub struct CoreSymbols {
    pub empty: StringId,
    pub cons: StringId,
    pub capture: StringId,
}

/// An observable summary of the solver state, for checking that a reverted
/// speculation left nothing behind.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub nodes: usize,
    pub metas: usize,
    pub constrain_edges: usize,
    pub left_call_edges: usize,
    pub right_call_edges: usize,
    pub queued: usize,
    pub block_level: BlockLevel,
}

/// The whole mutable state of the typechecker: the constraint graph, the
/// work queue, the metavariable store, the memo tables, and the host
/// registries.
pub struct TypecheckerState<'arena> {
    scope: &'arena Scope<'arena>,
    symbols: CoreSymbols,

    queue: ShadowQueue<WorkItem<'arena>>,
    nodes: ShadowVec<NodeEntry<'arena>>,
    node_intern: ShadowMap<usize, NodeId>,
    metas: ShadowVec<MetaInfo>,
    constrains: EdgeSet<ConstrainEdge<'arena>>,
    left_calls: EdgeSet<LeftCallEdge<'arena>>,
    right_calls: EdgeSet<RightCallEdge<'arena>>,
    block_level: ShadowCell<BlockLevel>,
    unique_counter: ShadowCell<u64>,

    eval_memo: ShadowMap<(usize, CtxId), ArcValue<'arena>>,
    infer_memo: ShadowMap<(usize, CtxId), (ArcValue<'arena>, Vec<usize>, &'arena Term<'arena>)>,
    fn_rel_memo: ShadowMap<usize, Rel<'arena>>,
    intrinsic_cache: ShadowMap<String, HostFn<'arena>>,
    host_srels: ShadowMap<HostTypeId, Rel<'arena>>,

    intrinsics: FxHashMap<String, HostFn<'arena>>,
    effect_handlers: FxHashMap<EffectId, EffectHandler<'arena>>,

    omega: Rel<'arena>,
    tuple_desc_rel: Rel<'arena>,
    enum_desc_rel: Rel<'arena>,
    record_desc_rel: Rel<'arena>,
    effect_row_rel: Rel<'arena>,
}

impl<'arena> TypecheckerState<'arena> {
    pub fn new(
        scope: &'arena Scope<'arena>,
        interner: &mut StringInterner,
    ) -> TypecheckerState<'arena> {
        let symbols = CoreSymbols {
            empty: interner.get_or_intern_static("empty"),
            cons: interner.get_or_intern_static("cons"),
            capture: interner.get_or_intern_static("capture"),
        };

        TypecheckerState {
            scope,
            symbols,

            queue: ShadowQueue::new(),
            nodes: ShadowVec::new(),
            node_intern: ShadowMap::new(),
            metas: ShadowVec::new(),
            constrains: EdgeSet::new(),
            left_calls: EdgeSet::new(),
            right_calls: EdgeSet::new(),
            block_level: ShadowCell::new(BlockLevel::top()),
            unique_counter: ShadowCell::new(0),

            eval_memo: ShadowMap::new(),
            infer_memo: ShadowMap::new(),
            fn_rel_memo: ShadowMap::new(),
            intrinsic_cache: ShadowMap::new(),
            host_srels: ShadowMap::new(),

            intrinsics: FxHashMap::default(),
            effect_handlers: FxHashMap::default(),

            omega: Arc::new(UniverseOmegaRelation),
            tuple_desc_rel: Arc::new(TupleDescRelation),
            enum_desc_rel: Arc::new(EnumDescRelation),
            record_desc_rel: Arc::new(RecordDescRelation),
            effect_row_rel: Arc::new(EffectRowRelation),
        }
    }

    pub fn scope(&self) -> &'arena Scope<'arena> {
        self.scope
    }

    pub fn symbols(&self) -> CoreSymbols {
        self.symbols
    }

    pub fn block_level(&self) -> BlockLevel {
        self.block_level.get()
    }

    /// Enter a binder or speculative scope.
    pub fn enter_block(&mut self) {
        self.block_level.set(BlockLevel(self.block_level.get().0 + 1));
    }

    /// Leave a binder or speculative scope.
    pub fn exit_block(&mut self) {
        self.block_level.set(BlockLevel(self.block_level.get().0 - 1));
    }

    pub fn fresh_unique(&mut self) -> UniqueId {
        let id = self.unique_counter.get();
        self.unique_counter.set(id + 1);
        UniqueId(id)
    }

    // ------------------------------------------------------------------
    // Relations

    /// The universal subtype relation.
    pub fn omega(&self) -> Rel<'arena> {
        self.omega.clone()
    }

    pub fn tuple_desc_rel(&self) -> Rel<'arena> {
        self.tuple_desc_rel.clone()
    }

    pub fn enum_desc_rel(&self) -> Rel<'arena> {
        self.enum_desc_rel.clone()
    }

    pub fn record_desc_rel(&self) -> Rel<'arena> {
        self.record_desc_rel.clone()
    }

    pub fn effect_row_rel(&self) -> Rel<'arena> {
        self.effect_row_rel.clone()
    }

    /// The pointwise lifting of a relation to functions. Construction is
    /// memoised by the inner relation's identity, so repeated liftings of
    /// the same relation compare equal by pointer.
    pub fn function_relation(&mut self, inner: Rel<'arena>) -> Rel<'arena> {
        let key = Arc::as_ptr(&inner) as *const () as usize;
        if let Some(rel) = self.fn_rel_memo.get(&key) {
            return rel.clone();
        }
        let rel: Rel<'arena> = Arc::new(FunctionRelation::new(inner));
        self.fn_rel_memo.insert(key, rel.clone());
        rel
    }

    // ------------------------------------------------------------------
    // Registries

    /// Install a subtype relation for a host-defined type family.
    pub fn register_host_srel(&mut self, id: HostTypeId, rel: Rel<'arena>) {
        self.host_srels.insert(id, rel);
    }

    pub fn host_srel(&self, id: HostTypeId) -> Option<Rel<'arena>> {
        self.host_srels.get(&id).cloned()
    }

    /// Install a handler for a program effect.
    pub fn register_effect_handler(&mut self, effect: EffectId, handler: EffectHandler<'arena>) {
        self.effect_handlers.insert(effect, handler);
    }

    pub fn effect_handler(&self, effect: EffectId) -> Result<EffectHandler<'arena>, Error<'arena>> {
        self.effect_handlers
            .get(&effect)
            .cloned()
            .ok_or(Error::UnknownEffectHandler { effect })
    }

    /// Install the host function an intrinsic source string resolves to.
    pub fn register_intrinsic(&mut self, source: impl Into<String>, host_fn: HostFn<'arena>) {
        self.intrinsics.insert(source.into(), host_fn);
    }

    /// Resolve an intrinsic source string, once per source text.
    pub fn resolve_intrinsic(&mut self, source: &str) -> Result<HostFn<'arena>, Error<'arena>> {
        if let Some(host_fn) = self.intrinsic_cache.get(&source.to_owned()) {
            return Ok(host_fn.clone());
        }
        let host_fn = self
            .intrinsics
            .get(source)
            .cloned()
            .ok_or_else(|| Error::UnknownIntrinsic {
                source: source.to_owned(),
            })?;
        self.intrinsic_cache
            .insert(source.to_owned(), host_fn.clone());
        Ok(host_fn)
    }

    // ------------------------------------------------------------------
    // Memo tables

    pub(crate) fn eval_memo_get(&self, key: &(usize, CtxId)) -> Option<ArcValue<'arena>> {
        self.eval_memo.get(key).cloned()
    }

    pub(crate) fn eval_memo_insert(&mut self, key: (usize, CtxId), value: ArcValue<'arena>) {
        self.eval_memo.insert(key, value);
    }

    pub(crate) fn infer_memo_get(
        &self,
        key: &(usize, CtxId),
    ) -> Option<(ArcValue<'arena>, Vec<usize>, &'arena Term<'arena>)> {
        self.infer_memo.get(key).cloned()
    }

    pub(crate) fn infer_memo_insert(
        &mut self,
        key: (usize, CtxId),
        entry: (ArcValue<'arena>, Vec<usize>, &'arena Term<'arena>),
    ) {
        self.infer_memo.insert(key, entry);
    }

    // ------------------------------------------------------------------
    // Nodes and metavariables

    /// Allocate a fresh metavariable: two linked nodes at the current
    /// block level.
    pub fn metavariable(&mut self, ctx_len: EnvLen, is_trait: bool) -> Metavariable {
        let meta_index = self.metas.len();
        let value = NodeId(self.nodes.len() as u32);
        self.nodes.push(NodeEntry::MetaValue(meta_index));
        let usage = NodeId(self.nodes.len() as u32);
        self.nodes.push(NodeEntry::MetaUsage(meta_index));

        let meta = Metavariable {
            value,
            usage,
            is_trait,
            block_level: self.block_level.get(),
        };
        self.metas.push(MetaInfo { meta, ctx_len });
        meta
    }

    /// The value a node stands for, if it is not a metavariable node.
    pub fn node_value(&self, node: NodeId) -> Option<&ArcValue<'arena>> {
        match self.nodes.get(node.to_usize())? {
            NodeEntry::Value { value, .. } => Some(value),
            _ => None,
        }
    }

    fn node_ctx(&self, node: NodeId) -> Option<&TypingContext<'arena>> {
        match self.nodes.get(node.to_usize())? {
            NodeEntry::Value { ctx, .. } => Some(ctx),
            _ => None,
        }
    }

    /// The metavariable a node belongs to, if any.
    pub fn node_meta(&self, node: NodeId) -> Option<Metavariable> {
        match self.nodes.get(node.to_usize())? {
            NodeEntry::MetaValue(index) | NodeEntry::MetaUsage(index) => {
                Some(self.metas.get(*index)?.meta)
            }
            _ => None,
        }
    }

    /// The usage node paired with a meta value node.
    fn usage_partner(&self, node: NodeId) -> Option<NodeId> {
        match self.nodes.get(node.to_usize())? {
            NodeEntry::MetaValue(index) => Some(self.metas.get(*index)?.meta.usage),
            _ => None,
        }
    }

    /// The value node paired with a meta usage node.
    fn value_partner(&self, node: NodeId) -> Option<NodeId> {
        match self.nodes.get(node.to_usize())? {
            NodeEntry::MetaUsage(index) => Some(self.metas.get(*index)?.meta.value),
            _ => None,
        }
    }

    fn intern_value(&mut self, value: &ArcValue<'arena>, ctx: &TypingContext<'arena>) -> NodeId {
        let key = Arc::as_ptr(value) as usize;
        if let Some(node) = self.node_intern.get(&key) {
            return *node;
        }
        let node = NodeId(self.nodes.len() as u32);
        self.nodes.push(NodeEntry::Value {
            value: value.clone(),
            ctx: ctx.clone(),
        });
        self.node_intern.insert(key, node);
        node
    }

    /// Convert a value into a node id. Bare metavariables map to their own
    /// value or usage node depending on which side of the obligation they
    /// appear on; range values are interned and their bounds queued as
    /// sub-constraints with a lost cause; everything else is interned by
    /// identity.
    pub fn check_value(
        &mut self,
        value: &ArcValue<'arena>,
        ctx: &TypingContext<'arena>,
        side: Side,
    ) -> Result<NodeId, Error<'arena>> {
        if let Some(meta) = value.match_meta() {
            return Ok(match side {
                Side::Value => meta.value,
                Side::Usage => meta.usage,
            });
        }

        if let Value::Range { lower, upper, rel } = value.as_ref() {
            let lower = lower.clone();
            let upper = upper.clone();
            let rel = rel.clone();
            let node = self.intern_value(value, ctx);
            let block = self.block_level.get();
            for bound in &lower {
                let bound_node = self.check_value(bound, ctx, Side::Value)?;
                self.queue.push(WorkItem::Constrain {
                    left: bound_node,
                    right: node,
                    rel: rel.clone(),
                    block,
                    cause: Cause::lost(),
                });
            }
            for bound in &upper {
                let bound_node = self.check_value(bound, ctx, Side::Usage)?;
                self.queue.push(WorkItem::Constrain {
                    left: node,
                    right: bound_node,
                    rel: rel.clone(),
                    block,
                    cause: Cause::lost(),
                });
            }
            return Ok(node);
        }

        Ok(self.intern_value(value, ctx))
    }

    // ------------------------------------------------------------------
    // The public obligation interface

    /// Assert `val ≤ use` under the universal relation.
    pub fn flow(
        &mut self,
        val: &ArcValue<'arena>,
        val_ctx: &TypingContext<'arena>,
        use_: &ArcValue<'arena>,
        use_ctx: &TypingContext<'arena>,
        cause: Arc<Cause>,
    ) -> Result<(), Error<'arena>> {
        let omega = self.omega();
        self.constrain(val, val_ctx, use_, use_ctx, omega, cause)
    }

    /// Assert `val ≤_rel use`.
    pub fn constrain(
        &mut self,
        val: &ArcValue<'arena>,
        val_ctx: &TypingContext<'arena>,
        use_: &ArcValue<'arena>,
        use_ctx: &TypingContext<'arena>,
        rel: Rel<'arena>,
        cause: Arc<Cause>,
    ) -> Result<(), Error<'arena>> {
        let left = self.check_value(val, val_ctx, Side::Value)?;
        let right = self.check_value(use_, use_ctx, Side::Usage)?;
        self.queue.push(WorkItem::Constrain {
            left,
            right,
            rel,
            block: self.block_level.get(),
            cause,
        });
        self.run_queue()
    }

    /// Assert `(left arg) ≤_rel right`.
    pub fn constrain_call_left(
        &mut self,
        left: &ArcValue<'arena>,
        left_ctx: &TypingContext<'arena>,
        arg: ArcValue<'arena>,
        rel: Rel<'arena>,
        right: &ArcValue<'arena>,
        right_ctx: &TypingContext<'arena>,
        cause: Arc<Cause>,
    ) -> Result<(), Error<'arena>> {
        let left = self.check_value(left, left_ctx, Side::Value)?;
        let right = self.check_value(right, right_ctx, Side::Usage)?;
        self.queue.push(WorkItem::CallLeft {
            left,
            arg,
            rel,
            right,
            block: self.block_level.get(),
            cause,
        });
        self.run_queue()
    }

    /// Assert `left ≤_rel (right arg)`.
    pub fn constrain_call_right(
        &mut self,
        left: &ArcValue<'arena>,
        left_ctx: &TypingContext<'arena>,
        rel: Rel<'arena>,
        right: &ArcValue<'arena>,
        right_ctx: &TypingContext<'arena>,
        arg: ArcValue<'arena>,
        cause: Arc<Cause>,
    ) -> Result<(), Error<'arena>> {
        let left = self.check_value(left, left_ctx, Side::Value)?;
        let right = self.check_value(right, right_ctx, Side::Usage)?;
        self.queue.push(WorkItem::CallRight {
            left,
            rel,
            right,
            arg,
            block: self.block_level.get(),
            cause,
        });
        self.run_queue()
    }

    /// Drain the work queue, LIFO.
    fn run_queue(&mut self) -> Result<(), Error<'arena>> {
        while let Some(item) = self.queue.pop() {
            match item {
                WorkItem::Constrain {
                    left,
                    right,
                    rel,
                    block,
                    cause,
                } => self.process_constrain(left, right, rel, block, cause)?,
                WorkItem::CallLeft {
                    left,
                    arg,
                    rel,
                    right,
                    block,
                    cause,
                } => self.process_call_left(left, arg, rel, right, block, cause)?,
                WorkItem::CallRight {
                    left,
                    rel,
                    right,
                    arg,
                    block,
                    cause,
                } => self.process_call_right(left, rel, right, arg, block, cause)?,
            }
        }
        Ok(())
    }

    /// Whether a constrain edge under `constrain_rel` lets calls under
    /// `call_rel` pass through its endpoints.
    fn composes_with_call(&mut self, constrain_rel: &Rel<'arena>, call_rel: &Rel<'arena>) -> bool {
        if rel_eq(constrain_rel, &self.omega) {
            return true;
        }
        let lifted = self.function_relation(call_rel.clone());
        rel_eq(constrain_rel, &lifted)
    }

    /// Apply a node's value to an argument and convert the result into a
    /// node on the given side.
    fn apply_node_value(
        &mut self,
        node: NodeId,
        arg: &ArcValue<'arena>,
        side: Side,
    ) -> Result<Option<NodeId>, Error<'arena>> {
        let (value, ctx) = match (self.node_value(node), self.node_ctx(node)) {
            (Some(value), Some(ctx)) => (value.clone(), ctx.clone()),
            _ => return Ok(None),
        };
        let applied = EvalContext::with_ambient(self, ctx.clone()).apply(value, arg.clone())?;
        Ok(Some(self.check_value(&applied, &ctx, side)?))
    }

    fn process_constrain(
        &mut self,
        left: NodeId,
        right: NodeId,
        rel: Rel<'arena>,
        block: BlockLevel,
        cause: Arc<Cause>,
    ) -> Result<(), Error<'arena>> {
        let inserted = self.constrains.insert(ConstrainEdge {
            left,
            right,
            rel: rel.clone(),
            block,
            cause: cause.clone(),
        });
        if !inserted {
            return Ok(());
        }

        // Transitivity. The two nodes of a metavariable are linked here:
        // lower bounds arrive at its usage node and upper bounds leave
        // from its value node, and both must compose.
        let mut predecessor_nodes = vec![left];
        predecessor_nodes.extend(self.usage_partner(left));
        let mut successor_nodes = vec![right];
        successor_nodes.extend(self.value_partner(right));

        let mut derived = Vec::new();
        for &node in &predecessor_nodes {
            for edge in self.constrains.to_node(node) {
                if rel_eq(&edge.rel, &rel) && edge.left != left {
                    derived.push(WorkItem::Constrain {
                        left: edge.left,
                        right,
                        rel: rel.clone(),
                        block: Ord::min(edge.block, block),
                        cause: Cause::composed(edge.cause.clone(), cause.clone()),
                    });
                }
            }
        }
        for &node in &successor_nodes {
            for edge in self.constrains.from_node(node) {
                if rel_eq(&edge.rel, &rel) && edge.right != right {
                    derived.push(WorkItem::Constrain {
                        left,
                        right: edge.right,
                        rel: rel.clone(),
                        block: Ord::min(edge.block, block),
                        cause: Cause::composed(cause.clone(), edge.cause.clone()),
                    });
                }
            }
        }
        for item in derived {
            self.queue.push(item);
        }

        let left_value = self.node_value(left).cloned();
        let right_value = self.node_value(right).cloned();
        let left_is_meta = self.node_meta(left).is_some();
        let right_is_meta = self.node_meta(right).is_some();

        // Head check: concrete incompatibilities are detected here.
        if let (Some(left_value), Some(right_value)) = (&left_value, &right_value) {
            if !left_is_meta
                && !right_is_meta
                && !left_value.is_stuck_application()
                && !right_value.is_stuck_application()
            {
                let left_ctx = self.node_ctx(left).cloned().unwrap_or_default();
                let right_ctx = self.node_ctx(right).cloned().unwrap_or_default();
                let head_rel = rel.clone();
                head_rel.constrain(self, &left_ctx, left_value, &right_ctx, right_value, &cause)?;
            }
        }

        // Induced calls: a stuck application on either side becomes a call
        // edge from its function node to the other side.
        if let Some(Value::Stuck(Stuck::FunApp(fun, arg))) = left_value.as_deref() {
            let fun: ArcValue<'arena> = Arc::new(Value::Stuck((**fun).clone()));
            let ctx = self.node_ctx(left).cloned().unwrap_or_default();
            let fun_node = self.check_value(&fun, &ctx, Side::Value)?;
            self.queue.push(WorkItem::CallLeft {
                left: fun_node,
                arg: arg.clone(),
                rel: rel.clone(),
                right,
                block,
                cause: Cause::nested("left side is a stuck application", cause.clone()),
            });
        }
        if let Some(Value::Stuck(Stuck::FunApp(fun, arg))) = right_value.as_deref() {
            let fun: ArcValue<'arena> = Arc::new(Value::Stuck((**fun).clone()));
            let ctx = self.node_ctx(right).cloned().unwrap_or_default();
            let fun_node = self.check_value(&fun, &ctx, Side::Usage)?;
            self.queue.push(WorkItem::CallRight {
                left,
                rel: rel.clone(),
                right: fun_node,
                arg: arg.clone(),
                block,
                cause: Cause::nested("right side is a stuck application", cause.clone()),
            });
        }

        // Left-call composition: `left ≤ M` and `(M arg) ≤ R'` give
        // `(left arg) ≤ R'`.
        if right_is_meta {
            let mut call_nodes = vec![right];
            call_nodes.extend(self.value_partner(right));
            let calls: Vec<LeftCallEdge<'arena>> = call_nodes
                .iter()
                .flat_map(|&node| self.left_calls.from_node(node))
                .cloned()
                .collect();
            for call in calls {
                if !self.composes_with_call(&rel, &call.rel) {
                    continue;
                }
                if let Some(applied) = self.apply_node_value(left, &call.arg, Side::Value)? {
                    self.queue.push(WorkItem::Constrain {
                        left: applied,
                        right: call.right,
                        rel: call.rel.clone(),
                        block: Ord::min(block, call.block),
                        cause: Cause::composed(cause.clone(), call.cause.clone()),
                    });
                }
            }
        }

        // Right-call composition: `L' ≤ (M arg)` and `M ≤ right` give
        // `L' ≤ (right arg)`.
        if left_is_meta {
            let mut call_nodes = vec![left];
            call_nodes.extend(self.usage_partner(left));
            let calls: Vec<RightCallEdge<'arena>> = call_nodes
                .iter()
                .flat_map(|&node| self.right_calls.to_node(node))
                .cloned()
                .collect();
            for call in calls {
                if !self.composes_with_call(&rel, &call.rel) {
                    continue;
                }
                if let Some(applied) = self.apply_node_value(right, &call.arg, Side::Usage)? {
                    self.queue.push(WorkItem::Constrain {
                        left: call.left,
                        right: applied,
                        rel: call.rel.clone(),
                        block: Ord::min(block, call.block),
                        cause: Cause::composed(call.cause.clone(), cause.clone()),
                    });
                }
            }
        }

        Ok(())
    }

    fn process_call_left(
        &mut self,
        left: NodeId,
        arg: ArcValue<'arena>,
        rel: Rel<'arena>,
        right: NodeId,
        block: BlockLevel,
        cause: Arc<Cause>,
    ) -> Result<(), Error<'arena>> {
        let inserted = self.left_calls.insert(LeftCallEdge {
            left,
            arg: arg.clone(),
            rel: rel.clone(),
            right,
            block,
            cause: cause.clone(),
        });
        if !inserted {
            return Ok(());
        }

        let mut endpoint_nodes = vec![left];
        endpoint_nodes.extend(self.usage_partner(left));

        // Discharge the call through supertypes of the function: an
        // incoming `X ≤_{Fun(rel)} left` gives `(X arg) ≤_rel right`.
        let incoming: Vec<ConstrainEdge<'arena>> = endpoint_nodes
            .iter()
            .flat_map(|&node| self.constrains.to_node(node))
            .cloned()
            .collect();
        for edge in incoming {
            if !self.composes_with_call(&edge.rel, &rel) {
                continue;
            }
            if let Some(applied) = self.apply_node_value(edge.left, &arg, Side::Value)? {
                self.queue.push(WorkItem::Constrain {
                    left: applied,
                    right,
                    rel: rel.clone(),
                    block: Ord::min(block, edge.block),
                    cause: Cause::composed(edge.cause.clone(), cause.clone()),
                });
            }
        }

        // Meets: a right-call `X ≤_rel (left arg)` against this edge's
        // `(left arg) ≤_rel right` gives `X ≤_rel right` directly.
        let meets: Vec<RightCallEdge<'arena>> = endpoint_nodes
            .iter()
            .flat_map(|&node| self.right_calls.to_node(node))
            .cloned()
            .collect();
        for meet in meets {
            if rel_eq(&meet.rel, &rel) && arg_eq(&meet.arg, &arg) {
                self.queue.push(WorkItem::Constrain {
                    left: meet.left,
                    right,
                    rel: rel.clone(),
                    block: Ord::min(block, meet.block),
                    cause: Cause::composed(meet.cause.clone(), cause.clone()),
                });
            }
        }

        Ok(())
    }

    fn process_call_right(
        &mut self,
        left: NodeId,
        rel: Rel<'arena>,
        right: NodeId,
        arg: ArcValue<'arena>,
        block: BlockLevel,
        cause: Arc<Cause>,
    ) -> Result<(), Error<'arena>> {
        let inserted = self.right_calls.insert(RightCallEdge {
            left,
            rel: rel.clone(),
            right,
            arg: arg.clone(),
            block,
            cause: cause.clone(),
        });
        if !inserted {
            return Ok(());
        }

        let mut endpoint_nodes = vec![right];
        endpoint_nodes.extend(self.value_partner(right));

        // Discharge through subtypes of the function: an outgoing
        // `right ≤_{Fun(rel)} Y` gives `left ≤_rel (Y arg)`.
        let outgoing: Vec<ConstrainEdge<'arena>> = endpoint_nodes
            .iter()
            .flat_map(|&node| self.constrains.from_node(node))
            .cloned()
            .collect();
        for edge in outgoing {
            if !self.composes_with_call(&edge.rel, &rel) {
                continue;
            }
            if let Some(applied) = self.apply_node_value(edge.right, &arg, Side::Usage)? {
                self.queue.push(WorkItem::Constrain {
                    left,
                    right: applied,
                    rel: rel.clone(),
                    block: Ord::min(block, edge.block),
                    cause: Cause::composed(cause.clone(), edge.cause.clone()),
                });
            }
        }

        // Meets: a left-call `(right arg) ≤_rel Y` against this edge's
        // `left ≤_rel (right arg)` gives `left ≤_rel Y` directly.
        let meets: Vec<LeftCallEdge<'arena>> = endpoint_nodes
            .iter()
            .flat_map(|&node| self.left_calls.from_node(node))
            .cloned()
            .collect();
        for meet in meets {
            if rel_eq(&meet.rel, &rel) && arg_eq(&meet.arg, &arg) {
                self.queue.push(WorkItem::Constrain {
                    left,
                    right: meet.right,
                    rel: rel.clone(),
                    block: Ord::min(block, meet.block),
                    cause: Cause::composed(cause.clone(), meet.cause.clone()),
                });
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Speculation

    fn shadow(&mut self) {
        self.queue.shadow();
        self.nodes.shadow();
        self.node_intern.shadow();
        self.metas.shadow();
        self.constrains.shadow();
        self.left_calls.shadow();
        self.right_calls.shadow();
        self.block_level.shadow();
        self.unique_counter.shadow();
        self.eval_memo.shadow();
        self.infer_memo.shadow();
        self.fn_rel_memo.shadow();
        self.intrinsic_cache.shadow();
        self.host_srels.shadow();
    }

    fn commit(&mut self) {
        self.queue.commit();
        self.nodes.commit();
        self.node_intern.commit();
        self.metas.commit();
        self.constrains.commit();
        self.left_calls.commit();
        self.right_calls.commit();
        self.block_level.commit();
        self.unique_counter.commit();
        self.eval_memo.commit();
        self.infer_memo.commit();
        self.fn_rel_memo.commit();
        self.intrinsic_cache.commit();
        self.host_srels.commit();
    }

    fn revert(&mut self) {
        self.queue.revert();
        self.nodes.revert();
        self.node_intern.revert();
        self.metas.revert();
        self.constrains.revert();
        self.left_calls.revert();
        self.right_calls.revert();
        self.block_level.revert();
        self.unique_counter.revert();
        self.eval_memo.revert();
        self.infer_memo.revert();
        self.fn_rel_memo.revert();
        self.intrinsic_cache.revert();
        self.host_srels.revert();
    }

    /// Run `f` inside a transactional scope: commit its writes on success,
    /// revert them without residue on failure. The block level is one
    /// deeper inside the scope, so metavariables created within are
    /// recognisably local to it.
    pub fn speculate<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, Error<'arena>>,
    ) -> Result<T, Error<'arena>> {
        self.shadow();
        self.enter_block();
        match f(self) {
            Ok(value) => {
                self.exit_block();
                self.commit();
                Ok(value)
            }
            Err(error) => {
                self.revert();
                Err(error)
            }
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            nodes: self.nodes.len(),
            metas: self.metas.len(),
            constrain_edges: self.constrains.len(),
            left_call_edges: self.left_calls.len(),
            right_call_edges: self.right_calls.len(),
            queued: self.queue.len(),
            block_level: self.block_level.get(),
        }
    }

    // ------------------------------------------------------------------
    // Inspection

    pub fn constrain_edges(&self) -> impl Iterator<Item = &ConstrainEdge<'arena>> {
        self.constrains.iter()
    }

    pub fn left_call_edges(&self) -> impl Iterator<Item = &LeftCallEdge<'arena>> {
        self.left_calls.iter()
    }

    pub fn right_call_edges(&self) -> impl Iterator<Item = &RightCallEdge<'arena>> {
        self.right_calls.iter()
    }

    pub fn constrain_edges_between(
        &self,
        left: NodeId,
        right: NodeId,
    ) -> impl Iterator<Item = &ConstrainEdge<'arena>> {
        self.constrains.between_nodes(left, right)
    }

    // ------------------------------------------------------------------
    // Slicing

    /// Every value reachable from the constraint edges touching a
    /// metavariable: the other endpoints' values and the call arguments.
    /// Used by usage gathering.
    pub(crate) fn touching_values(&self, meta: Metavariable) -> Vec<ArcValue<'arena>> {
        let mut values = Vec::new();
        let mut push_node = |values: &mut Vec<ArcValue<'arena>>, node: NodeId| {
            if let Some(value) = self.node_value(node) {
                values.push(value.clone());
            }
        };

        for node in [meta.value, meta.usage] {
            for edge in self.constrains.from_node(node) {
                push_node(&mut values, edge.right);
            }
            for edge in self.constrains.to_node(node) {
                push_node(&mut values, edge.left);
            }
            for edge in self.left_calls.from_node(node) {
                values.push(edge.arg.clone());
                push_node(&mut values, edge.right);
            }
            for edge in self.left_calls.to_node(node) {
                values.push(edge.arg.clone());
                push_node(&mut values, edge.left);
            }
            for edge in self.right_calls.from_node(node) {
                values.push(edge.arg.clone());
                push_node(&mut values, edge.right);
            }
            for edge in self.right_calls.to_node(node) {
                values.push(edge.arg.clone());
                push_node(&mut values, edge.left);
            }
        }

        values
    }

    /// Whether an edge endpoint survives the scope the escaping
    /// metavariable is leaving: it must be concrete, or a metavariable
    /// from a strictly shallower block.
    fn endpoint_survives(&self, node: NodeId) -> bool {
        match self.node_meta(node) {
            None => true,
            Some(meta) => meta.block_level < self.block_level.get(),
        }
    }

    fn endpoint_term(
        &mut self,
        node: NodeId,
        mapping: &Mapping<'arena>,
        ctx: &TypingContext<'arena>,
    ) -> Result<&'arena Term<'arena>, Error<'arena>> {
        match self.node_meta(node) {
            Some(meta) => Ok(self.scope.to_scope(Term::Meta(Span::Empty, meta))),
            None => {
                let value = self
                    .node_value(node)
                    .cloned()
                    .expect("endpoint without a value");
                crate::core::subst::substitute_inner(self, &value, mapping, ctx)
            }
        }
    }

    fn value_term(
        &mut self,
        value: &ArcValue<'arena>,
        mapping: &Mapping<'arena>,
        ctx: &TypingContext<'arena>,
    ) -> Result<&'arena Term<'arena>, Error<'arena>> {
        crate::core::subst::substitute_inner(self, value, mapping, ctx)
    }

    /// Extract the slice of the constraint graph attached to an escaping
    /// metavariable as constraint elements for a `constrained-type` term.
    /// Only edges whose other endpoint survives the current scope are
    /// kept; evaluating the resulting term re-registers them against a
    /// fresh metavariable in the outer scope.
    pub fn slice_constraints_for(
        &mut self,
        meta: Metavariable,
        mapping: &Mapping<'arena>,
        ctx: &TypingContext<'arena>,
    ) -> Result<&'arena [ConstraintElem<'arena>], Error<'arena>> {
        let meta_nodes = [meta.value, meta.usage];
        let is_meta_node = |node: NodeId| node == meta.value || node == meta.usage;

        let mut constrain_edges = Vec::new();
        let mut left_call_edges = Vec::new();
        let mut right_call_edges = Vec::new();
        for node in meta_nodes {
            constrain_edges.extend(self.constrains.from_node(node).cloned());
            constrain_edges.extend(
                self.constrains
                    .to_node(node)
                    .filter(|edge| !is_meta_node(edge.left))
                    .cloned(),
            );
            left_call_edges.extend(self.left_calls.from_node(node).cloned());
            left_call_edges.extend(
                self.left_calls
                    .to_node(node)
                    .filter(|edge| !is_meta_node(edge.left))
                    .cloned(),
            );
            right_call_edges.extend(self.right_calls.from_node(node).cloned());
            right_call_edges.extend(
                self.right_calls
                    .to_node(node)
                    .filter(|edge| !is_meta_node(edge.left))
                    .cloned(),
            );
        }

        let mut elems = Vec::new();
        for edge in constrain_edges {
            if is_meta_node(edge.left) {
                if !self.endpoint_survives(edge.right) {
                    continue;
                }
                let right = self.endpoint_term(edge.right, mapping, ctx)?;
                elems.push(ConstraintElem::SlicedConstrain {
                    rel: edge.rel,
                    right,
                    cause: edge.cause,
                });
            } else {
                if !self.endpoint_survives(edge.left) {
                    continue;
                }
                let left = self.endpoint_term(edge.left, mapping, ctx)?;
                elems.push(ConstraintElem::ConstrainSliced {
                    left,
                    rel: edge.rel,
                    cause: edge.cause,
                });
            }
        }
        for edge in left_call_edges {
            if is_meta_node(edge.left) {
                if !self.endpoint_survives(edge.right) {
                    continue;
                }
                let arg = self.value_term(&edge.arg, mapping, ctx)?;
                let right = self.endpoint_term(edge.right, mapping, ctx)?;
                elems.push(ConstraintElem::SlicedLeftCall {
                    arg,
                    rel: edge.rel,
                    right,
                    cause: edge.cause,
                });
            } else {
                if !self.endpoint_survives(edge.left) {
                    continue;
                }
                let left = self.endpoint_term(edge.left, mapping, ctx)?;
                let arg = self.value_term(&edge.arg, mapping, ctx)?;
                elems.push(ConstraintElem::LeftCallSliced {
                    left,
                    arg,
                    rel: edge.rel,
                    cause: edge.cause,
                });
            }
        }
        for edge in right_call_edges {
            if is_meta_node(edge.left) {
                if !self.endpoint_survives(edge.right) {
                    continue;
                }
                let right = self.endpoint_term(edge.right, mapping, ctx)?;
                let arg = self.value_term(&edge.arg, mapping, ctx)?;
                elems.push(ConstraintElem::SlicedRightCall {
                    rel: edge.rel,
                    right,
                    arg,
                    cause: edge.cause,
                });
            } else {
                if !self.endpoint_survives(edge.left) {
                    continue;
                }
                let left = self.endpoint_term(edge.left, mapping, ctx)?;
                let arg = self.value_term(&edge.arg, mapping, ctx)?;
                elems.push(ConstraintElem::RightCallSliced {
                    left,
                    rel: edge.rel,
                    arg,
                    cause: edge.cause,
                });
            }
        }

        Ok(self.scope.to_scope_from_iter(elems))
    }

    /// Whether a node belongs to any metavariable.
    pub fn is_meta_node(&self, node: NodeId) -> bool {
        self.node_meta(node).is_some()
    }

    /// Build a [`ConstraintError`] for a failed head check.
    pub fn constraint_error(
        &self,
        desc: impl Into<String>,
        left: &ArcValue<'arena>,
        left_ctx: &TypingContext<'arena>,
        op: &'static str,
        right: &ArcValue<'arena>,
        right_ctx: &TypingContext<'arena>,
        cause: &Arc<Cause>,
    ) -> Error<'arena> {
        Error::Constraint(Box::new(ConstraintError {
            desc: desc.into(),
            left: left.clone(),
            left_ctx: left_ctx.clone(),
            op,
            right: right.clone(),
            right_ctx: right_ctx.clone(),
            cause: cause.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::context::TypingContext;
    use crate::core::semantics::Value;
    use crate::source::Span;
    use crate::StringInterner;

    fn cause() -> Arc<Cause> {
        Cause::primitive("test obligation", Span::Empty)
    }

    #[test]
    fn flow_is_reflexive() {
        let interner = RefCell::new(StringInterner::new());
        let scope = Scope::new();
        let mut state = TypecheckerState::new(&scope, &mut interner.borrow_mut());
        let ctx = TypingContext::new();

        let values = [
            Value::star(0, 0),
            Arc::new(Value::HostNumberType),
            Arc::new(Value::HostBoolType),
            Value::host_number(3.0),
            Arc::new(Value::Prop),
            Arc::new(Value::UnionType(
                Value::star(0, 0),
                Arc::new(Value::HostNumberType),
            )),
        ];
        for value in values {
            state
                .flow(&value, &ctx, &value.clone(), &ctx, cause())
                .unwrap_or_else(|error| panic!("not reflexive: {error}"));
        }
    }

    #[test]
    fn duplicate_edges_are_a_noop() {
        let interner = RefCell::new(StringInterner::new());
        let scope = Scope::new();
        let mut state = TypecheckerState::new(&scope, &mut interner.borrow_mut());
        let ctx = TypingContext::new();

        let lower = Value::star(0, 1);
        let upper = Value::star(1, 0);
        state.flow(&lower, &ctx, &upper, &ctx, cause()).unwrap();
        let edges = state.snapshot().constrain_edges;
        state.flow(&lower, &ctx, &upper, &ctx, cause()).unwrap();
        assert_eq!(state.snapshot().constrain_edges, edges);
    }

    #[test]
    fn transitivity_closes_through_metavariables() {
        let interner = RefCell::new(StringInterner::new());
        let scope = Scope::new();
        let mut state = TypecheckerState::new(&scope, &mut interner.borrow_mut());
        let ctx = TypingContext::new();

        let meta = state.metavariable(crate::env::EnvLen::new(), false);
        let meta_value = Value::meta(meta);
        let lower = Value::star(0, 0);
        let upper = Value::star(1, 0);

        state.flow(&lower, &ctx, &meta_value, &ctx, cause()).unwrap();
        state.flow(&meta_value, &ctx, &upper, &ctx, cause()).unwrap();

        // The lower bound must have composed with the upper bound through
        // the metavariable's two nodes.
        let lower_node = state.check_value(&lower, &ctx, Side::Value).unwrap();
        let upper_node = state.check_value(&upper, &ctx, Side::Usage).unwrap();
        assert!(
            state
                .constrain_edges_between(lower_node, upper_node)
                .next()
                .is_some(),
            "no transitive edge between the metavariable's bounds"
        );
    }

    #[test]
    fn reverted_speculation_leaves_no_residue() {
        let interner = RefCell::new(StringInterner::new());
        let scope = Scope::new();
        let mut state = TypecheckerState::new(&scope, &mut interner.borrow_mut());
        let ctx = TypingContext::new();

        let lower = Value::star(0, 0);
        state
            .flow(&lower, &ctx, &lower.clone(), &ctx, cause())
            .unwrap();

        let snapshot = state.snapshot();
        let result: Result<(), Error<'_>> = state.speculate(|state| {
            let meta = state.metavariable(crate::env::EnvLen::new(), false);
            let meta_value = Value::meta(meta);
            let number = Arc::new(Value::HostNumberType);
            state.flow(&number, &ctx, &meta_value, &ctx, cause())?;
            Err(Error::NotImplemented("abandon this branch"))
        });
        assert!(result.is_err());
        assert_eq!(state.snapshot(), snapshot);
    }

    #[test]
    fn committed_speculation_keeps_its_edges() {
        let interner = RefCell::new(StringInterner::new());
        let scope = Scope::new();
        let mut state = TypecheckerState::new(&scope, &mut interner.borrow_mut());
        let ctx = TypingContext::new();

        let snapshot = state.snapshot();
        state
            .speculate(|state| {
                let lower = Value::star(0, 0);
                let upper = Value::star(1, 0);
                state.flow(&lower, &ctx, &upper, &ctx, cause())
            })
            .unwrap();
        assert!(state.snapshot().constrain_edges > snapshot.constrain_edges);
        assert_eq!(state.snapshot().block_level, snapshot.block_level);
    }

    #[test]
    fn singleton_subsumption() {
        let interner = RefCell::new(StringInterner::new());
        let scope = Scope::new();
        let mut state = TypecheckerState::new(&scope, &mut interner.borrow_mut());
        let ctx = TypingContext::new();

        let number = Arc::new(Value::HostNumberType);
        let singleton = Arc::new(Value::Singleton {
            supertype: number.clone(),
            value: Value::host_number(3.0),
        });

        state.flow(&singleton, &ctx, &number, &ctx, cause()).unwrap();
        assert!(state.flow(&number, &ctx, &singleton, &ctx, cause()).is_err());

        let same = Arc::new(Value::Singleton {
            supertype: number.clone(),
            value: Value::host_number(3.0),
        });
        state.flow(&singleton, &ctx, &same, &ctx, cause()).unwrap();

        let other = Arc::new(Value::Singleton {
            supertype: number,
            value: Value::host_number(4.0),
        });
        assert!(state.flow(&singleton, &ctx, &other, &ctx, cause()).is_err());
    }

    #[test]
    fn star_lattice_ordering() {
        let interner = RefCell::new(StringInterner::new());
        let scope = Scope::new();
        let mut state = TypecheckerState::new(&scope, &mut interner.borrow_mut());
        let ctx = TypingContext::new();

        // Levels go up and depths go down along the subtype order.
        state
            .flow(&Value::star(0, 2), &ctx, &Value::star(1, 1), &ctx, cause())
            .unwrap();
        assert!(state
            .flow(&Value::star(2, 0), &ctx, &Value::star(1, 0), &ctx, cause())
            .is_err());
        assert!(state
            .flow(&Value::star(0, 0), &ctx, &Value::star(1, 1), &ctx, cause())
            .is_err());
    }

    #[test]
    fn host_type_families_use_their_registered_variance() {
        use crate::core::HostTypeId;
        use crate::solver::relations::{IndepTupleRelation, Variance};

        let interner = RefCell::new(StringInterner::new());
        let scope = Scope::new();
        let mut state = TypecheckerState::new(&scope, &mut interner.borrow_mut());
        let ctx = TypingContext::new();

        let family = HostTypeId(1);
        state.register_host_srel(
            family,
            Arc::new(IndepTupleRelation::new(vec![
                Variance::Covariant,
                Variance::Contravariant,
            ])),
        );

        let sub: ArcValue<'_> = Arc::new(Value::HostUserDefinedType {
            id: family,
            args: vec![Value::star(0, 1), Value::star(1, 0)],
        });
        let sup: ArcValue<'_> = Arc::new(Value::HostUserDefinedType {
            id: family,
            args: vec![Value::star(1, 0), Value::star(0, 1)],
        });

        state.flow(&sub, &ctx, &sup, &ctx, cause()).unwrap();
        assert!(state.flow(&sup, &ctx, &sub, &ctx, cause()).is_err());
    }

    #[test]
    fn range_bounds_unpack_with_lost_causes() {
        let interner = RefCell::new(StringInterner::new());
        let scope = Scope::new();
        let mut state = TypecheckerState::new(&scope, &mut interner.borrow_mut());
        let ctx = TypingContext::new();

        let omega = state.omega();
        let range: ArcValue<'_> = Arc::new(Value::Range {
            lower: vec![Value::star(0, 1)],
            upper: vec![Value::star(1, 0)],
            rel: omega,
        });
        state
            .flow(&range, &ctx, &Value::star(2, 0), &ctx, cause())
            .unwrap();

        // The bound edges bypass the normal cause chain.
        assert!(state
            .constrain_edges()
            .any(|edge| matches!(edge.cause.as_ref(), Cause::Lost)));
    }

    #[test]
    fn operative_subtyping_is_not_implemented() {
        let interner = RefCell::new(StringInterner::new());
        let scope = Scope::new();
        let mut state = TypecheckerState::new(&scope, &mut interner.borrow_mut());
        let ctx = TypingContext::new();

        let left: ArcValue<'_> = Arc::new(Value::OperativeType {
            handler: Value::star(0, 0),
            userdata_type: Value::star(0, 0),
        });
        let right: ArcValue<'_> = Arc::new(Value::OperativeType {
            handler: Value::star(1, 1),
            userdata_type: Value::star(1, 1),
        });
        assert!(matches!(
            state.flow(&left, &ctx, &right, &ctx, cause()),
            Err(Error::NotImplemented(_))
        ));
    }

    #[test]
    fn effect_rows_widen() {
        use crate::core::EffectId;

        let interner = RefCell::new(StringInterner::new());
        let scope = Scope::new();
        let mut state = TypecheckerState::new(&scope, &mut interner.borrow_mut());
        let ctx = TypingContext::new();

        let narrow: ArcValue<'_> =
            Arc::new(Value::EffectRow([EffectId(1)].into_iter().collect()));
        let wide: ArcValue<'_> = Arc::new(Value::EffectRow(
            [EffectId(1), EffectId(2)].into_iter().collect(),
        ));

        let program_narrow: ArcValue<'_> = Arc::new(Value::ProgramType {
            effects: narrow.clone(),
            result: Arc::new(Value::HostNumberType),
        });
        let program_wide: ArcValue<'_> = Arc::new(Value::ProgramType {
            effects: wide.clone(),
            result: Arc::new(Value::HostNumberType),
        });
        state
            .flow(&program_narrow, &ctx, &program_wide, &ctx, cause())
            .unwrap();
        assert!(state
            .flow(&program_wide, &ctx, &program_narrow, &ctx, cause())
            .is_err());
    }
}
