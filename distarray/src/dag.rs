/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The dependency graph.
//!
//! The DAG is bipartite: [`Operation`] nodes, and [`DepNode`]s linking
//! an operation's operand to the base block it touches. Dependency
//! nodes of one block form a singly linked chain, newest first, whose
//! head is the block's root. Appending an operation walks each touched
//! chain and adds hazard edges:
//!
//! * a write waits for every pending reader and writer back to (and
//!   including) the most recent writer;
//! * a read waits for the most recent pending writer only.
//!
//! Operations on disjoint blocks get no edges and may run in any
//! order. Records are arena-indexed and live for one epoch.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::array::Rank;
use crate::comm::Tag;
use crate::decompose::ApplyBlock;
use crate::decompose::BlockKey;
use crate::decompose::Svb;
use crate::ufunc::Ufunc;
use crate::view::ViewRef;

/// Maximum number of operands of one operation.
pub const MAX_OPERANDS: usize = 32;

macro_rules! arena_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub usize);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

arena_id!(
    /// Index of an operation in the epoch.
    OpId
);
arena_id!(
    /// Index of a dependency node in the epoch.
    DepId
);
arena_id!(
    /// Index of a sub-view-block in the epoch.
    SvbId
);
arena_id!(
    /// Index of a temporary buffer in the epoch.
    TempId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
}

/// Scheduling class of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    Comm,
    Compute,
}

/// The closed set of operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Fill,
    DataFill,
    PutItem,
    GetItem,
    Apply,
    ReducePartial,
    ReduceCombine,
    Matmul,
    Send,
    Recv,
}

impl OpKind {
    pub fn class(self) -> OpClass {
        match self {
            OpKind::Send | OpKind::Recv => OpClass::Comm,
            _ => OpClass::Compute,
        }
    }

    /// Receives write private copies and never join a block's chain.
    pub fn tracks_hazards(self) -> bool {
        self != OpKind::Recv
    }
}

/// Which ranks execute an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exec {
    /// Every rank, on its local part (whole-array operations).
    All,
    Rank(Rank),
}

impl Exec {
    pub fn includes(self, rank: Rank) -> bool {
        match self {
            Exec::All => true,
            Exec::Rank(r) => r == rank,
        }
    }
}

/// What part of an operand's view an operation touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Whole,
    Svb(SvbId),
}

/// One operand of an operation.
#[derive(Debug, Clone)]
pub struct Operand {
    pub view: ViewRef,
    pub target: Target,
    pub access: Access,
}

impl Operand {
    pub fn new(view: ViewRef, target: Target, access: Access) -> Self {
        Self {
            view,
            target,
            access,
        }
    }
}

/// Source or destination of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Buffer {
    Svb(SvbId),
    Temp(TempId),
}

/// An input of an elementwise application.
#[derive(Debug, Clone)]
pub enum ApplyInput {
    /// Walk the buffer of operand `slot` as described by `block`.
    Operand { slot: usize, block: ApplyBlock },
    Scalar(f64),
}

/// Kind-specific data of an operation. Blocks are walks over the
/// buffer of an operand: the owner's local storage when the operand's
/// SVB is owned by the executing rank, its received copy otherwise.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Write `value` to the operand (slot 0).
    Fill { value: f64 },
    /// Copy the operand's local part from a global row-major buffer.
    DataFill { data: Arc<[f64]> },
    /// Write `value` to the single element of the operand (slot 0).
    PutItem { value: f64 },
    /// Pack the operand (slot 0) into a temporary.
    GetItem { into: TempId },
    /// Elementwise application; the output is slot 0.
    Apply {
        ufunc: Ufunc,
        out: ApplyBlock,
        inputs: Vec<ApplyInput>,
    },
    /// Reduce `block` of the operand along `axis` into a temporary.
    ReducePartial {
        ufunc: Ufunc,
        block: ApplyBlock,
        axis: usize,
        into: TempId,
    },
    /// Fold a partial result into the output (slot 0).
    ReduceCombine {
        ufunc: Ufunc,
        from: TempId,
        out: ApplyBlock,
        assign: bool,
    },
    /// `c (slot 0) (+)= a (slot 1) x b (slot 2)`.
    Matmul {
        a: ApplyBlock,
        b: ApplyBlock,
        c: ApplyBlock,
        accumulate: bool,
    },
    Send { buf: Buffer, peer: Rank, tag: Tag },
    Recv {
        buf: Buffer,
        peer: Rank,
        tag: Tag,
        nelem: usize,
    },
}

impl Payload {
    fn rebase(&mut self, svb_base: usize, temp_base: usize) {
        let temp = |t: &mut TempId| t.0 += temp_base;
        let buf = |b: &mut Buffer| match b {
            Buffer::Svb(s) => s.0 += svb_base,
            Buffer::Temp(t) => t.0 += temp_base,
        };
        match self {
            Payload::GetItem { into } | Payload::ReducePartial { into, .. } => temp(into),
            Payload::ReduceCombine { from, .. } => temp(from),
            Payload::Send { buf: b, .. } | Payload::Recv { buf: b, .. } => buf(b),
            _ => {}
        }
    }
}

/// An operation node.
#[derive(Debug)]
pub struct Operation {
    pub(crate) kind: OpKind,
    pub(crate) exec: Exec,
    pub(crate) operands: Vec<Operand>,
    pub(crate) payload: Payload,
    /// Outstanding dependency nodes pointing at this operation.
    pub(crate) refcount: usize,
    /// Unresolved predecessors.
    pub(crate) npending: usize,
    pub(crate) dependents: Vec<OpId>,
    pub(crate) deps: Vec<DepId>,
    pub(crate) done: bool,
}

impl Operation {
    pub fn new(kind: OpKind, exec: Exec, operands: Vec<Operand>, payload: Payload) -> Self {
        debug_assert!(operands.len() <= MAX_OPERANDS);
        Self {
            kind,
            exec,
            operands,
            payload,
            refcount: 0,
            npending: 0,
            dependents: Vec::new(),
            deps: Vec::new(),
            done: false,
        }
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn class(&self) -> OpClass {
        self.kind.class()
    }

    pub fn exec(&self) -> Exec {
        self.exec
    }

    pub fn operands(&self) -> &[Operand] {
        &self.operands
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn refcount(&self) -> usize {
        self.refcount
    }

    pub fn npending(&self) -> usize {
        self.npending
    }

    pub fn dependents(&self) -> &[OpId] {
        &self.dependents
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Transport tag of a communication operation.
    pub fn tag(&self) -> Option<Tag> {
        match self.payload {
            Payload::Send { tag, .. } | Payload::Recv { tag, .. } => Some(tag),
            _ => None,
        }
    }

    /// Remote peer of a communication operation.
    pub fn peer(&self) -> Option<Rank> {
        match self.payload {
            Payload::Send { peer, .. } | Payload::Recv { peer, .. } => Some(peer),
            _ => None,
        }
    }

    pub(crate) fn set_tag(&mut self, new_tag: Tag) {
        if let Payload::Send { tag, .. } | Payload::Recv { tag, .. } = &mut self.payload {
            *tag = new_tag;
        }
    }

    pub(crate) fn rebase(&mut self, svb_base: usize, temp_base: usize) {
        for operand in &mut self.operands {
            if let Target::Svb(id) = &mut operand.target {
                id.0 += svb_base;
            }
        }
        self.payload.rebase(svb_base, temp_base);
    }

    /// Number of dependency nodes this operation creates when pushed.
    pub(crate) fn dep_nodes(&self) -> usize {
        if !self.kind.tracks_hazards() {
            return 0;
        }
        self.operands
            .iter()
            .map(|operand| match operand.target {
                Target::Whole => operand.view.base().nblocks(),
                Target::Svb(_) => 1,
            })
            .sum()
    }
}

/// Links operand `slot` of `op` into the chain of block `key`.
#[derive(Debug, Clone)]
pub struct DepNode {
    pub op: OpId,
    pub slot: usize,
    pub key: BlockKey,
    pub next: Option<DepId>,
}

/// The dependency graph of one epoch.
#[derive(Debug, Default)]
pub struct Dag {
    ops: Vec<Operation>,
    deps: Vec<DepNode>,
    roots: HashMap<BlockKey, DepId>,
    pending: usize,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of operations appended this epoch.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether no operation is pending.
    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }

    /// Number of operations not yet completed.
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn ndeps(&self) -> usize {
        self.deps.len()
    }

    pub fn op(&self, id: OpId) -> &Operation {
        &self.ops[id.0]
    }

    pub fn ops(&self) -> impl Iterator<Item = (OpId, &Operation)> {
        self.ops.iter().enumerate().map(|(i, op)| (OpId(i), op))
    }

    /// Append `op`, adding hazard edges against the pending accesses of
    /// every block it touches. `svbs` resolves the operation's SVB
    /// targets.
    pub fn push(&mut self, op: Operation, svbs: &[Svb]) -> OpId {
        let id = OpId(self.ops.len());
        let tracks = op.kind.tracks_hazards();
        let accesses: Vec<(usize, BlockKey, Access)> = if tracks {
            op.operands
                .iter()
                .enumerate()
                .flat_map(|(slot, operand)| {
                    let keys: Vec<BlockKey> = match operand.target {
                        Target::Svb(svb) => vec![svbs[svb.0].root],
                        Target::Whole => {
                            let base = operand.view.base();
                            (0..base.nblocks())
                                .map(|block| BlockKey {
                                    array: base.id(),
                                    block,
                                })
                                .collect()
                        }
                    };
                    keys.into_iter().map(move |key| (slot, key, operand.access))
                })
                .collect()
        } else {
            Vec::new()
        };
        self.ops.push(op);
        self.pending += 1;

        for (slot, key, access) in accesses {
            let mut cursor = self.roots.get(&key).copied();
            while let Some(dep) = cursor {
                let node = &self.deps[dep.0];
                let prior = node.op;
                let prior_access = self.ops[prior.0].operands[node.slot].access;
                let next = node.next;
                if prior != id && (access == Access::Write || prior_access == Access::Write) {
                    self.add_edge(prior, id);
                }
                if prior_access == Access::Write {
                    break;
                }
                cursor = next;
            }
            let dep = DepId(self.deps.len());
            self.deps.push(DepNode {
                op: id,
                slot,
                key,
                next: self.roots.get(&key).copied(),
            });
            self.roots.insert(key, dep);
            let op = &mut self.ops[id.0];
            op.deps.push(dep);
            op.refcount += 1;
        }
        id
    }

    /// Make `to` wait for `from`.
    pub fn add_edge(&mut self, from: OpId, to: OpId) {
        if from == to || self.ops[from.0].done || self.ops[from.0].dependents.contains(&to) {
            return;
        }
        self.ops[from.0].dependents.push(to);
        self.ops[to.0].npending += 1;
    }

    /// Operations in the chain of `key`, most recent first.
    pub fn chain(&self, key: BlockKey) -> Vec<OpId> {
        let mut chain = Vec::new();
        let mut cursor = self.roots.get(&key).copied();
        while let Some(dep) = cursor {
            chain.push(self.deps[dep.0].op);
            cursor = self.deps[dep.0].next;
        }
        chain
    }

    /// Pending operations with no unresolved predecessor, in id order.
    pub fn ready(&self) -> Vec<OpId> {
        self.ops()
            .filter(|(_, op)| !op.done && op.npending == 0)
            .map(|(id, _)| id)
            .collect()
    }

    /// Mark `id` complete: unlink its dependency nodes, release its
    /// operands once nothing refers to it, and return the dependents
    /// that became ready.
    pub fn complete(&mut self, id: OpId) -> Vec<OpId> {
        let op = &mut self.ops[id.0];
        debug_assert!(!op.done, "{} completed twice", id);
        op.done = true;
        self.pending -= 1;
        let deps = std::mem::take(&mut op.deps);
        let dependents = std::mem::take(&mut op.dependents);

        for dep in deps {
            self.unlink(dep);
            self.ops[id.0].refcount -= 1;
        }
        if self.ops[id.0].refcount == 0 {
            self.ops[id.0].operands.clear();
        }

        let mut ready = Vec::new();
        for next in dependents {
            let op = &mut self.ops[next.0];
            op.npending -= 1;
            if op.npending == 0 && !op.done {
                ready.push(next);
            }
        }
        ready
    }

    fn unlink(&mut self, dep: DepId) {
        let DepNode { key, next, .. } = self.deps[dep.0].clone();
        if self.roots.get(&key) == Some(&dep) {
            match next {
                Some(next) => {
                    self.roots.insert(key, next);
                }
                None => {
                    self.roots.remove(&key);
                }
            }
            return;
        }
        let mut cursor = self.roots.get(&key).copied();
        while let Some(current) = cursor {
            if self.deps[current.0].next == Some(dep) {
                self.deps[current.0].next = next;
                return;
            }
            cursor = self.deps[current.0].next;
        }
    }

    /// Drop every record. Only valid once all operations completed.
    pub fn clear(&mut self) {
        self.ops.clear();
        self.deps.clear();
        self.roots.clear();
        self.pending = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Array;
    use crate::array::ArrayId;
    use crate::array::DType;
    use crate::array::DistributedArray;
    use crate::array::Partition;
    use crate::decompose::decompose;
    use crate::view::View;

    fn setup() -> (Array, ViewRef, Vec<Svb>) {
        let p = Partition::new(vec![8], vec![2], vec![4]);
        let a = Arc::new(DistributedArray::new(ArrayId(1), DType::Float64, p, 0));
        let v = Arc::new(View::whole(&a));
        let svbs = decompose(&v);
        (a, v, svbs)
    }

    fn fill(v: &ViewRef, svb: usize, access: Access) -> Operation {
        Operation::new(
            OpKind::Fill,
            Exec::Rank(svb),
            vec![Operand::new(v.clone(), Target::Svb(SvbId(svb)), access)],
            Payload::Fill { value: 0.0 },
        )
    }

    #[test]
    fn test_read_after_write() {
        let (_a, v, svbs) = setup();
        let mut dag = Dag::new();
        let w = dag.push(fill(&v, 1, Access::Write), &svbs);
        let r1 = dag.push(fill(&v, 1, Access::Read), &svbs);
        let r2 = dag.push(fill(&v, 1, Access::Read), &svbs);
        let other = dag.push(fill(&v, 2, Access::Write), &svbs);

        assert_eq!(dag.op(w).dependents(), &[r1, r2]);
        assert_eq!(dag.op(r1).npending(), 1);
        assert_eq!(dag.op(r2).npending(), 1);
        // Disjoint blocks get no edges.
        assert_eq!(dag.op(other).npending(), 0);
        assert_eq!(dag.ready(), vec![w, other]);
        assert_eq!(dag.chain(svbs[1].root), vec![r2, r1, w]);
    }

    #[test]
    fn test_write_after_read() {
        let (_a, v, svbs) = setup();
        let mut dag = Dag::new();
        let w1 = dag.push(fill(&v, 0, Access::Write), &svbs);
        let r1 = dag.push(fill(&v, 0, Access::Read), &svbs);
        let r2 = dag.push(fill(&v, 0, Access::Read), &svbs);
        let w2 = dag.push(fill(&v, 0, Access::Write), &svbs);
        let w3 = dag.push(fill(&v, 0, Access::Write), &svbs);

        // w2 waits for both readers and the previous writer.
        assert_eq!(dag.op(w2).npending(), 3);
        // w3 waits for w2 only; the chain walk stops at the last writer.
        assert_eq!(dag.op(w3).npending(), 1);
        assert!(dag.op(w2).dependents().contains(&w3));

        let ready = dag.complete(w1);
        assert_eq!(ready, vec![r1, r2]);
        assert!(dag.complete(r1).is_empty());
        assert_eq!(dag.complete(r2), vec![w2]);
        assert_eq!(dag.complete(w2), vec![w3]);
        assert_eq!(dag.complete(w3), vec![]);
        assert!(dag.is_empty());
        assert!(dag.chain(svbs[0].root).is_empty());
    }

    #[test]
    fn test_whole_array_operand() {
        let (a, v, svbs) = setup();
        let mut dag = Dag::new();
        let r = dag.push(fill(&v, 3, Access::Read), &svbs);
        let whole = dag.push(
            Operation::new(
                OpKind::Fill,
                Exec::All,
                vec![Operand::new(v.clone(), Target::Whole, Access::Write)],
                Payload::Fill { value: 1.0 },
            ),
            &svbs,
        );
        assert_eq!(dag.op(whole).refcount(), a.nblocks());
        assert_eq!(dag.op(whole).npending(), 1);
        let after = dag.push(fill(&v, 0, Access::Read), &svbs);
        assert_eq!(dag.op(after).npending(), 1);
        assert!(dag.op(whole).dependents().contains(&after));
        let _ = r;
    }

    #[test]
    fn test_refcount_releases_views() {
        let (a, v, svbs) = setup();
        let mut dag = Dag::new();
        let w = dag.push(fill(&v, 0, Access::Write), &svbs);
        let r = dag.push(fill(&v, 0, Access::Read), &svbs);
        drop(v);
        let before = DistributedArray::refcount(&a);
        assert_eq!(dag.op(w).refcount(), 1);
        dag.complete(w);
        // The view is still held by `r`.
        assert_eq!(DistributedArray::refcount(&a), before);
        dag.complete(r);
        assert_eq!(DistributedArray::refcount(&a), 1);
        assert!(dag.op(r).operands().is_empty());
    }

    #[test]
    fn test_out_of_order_unlink() {
        let (_a, v, svbs) = setup();
        let mut dag = Dag::new();
        let r1 = dag.push(fill(&v, 0, Access::Read), &svbs);
        let r2 = dag.push(fill(&v, 0, Access::Read), &svbs);
        let r3 = dag.push(fill(&v, 0, Access::Read), &svbs);
        dag.complete(r2);
        assert_eq!(dag.chain(svbs[0].root), vec![r3, r1]);
        dag.complete(r3);
        assert_eq!(dag.chain(svbs[0].root), vec![r1]);
        // A new writer only waits for the pending reader.
        let w = dag.push(fill(&v, 0, Access::Write), &svbs);
        assert_eq!(dag.op(w).npending(), 1);
        assert_eq!(dag.op(r1).dependents(), &[w]);
    }

    #[test]
    fn test_recv_not_tracked() {
        let (_a, v, svbs) = setup();
        let mut dag = Dag::new();
        let w = dag.push(fill(&v, 0, Access::Write), &svbs);
        let recv = dag.push(
            Operation::new(
                OpKind::Recv,
                Exec::Rank(1),
                vec![Operand::new(v.clone(), Target::Svb(SvbId(0)), Access::Write)],
                Payload::Recv {
                    buf: Buffer::Svb(SvbId(0)),
                    peer: 0,
                    tag: 0,
                    nelem: 2,
                },
            ),
            &svbs,
        );
        assert_eq!(dag.op(recv).npending(), 0);
        assert_eq!(dag.op(recv).refcount(), 0);
        assert_eq!(dag.chain(svbs[0].root), vec![w]);
        assert_eq!(dag.op(recv).class(), OpClass::Comm);
        assert_eq!(dag.op(recv).peer(), Some(0));
    }
}
