/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Lowering of submitted operations into DAG fragments.
//!
//! Every submission is turned into one or more [`Plan`]s before it
//! touches the epoch: the SVBs it references, the temporaries it needs,
//! its operations, the explicit edges between them, and its transfers.
//! The engine checks that a plan fits the epoch, flushing first if it
//! does not, then commits it. Large submissions are split into several
//! plans at cell boundaries so each can be committed on its own.
//!
//! Compute operations always run on the rank owning their output. Input
//! SVBs owned elsewhere are fetched with a send/receive pair, at most
//! once per (SVB, destination) within a plan.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use crate::array::Array;
use crate::array::Rank;
use crate::decompose::ApplyBlock;
use crate::decompose::Decomposition;
use crate::decompose::Svb;
use crate::decompose::indices;
use crate::dag::Access;
use crate::dag::ApplyInput;
use crate::dag::Buffer;
use crate::dag::Exec;
use crate::dag::MAX_OPERANDS;
use crate::dag::OpKind;
use crate::dag::Operand;
use crate::dag::Operation;
use crate::dag::Payload;
use crate::dag::SvbId;
use crate::dag::Target;
use crate::dag::TempId;
use crate::error::Error;
use crate::error::FatalError;
use crate::error::Result;
use crate::ufunc::Ufunc;
use crate::view::View;
use crate::view::ViewRef;

/// An argument of an elementwise application.
#[derive(Debug, Clone)]
pub enum Arg {
    View(ViewRef),
    Scalar(f64),
}

impl From<ViewRef> for Arg {
    fn from(view: ViewRef) -> Self {
        Arg::View(view)
    }
}

impl From<f64> for Arg {
    fn from(value: f64) -> Self {
        Arg::Scalar(value)
    }
}

/// A send/receive pair. Its tag is derived from its position in the
/// epoch and the consumer's operand `slot`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Transfer {
    pub(crate) send: usize,
    pub(crate) recv: usize,
    pub(crate) slot: usize,
}

/// A DAG fragment ready to be committed. Ids inside a plan are local
/// and rebased on commit.
#[derive(Debug, Default)]
pub struct Plan {
    pub(crate) svbs: Vec<Svb>,
    pub(crate) ntemps: usize,
    pub(crate) ops: Vec<Operation>,
    pub(crate) edges: Vec<(usize, usize)>,
    pub(crate) transfers: Vec<Transfer>,
    /// Temporaries holding materialized results, with the SVB each one
    /// packs.
    pub(crate) outputs: Vec<(TempId, SvbId)>,
}

impl Plan {
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ntransfers(&self) -> usize {
        self.transfers.len()
    }

    pub fn nsvbs(&self) -> usize {
        self.svbs.len()
    }

    pub fn ntemps(&self) -> usize {
        self.ntemps
    }

    /// Dependency nodes the plan creates on commit.
    pub fn dep_nodes(&self) -> usize {
        self.ops.iter().map(Operation::dep_nodes).sum()
    }

    fn op(&mut self, op: Operation) -> usize {
        self.ops.push(op);
        self.ops.len() - 1
    }

    fn temp(&mut self) -> TempId {
        self.ntemps += 1;
        TempId(self.ntemps - 1)
    }

    fn transfer(
        &mut self,
        buf: Buffer,
        view: Option<&ViewRef>,
        from: Rank,
        to: Rank,
        nelem: usize,
        slot: usize,
    ) -> (usize, usize) {
        let operand = |access| match (buf, view) {
            (Buffer::Svb(id), Some(view)) => {
                vec![Operand::new(view.clone(), Target::Svb(id), access)]
            }
            _ => Vec::new(),
        };
        let send = self.op(Operation::new(
            OpKind::Send,
            Exec::Rank(from),
            operand(Access::Read),
            Payload::Send {
                buf,
                peer: to,
                tag: 0,
            },
        ));
        let recv = self.op(Operation::new(
            OpKind::Recv,
            Exec::Rank(to),
            operand(Access::Write),
            Payload::Recv {
                buf,
                peer: from,
                tag: 0,
                nelem,
            },
        ));
        self.edges.push((send, recv));
        self.transfers.push(Transfer { send, recv, slot });
        (send, recv)
    }
}

/// Accumulates plans, sealing the current one once it holds `chunk`
/// operations.
struct Planner {
    plans: Vec<Plan>,
    current: Plan,
    chunk: usize,
    svbs: HashMap<(*const View, usize), SvbId>,
    fetched: HashMap<(SvbId, Rank), usize>,
}

impl Planner {
    fn new(chunk: usize) -> Self {
        Self {
            plans: Vec::new(),
            current: Plan::default(),
            chunk: chunk.max(1),
            svbs: HashMap::new(),
            fetched: HashMap::new(),
        }
    }

    /// The plan-local id of SVB `ordinal` of `view`.
    fn svb(&mut self, view: &ViewRef, dec: &Decomposition, ordinal: usize) -> SvbId {
        let plan = &mut self.current;
        let key = (Arc::as_ptr(view), ordinal);
        *self.svbs.entry(key).or_insert_with(|| {
            plan.svbs.push(dec.svbs()[ordinal].clone());
            SvbId(plan.svbs.len() - 1)
        })
    }

    /// Fetch `svb` to rank `to` unless already fetched; returns the
    /// receive.
    fn fetch(&mut self, id: SvbId, view: &ViewRef, to: Rank, slot: usize) -> usize {
        if let Some(recv) = self.fetched.get(&(id, to)) {
            return *recv;
        }
        let svb = &self.current.svbs[id.0];
        let (from, nelem) = (svb.rank, svb.nelem);
        let (_, recv) = self
            .current
            .transfer(Buffer::Svb(id), Some(view), from, to, nelem, slot);
        self.fetched.insert((id, to), recv);
        recv
    }

    fn op(&mut self, op: Operation) -> usize {
        self.current.op(op)
    }

    fn edge(&mut self, from: usize, to: usize) {
        self.current.edges.push((from, to));
    }

    fn temp(&mut self) -> TempId {
        self.current.temp()
    }

    /// End of an indivisible unit of work.
    fn end_unit(&mut self) {
        if self.current.ops.len() >= self.chunk {
            self.seal();
        }
    }

    fn seal(&mut self) {
        let plan = std::mem::take(&mut self.current);
        if !plan.is_empty() {
            self.plans.push(plan);
        }
        self.svbs.clear();
        self.fetched.clear();
    }

    fn finish(mut self) -> Vec<Plan> {
        self.seal();
        self.plans
    }
}

/// Per-dimension cells from sorted cut points over `[0, extent)`.
fn cells(cuts: &BTreeSet<usize>, extent: usize) -> Vec<(usize, usize)> {
    let points: Vec<usize> = cuts.iter().copied().filter(|c| *c < extent).collect();
    points
        .iter()
        .enumerate()
        .map(|(i, start)| {
            let end = points.get(i + 1).copied().unwrap_or(extent);
            (*start, end - start)
        })
        .collect()
}

fn cut_set(dec: &Decomposition, dim: usize) -> BTreeSet<usize> {
    let mut cuts: BTreeSet<usize> = dec.cuts(dim).collect();
    cuts.insert(0);
    cuts
}

/// Cartesian product of per-dimension cells as (start, len) vectors.
fn cell_grid(per_dim: &[Vec<(usize, usize)>]) -> Vec<(Vec<usize>, Vec<usize>)> {
    let counts: Vec<usize> = per_dim.iter().map(Vec::len).collect();
    indices(&counts)
        .map(|index| {
            index
                .iter()
                .enumerate()
                .map(|(d, i)| per_dim[d][*i])
                .unzip()
        })
        .collect()
}

/// The block walking the part of `svb` starting at view coordinate
/// `point` over `dims`, in the owner's storage or a packed copy.
/// The SVB of `dec` holding `point`. Cells are cut from the
/// decompositions themselves, so a miss is an internal inconsistency.
fn locate(dec: &Decomposition, what: &str, point: &[usize]) -> Result<usize> {
    dec.locate(point).ok_or_else(|| {
        Error::Fatal(FatalError::Logic(format!(
            "no {} sub-view-block holds cell {:?}",
            what, point
        )))
    })
}

fn block_of(svb: &Svb, point: &[usize], dims: &[usize], local: bool) -> ApplyBlock {
    ApplyBlock {
        dims: dims.to_vec(),
        strides: svb.view_strides(local).to_vec(),
        offset: svb.offset_of(point, local),
    }
}

/// Fill `view` with `value`. Whole-array fills run on every rank.
pub fn fill(view: &ViewRef, value: f64, chunk: usize) -> Vec<Plan> {
    fill_with(view, OpKind::Fill, Payload::Fill { value }, chunk)
}

/// Write `value` to the single element of `view`.
pub fn put_item(view: &ViewRef, value: f64) -> Vec<Plan> {
    fill_with(view, OpKind::PutItem, Payload::PutItem { value }, usize::MAX)
}

fn fill_with(view: &ViewRef, kind: OpKind, payload: Payload, chunk: usize) -> Vec<Plan> {
    let mut planner = Planner::new(chunk);
    if view.is_whole() && kind == OpKind::Fill {
        planner.op(Operation::new(
            kind,
            Exec::All,
            vec![Operand::new(view.clone(), Target::Whole, Access::Write)],
            payload,
        ));
        return planner.finish();
    }
    let dec = Decomposition::new(view);
    for (ordinal, svb) in dec.svbs().iter().enumerate() {
        let rank = svb.rank;
        let id = planner.svb(view, &dec, ordinal);
        planner.op(Operation::new(
            kind,
            Exec::Rank(rank),
            vec![Operand::new(view.clone(), Target::Svb(id), Access::Write)],
            payload.clone(),
        ));
        planner.end_unit();
    }
    planner.finish()
}

/// Fill the whole of `array` from a global row-major buffer.
pub fn data_fill(array: &Array, view: &ViewRef, data: Arc<[f64]>) -> Result<Vec<Plan>> {
    if data.len() != array.size() {
        return Err(Error::Shape(format!(
            "buffer of {} elements for an array of {}",
            data.len(),
            array.size()
        )));
    }
    let mut planner = Planner::new(usize::MAX);
    planner.op(Operation::new(
        OpKind::DataFill,
        Exec::All,
        vec![Operand::new(view.clone(), Target::Whole, Access::Write)],
        Payload::DataFill { data },
    ));
    Ok(planner.finish())
}

/// Materialize every SVB of `view` on every rank: the owner packs it
/// into a temporary, then sends it to each other rank. The plan's
/// outputs name the temporaries.
pub fn gather(view: &ViewRef, nranks: usize, chunk: usize) -> Vec<Plan> {
    let mut planner = Planner::new(chunk);
    let dec = Decomposition::new(view);
    for (ordinal, svb) in dec.svbs().iter().enumerate() {
        let owner = svb.rank;
        let nelem = svb.nelem;
        let id = planner.svb(view, &dec, ordinal);
        let into = planner.temp();
        let pack = planner.op(Operation::new(
            OpKind::GetItem,
            Exec::Rank(owner),
            vec![Operand::new(view.clone(), Target::Svb(id), Access::Read)],
            Payload::GetItem { into },
        ));
        for peer in (0..nranks).filter(|r| *r != owner) {
            let (send, _) =
                planner
                    .current
                    .transfer(Buffer::Temp(into), None, owner, peer, nelem, 0);
            planner.edge(pack, send);
        }
        planner.current.outputs.push((into, id));
        planner.end_unit();
    }
    planner.finish()
}

enum Input<'a> {
    Scalar(f64),
    /// A view, its decomposition, and the number of leading output
    /// dimensions it is broadcast over.
    View(&'a ViewRef, Decomposition, usize),
}

fn check_broadcast(arg: &ViewRef, out: &ViewRef) -> Result<usize> {
    let (m, n) = (arg.ndims(), out.ndims());
    if m > n {
        return Err(Error::Shape(format!(
            "cannot broadcast shape {:?} to {:?}",
            arg.shape(),
            out.shape()
        )));
    }
    let lead = n - m;
    for (k, extent) in arg.shape().iter().enumerate() {
        if *extent != out.shape()[lead + k] && *extent != 1 {
            return Err(Error::Shape(format!(
                "cannot broadcast shape {:?} to {:?}",
                arg.shape(),
                out.shape()
            )));
        }
    }
    Ok(lead)
}

/// Elementwise `out = ufunc(args...)` with broadcasting of inputs.
pub fn apply(ufunc: &Ufunc, args: &[Arg], out: &ViewRef, chunk: usize) -> Result<Vec<Plan>> {
    if args.len() != ufunc.nin() {
        return Err(Error::Argument(format!(
            "{} takes {} inputs, got {}",
            ufunc.name(),
            ufunc.nin(),
            args.len()
        )));
    }
    if args.len() + 1 > MAX_OPERANDS {
        return Err(Error::Argument(format!(
            "{} operands exceed the limit of {}",
            args.len() + 1,
            MAX_OPERANDS
        )));
    }
    let n = out.ndims();
    let out_dec = Decomposition::new(out);
    let mut per_dim: Vec<BTreeSet<usize>> = (0..n).map(|d| cut_set(&out_dec, d)).collect();

    let mut inputs = Vec::with_capacity(args.len());
    for arg in args {
        match arg {
            Arg::Scalar(value) => inputs.push(Input::Scalar(*value)),
            Arg::View(view) => {
                let lead = check_broadcast(view, out)?;
                let dec = Decomposition::new(view);
                for (k, extent) in view.shape().iter().enumerate() {
                    if *extent == out.shape()[lead + k] {
                        per_dim[lead + k].extend(dec.cuts(k));
                    }
                }
                inputs.push(Input::View(view, dec, lead));
            }
        }
    }
    let per_dim: Vec<Vec<(usize, usize)>> = per_dim
        .iter()
        .enumerate()
        .map(|(d, cuts)| cells(cuts, out.shape()[d]))
        .collect();

    let mut planner = Planner::new(chunk);
    for (start, len) in cell_grid(&per_dim) {
        let o = locate(&out_dec, "output", &start)?;
        let out_svb = &out_dec.svbs()[o];
        let rank = out_svb.rank;
        let out_block = block_of(out_svb, &start, &len, true);
        let out_id = planner.svb(out, &out_dec, o);

        let mut operands = vec![Operand::new(out.clone(), Target::Svb(out_id), Access::Write)];
        let mut apply_inputs = Vec::with_capacity(inputs.len());
        let mut recvs = Vec::new();
        for input in &inputs {
            let (view, dec, lead) = match input {
                Input::Scalar(value) => {
                    apply_inputs.push(ApplyInput::Scalar(*value));
                    continue;
                }
                Input::View(view, dec, lead) => (*view, dec, *lead),
            };
            let point: Vec<usize> = view
                .shape()
                .iter()
                .enumerate()
                .map(|(k, extent)| if *extent == 1 { 0 } else { start[lead + k] })
                .collect();
            let ordinal = locate(dec, "input", &point)?;
            let svb = &dec.svbs()[ordinal];
            let local = svb.rank == rank;
            let vstrides = svb.view_strides(local);
            let strides = (0..n)
                .map(|d| {
                    if d < lead {
                        return 0;
                    }
                    let k = d - lead;
                    if view.shape()[k] == 1 { 0 } else { vstrides[k] }
                })
                .collect();
            let block = ApplyBlock {
                dims: len.clone(),
                strides,
                offset: svb.offset_of(&point, local),
            };
            let id = planner.svb(view, dec, ordinal);
            let slot = operands.len();
            operands.push(Operand::new(view.clone(), Target::Svb(id), Access::Read));
            if !local {
                recvs.push(planner.fetch(id, view, rank, slot));
            }
            apply_inputs.push(ApplyInput::Operand { slot, block });
        }

        let compute = planner.op(Operation::new(
            OpKind::Apply,
            Exec::Rank(rank),
            operands,
            Payload::Apply {
                ufunc: ufunc.clone(),
                out: out_block,
                inputs: apply_inputs,
            },
        ));
        for recv in recvs {
            planner.edge(recv, compute);
        }
        planner.end_unit();
    }
    Ok(planner.finish())
}

/// Reduce `input` along `axis` into `out`, whose shape is the input's
/// without that axis.
pub fn reduce(
    ufunc: &Ufunc,
    input: &ViewRef,
    axis: usize,
    out: &ViewRef,
    chunk: usize,
) -> Result<Vec<Plan>> {
    if ufunc.nin() != 2 {
        return Err(Error::Argument(format!(
            "cannot reduce with {}, which takes {} inputs",
            ufunc.name(),
            ufunc.nin()
        )));
    }
    let m = input.ndims();
    if axis >= m {
        return Err(Error::Argument(format!(
            "axis {} out of range for {} dimensions",
            axis, m
        )));
    }
    let mut expected = input.shape().to_vec();
    expected.remove(axis);
    if out.shape() != expected.as_slice() {
        return Err(Error::Shape(format!(
            "reduction output has shape {:?}, expected {:?}",
            out.shape(),
            expected
        )));
    }
    let in_dec = Decomposition::new(input);
    let out_dec = Decomposition::new(out);
    let per_dim: Vec<Vec<(usize, usize)>> = (0..m)
        .map(|d| {
            let mut cuts = cut_set(&in_dec, d);
            if d != axis {
                let od = if d < axis { d } else { d - 1 };
                cuts.extend(out_dec.cuts(od));
            }
            cells(&cuts, input.shape()[d])
        })
        .collect();

    let mut planner = Planner::new(chunk);
    for (start, len) in cell_grid(&per_dim) {
        let mut ostart = start.clone();
        ostart.remove(axis);
        let mut olen = len.clone();
        olen.remove(axis);
        let i = locate(&in_dec, "input", &start)?;
        let o = locate(&out_dec, "output", &ostart)?;

        let in_svb = &in_dec.svbs()[i];
        let out_svb = &out_dec.svbs()[o];
        let (source, dest) = (in_svb.rank, out_svb.rank);
        let block = block_of(in_svb, &start, &len, true);
        let out_block = block_of(out_svb, &ostart, &olen, true);
        let in_id = planner.svb(input, &in_dec, i);
        let out_id = planner.svb(out, &out_dec, o);
        let into = planner.temp();

        let partial = planner.op(Operation::new(
            OpKind::ReducePartial,
            Exec::Rank(source),
            vec![Operand::new(input.clone(), Target::Svb(in_id), Access::Read)],
            Payload::ReducePartial {
                ufunc: ufunc.clone(),
                block,
                axis,
                into,
            },
        ));
        let ready = if source != dest {
            let (send, recv) = planner.current.transfer(
                Buffer::Temp(into),
                None,
                source,
                dest,
                olen.iter().product(),
                0,
            );
            planner.edge(partial, send);
            recv
        } else {
            partial
        };
        let combine = planner.op(Operation::new(
            OpKind::ReduceCombine,
            Exec::Rank(dest),
            vec![Operand::new(out.clone(), Target::Svb(out_id), Access::Write)],
            Payload::ReduceCombine {
                ufunc: ufunc.clone(),
                from: into,
                out: out_block,
                assign: start[axis] == 0,
            },
        ));
        planner.edge(ready, combine);
        planner.end_unit();
    }
    Ok(planner.finish())
}

/// `c = a x b` for two-dimensional views.
pub fn matmul(a: &ViewRef, b: &ViewRef, c: &ViewRef, chunk: usize) -> Result<Vec<Plan>> {
    if a.ndims() != 2 || b.ndims() != 2 || c.ndims() != 2 {
        return Err(Error::Shape(format!(
            "matmul needs two-dimensional operands, got {:?} x {:?} -> {:?}",
            a.shape(),
            b.shape(),
            c.shape()
        )));
    }
    let (n, k, m) = (a.shape()[0], a.shape()[1], b.shape()[1]);
    if b.shape()[0] != k || c.shape() != [n, m] {
        return Err(Error::Shape(format!(
            "matmul shapes do not agree: {:?} x {:?} -> {:?}",
            a.shape(),
            b.shape(),
            c.shape()
        )));
    }
    let (a_dec, b_dec, c_dec) = (
        Decomposition::new(a),
        Decomposition::new(b),
        Decomposition::new(c),
    );
    let union = |x: BTreeSet<usize>, y: BTreeSet<usize>, extent: usize| {
        cells(&x.union(&y).copied().collect(), extent)
    };
    let rows = union(cut_set(&c_dec, 0), cut_set(&a_dec, 0), n);
    let cols = union(cut_set(&c_dec, 1), cut_set(&b_dec, 1), m);
    let inner = union(cut_set(&a_dec, 1), cut_set(&b_dec, 0), k);

    let mut planner = Planner::new(chunk);
    for (i0, li) in &rows {
        for (j0, lj) in &cols {
            for (p0, lp) in &inner {
                let co = locate(&c_dec, "output", &[*i0, *j0])?;
                let ao = locate(&a_dec, "left", &[*i0, *p0])?;
                let bo = locate(&b_dec, "right", &[*p0, *j0])?;
                let (c_svb, a_svb, b_svb) = (&c_dec.svbs()[co], &a_dec.svbs()[ao], &b_dec.svbs()[bo]);
                let rank = c_svb.rank;
                let (a_local, b_local) = (a_svb.rank == rank, b_svb.rank == rank);
                let c_block = block_of(c_svb, &[*i0, *j0], &[*li, *lj], true);
                let a_block = block_of(a_svb, &[*i0, *p0], &[*li, *lp], a_local);
                let b_block = block_of(b_svb, &[*p0, *j0], &[*lp, *lj], b_local);
                let c_id = planner.svb(c, &c_dec, co);
                let a_id = planner.svb(a, &a_dec, ao);
                let b_id = planner.svb(b, &b_dec, bo);
                let mut recvs = Vec::new();
                if !a_local {
                    recvs.push(planner.fetch(a_id, a, rank, 1));
                }
                if !b_local {
                    recvs.push(planner.fetch(b_id, b, rank, 2));
                }
                let compute = planner.op(Operation::new(
                    OpKind::Matmul,
                    Exec::Rank(rank),
                    vec![
                        Operand::new(c.clone(), Target::Svb(c_id), Access::Write),
                        Operand::new(a.clone(), Target::Svb(a_id), Access::Read),
                        Operand::new(b.clone(), Target::Svb(b_id), Access::Read),
                    ],
                    Payload::Matmul {
                        a: a_block,
                        b: b_block,
                        c: c_block,
                        accumulate: *p0 != 0,
                    },
                ));
                for recv in recvs {
                    planner.edge(recv, compute);
                }
                planner.end_unit();
            }
        }
    }
    Ok(planner.finish())
}

/// Copy diagonal `offset` of the two-dimensional `src` into the
/// one-dimensional `out`.
pub fn diagonal(src: &ViewRef, offset: isize, out: &ViewRef, chunk: usize) -> Result<Vec<Plan>> {
    let (len, r0, c0) = diagonal_extent(src.shape(), offset)?;
    if out.shape() != [len] {
        return Err(Error::Shape(format!(
            "diagonal of length {} into shape {:?}",
            len,
            out.shape()
        )));
    }
    let src_dec = Decomposition::new(src);
    let out_dec = Decomposition::new(out);
    let mut cuts = cut_set(&out_dec, 0);
    for (dim, origin) in [(0, r0), (1, c0)] {
        cuts.extend(
            src_dec
                .cuts(dim)
                .filter(|c| *c >= origin)
                .map(|c| c - origin),
        );
    }
    let copy = Ufunc::identity_copy();
    let mut planner = Planner::new(chunk);
    for (t0, l) in cells(&cuts, len) {
        let point = [r0 + t0, c0 + t0];
        let o = locate(&out_dec, "output", &[t0])?;
        let s = locate(&src_dec, "input", &point)?;
        let out_svb = &out_dec.svbs()[o];
        let src_svb = &src_dec.svbs()[s];
        let rank = out_svb.rank;
        let local = src_svb.rank == rank;
        let vstrides = src_svb.view_strides(local);
        let block = ApplyBlock {
            dims: vec![l],
            strides: vec![vstrides[0] + vstrides[1]],
            offset: src_svb.offset_of(&point, local),
        };
        let out_block = block_of(out_svb, &[t0], &[l], true);
        let out_id = planner.svb(out, &out_dec, o);
        let src_id = planner.svb(src, &src_dec, s);
        let recv = (!local).then(|| planner.fetch(src_id, src, rank, 1));
        let compute = planner.op(Operation::new(
            OpKind::Apply,
            Exec::Rank(rank),
            vec![
                Operand::new(out.clone(), Target::Svb(out_id), Access::Write),
                Operand::new(src.clone(), Target::Svb(src_id), Access::Read),
            ],
            Payload::Apply {
                ufunc: copy.clone(),
                out: out_block,
                inputs: vec![ApplyInput::Operand { slot: 1, block }],
            },
        ));
        if let Some(recv) = recv {
            planner.edge(recv, compute);
        }
        planner.end_unit();
    }
    Ok(planner.finish())
}

/// Length and origin (row, column) of diagonal `offset` of a matrix of
/// `shape`.
pub fn diagonal_extent(shape: &[usize], offset: isize) -> Result<(usize, usize, usize)> {
    if shape.len() != 2 {
        return Err(Error::Shape(format!(
            "diagonal needs a two-dimensional view, got {:?}",
            shape
        )));
    }
    let (r0, c0) = if offset >= 0 {
        (0, offset.unsigned_abs())
    } else {
        (offset.unsigned_abs(), 0)
    };
    if r0 >= shape[0] || c0 >= shape[1] {
        return Err(Error::Argument(format!(
            "diagonal offset {} out of range for shape {:?}",
            offset, shape
        )));
    }
    Ok(((shape[0] - r0).min(shape[1] - c0), r0, c0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::ArrayId;
    use crate::array::DType;
    use crate::array::DistributedArray;
    use crate::array::Partition;
    use crate::view::View;

    fn array(id: u64, dims: Vec<usize>, blocks: Vec<usize>, grid: Vec<usize>) -> Array {
        let p = Partition::new(dims, blocks, grid);
        Arc::new(DistributedArray::new(ArrayId(id), DType::Float64, p, 0))
    }

    fn whole(a: &Array) -> ViewRef {
        Arc::new(View::whole(a))
    }

    fn count(plans: &[Plan], kind: OpKind) -> usize {
        plans
            .iter()
            .flat_map(|p| p.ops.iter())
            .filter(|op| op.kind() == kind)
            .count()
    }

    #[test]
    fn test_fill_whole_runs_everywhere() {
        let a = array(1, vec![8], vec![2], vec![4]);
        let plans = fill(&whole(&a), 1.0, 64);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].ops[0].exec(), Exec::All);
        assert_eq!(plans[0].dep_nodes(), 4);
    }

    #[test]
    fn test_fill_slice_per_svb() {
        let a = array(1, vec![8], vec![2], vec![4]);
        let v = Arc::new(View::new(a.clone(), vec![crate::view::DimSlice::range(1, 1, 4)]).unwrap());
        let plans = fill(&v, 1.0, 64);
        let execs: Vec<Exec> = plans[0].ops.iter().map(Operation::exec).collect();
        assert_eq!(
            execs,
            vec![Exec::Rank(0), Exec::Rank(1), Exec::Rank(1), Exec::Rank(2)]
        );
    }

    #[test]
    fn test_apply_aligned_has_no_transfers() {
        let a = array(1, vec![8], vec![2], vec![4]);
        let b = array(2, vec![8], vec![2], vec![4]);
        let plans = apply(
            &Ufunc::add(),
            &[Arg::View(whole(&a)), Arg::Scalar(10.0)],
            &whole(&b),
            64,
        )
        .unwrap();
        assert_eq!(count(&plans, OpKind::Apply), 4);
        assert_eq!(count(&plans, OpKind::Send), 0);
    }

    #[test]
    fn test_apply_misaligned_fetches_once() {
        let a = array(1, vec![8], vec![2], vec![4]);
        let b = array(2, vec![4], vec![2], vec![4]);
        let src = Arc::new(View::new(a.clone(), vec![crate::view::DimSlice::range(1, 1, 4)]).unwrap());
        let plans = apply(
            &Ufunc::add(),
            &[Arg::View(src.clone()), Arg::View(src)],
            &whole(&b),
            64,
        )
        .unwrap();
        // Cells: [0,1) [1,2) [2,3) [3,4); inputs [1] [2] [3] [4] live on
        // ranks 0, 1, 1, 2; outputs on 0, 0, 1, 1.
        assert_eq!(count(&plans, OpKind::Apply), 4);
        // Only the cell at 1 (input on 1, output on 0) and the cell at 3
        // (input on 2, output on 1) fetch; both operands share the fetch.
        assert_eq!(count(&plans, OpKind::Send), 2);
        assert_eq!(plans[0].ntransfers(), 2);
    }

    #[test]
    fn test_apply_rejects_bad_shapes() {
        let a = array(1, vec![4, 3], vec![2, 2], vec![2, 2]);
        let b = array(2, vec![4, 2], vec![2, 2], vec![2, 2]);
        let err = apply(&Ufunc::identity_copy(), &[Arg::View(whole(&a))], &whole(&b), 8).unwrap_err();
        assert!(matches!(err, Error::Shape(_)));
        let err = apply(&Ufunc::add(), &[Arg::View(whole(&a))], &whole(&a), 8).unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
    }

    #[test]
    fn test_reduce_plan() {
        let a = array(1, vec![8], vec![2], vec![4]);
        let out = array(2, vec![], vec![], vec![]);
        let plans = reduce(&Ufunc::add(), &whole(&a), 0, &whole(&out), 64).unwrap();
        assert_eq!(count(&plans, OpKind::ReducePartial), 4);
        assert_eq!(count(&plans, OpKind::ReduceCombine), 4);
        // The 0-d output lives on rank 0; ranks 1..4 ship their partials.
        assert_eq!(count(&plans, OpKind::Send), 3);
        let assigns: Vec<bool> = plans[0]
            .ops
            .iter()
            .filter_map(|op| match op.payload() {
                Payload::ReduceCombine { assign, .. } => Some(*assign),
                _ => None,
            })
            .collect();
        assert_eq!(assigns, vec![true, false, false, false]);
    }

    #[test]
    fn test_chunking() {
        let a = array(1, vec![16], vec![2], vec![4]);
        let b = array(2, vec![16], vec![2], vec![4]);
        let plans = apply(&Ufunc::identity_copy(), &[Arg::View(whole(&a))], &whole(&b), 3).unwrap();
        assert_eq!(plans.len(), 3);
        assert_eq!(plans.iter().map(Plan::len).sum::<usize>(), 8);
    }

    #[test]
    fn test_diagonal_extent() {
        assert_eq!(diagonal_extent(&[3, 4], 0).unwrap(), (3, 0, 0));
        assert_eq!(diagonal_extent(&[3, 4], 2).unwrap(), (2, 0, 2));
        assert_eq!(diagonal_extent(&[3, 4], -1).unwrap(), (2, 1, 0));
        assert!(diagonal_extent(&[3, 4], 4).is_err());
        assert!(diagonal_extent(&[3], 0).is_err());
    }

    #[test]
    fn test_gather_outputs() {
        let a = array(1, vec![8], vec![2], vec![4]);
        let plans = gather(&whole(&a), 4, 1024);
        assert_eq!(plans[0].outputs.len(), 4);
        assert_eq!(count(&plans, OpKind::GetItem), 4);
        assert_eq!(count(&plans, OpKind::Send), 12);
        assert_eq!(count(&plans, OpKind::Recv), 12);
    }

    #[test]
    fn test_missing_cell_is_fatal() {
        let a = array(1, vec![8], vec![2], vec![4]);
        let dec = Decomposition::new(&whole(&a));
        assert_eq!(locate(&dec, "output", &[5]).unwrap(), 2);
        let err = locate(&dec, "output", &[8]).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("no output sub-view-block holds cell [8]"));
    }

    #[test]
    fn test_single_rank_operands() {
        let p = Partition::on_rank(vec![8], vec![2], 3);
        let a: Array = Arc::new(DistributedArray::new(ArrayId(1), DType::Float64, p, 0));
        let b = array(2, vec![8], vec![2], vec![4]);
        let args = [Arg::View(whole(&a)), Arg::Scalar(1.0)];
        let plans = apply(&Ufunc::add(), &args, &whole(&b), 1024).unwrap();
        // Rank 3 already holds the input for its own block.
        assert_eq!(count(&plans, OpKind::Apply), 4);
        assert_eq!(count(&plans, OpKind::Send), 3);
        assert_eq!(count(&plans, OpKind::Recv), 3);
    }
}
