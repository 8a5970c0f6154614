/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The flusher.
//!
//! [`flush`] runs an epoch's DAG to completion on one rank. Ready
//! communication operations go first: sends are issued immediately and
//! receives are posted. Ready compute operations follow, those reading
//! only local storage before those reading fetched copies, then lowest
//! id first. When nothing is ready the rank waits for whichever posted
//! receive arrives first. Operations executed by other ranks complete
//! immediately: every rank walks the same DAG.

use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::ops::AddAssign;

use rayon::prelude::*;

use crate::array::DistributedArray;
use crate::array::Rank;
use crate::array::row_major_strides;
use crate::comm::Comm;
use crate::comm::Tag;
use crate::dag::ApplyInput;
use crate::dag::Buffer;
use crate::dag::MAX_OPERANDS;
use crate::dag::OpClass;
use crate::dag::OpId;
use crate::dag::Operation;
use crate::dag::Payload;
use crate::dag::Target;
use crate::dag::TempId;
use crate::decompose::ApplyBlock;
use crate::decompose::indices;
use crate::epoch::Epoch;
use crate::error::FatalError;

/// What a flush did on this rank.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    /// Operations in the DAG.
    pub ops: usize,
    /// Operations executed by this rank.
    pub executed: usize,
    /// Operations that belonged to other ranks.
    pub skipped: usize,
    pub sends: usize,
    pub recvs: usize,
    pub computes: usize,
}

impl AddAssign for FlushReport {
    fn add_assign(&mut self, other: Self) {
        self.ops += other.ops;
        self.executed += other.executed;
        self.skipped += other.skipped;
        self.sends += other.sends;
        self.recvs += other.recvs;
        self.computes += other.computes;
    }
}

/// A posted receive.
#[derive(Debug, Clone, Copy)]
struct Posted {
    op: OpId,
    peer: Rank,
    tag: Tag,
}

#[derive(Debug, Default)]
struct Queues {
    incoming: Vec<OpId>,
    comm: VecDeque<OpId>,
    /// Ordered by (remote operands, id).
    compute: BTreeSet<(usize, OpId)>,
    posted: Vec<Posted>,
}

impl Queues {
    /// Queue a ready operation executed by this rank.
    fn push(&mut self, epoch: &Epoch, id: OpId, me: Rank) {
        let op = epoch.dag().op(id);
        match op.class() {
            OpClass::Comm => self.comm.push_back(id),
            OpClass::Compute => {
                self.compute.insert((remote_operands(epoch, op, me), id));
            }
        }
    }

    /// The compute operation to run next: operands in local storage
    /// first, then submission order.
    fn next_compute(&mut self) -> Option<OpId> {
        self.compute.pop_first().map(|(_, id)| id)
    }
}

/// Run every pending operation of `epoch`. The epoch is left fully
/// completed but not reset, so callers can harvest temporaries first.
#[tracing::instrument(level = "debug", skip_all, fields(rank = comm.rank(), epoch = epoch.serial()))]
pub async fn flush(
    epoch: &mut Epoch,
    comm: &mut Comm,
    min_thread_jobsize: usize,
) -> Result<FlushReport, FatalError> {
    let me = comm.rank();
    let mut report = FlushReport {
        ops: epoch.dag().len(),
        ..FlushReport::default()
    };
    if epoch.dag().is_empty() {
        return Ok(report);
    }
    tracing::debug!(ops = report.ops, pending = epoch.dag().pending(), "flush");

    let mut queues = Queues {
        incoming: epoch.dag().ready(),
        ..Queues::default()
    };
    loop {
        // Classify newly ready operations, completing other ranks' ones
        // on the spot.
        while let Some(id) = queues.incoming.pop() {
            let op = epoch.dag().op(id);
            if !op.exec().includes(me) {
                report.skipped += 1;
                let ready = epoch.dag_mut().complete(id);
                queues.incoming.extend(ready);
                continue;
            }
            queues.push(epoch, id, me);
        }

        if let Some(id) = queues.comm.pop_front() {
            let op = epoch.dag().op(id);
            match *op.payload() {
                Payload::Send { buf, peer, tag } => {
                    let data = match buf {
                        Buffer::Svb(svb) => {
                            let block = epoch.svb(svb).pack_block();
                            read(epoch, op, 0, &block, me)?
                        }
                        Buffer::Temp(temp) => epoch
                            .temp(temp)
                            .ok_or_else(|| missing(id, "temporary", temp))?
                            .to_vec(),
                    };
                    let elsize = op
                        .operands()
                        .first()
                        .map_or(std::mem::size_of::<f64>(), |o| o.view.base().elsize());
                    comm.send(peer, tag, data.len(), elsize, |out| {
                        out.extend_from_slice(&data)
                    })
                    .await?;
                    report.sends += 1;
                    complete(epoch, &mut queues, &mut report, id);
                }
                Payload::Recv { peer, tag, .. } => {
                    queues.posted.push(Posted { op: id, peer, tag });
                }
                _ => {
                    return Err(FatalError::Logic(format!(
                        "{} of kind {:?} queued as communication",
                        id,
                        op.kind()
                    )));
                }
            }
            continue;
        }

        if let Some(id) = queues.next_compute() {
            let result = execute(epoch, epoch.dag().op(id), me, min_thread_jobsize)
                .map_err(|err| {
                    tracing::error!(%id, "compute failed: {}", err);
                    err
                })?;
            if let Some((temp, data)) = result {
                epoch.set_temp(temp, data);
            }
            report.computes += 1;
            complete(epoch, &mut queues, &mut report, id);
            continue;
        }

        if !queues.posted.is_empty() {
            let keys: Vec<(Rank, Tag)> = queues.posted.iter().map(|p| (p.peer, p.tag)).collect();
            let (index, data) = comm.wait_any(&keys).await?;
            let posted = queues.posted.swap_remove(index);
            deliver(epoch, posted.op, data, me)?;
            report.recvs += 1;
            complete(epoch, &mut queues, &mut report, posted.op);
            continue;
        }

        if epoch.dag().is_empty() {
            break;
        }
        let pending = epoch.dag().pending();
        tracing::error!(pending, "flush stalled");
        return Err(FatalError::Logic(format!(
            "flush stalled with {} operations pending and none ready",
            pending
        )));
    }
    tracing::debug!(
        executed = report.executed,
        skipped = report.skipped,
        sends = report.sends,
        recvs = report.recvs,
        "flush done"
    );
    Ok(report)
}

fn complete(epoch: &mut Epoch, queues: &mut Queues, report: &mut FlushReport, id: OpId) {
    report.executed += 1;
    let ready = epoch.dag_mut().complete(id);
    queues.incoming.extend(ready);
}

fn missing(id: OpId, what: &str, temp: TempId) -> FatalError {
    FatalError::Logic(format!("{} reads {} {} before it was written", id, what, temp))
}

/// Number of operands `op` reads from fetched copies.
fn remote_operands(epoch: &Epoch, op: &Operation, me: Rank) -> usize {
    op.operands()
        .iter()
        .filter(|operand| match operand.target {
            Target::Svb(svb) => epoch.svb(svb).rank != me,
            Target::Whole => false,
        })
        .count()
}

/// Store a received message.
fn deliver(epoch: &mut Epoch, id: OpId, data: Vec<f64>, me: Rank) -> Result<(), FatalError> {
    let Payload::Recv { buf, nelem, .. } = *epoch.dag().op(id).payload() else {
        return Err(FatalError::Logic(format!("{} posted but not a receive", id)));
    };
    if data.len() != nelem {
        return Err(FatalError::Logic(format!(
            "{} expected {} elements, received {}",
            id,
            nelem,
            data.len()
        )));
    }
    match buf {
        Buffer::Svb(svb) => {
            let svb = epoch.svb_mut(svb);
            svb.data = Some(data);
            svb.received_by = Some(me);
        }
        Buffer::Temp(temp) => epoch.set_temp(temp, data),
    }
    Ok(())
}

/// Read the elements `block` walks in the buffer behind operand `slot`:
/// local storage if this rank owns it, the received copy otherwise.
fn read(
    epoch: &Epoch,
    op: &Operation,
    slot: usize,
    block: &ApplyBlock,
    me: Rank,
) -> Result<Vec<f64>, FatalError> {
    let operand = op
        .operands()
        .get(slot)
        .ok_or_else(|| FatalError::Logic(format!("operand {} missing", slot)))?;
    match operand.target {
        Target::Svb(svb) if epoch.svb(svb).rank != me => {
            let data = epoch.svb(svb).data.as_deref().ok_or_else(|| {
                FatalError::Logic(format!(
                    "{} of {} read before it was received",
                    svb,
                    operand.view.base().id()
                ))
            })?;
            Ok(block.offsets().map(|offset| data[offset]).collect())
        }
        _ => {
            let data = operand.view.base().read();
            Ok(block.offsets().map(|offset| data[offset]).collect())
        }
    }
}

/// Write `values` to the elements `block` walks in `array`'s local
/// storage, normalized to its dtype.
fn write(array: &DistributedArray, block: &ApplyBlock, values: &[f64]) {
    let dtype = array.dtype();
    let mut data = array.write();
    for (offset, value) in block.offsets().zip(values) {
        data[offset] = dtype.normalize(*value);
    }
}

fn output(op: &Operation) -> Result<&DistributedArray, FatalError> {
    op.operands()
        .first()
        .map(|operand| operand.view.base().as_ref())
        .ok_or_else(|| FatalError::Logic(format!("{:?} has no output operand", op.kind())))
}

/// Evaluate `f` for `0..n`, on the rayon pool for large jobs.
fn map_elements(n: usize, threshold: usize, f: impl Fn(usize) -> f64 + Send + Sync) -> Vec<f64> {
    if n > threshold {
        (0..n).into_par_iter().map(f).collect()
    } else {
        (0..n).map(f).collect()
    }
}

enum Column {
    Values(Vec<f64>),
    Scalar(f64),
}

impl Column {
    #[inline]
    fn get(&self, i: usize) -> f64 {
        match self {
            Column::Values(values) => values[i],
            Column::Scalar(value) => *value,
        }
    }
}

/// Run a compute operation. Returns a temporary to store, if any.
fn execute(
    epoch: &Epoch,
    op: &Operation,
    me: Rank,
    threshold: usize,
) -> Result<Option<(TempId, Vec<f64>)>, FatalError> {
    match op.payload() {
        Payload::Fill { value } | Payload::PutItem { value } => {
            let array = output(op)?;
            match op.operands()[0].target {
                Target::Whole => {
                    let value = array.dtype().normalize(*value);
                    array.write().iter_mut().for_each(|x| *x = value);
                }
                Target::Svb(svb) => {
                    let block = epoch.svb(svb).pack_block();
                    write(array, &block, &vec![*value; block.nelem()]);
                }
            }
            Ok(None)
        }
        Payload::DataFill { data } => {
            let array = output(op)?;
            let partition = array.partition();
            let Some(coords) = partition.grid_coords(array.rank()) else {
                return Ok(None);
            };
            let strides = row_major_strides(partition.dims());
            let dtype = array.dtype();
            let mut local = array.write();
            for (i, index) in indices(array.localdims()).enumerate() {
                let global: usize = index
                    .iter()
                    .enumerate()
                    .map(|(d, l)| partition.global_index(d, coords[d], *l) * strides[d])
                    .sum();
                local[i] = dtype.normalize(data[global]);
            }
            Ok(None)
        }
        Payload::GetItem { into } => {
            let Target::Svb(svb) = op.operands()[0].target else {
                return Err(FatalError::Logic("get-item of a whole array".to_string()));
            };
            let block = epoch.svb(svb).pack_block();
            Ok(Some((*into, read(epoch, op, 0, &block, me)?)))
        }
        Payload::Apply { ufunc, out, inputs } => {
            let mut columns = Vec::with_capacity(inputs.len());
            for input in inputs {
                columns.push(match input {
                    ApplyInput::Operand { slot, block } => {
                        Column::Values(read(epoch, op, *slot, block, me)?)
                    }
                    ApplyInput::Scalar(value) => Column::Scalar(*value),
                });
            }
            let values = map_elements(out.nelem(), threshold, |i| {
                let mut args = [0.0; MAX_OPERANDS];
                for (arg, column) in args.iter_mut().zip(&columns) {
                    *arg = column.get(i);
                }
                ufunc.call(&args[..columns.len()])
            });
            write(output(op)?, out, &values);
            Ok(None)
        }
        Payload::ReducePartial {
            ufunc,
            block,
            axis,
            into,
        } => {
            let values = read(epoch, op, 0, block, me)?;
            let n = block.dims[*axis];
            let inner: usize = block.dims[axis + 1..].iter().product();
            let outer: usize = block.dims[..*axis].iter().product();
            let partial = map_elements(outer * inner, threshold, |o| {
                let (hi, lo) = (o / inner, o % inner);
                let at = |k: usize| values[(hi * n + k) * inner + lo];
                (1..n).fold(at(0), |acc, k| ufunc.call(&[acc, at(k)]))
            });
            Ok(Some((*into, partial)))
        }
        Payload::ReduceCombine {
            ufunc,
            from,
            out,
            assign,
        } => {
            let partial = epoch
                .temp(*from)
                .ok_or_else(|| FatalError::Logic(format!("partial {} never arrived", from)))?;
            let array = output(op)?;
            if *assign {
                write(array, out, partial);
            } else {
                let current = read(epoch, op, 0, out, me)?;
                let combined: Vec<f64> = current
                    .iter()
                    .zip(partial)
                    .map(|(c, p)| ufunc.call(&[*c, *p]))
                    .collect();
                write(array, out, &combined);
            }
            Ok(None)
        }
        Payload::Matmul {
            a,
            b,
            c,
            accumulate,
        } => {
            let av = read(epoch, op, 1, a, me)?;
            let bv = read(epoch, op, 2, b, me)?;
            let prior = if *accumulate {
                read(epoch, op, 0, c, me)?
            } else {
                vec![0.0; c.nelem()]
            };
            let (inner, cols) = (a.dims[1], b.dims[1]);
            let values = map_elements(c.nelem(), threshold, |x| {
                let (i, j) = (x / cols, x % cols);
                (0..inner).fold(prior[x], |acc, p| acc + av[i * inner + p] * bv[p * cols + j])
            });
            write(output(op)?, c, &values);
            Ok(None)
        }
        Payload::Send { .. } | Payload::Recv { .. } => Err(FatalError::Logic(format!(
            "{:?} queued as compute",
            op.kind()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::array::ArrayId;
    use crate::array::DType;
    use crate::array::Partition;
    use crate::comm::local;
    use crate::config::Config;
    use crate::lower;
    use crate::lower::Arg;
    use crate::ufunc::Ufunc;
    use crate::view::DimSlice;
    use crate::view::View;

    fn single_rank() -> (Epoch, Comm, Config) {
        let config = Config::default();
        let transport = local::group(1).remove(0);
        let comm = Comm::new(Arc::new(transport), &config);
        (Epoch::new(&config).unwrap(), comm, config)
    }

    fn array(id: u64, dims: Vec<usize>) -> Arc<DistributedArray> {
        let grid = vec![1; dims.len()];
        let blocks = vec![2; dims.len()];
        Arc::new(DistributedArray::new(
            ArrayId(id),
            DType::Float64,
            Partition::new(dims, blocks, grid),
            0,
        ))
    }

    async fn run(epoch: &mut Epoch, comm: &mut Comm, plans: Vec<lower::Plan>) -> FlushReport {
        for plan in plans {
            epoch.commit(plan).unwrap();
        }
        let report = flush(epoch, comm, 4).await.unwrap();
        epoch.reset();
        report
    }

    #[tokio::test]
    async fn test_flush_empty() {
        let (mut epoch, mut comm, _) = single_rank();
        let report = flush(&mut epoch, &mut comm, 4).await.unwrap();
        assert_eq!(report, FlushReport::default());
    }

    #[tokio::test]
    async fn test_fill_apply_reduce() {
        let (mut epoch, mut comm, _) = single_rank();
        let a = array(1, vec![3, 4]);
        let b = array(2, vec![3, 4]);
        let s = array(3, vec![4]);
        let (va, vb, vs) = (
            Arc::new(View::whole(&a)),
            Arc::new(View::whole(&b)),
            Arc::new(View::whole(&s)),
        );
        let data: Arc<[f64]> = (0..12).map(f64::from).collect();
        run(&mut epoch, &mut comm, lower::data_fill(&a, &va, data).unwrap()).await;
        run(
            &mut epoch,
            &mut comm,
            lower::apply(
                &Ufunc::multiply(),
                &[Arg::View(va.clone()), Arg::Scalar(2.0)],
                &vb,
                64,
            )
            .unwrap(),
        )
        .await;
        let report = run(
            &mut epoch,
            &mut comm,
            lower::reduce(&Ufunc::add(), &vb, 0, &vs, 64).unwrap(),
        )
        .await;
        assert_eq!(report.sends, 0);
        // Column sums of 2 * [[0..4], [4..8], [8..12]].
        assert_eq!(s.local_data(), vec![24.0, 30.0, 36.0, 42.0]);
    }

    #[tokio::test]
    async fn test_matmul_local() {
        let (mut epoch, mut comm, _) = single_rank();
        let a = array(1, vec![2, 3]);
        let b = array(2, vec![3, 2]);
        let c = array(3, vec![2, 2]);
        let (va, vb, vc) = (
            Arc::new(View::whole(&a)),
            Arc::new(View::whole(&b)),
            Arc::new(View::whole(&c)),
        );
        let mut plans = lower::data_fill(&a, &va, (1..=6).map(f64::from).collect()).unwrap();
        plans.extend(lower::data_fill(&b, &vb, (7..=12).map(f64::from).collect()).unwrap());
        plans.extend(lower::matmul(&va, &vb, &vc, 64).unwrap());
        run(&mut epoch, &mut comm, plans).await;
        assert_eq!(c.local_data(), vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[tokio::test]
    async fn test_dtype_normalized_on_write() {
        let (mut epoch, mut comm, _) = single_rank();
        let a = Arc::new(DistributedArray::new(
            ArrayId(1),
            DType::Int32,
            Partition::new(vec![4], vec![2], vec![1]),
            0,
        ));
        let va = Arc::new(View::whole(&a));
        run(&mut epoch, &mut comm, lower::fill(&va, 2.75, 64)).await;
        assert_eq!(a.local_data(), vec![2.0; 4]);
    }

    #[test]
    fn test_report_add() {
        let mut total = FlushReport::default();
        total += FlushReport {
            ops: 3,
            executed: 2,
            skipped: 1,
            sends: 1,
            recvs: 0,
            computes: 1,
        };
        total += FlushReport {
            ops: 1,
            executed: 1,
            ..FlushReport::default()
        };
        assert_eq!(total.ops, 4);
        assert_eq!(total.executed, 3);
        assert_eq!(total.skipped, 1);
    }

    #[test]
    fn test_local_compute_first() {
        // Two ranks, blocks of 2: rank 0 owns [0, 2), rank 1 owns [2, 4).
        let config = Config::default();
        let mut epoch = Epoch::new(&config).unwrap();
        let arr = |id| {
            Arc::new(DistributedArray::new(
                ArrayId(id),
                DType::Float64,
                Partition::new(vec![4], vec![2], vec![2]),
                0,
            ))
        };
        let (a, b, c, d) = (arr(1), arr(2), arr(3), arr(4));
        let head = |x: &Arc<DistributedArray>| {
            Arc::new(View::new(x.clone(), vec![DimSlice::range(0, 1, 2)]).unwrap())
        };
        let tail = Arc::new(View::new(a.clone(), vec![DimSlice::range(2, 1, 2)]).unwrap());
        let copy = Ufunc::identity_copy();
        // c[0:2] = a[2:4] reads a fetched copy; d[0:2] = b[0:2] is local.
        for plan in lower::apply(&copy, &[Arg::View(tail)], &head(&c), 64).unwrap() {
            epoch.commit(plan).unwrap();
        }
        for plan in lower::apply(&copy, &[Arg::View(head(&b))], &head(&d), 64).unwrap() {
            epoch.commit(plan).unwrap();
        }

        let mut queues = Queues::default();
        let computes: Vec<OpId> = epoch
            .dag()
            .ops()
            .filter(|(_, op)| op.class() == OpClass::Compute)
            .map(|(id, _)| id)
            .collect();
        assert_eq!(computes.len(), 2);
        for id in &computes {
            queues.push(&epoch, *id, 0);
        }
        assert_eq!(queues.next_compute(), Some(computes[1]));
        assert_eq!(queues.next_compute(), Some(computes[0]));
        assert_eq!(queues.next_compute(), None);
    }

    #[test]
    fn test_map_elements_parallel() {
        let serial = map_elements(1000, 1000, |i| (i * i) as f64);
        let parallel = map_elements(1000, 1, |i| (i * i) as f64);
        assert_eq!(serial, parallel);
        assert_eq!(parallel[999], 998001.0);
    }
}
