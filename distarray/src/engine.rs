/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The submission API.
//!
//! An [`Engine`] is one rank's view of the SPMD program. Every rank
//! submits the same sequence of calls; each call is lowered into plans
//! and committed to the current epoch without executing anything.
//! Execution happens on [`Engine::flush`], when a plan no longer fits
//! the epoch, or when a value is materialized ([`Engine::get_item`],
//! [`Engine::dump`]).
//!
//! Any fatal error poisons the engine: the error is returned once and
//! every later call fails.

use std::sync::Arc;

use crate::array::Array;
use crate::array::ArrayId;
use crate::array::DType;
use crate::array::DistributedArray;
use crate::array::Partition;
use crate::array::Rank;
use crate::array::row_major_strides;
use crate::comm::Comm;
use crate::comm::CommStats;
use crate::comm::Transport;
use crate::config::Config;
use crate::config::validate_grid;
use crate::decompose::indices;
use crate::epoch::Committed;
use crate::epoch::Epoch;
use crate::error::Error;
use crate::error::FatalError;
use crate::error::Result;
use crate::lower;
use crate::lower::Arg;
use crate::lower::Plan;
use crate::scheduler;
use crate::scheduler::FlushReport;
use crate::ufunc::Ufunc;
use crate::view::DimSlice;
use crate::view::View;
use crate::view::ViewRef;

/// Cumulative statistics of an engine.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineReport {
    pub flushes: usize,
    /// Flushes triggered by a full epoch.
    pub forced_flushes: usize,
    pub totals: FlushReport,
    pub comm: CommStats,
    pub workbuf_high_water: usize,
}

#[derive(Debug)]
pub struct Engine {
    config: Config,
    comm: Comm,
    epoch: Epoch,
    next_id: u64,
    arrays_created: bool,
    poisoned: Option<String>,
    shut_down: bool,
    report: EngineReport,
}

impl Engine {
    /// Create the engine of one rank of the group `transport` connects.
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Result<Self, FatalError> {
        config.validate(transport.size())?;
        let comm = Comm::new(transport, &config);
        let epoch = Epoch::new(&config)?;
        tracing::debug!(rank = comm.rank(), size = comm.size(), "engine started");
        Ok(Self {
            config,
            comm,
            epoch,
            next_id: 0,
            arrays_created: false,
            poisoned: None,
            shut_down: false,
            report: EngineReport::default(),
        })
    }

    pub fn rank(&self) -> Rank {
        self.comm.rank()
    }

    pub fn nranks(&self) -> usize {
        self.comm.size()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Operations recorded in the current epoch.
    pub fn pending(&self) -> usize {
        self.epoch.dag().pending()
    }

    pub fn report(&self) -> EngineReport {
        EngineReport {
            comm: self.comm.stats(),
            workbuf_high_water: self.epoch.workbuf().high_water(),
            ..self.report
        }
    }

    fn check(&self) -> Result<()> {
        if self.shut_down {
            return Err(Error::ShutDown);
        }
        if let Some(reason) = &self.poisoned {
            return Err(Error::Fatal(FatalError::Logic(format!(
                "engine unusable after fatal error: {}",
                reason
            ))));
        }
        Ok(())
    }

    fn fatal(&mut self, err: FatalError) -> Error {
        tracing::error!(rank = self.rank(), "fatal: {}", err);
        self.poisoned = Some(err.to_string());
        Error::Fatal(err)
    }

    /// Poison the engine if lowering failed fatally.
    fn lowered(&mut self, plans: Result<Vec<Plan>>) -> Result<Vec<Plan>> {
        match plans {
            Err(Error::Fatal(err)) => Err(self.fatal(err)),
            plans => plans,
        }
    }

    fn chunk(&self) -> usize {
        (self.config.max_dag_ops / 2).max(1)
    }

    /// Set the block size of arrays created from now on.
    pub fn init_blocksize(&mut self, blocksize: usize) -> Result<()> {
        self.check()?;
        if self.arrays_created {
            return Err(Error::AlreadyInitialized("blocksize"));
        }
        if blocksize == 0 {
            return Err(Error::Argument("blocksize must be positive".to_string()));
        }
        self.config.blocksize = blocksize;
        Ok(())
    }

    /// Set the process grid used for arrays of `grid.len()` dimensions.
    pub fn init_pgrid(&mut self, grid: Vec<usize>) -> Result<()> {
        self.check()?;
        if self.arrays_created {
            return Err(Error::AlreadyInitialized("process grid"));
        }
        validate_grid(grid.len(), &grid, self.nranks())
            .map_err(|err| Error::Argument(err.to_string()))?;
        self.config.pgrid.insert(grid.len(), grid);
        Ok(())
    }

    /// Create a zero-filled array with the configured block size.
    pub fn create_array(&mut self, dtype: DType, dims: &[usize]) -> Result<Array> {
        let blockdims = vec![self.config.blocksize; dims.len()];
        self.create_array_with_blocks(dtype, dims, &blockdims)
    }

    pub fn create_array_with_blocks(
        &mut self,
        dtype: DType,
        dims: &[usize],
        blockdims: &[usize],
    ) -> Result<Array> {
        self.check()?;
        check_dims(dims, blockdims)?;
        let pgrid = self.config.grid_for(dims.len(), self.nranks());
        let partition = Partition::new(dims.to_vec(), blockdims.to_vec(), pgrid);
        Ok(self.new_array(dtype, partition))
    }

    /// Create a zero-filled array stored entirely on `rank`.
    pub fn create_array_on_rank(
        &mut self,
        dtype: DType,
        dims: &[usize],
        rank: Rank,
    ) -> Result<Array> {
        self.check()?;
        if rank >= self.nranks() {
            return Err(Error::Argument(format!(
                "rank {} out of range for a group of {}",
                rank,
                self.nranks()
            )));
        }
        let blockdims = vec![self.config.blocksize; dims.len()];
        check_dims(dims, &blockdims)?;
        let partition = Partition::on_rank(dims.to_vec(), blockdims, rank);
        Ok(self.new_array(dtype, partition))
    }

    fn new_array(&mut self, dtype: DType, partition: Partition) -> Array {
        let id = ArrayId(self.next_id);
        self.next_id += 1;
        self.arrays_created = true;
        let array = Arc::new(DistributedArray::new(id, dtype, partition, self.rank()));
        tracing::debug!(
            %id,
            dims = ?array.dims(),
            blockdims = ?array.blockdims(),
            onerank = ?array.partition().onerank(),
            localsize = array.localsize(),
            "create array"
        );
        array
    }

    /// Release this handle to `array`. Pending operations keep their own
    /// handles; the local buffer is freed with the last one.
    pub fn destroy_array(&mut self, array: Array) -> Result<()> {
        self.check()?;
        tracing::debug!(
            id = %array.id(),
            refcount = DistributedArray::refcount(&array),
            "destroy array"
        );
        drop(array);
        Ok(())
    }

    /// A view of `array` through `slices`.
    pub fn view(&self, array: &Array, slices: Vec<DimSlice>) -> Result<ViewRef> {
        Ok(Arc::new(View::new(array.clone(), slices)?))
    }

    /// The identity view of `array`.
    pub fn whole(&self, array: &Array) -> ViewRef {
        Arc::new(View::whole(array))
    }

    async fn flush_epoch(&mut self) -> Result<FlushReport> {
        let report = self.run_epoch().await?;
        self.reset_epoch();
        Ok(report)
    }

    fn reset_epoch(&mut self) {
        self.comm.recycle(self.epoch.take_buffers());
        self.epoch.reset();
    }

    /// Run the epoch to completion without resetting it.
    async fn run_epoch(&mut self) -> Result<FlushReport> {
        let threshold = self.config.min_thread_jobsize;
        match scheduler::flush(&mut self.epoch, &mut self.comm, threshold).await {
            Ok(report) => {
                if report.ops > 0 {
                    self.report.flushes += 1;
                    self.report.totals += report;
                }
                Ok(report)
            }
            Err(err) => Err(self.fatal(err)),
        }
    }

    /// Commit `plan`, flushing first if it does not fit the epoch.
    async fn commit(&mut self, plan: Plan) -> Result<Committed> {
        if !self.epoch.fits(&plan) && !self.epoch.is_empty() {
            tracing::warn!(
                pending = self.epoch.dag().len(),
                incoming = plan.len(),
                used = self.epoch.workbuf().used(),
                "epoch full, forcing flush"
            );
            self.report.forced_flushes += 1;
            self.flush_epoch().await?;
        }
        self.epoch.commit(plan).map_err(|err| self.fatal(err))
    }

    async fn enqueue(&mut self, what: &str, plans: Vec<Plan>) -> Result<()> {
        tracing::debug!(
            what,
            plans = plans.len(),
            ops = plans.iter().map(Plan::len).sum::<usize>(),
            "lowered"
        );
        for plan in plans {
            self.commit(plan).await?;
        }
        Ok(())
    }

    /// Flush the current epoch. A no-op when nothing is pending.
    pub async fn flush(&mut self) -> Result<FlushReport> {
        self.check()?;
        self.flush_epoch().await
    }

    pub async fn fill(&mut self, view: &ViewRef, value: f64) -> Result<()> {
        self.check()?;
        let plans = lower::fill(view, value, self.chunk());
        self.enqueue("fill", plans).await
    }

    /// Fill `array` from a global row-major buffer.
    pub async fn fill_from(&mut self, array: &Array, data: &[f64]) -> Result<()> {
        self.check()?;
        let plans = lower::data_fill(array, &self.whole(array), Arc::from(data))?;
        self.enqueue("fill_from", plans).await
    }

    pub async fn put_item(&mut self, view: &ViewRef, point: &[usize], value: f64) -> Result<()> {
        self.check()?;
        let element = Arc::new(view.element(point)?);
        let plans = lower::put_item(&element, value);
        self.enqueue("put_item", plans).await
    }

    /// The element of `view` at `point`, on every rank. Flushes.
    pub async fn get_item(&mut self, view: &ViewRef, point: &[usize]) -> Result<f64> {
        self.check()?;
        let element = Arc::new(view.element(point)?);
        let values = self.materialize(&element).await?;
        values
            .first()
            .copied()
            .ok_or_else(|| self.fatal(FatalError::Logic("get-item produced no value".into())))
    }

    /// The contents of `view` as a row-major buffer, on every rank.
    /// Flushes.
    pub async fn dump(&mut self, view: &ViewRef) -> Result<Vec<f64>> {
        self.check()?;
        self.materialize(view).await
    }

    async fn materialize(&mut self, view: &ViewRef) -> Result<Vec<f64>> {
        let strides = row_major_strides(view.shape());
        let mut out = vec![0.0; view.nelem()];
        for plan in lower::gather(view, self.nranks(), self.chunk()) {
            let outputs = plan.outputs.clone();
            let committed = self.commit(plan).await?;
            self.run_epoch().await?;
            for (temp, svb) in outputs {
                let data = self.epoch.take_temp(committed.temp(temp)).ok_or_else(|| {
                    FatalError::Logic(format!("{} was never materialized", temp))
                });
                let data = data.map_err(|err| self.fatal(err))?;
                let svb = self.epoch.svb(committed.svb(svb));
                for (index, value) in indices(svb.view_shape()).zip(data) {
                    let at: usize = index
                        .iter()
                        .zip(svb.view_start())
                        .zip(&strides)
                        .map(|((i, s), stride)| (i + s) * stride)
                        .sum();
                    out[at] = value;
                }
            }
            self.reset_epoch();
        }
        Ok(out)
    }

    /// `out = ufunc(args...)`, broadcasting inputs to the shape of `out`.
    pub async fn apply(&mut self, ufunc: &Ufunc, args: &[Arg], out: &ViewRef) -> Result<()> {
        self.check()?;
        let plans = self.lowered(lower::apply(ufunc, args, out, self.chunk()))?;
        let aliased = args.iter().any(|arg| match arg {
            Arg::View(view) => {
                view.base().id() == out.base().id() && !view.same_as(out)
            }
            Arg::Scalar(_) => false,
        });
        if !aliased {
            return self.enqueue(ufunc.name(), plans).await;
        }

        // Inputs overlapping the output through a different view are
        // read from a copy taken before the output is written.
        let mut staged = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                Arg::View(view) if view.base().id() == out.base().id() && !view.same_as(out) => {
                    let copy = self.create_array(view.base().dtype(), view.shape())?;
                    let target = self.whole(&copy);
                    let plans = self.lowered(lower::apply(
                        &Ufunc::identity_copy(),
                        &[Arg::View(view.clone())],
                        &target,
                        self.chunk(),
                    ))?;
                    self.enqueue("stage", plans).await?;
                    staged.push(Arg::View(target));
                }
                _ => staged.push(arg.clone()),
            }
        }
        let plans = self.lowered(lower::apply(ufunc, &staged, out, self.chunk()))?;
        self.enqueue(ufunc.name(), plans).await
    }

    /// Copy `src` into `dst`, broadcasting `src` if needed.
    pub async fn copy_into(&mut self, dst: &ViewRef, src: &ViewRef) -> Result<()> {
        self.apply(&Ufunc::identity_copy(), &[Arg::View(src.clone())], dst)
            .await
    }

    /// Reduce `view` with the binary `ufunc` along every axis in `axes`.
    pub async fn reduce(&mut self, ufunc: &Ufunc, view: &ViewRef, axes: &[usize]) -> Result<Array> {
        self.check()?;
        let mut axes = axes.to_vec();
        axes.sort_unstable();
        axes.dedup();
        if axes.is_empty() {
            return Err(Error::Argument("no reduction axis given".to_string()));
        }
        if let Some(axis) = axes.iter().find(|a| **a >= view.ndims()) {
            return Err(Error::Argument(format!(
                "axis {} out of range for {} dimensions",
                axis,
                view.ndims()
            )));
        }
        if ufunc.nin() != 2 {
            return Err(Error::Argument(format!(
                "cannot reduce with {}, which takes {} inputs",
                ufunc.name(),
                ufunc.nin()
            )));
        }
        let dtype = view.base().dtype();
        let mut current = view.clone();
        let mut result = None;
        // Highest axis first so the remaining axis numbers stay valid.
        for axis in axes.into_iter().rev() {
            let mut shape = current.shape().to_vec();
            shape.remove(axis);
            let out = self.create_array(dtype, &shape)?;
            let target = self.whole(&out);
            let plans = self.lowered(lower::reduce(ufunc, &current, axis, &target, self.chunk()))?;
            self.enqueue("reduce", plans).await?;
            current = target;
            result = Some(out);
        }
        result.ok_or_else(|| Error::Argument("no reduction axis given".to_string()))
    }

    /// A new one-dimensional array holding diagonal `offset` of `view`.
    pub async fn diagonal(&mut self, view: &ViewRef, offset: isize) -> Result<Array> {
        self.check()?;
        let (len, _, _) = lower::diagonal_extent(view.shape(), offset)?;
        let out = self.create_array(view.base().dtype(), &[len])?;
        let plans = self.lowered(lower::diagonal(view, offset, &self.whole(&out), self.chunk()))?;
        self.enqueue("diagonal", plans).await?;
        Ok(out)
    }

    /// A new array holding `a x b`.
    pub async fn matmul(&mut self, a: &ViewRef, b: &ViewRef) -> Result<Array> {
        self.check()?;
        if a.ndims() != 2 || b.ndims() != 2 {
            return Err(Error::Shape(format!(
                "matmul needs two-dimensional operands, got {:?} x {:?}",
                a.shape(),
                b.shape()
            )));
        }
        let dims = [a.shape()[0], b.shape()[1]];
        let out = self.create_array(a.base().dtype(), &dims)?;
        let plans = self.lowered(lower::matmul(a, b, &self.whole(&out), self.chunk()))?;
        self.enqueue("matmul", plans).await?;
        Ok(out)
    }

    /// Flush, then wait for every rank. Later calls fail with
    /// [`Error::ShutDown`].
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.check()?;
        self.flush_epoch().await?;
        if let Err(err) = self.comm.barrier().await {
            return Err(self.fatal(err));
        }
        self.shut_down = true;
        let report = self.report();
        tracing::info!(
            rank = self.rank(),
            flushes = report.flushes,
            forced = report.forced_flushes,
            executed = report.totals.executed,
            "engine shut down"
        );
        Ok(())
    }
}

fn check_dims(dims: &[usize], blockdims: &[usize]) -> Result<()> {
    if dims.len() != blockdims.len() {
        return Err(Error::Shape(format!(
            "{} block extents for {} dimensions",
            blockdims.len(),
            dims.len()
        )));
    }
    if dims.contains(&0) || blockdims.contains(&0) {
        return Err(Error::Shape(format!(
            "empty dimension in dims {:?} / blocks {:?}",
            dims, blockdims
        )));
    }
    Ok(())
}
