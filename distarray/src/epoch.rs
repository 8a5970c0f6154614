/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The epoch: everything recorded between two flushes.
//!
//! An epoch owns the work buffer accounting, the DAG, and the arenas of
//! SVB and temporary records that operations refer to by index. Plans
//! are committed into it whole; a flush runs it to completion and
//! [`Epoch::reset`] invalidates every record at once.

use std::mem::size_of;

use crate::comm::derive_tag;
use crate::comm::tag_capacity;
use crate::config::Config;
use crate::dag::Dag;
use crate::dag::DepNode;
use crate::dag::OpId;
use crate::dag::Operation;
use crate::dag::SvbId;
use crate::dag::TempId;
use crate::decompose::Svb;
use crate::error::FatalError;
use crate::lower::Plan;
use crate::workbuf::WorkBuffer;

/// Where a committed plan's local ids landed in the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Committed {
    pub op_base: usize,
    pub svb_base: usize,
    pub temp_base: usize,
}

impl Committed {
    pub fn op(&self, local: usize) -> OpId {
        OpId(self.op_base + local)
    }

    pub fn svb(&self, local: SvbId) -> SvbId {
        SvbId(self.svb_base + local.0)
    }

    pub fn temp(&self, local: TempId) -> TempId {
        TempId(self.temp_base + local.0)
    }
}

#[derive(Debug)]
pub struct Epoch {
    workbuf: WorkBuffer,
    dag: Dag,
    svbs: Vec<Svb>,
    temps: Vec<Option<Vec<f64>>>,
    transfers: usize,
    max_dag_ops: usize,
    max_tag: u32,
    serial: u64,
}

impl Epoch {
    pub fn new(config: &Config) -> Result<Self, FatalError> {
        Ok(Self {
            workbuf: WorkBuffer::new(config.work_buffer_size, config.work_buffer_alignment)?,
            dag: Dag::new(),
            svbs: Vec::new(),
            temps: Vec::new(),
            transfers: 0,
            max_dag_ops: config.max_dag_ops,
            max_tag: config.max_tag,
            serial: 0,
        })
    }

    pub fn dag(&self) -> &Dag {
        &self.dag
    }

    pub(crate) fn dag_mut(&mut self) -> &mut Dag {
        &mut self.dag
    }

    pub fn workbuf(&self) -> &WorkBuffer {
        &self.workbuf
    }

    pub fn svb(&self, id: SvbId) -> &Svb {
        &self.svbs[id.0]
    }

    pub(crate) fn svb_mut(&mut self, id: SvbId) -> &mut Svb {
        &mut self.svbs[id.0]
    }

    pub fn temp(&self, id: TempId) -> Option<&[f64]> {
        self.temps.get(id.0)?.as_deref()
    }

    pub(crate) fn set_temp(&mut self, id: TempId, data: Vec<f64>) {
        self.temps[id.0] = Some(data);
    }

    pub fn take_temp(&mut self, id: TempId) -> Option<Vec<f64>> {
        self.temps.get_mut(id.0)?.take()
    }

    /// Number of flushes completed.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Whether nothing has been recorded since the last reset.
    pub fn is_empty(&self) -> bool {
        self.dag.len() == 0
    }

    /// Work buffer bytes a plan consumes on commit.
    pub fn cost(&self, plan: &Plan) -> usize {
        let charge = |bytes: usize| if bytes == 0 { 0 } else { self.workbuf.rounded(bytes) };
        charge(size_of::<Operation>() * plan.len())
            + charge(size_of::<DepNode>() * plan.dep_nodes())
            + charge(size_of::<Svb>() * plan.nsvbs())
            + charge(size_of::<Option<Vec<f64>>>() * plan.ntemps())
    }

    /// Whether `plan` can be committed without a flush.
    pub fn fits(&self, plan: &Plan) -> bool {
        self.workbuf.fits(self.cost(plan))
            && self.dag.len() + plan.len() <= self.max_dag_ops
            && self.transfers + plan.ntransfers() <= tag_capacity(self.max_tag)
    }

    /// Append `plan` to the epoch: rebase its ids, assign tags to its
    /// transfers, and register hazards.
    pub fn commit(&mut self, plan: Plan) -> Result<Committed, FatalError> {
        if self.dag.len() + plan.len() > self.max_dag_ops {
            return Err(FatalError::Configuration(format!(
                "a submission of {} operations exceeds the DAG limit of {} ({} pending)",
                plan.len(),
                self.max_dag_ops,
                self.dag.len()
            )));
        }
        if self.transfers + plan.ntransfers() > tag_capacity(self.max_tag) {
            return Err(FatalError::Configuration(format!(
                "a submission of {} transfers exceeds the tag space of {}",
                plan.ntransfers(),
                tag_capacity(self.max_tag)
            )));
        }
        for (count, size) in [
            (plan.len(), size_of::<Operation>()),
            (plan.dep_nodes(), size_of::<DepNode>()),
            (plan.nsvbs(), size_of::<Svb>()),
            (plan.ntemps(), size_of::<Option<Vec<f64>>>()),
        ] {
            if count > 0 {
                self.workbuf.charge(count * size)?;
            }
        }

        let committed = Committed {
            op_base: self.dag.len(),
            svb_base: self.svbs.len(),
            temp_base: self.temps.len(),
        };
        let Plan {
            svbs,
            ntemps,
            mut ops,
            edges,
            transfers,
            ..
        } = plan;
        self.svbs.extend(svbs);
        self.temps.resize(self.temps.len() + ntemps, None);
        for transfer in &transfers {
            let tag = derive_tag(self.transfers, transfer.slot, self.max_tag);
            ops[transfer.send].set_tag(tag);
            ops[transfer.recv].set_tag(tag);
            self.transfers += 1;
        }
        for mut op in ops {
            op.rebase(committed.svb_base, committed.temp_base);
            self.dag.push(op, &self.svbs);
        }
        for (from, to) in edges {
            self.dag.add_edge(committed.op(from), committed.op(to));
        }
        Ok(committed)
    }

    /// Move out every received copy and temporary still held, for
    /// reuse as staging buffers.
    pub(crate) fn take_buffers(&mut self) -> Vec<Vec<f64>> {
        let received = self.svbs.iter_mut().filter_map(|svb| svb.data.take());
        let temps = self.temps.iter_mut().filter_map(Option::take);
        received.chain(temps).collect()
    }

    /// Invalidate every record of the epoch.
    pub fn reset(&mut self) {
        debug_assert!(self.dag.is_empty(), "reset with pending operations");
        self.dag.clear();
        self.svbs.clear();
        self.temps.clear();
        self.transfers = 0;
        self.workbuf.reset();
        self.serial += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::array::ArrayId;
    use crate::array::DType;
    use crate::array::DistributedArray;
    use crate::array::Partition;
    use crate::lower;
    use crate::lower::Arg;
    use crate::ufunc::Ufunc;
    use crate::view::View;

    fn views() -> (crate::view::ViewRef, crate::view::ViewRef) {
        let a = Arc::new(DistributedArray::new(
            ArrayId(1),
            DType::Float64,
            Partition::new(vec![8], vec![2], vec![4]),
            0,
        ));
        let b = Arc::new(DistributedArray::new(
            ArrayId(2),
            DType::Float64,
            Partition::new(vec![8], vec![2], vec![4]),
            0,
        ));
        (Arc::new(View::whole(&a)), Arc::new(View::whole(&b)))
    }

    #[test]
    fn test_commit_and_reset() {
        let (a, b) = views();
        let mut epoch = Epoch::new(&Config::default()).unwrap();
        let plans = lower::apply(&Ufunc::identity_copy(), &[Arg::View(a)], &b, 1024).unwrap();
        for plan in plans {
            assert!(epoch.fits(&plan));
            epoch.commit(plan).unwrap();
        }
        assert_eq!(epoch.dag().len(), 4);
        assert!(epoch.workbuf().used() > 0);
        assert_eq!(epoch.workbuf().used() % 32, 0);

        let ready = epoch.dag().ready();
        for id in ready {
            epoch.dag_mut().complete(id);
        }
        epoch.reset();
        assert!(epoch.is_empty());
        assert_eq!(epoch.workbuf().used(), 0);
        assert_eq!(epoch.serial(), 1);
    }

    #[test]
    fn test_take_buffers() {
        let (a, _) = views();
        let mut epoch = Epoch::new(&Config::default()).unwrap();
        let mut committed = Vec::new();
        for plan in lower::gather(&a, 4, 1024) {
            committed.push(epoch.commit(plan).unwrap());
        }
        let temp = committed[0].temp(crate::dag::TempId(0));
        epoch.set_temp(temp, vec![1.0, 2.0]);
        epoch.svb_mut(committed[0].svb(crate::dag::SvbId(0))).data = Some(vec![3.0]);

        let mut buffers = epoch.take_buffers();
        buffers.sort_by_key(Vec::len);
        assert_eq!(buffers, vec![vec![3.0], vec![1.0, 2.0]]);
        assert!(epoch.temp(temp).is_none());
        assert!(epoch.take_buffers().is_empty());
    }

    #[test]
    fn test_dag_limit() {
        let (a, b) = views();
        let config = Config {
            max_dag_ops: 6,
            ..Config::default()
        };
        let mut epoch = Epoch::new(&config).unwrap();
        let mut plans =
            lower::apply(&Ufunc::identity_copy(), &[Arg::View(a.clone())], &b, 1024).unwrap();
        epoch.commit(plans.remove(0)).unwrap();
        let next = lower::apply(&Ufunc::identity_copy(), &[Arg::View(a)], &b, 1024)
            .unwrap()
            .remove(0);
        assert!(!epoch.fits(&next));
        assert!(matches!(
            epoch.commit(next),
            Err(FatalError::Configuration(_))
        ));
    }

    #[test]
    fn test_tags_distinct() {
        let (a, _) = views();
        let mut epoch = Epoch::new(&Config::default()).unwrap();
        for plan in lower::gather(&a, 4, 1024) {
            epoch.commit(plan).unwrap();
        }
        let tags: std::collections::BTreeSet<_> = epoch
            .dag()
            .ops()
            .filter(|(_, op)| op.kind() == crate::dag::OpKind::Send)
            .filter_map(|(_, op)| op.tag())
            .collect();
        assert_eq!(tags.len(), 12);
    }

    #[test]
    fn test_workbuf_exhaustion() {
        let (a, b) = views();
        let config = Config {
            work_buffer_size: 64,
            ..Config::default()
        };
        let mut epoch = Epoch::new(&config).unwrap();
        let plan = lower::apply(&Ufunc::identity_copy(), &[Arg::View(a)], &b, 1024)
            .unwrap()
            .remove(0);
        assert!(!epoch.fits(&plan));
        assert!(epoch.commit(plan).is_err());
    }
}
