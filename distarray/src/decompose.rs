/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! View-block decomposition.
//!
//! A view's index space is cut into view-blocks: block-shaped windows
//! whose extent along each viewable dimension is the base array's block
//! size in the dimension that slice consumes. Each view-block is cut
//! further wherever the sampled base indices cross a base block
//! boundary. The resulting pieces are sub-view-blocks ([`Svb`]): each
//! lies inside exactly one base block and so has exactly one owning
//! rank. Views with steps, unaligned starts, or reduced rank all go
//! through the same rule.
//!
//! Cuts are independent per dimension, so a decomposition is a list
//! of [`Segment`]s per viewable dimension, and the SVBs are their
//! cartesian product, ordered view-block by view-block (row-major) and
//! row-major within each view-block. The result depends only on the
//! view and its base partition; every rank computes the same SVBs in
//! the same order.

use crate::array::ArrayId;
use crate::array::Rank;
use crate::array::row_major_strides;
use crate::view::DimSlice;
use crate::view::View;

/// A run of view coordinates along one dimension that maps into a
/// single base block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// First view coordinate of the run.
    pub start: usize,
    /// Number of coordinates in the run.
    pub len: usize,
    /// View-block the run belongs to.
    pub vblock: usize,
}

/// Identifies the dependency root of a base block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub array: ArrayId,
    pub block: usize,
}

/// How to walk a buffer: `dims` extents, `strides` in elements (zero
/// repeats the same element), starting at `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyBlock {
    pub dims: Vec<usize>,
    pub strides: Vec<usize>,
    pub offset: usize,
}

impl ApplyBlock {
    pub fn nelem(&self) -> usize {
        self.dims.iter().product()
    }

    /// Buffer offsets of every element, in row-major order.
    pub fn offsets(&self) -> Offsets<'_> {
        Offsets {
            block: self,
            index: vec![0; self.dims.len()],
            current: self.offset,
            remaining: self.nelem(),
        }
    }

    /// The largest offset touched, plus one.
    pub fn extent(&self) -> usize {
        if self.nelem() == 0 {
            return self.offset;
        }
        self.offset
            + self
                .dims
                .iter()
                .zip(self.strides.iter())
                .map(|(n, s)| (n - 1) * s)
                .sum::<usize>()
            + 1
    }
}

/// Iterator over the offsets of an [`ApplyBlock`].
pub struct Offsets<'a> {
    block: &'a ApplyBlock,
    index: Vec<usize>,
    current: usize,
    remaining: usize,
}

impl Iterator for Offsets<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let result = self.current;
        self.remaining -= 1;
        for d in (0..self.index.len()).rev() {
            self.index[d] += 1;
            self.current += self.block.strides[d];
            if self.index[d] < self.block.dims[d] {
                break;
            }
            self.current -= self.block.strides[d] * self.index[d];
            self.index[d] = 0;
        }
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

/// A sub-view-block: the part of a view-block owned by one rank.
#[derive(Debug, Clone)]
pub struct Svb {
    /// Rank that owns the data.
    pub rank: Rank,
    /// First global index, per base dimension.
    pub start: Vec<usize>,
    /// Number of elements, per base dimension.
    pub nsteps: Vec<usize>,
    /// Step between sampled global indices, per base dimension.
    pub step: Vec<usize>,
    /// Distance in the owner's local buffer between consecutive
    /// elements, per base dimension.
    pub stride: Vec<usize>,
    /// Byte offset of the first element in the owner's local buffer.
    pub comm_offset: usize,
    /// Number of elements.
    pub nelem: usize,
    /// Dependency root of the base block this SVB lies in.
    pub root: BlockKey,
    /// The view-block this SVB belongs to.
    pub vblock: usize,
    /// Received copy of the data, on ranks other than the owner.
    pub data: Option<Vec<f64>>,
    /// The rank that most recently received a copy.
    pub received_by: Option<Rank>,
    pub(crate) local_offset: usize,
    pub(crate) view_start: Vec<usize>,
    pub(crate) view_shape: Vec<usize>,
    local_vstrides: Vec<usize>,
    packed_vstrides: Vec<usize>,
}

impl Svb {
    /// First view coordinate, per viewable dimension.
    pub fn view_start(&self) -> &[usize] {
        &self.view_start
    }

    /// Extent per viewable dimension.
    pub fn view_shape(&self) -> &[usize] {
        &self.view_shape
    }

    /// Element offset of the first element in the owner's local buffer.
    pub fn local_offset(&self) -> usize {
        self.local_offset
    }

    /// Per-viewable-dimension strides into the owner's local buffer
    /// (`local`) or into a packed copy.
    pub fn view_strides(&self, local: bool) -> &[usize] {
        if local {
            &self.local_vstrides
        } else {
            &self.packed_vstrides
        }
    }

    /// Offset of view coordinate `point` in the owner's local buffer
    /// (`local`) or in a packed copy.
    pub fn offset_of(&self, point: &[usize], local: bool) -> usize {
        let base = if local { self.local_offset } else { 0 };
        point
            .iter()
            .zip(self.view_start.iter())
            .zip(self.view_strides(local).iter())
            .fold(base, |acc, ((p, s), stride)| acc + (p - s) * stride)
    }

    /// Walk of the whole SVB in the owner's local buffer, in packed
    /// (row-major) order.
    pub fn pack_block(&self) -> ApplyBlock {
        ApplyBlock {
            dims: self.nsteps.clone(),
            strides: self.stride.clone(),
            offset: self.local_offset,
        }
    }

    /// Whether view coordinate `point` lies in this SVB.
    pub fn contains(&self, point: &[usize]) -> bool {
        point
            .iter()
            .zip(self.view_start.iter().zip(self.view_shape.iter()))
            .all(|(p, (s, n))| *p >= *s && *p < s + n)
    }
}

/// Row-major iteration over all indices of `shape`. A zero-dimensional
/// shape yields one empty index.
pub(crate) fn indices(shape: &[usize]) -> impl Iterator<Item = Vec<usize>> + '_ {
    let total: usize = shape.iter().product();
    let mut index = vec![0; shape.len()];
    (0..total).map(move |i| {
        if i > 0 {
            for d in (0..shape.len()).rev() {
                index[d] += 1;
                if index[d] < shape[d] {
                    break;
                }
                index[d] = 0;
            }
        }
        index.clone()
    })
}

/// One view-block: a block-sized window of a view.
#[derive(Debug, Clone, Copy)]
pub struct ViewBlock<'a> {
    svbs: &'a [Svb],
}

impl<'a> ViewBlock<'a> {
    /// Row-major index of the view-block.
    pub fn index(&self) -> usize {
        self.svbs[0].vblock
    }

    /// First view coordinate covered.
    pub fn start(&self) -> &'a [usize] {
        self.svbs[0].view_start()
    }

    /// Extent of the view-block in view coordinates.
    pub fn shape(&self) -> Vec<usize> {
        let first = &self.svbs[0];
        let last = &self.svbs[self.svbs.len() - 1];
        first
            .view_start()
            .iter()
            .zip(last.view_start().iter().zip(last.view_shape()))
            .map(|(s, (ls, ln))| ls + ln - s)
            .collect()
    }

    pub fn nelem(&self) -> usize {
        self.svbs.iter().map(|s| s.nelem).sum()
    }

    pub fn svbs(&self) -> &'a [Svb] {
        self.svbs
    }
}

/// The decomposition of one view into sub-view-blocks.
#[derive(Debug, Clone)]
pub struct Decomposition {
    segments: Vec<Vec<Segment>>,
    svbs: Vec<Svb>,
    /// Row-major segment grid -> SVB ordinal.
    ordinal: Vec<usize>,
}

impl Decomposition {
    pub fn new(view: &View) -> Self {
        let base = view.base();
        let partition = base.partition();

        // Cut every viewable dimension into segments.
        let mut segments: Vec<Vec<Segment>> = Vec::with_capacity(view.ndims());
        let mut d = 0;
        for slice in view.slices() {
            match *slice {
                DimSlice::Range {
                    start,
                    step,
                    nsteps,
                } => {
                    let bs = partition.blockdims()[d];
                    let mut segs: Vec<Segment> = Vec::new();
                    for k in 0..nsteps {
                        let g = start + step * k;
                        let new_segment = k % bs == 0 || (g - step) / bs != g / bs;
                        match segs.last_mut() {
                            Some(seg) if !new_segment => seg.len += 1,
                            _ => segs.push(Segment {
                                start: k,
                                len: 1,
                                vblock: k / bs,
                            }),
                        }
                    }
                    segments.push(segs);
                    d += 1;
                }
                DimSlice::Single(_) => d += 1,
                DimSlice::Pseudo => segments.push(vec![Segment {
                    start: 0,
                    len: 1,
                    vblock: 0,
                }]),
            }
        }

        // Segment index ranges belonging to each view-block, per dimension.
        let by_vblock: Vec<Vec<std::ops::Range<usize>>> = segments
            .iter()
            .zip(view.blockdims().iter())
            .map(|(segs, nvb)| {
                let mut ranges = vec![0..0; *nvb];
                for (i, seg) in segs.iter().enumerate() {
                    let range = &mut ranges[seg.vblock];
                    if range.start == range.end {
                        *range = i..i + 1;
                    } else {
                        range.end = i + 1;
                    }
                }
                ranges
            })
            .collect();

        let seg_counts: Vec<usize> = segments.iter().map(Vec::len).collect();
        let seg_strides = row_major_strides(&seg_counts);
        let mut ordinal = vec![0; seg_counts.iter().product()];
        let mut svbs = Vec::with_capacity(ordinal.len());

        for (vblock, vb_index) in indices(view.blockdims()).enumerate() {
            let ranges: Vec<&std::ops::Range<usize>> = vb_index
                .iter()
                .enumerate()
                .map(|(dim, vb)| &by_vblock[dim][*vb])
                .collect();
            let local_counts: Vec<usize> = ranges.iter().map(|r| r.len()).collect();
            for local in indices(&local_counts) {
                let seg_index: Vec<usize> = local
                    .iter()
                    .zip(ranges.iter())
                    .map(|(i, r)| r.start + i)
                    .collect();
                let flat: usize = seg_index
                    .iter()
                    .zip(seg_strides.iter())
                    .map(|(i, s)| i * s)
                    .sum();
                ordinal[flat] = svbs.len();
                let segs: Vec<&Segment> = seg_index
                    .iter()
                    .enumerate()
                    .map(|(dim, i)| &segments[dim][*i])
                    .collect();
                svbs.push(make_svb(view, &segs, vblock));
            }
        }

        Self {
            segments,
            svbs,
            ordinal,
        }
    }

    pub fn svbs(&self) -> &[Svb] {
        &self.svbs
    }

    pub fn into_svbs(self) -> Vec<Svb> {
        self.svbs
    }

    /// Segments along viewable dimension `dim`.
    pub fn segments(&self, dim: usize) -> &[Segment] {
        &self.segments[dim]
    }

    /// Cut points along viewable dimension `dim`: the first coordinate
    /// of every segment.
    pub fn cuts(&self, dim: usize) -> impl Iterator<Item = usize> + '_ {
        self.segments[dim].iter().map(|s| s.start)
    }

    /// The view-blocks of the view in row-major order, each with its
    /// sub-view-blocks.
    pub fn view_blocks(&self) -> impl Iterator<Item = ViewBlock<'_>> + '_ {
        self.svbs
            .chunk_by(|a, b| a.vblock == b.vblock)
            .map(|svbs| ViewBlock { svbs })
    }

    /// Ordinal of the SVB containing view coordinate `point`.
    pub fn locate(&self, point: &[usize]) -> Option<usize> {
        if point.len() != self.segments.len() {
            return None;
        }
        let mut flat = 0;
        for (segs, p) in self.segments.iter().zip(point.iter()) {
            let i = segs.partition_point(|s| s.start <= *p).checked_sub(1)?;
            let seg = &segs[i];
            if *p >= seg.start + seg.len {
                return None;
            }
            flat = flat * segs.len() + i;
        }
        self.ordinal.get(flat).copied()
    }
}

/// Decompose `view` into its sub-view-blocks.
pub fn decompose(view: &View) -> Vec<Svb> {
    Decomposition::new(view).into_svbs()
}

fn make_svb(view: &View, segs: &[&Segment], vblock: usize) -> Svb {
    let base = view.base();
    let partition = base.partition();
    let ndims = base.ndims();

    let mut start = Vec::with_capacity(ndims);
    let mut nsteps = Vec::with_capacity(ndims);
    let mut step = Vec::with_capacity(ndims);
    let mut view_start = Vec::with_capacity(segs.len());
    let mut view_shape = Vec::with_capacity(segs.len());
    // Base dimension of each viewable dimension (None for pseudo).
    let mut view_dims = Vec::with_capacity(segs.len());
    let mut vdim = 0;
    for slice in view.slices() {
        match *slice {
            DimSlice::Range {
                start: s, step: st, ..
            } => {
                let seg = segs[vdim];
                start.push(s + st * seg.start);
                nsteps.push(seg.len);
                step.push(if seg.len == 1 { 1 } else { st });
                view_start.push(seg.start);
                view_shape.push(seg.len);
                view_dims.push(Some(start.len() - 1));
                vdim += 1;
            }
            DimSlice::Single(index) => {
                start.push(index);
                nsteps.push(1);
                step.push(1);
            }
            DimSlice::Pseudo => {
                view_start.push(0);
                view_shape.push(1);
                view_dims.push(None);
                vdim += 1;
            }
        }
    }

    let block: Vec<usize> = start
        .iter()
        .zip(partition.blockdims().iter())
        .map(|(s, bs)| s / bs)
        .collect();
    let rank = partition.owner_of_block(&block);
    let local_strides = row_major_strides(&partition.local_dims(rank));
    let local_offset = start
        .iter()
        .enumerate()
        .map(|(d, s)| partition.local_index(d, *s) * local_strides[d])
        .sum();
    let stride: Vec<usize> = step
        .iter()
        .zip(local_strides.iter())
        .map(|(st, ls)| st * ls)
        .collect();
    let packed = row_major_strides(&nsteps);
    let local_vstrides = view_dims.iter().map(|d| d.map_or(0, |d| stride[d])).collect();
    let packed_vstrides = view_dims.iter().map(|d| d.map_or(0, |d| packed[d])).collect();

    Svb {
        rank,
        nelem: nsteps.iter().product(),
        comm_offset: local_offset * base.elsize(),
        root: BlockKey {
            array: base.id(),
            block: partition.flat_block(&block),
        },
        vblock,
        data: None,
        received_by: None,
        local_offset,
        start,
        nsteps,
        step,
        stride,
        view_start,
        view_shape,
        local_vstrides,
        packed_vstrides,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;
    use crate::array::Array;
    use crate::array::DType;
    use crate::array::DistributedArray;
    use crate::array::Partition;

    fn array(dims: &[usize], blockdims: &[usize], pgrid: &[usize]) -> Array {
        let p = Partition::new(dims.to_vec(), blockdims.to_vec(), pgrid.to_vec());
        Arc::new(DistributedArray::new(ArrayId(7), DType::Float64, p, 0))
    }

    /// Every view coordinate covered by `svb`, as base indices.
    fn covered(view: &View, svb: &Svb) -> Vec<Vec<usize>> {
        indices(svb.view_shape())
            .map(|local| {
                let point: Vec<usize> = local
                    .iter()
                    .zip(svb.view_start())
                    .map(|(l, s)| l + s)
                    .collect();
                view.base_index(&point)
            })
            .collect()
    }

    #[test]
    fn test_offsets() {
        let block = ApplyBlock {
            dims: vec![2, 3],
            strides: vec![10, 2],
            offset: 1,
        };
        assert_eq!(block.offsets().collect::<Vec<_>>(), vec![1, 3, 5, 11, 13, 15]);
        assert_eq!(block.extent(), 16);

        let broadcast = ApplyBlock {
            dims: vec![2, 2],
            strides: vec![0, 1],
            offset: 4,
        };
        assert_eq!(broadcast.offsets().collect::<Vec<_>>(), vec![4, 5, 4, 5]);

        let scalar = ApplyBlock {
            dims: vec![],
            strides: vec![],
            offset: 3,
        };
        assert_eq!(scalar.offsets().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn test_aligned_1d() {
        let a = array(&[8], &[2], &[4]);
        let svbs = decompose(&View::whole(&a));
        assert_eq!(svbs.len(), 4);
        for (i, svb) in svbs.iter().enumerate() {
            assert_eq!(svb.rank, i);
            assert_eq!(svb.start, vec![2 * i]);
            assert_eq!(svb.nsteps, vec![2]);
            assert_eq!(svb.local_offset, 0);
            assert_eq!(svb.root.block, i);
            assert_eq!(svb.vblock, i);
        }
    }

    #[test]
    fn test_unaligned_start_splits_by_owner() {
        // a[1:7] over blocks of 2 on 4 ranks: view-blocks [1,2] [3,4] [5,6]
        // each straddle two base blocks.
        let a = array(&[8], &[2], &[4]);
        let v = View::new(a, vec![DimSlice::range(1, 1, 6)]).unwrap();
        let svbs = decompose(&v);
        let ranks: Vec<usize> = svbs.iter().map(|s| s.rank).collect();
        assert_eq!(ranks, vec![0, 1, 1, 2, 2, 3]);
        let vblocks: Vec<usize> = svbs.iter().map(|s| s.vblock).collect();
        assert_eq!(vblocks, vec![0, 0, 1, 1, 2, 2]);
        assert_eq!(svbs[1].start, vec![2]);
        assert_eq!(svbs[1].nsteps, vec![1]);
        assert_eq!(svbs[0].local_offset, 1);
        assert_eq!(svbs[0].comm_offset, 8);
    }

    #[test]
    fn test_strided() {
        // a[0:12:3] -> 0, 3, 6, 9 with blocks of 4 on 3 ranks.
        let a = array(&[12], &[4], &[3]);
        let v = View::new(a, vec![DimSlice::range(0, 3, 4)]).unwrap();
        let d = Decomposition::new(&v);
        let svbs = d.svbs();
        let starts: Vec<usize> = svbs.iter().map(|s| s.start[0]).collect();
        assert_eq!(starts, vec![0, 6, 9]);
        let counts: Vec<usize> = svbs.iter().map(|s| s.nsteps[0]).collect();
        assert_eq!(counts, vec![2, 1, 1]);
        assert_eq!(svbs[0].stride, vec![3]);
        assert_eq!(svbs[0].view_strides(true), &[3]);
        assert_eq!(svbs[0].view_strides(false), &[1]);
        assert_eq!(d.locate(&[1]), Some(0));
        assert_eq!(d.locate(&[3]), Some(2));
        assert_eq!(d.locate(&[4]), None);
    }

    #[test]
    fn test_view_blocks() {
        // a[1:6, 0:4] over 2x2 blocks on a 2x2 grid.
        let a = array(&[6, 4], &[2, 2], &[2, 2]);
        let v = View::new(a, vec![DimSlice::range(1, 1, 5), DimSlice::full(4)]).unwrap();
        let d = Decomposition::new(&v);
        let blocks: Vec<_> = d.view_blocks().collect();
        assert_eq!(blocks.len(), v.nblocks());
        assert_eq!(blocks.iter().map(|b| b.index()).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(blocks[0].start(), &[0, 0]);
        assert_eq!(blocks[0].shape(), vec![2, 2]);
        // View rows 0..2 straddle base rows 1 and 2.
        assert_eq!(blocks[0].svbs().len(), 2);
        assert_eq!(blocks[5].start(), &[4, 2]);
        assert_eq!(blocks[5].shape(), vec![1, 2]);
        assert_eq!(blocks.iter().map(|b| b.nelem()).sum::<usize>(), v.nelem());
    }

    #[test]
    fn test_single_step_ignores_stride() {
        let a = array(&[12], &[4], &[3]);
        let v = View::new(a, vec![DimSlice::range(5, usize::MAX, 1)]).unwrap();
        let d = Decomposition::new(&v);
        assert_eq!(d.svbs().len(), 1);
        let svb = &d.svbs()[0];
        assert_eq!((svb.rank, svb.start.clone()), (1, vec![5]));
        assert_eq!(svb.step, vec![1]);
        assert_eq!(svb.local_offset(), 1);
    }

    #[test]
    fn test_reduced_rank() {
        let a = array(&[4, 6], &[2, 2], &[2, 2]);
        let v = View::new(a, vec![DimSlice::Single(3), DimSlice::full(6)]).unwrap();
        let svbs = decompose(&v);
        assert_eq!(svbs.len(), 3);
        for (i, svb) in svbs.iter().enumerate() {
            assert_eq!(svb.start, vec![3, 2 * i]);
            assert_eq!(svb.nsteps, vec![1, 2]);
            assert_eq!(svb.view_shape(), &[2]);
        }
        // Row 3 is in block row 1 -> grid row 1.
        let ranks: Vec<usize> = svbs.iter().map(|s| s.rank).collect();
        assert_eq!(ranks, vec![2, 3, 2]);
    }

    #[test]
    fn test_pseudo() {
        let a = array(&[4], &[2], &[2]);
        let v = View::new(a, vec![DimSlice::full(4), DimSlice::Pseudo]).unwrap();
        let d = Decomposition::new(&v);
        assert_eq!(d.svbs().len(), 2);
        assert_eq!(d.svbs()[1].view_strides(true), &[1, 0]);
        assert_eq!(d.locate(&[3, 0]), Some(1));
        assert_eq!(d.svbs()[1].offset_of(&[3, 0], true), 1);
    }

    #[test]
    fn test_local_offsets_2d() {
        // 4x4, blocks 2x2, grid 2x2: element (3, 1) lives on rank 2 at
        // local (1, 1) of a 2x2 local buffer.
        let a = array(&[4, 4], &[2, 2], &[2, 2]);
        let v = View::whole(&a);
        let d = Decomposition::new(&v);
        let svb = &d.svbs()[d.locate(&[3, 1]).unwrap()];
        assert_eq!(svb.rank, 2);
        assert_eq!(svb.offset_of(&[3, 1], true), 3);
        assert_eq!(svb.offset_of(&[3, 1], false), 3);
        assert!(svb.contains(&[2, 0]));
        assert!(!svb.contains(&[1, 0]));
    }

    fn view_strategy() -> impl Strategy<Value = (Vec<usize>, Vec<usize>, Vec<usize>, Vec<(usize, usize, usize)>)> {
        (1usize..=3)
            .prop_flat_map(|ndims| {
                (
                    prop::collection::vec(1usize..=9, ndims),
                    prop::collection::vec(1usize..=4, ndims),
                    prop::collection::vec(1usize..=3, ndims),
                    prop::collection::vec((0usize..9, 1usize..=3, 1usize..=9), ndims),
                )
            })
            .prop_map(|(dims, blocks, grid, raw)| {
                // Clamp each raw slice into the dimension.
                let slices = raw
                    .into_iter()
                    .zip(dims.iter())
                    .map(|((start, step, nsteps), n)| {
                        let start = start % n;
                        let room = (n - 1 - start) / step + 1;
                        (start, step, nsteps.min(room))
                    })
                    .collect();
                (dims, blocks, grid, slices)
            })
    }

    proptest! {
        #[test]
        fn test_svbs_tile_view((dims, blocks, grid, slices) in view_strategy()) {
            let a = array(&dims, &blocks, &grid);
            let v = View::new(
                a.clone(),
                slices.iter().map(|(s, st, n)| DimSlice::range(*s, *st, *n)).collect(),
            )
            .unwrap();
            let d = Decomposition::new(&v);

            let mut seen = BTreeSet::new();
            let mut total = 0;
            for (ordinal, svb) in d.svbs().iter().enumerate() {
                let cells = covered(&v, svb);
                prop_assert_eq!(cells.len(), svb.nelem);
                for index in cells {
                    // One owner per SVB, and a single base block.
                    prop_assert_eq!(a.partition().owner_of_index(&index), svb.rank);
                    prop_assert!(seen.insert(index));
                    total += 1;
                }
                let first: Vec<usize> = svb.view_start().to_vec();
                prop_assert_eq!(d.locate(&first), Some(ordinal));
            }
            prop_assert_eq!(total, v.nelem());

            let expected: BTreeSet<Vec<usize>> =
                indices(v.shape()).map(|p| v.base_index(&p)).collect();
            prop_assert_eq!(seen, expected);

            // Determinism.
            let again = Decomposition::new(&v);
            let lhs: Vec<(usize, Vec<usize>, Vec<usize>)> =
                d.svbs().iter().map(|s| (s.rank, s.start.clone(), s.nsteps.clone())).collect();
            let rhs: Vec<(usize, Vec<usize>, Vec<usize>)> =
                again.svbs().iter().map(|s| (s.rank, s.start.clone(), s.nsteps.clone())).collect();
            prop_assert_eq!(lhs, rhs);
        }
    }
}
