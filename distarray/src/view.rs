/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Views: rectangular windows onto a distributed array.
//!
//! A [`View`] holds one slice per entry of its slice list. `Range`
//! and `Single` slices consume a base dimension in order; `Pseudo`
//! slices insert an extra dimension of extent one. The viewable
//! dimensions of a view are its `Range` and `Pseudo` slices, so
//! `nslice >= base.ndims()` always holds.
//!
//! ```
//! # use std::sync::Arc;
//! # use distarray::array::{ArrayId, DType, DistributedArray, Partition};
//! # use distarray::view::{DimSlice, View};
//! let p = Partition::new(vec![8, 6], vec![2, 2], vec![1, 1]);
//! let a = Arc::new(DistributedArray::new(ArrayId(0), DType::Float64, p, 0));
//! // a[1:7:2, 3]
//! let v = View::new(a, vec![DimSlice::range(1, 2, 3), DimSlice::Single(3)]).unwrap();
//! assert_eq!(v.shape(), &[3]);
//! ```

use std::fmt;
use std::ops::BitOr;
use std::ops::BitOrAssign;
use std::sync::Arc;

use crate::array::Array;
use crate::error::ViewError;

/// One entry of a view's slice list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DimSlice {
    /// `nsteps` indices starting at `start`, `step` apart.
    Range {
        start: usize,
        step: usize,
        nsteps: usize,
    },
    /// A single index; the dimension is not visible in the view.
    Single(usize),
    /// A new dimension of extent one ('newaxis').
    Pseudo,
}

impl DimSlice {
    pub fn range(start: usize, step: usize, nsteps: usize) -> Self {
        DimSlice::Range {
            start,
            step,
            nsteps,
        }
    }

    /// The whole of a dimension of extent `n`.
    pub fn full(n: usize) -> Self {
        DimSlice::range(0, 1, n)
    }

    /// Whether this slice is a dimension of the view.
    pub fn is_viewable(&self) -> bool {
        !matches!(self, DimSlice::Single(_))
    }

    /// Whether this slice consumes a dimension of the base array.
    pub fn is_base(&self) -> bool {
        !matches!(self, DimSlice::Pseudo)
    }

    fn extent(&self) -> usize {
        match self {
            DimSlice::Range { nsteps, .. } => *nsteps,
            DimSlice::Single(_) | DimSlice::Pseudo => 1,
        }
    }
}

/// Bit mask of the ways a view differs from its base array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Alterations(u8);

impl Alterations {
    /// No alterations.
    pub const NONE: Self = Self(0);
    /// Number of dimensions altered.
    pub const NDIMS: Self = Self(0x1);
    /// A step other than one.
    pub const STEP: Self = Self(0x2);
    /// A dimension does not cover its whole base extent.
    pub const NSTEPS: Self = Self(0x4);
    /// A start off a block boundary, or a step other than one.
    pub const NONALIGNED: Self = Self(0x8);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Alterations {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Alterations {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A rectangular, possibly strided, possibly rank-changing window onto
/// a distributed array.
pub struct View {
    base: Array,
    slices: Vec<DimSlice>,
    alterations: Alterations,
    shape: Vec<usize>,
    block_extent: Vec<usize>,
    blockdims: Vec<usize>,
}

/// Shared handle to a view.
pub type ViewRef = Arc<View>;

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("base", &self.base.id())
            .field("slices", &self.slices)
            .field("alterations", &self.alterations)
            .field("shape", &self.shape)
            .finish()
    }
}

/// Whether `start + step * (nsteps - 1)` is a valid index below `extent`.
fn fits_extent(start: usize, step: usize, nsteps: usize, extent: usize) -> bool {
    step.checked_mul(nsteps.saturating_sub(1))
        .and_then(|span| span.checked_add(start))
        .is_some_and(|last| last < extent)
}

impl View {
    /// Create a view of `base` described by `slices`, expressed in the
    /// base array's global index space.
    pub fn new(base: Array, slices: Vec<DimSlice>) -> Result<Self, ViewError> {
        let nbase = slices.iter().filter(|s| s.is_base()).count();
        if nbase != base.ndims() {
            return Err(ViewError::BaseDims {
                expected: base.ndims(),
                got: nbase,
            });
        }

        let mut alterations = Alterations::NONE;
        let mut shape = Vec::new();
        let mut block_extent = Vec::new();
        let mut d = 0;
        for slice in &slices {
            match *slice {
                DimSlice::Range {
                    start,
                    step,
                    nsteps,
                } => {
                    let extent = base.dims()[d];
                    if step == 0 {
                        return Err(ViewError::ZeroStep { dim: d });
                    }
                    if nsteps == 0 {
                        return Err(ViewError::Empty { dim: d });
                    }
                    if !fits_extent(start, step, nsteps, extent) {
                        return Err(ViewError::OutOfRange {
                            dim: d,
                            start,
                            step,
                            nsteps,
                            extent,
                        });
                    }
                    let bs = base.blockdims()[d];
                    if step != 1 {
                        alterations |= Alterations::STEP | Alterations::NONALIGNED;
                    }
                    if start % bs != 0 {
                        alterations |= Alterations::NONALIGNED;
                    }
                    if nsteps != extent {
                        alterations |= Alterations::NSTEPS;
                    }
                    shape.push(nsteps);
                    block_extent.push(bs);
                    d += 1;
                }
                DimSlice::Single(index) => {
                    let extent = base.dims()[d];
                    if index >= extent {
                        return Err(ViewError::IndexOutOfRange {
                            dim: d,
                            index,
                            extent,
                        });
                    }
                    alterations |= Alterations::NDIMS;
                    d += 1;
                }
                DimSlice::Pseudo => {
                    alterations |= Alterations::NDIMS;
                    shape.push(1);
                    block_extent.push(1);
                }
            }
        }
        let blockdims = shape
            .iter()
            .zip(block_extent.iter())
            .map(|(n, bs)| n.div_ceil(*bs))
            .collect();

        Ok(Self {
            base,
            slices,
            alterations,
            shape,
            block_extent,
            blockdims,
        })
    }

    /// A view covering the whole of `base`.
    pub fn whole(base: &Array) -> Self {
        let slices = base.dims().iter().map(|n| DimSlice::full(*n)).collect();
        match Self::new(base.clone(), slices) {
            Ok(view) => view,
            Err(err) => unreachable!("full slices are always valid: {}", err),
        }
    }

    /// Slice this view further. `slices` is expressed in this view's
    /// coordinates: one non-`Pseudo` entry per viewable dimension, with
    /// `Pseudo` entries inserting new dimensions.
    pub fn slice(&self, slices: &[DimSlice]) -> Result<Self, ViewError> {
        let nsub = slices.iter().filter(|s| s.is_base()).count();
        if nsub != self.ndims() {
            return Err(ViewError::BaseDims {
                expected: self.ndims(),
                got: nsub,
            });
        }

        let mut composed = Vec::with_capacity(self.slices.len() + slices.len());
        let mut own = self.slices.iter().peekable();
        let mut vdim = 0;
        for sub in slices {
            if *sub == DimSlice::Pseudo {
                composed.push(DimSlice::Pseudo);
                continue;
            }
            // Carry over base dimensions hidden from this view.
            while let Some(DimSlice::Single(index)) = own.peek() {
                composed.push(DimSlice::Single(*index));
                own.next();
            }
            let Some(outer) = own.next() else {
                unreachable!("viewable slice count checked above");
            };
            let extent = outer.extent();
            match *sub {
                DimSlice::Range {
                    start,
                    step,
                    nsteps,
                } => {
                    if step == 0 {
                        return Err(ViewError::ZeroStep { dim: vdim });
                    }
                    if nsteps == 0 {
                        return Err(ViewError::Empty { dim: vdim });
                    }
                    if !fits_extent(start, step, nsteps, extent) {
                        return Err(ViewError::OutOfRange {
                            dim: vdim,
                            start,
                            step,
                            nsteps,
                            extent,
                        });
                    }
                    composed.push(match *outer {
                        DimSlice::Range {
                            start: s, step: st, ..
                        } => {
                            // Overflow needs nsteps == 1, where the stride is unused.
                            let step = st.checked_mul(step).unwrap_or(1);
                            DimSlice::range(s + st * start, step, nsteps)
                        }
                        _ => DimSlice::Pseudo,
                    });
                }
                DimSlice::Single(index) => {
                    if index >= extent {
                        return Err(ViewError::IndexOutOfRange {
                            dim: vdim,
                            index,
                            extent,
                        });
                    }
                    // A single index into a pseudo dimension removes it.
                    if let DimSlice::Range { start: s, step: st, .. } = *outer {
                        composed.push(DimSlice::Single(s + st * index));
                    }
                }
                DimSlice::Pseudo => unreachable!(),
            }
            vdim += 1;
        }
        composed.extend(own.copied());
        Self::new(self.base.clone(), composed)
    }

    /// A view of the single element at `point` (in view coordinates).
    pub fn element(&self, point: &[usize]) -> Result<Self, ViewError> {
        if point.len() != self.ndims() {
            return Err(ViewError::PointRank {
                expected: self.ndims(),
                got: point.len(),
            });
        }
        let slices: Vec<DimSlice> = point.iter().map(|i| DimSlice::Single(*i)).collect();
        self.slice(&slices)
    }

    pub fn base(&self) -> &Array {
        &self.base
    }

    pub fn slices(&self) -> &[DimSlice] {
        &self.slices
    }

    pub fn nslice(&self) -> usize {
        self.slices.len()
    }

    /// Number of viewable dimensions.
    pub fn ndims(&self) -> usize {
        self.shape.len()
    }

    /// Extent of each viewable dimension.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements in the view.
    pub fn nelem(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn alterations(&self) -> Alterations {
        self.alterations
    }

    /// View-block extent along each viewable dimension.
    pub fn block_extent(&self) -> &[usize] {
        &self.block_extent
    }

    /// Number of view-blocks along each viewable dimension.
    pub fn blockdims(&self) -> &[usize] {
        &self.blockdims
    }

    /// Total number of view-blocks.
    pub fn nblocks(&self) -> usize {
        self.blockdims.iter().product()
    }

    /// Whether the view covers its base array exactly.
    pub fn is_whole(&self) -> bool {
        self.alterations.is_empty()
    }

    /// Whether `self` and `other` select the same elements of the same
    /// array.
    pub fn same_as(&self, other: &View) -> bool {
        Arc::ptr_eq(&self.base, &other.base) && self.slices == other.slices
    }

    /// Global index of the element at `point` (in view coordinates).
    pub fn base_index(&self, point: &[usize]) -> Vec<usize> {
        let mut index = Vec::with_capacity(self.base.ndims());
        let mut vdim = 0;
        for slice in &self.slices {
            match *slice {
                DimSlice::Range { start, step, .. } => {
                    index.push(start + step * point[vdim]);
                    vdim += 1;
                }
                DimSlice::Single(i) => index.push(i),
                DimSlice::Pseudo => vdim += 1,
            }
        }
        index
    }
}
