/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Distributed arrays and their block-cyclic partition.
//!
//! A [`DistributedArray`] describes one logical N-dimensional array.
//! Its global index space is cut into blocks of `blockdims`, and the
//! blocks are dealt cyclically over a process grid: block `b` along
//! dimension `d` lives on grid coordinate `b % pgrid[d]`. Each rank
//! stores the blocks it owns packed row-major in a local buffer of
//! shape `localdims`.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use parking_lot::RwLockReadGuard;
use parking_lot::RwLockWriteGuard;
use serde::Deserialize;
use serde::Serialize;

/// Index of a process in the group.
pub type Rank = usize;

/// Element type of an array.
///
/// Elements are held in `f64` lanes. Writes are normalised to the
/// array's type, and the type's element size is what communication
/// offsets and message-size decisions are expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    Float64,
    Float32,
    Int64,
    Int32,
    Bool,
}

impl DType {
    /// Size of one element in bytes.
    pub fn elsize(self) -> usize {
        match self {
            DType::Float64 | DType::Int64 => 8,
            DType::Float32 | DType::Int32 => 4,
            DType::Bool => 1,
        }
    }

    /// Normalise `value` to this element type.
    pub fn normalize(self, value: f64) -> f64 {
        match self {
            DType::Float64 => value,
            DType::Float32 => value as f32 as f64,
            DType::Int64 => value.trunc(),
            DType::Int32 => (value as i32) as f64,
            DType::Bool => {
                if value != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// Unique identification of an array within a group. Every rank
/// assigns the same id to the same logical array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArrayId(pub u64);

impl fmt::Display for ArrayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "array#{}", self.0)
    }
}

/// Row-major strides for `dims`.
pub fn row_major_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1;
    for (stride, dim) in strides.iter_mut().zip(dims.iter()).rev() {
        *stride = acc;
        acc *= *dim;
    }
    strides
}

/// Block-cyclic partition of a global index space over a process grid.
/// Pure geometry: identical on every rank.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    dims: Vec<usize>,
    blockdims: Vec<usize>,
    pgrid: Vec<usize>,
    /// When set, every block lives on this rank.
    #[serde(default)]
    onerank: Option<Rank>,
}

impl Partition {
    /// Create a partition. `dims`, `blockdims` and `pgrid` must have the
    /// same length and only positive entries.
    pub fn new(dims: Vec<usize>, blockdims: Vec<usize>, pgrid: Vec<usize>) -> Self {
        debug_assert_eq!(dims.len(), blockdims.len());
        debug_assert_eq!(dims.len(), pgrid.len());
        Self {
            dims,
            blockdims,
            pgrid,
            onerank: None,
        }
    }

    /// A partition placing the whole array on `rank`. Other ranks hold
    /// no local storage for it.
    pub fn on_rank(dims: Vec<usize>, blockdims: Vec<usize>, rank: Rank) -> Self {
        debug_assert_eq!(dims.len(), blockdims.len());
        let pgrid = vec![1; dims.len()];
        Self {
            dims,
            blockdims,
            pgrid,
            onerank: Some(rank),
        }
    }

    /// The single rank holding the array, if it is not distributed.
    pub fn onerank(&self) -> Option<Rank> {
        self.onerank
    }

    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn blockdims(&self) -> &[usize] {
        &self.blockdims
    }

    pub fn pgrid(&self) -> &[usize] {
        &self.pgrid
    }

    /// Number of ranks that own data.
    pub fn grid_size(&self) -> usize {
        self.pgrid.iter().product()
    }

    /// Number of blocks along dimension `d`.
    pub fn blocks_in_dim(&self, d: usize) -> usize {
        self.dims[d].div_ceil(self.blockdims[d])
    }

    /// Total number of blocks.
    pub fn nblocks(&self) -> usize {
        (0..self.ndims()).map(|d| self.blocks_in_dim(d)).product()
    }

    /// Number of elements in block `b` along dimension `d`.
    pub fn block_len(&self, d: usize, b: usize) -> usize {
        let begin = b * self.blockdims[d];
        self.blockdims[d].min(self.dims[d] - begin)
    }

    /// Row-major flat index of a block coordinate.
    pub fn flat_block(&self, block: &[usize]) -> usize {
        block
            .iter()
            .enumerate()
            .fold(0, |acc, (d, b)| acc * self.blocks_in_dim(d) + b)
    }

    /// Grid coordinates of `rank`, or `None` if the rank owns nothing.
    pub fn grid_coords(&self, rank: Rank) -> Option<Vec<usize>> {
        if let Some(onerank) = self.onerank {
            return (rank == onerank).then(|| vec![0; self.ndims()]);
        }
        if rank >= self.grid_size() {
            return None;
        }
        let mut coords = vec![0; self.ndims()];
        let mut rest = rank;
        for d in (0..self.ndims()).rev() {
            coords[d] = rest % self.pgrid[d];
            rest /= self.pgrid[d];
        }
        Some(coords)
    }

    /// The rank owning the block at `block`.
    pub fn owner_of_block(&self, block: &[usize]) -> Rank {
        if let Some(onerank) = self.onerank {
            return onerank;
        }
        block
            .iter()
            .enumerate()
            .fold(0, |acc, (d, b)| acc * self.pgrid[d] + b % self.pgrid[d])
    }

    /// The rank owning global element `index`.
    pub fn owner_of_index(&self, index: &[usize]) -> Rank {
        let block: Vec<usize> = index
            .iter()
            .enumerate()
            .map(|(d, i)| i / self.blockdims[d])
            .collect();
        self.owner_of_block(&block)
    }

    /// Shape of the local storage on `rank`.
    pub fn local_dims(&self, rank: Rank) -> Vec<usize> {
        let Some(coords) = self.grid_coords(rank) else {
            return vec![0; self.ndims()];
        };
        (0..self.ndims())
            .map(|d| {
                (coords[d]..self.blocks_in_dim(d))
                    .step_by(self.pgrid[d])
                    .map(|b| self.block_len(d, b))
                    .sum()
            })
            .collect()
    }

    /// Number of elements stored on `rank`.
    pub fn local_size(&self, rank: Rank) -> usize {
        match self.grid_coords(rank) {
            Some(_) => self.local_dims(rank).iter().product(),
            None => 0,
        }
    }

    /// Position of global index `g` along dimension `d` in its owner's
    /// local storage.
    pub fn local_index(&self, d: usize, g: usize) -> usize {
        let bs = self.blockdims[d];
        (g / bs / self.pgrid[d]) * bs + g % bs
    }

    /// Global index along dimension `d` of local index `l` on grid
    /// coordinate `coord`.
    pub fn global_index(&self, d: usize, coord: usize, l: usize) -> usize {
        let bs = self.blockdims[d];
        ((l / bs) * self.pgrid[d] + coord) * bs + l % bs
    }
}

/// A distributed N-dimensional array, as seen from one rank.
pub struct DistributedArray {
    id: ArrayId,
    dtype: DType,
    partition: Partition,
    rank: Rank,
    localdims: Vec<usize>,
    data: RwLock<Vec<f64>>,
}

/// Shared handle to a distributed array. The local buffer is released
/// when the last handle is dropped.
pub type Array = Arc<DistributedArray>;

impl fmt::Debug for DistributedArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedArray")
            .field("id", &self.id)
            .field("dtype", &self.dtype)
            .field("dims", &self.partition.dims)
            .field("blockdims", &self.partition.blockdims)
            .field("pgrid", &self.partition.pgrid)
            .field("rank", &self.rank)
            .field("localdims", &self.localdims)
            .finish()
    }
}

impl DistributedArray {
    /// Create the local part of an array on `rank`, zero filled.
    pub fn new(id: ArrayId, dtype: DType, partition: Partition, rank: Rank) -> Self {
        let localdims = partition.local_dims(rank);
        let localsize = partition.local_size(rank);
        Self {
            id,
            dtype,
            partition,
            rank,
            localdims,
            data: RwLock::new(vec![0.0; localsize]),
        }
    }

    pub fn id(&self) -> ArrayId {
        self.id
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn elsize(&self) -> usize {
        self.dtype.elsize()
    }

    pub fn ndims(&self) -> usize {
        self.partition.ndims()
    }

    pub fn dims(&self) -> &[usize] {
        self.partition.dims()
    }

    pub fn blockdims(&self) -> &[usize] {
        self.partition.blockdims()
    }

    pub fn nblocks(&self) -> usize {
        self.partition.nblocks()
    }

    /// Total number of elements in the global array.
    pub fn size(&self) -> usize {
        self.dims().iter().product()
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// The rank this local part belongs to.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn localdims(&self) -> &[usize] {
        &self.localdims
    }

    pub fn localsize(&self) -> usize {
        self.data.read().len()
    }

    /// Number of live handles to `this`.
    pub fn refcount(this: &Array) -> usize {
        Arc::strong_count(this)
    }

    /// Snapshot of the local buffer.
    pub fn local_data(&self) -> Vec<f64> {
        self.data.read().clone()
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Vec<f64>> {
        self.data.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Vec<f64>> {
        self.data.write()
    }
}
