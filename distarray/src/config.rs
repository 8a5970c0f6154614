/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Configuration for the engine.
//!
//! All limits are fixed when a group starts and never change
//! afterwards; every rank must run with the same configuration, since
//! the lazy-evaluation decisions (forced flushes, tag assignment)
//! depend on them. Values come from defaults, `DISTARRAY_*`
//! environment variables, or a YAML file.

use std::collections::BTreeMap;
use std::env;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;

use crate::error::FatalError;

/// Default block size along every dimension.
pub const DEFAULT_BLOCKSIZE: usize = 2;

/// Default work buffer capacity: 512 MiB.
pub const DEFAULT_WORK_BUFFER_SIZE: usize = 512 * 1024 * 1024;

/// Default work buffer alignment in bytes.
pub const DEFAULT_WORK_BUFFER_ALIGNMENT: usize = 32;

/// Default maximum number of operations in one epoch's DAG.
pub const DEFAULT_MAX_DAG_OPS: usize = 10 * 1024;

/// Messages larger than this (in bytes) skip the buffer pool.
pub const DEFAULT_MAX_MSG_SIZE: usize = 4 * 1024;

/// Default number of staging buffers kept by a [`crate::comm::BufferPool`].
pub const DEFAULT_MAX_MEM_POOL: usize = 10;

/// Below this many elements, compute runs on the calling thread.
pub const DEFAULT_MIN_THREAD_JOBSIZE: usize = 10;

/// Exclusive upper bound on transport tags.
pub const MAX_TAG: u32 = 1 << 20;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Block extent used for arrays created without explicit block dims.
    pub blocksize: usize,
    /// Explicit process grids keyed by number of dimensions. Missing
    /// entries use a balanced factorization of the group size.
    pub pgrid: BTreeMap<usize, Vec<usize>>,
    /// Capacity of the per-epoch work buffer, in bytes.
    pub work_buffer_size: usize,
    /// Work buffer alignment, in bytes. Must be a power of two.
    pub work_buffer_alignment: usize,
    /// Maximum number of operations per epoch.
    pub max_dag_ops: usize,
    /// Unbuffered transfer threshold, in bytes.
    pub max_msg_size: usize,
    /// Number of pooled staging buffers.
    pub max_mem_pool: usize,
    /// Minimum element count for a multi-threaded compute job.
    pub min_thread_jobsize: usize,
    /// Exclusive upper bound on transport tags.
    pub max_tag: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            blocksize: DEFAULT_BLOCKSIZE,
            pgrid: BTreeMap::new(),
            work_buffer_size: DEFAULT_WORK_BUFFER_SIZE,
            work_buffer_alignment: DEFAULT_WORK_BUFFER_ALIGNMENT,
            max_dag_ops: DEFAULT_MAX_DAG_OPS,
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            max_mem_pool: DEFAULT_MAX_MEM_POOL,
            min_thread_jobsize: DEFAULT_MIN_THREAD_JOBSIZE,
            max_tag: MAX_TAG,
        }
    }
}

impl Config {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration using `lookup` to resolve variable names.
    /// Values that fail to parse are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        fn parse<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            name: &str,
        ) -> Option<T> {
            let val = lookup(name)?;
            match val.parse::<T>() {
                Ok(parsed) => Some(parsed),
                Err(_) => {
                    tracing::error!("failed to override config from value \"{}\" in ${}", val, name);
                    None
                }
            }
        }

        if let Some(val) = parse(&lookup, "DISTARRAY_BLOCKSIZE") {
            config.blocksize = val;
        }
        if let Some(val) = parse(&lookup, "DISTARRAY_WORK_BUFFER_SIZE") {
            config.work_buffer_size = val;
        }
        if let Some(val) = parse(&lookup, "DISTARRAY_WORK_BUFFER_ALIGNMENT") {
            config.work_buffer_alignment = val;
        }
        if let Some(val) = parse(&lookup, "DISTARRAY_MAX_DAG_OPS") {
            config.max_dag_ops = val;
        }
        if let Some(val) = parse(&lookup, "DISTARRAY_MAX_MSG_SIZE") {
            config.max_msg_size = val;
        }
        if let Some(val) = parse(&lookup, "DISTARRAY_MAX_MEM_POOL") {
            config.max_mem_pool = val;
        }
        if let Some(val) = parse(&lookup, "DISTARRAY_MIN_THREAD_JOBSIZE") {
            config.min_thread_jobsize = val;
        }

        // Process grid, e.g. "2x2".
        if let Some(val) = lookup("DISTARRAY_PGRID") {
            let grid: Result<Vec<usize>, _> = val.split('x').map(str::parse::<usize>).collect();
            match grid {
                Ok(grid) if !grid.is_empty() => {
                    config.pgrid.insert(grid.len(), grid);
                }
                _ => tracing::error!("failed to parse process grid \"{}\" in $DISTARRAY_PGRID", val),
            }
        }

        config
    }

    /// Load configuration from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), anyhow::Error> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Merge with another configuration. Fields of `other` that differ
    /// from the defaults take precedence.
    pub fn merge(&mut self, other: &Self) {
        let defaults = Self::default();
        if other.blocksize != defaults.blocksize {
            self.blocksize = other.blocksize;
        }
        for (ndims, grid) in &other.pgrid {
            self.pgrid.insert(*ndims, grid.clone());
        }
        if other.work_buffer_size != defaults.work_buffer_size {
            self.work_buffer_size = other.work_buffer_size;
        }
        if other.work_buffer_alignment != defaults.work_buffer_alignment {
            self.work_buffer_alignment = other.work_buffer_alignment;
        }
        if other.max_dag_ops != defaults.max_dag_ops {
            self.max_dag_ops = other.max_dag_ops;
        }
        if other.max_msg_size != defaults.max_msg_size {
            self.max_msg_size = other.max_msg_size;
        }
        if other.max_mem_pool != defaults.max_mem_pool {
            self.max_mem_pool = other.max_mem_pool;
        }
        if other.min_thread_jobsize != defaults.min_thread_jobsize {
            self.min_thread_jobsize = other.min_thread_jobsize;
        }
        if other.max_tag != defaults.max_tag {
            self.max_tag = other.max_tag;
        }
    }

    /// Check the configuration against a group of `nranks` processes.
    pub fn validate(&self, nranks: usize) -> Result<(), FatalError> {
        if self.blocksize == 0 {
            return Err(FatalError::Configuration("blocksize must be positive".into()));
        }
        if !self.work_buffer_alignment.is_power_of_two() {
            return Err(FatalError::Configuration(format!(
                "work buffer alignment {} is not a power of two",
                self.work_buffer_alignment
            )));
        }
        if self.max_dag_ops == 0 {
            return Err(FatalError::Configuration("max_dag_ops must be positive".into()));
        }
        if self.max_tag == 0 || self.max_tag > MAX_TAG {
            return Err(FatalError::Configuration(format!(
                "max_tag {} must be in 1..={}",
                self.max_tag, MAX_TAG
            )));
        }
        for (ndims, grid) in &self.pgrid {
            validate_grid(*ndims, grid, nranks)?;
        }
        Ok(())
    }

    /// The process grid used for `ndims`-dimensional arrays in a group
    /// of `nranks` processes.
    pub fn grid_for(&self, ndims: usize, nranks: usize) -> Vec<usize> {
        match self.pgrid.get(&ndims) {
            Some(grid) => grid.clone(),
            None => balanced_grid(ndims, nranks),
        }
    }
}

/// Check that `grid` describes a usable `ndims`-dimensional grid over
/// at most `nranks` processes.
pub(crate) fn validate_grid(ndims: usize, grid: &[usize], nranks: usize) -> Result<(), FatalError> {
    if grid.len() != ndims {
        return Err(FatalError::Configuration(format!(
            "process grid {:?} does not have {} dimensions",
            grid, ndims
        )));
    }
    if grid.contains(&0) {
        return Err(FatalError::Configuration(format!(
            "process grid {:?} has an empty dimension",
            grid
        )));
    }
    let size: usize = grid.iter().product();
    if size > nranks {
        return Err(FatalError::Configuration(format!(
            "process grid {:?} needs {} ranks, group has {}",
            grid, size, nranks
        )));
    }
    Ok(())
}

/// Factor `nranks` into an `ndims`-dimensional grid whose extents are
/// as close to each other as possible, largest first.
pub fn balanced_grid(ndims: usize, nranks: usize) -> Vec<usize> {
    if ndims == 0 {
        return Vec::new();
    }
    let mut factors = Vec::new();
    let mut n = nranks.max(1);
    let mut p = 2;
    while p * p <= n {
        while n % p == 0 {
            factors.push(p);
            n /= p;
        }
        p += 1;
    }
    if n > 1 {
        factors.push(n);
    }
    let mut grid = vec![1; ndims];
    for factor in factors.into_iter().rev() {
        // Give each factor to the currently smallest extent; ties go to
        // the lowest dimension.
        if let Some((smallest, _)) = grid
            .iter()
            .enumerate()
            .min_by_key(|(i, extent)| (**extent, *i))
        {
            grid[smallest] *= factor;
        }
    }
    grid.sort_unstable_by(|a, b| b.cmp(a));
    grid
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.blocksize, 2);
        assert_eq!(config.work_buffer_size, 512 * 1024 * 1024);
        assert_eq!(config.work_buffer_alignment, 32);
        assert_eq!(config.max_msg_size, 4096);
        assert_eq!(config.max_mem_pool, 10);
        assert_eq!(config.max_tag, 1_048_576);
        config.validate(4).unwrap();
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("DISTARRAY_BLOCKSIZE", "8"),
            ("DISTARRAY_MAX_DAG_OPS", "not a number"),
            ("DISTARRAY_MAX_MSG_SIZE", "128"),
            ("DISTARRAY_PGRID", "2x3"),
        ]
        .into_iter()
        .collect();
        let config = Config::from_lookup(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.blocksize, 8);
        assert_eq!(config.max_dag_ops, DEFAULT_MAX_DAG_OPS);
        assert_eq!(config.max_msg_size, 128);
        assert_eq!(config.pgrid.get(&2), Some(&vec![2, 3]));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = Config::default();
        config.blocksize = 4;
        config.pgrid.insert(2, vec![2, 2]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("distarray.yaml");
        config.to_yaml(&path).unwrap();
        assert_eq!(Config::from_yaml(&path).unwrap(), config);
    }

    #[test]
    fn test_yaml_partial() {
        let config: Config = serde_yaml::from_str("blocksize: 16\n").unwrap();
        assert_eq!(config.blocksize, 16);
        assert_eq!(config.max_mem_pool, DEFAULT_MAX_MEM_POOL);
    }

    #[test]
    fn test_merge() {
        let mut base = Config::default();
        base.max_dag_ops = 7;
        let mut other = Config::default();
        other.blocksize = 3;
        base.merge(&other);
        assert_eq!(base.blocksize, 3);
        assert_eq!(base.max_dag_ops, 7);
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        config.work_buffer_alignment = 24;
        assert!(config.validate(1).is_err());

        let mut config = Config::default();
        config.pgrid.insert(2, vec![2, 3]);
        assert!(config.validate(4).is_err());
        config.validate(6).unwrap();

        let mut config = Config::default();
        config.max_tag = MAX_TAG + 1;
        assert!(config.validate(1).is_err());
    }

    #[test]
    fn test_balanced_grid() {
        assert_eq!(balanced_grid(1, 4), vec![4]);
        assert_eq!(balanced_grid(2, 4), vec![2, 2]);
        assert_eq!(balanced_grid(2, 6), vec![3, 2]);
        assert_eq!(balanced_grid(3, 8), vec![2, 2, 2]);
        assert_eq!(balanced_grid(2, 7), vec![7, 1]);
        assert_eq!(balanced_grid(0, 4), Vec::<usize>::new());
        assert_eq!(balanced_grid(2, 1), vec![1, 1]);
    }
}
