/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Error taxonomy for the engine.
//!
//! Errors fall in two groups. Errors detected purely from local input
//! (bad slices, shape mismatches, invalid arguments) are returned to
//! the caller before anything is added to the DAG. Errors that may
//! leave distributed state inconsistent are [`FatalError`]s: they
//! terminate the whole process group and are never retried.

use crate::comm::TransportError;

/// Errors produced while building or slicing a view.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ViewError {
    #[error("expected {expected} base dimensions in slice list, got {got}")]
    BaseDims { expected: usize, got: usize },

    #[error(
        "slice out of range in dimension {dim}: start {start}, step {step}, nsteps {nsteps} exceeds extent {extent}"
    )]
    OutOfRange {
        dim: usize,
        start: usize,
        step: usize,
        nsteps: usize,
        extent: usize,
    },

    #[error("index {index} out of range for dimension {dim} of extent {extent}")]
    IndexOutOfRange {
        dim: usize,
        index: usize,
        extent: usize,
    },

    #[error("step must be positive in dimension {dim}")]
    ZeroStep { dim: usize },

    #[error("empty slice in dimension {dim}")]
    Empty { dim: usize },

    #[error("expected {expected} coordinates, got {got}")]
    PointRank { expected: usize, got: usize },
}

/// Unrecoverable errors. Any of these aborts the process group.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FatalError {
    /// Static limits (work buffer, DAG size, tag space) are too small
    /// for the submitted workload.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Internal inconsistency, e.g. a compute callback invoked with
    /// mismatched element counts.
    #[error("logic error: {0}")]
    Logic(String),
}

/// The engine's error type.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    View(#[from] ViewError),

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("invalid argument: {0}")]
    Argument(String),

    #[error("{0} must be set before the first array is created")]
    AlreadyInitialized(&'static str),

    #[error("engine has been shut down")]
    ShutDown,

    #[error("fatal: {0}")]
    Fatal(#[from] FatalError),
}

impl Error {
    /// Whether this error must terminate the process group.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::Fatal(FatalError::Transport(err))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let err: Error = ViewError::ZeroStep { dim: 1 }.into();
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "step must be positive in dimension 1");

        let err: Error = FatalError::Logic("bad".to_string()).into();
        assert!(err.is_fatal());

        let err: Error = TransportError::Closed(3).into();
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            Error::Fatal(FatalError::Transport(TransportError::Closed(3)))
        ));
    }
}
