/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Lazily evaluated distributed arrays.
//!
//! Arrays are cut into blocks and spread block-cyclically over the
//! ranks of an SPMD group. Operations on views of those arrays are not
//! executed when submitted: each is decomposed into sub-view-blocks
//! ([`decompose`]), lowered into operations and transfers ([`lower`]),
//! and appended to a dependency graph ([`dag`]) with read/write hazard
//! edges per base block. A flush ([`scheduler`]) then runs the graph on
//! every rank, overlapping communication with computation.
//!
//! [`Engine`] is the entry point; [`LocalGroup`] runs a program on an
//! in-process group.

/// Array metadata, block-cyclic partitioning and local storage.
pub mod array;

/// Message passing between ranks.
pub mod comm;

/// Engine configuration.
pub mod config;

/// The dependency graph.
pub mod dag;

/// Decomposition of views into sub-view-blocks.
pub mod decompose;

pub mod engine;

/// Per-flush bookkeeping.
pub mod epoch;

pub mod error;

/// In-process groups.
pub mod group;

/// Lowering of operations into DAG fragments.
pub mod lower;

pub mod request;

/// Flush execution.
pub mod scheduler;

/// Test helpers shared by unit and integration tests.
pub mod test_utils;

/// Elementwise functions.
pub mod ufunc;

/// Views of distributed arrays.
pub mod view;

/// Work buffer accounting.
pub mod workbuf;

pub use array::Array;
pub use array::DType;
pub use array::DistributedArray;
pub use config::Config;
pub use engine::Engine;
pub use engine::EngineReport;
pub use error::Error;
pub use error::FatalError;
pub use error::Result;
pub use group::LocalGroup;
pub use lower::Arg;
pub use request::Request;
pub use request::Response;
pub use scheduler::FlushReport;
pub use ufunc::Ufunc;
pub use view::DimSlice;
pub use view::View;
pub use view::ViewRef;
