/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Requests as values.
//!
//! [`Request`] names every submission kind the engine accepts, so a
//! driver can record, forward or replay a program. [`Engine::submit`]
//! dispatches a request to the matching engine call.

use std::fmt;

use crate::array::Array;
use crate::array::DType;
use crate::array::Rank;
use crate::engine::Engine;
use crate::error::Result;
use crate::lower::Arg;
use crate::scheduler::FlushReport;
use crate::ufunc::Ufunc;
use crate::view::DimSlice;
use crate::view::ViewRef;

#[derive(Debug, Clone)]
pub enum Request {
    /// With `onerank` set, the array is stored entirely on that rank.
    CreateArray {
        dtype: DType,
        dims: Vec<usize>,
        onerank: Option<Rank>,
    },
    DestroyArray { array: Array },
    CreateView { array: Array, slices: Vec<DimSlice> },
    PutItem { view: ViewRef, point: Vec<usize>, value: f64 },
    GetItem { view: ViewRef, point: Vec<usize> },
    Apply { ufunc: Ufunc, args: Vec<Arg>, out: ViewRef },
    Reduce { ufunc: Ufunc, view: ViewRef, axes: Vec<usize> },
    Fill { view: ViewRef, value: f64 },
    FillFrom { array: Array, data: Vec<f64> },
    Dump { view: ViewRef },
    Diagonal { view: ViewRef, offset: isize },
    Matmul { a: ViewRef, b: ViewRef },
    Flush,
    CopyInto { dst: ViewRef, src: ViewRef },
    InitBlocksize { blocksize: usize },
    InitPgrid { grid: Vec<usize> },
    Shutdown,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::CreateArray { .. } => "create_array",
            Request::DestroyArray { .. } => "destroy_array",
            Request::CreateView { .. } => "create_view",
            Request::PutItem { .. } => "put_item",
            Request::GetItem { .. } => "get_item",
            Request::Apply { .. } => "apply",
            Request::Reduce { .. } => "reduce",
            Request::Fill { .. } => "fill",
            Request::FillFrom { .. } => "fill_from",
            Request::Dump { .. } => "dump",
            Request::Diagonal { .. } => "diagonal",
            Request::Matmul { .. } => "matmul",
            Request::Flush => "flush",
            Request::CopyInto { .. } => "copy_into",
            Request::InitBlocksize { .. } => "init_blocksize",
            Request::InitPgrid { .. } => "init_pgrid",
            Request::Shutdown => "shutdown",
        }
    }

    /// Whether the request executes pending work before returning.
    pub fn flushes(&self) -> bool {
        matches!(
            self,
            Request::GetItem { .. } | Request::Dump { .. } | Request::Flush | Request::Shutdown
        )
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The result of a request.
#[derive(Debug, Clone)]
pub enum Response {
    Done,
    Array(Array),
    View(ViewRef),
    Value(f64),
    Buffer(Vec<f64>),
    Flushed(FlushReport),
}

impl Response {
    pub fn into_array(self) -> Option<Array> {
        match self {
            Response::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn into_view(self) -> Option<ViewRef> {
        match self {
            Response::View(view) => Some(view),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<f64> {
        match self {
            Response::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_buffer(self) -> Option<Vec<f64>> {
        match self {
            Response::Buffer(buffer) => Some(buffer),
            _ => None,
        }
    }
}

impl Engine {
    /// Run one request.
    pub async fn submit(&mut self, request: Request) -> Result<Response> {
        tracing::trace!(request = %request, "submit");
        Ok(match request {
            Request::CreateArray {
                dtype,
                dims,
                onerank: None,
            } => Response::Array(self.create_array(dtype, &dims)?),
            Request::CreateArray {
                dtype,
                dims,
                onerank: Some(rank),
            } => Response::Array(self.create_array_on_rank(dtype, &dims, rank)?),
            Request::DestroyArray { array } => {
                self.destroy_array(array)?;
                Response::Done
            }
            Request::CreateView { array, slices } => Response::View(self.view(&array, slices)?),
            Request::PutItem { view, point, value } => {
                self.put_item(&view, &point, value).await?;
                Response::Done
            }
            Request::GetItem { view, point } => {
                Response::Value(self.get_item(&view, &point).await?)
            }
            Request::Apply { ufunc, args, out } => {
                self.apply(&ufunc, &args, &out).await?;
                Response::Done
            }
            Request::Reduce { ufunc, view, axes } => {
                Response::Array(self.reduce(&ufunc, &view, &axes).await?)
            }
            Request::Fill { view, value } => {
                self.fill(&view, value).await?;
                Response::Done
            }
            Request::FillFrom { array, data } => {
                self.fill_from(&array, &data).await?;
                Response::Done
            }
            Request::Dump { view } => Response::Buffer(self.dump(&view).await?),
            Request::Diagonal { view, offset } => {
                Response::Array(self.diagonal(&view, offset).await?)
            }
            Request::Matmul { a, b } => Response::Array(self.matmul(&a, &b).await?),
            Request::Flush => Response::Flushed(self.flush().await?),
            Request::CopyInto { dst, src } => {
                self.copy_into(&dst, &src).await?;
                Response::Done
            }
            Request::InitBlocksize { blocksize } => {
                self.init_blocksize(blocksize)?;
                Response::Done
            }
            Request::InitPgrid { grid } => {
                self.init_pgrid(grid)?;
                Response::Done
            }
            Request::Shutdown => {
                self.shutdown().await?;
                Response::Done
            }
        })
    }
}
