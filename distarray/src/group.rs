/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! In-process process groups.
//!
//! [`LocalGroup`] runs an SPMD program with one tokio task per rank,
//! connected by the [`local`](crate::comm::local) transport. The first
//! rank to fail aborts the others.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::comm::local;
use crate::config::Config;
use crate::engine::Engine;
use crate::error::Error;
use crate::error::FatalError;
use crate::error::Result;

/// A group of ranks running in this process.
#[derive(Debug, Clone, Copy)]
pub struct LocalGroup;

impl LocalGroup {
    /// Run `program` on `size` ranks, each with its own [`Engine`].
    /// Returns every rank's result, in rank order, or the first error.
    pub async fn run<F, Fut, T>(size: usize, config: Config, program: F) -> Result<Vec<T>>
    where
        F: Fn(Engine) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if size == 0 {
            return Err(Error::Argument("a group needs at least one rank".to_string()));
        }
        config.validate(size)?;
        let program = Arc::new(program);
        let mut ranks: JoinSet<(usize, Result<T>)> = JoinSet::new();
        for (rank, transport) in local::group(size).into_iter().enumerate() {
            let program = Arc::clone(&program);
            let config = config.clone();
            ranks.spawn(async move {
                let engine = match Engine::new(config, Arc::new(transport)) {
                    Ok(engine) => engine,
                    Err(err) => return (rank, Err(err.into())),
                };
                (rank, program(engine).await)
            });
        }

        let mut results: Vec<Option<T>> = (0..size).map(|_| None).collect();
        while let Some(joined) = ranks.join_next().await {
            let (rank, result) = match joined {
                Ok(joined) => joined,
                Err(err) => {
                    ranks.abort_all();
                    tracing::error!("rank task failed: {}", err);
                    return Err(Error::Fatal(FatalError::Logic(format!(
                        "rank task failed: {}",
                        err
                    ))));
                }
            };
            match result {
                Ok(value) => results[rank] = Some(value),
                Err(err) => {
                    tracing::error!(rank, "rank failed: {}", err);
                    ranks.abort_all();
                    return Err(err);
                }
            }
        }
        results
            .into_iter()
            .enumerate()
            .map(|(rank, value)| {
                value.ok_or_else(|| {
                    Error::Fatal(FatalError::Logic(format!("rank {} produced no result", rank)))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::DType;

    #[tokio::test]
    async fn test_ranks_in_order() {
        let ranks = LocalGroup::run(3, Config::default(), |engine| async move {
            Ok(engine.rank())
        })
        .await
        .unwrap();
        assert_eq!(ranks, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_failure_aborts_group() {
        let err = LocalGroup::run(2, Config::default(), |mut engine| async move {
            if engine.rank() == 1 {
                return Err(Error::Argument("rank 1 gives up".to_string()));
            }
            // Rank 0 would wait forever for rank 1 at the barrier.
            let array = engine.create_array(DType::Float64, &[4])?;
            drop(array);
            engine.shutdown().await?;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
    }

    #[tokio::test]
    async fn test_invalid_config() {
        let config = Config {
            blocksize: 0,
            ..Config::default()
        };
        let err = LocalGroup::run(2, config, |engine| async move { Ok(engine.rank()) })
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
