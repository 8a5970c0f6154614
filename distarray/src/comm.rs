/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Communication layer.
//!
//! Communication operations are bound to point-to-point messages
//! through a [`Transport`]. Every rank derives the same tag for the
//! same logical transfer from its position in the epoch, so no
//! handshake is needed. Small messages are staged through a bounded
//! [`BufferPool`]; messages above the configured size go out
//! unbuffered, straight from the packed data.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::array::Rank;
use crate::config::Config;
use crate::dag::MAX_OPERANDS;
use crate::error::FatalError;

pub mod local;

/// A transport message tag.
pub type Tag = u32;

/// Tag reserved for group barriers; never produced by [`derive_tag`].
pub const BARRIER_TAG: Tag = u32::MAX;

/// Errors raised by a transport. All of them are fatal to the group.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("channel of rank {0} closed")]
    Closed(Rank),

    #[error("peer rank {peer} out of range for group of {size}")]
    PeerOutOfRange { peer: Rank, size: usize },
}

/// The tag of the transfer at `position` (its ordinal among the
/// epoch's transfers) moving the operand in `slot`. Always below
/// `max_tag`.
pub fn derive_tag(position: usize, slot: usize, max_tag: u32) -> Tag {
    ((position * MAX_OPERANDS + slot % MAX_OPERANDS) % max_tag as usize) as Tag
}

/// Number of transfers one epoch may hold before tags would repeat.
pub fn tag_capacity(max_tag: u32) -> usize {
    (max_tag as usize / MAX_OPERANDS).max(1)
}

/// A message as delivered by a transport.
#[derive(Debug)]
pub struct Envelope {
    pub src: Rank,
    pub tag: Tag,
    /// Whether the payload is a pooled staging buffer.
    pub buffered: bool,
    pub payload: Vec<f64>,
}

/// Point-to-point messaging between the ranks of a group.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// This process's rank.
    fn rank(&self) -> Rank;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Send `payload` to `dest`. Returns once the message is handed to
    /// the transport.
    async fn send(
        &self,
        dest: Rank,
        tag: Tag,
        buffered: bool,
        payload: Vec<f64>,
    ) -> Result<(), TransportError>;

    /// Wait until a message matching any `(source, tag)` pair in
    /// `wanted` arrives. Returns the index of the matched pair. Messages
    /// from one source with one tag are delivered in send order.
    async fn recv_any(&self, wanted: &[(Rank, Tag)]) -> Result<(usize, Envelope), TransportError>;

    /// Block until every rank has entered the barrier.
    async fn barrier(&self) -> Result<(), TransportError> {
        let root = 0;
        if self.rank() == root {
            for peer in 1..self.size() {
                self.recv_any(&[(peer, BARRIER_TAG)]).await?;
            }
            for peer in 1..self.size() {
                self.send(peer, BARRIER_TAG, false, Vec::new()).await?;
            }
        } else {
            self.send(root, BARRIER_TAG, false, Vec::new()).await?;
            self.recv_any(&[(root, BARRIER_TAG)]).await?;
        }
        Ok(())
    }
}

/// A bounded pool of staging buffers.
#[derive(Debug)]
pub struct BufferPool {
    free: Vec<Vec<f64>>,
    capacity: usize,
    reused: usize,
    allocated: usize,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Vec::with_capacity(capacity),
            capacity,
            reused: 0,
            allocated: 0,
        }
    }

    /// An empty buffer able to hold `len` elements.
    pub fn take(&mut self, len: usize) -> Vec<f64> {
        match self.free.pop() {
            Some(mut buf) => {
                self.reused += 1;
                buf.clear();
                buf.reserve(len);
                buf
            }
            None => {
                self.allocated += 1;
                Vec::with_capacity(len)
            }
        }
    }

    /// Return a buffer. Buffers beyond the pool's capacity are freed.
    pub fn give(&mut self, buf: Vec<f64>) {
        if self.free.len() < self.capacity {
            self.free.push(buf);
        }
    }

    /// Number of idle buffers.
    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    pub fn reused(&self) -> usize {
        self.reused
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }
}

/// Message counters of one rank.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommStats {
    pub sends: usize,
    pub recvs: usize,
    pub buffered: usize,
    pub unbuffered: usize,
    pub bytes_sent: usize,
}

/// Binds communication operations to transport messages.
#[derive(Debug)]
pub struct Comm {
    transport: Arc<dyn Transport>,
    pool: BufferPool,
    max_msg_size: usize,
    stats: CommStats,
}

impl Comm {
    pub fn new(transport: Arc<dyn Transport>, config: &Config) -> Self {
        Self {
            transport,
            pool: BufferPool::new(config.max_mem_pool),
            max_msg_size: config.max_msg_size,
            stats: CommStats::default(),
        }
    }

    pub fn rank(&self) -> Rank {
        self.transport.rank()
    }

    pub fn size(&self) -> usize {
        self.transport.size()
    }

    pub fn stats(&self) -> CommStats {
        self.stats
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Send `nelem` elements of `elsize` bytes to `peer`. `pack` fills
    /// the outgoing buffer.
    pub async fn send(
        &mut self,
        peer: Rank,
        tag: Tag,
        nelem: usize,
        elsize: usize,
        pack: impl FnOnce(&mut Vec<f64>),
    ) -> Result<(), FatalError> {
        if peer >= self.size() {
            return Err(TransportError::PeerOutOfRange {
                peer,
                size: self.size(),
            }
            .into());
        }
        let bytes = nelem * elsize;
        let buffered = bytes <= self.max_msg_size;
        let mut payload = if buffered {
            self.pool.take(nelem)
        } else {
            Vec::with_capacity(nelem)
        };
        pack(&mut payload);
        if payload.len() != nelem {
            return Err(FatalError::Logic(format!(
                "packed {} elements for a transfer of {}",
                payload.len(),
                nelem
            )));
        }
        tracing::trace!(peer, tag, nelem, buffered, "send");
        self.transport.send(peer, tag, buffered, payload).await?;
        self.stats.sends += 1;
        self.stats.bytes_sent += bytes;
        if buffered {
            self.stats.buffered += 1;
        } else {
            self.stats.unbuffered += 1;
        }
        Ok(())
    }

    /// Wait for any of the `posted` receives. Returns the index of the
    /// completed receive and its data.
    pub async fn wait_any(&mut self, posted: &[(Rank, Tag)]) -> Result<(usize, Vec<f64>), FatalError> {
        let (index, envelope) = self.transport.recv_any(posted).await?;
        self.stats.recvs += 1;
        tracing::trace!(
            src = envelope.src,
            tag = envelope.tag,
            nelem = envelope.payload.len(),
            buffered = envelope.buffered,
            "recv"
        );
        Ok((index, envelope.payload))
    }

    /// Return buffers whose contents are no longer needed. Buffers too
    /// large to be sent buffered are freed.
    pub fn recycle(&mut self, buffers: impl IntoIterator<Item = Vec<f64>>) {
        for buf in buffers {
            if buf.capacity() * std::mem::size_of::<f64>() <= self.max_msg_size {
                self.pool.give(buf);
            }
        }
    }

    /// Block until every rank has reached the barrier.
    pub async fn barrier(&self) -> Result<(), FatalError> {
        Ok(self.transport.barrier().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_tag() {
        let max = crate::config::MAX_TAG;
        assert_eq!(derive_tag(0, 0, max), 0);
        assert_eq!(derive_tag(1, 2, max), MAX_OPERANDS as Tag + 2);
        assert!(derive_tag(usize::MAX / 64, 31, max) < max);
        // Distinct within capacity.
        let cap = tag_capacity(64);
        let tags: std::collections::BTreeSet<Tag> =
            (0..cap).flat_map(|p| (0..MAX_OPERANDS).map(move |s| derive_tag(p, s, 64))).collect();
        assert_eq!(tags.len(), cap * MAX_OPERANDS);
    }

    #[test]
    fn test_buffer_pool() {
        let mut pool = BufferPool::new(2);
        let a = pool.take(4);
        let b = pool.take(4);
        let c = pool.take(4);
        assert_eq!(pool.allocated(), 3);
        pool.give(a);
        pool.give(b);
        pool.give(c);
        assert_eq!(pool.len(), 2);
        let d = pool.take(8);
        assert!(d.is_empty());
        assert!(d.capacity() >= 8);
        assert_eq!(pool.reused(), 1);
    }

    #[tokio::test]
    async fn test_buffered_and_unbuffered() {
        let mut config = Config::default();
        config.max_msg_size = 32;
        let mut transports = local::group(2).into_iter();
        let mut a = Comm::new(Arc::new(transports.next().unwrap()), &config);
        let mut b = Comm::new(Arc::new(transports.next().unwrap()), &config);

        a.send(1, 7, 4, 8, |buf| buf.extend([1.0, 2.0, 3.0, 4.0]))
            .await
            .unwrap();
        a.send(1, 8, 5, 8, |buf| buf.extend([0.0; 5])).await.unwrap();
        assert_eq!(a.stats().buffered, 1);
        assert_eq!(a.stats().unbuffered, 1);

        let (index, data) = b.wait_any(&[(0, 8), (0, 7)]).await.unwrap();
        // Whichever of the two is found first, it must match its tag.
        match index {
            0 => assert_eq!(data, vec![0.0; 5]),
            _ => assert_eq!(data, vec![1.0, 2.0, 3.0, 4.0]),
        }
        let (_, other) = b.wait_any(&[(0, 8), (0, 7)]).await.unwrap();
        assert_eq!(b.stats().recvs, 2);
        // Received payloads are handed over, not copied into the pool.
        assert!(b.pool().is_empty());

        b.recycle([data, other]);
        assert_eq!(b.pool().len(), 1);
        let buf = b.pool.take(4);
        assert!(buf.is_empty() && buf.capacity() >= 4);
        assert_eq!(b.pool().reused(), 1);
    }

    #[tokio::test]
    async fn test_pack_mismatch_is_fatal() {
        let config = Config::default();
        let transport = local::group(1).pop().unwrap();
        let mut comm = Comm::new(Arc::new(transport), &config);
        let err = comm.send(0, 0, 3, 8, |buf| buf.push(1.0)).await.unwrap_err();
        assert!(matches!(err, FatalError::Logic(_)));
        let err = comm.send(4, 0, 1, 8, |buf| buf.push(1.0)).await.unwrap_err();
        assert!(matches!(
            err,
            FatalError::Transport(TransportError::PeerOutOfRange { peer: 4, size: 1 })
        ));
    }
}
