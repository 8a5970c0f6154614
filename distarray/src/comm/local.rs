/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Local (in-process) transport.
//!
//! Each rank owns one unbounded channel; peers hold its sending end.
//! Messages that arrive before they are asked for are stashed per
//! `(source, tag)` in arrival order.

use std::collections::HashMap;
use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

use super::*;

/// Create the transports of an in-process group of `size` ranks.
pub fn group(size: usize) -> Vec<LocalTransport> {
    let (senders, receivers): (Vec<_>, Vec<_>) =
        (0..size).map(|_| mpsc::unbounded_channel::<Envelope>()).unzip();
    receivers
        .into_iter()
        .enumerate()
        .map(|(rank, rx)| LocalTransport {
            rank,
            peers: senders.clone(),
            inbox: Mutex::new(Inbox {
                rx,
                stash: HashMap::new(),
            }),
        })
        .collect()
}

#[derive(Debug)]
struct Inbox {
    rx: mpsc::UnboundedReceiver<Envelope>,
    stash: HashMap<(Rank, Tag), VecDeque<Envelope>>,
}

impl Inbox {
    fn take(&mut self, wanted: &[(Rank, Tag)]) -> Option<(usize, Envelope)> {
        for (index, key) in wanted.iter().enumerate() {
            if let Some(queue) = self.stash.get_mut(key) {
                if let Some(envelope) = queue.pop_front() {
                    if queue.is_empty() {
                        self.stash.remove(key);
                    }
                    return Some((index, envelope));
                }
            }
        }
        None
    }
}

/// One rank's end of an in-process group.
#[derive(Debug)]
pub struct LocalTransport {
    rank: Rank,
    peers: Vec<mpsc::UnboundedSender<Envelope>>,
    inbox: Mutex<Inbox>,
}

#[async_trait]
impl Transport for LocalTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    async fn send(
        &self,
        dest: Rank,
        tag: Tag,
        buffered: bool,
        payload: Vec<f64>,
    ) -> Result<(), TransportError> {
        let peer = self.peers.get(dest).ok_or(TransportError::PeerOutOfRange {
            peer: dest,
            size: self.peers.len(),
        })?;
        peer.send(Envelope {
            src: self.rank,
            tag,
            buffered,
            payload,
        })
        .map_err(|_| TransportError::Closed(dest))
    }

    async fn recv_any(&self, wanted: &[(Rank, Tag)]) -> Result<(usize, Envelope), TransportError> {
        let mut inbox = self.inbox.lock().await;
        loop {
            if let Some(hit) = inbox.take(wanted) {
                return Ok(hit);
            }
            match inbox.rx.recv().await {
                Some(envelope) => inbox
                    .stash
                    .entry((envelope.src, envelope.tag))
                    .or_default()
                    .push_back(envelope),
                None => return Err(TransportError::Closed(self.rank)),
            }
        }
    }
}
