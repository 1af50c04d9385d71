//! Parked client requests.
//!
//! Two FIFO queues: `waiting` holds requests that demanded a fresh
//! snapshot and unblock when the updater reaches the passive phase (or
//! finishes); `pending` holds requests whose wanted partitions intersect
//! a pending transition and are re-evaluated when it applies. A waiter
//! lives in at most one queue.

use std::collections::VecDeque;

use tokio::sync::oneshot;

use crate::bitmask::Bitmask;
use crate::error::{Error, Result};
use crate::group::GroupSnapshot;
use crate::message::Stale;
use crate::PartitionId;

pub struct Waiter {
    pub wanted: Vec<PartitionId>,
    pub stale: Stale,
    pub reply: oneshot::Sender<Result<GroupSnapshot>>,
}

impl Waiter {
    pub fn wanted_mask(&self) -> Bitmask {
        Bitmask::from_partitions(&self.wanted)
    }
}

#[derive(Default)]
pub struct WaiterQueues {
    waiting: VecDeque<Waiter>,
    pending: VecDeque<Waiter>,
}

impl WaiterQueues {
    pub fn park_waiting(&mut self, waiter: Waiter) {
        self.waiting.push_back(waiter);
    }

    pub fn park_pending(&mut self, waiter: Waiter) {
        self.pending.push_back(waiter);
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.waiting.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reply to every freshness waiter in arrival order.
    pub fn drain_waiting(&mut self, mut snapshot: impl FnMut() -> GroupSnapshot) {
        while let Some(waiter) = self.waiting.pop_front() {
            let _ = waiter.reply.send(Ok(snapshot()));
        }
    }

    /// Remove all pending-transition waiters for re-evaluation.
    pub fn take_pending(&mut self) -> Vec<Waiter> {
        self.pending.drain(..).collect()
    }

    /// Fail everything in both queues with the same error.
    pub fn fail_all(&mut self, err: &Error) {
        for waiter in self.waiting.drain(..).chain(self.pending.drain(..)) {
            let _ = waiter.reply.send(Err(err.clone()));
        }
    }

    /// Fail only the freshness waiters (e.g. on an updater error).
    pub fn fail_waiting(&mut self, err: &Error) {
        for waiter in self.waiting.drain(..) {
            let _ = waiter.reply.send(Err(err.clone()));
        }
    }
}
