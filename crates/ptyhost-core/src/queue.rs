use bytes::Bytes;
use ptyhost_common::types::{Signal, Size};
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tracing::debug;

/// A unit of work captured while the agent was not ready
#[derive(Debug)]
pub enum PendingCommand {
    Write {
        data: Bytes,
        receipt: Option<oneshot::Sender<bool>>,
    },
    Resize(Size),
    Kill(Option<Signal>),
    Destroy,
}

impl PendingCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            PendingCommand::Write { .. } => "write",
            PendingCommand::Resize(_) => "resize",
            PendingCommand::Kill(_) => "kill",
            PendingCommand::Destroy => "destroy",
        }
    }
}

/// Two-state gate in front of the agent.
///
/// While not ready, submitted items are buffered in FIFO order. Opening the
/// gate hands them back exactly once; afterwards every submission passes
/// straight through.
#[derive(Debug)]
pub enum DeferredQueue<T> {
    NotReady(VecDeque<T>),
    Ready,
}

impl<T> DeferredQueue<T> {
    pub fn new() -> Self {
        DeferredQueue::NotReady(VecDeque::new())
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, DeferredQueue::Ready)
    }

    pub fn len(&self) -> usize {
        match self {
            DeferredQueue::NotReady(pending) => pending.len(),
            DeferredQueue::Ready => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the item back when it should run now, `None` when it was queued.
    pub fn submit(&mut self, item: T) -> Option<T> {
        match self {
            DeferredQueue::NotReady(pending) => {
                pending.push_back(item);
                debug!(queued = pending.len(), "Deferred command until agent is ready");
                None
            }
            DeferredQueue::Ready => Some(item),
        }
    }

    /// Open the gate, returning everything queued in submission order.
    /// Later calls return nothing.
    pub fn open(&mut self) -> VecDeque<T> {
        match std::mem::replace(self, DeferredQueue::Ready) {
            DeferredQueue::NotReady(pending) => pending,
            DeferredQueue::Ready => VecDeque::new(),
        }
    }

    /// Drop everything still queued without running it.
    pub fn discard(&mut self) -> usize {
        match self {
            DeferredQueue::NotReady(pending) => {
                let dropped = pending.len();
                pending.clear();
                dropped
            }
            DeferredQueue::Ready => 0,
        }
    }
}

impl<T> Default for DeferredQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
