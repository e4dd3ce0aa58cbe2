/// Per-item reorder buffer
///
/// FIFO by arrival. Removal only ever happens at the head, gated by a
/// sequence predicate, so callers drain a prefix by looping `pop` until it
/// returns `None`. Every element is owned by the buffer until popped.

use std::collections::VecDeque;

use crate::seq;

/// Head predicate used by `ReorderBuffer::pop`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopMode {
    /// Head sequence strictly before the bound
    Before,
    /// Head sequence before or equal to the bound
    UpTo,
    /// Any head, bound ignored
    All,
}

/// A message held back from delivery, with its extracted sequence number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedMessage<M> {
    seq: u32,
    message: M,
}

impl<M> BufferedMessage<M> {
    pub fn new(seq: u32, message: M) -> Self {
        BufferedMessage { seq, message }
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn into_message(self) -> M {
        self.message
    }
}

#[derive(Debug, Clone)]
pub struct ReorderBuffer<M> {
    queue: VecDeque<BufferedMessage<M>>,
}

impl<M> ReorderBuffer<M> {
    pub fn new() -> Self {
        ReorderBuffer {
            queue: VecDeque::new(),
        }
    }

    /// Enqueue at the tail, taking ownership
    pub fn push(&mut self, message: BufferedMessage<M>) {
        self.queue.push_back(message);
    }

    /// Remove the head if it satisfies `mode` against `bound`
    pub fn pop(&mut self, mode: PopMode, bound: u32) -> Option<BufferedMessage<M>> {
        let head = self.queue.front()?.seq;
        let take = match mode {
            PopMode::Before => seq::is_before(head, bound),
            PopMode::UpTo => seq::is_before_or_eq(head, bound),
            PopMode::All => true,
        };
        if take {
            self.queue.pop_front()
        } else {
            None
        }
    }

    pub fn peek_seq(&self) -> Option<u32> {
        self.queue.front().map(|m| m.seq)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Release every element without delivering it; returns how many were dropped
    pub fn drain_all(&mut self) -> usize {
        let released = self.queue.len();
        self.queue.clear();
        released
    }
}

impl<M> Default for ReorderBuffer<M> {
    fn default() -> Self {
        Self::new()
    }
}
