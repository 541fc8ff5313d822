//! Bounded FIFO of requests waiting behind the one in flight.

use std::collections::VecDeque;

/// Result of one admission attempt. Requests that are not kept are handed back.
#[derive(Debug, PartialEq, Eq)]
pub enum Enqueue<T> {
    /// Nothing in flight: the caller runs it now. The queue is untouched.
    Admitted(T),
    /// Stored behind the in-flight generation.
    Queued,
    /// Queue already holds `capacity` entries.
    Rejected(T),
}

#[derive(Debug)]
pub struct AdmissionQueue<T> {
    pending: VecDeque<T>,
    capacity: usize,
    generating: bool,
}

impl<T> AdmissionQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(capacity),
            capacity,
            generating: false,
        }
    }

    pub fn try_enqueue(&mut self, request: T) -> Enqueue<T> {
        if !self.generating {
            return Enqueue::Admitted(request);
        }
        if self.pending.len() < self.capacity {
            self.pending.push_back(request);
            Enqueue::Queued
        } else {
            Enqueue::Rejected(request)
        }
    }

    #[inline]
    pub fn is_generating(&self) -> bool {
        self.generating
    }

    pub fn set_generating(&mut self, generating: bool) {
        self.generating = generating;
    }

    /// Next request in arrival order.
    pub fn pop_next(&mut self) -> Option<T> {
        self.pending.pop_front()
    }

    /// Take out every entry matching `pred`, keeping the rest in order.
    pub fn remove_where<F: FnMut(&T) -> bool>(&mut self, mut pred: F) -> Vec<T> {
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.capacity);
        for item in self.pending.drain(..) {
            if pred(&item) {
                removed.push(item);
            } else {
                kept.push_back(item);
            }
        }
        self.pending = kept;
        removed
    }

    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.pending.drain(..)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// True while anything waits.
    #[inline]
    pub fn is_queued(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
