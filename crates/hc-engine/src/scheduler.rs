//! Priority queue for future requests.
//!
//! A bounded min-heap keyed on `(time, arrival)`. The arrival counter makes
//! the heap stable: two requests scheduled for the same time dispatch in
//! the order their pushes were observed. Backing storage is reserved once
//! at construction so pushes below capacity never allocate.

use std::collections::BinaryHeap;

use hc_proto::{ErrorKind, Time};

use crate::error::{EngineError, Result};
use crate::request::Request;

struct ScheduleItem {
    time: Time,
    seq: u64,
    request: Request,
}

impl PartialEq for ScheduleItem {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for ScheduleItem {}

impl PartialOrd for ScheduleItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduleItem {
    // Inverted so the std max-heap pops the earliest (time, seq) first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.time.total_cmp(&self.time).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Bounded, stable scheduler of `(time, Request)` items.
pub struct Scheduler {
    heap: BinaryHeap<ScheduleItem>,
    max_size: usize,
    next_seq: u64,
}

impl Scheduler {
    /// Reserve storage for `max_size` items.
    pub fn new(max_size: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(max_size),
            max_size,
            next_seq: 0,
        }
    }

    /// Schedule a request. A full scheduler is a per-request error, not a
    /// growth trigger.
    pub fn push(&mut self, time: Time, request: Request) -> Result<()> {
        if self.heap.len() >= self.max_size {
            return Err(EngineError::with_message(ErrorKind::QueueOverflow, "scheduler full"));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(ScheduleItem { time, seq, request });
        Ok(())
    }

    /// Time of the earliest pending item.
    pub fn peek_time(&self) -> Option<Time> {
        self.heap.peek().map(|item| item.time)
    }

    /// Remove and return the earliest pending item.
    pub fn pop(&mut self) -> Option<(Time, Request)> {
        self.heap.pop().map(|item| (item.time, item.request))
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Drop every pending item. Shutdown path only.
    pub fn clear(&mut self) {
        self.heap.clear();
    }
}
