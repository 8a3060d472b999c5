//! Bounded stage queues with blocking backpressure
//!
//! A [`StageQueue`] counts the iterations a stage holds. Reserving a slot
//! blocks while the queue is full; the slot is returned when its
//! [`SlotGuard`] drops, typically when the consumer releases the output.
//! [`ReadyQueue`] carries finished (or finishing) iterations in FIFO order.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct SlotState {
    in_flight: usize,
    peak: usize,
    closed: bool,
}

/// Occupancy snapshot of a stage queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Stage name
    pub stage: &'static str,

    /// Configured depth
    pub depth: usize,

    /// Slots currently reserved
    pub in_flight: usize,

    /// Most slots ever reserved at once
    pub peak_in_flight: usize,
}

/// Bounded set of in-flight slots for one stage
#[derive(Debug)]
pub struct StageQueue {
    stage: &'static str,
    depth: usize,
    state: Mutex<SlotState>,
    freed: Condvar,
}

impl StageQueue {
    /// Queue admitting at most `depth` iterations
    pub fn new(stage: &'static str, depth: usize) -> Arc<Self> {
        Arc::new(Self {
            stage,
            depth,
            state: Mutex::new(SlotState::default()),
            freed: Condvar::new(),
        })
    }

    /// Reserve a slot, blocking while the queue is full
    pub fn reserve(self: &Arc<Self>) -> Result<SlotGuard> {
        let mut state = self.state.lock();
        while state.in_flight >= self.depth && !state.closed {
            trace!(stage = self.stage, "stage queue full, waiting");
            self.freed.wait(&mut state);
        }
        if state.closed {
            return Err(Error::ShutDown);
        }
        Ok(self.occupy(&mut state))
    }

    /// Reserve a slot if one is free
    pub fn try_reserve(self: &Arc<Self>) -> Result<Option<SlotGuard>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::ShutDown);
        }
        if state.in_flight >= self.depth {
            return Ok(None);
        }
        Ok(Some(self.occupy(&mut state)))
    }

    fn occupy(self: &Arc<Self>, state: &mut SlotState) -> SlotGuard {
        state.in_flight += 1;
        state.peak = state.peak.max(state.in_flight);
        SlotGuard {
            queue: Arc::clone(self),
        }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.in_flight -= 1;
        self.freed.notify_all();
    }

    /// Wake blocked producers and refuse further reservations
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.freed.notify_all();
    }

    /// Configured depth
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Occupancy snapshot
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            stage: self.stage,
            depth: self.depth,
            in_flight: state.in_flight,
            peak_in_flight: state.peak,
        }
    }
}

/// Reserved slot, returned to its queue on drop
#[derive(Debug)]
pub struct SlotGuard {
    queue: Arc<StageQueue>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.queue.release();
    }
}

/// FIFO hand-off between a producer stage and its consumer
pub struct ReadyQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> Default for ReadyQueue<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }
}

impl<T> ReadyQueue<T> {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item and wake a waiting consumer
    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
        self.available.notify_one();
    }

    /// Take the oldest item, blocking until one is available
    pub fn pop(&self) -> T {
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            self.available.wait(&mut items);
        }
    }

    /// Take the oldest item if there is one
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every queued item
    pub fn clear(&self) {
        self.items.lock().clear();
    }
}
