use std::collections::VecDeque;

use crate::stage::{Stage, StageInput};

/// A stage the caller asked to run automatically once its predecessor completes.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub input: StageInput,
}

impl PendingEntry {
    pub fn stage(&self) -> Stage {
        self.input.stage()
    }
}

/// FIFO of pending stages. Duplicates are allowed and run in sequence.
#[derive(Debug, Clone, Default)]
pub struct PendingQueue {
    entries: VecDeque<PendingEntry>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, input: StageInput) {
        self.entries.push_back(PendingEntry { input });
    }

    pub fn dequeue_next(&mut self) -> Option<PendingEntry> {
        self.entries.pop_front()
    }

    /// Stage at the head of the queue, without removing it.
    pub fn peek(&self) -> Option<Stage> {
        self.entries.front().map(PendingEntry::stage)
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.entries.iter().map(PendingEntry::stage).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
