//! Logical clock and queue behind `enqueue job` / `advance time`.

use serde::{Deserialize, Serialize};

use crate::eval::value::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job: String,
    pub input: Value,
    pub due_at: u64,
    pub sequence: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobQueue {
    clock: u64,
    next_sequence: usize,
    queued: Vec<QueuedJob>,
}

impl JobQueue {
    pub fn now(&self) -> u64 {
        self.clock
    }

    pub fn enqueue(&mut self, job: impl Into<String>, input: Value, after: u64) -> u64 {
        let due_at = self.clock.saturating_add(after);
        self.queued.push(QueuedJob {
            job: job.into(),
            input,
            due_at,
            sequence: self.next_sequence,
        });
        self.next_sequence += 1;
        due_at
    }

    pub fn advance(&mut self, amount: u64) -> u64 {
        self.clock = self.clock.saturating_add(amount);
        self.clock
    }

    /// Remove and return every job due at the current clock, in enqueue order.
    pub fn take_due(&mut self) -> Vec<QueuedJob> {
        let clock = self.clock;
        let (due, pending): (Vec<_>, Vec<_>) =
            self.queued.drain(..).partition(|job| job.due_at <= clock);
        self.queued = pending;
        due
    }

    pub fn pending(&self) -> &[QueuedJob] {
        &self.queued
    }
}
