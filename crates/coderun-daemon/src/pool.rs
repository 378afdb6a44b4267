//! Runner slot management
//!
//! Every slot runs one submission at a time. A request waits on the
//! semaphore for a free slot, so at most `workers` submissions execute
//! concurrently and the rest queue in arrival order.

use coderun_core::{ExecutionResult, GradeReport, Runner, Submission};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Ready to accept work
    Idle,
    /// Currently executing a submission
    Busy,
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    execution_count: u64,
}

/// Result of one pooled submission
#[derive(Debug, Clone)]
pub enum Verdict {
    Run(ExecutionResult),
    Graded(GradeReport),
}

/// Pool of sequential runner slots sharing one [`Runner`]
#[derive(Debug)]
pub struct WorkerPool {
    runner: Runner,
    slots: Vec<Mutex<Slot>>,
    permits: Semaphore,
}

impl WorkerPool {
    /// Create a pool of `workers` idle slots
    #[must_use]
    pub fn new(runner: Runner, workers: usize) -> Self {
        let slots = (0..workers)
            .map(|_| {
                Mutex::new(Slot {
                    state: SlotState::Idle,
                    execution_count: 0,
                })
            })
            .collect();

        Self {
            runner,
            slots,
            permits: Semaphore::new(workers),
        }
    }

    /// Run `submission` on the next free slot
    ///
    /// Submissions themselves never fail; only a closed pool does.
    pub async fn execute(&self, submission: &Submission) -> Option<Verdict> {
        let _permit = self.permits.acquire().await.ok()?;
        let slot = self.claim()?;
        tracing::debug!(slot = slot.index, "slot claimed");

        let verdict = if submission.is_graded() {
            Verdict::Graded(self.runner.grade(submission).await)
        } else {
            Verdict::Run(self.runner.run(submission).await)
        };

        drop(slot);
        Some(verdict)
    }

    /// Mark an idle slot busy; the permit guarantees one exists
    fn claim(&self) -> Option<SlotGuard<'_>> {
        self.slots.iter().enumerate().find_map(|(index, slot)| {
            let mut guard = slot.lock();
            (guard.state == SlotState::Idle).then(|| {
                guard.state = SlotState::Busy;
                SlotGuard { pool: self, index }
            })
        })
    }

    /// Get pool status
    pub fn status(&self) -> PoolStatus {
        let busy = self
            .slots
            .iter()
            .filter(|slot| slot.lock().state == SlotState::Busy)
            .count();
        let executions = self.slots.iter().map(|slot| slot.lock().execution_count).sum();

        PoolStatus {
            total: self.slots.len(),
            idle: self.slots.len() - busy,
            busy,
            executions,
        }
    }

    /// Stop admitting work and wait up to `timeout` for running submissions
    ///
    /// Returns whether every slot went idle in time.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let Ok(count) = u32::try_from(self.slots.len()) else {
            return false;
        };
        // Held until the semaphore is closed so nothing slips in between
        let held = tokio::time::timeout(timeout, self.permits.acquire_many(count)).await;
        self.permits.close();
        matches!(held, Ok(Ok(_)))
    }
}

/// Returns the slot to idle when the submission finishes or is cancelled
struct SlotGuard<'a> {
    pool: &'a WorkerPool,
    index: usize,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.pool.slots[self.index].lock();
        slot.state = SlotState::Idle;
        slot.execution_count += 1;
    }
}

/// Status of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub executions: u64,
}
