//! Tokio-backed task scheduler
//!
//! In-process implementation of the scheduling collaborator. Mobile hosts
//! hand this role to a platform job scheduler; servers, tests and the local
//! runtime use this one. Each scheduled task runs on its own tokio task,
//! retrying per the backoff policy until success, permanent failure, or the
//! attempt maximum. Periodic tasks re-run on their interval, optionally
//! jittered inside the flex window.
//!
//! The network requirement in [`TaskOptions`] is a hint for platform
//! schedulers that own a connectivity picture; this scheduler has none and
//! runs tasks regardless. The send cycle tolerates that: it re-checks
//! connectivity itself and leaves ineligible envelopes in the store.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use postal_core::{
    ExistingTaskPolicy, NetworkRequirement, SchedulableTask, SchedulerError, TaskId, TaskOptions,
    TaskOutcome, TaskScheduler,
};

// ----------------------------------------------------------------------------
// Tokio Scheduler
// ----------------------------------------------------------------------------

/// Runs scheduled tasks on the tokio runtime
#[derive(Default)]
pub struct TokioScheduler {
    running: Arc<DashMap<TaskId, JoinHandle<()>>>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of currently tracked tasks (finished tasks linger until their
    /// id is rescheduled or cancelled)
    pub fn task_count(&self) -> usize {
        self.running.len()
    }

    /// Cancel every tracked task
    pub fn shutdown(&self) {
        let ids: Vec<TaskId> = self.running.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.cancel_task(&id);
        }
    }

    async fn run_once_with_retries(task: &dyn SchedulableTask, options: &TaskOptions) {
        let mut attempt = 1u32;
        loop {
            match task.perform().await {
                TaskOutcome::Success => {
                    debug!(task = %options.id, attempt, "task run succeeded");
                    return;
                }
                TaskOutcome::Failure => {
                    warn!(task = %options.id, attempt, "task run failed permanently");
                    return;
                }
                TaskOutcome::Retry if attempt >= options.max_attempts => {
                    warn!(
                        task = %options.id,
                        attempts = attempt,
                        "task exhausted its retry budget"
                    );
                    return;
                }
                TaskOutcome::Retry => {
                    let delay = options.backoff.delay_for(attempt);
                    debug!(task = %options.id, attempt, delay_ms = delay.as_millis() as u64, "task retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn drive(task: Arc<dyn SchedulableTask>, options: TaskOptions) {
        match options.period {
            None => Self::run_once_with_retries(task.as_ref(), &options).await,
            Some(period) => loop {
                Self::run_once_with_retries(task.as_ref(), &options).await;
                let jitter = options
                    .flex_window
                    .map(|window| {
                        // Deterministic sub-window offset; good enough to
                        // avoid thundering herds without an rng dependency
                        let nanos = std::time::SystemTime::now()
                            .duration_since(std::time::UNIX_EPOCH)
                            .unwrap_or_default()
                            .subsec_nanos() as u128;
                        let window_ms = window.as_millis().max(1);
                        core::time::Duration::from_millis((nanos % window_ms) as u64)
                    })
                    .unwrap_or_default();
                tokio::time::sleep(period + jitter).await;
            },
        }
    }
}

impl TaskScheduler for TokioScheduler {
    fn schedule_task(
        &self,
        options: TaskOptions,
        task: Arc<dyn SchedulableTask>,
    ) -> Result<(), SchedulerError> {
        use dashmap::mapref::entry::Entry;

        if options.network != NetworkRequirement::Any {
            debug!(
                task = %options.id,
                "network requirement not enforced in-process; task runs unconditionally"
            );
        }

        match self.running.entry(options.id.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().is_finished() {
                    // A finished slot never blocks rescheduling
                    existing.insert(tokio::task::spawn(Self::drive(task, options)));
                    return Ok(());
                }
                match options.existing {
                    ExistingTaskPolicy::Keep => {
                        debug!(task = %options.id, "task already scheduled, keeping existing");
                        Err(SchedulerError::AlreadyScheduled {
                            task_id: options.id.to_string(),
                        })
                    }
                    ExistingTaskPolicy::Replace => {
                        info!(task = %options.id, "replacing scheduled task");
                        existing.get().abort();
                        existing.insert(tokio::task::spawn(Self::drive(task, options)));
                        Ok(())
                    }
                }
            }
            Entry::Vacant(slot) => {
                debug!(task = %options.id, "scheduling task");
                slot.insert(tokio::task::spawn(Self::drive(task, options)));
                Ok(())
            }
        }
    }

    fn cancel_task(&self, id: &TaskId) {
        if let Some((_, handle)) = self.running.remove(id) {
            handle.abort();
            debug!(task = %id, "task cancelled");
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
