//! Scheduling collaborator contract
//!
//! Scheduled-job execution is external to this core: the pipeline only
//! describes *what* to run through [`TaskOptions`] and reacts to
//! [`TaskOutcome`]s. The upstream sender's cycle is invoked as the
//! `perform()` of such a task and never self-schedules; cadence and backoff
//! are owned by whichever [`TaskScheduler`] the embedder wires in.

use core::time::Duration;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::SchedulerError;

// ----------------------------------------------------------------------------
// Task Identity
// ----------------------------------------------------------------------------

/// Stable task id used for de-duplication
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for TaskId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Task Options
// ----------------------------------------------------------------------------

/// Network connectivity a task needs before it may run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkRequirement {
    /// Runs with or without connectivity
    #[default]
    Any,
    /// Requires any network connection
    Connected,
    /// Requires an unmetered connection
    Unmetered,
}

/// Delay policy applied between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    None,
    Linear { base: Duration },
    Exponential { base: Duration },
}

impl BackoffPolicy {
    /// Delay before the given retry attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            BackoffPolicy::None => Duration::ZERO,
            BackoffPolicy::Linear { base } => base.saturating_mul(attempt),
            BackoffPolicy::Exponential { base } => {
                let shift = attempt.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << shift)
            }
        }
    }
}

/// What to do when a task with the same id is already scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExistingTaskPolicy {
    /// Keep the existing task, reject the new one
    Keep,
    /// Cancel and replace the existing task
    #[default]
    Replace,
}

/// Options describing one scheduled task
#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub id: TaskId,
    pub network: NetworkRequirement,
    pub backoff: BackoffPolicy,
    /// Maximum attempts across retries before the scheduler gives up
    pub max_attempts: u32,
    pub existing: ExistingTaskPolicy,
    /// Repeat interval for periodic tasks, `None` for one-shot
    pub period: Option<Duration>,
    /// Jitter window around each periodic run
    pub flex_window: Option<Duration>,
}

impl TaskOptions {
    /// One-shot task with sensible defaults
    pub fn one_shot(id: TaskId) -> Self {
        Self {
            id,
            network: NetworkRequirement::default(),
            backoff: BackoffPolicy::Exponential {
                base: Duration::from_secs(10),
            },
            max_attempts: 5,
            existing: ExistingTaskPolicy::Replace,
            period: None,
            flex_window: None,
        }
    }

    /// Periodic task with the given interval
    pub fn periodic(id: TaskId, period: Duration) -> Self {
        Self {
            period: Some(period),
            ..Self::one_shot(id)
        }
    }
}

// ----------------------------------------------------------------------------
// Task Outcome and Trait
// ----------------------------------------------------------------------------

/// Tri-state result of one task run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Done; no retry
    Success,
    /// Transient failure; the scheduler applies its backoff policy
    Retry,
    /// Permanent failure; no more retries
    Failure,
}

/// A unit of work the external scheduler invokes
#[async_trait]
pub trait SchedulableTask: Send + Sync {
    async fn perform(&self) -> TaskOutcome;
}

/// The external scheduling collaborator
pub trait TaskScheduler: Send + Sync {
    /// Schedule a task under the options' id, honoring the existing-task
    /// policy
    fn schedule_task(
        &self,
        options: TaskOptions,
        task: Arc<dyn SchedulableTask>,
    ) -> Result<(), SchedulerError>;

    /// Cancel a scheduled task; unknown ids are a no-op
    fn cancel_task(&self, id: &TaskId);
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
