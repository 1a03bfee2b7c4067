use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A recurring job specification as it appears in configuration.
///
/// Durations are carried as milliseconds in config; [`JobSpec::schedule`]
/// turns them into a validated [`Schedule`].
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JobSpec {
    /// Job identifier. Doubles as the distributed lock name, so it must be
    /// shared across instances that contend for the same job and unique
    /// among unrelated jobs.
    pub name: String,
    /// Baseline interval between attempts (milliseconds).
    pub run_every_ms: u64,
    /// Minimum time the lock stays held, even if the task finishes
    /// instantly (milliseconds).
    pub lock_at_least_ms: u64,
    /// Maximum time the lock may be held before another instance may
    /// reclaim it (milliseconds). Defaults to 90% of `run_every_ms`.
    #[serde(default)]
    pub lock_at_most_ms: Option<u64>,
    /// The action to perform when the job wins the lock.
    pub action: Action,
}

/// Actions a job can perform.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Do nothing and report the backlog drained.
    Noop,
    /// Execute an OS command.
    Exec {
        /// Command/executable.
        cmd: String,
        /// Arguments.
        #[serde(default)]
        args: Vec<String>,
        /// Optional timeout (ms).
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
}

/// Validated timing parameters for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// Baseline interval between attempts.
    pub run_every: Duration,
    /// Minimum lock hold.
    pub lock_at_least: Duration,
    /// Maximum lock hold; past this the lock is reclaimable.
    pub lock_at_most: Duration,
}

impl Schedule {
    /// Build a schedule, applying the default maximum hold (90% of
    /// `run_every`) when none is given.
    ///
    /// Rejects zero durations and a hold window where the maximum is
    /// shorter than the minimum.
    pub fn new(
        run_every: Duration,
        lock_at_least: Duration,
        lock_at_most: Option<Duration>,
    ) -> Result<Self, SpecError> {
        if run_every.is_zero() {
            return Err(SpecError::NonPositive { field: "run_every" });
        }
        if lock_at_least.is_zero() {
            return Err(SpecError::NonPositive { field: "lock_at_least" });
        }
        let lock_at_most = lock_at_most.unwrap_or(run_every * 9 / 10);
        if lock_at_most.is_zero() {
            return Err(SpecError::NonPositive { field: "lock_at_most" });
        }
        if lock_at_most < lock_at_least {
            return Err(SpecError::HoldWindow { lock_at_least, lock_at_most });
        }
        Ok(Self { run_every, lock_at_least, lock_at_most })
    }

    /// Delay before the next attempt when the task reported a backlog:
    /// 1.5x the minimum hold, so the re-poll lands past another instance's
    /// minimum hold window.
    pub fn backlog_delay(&self) -> Duration {
        self.lock_at_least + self.lock_at_least / 2
    }
}

impl JobSpec {
    /// Validate this spec into a [`Schedule`].
    pub fn schedule(&self) -> Result<Schedule, SpecError> {
        if self.name.is_empty() {
            return Err(SpecError::EmptyName);
        }
        Schedule::new(
            Duration::from_millis(self.run_every_ms),
            Duration::from_millis(self.lock_at_least_ms),
            self.lock_at_most_ms.map(Duration::from_millis),
        )
    }
}

/// Rejected job configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpecError {
    /// A duration that must be strictly positive was zero.
    #[error("{field} must be greater than zero")]
    NonPositive {
        /// Offending field name.
        field: &'static str,
    },
    /// The maximum lock hold undercuts the minimum one.
    #[error("lock_at_most ({lock_at_most:?}) is shorter than lock_at_least ({lock_at_least:?})")]
    HoldWindow {
        /// Configured (or defaulted) minimum hold.
        lock_at_least: Duration,
        /// Configured (or defaulted) maximum hold.
        lock_at_most: Duration,
    },
    /// The job name was empty.
    #[error("job name must not be empty")]
    EmptyName,
}

/// A unit of work executed while the job's lock is held.
///
/// Returning `Ok(true)` signals a remaining backlog and asks the runner to
/// come back sooner than the baseline cadence; `Ok(false)` resumes it.
/// Errors are absorbed by the runner and treated like `Ok(false)`.
#[async_trait]
pub trait Task: Send + 'static {
    /// Run one pass of the work.
    async fn run(&mut self) -> anyhow::Result<bool>;
}
