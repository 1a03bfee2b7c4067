use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use lockrun_core::job::{Schedule, Task};
use lockrun_core::lock::LockProvider;

/// Where a spawned runner is in its life. `Stopped` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// Loop scheduled or executing.
    Running,
    /// Shutdown requested; in-flight work may still be finishing.
    ShuttingDown,
    /// Worker task released.
    Stopped,
}

/// A recurring job bound to a named distributed lock.
///
/// Each cycle waits out the current delay, tries to take the lock, runs the
/// task once if it won, and picks the next delay from the outcome. Several
/// instances may run the same job name concurrently (across processes or
/// replicas); the lock is the only thing keeping the task exclusive.
pub struct JobRunner<T, L> {
    name: String,
    schedule: Schedule,
    task: T,
    lock: L,
}

impl<T: Task, L: LockProvider> JobRunner<T, L> {
    pub fn new(name: String, schedule: Schedule, task: T, lock: L) -> Self {
        Self { name, schedule, task, lock }
    }

    /// Spawn the loop onto the runtime and return immediately.
    pub fn start(self) -> RunnerHandle {
        let (tx, rx) = watch::channel(false);
        let name = self.name.clone();
        let join = tokio::spawn(run_loop(self.name, self.schedule, self.task, self.lock, rx));
        RunnerHandle { name, shutdown: tx, join: Some(join), lifecycle: Lifecycle::Running }
    }
}

/// Owner side of a started runner.
pub struct RunnerHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    lifecycle: Lifecycle,
}

impl RunnerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Stop the loop and release the worker task. Idempotent.
    ///
    /// No task invocation begins after this returns; one already in flight
    /// is allowed to finish first.
    pub async fn shutdown(&mut self) {
        if self.lifecycle == Lifecycle::Stopped {
            return;
        }
        self.lifecycle = Lifecycle::ShuttingDown;
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                if e.is_panic() {
                    warn!("job {} worker panicked", self.name);
                }
            }
        }
        self.lifecycle = Lifecycle::Stopped;
        info!("job {} stopped", self.name);
    }
}

/// One attempt's result, as far as delay adaptation cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Task ran and reported more work pending.
    Backlog,
    /// Task ran and reported the backlog drained.
    Drained,
    /// Another instance holds the lock; task not invoked.
    LockBusy,
    /// Lock provider or task failed; absorbed.
    Failed,
}

/// Backlog pulls the next attempt in close (past the minimum hold other
/// instances may still be inside); everything else resumes the baseline.
pub(crate) fn delay_after(schedule: &Schedule, outcome: Outcome) -> Duration {
    match outcome {
        Outcome::Backlog => schedule.backlog_delay(),
        Outcome::Drained | Outcome::LockBusy | Outcome::Failed => schedule.run_every,
    }
}

async fn run_loop<T: Task, L: LockProvider>(
    name: String,
    schedule: Schedule,
    mut task: T,
    lock: L,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut next_delay = schedule.run_every;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(next_delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("job {} stopping", name);
                    break;
                }
                continue;
            }
        }
        // Re-check so nothing starts once shutdown has been signalled.
        if *shutdown.borrow() {
            info!("job {} stopping", name);
            break;
        }
        let outcome = attempt(&name, &schedule, &mut task, &lock).await;
        next_delay = delay_after(&schedule, outcome);
    }
}

async fn attempt<T: Task, L: LockProvider>(
    name: &str,
    schedule: &Schedule,
    task: &mut T,
    lock: &L,
) -> Outcome {
    let handle = match lock.try_acquire(name, schedule.lock_at_least, schedule.lock_at_most) {
        Ok(Some(h)) => h,
        Ok(None) => {
            debug!("job {} lock busy", name);
            return Outcome::LockBusy;
        }
        Err(e) => {
            warn!("job {} lock error: {:#}", name, e);
            return Outcome::Failed;
        }
    };
    let outcome = match task.run().await {
        Ok(true) => Outcome::Backlog,
        Ok(false) => Outcome::Drained,
        Err(e) => {
            warn!("job {} task error: {:#}", name, e);
            Outcome::Failed
        }
    };
    if let Err(e) = lock.release(&handle) {
        warn!("job {} lock release error: {:#}", name, e);
    }
    outcome
}
