use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use lockrun_core::job::{Schedule, Task};
use lockrun_core::lock::{LockHandle, LockProvider};

use crate::runner::{delay_after, JobRunner, Lifecycle, Outcome, RunnerHandle};

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// run_every=10s, lock_at_least=2s, lock_at_most defaulted to 9s.
fn sched() -> Schedule {
    Schedule::new(secs(10), secs(2), None).unwrap()
}

/* --------------------- fakes --------------------- */

/// In-memory single-holder lock. Ignores hold windows: a name frees up the
/// moment its holder releases.
#[derive(Clone)]
struct TestLock {
    inner: Arc<Mutex<TestLockState>>,
}

struct TestLockState {
    grant: bool,
    held: Option<(String, u64)>,
    next_token: u64,
    acquired: usize,
    denied: usize,
}

impl TestLock {
    fn granting() -> Self {
        Self::with_grant(true)
    }

    fn denying() -> Self {
        Self::with_grant(false)
    }

    fn with_grant(grant: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TestLockState {
                grant,
                held: None,
                next_token: 0,
                acquired: 0,
                denied: 0,
            })),
        }
    }

    fn acquired(&self) -> usize {
        self.inner.lock().unwrap().acquired
    }

    fn denied(&self) -> usize {
        self.inner.lock().unwrap().denied
    }

    fn is_held(&self) -> bool {
        self.inner.lock().unwrap().held.is_some()
    }
}

impl LockProvider for TestLock {
    fn try_acquire(
        &self,
        name: &str,
        _at_least: Duration,
        _at_most: Duration,
    ) -> Result<Option<LockHandle>> {
        let mut s = self.inner.lock().unwrap();
        if !s.grant || s.held.is_some() {
            s.denied += 1;
            return Ok(None);
        }
        s.next_token += 1;
        let token = s.next_token;
        s.held = Some((name.to_string(), token));
        s.acquired += 1;
        Ok(Some(LockHandle { name: name.to_string(), token }))
    }

    fn release(&self, handle: &LockHandle) -> Result<()> {
        let mut s = self.inner.lock().unwrap();
        if let Some((name, token)) = &s.held {
            if *name == handle.name && *token == handle.token {
                s.held = None;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Step {
    More,
    Done,
    Fail,
}

#[derive(Clone, Default)]
struct Counters {
    runs: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    overlap: Arc<AtomicBool>,
}

impl Counters {
    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    fn overlapped(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }
}

/// Task that walks `script` (last step repeats forever), optionally holding
/// for `hold` of simulated work, and records completions and overlap into
/// shared counters.
struct ScriptedTask {
    script: Vec<Step>,
    hold: Duration,
    counters: Counters,
}

impl ScriptedTask {
    fn new(script: &[Step], counters: &Counters) -> Self {
        Self::holding(script, counters, Duration::ZERO)
    }

    fn holding(script: &[Step], counters: &Counters, hold: Duration) -> Self {
        assert!(!script.is_empty());
        Self { script: script.to_vec(), hold, counters: counters.clone() }
    }
}

#[async_trait]
impl Task for ScriptedTask {
    async fn run(&mut self) -> Result<bool> {
        let step = if self.script.len() > 1 { self.script.remove(0) } else { self.script[0] };
        if self.counters.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.counters.overlap.store(true, Ordering::SeqCst);
        }
        if !self.hold.is_zero() {
            tokio::time::sleep(self.hold).await;
        }
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
        self.counters.runs.fetch_add(1, Ordering::SeqCst);
        match step {
            Step::More => Ok(true),
            Step::Done => Ok(false),
            Step::Fail => Err(anyhow::anyhow!("boom")),
        }
    }
}

fn spawn(name: &str, lock: &TestLock, task: ScriptedTask) -> RunnerHandle {
    JobRunner::new(name.to_string(), sched(), task, lock.clone()).start()
}

/* --------------------- helpers --------------------- */

async fn settle() {
    for _ in 0..25 {
        tokio::task::yield_now().await;
    }
}

async fn advance(d: Duration) {
    tokio::time::advance(d).await;
    settle().await;
}

/* --------------------- delay policy --------------------- */

#[test]
fn backlog_shortens_the_next_delay_to_1_5_min_holds() {
    let s = sched();
    assert_eq!(delay_after(&s, Outcome::Backlog), secs(3));
}

#[test]
fn everything_else_resumes_baseline_cadence() {
    let s = sched();
    assert_eq!(delay_after(&s, Outcome::Drained), secs(10));
    assert_eq!(delay_after(&s, Outcome::LockBusy), secs(10));
    assert_eq!(delay_after(&s, Outcome::Failed), secs(10));
}

/* --------------------- loop behavior --------------------- */

#[tokio::test(start_paused = true)]
async fn backlog_repolls_every_three_seconds() {
    let lock = TestLock::granting();
    let counters = Counters::default();
    let mut handle = spawn("sweep", &lock, ScriptedTask::new(&[Step::More], &counters));
    settle().await;

    // First wait is the full baseline.
    advance(ms(9_999)).await;
    assert_eq!(counters.runs(), 0);
    advance(ms(1)).await;
    assert_eq!(counters.runs(), 1);

    // Then 2s * 1.5 = 3s, indefinitely.
    advance(ms(2_999)).await;
    assert_eq!(counters.runs(), 1);
    advance(ms(1)).await;
    assert_eq!(counters.runs(), 2);
    advance(secs(3)).await;
    assert_eq!(counters.runs(), 3);

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn drained_stays_on_baseline_cadence() {
    let lock = TestLock::granting();
    let counters = Counters::default();
    let mut handle = spawn("sweep", &lock, ScriptedTask::new(&[Step::Done], &counters));
    settle().await;

    advance(secs(10)).await;
    assert_eq!(counters.runs(), 1);
    advance(ms(9_999)).await;
    assert_eq!(counters.runs(), 1);
    advance(ms(1)).await;
    assert_eq!(counters.runs(), 2);

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn denied_lock_skips_the_task_and_keeps_baseline() {
    let lock = TestLock::denying();
    let counters = Counters::default();
    let mut handle = spawn("sweep", &lock, ScriptedTask::new(&[Step::More], &counters));
    settle().await;

    for _ in 0..4 {
        advance(secs(10)).await;
    }
    assert_eq!(counters.runs(), 0);
    assert_eq!(lock.acquired(), 0);
    assert_eq!(lock.denied(), 4);

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn task_error_is_absorbed_and_the_next_cycle_still_runs() {
    let lock = TestLock::granting();
    let counters = Counters::default();
    let mut handle = spawn("sweep", &lock, ScriptedTask::new(&[Step::Fail, Step::Done], &counters));
    settle().await;

    advance(secs(10)).await;
    assert_eq!(counters.runs(), 1);
    // Failure released the lock and fell back to the baseline interval.
    assert!(!lock.is_held());
    advance(ms(9_999)).await;
    assert_eq!(counters.runs(), 1);
    advance(ms(1)).await;
    assert_eq!(counters.runs(), 2);

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn a_slow_task_is_never_reentered() {
    let lock = TestLock::granting();
    let counters = Counters::default();
    let task = ScriptedTask::holding(&[Step::More], &counters, secs(4));
    let mut handle = spawn("sweep", &lock, task);
    settle().await;

    for _ in 0..30 {
        advance(secs(1)).await;
    }
    assert!(!counters.overlapped());
    assert!(counters.runs() >= 2);

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn two_instances_of_one_job_never_run_together() {
    let lock = TestLock::granting();
    let counters = Counters::default();
    let mut a = spawn("same", &lock, ScriptedTask::holding(&[Step::More], &counters, secs(4)));
    let mut b = spawn("same", &lock, ScriptedTask::holding(&[Step::More], &counters, secs(4)));
    settle().await;

    for _ in 0..60 {
        advance(secs(1)).await;
    }
    assert!(!counters.overlapped());
    assert!(counters.runs() >= 2);
    assert!(lock.acquired() >= 2);
    // Both wake at the 10s mark, so at least one collision was refused.
    assert!(lock.denied() >= 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_is_idempotent_and_final() {
    let lock = TestLock::granting();
    let counters = Counters::default();
    let mut handle = spawn("sweep", &lock, ScriptedTask::new(&[Step::Done], &counters));
    settle().await;
    assert_eq!(handle.lifecycle(), Lifecycle::Running);

    advance(secs(10)).await;
    assert_eq!(counters.runs(), 1);

    handle.shutdown().await;
    assert_eq!(handle.lifecycle(), Lifecycle::Stopped);
    handle.shutdown().await;
    assert_eq!(handle.lifecycle(), Lifecycle::Stopped);

    for _ in 0..5 {
        advance(secs(30)).await;
    }
    assert_eq!(counters.runs(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_before_the_first_cycle_prevents_any_run() {
    let lock = TestLock::granting();
    let counters = Counters::default();
    let mut handle = spawn("sweep", &lock, ScriptedTask::new(&[Step::More], &counters));
    settle().await;

    handle.shutdown().await;
    for _ in 0..5 {
        advance(secs(10)).await;
    }
    assert_eq!(counters.runs(), 0);
    assert_eq!(lock.acquired(), 0);
}
