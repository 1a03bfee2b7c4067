#![deny(missing_docs)]
//! lockrun_core: shared building blocks (config, distributed lock, job specs, logging).

/// Configuration helpers (AppId, dirs, load_or_init, etc.)
pub mod cfg;
/// Named, time-bounded distributed lock with a file-backed default provider.
pub mod lock;
/// Tracing/log initialization helpers.
pub mod logx;
/// Job model shared by the daemon and tools: specs, schedules, the task trait.
pub mod job;
