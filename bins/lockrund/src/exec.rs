use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

use lockrun_core::job::{Action, Task};

/// Exit code a command uses to report a remaining backlog
/// (sysexits EX_TEMPFAIL). Exit 0 means drained; anything else is a failure.
pub const MORE_WORK_EXIT: i32 = 75;

/// Runs a configured [`Action`] as the job's unit of work.
pub struct ActionTask {
    action: Action,
}

impl ActionTask {
    pub fn new(action: Action) -> Self {
        Self { action }
    }
}

#[async_trait]
impl Task for ActionTask {
    async fn run(&mut self) -> Result<bool> {
        match &self.action {
            Action::Noop => Ok(false),

            Action::Exec { cmd, args, timeout_ms } => {
                let mut c = Command::new(cmd);
                if !args.is_empty() {
                    c.args(args);
                }
                let fut = c.status();

                let status = if let Some(ms) = timeout_ms {
                    timeout(Duration::from_millis(*ms), fut)
                        .await
                        .context("exec timeout")??
                } else {
                    fut.await?
                };

                match status.code() {
                    Some(0) => Ok(false),
                    Some(MORE_WORK_EXIT) => Ok(true),
                    code => bail!("exec exit status {:?}", code),
                }
            }
        }
    }
}
