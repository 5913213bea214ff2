//! Scriptable stand-in for [`control_capabilities::DeployDriver`]. Lets a
//! scenario queue up an exact sequence of reload/health outcomes so the
//! merge/deploy gate's rollback path (S6) can be driven deterministically.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use control_capabilities::{DeployDriver, DriverError, DriverOutcome, DriverResult};

#[derive(Clone)]
pub enum Scripted {
    Ok,
    NonZeroExit { code: i32, stderr: String },
    Timeout,
}

struct State {
    reload_queue: VecDeque<Scripted>,
    health_queue: VecDeque<Scripted>,
    restored_to: Vec<String>,
    restore_fails: bool,
}

/// Defaults to succeeding both `reload` and `health_check` every call;
/// queue entries via [`FakeDeployDriver::push_reload`] /
/// [`FakeDeployDriver::push_health`] to script failures.
pub struct FakeDeployDriver {
    state: Mutex<State>,
}

impl FakeDeployDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                reload_queue: VecDeque::new(),
                health_queue: VecDeque::new(),
                restored_to: Vec::new(),
                restore_fails: false,
            }),
        }
    }

    pub fn push_reload(&self, outcome: Scripted) {
        self.state.lock().unwrap().reload_queue.push_back(outcome);
    }

    pub fn push_health(&self, outcome: Scripted) {
        self.state.lock().unwrap().health_queue.push_back(outcome);
    }

    pub fn fail_restore(&self) {
        self.state.lock().unwrap().restore_fails = true;
    }

    pub fn restored_to(&self) -> Vec<String> {
        self.state.lock().unwrap().restored_to.clone()
    }

    fn resolve(queued: Option<Scripted>) -> DriverResult<DriverOutcome> {
        match queued.unwrap_or(Scripted::Ok) {
            Scripted::Ok => Ok(DriverOutcome {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: 1,
            }),
            Scripted::NonZeroExit { code, stderr } => Err(DriverError::NonZeroExit { code, stderr }),
            Scripted::Timeout => Err(DriverError::Timeout(0)),
        }
    }
}

impl Default for FakeDeployDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeployDriver for FakeDeployDriver {
    async fn reload(&self, _timeout: Duration) -> DriverResult<DriverOutcome> {
        let queued = self.state.lock().unwrap().reload_queue.pop_front();
        Self::resolve(queued)
    }

    async fn health_check(&self, _timeout: Duration) -> DriverResult<DriverOutcome> {
        let queued = self.state.lock().unwrap().health_queue.pop_front();
        Self::resolve(queued)
    }

    async fn restore_previous_release(&self, previous_commit_sha: &str) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.restore_fails {
            return Err(DriverError::Other("rollback restore failed".to_string()));
        }
        state.restored_to.push(previous_commit_sha.to_string());
        Ok(())
    }
}
