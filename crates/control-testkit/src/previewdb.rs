//! Records-only stand-in for [`control_capabilities::DbResetDriver`]. Never
//! touches a real Postgres schema; just logs what it was asked to do so
//! scenario tests can assert on the reset/seed sequence.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use control_capabilities::{DbResetDriver, DriverError, DriverResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    ResetSchema { db_name: String },
    ApplySqlFile { db_name: String, sql_path: PathBuf },
}

struct State {
    calls: Vec<RecordedCall>,
    fail_reset: bool,
    fail_apply: bool,
}

pub struct FakeDbResetDriver {
    state: Mutex<State>,
}

impl FakeDbResetDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                calls: Vec::new(),
                fail_reset: false,
                fail_apply: false,
            }),
        }
    }

    pub fn fail_next_reset(&self) {
        self.state.lock().unwrap().fail_reset = true;
    }

    pub fn fail_next_apply(&self) {
        self.state.lock().unwrap().fail_apply = true;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().unwrap().calls.clone()
    }
}

impl Default for FakeDbResetDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DbResetDriver for FakeDbResetDriver {
    async fn reset_schema(&self, db_name: &str) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RecordedCall::ResetSchema {
            db_name: db_name.to_string(),
        });
        if state.fail_reset {
            state.fail_reset = false;
            return Err(DriverError::Other(format!("fake reset_schema failure for {db_name}")));
        }
        Ok(())
    }

    async fn apply_sql_file(&self, db_name: &str, sql_path: &std::path::Path) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RecordedCall::ApplySqlFile {
            db_name: db_name.to_string(),
            sql_path: sql_path.to_path_buf(),
        });
        if state.fail_apply {
            state.fail_apply = false;
            return Err(DriverError::Other(format!("fake apply_sql_file failure for {db_name}")));
        }
        Ok(())
    }
}
