//! The Execution entity: a record of one guest command invocation.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::vm::now_ms;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub vm_id: Uuid,
    pub command: String,
    pub args: Vec<String>,
    /// Non-secret `KEY=VALUE` environment variables. `None` whenever
    /// `secret_redacted` is true — see [`Execution::record_env`].
    pub env: Option<Vec<String>>,
    pub secret_redacted: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub started_at_ms: u64,
    pub ended_at_ms: Option<u64>,
}

impl Execution {
    pub fn new(vm_id: Uuid, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            vm_id,
            command: command.into(),
            args,
            env: None,
            secret_redacted: false,
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            started_at_ms: now_ms(),
            ended_at_ms: None,
        }
    }

    /// Record the environment used for the call. If `had_transient_secrets`
    /// is true, the environment column MUST be null and
    /// `secret_redacted` set instead of persisting the merged env.
    pub fn record_env(&mut self, env: Vec<String>, had_transient_secrets: bool) {
        if had_transient_secrets {
            self.env = None;
            self.secret_redacted = true;
        } else {
            self.env = Some(env);
            self.secret_redacted = false;
        }
    }

    pub fn finish(&mut self, exit_code: i32, stdout: String, stderr: String) {
        self.exit_code = exit_code;
        self.stdout = stdout;
        self.stderr = stderr;
        self.ended_at_ms = Some(now_ms());
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.ended_at_ms.map(|end| end.saturating_sub(self.started_at_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_secrets_force_null_env_and_redacted_flag() {
        let mut exec = Execution::new(Uuid::now_v7(), "echo", vec!["hi".into()]);
        exec.record_env(vec!["FOO=bar".into(), "TOKEN=secret".into()], true);
        assert!(exec.env.is_none());
        assert!(exec.secret_redacted);
    }

    #[test]
    fn non_secret_env_is_persisted_verbatim() {
        let mut exec = Execution::new(Uuid::now_v7(), "echo", vec![]);
        exec.record_env(vec!["FOO=bar".into()], false);
        assert_eq!(exec.env.as_deref(), Some(&["FOO=bar".to_string()][..]));
        assert!(!exec.secret_redacted);
    }

    #[test]
    fn finish_records_duration() {
        let mut exec = Execution::new(Uuid::now_v7(), "true", vec![]);
        exec.finish(0, String::new(), String::new());
        assert_eq!(exec.exit_code, 0);
        assert!(exec.duration_ms().is_some());
    }
}
