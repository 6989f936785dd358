//! Shared wire-format types for the host <-> guest-agent control channel.
//!
//! This crate is the single source of truth for the message shapes carried
//! between the orchestrator (host side) and `guest-agent` (inside the
//! microVM; the container backend does not use this protocol at all, since
//! it execs directly through the container runtime).
//!
//! ## Wire format
//!
//! Newline-delimited JSON, UTF-8. Every line is either one request or one
//! response. A connection may carry many requests serially; the guest
//! services them in arrival order and replies on the same connection before
//! reading the next line.
//!
//! ```text
//! {"cmd":"echo","args":["hello"],"env":["FOO=bar"]}\n
//! {"exit_code":0,"stdout":"hello\n","stderr":"","error":""}\n
//! ```

use std::fmt;
use std::io::BufRead;

use serde::{Deserialize, Serialize};

/// Default vsock/TCP port the guest agent listens on.
pub const GUEST_AGENT_PORT: u32 = 9999;

/// Default vsock guest context id for the single-VM-per-host ABI.
pub const DEFAULT_GUEST_CID: u32 = 3;

/// Upper bound on a single NDJSON line, guarding against a runaway peer.
pub const MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

/// Errors that can occur while framing or decoding protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("line exceeds maximum size of {0} bytes")]
    LineTooLong(usize),
    #[error("connection closed before a full line was read")]
    ConnectionClosed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A request to execute a command inside the guest.
///
/// `env` entries are `KEY=VALUE` strings, matching the wire example in the
/// external interface spec. Unknown/extra JSON fields are ignored on
/// decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Program to execute. Required.
    pub cmd: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// `KEY=VALUE` environment variables appended to the process environment.
    #[serde(default)]
    pub env: Vec<String>,
}

impl AgentRequest {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, env: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.env = env.into_iter().map(Into::into).collect();
        self
    }
}

/// The guest's reply to an [`AgentRequest`].
///
/// `exit_code` is `1` when the process could not be spawned at all (bad
/// binary, missing command, etc.); `error` is only non-empty in that case or
/// when the inbound request itself failed to parse.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentResponse {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub error: String,
}

impl AgentResponse {
    pub fn success(stdout: String, stderr: String, exit_code: i32) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
            error: String::new(),
        }
    }

    /// A response for a request that could not even be spawned or parsed.
    pub fn spawn_failure(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            stdout: String::new(),
            stderr: String::new(),
            error: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_empty() && self.exit_code == 0
    }
}

/// Read one NDJSON-framed value from `reader`, skipping blank lines.
///
/// Returns `Ok(None)` on clean EOF (no more lines). A line over
/// [`MAX_LINE_BYTES`] is a hard protocol error, closing the connection.
pub fn read_line_value<R, T>(reader: &mut R) -> Result<Option<T>, ProtocolError>
where
    R: BufRead,
    T: for<'de> Deserialize<'de>,
{
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        if line.len() > MAX_LINE_BYTES {
            return Err(ProtocolError::LineTooLong(MAX_LINE_BYTES));
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed.is_empty() {
            continue;
        }
        return Ok(Some(serde_json::from_str(trimmed)?));
    }
}

/// Serialize `value` as one NDJSON line (JSON body + trailing `\n`).
pub fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(value)?;
    buf.push(b'\n');
    Ok(buf)
}

impl fmt::Display for AgentRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.cmd, self.args.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn request_round_trip() {
        let req = AgentRequest::new("echo").with_args(["hello"]).with_env(["FOO=bar"]);
        let line = encode_line(&req).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        let mut cursor = Cursor::new(line);
        let decoded: AgentRequest = read_line_value(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded.cmd, "echo");
        assert_eq!(decoded.args, vec!["hello".to_string()]);
        assert_eq!(decoded.env, vec!["FOO=bar".to_string()]);
    }

    #[test]
    fn request_defaults_missing_fields() {
        let mut cursor = Cursor::new(b"{\"cmd\":\"ls\"}\n".to_vec());
        let decoded: AgentRequest = read_line_value(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded.cmd, "ls");
        assert!(decoded.args.is_empty());
        assert!(decoded.env.is_empty());
    }

    #[test]
    fn request_ignores_unknown_fields() {
        let mut cursor = Cursor::new(b"{\"cmd\":\"ls\",\"bogus\":123}\n".to_vec());
        let decoded: AgentRequest = read_line_value(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded.cmd, "ls");
    }

    #[test]
    fn response_success_helper() {
        let r = AgentResponse::success("out\n".into(), String::new(), 0);
        assert!(r.is_success());
    }

    #[test]
    fn response_spawn_failure_sets_exit_one() {
        let r = AgentResponse::spawn_failure("no such file");
        assert_eq!(r.exit_code, 1);
        assert!(!r.error.is_empty());
        assert!(!r.is_success());
    }

    #[test]
    fn read_line_value_skips_blank_lines() {
        let mut cursor = Cursor::new(b"\n\n{\"cmd\":\"true\"}\n".to_vec());
        let decoded: AgentRequest = read_line_value(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded.cmd, "true");
    }

    #[test]
    fn read_line_value_eof_returns_none() {
        let mut cursor = Cursor::new(Vec::new());
        let decoded: Option<AgentRequest> = read_line_value(&mut cursor).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn malformed_json_is_a_protocol_error() {
        let mut cursor = Cursor::new(b"not json at all\n".to_vec());
        let result: Result<Option<AgentRequest>, _> = read_line_value(&mut cursor);
        assert!(result.is_err());
    }

    #[test]
    fn response_serializes_with_expected_field_names() {
        let r = AgentResponse::success("hello\n".into(), String::new(), 0);
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("\"exit_code\":0"));
        assert!(json.contains("\"stdout\":\"hello\\n\""));
        assert!(json.contains("\"error\":\"\""));
    }
}
