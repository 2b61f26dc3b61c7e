//! Per-host results and their aggregation.
//!
//! Every fleet call returns a [`FleetResults`] map with exactly one entry per
//! host: either the operation's value or an [`ErrorResult`]. Both serialize
//! to the flat JSON objects automation consumers expect.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SshError;

/// Return code reported for a command that timed out.
pub const TIMEOUT_RETURN_CODE: i32 = -9;

/// Return code reported for every other per-host failure.
pub const FAILURE_RETURN_CODE: i32 = 255;

/// Return code used when a channel closed without reporting an exit status.
pub const MISSING_EXIT_STATUS: i32 = -1;

/// Message stored for a host that connected.
pub const CONNECTED_MESSAGE: &str = "Connected to host.";

/// Implemented by every per-host success value.
pub trait Outcome {
    /// Whether this value counts as success for status aggregation.
    fn succeeded(&self) -> bool {
        true
    }
}

/// Output of one remote command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Captured stdout, sanitized.
    pub stdout: String,
    /// Captured stderr, sanitized.
    pub stderr: String,
    /// Remote exit status.
    pub return_code: i32,
    /// `return_code == 0`.
    pub succeeded: bool,
    /// `!succeeded`.
    pub failed: bool,
}

impl CommandResult {
    /// Build a result; success is derived from the return code.
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, return_code: i32) -> Self {
        let succeeded = return_code == 0;
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            return_code,
            succeeded,
            failed: !succeeded,
        }
    }

    /// Stdout parsed as JSON, when it is valid JSON.
    #[must_use]
    pub fn stdout_json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.stdout).ok()
    }

    /// Stderr parsed as JSON, when it is valid JSON.
    #[must_use]
    pub fn stderr_json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.stderr).ok()
    }
}

impl Outcome for CommandResult {
    fn succeeded(&self) -> bool {
        self.succeeded
    }
}

/// Result of a successful connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResult {
    /// Always [`CONNECTED_MESSAGE`].
    pub message: String,
}

impl Default for ConnectResult {
    fn default() -> Self {
        Self {
            message: CONNECTED_MESSAGE.to_string(),
        }
    }
}

impl Outcome for ConnectResult {}

/// Attributes of an uploaded file, as reported by the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Remote path.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// Permission bits.
    pub mode: u32,
}

impl Outcome for RemoteFile {}

impl Outcome for Vec<RemoteFile> {}

impl Outcome for () {}

/// Result of removing a remote directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DirRemoval {
    /// Forced removal ran `rm -rf`; its output.
    Command(CommandResult),
    /// Removed with SFTP `rmdir`.
    Removed,
}

impl Outcome for DirRemoval {
    fn succeeded(&self) -> bool {
        match self {
            Self::Command(result) => result.succeeded,
            Self::Removed => true,
        }
    }
}

/// A per-host failure in result-map form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResult {
    /// Always true.
    pub failed: bool,
    /// Always false.
    pub succeeded: bool,
    /// Whether the failure was a command timeout.
    pub timeout: bool,
    /// [`TIMEOUT_RETURN_CODE`] or [`FAILURE_RETURN_CODE`].
    pub return_code: i32,
    /// Output captured before the failure.
    pub stdout: String,
    /// Output captured before the failure.
    pub stderr: String,
    /// Context message followed by the error text.
    pub error: String,
    /// The error and its chain of causes.
    pub traceback: String,
}

impl ErrorResult {
    /// Build from an error, prefixing `context` to its message.
    #[must_use]
    pub fn from_error(context: &str, err: &SshError) -> Self {
        let timeout = err.is_timeout();
        let (stdout, stderr) = err.captured_output().unwrap_or_default();
        Self {
            failed: true,
            succeeded: false,
            timeout,
            return_code: if timeout {
                TIMEOUT_RETURN_CODE
            } else {
                FAILURE_RETURN_CODE
            },
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            error: format!("{context} {err}"),
            traceback: error_chain(err),
        }
    }
}

/// Render an error followed by each of its sources.
#[must_use]
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut out = format!("Error: {err}");
    let mut source = err.source();
    while let Some(cause) = source {
        let _ = write!(out, "\nCaused by: {cause}");
        source = cause.source();
    }
    out
}

/// One host's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HostOutcome<T> {
    /// The failure.
    Err(ErrorResult),
    /// The operation's value.
    Ok(T),
}

impl<T: Outcome> HostOutcome<T> {
    /// Whether the host counts as succeeded.
    pub fn succeeded(&self) -> bool {
        match self {
            Self::Ok(value) => value.succeeded(),
            Self::Err(_) => false,
        }
    }
}

impl<T> HostOutcome<T> {
    /// Whether the host failed with a command timeout.
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Err(e) if e.timeout)
    }

    /// The success value, if any.
    pub const fn ok(&self) -> Option<&T> {
        match self {
            Self::Ok(v) => Some(v),
            Self::Err(_) => None,
        }
    }

    /// The error result, if any.
    pub const fn err(&self) -> Option<&ErrorResult> {
        match self {
            Self::Ok(_) => None,
            Self::Err(e) => Some(e),
        }
    }
}

/// Results of one fleet call, keyed by host identity.
pub type FleetResults<T> = BTreeMap<String, HostOutcome<T>>;

/// Overall status of a fleet call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Every host succeeded, or at least one with partial failure allowed.
    Succeeded,
    /// Not successful, and every host timed out.
    TimedOut,
    /// Not successful.
    Failed,
}

/// Reduce a result map to one status.
///
/// Without `allow_partial_failure` every host must succeed; with it one
/// success is enough. A call that did not succeed is `TimedOut` only if
/// every host timed out.
pub fn overall_status<T: Outcome>(
    results: &FleetResults<T>,
    allow_partial_failure: bool,
) -> ExecutionStatus {
    let succeeded = if allow_partial_failure {
        results.values().any(HostOutcome::succeeded)
    } else {
        results.values().all(HostOutcome::succeeded)
    };
    if succeeded {
        ExecutionStatus::Succeeded
    } else if !results.is_empty() && results.values().all(HostOutcome::is_timeout) {
        ExecutionStatus::TimedOut
    } else {
        ExecutionStatus::Failed
    }
}

static SUDO_ATTEMPTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"sudo: \d+ incorrect password attempts").expect("SUDO_ATTEMPTS is a valid regex")
});

static SUDO_PROMPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[sudo\] password for (.+?):").expect("SUDO_PROMPT is a valid regex")
});

/// Detect a rejected sudo password in command stderr.
///
/// Returns the user sudo prompted for (`unknown` when the prompt is absent).
#[must_use]
pub fn sudo_password_failure(stderr: &str) -> Option<String> {
    if !SUDO_ATTEMPTS.is_match(stderr) {
        return None;
    }
    let user = SUDO_PROMPT
        .captures(stderr)
        .and_then(|c| c.get(1))
        .map_or("unknown", |m| m.as_str());
    Some(user.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn timeout_error() -> SshError {
        SshError::CommandTimeout {
            command: "sleep 9".into(),
            timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
            stdout: "a".into(),
            stderr: "b".into(),
        }
    }

    #[test]
    fn command_result_flags() {
        let ok = CommandResult::new("out", "", 0);
        assert!(ok.succeeded && !ok.failed);
        let bad = CommandResult::new("", "err", 3);
        assert!(!bad.succeeded && bad.failed);
    }

    #[test]
    fn json_output_is_parsed() {
        let r = CommandResult::new(r#"{"foo": "bar"}"#, "plain", 0);
        assert_eq!(r.stdout_json(), Some(serde_json::json!({"foo": "bar"})));
        assert_eq!(r.stderr_json(), None);
    }

    #[test]
    fn timeout_error_result() {
        let r = ErrorResult::from_error("Failed executing command \"sleep 9\" on host \"h\"", &timeout_error());
        assert!(r.failed && !r.succeeded && r.timeout);
        assert_eq!(r.return_code, -9);
        assert_eq!((r.stdout.as_str(), r.stderr.as_str()), ("a", "b"));
        assert!(r.error.starts_with("Failed executing command \"sleep 9\" on host \"h\" Command didn't finish"));
    }

    #[test]
    fn generic_error_result() {
        let err = SshError::Bastion {
            bastion: "jump".into(),
            source: Box::new(SshError::connection("jump", 22, "refused")),
        };
        let r = ErrorResult::from_error("Failed connecting to host h.", &err);
        assert!(!r.timeout);
        assert_eq!(r.return_code, 255);
        assert_eq!(r.stdout, "");
        assert!(r.traceback.contains("Caused by: failed to connect to jump:22: refused"));
    }

    #[test]
    fn outcomes_serialize_flat() {
        let ok: HostOutcome<CommandResult> = HostOutcome::Ok(CommandResult::new("x", "", 0));
        let v = serde_json::to_value(&ok).unwrap();
        assert_eq!(v["return_code"], 0);
        assert_eq!(v["succeeded"], true);

        let err: HostOutcome<CommandResult> =
            HostOutcome::Err(ErrorResult::from_error("ctx", &SshError::NotConnected));
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["failed"], true);
        assert_eq!(v["timeout"], false);

        let back: HostOutcome<CommandResult> = serde_json::from_value(v).unwrap();
        assert!(back.err().is_some());

        let conn = serde_json::to_value(ConnectResult::default()).unwrap();
        assert_eq!(conn, serde_json::json!({"message": "Connected to host."}));
    }

    #[test]
    fn status_aggregation() {
        let mut results: FleetResults<CommandResult> = FleetResults::new();
        results.insert("a".into(), HostOutcome::Ok(CommandResult::new("", "", 0)));
        results.insert("b".into(), HostOutcome::Ok(CommandResult::new("", "", 1)));
        assert_eq!(overall_status(&results, false), ExecutionStatus::Failed);
        assert_eq!(overall_status(&results, true), ExecutionStatus::Succeeded);

        let mut timed_out: FleetResults<CommandResult> = FleetResults::new();
        for host in ["a", "b"] {
            timed_out.insert(
                host.into(),
                HostOutcome::Err(ErrorResult::from_error("ctx", &timeout_error())),
            );
        }
        assert_eq!(overall_status(&timed_out, true), ExecutionStatus::TimedOut);
    }

    #[test]
    fn sudo_detection() {
        let stderr = "[sudo] password for bar: \nsudo: 3 incorrect password attempts";
        assert_eq!(sudo_password_failure(stderr).as_deref(), Some("bar"));
        assert_eq!(
            sudo_password_failure("sudo: 1 incorrect password attempts").as_deref(),
            Some("unknown")
        );
        assert_eq!(sudo_password_failure("permission denied"), None);
    }

    #[test]
    fn dir_removal_success() {
        assert!(DirRemoval::Removed.succeeded());
        assert!(!DirRemoval::Command(CommandResult::new("", "", 1)).succeeded());
    }
}
