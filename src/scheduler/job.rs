use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::remote::executor::{CommandOutput, Completion};
use crate::ssh::params::ConnectionParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Command,
    Script,
    Transfer,
    ToolInvocation,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Command => write!(f, "command"),
            JobKind::Script => write!(f, "script"),
            JobKind::Transfer => write!(f, "transfer"),
            JobKind::ToolInvocation => write!(f, "tool_invocation"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Success => write!(f, "success"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Legal moves: queued -> running | cancelled, running -> any terminal.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Cancelled)
                | (
                    JobStatus::Running,
                    JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled
                )
        )
    }
}

/// What to run, where. Immutable once submitted.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub target: ConnectionParams,
    pub kind: JobKind,
    /// Command line, script path or local path to transfer, depending on `kind`.
    pub command: String,
    /// Remote destination directory for transfers.
    pub destination: Option<String>,
    pub timeout: Option<Duration>,
    /// Log output chunks as they arrive.
    pub verbose: bool,
}

impl ExecutionRequest {
    pub fn new(target: ConnectionParams, kind: JobKind, command: impl Into<String>) -> Self {
        Self {
            target,
            kind,
            command: command.into(),
            destination: None,
            timeout: None,
            verbose: false,
        }
    }

    pub fn command(target: ConnectionParams, command: impl Into<String>) -> Self {
        Self::new(target, JobKind::Command, command)
    }

    pub fn script(target: ConnectionParams, path: impl Into<String>) -> Self {
        Self::new(target, JobKind::Script, path)
    }

    pub fn transfer(target: ConnectionParams, local_path: impl Into<String>) -> Self {
        Self::new(target, JobKind::Transfer, local_path)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_destination(mut self, remote_dir: impl Into<String>) -> Self {
        self.destination = Some(remote_dir.into());
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Tracked state of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub target_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub command: String,
    pub output: String,
    pub error: String,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
}

impl JobRecord {
    pub fn new(request: &ExecutionRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_id: request.target.target_id(),
            kind: request.kind,
            status: JobStatus::Queued,
            command: request.command.clone(),
            output: String::new(),
            error: String::new(),
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_secs: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a status change if the state machine allows it. Terminal moves
    /// stamp the completion time and duration.
    pub fn transition(&mut self, next: JobStatus, at: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next == JobStatus::Running {
            self.started_at = Some(at);
        }
        if next.is_terminal() {
            self.completed_at = Some(at);
            self.duration_secs = Some(match self.started_at {
                Some(started) => (at - started).num_milliseconds().max(0) as f64 / 1000.0,
                None => 0.0,
            });
        }
        true
    }
}

/// What a unit of work reports back to the tracker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutcome {
    pub success: bool,
    pub output: String,
    pub error: String,
}

impl JobOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: String::new(),
        }
    }

    pub fn failure(output: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            error: error.into(),
        }
    }
}

impl From<CommandOutput> for JobOutcome {
    fn from(out: CommandOutput) -> Self {
        let success = out.succeeded();
        let mut error = out.stderr;
        let note = match out.completion {
            Completion::TimedOut => Some(format!(
                "command timed out after {:.1}s",
                out.elapsed.as_secs_f64()
            )),
            Completion::Cancelled => Some("command cancelled".to_string()),
            Completion::Exited(Some(code)) if code != 0 && error.trim().is_empty() => {
                Some(format!("exit code {code}"))
            }
            Completion::Exited(_) => None,
        };
        if let Some(note) = note {
            if !error.is_empty() && !error.ends_with('\n') {
                error.push('\n');
            }
            error.push_str(&note);
        }
        Self {
            success,
            output: out.stdout,
            error,
        }
    }
}
