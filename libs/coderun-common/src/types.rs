use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::tasks::UnsupportedLanguageError;

/// Runtimes the pipeline knows how to launch. This set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Go,
}

impl Language {
    pub const ALL: [Language; 2] = [Language::Python, Language::Go];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Go => "go",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = UnsupportedLanguageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" => Ok(Language::Python),
            "go" => Ok(Language::Go),
            _ => Err(UnsupportedLanguageError(s.to_string())),
        }
    }
}

/// Lifecycle of a single execution.
///
/// Progression is strictly forward: `Queued` -> `Running` -> one of the
/// terminal states. `Queued` may jump straight to a terminal state when the
/// attempt dies before the subprocess starts (undecodable payload, or a
/// timeout that fires before the running mark lands).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        }
    }

    /// Representation exposed over HTTP.
    pub fn external(&self) -> String {
        self.as_str().to_uppercase()
    }

    /// States a record may be in for a write of `self` to be accepted.
    ///
    /// `Running` accepts itself so that an orphaned attempt recovered by the
    /// broker can mark the record again before re-running. `Completed` only
    /// follows `Running`; `Queued` may jump to `Failed` (undecodable task) or
    /// `Timeout` (cancelled before start).
    pub fn predecessors(&self) -> &'static [ExecutionStatus] {
        match self {
            ExecutionStatus::Queued => &[],
            ExecutionStatus::Running => &[ExecutionStatus::Queued, ExecutionStatus::Running],
            ExecutionStatus::Completed => &[ExecutionStatus::Running],
            ExecutionStatus::Failed | ExecutionStatus::Timeout => {
                &[ExecutionStatus::Queued, ExecutionStatus::Running]
            }
        }
    }

    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        next.predecessors().contains(self)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(ExecutionStatus::Queued),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "timeout" => Ok(ExecutionStatus::Timeout),
            other => Err(format!("unknown execution status: {}", other)),
        }
    }
}

/// Captured result of one subprocess run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: i16,
}

impl RunOutput {
    /// Saturates elapsed wall-clock time into the persisted i16 column.
    pub fn clamp_millis(elapsed: std::time::Duration) -> i16 {
        i16::try_from(elapsed.as_millis()).unwrap_or(i16::MAX)
    }
}

/// One attempt to run a session's source code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub session_id: Option<Uuid>,
    pub status: ExecutionStatus,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub execution_time_ms: Option<i16>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    pub fn queued(id: Uuid, session_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id,
            session_id,
            status: ExecutionStatus::Queued,
            stdout: None,
            stderr: None,
            execution_time_ms: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
}

impl SessionStatus {
    pub fn external(&self) -> String {
        match self {
            SessionStatus::Active => "ACTIVE".to_string(),
        }
    }
}

/// Editable code submission. The language is kept as submitted and only
/// validated when a run is encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeSession {
    pub id: Uuid,
    pub language: String,
    pub source_code: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CodeSession {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            language: Language::Python.to_string(),
            source_code: String::new(),
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Default for CodeSession {
    fn default() -> Self {
        Self::new()
    }
}
