//! Process and step domain types
//!
//! A [`Process`] is one durable instance of a multi-step workflow. It owns
//! its [`ProcessStep`]s exclusively; steps are created over the lifetime of
//! the process and each carries a terminal status once resolved. Failed
//! steps are never mutated back to success: recovery creates a new step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a single process step
///
/// `InProgress` is the claim state: exactly one worker may hold a step in
/// this state, enforced by the store's atomic claim. `Skipped` records a
/// manual operator override (the step's intent was satisfied elsewhere).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStepStatus {
    /// Step is eligible for execution
    Todo,

    /// Step has been claimed by a worker and is executing
    InProgress,

    /// Step completed successfully (terminal)
    Done,

    /// Step failed (terminal for this step instance)
    Failed,

    /// Step was skipped by operator override (terminal)
    Skipped,
}

impl ProcessStepStatus {
    /// Whether this status is terminal (the step will never run again)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for ProcessStepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Todo => write!(f, "todo"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for ProcessStepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(Self::Todo),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

/// A durable process instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    /// Process ID
    pub id: Uuid,

    /// Process type label, fixed at creation
    pub process_type: String,

    /// Domain entity this process works on, if any (an offer subscription,
    /// a company application, a connector); the engine never dereferences it
    pub correlation_id: Option<Uuid>,

    /// When the process was created
    pub created_at: DateTime<Utc>,
}

/// One attempted unit of work within a process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessStep {
    /// Step ID
    pub id: Uuid,

    /// Owning process
    pub process_id: Uuid,

    /// Step type label, scoped to the process's type
    pub step_type: String,

    /// Current status
    pub status: ProcessStepStatus,

    /// Outcome message or error payload
    pub message: Option<String>,

    /// For retrigger steps: the failed step this one recovers
    pub attempt_of: Option<Uuid>,

    /// When the step was created (insertion order drives FIFO execution)
    pub created_at: DateTime<Utc>,

    /// Last status change
    pub modified_at: DateTime<Utc>,
}

impl ProcessStep {
    /// Whether this step is a retrigger of an earlier failed step
    pub fn is_retrigger(&self) -> bool {
        self.attempt_of.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_status_display_roundtrip() {
        for status in [
            ProcessStepStatus::Todo,
            ProcessStepStatus::InProgress,
            ProcessStepStatus::Done,
            ProcessStepStatus::Failed,
            ProcessStepStatus::Skipped,
        ] {
            let parsed = ProcessStepStatus::from_str(&status.to_string()).unwrap();
            assert_eq!(status, parsed);
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!ProcessStepStatus::Todo.is_terminal());
        assert!(!ProcessStepStatus::InProgress.is_terminal());
        assert!(ProcessStepStatus::Done.is_terminal());
        assert!(ProcessStepStatus::Failed.is_terminal());
        assert!(ProcessStepStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_unknown_status_rejected() {
        assert!(ProcessStepStatus::from_str("pending").is_err());
    }
}
