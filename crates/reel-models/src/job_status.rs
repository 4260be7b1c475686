//! Job lifecycle status and the static transition table.
//!
//! Every status change in the pipeline names the status it expects to
//! replace. A change is only legal if the `(from, to)` pair appears in
//! [`TRANSITIONS`]; stores reject anything else as an illegal transition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a generation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Submitted, waiting for the script stage
    #[default]
    PendingScript,
    /// Script written, scene tasks fanned out
    GeneratingScenes,
    /// All scenes accounted for, composition in progress
    Composing,
    /// Composed asset written, upload in progress
    Publishing,
    /// Published
    Complete,
    /// Gave up; never leaves this state
    Failed,
}

/// Allowed `(expected, new)` status pairs.
pub const TRANSITIONS: &[(JobStatus, JobStatus)] = &[
    (JobStatus::PendingScript, JobStatus::GeneratingScenes),
    (JobStatus::PendingScript, JobStatus::Failed),
    (JobStatus::GeneratingScenes, JobStatus::Composing),
    (JobStatus::GeneratingScenes, JobStatus::Failed),
    (JobStatus::Composing, JobStatus::Publishing),
    (JobStatus::Composing, JobStatus::Failed),
    (JobStatus::Publishing, JobStatus::Complete),
    (JobStatus::Publishing, JobStatus::Failed),
];

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::PendingScript,
        JobStatus::GeneratingScenes,
        JobStatus::Composing,
        JobStatus::Publishing,
        JobStatus::Complete,
        JobStatus::Failed,
    ];

    /// Get string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::PendingScript => "PENDING_SCRIPT",
            JobStatus::GeneratingScenes => "GENERATING_SCENES",
            JobStatus::Composing => "COMPOSING",
            JobStatus::Publishing => "PUBLISHING",
            JobStatus::Complete => "COMPLETE",
            JobStatus::Failed => "FAILED",
        }
    }

    /// Check if this is a terminal state (no more transitions permitted).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }

    /// Whether `self -> next` appears in the transition table.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        TRANSITIONS.iter().any(|&(from, to)| from == *self && to == next)
    }

    /// The status that follows `self` on the success path, if any.
    pub fn next_on_success(&self) -> Option<JobStatus> {
        match self {
            JobStatus::PendingScript => Some(JobStatus::GeneratingScenes),
            JobStatus::GeneratingScenes => Some(JobStatus::Composing),
            JobStatus::Composing => Some(JobStatus::Publishing),
            JobStatus::Publishing => Some(JobStatus::Complete),
            JobStatus::Complete | JobStatus::Failed => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when parsing an unknown status string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}
