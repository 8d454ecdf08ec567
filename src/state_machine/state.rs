use std::fmt;

use serde::{Deserialize, Serialize};

/// Execution states of a remote job.
///
/// Normal flow: NEW → SUBMITTED → RUNNING → TERMINATING → TERMINATED.
/// STOPPED is a side branch (job held or suspended by the backend) and
/// UNKNOWN a transient overlay used when the backend cannot be polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RunState {
    New,
    Submitted,
    Running,
    Stopped,
    Terminating,
    Terminated,
    Unknown,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::New => write!(f, "NEW"),
            RunState::Submitted => write!(f, "SUBMITTED"),
            RunState::Running => write!(f, "RUNNING"),
            RunState::Stopped => write!(f, "STOPPED"),
            RunState::Terminating => write!(f, "TERMINATING"),
            RunState::Terminated => write!(f, "TERMINATED"),
            RunState::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl RunState {
    pub const ALL: [RunState; 7] = [
        RunState::New,
        RunState::Submitted,
        RunState::Running,
        RunState::Stopped,
        RunState::Terminating,
        RunState::Terminated,
        RunState::Unknown,
    ];

    /// Whether the job occupies backend-side resources.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            RunState::Submitted | RunState::Running | RunState::Unknown
        )
    }

    /// Whether a poll of the backend makes sense in this state.
    pub fn is_pollable(self) -> bool {
        !matches!(
            self,
            RunState::New | RunState::Terminating | RunState::Terminated
        )
    }

    /// Transitions reachable through normal operation.
    ///
    /// The forced kill path (any state → TERMINATED) and resets to NEW
    /// through resubmission are deliberate overrides and are not listed.
    pub fn can_transition_to(self, to: RunState) -> bool {
        use RunState::*;
        match (self, to) {
            _ if self == to => true,
            (New, Submitted) | (New, Running) => true,
            (Submitted, Running) | (Submitted, Stopped) | (Submitted, Terminating) => true,
            (Running, Stopped) | (Running, Terminating) => true,
            (Stopped, Submitted) | (Stopped, Running) | (Stopped, Terminating) => true,
            (Submitted, Unknown) | (Running, Unknown) | (Stopped, Unknown) => true,
            (Unknown, Submitted)
            | (Unknown, Running)
            | (Unknown, Stopped)
            | (Unknown, Terminating) => true,
            (Terminating, Terminated) => true,
            _ => false,
        }
    }

    /// States from which a task may be reset to NEW and run again.
    pub fn can_redo(self) -> bool {
        matches!(
            self,
            RunState::New
                | RunState::Stopped
                | RunState::Terminating
                | RunState::Terminated
                | RunState::Unknown
        )
    }
}

/// Pseudo-signals encoding middleware-level termination reasons in the
/// signal part of a return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    Lost,
    Cancelled,
    RemoteKill,
    DataStagingFailure,
    RemoteError,
    SubmissionFailed,
}

impl Signal {
    pub fn code(self) -> u8 {
        match self {
            Signal::Lost => 120,
            Signal::Cancelled => 121,
            Signal::RemoteKill => 122,
            Signal::DataStagingFailure => 123,
            Signal::RemoteError => 124,
            Signal::SubmissionFailed => 125,
        }
    }

    pub fn from_code(code: u8) -> Option<Signal> {
        match code {
            120 => Some(Signal::Lost),
            121 => Some(Signal::Cancelled),
            122 => Some(Signal::RemoteKill),
            123 => Some(Signal::DataStagingFailure),
            124 => Some(Signal::RemoteError),
            125 => Some(Signal::SubmissionFailed),
            _ => None,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Signal::Lost => "Remote site reports no information about the job",
            Signal::Cancelled => "Job canceled by user",
            Signal::RemoteKill => "Job killed by batch system or sysadmin",
            Signal::DataStagingFailure => "Data staging failure",
            Signal::RemoteError => {
                "Unspecified remote error, e.g., execution node crashed or batch system misconfigured"
            }
            Signal::SubmissionFailed => "Submission to batch system failed",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signal {}: {}", self.code(), self.description())
    }
}
