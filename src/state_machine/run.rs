use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::{RunState, Signal};

/// One line of a task's execution history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Execution record of a task: state, placement, termination status and
/// an append-only history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    state: RunState,
    resource_name: Option<String>,
    /// Backend-specific job identifier.
    pub job_id: Option<String>,
    signal: Option<u8>,
    exitcode: Option<u8>,
    history: Vec<HistoryEntry>,
    timestamps: BTreeMap<RunState, DateTime<Utc>>,
    state_last_changed: DateTime<Utc>,
    // Consecutive failed polls of the backend.
    poll_failures: u32,
}

impl Default for Run {
    fn default() -> Self {
        Self::new()
    }
}

impl Run {
    pub fn new() -> Self {
        let now = Utc::now();
        let mut timestamps = BTreeMap::new();
        timestamps.insert(RunState::New, now);
        Self {
            state: RunState::New,
            resource_name: None,
            job_id: None,
            signal: None,
            exitcode: None,
            history: Vec::new(),
            timestamps,
            state_last_changed: now,
            poll_failures: 0,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Move to `to`, recording the transition in the history.
    ///
    /// Returns `false` (and records nothing) if the state is unchanged.
    /// Resetting to NEW forgets the resource the job was placed on.
    pub(crate) fn set_state(&mut self, to: RunState) -> bool {
        if self.state == to {
            return false;
        }
        let now = Utc::now();
        let message = if to == RunState::Terminated {
            format!(
                "Transition from state {} to state {} (returncode: {})",
                self.state,
                to,
                self.returncode()
                    .map(|rc| rc.to_string())
                    .unwrap_or_else(|| "none".to_string())
            )
        } else {
            format!("Transition from state {} to state {}", self.state, to)
        };
        self.history.push(HistoryEntry { at: now, message });
        self.timestamps.insert(to, now);
        self.state_last_changed = now;
        if to == RunState::New {
            self.resource_name = None;
            self.job_id = None;
            self.poll_failures = 0;
        }
        self.state = to;
        true
    }

    pub fn resource_name(&self) -> Option<&str> {
        self.resource_name.as_deref()
    }

    pub(crate) fn assign_resource(&mut self, name: &str) {
        self.resource_name = Some(name.to_string());
    }

    /// Append a message to the history.
    pub fn history(&mut self, message: impl Into<String>) {
        self.history.push(HistoryEntry {
            at: Utc::now(),
            message: message.into(),
        });
    }

    pub fn history_entries(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Latest history message.
    pub fn info(&self) -> Option<&str> {
        self.history.last().map(|e| e.message.as_str())
    }

    pub fn timestamp(&self, state: RunState) -> Option<DateTime<Utc>> {
        self.timestamps.get(&state).copied()
    }

    pub fn state_last_changed(&self) -> DateTime<Utc> {
        self.state_last_changed
    }

    pub fn signal(&self) -> Option<u8> {
        self.signal
    }

    pub fn set_signal(&mut self, signal: Option<u8>) {
        self.signal = signal.map(|s| s & 0x7f);
    }

    pub fn exitcode(&self) -> Option<u8> {
        self.exitcode
    }

    pub fn set_exitcode(&mut self, exitcode: Option<u8>) {
        self.exitcode = exitcode;
    }

    /// POSIX-style termination status: exit code in bits 8..16, signal
    /// number in bits 0..7. `None` until either part is known.
    pub fn returncode(&self) -> Option<i32> {
        if self.signal.is_none() && self.exitcode.is_none() {
            return None;
        }
        let exitcode = i32::from(self.exitcode.unwrap_or(0));
        let signal = i32::from(self.signal.unwrap_or(0));
        Some((exitcode << 8) | signal)
    }

    pub fn set_returncode(&mut self, signal: u8, exitcode: u8) {
        self.signal = Some(signal & 0x7f);
        self.exitcode = Some(exitcode);
    }

    pub fn set_termination(&mut self, signal: Signal, exitcode: u8) {
        self.set_returncode(signal.code(), exitcode);
    }

    /// Pseudo-signal carried in the return code, if any.
    pub fn termination_signal(&self) -> Option<Signal> {
        self.signal.and_then(Signal::from_code)
    }

    pub fn is_ok(&self) -> bool {
        self.state == RunState::Terminated && self.returncode() == Some(0)
    }

    pub fn is_failed(&self) -> bool {
        self.state == RunState::Terminated && self.returncode() != Some(0)
    }

    pub fn poll_failures(&self) -> u32 {
        self.poll_failures
    }

    pub(crate) fn record_poll_failure(&mut self) -> u32 {
        self.poll_failures += 1;
        self.poll_failures
    }

    pub(crate) fn reset_poll_failures(&mut self) {
        self.poll_failures = 0;
    }
}
