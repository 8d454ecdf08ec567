//! Composite tasks.

use std::fs::File;
use std::path::Path;

use tracing::{debug, warn};

use crate::core::Core;
use crate::error::{GridError, Result};
use crate::state_machine::{Run, RunState, Signal};
use crate::task::{Composite, SaveRequest, Stream, Task, TaskId, TaskKind, transition};

/// Exit code of a collection with at least one failed child.
const EX_SOFTWARE: u8 = 70;

/// Runs all its children at the same time.
///
/// The collection's own state summarizes the children: any STOPPED,
/// UNKNOWN, RUNNING or SUBMITTED child (checked in that order) gives the
/// collection that state; otherwise a mix of NEW and finished children is
/// RUNNING, all NEW is NEW, and TERMINATED once every child is done.
pub struct ParallelCollection {
    id: TaskId,
    name: String,
    tasks: Vec<Box<dyn Task>>,
    execution: Run,
}

impl ParallelCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            tasks: Vec::new(),
            execution: Run::new(),
        }
    }

    pub fn with_task(mut self, task: Box<dyn Task>) -> Self {
        self.add(task);
        self
    }

    pub fn add(&mut self, task: Box<dyn Task>) {
        self.tasks.push(task);
    }

    pub fn tasks(&self) -> &[Box<dyn Task>] {
        &self.tasks
    }

    fn aggregate_state(&self) -> RunState {
        if self.tasks.is_empty() {
            return RunState::Terminated;
        }
        let has = |state: RunState| {
            self.tasks
                .iter()
                .any(|t| t.execution().state() == state)
        };
        for state in [
            RunState::Stopped,
            RunState::Unknown,
            RunState::Running,
            RunState::Submitted,
        ] {
            if has(state) {
                return state;
            }
        }
        let all = |state: RunState| {
            self.tasks
                .iter()
                .all(|t| t.execution().state() == state)
        };
        if all(RunState::New) {
            RunState::New
        } else if has(RunState::New) {
            RunState::Running
        } else if has(RunState::Terminating) {
            RunState::Terminating
        } else {
            RunState::Terminated
        }
    }

    /// Set the collection's return code from its children.
    fn summarize(&mut self) {
        let failed = self
            .tasks
            .iter()
            .any(|t| t.execution().returncode() != Some(0));
        let exitcode = if failed { EX_SOFTWARE } else { 0 };
        self.execution.set_returncode(0, exitcode);
    }

    /// Submit children still NEW, stopping at the first one that cannot go.
    fn submit_pending(&mut self, core: &mut Core) -> Result<()> {
        for task in &mut self.tasks {
            if task.execution().state() != RunState::New {
                continue;
            }
            match core.submit(task.as_mut(), false, None) {
                Ok(_) => {}
                Err(err) if !err.is_fatal() => {
                    debug!(
                        collection = %self.name,
                        task = %task.name(),
                        "Child not submitted yet: {err}"
                    );
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn refresh(&mut self) -> Result<Option<SaveRequest>> {
        let state = self.aggregate_state();
        if state == RunState::Terminated && self.execution.state() != RunState::Terminated {
            self.summarize();
        }
        if transition(self, state)? {
            Ok(Some(SaveRequest::for_task(self)))
        } else {
            Ok(None)
        }
    }
}

impl Task for ParallelCollection {
    fn id(&self) -> TaskId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> &str {
        "ParallelCollection"
    }

    fn execution(&self) -> &Run {
        &self.execution
    }

    fn execution_mut(&mut self) -> &mut Run {
        &mut self.execution
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Composite
    }

    fn composite(&mut self) -> Option<&mut dyn Composite> {
        Some(self)
    }

    fn redo(&mut self) -> Result<()> {
        let from = self.execution.state();
        if !from.can_redo() {
            return Err(GridError::InvalidOperation(format!(
                "can only redo a collection in a terminal state; '{}' is in state {from}",
                self.name
            )));
        }
        for task in &mut self.tasks {
            if task.execution().state() != RunState::New {
                task.redo()?;
            }
        }
        transition(self, RunState::New)?;
        Ok(())
    }
}

impl Composite for ParallelCollection {
    fn submit(
        &mut self,
        core: &mut Core,
        resubmit: bool,
        targets: Option<&[String]>,
    ) -> Result<Option<SaveRequest>> {
        let mut submitted_any = false;
        for task in &mut self.tasks {
            match core.submit(task.as_mut(), resubmit, targets) {
                Ok(_) => submitted_any = true,
                // children left NEW are retried by `update_state`
                Err(err) if submitted_any && !err.is_fatal() => {
                    debug!(collection = %self.name, "Stopping submission: {err}");
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        self.refresh()
    }

    fn update_state(&mut self, core: &mut Core) -> Result<Option<SaveRequest>> {
        core.update_job_state(&mut self.tasks)?;
        for task in &mut self.tasks {
            if task.execution().state() != RunState::Terminating {
                continue;
            }
            if let Err(err) = core.fetch_output(task.as_mut(), None, false, true) {
                warn!(
                    collection = %self.name,
                    task = %task.name(),
                    "Could not fetch output of finished child: {err}"
                );
            }
        }
        self.submit_pending(core)?;
        self.refresh()
    }

    fn fetch_output(
        &mut self,
        core: &mut Core,
        download_dir: Option<&Path>,
        overwrite: bool,
        changed_only: bool,
    ) -> Result<Option<SaveRequest>> {
        for task in &mut self.tasks {
            let state = task.execution().state();
            if matches!(state, RunState::Running | RunState::Terminating) {
                let dir = download_dir.map(|d| d.join(task.name()));
                core.fetch_output(task.as_mut(), dir.as_deref(), overwrite, changed_only)?;
            }
        }
        self.refresh()
    }

    fn kill(&mut self, core: &mut Core) -> Result<Option<SaveRequest>> {
        for task in &mut self.tasks {
            core.kill(task.as_mut())?;
        }
        self.execution.set_termination(Signal::Cancelled, 0);
        transition(self, RunState::Terminated)?;
        self.execution.history("Cancelled");
        Ok(Some(SaveRequest::for_task(self)))
    }

    fn peek(
        &mut self,
        _core: &mut Core,
        stream: Stream,
        _offset: u64,
        _size: Option<u64>,
    ) -> Result<File> {
        Err(GridError::InvalidOperation(format!(
            "cannot peek at {stream} of collection '{}'",
            self.name
        )))
    }

    fn free(&mut self, core: &mut Core) -> Result<()> {
        for task in &mut self.tasks {
            if !matches!(
                task.execution().state(),
                RunState::Terminating | RunState::Terminated
            ) {
                continue;
            }
            if let Err(err) = core.free(task.as_mut()) {
                warn!(
                    collection = %self.name,
                    task = %task.name(),
                    "Could not free resources of child: {err}"
                );
            }
        }
        Ok(())
    }
}
