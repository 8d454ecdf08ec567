//! Scripted backend and task doubles shared by the unit tests.

use std::cell::RefCell;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::rc::Rc;

use crate::backend::{Backend, Resource, ResourceSpec};
use crate::error::{GridError, Result};
use crate::state_machine::{Run, RunState};
use crate::task::{Task, TaskId};

/// Errors are produced fresh on every call since `GridError` is not `Clone`.
pub type ErrorFn = Option<fn() -> GridError>;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Calls {
    pub submit: usize,
    pub update: usize,
    pub fetch: usize,
    pub cancel: usize,
    pub free: usize,
    pub peek: usize,
    pub status: usize,
}

/// What a [`ScriptedBackend`] answers, and a log of what it was asked.
#[derive(Debug)]
pub struct Script {
    /// State reported by every poll.
    pub state: RunState,
    /// Return code `(signal, exitcode)` recorded when reporting TERMINATING.
    pub returncode: Option<(u8, u8)>,
    pub submit_error: ErrorFn,
    pub update_error: ErrorFn,
    pub fetch_error: ErrorFn,
    pub cancel_error: ErrorFn,
    pub free_error: ErrorFn,
    pub status_error: ErrorFn,
    pub peek_data: Vec<u8>,
    pub calls: Calls,
    pub submitted: Vec<String>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            state: RunState::Submitted,
            returncode: None,
            submit_error: None,
            update_error: None,
            fetch_error: None,
            cancel_error: None,
            free_error: None,
            status_error: None,
            peek_data: Vec::new(),
            calls: Calls::default(),
            submitted: Vec::new(),
        }
    }
}

pub struct ScriptedBackend {
    script: Rc<RefCell<Script>>,
}

fn fail(error: ErrorFn) -> Result<()> {
    match error {
        Some(make) => Err(make()),
        None => Ok(()),
    }
}

impl Backend for ScriptedBackend {
    fn submit_job(&mut self, task: &mut dyn Task) -> Result<()> {
        let mut script = self.script.borrow_mut();
        script.calls.submit += 1;
        fail(script.submit_error)?;
        script.submitted.push(task.name().to_string());
        Ok(())
    }

    fn update_job_state(&mut self, task: &mut dyn Task) -> Result<RunState> {
        let mut script = self.script.borrow_mut();
        script.calls.update += 1;
        fail(script.update_error)?;
        if script.state == RunState::Terminating {
            let (signal, exitcode) = script.returncode.unwrap_or((0, 0));
            task.execution_mut().set_returncode(signal, exitcode);
        }
        Ok(script.state)
    }

    fn get_results(
        &mut self,
        _task: &mut dyn Task,
        _download_dir: &Path,
        _overwrite: bool,
        _changed_only: bool,
    ) -> Result<()> {
        let mut script = self.script.borrow_mut();
        script.calls.fetch += 1;
        fail(script.fetch_error)
    }

    fn cancel_job(&mut self, _task: &mut dyn Task) -> Result<()> {
        let mut script = self.script.borrow_mut();
        script.calls.cancel += 1;
        fail(script.cancel_error)
    }

    fn free(&mut self, _task: &mut dyn Task) -> Result<()> {
        let mut script = self.script.borrow_mut();
        script.calls.free += 1;
        fail(script.free_error)
    }

    fn peek(
        &mut self,
        _task: &dyn Task,
        _remote_filename: &str,
        local: &mut File,
        offset: u64,
        size: Option<u64>,
    ) -> Result<()> {
        let mut script = self.script.borrow_mut();
        script.calls.peek += 1;
        let start = (offset as usize).min(script.peek_data.len());
        let end = match size {
            Some(size) => (start + size as usize).min(script.peek_data.len()),
            None => script.peek_data.len(),
        };
        local.seek(SeekFrom::Start(0))?;
        local.write_all(&script.peek_data[start..end])?;
        Ok(())
    }

    fn get_resource_status(&mut self) -> Result<()> {
        let mut script = self.script.borrow_mut();
        script.calls.status += 1;
        fail(script.status_error)
    }
}

/// A resource backed by a [`ScriptedBackend`], plus the handle to script it.
pub fn scripted(name: &str) -> (Resource, Rc<RefCell<Script>>) {
    let script = Rc::new(RefCell::new(Script::default()));
    let backend = ScriptedBackend {
        script: Rc::clone(&script),
    };
    (
        Resource::new(ResourceSpec::new(name), Box::new(backend)),
        script,
    )
}

/// A job whose hooks can be switched to misbehave.
pub struct TestTask {
    id: TaskId,
    name: String,
    execution: Run,
    pub category: String,
    pub swallow_submit_errors: bool,
    pub escalate_update_errors: bool,
    pub fail_state_hook: bool,
    pub transitions: Vec<(RunState, RunState)>,
}

impl TestTask {
    pub fn new(name: &str) -> Self {
        Self {
            id: TaskId::new(),
            name: name.to_string(),
            execution: Run::new(),
            category: "TestTask".to_string(),
            swallow_submit_errors: false,
            escalate_update_errors: false,
            fail_state_hook: false,
            transitions: Vec::new(),
        }
    }
}

impl Task for TestTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> &str {
        &self.category
    }

    fn execution(&self) -> &Run {
        &self.execution
    }

    fn execution_mut(&mut self) -> &mut Run {
        &mut self.execution
    }

    fn submit_error(&mut self, errors: Vec<GridError>) -> Option<GridError> {
        if self.swallow_submit_errors {
            None
        } else {
            errors.into_iter().next()
        }
    }

    fn update_job_state_error(&mut self, err: GridError) -> Option<GridError> {
        if self.escalate_update_errors || err.aborts_update() {
            Some(err)
        } else {
            None
        }
    }

    fn state_changed(&mut self, from: RunState, to: RunState) -> Result<()> {
        self.transitions.push((from, to));
        if self.fail_state_hook {
            return Err(GridError::Internal(format!(
                "hook refused {from} -> {to}"
            )));
        }
        Ok(())
    }
}
