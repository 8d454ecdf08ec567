//! Units of work and the hooks the engine calls on them.
//!
//! A [`Task`] owns its execution record ([`Run`]) and may override any of
//! the optional hooks: resource compatibility and ranking, reactions to
//! submission/update/fetch failures, and state-change notifications.
//! Tasks that delegate to sub-tasks instead of a backend expose the
//! [`Composite`] capability.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::backend::Resource;
use crate::core::Core;
use crate::error::{GridError, Result};
use crate::state_machine::{Run, RunState};

/// Stable identity of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a task is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    /// Runs as one job on one backend; counts against engine limits.
    Job,
    /// Delegates every operation to its sub-tasks.
    Composite,
}

/// Request to persist a task, returned by every operation that changed it.
#[must_use = "pass the request on to the store"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveRequest {
    pub task: TaskId,
}

impl SaveRequest {
    pub fn for_task(task: &dyn Task) -> Self {
        Self { task: task.id() }
    }
}

/// Remote output stream of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Stdout => write!(f, "stdout"),
            Stream::Stderr => write!(f, "stderr"),
        }
    }
}

impl FromStr for Stream {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stdout" => Ok(Stream::Stdout),
            "stderr" => Ok(Stream::Stderr),
            other => Err(GridError::InvalidArgument(format!(
                "stream must be 'stdout' or 'stderr', not '{other}'"
            ))),
        }
    }
}

/// Serializable snapshot of a task, as written by a store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    pub category: String,
    pub kind: TaskKind,
    pub output_dir: Option<PathBuf>,
    pub execution: Run,
}

/// A stateful unit of work driven by [`Core`] and the engine.
///
/// Only `id`, `name`, `execution` and `execution_mut` are required; every
/// other method has a default matching a plain, output-less job.
pub trait Task {
    fn id(&self) -> TaskId;

    fn name(&self) -> &str;

    /// Label used to filter engine statistics.
    fn category(&self) -> &str {
        "Task"
    }

    fn execution(&self) -> &Run;

    fn execution_mut(&mut self) -> &mut Run;

    fn kind(&self) -> TaskKind {
        TaskKind::Job
    }

    /// Tasks of kind [`TaskKind::Composite`] must return `Some` here.
    fn composite(&mut self) -> Option<&mut dyn Composite> {
        None
    }

    /// Keep only the resources able to run this task.
    fn compatible_resources<'r>(&self, resources: Vec<&'r Resource>) -> Vec<&'r Resource> {
        resources
    }

    /// Sort resources in order of preference.
    fn rank_resources<'r>(&self, resources: Vec<&'r Resource>) -> Vec<&'r Resource> {
        resources
    }

    fn requested_cores(&self) -> u32 {
        1
    }

    fn requested_memory_mb(&self) -> Option<u64> {
        None
    }

    /// Local files that must exist before submission.
    fn inputs(&self) -> &[PathBuf] {
        &[]
    }

    /// Remote file name of the given stream, if the task captures it.
    fn stream_name(&self, _stream: Stream) -> Option<&str> {
        None
    }

    fn would_output(&self) -> bool {
        false
    }

    fn output_dir(&self) -> Option<&Path> {
        None
    }

    fn set_output_dir(&mut self, _dir: PathBuf) {}

    /// Where to download output: `None` if the task produces none,
    /// otherwise the override, falling back to `output_dir`.
    fn download_dir(&self, override_dir: Option<&Path>) -> Result<Option<PathBuf>> {
        if !self.would_output() {
            return Ok(None);
        }
        match override_dir.or_else(|| self.output_dir()) {
            Some(dir) => Ok(Some(dir.to_path_buf())),
            None => Err(GridError::InvalidArgument(format!(
                "no download directory for task '{}'",
                self.name()
            ))),
        }
    }

    /// Called once after a successful submission.
    fn submitted(&mut self) {}

    /// All submission attempts failed. Returning an error makes the
    /// submission fail with it; returning `None` swallows the failure.
    fn submit_error(&mut self, errors: Vec<GridError>) -> Option<GridError> {
        // the first error refers to the best-ranked resource
        errors.into_iter().next()
    }

    /// Polling the backend failed. Returning `None` degrades the state to
    /// UNKNOWN; returning an error escalates it.
    fn update_job_state_error(&mut self, err: GridError) -> Option<GridError> {
        if err.aborts_update() || matches!(err, GridError::UnknownJob(_)) {
            Some(err)
        } else {
            None
        }
    }

    /// Output retrieval failed. Returning `None` swallows the failure.
    fn fetch_output_error(&mut self, err: GridError) -> Option<GridError> {
        Some(err)
    }

    /// Notification of a state transition, fired once per real change.
    fn state_changed(&mut self, _from: RunState, _to: RunState) -> Result<()> {
        Ok(())
    }

    /// Reset to NEW so the task runs again.
    fn redo(&mut self) -> Result<()> {
        let from = self.execution().state();
        if !from.can_redo() {
            return Err(GridError::InvalidOperation(format!(
                "can only redo a task in a terminal state; task '{}' is in state {from}",
                self.name()
            )));
        }
        if self.execution_mut().set_state(RunState::New) {
            self.state_changed(from, RunState::New)?;
        }
        Ok(())
    }

    fn record(&self) -> TaskRecord {
        TaskRecord {
            id: self.id(),
            name: self.name().to_string(),
            category: self.category().to_string(),
            kind: self.kind(),
            output_dir: self.output_dir().map(Path::to_path_buf),
            execution: self.execution().clone(),
        }
    }
}

/// Operations of a task that delegates to sub-tasks rather than a backend.
pub trait Composite {
    fn submit(
        &mut self,
        core: &mut Core,
        resubmit: bool,
        targets: Option<&[String]>,
    ) -> Result<Option<SaveRequest>>;

    fn update_state(&mut self, core: &mut Core) -> Result<Option<SaveRequest>>;

    fn fetch_output(
        &mut self,
        core: &mut Core,
        download_dir: Option<&Path>,
        overwrite: bool,
        changed_only: bool,
    ) -> Result<Option<SaveRequest>>;

    fn kill(&mut self, core: &mut Core) -> Result<Option<SaveRequest>>;

    fn peek(
        &mut self,
        core: &mut Core,
        stream: Stream,
        offset: u64,
        size: Option<u64>,
    ) -> Result<File>;

    fn free(&mut self, core: &mut Core) -> Result<()>;
}

/// Move `task` to state `to` and fire its `state_changed` hook.
///
/// Returns `Ok(false)` without side effects if the task is already there.
pub fn transition(task: &mut dyn Task, to: RunState) -> Result<bool> {
    let from = task.execution().state();
    if !task.execution_mut().set_state(to) {
        return Ok(false);
    }
    if !from.can_transition_to(to) {
        // kills and lost jobs jump straight to TERMINATED
        debug!(task = %task.name(), %from, %to, "Forced state transition");
    }
    task.state_changed(from, to)?;
    Ok(true)
}

/// A single command to run on a remote resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    id: TaskId,
    pub name: String,
    pub arguments: Vec<String>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<String>,
    pub output_dir: Option<PathBuf>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub requested_cores: u32,
    pub requested_memory_mb: Option<u64>,
    pub requested_architecture: Option<String>,
    execution: Run,
}

impl Application {
    pub fn new(name: impl Into<String>, arguments: Vec<String>) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            arguments,
            inputs: Vec::new(),
            outputs: Vec::new(),
            output_dir: None,
            stdout: None,
            stderr: None,
            requested_cores: 1,
            requested_memory_mb: None,
            requested_architecture: None,
            execution: Run::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<PathBuf>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<String>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_stdout(mut self, name: impl Into<String>) -> Self {
        self.stdout = Some(name.into());
        self
    }

    pub fn with_stderr(mut self, name: impl Into<String>) -> Self {
        self.stderr = Some(name.into());
        self
    }

    pub fn with_cores(mut self, cores: u32) -> Self {
        self.requested_cores = cores;
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.requested_memory_mb = Some(memory_mb);
        self
    }
}

impl Task for Application {
    fn id(&self) -> TaskId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> &str {
        "Application"
    }

    fn execution(&self) -> &Run {
        &self.execution
    }

    fn execution_mut(&mut self) -> &mut Run {
        &mut self.execution
    }

    fn compatible_resources<'r>(&self, resources: Vec<&'r Resource>) -> Vec<&'r Resource> {
        resources
            .into_iter()
            .filter(|r| {
                let spec = r.spec();
                let cores_ok = self.requested_cores <= spec.max_cores;
                let memory_ok = match (self.requested_memory_mb, spec.max_memory_mb) {
                    (Some(wanted), Some(available)) => wanted <= available,
                    _ => true,
                };
                let arch_ok = match (&self.requested_architecture, &spec.architecture) {
                    (Some(wanted), Some(available)) => wanted == available,
                    _ => true,
                };
                cores_ok && memory_ok && arch_ok
            })
            .collect()
    }

    fn requested_cores(&self) -> u32 {
        self.requested_cores
    }

    fn requested_memory_mb(&self) -> Option<u64> {
        self.requested_memory_mb
    }

    fn inputs(&self) -> &[PathBuf] {
        &self.inputs
    }

    fn stream_name(&self, stream: Stream) -> Option<&str> {
        match stream {
            Stream::Stdout => self.stdout.as_deref(),
            Stream::Stderr => self.stderr.as_deref(),
        }
    }

    fn would_output(&self) -> bool {
        self.output_dir.is_some()
            || !self.outputs.is_empty()
            || self.stdout.is_some()
            || self.stderr.is_some()
    }

    fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    fn set_output_dir(&mut self, dir: PathBuf) {
        self.output_dir = Some(dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ResourceSpec;

    struct Recorder {
        id: TaskId,
        execution: Run,
        seen: Vec<(RunState, RunState)>,
    }

    impl Task for Recorder {
        fn id(&self) -> TaskId {
            self.id
        }
        fn name(&self) -> &str {
            "recorder"
        }
        fn execution(&self) -> &Run {
            &self.execution
        }
        fn execution_mut(&mut self) -> &mut Run {
            &mut self.execution
        }
        fn state_changed(&mut self, from: RunState, to: RunState) -> Result<()> {
            self.seen.push((from, to));
            Ok(())
        }
    }

    #[test]
    fn transition_fires_hook_once_per_change() {
        let mut task = Recorder {
            id: TaskId::new(),
            execution: Run::new(),
            seen: Vec::new(),
        };
        assert!(transition(&mut task, RunState::Submitted).unwrap());
        assert!(!transition(&mut task, RunState::Submitted).unwrap());
        assert!(transition(&mut task, RunState::Running).unwrap());
        assert_eq!(
            task.seen,
            vec![
                (RunState::New, RunState::Submitted),
                (RunState::Submitted, RunState::Running)
            ]
        );
    }

    #[test]
    fn redo_only_from_resettable_states() {
        let mut app = Application::new("sim", vec![]);
        transition(&mut app, RunState::Submitted).unwrap();
        assert!(matches!(app.redo(), Err(GridError::InvalidOperation(_))));

        transition(&mut app, RunState::Running).unwrap();
        transition(&mut app, RunState::Terminating).unwrap();
        transition(&mut app, RunState::Terminated).unwrap();
        app.redo().unwrap();
        assert_eq!(app.execution().state(), RunState::New);
    }

    #[test]
    fn default_update_error_hook_swallows_transient_errors() {
        let mut app = Application::new("sim", vec![]);
        assert!(
            app.update_job_state_error(GridError::Backend("timeout".into()))
                .is_none()
        );
        assert!(
            app.update_job_state_error(GridError::UnknownJob("42".into()))
                .is_some()
        );
        assert!(
            app.update_job_state_error(GridError::Configuration("bad".into()))
                .is_some()
        );
    }

    #[test]
    fn default_submit_error_returns_first() {
        let mut app = Application::new("sim", vec![]);
        let err = app
            .submit_error(vec![
                GridError::Backend("first".into()),
                GridError::Backend("second".into()),
            ])
            .unwrap();
        assert_eq!(err.to_string(), "Backend error: first");
    }

    #[test]
    fn download_dir_resolution() {
        let app = Application::new("sim", vec![]);
        assert_eq!(app.download_dir(None).unwrap(), None);

        let app = Application::new("sim", vec![]).with_output_dir("/tmp/out");
        assert_eq!(
            app.download_dir(None).unwrap(),
            Some(PathBuf::from("/tmp/out"))
        );
        assert_eq!(
            app.download_dir(Some(Path::new("/tmp/other"))).unwrap(),
            Some(PathBuf::from("/tmp/other"))
        );

        let app = Application::new("sim", vec![]).with_outputs(vec!["result.dat".into()]);
        assert!(matches!(
            app.download_dir(None),
            Err(GridError::InvalidArgument(_))
        ));
    }

    #[test]
    fn application_compatibility_checks_requirements() {
        let mut small = ResourceSpec::new("small").with_max_cores(2);
        small.max_memory_mb = Some(1024);
        let big = ResourceSpec::new("big").with_max_cores(64);
        let small = Resource::from_spec(small).unwrap();
        let big = Resource::from_spec(big).unwrap();

        let app = Application::new("sim", vec![]).with_cores(4);
        let names: Vec<&str> = app
            .compatible_resources(vec![&small, &big])
            .iter()
            .map(|r| r.name())
            .collect();
        assert_eq!(names, vec!["big"]);

        let app = Application::new("sim", vec![]).with_memory_mb(2048);
        let names: Vec<&str> = app
            .compatible_resources(vec![&small, &big])
            .iter()
            .map(|r| r.name())
            .collect();
        assert_eq!(names, vec!["big"]);
    }

    #[test]
    fn stream_parsing() {
        assert_eq!("stdout".parse::<Stream>().unwrap(), Stream::Stdout);
        assert_eq!("stderr".parse::<Stream>().unwrap(), Stream::Stderr);
        assert!("stdin".parse::<Stream>().is_err());
    }

    #[test]
    fn record_snapshot() {
        let app = Application::new("sim", vec!["--fast".into()]).with_output_dir("/tmp/out");
        let record = app.record();
        assert_eq!(record.id, app.id());
        assert_eq!(record.category, "Application");
        assert_eq!(record.kind, TaskKind::Job);
        assert_eq!(record.output_dir, Some(PathBuf::from("/tmp/out")));
        let json = serde_json::to_string(&record).unwrap();
        let back: TaskRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "sim");
    }
}
