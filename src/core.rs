//! Synchronous task primitives: submit, update, fetch, kill, peek, free.
//!
//! [`Core`] owns the configured resources and performs each operation
//! right away, one task at a time. Composite tasks are handed to their own
//! [`Composite`](crate::task::Composite) implementation; plain jobs go
//! through the backend of the resource they were placed on, looked up by
//! name on every call.
//!
//! Operations that change a task return `Some(SaveRequest)` so the caller
//! can persist it.

use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::backend::Resource;
use crate::config::{CoreOptions, GridConfig};
use crate::error::{GridError, Result};
use crate::matchmaker::{DefaultMatchMaker, MatchMaker};
use crate::policy::{ErrorContext, ErrorPolicy, KeywordPolicy, ignorable};
use crate::state_machine::{Run, RunState, Signal};
use crate::task::{SaveRequest, Stream, Task, transition};

/// Selects resources by name pattern or arbitrary predicate.
pub enum ResourceMatch {
    /// Shell glob over resource names, e.g. `cluster-*`.
    Pattern(String),
    Predicate(Box<dyn Fn(&Resource) -> bool>),
}

impl ResourceMatch {
    fn matcher(&self) -> Result<Box<dyn Fn(&Resource) -> bool + '_>> {
        match self {
            ResourceMatch::Pattern(pattern) => {
                let pattern = glob::Pattern::new(pattern).map_err(|e| {
                    GridError::InvalidArgument(format!("bad resource pattern '{pattern}': {e}"))
                })?;
                Ok(Box::new(move |r: &Resource| pattern.matches(r.name())))
            }
            ResourceMatch::Predicate(predicate) => Ok(Box::new(|r: &Resource| predicate(r))),
        }
    }
}

pub struct Core {
    resources: Vec<Resource>,
    matchmaker: Box<dyn MatchMaker>,
    error_policy: Box<dyn ErrorPolicy>,
    options: CoreOptions,
}

impl Core {
    pub fn new(resources: Vec<Resource>) -> Result<Self> {
        if resources.is_empty() {
            return Err(GridError::NoResources(
                "no computational resource defined".to_string(),
            ));
        }
        for (i, resource) in resources.iter().enumerate() {
            if resources[..i].iter().any(|r| r.name() == resource.name()) {
                return Err(GridError::Configuration(format!(
                    "resource '{}' defined more than once",
                    resource.name()
                )));
            }
        }
        Ok(Self {
            resources,
            matchmaker: Box::new(DefaultMatchMaker),
            error_policy: Box::new(KeywordPolicy::default()),
            options: CoreOptions::default(),
        })
    }

    /// Build resources, options and error policy from a configuration.
    pub fn from_config(config: &GridConfig) -> Result<Self> {
        let resources = config
            .resources
            .iter()
            .cloned()
            .map(Resource::from_spec)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(resources)?
            .with_options(config.core.clone())
            .with_error_policy(KeywordPolicy::from_env(&config.no_catch_errors)))
    }

    pub fn with_matchmaker(mut self, matchmaker: impl MatchMaker + 'static) -> Self {
        self.matchmaker = Box::new(matchmaker);
        self
    }

    pub fn with_error_policy(mut self, policy: impl ErrorPolicy + 'static) -> Self {
        self.error_policy = Box::new(policy);
        self
    }

    pub fn with_options(mut self, options: CoreOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &CoreOptions {
        &self.options
    }

    pub fn matchmaker(&self) -> &dyn MatchMaker {
        self.matchmaker.as_ref()
    }

    pub fn error_policy(&self) -> &dyn ErrorPolicy {
        self.error_policy.as_ref()
    }

    /// Whether `err` caught in `ctx` may be logged and dropped.
    pub fn should_ignore(&self, ctx: &ErrorContext, err: &GridError) -> bool {
        ignorable(self.error_policy.as_ref(), ctx, err)
    }

    // --- resources ---

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// All resources, enabled or not.
    pub fn get_resources(&self) -> Vec<&Resource> {
        self.resources.iter().collect()
    }

    pub fn enabled_count(&self) -> usize {
        self.resources.iter().filter(|r| r.enabled).count()
    }

    pub fn get_backend(&self, name: &str) -> Result<&Resource> {
        self.resources
            .iter()
            .find(|r| r.name() == name)
            .ok_or_else(|| GridError::InvalidResourceName(name.to_string()))
    }

    fn resource_mut(&mut self, name: &str) -> Result<&mut Resource> {
        self.resources
            .iter_mut()
            .find(|r| r.name() == name)
            .ok_or_else(|| GridError::InvalidResourceName(name.to_string()))
    }

    /// Disable every resource not matched; returns how many stay enabled.
    pub fn select_resource(&mut self, selection: &ResourceMatch) -> Result<usize> {
        let matches = selection.matcher()?;
        let mut enabled = 0;
        for resource in &mut self.resources {
            if matches(resource) {
                if resource.enabled {
                    enabled += 1;
                }
            } else {
                resource.enabled = false;
            }
        }
        Ok(enabled)
    }

    /// Refresh the status of the named resources, or of all enabled ones.
    ///
    /// Failures leave `updated` false; unrecoverable ones also disable the
    /// resource.
    pub fn update_resources(&mut self, names: Option<&[String]>) {
        for resource in &mut self.resources {
            let selected = match names {
                Some(names) => names.iter().any(|n| n == resource.name()),
                None => resource.enabled,
            };
            if !selected {
                continue;
            }
            match resource.backend_mut().get_resource_status() {
                Ok(()) => resource.updated = true,
                Err(err) => {
                    resource.updated = false;
                    if err.is_fatal() {
                        warn!(
                            resource = %resource.name(),
                            "Unrecoverable error updating resource, disabling it: {err}"
                        );
                        resource.enabled = false;
                    } else {
                        warn!(
                            resource = %resource.name(),
                            "Ignoring error updating resource: {err}"
                        );
                    }
                }
            }
        }
    }

    pub fn close(&mut self) {
        for resource in &mut self.resources {
            debug!(resource = %resource.name(), "Closing resource");
            resource.backend_mut().close();
        }
    }

    // --- submit ---

    /// Submit a task to the given resources, or to the brokered ones.
    ///
    /// Only NEW tasks are submitted unless `resubmit` resets the task
    /// first. The first target that accepts the task wins.
    pub fn submit(
        &mut self,
        task: &mut dyn Task,
        resubmit: bool,
        targets: Option<&[String]>,
    ) -> Result<Option<SaveRequest>> {
        if let Some(composite) = task.composite() {
            return composite.submit(self, resubmit, targets);
        }

        if resubmit {
            transition(task, RunState::New)?;
        } else if task.execution().state() != RunState::New {
            debug!(
                task = %task.name(),
                state = %task.execution().state(),
                "Task not in state NEW, skipping submission"
            );
            return Ok(None);
        }

        for input in task.inputs() {
            if !input.exists() {
                return Err(GridError::UnrecoverableDataStaging(format!(
                    "input file '{}' of task '{}' does not exist",
                    input.display(),
                    task.name()
                )));
            }
        }

        let targets = match targets {
            Some(targets) if !targets.is_empty() => targets.to_vec(),
            _ => self.broker(&*task)?,
        };

        let mut errors = Vec::new();
        for name in &targets {
            debug!(task = %task.name(), resource = %name, "Attempting submission");
            let resource = match self.resource_mut(name) {
                Ok(resource) => resource,
                Err(err) => {
                    errors.push(err);
                    continue;
                }
            };
            match resource.backend_mut().submit_job(task) {
                Ok(()) => {
                    info!(task = %task.name(), resource = %name, "Submitted task");
                    task.execution_mut().assign_resource(name);
                    transition(task, RunState::Submitted)?;
                    task.execution_mut()
                        .history(format!("Submitted to '{name}'"));
                    task.submitted();
                    return Ok(Some(SaveRequest::for_task(task)));
                }
                Err(err @ GridError::SkipToNextIteration(_)) => {
                    info!(
                        task = %task.name(),
                        resource = %name,
                        "Submission delayed to next iteration: {err}"
                    );
                    return Err(err);
                }
                Err(err) => {
                    info!(
                        task = %task.name(),
                        resource = %name,
                        "Error submitting task: {}: {err}",
                        err.kind_name()
                    );
                    errors.push(err);
                }
            }
        }

        match task.submit_error(errors) {
            Some(err) => {
                task.execution_mut()
                    .history(format!("Submission failed: {err}"));
                Err(err)
            }
            None => Ok(None),
        }
    }

    /// Enabled, compatible and (when refreshed) reachable resources for
    /// `task`, in ranked order.
    fn broker(&mut self, task: &dyn Task) -> Result<Vec<String>> {
        let enabled: Vec<&Resource> = self.resources.iter().filter(|r| r.enabled).collect();
        if enabled.is_empty() {
            return Err(GridError::NoResources(
                "could not initialize any computational resource, please check log and configuration"
                    .to_string(),
            ));
        }

        let compatible: Vec<String> = self
            .matchmaker
            .filter(task, enabled)
            .iter()
            .map(|r| r.name().to_string())
            .collect();
        if compatible.is_empty() {
            return Err(GridError::NoResources(format!(
                "no available resource can accommodate the requirements of task '{}'",
                task.name()
            )));
        }

        let candidates = if compatible.len() > 1 || self.options.refresh_single_candidate {
            self.update_resources(Some(compatible.as_slice()));
            let reachable: Vec<String> = compatible
                .into_iter()
                .filter(|name| {
                    self.get_backend(name)
                        .map(|r| r.enabled && r.updated)
                        .unwrap_or(false)
                })
                .collect();
            if reachable.is_empty() {
                return Err(GridError::NoResources(format!(
                    "no computational resource found reachable during update, aborting submission of task '{}'",
                    task.name()
                )));
            }
            reachable
        } else {
            compatible
        };

        let candidates: Vec<&Resource> = candidates
            .iter()
            .filter_map(|name| self.get_backend(name).ok())
            .collect();
        Ok(self
            .matchmaker
            .rank(task, candidates)
            .into_iter()
            .map(|r| r.name().to_string())
            .collect())
    }

    // --- update ---

    /// Poll the backend for the state of each task.
    ///
    /// A failure on one task is isolated per the error policy, except
    /// for errors that abort the whole batch.
    pub fn update_job_state(&mut self, tasks: &mut [Box<dyn Task>]) -> Result<Vec<SaveRequest>> {
        let mut saves = Vec::new();
        for task in tasks.iter_mut() {
            match self.update_task_state(task.as_mut()) {
                Ok(Some(save)) => saves.push(save),
                Ok(None) => {}
                Err(err) if err.aborts_update() => return Err(err),
                Err(err) => {
                    let ctx = ErrorContext::new("core", "Core", "update_job_state")
                        .tag(task.execution().state().to_string());
                    if !self.should_ignore(&ctx, &err) {
                        return Err(err);
                    }
                    warn!(
                        task = %task.name(),
                        "Ignored error in {}: {err}",
                        ctx.location()
                    );
                    debug!(error = ?err, "(Original error follows.)");
                }
            }
        }
        Ok(saves)
    }

    /// Poll the backend for the state of one task.
    pub fn update_task_state(&mut self, task: &mut dyn Task) -> Result<Option<SaveRequest>> {
        if let Some(composite) = task.composite() {
            return composite.update_state(self);
        }

        let old = task.execution().state();
        if !old.is_pollable() {
            return Ok(None);
        }
        let Some(name) = task.execution().resource_name().map(str::to_owned) else {
            return Err(GridError::InvalidArgument(format!(
                "task '{}' in state {old} has no resource name",
                task.name()
            )));
        };
        debug!(task = %task.name(), state = %old, resource = %name, "Updating state");

        let polled = match self.resource_mut(&name) {
            Ok(resource) => resource.backend_mut().update_job_state(task),
            Err(GridError::InvalidResourceName(_)) => {
                warn!(
                    task = %task.name(),
                    resource = %name,
                    "Cannot access computational resource, marking task as TERMINATED"
                );
                task.execution_mut()
                    .set_termination(Signal::RemoteError, 0);
                transition(task, RunState::Terminated)?;
                return Ok(Some(SaveRequest::for_task(task)));
            }
            Err(err) => return Err(err),
        };

        let mut force_unknown = false;
        let state = match polled {
            Ok(state) => {
                task.execution_mut().reset_poll_failures();
                state
            }
            Err(err) => {
                debug!(task = %task.name(), "Error getting status of task: {err}");
                match task.update_job_state_error(err) {
                    Some(GridError::UnknownJob(msg)) => {
                        warn!(
                            task = %task.name(),
                            "Backend has no record of job ({msg}), marking it as lost"
                        );
                        task.execution_mut().set_termination(Signal::Lost, 255);
                        transition(task, RunState::Terminated)?;
                        return Ok(Some(SaveRequest::for_task(task)));
                    }
                    Some(err) => return Err(err),
                    None => {}
                }
                let failures = task.execution_mut().record_poll_failure();
                let limit = self.options.unknown_after_failures;
                if limit > 0 && failures >= limit {
                    warn!(
                        task = %task.name(),
                        failures,
                        "Too many failed polls, marking task as UNKNOWN"
                    );
                    force_unknown = true;
                }
                RunState::Unknown
            }
        };

        if state == RunState::Unknown && !(self.options.update_on_error || force_unknown) {
            return Ok(None);
        }
        if state == RunState::Terminating && state != old {
            explain_failure(task.execution_mut());
        }
        if transition(task, state)? {
            Ok(Some(SaveRequest::for_task(task)))
        } else {
            Ok(None)
        }
    }

    // --- fetch ---

    /// Download the task's output and, for TERMINATING tasks, finish them.
    ///
    /// `download_dir` overrides the task's own output directory.
    pub fn fetch_output(
        &mut self,
        task: &mut dyn Task,
        download_dir: Option<&Path>,
        overwrite: bool,
        changed_only: bool,
    ) -> Result<Option<SaveRequest>> {
        let state = task.execution().state();
        if matches!(state, RunState::New | RunState::Submitted) {
            return Err(GridError::OutputNotAvailable(format!(
                "task '{}' is in state {state}",
                task.name()
            )));
        }
        if let Some(composite) = task.composite() {
            return composite.fetch_output(self, download_dir, overwrite, changed_only);
        }

        let mut changed = false;
        if let Some(dir) = task.download_dir(download_dir)? {
            if let Err(err) = prepare_download_dir(&dir, overwrite) {
                error!(
                    task = %task.name(),
                    dir = %dir.display(),
                    "Failed creating download directory: {err}"
                );
                return Err(err);
            }

            let Some(name) = task.execution().resource_name().map(str::to_owned) else {
                return Err(GridError::InvalidArgument(format!(
                    "task '{}' in state {state} has no resource name",
                    task.name()
                )));
            };
            let outcome = match self.resource_mut(&name) {
                Ok(resource) => {
                    resource
                        .backend_mut()
                        .get_results(task, &dir, overwrite, changed_only)
                }
                Err(err) => Err(err),
            };

            match outcome {
                Ok(()) => {
                    if task.execution().termination_signal() == Some(Signal::DataStagingFailure) {
                        task.execution_mut().set_signal(Some(0));
                    }
                }
                Err(GridError::RecoverableDataStaging(msg)) => {
                    info!(
                        task = %task.name(),
                        "Temporary failure retrieving results, will try again: {msg}"
                    );
                    task.execution_mut().history(format!(
                        "Temporary failure when retrieving results: {msg}. Ignoring error, try again."
                    ));
                    return Ok(None);
                }
                Err(err) => {
                    let unrecoverable = matches!(err, GridError::UnrecoverableDataStaging(_));
                    let unknown_resource = matches!(err, GridError::InvalidResourceName(_));
                    if unrecoverable {
                        task.execution_mut()
                            .set_signal(Some(Signal::DataStagingFailure.code()));
                    }
                    if let Some(err) = task.fetch_output_error(err) {
                        task.execution_mut()
                            .history(format!("No output could be retrieved: {err}"));
                        return Err(err);
                    }
                    if unknown_resource {
                        return Ok(None);
                    }
                }
            }

            debug!(task = %task.name(), dir = %dir.display(), "Downloaded output");
            let dir = dir.canonicalize().unwrap_or(dir);
            task.set_output_dir(dir);
            changed = true;
        }

        if task.execution().state() == RunState::Terminating {
            debug!(task = %task.name(), "Final output retrieved");
            transition(task, RunState::Terminated)?;
            changed = true;
        }
        Ok(changed.then(|| SaveRequest::for_task(task)))
    }

    // --- kill ---

    /// Cancel the remote job and force the task to TERMINATED.
    pub fn kill(&mut self, task: &mut dyn Task) -> Result<Option<SaveRequest>> {
        if let Some(composite) = task.composite() {
            return composite.kill(self);
        }

        let state = task.execution().state();
        if state == RunState::Terminated {
            debug!(task = %task.name(), "Task already TERMINATED, nothing to kill");
            return Ok(None);
        }
        if state != RunState::New {
            match task.execution().resource_name().map(str::to_owned) {
                Some(name) => match self.resource_mut(&name) {
                    Ok(resource) => resource.backend_mut().cancel_job(task)?,
                    Err(GridError::InvalidResourceName(_)) => {
                        warn!(
                            task = %task.name(),
                            resource = %name,
                            "Resource not found, assuming job is already gone"
                        );
                    }
                    Err(err) => return Err(err),
                },
                None => debug!(task = %task.name(), "Task has no resource, no job to cancel"),
            }
        }

        debug!(task = %task.name(), "Setting task to TERMINATED with the Cancelled signal");
        task.execution_mut()
            .set_signal(Some(Signal::Cancelled.code()));
        if let Err(err) = transition(task, RunState::Terminated) {
            let ctx = ErrorContext::new("core", "Core", "kill")
                .tag(state.to_string())
                .tag(RunState::Terminated.to_string());
            if !self.should_ignore(&ctx, &err) {
                return Err(err);
            }
            info!(
                task = %task.name(),
                "Ignoring error in state transition since task is being killed: {err}"
            );
        }
        task.execution_mut().history("Cancelled");
        Ok(Some(SaveRequest::for_task(task)))
    }

    // --- peek ---

    /// Open a snapshot of one of the task's output streams, positioned at
    /// `offset` bytes.
    pub fn peek(
        &mut self,
        task: &mut dyn Task,
        stream: Stream,
        offset: u64,
        size: Option<u64>,
    ) -> Result<File> {
        if let Some(composite) = task.composite() {
            return composite.peek(self, stream, offset, size);
        }

        let remote = task
            .stream_name(stream)
            .ok_or_else(|| {
                GridError::InvalidArgument(format!(
                    "task '{}' does not capture {stream}",
                    task.name()
                ))
            })?
            .to_string();

        let state = task.execution().state();
        if state == RunState::Terminated {
            let dir = task.output_dir().ok_or_else(|| {
                GridError::OutputNotAvailable(format!(
                    "task '{}' has no local output directory",
                    task.name()
                ))
            })?;
            let mut file = File::open(dir.join(&remote))?;
            file.seek(SeekFrom::Start(offset))?;
            return Ok(file);
        }

        let Some(name) = task.execution().resource_name().map(str::to_owned) else {
            return Err(GridError::OutputNotAvailable(format!(
                "task '{}' is in state {state}",
                task.name()
            )));
        };
        let mut local = tempfile::tempfile()?;
        self.resource_mut(&name)?
            .backend_mut()
            .peek(&*task, &remote, &mut local, offset, size)?;
        local.flush()?;
        local.seek(SeekFrom::Start(0))?;
        Ok(local)
    }

    // --- free ---

    /// Release remote resources held by a finished task.
    pub fn free(&mut self, task: &mut dyn Task) -> Result<()> {
        if let Some(composite) = task.composite() {
            return composite.free(self);
        }

        let state = task.execution().state();
        if !matches!(state, RunState::Terminating | RunState::Terminated) {
            return Err(GridError::InvalidOperation(format!(
                "attempting to free resources of task '{}', which is in non-terminal state {state}",
                task.name()
            )));
        }
        match task.execution().resource_name().map(str::to_owned) {
            Some(name) => self.resource_mut(&name)?.backend_mut().free(task),
            None => {
                debug!(
                    task = %task.name(),
                    "Task has no resource name, assuming it was aborted before submission"
                );
                Ok(())
            }
        }
    }
}

/// Record why a job ended badly, if it did.
fn explain_failure(run: &mut Run) {
    let Some(returncode) = run.returncode() else {
        return;
    };
    if returncode == 0 {
        return;
    }
    let message = match (run.termination_signal(), run.signal()) {
        (Some(signal), _) => format!("Abnormal termination: {signal}"),
        (None, Some(signal)) if signal != 0 => format!("Remote job terminated by signal {signal}"),
        _ => format!(
            "Remote job exited with code {}",
            run.exitcode().unwrap_or_default()
        ),
    };
    run.history(message);
}

fn prepare_download_dir(dir: &Path, overwrite: bool) -> Result<()> {
    if overwrite {
        fs::create_dir_all(dir)?;
        return Ok(());
    }
    if dir.is_dir() && fs::read_dir(dir)?.next().is_some() {
        let moved = backup(dir)?;
        debug!(
            from = %dir.display(),
            to = %moved.display(),
            "Moved existing download directory out of the way"
        );
    }
    fs::create_dir_all(dir)?;
    Ok(())
}

/// Rename `path` to `path.~N~`, with N the first free number.
fn backup(path: &Path) -> Result<PathBuf> {
    let mut n = 1u32;
    loop {
        let candidate = PathBuf::from(format!("{}.~{n}~", path.display()));
        if !candidate.exists() {
            fs::rename(path, &candidate)?;
            return Ok(candidate);
        }
        n += 1;
    }
}
