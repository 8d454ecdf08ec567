//! Step-driven orchestration of many tasks.
//!
//! The [`Engine`] owns its tasks and sorts them into buckets by state.
//! Each call to [`Engine::progress`] runs one cycle:
//!
//! 1. poll in-flight tasks (SUBMITTED, RUNNING, UNKNOWN);
//! 2. kill tasks queued with [`Engine::kill`];
//! 3. poll STOPPED tasks;
//! 4. submit NEW tasks within the admission limits;
//! 5. retrieve the output of TERMINATING tasks and free them.
//!
//! A failure on one task is logged and isolated unless the error policy
//! says otherwise, so one bad job cannot stall the rest.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, error, info};

use crate::backend::Resource;
use crate::config::EngineOptions;
use crate::core::{Core, ResourceMatch};
use crate::error::{GridError, Result};
use crate::policy::ErrorContext;
use crate::scheduler::{Candidate, Decision, SchedulerFactory, SchedulingContext, first_come_first_serve};
use crate::state_machine::{RunState, Signal};
use crate::store::Store;
use crate::task::{SaveRequest, Stream, Task, TaskId, TaskKind, transition};

/// `EX_IOERR` from `sysexits.h`.
const EX_IOERR: u8 = 74;

/// Where the engine keeps a task, by state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    New,
    InFlight,
    Stopped,
    Terminating,
    Terminated,
}

impl Bucket {
    pub const ALL: [Bucket; 5] = [
        Bucket::New,
        Bucket::InFlight,
        Bucket::Stopped,
        Bucket::Terminating,
        Bucket::Terminated,
    ];

    pub fn for_state(state: RunState) -> Bucket {
        match state {
            RunState::New => Bucket::New,
            RunState::Submitted | RunState::Running | RunState::Unknown => Bucket::InFlight,
            RunState::Stopped => Bucket::Stopped,
            RunState::Terminating => Bucket::Terminating,
            RunState::Terminated => Bucket::Terminated,
        }
    }
}

/// Task counts per state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub counts: BTreeMap<RunState, usize>,
    /// TERMINATED with return code 0.
    pub ok: usize,
    /// TERMINATED with any other return code.
    pub failed: usize,
    pub total: usize,
}

impl Stats {
    pub fn count(&self, state: RunState) -> usize {
        self.counts.get(&state).copied().unwrap_or(0)
    }

    /// Whether every counted task is TERMINATED.
    pub fn is_done(&self) -> bool {
        self.count(RunState::Terminated) == self.total
    }
}

pub struct Engine {
    core: Core,
    new: Vec<Box<dyn Task>>,
    in_flight: Vec<Box<dyn Task>>,
    stopped: Vec<Box<dyn Task>>,
    terminating: Vec<Box<dyn Task>>,
    terminated: Vec<Box<dyn Task>>,
    to_kill: Vec<TaskId>,
    store: Option<Box<dyn Store>>,
    scheduler: SchedulerFactory,
    options: EngineOptions,
}

fn limit(max: usize) -> usize {
    if max == 0 { usize::MAX } else { max }
}

impl Engine {
    pub fn new(core: Core, options: EngineOptions) -> Self {
        Self {
            core,
            new: Vec::new(),
            in_flight: Vec::new(),
            stopped: Vec::new(),
            terminating: Vec::new(),
            terminated: Vec::new(),
            to_kill: Vec::new(),
            store: None,
            scheduler: Box::new(first_come_first_serve),
            options,
        }
    }

    pub fn with_store(mut self, store: impl Store + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    pub fn with_scheduler(mut self, factory: SchedulerFactory) -> Self {
        self.scheduler = factory;
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut EngineOptions {
        &mut self.options
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut Core {
        &mut self.core
    }

    fn bucket(&self, bucket: Bucket) -> &Vec<Box<dyn Task>> {
        match bucket {
            Bucket::New => &self.new,
            Bucket::InFlight => &self.in_flight,
            Bucket::Stopped => &self.stopped,
            Bucket::Terminating => &self.terminating,
            Bucket::Terminated => &self.terminated,
        }
    }

    fn bucket_mut(&mut self, bucket: Bucket) -> &mut Vec<Box<dyn Task>> {
        match bucket {
            Bucket::New => &mut self.new,
            Bucket::InFlight => &mut self.in_flight,
            Bucket::Stopped => &mut self.stopped,
            Bucket::Terminating => &mut self.terminating,
            Bucket::Terminated => &mut self.terminated,
        }
    }

    fn locate(&self, id: TaskId) -> Option<(Bucket, usize)> {
        Bucket::ALL.into_iter().find_map(|bucket| {
            self.bucket(bucket)
                .iter()
                .position(|t| t.id() == id)
                .map(|index| (bucket, index))
        })
    }

    // --- task management ---

    /// Start managing `task`. Returns `false` if it is already managed.
    pub fn add(&mut self, task: Box<dyn Task>) -> bool {
        if self.contains(task.id()) {
            return false;
        }
        let bucket = Bucket::for_state(task.execution().state());
        debug!(task = %task.name(), id = %task.id(), ?bucket, "Adding task");
        self.bucket_mut(bucket).push(task);
        true
    }

    /// Stop managing a task and hand it back.
    pub fn remove(&mut self, id: TaskId) -> Option<Box<dyn Task>> {
        let (bucket, index) = self.locate(id)?;
        self.to_kill.retain(|k| *k != id);
        Some(self.bucket_mut(bucket).remove(index))
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.locate(id).is_some()
    }

    pub fn task(&self, id: TaskId) -> Option<&dyn Task> {
        let (bucket, index) = self.locate(id)?;
        Some(self.bucket(bucket)[index].as_ref())
    }

    pub fn bucket_of(&self, id: TaskId) -> Option<Bucket> {
        self.locate(id).map(|(bucket, _)| bucket)
    }

    /// Ids of the tasks in `bucket`, in bucket order.
    pub fn ids_in(&self, bucket: Bucket) -> Vec<TaskId> {
        self.bucket(bucket).iter().map(|t| t.id()).collect()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &(dyn Task + 'static)> {
        Bucket::ALL
            .into_iter()
            .flat_map(move |bucket| self.bucket(bucket).iter().map(|t| t.as_ref()))
    }

    pub fn len(&self) -> usize {
        Bucket::ALL.into_iter().map(|b| self.bucket(b).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add `task` for submission in the next cycles. With `resubmit` a
    /// finished task is reset to NEW first; an already managed task is
    /// only reset.
    pub fn submit(&mut self, mut task: Box<dyn Task>, resubmit: bool) -> Result<TaskId> {
        let id = task.id();
        if self.contains(id) {
            if resubmit {
                self.redo(id)?;
            }
            return Ok(id);
        }
        if resubmit {
            task.redo()?;
        }
        info!(task = %task.name(), %id, "Task queued for submission");
        self.add(task);
        Ok(id)
    }

    /// Reset a managed task to NEW so it is submitted again.
    pub fn redo(&mut self, id: TaskId) -> Result<()> {
        let (bucket, index) = self.locate(id).ok_or_else(|| not_managed(id))?;
        let mut task = self.bucket_mut(bucket).remove(index);
        let before = task.execution().state();
        let outcome = match task.redo() {
            Ok(()) => self.persist(task.as_ref(), Some(SaveRequest::for_task(task.as_ref()))),
            Err(err) => {
                self.persist_moved(task.as_ref(), before);
                Err(err)
            }
        };
        self.reinsert(bucket, index, task);
        outcome
    }

    /// Queue a task to be killed in the next cycle.
    pub fn kill(&mut self, id: TaskId) -> Result<()> {
        if !self.contains(id) {
            return Err(not_managed(id));
        }
        if !self.to_kill.contains(&id) {
            self.to_kill.push(id);
        }
        Ok(())
    }

    pub fn pending_kills(&self) -> &[TaskId] {
        &self.to_kill
    }

    /// Run `op` on a managed task, then put it back where its state says.
    fn with_task<R>(
        &mut self,
        id: TaskId,
        op: impl FnOnce(&mut Core, &mut dyn Task) -> Result<R>,
    ) -> Result<R> {
        let (bucket, index) = self.locate(id).ok_or_else(|| not_managed(id))?;
        let mut task = self.bucket_mut(bucket).remove(index);
        let outcome = op(&mut self.core, task.as_mut());
        self.reinsert(bucket, index, task);
        outcome
    }

    fn reinsert(&mut self, from: Bucket, index: usize, task: Box<dyn Task>) {
        let target = Bucket::for_state(task.execution().state());
        if target == from {
            let tasks = self.bucket_mut(from);
            let index = index.min(tasks.len());
            tasks.insert(index, task);
        } else {
            self.bucket_mut(target).push(task);
        }
    }

    pub fn peek(&mut self, id: TaskId, stream: Stream, offset: u64, size: Option<u64>) -> Result<File> {
        self.with_task(id, |core, task| core.peek(task, stream, offset, size))
    }

    pub fn free(&mut self, id: TaskId) -> Result<()> {
        self.with_task(id, |core, task| core.free(task))
    }

    pub fn select_resource(&mut self, selection: &ResourceMatch) -> Result<usize> {
        self.core.select_resource(selection)
    }

    pub fn get_resources(&self) -> Vec<&Resource> {
        self.core.get_resources()
    }

    pub fn get_backend(&self, name: &str) -> Result<&Resource> {
        self.core.get_backend(name)
    }

    pub fn close(&mut self) {
        self.core.close();
    }

    /// Task counts, optionally only for tasks of one category.
    pub fn stats(&self, only: Option<&str>) -> Stats {
        let mut counts: BTreeMap<RunState, usize> =
            RunState::ALL.into_iter().map(|s| (s, 0)).collect();
        let mut ok = 0;
        let mut failed = 0;
        let mut total = 0;
        for task in self.tasks() {
            if let Some(category) = only {
                if task.category() != category {
                    continue;
                }
            }
            let run = task.execution();
            *counts.entry(run.state()).or_default() += 1;
            total += 1;
            if run.state() == RunState::Terminated {
                if run.returncode() == Some(0) {
                    ok += 1;
                } else {
                    failed += 1;
                }
            }
        }
        Stats {
            counts,
            ok,
            failed,
            total,
        }
    }

    // --- progress ---

    /// Advance every managed task by one step.
    pub fn progress(&mut self) -> Result<()> {
        if self.core.enabled_count() == 0 {
            return Err(GridError::NoResources(
                "no resources available for running jobs".to_string(),
            ));
        }
        self.update_bucket(Bucket::InFlight)?;
        self.process_kills()?;
        self.update_bucket(Bucket::Stopped)?;
        if self.options.can_submit {
            self.submit_new()?;
        }
        if self.options.can_retrieve {
            self.retrieve_terminating()?;
        }
        Ok(())
    }

    fn persist(&mut self, task: &dyn Task, save: Option<SaveRequest>) -> Result<()> {
        let (Some(store), Some(request)) = (self.store.as_mut(), save) else {
            return Ok(());
        };
        debug_assert_eq!(request.task, task.id());
        store.save(task)
    }

    /// Save a task whose state moved away from `before` during an
    /// operation that then failed, e.g. in its `state_changed` hook.
    fn persist_moved(&mut self, task: &dyn Task, before: RunState) {
        if task.execution().state() == before {
            return;
        }
        if let Err(err) = self.persist(task, Some(SaveRequest::for_task(task))) {
            error!(task = %task.name(), "Could not save task after failed operation: {err}");
        }
    }

    /// Log and drop `err` if the policy allows, otherwise return it.
    fn isolate(&self, ctx: ErrorContext, task: &dyn Task, err: GridError) -> Result<()> {
        if !self.core.should_ignore(&ctx, &err) {
            return Err(err);
        }
        error!(
            task = %task.name(),
            id = %task.id(),
            "Ignored error in {}: {}: {err}",
            ctx.location(),
            err.kind_name()
        );
        debug!(error = ?err, "(Original error follows.)");
        Ok(())
    }

    fn download_dir_for(&self, task: &dyn Task) -> Option<PathBuf> {
        self.options
            .output_dir
            .as_ref()
            .map(|base| base.join(task.id().to_string()))
    }

    /// Move tasks whose state no longer matches `bucket` to the right one.
    fn sweep(&mut self, bucket: Bucket) {
        let tasks = std::mem::take(self.bucket_mut(bucket));
        let (stay, moved): (Vec<_>, Vec<_>) = tasks
            .into_iter()
            .partition(|t| Bucket::for_state(t.execution().state()) == bucket);
        *self.bucket_mut(bucket) = stay;
        for task in moved {
            let target = Bucket::for_state(task.execution().state());
            debug!(task = %task.name(), from = ?bucket, to = ?target, "Moving task");
            self.bucket_mut(target).push(task);
        }
    }

    fn update_bucket(&mut self, bucket: Bucket) -> Result<()> {
        let retrieve_running = bucket == Bucket::InFlight
            && self.options.can_retrieve
            && self.options.retrieve_running;
        let mut tasks = std::mem::take(self.bucket_mut(bucket));
        let mut outcome = Ok(());
        for task in tasks.iter_mut() {
            let state = task.execution().state();
            let Err(err) = self.update_one(task.as_mut(), retrieve_running) else {
                continue;
            };
            let ctx = ErrorContext::new("core", "Engine", "progress")
                .tag(state.to_string())
                .tag("update_job_state");
            if let Err(err) = self.isolate(ctx, task.as_ref(), err) {
                outcome = Err(err);
                break;
            }
        }
        *self.bucket_mut(bucket) = tasks;
        self.sweep(bucket);
        outcome
    }

    fn update_one(&mut self, task: &mut dyn Task, retrieve_running: bool) -> Result<()> {
        let before = task.execution().state();
        let save = match self.core.update_task_state(task) {
            Ok(save) => save,
            Err(err) => {
                self.persist_moved(task, before);
                return Err(err);
            }
        };
        self.persist(task, save)?;
        if retrieve_running && task.execution().state() == RunState::Running {
            let dir = self.download_dir_for(task);
            let fetched = self.core.fetch_output(
                task,
                dir.as_deref(),
                self.options.retrieve_overwrites,
                self.options.retrieve_changed_only,
            );
            match fetched {
                Ok(save) => self.persist(task, save)?,
                Err(err) => {
                    let ctx = ErrorContext::new("core", "Engine", "progress")
                        .tag(RunState::Running.to_string())
                        .tag("fetch_output");
                    self.isolate(ctx, task, err)?;
                }
            }
        }
        Ok(())
    }

    fn process_kills(&mut self) -> Result<()> {
        let queue = std::mem::take(&mut self.to_kill);
        let mut outcome = Ok(());
        for id in queue {
            if outcome.is_err() {
                self.to_kill.push(id);
                continue;
            }
            let Some((bucket, index)) = self.locate(id) else {
                debug!(%id, "Task queued for killing is no longer managed");
                continue;
            };
            let mut task = self.bucket_mut(bucket).remove(index);
            let state = task.execution().state();
            let killed = match self.core.kill(task.as_mut()) {
                Ok(save) => self.persist(task.as_ref(), save),
                Err(err) => {
                    self.persist_moved(task.as_ref(), state);
                    Err(err)
                }
            };
            if let Err(err) = killed {
                // retried next cycle
                self.to_kill.push(id);
                let ctx = ErrorContext::new("core", "Engine", "progress")
                    .tag(state.to_string())
                    .tag("kill");
                if let Err(err) = self.isolate(ctx, task.as_ref(), err) {
                    outcome = Err(err);
                }
            }
            self.reinsert(bucket, index, task);
        }
        outcome
    }

    /// Submitted and in-flight plain jobs.
    fn admission_counts(&self) -> (usize, usize) {
        let mut submitted = 0;
        let mut in_flight = 0;
        for task in &self.in_flight {
            if task.kind() != TaskKind::Job {
                continue;
            }
            match task.execution().state() {
                RunState::Submitted => {
                    submitted += 1;
                    in_flight += 1;
                }
                RunState::Running => in_flight += 1,
                _ => {}
            }
        }
        (submitted, in_flight)
    }

    fn submit_new(&mut self) -> Result<()> {
        let max_submitted = limit(self.options.max_submitted);
        let max_in_flight = limit(self.options.max_in_flight);
        let (mut submitted, mut in_flight) = self.admission_counts();
        if self.new.is_empty() || submitted >= max_submitted || in_flight >= max_in_flight {
            return Ok(());
        }

        self.core.update_resources(None);
        let mut tasks = std::mem::take(&mut self.new);
        let mut scheduler = (self.scheduler)();
        scheduler.begin_cycle(tasks.len());
        let mut outcome = Ok(());

        loop {
            let candidate = {
                let ctx = SchedulingContext {
                    tasks: &tasks,
                    resources: self.core.resources(),
                    matchmaker: self.core.matchmaker(),
                };
                scheduler.next_candidate(&ctx)
            };
            let Some(Candidate {
                task_index,
                resource,
            }) = candidate
            else {
                break;
            };
            if task_index >= tasks.len() {
                outcome = Err(GridError::Internal(format!(
                    "scheduler picked task #{task_index} out of {}",
                    tasks.len()
                )));
                break;
            }
            let task = tasks[task_index].as_mut();
            let state = task.execution().state();
            if state != RunState::New {
                scheduler.record_result(state);
                continue;
            }

            let targets = [resource];
            match self.core.submit(task, false, Some(&targets[..])) {
                Ok(save) => {
                    let state = task.execution().state();
                    if task.kind() == TaskKind::Job {
                        if state == RunState::Submitted {
                            submitted += 1;
                        }
                        if matches!(state, RunState::Submitted | RunState::Running) {
                            in_flight += 1;
                        }
                    }
                    scheduler.record_result(state);
                    if let Err(err) = self.persist(task, save) {
                        let ctx = ErrorContext::new("core", "Engine", "progress")
                            .tag("NEW")
                            .tag("store");
                        if let Err(err) = self.isolate(ctx, task, err) {
                            outcome = Err(err);
                            break;
                        }
                    }
                }
                Err(err) => {
                    self.persist_moved(task, state);
                    task.execution_mut().history(format!(
                        "Submission to resource '{}' failed: {}: {err}",
                        targets[0],
                        err.kind_name()
                    ));
                    error!(
                        task = %task.name(),
                        resource = %targets[0],
                        "Got error in submitting task, informing scheduler: {err}"
                    );
                    if scheduler.record_error(&err) == Decision::Abort {
                        let ctx = ErrorContext::new("core", "Engine", "progress")
                            .tag("scheduler")
                            .tag("submit");
                        if let Err(err) = self.isolate(ctx, task, err) {
                            outcome = Err(err);
                            break;
                        }
                    }
                }
            }

            if submitted >= max_submitted || in_flight >= max_in_flight {
                debug!(submitted, in_flight, "Admission limit reached");
                break;
            }
        }

        scheduler.end_cycle();
        self.new = tasks;
        self.sweep(Bucket::New);
        outcome
    }

    fn retrieve_terminating(&mut self) -> Result<()> {
        let mut tasks = std::mem::take(&mut self.terminating);
        let mut outcome = Ok(());
        for task in tasks.iter_mut() {
            if let Err(err) = self.retrieve_one(task.as_mut()) {
                outcome = Err(err);
                break;
            }
        }

        for task in tasks.iter_mut() {
            if task.execution().state() != RunState::Terminated {
                continue;
            }
            if let Err(err) = self.core.free(task.as_mut()) {
                error!(
                    task = %task.name(),
                    "Got error freeing up resources used by task: {err}. \
                     (For cloud-based resources, the VM may have been destroyed already.)"
                );
            }
        }
        if self.options.forget_terminated {
            let (done, rest): (Vec<_>, Vec<_>) = tasks
                .into_iter()
                .partition(|t| t.execution().state() == RunState::Terminated);
            for task in &done {
                debug!(task = %task.name(), id = %task.id(), "Forgetting finished task");
                self.to_kill.retain(|k| *k != task.id());
            }
            tasks = rest;
        }
        self.terminating = tasks;
        self.sweep(Bucket::Terminating);
        outcome
    }

    fn retrieve_one(&mut self, task: &mut dyn Task) -> Result<()> {
        let dir = self.download_dir_for(task);
        let fetched = self.core.fetch_output(
            task,
            dir.as_deref(),
            self.options.retrieve_overwrites,
            self.options.retrieve_changed_only,
        );
        match fetched {
            Ok(save) => self.persist(task, save),
            Err(err @ GridError::UnrecoverableDataStaging(_)) => {
                error!(
                    task = %task.name(),
                    "Error fetching output, marking task as TERMINATED with exit code {EX_IOERR}: {err}"
                );
                task.execution_mut()
                    .set_termination(Signal::DataStagingFailure, EX_IOERR);
                let moved = transition(task, RunState::Terminated);
                self.persist(task, Some(SaveRequest::for_task(task)))?;
                if let Err(err) = moved {
                    let ctx = ErrorContext::new("core", "Engine", "progress")
                        .tag(RunState::Terminating.to_string())
                        .tag("state");
                    self.isolate(ctx, task, err)?;
                }
                Ok(())
            }
            Err(err) => {
                self.persist_moved(task, RunState::Terminating);
                let ctx = ErrorContext::new("core", "Engine", "progress")
                    .tag(RunState::Terminating.to_string())
                    .tag("fetch_output");
                self.isolate(ctx, task, err)
            }
        }
    }
}

fn not_managed(id: TaskId) -> GridError {
    GridError::InvalidArgument(format!("task {id} is not managed by this engine"))
}
