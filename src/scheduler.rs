//! Scheduling of NEW tasks onto resources.
//!
//! A scheduler is driven by the engine once per `progress` cycle:
//!
//! ```text
//! begin_cycle
//! while let Some(candidate) = next_candidate(ctx) {
//!     submit candidate.task_index to candidate.resource
//!     record_result(state) | record_error(err) -> Decision
//! }
//! end_cycle
//! ```
//!
//! Every candidate must be answered with exactly one `record_*` call
//! before asking for the next one.

use tracing::{debug, warn};

use crate::backend::Resource;
use crate::error::GridError;
use crate::matchmaker::MatchMaker;
use crate::state_machine::RunState;
use crate::task::Task;

/// What the engine lets the scheduler see.
pub struct SchedulingContext<'a> {
    pub tasks: &'a [Box<dyn Task>],
    pub resources: &'a [Resource],
    pub matchmaker: &'a dyn MatchMaker,
}

/// A task (by index into the context's task list) and the resource to
/// submit it to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub task_index: usize,
    pub resource: String,
}

/// How to go on after a failed submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    RetryOtherResource,
    SkipTask,
    Abort,
}

pub trait Scheduler {
    fn begin_cycle(&mut self, _task_count: usize) {}

    fn next_candidate(&mut self, ctx: &SchedulingContext<'_>) -> Option<Candidate>;

    /// The last candidate was submitted; `state` is the task's new state.
    fn record_result(&mut self, state: RunState);

    /// Submitting the last candidate failed.
    fn record_error(&mut self, err: &GridError) -> Decision;

    fn end_cycle(&mut self) {}
}

/// Builds a fresh scheduler for each cycle.
pub type SchedulerFactory = Box<dyn Fn() -> Box<dyn Scheduler>>;

pub fn first_come_first_serve() -> Box<dyn Scheduler> {
    Box::new(FirstComeFirstServe::default())
}

/// Tasks in list order; each one is offered its compatible resources in
/// ranked order until a submission succeeds.
#[derive(Debug, Default)]
pub struct FirstComeFirstServe {
    task_index: usize,
    targets: Option<Vec<String>>,
    target_index: usize,
}

impl FirstComeFirstServe {
    fn next_task(&mut self) {
        self.task_index += 1;
        self.targets = None;
        self.target_index = 0;
    }

    fn targets_for(ctx: &SchedulingContext<'_>, task: &dyn Task) -> Vec<String> {
        let available: Vec<&Resource> = ctx.resources.iter().filter(|r| r.enabled).collect();
        let compatible = ctx.matchmaker.filter(task, available);
        if compatible.is_empty() {
            warn!(
                task = %task.name(),
                "No compatible resources for task - cannot submit it"
            );
            return Vec::new();
        }
        ctx.matchmaker
            .rank(task, compatible)
            .into_iter()
            .map(|r| r.name().to_string())
            .collect()
    }
}

impl Scheduler for FirstComeFirstServe {
    fn begin_cycle(&mut self, _task_count: usize) {
        *self = Self::default();
    }

    fn next_candidate(&mut self, ctx: &SchedulingContext<'_>) -> Option<Candidate> {
        loop {
            let task = ctx.tasks.get(self.task_index)?;
            let targets = self
                .targets
                .get_or_insert_with(|| Self::targets_for(ctx, task.as_ref()));
            if let Some(resource) = targets.get(self.target_index) {
                return Some(Candidate {
                    task_index: self.task_index,
                    resource: resource.clone(),
                });
            }
            self.next_task();
        }
    }

    fn record_result(&mut self, _state: RunState) {
        self.next_task();
    }

    fn record_error(&mut self, err: &GridError) -> Decision {
        if err.is_fatal() {
            return Decision::Abort;
        }
        if let GridError::SkipToNextIteration(_) = err {
            self.next_task();
            return Decision::SkipTask;
        }
        debug!(error = %err, "Submission failed, trying next resource");
        self.target_index += 1;
        Decision::RetryOtherResource
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ResourceSpec;
    use crate::matchmaker::DefaultMatchMaker;
    use crate::task::Application;

    fn resources(names: &[&str]) -> Vec<Resource> {
        names
            .iter()
            .map(|n| Resource::from_spec(ResourceSpec::new(*n)).unwrap())
            .collect()
    }

    fn tasks(n: usize) -> Vec<Box<dyn Task>> {
        (0..n)
            .map(|i| Box::new(Application::new(format!("t{i}"), vec![])) as Box<dyn Task>)
            .collect()
    }

    #[test]
    fn offers_tasks_in_order() {
        let resources = resources(&["a", "b"]);
        let tasks = tasks(2);
        let ctx = SchedulingContext {
            tasks: &tasks,
            resources: &resources,
            matchmaker: &DefaultMatchMaker,
        };
        let mut fcfs = FirstComeFirstServe::default();
        fcfs.begin_cycle(tasks.len());

        let first = fcfs.next_candidate(&ctx).unwrap();
        assert_eq!(first, Candidate { task_index: 0, resource: "a".into() });
        fcfs.record_result(RunState::Submitted);

        let second = fcfs.next_candidate(&ctx).unwrap();
        assert_eq!(second, Candidate { task_index: 1, resource: "a".into() });
        fcfs.record_result(RunState::Submitted);

        assert!(fcfs.next_candidate(&ctx).is_none());
    }

    #[test]
    fn retries_other_resources_then_moves_on() {
        let resources = resources(&["a", "b"]);
        let tasks = tasks(2);
        let ctx = SchedulingContext {
            tasks: &tasks,
            resources: &resources,
            matchmaker: &DefaultMatchMaker,
        };
        let mut fcfs = FirstComeFirstServe::default();
        let err = GridError::Backend("queue full".into());

        assert_eq!(fcfs.next_candidate(&ctx).unwrap().resource, "a");
        assert_eq!(fcfs.record_error(&err), Decision::RetryOtherResource);
        assert_eq!(fcfs.next_candidate(&ctx).unwrap().resource, "b");
        assert_eq!(fcfs.record_error(&err), Decision::RetryOtherResource);

        let next = fcfs.next_candidate(&ctx).unwrap();
        assert_eq!(next.task_index, 1);
        assert_eq!(next.resource, "a");
    }

    #[test]
    fn skip_and_abort_decisions() {
        let resources = resources(&["a", "b"]);
        let tasks = tasks(2);
        let ctx = SchedulingContext {
            tasks: &tasks,
            resources: &resources,
            matchmaker: &DefaultMatchMaker,
        };
        let mut fcfs = FirstComeFirstServe::default();

        fcfs.next_candidate(&ctx).unwrap();
        let skip = GridError::SkipToNextIteration("adapting".into());
        assert_eq!(fcfs.record_error(&skip), Decision::SkipTask);
        assert_eq!(fcfs.next_candidate(&ctx).unwrap().task_index, 1);

        let fatal = GridError::Configuration("broken".into());
        assert_eq!(fcfs.record_error(&fatal), Decision::Abort);
    }

    #[test]
    fn disabled_resources_are_not_offered() {
        let mut resources = resources(&["a", "b"]);
        resources[0].enabled = false;
        let tasks = tasks(1);
        let ctx = SchedulingContext {
            tasks: &tasks,
            resources: &resources,
            matchmaker: &DefaultMatchMaker,
        };
        let mut fcfs = FirstComeFirstServe::default();
        assert_eq!(fcfs.next_candidate(&ctx).unwrap().resource, "b");
    }

    #[test]
    fn tasks_without_compatible_resources_are_skipped() {
        let resources = vec![
            Resource::from_spec(ResourceSpec::new("tiny").with_max_cores(1)).unwrap(),
        ];
        let tasks: Vec<Box<dyn Task>> = vec![
            Box::new(Application::new("wide", vec![]).with_cores(16)),
            Box::new(Application::new("narrow", vec![])),
        ];
        let ctx = SchedulingContext {
            tasks: &tasks,
            resources: &resources,
            matchmaker: &DefaultMatchMaker,
        };
        let mut fcfs = FirstComeFirstServe::default();
        assert_eq!(fcfs.next_candidate(&ctx).unwrap().task_index, 1);
    }
}
