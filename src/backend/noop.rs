//! Simulated resource.
//!
//! Jobs never run anywhere: every poll moves them one step along a
//! transition graph, optionally at random. Slot and memory accounting
//! mimic a small batch system so that admission limits and submission
//! failures can be exercised without any middleware.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::{Backend, ResourceSpec};
use crate::error::{GridError, Result};
use crate::state_machine::RunState;
use crate::task::Task;

/// Outgoing edges per state, as `(probability, target)` pairs. Missing
/// probability mass means "stay put".
pub type TransitionGraph = BTreeMap<RunState, Vec<(f64, RunState)>>;

/// SUBMITTED → RUNNING → TERMINATING, one step per poll.
pub fn normal_transition_graph() -> TransitionGraph {
    BTreeMap::from([
        (RunState::Submitted, vec![(1.0, RunState::Running)]),
        (RunState::Running, vec![(1.0, RunState::Terminating)]),
    ])
}

pub struct NoOpBackend {
    name: String,
    max_cores: u32,
    free_slots: u32,
    available_memory_mb: Option<u64>,
    queued: u32,
    running: u32,
    next_job: u64,
    pub transition_graph: TransitionGraph,
    rng: StdRng,
}

impl NoOpBackend {
    pub fn new(spec: &ResourceSpec) -> Self {
        Self {
            name: spec.name.clone(),
            max_cores: spec.max_cores,
            free_slots: spec.max_cores,
            available_memory_mb: spec.max_memory_mb,
            queued: 0,
            running: 0,
            next_job: 1,
            transition_graph: normal_transition_graph(),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_transition_graph(mut self, graph: TransitionGraph) -> Self {
        self.transition_graph = graph;
        self
    }

    /// Make probabilistic transitions reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn free_slots(&self) -> u32 {
        self.free_slots
    }

    pub fn queued(&self) -> u32 {
        self.queued
    }

    pub fn running(&self) -> u32 {
        self.running
    }

    fn release(&mut self, task: &dyn Task, state: RunState) {
        match state {
            RunState::Submitted => self.queued = self.queued.saturating_sub(1),
            RunState::Running | RunState::Stopped | RunState::Unknown => {
                self.running = self.running.saturating_sub(1)
            }
            _ => return,
        }
        self.free_slots = (self.free_slots + task.requested_cores()).min(self.max_cores);
        if let (Some(available), Some(used)) =
            (self.available_memory_mb.as_mut(), task.requested_memory_mb())
        {
            *available += used;
        }
    }
}

impl Backend for NoOpBackend {
    fn submit_job(&mut self, task: &mut dyn Task) -> Result<()> {
        let cores = task.requested_cores();
        if cores > self.free_slots {
            return Err(GridError::Submit {
                resource: self.name.clone(),
                message: format!(
                    "{} cores requested but only {} free",
                    cores, self.free_slots
                ),
            });
        }
        if let (Some(available), Some(wanted)) =
            (self.available_memory_mb, task.requested_memory_mb())
        {
            if wanted > available {
                return Err(GridError::Submit {
                    resource: self.name.clone(),
                    message: format!("{wanted} MB requested but only {available} MB free"),
                });
            }
            self.available_memory_mb = Some(available - wanted);
        }

        self.free_slots -= cores;
        self.queued += 1;
        let job_id = format!("noop-{}", self.next_job);
        self.next_job += 1;
        debug!(
            resource = %self.name,
            task = %task.name(),
            %job_id,
            free_slots = self.free_slots,
            "Accepted job"
        );
        task.execution_mut().job_id = Some(job_id);
        Ok(())
    }

    fn update_job_state(&mut self, task: &mut dyn Task) -> Result<RunState> {
        let current = task.execution().state();
        let Some(edges) = self.transition_graph.get(&current) else {
            return Ok(current);
        };
        let mut dice: f64 = self.rng.gen_range(0.0..1.0);
        let mut target = current;
        for (probability, to) in edges {
            if dice < *probability {
                target = *to;
                break;
            }
            dice -= probability;
        }
        if target == current {
            return Ok(current);
        }

        match (current, target) {
            // STOPPED and UNKNOWN jobs keep holding a running slot
            (RunState::Submitted, RunState::Running | RunState::Stopped | RunState::Unknown) => {
                self.queued = self.queued.saturating_sub(1);
                self.running += 1;
            }
            (RunState::Stopped | RunState::Unknown, RunState::Submitted) => {
                self.running = self.running.saturating_sub(1);
                self.queued += 1;
            }
            (_, RunState::Terminating) => {
                self.release(task, current);
                task.execution_mut().set_returncode(0, 0);
            }
            _ => {}
        }
        debug!(
            resource = %self.name,
            task = %task.name(),
            from = %current,
            to = %target,
            "Simulated transition"
        );
        Ok(target)
    }

    fn get_results(
        &mut self,
        _task: &mut dyn Task,
        _download_dir: &Path,
        _overwrite: bool,
        _changed_only: bool,
    ) -> Result<()> {
        Ok(())
    }

    fn cancel_job(&mut self, task: &mut dyn Task) -> Result<()> {
        let state = task.execution().state();
        self.release(task, state);
        Ok(())
    }

    fn free(&mut self, _task: &mut dyn Task) -> Result<()> {
        Ok(())
    }

    fn peek(
        &mut self,
        task: &dyn Task,
        remote_filename: &str,
        _local: &mut File,
        _offset: u64,
        _size: Option<u64>,
    ) -> Result<()> {
        Err(GridError::InvalidOperation(format!(
            "resource '{}' keeps no file '{remote_filename}' for task '{}'",
            self.name,
            task.name()
        )))
    }

    fn get_resource_status(&mut self) -> Result<()> {
        debug!(
            resource = %self.name,
            free_slots = self.free_slots,
            queued = self.queued,
            running = self.running,
            "Resource status"
        );
        Ok(())
    }
}
