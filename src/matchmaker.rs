use tracing::debug;

use crate::backend::Resource;
use crate::task::Task;

/// Picks and orders the resources a task may be submitted to.
pub trait MatchMaker {
    /// Keep only resources able to run `task`.
    fn filter<'r>(&self, task: &dyn Task, resources: Vec<&'r Resource>) -> Vec<&'r Resource> {
        let offered = resources.len();
        let compatible = task.compatible_resources(resources);
        debug!(
            task = %task.name(),
            offered,
            compatible = compatible.len(),
            "Filtered resources"
        );
        compatible
    }

    /// Order resources by preference; the first is tried first.
    fn rank<'r>(&self, task: &dyn Task, resources: Vec<&'r Resource>) -> Vec<&'r Resource> {
        task.rank_resources(resources)
    }
}

/// Delegates both steps to the task's own hooks.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultMatchMaker;

impl MatchMaker for DefaultMatchMaker {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ResourceSpec;
    use crate::state_machine::Run;
    use crate::task::TaskId;

    struct PicksLast {
        id: TaskId,
        execution: Run,
    }

    impl Task for PicksLast {
        fn id(&self) -> TaskId {
            self.id
        }
        fn name(&self) -> &str {
            "picky"
        }
        fn execution(&self) -> &Run {
            &self.execution
        }
        fn execution_mut(&mut self) -> &mut Run {
            &mut self.execution
        }
        fn compatible_resources<'r>(&self, resources: Vec<&'r Resource>) -> Vec<&'r Resource> {
            resources.into_iter().filter(|r| r.name() != "b").collect()
        }
        fn rank_resources<'r>(&self, mut resources: Vec<&'r Resource>) -> Vec<&'r Resource> {
            resources.reverse();
            resources
        }
    }

    fn resources() -> Vec<Resource> {
        ["a", "b", "c"]
            .into_iter()
            .map(|n| Resource::from_spec(ResourceSpec::new(n)).unwrap())
            .collect()
    }

    #[test]
    fn default_hooks_keep_everything_in_order() {
        let pool = resources();
        let task = crate::task::Application::new("plain", vec![]);
        let mm = DefaultMatchMaker;
        let filtered = mm.filter(&task, pool.iter().collect());
        let ranked = mm.rank(&task, filtered);
        let names: Vec<&str> = ranked.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn task_hooks_drive_filter_and_rank() {
        let pool = resources();
        let task = PicksLast {
            id: TaskId::new(),
            execution: Run::new(),
        };
        let mm = DefaultMatchMaker;
        let filtered = mm.filter(&task, pool.iter().collect());
        let ranked = mm.rank(&task, filtered);
        let names: Vec<&str> = ranked.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["c", "a"]);
    }
}
