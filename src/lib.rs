//! gridflow: lifecycle management for batch jobs on remote resources.
//!
//! Tasks move through the [`RunState`] machine. The [`Core`] performs
//! single operations against pluggable [`Backend`]s, and the [`Engine`]
//! drives many tasks at once, one [`Engine::progress`] cycle at a time.

pub mod backend;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod matchmaker;
pub mod policy;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod task;
pub mod workflow;

#[cfg(test)]
mod testing;

pub use backend::{Backend, NoOpBackend, Resource, ResourceSpec};
pub use config::{CoreOptions, EngineOptions, GridConfig};
pub use crate::core::{Core, ResourceMatch};
pub use engine::{Bucket, Engine, Stats};
pub use error::{GridError, Result};
pub use policy::{ErrorContext, ErrorPolicy, KeywordPolicy};
pub use state_machine::{Run, RunState, Signal};
pub use store::{FileStore, MemoryStore, Store};
pub use task::{Application, Composite, Stream, Task, TaskId, TaskKind};
pub use workflow::ParallelCollection;
