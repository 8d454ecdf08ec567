//! Execution venues.
//!
//! A [`Backend`] talks to one batch cluster, SSH host or cloud node. The
//! engine never holds a backend directly: it goes through a [`Resource`],
//! which adds the `enabled`/`updated` flags used by brokering, and looks
//! the resource up by name on every operation.

pub mod noop;

use std::fmt;
use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GridError, Result};
use crate::state_machine::RunState;
use crate::task::Task;

pub use noop::NoOpBackend;

/// Operations the engine requires from an execution venue.
pub trait Backend {
    /// Hand the task over to the remote system. On success the task is
    /// considered SUBMITTED on this resource.
    fn submit_job(&mut self, task: &mut dyn Task) -> Result<()>;

    /// Return the current remote state of the job. May also record the
    /// return code on the task's execution record.
    fn update_job_state(&mut self, task: &mut dyn Task) -> Result<RunState>;

    fn get_results(
        &mut self,
        task: &mut dyn Task,
        download_dir: &Path,
        overwrite: bool,
        changed_only: bool,
    ) -> Result<()>;

    fn cancel_job(&mut self, task: &mut dyn Task) -> Result<()>;

    /// Release remote files and directories used by the job.
    fn free(&mut self, task: &mut dyn Task) -> Result<()>;

    /// Copy `size` bytes (all remaining when `None`) starting at `offset`
    /// of the remote file into `local`.
    fn peek(
        &mut self,
        task: &dyn Task,
        remote_filename: &str,
        local: &mut File,
        offset: u64,
        size: Option<u64>,
    ) -> Result<()>;

    /// Refresh the live status of the venue (free slots, queue length).
    fn get_resource_status(&mut self) -> Result<()>;

    fn close(&mut self) {}
}

/// Static description of a configured resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub name: String,

    /// Backend implementation to instantiate.
    #[serde(default = "default_kind")]
    pub kind: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_max_cores")]
    pub max_cores: u32,

    #[serde(default)]
    pub max_memory_mb: Option<u64>,

    #[serde(default)]
    pub architecture: Option<String>,
}

fn default_kind() -> String {
    "noop".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_max_cores() -> u32 {
    8
}

impl ResourceSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: default_kind(),
            enabled: default_enabled(),
            max_cores: default_max_cores(),
            max_memory_mb: None,
            architecture: None,
        }
    }

    pub fn with_max_cores(mut self, max_cores: u32) -> Self {
        self.max_cores = max_cores;
        self
    }
}

/// A configured execution venue: a backend plus brokering flags.
pub struct Resource {
    spec: ResourceSpec,
    /// Disabled resources are never considered for submission.
    pub enabled: bool,
    /// Whether the last status refresh succeeded.
    pub updated: bool,
    backend: Box<dyn Backend>,
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.spec.name)
            .field("kind", &self.spec.kind)
            .field("enabled", &self.enabled)
            .field("updated", &self.updated)
            .finish()
    }
}

impl Resource {
    pub fn new(spec: ResourceSpec, backend: Box<dyn Backend>) -> Self {
        let enabled = spec.enabled;
        Self {
            spec,
            enabled,
            updated: false,
            backend,
        }
    }

    /// Build a resource from its configuration, picking the backend by
    /// `spec.kind`.
    pub fn from_spec(spec: ResourceSpec) -> Result<Self> {
        let backend: Box<dyn Backend> = match spec.kind.as_str() {
            "noop" => Box::new(NoOpBackend::new(&spec)),
            other => {
                return Err(GridError::Configuration(format!(
                    "resource '{}' has unknown kind '{other}'",
                    spec.name
                )));
            }
        };
        Ok(Self::new(spec, backend))
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ResourceSpec {
        &self.spec
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut dyn Backend {
        self.backend.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_defaults_from_toml() {
        let spec: ResourceSpec = toml::from_str(r#"name = "local""#).unwrap();
        assert_eq!(spec.name, "local");
        assert_eq!(spec.kind, "noop");
        assert!(spec.enabled);
        assert_eq!(spec.max_cores, 8);
        assert!(spec.max_memory_mb.is_none());
    }

    #[test]
    fn resource_inherits_enabled_flag() {
        let mut spec = ResourceSpec::new("off");
        spec.enabled = false;
        let resource = Resource::from_spec(spec).unwrap();
        assert!(!resource.enabled);
        assert!(!resource.updated);
        assert_eq!(resource.name(), "off");
    }

    #[test]
    fn unknown_kind_is_configuration_error() {
        let mut spec = ResourceSpec::new("weird");
        spec.kind = "arc".into();
        let err = Resource::from_spec(spec).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("unknown kind 'arc'"));
    }
}
