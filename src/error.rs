use thiserror::Error;

/// Errors raised by the engine, its backends and its collaborators.
#[derive(Debug, Error)]
pub enum GridError {
    /// Invalid or inconsistent configuration. Always fatal.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No resource can accept the task right now.
    #[error("No resources: {0}")]
    NoResources(String),

    #[error("No configured resource by the name '{0}'")]
    InvalidResourceName(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Credentials are missing or rejected and retrying will not help.
    #[error("Unrecoverable authentication error: {0}")]
    UnrecoverableAuth(String),

    #[error("Fatal error: {0}")]
    Fatal(String),

    /// The backend has no record of the job any more.
    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Submission to resource '{resource}' failed: {message}")]
    Submit { resource: String, message: String },

    /// The resource is adapting and will accept the task in a later cycle.
    #[error("Submission delayed to next iteration: {0}")]
    SkipToNextIteration(String),

    #[error("Temporary data staging failure: {0}")]
    RecoverableDataStaging(String),

    #[error("Data staging failure: {0}")]
    UnrecoverableDataStaging(String),

    #[error("Output not available: {0}")]
    OutputNotAvailable(String),

    /// Generic, transient backend failure.
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, GridError>;

impl GridError {
    /// Errors that mean the engine itself cannot make progress. These are
    /// never swallowed, whatever the error policy says.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GridError::Configuration(_) | GridError::UnrecoverableAuth(_) | GridError::Fatal(_)
        )
    }

    /// Errors that abort a whole `update_job_state` batch.
    pub fn aborts_update(&self) -> bool {
        self.is_fatal() || matches!(self, GridError::InvalidArgument(_))
    }

    /// Stable name of the error kind, used as a keyword by error policies.
    pub fn kind_name(&self) -> &'static str {
        match self {
            GridError::Configuration(_) => "ConfigurationError",
            GridError::NoResources(_) => "NoResources",
            GridError::InvalidResourceName(_) => "InvalidResourceName",
            GridError::InvalidArgument(_) => "InvalidArgument",
            GridError::InvalidOperation(_) => "InvalidOperation",
            GridError::UnrecoverableAuth(_) => "UnrecoverableAuthError",
            GridError::Fatal(_) => "FatalError",
            GridError::UnknownJob(_) => "UnknownJob",
            GridError::Submit { .. } => "SubmitError",
            GridError::SkipToNextIteration(_) => "SkipToNextIteration",
            GridError::RecoverableDataStaging(_) => "RecoverableDataStagingError",
            GridError::UnrecoverableDataStaging(_) => "UnrecoverableDataStagingError",
            GridError::OutputNotAvailable(_) => "OutputNotAvailableError",
            GridError::Backend(_) => "BackendError",
            GridError::Internal(_) => "InternalError",
            GridError::Io(_) => "IOError",
            GridError::Json(_) => "JsonError",
            GridError::Toml(_) => "TomlError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(GridError::Configuration("bad".into()).is_fatal());
        assert!(GridError::UnrecoverableAuth("no key".into()).is_fatal());
        assert!(GridError::Fatal("boom".into()).is_fatal());
        assert!(!GridError::Backend("timeout".into()).is_fatal());
        assert!(!GridError::UnknownJob("42".into()).is_fatal());
    }

    #[test]
    fn invalid_argument_aborts_update_but_is_not_fatal() {
        let err = GridError::InvalidArgument("no resource name".into());
        assert!(err.aborts_update());
        assert!(!err.is_fatal());
    }

    #[test]
    fn submit_error_display() {
        let err = GridError::Submit {
            resource: "cluster-a".into(),
            message: "queue full".into(),
        };
        assert_eq!(
            err.to_string(),
            "Submission to resource 'cluster-a' failed: queue full"
        );
        assert_eq!(err.kind_name(), "SubmitError");
        assert!(!err.is_fatal());
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: GridError = io.into();
        assert_eq!(err.kind_name(), "IOError");
    }
}
