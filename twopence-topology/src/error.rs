//! Error types for backends and the topology engine

use crate::state::{InstanceState, Operation};
use std::path::PathBuf;
use thiserror::Error;
use twopence_config::{ConfigError, RequirementError};

/// Failures of native provisioning tools
#[derive(Debug, Error)]
pub enum BackendError {
    /// Tool exited unsuccessfully
    #[error("Command `{command}` failed with {}: {stderr}", .code.map_or_else(|| "signal".to_string(), |c| format!("exit code {c}")))]
    CommandFailed {
        /// Command line
        command: String,
        /// Exit code, `None` when killed by a signal
        code: Option<i32>,
        /// Captured standard error
        stderr: String,
    },

    /// Tool did not finish in time
    #[error("Command `{command}` timed out after {seconds}s")]
    Timeout {
        /// Command line
        command: String,
        /// Limit that was exceeded
        seconds: u64,
    },

    /// The backend cannot do what was asked
    #[error("Not supported by {backend}: {what}")]
    Unsupported {
        /// Backend kind
        backend: &'static str,
        /// Unsupported request
        what: String,
    },

    /// An instance of that name already exists
    #[error("Instance {0} already exists")]
    InstanceExists(String),

    /// Missing instance, image or other backend object
    #[error("Not found: {0}")]
    NotFound(String),

    /// Packaging needs exactly one instance
    #[error("Refusing to package: expected exactly one instance, found {count}")]
    PackageRefused {
        /// Instances present
        count: usize,
    },

    /// File system errors in the instance workspace
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        /// File or directory
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Unparseable tool output
    #[error("Cannot parse tool output: {0}")]
    Json(#[from] serde_json::Error),

    /// Broken instance template
    #[error("Template error: {0}")]
    Template(String),
}

impl BackendError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| BackendError::Io { path, source }
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Topology lifecycle errors
#[derive(Debug, Error)]
pub enum TopologyError {
    /// Configuration could not be resolved
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A requirement has no answer
    #[error(transparent)]
    Requirement(#[from] RequirementError),

    /// Native tool failure
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Operation not allowed in the instance's state
    #[error("Cannot {operation} instance {node} while it is {state}")]
    InvalidTransition {
        /// Node name
        node: String,
        /// Current state
        state: InstanceState,
        /// Requested operation
        operation: Operation,
    },

    /// Instances exist and auto-destroy was not requested
    #[error("Instances already exist: {}; destroy them first or use --auto-destroy", .0.join(", "))]
    InstancesExist(Vec<String>),

    /// Instances did not stop when asked to
    #[error("Instances still running: {}", .0.join(", "))]
    StillRunning(Vec<String>),

    /// Backend reports something the operation cannot work with
    #[error("Instance {node} is recorded as {recorded} but the backend reports {observed}")]
    ReconciliationMismatch {
        /// Node name
        node: String,
        /// State in the status file
        recorded: InstanceState,
        /// State reported by the backend
        observed: InstanceState,
    },

    /// No such node in the configuration or the status file
    #[error("Unknown node {0}")]
    UnknownNode(String),

    /// `init` on an initialised workspace
    #[error("Workspace {} already has a BOM", .0.display())]
    BomExists(PathBuf),

    /// Any other command on an uninitialised workspace
    #[error("No BOM in {}; run init first", .0.display())]
    BomMissing(PathBuf),

    /// Another command holds the workspace lock
    #[error("Workspace {} is locked by another command", .0.display())]
    WorkspaceBusy(PathBuf),

    /// Workspace file system errors
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        /// File or directory
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Corrupt BOM or status file
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TopologyError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| TopologyError::Io { path, source }
    }
}

/// Result type for topology operations
pub type TopologyResult<T> = Result<T, TopologyError>;
