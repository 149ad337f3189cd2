//! Error types for configuration resolution

use thiserror::Error;
use twopence_curly::CurlyError;
use twopence_graph::GraphError;

/// Which side of a build's compatibility block was violated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    /// A required feature is missing
    Requires,
    /// A conflicting feature is present
    Conflicts,
}

impl std::fmt::Display for Constraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constraint::Requires => write!(f, "requires"),
            Constraint::Conflicts => write!(f, "conflicts with"),
        }
    }
}

/// Configuration errors. Always raised before any backend action.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Document could not be loaded
    #[error(transparent)]
    Document(#[from] CurlyError),

    /// Reference to an object that no fragment defines
    #[error("Unknown {kind} \"{name}\"{}", .context.as_deref().map(|c| format!(" ({c})")).unwrap_or_default())]
    UnknownReference {
        /// Object kind (`platform`, `build`, `repository`, ...)
        kind: &'static str,
        /// Name as referenced
        name: String,
        /// Where the reference was made
        context: Option<String>,
    },

    /// Inheritance loop between platforms or builds
    #[error("Inheritance cycle between {kind}s: {}", .chain.join(" -> "))]
    InheritanceCycle {
        /// Object kind
        kind: &'static str,
        /// Offending chain, first and last element are equal
        chain: Vec<String>,
    },

    /// Build compatibility violation
    #[error("Build \"{build}\" {constraint} feature \"{feature}\"")]
    Incompatible {
        /// Offending build
        build: String,
        /// Feature that violates the constraint
        feature: String,
        /// Violated side
        constraint: Constraint,
    },

    /// Required attribute missing
    #[error("{kind} \"{name}\" lacks a {attribute} definition")]
    MissingAttribute {
        /// Object kind
        kind: &'static str,
        /// Object name
        name: String,
        /// Missing attribute
        attribute: &'static str,
    },

    /// Anything else that makes the configuration unusable
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// Reading shell library files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serializing compiled configs
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConfigError {
    /// Map an inheritance graph error onto the configuration vocabulary.
    pub(crate) fn from_graph(kind: &'static str, err: GraphError) -> Self {
        match err {
            GraphError::CycleDetected(chain) => ConfigError::InheritanceCycle { kind, chain },
            GraphError::NodeNotFound(name) => ConfigError::UnknownReference {
                kind,
                name,
                context: None,
            },
            GraphError::InvalidOperation(message) => ConfigError::Invalid(message),
        }
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Requirement resolution errors
#[derive(Debug, Error)]
pub enum RequirementError {
    /// No stored answer and no way to ask
    #[error("Unable to resolve requirement \"{name}\" for node {node}")]
    Unresolved {
        /// Requirement name
        name: String,
        /// Node that needs it
        node: String,
    },

    /// Requirement was referenced but never defined
    #[error("Unknown requirement \"{0}\"")]
    Unknown(String),

    /// Answer file or terminal I/O
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File or device
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Broken answer file
    #[error(transparent)]
    Document(#[from] CurlyError),
}

/// Result type for requirement operations
pub type RequirementResult<T> = Result<T, RequirementError>;
