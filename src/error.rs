//! Unified error type hierarchy for the image compose pipeline
//!
//! Provides structured error handling with ConfigError, TemplateError,
//! ServiceError, BuildError, ArtifactError, CommandError and the top-level
//! PipelineError that the driver reports.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration file parsing and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid JSON in config: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Malformed configuration at {path}:{line}: {reason}")]
    Malformed {
        path: String,
        line: usize,
        reason: String,
    },

    #[error("Configuration section [{0}] not found")]
    MissingSection(String),

    #[error("Required setting '{key}' missing from section [{section}]")]
    MissingSetting { section: String, key: String },

    #[error("Invalid value '{value}' for '{key}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("{given} is not a valid image type. The valid types are {valid}")]
    UnknownFormat { given: String, valid: String },

    #[error("IO error during config operations: {0}")]
    IoError(#[from] io::Error),
}

/// Kickstart flattening and placeholder substitution errors.
#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Kickstart flattening failed: {0}")]
    FlattenFailed(String),

    #[error("Unresolved template placeholders: {}", .0.join(", "))]
    UnresolvedPlaceholders(Vec<String>),
}

/// Content server and repository inspection errors.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Content server failed to start: {0}")]
    Bind(String),

    #[error("Cannot resolve commit for {reference}: {reason}")]
    CommitResolution { reference: String, reason: String },
}

/// Build process execution errors.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("{target} build finished with status {status}")]
    Failed { target: String, status: String },

    #[error("{target} build exceeded the {}s timeout", .limit.as_secs())]
    TimedOut { target: String, limit: Duration },

    #[error("Build cancelled")]
    Cancelled,

    #[error("Image builder backend '{0}' is not supported")]
    Unsupported(String),

    #[error("Build engine error: {0}")]
    Engine(String),
}

/// Copy and conversion errors for completed artifacts.
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Failed to copy {from} to {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Image conversion failed: {0}")]
    Convert(String),
}

/// Failures of an external tool invocation.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error while running command: {0}")]
    Io(#[from] io::Error),

    #[error("Command timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("Command cancelled")]
    Cancelled,
}

/// Global error type for a compose run.
///
/// Every variant is fatal for the current task; nothing is retried.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    /// Internal state machine violation
    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),
}

impl PipelineError {
    /// Get a user-facing error message suitable for the terminal
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::Config(e) => format!("Configuration error: {}", e),
            PipelineError::Template(e) => format!("Templating error: {}", e),
            PipelineError::Service(e) => format!("Service startup error: {}", e),
            PipelineError::Build(e) => format!("Build failure: {}", e),
            PipelineError::Artifact(e) => format!("Artifact I/O error: {}", e),
            PipelineError::InvalidTransition(msg) => format!("Internal error: {}", msg),
        }
    }
}

/// Top-level result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
