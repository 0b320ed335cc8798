/// Core types shared across the pipbox system
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Exit code reported for a process that hit its hard timeout
pub const EXIT_CODE_TIMEOUT: i32 = 27;

/// Exit code reported for a process killed without a timeout and without an OS signal status
pub const EXIT_CODE_KILLED: i32 = 137;

/// Identity of a pip (one build step) used to key every structured event
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipIdentity {
    /// Stable hash assigned by the build engine
    pub semi_stable_hash: u64,
    /// Human readable description
    pub description: String,
}

impl PipIdentity {
    pub fn new(semi_stable_hash: u64, description: impl Into<String>) -> Self {
        Self {
            semi_stable_hash,
            description: description.into(),
        }
    }

    /// Short form used in file names and event keys
    pub fn formatted_hash(&self) -> String {
        format!("Pip{:016X}", self.semi_stable_hash)
    }
}

impl fmt::Display for PipIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.formatted_hash(), self.description)
    }
}

/// Failure modes of the external execution adapters
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExternalExecutionError {
    /// The execution infrastructure itself failed (VM proxy, missing blobs)
    #[error("Infrastructure failure: {message}")]
    Infrastructure { message: String },

    /// The helper executable ran but did not complete its own contract
    #[error("Sandbox helper failed with exit code {exit_code:?}: {message}")]
    Helper {
        exit_code: Option<i32>,
        message: String,
    },

    /// The helper did not finish within its own timeout
    #[error("Sandbox helper timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl ExternalExecutionError {
    /// Whether the caller may retry the pip on a different worker
    pub fn is_retryable_on_different_worker(&self) -> bool {
        match self {
            ExternalExecutionError::Infrastructure { .. } => true,
            ExternalExecutionError::Timeout { .. } => true,
            ExternalExecutionError::Helper { .. } => false,
        }
    }
}

/// Custom error types for pipbox
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed report ({reason}): {line}")]
    Parse { reason: String, line: String },

    #[error("Failed to start process for [{pip}]: {message}")]
    ProcessStart { pip: String, message: String },

    #[error("Process error: {0}")]
    Process(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Dump error: {0}")]
    Dump(String),

    #[error(transparent)]
    ExternalExecution(#[from] ExternalExecutionError),
}

impl SandboxError {
    pub fn parse(reason: impl Into<String>, line: impl Into<String>) -> Self {
        SandboxError::Parse {
            reason: reason.into(),
            line: line.into(),
        }
    }
}

impl From<nix::errno::Errno> for SandboxError {
    fn from(err: nix::errno::Errno) -> Self {
        SandboxError::Process(err.to_string())
    }
}

/// Result type alias for pipbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;
