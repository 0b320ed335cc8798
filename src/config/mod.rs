//! Configuration and error taxonomy
//!
//! Error types, JSON configuration loading, and eager contract validation.

pub mod loader;
pub mod types;
pub mod validator;

pub use loader::{AllowlistEntryConfig, SandboxConfiguration};
pub use types::{PipIdentity, Result, SandboxError};
