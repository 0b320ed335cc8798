//! pipbox: sandboxed process supervision and file-access reporting for build steps
//!
//! A build step (a "pip") runs as a child process. An instrumentation layer
//! inside that process writes one line per observed file access or process
//! event to a FIFO; pipbox parses those lines, resolves them against the pip's
//! access manifest, and hands back an immutable result alongside the captured
//! output and process tree.
//!
//! # Architecture
//!
//! ## Manifest ([`manifest`])
//! - [`manifest::path_table`]: interned path strings keyed by `PathId`
//! - [`manifest::policy`]: the access policy tree and `FileAccessPolicy` bits
//!
//! ## Report pipeline ([`report`])
//! - [`report::parser`]: wire line to typed report
//! - [`report::encoder`]: typed report to wire line
//! - [`report::process_table`]: active/exited process arena
//! - [`report::aggregator`]: classification into `AccessSets`, freeze semantics
//! - [`report::channel`]: FIFO reader and ordered drain
//!
//! ## Process supervision ([`core`])
//! - [`core::supervisor`]: `SandboxedProcess` start/wait/kill/result state machine
//! - [`core::platform`]: spawn, reap and descendant discovery per platform
//! - [`core::types`]: request and response shapes
//!
//! ## Violation reporting ([`verdict`])
//! - [`verdict::allowlist`]: allowlist entries and matching
//! - [`verdict::classifier`]: violation vs. allowlisted classification and counters
//!
//! ## Out-of-process execution ([`exec`])
//! - [`exec::codec`]: request/response blobs
//! - [`exec::external`]: local helper executable
//! - [`exec::vm`]: helper inside a VM via a command proxy
//!
//! ## Observability ([`observability`])
//! - [`observability::events`]: structured event sink
//! - [`observability::dump`]: process dumps taken before a kill
//!
//! ## Configuration ([`config`]) and utilities ([`utils`])

// Configuration & errors
pub mod config;

// Access manifest
pub mod manifest;

// Report wire format and aggregation
pub mod report;

// Process supervision
pub mod core;

// Violation classification
pub mod verdict;

// External execution adapters
pub mod exec;

// Observability
pub mod observability;

// Utilities
pub mod utils;

// Helper CLI used by the pipbox-exec binary
pub mod cli;

pub use config::types::{ExternalExecutionError, PipIdentity, Result, SandboxError};
pub use core::supervisor::{run_sandboxed, SandboxedProcess};
pub use core::types::{SandboxedProcessInfo, SandboxedProcessResult};
pub use manifest::{AccessManifest, FileAccessPolicy};
pub use report::aggregator::{AccessSets, ReportAggregator};
