//! Policy-aware classification of unexpected file accesses
//!
//! Allowlist matching and the per-pip reporting context built on it.

pub mod allowlist;
pub mod classifier;

pub use allowlist::{AllowlistEntry, AllowlistMatch, FileAccessAllowlist};
pub use classifier::{FileAccessReportingContext, ObservedFileAccess, ReportingSettings};
