//! Utilities
//!
//! Flag sets, output capture, and /proc scanning.

pub mod flags;
pub mod output;
pub mod procfs;
