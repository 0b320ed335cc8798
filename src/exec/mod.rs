//! Out-of-process execution
//!
//! Same request/response contract as the in-process supervisor, carried as
//! binary blobs to a helper process or a VM command proxy.

pub mod codec;
pub mod external;
pub mod vm;

pub use codec::PathEncoding;
pub use external::ExternalToolExecutor;
pub use vm::{ExternalVmExecutor, VmCommand, VmCommandResult};
