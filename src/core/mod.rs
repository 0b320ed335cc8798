//! Process supervision core.
//!
//! One supervisor per pip. The state machine is shared; per-platform
//! capabilities sit behind `SandboxPlatform`.

pub mod platform;
pub mod supervisor;
pub mod types;

pub use platform::{ProcessExitStatus, ReapedProcess, SandboxPlatform, SpawnedProcess, UnixPlatform};
pub use supervisor::{
    run_sandboxed, KillHandle, NotStarted, Running, SandboxedProcess, SupervisorState,
};
pub use types::{KillReport, ProcessTimes, SandboxedProcessInfo, SandboxedProcessResult};
