//! Per-platform capabilities used by the supervisor.
//!
//! The state machine in `supervisor` is shared; only spawning, access-event
//! capture, reaping (which yields CPU times) and descendant discovery vary.

use crate::config::types::{Result, SandboxError};
use crate::core::types::SandboxedProcessInfo;
use crate::report::aggregator::ReportAggregator;
use crate::report::channel::{ReportChannel, REPORTS_FIFO_ENV};
use crate::utils::procfs;
use nix::errno::Errno;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{ChildStderr, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// A started primary process with its captured streams.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub pid: u32,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExitStatus {
    Exited(i32),
    Signaled(i32),
}

impl ProcessExitStatus {
    /// Shell-style exit code: signals map to `128 + signal`.
    pub fn code(self) -> i32 {
        match self {
            ProcessExitStatus::Exited(code) => code,
            ProcessExitStatus::Signaled(signal) => 128 + signal,
        }
    }
}

/// Outcome of reaping the primary process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapedProcess {
    pub status: ProcessExitStatus,
    pub user_time: Duration,
    pub kernel_time: Duration,
}

pub trait SandboxPlatform: Send + Sync {
    /// Start the primary process in its own process group.
    fn spawn(
        &self,
        info: &SandboxedProcessInfo,
        reports_fifo: Option<&Path>,
    ) -> Result<SpawnedProcess>;

    /// Open the access-report transport feeding `aggregator`, if the run asks for one.
    fn capture_access_events(
        &self,
        info: &SandboxedProcessInfo,
        aggregator: Arc<Mutex<ReportAggregator>>,
    ) -> Result<Option<ReportChannel>>;

    /// Block until `pid` exits; reports its CPU times.
    fn wait_for_exit(&self, pid: u32) -> Result<ReapedProcess>;

    /// Live descendants of `root_pid`.
    fn surviving_children(&self, root_pid: u32) -> Vec<u32>;
}

/// Linux/Unix implementation: process groups, FIFO reports, wait4, /proc.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixPlatform;

fn timeval_to_duration(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

impl SandboxPlatform for UnixPlatform {
    fn spawn(
        &self,
        info: &SandboxedProcessInfo,
        reports_fifo: Option<&Path>,
    ) -> Result<SpawnedProcess> {
        let mut command = Command::new(&info.executable);
        command
            .args(&info.arguments)
            .current_dir(&info.working_directory)
            .env_clear()
            .envs(info.environment.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(fifo) = reports_fifo {
            command.env(REPORTS_FIFO_ENV, fifo);
        }

        let mut child = command.spawn().map_err(|e| SandboxError::ProcessStart {
            pip: info.pip.to_string(),
            message: format!("{}: {}", info.executable.display(), e),
        })?;

        // The child is reaped by `wait_for_exit`, never through `Child`.
        Ok(SpawnedProcess {
            pid: child.id(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
        })
    }

    fn capture_access_events(
        &self,
        info: &SandboxedProcessInfo,
        aggregator: Arc<Mutex<ReportAggregator>>,
    ) -> Result<Option<ReportChannel>> {
        if !info.capture_access_reports {
            return Ok(None);
        }
        std::fs::create_dir_all(&info.scratch_directory)?;
        let fifo = info.scratch_directory.join(format!(
            "{}.{}.reports",
            info.pip.formatted_hash(),
            Uuid::new_v4()
        ));
        ReportChannel::open(&fifo, aggregator).map(Some)
    }

    fn wait_for_exit(&self, pid: u32) -> Result<ReapedProcess> {
        let mut status: libc::c_int = 0;
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        loop {
            let rc = unsafe { libc::wait4(pid as libc::pid_t, &mut status, 0, &mut usage) };
            if rc >= 0 {
                break;
            }
            match Errno::last() {
                Errno::EINTR => continue,
                errno => return Err(SandboxError::Process(format!("wait4({}): {}", pid, errno))),
            }
        }

        let status = if libc::WIFSIGNALED(status) {
            ProcessExitStatus::Signaled(libc::WTERMSIG(status))
        } else {
            ProcessExitStatus::Exited(libc::WEXITSTATUS(status))
        };
        Ok(ReapedProcess {
            status,
            user_time: timeval_to_duration(usage.ru_utime),
            kernel_time: timeval_to_duration(usage.ru_stime),
        })
    }

    fn surviving_children(&self, root_pid: u32) -> Vec<u32> {
        procfs::descendants(root_pid)
    }
}
