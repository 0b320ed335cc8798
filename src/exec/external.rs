//! Runs a pip through an out-of-process helper
//!
//! The request is written as a blob, the helper is launched with
//! `/sandboxedProcessInfo:<path> /sandboxedProcessResult:<path>`, and the
//! response blob it leaves behind is decoded into the usual result.

use crate::config::types::{ExternalExecutionError, Result};
use crate::core::types::{SandboxedProcessInfo, SandboxedProcessResult};
use crate::exec::codec::{self, PathEncoding};
use crate::observability::events::{EventSink, LogEventSink, SandboxEvent, SandboxEventKind};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Extra time a helper gets on top of the pip's own timeout
pub const DEFAULT_HELPER_GRACE: Duration = Duration::from_secs(30);

const HELPER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Blob files of one external run, removed on drop.
pub(crate) struct ScratchFiles {
    stem: PathBuf,
    created: Vec<PathBuf>,
}

impl ScratchFiles {
    pub(crate) fn new(info: &SandboxedProcessInfo) -> Result<Self> {
        std::fs::create_dir_all(&info.scratch_directory)?;
        let stem = info
            .scratch_directory
            .join(format!("{}.{}", info.pip.formatted_hash(), Uuid::new_v4()));
        Ok(Self {
            stem,
            created: Vec::new(),
        })
    }

    pub(crate) fn file(&mut self, suffix: &str) -> PathBuf {
        let mut name = self.stem.clone().into_os_string();
        name.push(".");
        name.push(suffix);
        let path = PathBuf::from(name);
        self.created.push(path.clone());
        path
    }
}

impl Drop for ScratchFiles {
    fn drop(&mut self) {
        for path in &self.created {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::debug!("cannot remove {}: {}", path.display(), e);
                }
            }
        }
    }
}

pub(crate) enum HelperRun {
    Finished { status: ExitStatus, stderr: String },
    TimedOut,
}

/// Spawn `command` in its own process group and wait at most `timeout`; a
/// late helper is killed with its group and reaped.
pub(crate) fn run_with_timeout(
    mut command: Command,
    timeout: Duration,
) -> std::io::Result<HelperRun> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()?;

    let stderr_reader = child.stderr.take().map(|mut stderr| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            let _ = stderr.read_to_end(&mut buffer);
            String::from_utf8_lossy(&buffer).into_owned()
        })
    });

    let started = Instant::now();
    let status = loop {
        match child.try_wait()? {
            Some(status) => break Some(status),
            None if started.elapsed() >= timeout => {
                // The whole group, so grandchildren release the stderr pipe.
                let _ = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
                let _ = child.kill();
                let _ = child.wait();
                break None;
            }
            None => thread::sleep(HELPER_POLL_INTERVAL),
        }
    };

    let stderr = stderr_reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    Ok(match status {
        Some(status) => HelperRun::Finished { status, stderr },
        None => HelperRun::TimedOut,
    })
}

/// Last non-empty stderr line, which is where helpers put their failure.
pub(crate) fn failure_message(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("no diagnostic output")
        .to_string()
}

pub(crate) fn report_failure(
    events: &dyn EventSink,
    info: &SandboxedProcessInfo,
    error: &ExternalExecutionError,
) {
    events.emit(
        &SandboxEvent::new(SandboxEventKind::ExternalExecutionFailed, &info.pip)
            .with_field("error", error)
            .with_field("retryable", error.is_retryable_on_different_worker()),
    );
}

pub(crate) fn decode_response(
    path: &Path,
) -> std::result::Result<SandboxedProcessResult, ExternalExecutionError> {
    codec::load_result(path).map_err(|e| ExternalExecutionError::Helper {
        exit_code: Some(0),
        message: format!("unreadable response {}: {}", path.display(), e),
    })
}

/// Executes pips through a local helper executable such as `pipbox-exec`.
pub struct ExternalToolExecutor {
    tool_path: PathBuf,
    leading_arguments: Vec<String>,
    grace: Duration,
    path_encoding: PathEncoding,
    events: Arc<dyn EventSink>,
}

impl ExternalToolExecutor {
    pub fn new(tool_path: impl Into<PathBuf>) -> Self {
        Self {
            tool_path: tool_path.into(),
            leading_arguments: Vec::new(),
            grace: DEFAULT_HELPER_GRACE,
            path_encoding: PathEncoding::PathTableId,
            events: Arc::new(LogEventSink),
        }
    }

    /// Arguments placed before the blob flags (e.g. a script run by an interpreter).
    pub fn with_leading_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_path_encoding(mut self, encoding: PathEncoding) -> Self {
        self.path_encoding = encoding;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn execute(&self, info: &SandboxedProcessInfo) -> Result<SandboxedProcessResult> {
        let mut files = ScratchFiles::new(info)?;
        let request = files.file("request.bin");
        let response = files.file("response.bin");
        codec::save_request(&request, info, self.path_encoding)?;

        let mut command = Command::new(&self.tool_path);
        command
            .args(&self.leading_arguments)
            .arg(format!("/sandboxedProcessInfo:{}", request.display()))
            .arg(format!("/sandboxedProcessResult:{}", response.display()));

        let timeout = info.timeout + self.grace;
        log::debug!(
            "[{}] running helper {} (timeout {}ms)",
            info.pip,
            self.tool_path.display(),
            timeout.as_millis()
        );

        let outcome = match run_with_timeout(command, timeout) {
            Ok(HelperRun::TimedOut) => Err(ExternalExecutionError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
            Ok(HelperRun::Finished { status, stderr }) if !status.success() => {
                Err(ExternalExecutionError::Helper {
                    exit_code: status.code(),
                    message: failure_message(&stderr),
                })
            }
            Ok(HelperRun::Finished { .. }) => decode_response(&response),
            Err(e) => Err(ExternalExecutionError::Infrastructure {
                message: format!("cannot start helper {}: {}", self.tool_path.display(), e),
            }),
        };

        outcome.map_err(|error| {
            report_failure(self.events.as_ref(), info, &error);
            error.into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{PipIdentity, SandboxError};
    use crate::observability::events::MemoryEventSink;

    fn info(dir: &Path) -> SandboxedProcessInfo {
        let mut info = SandboxedProcessInfo::new(PipIdentity::new(0x77, "external"), "/bin/true")
            .with_timeout(Duration::from_millis(100));
        info.scratch_directory = dir.join("scratch");
        info.output_directory = dir.join("out");
        info
    }

    fn executor(dir: &Path, script: &str, events: Arc<MemoryEventSink>) -> ExternalToolExecutor {
        let path = dir.join("helper.sh");
        std::fs::write(&path, script).unwrap();
        ExternalToolExecutor::new("/bin/sh")
            .with_leading_arguments([path.display().to_string()])
            .with_grace(Duration::from_millis(200))
            .with_events(events)
    }

    #[test]
    fn helper_response_is_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = dir.path().join("fixture.bin");
        let completed = SandboxedProcessResult::completed(5);
        codec::save_result(&fixture, &completed, PathEncoding::Literal).unwrap();
        let script = format!(
            concat!(
                "for a in \"$@\"; do case \"$a\" in ",
                "/sandboxedProcessResult:*) cp {} \"${{a#/sandboxedProcessResult:}}\";; ",
                "esac; done\n"
            ),
            fixture.display()
        );
        let events = Arc::new(MemoryEventSink::new());
        let result = executor(dir.path(), &script, Arc::clone(&events))
            .execute(&info(dir.path()))
            .unwrap();

        assert_eq!(result.exit_code, 5);
        assert_eq!(events.count(SandboxEventKind::ExternalExecutionFailed), 0);
        let leftovers = std::fs::read_dir(dir.path().join("scratch")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn nonzero_helper_exit_is_a_helper_failure() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(MemoryEventSink::new());
        let err = executor(dir.path(), "echo 'bad request blob' >&2\nexit 3\n", Arc::clone(&events))
            .execute(&info(dir.path()))
            .unwrap_err();

        match err {
            SandboxError::ExternalExecution(ExternalExecutionError::Helper {
                exit_code,
                message,
            }) => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(message, "bad request blob");
            }
            other => panic!("unexpected error: {other}"),
        }
        let failures = events.of_kind(SandboxEventKind::ExternalExecutionFailed);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].field("retryable"), Some("false"));
    }

    #[test]
    fn missing_response_is_a_helper_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = executor(dir.path(), "exit 0\n", Arc::new(MemoryEventSink::new()))
            .execute(&info(dir.path()))
            .unwrap_err();
        assert!(matches!(
            err,
            SandboxError::ExternalExecution(ExternalExecutionError::Helper {
                exit_code: Some(0),
                ..
            })
        ));
    }

    #[test]
    fn slow_helper_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let started = Instant::now();
        let err = executor(dir.path(), "sleep 10\n", Arc::new(MemoryEventSink::new()))
            .execute(&info(dir.path()))
            .unwrap_err();
        assert!(matches!(
            err,
            SandboxError::ExternalExecution(ExternalExecutionError::Timeout { timeout_ms: 300 })
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn unlaunchable_helper_is_infrastructure() {
        let dir = tempfile::tempdir().unwrap();
        let err = ExternalToolExecutor::new(dir.path().join("missing-helper"))
            .with_events(Arc::new(MemoryEventSink::new()))
            .execute(&info(dir.path()))
            .unwrap_err();
        assert!(matches!(
            err,
            SandboxError::ExternalExecution(ExternalExecutionError::Infrastructure { .. })
        ));
    }

    #[test]
    fn failure_message_picks_last_line() {
        assert_eq!(failure_message("warn\nfatal: boom\n\n"), "fatal: boom");
        assert_eq!(failure_message(""), "no diagnostic output");
    }
}
