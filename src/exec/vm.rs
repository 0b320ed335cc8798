//! Runs the helper inside a VM through a command proxy
//!
//! The proxy gets `Run /InputJsonFile:<in> /OutputJsonFile:<out>`. Its own
//! failures (bad exit, unreadable output) are infrastructure errors and may be
//! retried elsewhere; a helper that failed inside the VM is not.

use crate::config::types::{ExternalExecutionError, Result, SandboxError};
use crate::core::types::{SandboxedProcessInfo, SandboxedProcessResult};
use crate::exec::codec::{self, PathEncoding};
use crate::exec::external::{
    decode_response, failure_message, report_failure, run_with_timeout, HelperRun, ScratchFiles,
    DEFAULT_HELPER_GRACE,
};
use crate::observability::events::{EventSink, LogEventSink};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

/// Command the proxy runs inside the VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmCommand {
    pub executable: String,
    pub arguments: Vec<String>,
    pub working_directory: String,
}

/// What the proxy reports back about the helper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmCommandResult {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

pub struct ExternalVmExecutor {
    proxy_path: PathBuf,
    proxy_leading_arguments: Vec<String>,
    /// Helper executable as seen from inside the VM
    helper_path: PathBuf,
    grace: Duration,
    path_encoding: PathEncoding,
    events: Arc<dyn EventSink>,
}

fn infrastructure(message: String) -> ExternalExecutionError {
    ExternalExecutionError::Infrastructure { message }
}

impl ExternalVmExecutor {
    pub fn new(proxy_path: impl Into<PathBuf>, helper_path: impl Into<PathBuf>) -> Self {
        Self {
            proxy_path: proxy_path.into(),
            proxy_leading_arguments: Vec::new(),
            helper_path: helper_path.into(),
            grace: DEFAULT_HELPER_GRACE,
            path_encoding: PathEncoding::PathTableId,
            events: Arc::new(LogEventSink),
        }
    }

    pub fn with_proxy_leading_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.proxy_leading_arguments = arguments.into_iter().map(Into::into).collect();
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

    fn command_for(
        &self,
        info: &SandboxedProcessInfo,
        request: &Path,
        response: &Path,
    ) -> VmCommand {
        VmCommand {
            executable: self.helper_path.display().to_string(),
            arguments: vec![
                format!("/sandboxedProcessInfo:{}", request.display()),
                format!("/sandboxedProcessResult:{}", response.display()),
            ],
            working_directory: info.working_directory.display().to_string(),
        }
    }

    pub fn execute(&self, info: &SandboxedProcessInfo) -> Result<SandboxedProcessResult> {
        let mut files = ScratchFiles::new(info)?;
        let request = files.file("request.bin");
        let response = files.file("response.bin");
        let vm_input = files.file("vm-input.json");
        let vm_output = files.file("vm-output.json");

        codec::save_request(&request, info, self.path_encoding)?;
        let command = self.command_for(info, &request, &response);
        let json = serde_json::to_string(&command)
            .map_err(|e| SandboxError::Codec(format!("VM command: {}", e)))?;
        std::fs::write(&vm_input, json)?;

        self.run_proxy(info, &vm_input, &vm_output)
            .and_then(|helper| {
                if helper.exit_code != 0 {
                    return Err(ExternalExecutionError::Helper {
                        exit_code: Some(helper.exit_code),
                        message: failure_message(&helper.stderr),
                    });
                }
                decode_response(&response)
            })
            .map_err(|error| {
                report_failure(self.events.as_ref(), info, &error);
                error.into()
            })
    }

    fn run_proxy(
        &self,
        info: &SandboxedProcessInfo,
        vm_input: &Path,
        vm_output: &Path,
    ) -> std::result::Result<VmCommandResult, ExternalExecutionError> {
        let mut command = Command::new(&self.proxy_path);
        command
            .args(&self.proxy_leading_arguments)
            .arg("Run")
            .arg(format!("/InputJsonFile:{}", vm_input.display()))
            .arg(format!("/OutputJsonFile:{}", vm_output.display()));

        let timeout = info.timeout + self.grace;
        log::debug!("[{}] running VM proxy {}", info.pip, self.proxy_path.display());

        match run_with_timeout(command, timeout) {
            Ok(HelperRun::Finished { status, stderr }) if !status.success() => {
                return Err(infrastructure(format!(
                    "VM command proxy exited with {:?}: {}",
                    status.code(),
                    failure_message(&stderr)
                )));
            }
            Ok(HelperRun::Finished { .. }) => {}
            Ok(HelperRun::TimedOut) => {
                return Err(ExternalExecutionError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            Err(e) => {
                return Err(infrastructure(format!(
                    "cannot start VM command proxy {}: {}",
                    self.proxy_path.display(),
                    e
                )));
            }
        }

        let raw = std::fs::read_to_string(vm_output).map_err(|e| {
            infrastructure(format!("VM output {} is missing: {}", vm_output.display(), e))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| {
                infrastructure(format!("VM output {} is invalid: {}", vm_output.display(), e))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::PipIdentity;
    use crate::observability::events::{MemoryEventSink, SandboxEventKind};

    const PROXY_PRELUDE: &str = r#"[ "$1" = "Run" ] || exit 9
for a in "$@"; do
  case "$a" in
    /InputJsonFile:*) input="${a#/InputJsonFile:}";;
    /OutputJsonFile:*) out="${a#/OutputJsonFile:}";;
  esac
done
resp=$(sed -n 's/.*\/sandboxedProcessResult:\([^"]*\)".*/\1/p' "$input")
"#;

    fn info(dir: &Path) -> SandboxedProcessInfo {
        let mut info = SandboxedProcessInfo::new(PipIdentity::new(0x88, "vm"), "/bin/true")
            .with_timeout(Duration::from_millis(500));
        info.scratch_directory = dir.join("scratch");
        info
    }

    fn executor(dir: &Path, body: &str, events: Arc<MemoryEventSink>) -> ExternalVmExecutor {
        let path = dir.join("proxy.sh");
        std::fs::write(&path, format!("{}{}", PROXY_PRELUDE, body)).unwrap();
        ExternalVmExecutor::new("/bin/sh", "/opt/pipbox/pipbox-exec")
            .with_proxy_leading_arguments([path.display().to_string()])
            .with_grace(Duration::from_millis(500))
            .with_events(events)
    }

    fn error_of(result: Result<SandboxedProcessResult>) -> ExternalExecutionError {
        match result {
            Err(SandboxError::ExternalExecution(error)) => error,
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected a failure"),
        }
    }

    #[test]
    fn pip_failure_inside_vm_is_a_normal_result() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = dir.path().join("fixture.bin");
        let result = SandboxedProcessResult::completed(1);
        codec::save_result(&fixture, &result, PathEncoding::PathTableId).unwrap();
        let body = format!(
            "cp {} \"$resp\"\nprintf '{{\"exit_code\":0}}' > \"$out\"\n",
            fixture.display()
        );
        let events = Arc::new(MemoryEventSink::new());
        let result = executor(dir.path(), &body, Arc::clone(&events))
            .execute(&info(dir.path()))
            .unwrap();
        assert_eq!(result.exit_code, 1);
        assert_eq!(events.count(SandboxEventKind::ExternalExecutionFailed), 0);
    }

    #[test]
    fn proxy_failure_is_retryable_infrastructure() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(MemoryEventSink::new());
        let vm = executor(dir.path(), "echo 'vm lost' >&2\nexit 2\n", Arc::clone(&events));
        let error = error_of(vm.execute(&info(dir.path())));
        assert!(matches!(
            error,
            ExternalExecutionError::Infrastructure { ref message } if message.contains("vm lost")
        ));
        assert!(error.is_retryable_on_different_worker());
        let failures = events.of_kind(SandboxEventKind::ExternalExecutionFailed);
        assert_eq!(failures[0].field("retryable"), Some("true"));
    }

    #[test]
    fn missing_or_invalid_proxy_output_is_infrastructure() {
        let dir = tempfile::tempdir().unwrap();
        let vm = executor(dir.path(), "exit 0\n", Arc::new(MemoryEventSink::new()));
        let missing = error_of(vm.execute(&info(dir.path())));
        assert!(matches!(missing, ExternalExecutionError::Infrastructure { .. }));

        let invalid = error_of(
            executor(dir.path(), "echo 'not json' > \"$out\"\n", Arc::new(MemoryEventSink::new()))
                .execute(&info(dir.path())),
        );
        assert!(matches!(invalid, ExternalExecutionError::Infrastructure { .. }));
    }

    #[test]
    fn helper_failure_inside_vm_is_not_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let body = "printf '{\"exit_code\":4,\"stderr\":\"cannot read request\"}' > \"$out\"\n";
        let vm = executor(dir.path(), body, Arc::new(MemoryEventSink::new()));
        let error = error_of(vm.execute(&info(dir.path())));
        match error {
            ExternalExecutionError::Helper { exit_code, message } => {
                assert_eq!(exit_code, Some(4));
                assert_eq!(message, "cannot read request");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn vm_command_names_helper_and_blobs() {
        let executor = ExternalVmExecutor::new("/usr/bin/vmproxy", "/opt/pipbox/pipbox-exec");
        let mut info = info(Path::new("/tmp"));
        info.working_directory = PathBuf::from("/work");
        let command =
            executor.command_for(&info, Path::new("/s/req.bin"), Path::new("/s/resp.bin"));
        let json = serde_json::to_value(&command).unwrap();
        pretty_assertions::assert_eq!(
            json,
            serde_json::json!({
                "executable": "/opt/pipbox/pipbox-exec",
                "arguments": [
                    "/sandboxedProcessInfo:/s/req.bin",
                    "/sandboxedProcessResult:/s/resp.bin"
                ],
                "working_directory": "/work",
            })
        );
    }
}
