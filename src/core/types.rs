//! Request and response shapes of one sandboxed process run.

use crate::config::loader::SandboxConfiguration;
use crate::config::types::PipIdentity;
use crate::manifest::AccessManifest;
use crate::report::aggregator::{AccessSets, MessageProcessingFailure};
use crate::report::process_table::ReportedProcess;
use crate::utils::output::{CapturedOutput, OutputIntegrity};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Everything needed to launch one pip's process.
#[derive(Clone, Debug, PartialEq)]
pub struct SandboxedProcessInfo {
    pub pip: PipIdentity,
    pub executable: PathBuf,
    pub arguments: Vec<String>,
    pub working_directory: PathBuf,
    /// Exact child environment, in order
    pub environment: Vec<(String, String)>,
    pub manifest: Arc<AccessManifest>,
    pub timeout: Duration,
    /// Soft threshold; `None` disables the warning
    pub warning_timeout: Option<Duration>,
    /// Grace period for the rest of the process tree after the primary exits
    pub nested_process_termination_timeout: Duration,
    /// Receives spilled stdout/stderr and process dumps
    pub output_directory: PathBuf,
    /// Receives the report FIFO
    pub scratch_directory: PathBuf,
    pub max_output_in_memory_bytes: usize,
    /// Open a report channel and hand its path to the child
    pub capture_access_reports: bool,
    /// How long the report drain waits for each announced message
    pub message_count_semaphore_timeout: Duration,
}

impl SandboxedProcessInfo {
    pub fn new(pip: PipIdentity, executable: impl Into<PathBuf>) -> Self {
        let defaults = SandboxConfiguration::default();
        let temp = std::env::temp_dir();
        Self {
            pip,
            executable: executable.into(),
            arguments: Vec::new(),
            working_directory: std::env::current_dir().unwrap_or_else(|_| temp.clone()),
            environment: Vec::new(),
            manifest: Arc::new(AccessManifest::new()),
            timeout: defaults.default_timeout(),
            warning_timeout: Some(defaults.warning_timeout()),
            nested_process_termination_timeout: defaults.nested_process_termination_timeout(),
            output_directory: temp.clone(),
            scratch_directory: temp,
            max_output_in_memory_bytes: defaults.max_output_in_memory_bytes,
            capture_access_reports: false,
            message_count_semaphore_timeout: defaults.message_count_semaphore_timeout(),
        }
    }

    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_manifest(mut self, manifest: Arc<AccessManifest>) -> Self {
        self.manifest = manifest;
        self
    }

    /// Timeouts and output limits from engine configuration
    pub fn with_config(mut self, config: &SandboxConfiguration) -> Self {
        self.timeout = config.default_timeout();
        self.warning_timeout = Some(config.warning_timeout());
        self.nested_process_termination_timeout = config.nested_process_termination_timeout();
        self.max_output_in_memory_bytes = config.max_output_in_memory_bytes;
        self.message_count_semaphore_timeout = config.message_count_semaphore_timeout();
        self
    }

    /// Executable followed by its arguments, for logs and events
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.executable.display().to_string()];
        parts.extend(self.arguments.iter().cloned());
        parts.join(" ")
    }
}

/// Timing of the primary process
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessTimes {
    pub start_time: Option<DateTime<Utc>>,
    pub exit_time: Option<DateTime<Utc>>,
    pub wall_clock: Duration,
    pub user_time: Duration,
    pub kernel_time: Duration,
}

/// What one kill did; produced once per supervisor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KillReport {
    pub kill_sent: bool,
    pub descendants_killed: Vec<u32>,
    pub dump_attempted: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

/// Terminal, immutable result of one run.
#[derive(Clone, Debug, PartialEq)]
pub struct SandboxedProcessResult {
    pub exit_code: i32,
    pub killed: bool,
    pub timed_out: bool,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    pub stdout_integrity: OutputIntegrity,
    pub stderr_integrity: OutputIntegrity,
    /// Frozen report sets; `processes` keeps every arena entry
    pub access_sets: AccessSets,
    /// One entry per pid, last-seen data wins
    pub processes: Vec<ReportedProcess>,
    pub surviving_child_processes: Vec<ReportedProcess>,
    pub primary_process_times: ProcessTimes,
    pub dump_directory: Option<PathBuf>,
    pub dump_creation_error: Option<String>,
    pub kill_report: Option<KillReport>,
}

impl SandboxedProcessResult {
    pub fn message_processing_failure(&self) -> Option<&MessageProcessingFailure> {
        self.access_sets.message_processing_failure.as_ref()
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.killed && self.message_processing_failure().is_none()
    }
}

#[cfg(test)]
impl SandboxedProcessResult {
    /// Clean run with empty outputs, for fixtures.
    pub(crate) fn completed(exit_code: i32) -> Self {
        Self {
            exit_code,
            killed: false,
            timed_out: false,
            stdout: CapturedOutput::InMemory(String::new()),
            stderr: CapturedOutput::InMemory(String::new()),
            stdout_integrity: OutputIntegrity::Complete,
            stderr_integrity: OutputIntegrity::Complete,
            access_sets: AccessSets::default(),
            processes: Vec::new(),
            surviving_child_processes: Vec::new(),
            primary_process_times: ProcessTimes::default(),
            dump_directory: None,
            dump_creation_error: None,
            kill_report: None,
        }
    }
}

/// Keep the last record per pid, in order of each pid's first appearance.
pub fn coalesce_processes(processes: &[ReportedProcess]) -> Vec<ReportedProcess> {
    let mut positions: HashMap<u32, usize> = HashMap::new();
    let mut coalesced: Vec<ReportedProcess> = Vec::new();
    for process in processes.iter().filter(|p| !p.is_placeholder) {
        match positions.get(&process.process_id) {
            Some(&position) => coalesced[position] = process.clone(),
            None => {
                positions.insert(process.process_id, coalesced.len());
                coalesced.push(process.clone());
            }
        }
    }
    coalesced
}
