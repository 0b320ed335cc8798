//! Stateful collector of access reports for one pip.
//!
//! Mutation is single-writer: the report channel's drain thread is the only
//! caller of `record_line`/`record_event`. After `freeze` the access sets are
//! read-only and any further recording panics.

use crate::config::types::PipIdentity;
use crate::manifest::{normalize_path, AccessManifest, PathId, PathTable};
use crate::observability::events::{EventSink, SandboxEvent, SandboxEventKind};
use crate::report::channel::MessageCountSemaphore;
use crate::report::parser::AccessReportParser;
use crate::report::process_table::{ProcessIndex, ProcessTable, ReportedProcess};
use crate::report::types::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound of distinct literal paths kept in the intern cache
pub const INTERN_CACHE_CAPACITY: usize = 4096;

const DEFAULT_SEMAPHORE_TIMEOUT: Duration = Duration::from_secs(5);

crate::flag_set! {
    /// What to do with each kind of incoming message
    pub struct MessageHandlingFlags: u32 {
        const DEBUG_MESSAGE_NOTIFY = 0x01;
        const FILE_ACCESS_NOTIFY = 0x02;
        const FILE_ACCESS_COLLECT = 0x04;
        const PROCESS_DATA_NOTIFY = 0x08;
        const PROCESS_DETOURS_STATUS_NOTIFY = 0x10;
        const PROCESS_DETOURS_STATUS_COLLECT = 0x20;
    }
}

impl MessageHandlingFlags {
    /// Collect everything, notify nobody
    pub fn collect_only() -> Self {
        MessageHandlingFlags::FILE_ACCESS_COLLECT
            | MessageHandlingFlags::PROCESS_DETOURS_STATUS_COLLECT
    }
}

/// Receives messages whose `*_NOTIFY` flag is set.
pub trait ReportListener: Send + Sync {
    fn handle_debug_message(&self, _pip: &PipIdentity, _message: &str) {}
    fn handle_file_access(&self, _access: &ReportedFileAccess) {}
    fn handle_process_data(&self, _process: &ReportedProcess) {}
    fn handle_detouring_status(&self, _status: &ProcessDetouringStatus) {}
}

/// Terminal corruption of the report stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageProcessingFailure {
    pub reason: String,
    pub raw_line: String,
}

/// File access after aggregation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportedFileAccess {
    pub operation: ReportedFileOperation,
    /// Process-list entry the access is attributed to
    pub process: ProcessIndex,
    pub process_id: u32,
    pub requested_access: RequestedAccess,
    pub status: FileAccessStatus,
    pub method: FileAccessStatusMethod,
    pub explicitly_reported: bool,
    pub error: u32,
    pub usn: u64,
    pub desired_access: u32,
    pub share_mode: u32,
    pub creation_disposition: u32,
    pub flags_and_attributes: u32,
    pub manifest_path: PathId,
    /// Empty when identical to `manifest_path`
    pub path: Arc<str>,
    pub enumerate_pattern: Option<String>,
    pub is_augmented: bool,
}

impl ReportedFileAccess {
    /// Literal path, or the manifest path it was dropped in favour of.
    pub fn effective_path(&self, table: &PathTable) -> String {
        if !self.path.is_empty() {
            return self.path.to_string();
        }
        table.get(self.manifest_path).unwrap_or_default().to_string()
    }

    pub fn is_write(&self) -> bool {
        self.requested_access.contains(RequestedAccess::WRITE)
    }
}

/// Output sets of one pip's report stream
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessSets {
    pub all_accesses: Vec<ReportedFileAccess>,
    /// Denied or indeterminate
    pub unexpected_accesses: Vec<ReportedFileAccess>,
    /// Allowed and flagged for reporting; disjoint from `unexpected_accesses`
    pub explicitly_reported_accesses: Vec<ReportedFileAccess>,
    /// Every arena entry in arrival order, placeholders included
    pub processes: Vec<ReportedProcess>,
    pub detouring_statuses: Vec<ProcessDetouringStatus>,
    pub has_read_write_to_read_file_access_request: bool,
    pub process_tree_completed: bool,
    pub ignored_pathless_accesses: u64,
    pub message_processing_failure: Option<MessageProcessingFailure>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum PathKey {
    Manifest(PathId),
    Literal(Arc<str>),
}

pub struct ReportAggregator {
    pip: PipIdentity,
    manifest: Arc<AccessManifest>,
    events: Arc<dyn EventSink>,
    flags: MessageHandlingFlags,
    listener: Option<Arc<dyn ReportListener>>,
    semaphore: Option<Arc<MessageCountSemaphore>>,
    semaphore_timeout: Duration,
    processes: ProcessTable,
    interned: HashMap<Arc<str>, ()>,
    /// First write check per path: `true` when it was denied
    first_write_checks: HashMap<PathKey, bool>,
    sets: AccessSets,
    stopped: bool,
    frozen: bool,
}

impl ReportAggregator {
    pub fn new(
        pip: PipIdentity,
        manifest: Arc<AccessManifest>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            pip,
            manifest,
            events,
            flags: MessageHandlingFlags::collect_only(),
            listener: None,
            semaphore: None,
            semaphore_timeout: DEFAULT_SEMAPHORE_TIMEOUT,
            processes: ProcessTable::new(),
            interned: HashMap::new(),
            first_write_checks: HashMap::new(),
            sets: AccessSets::default(),
            stopped: false,
            frozen: false,
        }
    }

    pub fn with_flags(mut self, flags: MessageHandlingFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn ReportListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Require one semaphore release per message before it is processed.
    pub fn with_message_count_semaphore(
        mut self,
        semaphore: Arc<MessageCountSemaphore>,
        timeout: Duration,
    ) -> Self {
        self.semaphore = Some(semaphore);
        self.semaphore_timeout = timeout;
        self
    }

    pub fn pip(&self) -> &PipIdentity {
        &self.pip
    }

    /// Semaphore producers must release once per delivered message
    pub fn message_count_semaphore(&self) -> Option<Arc<MessageCountSemaphore>> {
        self.semaphore.clone()
    }

    pub fn manifest(&self) -> &AccessManifest {
        &self.manifest
    }

    fn assert_not_frozen(&self) {
        if self.frozen {
            panic!("report aggregator for [{}] is frozen", self.pip);
        }
    }

    /// Parse and record one wire line. Returns `false` when the stream must stop.
    pub fn record_line(&mut self, raw: &str) -> bool {
        self.assert_not_frozen();
        if self.sets.message_processing_failure.is_some() {
            return false;
        }

        if let Some(semaphore) = &self.semaphore {
            if !semaphore.wait(self.semaphore_timeout) {
                return self.fail("message count semaphore wait failed", raw);
            }
        }

        if self.stopped {
            return true;
        }

        match AccessReportParser::parse(raw) {
            Ok(report) => self.handle(report, raw),
            Err(err) => {
                let reason = match &err {
                    crate::config::types::SandboxError::Parse { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                self.events.emit(
                    &SandboxEvent::new(SandboxEventKind::ReportParseFailure, &self.pip)
                        .with_field("reason", &reason)
                        .with_field("line", raw),
                );
                self.fail(reason, raw)
            }
        }
    }

    /// Record an already-structured report from a native decoder.
    pub fn record_event(&mut self, report: ParsedReport) -> bool {
        self.assert_not_frozen();
        if self.sets.message_processing_failure.is_some() {
            return false;
        }
        if self.stopped {
            return true;
        }
        let raw = crate::report::encoder::encode(&report).unwrap_or_default();
        self.handle(report, &raw)
    }

    /// Store a failure raised outside the parser, such as a delivery thread that
    /// unwound mid-line. A frozen aggregator or an earlier failure is left untouched.
    pub fn record_delivery_failure(&mut self, reason: impl Into<String>, raw: &str) {
        if self.frozen || self.sets.message_processing_failure.is_some() {
            return;
        }
        self.fail(reason, raw);
    }

    fn fail(&mut self, reason: impl Into<String>, raw: &str) -> bool {
        let failure = MessageProcessingFailure {
            reason: reason.into(),
            raw_line: raw.to_string(),
        };
        log::error!(
            "[{}] report stream corrupted ({}): {}",
            self.pip,
            failure.reason,
            failure.raw_line
        );
        self.sets.message_processing_failure = Some(failure);
        false
    }

    fn handle(&mut self, report: ParsedReport, raw: &str) -> bool {
        match report {
            ParsedReport::FileAccess(access) => {
                self.handle_file_access(access);
                true
            }
            ParsedReport::ProcessData(data) => {
                self.handle_process_data(&data);
                true
            }
            ParsedReport::DetouringStatus(status) => {
                if self.flags.contains(MessageHandlingFlags::PROCESS_DETOURS_STATUS_NOTIFY) {
                    if let Some(listener) = &self.listener {
                        listener.handle_detouring_status(&status);
                    }
                }
                if self.flags.contains(MessageHandlingFlags::PROCESS_DETOURS_STATUS_COLLECT) {
                    self.sets.detouring_statuses.push(status);
                }
                true
            }
            ParsedReport::DebugMessage(message) => {
                log::debug!("[{}] {}", self.pip, message);
                if self.flags.contains(MessageHandlingFlags::DEBUG_MESSAGE_NOTIFY) {
                    if let Some(listener) = &self.listener {
                        listener.handle_debug_message(&self.pip, &message);
                    }
                }
                true
            }
            ParsedReport::WindowsCall(_) => {
                self.events.emit(
                    &SandboxEvent::new(SandboxEventKind::UnsupportedReport, &self.pip)
                        .with_field("line", raw),
                );
                self.fail("WindowsCall reports are not supported on this platform", raw)
            }
            ParsedReport::Ignored => {
                self.sets.ignored_pathless_accesses += 1;
                log::debug!("[{}] ignoring path-less access: {}", self.pip, raw);
                true
            }
        }
    }

    fn intern(&mut self, path: &str) -> Arc<str> {
        if let Some((existing, _)) = self.interned.get_key_value(path) {
            return Arc::clone(existing);
        }
        let value: Arc<str> = Arc::from(path);
        if self.interned.len() < INTERN_CACHE_CAPACITY {
            self.interned.insert(Arc::clone(&value), ());
        }
        value
    }

    fn handle_file_access(&mut self, access: FileAccessReport) {
        let FileAccessReport {
            operation,
            process_id,
            requested_access,
            mut status,
            explicitly_reported,
            error,
            usn,
            desired_access,
            share_mode,
            creation_disposition,
            flags_and_attributes,
            mut manifest_path,
            path,
            enumerate_pattern,
            command_line,
            is_augmented,
        } = access;

        if manifest_path.is_valid() && self.manifest.path_table().get(manifest_path).is_none() {
            manifest_path = PathId::INVALID;
        }

        let mut method = FileAccessStatusMethod::PolicyBased;
        if is_augmented {
            method = FileAccessStatusMethod::TrustedTool;
            match self.manifest.find_manifest_path_for(&path) {
                Some((id, policy)) => {
                    if !policy.reports_anything() {
                        return;
                    }
                    manifest_path = id;
                }
                None => {
                    if !self.manifest.default_policy.reports_anything() {
                        return;
                    }
                }
            }
        }

        if path.is_empty() && !manifest_path.is_valid() {
            self.sets.ignored_pathless_accesses += 1;
            return;
        }

        let literal = if manifest_path.is_valid()
            && self.manifest.path_table().get(manifest_path) == Some(normalize_path(&path))
        {
            Arc::from("")
        } else {
            self.intern(&path)
        };
        // Keyed by the accessed path. The manifest id only stands in for it when
        // the literal was dropped as identical; otherwise it names a cone scope.
        let key = if literal.is_empty() {
            PathKey::Manifest(manifest_path)
        } else {
            PathKey::Literal(self.intern(normalize_path(&literal)))
        };

        match operation {
            ReportedFileOperation::FirstAllowWriteCheckInProcess => {
                self.first_write_checks
                    .entry(key)
                    .or_insert(status == FileAccessStatus::Denied);
                return;
            }
            ReportedFileOperation::ChangedReadWriteToReadAccess => {
                self.sets.has_read_write_to_read_file_access_request = true;
                return;
            }
            ReportedFileOperation::ProcessTreeCompletedAck => {
                self.sets.process_tree_completed = true;
                return;
            }
            _ => {}
        }

        let process = match operation {
            ReportedFileOperation::Process => {
                let image = if literal.is_empty() {
                    self.manifest
                        .path_table()
                        .get(manifest_path)
                        .unwrap_or_default()
                        .to_string()
                } else {
                    literal.to_string()
                };
                self.processes.start(ReportedProcess::new(
                    process_id,
                    image,
                    command_line.unwrap_or_default(),
                ))
            }
            ReportedFileOperation::ProcessExit => {
                if self.processes.exit(process_id).is_none() {
                    log::debug!(
                        "[{}] dropping exit of pid {} with no active entry",
                        self.pip,
                        process_id
                    );
                }
                return;
            }
            _ => self.processes.resolve(process_id),
        };

        if !is_augmented
            && status == FileAccessStatus::Allowed
            && requested_access.contains(RequestedAccess::WRITE)
            && self.first_write_checks.get(&key).copied().unwrap_or(false)
        {
            status = FileAccessStatus::Denied;
            method = FileAccessStatusMethod::FileExistenceBased;
        }

        let reported = ReportedFileAccess {
            operation,
            process,
            process_id,
            requested_access,
            status,
            method,
            explicitly_reported,
            error,
            usn,
            desired_access,
            share_mode,
            creation_disposition,
            flags_and_attributes,
            manifest_path,
            path: literal,
            enumerate_pattern,
            is_augmented,
        };

        if self.flags.contains(MessageHandlingFlags::FILE_ACCESS_NOTIFY) {
            if let Some(listener) = &self.listener {
                listener.handle_file_access(&reported);
            }
        }
        if !self.flags.contains(MessageHandlingFlags::FILE_ACCESS_COLLECT) {
            return;
        }

        if reported.status.is_unexpected() {
            self.sets.unexpected_accesses.push(reported.clone());
        } else if reported.explicitly_reported {
            self.sets.explicitly_reported_accesses.push(reported.clone());
        }
        self.sets.all_accesses.push(reported);
    }

    fn handle_process_data(&mut self, data: &ProcessDataReport) {
        let index = match self.processes.lookup(data.process_id) {
            Some(index) => index,
            None => self
                .processes
                .start(ReportedProcess::new(data.process_id, data.path.clone(), String::new())),
        };
        let process = self.processes.get_mut(index);
        process.apply_process_data(data);

        if self.flags.contains(MessageHandlingFlags::PROCESS_DATA_NOTIFY) {
            if let Some(listener) = &self.listener {
                listener.handle_process_data(self.processes.get(index));
            }
        }
    }

    /// Kill notification: later lines are consumed and discarded.
    pub fn stop_recording(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn message_processing_failure(&self) -> Option<&MessageProcessingFailure> {
        self.sets.message_processing_failure.as_ref()
    }

    /// Lookup without fabricating a placeholder.
    pub fn process(&self, index: ProcessIndex) -> &ReportedProcess {
        self.processes.get(index)
    }

    /// Processes started and not yet exited.
    pub fn get_active_processes(&self) -> Vec<ReportedProcess> {
        self.processes.active_processes().into_iter().cloned().collect()
    }

    /// Idempotent and irreversible.
    pub fn freeze(&mut self) {
        if self.frozen {
            return;
        }
        self.frozen = true;
        self.sets.processes = self.processes.all().to_vec();
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Current access sets. The process list is filled in by `freeze`.
    pub fn access_sets(&self) -> &AccessSets {
        &self.sets
    }

    pub fn into_access_sets(mut self) -> AccessSets {
        self.freeze();
        self.sets
    }
}
