/// Structured sandbox events keyed by pip identity
///
/// The core never formats user-facing text; it hands kind + fields to an
/// `EventSink`. `LogEventSink` renders them through `log` as one JSON line.
use crate::config::types::PipIdentity;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use std::time::SystemTime;

/// Event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Kinds of events emitted by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SandboxEventKind {
    // Classification
    FileAccessViolation,
    AllowlistedUncacheableAccess,
    AllowlistedCacheableAccess,

    // Report channel
    ReportParseFailure,
    UnsupportedReport,
    DebugMessage,

    // Process lifecycle
    ProcessStarted,
    ProcessStartFailed,
    ProcessWarningTimeout,
    ProcessTimedOut,
    ProcessKilled,
    SurvivingChildrenKilled,
    DumpFailed,

    // External execution
    ExternalExecutionFailed,
}

impl SandboxEventKind {
    /// Get the default severity for this event kind
    pub fn default_severity(&self) -> EventSeverity {
        match self {
            SandboxEventKind::FileAccessViolation => EventSeverity::Error,
            SandboxEventKind::AllowlistedUncacheableAccess => EventSeverity::Warning,
            SandboxEventKind::AllowlistedCacheableAccess => EventSeverity::Info,

            SandboxEventKind::ReportParseFailure => EventSeverity::Error,
            SandboxEventKind::UnsupportedReport => EventSeverity::Error,
            SandboxEventKind::DebugMessage => EventSeverity::Debug,

            SandboxEventKind::ProcessStarted => EventSeverity::Debug,
            SandboxEventKind::ProcessStartFailed => EventSeverity::Error,
            SandboxEventKind::ProcessWarningTimeout => EventSeverity::Warning,
            SandboxEventKind::ProcessTimedOut => EventSeverity::Error,
            SandboxEventKind::ProcessKilled => EventSeverity::Info,
            SandboxEventKind::SurvivingChildrenKilled => EventSeverity::Warning,
            SandboxEventKind::DumpFailed => EventSeverity::Warning,

            SandboxEventKind::ExternalExecutionFailed => EventSeverity::Error,
        }
    }
}

impl fmt::Display for SandboxEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One structured event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxEvent {
    pub kind: SandboxEventKind,
    pub severity: EventSeverity,
    pub pip: PipIdentity,
    pub fields: BTreeMap<String, String>,
    pub timestamp: SystemTime,
}

impl SandboxEvent {
    /// Create a new event with the kind's default severity
    pub fn new(kind: SandboxEventKind, pip: &PipIdentity) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            pip: pip.clone(),
            fields: BTreeMap::new(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn with_field(mut self, name: &str, value: impl ToString) -> Self {
        self.fields.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_severity(mut self, severity: EventSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Log sink collaborator
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &SandboxEvent);
}

/// Renders events through the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, event: &SandboxEvent) {
        let entry = serde_json::json!({
            "kind": event.kind,
            "pip": event.pip.formatted_hash(),
            "description": event.pip.description,
            "fields": event.fields,
        });

        match event.severity {
            EventSeverity::Error => error!("[{}] {}", event.kind, entry),
            EventSeverity::Warning => warn!("[{}] {}", event.kind, entry),
            EventSeverity::Info => info!("[{}] {}", event.kind, entry),
            EventSeverity::Debug => debug!("[{}] {}", event.kind, entry),
        }
    }
}

/// Records events in memory
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<SandboxEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SandboxEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn of_kind(&self, kind: SandboxEventKind) -> Vec<SandboxEvent> {
        self.events().into_iter().filter(|e| e.kind == kind).collect()
    }

    pub fn count(&self, kind: SandboxEventKind) -> usize {
        self.of_kind(kind).len()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: &SandboxEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}
