/// Classification of unexpected file accesses against the allowlist
///
/// Runs downstream of the aggregator: partitions a pip's unexpected accesses
/// into violations and allowlisted accesses and keeps the counters that
/// decide whether the pip's outputs may be cached.
use crate::config::loader::SandboxConfiguration;
use crate::config::types::{PipIdentity, Result};
use crate::config::validator::validate_reporting_config;
use crate::manifest::PathTable;
use crate::observability::events::{EventSeverity, EventSink, SandboxEvent, SandboxEventKind};
use crate::report::aggregator::{AccessSets, ReportedFileAccess};
use crate::verdict::allowlist::{AllowlistMatch, FileAccessAllowlist};
use std::collections::HashMap;
use std::sync::Arc;

/// Pip-level reporting switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportingSettings {
    pub fail_unexpected_file_accesses: bool,
    pub monitor_nt_create_file: bool,
    pub distributed_build: bool,
}

impl From<&SandboxConfiguration> for ReportingSettings {
    fn from(config: &SandboxConfiguration) -> Self {
        Self {
            fail_unexpected_file_accesses: config.fail_unexpected_file_accesses,
            monitor_nt_create_file: config.monitor_nt_create_file,
            distributed_build: config.distributed_build,
        }
    }
}

/// A raw access with the executable of the process that performed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributedAccess {
    pub tool_path: String,
    pub access: ReportedFileAccess,
}

/// One logical path access, possibly spread over several raw events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedFileAccess {
    pub path: String,
    pub accesses: Vec<AttributedAccess>,
}

impl ObservedFileAccess {
    /// Group a pip's unexpected accesses by path, in first-seen order.
    pub fn group_unexpected(sets: &AccessSets, table: &PathTable) -> Vec<ObservedFileAccess> {
        let mut observed: Vec<ObservedFileAccess> = Vec::new();
        let mut by_path: HashMap<String, usize> = HashMap::new();
        for access in &sets.unexpected_accesses {
            let tool_path = sets
                .processes
                .get(access.process.get())
                .map(|p| p.path.clone())
                .unwrap_or_default();
            let path = access.effective_path(table);
            let slot = *by_path.entry(path.clone()).or_insert_with(|| {
                observed.push(ObservedFileAccess {
                    path,
                    accesses: Vec::new(),
                });
                observed.len() - 1
            });
            observed[slot].accesses.push(AttributedAccess {
                tool_path,
                access: access.clone(),
            });
        }
        observed
    }
}

/// Per-pip classification state and counters
pub struct FileAccessReportingContext {
    pip: PipIdentity,
    allowlist: Arc<FileAccessAllowlist>,
    settings: ReportingSettings,
    events: Arc<dyn EventSink>,
    violations: Vec<ObservedFileAccess>,
    allowlisted: Vec<(ObservedFileAccess, AllowlistMatch)>,
    num_not_allowlisted: u64,
    num_allowlisted_but_not_cacheable: u64,
    num_allowlisted_and_cacheable: u64,
}

impl FileAccessReportingContext {
    /// Fails when a non-empty allowlist is combined with fail-on-unexpected.
    pub fn new(
        pip: PipIdentity,
        allowlist: Arc<FileAccessAllowlist>,
        settings: ReportingSettings,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        validate_reporting_config(allowlist.len(), settings.fail_unexpected_file_accesses)?;
        Ok(Self {
            pip,
            allowlist,
            settings,
            events,
            violations: Vec::new(),
            allowlisted: Vec::new(),
            num_not_allowlisted: 0,
            num_allowlisted_but_not_cacheable: 0,
            num_allowlisted_and_cacheable: 0,
        })
    }

    /// Pure classification of one access.
    pub fn classify(&self, tool_path: &str, access_path: &str) -> AllowlistMatch {
        if self.allowlist.is_empty() {
            return AllowlistMatch::NoMatch;
        }
        self.allowlist.match_access(tool_path, access_path).0
    }

    fn is_tracked(&self, access: &ReportedFileAccess) -> bool {
        self.settings.monitor_nt_create_file || !access.operation.is_nt_create_file()
    }

    fn match_with_rule(
        &self,
        tool_path: &str,
        access_path: &str,
    ) -> (AllowlistMatch, Option<String>) {
        if self.allowlist.is_empty() {
            return (AllowlistMatch::NoMatch, None);
        }
        let (classification, entry) = self.allowlist.match_access(tool_path, access_path);
        (classification, entry.map(|e| e.name.clone()))
    }

    /// Classify one observed access and account for it.
    ///
    /// The result is the least permissive classification of its events.
    pub fn report_observed_access(&mut self, observed: ObservedFileAccess) -> AllowlistMatch {
        let classified: Vec<(AllowlistMatch, &str, Option<String>)> = observed
            .accesses
            .iter()
            .map(|attributed| {
                let (classification, rule) =
                    self.match_with_rule(&attributed.tool_path, &observed.path);
                (classification, attributed.tool_path.as_str(), rule)
            })
            .collect();
        let aggregate = AllowlistMatch::least_permissive(classified.iter().map(|c| c.0));
        let Some(aggregate) = aggregate else {
            return AllowlistMatch::NoMatch;
        };
        // The first event carrying the aggregate decides tool and rule.
        let (tool, rule) = classified
            .into_iter()
            .find(|(classification, _, _)| *classification == aggregate)
            .map(|(_, tool, rule)| (tool, rule))
            .unwrap_or(("", None));
        let tracked = observed.accesses.iter().any(|a| self.is_tracked(&a.access));

        let operations: Vec<String> = observed
            .accesses
            .iter()
            .map(|a| a.access.operation.to_string())
            .collect();
        let event_template = |kind: SandboxEventKind| {
            let mut event = SandboxEvent::new(kind, &self.pip)
                .with_field("path", &observed.path)
                .with_field("tool", tool)
                .with_field("operations", operations.join(","))
                .with_field("classification", format!("{:?}", aggregate));
            if let Some(rule) = &rule {
                event = event.with_field("rule", rule);
            }
            event
        };

        if !tracked {
            if aggregate == AllowlistMatch::NoMatch {
                let event = event_template(SandboxEventKind::FileAccessViolation)
                    .with_severity(EventSeverity::Warning);
                self.events.emit(&event);
            }
            return aggregate;
        }

        let event = match aggregate {
            AllowlistMatch::NoMatch => event_template(SandboxEventKind::FileAccessViolation),
            AllowlistMatch::MatchesButNotCacheable => {
                let severity = if self.settings.distributed_build {
                    EventSeverity::Error
                } else {
                    EventSeverity::Warning
                };
                event_template(SandboxEventKind::AllowlistedUncacheableAccess)
                    .with_severity(severity)
            }
            AllowlistMatch::MatchesAndCacheable => {
                event_template(SandboxEventKind::AllowlistedCacheableAccess)
            }
        };
        self.events.emit(&event);

        match aggregate {
            AllowlistMatch::NoMatch => {
                self.num_not_allowlisted += 1;
                self.violations.push(observed);
            }
            AllowlistMatch::MatchesButNotCacheable => {
                self.num_allowlisted_but_not_cacheable += 1;
                self.allowlisted.push((observed, aggregate));
            }
            AllowlistMatch::MatchesAndCacheable => {
                self.num_allowlisted_and_cacheable += 1;
                self.allowlisted.push((observed, aggregate));
            }
        }
        aggregate
    }

    /// Classify a single raw access as its own observed access.
    pub fn report_file_access_denied(
        &mut self,
        tool_path: &str,
        access: &ReportedFileAccess,
        table: &PathTable,
    ) -> AllowlistMatch {
        self.report_observed_access(ObservedFileAccess {
            path: access.effective_path(table),
            accesses: vec![AttributedAccess {
                tool_path: tool_path.to_string(),
                access: access.clone(),
            }],
        })
    }

    /// Classify every unexpected access of a finished pip.
    pub fn report_unexpected_accesses(
        &mut self,
        sets: &AccessSets,
        table: &PathTable,
    ) -> Vec<AllowlistMatch> {
        ObservedFileAccess::group_unexpected(sets, table)
            .into_iter()
            .map(|observed| self.report_observed_access(observed))
            .collect()
    }

    pub fn num_file_access_violations_not_allowlisted(&self) -> u64 {
        self.num_not_allowlisted
    }

    pub fn num_file_accesses_allowlisted_but_not_cacheable(&self) -> u64 {
        self.num_allowlisted_but_not_cacheable
    }

    pub fn num_file_accesses_allowlisted_and_cacheable(&self) -> u64 {
        self.num_allowlisted_and_cacheable
    }

    pub fn has_uncacheable_accesses(&self) -> bool {
        self.num_not_allowlisted + self.num_allowlisted_but_not_cacheable > 0
    }

    pub fn violations(&self) -> &[ObservedFileAccess] {
        &self.violations
    }

    pub fn allowlisted_accesses(&self) -> &[(ObservedFileAccess, AllowlistMatch)] {
        &self.allowlisted
    }
}
