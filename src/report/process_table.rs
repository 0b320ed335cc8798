//! Arena of reported processes with active and exited pid indexes.
//!
//! Pids recycle within one pip, so the storage vector (in arrival order)
//! is the authoritative process list; the two maps only point into it.

use crate::report::types::{
    ticks_to_duration, IoCounters, ProcessDataReport, ProcessResourceCounters,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Position of a process in the arena
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessIndex(usize);

impl ProcessIndex {
    pub(crate) const fn from_position(position: usize) -> Self {
        ProcessIndex(position)
    }

    pub fn get(self) -> usize {
        self.0
    }
}

/// One process instance observed in the pip's process tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedProcess {
    pub process_id: u32,
    pub path: String,
    pub command_line: String,
    pub parent_process_id: u32,
    pub creation_time: Option<DateTime<Utc>>,
    pub exit_time: Option<DateTime<Utc>>,
    pub kernel_time: Duration,
    pub user_time: Duration,
    pub exit_code: Option<u32>,
    pub io: IoCounters,
    pub resources: ProcessResourceCounters,
    /// Fabricated for an access whose pid never announced itself
    pub is_placeholder: bool,
}

impl ReportedProcess {
    pub fn new(process_id: u32, path: impl Into<String>, command_line: impl Into<String>) -> Self {
        Self {
            process_id,
            path: path.into(),
            command_line: command_line.into(),
            parent_process_id: 0,
            creation_time: None,
            exit_time: None,
            kernel_time: Duration::ZERO,
            user_time: Duration::ZERO,
            exit_code: None,
            io: IoCounters::default(),
            resources: ProcessResourceCounters::default(),
            is_placeholder: false,
        }
    }

    fn placeholder(process_id: u32) -> Self {
        Self {
            is_placeholder: true,
            ..Self::new(process_id, String::new(), String::new())
        }
    }

    /// Overwrite accounting with a process-data record.
    pub fn apply_process_data(&mut self, data: &ProcessDataReport) {
        if self.path.is_empty() {
            self.path = data.path.clone();
        }
        self.parent_process_id = data.parent_process_id;
        self.creation_time = data.creation_time;
        self.exit_time = data.exit_time;
        self.kernel_time = ticks_to_duration(data.kernel_time_ticks);
        self.user_time = ticks_to_duration(data.user_time_ticks);
        self.exit_code = Some(data.exit_code);
        self.io = data.io;
        self.resources = data.resources;
    }
}

/// Single-writer process tables.
#[derive(Debug, Default)]
pub struct ProcessTable {
    storage: Vec<ReportedProcess>,
    active: HashMap<u32, ProcessIndex>,
    exited: HashMap<u32, ProcessIndex>,
    placeholders: HashMap<u32, ProcessIndex>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, process: ReportedProcess) -> ProcessIndex {
        let index = ProcessIndex(self.storage.len());
        self.storage.push(process);
        index
    }

    /// Record a process start. A pid already active is shadowed by the new instance.
    pub fn start(&mut self, process: ReportedProcess) -> ProcessIndex {
        let pid = process.process_id;
        let index = self.push(process);
        if let Some(previous) = self.active.insert(pid, index) {
            log::debug!(
                "pid {} started again without an exit; shadowing arena entry {}",
                pid,
                previous.0
            );
        }
        index
    }

    /// Move `pid` from the active to the exited table.
    ///
    /// Returns `None` (and changes nothing) when no active entry exists,
    /// since exit and start records are not ordered on every platform.
    pub fn exit(&mut self, pid: u32) -> Option<ProcessIndex> {
        let index = self.active.remove(&pid)?;
        self.exited.insert(pid, index);
        Some(index)
    }

    /// Active then exited entry for `pid`, without fabricating anything.
    pub fn lookup(&self, pid: u32) -> Option<ProcessIndex> {
        self.active
            .get(&pid)
            .or_else(|| self.exited.get(&pid))
            .copied()
    }

    /// Like [`lookup`](Self::lookup) but never fails: unknown pids get a
    /// placeholder, shared by every later access from the same pid.
    pub fn resolve(&mut self, pid: u32) -> ProcessIndex {
        if let Some(index) = self.lookup(pid) {
            return index;
        }
        if let Some(index) = self.placeholders.get(&pid) {
            return *index;
        }
        let index = self.push(ReportedProcess::placeholder(pid));
        self.placeholders.insert(pid, index);
        index
    }

    pub fn get(&self, index: ProcessIndex) -> &ReportedProcess {
        &self.storage[index.0]
    }

    pub fn get_mut(&mut self, index: ProcessIndex) -> &mut ReportedProcess {
        &mut self.storage[index.0]
    }

    pub fn is_exited(&self, index: ProcessIndex) -> bool {
        self.exited.values().any(|i| *i == index)
    }

    /// Every entry in arrival order, placeholders included.
    pub fn all(&self) -> &[ReportedProcess] {
        &self.storage
    }

    /// Announced processes in arrival order, placeholders excluded.
    pub fn processes(&self) -> impl Iterator<Item = &ReportedProcess> {
        self.storage.iter().filter(|p| !p.is_placeholder)
    }

    /// Processes started and not yet exited.
    pub fn active_processes(&self) -> Vec<&ReportedProcess> {
        let mut indices: Vec<ProcessIndex> = self
            .active
            .values()
            .filter(|index| !self.is_exited(**index))
            .copied()
            .collect();
        indices.sort();
        indices.into_iter().map(|i| self.get(i)).collect()
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }
}
