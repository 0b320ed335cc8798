//! Length-prefixed binary blobs for request/response exchange with external helpers.
//!
//! Layout: magic `PBX1`, one path-encoding byte, then (path-table-id mode only)
//! the blob's path table, then the record. Integers are little-endian, strings
//! are a u32 length plus UTF-8, options a u8 tag, vectors a u32 count.

use crate::config::types::{PipIdentity, Result, SandboxError};
use crate::core::types::{KillReport, ProcessTimes, SandboxedProcessInfo, SandboxedProcessResult};
use crate::manifest::{AccessManifest, FileAccessPolicy, ManifestNode, PathId};
use crate::report::aggregator::{AccessSets, MessageProcessingFailure, ReportedFileAccess};
use crate::report::process_table::{ProcessIndex, ReportedProcess};
use crate::report::types::{
    FileAccessStatus, FileAccessStatusMethod, IoCounters, ProcessDetouringStatus,
    ProcessResourceCounters, ReportedFileOperation, RequestedAccess,
};
use crate::utils::output::{CapturedOutput, OutputIntegrity};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const BLOB_MAGIC: &[u8; 4] = b"PBX1";

/// How path fields are written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathEncoding {
    /// u32 ids into the path table at the head of the blob
    PathTableId,
    /// Inline strings
    Literal,
}

impl PathEncoding {
    fn tag(self) -> u8 {
        match self {
            PathEncoding::PathTableId => 0,
            PathEncoding::Literal => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(PathEncoding::PathTableId),
            1 => Ok(PathEncoding::Literal),
            other => Err(codec_error(format!("unknown path encoding {}", other))),
        }
    }
}

fn codec_error(message: impl Into<String>) -> SandboxError {
    SandboxError::Codec(message.into())
}

struct BlobWriter {
    mode: PathEncoding,
    body: Vec<u8>,
    paths: Vec<String>,
    path_ids: HashMap<String, u32>,
}

impl BlobWriter {
    fn new(mode: PathEncoding) -> Self {
        Self {
            mode,
            body: Vec::new(),
            paths: Vec::new(),
            path_ids: HashMap::new(),
        }
    }

    fn u8(&mut self, value: u8) {
        self.body.push(value);
    }

    fn bool(&mut self, value: bool) {
        self.u8(u8::from(value));
    }

    fn u16(&mut self, value: u16) {
        self.body.extend_from_slice(&value.to_le_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.body.extend_from_slice(&value.to_le_bytes());
    }

    fn u64(&mut self, value: u64) {
        self.body.extend_from_slice(&value.to_le_bytes());
    }

    fn i32(&mut self, value: i32) {
        self.body.extend_from_slice(&value.to_le_bytes());
    }

    fn i64(&mut self, value: i64) {
        self.body.extend_from_slice(&value.to_le_bytes());
    }

    fn len(&mut self, len: usize) {
        self.u32(len as u32);
    }

    fn string(&mut self, value: &str) {
        self.len(value.len());
        self.body.extend_from_slice(value.as_bytes());
    }

    fn option<T>(&mut self, value: Option<T>, write: impl FnOnce(&mut Self, T)) {
        match value {
            None => self.u8(0),
            Some(v) => {
                self.u8(1);
                write(self, v);
            }
        }
    }

    fn vec<T>(&mut self, items: &[T], mut write: impl FnMut(&mut Self, &T)) {
        self.len(items.len());
        for item in items {
            write(self, item);
        }
    }

    fn duration(&mut self, value: Duration) {
        self.u64(value.as_secs());
        self.u32(value.subsec_nanos());
    }

    fn datetime(&mut self, value: DateTime<Utc>) {
        self.i64(value.timestamp());
        self.u32(value.timestamp_subsec_nanos());
    }

    fn path(&mut self, value: &str) {
        match self.mode {
            PathEncoding::Literal => self.string(value),
            PathEncoding::PathTableId => {
                if value.is_empty() {
                    self.u32(0);
                    return;
                }
                let id = match self.path_ids.get(value) {
                    Some(id) => *id,
                    None => {
                        self.paths.push(value.to_string());
                        let id = self.paths.len() as u32;
                        self.path_ids.insert(value.to_string(), id);
                        id
                    }
                };
                self.u32(id);
            }
        }
    }

    fn path_buf(&mut self, value: &Path) {
        self.path(&value.to_string_lossy());
    }

    fn finish(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 64);
        out.extend_from_slice(BLOB_MAGIC);
        out.push(self.mode.tag());
        if self.mode == PathEncoding::PathTableId {
            out.extend_from_slice(&(self.paths.len() as u32).to_le_bytes());
            for path in &self.paths {
                out.extend_from_slice(&(path.len() as u32).to_le_bytes());
                out.extend_from_slice(path.as_bytes());
            }
        }
        out.extend_from_slice(&self.body);
        out
    }
}

struct BlobReader<'a> {
    data: &'a [u8],
    pos: usize,
    mode: PathEncoding,
    paths: Vec<String>,
}

impl<'a> BlobReader<'a> {
    fn new(data: &'a [u8]) -> Result<Self> {
        if data.len() < 5 || &data[..4] != BLOB_MAGIC {
            return Err(codec_error("missing PBX1 magic"));
        }
        let mut reader = Self {
            data,
            pos: 5,
            mode: PathEncoding::from_tag(data[4])?,
            paths: Vec::new(),
        };
        if reader.mode == PathEncoding::PathTableId {
            let count = reader.len()?;
            for _ in 0..count {
                let path = reader.string()?;
                reader.paths.push(path);
            }
        }
        Ok(reader)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| codec_error(format!("truncated blob at offset {}", self.pos)))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(codec_error(format!("invalid bool byte {}", other))),
        }
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn len(&mut self) -> Result<usize> {
        Ok(self.u32()? as usize)
    }

    fn string(&mut self) -> Result<String> {
        let len = self.len()?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| codec_error(format!("invalid UTF-8: {}", e)))
    }

    fn option<T>(&mut self, read: impl FnOnce(&mut Self) -> Result<T>) -> Result<Option<T>> {
        match self.u8()? {
            0 => Ok(None),
            1 => read(self).map(Some),
            other => Err(codec_error(format!("invalid option tag {}", other))),
        }
    }

    fn vec<T>(&mut self, mut read: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        let count = self.len()?;
        let mut items = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            items.push(read(self)?);
        }
        Ok(items)
    }

    fn duration(&mut self) -> Result<Duration> {
        let secs = self.u64()?;
        let nanos = self.u32()?;
        if nanos >= 1_000_000_000 {
            return Err(codec_error("duration nanoseconds out of range"));
        }
        Ok(Duration::new(secs, nanos))
    }

    fn datetime(&mut self) -> Result<DateTime<Utc>> {
        let secs = self.i64()?;
        let nanos = self.u32()?;
        DateTime::from_timestamp(secs, nanos).ok_or_else(|| codec_error("timestamp out of range"))
    }

    fn path(&mut self) -> Result<String> {
        match self.mode {
            PathEncoding::Literal => self.string(),
            PathEncoding::PathTableId => {
                let id = self.u32()? as usize;
                if id == 0 {
                    return Ok(String::new());
                }
                self.paths
                    .get(id - 1)
                    .cloned()
                    .ok_or_else(|| codec_error(format!("unknown path id {}", id)))
            }
        }
    }

    fn path_buf(&mut self) -> Result<PathBuf> {
        self.path().map(PathBuf::from)
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.data.len() {
            return Err(codec_error(format!(
                "{} trailing bytes after record",
                self.data.len() - self.pos
            )));
        }
        Ok(())
    }
}

fn policy(bits: u16) -> Result<FileAccessPolicy> {
    FileAccessPolicy::from_bits(bits)
        .ok_or_else(|| codec_error(format!("unknown policy bits {:#x}", bits)))
}

fn write_manifest(w: &mut BlobWriter, manifest: &AccessManifest) {
    let paths: Vec<&str> = manifest.path_table().iter().map(|(_, p)| p).collect();
    w.vec(&paths, |w, p| w.path(p));
    w.vec(&manifest.nodes_sorted(), |w, (id, node)| {
        w.u32(id.raw());
        w.u16(node.node_policy.bits());
        w.option(node.cone_policy, |w, cone| w.u16(cone.bits()));
    });
    w.u16(manifest.default_policy.bits());
    w.bool(manifest.report_unexpected_file_accesses);
    w.bool(manifest.report_file_accesses);
    w.bool(manifest.fail_unexpected_file_accesses);
    w.bool(manifest.monitor_child_processes);
}

fn read_manifest(r: &mut BlobReader<'_>) -> Result<AccessManifest> {
    let mut manifest = AccessManifest::new();
    for path in r.vec(|r| r.path())? {
        manifest.path_table_mut().add_path(&path);
    }
    let nodes = r.vec(|r| {
        let id = PathId::from_raw(r.u32()?);
        let node_policy = policy(r.u16()?)?;
        let cone_policy = r.option(|r| policy(r.u16()?))?;
        Ok((id, ManifestNode { node_policy, cone_policy }))
    })?;
    for (id, node) in nodes {
        if manifest.path_table().get(id).is_none() {
            return Err(codec_error(format!("manifest node references unknown {:?}", id)));
        }
        manifest.insert_node(id, node);
    }
    manifest.default_policy = policy(r.u16()?)?;
    manifest.report_unexpected_file_accesses = r.bool()?;
    manifest.report_file_accesses = r.bool()?;
    manifest.fail_unexpected_file_accesses = r.bool()?;
    manifest.monitor_child_processes = r.bool()?;
    Ok(manifest)
}

/// Serialize a request for an external helper.
pub fn encode_request(info: &SandboxedProcessInfo, mode: PathEncoding) -> Vec<u8> {
    let mut w = BlobWriter::new(mode);
    w.u64(info.pip.semi_stable_hash);
    w.string(&info.pip.description);
    w.path_buf(&info.executable);
    w.vec(&info.arguments, |w, a| w.string(a));
    w.path_buf(&info.working_directory);
    w.vec(&info.environment, |w, (k, v)| {
        w.string(k);
        w.string(v);
    });
    write_manifest(&mut w, &info.manifest);
    w.duration(info.timeout);
    w.option(info.warning_timeout, |w, d| w.duration(d));
    w.duration(info.nested_process_termination_timeout);
    w.path_buf(&info.output_directory);
    w.path_buf(&info.scratch_directory);
    w.u64(info.max_output_in_memory_bytes as u64);
    w.bool(info.capture_access_reports);
    w.duration(info.message_count_semaphore_timeout);
    w.finish()
}

pub fn decode_request(data: &[u8]) -> Result<SandboxedProcessInfo> {
    let mut r = BlobReader::new(data)?;
    let hash = r.u64()?;
    let description = r.string()?;
    let mut info = SandboxedProcessInfo::new(PipIdentity::new(hash, description), r.path_buf()?);
    info.arguments = r.vec(|r| r.string())?;
    info.working_directory = r.path_buf()?;
    info.environment = r.vec(|r| Ok((r.string()?, r.string()?)))?;
    info.manifest = Arc::new(read_manifest(&mut r)?);
    info.timeout = r.duration()?;
    info.warning_timeout = r.option(|r| r.duration())?;
    info.nested_process_termination_timeout = r.duration()?;
    info.output_directory = r.path_buf()?;
    info.scratch_directory = r.path_buf()?;
    info.max_output_in_memory_bytes = r.u64()? as usize;
    info.capture_access_reports = r.bool()?;
    info.message_count_semaphore_timeout = r.duration()?;
    r.finish()?;
    Ok(info)
}

fn write_output(w: &mut BlobWriter, output: &CapturedOutput) {
    match output {
        CapturedOutput::InMemory(value) => {
            w.u8(0);
            w.string(value);
        }
        CapturedOutput::File { path, length } => {
            w.u8(1);
            w.path_buf(path);
            w.u64(*length);
        }
    }
}

fn read_output(r: &mut BlobReader<'_>) -> Result<CapturedOutput> {
    match r.u8()? {
        0 => Ok(CapturedOutput::InMemory(r.string()?)),
        1 => Ok(CapturedOutput::File {
            path: r.path_buf()?,
            length: r.u64()?,
        }),
        other => Err(codec_error(format!("unknown output tag {}", other))),
    }
}

fn integrity_tag(integrity: OutputIntegrity) -> u8 {
    match integrity {
        OutputIntegrity::Complete => 0,
        OutputIntegrity::ForcedCompletion => 1,
        OutputIntegrity::ReadError => 2,
        OutputIntegrity::CaptureError => 3,
    }
}

fn read_integrity(r: &mut BlobReader<'_>) -> Result<OutputIntegrity> {
    match r.u8()? {
        0 => Ok(OutputIntegrity::Complete),
        1 => Ok(OutputIntegrity::ForcedCompletion),
        2 => Ok(OutputIntegrity::ReadError),
        3 => Ok(OutputIntegrity::CaptureError),
        other => Err(codec_error(format!("unknown output integrity {}", other))),
    }
}

fn method_tag(method: FileAccessStatusMethod) -> u8 {
    match method {
        FileAccessStatusMethod::PolicyBased => 0,
        FileAccessStatusMethod::FileExistenceBased => 1,
        FileAccessStatusMethod::TrustedTool => 2,
    }
}

fn read_method(r: &mut BlobReader<'_>) -> Result<FileAccessStatusMethod> {
    match r.u8()? {
        0 => Ok(FileAccessStatusMethod::PolicyBased),
        1 => Ok(FileAccessStatusMethod::FileExistenceBased),
        2 => Ok(FileAccessStatusMethod::TrustedTool),
        other => Err(codec_error(format!("unknown status method {}", other))),
    }
}

fn write_access(w: &mut BlobWriter, access: &ReportedFileAccess) {
    w.string(access.operation.as_str());
    w.u64(access.process.get() as u64);
    w.u32(access.process_id);
    w.u32(access.requested_access.bits());
    w.u32(access.status.code());
    w.u8(method_tag(access.method));
    w.bool(access.explicitly_reported);
    w.u32(access.error);
    w.u64(access.usn);
    w.u32(access.desired_access);
    w.u32(access.share_mode);
    w.u32(access.creation_disposition);
    w.u32(access.flags_and_attributes);
    w.u32(access.manifest_path.raw());
    w.path(&access.path);
    w.option(access.enumerate_pattern.as_deref(), |w, p| w.string(p));
    w.bool(access.is_augmented);
}

fn read_access(r: &mut BlobReader<'_>) -> Result<ReportedFileAccess> {
    let name = r.string()?;
    let operation = ReportedFileOperation::from_name(&name)
        .ok_or_else(|| codec_error(format!("unknown operation {}", name)))?;
    let process = ProcessIndex::from_position(r.u64()? as usize);
    let process_id = r.u32()?;
    let bits = r.u32()?;
    let requested_access = RequestedAccess::from_bits(bits)
        .ok_or_else(|| codec_error(format!("unknown access bits {:#x}", bits)))?;
    let code = r.u32()?;
    let status = FileAccessStatus::from_code(code)
        .ok_or_else(|| codec_error(format!("unknown status {}", code)))?;
    Ok(ReportedFileAccess {
        operation,
        process,
        process_id,
        requested_access,
        status,
        method: read_method(r)?,
        explicitly_reported: r.bool()?,
        error: r.u32()?,
        usn: r.u64()?,
        desired_access: r.u32()?,
        share_mode: r.u32()?,
        creation_disposition: r.u32()?,
        flags_and_attributes: r.u32()?,
        manifest_path: PathId::from_raw(r.u32()?),
        path: Arc::from(r.path()?),
        enumerate_pattern: r.option(|r| r.string())?,
        is_augmented: r.bool()?,
    })
}

fn write_process(w: &mut BlobWriter, process: &ReportedProcess) {
    w.u32(process.process_id);
    w.path(&process.path);
    w.string(&process.command_line);
    w.u32(process.parent_process_id);
    w.option(process.creation_time, |w, t| w.datetime(t));
    w.option(process.exit_time, |w, t| w.datetime(t));
    w.duration(process.kernel_time);
    w.duration(process.user_time);
    w.option(process.exit_code, |w, c| w.u32(c));
    let io = &process.io;
    for value in [
        io.read_operation_count,
        io.write_operation_count,
        io.other_operation_count,
        io.read_transfer_count,
        io.write_transfer_count,
        io.other_transfer_count,
    ] {
        w.u64(value);
    }
    let res = &process.resources;
    w.u64(res.peak_working_set);
    w.u64(res.peak_virtual_size);
    w.u64(res.peak_pagefile_usage);
    w.u32(res.thread_count);
    w.u32(res.handle_count);
    w.u64(res.job_id);
    w.bool(process.is_placeholder);
}

fn read_process(r: &mut BlobReader<'_>) -> Result<ReportedProcess> {
    let process_id = r.u32()?;
    let path = r.path()?;
    let command_line = r.string()?;
    let mut process = ReportedProcess::new(process_id, path, command_line);
    process.parent_process_id = r.u32()?;
    process.creation_time = r.option(|r| r.datetime())?;
    process.exit_time = r.option(|r| r.datetime())?;
    process.kernel_time = r.duration()?;
    process.user_time = r.duration()?;
    process.exit_code = r.option(|r| r.u32())?;
    process.io = IoCounters {
        read_operation_count: r.u64()?,
        write_operation_count: r.u64()?,
        other_operation_count: r.u64()?,
        read_transfer_count: r.u64()?,
        write_transfer_count: r.u64()?,
        other_transfer_count: r.u64()?,
    };
    process.resources = ProcessResourceCounters {
        peak_working_set: r.u64()?,
        peak_virtual_size: r.u64()?,
        peak_pagefile_usage: r.u64()?,
        thread_count: r.u32()?,
        handle_count: r.u32()?,
        job_id: r.u64()?,
    };
    process.is_placeholder = r.bool()?;
    Ok(process)
}

fn write_detouring_status(w: &mut BlobWriter, status: &ProcessDetouringStatus) {
    w.u64(status.process_id);
    w.u32(status.report_status);
    w.string(&status.process_name);
    w.path(&status.start_application_name);
    w.bool(status.needs_injection);
    w.bool(status.is_current_64_bit_process);
    w.bool(status.is_process_64_bit);
    w.bool(status.disable_detours);
    w.u32(status.creation_flags);
    w.bool(status.detoured);
    w.u32(status.error);
    w.string(&status.command_line);
}

fn read_detouring_status(r: &mut BlobReader<'_>) -> Result<ProcessDetouringStatus> {
    Ok(ProcessDetouringStatus {
        process_id: r.u64()?,
        report_status: r.u32()?,
        process_name: r.string()?,
        start_application_name: r.path()?,
        needs_injection: r.bool()?,
        is_current_64_bit_process: r.bool()?,
        is_process_64_bit: r.bool()?,
        disable_detours: r.bool()?,
        creation_flags: r.u32()?,
        detoured: r.bool()?,
        error: r.u32()?,
        command_line: r.string()?,
    })
}

fn write_access_sets(w: &mut BlobWriter, sets: &AccessSets) {
    w.vec(&sets.all_accesses, write_access);
    w.vec(&sets.unexpected_accesses, write_access);
    w.vec(&sets.explicitly_reported_accesses, write_access);
    w.vec(&sets.processes, write_process);
    w.vec(&sets.detouring_statuses, write_detouring_status);
    w.bool(sets.has_read_write_to_read_file_access_request);
    w.bool(sets.process_tree_completed);
    w.u64(sets.ignored_pathless_accesses);
    w.option(sets.message_processing_failure.as_ref(), |w, f| {
        w.string(&f.reason);
        w.string(&f.raw_line);
    });
}

fn read_access_sets(r: &mut BlobReader<'_>) -> Result<AccessSets> {
    Ok(AccessSets {
        all_accesses: r.vec(read_access)?,
        unexpected_accesses: r.vec(read_access)?,
        explicitly_reported_accesses: r.vec(read_access)?,
        processes: r.vec(read_process)?,
        detouring_statuses: r.vec(read_detouring_status)?,
        has_read_write_to_read_file_access_request: r.bool()?,
        process_tree_completed: r.bool()?,
        ignored_pathless_accesses: r.u64()?,
        message_processing_failure: r.option(|r| {
            Ok(MessageProcessingFailure {
                reason: r.string()?,
                raw_line: r.string()?,
            })
        })?,
    })
}

fn write_times(w: &mut BlobWriter, times: &ProcessTimes) {
    w.option(times.start_time, |w, t| w.datetime(t));
    w.option(times.exit_time, |w, t| w.datetime(t));
    w.duration(times.wall_clock);
    w.duration(times.user_time);
    w.duration(times.kernel_time);
}

fn read_times(r: &mut BlobReader<'_>) -> Result<ProcessTimes> {
    Ok(ProcessTimes {
        start_time: r.option(|r| r.datetime())?,
        exit_time: r.option(|r| r.datetime())?,
        wall_clock: r.duration()?,
        user_time: r.duration()?,
        kernel_time: r.duration()?,
    })
}

fn write_kill_report(w: &mut BlobWriter, report: &KillReport) {
    w.bool(report.kill_sent);
    w.vec(&report.descendants_killed, |w, pid| w.u32(*pid));
    w.bool(report.dump_attempted);
    w.u64(report.waited_ms);
    w.vec(&report.notes, |w, n| w.string(n));
}

fn read_kill_report(r: &mut BlobReader<'_>) -> Result<KillReport> {
    Ok(KillReport {
        kill_sent: r.bool()?,
        descendants_killed: r.vec(|r| r.u32())?,
        dump_attempted: r.bool()?,
        waited_ms: r.u64()?,
        notes: r.vec(|r| r.string())?,
    })
}

/// Serialize a helper's response.
pub fn encode_result(result: &SandboxedProcessResult, mode: PathEncoding) -> Vec<u8> {
    let mut w = BlobWriter::new(mode);
    w.i32(result.exit_code);
    w.bool(result.killed);
    w.bool(result.timed_out);
    write_output(&mut w, &result.stdout);
    write_output(&mut w, &result.stderr);
    w.u8(integrity_tag(result.stdout_integrity));
    w.u8(integrity_tag(result.stderr_integrity));
    write_access_sets(&mut w, &result.access_sets);
    w.vec(&result.processes, write_process);
    w.vec(&result.surviving_child_processes, write_process);
    write_times(&mut w, &result.primary_process_times);
    w.option(result.dump_directory.as_deref(), |w, p| w.path_buf(p));
    w.option(result.dump_creation_error.as_deref(), |w, e| w.string(e));
    w.option(result.kill_report.as_ref(), write_kill_report);
    w.finish()
}

pub fn decode_result(data: &[u8]) -> Result<SandboxedProcessResult> {
    let mut r = BlobReader::new(data)?;
    let result = SandboxedProcessResult {
        exit_code: r.i32()?,
        killed: r.bool()?,
        timed_out: r.bool()?,
        stdout: read_output(&mut r)?,
        stderr: read_output(&mut r)?,
        stdout_integrity: read_integrity(&mut r)?,
        stderr_integrity: read_integrity(&mut r)?,
        access_sets: read_access_sets(&mut r)?,
        processes: r.vec(read_process)?,
        surviving_child_processes: r.vec(read_process)?,
        primary_process_times: read_times(&mut r)?,
        dump_directory: r.option(|r| r.path_buf())?,
        dump_creation_error: r.option(|r| r.string())?,
        kill_report: r.option(read_kill_report)?,
    };
    r.finish()?;
    Ok(result)
}

pub fn save_request(path: &Path, info: &SandboxedProcessInfo, mode: PathEncoding) -> Result<()> {
    std::fs::write(path, encode_request(info, mode))?;
    Ok(())
}

pub fn load_request(path: &Path) -> Result<SandboxedProcessInfo> {
    decode_request(&std::fs::read(path)?)
}

pub fn save_result(path: &Path, result: &SandboxedProcessResult, mode: PathEncoding) -> Result<()> {
    std::fs::write(path, encode_result(result, mode))?;
    Ok(())
}

pub fn load_result(path: &Path) -> Result<SandboxedProcessResult> {
    decode_result(&std::fs::read(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_info() -> SandboxedProcessInfo {
        let mut manifest = AccessManifest::new();
        manifest.add_scope("/src", FileAccessPolicy::ALLOW_READ);
        manifest.add_path(
            "/out/a.o",
            FileAccessPolicy::ALLOW_WRITE | FileAccessPolicy::REPORT_ACCESS,
        );
        manifest.report_file_accesses = true;

        let mut info = SandboxedProcessInfo::new(PipIdentity::new(0xfeed, "cc a.c"), "/usr/bin/cc")
            .with_arguments(["-c", "/src/a.c", "-o", "/out/a.o"])
            .with_env("PATH", "/usr/bin")
            .with_env("LANG", "C")
            .with_manifest(Arc::new(manifest))
            .with_timeout(Duration::from_millis(1500));
        info.working_directory = PathBuf::from("/src");
        info.output_directory = PathBuf::from("/out/logs/");
        info.scratch_directory = PathBuf::from("/src");
        info.warning_timeout = None;
        info.capture_access_reports = true;
        info.message_count_semaphore_timeout = Duration::from_millis(2500);
        info
    }

    fn sample_result() -> SandboxedProcessResult {
        let mut process = ReportedProcess::new(42, "/usr/bin/cc", "cc -c a.c");
        process.creation_time = DateTime::from_timestamp(1_700_000_000, 123_456_700);
        process.exit_code = Some(0);
        process.io.read_transfer_count = 4096;

        let access = ReportedFileAccess {
            operation: ReportedFileOperation::CreateFile,
            process: ProcessIndex::from_position(0),
            process_id: 42,
            requested_access: RequestedAccess::READ | RequestedAccess::PROBE,
            status: FileAccessStatus::Denied,
            method: FileAccessStatusMethod::FileExistenceBased,
            explicitly_reported: false,
            error: 5,
            usn: 9,
            desired_access: 0x80000000,
            share_mode: 1,
            creation_disposition: 3,
            flags_and_attributes: 0x80,
            manifest_path: PathId::from_raw(2),
            path: Arc::from("/src/a.c"),
            enumerate_pattern: Some("*.h".to_string()),
            is_augmented: false,
        };

        SandboxedProcessResult {
            exit_code: 27,
            killed: true,
            timed_out: true,
            stdout: CapturedOutput::InMemory("out\n".to_string()),
            stderr: CapturedOutput::File {
                path: PathBuf::from("/out/logs/Pip.stderr.txt"),
                length: 100,
            },
            stdout_integrity: OutputIntegrity::Complete,
            stderr_integrity: OutputIntegrity::ForcedCompletion,
            access_sets: AccessSets {
                all_accesses: vec![access.clone()],
                unexpected_accesses: vec![access],
                processes: vec![process.clone()],
                ignored_pathless_accesses: 2,
                message_processing_failure: Some(MessageProcessingFailure {
                    reason: "missing comma".to_string(),
                    raw_line: "garbage".to_string(),
                }),
                ..AccessSets::default()
            },
            processes: vec![process],
            surviving_child_processes: Vec::new(),
            primary_process_times: ProcessTimes {
                wall_clock: Duration::from_millis(51),
                ..ProcessTimes::default()
            },
            dump_directory: Some(PathBuf::from("/out/logs/dumps")),
            dump_creation_error: None,
            kill_report: Some(KillReport {
                kill_sent: true,
                descendants_killed: vec![43],
                dump_attempted: true,
                waited_ms: 3,
                notes: vec!["note".to_string()],
            }),
        }
    }

    #[test]
    fn request_round_trips_in_both_path_modes() {
        let info = sample_info();
        for mode in [PathEncoding::PathTableId, PathEncoding::Literal] {
            let blob = encode_request(&info, mode);
            assert_eq!(&blob[..4], BLOB_MAGIC);
            assert_eq!(decode_request(&blob).unwrap(), info);
        }
    }

    #[test]
    fn result_round_trips_in_both_path_modes() {
        let result = sample_result();
        for mode in [PathEncoding::PathTableId, PathEncoding::Literal] {
            assert_eq!(decode_result(&encode_result(&result, mode)).unwrap(), result);
        }
    }

    #[test]
    fn path_table_mode_stores_repeated_paths_once() {
        let info = sample_info();
        let table = encode_request(&info, PathEncoding::PathTableId);
        let literal = encode_request(&info, PathEncoding::Literal);
        assert_eq!(table[4], 0);
        assert_eq!(literal[4], 1);
        let occurrences = table.windows(4).filter(|w| *w == b"/src").count();
        // manifest entry, working directory and scratch directory share one table slot
        assert!(occurrences < literal.windows(4).filter(|w| *w == b"/src").count());
    }

    #[test]
    fn corrupt_blobs_are_codec_errors() {
        let blob = encode_result(&sample_result(), PathEncoding::PathTableId);
        assert!(matches!(decode_result(b"XXXX\x00"), Err(SandboxError::Codec(_))));
        assert!(matches!(decode_result(&blob[..blob.len() - 1]), Err(SandboxError::Codec(_))));

        let mut trailing = blob.clone();
        trailing.push(0);
        assert!(matches!(decode_result(&trailing), Err(SandboxError::Codec(_))));

        let mut bad_mode = blob;
        bad_mode[4] = 7;
        assert!(matches!(decode_result(&bad_mode), Err(SandboxError::Codec(_))));
    }

    #[test]
    fn files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("request.bin");
        save_request(&path, &sample_info(), PathEncoding::Literal).unwrap();
        assert_eq!(load_request(&path).unwrap(), sample_info());
    }
}
