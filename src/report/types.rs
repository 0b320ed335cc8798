//! Structured records decoded from the access-report wire protocol.

use crate::manifest::PathId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Leading discriminator of every wire line
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportType {
    None = 0,
    FileAccess = 1,
    WindowsCall = 2,
    DebugMessage = 3,
    ProcessData = 4,
    ProcessDetouringStatus = 5,
    AugmentedFileAccess = 6,
    Max = 7,
}

impl ReportType {
    /// Decode a code strictly inside `(None, Max)`.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(ReportType::FileAccess),
            2 => Some(ReportType::WindowsCall),
            3 => Some(ReportType::DebugMessage),
            4 => Some(ReportType::ProcessData),
            5 => Some(ReportType::ProcessDetouringStatus),
            6 => Some(ReportType::AugmentedFileAccess),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }
}

macro_rules! reported_operations {
    ($( $variant:ident ),+ $(,)?) => {
        /// Operation performed by the monitored process, as named on the wire
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum ReportedFileOperation {
            $( $variant, )+
        }

        impl ReportedFileOperation {
            pub const ALL: &'static [ReportedFileOperation] = &[
                $( ReportedFileOperation::$variant, )+
            ];

            pub fn as_str(self) -> &'static str {
                match self {
                    $( ReportedFileOperation::$variant => stringify!($variant), )+
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $( stringify!($variant) => Some(ReportedFileOperation::$variant), )+
                    _ => None,
                }
            }
        }
    };
}

reported_operations! {
    Unknown,
    CreateFile,
    CreateDirectory,
    RemoveDirectory,
    DeleteFile,
    GetFileAttributes,
    GetFileAttributesEx,
    FindFirstFileEx,
    FindNextFile,
    Process,
    ProcessExit,
    ProcessRequiresPTrace,
    ProcessBreakaway,
    ProcessTreeCompletedAck,
    NtCreateFile,
    ZwCreateFile,
    ZwOpenFile,
    NtQueryDirectoryFile,
    ZwQueryDirectoryFile,
    CopyFileSource,
    CopyFileDestination,
    CreateHardLinkSource,
    CreateHardLinkDestination,
    CreateSymbolicLinkSource,
    MoveFileSource,
    MoveFileDestination,
    MoveFileWithProgressSource,
    MoveFileWithProgressDest,
    SetFileInformationByHandleSource,
    SetFileInformationByHandleDest,
    ZwSetRenameInformationFileSource,
    ZwSetRenameInformationFileDest,
    ZwSetLinkInformationFile,
    ZwSetDispositionInformationFile,
    ZwSetModeInformationFile,
    ZwSetFileNameInformationFileSource,
    ZwSetFileNameInformationFileDest,
    ReparsePointTarget,
    ChangedReadWriteToReadAccess,
    FirstAllowWriteCheckInProcess,
    MultipleOperations,
    OpenDirectory,
    ReadFile,
    WriteFile,
    Readlink,
    Probe,
    Lookup,
    Stat,
    Exec,
    Fork,
    Close,
    CloseModified,
    RenameSource,
    RenameDestination,
    LinkSource,
    LinkDestination,
    Unlink,
    Truncate,
    Chmod,
    Chown,
}

impl ReportedFileOperation {
    /// Operations excluded from violation lists unless explicitly monitored
    pub fn is_nt_create_file(self) -> bool {
        matches!(
            self,
            ReportedFileOperation::NtCreateFile | ReportedFileOperation::ZwCreateFile
        )
    }

    /// Directory enumeration variants
    pub fn is_enumeration(self) -> bool {
        matches!(
            self,
            ReportedFileOperation::FindFirstFileEx
                | ReportedFileOperation::FindNextFile
                | ReportedFileOperation::NtQueryDirectoryFile
                | ReportedFileOperation::ZwQueryDirectoryFile
                | ReportedFileOperation::OpenDirectory
        )
    }
}

impl fmt::Display for ReportedFileOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

crate::flag_set! {
    /// Access requested by the monitored process
    pub struct RequestedAccess: u32 {
        const READ = 0x01;
        const WRITE = 0x02;
        const PROBE = 0x04;
        const ENUMERATE = 0x08;
        const ENUMERATION_PROBE = 0x10;
    }
}

/// Policy decision made by the native layer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileAccessStatus {
    Allowed,
    Denied,
    /// Policy lookup itself failed; only reported on denial paths
    CannotDeterminePolicy,
}

impl FileAccessStatus {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(FileAccessStatus::Allowed),
            1 => Some(FileAccessStatus::Denied),
            2 => Some(FileAccessStatus::CannotDeterminePolicy),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            FileAccessStatus::Allowed => 0,
            FileAccessStatus::Denied => 1,
            FileAccessStatus::CannotDeterminePolicy => 2,
        }
    }

    /// Denied or indeterminate accesses are unexpected
    pub fn is_unexpected(self) -> bool {
        !matches!(self, FileAccessStatus::Allowed)
    }
}

/// Why an access ended up with its status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileAccessStatusMethod {
    PolicyBased,
    FileExistenceBased,
    TrustedTool,
}

/// One decoded file-access record (plain or augmented)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileAccessReport {
    pub operation: ReportedFileOperation,
    pub process_id: u32,
    pub requested_access: RequestedAccess,
    pub status: FileAccessStatus,
    pub explicitly_reported: bool,
    pub error: u32,
    pub usn: u64,
    pub desired_access: u32,
    pub share_mode: u32,
    pub creation_disposition: u32,
    pub flags_and_attributes: u32,
    /// Policy path the native layer matched; `INVALID` when none
    pub manifest_path: PathId,
    /// Literal path string; may be empty when `manifest_path` is set
    pub path: String,
    pub enumerate_pattern: Option<String>,
    /// Only present for `Process`
    pub command_line: Option<String>,
    /// Reported by a trusted tool rather than the instrumentation layer
    pub is_augmented: bool,
}

impl FileAccessReport {
    /// A minimal allowed read by `process_id` of `path`; mostly for producers and tests.
    pub fn new(operation: ReportedFileOperation, process_id: u32, path: impl Into<String>) -> Self {
        Self {
            operation,
            process_id,
            requested_access: RequestedAccess::READ,
            status: FileAccessStatus::Allowed,
            explicitly_reported: false,
            error: 0,
            usn: 0,
            desired_access: 0,
            share_mode: 0,
            creation_disposition: 0,
            flags_and_attributes: 0,
            manifest_path: PathId::INVALID,
            path: path.into(),
            enumerate_pattern: None,
            command_line: None,
            is_augmented: false,
        }
    }

    pub fn with_access(mut self, access: RequestedAccess, status: FileAccessStatus) -> Self {
        self.requested_access = access;
        self.status = status;
        self
    }

    pub fn with_manifest_path(mut self, id: PathId) -> Self {
        self.manifest_path = id;
        self
    }

    pub fn with_command_line(mut self, command_line: impl Into<String>) -> Self {
        self.command_line = Some(command_line.into());
        self
    }

    pub fn explicitly_reported(mut self) -> Self {
        self.explicitly_reported = true;
        self
    }
}

/// IO accounting of one process
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoCounters {
    pub read_operation_count: u64,
    pub write_operation_count: u64,
    pub other_operation_count: u64,
    pub read_transfer_count: u64,
    pub write_transfer_count: u64,
    pub other_transfer_count: u64,
}

/// Memory and handle accounting of one process
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessResourceCounters {
    pub peak_working_set: u64,
    pub peak_virtual_size: u64,
    pub peak_pagefile_usage: u64,
    pub thread_count: u32,
    pub handle_count: u32,
    pub job_id: u64,
}

/// Accounting record sent when a process in the tree finishes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessDataReport {
    pub path: String,
    pub process_id: u32,
    pub parent_process_id: u32,
    pub creation_time: Option<DateTime<Utc>>,
    pub exit_time: Option<DateTime<Utc>>,
    /// 100ns ticks
    pub kernel_time_ticks: u64,
    /// 100ns ticks
    pub user_time_ticks: u64,
    pub exit_code: u32,
    pub io: IoCounters,
    pub resources: ProcessResourceCounters,
}

/// Whether the instrumentation layer managed to attach to a child process
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDetouringStatus {
    pub process_id: u64,
    pub report_status: u32,
    pub process_name: String,
    pub start_application_name: String,
    pub needs_injection: bool,
    pub is_current_64_bit_process: bool,
    pub is_process_64_bit: bool,
    pub disable_detours: bool,
    pub creation_flags: u32,
    pub detoured: bool,
    pub error: u32,
    pub command_line: String,
}

/// Outcome of parsing one wire line
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParsedReport {
    FileAccess(FileAccessReport),
    ProcessData(ProcessDataReport),
    DetouringStatus(ProcessDetouringStatus),
    DebugMessage(String),
    /// Platform marker that this side never supports
    WindowsCall(String),
    /// Well-formed access with neither a literal nor a policy path
    Ignored,
}

const FILETIME_UNIX_EPOCH_TICKS: i64 = 116_444_736_000_000_000;
const TICKS_PER_SECOND: i64 = 10_000_000;

/// Recombine two 32-bit halves into one 64-bit value.
pub fn combine_halves(high: u32, low: u32) -> u64 {
    (u64::from(high) << 32) | u64::from(low)
}

pub fn split_halves(value: u64) -> (u32, u32) {
    ((value >> 32) as u32, value as u32)
}

/// FILETIME (100ns ticks since 1601-01-01) to UTC; zero means "not set".
/// Tick counts beyond `i64` are unrepresentable and read as not set.
pub fn filetime_to_utc(ticks: u64) -> Option<DateTime<Utc>> {
    if ticks == 0 {
        return None;
    }
    let since_unix = i64::try_from(ticks).ok()?.checked_sub(FILETIME_UNIX_EPOCH_TICKS)?;
    let secs = since_unix.div_euclid(TICKS_PER_SECOND);
    let nanos = since_unix.rem_euclid(TICKS_PER_SECOND) as u32 * 100;
    DateTime::from_timestamp(secs, nanos)
}

pub fn utc_to_filetime(time: Option<DateTime<Utc>>) -> u64 {
    match time {
        None => 0,
        Some(t) => {
            let ticks = t
                .timestamp()
                .checked_mul(TICKS_PER_SECOND)
                .and_then(|ticks| ticks.checked_add(i64::from(t.timestamp_subsec_nanos() / 100)))
                .and_then(|ticks| ticks.checked_add(FILETIME_UNIX_EPOCH_TICKS))
                .unwrap_or(i64::MAX);
            ticks.max(0) as u64
        }
    }
}

pub fn ticks_to_duration(ticks: u64) -> Duration {
    Duration::from_nanos(ticks.saturating_mul(100))
}

pub fn duration_to_ticks(duration: Duration) -> u64 {
    (duration.as_nanos() / 100) as u64
}
