//! Access-report wire parser.
//!
//! A line is `<reportType>,<payload>` where the payload is `|`-delimited.
//! Parsing is stateless: every malformed input yields `SandboxError::Parse`
//! carrying the raw line, never a panic.

use crate::config::types::{Result, SandboxError};
use crate::manifest::PathId;
use crate::report::types::*;

pub const FIELD_DELIMITER: char = '|';
const OPERATION_SEPARATOR: char = ':';

/// Integer fields preceding the literal path of a file-access record
const FILE_ACCESS_INTEGER_FIELDS: usize = 11;
/// Integers + path + enumeration pattern
const FILE_ACCESS_MIN_FIELDS: usize = FILE_ACCESS_INTEGER_FIELDS + 2;
const PROCESS_DATA_FIELDS: usize = 24;
const DETOURING_STATUS_MIN_FIELDS: usize = 12;
const DETOURING_COMMAND_LINE_INDEX: usize = 11;

pub struct AccessReportParser;

impl AccessReportParser {
    /// Parse one raw line into a structured report.
    pub fn parse(raw: &str) -> Result<ParsedReport> {
        let line = raw.trim_end_matches(['\r', '\n']);
        let (type_digits, payload) = line
            .split_once(',')
            .ok_or_else(|| SandboxError::parse("missing report type separator", raw))?;

        let code: u32 = type_digits
            .trim()
            .parse()
            .map_err(|_| SandboxError::parse("report type is not a number", raw))?;
        let report_type = ReportType::from_code(code)
            .ok_or_else(|| SandboxError::parse(format!("report type {code} out of range"), raw))?;

        match report_type {
            ReportType::FileAccess => Self::parse_file_access(payload, raw, false),
            ReportType::AugmentedFileAccess => Self::parse_file_access(payload, raw, true),
            ReportType::ProcessData => {
                Self::parse_process_data(payload, raw).map(ParsedReport::ProcessData)
            }
            ReportType::ProcessDetouringStatus => {
                Self::parse_detouring_status(payload, raw).map(ParsedReport::DetouringStatus)
            }
            ReportType::DebugMessage => Ok(ParsedReport::DebugMessage(payload.to_string())),
            ReportType::WindowsCall => Ok(ParsedReport::WindowsCall(payload.to_string())),
            ReportType::None | ReportType::Max => {
                Err(SandboxError::parse("sentinel report type", raw))
            }
        }
    }

    fn parse_file_access(payload: &str, raw: &str, is_augmented: bool) -> Result<ParsedReport> {
        let fields: Vec<&str> = payload.split(FIELD_DELIMITER).collect();
        if fields.len() < FILE_ACCESS_MIN_FIELDS {
            return Err(SandboxError::parse(
                format!(
                    "file access has {} fields, expected at least {}",
                    fields.len(),
                    FILE_ACCESS_MIN_FIELDS
                ),
                raw,
            ));
        }

        let (operation, pid_field) = match fields[0].split_once(OPERATION_SEPARATOR) {
            Some((name, pid)) => {
                let op = ReportedFileOperation::from_name(name).ok_or_else(|| {
                    SandboxError::parse(format!("unknown operation '{name}'"), raw)
                })?;
                (op, pid)
            }
            None => (ReportedFileOperation::Unknown, fields[0]),
        };

        let process_id = hex_u32(pid_field, "process id", raw)?;
        let requested_bits = hex_u32(fields[1], "requested access", raw)?;
        let requested_access = RequestedAccess::from_bits(requested_bits).ok_or_else(|| {
            let message = format!("requested access {requested_bits:#x} has unknown bits");
            SandboxError::parse(message, raw)
        })?;
        let status_code = hex_u32(fields[2], "status", raw)?;
        let status = FileAccessStatus::from_code(status_code)
            .ok_or_else(|| SandboxError::parse(format!("unknown status {status_code}"), raw))?;
        let explicitly_reported = hex_u32(fields[3], "explicitly reported", raw)? != 0;
        let error = hex_u32(fields[4], "error", raw)?;
        let usn = hex_u64(fields[5], "usn", raw)?;
        let desired_access = hex_u32(fields[6], "desired access", raw)?;
        let share_mode = hex_u32(fields[7], "share mode", raw)?;
        let creation_disposition = hex_u32(fields[8], "creation disposition", raw)?;
        let flags_and_attributes = hex_u32(fields[9], "flags and attributes", raw)?;
        let manifest_path = PathId::from_raw(hex_u32(fields[10], "manifest path id", raw)?);

        let path = fields[FILE_ACCESS_INTEGER_FIELDS].to_string();
        let pattern = fields[FILE_ACCESS_INTEGER_FIELDS + 1];
        let enumerate_pattern = (!pattern.is_empty()).then(|| pattern.to_string());

        let command_line = if operation == ReportedFileOperation::Process {
            let rest = &fields[FILE_ACCESS_MIN_FIELDS..];
            Some(rest.join(&FIELD_DELIMITER.to_string()))
        } else if fields.len() > FILE_ACCESS_MIN_FIELDS {
            return Err(SandboxError::parse(
                format!("unexpected trailing fields for {operation}"),
                raw,
            ));
        } else {
            None
        };

        // Trusted tools never carry a resolved manifest path; the aggregator re-derives it.
        let manifest_path = if is_augmented { PathId::INVALID } else { manifest_path };

        if path.is_empty() && !manifest_path.is_valid() {
            return Ok(ParsedReport::Ignored);
        }

        Ok(ParsedReport::FileAccess(FileAccessReport {
            operation,
            process_id,
            requested_access,
            status,
            explicitly_reported,
            error,
            usn,
            desired_access,
            share_mode,
            creation_disposition,
            flags_and_attributes,
            manifest_path,
            path,
            enumerate_pattern,
            command_line,
            is_augmented,
        }))
    }

    fn parse_process_data(payload: &str, raw: &str) -> Result<ProcessDataReport> {
        let fields: Vec<&str> = payload.split(FIELD_DELIMITER).collect();
        if fields.len() != PROCESS_DATA_FIELDS {
            return Err(SandboxError::parse(
                format!(
                    "process data has {} fields, expected {}",
                    fields.len(),
                    PROCESS_DATA_FIELDS
                ),
                raw,
            ));
        }

        let n = |index: usize, name: &str| hex_u32(fields[index], name, raw);
        let wide = |index: usize, name: &str| hex_u64(fields[index], name, raw);
        let pair = |high: usize, name: &str| -> Result<u64> {
            Ok(combine_halves(n(high, name)?, n(high + 1, name)?))
        };

        Ok(ProcessDataReport {
            path: fields[0].to_string(),
            process_id: n(1, "process id")?,
            parent_process_id: n(2, "parent process id")?,
            creation_time: filetime_to_utc(pair(3, "creation time")?),
            exit_time: filetime_to_utc(pair(5, "exit time")?),
            kernel_time_ticks: pair(7, "kernel time")?,
            user_time_ticks: pair(9, "user time")?,
            exit_code: n(11, "exit code")?,
            io: IoCounters {
                read_operation_count: wide(12, "read operations")?,
                write_operation_count: wide(13, "write operations")?,
                other_operation_count: wide(14, "other operations")?,
                read_transfer_count: wide(15, "read bytes")?,
                write_transfer_count: wide(16, "write bytes")?,
                other_transfer_count: wide(17, "other bytes")?,
            },
            resources: ProcessResourceCounters {
                peak_working_set: wide(18, "peak working set")?,
                peak_virtual_size: wide(19, "peak virtual size")?,
                peak_pagefile_usage: wide(20, "peak pagefile usage")?,
                thread_count: n(21, "thread count")?,
                handle_count: n(22, "handle count")?,
                job_id: wide(23, "job id")?,
            },
        })
    }

    fn parse_detouring_status(payload: &str, raw: &str) -> Result<ProcessDetouringStatus> {
        let fields: Vec<&str> = payload.split(FIELD_DELIMITER).collect();
        if fields.len() < DETOURING_STATUS_MIN_FIELDS {
            return Err(SandboxError::parse(
                format!(
                    "detouring status has {} fields, expected at least {}",
                    fields.len(),
                    DETOURING_STATUS_MIN_FIELDS
                ),
                raw,
            ));
        }

        let flag = |index: usize, name: &str| -> Result<bool> {
            Ok(hex_u32(fields[index], name, raw)? != 0)
        };

        Ok(ProcessDetouringStatus {
            process_id: hex_u64(fields[0], "process id", raw)?,
            report_status: hex_u32(fields[1], "report status", raw)?,
            process_name: fields[2].to_string(),
            start_application_name: fields[3].to_string(),
            needs_injection: flag(4, "needs injection")?,
            is_current_64_bit_process: flag(5, "current 64-bit")?,
            is_process_64_bit: flag(6, "process 64-bit")?,
            disable_detours: flag(7, "disable detours")?,
            creation_flags: hex_u32(fields[8], "creation flags", raw)?,
            detoured: flag(9, "detoured")?,
            error: hex_u32(fields[10], "error", raw)?,
            command_line: fields[DETOURING_COMMAND_LINE_INDEX..].join(&FIELD_DELIMITER.to_string()),
        })
    }
}

fn hex_u32(field: &str, name: &str, raw: &str) -> Result<u32> {
    u32::from_str_radix(field.trim(), 16)
        .map_err(|_| SandboxError::parse(format!("{name} '{field}' is not hex"), raw))
}

fn hex_u64(field: &str, name: &str, raw: &str) -> Result<u64> {
    u64::from_str_radix(field.trim(), 16)
        .map_err(|_| SandboxError::parse(format!("{name} '{field}' is not hex"), raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_access(line: &str) -> FileAccessReport {
        match AccessReportParser::parse(line).expect("line should parse") {
            ParsedReport::FileAccess(access) => access,
            other => panic!("expected file access, got {:?}", other),
        }
    }

    #[test]
    fn parses_minimal_allowed_read() {
        let access = file_access(r"1,a|1|0|0|0|0|0|0|0|0|0|C:\foo.txt|");
        assert_eq!(access.process_id, 0xa);
        assert_eq!(access.operation, ReportedFileOperation::Unknown);
        assert_eq!(access.requested_access, RequestedAccess::READ);
        assert_eq!(access.status, FileAccessStatus::Allowed);
        assert_eq!(access.path, r"C:\foo.txt");
        assert_eq!(access.enumerate_pattern, None);
        assert!(!access.explicitly_reported);
    }

    #[test]
    fn process_command_line_keeps_embedded_delimiters() {
        let access = file_access("1,Process:2a|0|0|0|0|0|0|0|0|0|0|/bin/sh||sh -c echo a|b");
        assert_eq!(access.operation, ReportedFileOperation::Process);
        assert_eq!(access.command_line.as_deref(), Some("sh -c echo a|b"));
    }

    #[test]
    fn enumeration_pattern_is_optional() {
        let access = file_access("1,FindFirstFileEx:1|8|0|0|0|0|0|0|0|0|0|/src|*.c\r\n");
        assert_eq!(access.enumerate_pattern.as_deref(), Some("*.c"));
        assert!(access.operation.is_enumeration());
    }

    #[test]
    fn pathless_access_is_ignored_not_failed() {
        let parsed = AccessReportParser::parse("1,CreateFile:1|1|0|0|0|0|0|0|0|0|0||").unwrap();
        assert_eq!(parsed, ParsedReport::Ignored);
    }

    #[test]
    fn policy_path_alone_is_enough() {
        let access = file_access("1,CreateFile:1|2|1|0|5|0|0|0|0|0|3||");
        assert_eq!(access.manifest_path, PathId::from_raw(3));
        assert_eq!(access.status, FileAccessStatus::Denied);
        assert_eq!(access.error, 5);
    }

    #[test]
    fn augmented_access_drops_manifest_path() {
        let access = file_access("6,CreateFile:1|1|0|0|0|0|0|0|0|0|3|/tool/out.txt|");
        assert!(access.is_augmented);
        assert_eq!(access.manifest_path, PathId::INVALID);
    }

    #[test]
    fn malformed_lines_are_errors_carrying_the_raw_line() {
        for line in [
            "no comma here",
            "0,whatever",
            "7,whatever",
            "x,1|2",
            "1,Bogus:1|1|0|0|0|0|0|0|0|0|0|/a|",
            "1,CreateFile:zz|1|0|0|0|0|0|0|0|0|0|/a|",
            "1,CreateFile:1|40|0|0|0|0|0|0|0|0|0|/a|",
            "1,CreateFile:1|1|9|0|0|0|0|0|0|0|0|/a|",
            "1,CreateFile:1|1|0|0|0|0|0|0|0|0|0|/a||extra",
            "1,CreateFile:1|1|0",
            "4,/bin/sh|1|2",
        ] {
            match AccessReportParser::parse(line) {
                Err(SandboxError::Parse { line: raw, .. }) => assert_eq!(raw, line),
                other => panic!("expected parse error for {:?}, got {:?}", line, other),
            }
        }
    }

    #[test]
    fn process_data_recombines_halves() {
        let line = "4,/bin/cc|2a|1|19db1de|d53e8000|19db1de|d53e8000|0|989680|1|0|0|1|2|3|4|5|6|7|8|9|a|b|c";
        let data = match AccessReportParser::parse(line).unwrap() {
            ParsedReport::ProcessData(data) => data,
            other => panic!("expected process data, got {:?}", other),
        };
        assert_eq!(data.process_id, 0x2a);
        assert_eq!(data.parent_process_id, 1);
        assert_eq!(data.kernel_time_ticks, 10_000_000);
        assert_eq!(data.user_time_ticks, 1 << 32);
        assert_eq!(data.creation_time.unwrap().timestamp(), 0);
        assert_eq!(data.io.write_transfer_count, 5);
        assert_eq!(data.resources.job_id, 0xc);
    }

    #[test]
    fn process_data_with_unrepresentable_times_still_parses() {
        let line = "4,/bin/cc|2a|1|80000000|0|ffffffff|ffffffff|0|0|0|0|0|0|0|0|0|0|0|0|0|0|0|0|0";
        let data = match AccessReportParser::parse(line).unwrap() {
            ParsedReport::ProcessData(data) => data,
            other => panic!("expected process data, got {:?}", other),
        };
        assert_eq!(data.creation_time, None);
        assert_eq!(data.exit_time, None);
        assert_eq!(data.process_id, 0x2a);
    }

    #[test]
    fn detouring_status_rejoins_command_line() {
        let line = "5,2a|0|cc|/usr/bin/cc|1|1|1|0|0|1|0|cc -o a|b.o";
        let status = match AccessReportParser::parse(line).unwrap() {
            ParsedReport::DetouringStatus(s) => s,
            other => panic!("expected detouring status, got {:?}", other),
        };
        assert_eq!(status.process_id, 0x2a);
        assert!(status.detoured);
        assert_eq!(status.command_line, "cc -o a|b.o");
    }

    #[test]
    fn debug_and_windows_call_are_surfaced() {
        assert_eq!(
            AccessReportParser::parse("3,hello, world").unwrap(),
            ParsedReport::DebugMessage("hello, world".to_string())
        );
        assert!(matches!(
            AccessReportParser::parse("2,CreateProcessW").unwrap(),
            ParsedReport::WindowsCall(_)
        ));
    }
}
