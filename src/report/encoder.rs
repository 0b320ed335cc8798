//! Wire-line encoder, the inverse of [`AccessReportParser`](super::parser::AccessReportParser).
//!
//! Used by in-process producers and test fixtures that speak the same
//! protocol as the native instrumentation layer.

use crate::report::types::*;

fn file_access_line(access: &FileAccessReport) -> String {
    let report_type = if access.is_augmented {
        ReportType::AugmentedFileAccess
    } else {
        ReportType::FileAccess
    };
    let mut line = format!(
        "{},{}:{:x}|{:x}|{:x}|{:x}|{:x}|{:x}|{:x}|{:x}|{:x}|{:x}|{:x}|{}|{}",
        report_type.code(),
        access.operation.as_str(),
        access.process_id,
        access.requested_access.bits(),
        access.status.code(),
        u32::from(access.explicitly_reported),
        access.error,
        access.usn,
        access.desired_access,
        access.share_mode,
        access.creation_disposition,
        access.flags_and_attributes,
        access.manifest_path.raw(),
        access.path,
        access.enumerate_pattern.as_deref().unwrap_or(""),
    );
    if access.operation == ReportedFileOperation::Process {
        line.push('|');
        line.push_str(access.command_line.as_deref().unwrap_or(""));
    }
    line
}

fn process_data_line(data: &ProcessDataReport) -> String {
    let (ch, cl) = split_halves(utc_to_filetime(data.creation_time));
    let (eh, el) = split_halves(utc_to_filetime(data.exit_time));
    let (kh, kl) = split_halves(data.kernel_time_ticks);
    let (uh, ul) = split_halves(data.user_time_ticks);
    let io = &data.io;
    let res = &data.resources;
    format!(
        "{},{}|{:x}|{:x}|{:x}|{:x}|{:x}|{:x}|{:x}|{:x}|{:x}|{:x}|{:x}|{:x}|{:x}|{:x}|{:x}|{:x}|{:x}|{:x}|{:x}|{:x}|{:x}|{:x}|{:x}",
        ReportType::ProcessData.code(),
        data.path,
        data.process_id,
        data.parent_process_id,
        ch,
        cl,
        eh,
        el,
        kh,
        kl,
        uh,
        ul,
        data.exit_code,
        io.read_operation_count,
        io.write_operation_count,
        io.other_operation_count,
        io.read_transfer_count,
        io.write_transfer_count,
        io.other_transfer_count,
        res.peak_working_set,
        res.peak_virtual_size,
        res.peak_pagefile_usage,
        res.thread_count,
        res.handle_count,
        res.job_id,
    )
}

fn detouring_status_line(status: &ProcessDetouringStatus) -> String {
    format!(
        "{},{:x}|{:x}|{}|{}|{:x}|{:x}|{:x}|{:x}|{:x}|{:x}|{:x}|{}",
        ReportType::ProcessDetouringStatus.code(),
        status.process_id,
        status.report_status,
        status.process_name,
        status.start_application_name,
        u32::from(status.needs_injection),
        u32::from(status.is_current_64_bit_process),
        u32::from(status.is_process_64_bit),
        u32::from(status.disable_detours),
        status.creation_flags,
        u32::from(status.detoured),
        status.error,
        status.command_line,
    )
}

/// Encode a report as one wire line without the trailing newline.
///
/// Returns `None` for [`ParsedReport::Ignored`], which has no wire form.
pub fn encode(report: &ParsedReport) -> Option<String> {
    match report {
        ParsedReport::FileAccess(access) => Some(file_access_line(access)),
        ParsedReport::ProcessData(data) => Some(process_data_line(data)),
        ParsedReport::DetouringStatus(status) => Some(detouring_status_line(status)),
        ParsedReport::DebugMessage(message) => {
            Some(format!("{},{}", ReportType::DebugMessage.code(), message))
        }
        ParsedReport::WindowsCall(payload) => {
            Some(format!("{},{}", ReportType::WindowsCall.code(), payload))
        }
        ParsedReport::Ignored => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::PathId;
    use crate::report::parser::AccessReportParser;
    use chrono::{TimeZone, Utc};

    fn round_trip(report: ParsedReport) {
        let line = encode(&report).expect("encodable");
        let parsed = AccessReportParser::parse(&line).expect("encoded line parses");
        assert_eq!(parsed, report, "line: {}", line);
    }

    #[test]
    fn file_access_with_every_field_set_round_trips() {
        let requested = RequestedAccess::WRITE | RequestedAccess::PROBE;
        let mut access =
            FileAccessReport::new(ReportedFileOperation::MoveFileSource, 77, "/out/a.txt")
                .with_access(requested, FileAccessStatus::Denied)
                .with_manifest_path(PathId::from_raw(9))
                .explicitly_reported();
        access.error = 2;
        access.usn = u64::MAX;
        access.desired_access = 0xC000_0000;
        access.share_mode = 7;
        access.creation_disposition = 3;
        access.flags_and_attributes = 0x80;
        access.enumerate_pattern = Some("*.o".to_string());
        round_trip(ParsedReport::FileAccess(access));
    }

    #[test]
    fn process_start_round_trips_with_piped_command_line() {
        let access = FileAccessReport::new(ReportedFileOperation::Process, 5, "/bin/sh")
            .with_command_line("sh -c 'ls | wc -l'");
        round_trip(ParsedReport::FileAccess(access));
    }

    #[test]
    fn process_data_round_trips() {
        round_trip(ParsedReport::ProcessData(ProcessDataReport {
            path: "/usr/bin/cc".to_string(),
            process_id: 100,
            parent_process_id: 99,
            creation_time: Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()),
            exit_time: None,
            kernel_time_ticks: 123_456_789_012,
            user_time_ticks: 42,
            exit_code: 1,
            io: IoCounters {
                read_operation_count: 1,
                write_operation_count: 2,
                other_operation_count: 3,
                read_transfer_count: 4,
                write_transfer_count: 5,
                other_transfer_count: 6,
            },
            resources: ProcessResourceCounters {
                peak_working_set: 1 << 40,
                peak_virtual_size: 2,
                peak_pagefile_usage: 3,
                thread_count: 4,
                handle_count: 5,
                job_id: 6,
            },
        }));
    }

    #[test]
    fn ignored_has_no_wire_form() {
        assert_eq!(encode(&ParsedReport::Ignored), None);
    }
}
