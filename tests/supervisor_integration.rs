//! End-to-end runs of the supervisor against real `/bin/sh` children.

use pipbox::config::types::{PipIdentity, EXIT_CODE_TIMEOUT};
use pipbox::core::supervisor::{run_sandboxed, SandboxedProcess};
use pipbox::core::types::SandboxedProcessInfo;
use pipbox::manifest::{AccessManifest, FileAccessPolicy};
use pipbox::observability::dump::ProcessDumper;
use pipbox::observability::events::{MemoryEventSink, SandboxEventKind};
use pipbox::report::types::{FileAccessStatus, ReportedFileOperation};
use pipbox::utils::output::CapturedOutput;
use pipbox::verdict::allowlist::{AllowlistEntry, AllowlistMatch, FileAccessAllowlist};
use pipbox::verdict::classifier::{FileAccessReportingContext, ReportingSettings};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn shell_info(dir: &Path, hash: u64, script: &str) -> SandboxedProcessInfo {
    let mut info = SandboxedProcessInfo::new(PipIdentity::new(hash, "integration"), "/bin/sh")
        .with_arguments(["-c", script])
        .with_env("PATH", "/usr/bin:/bin")
        .with_timeout(Duration::from_secs(20));
    info.working_directory = dir.to_path_buf();
    info.output_directory = dir.join("out");
    info.scratch_directory = dir.join("scratch");
    info.nested_process_termination_timeout = Duration::from_millis(500);
    info
}

#[test]
fn fifo_reports_flow_into_access_sets_and_classification() {
    let dir = tempfile::tempdir().unwrap();
    let mut manifest = AccessManifest::new();
    let src = manifest.add_path("/src/a.c", FileAccessPolicy::ALLOW_READ);

    let script = format!(
        concat!(
            "printf '1,Process:%x|0|0|0|0|0|0|0|0|0|0|/bin/sh||sh -c build\\n' $$ > \"$PIPBOX_REPORTS_FIFO\"; ",
            "printf '1,CreateFile:%x|1|1|0|2|0|0|0|0|0|0|/tmp/foo.txt|\\n' $$ > \"$PIPBOX_REPORTS_FIFO\"; ",
            "printf '1,CreateFile:%x|1|0|0|0|0|0|0|0|0|{:x}|/src/a.c|\\n' $$ > \"$PIPBOX_REPORTS_FIFO\"; ",
            "printf '3,compiling\\n' > \"$PIPBOX_REPORTS_FIFO\"; ",
            "echo built"
        ),
        src.raw()
    );
    let mut info = shell_info(dir.path(), 0x100, &script).with_manifest(Arc::new(manifest));
    info.capture_access_reports = true;
    let manifest = Arc::clone(&info.manifest);

    let events = Arc::new(MemoryEventSink::new());
    let result = run_sandboxed(info, events.clone()).unwrap();

    assert_eq!(result.exit_code, 0);
    assert!(result.message_processing_failure().is_none());
    assert_eq!(result.stdout, CapturedOutput::InMemory("built\n".to_string()));

    let sets = &result.access_sets;
    assert_eq!(sets.all_accesses.len(), 3);
    assert_eq!(sets.unexpected_accesses.len(), 1);
    let denied = &sets.unexpected_accesses[0];
    assert_eq!(denied.operation, ReportedFileOperation::CreateFile);
    assert_eq!(denied.status, FileAccessStatus::Denied);
    assert_eq!(&*denied.path, "/tmp/foo.txt");

    // The manifest-resolved read drops its literal path.
    let read = sets.all_accesses.iter().find(|a| a.manifest_path == src).unwrap();
    assert!(read.path.is_empty());
    assert_eq!(read.effective_path(manifest.path_table()), "/src/a.c");

    let sh = result.processes.iter().find(|p| p.path == "/bin/sh").unwrap();
    assert_eq!(sh.command_line, "sh -c build");

    let mut allowlist = FileAccessAllowlist::new();
    let scratch = AllowlistEntry::for_executable("tmp scratch", "/bin/sh", "^/tmp/", false);
    allowlist.add(scratch.unwrap());
    let mut context = FileAccessReportingContext::new(
        PipIdentity::new(0x100, "integration"),
        Arc::new(allowlist),
        ReportingSettings::default(),
        events.clone(),
    )
    .unwrap();
    let matches = context.report_unexpected_accesses(sets, manifest.path_table());
    assert_eq!(matches, vec![AllowlistMatch::MatchesButNotCacheable]);
    assert_eq!(context.num_file_access_violations_not_allowlisted(), 0);
    assert!(context.has_uncacheable_accesses());
    assert_eq!(events.count(SandboxEventKind::AllowlistedUncacheableAccess), 1);
}

#[test]
fn corrupt_report_stream_is_surfaced_on_the_result() {
    let dir = tempfile::tempdir().unwrap();
    let mut info = shell_info(
        dir.path(),
        0x101,
        "printf 'not a report\\n' > \"$PIPBOX_REPORTS_FIFO\"; exit 0",
    );
    info.capture_access_reports = true;
    let events = Arc::new(MemoryEventSink::new());

    let result = run_sandboxed(info, events.clone()).unwrap();
    let failure = result.message_processing_failure().unwrap();
    assert_eq!(failure.raw_line, "not a report");
    assert!(!result.succeeded());
    assert_eq!(events.count(SandboxEventKind::ReportParseFailure), 1);
}

struct CountingDumper {
    calls: AtomicUsize,
}

impl ProcessDumper for CountingDumper {
    fn dump_process_and_children(&self, _pid: u32, output_dir: &Path) -> pipbox::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::fs::create_dir_all(output_dir)?;
        Ok(())
    }
}

#[test]
fn concurrent_kills_run_the_kill_sequence_once() {
    let dir = tempfile::tempdir().unwrap();
    let dumper = Arc::new(CountingDumper {
        calls: AtomicUsize::new(0),
    });
    let events = Arc::new(MemoryEventSink::new());
    let running = SandboxedProcess::new(shell_info(dir.path(), 0x102, "sleep 30"), events.clone())
        .with_dumper(dumper.clone())
        .start()
        .unwrap();

    let barrier = Arc::new(Barrier::new(4));
    let killers: Vec<_> = (0..4)
        .map(|_| {
            let handle = running.kill_handle();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                handle.kill()
            })
        })
        .collect();
    let performed = killers
        .into_iter()
        .map(|t| t.join().unwrap())
        .filter(|performed| *performed)
        .count();

    let result = running.get_result().unwrap();
    assert_eq!(performed, 1);
    assert_eq!(dumper.calls.load(Ordering::SeqCst), 1);
    assert_eq!(events.count(SandboxEventKind::ProcessKilled), 1);
    assert!(result.killed);
    assert!(!result.timed_out);
    assert_eq!(result.exit_code, 137);
    assert!(result.dump_creation_error.is_none());
}

#[test]
fn hard_timeout_reports_sentinel_and_event() {
    let dir = tempfile::tempdir().unwrap();
    let info = shell_info(dir.path(), 0x103, "echo started; sleep 10")
        .with_timeout(Duration::from_millis(200));
    let events = Arc::new(MemoryEventSink::new());

    let result = run_sandboxed(info, events.clone()).unwrap();
    assert!(result.timed_out);
    assert!(result.killed);
    assert_eq!(result.exit_code, EXIT_CODE_TIMEOUT);
    assert_eq!(result.stdout.read_value().unwrap(), "started\n");

    let timeouts = events.of_kind(SandboxEventKind::ProcessTimedOut);
    assert_eq!(timeouts.len(), 1);
    assert_eq!(timeouts[0].field("timeout_ms"), Some("200"));
    let timeout = &timeouts[0];
    assert!(timeout.field("dump_directory").is_some() || timeout.field("dump_error").is_some());
}
