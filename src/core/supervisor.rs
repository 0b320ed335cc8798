//! Supervision of one pip's process tree from launch to result.
//!
//! `SandboxedProcess<NotStarted>` only knows how to start; the running form
//! owns the live process and is consumed by `get_result`. Stdout, stderr, the
//! exit wait and the report drain progress independently and are joined before
//! the result is assembled; only exit-vs-timeout is a race.

use crate::config::types::{PipIdentity, Result, SandboxError, EXIT_CODE_KILLED, EXIT_CODE_TIMEOUT};
use crate::core::platform::{ReapedProcess, SandboxPlatform, UnixPlatform};
use crate::core::types::{
    coalesce_processes, KillReport, ProcessTimes, SandboxedProcessInfo, SandboxedProcessResult,
};
use crate::observability::dump::{ProcessDumper, ProcfsDumper};
use crate::observability::events::{EventSink, SandboxEvent, SandboxEventKind};
use crate::report::aggregator::{MessageHandlingFlags, ReportAggregator, ReportListener};
use crate::report::channel::{MessageCountSemaphore, ReportChannel};
use crate::report::process_table::ReportedProcess;
use crate::utils::output::{OutputAccumulator, OutputLimits, OutputStream};
use crate::utils::procfs;
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

const TREE_POLL_INTERVAL: Duration = Duration::from_millis(10);
const REAP_AFTER_KILL_TIMEOUT: Duration = Duration::from_secs(5);
const REPORT_ABORT_GRACE: Duration = Duration::from_secs(2);

/// Runtime progress, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NotStarted,
    Running,
    Exited,
    TimedOut,
    Killed,
    ReportsDrained,
    ResultAssembled,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Kill `pid`'s process group, falling back to the process itself.
fn signal_tree(pid: u32, notes: &mut Vec<String>) -> bool {
    let target = Pid::from_raw(pid as i32);
    match killpg(target, Signal::SIGKILL) {
        Ok(()) => true,
        Err(group_err) => match kill(target, Signal::SIGKILL) {
            Ok(()) => {
                notes.push(format!("group SIGKILL fallback used: {}", group_err));
                true
            }
            Err(e) => {
                notes.push(format!("SIGKILL to {} failed: {}", pid, e));
                false
            }
        },
    }
}

#[derive(Debug, Clone, Default)]
struct KillOutcome {
    report: KillReport,
    dump_directory: Option<PathBuf>,
    dump_error: Option<String>,
}

struct KillShared {
    pip: PipIdentity,
    pid: u32,
    killed: AtomicBool,
    exited: AtomicBool,
    platform: Arc<dyn SandboxPlatform>,
    dumper: Arc<dyn ProcessDumper>,
    events: Arc<dyn EventSink>,
    aggregator: Arc<Mutex<ReportAggregator>>,
    stdout: Arc<OutputAccumulator>,
    stderr: Arc<OutputAccumulator>,
    dump_directory: PathBuf,
    outcome: Mutex<Option<KillOutcome>>,
}

/// Clonable cancellation handle; timeout and external kill share it.
#[derive(Clone)]
pub struct KillHandle {
    shared: Arc<KillShared>,
}

impl KillHandle {
    /// Dump, terminate, stop recording, force outputs complete.
    ///
    /// Runs at most once per process; returns `false` for every later call.
    pub fn kill(&self) -> bool {
        let s = &self.shared;
        if s.killed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let started = Instant::now();
        let mut outcome = KillOutcome::default();

        if s.exited.load(Ordering::Acquire) {
            outcome.report.notes.push("primary process already exited".to_string());
        } else {
            outcome.report.dump_attempted = true;
            match s.dumper.dump_process_and_children(s.pid, &s.dump_directory) {
                Ok(()) => outcome.dump_directory = Some(s.dump_directory.clone()),
                Err(e) => {
                    s.events.emit(
                        &SandboxEvent::new(SandboxEventKind::DumpFailed, &s.pip)
                            .with_field("pid", s.pid)
                            .with_field("error", &e),
                    );
                    outcome.dump_error = Some(e.to_string());
                }
            }

            let descendants = s.platform.surviving_children(s.pid);
            outcome.report.kill_sent = signal_tree(s.pid, &mut outcome.report.notes);
            for child in descendants {
                if kill(Pid::from_raw(child as i32), Signal::SIGKILL).is_ok() {
                    outcome.report.descendants_killed.push(child);
                }
            }
        }

        lock(&s.aggregator).stop_recording();
        s.stdout.force_complete();
        s.stderr.force_complete();

        outcome.report.waited_ms = started.elapsed().as_millis() as u64;
        s.events.emit(
            &SandboxEvent::new(SandboxEventKind::ProcessKilled, &s.pip)
                .with_field("pid", s.pid)
                .with_field("descendants_killed", outcome.report.descendants_killed.len()),
        );
        *lock(&s.outcome) = Some(outcome);
        true
    }

    pub fn is_killed(&self) -> bool {
        self.shared.killed.load(Ordering::Acquire)
    }

    pub fn pid(&self) -> u32 {
        self.shared.pid
    }
}

/// Not yet launched
pub struct NotStarted;

/// Launched; owns the live tree
pub struct Running {
    pid: u32,
    started_at: Instant,
    start_time: DateTime<Utc>,
    aggregator: Arc<Mutex<ReportAggregator>>,
    channel: Option<ReportChannel>,
    stdout: Arc<OutputAccumulator>,
    stderr: Arc<OutputAccumulator>,
    exit_rx: Receiver<Result<ReapedProcess>>,
    kill: KillHandle,
}

struct SupervisorSettings {
    info: SandboxedProcessInfo,
    platform: Arc<dyn SandboxPlatform>,
    dumper: Arc<dyn ProcessDumper>,
    events: Arc<dyn EventSink>,
    flags: MessageHandlingFlags,
    listener: Option<Arc<dyn ReportListener>>,
}

pub struct SandboxedProcess<S> {
    settings: SupervisorSettings,
    state: SupervisorState,
    stage: S,
}

impl<S> SandboxedProcess<S> {
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn info(&self) -> &SandboxedProcessInfo {
        &self.settings.info
    }

    fn emit(&self, event: SandboxEvent) {
        self.settings.events.emit(&event);
    }
}

impl SandboxedProcess<NotStarted> {
    pub fn new(info: SandboxedProcessInfo, events: Arc<dyn EventSink>) -> Self {
        Self {
            settings: SupervisorSettings {
                info,
                platform: Arc::new(UnixPlatform),
                dumper: Arc::new(ProcfsDumper),
                events,
                flags: MessageHandlingFlags::collect_only(),
                listener: None,
            },
            state: SupervisorState::NotStarted,
            stage: NotStarted,
        }
    }

    pub fn with_platform(mut self, platform: Arc<dyn SandboxPlatform>) -> Self {
        self.settings.platform = platform;
        self
    }

    pub fn with_dumper(mut self, dumper: Arc<dyn ProcessDumper>) -> Self {
        self.settings.dumper = dumper;
        self
    }

    pub fn with_message_handling(mut self, flags: MessageHandlingFlags) -> Self {
        self.settings.flags = flags;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn ReportListener>) -> Self {
        self.settings.listener = Some(listener);
        self
    }

    /// Spawn the primary process and start capturing its output and reports.
    pub fn start(self) -> Result<SandboxedProcess<Running>> {
        let settings = self.settings;
        let info = &settings.info;
        if info.executable.as_os_str().is_empty() {
            return Err(SandboxError::Config(format!("[{}] has no executable", info.pip)));
        }
        std::fs::create_dir_all(&info.output_directory)?;

        let mut aggregator = ReportAggregator::new(
            info.pip.clone(),
            Arc::clone(&info.manifest),
            Arc::clone(&settings.events),
        )
        .with_flags(settings.flags);
        if info.capture_access_reports {
            aggregator = aggregator.with_message_count_semaphore(
                Arc::new(MessageCountSemaphore::new()),
                info.message_count_semaphore_timeout,
            );
        }
        if let Some(listener) = &settings.listener {
            aggregator = aggregator.with_listener(Arc::clone(listener));
        }
        let aggregator = Arc::new(Mutex::new(aggregator));

        let channel = settings
            .platform
            .capture_access_events(info, Arc::clone(&aggregator))?;

        let start_time = Utc::now();
        let started_at = Instant::now();
        let spawned = match settings
            .platform
            .spawn(info, channel.as_ref().map(ReportChannel::fifo_path))
        {
            Ok(spawned) => spawned,
            Err(e) => {
                settings.events.emit(
                    &SandboxEvent::new(SandboxEventKind::ProcessStartFailed, &info.pip)
                        .with_field("executable", info.executable.display())
                        .with_field("error", &e),
                );
                return Err(e);
            }
        };
        let pid = spawned.pid;

        let stem = info.pip.formatted_hash();
        let limits = OutputLimits {
            max_in_memory_bytes: info.max_output_in_memory_bytes,
            spill_directory: info.output_directory.clone(),
        };
        let stdout = OutputAccumulator::new(OutputStream::Stdout, &limits, &stem);
        let stderr = OutputAccumulator::new(OutputStream::Stderr, &limits, &stem);
        match spawned.stdout {
            Some(pipe) => drop(stdout.spawn_reader(pipe)),
            None => stdout.complete(),
        }
        match spawned.stderr {
            Some(pipe) => drop(stderr.spawn_reader(pipe)),
            None => stderr.complete(),
        }

        let shared = Arc::new(KillShared {
            pip: info.pip.clone(),
            pid,
            killed: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            platform: Arc::clone(&settings.platform),
            dumper: Arc::clone(&settings.dumper),
            events: Arc::clone(&settings.events),
            aggregator: Arc::clone(&aggregator),
            stdout: Arc::clone(&stdout),
            stderr: Arc::clone(&stderr),
            dump_directory: info.output_directory.join(format!("{}.dumps", stem)),
            outcome: Mutex::new(None),
        });

        let (exit_tx, exit_rx) = crossbeam_channel::bounded(1);
        let waiter_platform = Arc::clone(&settings.platform);
        let waiter_shared = Arc::clone(&shared);
        thread::spawn(move || {
            let reaped = waiter_platform.wait_for_exit(pid);
            waiter_shared.exited.store(true, Ordering::Release);
            let _ = exit_tx.send(reaped);
        });

        settings.events.emit(
            &SandboxEvent::new(SandboxEventKind::ProcessStarted, &info.pip)
                .with_field("pid", pid)
                .with_field("command_line", info.command_line()),
        );
        log::debug!("[{}] started pid {}", info.pip, pid);

        Ok(SandboxedProcess {
            settings,
            state: SupervisorState::Running,
            stage: Running {
                pid,
                started_at,
                start_time,
                aggregator,
                channel,
                stdout,
                stderr,
                exit_rx,
                kill: KillHandle { shared },
            },
        })
    }
}

impl SandboxedProcess<Running> {
    pub fn pid(&self) -> u32 {
        self.stage.pid
    }

    pub fn kill_handle(&self) -> KillHandle {
        self.stage.kill.clone()
    }

    /// Processes reported as started and not yet exited.
    pub fn get_active_processes(&self) -> Vec<ReportedProcess> {
        lock(&self.stage.aggregator).get_active_processes()
    }

    /// Wait for exit or timeout. `None` when the process could not be reaped.
    fn await_exit(&mut self) -> Result<(Option<ReapedProcess>, bool)> {
        let info = &self.settings.info;
        let run = &self.stage;
        let pip = info.pip.clone();

        if let Some(warning) = info.warning_timeout.filter(|w| *w < info.timeout) {
            match run.exit_rx.recv_timeout(warning) {
                Ok(reaped) => return Ok((Some(reaped?), false)),
                Err(RecvTimeoutError::Timeout) => {
                    self.settings.events.emit(
                        &SandboxEvent::new(SandboxEventKind::ProcessWarningTimeout, &pip)
                            .with_field("pid", run.pid)
                            .with_field("warning_timeout_ms", warning.as_millis()),
                    );
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SandboxError::Process(format!("[{}] exit waiter vanished", pip)))
                }
            }
        }

        let remaining = info.timeout.saturating_sub(run.started_at.elapsed());
        match run.exit_rx.recv_timeout(remaining) {
            Ok(reaped) => Ok((Some(reaped?), false)),
            Err(RecvTimeoutError::Timeout) => {
                run.kill.kill();
                let reaped = match run.exit_rx.recv_timeout(REAP_AFTER_KILL_TIMEOUT) {
                    Ok(reaped) => Some(reaped?),
                    Err(_) => {
                        log::warn!("[{}] pid {} not reaped after kill", pip, run.pid);
                        None
                    }
                };
                Ok((reaped, true))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(SandboxError::Process(format!("[{}] exit waiter vanished", pip)))
            }
        }
    }

    /// Join the report drain, both streams and the rest of the tree, killing
    /// whatever is still alive once the grace period ends.
    fn drain_tree(&mut self) -> Vec<ReportedProcess> {
        let grace = self.settings.info.nested_process_termination_timeout;
        let platform = Arc::clone(&self.settings.platform);
        let run = &mut self.stage;
        if let Some(channel) = run.channel.as_mut() {
            channel.release_keep_alive();
        }

        let deadline = Instant::now() + grace;
        let mut survivors;
        loop {
            let reports_done = run
                .channel
                .as_mut()
                .map_or(true, |c| c.wait_for_completion(Duration::ZERO));
            let outputs_done = run.stdout.is_completed() && run.stderr.is_completed();
            survivors = platform.surviving_children(run.pid);
            let settled = reports_done && outputs_done && survivors.is_empty();
            if settled || Instant::now() >= deadline {
                break;
            }
            thread::sleep(TREE_POLL_INTERVAL);
        }

        let mut surviving = Vec::new();
        if !survivors.is_empty() {
            let reported = lock(&run.aggregator).get_active_processes();
            surviving = survivors
                .iter()
                .map(|pid| {
                    reported
                        .iter()
                        .rev()
                        .find(|p| p.process_id == *pid)
                        .cloned()
                        .unwrap_or_else(|| procfs::reported_process(*pid))
                })
                .collect();

            let mut notes = Vec::new();
            signal_tree(run.pid, &mut notes);
            for pid in &survivors {
                let _ = kill(Pid::from_raw(*pid as i32), Signal::SIGKILL);
            }
            for note in notes {
                log::debug!("{}", note);
            }
            let pip = &self.settings.info.pip;
            self.settings.events.emit(
                &SandboxEvent::new(SandboxEventKind::SurvivingChildrenKilled, pip)
                    .with_field("count", survivors.len())
                    .with_field(
                        "pids",
                        survivors.iter().map(u32::to_string).collect::<Vec<_>>().join(","),
                    ),
            );
        }

        if !(run.stdout.is_completed() && run.stderr.is_completed()) {
            run.stdout.force_complete();
            run.stderr.force_complete();
        }
        if let Some(mut channel) = run.channel.take() {
            if !channel.wait_for_completion(Duration::ZERO) {
                channel.abort();
                if !channel.wait_for_completion(REPORT_ABORT_GRACE) {
                    log::warn!(
                        "[{}] report drain did not finish after abort",
                        self.settings.info.pip
                    );
                }
            }
            // Dropping joins the reader and drain threads.
            drop(channel);
        }
        surviving
    }

    /// Wait for the whole tree, then assemble the immutable result.
    pub fn get_result(mut self) -> Result<SandboxedProcessResult> {
        let (reaped, timed_out) = self.await_exit()?;
        let exited_at = Instant::now();
        let exit_time = Utc::now();
        let killed = self.stage.kill.is_killed();

        self.state = if timed_out {
            SupervisorState::TimedOut
        } else if killed {
            SupervisorState::Killed
        } else {
            SupervisorState::Exited
        };
        log::debug!("[{}] pid {} -> {:?}", self.settings.info.pip, self.stage.pid, self.state);

        let outcome = lock(&self.stage.kill.shared.outcome).clone().unwrap_or_default();
        if timed_out {
            let mut event =
                SandboxEvent::new(SandboxEventKind::ProcessTimedOut, &self.settings.info.pip)
                    .with_field("pid", self.stage.pid)
                .with_field("timeout_ms", self.settings.info.timeout.as_millis());
            if let Some(dir) = &outcome.dump_directory {
                event = event.with_field("dump_directory", dir.display());
            }
            if let Some(error) = &outcome.dump_error {
                event = event.with_field("dump_error", error);
            }
            self.emit(event);
        }

        let surviving_child_processes = self.drain_tree();
        self.state = SupervisorState::ReportsDrained;

        let access_sets = {
            let mut aggregator = lock(&self.stage.aggregator);
            aggregator.freeze();
            aggregator.access_sets().clone()
        };

        let exit_code = if timed_out {
            EXIT_CODE_TIMEOUT
        } else {
            reaped.map_or(EXIT_CODE_KILLED, |r| r.status.code())
        };
        let primary_process_times = ProcessTimes {
            start_time: Some(self.stage.start_time),
            exit_time: Some(exit_time),
            wall_clock: exited_at.duration_since(self.stage.started_at),
            user_time: reaped.map(|r| r.user_time).unwrap_or_default(),
            kernel_time: reaped.map(|r| r.kernel_time).unwrap_or_default(),
        };

        let (stdout, stdout_integrity) = self.stage.stdout.finalize();
        let (stderr, stderr_integrity) = self.stage.stderr.finalize();
        let result = SandboxedProcessResult {
            exit_code,
            killed: killed || timed_out,
            timed_out,
            stdout,
            stderr,
            stdout_integrity,
            stderr_integrity,
            processes: coalesce_processes(&access_sets.processes),
            access_sets,
            surviving_child_processes,
            primary_process_times,
            dump_directory: outcome.dump_directory,
            dump_creation_error: outcome.dump_error,
            kill_report: if killed { Some(outcome.report) } else { None },
        };
        self.state = SupervisorState::ResultAssembled;
        log::debug!(
            "[{}] result assembled: exit {} killed {} timed_out {}",
            self.settings.info.pip,
            result.exit_code,
            result.killed,
            result.timed_out
        );
        Ok(result)
    }
}

/// Run `info` to completion with the default platform and dumper.
pub fn run_sandboxed(
    info: SandboxedProcessInfo,
    events: Arc<dyn EventSink>,
) -> Result<SandboxedProcessResult> {
    SandboxedProcess::new(info, events).start()?.get_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::events::MemoryEventSink;
    use crate::utils::output::{CapturedOutput, OutputIntegrity};

    fn info(dir: &std::path::Path, script: &str) -> SandboxedProcessInfo {
        let pip = PipIdentity::new(0x51, "supervisor test");
        let mut info = SandboxedProcessInfo::new(pip, "/bin/sh")
            .with_arguments(["-c", script])
            .with_env("PATH", std::env::var("PATH").unwrap_or_default())
            .with_timeout(Duration::from_secs(20));
        info.output_directory = dir.join("out");
        info.scratch_directory = dir.join("scratch");
        info.nested_process_termination_timeout = Duration::from_millis(300);
        info
    }

    #[test]
    fn captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemoryEventSink::new());
        let script = "echo hello; echo oops >&2; exit 4";
        let result = run_sandboxed(info(dir.path(), script), sink.clone()).unwrap();

        assert_eq!(result.exit_code, 4);
        assert!(!result.killed);
        assert!(!result.timed_out);
        assert_eq!(result.stdout, CapturedOutput::InMemory("hello\n".to_string()));
        assert_eq!(result.stderr.read_value().unwrap(), "oops\n");
        assert_eq!(result.stdout_integrity, OutputIntegrity::Complete);
        assert!(result.kill_report.is_none());
        assert_eq!(sink.count(SandboxEventKind::ProcessStarted), 1);
    }

    #[test]
    fn state_advances_through_start() {
        let dir = tempfile::tempdir().unwrap();
        let process =
            SandboxedProcess::new(info(dir.path(), "true"), Arc::new(MemoryEventSink::new()));
        assert_eq!(process.state(), SupervisorState::NotStarted);
        let running = process.start().unwrap();
        assert_eq!(running.state(), SupervisorState::Running);
        assert!(running.pid() > 0);
        running.get_result().unwrap();
    }

    #[test]
    fn hard_timeout_kills_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemoryEventSink::new());
        let result = run_sandboxed(
            info(dir.path(), "sleep 5").with_timeout(Duration::from_millis(50)),
            sink.clone(),
        )
        .unwrap();

        assert!(result.timed_out);
        assert!(result.killed);
        assert_eq!(result.exit_code, EXIT_CODE_TIMEOUT);
        assert!(result.dump_directory.is_some() || result.dump_creation_error.is_some());
        assert!(result.primary_process_times.wall_clock < Duration::from_secs(5));

        let timed_out = sink.of_kind(SandboxEventKind::ProcessTimedOut);
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].field("timeout_ms"), Some("50"));
    }

    #[test]
    fn warning_timeout_fires_once_for_completed_process() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemoryEventSink::new());
        let mut slow = info(dir.path(), "sleep 0.3");
        slow.warning_timeout = Some(Duration::from_millis(20));
        let result = run_sandboxed(slow, sink.clone()).unwrap();

        assert_eq!(result.exit_code, 0);
        assert!(!result.timed_out);
        assert_eq!(sink.count(SandboxEventKind::ProcessWarningTimeout), 1);
        assert_eq!(sink.count(SandboxEventKind::ProcessTimedOut), 0);
    }

    #[test]
    fn external_kill_is_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let running =
            SandboxedProcess::new(info(dir.path(), "sleep 10"), Arc::new(MemoryEventSink::new()))
                .start()
                .unwrap();
        let handle = running.kill_handle();
        assert!(handle.kill());
        assert!(!handle.kill());

        let result = running.get_result().unwrap();
        assert!(result.killed);
        assert!(!result.timed_out);
        assert_eq!(result.exit_code, 128 + libc::SIGKILL);
        let report = result.kill_report.unwrap();
        assert!(report.kill_sent);
        assert!(report.dump_attempted);
    }

    #[test]
    fn surviving_children_are_killed_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemoryEventSink::new());
        let result = run_sandboxed(info(dir.path(), "sleep 30 & exit 0"), sink.clone()).unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.surviving_child_processes.len(), 1);
        assert!(result.surviving_child_processes[0].command_line.contains("sleep"));
        assert_eq!(sink.count(SandboxEventKind::SurvivingChildrenKilled), 1);
    }

    #[test]
    fn large_output_spills_under_output_directory() {
        let dir = tempfile::tempdir().unwrap();
        let script = "i=0; while [ $i -lt 200 ]; do echo line$i; i=$((i+1)); done";
        let mut chatty = info(dir.path(), script);
        chatty.max_output_in_memory_bytes = 64;
        let result = run_sandboxed(chatty, Arc::new(MemoryEventSink::new())).unwrap();

        match &result.stdout {
            CapturedOutput::File { path, .. } => {
                assert!(path.starts_with(dir.path().join("out")));
                assert!(path.ends_with("Pip0000000000000051.stdout.txt"));
            }
            other => panic!("expected spilled output, got {other:?}"),
        }
        assert!(result.stdout.read_value().unwrap().ends_with("line199\n"));
    }

    #[test]
    fn missing_executable_fails_start_with_event() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemoryEventSink::new());
        let mut bad = info(dir.path(), "");
        bad.executable = PathBuf::from("/nonexistent/compiler");
        let err = SandboxedProcess::new(bad, sink.clone()).start().err().unwrap();
        assert!(matches!(err, SandboxError::ProcessStart { .. }));
        assert_eq!(sink.count(SandboxEventKind::ProcessStartFailed), 1);
    }
}
