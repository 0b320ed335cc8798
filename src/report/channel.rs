//! Ordered single-consumer delivery of wire lines into a `ReportAggregator`.
//!
//! On Unix the process tree writes reports into a FIFO whose path is passed
//! in `PIPBOX_REPORTS_FIFO`. One reader thread splits bytes into lines and one
//! drain thread feeds them, in order, to the aggregator.

use crate::config::types::{Result, SandboxError};
use crate::report::aggregator::ReportAggregator;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};
use nix::sys::stat::Mode;
use std::fs::{File, OpenOptions};
use std::any::Any;
use std::io::{ErrorKind, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Environment variable carrying the report FIFO path to the process tree
pub const REPORTS_FIFO_ENV: &str = "PIPBOX_REPORTS_FIFO";

const POLL_INTERVAL_MS: i32 = 50;
const READ_CHUNK: usize = 8192;

/// Counts messages announced by producers; the consumer takes one per line.
#[derive(Debug, Default)]
pub struct MessageCountSemaphore {
    count: Mutex<u64>,
    available: Condvar,
}

impl MessageCountSemaphore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce one message.
    pub fn release(&self) {
        let mut count = match self.count.lock() {
            Ok(count) => count,
            Err(poisoned) => poisoned.into_inner(),
        };
        *count += 1;
        self.available.notify_one();
    }

    /// Take one message, waiting at most `timeout`. Returns `false` on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = match self.count.lock() {
            Ok(count) => count,
            Err(poisoned) => poisoned.into_inner(),
        };
        let result = self
            .available
            .wait_timeout_while(guard, timeout, |count| *count == 0);
        let (mut count, _) = match result {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    pub fn pending(&self) -> u64 {
        match self.count.lock() {
            Ok(count) => *count,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Lines fed to the aggregator by one drain
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainStats {
    pub lines: u64,
    /// The aggregator asked to stop; later lines were discarded
    pub stopped_early: bool,
}

/// Feed every line from `lines` into `aggregator`, strictly in order, on one thread.
pub fn spawn_drain(
    lines: Receiver<String>,
    aggregator: Arc<Mutex<ReportAggregator>>,
) -> JoinHandle<DrainStats> {
    thread::spawn(move || {
        let mut stats = DrainStats::default();
        for line in lines.iter() {
            if line.is_empty() {
                continue;
            }
            stats.lines += 1;
            if stats.stopped_early {
                continue;
            }
            let mut aggregator = match aggregator.lock() {
                Ok(a) => a,
                Err(poisoned) => poisoned.into_inner(),
            };
            let recorded = panic::catch_unwind(AssertUnwindSafe(|| aggregator.record_line(&line)));
            match recorded {
                Ok(true) => {}
                Ok(false) => stats.stopped_early = true,
                Err(payload) => {
                    let reason = format!("report handler panicked: {}", panic_message(&*payload));
                    aggregator.record_delivery_failure(reason, &line);
                    stats.stopped_early = true;
                }
            }
        }
        stats
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Create the per-run report FIFO.
pub fn create_fifo(path: &Path) -> Result<()> {
    nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| {
        SandboxError::Process(format!("mkfifo({}) failed: {}", path.display(), e))
    })
}

/// Announces each line to the drain before delivering it.
struct LineSender {
    tx: Sender<String>,
    semaphore: Option<Arc<MessageCountSemaphore>>,
}

impl LineSender {
    fn send(&self, line: String) -> bool {
        if !line.is_empty() {
            if let Some(semaphore) = &self.semaphore {
                semaphore.release();
            }
        }
        self.tx.send(line).is_ok()
    }
}

fn split_lines(pending: &mut Vec<u8>, tx: &LineSender) -> bool {
    while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
        let rest = pending.split_off(pos + 1);
        let line = String::from_utf8_lossy(&pending[..pos]).trim_end_matches('\r').to_string();
        *pending = rest;
        if !tx.send(line) {
            return false;
        }
    }
    true
}

fn read_fifo(mut fifo: File, tx: LineSender, abort: Arc<AtomicBool>) {
    let mut pending = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    let fd = fifo.as_raw_fd();

    loop {
        if abort.load(Ordering::Acquire) {
            debug!("report reader aborted with {} buffered bytes", pending.len());
            break;
        }

        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, POLL_INTERVAL_MS) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            warn!("poll on report fifo failed: {}", err);
            break;
        }
        if rc == 0 {
            continue;
        }

        match fifo.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&chunk[..n]);
                if !split_lines(&mut pending, &tx) {
                    return;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("read from report fifo failed: {}", e);
                break;
            }
        }
    }

    // A trailing fragment is a record cut short by a killed writer.
    if !pending.is_empty() {
        let line = String::from_utf8_lossy(&pending).to_string();
        tx.send(line);
    }
}

/// FIFO transport for one supervised process tree.
pub struct ReportChannel {
    fifo_path: PathBuf,
    keep_alive: Option<File>,
    abort: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    drain: Option<JoinHandle<DrainStats>>,
    done: Receiver<()>,
    stats: Option<DrainStats>,
}

impl ReportChannel {
    /// Create the FIFO at `fifo_path` and start delivering into `aggregator`.
    pub fn open(fifo_path: &Path, aggregator: Arc<Mutex<ReportAggregator>>) -> Result<Self> {
        create_fifo(fifo_path)?;

        let read_end = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(fifo_path)?;
        // Held until the tree completes so EOF means no writer is left.
        let keep_alive = OpenOptions::new().write(true).open(fifo_path)?;

        let (line_tx, line_rx) = crossbeam_channel::unbounded();
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let abort = Arc::new(AtomicBool::new(false));

        let semaphore = match aggregator.lock() {
            Ok(a) => a.message_count_semaphore(),
            Err(poisoned) => poisoned.into_inner().message_count_semaphore(),
        };
        let sender = LineSender {
            tx: line_tx,
            semaphore,
        };
        let reader_abort = Arc::clone(&abort);
        let reader = thread::spawn(move || read_fifo(read_end, sender, reader_abort));

        let inner = spawn_drain(line_rx, Arc::clone(&aggregator));
        let drain = thread::spawn(move || {
            let stats = match inner.join() {
                Ok(stats) => stats,
                Err(_) => {
                    let mut aggregator = match aggregator.lock() {
                        Ok(a) => a,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    aggregator.record_delivery_failure("report drain thread terminated", "");
                    DrainStats {
                        lines: 0,
                        stopped_early: true,
                    }
                }
            };
            let _ = done_tx.send(());
            stats
        });

        Ok(Self {
            fifo_path: fifo_path.to_path_buf(),
            keep_alive: Some(keep_alive),
            abort,
            reader: Some(reader),
            drain: Some(drain),
            done: done_rx,
            stats: None,
        })
    }

    pub fn fifo_path(&self) -> &Path {
        &self.fifo_path
    }

    /// Close the supervisor's write end; EOF follows once the tree's ends close.
    pub fn release_keep_alive(&mut self) {
        self.keep_alive.take();
    }

    /// Stop reading even if writers are still alive.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    /// Wait until every delivered line has been recorded.
    ///
    /// Returns `false` if the drain did not finish within `timeout`.
    pub fn wait_for_completion(&mut self, timeout: Duration) -> bool {
        if self.stats.is_some() {
            return true;
        }
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                self.join();
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
        }
    }

    fn join(&mut self) {
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        if let Some(drain) = self.drain.take() {
            self.stats = Some(drain.join().unwrap_or_default());
        }
    }

    pub fn stats(&self) -> Option<DrainStats> {
        self.stats
    }
}

impl Drop for ReportChannel {
    fn drop(&mut self) {
        self.release_keep_alive();
        self.abort();
        self.join();
        if let Err(e) = std::fs::remove_file(&self.fifo_path) {
            debug!("could not remove report fifo {}: {}", self.fifo_path.display(), e);
        }
    }
}
