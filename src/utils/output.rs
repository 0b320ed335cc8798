/// Stdout/stderr accumulation with spill-to-file
///
/// Each stream is read line by line on its own thread. Content stays in
/// memory up to a threshold and is then moved to `<dir>/<pip>.<stream>.txt`.
/// Completion is signalled on EOF, or forced by a kill so that waiters never
/// block on a writer that is still holding the pipe open.
use crate::config::types::{Result, SandboxError};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// How a stream's capture ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputIntegrity {
    /// Reader saw EOF
    Complete,
    /// Completion was forced by a kill; later lines were dropped
    ForcedCompletion,
    /// Reading the stream failed
    ReadError,
    /// Storing the content failed; only what was kept before the error is captured
    CaptureError,
}

impl fmt::Display for OutputIntegrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputIntegrity::Complete => write!(f, "complete"),
            OutputIntegrity::ForcedCompletion => write!(f, "forced_completion"),
            OutputIntegrity::ReadError => write!(f, "read_error"),
            OutputIntegrity::CaptureError => write!(f, "capture_error"),
        }
    }
}

/// Captured content, in memory or spilled to a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapturedOutput {
    InMemory(String),
    File { path: PathBuf, length: u64 },
}

impl CapturedOutput {
    pub fn len(&self) -> u64 {
        match self {
            CapturedOutput::InMemory(value) => value.len() as u64,
            CapturedOutput::File { length, .. } => *length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self, CapturedOutput::File { .. })
    }

    /// Full content, reading the spill file when needed
    pub fn read_value(&self) -> Result<String> {
        match self {
            CapturedOutput::InMemory(value) => Ok(value.clone()),
            CapturedOutput::File { path, .. } => Ok(std::fs::read_to_string(path)?),
        }
    }
}

/// Output limits configuration
#[derive(Debug, Clone)]
pub struct OutputLimits {
    /// Bytes held in memory before spilling
    pub max_in_memory_bytes: usize,
    /// Directory receiving spill files
    pub spill_directory: PathBuf,
}

struct AccumulatorState {
    buffer: String,
    file: Option<BufWriter<File>>,
    length: u64,
    completed: bool,
    integrity: OutputIntegrity,
    error: Option<String>,
}

/// Line accumulator for one stream
pub struct OutputAccumulator {
    stream: OutputStream,
    max_in_memory: usize,
    spill_path: PathBuf,
    state: Mutex<AccumulatorState>,
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
}

impl OutputAccumulator {
    /// `file_stem` names the spill file `<file_stem>.<stream>.txt`.
    pub fn new(stream: OutputStream, limits: &OutputLimits, file_stem: &str) -> Arc<Self> {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        Arc::new(Self {
            stream,
            max_in_memory: limits.max_in_memory_bytes,
            spill_path: limits
                .spill_directory
                .join(format!("{}.{}.txt", file_stem, stream.as_str())),
            state: Mutex::new(AccumulatorState {
                buffer: String::new(),
                file: None,
                length: 0,
                completed: false,
                integrity: OutputIntegrity::Complete,
                error: None,
            }),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
        })
    }

    pub fn stream(&self) -> OutputStream {
        self.stream
    }

    fn lock(&self) -> MutexGuard<'_, AccumulatorState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn spill(&self, state: &mut AccumulatorState) -> std::io::Result<()> {
        if let Some(parent) = self.spill_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = BufWriter::new(File::create(&self.spill_path)?);
        file.write_all(state.buffer.as_bytes())?;
        state.buffer = String::new();
        state.file = Some(file);
        Ok(())
    }

    /// Append one line (a newline is added). Returns `false` once completed.
    pub fn append_line(&self, line: &str) -> bool {
        self.append(line, true)
    }

    fn append(&self, line: &str, newline: bool) -> bool {
        let mut state = self.lock();
        if state.completed {
            return false;
        }

        let added = line.len() + usize::from(newline);
        if state.file.is_none() && state.buffer.len() + added > self.max_in_memory {
            if let Err(e) = self.spill(&mut state) {
                log::warn!(
                    "failed to spill {} to {}: {}",
                    self.stream.as_str(),
                    self.spill_path.display(),
                    e
                );
                state.error = Some(e.to_string());
            }
        }

        let write_result = match state.file.as_mut() {
            Some(file) => file
                .write_all(line.as_bytes())
                .and_then(|_| if newline { file.write_all(b"\n") } else { Ok(()) }),
            None => {
                state.buffer.push_str(line);
                if newline {
                    state.buffer.push('\n');
                }
                Ok(())
            }
        };
        if let Err(e) = write_result {
            state.error = Some(e.to_string());
        }
        state.length += added as u64;
        true
    }

    fn signal(&self, integrity: OutputIntegrity) {
        {
            let mut state = self.lock();
            if state.completed {
                return;
            }
            state.completed = true;
            state.integrity = integrity;
        }
        let sender = match self.done_tx.lock() {
            Ok(mut tx) => tx.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);
    }

    /// Natural end of the stream
    pub fn complete(&self) {
        self.signal(OutputIntegrity::Complete);
    }

    /// Cancellation: no further lines are accepted
    pub fn force_complete(&self) {
        self.signal(OutputIntegrity::ForcedCompletion);
    }

    pub fn is_completed(&self) -> bool {
        self.lock().completed
    }

    /// Wait for completion. Returns `false` on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }

    pub fn integrity(&self) -> OutputIntegrity {
        self.lock().integrity
    }

    pub fn spill_path(&self) -> &Path {
        &self.spill_path
    }

    /// Snapshot of the captured content; flushes the spill file if any.
    pub fn finish(&self) -> Result<CapturedOutput> {
        let mut state = self.lock();
        if let Some(error) = &state.error {
            return Err(SandboxError::Process(format!(
                "{} capture failed: {}",
                self.stream.as_str(),
                error
            )));
        }
        let length = state.length;
        match state.file.as_mut() {
            Some(file) => {
                file.flush()?;
                Ok(CapturedOutput::File {
                    path: self.spill_path.clone(),
                    length,
                })
            }
            None => Ok(CapturedOutput::InMemory(state.buffer.clone())),
        }
    }

    /// Captured content and integrity, keeping partial content when storing it failed.
    pub fn finalize(&self) -> (CapturedOutput, OutputIntegrity) {
        match self.finish() {
            Ok(output) => (output, self.integrity()),
            Err(e) => {
                log::warn!("{} kept partial content: {}", self.stream.as_str(), e);
                let state = self.lock();
                let partial = match state.file {
                    Some(_) => CapturedOutput::File {
                        path: self.spill_path.clone(),
                        length: state.length,
                    },
                    None => CapturedOutput::InMemory(state.buffer.clone()),
                };
                (partial, OutputIntegrity::CaptureError)
            }
        }
    }

    /// Read `source` line by line until EOF on a detached thread.
    ///
    /// A final line without a newline is captured without one.
    pub fn spawn_reader<R: Read + Send + 'static>(self: &Arc<Self>, source: R) -> JoinHandle<()> {
        let accumulator = Arc::clone(self);
        thread::spawn(move || {
            let mut reader = BufReader::new(source);
            let mut bytes = Vec::new();
            loop {
                bytes.clear();
                match reader.read_until(b'\n', &mut bytes) {
                    Ok(0) => break,
                    Ok(_) => {
                        let appended = match bytes.strip_suffix(b"\n") {
                            Some(line) => {
                                let text = String::from_utf8_lossy(line);
                                accumulator.append(text.trim_end_matches('\r'), true)
                            }
                            None => accumulator.append(&String::from_utf8_lossy(&bytes), false),
                        };
                        if !appended {
                            return;
                        }
                    }
                    Err(e) => {
                        log::warn!("reading {} failed: {}", accumulator.stream.as_str(), e);
                        accumulator.signal(OutputIntegrity::ReadError);
                        return;
                    }
                }
            }
            accumulator.complete();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(dir: &Path, max: usize) -> OutputLimits {
        OutputLimits {
            max_in_memory_bytes: max,
            spill_directory: dir.to_path_buf(),
        }
    }

    #[test]
    fn small_output_stays_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let acc = OutputAccumulator::new(OutputStream::Stdout, &limits(dir.path(), 1024), "Pip1");
        acc.append_line("hello");
        acc.append_line("world");
        acc.complete();
        assert!(acc.wait(Duration::from_millis(1)));
        assert_eq!(acc.finish().unwrap(), CapturedOutput::InMemory("hello\nworld\n".to_string()));
        assert_eq!(acc.integrity(), OutputIntegrity::Complete);
    }

    #[test]
    fn large_output_spills_to_named_file() {
        let dir = tempfile::tempdir().unwrap();
        let acc = OutputAccumulator::new(OutputStream::Stderr, &limits(dir.path(), 8), "Pip2");
        acc.append_line("12345");
        acc.append_line("67890");
        acc.complete();

        let captured = acc.finish().unwrap();
        assert!(captured.is_spilled());
        assert_eq!(captured.len(), 12);
        assert_eq!(captured.read_value().unwrap(), "12345\n67890\n");
        assert_eq!(acc.spill_path(), dir.path().join("Pip2.stderr.txt"));
    }

    #[test]
    fn forced_completion_rejects_later_lines() {
        let dir = tempfile::tempdir().unwrap();
        let acc = OutputAccumulator::new(OutputStream::Stdout, &limits(dir.path(), 1024), "Pip3");
        acc.append_line("before");
        acc.force_complete();
        acc.complete();
        assert!(!acc.append_line("after"));
        assert_eq!(acc.integrity(), OutputIntegrity::ForcedCompletion);
        assert_eq!(acc.finish().unwrap().read_value().unwrap(), "before\n");
    }

    #[test]
    fn wait_times_out_while_open() {
        let dir = tempfile::tempdir().unwrap();
        let acc = OutputAccumulator::new(OutputStream::Stdout, &limits(dir.path(), 1024), "Pip4");
        assert!(!acc.wait(Duration::from_millis(10)));
    }

    #[test]
    fn reader_thread_completes_on_eof() {
        let dir = tempfile::tempdir().unwrap();
        let acc = OutputAccumulator::new(OutputStream::Stdout, &limits(dir.path(), 1024), "Pip5");
        let handle = acc.spawn_reader(std::io::Cursor::new(b"a\r\nb\nc".to_vec()));
        handle.join().unwrap();
        assert!(acc.wait(Duration::from_secs(1)));
        assert_eq!(acc.finish().unwrap().read_value().unwrap(), "a\nb\nc");
    }

    #[test]
    fn trailing_newline_is_kept_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let acc = OutputAccumulator::new(OutputStream::Stdout, &limits(dir.path(), 4), "Pip6");
        let handle = acc.spawn_reader(std::io::Cursor::new(b"first line\nlast".to_vec()));
        handle.join().unwrap();
        let captured = acc.finish().unwrap();
        assert!(captured.is_spilled());
        assert_eq!(captured.len(), 15);
        assert_eq!(captured.read_value().unwrap(), "first line\nlast");
    }

    #[test]
    fn failed_spill_keeps_partial_content_and_flags_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let acc = OutputAccumulator::new(OutputStream::Stderr, &limits(&blocker, 4), "Pip7");
        acc.append_line("12345");
        acc.complete();

        assert!(acc.finish().is_err());
        let (captured, integrity) = acc.finalize();
        assert_eq!(captured, CapturedOutput::InMemory("12345\n".to_string()));
        assert_eq!(integrity, OutputIntegrity::CaptureError);
    }
}
