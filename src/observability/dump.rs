/// Process-tree diagnostics captured before a kill
///
/// Dump writing is serialized process-wide through `DUMP_LOCK`. Dumping is
/// best-effort: callers record the error on the result and carry on.
use crate::config::types::{Result, SandboxError};
use crate::utils::procfs;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

static DUMP_LOCK: once_cell::sync::Lazy<Mutex<()>> = once_cell::sync::Lazy::new(|| Mutex::new(()));

/// Diagnostics capture for a process and its descendants
pub trait ProcessDumper: Send + Sync {
    fn dump_process_and_children(&self, pid: u32, output_dir: &Path) -> Result<()>;
}

/// Writes one `<pid>.dump.txt` per process from /proc.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcfsDumper;

impl ProcfsDumper {
    fn render(pid: u32) -> Option<String> {
        let base = Path::new("/proc").join(pid.to_string());
        let status = fs::read_to_string(base.join("status")).ok()?;

        let mut out = String::new();
        let _ = writeln!(out, "pid: {}", pid);
        let _ = writeln!(out, "cmdline: {}", procfs::command_line(pid).unwrap_or_default());
        if let Some(exe) = procfs::executable(pid) {
            let _ = writeln!(out, "exe: {}", exe);
        }
        if let Ok(wchan) = fs::read_to_string(base.join("wchan")) {
            let _ = writeln!(out, "wchan: {}", wchan.trim());
        }
        let _ = writeln!(out, "\n[status]\n{}", status.trim_end());
        // Kernel stacks need CAP_SYS_ADMIN on most systems.
        if let Ok(stack) = fs::read_to_string(base.join("stack")) {
            let _ = writeln!(out, "\n[stack]\n{}", stack.trim_end());
        }
        Some(out)
    }
}

impl ProcessDumper for ProcfsDumper {
    fn dump_process_and_children(&self, pid: u32, output_dir: &Path) -> Result<()> {
        let _guard = DUMP_LOCK
            .lock()
            .map_err(|_| SandboxError::Dump("dump lock poisoned".to_string()))?;

        fs::create_dir_all(output_dir).map_err(|e| {
            SandboxError::Dump(format!("cannot create {}: {}", output_dir.display(), e))
        })?;

        let primary = Self::render(pid)
            .ok_or_else(|| {
                SandboxError::Dump(format!("process {} is not readable in /proc", pid))
            })?;
        write_dump(output_dir, pid, &primary)?;

        for child in procfs::descendants(pid) {
            match Self::render(child) {
                Some(content) => write_dump(output_dir, child, &content)?,
                None => log::debug!("descendant {} exited before it could be dumped", child),
            }
        }
        Ok(())
    }
}

fn write_dump(output_dir: &Path, pid: u32, content: &str) -> Result<()> {
    let path = output_dir.join(format!("{}.dump.txt", pid));
    fs::write(&path, content)
        .map_err(|e| SandboxError::Dump(format!("cannot write {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dumps_own_process() {
        let dir = tempfile::tempdir().unwrap();
        let pid = std::process::id();
        ProcfsDumper.dump_process_and_children(pid, dir.path()).unwrap();

        let content = fs::read_to_string(dir.path().join(format!("{}.dump.txt", pid))).unwrap();
        assert!(content.starts_with(&format!("pid: {}", pid)));
        assert!(content.contains("[status]"));
    }

    #[test]
    fn missing_process_is_a_dump_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProcfsDumper
            .dump_process_and_children(u32::MAX - 1, dir.path())
            .unwrap_err();
        assert!(matches!(err, SandboxError::Dump(_)));
    }
}
