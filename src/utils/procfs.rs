/// Process tree discovery through /proc
use crate::report::process_table::ReportedProcess;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

const PROC_ROOT: &str = "/proc";

/// Fields of `/proc/<pid>/stat` used by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: u32,
    pub state: char,
    pub parent_pid: u32,
    pub process_group: u32,
    pub user_ticks: u64,
    pub kernel_ticks: u64,
}

impl ProcStat {
    pub fn is_zombie(&self) -> bool {
        self.state == 'Z' || self.state == 'X'
    }
}

/// Parse one stat line; the command name may contain spaces and parentheses.
pub fn parse_stat(content: &str) -> Option<ProcStat> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    let pid = content[..open].trim().parse().ok()?;
    let rest: Vec<&str> = content.get(close + 1..)?.split_whitespace().collect();
    if rest.len() < 13 {
        return None;
    }
    Some(ProcStat {
        pid,
        state: rest[0].chars().next()?,
        parent_pid: rest[1].parse().ok()?,
        process_group: rest[2].parse().ok()?,
        user_ticks: rest[11].parse().ok()?,
        kernel_ticks: rest[12].parse().ok()?,
    })
}

pub fn read_stat(pid: u32) -> Option<ProcStat> {
    let content = fs::read_to_string(Path::new(PROC_ROOT).join(pid.to_string()).join("stat")).ok()?;
    parse_stat(&content)
}

/// Every numeric entry of /proc
pub fn list_pids() -> Vec<u32> {
    let entries = match fs::read_dir(PROC_ROOT) {
        Ok(entries) => entries,
        Err(e) => {
            log::debug!("cannot scan {}: {}", PROC_ROOT, e);
            return Vec::new();
        }
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().and_then(|name| name.parse().ok()))
        .collect()
}

/// Live descendants of `root`, found through the parent chain and `root`'s
/// process group. `root` itself is excluded.
pub fn descendants(root: u32) -> Vec<u32> {
    let stats: Vec<ProcStat> = list_pids()
        .into_iter()
        .filter_map(read_stat)
        .filter(|stat| !stat.is_zombie())
        .collect();
    descendants_in(root, &stats)
}

pub(crate) fn descendants_in(root: u32, stats: &[ProcStat]) -> Vec<u32> {
    let mut tree: HashSet<u32> = HashSet::new();
    tree.insert(root);
    let mut found = Vec::new();

    for stat in stats {
        if stat.pid != root && stat.process_group == root && tree.insert(stat.pid) {
            found.push(stat.pid);
        }
    }

    loop {
        let mut grew = false;
        for stat in stats {
            if stat.pid != root && tree.contains(&stat.parent_pid) && tree.insert(stat.pid) {
                found.push(stat.pid);
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }
    found.sort_unstable();
    found
}

pub fn command_line(pid: u32) -> Option<String> {
    let raw = fs::read(Path::new(PROC_ROOT).join(pid.to_string()).join("cmdline")).ok()?;
    let parts: Vec<String> = raw
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect();
    Some(parts.join(" "))
}

pub fn executable(pid: u32) -> Option<String> {
    fs::read_link(Path::new(PROC_ROOT).join(pid.to_string()).join("exe"))
        .ok()
        .map(|path| path.display().to_string())
}

pub fn clock_ticks_per_second() -> u64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as u64
    } else {
        100
    }
}

fn ticks_to_duration(ticks: u64) -> Duration {
    let per_second = clock_ticks_per_second();
    Duration::from_secs(ticks / per_second)
        + Duration::from_nanos((ticks % per_second) * 1_000_000_000 / per_second)
}

/// Snapshot of a live process for result reporting
pub fn reported_process(pid: u32) -> ReportedProcess {
    let mut process = ReportedProcess::new(
        pid,
        executable(pid).unwrap_or_default(),
        command_line(pid).unwrap_or_default(),
    );
    if let Some(stat) = read_stat(pid) {
        process.parent_process_id = stat.parent_pid;
        process.user_time = ticks_to_duration(stat.user_ticks);
        process.kernel_time = ticks_to_duration(stat.kernel_ticks);
    }
    process
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(pid: u32, ppid: u32, pgid: u32) -> ProcStat {
        ProcStat {
            pid,
            state: 'S',
            parent_pid: ppid,
            process_group: pgid,
            user_ticks: 0,
            kernel_ticks: 0,
        }
    }

    #[test]
    fn parses_names_with_spaces_and_parens() {
        let line = "1234 (my (odd) name) S 1 1234 1234 0 -1 4194560 100 0 0 0 7 3 0 0 20 0 1 0 555 0 0";
        let parsed = parse_stat(line).unwrap();
        assert_eq!(parsed.pid, 1234);
        assert_eq!(parsed.state, 'S');
        assert_eq!(parsed.parent_pid, 1);
        assert_eq!(parsed.process_group, 1234);
        assert_eq!(parsed.user_ticks, 7);
        assert_eq!(parsed.kernel_ticks, 3);
        assert!(parse_stat("garbage").is_none());
    }

    #[test]
    fn descendants_follow_parents_and_process_group() {
        let stats = vec![
            stat(10, 1, 10),
            stat(11, 10, 10),
            stat(12, 11, 10),
            // reparented to init but still in the group
            stat(13, 1, 10),
            stat(14, 13, 14),
            stat(20, 1, 20),
        ];
        assert_eq!(descendants_in(10, &stats), vec![11, 12, 13, 14]);
        assert!(descendants_in(20, &stats).is_empty());
    }

    #[test]
    fn own_process_is_readable() {
        let pid = std::process::id();
        let stat = read_stat(pid).unwrap();
        assert_eq!(stat.pid, pid);
        assert!(list_pids().contains(&pid));
        assert!(!command_line(pid).unwrap().is_empty());
    }
}
