//! CPU usage sampling from procfs.

use log::debug;
use std::fs;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Processes tracked at once by [`CpuMonitor::process`].
pub const MAX_TRACKED_PROCS: usize = 8;

#[derive(Debug, Clone, Copy)]
struct ProcSlot {
    pid: i32,
    ticks: u64,
    /// System total at the previous observation, 0 until one exists.
    seen_total: u64,
    percent: f32,
}

/// Jiffy counters from the aggregate `cpu` line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CpuTimes {
    total: u64,
    idle: u64,
}

pub struct CpuMonitor {
    proc_root: PathBuf,
    prev: CpuTimes,
    total_percent: f32,
    slots: [Option<ProcSlot>; MAX_TRACKED_PROCS],
}

impl CpuMonitor {
    pub fn new() -> Self {
        Self::with_proc_root("/proc")
    }

    /// Monitor reading from an alternative procfs mount.
    pub fn with_proc_root(root: impl Into<PathBuf>) -> Self {
        let proc_root = root.into();
        let prev = match read_cpu_times(&proc_root) {
            Ok(times) => times,
            Err(e) => {
                debug!("no CPU baseline: {}", e);
                CpuTimes::default()
            }
        };
        Self {
            proc_root,
            prev,
            total_percent: 0.0,
            slots: [None; MAX_TRACKED_PROCS],
        }
    }

    /// Take a new system sample. Returns the busy percentage since the
    /// previous one. A failed read keeps the previous state.
    pub fn update(&mut self) -> Result<f32> {
        let now = read_cpu_times(&self.proc_root)?;
        let total = now.total.saturating_sub(self.prev.total);
        let idle = now.idle.saturating_sub(self.prev.idle);

        if total > 0 {
            self.total_percent = 100.0 * (1.0 - idle as f32 / total as f32);
        }
        self.prev = now;
        Ok(self.total_percent)
    }

    /// System-wide busy percentage at the last [`update`](Self::update).
    pub fn total(&self) -> f32 {
        self.total_percent
    }

    /// CPU share of `pid` since its previous observation, measured against
    /// the system total of the latest update.
    ///
    /// `-1.0` when the pid is invalid, the process is gone or every slot is
    /// taken; `0.0` the first time a process is seen.
    pub fn process(&mut self, pid: i32) -> f32 {
        if pid <= 0 {
            return -1.0;
        }

        let ticks = match read_proc_ticks(&self.proc_root, pid) {
            Ok(ticks) => ticks,
            Err(_) => {
                self.release(pid);
                return -1.0;
            }
        };

        let total = self.prev.total;
        let Some(slot) = self.slot_for(pid) else {
            return -1.0;
        };

        let total_delta = total.saturating_sub(slot.seen_total);
        if slot.seen_total > 0 && total_delta > 0 {
            let proc_delta = ticks.saturating_sub(slot.ticks);
            slot.percent = 100.0 * proc_delta as f32 / total_delta as f32;
        }
        slot.ticks = ticks;
        slot.seen_total = total;
        slot.percent
    }

    fn slot_for(&mut self, pid: i32) -> Option<&mut ProcSlot> {
        let index = match self.slots.iter().position(|s| s.map_or(false, |s| s.pid == pid)) {
            Some(i) => i,
            None => {
                let free = self.slots.iter().position(Option::is_none)?;
                self.slots[free] = Some(ProcSlot {
                    pid,
                    ticks: 0,
                    seen_total: 0,
                    percent: 0.0,
                });
                free
            }
        };
        self.slots[index].as_mut()
    }

    fn release(&mut self, pid: i32) {
        for slot in self.slots.iter_mut() {
            if slot.map_or(false, |s| s.pid == pid) {
                *slot = None;
            }
        }
    }
}

impl Default for CpuMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn malformed(message: String) -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, message))
}

fn read_cpu_times(root: &std::path::Path) -> Result<CpuTimes> {
    let stat = fs::read_to_string(root.join("stat"))?;
    let line = stat
        .lines()
        .next()
        .ok_or_else(|| malformed("empty stat".to_string()))?;
    parse_cpu_line(line).ok_or_else(|| malformed(format!("bad cpu line: {}", line)))
}

/// `cpu  user nice system idle iowait irq softirq steal ...`
fn parse_cpu_line(line: &str) -> Option<CpuTimes> {
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let values: Vec<u64> = fields
        .take(8)
        .map_while(|f| f.parse().ok())
        .collect();
    if values.len() < 4 {
        return None;
    }

    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        total: values.iter().sum(),
        idle,
    })
}

fn read_proc_ticks(root: &std::path::Path, pid: i32) -> Result<u64> {
    let stat = fs::read_to_string(root.join(pid.to_string()).join("stat"))?;
    parse_proc_ticks(&stat).ok_or_else(|| malformed(format!("bad stat for pid {}", pid)))
}

/// utime + stime from `/proc/<pid>/stat`. The command name may contain
/// spaces and parentheses, so fields are counted from the last `)`.
fn parse_proc_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace().skip(11);
    let utime: u64 = fields.next()?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn write_stat(root: &Path, user: u64, idle: u64) {
        fs::write(
            root.join("stat"),
            format!("cpu  {} 0 0 {} 0 0 0 0 0 0\ncpu0 1 2 3 4\n", user, idle),
        )
        .unwrap();
    }

    fn write_proc(root: &Path, pid: i32, utime: u64, stime: u64) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("stat"),
            format!(
                "{} (my (odd) proc) S 1 1 1 0 -1 4194304 10 0 0 0 {} {} 0 0 20 0 1 0 100 0 0\n",
                pid, utime, stime
            ),
        )
        .unwrap();
    }

    #[test]
    fn test_parse_cpu_line() {
        let times = parse_cpu_line("cpu  10 20 30 40 50 60 70 80 90 100").unwrap();
        assert_eq!(times.total, 10 + 20 + 30 + 40 + 50 + 60 + 70 + 80);
        assert_eq!(times.idle, 90);

        // Old kernels stop after idle.
        assert_eq!(parse_cpu_line("cpu 1 2 3 4").unwrap(), CpuTimes { total: 10, idle: 4 });
        assert!(parse_cpu_line("cpu 1 2").is_none());
        assert!(parse_cpu_line("cpu0 1 2 3 4").is_none());
    }

    #[test]
    fn test_parse_proc_ticks_skips_comm() {
        let stat = "42 (a) b) c) R 1 1 1 0 -1 0 0 0 0 0 7 5 0 0\n";
        assert_eq!(parse_proc_ticks(stat), Some(12));
        assert_eq!(parse_proc_ticks("42 (short) R 1"), None);
    }

    #[test]
    fn test_total_from_deltas() {
        let dir = tempfile::tempdir().unwrap();
        write_stat(dir.path(), 100, 100);
        let mut monitor = CpuMonitor::with_proc_root(dir.path());
        assert_eq!(monitor.total(), 0.0);

        write_stat(dir.path(), 175, 125);
        let busy = monitor.update().unwrap();
        assert!((busy - 75.0).abs() < 0.01);
        assert_eq!(monitor.total(), busy);

        // No progress keeps the previous reading.
        assert_eq!(monitor.update().unwrap(), busy);
    }

    #[test]
    fn test_process_share() {
        let dir = tempfile::tempdir().unwrap();
        write_stat(dir.path(), 0, 0);
        write_proc(dir.path(), 321, 10, 10);
        let mut monitor = CpuMonitor::with_proc_root(dir.path());

        write_stat(dir.path(), 100, 100);
        monitor.update().unwrap();
        assert_eq!(monitor.process(321), 0.0);

        write_stat(dir.path(), 200, 200);
        write_proc(dir.path(), 321, 30, 20);
        monitor.update().unwrap();
        let share = monitor.process(321);
        assert!(share.is_finite());
        assert!((share - 15.0).abs() < 0.01, "{}", share);
    }

    #[test]
    fn test_process_invalid_or_gone() {
        let dir = tempfile::tempdir().unwrap();
        write_stat(dir.path(), 1, 1);
        let mut monitor = CpuMonitor::with_proc_root(dir.path());

        assert_eq!(monitor.process(0), -1.0);
        assert_eq!(monitor.process(-5), -1.0);
        assert_eq!(monitor.process(999), -1.0);

        write_proc(dir.path(), 50, 1, 1);
        assert_eq!(monitor.process(50), 0.0);
        fs::remove_dir_all(dir.path().join("50")).unwrap();
        assert_eq!(monitor.process(50), -1.0);
        assert!(monitor.slots.iter().all(Option::is_none));
    }

    #[test]
    fn test_slot_table_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        write_stat(dir.path(), 1, 1);
        for pid in 1..=(MAX_TRACKED_PROCS as i32 + 1) {
            write_proc(dir.path(), pid, 1, 1);
        }
        let mut monitor = CpuMonitor::with_proc_root(dir.path());

        for pid in 1..=MAX_TRACKED_PROCS as i32 {
            assert_eq!(monitor.process(pid), 0.0);
        }
        assert_eq!(monitor.process(MAX_TRACKED_PROCS as i32 + 1), -1.0);

        // A departed process frees its slot.
        fs::remove_dir_all(dir.path().join("1")).unwrap();
        assert_eq!(monitor.process(1), -1.0);
        assert_eq!(monitor.process(MAX_TRACKED_PROCS as i32 + 1), 0.0);
    }

    #[test]
    fn test_missing_proc_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = CpuMonitor::with_proc_root(dir.path().join("nope"));
        assert!(monitor.update().is_err());
        assert_eq!(monitor.total(), 0.0);
    }
}
