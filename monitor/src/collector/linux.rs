use super::{ReadError, ProcessCollector, ProcessInfo};
use std::fs;
use std::io;
use std::path::PathBuf;

pub struct LinuxProcessCollector {
    proc_root: PathBuf,
    page_size: u64,
    clock_ticks: u64,
    num_cpus: u64,
}

impl LinuxProcessCollector {
    pub fn new() -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 };
        let clock_ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) as u64 };
        let num_cpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) as u64 }.max(1);
        Self {
            proc_root: PathBuf::from("/proc"),
            page_size: page_size.max(1),
            clock_ticks: clock_ticks.max(1),
            num_cpus,
        }
    }

    fn read(&self, pid: u32, file: &str) -> Result<String, ReadError> {
        let path = self.proc_root.join(pid.to_string()).join(file);
        fs::read_to_string(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ReadError::Gone(pid),
            io::ErrorKind::PermissionDenied => ReadError::AccessDenied(pid),
            // ESRCH shows up when the process exits between open and read
            _ if e.raw_os_error() == Some(libc::ESRCH) => ReadError::Gone(pid),
            _ => ReadError::Malformed(pid, e.to_string()),
        })
    }

    fn parse_process(&self, pid: u32) -> Result<ProcessInfo, ReadError> {
        let stat_content = self.read(pid, "stat")?;

        // comm sits in parentheses and may itself contain spaces or parens
        let open = stat_content.find('(');
        let close = stat_content.rfind(')');
        let (name, rest) = match (open, close) {
            (Some(open), Some(close)) if close > open => (
                stat_content[open + 1..close].to_string(),
                &stat_content[close + 1..],
            ),
            _ => return Err(ReadError::Malformed(pid, "unparseable stat".into())),
        };

        // Fields after comm, starting at field 3 (state)
        let stat_parts: Vec<&str> = rest.split_whitespace().collect();
        if stat_parts.len() < 22 {
            return Err(ReadError::Malformed(pid, "short stat".into()));
        }

        let state = stat_parts[0].chars().next().unwrap_or('?');
        let utime: u64 = stat_parts[11].parse().unwrap_or(0);
        let stime: u64 = stat_parts[12].parse().unwrap_or(0);
        let rss_pages: u64 = stat_parts[21].parse().unwrap_or(0);

        // Zombies keep a stat entry but are no longer running anything
        if state == 'Z' || state == 'X' {
            return Err(ReadError::Gone(pid));
        }

        let cmdline = self
            .read(pid, "cmdline")
            .unwrap_or_default()
            .replace('\0', " ")
            .trim()
            .to_string();

        Ok(ProcessInfo {
            pid,
            name,
            cmdline,
            cpu_ticks: utime + stime,
            rss_bytes: rss_pages * self.page_size,
            state,
        })
    }
}

impl Default for LinuxProcessCollector {
    fn default() -> Self { Self::new() }
}

impl ProcessCollector for LinuxProcessCollector {
    fn pids(&self) -> Vec<u32> {
        let mut pids = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.proc_root) {
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(pid) = name.parse::<u32>() {
                        pids.push(pid);
                    }
                }
            }
        }
        pids
    }

    fn get_process(&self, pid: u32) -> Result<ProcessInfo, ReadError> {
        self.parse_process(pid)
    }

    fn clock_ticks(&self) -> u64 {
        self.clock_ticks
    }

    fn num_cpus(&self) -> u64 {
        self.num_cpus
    }
}
