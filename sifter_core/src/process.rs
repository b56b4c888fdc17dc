use crate::config::{EnvOverrides, TargetSettings};
use crate::target::{ExitReason, TargetError, TargetProcess};
use nix::sys::signal::{Signal, kill};
use nix::unistd::{Pid, SysconfVar, sysconf};
use std::collections::{HashMap, VecDeque};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

const URL_PLACEHOLDER: &str = "{url}";
const STDOUT_LOG: &str = "log_stdout.txt";
const STDERR_LOG: &str = "log_stderr.txt";
const LAUNCH_SETTLE: Duration = Duration::from_millis(500);
const CLOSE_GRACE: Duration = Duration::from_secs(5);
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct CommandProcessConfig {
    pub binary: PathBuf,
    /// Arguments; `{url}` is replaced by the launch URL.
    pub args: Vec<String>,
    /// Upper bound on how long a launch waits for the target to be ready.
    pub launch_timeout: Duration,
    /// Output that marks the target as ready. Without one, a launch only
    /// waits for the process to settle.
    pub ready_pattern: Option<String>,
    /// Combined stdout/stderr size limit in bytes, 0 disables.
    pub log_limit: u64,
    /// Resident memory limit of the process tree in bytes, 0 disables.
    pub memory_limit: u64,
}

impl From<&TargetSettings> for CommandProcessConfig {
    fn from(settings: &TargetSettings) -> Self {
        Self {
            binary: settings.binary.clone(),
            args: settings.args.clone(),
            launch_timeout: Duration::from_secs(settings.launch_timeout_secs),
            ready_pattern: settings.ready_pattern.clone(),
            log_limit: settings.log_limit_bytes,
            memory_limit: settings.memory_limit_bytes,
        }
    }
}

/// Runs the target as a plain child process with its output captured into
/// log files.
pub struct CommandProcess {
    config: CommandProcessConfig,
    child: Option<Child>,
    logs: Option<tempfile::TempDir>,
    reason: Option<ExitReason>,
    artifacts: Vec<String>,
    cpu_baseline: Option<CpuSample>,
}

impl CommandProcess {
    pub fn new(config: CommandProcessConfig) -> Self {
        Self {
            config,
            child: None,
            logs: None,
            reason: Some(ExitReason::Closed),
            artifacts: Vec::new(),
            cpu_baseline: None,
        }
    }

    fn command(&self, url: &str, env: &EnvOverrides, logs: &Path) -> Result<Command, TargetError> {
        let mut cmd = Command::new(&self.config.binary);
        for arg in &self.config.args {
            cmd.arg(arg.replace(URL_PLACEHOLDER, url));
        }
        for (key, value) in env {
            match value {
                Some(value) => cmd.env(key, value),
                None => cmd.env_remove(key),
            };
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(File::create(logs.join(STDOUT_LOG))?));
        cmd.stderr(Stdio::from(File::create(logs.join(STDERR_LOG))?));
        Ok(cmd)
    }

    /// Records how the child ended once it has exited. Returns `true` while
    /// the child is alive.
    fn poll_child(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.record_exit(status);
                false
            }
            Err(e) => {
                log::warn!("Error waiting for target process: {}", e);
                false
            }
        }
    }

    fn record_exit(&mut self, status: ExitStatus) {
        if self.reason.is_none() {
            self.reason = Some(if status.success() {
                ExitReason::Exited
            } else {
                log::debug!("target exited with {}", status);
                ExitReason::Alert
            });
        }
    }

    /// Fails the launch if the child already exited abnormally. Returns
    /// `true` once the child is gone.
    fn exited_during_launch(&mut self) -> Result<bool, TargetError> {
        let status = match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(status)) => status,
            Some(Err(e)) => return Err(TargetError::Io(e)),
            None => None,
        };
        let Some(status) = status else {
            return Ok(false);
        };
        if !status.success() {
            self.reason = Some(ExitReason::Alert);
            return Err(TargetError::Launch(format!(
                "{:?} exited during launch with {}",
                self.config.binary, status
            )));
        }
        self.record_exit(status);
        Ok(true)
    }

    fn output_contains(&self, pattern: &str) -> bool {
        let Some(logs) = &self.logs else {
            return false;
        };
        [STDOUT_LOG, STDERR_LOG].iter().any(|name| {
            fs::read_to_string(logs.path().join(name)).is_ok_and(|out| out.contains(pattern))
        })
    }

    fn wait_until_ready(&mut self, pattern: &str) -> Result<(), TargetError> {
        let start = Instant::now();
        loop {
            if self.output_contains(pattern) {
                log::debug!("target ready after {:.2?}", start.elapsed());
                return Ok(());
            }
            if self.exited_during_launch()? {
                return Err(TargetError::Launch(format!(
                    "{:?} exited before printing {:?}",
                    self.config.binary, pattern
                )));
            }
            if start.elapsed() >= self.config.launch_timeout {
                return Err(TargetError::LaunchTimeout(format!(
                    "{:?} did not print {:?} within {:?}",
                    self.config.binary, pattern, self.config.launch_timeout
                )));
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    fn log_size(&self) -> u64 {
        let Some(logs) = &self.logs else {
            return 0;
        };
        [STDOUT_LOG, STDERR_LOG]
            .iter()
            .filter_map(|name| fs::metadata(logs.path().join(name)).ok())
            .map(|m| m.len())
            .sum()
    }

    fn memory_usage(&self) -> u64 {
        self.pid()
            .map(|pid| process_tree(pid).iter().filter_map(|p| resident_bytes(*p)).sum::<u64>())
            .unwrap_or(0)
    }

    /// Stops a child that exceeded a resource limit and leaves an artifact
    /// naming the limit.
    fn stop_for_limit(&mut self, artifact: &str, detail: String) {
        log::info!("{}", detail);
        if let Some(logs) = &self.logs {
            let path = logs.path().join(format!("log_{artifact}.txt"));
            if let Err(e) = fs::write(&path, &detail) {
                log::warn!("Failed to write {:?}: {}", path, e);
            }
        }
        self.artifacts.push(artifact.to_string());
        self.reason = Some(ExitReason::Worker);
        self.kill_child();
    }

    fn check_limits(&mut self) {
        if self.config.log_limit > 0 {
            let size = self.log_size();
            if size > self.config.log_limit {
                self.stop_for_limit(
                    "worker_log_size",
                    format!("Log size limit exceeded: {} > {}", size, self.config.log_limit),
                );
                return;
            }
        }
        if self.config.memory_limit > 0 {
            let usage = self.memory_usage();
            if usage > self.config.memory_limit {
                self.stop_for_limit(
                    "worker_memory_usage",
                    format!(
                        "Memory limit exceeded: {} > {}",
                        usage, self.config.memory_limit
                    ),
                );
            }
        }
    }

    fn kill_child(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        if let Err(e) = child.kill() {
            log::debug!("Failed to kill target process: {}", e);
        }
        if let Err(e) = child.wait() {
            log::warn!("Error reaping target process: {}", e);
        }
    }
}

impl TargetProcess for CommandProcess {
    fn launch(&mut self, url: &str, env: &EnvOverrides) -> Result<(), TargetError> {
        self.close();
        let logs = tempfile::Builder::new().prefix("sifter-logs-").tempdir()?;
        let mut cmd = self.command(url, env, logs.path())?;
        let child = cmd.spawn().map_err(|e| {
            TargetError::Launch(format!("Failed to spawn {:?}: {}", self.config.binary, e))
        })?;
        log::debug!("spawned target pid {}", child.id());
        self.child = Some(child);
        self.logs = Some(logs);
        self.reason = None;
        self.artifacts.clear();
        self.cpu_baseline = None;

        if let Some(pattern) = self.config.ready_pattern.clone() {
            return self.wait_until_ready(&pattern);
        }
        let settle = LAUNCH_SETTLE.min(self.config.launch_timeout);
        let start = Instant::now();
        while start.elapsed() < settle {
            if self.exited_during_launch()? {
                break;
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.poll_child() {
            if let Some(pid) = self.pid() {
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    log::debug!("SIGTERM to {} failed: {}", pid, e);
                }
            }
            // The exit is ours, so the reason is set before the child is reaped.
            self.reason = Some(ExitReason::Closed);
            if !self.wait(CLOSE_GRACE) {
                self.kill_child();
            }
        }
        if self.reason.is_none() {
            self.reason = Some(ExitReason::Closed);
        }
        self.child = None;
    }

    fn cleanup(&mut self) {
        self.close();
        self.logs = None;
    }

    fn exit_reason(&self) -> Option<ExitReason> {
        self.reason
    }

    fn is_healthy(&mut self) -> bool {
        if !self.poll_child() {
            return false;
        }
        self.check_limits();
        self.reason.is_none()
    }

    fn is_running(&mut self) -> bool {
        self.poll_child()
    }

    fn wait(&mut self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if !self.poll_child() {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    /// Usage since the previous call, or over each process's lifetime for
    /// processes seen for the first time. Never sleeps.
    fn cpu_usage(&mut self) -> Vec<(u32, f32)> {
        let Some(pid) = self.pid() else {
            self.cpu_baseline = None;
            return Vec::new();
        };
        let sample = CpuSample::take(&process_tree(pid));
        let usage = sample.usage_since(self.cpu_baseline.as_ref(), clock_ticks() as f32);
        self.cpu_baseline = Some(sample);
        usage
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    fn child_pids(&mut self) -> Vec<u32> {
        match self.pid() {
            Some(pid) => process_tree(pid).into_iter().skip(1).collect(),
            None => Vec::new(),
        }
    }

    fn open_files(&mut self) -> Vec<PathBuf> {
        let Some(pid) = self.pid() else {
            return Vec::new();
        };
        process_tree(pid)
            .into_iter()
            .flat_map(|p| {
                fs::read_dir(format!("/proc/{p}/fd"))
                    .into_iter()
                    .flatten()
                    .filter_map(Result::ok)
                    .filter_map(|fd| fs::read_link(fd.path()).ok())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn available_artifacts(&self) -> Vec<String> {
        self.artifacts.clone()
    }

    fn save_artifacts(&mut self, dest: &Path) -> Result<(), TargetError> {
        fs::create_dir_all(dest)?;
        let Some(logs) = &self.logs else {
            log::debug!("no target logs to save");
            return Ok(());
        };
        for entry in fs::read_dir(logs.path())? {
            let entry = entry?;
            if entry.path().is_file() {
                fs::copy(entry.path(), dest.join(entry.file_name()))?;
            }
        }
        Ok(())
    }
}

impl Drop for CommandProcess {
    fn drop(&mut self) {
        self.kill_child();
    }
}

fn clock_ticks() -> i64 {
    match sysconf(SysconfVar::CLK_TCK) {
        Ok(Some(ticks)) if ticks > 0 => ticks as i64,
        _ => 100,
    }
}

/// `pid` followed by all of its descendants, breadth first.
fn process_tree(pid: u32) -> Vec<u32> {
    let mut tree = Vec::new();
    let mut queue = VecDeque::from([pid]);
    while let Some(current) = queue.pop_front() {
        tree.push(current);
        queue.extend(child_processes(current));
    }
    tree
}

fn child_processes(pid: u32) -> Vec<u32> {
    let Ok(tasks) = fs::read_dir(format!("/proc/{pid}/task")) else {
        return Vec::new();
    };
    tasks
        .filter_map(Result::ok)
        .filter_map(|task| fs::read_to_string(task.path().join("children")).ok())
        .flat_map(|children| {
            children
                .split_whitespace()
                .filter_map(|c| c.parse().ok())
                .collect::<Vec<u32>>()
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcTimes {
    /// utime + stime in clock ticks.
    busy: u64,
    /// Start time in clock ticks after boot; tells reused pids apart.
    started: u64,
}

/// CPU times of a process tree at one instant.
#[derive(Debug)]
struct CpuSample {
    taken: Instant,
    uptime: Option<f32>,
    times: HashMap<u32, ProcTimes>,
}

impl CpuSample {
    /// Processes that are gone by the time they are read are left out.
    fn take(pids: &[u32]) -> Self {
        Self {
            taken: Instant::now(),
            uptime: system_uptime(),
            times: pids
                .iter()
                .filter_map(|p| proc_times(*p).map(|t| (*p, t)))
                .collect(),
        }
    }

    fn usage_since(&self, previous: Option<&CpuSample>, ticks_per_sec: f32) -> Vec<(u32, f32)> {
        let mut usage: Vec<(u32, f32)> = self
            .times
            .iter()
            .map(|(pid, now)| {
                let earlier = previous.and_then(|prev| {
                    let elapsed = self.taken.duration_since(prev.taken).as_secs_f32();
                    prev.times
                        .get(pid)
                        .filter(|t| t.started == now.started && elapsed > 0.0)
                        .map(|t| (t.busy, elapsed))
                });
                let percent = match earlier {
                    Some((busy, elapsed)) => {
                        now.busy.saturating_sub(busy) as f32 / ticks_per_sec / elapsed * 100.0
                    }
                    None => self.lifetime_usage(now, ticks_per_sec),
                };
                (*pid, percent)
            })
            .collect();
        usage.sort_by_key(|(p, _)| *p);
        usage
    }

    fn lifetime_usage(&self, times: &ProcTimes, ticks_per_sec: f32) -> f32 {
        let Some(uptime) = self.uptime else {
            return 0.0;
        };
        let age = uptime - times.started as f32 / ticks_per_sec;
        if age <= 0.0 {
            return 0.0;
        }
        times.busy as f32 / ticks_per_sec / age * 100.0
    }
}

fn proc_times(pid: u32) -> Option<ProcTimes> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat_times(&stat)
}

fn parse_stat_times(stat: &str) -> Option<ProcTimes> {
    // The command name may contain spaces; fields resume after its `)`.
    let (_, rest) = stat.rsplit_once(')')?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let started: u64 = fields.get(19)?.parse().ok()?;
    Some(ProcTimes {
        busy: utime + stime,
        started,
    })
}

fn system_uptime() -> Option<f32> {
    let uptime = fs::read_to_string("/proc/uptime").ok()?;
    uptime.split_whitespace().next()?.parse().ok()
}

fn resident_bytes(pid: u32) -> Option<u64> {
    let status = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    parse_vm_rss(&status)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}
