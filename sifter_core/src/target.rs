use crate::cancel::CancelToken;
use crate::config::{EnvOverrides, IgnoreCategory, IgnoreSet};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Time a target that is expected to close itself is given to do so.
const EXPECT_CLOSE_WAIT: Duration = Duration::from_secs(30);
/// Time a hung target gets to write its crash dump after SIGABRT.
const ABORT_DUMP_WAIT: Duration = Duration::from_secs(1);
/// Default bound for a coverage dump.
pub const COVERAGE_DUMP_TIMEOUT: Duration = Duration::from_secs(15);
const IDLE_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);
const COVERAGE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum TargetError {
    #[error("Target launch failed: {0}")]
    Launch(String),
    #[error("Target launch timed out: {0}")]
    LaunchTimeout(String),
    #[error("Failed to send {signal} to pid {pid}: {source}")]
    Signal {
        pid: u32,
        signal: Signal,
        source: nix::Error,
    },
    #[error("Target I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why the target process is no longer running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// `close()` was requested.
    Closed,
    /// The target exited on its own without failing.
    Exited,
    /// The target crashed or exited abnormally.
    Alert,
    /// A resource-limit watchdog stopped the target.
    Worker,
}

/// Outcome of one trial's health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureClass {
    None,
    Failure,
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    Idle,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Closed,
    Launching,
    Running,
}

/// The process-automation engine driving one target instance.
///
/// A fresh instance must report `Some(ExitReason::Closed)` until its
/// first launch.
pub trait TargetProcess: Send {
    fn launch(&mut self, url: &str, env: &EnvOverrides) -> Result<(), TargetError>;
    fn close(&mut self);
    /// Closes the target and releases everything it owns on disk.
    fn cleanup(&mut self);
    fn exit_reason(&self) -> Option<ExitReason>;
    fn is_healthy(&mut self) -> bool;
    fn is_running(&mut self) -> bool;
    /// Waits up to `timeout` for the target to exit. Returns `true` if it did.
    fn wait(&mut self, timeout: Duration) -> bool;
    /// CPU usage per process of the target tree, in percent.
    fn cpu_usage(&mut self) -> Vec<(u32, f32)>;
    fn pid(&self) -> Option<u32>;
    fn child_pids(&mut self) -> Vec<u32>;
    /// Files currently held open by the target tree.
    fn open_files(&mut self) -> Vec<PathBuf> {
        Vec::new()
    }
    fn available_artifacts(&self) -> Vec<String>;
    fn save_artifacts(&mut self, dest: &Path) -> Result<(), TargetError>;
    fn send_signal(&mut self, pid: u32, signal: Signal) -> Result<(), TargetError> {
        nix::sys::signal::kill(Pid::from_raw(pid as i32), signal).map_err(|source| {
            TargetError::Signal {
                pid,
                signal,
                source,
            }
        })
    }
}

struct Inner<P> {
    process: P,
    rl_countdown: u32,
}

/// Owns one automated target and classifies how each trial ended.
///
/// Every operation goes through a single lock, so an asynchronous abort
/// cannot interleave with a trial's own close calls.
pub struct TargetController<P: TargetProcess> {
    inner: Mutex<Inner<P>>,
    launching: AtomicBool,
    relaunch: u32,
}

impl<P: TargetProcess> TargetController<P> {
    /// `relaunch` is the number of trials after which the target is
    /// closed and relaunched; 0 disables the policy.
    pub fn new(process: P, relaunch: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                process,
                rl_countdown: relaunch,
            }),
            launching: AtomicBool::new(false),
            relaunch,
        }
    }

    pub fn launch(&self, url: &str, env: &EnvOverrides) -> Result<(), TargetError> {
        self.launching.store(true, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        inner.rl_countdown = self.relaunch;
        log::debug!("launching target at {}", url);
        let result = inner.process.launch(url, env);
        if let Err(e) = &result {
            log::error!("Target launch error: {}", e);
            inner.process.close();
        }
        self.launching.store(false, Ordering::SeqCst);
        result
    }

    pub fn close(&self) {
        self.inner.lock().process.close();
    }

    pub fn cleanup(&self) {
        self.inner.lock().process.cleanup();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().process.exit_reason().is_some()
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.lock().process.is_healthy()
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().process.is_running()
    }

    pub fn state(&self) -> TargetState {
        if self.launching.load(Ordering::SeqCst) {
            return TargetState::Launching;
        }
        if self.is_closed() {
            TargetState::Closed
        } else {
            TargetState::Running
        }
    }

    pub fn cpu_usage(&self) -> Vec<(u32, f32)> {
        self.inner.lock().process.cpu_usage()
    }

    /// The target will close itself after the current trial.
    pub fn expect_close(&self) -> bool {
        self.relaunch > 0 && self.inner.lock().rl_countdown <= 1
    }

    /// Samples CPU usage for up to `window`. Busy as soon as one process is
    /// at or above `threshold`; idle once the window passes or the target
    /// exits. A cancelled `stop` ends the poll early as busy.
    pub fn poll_for_idle(&self, threshold: f32, window: Duration, stop: &CancelToken) -> PollResult {
        let start = Instant::now();
        while start.elapsed() < window {
            {
                let mut inner = self.inner.lock();
                if inner
                    .process
                    .cpu_usage()
                    .iter()
                    .any(|(_, cpu)| *cpu >= threshold)
                {
                    return PollResult::Busy;
                }
                if !inner.process.is_running() {
                    return PollResult::Idle;
                }
            }
            if stop.wait_timeout(IDLE_SAMPLE_INTERVAL) {
                return PollResult::Busy;
            }
        }
        log::info!("Process utilized <= {}% CPU for {:?}", threshold, window);
        PollResult::Idle
    }

    pub fn detect_failure(&self, ignore: &IgnoreSet, was_timeout: bool) -> FailureClass {
        let expect_close = self.expect_close();
        let mut inner = self.inner.lock();
        let process = &mut inner.process;
        if expect_close && !was_timeout {
            process.wait(EXPECT_CLOSE_WAIT);
        }
        let healthy = process.is_healthy();
        if !healthy || was_timeout {
            if process.is_running() {
                log::debug!("terminating target...");
                if was_timeout
                    && !ignore.contains(&IgnoreCategory::Timeout)
                    && cfg!(target_os = "linux")
                {
                    Self::abort_busiest(process);
                    process.wait(ABORT_DUMP_WAIT);
                }
            }
            process.close();
        }

        if !healthy {
            match process.exit_reason() {
                Some(ExitReason::Closed) => {
                    log::info!("target.close() was called");
                    FailureClass::None
                }
                Some(ExitReason::Exited) => {
                    log::info!("Target closed itself");
                    FailureClass::None
                }
                Some(ExitReason::Worker) if Self::worker_ignored(process, ignore) => {
                    FailureClass::Ignored
                }
                reason => {
                    log::debug!("failure detected, exit reason: {:?}", reason);
                    FailureClass::Failure
                }
            }
        } else if was_timeout {
            log::info!("Timeout detected");
            if ignore.contains(&IgnoreCategory::Timeout) {
                FailureClass::Ignored
            } else {
                FailureClass::Failure
            }
        } else {
            FailureClass::None
        }
    }

    fn worker_ignored(process: &P, ignore: &IgnoreSet) -> bool {
        let artifacts = process.available_artifacts();
        for category in ignore {
            let Some(artifact) = category.worker_artifact() else {
                continue;
            };
            if artifacts.iter().any(|a| a == artifact) {
                match category {
                    IgnoreCategory::Memory => log::info!("Memory limit exceeded"),
                    IgnoreCategory::LogLimit => log::info!("Log size limit exceeded"),
                    IgnoreCategory::Timeout => {}
                }
                return true;
            }
        }
        false
    }

    /// Sends SIGABRT to the busiest process so a hang leaves a crash dump.
    fn abort_busiest(process: &mut P) {
        let mut usage = process.cpu_usage();
        usage.sort_by(|a, b| b.1.total_cmp(&a.1));
        if let Some((pid, cpu)) = usage.first() {
            log::debug!("sending SIGABRT to pid: {}, cpu: {:.2}%", pid, cpu);
            if let Err(e) = process.send_signal(*pid, Signal::SIGABRT) {
                log::warn!("{}", e);
            }
        }
    }

    pub fn save_logs(&self, dest: &Path) -> Result<(), TargetError> {
        self.inner.lock().process.save_artifacts(dest)
    }

    /// Counts one trial against the relaunch budget and closes the target
    /// once it is spent.
    pub fn check_relaunch(&self) {
        if self.relaunch == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        inner.rl_countdown = inner.rl_countdown.saturating_sub(1);
        if inner.rl_countdown == 0 && inner.process.exit_reason().is_none() {
            log::info!("Triggering target relaunch");
            inner.process.close();
        }
    }

    /// Asks a healthy target to flush coverage counters (SIGUSR1) and waits
    /// for the `.gcda` writes to finish. Never fails; problems are logged.
    pub fn dump_coverage(&self, timeout: Duration) {
        let mut inner = self.inner.lock();
        let process = &mut inner.process;
        let Some(pid) = process.pid() else {
            log::debug!("Skipping coverage dump");
            return;
        };
        if !process.is_healthy() {
            log::debug!("Skipping coverage dump");
            return;
        }
        for child in process.child_pids() {
            log::debug!("Sending SIGUSR1 to {} (child)", child);
            if let Err(e) = process.send_signal(child, Signal::SIGUSR1) {
                log::debug!("{}", e);
            }
        }
        log::debug!("Sending SIGUSR1 to {} (parent)", pid);
        if let Err(e) = process.send_signal(pid, Signal::SIGUSR1) {
            log::warn!("Coverage dump aborted: {}", e);
            return;
        }

        let start = Instant::now();
        let mut gcda_found = false;
        loop {
            let gcda_open = process
                .open_files()
                .iter()
                .any(|f| f.extension().is_some_and(|ext| ext == "gcda"));
            if gcda_open {
                gcda_found = true;
            } else if gcda_found {
                log::debug!("gcda dump took {:.2?}", start.elapsed());
                return;
            }
            if start.elapsed() >= timeout {
                if gcda_found {
                    log::warn!("gcda files still open after {:.2?}", timeout);
                } else {
                    log::warn!("No gcda files seen after {:.2?}", timeout);
                }
                return;
            }
            if !process.is_healthy() {
                log::warn!("Target failure during dump_coverage()");
                return;
            }
            std::thread::sleep(COVERAGE_POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockProcess, mock_state};

    fn ignore(categories: &[IgnoreCategory]) -> IgnoreSet {
        categories.iter().copied().collect()
    }

    fn launched() -> (TargetController<MockProcess>, crate::test_utils::SharedMock) {
        let state = mock_state();
        let controller = TargetController::new(MockProcess::new(state.clone()), 0);
        controller.launch("http://127.0.0.1/test.html", &EnvOverrides::new()).unwrap();
        (controller, state)
    }

    #[test]
    fn fresh_controller_is_closed_until_launch() {
        let state = mock_state();
        let controller = TargetController::new(MockProcess::new(state.clone()), 10);
        assert!(controller.is_closed());
        assert_eq!(controller.state(), TargetState::Closed);

        let mut env = EnvOverrides::new();
        env.insert("MOZ_GDB".to_string(), None);
        controller.launch("http://127.0.0.1/test.html", &env).unwrap();
        assert_eq!(controller.state(), TargetState::Running);
        let s = state.lock();
        assert_eq!(s.launches, 1);
        assert_eq!(s.urls, vec!["http://127.0.0.1/test.html".to_string()]);
        assert_eq!(s.envs[0].get("MOZ_GDB"), Some(&None));
    }

    #[test]
    fn failed_launch_leaves_target_closed() {
        let state = mock_state();
        state.lock().launch_failures = 1;
        let controller = TargetController::new(MockProcess::new(state.clone()), 0);
        let err = controller.launch("http://x", &EnvOverrides::new()).unwrap_err();
        assert!(matches!(err, TargetError::Launch(_)));
        assert!(controller.is_closed());
    }

    #[test]
    fn healthy_without_timeout_is_none() {
        let (controller, state) = launched();
        assert_eq!(
            controller.detect_failure(&IgnoreSet::new(), false),
            FailureClass::None
        );
        assert!(state.lock().running);
        assert_eq!(state.lock().closes, 0);
    }

    #[test]
    fn explicit_close_and_self_exit_are_none() {
        let (controller, state) = launched();
        {
            let mut s = state.lock();
            s.running = false;
            s.reason = Some(ExitReason::Closed);
        }
        assert_eq!(
            controller.detect_failure(&IgnoreSet::new(), false),
            FailureClass::None
        );

        let (controller, state) = launched();
        {
            let mut s = state.lock();
            s.running = false;
            s.reason = Some(ExitReason::Exited);
        }
        assert_eq!(
            controller.detect_failure(&IgnoreSet::new(), false),
            FailureClass::None
        );
    }

    #[test]
    fn expected_close_waits_for_target_to_exit_itself() {
        let state = mock_state();
        let controller = TargetController::new(MockProcess::new(state.clone()), 1);
        controller.launch("http://x", &EnvOverrides::new()).unwrap();
        assert!(controller.expect_close());
        state.lock().exit_on_wait = true;
        assert_eq!(
            controller.detect_failure(&IgnoreSet::new(), false),
            FailureClass::None
        );
        let s = state.lock();
        assert_eq!(s.waits, vec![EXPECT_CLOSE_WAIT]);
        assert_eq!(s.reason, Some(ExitReason::Exited));
        // The target closed itself; nothing was left to close.
        assert_eq!(s.closes, 1);
        assert!(s.signals.is_empty());
    }

    #[test]
    fn no_close_wait_when_not_expected_or_on_timeout() {
        let (controller, state) = launched();
        controller.detect_failure(&IgnoreSet::new(), false);
        assert!(state.lock().waits.is_empty());

        let state = mock_state();
        let controller = TargetController::new(MockProcess::new(state.clone()), 1);
        controller.launch("http://x", &EnvOverrides::new()).unwrap();
        controller.detect_failure(&ignore(&[IgnoreCategory::Timeout]), true);
        assert!(!state.lock().waits.contains(&EXPECT_CLOSE_WAIT));
    }

    #[test]
    fn crash_is_failure() {
        let (controller, state) = launched();
        crate::test_utils::apply_crash(&state, "boom");
        assert_eq!(
            controller.detect_failure(&ignore(&[IgnoreCategory::Timeout]), false),
            FailureClass::Failure
        );
    }

    #[test]
    fn ignored_resource_limit_with_artifact_is_ignored() {
        let (controller, state) = launched();
        {
            let mut s = state.lock();
            s.running = false;
            s.reason = Some(ExitReason::Worker);
            s.artifacts.push("worker_memory_usage".to_string());
        }
        assert_eq!(
            controller.detect_failure(&ignore(&[IgnoreCategory::Memory]), false),
            FailureClass::Ignored
        );
        // The category must be ignored for the exit to be ignored.
        assert_eq!(
            controller.detect_failure(&ignore(&[IgnoreCategory::LogLimit]), false),
            FailureClass::Failure
        );
    }

    #[test]
    fn resource_limit_without_artifact_is_failure() {
        let (controller, state) = launched();
        {
            let mut s = state.lock();
            s.running = false;
            s.reason = Some(ExitReason::Worker);
        }
        assert_eq!(
            controller.detect_failure(&ignore(&[IgnoreCategory::LogLimit]), false),
            FailureClass::Failure
        );
    }

    #[test]
    fn unignored_timeout_aborts_busiest_process_then_fails() {
        let (controller, state) = launched();
        state.lock().cpu = vec![(1000, 3.0), (1001, 97.0), (1002, 40.0)];
        assert_eq!(
            controller.detect_failure(&IgnoreSet::new(), true),
            FailureClass::Failure
        );
        let s = state.lock();
        if cfg!(target_os = "linux") {
            assert_eq!(s.signals, vec![(1001, Signal::SIGABRT)]);
        }
        assert!(!s.running);
        assert_eq!(s.reason, Some(ExitReason::Closed));
    }

    #[test]
    fn ignored_timeout_closes_without_abort() {
        let (controller, state) = launched();
        state.lock().cpu = vec![(1000, 99.0)];
        assert_eq!(
            controller.detect_failure(&ignore(&[IgnoreCategory::Timeout]), true),
            FailureClass::Ignored
        );
        let s = state.lock();
        assert!(s.signals.is_empty());
        assert!(!s.running);
    }

    #[test]
    fn poll_for_idle_busy_on_high_cpu() {
        let (controller, state) = launched();
        state.lock().cpu = vec![(1000, 1.0), (1001, 50.0)];
        let stop = CancelToken::new();
        assert_eq!(
            controller.poll_for_idle(25.0, Duration::from_secs(5), &stop),
            PollResult::Busy
        );
    }

    #[test]
    fn poll_for_idle_idle_after_quiet_window() {
        let (controller, state) = launched();
        state.lock().cpu = vec![(1000, 1.0)];
        let stop = CancelToken::new();
        let start = Instant::now();
        assert_eq!(
            controller.poll_for_idle(25.0, Duration::from_millis(250), &stop),
            PollResult::Idle
        );
        assert!(start.elapsed() >= Duration::from_millis(250));
        assert!(state.lock().cpu_samples >= 2);
    }

    #[test]
    fn poll_for_idle_returns_early_when_target_exits() {
        let (controller, state) = launched();
        state.lock().running = false;
        let stop = CancelToken::new();
        let start = Instant::now();
        assert_eq!(
            controller.poll_for_idle(25.0, Duration::from_secs(30), &stop),
            PollResult::Idle
        );
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn check_relaunch_closes_after_budget() {
        let state = mock_state();
        let controller = TargetController::new(MockProcess::new(state.clone()), 2);
        controller.launch("http://x", &EnvOverrides::new()).unwrap();
        assert!(!controller.expect_close());
        controller.check_relaunch();
        assert!(!controller.is_closed());
        assert!(controller.expect_close());
        controller.check_relaunch();
        assert!(controller.is_closed());
        assert_eq!(state.lock().closes, 1);

        controller.launch("http://x", &EnvOverrides::new()).unwrap();
        assert!(!controller.expect_close());
    }

    #[test]
    fn dump_coverage_signals_children_then_parent() {
        let (controller, state) = launched();
        {
            let mut s = state.lock();
            s.children = vec![1001, 1002];
            s.open_files = vec![PathBuf::from("/tmp/cov/a.gcda")];
            s.close_files_after_reads = 2;
        }
        controller.dump_coverage(Duration::from_secs(5));
        let s = state.lock();
        assert_eq!(
            s.signals,
            vec![
                (1001, Signal::SIGUSR1),
                (1002, Signal::SIGUSR1),
                (1000, Signal::SIGUSR1)
            ]
        );
    }

    #[test]
    fn dump_coverage_swallows_signal_failures_and_skips_dead_target() {
        let (controller, state) = launched();
        state.lock().signal_error = true;
        controller.dump_coverage(Duration::from_millis(200));
        assert!(state.lock().signals.is_empty());

        state.lock().running = false;
        state.lock().signal_error = false;
        controller.dump_coverage(Duration::from_millis(200));
        assert!(state.lock().signals.is_empty());
    }
}
