use crate::config::EnvOverrides;
use crate::server::{
    ContentServer, DynamicProducer, OptionalFiles, ServeOutcome, ServeStatus, ServerError,
    ServerFactory, ServerMap,
};
use crate::target::{ExitReason, TargetError, TargetProcess};
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const MOCK_PID: u32 = 1000;

pub const UAF_LOG: &str = "\
==4242==ERROR: AddressSanitizer: heap-use-after-free on address 0x602000000010
    #0 0x1 in nsFrame::Reflow() /src/layout/nsFrame.cpp:10:1
    #1 0x2 in PresShell::DoReflow() /src/layout/PresShell.cpp:20:1
";

pub const SEGV_LOG: &str = "\
==4242==ERROR: AddressSanitizer: SEGV on unknown address 0x000000000000
    #0 0x1 in js::gc::Mark() /src/js/gc/Marking.cpp:5:1
    #1 0x2 in js::gc::Collect() /src/js/gc/GC.cpp:9:1
";

/// What the mock target does while a candidate is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOutcome {
    /// Loads and stays healthy.
    Healthy,
    /// Crashes and leaves the given sanitizer log behind.
    Crash(&'static str),
    /// Stays alive until the serve times out.
    Hang,
    /// Goes quiet; the serve lasts until the caller stops it.
    Idle,
    /// Exits cleanly on its own.
    Exit,
    /// Gets stopped by a resource watchdog that left the named artifact.
    Worker(&'static str),
}

/// State shared by the mock process, the mock server and the test body.
#[derive(Debug)]
pub struct MockTarget {
    pub running: bool,
    pub healthy: bool,
    pub reason: Option<ExitReason>,
    pub launches: usize,
    pub launch_failures: usize,
    /// Makes the target close itself while `wait` is called.
    pub exit_on_wait: bool,
    pub waits: Vec<Duration>,
    pub closes: usize,
    pub cleanups: usize,
    pub urls: Vec<String>,
    pub envs: Vec<EnvOverrides>,
    pub cpu: Vec<(u32, f32)>,
    pub cpu_samples: usize,
    pub children: Vec<u32>,
    pub open_files: Vec<PathBuf>,
    /// Clears `open_files` after this many reads; 0 keeps them open.
    pub close_files_after_reads: usize,
    pub signals: Vec<(u32, Signal)>,
    pub signal_error: bool,
    pub artifacts: Vec<String>,
    pub crash_log: Option<String>,
    pub outcomes: VecDeque<MockOutcome>,
    pub serves: usize,
    pub served_roots: Vec<PathBuf>,
    pub served_optional: Vec<bool>,
    pub served_placeholder: Vec<bool>,
    pub server_timeouts: Vec<Duration>,
    pub server_closes: usize,
    pub redirects: Vec<(String, String, bool)>,
    pub reject_redirects: bool,
    pub dynamics: Vec<String>,
}

impl Default for MockTarget {
    fn default() -> Self {
        Self {
            running: false,
            healthy: false,
            reason: Some(ExitReason::Closed),
            launches: 0,
            launch_failures: 0,
            exit_on_wait: false,
            waits: Vec::new(),
            closes: 0,
            cleanups: 0,
            urls: Vec::new(),
            envs: Vec::new(),
            cpu: Vec::new(),
            cpu_samples: 0,
            children: Vec::new(),
            open_files: Vec::new(),
            close_files_after_reads: 0,
            signals: Vec::new(),
            signal_error: false,
            artifacts: Vec::new(),
            crash_log: None,
            outcomes: VecDeque::new(),
            serves: 0,
            served_roots: Vec::new(),
            served_optional: Vec::new(),
            served_placeholder: Vec::new(),
            server_timeouts: Vec::new(),
            server_closes: 0,
            redirects: Vec::new(),
            reject_redirects: false,
            dynamics: Vec::new(),
        }
    }
}

pub type SharedMock = Arc<Mutex<MockTarget>>;

pub fn mock_state() -> SharedMock {
    Arc::new(Mutex::new(MockTarget::default()))
}

pub fn apply_crash(state: &SharedMock, log: &str) {
    let mut s = state.lock();
    s.running = false;
    s.healthy = false;
    s.reason = Some(ExitReason::Alert);
    s.crash_log = Some(log.to_string());
}

pub struct MockProcess {
    state: SharedMock,
}

impl MockProcess {
    pub fn new(state: SharedMock) -> Self {
        Self { state }
    }
}

impl TargetProcess for MockProcess {
    fn launch(&mut self, url: &str, env: &EnvOverrides) -> Result<(), TargetError> {
        let mut s = self.state.lock();
        if s.launch_failures > 0 {
            s.launch_failures -= 1;
            return Err(TargetError::Launch("mock launch failure".to_string()));
        }
        s.running = true;
        s.healthy = true;
        s.reason = None;
        s.launches += 1;
        s.crash_log = None;
        s.artifacts.clear();
        s.urls.push(url.to_string());
        s.envs.push(env.clone());
        Ok(())
    }

    fn close(&mut self) {
        let mut s = self.state.lock();
        s.closes += 1;
        if s.running {
            s.running = false;
            s.healthy = false;
            s.reason = Some(ExitReason::Closed);
        } else if s.reason.is_none() {
            s.reason = Some(ExitReason::Closed);
        }
    }

    fn cleanup(&mut self) {
        self.close();
        self.state.lock().cleanups += 1;
    }

    fn exit_reason(&self) -> Option<ExitReason> {
        self.state.lock().reason
    }

    fn is_healthy(&mut self) -> bool {
        let s = self.state.lock();
        s.running && s.healthy
    }

    fn is_running(&mut self) -> bool {
        self.state.lock().running
    }

    fn wait(&mut self, timeout: Duration) -> bool {
        let mut s = self.state.lock();
        s.waits.push(timeout);
        if s.exit_on_wait && s.running {
            s.running = false;
            s.healthy = false;
            s.reason = Some(ExitReason::Exited);
        }
        !s.running
    }

    fn cpu_usage(&mut self) -> Vec<(u32, f32)> {
        let mut s = self.state.lock();
        s.cpu_samples += 1;
        if s.running { s.cpu.clone() } else { Vec::new() }
    }

    fn pid(&self) -> Option<u32> {
        self.state.lock().running.then_some(MOCK_PID)
    }

    fn child_pids(&mut self) -> Vec<u32> {
        self.state.lock().children.clone()
    }

    fn open_files(&mut self) -> Vec<PathBuf> {
        let mut s = self.state.lock();
        let files = s.open_files.clone();
        if s.close_files_after_reads > 0 {
            s.close_files_after_reads -= 1;
            if s.close_files_after_reads == 0 {
                s.open_files.clear();
            }
        }
        files
    }

    fn available_artifacts(&self) -> Vec<String> {
        self.state.lock().artifacts.clone()
    }

    fn save_artifacts(&mut self, dest: &Path) -> Result<(), TargetError> {
        let s = self.state.lock();
        std::fs::create_dir_all(dest)?;
        std::fs::write(
            dest.join("log_stderr.txt"),
            s.crash_log.as_deref().unwrap_or("[mock] target output\n"),
        )?;
        for artifact in &s.artifacts {
            std::fs::write(dest.join(format!("log_{artifact}.txt")), artifact)?;
        }
        Ok(())
    }

    fn send_signal(&mut self, pid: u32, signal: Signal) -> Result<(), TargetError> {
        let mut s = self.state.lock();
        if s.signal_error {
            return Err(TargetError::Signal {
                pid,
                signal,
                source: nix::Error::ESRCH,
            });
        }
        s.signals.push((pid, signal));
        Ok(())
    }
}

pub struct MockServerFactory {
    state: SharedMock,
}

impl MockServerFactory {
    pub fn new(state: SharedMock) -> Self {
        Self { state }
    }
}

impl ServerFactory for MockServerFactory {
    fn create(&self, _root: &Path, timeout: Duration) -> Result<Box<dyn ContentServer>, ServerError> {
        self.state.lock().server_timeouts.push(timeout);
        Ok(Box::new(MockServer {
            state: self.state.clone(),
            map: ServerMap::new(),
        }))
    }
}

struct MockServer {
    state: SharedMock,
    map: ServerMap,
}

impl ContentServer for MockServer {
    fn url_for(&self, path: &str) -> String {
        format!("http://127.0.0.1:8000/{}", path.trim_start_matches('/'))
    }

    fn register_redirect(&mut self, path: &str, target: &str, required: bool) -> Result<(), ServerError> {
        if self.state.lock().reject_redirects {
            return Err(ServerError::Unsupported(format!("redirect {path:?}")));
        }
        self.map.set_redirect(path, target, required)?;
        self.state
            .lock()
            .redirects
            .push((path.to_string(), target.to_string(), required));
        Ok(())
    }

    fn register_dynamic(
        &mut self,
        path: &str,
        producer: DynamicProducer,
        mime_type: &str,
    ) -> Result<(), ServerError> {
        self.map.set_dynamic(path, producer, mime_type)?;
        self.state.lock().dynamics.push(path.to_string());
        Ok(())
    }

    fn serve_directory(
        &mut self,
        root: &Path,
        keep_serving: &dyn Fn() -> bool,
        optional: Option<&dyn OptionalFiles>,
    ) -> Result<ServeOutcome, ServerError> {
        let has_placeholder = std::fs::read_dir(root)?.filter_map(Result::ok).any(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with(".sifter-garbage-")
        });
        let outcome = {
            let mut s = self.state.lock();
            s.serves += 1;
            s.served_roots.push(root.to_path_buf());
            s.served_optional.push(optional.is_some());
            s.served_placeholder.push(has_placeholder);
            s.outcomes.pop_front().unwrap_or(MockOutcome::Healthy)
        };
        let status = match outcome {
            MockOutcome::Healthy => ServeStatus::Completed,
            MockOutcome::Crash(log) => {
                apply_crash(&self.state, log);
                ServeStatus::Completed
            }
            MockOutcome::Hang => ServeStatus::TimedOut,
            MockOutcome::Exit => {
                let mut s = self.state.lock();
                s.running = false;
                s.healthy = false;
                s.reason = Some(ExitReason::Exited);
                ServeStatus::Completed
            }
            MockOutcome::Worker(artifact) => {
                let mut s = self.state.lock();
                s.running = false;
                s.healthy = false;
                s.reason = Some(ExitReason::Worker);
                s.artifacts.push(artifact.to_string());
                ServeStatus::Completed
            }
            MockOutcome::Idle => {
                self.state.lock().cpu = vec![(MOCK_PID, 0.5)];
                // The state lock must not be held here: the predicate
                // queries the target, which takes it too.
                let deadline = Instant::now() + Duration::from_secs(20);
                let mut status = ServeStatus::TimedOut;
                while Instant::now() < deadline {
                    if !keep_serving() {
                        status = ServeStatus::Completed;
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                status
            }
        };
        Ok(ServeOutcome {
            status,
            served: Vec::new(),
        })
    }

    fn close(&mut self) -> Result<(), ServerError> {
        self.state.lock().server_closes += 1;
        Ok(())
    }
}
