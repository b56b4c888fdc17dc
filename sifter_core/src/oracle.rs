use crate::artifacts::{ArtifactError, logs_dir, replay_artifacts};
use crate::cache::{CacheEntry, InMemoryResultCache, ResultCache};
use crate::cancel::CancelToken;
use crate::config::{EnvOverrides, RunConfig};
use crate::crash::{CrashError, CrashReport, CrashReporter, SIGNATURE_FRAMES, Signature};
use crate::monitor::{IdleMonitor, IdleSettings};
use crate::server::{
    AllowAllExcept, ContentServer, OptionalFiles, ServeStatus, ServerError, ServerFactory,
};
use crate::target::{
    COVERAGE_DUMP_TIMEOUT, FailureClass, TargetController, TargetError, TargetProcess, TargetState,
};
use crate::testcase::{Testcase, TestcaseError, content_hash};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Launch attempts per trial before giving up.
pub const LAUNCH_ATTEMPTS: u32 = 4;
/// Extra serve time in harness mode so the client-side timeout fires first.
const HARNESS_GRACE: Duration = Duration::from_secs(10);
const HARNESS_PAGE: &[u8] = include_bytes!("harness.html");
const TRIAL_RECORD: &str = "sifter_trial.json";
/// Reference signature adopted from a trial, saved next to its logs.
const SIGNATURE_FILE: &str = "sifter_signature.json";

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("evaluate() called before init()")]
    NotInitialized,
    #[error("Target failed to launch after {attempts} attempts: {source}")]
    LaunchFailed { attempts: u32, source: TargetError },
    #[error("Trial I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to encode trial record: {0}")]
    Record(#[from] serde_json::Error),
    #[error(transparent)]
    Testcase(#[from] TestcaseError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error(transparent)]
    Crash(#[from] CrashError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

pub type ArtifactCallback = Box<dyn FnMut(&Path) + Send>;

#[derive(Serialize)]
struct TrialRecord<'a> {
    failure: FailureClass,
    elapsed_secs: f64,
    signature: Option<&'a str>,
    stack_hash: Option<&'a str>,
    interesting: bool,
}

enum Judgement {
    NoCrash,
    Match,
    Different,
}

/// Compares a crash against the session's reference signature, adopting it
/// when none exists yet and `any_crash` is off.
fn judge(reference: &mut Option<Signature>, any_crash: bool, report: &CrashReport) -> Judgement {
    if !report.has_crash() {
        return Judgement::NoCrash;
    }
    if any_crash {
        return Judgement::Match;
    }
    match reference {
        Some(signature) if signature.matches(report) => Judgement::Match,
        Some(_) => Judgement::Different,
        None => {
            let signature = report.build_signature(SIGNATURE_FRAMES);
            log::debug!("adopting reference signature {:?}", signature);
            *reference = Some(signature);
            Judgement::Match
        }
    }
}

/// Decides whether a reduced testcase still reproduces the original crash.
///
/// One oracle serves a whole reduction session: `init` once, `evaluate` per
/// candidate, `cleanup` at the end. Trials never overlap.
pub struct ReductionOracle<P: TargetProcess> {
    config: RunConfig,
    target: TargetController<P>,
    servers: Box<dyn ServerFactory>,
    server: Option<Box<dyn ContentServer>>,
    reporter: Box<dyn CrashReporter>,
    cache: Box<dyn ResultCache>,
    testcase: Option<Testcase>,
    reference: Option<Signature>,
    skipped: u32,
    env: EnvOverrides,
    harness: Vec<u8>,
    interesting_cb: Option<ArtifactCallback>,
    alt_crash_cb: Option<ArtifactCallback>,
}

impl<P: TargetProcess> ReductionOracle<P> {
    pub fn new(
        config: RunConfig,
        target: TargetController<P>,
        servers: Box<dyn ServerFactory>,
        reporter: Box<dyn CrashReporter>,
    ) -> Self {
        Self {
            config,
            target,
            servers,
            server: None,
            reporter,
            cache: Box::new(InMemoryResultCache::new()),
            testcase: None,
            reference: None,
            skipped: 0,
            env: EnvOverrides::new(),
            harness: HARNESS_PAGE.to_vec(),
            interesting_cb: None,
            alt_crash_cb: None,
        }
    }

    pub fn with_cache(mut self, cache: Box<dyn ResultCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_env(mut self, env: EnvOverrides) -> Self {
        self.env = env;
        self
    }

    /// Starts the session with a known reference signature.
    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.reference = Some(signature);
        self
    }

    pub fn with_harness(mut self, page: Vec<u8>) -> Self {
        self.harness = page;
        self
    }

    /// Called with the prefix of every candidate found interesting.
    pub fn on_interesting(mut self, cb: ArtifactCallback) -> Self {
        self.interesting_cb = Some(cb);
        self
    }

    /// Called with the prefix of every trial that crashed differently.
    pub fn on_alt_crash(mut self, cb: ArtifactCallback) -> Self {
        self.alt_crash_cb = Some(cb);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.reference.as_ref()
    }

    pub fn target(&self) -> &TargetController<P> {
        &self.target
    }

    pub fn init(&mut self, testcase: Testcase) {
        log::debug!(
            "reducing {:?}, landing page {:?} in {:?}",
            testcase.reduce_file(),
            testcase.landing_page(),
            testcase.www_root()
        );
        if self.testcase.as_ref() != Some(&testcase) {
            self.release_server();
        }
        self.testcase = Some(testcase);
        self.skipped = 0;
        self.cache.clear();
    }

    pub fn evaluate(&mut self, prefix: &Path) -> Result<bool, OracleError> {
        let reduce_file = self
            .testcase
            .as_ref()
            .ok_or(OracleError::NotInitialized)?
            .reduce_file()
            .to_path_buf();

        if self.skipped < self.config.skip {
            self.skipped += 1;
            log::info!("Skipping ({}/{})", self.skipped, self.config.skip);
            return Ok(false);
        }

        let key = if self.config.result_cache {
            Some(content_hash(&reduce_file)?)
        } else {
            None
        };
        if let Some(entry) = key.as_ref().and_then(|k| self.cache.get(k)) {
            if entry.verdict {
                log::info!("Interesting (cached)");
                let copied = replay_artifacts(&entry.artifact_prefix, prefix)?;
                log::debug!("replayed {} artifacts from {:?}", copied, entry.artifact_prefix);
            } else {
                log::info!("Uninteresting (cached)");
            }
            return Ok(entry.verdict);
        }

        let max_trials = self.config.max_trials();
        let min_crashes = self.config.min_crashes;
        let mut crashes = 0;
        for trial in 0..max_trials {
            if max_trials - trial < min_crashes - crashes {
                log::debug!("{} crashes no longer reachable, stopping", min_crashes);
                break;
            }
            if self.run_trial(prefix)? {
                crashes += 1;
                if crashes >= min_crashes {
                    if let Some(cb) = self.interesting_cb.as_mut() {
                        cb(prefix);
                    }
                    if let Some(key) = key {
                        self.cache.insert(key, CacheEntry::new(true, prefix));
                    }
                    return Ok(true);
                }
            }
        }
        if let Some(key) = key {
            self.cache.insert(key, CacheEntry::new(false, prefix));
        }
        Ok(false)
    }

    /// Shrinks the adaptive timeouts toward `elapsed`. A shorter
    /// `iter_timeout` retires the current server, whose timeout is fixed.
    pub fn update_timeouts(&mut self, elapsed: Duration) {
        if self.config.shrink_timeouts(elapsed) {
            self.release_server();
        }
    }

    /// Releases the server and the target. Safe to call at any point,
    /// including before `init`.
    pub fn cleanup(&mut self) {
        self.release_server();
        self.target.cleanup();
    }

    fn release_server(&mut self) {
        if let Some(mut server) = self.server.take() {
            if let Err(e) = server.close() {
                log::error!("Failed to close content server: {}", e);
            }
        }
    }

    fn ensure_server(&mut self, testcase: &Testcase) -> Result<(), OracleError> {
        if self.server.is_some() {
            return Ok(());
        }
        let timeout = if self.config.no_harness {
            self.config.iter_timeout
        } else {
            self.config.iter_timeout + HARNESS_GRACE
        };
        let mut server = self.servers.create(testcase.www_root(), timeout)?;
        if !self.config.no_harness {
            let page = self.harness.clone();
            let wired = server
                .register_dynamic("harness", Box::new(move || page.clone()), "text/html")
                .and_then(|()| server.register_redirect("first_test", testcase.landing_page(), true));
            if let Err(e) = wired {
                if let Err(close_err) = server.close() {
                    log::error!("Failed to close content server: {}", close_err);
                }
                return Err(e.into());
            }
        }
        self.server = Some(server);
        Ok(())
    }

    fn location(&self, server: &dyn ContentServer, testcase: &Testcase) -> String {
        if self.config.no_harness {
            server.url_for(testcase.landing_page())
        } else {
            format!(
                "{}#timeout={}",
                server.url_for("harness"),
                self.config.iter_timeout.as_millis()
            )
        }
    }

    fn launch_target(&self, url: &str) -> Result<(), OracleError> {
        let mut attempt = 1;
        loop {
            match self.target.launch(url, &self.env) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < LAUNCH_ATTEMPTS => {
                    log::warn!("Launch attempt {}/{} failed: {}", attempt, LAUNCH_ATTEMPTS, e);
                    thread::sleep(self.config.launch_retry_delay);
                    attempt += 1;
                }
                Err(source) => {
                    return Err(OracleError::LaunchFailed {
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }

    /// Runs the target once against the current candidate.
    fn run_trial(&mut self, prefix: &Path) -> Result<bool, OracleError> {
        let testcase = self.testcase.clone().ok_or(OracleError::NotInitialized)?;
        self.ensure_server(&testcase)?;
        if self.target.state() == TargetState::Closed {
            let url = match self.server.as_deref() {
                Some(server) => self.location(server, &testcase),
                None => return Err(OracleError::NotInitialized),
            };
            self.launch_target(&url)?;
        }

        let Self {
            config,
            target,
            server,
            reporter,
            reference,
            alt_crash_cb,
            ..
        } = self;
        let Some(server) = server.as_mut() else {
            return Err(OracleError::NotInitialized);
        };
        let target: &TargetController<P> = target;
        let settings = IdleSettings {
            threshold: config.idle_threshold,
            poll: config.idle_poll,
            timeout: config.idle_timeout,
        };
        let done = CancelToken::new();
        let idle = CancelToken::new();
        let mut interesting_after = None;

        let verdict = thread::scope(|scope| -> Result<bool, OracleError> {
            let _stop_monitor = done.cancel_on_drop();
            scope.spawn(|| IdleMonitor::new(target, settings).run(&done, &idle));

            let start = Instant::now();
            let keep_serving = || !idle.is_cancelled() && target.is_healthy();
            let outcome = if config.no_harness {
                // Never requested, so serving lasts until timeout or target exit.
                let placeholder = tempfile::Builder::new()
                    .prefix(".sifter-garbage-")
                    .suffix(".bin")
                    .tempfile_in(testcase.www_root())
                    .map_err(|source| OracleError::Io {
                        path: testcase.www_root().to_path_buf(),
                        source,
                    })?;
                let outcome = server.serve_directory(testcase.www_root(), &keep_serving, None);
                drop(placeholder);
                outcome?
            } else {
                server.register_redirect("next_test", testcase.landing_page(), true)?;
                let optional = AllowAllExcept(testcase.landing_page().to_string());
                server.serve_directory(
                    testcase.www_root(),
                    &keep_serving,
                    Some(&optional as &dyn OptionalFiles),
                )?
            };
            let elapsed = start.elapsed();

            let class = target.detect_failure(&config.ignore, outcome.status == ServeStatus::TimedOut);
            let verdict = match class {
                FailureClass::Failure => {
                    target.close();
                    let logs = save_trial_logs(target, prefix)?;
                    let report = reporter.build_report(&logs)?;
                    let short_sig = report.short_signature();
                    let stack_hash = report.has_crash().then(|| report.stack_hash());
                    let adopting = reference.is_none();
                    let verdict = match judge(reference, config.any_crash, &report) {
                        Judgement::NoCrash => {
                            log::info!("Uninteresting: no crash detected");
                            false
                        }
                        Judgement::Match => {
                            log::info!("Interesting: {}", short_sig);
                            if let Some(signature) = reference.as_ref().filter(|_| adopting) {
                                signature.save(&logs.join(SIGNATURE_FILE))?;
                            }
                            interesting_after = Some(elapsed);
                            true
                        }
                        Judgement::Different => {
                            log::info!("Uninteresting: different signature: {}", short_sig);
                            if let Some(cb) = alt_crash_cb.as_mut() {
                                cb(prefix);
                            }
                            false
                        }
                    };
                    let record = TrialRecord {
                        failure: class,
                        elapsed_secs: elapsed.as_secs_f64(),
                        signature: Some(&short_sig),
                        stack_hash: stack_hash.as_deref(),
                        interesting: verdict,
                    };
                    write_trial_record(&logs, &record)?;
                    verdict
                }
                FailureClass::Ignored => {
                    log::info!("Uninteresting: ignored");
                    target.close();
                    let logs = save_trial_logs(target, prefix)?;
                    let record = TrialRecord {
                        failure: class,
                        elapsed_secs: elapsed.as_secs_f64(),
                        signature: None,
                        stack_hash: None,
                        interesting: false,
                    };
                    write_trial_record(&logs, &record)?;
                    false
                }
                FailureClass::None => {
                    log::info!("Uninteresting: no failure detected");
                    false
                }
            };

            if config.coverage && target.is_running() {
                target.dump_coverage(COVERAGE_DUMP_TIMEOUT);
            }
            target.check_relaunch();
            Ok(verdict)
        })?;

        if let Some(elapsed) = interesting_after {
            self.update_timeouts(elapsed);
        }
        Ok(verdict)
    }
}

/// Saves the target's logs to `<prefix>_logs`, replacing what an earlier
/// trial with the same prefix left there.
fn save_trial_logs<P: TargetProcess>(
    target: &TargetController<P>,
    prefix: &Path,
) -> Result<PathBuf, OracleError> {
    let logs = logs_dir(prefix);
    let io_err = |source| OracleError::Io {
        path: logs.clone(),
        source,
    };
    if logs.exists() {
        fs::remove_dir_all(&logs).map_err(io_err)?;
    }
    fs::create_dir_all(&logs).map_err(io_err)?;
    target.save_logs(&logs)?;
    Ok(logs)
}

fn write_trial_record(logs: &Path, record: &TrialRecord<'_>) -> Result<(), OracleError> {
    let path = logs.join(TRIAL_RECORD);
    fs::write(&path, serde_json::to_vec_pretty(record)?)
        .map_err(|source| OracleError::Io { path, source })
}
