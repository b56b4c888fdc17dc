use crate::cancel::CancelToken;
use crate::target::{PollResult, TargetController, TargetProcess};
use std::time::Duration;

/// Pause before sampling again after a busy window.
const BUSY_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdleSettings {
    /// CPU percentage below which a process counts as idle.
    pub threshold: f32,
    /// Length of one sampling window.
    pub poll: Duration,
    /// Grace period before sampling starts.
    pub timeout: Duration,
}

/// Watches a running trial and reports when the target has gone quiet.
pub struct IdleMonitor<'a, P: TargetProcess> {
    target: &'a TargetController<P>,
    settings: IdleSettings,
}

impl<'a, P: TargetProcess> IdleMonitor<'a, P> {
    pub fn new(target: &'a TargetController<P>, settings: IdleSettings) -> Self {
        Self { target, settings }
    }

    /// Runs until `done` is cancelled, the target stops running, or an idle
    /// window is observed. Only the last case cancels `idle`.
    pub fn run(&self, done: &CancelToken, idle: &CancelToken) {
        if done.wait_timeout(self.settings.timeout) {
            return;
        }
        log::debug!("idle monitor polling every {:?}", self.settings.poll);
        while !done.is_cancelled() {
            let poll = self
                .target
                .poll_for_idle(self.settings.threshold, self.settings.poll, done);
            if poll == PollResult::Idle {
                if self.target.is_running() {
                    log::info!("Target idle, stopping trial early");
                    idle.cancel();
                }
                return;
            }
            if !self.target.is_running() || done.wait_timeout(BUSY_PAUSE) {
                return;
            }
        }
    }
}
