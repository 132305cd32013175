use crate::AfuError;
use crate::descriptor::WorkElement;
use crate::session::{Accelerator, Session, SessionState};
use afu_common::mmio::RESPONSE_COUNTER;
use std::time::{Duration, Instant};

/// Default number of polls between two progress reports at info level.
pub const DEFAULT_REPORT_EVERY: u64 = 10_000;

/// Bounds and reporting cadence of the completion wait.
///
/// The default waits indefinitely, as the AFU offers no way to cancel a job
/// once it runs. Setting `max_polls` or `timeout` turns an unresponsive
/// accelerator into a [`AfuError::CompletionTimeout`] instead of a hung
/// process.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Give up after this many iterations.
    pub max_polls: Option<u64>,
    /// Give up once this much wall-clock time has passed.
    pub timeout: Option<Duration>,
    /// Emit an info-level progress event on the first poll and every this
    /// many polls after it; 0 disables progress events.
    pub report_every: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_polls: None,
            timeout: None,
            report_every: DEFAULT_REPORT_EVERY,
        }
    }
}

impl PollConfig {
    /// Fails the wait with [`AfuError::CompletionTimeout`] after `max_polls`
    /// iterations.
    pub fn with_max_polls(mut self, max_polls: u64) -> Self {
        self.max_polls = Some(max_polls);
        self
    }

    /// Fails the wait with [`AfuError::CompletionTimeout`] once `timeout`
    /// has elapsed.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the progress cadence; 0 silences progress events.
    pub fn with_report_every(mut self, report_every: u64) -> Self {
        self.report_every = report_every;
        self
    }

    /// Whether poll number `polls` (counting from 1) emits a progress event.
    fn reports_at(&self, polls: u64) -> bool {
        self.report_every != 0 && (polls == 1 || polls % self.report_every == 0)
    }

    fn exhausted(&self, polls: u64, elapsed: Duration) -> bool {
        self.max_polls.is_some_and(|max| polls >= max)
            || self.timeout.is_some_and(|limit| elapsed >= limit)
    }
}

/// Progress of one job as seen by the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Descriptor handed over, wait loop not entered yet.
    Attached,
    /// Inside the wait loop.
    Polling,
    /// The AFU raised the status flag.
    Completed,
    /// The configured bound ran out before the flag was raised.
    TimedOut,
}

/// Summary of a finished wait.
#[derive(Debug, Clone, Copy)]
pub struct PollReport {
    /// Number of loop iterations, each one register read plus one status check.
    pub polls: u64,
    /// Response counter value from the final iteration.
    pub last_counter: u64,
    pub elapsed: Duration,
    pub state: JobState,
}

/// Busy-waits for the AFU to signal completion of the attached job.
///
/// Each iteration reads the response counter register once, then checks the
/// descriptor's status flag with an acquire load. The loop ends in the
/// iteration in which the flag is first seen non-zero. There is no lock and
/// no scheduler suspension: the host thread spins until the accelerator
/// writes the flag.
pub struct CompletionPoller {
    config: PollConfig,
    state: JobState,
}

impl CompletionPoller {
    /// Creates a poller for one job.
    pub fn new(config: PollConfig) -> Self {
        Self {
            config,
            state: JobState::Attached,
        }
    }

    /// Progress of the job as last seen by [`CompletionPoller::wait`].
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Waits for the job attached to `session`.
    ///
    /// # Returns
    ///
    /// The poll report once the status flag is raised. Fails with
    /// [`AfuError::InvalidState`] if nothing is attached, with the backend's
    /// error if a register read fails, and with
    /// [`AfuError::CompletionTimeout`] if a configured bound runs out. On
    /// failure the caller drops the session, which detaches the AFU.
    pub fn wait<A: Accelerator>(
        &mut self,
        session: &mut Session<'_, A>,
    ) -> Result<PollReport, AfuError> {
        if session.job().is_none() || session.state() != SessionState::Attached {
            return Err(AfuError::InvalidState {
                operation: "wait for completion",
                state: session.state(),
            });
        }

        self.state = JobState::Polling;
        let start = Instant::now();
        let mut polls = 0u64;

        loop {
            polls += 1;
            let counter = session.read_register(RESPONSE_COUNTER)?;
            if self.config.reports_at(polls) {
                tracing::info!(polls, counter, "response counter");
            } else {
                tracing::trace!(polls, counter, "response counter");
            }

            if session.job().is_some_and(WorkElement::is_complete) {
                self.state = JobState::Completed;
                let report = PollReport {
                    polls,
                    last_counter: counter,
                    elapsed: start.elapsed(),
                    state: self.state,
                };
                tracing::info!(polls, counter, elapsed = ?report.elapsed, "AFU is done");
                return Ok(report);
            }

            let elapsed = start.elapsed();
            if self.config.exhausted(polls, elapsed) {
                self.state = JobState::TimedOut;
                tracing::error!(polls, counter, ?elapsed, "AFU did not complete in time");
                return Err(AfuError::CompletionTimeout { polls, elapsed });
            }

            std::hint::spin_loop();
        }
    }
}
