//! Job record and its state machine.
//!
//! One `Job` pairs a host with the command to run there. Its state walks a
//! DAG from `Queued` to exactly one terminal state; the classification
//! rules live in [`classify`].

use std::time::{Duration, Instant};

use chrono::{DateTime, Local};

/// Exit code recorded when the SSH child could not be started.
pub const SPAWN_FAILED_EXIT: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Success,
    Failed,
    Timeout,
    Killed,
    Aborted,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Queued | JobState::Running)
    }

    /// Lowercase name used in log footers and status file names.
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Success => "success",
            JobState::Failed => "failed",
            JobState::Timeout => "timeout",
            JobState::Killed => "killed",
            JobState::Aborted => "aborted",
        }
    }

    /// Uppercase label for the dashboard and the summary.
    pub fn label(self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::Success => "SUCCESS",
            JobState::Failed => "FAILED",
            JobState::Timeout => "TIMEOUT",
            JobState::Killed => "KILLED",
            JobState::Aborted => "ABORTED",
        }
    }
}

/// Why a running child was terminated early. The first reason flagged wins;
/// on a tie a kill request dominates the timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    Kill,
    Timeout,
}

/// Terminal state of a job whose child ran to completion or was terminated.
pub fn classify(reason: Option<KillReason>, exit_code: i32) -> JobState {
    match reason {
        Some(KillReason::Kill) => JobState::Killed,
        Some(KillReason::Timeout) => JobState::Timeout,
        None if exit_code == 0 => JobState::Success,
        None => JobState::Failed,
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    /// Opaque identifier handed to SSH (`user@host`, short name, or FQDN).
    pub host: String,
    /// Log file stem; differs from `host` only for duplicate hosts.
    pub log_name: String,
    pub state: JobState,
    pub started_at: Option<Instant>,
    pub ended_at: Option<Instant>,
    pub started_wall: Option<DateTime<Local>>,
    pub ended_wall: Option<DateTime<Local>>,
    /// Defined iff the terminal state is success, failed, timeout or killed.
    pub exit_code: Option<i32>,
    /// Most recent non-empty output line, trimmed.
    pub last_line: String,
}

impl Job {
    pub fn new(host: String, log_name: String) -> Self {
        Self {
            host,
            log_name,
            state: JobState::Queued,
            started_at: None,
            ended_at: None,
            started_wall: None,
            ended_wall: None,
            exit_code: None,
            last_line: String::new(),
        }
    }

    /// `queued -> running`, once the child has been spawned.
    pub fn mark_running(&mut self, wall: DateTime<Local>) {
        debug_assert_eq!(self.state, JobState::Queued);
        self.state = JobState::Running;
        self.started_at = Some(Instant::now());
        self.started_wall = Some(wall);
    }

    /// `running -> {success,failed,timeout,killed}`.
    pub fn mark_done(&mut self, state: JobState, exit_code: i32) {
        debug_assert_eq!(self.state, JobState::Running);
        debug_assert!(state.is_terminal() && state != JobState::Aborted);
        self.state = state;
        self.exit_code = Some(exit_code);
        self.ended_at = Some(Instant::now());
        self.ended_wall = Some(Local::now());
    }

    /// `queued -> aborted`; never started, so neither start nor exit.
    pub fn mark_aborted(&mut self) {
        debug_assert_eq!(self.state, JobState::Queued);
        self.state = JobState::Aborted;
    }

    /// Time spent running: up to now while running, total once done.
    pub fn elapsed(&self) -> Duration {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }
}
