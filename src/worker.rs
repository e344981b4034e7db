//! Worker loop: serve jobs from the pool until the queue drains.
//!
//! Each worker owns at most one SSH child at a time. It streams the
//! child's combined output into the job's log file, publishes the last
//! non-empty line for the dashboard, and supervises child exit against
//! the per-job timeout and kill requests.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::time::{sleep_until, timeout, timeout_at, Instant};

use crate::config::Settings;
use crate::job::{classify, JobState, KillReason, SPAWN_FAILED_EXIT};
use crate::logdir::{HostLog, RunDir};
use crate::pool::Pool;
use crate::session::SshSession;

/// Window between SIGTERM and SIGKILL.
const GRACE: Duration = Duration::from_secs(2);
/// Upper bound on waiting for output still in flight after child exit.
const DRAIN_WINDOW: Duration = Duration::from_millis(500);

pub async fn run_worker(
    pool: Arc<Pool>,
    rundir: Arc<RunDir>,
    settings: Arc<Settings>,
    script: Option<Arc<Vec<u8>>>,
    slot: usize,
) {
    // Stagger first claims so a burst of connections does not trip
    // ProxyJump MaxStartups.
    if slot > 0 && !settings.delay.is_zero() {
        tokio::time::sleep(settings.delay * slot as u32).await;
    }
    while let Some(idx) = pool.next_job(slot).await {
        run_one(&pool, &rundir, &settings, script.clone(), slot, idx).await;
    }
}

async fn run_one(
    pool: &Pool,
    rundir: &RunDir,
    settings: &Settings,
    script: Option<Arc<Vec<u8>>>,
    slot: usize,
    idx: usize,
) {
    let (host, log_name) = pool.job_names(idx);
    let started = Local::now();
    let mut log = match rundir.open_host_log(&log_name, &host, &settings.command_label, started) {
        Ok(log) => log,
        Err(err) => {
            pool.fail_fatal(err.into());
            return;
        }
    };

    let (mut session, lines) = match SshSession::spawn(settings, &host, script) {
        Ok(pair) => pair,
        Err(err) => {
            let _ = log.write_line(&format!("sshp: cannot start {}: {err}", settings.ssh_program));
            let _ = log.finish(Local::now(), SPAWN_FAILED_EXIT, JobState::Failed);
            pool.start_job(slot, idx, None, started);
            pool.finish_job(slot, idx, JobState::Failed, SPAWN_FAILED_EXIT);
            if settings.verbose {
                eprintln!("[sshp] FAILED: {host} ({err})");
            }
            return;
        }
    };
    pool.start_job(slot, idx, session.pid(), started);
    if settings.verbose {
        eprintln!("[sshp] RUNNING: {host}");
    }

    let kill_signal = pool.kill_signal(slot);
    // Timeout accounting starts at spawn.
    let far_future = Instant::now() + Duration::from_secs(86400 * 365);
    let deadline = settings
        .timeout
        .map(|t| Instant::now() + t)
        .unwrap_or(far_future);
    let has_deadline = settings.timeout.is_some();
    let mut lines_open = true;
    let mut reason: Option<KillReason> = None;

    // Supervise until the child exits or a termination reason is flagged.
    // `biased` keeps the precedence: kill beats timeout beats exit.
    let wait_result = loop {
        tokio::select! {
            biased;
            _ = kill_signal.notified(), if reason.is_none() => {
                if pool.kill_requested(slot) {
                    reason = Some(KillReason::Kill);
                    break None;
                }
            }
            _ = sleep_until(deadline), if has_deadline && reason.is_none() => {
                reason = Some(KillReason::Timeout);
                break None;
            }
            line = lines.recv_async(), if lines_open => match line {
                Ok(line) => publish_line(pool, idx, &mut log, &line),
                Err(_) => lines_open = false,
            },
            res = session.child.wait() => break Some(res),
        }
    };

    let wait_result = match wait_result {
        Some(res) => res,
        None => {
            session.terminate();
            match timeout(GRACE, session.child.wait()).await {
                Ok(res) => res,
                Err(_) => {
                    session.force_kill().await;
                    session.child.wait().await
                }
            }
        }
    };

    // Flush output still in flight. The bound only matters when something
    // other than the child kept the pipe open.
    let drain_deadline = Instant::now() + DRAIN_WINDOW;
    while lines_open {
        match timeout_at(drain_deadline, lines.recv_async()).await {
            Ok(Ok(line)) => publish_line(pool, idx, &mut log, &line),
            _ => break,
        }
    }

    let exit_code = match wait_result {
        Ok(status) => status.code().unwrap_or_else(|| {
            use std::os::unix::process::ExitStatusExt;
            status.signal().map(|s| 128 + s).unwrap_or(SPAWN_FAILED_EXIT)
        }),
        Err(_) => SPAWN_FAILED_EXIT,
    };
    let state = classify(reason, exit_code);
    if let Err(err) = log.finish(Local::now(), exit_code, state) {
        pool.fail_fatal(err.into());
    }
    pool.finish_job(slot, idx, state, exit_code);
    if settings.verbose {
        eprintln!("[sshp] {}: {host} exit:{exit_code}", state.label());
    }
}

fn publish_line(pool: &Pool, idx: usize, log: &mut HostLog, line: &str) {
    if let Err(err) = log.write_line(line) {
        pool.fail_fatal(err.into());
        return;
    }
    let trimmed = line.trim();
    if !trimmed.is_empty() {
        pool.update_last_line(idx, trimmed);
    }
}
