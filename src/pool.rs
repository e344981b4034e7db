//! Pool state shared by workers, renderer and control plane.
//!
//! One mutex region protects the pause/abort/stop flags, the queue head,
//! the per-slot records and the job list. Workers suspend on a `Notify`
//! while paused; the renderer copies what it needs under the lock and
//! draws outside of it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::Notify;

use crate::error::SshpError;
use crate::job::{Job, JobState};

pub struct Pool {
    inner: Mutex<PoolInner>,
    /// Wakes workers parked on pause and anything waiting for a state change.
    notify: Notify,
    /// One wakeup per slot for kill requests.
    kill_signals: Vec<Arc<Notify>>,
}

struct PoolInner {
    jobs: Vec<Job>,
    /// Queue head: index of the next unclaimed job.
    next: usize,
    paused: bool,
    aborted: bool,
    stopping: bool,
    fatal: Option<SshpError>,
    slots: Vec<SlotState>,
}

#[derive(Default)]
struct SlotState {
    /// Current or most recently finished job; cleared on the next claim.
    job_index: Option<usize>,
    kill_requested: bool,
    child_pid: Option<u32>,
}

impl Pool {
    pub fn new(jobs: Vec<Job>, parallel: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PoolInner {
                jobs,
                next: 0,
                paused: false,
                aborted: false,
                stopping: false,
                fatal: None,
                slots: (0..parallel).map(|_| SlotState::default()).collect(),
            }),
            notify: Notify::new(),
            kill_signals: (0..parallel).map(|_| Arc::new(Notify::new())).collect(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        // A worker panicking mid-update must not take the whole run down.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn pause(&self) {
        self.lock().paused = true;
    }

    pub fn resume(&self) {
        self.lock().paused = false;
        self.notify.notify_waiters();
    }

    /// Stop spawning; queued jobs drain to `aborted`, running jobs keep
    /// going. Clears pause so the drain can proceed.
    pub fn abort(&self) {
        let mut inner = self.lock();
        inner.aborted = true;
        inner.paused = false;
        drop(inner);
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    /// Record a fatal error and make workers exit at their next
    /// suspension point without touching the queue.
    pub fn fail_fatal(&self, err: SshpError) {
        let mut inner = self.lock();
        if inner.fatal.is_none() {
            inner.fatal = Some(err);
        }
        inner.stopping = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    pub fn take_fatal(&self) -> Option<SshpError> {
        self.lock().fatal.take()
    }

    /// Request a kill of the job running on `slot`. Returns false when the
    /// slot is out of range or has nothing running.
    pub fn kill(&self, slot: usize) -> bool {
        {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let Some(state) = inner.slots.get_mut(slot) else {
                return false;
            };
            let Some(idx) = state.job_index else {
                return false;
            };
            if inner.jobs[idx].state != JobState::Running {
                return false;
            }
            state.kill_requested = true;
        }
        self.kill_signals[slot].notify_one();
        true
    }

    /// Ctrl-C path: every running slot gets a kill request.
    pub fn kill_all_running(&self) {
        let targets: Vec<usize> = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let mut targets = vec![];
            for (slot, state) in inner.slots.iter_mut().enumerate() {
                if let Some(idx) = state.job_index {
                    if inner.jobs[idx].state == JobState::Running {
                        state.kill_requested = true;
                        targets.push(slot);
                    }
                }
            }
            targets
        };
        for slot in targets {
            self.kill_signals[slot].notify_one();
        }
    }

    pub fn kill_signal(&self, slot: usize) -> Arc<Notify> {
        Arc::clone(&self.kill_signals[slot])
    }

    pub fn kill_requested(&self, slot: usize) -> bool {
        self.lock().slots[slot].kill_requested
    }

    /// Claim the next queued job for `slot`. Suspends while paused, drains
    /// the queue to `aborted` after an abort, and returns `None` once there
    /// is nothing left to do.
    pub async fn next_job(&self, slot: usize) -> Option<usize> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if inner.stopping {
                    return None;
                }
                if inner.aborted {
                    while inner.next < inner.jobs.len() {
                        let idx = inner.next;
                        inner.next += 1;
                        inner.jobs[idx].mark_aborted();
                    }
                    return None;
                }
                if !inner.paused {
                    if inner.next >= inner.jobs.len() {
                        return None;
                    }
                    let idx = inner.next;
                    inner.next += 1;
                    let state = &mut inner.slots[slot];
                    state.job_index = Some(idx);
                    state.kill_requested = false;
                    state.child_pid = None;
                    return Some(idx);
                }
            }
            notified.await;
        }
    }

    /// Host identifier and log file stem of one job.
    pub fn job_names(&self, idx: usize) -> (String, String) {
        let inner = self.lock();
        (inner.jobs[idx].host.clone(), inner.jobs[idx].log_name.clone())
    }

    /// `queued -> running`, once the child is up.
    pub fn start_job(&self, slot: usize, idx: usize, pid: Option<u32>, wall: DateTime<Local>) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.jobs[idx].mark_running(wall);
        inner.slots[slot].child_pid = pid;
    }

    pub fn update_last_line(&self, idx: usize, line: &str) {
        let mut inner = self.lock();
        inner.jobs[idx].last_line = line.to_string();
    }

    /// Publish the terminal state of a job that ran.
    pub fn finish_job(&self, slot: usize, idx: usize, state: JobState, exit_code: i32) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.jobs[idx].mark_done(state, exit_code);
        inner.slots[slot].child_pid = None;
        inner.slots[slot].kill_requested = false;
        drop(guard);
        self.notify.notify_waiters();
    }

    /// Final job records, cloned out for status files and the summary.
    pub fn records(&self) -> Vec<Job> {
        self.lock().jobs.clone()
    }

    /// Copy of everything the renderer draws; the lock is released before
    /// any terminal write happens.
    pub fn snapshot(&self) -> PoolSnapshot {
        let inner = self.lock();
        let mut snap = PoolSnapshot {
            total: inner.jobs.len(),
            paused: inner.paused,
            aborted: inner.aborted,
            ..PoolSnapshot::default()
        };
        for job in &inner.jobs {
            match job.state {
                JobState::Queued => snap.queued += 1,
                JobState::Running => snap.running += 1,
                JobState::Success => snap.success += 1,
                JobState::Failed => snap.failed += 1,
                JobState::Timeout => snap.timeout += 1,
                JobState::Killed => snap.killed += 1,
                JobState::Aborted => snap.aborted_jobs += 1,
            }
            if job.state.is_terminal() && job.state != JobState::Aborted {
                snap.done_duration += job.elapsed();
            }
        }
        snap.slots = inner
            .slots
            .iter()
            .enumerate()
            .map(|(slot_id, state)| SlotSnapshot {
                slot_id,
                job: state.job_index.map(|idx| {
                    let job = &inner.jobs[idx];
                    SlotJob {
                        host: job.host.clone(),
                        state: job.state,
                        elapsed: job.elapsed(),
                        last_line: job.last_line.clone(),
                        pid: state.child_pid,
                    }
                }),
            })
            .collect();
        snap
    }
}

#[derive(Debug, Default, Clone)]
pub struct PoolSnapshot {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub success: usize,
    pub failed: usize,
    pub timeout: usize,
    pub killed: usize,
    pub aborted_jobs: usize,
    /// Summed runtime of finished jobs, for the ETA estimate.
    pub done_duration: Duration,
    pub paused: bool,
    pub aborted: bool,
    pub slots: Vec<SlotSnapshot>,
}

impl PoolSnapshot {
    pub fn done(&self) -> usize {
        self.success + self.failed + self.timeout + self.killed + self.aborted_jobs
    }

    pub fn non_success(&self) -> usize {
        self.failed + self.timeout + self.killed + self.aborted_jobs
    }
}

#[derive(Debug, Clone)]
pub struct SlotSnapshot {
    pub slot_id: usize,
    pub job: Option<SlotJob>,
}

#[derive(Debug, Clone)]
pub struct SlotJob {
    pub host: String,
    pub state: JobState,
    pub elapsed: Duration,
    pub last_line: String,
    pub pid: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn jobs(hosts: &[&str]) -> Vec<Job> {
        hosts
            .iter()
            .map(|h| Job::new(h.to_string(), h.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn claims_follow_input_order() {
        let pool = Pool::new(jobs(&["h1", "h2", "h3"]), 2);
        assert_eq!(pool.next_job(0).await, Some(0));
        assert_eq!(pool.next_job(1).await, Some(1));
        assert_eq!(pool.next_job(0).await, Some(2));
        assert_eq!(pool.next_job(0).await, None);
    }

    #[tokio::test]
    async fn pause_blocks_claims_until_resume() {
        let pool = Pool::new(jobs(&["h1"]), 1);
        pool.pause();
        {
            let pool = Arc::clone(&pool);
            let pending = timeout(Duration::from_millis(50), pool.next_job(0)).await;
            assert!(pending.is_err(), "claim should block while paused");
        }
        let claimer = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.next_job(0).await })
        };
        pool.resume();
        let claimed = timeout(Duration::from_secs(1), claimer).await.unwrap().unwrap();
        assert_eq!(claimed, Some(0));
    }

    #[tokio::test]
    async fn abort_drains_queue_without_spawning() {
        let pool = Pool::new(jobs(&["h1", "h2", "h3"]), 1);
        assert_eq!(pool.next_job(0).await, Some(0));
        pool.abort();
        assert_eq!(pool.next_job(0).await, None);
        let records = pool.records();
        assert_eq!(records[1].state, JobState::Aborted);
        assert_eq!(records[2].state, JobState::Aborted);
        assert!(records[1].started_at.is_none());
    }

    #[tokio::test]
    async fn abort_wakes_paused_workers() {
        let pool = Pool::new(jobs(&["h1", "h2"]), 1);
        pool.pause();
        let claimer = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.next_job(0).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.abort();
        let claimed = timeout(Duration::from_secs(1), claimer).await.unwrap().unwrap();
        assert_eq!(claimed, None);
        assert!(pool.records().iter().all(|j| j.state == JobState::Aborted));
    }

    #[tokio::test]
    async fn kill_targets_only_running_slots() {
        let pool = Pool::new(jobs(&["h1", "h2"]), 2);
        assert!(!pool.kill(0), "idle slot");
        assert!(!pool.kill(7), "out of range");
        let idx = pool.next_job(0).await.unwrap();
        assert!(!pool.kill(0), "claimed but not yet spawned");
        pool.start_job(0, idx, Some(4242), Local::now());
        assert!(pool.kill(0));
        assert!(pool.kill_requested(0));
    }

    #[tokio::test]
    async fn kill_flag_clears_on_next_claim() {
        let pool = Pool::new(jobs(&["h1", "h2"]), 1);
        let idx = pool.next_job(0).await.unwrap();
        pool.start_job(0, idx, Some(1), Local::now());
        assert!(pool.kill(0));
        pool.finish_job(0, idx, JobState::Killed, 143);
        let _ = pool.next_job(0).await.unwrap();
        assert!(!pool.kill_requested(0));
    }

    #[tokio::test]
    async fn snapshot_counts_by_state() {
        let pool = Pool::new(jobs(&["h1", "h2", "h3"]), 2);
        let idx = pool.next_job(0).await.unwrap();
        pool.start_job(0, idx, Some(1), Local::now());
        pool.finish_job(0, idx, JobState::Success, 0);
        let idx = pool.next_job(0).await.unwrap();
        pool.start_job(0, idx, Some(2), Local::now());

        let snap = pool.snapshot();
        assert_eq!(snap.total, 3);
        assert_eq!(snap.success, 1);
        assert_eq!(snap.running, 1);
        assert_eq!(snap.queued, 1);
        assert_eq!(snap.done(), 1);
        assert_eq!(snap.non_success(), 0);
        assert!(snap.done() < snap.total);

        let slot = &snap.slots[0];
        let job = slot.job.as_ref().unwrap();
        assert_eq!(job.host, "h2");
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.pid, Some(2));
    }

    #[tokio::test]
    async fn fatal_stops_claims_and_is_reported_once() {
        let pool = Pool::new(jobs(&["h1", "h2"]), 1);
        pool.fail_fatal(SshpError::NoCommand);
        assert_eq!(pool.next_job(0).await, None);
        assert!(pool.take_fatal().is_some());
        assert!(pool.take_fatal().is_none());
    }
}
