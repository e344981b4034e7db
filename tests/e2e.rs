//! End-to-end tests for the parallel job engine.
//!
//! A fake `ssh` executable is staged in a temp dir and wired in through
//! the settings, so runs exercise the whole pipeline (spawn, streaming,
//! timeout/kill supervision, run directory) without any network.
//!
//! The fake receives the real argv: `-T -o BatchMode=yes <host> <cmd...>`,
//! so `$4` is the host.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use sshp::config::{Settings, Symbols};
use sshp::job::JobState;
use sshp::pool::{Pool, PoolSnapshot};
use sshp::runner::Engine;

fn fake_ssh(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-ssh");
    fs::write(&path, format!("#!/bin/sh\nhost=\"$4\"\n{body}\n")).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

fn test_settings(ssh: &Path, root: &Path, parallel: usize) -> Settings {
    Settings {
        ssh_program: ssh.display().to_string(),
        ssh_opts: vec![],
        domains: vec![],
        symbols: Symbols::default(),
        parallel,
        timeout: None,
        delay: Duration::ZERO,
        max_dots: -1,
        verbose: false,
        dirlog: root.to_path_buf(),
        job: None,
        command: vec!["echo".into(), "ok".into()],
        script: None,
        command_label: "echo ok".into(),
    }
}

fn hosts(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_else(|_| panic!("cannot read {}", path.display()))
}

/// Poll the pool until the condition holds, for at most five seconds.
async fn wait_until<F>(pool: &Pool, what: &str, cond: F)
where
    F: Fn(&PoolSnapshot) -> bool,
{
    for _ in 0..200 {
        if cond(&pool.snapshot()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for: {what}");
}

#[tokio::test]
async fn all_hosts_succeed() {
    let tmp = TempDir::new().unwrap();
    let ssh = fake_ssh(tmp.path(), "echo ok; exit 0");
    let settings = Arc::new(test_settings(&ssh, &tmp.path().join("logs"), 2));

    let engine = Engine::start(settings, hosts(&["h1", "h2", "h3"])).unwrap();
    let summary = engine.drain().await.unwrap();

    assert_eq!(summary.exit_code, 0);
    let run = &summary.run_path;
    assert_eq!(read(&run.join("success.status")), "h1\nh2\nh3\n");
    assert_eq!(read(&run.join("failed.status")), "");
    assert_eq!(read(&run.join("hosts.list")), "h1\nh2\nh3\n");
    for host in ["h1", "h2", "h3"] {
        let out = read(&run.join(format!("{host}.out")));
        let lines: Vec<&str> = out.lines().collect();
        assert!(
            lines[0].starts_with(&format!("# host={host} cmd=echo ok start=")),
            "bad header: {}",
            lines[0]
        );
        assert_eq!(lines[1], "ok");
        assert!(lines[2].starts_with("# end="));
        assert!(lines[2].ends_with("exit=0 state=success"));
    }
    // The scope's `latest` symlink points at this run.
    let latest = tmp.path().join("logs").join("latest");
    assert_eq!(
        fs::canonicalize(latest).unwrap(),
        fs::canonicalize(run).unwrap()
    );
}

#[tokio::test]
async fn mixed_exit_codes_split_the_status_files() {
    let tmp = TempDir::new().unwrap();
    let ssh = fake_ssh(
        tmp.path(),
        r#"case "$host" in
h1) echo fine; exit 0;;
h2) echo broken >&2; exit 7;;
esac"#,
    );
    let settings = Arc::new(test_settings(&ssh, &tmp.path().join("logs"), 2));

    let engine = Engine::start(settings, hosts(&["h1", "h2"])).unwrap();
    let summary = engine.drain().await.unwrap();

    assert_eq!(summary.exit_code, 1);
    let run = &summary.run_path;
    assert_eq!(read(&run.join("success.status")), "h1\n");
    assert_eq!(read(&run.join("failed.status")), "h2\n");
    let out = read(&run.join("h2.out"));
    assert!(out.contains("broken"), "stderr must reach the log: {out}");
    assert!(out.lines().last().unwrap().ends_with("exit=7 state=failed"));
}

#[tokio::test]
async fn timeout_terminates_the_child_within_grace() {
    let tmp = TempDir::new().unwrap();
    let ssh = fake_ssh(tmp.path(), "exec sleep 10");
    let mut settings = test_settings(&ssh, &tmp.path().join("logs"), 1);
    settings.timeout = Some(Duration::from_secs(1));
    let settings = Arc::new(settings);

    let t0 = Instant::now();
    let engine = Engine::start(settings, hosts(&["h1"])).unwrap();
    let summary = engine.drain().await.unwrap();

    assert!(
        t0.elapsed() < Duration::from_secs(6),
        "timeout + grace must bound the run, took {:?}",
        t0.elapsed()
    );
    assert_eq!(summary.exit_code, 1);
    let run = &summary.run_path;
    assert_eq!(read(&run.join("timeout.status")), "h1\n");
    let out = read(&run.join("h1.out"));
    assert!(out.lines().last().unwrap().contains("state=timeout"));
    assert_eq!(summary.records[0].state, JobState::Timeout);
}

#[tokio::test]
async fn kill_targets_one_slot_and_spares_the_other() {
    let tmp = TempDir::new().unwrap();
    let ssh = fake_ssh(tmp.path(), "exec sleep 30");
    let settings = Arc::new(test_settings(&ssh, &tmp.path().join("logs"), 2));

    let engine = Engine::start(settings, hosts(&["h1", "h2"])).unwrap();
    let pool = Arc::clone(&engine.pool);
    wait_until(&pool, "both jobs running", |s| s.running == 2).await;

    // Kill the slot that holds h1, the way the `k` sub-mode does.
    let snapshot = pool.snapshot();
    let slot = snapshot
        .slots
        .iter()
        .find(|s| s.job.as_ref().is_some_and(|j| j.host == "h1"))
        .unwrap()
        .slot_id;
    assert!(pool.kill(slot));

    wait_until(&pool, "h1 killed", |s| s.killed == 1).await;
    let snapshot = pool.snapshot();
    assert_eq!(snapshot.running, 1, "the other job keeps running");

    // Ctrl-C finishes the run.
    pool.abort();
    pool.kill_all_running();
    let summary = engine.drain().await.unwrap();

    assert_eq!(summary.exit_code, 2);
    let killed = read(&summary.run_path.join("killed.status"));
    assert!(killed.contains("h1") && killed.contains("h2"));
    for record in &summary.records {
        assert_eq!(record.state, JobState::Killed);
    }
}

#[tokio::test]
async fn pause_stops_new_claims_until_resume() {
    let tmp = TempDir::new().unwrap();
    let ssh = fake_ssh(
        tmp.path(),
        r#"case "$host" in
h1) echo started; exec sleep 1;;
*) echo ok;;
esac"#,
    );
    let settings = Arc::new(test_settings(&ssh, &tmp.path().join("logs"), 1));

    let engine = Engine::start(settings, hosts(&["h1", "h2", "h3", "h4", "h5"])).unwrap();
    let pool = Arc::clone(&engine.pool);
    wait_until(&pool, "h1 running", |s| s.running == 1).await;
    pool.pause();

    // h1 finishes; nothing new may start while paused.
    wait_until(&pool, "h1 finished", |s| s.success == 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let snapshot = pool.snapshot();
    assert_eq!(snapshot.running, 0);
    assert_eq!(snapshot.queued, 4);
    assert_eq!(snapshot.success, 1);

    pool.resume();
    let summary = engine.drain().await.unwrap();
    assert_eq!(summary.exit_code, 0);
    assert_eq!(
        read(&summary.run_path.join("success.status")),
        "h1\nh2\nh3\nh4\nh5\n"
    );
}

#[tokio::test]
async fn abort_spares_running_jobs_and_drains_the_rest() {
    let tmp = TempDir::new().unwrap();
    let ssh = fake_ssh(tmp.path(), "exec sleep 2");
    let settings = Arc::new(test_settings(&ssh, &tmp.path().join("logs"), 2));

    let names: Vec<String> = (1..=10).map(|i| format!("h{i}")).collect();
    let engine = Engine::start(settings, names).unwrap();
    let pool = Arc::clone(&engine.pool);
    wait_until(&pool, "two jobs running", |s| s.running == 2).await;
    pool.abort();

    let summary = engine.drain().await.unwrap();

    // The two running jobs reach their natural end; the rest never spawn.
    assert_eq!(summary.exit_code, 8);
    let run = &summary.run_path;
    let aborted = read(&run.join("aborted.status"));
    assert_eq!(aborted.lines().count(), 8);
    assert_eq!(read(&run.join("success.status")).lines().count(), 2);
    for record in &summary.records {
        if record.state == JobState::Aborted {
            assert!(record.started_at.is_none());
            assert!(record.exit_code.is_none());
            assert!(!run.join(format!("{}.out", record.log_name)).exists());
        }
    }
}

#[tokio::test]
async fn running_jobs_never_exceed_parallelism() {
    let tmp = TempDir::new().unwrap();
    let ssh = fake_ssh(tmp.path(), "exec sleep 0");
    let settings = Arc::new(test_settings(&ssh, &tmp.path().join("logs"), 2));

    let names: Vec<String> = (1..=6).map(|i| format!("h{i}")).collect();
    let engine = Engine::start(settings, names).unwrap();
    let pool = Arc::clone(&engine.pool);
    let drain = tokio::spawn(engine.drain());

    let mut max_running = 0;
    loop {
        let snapshot = pool.snapshot();
        max_running = max_running.max(snapshot.running);
        if snapshot.done() == snapshot.total {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let summary = drain.await.unwrap().unwrap();

    assert!(max_running <= 2, "observed {max_running} running jobs");
    assert_eq!(summary.exit_code, 0);
}

#[tokio::test]
async fn spawn_failure_is_classified_failed() {
    let tmp = TempDir::new().unwrap();
    let settings = Arc::new(test_settings(
        &tmp.path().join("no-such-ssh"),
        &tmp.path().join("logs"),
        1,
    ));

    let engine = Engine::start(settings, hosts(&["h1"])).unwrap();
    let summary = engine.drain().await.unwrap();

    assert_eq!(summary.exit_code, 1);
    assert_eq!(summary.records[0].state, JobState::Failed);
    assert_eq!(summary.records[0].exit_code, Some(-1));
    let run = &summary.run_path;
    assert_eq!(read(&run.join("failed.status")), "h1\n");
    let out = read(&run.join("h1.out"));
    assert!(out.contains("cannot start"), "spawn error in the log: {out}");
    assert!(out.lines().last().unwrap().ends_with("exit=-1 state=failed"));
}

#[tokio::test]
async fn duplicate_hosts_log_to_suffixed_files() {
    let tmp = TempDir::new().unwrap();
    let ssh = fake_ssh(tmp.path(), "echo ok");
    let settings = Arc::new(test_settings(&ssh, &tmp.path().join("logs"), 1));

    let engine = Engine::start(settings, hosts(&["h1", "h1"])).unwrap();
    let summary = engine.drain().await.unwrap();

    assert_eq!(summary.exit_code, 0);
    let run = &summary.run_path;
    assert_eq!(read(&run.join("success.status")), "h1\nh1\n");
    assert!(run.join("h1.out").exists());
    assert!(run.join("h1.2.out").exists());
}

#[tokio::test]
async fn script_bytes_reach_the_remote_stdin() {
    let tmp = TempDir::new().unwrap();
    // The fake stands in for a login shell consuming the script.
    let ssh = fake_ssh(tmp.path(), "cat");
    let script_path = tmp.path().join("deploy.sh");
    fs::write(&script_path, "echo from-script\n").unwrap();

    let mut settings = test_settings(&ssh, &tmp.path().join("logs"), 1);
    settings.command = vec![];
    settings.script = Some(script_path);
    settings.command_label = "deploy.sh".into();
    let settings = Arc::new(settings);

    let engine = Engine::start(settings, hosts(&["h1"])).unwrap();
    let summary = engine.drain().await.unwrap();

    assert_eq!(summary.exit_code, 0);
    let out = read(&summary.run_path.join("h1.out"));
    assert!(out.contains("echo from-script"), "script was streamed: {out}");
}

#[tokio::test]
async fn run_summary_lands_in_the_run_directory() {
    let tmp = TempDir::new().unwrap();
    let ssh = fake_ssh(tmp.path(), "echo ok");
    let settings = Arc::new(test_settings(&ssh, &tmp.path().join("logs"), 1));

    let engine = Engine::start(settings, hosts(&["h1"])).unwrap();
    let summary = engine.drain().await.unwrap();

    let text = read(&summary.run_path.join("sshp.log"));
    assert!(text.contains("SUCCESS: h1"));
    assert!(text.contains("1 jobs run"));
    assert!(text.contains("all jobs with exit code 0"));
}

#[tokio::test]
async fn job_scope_nests_the_run_directory() {
    let tmp = TempDir::new().unwrap();
    let ssh = fake_ssh(tmp.path(), "echo ok");
    let mut settings = test_settings(&ssh, &tmp.path().join("logs"), 1);
    settings.job = Some("deploy".into());
    let settings = Arc::new(settings);

    let engine = Engine::start(settings, hosts(&["h1"])).unwrap();
    let summary = engine.drain().await.unwrap();

    let scope = tmp.path().join("logs").join("deploy");
    assert!(summary.run_path.starts_with(&scope));
    assert_eq!(
        fs::canonicalize(scope.join("latest")).unwrap(),
        fs::canonicalize(&summary.run_path).unwrap()
    );
}
