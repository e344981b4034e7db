//! Run driver: wires the pool, workers, renderer and control plane, then
//! finalizes the run directory and computes the exit code.

use std::collections::HashMap;
use std::fs;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use colored::Colorize;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, Settings};
use crate::control;
use crate::error::{Result, SshpError};
use crate::host;
use crate::job::{Job, JobState};
use crate::logdir::RunDir;
use crate::pool::Pool;
use crate::render::{self, format_hms, Screen};
use crate::worker::run_worker;

/// A started run: workers are claiming jobs, nothing is displayed yet.
/// The renderer and control plane attach on top of the `pool` handle.
pub struct Engine {
    pub pool: Arc<Pool>,
    pub rundir: Arc<RunDir>,
    settings: Arc<Settings>,
    workers: Vec<JoinHandle<()>>,
    started: Instant,
    started_wall: DateTime<Local>,
}

pub struct RunSummary {
    pub exit_code: i32,
    pub records: Vec<Job>,
    pub run_path: PathBuf,
    pub wall: Duration,
    pub started_wall: DateTime<Local>,
    pub ended_wall: DateTime<Local>,
}

impl Engine {
    /// Create the run directory, write `hosts.list`, and start the worker
    /// pool over the given hosts.
    pub fn start(settings: Arc<Settings>, hosts: Vec<String>) -> Result<Self> {
        if hosts.is_empty() {
            return Err(SshpError::NoHosts);
        }
        if settings.command.is_empty() && settings.script.is_none() {
            return Err(SshpError::NoCommand);
        }
        let script = match &settings.script {
            Some(path) => Some(Arc::new(fs::read(path).map_err(|source| {
                SshpError::Script {
                    path: path.clone(),
                    source,
                }
            })?)),
            None => None,
        };
        let rundir = Arc::new(RunDir::create(&settings.dirlog, settings.job.as_deref())?);
        rundir.write_hosts_list(&hosts)?;

        let jobs = build_jobs(&hosts);
        let parallel = settings.parallel.min(jobs.len());
        let pool = Pool::new(jobs, parallel);
        let workers = (0..parallel)
            .map(|slot| {
                tokio::spawn(run_worker(
                    Arc::clone(&pool),
                    Arc::clone(&rundir),
                    Arc::clone(&settings),
                    script.clone(),
                    slot,
                ))
            })
            .collect();
        Ok(Self {
            pool,
            rundir,
            settings,
            workers,
            started: Instant::now(),
            started_wall: Local::now(),
        })
    }

    /// Wait for every job to reach a terminal state, then write the status
    /// files and the run summary. A panicked worker does not stop the
    /// others, and finalization always runs.
    pub async fn drain(self) -> Result<RunSummary> {
        let Engine {
            pool,
            rundir,
            settings,
            workers,
            started,
            started_wall,
        } = self;
        for joined in join_all(workers).await {
            let _ = joined;
        }
        let records = pool.records();
        let ended_wall = Local::now();
        let wall = started.elapsed();
        rundir.write_status_files(&records)?;
        rundir.append_summary(&summary_text(
            &records,
            &settings,
            rundir.path(),
            started_wall,
            ended_wall,
            wall,
        ))?;
        if let Some(fatal) = pool.take_fatal() {
            return Err(fatal);
        }
        let non_success = records
            .iter()
            .filter(|job| job.state != JobState::Success)
            .count();
        Ok(RunSummary {
            exit_code: non_success.min(255) as i32,
            records,
            run_path: rundir.path().to_path_buf(),
            wall,
            started_wall,
            ended_wall,
        })
    }
}

/// Duplicate hosts are kept; the second occurrence logs to `<host>.2.out`
/// so no log header is ever overwritten.
fn build_jobs(hosts: &[String]) -> Vec<Job> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    hosts
        .iter()
        .map(|host| {
            let n = seen.entry(host.as_str()).or_insert(0);
            *n += 1;
            let log_name = if *n == 1 {
                host.clone()
            } else {
                format!("{host}.{n}")
            };
            Job::new(host.clone(), log_name)
        })
        .collect()
}

/// Full interactive run: engine plus dashboard plus control plane.
pub async fn run(cli: &Config) -> Result<i32> {
    let mut settings = Settings::resolve(cli)?;
    let hosts = host::read_hosts(cli.hostsfile.as_deref(), &cli.hosts)?;
    let hosts = if cli.resolve {
        host::resolve_hosts(hosts, &settings.domains)
    } else {
        hosts
    };

    let interactive = std::io::stderr().is_terminal() && std::io::stdin().is_terminal();
    if !interactive {
        // Without a dashboard the state changes go to stderr instead.
        settings.verbose = true;
    }
    let settings = Arc::new(settings);

    let engine = Engine::start(Arc::clone(&settings), hosts)?;
    let token = CancellationToken::new();
    let relayout = Arc::new(AtomicBool::new(false));
    let _signals = control::spawn_signal_handler(
        Arc::clone(&engine.pool),
        Arc::clone(&relayout),
        token.clone(),
    );

    let mut screen = None;
    let mut renderer = None;
    if interactive {
        screen = Some(Screen::enter()?);
        renderer = Some(tokio::spawn(render::run_renderer(
            Arc::clone(&engine.pool),
            Arc::clone(&settings),
            engine.rundir.path().display().to_string(),
            token.clone(),
            Arc::clone(&relayout),
            engine.started,
        )));
        let _ = control::spawn_keyboard(
            Arc::clone(&engine.pool),
            Arc::clone(&relayout),
            token.clone(),
        );
    }

    let drained = engine.drain().await;
    token.cancel();
    if let Some(renderer) = renderer {
        let _ = renderer.await;
    }
    // Restore the terminal before anything is printed, including errors.
    drop(screen);

    let summary = drained?;
    print_summary(&summary, &settings);
    Ok(summary.exit_code)
}

fn summary_text(
    records: &[Job],
    settings: &Settings,
    run_path: &std::path::Path,
    started_wall: DateTime<Local>,
    ended_wall: DateTime<Local>,
    wall: Duration,
) -> String {
    use std::fmt::Write as _;

    let mut text = String::new();
    for job in records {
        match job.state {
            JobState::Aborted => {
                let _ = writeln!(text, "ABORTED: {}", job.host);
            }
            _ => {
                let _ = writeln!(
                    text,
                    "{}: {} exit:{} dur:{} {}/{}.out",
                    job.state.label(),
                    job.host,
                    job.exit_code.unwrap_or(-1),
                    format_hms(job.elapsed()),
                    run_path.display(),
                    job.log_name,
                );
                if !job.last_line.is_empty() {
                    let _ = writeln!(text, "  {}", job.last_line);
                }
            }
        }
    }
    let _ = writeln!(text, "command: {}", settings.command_label);
    let _ = writeln!(text, "log directory: {}", run_path.display());
    let non_success = records
        .iter()
        .filter(|job| job.state != JobState::Success)
        .count();
    let _ = writeln!(
        text,
        "{} jobs run: start: {} end: {} duration: {}",
        records.len(),
        started_wall.format("%X"),
        ended_wall.format("%X"),
        format_hms(wall),
    );
    if non_success == 0 {
        let _ = writeln!(text, "all jobs with exit code 0");
    } else {
        let _ = writeln!(text, "WARNING: {non_success} job(s) not successful");
    }
    text
}

fn print_summary(summary: &RunSummary, settings: &Settings) {
    for job in &summary.records {
        let line = match job.state {
            JobState::Aborted => format!("ABORTED: {}", job.host),
            _ => format!(
                "{}: {} exit:{} dur:{} {}/{}.out",
                job.state.label(),
                job.host,
                job.exit_code.unwrap_or(-1),
                format_hms(job.elapsed()),
                summary.run_path.display(),
                job.log_name,
            ),
        };
        if job.state == JobState::Success {
            eprintln!("{}", line.green().bold());
        } else {
            eprintln!("{}", line.red().bold());
        }
        if !job.last_line.is_empty() {
            eprintln!("  {}", job.last_line);
        }
    }
    eprintln!("command: {}", settings.command_label);
    eprintln!("log directory: {}", summary.run_path.display());
    eprintln!(
        "{} jobs run: start: {} end: {} duration: {}",
        summary.records.len(),
        summary.started_wall.format("%X"),
        summary.ended_wall.format("%X"),
        format_hms(summary.wall),
    );
    if summary.exit_code == 0 {
        eprintln!("{}", "all jobs with exit code 0".green().bold());
    } else {
        eprintln!(
            "{}",
            format!("WARNING: {} job(s) not successful", summary.exit_code)
                .red()
                .bold()
        );
    }
}
