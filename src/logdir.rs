//! Run directory layout, per-host log files and `-L` log queries.
//!
//! One directory per invocation under the log root (optionally nested in a
//! job subdirectory), named `<timestamp>-<pid>` so runs sort by time. A
//! `latest` symlink always points at the most recent run. Nothing in a run
//! directory is ever rewritten.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, SecondsFormat};
use itertools::Itertools;

use crate::error::{Result, SshpError};
use crate::job::{Job, JobState};

/// File collecting the end-of-run summary inside the run directory.
pub const SUMMARY_FILE: &str = "sshp.log";

const STATUS_STATES: [JobState; 5] = [
    JobState::Success,
    JobState::Failed,
    JobState::Timeout,
    JobState::Killed,
    JobState::Aborted,
];

#[derive(Debug)]
pub struct RunDir {
    path: PathBuf,
}

impl RunDir {
    /// Create `<root>/[<job>/]<timestamp>-<pid>/` and repoint the scope's
    /// `latest` symlink at it.
    pub fn create(root: &Path, job: Option<&str>) -> Result<Self> {
        let scope = match job {
            Some(job) => root.join(job),
            None => root.to_path_buf(),
        };
        let id = format!(
            "{}-{}",
            Local::now().format("%Y%m%d-%H%M%S"),
            std::process::id()
        );
        let path = scope.join(&id);
        fs::create_dir_all(&path)?;
        let latest = scope.join("latest");
        let _ = fs::remove_file(&latest);
        std::os::unix::fs::symlink(&id, &latest)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Written before the first job starts.
    pub fn write_hosts_list(&self, hosts: &[String]) -> Result<()> {
        let mut file = File::create(self.path.join("hosts.list"))?;
        for host in hosts {
            writeln!(file, "{host}")?;
        }
        Ok(())
    }

    /// Open the append-only combined output file for one job and write its
    /// header line.
    pub fn open_host_log(
        &self,
        log_name: &str,
        host: &str,
        command: &str,
        start: DateTime<Local>,
    ) -> std::io::Result<HostLog> {
        HostLog::create(&self.path.join(format!("{log_name}.out")), host, command, start)
    }

    /// One `<state>.status` file per terminal classification, each a
    /// newline-terminated host list, possibly empty. Written at drain.
    pub fn write_status_files(&self, jobs: &[Job]) -> Result<()> {
        for state in STATUS_STATES {
            let hosts = jobs
                .iter()
                .filter(|job| job.state == state)
                .map(|job| job.host.as_str())
                .collect::<Vec<_>>();
            let content = if hosts.is_empty() {
                String::new()
            } else {
                format!("{}\n", hosts.iter().join("\n"))
            };
            fs::write(self.path.join(format!("{}.status", state.as_str())), content)?;
        }
        Ok(())
    }

    pub fn append_summary(&self, text: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path.join(SUMMARY_FILE))?;
        file.write_all(text.as_bytes())?;
        Ok(())
    }
}

/// Append-only combined output of one job. A single writer owns it from
/// header to footer; dropping it without [`HostLog::finish`] leaves the
/// footer out but still closes the file.
#[derive(Debug)]
pub struct HostLog {
    file: File,
}

impl HostLog {
    fn create(path: &Path, host: &str, command: &str, start: DateTime<Local>) -> std::io::Result<Self> {
        let mut file = File::create(path)?;
        writeln!(
            file,
            "# host={host} cmd={command} start={}",
            start.to_rfc3339_opts(SecondsFormat::Secs, false)
        )?;
        Ok(Self { file })
    }

    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        writeln!(self.file, "{line}")
    }

    /// Footer line; consumes the log so nothing can be written afterwards.
    pub fn finish(
        mut self,
        end: DateTime<Local>,
        exit_code: i32,
        state: JobState,
    ) -> std::io::Result<()> {
        writeln!(
            self.file,
            "# end={} exit={exit_code} state={}",
            end.to_rfc3339_opts(SecondsFormat::Secs, false),
            state.as_str()
        )?;
        self.file.flush()
    }
}

/// Resolve `-L` patterns against a run directory. Supported patterns are
/// `*.out`, `*.status`, `<host>.out`, `<status>.status` and `hosts.list`;
/// anything else, or a pattern matching no file, is a query error.
pub fn query_logs(
    root: &Path,
    job: Option<&str>,
    run_id: Option<&str>,
    patterns: &[String],
) -> Result<Vec<PathBuf>> {
    let scope = match job {
        Some(job) => root.join(job),
        None => root.to_path_buf(),
    };
    let dir = scope.join(run_id.unwrap_or("latest"));
    if !dir.is_dir() {
        return Err(SshpError::NoRunDir(dir));
    }
    let mut files = vec![];
    for pattern in patterns {
        match pattern.as_str() {
            "*.out" => files.extend(list_with_extension(&dir, "out", pattern)?),
            "*.status" => files.extend(list_with_extension(&dir, "status", pattern)?),
            name if name == "hosts.list"
                || name.ends_with(".out")
                || name.ends_with(".status") =>
            {
                let path = dir.join(name);
                if !path.is_file() {
                    return Err(SshpError::LogQuery(pattern.clone()));
                }
                files.push(path);
            }
            _ => return Err(SshpError::LogQuery(pattern.clone())),
        }
    }
    Ok(files)
}

fn list_with_extension(dir: &Path, ext: &str, pattern: &str) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|e| e == ext))
        .collect();
    if files.is_empty() {
        return Err(SshpError::LogQuery(pattern.to_string()));
    }
    files.sort();
    Ok(files)
}
