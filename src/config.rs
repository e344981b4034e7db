//! Configuration for sshp.
//!
//! Holds the clap struct for command line arguments and the immutable
//! `Settings` value resolved from them (plus the `SSHP_*` environment)
//! once at startup.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::{Result, SshpError};

#[derive(Parser, Debug)]
#[command(version)]
#[command(about = "Run a command on many hosts in parallel over SSH")]
pub struct Config {
    /// Parallelism (number of simultaneous SSH connections)
    #[arg(short, long, default_value_t = 4)]
    pub parallel: usize,

    /// Job name, added as a subdirectory of the log root
    #[arg(short, long)]
    pub job: Option<String>,

    /// Directory for output log files (default ~/.sshp)
    #[arg(short, long)]
    pub dirlog: Option<PathBuf>,

    /// Hosts list file, one host per line
    #[arg(short = 'f', long, conflicts_with = "hosts")]
    pub hostsfile: Option<PathBuf>,

    /// Hosts list
    #[arg(short = 'H', long, num_args = 1..)]
    pub hosts: Vec<String>,

    /// Local script to execute on each host (streamed to the remote stdin)
    #[arg(short, long)]
    pub script: Option<PathBuf>,

    /// Script arguments
    #[arg(short = 'a', long = "args", num_args = 1.., requires = "script")]
    pub script_args: Vec<String>,

    /// Timeout of each job, in seconds
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Delay between worker startups, in seconds
    #[arg(short = 'D', long, default_value_t = 0.3)]
    pub delay: f64,

    /// Resolve short hostnames in the SSHP_DOMAINS search list
    #[arg(short, long)]
    pub resolve: bool,

    /// Number of leading dot-separated labels kept when displaying a host
    /// (1 = short name, -1 = full name)
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub max_dots: i32,

    /// Print log files from a previous run instead of running
    /// (patterns: `*.out`, `*.status`, `<host>.out`, `<status>.status`, `hosts.list`)
    #[arg(short = 'L', long = "logs", num_args = 1..)]
    pub logs: Vec<String>,

    /// Run id to query with -L (default: latest)
    #[arg(short = 'i', long, requires = "logs")]
    pub run_id: Option<String>,

    /// Verbose progress on stderr when not on a terminal
    #[arg(short, long)]
    pub verbose: bool,

    /// Command to run on each host
    pub ssh_args: Vec<String>,
}

/// Status glyphs, overridable through the environment.
#[derive(Debug, Clone)]
pub struct Symbols {
    /// Left cap of a header segment (`SSHP_SYM_BEG`).
    pub begin: String,
    /// Right cap of a header segment (`SSHP_SYM_END`).
    pub end: String,
    /// Progress bar fill (`SSHP_SYM_PROG`).
    pub prog: String,
    /// Idle slot placeholder (`SSHP_SYM_RES`).
    pub rest: String,
}

impl Default for Symbols {
    fn default() -> Self {
        Self {
            begin: "\u{e0b6}".into(),
            end: "\u{e0b4}".into(),
            prog: "\u{25a0}".into(),
            rest: "\u{00b7}".into(),
        }
    }
}

impl Symbols {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            begin: env_or("SSHP_SYM_BEG", &defaults.begin),
            end: env_or("SSHP_SYM_END", &defaults.end),
            prog: env_or("SSHP_SYM_PROG", &defaults.prog),
            rest: env_or("SSHP_SYM_RES", &defaults.rest),
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    match env::var(name) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

/// Everything the engine needs, resolved once and immutable afterwards.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Program spawned for each job. Always `ssh` outside of tests.
    pub ssh_program: String,
    /// Default ssh options from `SSHP_OPTS`, shell-split.
    pub ssh_opts: Vec<String>,
    /// DNS search domains from `SSHP_DOMAINS`.
    pub domains: Vec<String>,
    pub symbols: Symbols,
    pub parallel: usize,
    pub timeout: Option<Duration>,
    pub delay: Duration,
    pub max_dots: i32,
    pub verbose: bool,
    /// Log root; run directories are created below it.
    pub dirlog: PathBuf,
    pub job: Option<String>,
    /// Remote command tokens appended after the host argument.
    pub command: Vec<String>,
    /// Local script streamed to the remote stdin instead of a command.
    pub script: Option<PathBuf>,
    /// What the operator asked for, for log headers and the dashboard.
    pub command_label: String,
}

impl Settings {
    pub fn resolve(cli: &Config) -> Result<Self> {
        let ssh_opts = match env::var("SSHP_OPTS") {
            Ok(opts) if !opts.is_empty() => {
                shell_words::split(&opts).map_err(|e| SshpError::SshOpts(e.to_string()))?
            }
            _ => vec![],
        };
        let domains = env::var("SSHP_DOMAINS")
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let dirlog = match &cli.dirlog {
            Some(dir) => dir.clone(),
            None => default_dirlog(),
        };
        let command_label = match &cli.script {
            Some(script) => {
                let mut label = script.display().to_string();
                for arg in &cli.script_args {
                    label.push(' ');
                    label.push_str(arg);
                }
                label
            }
            None => cli.ssh_args.join(" "),
        };
        let command = if cli.script.is_some() {
            // The script is fed to the remote stdin; with arguments the
            // remote shell must be told to read it and pass them on.
            if cli.script_args.is_empty() {
                vec![]
            } else {
                let mut tokens = vec!["sh".to_string(), "-s".to_string(), "--".to_string()];
                tokens.extend(cli.script_args.iter().cloned());
                tokens
            }
        } else {
            cli.ssh_args.clone()
        };
        Ok(Self {
            ssh_program: "ssh".to_string(),
            ssh_opts,
            domains,
            symbols: Symbols::from_env(),
            parallel: cli.parallel.max(1),
            timeout: cli.timeout.map(Duration::from_secs),
            delay: Duration::from_secs_f64(cli.delay.max(0.0)),
            max_dots: cli.max_dots,
            verbose: cli.verbose,
            dirlog,
            job: cli.job.clone(),
            command,
            script: cli.script.clone(),
            command_label,
        })
    }
}

fn default_dirlog() -> PathBuf {
    match env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".sshp"),
        None => PathBuf::from(".sshp"),
    }
}
