use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshpError {
    #[error("cannot open {}: {source}", path.display())]
    HostsFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot read {}: {source}", path.display())]
    Script {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no hosts definition")]
    NoHosts,

    #[error("no ssh command supplied")]
    NoCommand,

    #[error("invalid SSHP_OPTS: {0}")]
    SshOpts(String),

    #[error("log directory error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no run directory at {}", .0.display())]
    NoRunDir(PathBuf),

    #[error("no log files match '{0}'")]
    LogQuery(String),
}

pub type Result<T> = std::result::Result<T, SshpError>;
