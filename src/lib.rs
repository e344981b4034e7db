//! sshp: run a command on many hosts in parallel over SSH.

// Command line arguments and resolved settings.
pub mod config;
// Keyboard and signal control plane.
pub mod control;
// Error handling.
pub mod error;
// Hosts input, resolution and presentation.
pub mod host;
// Job record and its state machine.
pub mod job;
// Run directory layout, per-host logs and log queries.
pub mod logdir;
// Pool state shared by workers, renderer and control plane.
pub mod pool;
// Terminal dashboard.
pub mod render;
// Run driver.
pub mod runner;
// SSH child process wrapper.
pub mod session;
// Worker loop.
pub mod worker;

pub use config::{Config, Settings, Symbols};
pub use error::{Result, SshpError};
pub use job::{Job, JobState, KillReason};
pub use logdir::{query_logs, HostLog, RunDir};
pub use pool::{Pool, PoolSnapshot, SlotSnapshot};
pub use runner::{Engine, RunSummary};
