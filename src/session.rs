//! SSH child process wrapper.
//!
//! Spawns the OpenSSH client for one job with BatchMode forced on, streams
//! its combined stdout and stderr line-wise into a channel, and knows how
//! to terminate it politely (SIGTERM) or forcefully (SIGKILL).

use std::process::Stdio;
use std::sync::Arc;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};

use crate::config::Settings;

pub struct SshSession {
    pub child: Child,
    pid: Option<u32>,
}

impl SshSession {
    /// Spawn `ssh -T -o BatchMode=yes [SSHP_OPTS...] host [command...]`.
    /// When `script` is set its bytes are fed to the child's stdin and the
    /// pipe is closed; otherwise stdin stays closed. Returns the session
    /// and the receiving end of the combined output stream.
    pub fn spawn(
        settings: &Settings,
        host: &str,
        script: Option<Arc<Vec<u8>>>,
    ) -> std::io::Result<(Self, flume::Receiver<String>)> {
        let mut command = Command::new(&settings.ssh_program);
        command
            .arg("-T")
            .args(["-o", "BatchMode=yes"])
            .args(&settings.ssh_opts)
            .arg(host)
            .args(&settings.command)
            .stdin(if script.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn()?;

        if let Some(bytes) = script {
            let mut stdin = child.stdin.take().expect("stdin was piped");
            tokio::spawn(async move {
                let _ = stdin.write_all(&bytes).await;
                let _ = stdin.shutdown().await;
            });
        }

        let (line_tx, line_rx) = flume::unbounded();
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        tokio::spawn(stream_lines(stdout, line_tx.clone()));
        tokio::spawn(stream_lines(stderr, line_tx));

        let pid = child.id();
        Ok((Self { child, pid }, line_rx))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the child to exit. Processes it started on the remote side are
    /// not reaped; only the local client is signalled.
    pub fn terminate(&self) {
        if let Some(pid) = self.pid {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    /// SIGKILL, after the grace window has passed.
    pub async fn force_kill(&mut self) {
        let _ = self.child.kill().await;
    }
}

/// Forward one output stream to the line channel, splitting on `\n` or
/// `\r`. Ends at EOF; dropping the last sender closes the channel.
async fn stream_lines<R>(stream: R, tx: flume::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line_buf = String::with_capacity(256);
    loop {
        let buflen;
        {
            let Ok(buf) = reader.fill_buf().await else {
                break;
            };
            buflen = buf.len();
            // An empty buffer means the stream reached EOF.
            if buf.is_empty() {
                break;
            }
            for c in buf.iter().map(|c| *c as char) {
                match c {
                    '\r' | '\n' => {
                        if tx.send(std::mem::take(&mut line_buf)).is_err() {
                            return;
                        }
                    }
                    _ => line_buf.push(c),
                }
            }
        }
        reader.consume(buflen);
    }
    if !line_buf.is_empty() {
        let _ = tx.send(line_buf);
    }
}
