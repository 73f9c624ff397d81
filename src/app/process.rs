//! Build step and supervised subprocess for a single app run.

use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::errors::AppError;
use crate::topic::Topic;

/// Run the build command inside `dir`. A non-zero exit reports the tool's
/// stderr verbatim.
pub(crate) async fn build(dir: &Path, command: &[String]) -> Result<(), AppError> {
    let Some((program, args)) = command.split_first() else {
        return Err(AppError::Build {
            message: "empty build command".to_string(),
        });
    };

    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| AppError::Build {
            message: format!("failed to run {}: {}", program, e),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = if stderr.trim().is_empty() {
            format!("{} exited with {}", command.join(" "), output.status)
        } else {
            stderr.trim_end().to_string()
        };
        return Err(AppError::Build { message });
    }

    Ok(())
}

/// A running child process plus the two tasks draining its output pipes.
#[derive(Debug)]
pub(crate) struct ProcessHandle {
    child: Child,
    pid: u32,
    command_line: String,
    pumps: Vec<JoinHandle<()>>,
}

impl ProcessHandle {
    /// Spawn `program args...` in `dir`, pumping stdout and stderr into the
    /// given topics line by line.
    pub(crate) fn spawn(
        name: &str,
        dir: &Path,
        program: &Path,
        args: &[String],
        stdout: Arc<Topic>,
        stderr: Arc<Topic>,
    ) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program.display()))?;

        let pid = child.id().context("Process exited before its pid was read")?;
        let out = child.stdout.take().context("stdout was not captured")?;
        let err = child.stderr.take().context("stderr was not captured")?;

        let pumps = vec![
            pump(out, stdout, name.to_string(), "stdout"),
            pump(err, stderr, name.to_string(), "stderr"),
        ];

        let command_line = std::iter::once(program.display().to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");

        Ok(Self {
            child,
            pid,
            command_line,
            pumps,
        })
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Exit status if the process has already exited.
    pub(crate) fn try_exit(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// SIGTERM, then SIGKILL once `grace` has passed. Returns the exit code
    /// (-1 when the process was ended by a signal).
    pub(crate) async fn terminate(&mut self, grace: Duration) -> io::Result<i32> {
        if self.child.try_wait()?.is_none() {
            send_sigterm(self.pid)?;
        }

        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(pid = self.pid, "process ignored SIGTERM, killing");
                self.child.kill().await?;
                self.child.wait().await?
            }
        };

        Ok(status.code().unwrap_or(-1))
    }

    /// Wait for both output pumps to finish, aborting any still running after
    /// `within`.
    pub(crate) async fn join_pumps(&mut self, within: Duration) {
        for mut pump in self.pumps.drain(..) {
            if tokio::time::timeout(within, &mut pump).await.is_err() {
                warn!(pid = self.pid, "output pump did not finish, aborting");
                pump.abort();
            }
        }
    }
}

fn send_sigterm(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    // Already reaped or exiting.
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

/// Output without a newline is split into records of at most this many bytes.
const MAX_LINE_BYTES: usize = 64 * 1024;

fn pump<R>(reader: R, topic: Arc<Topic>, app: String, stream: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let mut line_reader = (&mut reader).take(MAX_LINE_BYTES as u64);
            match line_reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']);
                    let delivered = topic.publish(line);
                    trace!(app = %app, stream, delivered, "{}", line);
                }
                Err(e) => {
                    warn!(app = %app, stream, error = %e, "output pump read failed");
                    break;
                }
            }
        }
        debug!(app = %app, stream, "output pump finished");
    })
}
