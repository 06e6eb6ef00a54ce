use anyhow::{Context, Result, anyhow};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Upper bound on retained child stderr; only the tail is kept.
const STDERR_TAIL_LIMIT: usize = 64 * 1024;

/// A spawned child with its stderr continuously drained into a buffer.
///
/// Exactly one of waiting to completion or `shutdown` consumes the handle's
/// process; the drain task ends on its own when the pipe closes.
pub struct ChildHandle {
    child: Child,
    command: String,
    stderr: Arc<Mutex<String>>,
    drain: Option<tokio::task::JoinHandle<()>>,
}

/// Spawn `argv` in `dir` with piped stderr. stdout is passed through so the
/// workload's own output stays visible. Never blocks on the child.
pub fn spawn(argv: &[String], dir: &Path) -> Result<ChildHandle> {
    let command = argv.join(" ");
    let (program, args) = argv.split_first().context("empty command line")?;

    let mut child = Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn: {command}"))?;

    let stderr = Arc::new(Mutex::new(String::new()));
    let drain = child.stderr.take().map(|pipe| {
        let buffer = Arc::clone(&stderr);
        let name = command.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("[{name}] {line}");
                if let Ok(mut buf) = buffer.lock() {
                    buf.push_str(&line);
                    buf.push('\n');
                    if buf.len() > STDERR_TAIL_LIMIT {
                        let cut = buf.len() - STDERR_TAIL_LIMIT;
                        buf.drain(..cut);
                    }
                }
            }
        })
    });

    Ok(ChildHandle {
        child,
        command,
        stderr,
        drain,
    })
}

impl ChildHandle {
    /// Await exit. Success iff the exit status is zero; otherwise the error
    /// carries the command line and the captured stderr.
    pub async fn wait(&mut self) -> Result<()> {
        let status = self
            .child
            .wait()
            .await
            .with_context(|| format!("failed to wait for: {}", self.command))?;
        // The pipe is closed now; let the drain task flush the tail
        if let Some(drain) = self.drain.take() {
            let _ = drain.await;
        }
        if status.success() {
            Ok(())
        } else {
            Err(anyhow!("{}: {}", self.command, self.error_output()))
        }
    }

    /// Graceful termination: SIGTERM, wait up to `timeout`, then SIGKILL.
    ///
    /// The exit status is deliberately ignored; a child stopped by our own
    /// signal reports non-zero.
    pub async fn shutdown(mut self, timeout: Duration) -> Result<()> {
        if let Some(pid) = self.child.id() {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!("could not signal '{}': {e}", self.command);
            }
        }

        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => {
                status.with_context(|| format!("failed to wait for: {}", self.command))?;
            },
            Err(_) => {
                warn!(
                    "'{}' did not exit within {}s, killing",
                    self.command,
                    timeout.as_secs()
                );
                self.child
                    .kill()
                    .await
                    .with_context(|| format!("failed to kill: {}", self.command))?;
            },
        }
        if let Some(drain) = self.drain.take() {
            let _ = drain.await;
        }
        Ok(())
    }

    fn error_output(&self) -> String {
        let captured = self
            .stderr
            .lock()
            .map(|buf| buf.trim().to_string())
            .unwrap_or_default();
        if captured.is_empty() {
            "Unknown error".to_string()
        } else {
            captured
        }
    }
}

/// Run `argv` to completion and return its stdout. Used for runtime queries
/// where the full output is the result.
pub async fn run_capture(argv: &[String], dir: &Path) -> Result<String> {
    let command = argv.join(" ");
    let (program, args) = argv.split_first().context("empty command line")?;

    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("failed to run: {command}"))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let captured = String::from_utf8_lossy(&output.stderr);
        let captured = captured.trim();
        Err(anyhow!(
            "{}: {}",
            command,
            if captured.is_empty() {
                "Unknown error"
            } else {
                captured
            }
        ))
    }
}
