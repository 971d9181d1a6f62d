//! Runs user-defined custom check commands.

use anyhow::{bail, Context, Result};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Maximum number of stderr characters carried into an error message.
const MAX_STDERR_CHARS: usize = 512;

/// Cap on captured stdout and stderr. Anything beyond it is drained and
/// discarded so the child never blocks on a full pipe.
const MAX_OUTPUT_BYTES: u64 = 1024 * 1024;

/// Runs `command` through the platform shell and returns its stdout.
///
/// Output that parses as JSON is returned as that JSON value, anything else
/// as a trimmed string. A non-zero exit status is an error carrying the
/// command's stderr, as is stdout larger than 1 MiB. On unix the command
/// runs in its own process group, and the whole group is killed when
/// `cancel` fires or the returned future is dropped (e.g. by a timeout).
pub async fn run_command(command: &str, cancel: &CancellationToken) -> Result<serde_json::Value> {
    let mut cmd = shell_command(command);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn command `{command}`"))?;
    let mut group = GroupKill::new(child.id());

    let stdout = child.stdout.take().context("command stdout not captured")?;
    let stderr = child.stderr.take().context("command stderr not captured")?;
    let finished = async {
        tokio::try_join!(read_capped(stdout), read_capped(stderr), child.wait())
    };

    let ((stdout, stdout_truncated), (stderr, _), status) = tokio::select! {
        _ = cancel.cancelled() => bail!("command `{command}` cancelled"),
        finished = finished => finished.context("failed to wait for command")?,
    };
    group.disarm();

    if !status.success() {
        let stderr = String::from_utf8_lossy(&stderr);
        let stderr: String = stderr.trim().chars().take(MAX_STDERR_CHARS).collect();
        bail!("command exited with {}: {}", status, stderr);
    }
    if stdout_truncated {
        bail!("command output exceeded {MAX_OUTPUT_BYTES} bytes");
    }

    Ok(parse_output(&String::from_utf8_lossy(&stdout)))
}

/// Reads at most [`MAX_OUTPUT_BYTES`] and drains the rest. The flag is set
/// when output was cut off.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::new();
    (&mut reader)
        .take(MAX_OUTPUT_BYTES)
        .read_to_end(&mut buf)
        .await?;
    let rest = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    Ok((buf, rest > 0))
}

/// Kills the child's process group on drop unless disarmed, so background
/// jobs started by the shell die with it.
struct GroupKill {
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: Option<i32>,
}

impl GroupKill {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|pid| i32::try_from(pid).ok()),
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupKill {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            // SAFETY: kill(2) with a negative pid only signals the process
            // group the child leads; no memory is touched.
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }
}

fn parse_output(stdout: &str) -> serde_json::Value {
    let trimmed = stdout.trim();
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(value) if !trimmed.is_empty() => value,
        _ => serde_json::Value::String(trimmed.to_string()),
    }
}

#[cfg(not(windows))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}
