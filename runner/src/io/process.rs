//! Child processes for agents and Ward commands.
//!
//! Both callers share one timeout policy: wait up to the limit, then kill and
//! reap. Output is either left on the terminal or drained on reader threads
//! into bounded buffers, so a chatty child can never fill a pipe and hang.
//!
//! Captured children run in their own process group and a timeout kills the
//! whole group; otherwise a grandchild holding the pipes open would keep the
//! readers (and the caller) blocked past the limit. Inherited children stay in
//! the terminal's foreground group, so only the direct child is killed.

use std::borrow::Cow;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

const READ_CHUNK: usize = 8 * 1024;

/// How a child ended.
#[derive(Debug, Clone, Copy)]
pub struct Finished {
    pub status: ExitStatus,
    /// Killed after the timeout; `status` is the post-kill status.
    pub timed_out: bool,
}

/// One output stream, kept up to a byte limit.
#[derive(Debug, Clone, Default)]
pub struct CapturedStream {
    pub bytes: Vec<u8>,
    /// Bytes read past the limit and discarded.
    pub dropped: usize,
}

impl CapturedStream {
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

/// Captured result of [`run_captured`].
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    pub timed_out: bool,
}

/// Run `cmd` with piped output, keeping at most `limit_bytes` per stream.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64, limit_bytes = limit_bytes))]
pub fn run_captured(mut cmd: Command, timeout: Duration, limit_bytes: usize) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    own_process_group(&mut cmd);
    let mut child = spawn(cmd)?;

    let stdout = child.stdout.take().ok_or_else(|| anyhow!("stdout not piped"))?;
    let stderr = child.stderr.take().ok_or_else(|| anyhow!("stderr not piped"))?;
    let stdout = thread::spawn(move || drain(stdout, limit_bytes));
    let stderr = thread::spawn(move || drain(stderr, limit_bytes));

    let finished = wait_or_kill(&mut child, timeout, KillScope::Group)?;
    let stdout = collect(stdout).context("collect stdout")?;
    let stderr = collect(stderr).context("collect stderr")?;
    if stdout.dropped > 0 || stderr.dropped > 0 {
        warn!(
            stdout_dropped = stdout.dropped,
            stderr_dropped = stderr.dropped,
            "output over limit"
        );
    }

    Ok(CommandOutput {
        status: finished.status,
        stdout,
        stderr,
        timed_out: finished.timed_out,
    })
}

/// Run `cmd` on this process's terminal. Nothing is captured.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64))]
pub fn run_inherited(mut cmd: Command, timeout: Duration) -> Result<Finished> {
    cmd.stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    let mut child = spawn(cmd)?;
    wait_or_kill(&mut child, timeout, KillScope::Child)
}

/// What a timeout kills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillScope {
    Child,
    /// The child's process group; the child must lead it.
    Group,
}

fn spawn(mut cmd: Command) -> Result<Child> {
    debug!(program = ?cmd.get_program(), "spawning child");
    cmd.spawn().map_err(|err| {
        error!(program = ?cmd.get_program(), err = %err, "spawn failed");
        anyhow!(err).context(format!("spawn {}", cmd.get_program().to_string_lossy()))
    })
}

fn wait_or_kill(child: &mut Child, timeout: Duration, scope: KillScope) -> Result<Finished> {
    if let Some(status) = child.wait_timeout(timeout).context("wait for child")? {
        debug!(code = ?status.code(), "child exited");
        return Ok(Finished {
            status,
            timed_out: false,
        });
    }
    warn!(timeout_ms = timeout.as_millis() as u64, ?scope, "child timed out; killing");
    if scope == KillScope::Group {
        kill_process_group(child)?;
    }
    child.kill().context("kill child")?;
    let status = child.wait().context("reap child")?;
    Ok(Finished {
        status,
        timed_out: true,
    })
}

#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_: &mut Command) {}

#[cfg(unix)]
fn kill_process_group(child: &Child) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = i32::try_from(child.id()).context("child pid out of range")?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(anyhow!(err).context("kill process group")),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_: &Child) -> Result<()> {
    Ok(())
}

fn drain<R: Read>(mut reader: R, limit: usize) -> Result<CapturedStream> {
    let mut stream = CapturedStream::default();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).context("read child output")?;
        if n == 0 {
            return Ok(stream);
        }
        let keep = n.min(limit.saturating_sub(stream.bytes.len()));
        stream.bytes.extend_from_slice(&chunk[..keep]);
        stream.dropped += n - keep;
    }
}

fn collect(handle: JoinHandle<Result<CapturedStream>>) -> Result<CapturedStream> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader panicked"))?
}

/// Save captured output to `path`, one section per stream.
pub fn write_output_log(path: &Path, output: &CommandOutput, label: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    for (name, stream) in [("stdout", &output.stdout), ("stderr", &output.stderr)] {
        buf.push_str(&format!("=== {} ===\n", name));
        buf.push_str(&stream.text());
        if !buf.ends_with('\n') {
            buf.push('\n');
        }
        if stream.dropped > 0 {
            buf.push_str(&format!("[{} {} dropped {} bytes]\n", label, name, stream.dropped));
        }
    }
    match (output.timed_out, output.status.code()) {
        (true, _) => buf.push_str(&format!("[{} timed out]\n", label)),
        (false, Some(code)) => buf.push_str(&format!("[{} exit code {}]\n", label, code)),
        (false, None) => buf.push_str(&format!("[{} killed by signal]\n", label)),
    }
    fs::write(path, buf).with_context(|| format!("write log {}", path.display()))
}
