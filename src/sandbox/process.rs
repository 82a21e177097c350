use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::{Instant, timeout_at};

use super::backend::ExecutionBackend;
use super::language::Step;
use super::reaper::{reap_orphans, spawn_step};

const READ_CHUNK_SIZE: usize = 8192;
const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
/// Pipes are drained this long past the deadline before reading gives up
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Text captured from one stream, capped at the configured size
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Captured {
    pub text: String,
    pub truncated: bool,
}

#[derive(Debug)]
pub enum StepStatus {
    Exited(ExitStatus),
    TimedOut,
    /// The process could not be spawned or waited on
    Failed(io::Error),
}

#[derive(Debug)]
pub struct StepOutput {
    pub status: StepStatus,
    pub stdout: Captured,
    pub stderr: Captured,
}

impl StepOutput {
    pub fn success(&self) -> bool {
        matches!(&self.status, StepStatus::Exited(status) if status.success())
    }

    fn failed(error: io::Error) -> Self {
        Self {
            status: StepStatus::Failed(error),
            stdout: Captured::default(),
            stderr: Captured::default(),
        }
    }
}

/// Everything a step needs besides the command itself
pub struct StepContext<'a> {
    pub workdir: &'a Path,
    pub backend: &'a dyn ExecutionBackend,
    pub deadline: Instant,
    pub output_limit: usize,
}

/// Runs `step` in its own process group and waits for it until the deadline.
///
/// The group is SIGKILLed once the step finishes or times out, which takes
/// down anything the program left running in the background. Descendants that
/// moved to another group or session are killed by the reaper.
pub async fn run_step(step: &Step, stdin: Stdio, ctx: &StepContext<'_>) -> StepOutput {
    let mut command = Command::new(&step.program);
    command
        .args(&step.args)
        .current_dir(ctx.workdir)
        .env_clear()
        .env("PATH", host_path())
        .env("HOME", ctx.workdir)
        .env("TMPDIR", ctx.workdir)
        .env("LANG", "C.UTF-8")
        // Keeps glibc arena reservations of threaded runtimes under the address-space cap
        .env("MALLOC_ARENA_MAX", "2")
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    unsafe {
        command.pre_exec(|| {
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    ctx.backend.confine(&mut command);

    let (mut child, leader) = match spawn_step(&mut command) {
        Ok(spawned) => spawned,
        Err(e) => {
            log::warn!("Failed to spawn `{}`: {e}", step.program);
            return StepOutput::failed(e);
        }
    };
    // The child leads its own group, so its pid is the group id
    let pgid = child.id().map(|pid| pid as libc::pid_t);
    log::debug!("Spawned `{}` as process group {pgid:?}", step.program);

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let drain_deadline = ctx.deadline + DRAIN_GRACE;

    let wait = async {
        let status = match timeout_at(ctx.deadline, child.wait()).await {
            Ok(Ok(status)) => StepStatus::Exited(status),
            Ok(Err(e)) => StepStatus::Failed(e),
            Err(_) => StepStatus::TimedOut,
        };

        if let Some(pgid) = pgid {
            kill_process_group(pgid);
        }
        if matches!(status, StepStatus::TimedOut) {
            log::info!("`{}` exceeded the time limit, killed", step.program);
            let _ = child.start_kill();
            if let Err(e) = child.wait().await {
                log::warn!("Failed to reap timed out process: {e}");
            }
        }

        // The step is reaped; whatever it left outside its group goes now
        drop(leader);
        reap_orphans().await;
        status
    };

    let (status, stdout, stderr) = tokio::join!(
        wait,
        read_capped(stdout, ctx.output_limit, drain_deadline),
        read_capped(stderr, ctx.output_limit, drain_deadline),
    );

    StepOutput {
        status,
        stdout,
        stderr,
    }
}

fn kill_process_group(pgid: libc::pid_t) {
    // ESRCH just means nothing is left in the group
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        let e = io::Error::last_os_error();
        if e.raw_os_error() != Some(libc::ESRCH) {
            log::warn!("Failed to kill process group {pgid}: {e}");
        }
    }
}

/// Reads until EOF, keeping at most `limit` bytes and discarding the rest so
/// the writer never blocks on a full pipe
async fn read_capped<R: AsyncRead + Unpin>(
    reader: Option<R>,
    limit: usize,
    deadline: Instant,
) -> Captured {
    let Some(mut reader) = reader else {
        return Captured::default();
    };

    let mut buf = Vec::new();
    let mut truncated = false;
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match timeout_at(deadline, reader.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                let room = limit.saturating_sub(buf.len());
                if n > room {
                    truncated = true;
                }
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
            Ok(Err(e)) => {
                log::warn!("Failed to read step output: {e}");
                break;
            }
            Err(_) => {
                log::warn!("Output pipe still open past the deadline, stopped reading");
                break;
            }
        }
    }

    Captured {
        text: String::from_utf8_lossy(&buf).into_owned(),
        truncated,
    }
}

fn host_path() -> OsString {
    std::env::var_os("PATH").unwrap_or_else(|| FALLBACK_PATH.into())
}
