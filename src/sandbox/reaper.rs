//! Cleanup of descendants that leave their step's process group.
//!
//! A submitted program can escape `killpg` with `setsid` or `setpgid`. Once the
//! server is a child subreaper, such a process is re-parented to the server as
//! soon as its parent dies, so after every step every adopted process that is
//! not a running step is killed and reaped.

use std::fs;
use std::io;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::process::{Child, Command};

const REAP_ROUNDS: usize = 50;
const REAP_PAUSE: Duration = Duration::from_millis(10);

/// Pids of the step processes currently owned by `run_step`
static STEP_LEADERS: Mutex<Vec<libc::pid_t>> = parking_lot::const_mutex(Vec::new());

/// Makes orphaned descendants re-parent to this process instead of init
pub fn become_subreaper() -> io::Result<()> {
    if unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Registration of a spawned step; dropping it makes the pid fair game
pub(super) struct StepLeader(Option<libc::pid_t>);

impl Drop for StepLeader {
    fn drop(&mut self) {
        if let Some(pid) = self.0 {
            STEP_LEADERS.lock().retain(|p| *p != pid);
        }
    }
}

/// Spawns `command` and registers it in one critical section, so a concurrent
/// sweep never sees the new child unregistered
pub(super) fn spawn_step(command: &mut Command) -> io::Result<(Child, StepLeader)> {
    let mut leaders = STEP_LEADERS.lock();
    let child = command.spawn()?;
    let pid = child.id().map(|pid| pid as libc::pid_t);
    if let Some(pid) = pid {
        leaders.push(pid);
    }
    Ok((child, StepLeader(pid)))
}

/// Kills and reaps adopted processes until none is left alive
pub(super) async fn reap_orphans() {
    for _ in 0..REAP_ROUNDS {
        if kill_adopted() == 0 {
            return;
        }
        // Killed processes need a moment to die and hand over their children
        tokio::time::sleep(REAP_PAUSE).await;
    }
    log::warn!("Adopted processes still alive after {REAP_ROUNDS} rounds");
}

/// One sweep: SIGKILL live adopted processes and reap dead ones.
/// Returns how many were still alive.
fn kill_adopted() -> usize {
    let leaders = STEP_LEADERS.lock();
    let mut alive = 0;
    for (pid, state) in adopted_children() {
        if leaders.contains(&pid) {
            continue;
        }
        if state != 'Z' {
            log::info!("Killing process {pid} that escaped its process group");
            unsafe { libc::kill(pid, libc::SIGKILL) };
            alive += 1;
        }
        // An unreaped child keeps its pid, so the kill above cannot hit a reused one
        unsafe { libc::waitpid(pid, std::ptr::null_mut(), libc::WNOHANG) };
    }
    alive
}

/// Children of this process with their scheduler state, read from `/proc`
fn adopted_children() -> Vec<(libc::pid_t, char)> {
    let me = std::process::id() as libc::pid_t;
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };

    entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse::<libc::pid_t>().ok())
        .filter_map(|pid| {
            let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
            let (state, ppid) = parse_stat(&stat)?;
            (ppid == me).then_some((pid, state))
        })
        .collect()
}

/// Extracts state and parent pid; the command name may contain spaces or `)`
fn parse_stat(stat: &str) -> Option<(char, libc::pid_t)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((state, ppid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat() {
        assert_eq!(
            parse_stat("4242 (sh) S 17 4242 4242 0 -1 4194560 110 0"),
            Some(('S', 17))
        );
        assert_eq!(
            parse_stat("77 (evil) Z 1 (x)) R 3 77 77 0"),
            Some(('R', 3))
        );
        assert_eq!(parse_stat("garbage"), None);
    }

    #[tokio::test]
    async fn test_registered_steps_are_spared() {
        let (mut child, leader) = spawn_step(Command::new("sleep").arg("5")).unwrap();
        let pid = child.id().unwrap() as libc::pid_t;

        assert!(adopted_children().iter().any(|(p, _)| *p == pid));
        kill_adopted();
        assert!(child.try_wait().unwrap().is_none());

        child.kill().await.unwrap();
        drop(leader);
        assert!(!STEP_LEADERS.lock().contains(&pid));
    }
}
