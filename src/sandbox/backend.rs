use std::io;
use std::time::Duration;

use tokio::process::Command;

use crate::config::{ResourceLimits, RunAs};

const DEFAULT_RUN_AS_PROCESSES: u64 = 64;

/// Confinement applied to every spawned step
///
/// Implementations only configure the command; spawning, waiting and killing
/// stay with the engine so the timeout is enforced the same way everywhere.
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Adjusts `command` right before it is spawned
    fn confine(&self, command: &mut Command);
}

/// Runs steps with no confinement beyond the engine's wall-clock timeout
pub struct PlainBackend;

impl ExecutionBackend for PlainBackend {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn confine(&self, _command: &mut Command) {}
}

/// Applies resource ceilings and optionally drops privileges in the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlimitBackend {
    cpu_seconds: u64,
    address_space: Option<u64>,
    open_files: Option<u64>,
    file_size: Option<u64>,
    processes: Option<u64>,
    run_as: Option<RunAs>,
}

impl RlimitBackend {
    pub fn new(limits: &ResourceLimits, time_limit: Duration, run_as: Option<RunAs>) -> Self {
        let cpu_seconds = limits
            .cpu_time
            .map(|s| s.0)
            .unwrap_or_else(|| time_limit.as_secs() + 1);

        Self {
            cpu_seconds,
            address_space: limits.address_space.map(|b| b.0),
            open_files: limits.open_files,
            file_size: limits.file_size.map(|b| b.0),
            // A dedicated user only owns the steps' processes, so a small cap is safe
            processes: limits
                .processes
                .or(run_as.map(|_| DEFAULT_RUN_AS_PROCESSES)),
            run_as,
        }
    }

    /// Runs between fork and exec, so only async-signal-safe calls are allowed
    fn apply_in_child(&self) -> io::Result<()> {
        let set_limit = |resource, value: u64| -> io::Result<()> {
            let limit = libc::rlimit {
                rlim_cur: value as libc::rlim_t,
                rlim_max: value as libc::rlim_t,
            };
            if unsafe { libc::setrlimit(resource, &limit) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        };

        set_limit(libc::RLIMIT_CPU, self.cpu_seconds)?;
        if let Some(bytes) = self.address_space {
            set_limit(libc::RLIMIT_AS, bytes)?;
        }
        if let Some(count) = self.open_files {
            set_limit(libc::RLIMIT_NOFILE, count)?;
        }
        if let Some(bytes) = self.file_size {
            set_limit(libc::RLIMIT_FSIZE, bytes)?;
        }
        if let Some(count) = self.processes {
            set_limit(libc::RLIMIT_NPROC, count)?;
        }

        if let Some(owner) = self.run_as {
            // Groups must go first: after setuid we lose the right to change them
            unsafe {
                if libc::setgroups(0, std::ptr::null()) != 0
                    || libc::setgid(owner.gid) != 0
                    || libc::setuid(owner.uid) != 0
                {
                    return Err(io::Error::last_os_error());
                }
            }
        }

        Ok(())
    }
}

impl ExecutionBackend for RlimitBackend {
    fn name(&self) -> &'static str {
        "rlimit"
    }

    fn confine(&self, command: &mut Command) {
        let backend = *self;
        unsafe {
            command.pre_exec(move || backend.apply_in_child());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ByteSize, Second};
    use crate::sandbox::language::Step;
    use crate::sandbox::process::{StepContext, run_step};
    use pretty_assertions::assert_eq;
    use std::process::Stdio;
    use tokio::time::Instant;

    async fn shell_output(backend: &dyn ExecutionBackend, script: &str) -> String {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = StepContext {
            workdir: tmp.path(),
            backend,
            deadline: Instant::now() + Duration::from_secs(5),
            output_limit: 4096,
        };
        let step = Step {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        };
        let out = run_step(&step, Stdio::null(), &ctx).await;
        out.stdout.text.trim().to_string()
    }

    // Helper function to read one limit as the child sees it
    async fn child_limit(backend: &dyn ExecutionBackend, name: &str) -> String {
        let script = format!("grep '^Max {name} ' /proc/self/limits");
        let line = shell_output(backend, &script).await;
        line.trim_start_matches(&format!("Max {name}"))
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string()
    }

    #[test]
    fn test_cpu_time_defaults_to_time_limit() {
        let backend = RlimitBackend::new(&ResourceLimits::default(), Duration::from_secs(5), None);
        assert_eq!(backend.cpu_seconds, 6);

        let limits = ResourceLimits {
            cpu_time: Some(Second(2)),
            address_space: Some(ByteSize(1 << 30)),
            ..ResourceLimits::default()
        };
        let backend = RlimitBackend::new(&limits, Duration::from_secs(5), None);
        assert_eq!(backend.cpu_seconds, 2);
        assert_eq!(backend.address_space, Some(1 << 30));
    }

    #[test]
    fn test_process_cap_defaults_only_for_dedicated_user() {
        let limits = ResourceLimits::default();
        let backend = RlimitBackend::new(&limits, Duration::from_secs(5), None);
        assert_eq!(backend.processes, None);

        let run_as = Some(RunAs { uid: 1000, gid: 1000 });
        let backend = RlimitBackend::new(&limits, Duration::from_secs(5), run_as);
        assert_eq!(backend.processes, Some(DEFAULT_RUN_AS_PROCESSES));

        let limits = ResourceLimits {
            processes: Some(10),
            ..ResourceLimits::default()
        };
        let backend = RlimitBackend::new(&limits, Duration::from_secs(5), run_as);
        assert_eq!(backend.processes, Some(10));
    }

    #[tokio::test]
    async fn test_limits_are_visible_to_child() {
        let limits = ResourceLimits {
            cpu_time: Some(Second(3)),
            open_files: Some(64),
            address_space: Some(ByteSize(1 << 30)),
            processes: Some(4096),
            ..ResourceLimits::default()
        };
        let backend = RlimitBackend::new(&limits, Duration::from_secs(5), None);

        assert_eq!(child_limit(&backend, "open files").await, "64");
        assert_eq!(child_limit(&backend, "cpu time").await, "3");
        assert_eq!(child_limit(&backend, "address space").await, "1073741824");
        assert_eq!(child_limit(&backend, "processes").await, "4096");
    }

    #[tokio::test]
    async fn test_plain_backend_leaves_command_untouched() {
        let inherited = child_limit(&PlainBackend, "open files").await;
        assert!(!inherited.is_empty());
        assert_eq!(PlainBackend.name(), "plain");
    }
}
