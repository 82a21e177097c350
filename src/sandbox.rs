mod backend;
mod engine;
mod language;
mod process;
mod reaper;
mod sanitize;
mod workspace;

pub use backend::{ExecutionBackend, PlainBackend, RlimitBackend};
pub use engine::{Engine, ExecutionRequest, ExecutionResult, Outcome};
pub use language::{Language, Pipeline, Step, Toolchain, default_languages, java_entry_class};
pub use sanitize::{HOME_TOKEN, PROJECT_TOKEN, Sanitizer, WORKSPACE_TOKEN};
pub use workspace::{LiveWorkspaces, Workspace, WorkspaceRoot};

use anyhow::{Result, bail};

use crate::config::{BackendKind, SandboxConfig};

/// Request-level failures of the engine; everything else becomes output text
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("language {0} has no execution pipeline configured")]
    UnwiredLanguage(Language),
    #[error("the execution engine is shutting down")]
    Closed,
}

/// Creates the confinement backend selected in the configuration
///
/// The `plain` backend only enforces the wall-clock timeout and is meant for
/// development machines. The `rlimit` backend adds resource ceilings and, when
/// `run_as` is set, drops to that user, which requires running as root.
pub fn create_backend(config: &SandboxConfig) -> Result<Box<dyn ExecutionBackend>> {
    match config.backend {
        BackendKind::Plain => {
            log::info!("Creating plain execution backend");
            log::warn!("The plain backend provides NO resource limits - use only in trusted environments");
            if config.run_as.is_some() {
                log::warn!("`run_as` is ignored by the plain backend");
            }
            Ok(Box::new(PlainBackend))
        }
        BackendKind::Rlimit => {
            if config.run_as.is_some() && unsafe { libc::geteuid() } != 0 {
                bail!("`run_as` requires the server to run as root");
            }
            log::info!("Creating rlimit execution backend");
            Ok(Box::new(RlimitBackend::new(
                &config.limits,
                config.time_limit(),
                config.run_as,
            )))
        }
    }
}
