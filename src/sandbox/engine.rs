use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::config::SandboxConfig;

use super::backend::ExecutionBackend;
use super::language::{Language, PreparedPipeline, Toolchain};
use super::process::{StepContext, StepOutput, StepStatus, run_step};
use super::reaper::become_subreaper;
use super::sanitize::{Sanitizer, WORKSPACE_TOKEN};
use super::workspace::{Workspace, WorkspaceRoot};
use super::{EngineError, create_backend};

const ALLOCATION_FAILURE_MESSAGE: &str = "System Error: unable to allocate a workspace";
const PREPARATION_FAILURE_MESSAGE: &str = "System Error: unable to prepare the workspace";
/// Captured beyond the output cap so that a path crossing the cap is still
/// whole when it gets sanitized
const CAPTURE_SLACK: usize = 4096;

/// A validated request, ready for execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub language: Language,
    pub source_code: String,
    pub stdin: String,
}

/// How an execution concluded; not part of the wire response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    CompileFailure,
    RuntimeFailure,
    TimeoutExceeded,
    AllocationFailure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub output: String,
    pub outcome: Outcome,
    /// Whether the chosen stream hit the output cap
    pub truncated: bool,
}

impl ExecutionResult {
    fn new(outcome: Outcome, output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            outcome,
            truncated: false,
        }
    }
}

/// Runs untrusted programs, one disposable workspace per request
pub struct Engine {
    toolchain: Toolchain,
    root: WorkspaceRoot,
    backend: Box<dyn ExecutionBackend>,
    /// Host paths plus the workspace root; the workspace itself is added per request
    sanitizer: Sanitizer,
    permits: Semaphore,
    time_limit: Duration,
    output_limit: usize,
}

impl Engine {
    pub fn build(config: &SandboxConfig) -> anyhow::Result<Self> {
        let toolchain = Toolchain::new(config.languages())?;
        let root = WorkspaceRoot::create(config.workspace_root(), config.run_as)?;
        let backend = create_backend(config)?;
        let sanitizer = Sanitizer::for_host().with_path(root.path(), WORKSPACE_TOKEN);
        if let Err(e) = become_subreaper() {
            log::warn!("Unable to adopt orphaned processes, escaped descendants may outlive their run: {e}");
        }
        let max_concurrent = config.max_concurrent();

        log::info!(
            "Execution engine ready: backend {}, time limit {:?}, up to {max_concurrent} concurrent runs",
            backend.name(),
            config.time_limit()
        );

        Ok(Self {
            toolchain,
            root,
            backend,
            sanitizer,
            permits: Semaphore::new(max_concurrent),
            time_limit: config.time_limit(),
            output_limit: config.output_limit(),
        })
    }

    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    pub fn workspace_root(&self) -> &WorkspaceRoot {
        &self.root
    }

    /// Rejects new executions; runs already holding a permit finish normally
    pub fn close(&self) {
        self.permits.close();
    }

    /// Executes `request` and always produces a result, except for languages
    /// without a pipeline, which are rejected before a workspace exists
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, EngineError> {
        let prepared = self
            .toolchain
            .prepare(request.language, &request.source_code)?;

        // Excess requests queue here instead of fanning out child processes
        let _permit = self.permits.acquire().await.map_err(|_| EngineError::Closed)?;

        let workspace = match self.root.allocate().await {
            Ok(workspace) => workspace,
            Err(e) => {
                log::error!("Failed to allocate workspace: {e}");
                return Ok(ExecutionResult::new(
                    Outcome::AllocationFailure,
                    ALLOCATION_FAILURE_MESSAGE,
                ));
            }
        };

        log::info!(
            "Running {} submission in workspace {}",
            request.language,
            workspace.id()
        );
        let result = self.run_in(&workspace, &prepared, request).await;
        log::info!(
            "Workspace {} finished: {:?}{}",
            workspace.id(),
            result.outcome,
            if result.truncated { " (truncated)" } else { "" }
        );

        workspace.release().await;
        Ok(result)
    }

    async fn run_in(
        &self,
        workspace: &Workspace,
        prepared: &PreparedPipeline<'_>,
        request: &ExecutionRequest,
    ) -> ExecutionResult {
        let sanitizer = self
            .sanitizer
            .clone()
            .with_path(workspace.dir(), WORKSPACE_TOKEN);

        let stdin = match materialize(workspace, prepared, request).await {
            Ok(stdin) => stdin,
            Err(e) => {
                log::error!("Failed to prepare workspace {}: {e}", workspace.id());
                return ExecutionResult::new(Outcome::AllocationFailure, PREPARATION_FAILURE_MESSAGE);
            }
        };

        let pipeline = prepared.bind(workspace.dir());
        let ctx = StepContext {
            workdir: workspace.dir(),
            backend: self.backend.as_ref(),
            deadline: Instant::now() + self.time_limit,
            output_limit: self.output_limit + CAPTURE_SLACK,
        };

        if let Some(compile) = &pipeline.compile {
            let out = run_step(compile, Stdio::null(), &ctx).await;
            if !out.success() {
                return self.conclude(Outcome::CompileFailure, &compile.program, out, &sanitizer);
            }
        }

        let out = run_step(&pipeline.run, stdin, &ctx).await;
        let outcome = if out.success() {
            Outcome::Success
        } else {
            Outcome::RuntimeFailure
        };
        self.conclude(outcome, &pipeline.run.program, out, &sanitizer)
    }

    fn conclude(
        &self,
        outcome: Outcome,
        program: &str,
        out: StepOutput,
        sanitizer: &Sanitizer,
    ) -> ExecutionResult {
        if matches!(out.status, StepStatus::TimedOut) {
            return ExecutionResult::new(
                Outcome::TimeoutExceeded,
                format!(
                    "Time Limit Exceeded: execution did not finish within {:.1} seconds",
                    self.time_limit.as_secs_f64()
                ),
            );
        }

        let (output, cut) = select_output(out, program);
        let (mut output, truncated) = sanitizer.apply_capped(&output, cut, self.output_limit);
        if truncated {
            output.push_str(&format!(
                "\n[output truncated at {} bytes]",
                self.output_limit
            ));
        }

        ExecutionResult {
            output,
            outcome,
            truncated,
        }
    }
}

/// Writes the input and source files, returning the run step's stdin
async fn materialize(
    workspace: &Workspace,
    prepared: &PreparedPipeline<'_>,
    request: &ExecutionRequest,
) -> io::Result<Stdio> {
    workspace.write_input(&request.stdin).await?;
    workspace
        .write_source(prepared.source_file(), &request.source_code)
        .await?;
    let input = tokio::fs::File::open(workspace.input_path())
        .await?
        .into_std()
        .await;
    Ok(Stdio::from(input))
}

/// Standard output if non-empty, else standard error, else a description
/// of how the process ended
fn select_output(out: StepOutput, program: &str) -> (String, bool) {
    if !out.stdout.text.is_empty() {
        return (out.stdout.text, out.stdout.truncated);
    }
    if !out.stderr.text.is_empty() {
        return (out.stderr.text, out.stderr.truncated);
    }
    (describe_status(&out.status, program), false)
}

fn describe_status(status: &StepStatus, program: &str) -> String {
    match status {
        StepStatus::Exited(status) if status.success() => String::new(),
        StepStatus::Exited(status) => match (status.code(), status.signal()) {
            (Some(code), _) => format!("Process exited with code: {code}"),
            (None, Some(signal)) => format!("Process terminated by signal: {signal}"),
            (None, None) => "Process exited abnormally".to_string(),
        },
        StepStatus::TimedOut => "Time Limit Exceeded".to_string(),
        StepStatus::Failed(e) => format!("System Error: failed to run `{program}`: {e}"),
    }
}
