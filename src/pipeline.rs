//! Command execution pipeline.
//!
//! Runs one unit of work inside a session's sandbox: either the coding agent
//! with a prompt, or a browser-automation script. Output chunks go to the
//! optional sink as they are produced; the accumulated result and the
//! artifact scan come back as one [`ExecutionResult`].

use crate::artifacts;
use crate::error::{Result, SessionError};
use crate::provider::{CommandOutput, OutputSink, ProviderError, RunOptions, SandboxHandle};
use crate::registry::SessionRegistry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_WORKDIR: &str = "/home/user";
pub const DEFAULT_AGENT_COMMAND: &str = "claude -p --dangerously-skip-permissions";
pub const PLAYWRIGHT_SCRIPT_PATH: &str = "/home/user/playwright-script.js";
pub const PLAYWRIGHT_COMMAND: &str = "node playwright-script.js";

#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    pub sandbox_id: String,
    /// Prompt for the agent variant, script body for the playwright variant.
    pub body: String,
    pub working_dir: Option<String>,
    /// `None` or zero waits indefinitely.
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    pub fn new(sandbox_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            body: body.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub artifacts: Vec<String>,
}

impl ExecutionResult {
    fn new(output: CommandOutput, artifacts: Vec<String>) -> Self {
        Self {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            artifacts,
        }
    }
}

pub struct Pipeline {
    registry: Arc<SessionRegistry>,
    agent_command: String,
}

impl Pipeline {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self::with_agent_command(registry, DEFAULT_AGENT_COMMAND)
    }

    pub fn with_agent_command(registry: Arc<SessionRegistry>, agent_command: impl Into<String>) -> Self {
        Self {
            registry,
            agent_command: agent_command.into(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Run the agent with `request.body` as its prompt.
    pub async fn run_agent(
        &self,
        request: ExecutionRequest,
        sink: Option<OutputSink>,
    ) -> Result<ExecutionResult> {
        require(&request.sandbox_id, "sandboxId is required")?;
        require(&request.body, "prompt is required")?;

        let session = self.registry.acquire(&request.sandbox_id).await?;
        let _serialized = session.exec_lock.lock().await;
        // Terminated while queued behind another command.
        self.registry.get(&session.id).await?;

        let workdir = request
            .working_dir
            .filter(|dir| !dir.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_WORKDIR.to_string());
        let command = agent_command_line(&self.agent_command, &request.body);
        info!(sandbox_id = %session.id, workdir = %workdir, "Running agent command");

        let output = run_bounded(
            session.handle.as_ref(),
            &command,
            &workdir,
            effective_timeout(request.timeout),
            sink,
        )
        .await?;
        let files = artifacts::scan_recent(session.handle.as_ref(), &workdir).await;

        self.finish(&session.id, &output).await;
        Ok(ExecutionResult::new(output, files))
    }

    /// Write `request.body` to the script path and run it with node.
    pub async fn run_playwright(
        &self,
        request: ExecutionRequest,
        sink: Option<OutputSink>,
    ) -> Result<ExecutionResult> {
        require(&request.sandbox_id, "sandboxId is required")?;
        require(&request.body, "script is required")?;

        let session = self.registry.acquire(&request.sandbox_id).await?;
        let _serialized = session.exec_lock.lock().await;
        // Terminated while queued behind another command.
        self.registry.get(&session.id).await?;

        session
            .handle
            .write_file(PLAYWRIGHT_SCRIPT_PATH, request.body.as_bytes())
            .await?;
        info!(sandbox_id = %session.id, "Running playwright script");

        let output = run_bounded(
            session.handle.as_ref(),
            PLAYWRIGHT_COMMAND,
            DEFAULT_WORKDIR,
            effective_timeout(request.timeout),
            sink,
        )
        .await?;
        let screenshots = artifacts::scan_screenshots(session.handle.as_ref(), DEFAULT_WORKDIR).await;

        self.finish(&session.id, &output).await;
        Ok(ExecutionResult::new(output, screenshots))
    }

    async fn finish(&self, sandbox_id: &str, output: &CommandOutput) {
        // The session may have been terminated while the command ran.
        if let Err(e) = self.registry.touch(sandbox_id).await {
            debug!(sandbox_id, error = %e, "Session gone after command completed");
        }
        info!(
            sandbox_id,
            exit_code = output.exit_code,
            stdout_len = output.stdout.len(),
            stderr_len = output.stderr.len(),
            "Command finished"
        );
    }
}

/// Quote `value` for POSIX `sh` so it is always a single inert word.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub fn agent_command_line(agent_command: &str, prompt: &str) -> String {
    format!("{} {}", agent_command, shell_quote(prompt))
}

fn require(value: &str, message: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(SessionError::invalid(message));
    }
    Ok(())
}

fn effective_timeout(timeout: Option<Duration>) -> Option<Duration> {
    timeout.filter(|t| !t.is_zero())
}

async fn run_bounded(
    handle: &dyn SandboxHandle,
    command: &str,
    workdir: &str,
    timeout: Option<Duration>,
    sink: Option<OutputSink>,
) -> Result<CommandOutput> {
    let opts = RunOptions {
        timeout,
        cwd: Some(workdir.to_string()),
        sink,
    };
    let run = handle.run(command, opts);
    let result = match timeout {
        Some(limit) => tokio::time::timeout(limit, run)
            .await
            .map_err(|_| SessionError::Timeout(limit))?,
        None => run.await,
    };
    match result {
        Ok(output) => Ok(output),
        Err(ProviderError::Timeout(after)) => Err(SessionError::Timeout(after)),
        Err(e) => Err(e.into()),
    }
}
