//! Sandbox provider interface.
//!
//! A provider allocates isolated execution environments and hands back a
//! [`SandboxHandle`] for each one. The session manager only ever talks to
//! sandboxes through these two traits.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod local;
pub mod remote;

pub use local::LocalProvider;
pub use remote::RemoteProvider;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("command error: {0}")]
    Command(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("provider operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("sandbox {0} was killed")]
    Killed(String),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Options for allocating a sandbox.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub timeout: Duration,
    pub envs: HashMap<String, String>,
}

/// Which output stream a chunk was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub data: String,
}

impl OutputChunk {
    pub fn stdout(data: impl Into<String>) -> Self {
        Self {
            stream: StreamKind::Stdout,
            data: data.into(),
        }
    }

    pub fn stderr(data: impl Into<String>) -> Self {
        Self {
            stream: StreamKind::Stderr,
            data: data.into(),
        }
    }
}

/// Receives output chunks as the remote process produces them.
pub type OutputSink = mpsc::UnboundedSender<OutputChunk>;

/// Options for a single command run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// `None` waits for the command indefinitely.
    pub timeout: Option<Duration>,
    pub cwd: Option<String>,
    pub sink: Option<OutputSink>,
}

/// Final result of a command. A non-zero exit code is not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Accumulates chunks into a [`CommandOutput`], forwarding each one to the
/// sink (if any) before it is appended.
#[derive(Debug, Default)]
pub(crate) struct OutputCollector {
    sink: Option<OutputSink>,
    stdout: String,
    stderr: String,
}

impl OutputCollector {
    pub(crate) fn new(sink: Option<OutputSink>) -> Self {
        Self {
            sink,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub(crate) fn push(&mut self, chunk: OutputChunk) {
        if let Some(sink) = &self.sink {
            // A dropped receiver only means nobody is listening anymore.
            let _ = sink.send(chunk.clone());
        }
        match chunk.stream {
            StreamKind::Stdout => self.stdout.push_str(&chunk.data),
            StreamKind::Stderr => self.stderr.push_str(&chunk.data),
        }
    }

    pub(crate) fn finish(self, exit_code: i32) -> CommandOutput {
        CommandOutput {
            exit_code,
            stdout: self.stdout,
            stderr: self.stderr,
        }
    }
}

/// A live connection to one sandbox.
#[async_trait]
pub trait SandboxHandle: Send + Sync {
    /// Provider-assigned sandbox id.
    fn id(&self) -> &str;

    /// Run a shell command inside the sandbox.
    async fn run(&self, command: &str, opts: RunOptions) -> Result<CommandOutput>;

    /// Write a file verbatim. The content is never shell-interpreted.
    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Terminate the sandbox. Killing an already killed sandbox is `Ok`.
    async fn kill(&self) -> Result<()>;
}

/// Allocates sandboxes.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &'static str;

    async fn create(&self, template: &str, opts: CreateOptions) -> Result<Arc<dyn SandboxHandle>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_forwards_before_accumulating() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut collector = OutputCollector::new(Some(tx));
        collector.push(OutputChunk::stdout("a"));
        collector.push(OutputChunk::stderr("oops"));
        collector.push(OutputChunk::stdout("b"));
        let output = collector.finish(3);

        assert_eq!(output.stdout, "ab");
        assert_eq!(output.stderr, "oops");
        assert_eq!(output.exit_code, 3);
        assert_eq!(rx.try_recv().unwrap(), OutputChunk::stdout("a"));
        assert_eq!(rx.try_recv().unwrap(), OutputChunk::stderr("oops"));
        assert_eq!(rx.try_recv().unwrap(), OutputChunk::stdout("b"));
    }

    #[test]
    fn collector_tolerates_closed_sink() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut collector = OutputCollector::new(Some(tx));
        collector.push(OutputChunk::stdout("still collected"));
        assert_eq!(collector.finish(0).stdout, "still collected");
    }
}
