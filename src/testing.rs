//! Scripted in-memory provider for tests.
//!
//! Ids are handed out as `sb_1`, `sb_2`, ... unless overridden. Commands are
//! answered by the first rule whose needle occurs in the command text; every
//! call is recorded so tests can assert what reached the provider.

use crate::provider::{
    CommandOutput, CreateOptions, OutputChunk, OutputCollector, ProviderError, Result,
    RunOptions, SandboxHandle, SandboxProvider,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Create {
        template: String,
        envs: HashMap<String, String>,
    },
    Run {
        sandbox_id: String,
        command: String,
        cwd: Option<String>,
    },
    WriteFile {
        sandbox_id: String,
        path: String,
        content: Vec<u8>,
    },
    Kill {
        sandbox_id: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct MockResponse {
    pub chunks: Vec<OutputChunk>,
    pub exit_code: i32,
    pub delay: Option<Duration>,
    pub fail: Option<String>,
}

impl MockResponse {
    pub fn stdout(data: impl Into<String>) -> Self {
        Self {
            chunks: vec![OutputChunk::stdout(data)],
            ..Default::default()
        }
    }

    pub fn chunks(chunks: Vec<OutputChunk>, exit_code: i32) -> Self {
        Self {
            chunks,
            exit_code,
            ..Default::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            fail: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Default)]
struct MockState {
    next_id: usize,
    fixed_ids: VecDeque<String>,
    fail_create: bool,
    fail_kill: bool,
    rules: Vec<(String, MockResponse)>,
    killed: HashSet<String>,
    calls: Vec<MockCall>,
    running: usize,
    max_running: usize,
}

#[derive(Clone, Default)]
pub struct MockProvider {
    state: Arc<Mutex<MockState>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        lock(&self.state)
    }

    /// Hand out these ids (in order) before falling back to `sb_N`.
    pub fn with_ids<I, S>(self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state().fixed_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn fail_create(&self, fail: bool) {
        self.state().fail_create = fail;
    }

    pub fn fail_kill(&self, fail: bool) {
        self.state().fail_kill = fail;
    }

    /// Answer commands containing `needle` with `response`.
    pub fn respond(&self, needle: impl Into<String>, response: MockResponse) {
        self.state().rules.push((needle.into(), response));
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Run { command, .. } => Some(command),
                _ => None,
            })
            .collect()
    }

    pub fn kill_count(&self, sandbox_id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, MockCall::Kill { sandbox_id: id } if id == sandbox_id))
            .count()
    }

    pub fn is_killed(&self, sandbox_id: &str) -> bool {
        self.state().killed.contains(sandbox_id)
    }

    /// Highest number of commands that were in flight at the same time.
    pub fn max_concurrent_runs(&self) -> usize {
        self.state().max_running
    }
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl SandboxProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create(&self, template: &str, opts: CreateOptions) -> Result<Arc<dyn SandboxHandle>> {
        let mut state = self.state();
        state.calls.push(MockCall::Create {
            template: template.to_string(),
            envs: opts.envs,
        });
        if state.fail_create {
            return Err(ProviderError::Api {
                status: 503,
                message: "quota exceeded".to_string(),
            });
        }
        let id = match state.fixed_ids.pop_front() {
            Some(id) => id,
            None => {
                state.next_id += 1;
                format!("sb_{}", state.next_id)
            }
        };
        Ok(Arc::new(MockSandbox {
            id,
            state: self.state.clone(),
        }))
    }
}

pub struct MockSandbox {
    id: String,
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl SandboxHandle for MockSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, command: &str, opts: RunOptions) -> Result<CommandOutput> {
        let response = {
            let mut state = lock(&self.state);
            state.calls.push(MockCall::Run {
                sandbox_id: self.id.clone(),
                command: command.to_string(),
                cwd: opts.cwd.clone(),
            });
            if state.killed.contains(&self.id) {
                return Err(ProviderError::Killed(self.id.clone()));
            }
            state.running += 1;
            state.max_running = state.max_running.max(state.running);
            state
                .rules
                .iter()
                .find(|(needle, _)| command.contains(needle.as_str()))
                .map(|(_, response)| response.clone())
                .unwrap_or_default()
        };

        if let Some(delay) = response.delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.state).running -= 1;

        if let Some(message) = response.fail {
            return Err(ProviderError::Command(message));
        }
        let mut collector = OutputCollector::new(opts.sink);
        for chunk in response.chunks {
            collector.push(chunk);
        }
        Ok(collector.finish(response.exit_code))
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(MockCall::WriteFile {
            sandbox_id: self.id.clone(),
            path: path.to_string(),
            content: content.to_vec(),
        });
        if state.killed.contains(&self.id) {
            return Err(ProviderError::Killed(self.id.clone()));
        }
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(MockCall::Kill {
            sandbox_id: self.id.clone(),
        });
        if state.fail_kill {
            return Err(ProviderError::Connection("sandbox unreachable".to_string()));
        }
        state.killed.insert(self.id.clone());
        Ok(())
    }
}
