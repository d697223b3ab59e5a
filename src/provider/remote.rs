//! HTTP client for a remote sandbox service.
//!
//! Wire format:
//!   POST   {base}/sandboxes                 {template, timeoutMs, envs} -> {sandboxId}
//!   POST   {base}/sandboxes/{id}/commands   {cmd, cwd?, timeoutMs?}     -> NDJSON events
//!   POST   {base}/sandboxes/{id}/files      {path, content (base64)}
//!   DELETE {base}/sandboxes/{id}
//!
//! Command output arrives as one JSON object per line: `stdout` and `stderr`
//! events carry `data`, and the stream ends with an `exit` event.

use super::{
    CommandOutput, CreateOptions, OutputChunk, OutputCollector, ProviderError, Result,
    RunOptions, SandboxHandle, SandboxProvider,
};
use async_trait::async_trait;
use base64::Engine;
use futures_util::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

const API_KEY_HEADER: &str = "X-API-Key";

pub struct RemoteProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl RemoteProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(ProviderError::Connection(
                "remote provider API key is required".to_string(),
            ));
        }
        let client = Client::builder()
            .build()
            .map_err(|e| ProviderError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSandboxRequest<'a> {
    template: &'a str,
    timeout_ms: u64,
    envs: &'a HashMap<String, String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSandboxResponse {
    sandbox_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunCommandRequest<'a> {
    cmd: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<u64>,
}

#[derive(Serialize)]
struct WriteFileRequest<'a> {
    path: &'a str,
    content: String,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
enum CommandEvent {
    Stdout { data: String },
    Stderr { data: String },
    #[serde(rename_all = "camelCase")]
    Exit { exit_code: i32 },
}

#[async_trait]
impl SandboxProvider for RemoteProvider {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn create(&self, template: &str, opts: CreateOptions) -> Result<Arc<dyn SandboxHandle>> {
        let body = CreateSandboxRequest {
            template,
            timeout_ms: opts.timeout.as_millis() as u64,
            envs: &opts.envs,
        };
        let mut request = self
            .client
            .post(format!("{}/sandboxes", self.base_url))
            .header(API_KEY_HEADER, &self.api_key)
            .json(&body);
        if !opts.timeout.is_zero() {
            request = request.timeout(opts.timeout);
        }
        let response = request.send().await.map_err(request_error)?;
        let created: CreateSandboxResponse = check(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        info!(sandbox_id = %created.sandbox_id, template, "Created remote sandbox");
        Ok(Arc::new(RemoteSandbox {
            id: created.sandbox_id,
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
        }))
    }
}

pub struct RemoteSandbox {
    id: String,
    client: Client,
    base_url: String,
    api_key: String,
}

impl RemoteSandbox {
    fn url(&self, suffix: &str) -> String {
        format!("{}/sandboxes/{}{}", self.base_url, self.id, suffix)
    }
}

#[async_trait]
impl SandboxHandle for RemoteSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, command: &str, opts: RunOptions) -> Result<CommandOutput> {
        let body = RunCommandRequest {
            cmd: command,
            cwd: opts.cwd.as_deref(),
            timeout_ms: opts.timeout.map(|t| t.as_millis() as u64),
        };
        let mut request = self
            .client
            .post(self.url("/commands"))
            .header(API_KEY_HEADER, &self.api_key)
            .json(&body);
        if let Some(timeout) = opts.timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(opts.timeout.unwrap_or_default())
            } else {
                request_error(e)
            }
        })?;
        let response = check(response).await?;

        let mut collector = OutputCollector::new(opts.sink);
        let mut decoder = LineDecoder::default();
        let mut body = response.bytes_stream();
        while let Some(bytes) = body.next().await {
            let bytes = bytes.map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(opts.timeout.unwrap_or_default())
                } else {
                    request_error(e)
                }
            })?;
            for line in decoder.push(&bytes) {
                if let Some(exit_code) = apply_event(&line, &mut collector)? {
                    debug!(sandbox_id = %self.id, exit_code, "Remote command exited");
                    return Ok(collector.finish(exit_code));
                }
            }
        }
        if let Some(line) = decoder.finish() {
            if let Some(exit_code) = apply_event(&line, &mut collector)? {
                return Ok(collector.finish(exit_code));
            }
        }
        Err(ProviderError::InvalidResponse(
            "command stream ended without an exit event".to_string(),
        ))
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let body = WriteFileRequest {
            path,
            content: base64::engine::general_purpose::STANDARD.encode(content),
        };
        let response = self
            .client
            .post(self.url("/files"))
            .header(API_KEY_HEADER, &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;
        check(response).await?;
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        let response = self
            .client
            .delete(self.url(""))
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(request_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response).await?;
        Ok(())
    }
}

fn request_error(e: reqwest::Error) -> ProviderError {
    ProviderError::Connection(e.to_string())
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ProviderError::Api {
        status: status.as_u16(),
        message,
    })
}

/// Feed one NDJSON line into the collector; returns the exit code once seen.
fn apply_event(line: &str, collector: &mut OutputCollector) -> Result<Option<i32>> {
    let event: CommandEvent = serde_json::from_str(line)
        .map_err(|e| ProviderError::InvalidResponse(format!("{e}: {line}")))?;
    match event {
        CommandEvent::Stdout { data } => collector.push(OutputChunk::stdout(data)),
        CommandEvent::Stderr { data } => collector.push(OutputChunk::stderr(data)),
        CommandEvent::Exit { exit_code } => return Ok(Some(exit_code)),
    }
    Ok(None)
}

/// Splits a byte stream into complete, non-empty lines.
#[derive(Default)]
struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        let line = String::from_utf8_lossy(&self.buffer).trim().to_string();
        self.buffer.clear();
        (!line.is_empty()).then_some(line)
    }
}
