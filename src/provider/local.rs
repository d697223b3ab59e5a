//! Local sandbox provider.
//!
//! Each sandbox is a directory under a shared root with a `home/user` tree.
//! Commands run through `sh -c` on the host with absolute sandbox paths mapped
//! under that directory. There is no kernel isolation here; this provider is
//! meant for development and tests.

use super::{
    CommandOutput, CreateOptions, OutputChunk, OutputCollector, ProviderError, Result,
    RunOptions, SandboxHandle, SandboxProvider, StreamKind,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

const HOME_DIR: &str = "/home/user";
const READ_BUF_SIZE: usize = 4096;

pub struct LocalProvider {
    root: PathBuf,
}

impl LocalProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("sandbox-sessions"))
    }
}

#[async_trait]
impl SandboxProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn create(&self, template: &str, opts: CreateOptions) -> Result<Arc<dyn SandboxHandle>> {
        let id = format!("sb_{}", uuid::Uuid::new_v4().simple());
        let sandbox_root = self.root.join(&id);
        tokio::fs::create_dir_all(map_path(&sandbox_root, HOME_DIR)).await?;

        info!(sandbox_id = %id, template, root = ?sandbox_root, "Created local sandbox");
        let (killed, _) = watch::channel(false);
        Ok(Arc::new(LocalSandbox {
            id,
            sandbox_root,
            envs: opts.envs,
            killed,
        }))
    }
}

pub struct LocalSandbox {
    id: String,
    sandbox_root: PathBuf,
    envs: HashMap<String, String>,
    killed: watch::Sender<bool>,
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    Killed,
    TimedOut(Duration),
}

impl LocalSandbox {
    fn ensure_alive(&self) -> Result<()> {
        if *self.killed.borrow() {
            return Err(ProviderError::Killed(self.id.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxHandle for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, command: &str, opts: RunOptions) -> Result<CommandOutput> {
        self.ensure_alive()?;

        let cwd = map_path(&self.sandbox_root, opts.cwd.as_deref().unwrap_or(HOME_DIR));
        tokio::fs::create_dir_all(&cwd).await?;
        debug!(sandbox_id = %self.id, command, cwd = ?cwd, "Running local command");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .env("HOME", map_path(&self.sandbox_root, HOME_DIR))
            .envs(&self.envs)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, StreamKind::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, StreamKind::Stderr, tx));
        }

        let mut collector = OutputCollector::new(opts.sink);
        let mut killed = self.killed.subscribe();

        let outcome = {
            let drain = async {
                while let Some(chunk) = rx.recv().await {
                    collector.push(chunk);
                }
                child.wait().await
            };
            tokio::select! {
                status = drain => Outcome::Exited(status),
                _ = wait_for_kill(&mut killed) => Outcome::Killed,
                _ = sleep_opt(opts.timeout) => Outcome::TimedOut(opts.timeout.unwrap_or_default()),
            }
        };

        match outcome {
            Outcome::Exited(status) => {
                let status = status?;
                Ok(collector.finish(status.code().unwrap_or(-1)))
            }
            Outcome::Killed => {
                let _ = child.start_kill();
                Err(ProviderError::Killed(self.id.clone()))
            }
            Outcome::TimedOut(after) => {
                let _ = child.start_kill();
                Err(ProviderError::Timeout(after))
            }
        }
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        self.ensure_alive()?;
        let full_path = map_path(&self.sandbox_root, path);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full_path, content).await?;
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        self.killed.send_replace(true);
        match tokio::fs::remove_dir_all(&self.sandbox_root).await {
            Ok(()) => {
                info!(sandbox_id = %self.id, "Removed local sandbox");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Map an absolute sandbox path onto the host directory backing the sandbox.
fn map_path(sandbox_root: &Path, path: &str) -> PathBuf {
    sandbox_root.join(path.trim_start_matches('/'))
}

async fn pump<R>(mut reader: R, stream: StreamKind, tx: mpsc::UnboundedSender<OutputChunk>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_BUF_SIZE];
    let mut pending = Vec::new();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        pending.extend_from_slice(&buf[..n]);
        let data = take_utf8(&mut pending);
        if !data.is_empty() {
            let _ = tx.send(OutputChunk { stream, data });
        }
    }
    if !pending.is_empty() {
        let data = String::from_utf8_lossy(&pending).into_owned();
        let _ = tx.send(OutputChunk { stream, data });
    }
}

/// Take the longest decodable prefix, keeping a split multi-byte sequence
/// for the next read.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_owned();
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
            pending.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}

async fn wait_for_kill(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn sleep_opt(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sandbox(dir: &tempfile::TempDir) -> Arc<dyn SandboxHandle> {
        LocalProvider::new(dir.path())
            .create("default", CreateOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_lays_out_home_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(&dir).await;
        assert!(sb.id().starts_with("sb_"));
        assert!(dir.path().join(sb.id()).join("home/user").is_dir());
    }

    #[tokio::test]
    async fn run_streams_both_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(&dir).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let output = sb
            .run(
                "echo out; echo err >&2; exit 3",
                RunOptions {
                    sink: Some(tx),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");

        let mut streamed = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            streamed.push(chunk);
        }
        assert!(streamed.contains(&OutputChunk::stdout("out\n")));
        assert!(streamed.contains(&OutputChunk::stderr("err\n")));
    }

    #[tokio::test]
    async fn envs_and_home_are_visible() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(dir.path());
        let mut envs = HashMap::new();
        envs.insert("GREETING".to_string(), "hello".to_string());
        let sb = provider
            .create("default", CreateOptions { envs, ..Default::default() })
            .await
            .unwrap();

        let output = sb.run("echo $GREETING; pwd", RunOptions::default()).await.unwrap();
        let expected_home = dir.path().join(sb.id()).join("home/user");
        let lines: Vec<&str> = output.stdout.lines().collect();
        assert_eq!(lines[0], "hello");
        assert_eq!(
            Path::new(lines[1]).canonicalize().unwrap(),
            expected_home.canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn write_file_maps_absolute_paths() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(&dir).await;
        sb.write_file("/home/user/notes/a.txt", b"it's data")
            .await
            .unwrap();

        let output = sb.run("cat notes/a.txt", RunOptions::default()).await.unwrap();
        assert_eq!(output.stdout, "it's data");
    }

    #[tokio::test]
    async fn kill_is_idempotent_and_blocks_further_runs() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(&dir).await;
        sb.kill().await.unwrap();
        sb.kill().await.unwrap();
        assert!(!dir.path().join(sb.id()).exists());

        let err = sb.run("true", RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Killed(_)));
    }

    #[tokio::test]
    async fn kill_aborts_in_flight_command() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(&dir).await;
        let runner = {
            let sb = sb.clone();
            tokio::spawn(async move { sb.run("sleep 30", RunOptions::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        sb.kill().await.unwrap();

        let err = runner.await.unwrap().unwrap_err();
        assert!(matches!(err, ProviderError::Killed(_)));
    }

    #[tokio::test]
    async fn timeout_stops_command() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(&dir).await;
        let err = sb
            .run(
                "sleep 30",
                RunOptions {
                    timeout: Some(Duration::from_millis(100)),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(_)));
    }

    #[test]
    fn split_multibyte_sequences_are_carried() {
        let bytes = "héllo".as_bytes();
        let mut pending = bytes[..2].to_vec();
        assert_eq!(take_utf8(&mut pending), "h");
        assert_eq!(pending.len(), 1);
        pending.extend_from_slice(&bytes[2..]);
        assert_eq!(take_utf8(&mut pending), "éllo");
        assert!(pending.is_empty());
    }
}
