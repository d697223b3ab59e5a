//! Post-execution artifact discovery.
//!
//! Scans run inside the sandbox with `find` and are best-effort: any failure
//! yields an empty list.

use crate::provider::{RunOptions, SandboxHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Files modified within this many minutes of completion count as artifacts.
pub const RECENT_WINDOW_MINUTES: u32 = 5;
/// Upper bound on reported artifacts.
pub const MAX_ARTIFACTS: usize = 50;

const SCAN_TIMEOUT: Duration = Duration::from_secs(30);

/// Regular files under `workdir` modified in the recent window.
pub async fn scan_recent(handle: &dyn SandboxHandle, workdir: &str) -> Vec<String> {
    let command = format!(
        "find . -type f -mmin -{RECENT_WINDOW_MINUTES} \
         -not -path '*/node_modules/*' -not -path '*/.*' 2>/dev/null | head -n {MAX_ARTIFACTS}"
    );
    scan(handle, workdir, &command).await
}

/// Recent `screenshot*` images written by an automation script under `dir`.
pub async fn scan_screenshots(handle: &dyn SandboxHandle, dir: &str) -> Vec<String> {
    let command = format!(
        "find . -maxdepth 2 -type f -mmin -{RECENT_WINDOW_MINUTES} \\( -name 'screenshot*.png' \
         -o -name 'screenshot*.jpg' -o -name 'screenshot*.jpeg' \\) 2>/dev/null | head -n {MAX_ARTIFACTS}"
    );
    scan(handle, dir, &command).await
}

async fn scan(handle: &dyn SandboxHandle, dir: &str, command: &str) -> Vec<String> {
    let opts = RunOptions {
        timeout: Some(SCAN_TIMEOUT),
        cwd: Some(dir.to_string()),
        sink: None,
    };
    match handle.run(command, opts).await {
        Ok(output) if output.exit_code == 0 => {
            let paths = parse_find_output(&output.stdout, dir);
            debug!(sandbox_id = handle.id(), count = paths.len(), "Artifact scan finished");
            paths
        }
        Ok(output) => {
            warn!(
                sandbox_id = handle.id(),
                exit_code = output.exit_code,
                "Artifact scan exited with failure"
            );
            Vec::new()
        }
        Err(e) => {
            warn!(sandbox_id = handle.id(), error = %e, "Artifact scan failed");
            Vec::new()
        }
    }
}

/// Turn `find .` output into absolute sandbox paths rooted at `dir`.
fn parse_find_output(stdout: &str, dir: &str) -> Vec<String> {
    let base = dir.trim_end_matches('/');
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| match line.strip_prefix("./") {
            Some(rel) => format!("{base}/{rel}"),
            None if line.starts_with('/') => line.to_string(),
            None => format!("{base}/{line}"),
        })
        .take(MAX_ARTIFACTS)
        .collect()
}
