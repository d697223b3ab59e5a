//! Streaming transport.
//!
//! One execution becomes an ordered event sequence on a channel:
//! `Start (Stdout | Stderr)* (Complete | Error)`. The execution runs on its
//! own task, so a consumer that goes away stops receiving events without
//! cancelling the command.

use crate::pipeline::{ExecutionRequest, Pipeline};
use crate::provider::{OutputChunk, StreamKind};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    #[serde(rename_all = "camelCase")]
    Start { sandbox_id: String },
    Stdout { data: String },
    Stderr { data: String },
    #[serde(rename_all = "camelCase")]
    Complete { exit_code: i32, output: String },
    Error { message: String },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}

impl From<OutputChunk> for StreamEvent {
    fn from(chunk: OutputChunk) -> Self {
        match chunk.stream {
            StreamKind::Stdout => Self::Stdout { data: chunk.data },
            StreamKind::Stderr => Self::Stderr { data: chunk.data },
        }
    }
}

/// Start an agent execution and return its event stream.
pub fn spawn_execution(
    pipeline: Arc<Pipeline>,
    request: ExecutionRequest,
) -> mpsc::UnboundedReceiver<StreamEvent> {
    let (events, rx) = mpsc::unbounded_channel();
    tokio::spawn(drive(pipeline, request, events));
    rx
}

async fn drive(
    pipeline: Arc<Pipeline>,
    request: ExecutionRequest,
    events: mpsc::UnboundedSender<StreamEvent>,
) {
    let sandbox_id = request.sandbox_id.clone();
    let _ = events.send(StreamEvent::Start {
        sandbox_id: sandbox_id.clone(),
    });

    let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<OutputChunk>();
    let relay = async {
        let mut connected = true;
        while let Some(chunk) = chunk_rx.recv().await {
            if connected && events.send(chunk.into()).is_err() {
                debug!(sandbox_id = %sandbox_id, "Stream consumer disconnected; command continues");
                connected = false;
            }
        }
    };
    let (result, ()) = tokio::join!(pipeline.run_agent(request, Some(chunk_tx)), relay);

    let terminal = match result {
        Ok(result) => StreamEvent::Complete {
            exit_code: result.exit_code,
            output: result.stdout,
        },
        Err(e) => StreamEvent::Error {
            message: e.to_string(),
        },
    };
    if events.send(terminal).is_err() {
        debug!(sandbox_id = %sandbox_id, "Execution finished after consumer disconnected");
    }
}
