//! Ephemeral sandbox session manager.
//!
//! Provisions remote sandboxes on demand, keeps them alive across
//! multi-turn interactions, runs coding-agent prompts and browser scripts
//! inside them with streamed output, and reaps idle sessions.

pub mod artifacts;
pub mod config;
pub mod error;
pub mod http_server;
pub mod pipeline;
pub mod provider;
pub mod reaper;
pub mod registry;
pub mod session;
pub mod state;
pub mod stream;
pub mod testing;

pub use config::ServerConfig;
pub use error::{Result, SessionError};
pub use pipeline::{ExecutionRequest, ExecutionResult, Pipeline};
pub use registry::{SessionConfig, SessionRegistry};
pub use state::AppState;
