use crate::provider::ProviderError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("Sandbox not found: {0}")]
    NotFound(String),

    #[error("Sandbox provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Execution timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}

impl SessionError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidArgument(_) => 400,
            Self::NotFound(_) => 404,
            Self::Provider(_) => 500,
            Self::Timeout(_) => 504,
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
