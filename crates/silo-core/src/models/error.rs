use thiserror::Error;

use crate::models::call::{CallId, CallState};
use crate::models::schedule::ScheduleId;

pub type SiloResult<T> = Result<T, SiloError>;

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum SiloError {
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    #[error("no target registered under key '{key}'")]
    UnknownTarget { key: String },

    #[error("no lifecycle hook registered under key '{key}'")]
    UnknownHook { key: String },

    #[error("dependency on unknown call {id}")]
    UnknownDependency { id: CallId },

    #[error("unknown call {id}")]
    UnknownCall { id: CallId },

    #[error("unknown schedule {id}")]
    UnknownSchedule { id: ScheduleId },

    #[error("queue is at capacity ({limit} waiting calls)")]
    QueueFull { limit: usize },

    #[error("dependency cycle involving call {id}")]
    DependencyCycle { id: CallId },

    #[error("call {id} cannot transition from {from} to {to}")]
    InvalidTransition {
        id: CallId,
        from: CallState,
        to: CallState,
    },

    #[error("call {id} was canceled")]
    Canceled { id: CallId },

    #[error("timed out after {waited_ms}ms waiting for call {id}")]
    Timeout { id: CallId, waited_ms: u64 },

    #[error("execution failed: {message}")]
    Execution { message: String },

    #[error("storage failure during {operation}: {message}")]
    Storage { operation: String, message: String },

    #[error("serialization failure: {message}")]
    Serialization { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl SiloError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    pub fn storage(operation: impl Into<String>, source: impl std::fmt::Display) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: source.to_string(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }
}

impl From<serde_json::Error> for SiloError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}
