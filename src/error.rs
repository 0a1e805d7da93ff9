use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::eval::model::RunStatus;

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("provider error: {0}")]
    Provider(String),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),
}

/// Failure of the agent under test for one case.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("agent timed out after {0:?}")]
    Timeout(Duration),

    #[error("agent failed: {0}")]
    Failed(String),

    #[error("agent unreachable: {0}")]
    Unreachable(String),

    #[error("agent returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ExecutorError {
    /// Systemic failures abort the whole run instead of failing a single case.
    pub fn is_systemic(&self) -> bool {
        matches!(self, ExecutorError::Unreachable(_))
    }
}

#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("judge provider temporarily unavailable: {0}")]
    Transient(String),

    #[error("judge authentication failed: {0}")]
    Auth(String),

    #[error("judge returned a malformed verdict: {0}")]
    MalformedResponse(String),

    #[error("judge provider error: {0}")]
    Provider(String),

    #[error("no judge available: {0}")]
    Unavailable(String),
}

impl JudgeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, JudgeError::Transient(_))
    }
}

impl From<LLMError> for JudgeError {
    fn from(error: LLMError) -> Self {
        match error {
            LLMError::Http(err) if err.is_timeout() || err.is_connect() => {
                JudgeError::Transient(err.to_string())
            }
            LLMError::Status { status, message } => match status {
                401 | 403 => JudgeError::Auth(message),
                408 | 429 | 500..=599 => JudgeError::Transient(format!("{status}: {message}")),
                _ => JudgeError::Provider(format!("{status}: {message}")),
            },
            LLMError::InvalidResponse(reason) => JudgeError::MalformedResponse(reason.to_string()),
            LLMError::Serialization(err) => JudgeError::MalformedResponse(err.to_string()),
            other => JudgeError::Provider(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("invalid run transition {from:?} -> {to:?}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("run {0} is not accepting results")]
    RunClosed(Uuid),

    #[error("dataset {dataset_id} is invalid: {message}")]
    InvalidDataset { dataset_id: String, message: String },
}

#[derive(Debug, Error)]
pub enum EvalError {
    /// The run was persisted as `failed` before any case executed.
    #[error("run {run_id} setup failed: {message}")]
    Setup { run_id: Uuid, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("baseline error: {0}")]
    Baseline(String),

    #[error("run task aborted: {0}")]
    Task(String),
}
