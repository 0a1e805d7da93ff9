pub mod config;
pub mod error;
pub mod eval;
pub mod providers;
pub mod types;

pub use config::{EvalConfig, JudgeConfig, JudgeCredentials};
pub use error::{EvalError, ExecutorError, JudgeError, LLMError, StoreError};
pub use providers::LLMProvider;
pub use types::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole, TokenUsage};
