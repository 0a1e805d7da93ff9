use std::{collections::VecDeque, sync::Mutex};

use async_trait::async_trait;

use crate::{
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest, CompletionResponse},
    LLMError,
};

/// One canned answer of a [`ScriptedProvider`].
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    Status { status: u16, message: String },
}

/// Replays a fixed queue of replies, used to pin the semantic judge in tests.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_replies(texts.into_iter().map(|text| ScriptedReply::Text(text.into())))
    }

    pub fn from_replies<I>(replies: I) -> Self
    where
        I: IntoIterator<Item = ScriptedReply>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }

        let next = self
            .replies
            .lock()
            .map_err(|_| LLMError::Provider("scripted provider poisoned".to_string()))?
            .pop_front();

        match next {
            Some(ScriptedReply::Text(text)) => Ok(CompletionResponse {
                message: ChatMessage::assistant(text),
                usage: None,
            }),
            Some(ScriptedReply::Status { status, message }) => {
                Err(LLMError::Status { status, message })
            }
            None => Err(LLMError::Provider("no more scripted responses".to_string())),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
