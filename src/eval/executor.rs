use std::future::Future;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::{
    error::ExecutorError,
    eval::model::{last_user_message, Metadata, Turn},
};

/// What the agent under test produced for one case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl AgentOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Boundary to the agent under test. One bounded call per case; the runner
/// owns the timeout.
#[async_trait]
pub trait CaseExecutor: Send + Sync {
    async fn invoke(&self, turns: &[Turn]) -> Result<AgentOutput, ExecutorError>;

    fn name(&self) -> &str;
}

/// Runs an in-process async function as the agent.
pub struct FnExecutor<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnExecutor<F>
where
    F: Fn(Vec<Turn>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AgentOutput, ExecutorError>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> CaseExecutor for FnExecutor<F>
where
    F: Fn(Vec<Turn>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AgentOutput, ExecutorError>> + Send + 'static,
{
    async fn invoke(&self, turns: &[Turn]) -> Result<AgentOutput, ExecutorError> {
        (self.f)(turns.to_vec()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Wraps an agent that only takes the latest user message.
pub fn last_message_executor<G, Fut>(
    name: impl Into<String>,
    agent: G,
) -> FnExecutor<impl Fn(Vec<Turn>) -> Fut + Send + Sync + 'static>
where
    G: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AgentOutput, ExecutorError>> + Send + 'static,
{
    FnExecutor::new(name, move |turns: Vec<Turn>| {
        agent(last_user_message(&turns).unwrap_or_default().to_string())
    })
}

#[derive(Serialize)]
struct InvokeBody<'a> {
    messages: &'a [Turn],
}

/// Calls an agent exposed over HTTP: `POST {"messages": [...]}`, answered by
/// `{"output", "metadata"}` JSON or plain text.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: Client,
    url: String,
    name: String,
}

impl HttpExecutor {
    pub fn new(url: impl Into<String>) -> Result<Self, ExecutorError> {
        let url = url.into();
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            name: url.clone(),
            url,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

pub(crate) fn parse_agent_body(body: &str) -> AgentOutput {
    if let Ok(output) = serde_json::from_str::<AgentOutput>(body) {
        return output;
    }
    if let Ok(text) = serde_json::from_str::<String>(body) {
        return AgentOutput::text(text);
    }
    AgentOutput::text(body)
}

#[async_trait]
impl CaseExecutor for HttpExecutor {
    async fn invoke(&self, turns: &[Turn]) -> Result<AgentOutput, ExecutorError> {
        let response = self
            .client
            .post(&self.url)
            .json(&InvokeBody { messages: turns })
            .send()
            .await
            .map_err(|err| {
                if err.is_connect() {
                    ExecutorError::Unreachable(err.to_string())
                } else {
                    ExecutorError::Http(err)
                }
            })?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(ExecutorError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(parse_agent_body(&body))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn agent_body_accepts_json_and_text() {
        let structured = parse_agent_body(r#"{"output": "hi", "metadata": {"tool_calls": ["x"]}}"#);
        assert_eq!(structured.output, "hi");
        assert_eq!(
            structured.metadata.unwrap().get("tool_calls"),
            Some(&json!(["x"]))
        );

        assert_eq!(parse_agent_body(r#""quoted""#), AgentOutput::text("quoted"));
        assert_eq!(parse_agent_body("plain words"), AgentOutput::text("plain words"));
    }

    #[tokio::test]
    async fn last_message_executor_passes_latest_user_turn() {
        let executor = last_message_executor("echo", |message: String| async move {
            Ok(AgentOutput::text(format!("echo: {message}")))
        });

        let turns = vec![Turn::user("one"), Turn::assistant("ok"), Turn::user("two")];
        let output = executor.invoke(&turns).await.unwrap();
        assert_eq!(output.output, "echo: two");
        assert_eq!(executor.name(), "echo");
    }

    #[tokio::test]
    async fn unreachable_agent_is_systemic() {
        let executor = HttpExecutor::new("http://127.0.0.1:9/agent").unwrap();
        let error = executor.invoke(&[Turn::user("hi")]).await.unwrap_err();
        assert!(error.is_systemic(), "got {error:?}");
    }
}
