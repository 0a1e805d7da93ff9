use handlebars::Handlebars;
use serde::{Deserialize, Serialize};

use crate::{
    error::JudgeError,
    eval::judge::JudgeInput,
    types::MessageRole,
};

const JUDGE_TEMPLATE: &str = r#"You are an expert evaluator judging whether an AI agent's output meets the expected outcome.

## Conversation Context
{{#each conversation}}{{this.role}}: {{this.message}}
{{/each}}
## Expected Outcome
{{expected_outcome}}

## Actual Output
{{actual_output}}
{{#if expected_metadata}}
## Expected Metadata
{{expected_metadata}}
{{/if}}{{#if actual_metadata}}
## Actual Metadata
{{actual_metadata}}
{{/if}}
## Your Task
Evaluate whether the actual output satisfies the expected outcome. Consider:
1. Does the output achieve what was expected?
2. Are all the criteria in the expected outcome met?
3. Is the behavior appropriate given the conversation context?{{#if expected_metadata}}
4. Does the actual metadata (tool calls, citations, ...) match what was expected?{{/if}}

Respond with a JSON object in this exact format:
```json
{
  "passed": true or false,
  "reasoning": "Your detailed explanation of why this passed or failed"
}
```

Be strict but fair. Minor differences in wording are acceptable if the intent is met.
Only output the JSON object, nothing else."#;

#[derive(Serialize)]
struct PromptLine<'a> {
    role: &'static str,
    message: &'a str,
}

#[derive(Serialize)]
struct PromptContext<'a> {
    conversation: Vec<PromptLine<'a>>,
    expected_outcome: &'a str,
    actual_output: &'a str,
    expected_metadata: Option<String>,
    actual_metadata: Option<String>,
}

fn role_label(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "SYSTEM",
        MessageRole::User => "USER",
        MessageRole::Assistant => "ASSISTANT",
    }
}

pub fn build_judge_prompt(input: &JudgeInput<'_>) -> Result<String, JudgeError> {
    let pretty = |metadata: &crate::eval::model::Metadata| {
        serde_json::to_string_pretty(metadata).unwrap_or_default()
    };

    let context = PromptContext {
        conversation: input
            .conversation
            .iter()
            .map(|turn| PromptLine {
                role: role_label(turn.role),
                message: &turn.message,
            })
            .collect(),
        expected_outcome: input.expected_outcome,
        actual_output: input.actual_output,
        expected_metadata: input.expected_metadata.filter(|m| !m.is_empty()).map(pretty),
        actual_metadata: input.actual_metadata.filter(|m| !m.is_empty()).map(pretty),
    };

    let mut hb = Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);
    hb.render_template(JUDGE_TEMPLATE, &context)
        .map_err(|err| JudgeError::Provider(format!("judge prompt render failed: {err}")))
}

/// The verdict the semantic judge asks the model for.
#[derive(Debug, Clone, Deserialize)]
pub struct JudgeReply {
    pub passed: bool,
    pub reasoning: String,
}

/// Parses the model reply, tolerating markdown code fences and chatter around
/// the JSON object.
pub fn parse_judge_reply(raw: &str) -> Result<JudgeReply, JudgeError> {
    let text = strip_code_fence(raw.trim());

    if let Ok(reply) = serde_json::from_str::<JudgeReply>(text) {
        return Ok(reply);
    }

    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => serde_json::from_str(&text[start..=end])
            .map_err(|err| JudgeError::MalformedResponse(format!("{err}: {}", truncate(raw)))),
        _ => Err(JudgeError::MalformedResponse(format!(
            "no JSON object in reply: {}",
            truncate(raw)
        ))),
    }
}

fn strip_code_fence(text: &str) -> &str {
    let text = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))
        .unwrap_or(text);
    text.strip_suffix("```").unwrap_or(text).trim()
}

fn truncate(text: &str) -> String {
    const LIMIT: usize = 200;
    if text.chars().count() <= LIMIT {
        text.to_string()
    } else {
        let head: String = text.chars().take(LIMIT).collect();
        format!("{head}…")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::eval::model::{Metadata, Turn};

    fn tool_calls(names: &[&str]) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("tool_calls".into(), json!(names));
        metadata
    }

    #[test]
    fn prompt_contains_conversation_and_outcomes_unescaped() {
        let conversation = vec![Turn::user("Where is <my> order?"), Turn::assistant("Checking")];
        let input = JudgeInput {
            conversation: &conversation,
            expected_outcome: "Looks up the order",
            actual_output: "Your order \"A-1\" ships today",
            expected_metadata: None,
            actual_metadata: None,
        };

        let prompt = build_judge_prompt(&input).unwrap();
        assert!(prompt.contains("USER: Where is <my> order?"));
        assert!(prompt.contains("ASSISTANT: Checking"));
        assert!(prompt.contains("Your order \"A-1\" ships today"));
        assert!(!prompt.contains("## Expected Metadata"));
    }

    #[test]
    fn prompt_includes_metadata_sections_when_present() {
        let expected = tool_calls(&["get_orders"]);
        let actual = tool_calls(&["get_orders"]);
        let input = JudgeInput {
            conversation: &[],
            expected_outcome: "x",
            actual_output: "y",
            expected_metadata: Some(&expected),
            actual_metadata: Some(&actual),
        };

        let prompt = build_judge_prompt(&input).unwrap();
        assert!(prompt.contains("## Expected Metadata"));
        assert!(prompt.contains("## Actual Metadata"));
        assert!(prompt.contains("get_orders"));
    }

    #[test]
    fn parses_fenced_reply() {
        let reply = parse_judge_reply("```json\n{\"passed\": true, \"reasoning\": \"ok\"}\n```").unwrap();
        assert!(reply.passed);
        assert_eq!(reply.reasoning, "ok");
    }

    #[test]
    fn parses_reply_with_surrounding_text() {
        let reply =
            parse_judge_reply("Sure! {\"passed\": false, \"reasoning\": \"missed\"} Hope that helps").unwrap();
        assert!(!reply.passed);
    }

    #[test]
    fn rejects_reply_without_verdict() {
        let error = parse_judge_reply("I think it passed").unwrap_err();
        assert!(matches!(error, JudgeError::MalformedResponse(_)));

        let error = parse_judge_reply("{\"reasoning\": \"no verdict\"}").unwrap_err();
        assert!(matches!(error, JudgeError::MalformedResponse(_)));
    }
}
