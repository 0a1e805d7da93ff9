use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    config::{JudgeConfig, JudgeCredentials, DEFAULT_KEYWORD_THRESHOLD},
    error::JudgeError,
    eval::{
        model::{Metadata, Turn},
        prompt::{build_judge_prompt, parse_judge_reply},
    },
    providers::{
        openai::{OpenAI, OpenAIConfig},
        openrouter::{OpenRouter, OpenRouterConfig},
    },
    types::{ChatMessage, CompletionRequest},
    LLMProvider,
};

/// Prefix of every reasoning string written by [`KeywordJudge`].
pub const KEYWORD_JUDGE_PREFIX: &str = "[keyword judge]";

/// Everything a judge sees about one case.
#[derive(Debug, Clone, Copy)]
pub struct JudgeInput<'a> {
    pub conversation: &'a [Turn],
    pub expected_outcome: &'a str,
    pub actual_output: &'a str,
    pub expected_metadata: Option<&'a Metadata>,
    pub actual_metadata: Option<&'a Metadata>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub passed: bool,
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JudgeKind {
    Semantic,
    Keyword,
}

#[async_trait]
pub trait CaseJudge: Send + Sync {
    async fn judge(&self, input: &JudgeInput<'_>) -> Result<Verdict, JudgeError>;

    fn kind(&self) -> JudgeKind;
}

/// Picks the judge strategy once: semantic when a credential is configured,
/// keyword matching otherwise.
pub fn select_judge(config: &JudgeConfig) -> Result<Arc<dyn CaseJudge>, JudgeError> {
    let provider: Arc<dyn LLMProvider> = match &config.credentials {
        JudgeCredentials::OpenRouter(key) => Arc::new(
            OpenRouter::from_config(
                OpenRouterConfig::new(key.clone()).with_timeout(config.request_timeout),
            )
            .map_err(|err| JudgeError::Unavailable(err.to_string()))?,
        ),
        JudgeCredentials::OpenAI(key) => Arc::new(
            OpenAI::from_config(OpenAIConfig::new(key.clone()).with_timeout(config.request_timeout))
                .map_err(|err| JudgeError::Unavailable(err.to_string()))?,
        ),
        JudgeCredentials::None => {
            tracing::warn!(
                threshold = config.keyword_threshold,
                "no judge credential configured, falling back to keyword matching"
            );
            return Ok(Arc::new(KeywordJudge::new(config.keyword_threshold)));
        }
    };

    tracing::info!(provider = provider.name(), model = %config.model, "using semantic judge");
    Ok(Arc::new(
        LlmJudge::new(provider, config.model.clone()).with_retry(config.retry),
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 500,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: 0,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(1 << attempt.min(10)))
    }
}

/// LLM-as-judge.
pub struct LlmJudge {
    provider: Arc<dyn LLMProvider>,
    model: String,
    retry: RetryPolicy,
    max_tokens: u32,
}

impl LlmJudge {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            retry: RetryPolicy::default(),
            max_tokens: 1024,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    async fn ask(&self, prompt: &str) -> Result<Verdict, JudgeError> {
        let request = CompletionRequest::new(self.model.clone(), vec![ChatMessage::user(prompt)])
            .with_max_tokens(self.max_tokens)
            .with_temperature(0.0);

        let response = self.provider.complete(request).await?;
        let text = response
            .message
            .text()
            .ok_or_else(|| JudgeError::MalformedResponse("empty reply".to_string()))?;
        let reply = parse_judge_reply(text)?;

        Ok(Verdict {
            passed: reply.passed,
            reasoning: reply.reasoning,
        })
    }
}

#[async_trait]
impl CaseJudge for LlmJudge {
    async fn judge(&self, input: &JudgeInput<'_>) -> Result<Verdict, JudgeError> {
        let prompt = build_judge_prompt(input)?;
        let mut attempt = 0;

        loop {
            match self.ask(&prompt).await {
                Ok(verdict) => return Ok(verdict),
                Err(err) if err.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(attempt = attempt + 1, ?delay, error = %err, "retrying judge call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn kind(&self) -> JudgeKind {
        JudgeKind::Semantic
    }
}

static TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\p{L}\p{N}]+(?:'[\p{L}]+)?").unwrap());

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "a", "an", "is", "are", "should", "must", "will", "and", "or", "to", "be",
        "it", "its", "of", "in", "on", "for", "with", "as", "at", "by", "from", "that", "this",
        "their", "them", "they", "can", "could", "would", "do", "does", "i", "you", "your",
        "me", "my", "we", "our", "agent", "assistant", "bot", "user", "users", "customer",
    ]
    .into_iter()
    .collect()
});

/// Intent words that rarely appear literally in a good answer, mapped to the
/// surface words that express them.
fn default_intents() -> HashMap<String, Vec<String>> {
    let entries: [(&str, &[&str]); 4] = [
        ("greet", &["hello", "hi", "hey", "greetings", "welcome"]),
        ("thank", &["thanks", "thank", "appreciate", "grateful"]),
        ("apologi", &["sorry", "apologies", "apologize", "apologise"]),
        ("refus", &["cannot", "can't", "unable", "won't", "sorry"]),
    ];

    entries
        .into_iter()
        .map(|(stem, markers)| {
            (
                stem.to_string(),
                markers.iter().map(|m| m.to_string()).collect(),
            )
        })
        .collect()
}

fn tokenize(text: &str) -> BTreeSet<String> {
    let lower = text.to_lowercase();
    TOKEN
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .collect()
}

fn shares_stem(keyword: &str, token: &str) -> bool {
    const MIN_STEM: usize = 4;
    let (short, long) = if keyword.len() <= token.len() {
        (keyword, token)
    } else {
        (token, keyword)
    };
    short.chars().count() >= MIN_STEM && long.starts_with(short)
}

/// Deterministic fallback judge: passes when enough of the expected outcome's
/// keywords show up in the output.
#[derive(Debug, Clone)]
pub struct KeywordJudge {
    threshold: f64,
    intents: HashMap<String, Vec<String>>,
}

impl Default for KeywordJudge {
    fn default() -> Self {
        Self::new(DEFAULT_KEYWORD_THRESHOLD)
    }
}

impl KeywordJudge {
    /// `threshold` is clamped to `0.0..=1.0`; NaN or infinite values fall back
    /// to the default.
    pub fn new(threshold: f64) -> Self {
        let threshold = if threshold.is_finite() {
            threshold.clamp(0.0, 1.0)
        } else {
            DEFAULT_KEYWORD_THRESHOLD
        };
        Self {
            threshold,
            intents: default_intents(),
        }
    }

    pub fn with_intent<I, S>(mut self, stem: impl Into<String>, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.intents
            .insert(stem.into(), markers.into_iter().map(Into::into).collect());
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    fn keyword_present(&self, keyword: &str, tokens: &BTreeSet<String>) -> bool {
        if tokens.contains(keyword) || tokens.iter().any(|token| shares_stem(keyword, token)) {
            return true;
        }

        self.intents
            .iter()
            .filter(|(stem, _)| keyword.starts_with(stem.as_str()))
            .flat_map(|(_, markers)| markers)
            .any(|marker| tokens.contains(marker))
    }

    pub fn evaluate(&self, expected_outcome: &str, actual_output: &str) -> Verdict {
        let expected: BTreeSet<String> = tokenize(expected_outcome)
            .into_iter()
            .filter(|word| !STOP_WORDS.contains(word.as_str()))
            .collect();

        if expected.is_empty() {
            return Verdict {
                passed: true,
                reasoning: format!("{KEYWORD_JUDGE_PREFIX} No specific requirements to check"),
            };
        }

        let actual = tokenize(actual_output);
        let (matched, missing): (Vec<&String>, Vec<&String>) = expected
            .iter()
            .partition(|keyword| self.keyword_present(keyword, &actual));

        let ratio = matched.len() as f64 / expected.len() as f64;
        let passed = ratio >= self.threshold;
        let join = |words: &[&String]| {
            if words.is_empty() {
                "none".to_string()
            } else {
                words.iter().map(|w| w.as_str()).collect::<Vec<_>>().join(", ")
            }
        };

        Verdict {
            passed,
            reasoning: format!(
                "{KEYWORD_JUDGE_PREFIX} Found {}/{} expected terms in output (matched: {}; missing: {})",
                matched.len(),
                expected.len(),
                join(&matched[..]),
                join(&missing[..]),
            ),
        }
    }
}

#[async_trait]
impl CaseJudge for KeywordJudge {
    async fn judge(&self, input: &JudgeInput<'_>) -> Result<Verdict, JudgeError> {
        Ok(self.evaluate(input.expected_outcome, input.actual_output))
    }

    fn kind(&self) -> JudgeKind {
        JudgeKind::Keyword
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::scripted::{ScriptedProvider, ScriptedReply};

    fn input<'a>(expected: &'a str, actual: &'a str) -> JudgeInput<'a> {
        JudgeInput {
            conversation: &[],
            expected_outcome: expected,
            actual_output: actual,
            expected_metadata: None,
            actual_metadata: None,
        }
    }

    #[test]
    fn keyword_judge_passes_greeting() {
        let verdict = KeywordJudge::default()
            .evaluate("Should greet the user", "Hello! How can I help you today?");

        assert!(verdict.passed);
        assert_eq!(
            verdict.reasoning,
            "[keyword judge] Found 1/1 expected terms in output (matched: greet; missing: none)"
        );
    }

    #[test]
    fn keyword_judge_is_deterministic() {
        let judge = KeywordJudge::default();
        let first = judge.evaluate("Agent should book appointment", "I have booked your appointment");
        let second = judge.evaluate("Agent should book appointment", "I have booked your appointment");
        assert_eq!(first, second);
        assert!(first.passed);
        assert!(first.reasoning.contains("Found 2/2 expected terms"));
    }

    #[test]
    fn keyword_judge_fails_unrelated_output() {
        let verdict = KeywordJudge::default().evaluate(
            "Agent should book appointment and confirm time",
            "Hello there!",
        );
        assert!(!verdict.passed);
        assert!(verdict.reasoning.starts_with(KEYWORD_JUDGE_PREFIX));
        assert!(verdict.reasoning.contains("missing: appointment, book, confirm, time"));
    }

    #[test]
    fn keyword_judge_passes_when_only_stop_words_expected() {
        let verdict = KeywordJudge::default().evaluate("It should be that", "anything");
        assert!(verdict.passed);
        assert!(verdict.reasoning.contains("No specific requirements"));
    }

    #[test]
    fn keyword_threshold_is_configurable() {
        let strict = KeywordJudge::new(1.0);
        let verdict = strict.evaluate("refund order quickly", "Your refund is on its way");
        assert!(!verdict.passed);

        let lenient = KeywordJudge::new(0.3);
        assert!(lenient.evaluate("refund order quickly", "Your refund is on its way").passed);
    }

    #[test]
    fn non_finite_threshold_falls_back_to_default() {
        assert_eq!(KeywordJudge::new(f64::NAN).threshold(), DEFAULT_KEYWORD_THRESHOLD);
        assert_eq!(KeywordJudge::new(f64::INFINITY).threshold(), DEFAULT_KEYWORD_THRESHOLD);
        assert_eq!(KeywordJudge::new(7.0).threshold(), 1.0);
        assert!(KeywordJudge::new(f64::NAN)
            .evaluate("refund order quickly", "Your refund is on its way")
            .passed);
    }

    #[test]
    fn custom_intent_markers_are_used() {
        let judge = KeywordJudge::default().with_intent("escalat", ["transfer", "specialist"]);
        let verdict = judge.evaluate("Escalates", "Let me transfer you to a specialist");
        assert!(verdict.passed);
    }

    #[tokio::test]
    async fn semantic_judge_parses_verdict() {
        let provider = Arc::new(ScriptedProvider::from_texts([
            r#"{"passed": true, "reasoning": "Greets warmly"}"#,
        ]));
        let judge = LlmJudge::new(provider.clone(), "judge-model");

        let verdict = judge.judge(&input("Greets", "Hi!")).await.unwrap();
        assert!(verdict.passed);
        assert_eq!(verdict.reasoning, "Greets warmly");
        assert_eq!(provider.requests()[0].model, "judge-model");
    }

    #[tokio::test]
    async fn semantic_judge_retries_transient_errors() {
        let provider = Arc::new(ScriptedProvider::from_replies([
            ScriptedReply::Status {
                status: 429,
                message: "slow down".into(),
            },
            ScriptedReply::Status {
                status: 503,
                message: "overloaded".into(),
            },
            ScriptedReply::Text(r#"{"passed": false, "reasoning": "wrong"}"#.into()),
        ]));
        let judge = LlmJudge::new(provider.clone(), "m").with_retry(RetryPolicy {
            max_retries: 3,
            backoff_ms: 1,
        });

        let verdict = judge.judge(&input("x", "y")).await.unwrap();
        assert!(!verdict.passed);
        assert_eq!(provider.requests().len(), 3);
    }

    #[tokio::test]
    async fn semantic_judge_gives_up_after_retry_bound() {
        let provider = Arc::new(ScriptedProvider::from_replies(
            (0..5).map(|_| ScriptedReply::Status {
                status: 500,
                message: "down".into(),
            }),
        ));
        let judge = LlmJudge::new(provider.clone(), "m").with_retry(RetryPolicy {
            max_retries: 2,
            backoff_ms: 1,
        });

        let error = judge.judge(&input("x", "y")).await.unwrap_err();
        assert!(error.is_transient());
        assert_eq!(provider.requests().len(), 3);
    }

    #[tokio::test]
    async fn semantic_judge_does_not_retry_auth_failures() {
        let provider = Arc::new(ScriptedProvider::from_replies([ScriptedReply::Status {
            status: 401,
            message: "bad key".into(),
        }]));
        let judge = LlmJudge::new(provider.clone(), "m");

        let error = judge.judge(&input("x", "y")).await.unwrap_err();
        assert!(matches!(error, JudgeError::Auth(_)));
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn malformed_reply_never_passes() {
        let provider = Arc::new(ScriptedProvider::from_texts(["passed: true, looks great"]));
        let judge = LlmJudge::new(provider, "m");

        let error = judge.judge(&input("x", "y")).await.unwrap_err();
        assert!(matches!(error, JudgeError::MalformedResponse(_)));
    }

    #[test]
    fn missing_credentials_select_keyword_judge() {
        let judge = select_judge(&JudgeConfig::default()).unwrap();
        assert_eq!(judge.kind(), JudgeKind::Keyword);

        let config = JudgeConfig::default().with_credentials(JudgeCredentials::OpenRouter("key".into()));
        assert_eq!(select_judge(&config).unwrap().kind(), JudgeKind::Semantic);
    }
}
