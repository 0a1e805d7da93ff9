use std::{env, time::Duration};

use crate::eval::{judge::RetryPolicy, metadata::MetadataPolicy};

pub const DEFAULT_JUDGE_MODEL: &str = "anthropic/claude-haiku-4.5";
pub const DEFAULT_CASE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_KEYWORD_THRESHOLD: f64 = 0.3;

#[derive(Debug, Clone, PartialEq)]
pub enum JudgeCredentials {
    None,
    OpenRouter(String),
    OpenAI(String),
}

/// How the judge strategy is chosen and tuned.
#[derive(Debug, Clone)]
pub struct JudgeConfig {
    pub model: String,
    pub credentials: JudgeCredentials,
    pub keyword_threshold: f64,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_JUDGE_MODEL.to_string(),
            credentials: JudgeCredentials::None,
            keyword_threshold: DEFAULT_KEYWORD_THRESHOLD,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl JudgeConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_credentials(mut self, credentials: JudgeCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_keyword_threshold(mut self, threshold: f64) -> Self {
        self.keyword_threshold = threshold;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Engine settings handed to the runner at construction time.
#[derive(Debug, Clone)]
pub struct EvalConfig {
    pub judge: JudgeConfig,
    pub max_workers: usize,
    pub case_timeout: Duration,
    pub case_ids: Vec<String>,
    pub metadata_policy: MetadataPolicy,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            judge: JudgeConfig::default(),
            max_workers: 1,
            case_timeout: DEFAULT_CASE_TIMEOUT,
            case_ids: Vec::new(),
            metadata_policy: MetadataPolicy::Lenient,
        }
    }
}

impl EvalConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `PRUEFWERK_*` variables and provider API keys. Only binaries call
    /// this; library code receives the resulting value.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(model) = env::var("PRUEFWERK_JUDGE_MODEL") {
            if !model.trim().is_empty() {
                config.judge.model = model;
            }
        }

        config.judge.credentials = match (
            non_empty_var("OPENROUTER_API_KEY"),
            non_empty_var("OPENAI_API_KEY"),
        ) {
            (Some(key), _) => JudgeCredentials::OpenRouter(key),
            (None, Some(key)) => JudgeCredentials::OpenAI(key),
            (None, None) => JudgeCredentials::None,
        };

        if let Some(threshold) =
            parsed_var::<f64>("PRUEFWERK_KEYWORD_THRESHOLD").and_then(finite_threshold)
        {
            config.judge.keyword_threshold = threshold;
        }
        if let Some(retries) = parsed_var::<u32>("PRUEFWERK_JUDGE_RETRIES") {
            config.judge.retry.max_retries = retries;
        }
        if let Some(workers) = parsed_var::<usize>("PRUEFWERK_MAX_WORKERS") {
            config.max_workers = workers.max(1);
        }
        if let Some(ms) = parsed_var::<u64>("PRUEFWERK_CASE_TIMEOUT_MS") {
            config.case_timeout = Duration::from_millis(ms);
        }
        if let Some(ids) = non_empty_var("PRUEFWERK_CASE_IDS") {
            config.case_ids = parse_case_ids(&ids);
        }
        if let Some(policy) = non_empty_var("PRUEFWERK_METADATA_POLICY") {
            match policy.parse() {
                Ok(policy) => config.metadata_policy = policy,
                Err(err) => tracing::warn!(%err, "ignoring PRUEFWERK_METADATA_POLICY"),
            }
        }

        config
    }

    pub fn with_judge(mut self, judge: JudgeConfig) -> Self {
        self.judge = judge;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_case_timeout(mut self, timeout: Duration) -> Self {
        self.case_timeout = timeout;
        self
    }

    pub fn with_case_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.case_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata_policy(mut self, policy: MetadataPolicy) -> Self {
        self.metadata_policy = policy;
        self
    }
}

pub fn parse_case_ids(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = non_empty_var(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

fn finite_threshold(value: f64) -> Option<f64> {
    if value.is_finite() {
        Some(value)
    } else {
        tracing::warn!(%value, "ignoring non-finite PRUEFWERK_KEYWORD_THRESHOLD");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_ids_are_trimmed_and_blank_entries_dropped() {
        assert_eq!(parse_case_ids(" a, b ,,c "), vec!["a", "b", "c"]);
        assert!(parse_case_ids(" , ").is_empty());
    }

    #[test]
    fn defaults_are_sequential_and_lenient() {
        let config = EvalConfig::default();
        assert_eq!(config.max_workers, 1);
        assert_eq!(config.case_timeout, DEFAULT_CASE_TIMEOUT);
        assert_eq!(config.metadata_policy, MetadataPolicy::Lenient);
        assert_eq!(config.judge.credentials, JudgeCredentials::None);
    }

    #[test]
    fn zero_workers_clamp_to_one() {
        assert_eq!(EvalConfig::new().with_max_workers(0).max_workers, 1);
    }

    #[test]
    fn non_finite_thresholds_are_ignored() {
        assert_eq!(finite_threshold(0.5), Some(0.5));
        assert_eq!(finite_threshold(f64::NAN), None);
        assert_eq!(finite_threshold(f64::NEG_INFINITY), None);
        assert_eq!("nan".parse::<f64>().ok().and_then(finite_threshold), None);
    }
}
