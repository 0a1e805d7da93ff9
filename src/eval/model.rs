use std::{collections::HashSet, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{error::StoreError, types::MessageRole};

/// Structured side-channel data such as tool calls or citations.
pub type Metadata = serde_json::Map<String, Value>;

/// One message of a scripted conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: MessageRole,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Turn {
    pub fn new(role: MessageRole, message: impl Into<String>) -> Self {
        Self {
            role,
            message: message.into(),
            attachments: Vec::new(),
            metadata: None,
        }
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self::new(MessageRole::User, message)
    }

    pub fn assistant(message: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(MessageRole::System, message)
    }
}

/// The message an agent is expected to answer: the last user turn, if any.
pub fn last_user_message(turns: &[Turn]) -> Option<&str> {
    turns
        .iter()
        .rev()
        .find(|turn| turn.role == MessageRole::User)
        .map(|turn| turn.message.as_str())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub inputs: Vec<Turn>,
    pub expected_outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_metadata: Option<Metadata>,
}

impl Case {
    pub fn new(id: impl Into<String>, inputs: Vec<Turn>, expected_outcome: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            inputs,
            expected_outcome: expected_outcome.into(),
            expected_metadata: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_expected_metadata(mut self, metadata: Metadata) -> Self {
        self.expected_metadata = Some(metadata);
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub cases: Vec<Case>,
}

impl Dataset {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            cases: Vec::new(),
        }
    }

    pub fn with_cases<I>(mut self, cases: I) -> Self
    where
        I: IntoIterator<Item = Case>,
    {
        self.cases.extend(cases);
        self
    }

    /// Case ids that occur more than once, in first-seen order. Results are
    /// matched to baselines by case id, so these must be unique.
    pub fn duplicate_case_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut duplicates: Vec<String> = Vec::new();
        for case in &self.cases {
            if !seen.insert(case.id.as_str()) && !duplicates.contains(&case.id) {
                duplicates.push(case.id.clone());
            }
        }
        duplicates
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    fn can_become(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        })
    }
}

/// What a store needs to create a run.
#[derive(Debug, Clone)]
pub struct RunDraft {
    pub dataset_id: Option<String>,
    pub eval_name: String,
}

impl RunDraft {
    pub fn for_dataset(dataset_id: impl Into<String>, eval_name: impl Into<String>) -> Self {
        Self {
            dataset_id: Some(dataset_id.into()),
            eval_name: eval_name.into(),
        }
    }

    pub fn ad_hoc(eval_name: impl Into<String>) -> Self {
        Self {
            dataset_id: None,
            eval_name: eval_name.into(),
        }
    }
}

/// One execution of a dataset (or a single ad-hoc case) against an agent.
///
/// `total`, `passed` and `failed` only grow and always satisfy
/// `total == passed + failed`; `case_count` is the number of cases the run
/// planned to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub dataset_id: Option<String>,
    pub eval_name: String,
    pub status: RunStatus,
    pub case_count: usize,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(id: Uuid, draft: RunDraft) -> Self {
        Self {
            id,
            dataset_id: draft.dataset_id,
            eval_name: draft.eval_name,
            status: RunStatus::Pending,
            case_count: 0,
            total: 0,
            passed: 0,
            failed: 0,
            score: None,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn transition(&mut self, next: RunStatus, error: Option<String>) -> Result<(), StoreError> {
        if !self.status.can_become(next) {
            return Err(StoreError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        self.status = next;
        match next {
            RunStatus::Completed => {
                self.completed_at = Some(Utc::now());
                self.score = score(self.passed, self.total);
            }
            RunStatus::Failed => {
                self.completed_at = Some(Utc::now());
                self.error_message = error;
            }
            RunStatus::Pending | RunStatus::Running => {}
        }

        Ok(())
    }

    /// Counts one finished case. The counters move together so a reader never
    /// sees `passed + failed != total`.
    pub fn record(&mut self, passed: bool) -> Result<(), StoreError> {
        if self.status != RunStatus::Running {
            return Err(StoreError::RunClosed(self.id));
        }

        self.total += 1;
        if passed {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        Ok(())
    }
}

/// Percentage of passed cases; `None` when nothing was counted.
pub fn score(passed: usize, total: usize) -> Option<f64> {
    if total == 0 {
        None
    } else {
        Some(100.0 * passed as f64 / total as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Judgment {
    Pass,
    Fail,
}

impl From<bool> for Judgment {
    fn from(passed: bool) -> Self {
        if passed {
            Judgment::Pass
        } else {
            Judgment::Fail
        }
    }
}

/// Judged outcome of one case, before the store assigns an identity.
#[derive(Debug, Clone, Default)]
pub struct ResultDraft {
    pub case_id: Option<String>,
    pub inputs: Option<Vec<Turn>>,
    pub expected_outcome: Option<String>,
    pub passed: bool,
    pub actual_output: Option<String>,
    pub judgment: Option<Judgment>,
    pub reasoning: Option<String>,
    pub expected_metadata: Option<Metadata>,
    pub actual_metadata: Option<Metadata>,
    pub metadata_passed: Option<bool>,
    pub error_message: Option<String>,
    pub execution_time_ms: u64,
}

impl ResultDraft {
    pub fn into_result(self, id: Uuid, run_id: Uuid) -> CaseResult {
        CaseResult {
            id,
            run_id,
            case_id: self.case_id,
            inputs: self.inputs,
            expected_outcome: self.expected_outcome,
            passed: self.passed,
            actual_output: self.actual_output,
            judgment: self.judgment,
            reasoning: self.reasoning,
            expected_metadata: self.expected_metadata,
            actual_metadata: self.actual_metadata,
            metadata_passed: self.metadata_passed,
            error_message: self.error_message,
            execution_time_ms: self.execution_time_ms,
            created_at: Utc::now(),
        }
    }
}

/// Append-only record of one case within one run.
///
/// `inputs` and `expected_outcome` are only stored inline for ad-hoc results,
/// which have no case to point at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub id: Uuid,
    pub run_id: Uuid,
    pub case_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<Turn>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_outcome: Option<String>,
    pub passed: bool,
    pub actual_output: Option<String>,
    pub judgment: Option<Judgment>,
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_metadata: Option<Metadata>,
    pub actual_metadata: Option<Metadata>,
    pub metadata_passed: Option<bool>,
    pub error_message: Option<String>,
    pub execution_time_ms: u64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_run() -> Run {
        let mut run = Run::new(Uuid::new_v4(), RunDraft::for_dataset("ds", "agent"));
        run.transition(RunStatus::Running, None).unwrap();
        run
    }

    #[test]
    fn status_only_moves_forward() {
        let mut run = running_run();
        run.transition(RunStatus::Completed, None).unwrap();

        let error = run.transition(RunStatus::Running, None).unwrap_err();
        assert!(matches!(
            error,
            StoreError::InvalidTransition {
                from: RunStatus::Completed,
                to: RunStatus::Running
            }
        ));
    }

    #[test]
    fn completing_computes_unrounded_score() {
        let mut run = running_run();
        run.record(true).unwrap();
        run.record(false).unwrap();
        run.record(false).unwrap();
        run.transition(RunStatus::Completed, None).unwrap();

        assert_eq!(run.total, run.passed + run.failed);
        let score = run.score.unwrap();
        assert!((score - 100.0 / 3.0).abs() < f64::EPSILON * 100.0);
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn empty_run_has_no_score() {
        let mut run = running_run();
        run.transition(RunStatus::Completed, None).unwrap();
        assert_eq!(run.total, 0);
        assert_eq!(run.score, None);
    }

    #[test]
    fn closed_run_rejects_results() {
        let mut run = running_run();
        run.transition(RunStatus::Failed, Some("boom".into())).unwrap();
        assert!(matches!(run.record(true), Err(StoreError::RunClosed(_))));
        assert_eq!(run.error_message.as_deref(), Some("boom"));
        assert_eq!(run.score, None);
    }

    #[test]
    fn last_user_message_skips_assistant_turns() {
        let turns = vec![
            Turn::user("first"),
            Turn::assistant("reply"),
            Turn::user("second"),
            Turn::assistant("trailing"),
        ];
        assert_eq!(last_user_message(&turns), Some("second"));
        assert_eq!(last_user_message(&[]), None);
    }

    #[test]
    fn case_deserializes_from_original_shape() {
        let case: Case = serde_json::from_value(serde_json::json!({
            "id": "c1",
            "inputs": [{"role": "user", "message": "Hi", "attachments": []}],
            "expected_outcome": "Greets back",
            "expected_metadata": {"tool_calls": ["lookup"]}
        }))
        .unwrap();

        assert_eq!(case.inputs[0].role, MessageRole::User);
        assert!(case.expected_metadata.unwrap().contains_key("tool_calls"));
    }

    #[test]
    fn duplicate_case_ids_are_listed_once() {
        let dataset = Dataset::new("ds", "ds").with_cases(["a", "b", "a", "c", "a", "b"].map(|id| {
            Case::new(id, vec![Turn::user(id)], "ok")
        }));
        assert_eq!(dataset.duplicate_case_ids(), vec!["a", "b"]);
        assert!(Dataset::new("empty", "empty").duplicate_case_ids().is_empty());
    }
}
