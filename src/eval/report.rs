use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::StoreError,
    eval::{
        baseline::RegressionReport,
        model::{CaseResult, Run, RunStatus},
        store::EvalStore,
    },
};

/// What a poller sees: the run row plus every result appended so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: Run,
    pub results: Vec<CaseResult>,
}

impl RunSnapshot {
    pub async fn load(store: &dyn EvalStore, run_id: Uuid) -> Result<Option<Self>, StoreError> {
        Ok(store
            .snapshot(run_id)
            .await?
            .map(|(run, results)| Self { run, results }))
    }

    /// Pollers stop once this is true.
    pub fn is_terminal(&self) -> bool {
        self.run.status.is_terminal()
    }
}

/// Final state of a run handed back by `RunHandle::wait`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run: Run,
    pub results: Vec<CaseResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regression: Option<RegressionReport>,
}

impl RunOutcome {
    /// Completed with no failing case and no regression.
    pub fn is_clean(&self) -> bool {
        self.run.status == RunStatus::Completed
            && self.run.failed == 0
            && !self
                .regression
                .as_ref()
                .is_some_and(RegressionReport::has_regressions)
    }
}

/// Scores are stored unrounded; this is the only place they get rounded.
pub fn format_score(score: Option<f64>) -> String {
    match score {
        Some(score) => format!("{score:.1}%"),
        None => "n/a".to_string(),
    }
}

pub fn render_run(run: &Run, results: &[CaseResult]) -> String {
    let mut out = String::new();
    let dataset = run.dataset_id.as_deref().unwrap_or("(ad-hoc)");
    let _ = writeln!(
        out,
        "run {} [{}] dataset={} eval={}",
        run.id,
        run.status,
        dataset,
        run.eval_name
    );
    let _ = writeln!(
        out,
        "  {}/{} passed, {} failed, score {}",
        run.passed,
        run.total,
        run.failed,
        format_score(run.score)
    );
    if let Some(error) = &run.error_message {
        let _ = writeln!(out, "  error: {error}");
    }

    for result in results {
        let mark = if result.passed { "PASS" } else { "FAIL" };
        let case = result.case_id.as_deref().unwrap_or("-");
        let _ = write!(out, "  {mark} {case} ({} ms)", result.execution_time_ms);
        if let Some(error) = &result.error_message {
            let _ = write!(out, " error: {error}");
        } else if let Some(reasoning) = &result.reasoning {
            let _ = write!(out, " {reasoning}");
        }
        if result.metadata_passed == Some(false) {
            let _ = write!(out, " [metadata mismatch]");
        }
        out.push('\n');
    }

    out
}

pub fn render_regression(report: &RegressionReport) -> String {
    let mut out = report.summary();
    if !report.regressions.is_empty() {
        let _ = write!(out, "\n  regressions: {}", report.regressions.join(", "));
    }
    if !report.fixes.is_empty() {
        let _ = write!(out, "\n  fixes: {}", report.fixes.join(", "));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::model::{ResultDraft, RunDraft};

    #[test]
    fn score_is_rounded_for_display_only() {
        assert_eq!(format_score(Some(100.0 / 3.0)), "33.3%");
        assert_eq!(format_score(None), "n/a");
    }

    #[test]
    fn rendered_run_lists_each_case() {
        let mut run = Run::new(Uuid::new_v4(), RunDraft::for_dataset("ds", "agent"));
        run.transition(RunStatus::Running, None).unwrap();
        run.record(false).unwrap();
        run.transition(RunStatus::Completed, None).unwrap();

        let result = ResultDraft {
            case_id: Some("slow".into()),
            error_message: Some("agent timed out after 1s".into()),
            ..ResultDraft::default()
        }
        .into_result(Uuid::new_v4(), run.id);

        let text = render_run(&run, &[result]);
        assert!(text.contains("[completed]"));
        assert!(text.contains("0/1 passed"));
        assert!(text.contains("FAIL slow"));
        assert!(text.contains("agent timed out"));
    }
}
