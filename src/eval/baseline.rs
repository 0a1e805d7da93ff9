use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::EvalError,
    eval::{
        model::{score, CaseResult, Run, RunStatus},
        store::EvalStore,
    },
};

/// Outcome of one case at the time the baseline was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineEntry {
    pub passed: bool,
    pub result_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Regression reference for one dataset, replaced wholesale on every save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub dataset_id: String,
    pub source_run_id: Uuid,
    pub saved_at: DateTime<Utc>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
    pub score: Option<f64>,
    pub results: BTreeMap<String, BaselineEntry>,
}

impl Baseline {
    /// Snapshots a completed run. Results without a case id are skipped.
    pub fn from_run(run: &Run, results: &[CaseResult]) -> Result<Self, EvalError> {
        if run.status != RunStatus::Completed {
            return Err(EvalError::Baseline(format!(
                "run {} is {:?}, only completed runs can become a baseline",
                run.id, run.status
            )));
        }
        let dataset_id = run.dataset_id.clone().ok_or_else(|| {
            EvalError::Baseline(format!("run {} has no dataset", run.id))
        })?;

        let mut entries = BTreeMap::new();
        for result in results {
            let Some(case_id) = result.case_id.clone() else {
                continue;
            };
            let entry = BaselineEntry {
                passed: result.passed,
                result_id: result.id,
                error_message: result.error_message.clone(),
            };
            if entries.insert(case_id.clone(), entry).is_some() {
                return Err(EvalError::Baseline(format!(
                    "run {} has more than one result for case {case_id}",
                    run.id
                )));
            }
        }

        Ok(Self {
            dataset_id,
            source_run_id: run.id,
            saved_at: Utc::now(),
            passed: run.passed,
            failed: run.failed,
            total: run.total,
            score: score(run.passed, run.total),
            results: entries,
        })
    }
}

/// Case-level diff between a baseline and a candidate run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegressionReport {
    pub dataset_id: String,
    pub has_baseline: bool,
    pub baseline_run_id: Option<Uuid>,
    pub candidate_run_id: Option<Uuid>,
    pub unchanged_pass: Vec<String>,
    pub unchanged_fail: Vec<String>,
    pub regressions: Vec<String>,
    pub fixes: Vec<String>,
    pub new_cases: Vec<String>,
    pub removed_cases: Vec<String>,
}

impl RegressionReport {
    pub fn unchanged(&self) -> usize {
        self.unchanged_pass.len() + self.unchanged_fail.len()
    }

    pub fn has_regressions(&self) -> bool {
        !self.regressions.is_empty()
    }

    pub fn summary(&self) -> String {
        if !self.has_baseline {
            return format!("no baseline saved for dataset {}", self.dataset_id);
        }
        format!(
            "{} cases now failing, {} fixed, {} unchanged, {} new, {} removed",
            self.regressions.len(),
            self.fixes.len(),
            self.unchanged(),
            self.new_cases.len(),
            self.removed_cases.len(),
        )
    }
}

/// Matches results by case id. Ad-hoc results are not comparable and ignored.
pub fn compare(
    dataset_id: &str,
    baseline: Option<&Baseline>,
    candidate_run_id: Option<Uuid>,
    candidate: &[CaseResult],
) -> RegressionReport {
    let mut report = RegressionReport {
        dataset_id: dataset_id.to_string(),
        candidate_run_id,
        ..RegressionReport::default()
    };

    let Some(baseline) = baseline else {
        return report;
    };
    report.has_baseline = true;
    report.baseline_run_id = Some(baseline.source_run_id);

    let current: BTreeMap<&str, bool> = candidate
        .iter()
        .filter_map(|result| Some((result.case_id.as_deref()?, result.passed)))
        .collect();

    for (case_id, passed) in &current {
        let bucket = match (baseline.results.get(*case_id).map(|entry| entry.passed), *passed) {
            (None, _) => &mut report.new_cases,
            (Some(true), true) => &mut report.unchanged_pass,
            (Some(false), false) => &mut report.unchanged_fail,
            (Some(true), false) => &mut report.regressions,
            (Some(false), true) => &mut report.fixes,
        };
        bucket.push(case_id.to_string());
    }

    report.removed_cases = baseline
        .results
        .keys()
        .filter(|case_id| !current.contains_key(case_id.as_str()))
        .cloned()
        .collect();

    report
}

async fn dataset_run(
    store: &dyn EvalStore,
    dataset_id: &str,
    run_id: Uuid,
) -> Result<(Run, Vec<CaseResult>), EvalError> {
    let (run, results) = store
        .snapshot(run_id)
        .await?
        .ok_or_else(|| EvalError::Baseline(format!("run {run_id} not found")))?;
    if run.dataset_id.as_deref() != Some(dataset_id) {
        return Err(EvalError::Baseline(format!(
            "run {run_id} does not belong to dataset {dataset_id}"
        )));
    }
    Ok((run, results))
}

/// Makes `run_id` the baseline of `dataset_id`, replacing the previous one.
pub async fn save_baseline(
    store: &dyn EvalStore,
    dataset_id: &str,
    run_id: Uuid,
) -> Result<Baseline, EvalError> {
    let (run, results) = dataset_run(store, dataset_id, run_id).await?;
    let baseline = Baseline::from_run(&run, &results)?;
    store.save_baseline(baseline.clone()).await?;

    tracing::info!(
        dataset_id,
        %run_id,
        cases = baseline.results.len(),
        "baseline saved"
    );
    Ok(baseline)
}

pub async fn compare_to_baseline(
    store: &dyn EvalStore,
    dataset_id: &str,
    run_id: Uuid,
) -> Result<RegressionReport, EvalError> {
    let (_, results) = dataset_run(store, dataset_id, run_id).await?;
    let baseline = store.get_baseline(dataset_id).await?;
    Ok(compare(dataset_id, baseline.as_ref(), Some(run_id), &results))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::model::{ResultDraft, RunDraft};

    fn result(case_id: Option<&str>, passed: bool) -> CaseResult {
        ResultDraft {
            case_id: case_id.map(str::to_string),
            passed,
            ..ResultDraft::default()
        }
        .into_result(Uuid::new_v4(), Uuid::nil())
    }

    fn completed_run(results: &[CaseResult]) -> Run {
        let mut run = Run::new(Uuid::new_v4(), RunDraft::for_dataset("ds", "agent"));
        run.transition(RunStatus::Running, None).unwrap();
        for r in results {
            run.record(r.passed).unwrap();
        }
        run.transition(RunStatus::Completed, None).unwrap();
        run
    }

    #[test]
    fn one_regression_one_fix_two_unchanged() {
        let run_a = [
            result(Some("c1"), true),
            result(Some("c2"), true),
            result(Some("c3"), true),
            result(Some("c4"), false),
        ];
        let baseline = Baseline::from_run(&completed_run(&run_a), &run_a).unwrap();
        assert_eq!((baseline.passed, baseline.failed, baseline.total), (3, 1, 4));
        assert_eq!(baseline.score, Some(75.0));

        let run_b = [
            result(Some("c1"), true),
            result(Some("c2"), false),
            result(Some("c3"), true),
            result(Some("c4"), true),
        ];
        let report = compare("ds", Some(&baseline), None, &run_b);

        assert_eq!(report.regressions, vec!["c2"]);
        assert_eq!(report.fixes, vec!["c4"]);
        assert_eq!(report.unchanged(), 2);
        assert!(report.new_cases.is_empty() && report.removed_cases.is_empty());
        assert!(report.summary().starts_with("1 cases now failing"));
    }

    #[test]
    fn new_and_removed_cases_are_reported() {
        let before = [result(Some("old"), true), result(Some("kept"), false)];
        let baseline = Baseline::from_run(&completed_run(&before), &before).unwrap();

        let after = [result(Some("kept"), false), result(Some("fresh"), true), result(None, false)];
        let report = compare("ds", Some(&baseline), None, &after);

        assert_eq!(report.new_cases, vec!["fresh"]);
        assert_eq!(report.removed_cases, vec!["old"]);
        assert_eq!(report.unchanged_fail, vec!["kept"]);
        assert!(!report.has_regressions());
    }

    #[test]
    fn missing_baseline_yields_empty_report() {
        let report = compare("ds", None, None, &[result(Some("c1"), false)]);
        assert!(!report.has_baseline);
        assert!(report.regressions.is_empty());
        assert!(report.summary().contains("no baseline"));
    }

    #[test]
    fn only_completed_runs_become_baselines() {
        let mut run = Run::new(Uuid::new_v4(), RunDraft::for_dataset("ds", "agent"));
        run.transition(RunStatus::Running, None).unwrap();
        assert!(matches!(
            Baseline::from_run(&run, &[]),
            Err(EvalError::Baseline(_))
        ));
    }

    #[test]
    fn repeated_case_ids_cannot_become_a_baseline() {
        let results = [result(Some("c1"), true), result(Some("c1"), false)];
        let error = Baseline::from_run(&completed_run(&results), &results).unwrap_err();
        assert!(error.to_string().contains("more than one result for case c1"));
    }
}
