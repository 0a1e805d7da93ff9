use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures_util::{stream::FuturesUnordered, StreamExt};
use tokio::{task::JoinHandle, time};
use uuid::Uuid;

use crate::{
    config::EvalConfig,
    error::{EvalError, ExecutorError, JudgeError, StoreError},
    eval::{
        baseline::{compare, RegressionReport},
        executor::{AgentOutput, CaseExecutor},
        judge::{select_judge, CaseJudge, JudgeInput, JudgeKind, Verdict},
        metadata::{gate, MetadataChecker, MetadataPolicy},
        model::{Case, CaseResult, Judgment, ResultDraft, Run, RunDraft, RunStatus, Turn},
        report::{RunOutcome, RunSnapshot},
        store::EvalStore,
    },
};

pub const AD_HOC_EVAL_NAME: &str = "single-eval";

/// Per-run overrides of the runner's [`EvalConfig`].
#[derive(Clone, Default)]
pub struct RunOptions {
    pub metadata_checker: Option<Arc<dyn MetadataChecker>>,
    pub concurrency: Option<usize>,
    pub case_ids: Option<Vec<String>>,
    pub case_timeout: Option<Duration>,
    pub metadata_policy: Option<MetadataPolicy>,
    pub eval_name: Option<String>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata_checker(mut self, checker: impl MetadataChecker + 'static) -> Self {
        self.metadata_checker = Some(Arc::new(checker));
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency.max(1));
        self
    }

    pub fn with_case_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.case_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_case_timeout(mut self, timeout: Duration) -> Self {
        self.case_timeout = Some(timeout);
        self
    }

    pub fn with_metadata_policy(mut self, policy: MetadataPolicy) -> Self {
        self.metadata_policy = Some(policy);
        self
    }

    pub fn with_eval_name(mut self, name: impl Into<String>) -> Self {
        self.eval_name = Some(name.into());
        self
    }
}

/// Run-scoped cancellation: stops new cases from starting, in-flight cases
/// still finish and are recorded.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A started run. The run is already persisted as `running` when this is
/// returned, so pollers can observe it immediately.
pub struct RunHandle {
    run: Run,
    cancel: CancelFlag,
    task: JoinHandle<Result<RunOutcome, EvalError>>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run.id
    }

    /// The run as it was when the case loop started.
    pub fn started(&self) -> &Run {
        &self.run
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> Result<RunOutcome, EvalError> {
        self.task
            .await
            .map_err(|err| EvalError::Task(err.to_string()))?
    }
}

#[derive(Clone)]
struct CasePlan {
    checker: Option<Arc<dyn MetadataChecker>>,
    policy: MetadataPolicy,
    timeout: Duration,
    workers: usize,
}

struct CaseOutcome {
    draft: ResultDraft,
    systemic: Option<String>,
}

/// Drives runs: executes cases, judges them, persists results and keeps the
/// run's counters and status current.
#[derive(Clone)]
pub struct EvalRunner {
    store: Arc<dyn EvalStore>,
    judge: Arc<dyn CaseJudge>,
    config: EvalConfig,
}

impl EvalRunner {
    /// Selects the judge from `config.judge` once; every run of this runner
    /// uses the same strategy.
    pub fn new(store: Arc<dyn EvalStore>, config: EvalConfig) -> Result<Self, JudgeError> {
        let judge = select_judge(&config.judge)?;
        Ok(Self::with_judge(store, judge, config))
    }

    pub fn with_judge(store: Arc<dyn EvalStore>, judge: Arc<dyn CaseJudge>, config: EvalConfig) -> Self {
        Self {
            store,
            judge,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn EvalStore> {
        &self.store
    }

    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    pub fn judge_kind(&self) -> JudgeKind {
        self.judge.kind()
    }

    pub async fn start_run(
        &self,
        dataset_id: &str,
        executor: Arc<dyn CaseExecutor>,
        options: RunOptions,
    ) -> Result<RunHandle, EvalError> {
        let eval_name = options
            .eval_name
            .clone()
            .unwrap_or_else(|| executor.name().to_string());
        let run = self
            .store
            .create_run(RunDraft::for_dataset(dataset_id, eval_name))
            .await?;

        let cases = match self.resolve_cases(dataset_id, &options).await {
            Ok(cases) => cases,
            Err(SetupFailure::Store(err)) => {
                self.fail_quietly(run.id, &err.to_string()).await;
                return Err(err.into());
            }
            Err(SetupFailure::Invalid(message)) => {
                tracing::warn!(run_id = %run.id, dataset_id, %message, "run setup failed");
                self.store
                    .finish_run(run.id, RunStatus::Failed, Some(message.clone()))
                    .await?;
                return Err(EvalError::Setup {
                    run_id: run.id,
                    message,
                });
            }
        };

        let run = self.store.start_run(run.id, cases.len()).await?;
        let plan = CasePlan {
            checker: options.metadata_checker.clone(),
            policy: options.metadata_policy.unwrap_or(self.config.metadata_policy),
            timeout: options.case_timeout.unwrap_or(self.config.case_timeout),
            workers: options.concurrency.unwrap_or(self.config.max_workers).max(1),
        };

        tracing::info!(
            run_id = %run.id,
            dataset_id,
            cases = cases.len(),
            workers = plan.workers,
            judge = ?self.judge.kind(),
            "run started"
        );

        let cancel = CancelFlag::default();
        let runner = self.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            let run_id = run.id;
            async move { runner.drive(run_id, cases, executor, plan, cancel).await }
        });

        Ok(RunHandle { run, cancel, task })
    }

    pub async fn run_to_completion(
        &self,
        dataset_id: &str,
        executor: Arc<dyn CaseExecutor>,
        options: RunOptions,
    ) -> Result<RunOutcome, EvalError> {
        self.start_run(dataset_id, executor, options).await?.wait().await
    }

    /// Judges one already produced output as its own run with no dataset.
    pub async fn evaluate_single(
        &self,
        input: &str,
        output: &str,
        expected: &str,
        name: Option<&str>,
    ) -> Result<RunOutcome, EvalError> {
        let run = self
            .store
            .create_run(RunDraft::ad_hoc(name.unwrap_or(AD_HOC_EVAL_NAME)))
            .await?;
        self.store.start_run(run.id, 1).await?;

        let conversation = vec![Turn::user(input)];
        let started = Instant::now();
        let mut draft = ResultDraft {
            inputs: Some(conversation.clone()),
            expected_outcome: Some(expected.to_string()),
            actual_output: Some(output.to_string()),
            ..ResultDraft::default()
        };

        let verdict = self
            .judge
            .judge(&JudgeInput {
                conversation: &conversation,
                expected_outcome: expected,
                actual_output: output,
                expected_metadata: None,
                actual_metadata: None,
            })
            .await;
        apply_verdict(&mut draft, verdict, None);
        draft.execution_time_ms = elapsed_ms(started);

        let result = match self.store.append_result(run.id, draft).await {
            Ok(result) => result,
            Err(err) => {
                self.fail_quietly(run.id, &err.to_string()).await;
                return Err(err.into());
            }
        };
        let run = self.store.finish_run(run.id, RunStatus::Completed, None).await?;

        tracing::info!(run_id = %run.id, passed = result.passed, "single evaluation recorded");
        Ok(RunOutcome {
            run,
            results: vec![result],
            regression: None,
        })
    }

    pub async fn snapshot(&self, run_id: Uuid) -> Result<Option<RunSnapshot>, EvalError> {
        Ok(RunSnapshot::load(self.store.as_ref(), run_id).await?)
    }

    async fn resolve_cases(
        &self,
        dataset_id: &str,
        options: &RunOptions,
    ) -> Result<Vec<Case>, SetupFailure> {
        let dataset = self
            .store
            .load_dataset(dataset_id)
            .await
            .map_err(|err| match err {
                StoreError::Serialization(err) => {
                    SetupFailure::Invalid(format!("dataset {dataset_id} is unreadable: {err}"))
                }
                other => SetupFailure::Store(other),
            })?
            .ok_or_else(|| SetupFailure::Invalid(format!("dataset {dataset_id} not found")))?;

        let duplicates = dataset.duplicate_case_ids();
        if !duplicates.is_empty() {
            return Err(SetupFailure::Invalid(format!(
                "duplicate case ids in dataset {dataset_id}: {}",
                duplicates.join(", ")
            )));
        }

        let wanted = options
            .case_ids
            .as_deref()
            .unwrap_or(self.config.case_ids.as_slice());
        if wanted.is_empty() {
            return Ok(dataset.cases);
        }

        let missing: Vec<&str> = wanted
            .iter()
            .filter(|id| !dataset.cases.iter().any(|case| &case.id == *id))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(SetupFailure::Invalid(format!(
                "case ids not found: {}",
                missing.join(", ")
            )));
        }

        Ok(dataset
            .cases
            .into_iter()
            .filter(|case| wanted.contains(&case.id))
            .collect())
    }

    async fn drive(
        self,
        run_id: Uuid,
        cases: Vec<Case>,
        executor: Arc<dyn CaseExecutor>,
        plan: CasePlan,
        cancel: CancelFlag,
    ) -> Result<RunOutcome, EvalError> {
        let aborted = match self.run_cases(run_id, cases, executor.as_ref(), &plan, &cancel).await {
            Ok(aborted) => aborted,
            Err(err) => {
                self.fail_quietly(run_id, &err.to_string()).await;
                return Err(err.into());
            }
        };

        let run = match aborted {
            Some(reason) => {
                tracing::warn!(%run_id, %reason, "run aborted");
                self.store
                    .finish_run(run_id, RunStatus::Failed, Some(reason))
                    .await?
            }
            None => {
                self.store
                    .finish_run(run_id, RunStatus::Completed, None)
                    .await?
            }
        };

        tracing::info!(
            %run_id,
            status = %run.status,
            total = run.total,
            passed = run.passed,
            failed = run.failed,
            cancelled = cancel.is_cancelled(),
            "run finished"
        );

        let results = self.store.list_results(run_id).await?;
        let regression = self.regression_for(&run, &results).await?;
        if let Some(report) = regression.as_ref().filter(|report| report.has_regressions()) {
            tracing::warn!(%run_id, regressions = ?report.regressions, "{}", report.summary());
        }

        Ok(RunOutcome {
            run,
            results,
            regression,
        })
    }

    /// Returns the reason when a systemic failure stopped the run.
    async fn run_cases(
        &self,
        run_id: Uuid,
        cases: Vec<Case>,
        executor: &dyn CaseExecutor,
        plan: &CasePlan,
        cancel: &CancelFlag,
    ) -> Result<Option<String>, StoreError> {
        let mut queue = cases.iter();
        let mut in_flight = FuturesUnordered::new();
        let mut aborted: Option<String> = None;

        loop {
            while in_flight.len() < plan.workers && aborted.is_none() && !cancel.is_cancelled() {
                match queue.next() {
                    Some(case) => in_flight.push(self.evaluate_case(case, executor, plan)),
                    None => break,
                }
            }

            let Some(outcome) = in_flight.next().await else {
                break;
            };
            let CaseOutcome { draft, systemic } = outcome;
            let result = self.store.append_result(run_id, draft).await?;
            tracing::debug!(
                %run_id,
                case_id = result.case_id.as_deref().unwrap_or("-"),
                passed = result.passed,
                elapsed_ms = result.execution_time_ms,
                "case recorded"
            );

            if aborted.is_none() {
                aborted = systemic;
            }
        }

        if cancel.is_cancelled() && queue.len() > 0 {
            tracing::info!(%run_id, skipped = queue.len(), "run cancelled, remaining cases skipped");
        }
        Ok(aborted)
    }

    async fn evaluate_case(&self, case: &Case, executor: &dyn CaseExecutor, plan: &CasePlan) -> CaseOutcome {
        let mut draft = ResultDraft {
            case_id: Some(case.id.clone()),
            expected_metadata: case.expected_metadata.clone(),
            ..ResultDraft::default()
        };

        let started = Instant::now();
        let invoked = match time::timeout(plan.timeout, executor.invoke(&case.inputs)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutorError::Timeout(plan.timeout)),
        };
        draft.execution_time_ms = elapsed_ms(started);

        let AgentOutput { output, metadata } = match invoked {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!(case_id = %case.id, error = %err, "agent call failed");
                draft.error_message = Some(err.to_string());
                return CaseOutcome {
                    draft,
                    systemic: err.is_systemic().then(|| err.to_string()),
                };
            }
        };

        let verdict = self
            .judge
            .judge(&JudgeInput {
                conversation: &case.inputs,
                expected_outcome: &case.expected_outcome,
                actual_output: &output,
                expected_metadata: case.expected_metadata.as_ref(),
                actual_metadata: metadata.as_ref(),
            })
            .await;

        let metadata_passed = gate(
            plan.checker.as_deref(),
            plan.policy,
            case.expected_metadata.as_ref(),
            metadata.as_ref(),
        );
        apply_verdict(&mut draft, verdict, metadata_passed);
        draft.actual_output = Some(output);
        draft.actual_metadata = metadata;

        if let Some(error) = &draft.error_message {
            tracing::warn!(case_id = %case.id, %error, "case could not be judged");
        }

        CaseOutcome {
            draft,
            systemic: None,
        }
    }

    async fn regression_for(
        &self,
        run: &Run,
        results: &[CaseResult],
    ) -> Result<Option<RegressionReport>, StoreError> {
        if run.status != RunStatus::Completed {
            return Ok(None);
        }
        let Some(dataset_id) = run.dataset_id.as_deref() else {
            return Ok(None);
        };
        let baseline = self.store.get_baseline(dataset_id).await?;
        Ok(baseline.map(|baseline| compare(dataset_id, Some(&baseline), Some(run.id), results)))
    }

    async fn fail_quietly(&self, run_id: Uuid, reason: &str) {
        if let Err(err) = self
            .store
            .finish_run(run_id, RunStatus::Failed, Some(reason.to_string()))
            .await
        {
            tracing::error!(%run_id, error = %err, "could not mark run as failed");
        }
    }
}

enum SetupFailure {
    Invalid(String),
    Store(StoreError),
}

/// A verdict counts only when one was produced; judge errors fail the case
/// with a message that tells them apart from a judged failure.
fn apply_verdict(
    draft: &mut ResultDraft,
    verdict: Result<Verdict, JudgeError>,
    metadata_passed: Option<bool>,
) {
    draft.metadata_passed = metadata_passed;
    match verdict {
        Ok(verdict) => {
            let passed = verdict.passed && metadata_passed.unwrap_or(true);
            draft.passed = passed;
            draft.judgment = Some(Judgment::from(passed));
            draft.reasoning = Some(verdict.reasoning);
        }
        Err(err) => {
            draft.passed = false;
            draft.judgment = None;
            draft.error_message = Some(format!("could not judge: {err}"));
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
