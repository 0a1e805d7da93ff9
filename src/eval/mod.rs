pub mod baseline;
pub mod executor;
pub mod judge;
pub mod metadata;
pub mod model;
pub mod prompt;
pub mod report;
pub mod runner;
pub mod store;

pub use baseline::{compare_to_baseline, save_baseline, Baseline, BaselineEntry, RegressionReport};
pub use executor::{last_message_executor, AgentOutput, CaseExecutor, FnExecutor, HttpExecutor};
pub use judge::{
    select_judge, CaseJudge, JudgeInput, JudgeKind, KeywordJudge, LlmJudge, RetryPolicy, Verdict,
};
pub use metadata::{ContainsExpected, MetadataChecker, MetadataPolicy, SetEquality};
pub use model::{
    Case, CaseResult, Dataset, Judgment, Metadata, ResultDraft, Run, RunDraft, RunStatus, Turn,
};
pub use report::{RunOutcome, RunSnapshot};
pub use runner::{CancelFlag, EvalRunner, RunHandle, RunOptions};
pub use store::{EvalStore, InMemoryStore, JsonDirStore};
