use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::{
    error::StoreError,
    eval::{
        baseline::Baseline,
        model::{CaseResult, Dataset, ResultDraft, Run, RunDraft, RunStatus},
    },
};

/// Persistence contract of the run engine.
///
/// `append_result` stores the result and bumps the run counters in one step;
/// readers may poll at any time without locking. `snapshot` returns the run
/// row and its results from a single read, so the counters always match the
/// result list.
#[async_trait]
pub trait EvalStore: Send + Sync {
    async fn put_dataset(&self, dataset: Dataset) -> Result<(), StoreError>;

    async fn load_dataset(&self, dataset_id: &str) -> Result<Option<Dataset>, StoreError>;

    async fn list_datasets(&self) -> Result<Vec<Dataset>, StoreError>;

    async fn create_run(&self, draft: RunDraft) -> Result<Run, StoreError>;

    /// Moves a pending run to `running` with the number of cases it will execute.
    async fn start_run(&self, run_id: Uuid, case_count: usize) -> Result<Run, StoreError>;

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<Run, StoreError>;

    async fn append_result(&self, run_id: Uuid, draft: ResultDraft) -> Result<CaseResult, StoreError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError>;

    /// Newest first, optionally restricted to one dataset.
    async fn list_runs(&self, dataset_id: Option<&str>) -> Result<Vec<Run>, StoreError>;

    async fn list_results(&self, run_id: Uuid) -> Result<Vec<CaseResult>, StoreError>;

    async fn snapshot(&self, run_id: Uuid) -> Result<Option<(Run, Vec<CaseResult>)>, StoreError>;

    async fn delete_run(&self, run_id: Uuid) -> Result<bool, StoreError>;

    /// Replaces any baseline already saved for the dataset.
    async fn save_baseline(&self, baseline: Baseline) -> Result<(), StoreError>;

    async fn get_baseline(&self, dataset_id: &str) -> Result<Option<Baseline>, StoreError>;

    async fn list_baselines(&self) -> Result<Vec<Baseline>, StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunRecord {
    run: Run,
    #[serde(default)]
    results: Vec<CaseResult>,
}

impl RunRecord {
    fn new(run: Run) -> Self {
        Self {
            run,
            results: Vec::new(),
        }
    }

    fn start(&mut self, case_count: usize) -> Result<Run, StoreError> {
        self.run.transition(RunStatus::Running, None)?;
        self.run.case_count = case_count;
        Ok(self.run.clone())
    }

    fn finish(&mut self, status: RunStatus, error: Option<String>) -> Result<Run, StoreError> {
        self.run.transition(status, error)?;
        Ok(self.run.clone())
    }

    fn append(&mut self, draft: ResultDraft) -> Result<CaseResult, StoreError> {
        self.run.record(draft.passed)?;
        let result = draft.into_result(Uuid::new_v4(), self.run.id);
        self.results.push(result.clone());
        Ok(result)
    }
}

fn check_unique_case_ids(dataset: &Dataset) -> Result<(), StoreError> {
    match dataset.duplicate_case_ids().as_slice() {
        [] => Ok(()),
        duplicates => Err(StoreError::InvalidDataset {
            dataset_id: dataset.id.clone(),
            message: format!("duplicate case ids: {}", duplicates.join(", ")),
        }),
    }
}

fn newest_first(runs: &mut [Run]) {
    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
}

#[derive(Debug, Default)]
struct MemoryState {
    datasets: HashMap<String, Dataset>,
    runs: HashMap<Uuid, RunRecord>,
    baselines: HashMap<String, Baseline>,
}

/// Process-local store, used by tests and short-lived CLI runs.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_record<T>(
        &self,
        run_id: Uuid,
        f: impl FnOnce(&mut RunRecord) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.state.write().await;
        let record = state
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        f(record)
    }
}

#[async_trait]
impl EvalStore for InMemoryStore {
    async fn put_dataset(&self, dataset: Dataset) -> Result<(), StoreError> {
        check_unique_case_ids(&dataset)?;
        self.state
            .write()
            .await
            .datasets
            .insert(dataset.id.clone(), dataset);
        Ok(())
    }

    async fn load_dataset(&self, dataset_id: &str) -> Result<Option<Dataset>, StoreError> {
        Ok(self.state.read().await.datasets.get(dataset_id).cloned())
    }

    async fn list_datasets(&self) -> Result<Vec<Dataset>, StoreError> {
        let mut datasets: Vec<Dataset> = self.state.read().await.datasets.values().cloned().collect();
        datasets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(datasets)
    }

    async fn create_run(&self, draft: RunDraft) -> Result<Run, StoreError> {
        let run = Run::new(Uuid::new_v4(), draft);
        self.state
            .write()
            .await
            .runs
            .insert(run.id, RunRecord::new(run.clone()));
        Ok(run)
    }

    async fn start_run(&self, run_id: Uuid, case_count: usize) -> Result<Run, StoreError> {
        self.with_record(run_id, |record| record.start(case_count)).await
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<Run, StoreError> {
        self.with_record(run_id, |record| record.finish(status, error)).await
    }

    async fn append_result(&self, run_id: Uuid, draft: ResultDraft) -> Result<CaseResult, StoreError> {
        self.with_record(run_id, |record| record.append(draft)).await
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .runs
            .get(&run_id)
            .map(|record| record.run.clone()))
    }

    async fn list_runs(&self, dataset_id: Option<&str>) -> Result<Vec<Run>, StoreError> {
        let state = self.state.read().await;
        let mut runs: Vec<Run> = state
            .runs
            .values()
            .filter(|record| dataset_id.is_none() || record.run.dataset_id.as_deref() == dataset_id)
            .map(|record| record.run.clone())
            .collect();
        newest_first(&mut runs);
        Ok(runs)
    }

    async fn list_results(&self, run_id: Uuid) -> Result<Vec<CaseResult>, StoreError> {
        let state = self.state.read().await;
        let record = state.runs.get(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        Ok(record.results.clone())
    }

    async fn snapshot(&self, run_id: Uuid) -> Result<Option<(Run, Vec<CaseResult>)>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .runs
            .get(&run_id)
            .map(|record| (record.run.clone(), record.results.clone())))
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.state.write().await.runs.remove(&run_id).is_some())
    }

    async fn save_baseline(&self, baseline: Baseline) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .baselines
            .insert(baseline.dataset_id.clone(), baseline);
        Ok(())
    }

    async fn get_baseline(&self, dataset_id: &str) -> Result<Option<Baseline>, StoreError> {
        Ok(self.state.read().await.baselines.get(dataset_id).cloned())
    }

    async fn list_baselines(&self) -> Result<Vec<Baseline>, StoreError> {
        let mut baselines: Vec<Baseline> = self.state.read().await.baselines.values().cloned().collect();
        baselines.sort_by(|a, b| a.dataset_id.cmp(&b.dataset_id));
        Ok(baselines)
    }
}

/// One JSON file per dataset, run and baseline under a root directory:
///
/// ```text
/// <root>/datasets/<dataset_id>.json
/// <root>/runs/<run_id>.json        run plus its results
/// <root>/baselines/<dataset_id>.json
/// ```
///
/// Files are replaced by rename, so concurrent readers see either the old or
/// the new content.
#[derive(Debug)]
pub struct JsonDirStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonDirStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in ["datasets", "runs", "baselines"] {
            tokio::fs::create_dir_all(root.join(dir)).await?;
        }
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn keyed_path(&self, dir: &str, key: &str) -> Option<PathBuf> {
        let safe = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !key.starts_with('.');
        safe.then(|| self.root.join(dir).join(format!("{key}.json")))
    }

    fn run_path(&self, run_id: Uuid) -> PathBuf {
        self.root.join("runs").join(format!("{run_id}.json"))
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension(format!("json.tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_dir_json<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StoreError> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut values = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(value) = Self::read_json(&path).await? {
                values.push(value);
            }
        }
        Ok(values)
    }

    async fn update_record<T>(
        &self,
        run_id: Uuid,
        f: impl FnOnce(&mut RunRecord) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.run_path(run_id);
        let mut record: RunRecord = Self::read_json(&path)
            .await?
            .ok_or(StoreError::RunNotFound(run_id))?;
        let value = f(&mut record)?;
        Self::write_json(&path, &record).await?;
        Ok(value)
    }
}

#[async_trait]
impl EvalStore for JsonDirStore {
    async fn put_dataset(&self, dataset: Dataset) -> Result<(), StoreError> {
        check_unique_case_ids(&dataset)?;
        let path = self.keyed_path("datasets", &dataset.id).ok_or_else(|| {
            StoreError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("dataset id '{}' is not usable as a file name", dataset.id),
            ))
        })?;
        let _guard = self.write_lock.lock().await;
        Self::write_json(&path, &dataset).await
    }

    async fn load_dataset(&self, dataset_id: &str) -> Result<Option<Dataset>, StoreError> {
        match self.keyed_path("datasets", dataset_id) {
            Some(path) => Self::read_json(&path).await,
            None => Ok(None),
        }
    }

    async fn list_datasets(&self) -> Result<Vec<Dataset>, StoreError> {
        let mut datasets: Vec<Dataset> = Self::read_dir_json(&self.root.join("datasets")).await?;
        datasets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(datasets)
    }

    async fn create_run(&self, draft: RunDraft) -> Result<Run, StoreError> {
        let run = Run::new(Uuid::new_v4(), draft);
        let _guard = self.write_lock.lock().await;
        Self::write_json(&self.run_path(run.id), &RunRecord::new(run.clone())).await?;
        Ok(run)
    }

    async fn start_run(&self, run_id: Uuid, case_count: usize) -> Result<Run, StoreError> {
        self.update_record(run_id, |record| record.start(case_count)).await
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<Run, StoreError> {
        self.update_record(run_id, |record| record.finish(status, error)).await
    }

    async fn append_result(&self, run_id: Uuid, draft: ResultDraft) -> Result<CaseResult, StoreError> {
        self.update_record(run_id, |record| record.append(draft)).await
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        let record: Option<RunRecord> = Self::read_json(&self.run_path(run_id)).await?;
        Ok(record.map(|record| record.run))
    }

    async fn list_runs(&self, dataset_id: Option<&str>) -> Result<Vec<Run>, StoreError> {
        let records: Vec<RunRecord> = Self::read_dir_json(&self.root.join("runs")).await?;
        let mut runs: Vec<Run> = records
            .into_iter()
            .map(|record| record.run)
            .filter(|run| dataset_id.is_none() || run.dataset_id.as_deref() == dataset_id)
            .collect();
        newest_first(&mut runs);
        Ok(runs)
    }

    async fn list_results(&self, run_id: Uuid) -> Result<Vec<CaseResult>, StoreError> {
        let record: RunRecord = Self::read_json(&self.run_path(run_id))
            .await?
            .ok_or(StoreError::RunNotFound(run_id))?;
        Ok(record.results)
    }

    async fn snapshot(&self, run_id: Uuid) -> Result<Option<(Run, Vec<CaseResult>)>, StoreError> {
        let record: Option<RunRecord> = Self::read_json(&self.run_path(run_id)).await?;
        Ok(record.map(|record| (record.run, record.results)))
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.run_path(run_id)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_baseline(&self, baseline: Baseline) -> Result<(), StoreError> {
        let path = self.keyed_path("baselines", &baseline.dataset_id).ok_or_else(|| {
            StoreError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("dataset id '{}' is not usable as a file name", baseline.dataset_id),
            ))
        })?;
        let _guard = self.write_lock.lock().await;
        Self::write_json(&path, &baseline).await
    }

    async fn get_baseline(&self, dataset_id: &str) -> Result<Option<Baseline>, StoreError> {
        match self.keyed_path("baselines", dataset_id) {
            Some(path) => Self::read_json(&path).await,
            None => Ok(None),
        }
    }

    async fn list_baselines(&self) -> Result<Vec<Baseline>, StoreError> {
        let mut baselines: Vec<Baseline> = Self::read_dir_json(&self.root.join("baselines")).await?;
        baselines.sort_by(|a, b| a.dataset_id.cmp(&b.dataset_id));
        Ok(baselines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::model::{Case, Turn};

    fn passed(passed: bool) -> ResultDraft {
        ResultDraft {
            case_id: Some("c".into()),
            passed,
            ..ResultDraft::default()
        }
    }

    async fn exercise_store(store: &dyn EvalStore) {
        let dataset = Dataset::new("support", "Support")
            .with_cases([Case::new("c1", vec![Turn::user("hi")], "greets")]);
        store.put_dataset(dataset.clone()).await.unwrap();
        assert_eq!(store.load_dataset("support").await.unwrap(), Some(dataset));
        assert_eq!(store.load_dataset("missing").await.unwrap(), None);

        let run = store
            .create_run(RunDraft::for_dataset("support", "agent"))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Pending);

        // results are rejected until the run is running
        assert!(matches!(
            store.append_result(run.id, passed(true)).await,
            Err(StoreError::RunClosed(_))
        ));

        let started = store.start_run(run.id, 2).await.unwrap();
        assert_eq!(started.status, RunStatus::Running);
        assert_eq!(started.case_count, 2);

        store.append_result(run.id, passed(true)).await.unwrap();
        store.append_result(run.id, passed(false)).await.unwrap();

        let polled = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!((polled.total, polled.passed, polled.failed), (2, 1, 1));

        let finished = store
            .finish_run(run.id, RunStatus::Completed, None)
            .await
            .unwrap();
        assert_eq!(finished.score, Some(50.0));
        assert_eq!(store.list_results(run.id).await.unwrap().len(), 2);

        let other = store.create_run(RunDraft::ad_hoc("single")).await.unwrap();
        assert_eq!(store.list_runs(Some("support")).await.unwrap().len(), 1);
        let all = store.list_runs(None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|r| r.id == other.id && r.dataset_id.is_none()));

        assert!(store.delete_run(other.id).await.unwrap());
        assert!(!store.delete_run(other.id).await.unwrap());
        assert!(store.get_run(other.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        exercise_store(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn json_dir_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::open(dir.path()).await.unwrap();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn json_dir_store_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::open(dir.path()).await.unwrap();
        assert_eq!(store.load_dataset("../etc/passwd").await.unwrap(), None);
        assert!(store.put_dataset(Dataset::new("a/b", "bad")).await.is_err());
    }

    #[tokio::test]
    async fn datasets_with_repeated_case_ids_are_rejected() {
        let dataset = Dataset::new("dup", "dup").with_cases([
            Case::new("c1", vec![Turn::user("a")], "ok"),
            Case::new("c1", vec![Turn::user("b")], "ok"),
        ]);

        let memory = InMemoryStore::new();
        assert!(matches!(
            memory.put_dataset(dataset.clone()).await,
            Err(StoreError::InvalidDataset { .. })
        ));
        assert_eq!(memory.load_dataset("dup").await.unwrap(), None);

        let dir = tempfile::tempdir().unwrap();
        let files = JsonDirStore::open(dir.path()).await.unwrap();
        assert!(matches!(
            files.put_dataset(dataset).await,
            Err(StoreError::InvalidDataset { .. })
        ));
    }

    #[tokio::test]
    async fn snapshot_counters_match_results() {
        let store = InMemoryStore::new();
        let run = store.create_run(RunDraft::for_dataset("ds", "agent")).await.unwrap();
        assert_eq!(store.snapshot(Uuid::new_v4()).await.unwrap(), None);

        store.start_run(run.id, 3).await.unwrap();
        store.append_result(run.id, passed(true)).await.unwrap();
        store.append_result(run.id, passed(false)).await.unwrap();

        let (polled, results) = store.snapshot(run.id).await.unwrap().unwrap();
        assert_eq!(polled.total, results.len());
        assert_eq!((polled.passed, polled.failed), (1, 1));
    }
}
