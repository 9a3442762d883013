use chrono::Utc;
use std::sync::Mutex;
use uuid::Uuid;

use super::job_store::JobStore;
use crate::schema::{
    EvaluationMetrics, JobPatch, JobStatus, ModelVersion, NewJob, NewModelVersion, TrainingJob,
    TrainingResult,
};

#[derive(Default)]
struct MemoryState {
    jobs: Vec<TrainingJob>,
    versions: Vec<ModelVersion>,
    results: Vec<TrainingResult>,
}

impl MemoryState {
    fn job_mut(&mut self, id: Uuid) -> Option<&mut TrainingJob> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    fn apply_patch(&mut self, id: Uuid, patch: JobPatch) -> bool {
        let Some(job) = self.job_mut(id) else {
            return false;
        };
        let now = Utc::now();
        if patch.stamps_start() {
            job.started_at.get_or_insert(now);
        }
        if patch.stamps_completion() {
            job.completed_at = Some(now);
        }
        job.status = patch.status;
        if let Some(progress) = patch.progress {
            job.progress = progress;
        }
        if let Some(epoch) = patch.current_epoch {
            job.current_epoch = epoch;
        }
        if let Some(total) = patch.total_epochs {
            job.total_epochs = total;
        }
        if let Some(total) = patch.total_samples {
            job.total_samples = total;
        }
        if let Some(info) = patch.dataset_info {
            job.dataset_info = info;
        }
        if let Some(error) = patch.error {
            job.error_message = error;
        }
        true
    }

    fn insert_version(&mut self, version: NewModelVersion) -> anyhow::Result<ModelVersion> {
        if self
            .versions
            .iter()
            .any(|v| v.version_name == version.version_name)
        {
            anyhow::bail!("model version `{}` already exists", version.version_name);
        }
        for sibling in self
            .versions
            .iter_mut()
            .filter(|v| v.model_type == version.model_type)
        {
            sibling.is_active = false;
        }
        let created = ModelVersion {
            id: Uuid::new_v4(),
            model_type: version.model_type,
            version_name: version.version_name,
            file_path: version.file_path,
            training_job_id: version.training_job_id,
            is_active: true,
            created_at: Utc::now(),
        };
        self.versions.push(created.clone());
        Ok(created)
    }

    fn insert_result(
        &mut self,
        job_id: Uuid,
        metrics: &EvaluationMetrics,
    ) -> anyhow::Result<TrainingResult> {
        if self.results.iter().any(|r| r.training_job_id == job_id) {
            anyhow::bail!("training result for job {job_id} already exists");
        }
        let result = TrainingResult::from_metrics(job_id, metrics);
        self.results.push(result.clone());
        Ok(result)
    }
}

/// Process-local store used when no database is configured, and by tests.
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait::async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, job: NewJob) -> anyhow::Result<Uuid> {
        let id = Uuid::new_v4();
        self.lock().jobs.push(TrainingJob {
            id,
            task_type: job.task_type,
            status: JobStatus::Pending,
            triggered_by: job.triggered_by,
            priority: 0,
            total_samples: 0,
            progress: 0.0,
            current_epoch: 0,
            total_epochs: 0,
            error_message: None,
            config: job.config,
            dataset_info: job.dataset_info,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        });
        Ok(id)
    }

    async fn update_job_status(&self, id: Uuid, patch: JobPatch) -> anyhow::Result<bool> {
        let mut state = self.lock();
        if patch.status == JobStatus::Running
            && state
                .jobs
                .iter()
                .any(|j| j.id != id && j.status == JobStatus::Running)
        {
            anyhow::bail!("another training job is already running");
        }
        Ok(state.apply_patch(id, patch))
    }

    async fn get_job(&self, id: Uuid) -> anyhow::Result<Option<TrainingJob>> {
        Ok(self.lock().jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: i64,
    ) -> anyhow::Result<Vec<TrainingJob>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .lock()
            .jobs
            .iter()
            .rev()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_latest_job(&self, task_type: Option<&str>) -> anyhow::Result<Option<TrainingJob>> {
        Ok(self
            .lock()
            .jobs
            .iter()
            .rev()
            .find(|j| task_type.is_none_or(|t| j.task_type == t))
            .cloned())
    }

    async fn get_running_job(&self) -> anyhow::Result<Option<TrainingJob>> {
        Ok(self
            .lock()
            .jobs
            .iter()
            .find(|j| j.status == JobStatus::Running)
            .cloned())
    }

    async fn get_active_job(&self) -> anyhow::Result<Option<TrainingJob>> {
        let state = self.lock();
        let running = state.jobs.iter().find(|j| j.status == JobStatus::Running);
        Ok(running
            .or_else(|| state.jobs.iter().find(|j| j.status == JobStatus::Pending))
            .cloned())
    }

    async fn delete_job(&self, id: Uuid) -> anyhow::Result<bool> {
        let mut state = self.lock();
        state.results.retain(|r| r.training_job_id != id);
        state.versions.retain(|v| v.training_job_id != id);
        let before = state.jobs.len();
        state.jobs.retain(|j| j.id != id);
        Ok(state.jobs.len() < before)
    }

    async fn fail_orphaned_jobs(&self, error: &str) -> anyhow::Result<Vec<Uuid>> {
        let mut state = self.lock();
        let orphaned: Vec<Uuid> = state
            .jobs
            .iter()
            .filter(|j| matches!(j.status, JobStatus::Pending | JobStatus::Running))
            .map(|j| j.id)
            .collect();
        for id in &orphaned {
            state.apply_patch(*id, JobPatch::status(JobStatus::Failed).with_error(error));
        }
        Ok(orphaned)
    }

    async fn create_model_version(&self, version: NewModelVersion) -> anyhow::Result<ModelVersion> {
        self.lock().insert_version(version)
    }

    async fn get_model_versions(
        &self,
        model_type: Option<&str>,
        active_only: bool,
    ) -> anyhow::Result<Vec<ModelVersion>> {
        Ok(self
            .lock()
            .versions
            .iter()
            .rev()
            .filter(|v| model_type.is_none_or(|t| v.model_type == t))
            .filter(|v| !active_only || v.is_active)
            .cloned()
            .collect())
    }

    async fn get_active_model(&self, model_type: &str) -> anyhow::Result<Option<ModelVersion>> {
        Ok(self
            .lock()
            .versions
            .iter()
            .find(|v| v.model_type == model_type && v.is_active)
            .cloned())
    }

    async fn set_active_model(&self, version_id: Uuid) -> anyhow::Result<bool> {
        let mut state = self.lock();
        let Some(model_type) = state
            .versions
            .iter()
            .find(|v| v.id == version_id)
            .map(|v| v.model_type.clone())
        else {
            return Ok(false);
        };
        for version in state
            .versions
            .iter_mut()
            .filter(|v| v.model_type == model_type)
        {
            version.is_active = version.id == version_id;
        }
        Ok(true)
    }

    async fn create_training_result(
        &self,
        job_id: Uuid,
        metrics: &EvaluationMetrics,
    ) -> anyhow::Result<TrainingResult> {
        self.lock().insert_result(job_id, metrics)
    }

    async fn get_training_result(&self, job_id: Uuid) -> anyhow::Result<Option<TrainingResult>> {
        Ok(self
            .lock()
            .results
            .iter()
            .find(|r| r.training_job_id == job_id)
            .cloned())
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        version: NewModelVersion,
        metrics: &EvaluationMetrics,
    ) -> anyhow::Result<ModelVersion> {
        let mut state = self.lock();
        if !state.jobs.iter().any(|j| j.id == job_id) {
            anyhow::bail!("training job {job_id} not found");
        }
        if state
            .versions
            .iter()
            .any(|v| v.version_name == version.version_name)
            || state.results.iter().any(|r| r.training_job_id == job_id)
        {
            anyhow::bail!("completion records for job {job_id} conflict with existing rows");
        }
        let created = state.insert_version(version)?;
        state.insert_result(job_id, metrics)?;
        state.apply_patch(
            job_id,
            JobPatch::status(JobStatus::Completed)
                .with_progress(100.0)
                .clear_error(),
        );
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TriggerSource;

    fn new_job(task_type: &str) -> NewJob {
        NewJob {
            task_type: task_type.into(),
            triggered_by: TriggerSource::Manual,
            config: serde_json::json!({}),
            dataset_info: serde_json::json!({ "label_count": 10 }),
        }
    }

    fn version(job_id: Uuid, name: &str) -> NewModelVersion {
        NewModelVersion {
            model_type: "aircraft".into(),
            version_name: name.into(),
            file_path: format!("storage/models/aircraft_{name}.pt"),
            training_job_id: job_id,
        }
    }

    #[tokio::test]
    async fn patches_stamp_timestamps_and_error() {
        let store = MemoryJobStore::new();
        let id = store.create_job(new_job("aircraft")).await.unwrap();

        store
            .update_job_status(id, JobPatch::status(JobStatus::Running))
            .await
            .unwrap();
        let job = store.get_job(id).await.unwrap().unwrap();
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_none());

        store
            .update_job_status(id, JobPatch::status(JobStatus::Failed).with_error("boom"))
            .await
            .unwrap();
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.error_message.as_deref(), Some("boom"));
        assert!(job.completed_at.is_some());

        assert!(
            !store
                .update_job_status(Uuid::new_v4(), JobPatch::status(JobStatus::Failed))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn refuses_second_running_job() {
        let store = MemoryJobStore::new();
        let a = store.create_job(new_job("aircraft")).await.unwrap();
        let b = store.create_job(new_job("airline")).await.unwrap();
        store
            .update_job_status(a, JobPatch::status(JobStatus::Running))
            .await
            .unwrap();
        assert!(
            store
                .update_job_status(b, JobPatch::status(JobStatus::Running))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn latest_and_active_lookups() {
        let store = MemoryJobStore::new();
        let first = store.create_job(new_job("aircraft")).await.unwrap();
        let second = store.create_job(new_job("airline")).await.unwrap();

        assert_eq!(store.get_latest_job(None).await.unwrap().unwrap().id, second);
        assert_eq!(
            store
                .get_latest_job(Some("aircraft"))
                .await
                .unwrap()
                .unwrap()
                .id,
            first
        );
        assert!(store.get_running_job().await.unwrap().is_none());
        assert_eq!(store.get_active_job().await.unwrap().unwrap().id, first);

        store
            .update_job_status(second, JobPatch::status(JobStatus::Running))
            .await
            .unwrap();
        assert_eq!(store.get_active_job().await.unwrap().unwrap().id, second);
    }

    #[tokio::test]
    async fn activating_a_version_deactivates_siblings() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job("aircraft")).await.unwrap();
        let v1 = store
            .create_model_version(version(job, "v20260101_020000"))
            .await
            .unwrap();
        let v2 = store
            .create_model_version(version(job, "v20260102_020000"))
            .await
            .unwrap();

        let active = store.get_model_versions(Some("aircraft"), true).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, v2.id);

        assert!(store.set_active_model(v1.id).await.unwrap());
        let active = store.get_active_model("aircraft").await.unwrap().unwrap();
        assert_eq!(active.id, v1.id);
        assert_eq!(
            store
                .get_model_versions(Some("aircraft"), true)
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(!store.set_active_model(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn complete_job_writes_everything_or_nothing() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job("aircraft")).await.unwrap();
        let metrics = EvaluationMetrics::zeroed(10, 2);

        store
            .complete_job(job, version(job, "v1"), &metrics)
            .await
            .unwrap();
        let stored = store.get_job(job).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.progress, 100.0);
        assert_eq!(
            store
                .get_training_result(job)
                .await
                .unwrap()
                .unwrap()
                .total_samples,
            10
        );

        // second completion conflicts and must not touch versions
        assert!(
            store
                .complete_job(job, version(job, "v2"), &metrics)
                .await
                .is_err()
        );
        assert_eq!(store.get_model_versions(None, false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_cascades_to_results_and_versions() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job("aircraft")).await.unwrap();
        store
            .complete_job(job, version(job, "v1"), &EvaluationMetrics::default())
            .await
            .unwrap();
        assert!(store.delete_job(job).await.unwrap());
        assert!(store.get_training_result(job).await.unwrap().is_none());
        assert!(store.get_model_versions(None, false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn training_result_is_written_once_per_job() {
        let store = MemoryJobStore::new();
        let id = store.create_job(new_job("aircraft")).await.unwrap();
        let metrics = EvaluationMetrics {
            accuracy: 0.9,
            ..EvaluationMetrics::zeroed(12, 3)
        };

        let result = store.create_training_result(id, &metrics).await.unwrap();
        assert_eq!(result.training_job_id, id);
        assert_eq!(result.num_classes, 3);
        let stored = store.get_training_result(id).await.unwrap().unwrap();
        assert_eq!(stored.id, result.id);
        assert_eq!(stored.accuracy, 0.9);

        assert!(store.create_training_result(id, &metrics).await.is_err());
    }

    #[tokio::test]
    async fn orphaned_jobs_are_failed() {
        let store = MemoryJobStore::new();
        let pending = store.create_job(new_job("aircraft")).await.unwrap();
        let running = store.create_job(new_job("airline")).await.unwrap();
        let done = store.create_job(new_job("aircraft")).await.unwrap();
        store
            .update_job_status(running, JobPatch::status(JobStatus::Running))
            .await
            .unwrap();
        store
            .update_job_status(done, JobPatch::status(JobStatus::Completed))
            .await
            .unwrap();

        let mut failed = store.fail_orphaned_jobs("lost").await.unwrap();
        failed.sort();
        let mut expected = vec![pending, running];
        expected.sort();
        assert_eq!(failed, expected);

        for id in [pending, running] {
            let job = store.get_job(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Failed);
            assert_eq!(job.error_message.as_deref(), Some("lost"));
            assert!(job.completed_at.is_some());
        }
        let job = store.get_job(done).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(store.get_active_job().await.unwrap().is_none());
        assert!(store.fail_orphaned_jobs("lost").await.unwrap().is_empty());
    }
}
