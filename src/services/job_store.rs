use uuid::Uuid;

use crate::schema::{
    EvaluationMetrics, JobPatch, JobStatus, ModelVersion, NewJob, NewModelVersion, TrainingJob,
    TrainingResult,
};

/// Durable record of training jobs, model versions and evaluation results.
///
/// Each call is atomic from the caller's point of view.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: NewJob) -> anyhow::Result<Uuid>;
    /// Returns false when no job has this id.
    async fn update_job_status(&self, id: Uuid, patch: JobPatch) -> anyhow::Result<bool>;
    async fn get_job(&self, id: Uuid) -> anyhow::Result<Option<TrainingJob>>;
    /// Newest jobs first.
    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: i64,
    ) -> anyhow::Result<Vec<TrainingJob>>;
    async fn get_latest_job(&self, task_type: Option<&str>) -> anyhow::Result<Option<TrainingJob>>;
    async fn get_running_job(&self) -> anyhow::Result<Option<TrainingJob>>;
    /// A job that is running or admitted but not yet picked up.
    async fn get_active_job(&self) -> anyhow::Result<Option<TrainingJob>>;
    async fn delete_job(&self, id: Uuid) -> anyhow::Result<bool>;
    /// Marks every `pending` or `running` job `failed` with `error`. Used at start-up,
    /// when no worker can still own them. Returns the ids it touched.
    async fn fail_orphaned_jobs(&self, error: &str) -> anyhow::Result<Vec<Uuid>>;

    /// Inserts an active version and deactivates every sibling of the same model type.
    async fn create_model_version(&self, version: NewModelVersion) -> anyhow::Result<ModelVersion>;
    async fn get_model_versions(
        &self,
        model_type: Option<&str>,
        active_only: bool,
    ) -> anyhow::Result<Vec<ModelVersion>>;
    async fn get_active_model(&self, model_type: &str) -> anyhow::Result<Option<ModelVersion>>;
    async fn set_active_model(&self, version_id: Uuid) -> anyhow::Result<bool>;

    async fn create_training_result(
        &self,
        job_id: Uuid,
        metrics: &EvaluationMetrics,
    ) -> anyhow::Result<TrainingResult>;
    async fn get_training_result(&self, job_id: Uuid) -> anyhow::Result<Option<TrainingResult>>;

    /// Success write: active model version, training result and `completed` status in
    /// one transaction.
    async fn complete_job(
        &self,
        job_id: Uuid,
        version: NewModelVersion,
        metrics: &EvaluationMetrics,
    ) -> anyhow::Result<ModelVersion>;
}
