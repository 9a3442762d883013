use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::job_store::JobStore;
use super::label_corpus::LabelCorpus;
use crate::schema::{
    ClassLabels, EvaluationMetrics, JobPatch, JobStatus, ModelVersion, NewJob, NewModelVersion,
    TrainingJob, TrainingResult,
};

const JOB_COLUMNS: &str = r#"
    id, task_type, status, triggered_by, priority, total_samples, progress,
    current_epoch, total_epochs, error_message, config, dataset_info,
    created_at, started_at, completed_at
"#;

const VERSION_COLUMNS: &str =
    "id, model_type, version_name, file_path, training_job_id, is_active, created_at";

const RESULT_COLUMNS: &str = r#"
    id, training_job_id, accuracy, macro_recall, ece, total_samples, num_classes,
    per_class_accuracy, recall_per_class, confusion_matrix, confidence_mean,
    confidence_std, metrics, created_at
"#;

/// Postgres-backed store; the `labels` table doubles as the label corpus.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!("store: connected and migrated");
        Ok(Self::new(pool))
    }

    async fn fetch_job(&self, where_clause: &str) -> anyhow::Result<Option<TrainingJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM training_jobs {where_clause}");
        Ok(sqlx::query_as::<_, TrainingJob>(&sql)
            .fetch_optional(&self.pool)
            .await?)
    }
}

async fn insert_version(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    version: NewModelVersion,
) -> anyhow::Result<ModelVersion> {
    sqlx::query("UPDATE model_versions SET is_active = false WHERE model_type = $1")
        .bind(&version.model_type)
        .execute(&mut **tx)
        .await?;

    let sql = format!(
        r#"
        INSERT INTO model_versions (id, model_type, version_name, file_path, training_job_id, is_active)
        VALUES ($1, $2, $3, $4, $5, true)
        RETURNING {VERSION_COLUMNS}
        "#
    );
    Ok(sqlx::query_as::<_, ModelVersion>(&sql)
        .bind(Uuid::new_v4())
        .bind(&version.model_type)
        .bind(&version.version_name)
        .bind(&version.file_path)
        .bind(version.training_job_id)
        .fetch_one(&mut **tx)
        .await?)
}

async fn insert_result(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    job_id: Uuid,
    metrics: &EvaluationMetrics,
) -> anyhow::Result<TrainingResult> {
    let row = TrainingResult::from_metrics(job_id, metrics);
    let sql = format!(
        r#"
        INSERT INTO training_results (
            id, training_job_id, accuracy, macro_recall, ece, total_samples, num_classes,
            per_class_accuracy, recall_per_class, confusion_matrix, confidence_mean,
            confidence_std, metrics
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        RETURNING {RESULT_COLUMNS}
        "#
    );
    Ok(sqlx::query_as::<_, TrainingResult>(&sql)
        .bind(row.id)
        .bind(row.training_job_id)
        .bind(row.accuracy)
        .bind(row.macro_recall)
        .bind(row.ece)
        .bind(row.total_samples)
        .bind(row.num_classes)
        .bind(row.per_class_accuracy)
        .bind(row.recall_per_class)
        .bind(row.confusion_matrix)
        .bind(row.confidence_mean)
        .bind(row.confidence_std)
        .bind(row.metrics)
        .fetch_one(&mut **tx)
        .await?)
}

fn patch_query(id: Uuid, patch: JobPatch) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::<Postgres>::new("UPDATE training_jobs SET status = ");
    qb.push_bind(patch.status.as_str());
    if let Some(progress) = patch.progress {
        qb.push(", progress = ").push_bind(progress);
    }
    if let Some(epoch) = patch.current_epoch {
        qb.push(", current_epoch = ").push_bind(epoch);
    }
    if let Some(total) = patch.total_epochs {
        qb.push(", total_epochs = ").push_bind(total);
    }
    if let Some(total) = patch.total_samples {
        qb.push(", total_samples = ").push_bind(total);
    }
    if let Some(info) = patch.dataset_info {
        qb.push(", dataset_info = ").push_bind(info);
    }
    if let Some(error) = patch.error {
        qb.push(", error_message = ").push_bind(error);
    }
    if patch.status == JobStatus::Running {
        qb.push(", started_at = COALESCE(started_at, now())");
    }
    if patch.status.is_terminal() {
        qb.push(", completed_at = now()");
    }
    qb.push(" WHERE id = ").push_bind(id);
    qb
}

#[async_trait::async_trait]
impl JobStore for PgJobStore {
    async fn create_job(&self, job: NewJob) -> anyhow::Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO training_jobs (id, status, task_type, triggered_by, config, dataset_info)
            VALUES ($1, 'pending', $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(&job.task_type)
        .bind(job.triggered_by.as_str())
        .bind(&job.config)
        .bind(&job.dataset_info)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn update_job_status(&self, id: Uuid, patch: JobPatch) -> anyhow::Result<bool> {
        let result = patch_query(id, patch).build().execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_job(&self, id: Uuid) -> anyhow::Result<Option<TrainingJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM training_jobs WHERE id = $1");
        Ok(sqlx::query_as::<_, TrainingJob>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: i64,
    ) -> anyhow::Result<Vec<TrainingJob>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM training_jobs
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#
        );
        Ok(sqlx::query_as::<_, TrainingJob>(&sql)
            .bind(status.map(|s| s.as_str()))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn get_latest_job(&self, task_type: Option<&str>) -> anyhow::Result<Option<TrainingJob>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM training_jobs
            WHERE ($1::text IS NULL OR task_type = $1)
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#
        );
        Ok(sqlx::query_as::<_, TrainingJob>(&sql)
            .bind(task_type)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn get_running_job(&self) -> anyhow::Result<Option<TrainingJob>> {
        self.fetch_job("WHERE status = 'running' LIMIT 1").await
    }

    async fn get_active_job(&self) -> anyhow::Result<Option<TrainingJob>> {
        self.fetch_job(
            r#"
            WHERE status IN ('running', 'pending')
            ORDER BY (status = 'running') DESC, created_at
            LIMIT 1
            "#,
        )
        .await
    }

    async fn delete_job(&self, id: Uuid) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM training_results WHERE training_job_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM model_versions WHERE training_job_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM training_jobs WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn fail_orphaned_jobs(&self, error: &str) -> anyhow::Result<Vec<Uuid>> {
        Ok(sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE training_jobs
            SET status = 'failed', error_message = $1, completed_at = now()
            WHERE status IN ('pending', 'running')
            RETURNING id
            "#,
        )
        .bind(error)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn create_model_version(&self, version: NewModelVersion) -> anyhow::Result<ModelVersion> {
        let mut tx = self.pool.begin().await?;
        let created = insert_version(&mut tx, version).await?;
        tx.commit().await?;
        Ok(created)
    }

    async fn get_model_versions(
        &self,
        model_type: Option<&str>,
        active_only: bool,
    ) -> anyhow::Result<Vec<ModelVersion>> {
        let sql = format!(
            r#"
            SELECT {VERSION_COLUMNS} FROM model_versions
            WHERE ($1::text IS NULL OR model_type = $1)
              AND (NOT $2 OR is_active)
            ORDER BY model_type, created_at DESC
            "#
        );
        Ok(sqlx::query_as::<_, ModelVersion>(&sql)
            .bind(model_type)
            .bind(active_only)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn get_active_model(&self, model_type: &str) -> anyhow::Result<Option<ModelVersion>> {
        Ok(self
            .get_model_versions(Some(model_type), true)
            .await?
            .into_iter()
            .next())
    }

    async fn set_active_model(&self, version_id: Uuid) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;
        let model_type: Option<String> =
            sqlx::query_scalar("SELECT model_type FROM model_versions WHERE id = $1")
                .bind(version_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(model_type) = model_type else {
            return Ok(false);
        };
        sqlx::query("UPDATE model_versions SET is_active = false WHERE model_type = $1")
            .bind(&model_type)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("UPDATE model_versions SET is_active = true WHERE id = $1")
            .bind(version_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_training_result(
        &self,
        job_id: Uuid,
        metrics: &EvaluationMetrics,
    ) -> anyhow::Result<TrainingResult> {
        let mut tx = self.pool.begin().await?;
        let result = insert_result(&mut tx, job_id, metrics).await?;
        tx.commit().await?;
        Ok(result)
    }

    async fn get_training_result(&self, job_id: Uuid) -> anyhow::Result<Option<TrainingResult>> {
        let sql =
            format!("SELECT {RESULT_COLUMNS} FROM training_results WHERE training_job_id = $1");
        Ok(sqlx::query_as::<_, TrainingResult>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        version: NewModelVersion,
        metrics: &EvaluationMetrics,
    ) -> anyhow::Result<ModelVersion> {
        let mut tx = self.pool.begin().await?;
        let created = insert_version(&mut tx, version).await?;
        insert_result(&mut tx, job_id, metrics).await?;
        let patch = JobPatch::status(JobStatus::Completed)
            .with_progress(100.0)
            .clear_error();
        let updated = patch_query(job_id, patch).build().execute(&mut *tx).await?;
        if updated.rows_affected() == 0 {
            anyhow::bail!("training job {job_id} not found");
        }
        tx.commit().await?;
        Ok(created)
    }
}

#[async_trait::async_trait]
impl LabelCorpus for PgJobStore {
    async fn get_label_count(&self) -> anyhow::Result<i64> {
        Ok(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM labels")
            .fetch_one(&self.pool)
            .await?)
    }

    async fn get_labels_grouped_by_class(
        &self,
        min_samples: usize,
    ) -> anyhow::Result<Vec<ClassLabels>> {
        let rows: Vec<(String, Option<String>, Vec<String>)> = sqlx::query_as(
            r#"
            SELECT type_id, MAX(type_name), array_agg(file_name ORDER BY file_name)
            FROM labels
            GROUP BY type_id
            HAVING COUNT(*) >= $1
            ORDER BY COUNT(*) DESC, type_id
            "#,
        )
        .bind(min_samples as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(class_id, class_name, files)| ClassLabels {
                class_id,
                class_name,
                files,
            })
            .collect())
    }
}
