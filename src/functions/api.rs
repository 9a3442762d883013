use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::orchestrator::{Orchestrator, TriggerOutcome};
use super::scheduler::TrainingScheduler;
use crate::context::AppContext;
use crate::schema::{JobStatus, ModelVersion, TrainingJob, TrainingResult, TriggerSource};
use crate::services::{QueueStatus, ResourceReport};

#[derive(Clone)]
pub struct ApiState {
    pub ctx: AppContext,
    pub orchestrator: Arc<Orchestrator>,
    pub scheduler: Option<Arc<TrainingScheduler>>,
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "api: request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/training/trigger", post(trigger))
        .route("/api/training/queue", get(queue_status))
        .route("/api/training/resources", get(resources))
        .route("/api/training/scheduler", get(scheduler_status))
        .route("/api/training/jobs", get(list_jobs))
        .route("/api/training/jobs/{id}", get(get_job).delete(delete_job))
        .route("/api/models", get(list_models))
        .route("/api/models/{id}/activate", post(activate_model))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TriggerInput {
    pub task_type: Option<String>,
    pub triggered_by: Option<String>,
}

async fn trigger(
    State(state): State<ApiState>,
    Json(input): Json<TriggerInput>,
) -> ApiResult<TriggerOutcome> {
    let task_type = input
        .task_type
        .unwrap_or_else(|| state.ctx.config.scheduler.primary_task.clone());
    let triggered_by = input
        .triggered_by
        .map(TriggerSource::from)
        .unwrap_or(TriggerSource::Manual);
    let outcome = state
        .orchestrator
        .trigger_training(&task_type, triggered_by)
        .await?;
    Ok(Json(outcome))
}

async fn queue_status(State(state): State<ApiState>) -> Json<QueueStatus> {
    Json(state.orchestrator.queue_status())
}

async fn resources(State(state): State<ApiState>) -> Json<ResourceReport> {
    let admission = &state.ctx.config.admission;
    Json(
        state
            .ctx
            .admission
            .check_resources(admission.min_vram_gb, admission.min_ram_gb)
            .await,
    )
}

async fn scheduler_status(State(state): State<ApiState>) -> Json<serde_json::Value> {
    match state.scheduler {
        Some(scheduler) => Json(serde_json::to_value(scheduler.get_status()).unwrap_or_default()),
        None => Json(serde_json::json!({
            "enabled": false,
            "schedule_hour": state.ctx.config.scheduler.schedule_hour,
            "is_running": false,
        })),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsInput {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

async fn list_jobs(
    State(state): State<ApiState>,
    Query(input): Query<ListJobsInput>,
) -> ApiResult<Vec<TrainingJob>> {
    let limit = input.limit.unwrap_or(50).clamp(0, 200);
    let status = input
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(state.ctx.store.list_jobs(status, limit).await?))
}

#[derive(Debug, Serialize)]
pub struct JobDetail {
    pub job: TrainingJob,
    pub result: Option<TrainingResult>,
}

async fn get_job(State(state): State<ApiState>, Path(id): Path<Uuid>) -> ApiResult<JobDetail> {
    let job = state
        .ctx
        .store
        .get_job(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("training job {id} not found")))?;
    let result = state.ctx.store.get_training_result(id).await?;
    Ok(Json(JobDetail { job, result }))
}

async fn delete_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let job = state
        .ctx
        .store
        .get_job(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("training job {id} not found")))?;
    if !job.status.is_terminal() {
        return Err(ApiError::Conflict(format!(
            "training job {id} is {} and cannot be deleted",
            job.status
        )));
    }
    let versions: Vec<ModelVersion> = state
        .ctx
        .store
        .get_model_versions(None, false)
        .await?
        .into_iter()
        .filter(|v| v.training_job_id == id)
        .collect();
    state.ctx.store.delete_job(id).await?;
    tracing::info!(job_id = %id, versions = versions.len(), "api: training job deleted");

    for version in &versions {
        if version.is_active {
            tracing::warn!(
                job_id = %id,
                model_type = %version.model_type,
                version = %version.version_name,
                "api: deleted the active model version, none is active for this type now"
            );
        }
        match tokio::fs::remove_file(&version.file_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %version.file_path,
                error = %e,
                "api: failed to remove model artifact"
            ),
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
pub struct ListModelsInput {
    pub model_type: Option<String>,
    pub active_only: Option<bool>,
}

async fn list_models(
    State(state): State<ApiState>,
    Query(input): Query<ListModelsInput>,
) -> ApiResult<Vec<ModelVersion>> {
    Ok(Json(
        state
            .ctx
            .store
            .get_model_versions(input.model_type.as_deref(), input.active_only.unwrap_or(false))
            .await?,
    ))
}

async fn activate_model(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<serde_json::Value> {
    if !state.ctx.store.set_active_model(id).await? {
        return Err(ApiError::NotFound(format!("model version {id} not found")));
    }
    tracing::info!(version_id = %id, "api: model version activated");
    Ok(Json(serde_json::json!({ "activated": id })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::orchestrator::tests::{EVAL_OK, TRAIN_OK, harness};
    use crate::schema::{EvaluationMetrics, JobPatch, NewJob, NewModelVersion};
    use crate::services::admission::tests::FixedProbe;

    fn state(ctx: AppContext) -> ApiState {
        ApiState {
            orchestrator: Arc::new(Orchestrator::new(ctx.clone())),
            ctx,
            scheduler: None,
        }
    }

    async fn finished_job(ctx: &AppContext, status: JobStatus) -> Uuid {
        let id = ctx
            .store
            .create_job(NewJob {
                task_type: "aircraft".into(),
                triggered_by: TriggerSource::Manual,
                config: serde_json::json!({}),
                dataset_info: serde_json::json!({ "label_count": 10 }),
            })
            .await
            .unwrap();
        ctx.store
            .update_job_status(id, JobPatch::status(status))
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn trigger_defaults_to_primary_task_and_manual_source() {
        let h = harness("api-trigger", TRAIN_OK, EVAL_OK, FixedProbe::plenty());
        let Json(outcome) = trigger(State(state(h.ctx.clone())), Json(TriggerInput::default()))
            .await
            .unwrap();
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "queued");
        assert_eq!(json["task_type"], "aircraft");
        assert_eq!(json["triggered_by"], "manual");
    }

    #[tokio::test]
    async fn list_jobs_rejects_unknown_status() {
        let h = harness("api-list", TRAIN_OK, EVAL_OK, FixedProbe::plenty());
        let st = state(h.ctx.clone());
        finished_job(&h.ctx, JobStatus::Failed).await;
        finished_job(&h.ctx, JobStatus::Completed).await;

        let Json(jobs) = list_jobs(
            State(st.clone()),
            Query(ListJobsInput {
                status: Some("failed".into()),
                limit: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(jobs.len(), 1);

        let err = list_jobs(
            State(st),
            Query(ListJobsInput {
                status: Some("paused".into()),
                limit: Some(5),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn only_terminal_jobs_can_be_deleted() {
        let h = harness("api-delete", TRAIN_OK, EVAL_OK, FixedProbe::plenty());
        let st = state(h.ctx.clone());
        let running = finished_job(&h.ctx, JobStatus::Running).await;
        let err = delete_job(State(st.clone()), Path(running)).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);

        let failed = finished_job(&h.ctx, JobStatus::Failed).await;
        let status = delete_job(State(st.clone()), Path(failed)).await.unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        let err = get_job(State(st), Path(failed)).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn activation_switches_the_active_version() {
        let h = harness("api-activate", TRAIN_OK, EVAL_OK, FixedProbe::plenty());
        let st = state(h.ctx.clone());
        let mut versions = Vec::new();
        for name in ["v20261019_020000", "v20261020_020000"] {
            let job = finished_job(&h.ctx, JobStatus::Pending).await;
            let version = h
                .ctx
                .store
                .complete_job(
                    job,
                    NewModelVersion {
                        model_type: "aircraft".into(),
                        version_name: name.into(),
                        file_path: format!("/models/aircraft_{name}.pt"),
                        training_job_id: job,
                    },
                    &EvaluationMetrics::default(),
                )
                .await
                .unwrap();
            versions.push(version);
        }

        let Json(activated) = activate_model(State(st.clone()), Path(versions[0].id))
            .await
            .unwrap();
        assert_eq!(activated["activated"], versions[0].id.to_string());
        let Json(active) = list_models(
            State(st.clone()),
            Query(ListModelsInput {
                model_type: Some("aircraft".into()),
                active_only: Some(true),
            }),
        )
        .await
        .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, versions[0].id);

        let err = activate_model(State(st), Path(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn deleting_a_job_removes_its_model_files() {
        let h = harness("api-delete-model", TRAIN_OK, EVAL_OK, FixedProbe::plenty());
        let st = state(h.ctx.clone());
        let job = finished_job(&h.ctx, JobStatus::Pending).await;
        let file = h.root.join("aircraft_v20261019_020000.pt");
        std::fs::write(&file, b"weights").unwrap();
        h.ctx
            .store
            .complete_job(
                job,
                NewModelVersion {
                    model_type: "aircraft".into(),
                    version_name: "v20261019_020000".into(),
                    file_path: file.display().to_string(),
                    training_job_id: job,
                },
                &EvaluationMetrics::default(),
            )
            .await
            .unwrap();

        let status = delete_job(State(st), Path(job)).await.unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!file.exists());
        assert!(h.ctx.store.get_active_model("aircraft").await.unwrap().is_none());
        assert!(h.ctx.store.get_training_result(job).await.unwrap().is_none());
    }
}
