use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::pipeline::{PipelineError, TrainingPipeline};
use crate::context::AppContext;
use crate::schema::{JobPatch, JobStatus, NewJob, TrainingJob, TriggerSource};
use crate::services::{EntryKind, EntryPayload, QueueEntry, QueueStatus, WorkQueue};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TriggerOutcome {
    Queued {
        job_id: Uuid,
        queue_id: u64,
        task_type: String,
        triggered_by: TriggerSource,
    },
    Skipped {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_job: Option<Box<TrainingJob>>,
    },
    Failed {
        error: String,
        job_id: Uuid,
    },
}

const RESTART_ERROR: &str = "Training interrupted by restart";

/// The entry the worker is executing and the task running its pipeline.
struct ActiveRun {
    entry_id: u64,
    job_id: Uuid,
    pipeline: AbortHandle,
}

type ActiveSlot = Arc<Mutex<Option<ActiveRun>>>;

fn lock_active(slot: &Mutex<Option<ActiveRun>>) -> std::sync::MutexGuard<'_, Option<ActiveRun>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    active: ActiveSlot,
}

/// Admits training requests and drives the single worker that executes them.
pub struct Orchestrator {
    ctx: AppContext,
    queue: Arc<WorkQueue>,
    /// Serializes the check-then-create sequence of `trigger_training`.
    admission_lock: tokio::sync::Mutex<()>,
    worker: Mutex<Option<Worker>>,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        let queue = Arc::new(WorkQueue::new(&ctx.config.queue));
        Self {
            ctx,
            queue,
            admission_lock: tokio::sync::Mutex::new(()),
            worker: Mutex::new(None),
        }
    }

    fn worker_slot(&self) -> std::sync::MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fails jobs a previous process left `pending` or `running`. The queue is in-memory,
    /// so nothing would ever pick them up again. Must run before `start`.
    pub async fn recover_orphaned_jobs(&self) -> anyhow::Result<usize> {
        if self.is_running() {
            anyhow::bail!("orphan recovery requires a stopped worker");
        }
        let _admission = self.admission_lock.lock().await;
        let orphaned = self.ctx.store.fail_orphaned_jobs(RESTART_ERROR).await?;
        for job_id in &orphaned {
            tracing::warn!(job_id = %job_id, "orchestrator: failed job orphaned by restart");
        }
        Ok(orphaned.len())
    }

    pub async fn trigger_training(
        &self,
        task_type: &str,
        triggered_by: TriggerSource,
    ) -> anyhow::Result<TriggerOutcome> {
        let _admission = self.admission_lock.lock().await;

        if let Some(active) = self.ctx.store.get_active_job().await? {
            tracing::info!(
                job_id = %active.id,
                status = %active.status,
                task_type,
                "orchestrator: training already active, skipping"
            );
            return Ok(TriggerOutcome::Skipped {
                reason: format!("Training job {} is already {}", active.id, active.status),
                current_job: Some(Box::new(active)),
            });
        }

        let label_count = self.ctx.corpus.get_label_count().await?;
        let min_labels = self.ctx.config.training.min_labels;
        if label_count < min_labels {
            tracing::info!(label_count, min_labels, task_type, "orchestrator: not enough labels");
            return Ok(TriggerOutcome::Skipped {
                reason: format!("Insufficient labels: {label_count} (minimum: {min_labels})"),
                current_job: None,
            });
        }

        let job_id = self
            .ctx
            .store
            .create_job(NewJob {
                task_type: task_type.to_string(),
                triggered_by: triggered_by.clone(),
                config: serde_json::to_value(&self.ctx.config.training.params)?,
                dataset_info: serde_json::json!({ "label_count": label_count }),
            })
            .await?;

        let payload = EntryPayload {
            job_id,
            task_type: task_type.to_string(),
        };
        match self.queue.add_job(EntryKind::Training, payload) {
            Ok(queue_id) => {
                tracing::info!(
                    job_id = %job_id,
                    queue_id,
                    task_type,
                    triggered_by = %triggered_by,
                    "orchestrator: training queued"
                );
                Ok(TriggerOutcome::Queued {
                    job_id,
                    queue_id,
                    task_type: task_type.to_string(),
                    triggered_by,
                })
            }
            Err(e) => {
                let error = e.to_string();
                tracing::warn!(job_id = %job_id, error = %error, "orchestrator: queue rejected job");
                self.ctx
                    .store
                    .update_job_status(job_id, JobPatch::status(JobStatus::Cancelled).with_error(&error))
                    .await?;
                Ok(TriggerOutcome::Failed { error, job_id })
            }
        }
    }

    /// Spawns the worker. Returns false when one is already running.
    pub fn start(&self) -> bool {
        let mut slot = self.worker_slot();
        if slot.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            tracing::warn!("orchestrator: worker already running");
            return false;
        }
        let cancel = CancellationToken::new();
        let active = ActiveSlot::default();
        let handle = tokio::spawn(worker_loop(
            self.ctx.clone(),
            self.queue.clone(),
            cancel.clone(),
            active.clone(),
        ));
        *slot = Some(Worker {
            cancel,
            handle,
            active,
        });
        tracing::info!("orchestrator: worker started");
        true
    }

    /// Cancels the worker and waits up to the configured join timeout. Past the timeout the
    /// worker and its pipeline task are aborted and the current job is failed.
    pub async fn stop(&self) {
        let Some(mut worker) = self.worker_slot().take() else {
            return;
        };
        worker.cancel.cancel();
        let timeout = self.ctx.config.join_timeout;
        match tokio::time::timeout(timeout, &mut worker.handle).await {
            Ok(Ok(())) => tracing::info!("orchestrator: worker stopped"),
            Ok(Err(e)) => tracing::error!(error = %e, "orchestrator: worker ended abnormally"),
            Err(_) => {
                tracing::warn!(
                    timeout_secs = timeout.as_secs(),
                    "orchestrator: worker did not stop in time, aborting"
                );
                worker.handle.abort();
                let _ = (&mut worker.handle).await;
                let active = lock_active(&worker.active).take();
                if let Some(active) = active {
                    active.pipeline.abort();
                    self.record_interrupted(active).await;
                }
            }
        }
    }

    async fn record_interrupted(&self, active: ActiveRun) {
        let error = PipelineError::Interrupted.to_string();
        match self.ctx.store.get_job(active.job_id).await {
            Ok(Some(job)) if job.status.is_terminal() => {}
            Ok(_) => {
                record_failure(&self.ctx, active.job_id, &error).await;
            }
            Err(e) => {
                tracing::error!(job_id = %active.job_id, error = %e, "orchestrator: failed to load aborted job")
            }
        }
        self.queue.complete_job(active.entry_id, false, Some(error));
    }

    pub fn is_running(&self) -> bool {
        self.worker_slot()
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.queue.get_queue_status()
    }
}

async fn worker_loop(
    ctx: AppContext,
    queue: Arc<WorkQueue>,
    shutdown: CancellationToken,
    active: ActiveSlot,
) {
    while let Some(entry) = queue.get_next_job(&shutdown).await {
        match entry.kind {
            EntryKind::Training => run_entry(&ctx, &queue, entry, &shutdown, &active).await,
        }
        *lock_active(&active) = None;
    }
    tracing::debug!("orchestrator: worker loop exited");
}

/// Executes one entry in its own task so a panic fails the job instead of the worker.
async fn run_entry(
    ctx: &AppContext,
    queue: &WorkQueue,
    entry: QueueEntry,
    shutdown: &CancellationToken,
    active: &Mutex<Option<ActiveRun>>,
) {
    let job_id = entry.payload.job_id;
    tracing::info!(
        job_id = %job_id,
        queue_id = entry.id,
        task_type = %entry.payload.task_type,
        "orchestrator: executing training job"
    );

    let task_ctx = ctx.clone();
    let cancel = shutdown.clone();
    let handle =
        tokio::spawn(async move { TrainingPipeline::new(&task_ctx, &cancel).run(job_id).await });
    *lock_active(active) = Some(ActiveRun {
        entry_id: entry.id,
        job_id,
        pipeline: handle.abort_handle(),
    });

    let error = match handle.await {
        Ok(Ok(outcome)) => {
            tracing::info!(
                job_id = %job_id,
                queue_id = entry.id,
                version = %outcome.version.version_name,
                accuracy = outcome.metrics.accuracy,
                degraded = outcome.degraded,
                "orchestrator: training job completed"
            );
            queue.complete_job(entry.id, true, None);
            return;
        }
        Ok(Err(e)) => e.to_string(),
        Err(e) if e.is_panic() => format!("Training task panicked: {e}"),
        Err(e) => format!("Training task aborted: {e}"),
    };

    tracing::error!(
        job_id = %job_id,
        queue_id = entry.id,
        task_type = %entry.payload.task_type,
        error = %error,
        "orchestrator: training job failed"
    );
    record_failure(ctx, job_id, &error).await;
    queue.complete_job(entry.id, false, Some(error));
}

async fn record_failure(ctx: &AppContext, job_id: Uuid, error: &str) {
    match ctx
        .store
        .update_job_status(job_id, JobPatch::status(JobStatus::Failed).with_error(error))
        .await
    {
        Ok(true) => {}
        Ok(false) => tracing::warn!(job_id = %job_id, "orchestrator: failed job no longer in store"),
        Err(e) => tracing::error!(job_id = %job_id, error = %e, "orchestrator: failed to record job failure"),
    }
}
