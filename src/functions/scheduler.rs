use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::orchestrator::{Orchestrator, TriggerOutcome};
use crate::context::AppContext;
use crate::schema::TriggerSource;

/// Fires once per calendar day during the configured hour.
#[derive(Debug, Clone)]
pub struct ScheduleGate {
    hour: u32,
    last_fired: Option<NaiveDate>,
}

impl ScheduleGate {
    pub fn new(hour: u32) -> Self {
        Self {
            hour,
            last_fired: None,
        }
    }

    pub fn should_fire(&mut self, now: NaiveDateTime) -> bool {
        let today = now.date();
        if now.hour() != self.hour || self.last_fired == Some(today) {
            return false;
        }
        self.last_fired = Some(today);
        true
    }
}

/// Today at `hour` while that hour has not started yet, otherwise tomorrow.
pub fn next_run_after(now: NaiveDateTime, hour: u32) -> NaiveDateTime {
    let at = NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN);
    let day = if now.hour() < hour {
        now.date()
    } else {
        now.date() + ChronoDuration::days(1)
    };
    day.and_time(at)
}

#[derive(Debug, Clone, Copy)]
pub enum ScheduleZone {
    Local,
    Named(chrono_tz::Tz),
}

impl ScheduleZone {
    pub fn parse(name: Option<&str>) -> anyhow::Result<Self> {
        match name {
            None => Ok(ScheduleZone::Local),
            Some(name) => name
                .parse::<chrono_tz::Tz>()
                .map(ScheduleZone::Named)
                .map_err(|_| anyhow::anyhow!("invalid timezone: {name}")),
        }
    }

    pub fn now(&self) -> DateTime<FixedOffset> {
        match self {
            ScheduleZone::Local => chrono::Local::now().fixed_offset(),
            ScheduleZone::Named(tz) => chrono::Utc::now().with_timezone(tz).fixed_offset(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            ScheduleZone::Local => "local".to_string(),
            ScheduleZone::Named(tz) => tz.name().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ScheduleDecision {
    InsufficientLabels { label_count: i64, min_labels: i64 },
    NoNewLabels { label_count: i64 },
    Triggered { reason: String, outcome: TriggerOutcome },
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub schedule_hour: u32,
    pub is_running: bool,
    pub timezone: String,
    pub current_time: DateTime<FixedOffset>,
    pub next_run: NaiveDateTime,
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Daily retraining check against the primary task.
pub struct TrainingScheduler {
    ctx: AppContext,
    orchestrator: Arc<Orchestrator>,
    zone: ScheduleZone,
    worker: Mutex<Option<Worker>>,
}

impl TrainingScheduler {
    pub fn new(ctx: AppContext, orchestrator: Arc<Orchestrator>) -> anyhow::Result<Self> {
        let zone = ScheduleZone::parse(ctx.config.scheduler.timezone.as_deref())?;
        tracing::info!(
            schedule_hour = ctx.config.scheduler.schedule_hour,
            timezone = %zone.name(),
            "scheduler: initialized"
        );
        Ok(Self {
            ctx,
            orchestrator,
            zone,
            worker: Mutex::new(None),
        })
    }

    fn worker_slot(&self) -> std::sync::MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn start(&self) -> bool {
        let mut slot = self.worker_slot();
        if slot.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            tracing::warn!("scheduler: already running");
            return false;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler_loop(
            self.ctx.clone(),
            self.orchestrator.clone(),
            self.zone,
            cancel.clone(),
        ));
        *slot = Some(Worker { cancel, handle });
        tracing::info!("scheduler: started");
        true
    }

    pub async fn stop(&self) {
        let Some(mut worker) = self.worker_slot().take() else {
            return;
        };
        worker.cancel.cancel();
        let timeout = self.ctx.config.join_timeout;
        match tokio::time::timeout(timeout, &mut worker.handle).await {
            Ok(Ok(())) => tracing::info!("scheduler: stopped"),
            Ok(Err(e)) => tracing::error!(error = %e, "scheduler: loop ended abnormally"),
            Err(_) => {
                tracing::warn!("scheduler: loop did not stop in time, aborting");
                worker.handle.abort();
            }
        }
    }

    pub fn get_status(&self) -> SchedulerStatus {
        let now = self.zone.now();
        let hour = self.ctx.config.scheduler.schedule_hour;
        SchedulerStatus {
            schedule_hour: hour,
            is_running: self
                .worker_slot()
                .as_ref()
                .is_some_and(|w| !w.handle.is_finished()),
            timezone: self.zone.name(),
            current_time: now,
            next_run: next_run_after(now.naive_local(), hour),
        }
    }

    pub async fn check_and_trigger(&self) -> anyhow::Result<ScheduleDecision> {
        check_and_trigger(&self.ctx, &self.orchestrator).await
    }
}

async fn check_and_trigger(
    ctx: &AppContext,
    orchestrator: &Orchestrator,
) -> anyhow::Result<ScheduleDecision> {
    let task_type = &ctx.config.scheduler.primary_task;
    let latest = ctx.store.get_latest_job(Some(task_type.as_str())).await?;
    let label_count = ctx.corpus.get_label_count().await?;
    let min_labels = ctx.config.training.min_labels;

    if label_count < min_labels {
        tracing::info!(label_count, min_labels, "scheduler: insufficient labels for training");
        return Ok(ScheduleDecision::InsufficientLabels {
            label_count,
            min_labels,
        });
    }

    let reason = match latest {
        None => "First training run".to_string(),
        Some(job) => {
            let new_labels = label_count - job.label_count_snapshot();
            if new_labels <= 0 {
                tracing::info!(label_count, "scheduler: no new labels since last training");
                return Ok(ScheduleDecision::NoNewLabels { label_count });
            }
            format!("New labels detected: {new_labels} (total: {label_count})")
        }
    };

    tracing::info!(reason = %reason, task_type = %task_type, "scheduler: triggering training");
    let outcome = orchestrator
        .trigger_training(task_type, TriggerSource::Scheduler)
        .await?;
    tracing::info!(?outcome, "scheduler: trigger result");
    Ok(ScheduleDecision::Triggered { reason, outcome })
}

async fn scheduler_loop(
    ctx: AppContext,
    orchestrator: Arc<Orchestrator>,
    zone: ScheduleZone,
    shutdown: CancellationToken,
) {
    let mut gate = ScheduleGate::new(ctx.config.scheduler.schedule_hour);
    let poll = ctx.config.scheduler.poll_interval;
    loop {
        let now = zone.now();
        if gate.should_fire(now.naive_local()) {
            tracing::info!(at = %now, "scheduler: running scheduled training check");
            if let Err(e) = check_and_trigger(&ctx, &orchestrator).await {
                tracing::error!(error = %e, "scheduler tick failed");
            }
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(poll) => {}
        }
    }
}
