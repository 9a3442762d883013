use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
#[error("unknown job status `{0}`")]
pub struct UnknownJobStatus(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = UnknownJobStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(UnknownJobStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for JobStatus {
    type Error = UnknownJobStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Who asked for a job. Unknown sources read back from the store are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TriggerSource {
    Scheduler,
    Manual,
    Other(String),
}

impl TriggerSource {
    pub fn as_str(&self) -> &str {
        match self {
            TriggerSource::Scheduler => "scheduler",
            TriggerSource::Manual => "manual",
            TriggerSource::Other(s) => s,
        }
    }
}

impl From<String> for TriggerSource {
    fn from(value: String) -> Self {
        match value.as_str() {
            "scheduler" => TriggerSource::Scheduler,
            "manual" => TriggerSource::Manual,
            _ => TriggerSource::Other(value),
        }
    }
}

impl From<&str> for TriggerSource {
    fn from(value: &str) -> Self {
        TriggerSource::from(value.to_string())
    }
}

impl From<TriggerSource> for String {
    fn from(value: TriggerSource) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hyperparameters handed to the training executable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingParams {
    pub epochs: u32,
    pub batch_size: u32,
    pub imgsz: u32,
    pub device: String,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            epochs: 50,
            batch_size: 32,
            imgsz: 224,
            device: "0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TrainingJob {
    pub id: Uuid,
    pub task_type: String,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    #[sqlx(try_from = "String")]
    pub triggered_by: TriggerSource,
    pub priority: i32,
    pub total_samples: i32,
    pub progress: f64,
    pub current_epoch: i32,
    pub total_epochs: i32,
    pub error_message: Option<String>,
    pub config: serde_json::Value,
    pub dataset_info: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TrainingJob {
    /// Label count captured when the job was admitted; the scheduler compares against it.
    pub fn label_count_snapshot(&self) -> i64 {
        self.dataset_info
            .get("label_count")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }

    pub fn params(&self) -> TrainingParams {
        serde_json::from_value(self.config.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub task_type: String,
    pub triggered_by: TriggerSource,
    pub config: serde_json::Value,
    pub dataset_info: serde_json::Value,
}

/// Partial update applied together with a status change.
///
/// `error` is tri-state: `None` leaves the column alone, `Some(None)` clears it,
/// `Some(Some(msg))` sets it.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPatch {
    pub status: JobStatus,
    pub progress: Option<f64>,
    pub current_epoch: Option<i32>,
    pub total_epochs: Option<i32>,
    pub total_samples: Option<i32>,
    pub dataset_info: Option<serde_json::Value>,
    pub error: Option<Option<String>>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status,
            progress: None,
            current_epoch: None,
            total_epochs: None,
            total_samples: None,
            dataset_info: None,
            error: None,
        }
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_epochs(mut self, current: i32, total: i32) -> Self {
        self.current_epoch = Some(current);
        self.total_epochs = Some(total);
        self
    }

    pub fn with_total_samples(mut self, total: i32) -> Self {
        self.total_samples = Some(total);
        self
    }

    pub fn with_dataset_info(mut self, info: serde_json::Value) -> Self {
        self.dataset_info = Some(info);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    pub fn stamps_start(&self) -> bool {
        self.status == JobStatus::Running
    }

    pub fn stamps_completion(&self) -> bool {
        self.status.is_terminal()
    }
}
