use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ModelVersion {
    pub id: Uuid,
    pub model_type: String,
    pub version_name: String,
    pub file_path: String,
    pub training_job_id: Uuid,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewModelVersion {
    pub model_type: String,
    pub version_name: String,
    pub file_path: String,
    pub training_job_id: Uuid,
}
