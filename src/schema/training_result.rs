use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metrics document produced by the evaluation executable.
///
/// Every field defaults so partial documents still load; a failed evaluation is
/// represented by `EvaluationMetrics::default()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationMetrics {
    pub accuracy: f64,
    pub macro_recall: f64,
    pub ece: f64,
    pub total_samples: i64,
    pub num_classes: i64,
    pub per_class_accuracy: Vec<f64>,
    pub recall_per_class: Vec<f64>,
    pub confusion_matrix: Vec<Vec<i64>>,
    pub confidence_mean: f64,
    pub confidence_std: f64,
}

impl EvaluationMetrics {
    /// Zeroed metrics that still carry the dataset shape.
    pub fn zeroed(total_samples: i64, num_classes: i64) -> Self {
        Self {
            total_samples,
            num_classes,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TrainingResult {
    pub id: Uuid,
    pub training_job_id: Uuid,
    pub accuracy: f64,
    pub macro_recall: f64,
    pub ece: f64,
    pub total_samples: i64,
    pub num_classes: i64,
    pub per_class_accuracy: serde_json::Value,
    pub recall_per_class: serde_json::Value,
    pub confusion_matrix: serde_json::Value,
    pub confidence_mean: f64,
    pub confidence_std: f64,
    pub metrics: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl TrainingResult {
    pub fn from_metrics(training_job_id: Uuid, metrics: &EvaluationMetrics) -> Self {
        Self {
            id: Uuid::new_v4(),
            training_job_id,
            accuracy: metrics.accuracy,
            macro_recall: metrics.macro_recall,
            ece: metrics.ece,
            total_samples: metrics.total_samples,
            num_classes: metrics.num_classes,
            per_class_accuracy: serde_json::json!(metrics.per_class_accuracy),
            recall_per_class: serde_json::json!(metrics.recall_per_class),
            confusion_matrix: serde_json::json!(metrics.confusion_matrix),
            confidence_mean: metrics.confidence_mean,
            confidence_std: metrics.confidence_std,
            metrics: serde_json::to_value(metrics).unwrap_or_default(),
            created_at: Utc::now(),
        }
    }
}
