use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::context::AppContext;
use crate::schema::{
    ClassLabels, EvaluationMetrics, JobPatch, JobStatus, ModelVersion, NewModelVersion,
    TrainingJob, TrainingParams,
};
use crate::services::{ProcessEnd, ProcessOutput, ProcessSpec};

/// Characters of captured output kept in error messages.
const OUTPUT_TAIL_CHARS: usize = 2000;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Training job {0} not found")]
    JobNotFound(Uuid),
    #[error("Insufficient resources: VRAM={vram_gb:.2}GB, RAM={ram_gb:.2}GB")]
    AdmissionDenied { vram_gb: f64, ram_gb: f64 },
    #[error("Dataset preparation failed: {0}")]
    DatasetPreparation(String),
    #[error("Unsupported task type: {0}")]
    UnsupportedTask(String),
    #[error("Training failed: {0}")]
    TrainingFailed(String),
    #[error("No model artifact found under {}", .0.display())]
    ArtifactNotFound(PathBuf),
    #[error("Training interrupted by shutdown")]
    Interrupted,
    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Scratch directories of one job under the temp root.
pub struct JobWorkspace {
    pub dataset_dir: PathBuf,
    pub training_dir: PathBuf,
    pub eval_dir: PathBuf,
    cleaned: bool,
}

impl JobWorkspace {
    pub fn new(temp_root: &Path, job_id: Uuid) -> Self {
        Self {
            dataset_dir: temp_root.join(format!("dataset_{job_id}")),
            training_dir: temp_root.join(format!("training_{job_id}")),
            eval_dir: temp_root.join(format!("eval_{job_id}")),
            cleaned: false,
        }
    }

    fn dirs(&self) -> [&Path; 3] {
        [
            self.dataset_dir.as_path(),
            self.training_dir.as_path(),
            self.eval_dir.as_path(),
        ]
    }

    pub async fn cleanup(mut self) {
        for dir in self.dirs() {
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => tracing::debug!(dir = %dir.display(), "pipeline: removed temp dir"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "pipeline: failed to remove temp dir")
                }
            }
        }
        self.cleaned = true;
    }
}

impl Drop for JobWorkspace {
    fn drop(&mut self) {
        if self.cleaned {
            return;
        }
        for dir in self.dirs() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub version: ModelVersion,
    pub metrics: EvaluationMetrics,
    /// Evaluation failed and zeroed metrics were stored.
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSummary {
    pub total_samples: usize,
    pub classes: Vec<String>,
    pub skipped: usize,
}

/// Last `max_chars` characters of `text`.
pub fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let start = text
        .char_indices()
        .nth(count - max_chars)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &text[start..]
}

fn describe_output(output: &ProcessOutput) -> String {
    format!(
        "stdout: {}\nstderr: {}",
        tail(output.stdout.trim(), OUTPUT_TAIL_CHARS),
        tail(output.stderr.trim(), OUTPUT_TAIL_CHARS)
    )
}

fn class_dir_name(class_id: &str) -> String {
    class_id.replace(['/', '\\'], "_")
}

/// Copies every labeled image into `<dataset_dir>/<class>/`. Missing sources are skipped.
pub async fn prepare_dataset(
    dataset_dir: &Path,
    labeled_dir: &Path,
    groups: &[ClassLabels],
) -> Result<DatasetSummary, PipelineError> {
    let io_err = |what: &str, path: &Path, e: std::io::Error| {
        PipelineError::DatasetPreparation(format!("{what} {}: {e}", path.display()))
    };

    tokio::fs::create_dir_all(dataset_dir)
        .await
        .map_err(|e| io_err("cannot create", dataset_dir, e))?;

    let mut summary = DatasetSummary {
        total_samples: 0,
        classes: Vec::new(),
        skipped: 0,
    };

    for group in groups {
        let class_dir = dataset_dir.join(class_dir_name(&group.class_id));
        let mut copied = 0usize;
        for file in &group.files {
            let src = labeled_dir.join(file);
            let Some(name) = src.file_name() else {
                summary.skipped += 1;
                continue;
            };
            match tokio::fs::metadata(&src).await {
                Ok(meta) if meta.is_file() => {}
                Ok(_) | Err(_) => {
                    tracing::warn!(src = %src.display(), "pipeline: labeled image missing, skipping");
                    summary.skipped += 1;
                    continue;
                }
            }
            if copied == 0 {
                tokio::fs::create_dir_all(&class_dir)
                    .await
                    .map_err(|e| io_err("cannot create", &class_dir, e))?;
            }
            tokio::fs::copy(&src, class_dir.join(name))
                .await
                .map_err(|e| io_err("cannot copy", &src, e))?;
            copied += 1;
        }
        if copied > 0 {
            summary.total_samples += copied;
            summary.classes.push(group.class_id.clone());
        }
    }

    if summary.total_samples == 0 {
        return Err(PipelineError::DatasetPreparation(
            "no labeled images available".to_string(),
        ));
    }
    Ok(summary)
}

pub fn training_args(params: &TrainingParams, dataset_dir: &Path, output_dir: &Path) -> Vec<String> {
    vec![
        "--data".into(),
        dataset_dir.display().to_string(),
        "--epochs".into(),
        params.epochs.to_string(),
        "--batch-size".into(),
        params.batch_size.to_string(),
        "--imgsz".into(),
        params.imgsz.to_string(),
        "--device".into(),
        params.device.clone(),
        "--project".into(),
        output_dir.display().to_string(),
        "--name".into(),
        "train".into(),
        "--exist-ok".into(),
    ]
}

pub fn evaluation_args(
    params: &TrainingParams,
    model: &Path,
    dataset_dir: &Path,
    eval_dir: &Path,
) -> Vec<String> {
    vec![
        "--model".into(),
        model.display().to_string(),
        "--data".into(),
        dataset_dir.display().to_string(),
        "--device".into(),
        params.device.clone(),
        "--batch-size".into(),
        params.batch_size.to_string(),
        "--imgsz".into(),
        params.imgsz.to_string(),
        "--output-dir".into(),
        eval_dir.display().to_string(),
    ]
}

/// `best.pt`, falling back to `last.pt`.
pub async fn find_artifact(training_dir: &Path) -> Option<PathBuf> {
    let weights = training_dir.join("train").join("weights");
    for name in ["best.pt", "last.pt"] {
        let candidate = weights.join(name);
        if tokio::fs::metadata(&candidate).await.is_ok_and(|m| m.is_file()) {
            return Some(candidate);
        }
    }
    None
}

/// Last line of stdout that parses as a metrics object.
pub fn parse_stdout_metrics(stdout: &str) -> Option<EvaluationMetrics> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str(line).ok())
}

async fn read_metrics(eval_dir: &Path, stdout: &str, fallback: EvaluationMetrics) -> EvaluationMetrics {
    let path = eval_dir.join("metrics.json");
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => match serde_json::from_str(&text) {
            Ok(metrics) => return metrics,
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "pipeline: unreadable metrics file"),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "pipeline: cannot read metrics file"),
    }
    parse_stdout_metrics(stdout).unwrap_or(fallback)
}

fn check_training_output(output: &ProcessOutput, timeout_secs: u64) -> Result<(), PipelineError> {
    match output.end {
        ProcessEnd::Cancelled => Err(PipelineError::Interrupted),
        ProcessEnd::TimedOut => Err(PipelineError::TrainingFailed(format!(
            "timed out after {timeout_secs}s\n{}",
            describe_output(output)
        ))),
        ProcessEnd::Exited if output.success() => Ok(()),
        ProcessEnd::Exited => Err(PipelineError::TrainingFailed(format!(
            "exit code {}\n{}",
            output
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none (killed by signal)".to_string()),
            describe_output(output)
        ))),
    }
}

/// Runs one admitted job from resource check to the final store write.
pub struct TrainingPipeline<'a> {
    ctx: &'a AppContext,
    cancel: &'a CancellationToken,
}

impl<'a> TrainingPipeline<'a> {
    pub fn new(ctx: &'a AppContext, cancel: &'a CancellationToken) -> Self {
        Self { ctx, cancel }
    }

    pub async fn run(&self, job_id: Uuid) -> Result<JobOutcome, PipelineError> {
        let job = self
            .ctx
            .store
            .get_job(job_id)
            .await?
            .ok_or(PipelineError::JobNotFound(job_id))?;

        let admission = &self.ctx.config.admission;
        let report = self
            .ctx
            .admission
            .check_resources(admission.min_vram_gb, admission.min_ram_gb)
            .await;
        if !report.ok {
            return Err(PipelineError::AdmissionDenied {
                vram_gb: report.vram_gb,
                ram_gb: report.ram_gb,
            });
        }

        self.ctx
            .store
            .update_job_status(job_id, JobPatch::status(JobStatus::Running))
            .await?;
        tracing::info!(job_id = %job_id, task_type = %job.task_type, "pipeline: job running");

        let workspace = JobWorkspace::new(&self.ctx.config.storage.temp_dir, job_id);
        let result = self.execute(&job, &workspace).await;
        workspace.cleanup().await;
        result
    }

    async fn execute(
        &self,
        job: &TrainingJob,
        workspace: &JobWorkspace,
    ) -> Result<JobOutcome, PipelineError> {
        let config = &self.ctx.config;
        let params = job.params();

        let groups = self
            .ctx
            .corpus
            .get_labels_grouped_by_class(1)
            .await
            .map_err(|e| PipelineError::DatasetPreparation(e.to_string()))?;
        let summary =
            prepare_dataset(&workspace.dataset_dir, &config.storage.labeled_dir, &groups).await?;
        tracing::info!(
            job_id = %job.id,
            total_samples = summary.total_samples,
            num_classes = summary.classes.len(),
            skipped = summary.skipped,
            "pipeline: dataset prepared"
        );

        let mut dataset_info = job.dataset_info.clone();
        if !dataset_info.is_object() {
            dataset_info = serde_json::json!({});
        }
        if let Some(info) = dataset_info.as_object_mut() {
            info.insert("dataset_dir".into(), workspace.dataset_dir.display().to_string().into());
            info.insert("num_classes".into(), summary.classes.len().into());
            info.insert("total_images".into(), summary.total_samples.into());
            info.insert("classes".into(), serde_json::json!(summary.classes));
        }
        self.ctx
            .store
            .update_job_status(
                job.id,
                JobPatch::status(JobStatus::Running)
                    .with_progress(10.0)
                    .with_total_samples(summary.total_samples as i32)
                    .with_epochs(0, params.epochs as i32)
                    .with_dataset_info(dataset_info),
            )
            .await?;

        let command = config
            .training
            .training_command(&job.task_type)
            .ok_or_else(|| PipelineError::UnsupportedTask(job.task_type.clone()))?;
        let spec = ProcessSpec::from_template(
            command,
            training_args(&params, &workspace.dataset_dir, &workspace.training_dir),
            config.training.train_timeout,
        );
        tracing::info!(job_id = %job.id, command = %spec.display(), "pipeline: starting training");
        let output = self
            .ctx
            .launcher
            .run(spec, self.cancel)
            .await
            .map_err(|e| PipelineError::TrainingFailed(e.to_string()))?;
        check_training_output(&output, config.training.train_timeout.as_secs())?;

        let artifact = find_artifact(&workspace.training_dir)
            .await
            .ok_or_else(|| PipelineError::ArtifactNotFound(workspace.training_dir.join("train/weights")))?;
        let (version_name, model_path) = self.store_artifact(&job.task_type, &artifact).await?;
        let outcome = self
            .finish(job, &params, &summary, workspace, version_name, &model_path)
            .await;
        if outcome.is_err() {
            if let Err(e) = tokio::fs::remove_file(&model_path).await {
                tracing::warn!(path = %model_path.display(), error = %e, "pipeline: failed to remove model artifact");
            }
        }
        outcome
    }

    /// Evaluation and the success write. The caller owns the copied artifact at `model_path`.
    async fn finish(
        &self,
        job: &TrainingJob,
        params: &TrainingParams,
        summary: &DatasetSummary,
        workspace: &JobWorkspace,
        version_name: String,
        model_path: &Path,
    ) -> Result<JobOutcome, PipelineError> {
        self.ctx
            .store
            .update_job_status(
                job.id,
                JobPatch::status(JobStatus::Running)
                    .with_progress(80.0)
                    .with_epochs(params.epochs as i32, params.epochs as i32),
            )
            .await?;

        let fallback =
            EvaluationMetrics::zeroed(summary.total_samples as i64, summary.classes.len() as i64);
        let (metrics, degraded) = self
            .evaluate(job.id, params, model_path, workspace, fallback)
            .await?;

        let version = self
            .ctx
            .store
            .complete_job(
                job.id,
                NewModelVersion {
                    model_type: job.task_type.clone(),
                    version_name,
                    file_path: model_path.display().to_string(),
                    training_job_id: job.id,
                },
                &metrics,
            )
            .await?;

        Ok(JobOutcome {
            version,
            metrics,
            degraded,
        })
    }

    /// Copies the artifact to `<models>/<task>_<version>.pt` under a version name not yet
    /// taken on disk or in the store.
    async fn store_artifact(
        &self,
        task_type: &str,
        artifact: &Path,
    ) -> Result<(String, PathBuf), PipelineError> {
        let models_dir = &self.ctx.config.storage.models_dir;
        tokio::fs::create_dir_all(models_dir)
            .await
            .map_err(|e| PipelineError::Store(e.into()))?;

        let taken: HashSet<String> = self
            .ctx
            .store
            .get_model_versions(None, false)
            .await?
            .into_iter()
            .map(|v| v.version_name)
            .collect();

        let base = chrono::Local::now().format("v%Y%m%d_%H%M%S").to_string();
        let mut version_name = base.clone();
        let mut suffix = 1;
        loop {
            let candidate = models_dir.join(format!("{task_type}_{version_name}.pt"));
            let on_disk = tokio::fs::try_exists(&candidate).await.unwrap_or(false);
            if !on_disk && !taken.contains(&version_name) {
                tokio::fs::copy(artifact, &candidate)
                    .await
                    .map_err(|e| PipelineError::Store(e.into()))?;
                tracing::info!(path = %candidate.display(), version = %version_name, "pipeline: model saved");
                return Ok((version_name, candidate));
            }
            version_name = format!("{base}_{suffix}");
            suffix += 1;
        }
    }

    /// Evaluation never fails the job except on shutdown.
    async fn evaluate(
        &self,
        job_id: Uuid,
        params: &TrainingParams,
        model_path: &Path,
        workspace: &JobWorkspace,
        fallback: EvaluationMetrics,
    ) -> Result<(EvaluationMetrics, bool), PipelineError> {
        let training = &self.ctx.config.training;
        if let Err(e) = tokio::fs::create_dir_all(&workspace.eval_dir).await {
            tracing::warn!(job_id = %job_id, error = %e, "pipeline: cannot create eval dir");
            return Ok((EvaluationMetrics::default(), true));
        }
        let spec = ProcessSpec::from_template(
            &training.eval_command,
            evaluation_args(params, model_path, &workspace.dataset_dir, &workspace.eval_dir),
            training.eval_timeout,
        );
        tracing::info!(job_id = %job_id, command = %spec.display(), "pipeline: starting evaluation");

        let output = match self.ctx.launcher.run(spec, self.cancel).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "pipeline: evaluation could not start");
                return Ok((EvaluationMetrics::default(), true));
            }
        };
        if output.end == ProcessEnd::Cancelled {
            return Err(PipelineError::Interrupted);
        }
        if !output.success() {
            tracing::warn!(
                job_id = %job_id,
                exit_code = ?output.exit_code,
                end = ?output.end,
                stderr = %tail(output.stderr.trim(), OUTPUT_TAIL_CHARS),
                "pipeline: evaluation failed, storing zeroed metrics"
            );
            return Ok((EvaluationMetrics::default(), true));
        }

        let metrics = read_metrics(&workspace.eval_dir, &output.stdout, fallback).await;
        tracing::info!(
            job_id = %job_id,
            accuracy = metrics.accuracy,
            macro_recall = metrics.macro_recall,
            "pipeline: evaluation finished"
        );
        Ok((metrics, false))
    }
}
