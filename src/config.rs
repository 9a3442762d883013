use crate::schema::TrainingParams;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// A program plus the leading arguments that precede the flag contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Parses a whitespace separated command line, e.g. `python3 /opt/train.py`.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program, parts))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub labeled_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub models_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            labeled_dir: PathBuf::from("storage/labeled"),
            temp_dir: PathBuf::from("storage/tmp"),
            models_dir: PathBuf::from("storage/models"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub params: TrainingParams,
    /// Training command per task type.
    pub train_commands: HashMap<String, CommandTemplate>,
    pub eval_command: CommandTemplate,
    pub train_timeout: Duration,
    pub eval_timeout: Duration,
    pub min_labels: i64,
}

impl TrainingConfig {
    /// Commands for the AeroVision training scripts under `project_dir`.
    pub fn for_project(python: &str, project_dir: &str) -> Self {
        let script = |name: &str| format!("{project_dir}/training/scripts/{name}");
        let mut train_commands = HashMap::new();
        train_commands.insert(
            "aircraft".to_string(),
            CommandTemplate::new(python, [script("train_classify.py")]),
        );
        train_commands.insert(
            "airline".to_string(),
            CommandTemplate::new(python, [script("train_airline.py")]),
        );
        Self {
            params: TrainingParams::default(),
            train_commands,
            eval_command: CommandTemplate::new(python, [script("evaluate_classify.py")]),
            train_timeout: Duration::from_secs(3600),
            eval_timeout: Duration::from_secs(600),
            min_labels: 8,
        }
    }

    pub fn training_command(&self, task_type: &str) -> Option<&CommandTemplate> {
        self.train_commands.get(task_type)
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self::for_project("python3", "../AeroVision-V1")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    pub min_vram_gb: f64,
    pub min_ram_gb: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            min_vram_gb: 10.0,
            min_ram_gb: 4.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub capacity: usize,
    /// Terminal entries kept for status queries before the oldest is evicted.
    pub history_limit: usize,
    pub wake_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            history_limit: 100,
            wake_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub schedule_hour: u32,
    /// IANA zone name; host local time when unset.
    pub timezone: Option<String>,
    pub poll_interval: Duration,
    pub primary_task: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule_hour: 2,
            timezone: None,
            poll_interval: Duration::from_secs(60),
            primary_task: "aircraft".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub http_addr: String,
    pub storage: StorageConfig,
    pub training: TrainingConfig,
    pub admission: AdmissionConfig,
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub join_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            http_addr: "0.0.0.0:8090".to_string(),
            storage: StorageConfig::default(),
            training: TrainingConfig::default(),
            admission: AdmissionConfig::default(),
            queue: QueueConfig::default(),
            scheduler: SchedulerConfig::default(),
            join_timeout: Duration::from_secs(5),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = AppConfig::default();

        let python = env_string("AEROTRAIN_PYTHON", "python3");
        let project_dir = env_string("AEROTRAIN_PROJECT_DIR", "../AeroVision-V1");
        let mut training = TrainingConfig::for_project(&python, &project_dir);
        training.params = TrainingParams {
            epochs: env_parse("AEROTRAIN_EPOCHS").unwrap_or(training.params.epochs),
            batch_size: env_parse("AEROTRAIN_BATCH_SIZE").unwrap_or(training.params.batch_size),
            imgsz: env_parse("AEROTRAIN_IMGSZ").unwrap_or(training.params.imgsz),
            device: env_string("AEROTRAIN_DEVICE", &training.params.device),
        };
        if let Some(secs) = env_parse("AEROTRAIN_TRAIN_TIMEOUT_SECS") {
            training.train_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("AEROTRAIN_EVAL_TIMEOUT_SECS") {
            training.eval_timeout = Duration::from_secs(secs);
        }
        training.min_labels = env_parse("AEROTRAIN_MIN_LABELS").unwrap_or(training.min_labels);
        for task in ["aircraft", "airline"] {
            let key = format!("AEROTRAIN_TRAIN_CMD_{}", task.to_uppercase());
            if let Some(cmd) = std::env::var(&key).ok().and_then(|s| CommandTemplate::parse(&s)) {
                training.train_commands.insert(task.to_string(), cmd);
            }
        }
        if let Some(cmd) = std::env::var("AEROTRAIN_EVAL_CMD")
            .ok()
            .and_then(|s| CommandTemplate::parse(&s))
        {
            training.eval_command = cmd;
        }

        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            http_addr: env_string("AEROTRAIN_HTTP_ADDR", &defaults.http_addr),
            storage: StorageConfig {
                labeled_dir: env_string("AEROTRAIN_LABELED_DIR", "storage/labeled").into(),
                temp_dir: env_string("AEROTRAIN_TEMP_DIR", "storage/tmp").into(),
                models_dir: env_string("AEROTRAIN_MODELS_DIR", "storage/models").into(),
            },
            training,
            admission: AdmissionConfig {
                min_vram_gb: env_parse("AEROTRAIN_MIN_VRAM_GB")
                    .unwrap_or(defaults.admission.min_vram_gb),
                min_ram_gb: env_parse("AEROTRAIN_MIN_RAM_GB")
                    .unwrap_or(defaults.admission.min_ram_gb),
            },
            queue: QueueConfig {
                capacity: env_parse("AEROTRAIN_QUEUE_CAPACITY").unwrap_or(defaults.queue.capacity),
                history_limit: env_parse("AEROTRAIN_QUEUE_HISTORY")
                    .unwrap_or(defaults.queue.history_limit),
                wake_interval: env_parse("AEROTRAIN_QUEUE_WAKE_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.queue.wake_interval),
            },
            scheduler: SchedulerConfig {
                enabled: std::env::var("AEROTRAIN_SCHEDULER_ENABLED")
                    .map(|v| v != "false")
                    .unwrap_or(true),
                schedule_hour: env_parse::<u32>("AEROTRAIN_SCHEDULE_HOUR")
                    .filter(|h| *h < 24)
                    .unwrap_or(defaults.scheduler.schedule_hour),
                timezone: std::env::var("AEROTRAIN_SCHEDULE_TZ")
                    .ok()
                    .filter(|s| !s.is_empty()),
                poll_interval: env_parse("AEROTRAIN_SCHEDULE_POLL_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.scheduler.poll_interval),
                primary_task: env_string("AEROTRAIN_PRIMARY_TASK", "aircraft"),
            },
            join_timeout: env_parse("AEROTRAIN_JOIN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.join_timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_reasonable() {
        let config = AppConfig::default();
        assert_eq!(config.queue.capacity, 10);
        assert_eq!(config.training.min_labels, 8);
        assert_eq!(config.training.train_timeout, Duration::from_secs(3600));
        assert_eq!(config.training.eval_timeout, Duration::from_secs(600));
        assert_eq!(config.scheduler.schedule_hour, 2);
        assert_eq!(config.admission.min_vram_gb, 10.0);
    }

    #[test]
    fn maps_task_types_to_training_scripts() {
        let training = TrainingConfig::for_project("python3", "/opt/aero");
        let aircraft = training.training_command("aircraft").unwrap();
        assert_eq!(aircraft.program, "python3");
        assert_eq!(aircraft.args, vec!["/opt/aero/training/scripts/train_classify.py"]);
        assert!(training.training_command("airline").is_some());
        assert!(training.training_command("vehicle").is_none());
    }

    #[test]
    fn parses_command_lines() {
        let cmd = CommandTemplate::parse("  /bin/sh  /tmp/train.sh ").unwrap();
        assert_eq!(cmd.program, "/bin/sh");
        assert_eq!(cmd.args, vec!["/tmp/train.sh"]);
        assert!(CommandTemplate::parse("   ").is_none());
    }
}
