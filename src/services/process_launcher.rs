use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::CommandTemplate;

/// Output kept from each stream; training scripts can be very chatty.
const MAX_CAPTURE_BYTES: usize = 256 * 1024;
const READER_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl ProcessSpec {
    pub fn from_template(
        template: &CommandTemplate,
        extra_args: impl IntoIterator<Item = String>,
        timeout: Duration,
    ) -> Self {
        let mut args = template.args.clone();
        args.extend(extra_args);
        Self {
            program: template.program.clone(),
            args,
            timeout,
        }
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessEnd {
    Exited,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessOutput {
    pub end: ProcessEnd,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.end == ProcessEnd::Exited && self.exit_code == Some(0)
    }
}

#[async_trait::async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Runs a child to completion, timeout or cancellation. Spawn failures are errors;
    /// everything after spawn is reported through `ProcessOutput`.
    async fn run(
        &self,
        spec: ProcessSpec,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ProcessOutput>;
}

/// Launches children in their own process group so the whole tree can be killed.
pub struct TokioProcessLauncher;

async fn read_capped<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() > MAX_CAPTURE_BYTES {
                    // keep the tail, that is where tracebacks end up
                    let excess = buf.len() - MAX_CAPTURE_BYTES;
                    buf.drain(..excess);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "launcher: error reading child output");
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(unix)]
fn kill_tree(child: &mut tokio::process::Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if let Some(pid) = child.id()
        && let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL)
    {
        tracing::warn!(pid, error = %e, "launcher: failed to kill process group");
    }
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn kill_tree(child: &mut tokio::process::Child) {
    let _ = child.start_kill();
}

async fn join_reader(handle: Option<tokio::task::JoinHandle<String>>) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(READER_GRACE, handle).await {
        Ok(Ok(text)) => text,
        _ => String::new(),
    }
}

#[async_trait::async_trait]
impl ProcessLauncher for TokioProcessLauncher {
    async fn run(
        &self,
        spec: ProcessSpec,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ProcessOutput> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn `{}`: {e}", spec.program))?;

        let stdout = child.stdout.take().map(|s| tokio::spawn(read_capped(s)));
        let stderr = child.stderr.take().map(|s| tokio::spawn(read_capped(s)));

        let (end, status) = tokio::select! {
            status = child.wait() => (ProcessEnd::Exited, status),
            _ = tokio::time::sleep(spec.timeout) => {
                tracing::warn!(
                    timeout_secs = spec.timeout.as_secs(),
                    command = %spec.display(),
                    "launcher: child timed out, killing"
                );
                kill_tree(&mut child);
                (ProcessEnd::TimedOut, child.wait().await)
            }
            _ = cancel.cancelled() => {
                tracing::warn!(command = %spec.display(), "launcher: shutdown requested, killing child");
                kill_tree(&mut child);
                (ProcessEnd::Cancelled, child.wait().await)
            }
        };

        let exit_code = match status {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::warn!(error = %e, "launcher: failed to wait for child");
                None
            }
        };

        Ok(ProcessOutput {
            end,
            exit_code,
            stdout: join_reader(stdout).await,
            stderr: join_reader(stderr).await,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration) -> ProcessSpec {
        ProcessSpec {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            timeout,
        }
    }

    #[tokio::test]
    async fn captures_streams_and_exit_code() {
        let out = TokioProcessLauncher
            .run(
                sh("echo hello; echo oops >&2; exit 3", Duration::from_secs(10)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out.end, ProcessEnd::Exited);
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success());
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn kills_child_on_timeout() {
        let started = std::time::Instant::now();
        let out = TokioProcessLauncher
            .run(
                sh("echo started; sleep 30", Duration::from_millis(200)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out.end, ProcessEnd::TimedOut);
        assert!(!out.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn kills_child_on_cancel() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let out = TokioProcessLauncher
            .run(sh("sleep 30", Duration::from_secs(60)), &cancel)
            .await
            .unwrap();
        assert_eq!(out.end, ProcessEnd::Cancelled);
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let spec = ProcessSpec {
            program: "/nonexistent/aerotrain-train".into(),
            args: vec![],
            timeout: Duration::from_secs(1),
        };
        let err = TokioProcessLauncher
            .run(spec, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[test]
    fn template_args_precede_contract_flags() {
        let template = CommandTemplate::new("python3", ["train.py"]);
        let spec = ProcessSpec::from_template(
            &template,
            ["--epochs".to_string(), "5".to_string()],
            Duration::from_secs(1),
        );
        assert_eq!(spec.display(), "python3 train.py --epochs 5");
    }
}
