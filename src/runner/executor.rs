//! External task executor invocation.
//!
//! One [`ExecutorClient::run`] call is one stage attempt: pipe the prompt
//! on stdin, stream stdout/stderr, enforce a wall-clock timeout, append
//! raw request and response to the invocation log before any parsing,
//! and classify the response. Rate-limited responses sleep out the
//! extracted wait (plus buffer) and retry exactly once; a second limit
//! degrades to an ordinary stage error. Timeouts are reported distinctly
//! and never re-enter the rate-limit path.

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::time::{Duration, timeout};

use crate::config::ExecutorProfile;
use crate::errors::RunnerError;
use crate::runner::payload::{Classified, StageRequest, StageResult, classify_response};
use crate::runner::rate_limit;
use crate::util;

pub struct ExecutorClient {
    profile: ExecutorProfile,
    timeout_secs: u64,
    log_dir: PathBuf,
    seq: AtomicU32,
}

impl ExecutorClient {
    pub fn new(profile: ExecutorProfile, timeout_secs: u64, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            profile,
            timeout_secs,
            log_dir: log_dir.into(),
            seq: AtomicU32::new(0),
        }
    }

    /// Run one stage request to a settled result.
    pub async fn run(&self, request: &StageRequest) -> Result<StageResult, RunnerError> {
        let log_path = self.next_log_path(&request.stage_id);

        match self.invoke_settled(request, &log_path).await? {
            Classified::Success(value) => Ok(StageResult::success(value)),
            Classified::Error(msg) => Ok(StageResult::error(msg)),
            Classified::RateLimit { body } => {
                let wait = rate_limit::backoff_secs(&body);
                eprintln!(
                    "[runner] {} rate limited, waiting {} before the retry",
                    request.stage_id,
                    util::format_duration_secs(wait)
                );
                self.append_log(
                    &log_path,
                    &format!("==== rate limited, sleeping {wait}s ====\n"),
                )?;
                tokio::time::sleep(Duration::from_secs(wait)).await;

                match self.invoke_settled(request, &log_path).await? {
                    Classified::Success(value) => Ok(StageResult::success(value)),
                    Classified::Error(msg) => Ok(StageResult::error(msg)),
                    Classified::RateLimit { .. } => {
                        Ok(StageResult::error("still rate limited after one retry"))
                    }
                }
            }
        }
    }

    /// Invoke once, folding a wall-clock timeout into a settled error.
    /// Timeouts bypass classification entirely, so they can never be
    /// mistaken for (and retried as) rate limiting.
    async fn invoke_settled(
        &self,
        request: &StageRequest,
        log_path: &Path,
    ) -> Result<Classified, RunnerError> {
        match self.invoke(request, log_path).await {
            Ok(classified) => Ok(classified),
            Err(RunnerError::Timeout { secs }) => {
                Ok(Classified::Error(format!("timeout after {secs}s")))
            }
            Err(e) => Err(e),
        }
    }

    /// One spawn of the executor. Returns the classification of its
    /// response; a wall-clock timeout surfaces as a settled error result
    /// so callers never confuse it with rate limiting.
    async fn invoke(
        &self,
        request: &StageRequest,
        log_path: &Path,
    ) -> Result<Classified, RunnerError> {
        let model = self.profile.model_for(request.tier).to_string();
        self.append_log(
            log_path,
            &format!(
                "==== request {} @ {} (tier {}, model {}) ====\n{}\n",
                request.stage_id,
                chrono::Utc::now().to_rfc3339(),
                request.tier,
                model,
                request.prompt
            ),
        )?;

        let mut cmd = Command::new(&self.profile.command);
        cmd.args(self.command_args(&model))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = std::time::Instant::now();
        let mut child = cmd.spawn().map_err(RunnerError::SpawnFailed)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.prompt.as_bytes())
                .await
                .context("Failed to write prompt to executor stdin")?;
            // dropping stdin sends EOF
        }

        let out_task = tokio::spawn(collect_lines(child.stdout.take()));
        let err_task = tokio::spawn(collect_lines(child.stderr.take()));

        let status = match timeout(Duration::from_secs(self.timeout_secs), child.wait()).await {
            Ok(waited) => waited.context("Failed to wait on executor process")?,
            Err(_) => {
                let _ = child.kill().await;
                self.append_log(
                    log_path,
                    &format!("==== timed out after {}s ====\n", self.timeout_secs),
                )?;
                return Err(RunnerError::Timeout {
                    secs: self.timeout_secs,
                });
            }
        };

        let stdout_text = out_task.await.unwrap_or_default();
        let stderr_text = err_task.await.unwrap_or_default();

        let code = status.code().unwrap_or(-1);
        let mut entry = format!(
            "==== response (exit {code}, {}s) ====\n{stdout_text}",
            started.elapsed().as_secs()
        );
        if !stderr_text.is_empty() {
            entry.push_str(&format!("---- stderr ----\n{stderr_text}"));
        }
        // the raw exchange is on disk before parsing can fail
        self.append_log(log_path, &entry)?;

        Ok(classify_response(status.success(), &stdout_text, &stderr_text))
    }

    fn command_args(&self, model: &str) -> Vec<String> {
        let mut args = self.profile.base_args.clone();
        args.push("--model".to_string());
        args.push(model.to_string());
        args
    }

    /// Each invocation gets its own sequenced log file.
    fn next_log_path(&self, stage_id: &str) -> PathBuf {
        let n = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.log_dir.join(format!("{n:03}-{stage_id}.log"))
    }

    fn append_log(&self, path: &Path, entry: &str) -> Result<(), RunnerError> {
        use std::io::Write;
        let map_err = |source: std::io::Error| RunnerError::LogWriteFailed {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(map_err)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(map_err)?;
        file.write_all(entry.as_bytes()).map_err(map_err)
    }
}

async fn collect_lines<R>(stream: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return String::new();
    };
    let mut lines = BufReader::new(stream).lines();
    let mut collected = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        collected.push_str(&line);
        collected.push('\n');
    }
    collected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::Tier;
    use tempfile::tempdir;

    fn client_with(dir: &Path, command: &str, timeout_secs: u64) -> ExecutorClient {
        let profile = ExecutorProfile {
            command: command.to_string(),
            base_args: Vec::new(),
            ..ExecutorProfile::default()
        };
        ExecutorClient::new(profile, timeout_secs, dir.join("logs"))
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    #[test]
    fn test_log_paths_are_sequenced_per_invocation() {
        let dir = tempdir().unwrap();
        let client = client_with(dir.path(), "claude", 60);
        assert!(
            client
                .next_log_path("plan")
                .ends_with(Path::new("001-plan.log"))
        );
        assert!(
            client
                .next_log_path("implement-task-1")
                .ends_with(Path::new("002-implement-task-1.log"))
        );
        assert!(
            client
                .next_log_path("plan")
                .ends_with(Path::new("003-plan.log"))
        );
    }

    #[test]
    fn test_command_args_append_model_for_tier() {
        let dir = tempdir().unwrap();
        let profile = ExecutorProfile::default();
        let client = ExecutorClient::new(profile, 60, dir.path());
        let args = client.command_args("sonnet");
        assert!(args.contains(&"--print".to_string()));
        assert_eq!(args[args.len() - 2..], ["--model", "sonnet"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_extracts_payload_and_logs_raw_exchange() {
        let dir = tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "fake-executor.sh",
            "#!/bin/sh\ncat > /dev/null\ncat <<'EOF'\n{\"status\": \"success\", \"result\": \"done {\\\"ok\\\": true}\"}\nEOF\n",
        );
        let client = client_with(dir.path(), &script, 30);
        let request = StageRequest::new("plan", "plan the work", "{}", Tier::Standard);

        let result = client.run(&request).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.payload["ok"], true);

        let log = std::fs::read_to_string(dir.path().join("logs/001-plan.log")).unwrap();
        assert!(log.contains("==== request plan"));
        assert!(log.contains("plan the work"));
        assert!(log.contains("==== response (exit 0"));
        assert!(log.contains("\"status\": \"success\""));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_reports_timeout_distinctly() {
        let dir = tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "slow-executor.sh",
            "#!/bin/sh\ncat > /dev/null\nsleep 5\n",
        );
        let client = client_with(dir.path(), &script, 1);
        let request = StageRequest::new("research", "look around", "{}", Tier::Light);

        let result = client.run(&request).await.unwrap();
        assert!(!result.is_success());
        let msg = result.error_message.unwrap();
        assert!(msg.contains("timeout after 1s"), "got: {msg}");

        let log = std::fs::read_to_string(dir.path().join("logs/001-research.log")).unwrap();
        assert!(log.contains("timed out after 1s"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_maps_nonzero_exit_to_stage_error() {
        let dir = tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "failing-executor.sh",
            "#!/bin/sh\ncat > /dev/null\necho 'adapter wiring failed' >&2\nexit 1\n",
        );
        let client = client_with(dir.path(), &script, 30);
        let request = StageRequest::new("docs", "write docs", "{}", Tier::Light);

        let result = client.run(&request).await.unwrap();
        assert!(!result.is_success());
        assert!(result.error_message.unwrap().contains("adapter wiring failed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_executor_is_a_spawn_error() {
        let dir = tempdir().unwrap();
        let client = client_with(dir.path(), "/nonexistent/executor-binary", 30);
        let request = StageRequest::new("setup", "hello", "{}", Tier::Light);

        let err = client.run(&request).await.unwrap_err();
        assert!(matches!(err, RunnerError::SpawnFailed(_)));
    }
}
