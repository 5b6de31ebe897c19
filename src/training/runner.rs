//! Stage runner
//!
//! Launches one external pipeline step as a subprocess with an explicit
//! working directory, search paths and environment, streams its output
//! line-by-line and returns the captured text. The runner never interprets
//! what a step does; callers check the step's output files themselves.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::error::{VoiceError, VoiceResult};

/// Lines of stderr kept in a `StageExecutionError`
const STDERR_TAIL_LINES: usize = 40;

/// How long to wait for output readers after the process is gone
const READER_GRACE: Duration = Duration::from_secs(2);

/// Callback receiving every output line of a running step
pub type LineCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Description of one subprocess invocation
#[derive(Clone)]
pub struct StageCommand {
    pub stage: String,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
    pub search_path_var: String,
    pub search_paths: Vec<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub on_line: Option<LineCallback>,
}

impl StageCommand {
    pub fn new(stage: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            stage: stage.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            search_path_var: "PYTHONPATH".to_string(),
            search_paths: Vec::new(),
            env: Vec::new(),
            timeout: None,
            on_line: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Paths prepended to `var` (e.g. PYTHONPATH) ahead of any inherited value
    pub fn search_paths(mut self, var: impl Into<String>, paths: Vec<PathBuf>) -> Self {
        self.search_path_var = var.into();
        self.search_paths = paths;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_line(mut self, callback: LineCallback) -> Self {
        self.on_line = Some(callback);
        self
    }
}

impl std::fmt::Debug for StageCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageCommand")
            .field("stage", &self.stage)
            .field("program", &self.program)
            .field("args", &self.args)
            .field("working_dir", &self.working_dir)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Captured result of a step that exited successfully
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl StageOutput {
    /// Last `n` lines of stdout followed by stderr, for diagnostics
    pub fn tail(&self, n: usize) -> String {
        format!(
            "stdout:\n{}\nstderr:\n{}",
            tail_lines(&self.stdout, n),
            tail_lines(&self.stderr, n)
        )
    }
}

/// Last `n` lines of a block of text
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

fn joined_search_path(var: &str, paths: &[PathBuf]) -> Option<OsString> {
    let mut all: Vec<PathBuf> = paths.to_vec();
    if let Some(existing) = std::env::var_os(var) {
        all.extend(std::env::split_paths(&existing));
    }
    std::env::join_paths(all).ok()
}

fn read_lines<R>(reader: R, stage: String, on_line: Option<LineCallback>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut captured = String::new();
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']);
                    crate::stage_line!(stage, "{}", line);
                    if let Some(callback) = &on_line {
                        callback(line);
                    }
                    captured.push_str(line);
                    captured.push('\n');
                }
                Err(e) => {
                    log::warn!("[{}] Failed to read process output: {}", stage, e);
                    break;
                }
            }
        }

        captured
    })
}

async fn finish_reader(handle: JoinHandle<String>) -> String {
    let abort = handle.abort_handle();
    match tokio::time::timeout(READER_GRACE, handle).await {
        Ok(Ok(text)) => text,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            abort.abort();
            String::new()
        }
    }
}

fn launch_error(command: &StageCommand, message: impl Into<String>) -> VoiceError {
    VoiceError::StageLaunchError {
        stage: command.stage.clone(),
        message: message.into(),
    }
}

/// Run one step to completion
pub async fn run_stage(command: StageCommand) -> VoiceResult<StageOutput> {
    if let Some(dir) = &command.working_dir {
        if !dir.is_dir() {
            return Err(launch_error(
                &command,
                format!("working directory {} does not exist", dir.display()),
            ));
        }
    }

    log::info!(
        "[{}] Launching {} {:?}",
        command.stage,
        command.program.display(),
        command.args
    );

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = &command.working_dir {
        cmd.current_dir(dir);
    }
    if !command.search_paths.is_empty() {
        if let Some(value) = joined_search_path(&command.search_path_var, &command.search_paths) {
            cmd.env(&command.search_path_var, value);
        }
    }
    for (key, value) in &command.env {
        crate::stage_trace!(command.stage, "env {}={}", key, value);
        cmd.env(key, value);
    }

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|e| {
        launch_error(
            &command,
            format!("failed to start {}: {}", command.program.display(), e),
        )
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| launch_error(&command, "failed to capture stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| launch_error(&command, "failed to capture stderr"))?;

    let stdout_task = read_lines(stdout, command.stage.clone(), command.on_line.clone());
    let stderr_task = read_lines(stderr, command.stage.clone(), command.on_line.clone());

    let waited = match command.timeout {
        Some(limit) => tokio::time::timeout(limit, child.wait()).await.ok(),
        None => Some(child.wait().await),
    };

    let Some(status) = waited else {
        let limit = command.timeout.unwrap_or_default();
        log::error!(
            "[{}] Timed out after {:.1}s, killing process",
            command.stage,
            limit.as_secs_f64()
        );
        let _ = child.kill().await;
        let stderr_text = finish_reader(stderr_task).await;
        stdout_task.abort();
        return Err(VoiceError::StageExecutionError {
            stage: command.stage.clone(),
            exit_code: None,
            stderr: format!(
                "timed out after {:.1}s\n{}",
                limit.as_secs_f64(),
                tail_lines(&stderr_text, STDERR_TAIL_LINES)
            ),
        });
    };

    let status = status.map_err(|e| VoiceError::StageExecutionError {
        stage: command.stage.clone(),
        exit_code: None,
        stderr: format!("failed to wait for process: {}", e),
    })?;

    let output = StageOutput {
        exit_code: status.code(),
        stdout: finish_reader(stdout_task).await,
        stderr: finish_reader(stderr_task).await,
        elapsed: started.elapsed(),
    };

    if !status.success() {
        log::error!(
            "[{}] Exited with {:?} after {:.1}s",
            command.stage,
            output.exit_code,
            output.elapsed.as_secs_f64()
        );
        return Err(VoiceError::StageExecutionError {
            stage: command.stage.clone(),
            exit_code: output.exit_code,
            stderr: tail_lines(&output.stderr, STDERR_TAIL_LINES),
        });
    }

    log::info!(
        "[{}] Finished in {:.1}s",
        command.stage,
        output.elapsed.as_secs_f64()
    );
    Ok(output)
}

/// Path argument helper
pub fn path_arg(path: &Path) -> OsString {
    path.as_os_str().to_os_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn sh(stage: &str, script: &str) -> StageCommand {
        StageCommand::new(stage, "sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_captures_output_and_environment() {
        let dir = tempdir().unwrap();
        let command = sh("echo", "echo \"$STAGE_VALUE\"; pwd; echo oops >&2")
            .working_dir(dir.path())
            .env("STAGE_VALUE", "hello");

        let output = run_stage(command).await.unwrap();
        assert_eq!(output.exit_code, Some(0));
        let mut lines = output.stdout.lines();
        assert_eq!(lines.next(), Some("hello"));
        let cwd = PathBuf::from(lines.next().unwrap());
        assert_eq!(
            cwd.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_search_paths_are_prepended() {
        let command = sh("path", "echo \"$VOICE_TEST_PATH\"")
            .search_paths("VOICE_TEST_PATH", vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        let output = run_stage(command).await.unwrap();
        assert!(output.stdout.trim().starts_with("/a:/b"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_execution_error() {
        let err = run_stage(sh("fail", "echo broken >&2; exit 3")).await.unwrap_err();
        match err {
            VoiceError::StageExecutionError {
                stage,
                exit_code,
                stderr,
            } => {
                assert_eq!(stage, "fail");
                assert_eq!(exit_code, Some(3));
                assert!(stderr.contains("broken"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_error() {
        let err = run_stage(StageCommand::new("missing", "/nonexistent/bin/python"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "stage_launch_error");
    }

    #[tokio::test]
    async fn test_missing_working_dir_is_launch_error() {
        let err = run_stage(sh("cwd", "true").working_dir("/nonexistent/toolkit"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "stage_launch_error");
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let started = Instant::now();
        let err = run_stage(sh("slow", "exec sleep 30").timeout(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        match err {
            VoiceError::StageExecutionError { exit_code, stderr, .. } => {
                assert_eq!(exit_code, None);
                assert!(stderr.contains("timed out"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_line_callback_sees_every_line() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let command = sh("lines", "echo one; echo two").on_line(Arc::new(move |line: &str| {
            sink.lock().unwrap().push(line.to_string());
        }));

        run_stage(command).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["one", "two"]);
    }

    #[test]
    fn test_tail_lines() {
        assert_eq!(tail_lines("a\nb\nc\n", 2), "b\nc");
        assert_eq!(tail_lines("a", 5), "a");
    }
}
