//! Process runner: launches a command (pipe, PTY, or sandboxed container
//! exec), aggregates its output with a bounded tail buffer plus on-disk
//! spillover for oversized output, enforces a timing-wheel-driven
//! timeout (SIGTERM, then SIGKILL after a grace period), and honors a
//! [`CancellationToken`] for caller-initiated aborts unless the task has
//! been backgrounded.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use openclaw_clock::{CancellationToken, SharedClock};
use openclaw_timewheel::TimingWheel;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

pub const DEFAULT_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 5_000;
pub const DEFAULT_MAX_AGGREGATED_BYTES: usize = 1024 * 1024;
pub const DEFAULT_TAIL_LINES: usize = 200;

/// Device Status Report cursor-position query a terminal client may send
/// a PTY; real terminals answer it, so a canned reply keeps programs
/// that probe for one from hanging.
const DSR_QUERY: &[u8] = b"\x1b[6n";
const DSR_REPLY: &[u8] = b"\x1b[1;1R";

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("command cancelled")]
    Cancelled,
}

pub type ProcessResult<T> = Result<T, ProcessError>;

/// Mutually exclusive process launch strategies (spec.md's "Sandbox",
/// "PTY", and "Pipe" variants).
#[derive(Debug, Clone)]
pub enum LaunchMode {
    /// Plain spawn with separate stdout/stderr pipes.
    Pipe,
    /// Spawn attached to a pseudo-terminal; falls back to `Pipe` with a
    /// warning if the platform can't allocate one.
    Pty { cols: u16, rows: u16 },
    /// `docker exec` into a pre-provisioned container.
    Sandbox {
        container_id: String,
        container_workdir: Option<String>,
        tty: bool,
    },
}

impl Default for LaunchMode {
    fn default() -> Self {
        LaunchMode::Pipe
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub command: String,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub timeout_ms: u64,
    pub grace_period_ms: u64,
    pub max_aggregated_bytes: usize,
    pub tail_lines: usize,
    pub background: bool,
    pub launch: LaunchMode,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            cwd: PathBuf::from("."),
            env: Vec::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            max_aggregated_bytes: DEFAULT_MAX_AGGREGATED_BYTES,
            tail_lines: DEFAULT_TAIL_LINES,
            background: false,
            launch: LaunchMode::Pipe,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Completed,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub kind: OutcomeKind,
    pub exit_code: Option<i32>,
    pub aggregated_output: String,
    pub tail: Vec<String>,
    pub spillover_path: Option<PathBuf>,
    pub truncated: bool,
    pub duration_ms: i64,
    /// Set when the final output was a `data:image/...;base64,...` URI;
    /// `aggregated_output`/`tail` then carry a placeholder instead.
    pub image_data_uri: Option<String>,
    /// Set when a PTY launch failed and the runner fell back to a plain
    /// pipe spawn.
    pub warning: Option<String>,
}

/// Scrubs bytes that aren't valid UTF-8 text, replacing runs of binary
/// data with a placeholder rather than corrupting the aggregated log.
fn scrub_binary(bytes: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if text.contains('\u{FFFD}') {
        text = text.replace('\u{FFFD}', "");
        text.push_str("\n[binary output scrubbed]");
    }
    text
}

fn spillover_path(pid: u32, now_ms: i64) -> PathBuf {
    let dir = std::env::temp_dir();
    dir.join(format!("openclaw-exec-output-{now_ms}-{pid}.txt"))
}

fn tail_lines(text: &str, n: usize) -> Vec<String> {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(n);
    all[start..].iter().map(|s| s.to_string()).collect()
}

const IMAGE_DATA_URI_PREFIXES: [&str; 4] = [
    "data:image/png;base64,",
    "data:image/jpeg;base64,",
    "data:image/gif;base64,",
    "data:image/webp;base64,",
];

/// Splits an image data URI out of the final output, leaving a short
/// placeholder in its place.
fn extract_image_data_uri(output: &str) -> Option<(String, String)> {
    let trimmed = output.trim_start();
    IMAGE_DATA_URI_PREFIXES
        .iter()
        .find(|prefix| trimmed.starts_with(*prefix))
        .map(|_| (trimmed.to_string(), "[image output omitted from text aggregate]".to_string()))
}

/// Splits a base64 image data URI into chunks no larger than
/// `chunk_size`, so downstream transports with message-size limits can
/// stream large images without buffering the whole payload.
pub fn split_data_uri(data_uri: &str, chunk_size: usize) -> Vec<String> {
    if chunk_size == 0 {
        return vec![data_uri.to_string()];
    }
    data_uri
        .as_bytes()
        .chunks(chunk_size)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect()
}

pub fn encode_image_data_uri(bytes: &[u8], mime_type: &str) -> String {
    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    format!("data:{mime_type};base64,{encoded}")
}

pub struct ProcessRunner {
    clock: SharedClock,
    wheel: Arc<TimingWheel>,
}

impl ProcessRunner {
    pub fn new(clock: SharedClock, wheel: Arc<TimingWheel>) -> Self {
        Self { clock, wheel }
    }

    pub async fn run(
        &self,
        config: RunConfig,
        cancellation: CancellationToken,
    ) -> ProcessResult<RunOutcome> {
        match &config.launch {
            LaunchMode::Pty { cols, rows } => {
                let cols = *cols;
                let rows = *rows;
                match self.run_pty(&config, &cancellation, cols, rows).await {
                    Ok(outcome) => Ok(outcome),
                    Err(err) => {
                        tracing::warn!(error = %err, "pty launch failed, falling back to pipe");
                        let mut fallback = self.run_piped(&config, &cancellation, None).await?;
                        fallback.warning =
                            Some(format!("pty unavailable ({err}), ran via pipe instead"));
                        Ok(fallback)
                    }
                }
            }
            LaunchMode::Sandbox {
                container_id,
                container_workdir,
                tty,
            } => {
                let cmd = build_sandbox_command(
                    container_id,
                    container_workdir.as_deref(),
                    *tty,
                    &config.command,
                    &config.env,
                );
                self.run_piped(&config, &cancellation, Some(cmd)).await
            }
            LaunchMode::Pipe => self.run_piped(&config, &cancellation, None).await,
        }
    }

    async fn run_piped(
        &self,
        config: &RunConfig,
        cancellation: &CancellationToken,
        prebuilt: Option<Command>,
    ) -> ProcessResult<RunOutcome> {
        let started_at = self.clock.now_ms();
        let mut cmd = prebuilt.unwrap_or_else(|| build_shell_command(&config.command));
        cmd.current_dir(&config.cwd);
        for (k, v) in &config.env {
            cmd.env(k, v);
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(ProcessError::Spawn)?;
        let pid = child.id().unwrap_or(0);
        tracing::debug!(pid, timeout_ms = config.timeout_ms, "process spawned");

        let timeout_id = format!("proc-timeout-{pid}-{started_at}");
        let (timeout_tx, mut timeout_rx) = mpsc::channel::<()>(1);
        self.wheel.schedule_timeout(&timeout_id, config.timeout_ms, {
            let tx = timeout_tx.clone();
            Arc::new(move || {
                let _ = tx.try_send(());
            })
        });

        let mut stdout = child.stdout.take().expect("piped stdout");
        let mut stderr = child.stderr.take().expect("piped stderr");
        let max_bytes = config.max_aggregated_bytes;

        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        });

        let outcome = loop {
            tokio::select! {
                status = child.wait() => {
                    self.wheel.cancel_timeout(&timeout_id);
                    let status = status?;
                    break self.finish(
                        OutcomeKind::Completed,
                        status.code(),
                        stdout_task,
                        stderr_task,
                        pid,
                        started_at,
                        max_bytes,
                        config.tail_lines,
                    ).await?;
                }
                _ = timeout_rx.recv() => {
                    tracing::warn!(pid, "process exceeded timeout, terminating");
                    self.terminate_gracefully(&mut child, config.grace_period_ms).await;
                    break self.finish(
                        OutcomeKind::TimedOut,
                        None,
                        stdout_task,
                        stderr_task,
                        pid,
                        started_at,
                        max_bytes,
                        config.tail_lines,
                    ).await?;
                }
                _ = self.poll_cancelled(cancellation), if !config.background => {
                    self.terminate_gracefully(&mut child, config.grace_period_ms).await;
                    self.wheel.cancel_timeout(&timeout_id);
                    break self.finish(
                        OutcomeKind::Cancelled,
                        None,
                        stdout_task,
                        stderr_task,
                        pid,
                        started_at,
                        max_bytes,
                        config.tail_lines,
                    ).await?;
                }
            }
        };

        Ok(outcome)
    }

    /// Spawns the command on a pseudo-terminal. `portable_pty`'s API is
    /// synchronous, so the master read/write loop and child wait run on
    /// a blocking thread and are bridged back to async via channels.
    async fn run_pty(
        &self,
        config: &RunConfig,
        cancellation: &CancellationToken,
        cols: u16,
        rows: u16,
    ) -> ProcessResult<RunOutcome> {
        use portable_pty::{native_pty_system, CommandBuilder, PtySize};

        let started_at = self.clock.now_ms();
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ProcessError::Spawn(std::io::Error::other(e)))?;

        let mut builder = CommandBuilder::new("sh");
        builder.arg("-c");
        builder.arg(&config.command);
        builder.cwd(&config.cwd);
        for (k, v) in &config.env {
            builder.env(k, v);
        }

        let mut child = pair
            .slave
            .spawn_command(builder)
            .map_err(|e| ProcessError::Spawn(std::io::Error::other(e)))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ProcessError::Spawn(std::io::Error::other(e)))?;
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| ProcessError::Spawn(std::io::Error::other(e)))?;

        let (output_tx, mut output_rx) = mpsc::channel::<Vec<u8>>(64);
        let (exit_tx, mut exit_rx) = mpsc::channel::<Option<i32>>(1);
        let (kill_tx, kill_rx) = std::sync::mpsc::channel::<()>();

        std::thread::spawn(move || {
            use std::io::{Read, Write};
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = &buf[..n];
                        if chunk.windows(DSR_QUERY.len()).any(|w| w == DSR_QUERY) {
                            let _ = writer.write_all(DSR_REPLY);
                        }
                        if output_tx.blocking_send(chunk.to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        std::thread::spawn(move || {
            loop {
                if kill_rx.try_recv().is_ok() {
                    let _ = child.kill();
                }
                match child.try_wait() {
                    Ok(Some(status)) => {
                        let _ = exit_tx.blocking_send(status.exit_code().try_into().ok());
                        return;
                    }
                    Ok(None) => std::thread::sleep(std::time::Duration::from_millis(20)),
                    Err(_) => {
                        let _ = exit_tx.blocking_send(None);
                        return;
                    }
                }
            }
        });

        let pid = 0u32;
        let timeout_id = format!("proc-pty-timeout-{started_at}");
        let (timeout_tx, mut timeout_rx) = mpsc::channel::<()>(1);
        self.wheel.schedule_timeout(&timeout_id, config.timeout_ms, {
            let tx = timeout_tx.clone();
            Arc::new(move || {
                let _ = tx.try_send(());
            })
        });

        let mut combined = Vec::new();
        let mut output_open = true;
        let kind;
        loop {
            tokio::select! {
                chunk = output_rx.recv(), if output_open => {
                    match chunk {
                        Some(bytes) => combined.extend_from_slice(&bytes),
                        None => output_open = false,
                    }
                }
                status = exit_rx.recv() => {
                    self.wheel.cancel_timeout(&timeout_id);
                    while let Ok(bytes) = output_rx.try_recv() {
                        combined.extend_from_slice(&bytes);
                    }
                    kind = OutcomeKind::Completed;
                    return self.finish_pty(kind, status.flatten(), combined, pid, started_at, config.max_aggregated_bytes, config.tail_lines);
                }
                _ = timeout_rx.recv() => {
                    tracing::warn!("pty process exceeded timeout, terminating");
                    let _ = kill_tx.send(());
                    let _ = tokio::time::timeout(
                        std::time::Duration::from_millis(config.grace_period_ms),
                        exit_rx.recv(),
                    ).await;
                    kind = OutcomeKind::TimedOut;
                    return self.finish_pty(kind, None, combined, pid, started_at, config.max_aggregated_bytes, config.tail_lines);
                }
                _ = self.poll_cancelled(cancellation), if !config.background => {
                    self.wheel.cancel_timeout(&timeout_id);
                    let _ = kill_tx.send(());
                    kind = OutcomeKind::Cancelled;
                    return self.finish_pty(kind, None, combined, pid, started_at, config.max_aggregated_bytes, config.tail_lines);
                }
            }
        }
    }

    fn finish_pty(
        &self,
        kind: OutcomeKind,
        exit_code: Option<i32>,
        raw: Vec<u8>,
        pid: u32,
        started_at: i64,
        max_bytes: usize,
        tail_lines_n: usize,
    ) -> ProcessResult<RunOutcome> {
        let combined = scrub_binary(&raw);
        Ok(self.package_output(kind, exit_code, combined, pid, started_at, max_bytes, tail_lines_n))
    }

    async fn poll_cancelled(&self, token: &CancellationToken) {
        loop {
            if token.is_cancelled() {
                return;
            }
            self.clock.sleep(20).await;
        }
    }

    async fn terminate_gracefully(&self, child: &mut Child, grace_period_ms: u64) {
        if let Some(pid) = child.id() {
            send_sigterm(pid);
        }
        let deadline = self.clock.now_ms() + grace_period_ms as i64;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => {}
                Err(_) => return,
            }
            if self.clock.now_ms() >= deadline {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return;
            }
            self.clock.sleep(50).await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        kind: OutcomeKind,
        exit_code: Option<i32>,
        stdout_task: tokio::task::JoinHandle<Vec<u8>>,
        stderr_task: tokio::task::JoinHandle<Vec<u8>>,
        pid: u32,
        started_at: i64,
        max_bytes: usize,
        tail_lines_n: usize,
    ) -> ProcessResult<RunOutcome> {
        let stdout_bytes = stdout_task.await.unwrap_or_default();
        let stderr_bytes = stderr_task.await.unwrap_or_default();

        let mut combined = scrub_binary(&stdout_bytes);
        let stderr_text = scrub_binary(&stderr_bytes);
        if !stderr_text.is_empty() {
            if !combined.is_empty() {
                combined.push_str("\n[stderr]\n");
            }
            combined.push_str(&stderr_text);
        }

        Ok(self.package_output(kind, exit_code, combined, pid, started_at, max_bytes, tail_lines_n))
    }

    #[allow(clippy::too_many_arguments)]
    fn package_output(
        &self,
        kind: OutcomeKind,
        exit_code: Option<i32>,
        combined: String,
        pid: u32,
        started_at: i64,
        max_bytes: usize,
        tail_lines_n: usize,
    ) -> RunOutcome {
        let (combined, image_data_uri) = match extract_image_data_uri(&combined) {
            Some((image, placeholder)) => (placeholder, Some(image)),
            None => (combined, None),
        };

        let total_len = combined.len();
        let mut spillover_path_opt = None;
        let truncated = total_len > max_bytes;
        let aggregated = if truncated {
            let path = spillover_path(pid, started_at);
            if let Ok(file) = std::fs::File::create(&path) {
                use std::io::Write;
                let mut file = file;
                let _ = file.write_all(combined.as_bytes());
            }
            spillover_path_opt = Some(path);
            combined[..max_bytes.min(combined.len())].to_string()
        } else {
            combined.clone()
        };

        let tail = tail_lines(&combined, tail_lines_n);
        let duration_ms = self.clock.now_ms() - started_at;

        RunOutcome {
            kind,
            exit_code,
            aggregated_output: aggregated,
            tail,
            spillover_path: spillover_path_opt,
            truncated,
            duration_ms,
            image_data_uri,
            warning: None,
        }
    }
}

fn build_shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.args(["-c", command]);
    cmd
}

/// Builds a `docker exec` invocation into a pre-provisioned container,
/// forwarding the computed env and optionally allocating a TTY.
fn build_sandbox_command(
    container_id: &str,
    container_workdir: Option<&str>,
    tty: bool,
    command: &str,
    env: &[(String, String)],
) -> Command {
    let mut cmd = Command::new("docker");
    cmd.arg("exec");
    if tty {
        cmd.arg("-t");
    }
    if let Some(workdir) = container_workdir {
        cmd.args(["-w", workdir]);
    }
    let env_map: HashMap<&str, &str> = env.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    for (k, v) in &env_map {
        cmd.arg("-e").arg(format!("{k}={v}"));
    }
    cmd.arg(container_id).args(["sh", "-c", command]);
    cmd
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    unsafe {
        libc_kill(pid as i32, 15);
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

#[cfg(unix)]
unsafe fn libc_kill(pid: i32, sig: i32) {
    extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    let _ = kill(pid, sig);
}

#[cfg(test)]
mod tests {
    use super::*;
    use openclaw_clock::real_clock;

    fn runner() -> ProcessRunner {
        let clock = real_clock();
        let wheel = Arc::new(TimingWheel::new(clock.clone()));
        wheel.start();
        ProcessRunner::new(clock, wheel)
    }

    #[tokio::test]
    async fn completes_and_captures_stdout() {
        let runner = runner();
        let config = RunConfig {
            command: "echo hello".to_string(),
            ..Default::default()
        };
        let outcome = runner.run(config, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Completed);
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.aggregated_output.contains("hello"));
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_reported() {
        let runner = runner();
        let config = RunConfig {
            command: "exit 7".to_string(),
            ..Default::default()
        };
        let outcome = runner.run(config, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.exit_code, Some(7));
    }

    #[tokio::test]
    async fn timeout_kills_long_running_process() {
        let runner = runner();
        let config = RunConfig {
            command: "sleep 30".to_string(),
            timeout_ms: 100,
            grace_period_ms: 50,
            ..Default::default()
        };
        let outcome = runner.run(config, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.kind, OutcomeKind::TimedOut);
    }

    #[tokio::test]
    async fn cancellation_token_aborts_unbackgrounded_task() {
        let runner = runner();
        let token = CancellationToken::new();
        let token_clone = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            token_clone.cancel();
        });
        let config = RunConfig {
            command: "sleep 30".to_string(),
            ..Default::default()
        };
        let outcome = runner.run(config, token).await.unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Cancelled);
    }

    #[tokio::test]
    async fn output_over_limit_spills_to_disk_and_truncates_aggregate() {
        let runner = runner();
        let config = RunConfig {
            command: "yes x | head -c 2000".to_string(),
            max_aggregated_bytes: 100,
            ..Default::default()
        };
        let outcome = runner.run(config, CancellationToken::new()).await.unwrap();
        assert!(outcome.truncated);
        assert!(outcome.spillover_path.is_some());
        assert!(outcome.aggregated_output.len() <= 100);
    }

    #[tokio::test]
    async fn image_data_uri_output_is_split_from_text_aggregate() {
        let runner = runner();
        let uri = encode_image_data_uri(b"fake-bytes", "image/png");
        let config = RunConfig {
            command: format!("printf '%s' '{uri}'"),
            ..Default::default()
        };
        let outcome = runner.run(config, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.image_data_uri.as_deref(), Some(uri.as_str()));
        assert!(!outcome.aggregated_output.contains("base64"));
    }

    #[test]
    fn sandbox_command_includes_exec_and_workdir() {
        let cmd = build_sandbox_command(
            "container-1",
            Some("/work"),
            false,
            "ls",
            &[("FOO".to_string(), "bar".to_string())],
        );
        let debug = format!("{cmd:?}");
        assert!(debug.contains("docker"));
        assert!(debug.contains("container-1"));
        assert!(debug.contains("/work"));
    }

    #[test]
    fn split_data_uri_splits_into_requested_chunk_sizes() {
        let uri = "data:image/png;base64,AAAAAAAAAA";
        let chunks = split_data_uri(uri, 10);
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), uri);
    }

    #[test]
    fn encode_image_data_uri_produces_valid_prefix() {
        let uri = encode_image_data_uri(b"hello", "image/png");
        assert!(uri.starts_with("data:image/png;base64,"));
    }
}
