//! External encoder supervision.
//!
//! One `run` call covers the whole lifecycle of an ffmpeg invocation:
//! spawn in its own process group, stream `-progress pipe:2` telemetry
//! off stderr, watch two independent deadlines (a wall-clock ceiling and
//! a no-progress stall), tear the whole process tree down when either
//! fires, classify the outcome, and leave reproducible failure artifacts
//! behind.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TimeoutKind;
use crate::{Error, Result};

/// Stderr lines retained for excerpts and failure artifacts.
const STDERR_TAIL_LINES: usize = 400;

/// Substrings that mark an encoder failure as unrecoverable for this
/// input, matched case-insensitively against stderr.
const PERMANENT_PATTERNS: &[&str] = &[
    "no such file or directory",
    "invalid data found when processing input",
    "invalid argument",
    "permission denied",
    "unsupported codec",
    "moov atom not found",
    "corrupt",
    "does not contain any stream",
    "unknown format",
];

/// One encoder invocation: argv plus the output it promises to produce.
#[derive(Debug, Clone)]
pub struct EncoderCommand {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    /// The file the invocation must leave behind, non-empty, on success.
    pub output_path: PathBuf,
}

/// Supervision policy. Both watchdogs are always armed.
#[derive(Debug, Clone)]
pub struct RunnerPolicy {
    /// Wall-clock ceiling for the whole invocation.
    pub global_timeout: Duration,
    /// Kill after this long without fresh progress telemetry.
    pub stall_timeout: Duration,
    /// Grace between the polite stop and the forced kill.
    pub kill_grace: Duration,
    /// Write an error log and a re-runnable script on failure.
    pub write_failure_artifacts: bool,
}

impl Default for RunnerPolicy {
    fn default() -> Self {
        Self {
            global_timeout: Duration::from_secs(1800),
            stall_timeout: Duration::from_secs(120),
            kill_grace: Duration::from_secs(5),
            write_failure_artifacts: true,
        }
    }
}

/// Telemetry parsed from the encoder's `-progress` stream.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProgressSnapshot {
    /// Media time rendered so far, in seconds.
    pub media_seconds: f64,
    pub fps: f64,
    /// Encode speed relative to realtime.
    pub speed: f64,
}

/// Why a failed invocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClassification {
    /// The input is bad; retrying cannot help.
    Permanent,
    /// Environment trouble; a later attempt may succeed.
    Transient,
    Timeout(TimeoutKind),
    /// Torn down by an external kill request.
    Killed,
}

/// Everything observed about one finished invocation.
#[derive(Debug)]
pub struct RunnerReport {
    pub success: bool,
    pub classification: Option<ExitClassification>,
    pub exit_code: Option<i32>,
    pub stderr_excerpt: String,
    pub wall_time: Duration,
    pub final_progress: ProgressSnapshot,
    /// Failure artifacts written, if any.
    pub artifacts: Vec<PathBuf>,
}

impl RunnerReport {
    /// Convert a failed report into the error the job boundary acks with.
    pub fn into_error(self) -> Error {
        let excerpt = last_lines(&self.stderr_excerpt, 5);
        match self.classification {
            Some(ExitClassification::Permanent) => Error::permanent(format!(
                "encoder failed permanently (exit {:?}): {}",
                self.exit_code, excerpt
            )),
            Some(ExitClassification::Timeout(kind)) => Error::timeout(
                kind,
                format!(
                    "encoder killed after {:.0}s (media rendered: {:.1}s)",
                    self.wall_time.as_secs_f64(),
                    self.final_progress.media_seconds
                ),
            ),
            Some(ExitClassification::Killed) => {
                Error::transient("encoder killed by shutdown request".to_string())
            }
            _ => Error::transient(format!(
                "encoder failed (exit {:?}): {}",
                self.exit_code, excerpt
            )),
        }
    }
}

enum LoopEnd {
    Eof,
    GlobalTimeout,
    StallTimeout,
    Killed,
}

/// Supervises encoder invocations under a fixed policy.
pub struct EncoderRunner {
    policy: RunnerPolicy,
    /// Directory failure artifacts are written into.
    artifact_dir: PathBuf,
    kill_switch: CancellationToken,
}

impl EncoderRunner {
    pub fn new(policy: RunnerPolicy, artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            policy,
            artifact_dir: artifact_dir.into(),
            kill_switch: CancellationToken::new(),
        }
    }

    /// Token that tears down any in-flight invocation when cancelled.
    pub fn kill_switch(&self) -> CancellationToken {
        self.kill_switch.clone()
    }

    /// Run one invocation to completion under the policy.
    ///
    /// Process-level failures come back as an unsuccessful
    /// [`RunnerReport`]; `Err` is reserved for supervision trouble
    /// (spawn failure, pipe loss).
    pub async fn run(
        &self,
        command: &EncoderCommand,
        on_progress: &(dyn Fn(&ProgressSnapshot) + Send + Sync),
    ) -> Result<RunnerReport> {
        let started = Instant::now();

        let mut cmd = process_utils::supervised_command(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::transient(format!("failed to spawn {}: {}", command.program, e))
        })?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Other("failed to capture encoder stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Other("failed to capture encoder stderr".to_string()))?;

        // Drain stdout so the child can never block on a full pipe.
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut reader = stdout;
            let _ = reader.read_to_end(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stderr).lines();
        let mut tail: Vec<String> = Vec::new();
        let mut progress = ProgressSnapshot::default();
        let global_deadline = started + self.policy.global_timeout;
        let mut stall_deadline = started + self.policy.stall_timeout;

        let end = loop {
            tokio::select! {
                _ = self.kill_switch.cancelled() => break LoopEnd::Killed,
                _ = tokio::time::sleep_until(global_deadline) => break LoopEnd::GlobalTimeout,
                _ = tokio::time::sleep_until(stall_deadline) => break LoopEnd::StallTimeout,
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if apply_progress_line(&line, &mut progress) {
                                stall_deadline = Instant::now() + self.policy.stall_timeout;
                                on_progress(&progress);
                            }
                            push_tail(&mut tail, line);
                        }
                        Ok(None) => break LoopEnd::Eof,
                        Err(e) => {
                            warn!(error = %e, "encoder stderr read failed");
                            break LoopEnd::Eof;
                        }
                    }
                }
            }
        };

        let (exit_code, forced_class) = match end {
            LoopEnd::Eof => {
                // The pipes closed; the process should exit promptly.
                let status = tokio::time::timeout(Duration::from_secs(30), child.wait())
                    .await
                    .map_err(|_| {
                        Error::transient("encoder closed its pipes but did not exit".to_string())
                    })??;
                (status.code(), None)
            }
            other => {
                let kind = match other {
                    LoopEnd::GlobalTimeout => Some(ExitClassification::Timeout(TimeoutKind::Global)),
                    LoopEnd::StallTimeout => Some(ExitClassification::Timeout(TimeoutKind::Stall)),
                    _ => Some(ExitClassification::Killed),
                };
                if let Some(pid) = pid {
                    process_utils::terminate_tree(pid, self.policy.kill_grace).await;
                }
                let status = child.wait().await?;
                (status.code(), kind)
            }
        };

        // Whatever the child printed to stdout belongs in the artifacts.
        let stdout_bytes = stdout_task.await.unwrap_or_default();
        let stderr_excerpt = tail.join("\n");
        let wall_time = started.elapsed();

        let success = forced_class.is_none() && exit_code == Some(0);
        let (success, classification) = if success {
            match verify_output(&command.output_path).await {
                Ok(()) => (true, None),
                Err(e) => {
                    warn!(output = %command.output_path.display(), error = %e, "encoder lied about success");
                    push_tail(&mut tail, format!("output verification failed: {}", e));
                    (false, Some(ExitClassification::Transient))
                }
            }
        } else if forced_class.is_some() {
            (false, forced_class)
        } else {
            (false, Some(classify_stderr(&stderr_excerpt)))
        };

        let mut artifacts = Vec::new();
        if !success && self.policy.write_failure_artifacts {
            match self
                .write_failure_artifacts(command, &tail.join("\n"), &stdout_bytes)
                .await
            {
                Ok(mut written) => artifacts.append(&mut written),
                Err(e) => warn!(error = %e, "failed to write encoder failure artifacts"),
            }
        }

        debug!(
            program = %command.program,
            success,
            ?exit_code,
            wall_s = wall_time.as_secs_f64(),
            media_s = progress.media_seconds,
            "encoder invocation finished"
        );

        Ok(RunnerReport {
            success,
            classification,
            exit_code,
            stderr_excerpt,
            wall_time,
            final_progress: progress,
            artifacts,
        })
    }

    /// Leave behind enough to rerun the failure by hand: the captured
    /// output and an executable script with the exact argv.
    async fn write_failure_artifacts(
        &self,
        command: &EncoderCommand,
        stderr: &str,
        stdout: &[u8],
    ) -> Result<Vec<PathBuf>> {
        tokio::fs::create_dir_all(&self.artifact_dir).await?;
        // Parallel slots can fail in the same millisecond; a random tag
        // keeps their artifacts apart.
        let tag = uuid::Uuid::new_v4().simple().to_string();
        let stamp = format!(
            "{}_{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S%.3f"),
            &tag[..8]
        );

        let log_path = self.artifact_dir.join(format!("encoder_error_{}.log", stamp));
        let mut log = format!(
            "command: {} {}\n\n--- stderr ---\n{}\n",
            command.program,
            command.args.join(" "),
            stderr
        );
        if !stdout.is_empty() {
            log.push_str("\n--- stdout ---\n");
            log.push_str(&String::from_utf8_lossy(stdout));
            log.push('\n');
        }
        tokio::fs::write(&log_path, log).await?;

        let script_path = self.artifact_dir.join(format!("encoder_cmd_{}.sh", stamp));
        let mut script = String::from("#!/bin/sh\n");
        script.push_str(&shell_quote(&command.program));
        for arg in &command.args {
            script.push(' ');
            script.push_str(&shell_quote(arg));
        }
        script.push('\n');
        tokio::fs::write(&script_path, script).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))
                .await?;
        }

        Ok(vec![log_path, script_path])
    }
}

async fn verify_output(path: &Path) -> Result<()> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| Error::transient(format!("output missing: {}", e)))?;
    if meta.len() == 0 {
        return Err(Error::transient("output file is empty".to_string()));
    }
    Ok(())
}

fn push_tail(tail: &mut Vec<String>, line: String) {
    if tail.len() >= STDERR_TAIL_LINES {
        tail.remove(0);
    }
    tail.push(line);
}

fn last_lines(s: &str, n: usize) -> String {
    let lines: Vec<&str> = s.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join(" | ")
}

/// Apply one stderr line to the running snapshot.
///
/// Returns true when the line carried fresh progress (media time
/// advanced), which is what feeds the stall watchdog.
fn apply_progress_line(line: &str, snapshot: &mut ProgressSnapshot) -> bool {
    let trimmed = line.trim();

    if let Some(v) = trimmed.strip_prefix("out_time=") {
        if let Some(secs) = parse_clock(v.trim()) {
            snapshot.media_seconds = secs;
            return true;
        }
        return false;
    }
    if let Some(v) = trimmed.strip_prefix("out_time_us=") {
        if let Ok(us) = v.trim().parse::<i64>() {
            if us >= 0 {
                snapshot.media_seconds = us as f64 / 1_000_000.0;
                return true;
            }
        }
        return false;
    }
    if let Some(v) = trimmed.strip_prefix("fps=") {
        if let Ok(fps) = v.trim().parse::<f64>() {
            snapshot.fps = fps;
        }
        return false;
    }
    if let Some(v) = trimmed.strip_prefix("speed=") {
        if let Ok(speed) = v.trim().trim_end_matches('x').parse::<f64>() {
            snapshot.speed = speed;
        }
        return false;
    }
    // Interleaved status lines (loglevel info) also carry a clock.
    if trimmed.starts_with("frame=") {
        if let Some(time_start) = trimmed.find("time=") {
            let rest = &trimmed[time_start + 5..];
            let token = rest.split_whitespace().next().unwrap_or("");
            if let Some(secs) = parse_clock(token) {
                snapshot.media_seconds = secs;
                return true;
            }
        }
    }
    false
}

/// Parse an `HH:MM:SS.frac` clock to seconds.
fn parse_clock(s: &str) -> Option<f64> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 3 {
        return None;
    }

    let hours: f64 = parts[0].parse().ok()?;
    let minutes: f64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;

    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Decide whether a non-zero exit is worth retrying.
pub fn classify_stderr(stderr: &str) -> ExitClassification {
    let lowered = stderr.to_lowercase();
    if PERMANENT_PATTERNS.iter().any(|p| lowered.contains(p)) {
        ExitClassification::Permanent
    } else {
        ExitClassification::Transient
    }
}

fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,%".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
