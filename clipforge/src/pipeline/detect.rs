//! Event detection.
//!
//! The detector is a collaborator behind a trait so tests (and future
//! detectors) can swap it out. The shipped implementation finds loud
//! events as the complement of ffmpeg `silencedetect` spans; an event's
//! score is its duration, which is only used for merge tie-breaking.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::config::DetectionConfig;
use crate::pipeline::segments::Segment;
use crate::{Error, Result};

/// Ceiling for one detection or probe invocation. Detection decodes
/// audio only, so this is generous.
const DETECT_TIMEOUT: Duration = Duration::from_secs(600);

/// Finds raw highlight events in an artifact.
#[async_trait]
pub trait EventDetector: Send + Sync {
    /// Detect events within `[0, media_duration]`, unpadded and unmerged.
    async fn detect(&self, artifact: &Path, media_duration: f64) -> Result<Vec<Segment>>;
}

/// Loudness-based detector built on ffmpeg's `silencedetect` filter.
pub struct SilenceDetector {
    config: DetectionConfig,
    ffmpeg_binary: String,
    start_re: Regex,
    end_re: Regex,
}

impl SilenceDetector {
    pub fn new(config: DetectionConfig, ffmpeg_binary: impl Into<String>) -> Self {
        Self {
            config,
            ffmpeg_binary: ffmpeg_binary.into(),
            // Silencedetect stamps are absolute and never signed.
            start_re: Regex::new(r"silence_start:\s*([0-9]+(?:\.[0-9]+)?)")
                .expect("static regex"),
            end_re: Regex::new(r"silence_end:\s*([0-9]+(?:\.[0-9]+)?)").expect("static regex"),
        }
    }

    fn parse_silence_spans(&self, stderr: &str, media_duration: f64) -> Vec<(f64, f64)> {
        let mut spans = Vec::new();
        let mut open: Option<f64> = None;

        for line in stderr.lines() {
            if let Some(cap) = self.start_re.captures(line) {
                if let Ok(start) = cap[1].parse::<f64>() {
                    open = Some(start);
                }
            } else if let Some(cap) = self.end_re.captures(line) {
                if let (Some(start), Ok(end)) = (open.take(), cap[1].parse::<f64>()) {
                    if end > start {
                        spans.push((start, end));
                    }
                }
            }
        }
        // Silence running into EOF never gets a silence_end line.
        if let Some(start) = open {
            if media_duration > start {
                spans.push((start, media_duration));
            }
        }
        spans
    }
}

#[async_trait]
impl EventDetector for SilenceDetector {
    async fn detect(&self, artifact: &Path, media_duration: f64) -> Result<Vec<Segment>> {
        let filter = format!(
            "silencedetect=noise={}dB:d={}",
            self.config.noise_floor_db, self.config.min_silence_s
        );

        let output = tokio::time::timeout(
            DETECT_TIMEOUT,
            process_utils::tokio_command(&self.ffmpeg_binary)
                .args(["-hide_banner", "-nostats", "-i"])
                .arg(artifact)
                .args(["-af", &filter, "-vn", "-f", "null", "-"])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .output(),
        )
        .await
        .map_err(|_| Error::transient(format!("detection timed out on {}", artifact.display())))?
        .map_err(|e| Error::transient(format!("failed to run {}: {}", self.ffmpeg_binary, e)))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            // Detection decodes the input; a refusal here is an input problem.
            return Err(Error::permanent(format!(
                "detection failed on {}: {}",
                artifact.display(),
                stderr.lines().last().unwrap_or("unknown error")
            )));
        }

        let silences = self.parse_silence_spans(&stderr, media_duration);
        let events = complement(&silences, media_duration, self.config.min_event_duration_s);
        debug!(
            artifact = %artifact.display(),
            silences = silences.len(),
            events = events.len(),
            "detection complete"
        );
        Ok(events)
    }
}

/// Invert silence spans into loud events, dropping events shorter than
/// `min_event`.
fn complement(silences: &[(f64, f64)], media_duration: f64, min_event: f64) -> Vec<Segment> {
    let mut events = Vec::new();
    let mut cursor = 0.0f64;

    for &(start, end) in silences {
        if start - cursor >= min_event {
            events.push(Segment::new(cursor, start, start - cursor));
        }
        cursor = cursor.max(end);
    }
    if media_duration - cursor >= min_event {
        events.push(Segment::new(cursor, media_duration, media_duration - cursor));
    }
    events
}

/// Probe the media duration in seconds via ffprobe.
pub async fn probe_duration(ffprobe_binary: &str, artifact: &Path) -> Result<f64> {
    let output = tokio::time::timeout(
        DETECT_TIMEOUT,
        process_utils::tokio_command(ffprobe_binary)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(artifact)
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .map_err(|_| Error::transient(format!("probe timed out on {}", artifact.display())))?
    .map_err(|e| Error::transient(format!("failed to run {}: {}", ffprobe_binary, e)))?;

    if !output.status.success() {
        return Err(Error::permanent(format!(
            "probe failed on {}: {}",
            artifact.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let raw = String::from_utf8_lossy(&output.stdout);
    let duration: f64 = raw.trim().parse().map_err(|_| {
        Error::permanent(format!(
            "probe returned unparseable duration {:?} for {}",
            raw.trim(),
            artifact.display()
        ))
    })?;

    if duration <= 0.0 {
        return Err(Error::permanent(format!(
            "probe reported non-positive duration for {}",
            artifact.display()
        )));
    }
    Ok(duration)
}
