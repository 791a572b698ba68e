//! Resolved run configuration.
//!
//! Four sections: detection, processing, rendering, queue. The first three
//! shape the rendered clips and participate in the configuration
//! fingerprint; the queue section only tunes execution (attempts,
//! timeouts) and deliberately does not.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Event detection tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectionConfig {
    /// Level (dBFS) below which audio counts as silence.
    pub noise_floor_db: f64,
    /// Silence shorter than this does not split an event.
    pub min_silence_s: f64,
    /// Detected events shorter than this are discarded.
    pub min_event_duration_s: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            noise_floor_db: -30.0,
            min_silence_s: 0.3,
            min_event_duration_s: 0.1,
        }
    }
}

/// Segment shaping applied between detection and rendering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Context padding added before and after each event, in seconds.
    pub context_padding_s: f64,
    /// Segments closer than this gap are merged into one clip.
    pub merge_gap_s: f64,
    /// Clips shorter than this after shaping are dropped.
    pub min_clip_duration_s: f64,
    /// Hard cap on a single clip's duration, if set.
    pub max_clip_duration_s: Option<f64>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            context_padding_s: 1.5,
            merge_gap_s: 2.0,
            min_clip_duration_s: 1.0,
            max_clip_duration_s: None,
        }
    }
}

/// Encoder invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RenderingConfig {
    pub video_codec: String,
    pub audio_codec: String,
    pub preset: String,
    pub crf: Option<u32>,
    pub target_fps: Option<u32>,
    pub pixel_format: Option<String>,
    /// Encoder binary name or path.
    pub ffmpeg_binary: String,
    /// Prober binary name or path.
    pub ffprobe_binary: String,
}

impl Default for RenderingConfig {
    fn default() -> Self {
        Self {
            video_codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
            preset: "medium".to_string(),
            crf: Some(23),
            target_fps: None,
            pixel_format: Some("yuv420p".to_string()),
            ffmpeg_binary: "ffmpeg".to_string(),
            ffprobe_binary: "ffprobe".to_string(),
        }
    }
}

/// Queue and supervision tuning. Not part of the config fingerprint:
/// changing a timeout must not dirty already-rendered outputs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub workers: usize,
    pub heartbeat_interval_s: u64,
    /// A Running row with no heartbeat for this long is considered orphaned.
    pub stale_timeout_s: u64,
    /// Wall-clock ceiling for one encoder invocation.
    pub global_timeout_s: u64,
    /// Encoder is killed after this long without progress telemetry.
    pub stall_timeout_s: u64,
    /// Grace between the polite stop and the forced kill.
    pub kill_grace_s: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            heartbeat_interval_s: 60,
            stale_timeout_s: 7200,
            global_timeout_s: 1800,
            stall_timeout_s: 120,
            kill_grace_s: 5,
        }
    }
}

impl QueueConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_s)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_s)
    }
}

/// The full resolved configuration for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    pub detection: DetectionConfig,
    pub processing: ProcessingConfig,
    pub rendering: RenderingConfig,
    pub queue: QueueConfig,
}

impl RunConfig {
    /// Load configuration, merging an optional JSON file over the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            None => Ok(Self::default()),
            Some(p) => {
                let raw = std::fs::read_to_string(p).map_err(|e| {
                    Error::config(format!("cannot read config file {}: {}", p.display(), e))
                })?;
                serde_json::from_str(&raw).map_err(|e| {
                    Error::config(format!("invalid config file {}: {}", p.display(), e))
                })
            }
        }
    }

    /// The canonical JSON the configuration fingerprint is taken over.
    ///
    /// Only the output-shaping sections are included; `serde_json` object
    /// keys are BTree-ordered, so semantically identical configurations
    /// canonicalize to the same bytes regardless of field order in the
    /// source file.
    pub fn fingerprint_payload(&self) -> Result<String> {
        let value = serde_json::json!({
            "detection": serde_json::to_value(&self.detection)?,
            "processing": serde_json::to_value(&self.processing)?,
            "rendering": serde_json::to_value(&self.rendering)?,
        });
        Ok(value.to_string())
    }
}
