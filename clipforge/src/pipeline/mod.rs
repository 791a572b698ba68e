//! The per-job processing pipeline.
//!
//! One claimed job flows preflight -> probe -> detect -> shape ->
//! render, producing the list of clip paths the manifest is acked with.
//! A job with no detected events succeeds with an empty output list.

pub mod detect;
pub mod encode;
pub mod segments;
pub mod worker_pool;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sysinfo::Disks;
use tracing::{debug, info};

use crate::config::RunConfig;
use crate::database::models::JobItem;
use crate::pipeline::detect::{EventDetector, SilenceDetector, probe_duration};
use crate::pipeline::segments::shape;
use crate::runner::{EncoderRunner, RunnerPolicy};
use crate::{Error, Result};

/// Free-space headroom required on the output volume, as a multiple of
/// the input size.
const DISK_HEADROOM_FACTOR: f64 = 1.5;

/// Executes one claimed job end to end.
#[async_trait]
pub trait JobPipeline: Send + Sync {
    /// Returns the rendered clip paths. An empty list is a success: the
    /// artifact simply had nothing worth clipping.
    async fn execute(&self, job: &JobItem) -> Result<Vec<String>>;
}

/// The shipping pipeline: silence-complement detection plus supervised
/// ffmpeg extraction.
pub struct ClipPipeline {
    config: RunConfig,
    output_dir: PathBuf,
    detector: Arc<dyn EventDetector>,
    runner: EncoderRunner,
}

impl ClipPipeline {
    pub fn new(config: RunConfig, output_dir: impl Into<PathBuf>, policy: RunnerPolicy) -> Self {
        let output_dir = output_dir.into();
        let detector = Arc::new(SilenceDetector::new(
            config.detection.clone(),
            config.rendering.ffmpeg_binary.clone(),
        ));
        let runner = EncoderRunner::new(policy, output_dir.join("failures"));
        Self {
            config,
            output_dir,
            detector,
            runner,
        }
    }

    /// Swap the detector (tests, alternative detection strategies).
    pub fn with_detector(mut self, detector: Arc<dyn EventDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Token that tears down any in-flight encoder invocation.
    pub fn kill_switch(&self) -> tokio_util::sync::CancellationToken {
        self.runner.kill_switch()
    }

    /// Cheap checks before any decode work: input exists, is readable
    /// and non-empty, and the output volume has headroom.
    fn preflight(&self, input: &Path) -> Result<u64> {
        let meta = std::fs::metadata(input)
            .map_err(|e| Error::permanent(format!("input {} unusable: {}", input.display(), e)))?;
        if meta.len() == 0 {
            return Err(Error::permanent(format!("input {} is empty", input.display())));
        }
        std::fs::File::open(input).map_err(|e| {
            Error::permanent(format!("input {} unreadable: {}", input.display(), e))
        })?;

        let required = (meta.len() as f64 * DISK_HEADROOM_FACTOR) as u64;
        if let Some(available) = available_space_for(&self.output_dir) {
            if available < required {
                return Err(Error::permanent(format!(
                    "insufficient disk space for {}: {} bytes available, {} required",
                    input.display(),
                    available,
                    required
                )));
            }
        }
        Ok(meta.len())
    }
}

/// Directory one job's clips are rendered into, keyed by the job id so
/// parallel jobs never share an output path.
fn job_output_dir(output_dir: &Path, job: &JobItem) -> PathBuf {
    output_dir.join(&job.id)
}

/// Available bytes on the volume holding `path`, by longest mount-point
/// match. `None` when no disk matches (containers, odd mounts); the
/// caller treats that as "unknown, proceed".
fn available_space_for(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    let path_str = path.to_string_lossy();
    let mut best_match: Option<(&sysinfo::Disk, usize)> = None;

    for disk in disks.list() {
        let mount_point = disk.mount_point().to_string_lossy();
        if path_str.starts_with(mount_point.as_ref()) {
            let mount_len = mount_point.len();
            if best_match.is_none_or(|(_, len)| mount_len > len) {
                best_match = Some((disk, mount_len));
            }
        }
    }

    best_match.map(|(disk, _)| disk.available_space())
}

#[async_trait]
impl JobPipeline for ClipPipeline {
    async fn execute(&self, job: &JobItem) -> Result<Vec<String>> {
        let input = Path::new(&job.artifact_path);
        self.preflight(input)?;

        let ffprobe = &self.config.rendering.ffprobe_binary;
        let duration = probe_duration(ffprobe, input).await?;

        let events = self.detector.detect(input, duration).await?;
        if events.is_empty() {
            info!(artifact = %input.display(), "no events detected, nothing to clip");
            return Ok(Vec::new());
        }

        let clips = shape(&events, &self.config.processing, duration);
        if clips.is_empty() {
            info!(artifact = %input.display(), "all events filtered out during shaping");
            return Ok(Vec::new());
        }

        // Clips land in a per-job directory: two inputs sharing a file
        // stem must never contend on an output path across slots.
        let job_dir = job_output_dir(&self.output_dir, job);
        tokio::fs::create_dir_all(&job_dir).await?;

        let mut outputs = Vec::with_capacity(clips.len());
        for (index, clip) in clips.iter().enumerate() {
            let output = encode::clip_output_path(&job_dir, input, index);
            let command =
                encode::build_extract_command(input, &output, clip, &self.config.rendering);

            let artifact = input.display().to_string();
            let report = self
                .runner
                .run(&command, &move |p| {
                    debug!(
                        artifact = %artifact,
                        clip = index,
                        media_s = p.media_seconds,
                        fps = p.fps,
                        speed = p.speed,
                        "encode progress"
                    );
                })
                .await?;

            if !report.success {
                return Err(report.into_error());
            }
            outputs.push(output.to_string_lossy().into_owned());
        }

        info!(
            artifact = %input.display(),
            clips = outputs.len(),
            "rendered all clips"
        );
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::ArtifactFingerprint;

    #[test]
    fn same_stem_inputs_render_to_distinct_paths() {
        let fp = ArtifactFingerprint {
            quick: "q".into(),
            strong: "s".into(),
            size: 1,
        };
        let a = JobItem::new("matches/a/match.mp4", &fp, "cfg", 3);
        let b = JobItem::new("matches/b/match.mp4", &fp, "cfg", 3);

        let out = Path::new("clips");
        let clip_a =
            encode::clip_output_path(&job_output_dir(out, &a), Path::new(&a.artifact_path), 0);
        let clip_b =
            encode::clip_output_path(&job_output_dir(out, &b), Path::new(&b.artifact_path), 0);

        assert_ne!(clip_a, clip_b);
        assert!(clip_a.starts_with(out.join(&a.id)));
    }
}
