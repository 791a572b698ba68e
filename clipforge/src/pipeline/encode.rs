//! Building the encoder invocation for one clip.

use std::path::{Path, PathBuf};

use crate::config::RenderingConfig;
use crate::pipeline::segments::Segment;
use crate::runner::EncoderCommand;

/// Output file name for the clip at `index` of an artifact.
pub fn clip_output_path(output_dir: &Path, artifact: &Path, index: usize) -> PathBuf {
    let stem = artifact
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "clip".to_string());
    output_dir.join(format!("{}_clip_{:03}.mp4", stem, index))
}

/// Build the extraction command for one segment.
///
/// `-ss` goes before `-i` for keyframe-seek speed; the stall watchdog
/// depends on `-progress pipe:2`, so it is always present.
pub fn build_extract_command(
    input: &Path,
    output: &Path,
    segment: &Segment,
    rendering: &RenderingConfig,
) -> EncoderCommand {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-nostdin".into(),
        "-nostats".into(),
        "-y".into(),
        "-ss".into(),
        format!("{:.3}", segment.start),
        "-i".into(),
        input.to_string_lossy().into_owned(),
        "-t".into(),
        format!("{:.3}", segment.duration()),
        "-c:v".into(),
        rendering.video_codec.clone(),
        "-preset".into(),
        rendering.preset.clone(),
    ];

    if let Some(crf) = rendering.crf {
        args.push("-crf".into());
        args.push(crf.to_string());
    }
    if let Some(fps) = rendering.target_fps {
        args.push("-r".into());
        args.push(fps.to_string());
    }
    if let Some(pix_fmt) = &rendering.pixel_format {
        args.push("-pix_fmt".into());
        args.push(pix_fmt.clone());
    }

    args.push("-c:a".into());
    args.push(rendering.audio_codec.clone());
    args.push("-progress".into());
    args.push("pipe:2".into());
    args.push(output.to_string_lossy().into_owned());

    EncoderCommand {
        program: rendering.ffmpeg_binary.clone(),
        args,
        workdir: None,
        output_path: output.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_name_is_indexed_and_stable() {
        let path = clip_output_path(Path::new("/out"), Path::new("/in/match final.mp4"), 7);
        assert_eq!(path, PathBuf::from("/out/match final_clip_007.mp4"));
    }

    #[test]
    fn seek_precedes_input_for_fast_seek() {
        let cmd = build_extract_command(
            Path::new("/in/a.mp4"),
            Path::new("/out/a_clip_000.mp4"),
            &Segment::new(12.5, 20.0, 1.0),
            &RenderingConfig::default(),
        );
        let ss = cmd.args.iter().position(|a| a == "-ss").unwrap();
        let i = cmd.args.iter().position(|a| a == "-i").unwrap();
        assert!(ss < i);
        assert_eq!(cmd.args[ss + 1], "12.500");
        let t = cmd.args.iter().position(|a| a == "-t").unwrap();
        assert_eq!(cmd.args[t + 1], "7.500");
    }

    #[test]
    fn progress_pipe_is_always_requested() {
        let cmd = build_extract_command(
            Path::new("/in/a.mp4"),
            Path::new("/out/a_clip_000.mp4"),
            &Segment::new(0.0, 1.0, 1.0),
            &RenderingConfig::default(),
        );
        let p = cmd.args.iter().position(|a| a == "-progress").unwrap();
        assert_eq!(cmd.args[p + 1], "pipe:2");
    }

    #[test]
    fn optional_flags_follow_config() {
        let mut rendering = RenderingConfig::default();
        rendering.crf = None;
        rendering.target_fps = Some(60);
        rendering.pixel_format = None;
        let cmd = build_extract_command(
            Path::new("/in/a.mp4"),
            Path::new("/out/a_clip_000.mp4"),
            &Segment::new(0.0, 1.0, 1.0),
            &rendering,
        );
        assert!(!cmd.args.contains(&"-crf".to_string()));
        assert!(!cmd.args.contains(&"-pix_fmt".to_string()));
        let r = cmd.args.iter().position(|a| a == "-r").unwrap();
        assert_eq!(cmd.args[r + 1], "60");
    }
}
