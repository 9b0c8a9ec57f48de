use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::cmd;
use crate::effects::VideoGeometry;
use crate::paths::{self, AppPaths};
use crate::{EngineError, Result};

pub const DEFAULT_PREVIEW_FRAME_TIME: &str = "00:00:00.2";

// Assumed frame total when the container does not report one. Keeps the
// progress bar moving instead of pinning it at zero.
const FALLBACK_FRAME_COUNT: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LosslessFormat {
    pub name: &'static str,
    pub extension: &'static str,
    pub codec: &'static str,
    pub codec_params: &'static [&'static str],
}

pub const LOSSLESS_FORMATS: &[LosslessFormat] = &[
    LosslessFormat {
        name: "mp4",
        extension: "mp4",
        codec: "libx264",
        codec_params: &["-preset", "slow", "-crf", "0"],
    },
    LosslessFormat {
        name: "mkv",
        extension: "mkv",
        codec: "libx264",
        codec_params: &["-preset", "slow", "-crf", "0"],
    },
    LosslessFormat {
        name: "avi",
        extension: "avi",
        codec: "huffyuv",
        codec_params: &[],
    },
    LosslessFormat {
        name: "mov",
        extension: "mov",
        codec: "prores_ks",
        codec_params: &["-profile:v", "4444"],
    },
    LosslessFormat {
        name: "webm",
        extension: "webm",
        codec: "libvpx-vp9",
        codec_params: &["-lossless", "1"],
    },
];

pub fn lossless_format(name: &str) -> Option<&'static LosslessFormat> {
    LOSSLESS_FORMATS.iter().find(|f| f.name == name)
}

// True when an ffmpeg binary answers `-version`.
pub fn check_available(paths: &AppPaths) -> bool {
    cmd::command(paths.ffmpeg_cmd())
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

pub fn probe_dimensions(paths: &AppPaths, input: &Path) -> Result<VideoGeometry> {
    let stdout = run_probe(
        paths,
        &[
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height",
            "-of",
            "csv=s=x:p=0",
        ],
        input,
    )?;
    let line = stdout.trim();
    let (w, h) = line
        .split_once('x')
        .ok_or_else(|| probe_parse_error(input, line))?;
    let width = w.trim().parse().map_err(|_| probe_parse_error(input, line))?;
    let height = h.trim().parse().map_err(|_| probe_parse_error(input, line))?;
    Ok(VideoGeometry { width, height })
}

// Live remuxes and some webm files do not carry `nb_frames`; those get the
// fixed fallback total.
pub fn probe_frame_count(paths: &AppPaths, input: &Path) -> u64 {
    let stdout = run_probe(
        paths,
        &[
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=nb_frames",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ],
        input,
    );
    match stdout {
        Ok(out) => match out.trim().parse::<u64>() {
            Ok(n) if n > 0 => n,
            _ => FALLBACK_FRAME_COUNT,
        },
        Err(_) => FALLBACK_FRAME_COUNT,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaInfo {
    pub width: u32,
    pub height: u32,
    pub codec_name: Option<String>,
    pub bit_rate: Option<u64>,
    pub format_name: Option<String>,
    pub size_bytes: Option<u64>,
}

pub fn probe_media_info(paths: &AppPaths, input: &Path) -> Result<MediaInfo> {
    let geometry = probe_dimensions(paths, input)?;
    let mut info = MediaInfo {
        width: geometry.width,
        height: geometry.height,
        ..MediaInfo::default()
    };

    let stream = run_probe(
        paths,
        &[
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=codec_name,bit_rate",
            "-of",
            "default=noprint_wrappers=1",
        ],
        input,
    )?;
    let container = run_probe(
        paths,
        &[
            "-v",
            "error",
            "-show_entries",
            "format=format_name,size",
            "-of",
            "default=noprint_wrappers=1",
        ],
        input,
    )?;

    for line in stream.lines().chain(container.lines()) {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "codec_name" => info.codec_name = Some(value.to_string()),
            "bit_rate" => info.bit_rate = value.parse().ok(),
            "format_name" => info.format_name = Some(value.to_string()),
            "size" => info.size_bytes = value.parse().ok(),
            _ => {}
        }
    }
    Ok(info)
}

// `<stem>_unique.<ext>` in the output directory, keeping the source container.
pub fn unique_output_path(output_dir: &Path, input: &Path) -> PathBuf {
    let stem = output_stem(input);
    match input.extension() {
        Some(ext) => output_dir.join(format!("{stem}_unique.{}", ext.to_string_lossy())),
        None => output_dir.join(format!("{stem}_unique")),
    }
}

pub fn lossless_output_path(output_dir: &Path, input: &Path, format: &LosslessFormat) -> PathBuf {
    output_dir.join(format!("{}_lossless.{}", output_stem(input), format.extension))
}

fn output_stem(input: &Path) -> String {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    paths::sanitize_filename(&stem)
}

/// Overlay inputs feeding a transform. Order matters: the filter expression
/// addresses the background as `[1:v]` and the watermark as `[2:v]`.
#[derive(Debug, Clone, Default)]
pub struct OverlayInputs {
    pub background: Option<PathBuf>,
    pub watermark: Option<PathBuf>,
}

impl OverlayInputs {
    fn paths(&self) -> impl Iterator<Item = &Path> {
        self.background
            .as_deref()
            .into_iter()
            .chain(self.watermark.as_deref())
    }
}

pub fn build_transform_command(
    paths: &AppPaths,
    input: &Path,
    output: &Path,
    filter: Option<&str>,
    overlays: &OverlayInputs,
) -> Command {
    let mut command = cmd::command(paths.ffmpeg_cmd());
    command.arg("-y").arg("-i").arg(input);
    for overlay in overlays.paths() {
        command.arg("-i").arg(overlay);
    }
    apply_filter_args(&mut command, filter);
    command.arg("-c:a").arg("copy").arg(output);
    command
}

// Every input is seeked to `frame_time` so the overlays sample the same
// moment as the foreground.
pub fn build_preview_command(
    paths: &AppPaths,
    input: &Path,
    output: &Path,
    filter: Option<&str>,
    overlays: &OverlayInputs,
    frame_time: &str,
) -> Command {
    let mut command = cmd::command(paths.ffmpeg_cmd());
    command.arg("-y").arg("-ss").arg(frame_time).arg("-i").arg(input);
    for overlay in overlays.paths() {
        command.arg("-ss").arg(frame_time).arg("-i").arg(overlay);
    }
    apply_filter_args(&mut command, filter);
    command.arg("-frames:v").arg("1").arg("-update").arg("1").arg(output);
    command
}

// With `copy_audio` off the audio track is re-encoded losslessly too (opus
// for webm, flac elsewhere).
pub fn build_convert_command(
    paths: &AppPaths,
    input: &Path,
    output: &Path,
    format: &LosslessFormat,
    copy_audio: bool,
) -> Command {
    let mut command = cmd::command(paths.ffmpeg_cmd());
    command.arg("-y").arg("-i").arg(input);
    command.arg("-c:v").arg(format.codec);
    command.args(format.codec_params);
    if copy_audio {
        command.arg("-c:a").arg("copy");
    } else if format.name == "webm" {
        command.arg("-c:a").arg("libopus").arg("-b:a").arg("192k");
    } else {
        command.arg("-c:a").arg("flac");
    }
    command.arg(output);
    command
}

// Named-stream filters need `-filter_complex`; plain chains go through `-vf`.
fn apply_filter_args(command: &mut Command, filter: Option<&str>) {
    if let Some(filter) = filter {
        if filter.contains("overlay") || filter.contains('[') {
            command.arg("-filter_complex").arg(filter);
        } else {
            command.arg("-vf").arg(filter);
        }
    }
}

fn run_probe(paths: &AppPaths, args: &[&str], input: &Path) -> Result<String> {
    let output = cmd::command(paths.ffprobe_cmd())
        .args(args)
        .arg(input)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::ExternalToolMissing {
                tool: "ffprobe".to_string(),
            },
            _ => EngineError::Io(e),
        })?;
    if !output.status.success() {
        return Err(EngineError::ExternalToolFailed {
            tool: "ffprobe".to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn probe_parse_error(input: &Path, line: &str) -> EngineError {
    EngineError::ExternalToolFailed {
        tool: "ffprobe".to_string(),
        code: None,
        stderr: format!("unexpected dimensions output for {}: {line:?}", input.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_of(command: &Command) -> Vec<String> {
        command
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn test_paths() -> AppPaths {
        AppPaths::new(PathBuf::from("/nonexistent-base"))
    }

    #[test]
    fn output_paths_keep_stem_and_extension() {
        let out = Path::new("/out");
        assert_eq!(
            unique_output_path(out, Path::new("/in/video3.mp4")),
            PathBuf::from("/out/video3_unique.mp4")
        );
        assert_eq!(
            unique_output_path(out, Path::new("/in/clip")),
            PathBuf::from("/out/clip_unique")
        );

        let webm = lossless_format("webm").expect("webm format");
        assert_eq!(
            lossless_output_path(out, Path::new("/in/video3.mp4"), webm),
            PathBuf::from("/out/video3_lossless.webm")
        );
    }

    #[test]
    fn output_stems_drop_reserved_filename_characters() {
        let out = Path::new("/out");
        assert_eq!(
            unique_output_path(out, Path::new("/in/clip?v=1.mp4")),
            PathBuf::from("/out/clip_v=1_unique.mp4")
        );
    }

    #[test]
    fn every_container_has_a_lossless_codec() {
        for name in ["mp4", "mkv", "avi", "mov", "webm"] {
            assert!(lossless_format(name).is_some(), "missing {name}");
        }
        assert!(lossless_format("flv").is_none());
    }

    #[test]
    fn plain_filter_goes_through_vf() {
        let cmd = build_transform_command(
            &test_paths(),
            Path::new("in.mp4"),
            Path::new("out.mp4"),
            Some("hflip"),
            &OverlayInputs::default(),
        );
        let args = args_of(&cmd);
        assert_eq!(
            args,
            ["-y", "-i", "in.mp4", "-vf", "hflip", "-c:a", "copy", "out.mp4"]
        );
    }

    #[test]
    fn named_stream_filter_goes_through_filter_complex() {
        let overlays = OverlayInputs {
            background: Some(PathBuf::from("bg.mp4")),
            watermark: Some(PathBuf::from("wm.mp4")),
        };
        let cmd = build_transform_command(
            &test_paths(),
            Path::new("in.mp4"),
            Path::new("out.mp4"),
            Some("[0:v]crop=iw:ih-200:0:100[fg]"),
            &overlays,
        );
        let args = args_of(&cmd);
        // Input order fixes the [1:v]/[2:v] stream addressing.
        assert_eq!(&args[..7], ["-y", "-i", "in.mp4", "-i", "bg.mp4", "-i", "wm.mp4"]);
        assert_eq!(args[7], "-filter_complex");
        assert!(args.contains(&"copy".to_string()));
    }

    #[test]
    fn no_filter_copies_video_untouched() {
        let cmd = build_transform_command(
            &test_paths(),
            Path::new("in.mp4"),
            Path::new("out.mp4"),
            None,
            &OverlayInputs::default(),
        );
        let args = args_of(&cmd);
        assert!(!args.contains(&"-vf".to_string()));
        assert!(!args.contains(&"-filter_complex".to_string()));
    }

    #[test]
    fn preview_seeks_every_input_and_takes_one_frame() {
        let overlays = OverlayInputs {
            background: Some(PathBuf::from("bg.mp4")),
            watermark: None,
        };
        let cmd = build_preview_command(
            &test_paths(),
            Path::new("in.mp4"),
            Path::new("preview.png"),
            Some("[0:v]split[main][bg]"),
            &overlays,
            DEFAULT_PREVIEW_FRAME_TIME,
        );
        let args = args_of(&cmd);
        assert_eq!(
            &args[..8],
            ["-y", "-ss", "00:00:00.2", "-i", "in.mp4", "-ss", "00:00:00.2", "-i"]
        );
        let tail = &args[args.len() - 5..];
        assert_eq!(tail, ["-frames:v", "1", "-update", "1", "preview.png"]);
    }

    #[test]
    fn convert_command_applies_the_format_table() {
        let mov = lossless_format("mov").expect("mov format");
        let cmd = build_convert_command(
            &test_paths(),
            Path::new("in.mp4"),
            Path::new("out.mov"),
            mov,
            true,
        );
        let args = args_of(&cmd);
        assert_eq!(
            args,
            ["-y", "-i", "in.mp4", "-c:v", "prores_ks", "-profile:v", "4444", "-c:a", "copy", "out.mov"]
        );
    }

    #[test]
    fn convert_without_audio_copy_picks_a_lossless_audio_codec() {
        let webm = lossless_format("webm").expect("webm format");
        let cmd = build_convert_command(
            &test_paths(),
            Path::new("in.mp4"),
            Path::new("out.webm"),
            webm,
            false,
        );
        let args = args_of(&cmd);
        assert!(args.windows(2).any(|w| w == ["-c:a", "libopus"]));

        let mkv = lossless_format("mkv").expect("mkv format");
        let cmd = build_convert_command(
            &test_paths(),
            Path::new("in.mp4"),
            Path::new("out.mkv"),
            mkv,
            false,
        );
        let args = args_of(&cmd);
        assert!(args.windows(2).any(|w| w == ["-c:a", "flac"]));
    }
}
