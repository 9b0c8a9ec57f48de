use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::paths::AppPaths;
use crate::process::{ProcessRunner, StreamLine};
use crate::{EngineError, Result};

// The output template leaves the extension to yt-dlp, so the finished file
// is located by scanning these.
pub const VIDEO_EXTS: &[&str] = &["mp4", "webm", "mkv", "mov", "avi"];

const OEMBED_TIMEOUT_SECS: u64 = 3;
const PROGRESS_LINE_PREFIX: &str = "DL ";

// Emit every Nth progress update; near-complete updates always go through so
// the bar lands on 99 before verification.
const PROGRESS_THROTTLE_EVERY: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoInfo {
    pub id: String,
    pub title: String,
    pub uploader: String,
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OembedResponse {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    author_name: Option<String>,
}

pub fn is_valid_url(raw: &str) -> bool {
    match url::Url::parse(raw) {
        Ok(parsed) => parsed.has_host(),
        Err(_) => false,
    }
}

// Covers watch, youtu.be, embed, /v/, user watch pages and shorts.
pub fn extract_video_id(raw: &str) -> Option<String> {
    static PATTERNS: OnceLock<[Regex; 2]> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            Regex::new(
                r"(?:youtube\.com/watch\?v=|youtu\.be/|youtube\.com/embed/|youtube\.com/v/|youtube\.com/user/.+/watch\?v=)([^&\n?#]+)",
            )
            .unwrap(),
            Regex::new(r"youtube\.com/shorts/([^&\n?#]+)").unwrap(),
        ]
    });
    patterns
        .iter()
        .find_map(|p| p.captures(raw))
        .map(|c| c[1].to_string())
}

/// Fetch title/uploader/thumbnail for `url`. Recognized YouTube URLs go
/// through oEmbed first; anything else, or an oEmbed miss, runs a yt-dlp
/// metadata dump.
pub fn fetch_video_info(paths: &AppPaths, runner: &ProcessRunner, url: &str) -> Result<VideoInfo> {
    if !is_valid_url(url) {
        return Err(EngineError::InvalidUrl(url.to_string()));
    }
    if runner.is_canceled() {
        return Err(EngineError::Canceled);
    }

    if let Some(video_id) = extract_video_id(url) {
        if let Some(info) = fetch_oembed_info(&video_id) {
            return Ok(info);
        }
        if runner.is_canceled() {
            return Err(EngineError::Canceled);
        }
    }

    fetch_info_via_yt_dlp(paths, runner, url)
}

fn fetch_oembed_info(video_id: &str) -> Option<VideoInfo> {
    let agent: ureq::Agent = ureq::Agent::config_builder()
        .http_status_as_error(false)
        .timeout_global(Some(Duration::from_secs(OEMBED_TIMEOUT_SECS)))
        .user_agent(concat!("vidify/", env!("CARGO_PKG_VERSION")))
        .build()
        .into();

    let oembed_url = format!(
        "https://www.youtube.com/oembed?url=https://www.youtube.com/watch?v={video_id}&format=json"
    );
    let mut response = agent.get(&oembed_url).call().ok()?;
    if response.status().as_u16() != 200 {
        return None;
    }
    let mut body = Vec::new();
    response.body_mut().as_reader().read_to_end(&mut body).ok()?;
    let data: OembedResponse = serde_json::from_slice(&body).ok()?;

    Some(VideoInfo {
        id: video_id.to_string(),
        title: data.title.unwrap_or_else(|| "Untitled".to_string()),
        uploader: data.author_name.unwrap_or_else(|| "Unknown".to_string()),
        thumbnail_url: Some(format!("https://i.ytimg.com/vi/{video_id}/mqdefault.jpg")),
    })
}

fn fetch_info_via_yt_dlp(paths: &AppPaths, runner: &ProcessRunner, url: &str) -> Result<VideoInfo> {
    // A metadata dump should never take longer than a minute; a hung
    // extractor must not pin the info-fetch slot forever.
    let runner = runner.with_timeout(Duration::from_secs(60));
    let args = [
        "--dump-single-json",
        "--no-playlist",
        "--no-warnings",
        "--skip-download",
        "--socket-timeout",
        "5",
        "--no-check-certificates",
        url,
    ];

    let mut stdout = String::new();
    run_yt_dlp(paths, &runner, &args, &mut |line| {
        if let StreamLine::Stdout(text) = line {
            stdout.push_str(text);
            stdout.push('\n');
        }
    })
    .map_err(|e| match e {
        EngineError::ExternalToolFailed { stderr, .. } => EngineError::InfoFetch(stderr),
        other => other,
    })?;

    let value: serde_json::Value = serde_json::from_str(stdout.trim())
        .map_err(|e| EngineError::InfoFetch(format!("unreadable metadata for {url}: {e}")))?;

    let field = |key: &str| value.get(key).and_then(|v| v.as_str()).map(str::to_string);
    Ok(VideoInfo {
        id: field("id").unwrap_or_default(),
        title: field("title").unwrap_or_else(|| "Untitled".to_string()),
        uploader: field("uploader").unwrap_or_else(|| "Unknown".to_string()),
        thumbnail_url: field("thumbnail"),
    })
}

/// Download `url` into the input directory as `video<N>.<ext>`, reporting
/// throttled percent updates. Returns the verified non-empty file.
pub fn download_video(
    paths: &AppPaths,
    runner: &ProcessRunner,
    url: &str,
    format_id: Option<&str>,
    mut on_progress: impl FnMut(u8),
) -> Result<PathBuf> {
    if !is_valid_url(url) {
        return Err(EngineError::InvalidUrl(url.to_string()));
    }

    let input_dir = paths.input_dir();
    std::fs::create_dir_all(&input_dir).map_err(|e| EngineError::Filesystem {
        path: input_dir.clone(),
        source: e,
    })?;

    let index = allocate_video_index(&input_dir);
    let template = input_dir.join(format!("video{index}.%(ext)s"));

    let format = format_id.unwrap_or("bestvideo+bestaudio/best");
    let progress_template = format!(
        "download:{PROGRESS_LINE_PREFIX}%(progress.downloaded_bytes)s %(progress.total_bytes)s %(progress.total_bytes_estimate)s"
    );
    let template_arg = template.to_string_lossy().into_owned();
    let args = [
        "-o",
        template_arg.as_str(),
        "-f",
        format,
        "--no-playlist",
        "--no-warnings",
        "--newline",
        "--progress-template",
        progress_template.as_str(),
        "--socket-timeout",
        "10",
        "--no-check-certificates",
        url,
    ];

    let mut throttle = ProgressThrottle::default();
    run_yt_dlp(paths, runner, &args, &mut |line| {
        if let StreamLine::Stdout(text) = line {
            if let Some(percent) = parse_progress_line(text) {
                // Hold 100 back until the file on disk is verified.
                if let Some(p) = throttle.offer(percent.min(99)) {
                    on_progress(p);
                }
            }
        }
    })
    .map_err(|e| match e {
        EngineError::ExternalToolFailed { stderr, .. } => EngineError::Download(stderr),
        other => other,
    })?;

    let downloaded = verified_download_path(&input_dir, index)
        .ok_or_else(|| EngineError::Download("downloaded file is missing or empty".to_string()))?;
    on_progress(100);
    Ok(downloaded)
}

// Serialized process-wide so two concurrent scans cannot pick the same index.
pub fn allocate_video_index(dir: &Path) -> u32 {
    static NAME_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let lock = NAME_LOCK.get_or_init(|| Mutex::new(()));
    let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

    let mut index = 1;
    while VIDEO_EXTS
        .iter()
        .any(|ext| dir.join(format!("video{index}.{ext}")).exists())
    {
        index += 1;
    }
    index
}

fn verified_download_path(dir: &Path, index: u32) -> Option<PathBuf> {
    VIDEO_EXTS.iter().find_map(|ext| {
        let candidate = dir.join(format!("video{index}.{ext}"));
        match std::fs::metadata(&candidate) {
            Ok(meta) if meta.len() > 0 => Some(candidate),
            _ => None,
        }
    })
}

// `DL <downloaded> <total> <estimate>` with `NA` for unknown fields.
fn parse_progress_line(line: &str) -> Option<u8> {
    let rest = line.trim().strip_prefix(PROGRESS_LINE_PREFIX)?;
    let mut parts = rest.split_whitespace();
    let downloaded: u64 = parts.next()?.parse().ok()?;
    let total: Option<u64> = parts.next().and_then(|p| p.parse().ok());
    let estimate: Option<u64> = parts.next().and_then(|p| p.parse().ok());

    match total.or(estimate) {
        Some(total) if total > 0 => {
            Some((downloaded.saturating_mul(100) / total).min(100) as u8)
        }
        _ => Some(0),
    }
}

#[derive(Default)]
struct ProgressThrottle {
    counter: u32,
    last_sent: u8,
}

impl ProgressThrottle {
    fn offer(&mut self, percent: u8) -> Option<u8> {
        // Merged formats make yt-dlp restart downloaded_bytes for the second
        // stream, so raw percents jump back; never drop below the high-water
        // mark already reported.
        if percent < self.last_sent {
            return None;
        }
        self.counter += 1;
        if self.counter >= PROGRESS_THROTTLE_EVERY || percent >= 99 {
            self.counter = 0;
            self.last_sent = percent;
            Some(percent)
        } else {
            None
        }
    }
}

// Tries the bundled/PATH binary first, then a Python module invocation for
// setups that only have the pip package.
fn run_yt_dlp(
    paths: &AppPaths,
    runner: &ProcessRunner,
    args: &[&str],
    on_line: &mut dyn FnMut(&StreamLine),
) -> Result<()> {
    let mut candidates: Vec<(PathBuf, Vec<&str>)> = vec![(paths.yt_dlp_cmd(), Vec::new())];
    candidates.push((PathBuf::from("python"), vec!["-m", "yt_dlp"]));
    candidates.push((PathBuf::from("python3"), vec!["-m", "yt_dlp"]));

    for (program, prefix) in candidates {
        let mut command = crate::cmd::command(&program);
        command.args(&prefix);
        command.args(args);
        match runner.run_streaming("yt-dlp", &mut command, &mut *on_line) {
            Ok(()) => return Ok(()),
            Err(EngineError::ExternalToolMissing { .. }) => continue,
            Err(other) => return Err(other),
        }
    }
    Err(EngineError::ExternalToolMissing {
        tool: "yt-dlp".to_string(),
    })
}
