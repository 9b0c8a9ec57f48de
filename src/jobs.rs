use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

use crossbeam_channel::{Receiver, Sender};

use crate::downloader::{self, VideoInfo};
use crate::effects::{EffectConfig, VideoGeometry};
use crate::ffmpeg::{self, OverlayInputs};
use crate::filtergraph;
use crate::paths::AppPaths;
use crate::process::ProcessRunner;
use crate::{EngineError, Result};

// How long `submit` waits for a canceled occupant to wind down before
// starting its replacement. Best effort; the new job starts either way.
const CANCEL_GRACE_MS: u64 = 500;
const CANCEL_POLL_MS: u64 = 50;

const TEMP_MAX_AGE: Duration = Duration::from_secs(60 * 60);

// At most one job per slot runs at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    InfoFetch,
    Download,
    PreviewTransform,
    FinalTransform,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Info(VideoInfo),
    File(PathBuf),
}

/// Progress percents within a job never decrease, and exactly one terminal
/// event (Succeeded, Failed or Canceled) closes the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Progress(u8),
    Status(String),
    Succeeded(JobOutcome),
    Failed(String),
    Canceled,
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::Succeeded(_) | JobEvent::Failed(_) | JobEvent::Canceled
        )
    }
}

pub struct JobHandle {
    pub id: String,
    pub slot: Slot,
    pub events: Receiver<JobEvent>,
    cancel: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

impl JobHandle {
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

pub struct JobContext {
    cancel: Arc<AtomicBool>,
    tx: Sender<JobEvent>,
}

impl JobContext {
    pub fn emit_progress(&self, percent: u8) {
        let _ = self.tx.send(JobEvent::Progress(percent));
    }

    pub fn emit_status(&self, text: impl Into<String>) {
        let _ = self.tx.send(JobEvent::Status(text.into()));
    }

    pub fn check_canceled(&self) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(EngineError::Canceled)
        } else {
            Ok(())
        }
    }

    pub fn runner(&self) -> ProcessRunner {
        ProcessRunner::new(Arc::clone(&self.cancel))
    }
}

struct ActiveJob {
    id: String,
    cancel: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

struct RegistryCleanup {
    active: Arc<Mutex<HashMap<Slot, ActiveJob>>>,
    slot: Slot,
    id: String,
    finished: Arc<AtomicBool>,
}

impl RegistryCleanup {
    // True when this caller won the right to emit the terminal event.
    fn claim_terminal(&self) -> bool {
        !self.finished.swap(true, Ordering::SeqCst)
    }

    // Only if the slot still belongs to this job; a replacement may have
    // taken it during the grace period.
    fn remove_self(&self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let owned = active.get(&self.slot).is_some_and(|job| job.id == self.id);
        if owned {
            active.remove(&self.slot);
        }
    }
}

pub struct JobManager {
    paths: AppPaths,
    active: Arc<Mutex<HashMap<Slot, ActiveJob>>>,
    transforms_enabled: bool,
}

impl JobManager {
    /// Sets up directories, checks for ffmpeg and sweeps stale temp files.
    /// A missing ffmpeg disables transform jobs but leaves fetching and
    /// downloading working.
    pub fn new(paths: AppPaths) -> Result<Self> {
        paths.ensure_dirs().map_err(|e| EngineError::Filesystem {
            path: paths.base_dir.clone(),
            source: e,
        })?;
        let transforms_enabled = ffmpeg::check_available(&paths);
        if !transforms_enabled {
            log::warn!("ffmpeg not found, transform and convert jobs are disabled");
        }

        let temp_dir = paths.temp_dir();
        thread::spawn(move || sweep_temp_files(&temp_dir, TEMP_MAX_AGE));

        Ok(Self {
            paths,
            active: Arc::new(Mutex::new(HashMap::new())),
            transforms_enabled,
        })
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn transforms_enabled(&self) -> bool {
        self.transforms_enabled
    }

    /// Start `work` on its own thread in `slot`, cancelling any occupant
    /// first. `url` is attached to error-log lines should the job fail.
    pub fn submit<F>(&self, slot: Slot, url: Option<String>, work: F) -> JobHandle
    where
        F: FnOnce(&JobContext) -> Result<JobOutcome> + Send + 'static,
    {
        self.displace_occupant(slot);

        let id = uuid::Uuid::new_v4().to_string();
        let cancel = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let (tx, rx) = crossbeam_channel::unbounded();

        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.insert(
                slot,
                ActiveJob {
                    id: id.clone(),
                    cancel: Arc::clone(&cancel),
                    finished: Arc::clone(&finished),
                },
            );
        }

        let handle = JobHandle {
            id: id.clone(),
            slot,
            events: rx,
            cancel: Arc::clone(&cancel),
            finished: Arc::clone(&finished),
        };

        let ctx = JobContext {
            cancel,
            tx: tx.clone(),
        };
        let error_log = self.paths.error_log_path();
        let registry = RegistryCleanup {
            active: Arc::clone(&self.active),
            slot,
            id,
            finished: Arc::clone(&finished),
        };
        thread::spawn(move || {
            log::debug!("job {} started in {:?}", registry.id, slot);
            let result = work(&ctx);
            // The finished flag doubles as the single-terminal-event guard:
            // whoever flips it first emits the terminal event.
            if registry.claim_terminal() {
                match result {
                    Ok(outcome) => {
                        let _ = tx.send(JobEvent::Succeeded(outcome));
                    }
                    Err(EngineError::Canceled) => {
                        let _ = tx.send(JobEvent::Canceled);
                    }
                    Err(err) => {
                        let message = err.to_string();
                        log_error(&error_log, url.as_deref(), &message);
                        let _ = tx.send(JobEvent::Failed(message));
                    }
                }
            }
            registry.remove_self();
        });

        handle
    }

    pub fn cancel(&self, slot: Slot) {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = active.get(&slot) {
            job.cancel.store(true, Ordering::Relaxed);
        }
    }

    pub fn cancel_all(&self) {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        for job in active.values() {
            job.cancel.store(true, Ordering::Relaxed);
        }
    }

    pub fn submit_info_fetch(&self, url: String) -> JobHandle {
        let paths = self.paths.clone();
        let job_url = url.clone();
        self.submit(Slot::InfoFetch, Some(url), move |ctx| {
            ctx.emit_status("Fetching video info...");
            let runner = ctx.runner();
            let info = downloader::fetch_video_info(&paths, &runner, &job_url)?;
            ctx.check_canceled()?;
            Ok(JobOutcome::Info(info))
        })
    }

    pub fn submit_download(&self, url: String, format_id: Option<String>) -> JobHandle {
        let paths = self.paths.clone();
        let job_url = url.clone();
        self.submit(Slot::Download, Some(url), move |ctx| {
            ctx.emit_status("Downloading...");
            let runner = ctx.runner();
            let path = downloader::download_video(
                &paths,
                &runner,
                &job_url,
                format_id.as_deref(),
                |percent| ctx.emit_progress(percent),
            )?;
            ctx.emit_status("Done!");
            Ok(JobOutcome::File(path))
        })
    }

    // One filtered frame into the temp directory.
    pub fn submit_preview(
        &self,
        input: PathBuf,
        config: EffectConfig,
        geometry: Option<VideoGeometry>,
        frame_time: Option<String>,
    ) -> JobHandle {
        let paths = self.paths.clone();
        let enabled = self.transforms_enabled;
        self.submit(Slot::PreviewTransform, None, move |ctx| {
            require_ffmpeg(enabled)?;
            ctx.emit_status("Generating preview...");
            let config = config.with_missing_overlays_cleared();
            let filter = filtergraph::build(&config, geometry.as_ref());
            if config.frame_enabled && filter.is_none() {
                return Err(EngineError::PreviewUnavailable);
            }

            let preview_path = paths.temp_dir().join("preview.png");
            let frame_time = frame_time
                .unwrap_or_else(|| ffmpeg::DEFAULT_PREVIEW_FRAME_TIME.to_string());
            let overlays = overlay_inputs(&config);
            let mut command = ffmpeg::build_preview_command(
                &paths,
                &input,
                &preview_path,
                filter.as_deref(),
                &overlays,
                &frame_time,
            );

            let runner = ctx.runner();
            runner.run_streaming("ffmpeg", &mut command, |_| {})?;
            if !preview_path.is_file() {
                return Err(EngineError::ExternalToolFailed {
                    tool: "ffmpeg".to_string(),
                    code: None,
                    stderr: "preview frame was not produced".to_string(),
                });
            }
            Ok(JobOutcome::File(preview_path))
        })
    }

    pub fn submit_unique_transform(
        &self,
        input: PathBuf,
        config: EffectConfig,
        geometry: Option<VideoGeometry>,
    ) -> JobHandle {
        let paths = self.paths.clone();
        let enabled = self.transforms_enabled;
        self.submit(Slot::FinalTransform, None, move |ctx| {
            require_ffmpeg(enabled)?;
            ctx.emit_status("Processing video...");
            let config = config.with_missing_overlays_cleared();
            let filter = transform_filter(&config, geometry.as_ref())?;

            let output = ffmpeg::unique_output_path(&paths.output_dir(), &input);
            let overlays = overlay_inputs(&config);
            let mut command = ffmpeg::build_transform_command(
                &paths,
                &input,
                &output,
                Some(&filter),
                &overlays,
            );

            let runner = ctx.runner();
            ctx.check_canceled()?;
            let total_frames = ffmpeg::probe_frame_count(&paths, &input);
            runner.run_with_frame_progress("ffmpeg", &mut command, total_frames, |percent| {
                ctx.emit_progress(percent)
            })?;

            sweep_temp_files(&paths.temp_dir(), TEMP_MAX_AGE);
            ctx.emit_status("Done!");
            Ok(JobOutcome::File(output))
        })
    }

    pub fn submit_lossless_convert(
        &self,
        input: PathBuf,
        format_name: String,
        copy_audio: bool,
    ) -> JobHandle {
        let paths = self.paths.clone();
        let enabled = self.transforms_enabled;
        self.submit(Slot::FinalTransform, None, move |ctx| {
            require_ffmpeg(enabled)?;
            ctx.emit_status("Converting video...");
            let format = ffmpeg::lossless_format(&format_name).ok_or_else(|| {
                EngineError::ExternalToolFailed {
                    tool: "ffmpeg".to_string(),
                    code: None,
                    stderr: format!("unknown conversion format: {format_name}"),
                }
            })?;

            let output = ffmpeg::lossless_output_path(&paths.output_dir(), &input, format);
            let mut command =
                ffmpeg::build_convert_command(&paths, &input, &output, format, copy_audio);

            let runner = ctx.runner();
            ctx.check_canceled()?;
            let total_frames = ffmpeg::probe_frame_count(&paths, &input);
            runner.run_with_frame_progress("ffmpeg", &mut command, total_frames, |percent| {
                ctx.emit_progress(percent)
            })?;

            ctx.emit_status("Done!");
            Ok(JobOutcome::File(output))
        })
    }

    fn displace_occupant(&self, slot: Slot) {
        let occupant = {
            let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.get(&slot).map(|job| {
                job.cancel.store(true, Ordering::Relaxed);
                Arc::clone(&job.finished)
            })
        };
        let Some(finished) = occupant else {
            return;
        };
        let deadline = std::time::Instant::now() + Duration::from_millis(CANCEL_GRACE_MS);
        while !finished.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(CANCEL_POLL_MS));
        }
    }
}

fn require_ffmpeg(enabled: bool) -> Result<()> {
    if enabled {
        Ok(())
    } else {
        Err(EngineError::ExternalToolMissing {
            tool: "ffmpeg".to_string(),
        })
    }
}

// `build` returns `None` both when no effect is active and when the frame
// effect is on without known dimensions; the failure must name the real cause.
fn transform_filter(config: &EffectConfig, geometry: Option<&VideoGeometry>) -> Result<String> {
    match filtergraph::build(config, geometry) {
        Some(filter) => Ok(filter),
        None if config.frame_enabled => Err(EngineError::PreviewUnavailable),
        None => Err(EngineError::NoEffectsSelected),
    }
}

fn overlay_inputs(config: &EffectConfig) -> OverlayInputs {
    if config.frame_enabled {
        OverlayInputs {
            background: config.background_video_path.clone(),
            watermark: config.watermark_video_path.clone(),
        }
    } else {
        OverlayInputs::default()
    }
}

// Logging failures are reported through the log facade, never propagated.
pub fn log_error(log_path: &Path, url: Option<&str>, message: &str) {
    use std::io::Write;

    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    let line = match url {
        Some(url) => format!("[{timestamp}] [{url}] {message}\n"),
        None => format!("[{timestamp}] {message}\n"),
    };
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .and_then(|mut f| f.write_all(line.as_bytes()));
    if let Err(err) = result {
        log::warn!("could not write error log {}: {err}", log_path.display());
    }
}

pub fn sweep_temp_files(dir: &Path, max_age: Duration) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            log::warn!("temp sweep skipped, {}: {err}", dir.display());
            return;
        }
    };
    let now = SystemTime::now();
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let Ok(modified) = meta.modified() else { continue };
        let stale = now
            .duration_since(modified)
            .map(|age| age > max_age)
            .unwrap_or(false);
        if stale {
            if let Err(err) = std::fs::remove_file(&path) {
                log::warn!("could not remove stale temp file {}: {err}", path.display());
            }
        }
    }
}
