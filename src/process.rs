use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;

use crossbeam_channel::RecvTimeoutError;

use crate::{EngineError, Result};

const POLL_INTERVAL_MS: u64 = 200;

// ffmpeg reports progress on stderr, yt-dlp progress templates on stdout.
#[derive(Debug, Clone)]
pub enum StreamLine {
    Stdout(String),
    Stderr(String),
}

impl StreamLine {
    pub fn text(&self) -> &str {
        match self {
            StreamLine::Stdout(s) | StreamLine::Stderr(s) => s,
        }
    }
}

pub struct ProcessRunner {
    cancel: Arc<AtomicBool>,
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new(cancel: Arc<AtomicBool>) -> Self {
        Self {
            cancel,
            timeout: None,
        }
    }

    // Shares the cancel flag; additionally kills the child once `timeout`
    // elapses.
    pub fn with_timeout(&self, timeout: Duration) -> ProcessRunner {
        ProcessRunner {
            cancel: Arc::clone(&self.cancel),
            timeout: Some(timeout),
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn run_streaming(
        &self,
        tool: &str,
        command: &mut Command,
        mut on_line: impl FnMut(&StreamLine),
    ) -> Result<()> {
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::ExternalToolMissing {
                tool: tool.to_string(),
            },
            _ => EngineError::Io(e),
        })?;

        let (tx, rx) = crossbeam_channel::unbounded::<StreamLine>();
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            thread::spawn(move || {
                for line in BufReader::new(stdout).lines().map_while(|l| l.ok()) {
                    if tx.send(StreamLine::Stdout(line)).is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                    if tx.send(StreamLine::Stderr(line)).is_err() {
                        break;
                    }
                }
            });
        } else {
            drop(tx);
        }

        let started = Instant::now();
        let mut stderr_lines: Vec<String> = Vec::new();
        loop {
            if self.is_canceled() {
                kill_child_process_tree(&mut child);
                return Err(EngineError::Canceled);
            }
            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    kill_child_process_tree(&mut child);
                    return Err(EngineError::ExternalToolFailed {
                        tool: tool.to_string(),
                        code: None,
                        stderr: format!("timed out after {}s", timeout.as_secs()),
                    });
                }
            }
            match rx.recv_timeout(Duration::from_millis(POLL_INTERVAL_MS)) {
                Ok(line) => {
                    if let StreamLine::Stderr(text) = &line {
                        stderr_lines.push(text.clone());
                    }
                    on_line(&line);
                }
                Err(RecvTimeoutError::Timeout) => {}
                // Both pipes hit EOF, so the child is done or about to be.
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let status = child.wait()?;
        if self.is_canceled() {
            return Err(EngineError::Canceled);
        }
        if !status.success() {
            return Err(EngineError::ExternalToolFailed {
                tool: tool.to_string(),
                code: status.code(),
                stderr: stderr_lines.join("\n"),
            });
        }
        Ok(())
    }

    // Turns `frame=` stderr lines into percent callbacks. Progress never
    // moves backwards even when ffmpeg restarts its counter between passes.
    pub fn run_with_frame_progress(
        &self,
        tool: &str,
        command: &mut Command,
        total_frames: u64,
        mut on_percent: impl FnMut(u8),
    ) -> Result<()> {
        let total = total_frames.max(1);
        let mut last_percent = 0u8;
        self.run_streaming(tool, command, |line| {
            if let StreamLine::Stderr(text) = line {
                if let Some(frame) = parse_frame_number(text) {
                    let percent = frame_percent(frame, total);
                    if percent > last_percent {
                        last_percent = percent;
                        on_percent(percent);
                    }
                }
            }
        })
    }
}

// `frame=  245 fps= 52 q=28.0 size=...` -> 245
pub fn parse_frame_number(line: &str) -> Option<u64> {
    static FRAME_MARKER: OnceLock<Regex> = OnceLock::new();
    let re = FRAME_MARKER.get_or_init(|| Regex::new(r"frame=\s*(\d+)").unwrap());
    re.captures(line)?[1].parse().ok()
}

pub fn frame_percent(frame: u64, total_frames: u64) -> u8 {
    let total = total_frames.max(1);
    (frame.saturating_mul(100) / total).min(100) as u8
}

// Windows needs taskkill because `Child::kill` leaves grandchildren (ffmpeg
// spawned by yt-dlp) running.
pub fn kill_child_process_tree(child: &mut std::process::Child) {
    #[cfg(windows)]
    {
        let pid = child.id().to_string();
        let _ = crate::cmd::command("taskkill")
            .args(["/PID", &pid, "/T", "/F"])
            .status();
    }

    let _ = child.kill();
    let _ = child.wait();
}
