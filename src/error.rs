use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("failed to fetch video info: {0}")]
    InfoFetch(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("external tool is missing: {tool}")]
    ExternalToolMissing { tool: String },

    #[error("external tool failed: {tool} (code={code:?}) {stderr}")]
    ExternalToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("video dimensions are not known yet")]
    PreviewUnavailable,

    #[error("no effects selected, nothing to process")]
    NoEffectsSelected,

    #[error("filesystem error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Not a failure. Workers return this to unwind after the cancel flag is
    /// observed; the job boundary maps it to the Canceled terminal status.
    #[error("job canceled")]
    Canceled,
}

pub type Result<T> = std::result::Result<T, EngineError>;
