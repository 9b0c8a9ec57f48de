pub mod cmd;
pub mod downloader;
pub mod effects;
mod error;
pub mod ffmpeg;
pub mod filtergraph;
pub mod jobs;
pub mod paths;
pub mod process;

pub use error::{EngineError, Result};
