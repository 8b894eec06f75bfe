use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanwatchError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigValidationError),
    #[error("kv backend error: {0}")]
    Kv(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("request failed with status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("unable to decode response: {0}")]
    Decode(String),
    #[error("no library paths configured")]
    NoLibraryPaths,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = ScanwatchError> = std::result::Result<T, E>;
