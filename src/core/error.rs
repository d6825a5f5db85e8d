use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FngError {
    #[error("Fetch error: {0}")]
    Fetch(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Version control error: {0}")]
    VersionControl(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Run failed: {0}")]
    RunFailed(String),
}

impl FngError {
    /// Fetch failures are expected to clear up on a later run.
    pub fn is_transient(&self) -> bool {
        matches!(self, FngError::Fetch(_))
    }
}

impl From<reqwest::Error> for FngError {
    fn from(e: reqwest::Error) -> Self {
        FngError::Fetch(e.to_string())
    }
}

impl From<toml::de::Error> for FngError {
    fn from(e: toml::de::Error) -> Self {
        FngError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for FngError {
    fn from(e: toml::ser::Error) -> Self {
        FngError::Config(e.to_string())
    }
}
