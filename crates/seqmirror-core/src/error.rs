use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    /// The run descriptor exists but cannot be read as a cycle layout.
    #[error("malformed run descriptor {path}: {reason}")]
    MalformedDescriptor { path: PathBuf, reason: String },

    /// A forced shutdown was observed while waiting on the instrument.
    #[error("interrupted by forced shutdown")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, CoreError::Interrupted)
    }
}
