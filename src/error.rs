//! Error types for config resolution and the feed-forward block.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiffusionLmError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A value did not match its primitive type, or a required key was absent.
    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Shape mismatch: {0}")]
    Shape(String),
}

pub type Result<T> = std::result::Result<T, DiffusionLmError>;
