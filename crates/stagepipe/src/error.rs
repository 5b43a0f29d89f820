//! Error types for the pipeline library.

use std::time::Duration;
use thiserror::Error;

/// Main error type for pipeline operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Configuration error (invalid YAML, bad field values, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A transform failed while processing an item.
    #[error("Transform failed in stage '{stage}': {message}")]
    Transform { stage: String, message: String },

    /// A worker task panicked or could not be joined.
    #[error("Worker failure in stage '{stage}': {message}")]
    Worker { stage: String, message: String },

    /// An item was offered to a channel after it was closed.
    #[error("Channel is closed")]
    ChannelClosed,

    /// A deadline-bounded channel operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The pipeline run was cancelled before this operation completed.
    #[error("Pipeline run cancelled")]
    Cancelled,

    /// IO error (config file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Create a Transform error for a named stage.
    pub fn transform(stage: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Transform {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Create a Worker error for a named stage.
    pub fn worker(stage: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Worker {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Format error with full details including error chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_helper() {
        let err = PipelineError::transform("resize", "bad image header");
        assert_eq!(
            err.to_string(),
            "Transform failed in stage 'resize': bad image header"
        );
    }

    #[test]
    fn test_format_detailed_includes_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.yaml");
        let err = PipelineError::from(io);
        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Error: IO error"));
        assert!(detailed.contains("Caused by"));
    }
}
