// Error taxonomy for the sampling and training pipeline
//
// Library code returns `VqaResult<T>` when the failure is one of the four
// kinds below. Orchestration code wraps these in `anyhow` with context; callers
// that need the kind back use `err.downcast_ref::<VqaError>()`.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub type VqaResult<T> = std::result::Result<T, VqaError>;

#[derive(Debug, Error)]
pub enum VqaError {
    /// A corpus document, cache or feature file does not match the expected schema
    #[error("malformed input {}: {reason}", path.display())]
    MalformedInput { path: PathBuf, reason: String },

    /// A sampled annotation references a question id absent from the question corpus
    #[error("annotation references question_id {question_id}, which is missing from the question corpus")]
    MissingReference { question_id: u64 },

    /// Non-positive sizes, unknown model selectors, zero cadences
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Filesystem failure on corpora, caches, features, checkpoints or results
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl VqaError {
    pub fn malformed(path: impl AsRef<Path>, reason: impl fmt::Display) -> Self {
        Self::MalformedInput {
            path: path.as_ref().to_path_buf(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Short hint printed under the error by the binary
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::MalformedInput { .. } => {
                "Check that the file is the FSVQA JSON (or a cache written by `genvqa sample`)"
            }
            Self::MissingReference { .. } => {
                "The annotation and question corpora come from different splits or are corrupted"
            }
            Self::InvalidArgument(_) => "Run with --help to see accepted values",
            Self::Io { .. } => "Check that the path exists and is readable/writable",
        }
    }
}

/// Attach a path to a raw I/O result
pub trait IoContext<T> {
    fn at_path(self, path: impl AsRef<Path>) -> VqaResult<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at_path(self, path: impl AsRef<Path>) -> VqaResult<T> {
        self.map_err(|e| VqaError::io(path, e))
    }
}

/// Format an error with its suggestion, the way the binary prints failures
pub fn wrap_error_with_suggestion(error: &anyhow::Error) -> String {
    match error.downcast_ref::<VqaError>() {
        Some(kind) => format!(
            "{:#}\n\n\x1b[1;33mSuggestion:\x1b[0m {}",
            error,
            kind.suggestion()
        ),
        None => format!("{:#}", error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_context_keeps_path() {
        let result: io::Result<()> = Err(io::Error::new(io::ErrorKind::NotFound, "gone"));
        let err = result.at_path("/tmp/annotations.json").unwrap_err();
        match err {
            VqaError::Io { path, .. } => assert_eq!(path, PathBuf::from("/tmp/annotations.json")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_suggestion_attached_to_typed_errors() {
        let err = anyhow::Error::new(VqaError::invalid("k must be positive"))
            .context("Failed to sample FSVQA subset");
        let msg = wrap_error_with_suggestion(&err);
        assert!(msg.contains("k must be positive"));
        assert!(msg.contains("--help"));
    }

    #[test]
    fn test_untyped_errors_have_no_suggestion() {
        let err = anyhow::anyhow!("tensor shape mismatch");
        let msg = wrap_error_with_suggestion(&err);
        assert_eq!(msg, "tensor shape mismatch");
    }
}
