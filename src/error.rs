//! Error type shared by every pipeline stage.
//!
//! Each stage returns [`Result`]; nothing is thrown across the run boundary.
//! [`Error::Context`] wraps a cause with a short description of what was being
//! done, and [`chain`] renders the whole causal chain down to the innermost
//! message for the final status report.

use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Structurally invalid container: truncated TOC, page out of bounds,
    /// cyclic page chain, duplicate block names.
    #[error("Malformed container: {0}")]
    MalformedContainer(String),

    #[error("Corrupt compressed block '{block}': {reason}")]
    CorruptCompressedBlock { block: String, reason: String },

    #[error("Property table error in '{block}': {reason}")]
    MetadataFormat { block: String, reason: String },

    #[error("Unsupported version '{0}'")]
    UnsupportedVersion(String),

    #[error("Structural mismatch at {path}: {reason}")]
    StructuralMismatch { path: PathBuf, reason: String },

    #[error("Text in {path} cannot be encoded: {reason}")]
    TextEncoding { path: PathBuf, reason: String },

    #[error("Bad index file {path}: {reason}")]
    IndexLoad { path: PathBuf, reason: String },

    /// An index was supplied but merged to nothing; the run produces no output.
    #[error("Index {0} is empty, nothing to do")]
    EmptyIndex(PathBuf),

    #[error("Invalid descent '{0}': expected 1 to 4 dot-separated numbers of up to 3 digits")]
    InvalidDescent(String),

    #[error("Invalid option: {0}")]
    InvalidOption(String),

    #[error("Bad manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Every unit failure of one data-parallel stage.
    #[error("{stage} failed for {} unit(s): {}", .failures.len(), summarize(.failures))]
    Stage {
        stage: &'static str,
        failures: Vec<Error>,
    },

    #[error("{context}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Error::Io { path: path.as_ref().to_path_buf(), source }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Error::MalformedContainer(reason.into())
    }

    pub fn mismatch(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Error::StructuralMismatch { path: path.as_ref().to_path_buf(), reason: reason.into() }
    }

    /// The innermost error, skipping context wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root_cause(),
            Error::Stage { failures, .. } if failures.len() == 1 => failures[0].root_cause(),
            other => other,
        }
    }
}

fn summarize(failures: &[Error]) -> String {
    failures.iter().map(|e| chain(e)).collect::<Vec<_>>().join("; ")
}

/// Attach a description of the current operation to an error.
pub trait ResultExt<T> {
    fn context<C: Into<String>>(self, context: C) -> Result<T>;
    fn with_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|e| Error::Context { context: context.into(), source: Box::new(e) })
    }

    fn with_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T> {
        self.map_err(|e| Error::Context { context: f().into(), source: Box::new(e) })
    }
}

/// Render `err` and all of its sources as `outer: inner: innermost`.
pub fn chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        let _ = write!(out, ": {cause}");
        current = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_keeps_innermost_message() {
        let inner: Result<()> = Err(Error::malformed("TOC truncated"));
        let err = inner
            .context("reading decode_stage_0")
            .context("extract failed")
            .unwrap_err();
        let rendered = chain(&err);
        assert!(rendered.starts_with("extract failed"));
        assert!(rendered.ends_with("Malformed container: TOC truncated"));
        assert!(matches!(err.root_cause(), Error::MalformedContainer(_)));
    }

    #[test]
    fn stage_error_lists_every_failure() {
        let err = Error::Stage {
            stage: "decompress",
            failures: vec![
                Error::CorruptCompressedBlock { block: "a".into(), reason: "bad".into() },
                Error::CorruptCompressedBlock { block: "b".into(), reason: "bad".into() },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("2 unit(s)"));
        assert!(text.contains("'a'") && text.contains("'b'"));
    }
}
