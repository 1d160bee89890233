//! Error kinds for the page-to-text pipeline.
//!
//! Components report one of these so that callers can tell a fatal
//! configuration problem apart from a per-document failure, and tests can
//! match on the kind instead of on log output.

use thiserror::Error;

use crate::prelude::*;

/// An error raised by one stage of the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The document is missing, corrupted, or not a PDF.
    #[error("cannot open document {path:?}: {reason}")]
    DocumentOpen { path: PathBuf, reason: String },

    /// A specific page could not be rasterized.
    #[error("cannot render page {page} of {path:?}: {reason}")]
    Render {
        path: PathBuf,
        page: usize,
        reason: String,
    },

    /// A page image could not be decoded or recognized.
    #[error("OCR failed on page {page}: {reason}")]
    Ocr { page: usize, reason: String },

    /// The language-model service failed, timed out, or returned nothing
    /// usable.
    #[error("text correction failed: {0}")]
    CorrectionService(String),

    /// The output document could not be created or written.
    #[error("cannot write {path:?}: {reason}")]
    Write { path: PathBuf, reason: String },

    /// The process is misconfigured and must not start.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl PipelineError {
    /// Build a [`PipelineError::DocumentOpen`] from any displayable cause.
    pub fn document_open(path: &Path, reason: impl std::fmt::Display) -> Self {
        Self::DocumentOpen {
            path: path.to_owned(),
            reason: format!("{reason:#}"),
        }
    }

    /// Build a [`PipelineError::Render`] from any displayable cause.
    pub fn render(path: &Path, page: usize, reason: impl std::fmt::Display) -> Self {
        Self::Render {
            path: path.to_owned(),
            page,
            reason: format!("{reason:#}"),
        }
    }

    /// What we were doing when this error happened, for log messages.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::DocumentOpen { .. } => "reading input",
            Self::Render { .. } => "rendering page",
            Self::Ocr { .. } => "running OCR",
            Self::CorrectionService(_) => "correcting text",
            Self::Write { .. } => "writing output",
            Self::Configuration(_) => "reading configuration",
        }
    }

    /// Build a [`PipelineError::Write`] from any displayable cause.
    pub fn write(path: &Path, reason: impl std::fmt::Display) -> Self {
        Self::Write {
            path: path.to_owned(),
            reason: format!("{reason:#}"),
        }
    }
}
