//! Error types for the fichegen library.
//!
//! Failures are split by how far they are allowed to travel:
//!
//! * [`ExtractionError`] — **Non-fatal**: one guide PDF could not be indexed
//!   (missing, encrypted, corrupt, image-only). The orchestrator skips that
//!   guide and keeps going with whatever context remains.
//!
//! * [`IllustrationError`] — **Absorbed**: one image request failed. The
//!   placeholder stays unresolved and is rendered as a caption.
//!
//! * [`GenerationError`] and [`ParseError`] — **Fatal to the job**: the lesson
//!   text could not be produced or could not be turned into a document tree.
//!   They end the job in `Failed` but never touch other jobs.
//!
//! * [`FicheError`] — **Fatal at the API surface**: bad configuration, a
//!   duplicate job for the same document, output that could not be written.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors returned by the public API.
#[derive(Debug, Error)]
pub enum FicheError {
    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The text-model provider could not be created (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Job errors ────────────────────────────────────────────────────────
    /// A job for the same target document is still running.
    #[error("A job is already running for '{key}'.\nWait for it to finish or cancel it first.")]
    JobAlreadyActive { key: String },

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Render(#[from] RenderError),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output document.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The guides directory could not be listed.
    #[error("Cannot read guides directory '{path}': {source}")]
    GuidesDirUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A guide PDF could not be indexed. The guide is skipped.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum ExtractionError {
    #[error("Guide not found: '{path}'")]
    NotFound { path: PathBuf },

    #[error("Guide '{path}' is encrypted and cannot be indexed")]
    Encrypted { path: PathBuf },

    #[error("Guide '{path}' is corrupt: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    /// Every page is image-only or blank.
    #[error("Guide '{path}' contains no extractable text (scanned document?)")]
    NoText { path: PathBuf },

    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH to the directory containing libpdfium, or install it system-wide."
    )]
    Binding(String),

    #[error("I/O error on '{path}': {detail}")]
    Io { path: PathBuf, detail: String },

    #[error("Internal error while indexing: {0}")]
    Internal(String),
}

/// Both model attempts failed, or the job was cancelled mid-generation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GenerationError {
    /// Primary failed and the fallback failed too. No partial result exists.
    #[error("Content generation failed.\n  primary ({primary_model}): {primary}\n  fallback ({fallback_model}): {fallback}")]
    Exhausted {
        primary_model: String,
        primary: String,
        fallback_model: String,
        fallback: String,
    },

    /// Primary failed and no fallback model is configured.
    #[error("Content generation failed ({model}): {reason}\nConfigure a fallback model to retry automatically.")]
    PrimaryFailed { model: String, reason: String },

    #[error("Content generation cancelled")]
    Cancelled,
}

impl GenerationError {
    /// Human-readable reason from the attempt that failed last.
    pub fn reason(&self) -> &str {
        match self {
            Self::Exhausted { fallback, .. } => fallback,
            Self::PrimaryFailed { reason, .. } => reason,
            Self::Cancelled => "cancelled",
        }
    }
}

/// Why a single model attempt was rejected.
///
/// These never leave the generator on their own; they are folded into a
/// [`GenerationError`] once both attempts are used up.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AttemptError {
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("empty response")]
    Empty,

    #[error("structure check failed: {0}")]
    Structure(String),
}

/// Markdown that cannot be turned into a document tree.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Parse error at line {line}: {reason}")]
pub struct ParseError {
    /// 1-based line number of the offending marker.
    pub line: usize,
    pub reason: String,
}

/// One image request failed. Always absorbed by the illustrator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum IllustrationError {
    #[error("Image quota exceeded for model '{model}'")]
    Quota { model: String },

    /// The model declined the prompt or returned something that is not an image.
    #[error("Unsupported image content: {0}")]
    Unsupported(String),

    #[error("Image request timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Image API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Image transport error: {0}")]
    Transport(String),

    #[error("Cancelled before the image request was sent")]
    Cancelled,
}

/// A renderer collaborator could not produce its output.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Renderer '{format}' failed: {detail}")]
    Failed { format: String, detail: String },

    #[error("Serialisation failed: {0}")]
    Serialize(#[from] serde_json::Error),
}
