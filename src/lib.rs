//! # fichegen
//!
//! Generate structured lesson documents (lesson plans, written evaluations,
//! quizzes) for a topic and class level, grounded in the reference PDF guides
//! the classroom already uses.
//!
//! ## Why this crate?
//!
//! Asking a model for "a lesson plan on the water cycle" gives generic text
//! that ignores the official guide and comes back in a different shape every
//! time. This crate pulls the relevant guide sections into the prompt, makes
//! the model answer in a marker-annotated markdown contract, checks that
//! contract, and turns the result into a renderer-agnostic document tree.
//!
//! ## Pipeline Overview
//!
//! ```text
//! topic + class
//!  │
//!  ├─ 1. Guides     index PDFs (cached by fingerprint), select excerpts
//!  ├─ 2. Generate   primary model, one fallback attempt, structure check
//!  ├─ 3. Build      {{FIELD}} / {{TABLE}} / {{IMAGE}} markdown → DocumentTree
//!  ├─ 4. Illustrate optional image generation per placeholder
//!  └─ 5. Render     markdown / JSON (or external PDF/DOCX renderers)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fichegen::{DocumentKind, JobRequest, Orchestrator, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Text provider key read from GEMINI_API_KEY
//!     let config = PipelineConfig::builder()
//!         .guides_dir("guides")
//!         .output_dir("out")
//!         .build()?;
//!     let orchestrator = Orchestrator::from_config(config)?;
//!     let job = orchestrator.submit(JobRequest::new(DocumentKind::Fiche, "Les fractions", "CM1"))?;
//!     println!("{:?}", job.outcome().await?.state());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `fichegen` binary (clap + indicatif + anyhow + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod document;
pub mod error;
pub mod generate;
pub mod guide;
pub mod illustrate;
pub mod markers;
pub mod orchestrator;
pub mod progress;
pub mod prompts;
pub mod render;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{DocumentKind, GenerationParams, ModelPair, OutputFormat, PipelineConfig, PipelineConfigBuilder};
pub use document::{build, DocumentNode, DocumentTree, MetadataBanner, TextRun};
pub use error::{ExtractionError, FicheError, GenerationError, IllustrationError, ParseError, RenderError};
pub use generate::{
    ContentGenerator, Difficulty, DocumentOptions, GenerationRequest, GenerationResult, ModelRole, Provenance, QuizFormat,
    QuizType, TextModel,
};
pub use guide::{GuideIndex, GuideIndexer, GuideParser, PdfiumGuideParser};
pub use illustrate::{ImageModel, Illustrator};
pub use orchestrator::{DocumentKey, JobHandle, JobRequest, Orchestrator};
pub use progress::{CancelFlag, JobEvent, JobId, JobOutcome, JobState};
pub use render::{DocumentRenderer, JsonRenderer, MarkdownRenderer};
