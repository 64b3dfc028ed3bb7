//! Configuration types for the lesson-generation pipeline.
//!
//! Every knob the pipeline consumes lives in [`PipelineConfig`], built via
//! [`PipelineConfigBuilder`]. One struct means one place to look when two runs
//! behave differently, and it can be cloned into each background job without
//! sharing mutable state.
//!
//! # Design choice: builder over constructor
//! Most callers only care about directories and maybe the model pair. The
//! builder lets them set those and inherit documented defaults for the rest,
//! while `build()` still rejects nonsensical combinations up front.

use crate::error::FicheError;
use crate::prompts::PromptTemplates;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

/// Default primary text model: slow but capable.
pub const DEFAULT_TEXT_MODEL: &str = "gemini-2.5-pro";
/// Default fallback text model: fast and resilient.
pub const DEFAULT_TEXT_FALLBACK: &str = "gemini-2.5-flash";
/// Default image-generation model.
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image";

/// Configuration for the whole pipeline.
///
/// Built via [`PipelineConfig::builder()`] or [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use fichegen::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .guides_dir("guides")
///     .output_dir("out")
///     .excerpt_budget(4000)
///     .illustrations(true)
///     .build()
///     .unwrap();
/// assert!(config.illustrations_enabled);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Directory scanned for guide PDFs when a job names none. Read-only. Default: `guides`.
    pub guides_dir: PathBuf,

    /// Directory holding student textbooks (`livre_<class>.pdf`, …). Default: None.
    ///
    /// Only read for jobs that ask for the textbook as a secondary source.
    pub textbooks_dir: Option<PathBuf>,

    /// Directory rendered documents are written to. Default: `out`.
    pub output_dir: PathBuf,

    /// Directory holding one JSON index per guide. Default: `.fichegen-cache`.
    ///
    /// Safe to delete at any time; a missing entry only costs one re-parse.
    pub cache_dir: PathBuf,

    /// Maximum characters of guide text injected into one prompt. Default: 6000.
    ///
    /// Guides run to hundreds of pages; only the section matching the topic
    /// is useful, and a bounded excerpt keeps prompt cost predictable.
    pub excerpt_budget: usize,

    /// Run the illustration stage. Default: false.
    pub illustrations_enabled: bool,

    /// Text models for lesson content. Default: gemini-2.5-pro → gemini-2.5-flash.
    pub text_models: ModelPair,

    /// Image models for illustrations. Default: gemini-2.5-flash-image, no fallback.
    pub image_models: ModelPair,

    /// edgequake-llm provider name used for text models. Default: `"gemini"`.
    pub provider_name: String,

    /// API key for the image endpoint. If None, read from `GEMINI_API_KEY`.
    ///
    /// Text providers read their own key from the environment through
    /// edgequake-llm's provider factory.
    pub api_key: Option<String>,

    /// Sampling parameters passed to text models.
    pub params: GenerationParams,

    /// Per-model-call timeout in seconds. Default: 120.
    ///
    /// A stuck primary call must not hold the job forever; on timeout the
    /// fallback model gets its turn.
    pub api_timeout_secs: u64,

    /// Concurrent image requests per job. Default: 2.
    ///
    /// Image endpoints are quota-bound; two in flight keeps a document with
    /// five placeholders quick without tripping 429s.
    pub illustration_concurrency: usize,

    /// Formats rendered by the built-in renderers. Default: Markdown only.
    pub formats: Vec<OutputFormat>,

    /// Prompt templates. Default: the built-in French templates.
    pub prompts: PromptTemplates,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            guides_dir: PathBuf::from("guides"),
            textbooks_dir: None,
            output_dir: PathBuf::from("out"),
            cache_dir: PathBuf::from(".fichegen-cache"),
            excerpt_budget: 6000,
            illustrations_enabled: false,
            text_models: ModelPair::new(DEFAULT_TEXT_MODEL, Some(DEFAULT_TEXT_FALLBACK)),
            image_models: ModelPair::new(DEFAULT_IMAGE_MODEL, None::<&str>),
            provider_name: "gemini".to_string(),
            api_key: None,
            params: GenerationParams::default(),
            api_timeout_secs: 120,
            illustration_concurrency: 2,
            formats: vec![OutputFormat::Markdown],
            prompts: PromptTemplates::default(),
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("guides_dir", &self.guides_dir)
            .field("textbooks_dir", &self.textbooks_dir)
            .field("output_dir", &self.output_dir)
            .field("cache_dir", &self.cache_dir)
            .field("excerpt_budget", &self.excerpt_budget)
            .field("illustrations_enabled", &self.illustrations_enabled)
            .field("text_models", &self.text_models)
            .field("image_models", &self.image_models)
            .field("provider_name", &self.provider_name)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("params", &self.params)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("illustration_concurrency", &self.illustration_concurrency)
            .field("formats", &self.formats)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// The image API key, from config or `GEMINI_API_KEY`.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("GEMINI_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn guides_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.guides_dir = dir.into();
        self
    }

    pub fn textbooks_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.textbooks_dir = Some(dir.into());
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = dir.into();
        self
    }

    pub fn excerpt_budget(mut self, chars: usize) -> Self {
        self.config.excerpt_budget = chars;
        self
    }

    pub fn illustrations(mut self, enabled: bool) -> Self {
        self.config.illustrations_enabled = enabled;
        self
    }

    pub fn text_model(mut self, model: impl Into<String>) -> Self {
        self.config.text_models.primary = model.into();
        self
    }

    /// Set the text fallback model; `None` disables the retry.
    pub fn text_fallback(mut self, model: Option<impl Into<String>>) -> Self {
        self.config.text_models.fallback = model.map(Into::into);
        self
    }

    pub fn image_model(mut self, model: impl Into<String>) -> Self {
        self.config.image_models.primary = model.into();
        self
    }

    pub fn image_fallback(mut self, model: Option<impl Into<String>>) -> Self {
        self.config.image_models.fallback = model.map(Into::into);
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = name.into();
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.params.temperature = t.clamp(0.0, 1.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.params.max_tokens = n;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn illustration_concurrency(mut self, n: usize) -> Self {
        self.config.illustration_concurrency = n.max(1);
        self
    }

    pub fn formats(mut self, formats: Vec<OutputFormat>) -> Self {
        self.config.formats = formats;
        self
    }

    pub fn prompts(mut self, prompts: PromptTemplates) -> Self {
        self.config.prompts = prompts;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(mut self) -> Result<PipelineConfig, FicheError> {
        let c = &mut self.config;
        if c.excerpt_budget < 200 {
            return Err(FicheError::InvalidConfig(format!(
                "Excerpt budget must be ≥ 200 characters, got {}",
                c.excerpt_budget
            )));
        }
        if c.text_models.primary.trim().is_empty() {
            return Err(FicheError::InvalidConfig(
                "Primary text model must not be empty".into(),
            ));
        }
        if c.illustrations_enabled && c.image_models.primary.trim().is_empty() {
            return Err(FicheError::InvalidConfig(
                "Illustrations are enabled but no image model is set".into(),
            ));
        }
        if c.api_timeout_secs == 0 {
            return Err(FicheError::InvalidConfig(
                "API timeout must be ≥ 1 second".into(),
            ));
        }
        if c.params.max_tokens == 0 {
            return Err(FicheError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        let mut seen = HashSet::new();
        c.formats.retain(|f| seen.insert(*f));
        Ok(self.config)
    }
}

// ── Value types ──────────────────────────────────────────────────────────

/// A primary model and the optional model tried once when it fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPair {
    pub primary: String,
    pub fallback: Option<String>,
}

impl ModelPair {
    pub fn new(primary: impl Into<String>, fallback: Option<impl Into<String>>) -> Self {
        Self {
            primary: primary.into(),
            fallback: fallback.map(Into::into),
        }
    }
}

/// Sampling parameters for text generation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Sampling temperature, 0.0–1.0. Default: 0.5.
    ///
    /// Lesson plans benefit from some variety in phrasing but must stay on
    /// the required structure; above 1.0 models start dropping markers.
    pub temperature: f32,

    /// Maximum output tokens per call. Default: 8192.
    pub max_tokens: usize,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.5,
            max_tokens: 8192,
        }
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// The three lesson documents the pipeline can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    /// Lesson plan (fiche pédagogique).
    Fiche,
    Evaluation,
    Quiz,
}

impl DocumentKind {
    /// Lowercase identifier used in keys and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fiche => "fiche",
            Self::Evaluation => "evaluation",
            Self::Quiz => "quiz",
        }
    }

    /// Prefix used for output file names.
    pub fn file_prefix(self) -> &'static str {
        match self {
            Self::Fiche => "Fiche",
            Self::Evaluation => "Evaluation",
            Self::Quiz => "Quiz",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DocumentKind {
    type Err = FicheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fiche" | "lesson" => Ok(Self::Fiche),
            "evaluation" | "évaluation" => Ok(Self::Evaluation),
            "quiz" => Ok(Self::Quiz),
            other => Err(FicheError::InvalidConfig(format!(
                "Unknown document kind '{other}' (expected fiche, evaluation or quiz)"
            ))),
        }
    }
}

/// Output formats produced by the built-in renderers.
///
/// PDF and DOCX belong to external renderer collaborators; they plug in
/// through [`crate::render::DocumentRenderer`] with their own format tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Markdown,
    Json,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Markdown => "md",
            Self::Json => "json",
        }
    }
}
