//! Job supervision: the only component that sees more than one stage.
//!
//! A job walks `Queued → ExtractingGuides → Generating → BuildingDocument →
//! [Illustrating] → Rendering → Completed`, strictly in that order. Each
//! stage starts only once the previous stage's result is in hand, and the
//! cancel flag is checked at every boundary. A failing stage ends the job
//! in `Failed` with the cause attached; nothing is retried across stages.
//!
//! ## One job per document
//!
//! Two jobs writing the same fiche would race on the output name and waste
//! two model calls. [`Orchestrator::submit`] therefore refuses a job whose
//! [`DocumentKey`] is already active. Jobs for different documents run
//! independently on their own Tokio tasks.
//!
//! # Example
//!
//! ```rust,no_run
//! use fichegen::{DocumentKind, JobEvent, JobRequest, Orchestrator, PipelineConfig};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), fichegen::FicheError> {
//! let config = PipelineConfig::builder().guides_dir("guides").build()?;
//! let orchestrator = Orchestrator::from_config(config)?;
//!
//! let mut job = orchestrator.submit(JobRequest::new(DocumentKind::Fiche, "Le cycle de l'eau", "CM1"))?;
//! while let Some(event) = job.events().next().await {
//!     if let JobEvent::Progress { label, .. } = event {
//!         println!("{label}");
//!     }
//! }
//! let outcome = job.outcome().await?;
//! println!("{:?}", outcome.state());
//! # Ok(())
//! # }
//! ```

use crate::config::{DocumentKind, PipelineConfig};
use crate::document;
use crate::error::{FicheError, GenerationError};
use crate::generate::{ContentGenerator, DocumentOptions, GenerationRequest, LlmTextModel};
use crate::guide::{
    self, excerpts_for_pages, select_excerpts, select_excerpts_for_topics, ExcerptOrigin, GuideExcerpt, GuideIndex,
    GuideIndexer, PdfiumGuideParser,
};
use crate::illustrate::{GeminiImageModel, Illustrator};
use crate::progress::{event_channel, CancelFlag, JobEvents, JobId, JobOutcome, JobState, Reporter};
use crate::render::{self, renderer_for, DocumentRenderer};
use edgequake_llm::ProviderFactory;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// What the caller asks for.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub kind: DocumentKind,
    pub topic: String,
    pub class_level: String,
    pub subject: Option<String>,
    pub duration_minutes: u32,
    /// Guides to index. Empty means "discover in the guides directory".
    pub guides: Vec<PathBuf>,
    /// Physical guide pages to use instead of topic matching. Empty means automatic.
    pub pages: Vec<u32>,
    /// Also read the student textbook found in the textbooks directory.
    pub use_textbook: bool,
    pub special_instructions: Option<String>,
    pub options: DocumentOptions,
}

impl JobRequest {
    pub fn new(kind: DocumentKind, topic: impl Into<String>, class_level: impl Into<String>) -> Self {
        Self {
            kind,
            topic: topic.into(),
            class_level: class_level.into(),
            subject: None,
            duration_minutes: 45,
            guides: Vec::new(),
            pages: Vec::new(),
            use_textbook: false,
            special_instructions: None,
            options: DocumentOptions::default(),
        }
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn duration_minutes(mut self, minutes: u32) -> Self {
        self.duration_minutes = minutes;
        self
    }

    pub fn guides(mut self, guides: Vec<PathBuf>) -> Self {
        self.guides = guides;
        self
    }

    /// Use these guide pages verbatim; see [`guide::parse_page_list`].
    pub fn pages(mut self, pages: Vec<u32>) -> Self {
        self.pages = pages;
        self
    }

    pub fn use_textbook(mut self, enabled: bool) -> Self {
        self.use_textbook = enabled;
        self
    }

    pub fn special_instructions(mut self, text: impl Into<String>) -> Self {
        self.special_instructions = Some(text.into());
        self
    }

    pub fn options(mut self, options: DocumentOptions) -> Self {
        self.options = options;
        self
    }

    pub fn key(&self) -> DocumentKey {
        DocumentKey {
            kind: self.kind,
            topic: self.topic.trim().to_lowercase(),
            class_level: self.class_level.trim().to_lowercase(),
        }
    }
}

/// Identity of a target document; at most one active job per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentKey {
    pub kind: DocumentKind,
    pub topic: String,
    pub class_level: String,
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.topic, self.class_level)
    }
}

/// A submitted job: its events, its cancel flag, and eventually its outcome.
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    cancel: CancelFlag,
    events: JobEvents,
    join: JoinHandle<JobOutcome>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Progress events; the stream ends after `Finished`.
    pub fn events(&mut self) -> &mut JobEvents {
        &mut self.events
    }

    /// Wait for the job to end.
    pub async fn outcome(self) -> Result<JobOutcome, FicheError> {
        self.join
            .await
            .map_err(|e| FicheError::Internal(format!("Job task panicked: {}", e)))
    }
}

/// Removes a key from the active set when the job's task ends, panics included.
struct ActiveGuard {
    active: Arc<Mutex<HashSet<DocumentKey>>>,
    key: DocumentKey,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.key);
    }
}

/// Runs pipeline jobs.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    indexer: GuideIndexer,
    generator: ContentGenerator,
    illustrator: Option<Illustrator>,
    renderers: Arc<Vec<Box<dyn DocumentRenderer>>>,
    active: Arc<Mutex<HashSet<DocumentKey>>>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("illustrator", &self.illustrator.is_some())
            .field("renderers", &self.renderers.len())
            .finish()
    }
}

impl Orchestrator {
    /// Assemble from parts. Renderers default to the configured formats and
    /// illustration is off until [`Orchestrator::with_illustrator`].
    pub fn new(config: PipelineConfig, indexer: GuideIndexer, generator: ContentGenerator) -> Self {
        let renderers = config.formats.iter().map(|f| renderer_for(*f)).collect();
        Self {
            config: Arc::new(config),
            indexer,
            generator,
            illustrator: None,
            renderers: Arc::new(renderers),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_illustrator(mut self, illustrator: Illustrator) -> Self {
        self.illustrator = Some(illustrator);
        self
    }

    pub fn with_renderers(mut self, renderers: Vec<Box<dyn DocumentRenderer>>) -> Self {
        self.renderers = Arc::new(renderers);
        self
    }

    /// Production wiring: pdfium guides, edgequake-llm text, Gemini images.
    ///
    /// # Errors
    /// [`FicheError::ProviderNotConfigured`] if the text provider cannot be
    /// created for the primary model, or illustrations are enabled without
    /// an API key.
    pub fn from_config(config: PipelineConfig) -> Result<Self, FicheError> {
        let primary = config.text_models.primary.clone();
        let provider = ProviderFactory::create_llm_provider(&config.provider_name, &primary)
            .map_err(|e| FicheError::ProviderNotConfigured {
                provider: config.provider_name.clone(),
                hint: format!(
                    "Could not create a client for model '{}'.\n\
                    Set the provider's API key (e.g. GEMINI_API_KEY) or choose another provider.\n\
                    Error: {}",
                    primary, e
                ),
            })?;
        let text = LlmTextModel::new(config.provider_name.clone()).with_provider(primary, provider);

        let indexer = GuideIndexer::new(config.cache_dir.clone(), Arc::new(PdfiumGuideParser::new()));
        let generator = ContentGenerator::from_config(&config, Arc::new(text));

        let illustrator = if config.illustrations_enabled {
            let key = config
                .resolved_api_key()
                .ok_or_else(|| FicheError::ProviderNotConfigured {
                    provider: "gemini (images)".to_string(),
                    hint: "Illustrations need GEMINI_API_KEY or an explicit api_key.".to_string(),
                })?;
            let images = GeminiImageModel::new(key, config.api_timeout_secs)
                .map_err(|e| FicheError::Internal(e.to_string()))?;
            Some(Illustrator::from_config(&config, Arc::new(images)))
        } else {
            None
        };

        let mut orchestrator = Self::new(config, indexer, generator);
        orchestrator.illustrator = illustrator;
        Ok(orchestrator)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn indexer(&self) -> &GuideIndexer {
        &self.indexer
    }

    /// Start a job on its own task.
    ///
    /// # Errors
    /// [`FicheError::JobAlreadyActive`] if a job for the same document is
    /// still running.
    pub fn submit(&self, request: JobRequest) -> Result<JobHandle, FicheError> {
        let key = request.key();
        {
            let mut active = self
                .active
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !active.insert(key.clone()) {
                return Err(FicheError::JobAlreadyActive {
                    key: key.to_string(),
                });
            }
        }
        let guard = ActiveGuard {
            active: Arc::clone(&self.active),
            key,
        };

        let id = JobId::next();
        let cancel = CancelFlag::new();
        let (tx, events) = event_channel();
        let reporter = Reporter::new(id, tx);

        let this = self.clone();
        let job_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            let outcome = this.run_stages(&request, &job_cancel, &reporter).await;
            drop(guard);
            report_end(&reporter, &outcome);
            outcome
        });

        Ok(JobHandle {
            id,
            cancel,
            events,
            join,
        })
    }

    /// Run a job to completion in the caller's task.
    ///
    /// Does not take part in the one-job-per-document check.
    pub async fn run(&self, request: &JobRequest, cancel: &CancelFlag, reporter: &Reporter) -> JobOutcome {
        let outcome = self.run_stages(request, cancel, reporter).await;
        report_end(reporter, &outcome);
        outcome
    }

    async fn run_stages(&self, request: &JobRequest, cancel: &CancelFlag, reporter: &Reporter) -> JobOutcome {
        info!(
            "{}: {} '{}' for {}",
            reporter.job(),
            request.kind,
            request.topic,
            request.class_level
        );
        reporter.state(JobState::Queued);

        // ── Guides ───────────────────────────────────────────────────────
        if cancel.is_cancelled() {
            return JobOutcome::Cancelled {
                after: JobState::Queued,
            };
        }
        reporter.state(JobState::ExtractingGuides);
        let Some(excerpts) = self.extract(request, cancel, reporter).await else {
            return JobOutcome::Cancelled {
                after: JobState::Queued,
            };
        };

        // ── Generation ───────────────────────────────────────────────────
        if cancel.is_cancelled() {
            return JobOutcome::Cancelled {
                after: JobState::ExtractingGuides,
            };
        }
        reporter.state(JobState::Generating);
        let generation = GenerationRequest::new(
            request.kind,
            request.topic.clone(),
            request.class_level.clone(),
            self.config.text_models.clone(),
            self.config.params,
        )
        .with_subject(request.subject.clone())
        .with_duration(request.duration_minutes)
        .with_excerpts(excerpts)
        .with_instructions(request.special_instructions.clone())
        .with_options(request.options.clone());

        let generated = match self.generator.generate_with_cancel(&generation, cancel).await {
            Ok(result) => result,
            Err(GenerationError::Cancelled) => {
                return JobOutcome::Cancelled {
                    after: JobState::ExtractingGuides,
                }
            }
            Err(e) => {
                return JobOutcome::Failed {
                    stage: JobState::Generating,
                    cause: e.to_string(),
                }
            }
        };
        reporter.detail(format!(
            "Content from {} ({:?} model)",
            generated.provenance.model, generated.provenance.role
        ));

        // ── Document tree ────────────────────────────────────────────────
        if cancel.is_cancelled() {
            return JobOutcome::Cancelled {
                after: JobState::Generating,
            };
        }
        reporter.state(JobState::BuildingDocument);
        let mut tree = match document::build(&generated.markdown) {
            Ok(tree) => tree,
            Err(e) => {
                return JobOutcome::Failed {
                    stage: JobState::BuildingDocument,
                    cause: e.to_string(),
                }
            }
        };
        let mut last = JobState::BuildingDocument;

        // ── Illustrations (optional) ─────────────────────────────────────
        if let Some(illustrator) = self.illustrator.as_ref().filter(|_| self.config.illustrations_enabled) {
            if cancel.is_cancelled() {
                return JobOutcome::Cancelled { after: last };
            }
            reporter.state(JobState::Illustrating);
            tree = illustrator.illustrate(tree, &request.class_level, cancel).await;
            if cancel.is_cancelled() {
                return JobOutcome::Cancelled { after: last };
            }
            last = JobState::Illustrating;
        }

        // ── Rendering ────────────────────────────────────────────────────
        if cancel.is_cancelled() {
            return JobOutcome::Cancelled { after: last };
        }
        reporter.state(JobState::Rendering);
        let mut outputs = Vec::with_capacity(self.renderers.len());
        for renderer in self.renderers.iter() {
            if cancel.is_cancelled() {
                return JobOutcome::Cancelled { after: last };
            }
            let written = render::write_document(
                renderer.as_ref(),
                &tree,
                &self.config.output_dir,
                request.kind,
                &request.topic,
                &request.class_level,
            )
            .await;
            match written {
                Ok(path) => outputs.push(path),
                Err(e) => {
                    return JobOutcome::Failed {
                        stage: JobState::Rendering,
                        cause: e.to_string(),
                    }
                }
            }
        }

        info!(
            "{}: '{}' done, {} file(s)",
            reporter.job(),
            render::display_title(&tree, &request.topic),
            outputs.len()
        );
        JobOutcome::Completed { tree, outputs }
    }

    /// Index every guide and select excerpts. Unusable guides are skipped.
    ///
    /// Returns None when the job is cancelled before extraction finishes.
    async fn extract(&self, request: &JobRequest, cancel: &CancelFlag, reporter: &Reporter) -> Option<Vec<GuideExcerpt>> {
        let guides = if request.guides.is_empty() {
            match guide::discover_guides(&self.config.guides_dir, &request.class_level).await {
                Ok(found) => found,
                Err(e) => {
                    warn!("{}", e);
                    reporter.detail(e.to_string());
                    Vec::new()
                }
            }
        } else {
            request.guides.clone()
        };

        let indexes = self.index_all(guides, cancel, reporter).await?;
        let budget = self.config.excerpt_budget;
        let mut excerpts = if request.pages.is_empty() {
            select_excerpts_for_topics(&indexes, &request.options.topics(&request.topic), budget)
        } else {
            reporter.detail(format!("Using {} manually chosen page(s)", request.pages.len()));
            excerpts_for_pages(&indexes, &request.pages, ExcerptOrigin::Guide, budget)
        };
        reporter.detail(format!(
            "{} guide(s) indexed, {} excerpt(s) selected",
            indexes.len(),
            excerpts.len()
        ));

        if request.use_textbook {
            if cancel.is_cancelled() {
                return None;
            }
            let extra = self.textbook_excerpts(request, &excerpts, reporter).await;
            excerpts.extend(extra);
        }
        Some(excerpts)
    }

    async fn index_all(&self, guides: Vec<PathBuf>, cancel: &CancelFlag, reporter: &Reporter) -> Option<Vec<GuideIndex>> {
        let mut indexes = Vec::with_capacity(guides.len());
        for path in guides {
            if cancel.is_cancelled() {
                return None;
            }
            match self.indexer.get_or_build_index(&path).await {
                Ok(index) => indexes.push(index),
                Err(e) => {
                    warn!("Skipping guide {}: {}", path.display(), e);
                    reporter.guide_skipped(path, e.to_string());
                }
            }
        }
        Some(indexes)
    }

    /// Textbook text for the pages already chosen from the guides, within
    /// what is left of the excerpt budget. A missing textbook is not an error.
    async fn textbook_excerpts(
        &self,
        request: &JobRequest,
        guide_excerpts: &[GuideExcerpt],
        reporter: &Reporter,
    ) -> Vec<GuideExcerpt> {
        let Some(dir) = self.config.textbooks_dir.as_deref() else {
            reporter.detail("No textbook directory configured");
            return Vec::new();
        };
        let Some(path) = guide::find_textbook(dir, &request.class_level).await else {
            reporter.detail(format!("No textbook for {} in {}", request.class_level, dir.display()));
            return Vec::new();
        };
        let index = match self.indexer.get_or_build_index(&path).await {
            Ok(index) => index,
            Err(e) => {
                warn!("Skipping textbook {}: {}", path.display(), e);
                reporter.guide_skipped(path, e.to_string());
                return Vec::new();
            }
        };

        let used: usize = guide_excerpts.iter().map(|e| e.text.chars().count()).sum();
        let remaining = self.config.excerpt_budget.saturating_sub(used);
        let pages: Vec<u32> = if request.pages.is_empty() {
            guide_excerpts.iter().flat_map(|e| e.first_page..=e.last_page).collect()
        } else {
            request.pages.clone()
        };

        let excerpts = if pages.is_empty() {
            let mut found = select_excerpts(std::slice::from_ref(&index), &request.topic, remaining);
            for e in &mut found {
                e.origin = ExcerptOrigin::Textbook;
            }
            found
        } else {
            excerpts_for_pages(std::slice::from_ref(&index), &pages, ExcerptOrigin::Textbook, remaining)
        };
        reporter.detail(format!("{} textbook excerpt(s) from {}", excerpts.len(), path.display()));
        excerpts
    }
}

fn report_end(reporter: &Reporter, outcome: &JobOutcome) {
    match outcome {
        JobOutcome::Completed { .. } => {}
        JobOutcome::Failed { stage, cause } => warn!("{} failed at '{}': {}", reporter.job(), stage, cause),
        JobOutcome::Cancelled { after } => info!("{} cancelled after '{}'", reporter.job(), after),
    }
    reporter.state(outcome.state());
    reporter.finished(outcome.clone());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ignores_case_and_padding() {
        let a = JobRequest::new(DocumentKind::Fiche, " Le Cycle de l'eau ", "CM1").key();
        let b = JobRequest::new(DocumentKind::Fiche, "le cycle de l'eau", "cm1").key();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "fiche/le cycle de l'eau/cm1");
    }

    #[test]
    fn key_distinguishes_kind() {
        let a = JobRequest::new(DocumentKind::Fiche, "x", "CM1").key();
        let b = JobRequest::new(DocumentKind::Quiz, "x", "CM1").key();
        assert_ne!(a, b);
    }
}
