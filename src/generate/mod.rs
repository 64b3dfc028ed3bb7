//! Content generation: prompt → model → validated markdown.
//!
//! ## Primary → fallback
//!
//! One request gets at most two model calls. The primary ("capable") model
//! goes first; if it times out, errors, returns nothing, or returns text
//! that fails the [`OutputSchema`] check, the fallback ("fast/resilient")
//! model gets exactly one try with the identical prompt. There is no third
//! attempt: a second failure surfaces as [`GenerationError`] carrying both
//! causes, and no partial text escapes.
//!
//! ## No caching here
//!
//! Unlike guide indexes, generated lessons are never reused. Every request
//! is a fresh call.

pub mod backend;
pub mod normalize;
pub mod options;
pub mod schema;

use crate::config::{DocumentKind, GenerationParams, ModelPair, PipelineConfig};
use crate::document::MetadataBanner;
use crate::error::{AttemptError, GenerationError};
use crate::guide::{format_excerpts, GuideExcerpt};
use crate::markers;
use crate::progress::CancelFlag;
use crate::prompts::{instructions_block, render_template, PromptTemplates};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use backend::{BackendError, LlmTextModel, TextModel, TextPrompt};
pub use options::{Difficulty, DocumentOptions, QuizFormat, QuizType};
pub use schema::OutputSchema;

/// Shortest session the prompts will plan for.
pub const MIN_DURATION_MINUTES: u32 = 10;

/// Everything needed to generate one document. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub kind: DocumentKind,
    pub topic: String,
    pub class_level: String,
    pub subject: Option<String>,
    pub duration_minutes: u32,
    pub excerpts: Vec<GuideExcerpt>,
    pub special_instructions: Option<String>,
    pub options: DocumentOptions,
    pub models: ModelPair,
    pub params: GenerationParams,
}

impl GenerationRequest {
    pub fn new(
        kind: DocumentKind,
        topic: impl Into<String>,
        class_level: impl Into<String>,
        models: ModelPair,
        params: GenerationParams,
    ) -> Self {
        Self {
            kind,
            topic: topic.into(),
            class_level: class_level.into(),
            subject: None,
            duration_minutes: 45,
            excerpts: Vec::new(),
            special_instructions: None,
            options: DocumentOptions::default(),
            models,
            params,
        }
    }

    pub fn with_subject(mut self, subject: Option<String>) -> Self {
        self.subject = subject.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_duration(mut self, minutes: u32) -> Self {
        self.duration_minutes = minutes.max(MIN_DURATION_MINUTES);
        self
    }

    pub fn with_excerpts(mut self, excerpts: Vec<GuideExcerpt>) -> Self {
        self.excerpts = excerpts;
        self
    }

    pub fn with_instructions(mut self, instructions: Option<String>) -> Self {
        self.special_instructions = instructions;
        self
    }

    pub fn with_options(mut self, options: DocumentOptions) -> Self {
        self.options = options;
        self
    }
}

/// Which configured model produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelRole {
    Primary,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub role: ModelRole,
    pub model: String,
}

/// Validated output of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResult {
    /// Cleaned markdown, markers included.
    pub markdown: String,
    /// Declared fields; title, class and duration also in typed slots.
    pub metadata: MetadataBanner,
    pub provenance: Provenance,
}

/// Runs generation requests against a [`TextModel`].
#[derive(Clone)]
pub struct ContentGenerator {
    model: Arc<dyn TextModel>,
    prompts: PromptTemplates,
    call_timeout: Duration,
}

impl std::fmt::Debug for ContentGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentGenerator")
            .field("model", &"<dyn TextModel>")
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl ContentGenerator {
    pub fn new(model: Arc<dyn TextModel>, prompts: PromptTemplates, call_timeout: Duration) -> Self {
        Self {
            model,
            prompts,
            call_timeout,
        }
    }

    pub fn from_config(config: &PipelineConfig, model: Arc<dyn TextModel>) -> Self {
        Self::new(
            model,
            config.prompts.clone(),
            Duration::from_secs(config.api_timeout_secs),
        )
    }

    /// Interpolate the request into its kind's template.
    pub fn compose_prompt(&self, request: &GenerationRequest) -> String {
        let schema = OutputSchema::for_kind(request.kind);
        let subject = request
            .subject
            .clone()
            .unwrap_or_else(|| "(à déduire si pertinent)".to_string());
        let duration = request.duration_minutes.to_string();
        let excerpts = format_excerpts(&request.excerpts);
        let structure = schema.describe(&request.class_level, request.duration_minutes);
        let instructions = instructions_block(request.special_instructions.as_deref());
        let parameters = options::options_block(request.kind, &request.options, &request.topic, &request.class_level);

        render_template(
            self.prompts.for_kind(request.kind),
            &[
                ("topic", request.topic.trim()),
                ("class_level", request.class_level.trim()),
                ("subject", &subject),
                ("duration", &duration),
                ("excerpts", &excerpts),
                ("structure", &structure),
                ("instructions", &instructions),
                ("options", &parameters),
            ],
        )
    }

    /// Generate without external cancellation.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, GenerationError> {
        self.generate_with_cancel(request, &CancelFlag::new()).await
    }

    /// Generate, checking `cancel` before each model call.
    ///
    /// A call already in flight is not interrupted. Its result is returned
    /// and the caller, which sees the same flag, discards it.
    pub async fn generate_with_cancel(
        &self,
        request: &GenerationRequest,
        cancel: &CancelFlag,
    ) -> Result<GenerationResult, GenerationError> {
        let prompt = self.compose_prompt(request);
        let schema = OutputSchema::for_kind(request.kind);
        let primary = request.models.primary.as_str();

        info!(
            "Generating {} for '{}' ({}) with {}",
            request.kind, request.topic, request.class_level, primary
        );

        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }
        let first = self.attempt(primary, &prompt, &request.params, &schema).await;

        let primary_err = match first {
            Ok(markdown) => return Ok(finish(markdown, ModelRole::Primary, primary)),
            Err(e) => e,
        };
        warn!("Primary model {} failed: {}", primary, primary_err);

        let Some(fallback) = request.models.fallback.as_deref() else {
            return Err(GenerationError::PrimaryFailed {
                model: primary.to_string(),
                reason: primary_err.to_string(),
            });
        };

        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }
        info!("Retrying once with fallback model {}", fallback);
        let second = self.attempt(fallback, &prompt, &request.params, &schema).await;

        match second {
            Ok(markdown) => Ok(finish(markdown, ModelRole::Fallback, fallback)),
            Err(fallback_err) => {
                warn!("Fallback model {} failed: {}", fallback, fallback_err);
                Err(GenerationError::Exhausted {
                    primary_model: primary.to_string(),
                    primary: primary_err.to_string(),
                    fallback_model: fallback.to_string(),
                    fallback: fallback_err.to_string(),
                })
            }
        }
    }

    /// One bounded model call, cleaned and checked.
    async fn attempt(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerationParams,
        schema: &OutputSchema,
    ) -> Result<String, AttemptError> {
        let call = self.model.complete(
            model,
            TextPrompt {
                system: &self.prompts.system,
                user: prompt,
            },
            params,
        );
        let raw = match tokio::time::timeout(self.call_timeout, call).await {
            Err(_) => {
                return Err(AttemptError::Timeout {
                    secs: self.call_timeout.as_secs(),
                })
            }
            Ok(Err(e)) => return Err(AttemptError::Backend(e.0)),
            Ok(Ok(raw)) => raw,
        };

        let markdown = normalize::clean_markdown(&raw);
        if markdown.trim().is_empty() {
            return Err(AttemptError::Empty);
        }
        schema.check(&markdown).map_err(AttemptError::Structure)?;
        debug!("{}: accepted {} chars", model, markdown.len());
        Ok(markdown)
    }
}

fn finish(markdown: String, role: ModelRole, model: &str) -> GenerationResult {
    let mut metadata = MetadataBanner::default();
    for field in markers::scan_fields(&markdown) {
        metadata.insert(&field.name, &field.value);
    }
    GenerationResult {
        markdown,
        metadata,
        provenance: Provenance {
            role,
            model: model.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const VALID_QUIZ: &str = "{{FIELD:title=Les volcans}}\n{{FIELD:class=CM2}}\n\n## Questions\n1. Qu'est-ce qu'un volcan ?";

    /// Replies from a script, recording each (model, prompt) it receives.
    struct Scripted {
        replies: Mutex<Vec<Result<String, BackendError>>>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String, BackendError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TextModel for Scripted {
        async fn complete(
            &self,
            model: &str,
            prompt: TextPrompt<'_>,
            _params: &GenerationParams,
        ) -> Result<String, BackendError> {
            self.calls
                .lock()
                .unwrap()
                .push((model.to_string(), prompt.user.to_string()));
            self.replies.lock().unwrap().remove(0)
        }
    }

    fn request(fallback: Option<&str>) -> GenerationRequest {
        GenerationRequest::new(
            DocumentKind::Quiz,
            "Les volcans",
            "CM2",
            ModelPair::new("primary-model", fallback),
            GenerationParams::default(),
        )
    }

    fn generator(model: Arc<Scripted>) -> ContentGenerator {
        ContentGenerator::new(model, PromptTemplates::default(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn primary_success_extracts_metadata() {
        let model = Scripted::new(vec![Ok(VALID_QUIZ.to_string())]);
        let out = generator(model.clone())
            .generate(&request(Some("fallback-model")))
            .await
            .unwrap();
        assert_eq!(out.provenance.role, ModelRole::Primary);
        assert_eq!(out.metadata.title.as_deref(), Some("Les volcans"));
        assert_eq!(out.metadata.class_level.as_deref(), Some("CM2"));
        assert_eq!(model.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_primary_falls_back_once_with_same_prompt() {
        let model = Scripted::new(vec![
            Ok("Voici un quiz sans marqueurs.".into()),
            Ok(VALID_QUIZ.to_string()),
        ]);
        let out = generator(model.clone())
            .generate(&request(Some("fallback-model")))
            .await
            .unwrap();
        assert_eq!(
            out.provenance,
            Provenance {
                role: ModelRole::Fallback,
                model: "fallback-model".into()
            }
        );
        let calls = model.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "primary-model");
        assert_eq!(calls[1].0, "fallback-model");
        assert_eq!(calls[0].1, calls[1].1);
    }

    #[tokio::test]
    async fn both_failing_is_exhausted() {
        let model = Scripted::new(vec![
            Err(BackendError("quota exceeded".into())),
            Ok(String::new()),
        ]);
        let err = generator(model.clone())
            .generate(&request(Some("fallback-model")))
            .await
            .unwrap_err();
        match err {
            GenerationError::Exhausted {
                primary, fallback, ..
            } => {
                assert!(primary.contains("quota exceeded"));
                assert_eq!(fallback, "empty response");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(model.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn no_fallback_configured() {
        let model = Scripted::new(vec![Err(BackendError("boom".into()))]);
        let err = generator(model.clone())
            .generate(&request(None))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::PrimaryFailed { .. }));
        assert_eq!(model.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_before_first_call() {
        let model = Scripted::new(vec![]);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = generator(model.clone())
            .generate_with_cancel(&request(None), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, GenerationError::Cancelled);
        assert!(model.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn prompt_interpolates_request() {
        let g = generator(Scripted::new(vec![]));
        let req = request(None)
            .with_subject(Some("Sciences".into()))
            .with_duration(5)
            .with_instructions(Some("Utiliser des schémas".into()));
        assert_eq!(req.duration_minutes, MIN_DURATION_MINUTES);
        let p = g.compose_prompt(&req);
        assert!(p.contains("\"Les volcans\""));
        assert!(p.contains("Matière : Sciences"));
        assert!(p.contains("{{FIELD:class=CM2}}"));
        assert!(p.contains("Utiliser des schémas"));
        assert!(p.contains("aucun extrait"));
        assert!(!p.contains("{topic}"));
    }

    #[test]
    fn quiz_options_reach_the_prompt() {
        let g = generator(Scripted::new(vec![]));
        let req = request(None).with_options(DocumentOptions {
            quiz_type: QuizType::Mini,
            quiz_format: QuizFormat::TrueFalse,
            difficulty: Difficulty::Easy,
            ..Default::default()
        });
        let p = g.compose_prompt(&req);
        assert!(p.contains("Nombre de questions : 3"));
        assert!(p.contains("Vrai/Faux"));
        assert!(p.contains("Difficulté : facile"));
        assert!(p.contains("## Corrigé"));
        assert!(!p.contains("{options}"));
    }
}
