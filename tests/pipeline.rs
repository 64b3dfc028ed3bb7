//! Pipeline integration tests.
//!
//! Every external capability is replaced by an in-process fake: guide
//! parsing, text generation, image generation and rendering. No network, no
//! pdfium, no API key.

use async_trait::async_trait;
use fichegen::error::ExtractionError;
use fichegen::generate::normalize::clean_markdown;
use fichegen::generate::{BackendError, Difficulty, DocumentOptions, QuizFormat, QuizType, TextPrompt};
use fichegen::guide::{HeadingEntry, ParsedGuide};
use fichegen::progress::{event_channel, Reporter};
use fichegen::render::MarkdownRenderer;
use fichegen::{
    CancelFlag, ContentGenerator, DocumentKind, DocumentNode, DocumentRenderer, DocumentTree, FicheError,
    GenerationParams, GuideIndexer, GuideParser, IllustrationError, Illustrator, ImageModel, JobEvent, JobId,
    JobOutcome, JobRequest, JobState, ModelPair, Orchestrator, OutputFormat, PipelineConfig, RenderError,
    TextModel,
};
use futures::StreamExt;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

// ── Fixtures ─────────────────────────────────────────────────────────────────

const FICHE: &str = "\
{{FIELD:title=Le cycle de l'eau}}
{{FIELD:class=CM1}}
{{FIELD:duration=45 min}}

## Objectifs
- Décrire les **changements d'état** de l'eau

## Déroulement de la séance
### Introduction
Observation d'une casserole d'eau.

{{IMAGE:schéma du cycle de l'eau}}

{{TABLE:Observations}}
| Étape | Observation |
| Chauffer |
{{/TABLE}}

{{FIELD:remarque=}}
{{CUSTOM:x}}
";

const GUIDE_TEXT: &str = "Le cycle de l'eau : évaporation, condensation, précipitations.";
const TEXTBOOK_TEXT: &str = "Manuel : l'eau change d'état quand on la chauffe.";

// ── Fakes ────────────────────────────────────────────────────────────────────

struct FakeParser {
    calls: AtomicUsize,
    cancel_on_parse: Mutex<Option<CancelFlag>>,
}

impl GuideParser for FakeParser {
    fn parse(&self, path: &Path) -> Result<ParsedGuide, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(cancel) = self.cancel_on_parse.lock().unwrap().as_ref() {
            cancel.cancel();
        }
        if path.to_string_lossy().contains("scanned") {
            return Err(ExtractionError::NoText {
                path: path.to_path_buf(),
            });
        }
        let is_textbook = path.to_string_lossy().contains("livre_");
        let mut pages = BTreeMap::new();
        pages.insert(1, "Sommaire".to_string());
        pages.insert(2, if is_textbook { TEXTBOOK_TEXT } else { GUIDE_TEXT }.to_string());
        Ok(ParsedGuide {
            headings: vec![HeadingEntry {
                text: "Le cycle de l'eau".into(),
                page: 2,
                level: 1,
            }],
            pages,
        })
    }
}

/// Scripted replies, then `default_reply` forever.
struct FakeText {
    script: Mutex<VecDeque<Result<String, BackendError>>>,
    default_reply: String,
    calls: Mutex<Vec<(String, String)>>,
    cancel_during_call: Option<CancelFlag>,
    gate: Option<Arc<Semaphore>>,
}

impl FakeText {
    fn replying(reply: &str) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_reply: reply.to_string(),
            calls: Mutex::new(Vec::new()),
            cancel_during_call: None,
            gate: None,
        }
    }

    fn scripted(self, script: Vec<Result<String, BackendError>>) -> Self {
        *self.script.lock().unwrap() = script.into();
        self
    }

    fn models_called(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
    }
}

#[async_trait]
impl TextModel for FakeText {
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
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if let Some(cancel) = &self.cancel_during_call {
            cancel.cancel();
        }
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(self.default_reply.clone()))
    }
}

struct FailingImages {
    calls: AtomicUsize,
    cancel_on_call: Mutex<Option<CancelFlag>>,
}

#[async_trait]
impl ImageModel for FailingImages {
    async fn generate_image(&self, _prompt: &str, model: &str) -> Result<Vec<u8>, IllustrationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(cancel) = self.cancel_on_call.lock().unwrap().as_ref() {
            cancel.cancel();
        }
        Err(IllustrationError::Quota { model: model.into() })
    }
}

struct CountingRenderer {
    calls: Arc<AtomicUsize>,
}

impl DocumentRenderer for CountingRenderer {
    fn format(&self) -> OutputFormat {
        OutputFormat::Markdown
    }

    fn render(&self, tree: &DocumentTree) -> Result<Vec<u8>, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        MarkdownRenderer.render(tree)
    }
}

struct Harness {
    dir: TempDir,
    guide: PathBuf,
    parser: Arc<FakeParser>,
    text: Arc<FakeText>,
    images: Arc<FailingImages>,
    renders: Arc<AtomicUsize>,
    orchestrator: Orchestrator,
}

fn harness(text: FakeText, illustrate: bool) -> Harness {
    let dir = TempDir::new().unwrap();
    let guides = dir.path().join("guides");
    std::fs::create_dir_all(&guides).unwrap();
    let guide = guides.join("guide_pedagogique_cm1.pdf");
    std::fs::write(&guide, b"%PDF-1.4 fake guide").unwrap();
    let textbooks = dir.path().join("manuels");
    std::fs::create_dir_all(&textbooks).unwrap();

    let config = PipelineConfig::builder()
        .guides_dir(&guides)
        .textbooks_dir(&textbooks)
        .output_dir(dir.path().join("out"))
        .cache_dir(dir.path().join("cache"))
        .text_model("primary")
        .text_fallback(Some("fallback"))
        .image_model("img")
        .illustrations(illustrate)
        .api_timeout_secs(5)
        .build()
        .unwrap();

    let parser = Arc::new(FakeParser {
        calls: AtomicUsize::new(0),
        cancel_on_parse: Mutex::new(None),
    });
    let text = Arc::new(text);
    let images = Arc::new(FailingImages {
        calls: AtomicUsize::new(0),
        cancel_on_call: Mutex::new(None),
    });
    let renders = Arc::new(AtomicUsize::new(0));

    let indexer = GuideIndexer::new(config.cache_dir.clone(), parser.clone());
    let generator = ContentGenerator::from_config(&config, text.clone());
    let illustrator = Illustrator::new(
        images.clone(),
        ModelPair::new("img", None::<String>),
        config.prompts.illustration.clone(),
        2,
        Duration::from_secs(5),
    );
    let orchestrator = Orchestrator::new(config, indexer, generator)
        .with_illustrator(illustrator)
        .with_renderers(vec![Box::new(CountingRenderer {
            calls: renders.clone(),
        }) as Box<dyn DocumentRenderer>]);

    Harness {
        dir,
        guide,
        parser,
        text,
        images,
        renders,
        orchestrator,
    }
}

fn request() -> JobRequest {
    JobRequest::new(DocumentKind::Fiche, "Le cycle de l'eau", "CM1")
}

async fn run_collecting(h: &Harness, req: &JobRequest, cancel: &CancelFlag) -> (JobOutcome, Vec<JobEvent>) {
    let (tx, events) = event_channel();
    let reporter = Reporter::new(JobId::next(), tx);
    let outcome = h.orchestrator.run(req, cancel, &reporter).await;
    drop(reporter);
    (outcome, events.collect().await)
}

fn states(events: &[JobEvent]) -> Vec<JobState> {
    events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Progress { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

fn first_prompt(h: &Harness) -> String {
    h.text.calls.lock().unwrap()[0].1.clone()
}

fn output_count(h: &Harness) -> usize {
    std::fs::read_dir(h.dir.path().join("out"))
        .map(|d| d.count())
        .unwrap_or(0)
}

// ── Happy path ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn job_runs_every_stage_in_order() {
    let h = harness(FakeText::replying(FICHE), false);
    let (outcome, events) = run_collecting(&h, &request(), &CancelFlag::new()).await;

    assert_eq!(
        states(&events),
        vec![
            JobState::Queued,
            JobState::ExtractingGuides,
            JobState::Generating,
            JobState::BuildingDocument,
            JobState::Rendering,
            JobState::Completed,
        ]
    );
    assert!(matches!(events.last(), Some(JobEvent::Finished { .. })));

    let JobOutcome::Completed { tree, outputs } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(tree.banner.title.as_deref(), Some("Le cycle de l'eau"));
    assert_eq!(outputs.len(), 1);
    assert!(outputs[0].exists());
    assert_eq!(h.text.models_called(), vec!["primary"]);

    let prompt = &h.text.calls.lock().unwrap()[0].1;
    assert!(prompt.contains("évaporation"), "guide excerpt missing from prompt");
}

#[tokio::test]
async fn tree_keeps_ragged_tables_and_unknown_markers() {
    let h = harness(FakeText::replying(FICHE), false);
    let (outcome, _) = run_collecting(&h, &request(), &CancelFlag::new()).await;
    let JobOutcome::Completed { tree, .. } = outcome else {
        panic!("expected completion");
    };

    let table = tree
        .nodes
        .iter()
        .find_map(|n| match n {
            DocumentNode::TableMarker { name, rows } => Some((name.clone(), rows.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(table.0, "Observations");
    assert_eq!(table.1[1], vec!["Chauffer".to_string(), String::new()]);

    assert!(tree.nodes.iter().any(|n| matches!(
        n,
        DocumentNode::FieldMarker { name, value, .. } if name == "remarque" && value.is_empty()
    )));
    assert!(tree.nodes.iter().any(|n| matches!(
        n,
        DocumentNode::Paragraph { runs } if fichegen::document::plain_text(runs) == "{{CUSTOM:x}}"
    )));
}

// ── Guide cache ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn unchanged_guide_is_parsed_once_and_reparsed_after_edit() {
    let h = harness(FakeText::replying(FICHE), false);
    run_collecting(&h, &request(), &CancelFlag::new()).await;
    run_collecting(&h, &request(), &CancelFlag::new()).await;
    assert_eq!(h.parser.calls.load(Ordering::SeqCst), 1);

    std::fs::write(&h.guide, b"%PDF-1.4 fake guide, second edition").unwrap();
    run_collecting(&h, &request(), &CancelFlag::new()).await;
    assert_eq!(h.parser.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unusable_guide_is_skipped_not_fatal() {
    let h = harness(FakeText::replying(FICHE), false);
    let scanned = h.dir.path().join("guides/scanned_cm1.pdf");
    std::fs::write(&scanned, b"%PDF-1.4 images only").unwrap();
    let missing = h.dir.path().join("guides/absent.pdf");
    let req = request().guides(vec![scanned, missing, h.guide.clone()]);

    let (outcome, events) = run_collecting(&h, &req, &CancelFlag::new()).await;
    assert_eq!(outcome.state(), JobState::Completed);
    let skipped = events
        .iter()
        .filter(|e| matches!(e, JobEvent::GuideSkipped { .. }))
        .count();
    assert_eq!(skipped, 2);
}

#[tokio::test]
async fn manual_pages_replace_topic_matching() {
    let h = harness(FakeText::replying(FICHE), false);
    let topic_only = JobRequest::new(DocumentKind::Fiche, "Les volcans", "CM1");
    run_collecting(&h, &topic_only, &CancelFlag::new()).await;
    assert!(first_prompt(&h).contains("aucun extrait"));

    h.text.calls.lock().unwrap().clear();
    let req = JobRequest::new(DocumentKind::Fiche, "Les volcans", "CM1").pages(vec![1, 2]);
    let (outcome, _) = run_collecting(&h, &req, &CancelFlag::new()).await;
    assert_eq!(outcome.state(), JobState::Completed);
    let prompt = first_prompt(&h);
    assert!(prompt.contains("p. 1-2"), "got: {prompt}");
    assert!(prompt.contains("Sommaire"));
    assert!(prompt.contains("évaporation"));
}

#[tokio::test]
async fn textbook_adds_a_second_source_on_the_same_pages() {
    let h = harness(FakeText::replying(FICHE), false);
    std::fs::write(h.dir.path().join("manuels/livre_cm1.pdf"), b"%PDF-1.4 fake textbook").unwrap();

    let (outcome, _) = run_collecting(&h, &request().use_textbook(true), &CancelFlag::new()).await;
    assert_eq!(outcome.state(), JobState::Completed);
    assert_eq!(h.parser.calls.load(Ordering::SeqCst), 2);

    let prompt = first_prompt(&h);
    let banner = prompt.find("MANUEL ÉLÈVE").expect("textbook section missing");
    assert!(prompt.find("évaporation").unwrap() < banner);
    assert!(prompt.find("l'eau change d'état").unwrap() > banner);
    assert!(prompt.contains("[livre_cm1.pdf, p. 2"));
}

#[tokio::test]
async fn missing_textbook_is_not_fatal() {
    let h = harness(FakeText::replying(FICHE), false);
    let (outcome, events) = run_collecting(&h, &request().use_textbook(true), &CancelFlag::new()).await;
    assert_eq!(outcome.state(), JobState::Completed);
    assert!(!first_prompt(&h).contains("MANUEL ÉLÈVE"));
    assert!(events
        .iter()
        .any(|e| matches!(e, JobEvent::Detail { message, .. } if message.starts_with("No textbook"))));
}

// ── Generation ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn assessment_options_shape_the_prompt() {
    let h = harness(FakeText::replying(FICHE), false);
    let options = DocumentOptions {
        quiz_type: QuizType::Comprehensive,
        quiz_format: QuizFormat::MultipleChoice,
        difficulty: Difficulty::Medium,
        include_answers: false,
        ..Default::default()
    };
    let req = JobRequest::new(DocumentKind::Quiz, "Le cycle de l'eau", "CM1").options(options);
    run_collecting(&h, &req, &CancelFlag::new()).await;
    let prompt = first_prompt(&h);
    assert!(prompt.contains("Nombre de questions : 15"));
    assert!(prompt.contains("uniquement des QCM"));
    assert!(prompt.contains("Difficulté : moyenne"));
    assert!(prompt.contains("n'inclus aucune réponse"));

    h.text.calls.lock().unwrap().clear();
    let options = DocumentOptions {
        extra_topics: vec!["Les états de l'eau".into()],
        question_types: vec!["Vrai/Faux".into()],
        ..Default::default()
    };
    let req = JobRequest::new(DocumentKind::Evaluation, "Le cycle de l'eau", "CM1").options(options);
    run_collecting(&h, &req, &CancelFlag::new()).await;
    let prompt = first_prompt(&h);
    assert!(prompt.contains("Sujets évalués : Le cycle de l'eau, Les états de l'eau"));
    assert!(prompt.contains("Types de questions : Vrai/Faux"));
}

#[tokio::test]
async fn malformed_primary_uses_fallback_exactly_once() {
    let text = FakeText::replying(FICHE).scripted(vec![Ok("Voici une fiche sans structure.".into())]);
    let h = harness(text, false);
    let (outcome, _) = run_collecting(&h, &request(), &CancelFlag::new()).await;
    assert_eq!(outcome.state(), JobState::Completed);
    assert_eq!(h.text.models_called(), vec!["primary", "fallback"]);
}

#[tokio::test]
async fn both_models_failing_fails_the_job_without_output() {
    let text = FakeText::replying(FICHE).scripted(vec![
        Err(BackendError("quota exceeded".into())),
        Ok(String::new()),
    ]);
    let h = harness(text, false);
    let (outcome, _) = run_collecting(&h, &request(), &CancelFlag::new()).await;

    match outcome {
        JobOutcome::Failed { stage, cause } => {
            assert_eq!(stage, JobState::Generating);
            assert!(cause.contains("quota exceeded"), "got: {cause}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(h.text.models_called().len(), 2);
    assert_eq!(h.renders.load(Ordering::SeqCst), 0);
    assert_eq!(output_count(&h), 0);
}

#[tokio::test]
async fn unterminated_table_fails_while_building() {
    let broken = format!("{FICHE}\n{{{{TABLE:Bilan}}}}\n| a | b |\n");
    let h = harness(FakeText::replying(&broken), false);
    let (outcome, _) = run_collecting(&h, &request(), &CancelFlag::new()).await;
    match outcome {
        JobOutcome::Failed { stage, cause } => {
            assert_eq!(stage, JobState::BuildingDocument);
            assert!(cause.starts_with("Parse error at line"), "got: {cause}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

// ── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_after_generation_stops_before_building() {
    let cancel = CancelFlag::new();
    let mut text = FakeText::replying(FICHE);
    text.cancel_during_call = Some(cancel.clone());
    let h = harness(text, true);

    let (outcome, events) = run_collecting(&h, &request(), &cancel).await;
    match outcome {
        JobOutcome::Cancelled { after } => assert_eq!(after, JobState::Generating),
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert!(!states(&events).contains(&JobState::BuildingDocument));
    assert_eq!(h.images.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.renders.load(Ordering::SeqCst), 0);
    assert_eq!(output_count(&h), 0);
}

#[tokio::test]
async fn cancel_before_start_makes_no_calls() {
    let h = harness(FakeText::replying(FICHE), false);
    let cancel = CancelFlag::new();
    cancel.cancel();
    let (outcome, _) = run_collecting(&h, &request(), &cancel).await;
    assert_eq!(outcome.state(), JobState::Cancelled);
    assert_eq!(h.parser.calls.load(Ordering::SeqCst), 0);
    assert!(h.text.models_called().is_empty());
}

#[tokio::test]
async fn cancel_between_guides_stops_indexing() {
    let h = harness(FakeText::replying(FICHE), false);
    let second = h.dir.path().join("guides/guide_bis_cm1.pdf");
    std::fs::write(&second, b"%PDF-1.4 another guide").unwrap();
    let cancel = CancelFlag::new();
    *h.parser.cancel_on_parse.lock().unwrap() = Some(cancel.clone());

    let req = request().guides(vec![h.guide.clone(), second]);
    let (outcome, events) = run_collecting(&h, &req, &cancel).await;
    match outcome {
        JobOutcome::Cancelled { after } => assert_eq!(after, JobState::Queued),
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert_eq!(h.parser.calls.load(Ordering::SeqCst), 1);
    assert!(h.text.models_called().is_empty());
    assert!(!states(&events).contains(&JobState::Generating));
}

#[tokio::test]
async fn cancel_during_illustration_reports_the_last_finished_stage() {
    let h = harness(FakeText::replying(FICHE), true);
    let cancel = CancelFlag::new();
    *h.images.cancel_on_call.lock().unwrap() = Some(cancel.clone());

    let (outcome, events) = run_collecting(&h, &request(), &cancel).await;
    match outcome {
        JobOutcome::Cancelled { after } => assert_eq!(after, JobState::BuildingDocument),
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert!(states(&events).contains(&JobState::Illustrating));
    assert_eq!(h.renders.load(Ordering::SeqCst), 0);
    assert_eq!(output_count(&h), 0);
}

// ── Illustration ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn failing_images_leave_structure_intact() {
    let h = harness(FakeText::replying(FICHE), true);
    let (outcome, events) = run_collecting(&h, &request(), &CancelFlag::new()).await;
    assert!(states(&events).contains(&JobState::Illustrating));

    let JobOutcome::Completed { tree, .. } = outcome else {
        panic!("expected completion");
    };
    let expected = fichegen::build(&clean_markdown(FICHE)).unwrap();
    assert_eq!(tree, expected);
    assert_eq!(tree.pending_images().len(), 1);
    assert_eq!(h.images.calls.load(Ordering::SeqCst), 1);
}

// ── One job per document ─────────────────────────────────────────────────────

#[tokio::test]
async fn second_job_for_same_document_is_rejected() {
    let gate = Arc::new(Semaphore::new(0));
    let mut text = FakeText::replying(FICHE);
    text.gate = Some(gate.clone());
    let h = harness(text, false);

    let first = h.orchestrator.submit(request()).unwrap();
    let duplicate = h
        .orchestrator
        .submit(JobRequest::new(DocumentKind::Fiche, "LE CYCLE DE L'EAU", "cm1"));
    assert!(matches!(duplicate, Err(FicheError::JobAlreadyActive { .. })));

    let other = h
        .orchestrator
        .submit(JobRequest::new(DocumentKind::Quiz, "Le cycle de l'eau", "CM1"))
        .unwrap();

    // fiche: one call; quiz: primary + fallback, both rejected by the quiz schema
    gate.add_permits(3);
    assert_eq!(first.outcome().await.unwrap().state(), JobState::Completed);
    assert_eq!(other.outcome().await.unwrap().state(), JobState::Failed);

    gate.add_permits(1);
    let again = h.orchestrator.submit(request()).unwrap();
    assert_eq!(again.outcome().await.unwrap().state(), JobState::Completed);
}

#[tokio::test]
async fn submitted_job_streams_until_finished() {
    let h = harness(FakeText::replying(FICHE), false);
    let mut job = h.orchestrator.submit(request()).unwrap();
    let mut last = None;
    while let Some(event) = job.events().next().await {
        last = Some(event);
    }
    assert!(matches!(
        last,
        Some(JobEvent::Finished {
            outcome: JobOutcome::Completed { .. },
            ..
        })
    ));
    assert_eq!(h.renders.load(Ordering::SeqCst), 1);
}
