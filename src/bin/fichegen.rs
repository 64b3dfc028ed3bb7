//! CLI binary for fichegen.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, submits one job and follows its events.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use fichegen::generate::{Difficulty, DocumentOptions, QuizFormat, QuizType};
use fichegen::guide::{discover_guides, parse_page_list};
use fichegen::{
    DocumentKind, JobEvent, JobOutcome, JobRequest, JobState, Orchestrator, OutputFormat, PdfiumGuideParser,
    PipelineConfig, GuideIndexer,
};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Lesson plan for CM1, guides discovered in ./guides
  fichegen generate --topic "Le cycle de l'eau" --class CM1

  # Evaluation with a specific guide and JSON output as well
  fichegen generate --kind evaluation --topic "Les fractions" --class CM2 \
      --guide guides/guide_pedagogique_cm2.pdf --format md --format json

  # Quiz with illustrations
  fichegen generate --kind quiz --topic "Les volcans" --class CE2 --illustrate

  # Short true/false quiz from chosen guide pages plus the student textbook
  fichegen generate --kind quiz --topic "Les volcans" --class CE2 \
      --quiz-type quick-check --quiz-format true-false --pages 42-45 --textbook

  # Build (or refresh) guide indexes and print their outlines
  fichegen index --class CM1

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY          Google Gemini API key (text and images)
  FICHEGEN_PROVIDER       Text provider for edgequake-llm (default: gemini)
  PDFIUM_LIB_PATH         Directory containing libpdfium
  RUST_LOG                Overrides the log filter

Press Ctrl-C once to cancel a running job; it stops at the next stage boundary.
"#;

/// Generate lesson documents from a topic and reference PDF guides.
#[derive(Parser, Debug)]
#[command(
    name = "fichegen",
    version,
    about = "Generate lesson plans, evaluations and quizzes with LLMs, grounded in PDF guides",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Directory containing guide PDFs.
    #[arg(long, global = true, env = "FICHEGEN_GUIDES_DIR", default_value = "guides")]
    guides_dir: PathBuf,

    /// Directory for guide index cache files.
    #[arg(long, global = true, env = "FICHEGEN_CACHE_DIR", default_value = ".fichegen-cache")]
    cache_dir: PathBuf,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "FICHEGEN_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "FICHEGEN_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate one document.
    Generate(GenerateArgs),
    /// Index guides and print their heading outlines.
    Index(IndexArgs),
}

#[derive(Args, Debug)]
struct GenerateArgs {
    /// Document kind.
    #[arg(long, value_enum, default_value = "fiche")]
    kind: KindArg,

    /// Lesson topic.
    #[arg(long)]
    topic: String,

    /// Class level (CP, CE1, CE2, CM1, CM2, 6e…).
    #[arg(long = "class")]
    class_level: String,

    /// Subject (inferred by the model when omitted).
    #[arg(long)]
    subject: Option<String>,

    /// Session length in minutes.
    #[arg(long, default_value_t = 45)]
    duration: u32,

    /// Guide PDF to use; repeatable. Defaults to discovery in --guides-dir.
    #[arg(long = "guide")]
    guides: Vec<PathBuf>,

    /// Guide pages to use instead of topic matching, e.g. "12-14,20".
    #[arg(long)]
    pages: Option<String>,

    /// Also read the student textbook for the class from --textbooks-dir.
    #[arg(long)]
    textbook: bool,

    /// Directory containing student textbooks (livre_<class>.pdf, …).
    #[arg(long, env = "FICHEGEN_TEXTBOOKS_DIR", default_value = "manuels")]
    textbooks_dir: PathBuf,

    /// Extra instructions passed verbatim to the model.
    #[arg(long)]
    instructions: Option<String>,

    /// Difficulty of an evaluation or quiz.
    #[arg(long, value_enum, default_value = "adapted")]
    difficulty: DifficultyArg,

    /// Additional evaluated topic; repeatable (evaluation).
    #[arg(long = "extra-topic")]
    extra_topics: Vec<String>,

    /// Requested question type, e.g. "QCM"; repeatable (evaluation).
    #[arg(long = "question-type")]
    question_types: Vec<String>,

    /// Quiz size.
    #[arg(long, value_enum, default_value = "standard")]
    quiz_type: QuizTypeArg,

    /// Quiz question format.
    #[arg(long, value_enum, default_value = "mixed")]
    quiz_format: QuizFormatArg,

    /// Leave the answer key out of a quiz.
    #[arg(long)]
    no_answers: bool,

    /// Output directory.
    #[arg(short, long, env = "FICHEGEN_OUTPUT_DIR", default_value = "out")]
    output_dir: PathBuf,

    /// Output format; repeatable.
    #[arg(long = "format", value_enum, default_values_t = vec![FormatArg::Md])]
    formats: Vec<FormatArg>,

    /// Generate images for {{IMAGE:…}} placeholders.
    #[arg(long, env = "FICHEGEN_ILLUSTRATE")]
    illustrate: bool,

    /// edgequake-llm provider name.
    #[arg(long, env = "FICHEGEN_PROVIDER", default_value = "gemini")]
    provider: String,

    /// Primary text model.
    #[arg(long, env = "FICHEGEN_MODEL", default_value = fichegen::config::DEFAULT_TEXT_MODEL)]
    model: String,

    /// Fallback text model, tried once when the primary fails. Empty disables it.
    #[arg(long, env = "FICHEGEN_FALLBACK_MODEL", default_value = fichegen::config::DEFAULT_TEXT_FALLBACK)]
    fallback_model: String,

    /// Image model.
    #[arg(long, env = "FICHEGEN_IMAGE_MODEL", default_value = fichegen::config::DEFAULT_IMAGE_MODEL)]
    image_model: String,

    /// Maximum guide excerpt characters in the prompt.
    #[arg(long, env = "FICHEGEN_EXCERPT_BUDGET", default_value_t = 6000)]
    excerpt_budget: usize,

    /// LLM temperature (0.0–1.0).
    #[arg(long, env = "FICHEGEN_TEMPERATURE", default_value_t = 0.5)]
    temperature: f32,

    /// Per-call model timeout in seconds.
    #[arg(long, env = "FICHEGEN_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// Disable the progress spinner.
    #[arg(long, env = "FICHEGEN_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(Args, Debug)]
struct IndexArgs {
    /// Only guides matching this class level.
    #[arg(long = "class", default_value = "")]
    class_level: String,

    /// Guide PDF to index; repeatable. Defaults to discovery in --guides-dir.
    #[arg(long = "guide")]
    guides: Vec<PathBuf>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Fiche,
    Evaluation,
    Quiz,
}

impl From<KindArg> for DocumentKind {
    fn from(v: KindArg) -> Self {
        match v {
            KindArg::Fiche => DocumentKind::Fiche,
            KindArg::Evaluation => DocumentKind::Evaluation,
            KindArg::Quiz => DocumentKind::Quiz,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum DifficultyArg {
    Adapted,
    Easy,
    Medium,
    Hard,
    Mixed,
}

impl From<DifficultyArg> for Difficulty {
    fn from(v: DifficultyArg) -> Self {
        match v {
            DifficultyArg::Adapted => Difficulty::Adapted,
            DifficultyArg::Easy => Difficulty::Easy,
            DifficultyArg::Medium => Difficulty::Medium,
            DifficultyArg::Hard => Difficulty::Hard,
            DifficultyArg::Mixed => Difficulty::Mixed,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum QuizTypeArg {
    /// 3 questions
    Mini,
    /// 5 questions
    QuickCheck,
    /// 10 questions
    Standard,
    /// 15 questions
    Comprehensive,
}

impl From<QuizTypeArg> for QuizType {
    fn from(v: QuizTypeArg) -> Self {
        match v {
            QuizTypeArg::Mini => QuizType::Mini,
            QuizTypeArg::QuickCheck => QuizType::QuickCheck,
            QuizTypeArg::Standard => QuizType::Standard,
            QuizTypeArg::Comprehensive => QuizType::Comprehensive,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum QuizFormatArg {
    Mixed,
    MultipleChoice,
    ShortAnswer,
    TrueFalse,
    FillInBlanks,
}

impl From<QuizFormatArg> for QuizFormat {
    fn from(v: QuizFormatArg) -> Self {
        match v {
            QuizFormatArg::Mixed => QuizFormat::Mixed,
            QuizFormatArg::MultipleChoice => QuizFormat::MultipleChoice,
            QuizFormatArg::ShortAnswer => QuizFormat::ShortAnswer,
            QuizFormatArg::TrueFalse => QuizFormat::TrueFalse,
            QuizFormatArg::FillInBlanks => QuizFormat::FillInBlanks,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum FormatArg {
    Md,
    Json,
}

impl From<FormatArg> for OutputFormat {
    fn from(v: FormatArg) -> Self {
        match v {
            FormatArg::Md => OutputFormat::Markdown,
            FormatArg::Json => OutputFormat::Json,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The spinner already reports stages; keep library logs to errors
    // unless asked for more.
    let show_progress = match &cli.command {
        Command::Generate(args) => !cli.common.quiet && !args.no_progress,
        Command::Index(_) => false,
    };
    let filter = if cli.common.verbose {
        "debug"
    } else if cli.common.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Generate(args) => generate(&cli.common, args, show_progress).await,
        Command::Index(args) => index(&cli.common, args).await,
    }
}

async fn generate(common: &CommonArgs, args: GenerateArgs, show_progress: bool) -> Result<()> {
    let fallback = Some(args.fallback_model.clone()).filter(|m| !m.trim().is_empty());
    let config = PipelineConfig::builder()
        .guides_dir(&common.guides_dir)
        .cache_dir(&common.cache_dir)
        .textbooks_dir(&args.textbooks_dir)
        .output_dir(&args.output_dir)
        .provider_name(&args.provider)
        .text_model(&args.model)
        .text_fallback(fallback)
        .image_model(&args.image_model)
        .illustrations(args.illustrate)
        .excerpt_budget(args.excerpt_budget)
        .temperature(args.temperature)
        .api_timeout_secs(args.api_timeout)
        .formats(args.formats.iter().map(|f| OutputFormat::from(*f)).collect())
        .build()
        .context("Invalid configuration")?;

    let orchestrator = Orchestrator::from_config(config)?;

    let pages = match &args.pages {
        Some(spec) => parse_page_list(spec).context("Invalid --pages")?,
        None => Vec::new(),
    };
    let options = DocumentOptions {
        difficulty: args.difficulty.into(),
        extra_topics: args.extra_topics.clone(),
        question_types: args.question_types.clone(),
        quiz_type: args.quiz_type.into(),
        quiz_format: args.quiz_format.into(),
        include_answers: !args.no_answers,
    };

    let mut request = JobRequest::new(args.kind.into(), &args.topic, &args.class_level)
        .duration_minutes(args.duration)
        .guides(args.guides.clone())
        .pages(pages)
        .use_textbook(args.textbook)
        .options(options);
    if let Some(subject) = &args.subject {
        request = request.subject(subject);
    }
    if let Some(instructions) = &args.instructions {
        request = request.special_instructions(instructions);
    }

    let mut job = orchestrator.submit(request)?;

    // Ctrl-C sets the job's cancel flag; the job stops at the next boundary.
    let cancel = job.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let bar = if show_progress {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed:.dim}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]),
        );
        bar.set_prefix(format!("{} {}", args.kind_label(), args.topic));
        bar.enable_steady_tick(Duration::from_millis(80));
        Some(bar)
    } else {
        None
    };

    while let Some(event) = job.events().next().await {
        match event {
            JobEvent::Progress { state, label, .. } => {
                if let Some(bar) = &bar {
                    bar.set_message(label);
                } else if !common.quiet && !state.is_terminal() {
                    eprintln!("{} {}", dim("·"), label);
                }
            }
            JobEvent::GuideSkipped { path, reason, .. } => {
                let line = format!("  {} {}  {}", yellow("⚠"), path.display(), dim(&reason));
                match &bar {
                    Some(bar) => bar.println(line),
                    None if !common.quiet => eprintln!("{line}"),
                    None => {}
                }
            }
            JobEvent::Detail { message, .. } => {
                if let Some(bar) = &bar {
                    bar.println(format!("  {}", dim(&message)));
                }
            }
            JobEvent::Finished { .. } => break,
        }
    }
    if let Some(bar) = &bar {
        bar.finish_and_clear();
    }

    match job.outcome().await? {
        JobOutcome::Completed { outputs, .. } => {
            if !common.quiet {
                for path in &outputs {
                    eprintln!("{}  {}", green("✔"), bold(&path.display().to_string()));
                }
            }
            Ok(())
        }
        JobOutcome::Failed { stage, cause } => {
            eprintln!("{} {} {}", red("✘"), bold(&format!("{stage}:")), cause);
            bail!("job failed during '{}'", stage)
        }
        JobOutcome::Cancelled { after } => {
            eprintln!("{} cancelled after '{}'", yellow("■"), after);
            if after < JobState::Rendering {
                eprintln!("   {}", dim("no output was written"));
            }
            Ok(())
        }
    }
}

impl GenerateArgs {
    fn kind_label(&self) -> &'static str {
        DocumentKind::from(self.kind).file_prefix()
    }
}

async fn index(common: &CommonArgs, args: IndexArgs) -> Result<()> {
    let guides = if args.guides.is_empty() {
        discover_guides(&common.guides_dir, &args.class_level).await?
    } else {
        args.guides
    };
    if guides.is_empty() {
        eprintln!("No guide PDFs found in {}", common.guides_dir.display());
        return Ok(());
    }

    let indexer = GuideIndexer::new(&common.cache_dir, Arc::new(PdfiumGuideParser::new()));
    let mut failures = 0usize;
    for path in guides {
        match indexer.get_or_build_index(&path).await {
            Ok(index) => {
                println!(
                    "{} {}  {}",
                    green("✔"),
                    bold(&path.display().to_string()),
                    dim(&format!("{} pages, {} headings", index.page_count(), index.headings.len()))
                );
                if !common.quiet {
                    for h in &index.headings {
                        let indent = "  ".repeat(usize::from(h.level));
                        println!("{indent}{}  {}", h.text, dim(&format!("p. {}", h.page)));
                    }
                }
            }
            Err(e) => {
                failures += 1;
                eprintln!("{} {}  {}", red("✘"), path.display(), e);
            }
        }
    }
    if failures > 0 {
        eprintln!("{failures} guide(s) could not be indexed");
    }
    Ok(())
}
