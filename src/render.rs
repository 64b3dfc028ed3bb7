//! Renderer collaborators and output files.
//!
//! Layout engines (PDF, DOCX) live outside this crate and plug in through
//! [`DocumentRenderer`]. Two renderers ship here: [`MarkdownRenderer`]
//! re-emits clean markdown from the tree, and [`JsonRenderer`] dumps the
//! tree itself for downstream tools.
//!
//! ## Output names
//!
//! Files are named `<Prefix>_<topic>_<class>.<ext>`. An existing file is
//! never overwritten: the name gains a `_HHMMSS` suffix, then a counter.

use crate::config::{DocumentKind, OutputFormat};
use crate::document::{DocumentNode, DocumentTree, MetadataBanner, TextRun};
use crate::error::{FicheError, RenderError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Turns a finished tree into bytes of one format.
pub trait DocumentRenderer: Send + Sync {
    fn format(&self) -> OutputFormat;
    fn render(&self, tree: &DocumentTree) -> Result<Vec<u8>, RenderError>;
}

/// Built-in renderer for a format.
pub fn renderer_for(format: OutputFormat) -> Box<dyn DocumentRenderer> {
    match format {
        OutputFormat::Markdown => Box::new(MarkdownRenderer),
        OutputFormat::Json => Box::new(JsonRenderer),
    }
}

// ── Markdown ─────────────────────────────────────────────────────────────

/// Tree → markdown without markers. Unresolved images become captions.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownRenderer;

impl DocumentRenderer for MarkdownRenderer {
    fn format(&self) -> OutputFormat {
        OutputFormat::Markdown
    }

    fn render(&self, tree: &DocumentTree) -> Result<Vec<u8>, RenderError> {
        Ok(render_markdown(tree).into_bytes())
    }
}

pub fn render_markdown(tree: &DocumentTree) -> String {
    let mut blocks: Vec<String> = Vec::new();
    let banner = banner_block(&tree.banner, tree.first_heading());
    if !banner.is_empty() {
        blocks.push(banner);
    }

    let mut list: Vec<String> = Vec::new();
    let mut ordinal = 0usize;
    for node in &tree.nodes {
        if let DocumentNode::ListItem { ordered, runs } = node {
            if *ordered {
                ordinal += 1;
                list.push(format!("{ordinal}. {}", runs_to_markdown(runs)));
            } else {
                list.push(format!("- {}", runs_to_markdown(runs)));
            }
            continue;
        }
        if !list.is_empty() {
            blocks.push(list.join("\n"));
            list.clear();
            ordinal = 0;
        }
        blocks.push(node_to_markdown(node));
    }
    if !list.is_empty() {
        blocks.push(list.join("\n"));
    }

    let mut out = blocks.join("\n\n");
    out.push('\n');
    out
}

fn banner_block(banner: &MetadataBanner, first_heading: Option<&str>) -> String {
    let mut out = String::new();
    if let Some(title) = &banner.title {
        if first_heading != Some(title.as_str()) {
            let _ = writeln!(out, "# {title}");
        }
    }
    let mut facts = Vec::new();
    if let Some(class) = &banner.class_level {
        facts.push(format!("**Classe :** {class}"));
    }
    if let Some(subject) = banner.fields.get("subject").filter(|s| !s.is_empty()) {
        facts.push(format!("**Matière :** {subject}"));
    }
    if let Some(duration) = &banner.duration {
        facts.push(format!("**Durée :** {duration}"));
    }
    if !facts.is_empty() {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&facts.join(" · "));
    }
    out.trim_end().to_string()
}

fn node_to_markdown(node: &DocumentNode) -> String {
    match node {
        DocumentNode::Heading { level, text } => {
            format!("{} {}", "#".repeat(usize::from((*level).clamp(1, 6))), text)
        }
        DocumentNode::Paragraph { runs } => runs_to_markdown(runs),
        DocumentNode::ListItem { runs, .. } => format!("- {}", runs_to_markdown(runs)),
        DocumentNode::Rule => "---".to_string(),
        DocumentNode::Table { rows } => pipe_table(rows),
        DocumentNode::FieldMarker { name, value, label } => {
            let label = label.as_deref().unwrap_or(name);
            if value.is_empty() {
                format!("**{label} :** ____________________")
            } else {
                format!("**{label} :** {value}")
            }
        }
        DocumentNode::TableMarker { name, rows } => {
            format!("**{}**\n\n{}", name, pipe_table(rows))
        }
        DocumentNode::ImagePlaceholder { prompt, image } => match image {
            Some(bytes) => format!("![{}]({})", prompt, data_uri(bytes)),
            None => format!("*Illustration : {prompt}*"),
        },
    }
}

fn runs_to_markdown(runs: &[TextRun]) -> String {
    runs.iter()
        .map(|r| match (r.bold, r.italic) {
            (true, true) => format!("***{}***", r.text),
            (true, false) => format!("**{}**", r.text),
            (false, true) => format!("*{}*", r.text),
            (false, false) => r.text.clone(),
        })
        .collect()
}

fn pipe_table(rows: &[Vec<String>]) -> String {
    let Some(first) = rows.first() else {
        return String::new();
    };
    let row = |cells: &[String]| {
        let cells: Vec<String> = cells.iter().map(|c| c.replace('|', "\\|")).collect();
        format!("| {} |", cells.join(" | "))
    };
    let mut lines = vec![row(first), format!("|{}", " --- |".repeat(first.len()))];
    lines.extend(rows[1..].iter().map(|r| row(r)));
    lines.join("\n")
}

fn data_uri(bytes: &[u8]) -> String {
    let mime = match image::guess_format(bytes) {
        Ok(image::ImageFormat::Jpeg) => "image/jpeg",
        Ok(image::ImageFormat::WebP) => "image/webp",
        Ok(image::ImageFormat::Gif) => "image/gif",
        _ => "image/png",
    };
    format!("data:{};base64,{}", mime, STANDARD.encode(bytes))
}

// ── JSON ─────────────────────────────────────────────────────────────────

/// Pretty-printed serde dump of the tree; images are base64.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRenderer;

impl DocumentRenderer for JsonRenderer {
    fn format(&self) -> OutputFormat {
        OutputFormat::Json
    }

    fn render(&self, tree: &DocumentTree) -> Result<Vec<u8>, RenderError> {
        Ok(serde_json::to_vec_pretty(tree)?)
    }
}

// ── Output files ─────────────────────────────────────────────────────────

/// Keep letters, digits, spaces, `_` and `-`.
pub fn safe_name(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '_' | '-'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// First free path for this document in `dir`.
pub async fn unique_output_path(
    dir: &Path,
    kind: DocumentKind,
    topic: &str,
    class_level: &str,
    extension: &str,
) -> PathBuf {
    let base = format!(
        "{}_{}_{}",
        kind.file_prefix(),
        safe_name(topic),
        safe_name(class_level)
    );
    let candidate = dir.join(format!("{base}.{extension}"));
    if !exists(&candidate).await {
        return candidate;
    }

    let stamp = chrono::Local::now().format("%H%M%S").to_string();
    let candidate = dir.join(format!("{base}_{stamp}.{extension}"));
    if !exists(&candidate).await {
        return candidate;
    }

    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{base}_{stamp}_{n}.{extension}"));
        if !exists(&candidate).await {
            return candidate;
        }
        n += 1;
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Render `tree` and write it under `dir`, returning the final path.
///
/// The bytes go to a temporary sibling first and are linked into place.
pub async fn write_document(
    renderer: &dyn DocumentRenderer,
    tree: &DocumentTree,
    dir: &Path,
    kind: DocumentKind,
    topic: &str,
    class_level: &str,
) -> Result<PathBuf, FicheError> {
    let bytes = renderer.render(tree)?;

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| FicheError::OutputWriteFailed {
            path: dir.to_path_buf(),
            source: e,
        })?;

    let extension = renderer.format().extension();
    let path = unique_output_path(dir, kind, topic, class_level, extension).await;
    let size = bytes.len();

    let (tmp_dir, target) = (dir.to_path_buf(), path.clone());
    let written = tokio::task::spawn_blocking(move || persist_bytes(&tmp_dir, &target, &bytes))
        .await
        .unwrap_or_else(|e| Err(std::io::Error::other(e)));
    written.map_err(|e| FicheError::OutputWriteFailed {
        path: path.clone(),
        source: e,
    })?;

    info!("Wrote {} ({} bytes)", path.display(), size);
    Ok(path)
}

/// Write `bytes` to a temp file in `dir` and link it to `path`.
///
/// Fails if `path` already exists; the temp file is removed on every
/// error path when the handle drops.
fn persist_bytes(dir: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write as _;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist_noclobber(path).map_err(|e| e.error)?;
    Ok(())
}

/// Title for logs: banner title, first heading, or the fallback.
pub fn display_title<'a>(tree: &'a DocumentTree, fallback: &'a str) -> &'a str {
    tree.banner
        .title
        .as_deref()
        .or_else(|| tree.first_heading())
        .unwrap_or(fallback)
}
