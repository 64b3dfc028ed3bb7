//! Guide indexing: headings and per-page text for each reference PDF.
//!
//! Guides are large (hundreds of pages) and reused across many lessons, so
//! the structure extracted from them is cached on disk and keyed by path.
//! A cache entry is trusted only while the file's [`Fingerprint`] is
//! unchanged; anything else (missing, unreadable, stale, corrupt) means a
//! fresh parse followed by a wholesale replacement of the entry.
//!
//! ## Why size + mtime and not a content hash?
//!
//! Hashing a 40 MB guide on every lesson costs more than the lookup saves.
//! Size and modification time change on every realistic edit and are read
//! from metadata alone.
//!
//! ## Atomic replacement
//!
//! Several jobs may index the same guide at once. Entries are written to a
//! temporary file in the cache directory and renamed into place, so a reader
//! sees either the old entry or the new one, never a torn file.

pub mod excerpt;
pub mod pdf;

use crate::error::{ExtractionError, FicheError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

pub use excerpt::{
    excerpts_for_pages, format_excerpts, parse_page_list, select_excerpts, select_excerpts_for_topics, ExcerptOrigin,
    GuideExcerpt,
};
pub use pdf::PdfiumGuideParser;

/// Cheap identity of a file's current contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub len: u64,
    /// Modification time in nanoseconds since the Unix epoch (0 if unavailable).
    pub modified_ns: u128,
}

impl Fingerprint {
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        let modified_ns = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_nanos());
        Self {
            len: meta.len(),
            modified_ns,
        }
    }

    /// Fingerprint the file at `path`.
    pub async fn of(path: &Path) -> Result<Self, ExtractionError> {
        let meta = tokio::fs::metadata(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ExtractionError::NotFound {
                path: path.to_path_buf(),
            },
            _ => ExtractionError::Io {
                path: path.to_path_buf(),
                detail: e.to_string(),
            },
        })?;
        Ok(Self::from_metadata(&meta))
    }
}

/// One heading recovered from a guide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadingEntry {
    pub text: String,
    /// 1-based physical page number.
    pub page: u32,
    /// 1 = top level.
    pub level: u8,
}

/// Structural index of one guide PDF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuideIndex {
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
    /// Headings in document order.
    pub headings: Vec<HeadingEntry>,
    /// Extracted text keyed by 1-based page number.
    pub pages: BTreeMap<u32, String>,
}

impl GuideIndex {
    pub fn page_count(&self) -> u32 {
        self.pages.keys().next_back().copied().unwrap_or(0)
    }

    /// Text of pages `first..=last`, separated by blank lines.
    pub fn text_range(&self, first: u32, last: u32) -> String {
        self.pages
            .range(first..=last)
            .map(|(_, t)| t.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Output of a [`GuideParser`]: everything in an index except identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedGuide {
    pub headings: Vec<HeadingEntry>,
    pub pages: BTreeMap<u32, String>,
}

/// Extracts headings and page text from a guide file.
///
/// Implementations are blocking; the indexer calls them from
/// `spawn_blocking`.
pub trait GuideParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<ParsedGuide, ExtractionError>;
}

/// Builds [`GuideIndex`]es and keeps them in a directory-backed cache.
#[derive(Clone)]
pub struct GuideIndexer {
    cache_dir: PathBuf,
    parser: Arc<dyn GuideParser>,
}

impl std::fmt::Debug for GuideIndexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuideIndexer")
            .field("cache_dir", &self.cache_dir)
            .field("parser", &"<dyn GuideParser>")
            .finish()
    }
}

impl GuideIndexer {
    pub fn new(cache_dir: impl Into<PathBuf>, parser: Arc<dyn GuideParser>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            parser,
        }
    }

    /// Return the index for `path`, from cache if its fingerprint still matches.
    ///
    /// # Errors
    /// [`ExtractionError`] when the file is missing, encrypted, corrupt or has
    /// no text. Cache read/write problems are never errors: an unreadable
    /// entry means a re-parse and a failed write only costs a re-parse later.
    pub async fn get_or_build_index(&self, path: &Path) -> Result<GuideIndex, ExtractionError> {
        let path = tokio::fs::canonicalize(path)
            .await
            .unwrap_or_else(|_| path.to_path_buf());
        let fingerprint = Fingerprint::of(&path).await?;
        let entry = self.entry_path(&path);

        if let Some(index) = self.read_entry(&entry, &path, fingerprint).await {
            debug!("Guide cache hit: {}", path.display());
            return Ok(index);
        }

        info!("Indexing guide {}", path.display());
        let parser = Arc::clone(&self.parser);
        let parse_path = path.clone();
        let parsed = tokio::task::spawn_blocking(move || parser.parse(&parse_path))
            .await
            .map_err(|e| ExtractionError::Internal(format!("Index task panicked: {}", e)))??;

        let index = GuideIndex {
            path,
            fingerprint,
            headings: parsed.headings,
            pages: parsed.pages,
        };
        info!(
            "Indexed {}: {} pages, {} headings",
            index.path.display(),
            index.pages.len(),
            index.headings.len()
        );

        let cache_dir = self.cache_dir.clone();
        let to_store = index.clone();
        let written =
            tokio::task::spawn_blocking(move || write_entry_atomic(&cache_dir, &entry, &to_store))
                .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Could not write guide cache entry: {}", e),
            Err(e) => warn!("Guide cache write task panicked: {}", e),
        }

        Ok(index)
    }

    /// Cache file for a guide: readable stem plus a hash of the full path.
    pub fn entry_path(&self, guide: &Path) -> PathBuf {
        let digest = Sha256::digest(guide.to_string_lossy().as_bytes());
        let hash = hex::encode(digest);
        let stem: String = guide
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .take(48)
            .collect();
        self.cache_dir.join(format!("{}-{}.json", stem, &hash[..16]))
    }

    async fn read_entry(
        &self,
        entry: &Path,
        guide: &Path,
        fingerprint: Fingerprint,
    ) -> Option<GuideIndex> {
        let bytes = tokio::fs::read(entry).await.ok()?;
        match serde_json::from_slice::<GuideIndex>(&bytes) {
            Ok(index) if index.path == guide && index.fingerprint == fingerprint => Some(index),
            Ok(_) => {
                debug!("Guide cache entry is stale: {}", entry.display());
                None
            }
            Err(e) => {
                warn!("Ignoring corrupt guide cache entry {}: {}", entry.display(), e);
                None
            }
        }
    }
}

fn write_entry_atomic(cache_dir: &Path, entry: &Path, index: &GuideIndex) -> std::io::Result<()> {
    std::fs::create_dir_all(cache_dir)?;
    let json = serde_json::to_vec(index).map_err(std::io::Error::other)?;
    let mut tmp = tempfile::NamedTempFile::new_in(cache_dir)?;
    tmp.write_all(&json)?;
    tmp.as_file().sync_all()?;
    tmp.persist(entry).map_err(|e| e.error)?;
    Ok(())
}

// ── Guide discovery ──────────────────────────────────────────────────────

/// PDF guides in `dir`, those matching `class_level` first.
///
/// Guides are conventionally named `guide_pedagogique_<class>.pdf`. If no
/// file name mentions the class, every PDF is returned so a single
/// multi-level guide still works. Order is alphabetical within each group.
pub async fn discover_guides(dir: &Path, class_level: &str) -> Result<Vec<PathBuf>, FicheError> {
    let unreadable = |source| FicheError::GuidesDirUnreadable {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = tokio::fs::read_dir(dir).await.map_err(unreadable)?;

    let mut pdfs = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(unreadable)? {
        let path = entry.path();
        let is_pdf = path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));
        if is_pdf {
            pdfs.push(path);
        }
    }
    pdfs.sort();

    let tokens = class_tokens(class_level);
    let (matching, rest): (Vec<_>, Vec<_>) = pdfs.into_iter().partition(|p| {
        p.file_stem()
            .map(|s| s.to_string_lossy().to_lowercase())
            .is_some_and(|stem| {
                stem.split(|c: char| !c.is_alphanumeric())
                    .any(|w| tokens.iter().any(|t| t == w))
            })
    });

    debug!(
        "Discovered {} guides for class '{}' ({} generic)",
        matching.len(),
        class_level,
        rest.len()
    );
    Ok(if matching.is_empty() { rest } else { matching })
}

/// Student textbook for `class_level` in `dir`, if one exists.
///
/// Textbooks are named `livre_<class>.pdf`, `manuel_<class>.pdf`,
/// `textbook_<class>.pdf` or just `<class>.pdf`; the first existing
/// candidate wins.
pub async fn find_textbook(dir: &Path, class_level: &str) -> Option<PathBuf> {
    for token in class_tokens(class_level) {
        for prefix in ["livre_", "manuel_", "textbook_", ""] {
            let candidate = dir.join(format!("{prefix}{token}.pdf"));
            if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                debug!("Found textbook {}", candidate.display());
                return Some(candidate);
            }
        }
    }
    None
}

/// Spellings of a class level found in guide file names (`6e`, `6eme`, `6ème`).
fn class_tokens(class_level: &str) -> Vec<String> {
    let c = class_level.trim().to_lowercase();
    let mut tokens = vec![c.clone()];
    if let Some(num) = c.strip_suffix('e') {
        if !num.is_empty() && num.chars().all(|ch| ch.is_ascii_digit()) {
            tokens.push(format!("{num}eme"));
            tokens.push(format!("{num}ème"));
        }
    }
    tokens
}
