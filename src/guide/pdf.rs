//! pdfium-backed guide parsing and the font-size heading heuristic.
//!
//! ## Why font size and not the PDF outline?
//!
//! Most pedagogical guides are exported from word processors without bookmarks,
//! and the printed table of contents uses page labels that rarely match
//! physical pages. The typography is reliable though: chapter and lesson
//! titles are set larger (or bold) than body text on the page they start.
//!
//! ## Why spawn_blocking?
//!
//! pdfium is a C++ library with thread-local state. [`PdfiumGuideParser`] is
//! blocking and the indexer always calls it from `spawn_blocking`, keeping
//! Tokio worker threads free while a 300-page guide is walked.

use super::{GuideParser, HeadingEntry, ParsedGuide};
use crate::error::ExtractionError;
use pdfium_render::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Spans at least this much larger than body text are headings.
const HEADING_SIZE_RATIO: f32 = 1.15;
/// Longer spans are paragraphs set in a large font, not headings.
const MAX_HEADING_CHARS: usize = 120;
/// Deeper typographic levels collapse onto this one.
const MAX_HEADING_LEVEL: u8 = 3;

/// One run of text with a uniform font.
#[derive(Debug, Clone, PartialEq)]
pub struct TextSpan {
    /// 1-based page number.
    pub page: u32,
    pub text: String,
    /// Rendered font size in points.
    pub size: f32,
    pub bold: bool,
}

/// Parses guides with pdfium.
///
/// Binds to the library in `PDFIUM_LIB_PATH` (a directory) when set,
/// otherwise to the system library.
#[derive(Debug, Clone, Default)]
pub struct PdfiumGuideParser {
    library_dir: Option<PathBuf>,
}

impl PdfiumGuideParser {
    pub fn new() -> Self {
        Self {
            library_dir: std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from),
        }
    }

    pub fn with_library_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            library_dir: Some(dir.into()),
        }
    }

    fn bind(&self) -> Result<Pdfium, ExtractionError> {
        let bindings = match &self.library_dir {
            Some(dir) => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir)),
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| ExtractionError::Binding(format!("{:?}", e)))?;
        Ok(Pdfium::new(bindings))
    }
}

impl GuideParser for PdfiumGuideParser {
    fn parse(&self, path: &Path) -> Result<ParsedGuide, ExtractionError> {
        if !path.exists() {
            return Err(ExtractionError::NotFound {
                path: path.to_path_buf(),
            });
        }

        let pdfium = self.bind()?;
        let document = pdfium.load_pdf_from_file(path, None).map_err(|e| {
            let err_str = format!("{:?}", e);
            if err_str.contains("Password") || err_str.contains("password") {
                ExtractionError::Encrypted {
                    path: path.to_path_buf(),
                }
            } else {
                ExtractionError::Corrupt {
                    path: path.to_path_buf(),
                    detail: err_str,
                }
            }
        })?;

        let mut pages = BTreeMap::new();
        let mut spans = Vec::new();

        for (idx, page) in document.pages().iter().enumerate() {
            let page_no = idx as u32 + 1;

            let text = page
                .text()
                .map(|t| t.all())
                .map_err(|e| ExtractionError::Corrupt {
                    path: path.to_path_buf(),
                    detail: format!("page {}: {:?}", page_no, e),
                })?;
            pages.insert(page_no, text);

            for object in page.objects().iter() {
                if let Some(text_obj) = object.as_text_object() {
                    let font_name = text_obj.font().name();
                    spans.push(TextSpan {
                        page: page_no,
                        text: text_obj.text(),
                        size: text_obj.scaled_font_size().value,
                        bold: font_name.contains("Bold") || font_name.contains("Black"),
                    });
                }
            }
        }

        if pages.values().all(|t| t.trim().is_empty()) {
            return Err(ExtractionError::NoText {
                path: path.to_path_buf(),
            });
        }

        let headings = detect_headings(&spans);
        debug!(
            "{}: {} text spans, {} headings",
            path.display(),
            spans.len(),
            headings.len()
        );
        Ok(ParsedGuide { headings, pages })
    }
}

// ── Heading heuristic ────────────────────────────────────────────────────

/// Sizes are compared in half-point buckets.
fn bucket(size: f32) -> i32 {
    (size * 2.0).round() as i32
}

/// Recover a heading outline from styled text spans.
///
/// 1. Adjacent spans on one page with the same style are merged (a title is
///    often split into several text objects).
/// 2. Body size is the most common font size, weighted by character count.
/// 3. A span is a heading if it is at least 15 % larger than body text, or
///    bold at body size and short without a final period.
/// 4. Distinct heading sizes, largest first, map to levels 1, 2, 3; bold
///    body-size headings take the deepest level.
/// 5. Running headers (identical text on many pages) are dropped.
pub fn detect_headings(spans: &[TextSpan]) -> Vec<HeadingEntry> {
    let merged = merge_spans(spans);
    let Some(body) = body_bucket(&merged) else {
        return Vec::new();
    };
    let threshold = (body as f32 * HEADING_SIZE_RATIO).ceil() as i32;

    let candidates: Vec<(&TextSpan, i32)> = merged
        .iter()
        .filter(|s| looks_like_title(&s.text))
        .filter_map(|s| {
            let b = bucket(s.size);
            if b >= threshold {
                Some((s, b))
            } else if s.bold && b >= body && s.text.chars().count() <= 80 && !s.text.ends_with('.') {
                Some((s, body))
            } else {
                None
            }
        })
        .collect();

    let mut sizes: Vec<i32> = candidates.iter().map(|(_, b)| *b).collect();
    sizes.sort_unstable_by(|a, b| b.cmp(a));
    sizes.dedup();
    let level_of = |b: i32| -> u8 {
        let rank = sizes.iter().position(|s| *s == b).unwrap_or(sizes.len());
        (rank.min(MAX_HEADING_LEVEL as usize - 1) as u8) + 1
    };

    let running = running_headers(&candidates);

    candidates
        .iter()
        .filter(|(s, _)| !running.contains(&s.text.as_str()))
        .map(|(s, b)| HeadingEntry {
            text: s.text.clone(),
            page: s.page,
            level: level_of(*b),
        })
        .collect()
}

fn merge_spans(spans: &[TextSpan]) -> Vec<TextSpan> {
    let mut out: Vec<TextSpan> = Vec::with_capacity(spans.len());
    for span in spans {
        let text = span.text.split_whitespace().collect::<Vec<_>>().join(" ");
        if text.is_empty() {
            continue;
        }
        match out.last_mut() {
            Some(prev)
                if prev.page == span.page
                    && prev.bold == span.bold
                    && bucket(prev.size) == bucket(span.size)
                    && prev.text.chars().count() + text.chars().count() < MAX_HEADING_CHARS =>
            {
                prev.text.push(' ');
                prev.text.push_str(&text);
            }
            _ => out.push(TextSpan {
                text,
                ..span.clone()
            }),
        }
    }
    out
}

fn body_bucket(spans: &[TextSpan]) -> Option<i32> {
    let mut weights: HashMap<i32, usize> = HashMap::new();
    for s in spans {
        *weights.entry(bucket(s.size)).or_default() += s.text.chars().count();
    }
    weights
        .into_iter()
        .max_by(|(sa, wa), (sb, wb)| wa.cmp(wb).then(sb.cmp(sa)))
        .map(|(size, _)| size)
}

fn looks_like_title(text: &str) -> bool {
    let len = text.chars().count();
    len <= MAX_HEADING_CHARS && text.chars().filter(|c| c.is_alphabetic()).count() >= 3
}

/// Texts repeated on at least three pages and on more than a third of all
/// candidate pages: page headers and footers.
fn running_headers<'a>(candidates: &[(&'a TextSpan, i32)]) -> Vec<&'a str> {
    let mut pages_by_text: HashMap<&str, Vec<u32>> = HashMap::new();
    for &(s, _) in candidates {
        pages_by_text.entry(s.text.as_str()).or_default().push(s.page);
    }
    let distinct_pages = {
        let mut p: Vec<u32> = candidates.iter().map(|(s, _)| s.page).collect();
        p.sort_unstable();
        p.dedup();
        p.len().max(1)
    };
    pages_by_text
        .into_iter()
        .filter(|(_, pages)| pages.len() >= 3 && pages.len() * 3 > distinct_pages)
        .map(|(t, _)| t)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(page: u32, text: &str, size: f32, bold: bool) -> TextSpan {
        TextSpan {
            page,
            text: text.into(),
            size,
            bold,
        }
    }

    fn body(page: u32) -> TextSpan {
        span(
            page,
            "Les élèves observent le document et répondent aux questions posées par l'enseignant.",
            11.0,
            false,
        )
    }

    #[test]
    fn larger_fonts_become_ranked_headings() {
        let spans = vec![
            span(1, "Unité 1 : L'eau", 20.0, true),
            body(1),
            span(2, "Leçon 1 : Le cycle de l'eau", 15.0, true),
            body(2),
            body(2),
            span(3, "Leçon 2 : Les états de l'eau", 15.0, true),
            body(3),
        ];
        let h = detect_headings(&spans);
        assert_eq!(h.len(), 3);
        assert_eq!(h[0].level, 1);
        assert_eq!(h[1].level, 2);
        assert_eq!(h[1].page, 2);
        assert_eq!(h[2].text, "Leçon 2 : Les états de l'eau");
    }

    #[test]
    fn bold_body_size_title_is_deepest_heading() {
        let spans = vec![
            span(1, "Chapitre", 18.0, false),
            body(1),
            span(1, "Objectifs", 11.0, true),
            body(1),
        ];
        let h = detect_headings(&spans);
        assert_eq!(h.len(), 2);
        assert_eq!(h[1].text, "Objectifs");
        assert_eq!(h[1].level, 2);
    }

    #[test]
    fn split_title_objects_are_merged() {
        let spans = vec![
            span(4, "Le cycle", 16.0, false),
            span(4, "de l'eau", 16.0, false),
            body(4),
            body(4),
        ];
        let h = detect_headings(&spans);
        assert_eq!(h[0].text, "Le cycle de l'eau");
    }

    #[test]
    fn page_numbers_and_body_are_ignored() {
        let spans = vec![span(1, "12", 16.0, false), body(1), body(1)];
        assert!(detect_headings(&spans).is_empty());
    }

    #[test]
    fn running_headers_are_dropped() {
        let mut spans = Vec::new();
        for page in 1..=4 {
            spans.push(span(page, "Guide du maître CM1", 14.0, false));
            spans.push(body(page));
        }
        spans.push(span(2, "Leçon : Les fractions", 16.0, false));
        let h = detect_headings(&spans);
        assert_eq!(h.len(), 1);
        assert_eq!(h[0].text, "Leçon : Les fractions");
    }

    #[test]
    fn no_spans_no_headings() {
        assert!(detect_headings(&[]).is_empty());
    }
}
