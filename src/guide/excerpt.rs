//! Topic → guide excerpts, bounded by the excerpt budget.
//!
//! Matching is deliberately simple and deterministic:
//!
//! 1. A heading containing the whole topic (or contained in it) wins.
//! 2. Otherwise the heading sharing the most topic keywords wins.
//!    Keywords are topic words longer than three characters, which drops
//!    French articles and prepositions (`le`, `les`, `des`, `une`).
//! 3. A matched heading's section runs to the page before the next heading,
//!    or four pages when there is no usable next heading.
//! 4. Without any heading match, the pages mentioning the most keywords are
//!    used instead.
//!
//! A manual page list ([`parse_page_list`], [`excerpts_for_pages`]) skips
//! matching altogether. The same pages are read from the student textbook
//! when one is used.

use super::GuideIndex;
use crate::error::FicheError;
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Widest range accepted in a manual page list.
const MAX_PAGE_RANGE: u32 = 500;
/// Pages covered when the section end is unknown.
const DEFAULT_SECTION_SPAN: u32 = 3;
/// Pages kept by the keyword-density fallback.
const FALLBACK_PAGES: usize = 3;

/// Which kind of document an excerpt was read from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExcerptOrigin {
    #[default]
    Guide,
    Textbook,
}

/// A slice of guide text selected for one prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuideExcerpt {
    pub source: PathBuf,
    pub origin: ExcerptOrigin,
    /// Matched heading, or None for the page-level fallback.
    pub heading: Option<String>,
    pub first_page: u32,
    pub last_page: u32,
    pub text: String,
}

/// Lowercase topic words longer than three characters.
pub fn keywords(topic: &str) -> Vec<String> {
    let mut words: Vec<String> = topic
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 3)
        .map(str::to_string)
        .collect();
    words.dedup();
    words
}

/// Pick excerpts for `topic` from every index, cut to `budget` characters.
pub fn select_excerpts(indexes: &[GuideIndex], topic: &str, budget: usize) -> Vec<GuideExcerpt> {
    let keys = keywords(topic);
    let (mut by_heading, mut by_page): (Vec<_>, Vec<_>) = (Vec::new(), Vec::new());

    for index in indexes {
        if let Some(e) = heading_excerpt(index, topic, &keys) {
            by_heading.push(e);
        } else {
            by_page.extend(page_excerpts(index, &keys));
        }
    }
    by_heading.append(&mut by_page);
    apply_budget(by_heading, budget)
}

/// Excerpts for several topics sharing one budget.
///
/// Each topic gets an equal share; a section already picked for an earlier
/// topic is not repeated.
pub fn select_excerpts_for_topics(indexes: &[GuideIndex], topics: &[&str], budget: usize) -> Vec<GuideExcerpt> {
    if topics.len() <= 1 {
        return select_excerpts(indexes, topics.first().copied().unwrap_or(""), budget);
    }
    let share = budget / topics.len();
    let mut out: Vec<GuideExcerpt> = Vec::new();
    for topic in topics {
        for e in select_excerpts(indexes, topic, share) {
            let seen = out
                .iter()
                .any(|o| o.source == e.source && o.first_page == e.first_page);
            if !seen {
                out.push(e);
            }
        }
    }
    out
}

fn heading_excerpt(index: &GuideIndex, topic: &str, keys: &[String]) -> Option<GuideExcerpt> {
    let topic_l = topic.trim().to_lowercase();
    if topic_l.is_empty() {
        return None;
    }

    let direct = index.headings.iter().position(|h| {
        let h_l = h.text.to_lowercase();
        h_l.contains(&topic_l) || (h_l.chars().count() >= 4 && topic_l.contains(&h_l))
    });

    let pos = direct.or_else(|| {
        index
            .headings
            .iter()
            .enumerate()
            .map(|(i, h)| {
                let h_l = h.text.to_lowercase();
                (i, keys.iter().filter(|k| h_l.contains(k.as_str())).count())
            })
            .filter(|(_, score)| *score > 0)
            .max_by(|(ia, sa), (ib, sb)| sa.cmp(sb).then(ib.cmp(ia)))
            .map(|(i, _)| i)
    })?;

    let heading = &index.headings[pos];
    let first = heading.page;
    let last = match index.headings.get(pos + 1).map(|n| n.page) {
        Some(next) if next > first => next - 1,
        Some(next) if next == first => first,
        _ => first + DEFAULT_SECTION_SPAN,
    };
    let last = last.min(index.page_count().max(first));

    Some(GuideExcerpt {
        source: index.path.clone(),
        origin: ExcerptOrigin::Guide,
        heading: Some(heading.text.clone()),
        first_page: first,
        last_page: last,
        text: index.text_range(first, last),
    })
}

fn page_excerpts(index: &GuideIndex, keys: &[String]) -> Vec<GuideExcerpt> {
    if keys.is_empty() {
        return Vec::new();
    }
    let mut scored: Vec<(u32, usize)> = index
        .pages
        .iter()
        .map(|(page, text)| {
            let t = text.to_lowercase();
            (*page, keys.iter().map(|k| t.matches(k.as_str()).count()).sum())
        })
        .filter(|(_, score)| *score > 0)
        .collect();
    scored.sort_by(|(pa, sa), (pb, sb)| sb.cmp(sa).then(pa.cmp(pb)));
    scored.truncate(FALLBACK_PAGES);
    scored.sort_by_key(|(page, _)| *page);

    scored
        .into_iter()
        .map(|(page, _)| GuideExcerpt {
            source: index.path.clone(),
            origin: ExcerptOrigin::Guide,
            heading: None,
            first_page: page,
            last_page: page,
            text: index.text_range(page, page),
        })
        .collect()
}

/// Parse a page list such as `"12-14, 20"` into sorted, distinct pages.
///
/// Anything other than digits, commas and dashes is ignored, as is a
/// reversed range. Page numbers are physical and 1-based.
pub fn parse_page_list(spec: &str) -> Result<Vec<u32>, FicheError> {
    let invalid = || FicheError::InvalidConfig(format!("Unreadable page list '{}'", spec.trim()));
    let cleaned: String = spec
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',' || *c == '-')
        .collect();

    let mut pages = BTreeSet::new();
    for part in cleaned.split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((a, b)) => {
                let (a, b): (u32, u32) = (a.parse().map_err(|_| invalid())?, b.parse().map_err(|_| invalid())?);
                if b.saturating_sub(a) > MAX_PAGE_RANGE {
                    return Err(invalid());
                }
                pages.extend(a..=b);
            }
            None => {
                pages.insert(part.parse::<u32>().map_err(|_| invalid())?);
            }
        }
    }
    pages.remove(&0);
    if pages.is_empty() {
        return Err(invalid());
    }
    Ok(pages.into_iter().collect())
}

/// Excerpts covering exactly `pages` in every index, cut to `budget`.
///
/// Consecutive pages form one excerpt, labelled with the heading whose
/// section contains its first page.
pub fn excerpts_for_pages(
    indexes: &[GuideIndex],
    pages: &[u32],
    origin: ExcerptOrigin,
    budget: usize,
) -> Vec<GuideExcerpt> {
    let runs = page_runs(pages);
    let mut out = Vec::new();
    for index in indexes {
        for &(first, last) in &runs {
            let text = index.text_range(first, last);
            if text.is_empty() {
                continue;
            }
            let heading = index
                .headings
                .iter()
                .rev()
                .find(|h| h.page <= first)
                .map(|h| h.text.clone());
            out.push(GuideExcerpt {
                source: index.path.clone(),
                origin,
                heading,
                first_page: first,
                last_page: last,
                text,
            });
        }
    }
    apply_budget(out, budget)
}

/// Sorted pages grouped into inclusive `(first, last)` runs.
fn page_runs(pages: &[u32]) -> Vec<(u32, u32)> {
    let sorted: BTreeSet<u32> = pages.iter().copied().collect();
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for page in sorted {
        match runs.last_mut() {
            Some((_, last)) if *last + 1 == page => *last = page,
            _ => runs.push((page, page)),
        }
    }
    runs
}

/// Keep excerpts in order until `budget` characters are used; the last one
/// is truncated on a char boundary and marked with `…`.
fn apply_budget(excerpts: Vec<GuideExcerpt>, budget: usize) -> Vec<GuideExcerpt> {
    let mut remaining = budget;
    let mut out = Vec::new();

    for mut e in excerpts {
        if remaining == 0 {
            break;
        }
        if e.text.trim().is_empty() {
            continue;
        }
        let len = e.text.chars().count();
        if len > remaining {
            let cut: String = e.text.chars().take(remaining.saturating_sub(1)).collect();
            e.text = format!("{}…", cut.trim_end());
            remaining = 0;
        } else {
            remaining -= len;
        }
        out.push(e);
    }
    out
}

/// Render excerpts for the `{excerpts}` prompt placeholder.
///
/// Textbook excerpts follow the guide excerpts under their own banner.
pub fn format_excerpts(excerpts: &[GuideExcerpt]) -> String {
    if excerpts.is_empty() {
        return "(aucun extrait de guide disponible : appuie-toi sur le programme officiel)".to_string();
    }
    let (guide, textbook): (Vec<&GuideExcerpt>, Vec<&GuideExcerpt>) =
        excerpts.iter().partition(|e| e.origin == ExcerptOrigin::Guide);

    let mut out = guide.iter().map(|e| format_one(e)).collect::<Vec<_>>().join("\n\n");
    if !textbook.is_empty() {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str("=== CONTEXTE SUPPLÉMENTAIRE DU MANUEL ÉLÈVE ===\n\n");
        out.push_str(&textbook.iter().map(|e| format_one(e)).collect::<Vec<_>>().join("\n\n"));
    }
    out
}

fn format_one(e: &GuideExcerpt) -> String {
    let name = e
        .source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let pages = if e.first_page == e.last_page {
        format!("p. {}", e.first_page)
    } else {
        format!("p. {}-{}", e.first_page, e.last_page)
    };
    match &e.heading {
        Some(h) => format!("[{name}, {pages}, « {h} »]\n{}", e.text),
        None => format!("[{name}, {pages}]\n{}", e.text),
    }
}
