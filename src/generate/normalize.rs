//! Deterministic cleanup of raw model output before it is checked.
//!
//! Models wrap documents in ```` ```markdown ```` fences despite being told
//! not to, open with "Voici la fiche demandée :", emit CRLF, or leave long
//! runs of blank lines. None of that is content and all of it gets in the way
//! of marker matching, so it is removed here.
//!
//! Rules run in table order; the fence goes first so later rules only see
//! the document body.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::trace;

type Rule = fn(&str) -> String;

const RULES: &[(&str, Rule)] = &[
    ("outer fence", unwrap_fence),
    ("line endings", unify_newlines),
    ("invisible chars", drop_invisible),
    ("chat preamble", drop_preamble),
    ("trailing spaces", trim_line_ends),
    ("blank runs", squeeze_blank_runs),
];

/// Apply every cleanup rule, then end with exactly one newline.
///
/// Blank input stays blank (`""`), so callers can treat it as an empty answer.
pub fn clean_markdown(raw: &str) -> String {
    let mut text = raw.to_string();
    for (name, rule) in RULES {
        let next = rule(&text);
        if next != text {
            trace!("normalize: applied '{}'", name);
        }
        text = next;
    }
    let body = text.trim_matches('\n');
    if body.trim().is_empty() {
        String::new()
    } else {
        format!("{body}\n")
    }
}

static RE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\s*```(?:markdown|md)?[ \t]*\r?\n(.*?)\r?\n```\s*$").unwrap());

fn unwrap_fence(text: &str) -> String {
    RE_FENCE
        .captures(text)
        .and_then(|c| c.get(1))
        .map_or_else(|| text.to_string(), |m| m.as_str().to_string())
}

fn unify_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

const INVISIBLE: [char; 6] = ['\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{FEFF}', '\u{00AD}'];

fn drop_invisible(text: &str) -> String {
    text.chars().filter(|c| !INVISIBLE.contains(c)).collect()
}

/// Lines scanned for the first marker or heading.
const PREAMBLE_WINDOW: usize = 4;

/// Drop a short conversational lead-in before the first marker or heading.
fn drop_preamble(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines
        .iter()
        .take(PREAMBLE_WINDOW)
        .position(|l| {
            let t = l.trim_start();
            t.starts_with("{{") || t.starts_with('#')
        });
    match start {
        Some(n) if n > 0 => lines[n..].join("\n"),
        _ => text.to_string(),
    }
}

fn trim_line_ends(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for (i, line) in text.lines().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(line.trim_end());
    }
    out
}

static RE_BLANK_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

fn squeeze_blank_runs(text: &str) -> String {
    RE_BLANK_RUN.replace_all(text, "\n\n\n").into_owned()
}
