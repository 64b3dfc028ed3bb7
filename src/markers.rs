//! Marker syntax embedded in generated markdown.
//!
//! The model is asked to emit structured data as literal tokens:
//!
//! ```text
//! {{FIELD:title=Le cycle de l'eau}}
//! {{FIELD:nom=|label=Nom de l'élève}}
//! {{TABLE:etats}}
//! | État | Exemple |
//! | Solide | Glace |
//! {{/TABLE}}
//! {{IMAGE:schéma du cycle de l'eau}}
//! ```
//!
//! Matching is bit-exact: `{{ FIELD:…}}`, lowercase `{{field:…}}` or a
//! missing brace are not markers and stay in the text as written. Anything
//! else shaped like `{{NAME:…}}` is an unknown marker and is also kept
//! verbatim.

use once_cell::sync::Lazy;
use regex::Regex;

/// Field names that populate the metadata banner instead of producing nodes.
pub const BANNER_KEYS: &[&str] = &["title", "class", "duration", "subject", "chapter"];

pub const TABLE_CLOSE: &str = "{{/TABLE}}";

static RE_FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{FIELD:([^=|{}]+?)(?:=([^|{}]*))?((?:\|[^|{}]*)*)\}\}").unwrap()
});

static RE_TABLE_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\{\{TABLE:([^{}]+)\}\}$").unwrap());

static RE_IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\{\{IMAGE:([^{}]+)\}\}$").unwrap());

/// One parsed `{{FIELD:…}}` marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub value: String,
    /// `|label=…` attribute, if present.
    pub label: Option<String>,
}

impl Field {
    pub fn is_banner(&self) -> bool {
        BANNER_KEYS.contains(&self.name.as_str())
    }
}

fn field_from_captures(caps: &regex::Captures<'_>) -> Option<Field> {
    let name = caps.get(1)?.as_str().trim();
    if name.is_empty() {
        return None;
    }
    let mut value = caps.get(2).map(|m| m.as_str().trim().to_string()).unwrap_or_default();
    let mut label = None;

    for attr in caps.get(3).map(|m| m.as_str()).unwrap_or("").split('|') {
        if let Some((k, v)) = attr.split_once('=') {
            match k.trim() {
                "label" => label = Some(v.trim().to_string()).filter(|l| !l.is_empty()),
                "value" if value.is_empty() => value = v.trim().to_string(),
                _ => {}
            }
        }
    }

    Some(Field {
        name: name.to_string(),
        value,
        label,
    })
}

/// Every field marker anywhere in `text`, in order.
pub fn scan_fields(text: &str) -> Vec<Field> {
    RE_FIELD
        .captures_iter(text)
        .filter_map(|c| field_from_captures(&c))
        .collect()
}

/// How a line relates to field markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldLine {
    /// Only field markers and whitespace.
    Fields(Vec<Field>),
    /// Free text followed by exactly one trailing field marker,
    /// e.g. `**Nom :** {{FIELD:nom=}}`. The text becomes the label.
    Labelled { label: String, field: Field },
    /// Not a field line.
    None,
}

/// Classify a line for the builder.
pub fn classify_field_line(line: &str) -> FieldLine {
    let trimmed = line.trim();
    let matches: Vec<_> = RE_FIELD.captures_iter(trimmed).collect();
    if matches.is_empty() {
        return FieldLine::None;
    }

    let leftover = RE_FIELD.replace_all(trimmed, "");
    if leftover.trim().is_empty() {
        let fields: Vec<Field> = matches.iter().filter_map(field_from_captures).collect();
        if fields.len() == matches.len() {
            return FieldLine::Fields(fields);
        }
        return FieldLine::None;
    }

    if matches.len() == 1 {
        let Some(whole) = matches[0].get(0) else {
            return FieldLine::None;
        };
        if whole.end() == trimmed.len() {
            let label = clean_label(&trimmed[..whole.start()]);
            if let Some(field) = field_from_captures(&matches[0]) {
                if !label.is_empty() {
                    return FieldLine::Labelled { label, field };
                }
            }
        }
    }
    FieldLine::None
}

/// Strip list bullets, emphasis and trailing colons from a field label.
fn clean_label(raw: &str) -> String {
    let s = raw.trim();
    let s = s.strip_prefix("- ").or_else(|| s.strip_prefix("* ")).unwrap_or(s);
    let s = s.replace("**", "").replace('*', "");
    s.trim().trim_end_matches(':').trim().to_string()
}

/// `{{TABLE:name}}` on its own line → `Some(name)`.
pub fn table_open(line: &str) -> Option<String> {
    RE_TABLE_OPEN
        .captures(line.trim())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|n| !n.is_empty())
}

pub fn is_table_close(line: &str) -> bool {
    line.trim() == TABLE_CLOSE
}

/// `{{IMAGE:prompt}}` on its own line → `Some(prompt)`.
pub fn image_prompt(line: &str) -> Option<String> {
    RE_IMAGE
        .captures(line.trim())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|p| !p.is_empty())
}
