//! Markdown-with-markers → [`DocumentTree`].
//!
//! A single forward pass over the lines with a small explicit state machine:
//!
//! ```text
//! Default ──pipe row──────────▶ InTable ──non-row line──▶ Default
//! Default ──{{TABLE:name}}────▶ InTableMarker ──{{/TABLE}}──▶ Default
//! Default ──field-only line───▶ InFieldBlock ──other line──▶ Default
//! ```
//!
//! ## What fails and what doesn't
//!
//! Only two inputs are unrecoverable: a `{{TABLE:…}}` block that is never
//! closed and a `{{TABLE:…}}` opened inside another one. In both cases the
//! table boundaries are unknowable and guessing would misplace content.
//! Everything else degrades to text: unknown `{{X:…}}` markers, a stray
//! `{{/TABLE}}`, odd inline syntax. Authoring mistakes stay visible in the
//! rendered document instead of vanishing.
//!
//! ## Ragged rows
//!
//! Table rows are right-padded with empty cells to the widest row. Dropping
//! or truncating rows would shift columns in the rendered grid.

use super::inline::parse_runs;
use super::{plain_text, DocumentNode, DocumentTree};
use crate::error::ParseError;
use crate::markers::{self, Field, FieldLine};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

static RE_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(#{1,6})\s+(.*?)(?:\s+#+)?\s*$").unwrap());

static RE_BULLET: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*[-*+•]\s+(.*)$").unwrap());

static RE_ORDERED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\d{1,3}[.)]\s+(.*)$").unwrap());

static RE_RULE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:-{3,}|\*{3,}|_{3,})$").unwrap());

static RE_SEPARATOR_CELL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^:?-+:?$").unwrap());

/// Parse generated markdown into a document tree.
///
/// # Errors
/// [`ParseError`] for an unterminated or nested `{{TABLE:…}}` block.
pub fn build(markdown: &str) -> Result<DocumentTree, ParseError> {
    let lines: Vec<&str> = markdown.lines().map(|l| l.trim_end_matches('\r')).collect();
    let start = front_matter_end(&lines);

    let mut b = Builder::default();
    for (idx, line) in lines.iter().enumerate().skip(start) {
        b.feed(idx + 1, line)?;
    }
    b.finish()
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Default,
    InTable(Vec<Vec<String>>),
    InTableMarker {
        name: String,
        opened_at: usize,
        rows: Vec<Vec<String>>,
    },
    InFieldBlock,
}

#[derive(Debug, Default)]
struct Builder {
    tree: DocumentTree,
    state: State,
    paragraph: Vec<String>,
}

impl Builder {
    fn feed(&mut self, line_no: usize, line: &str) -> Result<(), ParseError> {
        match std::mem::take(&mut self.state) {
            State::InTableMarker {
                name,
                opened_at,
                mut rows,
            } => {
                if markers::is_table_close(line) {
                    self.push(DocumentNode::TableMarker {
                        name,
                        rows: pad_rows(rows),
                    });
                    return Ok(());
                }
                if let Some(inner) = markers::table_open(line) {
                    return Err(ParseError {
                        line: line_no,
                        reason: format!(
                            "table block '{inner}' opened inside table block '{name}' (line {opened_at})"
                        ),
                    });
                }
                if let Some(row) = marker_row(line) {
                    rows.push(row);
                }
                self.state = State::InTableMarker {
                    name,
                    opened_at,
                    rows,
                };
                Ok(())
            }
            State::InTable(mut rows) => {
                if is_pipe_row(line) {
                    if !is_separator_row(line) {
                        rows.push(split_row(line));
                    }
                    self.state = State::InTable(rows);
                    return Ok(());
                }
                self.push(DocumentNode::Table {
                    rows: pad_rows(rows),
                });
                self.feed_default(line_no, line)
            }
            State::InFieldBlock | State::Default => self.feed_default(line_no, line),
        }
    }

    fn feed_default(&mut self, line_no: usize, line: &str) -> Result<(), ParseError> {
        let trimmed = line.trim();

        if trimmed.is_empty() {
            self.flush_paragraph();
            return Ok(());
        }

        if let Some(name) = markers::table_open(trimmed) {
            self.flush_paragraph();
            self.state = State::InTableMarker {
                name,
                opened_at: line_no,
                rows: Vec::new(),
            };
            return Ok(());
        }

        if let Some(prompt) = markers::image_prompt(trimmed) {
            self.push(DocumentNode::ImagePlaceholder {
                prompt,
                image: None,
            });
            return Ok(());
        }

        match markers::classify_field_line(trimmed) {
            FieldLine::Fields(fields) => {
                self.flush_paragraph();
                for field in fields {
                    self.push_field(field, None);
                }
                self.state = State::InFieldBlock;
                return Ok(());
            }
            FieldLine::Labelled { label, field } => {
                self.flush_paragraph();
                self.push_field(field, Some(label));
                self.state = State::InFieldBlock;
                return Ok(());
            }
            FieldLine::None => {}
        }

        if let Some(caps) = RE_HEADING.captures(trimmed) {
            let level = caps.get(1).map_or(1, |m| m.as_str().len()) as u8;
            let raw = caps.get(2).map_or("", |m| m.as_str());
            self.push(DocumentNode::Heading {
                level,
                text: plain_text(&parse_runs(raw)),
            });
            return Ok(());
        }

        if RE_RULE.is_match(trimmed) {
            self.push(DocumentNode::Rule);
            return Ok(());
        }

        if is_pipe_row(trimmed) {
            self.flush_paragraph();
            let mut rows = Vec::new();
            if !is_separator_row(trimmed) {
                rows.push(split_row(trimmed));
            }
            self.state = State::InTable(rows);
            return Ok(());
        }

        if let Some(caps) = RE_BULLET.captures(line) {
            let text = caps.get(1).map_or("", |m| m.as_str());
            self.push(DocumentNode::ListItem {
                ordered: false,
                runs: parse_runs(text.trim()),
            });
            return Ok(());
        }

        if let Some(caps) = RE_ORDERED.captures(line) {
            let text = caps.get(1).map_or("", |m| m.as_str());
            self.push(DocumentNode::ListItem {
                ordered: true,
                runs: parse_runs(text.trim()),
            });
            return Ok(());
        }

        // Paragraph text, including stray `{{/TABLE}}` and unknown markers.
        self.paragraph.push(trimmed.to_string());
        Ok(())
    }

    fn push_field(&mut self, field: Field, label: Option<String>) {
        if field.is_banner() {
            self.tree.banner.insert(&field.name, &field.value);
            return;
        }
        self.push(DocumentNode::FieldMarker {
            name: field.name,
            value: field.value,
            label: field.label.or(label),
        });
    }

    fn push(&mut self, node: DocumentNode) {
        self.flush_paragraph();
        self.tree.nodes.push(node);
    }

    fn flush_paragraph(&mut self) {
        if self.paragraph.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.paragraph).join(" ");
        self.tree.nodes.push(DocumentNode::Paragraph {
            runs: parse_runs(&text),
        });
    }

    fn finish(mut self) -> Result<DocumentTree, ParseError> {
        match std::mem::take(&mut self.state) {
            State::InTableMarker {
                name, opened_at, ..
            } => {
                return Err(ParseError {
                    line: opened_at,
                    reason: format!("table block '{name}' is never closed with {{{{/TABLE}}}}"),
                });
            }
            State::InTable(rows) => self.push(DocumentNode::Table {
                rows: pad_rows(rows),
            }),
            State::Default | State::InFieldBlock => {}
        }
        self.flush_paragraph();

        if self.tree.banner.title.is_none() {
            if let Some(h) = self.tree.first_heading().map(str::to_string) {
                self.tree.banner.title = Some(h);
            }
        }

        debug!(
            "Built document tree: {} nodes, {} banner fields",
            self.tree.nodes.len(),
            self.tree.banner.fields.len()
        );
        Ok(self.tree)
    }
}

/// Index of the first line after a leading YAML front-matter block, or 0.
fn front_matter_end(lines: &[&str]) -> usize {
    if lines.first().map(|l| l.trim()) != Some("---") {
        return 0;
    }
    for (i, line) in lines.iter().enumerate().skip(1) {
        let t = line.trim();
        if t == "---" {
            return if i > 1 { i + 1 } else { 0 };
        }
        if !t.is_empty() && !t.contains(':') {
            return 0;
        }
    }
    0
}

fn is_pipe_row(line: &str) -> bool {
    let t = line.trim();
    t.len() >= 2 && t.starts_with('|') && t.ends_with('|')
}

fn is_separator_row(line: &str) -> bool {
    let cells = split_row(line);
    !cells.is_empty() && cells.iter().all(|c| RE_SEPARATOR_CELL.is_match(c))
}

fn split_row(line: &str) -> Vec<String> {
    let t = line.trim();
    let t = t.strip_prefix('|').unwrap_or(t);
    let t = t.strip_suffix('|').unwrap_or(t);
    t.split('|').map(|c| c.trim().to_string()).collect()
}

/// A row line inside a `{{TABLE:…}}` block; blank and separator lines yield None.
fn marker_row(line: &str) -> Option<Vec<String>> {
    let t = line.trim();
    if t.is_empty() || (t.starts_with('|') && is_separator_row(t)) {
        return None;
    }
    Some(split_row(t))
}

/// Right-pad every row with empty cells to the widest row.
fn pad_rows(mut rows: Vec<Vec<String>>) -> Vec<Vec<String>> {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    for row in &mut rows {
        row.resize(width, String::new());
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::TextRun;

    fn para_text(node: &DocumentNode) -> Option<String> {
        match node {
            DocumentNode::Paragraph { runs } => Some(plain_text(runs)),
            _ => None,
        }
    }

    #[test]
    fn headings_with_levels() {
        let t = build("# Titre\n## Objectifs\n### Introduction (5 min)").unwrap();
        assert_eq!(
            t.nodes,
            vec![
                DocumentNode::Heading {
                    level: 1,
                    text: "Titre".into()
                },
                DocumentNode::Heading {
                    level: 2,
                    text: "Objectifs".into()
                },
                DocumentNode::Heading {
                    level: 3,
                    text: "Introduction (5 min)".into()
                },
            ]
        );
    }

    #[test]
    fn ragged_table_marker_is_padded() {
        let t = build("{{TABLE:t}}\n| a | b |\n| c |\n{{/TABLE}}").unwrap();
        assert_eq!(
            t.nodes,
            vec![DocumentNode::TableMarker {
                name: "t".into(),
                rows: vec![
                    vec!["a".to_string(), "b".to_string()],
                    vec!["c".to_string(), String::new()],
                ],
            }]
        );
    }

    #[test]
    fn table_marker_drops_separator_rows() {
        let t = build("{{TABLE:t}}\n| État | Exemple |\n|---|:---:|\n| Solide | Glace |\n{{/TABLE}}").unwrap();
        match &t.nodes[0] {
            DocumentNode::TableMarker { rows, .. } => assert_eq!(rows.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn pipe_table_is_padded_and_closed_by_text() {
        let t = build("| x | y | z |\n|---|---|---|\n| 1 |\nAprès le tableau").unwrap();
        assert_eq!(
            t.nodes[0],
            DocumentNode::Table {
                rows: vec![
                    vec!["x".into(), "y".into(), "z".into()],
                    vec!["1".into(), String::new(), String::new()],
                ]
            }
        );
        assert_eq!(para_text(&t.nodes[1]).as_deref(), Some("Après le tableau"));
    }

    #[test]
    fn unknown_marker_kept_verbatim() {
        let t = build("{{CUSTOM:x}}").unwrap();
        assert_eq!(para_text(&t.nodes[0]).as_deref(), Some("{{CUSTOM:x}}"));
    }

    #[test]
    fn unknown_marker_with_asterisks_kept_verbatim() {
        let t = build("{{CUSTOM:a*b*c}}").unwrap();
        assert_eq!(para_text(&t.nodes[0]).as_deref(), Some("{{CUSTOM:a*b*c}}"));
        match &t.nodes[0] {
            DocumentNode::Paragraph { runs } => assert!(runs.iter().all(|r| !r.bold && !r.italic)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn stray_table_close_is_text() {
        let t = build("Texte\n{{/TABLE}}").unwrap();
        assert_eq!(para_text(&t.nodes[0]).as_deref(), Some("Texte {{/TABLE}}"));
    }

    #[test]
    fn banner_fields_are_not_body_nodes() {
        let t = build("{{FIELD:title=Water Cycle}}{{FIELD:duration=45min}}\n\nLe texte.").unwrap();
        assert_eq!(t.banner.title.as_deref(), Some("Water Cycle"));
        assert_eq!(t.banner.duration.as_deref(), Some("45min"));
        assert_eq!(t.nodes.len(), 1);
        assert_eq!(para_text(&t.nodes[0]).as_deref(), Some("Le texte."));
    }

    #[test]
    fn non_banner_fields_become_nodes() {
        let t = build("**Nom :** {{FIELD:nom=}}\n{{FIELD:date=|label=Date}}").unwrap();
        assert_eq!(
            t.nodes,
            vec![
                DocumentNode::FieldMarker {
                    name: "nom".into(),
                    value: String::new(),
                    label: Some("Nom".into()),
                },
                DocumentNode::FieldMarker {
                    name: "date".into(),
                    value: String::new(),
                    label: Some("Date".into()),
                },
            ]
        );
    }

    #[test]
    fn unterminated_table_block_fails_at_opening_line() {
        let err = build("intro\n\n{{TABLE:notes}}\n| a |").unwrap_err();
        assert_eq!(err.line, 3);
        assert!(err.reason.contains("notes"));
    }

    #[test]
    fn nested_table_block_fails() {
        let err = build("{{TABLE:a}}\n{{TABLE:b}}\n{{/TABLE}}").unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn image_marker_creates_placeholder() {
        let t = build("Observe :\n{{IMAGE:schéma du cycle de l'eau}}").unwrap();
        assert_eq!(
            t.nodes[1],
            DocumentNode::ImagePlaceholder {
                prompt: "schéma du cycle de l'eau".into(),
                image: None
            }
        );
    }

    #[test]
    fn lists_and_rules() {
        let t = build("- Identifier\n1. Observer\n---\n* Décrire").unwrap();
        let kinds: Vec<_> = t.nodes.iter().map(DocumentNode::kind).collect();
        assert_eq!(kinds, vec!["list_item", "list_item", "rule", "list_item"]);
        assert!(matches!(t.nodes[1], DocumentNode::ListItem { ordered: true, .. }));
    }

    #[test]
    fn emphasis_stays_inside_paragraph_runs() {
        let t = build("Je **note** les *réponses*").unwrap();
        assert_eq!(t.nodes.len(), 1);
        match &t.nodes[0] {
            DocumentNode::Paragraph { runs } => {
                assert_eq!(runs.len(), 4);
                assert_eq!(
                    runs[1],
                    TextRun {
                        text: "note".into(),
                        bold: true,
                        italic: false
                    }
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn consecutive_lines_join_into_one_paragraph() {
        let t = build("ligne un\nligne deux\n\nautre").unwrap();
        assert_eq!(t.nodes.len(), 2);
        assert_eq!(para_text(&t.nodes[0]).as_deref(), Some("ligne un ligne deux"));
    }

    #[test]
    fn front_matter_is_skipped() {
        let t = build("---\nauthor: x\n---\n# Titre").unwrap();
        assert_eq!(t.nodes.len(), 1);
    }

    #[test]
    fn leading_rule_is_not_front_matter() {
        let t = build("---\nTexte libre\n---").unwrap();
        assert_eq!(t.nodes[0], DocumentNode::Rule);
    }

    #[test]
    fn title_falls_back_to_first_heading() {
        let t = build("# Les fractions\ntexte").unwrap();
        assert_eq!(t.banner.title.as_deref(), Some("Les fractions"));
    }
}
