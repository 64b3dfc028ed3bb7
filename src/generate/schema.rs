//! Expected output structure per document kind.
//!
//! The same [`OutputSchema`] drives both sides of the contract: it is
//! rendered into the prompt's `{structure}` block, and model output is
//! checked against it. A response missing a required field or section is a
//! failed attempt and triggers the fallback model.

use crate::config::DocumentKind;
use crate::markers;
use crate::prompts::MARKER_RULES;
use std::fmt::Write;

/// Required metadata fields and section headings for one document kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSchema {
    pub kind: DocumentKind,
    /// `{{FIELD:name=value}}` markers that must be present with a value.
    pub required_fields: &'static [&'static str],
    /// Heading texts (case-insensitive substring) that must appear.
    pub required_sections: &'static [&'static str],
}

impl OutputSchema {
    pub fn for_kind(kind: DocumentKind) -> Self {
        match kind {
            DocumentKind::Fiche => Self {
                kind,
                required_fields: &["title", "class", "duration"],
                required_sections: &["Objectifs", "Déroulement"],
            },
            DocumentKind::Evaluation => Self {
                kind,
                required_fields: &["title", "class", "duration"],
                required_sections: &["Exercice"],
            },
            DocumentKind::Quiz => Self {
                kind,
                required_fields: &["title", "class"],
                required_sections: &["Questions"],
            },
        }
    }

    /// Check `markdown`; on failure, a human-readable list of what is missing.
    pub fn check(&self, markdown: &str) -> Result<(), String> {
        let fields = markers::scan_fields(markdown);
        let headings: Vec<String> = markdown
            .lines()
            .map(str::trim_start)
            .filter(|l| l.starts_with('#'))
            .map(|l| l.trim_start_matches('#').trim().to_lowercase())
            .collect();

        let mut missing = Vec::new();
        for name in self.required_fields {
            let present = fields
                .iter()
                .any(|f| f.name == *name && !f.value.trim().is_empty());
            if !present {
                missing.push(format!("field '{name}'"));
            }
        }
        for section in self.required_sections {
            let needle = section.to_lowercase();
            if !headings.iter().any(|h| h.contains(&needle)) {
                missing.push(format!("section '{section}'"));
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing {}", missing.join(", ")))
        }
    }

    /// The `{structure}` block given to the model.
    pub fn describe(&self, class_level: &str, duration_minutes: u32) -> String {
        let mut out = String::from("MARQUEURS OBLIGATOIRES (en tête du document, un par ligne) :\n");
        for name in self.required_fields {
            let example = match *name {
                "title" => "titre de la leçon".to_string(),
                "class" => class_level.to_string(),
                "duration" => format!("{duration_minutes} min"),
                _ => "…".to_string(),
            };
            let _ = writeln!(out, "{{{{FIELD:{name}={example}}}}}");
        }
        out.push_str("{{FIELD:subject=matière}}\n\n");

        out.push_str("SECTIONS OBLIGATOIRES (titres Markdown) :\n");
        for section in self.required_sections {
            let _ = writeln!(out, "## {section}…");
        }
        if let Some(skeleton) = skeleton(self.kind) {
            out.push('\n');
            out.push_str(skeleton);
            out.push('\n');
        }

        out.push('\n');
        out.push_str(MARKER_RULES);
        out
    }
}

fn skeleton(kind: DocumentKind) -> Option<&'static str> {
    match kind {
        DocumentKind::Fiche => Some(
            "PLAN TYPE :\n\
## Objectifs\n- Identifier …\n- Décrire …\n\n\
## Déroulement de la séance\n\
### Introduction (5-10 min)\n### Activité de découverte (15-20 min)\n### Synthèse et structuration (10-15 min)\n\n\
## Évaluation\n\n## Conclusion à recopier",
        ),
        DocumentKind::Evaluation => Some(
            "PLAN TYPE :\n{{FIELD:nom=|label=Nom}}\n{{FIELD:prenom=|label=Prénom}}\n{{FIELD:date=|label=Date}}\n\n\
## Exercice 1 : …\n## Exercice 2 : …",
        ),
        DocumentKind::Quiz => None,
    }
}
