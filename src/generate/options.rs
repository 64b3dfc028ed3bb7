//! Per-kind request options: difficulty, evaluated topics, question types,
//! quiz size and format.
//!
//! Options only shape the prompt. They are rendered into the `{options}`
//! placeholder by [`options_block`]; a lesson plan ignores them.

use crate::config::DocumentKind;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Target difficulty of an evaluation or quiz.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    /// Matches the class level.
    #[default]
    Adapted,
    Easy,
    Medium,
    Hard,
    /// Easy first, harder at the end.
    Mixed,
}

impl Difficulty {
    pub fn describe(self, class_level: &str) -> String {
        match self {
            Self::Adapted => format!("adaptée au niveau {}", class_level.trim()),
            Self::Easy => "facile : questions de compréhension de base".to_string(),
            Self::Medium => "moyenne : compréhension et application".to_string(),
            Self::Hard => "difficile : analyse et réflexion".to_string(),
            Self::Mixed => "progressive : du plus simple au plus exigeant".to_string(),
        }
    }
}

/// Quiz size presets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuizType {
    Mini,
    QuickCheck,
    #[default]
    Standard,
    Comprehensive,
}

impl QuizType {
    pub fn question_count(self) -> u32 {
        match self {
            Self::Mini => 3,
            Self::QuickCheck => 5,
            Self::Standard => 10,
            Self::Comprehensive => 15,
        }
    }
}

/// Question format of a quiz.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuizFormat {
    #[default]
    Mixed,
    MultipleChoice,
    ShortAnswer,
    TrueFalse,
    FillInBlanks,
}

impl QuizFormat {
    pub fn instructions(self) -> &'static str {
        match self {
            Self::Mixed => "mélange de QCM (4 options) et de questions à réponse courte",
            Self::MultipleChoice => "uniquement des QCM avec 4 options (A, B, C, D)",
            Self::ShortAnswer => "uniquement des questions à réponse courte (1 à 2 phrases)",
            Self::TrueFalse => "questions Vrai/Faux et QCM",
            Self::FillInBlanks => "texte à trous avec des espaces ____ à compléter",
        }
    }
}

/// Options that refine an evaluation or a quiz.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentOptions {
    pub difficulty: Difficulty,
    /// Evaluation: topics covered besides the main one.
    pub extra_topics: Vec<String>,
    /// Evaluation: requested exercise formats, free text ("QCM", "relier"…).
    pub question_types: Vec<String>,
    pub quiz_type: QuizType,
    pub quiz_format: QuizFormat,
    /// Quiz: append an answer key.
    pub include_answers: bool,
}

impl Default for DocumentOptions {
    fn default() -> Self {
        Self {
            difficulty: Difficulty::default(),
            extra_topics: Vec::new(),
            question_types: Vec::new(),
            quiz_type: QuizType::default(),
            quiz_format: QuizFormat::default(),
            include_answers: true,
        }
    }
}

impl DocumentOptions {
    /// Main topic followed by the non-blank extra topics, without repeats.
    pub fn topics<'a>(&'a self, main: &'a str) -> Vec<&'a str> {
        let mut out = vec![main.trim()];
        for t in self.extra_topics.iter().map(|t| t.trim()) {
            if !t.is_empty() && !out.iter().any(|o| o.eq_ignore_ascii_case(t)) {
                out.push(t);
            }
        }
        out
    }
}

/// Text for the `{options}` placeholder.
pub fn options_block(kind: DocumentKind, options: &DocumentOptions, topic: &str, class_level: &str) -> String {
    let mut out = String::new();
    match kind {
        DocumentKind::Fiche => return out,
        DocumentKind::Evaluation => {
            out.push_str("PARAMÈTRES DE L'ÉVALUATION :\n");
            let _ = writeln!(out, "- Sujets évalués : {}", options.topics(topic).join(", "));
            let types: Vec<&str> = options
                .question_types
                .iter()
                .map(|t| t.trim())
                .filter(|t| !t.is_empty())
                .collect();
            if !types.is_empty() {
                let _ = writeln!(out, "- Types de questions : {}", types.join(", "));
            }
            let _ = writeln!(out, "- Difficulté : {}", options.difficulty.describe(class_level));
        }
        DocumentKind::Quiz => {
            let count = options.quiz_type.question_count();
            out.push_str("PARAMÈTRES DU QUIZ :\n");
            let _ = writeln!(out, "- Nombre de questions : {count} (numérotées de 1 à {count})");
            let _ = writeln!(out, "- Format : {}", options.quiz_format.instructions());
            let _ = writeln!(out, "- Difficulté : {}", options.difficulty.describe(class_level));
            if options.include_answers {
                out.push_str("- Corrigé : termine par une section « ## Corrigé » avec toutes les réponses.\n");
            } else {
                out.push_str("- Corrigé : n'inclus aucune réponse.\n");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fiche_has_no_options() {
        assert!(options_block(DocumentKind::Fiche, &DocumentOptions::default(), "x", "CM1").is_empty());
    }

    #[test]
    fn evaluation_lists_topics_types_and_difficulty() {
        let options = DocumentOptions {
            extra_topics: vec!["Les fractions décimales".into(), " ".into(), "les fractions".into()],
            question_types: vec!["QCM".into(), "Relier".into()],
            difficulty: Difficulty::Hard,
            ..Default::default()
        };
        let block = options_block(DocumentKind::Evaluation, &options, "Les fractions", "CM2");
        assert!(block.contains("Sujets évalués : Les fractions, Les fractions décimales\n"), "got: {block}");
        assert!(block.contains("Types de questions : QCM, Relier"));
        assert!(block.contains("Difficulté : difficile"));
    }

    #[test]
    fn quiz_count_follows_type() {
        let options = DocumentOptions {
            quiz_type: QuizType::QuickCheck,
            quiz_format: QuizFormat::FillInBlanks,
            include_answers: false,
            ..Default::default()
        };
        let block = options_block(DocumentKind::Quiz, &options, "Les volcans", "CE2");
        assert!(block.contains("Nombre de questions : 5"));
        assert!(block.contains("texte à trous"));
        assert!(block.contains("n'inclus aucune réponse"));
        assert!(block.contains("adaptée au niveau CE2"));
    }

    #[test]
    fn quiz_sizes() {
        let counts: Vec<u32> = [QuizType::Mini, QuizType::QuickCheck, QuizType::Standard, QuizType::Comprehensive]
            .iter()
            .map(|t| t.question_count())
            .collect();
        assert_eq!(counts, vec![3, 5, 10, 15]);
    }
}
