//! Prompt templates for lesson-document generation.
//!
//! Every default prompt lives here as a `const` so a template change touches
//! exactly one place and unit tests can inspect the text directly. Callers
//! override any of them through [`PromptTemplates`] in
//! [`crate::config::PipelineConfig::prompts`]; nothing in this module is
//! mutable at runtime.
//!
//! ## Placeholders
//!
//! Templates are plain strings with `{name}` placeholders filled by
//! [`render_template`]:
//!
//! | Placeholder       | Value                                                |
//! |-------------------|------------------------------------------------------|
//! | `{topic}`         | lesson topic as typed by the user                    |
//! | `{class_level}`   | class level (`CP`, `CE2`, `6e`, …)                   |
//! | `{subject}`       | subject, or a hint to infer it                       |
//! | `{duration}`      | session length in minutes                            |
//! | `{excerpts}`      | guide excerpts selected for the topic                |
//! | `{structure}`     | required markers and sections for the document kind  |
//! | `{instructions}`  | user's special instructions block (may be empty)     |
//! | `{options}`       | evaluation or quiz parameters (empty for a fiche)    |
//!
//! Unknown placeholders are left untouched so a typo in a custom template is
//! visible in the prompt instead of silently disappearing.

use crate::config::DocumentKind;
use serde::{Deserialize, Serialize};

/// System message sent before every generation prompt.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"Tu es un assistant expert pour les enseignants du primaire et du collège. Tu rédiges des documents pédagogiques en français, clairs, bienveillants et directement utilisables en classe.

Tu réponds UNIQUEMENT en Markdown, sans bloc de code englobant, sans texte avant ou après le document."#;

/// Rules describing the marker syntax the document builder understands.
///
/// Appended to the `{structure}` block of every template.
pub const MARKER_RULES: &str = r#"SYNTAXE DES MARQUEURS (à respecter au caractère près) :
- Métadonnée ou champ à remplir, seul sur sa ligne : {{FIELD:nom=valeur}}
  Exemple : {{FIELD:title=Le cycle de l'eau}}
  Un champ laissé vide s'écrit {{FIELD:nom=}} ; on peut préciser un libellé : {{FIELD:nom=|label=Nom de l'élève}}
- Tableau structuré :
  {{TABLE:nom}}
  | colonne 1 | colonne 2 |
  | valeur | valeur |
  {{/TABLE}}
- Illustration souhaitée, seule sur sa ligne : {{IMAGE:description précise du schéma}}
- N'invente aucun autre marqueur."#;

/// Lesson-plan template.
pub const FICHE_TEMPLATE: &str = r#"MISSION :
Crée une fiche pédagogique complète et bien structurée pour la leçon "{topic}" pour la classe de {class_level}.
Matière : {subject}

MATÉRIEL SOURCE (extraits du guide pédagogique) :
---
{excerpts}
---

STRUCTURE À RESPECTER SCRUPULEUSEMENT :
---
{structure}
---
{instructions}
CONSIGNES :
1. Commence par les marqueurs de métadonnées, puis le plan de la séance.
2. Base-toi sur le MATÉRIEL SOURCE et reste fidèle au programme.
3. Rédige à la voix de l'enseignant, avec des phrases courtes et actionnables.
4. Calibre les phases pour une séance d'environ {duration} minutes, en commençant par une mise en route orale.
5. Termine par une conclusion de 3 à 5 lignes prête à être recopiée dans le cahier."#;

/// Evaluation template.
pub const EVALUATION_TEMPLATE: &str = r#"Tu es un expert en pédagogie spécialisé dans l'évaluation scolaire.

MISSION :
Crée une évaluation écrite sur "{topic}" pour la classe de {class_level}.
Matière : {subject}
Durée : {duration} minutes

CONTENU DE RÉFÉRENCE :
---
{excerpts}
---

STRUCTURE À RESPECTER :
---
{structure}
---
{options}{instructions}
CONSIGNES :
1. Propose 3 à 5 exercices progressifs, chacun sous un titre « ## Exercice N : … ».
2. Respecte les types de questions demandés ; à défaut, varie les formats : questions à trous (____), tableaux à compléter, vrai/faux, relier.
3. Ajoute les champs élève (nom, prénom, date) avec des marqueurs vides.
4. Les tableaux à compléter utilisent un bloc {{TABLE:…}} avec des cellules ____.
5. Le vocabulaire doit être adapté au niveau {class_level}."#;

/// Quiz template.
pub const QUIZ_TEMPLATE: &str = r#"Tu es un enseignant expérimenté. Crée un quiz pédagogique pour une classe de {class_level} sur le thème "{topic}".
Matière : {subject}

CONTENU DE RÉFÉRENCE :
---
{excerpts}
---

STRUCTURE À RESPECTER :
---
{structure}
---
{options}{instructions}
CONSIGNES :
1. Rédige les questions numérotées sous une section « ## Questions », en respectant le nombre et le format demandés.
2. Pour les QCM, utilise A, B, C, D avec une seule bonne réponse et des distracteurs plausibles.
3. Le quiz doit pouvoir être réalisé en {duration} minutes."#;

/// Wrapper applied to each `{{IMAGE:…}}` prompt before it reaches the image model.
pub const ILLUSTRATION_TEMPLATE: &str = r#"Illustration pédagogique pour une classe de {class_level}.
Style : {style}. {complexity}
Fond blanc, aucun texte dans l'image sauf des étiquettes très courtes.
Sujet : {prompt}"#;

/// Per-deployment overrides for every generation prompt.
///
/// `Default` yields the built-in constants above.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplates {
    pub system: String,
    pub fiche: String,
    pub evaluation: String,
    pub quiz: String,
    pub illustration: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            system: DEFAULT_SYSTEM_PROMPT.to_string(),
            fiche: FICHE_TEMPLATE.to_string(),
            evaluation: EVALUATION_TEMPLATE.to_string(),
            quiz: QUIZ_TEMPLATE.to_string(),
            illustration: ILLUSTRATION_TEMPLATE.to_string(),
        }
    }
}

impl PromptTemplates {
    /// Body template for a document kind.
    pub fn for_kind(&self, kind: DocumentKind) -> &str {
        match kind {
            DocumentKind::Fiche => &self.fiche,
            DocumentKind::Evaluation => &self.evaluation,
            DocumentKind::Quiz => &self.quiz,
        }
    }
}

/// Substitute `{name}` placeholders in `template`.
///
/// Single pass: a value containing `{topic}` is not expanded again.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len() + 256);
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let substituted = after.find('}').and_then(|close| {
            let name = &after[..close];
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| (*v, close))
        });
        match substituted {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Drawing style used for a class level.
///
/// Younger classes (CP, CE1) get colouring-book line art; everyone else gets
/// labelled diagrams.
pub fn illustration_style(class_level: &str) -> &'static str {
    match class_level.trim().to_lowercase().as_str() {
        "cp" | "ce1" => "coloriage, traits noirs épais, formes simples",
        _ => "schéma éducatif légendé, couleurs douces",
    }
}

fn illustration_complexity(class_level: &str) -> &'static str {
    match class_level.trim().to_lowercase().as_str() {
        "cp" | "ce1" => "Très peu d'éléments, grands et bien séparés.",
        "ce2" | "cm1" => "Complexité modérée, 3 à 5 éléments identifiables.",
        _ => "Niveau de détail adapté à des élèves plus âgés.",
    }
}

/// Derive the image-model prompt for one placeholder.
pub fn illustration_prompt(template: &str, class_level: &str, prompt: &str) -> String {
    render_template(
        template,
        &[
            ("class_level", class_level),
            ("style", illustration_style(class_level)),
            ("complexity", illustration_complexity(class_level)),
            ("prompt", prompt.trim()),
        ],
    )
}

/// Block inserted for `{instructions}` when the user typed special instructions.
pub fn instructions_block(special: Option<&str>) -> String {
    match special.map(str::trim) {
        Some(s) if !s.is_empty() => format!("\nINSTRUCTIONS SPÉCIALES :\n---\n{s}\n---\n"),
        _ => String::new(),
    }
}
