//! Renderer-agnostic document tree.
//!
//! The builder turns generated markdown into a [`DocumentTree`]; renderers
//! only ever see the tree. Keeping this layer explicit means a PDF renderer
//! and a DOCX renderer cannot disagree about where a table ends or which
//! field is the title.
//!
//! ## Immutability
//!
//! A tree is never restructured after [`builder::build`] returns. The only
//! later write is [`DocumentTree::resolve_image`], which fills in the bytes of
//! an existing `ImagePlaceholder` and leaves node order untouched.

pub mod builder;
pub mod inline;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use builder::build;

/// A run of text sharing one style.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRun {
    pub text: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bold: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub italic: bool,
}

impl TextRun {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            bold: false,
            italic: false,
        }
    }
}

/// Concatenate run text, dropping styles.
pub fn plain_text(runs: &[TextRun]) -> String {
    runs.iter().map(|r| r.text.as_str()).collect()
}

/// One structural element of a lesson document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DocumentNode {
    Heading {
        /// 1-based nesting level.
        level: u8,
        text: String,
    },
    Paragraph {
        runs: Vec<TextRun>,
    },
    ListItem {
        ordered: bool,
        runs: Vec<TextRun>,
    },
    /// `---` thematic break.
    Rule,
    /// Plain pipe table; every row has the same column count.
    Table {
        rows: Vec<Vec<String>>,
    },
    /// A `{{FIELD:name=value}}` that is not part of the metadata banner,
    /// typically a blank the student fills in.
    FieldMarker {
        name: String,
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    /// A `{{TABLE:name}}` block; every row has the same column count.
    TableMarker {
        name: String,
        rows: Vec<Vec<String>>,
    },
    ImagePlaceholder {
        prompt: String,
        /// Encoded image (PNG/JPEG) once resolved.
        #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes")]
        image: Option<Vec<u8>>,
    },
}

impl DocumentNode {
    /// Short variant name for logs and tests.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Heading { .. } => "heading",
            Self::Paragraph { .. } => "paragraph",
            Self::ListItem { .. } => "list_item",
            Self::Rule => "rule",
            Self::Table { .. } => "table",
            Self::FieldMarker { .. } => "field_marker",
            Self::TableMarker { .. } => "table_marker",
            Self::ImagePlaceholder { .. } => "image_placeholder",
        }
    }
}

/// Metadata shown above the body: title, class, duration and friends.
///
/// Also carried by [`crate::generate::GenerationResult`], where it is
/// extracted from the raw markdown before the tree exists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataBanner {
    pub title: Option<String>,
    pub class_level: Option<String>,
    pub duration: Option<String>,
    /// Every declared field by name, banner keys included.
    pub fields: BTreeMap<String, String>,
}

impl MetadataBanner {
    /// Record one field; banner keys also fill the typed slots.
    ///
    /// The first non-empty value for a name wins.
    pub fn insert(&mut self, name: &str, value: &str) {
        let slot = match name {
            "title" => Some(&mut self.title),
            "class" => Some(&mut self.class_level),
            "duration" => Some(&mut self.duration),
            _ => None,
        };
        if let Some(slot) = slot {
            if slot.is_none() && !value.is_empty() {
                *slot = Some(value.to_string());
            }
        }
        let entry = self.fields.entry(name.to_string()).or_default();
        if entry.is_empty() {
            *entry = value.to_string();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Ordered nodes plus the metadata banner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentTree {
    pub banner: MetadataBanner,
    pub nodes: Vec<DocumentNode>,
}

impl DocumentTree {
    /// Indices and prompts of every unresolved image placeholder.
    pub fn pending_images(&self) -> Vec<(usize, String)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| match n {
                DocumentNode::ImagePlaceholder {
                    prompt,
                    image: None,
                } => Some((i, prompt.clone())),
                _ => None,
            })
            .collect()
    }

    /// Attach image bytes to the placeholder at `index`.
    ///
    /// Returns false (and changes nothing) if `index` is not a placeholder.
    pub fn resolve_image(&mut self, index: usize, bytes: Vec<u8>) -> bool {
        match self.nodes.get_mut(index) {
            Some(DocumentNode::ImagePlaceholder { image, .. }) => {
                *image = Some(bytes);
                true
            }
            _ => false,
        }
    }

    /// The first heading text, used when no title field was declared.
    pub fn first_heading(&self) -> Option<&str> {
        self.nodes.iter().find_map(|n| match n {
            DocumentNode::Heading { text, .. } => Some(text.as_str()),
            _ => None,
        })
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|e| STANDARD.decode(e).map_err(serde::de::Error::custom))
            .transpose()
    }
}
