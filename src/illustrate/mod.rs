//! Optional illustration of `{{IMAGE:…}}` placeholders.
//!
//! Every failure here is absorbed. A placeholder whose request fails (quota,
//! refused prompt, timeout, garbage bytes) simply stays unresolved and is
//! rendered as a caption; the document itself is never at risk.
//!
//! ## Concurrency
//!
//! Placeholders are independent, so they are requested with bounded
//! concurrency via `buffer_unordered`, the same pattern the page pipeline
//! used for VLM calls. Results are written back by node index, so the tree's
//! order is unaffected by completion order.

pub mod gemini;

use crate::config::{ModelPair, PipelineConfig};
use crate::document::DocumentTree;
use crate::error::IllustrationError;
use crate::progress::CancelFlag;
use crate::prompts::illustration_prompt;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use gemini::GeminiImageModel;

/// Produces image bytes for a prompt with a given model.
#[async_trait]
pub trait ImageModel: Send + Sync {
    async fn generate_image(&self, prompt: &str, model: &str) -> Result<Vec<u8>, IllustrationError>;
}

/// Resolves image placeholders in a [`DocumentTree`].
#[derive(Clone)]
pub struct Illustrator {
    model: Arc<dyn ImageModel>,
    models: ModelPair,
    template: String,
    concurrency: usize,
    call_timeout: Duration,
}

impl std::fmt::Debug for Illustrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Illustrator")
            .field("models", &self.models)
            .field("concurrency", &self.concurrency)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl Illustrator {
    pub fn new(
        model: Arc<dyn ImageModel>,
        models: ModelPair,
        template: impl Into<String>,
        concurrency: usize,
        call_timeout: Duration,
    ) -> Self {
        Self {
            model,
            models,
            template: template.into(),
            concurrency: concurrency.max(1),
            call_timeout,
        }
    }

    pub fn from_config(config: &PipelineConfig, model: Arc<dyn ImageModel>) -> Self {
        Self::new(
            model,
            config.image_models.clone(),
            config.prompts.illustration.clone(),
            config.illustration_concurrency,
            Duration::from_secs(config.api_timeout_secs),
        )
    }

    /// Return `tree` with as many placeholders resolved as possible.
    ///
    /// Node order and every non-image node are untouched.
    pub async fn illustrate(
        &self,
        mut tree: DocumentTree,
        class_level: &str,
        cancel: &CancelFlag,
    ) -> DocumentTree {
        let pending = tree.pending_images();
        if pending.is_empty() {
            return tree;
        }
        info!("Illustrating {} placeholder(s)", pending.len());

        let results: Vec<(usize, Result<Vec<u8>, IllustrationError>)> = stream::iter(pending)
            .map(|(index, prompt)| async move {
                let prompt = illustration_prompt(&self.template, class_level, &prompt);
                (index, self.resolve_one(&prompt, cancel).await)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        if cancel.is_cancelled() {
            return tree;
        }

        let mut resolved = 0usize;
        for (index, result) in results {
            match result {
                Ok(bytes) => {
                    if tree.resolve_image(index, bytes) {
                        resolved += 1;
                    }
                }
                Err(IllustrationError::Cancelled) => {}
                Err(e) => warn!("Illustration for node {} left unresolved: {}", index, e),
            }
        }
        info!("Resolved {} illustration(s)", resolved);
        tree
    }

    /// Primary model, then one try on the fallback if configured.
    async fn resolve_one(&self, prompt: &str, cancel: &CancelFlag) -> Result<Vec<u8>, IllustrationError> {
        let primary = self.attempt(&self.models.primary, prompt, cancel).await;
        let err = match primary {
            Ok(bytes) => return Ok(bytes),
            Err(IllustrationError::Cancelled) => return Err(IllustrationError::Cancelled),
            Err(e) => e,
        };
        match self.models.fallback.as_deref() {
            Some(fallback) => {
                debug!("Image model {} failed ({}), trying {}", self.models.primary, err, fallback);
                self.attempt(fallback, prompt, cancel).await
            }
            None => Err(err),
        }
    }

    async fn attempt(&self, model: &str, prompt: &str, cancel: &CancelFlag) -> Result<Vec<u8>, IllustrationError> {
        if cancel.is_cancelled() {
            return Err(IllustrationError::Cancelled);
        }
        let bytes = tokio::time::timeout(self.call_timeout, self.model.generate_image(prompt, model))
            .await
            .map_err(|_| IllustrationError::Timeout {
                secs: self.call_timeout.as_secs(),
            })??;
        if cancel.is_cancelled() {
            return Err(IllustrationError::Cancelled);
        }
        validate_image(&bytes)?;
        Ok(bytes)
    }
}

/// Reject bytes that are not a recognisable image.
fn validate_image(bytes: &[u8]) -> Result<(), IllustrationError> {
    image::guess_format(bytes)
        .map(|_| ())
        .map_err(|e| IllustrationError::Unsupported(format!("returned bytes are not an image: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentNode, TextRun};
    use std::sync::Mutex;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    /// Answers per model name; records every (model, prompt).
    struct FakeImages {
        ok_models: Vec<&'static str>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl FakeImages {
        fn new(ok_models: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                ok_models,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ImageModel for FakeImages {
        async fn generate_image(&self, prompt: &str, model: &str) -> Result<Vec<u8>, IllustrationError> {
            self.calls
                .lock()
                .unwrap()
                .push((model.to_string(), prompt.to_string()));
            if self.ok_models.contains(&model) {
                Ok(PNG_MAGIC.to_vec())
            } else {
                Err(IllustrationError::Quota { model: model.into() })
            }
        }
    }

    fn tree() -> DocumentTree {
        DocumentTree {
            banner: Default::default(),
            nodes: vec![
                DocumentNode::Heading {
                    level: 2,
                    text: "Le cycle de l'eau".into(),
                },
                DocumentNode::ImagePlaceholder {
                    prompt: "évaporation".into(),
                    image: None,
                },
                DocumentNode::Paragraph {
                    runs: vec![TextRun::plain("Texte")],
                },
                DocumentNode::ImagePlaceholder {
                    prompt: "nuages".into(),
                    image: None,
                },
            ],
        }
    }

    fn illustrator(model: Arc<FakeImages>, fallback: Option<&str>) -> Illustrator {
        Illustrator::new(
            model,
            ModelPair::new("img-primary", fallback),
            crate::prompts::ILLUSTRATION_TEMPLATE,
            2,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn resolves_every_placeholder_in_place() {
        let model = FakeImages::new(vec!["img-primary"]);
        let out = illustrator(model.clone(), None)
            .illustrate(tree(), "CP", &CancelFlag::new())
            .await;
        assert_eq!(out.nodes.len(), 4);
        assert!(out.pending_images().is_empty());
        assert_eq!(out.nodes[0], tree().nodes[0]);
        let calls = model.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|(_, p)| p.contains("coloriage")));
    }

    #[tokio::test]
    async fn all_failures_leave_structure_intact() {
        let model = FakeImages::new(vec![]);
        let out = illustrator(model, None)
            .illustrate(tree(), "CM2", &CancelFlag::new())
            .await;
        assert_eq!(out, tree());
    }

    #[tokio::test]
    async fn fallback_model_gets_one_try() {
        let model = FakeImages::new(vec!["img-fallback"]);
        let out = illustrator(model.clone(), Some("img-fallback"))
            .illustrate(tree(), "CM1", &CancelFlag::new())
            .await;
        assert!(out.pending_images().is_empty());
        assert_eq!(model.calls.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn cancelled_flag_prevents_calls() {
        let model = FakeImages::new(vec!["img-primary"]);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let out = illustrator(model.clone(), None)
            .illustrate(tree(), "CM1", &cancel)
            .await;
        assert_eq!(out.pending_images().len(), 2);
        assert!(model.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn non_image_bytes_rejected() {
        assert!(validate_image(b"<html>quota</html>").is_err());
        assert!(validate_image(PNG_MAGIC).is_ok());
    }
}
