//! Gemini image generation over the REST `generateContent` endpoint.
//!
//! edgequake-llm covers chat completion but not image output, so this goes
//! straight to the HTTP API with reqwest.

use super::ImageModel;
use crate::error::IllustrationError;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";

/// [`ImageModel`] that calls the Gemini API.
#[derive(Clone)]
pub struct GeminiImageModel {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    timeout_secs: u64,
}

impl std::fmt::Debug for GeminiImageModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiImageModel")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl GeminiImageModel {
    pub fn new(api_key: impl Into<String>, timeout_secs: u64) -> Result<Self, IllustrationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| IllustrationError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: api_key.into(),
            timeout_secs,
        })
    }

    /// Point at another base URL (proxy, test server).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, model: &str) -> String {
        format!("{}/models/{}:generateContent", self.endpoint, model)
    }
}

#[async_trait]
impl ImageModel for GeminiImageModel {
    async fn generate_image(&self, prompt: &str, model: &str) -> Result<Vec<u8>, IllustrationError> {
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": { "responseModalities": ["IMAGE"] },
        });

        let response = self
            .client
            .post(self.url(model))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    IllustrationError::Timeout {
                        secs: self.timeout_secs,
                    }
                } else {
                    IllustrationError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(IllustrationError::Quota {
                model: model.to_string(),
            });
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|e| IllustrationError::Transport(e.to_string()))?;
        if !status.is_success() {
            let message = payload["error"]["message"]
                .as_str()
                .unwrap_or("no error message")
                .to_string();
            return Err(IllustrationError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let bytes = parse_image_response(&payload)?;
        debug!("{}: received {} image bytes", model, bytes.len());
        Ok(bytes)
    }
}

/// Extract the first inline image from a `generateContent` response.
pub fn parse_image_response(payload: &Value) -> Result<Vec<u8>, IllustrationError> {
    if let Some(reason) = payload["promptFeedback"]["blockReason"].as_str() {
        return Err(IllustrationError::Unsupported(format!("prompt blocked: {reason}")));
    }

    let parts = payload["candidates"][0]["content"]["parts"]
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default();
    let data = parts.iter().find_map(|part| {
        let inline = part.get("inlineData").or_else(|| part.get("inline_data"))?;
        inline["data"].as_str()
    });

    match data {
        Some(encoded) => STANDARD
            .decode(encoded)
            .map_err(|e| IllustrationError::Unsupported(format!("invalid base64 image: {e}"))),
        None => {
            let finish = payload["candidates"][0]["finishReason"]
                .as_str()
                .unwrap_or("no candidates");
            Err(IllustrationError::Unsupported(format!(
                "response contained no image ({finish})"
            )))
        }
    }
}
