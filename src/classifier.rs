//! Remote frame classification.
//!
//! The scheduler only sees the [`Classifier`] trait. Transport failures are
//! returned as errors; anything the remote says that is not one of the four
//! labels is normalized to [`Observation::Unknown`] here.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::{Client, Url};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ClassifierConfig;
use crate::frame::Frame;
use crate::types::Observation;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com";
pub const AUTH_ENV_VAR: &str = "GEMINI_API_KEY";
const API_KEY_HEADER: &str = "x-goog-api-key";

const CLASSIFY_PROMPT: &str = "Analyze the person's face in this image. Focus on their eyes \
and mouth. Classify their state into one of the following exact categories: OPEN, CLOSED, \
YAWN. Respond with only one of these words. If no person is detected or the state cannot be \
determined, respond with UNKNOWN.";

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("missing {0}")]
    MissingApiKey(&'static str),

    #[error("invalid classifier endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("classifier request failed: {0}")]
    Request(reqwest::Error),

    #[error("classifier error {status}: {body}")]
    Status { status: u16, body: String },
}

impl From<reqwest::Error> for ClassifierError {
    fn from(err: reqwest::Error) -> Self {
        // A user-supplied endpoint may still carry credentials in its query.
        ClassifierError::Request(err.without_url())
    }
}

/// Maps one encoded image to one observation label.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, frame: &Frame) -> Result<Observation, ClassifierError>;
}

/// Gemini `generateContent` vision classifier.
#[derive(Clone)]
pub struct GeminiClassifier {
    client: Client,
    url: Url,
    api_key: String,
    model: String,
}

impl std::fmt::Debug for GeminiClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiClassifier")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl GeminiClassifier {
    pub fn new(config: &ClassifierConfig) -> Result<Self, ClassifierError> {
        let api_key = match &config.api_key {
            Some(key) if !key.trim().is_empty() => key.clone(),
            _ => std::env::var(AUTH_ENV_VAR)
                .ok()
                .filter(|key| !key.trim().is_empty())
                .ok_or(ClassifierError::MissingApiKey(AUTH_ENV_VAR))?,
        };

        let url = resolve_endpoint(config.endpoint.as_deref(), &config.model)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url,
            api_key,
            model: config.model.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Classifier for GeminiClassifier {
    async fn classify(&self, frame: &Frame) -> Result<Observation, ClassifierError> {
        let payload = json!({
            "contents": [
                {
                    "parts": [
                        { "text": CLASSIFY_PROMPT },
                        {
                            "inlineData": {
                                "mimeType": frame.mime_type,
                                "data": BASE64.encode(&frame.data)
                            }
                        }
                    ]
                }
            ]
        });

        let response = self
            .client
            .post(self.url.clone())
            .header(API_KEY_HEADER, &self.api_key)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Status {
                status,
                body: truncate(&body, 320),
            });
        }

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(err) => {
                warn!(error = %err.without_url(), "Unparseable classifier response");
                return Ok(Observation::Unknown);
            }
        };

        let text = response_text(&body);
        debug!(model = %self.model, response = %text, "Classifier responded");

        Ok(normalize(&text))
    }
}

/// Maps free text to a label, falling back to `Unknown`.
pub fn normalize(text: &str) -> Observation {
    Observation::parse_label(text).unwrap_or_else(|| {
        warn!(response = %truncate(text, 80), "Unexpected classifier response");
        Observation::Unknown
    })
}

fn response_text(body: &Value) -> String {
    body["candidates"]
        .as_array()
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate["content"]["parts"].as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part["text"].as_str())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

fn resolve_endpoint(endpoint: Option<&str>, model: &str) -> Result<Url, ClassifierError> {
    let endpoint = endpoint.unwrap_or(DEFAULT_ENDPOINT);
    let target = if endpoint.contains(":generateContent") {
        endpoint.to_string()
    } else {
        format!(
            "{}/v1beta/models/{}:generateContent",
            endpoint.trim_end_matches('/'),
            model
        )
    };

    Url::parse(&target).map_err(|e| ClassifierError::InvalidEndpoint {
        endpoint: target.clone(),
        reason: e.to_string(),
    })
}

fn truncate(value: &str, max_chars: usize) -> String {
    let mut chars = value.chars();
    let truncated: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}
