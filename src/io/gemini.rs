//! Gemini text generation over the generateContent REST endpoint

use crate::infra::config::Config;
use crate::services::enrichment::{EnrichmentError, TextGenerator};
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

impl From<reqwest::Error> for EnrichmentError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => EnrichmentError::Status(status.as_u16()),
            None => EnrichmentError::Http(e.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: [RequestPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

impl<'a> GenerateRequest<'a> {
    fn new(prompt: &'a str) -> Self {
        Self { contents: [Content { parts: [RequestPart { text: prompt }] }] }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

/// Concatenated text of the first candidate
fn extract_text(response: GenerateResponse) -> Result<String, EnrichmentError> {
    let text: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if !text.is_empty() {
        return Ok(text);
    }

    let reason = response
        .prompt_feedback
        .and_then(|f| f.block_reason)
        .map(|r| format!("prompt blocked: {r}"))
        .unwrap_or_else(|| "no text in response".to_string());
    Err(EnrichmentError::UnexpectedResponse(reason))
}

#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
    timeout: Option<Duration>,
}

impl GeminiClient {
    /// `timeout` of None leaves requests unbounded at the HTTP layer
    pub fn new(
        endpoint: &str,
        model: &str,
        api_key: &str,
        timeout: Option<Duration>,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            url: format!("{}/models/{}:generateContent", endpoint.trim_end_matches('/'), model),
            api_key: api_key.to_string(),
            timeout,
        })
    }

    /// Client for the configured model, or None when enrichment is off or has no key
    ///
    /// A zero `timeout_ms` disables the request timeout, as it does for the dispatcher.
    pub fn from_config(config: &Config) -> anyhow::Result<Option<Self>> {
        if !config.enrichment_enabled() {
            return Ok(None);
        }
        let Some(api_key) = config.enrichment_api_key() else {
            return Ok(None);
        };
        let timeout = match config.enrichment_timeout_ms() {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        Self::new(config.enrichment_endpoint(), config.enrichment_model(), api_key, timeout)
            .map(Some)
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<String, EnrichmentError> {
        let resp = self
            .http
            .post(&self.url)
            .header("x-goog-api-key", &self.api_key)
            .json(&GenerateRequest::new(prompt))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            debug!(status = %status, "gemini_request_rejected");
            return Err(EnrichmentError::Status(status.as_u16()));
        }

        let body: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| EnrichmentError::UnexpectedResponse(e.to_string()))?;
        extract_text(body)
    }

    fn backend_name(&self) -> &'static str {
        "gemini"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> GenerateResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_request_body_shape() {
        let body = serde_json::to_value(GenerateRequest::new("hello")).unwrap();
        assert_eq!(body, serde_json::json!({"contents": [{"parts": [{"text": "hello"}]}]}));
    }

    #[test]
    fn test_extract_text_joins_parts() {
        let response = parse(
            r#"{"candidates":[{"content":{"parts":[{"text":"Take "},{"text":"MG Road."}],"role":"model"}}]}"#,
        );
        assert_eq!(extract_text(response).unwrap(), "Take MG Road.");
    }

    #[test]
    fn test_blocked_prompt() {
        let response = parse(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#);
        assert_eq!(
            extract_text(response),
            Err(EnrichmentError::UnexpectedResponse("prompt blocked: SAFETY".to_string()))
        );
    }

    #[test]
    fn test_empty_response() {
        assert!(matches!(
            extract_text(GenerateResponse::default()),
            Err(EnrichmentError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn test_url() {
        let client = GeminiClient::new(
            "https://generativelanguage.googleapis.com/v1beta/",
            "gemini-pro",
            "k",
            Some(Duration::from_secs(1)),
        )
        .unwrap();
        assert_eq!(
            client.url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-pro:generateContent"
        );
    }

    #[test]
    fn test_disabled_by_config() {
        let config = Config::default().with_enrichment_enabled(false);
        assert!(GeminiClient::from_config(&config).unwrap().is_none());
    }

    #[test]
    fn test_zero_timeout_leaves_requests_unbounded() {
        let config = Config::default()
            .with_enrichment_enabled(true)
            .with_enrichment_api_key("k")
            .with_enrichment_timeout_ms(0);
        let client = GeminiClient::from_config(&config).unwrap().unwrap();
        assert_eq!(client.timeout, None);

        let config = config.with_enrichment_timeout_ms(2_500);
        let client = GeminiClient::from_config(&config).unwrap().unwrap();
        assert_eq!(client.timeout, Some(Duration::from_millis(2_500)));
    }
}
