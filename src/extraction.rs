//! Extraction stage: markdown → [`PatientRecord`] via a language model.
//!
//! Defines the [`Extractor`] trait and its implementations:
//! - **[`DisabledExtractor`]**: fails its setup check; used when no
//!   provider is configured.
//! - **[`OpenAiExtractor`]**: calls an OpenAI-compatible chat completions
//!   endpoint with a strict `json_schema` response format.
//!
//! Any backend that turns "text + schema + instruction" into a structured
//! value can stand in for these; the pipeline only sees the trait.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! A response that parses but does not fit the schema is not retried: the
//! document's row fails for this run.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ExtractionConfig;
use crate::schema::PatientRecord;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("extraction backend is disabled")]
    Disabled,

    #[error("extraction request failed: {0}")]
    Transport(String),

    #[error("extraction API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("model response is not a valid patient record: {0}")]
    SchemaViolation(String),

    #[error("model returned an empty response")]
    EmptyResponse,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Model identifier, for logs and run records.
    fn model_name(&self) -> &str;

    /// Verify the backend is configured; run once before any document.
    async fn check(&self) -> Result<()>;

    /// Populate `schema` from `markdown` following `instruction`.
    async fn extract(
        &self,
        markdown: &str,
        schema: &Value,
        instruction: &str,
    ) -> Result<PatientRecord, ExtractionError>;
}

// ============ Disabled ============

pub struct DisabledExtractor;

#[async_trait]
impl Extractor for DisabledExtractor {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn check(&self) -> Result<()> {
        bail!("Extraction provider is disabled; set [extraction].provider in the config")
    }

    async fn extract(
        &self,
        _markdown: &str,
        _schema: &Value,
        _instruction: &str,
    ) -> Result<PatientRecord, ExtractionError> {
        Err(ExtractionError::Disabled)
    }
}

// ============ OpenAI-compatible ============

/// Chat-completions extractor with structured output.
///
/// Works against `api.openai.com` and compatible servers (set `base_url`).
/// The API key is read from the environment variable named by `api_key_env`.
pub struct OpenAiExtractor {
    model: String,
    endpoint: String,
    api_key_env: String,
    max_retries: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl OpenAiExtractor {
    pub fn new(config: &ExtractionConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("extraction.model required for OpenAI provider"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key_env: config.api_key_env.clone(),
            max_retries: config.max_retries,
            temperature: config.temperature,
            client,
        })
    }

    fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|k| !k.is_empty())
    }
}

/// Request body for a strict structured-output completion.
pub fn build_request(
    model: &str,
    temperature: f32,
    markdown: &str,
    schema: &Value,
    instruction: &str,
) -> Value {
    serde_json::json!({
        "model": model,
        "temperature": temperature,
        "messages": [
            { "role": "system", "content": instruction },
            { "role": "user", "content": markdown },
        ],
        "response_format": {
            "type": "json_schema",
            "json_schema": {
                "name": "patient_record",
                "strict": true,
                "schema": schema,
            }
        }
    })
}

/// Pull the message content out of a chat completions response and parse it.
pub fn parse_completion(json: &Value) -> Result<PatientRecord, ExtractionError> {
    let message = &json["choices"][0]["message"];
    if let Some(refusal) = message["refusal"].as_str() {
        return Err(ExtractionError::SchemaViolation(format!("model refused: {}", refusal)));
    }
    let content = message["content"]
        .as_str()
        .filter(|c| !c.trim().is_empty())
        .ok_or(ExtractionError::EmptyResponse)?;
    PatientRecord::from_model_output(content)
        .map_err(|e| ExtractionError::SchemaViolation(e.to_string()))
}

#[async_trait]
impl Extractor for OpenAiExtractor {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn check(&self) -> Result<()> {
        if self.api_key().is_none() {
            bail!("{} environment variable not set", self.api_key_env);
        }
        Ok(())
    }

    async fn extract(
        &self,
        markdown: &str,
        schema: &Value,
        instruction: &str,
    ) -> Result<PatientRecord, ExtractionError> {
        let api_key = self
            .api_key()
            .ok_or_else(|| ExtractionError::Transport(format!("{} not set", self.api_key_env)))?;

        let body = build_request(&self.model, self.temperature, markdown, schema, instruction);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: Value = response
                            .json()
                            .await
                            .map_err(|e| ExtractionError::Transport(e.to_string()))?;
                        debug!(
                            model = %self.model,
                            prompt_tokens = json["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
                            completion_tokens = json["usage"]["completion_tokens"].as_u64().unwrap_or(0),
                            "extraction response"
                        );
                        return parse_completion(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = ExtractionError::Api {
                        status: status.as_u16(),
                        body: body_text,
                    };

                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(attempt = attempt + 1, error = %err, "extraction attempt failed");
                        last_err = Some(err);
                        continue;
                    }

                    return Err(err);
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "extraction request failed");
                    last_err = Some(ExtractionError::Transport(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| ExtractionError::Transport("extraction failed after retries".into())))
    }
}

/// Create the extractor named by `extraction.provider`.
pub fn create_extractor(config: &ExtractionConfig) -> Result<Box<dyn Extractor>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledExtractor)),
        "openai" => Ok(Box::new(OpenAiExtractor::new(config)?)),
        other => bail!("Unknown extraction provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::record_json_schema;
    use serde_json::json;

    #[test]
    fn request_uses_strict_json_schema() {
        let schema = record_json_schema();
        let body = build_request("gpt-4o", 0.0, "# Form", &schema, "Extract.");
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["content"], "Extract.");
        assert_eq!(body["messages"][1]["content"], "# Form");
        assert_eq!(body["response_format"]["json_schema"]["strict"], true);
        assert_eq!(body["response_format"]["json_schema"]["schema"], schema);
    }

    #[test]
    fn parses_completion_content() {
        let response = json!({
            "choices": [{ "message": { "role": "assistant", "content": "{\"name\": \"Jane Doe\", \"insurance\": null}" } }]
        });
        let record = parse_completion(&response).unwrap();
        assert_eq!(record.name, "Jane Doe");
        assert!(record.insurance.is_none());
    }

    #[test]
    fn schema_violations_are_reported() {
        let response = json!({
            "choices": [{ "message": { "content": "{\"name\": \"x\", \"ssn\": \"123\"}" } }]
        });
        assert!(matches!(
            parse_completion(&response),
            Err(ExtractionError::SchemaViolation(_))
        ));

        let refused = json!({ "choices": [{ "message": { "content": null, "refusal": "no" } }] });
        assert!(matches!(
            parse_completion(&refused),
            Err(ExtractionError::SchemaViolation(_))
        ));

        let empty = json!({ "choices": [] });
        assert!(matches!(parse_completion(&empty), Err(ExtractionError::EmptyResponse)));
    }

    #[tokio::test]
    async fn disabled_extractor_fails_setup_check() {
        let extractor = create_extractor(&ExtractionConfig::default()).unwrap();
        assert_eq!(extractor.model_name(), "disabled");
        assert!(extractor.check().await.is_err());
    }

    #[tokio::test]
    async fn openai_check_requires_api_key() {
        let config = ExtractionConfig {
            provider: "openai".to_string(),
            model: Some("gpt-4o".to_string()),
            api_key_env: "INTAKE_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..ExtractionConfig::default()
        };
        let extractor = create_extractor(&config).unwrap();
        let err = extractor.check().await.unwrap_err();
        assert!(err.to_string().contains("INTAKE_TEST_KEY_THAT_IS_NEVER_SET"));
    }
}
