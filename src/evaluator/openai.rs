//! OpenAI chat completion client and the offline fallback.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::CompletionClient;
use crate::config::Config;
use crate::errors::LlmError;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Minimal OpenAI Chat Completions client.
///
/// Retries transport errors, 429 and 5xx responses with exponential backoff;
/// other 4xx responses fail immediately.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    api_key: String,
    model: String,
    base_url: String,
    max_retries: u32,
    initial_retry_delay: Duration,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, LlmError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(LlmError::MissingApiKey);
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            api_key,
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            max_retries: 2,
            initial_retry_delay: Duration::from_secs(1),
            http,
        })
    }

    /// Client configured from the service config; fails without an API key.
    pub fn from_config(config: &Config) -> Result<Self, LlmError> {
        let key = config
            .require_openai_api_key()
            .map_err(|_| LlmError::MissingApiKey)?;
        Self::new(key, config.openai_model.clone())
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_retries(mut self, max_retries: u32, initial_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.initial_retry_delay = initial_delay;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body(&self, prompt: &str) -> Value {
        json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0,
        })
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let endpoint = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(prompt);

        let mut last_error = String::from("no attempt made");
        let mut retry_delay = self.initial_retry_delay;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tracing::warn!(
                    "OpenAI API retry attempt {} after {:?}",
                    attempt,
                    retry_delay
                );
                tokio::time::sleep(retry_delay).await;
                retry_delay *= 2;
            }

            let response = match self
                .http
                .post(&endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };

            let status = response.status();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                last_error = "Rate limited by OpenAI API (429)".to_string();
                continue;
            }
            if status.is_server_error() {
                last_error = format!("OpenAI API server error: {}", status);
                continue;
            }

            let text = match response.text().await {
                Ok(text) => text,
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };

            if !status.is_success() {
                return Err(LlmError::Status {
                    status: status.as_u16(),
                    body: text.chars().take(500).collect(),
                });
            }

            let json: Value = serde_json::from_str(&text)
                .map_err(|e| LlmError::Parse(format!("{} - Body: {}", e, truncated(&text))))?;
            return extract_content(&json);
        }

        Err(LlmError::RetriesExhausted {
            attempts: self.max_retries + 1,
            last: last_error,
        })
    }
}

fn extract_content(response: &Value) -> Result<String, LlmError> {
    response
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .ok_or_else(|| {
            LlmError::Parse(format!(
                "missing choices[0].message.content in {}",
                truncated(&response.to_string())
            ))
        })
}

fn truncated(text: &str) -> String {
    text.chars().take(500).collect()
}

/// Deterministic stand-in used when no API key is configured.
///
/// Answers `50` to score prompts and `failure` to everything else.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedClient;

#[async_trait]
impl CompletionClient for SimulatedClient {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        if prompt.to_lowercase().contains("method: score") {
            Ok("50".to_string())
        } else {
            Ok("failure".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{bearer_token, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn completion(content: &str) -> Value {
        json!({
            "id": "chatcmpl-1",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": content}}],
        })
    }

    fn client(server: &MockServer) -> OpenAiClient {
        OpenAiClient::new("sk-test", "gpt-test")
            .unwrap()
            .with_base_url(server.uri())
            .with_retries(2, Duration::from_millis(1))
    }

    #[test]
    fn test_missing_key_rejected() {
        assert!(matches!(
            OpenAiClient::new("  ", "gpt"),
            Err(LlmError::MissingApiKey)
        ));
        assert!(matches!(
            OpenAiClient::from_config(&Config::default()),
            Err(LlmError::MissingApiKey)
        ));
    }

    #[test]
    fn test_request_body_shape() {
        let client = OpenAiClient::new("sk", "gpt-4o").unwrap();
        let body = client.request_body("hi");
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["content"], "hi");
        assert_eq!(body["temperature"], 0);
    }

    #[tokio::test]
    async fn test_complete_returns_trimmed_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(bearer_token("sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("  87 good  ")))
            .mount(&server)
            .await;

        assert_eq!(client(&server).complete("prompt").await.unwrap(), "87 good");
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server).complete("prompt").await.unwrap_err();
        assert!(matches!(err, LlmError::Status { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_server_errors_exhaust_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let err = client(&server).complete("prompt").await.unwrap_err();
        assert!(matches!(err, LlmError::RetriesExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_malformed_body_is_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        assert!(matches!(
            client(&server).complete("prompt").await,
            Err(LlmError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_simulated_client() {
        assert_eq!(
            SimulatedClient.complete("Method: score\n...").await.unwrap(),
            "50"
        );
        assert_eq!(
            SimulatedClient
                .complete("Method: success-failure\n...")
                .await
                .unwrap(),
            "failure"
        );
    }
}
