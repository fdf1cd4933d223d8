//! OpenRouter chat-completions client for descriptions and greetings.

use crate::clients::replicate::transport_error;
use crate::clients::{retry_after_from_body, retry_after_from_headers};
use crate::config::TextGeneratorConfig;
use crate::services::generator::{GenError, GenerationParams, mentions_policy};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<Message>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
    code: Option<serde_json::Value>,
}

/// Chat-completions client for the OpenRouter API.
#[derive(Clone)]
pub struct OpenRouterClient {
    client: Client,
    token: String,
    config: TextGeneratorConfig,
    policy_markers: Vec<String>,
}

impl OpenRouterClient {
    #[must_use]
    pub fn new(
        client: Client,
        token: &str,
        config: TextGeneratorConfig,
        policy_markers: Vec<String>,
    ) -> Self {
        Self {
            client,
            token: token.to_string(),
            config,
            policy_markers,
        }
    }

    pub async fn complete(&self, params: &GenerationParams) -> Result<String, GenError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = params.instructions.as_deref() {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": params.prompt }));

        let body = json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });

        let url = format!(
            "{}/chat/completions",
            self.config.api_url.trim_end_matches('/')
        );
        let mut request = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .header("X-Title", "companion-enricher")
            .json(&body);
        if let Some(referer) = &self.config.referer {
            request = request.header("HTTP-Referer", referer);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let header_hint = retry_after_from_headers(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(GenError::RateLimited {
                retry_after: header_hint.or_else(|| retry_after_from_body(&body)),
            });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("OpenRouter API error: {status} - {body}");
            if status.is_client_error() && mentions_policy(&body, &self.policy_markers) {
                return Err(GenError::PolicyRejected(message));
            }
            return Err(GenError::Upstream(message));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| GenError::Upstream(format!("malformed completion: {e}")))?;

        self.extract_content(chat)
    }

    fn extract_content(&self, chat: ChatResponse) -> Result<String, GenError> {
        if let Some(error) = chat.error {
            let is_rate_limit = error
                .code
                .as_ref()
                .is_some_and(|c| c.as_u64() == Some(429) || c.as_str() == Some("429"));
            if is_rate_limit {
                return Err(GenError::RateLimited { retry_after: None });
            }
            if mentions_policy(&error.message, &self.policy_markers) {
                return Err(GenError::PolicyRejected(error.message));
            }
            return Err(GenError::Upstream(error.message));
        }

        let choice = chat
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GenError::Upstream("completion has no choices".to_string()))?;

        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(GenError::PolicyRejected(
                "completion stopped by content filter".to_string(),
            ));
        }

        choice
            .message
            .and_then(|m| m.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| GenError::Upstream("completion is empty".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> OpenRouterClient {
        OpenRouterClient::new(
            Client::new(),
            "key",
            TextGeneratorConfig::default(),
            vec!["flagged".to_string()],
        )
    }

    fn chat(value: serde_json::Value) -> ChatResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_extracts_trimmed_content() {
        let response = chat(json!({
            "choices": [{ "message": { "content": "  Hi, I'm Aria.  " }, "finish_reason": "stop" }]
        }));
        assert_eq!(client().extract_content(response).unwrap(), "Hi, I'm Aria.");
    }

    #[test]
    fn test_content_filter_is_policy_rejection() {
        let response = chat(json!({
            "choices": [{ "message": { "content": "" }, "finish_reason": "content_filter" }]
        }));
        assert!(matches!(
            client().extract_content(response),
            Err(GenError::PolicyRejected(_))
        ));
    }

    #[test]
    fn test_embedded_errors() {
        let response = chat(json!({ "error": { "message": "Input was flagged", "code": 403 } }));
        assert!(matches!(
            client().extract_content(response),
            Err(GenError::PolicyRejected(_))
        ));

        let response = chat(json!({ "error": { "message": "slow down", "code": 429 } }));
        assert!(matches!(
            client().extract_content(response),
            Err(GenError::RateLimited { .. })
        ));

        let response = chat(json!({ "choices": [{ "message": { "content": "   " } }] }));
        assert!(matches!(
            client().extract_content(response),
            Err(GenError::Upstream(_))
        ));
    }
}
