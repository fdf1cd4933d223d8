//! Replicate predictions client for avatar images.

use crate::clients::{retry_after_from_body, retry_after_from_headers};
use crate::config::ImageGeneratorConfig;
use crate::services::generator::{GenError, GenerationParams, mentions_policy};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct Prediction {
    id: String,
    status: String,
    output: Option<Value>,
    error: Option<Value>,
}

#[derive(Clone)]
pub struct ReplicateClient {
    client: Client,
    token: String,
    config: ImageGeneratorConfig,
    policy_markers: Vec<String>,
}

impl ReplicateClient {
    #[must_use]
    pub fn new(
        client: Client,
        token: &str,
        config: ImageGeneratorConfig,
        policy_markers: Vec<String>,
    ) -> Self {
        Self {
            client,
            token: token.to_string(),
            config,
            policy_markers,
        }
    }

    fn predictions_url(&self) -> String {
        format!("{}/predictions", self.config.api_url.trim_end_matches('/'))
    }

    /// Runs one prediction to completion and returns the output image URL.
    pub async fn generate_image(&self, params: &GenerationParams) -> Result<String, GenError> {
        let deadline = Instant::now() + Duration::from_secs(self.config.timeout_seconds);

        let mut input = json!({
            "prompt": params.prompt,
            "width": self.config.width,
            "height": self.config.height,
            "num_outputs": 1,
            "num_inference_steps": self.config.num_inference_steps,
        });
        if let Some(negative) = params
            .negative_prompt
            .as_deref()
            .filter(|n| !n.is_empty())
        {
            input["negative_prompt"] = json!(negative);
        }

        let mut request = self
            .client
            .post(self.predictions_url())
            .bearer_auth(&self.token)
            .json(&json!({ "version": self.config.model_version, "input": input }));
        if self.config.prefer_wait {
            request = request.header("Prefer", "wait");
        }

        let response = request.send().await.map_err(transport_error)?;
        let mut prediction = self.read_prediction(response).await?;
        debug!(prediction_id = %prediction.id, status = %prediction.status, "Prediction submitted");

        loop {
            match prediction.status.as_str() {
                "succeeded" => return extract_output(&prediction),
                "failed" | "canceled" => return Err(self.classify_failure(&prediction)),
                _ => {}
            }

            if Instant::now() >= deadline {
                return Err(GenError::Timeout(format!(
                    "prediction {} still {} after {}s",
                    prediction.id, prediction.status, self.config.timeout_seconds
                )));
            }

            tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;

            let url = format!("{}/{}", self.predictions_url(), prediction.id);
            let response = self
                .client
                .get(url)
                .bearer_auth(&self.token)
                .send()
                .await
                .map_err(transport_error)?;
            prediction = self.read_prediction(response).await?;
        }
    }

    async fn read_prediction(&self, response: Response) -> Result<Prediction, GenError> {
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
            let message = format!("Replicate API error: {status} - {body}");
            if status.is_client_error() && mentions_policy(&body, &self.policy_markers) {
                return Err(GenError::PolicyRejected(message));
            }
            return Err(GenError::Upstream(message));
        }

        response
            .json::<Prediction>()
            .await
            .map_err(|e| GenError::Upstream(format!("malformed prediction: {e}")))
    }

    fn classify_failure(&self, prediction: &Prediction) -> GenError {
        let reason = match &prediction.error {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => format!("prediction {}", prediction.status),
        };

        if mentions_policy(&reason, &self.policy_markers) {
            GenError::PolicyRejected(reason)
        } else {
            GenError::Upstream(reason)
        }
    }
}

fn extract_output(prediction: &Prediction) -> Result<String, GenError> {
    let url = match &prediction.output {
        Some(Value::String(url)) => Some(url.as_str()),
        Some(Value::Array(items)) => items.first().and_then(Value::as_str),
        _ => None,
    };

    url.filter(|u| !u.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            GenError::Upstream(format!("prediction {} succeeded without output", prediction.id))
        })
}

pub(crate) fn transport_error(err: reqwest::Error) -> GenError {
    if err.is_timeout() {
        GenError::Timeout(err.to_string())
    } else {
        GenError::Upstream(format!("request failed: {err}"))
    }
}
