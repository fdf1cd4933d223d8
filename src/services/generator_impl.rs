use crate::clients::openrouter::OpenRouterClient;
use crate::clients::replicate::ReplicateClient;
use crate::domain::GenerationKind;
use crate::services::generator::{Artifact, GenError, GenerationParams, Generator};
use std::time::Instant;
use tracing::debug;

/// [`Generator`] that routes image requests to Replicate and text requests to
/// OpenRouter.
///
/// Either backend may be absent when its credential is not configured; a
/// request for a missing backend fails instead of falling back.
pub struct HttpGenerator {
    image: Option<ReplicateClient>,
    text: Option<OpenRouterClient>,
}

impl HttpGenerator {
    #[must_use]
    pub const fn new(image: Option<ReplicateClient>, text: Option<OpenRouterClient>) -> Self {
        Self { image, text }
    }
}

#[async_trait::async_trait]
impl Generator for HttpGenerator {
    async fn generate(
        &self,
        kind: GenerationKind,
        params: &GenerationParams,
    ) -> Result<Artifact, GenError> {
        let start = Instant::now();

        let result = match kind {
            GenerationKind::Image => match &self.image {
                Some(client) => client.generate_image(params).await.map(Artifact::RemoteUrl),
                None => Err(GenError::Upstream(
                    "no image generator configured".to_string(),
                )),
            },
            GenerationKind::Text => match &self.text {
                Some(client) => client.complete(params).await.map(Artifact::Text),
                None => Err(GenError::Upstream("no text generator configured".to_string())),
            },
        };

        let outcome = result.as_ref().map_or_else(GenError::label, |_| "ok");
        metrics::counter!(
            "generator_requests_total",
            "kind" => kind.as_str(),
            "result" => outcome
        )
        .increment(1);

        debug!(
            kind = kind.as_str(),
            subject = %params.subject_name,
            safety = params.safety.as_str(),
            result = outcome,
            duration_ms = start.elapsed().as_millis() as u64,
            "Generator request finished"
        );

        result
    }
}
