use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clients::airtable::AirtableClient;
use crate::clients::openrouter::OpenRouterClient;
use crate::clients::replicate::ReplicateClient;
use crate::config::{Config, ConfigError, Credentials};
use crate::domain::{AttributeKind, GenerationKind};
use crate::services::{
    AttributeStrategy, EnrichmentJob, FsMaterializer, HttpGenerator, JobSettings, RateLimitPolicy,
    RecordStore,
};

/// Build a shared HTTP client with reasonable defaults for API calls.
/// Reused by every client so connections are pooled.
fn build_shared_http_client(timeout_seconds: u64) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_seconds))
        .user_agent(concat!("companion-enricher/", env!("CARGO_PKG_VERSION")))
        .pool_max_idle_per_host(10)
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build shared HTTP client: {e}"))
}

/// Command-line adjustments for a single run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOverrides {
    pub limit: Option<usize>,
    pub batch_size: Option<usize>,
    pub dry_run: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,

    pub credentials: Credentials,

    pub store: Arc<dyn RecordStore>,

    pub http_client: reqwest::Client,

    /// Generation requests can take minutes; kept apart from the store client.
    pub generator_client: reqwest::Client,

    pub cancel: CancellationToken,
}

impl AppState {
    /// Connects to the record store; generator credentials are checked per job.
    pub fn new(
        config: Config,
        credentials: Credentials,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let (base_id, token) = credentials.store()?;

        let http_client = build_shared_http_client(config.store.request_timeout_seconds)?;
        let generator_client = build_shared_http_client(config.generator.request_timeout_seconds)?;

        let store: Arc<dyn RecordStore> = Arc::new(
            AirtableClient::new(http_client.clone(), &config.store, base_id, token)
                .with_page_retries(
                    config.job.max_store_retries,
                    Duration::from_millis(config.job.store_retry_delay_ms),
                    Duration::from_millis(config.job.backoff_max_ms),
                ),
        );

        debug!(
            table = %config.store.table,
            credentials = ?credentials,
            "Record store client ready"
        );

        Ok(Self {
            config: Arc::new(config),
            credentials,
            store,
            http_client,
            generator_client,
            cancel,
        })
    }

    pub fn strategy(&self, attribute: AttributeKind) -> Result<AttributeStrategy, ConfigError> {
        AttributeStrategy::new(
            attribute,
            &self.config.job,
            self.config.traits.clone(),
            &self.config.generator.image.negative_prompt,
        )
        .map_err(|e| ConfigError::Invalid(format!("refresh signature: {e}")))
    }

    /// Assembles a job for `attribute`.
    ///
    /// Dry runs need only the store; real runs also need the generator token
    /// and, for image attributes, an artifact directory.
    pub fn job(
        &self,
        attribute: AttributeKind,
        overrides: RunOverrides,
    ) -> Result<EnrichmentJob, ConfigError> {
        let strategy = self.strategy(attribute)?;

        let mut settings = JobSettings::from_config(&self.config);
        settings.dry_run = overrides.dry_run;
        if let Some(limit) = overrides.limit {
            settings.limit = limit;
        }

        let mut policy = RateLimitPolicy::from(&self.config.job);
        if let Some(batch_size) = overrides.batch_size {
            policy.batch_size = batch_size.max(1);
        }

        let needs_materializer = strategy.materializes();
        let generation_kind = strategy.generation_kind();
        let mut job = EnrichmentJob::new(
            strategy,
            Arc::clone(&self.store),
            settings,
            policy,
            self.cancel.clone(),
        );

        if overrides.dry_run {
            return Ok(job);
        }

        let token = self.credentials.generator_token(generation_kind)?;
        let generator = match generation_kind {
            GenerationKind::Image => HttpGenerator::new(
                Some(ReplicateClient::new(
                    self.generator_client.clone(),
                    token,
                    self.config.generator.image.clone(),
                    self.config.generator.policy_markers.clone(),
                )),
                None,
            ),
            GenerationKind::Text => HttpGenerator::new(
                None,
                Some(OpenRouterClient::new(
                    self.generator_client.clone(),
                    token,
                    self.config.generator.text.clone(),
                    self.config.generator.policy_markers.clone(),
                )),
            ),
        };
        job = job.with_generator(Arc::new(generator));

        if needs_materializer {
            let dir = self.credentials.artifact_dir(&self.config.materializer)?;
            info!(dir = %dir.display(), "Artifacts will be materialized locally");
            job = job.with_materializer(Arc::new(FsMaterializer::new(
                self.http_client.clone(),
                dir,
                &self.config.materializer.public_base_url,
                &self.config.materializer.default_extension,
            )));
        }

        Ok(job)
    }
}
