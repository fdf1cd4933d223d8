//! The enrichment run loop.
//!
//! One [`EnrichmentJob`] fills a single attribute across the record store:
//! it builds a queue of eligible records, then walks each one through
//! generate, optional materialize and patch, strictly one at a time. Per-record
//! failures are contained and reported in the [`RunSummary`]; only store
//! failures while building the queue abort the run.

use crate::config::Config;
use crate::domain::{AttributeDelta, AttributeKind, Entity, EntityId, SafetyTier};
use crate::services::generator::{GenError, Generator};
use crate::services::materializer::Materializer;
use crate::services::rate_limit::{Interrupted, RateLimitPolicy, RateLimiter};
use crate::services::record_store::{RecordStore, StoreError};
use crate::services::strategy::{AttributeStrategy, Eligibility};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

/// Errors that end a run before any record is processed.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Record store error while building the queue: {0}")]
    Store(#[from] StoreError),

    #[error("Job is not runnable: {0}")]
    Setup(String),
}

/// Per-run knobs, resolved from configuration and command-line overrides.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub limit: usize,
    pub page_size: usize,
    pub dry_run: bool,
    pub recheck_before_patch: bool,
    pub max_store_retries: u32,
    pub store_retry_delay: Duration,
    pub newest_first: bool,
}

impl JobSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            limit: config.job.max_per_run,
            page_size: config.store.page_size,
            dry_run: false,
            recheck_before_patch: config.job.recheck_before_patch,
            max_store_retries: config.job.max_store_retries,
            store_retry_delay: Duration::from_millis(config.job.store_retry_delay_ms),
            newest_first: config.job.newest_first,
        }
    }
}

/// Terminal state an entity reached in this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeState {
    Done,
    Failed,
    Skipped,
    Planned,
    Interrupted,
}

impl OutcomeState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Planned => "planned",
            Self::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RetryEvent {
    RateLimited { attempt: u32, delay_ms: u64 },
    Softened { from: SafetyTier, to: SafetyTier },
    StoreRateLimited { attempt: u32, delay_ms: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityOutcome {
    pub entity_id: EntityId,
    pub name: String,
    pub eligibility: Eligibility,
    pub state: OutcomeState,
    pub reason: Option<String>,
    pub value: Option<String>,
    pub retries: Vec<RetryEvent>,
}

impl EntityOutcome {
    fn new(entity: &Entity, eligibility: Eligibility) -> Self {
        Self {
            entity_id: entity.id.clone(),
            name: entity.name.clone(),
            eligibility,
            state: OutcomeState::Planned,
            reason: None,
            value: None,
            retries: Vec::new(),
        }
    }

    fn finish(mut self, state: OutcomeState, reason: Option<String>) -> Self {
        self.state = state;
        self.reason = reason;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub entity_id: EntityId,
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub attribute: AttributeKind,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scanned: usize,
    pub queued: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub planned: usize,
    pub interrupted: bool,
    pub failures: Vec<FailureRecord>,
    pub outcomes: Vec<EntityOutcome>,
}

impl RunSummary {
    fn new(run_id: Uuid, attribute: AttributeKind, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            attribute,
            dry_run,
            started_at: now,
            finished_at: now,
            scanned: 0,
            queued: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            planned: 0,
            interrupted: false,
            failures: Vec::new(),
            outcomes: Vec::new(),
        }
    }

    fn record(&mut self, outcome: EntityOutcome) {
        match outcome.state {
            OutcomeState::Done => self.succeeded += 1,
            OutcomeState::Skipped => self.skipped += 1,
            OutcomeState::Planned => self.planned += 1,
            OutcomeState::Interrupted => self.interrupted = true,
            OutcomeState::Failed => {
                self.failed += 1;
                self.failures.push(FailureRecord {
                    entity_id: outcome.entity_id.clone(),
                    name: outcome.name.clone(),
                    reason: outcome.reason.clone().unwrap_or_default(),
                });
            }
        }
        self.outcomes.push(outcome);
    }
}

/// An eligible entity waiting in the run queue.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub entity: Entity,
    pub eligibility: Eligibility,
}

/// Result of scanning the store for one attribute.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub queue: Vec<Candidate>,
    pub scanned: usize,
    pub skipped: usize,
    pub interrupted: bool,
}

enum Step<T> {
    Continue(T),
    Stop(OutcomeState, Option<String>),
}

impl From<Interrupted> for Step<()> {
    fn from(_: Interrupted) -> Self {
        Self::Stop(OutcomeState::Interrupted, None)
    }
}

pub struct EnrichmentJob {
    strategy: AttributeStrategy,
    store: Arc<dyn RecordStore>,
    generator: Option<Arc<dyn Generator>>,
    materializer: Option<Arc<dyn Materializer>>,
    settings: JobSettings,
    policy: RateLimitPolicy,
    cancel: CancellationToken,
}

impl EnrichmentJob {
    #[must_use]
    pub fn new(
        strategy: AttributeStrategy,
        store: Arc<dyn RecordStore>,
        settings: JobSettings,
        policy: RateLimitPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            strategy,
            store,
            generator: None,
            materializer: None,
            settings,
            policy,
            cancel,
        }
    }

    #[must_use]
    pub fn with_generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    #[must_use]
    pub fn with_materializer(mut self, materializer: Arc<dyn Materializer>) -> Self {
        self.materializer = Some(materializer);
        self
    }

    /// Scans the store and returns the queue a run would process.
    ///
    /// Records that fail the exact eligibility check are counted as skipped.
    /// Scanning stops once `limit` candidates are queued, unless the run
    /// prioritizes the newest records and has to see them all first.
    pub async fn plan(&self) -> Result<Plan, JobError> {
        let mut plan = Plan::default();
        let limit = self.settings.limit;
        if limit == 0 {
            return Ok(plan);
        }

        let filter = self.strategy.store_filter();
        let mut records = self.store.find(&filter, self.settings.page_size);

        loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => {
                    plan.interrupted = true;
                    break;
                }
                next = records.next() => next,
            };
            let Some(record) = next else { break };
            let entity = record?;
            plan.scanned += 1;

            match self.strategy.eligibility(&entity) {
                Some(eligibility) => {
                    debug!(entity_id = %entity.id, reason = %eligibility, "Queued");
                    plan.queue.push(Candidate {
                        entity,
                        eligibility,
                    });
                    if !self.settings.newest_first && plan.queue.len() >= limit {
                        break;
                    }
                }
                None => {
                    debug!(entity_id = %entity.id, "Not eligible, skipping");
                    plan.skipped += 1;
                }
            }
        }

        if self.settings.newest_first {
            plan.queue
                .sort_by(|a, b| b.entity.created_at.cmp(&a.entity.created_at));
            plan.queue.truncate(limit);
        }

        Ok(plan)
    }

    pub async fn run(&self) -> Result<RunSummary, JobError> {
        let run_id = Uuid::new_v4();
        let attribute = self.strategy.kind();
        let span = info_span!("enrichment_run", run_id = %run_id, attribute = %attribute);

        self.run_inner(run_id).instrument(span).await
    }

    fn check_runnable(&self) -> Result<(), JobError> {
        if self.settings.dry_run {
            return Ok(());
        }
        if self.generator.is_none() {
            return Err(JobError::Setup(format!(
                "no generator configured for {}",
                self.strategy.kind()
            )));
        }
        if self.strategy.materializes() && self.materializer.is_none() {
            return Err(JobError::Setup(format!(
                "no materializer configured for {}",
                self.strategy.kind()
            )));
        }
        Ok(())
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<RunSummary, JobError> {
        self.check_runnable()?;

        let attribute = self.strategy.kind();
        let start = std::time::Instant::now();
        let mut summary = RunSummary::new(run_id, attribute, self.settings.dry_run);

        info!(
            event = "run_started",
            limit = self.settings.limit,
            dry_run = self.settings.dry_run,
            "Starting enrichment run"
        );

        let plan = self.plan().await.inspect_err(|e| {
            error!(event = "run_failed", error = %e, "Could not build queue");
        })?;

        summary.scanned = plan.scanned;
        summary.skipped = plan.skipped;
        summary.queued = plan.queue.len();
        summary.interrupted = plan.interrupted;
        metrics::counter!(
            "enrichment_entities_total",
            "attribute" => attribute.label(),
            "outcome" => "skipped"
        )
        .increment(plan.skipped as u64);

        info!(
            scanned = plan.scanned,
            queued = plan.queue.len(),
            skipped = plan.skipped,
            "Queue built"
        );

        let mut limiter = RateLimiter::new(self.policy.clone(), self.cancel.clone());
        let mut rng = StdRng::from_os_rng();
        let total = plan.queue.len();

        for (index, candidate) in plan.queue.into_iter().enumerate() {
            if summary.interrupted || self.cancel.is_cancelled() {
                summary.interrupted = true;
                break;
            }

            info!(
                entity_id = %candidate.entity.id,
                name = %candidate.entity.name,
                reason = %candidate.eligibility,
                "[{}/{}] Processing",
                index + 1,
                total
            );

            let outcome = self.process(&mut limiter, &mut rng, candidate).await;
            metrics::counter!(
                "enrichment_entities_total",
                "attribute" => attribute.label(),
                "outcome" => outcome.state.as_str()
            )
            .increment(1);
            let stop = outcome.state == OutcomeState::Interrupted;
            summary.record(outcome);
            if stop {
                break;
            }

            if !self.settings.dry_run {
                let more_pending = index + 1 < total;
                match limiter.entity_finished(more_pending).await {
                    Ok(true) => debug!("Batch complete, paused"),
                    Ok(false) => {}
                    Err(Interrupted) => summary.interrupted = true,
                }
            }
        }

        summary.finished_at = Utc::now();
        let elapsed = start.elapsed();
        metrics::histogram!(
            "enrichment_run_duration_seconds",
            "attribute" => attribute.label()
        )
        .record(elapsed.as_secs_f64());

        info!(
            event = "run_finished",
            scanned = summary.scanned,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            planned = summary.planned,
            interrupted = summary.interrupted,
            duration_ms = elapsed.as_millis() as u64,
            "Enrichment run finished"
        );

        Ok(summary)
    }

    async fn process(
        &self,
        limiter: &mut RateLimiter,
        rng: &mut StdRng,
        candidate: Candidate,
    ) -> EntityOutcome {
        let Candidate {
            entity,
            eligibility,
        } = candidate;
        let mut outcome = EntityOutcome::new(&entity, eligibility);

        match self.enrich(limiter, rng, &entity, &mut outcome).await {
            Step::Continue(()) => {
                let state = if self.settings.dry_run {
                    OutcomeState::Planned
                } else {
                    OutcomeState::Done
                };
                outcome.finish(state, None)
            }
            Step::Stop(state, reason) => {
                match state {
                    OutcomeState::Failed => warn!(
                        entity_id = %entity.id,
                        reason = reason.as_deref().unwrap_or_default(),
                        "Enrichment failed"
                    ),
                    OutcomeState::Skipped => info!(
                        entity_id = %entity.id,
                        reason = reason.as_deref().unwrap_or_default(),
                        "Skipped"
                    ),
                    OutcomeState::Interrupted => {
                        info!(entity_id = %entity.id, "Interrupted before write");
                    }
                    OutcomeState::Done | OutcomeState::Planned => {}
                }
                outcome.finish(state, reason)
            }
        }
    }

    async fn enrich(
        &self,
        limiter: &mut RateLimiter,
        rng: &mut StdRng,
        entity: &Entity,
        outcome: &mut EntityOutcome,
    ) -> Step<()> {
        let kind = self.strategy.kind();
        let mut safety = self.strategy.initial_safety(entity);
        let (mut params, defaulted) = self.strategy.build_params(entity, safety, rng);

        if !defaulted.is_empty() {
            let names: Vec<&str> = defaulted.iter().map(|t| t.as_str()).collect();
            debug!(entity_id = %entity.id, defaulted = ?names, "Missing traits filled from defaults");
        }

        if self.settings.dry_run {
            info!(entity_id = %entity.id, safety = safety.as_str(), prompt = %params.prompt, "Would generate {kind}");
            if self.strategy.materializes() {
                info!(entity_id = %entity.id, key = %entity.artifact_key_base(), "Would materialize");
            }
            info!(entity_id = %entity.id, "Would patch {kind}");
            return Step::Continue(());
        }

        let Some(generator) = &self.generator else {
            return Step::Stop(
                OutcomeState::Failed,
                Some("no generator configured".to_string()),
            );
        };

        // Generating
        let mut rate_retries = 0u32;
        let mut softened = false;
        let artifact = loop {
            if self.cancel.is_cancelled() {
                return Interrupted.into();
            }
            if let Err(interrupted) = limiter.acquire().await {
                return interrupted.into();
            }

            match generator
                .generate(self.strategy.generation_kind(), &params)
                .await
            {
                Ok(artifact) => break artifact,
                Err(GenError::RateLimited { retry_after }) => {
                    if rate_retries >= limiter.policy().max_retries {
                        return Step::Stop(
                            OutcomeState::Failed,
                            Some(format!("rate limited after {rate_retries} retries")),
                        );
                    }
                    rate_retries += 1;
                    let delay = limiter.policy().backoff_delay(rate_retries, retry_after);
                    warn!(
                        entity_id = %entity.id,
                        attempt = rate_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Generator rate limited, backing off"
                    );
                    outcome.retries.push(RetryEvent::RateLimited {
                        attempt: rate_retries,
                        delay_ms: delay.as_millis() as u64,
                    });
                    if let Err(interrupted) = limiter.sleep(delay).await {
                        return interrupted.into();
                    }
                }
                Err(GenError::PolicyRejected(message)) => {
                    let next = if softened {
                        None
                    } else {
                        safety.more_conservative()
                    };
                    let Some(next) = next else {
                        return Step::Stop(
                            OutcomeState::Failed,
                            Some(format!("policy rejected: {message}")),
                        );
                    };
                    warn!(
                        entity_id = %entity.id,
                        from = safety.as_str(),
                        to = next.as_str(),
                        "Policy rejection, retrying with a more conservative prompt"
                    );
                    outcome.retries.push(RetryEvent::Softened {
                        from: safety,
                        to: next,
                    });
                    softened = true;
                    safety = next;
                    params = self.strategy.build_params(entity, safety, rng).0;
                }
                Err(e) => return Step::Stop(OutcomeState::Failed, Some(e.to_string())),
            }
        };

        let mut value = match self.strategy.accept(artifact) {
            Ok(value) => value,
            Err(e) => return Step::Stop(OutcomeState::Failed, Some(e.to_string())),
        };

        // Materializing
        if self.strategy.materializes() {
            if self.cancel.is_cancelled() {
                return Interrupted.into();
            }
            let Some(materializer) = &self.materializer else {
                return Step::Stop(
                    OutcomeState::Failed,
                    Some("no materializer configured".to_string()),
                );
            };
            let key = format!(
                "{}-{}",
                entity.artifact_key_base(),
                Utc::now().timestamp_millis()
            );
            value = match materializer.materialize(&value, &key).await {
                Ok(url) => url,
                Err(e) => return Step::Stop(OutcomeState::Failed, Some(e.to_string())),
            };
        }

        // Persisting
        if self.cancel.is_cancelled() {
            return Interrupted.into();
        }

        if self.settings.recheck_before_patch {
            match self.store.get(&entity.id).await {
                Ok(current) if self.strategy.eligibility(&current).is_none() => {
                    return Step::Stop(
                        OutcomeState::Skipped,
                        Some(format!("{kind} already populated")),
                    );
                }
                Ok(_) => {}
                Err(StoreError::NotFound(_)) => {
                    return Step::Stop(OutcomeState::Skipped, Some("record deleted".to_string()));
                }
                Err(e) => return Step::Stop(OutcomeState::Failed, Some(e.to_string())),
            }
        }

        let delta = AttributeDelta::single(kind, value.clone());
        let mut store_retries = 0u32;
        loop {
            match self.store.patch(&entity.id, &delta).await {
                Ok(_) => break,
                Err(StoreError::RateLimited { retry_after })
                    if store_retries < self.settings.max_store_retries =>
                {
                    store_retries += 1;
                    let delay = retry_after
                        .unwrap_or(self.settings.store_retry_delay)
                        .min(limiter.policy().backoff_max);
                    warn!(
                        entity_id = %entity.id,
                        attempt = store_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Store rate limited the patch, retrying"
                    );
                    outcome.retries.push(RetryEvent::StoreRateLimited {
                        attempt: store_retries,
                        delay_ms: delay.as_millis() as u64,
                    });
                    if let Err(interrupted) = limiter.sleep(delay).await {
                        return interrupted.into();
                    }
                }
                Err(e) => return Step::Stop(OutcomeState::Failed, Some(e.to_string())),
            }
        }

        info!(
            event = "entity_enriched",
            entity_id = %entity.id,
            value = %value,
            "Updated {kind}"
        );
        outcome.value = Some(value);
        Step::Continue(())
    }
}
