pub mod record_store;
pub use record_store::{RecordStore, StoreError};

pub mod generator;
pub mod generator_impl;
pub use generator::{Artifact, GenError, GenerationParams, Generator};
pub use generator_impl::HttpGenerator;

pub mod materializer;
pub use materializer::{FsMaterializer, MaterializeError, Materializer};

pub mod rate_limit;
pub use rate_limit::{Interrupted, RateLimitPolicy, RateLimiter};

pub mod prompts;

pub mod strategy;
pub use strategy::{AttributeStrategy, Eligibility};

pub mod enrichment;
pub use enrichment::{
    Candidate, EnrichmentJob, EntityOutcome, FailureRecord, JobError, JobSettings, OutcomeState,
    Plan, RetryEvent, RunSummary,
};
