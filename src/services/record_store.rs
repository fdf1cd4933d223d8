//! Domain service for reading and patching companion records.
//!
//! This module provides the [`RecordStore`] trait, abstracting the tabular
//! backend that holds companions. The enrichment job only ever talks to this
//! trait; [`crate::clients::airtable::AirtableClient`] is the production
//! implementation.

use crate::domain::{AttributeDelta, Condition, Entity, EntityId, NewEntity};
use futures::stream::BoxStream;
use std::time::Duration;
use thiserror::Error;

/// Domain errors for record store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(EntityId),

    #[error("Record store rate limited the request")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Record store unavailable: {0}")]
    Unavailable(String),
}

/// Domain service trait for companion record access.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Lazily streams every record matching `filter`.
    ///
    /// Pages are fetched on demand, `page_size` records at a time, so callers
    /// that stop early never pay for the rest of the table.
    ///
    /// # Errors
    ///
    /// - Implementations back off and re-fetch a rate-limited page themselves;
    ///   [`StoreError::RateLimited`] is yielded only once their retries are spent
    /// - Yields [`StoreError::Unavailable`] if a page cannot be fetched; the
    ///   stream ends after the first error
    fn find<'a>(
        &'a self,
        filter: &'a Condition,
        page_size: usize,
    ) -> BoxStream<'a, Result<Entity, StoreError>>;

    /// Fetches the current state of a single record.
    ///
    /// # Errors
    ///
    /// - Returns [`StoreError::NotFound`] if the record was deleted
    async fn get(&self, id: &EntityId) -> Result<Entity, StoreError>;

    /// Writes only the fields named in `delta` and returns the updated record.
    ///
    /// Either every field in the delta is written or none is; other fields are
    /// never touched.
    ///
    /// # Errors
    ///
    /// - Returns [`StoreError::NotFound`] if the record does not exist
    /// - Returns [`StoreError::RateLimited`] if the backend throttled the write
    async fn patch(&self, id: &EntityId, delta: &AttributeDelta) -> Result<Entity, StoreError>;

    /// Inserts a new record.
    ///
    /// # Errors
    ///
    /// - Returns [`StoreError::Invalid`] if the backend rejects the payload
    async fn create(&self, entity: &NewEntity) -> Result<Entity, StoreError>;
}
