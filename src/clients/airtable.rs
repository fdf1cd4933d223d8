//! Airtable REST client implementing [`RecordStore`].
//!
//! Store-neutral [`Condition`]s are rendered as `filterByFormula`
//! expressions, and list results are streamed page by page following the
//! `offset` cursor. A rate-limited page is re-fetched in place after a
//! backoff.

use crate::clients::retry_after_from_headers;
use crate::config::{StoreConfig, StoreFieldsConfig};
use crate::domain::{
    AttributeDelta, AttributeKind, Condition, Entity, EntityId, Field, NewEntity, TraitKind,
    Visibility,
};
use crate::services::record_store::{RecordStore, StoreError};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
struct ListResponse {
    records: Vec<AirtableRecord>,
    offset: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AirtableRecord {
    id: String,
    #[serde(rename = "createdTime")]
    created_time: Option<String>,
    #[serde(default)]
    fields: Map<String, Value>,
}

enum PageCursor {
    First,
    Next(String),
    Done,
}

/// [`RecordStore`] backed by an Airtable table.
#[derive(Clone)]
pub struct AirtableClient {
    client: Client,
    api_url: String,
    base_id: String,
    table: String,
    token: String,
    fields: StoreFieldsConfig,
    page_delay: Duration,
    max_page_retries: u32,
    page_retry_delay: Duration,
    max_page_retry_delay: Duration,
}

impl AirtableClient {
    #[must_use]
    pub fn new(client: Client, config: &StoreConfig, base_id: &str, token: &str) -> Self {
        Self {
            client,
            api_url: config.api_url.clone(),
            base_id: base_id.to_string(),
            table: config.table.clone(),
            token: token.to_string(),
            fields: config.fields.clone(),
            page_delay: Duration::from_millis(config.page_delay_ms),
            max_page_retries: 3,
            page_retry_delay: Duration::from_secs(1),
            max_page_retry_delay: Duration::from_secs(60),
        }
    }

    /// How often a rate-limited page fetch is retried, and how long to wait
    /// when the store gives no `Retry-After` hint. Waits never exceed `max_delay`.
    #[must_use]
    pub const fn with_page_retries(
        mut self,
        max_retries: u32,
        delay: Duration,
        max_delay: Duration,
    ) -> Self {
        self.max_page_retries = max_retries;
        self.page_retry_delay = delay;
        self.max_page_retry_delay = max_delay;
        self
    }

    fn column(&self, field: Field) -> &str {
        let f = &self.fields;
        match field {
            Field::Name => &f.name,
            Field::Slug => &f.slug,
            Field::Attribute(kind) => self.attribute_column(kind),
            Field::Trait(kind) => self.trait_column(kind),
            Field::CreatedBy => &f.created_by,
            Field::Visibility => &f.visibility,
        }
    }

    fn attribute_column(&self, kind: AttributeKind) -> &str {
        match kind {
            AttributeKind::Avatar => &self.fields.avatar,
            AttributeKind::Description => &self.fields.description,
            AttributeKind::Greeting => &self.fields.greeting,
        }
    }

    fn trait_column(&self, kind: TraitKind) -> &str {
        match kind {
            TraitKind::Style => &self.fields.style,
            TraitKind::Sex => &self.fields.sex,
            TraitKind::Ethnicity => &self.fields.ethnicity,
            TraitKind::HairLength => &self.fields.hair_length,
            TraitKind::HairColor => &self.fields.hair_color,
            TraitKind::ContentFilter => &self.fields.content_filter,
        }
    }

    /// Renders a condition as an Airtable `filterByFormula` expression.
    ///
    /// `None` means no filter at all.
    fn render_formula(&self, condition: &Condition) -> Option<String> {
        match condition {
            Condition::Always => None,
            Condition::Blank(field) => Some(format!("{{{}}} = BLANK()", self.column(*field))),
            Condition::NotBlank(field) => {
                Some(format!("NOT({{{}}} = BLANK())", self.column(*field)))
            }
            Condition::Equals(Field::Visibility, value)
                if value.trim().eq_ignore_ascii_case(Visibility::Public.as_str()) =>
            {
                // Records without a visibility value are public.
                Some(format!(
                    "LOWER(TRIM({{{}}} & '')) != 'private'",
                    self.fields.visibility
                ))
            }
            Condition::Equals(field, value) => Some(format!(
                "LOWER(TRIM({{{}}} & '')) = '{}'",
                self.column(*field),
                escape_formula_string(&value.trim().to_lowercase())
            )),
            Condition::All(terms) => self.render_terms("AND", terms),
            Condition::Any(terms) => self.render_terms("OR", terms),
        }
    }

    fn render_terms(&self, op: &str, terms: &[Condition]) -> Option<String> {
        let rendered: Vec<String> = terms
            .iter()
            .map(|t| self.render_formula(t).unwrap_or_else(|| "TRUE()".to_string()))
            .collect();

        match rendered.len() {
            0 => None,
            1 => rendered.into_iter().next(),
            _ => Some(format!("{op}({})", rendered.join(", "))),
        }
    }

    fn table_url(&self, record: Option<&EntityId>) -> Result<Url, StoreError> {
        let mut url = Url::parse(&self.api_url)
            .map_err(|e| StoreError::Invalid(format!("invalid store url: {e}")))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| StoreError::Invalid("store url cannot be a base".to_string()))?;
            segments.pop_if_empty().push(&self.base_id).push(&self.table);
            if let Some(id) = record {
                segments.push(id.as_str());
            }
        }
        Ok(url)
    }

    async fn list_page(
        &self,
        formula: Option<&str>,
        page_size: usize,
        offset: Option<&str>,
    ) -> Result<ListResponse, StoreError> {
        let mut url = self.table_url(None)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("pageSize", &page_size.clamp(1, MAX_PAGE_SIZE).to_string());
            if let Some(formula) = formula {
                query.append_pair("filterByFormula", formula);
            }
            if let Some(offset) = offset {
                query.append_pair("offset", offset);
            }
        }

        debug!(url = %url, "Fetching record page");

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport_error)?;

        let response = check_status(response, None).await?;
        response
            .json::<ListResponse>()
            .await
            .map_err(|e| StoreError::Unavailable(format!("malformed list response: {e}")))
    }

    /// Fetches one page, re-fetching the same page while the store rate limits it.
    async fn list_page_with_retry(
        &self,
        formula: Option<&str>,
        page_size: usize,
        offset: Option<&str>,
    ) -> Result<ListResponse, StoreError> {
        let mut attempt = 0u32;
        loop {
            match self.list_page(formula, page_size, offset).await {
                Err(StoreError::RateLimited { retry_after }) if attempt < self.max_page_retries => {
                    attempt += 1;
                    let delay = retry_after
                        .unwrap_or(self.page_retry_delay)
                        .min(self.max_page_retry_delay);
                    warn!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Record page rate limited, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    async fn read_record(&self, response: Response) -> Result<Entity, StoreError> {
        let record: AirtableRecord = response
            .json()
            .await
            .map_err(|e| StoreError::Unavailable(format!("malformed record: {e}")))?;
        Ok(self.to_entity(record))
    }

    fn to_entity(&self, record: AirtableRecord) -> Entity {
        let f = &self.fields;
        let text = |column: &str| record.fields.get(column).and_then(field_text);

        let mut entity = Entity::new(record.id.as_str(), text(&f.name).unwrap_or_default());
        entity.slug = text(&f.slug);
        for kind in AttributeKind::ALL {
            entity
                .attributes
                .insert(kind, text(self.attribute_column(kind)));
        }
        for kind in [
            TraitKind::Style,
            TraitKind::Sex,
            TraitKind::Ethnicity,
            TraitKind::HairLength,
            TraitKind::HairColor,
            TraitKind::ContentFilter,
        ] {
            entity.traits.set(kind, text(self.trait_column(kind)));
        }
        entity.visibility = text(&f.visibility)
            .map_or(Visibility::Public, |v| Visibility::parse_lenient(&v));
        entity.created_by = text(&f.created_by);
        entity.created_at = text(&f.created_time)
            .or_else(|| record.created_time.clone())
            .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
            .map(|ts| ts.with_timezone(&Utc));

        entity
    }

    fn new_entity_fields(&self, entity: &NewEntity) -> Map<String, Value> {
        let f = &self.fields;
        let mut fields = Map::new();
        fields.insert(f.name.clone(), json!(entity.name));
        if let Some(slug) = &entity.slug {
            fields.insert(f.slug.clone(), json!(slug));
        }
        for kind in [
            TraitKind::Style,
            TraitKind::Sex,
            TraitKind::Ethnicity,
            TraitKind::HairLength,
            TraitKind::HairColor,
            TraitKind::ContentFilter,
        ] {
            if let Some(value) = entity.traits.get(kind) {
                fields.insert(self.trait_column(kind).to_string(), json!(value));
            }
        }
        fields.insert(f.visibility.clone(), json!(entity.visibility.as_str()));
        if let Some(created_by) = &entity.created_by {
            fields.insert(f.created_by.clone(), json!(created_by));
        }
        for (kind, value) in &entity.attributes {
            fields.insert(self.attribute_column(*kind).to_string(), json!(value));
        }
        fields
    }
}

#[async_trait::async_trait]
impl RecordStore for AirtableClient {
    fn find<'a>(
        &'a self,
        filter: &'a Condition,
        page_size: usize,
    ) -> BoxStream<'a, Result<Entity, StoreError>> {
        let formula = self.render_formula(filter);

        stream::try_unfold(PageCursor::First, move |cursor| {
            let formula = formula.clone();
            async move {
                let offset = match cursor {
                    PageCursor::Done => return Ok(None),
                    PageCursor::First => None,
                    PageCursor::Next(offset) => {
                        tokio::time::sleep(self.page_delay).await;
                        Some(offset)
                    }
                };

                let page = self
                    .list_page_with_retry(formula.as_deref(), page_size, offset.as_deref())
                    .await?;
                let next = page.offset.map_or(PageCursor::Done, PageCursor::Next);
                let entities: Vec<Entity> =
                    page.records.into_iter().map(|r| self.to_entity(r)).collect();

                Ok(Some((entities, next)))
            }
        })
        .map_ok(|entities| stream::iter(entities.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }

    async fn get(&self, id: &EntityId) -> Result<Entity, StoreError> {
        let url = self.table_url(Some(id))?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport_error)?;

        let response = check_status(response, Some(id)).await?;
        self.read_record(response).await
    }

    async fn patch(&self, id: &EntityId, delta: &AttributeDelta) -> Result<Entity, StoreError> {
        if delta.is_empty() {
            return self.get(id).await;
        }

        let fields: Map<String, Value> = delta
            .iter()
            .map(|(kind, value)| (self.attribute_column(kind).to_string(), json!(value)))
            .collect();

        let url = self.table_url(Some(id))?;
        let response = self
            .client
            .patch(url)
            .bearer_auth(&self.token)
            .json(&json!({ "fields": fields }))
            .send()
            .await
            .map_err(transport_error)?;

        let response = check_status(response, Some(id)).await?;
        self.read_record(response).await
    }

    async fn create(&self, entity: &NewEntity) -> Result<Entity, StoreError> {
        let url = self.table_url(None)?;
        let body = json!({
            "fields": self.new_entity_fields(entity),
            "typecast": true,
        });

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let response = check_status(response, None).await?;
        self.read_record(response).await
    }
}

fn transport_error(err: reqwest::Error) -> StoreError {
    StoreError::Unavailable(format!("request failed: {err}"))
}

async fn check_status(response: Response, id: Option<&EntityId>) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(StoreError::RateLimited {
            retry_after: retry_after_from_headers(response.headers()),
        });
    }

    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => id.map_or_else(
            || StoreError::Unavailable(format!("Airtable API error: {status} - {body}")),
            |id| StoreError::NotFound(id.clone()),
        ),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            StoreError::Invalid(format!("Airtable API error: {status} - {body}"))
        }
        _ => StoreError::Unavailable(format!("Airtable API error: {status} - {body}")),
    })
}

/// Flattens an Airtable cell into text.
///
/// Lookups and multi-selects arrive as arrays and attachments as objects with
/// a `url`; the first usable value wins.
fn field_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => items.iter().find_map(field_text),
        Value::Object(obj) => obj
            .get("url")
            .or_else(|| obj.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string),
        Value::Null => None,
    };
    text.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn escape_formula_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
