//! In-memory stand-ins for the record store, generator and materializer.

#![allow(dead_code)]

use companion_enricher::config::Config;
use companion_enricher::domain::{
    AttributeDelta, AttributeKind, Condition, Entity, EntityId, GenerationKind, NewEntity,
};
use companion_enricher::services::{
    Artifact, AttributeStrategy, EnrichmentJob, GenError, GenerationParams, Generator,
    JobSettings, MaterializeError, Materializer, RateLimitPolicy, RecordStore, StoreError,
};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type GetHook = Box<dyn Fn(&mut Entity) + Send + Sync>;

#[derive(Default)]
pub struct FakeStore {
    records: Mutex<Vec<Entity>>,
    pub patches: Mutex<Vec<(EntityId, AttributeDelta)>>,
    patch_errors: Mutex<VecDeque<StoreError>>,
    find_error: Mutex<Option<StoreError>>,
    on_get: Mutex<Option<GetHook>>,
}

impl FakeStore {
    pub fn with_records(records: Vec<Entity>) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(records),
            ..Self::default()
        })
    }

    pub fn record(&self, id: &str) -> Entity {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.id.as_str() == id)
            .cloned()
            .expect("record exists")
    }

    pub fn patch_count(&self) -> usize {
        self.patches.lock().unwrap().len()
    }

    /// Queues errors returned by the next `patch` calls, in order.
    pub fn fail_next_patches(&self, errors: Vec<StoreError>) {
        self.patch_errors.lock().unwrap().extend(errors);
    }

    pub fn fail_find(&self, error: StoreError) {
        *self.find_error.lock().unwrap() = Some(error);
    }

    /// Mutates the stored record whenever it is fetched, simulating a concurrent writer.
    pub fn on_get(&self, hook: impl Fn(&mut Entity) + Send + Sync + 'static) {
        *self.on_get.lock().unwrap() = Some(Box::new(hook));
    }
}

#[async_trait::async_trait]
impl RecordStore for FakeStore {
    fn find<'a>(
        &'a self,
        filter: &'a Condition,
        _page_size: usize,
    ) -> BoxStream<'a, Result<Entity, StoreError>> {
        if let Some(error) = self.find_error.lock().unwrap().take() {
            return stream::iter(vec![Err(error)]).boxed();
        }

        let matching: Vec<Result<Entity, StoreError>> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .map(Ok)
            .collect();
        stream::iter(matching).boxed()
    }

    async fn get(&self, id: &EntityId) -> Result<Entity, StoreError> {
        let mut records = self.records.lock().unwrap();
        let entity = records
            .iter_mut()
            .find(|e| &e.id == id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if let Some(hook) = self.on_get.lock().unwrap().as_ref() {
            hook(entity);
        }
        Ok(entity.clone())
    }

    async fn patch(&self, id: &EntityId, delta: &AttributeDelta) -> Result<Entity, StoreError> {
        if let Some(error) = self.patch_errors.lock().unwrap().pop_front() {
            return Err(error);
        }

        let mut records = self.records.lock().unwrap();
        let entity = records
            .iter_mut()
            .find(|e| &e.id == id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        for (kind, value) in delta.iter() {
            entity.attributes.insert(kind, Some(value.to_string()));
        }
        self.patches
            .lock()
            .unwrap()
            .push((id.clone(), delta.clone()));
        Ok(entity.clone())
    }

    async fn create(&self, new: &NewEntity) -> Result<Entity, StoreError> {
        let mut records = self.records.lock().unwrap();
        let mut entity = Entity::new(format!("rec{}", records.len() + 1).as_str(), new.name.clone());
        entity.slug.clone_from(&new.slug);
        entity.traits = new.traits.clone();
        entity.visibility = new.visibility;
        records.push(entity.clone());
        Ok(entity)
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorCall {
    pub at: Instant,
    pub kind: GenerationKind,
    pub params: GenerationParams,
}

type CallHook = Box<dyn Fn(usize) + Send + Sync>;

/// Returns scripted results in order, then succeeds for every later call.
#[derive(Default)]
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<Artifact, GenError>>>,
    repeat_error: Mutex<Option<fn() -> GenError>>,
    pub calls: Mutex<Vec<GeneratorCall>>,
    on_call: Mutex<Option<CallHook>>,
}

impl ScriptedGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripted(results: Vec<Result<Artifact, GenError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(results.into()),
            ..Self::default()
        })
    }

    /// Fails every call with the error `make` builds.
    pub fn always_failing(make: fn() -> GenError) -> Arc<Self> {
        Arc::new(Self {
            repeat_error: Mutex::new(Some(make)),
            ..Self::default()
        })
    }

    /// Runs `hook` with the 1-based call number before each call returns.
    pub fn on_call(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.on_call.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|c| c.at).collect()
    }
}

#[async_trait::async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(
        &self,
        kind: GenerationKind,
        params: &GenerationParams,
    ) -> Result<Artifact, GenError> {
        let number = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(GeneratorCall {
                at: Instant::now(),
                kind,
                params: params.clone(),
            });
            calls.len()
        };

        if let Some(hook) = self.on_call.lock().unwrap().as_ref() {
            hook(number);
        }

        if let Some(result) = self.script.lock().unwrap().pop_front() {
            return result;
        }
        if let Some(make) = *self.repeat_error.lock().unwrap() {
            return Err(make());
        }

        Ok(match kind {
            GenerationKind::Image => {
                Artifact::RemoteUrl(format!("https://replicate.delivery/out/{number}.webp"))
            }
            GenerationKind::Text => Artifact::Text(format!("Generated text {number}")),
        })
    }
}

#[derive(Default)]
pub struct FakeMaterializer {
    pub calls: Mutex<Vec<(String, String)>>,
    fail: Mutex<bool>,
}

impl FakeMaterializer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: Mutex::new(true),
            ..Self::default()
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Materializer for FakeMaterializer {
    async fn materialize(
        &self,
        remote_url: &str,
        stable_key: &str,
    ) -> Result<String, MaterializeError> {
        self.calls
            .lock()
            .unwrap()
            .push((remote_url.to_string(), stable_key.to_string()));

        if *self.fail.lock().unwrap() {
            return Err(MaterializeError::WriteFailed("disk full".to_string()));
        }
        Ok(format!("https://cdn.test/avatars/{stable_key}.webp"))
    }
}

pub fn entity(id: &str, name: &str, avatar: Option<&str>) -> Entity {
    Entity::new(id, name).with_attribute(AttributeKind::Avatar, avatar)
}

/// Test configuration with short, deterministic pacing.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.job.min_request_interval_ms = 4000;
    config.job.batch_size = 5;
    config.job.breather_seconds = 5;
    config.job.backoff_base_ms = 1000;
    config.job.backoff_max_ms = 8000;
    config.job.store_retry_delay_ms = 500;
    config
}

pub struct Harness {
    pub store: Arc<FakeStore>,
    pub generator: Arc<ScriptedGenerator>,
    pub materializer: Arc<FakeMaterializer>,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn new(records: Vec<Entity>) -> Self {
        Self {
            store: FakeStore::with_records(records),
            generator: ScriptedGenerator::new(),
            materializer: FakeMaterializer::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn job(&self, kind: AttributeKind, config: &Config, dry_run: bool) -> EnrichmentJob {
        let strategy =
            AttributeStrategy::new(kind, &config.job, config.traits.clone(), "blurry").unwrap();
        let mut settings = JobSettings::from_config(config);
        settings.dry_run = dry_run;

        EnrichmentJob::new(
            strategy,
            self.store.clone(),
            settings,
            RateLimitPolicy::from(&config.job),
            self.cancel.clone(),
        )
        .with_generator(self.generator.clone())
        .with_materializer(self.materializer.clone())
    }
}
