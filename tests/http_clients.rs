//! HTTP client tests against local fake provider servers.

use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use companion_enricher::clients::airtable::AirtableClient;
use companion_enricher::clients::openrouter::OpenRouterClient;
use companion_enricher::clients::replicate::ReplicateClient;
use companion_enricher::config::{
    GeneratorConfig, ImageGeneratorConfig, StoreConfig, TextGeneratorConfig,
};
use companion_enricher::domain::{
    AttributeDelta, AttributeKind, Condition, EntityId, Field, SafetyTier, TraitDefaults, Traits,
};
use companion_enricher::services::{
    FsMaterializer, GenError, GenerationParams, MaterializeError, Materializer, RecordStore,
    StoreError,
};
use futures::TryStreamExt;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Default)]
struct Captured {
    queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
    bodies: Arc<Mutex<Vec<Value>>>,
    hits: Arc<AtomicUsize>,
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake server");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("fake server");
    });
    format!("http://{addr}")
}

fn params(prompt: &str) -> GenerationParams {
    let (subject, _) = Traits::default().resolve(&TraitDefaults::default());
    GenerationParams {
        subject_name: "Aria".to_string(),
        subject,
        prompt: prompt.to_string(),
        instructions: Some("You are a creative writer.".to_string()),
        negative_prompt: Some("blurry".to_string()),
        safety: SafetyTier::Standard,
    }
}

fn markers() -> Vec<String> {
    GeneratorConfig::default().policy_markers
}

fn airtable_record(id: &str, name: &str, avatar: Option<&str>) -> Value {
    let mut fields = json!({ "Name": name, "sex": ["Female"] });
    if let Some(url) = avatar {
        fields["Avatar_URL"] = json!(url);
    }
    json!({ "id": id, "createdTime": "2024-05-01T12:00:00.000Z", "fields": fields })
}

fn store_client(base_url: &str) -> AirtableClient {
    let config = StoreConfig {
        api_url: format!("{base_url}/v0"),
        page_delay_ms: 0,
        ..StoreConfig::default()
    };
    AirtableClient::new(reqwest::Client::new(), &config, "appTest", "pat-test")
}

async fn list_records(
    State(captured): State<Captured>,
    Path((base, table)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    assert_eq!(base, "appTest");
    assert_eq!(table, "Characters");
    let offset = query.get("offset").cloned();
    captured.queries.lock().unwrap().push(query);

    match offset.as_deref() {
        None => Json(json!({
            "records": [
                airtable_record("rec1", "Aria", None),
                airtable_record("rec2", "Bella", Some("https://replicate.delivery/x/out-0.webp")),
            ],
            "offset": "page2",
        })),
        Some("page2") => Json(json!({ "records": [airtable_record("rec3", "Cora", None)] })),
        Some(other) => panic!("unexpected offset {other}"),
    }
}

async fn patch_record(
    State(captured): State<Captured>,
    Path((_, _, id)): Path<(String, String, String)>,
    Json(body): Json<Value>,
) -> Json<Value> {
    captured.bodies.lock().unwrap().push(body.clone());
    let avatar = body["fields"]["Avatar_URL"].as_str().map(str::to_string);
    Json(airtable_record(&id, "Aria", avatar.as_deref()))
}

async fn get_record(Path((_, _, id)): Path<(String, String, String)>) -> impl IntoResponse {
    match id.as_str() {
        "recLimited" => (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, "3")],
            Json(json!({ "error": "RATE_LIMIT_REACHED" })),
        )
            .into_response(),
        "recGone" => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "NOT_FOUND" })),
        )
            .into_response(),
        _ => Json(airtable_record(&id, "Aria", None)).into_response(),
    }
}

fn airtable_app(captured: Captured) -> Router {
    Router::new()
        .route("/v0/{base}/{table}", get(list_records))
        .route(
            "/v0/{base}/{table}/{id}",
            get(get_record).patch(patch_record),
        )
        .with_state(captured)
}

#[tokio::test]
async fn test_airtable_find_follows_offsets() {
    let captured = Captured::default();
    let base_url = serve(airtable_app(captured.clone())).await;
    let store = store_client(&base_url);

    let filter = Condition::all([
        Condition::NotBlank(Field::Name),
        Condition::Blank(Field::Attribute(AttributeKind::Avatar)),
    ]);
    let entities: Vec<_> = store
        .find(&filter, 2)
        .try_collect()
        .await
        .expect("all pages fetched");

    let ids: Vec<&str> = entities.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["rec1", "rec2", "rec3"]);
    assert_eq!(
        entities[1].attribute(AttributeKind::Avatar),
        Some("https://replicate.delivery/x/out-0.webp")
    );
    assert_eq!(entities[0].traits.sex.as_deref(), Some("Female"));
    assert!(entities[0].created_at.is_some());

    let queries = captured.queries.lock().unwrap().clone();
    assert_eq!(queries.len(), 2);
    assert_eq!(queries[0].get("pageSize").map(String::as_str), Some("2"));
    assert_eq!(
        queries[0].get("filterByFormula").map(String::as_str),
        Some("AND(NOT({Name} = BLANK()), {Avatar_URL} = BLANK())")
    );
    assert_eq!(queries[1].get("offset").map(String::as_str), Some("page2"));
}

#[tokio::test]
async fn test_airtable_patch_sends_only_changed_fields() {
    let captured = Captured::default();
    let base_url = serve(airtable_app(captured.clone())).await;
    let store = store_client(&base_url);

    let delta = AttributeDelta::single(
        AttributeKind::Avatar,
        "https://cdn.test/avatars/aria-1.webp",
    );
    let updated = store
        .patch(&EntityId::new("rec1"), &delta)
        .await
        .expect("patch succeeds");

    assert_eq!(
        updated.attribute(AttributeKind::Avatar),
        Some("https://cdn.test/avatars/aria-1.webp")
    );
    let bodies = captured.bodies.lock().unwrap().clone();
    assert_eq!(
        bodies,
        vec![json!({ "fields": { "Avatar_URL": "https://cdn.test/avatars/aria-1.webp" } })]
    );
}

#[tokio::test]
async fn test_airtable_error_statuses_are_classified() {
    let base_url = serve(airtable_app(Captured::default())).await;
    let store = store_client(&base_url);

    let limited = store.get(&EntityId::new("recLimited")).await;
    assert!(matches!(
        limited,
        Err(StoreError::RateLimited { retry_after: Some(d) }) if d == Duration::from_secs(3)
    ));

    let gone = store.get(&EntityId::new("recGone")).await;
    assert!(matches!(gone, Err(StoreError::NotFound(id)) if id.as_str() == "recGone"));
}

async fn throttled_list_records(
    State(captured): State<Captured>,
    Query(query): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let offset = query.get("offset").cloned();
    captured.queries.lock().unwrap().push(query);

    match offset {
        None => Json(json!({
            "records": [airtable_record("rec1", "Aria", None)],
            "offset": "page2",
        }))
        .into_response(),
        Some(_) if captured.hits.fetch_add(1, Ordering::SeqCst) == 0 => (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, "0")],
            Json(json!({ "error": "RATE_LIMIT_REACHED" })),
        )
            .into_response(),
        Some(_) => Json(json!({ "records": [airtable_record("rec2", "Bella", None)] })).into_response(),
    }
}

#[tokio::test]
async fn test_airtable_find_refetches_throttled_page() {
    let captured = Captured::default();
    let app = Router::new()
        .route("/v0/{base}/{table}", get(throttled_list_records))
        .with_state(captured.clone());
    let base_url = serve(app).await;
    let store = store_client(&base_url).with_page_retries(
        2,
        Duration::from_millis(10),
        Duration::from_secs(1),
    );

    let entities: Vec<_> = store
        .find(&Condition::Always, 1)
        .try_collect()
        .await
        .expect("throttled page is retried");

    let ids: Vec<&str> = entities.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["rec1", "rec2"]);

    let queries = captured.queries.lock().unwrap().clone();
    assert_eq!(queries.len(), 3);
    assert_eq!(queries[1].get("offset").map(String::as_str), Some("page2"));
    assert_eq!(queries[2].get("offset").map(String::as_str), Some("page2"));
}

#[tokio::test]
async fn test_airtable_find_gives_up_after_page_retries() {
    let captured = Captured::default();
    let app = Router::new()
        .route(
            "/v0/{base}/{table}",
            get(|State(c): State<Captured>| async move {
                c.hits.fetch_add(1, Ordering::SeqCst);
                StatusCode::TOO_MANY_REQUESTS
            }),
        )
        .with_state(captured.clone());
    let base_url = serve(app).await;
    let store = store_client(&base_url).with_page_retries(
        1,
        Duration::from_millis(10),
        Duration::from_secs(1),
    );

    let result: Result<Vec<_>, _> = store.find(&Condition::Always, 10).try_collect().await;

    assert!(matches!(result, Err(StoreError::RateLimited { .. })));
    assert_eq!(captured.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_airtable_server_error_is_not_retried() {
    let captured = Captured::default();
    let app = Router::new()
        .route(
            "/v0/{base}/{table}",
            get(|State(c): State<Captured>| async move {
                c.hits.fetch_add(1, Ordering::SeqCst);
                StatusCode::INTERNAL_SERVER_ERROR
            }),
        )
        .with_state(captured.clone());
    let base_url = serve(app).await;
    let store = store_client(&base_url).with_page_retries(
        3,
        Duration::from_millis(10),
        Duration::from_secs(1),
    );

    let result: Result<Vec<_>, _> = store.find(&Condition::Always, 10).try_collect().await;

    assert!(matches!(result, Err(StoreError::Unavailable(_))));
    assert_eq!(captured.hits.load(Ordering::SeqCst), 1);
}

fn replicate_client(base_url: &str) -> ReplicateClient {
    let config = ImageGeneratorConfig {
        api_url: format!("{base_url}/v1"),
        poll_interval_ms: 10,
        timeout_seconds: 5,
        ..ImageGeneratorConfig::default()
    };
    ReplicateClient::new(reqwest::Client::new(), "r8-test", config, markers())
}

#[tokio::test]
async fn test_replicate_polls_until_succeeded() {
    let captured = Captured::default();
    let app = Router::new()
        .route(
            "/v1/predictions",
            axum::routing::post(
                |State(c): State<Captured>, Json(body): Json<Value>| async move {
                    c.bodies.lock().unwrap().push(body);
                    (
                        StatusCode::CREATED,
                        Json(json!({ "id": "pred1", "status": "starting" })),
                    )
                },
            ),
        )
        .route(
            "/v1/predictions/{id}",
            get(|State(c): State<Captured>| async move {
                if c.hits.fetch_add(1, Ordering::SeqCst) == 0 {
                    Json(json!({ "id": "pred1", "status": "processing" }))
                } else {
                    Json(json!({
                        "id": "pred1",
                        "status": "succeeded",
                        "output": ["https://replicate.delivery/pbxt/out-0.png"],
                    }))
                }
            }),
        )
        .with_state(captured.clone());
    let base_url = serve(app).await;

    let url = replicate_client(&base_url)
        .generate_image(&params("portrait of Aria"))
        .await
        .expect("prediction succeeds");

    assert_eq!(url, "https://replicate.delivery/pbxt/out-0.png");
    assert_eq!(captured.hits.load(Ordering::SeqCst), 2);

    let submitted = captured.bodies.lock().unwrap()[0].clone();
    assert_eq!(submitted["input"]["prompt"], "portrait of Aria");
    assert_eq!(submitted["input"]["negative_prompt"], "blurry");
    assert_eq!(submitted["input"]["width"], 768);
}

#[tokio::test]
async fn test_replicate_nsfw_failure_is_policy_rejection() {
    let app = Router::new()
        .route(
            "/v1/predictions",
            axum::routing::post(|| async {
                Json(json!({ "id": "pred2", "status": "starting" }))
            }),
        )
        .route(
            "/v1/predictions/{id}",
            get(|| async {
                Json(json!({
                    "id": "pred2",
                    "status": "failed",
                    "error": "NSFW content detected. Try running it again, or try a different prompt.",
                }))
            }),
        );
    let base_url = serve(app).await;

    let result = replicate_client(&base_url)
        .generate_image(&params("portrait of Dana"))
        .await;

    assert!(matches!(result, Err(GenError::PolicyRejected(_))));
}

#[tokio::test]
async fn test_replicate_rate_limit_reads_body_hint() {
    let app = Router::new().route(
        "/v1/predictions",
        axum::routing::post(|| async {
            (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "detail": "Request was throttled.", "retry_after": 7 })),
            )
        }),
    );
    let base_url = serve(app).await;

    let result = replicate_client(&base_url)
        .generate_image(&params("portrait of Aria"))
        .await;

    assert!(matches!(
        result,
        Err(GenError::RateLimited { retry_after: Some(d) }) if d == Duration::from_secs(7)
    ));
}

#[tokio::test]
async fn test_replicate_times_out_on_stuck_prediction() {
    let app = Router::new()
        .route(
            "/v1/predictions",
            axum::routing::post(|| async {
                Json(json!({ "id": "pred3", "status": "starting" }))
            }),
        )
        .route(
            "/v1/predictions/{id}",
            get(|| async { Json(json!({ "id": "pred3", "status": "processing" })) }),
        );
    let base_url = serve(app).await;

    let config = ImageGeneratorConfig {
        api_url: format!("{base_url}/v1"),
        poll_interval_ms: 10,
        timeout_seconds: 0,
        ..ImageGeneratorConfig::default()
    };
    let client = ReplicateClient::new(reqwest::Client::new(), "r8-test", config, markers());

    let result = client.generate_image(&params("portrait of Aria")).await;
    assert!(matches!(result, Err(GenError::Timeout(_))));
}

fn openrouter_client(base_url: &str) -> OpenRouterClient {
    let config = TextGeneratorConfig {
        api_url: base_url.to_string(),
        referer: Some("https://companions.test".to_string()),
        ..TextGeneratorConfig::default()
    };
    OpenRouterClient::new(reqwest::Client::new(), "or-test", config, markers())
}

#[tokio::test]
async fn test_openrouter_returns_first_choice() {
    let captured = Captured::default();
    let app = Router::new()
        .route(
            "/chat/completions",
            axum::routing::post(
                |State(c): State<Captured>,
                 headers: axum::http::HeaderMap,
                 Json(body): Json<Value>| async move {
                    assert_eq!(
                        headers.get("http-referer").and_then(|v| v.to_str().ok()),
                        Some("https://companions.test")
                    );
                    c.bodies.lock().unwrap().push(body);
                    Json(json!({
                        "choices": [{
                            "message": { "role": "assistant", "content": "  Aria hums while she paints.  " },
                            "finish_reason": "stop",
                        }],
                    }))
                },
            ),
        )
        .with_state(captured.clone());
    let base_url = serve(app).await;

    let text = openrouter_client(&base_url)
        .complete(&params("Write a description for Aria"))
        .await
        .expect("completion succeeds");

    assert_eq!(text.trim(), "Aria hums while she paints.");
    let body = captured.bodies.lock().unwrap()[0].clone();
    assert_eq!(body["model"], TextGeneratorConfig::default().model);
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][1]["content"], "Write a description for Aria");
}

#[tokio::test]
async fn test_openrouter_content_filter_is_policy_rejection() {
    let app = Router::new().route(
        "/chat/completions",
        axum::routing::post(|| async {
            Json(json!({
                "choices": [{ "message": { "content": "" }, "finish_reason": "content_filter" }],
            }))
        }),
    );
    let base_url = serve(app).await;

    let result = openrouter_client(&base_url)
        .complete(&params("Write greetings for Dana"))
        .await;

    assert!(matches!(result, Err(GenError::PolicyRejected(_))));
}

#[tokio::test]
async fn test_openrouter_embedded_rate_limit_error() {
    let app = Router::new().route(
        "/chat/completions",
        axum::routing::post(|| async {
            Json(json!({ "error": { "message": "Rate limit exceeded", "code": 429 } }))
        }),
    );
    let base_url = serve(app).await;

    let result = openrouter_client(&base_url)
        .complete(&params("Write a description for Aria"))
        .await;

    assert!(matches!(result, Err(GenError::RateLimited { .. })));
}

fn temp_output_dir() -> std::path::PathBuf {
    std::env::temp_dir().join(format!("companion-enricher-test-{}", uuid::Uuid::new_v4()))
}

fn part_files(dir: &std::path::Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .expect("read output dir")
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".part"))
        .collect()
}

#[tokio::test]
async fn test_materializer_writes_durable_copy() {
    let app = Router::new().route(
        "/out/{file}",
        get(|| async { ([(header::CONTENT_TYPE, "image/png")], vec![0x89, b'P', b'N', b'G']) }),
    );
    let base_url = serve(app).await;
    let dir = temp_output_dir();
    let materializer = FsMaterializer::new(
        reqwest::Client::new(),
        dir.clone(),
        "https://cdn.test/avatars/",
        "webp",
    );

    let url = materializer
        .materialize(&format!("{base_url}/out/out-0"), "aria-1700000000000")
        .await
        .expect("materialize succeeds");

    assert_eq!(url, "https://cdn.test/avatars/aria-1700000000000.png");
    let written = std::fs::read(dir.join("aria-1700000000000.png")).expect("file written");
    assert_eq!(written, vec![0x89, b'P', b'N', b'G']);

    assert!(part_files(&dir).is_empty());

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_materializer_download_failure_writes_nothing() {
    let app = Router::new().route(
        "/out/{file}",
        get(|| async { StatusCode::NOT_FOUND }),
    );
    let base_url = serve(app).await;
    let dir = temp_output_dir();
    let materializer =
        FsMaterializer::new(reqwest::Client::new(), dir.clone(), "https://cdn.test", "webp");

    let result = materializer
        .materialize(&format!("{base_url}/out/expired.webp"), "bella-1")
        .await;

    assert!(matches!(result, Err(MaterializeError::DownloadFailed(_))));
    assert!(!dir.join("bella-1.webp").exists());
}

#[tokio::test]
async fn test_materializer_rejects_empty_body() {
    let app = Router::new().route(
        "/out/{file}",
        get(|| async { ([(header::CONTENT_TYPE, "image/png")], Vec::<u8>::new()) }),
    );
    let base_url = serve(app).await;
    let dir = temp_output_dir();
    let materializer =
        FsMaterializer::new(reqwest::Client::new(), dir.clone(), "https://cdn.test", "webp");

    let result = materializer
        .materialize(&format!("{base_url}/out/out-0.png"), "carla-1")
        .await;

    assert!(matches!(result, Err(MaterializeError::DownloadFailed(_))));
    assert!(!dir.join("carla-1.png").exists());
    assert!(!dir.join("carla-1.png.part").exists());
}

#[tokio::test]
async fn test_materializer_write_failure_removes_partial_file() {
    let app = Router::new().route(
        "/out/{file}",
        get(|| async { ([(header::CONTENT_TYPE, "image/png")], vec![0x89, b'P', b'N', b'G']) }),
    );
    let base_url = serve(app).await;
    let dir = temp_output_dir();
    // A directory at the final path makes the rename fail.
    std::fs::create_dir_all(dir.join("dana-1.png")).expect("create blocking dir");
    let materializer =
        FsMaterializer::new(reqwest::Client::new(), dir.clone(), "https://cdn.test", "webp");

    let result = materializer
        .materialize(&format!("{base_url}/out/out-0"), "dana-1")
        .await;

    assert!(matches!(result, Err(MaterializeError::WriteFailed(_))));
    assert!(dir.join("dana-1.png").is_dir());
    assert!(part_files(&dir).is_empty());

    let _ = std::fs::remove_dir_all(&dir);
}
