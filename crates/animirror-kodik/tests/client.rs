use animirror_kodik::{KodikClient, KodikError};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{TimeZone, Utc};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

struct Stub {
    pages: Vec<Vec<Value>>,
    list_hits: AtomicUsize,
    fail_first: AtomicUsize,
    always_429: bool,
}

impl Stub {
    fn new(pages: Vec<Vec<Value>>) -> Arc<Self> {
        Arc::new(Self {
            pages,
            list_hits: AtomicUsize::new(0),
            fail_first: AtomicUsize::new(0),
            always_429: false,
        })
    }
}

async fn list_handler(
    State(stub): State<Arc<Stub>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    stub.list_hits.fetch_add(1, Ordering::SeqCst);

    if stub.always_429 {
        let mut headers = HeaderMap::new();
        headers.insert("Retry-After", "1".parse().unwrap());
        return (StatusCode::TOO_MANY_REQUESTS, headers, Json(json!({}))).into_response();
    }
    if stub
        .fail_first
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({}))).into_response();
    }

    let page: usize = params
        .get("next")
        .and_then(|cursor| cursor.parse().ok())
        .unwrap_or(0);
    let results = stub.pages.get(page).cloned().unwrap_or_default();
    let next_page = if page + 1 < stub.pages.len() {
        Some(format!("https://stub.local/list?next={}", page + 1))
    } else {
        None
    };
    Json(json!({ "results": results, "next_page": next_page })).into_response()
}

async fn playlist_handler(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    if params.get("id").map(String::as_str) == Some("404") {
        return (StatusCode::NOT_FOUND, String::new()).into_response();
    }
    let link = format!(
        "https://cdn.stub.local/{}/{}/{}.m3u8",
        params.get("id").cloned().unwrap_or_default(),
        params.get("translation_id").cloned().unwrap_or_default(),
        params.get("seria").cloned().unwrap_or_default(),
    );
    link.into_response()
}

async fn serve(stub: Arc<Stub>) -> String {
    let app = Router::new()
        .route("/list", get(list_handler))
        .route("/playlist", get(playlist_handler))
        .with_state(stub);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub");
    let addr = listener.local_addr().expect("stub addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

fn client(base: &str) -> KodikClient {
    KodikClient::new(Some("test-token".to_string()), 1000)
        .expect("client")
        .with_base_url(base.to_string())
        .with_retry(3, Duration::from_millis(10))
}

fn item(id: &str, updated_at: &str) -> Value {
    json!({ "id": id, "title": id, "updated_at": updated_at })
}

#[tokio::test]
async fn fetch_full_list_follows_cursor_until_exhausted() {
    let stub = Stub::new(vec![
        vec![item("a", "2024-03-03T00:00:00Z"), item("b", "2024-03-02T00:00:00Z")],
        vec![item("c", "2024-03-01T00:00:00Z")],
    ]);
    let base = serve(stub.clone()).await;

    let items = client(&base).fetch_full_list(50, None).await.expect("list");

    assert_eq!(items.len(), 3);
    assert_eq!(stub.list_hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn fetch_full_list_honors_max_pages() {
    let stub = Stub::new(vec![
        vec![item("a", "2024-03-03T00:00:00Z")],
        vec![item("b", "2024-03-02T00:00:00Z")],
        vec![item("c", "2024-03-01T00:00:00Z")],
    ]);
    let base = serve(stub.clone()).await;

    let items = client(&base)
        .fetch_full_list(50, Some(2))
        .await
        .expect("list");

    assert_eq!(items.len(), 2);
    assert_eq!(stub.list_hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn fetch_full_list_rejects_out_of_range_page_size() {
    let stub = Stub::new(vec![]);
    let base = serve(stub).await;
    let c = client(&base);

    assert!(matches!(
        c.fetch_full_list(0, None).await,
        Err(KodikError::InvalidInput(_))
    ));
    assert!(matches!(
        c.fetch_full_list(101, None).await,
        Err(KodikError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn fetch_delta_short_circuits_on_first_stale_item() {
    // Page 1 is fully fresh; page 2 goes stale on its second item; page 3
    // must never be requested.
    let stub = Stub::new(vec![
        vec![item("a", "2024-03-05T00:00:00Z"), item("b", "2024-03-04T00:00:00Z")],
        vec![item("c", "2024-03-03T00:00:00Z"), item("d", "2024-02-01T00:00:00Z")],
        vec![item("e", "2024-01-01T00:00:00Z")],
    ]);
    let base = serve(stub.clone()).await;
    let cutoff = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();

    let items = client(&base)
        .fetch_delta(cutoff, 50, None)
        .await
        .expect("delta");

    let ids: Vec<&str> = items
        .iter()
        .map(|value| value.get("id").and_then(Value::as_str).unwrap())
        .collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert_eq!(stub.list_hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn fetch_delta_skips_items_without_timestamps() {
    let stub = Stub::new(vec![vec![
        item("a", "2024-03-05T00:00:00Z"),
        json!({ "id": "no-ts", "title": "no-ts" }),
        item("b", "2024-03-04T00:00:00Z"),
    ]]);
    let base = serve(stub).await;
    let cutoff = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();

    let items = client(&base)
        .fetch_delta(cutoff, 50, None)
        .await
        .expect("delta");

    let ids: Vec<&str> = items
        .iter()
        .map(|value| value.get("id").and_then(Value::as_str).unwrap())
        .collect();
    assert_eq!(ids, vec!["a", "b"]);
}

#[tokio::test]
async fn transient_server_errors_are_retried() {
    let stub = Stub::new(vec![vec![item("a", "2024-03-03T00:00:00Z")]]);
    stub.fail_first.store(2, Ordering::SeqCst);
    let base = serve(stub.clone()).await;

    let items = client(&base).fetch_full_list(50, None).await.expect("list");

    assert_eq!(items.len(), 1);
    // Two failed attempts plus the one that succeeded.
    assert_eq!(stub.list_hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn rate_limit_surfaces_after_exhausted_retries() {
    let mut inner = Stub::new(vec![vec![]]);
    Arc::get_mut(&mut inner).unwrap().always_429 = true;
    let base = serve(inner.clone()).await;

    let err = client(&base).fetch_full_list(50, None).await.unwrap_err();

    assert!(matches!(
        err,
        KodikError::RateLimited {
            retry_after: Some(_)
        }
    ));
    assert_eq!(inner.list_hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn playlist_resolves_url_text() {
    let stub = Stub::new(vec![]);
    let base = serve(stub).await;
    let ids = json!({ "shikimori": "5114" });

    let link = client(&base)
        .get_episode_playlist(&ids, 10, 3, 720)
        .await
        .expect("playlist");

    assert_eq!(link, "https://cdn.stub.local/5114/10/3.m3u8");
}

#[tokio::test]
async fn playlist_maps_missing_upstream_entry_to_not_found() {
    let stub = Stub::new(vec![]);
    let base = serve(stub).await;
    let ids = json!({ "shikimori": "404" });

    let err = client(&base)
        .get_episode_playlist(&ids, 10, 3, 720)
        .await
        .unwrap_err();
    assert!(matches!(err, KodikError::NotFound(_)));
}

#[tokio::test]
async fn playlist_validates_inputs_before_any_call() {
    let stub = Stub::new(vec![]);
    let base = serve(stub.clone()).await;
    let c = client(&base);

    assert!(matches!(
        c.get_episode_playlist(&json!({"shikimori": "1"}), 10, 3, 540)
            .await,
        Err(KodikError::InvalidInput(_))
    ));
    assert!(matches!(
        c.get_episode_playlist(&json!({}), 10, 3, 720).await,
        Err(KodikError::NotFound(_))
    ));
    assert_eq!(stub.list_hits.load(Ordering::SeqCst), 0);
}
