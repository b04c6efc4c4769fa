use animirror_ingest::{DeltaSyncOptions, DeltaSyncWorker};
use animirror_kodik::KodikClient;
use animirror_util::shutdown_channel;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

async fn serve_stale_catalog() -> String {
    // Everything upstream predates any reasonable lookback window, so a
    // sync tick fetches one page and ingests nothing.
    let app = Router::new().route(
        "/list",
        get(|| async {
            Json(json!({
                "results": [
                    {"id": "old", "title": "Old", "updated_at": "2000-01-01T00:00:00Z"},
                ],
                "next_page": null,
            }))
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub");
    let addr = listener.local_addr().expect("stub addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

fn worker(base: &str) -> (animirror_util::ShutdownHandle, Arc<DeltaSyncWorker>) {
    let client = KodikClient::new(None, 1000)
        .expect("client")
        .with_base_url(base.to_string());
    let db = PgPool::connect_lazy("postgres://localhost/unreachable").expect("lazy pool");
    let (handle, shutdown) = shutdown_channel();
    let options = DeltaSyncOptions {
        sync_interval: Duration::from_secs(3600),
        ..DeltaSyncOptions::default()
    };
    (
        handle,
        Arc::new(DeltaSyncWorker::new(Arc::new(client), db, options, shutdown)),
    )
}

#[tokio::test]
async fn empty_delta_updates_stats_without_touching_the_db() {
    let base = serve_stale_catalog().await;
    let (_handle, worker) = worker(&base);

    let stats = worker.sync(None).await.expect("sync");

    assert_eq!(stats.total_fetched, 0);
    assert_eq!(stats.total_imported, 0);
    assert!(stats.last_sync_at.is_some());
}

#[tokio::test]
async fn start_loop_exits_on_shutdown() {
    let base = serve_stale_catalog().await;
    let (handle, worker) = worker(&base);

    let runner = tokio::spawn({
        let worker = worker.clone();
        async move { worker.start().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.trigger();

    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("worker should stop after shutdown")
        .expect("worker task");
}

#[tokio::test]
async fn repeated_sync_of_the_same_window_is_stable() {
    let base = serve_stale_catalog().await;
    let (_handle, worker) = worker(&base);

    let first = worker.sync(None).await.expect("first sync");
    let second = worker.sync(None).await.expect("second sync");

    assert_eq!(first.total_fetched, second.total_fetched);
    assert_eq!(first.failed_batches, second.failed_batches);
}
