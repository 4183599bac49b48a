//! End-to-end tests for the pull-then-push reconcilers against a mock server.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use stump_offline::{
    Database, ProgressStore, ProgressUpdate, ReadProgressSync, Reconciler, ServerConfig,
    ServerRegistry, SyncEngine, SyncError,
};

async fn connected(db: &Database, server: &MockServer, server_id: &str) -> Arc<ServerRegistry> {
    let registry = Arc::new(ServerRegistry::new(db.clone()));
    registry
        .upsert_server(&ServerConfig {
            id: server_id.to_string(),
            name: "Test Server".to_string(),
            base_url: server.uri(),
            api_token: "token-123".to_string(),
            created_at: String::new(),
        })
        .await
        .unwrap();
    registry
}

fn progress_reconciler(db: &Database, registry: Arc<ServerRegistry>) -> Reconciler<ReadProgressSync> {
    Reconciler::new(registry, ReadProgressSync::new(ProgressStore::new(db.clone())))
}

fn local_progress(book_id: &str, percentage: f64) -> ProgressUpdate {
    ProgressUpdate {
        book_id: book_id.to_string(),
        page: Some(42),
        epubcfi: None,
        percentage,
        is_completed: false,
    }
}

#[tokio::test]
async fn test_pull_upserts_remote_progress_as_synced() {
    let server = MockServer::start().await;
    let db = Database::new_in_memory().await.unwrap();
    let registry = connected(&db, &server, "s1").await;

    Mock::given(method("GET"))
        .and(path("/api/v1/sync/progress"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "book_id": "b1", "page": 12, "percentage": 0.3, "is_completed": false },
            { "book_id": "b2", "percentage": 1.0, "is_completed": true },
        ])))
        .mount(&server)
        .await;

    let reconciler = progress_reconciler(&db, registry);
    let report = reconciler.pull(None).await.unwrap();

    assert_eq!(report["s1"].applied, 2);
    assert!(report["s1"].failed_book_ids.is_empty());

    let store = ProgressStore::new(db);
    let b1 = store.get("b1", "s1").await.unwrap().unwrap();
    assert_eq!(b1.page, Some(12));
    assert!(b1.is_synced);
    assert!(store.get("b2", "s1").await.unwrap().unwrap().is_completed);
}

#[tokio::test]
async fn test_pull_failure_excludes_book_from_push() {
    let server = MockServer::start().await;
    let db = Database::new_in_memory().await.unwrap();
    let registry = connected(&db, &server, "s1").await;
    let store = ProgressStore::new(db.clone());

    // Local unsynced state for both books.
    store.record_local("s1", &local_progress("good", 0.5)).await.unwrap();
    store.record_local("s1", &local_progress("bad", 0.7)).await.unwrap();

    // The "bad" item is malformed (percentage is not a number), so its pull
    // fails per-item; "good" has no remote state and stays local-only.
    Mock::given(method("GET"))
        .and(path("/api/v1/sync/progress"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "book_id": "bad", "percentage": "forty" },
        ])))
        .mount(&server)
        .await;

    Mock::given(method("PUT"))
        .and(path("/api/v1/sync/progress/good"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/v1/sync/progress/bad"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let reconciler = progress_reconciler(&db, registry);
    let (failed, report) = match reconciler.sync(None).await {
        Err(SyncError::Partial { failed, report }) => (failed, report),
        other => panic!("expected a partial sync failure, got {other:?}"),
    };
    assert_eq!(failed, 1);
    assert_eq!(report["s1"].failed_book_ids, vec!["bad"]);

    // Pushed state is marked synced; the failed book keeps its local state.
    assert_eq!(store.list_unsynced_book_ids("s1").await.unwrap(), vec!["bad"]);
    server.verify().await;
}

#[tokio::test]
async fn test_wholesale_pull_failure_skips_push_for_server() {
    let server = MockServer::start().await;
    let db = Database::new_in_memory().await.unwrap();
    let registry = connected(&db, &server, "s1").await;
    let store = ProgressStore::new(db.clone());

    store.record_local("s1", &local_progress("b1", 0.5)).await.unwrap();

    Mock::given(method("GET"))
        .and(path("/api/v1/sync/progress"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/v1/sync/progress/b1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let reconciler = progress_reconciler(&db, registry);
    let (failed, report) = match reconciler.sync(None).await {
        Err(SyncError::Partial { failed, report }) => (failed, report),
        other => panic!("expected a partial sync failure, got {other:?}"),
    };
    assert_eq!(failed, 1);
    assert_eq!(report["s1"].failed_book_ids, vec!["b1"]);
    server.verify().await;
}

#[tokio::test]
async fn test_push_upload_failure_keeps_book_unsynced() {
    let server = MockServer::start().await;
    let db = Database::new_in_memory().await.unwrap();
    let registry = connected(&db, &server, "s1").await;
    let store = ProgressStore::new(db.clone());

    store.record_local("s1", &local_progress("b1", 0.5)).await.unwrap();

    Mock::given(method("GET"))
        .and(path("/api/v1/sync/progress"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/v1/sync/progress/b1"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let reconciler = progress_reconciler(&db, registry);
    let result = reconciler.sync(None).await;

    assert!(matches!(result, Err(SyncError::Partial { failed: 1, .. })));
    assert_eq!(store.list_unsynced_book_ids("s1").await.unwrap(), vec!["b1"]);
}

#[tokio::test]
async fn test_sync_scopes_to_requested_servers() {
    let server = MockServer::start().await;
    let db = Database::new_in_memory().await.unwrap();

    let registry = connected(&db, &server, "s1").await;
    registry
        .upsert_server(&ServerConfig {
            id: "s2".to_string(),
            name: "Unreachable".to_string(),
            base_url: "https://unreachable.invalid/".to_string(),
            api_token: "token-456".to_string(),
            created_at: String::new(),
        })
        .await
        .unwrap();

    Mock::given(method("GET"))
        .and(path("/api/v1/sync/progress"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "book_id": "b1", "percentage": 0.2 },
        ])))
        .mount(&server)
        .await;

    let reconciler = progress_reconciler(&db, registry);
    let report = reconciler
        .sync(Some(&["s1".to_string()]))
        .await
        .unwrap();

    assert_eq!(report.len(), 1);
    assert_eq!(report["s1"].applied, 1);
}

#[tokio::test]
async fn test_full_sync_kinds_are_independent() {
    let server = MockServer::start().await;
    let db = Database::new_in_memory().await.unwrap();
    let registry = connected(&db, &server, "s1").await;

    // Progress has a malformed item; bookmarks and annotations are clean.
    Mock::given(method("GET"))
        .and(path("/api/v1/sync/progress"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "book_id": "broken", "percentage": [] },
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/sync/bookmarks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": "r1", "book_id": "b1", "page": 4 },
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/sync/annotations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let engine = SyncEngine::new(&db, registry);
    let report = engine.sync_all(None).await.unwrap();

    assert!(!report.is_clean());
    assert_eq!(report.failed, 1);
    assert_eq!(report.progress["s1"].failed_book_ids, vec!["broken"]);
    assert_eq!(report.bookmarks["s1"].applied, 1);
    assert!(report.annotations["s1"].failed_book_ids.is_empty());
}

#[tokio::test]
async fn test_full_sync_clean_pass() {
    let server = MockServer::start().await;
    let db = Database::new_in_memory().await.unwrap();
    let registry = connected(&db, &server, "s1").await;

    for kind in ["progress", "bookmarks", "annotations"] {
        Mock::given(method("GET"))
            .and(path(format!("/api/v1/sync/{kind}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
    }

    let engine = SyncEngine::new(&db, registry);
    let report = engine.sync_all(None).await.unwrap();
    assert!(report.is_clean());
}
