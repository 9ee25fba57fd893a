//! End-to-end offline flow tests
//!
//! Drives the assembled engine against a mock HTTP server acting as both the
//! probe target and the sync endpoint.

use connectivity::{MonitorConfig, QualityLevel};
use serde_json::json;
use std::time::Duration;
use storage::StoreConfig;
use sync_engine::{
    DrainOutcome, EndpointConfig, EngineConfig, EntityType, OfflineEngine, OfflineEvent,
    SyncStatus,
};
use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn start_engine(server: &MockServer, data_dir: &TempDir) -> OfflineEngine {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    Mock::given(method("HEAD"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;

    let config = EngineConfig::new(EndpointConfig::new(format!("{}/sync", server.uri()), "token"))
        .store(StoreConfig::new(data_dir.path()))
        .monitor(MonitorConfig::new(format!("{}/ping", server.uri())));

    let engine = OfflineEngine::start(config).await.unwrap();

    // Let the startup probe settle so no probe is in flight when a test
    // forces the link state.
    for _ in 0..100 {
        if engine.monitor().quality().await == QualityLevel::Normal {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(engine.monitor().quality().await, QualityLevel::Normal);

    engine
}

#[tokio::test]
async fn test_enqueue_offline_then_drain_on_recovery() {
    let server = MockServer::start().await;
    let data_dir = TempDir::new().unwrap();
    let engine = start_engine(&server, &data_dir).await;

    engine.monitor().set_link_up(false).await;
    assert_eq!(engine.monitor().quality().await, QualityLevel::Offline);

    let record = engine
        .enqueue(EntityType::Cart, json!({"items": [{"sku": "waza-safari", "qty": 2}]}))
        .unwrap();
    assert_eq!(engine.pending().await.unwrap(), 1);

    // Nothing goes out while offline.
    let outcome = engine.sync_now().await.unwrap();
    assert_eq!(outcome, DrainOutcome::Deferred(QualityLevel::Offline));

    // Exactly one POST once connectivity returns.
    Mock::given(method("POST"))
        .and(path("/sync"))
        .and(body_string_contains("data_type=cart"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"success": true, "applied": [record.id]})),
        )
        .expect(1)
        .mount(&server)
        .await;

    engine.monitor().set_link_up(true).await;
    assert_eq!(engine.monitor().quality().await, QualityLevel::Normal);

    // The quality transition may trigger the background drain concurrently
    // with this explicit one; the single-flight guard coalesces them and the
    // mock's expect(1) holds either way.
    engine.sync_now().await.unwrap();
    for _ in 0..50 {
        if engine.pending().await.unwrap() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(engine.pending().await.unwrap(), 0);

    let snapshot = *engine.status().borrow();
    assert_eq!(snapshot.status, SyncStatus::Synced);
    assert_eq!(snapshot.pending, 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_queue_and_device_id_survive_restart() {
    let server = MockServer::start().await;
    let data_dir = TempDir::new().unwrap();

    let first_device_id;
    {
        let engine = start_engine(&server, &data_dir).await;
        engine.monitor().set_link_up(false).await;
        first_device_id = engine.device_id().to_string();

        engine
            .enqueue(EntityType::Booking, json!({"excursion_id": 12, "seats": 3}))
            .unwrap();

        // Let the background durable write land before shutdown.
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.shutdown().await;
    }

    let engine = start_engine(&server, &data_dir).await;
    assert_eq!(engine.device_id(), first_device_id);
    assert_eq!(engine.pending().await.unwrap(), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_lifecycle_events_are_broadcast() {
    let server = MockServer::start().await;
    let data_dir = TempDir::new().unwrap();
    let engine = start_engine(&server, &data_dir).await;
    let mut events = engine.subscribe();

    Mock::given(method("POST"))
        .and(path("/sync"))
        .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "applied": []
        })))
        .mount(&server)
        .await;

    engine
        .enqueue(EntityType::Form, json!({"fields": {"email": "voyageur@example.cm"}}))
        .unwrap();

    let mut saw_enqueued = false;
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(500), events.recv()).await
    {
        if let OfflineEvent::RecordEnqueued(record) = event {
            assert_eq!(record.entity_type, EntityType::Form);
            saw_enqueued = true;
            break;
        }
    }
    assert!(saw_enqueued);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_failed_cycle_leaves_records_for_retry() {
    let server = MockServer::start().await;
    let data_dir = TempDir::new().unwrap();
    let engine = start_engine(&server, &data_dir).await;

    engine.monitor().probe_now().await;
    assert_eq!(engine.monitor().quality().await, QualityLevel::Normal);

    // The endpoint is down for the sync path.
    Mock::given(method("POST"))
        .and(path("/sync"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    engine
        .enqueue(EntityType::Cart, json!({"items": ["mefou-park"]}))
        .unwrap();

    let outcome = engine.sync_now().await.unwrap();
    let DrainOutcome::Aborted(stats) = outcome else {
        panic!("expected abort, got {:?}", outcome);
    };
    assert_eq!(stats.failed_batches, 3);
    assert_eq!(engine.pending().await.unwrap(), 1);
    assert_eq!(engine.status().borrow().status, SyncStatus::ErrorWillRetry);

    engine.shutdown().await;
}
