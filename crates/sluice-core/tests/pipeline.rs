use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use sluice_core::app::{PipelineBuilder, PipelineSettings};
use sluice_core::domain::{EventCandidate, Topic};
use sluice_core::gateway;
use sluice_core::impls::{FileDurableLog, FileStorage, InMemoryDurableLog, InMemoryStorage};
use sluice_core::ports::{DurableLog, Subscription};
use tempfile::tempdir;
use tower::ServiceExt; // for oneshot

const BODY: &str = r#"{"ip_address":"192.168.1.1","user_agent":"Mozilla/5.0","referring_url":"http://example.com","advertiser_id":"123456","metadata":{"campaign":"summer_sale","clicks":120}}"#;

fn settings() -> PipelineSettings {
    PipelineSettings {
        primary_topic: Topic::new("data-pipeline-topic"),
        dead_letter_topic: Topic::new("data-pipeline-dlt-topic"),
        consumer_group: "example-consumer-group".to_string(),
        consumers: 1,
        save_timeout: None,
    }
}

fn submit_request(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/submit")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn submitted_event_is_saved_once_with_identical_fields() {
    let log = InMemoryDurableLog::new();
    let storage = InMemoryStorage::new();
    let pipeline = PipelineBuilder::new(settings())
        .log(Arc::new(log.clone()))
        .storage(Arc::new(storage.clone()))
        .build()
        .unwrap();
    let consumers = pipeline.start_consumers().await.unwrap();

    let response = gateway::router(pipeline.producer())
        .oneshot(submit_request(BODY))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    wait_until(|| {
        let storage = storage.clone();
        async move { storage.save_calls() == 1 }
    })
    .await;

    let expected = serde_json::from_str::<EventCandidate>(BODY)
        .unwrap()
        .validate()
        .unwrap();
    let saved = storage.get("123456").await.unwrap();
    assert_eq!(saved, expected);
    assert_eq!(saved.metadata()["campaign"], json!("summer_sale"));
    assert_eq!(storage.save_calls(), 1);
    assert!(log.messages(&Topic::new("data-pipeline-dlt-topic")).await.is_empty());

    consumers.shutdown_and_join().await;
}

#[tokio::test]
async fn storage_outage_dead_letters_original_bytes_then_replay_persists() {
    let log = InMemoryDurableLog::new();
    let storage = InMemoryStorage::new();
    storage.set_failing(true);

    let pipeline = PipelineBuilder::new(settings())
        .log(Arc::new(log.clone()))
        .storage(Arc::new(storage.clone()))
        .build()
        .unwrap();
    let consumers = pipeline.start_consumers().await.unwrap();

    let response = gateway::router(pipeline.producer())
        .oneshot(submit_request(BODY))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let dlt = Topic::new("data-pipeline-dlt-topic");
    wait_until(|| {
        let log = log.clone();
        let dlt = dlt.clone();
        async move { !log.messages(&dlt).await.is_empty() }
    })
    .await;
    consumers.shutdown_and_join().await;

    // primary 側は commit 済みなので解放されている
    assert!(log.messages(&Topic::new("data-pipeline-topic")).await.is_empty());

    let published = serde_json::from_str::<EventCandidate>(BODY)
        .unwrap()
        .validate()
        .unwrap()
        .to_canonical_bytes()
        .unwrap();
    let dead_lettered = log.messages(&dlt).await;
    assert_eq!(dead_lettered.len(), 1);
    assert_eq!(dead_lettered[0].payload, published);
    assert_eq!(dead_lettered[0].key.as_deref(), Some(&b"123456"[..]));
    assert!(storage.is_empty().await);

    // 障害復旧後、dead-letter の bytes をそのまま保存し直せること
    storage.set_failing(false);
    let replay_settings = PipelineSettings {
        primary_topic: dlt.clone(),
        dead_letter_topic: Topic::new("replay-dlt"),
        consumer_group: "replay".to_string(),
        ..settings()
    };
    let replay = PipelineBuilder::new(replay_settings)
        .log(Arc::new(log.clone()))
        .storage(Arc::new(storage.clone()))
        .build()
        .unwrap();
    let replayers = replay.start_consumers().await.unwrap();

    wait_until(|| {
        let storage = storage.clone();
        async move { storage.get("123456").await.is_some() }
    })
    .await;
    replayers.shutdown_and_join().await;
}

#[tokio::test]
async fn invalid_event_never_reaches_the_log() {
    let log = InMemoryDurableLog::new();
    let pipeline = PipelineBuilder::new(settings())
        .log(Arc::new(log.clone()))
        .storage(Arc::new(InMemoryStorage::new()))
        .build()
        .unwrap();

    let body = BODY.replace("192.168.1.1", "invalid-ip");
    let response = gateway::router(pipeline.producer())
        .oneshot(submit_request(&body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    let error: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let message = error["error"].as_str().unwrap();
    assert!(message.contains("ip_address"));
    assert!(message.contains("ipv4"));

    assert!(log.messages(&Topic::new("data-pipeline-topic")).await.is_empty());
}

#[tokio::test]
async fn file_storage_end_to_end() {
    let dir = tempdir().unwrap();
    let log = InMemoryDurableLog::new();
    let storage = FileStorage::new(dir.path().join("records"));

    let pipeline = PipelineBuilder::new(settings())
        .log(Arc::new(log.clone()))
        .storage(Arc::new(storage.clone()))
        .build()
        .unwrap();
    let consumers = pipeline.start_consumers().await.unwrap();

    let response = gateway::router(pipeline.producer())
        .oneshot(submit_request(BODY))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    wait_until(|| {
        let storage = storage.clone();
        async move { matches!(storage.load("123456").await, Ok(Some(_))) }
    })
    .await;
    consumers.shutdown_and_join().await;

    let saved = storage.load("123456").await.unwrap().unwrap();
    assert_eq!(saved.referring_url(), "http://example.com");
}

#[tokio::test]
async fn dead_letters_survive_restart_and_replay_from_disk() {
    let dir = tempdir().unwrap();
    let log_dir = dir.path().join("log");
    let storage = InMemoryStorage::new();
    storage.set_failing(true);

    {
        let log = FileDurableLog::open(&log_dir).await.unwrap();
        let pipeline = PipelineBuilder::new(settings())
            .log(Arc::new(log.clone()))
            .storage(Arc::new(storage.clone()))
            .build()
            .unwrap();
        let consumers = pipeline.start_consumers().await.unwrap();

        let response = gateway::router(pipeline.producer())
            .oneshot(submit_request(BODY))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        wait_until(|| {
            let log = log.clone();
            async move {
                log.committed_offset(&Topic::new("data-pipeline-topic"), "example-consumer-group")
                    .await
                    == Some(0)
            }
        })
        .await;
        consumers.shutdown_and_join().await;
    }

    // プロセスを作り直した想定で、ディスクから dead-letter を読み直して保存する
    storage.set_failing(false);
    let log = FileDurableLog::open(&log_dir).await.unwrap();
    let dlt = Topic::new("data-pipeline-dlt-topic");
    assert_eq!(log.messages(&dlt).await.unwrap().len(), 1);

    // primary は commit 済みなので、同じ group で再購読しても何も配られない
    let mut primary = log
        .subscribe(&Topic::new("data-pipeline-topic"), "example-consumer-group")
        .await
        .unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(50), primary.fetch())
            .await
            .is_err()
    );
    drop(primary);

    let replay = PipelineBuilder::new(PipelineSettings {
        primary_topic: dlt,
        dead_letter_topic: Topic::new("replay-dlt"),
        consumer_group: "replay".to_string(),
        ..settings()
    })
    .log(Arc::new(log.clone()))
    .storage(Arc::new(storage.clone()))
    .build()
    .unwrap();
    let replayers = replay.start_consumers().await.unwrap();

    wait_until(|| {
        let storage = storage.clone();
        async move { storage.get("123456").await.is_some() }
    })
    .await;
    replayers.shutdown_and_join().await;

    // 障害中の 1 回と replay の 1 回
    assert_eq!(storage.save_calls(), 2);
}
