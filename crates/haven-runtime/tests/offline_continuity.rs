//! End-to-end scenarios through the assembled runtime.

use async_trait::async_trait;
use haven_core::{
    CacheRegion, CacheRequest, CircuitBreakerConfig, CircuitState, HavenConfig, HavenError,
    ManualClock, OperationDraft, OperationKind, OperationStatus, QueueConfig, ResourceHint,
    RetryConfig,
};
use haven_runtime::{
    CacheResponse, CallOptions, Haven, HavenEvent, Method, NetworkClient, NetworkRequest,
    NetworkResponse,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Upstream API fake: either offline, failing with a status, or answering `{}`.
#[derive(Debug, Default)]
struct FakeApi {
    offline: Mutex<bool>,
    fail_with: Mutex<Option<u16>>,
    log: Mutex<Vec<(Method, String)>>,
}

impl FakeApi {
    fn set_offline(&self, offline: bool) {
        *self.offline.lock() = offline;
    }

    fn fail_with(&self, status: Option<u16>) {
        *self.fail_with.lock() = status;
    }

    fn calls(&self) -> Vec<(Method, String)> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl NetworkClient for FakeApi {
    async fn send(&self, request: NetworkRequest) -> Result<NetworkResponse, HavenError> {
        self.log.lock().push((request.method, request.url.clone()));
        if *self.offline.lock() {
            return Err(HavenError::network("connection refused"));
        }
        match *self.fail_with.lock() {
            Some(status) => Ok(NetworkResponse::status(status)),
            None => Ok(NetworkResponse::json(&json!({ "ok": true }))),
        }
    }

    async fn is_reachable(&self) -> bool {
        !*self.offline.lock()
    }
}

fn config() -> HavenConfig {
    HavenConfig {
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 3,
            open_timeout: Duration::from_millis(30_000),
            half_open_success_threshold: 1,
            ..Default::default()
        },
        retry: RetryConfig {
            max_retries: 0,
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn haven(api: Arc<FakeApi>, clock: Arc<ManualClock>, config: HavenConfig) -> Haven {
    Haven::builder(api)
        .config(config)
        .clock(clock)
        .sync_endpoint("https://api.test/v1")
        .build()
        .await
        .expect("runtime builds")
}

#[tokio::test]
async fn circuit_opens_after_threshold_and_probes_after_timeout() {
    let api = Arc::new(FakeApi::default());
    let clock = Arc::new(ManualClock::default());
    let haven = haven(api, clock.clone(), config()).await;
    let mut events = haven.subscribe();
    let calls = AtomicU32::new(0);
    let once = CallOptions::once();

    for _ in 0..3 {
        let result = haven
            .resilience()
            .execute("insight-service", &once, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(HavenError::upstream_unavailable("insight-service", "503")) }
            })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(
        haven.resilience().breakers().state("insight-service"),
        CircuitState::Open
    );
    assert_eq!(
        events.recv().await.unwrap(),
        HavenEvent::CircuitOpened {
            service: "insight-service".to_string(),
            failures: 3
        }
    );

    // Fourth call fails without reaching the action
    let err = haven
        .resilience()
        .execute("insight-service", &once, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await
        .unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    clock.advance(Duration::from_millis(30_000));
    haven
        .resilience()
        .execute("insight-service", &once, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(
        haven.resilience().breakers().state("insight-service"),
        CircuitState::Closed
    );
}

#[tokio::test]
async fn expired_api_entry_is_purged_and_treated_as_miss() {
    let api = Arc::new(FakeApi::default());
    let clock = Arc::new(ManualClock::default());
    let haven = haven(api.clone(), clock.clone(), config()).await;
    let request = CacheRequest::new("https://api.test/api/insights?day=mon", ResourceHint::Data);
    let key = haven.cache().classify(&request).unwrap().key;

    let first = haven.fetch(&request).await.unwrap();
    assert!(first.is_network());
    assert!(haven
        .cache()
        .store()
        .lookup(CacheRegion::Dynamic, &key)
        .await
        .unwrap()
        .is_some());

    clock.advance(Duration::from_millis(90_000_000));
    api.set_offline(true);
    let second = haven.fetch(&request).await.unwrap();
    assert!(matches!(second, CacheResponse::Fallback(_)));
    assert_eq!(api.calls().len(), 2);
    assert!(haven
        .cache()
        .store()
        .lookup(CacheRegion::Dynamic, &key)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn same_record_writes_replay_in_order() {
    let api = Arc::new(FakeApi::default());
    api.set_offline(true);
    let clock = Arc::new(ManualClock::default());
    let haven = haven(api.clone(), clock, config()).await;
    assert!(!haven.connectivity().is_online());
    let mut events = haven.subscribe();

    let drafts = [
        (OperationKind::Create, "night-1"),
        (OperationKind::Create, "night-2"),
        (OperationKind::Update, "night-1"),
        (OperationKind::Delete, "night-1"),
    ];
    for (kind, record) in drafts {
        let outcome = haven
            .submit(OperationDraft::new(kind, "sleep-logs", record, json!({ "hours": 7 })))
            .await
            .unwrap();
        assert!(outcome.is_queued());
    }
    for _ in 0..drafts.len() {
        let event = events.recv().await.unwrap();
        assert_eq!(event.name(), "offline-operation-queued");
    }
    assert!(api.calls().is_empty());

    api.set_offline(false);
    haven.set_online(true);
    let report = haven.sync_now().await.unwrap();
    assert_eq!(report.synced, 4);
    assert_eq!(report.remaining, 0);
    assert_eq!(events.recv().await.unwrap(), HavenEvent::SyncCompleted { synced: 4 });

    let night_one: Vec<Method> = api
        .calls()
        .into_iter()
        .filter(|(method, url)| url.ends_with("/night-1") || (*method == Method::Post && url.ends_with("/sleep-logs")))
        .map(|(method, _)| method)
        .collect();
    assert_eq!(
        night_one,
        vec![Method::Post, Method::Post, Method::Put, Method::Delete]
    );
}

#[tokio::test]
async fn exhausted_operation_fails_and_stays_retrievable() {
    let api = Arc::new(FakeApi::default());
    api.fail_with(Some(500));
    let clock = Arc::new(ManualClock::default());
    let config = HavenConfig {
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 50,
            ..Default::default()
        },
        queue: QueueConfig {
            max_attempts: 3,
            ..Default::default()
        },
        ..config()
    };
    let haven = haven(api.clone(), clock, config).await;

    let op = haven
        .queue()
        .enqueue(OperationDraft::new(
            OperationKind::Update,
            "meals",
            "lunch",
            json!({ "kcal": 610 }),
        ))
        .await
        .unwrap();

    for _ in 0..3 {
        haven.sync_now().await.unwrap();
    }
    let failed = haven.queue().status(op.id).await.expect("still on record");
    assert_eq!(failed.status, OperationStatus::Failed);
    assert_eq!(failed.attempts, 3);

    let before = api.calls().len();
    let report = haven.sync_now().await.unwrap();
    assert_eq!(report.attempted, 0);
    assert_eq!(api.calls().len(), before);

    api.fail_with(None);
    haven.queue().retry_failed(op.id).await.unwrap();
    let report = haven.sync_now().await.unwrap();
    assert_eq!(report.synced, 1);
}
