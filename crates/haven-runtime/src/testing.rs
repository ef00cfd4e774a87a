//! Fakes for driving the runtime in tests.

use async_trait::async_trait;
use haven_core::HavenError;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::network::{NetworkClient, NetworkRequest, NetworkResponse};
use crate::store::{DurableStore, MemoryStore, StoreRegion};

/// Store that answers only after `delay`.
#[derive(Debug, Default)]
pub struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
}

impl SlowStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            delay,
        }
    }
}

#[async_trait]
impl DurableStore for SlowStore {
    fn name(&self) -> &str {
        "slow"
    }

    fn is_persistent(&self) -> bool {
        true
    }

    async fn get(&self, region: StoreRegion, key: &str) -> Result<Option<JsonValue>, HavenError> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(region, key).await
    }

    async fn put(&self, region: StoreRegion, key: &str, value: JsonValue) -> Result<(), HavenError> {
        tokio::time::sleep(self.delay).await;
        self.inner.put(region, key, value).await
    }

    async fn delete(&self, region: StoreRegion, key: &str) -> Result<bool, HavenError> {
        tokio::time::sleep(self.delay).await;
        self.inner.delete(region, key).await
    }

    async fn list(&self, region: StoreRegion) -> Result<Vec<(String, JsonValue)>, HavenError> {
        tokio::time::sleep(self.delay).await;
        self.inner.list(region).await
    }

    async fn clear(&self, region: StoreRegion) -> Result<usize, HavenError> {
        tokio::time::sleep(self.delay).await;
        self.inner.clear(region).await
    }
}

/// Store that fails every call while failing is switched on.
#[derive(Debug)]
pub struct FailingStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            failing: AtomicBool::new(true),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self, region: StoreRegion) -> Result<(), HavenError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(HavenError::storage(region.name(), "simulated quota exceeded"))
        } else {
            Ok(())
        }
    }
}

impl Default for FailingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for FailingStore {
    fn name(&self) -> &str {
        "failing"
    }

    fn is_persistent(&self) -> bool {
        true
    }

    async fn get(&self, region: StoreRegion, key: &str) -> Result<Option<JsonValue>, HavenError> {
        self.check(region)?;
        self.inner.get(region, key).await
    }

    async fn put(&self, region: StoreRegion, key: &str, value: JsonValue) -> Result<(), HavenError> {
        self.check(region)?;
        self.inner.put(region, key, value).await
    }

    async fn delete(&self, region: StoreRegion, key: &str) -> Result<bool, HavenError> {
        self.check(region)?;
        self.inner.delete(region, key).await
    }

    async fn list(&self, region: StoreRegion) -> Result<Vec<(String, JsonValue)>, HavenError> {
        self.check(region)?;
        self.inner.list(region).await
    }

    async fn clear(&self, region: StoreRegion) -> Result<usize, HavenError> {
        self.check(region)?;
        self.inner.clear(region).await
    }
}

/// One scripted outcome.
#[derive(Debug, Clone)]
pub enum Scripted {
    Respond(NetworkResponse),
    Fail(HavenError),
}

impl Scripted {
    pub fn json(value: JsonValue) -> Self {
        Scripted::Respond(NetworkResponse::json(&value))
    }

    pub fn status(status: u16) -> Self {
        Scripted::Respond(NetworkResponse::status(status))
    }

    pub fn bytes(content_type: &str, body: Vec<u8>) -> Self {
        Scripted::Respond(NetworkResponse::new(200, Some(content_type.to_string()), body))
    }

    /// Connection refused.
    pub fn offline() -> Self {
        Scripted::Fail(HavenError::network("connection refused"))
    }
}

/// Network fake matching requests by URL substring.
///
/// Each rule holds a sequence of outcomes; the last one repeats.
/// Unmatched requests get the default outcome (`200 {}` unless changed).
#[derive(Debug)]
pub struct ScriptedNetwork {
    rules: Mutex<Vec<(String, VecDeque<Scripted>)>>,
    default: Mutex<Scripted>,
    requests: Mutex<Vec<NetworkRequest>>,
    reachable: AtomicBool,
    delay: Mutex<Duration>,
}

impl ScriptedNetwork {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            default: Mutex::new(Scripted::json(serde_json::json!({}))),
            requests: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Script outcomes for URLs containing `fragment`. Later rules win.
    pub fn on(&self, fragment: &str, outcomes: Vec<Scripted>) {
        self.rules
            .lock()
            .insert(0, (fragment.to_string(), outcomes.into_iter().collect()));
    }

    pub fn set_default(&self, outcome: Scripted) {
        *self.default.lock() = outcome;
    }

    /// Every unmatched request fails with a network error.
    pub fn go_offline(&self) {
        self.set_default(Scripted::offline());
        self.reachable.store(false, Ordering::SeqCst);
    }

    pub fn go_online(&self) {
        self.set_default(Scripted::json(serde_json::json!({})));
        self.reachable.store(true, Ordering::SeqCst);
    }

    /// Delay every response.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn requests(&self) -> Vec<NetworkRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Requests whose URL contains `fragment`.
    pub fn count_matching(&self, fragment: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url.contains(fragment))
            .count()
    }

    fn next_outcome(&self, url: &str) -> Scripted {
        let mut rules = self.rules.lock();
        for (fragment, outcomes) in rules.iter_mut() {
            if url.contains(fragment.as_str()) {
                if outcomes.len() > 1 {
                    if let Some(next) = outcomes.pop_front() {
                        return next;
                    }
                }
                if let Some(last) = outcomes.front() {
                    return last.clone();
                }
            }
        }
        self.default.lock().clone()
    }
}

impl Default for ScriptedNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkClient for ScriptedNetwork {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(&self, request: NetworkRequest) -> Result<NetworkResponse, HavenError> {
        let outcome = self.next_outcome(&request.url);
        self.requests.lock().push(request);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match outcome {
            Scripted::Respond(response) => Ok(response),
            Scripted::Fail(err) => Err(err),
        }
    }

    async fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

/// Let spawned background tasks run to completion.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
