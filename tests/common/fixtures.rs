use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use wardmill::config::GuardianPaths;
use wardmill::context::GuardianContext;
use wardmill::message::ParamMap;
use wardmill::store::{MemoryStore, StateStore};

pub const GUARDIAN: &str = "testg";

pub fn paths() -> GuardianPaths {
    GuardianPaths::new("/{}", GUARDIAN)
}

/// A memory store with the guardian's persistent skeleton pre-created.
pub async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for path in [
        format!("/{GUARDIAN}"),
        format!("/{GUARDIAN}/context"),
        format!("/{GUARDIAN}/alive_clients"),
        format!("/{GUARDIAN}/operations"),
    ] {
        store.create(&path, b"", false, false, true).await.unwrap();
    }
    store
}

/// Load a context from the store and take the leader lock.
pub async fn leader_context(store: &Arc<MemoryStore>) -> GuardianContext {
    let store: Arc<dyn StateStore> = Arc::clone(store) as Arc<dyn StateStore>;
    let mut ctx = GuardianContext::load(store, paths()).await.unwrap();
    ctx.set_lock(true);
    ctx
}

pub fn params(pairs: &[(&str, Value)]) -> ParamMap {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

/// Poll `probe` every 10 ms until it returns true, up to 5 seconds.
pub async fn wait_until<F>(mut probe: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if probe() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Async-probe variant of [`wait_until`].
pub async fn wait_until_async<F, Fut>(mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if probe().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
