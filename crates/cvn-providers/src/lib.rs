// SPDX-License-Identifier: MIT OR Apache-2.0
//! Compute provider registry.
//!
//! CRUD over typed [`ProviderRecord`]s plus a background prober that runs
//! every 30 seconds with a per-provider jittered start, swapping the status
//! atomically. Remote providers with a `health_url` config entry are probed
//! over HTTP; everything else is assumed reachable.

#![deny(unsafe_code)]

use chrono::Utc;
use cvn_core::{ProviderKind, ProviderRecord, ProviderStatus};
use rand::Rng;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Default probe interval.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(30);
/// Probe HTTP timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// The provider registry. Clone freely; clones share state.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    inner: Arc<RwLock<BTreeMap<String, ProviderRecord>>>,
}

impl ProviderRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-seeded with the on-box providers every install has.
    pub fn with_local_defaults() -> Self {
        let registry = Self::new();
        registry.upsert(ProviderRecord::local("local-cpu", &["cpu"]));
        registry
    }

    /// Insert or replace a provider.
    pub fn upsert(&self, record: ProviderRecord) {
        self.inner
            .write()
            .expect("provider lock")
            .insert(record.id.clone(), record);
    }

    /// Remove a provider; `false` when unknown.
    pub fn remove(&self, id: &str) -> bool {
        self.inner.write().expect("provider lock").remove(id).is_some()
    }

    /// Fetch one provider.
    pub fn get(&self, id: &str) -> Option<ProviderRecord> {
        self.inner.read().expect("provider lock").get(id).cloned()
    }

    /// All providers, id-ordered.
    pub fn list(&self) -> Vec<ProviderRecord> {
        self.inner.read().expect("provider lock").values().cloned().collect()
    }

    /// Swap a provider's status.
    pub fn set_status(&self, id: &str, status: ProviderStatus) {
        if let Some(p) = self.inner.write().expect("provider lock").get_mut(id) {
            p.status = status;
        }
    }

    /// First healthy provider of `kind` carrying `capability`, id order.
    pub fn healthy_with(&self, kind: ProviderKind, capability: &str) -> Option<ProviderRecord> {
        self.inner
            .read()
            .expect("provider lock")
            .values()
            .find(|p| p.kind == kind && p.status.healthy && p.capabilities.contains(capability))
            .cloned()
    }

    /// Whether any healthy provider of `kind` exists.
    pub fn any_healthy(&self, kind: ProviderKind) -> bool {
        self.inner
            .read()
            .expect("provider lock")
            .values()
            .any(|p| p.kind == kind && p.status.healthy)
    }

    /// Spawn the background prober. Each provider gets its own probe loop
    /// with a random initial delay inside the interval, so a fleet of
    /// providers never probes in one synchronized burst. A reconciler wakes
    /// once per interval to start loops for newly registered providers;
    /// a loop ends when its provider is removed.
    pub fn spawn_prober(&self, interval: Duration) {
        let registry = self.clone();
        tokio::spawn(async move {
            let client = reqwest::Client::builder()
                .timeout(PROBE_TIMEOUT)
                .build()
                .expect("reqwest client");
            let running: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
            let mut reconcile = tokio::time::interval(interval);
            loop {
                for provider in registry.list() {
                    let started = running
                        .lock()
                        .expect("prober running set")
                        .insert(provider.id.clone());
                    if started {
                        spawn_probe_loop(
                            registry.clone(),
                            client.clone(),
                            Arc::clone(&running),
                            provider.id,
                            interval,
                        );
                    }
                }
                reconcile.tick().await;
            }
        });
    }
}

/// One provider's probe loop: jittered start, then a steady cadence until
/// the provider disappears from the registry.
fn spawn_probe_loop(
    registry: ProviderRegistry,
    client: reqwest::Client,
    running: Arc<Mutex<HashSet<String>>>,
    id: String,
    interval: Duration,
) {
    tokio::spawn(async move {
        let jitter = {
            let mut rng = rand::thread_rng();
            Duration::from_millis(rng.gen_range(0..interval.as_millis().max(1) as u64))
        };
        tokio::time::sleep(jitter).await;
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let Some(provider) = registry.get(&id) else {
                break;
            };
            let status = probe(&client, &provider).await;
            registry.set_status(&id, status);
        }
        running.lock().expect("prober running set").remove(&id);
    });
}

/// Probe one provider, producing its next status.
pub async fn probe(client: &reqwest::Client, provider: &ProviderRecord) -> ProviderStatus {
    let health_url = provider
        .config
        .get("health_url")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let Some(url) = health_url else {
        // No endpoint to ask: local devices count as reachable.
        return ProviderStatus {
            healthy: true,
            last_ok_at: Some(Utc::now()),
            last_error: None,
            latency_ms: None,
        };
    };

    let started = std::time::Instant::now();
    match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => {
            let latency = started.elapsed().as_millis() as u64;
            debug!(provider = %provider.id, latency_ms = latency, "probe ok");
            ProviderStatus {
                healthy: true,
                last_ok_at: Some(Utc::now()),
                last_error: None,
                latency_ms: Some(latency),
            }
        }
        Ok(resp) => {
            warn!(provider = %provider.id, status = %resp.status(), "probe failed");
            ProviderStatus {
                healthy: false,
                last_ok_at: provider.status.last_ok_at,
                last_error: Some(format!("status {}", resp.status())),
                latency_ms: None,
            }
        }
        Err(e) => {
            warn!(provider = %provider.id, error = %e, "probe error");
            ProviderStatus {
                healthy: false,
                last_ok_at: provider.status.last_ok_at,
                last_error: Some(e.to_string()),
                latency_ms: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvn_core::ProviderCost;
    use serde_json::json;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn remote(id: &str, health_url: Option<String>) -> ProviderRecord {
        ProviderRecord {
            id: id.into(),
            kind: ProviderKind::Remote,
            capabilities: ["gpu".to_string()].into_iter().collect(),
            config: health_url
                .map(|u| BTreeMap::from([("health_url".to_string(), json!(u))]))
                .unwrap_or_default(),
            status: ProviderStatus::default(),
            cost: ProviderCost {
                per_minute: Some(0.10),
                egress_per_gb: Some(0.01),
                vram_per_gb_minute: Some(0.02),
            },
        }
    }

    #[test]
    fn crud_roundtrip() {
        let r = ProviderRegistry::new();
        r.upsert(ProviderRecord::local("cpu", &["cpu"]));
        assert!(r.get("cpu").is_some());
        assert_eq!(r.list().len(), 1);
        assert!(r.remove("cpu"));
        assert!(!r.remove("cpu"));
        assert!(r.get("cpu").is_none());
    }

    #[test]
    fn healthy_with_filters_kind_and_capability() {
        let r = ProviderRegistry::new();
        r.upsert(ProviderRecord::local("local-gpu", &["gpu"]));
        r.upsert(remote("runpod", None));

        assert!(r.healthy_with(ProviderKind::Local, "gpu").is_some());
        assert!(r.healthy_with(ProviderKind::Local, "tts").is_none());
        // Remote starts unhealthy until probed.
        assert!(r.healthy_with(ProviderKind::Remote, "gpu").is_none());
        assert!(!r.any_healthy(ProviderKind::Remote));
    }

    #[tokio::test]
    async fn probe_without_endpoint_is_healthy() {
        let client = reqwest::Client::new();
        let p = ProviderRecord::local("cpu", &["cpu"]);
        let status = probe(&client, &p).await;
        assert!(status.healthy);
        assert!(status.last_ok_at.is_some());
    }

    #[tokio::test]
    async fn probe_updates_status_from_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let p = remote("runpod", Some(server.uri()));
        let status = probe(&client, &p).await;
        assert!(status.healthy);
        assert!(status.latency_ms.is_some());
    }

    #[tokio::test]
    async fn probe_records_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let p = remote("runpod", Some(server.uri()));
        let status = probe(&client, &p).await;
        assert!(!status.healthy);
        assert!(status.last_error.unwrap().contains("503"));
    }
}
