use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, interval};
use tracing::{debug, info, warn};
use crate::backend::BackendClient;
use crate::cache::ResponseCache;

// upper bound for a single health probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// Last known health of the KoboldCpp server

pub struct BackendHealth {
    pub url: String,
    healthy: AtomicBool,
    last_checked: Mutex<Option<DateTime<Utc>>>,
}

impl BackendHealth {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            healthy: AtomicBool::new(true),
            last_checked: Mutex::new(None),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    // Returns the previous value
    pub fn set_healthy(&self, healthy: bool) -> bool {
        *self.last_checked.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        self.healthy.swap(healthy, Ordering::Relaxed)
    }

    pub fn last_checked(&self) -> Option<DateTime<Utc>> {
        *self.last_checked.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// Polls the status endpoint every `check_interval`, logging transitions

pub async fn health_checker(health: Arc<BackendHealth>, client: Arc<BackendClient>, check_interval: Duration) {
    let mut interval = interval(check_interval);

    info!(url = %health.url, interval = ?check_interval, "health checker started");

    loop {
        interval.tick().await;

        let is_healthy = client.probe(PROBE_TIMEOUT.min(check_interval)).await;
        let was_healthy = health.set_healthy(is_healthy);

        if was_healthy != is_healthy {
            if is_healthy {
                info!(url = %health.url, "backend is now healthy");
            } else {
                warn!(url = %health.url, "backend is now unhealthy");
            }
        }
    }
}

// Drops expired cache entries so they stop counting against the memory budget

pub async fn cache_sweeper(cache: Arc<ResponseCache>, every: Duration) {
    let mut interval = interval(every);

    loop {
        interval.tick().await;
        let purged = cache.purge_expired();
        if purged > 0 {
            debug!(purged, remaining = cache.len(), "swept expired cache entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::config::BackendSettings;
    use crate::models::{Endpoint, Generation};
    use crate::cache::Fingerprint;
    use crate::models::{BackendCall, GenerateParams};
    use axum::{Json, Router, routing::get};
    use serde_json::json;

    async fn wait_until(health: &BackendHealth, expected: bool) {
        for _ in 0..100 {
            if health.last_checked().is_some() && health.is_healthy() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("health never became {expected}");
    }

    fn client_for(url: String) -> Arc<BackendClient> {
        let settings = BackendSettings {
            url,
            ..BackendSettings::default()
        };
        Arc::new(BackendClient::new(settings, Arc::new(SystemClock)))
    }

    #[tokio::test]
    async fn refused_connection_marks_backend_unhealthy() {
        // bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let health = Arc::new(BackendHealth::new(url.clone()));
        assert!(health.is_healthy());
        let task = tokio::spawn(health_checker(health.clone(), client_for(url), Duration::from_millis(50)));

        wait_until(&health, false).await;
        task.abort();
    }

    #[tokio::test]
    async fn answering_status_endpoint_keeps_backend_healthy() {
        let app = Router::new().route(
            "/api/extra/generate/check",
            get(|| async { Json(json!({"results": [{"text": ""}]})) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let health = Arc::new(BackendHealth::new(url.clone()));
        health.set_healthy(false);
        let task = tokio::spawn(health_checker(health.clone(), client_for(url), Duration::from_millis(50)));

        wait_until(&health, true).await;
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_expired_entries() {
        let clock = Arc::new(ManualClock::new());
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(60), 1 << 20, clock.clone()));
        let fingerprint = Fingerprint::compute("generate_text", &BackendCall::Generate(GenerateParams::new("old")));
        cache.put(
            fingerprint,
            Arc::new(Generation {
                text: "stale".into(),
                tokens_generated: 1,
                finish_reason: "stop".into(),
                endpoint: Endpoint::Native,
            }),
        );

        let task = tokio::spawn(cache_sweeper(cache.clone(), Duration::from_secs(10)));
        clock.advance(Duration::from_secs(61));
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert!(cache.is_empty());
        task.abort();
    }
}
