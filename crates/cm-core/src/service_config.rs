//! Runtime-tunable settings stored in `cm_admin.service_configs` and picked
//! up by running processes without a restart.

use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time;

use crate::store::Store;

pub const USER_API_SERVICE: &str = "user-api";
pub const ANALYSIS_SERVICE: &str = "analysis";

pub const KNOWN_SERVICES: &[&str] = &[USER_API_SERVICE, ANALYSIS_SERVICE];

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfigSnapshot {
    pub version: i64,
    pub config_json: Value,
}

#[derive(Clone)]
pub struct ServiceConfigHandle {
    state: Arc<RwLock<ServiceConfigSnapshot>>,
}

impl ServiceConfigHandle {
    pub async fn get(&self) -> ServiceConfigSnapshot {
        self.state.read().await.clone()
    }

    /// Pulls the stored row once. Returns true when a newer version was applied.
    pub async fn refresh(&self, store: &dyn Store, service: &str) -> Result<bool> {
        let Some(record) = store.load_service_config(service).await? else {
            return Ok(false);
        };
        let mut guard = self.state.write().await;
        if record.version == guard.version {
            return Ok(false);
        }
        *guard = ServiceConfigSnapshot {
            version: record.version,
            config_json: record.config_json,
        };
        tracing::info!(service = service, version = guard.version, "service config updated");
        Ok(true)
    }
}

pub fn static_handle(config_json: Value) -> ServiceConfigHandle {
    ServiceConfigHandle {
        state: Arc::new(RwLock::new(ServiceConfigSnapshot {
            version: 0,
            config_json,
        })),
    }
}

pub async fn watch_service_config(
    store: Arc<dyn Store>,
    service: &'static str,
    default_config: Value,
    poll_interval: Duration,
) -> Result<ServiceConfigHandle> {
    let handle = static_handle(default_config);
    handle.refresh(store.as_ref(), service).await?;

    let poller = handle.clone();
    tokio::spawn(async move {
        loop {
            time::sleep(poll_interval).await;
            if let Err(err) = poller.refresh(store.as_ref(), service).await {
                tracing::warn!(service = service, error = %err, "service config poll failed");
            }
        }
    });

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn falls_back_to_default_until_a_row_exists() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let handle = watch_service_config(
            Arc::clone(&store),
            ANALYSIS_SERVICE,
            json!({ "max_attempts": 1 }),
            Duration::from_secs(3600),
        )
        .await
        .expect("watch");
        let snapshot = handle.get().await;
        assert_eq!(snapshot.version, 0);
        assert_eq!(snapshot.config_json["max_attempts"], 1);

        store
            .put_service_config(
                ANALYSIS_SERVICE,
                json!({ "max_attempts": 3 }),
                None,
                "test",
                None,
            )
            .await
            .expect("put");
        assert!(handle
            .refresh(store.as_ref(), ANALYSIS_SERVICE)
            .await
            .expect("refresh"));
        assert!(!handle
            .refresh(store.as_ref(), ANALYSIS_SERVICE)
            .await
            .expect("refresh"));
        let snapshot = handle.get().await;
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.config_json["max_attempts"], 3);
    }
}
