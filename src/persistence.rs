//! Learned-power persistence
//!
//! The only durable artifact: a flat `{charger_id: watts}` JSON document,
//! rewritten whenever a charger is first seen or its learned maximum grows.
//! Last write wins; a missing or malformed file is treated as empty (and any
//! historical shape is overwritten on the next save).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{error, info};

#[async_trait]
pub trait LearnedPowerStore: Send + Sync {
    async fn get(&self, charger_id: &str) -> Option<f64>;
    /// Upsert and persist. I/O failures are logged; the in-memory value is
    /// kept and the next successful save resyncs the file.
    async fn record(&self, charger_id: &str, watts: f64);
    async fn all(&self) -> HashMap<String, f64>;
}

/// File-backed store with an in-memory mirror.
pub struct JsonPowerStore {
    path: PathBuf,
    powers: Mutex<HashMap<String, f64>>,
}

impl JsonPowerStore {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let powers = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<HashMap<String, f64>>(&text) {
                Ok(map) => {
                    info!(
                        file = %path.display(),
                        chargers = map.len(),
                        "Loaded learned maximum powers"
                    );
                    map
                }
                Err(e) => {
                    error!(
                        file = %path.display(),
                        error = %e,
                        "Learned-powers file is malformed; starting empty"
                    );
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(file = %path.display(), "No learned-powers file; starting empty");
                HashMap::new()
            }
            Err(e) => {
                error!(file = %path.display(), error = %e, "Cannot read learned-powers file");
                HashMap::new()
            }
        };
        Self {
            path,
            powers: Mutex::new(powers),
        }
    }

    fn write_file(&self, map: &HashMap<String, f64>) {
        let text = match serde_json::to_string_pretty(map) {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "Cannot serialize learned powers");
                return;
            }
        };
        match std::fs::write(&self.path, text) {
            Ok(()) => info!(
                file = %self.path.display(),
                chargers = map.len(),
                "Learned maximum powers saved"
            ),
            Err(e) => error!(
                file = %self.path.display(),
                error = %e,
                "Cannot save learned powers; keeping values in memory"
            ),
        }
    }
}

#[async_trait]
impl LearnedPowerStore for JsonPowerStore {
    async fn get(&self, charger_id: &str) -> Option<f64> {
        self.powers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(charger_id)
            .copied()
    }

    async fn record(&self, charger_id: &str, watts: f64) {
        let snapshot = {
            let mut guard = self.powers.lock().unwrap_or_else(|e| e.into_inner());
            guard.insert(charger_id.to_string(), watts);
            guard.clone()
        };
        self.write_file(&snapshot);
    }

    async fn all(&self) -> HashMap<String, f64> {
        self.powers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_file() -> PathBuf {
        std::env::temp_dir().join(format!("learned_powers_{}.json", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn missing_file_starts_empty() {
        let store = JsonPowerStore::load(scratch_file());
        assert!(store.all().await.is_empty());
        assert_eq!(store.get("CP-1").await, None);
    }

    #[tokio::test]
    async fn record_survives_reload() {
        let path = scratch_file();
        let store = JsonPowerStore::load(&path);
        store.record("CP-1", 4_500.0).await;
        store.record("CP-2", 3_600.0).await;

        let reloaded = JsonPowerStore::load(&path);
        assert_eq!(reloaded.get("CP-1").await, Some(4_500.0));
        assert_eq!(reloaded.get("CP-2").await, Some(3_600.0));
        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn malformed_file_is_ignored_and_overwritten() {
        let path = scratch_file();
        std::fs::write(&path, "{not json").unwrap();

        let store = JsonPowerStore::load(&path);
        assert!(store.all().await.is_empty());

        store.record("CP-1", 7_500.0).await;
        let reloaded = JsonPowerStore::load(&path);
        assert_eq!(reloaded.get("CP-1").await, Some(7_500.0));
        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn nested_historical_shape_reads_as_empty() {
        let path = scratch_file();
        std::fs::write(&path, r#"{"CP-1": {"learned_max_power": 4000.0}}"#).unwrap();

        let store = JsonPowerStore::load(&path);
        assert!(store.all().await.is_empty());
        std::fs::remove_file(path).unwrap();
    }
}
