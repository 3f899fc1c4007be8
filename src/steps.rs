use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StepError {
    #[error("step store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("step output could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait StepStore: Send + Sync {
    async fn get(&self, event_id: &str, step: &str) -> Result<Option<Value>, StepError>;

    async fn put(&self, event_id: &str, step: &str, output: &Value) -> Result<(), StepError>;
}

#[derive(Debug, Default)]
pub struct MemoryStepStore {
    entries: Mutex<HashMap<(String, String), Value>>,
}

impl MemoryStepStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed(&self, event_id: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .lock()
            .unwrap()
            .keys()
            .filter(|(event, _)| event == event_id)
            .map(|(_, step)| step.clone())
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl StepStore for MemoryStepStore {
    async fn get(&self, event_id: &str, step: &str) -> Result<Option<Value>, StepError> {
        let key = (event_id.to_string(), step.to_string());
        Ok(self.entries.lock().unwrap().get(&key).cloned())
    }

    async fn put(&self, event_id: &str, step: &str, output: &Value) -> Result<(), StepError> {
        self.entries
            .lock()
            .unwrap()
            .insert((event_id.to_string(), step.to_string()), output.clone());
        Ok(())
    }
}

/// Stores each step as `<dir>/<event id>/<step>.json`.
#[derive(Debug, Clone)]
pub struct FileStepStore {
    dir: PathBuf,
}

impl FileStepStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, event_id: &str, step: &str) -> PathBuf {
        self.dir
            .join(file_safe(event_id))
            .join(format!("{}.json", file_safe(step)))
    }
}

fn file_safe(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        _ => cleaned,
    }
}

#[async_trait]
impl StepStore for FileStepStore {
    async fn get(&self, event_id: &str, step: &str) -> Result<Option<Value>, StepError> {
        match tokio::fs::read(self.path(event_id, step)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn put(&self, event_id: &str, step: &str, output: &Value) -> Result<(), StepError> {
        let path = self.path(event_id, step);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_json::to_vec(output)?).await?;
        Ok(())
    }
}

/// Step runner bound to one triggering event.
#[derive(Clone)]
pub struct Steps {
    store: Arc<dyn StepStore>,
    event_id: String,
}

impl Steps {
    pub fn new(store: Arc<dyn StepStore>, event_id: impl Into<String>) -> Self {
        Self {
            store,
            event_id: event_id.into(),
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// Returns the stored output of `name` if it already completed for this
    /// event. Otherwise awaits `work` and stores its output on success.
    pub async fn run<T, E, F>(&self, name: &str, work: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<StepError>,
        F: Future<Output = Result<T, E>>,
    {
        if let Some(stored) = self.store.get(&self.event_id, name).await? {
            debug!(event_id = %self.event_id, step = name, "replaying completed step");
            return Ok(serde_json::from_value(stored).map_err(StepError::from)?);
        }

        let output = work.await?;
        let value = serde_json::to_value(&output).map_err(StepError::from)?;
        self.store.put(&self.event_id, name, &value).await?;
        debug!(event_id = %self.event_id, step = name, "step completed");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Error)]
    enum TestError {
        #[error(transparent)]
        Step(#[from] StepError),
        #[error("boom")]
        Boom,
    }

    #[tokio::test]
    async fn completed_steps_are_not_rerun() {
        let store = Arc::new(MemoryStepStore::new());
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let steps = Steps::new(store.clone(), "evt-1");
            let value: u32 = steps
                .run("count", async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, TestError>(7)
                })
                .await
                .unwrap();
            assert_eq!(value, 7);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.completed("evt-1"), vec!["count".to_string()]);
    }

    #[tokio::test]
    async fn failed_steps_store_nothing() {
        let store = Arc::new(MemoryStepStore::new());
        let steps = Steps::new(store.clone(), "evt-1");

        let result: Result<u32, TestError> = steps.run("flaky", async { Err(TestError::Boom) }).await;
        assert!(matches!(result, Err(TestError::Boom)));
        assert!(store.completed("evt-1").is_empty());

        let retried: u32 = steps.run("flaky", async { Ok::<_, TestError>(1) }).await.unwrap();
        assert_eq!(retried, 1);
    }

    #[tokio::test]
    async fn file_store_round_trips_under_safe_names() {
        let dir = std::env::temp_dir().join(format!("replaykit-steps-{}", uuid::Uuid::new_v4()));
        let store = FileStepStore::new(&dir);

        assert!(store.get("evt/1", "persist-results").await.unwrap().is_none());
        store
            .put("evt/1", "persist-results", &serde_json::json!({ "url": "x" }))
            .await
            .unwrap();

        assert!(dir.join("evt_1").join("persist-results.json").exists());
        assert_eq!(
            store.get("evt/1", "persist-results").await.unwrap(),
            Some(serde_json::json!({ "url": "x" }))
        );
        std::fs::remove_dir_all(dir).unwrap();
    }
}
