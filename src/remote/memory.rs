// In-memory object store (for testing/development)
// Supports fault injection so retry and cleanup paths can be exercised

use super::{ObjectInfo, ObjectStore, PutOptions, RemoteError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    last_modified: DateTime<Utc>,
    options: PutOptions,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, StoredObject>,
    failing_puts: usize,
    rejected_suffix: Option<String>,
    stalled: Option<(String, Duration)>,
}

/// Bucket held in process memory
#[derive(Debug, Clone)]
pub struct MemoryObjectStore {
    bucket: String,
    state: Arc<RwLock<State>>,
}

impl MemoryObjectStore {
    /// Empty bucket
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            state: Arc::new(RwLock::new(State::default())),
        }
    }

    /// The next `count` puts fail with a transient error
    pub async fn fail_next_puts(&self, count: usize) {
        self.state.write().await.failing_puts = count;
    }

    /// Every put of a key ending in `suffix` is refused outright
    pub async fn reject_puts_ending_with(&self, suffix: impl Into<String>) {
        self.state.write().await.rejected_suffix = Some(suffix.into());
    }

    /// Puts of keys ending in `suffix` wait `delay` before storing anything
    pub async fn stall_puts_ending_with(&self, suffix: impl Into<String>, delay: Duration) {
        self.state.write().await.stalled = Some((suffix.into(), delay));
    }

    /// Flip a bit in a stored object
    pub async fn corrupt(&self, key: &str) -> bool {
        let mut state = self.state.write().await;
        match state.objects.get_mut(key).and_then(|o| o.data.first_mut()) {
            Some(byte) => {
                *byte ^= 0x01;
                true
            }
            None => false,
        }
    }

    /// Backdate an object
    pub async fn set_last_modified(&self, key: &str, at: DateTime<Utc>) {
        if let Some(object) = self.state.write().await.objects.get_mut(key) {
            object.last_modified = at;
        }
    }

    /// All keys, sorted
    pub async fn keys(&self) -> Vec<String> {
        self.state.read().await.objects.keys().cloned().collect()
    }

    /// Stored bytes of `key`
    pub async fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state.read().await.objects.get(key).map(|o| o.data.clone())
    }

    /// Options `key` was stored with
    pub async fn put_options(&self, key: &str) -> Option<PutOptions> {
        self.state.read().await.objects.get(key).map(|o| o.options.clone())
    }

    /// Store raw bytes directly, bypassing put options
    pub async fn insert(&self, key: impl Into<String>, data: Vec<u8>) {
        self.state.write().await.objects.insert(
            key.into(),
            StoredObject {
                data,
                last_modified: Utc::now(),
                options: PutOptions {
                    storage_class: None,
                    server_side_encryption: false,
                },
            },
        );
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, key: &str, source: &Path, options: &PutOptions) -> Result<(), RemoteError> {
        let stall = {
            let mut state = self.state.write().await;
            if state.failing_puts > 0 {
                state.failing_puts -= 1;
                return Err(RemoteError::Transfer(format!("injected failure for {}", key)));
            }
            if state.rejected_suffix.as_deref().is_some_and(|s| key.ends_with(s)) {
                return Err(RemoteError::Rejected(format!("{} refused", key)));
            }
            state
                .stalled
                .as_ref()
                .filter(|(suffix, _)| key.ends_with(suffix.as_str()))
                .map(|(_, delay)| *delay)
        };
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }

        let data = tokio::fs::read(source).await?;
        self.state.write().await.objects.insert(
            key.to_string(),
            StoredObject {
                data,
                last_modified: Utc::now(),
                options: options.clone(),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str, dest: &Path) -> Result<(), RemoteError> {
        let data = self
            .state
            .read()
            .await
            .objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| RemoteError::NotFound(key.to_string()))?;
        tokio::fs::write(dest, data).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, RemoteError> {
        Ok(self
            .state
            .read()
            .await
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectInfo {
                key: key.clone(),
                size: object.data.len() as u64,
                last_modified: Some(object.last_modified),
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), RemoteError> {
        self.state.write().await.objects.remove(key);
        Ok(())
    }
}
