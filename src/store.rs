use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::task::{yield_now, JoinHandle};

use crate::{AttemptRecord, BoxError};

/// Backend that keeps attempt records with a time-to-live.
///
/// Implementations may be in-process, networked or transactional. Every
/// operation must complete asynchronously, even when the answer is known
/// immediately.
#[async_trait]
pub trait Store: Send + Sync {
    /// Returns the record stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<AttemptRecord>, BoxError>;

    /// Stores `record` under `key`. The record expires after
    /// `lifetime_secs`; `0` means it never expires on its own.
    async fn set(&self, key: &str, record: AttemptRecord, lifetime_secs: u64)
        -> Result<(), BoxError>;

    /// Removes `key`. Missing keys are not an error.
    async fn reset(&self, key: &str) -> Result<(), BoxError>;
}

struct Entry {
    record: AttemptRecord,
    generation: u64,
    expiry: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Shared {
    entries: Mutex<HashMap<String, Entry>>,
    generation: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let entries = self
            .entries
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for entry in entries.values_mut() {
            if let Some(expiry) = entry.expiry.take() {
                expiry.abort();
            }
        }
    }
}

/// In-process store keeping one expiry timer per key.
///
/// Clones share the same map. Timers are tokio tasks, so `set` must be
/// awaited inside a tokio runtime.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.shared.lock().contains_key(key)
    }

    fn schedule_expiry(&self, key: &str, generation: u64, lifetime_secs: u64) -> JoinHandle<()> {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let key = key.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(lifetime_secs)).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let mut entries = shared.lock();
            // A newer set may have raced this timer; only drop our own entry.
            if entries
                .get(&key)
                .is_some_and(|entry| entry.generation == generation)
            {
                entries.remove(&key);
                #[cfg(feature = "tracing")]
                tracing::debug!(key = %key, "attempt record expired");
            }
        })
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.len())
            .finish()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<AttemptRecord>, BoxError> {
        yield_now().await;
        Ok(self.shared.lock().get(key).map(|entry| entry.record))
    }

    async fn set(
        &self,
        key: &str,
        record: AttemptRecord,
        lifetime_secs: u64,
    ) -> Result<(), BoxError> {
        yield_now().await;
        let generation = self.shared.generation.fetch_add(1, Ordering::Relaxed);
        let expiry = (lifetime_secs > 0).then(|| self.schedule_expiry(key, generation, lifetime_secs));

        let previous = self.shared.lock().insert(
            key.to_owned(),
            Entry {
                record,
                generation,
                expiry,
            },
        );
        if let Some(expiry) = previous.and_then(|entry| entry.expiry) {
            expiry.abort();
        }
        Ok(())
    }

    async fn reset(&self, key: &str) -> Result<(), BoxError> {
        yield_now().await;
        let removed = self.shared.lock().remove(key);
        if let Some(expiry) = removed.and_then(|entry| entry.expiry) {
            expiry.abort();
        }
        Ok(())
    }
}
