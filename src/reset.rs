use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use crate::{store::Store, Result, StoreError, StoreErrorPolicy, StoreOp};

struct Target {
    store: Arc<dyn Store>,
    key: String,
    actor: Option<String>,
    on_error: Arc<dyn StoreErrorPolicy>,
}

/// Reset shortcut collected while a request passes through one or more
/// guards.
///
/// Clones share the same list, so every guard that sees the same
/// [`RequestContext`](crate::RequestContext) appends to it and a single
/// [`reset_all`](Self::reset_all) unlocks all of them.
#[derive(Clone, Default)]
pub struct ResetHandle {
    targets: Arc<Mutex<Vec<Target>>>,
}

impl ResetHandle {
    pub(crate) fn push(
        &self,
        store: Arc<dyn Store>,
        key: String,
        actor: Option<String>,
        on_error: Arc<dyn StoreErrorPolicy>,
    ) {
        let mut targets = self.targets.lock().unwrap_or_else(PoisonError::into_inner);
        let duplicate = targets
            .iter()
            .any(|target| target.key == key && Arc::ptr_eq(&target.store, &store));
        if !duplicate {
            targets.push(Target {
                store,
                key,
                actor,
                on_error,
            });
        }
    }

    /// Store keys queued for reset, in the order they were touched.
    pub fn keys(&self) -> Vec<String> {
        self.targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|target| target.key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clears every queued key and empties the list.
    ///
    /// All keys are attempted even if one fails; failures go through the
    /// owning tracker's store error policy and the first escalated one is
    /// returned.
    pub async fn reset_all(&self) -> Result<()> {
        let targets = std::mem::take(
            &mut *self.targets.lock().unwrap_or_else(PoisonError::into_inner),
        );

        let mut first_error = None;
        for target in targets {
            if let Err(source) = target.store.reset(&target.key).await {
                let err = StoreError {
                    operation: StoreOp::Reset,
                    key: target.key,
                    actor: target.actor,
                    source,
                };
                if let Err(err) = target.on_error.on_store_error(err) {
                    first_error.get_or_insert(err);
                }
                continue;
            }
            #[cfg(feature = "tracing")]
            tracing::debug!(key = %target.key, "reset via request shortcut");
        }

        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ResetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResetHandle")
            .field("keys", &self.keys())
            .finish()
    }
}
