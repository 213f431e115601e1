//! Shared application state handed to every handler.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::AppConfig;
use crate::services::chunk_store::ChunkStore;
use crate::services::hooks::UploadHooks;

/// Shared state: the chunk store, configuration, lifecycle hooks, and the
/// per-upload locks that serialize mutations on a single uid.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: Arc<dyn ChunkStore>,
    db: SqlitePool,
    config: AppConfig,
    hooks: Arc<dyn UploadHooks>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        db: SqlitePool,
        config: AppConfig,
        hooks: Arc<dyn UploadHooks>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                store,
                db,
                config,
                hooks,
                locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &dyn ChunkStore {
        self.inner.store.as_ref()
    }

    pub fn store_arc(&self) -> Arc<dyn ChunkStore> {
        Arc::clone(&self.inner.store)
    }

    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn hooks(&self) -> &dyn UploadHooks {
        self.inner.hooks.as_ref()
    }

    /// Acquire the mutation lock for one upload. Operations on a single uid
    /// (PATCH, DELETE, concat consumption) hold this for their whole
    /// load-write-persist sequence.
    pub async fn lock_upload(&self, uid: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.locks.lock().await;
            Arc::clone(locks.entry(uid.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop the lock entry for a terminated upload.
    pub async fn forget_lock(&self, uid: &str) {
        self.inner.locks.lock().await.remove(uid);
    }
}
