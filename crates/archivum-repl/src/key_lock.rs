//! Per-(tenant, category) serialization of reconstruction runs.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::TenantId;

/// Lazily created async mutexes keyed by (tenant, category).
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: DashMap<(TenantId, String), Arc<Mutex<()>>>,
}

impl KeyLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to the pair.
    pub async fn lock(&self, tenant: TenantId, category: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry((tenant, category.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Number of pairs ever locked.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True when no pair was ever locked.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
