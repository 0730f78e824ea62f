//! In-memory implementation of SnapshotStore and WorkflowLock
//!
//! Primarily for tests and embedded use. Provides the same semantics as a
//! database-backed adapter: atomic lease acquire under a write lock, verified
//! release, and listing newest first.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::{
    Lease, ListPage, ListQuery, PageQuery, SnapshotListEntry, SnapshotStore, StoreError,
    WorkflowLock,
};
use crate::workflow::WorkflowSnapshot;

struct StoredSnapshot {
    snapshot: WorkflowSnapshot,
    updated_at: DateTime<Utc>,
}

/// In-memory snapshot store with lease support
///
/// # Example
///
/// ```
/// use durably::MemorySnapshotStore;
///
/// let store = MemorySnapshotStore::new();
/// assert_eq!(store.snapshot_count(), 0);
/// ```
pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<String, StoredSnapshot>>,
    leases: RwLock<HashMap<String, Lease>>,
}

impl MemorySnapshotStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
            leases: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored snapshots
    pub fn snapshot_count(&self) -> usize {
        self.snapshots.read().len()
    }

    /// Number of leases, including expired ones not yet reclaimed
    pub fn lease_count(&self) -> usize {
        self.leases.read().len()
    }

    /// The current lease for a workflow id, if any
    pub fn lease_for(&self, id: &str) -> Option<Lease> {
        self.leases.read().get(id).cloned()
    }
}

impl Default for MemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, id: &str, snapshot: &WorkflowSnapshot) -> Result<(), StoreError> {
        self.snapshots.write().insert(
            id.to_string(),
            StoredSnapshot {
                snapshot: snapshot.clone(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<WorkflowSnapshot>, StoreError> {
        Ok(self
            .snapshots
            .read()
            .get(id)
            .map(|stored| stored.snapshot.clone()))
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.snapshots.write().remove(id);
        Ok(())
    }

    async fn list(&self, query: ListQuery) -> Result<Vec<SnapshotListEntry>, StoreError> {
        let snapshots = self.snapshots.read();
        let mut entries: Vec<_> = snapshots
            .iter()
            .filter(|(id, _)| match &query.prefix {
                Some(prefix) => id.starts_with(prefix.as_str()),
                None => true,
            })
            .map(|(id, stored)| SnapshotListEntry {
                id: id.clone(),
                updated_at: stored.updated_at,
            })
            .collect();

        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if let Some(limit) = query.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.snapshots.write().clear();
        Ok(())
    }

    async fn list_page(&self, page: PageQuery) -> Result<ListPage, StoreError> {
        let all = self
            .list(ListQuery {
                prefix: page.prefix.clone(),
                limit: None,
            })
            .await?;
        let total = all.len();
        let entries = all
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect();
        Ok(ListPage { entries, total })
    }

    fn as_lock(&self) -> Option<&dyn WorkflowLock> {
        Some(self)
    }
}

#[async_trait]
impl WorkflowLock for MemorySnapshotStore {
    async fn try_acquire(&self, id: &str, ttl: Duration) -> Result<Option<String>, StoreError> {
        let mut leases = self.leases.write();

        if let Some(existing) = leases.get(id) {
            if !existing.is_expired() {
                return Ok(None);
            }
        }

        let lease = Lease {
            workflow_id: id.to_string(),
            owner_token: Uuid::now_v7().to_string(),
            expires_at: Utc::now()
                + chrono::Duration::from_std(ttl)
                    .map_err(|e| StoreError::Backend(format!("invalid ttl: {e}")))?,
        };
        let token = lease.owner_token.clone();
        leases.insert(id.to_string(), lease);

        // Read back the just-written row before declaring success
        match leases.get(id) {
            Some(written) if written.owner_token == token => Ok(Some(token)),
            _ => Ok(None),
        }
    }

    async fn release(&self, id: &str, owner_token: &str) -> Result<(), StoreError> {
        let mut leases = self.leases.write();
        if let Some(existing) = leases.get(id) {
            if existing.owner_token == owner_token {
                leases.remove(id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: &str) -> WorkflowSnapshot {
        WorkflowSnapshot::new(id)
    }

    #[tokio::test]
    async fn test_save_load_delete() {
        let store = MemorySnapshotStore::new();

        store.save("wf-1", &snapshot("wf-1")).await.unwrap();
        assert_eq!(store.snapshot_count(), 1);

        let loaded = store.load("wf-1").await.unwrap();
        assert_eq!(loaded, Some(snapshot("wf-1")));

        store.delete("wf-1").await.unwrap();
        assert_eq!(store.load("wf-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_missing_is_noop() {
        let store = MemorySnapshotStore::new();
        store.delete("missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_with_prefix_and_limit() {
        let store = MemorySnapshotStore::new();
        store.save("order-1", &snapshot("order-1")).await.unwrap();
        store.save("order-2", &snapshot("order-2")).await.unwrap();
        store.save("invoice-1", &snapshot("invoice-1")).await.unwrap();

        let entries = store
            .list(ListQuery::default().with_prefix("order-"))
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);

        let limited = store
            .list(ListQuery::default().with_limit(1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_list_page() {
        let store = MemorySnapshotStore::new();
        for i in 0..5 {
            store
                .save(&format!("wf-{i}"), &snapshot(&format!("wf-{i}")))
                .await
                .unwrap();
        }

        let page = store
            .list_page(PageQuery {
                offset: 2,
                limit: 2,
                prefix: None,
            })
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.entries.len(), 2);
    }

    #[tokio::test]
    async fn test_lease_single_holder() {
        let store = MemorySnapshotStore::new();
        let ttl = Duration::from_secs(60);

        let token = store.try_acquire("wf-1", ttl).await.unwrap();
        assert!(token.is_some());

        let contender = store.try_acquire("wf-1", ttl).await.unwrap();
        assert!(contender.is_none());
    }

    #[tokio::test]
    async fn test_release_requires_matching_token() {
        let store = MemorySnapshotStore::new();
        let ttl = Duration::from_secs(60);

        let token = store.try_acquire("wf-1", ttl).await.unwrap().unwrap();

        store.release("wf-1", "not-the-token").await.unwrap();
        assert_eq!(store.lease_count(), 1);

        store.release("wf-1", &token).await.unwrap();
        assert_eq!(store.lease_count(), 0);

        let reacquired = store.try_acquire("wf-1", ttl).await.unwrap();
        assert!(reacquired.is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken() {
        let store = MemorySnapshotStore::new();

        let first = store
            .try_acquire("wf-1", Duration::from_millis(0))
            .await
            .unwrap();
        assert!(first.is_some());

        let second = store
            .try_acquire("wf-1", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(second.is_some());
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_capability_probe() {
        let store = MemorySnapshotStore::new();
        assert!(SnapshotStore::as_lock(&store).is_some());
    }
}
