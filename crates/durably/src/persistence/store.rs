//! SnapshotStore and WorkflowLock trait definitions

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workflow::WorkflowSnapshot;

/// Error type for store and lock operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend failure (connection, I/O, query)
    #[error("backend error: {0}")]
    Backend(String),

    /// Snapshot could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The backend does not implement an optional operation
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// A TTL-bounded, token-authenticated right to execute a workflow id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub workflow_id: String,

    /// Opaque token; only the holder may release before expiry
    pub owner_token: String,

    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Entry returned by [`SnapshotStore::list`]
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotListEntry {
    pub id: String,
    pub updated_at: DateTime<Utc>,
}

/// Filter for listing snapshots
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub prefix: Option<String>,
    pub limit: Option<usize>,
}

impl ListQuery {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Offset-paginated listing parameters
#[derive(Debug, Clone)]
pub struct PageQuery {
    pub offset: usize,
    pub limit: usize,
    pub prefix: Option<String>,
}

impl Default for PageQuery {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
            prefix: None,
        }
    }
}

/// One page of snapshot listings plus the total matching count
#[derive(Debug, Clone)]
pub struct ListPage {
    pub entries: Vec<SnapshotListEntry>,
    pub total: usize,
}

/// Store for workflow snapshots
///
/// The engine persists one snapshot per workflow id, overwriting on every
/// checkpoint and deleting on terminal success. Implementations must be
/// thread-safe; the engine accesses them serially per workflow run but runs
/// for distinct ids may execute simultaneously.
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    /// Persist (upsert) the snapshot for a workflow id
    async fn save(&self, id: &str, snapshot: &WorkflowSnapshot) -> Result<(), StoreError>;

    /// Load the snapshot for a workflow id, if one exists
    async fn load(&self, id: &str) -> Result<Option<WorkflowSnapshot>, StoreError>;

    /// Remove the snapshot for a workflow id (no-op when absent)
    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// List stored snapshots, newest first
    async fn list(&self, query: ListQuery) -> Result<Vec<SnapshotListEntry>, StoreError>;

    /// Release backend resources
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Remove every stored snapshot (optional)
    async fn clear(&self) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("clear"))
    }

    /// Remove a batch of snapshots (optional; default deletes one by one)
    async fn delete_many(&self, ids: &[String]) -> Result<(), StoreError> {
        for id in ids {
            self.delete(id).await?;
        }
        Ok(())
    }

    /// Offset-paginated listing (optional)
    async fn list_page(&self, _page: PageQuery) -> Result<ListPage, StoreError> {
        Err(StoreError::Unsupported("list_page"))
    }

    /// Capability probe for cross-process locking
    ///
    /// Stores that can arbitrate exclusive execution return themselves here;
    /// the run loop consults this when `allow_concurrent` is off.
    fn as_lock(&self) -> Option<&dyn WorkflowLock> {
        None
    }
}

/// Cross-process exclusive execution of a workflow id via a leased lock
///
/// Acquire is a conditional insert: it succeeds when no lease exists for the
/// id or the existing lease has expired, and the returned token must be the
/// one just written. Release deletes only when both id and token match, so a
/// stale process cannot unlock another holder.
#[async_trait]
pub trait WorkflowLock: Send + Sync {
    /// Try to acquire the lease; `None` when another holder is active
    async fn try_acquire(&self, id: &str, ttl: Duration) -> Result<Option<String>, StoreError>;

    /// Release the lease held under `owner_token`
    async fn release(&self, id: &str, owner_token: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_expiry() {
        let live = Lease {
            workflow_id: "wf".to_string(),
            owner_token: "t".to_string(),
            expires_at: Utc::now() + chrono::Duration::seconds(60),
        };
        assert!(!live.is_expired());

        let stale = Lease {
            expires_at: Utc::now() - chrono::Duration::seconds(1),
            ..live
        };
        assert!(stale.is_expired());
    }

    #[test]
    fn test_list_query_builder() {
        let query = ListQuery::default().with_prefix("order-").with_limit(10);
        assert_eq!(query.prefix.as_deref(), Some("order-"));
        assert_eq!(query.limit, Some(10));
    }
}
