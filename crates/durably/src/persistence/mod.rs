//! Snapshot persistence and locking interfaces

mod memory;
mod store;

pub use memory::MemorySnapshotStore;
pub use store::{
    Lease, ListPage, ListQuery, PageQuery, SnapshotListEntry, SnapshotStore, StoreError,
    WorkflowLock,
};
