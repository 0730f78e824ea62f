//! Workflow-level types: errors, snapshots, events

mod error;
mod event;
mod snapshot;

pub use error::{ConcurrencyScope, PersistenceOp, WorkflowError};
pub use event::{BufferSink, EventKind, EventSink, NullSink, WorkflowEvent};
pub use snapshot::{
    ResumeState, SnapshotStep, WorkflowSnapshot, DEFAULT_VERSION, LAST_STEP_KEY, VERSION_KEY,
};
