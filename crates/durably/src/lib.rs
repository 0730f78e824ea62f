//! # Durably
//!
//! A durable workflow execution engine: run user-authored procedures composed
//! of discrete, named steps, recording each step's outcome so a crashed or
//! suspended execution resumes deterministically from where it left off.
//!
//! ## Features
//!
//! - **Replayable steps**: each keyed step executes at most once per workflow
//!   lifetime; completed outcomes (successes and failures alike) are cached
//!   and served back on replay without re-running the operation
//! - **Checkpointing**: the merged snapshot is persisted after every keyed
//!   step; checkpoint write failures never abort the run
//! - **Human-in-the-loop**: approval steps, gated operations and pending
//!   hooks suspend the workflow with a typed error and resume once the
//!   external decision is injected
//! - **Exclusive execution**: an in-process active set plus an optional
//!   cross-process lease keep at most one run per workflow id
//! - **Cooperative cancellation**: one cancellation signal observed at every
//!   step boundary and inside sleeps, timeouts and retries
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowRunner                          │
//! │  (lease, load, version check, terminal outcome, cleanup)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       StepContext                            │
//! │  (replay cache, classification, per-step checkpoints)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              SnapshotStore (+ WorkflowLock)                  │
//! │  (one snapshot per workflow id; token-authenticated lease)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use durably::{MemorySnapshotStore, RunOptions, WorkflowError, WorkflowRunner};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), WorkflowError> {
//! let store = Arc::new(MemorySnapshotStore::new());
//! let runner = WorkflowRunner::new().with_store(store);
//!
//! let shipped: bool = runner
//!     .run("order-42", RunOptions::default(), |ctx| async move {
//!         let order: serde_json::Value = ctx
//!             .step("fetch-order", || async {
//!                 Ok(serde_json::json!({"id": 42, "items": 3}))
//!             })
//!             .await?;
//!
//!         let _label: String = ctx
//!             .step("print-label", || async move {
//!                 Ok(format!("order-{}", order["id"]))
//!             })
//!             .await?;
//!
//!         Ok(true)
//!     })
//!     .await?;
//!
//! assert!(shipped);
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod persistence;
pub mod step;
pub mod suspend;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::engine::{RunHooks, RunOptions, VersionPolicy, WorkflowRunner};
    pub use crate::persistence::{
        Lease, ListQuery, MemorySnapshotStore, SnapshotStore, StoreError, WorkflowLock,
    };
    pub use crate::step::{
        ChildFuture, RetrySchedule, StepContext, StepFailureMeta, StepResult, StepSpec,
    };
    pub use crate::suspend::{
        check_approval, create_hook, ApprovalCheck, ApprovalStateCollector, ApprovalStore,
        GatedStepOptions, HookHandle, MemoryApprovalStore, ResumeStateCollector,
    };
    pub use crate::workflow::{
        EventKind, EventSink, ResumeState, WorkflowError, WorkflowEvent, WorkflowSnapshot,
    };
}

// Re-export key types at crate root
pub use engine::{RunHooks, RunOptions, VersionPolicy, WorkflowRunner};
pub use persistence::{
    Lease, ListQuery, MemorySnapshotStore, SnapshotStore, StoreError, WorkflowLock,
};
pub use step::{RetrySchedule, StepContext, StepFailureMeta, StepResult, StepSpec};
pub use suspend::{
    create_hook, ApprovalCheck, ApprovalStateCollector, ApprovalStore, GatedStepOptions,
    HookHandle, MemoryApprovalStore, ResumeStateCollector,
};
pub use workflow::{
    EventKind, EventSink, ResumeState, WorkflowError, WorkflowEvent, WorkflowSnapshot,
};
