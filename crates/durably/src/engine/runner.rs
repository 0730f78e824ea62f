//! Durable run loop
//!
//! Drives a single workflow instance through its lifecycle: concurrency
//! gating, lease acquisition, snapshot load, version check, execution with
//! per-step checkpoints, terminal state handling, and guaranteed cleanup.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::active;
use super::options::{RunHooks, RunOptions, VersionPolicy};
use crate::persistence::SnapshotStore;
use crate::step::{decode_result, StepContext};
use crate::workflow::{
    ConcurrencyScope, EventKind, EventSink, NullSink, PersistenceOp, SnapshotStep, WorkflowError,
    WorkflowEvent, WorkflowSnapshot,
};

/// Executes workflow functions durably against a snapshot store
///
/// A runner is cheap to construct and reusable across workflow ids. Without a
/// store it still executes workflows, just without persistence or leasing.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use durably::{MemorySnapshotStore, RunOptions, WorkflowRunner};
///
/// # async fn example() -> Result<(), durably::WorkflowError> {
/// let store = Arc::new(MemorySnapshotStore::new());
/// let runner = WorkflowRunner::new().with_store(store);
///
/// let total: i64 = runner
///     .run("order-42", RunOptions::default(), |ctx| async move {
///         let subtotal: i64 = ctx.step("subtotal", || async { Ok(40) }).await?;
///         let tax: i64 = ctx.step("tax", || async { Ok(2) }).await?;
///         Ok(subtotal + tax)
///     })
///     .await?;
///
/// assert_eq!(total, 42);
/// # Ok(())
/// # }
/// ```
pub struct WorkflowRunner {
    store: Option<Arc<dyn SnapshotStore>>,
    events: Arc<dyn EventSink>,
    hooks: RunHooks,
}

impl WorkflowRunner {
    /// Create a runner with no store: execution only, nothing persisted
    pub fn new() -> Self {
        Self {
            store: None,
            events: Arc::new(NullSink),
            hooks: RunHooks::default(),
        }
    }

    /// Attach the snapshot store (and, via capability probe, its lock)
    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Attach the event sink
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Attach lifecycle hooks
    pub fn with_hooks(mut self, hooks: RunHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// The configured store, if any
    pub fn store(&self) -> Option<&Arc<dyn SnapshotStore>> {
        self.store.as_ref()
    }

    /// Run a workflow function to a terminal outcome
    ///
    /// On success the stored snapshot is deleted before returning; on error,
    /// suspension or cancellation it is retained for a later resume. The
    /// lease and the in-process claim are released on every exit path.
    #[instrument(skip_all, fields(workflow_id = %workflow_id))]
    pub async fn run<F, Fut, T>(
        &self,
        workflow_id: &str,
        options: RunOptions,
        user_fn: F,
    ) -> Result<T, WorkflowError>
    where
        F: FnOnce(StepContext) -> Fut,
        Fut: Future<Output = Result<T, WorkflowError>>,
    {
        let cancel = options.cancellation.clone().unwrap_or_default();

        if cancel.is_cancelled() {
            self.emit(
                workflow_id,
                EventKind::WorkflowCancelled {
                    reason: None,
                    last_step_key: None,
                },
            );
            return Err(WorkflowError::Cancelled {
                reason: None,
                last_step_key: None,
            });
        }

        // In-process half of the concurrency gate; released by guard drop
        let _active = if options.allow_concurrent {
            None
        } else {
            match active::try_claim(workflow_id) {
                Some(guard) => Some(guard),
                None => {
                    return Err(WorkflowError::ConcurrentExecution {
                        reason: ConcurrencyScope::InProcess,
                    })
                }
            }
        };

        // Cross-process half: a lease from the store's lock capability
        let mut lease_token = None;
        if !options.allow_concurrent {
            if let Some(store) = &self.store {
                if let Some(lock) = store.as_lock() {
                    match lock.try_acquire(workflow_id, options.lock_ttl).await {
                        Ok(Some(token)) => lease_token = Some(token),
                        Ok(None) => {
                            return Err(WorkflowError::ConcurrentExecution {
                                reason: ConcurrencyScope::CrossProcess,
                            })
                        }
                        Err(e) => {
                            return Err(WorkflowError::Persistence {
                                operation: PersistenceOp::Load,
                                message: e.to_string(),
                            })
                        }
                    }
                }
            }
        }

        let result = self
            .run_guarded(workflow_id, options, cancel, user_fn)
            .await;

        // Release errors are swallowed: they must never mask the run result
        if let Some(token) = lease_token {
            if let Some(store) = &self.store {
                if let Some(lock) = store.as_lock() {
                    if let Err(e) = lock.release(workflow_id, &token).await {
                        warn!(%workflow_id, error = %e, "lease release failed");
                    }
                }
            }
        }

        result
    }

    async fn run_guarded<F, Fut, T>(
        &self,
        workflow_id: &str,
        options: RunOptions,
        cancel: CancellationToken,
        user_fn: F,
    ) -> Result<T, WorkflowError>
    where
        F: FnOnce(StepContext) -> Fut,
        Fut: Future<Output = Result<T, WorkflowError>>,
    {
        let mut stored = match &self.store {
            Some(store) => store.load(workflow_id).await.map_err(|e| {
                WorkflowError::Persistence {
                    operation: PersistenceOp::Load,
                    message: e.to_string(),
                }
            })?,
            None => None,
        };

        if let Some(snapshot) = stored.take() {
            let stored_version = snapshot.version();
            if stored_version == options.version {
                stored = Some(snapshot);
            } else {
                match &options.on_version_mismatch {
                    VersionPolicy::Fail => {
                        return Err(WorkflowError::VersionMismatch {
                            stored: stored_version,
                            requested: options.version,
                        });
                    }
                    VersionPolicy::Clear => {
                        info!(%workflow_id, stored_version, requested = options.version,
                            "clearing mismatched snapshot");
                        if let Some(store) = &self.store {
                            if let Err(e) = store.delete(workflow_id).await {
                                warn!(%workflow_id, error = %e,
                                    "failed to clear mismatched snapshot");
                            }
                        }
                    }
                    VersionPolicy::Migrate(migrate) => {
                        stored = Some(migrate(snapshot, options.version));
                    }
                }
            }
        }

        // Base state: stored snapshot with explicit resume entries overlaid
        let mut base = stored.unwrap_or_else(|| WorkflowSnapshot::new(workflow_id));
        if let Some(resume) = &options.resume_state {
            for (key, encoded) in &resume.steps {
                let (result, meta) = decode_result(encoded);
                let completed_at = base
                    .steps
                    .get(key)
                    .map(|s| s.completed_at)
                    .unwrap_or_else(Utc::now);
                base.record_step(SnapshotStep {
                    key: key.clone(),
                    result,
                    meta,
                    completed_at,
                });
            }
        }

        let ctx = StepContext::new(
            workflow_id,
            base,
            options.version,
            options.metadata.clone(),
            self.store.clone(),
            self.events.clone(),
            self.hooks.clone(),
            cancel.clone(),
        );

        self.emit(workflow_id, EventKind::WorkflowStart);
        info!(%workflow_id, version = options.version, "workflow run started");

        if let Some(hook) = self.hooks.before_start() {
            self.emit(workflow_id, EventKind::HookBeforeStart);
            if let Err(e) = hook().await {
                warn!(%workflow_id, error = %e, "before-start hook failed");
                self.emit(
                    workflow_id,
                    EventKind::HookBeforeStartError {
                        message: format!("{e:#}"),
                    },
                );
            }
        }

        match user_fn(ctx.clone()).await {
            Ok(value) => {
                if cancel.is_cancelled() {
                    // Late cancellation: the body finished but the caller
                    // asked to stop; state is retained
                    let last_step_key = ctx.last_step_key();
                    self.emit(
                        workflow_id,
                        EventKind::WorkflowCancelled {
                            reason: None,
                            last_step_key: last_step_key.clone(),
                        },
                    );
                    info!(%workflow_id, "workflow run cancelled after completion");
                    return Err(WorkflowError::Cancelled {
                        reason: None,
                        last_step_key,
                    });
                }

                if let Some(store) = &self.store {
                    if let Err(e) = store.delete(workflow_id).await {
                        let error = WorkflowError::Persistence {
                            operation: PersistenceOp::Delete,
                            message: e.to_string(),
                        };
                        self.emit(
                            workflow_id,
                            EventKind::WorkflowError {
                                error: error.clone(),
                            },
                        );
                        return Err(error);
                    }
                }

                self.emit(workflow_id, EventKind::WorkflowSuccess);
                info!(%workflow_id, "workflow run succeeded");
                Ok(value)
            }

            Err(error) if error.is_cancellation() => {
                let (reason, last_step_key) = match &error {
                    WorkflowError::Cancelled {
                        reason,
                        last_step_key,
                    } => (reason.clone(), last_step_key.clone()),
                    _ => (None, None),
                };
                self.emit(
                    workflow_id,
                    EventKind::WorkflowCancelled {
                        reason,
                        last_step_key,
                    },
                );
                info!(%workflow_id, "workflow run cancelled");
                Err(error)
            }

            Err(error) => {
                // A typed step error dominates a concurrently-set
                // cancellation signal
                self.emit(
                    workflow_id,
                    EventKind::WorkflowError {
                        error: error.clone(),
                    },
                );
                info!(%workflow_id, %error, "workflow run failed");
                Err(error)
            }
        }
    }

    fn emit(&self, workflow_id: &str, kind: EventKind) {
        self.events.emit(&WorkflowEvent::now(workflow_id, kind));
    }
}

impl Default for WorkflowRunner {
    fn default() -> Self {
        Self::new()
    }
}
