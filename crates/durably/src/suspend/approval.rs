//! Human-in-the-loop approval steps
//!
//! An approval step is an ordinary keyed step whose operation asks an
//! external checker whether a human has decided yet. A pending decision
//! becomes a cached `PendingApproval` error: the workflow terminates, the
//! snapshot keeps the pending entry, and a later run with the approved value
//! injected resumes past the step.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::persistence::StoreError;
use crate::step::StepContext;
use crate::workflow::{PersistenceOp, WorkflowError};

/// Outcome of consulting an approval checker
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalCheck {
    /// No decision yet; the step suspends
    Pending,

    /// Approved, with the value the step should produce
    Approved(Value),

    /// Rejected, with the reviewer's reason
    Rejected(String),
}

type ApprovalCheckFn = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<ApprovalCheck, WorkflowError>> + Send>>
        + Send
        + Sync,
>;

/// Configuration for a gated step
///
/// The gate is evaluated before the operation runs: workflows can require a
/// human sign-off for some invocations (large amounts, production targets)
/// while letting routine ones through untouched.
#[derive(Clone)]
pub struct GatedStepOptions {
    key: String,
    description: Option<String>,
    metadata: Map<String, Value>,
    requires_approval: Arc<dyn Fn(&Value) -> bool + Send + Sync>,
    check_approval: Option<ApprovalCheckFn>,
}

impl GatedStepOptions {
    /// Gate the step under the given key; approval is required for every
    /// invocation until narrowed with [`require_when`](Self::require_when)
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            description: None,
            metadata: Map::new(),
            requires_approval: Arc::new(|_| true),
            check_approval: None,
        }
    }

    /// Human-readable description surfaced to approval UIs
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Extra metadata surfaced to approval UIs
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Only require approval when the predicate matches the arguments
    pub fn require_when(
        mut self,
        predicate: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.requires_approval = Arc::new(predicate);
        self
    }

    /// Consult a checker instead of suspending unconditionally
    pub fn with_checker<F, Fut>(mut self, checker: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ApprovalCheck, WorkflowError>> + Send + 'static,
    {
        self.check_approval = Some(Arc::new(move || Box::pin(checker())));
        self
    }
}

impl StepContext {
    /// A keyed step whose value comes from a human decision
    ///
    /// `Pending` suspends the workflow with a cached `PendingApproval`;
    /// `Approved` produces the value; `Rejected` fails the step with
    /// `ApprovalRejected`.
    pub async fn approval_step<F, Fut>(&self, key: &str, check: F) -> Result<Value, WorkflowError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ApprovalCheck, WorkflowError>>,
    {
        let step_key = key.to_string();
        self.step(key, move || async move {
            match check().await? {
                ApprovalCheck::Pending => Err(WorkflowError::pending_approval(&step_key)),
                ApprovalCheck::Approved(value) => Ok(value),
                ApprovalCheck::Rejected(reason) => {
                    Err(WorkflowError::approval_rejected(&step_key, reason))
                }
            }
        })
        .await
    }

    /// A keyed step whose operation only runs once its arguments are approved
    ///
    /// When the gate trips and no decision exists yet, the resulting
    /// `PendingApproval` carries the unexecuted arguments and a
    /// `gatedOperation` marker so approval UIs can show exactly what would
    /// run. An approved decision may carry edited arguments; the operation
    /// receives those instead of the originals.
    pub async fn gated_step<F, Fut>(
        &self,
        options: GatedStepOptions,
        args: Value,
        op: F,
    ) -> Result<Value, WorkflowError>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<Value, WorkflowError>>,
    {
        let key = options.key.clone();
        self.step(key.as_str(), move || async move {
            if !(options.requires_approval)(&args) {
                return op(args).await;
            }

            let check = match &options.check_approval {
                Some(checker) => checker().await?,
                None => ApprovalCheck::Pending,
            };

            match check {
                ApprovalCheck::Pending => {
                    let mut metadata = options.metadata;
                    metadata.insert("args".to_string(), args);
                    metadata.insert("gatedOperation".to_string(), Value::Bool(true));
                    if let Some(description) = &options.description {
                        metadata
                            .insert("description".to_string(), Value::String(description.clone()));
                    }

                    let mut error =
                        WorkflowError::pending_approval(&options.key).with_metadata(metadata);
                    if let Some(description) = options.description {
                        error = error.with_reason(description);
                    }
                    Err(error)
                }
                ApprovalCheck::Approved(approved) => {
                    // A null decision approves the original arguments as-is
                    let effective = if approved.is_null() { args } else { approved };
                    op(effective).await
                }
                ApprovalCheck::Rejected(reason) => {
                    Err(WorkflowError::approval_rejected(&options.key, reason))
                }
            }
        })
        .await
    }
}

// =============================================================================
// Approval store
// =============================================================================

/// Decision state of one approval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,

    Approved {
        value: Value,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        approved_by: Option<String>,
    },

    Rejected {
        reason: String,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        rejected_by: Option<String>,
    },

    Expired,

    /// Approved with modified arguments; the original is kept for audit
    Edited {
        original: Value,
        edited: Value,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        edited_by: Option<String>,
    },
}

/// One approval request tracked by an [`ApprovalStore`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub key: String,

    pub status: ApprovalStatus,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl ApprovalRecord {
    pub fn is_expired(&self) -> bool {
        matches!(self.status, ApprovalStatus::Expired)
            || self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}

/// Store tracking approval decisions for the HITL orchestrator
#[async_trait]
pub trait ApprovalStore: Send + Sync + 'static {
    async fn get_approval(&self, key: &str) -> Result<Option<ApprovalRecord>, StoreError>;

    async fn create_approval(
        &self,
        key: &str,
        metadata: Map<String, Value>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    async fn grant_approval(
        &self,
        key: &str,
        value: Value,
        approved_by: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn reject_approval(
        &self,
        key: &str,
        reason: &str,
        rejected_by: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Approve with modified arguments, keeping the original for audit
    async fn edit_approval(
        &self,
        key: &str,
        original: Value,
        edited: Value,
        edited_by: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Withdraw a request entirely
    async fn cancel_approval(&self, key: &str) -> Result<(), StoreError>;

    /// Unexpired pending requests, optionally filtered by key prefix
    async fn list_pending(&self, prefix: Option<&str>) -> Result<Vec<ApprovalRecord>, StoreError>;
}

/// Consult an approval store and fold its status into an [`ApprovalCheck`]
///
/// A missing record is created (so approval UIs see the request) and reported
/// pending. `Edited` checks as approved with the edited value; `Expired`
/// checks as rejected.
pub async fn check_approval(
    store: &dyn ApprovalStore,
    key: &str,
) -> Result<ApprovalCheck, WorkflowError> {
    let persistence = |e: StoreError| WorkflowError::Persistence {
        operation: PersistenceOp::Load,
        message: e.to_string(),
    };

    let record = match store.get_approval(key).await.map_err(persistence)? {
        Some(record) => record,
        None => {
            store
                .create_approval(key, Map::new(), None)
                .await
                .map_err(persistence)?;
            return Ok(ApprovalCheck::Pending);
        }
    };

    if record.is_expired() {
        return Ok(ApprovalCheck::Rejected("approval expired".to_string()));
    }

    Ok(match record.status {
        ApprovalStatus::Pending => ApprovalCheck::Pending,
        ApprovalStatus::Approved { value, .. } => ApprovalCheck::Approved(value),
        ApprovalStatus::Rejected { reason, .. } => ApprovalCheck::Rejected(reason),
        ApprovalStatus::Expired => ApprovalCheck::Rejected("approval expired".to_string()),
        ApprovalStatus::Edited { edited, .. } => ApprovalCheck::Approved(edited),
    })
}

/// In-memory approval store for tests and embedded use
#[derive(Default)]
pub struct MemoryApprovalStore {
    records: RwLock<std::collections::HashMap<String, ApprovalRecord>>,
}

impl MemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn approval_count(&self) -> usize {
        self.records.read().len()
    }
}

#[async_trait]
impl ApprovalStore for MemoryApprovalStore {
    async fn get_approval(&self, key: &str) -> Result<Option<ApprovalRecord>, StoreError> {
        Ok(self.records.read().get(key).cloned())
    }

    async fn create_approval(
        &self,
        key: &str,
        metadata: Map<String, Value>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        self.records.write().insert(
            key.to_string(),
            ApprovalRecord {
                key: key.to_string(),
                status: ApprovalStatus::Pending,
                metadata,
                expires_at,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn grant_approval(
        &self,
        key: &str,
        value: Value,
        approved_by: Option<&str>,
    ) -> Result<(), StoreError> {
        self.update_status(
            key,
            ApprovalStatus::Approved {
                value,
                approved_by: approved_by.map(str::to_string),
            },
        )
    }

    async fn reject_approval(
        &self,
        key: &str,
        reason: &str,
        rejected_by: Option<&str>,
    ) -> Result<(), StoreError> {
        self.update_status(
            key,
            ApprovalStatus::Rejected {
                reason: reason.to_string(),
                rejected_by: rejected_by.map(str::to_string),
            },
        )
    }

    async fn edit_approval(
        &self,
        key: &str,
        original: Value,
        edited: Value,
        edited_by: Option<&str>,
    ) -> Result<(), StoreError> {
        self.update_status(
            key,
            ApprovalStatus::Edited {
                original,
                edited,
                edited_by: edited_by.map(str::to_string),
            },
        )
    }

    async fn cancel_approval(&self, key: &str) -> Result<(), StoreError> {
        self.records.write().remove(key);
        Ok(())
    }

    async fn list_pending(&self, prefix: Option<&str>) -> Result<Vec<ApprovalRecord>, StoreError> {
        let records = self.records.read();
        let mut pending: Vec<_> = records
            .values()
            .filter(|r| matches!(r.status, ApprovalStatus::Pending) && !r.is_expired())
            .filter(|r| prefix.map_or(true, |p| r.key.starts_with(p)))
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }
}

impl MemoryApprovalStore {
    fn update_status(&self, key: &str, status: ApprovalStatus) -> Result<(), StoreError> {
        let mut records = self.records.write();
        match records.get_mut(key) {
            Some(record) => {
                record.status = status;
                record.updated_at = Utc::now();
                Ok(())
            }
            None => Err(StoreError::Backend(format!("approval not found: {key}"))),
        }
    }
}
