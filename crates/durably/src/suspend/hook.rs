//! Pending hooks for arbitrary external callbacks
//!
//! A hook is the anonymous cousin of an approval: the library generates the
//! identifier, the workflow suspends on it, and any external system that
//! learns the hook id (a webhook, a queue consumer) can inject the value and
//! resume the workflow. The `hook:{id}` step-key convention is what lets the
//! external side correlate its callback with the cached step.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::step::StepContext;
use crate::workflow::WorkflowError;

/// Step-key prefix for hook steps
pub const HOOK_KEY_PREFIX: &str = "hook:";

/// Correlation handle for one external callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookHandle {
    /// Library-generated identifier shared with the external system
    pub hook_id: String,

    /// Step key the hook's value is cached under (`hook:{hook_id}`)
    pub step_key: String,
}

/// Create a hook handle with a fresh identifier
pub fn create_hook() -> HookHandle {
    let hook_id = Uuid::now_v7().to_string();
    HookHandle {
        step_key: format!("{HOOK_KEY_PREFIX}{hook_id}"),
        hook_id,
    }
}

/// The suspension signal a hook step produces while no value has arrived
pub fn pending_hook(hook_id: impl Into<String>) -> WorkflowError {
    WorkflowError::pending_hook(hook_id)
}

impl StepContext {
    /// Suspend on an external callback until its value is injected
    ///
    /// Before injection the step caches `PendingHook` and the run terminates
    /// with it. After [`ResumeState::inject_hook`](crate::workflow::ResumeState::inject_hook)
    /// the cached `Ok` short-circuits and the injected value is returned.
    pub async fn hook_step(&self, handle: &HookHandle) -> Result<Value, WorkflowError> {
        let hook_id = handle.hook_id.clone();
        self.step(handle.step_key.as_str(), move || async move {
            Err(pending_hook(hook_id))
        })
        .await
    }
}
