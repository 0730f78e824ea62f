//! Suspension/resume protocol: approvals, hooks, collectors

mod approval;
mod collector;
mod hook;

pub use approval::{
    check_approval, ApprovalCheck, ApprovalRecord, ApprovalStatus, ApprovalStore,
    GatedStepOptions, MemoryApprovalStore,
};
pub use collector::{ApprovalStateCollector, PendingApprovalInfo, ResumeStateCollector};
pub use hook::{create_hook, pending_hook, HookHandle, HOOK_KEY_PREFIX};
