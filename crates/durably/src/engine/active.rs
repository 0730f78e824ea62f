//! Process-global set of workflow ids currently executing
//!
//! The in-process half of the concurrency gate. Entries are claimed before a
//! run starts and removed by guard drop on every exit path.

use std::sync::LazyLock;

use dashmap::DashSet;

static ACTIVE_WORKFLOWS: LazyLock<DashSet<String>> = LazyLock::new(DashSet::new);

/// Claim exclusive in-process execution of a workflow id
///
/// Returns `None` when another run of the same id is already active in this
/// process. The returned guard releases the claim on drop.
pub(crate) fn try_claim(workflow_id: &str) -> Option<ActiveGuard> {
    if ACTIVE_WORKFLOWS.insert(workflow_id.to_string()) {
        Some(ActiveGuard {
            workflow_id: workflow_id.to_string(),
        })
    } else {
        None
    }
}

/// Whether a workflow id is currently executing in this process
pub fn is_active(workflow_id: &str) -> bool {
    ACTIVE_WORKFLOWS.contains(workflow_id)
}

pub(crate) struct ActiveGuard {
    workflow_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE_WORKFLOWS.remove(&self.workflow_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive() {
        let guard = try_claim("active-test-1").expect("first claim succeeds");
        assert!(is_active("active-test-1"));
        assert!(try_claim("active-test-1").is_none());

        drop(guard);
        assert!(!is_active("active-test-1"));
        assert!(try_claim("active-test-1").is_some());
    }

    #[test]
    fn test_distinct_ids_are_independent() {
        let _a = try_claim("active-test-2a").expect("claim a");
        let _b = try_claim("active-test-2b").expect("claim b");
    }
}
