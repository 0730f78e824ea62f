//! Snapshot model and resume-state projection
//!
//! A snapshot is the persisted state of one workflow: its completed steps in
//! insertion order plus free-form metadata. A [`ResumeState`] is the runtime
//! projection of a snapshot: a plain step-key → result map (failure meta
//! folded into the cause via the cache encoding) that pre-populates the step
//! executor before the user function runs.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::step::{decode_result, encode_result, StepFailureMeta, StepResult};
use crate::suspend::HOOK_KEY_PREFIX;

/// Metadata key carrying the workflow-logic version
pub const VERSION_KEY: &str = "version";

/// Metadata key carrying the most recent keyed step
pub const LAST_STEP_KEY: &str = "lastStepKey";

/// Default workflow-logic version when the snapshot carries none
pub const DEFAULT_VERSION: i64 = 1;

/// One completed step inside a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotStep {
    /// Stable identifier making the step cacheable across runs
    pub key: String,

    /// Outcome observed when the step completed
    pub result: StepResult,

    /// Failure origin, present for failed steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<StepFailureMeta>,

    /// When the step completed
    pub completed_at: DateTime<Utc>,
}

/// Persisted state of a workflow instance
///
/// `steps` preserves insertion order; a step key appears at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub workflow_id: String,

    pub steps: IndexMap<String, SnapshotStep>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl WorkflowSnapshot {
    /// Create an empty snapshot for a workflow id
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            steps: IndexMap::new(),
            metadata: Map::new(),
        }
    }

    /// The workflow-logic version recorded in metadata (default 1)
    pub fn version(&self) -> i64 {
        self.metadata
            .get(VERSION_KEY)
            .and_then(Value::as_i64)
            .unwrap_or(DEFAULT_VERSION)
    }

    /// The most recent keyed step recorded in metadata
    pub fn last_step_key(&self) -> Option<&str> {
        self.metadata.get(LAST_STEP_KEY).and_then(Value::as_str)
    }

    /// Record a completed step, replacing any prior entry for the same key
    pub fn record_step(&mut self, step: SnapshotStep) {
        self.steps.insert(step.key.clone(), step);
    }

    /// Merge prior state with newly observed steps into a fresh snapshot
    ///
    /// Step merge is prior overwritten by observed; metadata is prior
    /// extended with `version`, `lastStepKey` and finally the caller's
    /// metadata (caller wins on key collisions).
    pub fn merged(
        prior: &WorkflowSnapshot,
        observed: impl IntoIterator<Item = SnapshotStep>,
        version: i64,
        last_step_key: Option<&str>,
        caller_metadata: &Map<String, Value>,
    ) -> Self {
        let mut snapshot = prior.clone();
        for step in observed {
            snapshot.record_step(step);
        }

        snapshot
            .metadata
            .insert(VERSION_KEY.to_string(), Value::from(version));
        if let Some(key) = last_step_key {
            snapshot
                .metadata
                .insert(LAST_STEP_KEY.to_string(), Value::from(key));
        }
        for (k, v) in caller_metadata {
            snapshot.metadata.insert(k.clone(), v.clone());
        }

        snapshot
    }
}

/// Runtime projection of a snapshot, pre-loaded into the step cache
///
/// Entries are plain [`StepResult`]s; failed entries carry their meta inside
/// the cause slot (the cache encoding), so the state survives any structured
/// backend. Injection methods return a new state, leaving the original
/// untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumeState {
    pub steps: IndexMap<String, StepResult>,
}

impl ResumeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Project a snapshot into resume form
    pub fn from_snapshot(snapshot: &WorkflowSnapshot) -> Self {
        let steps = snapshot
            .steps
            .iter()
            .map(|(key, step)| {
                (
                    key.clone(),
                    encode_result(step.result.clone(), step.meta.as_ref()),
                )
            })
            .collect();
        Self { steps }
    }

    /// The decoded `(result, meta)` pair for a step key
    pub fn get(&self, step_key: &str) -> Option<(StepResult, Option<StepFailureMeta>)> {
        self.steps.get(step_key).map(decode_result)
    }

    /// Replace a step entry with an approved value
    ///
    /// On the next run the cached `Ok` short-circuits the approval step and
    /// execution resumes with the subsequent step.
    pub fn inject_approval(mut self, step_key: impl Into<String>, value: Value) -> Self {
        self.steps.insert(step_key.into(), StepResult::Ok(value));
        self
    }

    /// Replace a hook entry with the value delivered by the external callback
    pub fn inject_hook(self, hook_id: &str, value: Value) -> Self {
        self.inject_approval(format!("{HOOK_KEY_PREFIX}{hook_id}"), value)
    }
}
