//! Run options, version policy and lifecycle hooks

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::workflow::{ResumeState, WorkflowSnapshot};

/// Default lease TTL for cross-process locking
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);

/// What to do when the stored snapshot's version differs from the requested one
#[derive(Clone, Default)]
pub enum VersionPolicy {
    /// Surface a `VersionMismatch` error (the default)
    #[default]
    Fail,

    /// Best-effort delete the stored state and run from scratch
    Clear,

    /// Transform the stored snapshot into one usable by the requested version
    Migrate(Arc<dyn Fn(WorkflowSnapshot, i64) -> WorkflowSnapshot + Send + Sync>),
}

impl std::fmt::Debug for VersionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fail => write!(f, "Fail"),
            Self::Clear => write!(f, "Clear"),
            Self::Migrate(_) => write!(f, "Migrate(..)"),
        }
    }
}

type BeforeStartHook =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;
type AfterStepHook =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

/// Optional callbacks around the run lifecycle
///
/// `before_start` fires once before the user function; `after_step` fires
/// after every keyed step checkpoint. Hook failures are reported as events
/// and never fail the run.
#[derive(Clone, Default)]
pub struct RunHooks {
    before_start: Option<BeforeStartHook>,
    after_step: Option<AfterStepHook>,
}

impl RunHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked before the user function runs
    pub fn on_before_start<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.before_start = Some(Arc::new(move || Box::pin(hook())));
        self
    }

    /// Register a callback invoked after each keyed step completes
    pub fn on_after_step<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.after_step = Some(Arc::new(move |step_key| Box::pin(hook(step_key))));
        self
    }

    pub(crate) fn before_start(&self) -> Option<BeforeStartHook> {
        self.before_start.clone()
    }

    pub(crate) fn after_step(&self) -> Option<AfterStepHook> {
        self.after_step.clone()
    }
}

impl std::fmt::Debug for RunHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHooks")
            .field("before_start", &self.before_start.is_some())
            .field("after_step", &self.after_step.is_some())
            .finish()
    }
}

/// Per-run configuration
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Workflow-logic version recorded in snapshots (default 1)
    pub version: i64,

    /// Policy applied when the stored snapshot carries a different version
    pub on_version_mismatch: VersionPolicy,

    /// Skip both the in-process gate and the cross-process lease
    pub allow_concurrent: bool,

    /// TTL for the cross-process lease
    pub lock_ttl: Duration,

    /// Caller metadata merged into every persisted snapshot
    pub metadata: Map<String, Value>,

    /// Explicit resume state overlaid on the stored snapshot
    pub resume_state: Option<ResumeState>,

    /// External cancellation signal for this run
    pub cancellation: Option<CancellationToken>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            version: 1,
            on_version_mismatch: VersionPolicy::default(),
            allow_concurrent: false,
            lock_ttl: DEFAULT_LOCK_TTL,
            metadata: Map::new(),
            resume_state: None,
            cancellation: None,
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the workflow-logic version
    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    /// Set the version-mismatch policy
    pub fn with_version_policy(mut self, policy: VersionPolicy) -> Self {
        self.on_version_mismatch = policy;
        self
    }

    /// Allow concurrent runs of the same workflow id
    pub fn allow_concurrent(mut self) -> Self {
        self.allow_concurrent = true;
        self
    }

    /// Set the lease TTL
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Add a metadata entry merged into persisted snapshots
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Supply resume state (takes precedence over the stored snapshot's steps)
    pub fn with_resume_state(mut self, state: ResumeState) -> Self {
        self.resume_state = Some(state);
        self
    }

    /// Supply the cancellation signal
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = RunOptions::default();
        assert_eq!(options.version, 1);
        assert!(!options.allow_concurrent);
        assert_eq!(options.lock_ttl, DEFAULT_LOCK_TTL);
        assert!(matches!(options.on_version_mismatch, VersionPolicy::Fail));
    }

    #[test]
    fn test_builder() {
        let options = RunOptions::new()
            .with_version(3)
            .with_version_policy(VersionPolicy::Clear)
            .allow_concurrent()
            .with_lock_ttl(Duration::from_secs(5))
            .with_metadata("owner", serde_json::json!("billing"));

        assert_eq!(options.version, 3);
        assert!(options.allow_concurrent);
        assert_eq!(options.lock_ttl, Duration::from_secs(5));
        assert_eq!(options.metadata["owner"], serde_json::json!("billing"));
    }

    #[tokio::test]
    async fn test_hooks_invoke() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let counter = Arc::new(AtomicU32::new(0));
        let seen = counter.clone();
        let hooks = RunHooks::new().on_after_step(move |_key| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let hook = hooks.after_step().expect("hook registered");
        hook("a".to_string()).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
