//! Step executor with replay support
//!
//! The [`StepContext`] is the procedural interface a workflow function
//! consumes to delimit steps. Each keyed step is executed at most once per
//! workflow lifetime: completed outcomes are cached, persisted after every
//! keyed completion, and served back on replay without re-invoking the
//! operation. Cached errors replay with their original failure origin so a
//! resumed workflow terminates exactly as the first run did.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::result::{decode_result, encode_result, error_from_cached, StepFailureMeta, StepResult};
use super::retry::RetrySchedule;
use crate::engine::RunHooks;
use crate::persistence::SnapshotStore;
use crate::workflow::{
    EventKind, EventSink, SnapshotStep, WorkflowError, WorkflowEvent, WorkflowSnapshot,
};

/// Name and optional cache key of one step
///
/// A bare string converts to a keyed spec (name doubles as the key), which is
/// the durable default. [`StepSpec::transient`] opts out of caching: the work
/// re-runs on every execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSpec {
    pub name: String,
    pub key: Option<String>,
}

impl StepSpec {
    /// A step cached under an explicit key
    pub fn keyed(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: Some(key.into()),
        }
    }

    /// A named step that is never cached
    pub fn transient(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: None,
        }
    }
}

impl From<&str> for StepSpec {
    fn from(key: &str) -> Self {
        Self::keyed(key, key)
    }
}

impl From<String> for StepSpec {
    fn from(key: String) -> Self {
        Self::keyed(key.clone(), key)
    }
}

/// Boxed child operation for `step_parallel` / `step_race`
pub type ChildFuture = Pin<Box<dyn Future<Output = Result<Value, WorkflowError>> + Send>>;

#[derive(Clone)]
struct CachedStep {
    /// Result in cache encoding (failure meta folded into the cause)
    result: StepResult,
    completed_at: DateTime<Utc>,
}

struct StepInner {
    workflow_id: String,
    version: i64,
    caller_metadata: Map<String, Value>,

    /// State the run resumed from; immutable for the duration of the run
    prior: WorkflowSnapshot,
    preloaded: IndexMap<String, CachedStep>,

    /// Steps completed by this run
    observed: Mutex<IndexMap<String, CachedStep>>,

    last_step_key: Mutex<Option<String>>,

    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
    store: Option<Arc<dyn SnapshotStore>>,

    /// Serializes checkpoint writes under parallel scopes
    persist_gate: tokio::sync::Mutex<()>,

    hooks: RunHooks,
}

/// Handle to the step executor of one workflow run
///
/// Cloning is cheap; clones share the same replay cache and cancellation
/// signal. Handed to the user function by the run loop.
#[derive(Clone)]
pub struct StepContext {
    inner: Arc<StepInner>,
}

impl StepContext {
    pub(crate) fn new(
        workflow_id: impl Into<String>,
        base: WorkflowSnapshot,
        version: i64,
        caller_metadata: Map<String, Value>,
        store: Option<Arc<dyn SnapshotStore>>,
        events: Arc<dyn EventSink>,
        hooks: RunHooks,
        cancel: CancellationToken,
    ) -> Self {
        let preloaded = base
            .steps
            .iter()
            .map(|(key, step)| {
                (
                    key.clone(),
                    CachedStep {
                        result: encode_result(step.result.clone(), step.meta.as_ref()),
                        completed_at: step.completed_at,
                    },
                )
            })
            .collect();

        Self {
            inner: Arc::new(StepInner {
                workflow_id: workflow_id.into(),
                version,
                caller_metadata,
                prior: base,
                preloaded,
                observed: Mutex::new(IndexMap::new()),
                last_step_key: Mutex::new(None),
                events,
                cancel,
                store,
                persist_gate: tokio::sync::Mutex::new(()),
                hooks,
            }),
        }
    }

    /// The workflow id this executor belongs to
    pub fn workflow_id(&self) -> &str {
        &self.inner.workflow_id
    }

    /// The workflow's cancellation signal
    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// The most recently completed keyed step of this run
    pub fn last_step_key(&self) -> Option<String> {
        self.inner.last_step_key.lock().clone()
    }

    /// The merged snapshot as of now: resumed state overwritten by the steps
    /// this run has completed
    pub fn current_snapshot(&self) -> WorkflowSnapshot {
        let observed: Vec<SnapshotStep> = {
            let cache = self.inner.observed.lock();
            cache
                .iter()
                .map(|(key, cached)| {
                    let (result, meta) = decode_result(&cached.result);
                    SnapshotStep {
                        key: key.clone(),
                        result,
                        meta,
                        completed_at: cached.completed_at,
                    }
                })
                .collect()
        };

        WorkflowSnapshot::merged(
            &self.inner.prior,
            observed,
            self.inner.version,
            self.last_step_key().as_deref(),
            &self.inner.caller_metadata,
        )
    }

    // =========================================================================
    // Step operations
    // =========================================================================

    /// Execute an operation as a step
    ///
    /// On a cache hit the operation is not invoked: a cached `Ok` decodes and
    /// returns immediately, a cached `Err` returns the original typed error
    /// (same error, cause and failure origin). Propagate the error with `?`
    /// to terminate the workflow with it.
    pub async fn step<S, T, F, Fut>(&self, spec: S, op: F) -> Result<T, WorkflowError>
    where
        S: Into<StepSpec>,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, WorkflowError>>,
    {
        self.execute_classified(spec.into(), move || async move {
            op().await.map_err(|error| {
                let meta = StepFailureMeta::Result {
                    result_cause: error.cause().cloned(),
                };
                (error, meta)
            })
        })
        .await
    }

    /// Execute an operation whose failures are raised rather than returned
    ///
    /// A captured failure is mapped to a typed error by `on_error` and cached
    /// with throw origin, preserving the rendered failure chain.
    pub async fn step_try<S, T, F, Fut, M>(
        &self,
        spec: S,
        op: F,
        on_error: M,
    ) -> Result<T, WorkflowError>
    where
        S: Into<StepSpec>,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
        M: FnOnce(&anyhow::Error) -> WorkflowError,
    {
        self.execute_classified(spec.into(), move || async move {
            match op().await {
                Ok(value) => Ok(value),
                Err(raised) => {
                    let thrown = Value::String(format!("{raised:#}"));
                    let error = on_error(&raised);
                    Err((error, StepFailureMeta::Throw { thrown }))
                }
            }
        })
        .await
    }

    /// Execute an operation returning a domain `Result`
    ///
    /// An `Err` value is mapped to a typed error by `on_error` and cached with
    /// result origin; the serialized domain error is kept as the cause.
    pub async fn step_from_result<S, T, E, F, Fut, M>(
        &self,
        spec: S,
        op: F,
        on_error: M,
    ) -> Result<T, WorkflowError>
    where
        S: Into<StepSpec>,
        T: Serialize + DeserializeOwned,
        E: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        M: FnOnce(E) -> WorkflowError,
    {
        self.execute_classified(spec.into(), move || async move {
            match op().await {
                Ok(value) => Ok(value),
                Err(domain) => {
                    let result_cause = serde_json::to_value(&domain).ok();
                    let error = on_error(domain);
                    Err((error, StepFailureMeta::Result { result_cause }))
                }
            }
        })
        .await
    }

    /// A cancellable delay, re-run on every execution
    pub async fn step_sleep(&self, duration: Duration) -> Result<(), WorkflowError> {
        let name = format!("sleep-{}ms", duration.as_millis());
        self.sleep_inner(StepSpec::transient(name), duration).await
    }

    /// A cancellable delay cached under a key: replays skip the wait
    pub async fn step_sleep_keyed(&self, key: &str, duration: Duration) -> Result<(), WorkflowError> {
        self.sleep_inner(StepSpec::from(key), duration).await
    }

    async fn sleep_inner(&self, spec: StepSpec, duration: Duration) -> Result<(), WorkflowError> {
        let ctx = self.clone();
        self.execute_classified(spec, move || async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => Ok(()),
                _ = ctx.inner.cancel.cancelled() => Err((
                    ctx.cancelled_error(),
                    StepFailureMeta::Throw {
                        thrown: Value::String("cancelled".to_string()),
                    },
                )),
            }
        })
        .await
    }

    /// Run an operation against a deadline
    ///
    /// The operation receives a derived cancellation signal that fires at the
    /// deadline or on workflow cancellation, whichever comes first. A missed
    /// deadline yields a typed `StepTimeout` error, cached with throw origin.
    pub async fn step_with_timeout<S, T, F, Fut>(
        &self,
        spec: S,
        timeout: Duration,
        op: F,
    ) -> Result<T, WorkflowError>
    where
        S: Into<StepSpec>,
        T: Serialize + DeserializeOwned,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, WorkflowError>>,
    {
        let spec = spec.into();
        let step_key = spec.key.clone();
        let ctx = self.clone();

        self.execute_classified(spec, move || async move {
            let derived = ctx.inner.cancel.child_token();
            let work = op(derived.clone());
            tokio::select! {
                result = work => result.map_err(|error| {
                    let meta = StepFailureMeta::Result {
                        result_cause: error.cause().cloned(),
                    };
                    (error, meta)
                }),
                _ = tokio::time::sleep(timeout) => {
                    derived.cancel();
                    let timeout_ms = timeout.as_millis() as u64;
                    Err((
                        WorkflowError::StepTimeout { step_key, timeout_ms },
                        StepFailureMeta::Throw {
                            thrown: Value::String(format!("step timed out after {timeout_ms}ms")),
                        },
                    ))
                }
                _ = ctx.inner.cancel.cancelled() => {
                    derived.cancel();
                    Err((
                        ctx.cancelled_error(),
                        StepFailureMeta::Throw {
                            thrown: Value::String("cancelled".to_string()),
                        },
                    ))
                }
            }
        })
        .await
    }

    /// Run an operation under a retry schedule
    ///
    /// The operation receives the attempt number (1-based). Intermediate
    /// failures are reported as retry events but never persisted; only the
    /// final outcome is cached. Delays between attempts observe cancellation.
    pub async fn step_retry<S, T, F, Fut>(
        &self,
        spec: S,
        schedule: RetrySchedule,
        mut op: F,
    ) -> Result<T, WorkflowError>
    where
        S: Into<StepSpec>,
        T: Serialize + DeserializeOwned,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, WorkflowError>>,
    {
        let spec = spec.into();
        let retry_spec = spec.clone();
        let ctx = self.clone();

        self.execute_classified(spec, move || async move {
            let mut attempt = 1u32;
            loop {
                match op(attempt).await {
                    Ok(value) => return Ok(value),
                    Err(error) => {
                        if error.is_cancellation() {
                            let meta = StepFailureMeta::Throw {
                                thrown: Value::String("cancelled".to_string()),
                            };
                            return Err((error, meta));
                        }
                        if !schedule.should_retry(&error, attempt) {
                            let meta = StepFailureMeta::Result {
                                result_cause: error.cause().cloned(),
                            };
                            return Err((error, meta));
                        }

                        let delay = schedule.delay_for_attempt(attempt + 1);
                        debug!(
                            workflow_id = %ctx.inner.workflow_id,
                            step = %retry_spec.name,
                            attempt,
                            ?delay,
                            "step attempt failed, retrying"
                        );
                        ctx.emit(EventKind::StepRetry {
                            name: retry_spec.name.clone(),
                            step_key: retry_spec.key.clone(),
                            attempt,
                            delay_ms: delay.as_millis() as u64,
                            error: error.clone(),
                        });

                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = ctx.inner.cancel.cancelled() => {
                                return Err((
                                    ctx.cancelled_error(),
                                    StepFailureMeta::Throw {
                                        thrown: Value::String("cancelled".to_string()),
                                    },
                                ));
                            }
                        }
                        attempt += 1;
                    }
                }
            }
        })
        .await
    }

    /// Execute child operations concurrently
    ///
    /// Each child runs as a keyed step under `"{scope}/{name}"`, so the cache
    /// stays unambiguous no matter which order children complete in. The
    /// result maps child names to values in declaration order; the first
    /// child error wins and cancels the remaining siblings.
    pub async fn step_parallel<N>(
        &self,
        scope: &str,
        children: Vec<(N, ChildFuture)>,
    ) -> Result<IndexMap<String, Value>, WorkflowError>
    where
        N: Into<String>,
    {
        let count = children.len();
        let mut pending = FuturesUnordered::new();

        for (index, (name, work)) in children.into_iter().enumerate() {
            let name: String = name.into();
            let key = format!("{scope}/{name}");
            let ctx = self.clone();
            pending.push(async move {
                let result = ctx.step(StepSpec::keyed(name.clone(), key), move || work).await;
                (index, name, result)
            });
        }

        let mut slots: Vec<Option<(String, Value)>> = vec![None; count];
        while let Some((index, name, result)) = pending.next().await {
            match result {
                Ok(value) => slots[index] = Some((name, value)),
                // Dropping the remaining futures cancels the siblings
                Err(error) => return Err(error),
            }
        }
        drop(pending);

        let mut record = IndexMap::with_capacity(count);
        for slot in slots.into_iter().flatten() {
            record.insert(slot.0, slot.1);
        }
        Ok(record)
    }

    /// Race child operations; the first to complete wins
    ///
    /// Losers are cancelled by drop. The winner's name and value are cached
    /// under the scope key, so a replay returns the same winner without
    /// re-running any child.
    pub async fn step_race<N>(
        &self,
        scope: &str,
        children: Vec<(N, ChildFuture)>,
    ) -> Result<(String, Value), WorkflowError>
    where
        N: Into<String>,
    {
        let spec = StepSpec::from(scope);
        let outcome: RaceOutcome = self
            .execute_classified(spec, move || async move {
                let mut pending = FuturesUnordered::new();
                for (name, work) in children {
                    let name: String = name.into();
                    pending.push(async move { (name, work.await) });
                }

                match pending.next().await {
                    Some((winner, Ok(value))) => Ok(RaceOutcome { winner, value }),
                    Some((_, Err(error))) => {
                        if error.is_cancellation() {
                            let meta = StepFailureMeta::Throw {
                                thrown: Value::String("cancelled".to_string()),
                            };
                            return Err((error, meta));
                        }
                        let meta = StepFailureMeta::Result {
                            result_cause: error.cause().cloned(),
                        };
                        Err((error, meta))
                    }
                    None => Err((
                        WorkflowError::unexpected("race scope has no children"),
                        StepFailureMeta::Result { result_cause: None },
                    )),
                }
            })
            .await?;

        Ok((outcome.winner, outcome.value))
    }

    // =========================================================================
    // Internals
    // =========================================================================

    pub(crate) fn emit(&self, kind: EventKind) {
        self.inner
            .events
            .emit(&WorkflowEvent::now(self.inner.workflow_id.clone(), kind));
    }

    fn cancelled_error(&self) -> WorkflowError {
        WorkflowError::Cancelled {
            reason: None,
            last_step_key: self.last_step_key(),
        }
    }

    fn lookup(&self, key: &str) -> Option<CachedStep> {
        if let Some(cached) = self.inner.preloaded.get(key) {
            return Some(cached.clone());
        }
        self.inner.observed.lock().get(key).cloned()
    }

    fn set_last_step_key(&self, key: &str) {
        *self.inner.last_step_key.lock() = Some(key.to_string());
    }

    /// Core step machinery: boundary cancellation check, cache consultation,
    /// execution, classification, recording, checkpointing
    async fn execute_classified<T, F, Fut>(
        &self,
        spec: StepSpec,
        run: F,
    ) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, (WorkflowError, StepFailureMeta)>>,
    {
        if self.inner.cancel.is_cancelled() {
            return Err(self.cancelled_error());
        }

        if let Some(key) = &spec.key {
            if let Some(cached) = self.lookup(key) {
                self.emit(EventKind::StepCacheHit {
                    name: spec.name.clone(),
                    step_key: key.clone(),
                });
                self.set_last_step_key(key);

                let (result, _meta) = decode_result(&cached.result);
                return match result {
                    StepResult::Ok(value) => serde_json::from_value(value).map_err(|e| {
                        WorkflowError::unexpected(format!(
                            "cached value for step '{key}' does not decode: {e}"
                        ))
                    }),
                    StepResult::Err { error, cause } => {
                        Err(error_from_cached(&error, cause.as_ref()))
                    }
                };
            }
            self.emit(EventKind::StepCacheMiss {
                name: spec.name.clone(),
                step_key: key.clone(),
            });
        }

        self.emit(EventKind::StepStart {
            name: spec.name.clone(),
            step_key: spec.key.clone(),
        });
        let started = Instant::now();

        match run().await {
            Ok(value) => {
                let encoded = serde_json::to_value(&value)?;
                self.record(&spec, StepResult::Ok(encoded), None, started)
                    .await;
                Ok(value)
            }
            Err((error, meta)) => {
                // Cancellation is transient: never cached, never replayed
                if error.is_cancellation() {
                    return Err(error);
                }

                let error_value = serde_json::to_value(&error)
                    .unwrap_or_else(|_| Value::String(error.to_string()));
                let result = StepResult::Err {
                    error: error_value,
                    cause: error.cause().cloned(),
                };
                self.record(&spec, result, Some(meta), started).await;
                Err(error)
            }
        }
    }

    async fn record(
        &self,
        spec: &StepSpec,
        result: StepResult,
        meta: Option<StepFailureMeta>,
        started: Instant,
    ) {
        let duration_ms = started.elapsed().as_millis() as u64;

        if let Some(key) = &spec.key {
            self.inner.observed.lock().insert(
                key.clone(),
                CachedStep {
                    result: encode_result(result.clone(), meta.as_ref()),
                    completed_at: Utc::now(),
                },
            );
            self.set_last_step_key(key);
        }

        self.emit(EventKind::StepComplete {
            name: spec.name.clone(),
            step_key: spec.key.clone(),
            duration_ms,
            result,
            meta,
        });

        if let Some(key) = &spec.key {
            self.checkpoint(key).await;
        }
    }

    /// Persist the merged snapshot after a keyed completion
    ///
    /// Write failures are reported but do not abort the workflow; the next
    /// keyed step retries with a superset of state.
    async fn checkpoint(&self, step_key: &str) {
        if let Some(store) = &self.inner.store {
            let _guard = self.inner.persist_gate.lock().await;
            let snapshot = self.current_snapshot();
            match store.save(&self.inner.workflow_id, &snapshot).await {
                Ok(()) => {
                    self.emit(EventKind::PersistSuccess {
                        step_key: step_key.to_string(),
                    });
                }
                Err(e) => {
                    warn!(
                        workflow_id = %self.inner.workflow_id,
                        step_key,
                        error = %e,
                        "checkpoint write failed"
                    );
                    self.emit(EventKind::PersistError {
                        step_key: step_key.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        if let Some(hook) = self.inner.hooks.after_step() {
            self.emit(EventKind::HookAfterStep {
                step_key: step_key.to_string(),
            });
            if let Err(e) = hook(step_key.to_string()).await {
                warn!(
                    workflow_id = %self.inner.workflow_id,
                    step_key,
                    error = %e,
                    "after-step hook failed"
                );
                self.emit(EventKind::HookAfterStepError {
                    step_key: step_key.to_string(),
                    message: format!("{e:#}"),
                });
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RaceOutcome {
    winner: String,
    value: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::NullSink;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn context() -> StepContext {
        StepContext::new(
            "wf-test",
            WorkflowSnapshot::new("wf-test"),
            1,
            Map::new(),
            None,
            Arc::new(NullSink),
            RunHooks::default(),
            CancellationToken::new(),
        )
    }

    fn context_resumed(state: &crate::workflow::ResumeState) -> StepContext {
        let mut base = WorkflowSnapshot::new("wf-test");
        for (key, encoded) in &state.steps {
            let (result, meta) = decode_result(encoded);
            base.record_step(SnapshotStep {
                key: key.clone(),
                result,
                meta,
                completed_at: Utc::now(),
            });
        }
        StepContext::new(
            "wf-test",
            base,
            1,
            Map::new(),
            None,
            Arc::new(NullSink),
            RunHooks::default(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_step_caches_success() {
        let ctx = context();
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let first: i64 = ctx
            .step("fetch", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await
            .unwrap();
        let second: i64 = ctx
            .step("fetch", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(8)
            })
            .await
            .unwrap();

        assert_eq!(first, 7);
        assert_eq!(second, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_step_reruns() {
        let ctx = context();
        let calls = AtomicU32::new(0);
        let calls = &calls;

        for _ in 0..2 {
            let _: i64 = ctx
                .step(StepSpec::transient("poll"), || async move {
                    Ok(calls.fetch_add(1, Ordering::SeqCst) as i64)
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cached_error_replays_without_rerun() {
        let ctx = context();

        let first: Result<i64, _> = ctx
            .step("charge", || async {
                Err(WorkflowError::step_with_cause("Declined", json!({"code": 402})))
            })
            .await;
        let first_err = first.unwrap_err();

        let calls = AtomicU32::new(0);
        let calls = &calls;
        let second: Result<i64, _> = ctx
            .step("charge", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await;

        assert_eq!(second.unwrap_err(), first_err);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_step_try_records_throw_origin() {
        let ctx = context();

        let result: Result<i64, _> = ctx
            .step_try(
                "flaky",
                || async { Err(anyhow::anyhow!("connection reset")) },
                |_| WorkflowError::step("NetworkError"),
            )
            .await;
        assert_eq!(result.unwrap_err(), WorkflowError::step("NetworkError"));

        let snapshot = ctx.current_snapshot();
        let step = &snapshot.steps["flaky"];
        assert!(matches!(
            step.meta,
            Some(StepFailureMeta::Throw { .. })
        ));
    }

    #[tokio::test]
    async fn test_step_from_result_records_result_origin() {
        let ctx = context();

        #[derive(Serialize)]
        struct DomainError {
            code: u32,
        }

        let result: Result<i64, _> = ctx
            .step_from_result(
                "validate",
                || async { Err(DomainError { code: 7 }) },
                |_| WorkflowError::step("ValidationFailed"),
            )
            .await;
        assert!(result.is_err());

        let snapshot = ctx.current_snapshot();
        let step = &snapshot.steps["validate"];
        assert_eq!(
            step.meta,
            Some(StepFailureMeta::Result {
                result_cause: Some(json!({"code": 7}))
            })
        );
    }

    #[tokio::test]
    async fn test_resume_state_short_circuits() {
        let first = context();
        let _: i64 = first.step("a", || async { Ok(1) }).await.unwrap();

        let state = crate::workflow::ResumeState::from_snapshot(&first.current_snapshot());
        let resumed = context_resumed(&state);

        let calls = AtomicU32::new(0);
        let calls = &calls;
        let value: i64 = resumed
            .step("a", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(99)
            })
            .await
            .unwrap();

        assert_eq!(value, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_step_boundary_observes_cancellation() {
        let ctx = context();
        let _: i64 = ctx.step("a", || async { Ok(1) }).await.unwrap();

        ctx.cancellation().cancel();

        let result: Result<i64, _> = ctx.step("b", || async { Ok(2) }).await;
        match result.unwrap_err() {
            WorkflowError::Cancelled { last_step_key, .. } => {
                assert_eq!(last_step_key.as_deref(), Some("a"));
            }
            other => panic!("expected Cancelled, got {other:?}"),
        }

        // Cancellation is not recorded as a step outcome
        assert!(!ctx.current_snapshot().steps.contains_key("b"));
    }

    #[tokio::test]
    async fn test_sleep_cancelled_mid_wait() {
        let ctx = context();
        let token = ctx.cancellation().clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        let result = ctx.step_sleep(Duration::from_secs(30)).await;
        assert!(result.unwrap_err().is_cancellation());
    }

    #[tokio::test]
    async fn test_timeout_yields_typed_error() {
        let ctx = context();

        let result: Result<i64, _> = ctx
            .step_with_timeout("slow", Duration::from_millis(10), |_signal| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(1)
            })
            .await;

        match result.unwrap_err() {
            WorkflowError::StepTimeout { step_key, .. } => {
                assert_eq!(step_key.as_deref(), Some("slow"));
            }
            other => panic!("expected StepTimeout, got {other:?}"),
        }

        let snapshot = ctx.current_snapshot();
        assert!(matches!(
            snapshot.steps["slow"].meta,
            Some(StepFailureMeta::Throw { .. })
        ));
    }

    #[tokio::test]
    async fn test_retry_caches_only_final_outcome() {
        let ctx = context();
        let calls = AtomicU32::new(0);

        let schedule = RetrySchedule::fixed(Duration::from_millis(1), 3);
        let value: i64 = ctx
            .step_retry("flaky", schedule, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(WorkflowError::step("Flaky"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let snapshot = ctx.current_snapshot();
        assert_eq!(snapshot.steps.len(), 1);
        assert!(snapshot.steps["flaky"].result.is_ok());
    }

    #[tokio::test]
    async fn test_parallel_children_get_scoped_keys() {
        let ctx = context();

        let record = ctx
            .step_parallel(
                "fanout",
                vec![
                    ("a", async { Ok(json!(1)) }.boxed()),
                    ("b", async { Ok(json!(2)) }.boxed()),
                ],
            )
            .await
            .unwrap();

        assert_eq!(record["a"], json!(1));
        assert_eq!(record["b"], json!(2));

        let snapshot = ctx.current_snapshot();
        assert!(snapshot.steps.contains_key("fanout/a"));
        assert!(snapshot.steps.contains_key("fanout/b"));
    }

    #[tokio::test]
    async fn test_parallel_first_error_wins() {
        let ctx = context();

        let result = ctx
            .step_parallel(
                "fanout",
                vec![
                    (
                        "slow",
                        async {
                            tokio::time::sleep(Duration::from_secs(30)).await;
                            Ok(json!(1))
                        }
                        .boxed(),
                    ),
                    ("failing", async { Err(WorkflowError::step("Boom")) }.boxed()),
                ],
            )
            .await;

        assert_eq!(result.unwrap_err(), WorkflowError::step("Boom"));
    }

    #[tokio::test]
    async fn test_race_records_winner() {
        let ctx = context();

        let (winner, value) = ctx
            .step_race(
                "race",
                vec![
                    (
                        "slow",
                        async {
                            tokio::time::sleep(Duration::from_secs(30)).await;
                            Ok(json!("slow"))
                        }
                        .boxed(),
                    ),
                    ("fast", async { Ok(json!("fast")) }.boxed()),
                ],
            )
            .await
            .unwrap();

        assert_eq!(winner, "fast");
        assert_eq!(value, json!("fast"));

        // Replay returns the recorded winner without re-running children
        let (winner_again, _) = ctx
            .step_race(
                "race",
                vec![(
                    "other",
                    async { Ok(json!("other")) }.boxed(),
                )],
            )
            .await
            .unwrap();
        assert_eq!(winner_again, "fast");
    }
}
