//! Step outcomes and the replay-cache encoding
//!
//! A completed step is either `Ok{value}` or `Err{error, cause?}`. Failed
//! steps additionally carry a [`StepFailureMeta`] recording whether the error
//! was returned by the operation or captured from a raised failure; replay
//! must surface the same origin so downstream handlers behave identically.
//!
//! Because replay caches may be backed by structured storage that only holds
//! plain results, the meta is folded into the `cause` slot of a cached `Err`
//! under the `__meta` sentinel. [`encode_result`] and [`decode_result`] are
//! the two sides of that scheme.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::WorkflowError;

/// Sentinel field marking a cause that carries encoded failure meta
pub const META_SENTINEL: &str = "__meta";

/// Origin of a failed step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum StepFailureMeta {
    /// The operation returned an error value
    Result {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result_cause: Option<Value>,
    },

    /// The operation raised; the captured value was mapped to a typed error
    Throw { thrown: Value },
}

/// Outcome of one step, as persisted in snapshots
///
/// Serialized as `{"ok":true,"value":...}` or
/// `{"ok":false,"error":...,"cause":...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "repr::StepResultRepr", into = "repr::StepResultRepr")]
pub enum StepResult {
    Ok(Value),
    Err {
        error: Value,
        cause: Option<Value>,
    },
}

impl StepResult {
    /// Create a success result
    pub fn ok(value: impl Into<Value>) -> Self {
        Self::Ok(value.into())
    }

    /// Create a failure result
    pub fn err(error: impl Into<Value>, cause: Option<Value>) -> Self {
        Self::Err {
            error: error.into(),
            cause,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    pub fn is_err(&self) -> bool {
        !self.is_ok()
    }

    /// The success value, when this is `Ok`
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Ok(value) => Some(value),
            Self::Err { .. } => None,
        }
    }
}

mod repr {
    use super::*;

    /// Wire form of [`StepResult`]
    #[derive(Serialize, Deserialize)]
    pub struct StepResultRepr {
        pub ok: bool,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub value: Option<Value>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub error: Option<Value>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub cause: Option<Value>,
    }

    impl From<StepResultRepr> for StepResult {
        fn from(repr: StepResultRepr) -> Self {
            if repr.ok {
                StepResult::Ok(repr.value.unwrap_or(Value::Null))
            } else {
                StepResult::Err {
                    error: repr.error.unwrap_or(Value::Null),
                    cause: repr.cause,
                }
            }
        }
    }

    impl From<StepResult> for StepResultRepr {
        fn from(result: StepResult) -> Self {
            match result {
                StepResult::Ok(value) => StepResultRepr {
                    ok: true,
                    value: Some(value),
                    error: None,
                    cause: None,
                },
                StepResult::Err { error, cause } => StepResultRepr {
                    ok: false,
                    value: None,
                    error: Some(error),
                    cause,
                },
            }
        }
    }
}

/// Fold failure meta into a result for storage in a plain-result cache
///
/// `Ok` results and results without meta pass through unchanged. For an `Err`
/// the original cause and the meta are wrapped into a sentinel object in the
/// cause slot, so the entry survives any backend that round-trips JSON.
pub fn encode_result(result: StepResult, meta: Option<&StepFailureMeta>) -> StepResult {
    let Some(meta) = meta else { return result };
    match result {
        StepResult::Ok(value) => StepResult::Ok(value),
        StepResult::Err { error, cause } => {
            let mut wrapped = serde_json::Map::new();
            wrapped.insert(META_SENTINEL.to_string(), Value::Bool(true));
            if let Some(original) = cause {
                wrapped.insert("original".to_string(), original);
            }
            wrapped.insert(
                "meta".to_string(),
                serde_json::to_value(meta).unwrap_or(Value::Null),
            );
            StepResult::Err {
                error,
                cause: Some(Value::Object(wrapped)),
            }
        }
    }
}

/// Unfold a cached result into the user-visible result and its meta
///
/// The inverse of [`encode_result`]: reconstructs the original cause for user
/// code and extracts the meta for the early-exit signal. Results whose cause
/// does not carry the sentinel decode to themselves with no meta.
pub fn decode_result(result: &StepResult) -> (StepResult, Option<StepFailureMeta>) {
    let StepResult::Err { error, cause } = result else {
        return (result.clone(), None);
    };
    let Some(Value::Object(wrapped)) = cause else {
        return (result.clone(), None);
    };
    if wrapped.get(META_SENTINEL) != Some(&Value::Bool(true)) {
        return (result.clone(), None);
    }

    let meta = wrapped
        .get("meta")
        .cloned()
        .and_then(|m| serde_json::from_value(m).ok());
    let original = wrapped.get("original").cloned();

    (
        StepResult::Err {
            error: error.clone(),
            cause: original,
        },
        meta,
    )
}

/// Rebuild the typed error a cached `Err` entry originally carried
///
/// Entries written by this engine hold the full tagged [`WorkflowError`] in
/// the error slot; anything else (hand-written snapshots, foreign producers)
/// falls back to a domain step error wrapping the raw value.
pub fn error_from_cached(error: &Value, cause: Option<&Value>) -> WorkflowError {
    if let Ok(err) = serde_json::from_value::<WorkflowError>(error.clone()) {
        return err;
    }
    WorkflowError::Step {
        error: error.clone(),
        cause: cause.cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format_ok() {
        let result = StepResult::ok(json!({"id": 7}));
        let encoded = serde_json::to_value(&result).unwrap();
        assert_eq!(encoded, json!({"ok": true, "value": {"id": 7}}));

        let parsed: StepResult = serde_json::from_value(encoded).unwrap();
        assert_eq!(result, parsed);
    }

    #[test]
    fn test_wire_format_err() {
        let result = StepResult::err(json!("Declined"), Some(json!({"code": 402})));
        let encoded = serde_json::to_value(&result).unwrap();
        assert_eq!(
            encoded,
            json!({"ok": false, "error": "Declined", "cause": {"code": 402}})
        );

        let parsed: StepResult = serde_json::from_value(encoded).unwrap();
        assert_eq!(result, parsed);
    }

    #[test]
    fn test_encode_decode_round_trip_result_origin() {
        let meta = StepFailureMeta::Result {
            result_cause: Some(json!({"attempt": 3})),
        };
        let plain = StepResult::err(json!("Flaky"), Some(json!({"attempt": 3})));

        let encoded = encode_result(plain.clone(), Some(&meta));
        let (decoded, decoded_meta) = decode_result(&encoded);

        assert_eq!(decoded, plain);
        assert_eq!(decoded_meta, Some(meta));
    }

    #[test]
    fn test_encode_decode_round_trip_throw_origin() {
        let meta = StepFailureMeta::Throw {
            thrown: json!("connection reset"),
        };
        let plain = StepResult::err(json!("NetworkError"), None);

        let encoded = encode_result(plain.clone(), Some(&meta));
        match &encoded {
            StepResult::Err { cause: Some(c), .. } => {
                assert_eq!(c[META_SENTINEL], json!(true));
            }
            _ => panic!("expected wrapped cause"),
        }

        let (decoded, decoded_meta) = decode_result(&encoded);
        assert_eq!(decoded, plain);
        assert_eq!(decoded_meta, Some(meta));
    }

    #[test]
    fn test_decode_passes_through_unwrapped() {
        let plain = StepResult::err(json!("Declined"), Some(json!({"code": 402})));
        let (decoded, meta) = decode_result(&plain);
        assert_eq!(decoded, plain);
        assert!(meta.is_none());

        let ok = StepResult::ok(json!(1));
        let (decoded, meta) = decode_result(&ok);
        assert_eq!(decoded, ok);
        assert!(meta.is_none());
    }

    #[test]
    fn test_error_from_cached_tagged() {
        let err = WorkflowError::pending_approval("manager-approval");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(error_from_cached(&value, None), err);
    }

    #[test]
    fn test_error_from_cached_foreign_value() {
        let rebuilt = error_from_cached(&json!("SomethingBroke"), Some(&json!({"at": "io"})));
        match rebuilt {
            WorkflowError::Step { error, cause } => {
                assert_eq!(error, json!("SomethingBroke"));
                assert_eq!(cause, Some(json!({"at": "io"})));
            }
            _ => panic!("expected Step"),
        }
    }
}
