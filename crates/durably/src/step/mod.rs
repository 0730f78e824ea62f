//! Step executor, replay cache and retry schedules

mod executor;
mod result;
mod retry;

pub use executor::{ChildFuture, StepContext, StepSpec};
pub use result::{
    decode_result, encode_result, error_from_cached, StepFailureMeta, StepResult, META_SENTINEL,
};
pub use retry::{Backoff, RetrySchedule};
