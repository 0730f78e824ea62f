//! Durable run loop and its configuration

mod active;
mod options;
mod runner;

pub use active::is_active;
pub use options::{RunHooks, RunOptions, VersionPolicy, DEFAULT_LOCK_TTL};
pub use runner::WorkflowRunner;
