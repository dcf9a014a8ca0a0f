//! Utility modules shared across the engine

pub mod retry;

pub use retry::{retry_transient, retry_with_policy, RetryPolicy, DEFAULT_MAX_ATTEMPTS};
