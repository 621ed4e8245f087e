//! Retry and idempotency utilities shared by providers and the reconciler

pub mod backoff;
pub mod idempotency;
pub mod naming;
pub mod tracker;

pub use backoff::{calc_exp_backoff, retry_with_backoff, RetryOptions};
pub use idempotency::{create_or_update, poll_until, PollOutcome, Upserted};
pub use tracker::{StepEvent, StepTracker};
