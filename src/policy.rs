//! Pluggable reactions to denials and store failures.

use serde_json::json;

use crate::{Flow, RequestContext, ResponseContext, StoreError};

/// Everything a failure policy gets to know about a denied attempt.
#[derive(Debug)]
pub struct Denial<'a> {
    pub request: &'a RequestContext,
    /// Epoch milliseconds at which the next attempt will be allowed.
    pub next_valid_request_time: u64,
    /// Epoch milliseconds of the denied attempt.
    pub now: u64,
}

impl Denial<'_> {
    /// Whole seconds until the next allowed attempt, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        self.next_valid_request_time
            .saturating_sub(self.now)
            .div_ceil(1000)
    }
}

/// Called when an attempt is denied. Decides whether the guarded operation
/// still runs.
pub trait FailurePolicy: Send + Sync {
    fn on_denied(&self, denial: &Denial<'_>, resp: &mut ResponseContext) -> Flow;
}

impl<F> FailurePolicy for F
where
    F: Fn(&Denial<'_>, &mut ResponseContext) -> Flow + Send + Sync,
{
    fn on_denied(&self, denial: &Denial<'_>, resp: &mut ResponseContext) -> Flow {
        self(denial, resp)
    }
}

fn denial_body(denial: &Denial<'_>) -> serde_json::Value {
    json!({
        "error": {
            "text": "Too many requests in this time frame.",
            "nextValidRequestDate": denial.next_valid_request_time,
        }
    })
}

/// Responds `429 Too Many Requests` with `Retry-After` and halts.
#[derive(Clone, Copy, Debug, Default)]
pub struct TooManyRequests;

impl FailurePolicy for TooManyRequests {
    fn on_denied(&self, denial: &Denial<'_>, resp: &mut ResponseContext) -> Flow {
        resp.status = Some(429);
        resp.set_header("Retry-After", denial.retry_after_secs().to_string());
        resp.body = Some(denial_body(denial));
        Flow::Halt
    }
}

/// Responds `403 Forbidden` and halts.
#[derive(Clone, Copy, Debug, Default)]
pub struct Forbidden;

impl FailurePolicy for Forbidden {
    fn on_denied(&self, denial: &Denial<'_>, resp: &mut ResponseContext) -> Flow {
        resp.status = Some(403);
        resp.body = Some(denial_body(denial));
        Flow::Halt
    }
}

/// Marks the response as throttled but lets the operation run.
#[derive(Clone, Copy, Debug, Default)]
pub struct MarkAndContinue;

impl FailurePolicy for MarkAndContinue {
    fn on_denied(&self, denial: &Denial<'_>, resp: &mut ResponseContext) -> Flow {
        resp.status = Some(429);
        resp.next_valid_request_time = Some(denial.next_valid_request_time);
        Flow::Proceed
    }
}

/// Called when the store fails. Returning `Ok` swallows the failure and the
/// check or reset ends without running anything; returning `Err` propagates
/// it to the caller.
pub trait StoreErrorPolicy: Send + Sync {
    fn on_store_error(&self, err: StoreError) -> Result<(), StoreError>;
}

impl<F> StoreErrorPolicy for F
where
    F: Fn(StoreError) -> Result<(), StoreError> + Send + Sync,
{
    fn on_store_error(&self, err: StoreError) -> Result<(), StoreError> {
        self(err)
    }
}

/// Hands every store failure back to the caller.
#[derive(Clone, Copy, Debug, Default)]
pub struct Propagate;

impl StoreErrorPolicy for Propagate {
    fn on_store_error(&self, err: StoreError) -> Result<(), StoreError> {
        Err(err)
    }
}
