//! `attempt-throttle` slows down brute-force attempts against sensitive
//! operations such as logins.
//!
//! Each actor gets a number of free attempts. After that, every attempt must
//! wait out a growing delay taken from a schedule bounded by `min_wait` and
//! `max_wait`. Attempt counts live in a pluggable async [`Store`] with a
//! time-to-live, so idle actors are eventually forgotten.
//!
//! - [`AttemptTracker::check`] / [`Guard::check`] decide whether an attempt
//!   may proceed
//! - [`AttemptTracker::reset`] and [`ResetHandle::reset_all`] unlock actors
//!   after a successful login
//! - [`FailurePolicy`] decides how a denial is answered
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use attempt_throttle::{
//!     AttemptTracker, GuardOptions, MemoryStore, RequestContext, ResponseContext,
//!     ThrottleConfig,
//! };
//!
//! # async fn demo() -> attempt_throttle::Result<()> {
//! let tracker = AttemptTracker::new(
//!     Arc::new(MemoryStore::new()),
//!     ThrottleConfig::new(3, 1_000, 60_000),
//! )?;
//! let login = tracker.guard(GuardOptions::new().key("login"));
//!
//! let mut ctx = RequestContext::new("203.0.113.7");
//! let mut resp = ResponseContext::default();
//! if login.check(&mut ctx, &mut resp).await?.proceeds() {
//!     // verify credentials, then unlock on success
//!     if let Some(reset) = ctx.reset_handle() {
//!         reset.reset_all().await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client_ip;
mod clock;
mod error;
mod options;
mod policy;
mod reset;
pub mod schedule;
mod store;
mod tracker;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{BoxError, StoreError, StoreOp, ThrottleError};
pub use options::{GuardOptions, KeyFn, KeySource, ThrottleConfig};
pub use policy::{
    Denial, FailurePolicy, Forbidden, MarkAndContinue, Propagate, StoreErrorPolicy,
    TooManyRequests,
};
pub use reset::ResetHandle;
pub use store::{MemoryStore, Store};
pub use tracker::{AttemptTracker, Guard};
pub use types::{AttemptRecord, Decision, Flow, RequestContext, ResponseContext};

pub type Result<T> = std::result::Result<T, ThrottleError>;
