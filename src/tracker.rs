use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use serde_json::json;
use tokio::task::JoinHandle;

use crate::{
    clock::{Clock, SystemClock},
    policy::{Denial, FailurePolicy},
    schedule,
    store::Store,
    AttemptRecord, Decision, GuardOptions, RequestContext, ResponseContext, Result, StoreError,
    StoreOp, ThrottleConfig,
};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Throttling engine for one protected resource.
///
/// Tracks allowed attempts per key in a [`Store`] and denies attempts that
/// arrive before the wait dictated by the schedule has passed. Cheap to
/// clone; clones share the store, config and clock.
#[derive(Clone)]
pub struct AttemptTracker {
    store: Arc<dyn Store>,
    config: ThrottleConfig,
    name: String,
    delays: Arc<[u64]>,
    lifetime: u64,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for AttemptTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttemptTracker")
            .field("name", &self.name)
            .field("delays", &self.delays)
            .field("lifetime", &self.lifetime)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AttemptTracker {
    /// Validates `config` and derives the wait schedule.
    pub fn new(store: Arc<dyn Store>, config: ThrottleConfig) -> Result<Self> {
        config.validate()?;

        let delays = schedule::compute(config.free_retries, config.min_wait, config.max_wait);
        let lifetime = config.lifetime.unwrap_or_else(|| {
            schedule::default_lifetime(config.free_retries, config.max_wait, delays.len())
        });
        let name = config.name.clone().unwrap_or_else(|| {
            format!("tracker-{}", NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed))
        });

        Ok(Self {
            store,
            config,
            name,
            delays: delays.into(),
            lifetime,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replaces the time source.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait schedule in milliseconds.
    pub fn delays(&self) -> &[u64] {
        &self.delays
    }

    /// Effective record lifetime in seconds; `0` means records never expire.
    pub fn lifetime(&self) -> u64 {
        self.lifetime
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Store key for an actor and optional sub-key within this tracker.
    pub fn key_for(&self, actor: Option<&str>, sub_key: Option<&str>) -> String {
        json!([actor, self.name, sub_key]).to_string()
    }

    /// Builds a gate that layers `options` over the base config.
    pub fn guard(&self, options: GuardOptions) -> Guard {
        Guard {
            tracker: self.clone(),
            options,
        }
    }

    /// Checks an attempt by `actor` at the current time.
    pub async fn check(
        &self,
        actor: &str,
        sub_key: Option<&str>,
        ctx: &mut RequestContext,
        resp: &mut ResponseContext,
    ) -> Result<Decision> {
        let now = self.clock.now_ms();
        self.check_at(actor, sub_key, ctx, resp, now).await
    }

    /// Checks an attempt by `actor` at `now` (epoch milliseconds).
    pub async fn check_at(
        &self,
        actor: &str,
        sub_key: Option<&str>,
        ctx: &mut RequestContext,
        resp: &mut ResponseContext,
        now: u64,
    ) -> Result<Decision> {
        let key = self.key_for(Some(actor), sub_key);
        let policy = Arc::clone(&self.config.failure_policy);
        self.evaluate(key, Some(actor), ctx, resp, policy.as_ref(), now)
            .await
    }

    /// Clears the record of `actor` for `sub_key`.
    pub async fn reset(&self, actor: &str, sub_key: Option<&str>) -> Result<()> {
        let key = self.key_for(Some(actor), sub_key);
        self.reset_key(key, Some(actor.to_owned())).await.map(|_| ())
    }

    /// Runs [`reset`](Self::reset) on a spawned task and calls `on_reset`
    /// once the store confirmed it. The callback never runs before this
    /// function has returned, and does not run at all if the reset failed.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn spawn_reset<F>(
        &self,
        actor: &str,
        sub_key: Option<&str>,
        on_reset: F,
    ) -> JoinHandle<Result<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        let tracker = self.clone();
        let key = self.key_for(Some(actor), sub_key);
        let actor = actor.to_owned();
        tokio::spawn(async move {
            if tracker.reset_key(key, Some(actor)).await? {
                on_reset();
            }
            Ok(())
        })
    }

    /// `Ok(false)` when the store failed and the store error policy
    /// swallowed it.
    async fn reset_key(&self, key: String, actor: Option<String>) -> Result<bool> {
        match self.store.reset(&key).await {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(tracker = %self.name, key = %key, "attempt record reset");
                Ok(true)
            }
            Err(source) => self
                .escalate(StoreError {
                    operation: StoreOp::Reset,
                    key,
                    actor,
                    source,
                })
                .map(|_| false),
        }
    }

    async fn evaluate(
        &self,
        key: String,
        actor: Option<&str>,
        ctx: &mut RequestContext,
        resp: &mut ResponseContext,
        failure_policy: &dyn FailurePolicy,
        now: u64,
    ) -> Result<Decision> {
        let stored = match self.store.get(&key).await {
            Ok(stored) => stored,
            Err(source) => {
                return self.escalate(StoreError {
                    operation: StoreOp::Get,
                    key,
                    actor: None,
                    source,
                })
            }
        };

        if self.config.attach_reset_handle {
            ctx.attach_reset().push(
                Arc::clone(&self.store),
                key.clone(),
                actor.map(str::to_owned),
                Arc::clone(&self.config.store_error_policy),
            );
        }

        let live = stored.filter(|record| !self.is_expired(record, now));
        let fresh = live.is_none();
        let record = live.unwrap_or_default();
        let next_valid_request_time = self.next_valid_request_time(&record, now);

        if record.count > u64::from(self.config.free_retries) && now < next_valid_request_time {
            #[cfg(feature = "tracing")]
            tracing::info!(
                tracker = %self.name,
                key = %key,
                count = record.count,
                next_valid_request_time,
                "attempt denied"
            );
            let denial = Denial {
                request: ctx,
                next_valid_request_time,
                now,
            };
            let flow = failure_policy.on_denied(&denial, resp);
            return Ok(Decision::Denied {
                next_valid_request_time,
                flow,
            });
        }

        let updated = AttemptRecord {
            count: record.count + 1,
            first_request_time: if fresh { now } else { record.started_at() },
            last_request_time: now,
        };
        let ttl = self.store_ttl(&updated, now);
        if let Err(source) = self.store.set(&key, updated, ttl).await {
            return self.escalate(StoreError {
                operation: StoreOp::Set,
                key,
                actor: None,
                source,
            });
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(tracker = %self.name, key = %key, count = updated.count, "attempt allowed");
        Ok(Decision::Allowed {
            count: updated.count,
        })
    }

    /// Earliest time the next attempt on `record` is allowed.
    pub fn next_valid_request_time(&self, record: &AttemptRecord, now: u64) -> u64 {
        match schedule::delay_index(record.count, self.config.free_retries, self.delays.len()) {
            Some(index) => record.last_request_time.saturating_add(self.delays[index]),
            None => now,
        }
    }

    /// Start of the record's lifetime: the latest allowed attempt with
    /// refresh on, the first one otherwise.
    fn lifetime_start(&self, record: &AttemptRecord) -> u64 {
        if self.config.refresh_timeout_on_request {
            record.last_request_time
        } else {
            record.started_at()
        }
    }

    fn is_expired(&self, record: &AttemptRecord, now: u64) -> bool {
        self.lifetime > 0
            && now.saturating_sub(self.lifetime_start(record))
                >= self.lifetime.saturating_mul(1000)
    }

    /// TTL handed to the store. Without refresh the record must still die
    /// `lifetime` seconds after the first attempt.
    fn store_ttl(&self, record: &AttemptRecord, now: u64) -> u64 {
        if self.lifetime == 0 || self.config.refresh_timeout_on_request {
            return self.lifetime;
        }
        let elapsed_secs = now.saturating_sub(record.started_at()) / 1000;
        self.lifetime.saturating_sub(elapsed_secs).max(1)
    }

    fn escalate(&self, err: StoreError) -> Result<Decision> {
        #[cfg(feature = "tracing")]
        tracing::warn!(tracker = %self.name, error = %err, "store failure");
        match self.config.store_error_policy.on_store_error(err) {
            Ok(()) => Ok(Decision::Aborted),
            Err(err) => Err(err.into()),
        }
    }
}

/// Gate for one protected operation, produced by [`AttemptTracker::guard`].
#[derive(Clone, Debug)]
pub struct Guard {
    tracker: AttemptTracker,
    options: GuardOptions,
}

impl Guard {
    pub fn tracker(&self) -> &AttemptTracker {
        &self.tracker
    }

    /// Store key this guard uses for `ctx`.
    pub fn key_for(&self, ctx: &RequestContext) -> String {
        let actor = self.actor_for(ctx);
        self.key_with_actor(ctx, actor.as_deref())
    }

    /// Actor identity of `ctx`, or `None` when the guard ignores the IP.
    fn actor_for(&self, ctx: &RequestContext) -> Option<String> {
        (!self.options.ignore_ip).then(|| ctx.actor(self.tracker.config.proxy_depth))
    }

    fn key_with_actor(&self, ctx: &RequestContext, actor: Option<&str>) -> String {
        let sub_key = self.options.key.as_ref().and_then(|key| key.resolve(ctx));
        self.tracker.key_for(actor, sub_key.as_deref())
    }

    pub async fn check(
        &self,
        ctx: &mut RequestContext,
        resp: &mut ResponseContext,
    ) -> Result<Decision> {
        let now = self.tracker.clock.now_ms();
        self.check_at(ctx, resp, now).await
    }

    pub async fn check_at(
        &self,
        ctx: &mut RequestContext,
        resp: &mut ResponseContext,
        now: u64,
    ) -> Result<Decision> {
        let actor = self.actor_for(ctx);
        let key = self.key_with_actor(ctx, actor.as_deref());
        let policy = self
            .options
            .failure_policy
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.tracker.config.failure_policy));
        self.tracker
            .evaluate(key, actor.as_deref(), ctx, resp, policy.as_ref(), now)
            .await
    }

    /// Checks the attempt and runs `next` if the decision lets it through.
    ///
    /// Returns `Ok(None)` when the operation was held back.
    pub async fn run<F, Fut, T>(
        &self,
        ctx: &mut RequestContext,
        resp: &mut ResponseContext,
        next: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let decision = self.check(ctx, resp).await?;
        if decision.proceeds() {
            Ok(Some(next().await))
        } else {
            Ok(None)
        }
    }

    /// Clears this guard's record for the requester of `ctx`.
    pub async fn reset(&self, ctx: &RequestContext) -> Result<()> {
        let actor = self.actor_for(ctx);
        let key = self.key_with_actor(ctx, actor.as_deref());
        self.tracker.reset_key(key, actor).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::AttemptTracker;
    use crate::{AttemptRecord, MemoryStore, ThrottleConfig, ThrottleError};

    fn tracker(config: ThrottleConfig) -> AttemptTracker {
        AttemptTracker::new(Arc::new(MemoryStore::new()), config).expect("config must be valid")
    }

    #[test]
    fn construction_rejects_invalid_bounds() {
        let err = AttemptTracker::new(Arc::new(MemoryStore::new()), ThrottleConfig::new(0, 50, 10))
            .expect_err("max below min must fail");
        assert!(matches!(err, ThrottleError::Config(_)));
    }

    #[test]
    fn derives_schedule_and_default_lifetime() {
        let t = tracker(ThrottleConfig::new(1, 100, 1000));
        assert_eq!(t.delays(), &[100, 100, 200, 300, 500, 800, 1000]);
        assert_eq!(t.lifetime(), 8);

        let explicit = tracker(ThrottleConfig::new(1, 100, 1000).with_lifetime(0));
        assert_eq!(explicit.lifetime(), 0);
    }

    #[test]
    fn unnamed_trackers_get_distinct_namespaces() {
        let a = tracker(ThrottleConfig::new(0, 10, 100));
        let b = tracker(ThrottleConfig::new(0, 10, 100));
        assert_ne!(a.name(), b.name());
        assert_ne!(a.key_for(Some("1.2.3.4"), None), b.key_for(Some("1.2.3.4"), None));
    }

    #[test]
    fn keys_do_not_collide_across_parts() {
        let t = tracker(ThrottleConfig::new(0, 10, 100).with_name("login"));
        assert_eq!(t.key_for(Some("1.2.3.4"), Some("x")), r#"["1.2.3.4","login","x"]"#);
        assert_eq!(t.key_for(None, Some("x")), r#"[null,"login","x"]"#);
        assert_ne!(t.key_for(Some("a"), Some("b")), t.key_for(Some("ab"), None));
    }

    #[test]
    fn next_valid_time_uses_clamped_index() {
        let t = tracker(ThrottleConfig::new(1, 10, 100));
        assert_eq!(t.next_valid_request_time(&AttemptRecord::new(1, 500), 900), 900);
        assert_eq!(t.next_valid_request_time(&AttemptRecord::new(2, 500), 900), 510);
        assert_eq!(t.next_valid_request_time(&AttemptRecord::new(4, 500), 900), 520);
        assert_eq!(t.next_valid_request_time(&AttemptRecord::new(99, 500), 900), 600);
    }

    #[test]
    fn ttl_counts_down_without_refresh() {
        let t = tracker(
            ThrottleConfig::new(0, 10, 100)
                .with_lifetime(10)
                .with_refresh_timeout_on_request(false),
        );
        assert_eq!(t.store_ttl(&AttemptRecord::new(1, 0), 0), 10);
        assert_eq!(t.store_ttl(&AttemptRecord::new(2, 0), 3_500), 7);
        assert_eq!(t.store_ttl(&AttemptRecord::new(3, 0), 9_999), 1);
        assert_eq!(t.store_ttl(&AttemptRecord::new(3, 0), 50_000), 1);

        let refreshing = tracker(ThrottleConfig::new(0, 10, 100).with_lifetime(10));
        assert_eq!(refreshing.store_ttl(&AttemptRecord::new(3, 0), 9_999), 10);
    }

    #[test]
    fn lifetime_anchor_depends_on_refresh() {
        let record = AttemptRecord {
            count: 3,
            first_request_time: 1_000,
            last_request_time: 8_000,
        };
        let fixed = tracker(
            ThrottleConfig::new(0, 10, 100)
                .with_lifetime(10)
                .with_refresh_timeout_on_request(false),
        );
        assert_eq!(fixed.store_ttl(&record, 9_000), 2);
        assert!(fixed.is_expired(&record, 11_000));
        assert_eq!(fixed.next_valid_request_time(&record, 9_000), 8_020);

        let refreshing = tracker(ThrottleConfig::new(0, 10, 100).with_lifetime(10));
        assert!(!refreshing.is_expired(&record, 11_000));
        assert!(refreshing.is_expired(&record, 18_000));
    }
}
