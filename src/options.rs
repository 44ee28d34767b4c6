use std::{fmt, sync::Arc};

use serde::Deserialize;

use crate::{
    policy::{FailurePolicy, Propagate, StoreErrorPolicy, TooManyRequests},
    RequestContext, ThrottleError,
};

fn default_failure_policy() -> Arc<dyn FailurePolicy> {
    Arc::new(TooManyRequests)
}

fn default_store_error_policy() -> Arc<dyn StoreErrorPolicy> {
    Arc::new(Propagate)
}

/// Configures an [`AttemptTracker`](crate::AttemptTracker).
///
/// Wait bounds are in milliseconds, `lifetime` in seconds. Deserializes from
/// partial documents; missing fields keep their defaults. Policies are not
/// deserialized and are attached with the `with_*` setters.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Namespace separating this tracker's keys from other trackers on the
    /// same store. A unique name is generated when unset.
    pub name: Option<String>,
    /// Attempts allowed before any wait is enforced.
    pub free_retries: u32,
    /// First wait once free retries are used up.
    pub min_wait: u64,
    /// Largest wait ever enforced.
    pub max_wait: u64,
    /// Seconds before an idle record is forgotten. `None` derives a value
    /// from the schedule, `Some(0)` keeps records forever.
    pub lifetime: Option<u64>,
    /// Restart the lifetime on every allowed attempt instead of measuring it
    /// from the first one.
    pub refresh_timeout_on_request: bool,
    /// Attach a [`ResetHandle`](crate::ResetHandle) to each checked request.
    pub attach_reset_handle: bool,
    /// Number of trusted proxies in front of the service.
    pub proxy_depth: usize,
    #[serde(skip, default = "default_failure_policy")]
    pub failure_policy: Arc<dyn FailurePolicy>,
    #[serde(skip, default = "default_store_error_policy")]
    pub store_error_policy: Arc<dyn StoreErrorPolicy>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            name: None,
            free_retries: 2,
            min_wait: 500,
            max_wait: 15 * 60 * 1000,
            lifetime: None,
            refresh_timeout_on_request: true,
            attach_reset_handle: true,
            proxy_depth: 0,
            failure_policy: default_failure_policy(),
            store_error_policy: default_store_error_policy(),
        }
    }
}

impl fmt::Debug for ThrottleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottleConfig")
            .field("name", &self.name)
            .field("free_retries", &self.free_retries)
            .field("min_wait", &self.min_wait)
            .field("max_wait", &self.max_wait)
            .field("lifetime", &self.lifetime)
            .field("refresh_timeout_on_request", &self.refresh_timeout_on_request)
            .field("attach_reset_handle", &self.attach_reset_handle)
            .field("proxy_depth", &self.proxy_depth)
            .finish_non_exhaustive()
    }
}

impl ThrottleConfig {
    pub fn new(free_retries: u32, min_wait: u64, max_wait: u64) -> Self {
        Self {
            free_retries,
            min_wait,
            max_wait,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_lifetime(mut self, secs: u64) -> Self {
        self.lifetime = Some(secs);
        self
    }

    pub fn with_refresh_timeout_on_request(mut self, refresh: bool) -> Self {
        self.refresh_timeout_on_request = refresh;
        self
    }

    pub fn with_attach_reset_handle(mut self, attach: bool) -> Self {
        self.attach_reset_handle = attach;
        self
    }

    pub fn with_proxy_depth(mut self, depth: usize) -> Self {
        self.proxy_depth = depth;
        self
    }

    pub fn with_failure_policy(mut self, policy: impl FailurePolicy + 'static) -> Self {
        self.failure_policy = Arc::new(policy);
        self
    }

    pub fn with_store_error_policy(mut self, policy: impl StoreErrorPolicy + 'static) -> Self {
        self.store_error_policy = Arc::new(policy);
        self
    }

    /// Checks the wait bounds.
    pub fn validate(&self) -> Result<(), ThrottleError> {
        if self.min_wait == 0 {
            return Err(ThrottleError::Config("min_wait must be greater than 0".to_owned()));
        }
        if self.max_wait < self.min_wait {
            return Err(ThrottleError::Config(format!(
                "max_wait ({}) must not be less than min_wait ({})",
                self.max_wait, self.min_wait
            )));
        }
        Ok(())
    }
}

/// Derives a sub-key from the request.
pub type KeyFn = Arc<dyn Fn(&RequestContext) -> Option<String> + Send + Sync>;

/// Where a guard's sub-key comes from.
#[derive(Clone)]
pub enum KeySource {
    Static(String),
    Derived(KeyFn),
}

impl KeySource {
    pub(crate) fn resolve(&self, ctx: &RequestContext) -> Option<String> {
        match self {
            Self::Static(key) => Some(key.clone()),
            Self::Derived(key_fn) => key_fn(ctx),
        }
    }
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(key) => f.debug_tuple("Static").field(key).finish(),
            Self::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

/// Per-operation overrides layered over a tracker's base config.
#[derive(Clone, Default)]
pub struct GuardOptions {
    pub key: Option<KeySource>,
    /// Leave the actor identity out of the key so the sub-key alone names
    /// the throttled subject.
    pub ignore_ip: bool,
    pub failure_policy: Option<Arc<dyn FailurePolicy>>,
}

impl GuardOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(KeySource::Static(key.into()));
        self
    }

    pub fn key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&RequestContext) -> Option<String> + Send + Sync + 'static,
    {
        self.key = Some(KeySource::Derived(Arc::new(key_fn)));
        self
    }

    pub fn ignore_ip(mut self, ignore: bool) -> Self {
        self.ignore_ip = ignore;
        self
    }

    pub fn failure_policy(mut self, policy: impl FailurePolicy + 'static) -> Self {
        self.failure_policy = Some(Arc::new(policy));
        self
    }
}

impl fmt::Debug for GuardOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardOptions")
            .field("key", &self.key)
            .field("ignore_ip", &self.ignore_ip)
            .field("failure_policy", &self.failure_policy.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{GuardOptions, ThrottleConfig};
    use crate::{RequestContext, ThrottleError};

    #[test]
    fn defaults_match_login_protection() {
        let config = ThrottleConfig::default();
        assert_eq!(config.free_retries, 2);
        assert_eq!(config.min_wait, 500);
        assert_eq!(config.max_wait, 900_000);
        assert_eq!(config.lifetime, None);
        assert!(config.refresh_timeout_on_request);
        assert!(config.attach_reset_handle);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_bad_wait_bounds() {
        assert!(matches!(
            ThrottleConfig::new(0, 0, 10).validate(),
            Err(ThrottleError::Config(_))
        ));
        assert!(matches!(
            ThrottleConfig::new(0, 100, 10).validate(),
            Err(ThrottleError::Config(_))
        ));
        assert!(ThrottleConfig::new(0, 10, 10).validate().is_ok());
    }

    #[test]
    fn deserializes_partial_documents() {
        let config: ThrottleConfig = serde_json::from_str(
            r#"{ "free_retries": 5, "min_wait": 1000, "max_wait": 60000, "lifetime": 0 }"#,
        )
        .expect("config must deserialize");
        assert_eq!(config.free_retries, 5);
        assert_eq!(config.lifetime, Some(0));
        assert_eq!(config.proxy_depth, 0);
        assert!(config.refresh_timeout_on_request);
    }

    #[test]
    fn key_sources_resolve_against_request() {
        let ctx = RequestContext::new("1.2.3.4").with_attribute("user", "kit");
        let fixed = GuardOptions::new().key("login");
        let derived = GuardOptions::new().key_fn(|ctx| ctx.attribute("user").map(str::to_owned));

        let fixed_key = fixed.key.expect("key must be set").resolve(&ctx);
        let derived_key = derived.key.expect("key must be set").resolve(&ctx);
        assert_eq!(fixed_key.as_deref(), Some("login"));
        assert_eq!(derived_key.as_deref(), Some("kit"));
    }
}
