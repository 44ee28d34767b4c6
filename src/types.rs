use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{client_ip, ResetHandle};

/// Attempt state persisted per key.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Number of allowed attempts.
    pub count: u64,
    /// Epoch milliseconds of the first allowed attempt. `0` in records
    /// written without it.
    #[serde(default)]
    pub first_request_time: u64,
    /// Epoch milliseconds of the latest allowed attempt; the schedule is
    /// measured from here.
    pub last_request_time: u64,
}

impl AttemptRecord {
    /// Record whose first and latest attempt both happened at `at`.
    pub fn new(count: u64, at: u64) -> Self {
        Self {
            count,
            first_request_time: at,
            last_request_time: at,
        }
    }

    /// When the first attempt happened, falling back to the latest one for
    /// records that never stored it.
    pub fn started_at(&self) -> u64 {
        if self.first_request_time == 0 {
            self.last_request_time
        } else {
            self.first_request_time
        }
    }
}

/// Whether the protected operation should run after a check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Flow {
    Proceed,
    Halt,
}

/// Outcome of a single check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Decision {
    /// Attempt recorded; `count` is the stored value after the increment.
    Allowed { count: u64 },
    /// Attempt came in too early. `flow` is what the failure policy chose.
    Denied {
        next_valid_request_time: u64,
        flow: Flow,
    },
    /// The store failed and the store error policy swallowed the error.
    Aborted,
}

impl Decision {
    /// `true` when the continuation should run.
    pub fn proceeds(&self) -> bool {
        match self {
            Self::Allowed { .. } => true,
            Self::Denied { flow, .. } => *flow == Flow::Proceed,
            Self::Aborted => false,
        }
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied { .. })
    }
}

/// Inbound side of a guarded call.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    /// Address of the directly connected peer.
    pub remote_addr: String,
    /// Raw `X-Forwarded-For` style chain, if any.
    pub forwarded_for: Option<String>,
    /// Free-form values available to derived key functions.
    pub attributes: HashMap<String, String>,
    reset: Option<ResetHandle>,
}

impl RequestContext {
    pub fn new(remote_addr: impl Into<String>) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            ..Self::default()
        }
    }

    pub fn with_forwarded_for(mut self, chain: impl Into<String>) -> Self {
        self.forwarded_for = Some(chain.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Actor identity for this request, honoring `proxy_depth`.
    pub fn actor(&self, proxy_depth: usize) -> String {
        client_ip::resolve(&self.remote_addr, self.forwarded_for.as_deref(), proxy_depth)
    }

    /// Reset shortcut for every key touched during this call, if any guard
    /// attached one.
    pub fn reset_handle(&self) -> Option<&ResetHandle> {
        self.reset.as_ref()
    }

    pub(crate) fn attach_reset(&mut self) -> &ResetHandle {
        self.reset.get_or_insert_with(ResetHandle::default)
    }
}

/// Outbound side of a guarded call, written by failure policies.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResponseContext {
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    /// Set by policies that let the call continue after a denial.
    pub next_valid_request_time: Option<u64>,
}

impl ResponseContext {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }
}
