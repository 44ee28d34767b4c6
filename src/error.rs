use std::fmt;

/// Boxed error returned by [`Store`](crate::Store) backends.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Store operation that failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreOp {
    Get,
    Set,
    Reset,
}

impl StoreOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Reset => "reset",
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::Get => "cannot get request count",
            Self::Set => "cannot increment request count",
            Self::Reset => "cannot reset request count",
        }
    }
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A store failure together with the context it happened in.
#[derive(Debug, thiserror::Error)]
#[error("{} (key {key})", .operation.describe())]
pub struct StoreError {
    /// Operation that failed.
    pub operation: StoreOp,
    /// Fully derived store key.
    pub key: String,
    /// Actor identity, set for reset failures.
    pub actor: Option<String>,
    /// Underlying backend error.
    #[source]
    pub source: BoxError,
}

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum ThrottleError {
    /// Invalid wait bounds passed at construction.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Store failure escalated by the store error policy.
    #[error(transparent)]
    Store(#[from] StoreError),
}
