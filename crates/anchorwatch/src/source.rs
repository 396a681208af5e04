//! The fetch capability the watcher polls through.
//!
//! The watcher never talks to an anchor directly. A [TransactionSource] is chosen when the
//! [crate::Watcher] is built (a SEP-24 interactive client, a SEP-6 client, a test double) and
//! every session calls it on each tick.

use crate::transaction::{Transaction, TransactionKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

/// Failure reported by a [TransactionSource]. Every variant is treated as transient by the
/// sessions; the retry policy decides when to stop.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("anchor returned {status}: {message}")]
    Server { status: u16, message: String },
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("transaction not found: {0}")]
    NotFound(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for FetchError {
    fn from(e: serde_json::Error) -> Self {
        FetchError::Decode(e.to_string())
    }
}

/// Opaque SEP-10 bearer token, passed through to the source untouched.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

impl From<&str> for AuthToken {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for AuthToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Asset identifier as understood by the anchor, e.g. `stellar:USDC:GA5Z...` or `iso4217:USD`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetId(String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for AssetId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Remote lookups used by watch sessions.
#[async_trait]
pub trait TransactionSource: Send + Sync {
    /// Look up one transaction by id.
    async fn fetch_transaction(
        &self,
        auth: &AuthToken,
        id: &str,
    ) -> Result<Transaction, FetchError>;

    /// List the transactions of `asset`, optionally only those started at or after `since`
    /// and only of the given `kind`.
    async fn fetch_transactions_for_asset(
        &self,
        auth: &AuthToken,
        asset: &AssetId,
        since: Option<DateTime<Utc>>,
        kind: Option<TransactionKind>,
    ) -> Result<Vec<Transaction>, FetchError>;
}
