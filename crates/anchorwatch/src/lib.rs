//! Anchor transaction watcher: polls SEP-6/SEP-24 transactions and reports status changes.
//!
//! - **Watcher**: registry of watch sessions. [Watcher::watch_one_transaction] follows one
//!   transaction; [Watcher::watch_asset] follows every transaction of an asset. Each call
//!   returns a [WatchHandle] for stopping the session and reading its [EventStream].
//! - **Sessions**: one tokio task per watch, polling through the [TransactionSource] chosen at
//!   construction. A slow or backing-off session never delays another.
//! - **Retry**: failed polls are counted in a per-session [RetryContext]; a pluggable
//!   [RetryPolicy] (default [FixedBackoff], 3 attempts, 5 s apart) decides when to give up.
//! - **Events**: `StatusChanged` on every observed status transition, `RecoveryExhausted` when
//!   the policy gives up, and exactly one trailing `SessionClosed`.

pub mod config;
pub mod event;
pub mod retry;
mod session;
pub mod source;
pub mod telemetry;
pub mod transaction;
pub mod watcher;

pub use config::WatcherConfig;
pub use event::{CloseReason, EventBus, EventStream, StatusEvent};
pub use retry::{ExponentialBackoff, FailFast, FixedBackoff, RetryContext, RetryPolicy};
pub use source::{AssetId, AuthToken, FetchError, TransactionSource};
pub use transaction::{classify, StatusClass, Transaction, TransactionKind, TransactionStatus};
pub use watcher::{SessionKey, WatchError, WatchHandle, Watcher, WatcherBuilder};
