//! Watch sessions: one polling task per watched transaction or asset.
//!
//! A session polls its [Target] on a fixed interval until every transaction it tracks is
//! terminal, its retry policy gives up, or it is cancelled. Ticks within a session are
//! strictly sequential; the fetch, the status diff and any policy backoff finish before the
//! next tick is awaited. `SessionClosed` is published by [SessionCloser], never by the loop.

use crate::event::{CloseReason, EventBus, StatusEvent};
use crate::retry::{RetryContext, RetryPolicy};
use crate::source::{AssetId, AuthToken, FetchError, TransactionSource};
use crate::transaction::{Transaction, TransactionKind, TransactionStatus};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a session polls.
#[derive(Debug, Clone)]
pub(crate) enum Target {
    Transaction {
        id: String,
    },
    Asset {
        asset: AssetId,
        since: Option<DateTime<Utc>>,
        kind: Option<TransactionKind>,
    },
}

impl Target {
    async fn fetch(
        &self,
        source: &dyn TransactionSource,
        auth: &AuthToken,
    ) -> Result<Vec<Transaction>, FetchError> {
        match self {
            Target::Transaction { id } => {
                let tx = source.fetch_transaction(auth, id).await?;
                Ok(vec![tx])
            }
            Target::Asset { asset, since, kind } => {
                source
                    .fetch_transactions_for_asset(auth, asset, *since, *kind)
                    .await
            }
        }
    }
}

/// Cancellation shared by a session, its registry entry, and its handle.
#[derive(Debug, Default)]
pub(crate) struct SessionControl {
    token: CancellationToken,
    superseded: AtomicBool,
}

impl SessionControl {
    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancels because a newer session took over the same key.
    pub(crate) fn supersede(&self) {
        self.superseded.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn reason(&self) -> CloseReason {
        if self.superseded.load(Ordering::SeqCst) {
            CloseReason::Superseded
        } else {
            CloseReason::Cancelled
        }
    }
}

/// Last known status per transaction id.
#[derive(Debug, Default)]
pub(crate) struct StatusTracker {
    known: HashMap<String, TransactionStatus>,
}

impl StatusTracker {
    /// Records `tx` and returns a `StatusChanged` event if its status differs from the one
    /// last seen for the same id (or the id is new).
    pub(crate) fn observe(&mut self, tx: &Transaction) -> Option<StatusEvent> {
        let old = self.known.insert(tx.id.clone(), tx.status);
        if old == Some(tx.status) {
            return None;
        }
        Some(StatusEvent::StatusChanged {
            transaction: tx.clone(),
            new_status: tx.status,
            old_status: old,
        })
    }
}

/// A fetched set ends the session only if it is non-empty and entirely terminal.
pub(crate) fn all_terminal(txs: &[Transaction]) -> bool {
    !txs.is_empty() && txs.iter().all(Transaction::is_terminal)
}

enum Tick {
    Continue,
    Close(CloseReason),
}

pub(crate) struct Session {
    pub(crate) target: Target,
    pub(crate) auth: AuthToken,
    pub(crate) poll_interval: Duration,
    pub(crate) source: Arc<dyn TransactionSource>,
    pub(crate) policy: Arc<dyn RetryPolicy>,
    pub(crate) bus: EventBus,
    pub(crate) control: Arc<SessionControl>,
    pub(crate) retry: RetryContext,
    pub(crate) tracker: StatusTracker,
}

impl Session {
    /// Polls until the session closes and returns why. The first poll is immediate.
    pub(crate) async fn run(mut self) -> CloseReason {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let token = self.control.token.clone();
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return self.control.reason(),
                _ = ticker.tick() => {}
            }
            match self.tick(&token).await {
                Tick::Continue => {}
                Tick::Close(reason) => return reason,
            }
        }
    }

    async fn tick(&mut self, token: &CancellationToken) -> Tick {
        debug!(retry_count = self.retry.retry_count(), "poll");
        match self.target.fetch(self.source.as_ref(), &self.auth).await {
            Ok(txs) => {
                for tx in &txs {
                    if let Some(ev) = self.tracker.observe(tx) {
                        info!(tx = %tx.id, status = %tx.status, "transaction status changed");
                        self.bus.publish(ev);
                    }
                }
                self.retry.reset();
                if all_terminal(&txs) {
                    Tick::Close(CloseReason::Finished)
                } else {
                    Tick::Continue
                }
            }
            Err(e) => {
                warn!(reason = %e, retry_count = self.retry.retry_count() + 1, "fetch failed");
                self.retry.on_error(e);
                let give_up = tokio::select! {
                    biased;
                    _ = token.cancelled() => return Tick::Close(self.control.reason()),
                    g = self.policy.should_give_up(&self.retry) => g,
                };
                if !give_up {
                    return Tick::Continue;
                }
                if self.control.is_cancelled() {
                    return Tick::Close(self.control.reason());
                }
                warn!(retry_count = self.retry.retry_count(), "retry policy gave up");
                self.bus.publish(StatusEvent::RecoveryExhausted {
                    retry_count: self.retry.retry_count(),
                    last_error: self.retry.last_error().cloned(),
                });
                Tick::Close(CloseReason::RecoveryExhausted)
            }
        }
    }
}

/// Deregisters the session and publishes its `SessionClosed` when dropped, so the event goes
/// out exactly once even if the task is aborted or a source panics.
pub(crate) struct SessionCloser<F: FnOnce()> {
    bus: EventBus,
    deregister: Option<F>,
    reason: CloseReason,
}

impl<F: FnOnce()> SessionCloser<F> {
    pub(crate) fn new(bus: EventBus, deregister: F) -> Self {
        Self {
            bus,
            deregister: Some(deregister),
            reason: CloseReason::Cancelled,
        }
    }

    pub(crate) fn finish(mut self, reason: CloseReason) {
        self.reason = reason;
    }
}

impl<F: FnOnce()> Drop for SessionCloser<F> {
    fn drop(&mut self) {
        if let Some(deregister) = self.deregister.take() {
            deregister();
        }
        info!(reason = ?self.reason, "session closed");
        self.bus.publish(StatusEvent::SessionClosed {
            reason: self.reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionStatus as S;

    #[test]
    fn tracker_publishes_only_on_change() {
        let mut t = StatusTracker::default();
        let first = t.observe(&Transaction::new("a", S::Incomplete));
        assert_eq!(
            first,
            Some(StatusEvent::StatusChanged {
                transaction: Transaction::new("a", S::Incomplete),
                new_status: S::Incomplete,
                old_status: None,
            })
        );
        assert!(t.observe(&Transaction::new("a", S::Incomplete)).is_none());
        match t.observe(&Transaction::new("a", S::PendingAnchor)) {
            Some(StatusEvent::StatusChanged {
                old_status,
                new_status,
                ..
            }) => {
                assert_eq!(old_status, Some(S::Incomplete));
                assert_eq!(new_status, S::PendingAnchor);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn tracker_keys_by_transaction_id() {
        let mut t = StatusTracker::default();
        assert!(t.observe(&Transaction::new("a", S::Completed)).is_some());
        assert!(t.observe(&Transaction::new("b", S::Completed)).is_some());
        assert!(t.observe(&Transaction::new("a", S::Completed)).is_none());
    }

    #[test]
    fn empty_set_is_not_terminal() {
        assert!(!all_terminal(&[]));
    }

    #[test]
    fn set_is_terminal_only_when_every_item_is() {
        let done = Transaction::new("a", S::Completed);
        let failed = Transaction::new("b", S::TooSmall);
        let pending = Transaction::new("c", S::PendingStellar);
        assert!(all_terminal(&[done.clone(), failed.clone()]));
        assert!(!all_terminal(&[done, failed, pending]));
    }

    #[test]
    fn superseded_control_reports_superseded() {
        let c = SessionControl::default();
        assert!(!c.is_cancelled());
        c.supersede();
        assert!(c.is_cancelled());
        assert_eq!(c.reason(), CloseReason::Superseded);
        let c = SessionControl::default();
        c.cancel();
        assert_eq!(c.reason(), CloseReason::Cancelled);
    }

    #[tokio::test]
    async fn closer_publishes_once_on_drop() {
        let (bus, mut events) = EventBus::new(4);
        let deregistered = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&deregistered);
        let closer = SessionCloser::new(bus.clone(), move || flag.store(true, Ordering::SeqCst));
        closer.finish(CloseReason::Finished);
        assert!(deregistered.load(Ordering::SeqCst));
        assert_eq!(
            events.recv().await,
            Some(StatusEvent::SessionClosed {
                reason: CloseReason::Finished
            })
        );
    }
}
