//! Common helpers for integration tests.

#![allow(dead_code)]

use anchorwatch::{
    AssetId, AuthToken, CloseReason, EventStream, FetchError, StatusEvent, Transaction,
    TransactionKind, TransactionSource, TransactionStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("anchorwatch=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

/// Filters passed to the last asset listing call.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetQuery {
    pub since: Option<DateTime<Utc>>,
    pub kind: Option<TransactionKind>,
}

/// In-memory source replaying scripted responses. Each key's script is consumed front to
/// back; the final response repeats forever. Unscripted keys fail with `NotFound`.
#[derive(Default)]
pub struct ScriptedSource {
    single: Mutex<HashMap<String, VecDeque<Result<Transaction, FetchError>>>>,
    assets: Mutex<HashMap<String, VecDeque<Result<Vec<Transaction>, FetchError>>>>,
    calls: Mutex<HashMap<String, usize>>,
    last_query: Mutex<HashMap<String, AssetQuery>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_transaction(
        self,
        id: &str,
        responses: Vec<Result<Transaction, FetchError>>,
    ) -> Self {
        self.single
            .lock()
            .unwrap()
            .insert(id.to_string(), responses.into());
        self
    }

    pub fn script_asset(
        self,
        asset: &str,
        responses: Vec<Result<Vec<Transaction>, FetchError>>,
    ) -> Self {
        self.assets
            .lock()
            .unwrap()
            .insert(asset.to_string(), responses.into());
        self
    }

    /// Every fetch takes this long before answering.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = Some(delay);
        self
    }

    /// Number of fetches issued for a transaction id or asset id.
    pub fn calls(&self, key: &str) -> usize {
        self.calls.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn last_query(&self, asset: &str) -> Option<AssetQuery> {
        self.last_query.lock().unwrap().get(asset).cloned()
    }

    fn record_call(&self, key: &str) {
        *self.calls.lock().unwrap().entry(key.to_string()).or_insert(0) += 1;
    }

    async fn maybe_delay(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
    }
}

fn next_scripted<T: Clone>(queue: Option<&mut VecDeque<Result<T, FetchError>>>, key: &str) -> Result<T, FetchError> {
    match queue {
        Some(q) if q.len() > 1 => q.pop_front().unwrap(),
        Some(q) if q.len() == 1 => q[0].clone(),
        _ => Err(FetchError::NotFound(key.to_string())),
    }
}

#[async_trait]
impl TransactionSource for ScriptedSource {
    async fn fetch_transaction(
        &self,
        _auth: &AuthToken,
        id: &str,
    ) -> Result<Transaction, FetchError> {
        self.record_call(id);
        self.maybe_delay().await;
        let mut single = self.single.lock().unwrap();
        next_scripted(single.get_mut(id), id)
    }

    async fn fetch_transactions_for_asset(
        &self,
        _auth: &AuthToken,
        asset: &AssetId,
        since: Option<DateTime<Utc>>,
        kind: Option<TransactionKind>,
    ) -> Result<Vec<Transaction>, FetchError> {
        self.record_call(asset.as_str());
        self.last_query
            .lock()
            .unwrap()
            .insert(asset.to_string(), AssetQuery { since, kind });
        self.maybe_delay().await;
        let mut assets = self.assets.lock().unwrap();
        next_scripted(assets.get_mut(asset.as_str()), asset.as_str())
    }
}

pub fn tx(id: &str, status: TransactionStatus) -> Transaction {
    Transaction::new(id, status)
}

pub fn transport_error() -> FetchError {
    FetchError::Transport("connection reset".to_string())
}

/// Reads a stream to its end, failing the test if it does not close within an hour of
/// (paused) time.
pub async fn drain(events: EventStream) -> Vec<StatusEvent> {
    timeout(Duration::from_secs(3600), events.collect_all())
        .await
        .expect("session did not close")
}

/// Asserts exactly one `SessionClosed`, that it is last, and returns its reason.
pub fn close_reason(events: &[StatusEvent]) -> CloseReason {
    let closes = events.iter().filter(|e| e.is_closed()).count();
    assert_eq!(closes, 1, "expected exactly one SessionClosed in {events:?}");
    match events.last() {
        Some(StatusEvent::SessionClosed { reason }) => *reason,
        other => panic!("SessionClosed must be last, got {other:?}"),
    }
}

/// `(transaction id, old, new)` for every `StatusChanged`, in order.
pub fn changes(
    events: &[StatusEvent],
) -> Vec<(String, Option<TransactionStatus>, TransactionStatus)> {
    events
        .iter()
        .filter_map(|e| match e {
            StatusEvent::StatusChanged {
                transaction,
                new_status,
                old_status,
            } => Some((transaction.id.clone(), *old_status, *new_status)),
            _ => None,
        })
        .collect()
}
