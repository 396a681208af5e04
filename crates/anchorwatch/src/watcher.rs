//! Watcher: session registry and the caller-facing watch API.
//!
//! Two registries, one keyed by transaction id and one by asset id, map each key to the
//! session currently watching it. A new watch for a key that is already watched replaces the
//! registry entry and supersedes the older session. Sessions remove their own entry when they
//! close, but only while the entry still belongs to them.

use crate::config::WatcherConfig;
use crate::event::{EventBus, EventStream};
use crate::retry::{FixedBackoff, RetryContext, RetryPolicy};
use crate::session::{Session, SessionCloser, SessionControl, StatusTracker, Target};
use crate::source::{AssetId, AuthToken, TransactionSource};
use crate::transaction::TransactionKind;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, Instrument};

/// Rejected watch or builder call. Nothing has been started when one of these is returned.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("poll interval must be greater than zero")]
    InvalidPollInterval,
    #[error("event capacity must be greater than zero")]
    InvalidEventCapacity,
    #[error("transaction id must not be empty")]
    EmptyTransactionId,
    #[error("asset id must not be empty")]
    EmptyAsset,
    #[error("transaction source required")]
    MissingSource,
    #[error("watch must be called from within a tokio runtime")]
    NoRuntime,
}

/// Identity of a session in the watcher's registries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionKey {
    Transaction(String),
    Asset(AssetId),
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKey::Transaction(id) => write!(f, "tx:{id}"),
            SessionKey::Asset(asset) => write!(f, "asset:{asset}"),
        }
    }
}

struct Entry {
    session_id: u64,
    control: Arc<SessionControl>,
}

struct Registry<K> {
    entries: Mutex<HashMap<K, Entry>>,
}

impl<K: Eq + Hash + Clone> Registry<K> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts, returning the control of the session that was replaced.
    fn insert(&self, key: K, entry: Entry) -> Option<Arc<SessionControl>> {
        self.entries.lock().insert(key, entry).map(|e| e.control)
    }

    /// Removes `key` only if it still maps to `session_id`.
    fn remove_if_current(&self, key: &K, session_id: u64) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(e) if e.session_id == session_id => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.lock().contains_key(key)
    }

    fn keys(&self) -> Vec<K> {
        self.entries.lock().keys().cloned().collect()
    }

    fn cancel_all(&self) -> usize {
        let entries = self.entries.lock();
        for e in entries.values() {
            e.control.cancel();
        }
        entries.len()
    }
}

struct WatcherInner {
    source: Arc<dyn TransactionSource>,
    policy: Arc<dyn RetryPolicy>,
    config: WatcherConfig,
    transactions: Registry<String>,
    assets: Registry<AssetId>,
    next_session_id: AtomicU64,
}

impl WatcherInner {
    fn deregister(&self, key: &SessionKey, session_id: u64) {
        let removed = match key {
            SessionKey::Transaction(id) => self.transactions.remove_if_current(id, session_id),
            SessionKey::Asset(asset) => self.assets.remove_if_current(asset, session_id),
        };
        if !removed {
            tracing::debug!(%key, session = session_id, "registry entry already replaced");
        }
    }
}

/// Starts and tracks watch sessions against one [TransactionSource].
///
/// Cheap to clone; clones share the same registries.
#[derive(Clone)]
pub struct Watcher {
    inner: Arc<WatcherInner>,
}

impl Watcher {
    pub fn builder() -> WatcherBuilder {
        WatcherBuilder::new()
    }

    /// Watcher with the default retry policy ([FixedBackoff]).
    pub fn new(
        source: Arc<dyn TransactionSource>,
        config: WatcherConfig,
    ) -> Result<Self, WatchError> {
        config.validate()?;
        Ok(Self::from_parts(
            source,
            Arc::new(FixedBackoff::default()),
            config,
        ))
    }

    fn from_parts(
        source: Arc<dyn TransactionSource>,
        policy: Arc<dyn RetryPolicy>,
        config: WatcherConfig,
    ) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                source,
                policy,
                config,
                transactions: Registry::new(),
                assets: Registry::new(),
                next_session_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.inner.config
    }

    /// Polls one transaction until it reaches a terminal status.
    pub fn watch_one_transaction(
        &self,
        auth: &AuthToken,
        id: impl Into<String>,
    ) -> Result<WatchHandle, WatchError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(WatchError::EmptyTransactionId);
        }
        self.start(
            SessionKey::Transaction(id.clone()),
            Target::Transaction { id },
            auth,
        )
    }

    /// Polls every transaction of `asset` (optionally only those started at or after `since`,
    /// and only of `kind`) until a poll returns a non-empty, all-terminal set.
    pub fn watch_asset(
        &self,
        auth: &AuthToken,
        asset: impl Into<AssetId>,
        since: Option<DateTime<Utc>>,
        kind: Option<TransactionKind>,
    ) -> Result<WatchHandle, WatchError> {
        let asset = asset.into();
        if asset.is_empty() {
            return Err(WatchError::EmptyAsset);
        }
        self.start(
            SessionKey::Asset(asset.clone()),
            Target::Asset { asset, since, kind },
            auth,
        )
    }

    fn start(
        &self,
        key: SessionKey,
        target: Target,
        auth: &AuthToken,
    ) -> Result<WatchHandle, WatchError> {
        let config = &self.inner.config;
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| WatchError::NoRuntime)?;

        let session_id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed);
        let control = Arc::new(SessionControl::default());
        // The primary stream exists before the task does, so the first poll's events are kept.
        let (bus, events) = EventBus::new(config.event_capacity);

        let entry = Entry {
            session_id,
            control: Arc::clone(&control),
        };
        let replaced = match &key {
            SessionKey::Transaction(id) => self.inner.transactions.insert(id.clone(), entry),
            SessionKey::Asset(asset) => self.inner.assets.insert(asset.clone(), entry),
        };
        if let Some(old) = replaced {
            info!(%key, "superseding existing watch");
            old.supersede();
        }

        let session = Session {
            target,
            auth: auth.clone(),
            poll_interval: config.poll_interval,
            source: Arc::clone(&self.inner.source),
            policy: Arc::clone(&self.inner.policy),
            bus: bus.clone(),
            control: Arc::clone(&control),
            retry: RetryContext::new(),
            tracker: StatusTracker::default(),
        };

        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let task_bus = bus.clone();
        let span = tracing::info_span!("session", id = session_id, key = %key);
        // Built outside the task: if the runtime drops the task unpolled, the session still
        // deregisters and closes its stream.
        let closer = SessionCloser::new(task_bus, move || inner.deregister(&task_key, session_id));
        runtime.spawn(
            async move {
                info!(poll_interval = ?session.poll_interval, "session started");
                let reason = session.run().await;
                closer.finish(reason);
            }
            .instrument(span),
        );

        Ok(WatchHandle {
            key,
            session_id,
            control,
            bus,
            events: Some(events),
        })
    }

    pub fn is_watching_transaction(&self, id: &str) -> bool {
        self.inner.transactions.contains(id)
    }

    pub fn is_watching_asset(&self, asset: &AssetId) -> bool {
        self.inner.assets.contains(asset)
    }

    pub fn active_transactions(&self) -> Vec<String> {
        self.inner.transactions.keys()
    }

    pub fn active_assets(&self) -> Vec<AssetId> {
        self.inner.assets.keys()
    }

    /// Cancels every active session. Returns how many were signalled.
    pub fn shutdown(&self) -> usize {
        let n = self.inner.transactions.cancel_all() + self.inner.assets.cancel_all();
        info!(sessions = n, "watcher shutdown requested");
        n
    }
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("config", &self.inner.config)
            .field("transactions", &self.inner.transactions.keys().len())
            .field("assets", &self.inner.assets.keys().len())
            .finish()
    }
}

/// Builder for [Watcher].
pub struct WatcherBuilder {
    source: Option<Arc<dyn TransactionSource>>,
    policy: Option<Arc<dyn RetryPolicy>>,
    config: WatcherConfig,
}

impl WatcherBuilder {
    pub fn new() -> Self {
        Self {
            source: None,
            policy: None,
            config: WatcherConfig::default(),
        }
    }

    pub fn source(mut self, source: impl TransactionSource + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Same as [Self::source] for a source that is already shared.
    pub fn shared_source(mut self, source: Arc<dyn TransactionSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Defaults to [FixedBackoff::default].
    pub fn retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.policy = Some(Arc::new(policy));
        self
    }

    pub fn poll_interval(mut self, interval: std::time::Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn config(mut self, config: WatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Watcher, WatchError> {
        let source = self.source.ok_or(WatchError::MissingSource)?;
        self.config.validate()?;
        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(FixedBackoff::default()));
        Ok(Watcher::from_parts(source, policy, self.config))
    }
}

impl Default for WatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller's reference to one session: stop it, or read its events.
///
/// Dropping the handle does not stop the session.
pub struct WatchHandle {
    key: SessionKey,
    session_id: u64,
    control: Arc<SessionControl>,
    bus: EventBus,
    events: Option<EventStream>,
}

impl WatchHandle {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Requests cancellation and returns immediately. Idempotent; harmless after the session
    /// has already closed. No poll starts after this returns.
    pub fn stop(&self) {
        self.control.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.control.is_cancelled()
    }

    /// The session's event stream. The first call returns the lossless stream holding every
    /// event since the watch started; later calls behave like [Self::subscribe].
    pub fn events(&mut self) -> EventStream {
        self.events.take().unwrap_or_else(|| self.bus.subscribe())
    }

    /// An additional subscription starting now. Bounded by `event_capacity`: a reader that
    /// falls further behind skips events, though it always receives `SessionClosed`.
    pub fn subscribe(&self) -> EventStream {
        self.bus.subscribe()
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("key", &self.key)
            .field("session_id", &self.session_id)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
