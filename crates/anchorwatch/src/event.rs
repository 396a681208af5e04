//! Per-session event channel.
//!
//! Every session gets its own [EventBus]. The stream created with the bus (the one a
//! [crate::WatchHandle] hands out first) is fed through an unbounded `mpsc` channel and never
//! drops an event. Further subscribers share a `tokio::sync::broadcast` channel of the
//! configured capacity; one that falls more than that far behind skips what it missed. Every
//! [EventStream] ends right after the session's single [StatusEvent::SessionClosed].

use crate::source::FetchError;
use crate::transaction::{Transaction, TransactionStatus};
use futures_util::Stream;
use std::sync::{Arc, OnceLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Every tracked transaction reached a terminal status.
    Finished,
    /// The retry policy gave up.
    RecoveryExhausted,
    /// Stopped through its handle or by watcher shutdown.
    Cancelled,
    /// A newer watch for the same key replaced this session.
    Superseded,
}

/// Events published on a session's stream, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    StatusChanged {
        transaction: Transaction,
        new_status: TransactionStatus,
        /// `None` the first time the transaction is seen.
        old_status: Option<TransactionStatus>,
    },
    RecoveryExhausted {
        retry_count: u32,
        last_error: Option<FetchError>,
    },
    /// Always the last event of a session.
    SessionClosed { reason: CloseReason },
}

impl StatusEvent {
    pub fn is_closed(&self) -> bool {
        matches!(self, StatusEvent::SessionClosed { .. })
    }
}

/// Sending half of a session's channel. Cheap to clone.
///
/// Remembers the close reason so a subscriber arriving after the session closed still gets
/// its `SessionClosed` instead of waiting forever.
#[derive(Debug, Clone)]
pub struct EventBus {
    primary: mpsc::UnboundedSender<StatusEvent>,
    tx: broadcast::Sender<StatusEvent>,
    closed: Arc<OnceLock<CloseReason>>,
}

impl EventBus {
    /// New bus plus its lossless primary stream. `capacity` bounds only the streams handed
    /// out later by [Self::subscribe].
    pub fn new(capacity: usize) -> (Self, EventStream) {
        let (primary, primary_rx) = mpsc::unbounded_channel();
        let (tx, _) = broadcast::channel(capacity);
        let bus = Self {
            primary,
            tx,
            closed: Arc::new(OnceLock::new()),
        };
        let stream = EventStream {
            inbox: Inbox::Primary(primary_rx),
            done: false,
            closed: None,
        };
        (bus, stream)
    }

    /// Publishes to the primary stream and current subscribers. Having none is not an error.
    pub fn publish(&self, event: StatusEvent) {
        if let StatusEvent::SessionClosed { reason } = &event {
            let _ = self.closed.set(*reason);
        }
        let _ = self.primary.send(event.clone());
        let _ = self.tx.send(event);
    }

    /// Receives events published after this call. May skip events if it falls more than the
    /// bus capacity behind; the closing event is never skipped.
    pub fn subscribe(&self) -> EventStream {
        let rx = self.tx.subscribe();
        // Checked after subscribing: if already set, the replayed close is the only event.
        let closed = self.closed.get().copied();
        EventStream {
            inbox: Inbox::Broadcast(rx),
            done: false,
            closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get().is_some()
    }
}

#[derive(Debug)]
enum Inbox {
    Primary(mpsc::UnboundedReceiver<StatusEvent>),
    Broadcast(broadcast::Receiver<StatusEvent>),
}

impl Inbox {
    async fn next(&mut self) -> Option<StatusEvent> {
        match self {
            Inbox::Primary(rx) => rx.recv().await,
            Inbox::Broadcast(rx) => loop {
                match rx.recv().await {
                    Ok(ev) => return Some(ev),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event subscriber lagged, events dropped");
                    }
                    Err(RecvError::Closed) => return None,
                }
            },
        }
    }
}

/// Receiving half of a session's channel.
#[derive(Debug)]
pub struct EventStream {
    inbox: Inbox,
    done: bool,
    closed: Option<CloseReason>,
}

impl EventStream {
    /// Next event, or `None` once `SessionClosed` has been yielded.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        if self.done {
            return None;
        }
        if let Some(reason) = self.closed.take() {
            self.done = true;
            return Some(StatusEvent::SessionClosed { reason });
        }
        match self.inbox.next().await {
            Some(ev) => {
                if ev.is_closed() {
                    self.done = true;
                }
                Some(ev)
            }
            None => {
                self.done = true;
                None
            }
        }
    }

    /// Collects everything up to and including `SessionClosed`.
    pub async fn collect_all(mut self) -> Vec<StatusEvent> {
        let mut out = Vec::new();
        while let Some(ev) = self.recv().await {
            out.push(ev);
        }
        out
    }

    pub fn into_stream(self) -> impl Stream<Item = StatusEvent> + Send + Unpin {
        Box::pin(futures_util::stream::unfold(self, |mut s| async move {
            s.recv().await.map(|ev| (ev, s))
        }))
    }
}
