//! Example: watch a simulated anchor and print every event.
//!
//! Usage: cargo run -p anchorwatch --example watch_demo -- --poll-ms 500 --fail-every 3
//!
//! The simulated anchor advances each transaction one status per poll and fails every
//! `--fail-every`th request (0 disables failures).

use anchorwatch::{
    telemetry, AssetId, AuthToken, ExponentialBackoff, FetchError, StatusEvent, Transaction,
    TransactionKind, TransactionSource, TransactionStatus, Watcher,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const LIFECYCLE: [TransactionStatus; 5] = [
    TransactionStatus::Incomplete,
    TransactionStatus::PendingUserTransferStart,
    TransactionStatus::PendingAnchor,
    TransactionStatus::PendingStellar,
    TransactionStatus::Completed,
];

struct SimulatedAnchor {
    fail_every: u64,
    requests: AtomicU64,
    progress: Mutex<HashMap<String, usize>>,
}

impl SimulatedAnchor {
    fn advance(&self, id: &str) -> Result<Transaction, FetchError> {
        let n = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        if self.fail_every > 0 && n % self.fail_every == 0 {
            return Err(FetchError::Transport(format!("simulated failure #{n}")));
        }
        let mut progress = self.progress.lock();
        let step = progress.entry(id.to_string()).or_insert(0);
        let status = LIFECYCLE[(*step).min(LIFECYCLE.len() - 1)];
        *step += 1;
        Ok(Transaction::new(id, status))
    }
}

#[async_trait]
impl TransactionSource for SimulatedAnchor {
    async fn fetch_transaction(
        &self,
        _auth: &AuthToken,
        id: &str,
    ) -> Result<Transaction, FetchError> {
        self.advance(id)
    }

    async fn fetch_transactions_for_asset(
        &self,
        _auth: &AuthToken,
        asset: &AssetId,
        _since: Option<DateTime<Utc>>,
        _kind: Option<TransactionKind>,
    ) -> Result<Vec<Transaction>, FetchError> {
        ["dep-1", "dep-2"]
            .iter()
            .map(|id| self.advance(&format!("{asset}/{id}")))
            .collect()
    }
}

fn print_event(label: &str, ev: &StatusEvent) {
    match ev {
        StatusEvent::StatusChanged {
            transaction,
            new_status,
            old_status,
        } => println!(
            "[{label}] {} {} -> {}",
            transaction.id,
            old_status.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
            new_status
        ),
        StatusEvent::RecoveryExhausted {
            retry_count,
            last_error,
        } => println!("[{label}] gave up after {retry_count} failures: {last_error:?}"),
        StatusEvent::SessionClosed { reason } => println!("[{label}] closed: {reason:?}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init()?;
    let args: Vec<String> = std::env::args().collect();
    let mut poll_ms = 500u64;
    let mut fail_every = 3u64;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--poll-ms" => {
                i += 1;
                poll_ms = args.get(i).and_then(|v| v.parse().ok()).unwrap_or(poll_ms);
            }
            "--fail-every" => {
                i += 1;
                fail_every = args.get(i).and_then(|v| v.parse().ok()).unwrap_or(fail_every);
            }
            _ => {}
        }
        i += 1;
    }

    let watcher = Watcher::builder()
        .source(SimulatedAnchor {
            fail_every,
            requests: AtomicU64::new(0),
            progress: Mutex::new(HashMap::new()),
        })
        .poll_interval(Duration::from_millis(poll_ms))
        .retry_policy(ExponentialBackoff {
            max_retries: 3,
            initial: Duration::from_millis(poll_ms),
            max: Duration::from_secs(10),
            jitter: Duration::from_millis(100),
        })
        .build()?;

    let auth = AuthToken::new("demo-token");
    let mut single = watcher.watch_one_transaction(&auth, "wd-42")?;
    let mut asset = watcher.watch_asset(&auth, "stellar:USDC", None, None)?;

    let single_task = tokio::spawn({
        let mut events = single.events();
        async move {
            while let Some(ev) = events.recv().await {
                print_event("wd-42", &ev);
            }
        }
    });
    let mut asset_events = asset.events();

    tokio::select! {
        _ = async {
            while let Some(ev) = asset_events.recv().await {
                print_event("stellar:USDC", &ev);
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            watcher.shutdown();
        }
    }
    single.stop();
    single_task.await?;
    Ok(())
}
