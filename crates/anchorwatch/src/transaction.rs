//! Anchor transaction snapshots and status classification.
//!
//! [classify] is the one table both session kinds consult to decide whether a status is
//! terminal; nothing else in the crate matches on status variants for that purpose.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SEP-6 / SEP-24 transaction status as reported by the anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Incomplete,
    PendingUserTransferStart,
    PendingUserTransferComplete,
    PendingExternal,
    PendingAnchor,
    PendingStellar,
    PendingTrust,
    PendingUser,
    PendingCustomerInfoUpdate,
    PendingTransactionInfoUpdate,
    Completed,
    Refunded,
    Expired,
    NoMarket,
    TooSmall,
    TooLarge,
    Error,
    /// A status this crate does not know. Treated as pending.
    #[serde(other)]
    Unknown,
}

impl TransactionStatus {
    /// No further remote transition is expected from this status.
    pub fn is_terminal(self) -> bool {
        classify(self).is_terminal
    }

    /// The transaction ended in failure.
    pub fn is_error(self) -> bool {
        classify(self).is_error
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionStatus::Incomplete => "incomplete",
            TransactionStatus::PendingUserTransferStart => "pending_user_transfer_start",
            TransactionStatus::PendingUserTransferComplete => "pending_user_transfer_complete",
            TransactionStatus::PendingExternal => "pending_external",
            TransactionStatus::PendingAnchor => "pending_anchor",
            TransactionStatus::PendingStellar => "pending_stellar",
            TransactionStatus::PendingTrust => "pending_trust",
            TransactionStatus::PendingUser => "pending_user",
            TransactionStatus::PendingCustomerInfoUpdate => "pending_customer_info_update",
            TransactionStatus::PendingTransactionInfoUpdate => "pending_transaction_info_update",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Refunded => "refunded",
            TransactionStatus::Expired => "expired",
            TransactionStatus::NoMarket => "no_market",
            TransactionStatus::TooSmall => "too_small",
            TransactionStatus::TooLarge => "too_large",
            TransactionStatus::Error => "error",
            TransactionStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived properties of a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusClass {
    pub is_terminal: bool,
    pub is_error: bool,
}

/// Classifies a status. Error statuses are always terminal.
pub fn classify(status: TransactionStatus) -> StatusClass {
    use TransactionStatus::*;
    let is_error = matches!(status, Error | NoMarket | TooSmall | TooLarge);
    let is_terminal = is_error || matches!(status, Completed | Refunded | Expired);
    StatusClass {
        is_terminal,
        is_error,
    }
}

/// Direction of the transfer, used to filter asset listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Deposit => f.write_str("deposit"),
            TransactionKind::Withdrawal => f.write_str("withdrawal"),
        }
    }
}

/// One fetched snapshot of an anchor transaction.
///
/// Deserializes from the anchor's transaction object; fields the watcher does not read are
/// ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    #[serde(default)]
    pub kind: Option<TransactionKind>,
    pub status: TransactionStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Transaction {
    /// Minimal snapshot with only an id and a status.
    pub fn new(id: impl Into<String>, status: TransactionStatus) -> Self {
        Self {
            id: id.into(),
            kind: None,
            status,
            started_at: None,
            completed_at: None,
            message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
