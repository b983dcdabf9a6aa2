use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SwapStatus {
    SwapCreated,
    SwapExpired,
    SwapWaitingForRefund,
    InvoiceSet,
    InvoicePending,
    InvoicePaid,
    InvoiceSettled,
    InvoiceExpired,
    InvoiceFailedToPay,
    MinerFeePaid,
    TransactionMempool,
    TransactionConfirmed,
    TransactionServerMempool,
    TransactionServerConfirmed,
    TransactionClaimPending,
    TransactionClaimed,
    TransactionFailed,
    TransactionLockupFailed,
    TransactionRefunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Pending,
    Failed,
    Success,
}

const ALL: [SwapStatus; 19] = [
    SwapStatus::SwapCreated,
    SwapStatus::SwapExpired,
    SwapStatus::SwapWaitingForRefund,
    SwapStatus::InvoiceSet,
    SwapStatus::InvoicePending,
    SwapStatus::InvoicePaid,
    SwapStatus::InvoiceSettled,
    SwapStatus::InvoiceExpired,
    SwapStatus::InvoiceFailedToPay,
    SwapStatus::MinerFeePaid,
    SwapStatus::TransactionMempool,
    SwapStatus::TransactionConfirmed,
    SwapStatus::TransactionServerMempool,
    SwapStatus::TransactionServerConfirmed,
    SwapStatus::TransactionClaimPending,
    SwapStatus::TransactionClaimed,
    SwapStatus::TransactionFailed,
    SwapStatus::TransactionLockupFailed,
    SwapStatus::TransactionRefunded,
];

/// For every target, the statuses that count as having passed it. Statuses
/// arrive out of nominal order (a late poll may jump from `swap.created`
/// straight to `transaction.claimed`), so this is a table and not a rank.
const PASSED: &[(SwapStatus, &[SwapStatus])] = {
    use SwapStatus::*;
    &[
        (
            InvoiceSet,
            &[
                InvoicePending,
                InvoicePaid,
                InvoiceSettled,
                TransactionMempool,
                TransactionConfirmed,
                TransactionClaimPending,
                TransactionClaimed,
            ],
        ),
        (
            MinerFeePaid,
            &[
                TransactionMempool,
                TransactionConfirmed,
                InvoiceSettled,
                TransactionClaimed,
            ],
        ),
        (
            TransactionMempool,
            &[
                TransactionConfirmed,
                TransactionServerMempool,
                TransactionServerConfirmed,
                InvoicePending,
                InvoicePaid,
                InvoiceSettled,
                TransactionClaimPending,
                TransactionClaimed,
            ],
        ),
        (
            TransactionConfirmed,
            &[
                TransactionServerMempool,
                TransactionServerConfirmed,
                InvoicePending,
                InvoicePaid,
                InvoiceSettled,
                TransactionClaimPending,
                TransactionClaimed,
            ],
        ),
        (
            TransactionServerMempool,
            &[
                TransactionServerConfirmed,
                TransactionClaimPending,
                TransactionClaimed,
            ],
        ),
        (
            TransactionServerConfirmed,
            &[TransactionClaimPending, TransactionClaimed],
        ),
        (
            InvoicePending,
            &[InvoicePaid, TransactionClaimPending, TransactionClaimed],
        ),
        (InvoicePaid, &[TransactionClaimPending, TransactionClaimed]),
        (TransactionClaimPending, &[TransactionClaimed]),
        (SwapWaitingForRefund, &[TransactionRefunded]),
        (TransactionLockupFailed, &[TransactionRefunded]),
        (InvoiceFailedToPay, &[TransactionRefunded]),
    ]
};

impl SwapStatus {
    pub fn all() -> &'static [SwapStatus] {
        &ALL
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SwapStatus::SwapCreated => "swap.created",
            SwapStatus::SwapExpired => "swap.expired",
            SwapStatus::SwapWaitingForRefund => "swap.waitingForRefund",
            SwapStatus::InvoiceSet => "invoice.set",
            SwapStatus::InvoicePending => "invoice.pending",
            SwapStatus::InvoicePaid => "invoice.paid",
            SwapStatus::InvoiceSettled => "invoice.settled",
            SwapStatus::InvoiceExpired => "invoice.expired",
            SwapStatus::InvoiceFailedToPay => "invoice.failedToPay",
            SwapStatus::MinerFeePaid => "minerfee.paid",
            SwapStatus::TransactionMempool => "transaction.mempool",
            SwapStatus::TransactionConfirmed => "transaction.confirmed",
            SwapStatus::TransactionServerMempool => "transaction.server.mempool",
            SwapStatus::TransactionServerConfirmed => "transaction.server.confirmed",
            SwapStatus::TransactionClaimPending => "transaction.claim.pending",
            SwapStatus::TransactionClaimed => "transaction.claimed",
            SwapStatus::TransactionFailed => "transaction.failed",
            SwapStatus::TransactionLockupFailed => "transaction.lockupFailed",
            SwapStatus::TransactionRefunded => "transaction.refunded",
        }
    }

    pub fn class(self) -> StatusClass {
        use SwapStatus::*;
        match self {
            InvoiceSettled | TransactionClaimed => StatusClass::Success,
            SwapExpired
            | SwapWaitingForRefund
            | InvoiceExpired
            | InvoiceFailedToPay
            | TransactionFailed
            | TransactionLockupFailed
            | TransactionRefunded => StatusClass::Failed,
            SwapCreated
            | InvoiceSet
            | InvoicePending
            | InvoicePaid
            | MinerFeePaid
            | TransactionMempool
            | TransactionConfirmed
            | TransactionServerMempool
            | TransactionServerConfirmed
            | TransactionClaimPending => StatusClass::Pending,
        }
    }

    pub fn is_pending(self) -> bool {
        self.class() == StatusClass::Pending
    }

    pub fn is_terminal(self) -> bool {
        !self.is_pending()
    }

    /// Whether a swap currently in `self` has reached or passed `target`.
    pub fn has_reached(self, target: SwapStatus) -> bool {
        if self == target || target == SwapStatus::SwapCreated {
            return true;
        }
        PASSED
            .iter()
            .find(|(t, _)| *t == target)
            .is_some_and(|(_, passed)| passed.contains(&self))
    }

    /// False once a swap sits in a terminal status from which `target` is
    /// unreachable.
    pub fn can_reach(self, target: SwapStatus) -> bool {
        if self.has_reached(target) {
            return true;
        }
        match self.class() {
            StatusClass::Pending => true,
            StatusClass::Success => false,
            StatusClass::Failed => {
                target.class() == StatusClass::Failed && self != SwapStatus::TransactionRefunded
            }
        }
    }

    /// Position among terminal statuses of the same class. A higher rank
    /// is further along; `transaction.refunded` and `transaction.claimed`
    /// end their class.
    fn terminal_rank(self) -> u8 {
        use SwapStatus::*;
        match self {
            SwapExpired => 1,
            InvoiceExpired => 2,
            TransactionLockupFailed => 3,
            InvoiceFailedToPay => 4,
            TransactionFailed => 5,
            SwapWaitingForRefund => 6,
            TransactionRefunded => 7,
            InvoiceSettled => 1,
            TransactionClaimed => 2,
            _ => 0,
        }
    }

    /// Reconciles a stored status with one reported by either channel.
    /// Returns the new status, or `None` when the store must not change.
    ///
    /// The result only ever moves forward: a pending status gives way to any
    /// status that has not already been passed, a terminal one never returns
    /// to pending nor crosses between failure and success, and within a class
    /// only a higher terminal rank replaces it.
    pub fn merge(stored: SwapStatus, incoming: SwapStatus) -> Option<SwapStatus> {
        if stored == incoming {
            return None;
        }
        let advances = match (stored.class(), incoming.class()) {
            (StatusClass::Pending, StatusClass::Pending) => !stored.has_reached(incoming),
            (StatusClass::Pending, _) => true,
            (_, StatusClass::Pending) => false,
            (StatusClass::Failed, StatusClass::Success)
            | (StatusClass::Success, StatusClass::Failed) => false,
            _ => incoming.terminal_rank() > stored.terminal_rank(),
        };
        advances.then_some(incoming)
    }
}

impl fmt::Display for SwapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SwapStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL.iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown swap status: {s}"))
    }
}

impl TryFrom<String> for SwapStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SwapStatus> for String {
    fn from(value: SwapStatus) -> Self {
        value.as_str().to_string()
    }
}
