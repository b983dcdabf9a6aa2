use std::time::Duration;

use crate::swap::SwapStatus;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no pair rate entry for {from} -> {to}")]
    PairNotFound { from: String, to: String },

    #[error("swap not found: {0}")]
    SwapNotFound(String),

    #[error("unknown asset: {0}")]
    UnknownAsset(String),

    #[error("coordinator rejected {endpoint}: {message}")]
    Remote { endpoint: String, message: String },

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid preimage: {0}")]
    InvalidPreimage(String),

    #[error("invalid coordinator response: {0}")]
    InvalidResponse(String),

    #[error("insufficient funds for claim: input sum {input_sum} < receive amount {receive_amount}")]
    InsufficientFunds { input_sum: u64, receive_amount: u64 },

    #[error("swap {0} has no swap tree")]
    MissingSwapTree(String),

    #[error("lockup transaction {txid} has no output paying the swap key")]
    LockupOutputNotFound { txid: String },

    #[error("cooperative signing failed for swap {swap_id}: {reason}")]
    Cooperative { swap_id: String, reason: String },

    #[error("swap {0} was already claimed by the counterparty")]
    AlreadyClaimed(String),

    #[error("swap {swap_id} is not claimable in status {status}")]
    NotClaimable { swap_id: String, status: SwapStatus },

    #[error("non-cooperative script-path {0} is not supported")]
    NonCooperativeUnsupported(&'static str),

    #[error("timed out after {elapsed:?} waiting for swap {swap_id} to reach {target}")]
    Timeout {
        swap_id: String,
        target: SwapStatus,
        elapsed: Duration,
    },

    #[error("swap {swap_id} is in terminal status {status} and cannot reach {target}")]
    TerminalStatus {
        swap_id: String,
        status: SwapStatus,
        target: SwapStatus,
    },

    #[error("a wait for swap {swap_id} targeting {in_flight} is already in flight")]
    WaitInFlight {
        swap_id: String,
        in_flight: SwapStatus,
    },

    #[error("{function} on {contract} failed: {reason}")]
    ChainInteraction {
        contract: String,
        function: &'static str,
        reason: String,
    },

    #[error("gave up on {description} after {attempts} attempts")]
    RetryExhausted {
        description: String,
        attempts: usize,
    },

    #[error("key derivation: {0}")]
    KeyDerivation(String),

    #[error("musig: {0}")]
    Musig(String),

    #[error("taproot: {0}")]
    Taproot(String),

    #[error("invoice: {0}")]
    Invoice(String),

    #[error("storage: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    /// Network and coordinator failures are left to the caller's retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Remote { .. } | Error::Http(_) | Error::WebSocket(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}
