pub mod status;
pub mod store;

use serde::{Deserialize, Serialize};

pub use status::{StatusClass, SwapStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapType {
    Submarine,
    Reverse,
    Chain,
}

impl SwapType {
    pub fn as_str(self) -> &'static str {
        match self {
            SwapType::Submarine => "submarine",
            SwapType::Reverse => "reverse",
            SwapType::Chain => "chain",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeLeaf {
    pub version: u8,
    pub output: String,
}

/// Taproot script tree as served by the coordinator: one claim leaf and one
/// refund leaf, both at depth 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapTree {
    pub claim_leaf: TreeLeaf,
    pub refund_leaf: TreeLeaf,
}

/// How one side of a swap is locked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LegLocking {
    /// Taproot output spendable by MuSig2(coordinator, us) or the tree leaves.
    Utxo {
        server_public_key: String,
        swap_tree: SwapTree,
    },
    /// HTLC entry in an EtherSwap/ERC20Swap contract. `counterparty` is the
    /// coordinator's claim address on our lockup, its refund address on its own.
    Evm {
        counterparty: String,
        token_address: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLeg {
    pub lockup_address: String,
    pub amount: u64,
    pub timeout_block_height: u32,
    pub locking: LegLocking,
}

impl ChainLeg {
    pub fn swap_tree(&self) -> Option<&SwapTree> {
        match &self.locking {
            LegLocking::Utxo { swap_tree, .. } => Some(swap_tree),
            LegLocking::Evm { .. } => None,
        }
    }

    pub fn server_public_key(&self) -> Option<&str> {
        match &self.locking {
            LegLocking::Utxo {
                server_public_key, ..
            } => Some(server_public_key),
            LegLocking::Evm { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapCommon {
    pub id: String,
    pub status: SwapStatus,
    pub asset_send: String,
    pub asset_receive: String,
    pub send_amount: u64,
    pub receive_amount: u64,
    /// Unix seconds.
    pub date: i64,
    pub preimage_hash: String,
    pub key_index: u32,
    /// Only set when the preimage came from the OS RNG and therefore cannot
    /// be re-derived from the key store.
    pub random_preimage: Option<String>,
    pub claim_tx: Option<String>,
    pub refund_tx: Option<String>,
    pub lockup_tx: Option<String>,
    pub chain_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmarineSwap {
    pub common: SwapCommon,
    pub invoice: String,
    /// Our lockup, refundable after its timeout.
    pub lockup: ChainLeg,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseSwap {
    pub common: SwapCommon,
    pub invoice: String,
    pub claim_address: String,
    /// The coordinator's lockup that we claim.
    pub lockup: ChainLeg,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSwap {
    pub common: SwapCommon,
    pub claim_address: String,
    /// The coordinator's lockup on the destination chain.
    pub claim_details: ChainLeg,
    /// Our lockup on the origin chain.
    pub lockup_details: ChainLeg,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Swap {
    Submarine(SubmarineSwap),
    Reverse(ReverseSwap),
    Chain(ChainSwap),
}

impl Swap {
    pub fn common(&self) -> &SwapCommon {
        match self {
            Swap::Submarine(s) => &s.common,
            Swap::Reverse(s) => &s.common,
            Swap::Chain(s) => &s.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut SwapCommon {
        match self {
            Swap::Submarine(s) => &mut s.common,
            Swap::Reverse(s) => &mut s.common,
            Swap::Chain(s) => &mut s.common,
        }
    }

    pub fn id(&self) -> &str {
        &self.common().id
    }

    pub fn status(&self) -> SwapStatus {
        self.common().status
    }

    pub fn swap_type(&self) -> SwapType {
        match self {
            Swap::Submarine(_) => SwapType::Submarine,
            Swap::Reverse(_) => SwapType::Reverse,
            Swap::Chain(_) => SwapType::Chain,
        }
    }

    /// The leg we locked funds into, if any.
    pub fn refund_leg(&self) -> Option<&ChainLeg> {
        match self {
            Swap::Submarine(s) => Some(&s.lockup),
            Swap::Chain(s) => Some(&s.lockup_details),
            Swap::Reverse(_) => None,
        }
    }

    /// The leg the coordinator locks and we claim, if any.
    pub fn claim_leg(&self) -> Option<&ChainLeg> {
        match self {
            Swap::Reverse(s) => Some(&s.lockup),
            Swap::Chain(s) => Some(&s.claim_details),
            Swap::Submarine(_) => None,
        }
    }

    pub fn claim_address(&self) -> Option<&str> {
        match self {
            Swap::Reverse(s) => Some(&s.claim_address),
            Swap::Chain(s) => Some(&s.claim_address),
            Swap::Submarine(_) => None,
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.common().claim_tx.is_some() || self.status() == SwapStatus::TransactionClaimed
    }

    /// Applies a status reported by the coordinator. Returns whether the
    /// stored status changed.
    pub fn apply_status(&mut self, incoming: SwapStatus) -> bool {
        match SwapStatus::merge(self.status(), incoming) {
            Some(next) => {
                self.common_mut().status = next;
                true
            }
            None => false,
        }
    }

    /// Records our claim transaction together with the claimed status.
    pub fn record_claim(&mut self, claim_tx: String) {
        let common = self.common_mut();
        common.claim_tx = Some(claim_tx);
        common.status = SwapStatus::TransactionClaimed;
    }

    pub fn record_refund(&mut self, refund_tx: String) {
        let common = self.common_mut();
        common.refund_tx = Some(refund_tx);
        common.status = SwapStatus::TransactionRefunded;
    }
}
