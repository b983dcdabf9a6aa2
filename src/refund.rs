use std::sync::Arc;

use crate::api::explorer::ChainExplorer;
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::keys::parse_hash32;
use crate::swap::{StatusClass, Swap, SwapStatus};
use crate::units::blocks_for_duration;

/// Statuses in which nothing of ours is locked yet, or the coordinator is
/// already settling cooperatively.
const NON_REFUNDABLE: [SwapStatus; 3] = [
    SwapStatus::SwapCreated,
    SwapStatus::InvoiceSet,
    SwapStatus::TransactionClaimPending,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundAvailability {
    Available {
        unlock_height: u32,
    },
    Pending {
        remaining_blocks: u32,
        unlock_height: u32,
    },
    NotEligible,
}

impl RefundAvailability {
    pub fn is_available(&self) -> bool {
        matches!(self, RefundAvailability::Available { .. })
    }
}

pub fn is_eligible_for_refund(swap: &Swap) -> bool {
    let Some(leg) = swap.refund_leg() else {
        return false;
    };
    let common = swap.common();
    if common.claim_tx.is_some() || common.refund_tx.is_some() {
        return false;
    }
    let status = swap.status();
    if status.class() == StatusClass::Success
        || status == SwapStatus::TransactionRefunded
        || NON_REFUNDABLE.contains(&status)
    {
        return false;
    }
    leg.timeout_block_height > 0
}

/// Compares the chain tip against the lockup timeout plus `buffer_blocks`.
pub fn refund_availability(swap: &Swap, tip_height: u32, buffer_blocks: u32) -> RefundAvailability {
    if !is_eligible_for_refund(swap) {
        return RefundAvailability::NotEligible;
    }
    let Some(leg) = swap.refund_leg() else {
        return RefundAvailability::NotEligible;
    };
    let unlock_height = leg.timeout_block_height.saturating_add(buffer_blocks);
    if tip_height >= unlock_height {
        RefundAvailability::Available { unlock_height }
    } else {
        RefundAvailability::Pending {
            remaining_blocks: unlock_height - tip_height,
            unlock_height,
        }
    }
}

pub struct RefundEligibility<E> {
    explorer: Arc<E>,
    config: Arc<BridgeConfig>,
}

impl<E: ChainExplorer> RefundEligibility<E> {
    pub fn new(explorer: Arc<E>, config: Arc<BridgeConfig>) -> Self {
        Self { explorer, config }
    }

    /// Grace window in blocks of the chain `asset` lives on.
    pub fn buffer_blocks(&self, asset: &str) -> Result<u32> {
        let block_time = self.config.asset(asset)?.block_time_secs;
        Ok(blocks_for_duration(self.config.refund_grace_secs, block_time))
    }

    async fn lockup_funded(&self, swap: &Swap) -> Result<bool> {
        let Some(leg) = swap.refund_leg() else {
            return Ok(false);
        };
        let preimage_hash = parse_hash32(&swap.common().preimage_hash, "preimage hash")?;
        let sighting = self
            .explorer
            .find_lockup(&swap.common().asset_send, leg, &preimage_hash)
            .await?;
        Ok(sighting.is_some())
    }

    pub async fn is_available_for_refund(&self, swap: &Swap) -> Result<RefundAvailability> {
        if !is_eligible_for_refund(swap) {
            return Ok(RefundAvailability::NotEligible);
        }
        let asset = swap.common().asset_send.as_str();
        let buffer = self.buffer_blocks(asset)?;
        if !self.lockup_funded(swap).await? {
            tracing::debug!(swap_id = %swap.id(), %asset, "no lockup on chain; nothing to refund");
            return Ok(RefundAvailability::NotEligible);
        }
        let tip = self.explorer.tip_height(asset).await?;
        let availability = refund_availability(swap, tip, buffer);
        tracing::debug!(swap_id = %swap.id(), tip, buffer, ?availability, "refund availability");
        Ok(availability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::{ChainLeg, LegLocking, SubmarineSwap, SwapCommon};

    fn submarine(status: SwapStatus, timeout: u32) -> Swap {
        Swap::Submarine(SubmarineSwap {
            common: SwapCommon {
                id: "sub".into(),
                status,
                asset_send: "BTC".into(),
                asset_receive: "LN".into(),
                send_amount: 50_000,
                receive_amount: 49_500,
                date: 0,
                preimage_hash: "00".repeat(32),
                key_index: 0,
                random_preimage: None,
                claim_tx: None,
                refund_tx: None,
                lockup_tx: None,
                chain_id: None,
            },
            invoice: "lnbc".into(),
            lockup: ChainLeg {
                lockup_address: "bc1p".into(),
                amount: 50_000,
                timeout_block_height: timeout,
                locking: LegLocking::Evm {
                    counterparty: "0x0".into(),
                    token_address: None,
                },
            },
        })
    }

    #[test]
    fn early_and_settled_swaps_are_not_eligible() {
        assert!(!is_eligible_for_refund(&submarine(SwapStatus::SwapCreated, 100)));
        assert!(!is_eligible_for_refund(&submarine(SwapStatus::InvoiceSet, 100)));
        assert!(!is_eligible_for_refund(&submarine(SwapStatus::TransactionClaimed, 100)));
        assert!(!is_eligible_for_refund(&submarine(SwapStatus::TransactionRefunded, 100)));
        assert!(!is_eligible_for_refund(&submarine(SwapStatus::InvoiceFailedToPay, 0)));
        assert!(is_eligible_for_refund(&submarine(SwapStatus::InvoiceFailedToPay, 100)));
        assert!(is_eligible_for_refund(&submarine(SwapStatus::TransactionMempool, 100)));
    }

    #[test]
    fn availability_flips_at_timeout_plus_buffer() {
        let swap = submarine(SwapStatus::SwapExpired, 1_000);
        assert_eq!(
            refund_availability(&swap, 1_000, 1),
            RefundAvailability::Pending {
                remaining_blocks: 1,
                unlock_height: 1_001
            }
        );
        assert!(refund_availability(&swap, 1_001, 1).is_available());
        assert!(refund_availability(&swap, 5_000, 1).is_available());
        assert!(!refund_availability(&swap, 999, 0).is_available());
        assert!(refund_availability(&swap, 1_000, 0).is_available());
    }
}
