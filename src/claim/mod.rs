pub mod musig;
pub mod tree;

use std::str::FromStr as _;
use std::sync::Arc;

use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::{deserialize_hex, serialize_hex};
use bitcoin::hashes::Hash as _;
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sighash::{Prevouts, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Network, OutPoint, ScriptBuf, Sequence, TapSighashType, Transaction, TxIn,
    TxOut, Witness, taproot,
};

use crate::api::{
    ChainClaimRequest, PartialSignature, ReverseClaimRequest, SwapApi, ToSign,
};
use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::keys::{SwapKeys, parse_hash32};
use crate::swap::store::SwapStore;
use crate::swap::{ChainLeg, ChainSwap, ReverseSwap, Swap};
use crate::units::fee_budget;
use musig::{SigningRound, parse_partial_signature, parse_pub_nonce, partial_signature_hex};
use tree::{TaprootSwap, parse_public_key};

/// Coordinator rejections meaning the lockup is gone, as opposed to other
/// refusals that happen to mention "already".
const SPENT_LOCKUP_REASONS: [&str; 3] = ["already claimed", "already spent", "already been claimed"];

fn reports_spent_lockup(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    SPENT_LOCKUP_REASONS
        .iter()
        .any(|reason| message.contains(reason))
}

fn cooperative_error(swap_id: &str, err: Error) -> Error {
    match err {
        Error::Remote { message, .. } if reports_spent_lockup(&message) => {
            Error::AlreadyClaimed(swap_id.to_string())
        }
        Error::Remote { message, .. } => Error::Cooperative {
            swap_id: swap_id.to_string(),
            reason: message,
        },
        other => other,
    }
}

/// An unsigned key-path spend of a swap output to the claim address.
#[derive(Debug, Clone)]
pub struct UnsignedClaim {
    pub tx: Transaction,
    pub prevout: TxOut,
    pub fee: u64,
}

impl UnsignedClaim {
    pub fn sighash(&self) -> Result<Message> {
        let prevouts = [self.prevout.clone()];
        let sighash = SighashCache::new(&self.tx)
            .taproot_key_spend_signature_hash(0, &Prevouts::All(&prevouts), TapSighashType::Default)
            .map_err(|e| Error::Taproot(format!("sighash: {e}")))?;
        Ok(Message::from_digest(sighash.to_byte_array()))
    }
}

/// Finds the output of `lockup` paying `script_pubkey`.
pub fn find_swap_output(lockup: &Transaction, script_pubkey: &ScriptBuf) -> Result<(u32, TxOut)> {
    lockup
        .output
        .iter()
        .enumerate()
        .find(|(_, out)| out.script_pubkey == *script_pubkey)
        .map(|(vout, out)| (vout as u32, out.clone()))
        .ok_or_else(|| Error::LockupOutputNotFound {
            txid: lockup.compute_txid().to_string(),
        })
}

/// Spends the swap output of `lockup` to `destination`, leaving
/// `input - receive_amount` as the miner fee.
pub fn build_claim_transaction(
    lockup: &Transaction,
    swap_output: &ScriptBuf,
    destination: ScriptBuf,
    receive_amount: u64,
) -> Result<UnsignedClaim> {
    let (vout, prevout) = find_swap_output(lockup, swap_output)?;
    let fee = fee_budget(prevout.value.to_sat(), receive_amount)?;

    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(lockup.compute_txid(), vout),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(receive_amount),
            script_pubkey: destination,
        }],
    };
    Ok(UnsignedClaim { tx, prevout, fee })
}

pub struct ClaimEngine<A> {
    api: Arc<A>,
    store: SwapStore,
    config: Arc<BridgeConfig>,
    secp: Secp256k1<All>,
}

impl<A: SwapApi> ClaimEngine<A> {
    pub fn new(api: Arc<A>, store: SwapStore, config: Arc<BridgeConfig>) -> Self {
        Self {
            api,
            store,
            config,
            secp: Secp256k1::new(),
        }
    }

    fn network(&self, asset: &str) -> Result<Network> {
        Ok(self.config.asset(asset)?.network.unwrap_or(Network::Bitcoin))
    }

    fn destination(&self, address: &str, asset: &str) -> Result<ScriptBuf> {
        let network = self.network(asset)?;
        let address = Address::from_str(address)
            .map_err(|e| Error::Config(format!("claim address {address:?}: {e}")))?
            .require_network(network)
            .map_err(|e| Error::Config(format!("claim address: {e}")))?;
        Ok(address.script_pubkey())
    }

    fn taproot_for(&self, swap_id: &str, leg: &ChainLeg, keys: &SwapKeys) -> Result<TaprootSwap> {
        let tree = leg
            .swap_tree()
            .ok_or_else(|| Error::MissingSwapTree(swap_id.to_string()))?;
        let server_key = leg
            .server_public_key()
            .ok_or_else(|| Error::MissingSwapTree(swap_id.to_string()))?;
        let server_key = parse_public_key(server_key, "server")?;
        TaprootSwap::from_swap_tree(&self.secp, tree, server_key, keys.public_key())
    }

    /// Claims the coordinator's lockup of a chain swap. Along the way this
    /// co-signs the coordinator's claim of our own lockup, which is what it
    /// asks for in exchange.
    pub async fn claim_chain_swap(
        &self,
        swap: &ChainSwap,
        keys: &SwapKeys,
        cooperative: bool,
    ) -> Result<Swap> {
        let swap_id = swap.common.id.as_str();
        if swap.common.claim_tx.is_some() {
            return Ok(Swap::Chain(swap.clone()));
        }
        if !cooperative {
            return Err(Error::NonCooperativeUnsupported("claim"));
        }

        let preimage = self.preimage_for(&swap.common.preimage_hash, keys, swap.common.random_preimage.as_deref())?;
        let claim_tree = self.taproot_for(swap_id, &swap.claim_details, keys)?;
        self.check_claim_leaf(swap_id, &claim_tree, keys, &swap.common.preimage_hash)?;

        let transactions = self.api.chain_transactions(swap_id).await?;
        let server_lock = transactions
            .server_lock
            .and_then(|lock| lock.transaction.hex)
            .ok_or_else(|| Error::Cooperative {
                swap_id: swap_id.to_string(),
                reason: "server lockup transaction not available".into(),
            })?;
        let lockup: Transaction = deserialize_hex(&server_lock)
            .map_err(|e| Error::InvalidResponse(format!("server lockup hex: {e}")))?;

        let destination = self.destination(&swap.claim_address, &swap.common.asset_receive)?;
        let mut claim = build_claim_transaction(
            &lockup,
            &claim_tree.script_pubkey(),
            destination,
            swap.common.receive_amount,
        )?;
        let msg = claim.sighash()?;

        let signature = self.sign_coordinator_claim(swap, keys).await?;

        let round = SigningRound::start(&claim_tree.key_agg, &keys.keypair, msg)?;
        let request = ChainClaimRequest {
            preimage: hex::encode(preimage),
            signature,
            to_sign: ToSign {
                pub_nonce: round.pub_nonce_hex(),
                transaction: serialize_hex(&claim.tx),
                index: 0,
            },
        };
        let theirs = self
            .api
            .post_chain_claim(swap_id, &request)
            .await
            .map_err(|e| cooperative_error(swap_id, e))?;

        let server_key = parse_public_key(
            swap.claim_details.server_public_key().unwrap_or_default(),
            "server",
        )?;
        let signature = round
            .sign_and_aggregate(
                &claim_tree.key_agg,
                &keys.keypair,
                server_key,
                parse_pub_nonce(&theirs.pub_nonce)?,
                parse_partial_signature(&theirs.partial_signature)?,
            )
            .map_err(|e| Error::Cooperative {
                swap_id: swap_id.to_string(),
                reason: e.to_string(),
            })?;
        claim.tx.input[0].witness = Witness::p2tr_key_spend(&taproot::Signature {
            signature,
            sighash_type: TapSighashType::Default,
        });

        self.finish(swap_id, &swap.common.asset_receive, &claim).await
    }

    /// Answers the coordinator's request to co-sign its claim of our lockup.
    /// `None` when it has nothing to sign yet.
    async fn sign_coordinator_claim(
        &self,
        swap: &ChainSwap,
        keys: &SwapKeys,
    ) -> Result<Option<PartialSignature>> {
        let swap_id = swap.common.id.as_str();
        let details = match self.api.chain_claim_details(swap_id).await {
            Ok(details) => details,
            Err(Error::Remote { message, .. }) => {
                tracing::warn!(%swap_id, %message, "no coordinator claim to co-sign");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let lockup_tree = self.taproot_for(swap_id, &swap.lockup_details, keys)?;
        let expected = swap.lockup_details.server_public_key().unwrap_or_default();
        if !details.public_key.eq_ignore_ascii_case(expected) {
            return Err(Error::Cooperative {
                swap_id: swap_id.to_string(),
                reason: "claim details signed by an unexpected key".into(),
            });
        }

        let tx_hash = parse_hash32(&details.transaction_hash, "transaction hash")?;
        let msg = Message::from_digest(tx_hash);
        let round = SigningRound::start(&lockup_tree.key_agg, &keys.keypair, msg)?;
        let pub_nonce = round.pub_nonce_hex();
        let partial = round.sign(
            &lockup_tree.key_agg,
            &keys.keypair,
            parse_pub_nonce(&details.pub_nonce)?,
        )?;
        Ok(Some(PartialSignature {
            pub_nonce,
            partial_signature: partial_signature_hex(&partial),
        }))
    }

    /// Claims the coordinator's on-chain lockup of a reverse swap in a
    /// single signing round.
    pub async fn claim_reverse_swap(
        &self,
        swap: &ReverseSwap,
        keys: &SwapKeys,
        cooperative: bool,
    ) -> Result<Swap> {
        let swap_id = swap.common.id.as_str();
        if swap.common.claim_tx.is_some() {
            return Ok(Swap::Reverse(swap.clone()));
        }
        if !cooperative {
            return Err(Error::NonCooperativeUnsupported("claim"));
        }

        let preimage = self.preimage_for(&swap.common.preimage_hash, keys, swap.common.random_preimage.as_deref())?;
        let claim_tree = self.taproot_for(swap_id, &swap.lockup, keys)?;
        self.check_claim_leaf(swap_id, &claim_tree, keys, &swap.common.preimage_hash)?;

        let lockup_hex = self
            .api
            .reverse_transaction(swap_id)
            .await?
            .hex
            .ok_or_else(|| Error::Cooperative {
                swap_id: swap_id.to_string(),
                reason: "lockup transaction not available".into(),
            })?;
        let lockup: Transaction = deserialize_hex(&lockup_hex)
            .map_err(|e| Error::InvalidResponse(format!("lockup hex: {e}")))?;

        let destination = self.destination(&swap.claim_address, &swap.common.asset_receive)?;
        let mut claim = build_claim_transaction(
            &lockup,
            &claim_tree.script_pubkey(),
            destination,
            swap.common.receive_amount,
        )?;
        let msg = claim.sighash()?;

        let round = SigningRound::start(&claim_tree.key_agg, &keys.keypair, msg)?;
        let request = ReverseClaimRequest {
            index: 0,
            transaction: serialize_hex(&claim.tx),
            preimage: hex::encode(preimage),
            pub_nonce: round.pub_nonce_hex(),
        };
        let theirs = self
            .api
            .post_reverse_claim(swap_id, &request)
            .await
            .map_err(|e| cooperative_error(swap_id, e))?;

        let server_key =
            parse_public_key(swap.lockup.server_public_key().unwrap_or_default(), "server")?;
        let signature = round
            .sign_and_aggregate(
                &claim_tree.key_agg,
                &keys.keypair,
                server_key,
                parse_pub_nonce(&theirs.pub_nonce)?,
                parse_partial_signature(&theirs.partial_signature)?,
            )
            .map_err(|e| Error::Cooperative {
                swap_id: swap_id.to_string(),
                reason: e.to_string(),
            })?;
        claim.tx.input[0].witness = Witness::p2tr_key_spend(&taproot::Signature {
            signature,
            sighash_type: TapSighashType::Default,
        });

        self.finish(swap_id, &swap.common.asset_receive, &claim).await
    }

    /// Refunds are only possible through the script path, which this engine
    /// does not build.
    pub async fn refund(&self, _swap: &Swap, _keys: &SwapKeys) -> Result<Swap> {
        Err(Error::NonCooperativeUnsupported("refund"))
    }

    fn preimage_for(
        &self,
        preimage_hash: &str,
        keys: &SwapKeys,
        random_preimage: Option<&str>,
    ) -> Result<[u8; 32]> {
        let expected = parse_hash32(preimage_hash, "preimage hash")?;
        let preimage = match random_preimage {
            Some(stored) => parse_hash32(stored, "stored preimage")?,
            None => keys.preimage,
        };
        crate::keys::verify_preimage(&preimage, &expected)?;
        Ok(preimage)
    }

    fn check_claim_leaf(
        &self,
        swap_id: &str,
        tree: &TaprootSwap,
        keys: &SwapKeys,
        preimage_hash: &str,
    ) -> Result<()> {
        let hash = parse_hash32(preimage_hash, "preimage hash")?;
        if !tree.script.matches_preimage_hash(&hash) {
            return Err(Error::Taproot(format!(
                "swap {swap_id}: claim leaf locks a different preimage hash"
            )));
        }
        if tree.script.claim_key != keys.x_only_public_key() {
            return Err(Error::Taproot(format!(
                "swap {swap_id}: claim leaf pays a different key"
            )));
        }
        Ok(())
    }

    async fn finish(&self, swap_id: &str, asset: &str, claim: &UnsignedClaim) -> Result<Swap> {
        let tx_hex = serialize_hex(&claim.tx);
        let txid = self.api.broadcast(asset, &tx_hex).await?;
        tracing::info!(%swap_id, %txid, fee = claim.fee, "claim broadcast");

        let (swap, ()) = self.store.update(swap_id, |swap| swap.record_claim(txid))?;
        Ok(swap)
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::secp256k1::Keypair;

    use super::tree::SwapScript;
    use super::*;

    #[test]
    fn only_spent_lockup_rejections_map_to_already_claimed() {
        let remote = |message: &str| Error::Remote {
            endpoint: "v2/swap/reverse/claim".into(),
            message: message.into(),
        };
        for message in [
            "swap already claimed",
            "Lockup output Already Spent",
            "swap has already been claimed",
        ] {
            let err = cooperative_error("s", remote(message));
            assert!(matches!(err, Error::AlreadyClaimed(_)), "{message}");
        }
        for message in ["nonce already used", "claim already in progress", "invalid preimage"] {
            let err = cooperative_error("s", remote(message));
            assert!(matches!(err, Error::Cooperative { .. }), "{message}");
        }
        assert!(matches!(
            cooperative_error("s", Error::Musig("nonce".into())),
            Error::Musig(_)
        ));
    }

    #[test]
    fn claim_spends_matching_output_and_keeps_fee_budget() {
        let secp = Secp256k1::new();
        let coordinator = Keypair::from_seckey_slice(&secp, &[1; 32]).unwrap();
        let ours = Keypair::from_seckey_slice(&secp, &[2; 32]).unwrap();
        let script = SwapScript::new(
            &[3; 32],
            ours.x_only_public_key().0,
            coordinator.x_only_public_key().0,
            1_000,
        );
        let swap =
            TaprootSwap::new(&secp, script, coordinator.public_key(), ours.public_key()).unwrap();

        let lockup = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![
                TxOut {
                    value: Amount::from_sat(5_000),
                    script_pubkey: ScriptBuf::new(),
                },
                TxOut {
                    value: Amount::from_sat(100_000),
                    script_pubkey: swap.script_pubkey(),
                },
            ],
        };

        let claim =
            build_claim_transaction(&lockup, &swap.script_pubkey(), ScriptBuf::new(), 99_000)
                .unwrap();
        assert_eq!(claim.fee, 1_000);
        assert_eq!(claim.tx.input[0].previous_output.vout, 1);
        assert_eq!(claim.tx.input[0].sequence, Sequence(0xffff_fffd));
        assert_eq!(claim.tx.output[0].value, Amount::from_sat(99_000));
        claim.sighash().unwrap();

        assert!(matches!(
            build_claim_transaction(&lockup, &swap.script_pubkey(), ScriptBuf::new(), 100_001),
            Err(Error::InsufficientFunds { .. })
        ));
        assert!(matches!(
            build_claim_transaction(&lockup, &ScriptBuf::new_op_return([0u8; 4]), ScriptBuf::new(), 1),
            Err(Error::LockupOutputNotFound { .. })
        ));
    }
}
