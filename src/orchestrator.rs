use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{B256, TxHash};

use crate::api::explorer::{ChainExplorer, HttpExplorer};
use crate::api::{
    CreateChainRequest, CreateReverseRequest, CreateSubmarineRequest, Market, PairInfo, SwapApi,
    lookup_pair,
};
use crate::claim::ClaimEngine;
use crate::claim::tree::SwapScript;
use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::evm::{EvmHtlc, EvmLockClaimEngine, EvmSigner};
use crate::invoice::{amount_sats_from_bolt11, ensure_payment_hash, payment_hash_from_bolt11};
use crate::keys::{KeyStore as _, SwapKeys, derive_keys, generate_keys, parse_hash32};
use crate::retry::{RetryPolicy, retry};
use crate::units::receive_amount;
use crate::swap::store::SwapStore;
use crate::swap::{
    ChainLeg, ChainSwap, LegLocking, ReverseSwap, SubmarineSwap, Swap, SwapCommon, SwapStatus,
};
use crate::sync::{StatusSync, unix_now};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmarineParams {
    /// On-chain asset we lock.
    pub from: String,
    /// Lightning asset the invoice is paid in.
    pub to: String,
    pub invoice: String,
    pub chain_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseParams {
    pub from: String,
    pub to: String,
    pub invoice_amount: u64,
    pub claim_address: String,
    pub chain_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainParams {
    pub from: String,
    pub to: String,
    pub claim_address: String,
    pub user_lock_amount: u64,
    pub chain_id: Option<u64>,
}

/// Creates swaps against the coordinator, persists them, and drives the
/// claim once the coordinator has locked its side.
pub struct SwapOrchestrator<A, S, E = HttpExplorer> {
    api: Arc<A>,
    store: SwapStore,
    config: Arc<BridgeConfig>,
    sync: StatusSync<A>,
    claims: ClaimEngine<A>,
    evm: Option<EvmLockClaimEngine<S>>,
    explorer: Option<Arc<E>>,
}

impl<A: SwapApi, S: EvmSigner> SwapOrchestrator<A, S> {
    pub fn new(api: Arc<A>, store: SwapStore, config: BridgeConfig) -> Self {
        let config = Arc::new(config);
        let sync = StatusSync::new(api.clone(), store.clone(), config.sync);
        let claims = ClaimEngine::new(api.clone(), store.clone(), config.clone());
        Self {
            api,
            store,
            config,
            sync,
            claims,
            evm: None,
            explorer: None,
        }
    }
}

impl<A: SwapApi, S: EvmSigner, E: ChainExplorer> SwapOrchestrator<A, S, E> {
    /// Lets `auto_claim` act on a lockup the explorer sees before the
    /// coordinator reports it.
    pub fn with_explorer<X: ChainExplorer>(self, explorer: Arc<X>) -> SwapOrchestrator<A, S, X> {
        SwapOrchestrator {
            api: self.api,
            store: self.store,
            config: self.config,
            sync: self.sync,
            claims: self.claims,
            evm: self.evm,
            explorer: Some(explorer),
        }
    }

    /// Enables locking and claiming on EVM legs.
    pub fn with_evm(mut self, engine: EvmLockClaimEngine<S>) -> Self {
        self.evm = Some(engine);
        self
    }

    pub fn store(&self) -> &SwapStore {
        &self.store
    }

    pub fn sync(&self) -> &StatusSync<A> {
        &self.sync
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn evm(&self) -> Result<&EvmLockClaimEngine<S>> {
        self.evm
            .as_ref()
            .ok_or_else(|| Error::Config("no EVM signer configured".into()))
    }

    async fn pair(&self, market: Market, from: &str, to: &str) -> Result<PairInfo> {
        let policy = RetryPolicy::default().with_deadline(Duration::from_secs(10));
        let table = retry("fetch pairs", policy, || self.api.pairs(market)).await?;
        lookup_pair(&table, from, to).cloned()
    }

    /// Re-derives the keys a stored swap was created with.
    pub fn keys_for(&self, swap: &Swap) -> Result<SwapKeys> {
        let mnemonic = self
            .store
            .mnemonic()?
            .ok_or_else(|| Error::KeyDerivation("no mnemonic in the key store".into()))?;
        derive_keys(&mnemonic, swap.common().key_index)
    }

    fn common(
        &self,
        id: String,
        status: SwapStatus,
        from: &str,
        to: &str,
        keys: &SwapKeys,
        chain_id: Option<u64>,
    ) -> SwapCommon {
        SwapCommon {
            id,
            status,
            asset_send: from.to_string(),
            asset_receive: to.to_string(),
            send_amount: 0,
            receive_amount: 0,
            date: unix_now(),
            preimage_hash: keys.preimage_hash_hex(),
            key_index: keys.index,
            random_preimage: None,
            claim_tx: None,
            refund_tx: None,
            lockup_tx: None,
            chain_id,
        }
    }

    /// Pays a Lightning invoice with an on-chain lockup. The swap is stored
    /// as `invoice.set` and tracked; the call returns once the coordinator
    /// itself reports that status or fails with a timeout.
    pub async fn create_submarine_swap(&self, params: SubmarineParams) -> Result<Swap> {
        let pair = self.pair(Market::Submarine, &params.from, &params.to).await?;
        let invoice_amount = amount_sats_from_bolt11(&params.invoice)?;
        if let Some(amount) = invoice_amount {
            pair.check_amount(amount)?;
        }
        let preimage_hash = payment_hash_from_bolt11(&params.invoice)?;

        let keys = generate_keys(&self.store, None, None)?;
        let from_asset = self.config.asset(&params.from)?;
        let request = CreateSubmarineRequest {
            from: params.from.clone(),
            to: params.to.clone(),
            invoice: params.invoice.clone(),
            refund_public_key: (!from_asset.is_evm()).then(|| keys.public_key_hex()),
            pair_hash: pair.hash.clone(),
        };
        let response = self.api.create_submarine_swap(&request).await?;
        let lockup = response.lockup_leg()?;
        check_lockup_tree(&response.id, &lockup, &keys, &preimage_hash)?;

        let mut common = self.common(
            response.id.clone(),
            SwapStatus::InvoiceSet,
            &params.from,
            &params.to,
            &keys,
            params.chain_id,
        );
        common.preimage_hash = hex::encode(preimage_hash);
        common.send_amount = response.expected_amount;
        common.receive_amount = invoice_amount.unwrap_or_default();

        let swap = Swap::Submarine(SubmarineSwap {
            common,
            invoice: params.invoice,
            lockup,
        });
        self.persist_and_wait(swap, SwapStatus::InvoiceSet).await
    }

    /// Receives on-chain funds for paying the coordinator's invoice. The
    /// invoice must commit to our preimage hash.
    pub async fn create_reverse_swap(&self, params: ReverseParams) -> Result<Swap> {
        let pair = self.pair(Market::Reverse, &params.from, &params.to).await?;
        pair.check_amount(params.invoice_amount)?;

        let keys = generate_keys(&self.store, None, None)?;
        let to_asset = self.config.asset(&params.to)?;
        let request = CreateReverseRequest {
            from: params.from.clone(),
            to: params.to.clone(),
            preimage_hash: keys.preimage_hash_hex(),
            claim_public_key: (!to_asset.is_evm()).then(|| keys.public_key_hex()),
            claim_address: to_asset.is_evm().then(|| params.claim_address.clone()),
            invoice_amount: params.invoice_amount,
            pair_hash: pair.hash.clone(),
        };
        let response = self.api.create_reverse_swap(&request).await?;
        ensure_payment_hash(&response.invoice, &keys.preimage_hash)?;
        let lockup = response.lockup_leg()?;
        check_claim_tree(&response.id, &lockup, &keys, &keys.preimage_hash)?;

        let mut common = self.common(
            response.id.clone(),
            SwapStatus::SwapCreated,
            &params.from,
            &params.to,
            &keys,
            params.chain_id,
        );
        check_quote(&response.id, &pair, params.invoice_amount, lockup.amount)?;
        common.send_amount = params.invoice_amount;
        common.receive_amount = claimable(&lockup, &pair)?;

        let swap = Swap::Reverse(ReverseSwap {
            common,
            invoice: response.invoice,
            claim_address: params.claim_address,
            lockup,
        });
        self.persist_and_wait(swap, SwapStatus::SwapCreated).await
    }

    /// Moves funds between two chains. Swaps out of the claim-authority
    /// asset use a random preimage, kept with the record.
    pub async fn create_chain_swap(&self, params: ChainParams) -> Result<Swap> {
        let pair = self.pair(Market::Chain, &params.from, &params.to).await?;
        pair.check_amount(params.user_lock_amount)?;

        let random = params.from == self.config.claim_authority_asset;
        let mut keys = generate_keys(&self.store, None, None)?;
        if random {
            keys = keys.with_random_preimage();
        }
        let from_asset = self.config.asset(&params.from)?;
        let to_asset = self.config.asset(&params.to)?;
        let request = CreateChainRequest {
            from: params.from.clone(),
            to: params.to.clone(),
            preimage_hash: keys.preimage_hash_hex(),
            claim_public_key: (!to_asset.is_evm()).then(|| keys.public_key_hex()),
            refund_public_key: (!from_asset.is_evm()).then(|| keys.public_key_hex()),
            claim_address: to_asset.is_evm().then(|| params.claim_address.clone()),
            user_lock_amount: params.user_lock_amount,
            pair_hash: pair.hash.clone(),
        };
        let response = self.api.create_chain_swap(&request).await?;
        let claim_details = response.claim_details.into_leg("chain claim")?;
        let lockup_details = response.lockup_details.into_leg("chain lockup")?;
        check_claim_tree(&response.id, &claim_details, &keys, &keys.preimage_hash)?;
        check_lockup_tree(&response.id, &lockup_details, &keys, &keys.preimage_hash)?;

        let mut common = self.common(
            response.id.clone(),
            SwapStatus::SwapCreated,
            &params.from,
            &params.to,
            &keys,
            params.chain_id,
        );
        check_quote(&response.id, &pair, params.user_lock_amount, claim_details.amount)?;
        common.send_amount = lockup_details.amount;
        common.receive_amount = claimable(&claim_details, &pair)?;
        if random {
            common.random_preimage = Some(keys.preimage_hex());
        }

        tracing::info!(
            swap_id = %response.id,
            from = %params.from,
            to = %params.to,
            amount = params.user_lock_amount,
            random_preimage = random,
            "chain swap created"
        );
        let swap = Swap::Chain(ChainSwap {
            common,
            claim_address: params.claim_address,
            claim_details,
            lockup_details,
        });
        self.persist_and_wait(swap, SwapStatus::SwapCreated).await
    }

    async fn persist_and_wait(&self, swap: Swap, target: SwapStatus) -> Result<Swap> {
        let swap_id = swap.id().to_string();
        self.store.insert(&swap)?;
        tracing::info!(
            %swap_id,
            swap_type = swap.swap_type().as_str(),
            status = %swap.status(),
            "swap stored"
        );
        self.sync.track(&swap_id);
        self.sync
            .confirm_swap_state(&swap_id, target, Some(self.config.sync.creation_wait()))
            .await
    }

    /// Locks our side of an EVM-origin swap in the configured contract.
    pub async fn lock_evm(&self, swap_id: &str) -> Result<TxHash> {
        let swap = self.store.require(swap_id)?;
        let leg = swap
            .refund_leg()
            .ok_or_else(|| Error::Unsupported(format!("swap {swap_id} has nothing to lock")))?;
        let asset = self.config.asset(&swap.common().asset_send)?;
        let preimage_hash = parse_hash32(&swap.common().preimage_hash, "preimage hash")?;
        let htlc = EvmHtlc::from_leg(asset, leg, &preimage_hash)?;

        let tx_hash = self.evm()?.lock(&htlc).await?;
        let lockup_tx = tx_hash.to_string();
        self.store.update(swap_id, |swap| {
            swap.common_mut().lockup_tx = Some(lockup_tx);
        })?;
        Ok(tx_hash)
    }

    /// Claims the coordinator's lockup once the status feed or the explorer
    /// has seen it. Claimed swaps come back unchanged.
    pub async fn auto_claim(&self, swap_id: &str) -> Result<Swap> {
        let swap = self.store.require(swap_id)?;
        if swap.is_claimed() {
            tracing::debug!(%swap_id, "already claimed");
            return Ok(swap);
        }
        let locked = match &swap {
            Swap::Chain(_) => SwapStatus::TransactionServerMempool,
            Swap::Reverse(_) => SwapStatus::TransactionMempool,
            Swap::Submarine(_) => {
                return Err(Error::Unsupported(
                    "submarine swaps are claimed by the coordinator".into(),
                ));
            }
        };
        let Some(leg) = swap.claim_leg() else {
            return Err(Error::Unsupported(format!("swap {swap_id} has no claim leg")));
        };
        let status = swap.status();
        let seen = status.has_reached(locked) || self.lockup_seen(&swap, leg).await?;
        if !seen || status.is_terminal() {
            return Err(Error::NotClaimable {
                swap_id: swap_id.to_string(),
                status,
            });
        }

        let keys = self.keys_for(&swap)?;
        if matches!(leg.locking, LegLocking::Evm { .. }) {
            return self.claim_evm(&swap, leg, &keys).await;
        }
        match &swap {
            Swap::Chain(chain) => self.claims.claim_chain_swap(chain, &keys, true).await,
            Swap::Reverse(reverse) => self.claims.claim_reverse_swap(reverse, &keys, true).await,
            Swap::Submarine(_) => Err(Error::Unsupported("submarine claim".into())),
        }
    }

    async fn lockup_seen(&self, swap: &Swap, leg: &ChainLeg) -> Result<bool> {
        let Some(explorer) = &self.explorer else {
            return Ok(false);
        };
        if swap.status().is_terminal() {
            return Ok(false);
        }
        let common = swap.common();
        let preimage_hash = parse_hash32(&common.preimage_hash, "preimage hash")?;
        let Some(sighting) = explorer
            .find_lockup(&common.asset_receive, leg, &preimage_hash)
            .await?
        else {
            return Ok(false);
        };
        tracing::info!(
            swap_id = %common.id,
            status = %common.status,
            tx_id = %sighting.tx_id,
            confirmed = sighting.confirmed,
            "coordinator lockup found on chain"
        );
        Ok(true)
    }

    async fn claim_evm(&self, swap: &Swap, leg: &ChainLeg, keys: &SwapKeys) -> Result<Swap> {
        let common = swap.common();
        let preimage_hash = parse_hash32(&common.preimage_hash, "preimage hash")?;
        let preimage = match &common.random_preimage {
            Some(stored) => parse_hash32(stored, "stored preimage")?,
            None => keys.preimage,
        };
        crate::keys::verify_preimage(&preimage, &preimage_hash)?;

        let asset = self.config.asset(&common.asset_receive)?;
        let htlc = EvmHtlc::from_leg(asset, leg, &preimage_hash)?;
        let tx_hash = self.evm()?.claim(&htlc, B256::from(preimage)).await?;
        tracing::info!(swap_id = %common.id, %tx_hash, "evm claim mined");

        let (swap, ()) = self
            .store
            .update(&common.id, |swap| swap.record_claim(tx_hash.to_string()))?;
        Ok(swap)
    }

    /// Refunds our EVM lockup after its timelock. UTXO refunds need the
    /// script path and are refused.
    pub async fn refund(&self, swap_id: &str) -> Result<Swap> {
        let swap = self.store.require(swap_id)?;
        let leg = swap
            .refund_leg()
            .ok_or_else(|| Error::Unsupported(format!("swap {swap_id} has nothing to refund")))?;
        if !matches!(leg.locking, LegLocking::Evm { .. }) {
            let keys = self.keys_for(&swap)?;
            return self.claims.refund(&swap, &keys).await;
        }
        let asset = self.config.asset(&swap.common().asset_send)?;
        let preimage_hash = parse_hash32(&swap.common().preimage_hash, "preimage hash")?;
        let htlc = EvmHtlc::from_leg(asset, leg, &preimage_hash)?;
        let tx_hash = self.evm()?.refund(&htlc).await?;
        tracing::info!(%swap_id, %tx_hash, "evm refund mined");

        let (swap, ()) = self
            .store
            .update(swap_id, |swap| swap.record_refund(tx_hash.to_string()))?;
        Ok(swap)
    }
}

/// The coordinator must lock at least what the pair's fee schedule quotes
/// for `send_amount`.
fn check_quote(swap_id: &str, pair: &PairInfo, send_amount: u64, locked: u64) -> Result<()> {
    let converted = (send_amount as f64 * pair.rate).floor() as u64;
    let quoted = receive_amount(
        converted,
        pair.fees.percentage,
        pair.fees.miner_fees.server_lockup(),
    )?;
    if locked < quoted {
        return Err(Error::InvalidResponse(format!(
            "swap {swap_id}: coordinator locks {locked}, quote is {quoted}"
        )));
    }
    Ok(())
}

/// What lands at our claim address: the leg amount less our claim fee on
/// UTXO chains. EVM claims pay gas from the signer instead.
fn claimable(leg: &ChainLeg, pair: &PairInfo) -> Result<u64> {
    match leg.locking {
        LegLocking::Evm { .. } => Ok(leg.amount),
        LegLocking::Utxo { .. } => {
            let fee = pair.fees.miner_fees.claim();
            leg.amount.checked_sub(fee).ok_or(Error::InsufficientFunds {
                input_sum: leg.amount,
                receive_amount: fee,
            })
        }
    }
}

fn tree_script(swap_id: &str, leg: &ChainLeg) -> Result<Option<SwapScript>> {
    match leg.swap_tree() {
        Some(tree) => SwapScript::from_swap_tree(tree)
            .map(Some)
            .map_err(|e| Error::InvalidResponse(format!("swap {swap_id}: {e}"))),
        None => Ok(None),
    }
}

/// The coordinator's lockup must be claimable by our key with our preimage.
fn check_claim_tree(
    swap_id: &str,
    leg: &ChainLeg,
    keys: &SwapKeys,
    preimage_hash: &[u8; 32],
) -> Result<()> {
    let Some(script) = tree_script(swap_id, leg)? else {
        return Ok(());
    };
    if script.claim_key != keys.x_only_public_key() || !script.matches_preimage_hash(preimage_hash)
    {
        return Err(Error::InvalidResponse(format!(
            "swap {swap_id}: claim leaf does not pay our key and preimage hash"
        )));
    }
    Ok(())
}

/// Our lockup must be refundable to our key and locked to the same hash.
fn check_lockup_tree(
    swap_id: &str,
    leg: &ChainLeg,
    keys: &SwapKeys,
    preimage_hash: &[u8; 32],
) -> Result<()> {
    let Some(script) = tree_script(swap_id, leg)? else {
        return Ok(());
    };
    if script.refund_key != keys.x_only_public_key() || !script.matches_preimage_hash(preimage_hash)
    {
        return Err(Error::InvalidResponse(format!(
            "swap {swap_id}: refund leaf does not return to our key"
        )));
    }
    if script.timeout_block_height != leg.timeout_block_height {
        return Err(Error::InvalidResponse(format!(
            "swap {swap_id}: refund leaf timeout {} differs from {}",
            script.timeout_block_height, leg.timeout_block_height
        )));
    }
    Ok(())
}
