pub mod explorer;
pub mod http;
pub mod ws;

use std::collections::BTreeMap;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::swap::{ChainLeg, LegLocking, SwapStatus, SwapTree};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairLimits {
    pub minimal: u64,
    pub maximal: u64,
    #[serde(default)]
    pub maximal_zero_conf: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMinerFees {
    pub claim: u64,
    pub lockup: u64,
}

/// The three market types report miner fees in different shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MinerFees {
    Flat(u64),
    Reverse { lockup: u64, claim: u64 },
    Chain { server: u64, user: UserMinerFees },
}

impl MinerFees {
    /// Miner fees deducted from what the user receives.
    pub fn deducted(&self) -> u64 {
        match *self {
            MinerFees::Flat(fee) => fee,
            MinerFees::Reverse { lockup, claim } => lockup + claim,
            MinerFees::Chain { server, user } => server + user.claim,
        }
    }

    /// The part paid by the coordinator's lockup transaction.
    pub fn server_lockup(&self) -> u64 {
        match *self {
            MinerFees::Flat(fee) => fee,
            MinerFees::Reverse { lockup, .. } => lockup,
            MinerFees::Chain { server, .. } => server,
        }
    }

    /// The part paid by our own claim transaction.
    pub fn claim(&self) -> u64 {
        match *self {
            MinerFees::Flat(_) => 0,
            MinerFees::Reverse { claim, .. } => claim,
            MinerFees::Chain { user, .. } => user.claim,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairFees {
    pub percentage: f64,
    pub miner_fees: MinerFees,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairInfo {
    pub hash: String,
    pub rate: f64,
    pub limits: PairLimits,
    pub fees: PairFees,
}

impl PairInfo {
    pub fn check_amount(&self, amount: u64) -> Result<()> {
        if amount < self.limits.minimal || amount > self.limits.maximal {
            return Err(Error::Config(format!(
                "amount {amount} outside pair limits [{}, {}]",
                self.limits.minimal, self.limits.maximal
            )));
        }
        Ok(())
    }
}

/// `from -> to -> pair`.
pub type PairTable = BTreeMap<String, BTreeMap<String, PairInfo>>;

pub fn lookup_pair<'a>(table: &'a PairTable, from: &str, to: &str) -> Result<&'a PairInfo> {
    table
        .get(from)
        .and_then(|targets| targets.get(to))
        .ok_or_else(|| Error::PairNotFound {
            from: from.to_string(),
            to: to.to_string(),
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Market {
    Submarine,
    Reverse,
    Chain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubmarineRequest {
    pub from: String,
    pub to: String,
    pub invoice: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_public_key: Option<String>,
    pub pair_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubmarineResponse {
    pub id: String,
    pub address: String,
    pub expected_amount: u64,
    pub timeout_block_height: u32,
    #[serde(default)]
    pub accept_zero_conf: Option<bool>,
    #[serde(default)]
    pub swap_tree: Option<SwapTree>,
    #[serde(default)]
    pub claim_public_key: Option<String>,
    #[serde(default)]
    pub claim_address: Option<String>,
}

impl CreateSubmarineResponse {
    pub fn lockup_leg(&self) -> Result<ChainLeg> {
        LegDetails {
            lockup_address: self.address.clone(),
            amount: self.expected_amount,
            timeout_block_height: self.timeout_block_height,
            server_public_key: self.claim_public_key.clone(),
            swap_tree: self.swap_tree.clone(),
            claim_address: self.claim_address.clone(),
            refund_address: None,
            token_address: None,
        }
        .into_leg("submarine lockup")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReverseRequest {
    pub from: String,
    pub to: String,
    pub preimage_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_address: Option<String>,
    pub invoice_amount: u64,
    pub pair_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReverseResponse {
    pub id: String,
    pub invoice: String,
    pub lockup_address: String,
    pub onchain_amount: u64,
    pub timeout_block_height: u32,
    #[serde(default)]
    pub swap_tree: Option<SwapTree>,
    #[serde(default)]
    pub refund_public_key: Option<String>,
    #[serde(default)]
    pub refund_address: Option<String>,
}

impl CreateReverseResponse {
    pub fn lockup_leg(&self) -> Result<ChainLeg> {
        LegDetails {
            lockup_address: self.lockup_address.clone(),
            amount: self.onchain_amount,
            timeout_block_height: self.timeout_block_height,
            server_public_key: self.refund_public_key.clone(),
            swap_tree: self.swap_tree.clone(),
            claim_address: None,
            refund_address: self.refund_address.clone(),
            token_address: None,
        }
        .into_leg("reverse lockup")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChainRequest {
    pub from: String,
    pub to: String,
    pub preimage_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_address: Option<String>,
    pub user_lock_amount: u64,
    pub pair_hash: String,
}

/// One side of a swap as the coordinator describes it. UTXO legs carry a
/// server key and a swap tree, EVM legs the counterparty's address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegDetails {
    pub lockup_address: String,
    pub amount: u64,
    pub timeout_block_height: u32,
    #[serde(default)]
    pub server_public_key: Option<String>,
    #[serde(default)]
    pub swap_tree: Option<SwapTree>,
    #[serde(default)]
    pub claim_address: Option<String>,
    #[serde(default)]
    pub refund_address: Option<String>,
    #[serde(default)]
    pub token_address: Option<String>,
}

impl LegDetails {
    pub fn into_leg(self, what: &str) -> Result<ChainLeg> {
        let locking = match (self.server_public_key, self.swap_tree) {
            (Some(server_public_key), Some(swap_tree)) => LegLocking::Utxo {
                server_public_key,
                swap_tree,
            },
            (None, None) => {
                let counterparty = self
                    .claim_address
                    .or(self.refund_address)
                    .ok_or_else(|| {
                        Error::InvalidResponse(format!(
                            "{what}: neither swap tree nor counterparty address"
                        ))
                    })?;
                LegLocking::Evm {
                    counterparty,
                    token_address: self.token_address,
                }
            }
            _ => {
                return Err(Error::InvalidResponse(format!(
                    "{what}: server key and swap tree must come together"
                )));
            }
        };
        Ok(ChainLeg {
            lockup_address: self.lockup_address,
            amount: self.amount,
            timeout_block_height: self.timeout_block_height,
            locking,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChainResponse {
    pub id: String,
    pub claim_details: LegDetails,
    pub lockup_details: LegDetails,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInfo {
    pub id: String,
    #[serde(default)]
    pub hex: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapStatusResponse {
    pub status: String,
    #[serde(default)]
    pub zero_conf_rejected: Option<bool>,
    #[serde(default)]
    pub transaction: Option<TransactionInfo>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl SwapStatusResponse {
    pub fn parsed_status(&self) -> Result<SwapStatus> {
        self.status
            .parse()
            .map_err(|e: String| Error::InvalidResponse(e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockTimeout {
    pub block_height: u32,
    #[serde(default)]
    pub eta: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockTransaction {
    pub transaction: TransactionInfo,
    #[serde(default)]
    pub timeout: Option<LockTimeout>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSwapTransactions {
    #[serde(default)]
    pub user_lock: Option<LockTransaction>,
    #[serde(default)]
    pub server_lock: Option<LockTransaction>,
}

/// The coordinator's request for our signature on its claim of our lockup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerClaimDetails {
    pub pub_nonce: String,
    pub public_key: String,
    pub transaction_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialSignature {
    pub pub_nonce: String,
    pub partial_signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToSign {
    pub pub_nonce: String,
    pub transaction: String,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainClaimRequest {
    pub preimage: String,
    /// Our signature on the coordinator's claim of our lockup. Omitted when
    /// the coordinator has not asked for one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<PartialSignature>,
    pub to_sign: ToSign,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReverseClaimRequest {
    pub index: u32,
    pub transaction: String,
    pub preimage: String,
    pub pub_nonce: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub id: String,
    pub status: SwapStatus,
}

/// The bridge coordinator, seen through the operations the engine needs.
pub trait SwapApi: Send + Sync + 'static {
    fn pairs(&self, market: Market) -> impl Future<Output = Result<PairTable>> + Send;

    fn create_submarine_swap(
        &self,
        req: &CreateSubmarineRequest,
    ) -> impl Future<Output = Result<CreateSubmarineResponse>> + Send;

    fn create_reverse_swap(
        &self,
        req: &CreateReverseRequest,
    ) -> impl Future<Output = Result<CreateReverseResponse>> + Send;

    fn create_chain_swap(
        &self,
        req: &CreateChainRequest,
    ) -> impl Future<Output = Result<CreateChainResponse>> + Send;

    fn swap_status(&self, id: &str) -> impl Future<Output = Result<SwapStatusResponse>> + Send;

    fn reverse_transaction(&self, id: &str)
    -> impl Future<Output = Result<TransactionInfo>> + Send;

    fn chain_transactions(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<ChainSwapTransactions>> + Send;

    fn chain_claim_details(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<ServerClaimDetails>> + Send;

    fn post_chain_claim(
        &self,
        id: &str,
        req: &ChainClaimRequest,
    ) -> impl Future<Output = Result<PartialSignature>> + Send;

    fn post_reverse_claim(
        &self,
        id: &str,
        req: &ReverseClaimRequest,
    ) -> impl Future<Output = Result<PartialSignature>> + Send;

    /// Broadcasts a raw transaction on `currency`'s chain, returning its id.
    fn broadcast(
        &self,
        currency: &str,
        tx_hex: &str,
    ) -> impl Future<Output = Result<String>> + Send;
}
