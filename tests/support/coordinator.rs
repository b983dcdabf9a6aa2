use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::{deserialize_hex, serialize_hex};
use bitcoin::hashes::Hash as _;
use bitcoin::secp256k1::{All, Keypair, Message, PublicKey, Secp256k1};
use bitcoin::sighash::{Prevouts, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Network, OutPoint, ScriptBuf, Sequence, TapSighashType, Transaction, TxIn,
    TxOut, Witness,
};

use lds_swap::api::{
    ChainClaimRequest, ChainSwapTransactions, CreateChainRequest, CreateChainResponse,
    CreateReverseRequest, CreateReverseResponse, CreateSubmarineRequest, CreateSubmarineResponse,
    LegDetails, LockTransaction, Market, MinerFees, PairFees, PairInfo, PairLimits, PairTable,
    PartialSignature, ReverseClaimRequest, ServerClaimDetails, SwapApi, SwapStatusResponse,
    TransactionInfo, UserMinerFees,
};
use lds_swap::claim::musig::{
    SigningRound, parse_partial_signature, parse_pub_nonce, partial_signature_hex,
};
use lds_swap::claim::tree::{SwapScript, TaprootSwap};
use lds_swap::invoice::{amount_sats_from_bolt11, payment_hash_from_bolt11};
use lds_swap::keys::{parse_hash32, sha256};
use lds_swap::swap::SwapStatus;
use lds_swap::{Error, Result};

use super::{ETHER_SWAP, SERVER_EVM, invoice};

pub const CHAIN_CLAIM_FEE: u64 = 150;
pub const REVERSE_LOCKUP_FEE: u64 = 300;
pub const SUBMARINE_FEE: u64 = 200;

/// A UTXO leg the coordinator locked and the user claims.
struct ServerLock {
    taproot: TaprootSwap,
    tx: Transaction,
}

#[derive(Default)]
struct MockSwap {
    preimage_hash: [u8; 32],
    user_key: Option<PublicKey>,
    server_lock: Option<ServerLock>,
    /// The user's UTXO lockup the coordinator wants to claim cooperatively.
    user_lock: Option<TaprootSwap>,
    cosign_round: Option<SigningRound>,
    cosigned: bool,
}

#[derive(Default)]
struct State {
    swaps: HashMap<String, MockSwap>,
    statuses: HashMap<String, SwapStatus>,
    status_calls: usize,
    fail_create: Option<String>,
    wrong_invoice: bool,
    broadcasts: Vec<(String, Transaction)>,
    stall_status: bool,
    claim_rejection: Option<String>,
    claim_posts: usize,
    lockup_shortfall: u64,
    quote_shortfall: u64,
    initial_status: Option<SwapStatus>,
}

/// In-process coordinator. It builds real swap trees and lockup
/// transactions and co-signs claims as the second MuSig2 party.
pub struct MockCoordinator {
    secp: Secp256k1<All>,
    server_keys: Keypair,
    state: Mutex<State>,
}

impl Default for MockCoordinator {
    fn default() -> Self {
        let secp = Secp256k1::new();
        let server_keys =
            Keypair::from_seckey_slice(&secp, &[0x51; 32]).expect("valid server key");
        Self {
            secp,
            server_keys,
            state: Mutex::new(State::default()),
        }
    }
}

fn pair(hash: &str, miner_fees: MinerFees) -> PairInfo {
    PairInfo {
        hash: hash.to_string(),
        rate: 1.0,
        limits: PairLimits {
            minimal: 10_000,
            maximal: 10_000_000,
            maximal_zero_conf: None,
        },
        fees: PairFees {
            percentage: 0.1,
            miner_fees,
        },
    }
}

fn table(entries: &[(&str, &str, PairInfo)]) -> PairTable {
    let mut table: PairTable = BTreeMap::new();
    for (from, to, info) in entries {
        table
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string(), info.clone());
    }
    table
}

fn remote(endpoint: &str, message: &str) -> Error {
    Error::Remote {
        endpoint: endpoint.to_string(),
        message: message.to_string(),
    }
}

impl MockCoordinator {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("mock state mutex poisoned")
    }

    pub fn server_public_key(&self) -> PublicKey {
        self.server_keys.public_key()
    }

    pub fn set_status(&self, id: &str, status: SwapStatus) {
        self.state().statuses.insert(id.to_string(), status);
    }

    pub fn fail_next_create(&self, message: &str) {
        self.state().fail_create = Some(message.to_string());
    }

    /// Reverse swaps get an invoice for a hash the user does not hold.
    pub fn serve_wrong_invoice(&self) {
        self.state().wrong_invoice = true;
    }

    /// Status requests are counted, then never answered.
    pub fn stall_status(&self) {
        self.state().stall_status = true;
    }

    /// Claim signing requests fail with `message`.
    pub fn reject_claims(&self, message: &str) {
        self.state().claim_rejection = Some(message.to_string());
    }

    /// Claim signing requests received, rejected ones included.
    pub fn claim_posts(&self) -> usize {
        self.state().claim_posts
    }

    /// Lockup transactions pay `sats` less than the leg amount.
    pub fn underfund_lockup(&self, sats: u64) {
        self.state().lockup_shortfall = sats;
    }

    /// The coordinator offers to lock `sats` less than its fee schedule quotes.
    pub fn lock_below_quote(&self, sats: u64) {
        self.state().quote_shortfall = sats;
    }

    /// Status reported for swaps created from now on.
    pub fn initial_status(&self, status: SwapStatus) {
        self.state().initial_status = Some(status);
    }

    fn created_status(&self, default: SwapStatus) -> SwapStatus {
        self.state().initial_status.unwrap_or(default)
    }

    fn take_claim_rejection(&self, endpoint: &str) -> Result<()> {
        let mut state = self.state();
        state.claim_posts += 1;
        match &state.claim_rejection {
            Some(message) => Err(remote(endpoint, message)),
            None => Ok(()),
        }
    }

    pub fn status_calls(&self) -> usize {
        self.state().status_calls
    }

    pub fn broadcasts(&self) -> Vec<(String, Transaction)> {
        self.state().broadcasts.clone()
    }

    pub fn cosigned(&self, id: &str) -> bool {
        self.state().swaps.get(id).is_some_and(|swap| swap.cosigned)
    }

    /// The swap output of the coordinator's lockup for `id`.
    pub fn server_lockup_output(&self, id: &str) -> Option<TxOut> {
        let state = self.state();
        let lock = state.swaps.get(id)?.server_lock.as_ref()?;
        lock.tx
            .output
            .iter()
            .find(|out| out.script_pubkey == lock.taproot.script_pubkey())
            .cloned()
    }

    fn take_create_failure(&self, endpoint: &str) -> Result<()> {
        match self.state().fail_create.take() {
            Some(message) => Err(remote(endpoint, &message)),
            None => Ok(()),
        }
    }

    fn new_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
    }

    fn address(&self, taproot: &TaprootSwap) -> String {
        Address::p2tr_tweaked(taproot.spend_info.output_key(), Network::Regtest).to_string()
    }

    /// The user claims, the coordinator refunds after `timeout`.
    fn server_lock(
        &self,
        preimage_hash: &[u8; 32],
        user_key: PublicKey,
        amount: u64,
        timeout: u32,
    ) -> Result<ServerLock> {
        let script = SwapScript::new(
            preimage_hash,
            user_key.x_only_public_key().0,
            self.server_keys.x_only_public_key().0,
            timeout,
        );
        let taproot = TaprootSwap::new(&self.secp, script, self.server_keys.public_key(), user_key)?;
        let funded = amount.saturating_sub(self.state().lockup_shortfall);
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![
                TxOut {
                    value: Amount::from_sat(12_345),
                    script_pubkey: ScriptBuf::new_op_return([0u8; 4]),
                },
                TxOut {
                    value: Amount::from_sat(funded),
                    script_pubkey: taproot.script_pubkey(),
                },
            ],
        };
        Ok(ServerLock { taproot, tx })
    }

    /// The coordinator claims, the user refunds after `timeout`.
    fn user_lock(&self, preimage_hash: &[u8; 32], user_key: PublicKey, timeout: u32) -> Result<TaprootSwap> {
        let script = SwapScript::new(
            preimage_hash,
            self.server_keys.x_only_public_key().0,
            user_key.x_only_public_key().0,
            timeout,
        );
        TaprootSwap::new(&self.secp, script, self.server_keys.public_key(), user_key)
    }

    fn server_key_hex(&self) -> String {
        hex::encode(self.server_keys.public_key().serialize())
    }

    /// Checks the preimage and answers the user's signing request on a claim
    /// of the coordinator's lockup.
    fn cosign_user_claim(
        &self,
        endpoint: &str,
        swap: &MockSwap,
        preimage_hex: &str,
        tx_hex: &str,
        user_nonce: &str,
    ) -> Result<PartialSignature> {
        let preimage = parse_hash32(preimage_hex, "preimage")?;
        if sha256(&preimage) != swap.preimage_hash {
            return Err(remote(endpoint, "invalid preimage"));
        }
        let lock = swap
            .server_lock
            .as_ref()
            .ok_or_else(|| remote(endpoint, "no server lockup"))?;
        let claim: Transaction = deserialize_hex(tx_hex)
            .map_err(|e| remote(endpoint, &format!("claim transaction: {e}")))?;
        let prevout = lock
            .tx
            .output
            .iter()
            .find(|out| out.script_pubkey == lock.taproot.script_pubkey())
            .cloned()
            .ok_or_else(|| remote(endpoint, "lockup output missing"))?;
        let sighash = SighashCache::new(&claim)
            .taproot_key_spend_signature_hash(0, &Prevouts::All(&[prevout]), TapSighashType::Default)
            .map_err(|e| remote(endpoint, &format!("sighash: {e}")))?;
        let msg = Message::from_digest(sighash.to_byte_array());

        let round = SigningRound::start(&lock.taproot.key_agg, &self.server_keys, msg)?;
        let pub_nonce = round.pub_nonce_hex();
        let partial = round.sign(&lock.taproot.key_agg, &self.server_keys, parse_pub_nonce(user_nonce)?)?;
        Ok(PartialSignature {
            pub_nonce,
            partial_signature: partial_signature_hex(&partial),
        })
    }
}

impl SwapApi for MockCoordinator {
    async fn pairs(&self, market: Market) -> Result<PairTable> {
        Ok(match market {
            Market::Submarine => table(&[("BTC", "BTC", pair("sub", MinerFees::Flat(SUBMARINE_FEE)))]),
            Market::Reverse => table(&[(
                "BTC",
                "BTC",
                pair(
                    "rev",
                    MinerFees::Reverse {
                        lockup: REVERSE_LOCKUP_FEE,
                        claim: 150,
                    },
                ),
            )]),
            Market::Chain => {
                let fees = MinerFees::Chain {
                    server: 400,
                    user: UserMinerFees {
                        claim: CHAIN_CLAIM_FEE,
                        lockup: 200,
                    },
                };
                table(&[
                    ("cBTC", "BTC", pair("chain-cbtc", fees)),
                    ("tBTC", "BTC", pair("chain-tbtc", fees)),
                    ("BTC", "cBTC", pair("chain-btc", fees)),
                ])
            }
        })
    }

    async fn create_submarine_swap(
        &self,
        req: &CreateSubmarineRequest,
    ) -> Result<CreateSubmarineResponse> {
        self.take_create_failure("v2/swap/submarine")?;
        let preimage_hash = payment_hash_from_bolt11(&req.invoice)?;
        let amount = amount_sats_from_bolt11(&req.invoice)?.unwrap_or_default();
        let user_key: PublicKey = req
            .refund_public_key
            .as_deref()
            .ok_or_else(|| remote("v2/swap/submarine", "refundPublicKey missing"))?
            .parse()
            .map_err(|_| remote("v2/swap/submarine", "bad refundPublicKey"))?;
        let lock = self.user_lock(&preimage_hash, user_key, 700)?;

        let id = self.new_id("sub");
        let response = CreateSubmarineResponse {
            id: id.clone(),
            address: self.address(&lock),
            expected_amount: amount + SUBMARINE_FEE,
            timeout_block_height: 700,
            accept_zero_conf: Some(false),
            swap_tree: Some(lock.script.to_swap_tree()),
            claim_public_key: Some(self.server_key_hex()),
            claim_address: None,
        };
        let status = self.created_status(SwapStatus::InvoiceSet);
        let mut state = self.state();
        state.statuses.insert(id.clone(), status);
        state.swaps.insert(
            id,
            MockSwap {
                preimage_hash,
                user_key: Some(user_key),
                user_lock: Some(lock),
                ..MockSwap::default()
            },
        );
        Ok(response)
    }

    async fn create_reverse_swap(&self, req: &CreateReverseRequest) -> Result<CreateReverseResponse> {
        self.take_create_failure("v2/swap/reverse")?;
        let preimage_hash = parse_hash32(&req.preimage_hash, "preimage hash")?;
        let user_key: PublicKey = req
            .claim_public_key
            .as_deref()
            .ok_or_else(|| remote("v2/swap/reverse", "claimPublicKey missing"))?
            .parse()
            .map_err(|_| remote("v2/swap/reverse", "bad claimPublicKey"))?;
        let onchain_amount =
            req.invoice_amount - REVERSE_LOCKUP_FEE - self.state().quote_shortfall;
        let lock = self.server_lock(&preimage_hash, user_key, onchain_amount, 800)?;

        let invoice_hash = if self.state().wrong_invoice {
            [0xee; 32]
        } else {
            preimage_hash
        };
        let invoice = invoice(invoice_hash, req.invoice_amount)
            .map_err(|e| remote("v2/swap/reverse", &e.to_string()))?;

        let id = self.new_id("rev");
        let response = CreateReverseResponse {
            id: id.clone(),
            invoice,
            lockup_address: self.address(&lock.taproot),
            onchain_amount,
            timeout_block_height: 800,
            swap_tree: Some(lock.taproot.script.to_swap_tree()),
            refund_public_key: Some(self.server_key_hex()),
            refund_address: None,
        };
        let status = self.created_status(SwapStatus::SwapCreated);
        let mut state = self.state();
        state.statuses.insert(id.clone(), status);
        state.swaps.insert(
            id,
            MockSwap {
                preimage_hash,
                user_key: Some(user_key),
                server_lock: Some(lock),
                ..MockSwap::default()
            },
        );
        Ok(response)
    }

    async fn create_chain_swap(&self, req: &CreateChainRequest) -> Result<CreateChainResponse> {
        self.take_create_failure("v2/swap/chain")?;
        let preimage_hash = parse_hash32(&req.preimage_hash, "preimage hash")?;
        let parse_key = |key: &Option<String>| -> Option<PublicKey> {
            key.as_deref().and_then(|k| k.parse().ok())
        };
        let claim_key = parse_key(&req.claim_public_key);
        let refund_key = parse_key(&req.refund_public_key);
        let amount = req.user_lock_amount;
        let server_amount = amount - self.state().quote_shortfall;

        let mut swap = MockSwap {
            preimage_hash,
            user_key: claim_key.or(refund_key),
            ..MockSwap::default()
        };

        let claim_details = match claim_key {
            Some(key) => {
                let lock = self.server_lock(&preimage_hash, key, server_amount, 900)?;
                let details = LegDetails {
                    lockup_address: self.address(&lock.taproot),
                    amount: server_amount,
                    timeout_block_height: 900,
                    server_public_key: Some(self.server_key_hex()),
                    swap_tree: Some(lock.taproot.script.to_swap_tree()),
                    claim_address: None,
                    refund_address: None,
                    token_address: None,
                };
                swap.server_lock = Some(lock);
                details
            }
            None => LegDetails {
                lockup_address: ETHER_SWAP.into(),
                amount: server_amount,
                timeout_block_height: 900,
                server_public_key: None,
                swap_tree: None,
                claim_address: None,
                refund_address: Some(SERVER_EVM.into()),
                token_address: None,
            },
        };
        let lockup_details = match refund_key {
            Some(key) => {
                let lock = self.user_lock(&preimage_hash, key, 1_000)?;
                let details = LegDetails {
                    lockup_address: self.address(&lock),
                    amount,
                    timeout_block_height: 1_000,
                    server_public_key: Some(self.server_key_hex()),
                    swap_tree: Some(lock.script.to_swap_tree()),
                    claim_address: None,
                    refund_address: None,
                    token_address: None,
                };
                swap.user_lock = Some(lock);
                details
            }
            None => LegDetails {
                lockup_address: ETHER_SWAP.into(),
                amount,
                timeout_block_height: 1_000,
                server_public_key: None,
                swap_tree: None,
                claim_address: Some(SERVER_EVM.into()),
                refund_address: None,
                token_address: None,
            },
        };

        let id = self.new_id("chain");
        let status = self.created_status(SwapStatus::SwapCreated);
        let mut state = self.state();
        state.statuses.insert(id.clone(), status);
        state.swaps.insert(id.clone(), swap);
        Ok(CreateChainResponse {
            id,
            claim_details,
            lockup_details,
        })
    }

    async fn swap_status(&self, id: &str) -> Result<SwapStatusResponse> {
        let stalled = {
            let mut state = self.state();
            state.status_calls += 1;
            state.stall_status
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        let state = self.state();
        let status = state
            .statuses
            .get(id)
            .copied()
            .ok_or_else(|| remote("v2/swap", "could not find swap"))?;
        Ok(SwapStatusResponse {
            status: status.as_str().to_string(),
            zero_conf_rejected: None,
            transaction: None,
            failure_reason: None,
        })
    }

    async fn reverse_transaction(&self, id: &str) -> Result<TransactionInfo> {
        let state = self.state();
        let lock = state
            .swaps
            .get(id)
            .and_then(|swap| swap.server_lock.as_ref())
            .ok_or_else(|| remote("v2/swap/reverse/transaction", "no lockup yet"))?;
        Ok(TransactionInfo {
            id: lock.tx.compute_txid().to_string(),
            hex: Some(serialize_hex(&lock.tx)),
        })
    }

    async fn chain_transactions(&self, id: &str) -> Result<ChainSwapTransactions> {
        let state = self.state();
        let swap = state
            .swaps
            .get(id)
            .ok_or_else(|| remote("v2/swap/chain/transactions", "could not find swap"))?;
        Ok(ChainSwapTransactions {
            user_lock: None,
            server_lock: swap.server_lock.as_ref().map(|lock| LockTransaction {
                transaction: TransactionInfo {
                    id: lock.tx.compute_txid().to_string(),
                    hex: Some(serialize_hex(&lock.tx)),
                },
                timeout: None,
            }),
        })
    }

    async fn chain_claim_details(&self, id: &str) -> Result<ServerClaimDetails> {
        let mut state = self.state();
        let swap = state
            .swaps
            .get_mut(id)
            .ok_or_else(|| remote("v2/swap/chain/claim", "could not find swap"))?;
        let Some(lock) = swap.user_lock.as_ref() else {
            return Err(remote("v2/swap/chain/claim", "no claimable user lockup"));
        };
        let transaction_hash = [0xab; 32];
        let round = SigningRound::start(
            &lock.key_agg,
            &self.server_keys,
            Message::from_digest(transaction_hash),
        )?;
        let details = ServerClaimDetails {
            pub_nonce: round.pub_nonce_hex(),
            public_key: self.server_key_hex(),
            transaction_hash: hex::encode(transaction_hash),
        };
        swap.cosign_round = Some(round);
        Ok(details)
    }

    async fn post_chain_claim(&self, id: &str, req: &ChainClaimRequest) -> Result<PartialSignature> {
        let endpoint = "v2/swap/chain/claim";
        self.take_claim_rejection(endpoint)?;
        let mut state = self.state();
        let swap = state
            .swaps
            .get_mut(id)
            .ok_or_else(|| remote(endpoint, "could not find swap"))?;

        if let Some(signature) = &req.signature {
            let round = swap
                .cosign_round
                .take()
                .ok_or_else(|| remote(endpoint, "no claim details were requested"))?;
            let (lock, user_key) = swap
                .user_lock
                .as_ref()
                .zip(swap.user_key)
                .ok_or_else(|| remote(endpoint, "no user lockup"))?;
            round
                .sign_and_aggregate(
                    &lock.key_agg,
                    &self.server_keys,
                    user_key,
                    parse_pub_nonce(&signature.pub_nonce)?,
                    parse_partial_signature(&signature.partial_signature)?,
                )
                .map_err(|e| remote(endpoint, &format!("bad partial signature: {e}")))?;
            swap.cosigned = true;
        }

        self.cosign_user_claim(
            endpoint,
            swap,
            &req.preimage,
            &req.to_sign.transaction,
            &req.to_sign.pub_nonce,
        )
    }

    async fn post_reverse_claim(
        &self,
        id: &str,
        req: &ReverseClaimRequest,
    ) -> Result<PartialSignature> {
        let endpoint = "v2/swap/reverse/claim";
        self.take_claim_rejection(endpoint)?;
        let state = self.state();
        let swap = state
            .swaps
            .get(id)
            .ok_or_else(|| remote(endpoint, "could not find swap"))?;
        self.cosign_user_claim(endpoint, swap, &req.preimage, &req.transaction, &req.pub_nonce)
    }

    async fn broadcast(&self, currency: &str, tx_hex: &str) -> Result<String> {
        let tx: Transaction = deserialize_hex(tx_hex)
            .map_err(|e| remote("v2/chain/transaction", &format!("decode: {e}")))?;
        let txid = tx.compute_txid().to_string();
        self.state().broadcasts.push((currency.to_string(), tx));
        Ok(txid)
    }
}
