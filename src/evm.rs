use std::future::Future;
use std::str::FromStr as _;
use std::sync::Arc;
use std::time::Duration;

use alloy::network::ReceiptResponse as _;
use alloy::primitives::{Address, B256, Bytes, TxHash, TxKind, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::sol;
use alloy::sol_types::SolCall;

use crate::config::AssetConfig;
use crate::error::{Error, Result};
use crate::retry::{RetryPolicy, poll_until};
use crate::swap::{ChainLeg, LegLocking};
use crate::units::sats_to_wei;

sol! {
    interface EtherSwap {
        event Lockup(bytes32 indexed preimageHash, uint256 amount, address claimAddress, address indexed refundAddress, uint256 timelock);

        function lock(bytes32 preimageHash, address claimAddress, uint256 timelock) external payable;
        function claim(bytes32 preimage, uint256 amount, address refundAddress, uint256 timelock) external;
        function refund(bytes32 preimageHash, uint256 amount, address claimAddress, uint256 timelock) external;
    }

    interface ERC20Swap {
        event Lockup(bytes32 indexed preimageHash, uint256 amount, address tokenAddress, address claimAddress, address indexed refundAddress, uint256 timelock);

        function lock(bytes32 preimageHash, uint256 amount, address tokenAddress, address claimAddress, uint256 timelock) external;
        function claim(bytes32 preimage, uint256 amount, address tokenAddress, address refundAddress, uint256 timelock) external;
        function refund(bytes32 preimageHash, uint256 amount, address tokenAddress, address claimAddress, uint256 timelock) external;
    }

    interface IERC20 {
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
    }
}

/// Account that signs and submits EVM transactions.
pub trait EvmSigner: Send + Sync + 'static {
    fn address(&self) -> Address;

    fn call(&self, tx: TransactionRequest) -> impl Future<Output = Result<Bytes>> + Send;

    fn send_transaction(&self, tx: TransactionRequest)
    -> impl Future<Output = Result<TxHash>> + Send;

    /// Dispatches an already populated request as a bare `eth_sendTransaction`,
    /// skipping the provider's response formatting.
    fn send_raw_transaction(
        &self,
        tx: TransactionRequest,
    ) -> impl Future<Output = Result<TxHash>> + Send;

    /// Resolves once `hash` is mined; a reverted receipt is an error.
    fn wait_mined(&self, hash: TxHash) -> impl Future<Output = Result<()>> + Send;
}

fn target(tx: &TransactionRequest) -> String {
    tx.to
        .and_then(|kind| match kind {
            TxKind::Call(addr) => Some(addr.to_string()),
            TxKind::Create => None,
        })
        .unwrap_or_else(|| "<create>".to_string())
}

/// Signer backed by an alloy HTTP provider whose node manages the key of
/// `from`.
pub struct AlloyEvmSigner<P> {
    provider: P,
    from: Address,
    receipt_policy: RetryPolicy,
}

impl<P: Provider> AlloyEvmSigner<P> {
    pub fn new(provider: P, from: Address) -> Self {
        Self {
            provider,
            from,
            receipt_policy: RetryPolicy::fixed(Duration::from_secs(2), 90),
        }
    }
}

pub fn connect_http(
    rpc_url: &str,
    from: Address,
) -> Result<AlloyEvmSigner<impl Provider + Clone + 'static + use<>>> {
    let url = rpc_url
        .parse()
        .map_err(|e| Error::Config(format!("evm rpc url {rpc_url:?}: {e}")))?;
    Ok(AlloyEvmSigner::new(
        ProviderBuilder::new().connect_http(url),
        from,
    ))
}

impl<P: Provider + Send + Sync + 'static> EvmSigner for AlloyEvmSigner<P> {
    fn address(&self) -> Address {
        self.from
    }

    async fn call(&self, tx: TransactionRequest) -> Result<Bytes> {
        let contract = target(&tx);
        self.provider
            .call(tx)
            .await
            .map_err(|e| Error::ChainInteraction {
                contract,
                function: "eth_call",
                reason: e.to_string(),
            })
    }

    async fn send_transaction(&self, tx: TransactionRequest) -> Result<TxHash> {
        let contract = target(&tx);
        let pending = self
            .provider
            .send_transaction(tx)
            .await
            .map_err(|e| Error::ChainInteraction {
                contract,
                function: "eth_sendTransaction",
                reason: e.to_string(),
            })?;
        Ok(*pending.tx_hash())
    }

    async fn send_raw_transaction(&self, tx: TransactionRequest) -> Result<TxHash> {
        let contract = target(&tx);
        self.provider
            .raw_request::<_, TxHash>("eth_sendTransaction".into(), (tx,))
            .await
            .map_err(|e| Error::ChainInteraction {
                contract,
                function: "eth_sendTransaction",
                reason: e.to_string(),
            })
    }

    async fn wait_mined(&self, hash: TxHash) -> Result<()> {
        let provider = &self.provider;
        let receipt = poll_until(&format!("receipt for {hash}"), self.receipt_policy, move || async move {
            provider
                .get_transaction_receipt(hash)
                .await
                .map_err(|e| Error::Remote {
                    endpoint: "eth_getTransactionReceipt".into(),
                    message: e.to_string(),
                })
        })
        .await?;
        if !receipt.status() {
            return Err(Error::ChainInteraction {
                contract: receipt
                    .to()
                    .map(|a| a.to_string())
                    .unwrap_or_default(),
                function: "receipt",
                reason: format!("transaction {hash} reverted"),
            });
        }
        Ok(())
    }
}

/// One HTLC entry in an EtherSwap or ERC20Swap contract. `counterparty` is
/// the claim address when locking or refunding and the refund address when
/// claiming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvmHtlc {
    pub contract: Address,
    pub token: Option<Address>,
    pub preimage_hash: B256,
    pub amount_sats: u64,
    pub counterparty: Address,
    pub timelock: u32,
}

pub fn parse_address(raw: &str, what: &str) -> Result<Address> {
    Address::from_str(raw).map_err(|e| Error::Config(format!("{what} address {raw:?}: {e}")))
}

impl EvmHtlc {
    pub fn from_leg(asset: &AssetConfig, leg: &ChainLeg, preimage_hash: &[u8; 32]) -> Result<Self> {
        let LegLocking::Evm {
            counterparty,
            token_address,
        } = &leg.locking
        else {
            return Err(Error::Unsupported("leg is not locked in an EVM contract".into()));
        };

        let token = token_address
            .as_deref()
            .or(asset.token_address.as_deref())
            .map(|t| parse_address(t, "token"))
            .transpose()?;
        let configured = if token.is_some() {
            asset.erc20_swap.as_deref()
        } else {
            asset.ether_swap.as_deref()
        };
        let contract = match configured {
            Some(c) => parse_address(c, "swap contract")?,
            None => parse_address(&leg.lockup_address, "lockup")?,
        };

        Ok(Self {
            contract,
            token,
            preimage_hash: B256::from(*preimage_hash),
            amount_sats: leg.amount,
            counterparty: parse_address(counterparty, "counterparty")?,
            timelock: leg.timeout_block_height,
        })
    }

    pub fn amount(&self) -> U256 {
        sats_to_wei(self.amount_sats)
    }

    fn token(&self) -> Result<Address> {
        self.token
            .ok_or_else(|| Error::Unsupported("native-coin HTLC has no token".into()))
    }
}

pub struct EvmLockClaimEngine<S> {
    signer: Arc<S>,
}

impl<S: EvmSigner> EvmLockClaimEngine<S> {
    pub fn new(signer: Arc<S>) -> Self {
        Self { signer }
    }

    pub fn signer(&self) -> &S {
        &self.signer
    }

    fn request(&self, to: Address, data: Vec<u8>) -> TransactionRequest {
        TransactionRequest::default()
            .from(self.signer.address())
            .to(to)
            .input(Bytes::from(data).into())
    }

    /// Native lock: `lock(preimageHash, claimAddress, timelock)` carrying the
    /// amount converted to wei.
    pub fn build_evm_lockup_tx(&self, htlc: &EvmHtlc) -> Result<TransactionRequest> {
        if htlc.token.is_some() {
            return Err(Error::Unsupported("ERC20 HTLC needs build_erc20_lockup_tx".into()));
        }
        let data = EtherSwap::lockCall {
            preimageHash: htlc.preimage_hash,
            claimAddress: htlc.counterparty,
            timelock: U256::from(htlc.timelock),
        }
        .abi_encode();
        Ok(self.request(htlc.contract, data).value(htlc.amount()))
    }

    /// Populates the ERC20 lock call without sending it; it goes out through
    /// [`EvmSigner::send_raw_transaction`].
    pub fn build_erc20_lockup_tx(&self, htlc: &EvmHtlc) -> Result<TransactionRequest> {
        let data = ERC20Swap::lockCall {
            preimageHash: htlc.preimage_hash,
            amount: htlc.amount(),
            tokenAddress: htlc.token()?,
            claimAddress: htlc.counterparty,
            timelock: U256::from(htlc.timelock),
        }
        .abi_encode();
        Ok(self.request(htlc.contract, data))
    }

    pub async fn check_erc20_allowance(&self, token: Address, spender: Address) -> Result<U256> {
        let data = IERC20::allowanceCall {
            owner: self.signer.address(),
            spender,
        }
        .abi_encode();
        let raw = self.signer.call(self.request(token, data)).await?;
        IERC20::allowanceCall::abi_decode_returns(&raw).map_err(|e| Error::ChainInteraction {
            contract: token.to_string(),
            function: "allowance",
            reason: e.to_string(),
        })
    }

    async fn approve(&self, token: Address, spender: Address, amount: U256) -> Result<()> {
        let data = IERC20::approveCall { spender, amount }.abi_encode();
        let hash = self
            .signer
            .send_transaction(self.request(token, data))
            .await?;
        self.signer.wait_mined(hash).await?;
        tracing::info!(%token, %spender, %amount, tx = %hash, "erc20 approval mined");
        Ok(())
    }

    /// Makes sure `spender` may move `required`. A non-zero allowance that
    /// is too small is reset to zero first; the new allowance is unlimited.
    /// Returns whether any approval was sent.
    pub async fn approve_erc20_for_lds_bridge(
        &self,
        token: Address,
        spender: Address,
        required: U256,
    ) -> Result<bool> {
        let current = self.check_erc20_allowance(token, spender).await?;
        if current >= required {
            return Ok(false);
        }
        if !current.is_zero() {
            self.approve(token, spender, U256::ZERO).await?;
        }
        self.approve(token, spender, U256::MAX).await?;
        Ok(true)
    }

    /// Locks funds and waits for the lock to be mined.
    pub async fn lock(&self, htlc: &EvmHtlc) -> Result<TxHash> {
        let hash = match htlc.token {
            None => {
                let tx = self.build_evm_lockup_tx(htlc)?;
                self.signer.send_transaction(tx).await?
            }
            Some(token) => {
                self.approve_erc20_for_lds_bridge(token, htlc.contract, htlc.amount())
                    .await?;
                let tx = self.build_erc20_lockup_tx(htlc)?;
                self.signer.send_raw_transaction(tx).await?
            }
        };
        self.signer.wait_mined(hash).await?;
        tracing::info!(contract = %htlc.contract, tx = %hash, "evm lockup mined");
        Ok(hash)
    }

    async fn submit(&self, tx: TransactionRequest, function: &'static str) -> Result<TxHash> {
        let contract = target(&tx);
        // Simulate first so reverts surface with their reason.
        self.signer
            .call(tx.clone())
            .await
            .map_err(|e| Error::ChainInteraction {
                contract: contract.clone(),
                function,
                reason: e.to_string(),
            })?;
        let hash = self.signer.send_transaction(tx).await?;
        self.signer.wait_mined(hash).await?;
        tracing::info!(%contract, function, tx = %hash, "evm call mined");
        Ok(hash)
    }

    pub async fn claim_coin_swap(&self, htlc: &EvmHtlc, preimage: B256) -> Result<TxHash> {
        let data = EtherSwap::claimCall {
            preimage,
            amount: htlc.amount(),
            refundAddress: htlc.counterparty,
            timelock: U256::from(htlc.timelock),
        }
        .abi_encode();
        self.submit(self.request(htlc.contract, data), "claim").await
    }

    pub async fn claim_erc20_swap(&self, htlc: &EvmHtlc, preimage: B256) -> Result<TxHash> {
        let data = ERC20Swap::claimCall {
            preimage,
            amount: htlc.amount(),
            tokenAddress: htlc.token()?,
            refundAddress: htlc.counterparty,
            timelock: U256::from(htlc.timelock),
        }
        .abi_encode();
        self.submit(self.request(htlc.contract, data), "claim").await
    }

    pub async fn refund_coin_swap(&self, htlc: &EvmHtlc) -> Result<TxHash> {
        let data = EtherSwap::refundCall {
            preimageHash: htlc.preimage_hash,
            amount: htlc.amount(),
            claimAddress: htlc.counterparty,
            timelock: U256::from(htlc.timelock),
        }
        .abi_encode();
        self.submit(self.request(htlc.contract, data), "refund").await
    }

    pub async fn refund_erc20_swap(&self, htlc: &EvmHtlc) -> Result<TxHash> {
        let data = ERC20Swap::refundCall {
            preimageHash: htlc.preimage_hash,
            amount: htlc.amount(),
            tokenAddress: htlc.token()?,
            claimAddress: htlc.counterparty,
            timelock: U256::from(htlc.timelock),
        }
        .abi_encode();
        self.submit(self.request(htlc.contract, data), "refund").await
    }

    pub async fn claim(&self, htlc: &EvmHtlc, preimage: B256) -> Result<TxHash> {
        match htlc.token {
            None => self.claim_coin_swap(htlc, preimage).await,
            Some(_) => self.claim_erc20_swap(htlc, preimage).await,
        }
    }

    pub async fn refund(&self, htlc: &EvmHtlc) -> Result<TxHash> {
        match htlc.token {
            None => self.refund_coin_swap(htlc).await,
            Some(_) => self.refund_erc20_swap(htlc).await,
        }
    }
}
