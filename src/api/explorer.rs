use std::future::Future;
use std::time::Duration;

use alloy::primitives::B256;
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use reqwest::Client;
use serde::Deserialize;

use crate::config::{AssetConfig, BridgeConfig, ChainKind};
use crate::error::{Error, Result};
use crate::evm::{ERC20Swap, EtherSwap, EvmHtlc};
use crate::swap::ChainLeg;
use crate::units::wei_to_sats;

/// A lockup found on chain for a swap's preimage hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockupSighting {
    pub tx_id: String,
    pub amount: u64,
    pub confirmed: bool,
}

/// Chain lookups used by refund eligibility and claim gating.
pub trait ChainExplorer: Send + Sync + 'static {
    fn tip_height(&self, asset: &str) -> impl Future<Output = Result<u32>> + Send;

    /// The lockup funding `leg` under `preimage_hash`, if any. Lockups below
    /// the leg amount are ignored.
    fn find_lockup(
        &self,
        asset: &str,
        leg: &ChainLeg,
        preimage_hash: &[u8; 32],
    ) -> impl Future<Output = Result<Option<LockupSighting>>> + Send;
}

/// Esplora for UTXO chains, the HTLC contracts' `Lockup` logs over JSON-RPC
/// for EVM chains.
#[derive(Debug, Clone)]
pub struct HttpExplorer {
    http: Client,
    config: BridgeConfig,
}

#[derive(Deserialize)]
struct EsploraUtxo {
    txid: String,
    value: u64,
    status: EsploraStatus,
}

#[derive(Deserialize)]
struct EsploraStatus {
    confirmed: bool,
}

fn rpc_url<'a>(asset: &str, cfg: &'a AssetConfig) -> Result<&'a str> {
    cfg.rpc_url
        .as_deref()
        .ok_or_else(|| Error::Config(format!("asset {asset} has no rpcUrl")))
}

fn esplora_url<'a>(asset: &str, cfg: &'a AssetConfig) -> Result<&'a str> {
    cfg.explorer_url
        .as_deref()
        .map(|base| base.trim_end_matches('/'))
        .ok_or_else(|| Error::Config(format!("asset {asset} has no explorerUrl")))
}

fn provider(rpc_url: &str) -> Result<impl Provider> {
    let url = rpc_url
        .parse()
        .map_err(|e| Error::Config(format!("evm rpc url {rpc_url:?}: {e}")))?;
    Ok(ProviderBuilder::new().connect_http(url))
}

fn rpc_error(method: &str, err: impl std::fmt::Display) -> Error {
    Error::Remote {
        endpoint: method.to_string(),
        message: err.to_string(),
    }
}

/// Reads the locked amount out of a `Lockup` log of either contract.
fn lockup_amount(htlc: &EvmHtlc, log: &Log) -> Result<u64> {
    let wei = match htlc.token {
        None => EtherSwap::Lockup::decode_log(&log.inner)
            .map(|event| event.data.amount)
            .map_err(|e| Error::InvalidResponse(format!("EtherSwap Lockup log: {e}")))?,
        Some(_) => ERC20Swap::Lockup::decode_log(&log.inner)
            .map(|event| event.data.amount)
            .map_err(|e| Error::InvalidResponse(format!("ERC20Swap Lockup log: {e}")))?,
    };
    wei_to_sats(wei)
}

impl HttpExplorer {
    pub fn new(config: BridgeConfig) -> Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self { http, config })
    }

    async fn esplora_tip(&self, base: &str) -> Result<u32> {
        let url = format!("{base}/blocks/tip/height");
        let text = self.http.get(&url).send().await?.error_for_status()?.text().await?;
        text.trim()
            .parse()
            .map_err(|e| Error::InvalidResponse(format!("{url}: tip height {text:?}: {e}")))
    }

    async fn evm_tip(&self, rpc_url: &str) -> Result<u32> {
        let height = provider(rpc_url)?
            .get_block_number()
            .await
            .map_err(|e| rpc_error("eth_blockNumber", e))?;
        u32::try_from(height)
            .map_err(|_| Error::InvalidResponse(format!("block number {height} overflows u32")))
    }

    /// The lockup address commits to the preimage hash through its script
    /// tree, so an output of at least the leg amount to it is the lockup.
    async fn esplora_lockup(&self, base: &str, leg: &ChainLeg) -> Result<Option<LockupSighting>> {
        let url = format!("{base}/address/{}/utxo", leg.lockup_address);
        let utxos: Vec<EsploraUtxo> = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(utxos
            .into_iter()
            .filter(|utxo| utxo.value >= leg.amount)
            .max_by_key(|utxo| utxo.status.confirmed)
            .map(|utxo| LockupSighting {
                tx_id: utxo.txid,
                amount: utxo.value,
                confirmed: utxo.status.confirmed,
            }))
    }

    async fn evm_lockup(&self, rpc_url: &str, htlc: &EvmHtlc) -> Result<Option<LockupSighting>> {
        let signature = match htlc.token {
            None => EtherSwap::Lockup::SIGNATURE_HASH,
            Some(_) => ERC20Swap::Lockup::SIGNATURE_HASH,
        };
        let filter = Filter::new()
            .address(htlc.contract)
            .event_signature(signature)
            .topic1(htlc.preimage_hash)
            .from_block(0u64);
        let logs = provider(rpc_url)?
            .get_logs(&filter)
            .await
            .map_err(|e| rpc_error("eth_getLogs", e))?;

        for log in &logs {
            let amount = lockup_amount(htlc, log)?;
            if amount < htlc.amount_sats {
                tracing::debug!(contract = %htlc.contract, amount, "lockup below leg amount");
                continue;
            }
            return Ok(Some(LockupSighting {
                tx_id: log.transaction_hash.unwrap_or(B256::ZERO).to_string(),
                amount,
                confirmed: log.block_number.is_some(),
            }));
        }
        Ok(None)
    }
}

impl ChainExplorer for HttpExplorer {
    async fn tip_height(&self, asset: &str) -> Result<u32> {
        let cfg = self.config.asset(asset)?;
        match cfg.chain {
            ChainKind::Utxo => self.esplora_tip(esplora_url(asset, cfg)?).await,
            ChainKind::Evm => self.evm_tip(rpc_url(asset, cfg)?).await,
            ChainKind::Lightning => Err(Error::Unsupported(format!(
                "{asset} has no block height"
            ))),
        }
    }

    async fn find_lockup(
        &self,
        asset: &str,
        leg: &ChainLeg,
        preimage_hash: &[u8; 32],
    ) -> Result<Option<LockupSighting>> {
        let cfg = self.config.asset(asset)?;
        let sighting = match cfg.chain {
            ChainKind::Utxo => self.esplora_lockup(esplora_url(asset, cfg)?, leg).await?,
            ChainKind::Evm => {
                let htlc = EvmHtlc::from_leg(cfg, leg, preimage_hash)?;
                self.evm_lockup(rpc_url(asset, cfg)?, &htlc).await?
            }
            ChainKind::Lightning => {
                return Err(Error::Unsupported(format!("{asset} has no on-chain lockup")));
            }
        };
        tracing::debug!(%asset, preimage_hash = %hex::encode(preimage_hash), ?sighting, "lockup lookup");
        Ok(sighting)
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Address, U256};

    use super::*;
    use crate::units::sats_to_wei;

    fn htlc(token: Option<Address>) -> EvmHtlc {
        EvmHtlc {
            contract: Address::repeat_byte(1),
            token,
            preimage_hash: B256::repeat_byte(2),
            amount_sats: 50_000,
            counterparty: Address::repeat_byte(3),
            timelock: 900,
        }
    }

    fn log(data: alloy::primitives::LogData) -> Log {
        Log {
            inner: alloy::primitives::Log {
                address: Address::repeat_byte(1),
                data,
            },
            block_number: Some(7),
            ..Log::default()
        }
    }

    #[test]
    fn lockup_logs_decode_to_sats() {
        let ether = EtherSwap::Lockup {
            preimageHash: B256::repeat_byte(2),
            amount: sats_to_wei(50_000) + U256::from(9u64),
            claimAddress: Address::repeat_byte(3),
            refundAddress: Address::repeat_byte(4),
            timelock: U256::from(900u64),
        };
        assert_eq!(
            lockup_amount(&htlc(None), &log(ether.encode_log_data())).unwrap(),
            50_000
        );

        let erc20 = ERC20Swap::Lockup {
            preimageHash: B256::repeat_byte(2),
            amount: sats_to_wei(49_999),
            tokenAddress: Address::repeat_byte(5),
            claimAddress: Address::repeat_byte(3),
            refundAddress: Address::repeat_byte(4),
            timelock: U256::from(900u64),
        };
        let erc20_log = log(erc20.encode_log_data());
        assert_eq!(
            lockup_amount(&htlc(Some(Address::repeat_byte(5))), &erc20_log).unwrap(),
            49_999
        );
        // A native-coin log does not decode as the token event.
        let ether_log = log(ether.encode_log_data());
        assert!(lockup_amount(&htlc(Some(Address::repeat_byte(5))), &ether_log).is_err());
    }
}
