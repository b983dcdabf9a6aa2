use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_CLAIM_AUTHORITY_ASSET: &str = "cBTC";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    Utxo,
    Lightning,
    Evm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetConfig {
    pub chain: ChainKind,
    /// Bitcoin network for UTXO assets; address parsing is checked against it.
    #[serde(default)]
    pub network: Option<bitcoin::Network>,
    #[serde(default)]
    pub chain_id: Option<u64>,
    #[serde(default)]
    pub rpc_url: Option<String>,
    #[serde(default)]
    pub ether_swap: Option<String>,
    #[serde(default)]
    pub erc20_swap: Option<String>,
    #[serde(default)]
    pub token_address: Option<String>,
    #[serde(default = "default_block_time_secs")]
    pub block_time_secs: u64,
    /// Esplora base URL for UTXO chains.
    #[serde(default)]
    pub explorer_url: Option<String>,
}

fn default_block_time_secs() -> u64 {
    600
}

impl AssetConfig {
    pub fn is_evm(&self) -> bool {
        self.chain == ChainKind::Evm
    }

    pub fn is_erc20(&self) -> bool {
        self.is_evm() && self.token_address.is_some()
    }
}

/// Cadence and timeouts for status synchronization, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub tick_ms: u64,
    pub young_age_secs: u64,
    pub young_interval_ms: u64,
    pub mid_age_secs: u64,
    pub mid_interval_ms: u64,
    pub old_interval_ms: u64,
    pub wait_timeout_ms: u64,
    pub wait_poll_ms: u64,
    /// How long creation waits for the first status before returning.
    pub creation_wait_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_ms: 5_000,
            young_age_secs: 5 * 60,
            young_interval_ms: 30_000,
            mid_age_secs: 60 * 60,
            mid_interval_ms: 60_000,
            old_interval_ms: 120_000,
            wait_timeout_ms: 120_000,
            wait_poll_ms: 3_000,
            creation_wait_ms: 10_000,
        }
    }
}

impl SyncConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn wait_poll(&self) -> Duration {
        Duration::from_millis(self.wait_poll_ms)
    }

    pub fn creation_wait(&self) -> Duration {
        Duration::from_millis(self.creation_wait_ms)
    }

    /// Polling interval for a swap of the given age. Younger swaps move
    /// faster and are polled more often.
    pub fn interval_for_age(&self, age: Duration) -> Duration {
        let ms = if age < Duration::from_secs(self.young_age_secs) {
            self.young_interval_ms
        } else if age < Duration::from_secs(self.mid_age_secs) {
            self.mid_interval_ms
        } else {
            self.old_interval_ms
        };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    pub api_url: String,
    #[serde(default)]
    pub ws_url: Option<String>,
    pub assets: BTreeMap<String, AssetConfig>,
    /// Chain swaps out of this asset use a random preimage, because its
    /// claim authority can observe the derived one.
    #[serde(default = "default_claim_authority_asset")]
    pub claim_authority_asset: String,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default = "default_refund_grace_secs")]
    pub refund_grace_secs: u64,
}

fn default_claim_authority_asset() -> String {
    DEFAULT_CLAIM_AUTHORITY_ASSET.to_string()
}

fn default_refund_grace_secs() -> u64 {
    300
}

impl BridgeConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, asset) in &self.assets {
            if asset.is_evm() {
                if asset.chain_id.is_none() {
                    return Err(Error::Config(format!("evm asset {name} needs chainId")));
                }
                let contract = if asset.is_erc20() {
                    &asset.erc20_swap
                } else {
                    &asset.ether_swap
                };
                if contract.is_none() {
                    return Err(Error::Config(format!(
                        "evm asset {name} needs its swap contract address"
                    )));
                }
            }
            if asset.block_time_secs == 0 {
                return Err(Error::Config(format!("asset {name} has zero block time")));
            }
        }
        Ok(())
    }

    pub fn asset(&self, name: &str) -> Result<&AssetConfig> {
        self.assets
            .get(name)
            .ok_or_else(|| Error::UnknownAsset(name.to_string()))
    }

    pub fn refund_grace(&self) -> Duration {
        Duration::from_secs(self.refund_grace_secs)
    }

    /// The websocket endpoint, derived from the API URL when not set.
    pub fn ws_url(&self) -> Result<url::Url> {
        let raw = match &self.ws_url {
            Some(ws) => ws.clone(),
            None => {
                let base = self.api_url.trim_end_matches('/');
                let base = base
                    .strip_prefix("https://")
                    .map(|rest| format!("wss://{rest}"))
                    .or_else(|| base.strip_prefix("http://").map(|rest| format!("ws://{rest}")))
                    .ok_or_else(|| Error::Config(format!("api url {:?}", self.api_url)))?;
                format!("{base}/v2/ws")
            }
        };
        url::Url::parse(&raw).map_err(|e| Error::Config(format!("ws url {raw:?}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
      "apiUrl": "https://api.example.org",
      "assets": {
        "BTC": {"chain": "utxo", "network": "regtest", "explorerUrl": "http://localhost:3002/api"},
        "LN": {"chain": "lightning"},
        "cBTC": {"chain": "evm", "chainId": 5115, "etherSwap": "0x0000000000000000000000000000000000000001", "blockTimeSecs": 2},
        "USDT": {"chain": "evm", "chainId": 1, "erc20Swap": "0x0000000000000000000000000000000000000002", "tokenAddress": "0x0000000000000000000000000000000000000003", "blockTimeSecs": 12}
      }
    }"#;

    #[test]
    fn parses_with_defaults() {
        let config: BridgeConfig = serde_json::from_str(CONFIG).unwrap();
        config.validate().unwrap();
        assert_eq!(config.claim_authority_asset, "cBTC");
        assert_eq!(config.refund_grace(), Duration::from_secs(300));
        assert_eq!(config.sync.wait_timeout(), Duration::from_secs(120));
        assert_eq!(config.asset("BTC").unwrap().block_time_secs, 600);
        assert!(config.asset("USDT").unwrap().is_erc20());
        assert!(matches!(config.asset("DOGE"), Err(Error::UnknownAsset(_))));
        assert_eq!(config.ws_url().unwrap().as_str(), "wss://api.example.org/v2/ws");
    }

    #[test]
    fn evm_asset_without_contract_is_rejected() {
        let mut config: BridgeConfig = serde_json::from_str(CONFIG).unwrap();
        config.assets.get_mut("cBTC").unwrap().ether_swap = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn polling_cadence_slows_with_age() {
        let sync = SyncConfig::default();
        assert_eq!(sync.interval_for_age(Duration::from_secs(60)), Duration::from_secs(30));
        assert_eq!(sync.interval_for_age(Duration::from_secs(600)), Duration::from_secs(60));
        assert_eq!(sync.interval_for_age(Duration::from_secs(7200)), Duration::from_secs(120));
    }
}
