#![allow(dead_code)]

pub mod coordinator;
pub mod evm_signer;
pub mod wait;

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::secp256k1::{Keypair, Secp256k1, SecretKey};
use bitcoin::{Address, Network};
use lightning_invoice::{Currency, InvoiceBuilder, PaymentSecret};

use lds_swap::api::explorer::{ChainExplorer, LockupSighting};
use lds_swap::config::{AssetConfig, BridgeConfig, ChainKind, SyncConfig};
use lds_swap::swap::ChainLeg;
use lds_swap::{Error, Result as SwapResult};

pub const MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
pub const ETHER_SWAP: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";
pub const ERC20_SWAP: &str = "0xe7f1725e7734ce288f8367e1bb143e90bb3f0512";
pub const TOKEN: &str = "0x9fe46736679d2d9a65f0992f2272de9f3c7fa6e0";
pub const SERVER_EVM: &str = "0x70997970c51812dc3a010c7d01b50e0d17dc79c8";

fn utxo_asset() -> AssetConfig {
    AssetConfig {
        chain: ChainKind::Utxo,
        network: Some(Network::Regtest),
        chain_id: None,
        rpc_url: None,
        ether_swap: None,
        erc20_swap: None,
        token_address: None,
        block_time_secs: 600,
        explorer_url: Some("http://127.0.0.1:3002".into()),
    }
}

fn evm_asset(token: Option<&str>) -> AssetConfig {
    AssetConfig {
        chain: ChainKind::Evm,
        network: None,
        chain_id: Some(5115),
        rpc_url: Some("http://127.0.0.1:8545".into()),
        ether_swap: Some(ETHER_SWAP.into()),
        erc20_swap: Some(ERC20_SWAP.into()),
        token_address: token.map(str::to_string),
        block_time_secs: 2,
        explorer_url: None,
    }
}

/// BTC and tBTC on regtest, cBTC as native coin and USDC as ERC20 on an
/// EVM chain with 2s blocks.
pub fn bridge_config() -> BridgeConfig {
    let mut assets = BTreeMap::new();
    assets.insert("BTC".to_string(), utxo_asset());
    assets.insert("tBTC".to_string(), utxo_asset());
    assets.insert("cBTC".to_string(), evm_asset(None));
    assets.insert("USDC".to_string(), evm_asset(Some(TOKEN)));
    BridgeConfig {
        api_url: "http://127.0.0.1:9001".into(),
        ws_url: None,
        assets,
        claim_authority_asset: "cBTC".into(),
        sync: SyncConfig::default(),
        refund_grace_secs: 300,
    }
}

pub fn regtest_address(seed: u8) -> String {
    let secp = Secp256k1::new();
    let keypair = Keypair::from_seckey_slice(&secp, &[seed; 32]).expect("valid test key");
    let (xonly, _) = keypair.x_only_public_key();
    Address::p2tr(&secp, xonly, None, Network::Regtest).to_string()
}

/// A signed regtest BOLT11 invoice committing to `payment_hash`.
pub fn invoice(payment_hash: [u8; 32], amount_sats: u64) -> Result<String> {
    let secp = Secp256k1::new();
    let node_key = SecretKey::from_slice(&[0x42; 32])?;
    let invoice = InvoiceBuilder::new(Currency::Regtest)
        .description("lds-swap test".into())
        .payment_hash(sha256::Hash::from_byte_array(payment_hash))
        .payment_secret(PaymentSecret([7; 32]))
        .current_timestamp()
        .min_final_cltv_expiry_delta(144)
        .amount_milli_satoshis(amount_sats * 1_000)
        .build_signed(|msg| secp.sign_ecdsa_recoverable(msg, &node_key))
        .map_err(|e| anyhow!("build invoice: {e:?}"))?;
    Ok(invoice.to_string())
}

/// Chain tips and lockups per asset, settable by the test.
#[derive(Default)]
pub struct MockExplorer {
    tips: Mutex<HashMap<String, u32>>,
    lockups: Mutex<HashMap<(String, [u8; 32]), LockupSighting>>,
}

impl MockExplorer {
    pub fn set_tip(&self, asset: &str, height: u32) {
        self.tips
            .lock()
            .expect("tips mutex poisoned")
            .insert(asset.to_string(), height);
    }

    pub fn add_lockup(&self, asset: &str, preimage_hash: [u8; 32], amount: u64, confirmed: bool) {
        let sighting = LockupSighting {
            tx_id: format!("lockup-{}", hex::encode(&preimage_hash[..4])),
            amount,
            confirmed,
        };
        self.lockups
            .lock()
            .expect("lockups mutex poisoned")
            .insert((asset.to_string(), preimage_hash), sighting);
    }
}

impl ChainExplorer for MockExplorer {
    async fn tip_height(&self, asset: &str) -> SwapResult<u32> {
        self.tips
            .lock()
            .expect("tips mutex poisoned")
            .get(asset)
            .copied()
            .ok_or_else(|| Error::UnknownAsset(asset.to_string()))
    }

    async fn find_lockup(
        &self,
        asset: &str,
        leg: &ChainLeg,
        preimage_hash: &[u8; 32],
    ) -> SwapResult<Option<LockupSighting>> {
        Ok(self
            .lockups
            .lock()
            .expect("lockups mutex poisoned")
            .get(&(asset.to_string(), *preimage_hash))
            .filter(|sighting| sighting.amount >= leg.amount)
            .cloned())
    }
}
