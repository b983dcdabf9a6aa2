use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser as _, Subcommand};
use lds_swap::api::explorer::HttpExplorer;
use lds_swap::api::http::BoltzHttpClient;
use lds_swap::api::{Market, SwapApi as _};
use lds_swap::config::BridgeConfig;
use lds_swap::evm::{EvmLockClaimEngine, EvmSigner, connect_http, parse_address};
use lds_swap::keys::generate_keys;
use lds_swap::orchestrator::{ChainParams, ReverseParams, SubmarineParams, SwapOrchestrator};
use lds_swap::refund::{RefundAvailability, RefundEligibility};
use lds_swap::swap::store::SwapStore;
use lds_swap::swap::{Swap, SwapStatus};
use serde_json::json;

#[derive(Debug, clap::Parser)]
struct Args {
    /// Bridge configuration (JSON).
    #[arg(long, env = "LDS_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "LDS_DB", default_value = "lds-swap.sqlite3")]
    db: PathBuf,

    /// Overrides `apiUrl` from the configuration.
    #[arg(long, env = "LDS_API_URL")]
    api_url: Option<String>,

    /// Node-managed account used for EVM lock, claim and refund calls.
    #[arg(long, env = "LDS_EVM_FROM")]
    evm_from: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Keys {
        #[command(subcommand)]
        command: KeysCommand,
    },
    Pairs {
        #[arg(long, value_enum, default_value_t = MarketArg::Chain)]
        market: MarketArg,
    },
    CreateSubmarine {
        #[arg(long)]
        from: String,

        #[arg(long, default_value = "BTC")]
        to: String,

        #[arg(long)]
        invoice: String,

        #[arg(long)]
        chain_id: Option<u64>,
    },
    CreateReverse {
        #[arg(long, default_value = "BTC")]
        from: String,

        #[arg(long)]
        to: String,

        #[arg(long)]
        invoice_amount: u64,

        #[arg(long)]
        claim_address: String,

        #[arg(long)]
        chain_id: Option<u64>,
    },
    CreateChain {
        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,

        #[arg(long)]
        user_lock_amount: u64,

        #[arg(long)]
        claim_address: String,

        #[arg(long)]
        chain_id: Option<u64>,
    },
    Status {
        #[arg(long)]
        swap_id: String,
    },
    List,
    Wait {
        #[arg(long)]
        swap_id: String,

        #[arg(long)]
        status: SwapStatus,

        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    Lock {
        #[arg(long)]
        swap_id: String,
    },
    Claim {
        #[arg(long)]
        swap_id: String,
    },
    Refund {
        #[arg(long)]
        swap_id: String,
    },
    RefundCheck {
        #[arg(long)]
        swap_id: String,
    },
}

#[derive(Debug, Subcommand)]
enum KeysCommand {
    Derive {
        /// Falls back to the mnemonic in the database, created on first use.
        #[arg(long, env = "LDS_MNEMONIC")]
        mnemonic: Option<String>,

        #[arg(long)]
        index: Option<u32>,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum MarketArg {
    Submarine,
    Reverse,
    Chain,
}

impl From<MarketArg> for Market {
    fn from(arg: MarketArg) -> Self {
        match arg {
            MarketArg::Submarine => Market::Submarine,
            MarketArg::Reverse => Market::Reverse,
            MarketArg::Chain => Market::Chain,
        }
    }
}

fn load_config(args: &Args) -> Result<BridgeConfig> {
    let path = args
        .config
        .as_ref()
        .context("--config (or LDS_CONFIG) is required for this command")?;
    let mut config = BridgeConfig::from_file(path)?;
    if let Some(api_url) = &args.api_url {
        config.api_url = api_url.clone();
    }
    Ok(config)
}

fn build_orchestrator(
    args: &Args,
    config: BridgeConfig,
) -> Result<SwapOrchestrator<BoltzHttpClient, impl EvmSigner>> {
    let api = Arc::new(BoltzHttpClient::new(&config.api_url)?);
    let store = SwapStore::open(&args.db).context("open swap store")?;
    let evm = match &args.evm_from {
        Some(from) => {
            let asset = config.asset(&config.claim_authority_asset)?;
            let rpc_url = asset
                .rpc_url
                .as_deref()
                .context("claim authority asset has no rpcUrl")?;
            let signer = connect_http(rpc_url, parse_address(from, "evm sender")?)?;
            Some(EvmLockClaimEngine::new(Arc::new(signer)))
        }
        None => None,
    };

    let ws_url = config.ws_url()?;
    let explorer = Arc::new(HttpExplorer::new(config.clone())?);
    let mut orchestrator = SwapOrchestrator::new(api, store, config).with_explorer(explorer);
    if let Some(engine) = evm {
        orchestrator = orchestrator.with_evm(engine);
    }
    orchestrator.sync().connect_socket(ws_url);
    Ok(orchestrator)
}

#[tokio::main]
async fn main() -> Result<()> {
    lds_swap::logging::init().ok();
    let args = Args::parse();

    let out = match &args.command {
        Command::Keys {
            command: KeysCommand::Derive { mnemonic, index },
        } => {
            let store = SwapStore::open(&args.db).context("open swap store")?;
            let keys = generate_keys(&store, mnemonic.as_deref(), *index)?;
            json!({
              "index": keys.index,
              "public_key": keys.public_key_hex(),
              "preimage_hash": keys.preimage_hash_hex(),
            })
        }
        Command::Pairs { market } => {
            let config = load_config(&args)?;
            let api = BoltzHttpClient::new(&config.api_url)?;
            let pairs = api.pairs((*market).into()).await.context("fetch pairs")?;
            serde_json::to_value(pairs)?
        }
        Command::CreateSubmarine {
            from,
            to,
            invoice,
            chain_id,
        } => {
            let orchestrator = build_orchestrator(&args, load_config(&args)?)?;
            let swap = orchestrator
                .create_submarine_swap(SubmarineParams {
                    from: from.clone(),
                    to: to.clone(),
                    invoice: invoice.clone(),
                    chain_id: *chain_id,
                })
                .await
                .context("create submarine swap")?;
            swap_json(&swap)
        }
        Command::CreateReverse {
            from,
            to,
            invoice_amount,
            claim_address,
            chain_id,
        } => {
            let orchestrator = build_orchestrator(&args, load_config(&args)?)?;
            let swap = orchestrator
                .create_reverse_swap(ReverseParams {
                    from: from.clone(),
                    to: to.clone(),
                    invoice_amount: *invoice_amount,
                    claim_address: claim_address.clone(),
                    chain_id: *chain_id,
                })
                .await
                .context("create reverse swap")?;
            swap_json(&swap)
        }
        Command::CreateChain {
            from,
            to,
            user_lock_amount,
            claim_address,
            chain_id,
        } => {
            let orchestrator = build_orchestrator(&args, load_config(&args)?)?;
            let swap = orchestrator
                .create_chain_swap(ChainParams {
                    from: from.clone(),
                    to: to.clone(),
                    claim_address: claim_address.clone(),
                    user_lock_amount: *user_lock_amount,
                    chain_id: *chain_id,
                })
                .await
                .context("create chain swap")?;
            swap_json(&swap)
        }
        Command::Status { swap_id } => {
            let orchestrator = build_orchestrator(&args, load_config(&args)?)?;
            let swap = orchestrator.sync().refresh(swap_id).await?;
            swap_json(&swap)
        }
        Command::List => {
            let store = SwapStore::open(&args.db).context("open swap store")?;
            let swaps = store.list()?;
            json!(swaps.iter().map(swap_json).collect::<Vec<_>>())
        }
        Command::Wait {
            swap_id,
            status,
            timeout_secs,
        } => {
            let orchestrator = build_orchestrator(&args, load_config(&args)?)?;
            orchestrator.sync().track(swap_id);
            let swap = orchestrator
                .sync()
                .wait_for_swap_until_state(swap_id, *status, timeout_secs.map(Duration::from_secs))
                .await?;
            swap_json(&swap)
        }
        Command::Lock { swap_id } => {
            let orchestrator = build_orchestrator(&args, load_config(&args)?)?;
            let tx_hash = orchestrator.lock_evm(swap_id).await?;
            json!({ "lockup_tx": tx_hash.to_string() })
        }
        Command::Claim { swap_id } => {
            let orchestrator = build_orchestrator(&args, load_config(&args)?)?;
            let swap = orchestrator.sync().refresh(swap_id).await?;
            let swap = orchestrator.auto_claim(swap.id()).await?;
            swap_json(&swap)
        }
        Command::Refund { swap_id } => {
            let orchestrator = build_orchestrator(&args, load_config(&args)?)?;
            let swap = orchestrator.refund(swap_id).await?;
            swap_json(&swap)
        }
        Command::RefundCheck { swap_id } => {
            let config = load_config(&args)?;
            let store = SwapStore::open(&args.db).context("open swap store")?;
            let swap = store.require(swap_id)?;
            let explorer = Arc::new(HttpExplorer::new(config.clone())?);
            let eligibility = RefundEligibility::new(explorer, Arc::new(config));
            match eligibility.is_available_for_refund(&swap).await? {
                RefundAvailability::Available { unlock_height } => {
                    json!({ "refundable": true, "unlock_height": unlock_height })
                }
                RefundAvailability::Pending {
                    remaining_blocks,
                    unlock_height,
                } => json!({
                  "refundable": false,
                  "remaining_blocks": remaining_blocks,
                  "unlock_height": unlock_height,
                }),
                RefundAvailability::NotEligible => json!({ "refundable": false, "eligible": false }),
            }
        }
    };

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn swap_json(swap: &Swap) -> serde_json::Value {
    let common = swap.common();
    json!({
      "id": common.id,
      "type": swap.swap_type().as_str(),
      "status": common.status.as_str(),
      "from": common.asset_send,
      "to": common.asset_receive,
      "send_amount": common.send_amount,
      "receive_amount": common.receive_amount,
      "preimage_hash": common.preimage_hash,
      "lockup_address": swap.refund_leg().map(|leg| leg.lockup_address.clone()),
      "claim_address": swap.claim_address(),
      "lockup_tx": common.lockup_tx,
      "claim_tx": common.claim_tx,
      "refund_tx": common.refund_tx,
    })
}
