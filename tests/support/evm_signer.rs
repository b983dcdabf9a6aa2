use std::sync::Mutex;

use alloy::primitives::{Address, B256, Bytes, TxHash, U256};
use alloy::rpc::types::TransactionRequest;
use alloy::sol;
use alloy::sol_types::SolCall as _;

use lds_swap::evm::EvmSigner;
use lds_swap::{Error, Result};

sol! {
    interface IERC20 {
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendKind {
    Transaction,
    Raw,
}

#[derive(Debug, Clone)]
pub struct Sent {
    pub kind: SendKind,
    pub hash: TxHash,
    pub tx: TransactionRequest,
}

impl Sent {
    pub fn input(&self) -> Bytes {
        self.tx.input.input().cloned().unwrap_or_default()
    }
}

#[derive(Default)]
struct State {
    allowance: U256,
    sent: Vec<Sent>,
    mined: Vec<TxHash>,
    calls: usize,
    revert_reason: Option<String>,
}

/// Records every request; ERC20 allowance follows the approvals it sees.
pub struct MockSigner {
    address: Address,
    state: Mutex<State>,
}

impl MockSigner {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("signer state mutex poisoned")
    }

    pub fn set_allowance(&self, allowance: U256) {
        self.state().allowance = allowance;
    }

    pub fn allowance(&self) -> U256 {
        self.state().allowance
    }

    /// Every simulated call reverts from now on.
    pub fn revert_calls(&self, reason: &str) {
        self.state().revert_reason = Some(reason.to_string());
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.state().sent.clone()
    }

    pub fn mined(&self) -> Vec<TxHash> {
        self.state().mined.clone()
    }

    pub fn calls(&self) -> usize {
        self.state().calls
    }

    fn record(&self, kind: SendKind, tx: TransactionRequest) -> TxHash {
        let mut state = self.state();
        let input = tx.input.input().cloned().unwrap_or_default();
        if let Ok(approve) = IERC20::approveCall::abi_decode(&input) {
            state.allowance = approve.amount;
        }
        let hash = B256::with_last_byte(u8::try_from(state.sent.len() + 1).unwrap_or(u8::MAX));
        state.sent.push(Sent { kind, hash, tx });
        hash
    }
}

impl EvmSigner for MockSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn call(&self, tx: TransactionRequest) -> Result<Bytes> {
        let mut state = self.state();
        state.calls += 1;
        let input = tx.input.input().cloned().unwrap_or_default();
        if input.starts_with(&IERC20::allowanceCall::SELECTOR) {
            return Ok(Bytes::from(state.allowance.to_be_bytes::<32>().to_vec()));
        }
        if let Some(reason) = &state.revert_reason {
            return Err(Error::ChainInteraction {
                contract: "mock".into(),
                function: "eth_call",
                reason: reason.clone(),
            });
        }
        Ok(Bytes::new())
    }

    async fn send_transaction(&self, tx: TransactionRequest) -> Result<TxHash> {
        Ok(self.record(SendKind::Transaction, tx))
    }

    async fn send_raw_transaction(&self, tx: TransactionRequest) -> Result<TxHash> {
        Ok(self.record(SendKind::Raw, tx))
    }

    async fn wait_mined(&self, hash: TxHash) -> Result<()> {
        self.state().mined.push(hash);
        Ok(())
    }
}
