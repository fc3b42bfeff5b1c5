//! Core entities: blocks, transfers, checkpoints, and the orchestrator's
//! single-source-of-truth state record.

use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Synthetic transfers use a disjoint log-index space so they never collide
/// with a real log's index within the same block.
pub const SYNTHETIC_DEPLOY_LOG_INDEX_BASE: i64 = 10_000;
pub const SYNTHETIC_ETH_TRANSFER_LOG_INDEX_BASE: i64 = 20_000;

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_EVENT_SIGNATURE: B256 = alloy::primitives::b256!(
    "ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
);

pub const MULTICALL3_ADDRESS: Address = alloy::primitives::address!("ca11bde05977b3631167028862be2a173976ca11");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: i64,
    pub gas_limit: i64,
    pub gas_used: i64,
    pub base_fee_per_gas: Option<U256>,
    pub tx_count: i32,
}

impl Block {
    /// Guards from spec.md §4.5 step 2: a block must not be its own parent,
    /// and the parent hash must not be the all-zero sentinel unless this is
    /// the genesis block (height 0).
    pub fn passes_guards(&self) -> bool {
        if self.hash == self.parent_hash {
            return false;
        }
        if self.number > 0 && self.parent_hash == B256::ZERO {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferType {
    Erc20,
    Deploy,
    EthTransfer,
}

impl TransferType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferType::Erc20 => "ERC20",
            TransferType::Deploy => "DEPLOY",
            TransferType::EthTransfer => "ETH_TRANSFER",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub block_height: u64,
    pub tx_hash: B256,
    pub log_index: i64,
    pub from: Address,
    pub to: Option<Address>,
    pub amount: U256,
    pub token_address: Option<Address>,
    pub symbol: Option<String>,
    pub transfer_type: TransferType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub chain_id: i64,
    pub last_synced_block: u64,
    pub updated_at: DateTime<Utc>,
}

/// The orchestrator's operating mode, driven purely from observed state
/// (never set directly by a caller).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemState {
    Unknown,
    Running,
    Optimizing,
    Throttled,
    Stalled,
    Degraded,
}

impl Default for SystemState {
    fn default() -> Self {
        SystemState::Unknown
    }
}

/// The SSOT record owned exclusively by the Orchestrator's event loop.
/// Readers only ever see a cloned snapshot of this struct, never a live
/// reference (spec.md §9 "Single-writer state ↔ many readers").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorState {
    pub latest_chain_height: u64,
    pub target_height: u64,
    pub fetched_height: u64,
    pub synced_cursor: u64,
    pub transfers_total: u64,
    pub is_eco_mode: bool,
    pub system_state: SystemState,
    pub safety_buffer: u32,
    pub last_user_activity: Option<DateTime<Utc>>,
    pub jobs_depth: usize,
    pub results_depth: usize,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_log_event: Option<String>,
}

impl CoordinatorState {
    pub const MIN_SAFETY_BUFFER: u32 = 1;
    pub const MAX_SAFETY_BUFFER: u32 = 20;
    pub const DEFAULT_DRIFT_TOLERANCE: u64 = 5;

    pub fn recompute_target(&mut self) {
        self.target_height = self
            .latest_chain_height
            .saturating_sub(self.safety_buffer as u64);
    }
}

/// The hand-off unit between logical processing (Processor) and physical
/// commit (AsyncWriter).
#[derive(Debug, Clone)]
pub struct PersistTask {
    pub height: u64,
    pub block: Block,
    pub transfers: Vec<Transfer>,
    /// Monotonic nanosecond timestamp, used only for tracing/ordering
    /// diagnostics, never for correctness decisions.
    pub sequence: u128,
}

impl PersistTask {
    pub fn new(block: Block, transfers: Vec<Transfer>, sequence: u128) -> Self {
        Self {
            height: block.number,
            block,
            transfers,
            sequence,
        }
    }
}

/// A transaction's fields relevant to the synthetic-transfer fallback path
/// (spec.md §4.5 step 4): contract creations and non-zero-value native
/// transfers that have no matching ERC-20 log.
#[derive(Debug, Clone)]
pub struct TxSummary {
    pub hash: B256,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub is_contract_creation: bool,
}

/// Raw fetch result, possibly carrying an error so the Sequencer can see and
/// react to per-job failures without the Fetcher terminating a worker.
#[derive(Debug, Clone)]
pub struct BlockData {
    pub number: u64,
    pub block: Option<Block>,
    pub logs: Option<Vec<alloy::rpc::types::Log>>,
    pub transactions: Option<Vec<TxSummary>>,
    pub err: Option<String>,
}

impl BlockData {
    pub fn ok(number: u64, block: Block, logs: Vec<alloy::rpc::types::Log>, transactions: Vec<TxSummary>) -> Self {
        Self { number, block: Some(block), logs: Some(logs), transactions: Some(transactions), err: None }
    }

    pub fn error(number: u64, err: impl std::fmt::Display) -> Self {
        Self { number, block: None, logs: None, transactions: None, err: Some(err.to_string()) }
    }

    pub fn is_ok(&self) -> bool {
        self.err.is_none() && self.block.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct RpcNodeConfig {
    pub url: String,
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFile {
    pub height: u64,
    pub timestamp: DateTime<Utc>,
    pub state_snapshot: CoordinatorState,
    pub sha256_checksum: String,
    pub format_version: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_parent_hash_zero_is_allowed() {
        let genesis = Block {
            number: 0,
            hash: B256::repeat_byte(1),
            parent_hash: B256::ZERO,
            timestamp: 0,
            gas_limit: 0,
            gas_used: 0,
            base_fee_per_gas: None,
            tx_count: 0,
        };
        assert!(genesis.passes_guards());
    }

    #[test]
    fn non_genesis_zero_parent_hash_is_rejected() {
        let b = Block {
            number: 5,
            hash: B256::repeat_byte(2),
            parent_hash: B256::ZERO,
            timestamp: 0,
            gas_limit: 0,
            gas_used: 0,
            base_fee_per_gas: None,
            tx_count: 0,
        };
        assert!(!b.passes_guards());
    }

    #[test]
    fn self_parent_hash_is_rejected() {
        let h = B256::repeat_byte(3);
        let b = Block {
            number: 5,
            hash: h,
            parent_hash: h,
            timestamp: 0,
            gas_limit: 0,
            gas_used: 0,
            base_fee_per_gas: None,
            tx_count: 0,
        };
        assert!(!b.passes_guards());
    }

    #[test]
    fn recompute_target_saturates_at_zero() {
        let mut s = CoordinatorState {
            latest_chain_height: 3,
            safety_buffer: 10,
            ..Default::default()
        };
        s.recompute_target();
        assert_eq!(s.target_height, 0);
    }
}
