//! Extracts transfer activity from ordered block batches, detects reorgs,
//! and hands off persistence tasks to the Orchestrator (spec.md §4.5).

use alloy::primitives::{Address, B256};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::async_writer::{self, AsyncWriter};
use crate::command::Command;
use crate::error::{IndexerError, Result};
use crate::height_oracle::HeightOracle;
use crate::models::{
    Block, BlockData, PersistTask, Transfer, TransferType, TxSummary, SYNTHETIC_DEPLOY_LOG_INDEX_BASE,
    SYNTHETIC_ETH_TRANSFER_LOG_INDEX_BASE, TRANSFER_EVENT_SIGNATURE,
};
use crate::rpc::RpcPool;
use crate::storage::Storage;

const DEEP_REORG_SCAN_CAP: u64 = 1000;
const RETRY_BACKOFFS: [Duration; 3] = [Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)];
const RETRY_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessBatchOutcome {
    Committed,
}

fn is_watched(addr: Address, watched: &[Address]) -> bool {
    watched.is_empty() || watched.iter().any(|w| *w == addr)
}

/// Step 3 of spec.md §4.5: ERC-20 `Transfer` logs. Returns the extracted
/// transfers plus the set of transaction hashes that already have a real
/// log, so the transaction-fallback pass (step 4) can skip them.
fn extract_log_transfers(block_height: u64, logs: &[alloy::rpc::types::Log], watched: &[Address]) -> (Vec<Transfer>, HashSet<B256>) {
    let mut transfers = Vec::new();
    let mut tx_with_real_logs = HashSet::new();

    for log in logs {
        if !is_watched(log.address(), watched) {
            continue;
        }
        let topics = log.topics();
        if topics.is_empty() || topics[0] != TRANSFER_EVENT_SIGNATURE || topics.len() < 3 {
            continue;
        }
        let from = Address::from_word(topics[1]);
        let to = Address::from_word(topics[2]);
        let amount = alloy::primitives::U256::from_be_slice(log.data().as_ref());

        let Some(tx_hash) = log.transaction_hash else { continue };
        let log_index = log.log_index.unwrap_or_default() as i64;

        tx_with_real_logs.insert(tx_hash);
        transfers.push(Transfer {
            block_height,
            tx_hash,
            log_index,
            from,
            to: Some(to),
            amount,
            token_address: Some(log.address()),
            symbol: None,
            transfer_type: TransferType::Erc20,
        });
    }

    (transfers, tx_with_real_logs)
}

/// Step 4 of spec.md §4.5: the transaction-level fallback for activity that
/// never emits an ERC-20 log — contract creations and plain native-value
/// transfers.
fn extract_synthetic_transfers(block_height: u64, transactions: &[TxSummary], watched: &[Address], tx_with_real_logs: &HashSet<B256>) -> Vec<Transfer> {
    let mut transfers = Vec::new();
    let mut deploy_idx: i64 = 0;
    let mut eth_idx: i64 = 0;

    for tx in transactions {
        if tx_with_real_logs.contains(&tx.hash) {
            continue;
        }

        if tx.is_contract_creation {
            transfers.push(Transfer {
                block_height,
                tx_hash: tx.hash,
                log_index: SYNTHETIC_DEPLOY_LOG_INDEX_BASE + deploy_idx,
                from: tx.from,
                to: None,
                amount: tx.value,
                token_address: None,
                symbol: None,
                transfer_type: TransferType::Deploy,
            });
            deploy_idx += 1;
            continue;
        }

        let Some(to) = tx.to else { continue };
        if tx.value.is_zero() || !is_watched(to, watched) {
            continue;
        }

        transfers.push(Transfer {
            block_height,
            tx_hash: tx.hash,
            log_index: SYNTHETIC_ETH_TRANSFER_LOG_INDEX_BASE + eth_idx,
            from: tx.from,
            to: Some(to),
            amount: tx.value,
            token_address: None,
            symbol: None,
            transfer_type: TransferType::EthTransfer,
        });
        eth_idx += 1;
    }

    transfers
}

pub struct Processor {
    store: Arc<Storage>,
    pool: Arc<RpcPool>,
    height_oracle: Arc<HeightOracle>,
    cmd_tx: mpsc::Sender<Command>,
    writer: Arc<AsyncWriter>,
    watched_tokens: Vec<Address>,
    dispatch_reply_timeout: Duration,
    retry_tx: mpsc::Sender<(PersistTask, u32)>,
    retry_rx: tokio::sync::Mutex<Option<mpsc::Receiver<(PersistTask, u32)>>>,
    token_enrich_tx: mpsc::Sender<Address>,
}

impl Processor {
    pub fn new(
        store: Arc<Storage>,
        pool: Arc<RpcPool>,
        height_oracle: Arc<HeightOracle>,
        cmd_tx: mpsc::Sender<Command>,
        writer: Arc<AsyncWriter>,
        watched_tokens: Vec<Address>,
        dispatch_reply_timeout: Duration,
        token_enrich_tx: mpsc::Sender<Address>,
    ) -> Self {
        let (retry_tx, retry_rx) = mpsc::channel(RETRY_QUEUE_CAPACITY);
        Self {
            store,
            pool,
            height_oracle,
            cmd_tx,
            writer,
            watched_tokens,
            dispatch_reply_timeout,
            retry_tx,
            retry_rx: tokio::sync::Mutex::new(Some(retry_rx)),
            token_enrich_tx,
        }
    }

    /// Spawns the bounded retry worker that drains transiently-failed
    /// persist dispatches with exponential backoff `{1s, 2s, 4s}`
    /// (spec.md §4.5 "Retry worker"). Fatal errors never reach this queue.
    pub fn spawn_retry_worker(self: &Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        let mut rx = this
            .retry_rx
            .try_lock()
            .expect("retry receiver taken exactly once at startup")
            .take()
            .expect("retry receiver already taken");
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    n = rx.recv() => n,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { return; }
                        continue;
                    }
                };
                let Some((task, attempt)) = next else { return };
                let backoff = RETRY_BACKOFFS.get(attempt as usize).copied().unwrap_or(*RETRY_BACKOFFS.last().unwrap());
                tokio::time::sleep(backoff).await;

                match this.dispatch_commit(task.clone()).await {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => {
                        error!(height = task.height, error = %e, "persist retry hit a fatal error, dropping");
                    }
                    Err(e) => {
                        let next_attempt = attempt + 1;
                        if next_attempt as usize >= RETRY_BACKOFFS.len() {
                            error!(height = task.height, error = %e, "persist retry exhausted, block will require replay");
                        } else if this.retry_tx.try_send((task, next_attempt)).is_err() {
                            error!(height = task.height, "persist retry queue full, dropping");
                        }
                    }
                }
            }
        })
    }

    /// Processes an ordered, contiguous batch of blocks the Sequencer
    /// guarantees are already gap-free (spec.md §4.4/§4.5).
    pub async fn process_batch(&self, batch: Vec<BlockData>) -> Result<ProcessBatchOutcome> {
        for data in batch {
            self.process_one(data).await?;
        }
        Ok(ProcessBatchOutcome::Committed)
    }

    async fn process_one(&self, data: BlockData) -> Result<()> {
        let block = data.block.expect("Sequencer only forwards BlockData::is_ok() entries");
        let logs = data.logs.unwrap_or_default();
        let transactions = data.transactions.unwrap_or_default();

        self.check_reorg(&block).await?;

        if !block.passes_guards() {
            return Err(IndexerError::SchemaViolation(format!(
                "block {} failed parent-hash guards (hash={}, parent_hash={})",
                block.number, block.hash, block.parent_hash
            )));
        }

        let (mut transfers, tx_with_real_logs) = extract_log_transfers(block.number, &logs, &self.watched_tokens);
        transfers.extend(extract_synthetic_transfers(block.number, &transactions, &self.watched_tokens, &tx_with_real_logs));

        let sequence = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u128;
        let transfer_count = transfers.len() as u64;
        let token_addresses: Vec<Address> = transfers.iter().filter_map(|t| t.token_address).collect();
        let task = PersistTask::new(block.clone(), transfers, sequence);

        self.dispatch_commit(task.clone()).await.or_else(|e| {
            if e.is_fatal() {
                return Err(e);
            }
            if self.retry_tx.try_send((task, 0)).is_err() {
                warn!(height = block.number, "persist retry queue full on first failure, dropping");
            }
            Ok(())
        })?;

        self.height_oracle.set_indexed_head(block.number);
        let _ = self.cmd_tx.try_send(Command::IncrementTransfers(transfer_count));
        self.feed_token_enricher(token_addresses);

        Ok(())
    }

    /// Feeds every token address seen in this block to the background
    /// enricher (SPEC_FULL.md §4.5 supplement). Best-effort: a full channel
    /// just means this sighting is skipped and the token gets picked up on
    /// its next transfer.
    fn feed_token_enricher(&self, token_addresses: Vec<Address>) {
        for addr in token_addresses {
            let _ = self.token_enrich_tx.try_send(addr);
        }
    }

    async fn check_reorg(&self, block: &Block) -> Result<()> {
        if block.number == 0 {
            return Ok(());
        }
        match self.store.block_hash_at(block.number - 1).await? {
            Some(committed_parent_hash) if committed_parent_hash != block.parent_hash => Err(IndexerError::ReorgError { at: block.number }),
            _ => Ok(()),
        }
    }

    /// Hands the task to the AsyncWriter's physical-commit queue and tells
    /// the Orchestrator about it via `Command::CommitBatch`, so the logical
    /// cursor advances immediately while the durable write happens on its
    /// own schedule (spec.md §4.5 "decouples logical processing from
    /// physical commit"). Bounded by `dispatch_reply_timeout` so a stalled
    /// downstream never blocks the pipeline indefinitely.
    async fn dispatch_commit(&self, task: PersistTask) -> Result<()> {
        tokio::time::timeout(self.dispatch_reply_timeout, async_writer::enqueue(&self.writer, task.clone()))
            .await
            .map_err(|_| IndexerError::StoreUnreachable("async writer queue did not accept the task in time".into()))?
            .map_err(|_| IndexerError::StoreUnreachable("async writer queue closed".into()))?;

        tokio::time::timeout(self.dispatch_reply_timeout, self.cmd_tx.send(Command::CommitBatch(task)))
            .await
            .map_err(|_| IndexerError::StoreUnreachable("orchestrator command queue did not accept CommitBatch in time".into()))?
            .map_err(|_| IndexerError::StoreUnreachable("orchestrator command queue closed".into()))
    }

    /// Walks backward from `height - 1`, comparing RPC block hashes against
    /// the store, until it finds a common ancestor (capped at 1000 blocks
    /// back). Rolls back everything above the ancestor in one transaction
    /// and rewinds the checkpoint, returning the safe resume height
    /// (spec.md §4.5 "Deep reorg recovery").
    pub async fn handle_deep_reorg(&self, height: u64) -> Result<u64> {
        let floor = height.saturating_sub(DEEP_REORG_SCAN_CAP);
        let mut cursor = height.saturating_sub(1);

        loop {
            let Some((rpc_block, _)) = self.pool.block_by_number(cursor).await? else {
                return Err(IndexerError::DeepReorgNotFound { at: height, scanned: height - cursor });
            };
            let stored_hash = self.store.block_hash_at(cursor).await?;

            if stored_hash == Some(rpc_block.hash) {
                self.store.rollback_from(cursor + 1).await?;
                self.store.reset_checkpoint(cursor).await?;
                warn!(ancestor = cursor, reorg_at = height, "deep reorg recovered, rolled back to common ancestor");
                let _ = self.cmd_tx.try_send(Command::ResetCursor(cursor));
                return Ok(cursor);
            }

            if cursor <= floor || cursor == 0 {
                return Err(IndexerError::DeepReorgNotFound { at: height, scanned: height - floor });
            }
            cursor -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{address, U256};

    fn watched_token() -> Address {
        address!("1111111111111111111111111111111111111111")
    }

    fn transfer_log(token: Address, from: Address, to: Address, amount: U256, tx_hash: B256, log_index: u64) -> alloy::rpc::types::Log {
        let inner = alloy::primitives::Log::new_unchecked(
            token,
            vec![TRANSFER_EVENT_SIGNATURE, from.into_word(), to.into_word()],
            amount.to_be_bytes_vec().into(),
        );
        alloy::rpc::types::Log {
            inner,
            transaction_hash: Some(tx_hash),
            log_index: Some(log_index),
            ..Default::default()
        }
    }

    #[test]
    fn extracts_erc20_transfer_from_matching_log() {
        let token = watched_token();
        let from = address!("2222222222222222222222222222222222222222");
        let to = address!("3333333333333333333333333333333333333333");
        let log = transfer_log(token, from, to, U256::from(1000u64), B256::repeat_byte(7), 0);

        let (transfers, seen) = extract_log_transfers(100, &[log], &[token]);
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].from, from);
        assert_eq!(transfers[0].to, Some(to));
        assert_eq!(transfers[0].amount, U256::from(1000u64));
        assert_eq!(transfers[0].transfer_type, TransferType::Erc20);
        assert!(seen.contains(&B256::repeat_byte(7)));
    }

    #[test]
    fn unwatched_token_log_is_skipped() {
        let token = address!("5555555555555555555555555555555555555555");
        let from = address!("2222222222222222222222222222222222222222");
        let to = address!("3333333333333333333333333333333333333333");
        let log = transfer_log(token, from, to, U256::from(1u64), B256::repeat_byte(1), 0);

        let (transfers, _) = extract_log_transfers(100, &[log], &[watched_token()]);
        assert!(transfers.is_empty());
    }

    #[test]
    fn contract_creation_yields_deploy_transfer() {
        let from = address!("2222222222222222222222222222222222222222");
        let tx = TxSummary { hash: B256::repeat_byte(9), from, to: None, value: U256::ZERO, is_contract_creation: true };

        let transfers = extract_synthetic_transfers(100, &[tx], &[], &HashSet::new());
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].transfer_type, TransferType::Deploy);
        assert_eq!(transfers[0].log_index, SYNTHETIC_DEPLOY_LOG_INDEX_BASE);
        assert!(transfers[0].to.is_none());
    }

    #[test]
    fn nonzero_native_transfer_without_log_yields_eth_transfer() {
        let from = address!("2222222222222222222222222222222222222222");
        let to = address!("3333333333333333333333333333333333333333");
        let tx = TxSummary { hash: B256::repeat_byte(10), from, to: Some(to), value: U256::from(500u64), is_contract_creation: false };

        let transfers = extract_synthetic_transfers(100, &[tx], &[], &HashSet::new());
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].transfer_type, TransferType::EthTransfer);
        assert_eq!(transfers[0].log_index, SYNTHETIC_ETH_TRANSFER_LOG_INDEX_BASE);
    }

    #[test]
    fn tx_with_real_log_is_not_duplicated_as_synthetic() {
        let from = address!("2222222222222222222222222222222222222222");
        let to = address!("3333333333333333333333333333333333333333");
        let tx_hash = B256::repeat_byte(11);
        let tx = TxSummary { hash: tx_hash, from, to: Some(to), value: U256::from(500u64), is_contract_creation: false };

        let mut seen = HashSet::new();
        seen.insert(tx_hash);
        let transfers = extract_synthetic_transfers(100, &[tx], &[], &seen);
        assert!(transfers.is_empty());
    }

    #[test]
    fn zero_value_transfer_to_unwatched_recipient_is_not_synthesized() {
        let from = address!("2222222222222222222222222222222222222222");
        let to = address!("3333333333333333333333333333333333333333");
        let tx = TxSummary { hash: B256::repeat_byte(12), from, to: Some(to), value: U256::ZERO, is_contract_creation: false };

        let transfers = extract_synthetic_transfers(100, &[tx], &[], &HashSet::new());
        assert!(transfers.is_empty());
    }

    #[test]
    fn retry_backoff_schedule_has_three_steps() {
        assert_eq!(RETRY_BACKOFFS.len(), 3);
        assert_eq!(RETRY_BACKOFFS[0], Duration::from_secs(1));
        assert_eq!(RETRY_BACKOFFS[2], Duration::from_secs(4));
    }
}
