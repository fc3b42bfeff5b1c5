//! Re-orders out-of-order fetcher results, buffers gaps, watchdogs stalls,
//! and forwards strictly ordered contiguous batches to the Processor
//! (spec.md §4.4).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::fetcher::Fetcher;
use crate::models::BlockData;
use crate::processor::{ProcessBatchOutcome, Processor};

const DRAIN_WINDOW: Duration = Duration::from_millis(10);
const DRAIN_MAX_EXTRA: usize = 100;
const STALL_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct ReorgEvent {
    pub at: u64,
}

pub struct Sequencer {
    expected_block: AtomicU64,
    buffer: Mutex<BTreeMap<u64, BlockData>>,
    last_progress_at: Mutex<Instant>,
    gap_fill_count: AtomicU32,
    buffer_limit: usize,
    idle_secs_gap: u64,
    idle_secs_dead: u64,
    max_gap_fill_attempts: u32,
    fetcher: Arc<Fetcher>,
    processor: Arc<Processor>,
    reorg_tx: tokio::sync::mpsc::Sender<ReorgEvent>,
}

impl Sequencer {
    pub fn new(
        start_height: u64,
        buffer_limit: usize,
        idle_secs_gap: u64,
        idle_secs_dead: u64,
        max_gap_fill_attempts: u32,
        fetcher: Arc<Fetcher>,
        processor: Arc<Processor>,
        reorg_tx: tokio::sync::mpsc::Sender<ReorgEvent>,
    ) -> Self {
        Self {
            expected_block: AtomicU64::new(start_height),
            buffer: Mutex::new(BTreeMap::new()),
            last_progress_at: Mutex::new(Instant::now()),
            gap_fill_count: AtomicU32::new(0),
            buffer_limit,
            idle_secs_gap,
            idle_secs_dead,
            max_gap_fill_attempts,
            fetcher,
            processor,
            reorg_tx,
        }
    }

    pub fn expected_block(&self) -> u64 {
        self.expected_block.load(Ordering::SeqCst)
    }

    /// Rewinds to the common-ancestor height a deep-reorg walk-back found,
    /// clearing any buffered blocks at or above it. Called by the reorg
    /// supervisor after `Processor::handle_deep_reorg` rolls storage back
    /// further than the tip-reorg height the Sequencer already reset to.
    pub async fn resume_at(&self, resume_height: u64) {
        if resume_height >= self.expected_block() {
            return;
        }
        {
            let mut buffer = self.buffer.lock().await;
            buffer.retain(|height, _| *height < resume_height);
        }
        self.expected_block.store(resume_height, Ordering::SeqCst);
        *self.last_progress_at.lock().await = Instant::now();
    }

    async fn buffer_len(&self) -> usize {
        self.buffer.lock().await.len()
    }

    pub async fn run(
        self: Arc<Self>,
        mut results_rx: tokio::sync::mpsc::Receiver<BlockData>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let watchdog = {
            let this = Arc::clone(&self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move { this.watchdog_loop(&mut shutdown).await })
        };

        loop {
            let first = tokio::select! {
                r = results_rx.recv() => r,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                    continue;
                }
            };
            let Some(first) = first else { break };

            let mut batch = vec![first];
            let deadline = Instant::now() + DRAIN_WINDOW;
            while batch.len() < DRAIN_MAX_EXTRA {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match tokio::time::timeout(remaining, results_rx.recv()).await {
                    Ok(Some(item)) => batch.push(item),
                    _ => break,
                }
            }

            batch.sort_by_key(|b| b.number);
            self.process_drained_batch(batch).await;
        }

        watchdog.abort();
    }

    async fn process_drained_batch(&self, batch: Vec<BlockData>) {
        let expected = self.expected_block();
        let is_contiguous_from_expected = !batch.is_empty()
            && batch[0].number == expected
            && batch.iter().all(|b| b.is_ok())
            && batch.windows(2).all(|w| w[1].number == w[0].number + 1);

        if is_contiguous_from_expected {
            let prefix_len = batch.len();
            self.forward_contiguous(batch).await;
            self.expected_block.fetch_add(prefix_len as u64, Ordering::SeqCst);
            *self.last_progress_at.lock().await = Instant::now();
            return;
        }

        // Not a clean contiguous-from-expected batch: fall back to
        // per-item handling, starting with the batch head.
        let mut iter = batch.into_iter();
        if let Some(head) = iter.next() {
            self.handle_block(head).await;
        }
        for rest in iter {
            self.handle_block(rest).await;
        }
    }

    async fn forward_contiguous(&self, batch: Vec<BlockData>) {
        match self.processor.process_batch(batch).await {
            Ok(ProcessBatchOutcome::Committed) => {}
            Err(crate::error::IndexerError::ReorgError { at }) => {
                self.handle_reorg(at).await;
            }
            Err(e) => {
                error!(error = %e, "processor failed on contiguous batch");
            }
        }
    }

    async fn handle_block(&self, data: BlockData) {
        let expected = self.expected_block();

        if data.number < expected {
            return; // already processed
        }

        if !data.is_ok() {
            // Single-block retry: re-hit the pool directly before giving up.
            if let Some(block) = self.fetcher.single_block_retry(data.number).await {
                self.handle_block(block).await;
                return;
            }
            self.buffer.lock().await.insert(data.number, data);
            return;
        }

        if data.number == expected {
            match self.processor.process_batch(vec![data]).await {
                Ok(ProcessBatchOutcome::Committed) => {
                    self.expected_block.fetch_add(1, Ordering::SeqCst);
                    *self.last_progress_at.lock().await = Instant::now();
                    self.drain_buffer_prefix().await;
                }
                Err(crate::error::IndexerError::ReorgError { at }) => {
                    self.handle_reorg(at).await;
                }
                Err(e) => {
                    error!(error = %e, "processor failed on single block");
                }
            }
            return;
        }

        // height > expected: buffer it.
        let mut buffer = self.buffer.lock().await;
        buffer.insert(data.number, data);
        let len = buffer.len();
        drop(buffer);

        if len > self.buffer_limit {
            self.force_skip_to_min_buffered().await;
        }
    }

    /// After an in-order block commits, opportunistically drain any
    /// now-contiguous prefix sitting in the buffer.
    async fn drain_buffer_prefix(&self) {
        loop {
            let expected = self.expected_block();
            let next = {
                let mut buffer = self.buffer.lock().await;
                buffer.remove(&expected)
            };
            let Some(data) = next else { return };
            match self.processor.process_batch(vec![data]).await {
                Ok(ProcessBatchOutcome::Committed) => {
                    self.expected_block.fetch_add(1, Ordering::SeqCst);
                    *self.last_progress_at.lock().await = Instant::now();
                }
                Err(crate::error::IndexerError::ReorgError { at }) => {
                    self.handle_reorg(at).await;
                    return;
                }
                Err(e) => {
                    error!(error = %e, "processor failed draining buffer prefix");
                    return;
                }
            }
        }
    }

    async fn force_skip_to_min_buffered(&self) {
        let min_buffered = {
            let buffer = self.buffer.lock().await;
            buffer.keys().next().copied()
        };
        if let Some(min) = min_buffered {
            warn!(
                buffer_len = self.buffer_len().await,
                limit = self.buffer_limit,
                skip_to = min,
                "sequencer buffer over limit, forcibly skipping to minimum buffered height, replay required"
            );
            self.expected_block.store(min, Ordering::SeqCst);
            *self.last_progress_at.lock().await = Instant::now();
            self.drain_buffer_prefix().await;
        }
    }

    async fn handle_reorg(&self, at: u64) {
        warn!(at, "reorg detected, pausing fetcher and resetting sequencer to fork point");
        self.fetcher.pause();
        {
            let mut buffer = self.buffer.lock().await;
            buffer.retain(|height, _| *height < at);
        }
        self.expected_block.store(at, Ordering::SeqCst);
        *self.last_progress_at.lock().await = Instant::now();

        // Non-blocking send with drop-and-log default, per spec.md §5
        // deadlock-avoidance rules: fatal reports never stall the main loop.
        match self.reorg_tx.try_send(ReorgEvent { at }) {
            Ok(()) => {}
            Err(_) => warn!(at, "reorg channel full or closed; dropping reorg notification"),
        }
    }

    async fn watchdog_loop(&self, shutdown: &mut tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(STALL_CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { return; }
                    continue;
                }
            }
            self.check_stall().await;
        }
    }

    async fn check_stall(&self) {
        let idle = self.last_progress_at.lock().await.elapsed();
        let buffer_has_items = self.buffer_len().await > 0;
        let expected = self.expected_block();
        let expected_present = self.buffer.lock().await.contains_key(&expected);

        if idle >= Duration::from_secs(self.idle_secs_gap) && buffer_has_items && !expected_present {
            let gap_end = {
                let buffer = self.buffer.lock().await;
                buffer.keys().next().map(|min| min.saturating_sub(1))
            };
            if let Some(gap_end) = gap_end {
                if gap_end >= expected {
                    info!(expected, gap_end, "stall watchdog: scheduling gap refetch");
                    self.fetcher.schedule(expected, gap_end).await;
                    let attempts = self.gap_fill_count.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempts >= self.max_gap_fill_attempts {
                        self.force_gap_bypass().await;
                    }
                }
            }
            return;
        }

        if idle >= Duration::from_secs(self.idle_secs_dead) && !buffer_has_items {
            // last_progress_at is reset BEFORE the buffer lock is touched,
            // to prevent the reset itself from immediately re-triggering
            // this branch (spec.md §5).
            *self.last_progress_at.lock().await = Instant::now();
            let new_expected = self.expected_block.fetch_add(1, Ordering::SeqCst) + 1;
            error!(new_expected, "stall watchdog: downstream stuck with empty buffer, force-advancing expected block");
        }
    }

    async fn force_gap_bypass(&self) {
        let min_buffered = {
            let buffer = self.buffer.lock().await;
            buffer.keys().next().copied()
        };
        if let Some(min) = min_buffered {
            *self.last_progress_at.lock().await = Instant::now();
            self.expected_block.store(min, Ordering::SeqCst);
            self.gap_fill_count.store(0, Ordering::SeqCst);
            error!(new_expected = min, "forced gap bypass: blocks will be missing, replay required");
        }
    }
}

/// Owns the `reorg_tx` receiver `Sequencer::handle_reorg` reports into:
/// invokes the deep-reorg walk-back, rewinds the Sequencer to the common
/// ancestor it finds, and resumes the fetcher (spec.md §4.4(d), §8 "Reorg at
/// tip"). Without this task the fetcher stays paused forever after a tip
/// reorg, since nothing else ever calls `Fetcher::resume`.
pub async fn run_reorg_supervisor(
    mut reorg_rx: tokio::sync::mpsc::Receiver<ReorgEvent>,
    processor: Arc<Processor>,
    sequencer: Arc<Sequencer>,
    fetcher: Arc<Fetcher>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            e = reorg_rx.recv() => e,
            _ = shutdown.changed() => {
                if *shutdown.borrow() { return; }
                continue;
            }
        };
        let Some(event) = event else { return };

        match processor.handle_deep_reorg(event.at).await {
            Ok(ancestor) => {
                sequencer.resume_at(ancestor + 1).await;
                info!(at = event.at, ancestor, "deep reorg recovered, resuming fetcher");
            }
            Err(e) => {
                error!(at = event.at, error = %e, "deep reorg recovery failed, resuming fetcher anyway to avoid a permanent stall");
            }
        }
        fetcher.resume();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Block;
    use alloy::primitives::B256;

    fn make_block(number: u64) -> Block {
        Block {
            number,
            hash: B256::with_last_byte(number as u8),
            parent_hash: B256::with_last_byte((number.saturating_sub(1)) as u8),
            timestamp: 0,
            gas_limit: 0,
            gas_used: 0,
            base_fee_per_gas: None,
            tx_count: 0,
        }
    }

    #[test]
    fn contiguity_check_accepts_strictly_increasing_no_error_batch() {
        let data: Vec<BlockData> = (100..=103).map(|n| BlockData::ok(n, make_block(n), vec![], vec![])).collect();
        assert!(data[0].number == 100);
        assert!(data.windows(2).all(|w| w[1].number == w[0].number + 1));
        assert!(data.iter().all(|b| b.is_ok()));
    }

    #[test]
    fn out_of_order_batch_is_not_contiguous() {
        let data = vec![
            BlockData::ok(102, make_block(102), vec![], vec![]),
            BlockData::ok(100, make_block(100), vec![], vec![]),
        ];
        let mut sorted = data.clone();
        sorted.sort_by_key(|b| b.number);
        assert!(!sorted.windows(2).all(|w| w[1].number == w[0].number + 1));
    }
}
