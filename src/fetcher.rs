//! Fan-out workers that drain a bounded queue of `(start, end)` range jobs,
//! call the RPC pool for blocks + logs, and publish results on a bounded
//! output channel (spec.md §4.3).

use alloy::rpc::types::Filter;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::debug;

use crate::command::{Command, FetchFailKind};
use crate::models::{BlockData, TRANSFER_EVENT_SIGNATURE};
use crate::rpc::RpcPool;

/// Bounded FIFO queue with async-friendly backpressure. Grounded on
/// spec.md §4.3's "Input queue capacity ~= concurrency x 10"; implemented
/// directly (rather than a raw mpsc channel) so `queue_depth()` and
/// `clear_jobs()` are cheap, exact operations rather than approximations.
struct JobQueue {
    capacity: usize,
    items: Mutex<VecDeque<(u64, u64)>>,
    space_available: Notify,
    item_available: Notify,
}

impl JobQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Mutex::new(VecDeque::new()),
            space_available: Notify::new(),
            item_available: Notify::new(),
        }
    }

    async fn push(&self, job: (u64, u64)) {
        loop {
            {
                let mut items = self.items.lock().await;
                if items.len() < self.capacity {
                    items.push_back(job);
                    self.item_available.notify_one();
                    return;
                }
            }
            self.space_available.notified().await;
        }
    }

    async fn pop(&self) -> (u64, u64) {
        loop {
            {
                let mut items = self.items.lock().await;
                if let Some(job) = items.pop_front() {
                    self.space_available.notify_one();
                    return job;
                }
            }
            self.item_available.notified().await;
        }
    }

    async fn depth(&self) -> usize {
        self.items.lock().await.len()
    }

    async fn clear(&self) {
        let mut items = self.items.lock().await;
        items.clear();
        self.space_available.notify_waiters();
    }
}

pub struct Fetcher {
    jobs: Arc<JobQueue>,
    results_tx: tokio::sync::mpsc::Sender<BlockData>,
    results_rx: Mutex<Option<tokio::sync::mpsc::Receiver<BlockData>>>,
    pool: Arc<RpcPool>,
    paused: watch::Sender<bool>,
    header_only: Arc<AtomicBool>,
    watched_tokens: Vec<alloy::primitives::Address>,
    cmd_tx: mpsc::Sender<Command>,
}

impl Fetcher {
    pub fn new(
        pool: Arc<RpcPool>,
        concurrency: usize,
        results_capacity: usize,
        watched_tokens: Vec<alloy::primitives::Address>,
        cmd_tx: mpsc::Sender<Command>,
    ) -> Self {
        let (results_tx, results_rx) = tokio::sync::mpsc::channel(results_capacity);
        let (paused_tx, _paused_rx) = watch::channel(false);
        Self {
            jobs: Arc::new(JobQueue::new(concurrency * 10)),
            results_tx,
            results_rx: Mutex::new(Some(results_rx)),
            pool,
            paused: paused_tx,
            header_only: Arc::new(AtomicBool::new(false)),
            watched_tokens,
            cmd_tx,
        }
    }

    pub async fn schedule(&self, start: u64, end: u64) {
        self.jobs.push((start, end)).await;
    }

    pub async fn queue_depth(&self) -> usize {
        self.jobs.depth().await
    }

    pub fn results_depth(&self) -> usize {
        // capacity - available permits gives occupied slots, a cheap
        // approximation good enough for backpressure decisions.
        self.results_tx.max_capacity() - self.results_tx.capacity()
    }

    pub async fn clear_jobs(&self) {
        self.jobs.clear().await;
    }

    /// Idempotent: calling pause() on an already-paused fetcher is a no-op.
    pub fn pause(&self) {
        let _ = self.paused.send_if_modified(|p| {
            if *p {
                false
            } else {
                *p = true;
                true
            }
        });
    }

    /// Idempotent; uses a `watch` channel rather than a one-shot channel or
    /// a `Notify` so a resume sent before a worker starts waiting is never
    /// lost (spec.md §5 "Deadlock-avoidance rules").
    pub fn resume(&self) {
        let _ = self.paused.send_if_modified(|p| {
            if *p {
                *p = false;
                true
            } else {
                false
            }
        });
    }

    pub fn set_header_only(&self, header_only: bool) {
        self.header_only.store(header_only, Ordering::Relaxed);
    }

    pub fn take_results_receiver(&self) -> tokio::sync::mpsc::Receiver<BlockData> {
        self.results_rx
            .try_lock()
            .expect("results receiver taken exactly once at startup")
            .take()
            .expect("results receiver already taken")
    }

    /// Spawns `concurrency` worker tasks. Each worker runs until the
    /// `shutdown` signal fires; context cancellation is the only way a
    /// worker exits (spec.md §4.3 "Only context cancellation or an explicit
    /// stop exits a worker").
    pub fn spawn_workers(self: &Arc<Self>, concurrency: usize, shutdown: tokio::sync::watch::Receiver<bool>) -> Vec<tokio::task::JoinHandle<()>> {
        (0..concurrency)
            .map(|id| {
                let this = Arc::clone(self);
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    this.worker_loop(id, &mut shutdown).await;
                })
            })
            .collect()
    }

    async fn worker_loop(&self, id: usize, shutdown: &mut tokio::sync::watch::Receiver<bool>) {
        let mut paused_rx = self.paused.subscribe();
        loop {
            if *shutdown.borrow() {
                return;
            }

            if *paused_rx.borrow() {
                tokio::select! {
                    _ = paused_rx.changed() => continue,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { return; }
                    }
                }
                continue;
            }

            let job = tokio::select! {
                job = self.jobs.pop() => job,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { return; }
                    continue;
                }
            };

            self.run_job(id, job).await;
        }
    }

    async fn run_job(&self, worker_id: usize, (start, end): (u64, u64)) {
        debug!(worker_id, start, end, "fetcher worker picked up range job");
        for height in start..=end {
            let result = self.fetch_one(height).await;
            self.report_to_orchestrator(&result).await;
            if self.results_tx.send(result).await.is_err() {
                // Receiver dropped (shutdown in progress); nothing more to do.
                return;
            }
        }
    }

    /// Reports each job result back to the Orchestrator so the safety-buffer
    /// feedback loop (spec.md §4.6 "Safety buffer feedback") and
    /// `fetched_height` actually see real fetch activity, not just the
    /// Sequencer's downstream view. Non-blocking: a full command queue never
    /// stalls a fetch worker (spec.md §5 deadlock-avoidance rules).
    async fn report_to_orchestrator(&self, data: &BlockData) {
        if data.is_ok() {
            let _ = self.cmd_tx.try_send(Command::FetchSuccess);
            let _ = self.cmd_tx.try_send(Command::NotifyFetched(data.number));
        } else {
            let kind = classify_fetch_fail(data.err.as_deref().unwrap_or_default());
            let _ = self.cmd_tx.try_send(Command::FetchFailed(kind));
        }
    }

    /// Single-block retry path used by the Sequencer when a buffered result
    /// carries an error: re-hits the RPC pool directly rather than waiting
    /// for the stall watchdog (spec.md §4.4).
    pub async fn single_block_retry(&self, height: u64) -> Option<BlockData> {
        let data = self.fetch_one(height).await;
        self.report_to_orchestrator(&data).await;
        data.is_ok().then_some(data)
    }

    async fn fetch_one(&self, height: u64) -> BlockData {
        let header_only = self.header_only.load(Ordering::Relaxed);

        if header_only {
            let block = match self.pool.header_by_number(height).await {
                Ok(Some(h)) => crate::models::Block {
                    number: h.number,
                    hash: h.hash,
                    parent_hash: h.parent_hash,
                    timestamp: h.timestamp,
                    gas_limit: 0,
                    gas_used: 0,
                    base_fee_per_gas: None,
                    tx_count: 0,
                },
                Ok(None) => return BlockData::error(height, "block not found"),
                Err(e) => return BlockData::error(height, e),
            };
            return BlockData::ok(height, block, Vec::new(), Vec::new());
        }

        let (block, transactions) = match self.pool.block_by_number(height).await {
            Ok(Some(pair)) => pair,
            Ok(None) => return BlockData::error(height, "block not found"),
            Err(e) => return BlockData::error(height, e),
        };

        let mut filter = Filter::new().from_block(height).to_block(height).event_signature(TRANSFER_EVENT_SIGNATURE);
        if !self.watched_tokens.is_empty() {
            filter = filter.address(self.watched_tokens.clone());
        }

        match self.pool.filter_logs(filter).await {
            Ok(logs) => BlockData::ok(height, block, logs, transactions),
            Err(e) => BlockData::error(height, e),
        }
    }
}

/// Classifies a job failure string into the `FetchFailKind` the
/// Orchestrator's safety-buffer feedback loop keys off of (spec.md §4.6).
fn classify_fetch_fail(err: &str) -> FetchFailKind {
    let lower = err.to_ascii_lowercase();
    if lower.contains("not found") {
        FetchFailKind::NotFound
    } else if lower.contains("429") || lower.contains("too many request") || lower.contains("limit exceeded") {
        FetchFailKind::RateLimited
    } else {
        FetchFailKind::Upstream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn job_queue_respects_capacity_and_fifo_order() {
        let q = JobQueue::new(2);
        q.push((1, 1)).await;
        q.push((2, 2)).await;

        let pushed_third = Arc::new(tokio::sync::Notify::new());
        let q2 = Arc::new(JobQueue::new(2));
        q2.push((1, 1)).await;
        q2.push((2, 2)).await;
        let q2_clone = Arc::clone(&q2);
        let notify_clone = Arc::clone(&pushed_third);
        let handle = tokio::spawn(async move {
            q2_clone.push((3, 3)).await;
            notify_clone.notify_one();
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        assert_eq!(q2.depth().await, 2);

        assert_eq!(q.pop().await, (1, 1));
        assert_eq!(q.pop().await, (2, 2));

        let popped = q2.pop().await;
        assert_eq!(popped, (1, 1));
        handle.await.unwrap();
        assert_eq!(q2.depth().await, 2);
    }

    #[tokio::test]
    async fn pause_resume_is_idempotent_and_never_lost() {
        let (paused_tx, paused_rx) = watch::channel(false);
        let mut rx1 = paused_rx.clone();

        // Resume before anyone paused: no-op (already false).
        let resumed = paused_tx.send_if_modified(|p| {
            if *p {
                *p = false;
                true
            } else {
                false
            }
        });
        assert!(!resumed);

        paused_tx.send_if_modified(|p| {
            if *p { false } else { *p = true; true }
        });
        assert!(*rx1.borrow_and_update());
    }

    #[tokio::test]
    async fn clear_jobs_empties_queue() {
        let q = JobQueue::new(10);
        q.push((1, 1)).await;
        q.push((2, 2)).await;
        assert_eq!(q.depth().await, 2);
        q.clear().await;
        assert_eq!(q.depth().await, 0);
    }

    #[test]
    fn classify_fetch_fail_recognizes_not_found_and_rate_limit() {
        assert_eq!(classify_fetch_fail("block not found"), FetchFailKind::NotFound);
        assert_eq!(classify_fetch_fail("429 too many requests"), FetchFailKind::RateLimited);
        assert_eq!(classify_fetch_fail("rate limit exceeded"), FetchFailKind::RateLimited);
        assert_eq!(classify_fetch_fail("connection reset by peer"), FetchFailKind::Upstream);
    }
}
