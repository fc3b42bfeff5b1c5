//! Startup/resume sanity check, periodic hash reconciliation, and a
//! background self-healer that repairs cursor inversions the rest of the
//! pipeline can't see on its own (spec.md §4.8).

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::command::Command;
use crate::error::Result;
use crate::height_oracle::HeightOracle;
use crate::models::SystemState;
use crate::orchestrator::OrchestratorHandle;
use crate::processor::Processor;
use crate::rpc::RpcPool;
use crate::storage::Storage;

const RECONCILE_INTERVAL: Duration = Duration::from_secs(10 * 60);
const RECONCILE_SAMPLE_SIZE: u64 = 5;
const SELF_HEAL_INTERVAL: Duration = Duration::from_secs(5);
const DEGRADED_JOBS_DEPTH: usize = 150;
const DEGRADED_PERSISTENCE_TICKS: u32 = 3;

/// Runs once at startup (or resume) to reconcile the store against the
/// live chain before the rest of the pipeline starts moving.
pub struct ConsistencyGuard {
    pool: Arc<RpcPool>,
    store: Arc<Storage>,
    demo_mode: bool,
    leap_threshold: u64,
}

impl ConsistencyGuard {
    pub fn new(pool: Arc<RpcPool>, store: Arc<Storage>, demo_mode: bool, leap_threshold: u64) -> Self {
        Self { pool, store, demo_mode, leap_threshold }
    }

    /// Returns the height the pipeline should resume from.
    pub async fn run_startup_check(&self) -> Result<u64> {
        let chain_head = self.pool.get_latest_block_number().await?;
        let db_max = self.store.max_block_height().await?.unwrap_or(0);

        info!(status = "consistency_check_started", chain_head, db_max, progress = 0, "consistency guard starting");

        if db_max > chain_head {
            warn!(
                status = "time_travel_detected",
                detail = "store leads chain head, likely a testnet reset",
                db_max,
                chain_head,
                progress = 25,
                "rolling back rows beyond the live chain head"
            );
            self.store.rollback_from(chain_head + 1).await?;
            self.store.reset_checkpoint(chain_head).await?;
            info!(status = "consistency_check_complete", resume_at = chain_head, progress = 100, "consistency guard finished");
            return Ok(chain_head);
        }

        if self.demo_mode && chain_head.saturating_sub(db_max) > self.leap_threshold {
            let resume_at = chain_head.saturating_sub(1);
            warn!(
                status = "demo_leap",
                detail = "chain is far ahead of the store and demo mode is set, skipping history",
                db_max,
                chain_head,
                resume_at,
                progress = 50,
                "collapsing cursor to near chain tip"
            );
            self.store.reset_checkpoint(resume_at).await?;
            info!(status = "consistency_check_complete", resume_at, progress = 100, "consistency guard finished");
            return Ok(resume_at);
        }

        info!(status = "consistency_check_complete", resume_at = db_max, progress = 100, "consistency guard finished, no correction needed");
        Ok(db_max)
    }
}

/// Periodically spot-checks a handful of recently-committed block hashes
/// against the live chain; a mismatch means a reorg slipped past the live
/// pipeline undetected (e.g. during a restart window) and needs the same
/// deep-reorg recovery path.
pub struct Reconciler {
    pool: Arc<RpcPool>,
    store: Arc<Storage>,
    processor: Arc<Processor>,
    lookback: u64,
}

impl Reconciler {
    pub fn new(pool: Arc<RpcPool>, store: Arc<Storage>, processor: Arc<Processor>, lookback: u64) -> Self {
        Self { pool, store, processor, lookback }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { return; }
                    continue;
                }
            }
            if let Err(e) = self.reconcile_once().await {
                error!(error = %e, "reconciler pass failed");
            }
        }
    }

    async fn reconcile_once(&self) -> Result<()> {
        let Some(max_height) = self.store.max_block_height().await? else { return Ok(()) };
        let window_start = max_height.saturating_sub(self.lookback);
        let window_end = max_height;

        if window_end <= window_start {
            return Ok(());
        }

        let span = window_end - window_start;
        let step = (span / RECONCILE_SAMPLE_SIZE).max(1);
        let mut height = window_start;

        while height <= window_end {
            if let Some((_, stored_hash)) = self.store.sample_hashes(height, height).await?.into_iter().next() {
                if let Some((rpc_block, _)) = self.pool.block_by_number(height).await? {
                    if rpc_block.hash != stored_hash {
                        warn!(height, "reconciler found a hash mismatch, invoking deep reorg recovery");
                        self.processor.handle_deep_reorg(height + 1).await?;
                        return Ok(());
                    }
                }
            }
            height += step;
        }

        Ok(())
    }
}

/// Background repair loop for invariants nothing else watches continuously:
/// `fetched_height` falling behind `synced_cursor`, and a resetting
/// upstream chain head.
pub struct SelfHealer {
    handle: OrchestratorHandle,
    height_oracle: Arc<HeightOracle>,
    pool: Arc<RpcPool>,
    degraded_streak: std::sync::atomic::AtomicU32,
}

impl SelfHealer {
    pub fn new(handle: OrchestratorHandle, height_oracle: Arc<HeightOracle>, pool: Arc<RpcPool>) -> Self {
        Self { handle, height_oracle, pool, degraded_streak: std::sync::atomic::AtomicU32::new(0) }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(SELF_HEAL_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { return; }
                    continue;
                }
            }
            self.heal_once().await;
        }
    }

    async fn heal_once(&self) {
        let state = self.handle.snapshot();

        if state.fetched_height < state.synced_cursor {
            warn!(
                fetched_height = state.fetched_height,
                synced_cursor = state.synced_cursor,
                "self-healer repairing fetched_height inversion"
            );
            let _ = self.handle.cmd_tx.send(Command::FetchProgress(state.synced_cursor)).await;
        }

        let recorded_head = self.height_oracle.snapshot().chain_head;
        if let Ok(fresh_head) = self.pool.get_latest_block_number().await {
            if fresh_head < recorded_head {
                error!(recorded_head, fresh_head, "self-healer detected chain-height inversion, likely a resetting upstream");
                let _ = self.handle.cmd_tx.send(Command::SetSystemState(SystemState::Stalled)).await;
            }
        }

        if state.jobs_depth >= DEGRADED_JOBS_DEPTH {
            let streak = self.degraded_streak.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
            if streak >= DEGRADED_PERSISTENCE_TICKS {
                let _ = self.handle.cmd_tx.send(Command::SetSystemState(SystemState::Degraded)).await;
            }
        } else {
            self.degraded_streak.store(0, std::sync::atomic::Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn leap_threshold_math_skips_to_one_before_tip() {
        let chain_head = 1_000_000u64;
        let resume_at = chain_head.saturating_sub(1);
        assert_eq!(resume_at, 999_999);
    }
}
