//! Single-writer state machine holding `CoordinatorState` (spec.md §4.6).
//! Every mutation flows through `Command`s on one bounded queue; every
//! reader gets a cloned, eventually-consistent snapshot, never a live
//! reference to the live state.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::command::{Command, FetchFailKind, StatusView};
use crate::fetcher::Fetcher;
use crate::height_oracle::HeightOracle;
use crate::models::{CoordinatorState, SystemState};
use crate::rpc::RpcPool;

const MERGE_TICK: Duration = Duration::from_millis(100);
const DECISION_TICK: Duration = Duration::from_secs(5);
const TELEMETRY_TICK: Duration = Duration::from_secs(1);
const SUCCESS_STREAK_FOR_SHRINK: u32 = 50;
const STALLED_SYNC_LAG: u64 = 1000;
const STALLED_BPS_THRESHOLD: f64 = 1.0;
const DEGRADED_JOBS_DEPTH: usize = 150;
const THROTTLED_RESULTS_RATIO: f64 = 0.8;
const ECO_SYNC_LAG_FLOOR: u64 = 10;

/// Cheap, cloneable handle other tasks hold to talk to the Orchestrator:
/// send commands, or subscribe to the latest published snapshot.
#[derive(Clone)]
pub struct OrchestratorHandle {
    pub cmd_tx: mpsc::Sender<Command>,
    pub snapshot_rx: watch::Receiver<CoordinatorState>,
}

impl OrchestratorHandle {
    pub fn snapshot(&self) -> CoordinatorState {
        self.snapshot_rx.borrow().clone()
    }

    pub async fn get_status(&self) -> Option<StatusView> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::GetStatus(tx)).await.ok()?;
        rx.await.ok()
    }

    pub fn record_user_activity(&self) {
        let _ = self.cmd_tx.try_send(Command::RecordUserActivity);
    }
}

pub struct Orchestrator {
    state: CoordinatorState,
    cmd_rx: mpsc::Receiver<Command>,
    snapshot_tx: watch::Sender<CoordinatorState>,
    height_oracle: Arc<HeightOracle>,
    pool: Arc<RpcPool>,
    fetcher: Arc<Fetcher>,
    always_active: bool,
    results_channel_capacity: usize,
    pending_chain_height: Option<u64>,
    success_streak: u32,
    bps_window_started_at: Instant,
    bps_window_started_height: u64,
    last_bps: f64,
    tps_window_started_at: Instant,
    tps_window_started_count: u64,
    last_tps: f64,
}

impl Orchestrator {
    /// Takes an externally-created `(cmd_tx, cmd_rx)` pair rather than
    /// building its own channel, so callers can hand `cmd_tx.clone()` to the
    /// `Fetcher`/`TailFollower` before the Orchestrator itself exists.
    pub fn new(
        height_oracle: Arc<HeightOracle>,
        pool: Arc<RpcPool>,
        fetcher: Arc<Fetcher>,
        always_active: bool,
        results_channel_capacity: usize,
        cmd_tx: mpsc::Sender<Command>,
        cmd_rx: mpsc::Receiver<Command>,
        initial_safety_buffer: u32,
    ) -> (Self, OrchestratorHandle) {
        let initial_state = CoordinatorState {
            safety_buffer: initial_safety_buffer.clamp(CoordinatorState::MIN_SAFETY_BUFFER, CoordinatorState::MAX_SAFETY_BUFFER),
            ..Default::default()
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial_state.clone());

        let orchestrator = Self {
            state: initial_state,
            cmd_rx,
            snapshot_tx,
            height_oracle,
            pool,
            fetcher,
            always_active,
            results_channel_capacity,
            pending_chain_height: None,
            success_streak: 0,
            bps_window_started_at: Instant::now(),
            bps_window_started_height: 0,
            last_bps: 0.0,
            tps_window_started_at: Instant::now(),
            tps_window_started_count: 0,
            last_tps: 0.0,
        };
        let handle = OrchestratorHandle { cmd_tx, snapshot_rx };
        (orchestrator, handle)
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut merge_ticker = tokio::time::interval(MERGE_TICK);
        let mut decision_ticker = tokio::time::interval(DECISION_TICK);
        let mut telemetry_ticker = tokio::time::interval(TELEMETRY_TICK);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.apply(cmd).await;
                }
                _ = merge_ticker.tick() => self.apply_merged_chain_height(),
                _ = decision_ticker.tick() => self.run_decision_tick().await,
                _ = telemetry_ticker.tick() => self.emit_telemetry(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
            }
            self.publish_snapshot();
        }

        info!("orchestrator event loop exiting");
    }

    /// Applies one command to the exclusively-owned state. The Orchestrator
    /// never calls back into another component while holding a lock on this
    /// state — it only touches plain fields here (spec.md §5).
    async fn apply(&mut self, cmd: Command) {
        match cmd {
            Command::UpdateChainHeight(h) => {
                self.pending_chain_height = Some(self.pending_chain_height.map_or(h, |p| p.max(h)));
            }
            Command::NotifyFetched(h) => {
                self.state.fetched_height = self.state.fetched_height.max(h);
            }
            Command::FetchProgress(h) => {
                self.state.fetched_height = self.state.fetched_height.max(h);
            }
            Command::CommitBatch(_) => {
                // Logical dispatch only (hand-off to the AsyncWriter's
                // queue is the Processor's job via its own `cmd_tx`).
                // `synced_cursor` must only ever reflect a durable write,
                // so it advances solely on `CommitDisk` below.
            }
            Command::CommitDisk(h) => {
                // Disk-commit heights only ever advance (spec.md §4.6
                // "Cursor discipline").
                self.state.synced_cursor = self.state.synced_cursor.max(h);
            }
            Command::ResetCursor(h) => {
                self.state.synced_cursor = h;
                self.state.fetched_height = self.state.fetched_height.max(h);
                self.success_streak = 0;
                self.state.safety_buffer = CoordinatorState::MIN_SAFETY_BUFFER;
            }
            Command::IncrementTransfers(n) => {
                self.state.transfers_total += n;
            }
            Command::ToggleEcoMode(on) => {
                self.state.is_eco_mode = on;
            }
            Command::SetSystemState(s) => {
                self.state.system_state = s;
            }
            Command::FetchFailed(FetchFailKind::NotFound) => {
                self.success_streak = 0;
                self.state.safety_buffer = (self.state.safety_buffer + 1).min(CoordinatorState::MAX_SAFETY_BUFFER);
                self.state.recompute_target();
            }
            Command::FetchFailed(_) => {
                self.success_streak = 0;
            }
            Command::FetchSuccess => {
                self.success_streak += 1;
                if self.success_streak >= SUCCESS_STREAK_FOR_SHRINK {
                    self.success_streak = 0;
                    self.state.safety_buffer = self.state.safety_buffer.saturating_sub(1).max(CoordinatorState::MIN_SAFETY_BUFFER);
                    self.state.recompute_target();
                }
            }
            Command::LogEvent(fields) => {
                self.state.last_log_event = fields.get("event").cloned();
                info!(?fields, "pipeline event");
            }
            Command::RecordUserActivity => {
                self.state.last_user_activity = Some(chrono::Utc::now());
            }
            Command::GetStatus(reply) => {
                let view = self.current_status_view();
                let _ = reply.send(view);
            }
            Command::GetSnapshot(reply) => {
                let _ = reply.send(self.state.clone());
            }
        }
    }

    fn apply_merged_chain_height(&mut self) {
        if let Some(h) = self.pending_chain_height.take() {
            self.state.latest_chain_height = self.state.latest_chain_height.max(h);
            self.height_oracle.set_chain_head(h);
            self.state.recompute_target();
        }
    }

    async fn run_decision_tick(&mut self) {
        self.state.jobs_depth = self.fetcher.queue_depth().await;
        self.state.results_depth = self.fetcher.results_depth();

        self.update_rate_measurements();
        self.evaluate_system_state();
        self.evaluate_eco_mode().await;

        let snap = self.height_oracle.snapshot();
        self.pool.apply_aggressive_catch_up(snap.sync_lag).await;
    }

    fn update_rate_measurements(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.bps_window_started_at).as_secs_f64();
        if elapsed >= DECISION_TICK.as_secs_f64() {
            let delta_blocks = self.state.synced_cursor.saturating_sub(self.bps_window_started_height);
            self.last_bps = if elapsed > 0.0 { delta_blocks as f64 / elapsed } else { 0.0 };
            self.bps_window_started_at = now;
            self.bps_window_started_height = self.state.synced_cursor;

            let delta_transfers = self.state.transfers_total.saturating_sub(self.tps_window_started_count);
            self.last_tps = if elapsed > 0.0 { delta_transfers as f64 / elapsed } else { 0.0 };
            self.tps_window_started_at = now;
            self.tps_window_started_count = self.state.transfers_total;
        }
    }

    /// `evaluate_system_state` (spec.md §4.6.1), precedence from most to
    /// least severe.
    fn evaluate_system_state(&mut self) {
        let sync_lag = self.state.latest_chain_height.saturating_sub(self.state.synced_cursor);
        let new_state = classify_system_state(
            self.state.jobs_depth,
            sync_lag,
            self.last_bps,
            self.state.results_depth,
            self.results_channel_capacity,
            self.state.safety_buffer,
        );

        if new_state != self.state.system_state {
            info!(from = ?self.state.system_state, to = ?new_state, "system state transition");
        }
        self.state.system_state = new_state;
    }

    /// `evaluate_eco_mode` policy tree (spec.md §4.6.1): data completeness
    /// always wins over quota saving.
    async fn evaluate_eco_mode(&mut self) {
        if self.always_active {
            self.set_eco_mode(false);
            return;
        }

        let sync_lag = self.state.latest_chain_height.saturating_sub(self.state.synced_cursor);
        if sync_lag > ECO_SYNC_LAG_FLOOR {
            self.set_eco_mode(false);
            return;
        }

        if let Some(last_activity) = self.state.last_user_activity {
            if chrono::Utc::now() - last_activity < chrono::Duration::minutes(2) {
                self.set_eco_mode(false);
                return;
            }
        }

        self.set_eco_mode(true);
    }

    fn set_eco_mode(&mut self, eco: bool) {
        if self.state.is_eco_mode == eco {
            return;
        }
        self.state.is_eco_mode = eco;
        if eco {
            self.fetcher.set_header_only(true);
            warn!("entering eco mode: header-only fetch, visible lag is zero");
        } else {
            self.fetcher.set_header_only(false);
            info!("leaving eco mode: resuming full block + log fetch");
        }
    }

    fn emit_telemetry(&self) {
        info!(
            state = ?self.state.system_state,
            latest_chain = self.state.latest_chain_height,
            synced_cursor = self.state.synced_cursor,
            fetched_height = self.state.fetched_height,
            jobs_depth = self.state.jobs_depth,
            results_depth = self.state.results_depth,
            safety_buffer = self.state.safety_buffer,
            eco_mode = self.state.is_eco_mode,
            bps = self.last_bps,
            tps = self.last_tps,
            transfers_total = self.state.transfers_total,
            "telemetry"
        );
    }

    fn current_status_view(&self) -> StatusView {
        let snap = self.height_oracle.snapshot();
        StatusView {
            state: self.state.system_state,
            latest_chain: self.state.latest_chain_height,
            memory_sync: self.state.fetched_height,
            disk_sync: self.state.synced_cursor,
            sync_lag: snap.sync_lag,
            fetch_lag: self.state.latest_chain_height.saturating_sub(self.state.fetched_height),
            jobs_depth: self.state.jobs_depth,
            results_depth: self.state.results_depth,
            bps: self.last_bps,
            tps: self.last_tps,
            safety_buffer: self.state.safety_buffer,
            is_healthy: !matches!(self.state.system_state, SystemState::Degraded | SystemState::Stalled),
            updated_at: chrono::Utc::now(),
        }
    }

    /// Copies live state into the watch channel. `watch::Sender::send`
    /// never blocks and always keeps only the latest value, which gives us
    /// the spec's "coalesced broadcast at a capped rate" for free: a
    /// subscriber that only checks every 500ms never sees more than the
    /// newest snapshot, and none is ever queued up behind it.
    fn publish_snapshot(&mut self) {
        self.state.updated_at = Some(chrono::Utc::now());
        let _ = self.snapshot_tx.send(self.state.clone());
    }
}

/// Pure precedence ladder used by `evaluate_system_state`, pulled out as a
/// free function so the ordering can be unit-tested without constructing a
/// live Orchestrator.
fn classify_system_state(jobs_depth: usize, sync_lag: u64, bps: f64, results_depth: usize, results_capacity: usize, safety_buffer: u32) -> SystemState {
    if jobs_depth > DEGRADED_JOBS_DEPTH {
        SystemState::Degraded
    } else if sync_lag > STALLED_SYNC_LAG && bps < STALLED_BPS_THRESHOLD {
        SystemState::Stalled
    } else if (results_depth as f64) > THROTTLED_RESULTS_RATIO * results_capacity as f64 {
        SystemState::Throttled
    } else if safety_buffer > CoordinatorState::MIN_SAFETY_BUFFER {
        SystemState::Optimizing
    } else {
        SystemState::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn base_state() -> CoordinatorState {
        CoordinatorState { safety_buffer: 1, ..Default::default() }
    }

    fn test_orchestrator() -> Orchestrator {
        let height_oracle = Arc::new(HeightOracle::new(5, false));
        let config = Config { rpc_urls: vec!["http://localhost:8545".to_string()], ..Config::from_env() };
        let pool = Arc::new(RpcPool::new(&config).expect("lazy http provider never fails to connect"));
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let fetcher = Arc::new(Fetcher::new(Arc::clone(&pool), 2, 64, Vec::new(), cmd_tx.clone()));
        let (orchestrator, _handle) =
            Orchestrator::new(height_oracle, pool, fetcher, false, 64, cmd_tx, cmd_rx, CoordinatorState::MIN_SAFETY_BUFFER);
        orchestrator
    }

    #[tokio::test]
    async fn safety_buffer_grows_on_not_found_and_shrinks_after_streak() {
        let mut orchestrator = test_orchestrator();

        for _ in 0..3 {
            orchestrator.apply(Command::FetchFailed(FetchFailKind::NotFound)).await;
        }
        assert_eq!(orchestrator.state.safety_buffer, 4);

        for _ in 0..50 {
            orchestrator.apply(Command::FetchSuccess).await;
        }
        assert_eq!(orchestrator.state.safety_buffer, 3);
    }

    #[tokio::test]
    async fn commit_batch_does_not_advance_synced_cursor_only_commit_disk_does() {
        let mut orchestrator = test_orchestrator();
        let block = crate::models::Block {
            number: 500,
            hash: Default::default(),
            parent_hash: Default::default(),
            timestamp: 0,
            gas_limit: 0,
            gas_used: 0,
            base_fee_per_gas: None,
            tx_count: 0,
        };
        let task = crate::models::PersistTask::new(block, Vec::new(), 0);
        orchestrator.apply(Command::CommitBatch(task)).await;
        assert_eq!(orchestrator.state.synced_cursor, 0);

        orchestrator.apply(Command::CommitDisk(500)).await;
        assert_eq!(orchestrator.state.synced_cursor, 500);
    }

    #[test]
    fn target_height_never_goes_negative() {
        let mut state = CoordinatorState { latest_chain_height: 2, safety_buffer: 10, ..Default::default() };
        state.recompute_target();
        assert_eq!(state.target_height, 0);
    }

    #[test]
    fn degraded_outranks_stalled_and_throttled() {
        let state = classify_system_state(200, 2000, 0.1, 100, 100, 10);
        assert_eq!(state, SystemState::Degraded);
    }

    #[test]
    fn stalled_requires_both_high_lag_and_low_throughput() {
        assert_eq!(classify_system_state(10, 2000, 0.1, 10, 100, 1), SystemState::Stalled);
        assert_eq!(classify_system_state(10, 2000, 5.0, 10, 100, 1), SystemState::Running);
    }

    #[test]
    fn throttled_when_results_channel_past_80_percent() {
        assert_eq!(classify_system_state(10, 0, 5.0, 85, 100, 1), SystemState::Throttled);
    }

    #[test]
    fn optimizing_when_safety_buffer_above_minimum() {
        assert_eq!(classify_system_state(10, 0, 5.0, 10, 100, 3), SystemState::Optimizing);
    }

    #[test]
    fn running_is_the_default() {
        assert_eq!(classify_system_state(10, 0, 5.0, 10, 100, 1), SystemState::Running);
    }
}
