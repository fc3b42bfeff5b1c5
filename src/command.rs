//! Commands accepted by the Orchestrator's bounded queue (spec.md §4.6).
//! Kept in its own module so the Processor and AsyncWriter can depend on the
//! command shape without depending on the Orchestrator's event loop itself.

use crate::models::{CoordinatorState, PersistTask, SystemState};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchFailKind {
    NotFound,
    Upstream,
    RateLimited,
}

/// Operator-visible status surface (spec.md §7): a projection of
/// `CoordinatorState` plus the fields that only make sense as a snapshot.
#[derive(Debug, Clone)]
pub struct StatusView {
    pub state: SystemState,
    pub latest_chain: u64,
    pub memory_sync: u64,
    pub disk_sync: u64,
    pub sync_lag: u64,
    pub fetch_lag: u64,
    pub jobs_depth: usize,
    pub results_depth: usize,
    pub bps: f64,
    pub tps: f64,
    pub safety_buffer: u32,
    pub is_healthy: bool,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug)]
pub enum Command {
    UpdateChainHeight(u64),
    NotifyFetched(u64),
    FetchProgress(u64),
    CommitBatch(PersistTask),
    CommitDisk(u64),
    ResetCursor(u64),
    IncrementTransfers(u64),
    ToggleEcoMode(bool),
    SetSystemState(SystemState),
    FetchFailed(FetchFailKind),
    FetchSuccess,
    LogEvent(std::collections::BTreeMap<String, String>),
    RecordUserActivity,
    GetStatus(oneshot::Sender<StatusView>),
    GetSnapshot(oneshot::Sender<CoordinatorState>),
}
