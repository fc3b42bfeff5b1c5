//! Decouples logical commit (Processor) from physical commit (store). A
//! bounded task channel carries `PersistTask`s; a worker pool commits them
//! in small batches and reports backpressure tiers back to the Orchestrator
//! (spec.md §4.7).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, warn};

use crate::command::Command;
use crate::models::PersistTask;
use crate::storage::Storage;

const DRAIN_BATCH_SIZE: usize = 50;
const DRAIN_WINDOW: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureTier {
    Normal,
    PressureLimit,
    Warning,
    Emergency,
}

fn classify_tier(fill_ratio: f64) -> BackpressureTier {
    if fill_ratio > 0.95 {
        BackpressureTier::Emergency
    } else if fill_ratio > 0.85 {
        BackpressureTier::Warning
    } else if fill_ratio >= 0.50 {
        BackpressureTier::PressureLimit
    } else {
        BackpressureTier::Normal
    }
}

pub struct AsyncWriter {
    store: Arc<Storage>,
    task_tx: mpsc::Sender<PersistTask>,
    task_rx: Mutex<Option<mpsc::Receiver<PersistTask>>>,
    capacity: usize,
    in_flight: AtomicUsize,
    cmd_tx: mpsc::Sender<Command>,
}

impl AsyncWriter {
    pub fn new(store: Arc<Storage>, capacity: usize, cmd_tx: mpsc::Sender<Command>) -> Self {
        let (task_tx, task_rx) = mpsc::channel(capacity);
        Self {
            store,
            task_tx,
            task_rx: Mutex::new(Some(task_rx)),
            capacity,
            in_flight: AtomicUsize::new(0),
            cmd_tx,
        }
    }

    pub fn task_sender(&self) -> mpsc::Sender<PersistTask> {
        self.task_tx.clone()
    }

    pub fn fill_ratio(&self) -> f64 {
        self.in_flight.load(Ordering::Relaxed) as f64 / self.capacity as f64
    }

    pub fn tier(&self) -> BackpressureTier {
        classify_tier(self.fill_ratio())
    }

    /// Runs until the task channel closes or `shutdown` fires. Drains up to
    /// `DRAIN_BATCH_SIZE` tasks within a short window and commits them as
    /// one batch via the store's bulk path.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut rx = self
            .task_rx
            .try_lock()
            .expect("task receiver taken exactly once at startup")
            .take()
            .expect("task receiver already taken");

        loop {
            let first = tokio::select! {
                t = rx.recv() => t,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                    continue;
                }
            };
            let Some(first) = first else { break };
            self.in_flight.fetch_sub(1, Ordering::Relaxed);

            let mut batch = vec![first];
            let deadline = tokio::time::Instant::now() + DRAIN_WINDOW;
            while batch.len() < DRAIN_BATCH_SIZE {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match tokio::time::timeout(remaining, rx.recv()).await {
                    Ok(Some(t)) => {
                        self.in_flight.fetch_sub(1, Ordering::Relaxed);
                        batch.push(t);
                    }
                    _ => break,
                }
            }

            self.commit_and_report(batch).await;

            let tier = self.tier();
            if matches!(tier, BackpressureTier::Warning | BackpressureTier::Emergency) {
                warn!(fill_ratio = self.fill_ratio(), ?tier, "async writer backpressure");
            }
            if tier == BackpressureTier::Emergency {
                self.emergency_drain(&mut rx).await;
            }
        }
    }

    async fn commit_and_report(&self, batch: Vec<PersistTask>) {
        let max_height = batch.iter().map(|t| t.height).max();
        match self.store.commit_batch(&batch).await {
            Ok(()) => {
                if let Some(h) = max_height {
                    let _ = self.cmd_tx.try_send(Command::CommitDisk(h));
                }
            }
            Err(e) => {
                error!(error = %e, batch_len = batch.len(), "async writer failed to commit batch, blocks require replay");
            }
        }
    }

    /// "Lose cargo, save the ship": drains the queue down to 50% capacity by
    /// dropping the oldest pending tasks, then advances the cursor past the
    /// highest dropped height so the pipeline keeps moving (spec.md §4.7).
    async fn emergency_drain(&self, rx: &mut mpsc::Receiver<PersistTask>) {
        let target = self.capacity / 2;
        let mut last_dropped = None;

        while self.in_flight.load(Ordering::Relaxed) > target {
            match rx.try_recv() {
                Ok(task) => {
                    self.in_flight.fetch_sub(1, Ordering::Relaxed);
                    last_dropped = Some(last_dropped.map_or(task.height, |h: u64| h.max(task.height)));
                }
                Err(_) => break,
            }
        }

        if let Some(height) = last_dropped {
            error!(last_dropped = height, "emergency relief valve: dropped queued persist tasks, data completeness lost, replay required");
            let _ = self.cmd_tx.try_send(Command::CommitDisk(height));
        }
    }

    /// Closes the accept path and waits up to `timeout` for in-flight work
    /// to drain before returning. `Err` means the deadline passed with work
    /// still outstanding.
    pub async fn shutdown(&self, timeout: Duration) -> crate::error::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.in_flight.load(Ordering::Relaxed) > 0 {
            if tokio::time::Instant::now() >= deadline {
                return Err(crate::error::IndexerError::StoreUnreachable(
                    "async writer shutdown deadline exceeded with tasks still in flight".into(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }
}

/// Called by whatever hands a task to `task_sender()`, so `in_flight`
/// reflects queued-but-not-yet-committed tasks even though the channel
/// itself doesn't expose depth directly once items are popped by the
/// drain loop above.
pub async fn enqueue(writer: &AsyncWriter, task: PersistTask) -> Result<(), mpsc::error::SendError<PersistTask>> {
    writer.task_tx.send(task).await?;
    writer.in_flight.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_follow_fill_ratio_bands() {
        assert_eq!(classify_tier(0.10), BackpressureTier::Normal);
        assert_eq!(classify_tier(0.60), BackpressureTier::PressureLimit);
        assert_eq!(classify_tier(0.90), BackpressureTier::Warning);
        assert_eq!(classify_tier(0.99), BackpressureTier::Emergency);
    }

    #[test]
    fn boundary_values_are_inclusive_at_the_lower_edge() {
        assert_eq!(classify_tier(0.50), BackpressureTier::PressureLimit);
        assert_eq!(classify_tier(0.85), BackpressureTier::PressureLimit);
        assert_eq!(classify_tier(0.95), BackpressureTier::Warning);
    }
}
