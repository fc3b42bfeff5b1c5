//! Wires the live pipeline together: RPC pool, Height Oracle, Fetcher,
//! Sequencer, Processor, Orchestrator, AsyncWriter, plus the Consistency
//! Guard / Reconciler / Self-Healer and tail-follower background tasks
//! (spec.md §2 data/control flow, SPEC_FULL.md §0 crate shape).

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::async_writer::AsyncWriter;
use crate::checkpoint_file::CheckpointStore;
use crate::config::Config;
use crate::consistency::{ConsistencyGuard, Reconciler, SelfHealer};
use crate::error::Result;
use crate::fetcher::Fetcher;
use crate::height_oracle::HeightOracle;
use crate::orchestrator::Orchestrator;
use crate::processor::Processor;
use crate::rpc::RpcPool;
use crate::sequencer::{run_reorg_supervisor, ReorgEvent, Sequencer};
use crate::storage::Storage;
use crate::tail_follower::TailFollower;

const RECONCILER_LOOKBACK: u64 = 200;
const SCHEDULE_CHUNK: u64 = 500;

pub struct Indexer {
    config: Config,
}

impl Indexer {
    pub async fn new(config: Config) -> Result<Self> {
        Ok(Self { config })
    }

    pub async fn run(self) -> Result<()> {
        let config = self.config;
        let store = Arc::new(Storage::connect(&config.database_url, config.chain_id).await?);
        store.migrate().await?;

        let pool = Arc::new(RpcPool::new(&config)?);

        let guard = ConsistencyGuard::new(Arc::clone(&pool), Arc::clone(&store), config.demo_mode, config.demo_leap_threshold);
        let db_resume_at = guard.run_startup_check().await?;

        let checkpoint_store = CheckpointStore::new(config.checkpoint_dir.clone());
        let resume_at = match checkpoint_store.load_latest().await? {
            // The file is a fast-restart hint only; the store always wins a
            // disagreement (documented open-question decision, DESIGN.md).
            Some(file) => db_resume_at.min(file.state_snapshot.synced_cursor),
            None => db_resume_at,
        };

        info!(resume_at, "pipeline resuming");

        let height_oracle = Arc::new(HeightOracle::new(config.drift_tolerance, config.strict_height_check));
        height_oracle.set_indexed_head(resume_at);

        let (cmd_tx, cmd_rx) = tokio::sync::mpsc::channel(1_000);

        let fetcher = Arc::new(Fetcher::new(
            Arc::clone(&pool),
            config.fetcher_concurrency,
            config.fetcher_results_size,
            config.watched_tokens.clone(),
            cmd_tx.clone(),
        ));

        let (orchestrator, handle) = Orchestrator::new(
            Arc::clone(&height_oracle),
            Arc::clone(&pool),
            Arc::clone(&fetcher),
            config.always_active,
            config.fetcher_results_size,
            cmd_tx.clone(),
            cmd_rx,
            crate::models::CoordinatorState::MIN_SAFETY_BUFFER,
        );

        let async_writer = Arc::new(AsyncWriter::new(Arc::clone(&store), config.async_writer_queue_capacity, handle.cmd_tx.clone()));

        let (token_enrich_tx, token_enrich_rx) = tokio::sync::mpsc::channel(256);
        let token_enricher = Arc::new(crate::multicall::TokenEnricher::new(Arc::clone(&pool), Arc::clone(&store)));

        let processor = Arc::new(Processor::new(
            Arc::clone(&store),
            Arc::clone(&pool),
            Arc::clone(&height_oracle),
            handle.cmd_tx.clone(),
            Arc::clone(&async_writer),
            config.watched_tokens.clone(),
            config.dispatch_reply_timeout,
            token_enrich_tx,
        ));

        let (reorg_tx, reorg_rx) = tokio::sync::mpsc::channel::<ReorgEvent>(16);
        let sequencer = Arc::new(Sequencer::new(
            resume_at + 1,
            config.sequencer_buffer_limit,
            config.stall_watchdog_idle_secs,
            config.stall_watchdog_dead_secs,
            config.max_gap_fill_attempts,
            Arc::clone(&fetcher),
            Arc::clone(&processor),
            reorg_tx,
        ));

        let reconciler = Arc::new(Reconciler::new(Arc::clone(&pool), Arc::clone(&store), Arc::clone(&processor), RECONCILER_LOOKBACK));
        let self_healer = Arc::new(SelfHealer::new(handle.clone(), Arc::clone(&height_oracle), Arc::clone(&pool)));

        let tail_follower = config.rpc_urls.first().map(|url| {
            let ws_url = url.replace("http://", "ws://").replace("https://", "wss://");
            Arc::new(TailFollower::new(ws_url, Arc::clone(&height_oracle), cmd_tx.clone()))
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let results_rx = fetcher.take_results_receiver();

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(orchestrator.run(shutdown_rx.clone())));
        tasks.extend(fetcher.spawn_workers(config.fetcher_concurrency, shutdown_rx.clone()));
        tasks.push(tokio::spawn(pool.clone().run_health_check_loop(shutdown_rx.clone())));
        tasks.push(tokio::spawn(Arc::clone(&async_writer).run(shutdown_rx.clone())));
        tasks.push(processor.spawn_retry_worker(shutdown_rx.clone()));
        tasks.push(tokio::spawn(Arc::clone(&sequencer).run(results_rx, shutdown_rx.clone())));
        tasks.push(tokio::spawn(run_reorg_supervisor(
            reorg_rx,
            Arc::clone(&processor),
            Arc::clone(&sequencer),
            Arc::clone(&fetcher),
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(Arc::clone(&reconciler).run(shutdown_rx.clone())));
        tasks.push(tokio::spawn(Arc::clone(&self_healer).run(shutdown_rx.clone())));
        tasks.push(tokio::spawn(token_enricher.run(token_enrich_rx, shutdown_rx.clone())));
        if let Some(follower) = tail_follower.clone() {
            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move { follower.run(rx).await }));
        }

        tasks.push(tokio::spawn(run_scheduler(
            Arc::clone(&fetcher),
            handle.snapshot_rx.clone(),
            resume_at + 1,
            shutdown_rx.clone(),
        )));

        tasks.push(tokio::spawn(run_checkpoint_writer(handle.snapshot_rx.clone(), checkpoint_store, shutdown_rx.clone())));

        tokio::signal::ctrl_c().await.ok();
        info!("shutdown signal received, draining");
        let _ = shutdown_tx.send(true);

        if let Err(e) = async_writer.shutdown(config.writer_shutdown_timeout).await {
            tracing::error!(error = %e, "async writer did not drain cleanly before shutdown deadline");
        }

        for t in tasks {
            let _ = t.await;
        }

        Ok(())
    }
}

/// Pushes `(start, end)` range jobs to the Fetcher as `target_height`
/// advances (spec.md §4.2: "the tail-follower schedules up to
/// `target_height`, never further"). Lives alongside the pipeline wiring
/// rather than inside `tail_follower.rs` since it reacts to the
/// Orchestrator's published snapshot, not to raw WS frames.
async fn run_scheduler(fetcher: Arc<Fetcher>, mut snapshot_rx: watch::Receiver<crate::models::CoordinatorState>, start_at: u64, mut shutdown: watch::Receiver<bool>) {
    let mut next = start_at;
    loop {
        tokio::select! {
            changed = snapshot_rx.changed() => {
                if changed.is_err() { return; }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() { return; }
                continue;
            }
        }
        let target = snapshot_rx.borrow().target_height;
        while next <= target {
            let end = (next + SCHEDULE_CHUNK - 1).min(target);
            fetcher.schedule(next, end).await;
            next = end + 1;
        }
    }
}

/// Periodically snapshots `CoordinatorState` to the local checkpoint file so
/// a restart doesn't have to replay the in-memory cursors from scratch
/// (SPEC_FULL.md Open Questions #2).
async fn run_checkpoint_writer(mut snapshot_rx: watch::Receiver<crate::models::CoordinatorState>, store: CheckpointStore, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() { return; }
                continue;
            }
        }
        let snapshot = snapshot_rx.borrow_and_update().clone();
        if let Err(e) = store.write(snapshot.synced_cursor, snapshot).await {
            tracing::warn!(error = %e, "failed to write checkpoint file");
        }
    }
}
