//! Bounded historical range sync: the same Fetcher → Sequencer → Processor
//! pipeline as `Indexer`, but `continuous_mode=false` — it runs to
//! completion over `[start, end]` and returns rather than tailing forever
//! (SPEC_FULL.md §0, grounded in the teacher's `main.rs` "backfill" mode).

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use crate::async_writer::AsyncWriter;
use crate::config::Config;
use crate::error::Result;
use crate::fetcher::Fetcher;
use crate::height_oracle::HeightOracle;
use crate::orchestrator::Orchestrator;
use crate::processor::Processor;
use crate::rpc::RpcPool;
use crate::sequencer::{run_reorg_supervisor, Sequencer};
use crate::storage::Storage;

pub struct Backfill {
    config: Config,
    store: Arc<Storage>,
    batch_size: u64,
}

impl Backfill {
    pub fn new(config: Config, store: Arc<Storage>, batch_size: u64) -> Self {
        Self { config, store, batch_size }
    }

    pub async fn run(self, start: u64, end: Option<u64>) -> Result<()> {
        self.store.migrate().await?;
        let pool = Arc::new(RpcPool::new(&self.config)?);

        let end = match end {
            Some(e) => e,
            None => pool.get_latest_block_number().await?,
        };
        if start > end {
            info!(start, end, "backfill range empty, nothing to do");
            return Ok(());
        }

        info!(start, end, "starting backfill");

        let height_oracle = Arc::new(HeightOracle::new(self.config.drift_tolerance, self.config.strict_height_check));
        height_oracle.set_chain_head(end);
        height_oracle.set_indexed_head(start.saturating_sub(1));

        let (cmd_tx, cmd_rx) = tokio::sync::mpsc::channel(1_000);

        let fetcher = Arc::new(Fetcher::new(
            Arc::clone(&pool),
            self.config.fetcher_concurrency,
            self.config.fetcher_results_size,
            self.config.watched_tokens.clone(),
            cmd_tx.clone(),
        ));

        let (orchestrator, handle) = Orchestrator::new(
            Arc::clone(&height_oracle),
            Arc::clone(&pool),
            Arc::clone(&fetcher),
            true, // a bounded backfill always runs at full tilt, eco-mode has no meaning here
            self.config.fetcher_results_size,
            cmd_tx.clone(),
            cmd_rx,
            crate::models::CoordinatorState::MIN_SAFETY_BUFFER,
        );

        let async_writer = Arc::new(AsyncWriter::new(Arc::clone(&self.store), self.config.async_writer_queue_capacity, handle.cmd_tx.clone()));

        let (token_enrich_tx, token_enrich_rx) = tokio::sync::mpsc::channel(256);
        let token_enricher = Arc::new(crate::multicall::TokenEnricher::new(Arc::clone(&pool), Arc::clone(&self.store)));

        let processor = Arc::new(Processor::new(
            Arc::clone(&self.store),
            Arc::clone(&pool),
            Arc::clone(&height_oracle),
            handle.cmd_tx.clone(),
            Arc::clone(&async_writer),
            self.config.watched_tokens.clone(),
            self.config.dispatch_reply_timeout,
            token_enrich_tx,
        ));

        let (reorg_tx, reorg_rx) = tokio::sync::mpsc::channel(16);
        let sequencer = Arc::new(Sequencer::new(
            start,
            self.config.sequencer_buffer_limit,
            self.config.stall_watchdog_idle_secs,
            self.config.stall_watchdog_dead_secs,
            self.config.max_gap_fill_attempts,
            Arc::clone(&fetcher),
            Arc::clone(&processor),
            reorg_tx,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let results_rx = fetcher.take_results_receiver();

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(orchestrator.run(shutdown_rx.clone())));
        tasks.extend(fetcher.spawn_workers(self.config.fetcher_concurrency, shutdown_rx.clone()));
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
        tasks.push(tokio::spawn(token_enricher.run(token_enrich_rx, shutdown_rx.clone())));

        let mut next = start;
        while next <= end {
            let batch_end = (next + self.batch_size - 1).min(end);
            fetcher.schedule(next, batch_end).await;
            next = batch_end + 1;
        }

        loop {
            if sequencer.expected_block() > end {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        info!(start, end, "backfill range fully processed");
        let _ = shutdown_tx.send(true);
        async_writer.shutdown(self.config.writer_shutdown_timeout).await?;

        for t in tasks {
            let _ = t.await;
        }

        Ok(())
    }
}
