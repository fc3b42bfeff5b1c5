//! Multiplexes N upstream JSON-RPC endpoints behind one logical surface,
//! with weighted round-robin routing, health scoring, circuit breaking and
//! two-level rate limiting (spec.md §4.1).

use alloy::primitives::{Address, Bytes};
use alloy::rpc::types::{Filter, Log};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{IndexerError, Result};
use crate::models::{Block, TxSummary};
use crate::rpc::client::{Header, RpcClient};
use crate::rpc::rate_limiter::{BatchLimiter, TokenBucket};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(15);
const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(5 * 60);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

struct Node {
    client: RpcClient,
    weight: u32,
    is_healthy: RwLock<bool>,
    fail_count: AtomicU64,
    retry_after: RwLock<Instant>,
    limiter: TokenBucket,
}

impl Node {
    fn new(url: &str, weight: u32, rps: f64) -> Result<Self> {
        Ok(Self {
            client: RpcClient::connect(url)?,
            weight,
            is_healthy: RwLock::new(true),
            fail_count: AtomicU64::new(0),
            retry_after: RwLock::new(Instant::now()),
            limiter: TokenBucket::new(rps),
        })
    }

    async fn is_eligible(&self) -> bool {
        if *self.is_healthy.read().await {
            return true;
        }
        Instant::now() >= *self.retry_after.read().await
    }

    async fn record_failure(&self, err: &IndexerError) {
        let fails = self.fail_count.fetch_add(1, Ordering::Relaxed) + 1;
        *self.is_healthy.write().await = false;
        let cooldown = if matches!(err, IndexerError::RateLimiterError(_)) {
            RATE_LIMIT_COOLDOWN
        } else {
            let secs = 2u64.saturating_pow((fails as u32).saturating_sub(1)).min(60);
            Duration::from_secs(secs).min(MAX_BACKOFF)
        };
        *self.retry_after.write().await = Instant::now() + cooldown;
        warn!(node = %self.client.url(), fail_count = fails, cooldown_secs = cooldown.as_secs(), "rpc node marked unhealthy");
    }

    async fn record_success(&self) {
        let was_unhealthy = !*self.is_healthy.read().await;
        if was_unhealthy {
            info!(node = %self.client.url(), "rpc node recovered");
        }
        *self.is_healthy.write().await = true;
        self.fail_count.store(0, Ordering::Relaxed);
    }
}

pub struct RpcPool {
    nodes: Vec<Arc<Node>>,
    counter: AtomicU64,
    global_limiter: TokenBucket,
    batch_limiter: BatchLimiter,
    rpc_timeout: Duration,
    base_rps: f64,
    ceiling_rps: f64,
}

impl RpcPool {
    pub fn new(config: &Config) -> Result<Self> {
        let lab_mode = config.is_lab_mode();
        let base_rps = if lab_mode {
            500.0
        } else {
            match config.sync_mode {
                crate::config::SyncMode::Aggressive => 20.0,
                crate::config::SyncMode::Balanced => 15.0,
                crate::config::SyncMode::Eco => 15.0,
            }
        };
        let ceiling_rps = if lab_mode { 500.0 } else { base_rps * 2.0 };

        let nodes = config
            .rpc_urls
            .iter()
            .map(|url| Node::new(url, 1, if lab_mode { 500.0 } else { base_rps }).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        if nodes.is_empty() {
            return Err(IndexerError::NoHealthyNodes);
        }

        let global_limiter = if lab_mode {
            TokenBucket::unlimited()
        } else {
            TokenBucket::new(base_rps * nodes.len() as f64)
        };

        let batch_limiter = if lab_mode {
            BatchLimiter::disabled()
        } else {
            BatchLimiter::new(20, Duration::from_millis(250))
        };

        Ok(Self {
            nodes,
            counter: AtomicU64::new(0),
            global_limiter,
            batch_limiter,
            rpc_timeout: config.rpc_timeout,
            base_rps,
            ceiling_rps,
        })
    }

    /// Doubles the effective RPS when the indexer is catching up from far
    /// behind the chain tip (spec.md §4.1 "aggressive-catch-up policy").
    pub async fn apply_aggressive_catch_up(&self, sync_lag: u64) {
        if sync_lag > 1000 {
            self.global_limiter.double_rps(self.ceiling_rps * self.nodes.len() as f64).await;
            for node in &self.nodes {
                node.limiter.double_rps(self.ceiling_rps).await;
            }
        } else {
            self.global_limiter.reset_rps(self.base_rps * self.nodes.len() as f64).await;
            for node in &self.nodes {
                node.limiter.reset_rps(self.base_rps).await;
            }
        }
    }

    async fn eligible_nodes(&self) -> Result<Vec<Arc<Node>>> {
        let mut eligible = Vec::new();
        for n in &self.nodes {
            if n.is_eligible().await {
                eligible.push(Arc::clone(n));
            }
        }
        if eligible.is_empty() {
            return Err(IndexerError::NoHealthyNodes);
        }
        Ok(eligible)
    }

    /// Orders the eligible set into a weighted-round-robin failover sequence
    /// starting from the node this call's weighted pick would have been.
    async fn failover_order(&self) -> Result<Vec<Arc<Node>>> {
        let eligible = self.eligible_nodes().await?;
        let total_weight: u64 = eligible.iter().map(|n| n.weight as u64).sum();
        if total_weight == 0 {
            return Ok(eligible);
        }

        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut slot = counter % total_weight;
        let mut start_idx = eligible.len() - 1;
        for (i, n) in eligible.iter().enumerate() {
            if slot < n.weight as u64 {
                start_idx = i;
                break;
            }
            slot -= n.weight as u64;
        }

        let mut ordered = Vec::with_capacity(eligible.len());
        ordered.extend_from_slice(&eligible[start_idx..]);
        ordered.extend_from_slice(&eligible[..start_idx]);
        Ok(ordered)
    }

    async fn throttle(&self, node: &Node) {
        self.global_limiter.acquire().await;
        node.limiter.acquire().await;
        self.batch_limiter.tick().await;
    }

    /// Tries each eligible node in weighted-round-robin order until one
    /// succeeds, failing over to the next on error (spec.md §4.1 in-call
    /// failover). Returns `AllNodesFailed` once every eligible node has been
    /// tried this call.
    async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Arc<Node>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let ordered = self.failover_order().await?;

        for node in &ordered {
            self.throttle(node).await;
            match op(Arc::clone(node)).await {
                Ok(v) => {
                    node.record_success().await;
                    return Ok(v);
                }
                Err(e) => {
                    node.record_failure(&e).await;
                }
            }
        }

        Err(IndexerError::AllNodesFailed)
    }

    pub async fn get_latest_block_number(&self) -> Result<u64> {
        let timeout = self.rpc_timeout;
        self.run(move |n| async move { n.client.get_latest_block_number(timeout).await }).await
    }

    pub async fn block_by_number(&self, number: u64) -> Result<Option<(Block, Vec<TxSummary>)>> {
        let timeout = self.rpc_timeout;
        self.run(move |n| async move { n.client.block_by_number(number, timeout).await }).await
    }

    pub async fn header_by_number(&self, number: u64) -> Result<Option<Header>> {
        let timeout = self.rpc_timeout;
        self.run(move |n| async move { n.client.header_by_number(number, timeout).await }).await
    }

    pub async fn filter_logs(&self, filter: Filter) -> Result<Vec<Log>> {
        let timeout = self.rpc_timeout;
        self.run(move |n| {
            let filter = filter.clone();
            async move { n.client.filter_logs(&filter, timeout).await }
        })
        .await
    }

    pub async fn call_contract(&self, to: Address, data: Bytes) -> Result<Bytes> {
        let timeout = self.rpc_timeout;
        self.run(move |n| {
            let data = data.clone();
            async move { n.client.call_contract(to, data, timeout).await }
        })
        .await
    }

    /// Background task: probes unhealthy nodes and demotes currently-healthy
    /// nodes that fail a lightweight call. Runs every 15s (spec.md §4.1).
    pub async fn run_health_check_loop(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for node in &self.nodes {
                        match node.client.get_latest_block_number(self.rpc_timeout).await {
                            Ok(_) => node.record_success().await,
                            Err(e) => node.record_failure(&e).await,
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub async fn healthy_node_count(&self) -> usize {
        let mut n = 0;
        for node in &self.nodes {
            if node.is_eligible().await {
                n += 1;
            }
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn node_flags_unhealthy_on_rate_limit_error_with_long_cooldown() {
        let node = Node::new("http://localhost:8545", 1, 500.0).unwrap();
        node.record_failure(&IndexerError::RateLimiterError("429 too many requests".into())).await;
        assert!(!*node.is_healthy.read().await);
        let retry_after = *node.retry_after.read().await;
        assert!(retry_after >= Instant::now() + Duration::from_secs(4 * 60));
    }

    #[tokio::test]
    async fn node_recovers_after_success() {
        let node = Node::new("http://localhost:8545", 1, 500.0).unwrap();
        node.record_failure(&IndexerError::UpstreamError { node: "x".into(), cause: "boom".into() }).await;
        assert!(!*node.is_healthy.read().await);
        node.record_success().await;
        assert!(*node.is_healthy.read().await);
        assert_eq!(node.fail_count.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn exponential_backoff_caps_at_60s() {
        let node = Node::new("http://localhost:8545", 1, 500.0).unwrap();
        for _ in 0..10 {
            node.record_failure(&IndexerError::UpstreamError { node: "x".into(), cause: "boom".into() }).await;
        }
        let retry_after = *node.retry_after.read().await;
        assert!(retry_after <= Instant::now() + Duration::from_secs(61));
    }
}
