//! Thin per-node JSON-RPC client wrapping an `alloy` HTTP provider. The pool
//! (`rpc/pool.rs`) owns one of these per upstream endpoint.

use alloy::primitives::{Address, Bytes};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log};
use std::time::Duration;

use crate::error::{IndexerError, Result};
use crate::models::{Block, TxSummary};

/// Minimal header projection used for header-only mode (spec.md §4.3), so
/// the Fetcher can skip the full block body when log fetching is paused.
#[derive(Debug, Clone)]
pub struct Header {
    pub number: u64,
    pub hash: alloy::primitives::B256,
    pub parent_hash: alloy::primitives::B256,
    pub timestamp: i64,
}

pub struct RpcClient {
    url: String,
    provider: Box<dyn Provider + Send + Sync>,
}

impl RpcClient {
    pub fn connect(url: &str) -> Result<Self> {
        let parsed = url.parse().map_err(|e| {
            IndexerError::UpstreamError { node: url.to_string(), cause: format!("invalid url: {e}") }
        })?;
        let provider = ProviderBuilder::new().connect_http(parsed);
        Ok(Self { url: url.to_string(), provider: Box::new(provider) })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn with_timeout<T>(
        &self,
        timeout: Duration,
        fut: impl std::future::Future<Output = std::result::Result<T, alloy::transports::RpcError<alloy::transports::TransportErrorKind>>>,
    ) -> Result<T> {
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(IndexerError::classify_upstream(&self.url, e)),
            Err(_) => Err(IndexerError::classify_upstream(&self.url, "request timed out")),
        }
    }

    pub async fn get_latest_block_number(&self, timeout: Duration) -> Result<u64> {
        self.with_timeout(timeout, self.provider.get_block_number()).await
    }

    /// Fetches the full hydrated block (transactions included) so both the
    /// log-based and transaction-fallback extraction paths in the Processor
    /// (spec.md §4.5 steps 3-4) have what they need from a single round trip.
    pub async fn block_by_number(&self, number: u64, timeout: Duration) -> Result<Option<(Block, Vec<TxSummary>)>> {
        let block = self
            .with_timeout(
                timeout,
                self.provider.get_block_by_number(number.into(), alloy::rpc::types::BlockTransactionsKind::Full),
            )
            .await?;
        Ok(block.map(|b| (to_model_block(&b), to_tx_summaries(&b))))
    }

    pub async fn header_by_number(&self, number: u64, timeout: Duration) -> Result<Option<Header>> {
        // alloy has no dedicated "headers only" RPC call distinct from
        // eth_getBlockByNumber(num, false); we request the non-hydrated
        // body (no full transactions) to approximate header-only mode.
        let block = self
            .with_timeout(
                timeout,
                self.provider.get_block_by_number(number.into(), alloy::rpc::types::BlockTransactionsKind::Hashes),
            )
            .await?;
        Ok(block.map(|b| Header {
            number: b.header.number,
            hash: b.header.hash,
            parent_hash: b.header.parent_hash,
            timestamp: b.header.timestamp as i64,
        }))
    }

    pub async fn filter_logs(&self, filter: &Filter, timeout: Duration) -> Result<Vec<Log>> {
        self.with_timeout(timeout, self.provider.get_logs(filter)).await
    }

    pub async fn call_contract(&self, to: Address, data: Bytes, timeout: Duration) -> Result<Bytes> {
        let tx = alloy::rpc::types::TransactionRequest::default().to(to).input(data.into());
        self.with_timeout(timeout, self.provider.call(tx)).await
    }
}

fn to_model_block(b: &alloy::rpc::types::Block) -> Block {
    Block {
        number: b.header.number,
        hash: b.header.hash,
        parent_hash: b.header.parent_hash,
        timestamp: b.header.timestamp as i64,
        gas_limit: b.header.gas_limit as i64,
        gas_used: b.header.gas_used as i64,
        base_fee_per_gas: b.header.base_fee_per_gas.map(alloy::primitives::U256::from),
        tx_count: match &b.transactions {
            alloy::rpc::types::BlockTransactions::Full(txs) => txs.len() as i32,
            alloy::rpc::types::BlockTransactions::Hashes(hs) => hs.len() as i32,
            alloy::rpc::types::BlockTransactions::Uncle => 0,
        },
    }
}

fn to_tx_summaries(b: &alloy::rpc::types::Block) -> Vec<TxSummary> {
    match &b.transactions {
        alloy::rpc::types::BlockTransactions::Full(txs) => txs
            .iter()
            .map(|tx| TxSummary {
                hash: tx.inner.tx_hash(),
                from: tx.inner.signer(),
                to: tx.inner.to(),
                value: tx.inner.value(),
                is_contract_creation: tx.inner.to().is_none(),
            })
            .collect(),
        _ => Vec::new(),
    }
}
