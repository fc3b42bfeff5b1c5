//! Batches ERC-20 `symbol()`/`decimals()`/`name()` lookups for newly-seen
//! token addresses through Multicall3 (spec.md §6), so token metadata
//! enrichment costs one round trip per batch instead of three per token.

use alloy::dyn_abi::{DynSolType, DynSolValue};
use alloy::primitives::{keccak256, Address, Bytes, Selector, U256};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{IndexerError, Result};
use crate::models::MULTICALL3_ADDRESS;
use crate::rpc::RpcPool;
use crate::storage::Storage;

const DRAIN_WINDOW: Duration = Duration::from_millis(200);
const DRAIN_MAX_BATCH: usize = 32;

fn selector(signature: &str) -> Selector {
    Selector::from_slice(&keccak256(signature.as_bytes())[..4])
}

#[derive(Debug, Clone)]
pub struct TokenMetadata {
    pub address: Address,
    pub symbol: String,
    pub decimals: i16,
    pub name: String,
}

struct PendingCall {
    token: Address,
    field: Field,
}

#[derive(Clone, Copy)]
enum Field {
    Symbol,
    Decimals,
    Name,
}

/// Encodes `Multicall3.aggregate3(Call3[])`. Built with `DynSolValue`
/// rather than a generated contract binding since this is the only
/// Multicall3 call this crate makes.
fn encode_aggregate3(calls: &[PendingCall]) -> Bytes {
    let call3_values: Vec<DynSolValue> = calls
        .iter()
        .map(|c| {
            let call_data = match c.field {
                Field::Symbol => selector("symbol()"),
                Field::Decimals => selector("decimals()"),
                Field::Name => selector("name()"),
            };
            DynSolValue::Tuple(vec![
                DynSolValue::Address(c.token),
                DynSolValue::Bool(true), // allowFailure: a non-conforming token must not sink the whole batch
                DynSolValue::Bytes(call_data.to_vec()),
            ])
        })
        .collect();

    let params = DynSolValue::Tuple(vec![DynSolValue::Array(call3_values)]);
    let mut data = selector("aggregate3((address,bool,bytes)[])").to_vec();
    data.extend(params.abi_encode_params());
    data.into()
}

fn decode_aggregate3_result(data: &Bytes) -> Result<Vec<(bool, Bytes)>> {
    let result_ty = DynSolType::Array(Box::new(DynSolType::Tuple(vec![DynSolType::Bool, DynSolType::Bytes])));
    let decoded = result_ty
        .abi_decode_params(data)
        .map_err(|e| IndexerError::SchemaViolation(format!("multicall3 aggregate3 return data malformed: {e}")))?;

    let DynSolValue::Array(items) = decoded else {
        return Err(IndexerError::SchemaViolation("multicall3 aggregate3 did not return an array".into()));
    };

    items
        .into_iter()
        .map(|item| {
            let DynSolValue::Tuple(fields) = item else {
                return Err(IndexerError::SchemaViolation("multicall3 result entry was not a tuple".into()));
            };
            let [DynSolValue::Bool(success), DynSolValue::Bytes(return_data)] = fields.as_slice() else {
                return Err(IndexerError::SchemaViolation("multicall3 result entry had unexpected shape".into()));
            };
            Ok((*success, return_data.clone().into()))
        })
        .collect()
}

fn decode_string_return(data: &Bytes) -> Option<String> {
    DynSolType::String
        .abi_decode_params(data)
        .ok()
        .and_then(|v| if let DynSolValue::String(s) = v { Some(s) } else { None })
}

fn decode_uint8_return(data: &Bytes) -> Option<i16> {
    DynSolType::Uint(8)
        .abi_decode_params(data)
        .ok()
        .and_then(|v| if let DynSolValue::Uint(u, _) = v { Some(u) } else { None })
        .map(|u: U256| u.to::<u8>() as i16)
}

/// Looks up symbol/decimals/name for a batch of token addresses in a
/// single `eth_call`, persisting the results to `token_metadata` as it
/// goes. Tokens whose calls fail (non-standard ABI) are skipped, not
/// retried: metadata enrichment is best-effort and never blocks indexing.
pub async fn enrich_token_metadata(pool: &Arc<RpcPool>, store: &Arc<Storage>, tokens: &[Address]) -> Result<Vec<TokenMetadata>> {
    if tokens.is_empty() {
        return Ok(Vec::new());
    }

    let mut calls = Vec::with_capacity(tokens.len() * 3);
    for &token in tokens {
        calls.push(PendingCall { token, field: Field::Symbol });
        calls.push(PendingCall { token, field: Field::Decimals });
        calls.push(PendingCall { token, field: Field::Name });
    }

    let calldata = encode_aggregate3(&calls);
    let raw = pool.call_contract(MULTICALL3_ADDRESS, calldata).await?;
    let results = decode_aggregate3_result(&raw)?;

    let mut enriched = Vec::new();
    for (token_idx, token) in tokens.iter().enumerate() {
        let base = token_idx * 3;
        let (Some((sym_ok, sym_data)), Some((dec_ok, dec_data)), Some((name_ok, name_data))) =
            (results.get(base), results.get(base + 1), results.get(base + 2))
        else {
            continue;
        };

        if !sym_ok || !dec_ok || !name_ok {
            continue;
        }

        let (Some(symbol), Some(decimals), Some(name)) =
            (decode_string_return(sym_data), decode_uint8_return(dec_data), decode_string_return(name_data))
        else {
            continue;
        };

        store.upsert_token_metadata(*token, &symbol, decimals, &name).await?;
        enriched.push(TokenMetadata { address: *token, symbol, decimals, name });
    }

    Ok(enriched)
}

/// Background, best-effort worker the Processor feeds with every
/// `token_address` it sees (spec.md §6 Multicall3; SPEC_FULL.md §4.5
/// supplement "token metadata enrichment"). Drains a short window of
/// addresses, skips the ones already in `token_metadata`, and enriches the
/// rest in one batched Multicall3 round trip. Never blocks or fails the
/// commit path: a failed lookup is logged and simply retried next sighting.
pub struct TokenEnricher {
    pool: Arc<RpcPool>,
    store: Arc<Storage>,
}

impl TokenEnricher {
    pub fn new(pool: Arc<RpcPool>, store: Arc<Storage>) -> Self {
        Self { pool, store }
    }

    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Address>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            let first = tokio::select! {
                a = rx.recv() => a,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { return; }
                    continue;
                }
            };
            let Some(first) = first else { return };

            let mut batch = vec![first];
            let deadline = tokio::time::Instant::now() + DRAIN_WINDOW;
            while batch.len() < DRAIN_MAX_BATCH {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match tokio::time::timeout(remaining, rx.recv()).await {
                    Ok(Some(a)) => batch.push(a),
                    _ => break,
                }
            }

            self.enrich_unseen(batch).await;
        }
    }

    async fn enrich_unseen(&self, addresses: Vec<Address>) {
        let mut seen = HashSet::new();
        let mut unseen = Vec::new();
        for addr in addresses {
            if !seen.insert(addr) {
                continue;
            }
            match self.store.token_symbol(addr).await {
                Ok(Some(_)) => {}
                Ok(None) => unseen.push(addr),
                Err(e) => warn!(token = %addr, error = %e, "token enricher failed to check existing metadata"),
            }
        }

        if unseen.is_empty() {
            return;
        }

        if let Err(e) = enrich_token_metadata(&self.pool, &self.store, &unseen).await {
            warn!(count = unseen.len(), error = %e, "token enricher batch failed, will retry next sighting");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    #[test]
    fn aggregate3_selector_matches_known_value() {
        assert_eq!(selector("aggregate3((address,bool,bytes)[])").to_vec(), hex::decode("82ad56cb").unwrap());
    }

    #[test]
    fn symbol_decimals_name_selectors_match_known_values() {
        assert_eq!(selector("symbol()").to_vec(), hex::decode("95d89b41").unwrap());
        assert_eq!(selector("decimals()").to_vec(), hex::decode("313ce567").unwrap());
        assert_eq!(selector("name()").to_vec(), hex::decode("06fdde03").unwrap());
    }

    #[test]
    fn encode_aggregate3_starts_with_the_function_selector() {
        let token = address!("1111111111111111111111111111111111111111");
        let calls = vec![PendingCall { token, field: Field::Symbol }];
        let encoded = encode_aggregate3(&calls);
        assert_eq!(&encoded[..4], hex::decode("82ad56cb").unwrap().as_slice());
    }
}
