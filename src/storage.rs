//! Durable store backed by Postgres via `sqlx`. Owns the `blocks`,
//! `transfers`, `sync_checkpoints`, and `token_metadata` tables (spec.md §6).
//!
//! Grounded on the teacher's `Storage` naming (`indexer/src/listener.rs`
//! referenced `crate::storage::Storage` with `upsert_block`/
//! `update_sync_status`-shaped methods); the bulk-insert and transactional
//! commit machinery here is new, built to the schema and atomicity
//! requirements this indexer actually needs.

use bigdecimal::BigDecimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::str::FromStr;

use crate::error::{IndexerError, Result};
use crate::models::{Block, PersistTask, SyncCheckpoint, Transfer};

/// Converts an `alloy::primitives::U256` to the exact decimal representation
/// stored in a `NUMERIC(78,0)` column. Round-trips bit-for-bit: no binary
/// float ever sits between the chain value and the column.
fn u256_to_decimal(v: alloy::primitives::U256) -> BigDecimal {
    BigDecimal::from_str(&v.to_string()).expect("U256::to_string is always a valid decimal")
}

fn decimal_to_u256(d: &BigDecimal) -> Result<alloy::primitives::U256> {
    alloy::primitives::U256::from_str(&d.to_plain_string())
        .map_err(|e| IndexerError::SchemaViolation(format!("stored amount not a valid u256: {e}")))
}

pub struct Storage {
    pool: PgPool,
    chain_id: i64,
}

impl Storage {
    pub async fn connect(database_url: &str, chain_id: i64) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await
            .map_err(|e| IndexerError::StoreUnreachable(e.to_string()))?;
        Ok(Self { pool, chain_id })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blocks (
                number BIGINT PRIMARY KEY,
                hash TEXT NOT NULL,
                parent_hash TEXT NOT NULL,
                timestamp BIGINT NOT NULL,
                gas_limit BIGINT NOT NULL,
                gas_used BIGINT NOT NULL,
                transaction_count INT NOT NULL,
                base_fee_per_gas NUMERIC(78,0)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transfers (
                block_number BIGINT NOT NULL,
                tx_hash TEXT NOT NULL,
                log_index INT NOT NULL,
                from_address TEXT NOT NULL,
                to_address TEXT,
                amount NUMERIC(78,0) NOT NULL,
                token_address TEXT,
                symbol TEXT,
                activity_type TEXT,
                PRIMARY KEY (block_number, log_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_checkpoints (
                chain_id INT PRIMARY KEY,
                last_synced_block BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS token_metadata (
                address TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                decimals SMALLINT NOT NULL,
                name TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Hash of the committed block at `height`, or `None` if nothing is
    /// committed there yet. Used by the Processor's reorg check and by the
    /// Reconciler's periodic hash sampling.
    pub async fn block_hash_at(&self, height: u64) -> Result<Option<alloy::primitives::B256>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT hash FROM blocks WHERE number = $1")
            .bind(height as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(h,)| {
            h.parse().map_err(|e| IndexerError::SchemaViolation(format!("stored hash unparsable: {e}")))
        })
        .transpose()
    }

    /// Highest committed block height, or `None` if the table is empty.
    /// Used by the Consistency Guard's startup time-travel check.
    pub async fn max_block_height(&self) -> Result<Option<u64>> {
        let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(number) FROM blocks").fetch_one(&self.pool).await?;
        Ok(row.0.map(|n| n as u64))
    }

    pub async fn checkpoint(&self) -> Result<Option<SyncCheckpoint>> {
        let row: Option<(i64, i64, chrono::DateTime<chrono::Utc>)> =
            sqlx::query_as("SELECT chain_id, last_synced_block, updated_at FROM sync_checkpoints WHERE chain_id = $1")
                .bind(self.chain_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(chain_id, last, updated_at)| SyncCheckpoint {
            chain_id,
            last_synced_block: last as u64,
            updated_at,
        }))
    }

    /// Commits one `PersistTask`: the block row, its transfers, and the
    /// checkpoint advance all happen in a single transaction (spec.md §4.5
    /// step 5-6, testable property 4 "batch atomicity").
    pub async fn commit_task(&self, task: &PersistTask) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.insert_block(&mut tx, &task.block).await?;
        self.insert_transfers(&mut tx, &task.transfers).await?;
        self.advance_checkpoint(&mut tx, task.height).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Same as `commit_task` but for several tasks at once, via the store's
    /// fastest bulk path (`UNNEST`-based multi-row insert) rather than one
    /// round trip per block.
    pub async fn commit_batch(&self, tasks: &[PersistTask]) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        self.bulk_insert_blocks(&mut tx, tasks.iter().map(|t| &t.block)).await?;
        let all_transfers: Vec<&Transfer> = tasks.iter().flat_map(|t| t.transfers.iter()).collect();
        self.bulk_insert_transfers(&mut tx, all_transfers).await?;
        let max_height = tasks.iter().map(|t| t.height).max().unwrap_or(0);
        self.advance_checkpoint(&mut tx, max_height).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_block(&self, tx: &mut Transaction<'_, Postgres>, block: &Block) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO blocks (number, hash, parent_hash, timestamp, gas_limit, gas_used, transaction_count, base_fee_per_gas)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (number) DO NOTHING
            "#,
        )
        .bind(block.number as i64)
        .bind(block.hash.to_string())
        .bind(block.parent_hash.to_string())
        .bind(block.timestamp)
        .bind(block.gas_limit)
        .bind(block.gas_used)
        .bind(block.tx_count)
        .bind(block.base_fee_per_gas.map(u256_to_decimal))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// `UNNEST`-based bulk insert: portable across Postgres without a
    /// dialect-specific `COPY` path (documented open-question decision:
    /// only the portable path is implemented).
    async fn bulk_insert_blocks<'a>(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        blocks: impl Iterator<Item = &'a Block>,
    ) -> Result<()> {
        let mut numbers = Vec::new();
        let mut hashes = Vec::new();
        let mut parent_hashes = Vec::new();
        let mut timestamps = Vec::new();
        let mut gas_limits = Vec::new();
        let mut gas_useds = Vec::new();
        let mut tx_counts = Vec::new();
        let mut base_fees: Vec<Option<BigDecimal>> = Vec::new();

        for b in blocks {
            numbers.push(b.number as i64);
            hashes.push(b.hash.to_string());
            parent_hashes.push(b.parent_hash.to_string());
            timestamps.push(b.timestamp);
            gas_limits.push(b.gas_limit);
            gas_useds.push(b.gas_used);
            tx_counts.push(b.tx_count);
            base_fees.push(b.base_fee_per_gas.map(u256_to_decimal));
        }

        if numbers.is_empty() {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO blocks (number, hash, parent_hash, timestamp, gas_limit, gas_used, transaction_count, base_fee_per_gas)
            SELECT * FROM UNNEST($1::bigint[], $2::text[], $3::text[], $4::bigint[], $5::bigint[], $6::bigint[], $7::int[], $8::numeric[])
            ON CONFLICT (number) DO NOTHING
            "#,
        )
        .bind(&numbers)
        .bind(&hashes)
        .bind(&parent_hashes)
        .bind(&timestamps)
        .bind(&gas_limits)
        .bind(&gas_useds)
        .bind(&tx_counts)
        .bind(&base_fees)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_transfers(&self, tx: &mut Transaction<'_, Postgres>, transfers: &[Transfer]) -> Result<()> {
        self.bulk_insert_transfers(tx, transfers.iter().collect()).await
    }

    async fn bulk_insert_transfers(&self, tx: &mut Transaction<'_, Postgres>, transfers: Vec<&Transfer>) -> Result<()> {
        if transfers.is_empty() {
            return Ok(());
        }

        let block_numbers: Vec<i64> = transfers.iter().map(|t| t.block_height as i64).collect();
        let tx_hashes: Vec<String> = transfers.iter().map(|t| t.tx_hash.to_string()).collect();
        let log_indices: Vec<i32> = transfers.iter().map(|t| t.log_index as i32).collect();
        let froms: Vec<String> = transfers.iter().map(|t| format!("{:#x}", t.from)).collect();
        let tos: Vec<Option<String>> = transfers.iter().map(|t| t.to.map(|a| format!("{:#x}", a))).collect();
        let amounts: Vec<BigDecimal> = transfers.iter().map(|t| u256_to_decimal(t.amount)).collect();
        let tokens: Vec<Option<String>> = transfers.iter().map(|t| t.token_address.map(|a| format!("{:#x}", a))).collect();
        let symbols: Vec<Option<String>> = transfers.iter().map(|t| t.symbol.clone()).collect();
        let kinds: Vec<String> = transfers.iter().map(|t| t.transfer_type.as_str().to_string()).collect();

        sqlx::query(
            r#"
            INSERT INTO transfers (block_number, tx_hash, log_index, from_address, to_address, amount, token_address, symbol, activity_type)
            SELECT * FROM UNNEST($1::bigint[], $2::text[], $3::int[], $4::text[], $5::text[], $6::numeric[], $7::text[], $8::text[], $9::text[])
            ON CONFLICT (block_number, log_index) DO NOTHING
            "#,
        )
        .bind(&block_numbers)
        .bind(&tx_hashes)
        .bind(&log_indices)
        .bind(&froms)
        .bind(&tos)
        .bind(&amounts)
        .bind(&tokens)
        .bind(&symbols)
        .bind(&kinds)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn advance_checkpoint(&self, tx: &mut Transaction<'_, Postgres>, height: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_checkpoints (chain_id, last_synced_block, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (chain_id) DO UPDATE
            SET last_synced_block = GREATEST(sync_checkpoints.last_synced_block, EXCLUDED.last_synced_block),
                updated_at = now()
            "#,
        )
        .bind(self.chain_id)
        .bind(height as i64)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Explicit cursor reset, used only by reorg rollback and the
    /// deep-reorg recovery path. Unlike `advance_checkpoint`, this may
    /// move the cursor backward.
    pub async fn reset_checkpoint(&self, height: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_checkpoints (chain_id, last_synced_block, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (chain_id) DO UPDATE
            SET last_synced_block = EXCLUDED.last_synced_block, updated_at = now()
            "#,
        )
        .bind(self.chain_id)
        .bind(height as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Deletes every block (and cascading transfers) at heights
    /// `>= from_height`, in a single transaction, as the rollback half of
    /// reorg recovery (spec.md §4.5, §4.7).
    pub async fn rollback_from(&self, from_height: u64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM transfers WHERE block_number >= $1")
            .bind(from_height as i64)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM blocks WHERE number >= $1")
            .bind(from_height as i64)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_token_metadata(&self, address: alloy::primitives::Address, symbol: &str, decimals: i16, name: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO token_metadata (address, symbol, decimals, name, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (address) DO UPDATE
            SET symbol = EXCLUDED.symbol, decimals = EXCLUDED.decimals, name = EXCLUDED.name, updated_at = now()
            "#,
        )
        .bind(format!("{:#x}", address))
        .bind(symbol)
        .bind(decimals)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn token_symbol(&self, address: alloy::primitives::Address) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT symbol FROM token_metadata WHERE address = $1")
            .bind(format!("{:#x}", address))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(s,)| s))
    }

    /// Sample of committed block hashes in `[from, to]`, used by the
    /// Reconciler's periodic spot-check (spec.md §4.7).
    pub async fn sample_hashes(&self, from: u64, to: u64) -> Result<Vec<(u64, alloy::primitives::B256)>> {
        let rows: Vec<(i64, String)> = sqlx::query_as("SELECT number, hash FROM blocks WHERE number BETWEEN $1 AND $2 ORDER BY number")
            .bind(from as i64)
            .bind(to as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|(n, h)| {
                h.parse::<alloy::primitives::B256>()
                    .map(|hash| (n as u64, hash))
                    .map_err(|e| IndexerError::SchemaViolation(format!("stored hash unparsable: {e}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;

    #[test]
    fn max_u256_round_trips_through_decimal() {
        let max = U256::MAX;
        let decimal = u256_to_decimal(max);
        let back = decimal_to_u256(&decimal).unwrap();
        assert_eq!(max, back);
    }

    #[test]
    fn zero_round_trips() {
        let zero = alloy::primitives::U256::ZERO;
        let decimal = u256_to_decimal(zero);
        assert_eq!(decimal_to_u256(&decimal).unwrap(), zero);
    }
}
