//! Postgres-backed store.

use super::{BlockRecord, DecodedEvent, LogRecord, Store, StoreTx, StoredBlock, TransactionRecord};
use alloy::primitives::{B256, U256};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use eyre::{Result, WrapErr};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::fmt::LowerHex;
use std::str::FromStr;

const SCHEMA_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS blocks (
    blockchain_id TEXT NOT NULL,
    number BIGINT NOT NULL,
    hash TEXT NOT NULL,
    parent_hash TEXT NOT NULL,
    nonce TEXT NOT NULL,
    gas_limit BIGINT NOT NULL,
    gas_used BIGINT NOT NULL,
    timestamp BIGINT NOT NULL,
    sha3_uncles TEXT NOT NULL,
    logs_bloom TEXT NOT NULL,
    transactions_root TEXT NOT NULL,
    receipts_root TEXT NOT NULL,
    state_root TEXT NOT NULL,
    mix_hash TEXT NOT NULL,
    miner TEXT NOT NULL,
    difficulty NUMERIC NOT NULL,
    extra_data TEXT NOT NULL,
    size BIGINT,
    transaction_count BIGINT NOT NULL,
    inserted_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (blockchain_id, hash)
);
CREATE INDEX IF NOT EXISTS blocks_chain_number_idx ON blocks (blockchain_id, number);

CREATE TABLE IF NOT EXISTS ommers (
    blockchain_id TEXT NOT NULL,
    ommer_hash TEXT NOT NULL,
    nibling_hash TEXT NOT NULL,
    UNIQUE (blockchain_id, ommer_hash, nibling_hash)
);

CREATE TABLE IF NOT EXISTS transactions (
    blockchain_id TEXT NOT NULL,
    block_hash TEXT NOT NULL,
    hash TEXT NOT NULL,
    nonce BIGINT NOT NULL,
    transaction_index BIGINT,
    from_address TEXT NOT NULL,
    to_address TEXT,
    value NUMERIC NOT NULL,
    gas_price NUMERIC,
    gas NUMERIC NOT NULL,
    input TEXT NOT NULL,
    status BOOLEAN NOT NULL,
    contract_address TEXT,
    v BIGINT,
    r TEXT,
    s TEXT
);
CREATE INDEX IF NOT EXISTS transactions_block_hash_idx ON transactions (block_hash);
CREATE INDEX IF NOT EXISTS transactions_hash_idx ON transactions (hash);

CREATE TABLE IF NOT EXISTS logs (
    log_id BIGSERIAL PRIMARY KEY,
    blockchain_id TEXT NOT NULL,
    transaction_hash TEXT NOT NULL,
    block_number BIGINT NOT NULL,
    log_index BIGINT NOT NULL,
    address TEXT NOT NULL,
    data TEXT NOT NULL,
    topic0 TEXT,
    topic1 TEXT,
    topic2 TEXT,
    topic3 TEXT
);
CREATE INDEX IF NOT EXISTS logs_chain_block_idx ON logs (blockchain_id, block_number);
CREATE INDEX IF NOT EXISTS logs_transaction_idx ON logs (transaction_hash);

CREATE TABLE IF NOT EXISTS decoded_events (
    log_id BIGINT NOT NULL,
    address TEXT NOT NULL,
    event_name TEXT NOT NULL,
    signature TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS decoded_events_log_idx ON decoded_events (log_id);
"#;

/// Session pool over Postgres.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(db_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(db_url)
            .await
            .wrap_err("failed to connect to Postgres")?;
        Ok(Self { pool })
    }

    /// Create tables and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_DDL)
            .execute(&self.pool)
            .await
            .wrap_err("failed to ensure schema")?;
        Ok(())
    }
}

fn hex<T: LowerHex>(value: &T) -> String {
    format!("{value:#x}")
}

fn opt_hex<T: LowerHex>(value: &Option<T>) -> Option<String> {
    value.as_ref().map(hex)
}

fn decimal(value: &U256) -> BigDecimal {
    // U256 renders as a decimal string, which BigDecimal parses exactly.
    BigDecimal::from_str(&value.to_string()).unwrap_or_default()
}

fn decimal_u128(value: u128) -> BigDecimal {
    BigDecimal::from_str(&value.to_string()).unwrap_or_default()
}

#[async_trait]
impl Store for PgStore {
    async fn latest_block_number(&self, blockchain_id: &str) -> Result<Option<u64>> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(number) FROM blocks WHERE blockchain_id = $1")
                .bind(blockchain_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(max.map(|number| number as u64))
    }

    async fn block_by_hash(&self, blockchain_id: &str, hash: B256) -> Result<Option<StoredBlock>> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT transaction_count FROM blocks WHERE blockchain_id = $1 AND hash = $2",
        )
        .bind(blockchain_id)
        .bind(hex(&hash))
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.map(|transaction_count| StoredBlock {
            transaction_count: transaction_count as u64,
        }))
    }

    async fn transaction_count_at(&self, blockchain_id: &str, number: u64) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM transactions \
             WHERE blockchain_id = $1 AND block_hash IN \
             (SELECT hash FROM blocks WHERE blockchain_id = $1 AND number = $2)",
        )
        .bind(blockchain_id)
        .bind(number as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn insert_block(&self, blockchain_id: &str, block: &BlockRecord) -> Result<u64> {
        let result = sqlx::query(
            "INSERT INTO blocks (blockchain_id, number, hash, parent_hash, nonce, gas_limit, \
             gas_used, timestamp, sha3_uncles, logs_bloom, transactions_root, receipts_root, \
             state_root, mix_hash, miner, difficulty, extra_data, size, transaction_count) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, \
             $18, $19) ON CONFLICT (blockchain_id, hash) DO NOTHING",
        )
        .bind(blockchain_id)
        .bind(block.number as i64)
        .bind(hex(&block.hash))
        .bind(hex(&block.parent_hash))
        .bind(hex(&block.nonce))
        .bind(block.gas_limit as i64)
        .bind(block.gas_used as i64)
        .bind(block.timestamp as i64)
        .bind(hex(&block.sha3_uncles))
        .bind(hex(&block.logs_bloom))
        .bind(hex(&block.transactions_root))
        .bind(hex(&block.receipts_root))
        .bind(hex(&block.state_root))
        .bind(hex(&block.mix_hash))
        .bind(hex(&block.miner))
        .bind(decimal(&block.difficulty))
        .bind(hex(&block.extra_data))
        .bind(block.size.map(|size| size as i64))
        .bind(block.transaction_count as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn flush_height(&self, blockchain_id: &str, number: u64) -> Result<()> {
        sqlx::query(
            "DELETE FROM decoded_events WHERE log_id IN \
             (SELECT log_id FROM logs WHERE blockchain_id = $1 AND block_number = $2)",
        )
        .bind(blockchain_id)
        .bind(number as i64)
        .execute(&self.pool)
        .await?;
        sqlx::query("DELETE FROM logs WHERE blockchain_id = $1 AND block_number = $2")
            .bind(blockchain_id)
            .bind(number as i64)
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "DELETE FROM transactions WHERE blockchain_id = $1 AND block_hash IN \
             (SELECT hash FROM blocks WHERE blockchain_id = $1 AND number = $2)",
        )
        .bind(blockchain_id)
        .bind(number as i64)
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "DELETE FROM ommers WHERE blockchain_id = $1 AND nibling_hash IN \
             (SELECT hash FROM blocks WHERE blockchain_id = $1 AND number = $2)",
        )
        .bind(blockchain_id)
        .bind(number as i64)
        .execute(&self.pool)
        .await?;
        sqlx::query("DELETE FROM blocks WHERE blockchain_id = $1 AND number = $2")
            .bind(blockchain_id)
            .bind(number as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStoreTx { tx }))
    }
}

struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn delete_logs_at(&mut self, blockchain_id: &str, number: u64) -> Result<u64> {
        sqlx::query(
            "DELETE FROM decoded_events WHERE log_id IN \
             (SELECT log_id FROM logs WHERE blockchain_id = $1 AND block_number = $2)",
        )
        .bind(blockchain_id)
        .bind(number as i64)
        .execute(&mut *self.tx)
        .await?;
        let result =
            sqlx::query("DELETE FROM logs WHERE blockchain_id = $1 AND block_number = $2")
                .bind(blockchain_id)
                .bind(number as i64)
                .execute(&mut *self.tx)
                .await?;
        Ok(result.rows_affected())
    }

    async fn delete_transactions_at(&mut self, blockchain_id: &str, number: u64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM transactions WHERE blockchain_id = $1 AND block_hash IN \
             (SELECT hash FROM blocks WHERE blockchain_id = $1 AND number = $2)",
        )
        .bind(blockchain_id)
        .bind(number as i64)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_ommer(
        &mut self,
        blockchain_id: &str,
        ommer_hash: B256,
        nibling_hash: B256,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO ommers (blockchain_id, ommer_hash, nibling_hash) VALUES ($1, $2, $3) \
             ON CONFLICT (blockchain_id, ommer_hash, nibling_hash) DO NOTHING",
        )
        .bind(blockchain_id)
        .bind(hex(&ommer_hash))
        .bind(hex(&nibling_hash))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_transaction(
        &mut self,
        blockchain_id: &str,
        tx: &TransactionRecord,
    ) -> Result<u64> {
        let result = sqlx::query(
            "INSERT INTO transactions (blockchain_id, block_hash, hash, nonce, \
             transaction_index, from_address, to_address, value, gas_price, gas, input, status, \
             contract_address, v, r, s) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(blockchain_id)
        .bind(hex(&tx.block_hash))
        .bind(hex(&tx.hash))
        .bind(tx.nonce as i64)
        .bind(tx.transaction_index.map(|index| index as i64))
        .bind(hex(&tx.from))
        .bind(opt_hex(&tx.to))
        .bind(decimal(&tx.value))
        .bind(tx.gas_price.map(decimal_u128))
        .bind(decimal_u128(tx.gas))
        .bind(hex(&tx.input))
        .bind(tx.status)
        .bind(opt_hex(&tx.contract_address))
        .bind(tx.v.map(|v| v as i64))
        .bind(opt_hex(&tx.r))
        .bind(opt_hex(&tx.s))
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_logs_by_transaction(&mut self, transaction_hash: B256) -> Result<u64> {
        sqlx::query(
            "DELETE FROM decoded_events WHERE log_id IN \
             (SELECT log_id FROM logs WHERE transaction_hash = $1)",
        )
        .bind(hex(&transaction_hash))
        .execute(&mut *self.tx)
        .await?;
        let result = sqlx::query("DELETE FROM logs WHERE transaction_hash = $1")
            .bind(hex(&transaction_hash))
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_log(&mut self, blockchain_id: &str, log: &LogRecord) -> Result<Option<i64>> {
        let log_id: Option<i64> = sqlx::query_scalar(
            "INSERT INTO logs (blockchain_id, transaction_hash, block_number, log_index, \
             address, data, topic0, topic1, topic2, topic3) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING log_id",
        )
        .bind(blockchain_id)
        .bind(hex(&log.transaction_hash))
        .bind(log.block_number as i64)
        .bind(log.log_index as i64)
        .bind(hex(&log.address))
        .bind(hex(&log.data))
        .bind(opt_hex(&log.topics[0]))
        .bind(opt_hex(&log.topics[1]))
        .bind(opt_hex(&log.topics[2]))
        .bind(opt_hex(&log.topics[3]))
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(log_id)
    }

    async fn insert_decoded_event(&mut self, event: &DecodedEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO decoded_events (log_id, address, event_name, signature) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(event.log_id)
        .bind(hex(&event.address))
        .bind(&event.name)
        .bind(&event.signature)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
