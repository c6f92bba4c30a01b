use anyhow::{anyhow, Result};
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use state::AuctionSnapshot;
use tracing::info;

pub const INIT_SQL: &str = include_str!("../../../scripts/init_db.sql");

const MEMORY_PREFIX: &str = "sqlite::memory:";
const REQUIRED_TABLES: [&str; 3] = ["runs", "snapshots", "incidents"];

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(path: &str) -> Result<Self> {
        // An in-memory sqlite database exists per connection, so the pool
        // must stay at a single connection for it.
        let max_connections = if path.starts_with(MEMORY_PREFIX) { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(path)
            .await?;
        run_init_sql(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn insert_run(&self, run_id: &str, git_sha: Option<&str>) -> Result<()> {
        let host = hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let ts_ms = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT OR REPLACE INTO runs (run_id, started_at_ms, git_sha, host) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(run_id)
        .bind(ts_ms)
        .bind(git_sha)
        .bind(host)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_snapshot(
        &self,
        run_id: &str,
        snapshot: &AuctionSnapshot,
        fetched_at_ms: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO snapshots (run_id, contract_address, sequence, bid_amount_wei, bidder, end_ts_ms, last_updated_ms, fetched_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(run_id)
        .bind(&snapshot.contract_address)
        .bind(snapshot.sequence as i64)
        .bind(snapshot.bid_amount_wei.to_string())
        .bind(snapshot.bidder.as_deref())
        .bind(snapshot.end_ts_ms)
        .bind(snapshot.last_updated_ms)
        .bind(fetched_at_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Newest persisted snapshot for the contract, used to warm-start the
    /// in-memory store before the first fetch lands.
    pub async fn latest_snapshot(&self, contract_address: &str) -> Result<Option<AuctionSnapshot>> {
        let row = sqlx::query(
            "SELECT contract_address, sequence, bid_amount_wei, bidder, end_ts_ms, last_updated_ms \
             FROM snapshots WHERE contract_address = ?1 ORDER BY sequence DESC LIMIT 1",
        )
        .bind(contract_address)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let bid_amount_wei: String = row.try_get("bid_amount_wei")?;
        let bid_amount_wei = bid_amount_wei
            .parse::<u128>()
            .map_err(|err| anyhow!("corrupt bid_amount_wei in snapshots table: {err}"))?;
        let sequence: i64 = row.try_get("sequence")?;
        Ok(Some(AuctionSnapshot {
            contract_address: row.try_get("contract_address")?,
            bid_amount_wei,
            bidder: row.try_get("bidder")?,
            end_ts_ms: row.try_get("end_ts_ms")?,
            last_updated_ms: row.try_get("last_updated_ms")?,
            sequence: sequence as u64,
        }))
    }

    pub async fn log_incident(
        &self,
        run_id: &str,
        severity: &str,
        kind: &str,
        message: &str,
    ) -> Result<()> {
        let ts_ms = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO incidents (run_id, ts_ms, severity, kind, message) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(run_id)
        .bind(ts_ms)
        .bind(severity)
        .bind(kind)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns the required tables missing from the database, empty when the
    /// schema is complete.
    pub async fn validate_required_tables(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table'")
            .fetch_all(&self.pool)
            .await?;
        let existing: Vec<String> = rows
            .iter()
            .filter_map(|row| row.try_get::<String, _>("name").ok())
            .collect();
        Ok(REQUIRED_TABLES
            .iter()
            .filter(|table| !existing.iter().any(|name| name == *table))
            .map(|table| table.to_string())
            .collect())
    }
}

pub async fn init_sqlite(path: &str) -> Result<Store> {
    let store = Store::connect(path).await?;
    info!(path = path, "sqlite initialized");
    Ok(store)
}

async fn run_init_sql(pool: &SqlitePool) -> Result<()> {
    for statement in INIT_SQL.split(';') {
        let trimmed = statement.trim();
        if trimmed.is_empty() {
            continue;
        }
        sqlx::query(trimmed).execute(pool).await?;
    }
    Ok(())
}
