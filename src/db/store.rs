use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use crate::db::models::{OrderFilter, RowFilter, Table};
use crate::error::Result;
use crate::types::{MarketHistoryRecord, MarketOrder, OrderSide};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Durable store for mirrored orders and history. Owns the SQLite pool;
/// lifecycle is caller-controlled — construct once, pass by reference.
///
/// All mutation goes through the two upserts, each of which runs as one
/// transaction so a batch is either fully visible or not at all.
#[derive(Debug, Clone)]
pub struct MarketDb {
    pool: SqlitePool,
}

impl MarketDb {
    /// Open (creating if missing) the database at `path` and apply migrations.
    pub async fn connect(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory database with migrations applied. A single connection is
    /// forced because each new `:memory:` connection is a fresh database.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // -----------------------------------------------------------------------
    // Upserts
    // -----------------------------------------------------------------------

    /// Insert-or-update keyed by order_id. An order is a single mutable
    /// entity over its lifetime, so the fields that change (price, remaining
    /// volume, duration, issued, retrieve_time) are overwritten — last write
    /// wins. A zero region/system on the incoming row never clobbers a known
    /// value already stored.
    pub async fn upsert_orders(&self, records: &[MarketOrder]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for r in records {
            sqlx::query(
                r#"
                INSERT INTO orders (
                    order_id, type_id, region_id, system_id, location_id,
                    is_buy_order, price, volume_remain, volume_total,
                    min_volume, duration, issued, range, retrieve_time
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(order_id) DO UPDATE SET
                    price = excluded.price,
                    volume_remain = excluded.volume_remain,
                    duration = excluded.duration,
                    issued = excluded.issued,
                    retrieve_time = excluded.retrieve_time,
                    region_id = CASE WHEN excluded.region_id != 0
                        THEN excluded.region_id ELSE orders.region_id END,
                    system_id = CASE WHEN excluded.system_id != 0
                        THEN excluded.system_id ELSE orders.system_id END
                "#,
            )
            .bind(r.order_id)
            .bind(r.type_id)
            .bind(r.region_id)
            .bind(r.system_id)
            .bind(r.location_id)
            .bind(r.is_buy_order)
            .bind(r.price)
            .bind(r.volume_remain)
            .bind(r.volume_total)
            .bind(r.min_volume)
            .bind(r.duration)
            .bind(&r.issued)
            .bind(&r.range)
            .bind(r.retrieve_time)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(rows = records.len(), "upserted orders");
        Ok(())
    }

    /// Insert-or-ignore keyed by (region_id, type_id, date). History for a
    /// closed day is immutable, so the first successful write is
    /// authoritative and colliding rows are discarded.
    pub async fn upsert_history(&self, records: &[MarketHistoryRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for r in records {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO market_history (
                    region_id, type_id, date, average, highest, lowest,
                    volume, order_count
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(r.region_id)
            .bind(r.type_id)
            .bind(r.date)
            .bind(r.average)
            .bind(r.highest)
            .bind(r.lowest)
            .bind(r.volume)
            .bind(r.order_count)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(rows = records.len(), "upserted history");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Orders matching the filter, in the cosmetic (type, side, price) order
    /// the callers expect. Sorting does not affect correctness.
    pub async fn select_orders(&self, filter: &OrderFilter) -> Result<Vec<MarketOrder>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT order_id, type_id, region_id, system_id, location_id, \
             is_buy_order, price, volume_remain, volume_total, min_volume, \
             duration, issued, range, retrieve_time FROM orders WHERE 1 = 1",
        );
        push_row_filter(&mut qb, &filter.rows);
        match filter.side {
            OrderSide::All => {}
            OrderSide::Sell => {
                qb.push(" AND is_buy_order = 0");
            }
            OrderSide::Buy => {
                qb.push(" AND is_buy_order = 1");
            }
        }
        if let Some(ts) = filter.retrieve_time {
            qb.push(" AND retrieve_time = ").push_bind(ts);
        }
        qb.push(" ORDER BY type_id ASC, is_buy_order ASC, price ASC");

        let rows = qb
            .build_query_as::<MarketOrder>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Every stored day for one (region, type), oldest first.
    pub async fn select_history(
        &self,
        region_id: i64,
        type_id: i64,
    ) -> Result<Vec<MarketHistoryRecord>> {
        let rows = sqlx::query_as::<_, MarketHistoryRecord>(
            "SELECT region_id, type_id, date, average, highest, lowest, \
             volume, order_count FROM market_history \
             WHERE region_id = ? AND type_id = ? ORDER BY date ASC",
        )
        .bind(region_id)
        .bind(type_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Newest timestamp-column value among rows matching the filter.
    /// None when no rows match.
    pub async fn max_timestamp(&self, table: Table, filter: &RowFilter) -> Result<Option<i64>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT MAX({}) FROM {} WHERE 1 = 1",
            table.timestamp_column(),
            table.name()
        ));
        push_row_filter(&mut qb, filter);
        let max: Option<i64> = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(max)
    }

    /// Rows matching the filter whose timestamp column equals `ts` exactly.
    /// Used to detect a partial prior snapshot.
    pub async fn count_at(&self, table: Table, filter: &RowFilter, ts: i64) -> Result<i64> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT COUNT(*) FROM {} WHERE {} = ",
            table.name(),
            table.timestamp_column()
        ));
        qb.push_bind(ts);
        push_row_filter(&mut qb, filter);
        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count)
    }

    /// Type ids with at least one stored order in the region. Order carries
    /// no meaning.
    pub async fn distinct_type_ids(&self, region_id: i64) -> Result<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT type_id FROM orders WHERE region_id = ?",
        )
        .bind(region_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

fn push_row_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &RowFilter) {
    if let Some(region_id) = filter.region_id {
        qb.push(" AND region_id = ").push_bind(region_id);
    }
    if let Some(location_id) = filter.location_id {
        qb.push(" AND location_id = ").push_bind(location_id);
    }
    if let Some(type_id) = filter.type_id {
        qb.push(" AND type_id = ").push_bind(type_id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
