use tracing::debug;

use crate::db::{MarketDb, RowFilter, Table};
use crate::error::Result;

/// Outcome of a staleness check: whether a refetch is needed, and the newest
/// stored snapshot timestamp when one exists (used to pin the read path to
/// that snapshot).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
    pub needs_update: bool,
    pub last_retrieve_time: Option<i64>,
}

impl Freshness {
    fn stale(last_retrieve_time: Option<i64>) -> Self {
        Self {
            needs_update: true,
            last_retrieve_time,
        }
    }

    fn fresh(last_retrieve_time: i64) -> Self {
        Self {
            needs_update: false,
            last_retrieve_time: Some(last_retrieve_time),
        }
    }
}

/// Decide whether stored rows matching `filter` are fresh enough to serve.
///
/// Stale when no rows match, or the newest timestamp is older than
/// `threshold_ts`. When `fresh_entry_check` is on, a recent snapshot with
/// fewer than `min_fresh_rows` rows at the newest timestamp is also treated
/// as stale: it means the previous fetch was interrupted mid-write and the
/// slice is incomplete. History checks turn this off — exactly one row per
/// day is expected there.
///
/// Read-only; never touches the remote source.
pub async fn check(
    db: &MarketDb,
    threshold_ts: i64,
    table: Table,
    filter: &RowFilter,
    min_fresh_rows: Option<i64>,
    fresh_entry_check: bool,
) -> Result<Freshness> {
    let Some(max_ts) = db.max_timestamp(table, filter).await? else {
        debug!(table = table.name(), ?filter, "no stored rows, update needed");
        return Ok(Freshness::stale(None));
    };

    if max_ts < threshold_ts {
        debug!(
            table = table.name(),
            ?filter,
            max_ts,
            threshold_ts,
            "stored snapshot too old, update needed"
        );
        return Ok(Freshness::stale(Some(max_ts)));
    }

    if fresh_entry_check {
        let min_fresh_rows = min_fresh_rows.unwrap_or(1);
        let rows_at_max = db.count_at(table, filter, max_ts).await?;
        if rows_at_max < min_fresh_rows {
            debug!(
                table = table.name(),
                ?filter,
                rows_at_max,
                min_fresh_rows,
                "snapshot looks partial, update needed"
            );
            return Ok(Freshness::stale(Some(max_ts)));
        }
    }

    Ok(Freshness::fresh(max_ts))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
