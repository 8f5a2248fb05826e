use serde::{Deserialize, Serialize};

use crate::error::MirrorError;

// ---------------------------------------------------------------------------
// Stored records
// ---------------------------------------------------------------------------

/// One active market order as stored locally. `order_id` is the dedup key:
/// at most one row per order exists, and a later snapshot overwrites the
/// fields that change over an order's lifetime (price, volume_remain,
/// duration, issued, retrieve_time).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct MarketOrder {
    pub order_id: i64,
    pub type_id: i64,
    /// 0 when unknown (structure orders without a caller-supplied region).
    pub region_id: i64,
    /// 0 when unknown, same convention as region_id.
    pub system_id: i64,
    /// Station or structure the order sits in.
    pub location_id: i64,
    pub is_buy_order: bool,
    pub price: f64,
    pub volume_remain: i64,
    pub volume_total: i64,
    pub min_volume: i64,
    pub duration: i64,
    /// ISO timestamp as delivered by ESI.
    pub issued: String,
    pub range: String,
    /// Epoch seconds when this snapshot was taken.
    pub retrieve_time: i64,
}

/// One day of aggregate history for a (region_id, type_id, date) triple.
/// Immutable once written — history for a closed day never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct MarketHistoryRecord {
    pub region_id: i64,
    pub type_id: i64,
    /// Epoch seconds, normalized to 11:05 UTC of the day in question
    /// (see config::HISTORY_DATE_OFFSET_SECS).
    pub date: i64,
    pub average: f64,
    pub highest: f64,
    pub lowest: f64,
    pub volume: i64,
    pub order_count: i64,
}

// ---------------------------------------------------------------------------
// ESI wire types
// ---------------------------------------------------------------------------

/// An order as ESI serves it. The structure endpoint omits system_id and
/// the region is never present — both are stamped on during normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct EsiOrder {
    pub order_id: i64,
    pub type_id: i64,
    pub location_id: i64,
    #[serde(default)]
    pub system_id: i64,
    pub is_buy_order: bool,
    pub price: f64,
    pub volume_remain: i64,
    pub volume_total: i64,
    #[serde(default = "default_min_volume")]
    pub min_volume: i64,
    pub duration: i64,
    pub issued: String,
    #[serde(default = "default_range")]
    pub range: String,
}

fn default_min_volume() -> i64 {
    1
}

fn default_range() -> String {
    "region".to_string()
}

impl EsiOrder {
    /// Stamp snapshot metadata onto the wire order, producing the stored form.
    pub fn into_record(self, region_id: i64, system_id: i64, retrieve_time: i64) -> MarketOrder {
        let system_id = if self.system_id != 0 { self.system_id } else { system_id };
        MarketOrder {
            order_id: self.order_id,
            type_id: self.type_id,
            region_id,
            system_id,
            location_id: self.location_id,
            is_buy_order: self.is_buy_order,
            price: self.price,
            volume_remain: self.volume_remain,
            volume_total: self.volume_total,
            min_volume: self.min_volume,
            duration: self.duration,
            issued: self.issued,
            range: self.range,
            retrieve_time,
        }
    }
}

/// One day of history as ESI serves it. `date` is a "YYYY-MM-DD" string.
#[derive(Debug, Clone, Deserialize)]
pub struct EsiHistoryDay {
    pub date: String,
    pub average: f64,
    pub highest: f64,
    pub lowest: f64,
    pub volume: i64,
    pub order_count: i64,
}

// ---------------------------------------------------------------------------
// Order side filter
// ---------------------------------------------------------------------------

/// Which side of the book a query covers. Maps to ESI's `order_type`
/// query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    All,
    Sell,
    Buy,
}

impl OrderSide {
    /// Parse a caller-supplied side string. Unrecognized input is a
    /// validation error naming the accepted values — raised before any
    /// remote or store access.
    pub fn parse(s: &str) -> Result<Self, MirrorError> {
        match s {
            "all" => Ok(OrderSide::All),
            "sell" => Ok(OrderSide::Sell),
            "buy" => Ok(OrderSide::Buy),
            other => Err(MirrorError::Validation(format!(
                "order side accepts one of [\"all\", \"sell\", \"buy\"], not {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderSide::All => "all",
            OrderSide::Sell => "sell",
            OrderSide::Buy => "buy",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Per-operation options
// ---------------------------------------------------------------------------

/// Recognized options for region/station order queries. Replaces the loose
/// option bag the original interface grew around: everything is enumerated,
/// defaulted, and validated once at the boundary.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderQueryOptions {
    /// Fetch only this page instead of all pages. Only useful in testing.
    pub page: Option<u32>,
    /// Seconds a stored snapshot may age before refetching. Defaults to
    /// config::DEFAULT_UPDATE_THRESHOLD_SECS; a value <= 0 forces a refetch.
    pub update_threshold: Option<i64>,
}

/// Options for structure order queries. The structure endpoint never reports
/// a region or system, so callers that know them pass them here and they are
/// stamped onto every stored row (0 otherwise).
#[derive(Debug, Clone, Copy, Default)]
pub struct StructureQueryOptions {
    pub page: Option<u32>,
    pub update_threshold: Option<i64>,
    pub region_id: Option<i64>,
    pub system_id: Option<i64>,
}

/// Where region_types reads from: the paginated ESI type-list endpoint
/// (may include unpublished ids) or the local orders table (only ids that
/// actually had orders).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeSource {
    Esi,
    Db,
}

impl std::fmt::Display for TypeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeSource::Esi => write!(f, "esi"),
            TypeSource::Db => write!(f, "db"),
        }
    }
}

// ---------------------------------------------------------------------------
// History reduction
// ---------------------------------------------------------------------------

/// Pure post-processing applied to one type's daily series before bulk
/// concatenation. `name` participates in cache-key derivation so results
/// reduced differently never collide.
#[derive(Clone, Copy)]
pub struct HistoryReducer {
    pub name: &'static str,
    pub apply: fn(Vec<MarketHistoryRecord>) -> Vec<MarketHistoryRecord>,
}

impl std::fmt::Debug for HistoryReducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryReducer").field("name", &self.name).finish()
    }
}

/// Collapse a type's series into a single row carrying its total traded
/// volume over the whole series, dated at the newest day. The 60KB-per-type
/// responses make an unreduced bulk fetch unwieldy; this is the stock
/// reduction the original shipped.
pub const VOLUME_SUMMARY: HistoryReducer = HistoryReducer {
    name: "volume_summary",
    apply: reduce_volume,
};

fn reduce_volume(days: Vec<MarketHistoryRecord>) -> Vec<MarketHistoryRecord> {
    let Some(last) = days.last().cloned() else {
        return Vec::new();
    };
    let volume: i64 = days.iter().map(|d| d.volume).sum();
    let order_count: i64 = days.iter().map(|d| d.order_count).sum();
    vec![MarketHistoryRecord {
        volume,
        order_count,
        ..last
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_side_parse_accepts_known_values() {
        assert_eq!(OrderSide::parse("all").unwrap(), OrderSide::All);
        assert_eq!(OrderSide::parse("sell").unwrap(), OrderSide::Sell);
        assert_eq!(OrderSide::parse("buy").unwrap(), OrderSide::Buy);
    }

    #[test]
    fn order_side_parse_rejects_unknown_value() {
        let err = OrderSide::parse("short").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("\"all\""), "message should list accepted values: {msg}");
    }

    #[test]
    fn volume_summary_collapses_series() {
        let day = |date: i64, volume: i64| MarketHistoryRecord {
            region_id: 1,
            type_id: 34,
            date,
            average: 5.0,
            highest: 6.0,
            lowest: 4.0,
            volume,
            order_count: 10,
        };
        let reduced = (VOLUME_SUMMARY.apply)(vec![day(100, 7), day(200, 9)]);
        assert_eq!(reduced.len(), 1);
        assert_eq!(reduced[0].date, 200);
        assert_eq!(reduced[0].volume, 16);
        assert_eq!(reduced[0].order_count, 20);
    }

    #[test]
    fn volume_summary_of_empty_series_is_empty() {
        assert!((VOLUME_SUMMARY.apply)(Vec::new()).is_empty());
    }
}
