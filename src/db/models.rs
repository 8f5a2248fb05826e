//! Query-side types for the two mirrored tables. Records themselves live in
//! `crate::types`; these are the filter shapes the store builds WHERE
//! clauses from.

use crate::types::OrderSide;

/// The two mirrored tables and their freshness timestamp columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Orders,
    MarketHistory,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Table::Orders => "orders",
            Table::MarketHistory => "market_history",
        }
    }

    /// Column the freshness oracle compares against thresholds.
    pub fn timestamp_column(self) -> &'static str {
        match self {
            Table::Orders => "retrieve_time",
            Table::MarketHistory => "date",
        }
    }
}

/// Identity filter shared by freshness checks and reads: any combination of
/// region, location, and type. An unset field matches everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowFilter {
    pub region_id: Option<i64>,
    pub location_id: Option<i64>,
    pub type_id: Option<i64>,
}

impl RowFilter {
    pub fn region(region_id: i64) -> Self {
        Self {
            region_id: Some(region_id),
            ..Self::default()
        }
    }

    pub fn location(location_id: i64) -> Self {
        Self {
            location_id: Some(location_id),
            ..Self::default()
        }
    }

    pub fn region_type(region_id: i64, type_id: i64) -> Self {
        Self {
            region_id: Some(region_id),
            type_id: Some(type_id),
            ..Self::default()
        }
    }

    pub fn with_location(mut self, location_id: i64) -> Self {
        self.location_id = Some(location_id);
        self
    }

    pub fn with_type(mut self, type_id: Option<i64>) -> Self {
        self.type_id = type_id;
        self
    }
}

/// Read-path filter for orders: identity plus book side and an optional
/// snapshot pin (rows from one retrieve_time only).
#[derive(Debug, Clone, Copy)]
pub struct OrderFilter {
    pub rows: RowFilter,
    pub side: OrderSide,
    pub retrieve_time: Option<i64>,
}

impl OrderFilter {
    pub fn new(rows: RowFilter) -> Self {
        Self {
            rows,
            side: OrderSide::All,
            retrieve_time: None,
        }
    }

    pub fn side(mut self, side: OrderSide) -> Self {
        self.side = side;
        self
    }

    pub fn at(mut self, retrieve_time: Option<i64>) -> Self {
        self.retrieve_time = retrieve_time;
        self
    }
}
