//! Local freshness-aware mirror of EVE Online ESI market data.
//!
//! Orders and daily history are pulled from the paginated ESI endpoints into
//! a SQLite store. A per-call freshness check decides between serving stored
//! rows and refetching, and a short-lived response cache keyed by call
//! signature sits in front of both.

pub mod cache;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod freshness;
pub mod market;
pub mod types;

pub use cache::{CacheExpiry, CacheKey, CachedValue, ResponseCache};
pub use client::EsiClient;
pub use config::Config;
pub use db::{MarketDb, OrderFilter, RowFilter, Table};
pub use error::{MirrorError, Result};
pub use freshness::Freshness;
pub use market::MarketService;
pub use types::{
    HistoryReducer, MarketHistoryRecord, MarketOrder, OrderQueryOptions, OrderSide,
    StructureQueryOptions, TypeSource, VOLUME_SUMMARY,
};
