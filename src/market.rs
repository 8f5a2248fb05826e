use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use futures_util::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info};

use crate::cache::{now_secs, CacheExpiry, CacheKey, CachedValue, ResponseCache};
use crate::client::{history_day_to_record, EsiClient};
use crate::config::{
    DEFAULT_UPDATE_THRESHOLD_SECS, HISTORY_UPDATE_THRESHOLD_SECS, MIN_FRESH_ORDER_ROWS,
};
use crate::db::{MarketDb, OrderFilter, RowFilter, Table};
use crate::error::{MirrorError, Result};
use crate::freshness;
use crate::types::{
    HistoryReducer, MarketHistoryRecord, MarketOrder, OrderQueryOptions, OrderSide,
    StructureQueryOptions, TypeSource,
};

/// The context every query runs against: remote client, durable store, and
/// the response cache. Constructed once by the caller; holds no per-call
/// state — everything a query produces lives in the store or the cache.
///
/// Every operation follows the same skeleton: response-cache hit returns
/// immediately; otherwise the freshness oracle decides between reading the
/// store and fetching. A fetch always runs to completion (all pages merged,
/// rows upserted, cache populated) before anything is returned.
pub struct MarketService {
    client: EsiClient,
    db: MarketDb,
    cache: ResponseCache,
    fan_out: usize,
}

impl MarketService {
    pub fn new(client: EsiClient, db: MarketDb, fan_out: usize) -> Self {
        Self {
            client,
            db,
            cache: ResponseCache::new(),
            fan_out: fan_out.max(1),
        }
    }

    pub fn db(&self) -> &MarketDb {
        &self.db
    }

    // -----------------------------------------------------------------------
    // Order queries
    // -----------------------------------------------------------------------

    /// Active orders in a player structure. Requires docking/market access,
    /// carried by the client's bearer token; the token never participates in
    /// cache-key derivation. The structure endpoint reports neither region
    /// nor system, so callers that know them supply them in `opts` and they
    /// are stamped onto every stored row (0 otherwise).
    pub async fn structure_orders(
        &self,
        structure_id: i64,
        opts: StructureQueryOptions,
    ) -> Result<Vec<MarketOrder>> {
        validate_page(opts.page)?;

        let key = CacheKey::for_op("structure_orders")
            .arg(structure_id)
            .kwarg("page", opts.page)
            .kwarg("region_id", opts.region_id)
            .kwarg("system_id", opts.system_id)
            .kwarg("update_threshold", opts.update_threshold)
            .finish();
        if let Some(CachedValue::Orders(orders)) = self.cache.get(&key) {
            debug!(structure_id, "structure_orders served from response cache");
            return Ok(orders);
        }

        let threshold = opts
            .update_threshold
            .unwrap_or(DEFAULT_UPDATE_THRESHOLD_SECS);
        let filter = RowFilter::location(structure_id);
        let check = freshness::check(
            &self.db,
            now_secs() - threshold,
            Table::Orders,
            &filter,
            Some(MIN_FRESH_ORDER_ROWS),
            true,
        )
        .await?;

        if !check.needs_update {
            return self
                .db
                .select_orders(&OrderFilter::new(filter).at(check.last_retrieve_time))
                .await;
        }

        let path = format!("/markets/structures/{structure_id}/");
        let probe = self.client.probe(&path, &[]).await?;
        let pages = requested_pages(opts.page, probe.pages);

        let fetched = self.client.fetch_order_pages(&path, &[], &pages).await?;
        let retrieve_time = now_secs();
        let mut records: Vec<MarketOrder> = fetched
            .into_iter()
            .map(|o| {
                o.into_record(
                    opts.region_id.unwrap_or(0),
                    opts.system_id.unwrap_or(0),
                    retrieve_time,
                )
            })
            .collect();
        sort_orders(&mut records);

        self.db.upsert_orders(&records).await?;
        self.cache.set(
            &key,
            CachedValue::Orders(records.clone()),
            order_expiry(opts.update_threshold, probe.expires_at),
        );
        info!(
            structure_id,
            pages = pages.len(),
            orders = records.len(),
            "structure orders refreshed"
        );
        Ok(records)
    }

    /// Active orders across a region, optionally narrowed to one side of the
    /// book and/or one type. The side/type narrowing happens server-side on
    /// the fetch path and in SQL on the read path.
    pub async fn region_orders(
        &self,
        region_id: i64,
        side: OrderSide,
        type_id: Option<i64>,
        opts: OrderQueryOptions,
    ) -> Result<Vec<MarketOrder>> {
        validate_page(opts.page)?;

        let key = CacheKey::for_op("region_orders")
            .arg(region_id)
            .arg(side)
            .arg_opt(type_id)
            .kwarg("page", opts.page)
            .kwarg("update_threshold", opts.update_threshold)
            .finish();
        if let Some(CachedValue::Orders(orders)) = self.cache.get(&key) {
            debug!(region_id, "region_orders served from response cache");
            return Ok(orders);
        }

        let threshold = opts
            .update_threshold
            .unwrap_or(DEFAULT_UPDATE_THRESHOLD_SECS);
        let filter = RowFilter::region(region_id);
        let check = freshness::check(
            &self.db,
            now_secs() - threshold,
            Table::Orders,
            &filter,
            Some(MIN_FRESH_ORDER_ROWS),
            true,
        )
        .await?;

        if !check.needs_update {
            return self
                .db
                .select_orders(
                    &OrderFilter::new(filter.with_type(type_id))
                        .side(side)
                        .at(check.last_retrieve_time),
                )
                .await;
        }

        let path = format!("/markets/{region_id}/orders/");
        let mut query = vec![("order_type".to_string(), side.to_string())];
        if let Some(tid) = type_id {
            query.push(("type_id".to_string(), tid.to_string()));
        }
        let probe = self.client.probe(&path, &query).await?;
        let pages = requested_pages(opts.page, probe.pages);

        let fetched = self.client.fetch_order_pages(&path, &query, &pages).await?;
        let retrieve_time = now_secs();
        let mut records: Vec<MarketOrder> = fetched
            .into_iter()
            .map(|o| o.into_record(region_id, 0, retrieve_time))
            .collect();
        sort_orders(&mut records);

        self.db.upsert_orders(&records).await?;
        self.cache.set(
            &key,
            CachedValue::Orders(records.clone()),
            order_expiry(opts.update_threshold, probe.expires_at),
        );
        info!(
            region_id,
            %side,
            pages = pages.len(),
            orders = records.len(),
            "region orders refreshed"
        );
        Ok(records)
    }

    /// Active orders at one NPC station. There is no station endpoint:
    /// staleness is judged on the (region, station) slice, a stale slice
    /// refreshes the whole region, and the result is read back filtered to
    /// the station at the newest stored snapshot. Resolving the station's
    /// region is the caller's lookup.
    pub async fn station_orders(
        &self,
        station_id: i64,
        region_id: i64,
        side: OrderSide,
        type_id: Option<i64>,
        update_threshold: Option<i64>,
    ) -> Result<Vec<MarketOrder>> {
        let key = CacheKey::for_op("station_orders")
            .arg(station_id)
            .arg(region_id)
            .arg(side)
            .arg_opt(type_id)
            .kwarg("update_threshold", update_threshold)
            .finish();
        if let Some(CachedValue::Orders(orders)) = self.cache.get(&key) {
            debug!(station_id, "station_orders served from response cache");
            return Ok(orders);
        }

        let threshold = update_threshold.unwrap_or(DEFAULT_UPDATE_THRESHOLD_SECS);
        let filter = RowFilter::region(region_id).with_location(station_id);
        let check = freshness::check(
            &self.db,
            now_secs() - threshold,
            Table::Orders,
            &filter,
            Some(MIN_FRESH_ORDER_ROWS),
            true,
        )
        .await?;

        let snapshot = if check.needs_update {
            self.region_orders(
                region_id,
                side,
                type_id,
                OrderQueryOptions {
                    page: None,
                    update_threshold,
                },
            )
            .await?;
            // Pin the read to the snapshot the refresh just produced.
            self.db.max_timestamp(Table::Orders, &filter).await?
        } else {
            check.last_retrieve_time
        };

        let orders = self
            .db
            .select_orders(
                &OrderFilter::new(filter.with_type(type_id))
                    .side(side)
                    .at(snapshot),
            )
            .await?;
        self.cache.set(
            &key,
            CachedValue::Orders(orders.clone()),
            order_expiry(update_threshold, None),
        );
        Ok(orders)
    }

    // -----------------------------------------------------------------------
    // History queries
    // -----------------------------------------------------------------------

    /// Daily history of one type in one region. An unpublished type id is a
    /// valid query with an empty answer — the region type list routinely
    /// contains ids the history endpoint would 404 on. When a reducer is
    /// given it collapses the series after the read or fetch.
    pub async fn type_history(
        &self,
        region_id: i64,
        type_id: i64,
        reducer: Option<&HistoryReducer>,
    ) -> Result<Vec<MarketHistoryRecord>> {
        let key = CacheKey::for_op("type_history")
            .arg(region_id)
            .arg(type_id)
            .kwarg("reduce", reducer.map(|r| r.name))
            .finish();
        if let Some(CachedValue::History(days)) = self.cache.get(&key) {
            debug!(region_id, type_id, "type_history served from response cache");
            return Ok(days);
        }

        // The history endpoint's Expires hint governs the cached answer
        // whether it comes off the wire or out of the store.
        let path = format!("/markets/{region_id}/history/");
        let probe = self
            .client
            .probe(&path, &[("type_id".to_string(), type_id.to_string())])
            .await?;

        let slice = self.type_history_slice(region_id, type_id).await?;
        if slice.fetched {
            self.db.upsert_history(&slice.days).await?;
        }

        let out = match reducer {
            Some(r) => (r.apply)(slice.days),
            None => slice.days,
        };
        self.cache.set(
            &key,
            CachedValue::History(out.clone()),
            match probe.expires_at {
                Some(at) => CacheExpiry::At(at),
                None => CacheExpiry::Default,
            },
        );
        Ok(out)
    }

    /// History for many types of a region in one call: a bounded fan-out of
    /// per-type sub-queries whose non-empty series are (optionally reduced
    /// and) concatenated. All store writes happen here, after the fan-out,
    /// so the fetch tasks only ever read. A transport failure in any
    /// sub-query fails the whole call with none of its fetches persisted.
    ///
    /// With `type_ids = None` the set is discovered via the region type
    /// list, and the cache key says "all" so the cached bulk result does not
    /// churn whenever the discovered list does.
    pub async fn region_history(
        &self,
        region_id: i64,
        type_ids: Option<Vec<i64>>,
        reducer: Option<&HistoryReducer>,
    ) -> Result<Vec<MarketHistoryRecord>> {
        let (ids, ids_key): (Vec<i64>, String) = match type_ids {
            Some(ids) => {
                let mut hasher = DefaultHasher::new();
                ids.hash(&mut hasher);
                let digest = format!("ids:{:016x}", hasher.finish());
                (ids, digest)
            }
            None => (
                self.region_types(region_id, TypeSource::Esi).await?,
                "all".to_string(),
            ),
        };

        let key = CacheKey::for_op("region_history")
            .arg(region_id)
            .arg(&ids_key)
            .kwarg("reduce", reducer.map(|r| r.name))
            .finish();
        if let Some(CachedValue::History(days)) = self.cache.get(&key) {
            debug!(region_id, "region_history served from response cache");
            return Ok(days);
        }

        // One expiry hint covers the whole batch; the history endpoint
        // expires at the same instant for every type.
        let expires_at = match ids.first() {
            Some(&first) => {
                let path = format!("/markets/{region_id}/history/");
                self.client
                    .probe(&path, &[("type_id".to_string(), first.to_string())])
                    .await?
                    .expires_at
            }
            None => None,
        };

        let slices: Vec<(i64, TypeHistorySlice)> = stream::iter(ids.iter().copied())
            .map(|type_id| async move {
                self.type_history_slice(region_id, type_id)
                    .await
                    .map(|slice| (type_id, slice))
            })
            .buffer_unordered(self.fan_out)
            .try_collect()
            .await?;

        let mut out = Vec::new();
        let mut fetched_types = 0usize;
        for (_, slice) in slices {
            if slice.fetched {
                self.db.upsert_history(&slice.days).await?;
                fetched_types += 1;
            }
            if slice.days.is_empty() {
                continue;
            }
            match reducer {
                Some(r) => out.extend((r.apply)(slice.days)),
                None => out.extend(slice.days),
            }
        }

        self.cache.set(
            &key,
            CachedValue::History(out.clone()),
            match expires_at {
                Some(at) => CacheExpiry::At(at),
                None => CacheExpiry::Default,
            },
        );
        info!(
            region_id,
            types = ids.len(),
            fetched = fetched_types,
            rows = out.len(),
            "region history assembled"
        );
        Ok(out)
    }

    /// Type ids with active orders in a region, either from the paginated
    /// ESI type list (may contain unpublished ids) or from the local orders
    /// table (only ids actually seen on the market).
    pub async fn region_types(&self, region_id: i64, source: TypeSource) -> Result<Vec<i64>> {
        let key = CacheKey::for_op("region_types")
            .arg(region_id)
            .arg(source)
            .finish();
        if let Some(CachedValue::TypeIds(ids)) = self.cache.get(&key) {
            debug!(region_id, "region_types served from response cache");
            return Ok(ids);
        }

        let (ids, expiry) = match source {
            TypeSource::Esi => {
                let path = format!("/markets/{region_id}/types/");
                let probe = self.client.probe(&path, &[]).await?;
                let pages: Vec<u32> = (1..=probe.pages).collect();
                let ids = self.client.fetch_pages::<i64>(&path, &[], &pages).await?;
                let expiry = match probe.expires_at {
                    Some(at) => CacheExpiry::At(at),
                    None => CacheExpiry::Default,
                };
                (ids, expiry)
            }
            TypeSource::Db => (
                self.db.distinct_type_ids(region_id).await?,
                CacheExpiry::Default,
            ),
        };

        self.cache.set(&key, CachedValue::TypeIds(ids.clone()), expiry);
        Ok(ids)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Read-or-fetch one type's history without writing anything. The
    /// caller decides when the fetched rows hit the store, which keeps a
    /// single writer even when many slices are gathered concurrently.
    async fn type_history_slice(&self, region_id: i64, type_id: i64) -> Result<TypeHistorySlice> {
        let filter = RowFilter::region_type(region_id, type_id);
        // Exactly one row per day is expected, so the partial-snapshot row
        // count guard is meaningless here and stays off.
        let check = freshness::check(
            &self.db,
            now_secs() - HISTORY_UPDATE_THRESHOLD_SECS,
            Table::MarketHistory,
            &filter,
            None,
            false,
        )
        .await?;

        if !check.needs_update {
            let days = self.db.select_history(region_id, type_id).await?;
            return Ok(TypeHistorySlice::read(days));
        }

        if !self.client.is_published(type_id).await? {
            debug!(type_id, "skipping unpublished type");
            return Ok(TypeHistorySlice::read(Vec::new()));
        }

        let fetched = self.client.fetch_history(region_id, type_id).await?;
        if fetched.is_empty() {
            // No history is a valid answer, not an error.
            return Ok(TypeHistorySlice::read(Vec::new()));
        }

        let days = fetched
            .into_iter()
            .map(|day| history_day_to_record(day, region_id, type_id))
            .collect::<Result<Vec<_>>>()?;
        Ok(TypeHistorySlice {
            days,
            fetched: true,
        })
    }
}

/// One type's history series plus whether it came off the wire (and must
/// still be persisted) or out of the store.
#[derive(Debug, Clone)]
struct TypeHistorySlice {
    days: Vec<MarketHistoryRecord>,
    fetched: bool,
}

impl TypeHistorySlice {
    fn read(days: Vec<MarketHistoryRecord>) -> Self {
        Self {
            days,
            fetched: false,
        }
    }
}

fn validate_page(page: Option<u32>) -> Result<()> {
    if page == Some(0) {
        return Err(MirrorError::Validation(
            "page numbers start at 1".to_string(),
        ));
    }
    Ok(())
}

fn requested_pages(page: Option<u32>, total: u32) -> Vec<u32> {
    match page {
        Some(p) => vec![p],
        None => (1..=total).collect(),
    }
}

/// Cache expiry for an order query: a caller-supplied threshold doubles as
/// the TTL, otherwise the server's Expires hint, otherwise the default.
fn order_expiry(update_threshold: Option<i64>, expires_at: Option<i64>) -> CacheExpiry {
    match (update_threshold, expires_at) {
        (Some(threshold), _) => CacheExpiry::Ttl(threshold),
        (None, Some(at)) => CacheExpiry::At(at),
        (None, None) => CacheExpiry::Default,
    }
}

/// Cosmetic (type, side, price) ordering for readability; correctness never
/// depends on it.
fn sort_orders(orders: &mut [MarketOrder]) {
    orders.sort_by(|a, b| {
        (a.type_id, a.is_buy_order)
            .cmp(&(b.type_id, b.is_buy_order))
            .then(a.price.partial_cmp(&b.price).unwrap_or(Ordering::Equal))
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
