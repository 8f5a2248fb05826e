use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use crate::config::DEFAULT_CACHE_TTL_SECS;
use crate::types::{MarketHistoryRecord, MarketOrder};

// ---------------------------------------------------------------------------
// CacheKey
// ---------------------------------------------------------------------------

/// Deterministic key for one logical call: operation name, positional
/// arguments in call order, keyword arguments sorted by name. Purely
/// authenticating inputs (the bearer token) are never added — they affect
/// permission to fetch, not what is fetched, so calls differing only in
/// credentials share an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_op(op: &str) -> CacheKeyBuilder {
        CacheKeyBuilder {
            op: op.to_string(),
            args: Vec::new(),
            kwargs: Vec::new(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub struct CacheKeyBuilder {
    op: String,
    args: Vec<String>,
    kwargs: Vec<(String, String)>,
}

impl CacheKeyBuilder {
    pub fn arg(mut self, value: impl std::fmt::Display) -> Self {
        self.args.push(value.to_string());
        self
    }

    pub fn arg_opt(mut self, value: Option<impl std::fmt::Display>) -> Self {
        match value {
            Some(v) => self.args.push(v.to_string()),
            None => self.args.push("none".to_string()),
        }
        self
    }

    pub fn kwarg(mut self, name: &str, value: Option<impl std::fmt::Display>) -> Self {
        if let Some(v) = value {
            self.kwargs.push((name.to_string(), v.to_string()));
        }
        self
    }

    pub fn finish(mut self) -> CacheKey {
        self.kwargs.sort_by(|a, b| a.0.cmp(&b.0));
        let mut parts = vec![self.op];
        parts.extend(self.args);
        parts.extend(self.kwargs.into_iter().map(|(k, v)| format!("{k}={v}")));
        CacheKey(parts.join("|"))
    }
}

// ---------------------------------------------------------------------------
// ResponseCache
// ---------------------------------------------------------------------------

/// The payloads the orchestrators cache, one variant per result shape.
#[derive(Debug, Clone)]
pub enum CachedValue {
    Orders(Vec<MarketOrder>),
    History(Vec<MarketHistoryRecord>),
    TypeIds(Vec<i64>),
}

/// How long a stored entry lives.
#[derive(Debug, Clone, Copy)]
pub enum CacheExpiry {
    /// Relative TTL in seconds from now.
    Ttl(i64),
    /// Absolute epoch-seconds deadline, typically from an ESI Expires header.
    At(i64),
    /// The 20-minute default.
    Default,
}

#[derive(Debug, Clone)]
struct CacheSlot {
    expires_at: i64,
    value: CachedValue,
}

/// Short-lived cache keyed by logical-call signature, sitting in front of
/// the freshness check. Entries are never evicted by a background task;
/// an expired entry is dropped lazily by the `get` that finds it.
#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: DashMap<String, CacheSlot>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached value for the key, or None when absent or expired.
    pub fn get(&self, key: &CacheKey) -> Option<CachedValue> {
        let now = now_secs();
        let expired = match self.entries.get(key.as_str()) {
            Some(slot) if slot.expires_at > now => return Some(slot.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key.as_str());
        }
        None
    }

    pub fn set(&self, key: &CacheKey, value: CachedValue, expiry: CacheExpiry) {
        let expires_at = match expiry {
            CacheExpiry::Ttl(secs) => now_secs() + secs,
            CacheExpiry::At(epoch) => epoch,
            CacheExpiry::Default => now_secs() + DEFAULT_CACHE_TTL_SECS,
        };
        self.entries.insert(
            key.as_str().to_string(),
            CacheSlot { expires_at, value },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn key(op: &str) -> CacheKey {
        CacheKey::for_op(op).arg(10000002).finish()
    }

    #[test]
    fn set_then_get_returns_value() {
        let cache = ResponseCache::new();
        cache.set(&key("region_types"), CachedValue::TypeIds(vec![34, 35]), CacheExpiry::Ttl(60));

        match cache.get(&key("region_types")) {
            Some(CachedValue::TypeIds(ids)) => assert_eq!(ids, vec![34, 35]),
            other => panic!("unexpected cache result: {other:?}"),
        }
    }

    #[test]
    fn expired_entry_is_a_miss_and_is_dropped() {
        let cache = ResponseCache::new();
        cache.set(
            &key("region_types"),
            CachedValue::TypeIds(vec![34]),
            CacheExpiry::At(now_secs() - 1),
        );

        assert!(cache.get(&key("region_types")).is_none());
        assert!(cache.is_empty(), "lazy cleanup should drop the entry");
    }

    #[test]
    fn absolute_expiry_in_future_is_a_hit() {
        let cache = ResponseCache::new();
        cache.set(
            &key("region_types"),
            CachedValue::TypeIds(vec![34]),
            CacheExpiry::At(now_secs() + 3600),
        );
        assert!(cache.get(&key("region_types")).is_some());
    }

    #[test]
    fn keys_are_deterministic_and_kwarg_order_independent() {
        let a = CacheKey::for_op("region_orders")
            .arg(10000002)
            .arg("sell")
            .kwarg("page", Some(3))
            .kwarg("update_threshold", Some(600))
            .finish();
        let b = CacheKey::for_op("region_orders")
            .arg(10000002)
            .arg("sell")
            .kwarg("update_threshold", Some(600))
            .kwarg("page", Some(3))
            .finish();
        assert_eq!(a, b);
    }

    #[test]
    fn absent_kwargs_and_positionals_are_distinguished() {
        let with_type = CacheKey::for_op("region_orders")
            .arg(10000002)
            .arg_opt(Some(34))
            .finish();
        let without_type = CacheKey::for_op("region_orders")
            .arg(10000002)
            .arg_opt(None::<i64>)
            .finish();
        assert_ne!(with_type, without_type);

        let no_page = CacheKey::for_op("region_orders")
            .arg(10000002)
            .kwarg("page", None::<u32>)
            .finish();
        let paged = CacheKey::for_op("region_orders")
            .arg(10000002)
            .kwarg("page", Some(1))
            .finish();
        assert_ne!(no_page, paged);
    }
}
