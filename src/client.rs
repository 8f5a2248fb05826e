use std::time::Duration;

use chrono::{DateTime, NaiveDate};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::{Config, HISTORY_DATE_OFFSET_SECS, HTTP_TIMEOUT_SECS};
use crate::error::{MirrorError, Result};
use crate::types::{EsiHistoryDay, EsiOrder, MarketHistoryRecord};

/// Total-page-count and expiry hints from a metadata probe of a paginated
/// endpoint.
#[derive(Debug, Clone, Copy)]
pub struct PageInfo {
    pub pages: u32,
    /// Epoch seconds from the Expires header, when the server sent one.
    pub expires_at: Option<i64>,
}

/// Thin ESI client: metadata probes, bounded concurrent page fan-out, and
/// the per-type endpoints the history path needs. Holds no mirror state.
#[derive(Debug, Clone)]
pub struct EsiClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    concurrency: usize,
}

impl EsiClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .user_agent(cfg.user_agent.clone())
            .build()?;
        Ok(Self {
            http,
            base_url: cfg.esi_base_url.trim_end_matches('/').to_string(),
            token: cfg.esi_token.clone(),
            concurrency: cfg.fetch_concurrency,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, format!("{}{path}", self.base_url));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    /// HEAD probe of a paginated endpoint: reads X-Pages (total page count,
    /// 1 when absent) and the Expires header used as the cache-TTL hint.
    pub async fn probe(&self, path: &str, query: &[(String, String)]) -> Result<PageInfo> {
        let resp = self
            .request(reqwest::Method::HEAD, path)
            .query(query)
            .query(&[("page", 1u32)])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(MirrorError::EsiStatus {
                status,
                path: path.to_string(),
            });
        }

        let pages = resp
            .headers()
            .get("x-pages")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(1);
        let expires_at = resp
            .headers()
            .get("expires")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_expires);

        debug!(path, pages, ?expires_at, "probed endpoint");
        Ok(PageInfo { pages, expires_at })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<T> {
        let resp = self
            .request(reqwest::Method::GET, path)
            .query(query)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(MirrorError::EsiStatus {
                status,
                path: path.to_string(),
            });
        }
        Ok(resp.json::<T>().await?)
    }

    /// GET every page in `pages` with at most `concurrency` requests in
    /// flight, merging the record lists by concatenation. Completion order
    /// is irrelevant and empty pages contribute nothing; any failed page
    /// fails the whole merge so callers never see a partial snapshot.
    pub async fn fetch_pages<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(String, String)],
        pages: &[u32],
    ) -> Result<Vec<T>> {
        let page_lists: Vec<Vec<T>> = stream::iter(pages.iter().copied())
            .map(|page| {
                let mut page_query = query.to_vec();
                page_query.push(("page".to_string(), page.to_string()));
                async move { self.get_json::<Vec<T>>(path, &page_query).await }
            })
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        let merged: Vec<T> = page_lists.into_iter().flatten().collect();
        debug!(path, pages = pages.len(), records = merged.len(), "page fan-out merged");
        Ok(merged)
    }

    pub async fn fetch_order_pages(
        &self,
        path: &str,
        query: &[(String, String)],
        pages: &[u32],
    ) -> Result<Vec<EsiOrder>> {
        self.fetch_pages::<EsiOrder>(path, query, pages).await
    }

    /// Daily history for one (region, type). An empty body means the type
    /// has no market history, which is a valid outcome.
    pub async fn fetch_history(&self, region_id: i64, type_id: i64) -> Result<Vec<EsiHistoryDay>> {
        let path = format!("/markets/{region_id}/history/");
        self.get_json(&path, &[("type_id".to_string(), type_id.to_string())])
            .await
    }

    /// Whether a type is published. The region type list includes ids for
    /// unpublished items (event/test types) that 404 on the history
    /// endpoint; this check filters them out up front. 404 here simply
    /// means "not a valid type".
    pub async fn is_published(&self, type_id: i64) -> Result<bool> {
        let path = format!("/universe/types/{type_id}/");
        let resp = self.request(reqwest::Method::GET, &path).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !status.is_success() {
            return Err(MirrorError::EsiStatus { status, path });
        }

        let body: serde_json::Value = resp.json().await?;
        let published = body
            .get("published")
            .and_then(|p| p.as_bool())
            .unwrap_or_else(|| {
                warn!(type_id, "type payload missing published field");
                false
            });
        Ok(published)
    }
}

/// Parse an HTTP-date Expires header ("Wed, 21 Oct 2026 07:28:00 GMT") into
/// epoch seconds. Malformed values are ignored — the default TTL applies.
fn parse_expires(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.timestamp())
}

/// Convert one wire history day into its stored form. The "YYYY-MM-DD" date
/// becomes midnight-UTC epoch plus 39,900 seconds, pinning it to the 11:05
/// UTC instant ESI recalculates history at.
pub fn history_day_to_record(
    day: EsiHistoryDay,
    region_id: i64,
    type_id: i64,
) -> Result<MarketHistoryRecord> {
    let date = NaiveDate::parse_from_str(&day.date, "%Y-%m-%d")
        .map_err(|_| MirrorError::Payload(format!("unparsable history date {:?}", day.date)))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| MirrorError::Payload(format!("invalid history date {:?}", day.date)))?;
    Ok(MarketHistoryRecord {
        region_id,
        type_id,
        date: midnight.and_utc().timestamp() + HISTORY_DATE_OFFSET_SECS,
        average: day.average,
        highest: day.highest,
        lowest: day.lowest,
        volume: day.volume,
        order_count: day.order_count,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn test_config(base_url: String) -> Config {
        Config {
            esi_base_url: base_url,
            db_path: ":memory:".to_string(),
            log_level: "info".to_string(),
            fetch_concurrency: 4,
            esi_token: None,
            user_agent: "esi-market-mirror/test".to_string(),
        }
    }

    fn order_json(order_id: i64, price: f64) -> serde_json::Value {
        serde_json::json!({
            "order_id": order_id,
            "type_id": 34,
            "location_id": 60003760,
            "system_id": 30000142,
            "is_buy_order": false,
            "price": price,
            "volume_remain": 5,
            "volume_total": 10,
            "min_volume": 1,
            "duration": 90,
            "issued": "2026-08-20T10:00:00Z",
            "range": "region"
        })
    }

    #[tokio::test]
    async fn probe_reads_x_pages_and_expires() {
        let mut server = mockito::Server::new_async().await;
        let head = server
            .mock("HEAD", "/markets/10000002/orders/")
            .match_query(Matcher::UrlEncoded("page".into(), "1".into()))
            .with_header("X-Pages", "7")
            .with_header("Expires", "Wed, 26 Aug 2026 11:05:00 GMT")
            .create_async()
            .await;

        let client = EsiClient::new(&test_config(server.url())).unwrap();
        let info = client.probe("/markets/10000002/orders/", &[]).await.unwrap();

        head.assert_async().await;
        assert_eq!(info.pages, 7);
        let expires = info.expires_at.unwrap();
        assert!(expires > 1_700_000_000, "expires should be a plausible epoch: {expires}");
    }

    #[tokio::test]
    async fn probe_defaults_to_one_page() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("HEAD", "/markets/10000002/types/")
            .match_query(Matcher::Any)
            .create_async()
            .await;

        let client = EsiClient::new(&test_config(server.url())).unwrap();
        let info = client.probe("/markets/10000002/types/", &[]).await.unwrap();
        assert_eq!(info.pages, 1);
        assert_eq!(info.expires_at, None);
    }

    #[tokio::test]
    async fn fan_out_merges_all_pages_including_empty() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/markets/10000002/orders/")
            .match_query(Matcher::UrlEncoded("page".into(), "1".into()))
            .with_body(serde_json::json!([order_json(1, 5.0), order_json(2, 6.0)]).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/markets/10000002/orders/")
            .match_query(Matcher::UrlEncoded("page".into(), "2".into()))
            .with_body("[]")
            .create_async()
            .await;
        server
            .mock("GET", "/markets/10000002/orders/")
            .match_query(Matcher::UrlEncoded("page".into(), "3".into()))
            .with_body(serde_json::json!([order_json(3, 7.0)]).to_string())
            .create_async()
            .await;

        let client = EsiClient::new(&test_config(server.url())).unwrap();
        let orders = client
            .fetch_order_pages("/markets/10000002/orders/", &[], &[1, 2, 3])
            .await
            .unwrap();

        let mut ids: Vec<i64> = orders.iter().map(|o| o.order_id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn one_failed_page_fails_the_whole_merge() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/markets/10000002/orders/")
            .match_query(Matcher::UrlEncoded("page".into(), "1".into()))
            .with_body(serde_json::json!([order_json(1, 5.0)]).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/markets/10000002/orders/")
            .match_query(Matcher::UrlEncoded("page".into(), "2".into()))
            .with_status(502)
            .create_async()
            .await;

        let client = EsiClient::new(&test_config(server.url())).unwrap();
        let result = client
            .fetch_order_pages("/markets/10000002/orders/", &[], &[1, 2])
            .await;
        assert!(matches!(result, Err(MirrorError::EsiStatus { .. })));
    }

    #[tokio::test]
    async fn is_published_treats_404_as_unpublished() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/universe/types/999/")
            .with_status(404)
            .with_body(r#"{"error":"Type not found!"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/universe/types/34/")
            .with_body(r#"{"type_id":34,"name":"Tritanium","published":true}"#)
            .create_async()
            .await;

        let client = EsiClient::new(&test_config(server.url())).unwrap();
        assert!(!client.is_published(999).await.unwrap());
        assert!(client.is_published(34).await.unwrap());
    }

    #[test]
    fn history_date_lands_on_1105_utc() {
        let day = EsiHistoryDay {
            date: "2026-08-25".to_string(),
            average: 5.0,
            highest: 6.0,
            lowest: 4.0,
            volume: 100,
            order_count: 10,
        };
        let record = history_day_to_record(day, 10000002, 34).unwrap();
        // 2026-08-25T00:00:00Z = 1787616000; +39900 = 11:05:00 UTC.
        assert_eq!(record.date, 1_787_616_000 + 39_900);
        assert_eq!(record.date % 86_400, 39_900);
    }

    #[test]
    fn malformed_history_date_is_a_payload_error() {
        let day = EsiHistoryDay {
            date: "25-08-2026".to_string(),
            average: 5.0,
            highest: 6.0,
            lowest: 4.0,
            volume: 100,
            order_count: 10,
        };
        assert!(matches!(
            history_day_to_record(day, 10000002, 34),
            Err(MirrorError::Payload(_))
        ));
    }
}
