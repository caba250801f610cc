use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use refdata_core::{
    DailyClose, DividendEvent, FilingRecord, FinancialStatements, RefDataError, SnapshotEntry,
    SplitEvent, TickerEvent, Timeframe, UpstreamGateway,
};

const BASE_URL: &str = "https://api.polygon.io";
const PAGE_LIMIT: u32 = 1000;

/// Sliding-window rate limiter: at most `max_requests` per `window` duration.
#[derive(Clone)]
struct RateLimiter {
    timestamps: Arc<Mutex<VecDeque<Instant>>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            timestamps: Arc::new(Mutex::new(VecDeque::new())),
            max_requests,
            window,
        }
    }

    async fn acquire(&self) {
        loop {
            let mut ts = self.timestamps.lock().await;
            let now = Instant::now();

            while let Some(&front) = ts.front() {
                if now.duration_since(front) >= self.window {
                    ts.pop_front();
                } else {
                    break;
                }
            }

            if ts.len() < self.max_requests {
                ts.push_back(now);
                return;
            }

            let wait_until = ts.front().unwrap().checked_add(self.window).unwrap();
            let sleep_dur = wait_until.duration_since(now) + Duration::from_millis(50);
            drop(ts);
            tracing::debug!("Rate limiter: waiting {:.1}s for Polygon API slot", sleep_dur.as_secs_f64());
            tokio::time::sleep(sleep_dur).await;
        }
    }
}

/// `UpstreamGateway` implementation against the real Polygon.io reference
/// and market-data endpoints. Holds the same sliding-window rate limiter and
/// retry-on-429 request path as the teacher's `PolygonClient`; the per-call
/// boilerplate that client duplicated across every `list_tickers`-style
/// method is pulled out here into one `paginate` helper shared by every
/// cursor-following resource.
#[derive(Clone)]
pub struct PolygonGateway {
    api_key: String,
    client: Client,
    rate_limiter: RateLimiter,
}

impl PolygonGateway {
    pub fn new(api_key: String, rate_limit_per_minute: usize) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            api_key,
            client,
            rate_limiter: RateLimiter::new(rate_limit_per_minute, Duration::from_secs(60)),
        }
    }

    async fn send_request(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, RefDataError> {
        let request = builder
            .build()
            .map_err(|e| RefDataError::UpstreamFailure(e.to_string()))?;

        for attempt in 0..3u32 {
            self.rate_limiter.acquire().await;
            let req_clone = request
                .try_clone()
                .ok_or_else(|| RefDataError::UpstreamFailure("cannot clone request".to_string()))?;
            let response = self
                .client
                .execute(req_clone)
                .await
                .map_err(|e| RefDataError::UpstreamFailure(e.to_string()))?;

            if response.status().as_u16() != 429 {
                return Ok(response);
            }

            let wait_secs = 15u64;
            tracing::warn!("Polygon 429 rate limited, waiting {}s before retry {}/3", wait_secs, attempt + 1);
            tokio::time::sleep(Duration::from_secs(wait_secs)).await;
        }

        Err(RefDataError::UpstreamFailure("rate limited by Polygon after 3 retries".to_string()))
    }

    /// Walk a cursor/`next_url`-paginated resource to exhaustion. `params`
    /// carries the query for the first page only; every later page is
    /// fetched by requesting `next_url` verbatim (Polygon embeds the cursor
    /// and the original filters in it, apiKey excepted).
    async fn paginate<T, R>(&self, url: &str, params: Vec<(&str, String)>) -> Result<Vec<T>, RefDataError>
    where
        R: for<'de> Deserialize<'de> + PageEnvelope<T>,
    {
        let mut out = Vec::new();
        let mut next_url: Option<String> = None;

        loop {
            let response = if let Some(ref next) = next_url {
                self.send_request(
                    self.client
                        .get(next)
                        .query(&[("apiKey", self.api_key.as_str())]),
                )
                .await?
            } else {
                let query: Vec<(&str, &str)> = params.iter().map(|(k, v)| (*k, v.as_str())).collect();
                self.send_request(
                    self.client
                        .get(url)
                        .query(&query)
                        .query(&[("apiKey", self.api_key.as_str())]),
                )
                .await?
            };

            if !response.status().is_success() {
                return Err(RefDataError::UpstreamFailure(format!(
                    "HTTP {}: {}",
                    response.status(),
                    response.text().await.unwrap_or_default()
                )));
            }

            let body: R = response
                .json()
                .await
                .map_err(|e| RefDataError::UpstreamFailure(e.to_string()))?;
            let (items, next) = body.into_parts();
            out.extend(items);

            match next {
                Some(u) => next_url = Some(u),
                None => break,
            }
        }

        Ok(out)
    }
}

/// A paginated Polygon envelope: the items on this page and, if present,
/// the `next_url` to follow for the next one.
trait PageEnvelope<T> {
    fn into_parts(self) -> (Vec<T>, Option<String>);
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

#[async_trait]
impl UpstreamGateway for PolygonGateway {
    async fn fetch_splits(&self, ticker: &str, from: NaiveDate, to: NaiveDate) -> Result<Vec<SplitEvent>, RefDataError> {
        let url = format!("{BASE_URL}/v3/reference/splits");
        let params = vec![
            ("ticker", ticker.to_string()),
            ("execution_date.gte", from.format("%Y-%m-%d").to_string()),
            ("execution_date.lte", to.format("%Y-%m-%d").to_string()),
            ("order", "asc".to_string()),
            ("sort", "execution_date".to_string()),
            ("limit", PAGE_LIMIT.to_string()),
        ];
        let raw: Vec<RawSplit> = self.paginate::<RawSplit, SplitResponse>(&url, params).await?;

        Ok(raw
            .into_iter()
            .filter_map(|r| {
                let execution_date = parse_date(&r.execution_date)?;
                if r.split_to == 0.0 {
                    return None;
                }
                Some(SplitEvent {
                    execution_date,
                    split_factor: r.split_from / r.split_to,
                })
            })
            .collect())
    }

    async fn fetch_dividends(&self, ticker: &str, from: NaiveDate, to: NaiveDate) -> Result<Vec<DividendEvent>, RefDataError> {
        let url = format!("{BASE_URL}/v3/reference/dividends");
        let params = vec![
            ("ticker", ticker.to_string()),
            ("ex_dividend_date.gte", from.format("%Y-%m-%d").to_string()),
            ("ex_dividend_date.lte", to.format("%Y-%m-%d").to_string()),
            ("order", "asc".to_string()),
            ("sort", "ex_dividend_date".to_string()),
            ("limit", PAGE_LIMIT.to_string()),
        ];
        let raw: Vec<RawDividend> = self.paginate::<RawDividend, DividendResponse>(&url, params).await?;

        Ok(raw
            .into_iter()
            .filter_map(|r| {
                let ex_dividend_date = parse_date(&r.ex_dividend_date)?;
                Some(DividendEvent {
                    ex_dividend_date,
                    cash_amount: r.cash_amount,
                    dividend_type: r.dividend_type.unwrap_or_else(|| "CD".to_string()),
                })
            })
            .collect())
    }

    async fn fetch_daily_closes(&self, ticker: &str, from: NaiveDate, to: NaiveDate) -> Result<Vec<DailyClose>, RefDataError> {
        let url = format!(
            "{BASE_URL}/v2/aggs/ticker/{ticker}/range/1/day/{}/{}",
            from.format("%Y-%m-%d"),
            to.format("%Y-%m-%d")
        );

        let response = self
            .send_request(self.client.get(&url).query(&[
                ("apiKey", self.api_key.as_str()),
                ("adjusted", "false"),
                ("sort", "asc"),
                ("limit", "50000"),
            ]))
            .await?;

        if !response.status().is_success() {
            return Err(RefDataError::UpstreamFailure(format!("HTTP {}", response.status())));
        }

        let body: AggregateResponse = response
            .json()
            .await
            .map_err(|e| RefDataError::UpstreamFailure(e.to_string()))?;

        let mut closes: Vec<DailyClose> = body
            .results
            .into_iter()
            .filter_map(|r| {
                let date = DateTime::from_timestamp_millis(r.t)?.date_naive();
                Some(DailyClose { date, close: r.c })
            })
            .collect();
        closes.sort_by_key(|c| c.date);
        Ok(closes)
    }

    async fn fetch_ticker_events(&self, ticker: &str) -> Result<Vec<TickerEvent>, RefDataError> {
        let url = format!("{BASE_URL}/v3/reference/tickers/{ticker}/events");
        let response = self
            .send_request(self.client.get(&url).query(&[
                ("apiKey", self.api_key.as_str()),
                ("types", "ticker_change,delisted"),
            ]))
            .await?;

        if response.status().as_u16() == 404 {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(RefDataError::UpstreamFailure(format!("HTTP {}", response.status())));
        }

        let body: TickerEventsResponse = response
            .json()
            .await
            .map_err(|e| RefDataError::UpstreamFailure(e.to_string()))?;

        let events = body.results.map(|r| r.events).unwrap_or_default();
        Ok(events
            .into_iter()
            .filter_map(|e| {
                let date = parse_date(&e.date)?;
                match e.kind.as_str() {
                    "ticker_change" => Some(TickerEvent::TickerChange {
                        date,
                        old_ticker: e.ticker_change?.ticker,
                    }),
                    "delisted" => Some(TickerEvent::Delisted { date }),
                    _ => None,
                }
            })
            .collect())
    }

    async fn fetch_active_tickers(&self) -> Result<Vec<String>, RefDataError> {
        let url = format!("{BASE_URL}/v3/reference/tickers");
        let params = vec![
            ("market", "stocks".to_string()),
            ("type", "CS".to_string()),
            ("active", "true".to_string()),
            ("order", "asc".to_string()),
            ("sort", "ticker".to_string()),
            ("limit", PAGE_LIMIT.to_string()),
        ];
        let raw: Vec<RawTicker> = self.paginate::<RawTicker, TickerListResponse>(&url, params).await?;
        Ok(raw.into_iter().map(|t| t.ticker).collect())
    }

    async fn fetch_full_market_snapshot(&self) -> Result<Vec<SnapshotEntry>, RefDataError> {
        let url = format!("{BASE_URL}/v2/snapshot/locale/us/markets/stocks/tickers");
        let response = self
            .send_request(self.client.get(&url).query(&[("apiKey", self.api_key.as_str())]))
            .await?;

        if !response.status().is_success() {
            return Err(RefDataError::UpstreamFailure(format!("HTTP {}", response.status())));
        }

        let body: SnapshotResponse = response
            .json()
            .await
            .map_err(|e| RefDataError::UpstreamFailure(e.to_string()))?;

        Ok(body
            .tickers
            .into_iter()
            .map(|t| SnapshotEntry {
                ticker: t.ticker,
                prev_day: t.prev_day.map(|b| refdata_core::OhlcBar { close: b.c, volume: b.v }),
                day: t.day.map(|b| refdata_core::OhlcBar { close: b.c, volume: b.v }),
            })
            .collect())
    }

    async fn fetch_quarterly_financials(&self, ticker: &str) -> Result<Vec<FilingRecord>, RefDataError> {
        let url = format!("{BASE_URL}/vX/reference/financials");
        let params = vec![
            ("ticker", ticker.to_string()),
            ("timeframe", "quarterly".to_string()),
            ("order", "asc".to_string()),
            ("sort", "filing_date".to_string()),
            ("limit", "100".to_string()),
        ];
        let raw: Vec<RawFinancials> = self.paginate::<RawFinancials, FinancialsResponse>(&url, params).await?;

        Ok(raw
            .into_iter()
            .filter_map(|r| {
                let timeframe = match r.timeframe.as_str() {
                    "annual" | "ttm" => Timeframe::Annual,
                    _ => Timeframe::Quarterly,
                };
                Some(FilingRecord {
                    ticker: ticker.to_string(),
                    fiscal_year: r.fiscal_year.parse().ok()?,
                    fiscal_period: r.fiscal_period,
                    start_date: parse_date(&r.start_date)?,
                    end_date: parse_date(&r.end_date)?,
                    filing_date: parse_date(&r.filing_date)?,
                    timeframe,
                    statements: FinancialStatements {
                        income: flatten(r.financials.income_statement),
                        balance: flatten(r.financials.balance_sheet),
                        cashflow: flatten(r.financials.cash_flow_statement),
                    },
                })
            })
            .collect())
    }
}

fn flatten(section: std::collections::HashMap<String, RawLineItem>) -> std::collections::HashMap<String, f64> {
    section.into_iter().map(|(k, v)| (k, v.value)).collect()
}

// --- Wire formats -----------------------------------------------------

#[derive(Debug, Deserialize)]
struct SplitResponse {
    #[serde(default)]
    results: Vec<RawSplit>,
    next_url: Option<String>,
}

impl PageEnvelope<RawSplit> for SplitResponse {
    fn into_parts(self) -> (Vec<RawSplit>, Option<String>) {
        (self.results, self.next_url)
    }
}

#[derive(Debug, Deserialize)]
struct RawSplit {
    execution_date: String,
    split_from: f64,
    split_to: f64,
}

#[derive(Debug, Deserialize)]
struct DividendResponse {
    #[serde(default)]
    results: Vec<RawDividend>,
    next_url: Option<String>,
}

impl PageEnvelope<RawDividend> for DividendResponse {
    fn into_parts(self) -> (Vec<RawDividend>, Option<String>) {
        (self.results, self.next_url)
    }
}

#[derive(Debug, Deserialize)]
struct RawDividend {
    ex_dividend_date: String,
    cash_amount: f64,
    #[serde(default)]
    dividend_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AggregateResponse {
    #[serde(default)]
    results: Vec<RawBar>,
}

#[derive(Debug, Deserialize)]
struct RawBar {
    t: i64,
    c: f64,
}

#[derive(Debug, Deserialize)]
struct TickerEventsResponse {
    results: Option<TickerEventsResult>,
}

#[derive(Debug, Deserialize)]
struct TickerEventsResult {
    #[serde(default)]
    events: Vec<RawTickerEvent>,
}

#[derive(Debug, Deserialize)]
struct RawTickerEvent {
    #[serde(rename = "type")]
    kind: String,
    date: String,
    ticker_change: Option<RawTickerChange>,
}

#[derive(Debug, Deserialize)]
struct RawTickerChange {
    ticker: String,
}

#[derive(Debug, Deserialize)]
struct TickerListResponse {
    #[serde(default)]
    results: Vec<RawTicker>,
    next_url: Option<String>,
}

impl PageEnvelope<RawTicker> for TickerListResponse {
    fn into_parts(self) -> (Vec<RawTicker>, Option<String>) {
        (self.results, self.next_url)
    }
}

#[derive(Debug, Deserialize)]
struct RawTicker {
    ticker: String,
}

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    #[serde(default)]
    tickers: Vec<RawSnapshotTicker>,
}

#[derive(Debug, Deserialize)]
struct RawSnapshotTicker {
    ticker: String,
    #[serde(rename = "prevDay")]
    prev_day: Option<RawOhlc>,
    day: Option<RawOhlc>,
}

#[derive(Debug, Deserialize)]
struct RawOhlc {
    c: f64,
    v: f64,
}

#[derive(Debug, Deserialize)]
struct FinancialsResponse {
    #[serde(default)]
    results: Vec<RawFinancials>,
    next_url: Option<String>,
}

impl PageEnvelope<RawFinancials> for FinancialsResponse {
    fn into_parts(self) -> (Vec<RawFinancials>, Option<String>) {
        (self.results, self.next_url)
    }
}

#[derive(Debug, Deserialize)]
struct RawFinancials {
    fiscal_period: String,
    fiscal_year: String,
    start_date: String,
    end_date: String,
    filing_date: String,
    timeframe: String,
    financials: RawFinancialSections,
}

#[derive(Debug, Deserialize, Default)]
struct RawFinancialSections {
    #[serde(default, rename = "income_statement")]
    income_statement: std::collections::HashMap<String, RawLineItem>,
    #[serde(default, rename = "balance_sheet")]
    balance_sheet: std::collections::HashMap<String, RawLineItem>,
    #[serde(default, rename = "cash_flow_statement")]
    cash_flow_statement: std::collections::HashMap<String, RawLineItem>,
}

#[derive(Debug, Deserialize)]
struct RawLineItem {
    value: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_factor_is_old_over_new_shares() {
        let raw = RawSplit {
            execution_date: "2020-08-31".to_string(),
            split_from: 1.0,
            split_to: 4.0,
        };
        assert_eq!(raw.split_from / raw.split_to, 0.25);
    }

    #[test]
    fn parse_date_rejects_malformed_input() {
        assert!(parse_date("not-a-date").is_none());
        assert_eq!(parse_date("2021-01-04"), NaiveDate::from_ymd_opt(2021, 1, 4));
    }
}
