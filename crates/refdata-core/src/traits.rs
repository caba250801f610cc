use crate::error::RefDataError;
use crate::types::{
    DailyClose, DividendEvent, FilingRecord, SnapshotEntry, SplitEvent, TickerEvent,
};
use async_trait::async_trait;
use chrono::NaiveDate;

/// Contract for the upstream market-data HTTP provider. Engines never build
/// URLs or handle pagination themselves; they call one typed, paginating
/// accessor per resource and get back fully-decoded domain values.
#[async_trait]
pub trait UpstreamGateway: Send + Sync {
    async fn fetch_splits(
        &self,
        ticker: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<SplitEvent>, RefDataError>;

    async fn fetch_dividends(
        &self,
        ticker: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DividendEvent>, RefDataError>;

    /// Unadjusted daily closes over `[from, to]`, used to derive reference
    /// prices for corporate actions.
    async fn fetch_daily_closes(
        &self,
        ticker: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyClose>, RefDataError>;

    async fn fetch_ticker_events(&self, ticker: &str) -> Result<Vec<TickerEvent>, RefDataError>;

    /// Active common-stock tickers on the supported market, paginated.
    async fn fetch_active_tickers(&self) -> Result<Vec<String>, RefDataError>;

    /// Full-market snapshot: one entry per ticker with prev-day/day bars.
    async fn fetch_full_market_snapshot(&self) -> Result<Vec<SnapshotEntry>, RefDataError>;

    async fn fetch_quarterly_financials(
        &self,
        ticker: &str,
    ) -> Result<Vec<FilingRecord>, RefDataError>;
}

/// Opaque exchange-hours/market-calendar lookup. Out of scope to specify in
/// full; engines only need "what was the previous trading day" and "is this
/// a trading day at all".
pub trait TradingCalendar: Send + Sync {
    /// The most recent trading day strictly before `date`.
    fn previous_trading_day(&self, date: NaiveDate) -> NaiveDate;

    fn is_trading_day(&self, date: NaiveDate) -> bool;
}

/// Weekday-only calendar with no holiday awareness, used as the default
/// standalone implementation and in tests. Production deployments inject a
/// real market-calendar service instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleWeekdayCalendar;

impl TradingCalendar for SimpleWeekdayCalendar {
    fn previous_trading_day(&self, date: NaiveDate) -> NaiveDate {
        let mut d = date.pred_opt().expect("date underflow");
        while !self.is_trading_day(d) {
            d = d.pred_opt().expect("date underflow");
        }
        d
    }

    fn is_trading_day(&self, date: NaiveDate) -> bool {
        use chrono::Weekday;
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }
}

/// Seam through which [`UniverseEngine`](../universe_engine) asks
/// [`FactorFileEngine`](../factor_file_engine) for the price/split factors
/// valid on a given date, without depending on it concretely. Stands in for
/// the process-wide component registry the original source discovers its
/// factor-file provider through (Design Note 1).
#[async_trait]
pub trait CorporateFactorProvider: Send + Sync {
    /// Returns `(price_factor, split_factor)` valid on `date`, or `None` if
    /// the lookup could not be satisfied (degrades silently to `(1.0, 1.0)`
    /// at the call site per §4.5.1).
    async fn factors_on(&self, ticker: &str, date: NaiveDate) -> Option<(f64, f64)>;
}
