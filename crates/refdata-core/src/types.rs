use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Far-future sentinel date used for still-active map-file rows.
pub const FAR_FUTURE_SENTINEL: (i32, u32, u32) = (2050, 12, 31);

/// Earliest date the factor/map file generators will ever look back to.
pub const EARLIEST_SENTINEL: (i32, u32, u32) = (2000, 1, 1);

pub fn far_future_sentinel() -> NaiveDate {
    let (y, m, d) = FAR_FUTURE_SENTINEL;
    NaiveDate::from_ymd_opt(y, m, d).expect("valid sentinel date")
}

pub fn earliest_sentinel() -> NaiveDate {
    let (y, m, d) = EARLIEST_SENTINEL;
    NaiveDate::from_ymd_opt(y, m, d).expect("valid sentinel date")
}

/// Opaque ticker identifier plus the stable per-market permanent identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub ticker: String,
    pub permanent_id: String,
}

impl Symbol {
    pub fn new(ticker: impl Into<String>, permanent_id: impl Into<String>) -> Self {
        Self {
            ticker: ticker.into().to_uppercase(),
            permanent_id: permanent_id.into(),
        }
    }
}

/// One row of a factor file: `(date, priceFactor, splitFactor, referencePrice)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactorFileRow {
    pub date: NaiveDate,
    pub price_factor: f64,
    pub split_factor: f64,
    pub reference_price: f64,
}

/// Ordered sequence of [`FactorFileRow`]s, date ascending, with earliest and
/// top sentinel rows at the boundaries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FactorFile {
    pub rows: Vec<FactorFileRow>,
}

impl FactorFile {
    pub fn minimal(earliest: NaiveDate, today: NaiveDate) -> Self {
        Self {
            rows: vec![
                FactorFileRow {
                    date: earliest,
                    price_factor: 1.0,
                    split_factor: 1.0,
                    reference_price: 0.0,
                },
                FactorFileRow {
                    date: today,
                    price_factor: 1.0,
                    split_factor: 1.0,
                    reference_price: 0.0,
                },
            ],
        }
    }

    /// The top sentinel row: the last row by date, marking "verified through".
    pub fn top_sentinel(&self) -> Option<&FactorFileRow> {
        self.rows.last()
    }

    pub fn is_sorted_ascending(&self) -> bool {
        self.rows.windows(2).all(|w| w[0].date < w[1].date)
    }
}

/// One row of a map file: `(date, symbolOnThatDay, primaryExchange)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapFileRow {
    pub date: NaiveDate,
    pub ticker: String,
    pub exchange: String,
}

/// Ordered sequence of [`MapFileRow`]s, date ascending.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapFile {
    pub rows: Vec<MapFileRow>,
}

impl MapFile {
    pub fn minimal(ticker: &str, exchange: &str, earliest: NaiveDate, far_future: NaiveDate) -> Self {
        let ticker = ticker.to_uppercase();
        Self {
            rows: vec![
                MapFileRow { date: earliest, ticker: ticker.clone(), exchange: exchange.to_string() },
                MapFileRow { date: far_future, ticker, exchange: exchange.to_string() },
            ],
        }
    }

    pub fn is_delisted(&self) -> bool {
        self.rows.last().is_some_and(|r| r.date != far_future_sentinel())
    }

    pub fn is_sorted_ascending(&self) -> bool {
        self.rows.windows(2).all(|w| w[0].date < w[1].date)
    }
}

/// A corporate action affecting the factor series for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CorporateAction {
    Split { date: NaiveDate, split_factor: f64, reference_price: f64 },
    Dividend { ex_date: NaiveDate, cash_amount: f64, reference_price: f64 },
}

impl CorporateAction {
    pub fn event_date(&self) -> NaiveDate {
        match self {
            CorporateAction::Split { date, .. } => *date,
            CorporateAction::Dividend { ex_date, .. } => *ex_date,
        }
    }

    /// Split before dividend when dates tie, per the spec's tie-break rule.
    fn order_rank(&self) -> u8 {
        match self {
            CorporateAction::Split { .. } => 0,
            CorporateAction::Dividend { .. } => 1,
        }
    }

    pub fn cmp_key(&self) -> (NaiveDate, u8) {
        (self.event_date(), self.order_rank())
    }
}

/// A raw split event as reported by the upstream gateway, before it has been
/// matched to a reference price.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitEvent {
    pub execution_date: NaiveDate,
    /// `split_from / split_to`, e.g. a 2-for-1 forward split is `1.0 / 2.0`.
    pub split_factor: f64,
}

/// A raw cash dividend event as reported by the upstream gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DividendEvent {
    pub ex_dividend_date: NaiveDate,
    pub cash_amount: f64,
    /// Upstream dividend type code, e.g. `"CD"` (cash) or `"SC"` (special cash).
    pub dividend_type: String,
}

/// A single day's unadjusted close, used to derive reference prices.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyClose {
    pub date: NaiveDate,
    pub close: f64,
}

/// A ticker-identity event from the upstream ticker-events resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TickerEvent {
    TickerChange { date: NaiveDate, old_ticker: String },
    Delisted { date: NaiveDate },
}

impl TickerEvent {
    pub fn date(&self) -> NaiveDate {
        match self {
            TickerEvent::TickerChange { date, .. } => *date,
            TickerEvent::Delisted { date } => *date,
        }
    }
}

/// A single OHLCV bar as used by the coarse-universe snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OhlcBar {
    pub close: f64,
    pub volume: f64,
}

/// One ticker's entry in the full-market snapshot response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub ticker: String,
    pub prev_day: Option<OhlcBar>,
    pub day: Option<OhlcBar>,
}

/// One row of the coarse-universe CSV. Field names carry the on-disk
/// camelCase header (§6) via `serde(rename)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoarseRow {
    #[serde(rename = "permId")]
    pub perm_id: String,
    pub ticker: String,
    pub close: f64,
    pub volume: i64,
    #[serde(rename = "dollarVolume")]
    pub dollar_volume: f64,
    #[serde(rename = "hasFundamentalData")]
    pub has_fundamentals: bool,
    #[serde(rename = "priceFactor")]
    pub price_factor: f64,
    #[serde(rename = "splitFactor")]
    pub split_factor: f64,
}

/// Filing timeframe for a [`FilingRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    Quarterly,
    Annual,
}

/// The three named statement maps a filing carries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinancialStatements {
    pub income: HashMap<String, f64>,
    pub balance: HashMap<String, f64>,
    pub cashflow: HashMap<String, f64>,
}

/// One quarterly or annual financial filing for a ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilingRecord {
    pub ticker: String,
    pub fiscal_year: i32,
    pub fiscal_period: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub filing_date: NaiveDate,
    pub timeframe: Timeframe,
    pub statements: FinancialStatements,
}
