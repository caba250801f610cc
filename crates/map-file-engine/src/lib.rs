use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate};

use refdata_core::{
    earliest_sentinel, far_future_sentinel, KeyedSingleflight, MapFile, MapFileRow, Symbol,
    TickerEvent, UpstreamGateway,
};

mod io;
use io::{read_map_file, write_map_file_atomic};

/// Materializes one map file per symbol from its ticker-event history.
pub struct MapFileEngine<G> {
    gateway: G,
    base_dir: PathBuf,
    singleflight: KeyedSingleflight<String, MapFile>,
}

impl<G> MapFileEngine<G>
where
    G: UpstreamGateway,
{
    pub fn new(gateway: G, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            gateway,
            base_dir: base_dir.into(),
            singleflight: KeyedSingleflight::new(),
        }
    }

    fn path_for(&self, ticker: &str) -> PathBuf {
        self.base_dir
            .join("equity/usa/map_files")
            .join(format!("{}.csv", ticker.to_lowercase()))
    }

    /// `resolve(symbol, date)`. The `date` parameter is accepted per the
    /// contract (§4.4) but unused by the current synthesis algorithm, which
    /// always rebuilds the full ticker-identity history rather than a
    /// date-scoped slice.
    pub async fn resolve(&self, symbol: &Symbol, today: NaiveDate) -> MapFile {
        let path = self.path_for(&symbol.ticker);

        if let Some(file) = read_map_file(&path) {
            if !file.rows.is_empty() {
                return file;
            }
        }

        let ticker = symbol.ticker.clone();
        self.singleflight
            .execute(ticker.clone(), true, || async { self.refresh_or_synthesize(&ticker, &path, today).await })
            .await
    }

    async fn refresh_or_synthesize(&self, ticker: &str, path: &Path, today: NaiveDate) -> MapFile {
        if let Some(file) = read_map_file(path) {
            if is_fresh(&file, today) {
                return file;
            }
        }
        self.synthesize(ticker, path).await
    }

    async fn synthesize(&self, ticker: &str, path: &Path) -> MapFile {
        let exchange = exchange_for_locale("USA");

        let events = match self.gateway.fetch_ticker_events(ticker).await {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(%ticker, error = %e, "ticker events fetch failed, emitting minimal map file");
                return MapFile::minimal(ticker, exchange, earliest_sentinel(), far_future_sentinel());
            }
        };

        let mut sorted = events;
        sorted.sort_by_key(|e| e.date());

        let mut by_date: HashMap<NaiveDate, MapFileRow> = HashMap::new();
        by_date.insert(
            earliest_sentinel(),
            MapFileRow { date: earliest_sentinel(), ticker: ticker.to_string(), exchange: exchange.to_string() },
        );

        let mut delisting_date: Option<NaiveDate> = None;
        for event in sorted {
            match event {
                TickerEvent::TickerChange { date, old_ticker } => {
                    let row_date = date - Duration::days(1);
                    by_date.insert(row_date, MapFileRow { date: row_date, ticker: old_ticker, exchange: exchange.to_string() });
                }
                TickerEvent::Delisted { date } => {
                    delisting_date = Some(date);
                }
            }
        }

        let end_date = delisting_date.unwrap_or_else(far_future_sentinel);
        by_date.insert(end_date, MapFileRow { date: end_date, ticker: ticker.to_string(), exchange: exchange.to_string() });

        let mut rows: Vec<MapFileRow> = by_date.into_values().collect();
        rows.sort_by_key(|r| r.date);

        let file = MapFile { rows };
        write_map_file_atomic(path, &file);
        file
    }
}

fn is_fresh(file: &MapFile, today: NaiveDate) -> bool {
    file.rows.last().is_some_and(|r| {
        r.date >= today - Duration::days(1) || r.date >= far_future_sentinel() - Duration::days(365)
    })
}

/// Market-determined constant: no external lookup, matching the spec's
/// "primaryExchange is a market-determined constant."
fn exchange_for_locale(locale: &str) -> &'static str {
    match locale {
        "USA" => "Q",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use refdata_core::{DailyClose, DividendEvent, FilingRecord, RefDataError, SnapshotEntry, SplitEvent};
    use tempfile::TempDir;

    struct FakeGateway {
        events: Vec<TickerEvent>,
        fail: bool,
    }

    #[async_trait]
    impl UpstreamGateway for FakeGateway {
        async fn fetch_splits(&self, _ticker: &str, _from: NaiveDate, _to: NaiveDate) -> Result<Vec<SplitEvent>, RefDataError> {
            Ok(Vec::new())
        }
        async fn fetch_dividends(&self, _ticker: &str, _from: NaiveDate, _to: NaiveDate) -> Result<Vec<DividendEvent>, RefDataError> {
            Ok(Vec::new())
        }
        async fn fetch_daily_closes(&self, _ticker: &str, _from: NaiveDate, _to: NaiveDate) -> Result<Vec<DailyClose>, RefDataError> {
            Ok(Vec::new())
        }
        async fn fetch_ticker_events(&self, _ticker: &str) -> Result<Vec<TickerEvent>, RefDataError> {
            if self.fail {
                return Err(RefDataError::UpstreamFailure("boom".to_string()));
            }
            Ok(self.events.clone())
        }
        async fn fetch_active_tickers(&self) -> Result<Vec<String>, RefDataError> {
            Ok(Vec::new())
        }
        async fn fetch_full_market_snapshot(&self) -> Result<Vec<SnapshotEntry>, RefDataError> {
            Ok(Vec::new())
        }
        async fn fetch_quarterly_financials(&self, _ticker: &str) -> Result<Vec<FilingRecord>, RefDataError> {
            Ok(Vec::new())
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn s3_ticker_change_without_delisting() {
        let dir = TempDir::new().unwrap();
        let gateway = FakeGateway {
            events: vec![TickerEvent::TickerChange { date: date(2019, 5, 1), old_ticker: "OLD".to_string() }],
            fail: false,
        };
        let engine = MapFileEngine::new(gateway, dir.path());
        let symbol = Symbol::new("NEW", "P1");

        let file = engine.resolve(&symbol, date(2024, 1, 2)).await;
        assert!(file.is_sorted_ascending());
        assert_eq!(file.rows.len(), 3);
        assert_eq!(file.rows[0], MapFileRow { date: earliest_sentinel(), ticker: "NEW".to_string(), exchange: "Q".to_string() });
        assert_eq!(file.rows[1], MapFileRow { date: date(2019, 4, 30), ticker: "OLD".to_string(), exchange: "Q".to_string() });
        assert_eq!(file.rows[2], MapFileRow { date: far_future_sentinel(), ticker: "NEW".to_string(), exchange: "Q".to_string() });
    }

    #[tokio::test]
    async fn delisted_symbol_ends_at_delisting_date() {
        let dir = TempDir::new().unwrap();
        let gateway = FakeGateway { events: vec![TickerEvent::Delisted { date: date(2022, 6, 15) }], fail: false };
        let engine = MapFileEngine::new(gateway, dir.path());
        let symbol = Symbol::new("DEAD", "P2");

        let file = engine.resolve(&symbol, date(2024, 1, 2)).await;
        assert!(file.is_delisted());
        let last = file.rows.last().unwrap();
        assert_eq!(last.date, date(2022, 6, 15));
        assert_eq!(last.ticker, "DEAD");
        assert_eq!(file.rows.iter().filter(|r| r.date == date(2022, 6, 15)).count(), 1);
    }

    #[tokio::test]
    async fn upstream_failure_yields_minimal_uncached_file() {
        let dir = TempDir::new().unwrap();
        let gateway = FakeGateway { events: Vec::new(), fail: true };
        let engine = MapFileEngine::new(gateway, dir.path());
        let symbol = Symbol::new("FAIL", "P3");

        let file = engine.resolve(&symbol, date(2024, 1, 2)).await;
        assert_eq!(file.rows.len(), 2);
        assert!(read_map_file(&engine.path_for("FAIL")).is_none());
    }
}
