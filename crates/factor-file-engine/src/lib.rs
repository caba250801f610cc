use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};

use refdata_core::{
    earliest_sentinel, CorporateAction, CorporateFactorProvider, FactorFile, FactorFileRow,
    KeyedSingleflight, RefDataError, Symbol, TradingCalendar, UpstreamGateway,
};

mod io;
use io::{read_factor_file, write_factor_file_atomic};

/// Materializes and incrementally refreshes one factor file per symbol.
///
/// Holds its upstream gateway and trading calendar by value rather than by
/// global lookup, the way `AnalysisOrchestrator::new` takes its one real
/// collaborator as a constructor parameter instead of discovering it.
pub struct FactorFileEngine<G, C> {
    gateway: G,
    calendar: C,
    base_dir: PathBuf,
    singleflight: KeyedSingleflight<String, FactorFile>,
}

impl<G, C> FactorFileEngine<G, C>
where
    G: UpstreamGateway,
    C: TradingCalendar,
{
    pub fn new(gateway: G, calendar: C, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            gateway,
            calendar,
            base_dir: base_dir.into(),
            singleflight: KeyedSingleflight::new(),
        }
    }

    fn path_for(&self, ticker: &str) -> PathBuf {
        self.base_dir
            .join("equity/usa/factor_files")
            .join(format!("{}.csv", ticker.to_lowercase()))
    }

    /// `get(symbol) -> FactorFile | none`. `is_common_stock` stands in for
    /// the security-type gate the source applies before deciding a symbol
    /// is eligible at all (§4.3 step 1) — this workspace has no broader
    /// asset-class model, so the caller (which already filters active
    /// common-stock tickers per C5) supplies the answer directly.
    pub async fn get(&self, symbol: &Symbol, is_common_stock: bool, today: NaiveDate) -> Option<FactorFile> {
        if !is_common_stock {
            return None;
        }

        let path = self.path_for(&symbol.ticker);
        if let Some(existing) = read_factor_file(&path) {
            if is_fresh(&existing, today) {
                return Some(existing);
            }
        }

        let ticker = symbol.ticker.clone();
        let file = self
            .singleflight
            .execute(ticker.clone(), true, || async { self.refresh_or_generate(&ticker, &path, today).await })
            .await;
        Some(file)
    }

    async fn refresh_or_generate(&self, ticker: &str, path: &Path, today: NaiveDate) -> FactorFile {
        if let Some(existing) = read_factor_file(path) {
            if is_fresh(&existing, today) {
                return existing;
            }
            if let Some(refreshed) = self.incremental_refresh(ticker, path, today, &existing).await {
                return refreshed;
            }
        }
        self.full_generation(ticker, path, today).await
    }

    /// §4.3.1: rewrite the top sentinel's date if nothing changed upstream
    /// since the last verification; `None` means "fall through to full
    /// generation" because new corporate actions were observed.
    async fn incremental_refresh(
        &self,
        ticker: &str,
        path: &Path,
        today: NaiveDate,
        existing: &FactorFile,
    ) -> Option<FactorFile> {
        let from = existing.top_sentinel()?.date.succ_opt()?;
        if from > today {
            return Some(existing.clone());
        }

        let splits = self.gateway.fetch_splits(ticker, from, today).await.unwrap_or_else(|e| {
            tracing::warn!(%ticker, error = %e, "splits fetch failed during incremental refresh");
            Vec::new()
        });
        let dividends = self.gateway.fetch_dividends(ticker, from, today).await.unwrap_or_else(|e| {
            tracing::warn!(%ticker, error = %e, "dividends fetch failed during incremental refresh");
            Vec::new()
        });

        if splits.is_empty() && dividends.is_empty() {
            let mut rows = existing.rows.clone();
            if let Some(last) = rows.last_mut() {
                last.date = today;
            }
            let refreshed = FactorFile { rows };
            write_factor_file_atomic(path, &refreshed);
            return Some(refreshed);
        }

        None
    }

    /// §4.3.2: rebuild the whole series from the corporate-action history.
    async fn full_generation(&self, ticker: &str, path: &Path, today: NaiveDate) -> FactorFile {
        let earliest = earliest_sentinel();

        let raw_splits = self.gateway.fetch_splits(ticker, earliest, today).await.unwrap_or_else(|e| {
            tracing::warn!(%ticker, error = %e, "splits fetch failed during full generation");
            Vec::new()
        });
        let raw_dividends = self.gateway.fetch_dividends(ticker, earliest, today).await.unwrap_or_else(|e| {
            tracing::warn!(%ticker, error = %e, "dividends fetch failed during full generation");
            Vec::new()
        });

        let splits = dedup_keep_first(raw_splits, |s| s.execution_date);
        let dividends: Vec<_> = dedup_keep_first(raw_dividends, |d| d.ex_dividend_date)
            .into_iter()
            .filter(|d| d.dividend_type == "CD" || d.dividend_type == "SC")
            .collect();

        if splits.is_empty() && dividends.is_empty() {
            let minimal = FactorFile::minimal(earliest, today);
            write_factor_file_atomic(path, &minimal);
            return minimal;
        }

        let closes = self.gateway.fetch_daily_closes(ticker, earliest, today).await.unwrap_or_else(|e| {
            tracing::warn!(%ticker, error = %e, "daily closes fetch failed during full generation");
            Vec::new()
        });
        if closes.is_empty() {
            tracing::warn!(%ticker, "no daily closes available, emitting minimal factor file");
            let minimal = FactorFile::minimal(earliest, today);
            write_factor_file_atomic(path, &minimal);
            return minimal;
        }

        let close_map: HashMap<NaiveDate, f64> = closes.iter().map(|c| (c.date, c.close)).collect();
        let earliest_daily_date = closes.first().map(|c| c.date).unwrap_or(earliest);

        let mut actions = Vec::new();
        for s in &splits {
            if s.split_factor == 0.0 {
                continue;
            }
            if let Some(p) = reference_price(&close_map, s.execution_date) {
                if p > 0.0 {
                    actions.push(CorporateAction::Split {
                        date: s.execution_date,
                        split_factor: s.split_factor,
                        reference_price: p,
                    });
                }
            }
        }
        for d in &dividends {
            if d.cash_amount <= 0.0 {
                continue;
            }
            if let Some(p) = reference_price(&close_map, d.ex_dividend_date) {
                if p > 0.0 {
                    actions.push(CorporateAction::Dividend {
                        ex_date: d.ex_dividend_date,
                        cash_amount: d.cash_amount,
                        reference_price: p,
                    });
                }
            }
        }
        let file = self.apply_actions(actions, earliest_daily_date, today).await;
        write_factor_file_atomic(path, &file);
        file
    }

    /// Accumulating fold over sorted corporate actions (Design Note 4):
    /// walked newest-to-oldest, since each action's adjustment applies
    /// retroactively to every row older than it, while the top sentinel
    /// always stays `(1, 1)`.
    async fn apply_actions(&self, mut actions: Vec<CorporateAction>, earliest_daily_date: NaiveDate, today: NaiveDate) -> FactorFile {
        actions.sort_by_key(|a| a.cmp_key());

        let mut cum_price = 1.0_f64;
        let mut cum_split = 1.0_f64;
        let mut rows: Vec<FactorFileRow> = Vec::new();

        for action in actions.into_iter().rev() {
            match action {
                CorporateAction::Split { date, split_factor, reference_price } => {
                    cum_split *= split_factor;
                    let row_date = self.calendar.previous_trading_day(date);
                    upsert_row(&mut rows, row_date, cum_price, cum_split, reference_price);
                }
                CorporateAction::Dividend { ex_date, cash_amount, reference_price } => {
                    if reference_price > 0.0 {
                        cum_price *= (reference_price - cash_amount) / reference_price;
                    }
                    let row_date = self.calendar.previous_trading_day(ex_date);
                    upsert_row(&mut rows, row_date, cum_price, cum_split, reference_price);
                }
            }
        }

        upsert_row(&mut rows, earliest_daily_date, cum_price, cum_split, 0.0);
        upsert_row(&mut rows, today, 1.0, 1.0, 0.0);

        rows.sort_by_key(|r| r.date);
        FactorFile { rows }
    }
}

#[async_trait]
impl<G, C> CorporateFactorProvider for FactorFileEngine<G, C>
where
    G: UpstreamGateway,
    C: TradingCalendar,
{
    async fn factors_on(&self, ticker: &str, date: NaiveDate) -> Option<(f64, f64)> {
        let path = self.path_for(ticker);
        let file = read_factor_file(&path)?;
        factor_at(&file, date)
    }
}

/// The factor valid on `date` is carried by the first row dated on or after
/// it — rows denote "verified through" boundaries, and an adjustment set by
/// a future corporate action applies retroactively back to here.
fn factor_at(file: &FactorFile, date: NaiveDate) -> Option<(f64, f64)> {
    file.rows
        .iter()
        .find(|r| r.date >= date)
        .or_else(|| file.rows.last())
        .map(|r| (r.price_factor, r.split_factor))
}

fn is_fresh(file: &FactorFile, today: NaiveDate) -> bool {
    file.top_sentinel().is_some_and(|r| r.date >= today - Duration::days(1))
}

fn reference_price(close_map: &HashMap<NaiveDate, f64>, event_date: NaiveDate) -> Option<f64> {
    for offset in 1..=5 {
        let d = event_date - Duration::days(offset);
        if let Some(&c) = close_map.get(&d) {
            if c > 0.0 {
                return Some(c);
            }
        }
    }
    None
}

fn dedup_keep_first<T: Clone>(mut items: Vec<T>, date_of: impl Fn(&T) -> NaiveDate) -> Vec<T> {
    items.sort_by_key(|i| date_of(i));
    let mut seen = HashSet::new();
    items.into_iter().filter(|i| seen.insert(date_of(i))).collect()
}

fn upsert_row(rows: &mut Vec<FactorFileRow>, date: NaiveDate, price_factor: f64, split_factor: f64, reference_price: f64) {
    if let Some(existing) = rows.iter_mut().find(|r| r.date == date) {
        existing.price_factor = price_factor;
        existing.split_factor = split_factor;
        existing.reference_price = reference_price;
    } else {
        rows.push(FactorFileRow { date, price_factor, split_factor, reference_price });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use refdata_core::{DailyClose, DividendEvent, FilingRecord, SimpleWeekdayCalendar, SnapshotEntry, SplitEvent, TickerEvent};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeGateway {
        splits: Mutex<Vec<SplitEvent>>,
        dividends: Mutex<Vec<DividendEvent>>,
        closes: Mutex<Vec<DailyClose>>,
        split_calls: Mutex<usize>,
    }

    #[async_trait]
    impl UpstreamGateway for FakeGateway {
        async fn fetch_splits(&self, _ticker: &str, _from: NaiveDate, _to: NaiveDate) -> Result<Vec<SplitEvent>, RefDataError> {
            *self.split_calls.lock().unwrap() += 1;
            Ok(self.splits.lock().unwrap().clone())
        }
        async fn fetch_dividends(&self, _ticker: &str, _from: NaiveDate, _to: NaiveDate) -> Result<Vec<DividendEvent>, RefDataError> {
            Ok(self.dividends.lock().unwrap().clone())
        }
        async fn fetch_daily_closes(&self, _ticker: &str, _from: NaiveDate, _to: NaiveDate) -> Result<Vec<DailyClose>, RefDataError> {
            Ok(self.closes.lock().unwrap().clone())
        }
        async fn fetch_ticker_events(&self, _ticker: &str) -> Result<Vec<TickerEvent>, RefDataError> {
            Ok(Vec::new())
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
    async fn s1_no_corporate_actions_yields_minimal_file() {
        let dir = TempDir::new().unwrap();
        let engine = FactorFileEngine::new(FakeGateway::default(), SimpleWeekdayCalendar, dir.path());
        let symbol = Symbol::new("ACME", "P1");
        let today = date(2024, 1, 2);

        let file = engine.get(&symbol, true, today).await.unwrap();
        assert_eq!(file.rows.len(), 2);
        assert_eq!(file.rows[0].date, earliest_sentinel());
        assert_eq!(file.rows[1].date, today);
        assert_eq!(file.rows[1].price_factor, 1.0);
        assert_eq!(file.rows[1].split_factor, 1.0);
    }

    #[tokio::test]
    async fn s2_two_for_one_split_produces_half_split_factor() {
        let dir = TempDir::new().unwrap();
        let gateway = FakeGateway::default();
        let split_date = date(2020, 8, 31);
        *gateway.splits.lock().unwrap() = vec![SplitEvent { execution_date: split_date, split_factor: 0.5 }];
        *gateway.closes.lock().unwrap() = vec![DailyClose { date: date(2020, 8, 28), close: 400.0 }];

        let engine = FactorFileEngine::new(gateway, SimpleWeekdayCalendar, dir.path());
        let symbol = Symbol::new("ACME", "P1");
        let today = date(2024, 1, 2);

        let file = engine.get(&symbol, true, today).await.unwrap();
        assert!(file.is_sorted_ascending());

        let split_row = file.rows.iter().find(|r| r.date == date(2020, 8, 28)).unwrap();
        assert_eq!(split_row.split_factor, 0.5);
        assert_eq!(split_row.reference_price, 400.0);

        for row in &file.rows {
            if row.date <= date(2020, 8, 28) {
                assert!(row.split_factor <= 0.5);
            }
        }

        let top = file.top_sentinel().unwrap();
        assert_eq!(top.split_factor, 1.0);
        assert_eq!(top.date, today);
    }

    #[tokio::test]
    async fn s6_concurrent_callers_trigger_one_upstream_fetch() {
        let dir = TempDir::new().unwrap();
        let mut gateway = FakeGateway::default();
        gateway.splits = Mutex::new(vec![SplitEvent { execution_date: date(2021, 1, 4), split_factor: 0.25 }]);
        gateway.closes = Mutex::new(vec![DailyClose { date: date(2021, 1, 1), close: 100.0 }]);
        let engine = std::sync::Arc::new(FactorFileEngine::new(gateway, SimpleWeekdayCalendar, dir.path()));
        let symbol = Symbol::new("ACME", "P1");
        let today = date(2024, 1, 2);

        let mut handles = Vec::new();
        for _ in 0..6 {
            let engine = std::sync::Arc::clone(&engine);
            let symbol = symbol.clone();
            handles.push(tokio::spawn(async move { engine.get(&symbol, true, today).await.unwrap() }));
        }

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }

        let first = &results[0];
        for r in &results {
            assert_eq!(r, first);
        }
        assert_eq!(*engine.gateway.split_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn factor_at_returns_one_for_date_after_all_actions() {
        let file = FactorFile {
            rows: vec![
                FactorFileRow { date: date(2020, 1, 1), price_factor: 0.5, split_factor: 0.5, reference_price: 10.0 },
                FactorFileRow { date: date(2024, 1, 2), price_factor: 1.0, split_factor: 1.0, reference_price: 0.0 },
            ],
        };
        assert_eq!(factor_at(&file, date(2025, 1, 1)), Some((1.0, 1.0)));
        assert_eq!(factor_at(&file, date(2019, 1, 1)), Some((0.5, 0.5)));
    }
}
