use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use tokio::sync::{RwLock, Semaphore};

use refdata_core::{CoarseRow, CorporateFactorProvider, FilingRecord, KeyedSingleflight, UpstreamGateway};

mod coarse_io;
mod fine_io;
mod property;

use coarse_io::{read_coarse_file, write_coarse_file_atomic};
use fine_io::{read_filing_cache, write_filing_cache_atomic};
pub use property::{parse_property, Field, Period, Property, Statement};

struct FilingCacheEntry {
    records: Vec<FilingRecord>,
    loaded_at: Option<DateTime<Utc>>,
}

/// Materializes one coarse-universe CSV per date and serves point-in-time
/// financial lookups over a dual-tier (memory + disk) per-ticker filing
/// cache.
///
/// `F` is the constructor-injected factor-lookup seam (Design Note 1):
/// `FactorFileEngine` implements it in production, tests inject a stub.
pub struct UniverseEngine<G, F> {
    gateway: Arc<G>,
    factor_provider: Arc<F>,
    base_dir: PathBuf,
    cache_hours: i64,
    max_concurrent: usize,
    /// Batch-mode deployments trust a loaded cache forever; live deployments
    /// re-check `cache_hours` staleness (§4.5.3 step 1).
    live: bool,
    coarse_singleflight: KeyedSingleflight<String, ()>,
    fundamentals_singleflight: KeyedSingleflight<String, ()>,
    fundamentals_cache: DashMap<String, FilingCacheEntry>,
    coarse_cache: RwLock<Option<(NaiveDate, HashMap<String, CoarseRow>)>>,
}

impl<G, F> UniverseEngine<G, F>
where
    G: UpstreamGateway,
    F: CorporateFactorProvider,
{
    pub fn new(gateway: G, factor_provider: F, base_dir: impl Into<PathBuf>, cache_hours: i64, max_concurrent: usize, live: bool) -> Self {
        Self {
            gateway: Arc::new(gateway),
            factor_provider: Arc::new(factor_provider),
            base_dir: base_dir.into(),
            cache_hours,
            max_concurrent,
            live,
            coarse_singleflight: KeyedSingleflight::new(),
            fundamentals_singleflight: KeyedSingleflight::new(),
            fundamentals_cache: DashMap::new(),
            coarse_cache: RwLock::new(None),
        }
    }

    fn coarse_path(&self, date: NaiveDate) -> PathBuf {
        self.base_dir.join("equity/usa/fundamental/coarse").join(format!("{}.csv", date.format("%Y%m%d")))
    }

    fn fine_path(&self, ticker: &str) -> PathBuf {
        self.base_dir.join("equity/usa/fundamental/fine/polygon").join(format!("{}.json", ticker.to_lowercase()))
    }

    // ---- §4.5.1 coarse generation ---------------------------------

    pub async fn generate_for(&self, date: NaiveDate) {
        let path = self.coarse_path(date);
        if path.exists() {
            return;
        }

        let key = format!("coarse-{}", date.format("%Y%m%d"));
        self.coarse_singleflight
            .execute(key, true, || async {
                if self.coarse_path(date).exists() {
                    return;
                }
                self.build_coarse(date).await;
            })
            .await;
    }

    async fn build_coarse(&self, date: NaiveDate) {
        let active: HashSet<String> = match self.gateway.fetch_active_tickers().await {
            Ok(tickers) => tickers.into_iter().collect(),
            Err(e) => {
                tracing::error!(error = %e, "failed to fetch active tickers, coarse generation aborted");
                return;
            }
        };

        let snapshot = match self.gateway.fetch_full_market_snapshot().await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to fetch full market snapshot, coarse generation aborted");
                return;
            }
        };

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent.max(1)));
        let mut handles = Vec::with_capacity(snapshot.len());

        for entry in snapshot {
            if !active.contains(&entry.ticker) {
                continue;
            }
            let bar = match entry.prev_day.or(entry.day) {
                Some(b) if b.close > 0.0 && b.volume > 0.0 => b,
                _ => continue,
            };

            let ticker = entry.ticker.clone();
            let factor_provider = Arc::clone(&self.factor_provider);
            let sem = Arc::clone(&semaphore);

            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok()?;
                let (price_factor, split_factor) = factor_provider.factors_on(&ticker, date).await.unwrap_or((1.0, 1.0));
                Some(CoarseRow {
                    // No permanent-identifier service is wired into this
                    // workspace (Open Question, see DESIGN.md); the ticker
                    // itself stands in for the permanent identifier.
                    perm_id: ticker.clone(),
                    ticker,
                    close: bar.close,
                    volume: bar.volume as i64,
                    dollar_volume: (bar.close * bar.volume).trunc(),
                    has_fundamentals: false,
                    price_factor,
                    split_factor,
                })
            }));
        }

        let mut rows = Vec::new();
        for handle in handles {
            if let Ok(Some(row)) = handle.await {
                rows.push(row);
            }
        }
        rows.sort_by(|a, b| a.perm_id.cmp(&b.perm_id));

        write_coarse_file_atomic(&self.coarse_path(date), &rows);
    }

    // ---- generic property lookup -----------------------------------

    /// `get(property, date, permId)`. Financial properties delegate to the
    /// fundamentals sub-service; everything else is read off the loaded
    /// coarse snapshot for `date`.
    pub async fn get(&self, property: &str, date: NaiveDate, perm_id: &str) -> f64 {
        match parse_property(property) {
            Some(Property::Financial { statement, field, period }) => self.financial_value(perm_id, date, statement, field, period).await,
            Some(Property::MarketCap) => f64::NAN,
            Some(Property::HasFundamentalData) => {
                self.ensure_loaded(perm_id).await;
                let key = perm_id.to_uppercase();
                self.fundamentals_cache.get(&key).is_some_and(|e| !e.records.is_empty()) as i32 as f64
            }
            None => self.coarse_field(property, date, perm_id).await,
        }
    }

    async fn coarse_field(&self, property: &str, date: NaiveDate, perm_id: &str) -> f64 {
        self.ensure_coarse_loaded(date).await;
        let cache = self.coarse_cache.read().await;
        let Some((loaded_date, map)) = cache.as_ref() else { return 0.0 };
        if *loaded_date != date {
            return 0.0;
        }
        let Some(row) = map.get(perm_id) else { return 0.0 };

        match property {
            "Close" => row.close,
            "Volume" => row.volume as f64,
            "DollarVolume" => row.dollar_volume,
            "PriceFactor" => row.price_factor,
            "SplitFactor" => row.split_factor,
            _ => 0.0,
        }
    }

    async fn ensure_coarse_loaded(&self, date: NaiveDate) {
        {
            let cache = self.coarse_cache.read().await;
            if cache.as_ref().is_some_and(|(d, _)| *d == date) {
                return;
            }
        }

        let mut cache = self.coarse_cache.write().await;
        if cache.as_ref().is_some_and(|(d, _)| *d == date) {
            return;
        }

        let rows = read_coarse_file(&self.coarse_path(date)).unwrap_or_default();
        let map: HashMap<String, CoarseRow> = rows.into_iter().map(|r| (r.perm_id.clone(), r)).collect();
        *cache = Some((date, map));
    }

    // ---- §4.5.2 / §4.5.3 fundamentals --------------------------------

    async fn financial_value(&self, ticker: &str, date: NaiveDate, statement: Statement, field: Field, period: Period) -> f64 {
        if !matches!(period, Period::ThreeMonths | Period::TwelveMonths) {
            return f64::NAN;
        }

        self.ensure_loaded(ticker).await;
        let key = ticker.to_uppercase();
        let Some(entry) = self.fundamentals_cache.get(&key) else { return f64::NAN };
        if entry.records.is_empty() {
            return f64::NAN;
        }

        match (period, statement) {
            (Period::ThreeMonths, _) => property::quarterly_value(&entry.records, date, statement, field),
            (Period::TwelveMonths, Statement::BalanceSheet) => property::quarterly_value(&entry.records, date, statement, field),
            (Period::TwelveMonths, _) => property::ttm_flow_value(&entry.records, date, statement, field),
            _ => f64::NAN,
        }
    }

    async fn ensure_loaded(&self, ticker: &str) {
        let key = ticker.to_uppercase();
        if self.is_loaded_and_fresh(&key) {
            return;
        }

        self.fundamentals_singleflight.execute(key.clone(), true, || async { self.load_filing_list(&key).await }).await;
    }

    fn is_loaded_and_fresh(&self, key: &str) -> bool {
        self.fundamentals_cache.get(key).is_some_and(|e| match e.loaded_at {
            Some(loaded_at) => !self.live || Utc::now().signed_duration_since(loaded_at) < chrono::Duration::hours(self.cache_hours),
            None => false,
        })
    }

    async fn load_filing_list(&self, ticker: &str) {
        if self.is_loaded_and_fresh(ticker) {
            return;
        }

        let path = self.fine_path(ticker);
        if let Some((records, mtime)) = read_filing_cache(&path) {
            let fresh_enough = !self.live || Utc::now().signed_duration_since(mtime) < chrono::Duration::hours(self.cache_hours);
            if fresh_enough {
                self.fundamentals_cache.insert(ticker.to_string(), FilingCacheEntry { records, loaded_at: Some(Utc::now()) });
                return;
            }
        }

        match self.gateway.fetch_quarterly_financials(ticker).await {
            Ok(mut records) => {
                records.sort_by_key(|r| r.filing_date);
                write_filing_cache_atomic(&path, &records);
                self.fundamentals_cache.insert(ticker.to_string(), FilingCacheEntry { records, loaded_at: Some(Utc::now()) });
            }
            Err(e) => {
                tracing::warn!(%ticker, error = %e, "quarterly financials fetch failed, preserving retry eligibility");
            }
        }
    }
}
