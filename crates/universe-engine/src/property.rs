use refdata_core::{FilingRecord, FinancialStatements, Timeframe};

/// A fully parsed `property` argument to [`UniverseEngine::get`]. Parsing is
/// total (§8 law 6): an unrecognized name simply fails to parse, and the
/// caller treats that as "not a financial property" rather than an error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Property {
    Financial { statement: Statement, field: Field, period: Period },
    MarketCap,
    HasFundamentalData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statement {
    IncomeStatement,
    BalanceSheet,
    CashFlowStatement,
}

impl Statement {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "IncomeStatement" => Some(Self::IncomeStatement),
            "BalanceSheet" => Some(Self::BalanceSheet),
            "CashFlowStatement" => Some(Self::CashFlowStatement),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    TotalRevenue,
    CostOfRevenue,
    GrossProfit,
    OperatingIncome,
    NetIncome,
    TotalAssets,
    CurrentAssets,
    CurrentLiabilities,
    StockholdersEquity,
    TotalEquity,
    OperatingCashFlow,
    InvestingCashFlow,
    FinancingCashFlow,
    CapitalExpenditure,
    FreeCashFlow,
}

impl Field {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "TotalRevenue" => Self::TotalRevenue,
            "CostOfRevenue" => Self::CostOfRevenue,
            "GrossProfit" => Self::GrossProfit,
            "OperatingIncome" => Self::OperatingIncome,
            "NetIncome" => Self::NetIncome,
            "TotalAssets" => Self::TotalAssets,
            "CurrentAssets" => Self::CurrentAssets,
            "CurrentLiabilities" => Self::CurrentLiabilities,
            "StockholdersEquity" => Self::StockholdersEquity,
            "TotalEquity" => Self::TotalEquity,
            "OperatingCashFlow" => Self::OperatingCashFlow,
            "InvestingCashFlow" => Self::InvestingCashFlow,
            "FinancingCashFlow" => Self::FinancingCashFlow,
            "CapitalExpenditure" => Self::CapitalExpenditure,
            "FreeCashFlow" => Self::FreeCashFlow,
            _ => return None,
        })
    }

    /// The upstream field key this maps to, or `None` for `FreeCashFlow`,
    /// which is computed rather than read directly.
    fn upstream_key(&self) -> Option<&'static str> {
        match self {
            Self::TotalRevenue => Some("revenues"),
            Self::CostOfRevenue => Some("cost_of_revenue"),
            Self::GrossProfit => Some("gross_profit"),
            Self::OperatingIncome => Some("operating_income_loss"),
            Self::NetIncome => Some("net_income_loss"),
            Self::TotalAssets => Some("assets"),
            Self::CurrentAssets => Some("current_assets"),
            Self::CurrentLiabilities => Some("current_liabilities"),
            Self::StockholdersEquity => Some("equity_attributable_to_parent"),
            Self::TotalEquity => Some("equity"),
            Self::OperatingCashFlow => Some("net_cash_flow_from_operating_activities"),
            Self::InvestingCashFlow => Some("net_cash_flow_from_investing_activities"),
            Self::FinancingCashFlow => Some("net_cash_flow_from_financing_activities"),
            Self::CapitalExpenditure => Some("capital_expenditure"),
            Self::FreeCashFlow => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    OneMonth,
    TwoMonths,
    ThreeMonths,
    SixMonths,
    NineMonths,
    TwelveMonths,
}

impl Period {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "OneMonth" => Self::OneMonth,
            "TwoMonths" => Self::TwoMonths,
            "ThreeMonths" => Self::ThreeMonths,
            "SixMonths" => Self::SixMonths,
            "NineMonths" => Self::NineMonths,
            "TwelveMonths" => Self::TwelveMonths,
            _ => return None,
        })
    }
}

/// `FinancialStatements_{Statement}_{Field}_{Period}`, plus the two
/// standalone names `CompanyProfile_MarketCap` and `HasFundamentalData`.
pub fn parse_property(name: &str) -> Option<Property> {
    if name == "CompanyProfile_MarketCap" {
        return Some(Property::MarketCap);
    }
    if name == "HasFundamentalData" {
        return Some(Property::HasFundamentalData);
    }

    let rest = name.strip_prefix("FinancialStatements_")?;
    let parts: Vec<&str> = rest.split('_').collect();
    if parts.len() != 3 {
        return None;
    }
    let statement = Statement::parse(parts[0])?;
    let field = Field::parse(parts[1])?;
    let period = Period::parse(parts[2])?;
    Some(Property::Financial { statement, field, period })
}

fn statement_map(statements: &FinancialStatements, statement: Statement) -> &std::collections::HashMap<String, f64> {
    match statement {
        Statement::IncomeStatement => &statements.income,
        Statement::BalanceSheet => &statements.balance,
        Statement::CashFlowStatement => &statements.cashflow,
    }
}

/// A single filing's value for `(statement, field)`, with `FreeCashFlow`
/// computed as `operatingCashFlow + capitalExpenditure` (capex is signed
/// negative upstream).
fn field_value(record: &FilingRecord, statement: Statement, field: Field) -> f64 {
    if field == Field::FreeCashFlow {
        let ocf = statement_map(&record.statements, Statement::CashFlowStatement).get(Field::OperatingCashFlow.upstream_key().unwrap());
        let capex = statement_map(&record.statements, Statement::CashFlowStatement).get(Field::CapitalExpenditure.upstream_key().unwrap());
        return match (ocf, capex) {
            (Some(o), Some(c)) => o + c,
            _ => f64::NAN,
        };
    }

    match field.upstream_key() {
        Some(key) => statement_map(&record.statements, statement).get(key).copied().unwrap_or(f64::NAN),
        None => f64::NAN,
    }
}

/// Quarterly (ThreeMonths), and the TwelveMonths balance-sheet case: the
/// single field value of the most recent quarterly filing with
/// `filingDate <= date`.
pub fn quarterly_value(records: &[FilingRecord], date: chrono::NaiveDate, statement: Statement, field: Field) -> f64 {
    records
        .iter()
        .rev()
        .find(|r| r.timeframe == Timeframe::Quarterly && r.filing_date <= date)
        .map(|r| field_value(r, statement, field))
        .unwrap_or(f64::NAN)
}

/// TwelveMonths for income-statement/cash-flow/FreeCashFlow fields: sum of
/// the four most recent quarterly filings with `filingDate <= date`. Fewer
/// than four available, or any summand NaN, yields NaN.
pub fn ttm_flow_value(records: &[FilingRecord], date: chrono::NaiveDate, statement: Statement, field: Field) -> f64 {
    let mut quarterlies: Vec<&FilingRecord> = records.iter().filter(|r| r.timeframe == Timeframe::Quarterly && r.filing_date <= date).collect();
    quarterlies.sort_by_key(|r| r.filing_date);

    if quarterlies.len() < 4 {
        return f64::NAN;
    }
    let last_four = &quarterlies[quarterlies.len() - 4..];

    let mut sum = 0.0;
    for r in last_four {
        let v = field_value(r, statement, field);
        if v.is_nan() {
            return f64::NAN;
        }
        sum += v;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_property_is_total() {
        assert_eq!(
            parse_property("FinancialStatements_IncomeStatement_TotalRevenue_TwelveMonths"),
            Some(Property::Financial { statement: Statement::IncomeStatement, field: Field::TotalRevenue, period: Period::TwelveMonths })
        );
        assert_eq!(parse_property("CompanyProfile_MarketCap"), Some(Property::MarketCap));
        assert_eq!(parse_property("HasFundamentalData"), Some(Property::HasFundamentalData));
        assert_eq!(parse_property("not a real property"), None);
        assert_eq!(parse_property("FinancialStatements_Bogus_TotalRevenue_ThreeMonths"), None);
    }

    fn filing(filing_date: chrono::NaiveDate, revenue: f64) -> FilingRecord {
        let mut income = std::collections::HashMap::new();
        income.insert("revenues".to_string(), revenue);
        FilingRecord {
            ticker: "AAPL".to_string(),
            fiscal_year: filing_date.format("%Y").to_string().parse().unwrap(),
            fiscal_period: "Q1".to_string(),
            start_date: filing_date,
            end_date: filing_date,
            filing_date,
            timeframe: Timeframe::Quarterly,
            statements: FinancialStatements { income, balance: Default::default(), cashflow: Default::default() },
        }
    }

    #[test]
    fn s4_ttm_revenue_sums_four_quarters() {
        let records = vec![
            filing(chrono::NaiveDate::from_ymd_opt(2023, 2, 3).unwrap(), 100_000.0),
            filing(chrono::NaiveDate::from_ymd_opt(2023, 5, 5).unwrap(), 110_000.0),
            filing(chrono::NaiveDate::from_ymd_opt(2023, 8, 4).unwrap(), 120_000.0),
            filing(chrono::NaiveDate::from_ymd_opt(2023, 11, 3).unwrap(), 130_000.0),
        ];

        let on_dec1 = ttm_flow_value(&records, chrono::NaiveDate::from_ymd_opt(2023, 12, 1).unwrap(), Statement::IncomeStatement, Field::TotalRevenue);
        assert_eq!(on_dec1, 460_000.0);

        let on_jun1 = ttm_flow_value(&records[..2], chrono::NaiveDate::from_ymd_opt(2023, 6, 1).unwrap(), Statement::IncomeStatement, Field::TotalRevenue);
        assert!(on_jun1.is_nan());
    }

    #[test]
    fn s5_free_cash_flow_ttm_nets_capex() {
        let mut records = Vec::new();
        for (date, ocf, capex) in [
            (chrono::NaiveDate::from_ymd_opt(2023, 2, 3).unwrap(), 30_000.0, -5_000.0),
            (chrono::NaiveDate::from_ymd_opt(2023, 5, 5).unwrap(), 32_000.0, -6_000.0),
            (chrono::NaiveDate::from_ymd_opt(2023, 8, 4).unwrap(), 28_000.0, -4_000.0),
            (chrono::NaiveDate::from_ymd_opt(2023, 11, 3).unwrap(), 35_000.0, -7_000.0),
        ] {
            let mut cashflow = std::collections::HashMap::new();
            cashflow.insert("net_cash_flow_from_operating_activities".to_string(), ocf);
            cashflow.insert("capital_expenditure".to_string(), capex);
            records.push(FilingRecord {
                ticker: "AAPL".to_string(),
                fiscal_year: 2023,
                fiscal_period: "Q".to_string(),
                start_date: date,
                end_date: date,
                filing_date: date,
                timeframe: Timeframe::Quarterly,
                statements: FinancialStatements { income: Default::default(), balance: Default::default(), cashflow },
            });
        }

        let value = ttm_flow_value(&records, chrono::NaiveDate::from_ymd_opt(2023, 12, 1).unwrap(), Statement::CashFlowStatement, Field::FreeCashFlow);
        assert_eq!(value, (30_000.0 - 5_000.0) + (32_000.0 - 6_000.0) + (28_000.0 - 4_000.0) + (35_000.0 - 7_000.0));
    }
}
