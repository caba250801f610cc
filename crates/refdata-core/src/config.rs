use crate::error::RefDataError;

/// Gateway and engine configuration, loaded from environment variables the
/// way `data-loader`/`api-server` load theirs: plain `std::env::var` reads
/// with defaults, and a hard failure only for the one required key.
///
/// Nothing in this workspace loads a `.env` file; that would be the
/// responsibility of whatever process eventually embeds this crate.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub polygon_api_key: String,
    pub financials_cache_hours: i64,
    pub coarse_max_concurrent: usize,
    pub rate_limit_per_minute: usize,
}

impl GatewayConfig {
    /// Load from the environment. Fails only if `POLYGON_API_KEY` is unset
    /// or empty — the one configuration-missing error that is allowed to
    /// surface to a caller (§7).
    pub fn from_env() -> Result<Self, RefDataError> {
        let polygon_api_key = std::env::var("POLYGON_API_KEY")
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                RefDataError::ConfigurationMissing("POLYGON_API_KEY must be set".to_string())
            })?;

        Ok(Self {
            polygon_api_key,
            financials_cache_hours: env_parse("POLYGON_FINANCIALS_CACHE_HOURS", 24),
            coarse_max_concurrent: env_parse("POLYGON_COARSE_MAX_CONCURRENT", 10),
            // Clamped to at least 1: a zero window would make the rate
            // limiter's "room for another request" check unsatisfiable and
            // spin forever waiting on an empty queue (see RateLimiter::acquire).
            rate_limit_per_minute: env_parse::<usize>("POLYGON_RATE_LIMIT", 500).max(1),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
