use anyhow::Context;
use chrono::Duration as ChronoDuration;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::order::TransitionPolicy;
use crate::utils::RetryConfig;

// ============================================================================
// Application Configuration
// ============================================================================
//
// Read from the environment (and a `.env` file when present). Every value has
// a default; a value that is set but does not parse is an error.
//
// ============================================================================

#[derive(Debug, Clone)]
pub struct OrderPolicy {
    pub pay_timeout: ChronoDuration,
    pub receive_window: ChronoDuration,
    pub review_window: ChronoDuration,
    pub shipping_fee: Decimal,
    /// Orders whose goods total reaches this ship for free
    pub free_shipping_threshold: Option<Decimal>,
}

impl OrderPolicy {
    pub fn transitions(&self) -> TransitionPolicy {
        TransitionPolicy {
            receive_window: self.receive_window,
            review_window: self.review_window,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub order_ttl: Duration,
    pub list_ttl: Duration,
    pub stats_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    pub batch_size: u32,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub card_url: Option<String>,
    pub wallet_url: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub metrics_port: u16,
    pub lock: LockConfig,
    pub retry: RetryConfig,
    pub orders: OrderPolicy,
    pub cache: CacheConfig,
    pub reconciler: ReconcilerConfig,
    pub gateways: GatewayConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: None,
            metrics_port: 9090,
            lock: LockConfig {
                ttl: Duration::from_secs(30),
            },
            retry: RetryConfig::default(),
            orders: OrderPolicy {
                pay_timeout: ChronoDuration::minutes(30),
                receive_window: ChronoDuration::days(7),
                review_window: ChronoDuration::days(15),
                shipping_fee: Decimal::ZERO,
                free_shipping_threshold: None,
            },
            cache: CacheConfig {
                order_ttl: Duration::from_secs(3600),
                list_ttl: Duration::from_secs(600),
                stats_ttl: Duration::from_secs(300),
            },
            reconciler: ReconcilerConfig {
                interval: Duration::from_secs(60),
                batch_size: 200,
            },
            gateways: GatewayConfig {
                card_url: None,
                wallet_url: None,
                timeout: Duration::from_millis(5000),
            },
        }
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        None => Ok(default),
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(e).context("failed to read .env file");
            }
        }

        let defaults = Self::default();

        let retry = RetryConfig {
            max_attempts: parsed("OPTIMISTIC_MAX_ATTEMPTS", defaults.retry.max_attempts)?.max(1),
            initial_delay: Duration::from_millis(parsed("OPTIMISTIC_BACKOFF_MS", 20u64)?),
            jitter: Duration::from_millis(parsed("OPTIMISTIC_JITTER_MS", 30u64)?),
            ..defaults.retry
        };

        let free_shipping_threshold = match var("FREE_SHIPPING_THRESHOLD") {
            Some(raw) => Some(
                Decimal::from_str(raw.trim())
                    .with_context(|| format!("invalid value for FREE_SHIPPING_THRESHOLD: {raw:?}"))?,
            ),
            None => None,
        };

        Ok(Self {
            database_url: var("DATABASE_URL"),
            redis_url: var("REDIS_URL"),
            metrics_port: parsed("METRICS_PORT", defaults.metrics_port)?,
            lock: LockConfig {
                ttl: Duration::from_secs(parsed("LOCK_TTL_SECS", 30u64)?),
            },
            retry,
            orders: OrderPolicy {
                pay_timeout: ChronoDuration::minutes(parsed("PAY_TIMEOUT_MINS", 30i64)?),
                receive_window: ChronoDuration::days(parsed("RECEIVE_WINDOW_DAYS", 7i64)?),
                review_window: ChronoDuration::days(parsed("REVIEW_WINDOW_DAYS", 15i64)?),
                shipping_fee: parsed("SHIPPING_FEE", Decimal::ZERO)?,
                free_shipping_threshold,
            },
            cache: CacheConfig {
                order_ttl: Duration::from_secs(parsed("CACHE_ORDER_TTL_SECS", 3600u64)?),
                list_ttl: Duration::from_secs(parsed("CACHE_LIST_TTL_SECS", 600u64)?),
                stats_ttl: Duration::from_secs(parsed("CACHE_STATS_TTL_SECS", 300u64)?),
            },
            reconciler: ReconcilerConfig {
                interval: Duration::from_secs(parsed("RECONCILE_INTERVAL_SECS", 60u64)?.max(1)),
                batch_size: parsed("RECONCILE_BATCH_SIZE", defaults.reconciler.batch_size)?.max(1),
            },
            gateways: GatewayConfig {
                card_url: var("GATEWAY_CARD_URL"),
                wallet_url: var("GATEWAY_WALLET_URL"),
                timeout: Duration::from_millis(parsed("GATEWAY_TIMEOUT_MS", 5000u64)?),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.lock.ttl, Duration::from_secs(30));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.orders.pay_timeout, ChronoDuration::minutes(30));
        assert_eq!(config.orders.transitions().receive_window, ChronoDuration::days(7));
        assert_eq!(config.orders.transitions().review_window, ChronoDuration::days(15));
        assert_eq!(config.cache.order_ttl, Duration::from_secs(3600));
        assert_eq!(config.cache.list_ttl, Duration::from_secs(600));
        assert_eq!(config.cache.stats_ttl, Duration::from_secs(300));
    }

    #[test]
    fn test_parsed_falls_back_to_default_when_unset() {
        let value: u64 = parsed("ORDER_LIFECYCLE_TEST_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }
}
