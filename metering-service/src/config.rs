//! Configuration module for metering-service.

use crate::models::PriceIds;
use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MeteringConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub tracker: TrackerConfig,
    pub reporting: ReportingConfig,
    pub provider: ProviderConfig,
    pub webhook: WebhookConfig,
    pub prices: PriceIds,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub flush_interval: Duration,
    /// Flush early once more than this many distinct keys are buffered.
    pub flush_threshold: usize,
    /// Upper bound for the final flush on shutdown.
    pub close_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(10),
            flush_threshold: 100,
            close_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReportingConfig {
    /// `None` disables the background usage reporter.
    pub interval: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub secret_key: Secret<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Empty disables signature verification.
    pub secret: Secret<String>,
    pub tolerance_secs: i64,
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl MeteringConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let flush_threshold: usize = parse_env("USAGE_FLUSH_THRESHOLD", 100);
        if flush_threshold == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "USAGE_FLUSH_THRESHOLD must be greater than zero"
            )));
        }
        let flush_interval_secs: u64 = parse_env("USAGE_FLUSH_INTERVAL_SECS", 10);
        if flush_interval_secs == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "USAGE_FLUSH_INTERVAL_SECS must be greater than zero"
            )));
        }
        let report_interval_secs: u64 = parse_env("USAGE_REPORT_INTERVAL_SECS", 0);

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "metering-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", 2),
            },
            tracker: TrackerConfig {
                flush_interval: Duration::from_secs(flush_interval_secs),
                flush_threshold,
                close_timeout: Duration::from_secs(parse_env("USAGE_FLUSH_TIMEOUT_SECS", 30)),
            },
            reporting: ReportingConfig {
                interval: (report_interval_secs > 0)
                    .then(|| Duration::from_secs(report_interval_secs)),
            },
            provider: ProviderConfig {
                base_url: env::var("BILLING_PROVIDER_URL")
                    .unwrap_or_else(|_| "https://api.stripe.com".to_string()),
                secret_key: Secret::new(env::var("BILLING_PROVIDER_SECRET_KEY").unwrap_or_default()),
                timeout: Duration::from_secs(parse_env("BILLING_PROVIDER_TIMEOUT_SECS", 30)),
            },
            webhook: WebhookConfig {
                secret: Secret::new(env::var("BILLING_WEBHOOK_SECRET").unwrap_or_default()),
                tolerance_secs: parse_env("BILLING_WEBHOOK_TOLERANCE_SECS", 300),
            },
            prices: PriceIds {
                pro: env::var("PRICE_ID_PRO").ok(),
                enterprise: env::var("PRICE_ID_ENTERPRISE").ok(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "DATABASE_URL",
        "USAGE_FLUSH_INTERVAL_SECS",
        "USAGE_FLUSH_THRESHOLD",
        "USAGE_REPORT_INTERVAL_SECS",
        "BILLING_WEBHOOK_SECRET",
        "PRICE_ID_PRO",
    ];

    fn clear() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn defaults_apply() {
        clear();
        env::set_var("DATABASE_URL", "postgres://localhost/metering");

        let config = MeteringConfig::from_env().unwrap();
        assert_eq!(config.tracker.flush_interval, Duration::from_secs(10));
        assert_eq!(config.tracker.flush_threshold, 100);
        assert!(config.reporting.interval.is_none());
        assert_eq!(config.webhook.tolerance_secs, 300);
        assert!(config.webhook.secret.expose_secret().is_empty());
        assert_eq!(config.provider.base_url, "https://api.stripe.com");

        clear();
    }

    #[test]
    #[serial]
    fn overrides_from_environment() {
        clear();
        env::set_var("DATABASE_URL", "postgres://localhost/metering");
        env::set_var("USAGE_FLUSH_INTERVAL_SECS", "2");
        env::set_var("USAGE_FLUSH_THRESHOLD", "5");
        env::set_var("USAGE_REPORT_INTERVAL_SECS", "60");
        env::set_var("PRICE_ID_PRO", "price_pro");

        let config = MeteringConfig::from_env().unwrap();
        assert_eq!(config.tracker.flush_interval, Duration::from_secs(2));
        assert_eq!(config.tracker.flush_threshold, 5);
        assert_eq!(config.reporting.interval, Some(Duration::from_secs(60)));
        assert_eq!(config.prices.pro.as_deref(), Some("price_pro"));

        clear();
    }

    #[test]
    #[serial]
    fn rejects_missing_database_and_zero_threshold() {
        clear();
        assert!(MeteringConfig::from_env().is_err());

        env::set_var("DATABASE_URL", "postgres://localhost/metering");
        env::set_var("USAGE_FLUSH_THRESHOLD", "0");
        assert!(MeteringConfig::from_env().is_err());

        clear();
    }
}
