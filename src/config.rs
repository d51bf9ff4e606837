//! Runtime configuration read from the environment
//!
//! Values are loaded once at startup (after `dotenvy` has populated the
//! process environment from `.env`). Everything except the payment secrets
//! has a development default.

use std::env;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::jobs::RetryPolicy;

/// Accepted link lifetimes, one day to a hundred years
const URL_TTL_DAYS: RangeInclusive<i64> = 1..=36_500;

#[derive(Debug, Clone)]
pub struct Config {
    /// `PORT`
    pub port: u16,
    /// `DATABASE_URL`, path of the redb file
    pub database_url: String,
    /// `BASE_URL`, public origin used to build short urls and callbacks
    pub base_url: String,
    /// `AUTHORIZATION`, required value of the `Authorization` header on `/api`
    pub api_key: Option<String>,
    pub short_code_salt: String,
    pub short_code_min_length: usize,
    pub mercado_pago_access_token: String,
    /// Shared HMAC secret for inbound webhooks; empty rejects every signature
    pub mercado_pago_webhook_secret: String,
    pub mercado_pago_api_url: String,
    pub job_workers: usize,
    pub job_max_attempts: u32,
    pub job_retry_delay: Duration,
    /// Links an anonymous client address may create per 24 hours
    pub anonymous_daily_limit: usize,
    /// Lifetime of non-permanent links
    pub url_ttl_days: i64,
    /// Coins granted once on registration
    pub signup_bonus: u64,
    pub maintenance_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            database_url: "data.db".to_string(),
            base_url: "http://localhost:8080".to_string(),
            api_key: None,
            short_code_salt: "linkledger".to_string(),
            short_code_min_length: 6,
            mercado_pago_access_token: String::new(),
            mercado_pago_webhook_secret: String::new(),
            mercado_pago_api_url: "https://api.mercadopago.com".to_string(),
            job_workers: 2,
            job_max_attempts: 5,
            job_retry_delay: Duration::from_secs(10),
            anonymous_daily_limit: 5,
            url_ttl_days: 7,
            signup_bonus: 5,
            maintenance_interval: Duration::from_secs(3600),
        }
    }
}

impl Config {
    /// Reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup, falling back to [`Config::default`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |key: &str, default: String| lookup(key).unwrap_or(default);

        Ok(Self {
            port: parse(&lookup, "PORT", defaults.port)?,
            database_url: text("DATABASE_URL", defaults.database_url),
            base_url: text("BASE_URL", defaults.base_url)
                .trim_end_matches('/')
                .to_string(),
            api_key: lookup("AUTHORIZATION").filter(|key| !key.is_empty()),
            short_code_salt: text("SHORT_CODE_SALT", defaults.short_code_salt),
            short_code_min_length: parse(
                &lookup,
                "SHORT_CODE_MIN_LENGTH",
                defaults.short_code_min_length,
            )?,
            mercado_pago_access_token: text(
                "MERCADO_PAGO_ACCESS_TOKEN",
                defaults.mercado_pago_access_token,
            ),
            mercado_pago_webhook_secret: text(
                "MERCADO_PAGO_WEBHOOK_SECRET",
                defaults.mercado_pago_webhook_secret,
            ),
            mercado_pago_api_url: text("MERCADO_PAGO_API_URL", defaults.mercado_pago_api_url),
            job_workers: parse(&lookup, "JOB_WORKERS", defaults.job_workers)?,
            job_max_attempts: parse(&lookup, "JOB_MAX_ATTEMPTS", defaults.job_max_attempts)?,
            job_retry_delay: Duration::from_secs(parse(
                &lookup,
                "JOB_RETRY_DELAY_SECS",
                defaults.job_retry_delay.as_secs(),
            )?),
            anonymous_daily_limit: parse(
                &lookup,
                "ANONYMOUS_DAILY_LIMIT",
                defaults.anonymous_daily_limit,
            )?,
            url_ttl_days: parse_within(
                &lookup,
                "URL_TTL_DAYS",
                defaults.url_ttl_days,
                URL_TTL_DAYS,
            )?,
            signup_bonus: parse(&lookup, "SIGNUP_BONUS", defaults.signup_bonus)?,
            maintenance_interval: Duration::from_secs(parse_within(
                &lookup,
                "MAINTENANCE_INTERVAL_SECS",
                defaults.maintenance_interval.as_secs(),
                1..=u64::MAX,
            )?),
        })
    }

    pub fn short_url(&self, short_code: &str) -> String {
        format!("{}/{}", self.base_url, short_code)
    }

    /// Where the payment provider delivers notifications.
    pub fn notification_url(&self) -> String {
        format!("{}/webhooks/mercadopago", self.base_url)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.job_max_attempts.max(1),
            delay: self.job_retry_delay,
        }
    }
}

fn parse<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}

fn parse_within<T, F>(
    lookup: &F,
    key: &'static str,
    default: T,
    range: RangeInclusive<T>,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + ToString,
    F: Fn(&str) -> Option<String>,
{
    let value = parse(lookup, key, default)?;
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        })
    }
}
