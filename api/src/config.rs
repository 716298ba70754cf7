use std::time::Duration;

use crate::mitigation::verifier::TURNSTILE_VERIFY_URL;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_VERIFY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_BYPASS_GRANT_MINUTES: i64 = 30;
const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 60;
const DEFAULT_EVENT_RETENTION_DAYS: i64 = 7;
const DEFAULT_MAX_INSPECTED_BODY_BYTES: usize = 64 * 1024;
const DEFAULT_CORS_ORIGINS: &str = "http://localhost:3000";

/// Runtime configuration, read once at startup. Unparseable values fall back
/// to their defaults with a warning instead of aborting.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Take the client address from the first X-Forwarded-For hop. Only safe
    /// behind a proxy that overwrites the header.
    pub trust_forwarded_for: bool,
    pub turnstile_site_key: Option<String>,
    pub turnstile_secret_key: Option<String>,
    pub turnstile_verify_url: String,
    pub turnstile_expected_hostname: Option<String>,
    pub verify_timeout: Duration,
    pub bypass_grant_ttl: chrono::Duration,
    pub maintenance_interval: Duration,
    pub event_retention: chrono::Duration,
    pub max_inspected_body_bytes: usize,
    /// Admin routes answer 404 while unset.
    pub admin_token: Option<String>,
    pub cors_origins: Vec<String>,
    /// Header an upstream auth proxy sets to the signed-in user's id.
    pub identity_header: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        Self {
            port: parsed(&lookup, "PORT", DEFAULT_PORT),
            trust_forwarded_for: flag(&lookup, "ENCORE_TRUST_FORWARDED_FOR", true),
            turnstile_site_key: text("TURNSTILE_SITE_KEY"),
            turnstile_secret_key: text("TURNSTILE_SECRET_KEY"),
            turnstile_verify_url: text("TURNSTILE_VERIFY_URL")
                .unwrap_or_else(|| TURNSTILE_VERIFY_URL.to_string()),
            turnstile_expected_hostname: text("TURNSTILE_EXPECTED_HOSTNAME"),
            verify_timeout: Duration::from_millis(positive(
                &lookup,
                "ENCORE_VERIFY_TIMEOUT_MS",
                DEFAULT_VERIFY_TIMEOUT_MS,
            )),
            bypass_grant_ttl: chrono::Duration::minutes(positive(
                &lookup,
                "ENCORE_BYPASS_GRANT_MINUTES",
                DEFAULT_BYPASS_GRANT_MINUTES,
            )),
            maintenance_interval: Duration::from_secs(positive(
                &lookup,
                "ENCORE_MAINTENANCE_INTERVAL_SECS",
                DEFAULT_MAINTENANCE_INTERVAL_SECS,
            )),
            event_retention: chrono::Duration::days(positive(
                &lookup,
                "ENCORE_EVENT_RETENTION_DAYS",
                DEFAULT_EVENT_RETENTION_DAYS,
            )),
            max_inspected_body_bytes: parsed(
                &lookup,
                "ENCORE_MAX_INSPECTED_BODY_BYTES",
                DEFAULT_MAX_INSPECTED_BODY_BYTES,
            ),
            admin_token: text("ENCORE_SECURITY_ADMIN_TOKEN"),
            cors_origins: text("ENCORE_CORS_ORIGINS")
                .unwrap_or_else(|| DEFAULT_CORS_ORIGINS.to_string())
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_string)
                .collect(),
            identity_header: text("ENCORE_IDENTITY_HEADER")
                .map(|value| value.to_ascii_lowercase()),
        }
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(key, value = %raw, default = %default, "invalid config value; using default");
            default
        }
    }
}

fn positive<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy + PartialOrd + Default,
{
    let value = parsed(lookup, key, default);
    if value > T::default() {
        value
    } else {
        tracing::warn!(key, value = %value, default = %default, "config value must be positive; using default");
        default
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match lookup(key).map(|value| value.trim().to_ascii_lowercase()) {
        None => default,
        Some(value) => match value.as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                tracing::warn!(key, value = %value, default, "invalid boolean; using default");
                default
            }
        },
    }
}
