use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::Duration;
use thiserror::Error;
use tracing::warn;

use crate::db::models::ChangeType;
use crate::db::Database;
use crate::graph::GRAPH_API_BASE;
use crate::subscriptions::{RenewalPolicy, MAX_SUBSCRIPTION_TTL_MINUTES};

const DEFAULT_BIND: &str = "0.0.0.0:8000";
const DEFAULT_SUBSCRIPTION_TTL_MINUTES: i64 = 4200;
const DEFAULT_RENEWAL_MARGIN_SECS: i64 = 3600;
const DEFAULT_RENEWAL_TICK_SECS: u64 = 60;
const DEFAULT_RENEWAL_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BACKOFF_BASE_SECS: i64 = 30;
const DEFAULT_BACKOFF_MAX_SECS: i64 = 600;
const DEFAULT_RENEWAL_LEASE_SECS: i64 = 300;
const DEFAULT_DEDUP_TTL_SECS: u64 = 4 * 60 * 60;
const DEFAULT_DEDUP_CAPACITY: usize = 100_000;
const DEFAULT_HANDLER_CONCURRENCY: usize = 8;
const DEFAULT_HANDLER_ACQUIRE_TIMEOUT_MS: u64 = 5000;
const IN_MEMORY_DB: &str = ":memory:";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}={value:?} is invalid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("renewal tick ({tick_secs}s) must not exceed the renewal margin ({margin_secs}s)")]
    TickExceedsMargin { tick_secs: u64, margin_secs: i64 },

    #[error("cannot resolve default database path: {0}")]
    DbPath(String),
}

#[derive(Clone, PartialEq, Eq)]
pub struct GraphCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

impl Debug for GraphCredentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphCredentials")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphMode {
    Live,
    Mock,
}

impl FromStr for GraphMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "mock" => Ok(Self::Mock),
            other => Err(format!("expected live or mock, got {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Memory,
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupSettings {
    pub ttl: StdDuration,
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSettings {
    pub concurrency: usize,
    pub acquire_timeout: StdDuration,
}

/// Runtime configuration.
///
/// Resolved from environment variables:
/// - `AZURE_TENANT_ID`, `AZURE_CLIENT_ID`, `AZURE_CLIENT_SECRET`: app registration (live mode)
/// - `AZURE_USER_ID`: mailbox whose Inbox is watched by default
/// - `MAILWATCH_BIND`: listen address (default `0.0.0.0:8000`)
/// - `MAILWATCH_PUBLIC_URL`: externally reachable base URL for notification callbacks
/// - `MAILWATCH_GRAPH_MODE`: `live` (default) or `mock`
/// - `MAILWATCH_CHANGE_TYPE`: change kinds for the default subscription (default `created`)
/// - `MAILWATCH_DB_PATH`: SQLite file, or `:memory:` (default `~/.mailwatch/mailwatch.db`)
/// - `MAILWATCH_SUBSCRIPTION_TTL_MINUTES`, `MAILWATCH_RENEWAL_*`, `MAILWATCH_DEDUP_*`,
///   `MAILWATCH_HANDLER_*`: tuning knobs, see the defaults above
#[derive(Debug, Clone)]
pub struct Config {
    pub credentials: Option<GraphCredentials>,
    pub user_id: Option<String>,
    pub bind: SocketAddr,
    pub public_url: Option<String>,
    pub graph_mode: GraphMode,
    pub graph_api_base: String,
    pub token_url: Option<String>,
    pub store: StoreLocation,
    pub change_type: ChangeType,
    pub subscription_ttl: Duration,
    pub renewal: RenewalPolicy,
    pub dedup: DedupSettings,
    pub dispatch: DispatchSettings,
    pub auto_subscribe: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let credentials = match (
            read("AZURE_TENANT_ID"),
            read("AZURE_CLIENT_ID"),
            read("AZURE_CLIENT_SECRET"),
        ) {
            (Some(tenant_id), Some(client_id), Some(client_secret)) => Some(GraphCredentials {
                tenant_id,
                client_id,
                client_secret,
            }),
            _ => None,
        };

        let graph_mode = parse_or("MAILWATCH_GRAPH_MODE", read("MAILWATCH_GRAPH_MODE"), GraphMode::Live)?;
        if credentials.is_none() && graph_mode == GraphMode::Live {
            warn!("AZURE_TENANT_ID/AZURE_CLIENT_ID/AZURE_CLIENT_SECRET not fully set; graph calls will fail");
        }

        let store = match read("MAILWATCH_DB_PATH") {
            Some(path) if path.trim() == IN_MEMORY_DB => StoreLocation::Memory,
            Some(path) => StoreLocation::File(PathBuf::from(path)),
            None => StoreLocation::File(
                Database::default_db_path().map_err(|error| ConfigError::DbPath(error.to_string()))?,
            ),
        };

        let ttl_minutes: i64 = parse_or(
            "MAILWATCH_SUBSCRIPTION_TTL_MINUTES",
            read("MAILWATCH_SUBSCRIPTION_TTL_MINUTES"),
            DEFAULT_SUBSCRIPTION_TTL_MINUTES,
        )?;
        positive("MAILWATCH_SUBSCRIPTION_TTL_MINUTES", ttl_minutes)?;
        if ttl_minutes > MAX_SUBSCRIPTION_TTL_MINUTES {
            warn!(
                requested = ttl_minutes,
                max = MAX_SUBSCRIPTION_TTL_MINUTES,
                "subscription ttl capped at provider maximum"
            );
        }

        let margin_secs: i64 = parse_or(
            "MAILWATCH_RENEWAL_MARGIN_SECS",
            read("MAILWATCH_RENEWAL_MARGIN_SECS"),
            DEFAULT_RENEWAL_MARGIN_SECS,
        )?;
        positive("MAILWATCH_RENEWAL_MARGIN_SECS", margin_secs)?;
        let tick_secs: u64 = parse_or(
            "MAILWATCH_RENEWAL_TICK_SECS",
            read("MAILWATCH_RENEWAL_TICK_SECS"),
            DEFAULT_RENEWAL_TICK_SECS,
        )?;
        positive("MAILWATCH_RENEWAL_TICK_SECS", tick_secs)?;
        if i64::try_from(tick_secs).map_or(true, |tick| tick > margin_secs) {
            return Err(ConfigError::TickExceedsMargin {
                tick_secs,
                margin_secs,
            });
        }

        let max_attempts: u32 = parse_or(
            "MAILWATCH_RENEWAL_MAX_ATTEMPTS",
            read("MAILWATCH_RENEWAL_MAX_ATTEMPTS"),
            DEFAULT_RENEWAL_MAX_ATTEMPTS,
        )?;
        positive("MAILWATCH_RENEWAL_MAX_ATTEMPTS", max_attempts)?;
        let backoff_base_secs: i64 = parse_or(
            "MAILWATCH_RENEWAL_BACKOFF_BASE_SECS",
            read("MAILWATCH_RENEWAL_BACKOFF_BASE_SECS"),
            DEFAULT_BACKOFF_BASE_SECS,
        )?;
        positive("MAILWATCH_RENEWAL_BACKOFF_BASE_SECS", backoff_base_secs)?;
        let backoff_max_secs: i64 = parse_or(
            "MAILWATCH_RENEWAL_BACKOFF_MAX_SECS",
            read("MAILWATCH_RENEWAL_BACKOFF_MAX_SECS"),
            DEFAULT_BACKOFF_MAX_SECS,
        )?;
        if backoff_max_secs < backoff_base_secs {
            return Err(ConfigError::Invalid {
                key: "MAILWATCH_RENEWAL_BACKOFF_MAX_SECS",
                value: backoff_max_secs.to_string(),
                reason: "must be at least MAILWATCH_RENEWAL_BACKOFF_BASE_SECS".to_string(),
            });
        }

        let lease_secs: i64 = parse_or(
            "MAILWATCH_RENEWAL_LEASE_SECS",
            read("MAILWATCH_RENEWAL_LEASE_SECS"),
            DEFAULT_RENEWAL_LEASE_SECS,
        )?;
        positive("MAILWATCH_RENEWAL_LEASE_SECS", lease_secs)?;

        let dedup_ttl_secs: u64 = parse_or(
            "MAILWATCH_DEDUP_TTL_SECS",
            read("MAILWATCH_DEDUP_TTL_SECS"),
            DEFAULT_DEDUP_TTL_SECS,
        )?;
        positive("MAILWATCH_DEDUP_TTL_SECS", dedup_ttl_secs)?;
        let dedup_capacity: usize = parse_or(
            "MAILWATCH_DEDUP_CAPACITY",
            read("MAILWATCH_DEDUP_CAPACITY"),
            DEFAULT_DEDUP_CAPACITY,
        )?;
        positive("MAILWATCH_DEDUP_CAPACITY", dedup_capacity)?;

        let concurrency: usize = parse_or(
            "MAILWATCH_HANDLER_CONCURRENCY",
            read("MAILWATCH_HANDLER_CONCURRENCY"),
            DEFAULT_HANDLER_CONCURRENCY,
        )?;
        positive("MAILWATCH_HANDLER_CONCURRENCY", concurrency)?;
        let acquire_timeout_ms: u64 = parse_or(
            "MAILWATCH_HANDLER_ACQUIRE_TIMEOUT_MS",
            read("MAILWATCH_HANDLER_ACQUIRE_TIMEOUT_MS"),
            DEFAULT_HANDLER_ACQUIRE_TIMEOUT_MS,
        )?;

        Ok(Self {
            credentials,
            user_id: read("AZURE_USER_ID"),
            bind: parse_or(
                "MAILWATCH_BIND",
                read("MAILWATCH_BIND"),
                DEFAULT_BIND
                    .parse()
                    .map_err(|_| invalid("MAILWATCH_BIND", DEFAULT_BIND, "bad default"))?,
            )?,
            public_url: read("MAILWATCH_PUBLIC_URL").map(|url| url.trim_end_matches('/').to_string()),
            graph_mode,
            graph_api_base: read("MAILWATCH_GRAPH_API_BASE")
                .unwrap_or_else(|| GRAPH_API_BASE.to_string()),
            token_url: read("MAILWATCH_TOKEN_URL"),
            store,
            change_type: parse_or(
                "MAILWATCH_CHANGE_TYPE",
                read("MAILWATCH_CHANGE_TYPE"),
                ChangeType::created(),
            )?,
            subscription_ttl: Duration::minutes(ttl_minutes.min(MAX_SUBSCRIPTION_TTL_MINUTES)),
            renewal: RenewalPolicy {
                margin: seconds("MAILWATCH_RENEWAL_MARGIN_SECS", margin_secs)?,
                tick: StdDuration::from_secs(tick_secs),
                max_attempts,
                backoff_base: seconds("MAILWATCH_RENEWAL_BACKOFF_BASE_SECS", backoff_base_secs)?,
                backoff_max: seconds("MAILWATCH_RENEWAL_BACKOFF_MAX_SECS", backoff_max_secs)?,
                lease: seconds("MAILWATCH_RENEWAL_LEASE_SECS", lease_secs)?,
            },
            dedup: DedupSettings {
                ttl: StdDuration::from_secs(dedup_ttl_secs),
                capacity: dedup_capacity,
            },
            dispatch: DispatchSettings {
                concurrency,
                acquire_timeout: StdDuration::from_millis(acquire_timeout_ms),
            },
            auto_subscribe: parse_bool("MAILWATCH_AUTO_SUBSCRIBE", read("MAILWATCH_AUTO_SUBSCRIBE"), true)?,
        })
    }

    pub fn default_resource(&self) -> Option<String> {
        self.user_id
            .as_deref()
            .map(|user| format!("/users/{user}/mailFolders('Inbox')/messages"))
    }

    pub fn resolved_token_url(&self) -> Option<String> {
        self.token_url.clone().or_else(|| {
            self.credentials.as_ref().map(|credentials| {
                format!(
                    "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
                    credentials.tenant_id
                )
            })
        })
    }
}

fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_or<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|error: T::Err| invalid(key, &value, error.to_string())),
        None => Ok(default),
    }
}

fn positive<T>(key: &'static str, value: T) -> Result<(), ConfigError>
where
    T: PartialOrd + Default + ToString,
{
    if value <= T::default() {
        return Err(invalid(key, &value.to_string(), "must be greater than zero"));
    }
    Ok(())
}

fn seconds(key: &'static str, secs: i64) -> Result<Duration, ConfigError> {
    Duration::try_seconds(secs).ok_or_else(|| invalid(key, &secs.to_string(), "out of range"))
}

fn parse_bool(key: &'static str, raw: Option<String>, default: bool) -> Result<bool, ConfigError> {
    let Some(value) = raw else {
        return Ok(default);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, &value, "expected a boolean")),
    }
}
