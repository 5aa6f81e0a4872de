//! Process configuration, read once from the environment at startup.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use hrms_auth::ResetPolicy;
use hrms_infra::outbox::{BackoffStrategy, RetryPolicy};
use hrms_infra::{PublishMode, ServiceRole};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BrokerKind {
    Redis,
    Memory,
}

impl FromStr for BrokerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(BrokerKind::Redis),
            "memory" => Ok(BrokerKind::Memory),
            other => Err(format!("expected redis or memory, got {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// `None` runs on the in-memory store.
    pub url: Option<String>,
    pub max_connections: u32,
    pub tx_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub kind: BrokerKind,
    pub url: String,
    /// Topic this service publishes to.
    pub topic: String,
    pub subscribe_topics: Vec<String>,
    pub group_id: String,
    pub consumer_name: String,
    pub poll_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub secret: String,
    pub ttl: chrono::Duration,
}

#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub mode: PublishMode,
    pub outbox_capacity: usize,
    pub retry: RetryPolicy,
    pub relay_poll_interval: Duration,
    pub relay_batch_size: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    pub version_gate: bool,
    pub apply_deletes: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub role: ServiceRole,
    pub bind_addr: SocketAddr,
    pub database: DatabaseConfig,
    pub broker: BrokerConfig,
    pub session: SessionConfig,
    pub reset: ResetPolicy,
    pub publish: PublishConfig,
    pub sync: SyncConfig,
}

/// Reads typed values from a variable source.
struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, var: &'static str) -> Option<String> {
        (self.lookup)(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn required(&self, var: &'static str) -> Result<String, ConfigError> {
        self.raw(var).ok_or(ConfigError::Missing(var))
    }

    fn string_or(&self, var: &'static str, default: &str) -> String {
        self.raw(var).unwrap_or_else(|| default.to_string())
    }

    fn parse_or<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.raw(var) {
            None => Ok(default),
            Some(value) => value.parse::<T>().map_err(|e| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn parse_required<T>(&self, var: &'static str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let value = self.required(var)?;
        value.parse::<T>().map_err(|e| invalid(var, &value, e.to_string()))
    }

    fn millis_or(&self, var: &'static str, default: u64) -> Result<Duration, ConfigError> {
        Ok(Duration::from_millis(self.parse_or(var, default)?))
    }
}

fn invalid(var: &'static str, value: impl ToString, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

impl AppConfig {
    /// Load `.env` (if any), then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|var| vars.get(var).cloned())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let role: ServiceRole = env.parse_required("HRMS_SERVICE_ROLE")?;
        let bind_addr = env.parse_or("HTTP_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?;

        let database = DatabaseConfig {
            url: database_url(&env)?,
            max_connections: env.parse_or("DB_MAX_CONNECTIONS", 10)?,
            tx_timeout: Duration::from_secs(env.parse_or("DB_TX_TIMEOUT_SECS", 10)?),
        };

        let topic = env.string_or("BROKER_TOPIC", "hrms.users");
        let subscribe_topics = match env.raw("BROKER_SUBSCRIBE_TOPICS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
            None => vec![topic.clone()],
        };
        let broker = BrokerConfig {
            kind: env.parse_or("BROKER_KIND", BrokerKind::Memory)?,
            url: env.string_or("BROKER_URL", "redis://127.0.0.1:6379"),
            topic,
            subscribe_topics,
            group_id: env.string_or("BROKER_GROUP_ID", &format!("{}-service", role.as_str())),
            consumer_name: env.string_or("BROKER_CONSUMER_NAME", &format!("{}-1", role.as_str())),
            poll_timeout: env.millis_or("BROKER_POLL_TIMEOUT_MS", 100)?,
        };

        let session_hours: i64 = env.parse_or("SESSION_LOGIN", 24)?;
        if session_hours <= 0 {
            return Err(invalid("SESSION_LOGIN", session_hours, "must be positive"));
        }
        let session = SessionConfig {
            secret: env.required("SECRET_KEY")?,
            ttl: chrono::Duration::hours(session_hours),
        };

        let defaults = ResetPolicy::default();
        let offset_hours: i32 = env.parse_or("RESET_DAY_OFFSET_HOURS", 7)?;
        let mut reset = ResetPolicy::default()
            .with_url_base(env.string_or("URL_RESET_PASSWORD", ""))
            .with_day_offset_hours(offset_hours)
            .map_err(|e| invalid("RESET_DAY_OFFSET_HOURS", offset_hours, e.to_string()))?;
        reset.max_daily_attempts = env.parse_or("RESET_MAX_DAILY_ATTEMPTS", defaults.max_daily_attempts)?;
        reset.ttl = chrono::Duration::minutes(env.parse_or("RESET_TOKEN_TTL_MINUTES", defaults.ttl.num_minutes())?);
        reset.token_len = env.parse_or("RESET_TOKEN_LENGTH", defaults.token_len)?;
        reset.min_password_len = env.parse_or("PASSWORD_MIN_LENGTH", defaults.min_password_len)?;
        if reset.token_len == 0 {
            return Err(invalid("RESET_TOKEN_LENGTH", 0, "must be positive"));
        }

        let retry_defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: env.parse_or("PUBLISH_MAX_ATTEMPTS", retry_defaults.max_attempts)?.max(1),
            base_delay: env.millis_or("PUBLISH_BASE_DELAY_MS", retry_defaults.base_delay.as_millis() as u64)?,
            max_delay: env.millis_or("PUBLISH_MAX_DELAY_MS", retry_defaults.max_delay.as_millis() as u64)?,
            strategy: env.parse_or("PUBLISH_BACKOFF", BackoffStrategy::Exponential)?,
        };
        let publish = PublishConfig {
            mode: env.parse_or("PUBLISH_MODE", PublishMode::Outbox)?,
            outbox_capacity: env.parse_or("OUTBOX_CAPACITY", 10_000)?,
            retry,
            relay_poll_interval: env.millis_or("OUTBOX_POLL_INTERVAL_MS", 200)?,
            relay_batch_size: env.parse_or("OUTBOX_BATCH_SIZE", 32)?,
        };

        let sync = SyncConfig {
            version_gate: env.parse_or("SYNC_VERSION_GATE", true)?,
            apply_deletes: env.parse_or("SYNC_APPLY_DELETES", true)?,
        };

        Ok(Self {
            role,
            bind_addr,
            database,
            broker,
            session,
            reset,
            publish,
            sync,
        })
    }
}

/// `DATABASE_URL`, else assembled from `DB_HOST`/`DB_PORT`/`DB_USER`/`DB_PASSWORD`/`DB_NAME`.
fn database_url<F>(env: &Env<F>) -> Result<Option<String>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = env.raw("DATABASE_URL") {
        return Ok(Some(url));
    }
    let Some(host) = env.raw("DB_HOST") else {
        return Ok(None);
    };
    let port: u16 = env.parse_or("DB_PORT", 5432)?;
    let user = env.required("DB_USER")?;
    let password = env.raw("DB_PASSWORD").unwrap_or_default();
    let name = env.required("DB_NAME")?;
    Ok(Some(format!("postgres://{user}:{password}@{host}:{port}/{name}")))
}
