use chrono::Duration;
use tracing::info;

use crate::error::ConfigError;

const DEFAULT_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_EVENT_TIMEFRAME_HOURS: i64 = 4;

/// A reconciliation pass holds one connection for its scan and needs another
/// for matching.
pub const MIN_MAX_CONNECTIONS: u32 = 2;

/// Upper bound on the event timeframe: one leap year.
pub const MAX_EVENT_TIMEFRAME_HOURS: i64 = 24 * 366;

/// Store configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Symmetric window around an alert's timestamp inside which other
    /// alerts may be considered the same event.
    pub event_timeframe: Duration,
}

impl StoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            event_timeframe: Duration::hours(DEFAULT_EVENT_TIMEFRAME_HOURS),
        }
    }

    /// Values below [`MIN_MAX_CONNECTIONS`] are rejected by [`Self::validate`].
    pub fn with_max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self
    }

    pub fn with_event_timeframe(mut self, timeframe: Duration) -> Self {
        self.event_timeframe = timeframe;
        self
    }

    /// Check the pool size and timeframe bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections < MIN_MAX_CONNECTIONS {
            return Err(ConfigError::Invalid {
                key: "NEWSHOUND_DB_MAX_CONNECTIONS",
                reason: format!(
                    "must be at least {MIN_MAX_CONNECTIONS}, got {}",
                    self.max_connections
                ),
            });
        }
        if self.event_timeframe < Duration::zero()
            || self.event_timeframe > Duration::hours(MAX_EVENT_TIMEFRAME_HOURS)
        {
            return Err(ConfigError::Invalid {
                key: "NEWSHOUND_EVENT_TIMEFRAME_HOURS",
                reason: format!("must be between 0 and {MAX_EVENT_TIMEFRAME_HOURS} hours"),
            });
        }
        Ok(())
    }

    /// Load configuration from the process environment (and `.env`, if present).
    ///
    /// - `DATABASE_URL` (required)
    /// - `NEWSHOUND_DB_MAX_CONNECTIONS` (default 8)
    /// - `NEWSHOUND_EVENT_TIMEFRAME_HOURS` (default 4)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config = Self::from_vars(|key| std::env::var(key).ok())?;
        info!(
            max_connections = config.max_connections,
            event_timeframe_hours = config.event_timeframe.num_hours(),
            "Store config loaded"
        );
        Ok(config)
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = var("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let max_connections = match var("NEWSHOUND_DB_MAX_CONNECTIONS") {
            Some(raw) => raw.trim().parse::<u32>().map_err(|e| ConfigError::Invalid {
                key: "NEWSHOUND_DB_MAX_CONNECTIONS",
                reason: e.to_string(),
            })?,
            None => DEFAULT_MAX_CONNECTIONS,
        };

        let hours = match var("NEWSHOUND_EVENT_TIMEFRAME_HOURS") {
            Some(raw) => raw.trim().parse::<i64>().map_err(|e| ConfigError::Invalid {
                key: "NEWSHOUND_EVENT_TIMEFRAME_HOURS",
                reason: e.to_string(),
            })?,
            None => DEFAULT_EVENT_TIMEFRAME_HOURS,
        };
        let event_timeframe = Duration::try_hours(hours)
            .filter(|_| (0..=MAX_EVENT_TIMEFRAME_HOURS).contains(&hours))
            .ok_or_else(|| ConfigError::Invalid {
                key: "NEWSHOUND_EVENT_TIMEFRAME_HOURS",
                reason: format!("must be between 0 and {MAX_EVENT_TIMEFRAME_HOURS} hours"),
            })?;

        let config = Self {
            database_url,
            max_connections,
            event_timeframe,
        };
        config.validate()?;
        Ok(config)
    }
}
