pub mod config;
pub mod error;
pub mod types;

pub use config::{StoreConfig, MAX_EVENT_TIMEFRAME_HOURS, MIN_MAX_CONNECTIONS};
pub use error::ConfigError;
pub use types::*;
